//! Tags describing why and how a destination was chosen.

use std::fmt;

/// The reason a destination was placed on the forwarding list.
///
/// One of these is attached to every selected destination and ends up in the
/// access log, so the `Display` form uses the conventional uppercase tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierCode {
    None,
    /// The request is affined to a previously pinned connection.
    Pinned,
    /// A cache digest predicted a hit at a parent.
    CdParentHit,
    /// A cache digest predicted a hit at a sibling.
    CdSiblingHit,
    /// The measurement database picked the lowest-RTT parent.
    ClosestParent,
    /// A parent answered MISS with the lowest measured RTT.
    ClosestParentMiss,
    /// A parent answered MISS first (weighted by option settings).
    FirstParentMiss,
    ParentHit,
    SiblingHit,
    /// The origin is measurably closer than any parent that answered.
    ClosestDirect,
    /// Plain origin-server destination.
    Direct,
    DefaultParent,
    UserhashParent,
    SourcehashParent,
    Carp,
    RoundRobinParent,
    FirstUpParent,
    /// Last-resort parent, chosen with no better reason available.
    AnyOldParent,
}

impl fmt::Display for HierCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HierCode::None => "HIER_NONE",
            HierCode::Pinned => "PINNED",
            HierCode::CdParentHit => "CD_PARENT_HIT",
            HierCode::CdSiblingHit => "CD_SIBLING_HIT",
            HierCode::ClosestParent => "CLOSEST_PARENT",
            HierCode::ClosestParentMiss => "CLOSEST_PARENT_MISS",
            HierCode::FirstParentMiss => "FIRST_PARENT_MISS",
            HierCode::ParentHit => "PARENT_HIT",
            HierCode::SiblingHit => "SIBLING_HIT",
            HierCode::ClosestDirect => "CLOSEST_DIRECT",
            HierCode::Direct => "HIER_DIRECT",
            HierCode::DefaultParent => "DEFAULT_PARENT",
            HierCode::UserhashParent => "USERHASH_PARENT",
            HierCode::SourcehashParent => "SOURCEHASH_PARENT",
            HierCode::Carp => "CARP",
            HierCode::RoundRobinParent => "ROUNDROBIN_PARENT",
            HierCode::FirstUpParent => "FIRSTUP_PARENT",
            HierCode::AnyOldParent => "ANY_OLD_PARENT",
        };
        f.write_str(s)
    }
}

/// Whether the origin server may, must, or must not be contacted directly.
///
/// Computed once per selection; `Unknown` only exists before the arbiter has
/// run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direct {
    Unknown,
    No,
    Maybe,
    Yes,
}

impl fmt::Display for Direct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direct::Unknown => "DIRECT_UNKNOWN",
            Direct::No => "DIRECT_NO",
            Direct::Maybe => "DIRECT_MAYBE",
            Direct::Yes => "DIRECT_YES",
        };
        f.write_str(s)
    }
}

/// How a peer relates to us for a given request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRelation {
    None,
    /// MISSes may be forwarded to this peer.
    Parent,
    /// Queried for HITs only.
    Sibling,
}

/// Progress of the ICP/HTCP query phase for a cache entry.
///
/// Transitions are None -> Waiting -> Done, or None -> Done when no queries
/// are sent. An entry is never left in `Waiting` once its selection finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    None,
    Waiting,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hier_codes_render_as_log_tokens() {
        assert_eq!(HierCode::Direct.to_string(), "HIER_DIRECT");
        assert_eq!(HierCode::ClosestParentMiss.to_string(), "CLOSEST_PARENT_MISS");
        assert_eq!(HierCode::Carp.to_string(), "CARP");
        assert_eq!(HierCode::AnyOldParent.to_string(), "ANY_OLD_PARENT");
    }

    #[test]
    fn direct_renders_as_log_tokens() {
        assert_eq!(Direct::Unknown.to_string(), "DIRECT_UNKNOWN");
        assert_eq!(Direct::Maybe.to_string(), "DIRECT_MAYBE");
    }
}
