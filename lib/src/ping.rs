//! The ICP/HTCP query seam.
//!
//! Wire formats live with the protocol clients; the selection engine only
//! dispatches a fan-out and consumes decoded replies.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::hier::PeerRelation;
use crate::peers::Peer;
use crate::request::{CacheEntry, SelectRequest};

/// Decoded ICP opcodes the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcpOpcode {
    Query,
    Hit,
    Miss,
    MissNoFetch,
    /// Dumb-echo probe answer from a mis-addressed peer.
    Decho,
    Denied,
    Invalid,
}

/// An ICP answer from one neighbor.
#[derive(Debug, Clone)]
pub struct IcpReplyInfo {
    pub opcode: IcpOpcode,
    /// (rtt msec, hops) measured by the peer toward the origin, when the
    /// reply carried the source-RTT extension.
    pub src_rtt: Option<(u32, u32)>,
}

/// An HTCP answer from one neighbor.
#[derive(Debug, Clone)]
pub struct HtcpReplyInfo {
    pub hit: bool,
    /// (rtt msec, hops) toward the origin, when present in the reply.
    pub src_rtt: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub enum PingPayload {
    Icp(IcpReplyInfo),
    Htcp(HtcpReplyInfo),
    /// A reply tagged with a protocol this build does not understand.
    Unknown(u8),
}

/// One neighbor's answer to a query fan-out.
#[derive(Debug, Clone)]
pub struct PingReply {
    pub peer: Arc<Peer>,
    pub relation: PeerRelation,
    pub payload: PingPayload,
}

/// The result of dispatching a query fan-out.
#[derive(Debug)]
pub struct PingFanout {
    /// Queries actually written to the wire.
    pub n_sent: usize,
    /// Replies worth waiting for; dead peers are pinged but not counted.
    pub n_replies_expected: usize,
    /// How long replies are worth waiting for.
    pub timeout: Duration,
    pub replies: mpsc::Receiver<PingReply>,
}

impl PingFanout {
    /// A fan-out that reached nobody.
    pub fn empty() -> Self {
        let (_, replies) = mpsc::channel(1);
        Self {
            n_sent: 0,
            n_replies_expected: 0,
            timeout: Duration::ZERO,
            replies,
        }
    }
}

/// Query dispatch seam consulted by the selection engine.
pub trait PingClient: Send + Sync {
    /// Send ICP/HTCP queries for `request` to every eligible neighbor and
    /// return the reply channel.
    fn udp_ping(&self, request: &SelectRequest, entry: &CacheEntry) -> PingFanout;
}

/// Used when no ICP/HTCP sockets are open: every fan-out reaches nobody and
/// selection proceeds without neighbor input.
pub struct PingDisabled;

impl PingClient for PingDisabled {
    fn udp_ping(&self, _request: &SelectRequest, _entry: &CacheEntry) -> PingFanout {
        PingFanout::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_fanout_closes_immediately() {
        let mut fanout = PingFanout::empty();
        assert_eq!(fanout.n_sent, 0);
        assert_eq!(fanout.n_replies_expected, 0);
        assert!(fanout.replies.recv().await.is_none());
    }
}
