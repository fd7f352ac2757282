//! Deterministic parent-choice strategies.
//!
//! Each strategy inspects the configured peers and either names a parent or
//! passes. The engine tries them in a fixed priority order, so a strategy
//! only fires when everything ranked above it passed.

use std::sync::Arc;

use crate::hier::PeerRelation;
use crate::peers::{Peer, PeerPool};
use crate::request::SelectRequest;

/// The parent marked `default`, when one is configured and permitted.
///
/// Aliveness is deliberately not checked: a default parent is the
/// destination of last resort even while it is marked dead.
pub fn default_parent(pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>> {
    pool.peers()
        .iter()
        .find(|p| {
            pool.neighbor_type(p, request) == PeerRelation::Parent
                && p.options.default_parent
                && pool.peer_allowed_to_use(p, request)
        })
        .cloned()
}

/// Hash the authenticated user name over the `userhash` parents.
pub fn userhash_parent(pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>> {
    let login = request.login.as_deref()?;
    weighted_hash_select(pool, request, login, |p| p.options.userhash)
}

/// Hash the client address over the `sourcehash` parents.
pub fn sourcehash_parent(pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>> {
    let client = request.client_addr?;
    weighted_hash_select(pool, request, &client.to_string(), |p| p.options.sourcehash)
}

/// Cache Array Routing Protocol: hash the request URL over the `carp`
/// parents so each URL consistently lands on the same parent.
pub fn carp_parent(pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>> {
    weighted_hash_select(pool, request, &request.url(), |p| p.options.carp)
}

/// Rotate evenly across the `round_robin` parents.
pub fn round_robin_parent(pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>> {
    let choice = pool
        .peers()
        .iter()
        .filter(|p| {
            pool.neighbor_type(p, request) == PeerRelation::Parent
                && p.options.round_robin
                && pool.peer_http_okay(p, request)
        })
        .min_by_key(|p| p.rr_count())
        .cloned();
    if let Some(peer) = &choice {
        peer.bump_rr();
    }
    choice
}

/// Rotate across the `weighted_round_robin` parents, giving a peer with
/// twice the weight twice the traffic.
pub fn weighted_round_robin_parent(
    pool: &PeerPool,
    request: &SelectRequest,
) -> Option<Arc<Peer>> {
    let mut choice: Option<(f64, &Arc<Peer>)> = None;
    for peer in pool.peers() {
        if pool.neighbor_type(peer, request) != PeerRelation::Parent
            || !peer.options.weighted_round_robin
            || !pool.peer_http_okay(peer, request)
        {
            continue;
        }
        let score = peer.rr_count() as f64 / f64::from(peer.weight);
        match choice {
            Some((best, _)) if best <= score => {}
            _ => choice = Some((score, peer)),
        }
    }
    choice.map(|(_, peer)| {
        peer.bump_rr();
        Arc::clone(peer)
    })
}

/// The first configured parent that is usable right now.
pub fn first_up_parent(pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>> {
    pool.peers()
        .iter()
        .find(|p| {
            pool.neighbor_type(p, request) == PeerRelation::Parent
                && pool.peer_http_okay(p, request)
        })
        .cloned()
}

/// The first configured parent policy permits, alive or not. Nothing ranked
/// higher matched, so a dead parent beats no parent.
pub fn any_parent(pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>> {
    pool.peers()
        .iter()
        .find(|p| {
            pool.neighbor_type(p, request) == PeerRelation::Parent
                && pool.peer_allowed_to_use(p, request)
        })
        .cloned()
}

// The hash mixing below matches the classic CARP construction: a rolling
// rotate-add over the key bytes, membership combined per peer, scaled by
// weight.

fn string_hash(s: &str) -> u32 {
    s.bytes().fold(0u32, |hash, byte| {
        hash.wrapping_add(hash.rotate_left(19)).wrapping_add(u32::from(byte))
    })
}

fn combine_hashes(key: u32, peer: u32) -> u32 {
    let mut combined = key ^ peer;
    combined = combined.wrapping_add(combined.wrapping_mul(0x62531965));
    combined.rotate_left(21)
}

fn weighted_hash_select(
    pool: &PeerPool,
    request: &SelectRequest,
    key: &str,
    wants: impl Fn(&Peer) -> bool,
) -> Option<Arc<Peer>> {
    let key_hash = string_hash(key);
    let mut choice: Option<(f64, &Arc<Peer>)> = None;
    for peer in pool.peers() {
        if pool.neighbor_type(peer, request) != PeerRelation::Parent
            || !wants(peer)
            || !pool.peer_http_okay(peer, request)
        {
            continue;
        }
        let combined = combine_hashes(key_hash, string_hash(&peer.name));
        let score = f64::from(combined) * f64::from(peer.weight);
        match choice {
            Some((best, _)) if best >= score => {}
            _ => choice = Some((score, peer)),
        }
    }
    choice.map(|(_, peer)| Arc::clone(peer))
}
