//! Round-trip-time and hop-count estimates for origin hosts and peers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::trace;

use crate::hier::PeerRelation;
use crate::peers::{Peer, PeerPool};
use crate::request::SelectRequest;

/// A recorded measurement toward a host, in milliseconds and hops.
#[derive(Debug, Clone, Copy, Default)]
pub struct Measurement {
    pub rtt: u32,
    pub hops: u32,
}

/// Measurement database seam consulted by the selection engine.
///
/// A return of `0` from the lookup methods means "no measurement". When the
/// database is disabled all lookups degrade to unknown and the engine makes
/// no topology-based decisions.
pub trait NetDb: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    /// Measured RTT from us to the given host, or 0 when unknown.
    fn host_rtt(&self, host: &str) -> u32;

    /// Measured hop count from us to the given host, or 0 when unknown.
    fn host_hops(&self, host: &str) -> u32;

    /// The usable parent with the lowest recorded RTT toward the request's
    /// host, if any measurement exists.
    fn closest_parent(&self, pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>>;

    /// Fold an RTT hint reported by a peer into the database.
    fn update_peer(&self, request: &SelectRequest, peer: &Peer, rtt: u32, hops: u32);
}

/// In-memory measurement database, populated from ICMP probes at startup and
/// from RTT hints carried in ICP/HTCP replies.
#[derive(Debug, Default)]
pub struct IcmpNetDb {
    hosts: RwLock<HashMap<String, Measurement>>,
    // Keyed by (destination host, peer name): the RTT the peer reported
    // toward that destination.
    routes: RwLock<HashMap<(String, String), Measurement>>,
}

impl IcmpNetDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a direct measurement toward a host.
    pub fn note_host(&self, host: &str, rtt: u32, hops: u32) {
        self.hosts
            .write()
            .unwrap()
            .insert(host.to_string(), Measurement { rtt, hops });
    }
}

impl NetDb for IcmpNetDb {
    fn host_rtt(&self, host: &str) -> u32 {
        self.hosts.read().unwrap().get(host).map_or(0, |m| m.rtt)
    }

    fn host_hops(&self, host: &str) -> u32 {
        self.hosts.read().unwrap().get(host).map_or(0, |m| m.hops)
    }

    fn closest_parent(&self, pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>> {
        let routes = self.routes.read().unwrap();
        let mut best: Option<(u32, Arc<Peer>)> = None;
        for ((host, peer_name), measurement) in routes.iter() {
            if host != &request.host || measurement.rtt == 0 {
                continue;
            }
            let Some(peer) = pool.get(peer_name) else {
                continue;
            };
            if pool.neighbor_type(peer, request) != PeerRelation::Parent {
                continue;
            }
            if !pool.peer_http_okay(peer, request) {
                continue;
            }
            match best {
                Some((rtt, _)) if rtt <= measurement.rtt => {}
                _ => best = Some((measurement.rtt, Arc::clone(peer))),
            }
        }
        best.map(|(rtt, peer)| {
            trace!("closest parent for {} is {} ({} msec)", request.host, peer.name, rtt);
            peer
        })
    }

    fn update_peer(&self, request: &SelectRequest, peer: &Peer, rtt: u32, hops: u32) {
        trace!(
            "netdb update: {} via {}: rtt {} msec, {} hops",
            request.host,
            peer.name,
            rtt,
            hops
        );
        self.routes
            .write()
            .unwrap()
            .insert((request.host.clone(), peer.name.clone()), Measurement { rtt, hops });
    }
}

/// The degraded database used when ICMP measurement support is absent.
pub struct NetDbDisabled;

impl NetDb for NetDbDisabled {
    fn enabled(&self) -> bool {
        false
    }

    fn host_rtt(&self, _host: &str) -> u32 {
        0
    }

    fn host_hops(&self, _host: &str) -> u32 {
        0
    }

    fn closest_parent(&self, _pool: &PeerPool, _request: &SelectRequest) -> Option<Arc<Peer>> {
        None
    }

    fn update_peer(&self, _request: &SelectRequest, _peer: &Peer, _rtt: u32, _hops: u32) {}
}
