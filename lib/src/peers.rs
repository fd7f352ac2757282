//! Runtime state for configured neighbor caches.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::acl::{Acls, Action, Entry};
use crate::config::ProxyConfig;
use crate::hier::PeerRelation;
use crate::request::SelectRequest;

/// Per-peer behavior switches, straight from configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerOptions {
    /// Never send ICP/HTCP queries to this peer.
    pub no_query: bool,
    /// Only use this peer when it is measurably the closest parent.
    pub closest_only: bool,
    /// Use this peer when nothing better matched.
    pub default_parent: bool,
    pub round_robin: bool,
    pub weighted_round_robin: bool,
    pub userhash: bool,
    pub sourcehash: bool,
    pub carp: bool,
    /// This peer cannot carry spoofed-source connections.
    pub no_tproxy: bool,
    /// Query with HTCP rather than ICP.
    pub htcp: bool,
}

/// A configured neighbor cache and its runtime state.
#[derive(Debug)]
pub struct Peer {
    pub name: String,
    pub host: String,
    pub http_port: u16,
    pub icp_port: u16,
    pub address: Option<IpAddr>,
    pub kind: PeerRelation,
    pub weight: u32,
    pub basetime: u32,
    pub access: Option<String>,
    pub options: PeerOptions,
    rr_count: AtomicU64,
    last_fail: Mutex<Option<Instant>>,
}

impl Peer {
    pub(crate) fn from_config(config: &crate::config::PeerConfig) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host.clone(),
            http_port: config.http_port,
            icp_port: config.icp_port,
            address: config.address,
            kind: config.kind,
            weight: config.weight.max(1),
            basetime: config.basetime,
            access: config.access.clone(),
            options: config.options.clone(),
            rr_count: AtomicU64::new(0),
            last_fail: Mutex::new(None),
        }
    }

    /// The address ICP/HTCP traffic for this peer uses, when known.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.address
            .map(|address| SocketAddr::new(address, self.icp_port))
    }

    /// Record a failed exchange; the peer is considered dead until
    /// `dead_peer_timeout` elapses.
    pub fn mark_failure(&self) {
        *self.last_fail.lock().unwrap() = Some(Instant::now());
    }

    pub fn mark_alive(&self) {
        *self.last_fail.lock().unwrap() = None;
    }

    pub fn alive(&self, dead_peer_timeout: Duration) -> bool {
        match *self.last_fail.lock().unwrap() {
            Some(at) => at.elapsed() >= dead_peer_timeout,
            None => true,
        }
    }

    pub fn rr_count(&self) -> u64 {
        self.rr_count.load(Ordering::Relaxed)
    }

    pub fn bump_rr(&self) {
        self.rr_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// The configured neighbor set, with the usability checks the selection
/// engine asks of it.
#[derive(Debug)]
pub struct PeerPool {
    peers: Vec<Arc<Peer>>,
    acls: Acls,
    dead_peer_timeout: Duration,
}

impl PeerPool {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            peers: config.peers.iter().map(|p| Arc::new(Peer::from_config(p))).collect(),
            acls: config.acls.clone(),
            dead_peer_timeout: config.dead_peer_timeout,
        }
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Peer>> {
        self.peers.iter().find(|p| p.name == name)
    }

    /// Map a reply's source address back to the peer it came from.
    pub fn which_peer(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers
            .iter()
            .find(|p| p.udp_addr() == Some(addr))
            .cloned()
    }

    /// How the peer relates to us for this request.
    pub fn neighbor_type(&self, peer: &Peer, _request: &SelectRequest) -> PeerRelation {
        peer.kind
    }

    /// Whether policy permits forwarding this request to the peer at all.
    ///
    /// Siblings are skipped once a forwarding loop has been seen; a peer's
    /// `access` acl, when set, must allow the client.
    pub fn peer_allowed_to_use(&self, peer: &Peer, request: &SelectRequest) -> bool {
        if self.neighbor_type(peer, request) == PeerRelation::Sibling && request.flags.loopdetect {
            return false;
        }
        let Some(access) = &peer.access else {
            return true;
        };
        let Some(acl) = self.acls.get_acl(access) else {
            return false;
        };
        let Some(client) = request.client_addr else {
            return false;
        };
        matches!(acl.lookup(client).map(Entry::action), Some(Action::Allow))
    }

    /// Whether the peer can take this request over HTTP right now.
    pub fn peer_http_okay(&self, peer: &Peer, request: &SelectRequest) -> bool {
        self.peer_allowed_to_use(peer, request) && peer.alive(self.dead_peer_timeout)
    }

    fn peer_would_be_pinged(&self, peer: &Peer, request: &SelectRequest) -> bool {
        if peer.options.no_query {
            return false;
        }
        if self.neighbor_type(peer, request) == PeerRelation::Sibling
            && !request.flags.hierarchical
        {
            return false;
        }
        if !peer.alive(self.dead_peer_timeout) {
            return false;
        }
        self.peer_allowed_to_use(peer, request)
    }

    /// The number of neighbors an ICP/HTCP fan-out for this request would
    /// reach.
    pub fn neighbors_count(&self, request: &SelectRequest) -> usize {
        self.peers
            .iter()
            .filter(|p| self.peer_would_be_pinged(p, request))
            .count()
    }
}

/// Cache-digest seam: predicts which neighbor already holds a fresh copy.
pub trait DigestLookup: Send + Sync {
    fn digest_select(&self, pool: &PeerPool, request: &SelectRequest) -> Option<Arc<Peer>>;
}

/// Used when cache digests are not built or not exchanged.
pub struct NoDigests;

impl DigestLookup for NoDigests {
    fn digest_select(&self, _pool: &PeerPool, _request: &SelectRequest) -> Option<Arc<Peer>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pool_from(toml: &str) -> PeerPool {
        let config: ProxyConfig = toml.parse().expect("config parses");
        PeerPool::new(&config)
    }

    const TWO_PEERS: &str = r#"
        [peers.p1]
        host = "10.0.1.1"
        kind = "parent"

        [peers.p2]
        host = "10.0.1.2"
        kind = "sibling"
        no_query = true
    "#;

    #[test]
    fn which_peer_maps_reply_sources() {
        let pool = pool_from(TWO_PEERS);
        let addr = SocketAddr::new(IpAddr::from(Ipv4Addr::new(10, 0, 1, 1)), 3130);
        assert_eq!(pool.which_peer(addr).expect("found").name, "p1");

        let stranger = SocketAddr::new(IpAddr::from(Ipv4Addr::new(10, 9, 9, 9)), 3130);
        assert!(pool.which_peer(stranger).is_none());
    }

    #[test]
    fn ping_fanout_gates() {
        let pool = pool_from(TWO_PEERS);
        let request = SelectRequest::new("origin.example");

        // p2 opts out with no_query.
        assert_eq!(pool.neighbors_count(&request), 1);

        let mut nonhier = SelectRequest::new("origin.example");
        nonhier.flags.hierarchical = false;
        // p1 is a parent and still counts for non-hierarchical requests.
        assert_eq!(pool.neighbors_count(&nonhier), 1);
    }

    #[test]
    fn sibling_skipped_when_looping() {
        let pool = pool_from(
            r#"
            [peers.sib]
            host = "10.0.2.1"
            kind = "sibling"
        "#,
        );
        let mut request = SelectRequest::new("origin.example");
        let sib = pool.get("sib").unwrap().clone();
        assert!(pool.peer_allowed_to_use(&sib, &request));

        request.flags.loopdetect = true;
        assert!(!pool.peer_allowed_to_use(&sib, &request));
    }

    #[test]
    fn dead_peer_revives_after_timeout() {
        let pool = pool_from(TWO_PEERS);
        let p1 = pool.get("p1").unwrap().clone();
        let request = SelectRequest::new("origin.example");

        assert!(pool.peer_http_okay(&p1, &request));
        p1.mark_failure();
        assert!(!pool.peer_http_okay(&p1, &request));
        p1.mark_alive();
        assert!(pool.peer_http_okay(&p1, &request));
    }

    #[test]
    fn access_acl_gates_usage() {
        let pool = pool_from(
            r#"
            [acls]
            lan = [{ prefix = "10.0.0.0/8", action = "allow" }]

            [peers.p1]
            host = "10.0.1.1"
            kind = "parent"
            access = "lan"
        "#,
        );
        let p1 = pool.get("p1").unwrap().clone();

        let mut request = SelectRequest::new("origin.example");
        assert!(!pool.peer_allowed_to_use(&p1, &request));

        request.client_addr = Some(IpAddr::from(Ipv4Addr::new(10, 2, 3, 4)));
        assert!(pool.peer_allowed_to_use(&p1, &request));

        request.client_addr = Some(IpAddr::from(Ipv4Addr::new(192, 168, 0, 1)));
        assert!(!pool.peer_allowed_to_use(&p1, &request));
    }
}
