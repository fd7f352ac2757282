//! Destination selection.
//!
//! One [`SelectionTask`] runs per request. It decides whether the origin may
//! be contacted directly, consults pinned connections, queries neighbor
//! caches over ICP/HTCP, falls back through the parent strategies, and
//! finally resolves the surviving candidates into concrete socket addresses
//! for the forwarding layer.

pub mod strategies;

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::acl::{AclChecker, ConfiguredAcls};
use crate::config::ProxyConfig;
use crate::dns::{DnsResolver, ResolvedAddrs, SystemResolver};
use crate::hier::{Direct, HierCode, PeerRelation, PingStatus};
use crate::netdb::{NetDb, NetDbDisabled};
use crate::peers::{DigestLookup, NoDigests, Peer, PeerPool};
use crate::ping::{IcpOpcode, PingClient, PingDisabled, PingPayload, PingReply};
use crate::request::{CacheEntry, PingStats, SelectRequest};

/// Process-wide selection counters.
#[derive(Debug)]
pub struct SelectStats {
    pub ping_timeouts: AtomicU64,
}

static STATS: SelectStats = SelectStats {
    ping_timeouts: AtomicU64::new(0),
};

pub fn stats() -> &'static SelectStats {
    &STATS
}

/// A concrete place the request can be forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub remote: SocketAddr,
    pub code: HierCode,
    /// Source address to bind, when configuration names one.
    pub local: Option<IpAddr>,
}

/// A queued (peer, reason) pair awaiting resolution into addresses.
///
/// `peer` of `None` stands for the origin server. The queue preserves
/// insertion order, and the same peer may appear more than once.
#[derive(Debug, Clone)]
struct Candidate {
    peer: Option<Arc<Peer>>,
    code: HierCode,
}

/// Builds and launches selections against one configuration and one set of
/// collaborators. Cheap to clone; every selection task carries a clone.
#[derive(Clone)]
pub struct PeerSelector {
    config: Arc<ProxyConfig>,
    pool: Arc<PeerPool>,
    acls: Arc<dyn AclChecker>,
    dns: Arc<dyn DnsResolver>,
    netdb: Arc<dyn NetDb>,
    ping: Arc<dyn PingClient>,
    digests: Arc<dyn DigestLookup>,
}

impl PeerSelector {
    /// A selector over the given configuration, with every optional
    /// subsystem absent: system DNS, no ICP/HTCP sockets, no measurement
    /// database, no digests.
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        let pool = Arc::new(PeerPool::new(&config));
        let acls = Arc::new(ConfiguredAcls::new(config.acls.clone()));
        Self {
            config,
            pool,
            acls,
            dns: Arc::new(SystemResolver),
            netdb: Arc::new(NetDbDisabled),
            ping: Arc::new(PingDisabled),
            digests: Arc::new(NoDigests),
        }
    }

    pub fn pool(&self) -> &Arc<PeerPool> {
        &self.pool
    }

    pub fn with_acls(mut self, acls: Arc<dyn AclChecker>) -> Self {
        self.acls = acls;
        self
    }

    pub fn with_dns(mut self, dns: Arc<dyn DnsResolver>) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_netdb(mut self, netdb: Arc<dyn NetDb>) -> Self {
        self.netdb = netdb;
        self
    }

    pub fn with_ping(mut self, ping: Arc<dyn PingClient>) -> Self {
        self.ping = ping;
        self
    }

    pub fn with_digests(mut self, digests: Arc<dyn DigestLookup>) -> Self {
        self.digests = digests;
        self
    }

    /// Launch a selection. The ordered destination list arrives on the
    /// returned channel exactly once; an empty list means no viable
    /// destination exists. Dropping the receiver cancels the selection at
    /// its next suspension point.
    pub fn spawn_select(
        &self,
        request: Arc<SelectRequest>,
        entry: Option<Arc<CacheEntry>>,
    ) -> oneshot::Receiver<Vec<Destination>> {
        let (sender, receiver) = oneshot::channel();
        let task = SelectionTask::new(self.clone(), request, entry, sender);
        tokio::spawn(task.run());
        receiver
    }

    /// Run a selection to completion.
    pub async fn select(
        &self,
        request: Arc<SelectRequest>,
        entry: Option<Arc<CacheEntry>>,
    ) -> Vec<Destination> {
        self.spawn_select(request, entry).await.unwrap_or_default()
    }
}

/// All the state of one in-flight selection.
struct SelectionTask {
    sel: PeerSelector,
    request: Arc<SelectRequest>,
    entry: Option<Arc<CacheEntry>>,
    reply: Option<oneshot::Sender<Vec<Destination>>>,
    paths: Vec<Destination>,
    servers: VecDeque<Candidate>,
    /// Verdicts of the always_direct / never_direct acls; `None` until the
    /// acl has been consulted.
    always_direct: Option<bool>,
    never_direct: Option<bool>,
    direct: Direct,
    hit: Option<Arc<Peer>>,
    hit_relation: PeerRelation,
    closest_parent_miss: Option<SocketAddr>,
    first_parent_miss: Option<SocketAddr>,
    ping: PingStats,
}

impl SelectionTask {
    fn new(
        sel: PeerSelector,
        request: Arc<SelectRequest>,
        entry: Option<Arc<CacheEntry>>,
        reply: oneshot::Sender<Vec<Destination>>,
    ) -> Self {
        Self {
            sel,
            request,
            entry,
            reply: Some(reply),
            paths: Vec::new(),
            servers: VecDeque::new(),
            always_direct: None,
            never_direct: None,
            direct: Direct::Unknown,
            hit: None,
            hit_relation: PeerRelation::None,
            closest_parent_miss: None,
            first_parent_miss: None,
            ping: PingStats::default(),
        }
    }

    /// The caller abandoned the selection when its receiver went away.
    fn cancelled(&self) -> bool {
        self.reply.as_ref().map_or(true, oneshot::Sender::is_closed)
    }

    async fn run(mut self) {
        match &self.entry {
            Some(entry) => debug!("selecting peers for '{}'", entry.url()),
            None => debug!("selecting peers for '{} {}'", self.request.method, self.request.url()),
        }

        if !self.decide_direct().await {
            return;
        }

        if self
            .entry
            .as_ref()
            .map_or(true, |e| e.ping_status() == PingStatus::None)
        {
            self.select_pinned();
        }

        if let Some(entry) = self.entry.clone() {
            if entry.ping_status() == PingStatus::None {
                if !self.query_neighbors(&entry).await {
                    return;
                }
            }
        }

        match self.direct {
            Direct::Yes => self.add_direct(),
            Direct::No => {
                self.pick_parent();
                self.add_all_parents();
            }
            _ => {
                if self.sel.config.prefer_direct {
                    self.add_direct();
                }
                if self.request.flags.hierarchical || !self.sel.config.nonhierarchical_direct {
                    self.pick_parent();
                }
                if !self.sel.config.prefer_direct {
                    self.add_direct();
                }
            }
        }

        self.resolve_paths().await;
    }

    /// Decide whether the origin may, must, or must not be contacted.
    ///
    /// Settled at most once per selection; re-entering after the decision is
    /// a no-op. Returns false when the caller went away while an acl check
    /// was outstanding.
    async fn decide_direct(&mut self) -> bool {
        let config = Arc::clone(&self.sel.config);
        while self.direct == Direct::Unknown {
            if let (None, Some(name)) = (self.always_direct, config.always_direct.as_deref()) {
                let answer = self
                    .sel
                    .acls
                    .non_blocking_check(name, &self.request)
                    .wait()
                    .await;
                if self.cancelled() {
                    return false;
                }
                trace!("always_direct check: {:?}", answer);
                self.always_direct = Some(answer.allowed());
            } else if self.always_direct == Some(true) {
                self.direct = Direct::Yes;
            } else if let (None, Some(name)) = (self.never_direct, config.never_direct.as_deref())
            {
                let answer = self
                    .sel
                    .acls
                    .non_blocking_check(name, &self.request)
                    .wait()
                    .await;
                if self.cancelled() {
                    return false;
                }
                trace!("never_direct check: {:?}", answer);
                self.never_direct = Some(answer.allowed());
            } else if self.never_direct == Some(true) {
                self.direct = Direct::No;
            } else if self.request.flags.no_direct {
                // Accelerated requests have no origin of their own.
                self.direct = Direct::No;
            } else if self.request.flags.loopdetect {
                // Bypassing the neighbors is the only way out of a loop.
                self.direct = Direct::Yes;
            } else if self.check_netdb_direct() {
                self.direct = Direct::Yes;
            } else {
                self.direct = Direct::Maybe;
            }
        }
        debug!("direct = {}", self.direct);
        true
    }

    /// Prefer a validated pinned connection over everything else.
    fn select_pinned(&mut self) {
        let Some(pinned) = &self.request.pinned else {
            return;
        };
        if !pinned.validated {
            return;
        }
        match &pinned.peer {
            Some(name) => {
                let Some(peer) = self.sel.pool.get(name).cloned() else {
                    warn!("request pinned to unknown peer '{}'", name);
                    return;
                };
                if self.sel.pool.peer_allowed_to_use(&peer, &self.request) {
                    self.add_candidate(Some(peer), HierCode::Pinned);
                    if let Some(entry) = &self.entry {
                        entry.set_ping_status(PingStatus::Done); // skip ICP
                    }
                }
            }
            None if self.direct != Direct::No => {
                self.add_candidate(None, HierCode::Pinned);
                if let Some(entry) = &self.entry {
                    entry.set_ping_status(PingStatus::Done); // skip ICP
                }
            }
            None => {}
        }
    }

    /// How many neighbors an ICP/HTCP fan-out would be worth sending to.
    fn icp_ping_candidates(&self, entry: &CacheEntry) -> usize {
        if !self.request.flags.hierarchical && self.direct != Direct::No {
            return 0;
        }
        if entry.private_key()
            && !self.sel.config.neighbors_do_private_keys
            && self.direct != Direct::No
        {
            return 0;
        }
        let n = self.sel.pool.neighbors_count(&self.request);
        debug!("counted {} eligible neighbors", n);
        n
    }

    /// Pick a neighbor via digests, measured closeness, or a live ICP/HTCP
    /// query round. Returns false when the caller went away mid-wait.
    async fn query_neighbors(&mut self, entry: &Arc<CacheEntry>) -> bool {
        debug_assert_eq!(entry.ping_status(), PingStatus::None);
        if self.direct == Direct::Yes {
            entry.set_ping_status(PingStatus::Done);
            return true;
        }

        let mut choice = None;
        if let Some(peer) = self.sel.digests.digest_select(&self.sel.pool, &self.request) {
            let code = if self.sel.pool.neighbor_type(&peer, &self.request) == PeerRelation::Parent
            {
                HierCode::CdParentHit
            } else {
                HierCode::CdSiblingHit
            };
            choice = Some((peer, code));
        } else if let Some(peer) = self.sel.netdb.closest_parent(&self.sel.pool, &self.request) {
            choice = Some((peer, HierCode::ClosestParent));
        } else if self.icp_ping_candidates(entry) > 0 {
            debug!("querying neighbors for {}", entry.url());
            self.ping.start = Some(Instant::now());
            let fanout = self.sel.ping.udp_ping(&self.request, entry);
            self.ping.n_sent = fanout.n_sent;
            self.ping.n_replies_expected = fanout.n_replies_expected;
            self.ping.timeout = fanout.timeout.max(Duration::from_millis(1));
            if fanout.n_sent == 0 {
                warn!("neighbor query fan-out reached no peers");
            }
            debug!(
                "{} replies expected, timeout {} msec",
                self.ping.n_replies_expected,
                self.ping.timeout.as_millis()
            );

            if self.ping.n_replies_expected > 0 {
                entry.set_ping_status(PingStatus::Waiting);
                if !self.wait_for_replies(fanout.replies).await {
                    return false;
                }
                self.neighbor_replies();
                entry.set_ping_status(PingStatus::Done);
                return true;
            }
        }

        if let Some((peer, code)) = choice {
            debug!("{}/{}", code, peer.name);
            self.add_candidate(Some(peer), code);
        }
        entry.set_ping_status(PingStatus::Done);
        true
    }

    /// Collect replies until a HIT arrives, the expected quorum is reached,
    /// or the timer fires. Returns false when the caller went away.
    async fn wait_for_replies(&mut self, mut replies: mpsc::Receiver<PingReply>) -> bool {
        let deadline = tokio::time::sleep(self.ping.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    if self.cancelled() {
                        return false;
                    }
                    self.note_ping_timeout();
                    return true;
                }
                reply = replies.recv() => {
                    if self.cancelled() {
                        return false;
                    }
                    match reply {
                        Some(reply) => {
                            if self.handle_ping_reply(reply) {
                                return true;
                            }
                        }
                        None => {
                            // The query subsystem hung up; nothing further
                            // can arrive, so only the timer remains.
                            deadline.as_mut().await;
                            if self.cancelled() {
                                return false;
                            }
                            self.note_ping_timeout();
                            return true;
                        }
                    }
                }
            }
        }
    }

    fn note_ping_timeout(&mut self) {
        stats().ping_timeouts.fetch_add(1, Ordering::Relaxed);
        self.ping.timedout = true;
        debug!(
            "neighbor query timeout after {} of {} replies",
            self.ping.n_recv, self.ping.n_replies_expected
        );
    }

    /// Fold one reply into the aggregate. Returns true once the round is
    /// decided: a HIT always ends it, otherwise the expected quorum does.
    fn handle_ping_reply(&mut self, reply: PingReply) -> bool {
        match reply.payload {
            PingPayload::Icp(info) => {
                debug!("ICP {:?} from {}", info.opcode, reply.peer.name);
                self.ping.n_recv += 1;
                match info.opcode {
                    IcpOpcode::Hit => {
                        self.hit = Some(reply.peer);
                        self.hit_relation = reply.relation;
                        return true;
                    }
                    IcpOpcode::Miss | IcpOpcode::Decho => {
                        if reply.relation == PeerRelation::Parent {
                            self.parent_miss(&reply.peer, info.src_rtt);
                        }
                    }
                    _ => {}
                }
            }
            PingPayload::Htcp(info) => {
                debug!(
                    "HTCP {} from {}",
                    if info.hit { "HIT" } else { "MISS" },
                    reply.peer.name
                );
                self.ping.n_recv += 1;
                if info.hit {
                    self.hit = Some(reply.peer);
                    self.hit_relation = reply.relation;
                    return true;
                }
                if reply.relation == PeerRelation::Parent {
                    self.parent_miss(&reply.peer, info.src_rtt);
                }
            }
            PingPayload::Unknown(proto) => {
                warn!(
                    "ignoring reply with unknown ping protocol {} from {}",
                    proto, reply.peer.name
                );
            }
        }
        self.ping.n_recv >= self.ping.n_replies_expected
    }

    /// Track the best MISS seen so far from a parent.
    fn parent_miss(&mut self, peer: &Arc<Peer>, src_rtt: Option<(u32, u32)>) {
        if let Some((rtt, hops)) = src_rtt {
            if self.sel.config.query_icmp && self.sel.netdb.enabled() && rtt > 0 && rtt < 0xFFFF {
                self.sel.netdb.update_peer(&self.request, peer, rtt, hops);
            }
            if rtt > 0 && (self.ping.p_rtt == 0 || rtt < self.ping.p_rtt) {
                if let Some(addr) = peer.udp_addr() {
                    self.closest_parent_miss = Some(addr);
                    self.ping.p_rtt = rtt;
                }
            }
        }

        // closest-only peers never become the first miss.
        if peer.options.closest_only {
            return;
        }

        // The first miss only matters while no closest parent is known.
        if self.closest_parent_miss.is_some() {
            return;
        }

        let elapsed = self
            .ping
            .start
            .map_or(0, |start| start.elapsed().as_millis() as i64);
        let weighted = ((elapsed - i64::from(peer.basetime)) / i64::from(peer.weight)).max(1);
        if self.first_parent_miss.is_none() || weighted < self.ping.w_rtt {
            if let Some(addr) = peer.udp_addr() {
                self.first_parent_miss = Some(addr);
                self.ping.w_rtt = weighted;
            }
        }
    }

    /// Turn the aggregated replies into at most one candidate.
    fn neighbor_replies(&mut self) {
        debug_assert_ne!(self.direct, Direct::Yes);

        if self.check_netdb_direct() {
            debug!("{}/{}", HierCode::ClosestDirect, self.request.host);
            self.add_candidate(None, HierCode::ClosestDirect);
            return;
        }

        let (peer, code) = if let Some(hit) = self.hit.take() {
            let code = if self.hit_relation == PeerRelation::Parent {
                HierCode::ParentHit
            } else {
                HierCode::SiblingHit
            };
            (Some(hit), code)
        } else if let Some(addr) = self.closest_parent_miss {
            (self.sel.pool.which_peer(addr), HierCode::ClosestParentMiss)
        } else if let Some(addr) = self.first_parent_miss {
            (self.sel.pool.which_peer(addr), HierCode::FirstParentMiss)
        } else {
            (None, HierCode::None)
        };

        if let Some(peer) = peer {
            if code != HierCode::None {
                debug!("{}/{}", code, peer.name);
                self.add_candidate(Some(peer), code);
            }
        }
    }

    /// Whether measurements say the origin is close enough to skip the
    /// hierarchy entirely.
    fn check_netdb_direct(&self) -> bool {
        if !self.sel.netdb.enabled() {
            return false;
        }
        if self.direct == Direct::No {
            return false;
        }

        let my_rtt = self.sel.netdb.host_rtt(&self.request.host);
        trace!(
            "origin rtt {} msec, minimum_direct_rtt {} msec",
            my_rtt,
            self.sel.config.minimum_direct_rtt
        );
        if my_rtt != 0 && my_rtt <= self.sel.config.minimum_direct_rtt {
            return true;
        }

        let my_hops = self.sel.netdb.host_hops(&self.request.host);
        trace!(
            "origin hops {}, minimum_direct_hops {}",
            my_hops,
            self.sel.config.minimum_direct_hops
        );
        if my_hops != 0 && my_hops <= self.sel.config.minimum_direct_hops {
            return true;
        }

        let Some(addr) = self.closest_parent_miss else {
            return false;
        };
        if self.sel.pool.which_peer(addr).is_none() {
            return false;
        }
        trace!("closest parent miss rtt {} msec", self.ping.p_rtt);
        my_rtt != 0 && my_rtt <= self.ping.p_rtt
    }

    /// Try the parent strategies in priority order; the first match queues
    /// exactly one candidate.
    fn pick_parent(&mut self) {
        if self.direct == Direct::Yes {
            return;
        }
        debug!(
            "choosing a parent for '{} {}'",
            self.request.method, self.request.host
        );

        type Strategy = fn(&PeerPool, &SelectRequest) -> Option<Arc<Peer>>;
        const CHAIN: [(Strategy, HierCode); 8] = [
            (strategies::default_parent, HierCode::DefaultParent),
            (strategies::userhash_parent, HierCode::UserhashParent),
            (strategies::sourcehash_parent, HierCode::SourcehashParent),
            (strategies::carp_parent, HierCode::Carp),
            (strategies::round_robin_parent, HierCode::RoundRobinParent),
            (
                strategies::weighted_round_robin_parent,
                HierCode::RoundRobinParent,
            ),
            (strategies::first_up_parent, HierCode::FirstUpParent),
            (strategies::any_parent, HierCode::AnyOldParent),
        ];

        for (pick, code) in CHAIN {
            if let Some(peer) = pick(&self.sel.pool, &self.request) {
                debug!("{}/{}", code, peer.name);
                self.add_candidate(Some(peer), code);
                return;
            }
        }
    }

    /// Queue every usable parent. Last resort on the never-direct path, so a
    /// request with no better candidates still has somewhere to go.
    fn add_all_parents(&mut self) {
        let pool = Arc::clone(&self.sel.pool);
        for peer in pool.peers() {
            if pool.neighbor_type(peer, &self.request) != PeerRelation::Parent {
                continue;
            }
            if !pool.peer_http_okay(peer, &self.request) {
                continue;
            }
            debug!("adding alive parent {}", peer.name);
            self.add_candidate(Some(Arc::clone(peer)), HierCode::AnyOldParent);
        }

        // A default parent closes the list, dead or not.
        if let Some(peer) = strategies::default_parent(&pool, &self.request) {
            self.add_candidate(Some(peer), HierCode::DefaultParent);
        }
    }

    /// Queue the origin server, unless policy or protocol forbids it.
    fn add_direct(&mut self) {
        if self.direct == Direct::No {
            return;
        }
        // WAIS is relayed through a parent, never spoken natively.
        if self.request.scheme.as_str().eq_ignore_ascii_case("wais") {
            return;
        }
        self.add_candidate(None, HierCode::Direct);
    }

    fn add_candidate(&mut self, peer: Option<Arc<Peer>>, code: HierCode) {
        trace!(
            "queueing {} {}",
            peer.as_ref().map_or("DIRECT", |p| p.name.as_str()),
            code
        );
        self.servers.push_back(Candidate { peer, code });
    }

    /// Resolve the queued candidates into addresses, in order, until the
    /// queue runs dry or the destination cap is reached, then hand the
    /// result to the caller.
    async fn resolve_paths(&mut self) {
        while self.paths.len() < self.sel.config.forward_max_tries {
            let Some(candidate) = self.servers.pop_front() else {
                break;
            };
            let host = candidate
                .peer
                .as_ref()
                .map_or_else(|| self.request.host.clone(), |p| p.host.clone());
            debug!("finding IP destinations for '{}' via {}", self.request.url(), host);

            let result = self.sel.dns.lookup(&host).wait().await;
            if self.cancelled() {
                return;
            }
            match result {
                Ok(ia) => self.add_addresses(&candidate, &ia),
                Err(err) => debug!("unknown host: {} ({})", host, err),
            }
        }
        self.deliver();
    }

    fn add_addresses(&mut self, candidate: &Candidate, ia: &ResolvedAddrs) {
        for addr in ia.iter_rotated() {
            if self.paths.len() >= self.sel.config.forward_max_tries {
                break;
            }

            // A spoofed-source link can only carry the client's address
            // family, unless the peer opts out of spoofing.
            if self.request.flags.spoof_client_ip
                && !candidate.peer.as_ref().is_some_and(|p| p.options.no_tproxy)
            {
                if let Some(client) = self.request.client_addr {
                    if addr.is_ipv4() != client.is_ipv4() {
                        continue;
                    }
                }
            }

            let port = candidate
                .peer
                .as_ref()
                .map_or(self.request.port, |p| p.http_port);
            self.paths.push(Destination {
                remote: SocketAddr::new(addr, port),
                code: candidate.code,
                local: self.sel.config.outgoing_address(&addr),
            });
        }
    }

    /// Hand the destinations to the caller and leave the diagnostic trail on
    /// the request. Runs exactly once per selection.
    fn deliver(&mut self) {
        if self.paths.is_empty() {
            warn!("failed to select source for '{}'", self.request.url());
            warn!("  always_direct = {:?}", self.always_direct);
            warn!("   never_direct = {:?}", self.never_direct);
            warn!("       timedout = {}", self.ping.timedout);
        } else {
            debug!(
                "found {} IP destinations for '{}'",
                self.paths.len(),
                self.request.url()
            );
        }

        self.ping.stop = Some(Instant::now());
        self.request.note_ping(self.ping.clone());

        if let Some(sender) = self.reply.take() {
            // A closed receiver just means nobody wants the answer anymore.
            let _ = sender.send(std::mem::take(&mut self.paths));
        }
    }
}

impl Drop for SelectionTask {
    fn drop(&mut self) {
        // However the task ends, the entry must not be left awaiting replies.
        if let Some(entry) = &self.entry {
            entry.set_ping_status(PingStatus::Done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ping::IcpReplyInfo;

    fn task_for(toml: &str, request: SelectRequest) -> SelectionTask {
        let config: Arc<ProxyConfig> = Arc::new(toml.parse().expect("config parses"));
        let sel = PeerSelector::new(config);
        let (sender, receiver) = oneshot::channel();
        // Keep the caller "present" for the lifetime of the test.
        std::mem::forget(receiver);
        SelectionTask::new(sel, Arc::new(request), None, sender)
    }

    fn miss_from(task: &mut SelectionTask, peer: &str, rtt: Option<(u32, u32)>) {
        let peer = task.sel.pool.get(peer).unwrap().clone();
        task.handle_ping_reply(PingReply {
            peer,
            relation: PeerRelation::Parent,
            payload: PingPayload::Icp(IcpReplyInfo {
                opcode: IcpOpcode::Miss,
                src_rtt: rtt,
            }),
        });
    }

    const PARENT_PAIR: &str = r#"
        [peers.p1]
        host = "10.0.1.1"
        kind = "parent"

        [peers.p2]
        host = "10.0.1.2"
        kind = "parent"
    "#;

    #[tokio::test]
    async fn arbiter_follows_request_flags() {
        let mut request = SelectRequest::new("origin.example");
        request.flags.no_direct = true;
        let mut task = task_for("", request);
        assert!(task.decide_direct().await);
        assert_eq!(task.direct, Direct::No);

        let mut request = SelectRequest::new("origin.example");
        request.flags.loopdetect = true;
        let mut task = task_for("", request);
        assert!(task.decide_direct().await);
        assert_eq!(task.direct, Direct::Yes);

        let mut task = task_for("", SelectRequest::new("origin.example"));
        assert!(task.decide_direct().await);
        assert_eq!(task.direct, Direct::Maybe);
    }

    #[tokio::test]
    async fn arbiter_is_idempotent() {
        let mut request = SelectRequest::new("origin.example");
        request.flags.no_direct = true;
        let mut task = task_for("", request);
        task.direct = Direct::Maybe;
        assert!(task.decide_direct().await);
        // Already decided; the no_direct flag no longer matters.
        assert_eq!(task.direct, Direct::Maybe);
    }

    #[test]
    fn closest_miss_takes_lowest_rtt_and_first_wins_ties() {
        let mut task = task_for(PARENT_PAIR, SelectRequest::new("origin.example"));
        task.ping.n_replies_expected = 10;

        miss_from(&mut task, "p1", Some((50, 3)));
        miss_from(&mut task, "p2", Some((30, 3)));
        let p2_addr = task.sel.pool.get("p2").unwrap().udp_addr();
        assert_eq!(task.closest_parent_miss, p2_addr);
        assert_eq!(task.ping.p_rtt, 30);

        // An equal RTT does not displace the incumbent.
        miss_from(&mut task, "p1", Some((30, 3)));
        assert_eq!(task.closest_parent_miss, p2_addr);
    }

    #[test]
    fn closest_only_peers_never_become_first_miss() {
        let mut task = task_for(
            r#"
            [peers.snob]
            host = "10.0.1.1"
            kind = "parent"
            closest_only = true

            [peers.plain]
            host = "10.0.1.2"
            kind = "parent"
        "#,
            SelectRequest::new("origin.example"),
        );
        task.ping.n_replies_expected = 10;
        task.ping.start = Some(Instant::now());

        miss_from(&mut task, "snob", None);
        assert_eq!(task.first_parent_miss, None);

        miss_from(&mut task, "plain", None);
        assert_eq!(
            task.first_parent_miss,
            task.sel.pool.get("plain").unwrap().udp_addr()
        );
    }

    #[test]
    fn first_miss_is_retained_once_a_closest_miss_exists() {
        let mut task = task_for(PARENT_PAIR, SelectRequest::new("origin.example"));
        task.ping.n_replies_expected = 10;
        task.ping.start = Some(Instant::now());

        miss_from(&mut task, "p1", None);
        let first = task.first_parent_miss;
        assert!(first.is_some());

        // Once a closest miss is recorded, first-miss bookkeeping stops.
        miss_from(&mut task, "p2", Some((20, 2)));
        miss_from(&mut task, "p2", None);
        assert_eq!(task.first_parent_miss, first);
    }

    #[test]
    fn hit_ends_the_round_immediately() {
        let mut task = task_for(PARENT_PAIR, SelectRequest::new("origin.example"));
        task.ping.n_replies_expected = 10;

        let peer = task.sel.pool.get("p1").unwrap().clone();
        let decided = task.handle_ping_reply(PingReply {
            peer,
            relation: PeerRelation::Parent,
            payload: PingPayload::Icp(IcpReplyInfo {
                opcode: IcpOpcode::Hit,
                src_rtt: None,
            }),
        });
        assert!(decided);
        assert_eq!(task.hit.as_ref().unwrap().name, "p1");
    }

    #[test]
    fn unknown_protocol_replies_do_not_count_toward_quorum() {
        let mut task = task_for(PARENT_PAIR, SelectRequest::new("origin.example"));
        task.ping.n_replies_expected = 1;

        let peer = task.sel.pool.get("p1").unwrap().clone();
        let decided = task.handle_ping_reply(PingReply {
            peer,
            relation: PeerRelation::Parent,
            payload: PingPayload::Unknown(7),
        });
        assert!(!decided);
        assert_eq!(task.ping.n_recv, 0);
    }
}
