//! The request and cache-entry handles the selection engine works against.
//!
//! The engine does not own HTTP parsing or the cache store; it sees a request
//! through this reduced view and a cache entry through [`CacheEntry`].

use http::uri::Scheme;
use http::Method;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::hier::PingStatus;

/// Request properties that influence destination selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFlags {
    /// The request may travel through the cache hierarchy. Typically false
    /// for methods with side effects.
    pub hierarchical: bool,
    /// Accelerator / reverse-proxy mode: the origin is not ours to contact.
    pub no_direct: bool,
    /// A forwarding loop was already detected for this request.
    pub loopdetect: bool,
    /// Outbound connections must spoof the client's address (TPROXY).
    pub spoof_client_ip: bool,
}

impl Default for RequestFlags {
    fn default() -> Self {
        Self {
            hierarchical: true,
            no_direct: false,
            loopdetect: false,
            spoof_client_ip: false,
        }
    }
}

/// A client connection pinned to a particular next hop, typically because of
/// connection-oriented authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedConnection {
    /// The peer the connection is pinned to; `None` pins to the origin.
    pub peer: Option<String>,
    /// Whether the pinned connection revalidated successfully.
    pub validated: bool,
}

/// The selection engine's view of an HTTP request.
#[derive(Debug)]
pub struct SelectRequest {
    pub method: Method,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Authenticated user, when known. Feeds userhash parent selection.
    pub login: Option<String>,
    pub client_addr: Option<IpAddr>,
    pub flags: RequestFlags,
    pub pinned: Option<PinnedConnection>,
    pub hier: Mutex<HierarchyNote>,
}

impl Default for SelectRequest {
    fn default() -> Self {
        Self {
            method: Method::GET,
            scheme: Scheme::HTTP,
            host: String::new(),
            port: 80,
            path: "/".to_string(),
            login: None,
            client_addr: None,
            flags: RequestFlags::default(),
            pinned: None,
            hier: Mutex::new(HierarchyNote::default()),
        }
    }
}

impl SelectRequest {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// The request URL, reassembled for log messages.
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }

    /// Attach the ping statistics gathered during selection.
    pub fn note_ping(&self, ping: PingStats) {
        self.hier.lock().unwrap().ping = Some(ping);
    }

    pub fn hierarchy_note(&self) -> HierarchyNote {
        self.hier.lock().unwrap().clone()
    }
}

/// Diagnostic trail left on a request by the selection engine.
#[derive(Debug, Clone, Default)]
pub struct HierarchyNote {
    pub ping: Option<PingStats>,
}

/// Aggregate state of one ICP/HTCP query round.
#[derive(Debug, Clone)]
pub struct PingStats {
    pub n_sent: usize,
    pub n_recv: usize,
    pub n_replies_expected: usize,
    pub timeout: Duration,
    pub timedout: bool,
    pub start: Option<Instant>,
    pub stop: Option<Instant>,
    /// Weighted round-trip estimate backing the first-miss choice.
    pub w_rtt: i64,
    /// RTT of the closest parent that answered MISS.
    pub p_rtt: u32,
}

impl Default for PingStats {
    fn default() -> Self {
        Self {
            n_sent: 0,
            n_recv: 0,
            n_replies_expected: 0,
            timeout: Duration::ZERO,
            timedout: false,
            start: None,
            stop: None,
            w_rtt: 0,
            p_rtt: 0,
        }
    }
}

/// The selection engine's handle on a cache entry.
///
/// Holding the `Arc` stands in for the store's entry lock; the engine only
/// reads the private-key flag and drives `ping_status` forward.
#[derive(Debug)]
pub struct CacheEntry {
    url: String,
    private_key: bool,
    ping_status: Mutex<PingStatus>,
}

impl CacheEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            private_key: false,
            ping_status: Mutex::new(PingStatus::None),
        }
    }

    /// An entry stored under a private key; its existence must not leak to
    /// arbitrary neighbors.
    pub fn with_private_key(url: impl Into<String>) -> Self {
        Self {
            private_key: true,
            ..Self::new(url)
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn private_key(&self) -> bool {
        self.private_key
    }

    pub fn ping_status(&self) -> PingStatus {
        *self.ping_status.lock().unwrap()
    }

    pub fn set_ping_status(&self, status: PingStatus) {
        *self.ping_status.lock().unwrap() = status;
    }
}
