//! cachemesh configuration utilities.

use {
    crate::acl::{Acl, Acls},
    crate::error::{AclConfigError, ProxyConfigError},
    serde::Deserialize,
    std::{
        convert::TryInto,
        fs,
        net::{IpAddr, Ipv4Addr, Ipv6Addr},
        path::Path,
        str::FromStr,
        time::Duration,
    },
    toml::value::Table,
};

/// Unit tests for the [`ProxyConfig`] type.
#[cfg(test)]
mod unit_tests;

/// Types and deserializers for peer configuration settings.
mod peers;
pub use self::peers::PeerConfig;
use self::peers::PeersConfig;

/// Settings driving destination selection.
///
/// This `struct` represents the fields and values in a `cachemesh.toml`.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upper bound on the number of destinations handed to the forwarding
    /// layer.
    pub forward_max_tries: usize,
    /// Try the origin before any parent when both are permitted.
    pub prefer_direct: bool,
    /// Send non-hierarchical requests to the origin rather than a parent.
    pub nonhierarchical_direct: bool,
    /// Fold RTT hints from ICP/HTCP replies into the measurement database.
    pub query_icmp: bool,
    /// Go direct when the measured origin RTT is at or below this (msec).
    pub minimum_direct_rtt: u32,
    /// Go direct when the measured origin hop count is at or below this.
    pub minimum_direct_hops: u32,
    /// Allow ICP/HTCP queries for privately-keyed cache entries.
    pub neighbors_do_private_keys: bool,
    /// How long a peer stays dead after a failed exchange.
    pub dead_peer_timeout: Duration,
    pub outgoing_v4: Option<Ipv4Addr>,
    pub outgoing_v6: Option<Ipv6Addr>,
    /// Acl granting unconditional direct forwarding.
    pub always_direct: Option<String>,
    /// Acl forbidding direct forwarding.
    pub never_direct: Option<String>,
    pub acls: Acls,
    pub peers: Vec<PeerConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            forward_max_tries: 25,
            prefer_direct: false,
            nonhierarchical_direct: true,
            query_icmp: false,
            minimum_direct_rtt: 400,
            minimum_direct_hops: 4,
            neighbors_do_private_keys: true,
            dead_peer_timeout: Duration::from_secs(10),
            outgoing_v4: None,
            outgoing_v6: None,
            always_direct: None,
            never_direct: None,
            acls: Acls::new(),
            peers: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Parse a `cachemesh.toml` file into a `ProxyConfig`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProxyConfigError> {
        fs::read_to_string(path.as_ref())
            .map_err(|err| ProxyConfigError::IoError {
                path: path.as_ref().display().to_string(),
                err,
            })
            .and_then(Self::from_str)
    }

    /// Parse a string containing TOML data into a `ProxyConfig`.
    fn from_str(toml: impl AsRef<str>) -> Result<Self, ProxyConfigError> {
        toml::from_str::<RawProxyConfig>(toml.as_ref())
            .map_err(ProxyConfigError::from)
            .and_then(TryInto::try_into)
    }

    /// The configured source address to bind for a given destination, if any.
    pub fn outgoing_address(&self, remote: &IpAddr) -> Option<IpAddr> {
        match remote {
            IpAddr::V4(_) => self.outgoing_v4.map(IpAddr::V4),
            IpAddr::V6(_) => self.outgoing_v6.map(IpAddr::V6),
        }
    }
}

impl FromStr for ProxyConfig {
    type Err = ProxyConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s)
    }
}

/// Internal deserializer used to read data from a `cachemesh.toml` file.
///
/// Once a TOML file has been read using [`toml::from_str`], this can be
/// converted into a [`ProxyConfig`] with [`TryInto::try_into`].
#[derive(Deserialize)]
struct RawProxyConfig {
    forward_max_tries: Option<usize>,
    prefer_direct: Option<bool>,
    nonhierarchical_direct: Option<bool>,
    query_icmp: Option<bool>,
    minimum_direct_rtt: Option<u32>,
    minimum_direct_hops: Option<u32>,
    neighbors_do_private_keys: Option<bool>,
    dead_peer_timeout: Option<u64>,
    outgoing_v4: Option<Ipv4Addr>,
    outgoing_v6: Option<Ipv6Addr>,
    always_direct: Option<String>,
    never_direct: Option<String>,
    acls: Option<Table>,
    peers: Option<Table>,
}

impl TryInto<ProxyConfig> for RawProxyConfig {
    type Error = ProxyConfigError;
    fn try_into(self) -> Result<ProxyConfig, Self::Error> {
        let Self {
            forward_max_tries,
            prefer_direct,
            nonhierarchical_direct,
            query_icmp,
            minimum_direct_rtt,
            minimum_direct_hops,
            neighbors_do_private_keys,
            dead_peer_timeout,
            outgoing_v4,
            outgoing_v6,
            always_direct,
            never_direct,
            acls,
            peers,
        } = self;

        let mut parsed_acls = Acls::new();
        for (name, value) in acls.unwrap_or_default() {
            let acl: Acl = value.try_into().map_err(|err: toml::de::Error| {
                ProxyConfigError::InvalidAclDefinition {
                    name: name.clone(),
                    err: AclConfigError::Invalid(err.to_string()),
                }
            })?;
            parsed_acls.insert(name, acl);
        }

        let peers = peers
            .map(PeersConfig::try_from)
            .transpose()?
            .unwrap_or_default()
            .0;

        // Dangling acl references are configuration mistakes, caught here
        // rather than at selection time.
        for (list, reference) in [
            ("always_direct", &always_direct),
            ("never_direct", &never_direct),
        ] {
            if let Some(name) = reference {
                if !parsed_acls.contains(name) {
                    return Err(ProxyConfigError::UnknownAclReference {
                        list,
                        name: name.clone(),
                    });
                }
            }
        }
        for peer in &peers {
            if let Some(name) = &peer.access {
                if !parsed_acls.contains(name) {
                    return Err(ProxyConfigError::UnknownAclReference {
                        list: "access",
                        name: name.clone(),
                    });
                }
            }
        }

        let defaults = ProxyConfig::default();
        Ok(ProxyConfig {
            forward_max_tries: forward_max_tries.unwrap_or(defaults.forward_max_tries).max(1),
            prefer_direct: prefer_direct.unwrap_or(defaults.prefer_direct),
            nonhierarchical_direct: nonhierarchical_direct
                .unwrap_or(defaults.nonhierarchical_direct),
            query_icmp: query_icmp.unwrap_or(defaults.query_icmp),
            minimum_direct_rtt: minimum_direct_rtt.unwrap_or(defaults.minimum_direct_rtt),
            minimum_direct_hops: minimum_direct_hops.unwrap_or(defaults.minimum_direct_hops),
            neighbors_do_private_keys: neighbors_do_private_keys
                .unwrap_or(defaults.neighbors_do_private_keys),
            dead_peer_timeout: dead_peer_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.dead_peer_timeout),
            outgoing_v4,
            outgoing_v6,
            always_direct,
            never_direct,
            acls: parsed_acls,
            peers,
        })
    }
}
