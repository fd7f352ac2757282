use serde::{de::Error, Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

use crate::request::SelectRequest;

/// Acls is a mapping of names to acl.
#[derive(Clone, Debug, Default)]
pub struct Acls {
    acls: HashMap<String, Arc<Acl>>,
}

impl Acls {
    pub fn new() -> Self {
        Self {
            acls: HashMap::new(),
        }
    }

    pub fn get_acl(&self, name: &str) -> Option<&Arc<Acl>> {
        self.acls.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.acls.contains_key(name)
    }

    pub fn insert(&mut self, name: String, acl: Acl) {
        self.acls.insert(name, Arc::new(acl));
    }
}

/// An acl is an ordered collection of prefix rules.
///
/// Acls are declared in the `[acls]` section of `cachemesh.toml` and are
/// referenced by name from `always_direct`, `never_direct`, and per-peer
/// `access` settings:
///
/// ```toml
///    [acls]
///    lan = [
///        { prefix = "10.0.0.0/8", action = "allow" },
///        { prefix = "10.1.2.0/24", action = "deny" },
///    ]
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct Acl {
    pub(crate) entries: Vec<Entry>,
}

impl Acl {
    /// Lookup performs a naive scan of the given IP address over the acl
    /// entries.
    ///
    /// If the IP matches multiple entries, then:
    /// - The most specific match is returned (longest mask),
    /// - and in case of a tie, the last entry wins.
    pub fn lookup(&self, ip: IpAddr) -> Option<&Entry> {
        self.entries.iter().fold(None, |acc, entry| {
            if let Some(mask) = entry.prefix.is_match(ip) {
                if acc.is_none_or(|prev_match: &Entry| mask >= prev_match.prefix.mask) {
                    return Some(entry);
                }
            }
            acc
        })
    }
}

/// An entry is an IP prefix and its associated action.
#[derive(Debug, Deserialize, PartialEq)]
pub struct Entry {
    prefix: Prefix,
    action: Action,
}

impl Entry {
    pub fn action(&self) -> Action {
        self.action
    }
}

/// A prefix is an IP and network mask.
#[derive(Debug, PartialEq)]
pub struct Prefix {
    ip: IpAddr,
    mask: u8,
}

impl Prefix {
    pub(crate) fn new(ip: IpAddr, mask: u8) -> Self {
        // Normalize IP based on mask.
        let (ip, mask) = match ip {
            IpAddr::V4(v4) => {
                let mask = mask.clamp(1, 32);
                let bit_mask = u32::MAX << (32 - mask);
                (
                    IpAddr::V4(Ipv4Addr::from_bits(v4.to_bits() & bit_mask)),
                    mask,
                )
            }
            IpAddr::V6(v6) => {
                let mask = mask.clamp(1, 128);
                let bit_mask = u128::MAX << (128 - mask);
                (
                    IpAddr::V6(Ipv6Addr::from_bits(v6.to_bits() & bit_mask)),
                    mask,
                )
            }
        };

        Self { ip, mask }
    }

    /// If the given IP matches the prefix, then the prefix's
    /// mask is returned.
    pub(crate) fn is_match(&self, ip: IpAddr) -> Option<u8> {
        let masked = Self::new(ip, self.mask);
        if masked.ip == self.ip {
            Some(self.mask)
        } else {
            None
        }
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.ip, self.mask))
    }
}

impl<'de> Deserialize<'de> for Prefix {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(de)?;
        let (ip, mask) = v.split_once('/').ok_or(D::Error::custom(format!(
            "invalid format '{}': want IP/MASK",
            v
        )))?;

        let mask = mask
            .parse::<u8>()
            .map_err(|err| D::Error::custom(format!("invalid prefix {}: {}", mask, err)))?;

        // Detect whether the IP is v4 or v6.
        let ip = match ip.contains(':') {
            false => {
                if !(1..=32).contains(&mask) {
                    return Err(D::Error::custom(format!(
                        "mask outside allowed range [1, 32]: {}",
                        mask
                    )));
                }
                ip.parse::<Ipv4Addr>().map(IpAddr::V4)
            }
            true => {
                if !(1..=128).contains(&mask) {
                    return Err(D::Error::custom(format!(
                        "mask outside allowed range [1, 128]: {}",
                        mask
                    )));
                }
                ip.parse::<Ipv6Addr>().map(IpAddr::V6)
            }
        }
        .map_err(|err| D::Error::custom(format!("invalid ip address {}: {}", ip, err)))?;

        Ok(Self::new(ip, mask))
    }
}

/// An action for a prefix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Action {
    Allow,
    Deny,
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let action = String::deserialize(de)?;
        match action.to_uppercase().as_str() {
            "ALLOW" => Ok(Self::Allow),
            "DENY" => Ok(Self::Deny),
            other => Err(D::Error::custom(format!(
                "unrecognized action '{}': want ALLOW or DENY",
                other
            ))),
        }
    }
}

/// The verdict of an access-control evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAnswer {
    Allow,
    Deny,
}

impl AclAnswer {
    pub fn allowed(self) -> bool {
        self == AclAnswer::Allow
    }
}

/// An in-flight access-control evaluation.
///
/// The answer arrives on a oneshot channel so the evaluation can complete off
/// the selection path. A dropped sender is reported as a denial.
#[derive(Debug)]
pub struct AclCheck {
    pub receiver: oneshot::Receiver<AclAnswer>,
}

impl AclCheck {
    pub async fn wait(self) -> AclAnswer {
        self.receiver.await.unwrap_or(AclAnswer::Deny)
    }
}

/// Access-control seam consulted by the selection engine.
pub trait AclChecker: Send + Sync {
    /// Begin evaluating the named acl against a request. The result is
    /// delivered through the returned [`AclCheck`].
    fn non_blocking_check(&self, name: &str, request: &SelectRequest) -> AclCheck;
}

/// An [`AclChecker`] over the acls declared in configuration.
///
/// Evaluation matches the request's client address against the named acl.
/// A request without a client address, or a reference to an acl that does
/// not exist, is denied.
#[derive(Clone, Debug, Default)]
pub struct ConfiguredAcls {
    acls: Acls,
}

impl ConfiguredAcls {
    pub fn new(acls: Acls) -> Self {
        Self { acls }
    }

    fn evaluate(&self, name: &str, request: &SelectRequest) -> AclAnswer {
        let Some(acl) = self.acls.get_acl(name) else {
            warn!("acl '{}' is not defined; denying", name);
            return AclAnswer::Deny;
        };
        let Some(client) = request.client_addr else {
            return AclAnswer::Deny;
        };
        match acl.lookup(client).map(Entry::action) {
            Some(Action::Allow) => AclAnswer::Allow,
            _ => AclAnswer::Deny,
        }
    }
}

impl AclChecker for ConfiguredAcls {
    fn non_blocking_check(&self, name: &str, request: &SelectRequest) -> AclCheck {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(self.evaluate(name, request));
        AclCheck { receiver }
    }
}

#[test]
fn prefix_is_match() {
    let prefix = Prefix::new(Ipv4Addr::new(192, 168, 100, 0).into(), 16);

    assert_eq!(
        prefix.is_match(Ipv4Addr::new(192, 168, 100, 0).into()),
        Some(16)
    );
    assert_eq!(
        prefix.is_match(Ipv4Addr::new(192, 168, 200, 200).into()),
        Some(16)
    );

    assert_eq!(prefix.is_match(Ipv4Addr::new(192, 167, 0, 0).into()), None);
    assert_eq!(prefix.is_match(Ipv4Addr::new(192, 169, 0, 0).into()), None);

    let prefix = Prefix::new(Ipv6Addr::new(0xFACE, 0, 0, 0, 0, 0, 0, 0).into(), 16);
    assert_eq!(
        prefix.is_match(Ipv6Addr::new(0xFACE, 1, 2, 3, 4, 5, 6, 7).into()),
        Some(16)
    );

    // A v4 address and its v6-mapped form are distinct families.
    let v4 = Ipv4Addr::new(192, 168, 200, 200);
    let v4_as_v6 = v4.to_ipv6_mapped();

    assert_eq!(Prefix::new(v4.into(), 8).is_match(v4_as_v6.into()), None);
    assert_eq!(Prefix::new(v4_as_v6.into(), 8).is_match(v4.into()), None);
}

#[test]
fn acl_lookup() {
    let acl = Acl {
        entries: vec![
            Entry {
                prefix: Prefix::new(Ipv4Addr::new(192, 168, 100, 0).into(), 16),
                action: Action::Deny,
            },
            Entry {
                prefix: Prefix::new(Ipv4Addr::new(192, 168, 100, 0).into(), 24),
                action: Action::Allow,
            },
            Entry {
                prefix: Prefix::new(Ipv4Addr::new(192, 168, 100, 0).into(), 8),
                action: Action::Deny,
            },
        ],
    };

    // Longest mask wins.
    match acl.lookup(Ipv4Addr::new(192, 168, 100, 1).into()) {
        Some(lookup_match) => assert_eq!(acl.entries[1], *lookup_match),
        None => panic!("expected lookup match"),
    };

    match acl.lookup(Ipv4Addr::new(192, 168, 200, 1).into()) {
        Some(lookup_match) => assert_eq!(acl.entries[0], *lookup_match),
        None => panic!("expected lookup match"),
    };

    match acl.lookup(Ipv4Addr::new(192, 1, 1, 1).into()) {
        Some(lookup_match) => assert_eq!(acl.entries[2], *lookup_match),
        None => panic!("expected lookup match"),
    };

    if let Some(lookup_match) = acl.lookup(Ipv4Addr::new(1, 1, 1, 1).into()) {
        panic!("expected no lookup match, got {:?}", lookup_match)
    };
}

#[test]
fn acl_toml_parse() {
    let input = r#"
    entries = [
        { prefix = "1.2.3.0/24", action = "deny" },
        { prefix = "23.23.23.23/32", action = "ALLOW" },
        { prefix = "FACE::/32", action = "allow" },
    ]
    "#;

    #[derive(Deserialize)]
    struct Wrapper {
        entries: Acl,
    }

    let acl = toml::from_str::<Wrapper>(input).expect("can decode").entries;
    assert_eq!(acl.entries.len(), 3);
    assert_eq!(acl.entries[0].action, Action::Deny);
    assert_eq!(acl.entries[1].action, Action::Allow);

    // Invalid prefix.
    assert!(toml::from_str::<Wrapper>(r#"entries = [{ prefix = "1.2.3.4/33", action = "allow" }]"#).is_err());
    // Invalid action.
    assert!(toml::from_str::<Wrapper>(r#"entries = [{ prefix = "1.2.3.4/32", action = "block" }]"#).is_err());
}

#[tokio::test]
async fn configured_acls_check() {
    let mut acls = Acls::new();
    acls.insert(
        "lan".to_string(),
        Acl {
            entries: vec![Entry {
                prefix: Prefix::new(Ipv4Addr::new(10, 0, 0, 0).into(), 8),
                action: Action::Allow,
            }],
        },
    );
    let checker = ConfiguredAcls::new(acls);

    let request = SelectRequest {
        client_addr: Some(IpAddr::from(Ipv4Addr::new(10, 1, 2, 3))),
        ..SelectRequest::new("origin.example")
    };
    assert_eq!(
        checker.non_blocking_check("lan", &request).wait().await,
        AclAnswer::Allow
    );
    assert_eq!(
        checker.non_blocking_check("missing", &request).wait().await,
        AclAnswer::Deny
    );

    let anonymous = SelectRequest::new("origin.example");
    assert_eq!(
        checker.non_blocking_check("lan", &anonymous).wait().await,
        AclAnswer::Deny
    );
}
