use std::net::IpAddr;

use crate::hier::PeerRelation;
use crate::peers::PeerOptions;

/// A single neighbor cache definition.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub name: String,
    pub host: String,
    pub http_port: u16,
    pub icp_port: u16,
    /// The address ICP/HTCP replies arrive from. Defaults to `host` when the
    /// host is an address literal.
    pub address: Option<IpAddr>,
    pub kind: PeerRelation,
    pub weight: u32,
    pub basetime: u32,
    /// Name of the acl gating which requests may use this peer.
    pub access: Option<String>,
    pub options: PeerOptions,
}

/// The set of [`PeerConfig`] definitions, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct PeersConfig(pub Vec<PeerConfig>);

/// This module contains the [`TryFrom`] implementations used when
/// deserializing the `[peers]` section of a `cachemesh.toml`.
///
/// These implementations are called indirectly by
/// [`ProxyConfig::from_file`][super::ProxyConfig], and help validate that we
/// have been given an appropriate TOML schema. If the configuration is not
/// valid, a [`ProxyConfigError`] will be returned.
mod deserialization {
    use {
        super::{PeerConfig, PeersConfig},
        crate::error::{PeerConfigError, ProxyConfigError},
        crate::hier::PeerRelation,
        crate::peers::PeerOptions,
        toml::value::{Table, Value},
    };

    /// Helper function for converting a TOML [`Value`] into a [`Table`].
    fn into_table(value: Value) -> Result<Table, PeerConfigError> {
        match value {
            Value::Table(table) => Ok(table),
            _ => Err(PeerConfigError::InvalidEntryType),
        }
    }

    /// Return a [`PeerConfigError::UnrecognizedKey`] error if any
    /// unrecognized keys are found.
    ///
    /// This should be called after we have removed and validated the keys we
    /// expect in a [`Table`].
    fn check_for_unrecognized_keys(table: &Table) -> Result<(), PeerConfigError> {
        if let Some(key) = table.keys().next() {
            // While other keys might still exist, we can at least return a
            // helpful error including the name of *one* unrecognized key.
            Err(PeerConfigError::UnrecognizedKey(key.to_owned()))
        } else {
            Ok(())
        }
    }

    fn take_port(
        table: &mut Table,
        key: &'static str,
        default: u16,
    ) -> Result<u16, PeerConfigError> {
        table
            .remove(key)
            .map(|port| match port {
                Value::Integer(port) if (1..=65535).contains(&port) => Ok(port as u16),
                _ => Err(PeerConfigError::InvalidPortEntry(key)),
            })
            .transpose()
            .map(|port| port.unwrap_or(default))
    }

    fn take_bool(table: &mut Table, key: &'static str) -> Result<bool, PeerConfigError> {
        table
            .remove(key)
            .map(|flag| match flag {
                Value::Boolean(flag) => Ok(flag),
                _ => Err(PeerConfigError::InvalidBooleanEntry(key)),
            })
            .transpose()
            .map(|flag| flag.unwrap_or(false))
    }

    impl TryFrom<Table> for PeersConfig {
        type Error = ProxyConfigError;
        fn try_from(toml: Table) -> Result<Self, Self::Error> {
            /// Process a peer's definitions, or return a [`ProxyConfigError`].
            fn process_entry(
                (name, defs): (String, Value),
            ) -> Result<PeerConfig, ProxyConfigError> {
                into_table(defs)
                    .and_then(|table| PeerConfig::parse(&name, table))
                    .map_err(|err| ProxyConfigError::InvalidPeerDefinition {
                        name: name.clone(),
                        err,
                    })
            }

            toml.into_iter()
                .map(process_entry)
                .collect::<Result<_, _>>()
                .map(Self)
        }
    }

    impl PeerConfig {
        fn parse(name: &str, mut toml: Table) -> Result<Self, PeerConfigError> {
            let host = toml
                .remove("host")
                .ok_or(PeerConfigError::MissingHost)
                .and_then(|host| match host {
                    Value::String(host) if !host.trim().is_empty() => Ok(host),
                    _ => Err(PeerConfigError::InvalidHostEntry),
                })?;

            let http_port = take_port(&mut toml, "http_port", 3128)?;
            let icp_port = take_port(&mut toml, "icp_port", 3130)?;

            let address = toml
                .remove("address")
                .map(|address| match address {
                    Value::String(address) => address
                        .parse()
                        .map_err(|_| PeerConfigError::InvalidAddressEntry(address)),
                    _ => Err(PeerConfigError::InvalidAddressEntry(String::new())),
                })
                .transpose()?
                .or_else(|| host.parse().ok());

            let kind = toml
                .remove("kind")
                .map(|kind| match kind {
                    Value::String(kind) => match kind.to_lowercase().as_str() {
                        "parent" => Ok(PeerRelation::Parent),
                        "sibling" => Ok(PeerRelation::Sibling),
                        _ => Err(PeerConfigError::InvalidKindEntry(kind)),
                    },
                    _ => Err(PeerConfigError::InvalidKindEntry(String::new())),
                })
                .transpose()?
                .unwrap_or(PeerRelation::Sibling);

            let weight = toml
                .remove("weight")
                .map(|weight| match weight {
                    Value::Integer(weight) if weight >= 1 => Ok(weight as u32),
                    _ => Err(PeerConfigError::InvalidWeightEntry),
                })
                .transpose()?
                .unwrap_or(1);

            let basetime = toml
                .remove("basetime")
                .map(|basetime| match basetime {
                    Value::Integer(basetime) if basetime >= 0 => Ok(basetime as u32),
                    _ => Err(PeerConfigError::InvalidBasetimeEntry),
                })
                .transpose()?
                .unwrap_or(0);

            let access = toml
                .remove("access")
                .map(|access| match access {
                    Value::String(access) if !access.trim().is_empty() => Ok(access),
                    _ => Err(PeerConfigError::InvalidAccessEntry),
                })
                .transpose()?;

            let options = PeerOptions {
                no_query: take_bool(&mut toml, "no_query")?,
                closest_only: take_bool(&mut toml, "closest_only")?,
                default_parent: take_bool(&mut toml, "default")?,
                round_robin: take_bool(&mut toml, "round_robin")?,
                weighted_round_robin: take_bool(&mut toml, "weighted_round_robin")?,
                userhash: take_bool(&mut toml, "userhash")?,
                sourcehash: take_bool(&mut toml, "sourcehash")?,
                carp: take_bool(&mut toml, "carp")?,
                no_tproxy: take_bool(&mut toml, "no_tproxy")?,
                htcp: take_bool(&mut toml, "htcp")?,
            };

            check_for_unrecognized_keys(&toml)?;

            Ok(Self {
                name: name.to_owned(),
                host,
                http_port,
                icp_port,
                address,
                kind,
                weight,
                basetime,
                access,
                options,
            })
        }
    }
}
