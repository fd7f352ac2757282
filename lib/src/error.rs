//! Error types.

use std::io;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    ProxyConfig(#[from] ProxyConfigError),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error(transparent)]
    IoError(#[from] io::Error),
}

/// Errors that may occur while parsing a `cachemesh.toml` file.
#[derive(Debug, thiserror::Error)]
pub enum ProxyConfigError {
    /// An I/O error that occurred while reading the file.
    #[error("error reading '{path}': {err}")]
    IoError { path: String, err: io::Error },

    #[error("error parsing `cachemesh.toml`: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("invalid configuration for peer '{name}': {err}")]
    InvalidPeerDefinition { name: String, err: PeerConfigError },

    #[error("invalid configuration for acl '{name}': {err}")]
    InvalidAclDefinition { name: String, err: AclConfigError },

    /// `always_direct` or `never_direct` names an ACL that was never defined.
    #[error("'{list}' references unknown acl '{name}'")]
    UnknownAclReference { list: &'static str, name: String },
}

/// Errors that may occur while parsing a `[peers.<name>]` table.
#[derive(Debug, thiserror::Error)]
pub enum PeerConfigError {
    #[error("definition was not provided as a TOML table")]
    InvalidEntryType,

    #[error("'host' field was not provided")]
    MissingHost,

    #[error("invalid 'host' entry")]
    InvalidHostEntry,

    #[error("invalid '{0}' port entry")]
    InvalidPortEntry(&'static str),

    #[error("invalid 'address' entry: {0}")]
    InvalidAddressEntry(String),

    #[error("unrecognized peer kind '{0}'; expected 'parent' or 'sibling'")]
    InvalidKindEntry(String),

    #[error("'weight' must be an integer of at least 1")]
    InvalidWeightEntry,

    #[error("invalid 'basetime' entry")]
    InvalidBasetimeEntry,

    #[error("invalid '{0}' entry; expected a boolean")]
    InvalidBooleanEntry(&'static str),

    #[error("invalid 'access' entry")]
    InvalidAccessEntry,

    #[error("unrecognized key '{0}'")]
    UnrecognizedKey(String),
}

/// Errors that may occur while parsing an `[acls]` entry.
#[derive(Debug, thiserror::Error)]
pub enum AclConfigError {
    #[error("{0}")]
    Invalid(String),
}
