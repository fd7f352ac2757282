//! Command-line arguments for the selection probe.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// Show where cachemesh would forward a request.
///
/// Loads a `cachemesh.toml`, runs the destination selection a live proxy
/// would run for the given URL, and prints the ordered destination list.
#[derive(Parser, Debug)]
#[command(name = "cachemesh", author, version, about)]
pub struct Opts {
    /// Path to the configuration file.
    #[arg(short = 'C', long = "config", default_value = "cachemesh.toml")]
    pub config: PathBuf,

    /// The request URL to select destinations for.
    pub url: String,

    /// Pretend the request came from this client address. Acl checks and
    /// source-hash selection key off it.
    #[arg(long)]
    pub client: Option<IpAddr>,

    /// Treat the request as non-hierarchical (as a live proxy does for
    /// methods with side effects).
    #[arg(long)]
    pub nonhierarchical: bool,

    /// Verbosity of logging: -v info, -vv debug, -vvv trace.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}
