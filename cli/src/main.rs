//! cachemesh's selection probe.

// When building the project in release mode:
//   (1): Promote warnings into errors.
//   (2): Deny broken documentation links.
//   (3): Deny invalid codeblock attributes in documentation.
//   (4): Promote warnings in examples into errors, except for unused variables.
#![cfg_attr(not(debug_assertions), deny(warnings))]
#![cfg_attr(not(debug_assertions), deny(clippy::all))]
#![cfg_attr(not(debug_assertions), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(not(debug_assertions), deny(invalid_codeblock_attributes))]

mod opts;

use {
    crate::opts::Opts,
    anyhow::{bail, Context},
    cachemesh_lib::netdb::{IcmpNetDb, NetDb, NetDbDisabled},
    cachemesh_lib::request::{RequestFlags, SelectRequest},
    cachemesh_lib::{CacheEntry, PeerSelector, ProxyConfig},
    clap::Parser,
    http::uri::Scheme,
    std::env,
    std::sync::Arc,
    tracing::{event, Level},
    tracing_subscriber::{filter::EnvFilter, FmtSubscriber},
    url::Url,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    install_tracing_subscriber(opts.verbose);

    let config = ProxyConfig::from_file(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?;
    let request = request_from_opts(&opts)?;

    let netdb: Arc<dyn NetDb> = if config.query_icmp {
        Arc::new(IcmpNetDb::new())
    } else {
        Arc::new(NetDbDisabled)
    };

    // The probe runs with no ICP/HTCP sockets and no digests, the same
    // degraded mode a proxy runs in before those subsystems come up.
    let selector = PeerSelector::new(Arc::new(config)).with_netdb(netdb);

    let request = Arc::new(request);
    let entry = Arc::new(CacheEntry::new(request.url()));
    let paths = selector.select(Arc::clone(&request), Some(entry)).await;

    if paths.is_empty() {
        bail!("no viable destination for {}", request.url());
    }

    println!("destinations for {}:", request.url());
    for (n, destination) in paths.iter().enumerate() {
        match destination.local {
            Some(local) => println!(
                "{:>3}. {} {} (from {})",
                n + 1,
                destination.remote,
                destination.code,
                local
            ),
            None => println!("{:>3}. {} {}", n + 1, destination.remote, destination.code),
        }
    }
    Ok(())
}

fn request_from_opts(opts: &Opts) -> anyhow::Result<SelectRequest> {
    let url: Url = opts.url.parse().context("parsing request URL")?;
    let host = url
        .host_str()
        .context("request URL has no host")?
        .to_string();
    let scheme = match url.scheme() {
        "https" => Scheme::HTTPS,
        _ => Scheme::HTTP,
    };
    let port = url
        .port_or_known_default()
        .unwrap_or(if scheme == Scheme::HTTPS { 443 } else { 80 });

    Ok(SelectRequest {
        scheme,
        host,
        port,
        path: url.path().to_string(),
        login: (!url.username().is_empty()).then(|| url.username().to_string()),
        client_addr: opts.client,
        flags: RequestFlags {
            hierarchical: !opts.nonhierarchical,
            ..RequestFlags::default()
        },
        ..SelectRequest::default()
    })
}

fn install_tracing_subscriber(verbosity: u8) {
    // Default to whatever a user provides, but if not set make logging work
    // for cachemesh and cachemesh-lib so that they show up in the terminal.
    if env::var("RUST_LOG").ok().is_none() {
        match verbosity {
            0 => env::set_var("RUST_LOG", "cachemesh=error,cachemesh_lib=error"),
            1 => env::set_var("RUST_LOG", "cachemesh=info,cachemesh_lib=info"),
            2 => env::set_var("RUST_LOG", "cachemesh=debug,cachemesh_lib=debug"),
            _ => env::set_var("RUST_LOG", "cachemesh=trace,cachemesh_lib=trace"),
        }
    }

    // Build a subscriber, using the default `RUST_LOG` environment variable
    // for our filter.
    let builder = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false);

    match env::var("RUST_LOG_PRETTY") {
        // If the `RUST_LOG_PRETTY` environment variable is set to "true", we
        // should emit logs in a pretty, human-readable output format.
        Ok(s) if s == "true" => builder
            .pretty()
            // Show levels, because ANSI escape sequences are normally used
            // to indicate this.
            .with_level(true)
            .init(),
        // Otherwise, we should install the subscriber without any further
        // additions.
        _ => builder.with_ansi(false).init(),
    }
    event!(
        Level::DEBUG,
        "RUST_LOG set to '{}'",
        env::var("RUST_LOG").unwrap_or_else(|_| String::from("<Could not get env>"))
    );
}
