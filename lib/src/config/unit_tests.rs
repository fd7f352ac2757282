use super::ProxyConfig;
use crate::error::{PeerConfigError, ProxyConfigError};
use crate::hier::PeerRelation;
use std::time::Duration;

#[test]
fn defaults_from_empty_config() {
    let config: ProxyConfig = "".parse().expect("empty config parses");
    assert_eq!(config.forward_max_tries, 25);
    assert!(!config.prefer_direct);
    assert!(config.nonhierarchical_direct);
    assert!(!config.query_icmp);
    assert_eq!(config.minimum_direct_rtt, 400);
    assert_eq!(config.minimum_direct_hops, 4);
    assert!(config.neighbors_do_private_keys);
    assert_eq!(config.dead_peer_timeout, Duration::from_secs(10));
    assert!(config.peers.is_empty());
}

#[test]
fn full_config_parses() {
    let config: ProxyConfig = r#"
        forward_max_tries = 5
        prefer_direct = true
        query_icmp = true
        minimum_direct_rtt = 100
        dead_peer_timeout = 30
        outgoing_v4 = "192.0.2.7"
        always_direct = "lan"

        [acls]
        lan = [{ prefix = "10.0.0.0/8", action = "allow" }]

        [peers.first]
        host = "10.0.1.1"
        kind = "parent"
        http_port = 8080
        icp_port = 4827
        weight = 3
        basetime = 20
        round_robin = true
        access = "lan"

        [peers.second]
        host = "sibling.example"
        address = "10.0.1.2"
        htcp = true
    "#
    .parse()
    .expect("full config parses");

    assert_eq!(config.forward_max_tries, 5);
    assert!(config.prefer_direct);
    assert!(config.query_icmp);
    assert_eq!(config.minimum_direct_rtt, 100);
    assert_eq!(config.dead_peer_timeout, Duration::from_secs(30));
    assert_eq!(config.always_direct.as_deref(), Some("lan"));
    assert!(config.acls.contains("lan"));

    assert_eq!(config.peers.len(), 2);
    let first = &config.peers[0];
    assert_eq!(first.name, "first");
    assert_eq!(first.kind, PeerRelation::Parent);
    assert_eq!(first.http_port, 8080);
    assert_eq!(first.icp_port, 4827);
    assert_eq!(first.weight, 3);
    assert_eq!(first.basetime, 20);
    assert!(first.options.round_robin);
    assert_eq!(first.access.as_deref(), Some("lan"));
    // Host is an address literal, so it doubles as the reply address.
    assert_eq!(first.address, Some("10.0.1.1".parse().unwrap()));

    let second = &config.peers[1];
    // Defaults.
    assert_eq!(second.kind, PeerRelation::Sibling);
    assert_eq!(second.http_port, 3128);
    assert_eq!(second.weight, 1);
    assert!(second.options.htcp);
    assert_eq!(second.address, Some("10.0.1.2".parse().unwrap()));
}

fn peer_fragment_error(fragment: &str) -> PeerConfigError {
    let toml = format!("[peers.bad]\n{}", fragment);
    match toml.parse::<ProxyConfig>() {
        Err(ProxyConfigError::InvalidPeerDefinition { name, err }) => {
            assert_eq!(name, "bad");
            err
        }
        other => panic!("expected an invalid peer definition, got {:?}", other.err()),
    }
}

#[test]
fn peer_without_host_is_rejected() {
    assert!(matches!(
        peer_fragment_error("kind = \"parent\""),
        PeerConfigError::MissingHost
    ));
}

#[test]
fn peer_with_unknown_kind_is_rejected() {
    assert!(matches!(
        peer_fragment_error("host = \"10.0.0.1\"\nkind = \"cousin\""),
        PeerConfigError::InvalidKindEntry(kind) if kind == "cousin"
    ));
}

#[test]
fn peer_with_zero_weight_is_rejected() {
    assert!(matches!(
        peer_fragment_error("host = \"10.0.0.1\"\nweight = 0"),
        PeerConfigError::InvalidWeightEntry
    ));
}

#[test]
fn peer_with_stray_key_is_rejected() {
    assert!(matches!(
        peer_fragment_error("host = \"10.0.0.1\"\nfavorite_color = \"teal\""),
        PeerConfigError::UnrecognizedKey(key) if key == "favorite_color"
    ));
}

#[test]
fn bad_acl_prefix_is_rejected() {
    let err = r#"
        [acls]
        bad = [{ prefix = "10.0.0.0/40", action = "allow" }]
    "#
    .parse::<ProxyConfig>()
    .unwrap_err();
    assert!(matches!(
        err,
        ProxyConfigError::InvalidAclDefinition { name, .. } if name == "bad"
    ));
}

#[test]
fn dangling_acl_reference_is_rejected() {
    let err = "never_direct = \"missing\""
        .parse::<ProxyConfig>()
        .unwrap_err();
    assert!(matches!(
        err,
        ProxyConfigError::UnknownAclReference { list: "never_direct", name } if name == "missing"
    ));

    let err = r#"
        [peers.p]
        host = "10.0.0.1"
        access = "missing"
    "#
    .parse::<ProxyConfig>()
    .unwrap_err();
    assert!(matches!(
        err,
        ProxyConfigError::UnknownAclReference { list: "access", .. }
    ));
}
