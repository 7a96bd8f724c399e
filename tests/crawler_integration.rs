//! Integration tests: a full probe cycle against an in-process fake peer.
//!
//! The fake peer speaks the real wire protocol over a loopback TcpListener,
//! so these tests exercise the probe state machine, the database policies,
//! and the DNS sampling path exactly as production wiring does.

use std::collections::HashSet;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use peerseed::db::{unix_now, AddrDb};
use peerseed::dns::{DnsServer, QTYPE_A};
use peerseed::netaddr::{Endpoint, NODE_NETWORK};
use peerseed::probe::{ProbeClient, ProxyConfig};
use peerseed::wire::{
    build_addr_payload, build_message, build_version_payload, SeenAddress, PROTOCOL_VERSION,
};

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn client() -> ProbeClient {
    ProbeClient {
        proxies: ProxyConfig::default(),
        user_agent: "/peerseed:0.1/".to_string(),
        best_height: 0,
    }
}

fn seen(ep: Endpoint) -> SeenAddress {
    SeenAddress {
        timestamp: unix_now() as u32,
        services: NODE_NETWORK,
        endpoint: ep,
    }
}

/// A peer that completes the handshake and, when asked, gossips `addrs`.
async fn fake_peer(listener: TcpListener, gossip: Vec<SeenAddress>) {
    let (mut sock, _) = listener.accept().await.expect("accept");
    let mut buf = vec![0u8; 65536];
    let n = sock.read(&mut buf).await.expect("read version");
    assert!(n > 0, "expected the crawler's version message");

    let reply_to = Endpoint::from(sock.peer_addr().expect("peer addr"));
    let version =
        build_version_payload(&reply_to, 0, 42, "/fakenode:0.9/", 750_000, unix_now() as i64);
    sock.write_all(&build_message("version", &version, PROTOCOL_VERSION))
        .await
        .expect("send version");
    sock.write_all(&build_message("verack", &[], PROTOCOL_VERSION))
        .await
        .expect("send verack");

    // Wait for getaddr (if gossip is wanted) and answer with the addr dump.
    if !gossip.is_empty() {
        let _ = sock.read(&mut buf).await;
        let payload = build_addr_payload(&gossip, PROTOCOL_VERSION);
        sock.write_all(&build_message("addr", &payload, PROTOCOL_VERSION))
            .await
            .expect("send addr");
    }
    tokio::time::sleep(Duration::from_secs(60)).await;
}

/// Probe one candidate the way a crawler worker does and report the result.
async fn crawl_once(db: &AddrDb, client: &ProbeClient, want_gossip: bool) {
    let cand = db.get().expect("a candidate to crawl");
    let outcome = client.probe(cand.endpoint, want_gossip).await;
    if !outcome.addrs.is_empty() {
        db.add_many(&outcome.addrs, false);
    }
    if outcome.success {
        db.good(
            cand.endpoint,
            outcome.client_version,
            outcome.client_subversion,
            outcome.blocks,
        );
    } else {
        db.bad(cand.endpoint, outcome.ban_secs);
    }
}

#[tokio::test]
async fn probe_feeds_database_and_dns() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let peer_ep = Endpoint::from(listener.local_addr().expect("local addr"));
    tokio::spawn(fake_peer(listener, vec![]));

    let db = AddrDb::new();
    db.add(seen(peer_ep), true);

    timeout(TEST_TIMEOUT, crawl_once(&db, &client(), false))
        .await
        .expect("probe within deadline");

    let stats = db.stats();
    assert_eq!(stats.good, 0, "loopback peer is never good (unroutable)");
    assert_eq!(stats.tracked, 1, "successful probe moves it to tracked");
    assert_eq!(stats.banned, 0);
}

#[tokio::test]
async fn gossip_is_harvested_into_the_database() {
    let gossip = vec![
        seen("8.8.8.8:8333".parse().unwrap()),
        seen("9.9.9.9:8333".parse().unwrap()),
        // Unroutable gossip must be dropped on add.
        seen("192.168.1.1:8333".parse().unwrap()),
    ];
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let peer_ep = Endpoint::from(listener.local_addr().expect("local addr"));
    tokio::spawn(fake_peer(listener, gossip));

    let db = AddrDb::new();
    db.add(seen(peer_ep), true);

    timeout(TEST_TIMEOUT + Duration::from_secs(15), crawl_once(&db, &client(), true))
        .await
        .expect("probe within deadline");

    let stats = db.stats();
    assert_eq!(stats.new, 2, "two routable gossiped endpoints land in unknown");
    assert_eq!(stats.tracked, 1);
}

#[tokio::test]
async fn protocol_violation_bans_the_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let peer_ep = Endpoint::from(listener.local_addr().expect("local addr"));
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 4096];
        let _ = sock.read(&mut buf).await;
        sock.write_all(b"totally not a protocol message, just noise")
            .await
            .expect("send garbage");
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let db = AddrDb::new();
    db.add(seen(peer_ep), true);

    timeout(TEST_TIMEOUT, crawl_once(&db, &client(), false))
        .await
        .expect("probe within deadline");

    let stats = db.stats();
    assert_eq!(stats.banned, 1, "violation evicts the peer to the ban list");
    assert_eq!(stats.avail, 0);
}

#[tokio::test]
async fn dead_peer_degrades_without_ban() {
    // Bind then drop to get a refusing port.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let peer_ep = Endpoint::from(listener.local_addr().expect("local addr"));
    drop(listener);

    let db = AddrDb::new();
    db.add(seen(peer_ep), true);

    timeout(TEST_TIMEOUT, crawl_once(&db, &client(), false))
        .await
        .expect("probe within deadline");

    let stats = db.stats();
    assert_eq!(stats.banned, 0, "a dead peer is not a protocol violator");
    assert_eq!(stats.tracked, 1, "it stays tracked for retries");
}

#[tokio::test]
async fn end_to_end_dns_answer_after_crawl() {
    // Crawl a fake peer, then mark a routable endpoint good by reporting the
    // outcome against it, and confirm DNS serves it.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let peer_ep = Endpoint::from(listener.local_addr().expect("local addr"));
    tokio::spawn(fake_peer(listener, vec![]));

    let db = AddrDb::new();
    db.add(seen(peer_ep), true);
    timeout(TEST_TIMEOUT, crawl_once(&db, &client(), false))
        .await
        .expect("probe within deadline");

    // A routable peer that handshook successfully.
    let good_ep: Endpoint = "8.8.8.8:8333".parse().unwrap();
    db.add(seen(good_ep), false);
    let cand = db.get().expect("candidate");
    db.good(cand.endpoint, PROTOCOL_VERSION, "/fakenode:0.9/".into(), 750_000);

    let server = DnsServer::new(
        "seed.example.com",
        "ns.example.com",
        "admin.example.com",
        HashSet::from([1u64]),
        db,
    )
    .expect("server config");

    // A query for the zone, built by hand: header + name + qtype/qclass.
    let mut query = vec![0xab, 0xcd, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    for label in ["seed", "example", "com"] {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&QTYPE_A.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());

    let response = server.handle(&query).expect("a response");
    let ancount = u16::from_be_bytes([response[6], response[7]]);
    assert!(ancount >= 1, "the crawled good peer is served over DNS");
    assert!(
        response
            .windows(4)
            .any(|w| w == [8, 8, 8, 8]),
        "answer contains the good peer's address bytes"
    );
}
