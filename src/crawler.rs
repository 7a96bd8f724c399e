//! Crawl orchestration: worker loops and the periodic maintenance tasks.
//!
//! Workers are symmetric; each repeatedly pulls a batch of candidates from
//! the database, probes them one by one, and reports the outcomes back. All
//! coordination happens through [`AddrDb`]; workers never talk to each other.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

use crate::db::{unix_now, AddrDb};
use crate::dns::DnsServer;
use crate::netaddr::{Endpoint, DEFAULT_PORT, NODE_NETWORK};
use crate::probe::ProbeClient;
use crate::wire::SeenAddress;

/// Candidates a worker pulls per round.
const BATCH_SIZE: usize = 16;

/// Gossip is requested only from peers we have not harvested for this long.
const GOSSIP_STALE_SECS: u64 = 24 * 3600;

/// Interval between seed hostname re-resolutions.
const SEED_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Interval between stats lines.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// One crawler worker. `workers` scales the idle jitter so a large fleet
/// does not stampede the database the moment candidates reappear.
pub async fn crawler_worker(db: AddrDb, client: ProbeClient, workers: usize) {
    loop {
        let (candidates, wait_hint) = db.get_many(BATCH_SIZE);
        if candidates.is_empty() {
            let jitter = rand::thread_rng().gen_range(0..=500 * workers as u64);
            tokio::time::sleep(Duration::from_millis(wait_hint * 1000 + jitter)).await;
            continue;
        }
        for cand in candidates {
            let want_gossip = wants_gossip(cand.our_last_success, unix_now());
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
    }
}

fn wants_gossip(our_last_success: u64, now: u64) -> bool {
    our_last_success + GOSSIP_STALE_SECS < now
}

/// Resolve the configured seed hostnames once and force-add every result.
pub async fn resolve_seeds(db: &AddrDb, seeds: &[String]) {
    let now = unix_now();
    for seed in seeds {
        match lookup_host((seed.as_str(), DEFAULT_PORT)).await {
            Ok(addrs) => {
                let mut n = 0;
                for sa in addrs {
                    db.add(
                        SeenAddress {
                            timestamp: now as u32,
                            services: NODE_NETWORK,
                            endpoint: Endpoint::from(sa),
                        },
                        true,
                    );
                    n += 1;
                }
                debug!(seed = %seed, resolved = n, "seed hostname resolved");
            }
            Err(e) => warn!(seed = %seed, error = %e, "seed resolution failed"),
        }
    }
}

/// Re-resolves the seed hostnames forever; keeps the database primed even if
/// it empties out after a long outage.
pub async fn seeder_task(db: AddrDb, seeds: Vec<String>) {
    loop {
        resolve_seeds(&db, &seeds).await;
        tokio::time::sleep(SEED_INTERVAL).await;
    }
}

/// One-shot bootstrap from an operator-specified node: probe it for gossip
/// and feed everything it knows into the database.
pub async fn load_from_node(db: &AddrDb, client: &ProbeClient, ep: Endpoint) {
    info!(endpoint = %ep, "bootstrapping from node");
    let outcome = client.probe(ep, true).await;
    if !outcome.success {
        warn!(endpoint = %ep, "bootstrap node did not complete a handshake");
    }
    if outcome.addrs.is_empty() {
        warn!(endpoint = %ep, "bootstrap node returned no addresses");
    } else {
        info!(endpoint = %ep, count = outcome.addrs.len(), "bootstrap addresses received");
        db.add_many(&outcome.addrs, false);
    }
}

/// Periodic one-line status: database composition plus DNS counters.
pub async fn stats_task(db: AddrDb, dns: Option<Arc<DnsServer>>) {
    loop {
        tokio::time::sleep(STATS_INTERVAL).await;
        let s = db.stats();
        match &dns {
            Some(server) => info!(
                good = s.good,
                tracked = s.tracked,
                new = s.new,
                avail = s.avail,
                banned = s.banned,
                age_secs = s.age,
                dns_requests = server.requests(),
                dns_db_queries = server.db_queries(),
                "status"
            ),
            None => info!(
                good = s.good,
                tracked = s.tracked,
                new = s.new,
                avail = s.avail,
                banned = s.banned,
                age_secs = s.age,
                "status"
            ),
        }
    }
}
