//! # Peerseed - Crawling DNS Seeder
//!
//! Peerseed discovers and scores peers of a Bitcoin-style p2p network and
//! serves the healthy ones over DNS:
//!
//! - **Crawler**: a fleet of workers runs the version/verack handshake
//!   against candidate peers and harvests their address gossip
//! - **Reputation**: every endpoint carries exponentially time-decayed
//!   reliability windows (2h/8h/1d/1w/1m) feeding good/ban/ignore policies
//! - **DNS**: A/AAAA/NS/SOA answers for the seed hostname, with optional
//!   service-flag filters via `x{hex}` subdomains
//! - **Persistence**: periodic atomic snapshots plus a human-readable report
//!
//! ## Architecture
//!
//! All shared state lives in one [`AddrDb`] handle, cheap to clone across
//! tasks. Crawl workers, the DNS responders, and the maintenance tasks are
//! plain tokio tasks coordinating only through that handle; reads (DNS
//! sampling, stats) proceed concurrently with crawl mutations.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `netaddr` | Endpoint type, network classes, routability rules |
//! | `db` | Address database: decayed statistics, policies, sampling |
//! | `wire` | Bitcoin wire codec (version/verack/getaddr/addr subset) |
//! | `probe` | Single-peer probe: connect (direct or SOCKS5), handshake |
//! | `crawler` | Worker loops, seed re-resolution, stats |
//! | `dns` | DNS codec, UDP responders, read-through answer cache |
//! | `store` | Snapshot save/load and the periodic dump task |

pub mod crawler;
pub mod db;
pub mod dns;
pub mod netaddr;
pub mod probe;
pub mod store;
pub mod wire;

pub use db::{AddrDb, DbStats};
pub use netaddr::{Endpoint, NetworkClass};
pub use probe::{ProbeClient, ProbeOutcome, ProxyConfig};
