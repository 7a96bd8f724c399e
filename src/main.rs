use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use peerseed::crawler;
use peerseed::db::AddrDb;
use peerseed::dns::{responder_task, DnsServer};
use peerseed::netaddr::Endpoint;
use peerseed::probe::{ProbeClient, ProxyConfig};
use peerseed::store;

#[derive(Parser, Debug)]
#[command(name = "peerseed")]
#[command(author, version, about = "Crawling DNS seeder for Bitcoin-style p2p networks", long_about = None)]
struct Args {
    /// Hostname of the seed zone served over DNS (e.g. seed.example.com)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Hostname of this nameserver; without it the DNS responder is disabled
    #[arg(short, long)]
    ns: Option<String>,

    /// Operator contact for SOA records, dots instead of '@'
    #[arg(short, long)]
    mbox: Option<String>,

    /// Number of crawler workers
    #[arg(short, long, default_value_t = 96)]
    threads: usize,

    /// Number of DNS responder tasks sharing the socket
    #[arg(short, long, default_value_t = 4)]
    dnsthreads: usize,

    /// UDP port to answer DNS queries on
    #[arg(short, long, default_value_t = 53)]
    port: u16,

    /// SOCKS5 proxy for .onion endpoints (without it they are skipped)
    #[arg(short, long)]
    onion: Option<SocketAddr>,

    /// SOCKS5 proxy for IPv4 endpoints
    #[arg(short = 'i', long)]
    proxy_ipv4: Option<SocketAddr>,

    /// SOCKS5 proxy for IPv6 endpoints
    #[arg(short = 'k', long)]
    proxy_ipv6: Option<SocketAddr>,

    /// Node to pull an initial address dump from at startup
    #[arg(short, long)]
    seednode: Option<Endpoint>,

    /// Seed hostname re-resolved every 30 minutes (repeatable)
    #[arg(long = "seed", value_name = "HOSTNAME")]
    seeds: Vec<String>,

    /// Service-flag values allowed in x{hex} filter subdomains
    #[arg(short = 'w', long = "filter", value_delimiter = ',', default_values_t = [1u64, 5, 21])]
    filter: Vec<u64>,

    /// Forget all bans on startup
    #[arg(long)]
    wipeban: bool,

    /// Forget all ignore cool-downs on startup
    #[arg(long)]
    wipeignore: bool,

    /// Binary state snapshot file
    #[arg(long, default_value = "peerseed.dat")]
    dbfile: PathBuf,

    /// Human-readable per-address report file
    #[arg(long, default_value = "peerseed.dump")]
    dumpfile: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let db = AddrDb::new();
    store::load(&db, &args.dbfile, args.wipeban, args.wipeignore)?;

    let client = ProbeClient {
        proxies: ProxyConfig {
            ipv4: args.proxy_ipv4,
            ipv6: args.proxy_ipv6,
            onion: args.onion,
        },
        user_agent: "/peerseed:0.1/".to_string(),
        best_height: 0,
    };

    if let Some(node) = args.seednode {
        crawler::load_from_node(&db, &client, node).await;
    }

    let dns_server = match (&args.ns, &args.host, &args.mbox) {
        (Some(ns), Some(host), Some(mbox)) => {
            let whitelist: HashSet<u64> = args.filter.iter().copied().collect();
            let server = Arc::new(DnsServer::new(host, ns, mbox, whitelist, db.clone())?);
            let socket = UdpSocket::bind(("0.0.0.0", args.port))
                .await
                .with_context(|| format!("binding udp port {}", args.port))?;
            let socket = Arc::new(socket);
            info!(host = %host, ns = %ns, port = args.port, tasks = args.dnsthreads, "dns responder up");
            for _ in 0..args.dnsthreads {
                tokio::spawn(responder_task(socket.clone(), server.clone()));
            }
            Some(server)
        }
        (Some(_), _, _) => bail!("--ns also requires --host and --mbox"),
        (None, _, _) => {
            warn!("no --ns configured, DNS responder disabled, crawling only");
            None
        }
    };

    if args.seeds.is_empty() && db.stats().avail == 0 && args.seednode.is_none() {
        warn!("database is empty and no --seed or --seednode given; nothing to crawl");
    }
    if !args.seeds.is_empty() {
        tokio::spawn(crawler::seeder_task(db.clone(), args.seeds.clone()));
    }

    info!(workers = args.threads, "starting crawler");
    for _ in 0..args.threads {
        tokio::spawn(crawler::crawler_worker(
            db.clone(),
            client.clone(),
            args.threads,
        ));
    }

    tokio::spawn(crawler::stats_task(db.clone(), dns_server));
    tokio::spawn(store::dump_task(
        db.clone(),
        args.dbfile.clone(),
        args.dumpfile.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, writing final snapshot");
    store::dump_once(&db, &args.dbfile, &args.dumpfile).await;
    Ok(())
}
