//! DNS responder: hand-written codec plus a read-through answer cache.
//!
//! The codec is deliberately minimal and allocation-light: parse exactly one
//! question out of a datagram, build a response with compression pointers
//! back to that question. Everything is bounds-checked and every failure is a
//! value; a hostile datagram can produce at worst an error response or
//! silence, never a panic.
//!
//! Query names follow the seeder convention: the bare service hostname
//! answers with default-flag peers, and `x{hex}.{host}` applies a service
//! flag filter when the flag value is on the operator's whitelist. Answers
//! are drawn from a per-flag [`AnswerCache`] so a resolver storm does not
//! turn into a database read storm.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::db::{unix_now, AddrDb};
use crate::netaddr::{Endpoint, NetworkClass, NODE_NETWORK};

pub const QTYPE_A: u16 = 1;
pub const QTYPE_NS: u16 = 2;
pub const QTYPE_SOA: u16 = 6;
pub const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

/// TTL for address answers; short so resolvers rotate through the pool.
const DATA_TTL: u32 = 3600;

/// TTL for NS and SOA records.
const AUTHORITY_TTL: u32 = 40_000;

/// Classic UDP response budget; answers stop before crossing it.
const MAX_RESPONSE_SIZE: usize = 512;

/// Addresses fetched from the database on a cache refresh.
const CACHE_FETCH: usize = 1000;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTIMP: u8 = 4;
pub const RCODE_REFUSED: u8 = 5;

/// Why a datagram produced no normal answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFault {
    /// Too mangled (or a response) to answer at all; drop it.
    Ignore(&'static str),
    /// Reply with this rcode, echoing the transaction id.
    Respond(u8),
}

/// One parsed question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: u16,
    /// Lowercased, dot-joined name without the trailing dot.
    pub name: String,
    pub qtype: u16,
    /// Bytes the question section occupies, for echoing it back.
    pub question_len: usize,
}

/// Parse the single question out of a query datagram.
pub fn parse_query(data: &[u8]) -> Result<Question, QueryFault> {
    if data.len() < 12 {
        return Err(QueryFault::Ignore("datagram shorter than header"));
    }
    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    if flags & 0x8000 != 0 {
        return Err(QueryFault::Ignore("not a query"));
    }
    let opcode = (flags >> 11) & 0x0f;
    if opcode != 0 {
        return Err(QueryFault::Respond(RCODE_NOTIMP));
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    if qdcount != 1 {
        return Err(QueryFault::Respond(RCODE_FORMERR));
    }

    let mut pos = 12;
    let mut name = String::new();
    loop {
        let len = *data.get(pos).ok_or(QueryFault::Respond(RCODE_FORMERR))? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        // Compression pointers are not valid in queries we serve.
        if len > 63 {
            return Err(QueryFault::Respond(RCODE_FORMERR));
        }
        let label = data
            .get(pos..pos + len)
            .ok_or(QueryFault::Respond(RCODE_FORMERR))?;
        pos += len;
        if !name.is_empty() {
            name.push('.');
        }
        if name.len() + len > 255 {
            return Err(QueryFault::Respond(RCODE_FORMERR));
        }
        for &b in label {
            name.push(b.to_ascii_lowercase() as char);
        }
    }
    let qtype_bytes = data
        .get(pos..pos + 4)
        .ok_or(QueryFault::Respond(RCODE_FORMERR))?;
    let qtype = u16::from_be_bytes([qtype_bytes[0], qtype_bytes[1]]);
    let qclass = u16::from_be_bytes([qtype_bytes[2], qtype_bytes[3]]);
    if qclass != QCLASS_IN {
        return Err(QueryFault::Respond(RCODE_REFUSED));
    }
    Ok(Question {
        id,
        name,
        qtype,
        question_len: pos + 4 - 12,
    })
}

/// Encode `name` as uncompressed DNS labels.
fn encode_name(out: &mut Vec<u8>, name: &str) -> Result<()> {
    let name = name.trim_end_matches('.');
    if name.len() > 255 {
        bail!("name too long: {name}");
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            bail!("bad label in name: {name}");
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Builds a response in place; the question name is referenced via a
/// compression pointer to offset 12 where the echoed question starts.
struct ResponseBuilder {
    buf: Vec<u8>,
    answers: u16,
    authority: u16,
}

impl ResponseBuilder {
    fn new(id: u16, rcode: u8, question: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(MAX_RESPONSE_SIZE);
        push_u16(&mut buf, id);
        // QR=1, AA=1, everything else zero except the rcode.
        push_u16(&mut buf, 0x8400 | u16::from(rcode & 0x0f));
        push_u16(&mut buf, if question.is_empty() { 0 } else { 1 });
        push_u16(&mut buf, 0); // ancount, patched in finish()
        push_u16(&mut buf, 0); // nscount, patched in finish()
        push_u16(&mut buf, 0); // arcount
        buf.extend_from_slice(question);
        Self {
            buf,
            answers: 0,
            authority: 0,
        }
    }

    fn question_pointer(&mut self) {
        push_u16(&mut self.buf, 0xc00c);
    }

    fn would_exceed(&self, rdata_len: usize) -> bool {
        // pointer(2) + type(2) + class(2) + ttl(4) + rdlength(2) + rdata
        self.buf.len() + 12 + rdata_len > MAX_RESPONSE_SIZE
    }

    fn push_address(&mut self, ip: IpAddr) -> bool {
        let rdata_len = match ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        };
        if self.would_exceed(rdata_len) {
            return false;
        }
        self.question_pointer();
        match ip {
            IpAddr::V4(v4) => {
                push_u16(&mut self.buf, QTYPE_A);
                push_u16(&mut self.buf, QCLASS_IN);
                push_u32(&mut self.buf, DATA_TTL);
                push_u16(&mut self.buf, 4);
                self.buf.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                push_u16(&mut self.buf, QTYPE_AAAA);
                push_u16(&mut self.buf, QCLASS_IN);
                push_u32(&mut self.buf, DATA_TTL);
                push_u16(&mut self.buf, 16);
                self.buf.extend_from_slice(&v6.octets());
            }
        }
        self.answers += 1;
        true
    }

    fn push_ns(&mut self, ns: &str, authority: bool) -> Result<()> {
        let mut rdata = Vec::new();
        encode_name(&mut rdata, ns)?;
        // A full answer section wins over the trailing authority record.
        if self.would_exceed(rdata.len()) {
            return Ok(());
        }
        self.question_pointer();
        push_u16(&mut self.buf, QTYPE_NS);
        push_u16(&mut self.buf, QCLASS_IN);
        push_u32(&mut self.buf, AUTHORITY_TTL);
        push_u16(&mut self.buf, rdata.len() as u16);
        self.buf.extend_from_slice(&rdata);
        if authority {
            self.authority += 1;
        } else {
            self.answers += 1;
        }
        Ok(())
    }

    fn push_soa(&mut self, ns: &str, mbox: &str, serial: u32, authority: bool) -> Result<()> {
        let mut rdata = Vec::new();
        encode_name(&mut rdata, ns)?;
        encode_name(&mut rdata, mbox)?;
        push_u32(&mut rdata, serial);
        push_u32(&mut rdata, 604_800); // refresh
        push_u32(&mut rdata, 86_400); // retry
        push_u32(&mut rdata, 2_592_000); // expire
        push_u32(&mut rdata, 604_800); // minimum
        if self.would_exceed(rdata.len()) {
            return Ok(());
        }
        self.question_pointer();
        push_u16(&mut self.buf, QTYPE_SOA);
        push_u16(&mut self.buf, QCLASS_IN);
        push_u32(&mut self.buf, AUTHORITY_TTL);
        push_u16(&mut self.buf, rdata.len() as u16);
        self.buf.extend_from_slice(&rdata);
        if authority {
            self.authority += 1;
        } else {
            self.answers += 1;
        }
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        self.buf[6..8].copy_from_slice(&self.answers.to_be_bytes());
        self.buf[8..10].copy_from_slice(&self.authority.to_be_bytes());
        self.buf
    }
}

// ============================================================================
// Answer cache
// ============================================================================

struct CacheEntry {
    ips: Vec<Endpoint>,
    fetched_at: u64,
    hits: u64,
}

/// Per-flag read-through cache over [`AddrDb::get_ips`]. A refresh happens
/// when the hit count is large relative to the cache size, or the cache is
/// older than a few seconds and moderately hit. Small caches (early in a
/// crawl) thereby refresh almost every query, large ones only rarely.
pub struct AnswerCache {
    db: AddrDb,
    entries: Mutex<HashMap<u64, CacheEntry>>,
    db_queries: AtomicU64,
}

impl AnswerCache {
    pub fn new(db: AddrDb) -> Self {
        Self {
            db,
            entries: Mutex::new(HashMap::new()),
            db_queries: AtomicU64::new(0),
        }
    }

    /// Database fetches performed so far, for the stats task.
    pub fn db_queries(&self) -> u64 {
        self.db_queries.load(Ordering::Relaxed)
    }

    /// Addresses for `flags`, refreshed per the hit/age policy.
    pub fn lookup(&self, flags: u64) -> Vec<Endpoint> {
        let now = unix_now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(flags).or_insert(CacheEntry {
            ips: Vec::new(),
            fetched_at: 0,
            hits: 0,
        });
        entry.hits += 1;
        let size = entry.ips.len() as u64;
        let age = now.saturating_sub(entry.fetched_at);
        if entry.hits * 400 > size * size || (entry.hits * entry.hits * 20 > size && age > 5) {
            entry.ips = self.db.get_ips(flags, CACHE_FETCH, true, true);
            entry.fetched_at = now;
            entry.hits = 0;
            self.db_queries.fetch_add(1, Ordering::Relaxed);
        }
        entry.ips.clone()
    }
}

// ============================================================================
// Responder
// ============================================================================

/// Configuration and state shared by all responder tasks.
pub struct DnsServer {
    host: String,
    ns: String,
    mbox: String,
    /// Service flag values the `x{hex}` subdomain may request.
    whitelist: HashSet<u64>,
    cache: AnswerCache,
    requests: AtomicU64,
}

impl DnsServer {
    pub fn new(
        host: &str,
        ns: &str,
        mbox: &str,
        whitelist: HashSet<u64>,
        db: AddrDb,
    ) -> Result<Self> {
        // Validate once so response building cannot fail on our own names.
        let mut scratch = Vec::new();
        for name in [host, ns, mbox] {
            scratch.clear();
            encode_name(&mut scratch, name)?;
        }
        Ok(Self {
            host: host.trim_end_matches('.').to_ascii_lowercase(),
            ns: ns.to_owned(),
            mbox: mbox.to_owned(),
            whitelist,
            cache: AnswerCache::new(db),
            requests: AtomicU64::new(0),
        })
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn db_queries(&self) -> u64 {
        self.cache.db_queries()
    }

    /// Resolve a queried name against the configured host. Returns the
    /// service flags to filter by, or `None` for names we do not serve.
    fn flags_for_name(&self, name: &str) -> Option<u64> {
        if name == self.host {
            return Some(NODE_NETWORK);
        }
        let sub = name.strip_suffix(&self.host)?.strip_suffix('.')?;
        let hexpart = sub.strip_prefix('x')?;
        if hexpart.is_empty() || sub.contains('.') {
            return None;
        }
        let flags = u64::from_str_radix(hexpart, 16).ok()?;
        self.whitelist.contains(&flags).then_some(flags)
    }

    /// Handle one datagram; `None` means drop it silently.
    pub fn handle(&self, data: &[u8]) -> Option<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let q = match parse_query(data) {
            Ok(q) => q,
            Err(QueryFault::Ignore(why)) => {
                trace!(why, "ignoring datagram");
                return None;
            }
            Err(QueryFault::Respond(rcode)) => {
                let id = u16::from_be_bytes([data[0], data[1]]);
                return Some(ResponseBuilder::new(id, rcode, &[]).finish());
            }
        };
        let question = &data[12..12 + q.question_len];

        let Some(flags) = self.flags_for_name(&q.name) else {
            let mut b = ResponseBuilder::new(q.id, RCODE_NXDOMAIN, question);
            if self.push_soa_authority(&mut b).is_err() {
                return Some(ResponseBuilder::new(q.id, RCODE_SERVFAIL, &[]).finish());
            }
            return Some(b.finish());
        };

        let mut b = ResponseBuilder::new(q.id, RCODE_NOERROR, question);
        let built = match q.qtype {
            QTYPE_NS => b.push_ns(&self.ns, false),
            QTYPE_SOA => self.push_soa(&mut b, false),
            QTYPE_A | QTYPE_AAAA => {
                self.push_addresses(&mut b, flags, q.qtype);
                if b.answers == 0 {
                    self.push_soa_authority(&mut b)
                } else {
                    b.push_ns(&self.ns, true)
                }
            }
            _ => self.push_soa_authority(&mut b),
        };
        if built.is_err() {
            return Some(ResponseBuilder::new(q.id, RCODE_SERVFAIL, &[]).finish());
        }
        Some(b.finish())
    }

    fn push_soa(&self, b: &mut ResponseBuilder, authority: bool) -> Result<()> {
        // Hourly serial is plenty for a zone that only ever changes answers.
        let serial = (unix_now() / 3600) as u32;
        b.push_soa(&self.ns, &self.mbox, serial, authority)
    }

    fn push_soa_authority(&self, b: &mut ResponseBuilder) -> Result<()> {
        self.push_soa(b, true)
    }

    fn push_addresses(&self, b: &mut ResponseBuilder, flags: u64, qtype: u16) {
        let pool: Vec<IpAddr> = self
            .cache
            .lookup(flags)
            .into_iter()
            .filter(|ep| match qtype {
                QTYPE_A => ep.network_class() == NetworkClass::Ipv4,
                _ => matches!(ep.network_class(), NetworkClass::Ipv6 | NetworkClass::Onion),
            })
            .map(|ep| ep.ip())
            .collect();
        if pool.is_empty() {
            return;
        }
        // Rotate through the pool from a random offset so consecutive
        // queries see different peers even while the cache is warm.
        let start = rand::thread_rng().gen_range(0..pool.len());
        for i in 0..pool.len() {
            if !b.push_address(pool[(start + i) % pool.len()]) {
                break;
            }
        }
    }
}

/// One responder task; `n` of these share the socket and the server state.
pub async fn responder_task(socket: Arc<UdpSocket>, server: Arc<DnsServer>) {
    let mut buf = [0u8; 1500];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                continue;
            }
        };
        if let Some(response) = server.handle(&buf[..len]) {
            if let Err(e) = socket.send_to(&response, from).await {
                debug!(error = %e, peer = %from, "udp send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::unix_now;
    use crate::wire::SeenAddress;

    fn server_with_peers(peers: &[&str]) -> DnsServer {
        let db = AddrDb::new();
        let now = unix_now();
        for p in peers {
            db.add(
                SeenAddress {
                    timestamp: now as u32,
                    services: NODE_NETWORK,
                    endpoint: p.parse().expect("valid endpoint"),
                },
                false,
            );
            let cand = db.get().expect("candidate");
            db.good(cand.endpoint, 70015, String::new(), 0);
        }
        DnsServer::new(
            "seed.example.com",
            "ns.example.com",
            "admin.example.com",
            HashSet::from([1u64, 5, 21]),
            db,
        )
        .expect("valid server config")
    }

    fn build_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut q = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        encode_name(&mut q, name).expect("encodable");
        push_u16(&mut q, qtype);
        push_u16(&mut q, QCLASS_IN);
        q
    }

    fn rcode_of(response: &[u8]) -> u8 {
        response[3] & 0x0f
    }

    fn ancount_of(response: &[u8]) -> u16 {
        u16::from_be_bytes([response[6], response[7]])
    }

    #[test]
    fn parse_well_formed_question() {
        let q = build_query("Seed.Example.COM", QTYPE_A);
        let parsed = parse_query(&q).expect("parses");
        assert_eq!(parsed.id, 0x1234);
        assert_eq!(parsed.name, "seed.example.com", "name is lowercased");
        assert_eq!(parsed.qtype, QTYPE_A);
    }

    #[test]
    fn parse_rejects_short_and_response_datagrams() {
        assert_eq!(
            parse_query(&[0u8; 5]),
            Err(QueryFault::Ignore("datagram shorter than header"))
        );
        let mut q = build_query("seed.example.com", QTYPE_A);
        q[2] |= 0x80; // QR bit: a response, not a query
        assert!(matches!(parse_query(&q), Err(QueryFault::Ignore(_))));
    }

    #[test]
    fn parse_rejects_oversized_label() {
        let mut q = vec![0, 1, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        q.push(70); // label length > 63
        q.extend_from_slice(&[b'a'; 70]);
        q.push(0);
        push_u16(&mut q, QTYPE_A);
        push_u16(&mut q, QCLASS_IN);
        assert_eq!(parse_query(&q), Err(QueryFault::Respond(RCODE_FORMERR)));
    }

    #[test]
    fn a_query_answers_with_v4_peers() {
        let server = server_with_peers(&["1.2.3.4:8333", "5.6.7.8:8333", "9.9.9.9:8333"]);
        let resp = server
            .handle(&build_query("seed.example.com", QTYPE_A))
            .expect("response");
        assert_eq!(rcode_of(&resp), RCODE_NOERROR);
        assert!(ancount_of(&resp) >= 1);
    }

    #[test]
    fn aaaa_query_excludes_v4_peers() {
        let server = server_with_peers(&["1.2.3.4:8333", "5.6.7.8:8333", "7.7.7.7:8333"]);
        let resp = server
            .handle(&build_query("seed.example.com", QTYPE_AAAA))
            .expect("response");
        assert_eq!(rcode_of(&resp), RCODE_NOERROR);
        assert_eq!(ancount_of(&resp), 0, "no v6 peers available");
    }

    #[test]
    fn unknown_name_is_nxdomain() {
        let server = server_with_peers(&["1.2.3.4:8333"]);
        let resp = server
            .handle(&build_query("other.example.com", QTYPE_A))
            .expect("response");
        assert_eq!(rcode_of(&resp), RCODE_NXDOMAIN);
    }

    #[test]
    fn flag_subdomain_whitelist() {
        let server = server_with_peers(&["1.2.3.4:8333"]);
        assert_eq!(server.flags_for_name("x1.seed.example.com"), Some(1));
        assert_eq!(server.flags_for_name("x5.seed.example.com"), Some(5));
        assert_eq!(server.flags_for_name("x15.seed.example.com"), Some(21));
        // 0x9 is not whitelisted; neither are malformed subdomains.
        assert_eq!(server.flags_for_name("x9.seed.example.com"), None);
        assert_eq!(server.flags_for_name("x.seed.example.com"), None);
        assert_eq!(server.flags_for_name("y1.seed.example.com"), None);
        assert_eq!(server.flags_for_name("x1.x2.seed.example.com"), None);
    }

    #[test]
    fn ns_and_soa_queries_answer() {
        let server = server_with_peers(&[]);
        let resp = server
            .handle(&build_query("seed.example.com", QTYPE_NS))
            .expect("response");
        assert_eq!(rcode_of(&resp), RCODE_NOERROR);
        assert_eq!(ancount_of(&resp), 1);

        let resp = server
            .handle(&build_query("seed.example.com", QTYPE_SOA))
            .expect("response");
        assert_eq!(rcode_of(&resp), RCODE_NOERROR);
        assert_eq!(ancount_of(&resp), 1);
    }

    #[test]
    fn response_stays_under_size_budget() {
        let peers: Vec<String> = (0..200)
            .map(|i| format!("8.{}.{}.{}:8333", (i / 64) + 1, (i / 8) % 8 + 1, i % 8 + 1))
            .collect();
        let refs: Vec<&str> = peers.iter().map(String::as_str).collect();
        let server = server_with_peers(&refs);
        let resp = server
            .handle(&build_query("seed.example.com", QTYPE_A))
            .expect("response");
        assert!(resp.len() <= MAX_RESPONSE_SIZE);
        assert!(ancount_of(&resp) >= 1);
    }

    #[test]
    fn cache_counts_db_queries() {
        let server = server_with_peers(&["1.2.3.4:8333"]);
        let before = server.db_queries();
        let _ = server.handle(&build_query("seed.example.com", QTYPE_A));
        assert!(server.db_queries() > before, "cold cache must hit the db");
        assert_eq!(server.requests(), 1);
    }
}
