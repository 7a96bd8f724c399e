//! Address database and reputation engine.
//!
//! Owns every known endpoint and all the policy around it. Each endpoint is
//! in exactly one of three states:
//!
//! ```text
//!              seen endpoints
//!             /              \
//!     banned endpoints    tracked + unknown
//!                         /               \
//!                  tracked (tried)    unknown (never tried)
//!                 /              \
//!          good endpoints    not-good endpoints
//! ```
//!
//! Records are keyed by a stable integer id; the index structures (`our_ids`
//! retry queue, `unk_ids`, `good_ids`) hold only ids, so endpoint data lives
//! in one place. Callers reference endpoints by value and mutate state only
//! through [`AddrDb`] methods.
//!
//! Reliability is tracked per record in five exponentially time-decayed
//! windows (2h/8h/1d/1w/1m). Short windows react fast to an endpoint going
//! dark; long windows keep one bad hour from erasing months of good
//! behavior. Each window is O(1) space: no history is stored.
//!
//! Locking: one `RwLock` around the whole inner state. Mutators take the
//! write lock; `get_ips`/`stats`/`report_all` take the read lock so DNS
//! sampling runs concurrently with crawling. The lock is never held across
//! I/O or `.await`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::netaddr::{Endpoint, NetworkClass, DEFAULT_PORT, NODE_NETWORK};
use crate::wire::SeenAddress;

/// Minimum interval before a tracked endpoint is retried.
pub const MIN_RETRY_SECS: u64 = 1000;

/// Wait hint handed out when the database has nothing at all to offer.
const EMPTY_WAIT_SECS: u64 = 5;

/// Reported client versions below this are banned as incompatible.
const REQUIRE_VERSION: i32 = 31900;

/// Ban applied to incompatible client versions.
const OLD_CLIENT_BAN_SECS: u64 = 30 * 86400;

/// Decay time constants of the five reliability windows, in seconds.
const WINDOW_TAU_SECS: [f64; 5] = [
    2.0 * 3600.0,
    8.0 * 3600.0,
    24.0 * 3600.0,
    7.0 * 86400.0,
    30.0 * 86400.0,
];

/// Per-window `(min reliability ratio, min sample count)` bars for
/// [`AddrInfo::is_good`]. Longer windows are judged more strictly on samples
/// but more leniently on the ratio.
const WINDOW_GOOD_BARS: [(f64, f64); 5] = [
    (0.85, 2.0),
    (0.70, 4.0),
    (0.55, 8.0),
    (0.45, 16.0),
    (0.35, 32.0),
];

/// `(window index, failure bar, min count, ban seconds)` rows for the
/// statistics-driven ban policy. The bar is on `reliability - weight + 1`;
/// lower means a worse effective failure rate.
const BAN_BARS: [(usize, f64, f64, u64); 3] = [
    (4, 0.15, 32.0, 30 * 86400),
    (3, 0.10, 16.0, 7 * 86400),
    (2, 0.05, 8.0, 86400),
];

/// `(window index, failure bar, min count, ignore seconds)` rows for the
/// graduated cool-down policy.
const IGNORE_BARS: [(usize, f64, f64, u64); 5] = [
    (4, 0.20, 2.0, 10 * 86400),
    (3, 0.20, 2.0, 5 * 86400),
    (2, 0.20, 2.0, 2 * 86400),
    (1, 0.20, 2.0, 86400),
    (0, 0.20, 2.0, 4 * 3600),
];

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Decayed statistics
// ============================================================================

/// One exponentially time-decayed observation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AddrStat {
    pub weight: f64,
    pub count: f64,
    pub reliability: f64,
}

impl AddrStat {
    /// Fold in one observation, `age` seconds after the previous own attempt.
    fn update(&mut self, good: bool, age: f64, tau: f64) {
        let f = (-age / tau).exp();
        self.reliability = self.reliability * f + if good { 1.0 - f } else { 0.0 };
        self.count = self.count * f + 1.0;
        self.weight = self.weight * f + (1.0 - f);
    }

    /// Weight-normalized success ratio in [0, 1].
    fn ratio(&self) -> f64 {
        if self.weight > 1e-9 {
            self.reliability / self.weight
        } else {
            0.0
        }
    }

    /// True when the effective failure rate exceeds `1 - bar` with enough
    /// samples; `reliability - weight + 1` shrinks toward 0 as failures pile
    /// up within the window.
    fn fails_bar(&self, bar: f64, min_count: f64) -> bool {
        self.reliability - self.weight + 1.0 < bar && self.count > min_count
    }
}

// ============================================================================
// Address record
// ============================================================================

/// Everything known about one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrInfo {
    pub endpoint: Endpoint,
    pub services: u64,
    /// Last time anyone (us or gossip) claims to have seen it.
    pub last_try: u64,
    /// Last time we attempted it ourselves.
    pub our_last_try: u64,
    pub our_last_success: u64,
    /// Soft cool-down: skipped by selection until this passes.
    pub ignore_till: u64,
    pub stats: [AddrStat; 5],
    pub total: u64,
    pub success: u64,
    pub client_version: i32,
    pub client_subversion: String,
    pub blocks: i32,
}

impl AddrInfo {
    fn new(endpoint: Endpoint, services: u64, last_try: u64) -> Self {
        Self {
            endpoint,
            services,
            last_try,
            our_last_try: 0,
            our_last_success: 0,
            ignore_till: 0,
            stats: [AddrStat::default(); 5],
            total: 0,
            success: 0,
            client_version: 0,
            client_subversion: String::new(),
            blocks: 0,
        }
    }

    /// Fold one probe outcome into every window and the lifetime counters.
    fn update(&mut self, good: bool, now: u64) {
        let age = now.saturating_sub(self.our_last_try) as f64;
        for (stat, tau) in self.stats.iter_mut().zip(WINDOW_TAU_SECS) {
            stat.update(good, age, tau);
        }
        self.last_try = now;
        self.our_last_try = now;
        self.total += 1;
        if good {
            self.success += 1;
            self.our_last_success = now;
        }
        debug_assert!(self.success <= self.total);
    }

    /// Eligibility for being handed out over DNS.
    pub fn is_good(&self) -> bool {
        if self.endpoint.port() != DEFAULT_PORT {
            return false;
        }
        if self.services & NODE_NETWORK == 0 {
            return false;
        }
        if !self.endpoint.is_routable() {
            return false;
        }
        if self.client_version != 0 && self.client_version < REQUIRE_VERSION {
            return false;
        }
        // Grace period: a brand-new address is not nuked by one bad probe.
        if self.total <= 3 {
            return self.success * 2 >= self.total;
        }
        self.stats
            .iter()
            .zip(WINDOW_GOOD_BARS)
            .any(|(stat, (bar, min_count))| stat.ratio() > bar && stat.count > min_count)
    }

    /// Statistics- and version-driven ban duration; 0 means no ban. Strictly
    /// more severe than failing [`Self::is_good`].
    pub fn get_ban_time(&self) -> u64 {
        if self.is_good() {
            return 0;
        }
        if self.client_version != 0 && self.client_version < REQUIRE_VERSION {
            return OLD_CLIENT_BAN_SECS;
        }
        for (idx, bar, min_count, ban) in BAN_BARS {
            if self.stats[idx].fails_bar(bar, min_count) {
                return ban;
            }
        }
        0
    }

    /// Graduated cool-down for persistently mediocre endpoints; 0 means none.
    pub fn get_ignore_time(&self) -> u64 {
        if self.is_good() {
            return 0;
        }
        for (idx, bar, min_count, ignore) in IGNORE_BARS {
            if self.stats[idx].fails_bar(bar, min_count) {
                return ignore;
            }
        }
        0
    }

    /// Not worth keeping across a reload: a month of solid failure without
    /// having crossed a ban bar.
    fn is_terrible(&self) -> bool {
        !self.is_good() && self.stats[4].fails_bar(0.20, 32.0)
    }
}

// ============================================================================
// Database
// ============================================================================

/// One crawl candidate handed to a worker.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub endpoint: Endpoint,
    pub our_last_success: u64,
}

/// Counters snapshot for the stats task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    pub banned: usize,
    pub avail: usize,
    pub tracked: usize,
    pub new: usize,
    pub good: usize,
    /// Seconds since the oldest tracked entry was last attempted.
    pub age: u64,
}

/// One row of the human-readable dump.
#[derive(Debug, Clone)]
pub struct AddrReport {
    pub endpoint: Endpoint,
    pub good: bool,
    pub last_success: u64,
    pub uptime: [f64; 5],
    pub blocks: i32,
    pub services: u64,
    pub client_version: i32,
    pub client_subversion: String,
}

#[derive(Default)]
struct AddrDbInner {
    next_id: u32,
    id_to_info: HashMap<u32, AddrInfo>,
    ip_to_id: HashMap<Endpoint, u32>,
    /// Tracked ids in retry order: front = longest since last own attempt.
    our_ids: VecDeque<u32>,
    /// Never-tried ids; ordered by id, so first = oldest, last = newest.
    unk_ids: BTreeSet<u32>,
    good_ids: BTreeSet<u32>,
    banned: HashMap<Endpoint, u64>,
    n_dirty: u64,
}

/// Cloneable handle to the shared address database.
#[derive(Clone, Default)]
pub struct AddrDb {
    inner: Arc<RwLock<AddrDbInner>>,
}

impl AddrDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation of `addr`. Non-routable endpoints are dropped
    /// unless `force` (operator-pinned seeds get through regardless).
    pub fn add(&self, addr: SeenAddress, force: bool) {
        self.write().add_one(addr, force, unix_now());
    }

    pub fn add_many(&self, addrs: &[SeenAddress], force: bool) {
        let now = unix_now();
        let mut inner = self.write();
        for addr in addrs {
            inner.add_one(*addr, force, now);
        }
    }

    /// Select up to `max` crawl candidates. On an empty pool the second
    /// element is a wait hint in seconds before retrying.
    pub fn get_many(&self, max: usize) -> (Vec<Candidate>, u64) {
        self.write().get_many(max, unix_now())
    }

    /// Single-candidate form of [`Self::get_many`].
    pub fn get(&self) -> Result<Candidate, u64> {
        let (mut got, wait) = self.get_many(1);
        got.pop().ok_or(wait)
    }

    /// Report a successful probe with the peer's handshake metadata.
    pub fn good(&self, ep: Endpoint, client_version: i32, client_subversion: String, blocks: i32) {
        self.write()
            .good(ep, client_version, client_subversion, blocks, unix_now());
    }

    /// Report a failed probe. `ban_secs` > 0 forces a ban; the policy-derived
    /// ban time is applied on top, whichever is longer.
    pub fn bad(&self, ep: Endpoint, ban_secs: u64) {
        self.write().bad(ep, ban_secs, unix_now());
    }

    /// Return a candidate unprobed (its crawl slot was spent elsewhere).
    pub fn skipped(&self, ep: Endpoint) {
        self.write().skipped(ep);
    }

    /// Sample endpoints for DNS answers. `flags` restricts to endpoints
    /// advertising all the requested service bits; `want_v4`/`want_v6`
    /// restrict the address family.
    pub fn get_ips(&self, flags: u64, max: usize, want_v4: bool, want_v6: bool) -> Vec<Endpoint> {
        self.read().get_ips(flags, max, want_v4, want_v6)
    }

    pub fn stats(&self) -> DbStats {
        self.read().stats(unix_now())
    }

    pub fn report_all(&self) -> Vec<AddrReport> {
        self.read().report_all()
    }

    pub fn reset_ignores(&self) {
        let mut inner = self.write();
        for info in inner.id_to_info.values_mut() {
            info.ignore_till = 0;
        }
    }

    pub fn wipe_bans(&self) {
        self.write().banned.clear();
    }

    /// Number of mutations since the last [`Self::take_dirty`]; the
    /// persistence task skips a cycle when nothing changed.
    pub fn take_dirty(&self) -> u64 {
        let mut inner = self.write();
        std::mem::take(&mut inner.n_dirty)
    }

    /// Snapshot for persistence.
    pub fn to_saved(&self) -> SavedDb {
        self.read().to_saved()
    }

    /// Rebuild state from a persisted snapshot; see the loader rules on
    /// [`SavedDb`]. Returns (records kept, records discarded).
    pub fn load_saved(&self, saved: SavedDb) -> (usize, usize) {
        self.write().load_saved(saved, unix_now())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AddrDbInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AddrDbInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

enum Selected {
    Got(u32),
    /// Front of the retry queue was not yet eligible; raced with the count.
    NotReady,
    Empty {
        wait: u64,
    },
}

impl AddrDbInner {
    fn lookup(&self, ep: &Endpoint) -> Option<u32> {
        self.ip_to_id.get(ep).copied()
    }

    fn add_one(&mut self, addr: SeenAddress, force: bool, now: u64) {
        if !force && !addr.endpoint.is_routable() {
            return;
        }
        if let Some(&unban) = self.banned.get(&addr.endpoint) {
            // Re-admit only once the ban lapsed and the observation is newer.
            if force || (unban < now && u64::from(addr.timestamp) > unban) {
                self.banned.remove(&addr.endpoint);
            } else {
                return;
            }
        }
        if let Some(id) = self.lookup(&addr.endpoint) {
            if let Some(info) = self.id_to_info.get_mut(&id) {
                if u64::from(addr.timestamp) > info.last_try {
                    info.last_try = u64::from(addr.timestamp);
                }
                info.services |= addr.services;
                if force {
                    info.ignore_till = 0;
                }
            }
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.id_to_info.insert(
            id,
            AddrInfo::new(addr.endpoint, addr.services, u64::from(addr.timestamp)),
        );
        self.ip_to_id.insert(addr.endpoint, id);
        self.unk_ids.insert(id);
        self.n_dirty += 1;
    }

    /// Count of tracked entries currently past the retry interval. The queue
    /// is time-ordered, so eligibility is a moving prefix.
    fn eligible_tracked(&self, now: u64) -> usize {
        let mut n = 0;
        for id in &self.our_ids {
            match self.id_to_info.get(id) {
                Some(info) if now.saturating_sub(info.our_last_try) > MIN_RETRY_SECS => n += 1,
                Some(_) => break,
                None => n += 1, // stale id, let selection drop it
            }
        }
        n
    }

    fn select_one(&mut self, now: u64) -> Selected {
        let eligible = self.eligible_tracked(now);
        let tot = self.unk_ids.len() + eligible;
        if tot == 0 {
            let wait = match self.our_ids.front().and_then(|id| self.id_to_info.get(id)) {
                Some(info) => {
                    MIN_RETRY_SECS.saturating_sub(now.saturating_sub(info.our_last_try)).max(1)
                }
                None => EMPTY_WAIT_SECS,
            };
            return Selected::Empty { wait };
        }
        let rnd = rand::thread_rng().gen_range(0..tot);
        if rnd < self.unk_ids.len() {
            // Newest unknown entry by default (freshest gossip, most likely
            // alive); occasionally the oldest so stale entries do get tried.
            let id = if rand::thread_rng().gen_ratio(1, 10) {
                self.unk_ids.first().copied()
            } else {
                self.unk_ids.last().copied()
            };
            match id {
                Some(id) => {
                    self.unk_ids.remove(&id);
                    Selected::Got(id)
                }
                None => Selected::Empty { wait: EMPTY_WAIT_SECS },
            }
        } else {
            match self.our_ids.pop_front() {
                Some(id) => match self.id_to_info.get(&id) {
                    Some(info) if now.saturating_sub(info.our_last_try) > MIN_RETRY_SECS => {
                        Selected::Got(id)
                    }
                    Some(_) => {
                        self.our_ids.push_front(id);
                        Selected::NotReady
                    }
                    None => Selected::NotReady, // stale id dropped
                },
                None => Selected::Empty { wait: EMPTY_WAIT_SECS },
            }
        }
    }

    fn get_many(&mut self, max: usize, now: u64) -> (Vec<Candidate>, u64) {
        let mut out = Vec::new();
        let mut wait = 0;
        while out.len() < max {
            match self.select_one(now) {
                Selected::Got(id) => {
                    let Some(info) = self.id_to_info.get_mut(&id) else {
                        continue;
                    };
                    if info.ignore_till > now {
                        // Still cooling down: rotate to the back of the retry
                        // queue and pick something else.
                        info.our_last_try = now;
                        self.our_ids.push_back(id);
                        continue;
                    }
                    out.push(Candidate {
                        endpoint: info.endpoint,
                        our_last_success: info.our_last_success,
                    });
                    self.n_dirty += 1;
                }
                Selected::NotReady => break,
                Selected::Empty { wait: w } => {
                    wait = w;
                    break;
                }
            }
        }
        (out, wait)
    }

    fn good(&mut self, ep: Endpoint, client_version: i32, client_subversion: String, blocks: i32, now: u64) {
        let Some(id) = self.lookup(&ep) else { return };
        self.unk_ids.remove(&id);
        self.banned.remove(&ep);
        let Some(info) = self.id_to_info.get_mut(&id) else {
            return;
        };
        info.client_version = client_version;
        info.client_subversion = client_subversion;
        info.blocks = blocks;
        info.update(true, now);
        info.ignore_till = 0;
        if info.is_good() {
            self.good_ids.insert(id);
        } else {
            self.good_ids.remove(&id);
        }
        self.our_ids.push_back(id);
        self.n_dirty += 1;
    }

    fn bad(&mut self, ep: Endpoint, ban_secs: u64, now: u64) {
        let Some(id) = self.lookup(&ep) else { return };
        self.unk_ids.remove(&id);
        let Some(info) = self.id_to_info.get_mut(&id) else {
            return;
        };
        info.update(false, now);
        let ban = ban_secs.max(info.get_ban_time());
        if ban > 0 {
            debug!(endpoint = %ep, ban_secs = ban, "banning endpoint");
            self.banned.insert(ep, now + ban);
            self.ip_to_id.remove(&ep);
            self.good_ids.remove(&id);
            self.id_to_info.remove(&id);
        } else {
            let ignore = info.get_ignore_time();
            if ignore > 0 && info.ignore_till < now + ignore {
                info.ignore_till = now + ignore;
            }
            if !info.is_good() {
                self.good_ids.remove(&id);
            }
            self.our_ids.push_back(id);
        }
        self.n_dirty += 1;
    }

    fn skipped(&mut self, ep: Endpoint) {
        let Some(id) = self.lookup(&ep) else { return };
        self.unk_ids.remove(&id);
        self.our_ids.push_back(id);
    }

    fn get_ips(&self, flags: u64, max: usize, want_v4: bool, want_v6: bool) -> Vec<Endpoint> {
        let class_ok = |ep: &Endpoint| match ep.network_class() {
            NetworkClass::Ipv4 => want_v4,
            NetworkClass::Ipv6 | NetworkClass::Onion => want_v6,
        };

        if self.good_ids.is_empty() {
            // Cold start: hand out *something* so the responder is never
            // completely empty.
            let id = self
                .our_ids
                .front()
                .copied()
                .or_else(|| self.unk_ids.first().copied());
            return match id.and_then(|id| self.id_to_info.get(&id)) {
                Some(info) if class_ok(&info.endpoint) => vec![info.endpoint],
                _ => Vec::new(),
            };
        }

        // Never hand out more than half the good set in one answer.
        let max = max.min(self.good_ids.len() / 2).max(1);
        let (Some(&low), Some(&high)) = (self.good_ids.first(), self.good_ids.last()) else {
            return Vec::new();
        };

        // Range-bounded random probes mapped to the nearest good id at or
        // above the probe. Biased when ids cluster; cheap, and close enough
        // for answer sampling. Bounded retries in case max is unreachable.
        let mut rng = rand::thread_rng();
        let mut picked = BTreeSet::new();
        let mut tries = 0;
        while picked.len() < max && tries < max * 4 {
            tries += 1;
            let probe = rng.gen_range(low..=high);
            if let Some(&id) = self.good_ids.range(probe..).next() {
                picked.insert(id);
            }
        }

        picked
            .iter()
            .filter_map(|id| self.id_to_info.get(id))
            .filter(|info| info.services & flags == flags)
            .map(|info| info.endpoint)
            .filter(class_ok)
            .collect()
    }

    fn stats(&self, now: u64) -> DbStats {
        let age = self
            .our_ids
            .front()
            .and_then(|id| self.id_to_info.get(id))
            .map(|info| now.saturating_sub(info.our_last_try))
            .unwrap_or(0);
        DbStats {
            banned: self.banned.len(),
            avail: self.id_to_info.len(),
            tracked: self.our_ids.len(),
            new: self.unk_ids.len(),
            good: self.good_ids.len(),
            age,
        }
    }

    fn report_all(&self) -> Vec<AddrReport> {
        self.id_to_info
            .values()
            .map(|info| AddrReport {
                endpoint: info.endpoint,
                good: info.is_good(),
                last_success: info.our_last_success,
                uptime: [
                    info.stats[0].ratio(),
                    info.stats[1].ratio(),
                    info.stats[2].ratio(),
                    info.stats[3].ratio(),
                    info.stats[4].ratio(),
                ],
                blocks: info.blocks,
                services: info.services,
                client_version: info.client_version,
                client_subversion: info.client_subversion.clone(),
            })
            .collect()
    }

    fn to_saved(&self) -> SavedDb {
        let records = self
            .id_to_info
            .values()
            .map(|info| SavedRecord {
                version: RECORD_FORMAT_VERSION,
                endpoint: info.endpoint,
                services: info.services,
                last_try: info.last_try,
                tried: (info.total > 0).then(|| SavedTried {
                    our_last_try: info.our_last_try,
                    our_last_success: info.our_last_success,
                    ignore_till: info.ignore_till,
                    stats: info.stats,
                    total: info.total,
                    success: info.success,
                    client_version: info.client_version,
                    client_subversion: Some(info.client_subversion.clone()),
                    blocks: Some(info.blocks),
                }),
            })
            .collect();
        SavedDb {
            format_version: DB_FORMAT_VERSION,
            records,
            banned: self.banned.iter().map(|(ep, t)| (*ep, *t)).collect(),
        }
    }

    fn load_saved(&mut self, saved: SavedDb, now: u64) -> (usize, usize) {
        let mut kept = 0;
        let mut dropped = 0;
        for (ep, unban) in saved.banned {
            if unban > now {
                self.banned.insert(ep, unban);
            }
        }
        for rec in saved.records {
            if self.ip_to_id.contains_key(&rec.endpoint) || self.banned.contains_key(&rec.endpoint)
            {
                dropped += 1;
                continue;
            }
            let mut info = AddrInfo::new(rec.endpoint, rec.services, rec.last_try);
            if let Some(tried) = rec.tried {
                info.our_last_try = tried.our_last_try;
                info.our_last_success = tried.our_last_success;
                info.ignore_till = tried.ignore_till;
                info.stats = tried.stats;
                info.total = tried.total;
                info.success = tried.success.min(tried.total);
                info.client_version = tried.client_version;
                info.client_subversion = tried.client_subversion.unwrap_or_default();
                info.blocks = tried.blocks.unwrap_or(0);

                let ban = info.get_ban_time();
                if ban > 0 {
                    self.banned.insert(rec.endpoint, now + ban);
                    dropped += 1;
                    continue;
                }
                // Self-heal: stale junk that is not even worth banning.
                if info.is_terrible() {
                    dropped += 1;
                    continue;
                }
                let id = self.next_id;
                self.next_id += 1;
                let good = info.is_good();
                self.ip_to_id.insert(rec.endpoint, id);
                self.id_to_info.insert(id, info);
                self.our_ids.push_back(id);
                if good {
                    self.good_ids.insert(id);
                }
            } else {
                let id = self.next_id;
                self.next_id += 1;
                self.ip_to_id.insert(rec.endpoint, id);
                self.id_to_info.insert(id, info);
                self.unk_ids.insert(id);
            }
            kept += 1;
        }
        (kept, dropped)
    }
}

// ============================================================================
// Persistence contract
// ============================================================================

/// Current container format version.
pub const DB_FORMAT_VERSION: u32 = 1;

/// Current per-record version; bump when adding trailing optional fields.
pub const RECORD_FORMAT_VERSION: u32 = 2;

/// Fields present only once an endpoint has been tried. Trailing `Option`s
/// allow records written before those fields existed to load with defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTried {
    pub our_last_try: u64,
    pub our_last_success: u64,
    pub ignore_till: u64,
    pub stats: [AddrStat; 5],
    pub total: u64,
    pub success: u64,
    pub client_version: i32,
    pub client_subversion: Option<String>,
    pub blocks: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedRecord {
    pub version: u32,
    pub endpoint: Endpoint,
    pub services: u64,
    pub last_try: u64,
    pub tried: Option<SavedTried>,
}

/// On-disk snapshot of the whole database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedDb {
    pub format_version: u32,
    pub records: Vec<SavedRecord>,
    pub banned: Vec<(Endpoint, u64)>,
}
