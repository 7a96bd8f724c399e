//! Persistence: binary snapshots plus a human-readable report.
//!
//! The snapshot is written to a sibling temp file and renamed into place, so
//! a crash mid-write never corrupts the previous state. I/O failures in the
//! periodic dump are logged and the cycle skipped; persistence problems must
//! never take the crawler down.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::db::{unix_now, AddrDb, AddrReport, SavedDb, DB_FORMAT_VERSION};

/// First dump happens this soon after startup; the interval then doubles.
const DUMP_START_SECS: u64 = 100;

/// Ceiling of the doubling dump schedule.
const DUMP_MAX_SECS: u64 = 3200;

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".new");
    PathBuf::from(name)
}

/// Serialize and atomically replace the snapshot at `path`.
pub fn save(saved: &SavedDb, path: &Path) -> Result<()> {
    let bytes = bincode::serialize(saved).context("serializing state")?;
    let staging = staging_path(path);
    fs::write(&staging, &bytes)
        .with_context(|| format!("writing {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("renaming {} into place", path.display()))?;
    Ok(())
}

/// Load a snapshot into `db`. A missing file is a fresh start, not an error;
/// returns whether anything was loaded.
pub fn load(db: &AddrDb, path: &Path, wipe_bans: bool, wipe_ignores: bool) -> Result<bool> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no saved state, starting fresh");
            return Ok(false);
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let saved: SavedDb =
        bincode::deserialize(&bytes).with_context(|| format!("decoding {}", path.display()))?;
    if saved.format_version != DB_FORMAT_VERSION {
        bail!(
            "unsupported state format {} in {}",
            saved.format_version,
            path.display()
        );
    }
    let (kept, dropped) = db.load_saved(saved);
    if wipe_bans {
        db.wipe_bans();
    }
    if wipe_ignores {
        db.reset_ignores();
    }
    info!(path = %path.display(), kept, dropped, "state loaded");
    Ok(true)
}

/// Write the per-address report table, best long-term peers first.
pub fn write_report(mut rows: Vec<AddrReport>, path: &Path) -> Result<()> {
    rows.sort_by(|a, b| b.uptime[4].partial_cmp(&a.uptime[4]).unwrap_or(std::cmp::Ordering::Equal));
    let mut out = String::with_capacity(rows.len() * 96 + 128);
    out.push_str(
        "# address          good lastSuccess %(2h) %(8h) %(1d) %(7d) %(30d) blocks svcs version\n",
    );
    for r in rows {
        out.push_str(&format!(
            "{:<24} {} {:>11} {:5.1} {:5.1} {:5.1} {:5.1} {:6.1} {:>6} {:#4x} {:>6} {}\n",
            r.endpoint.to_string(),
            u8::from(r.good),
            r.last_success,
            r.uptime[0] * 100.0,
            r.uptime[1] * 100.0,
            r.uptime[2] * 100.0,
            r.uptime[3] * 100.0,
            r.uptime[4] * 100.0,
            r.blocks,
            r.services,
            r.client_version,
            r.client_subversion,
        ));
    }
    let staging = staging_path(path);
    fs::write(&staging, out.as_bytes())
        .with_context(|| format!("writing {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("renaming {} into place", path.display()))?;
    Ok(())
}

/// Take one snapshot now; used by the dump task and the shutdown path.
pub async fn dump_once(db: &AddrDb, dat_path: &Path, report_path: &Path) {
    let saved = db.to_saved();
    let rows = db.report_all();
    let dat = dat_path.to_owned();
    let report = report_path.to_owned();
    let started = unix_now();
    let result = tokio::task::spawn_blocking(move || {
        save(&saved, &dat)?;
        write_report(rows, &report)
    })
    .await;
    match result {
        Ok(Ok(())) => {
            debug!(path = %dat_path.display(), secs = unix_now() - started, "state dumped")
        }
        Ok(Err(e)) => warn!(error = %e, "dump failed"),
        Err(e) => warn!(error = %e, "dump task panicked"),
    }
}

/// Periodic persistence with a doubling schedule: frequent snapshots while
/// the database is young and filling fast, then settling to a steady cadence.
pub async fn dump_task(db: AddrDb, dat_path: PathBuf, report_path: PathBuf) {
    let mut delay = DUMP_START_SECS;
    loop {
        tokio::time::sleep(Duration::from_secs(delay)).await;
        delay = (delay * 2).min(DUMP_MAX_SECS);
        if db.take_dirty() == 0 {
            debug!("no changes since last dump, skipping");
            continue;
        }
        dump_once(&db, &dat_path, &report_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netaddr::NODE_NETWORK;
    use crate::wire::SeenAddress;
    use std::sync::atomic::{AtomicU32, Ordering};

    static FILE_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_file(tag: &str) -> PathBuf {
        let n = FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("peerseed-test-{}-{}-{}", std::process::id(), tag, n))
    }

    fn populated_db() -> AddrDb {
        let db = AddrDb::new();
        let now = unix_now();
        for i in 1..=5u8 {
            db.add(
                SeenAddress {
                    timestamp: now as u32,
                    services: NODE_NETWORK,
                    endpoint: format!("1.2.3.{i}:8333").parse().unwrap(),
                },
                false,
            );
        }
        let (cands, _) = db.get_many(2);
        for c in cands {
            db.good(c.endpoint, 70015, "/x:1.0/".into(), 100);
        }
        db
    }

    #[test]
    fn save_and_load_round_trip() {
        let path = temp_file("dat");
        let db = populated_db();
        let before = db.stats();
        save(&db.to_saved(), &path).expect("save");

        let db2 = AddrDb::new();
        assert!(load(&db2, &path, false, false).expect("load"));
        let after = db2.stats();
        assert_eq!(before.avail, after.avail);
        assert_eq!(before.good, after.good);
        assert_eq!(before.banned, after.banned);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn load_missing_file_starts_fresh() {
        let db = AddrDb::new();
        let loaded = load(&db, &temp_file("missing"), false, false).expect("no error");
        assert!(!loaded);
        assert_eq!(db.stats().avail, 0);
    }

    #[test]
    fn load_rejects_corrupt_file() {
        let path = temp_file("corrupt");
        fs::write(&path, b"not a snapshot").expect("write");
        let db = AddrDb::new();
        assert!(load(&db, &path, false, false).is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn save_leaves_no_staging_file() {
        let path = temp_file("staging");
        save(&populated_db().to_saved(), &path).expect("save");
        assert!(path.exists());
        assert!(!staging_path(&path).exists());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn load_with_wipe_flags_clears_bans() {
        let path = temp_file("wipe");
        let db = populated_db();
        let (cands, _) = db.get_many(1);
        db.bad(cands[0].endpoint, 100_000);
        assert_eq!(db.stats().banned, 1);
        save(&db.to_saved(), &path).expect("save");

        let db2 = AddrDb::new();
        load(&db2, &path, true, true).expect("load");
        assert_eq!(db2.stats().banned, 0, "--wipeban clears the ban list");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn report_sorted_by_long_window_reliability() {
        let path = temp_file("report");
        let db = populated_db();
        write_report(db.report_all(), &path).expect("report");
        let text = fs::read_to_string(&path).expect("read back");
        assert!(text.starts_with("# address"));
        assert!(text.lines().count() >= 3);
        let _ = fs::remove_file(&path);
    }
}
