//! Per-session traffic accounting.
//!
//! Every session gets a conntrack mark from the pool [0x100, 0x1FF]. A pair
//! of classifier rules tags both directions of the client's connections with
//! the mark, a single restore rule copies it back onto packets at ingress,
//! and the kernel's per-connection byte/packet counters are aggregated by
//! mark on demand.
//!
//! Counter reads are cached for a short wall-clock TTL to keep repeated
//! queries off the netlink socket. When the kernel refuses the dump, the
//! module degrades to serving cached values (zeros included) and warns once.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use magic_common::types::TrafficCounters;
use magic_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::conntrack::ConntrackReader;
use crate::host::HostConfigurator;

/// First conntrack mark of the accounting pool.
pub const MARK_BASE: u32 = 0x100;
/// Last conntrack mark of the accounting pool.
pub const MARK_MAX: u32 = 0x1FF;
/// Pool size: one mark per trackable session.
pub const MARK_POOL_SIZE: usize = (MARK_MAX - MARK_BASE + 1) as usize;

/// How long a cached counter tuple stays fresh.
pub const CACHE_TTL: Duration = Duration::from_secs(2);

/// DJB2 string hash.
fn djb2(input: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in input.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// Preferred mark for a session key: DJB2 folded into the pool.
pub fn mark_for(session_key: &str) -> u32 {
    MARK_BASE + djb2(session_key) % MARK_POOL_SIZE as u32
}

struct AcctSession {
    client_id: String,
    client_ip: IpAddr,
    mark: u32,
    cached: TrafficCounters,
    cached_at: Option<SystemTime>,
}

struct AccountingInner {
    sessions: BTreeMap<String, AcctSession>,
    marks_in_use: [bool; MARK_POOL_SIZE],
    /// Fallback cursor for collision resolution, wraps around the pool.
    cursor: u32,
    restore_installed: bool,
}

/// The traffic accounting module.
pub struct Accounting {
    host: Arc<HostConfigurator>,
    reader: Mutex<Box<dyn ConntrackReader>>,
    inner: Mutex<AccountingInner>,
    cache_ttl: Duration,
    degraded_warned: AtomicBool,
}

impl Accounting {
    pub fn new(host: Arc<HostConfigurator>, reader: Box<dyn ConntrackReader>) -> Self {
        Self::with_ttl(host, reader, CACHE_TTL)
    }

    pub fn with_ttl(
        host: Arc<HostConfigurator>,
        reader: Box<dyn ConntrackReader>,
        cache_ttl: Duration,
    ) -> Self {
        Accounting {
            host,
            reader: Mutex::new(reader),
            inner: Mutex::new(AccountingInner {
                sessions: BTreeMap::new(),
                marks_in_use: [false; MARK_POOL_SIZE],
                cursor: 0,
                restore_installed: false,
            }),
            cache_ttl,
            degraded_warned: AtomicBool::new(false),
        }
    }

    /// Register a session for tracking. Allocates a mark and installs the
    /// classifier pair. Returns the mark.
    pub fn register(&self, session_key: &str, client_id: &str, client_ip: IpAddr) -> Result<u32> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(session_key) {
            // The session manager guarantees unique keys; a duplicate here
            // is a corrupted table. Never quietly recover.
            panic!("duplicate accounting registration for session {session_key}");
        }
        if inner.sessions.len() >= MARK_POOL_SIZE {
            return Err(Error::MarkPoolExhausted);
        }

        let mark = self.pick_mark(&mut inner, session_key)?;

        {
            let mut host = self.host.ops();
            // Best effort: without the sysctl the rules still install and
            // counters read zero until an operator enables accounting.
            if let Err(e) = host.enable_conntrack_accounting() {
                self.warn_degraded(&format!("cannot enable conntrack accounting: {e}"));
            }
            if !inner.restore_installed {
                host.restore_conn_mark_on_ingress()
                    .map_err(|e| e.into_engine())?;
            }
            if let Err(e) = host.connmark_pair_add(client_ip, mark) {
                return Err(e.into_engine());
            }
        }

        inner.restore_installed = true;
        inner.marks_in_use[(mark - MARK_BASE) as usize] = true;
        inner.sessions.insert(
            session_key.to_string(),
            AcctSession {
                client_id: client_id.to_string(),
                client_ip,
                mark,
                cached: TrafficCounters::default(),
                cached_at: None,
            },
        );
        debug!(session = session_key, mark = %format_args!("{mark:#x}"), "accounting registered");
        Ok(mark)
    }

    /// Stop tracking a session: remove its classifier pair, free the mark.
    /// Unknown keys are a no-op.
    pub fn unregister(&self, session_key: &str) -> Result<()> {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.remove(session_key) else {
            return Ok(());
        };
        let result = self
            .host
            .ops()
            .connmark_pair_del(session.client_ip, session.mark)
            .map_err(|e| e.into_engine());
        if result.is_err() {
            // Keep the entry so a retry can clean up.
            let mark = session.mark;
            inner.sessions.insert(session_key.to_string(), session);
            warn!(session = session_key, mark, "classifier removal failed, entry retained");
            return result;
        }
        let slot = (session.mark - MARK_BASE) as usize;
        assert!(
            inner.marks_in_use[slot],
            "conntrack mark {:#x} double-freed",
            session.mark
        );
        inner.marks_in_use[slot] = false;
        debug!(session = session_key, "accounting unregistered");
        Ok(())
    }

    /// Counters for one session. Served from cache inside the TTL.
    pub fn stats(&self, session_key: &str) -> Result<TrafficCounters> {
        {
            let inner = self.lock();
            let session = inner
                .sessions
                .get(session_key)
                .ok_or(Error::SessionNotFound)?;
            if self.cache_fresh(session.cached_at) {
                return Ok(session.cached);
            }
        }
        self.refresh_all();
        let inner = self.lock();
        inner
            .sessions
            .get(session_key)
            .map(|s| s.cached)
            .ok_or(Error::SessionNotFound)
    }

    /// Aggregate counters over every session of one client.
    pub fn aggregate_client(&self, client_id: &str) -> Result<TrafficCounters> {
        self.refresh_if_stale();
        let inner = self.lock();
        let mut total = TrafficCounters::default();
        let mut found = false;
        for session in inner.sessions.values() {
            if session.client_id == client_id {
                total.accumulate(&session.cached);
                found = true;
            }
        }
        if found {
            Ok(total)
        } else {
            Err(Error::SessionNotFound)
        }
    }

    /// Aggregate counters over every tracked session.
    pub fn aggregate_all(&self) -> TrafficCounters {
        self.refresh_if_stale();
        let inner = self.lock();
        let mut total = TrafficCounters::default();
        for session in inner.sessions.values() {
            total.accumulate(&session.cached);
        }
        total
    }

    /// Force a kernel read and refresh every session's cache.
    ///
    /// One dump serves all marks. The netlink read happens without the
    /// session-table lock held; the table is re-locked only to store the
    /// aggregated results.
    pub fn refresh_all(&self) {
        let entries = {
            let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
            match reader.dump() {
                Ok(entries) => entries,
                Err(e) => {
                    self.warn_degraded(&format!("conntrack dump failed: {e}"));
                    return;
                }
            }
        };

        let mut by_mark: BTreeMap<u32, TrafficCounters> = BTreeMap::new();
        for entry in entries {
            let slot = by_mark.entry(entry.mark).or_default();
            slot.bytes_in += entry.orig_bytes;
            slot.packets_in += entry.orig_packets;
            slot.bytes_out += entry.reply_bytes;
            slot.packets_out += entry.reply_packets;
        }

        let now = SystemTime::now();
        let mut inner = self.lock();
        for session in inner.sessions.values_mut() {
            session.cached = by_mark.get(&session.mark).copied().unwrap_or_default();
            session.cached_at = Some(now);
        }
    }

    /// Number of tracked sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// The mark assigned to a session, if tracked.
    pub fn mark_of(&self, session_key: &str) -> Option<u32> {
        self.lock().sessions.get(session_key).map(|s| s.mark)
    }

    fn pick_mark(&self, inner: &mut MutexGuard<'_, AccountingInner>, key: &str) -> Result<u32> {
        let preferred = mark_for(key);
        if !inner.marks_in_use[(preferred - MARK_BASE) as usize] {
            return Ok(preferred);
        }
        // Hash collision: fall back to a wrapping cursor scan.
        for _ in 0..MARK_POOL_SIZE {
            let candidate = MARK_BASE + inner.cursor;
            inner.cursor = (inner.cursor + 1) % MARK_POOL_SIZE as u32;
            if !inner.marks_in_use[(candidate - MARK_BASE) as usize] {
                debug!(
                    key,
                    preferred = %format_args!("{preferred:#x}"),
                    assigned = %format_args!("{candidate:#x}"),
                    "mark collision resolved by cursor"
                );
                return Ok(candidate);
            }
        }
        Err(Error::MarkPoolExhausted)
    }

    fn cache_fresh(&self, cached_at: Option<SystemTime>) -> bool {
        let Some(at) = cached_at else {
            return false;
        };
        let now = SystemTime::now();
        match now.duration_since(at) {
            Ok(age) => age < self.cache_ttl,
            // Cache stamped in the future: the clock jumped backwards.
            // Tolerate skew up to one TTL so staleness is bounded at 2×TTL.
            Err(e) => e.duration() <= self.cache_ttl,
        }
    }

    fn refresh_if_stale(&self) {
        let stale = {
            let inner = self.lock();
            inner
                .sessions
                .values()
                .any(|s| !self.cache_fresh(s.cached_at))
        };
        if stale {
            self.refresh_all();
        }
    }

    fn warn_degraded(&self, detail: &str) {
        if !self.degraded_warned.swap(true, Ordering::Relaxed) {
            warn!(detail, "traffic accounting degraded, serving cached counters");
        }
    }

    fn lock(&self) -> MutexGuard<'_, AccountingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Accounting {
    fn drop(&mut self) {
        let count = self.session_count();
        if count > 0 {
            info!(count, "accounting dropped with sessions still tracked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::{ConntrackEntry, MemoryConntrack};
    use crate::host::memory::MemoryHost;

    fn setup() -> (MemoryHost, MemoryConntrack, Accounting) {
        let host = MemoryHost::new();
        let table = MemoryConntrack::new();
        let acct = Accounting::new(
            Arc::new(HostConfigurator::new(Box::new(host.clone()))),
            Box::new(table.clone()),
        );
        (host, table, acct)
    }

    fn client() -> IpAddr {
        "10.20.0.5".parse().unwrap()
    }

    #[test]
    fn djb2_matches_reference_values() {
        // djb2("a") = 5381*33 + 97
        assert_eq!(djb2("a"), 177_670);
        assert_eq!(djb2(""), 5381);
    }

    #[test]
    fn mark_for_stays_in_pool() {
        for key in ["1", "42", "client;17", "a-very-long-session-key-string"] {
            let mark = mark_for(key);
            assert!((MARK_BASE..=MARK_MAX).contains(&mark));
        }
    }

    #[test]
    fn register_installs_rules_and_restore() {
        let (host, _table, acct) = setup();
        let mark = acct.register("1", "C1", client()).unwrap();
        assert_eq!(mark, mark_for("1"));

        let rules = host.rules();
        assert!(rules.restore_rule_installed);
        assert!(rules.conntrack_acct);
        assert_eq!(rules.classifiers.len(), 2, "src + dst connmark pair");
    }

    #[test]
    fn unregister_round_trip_restores_host() {
        let (host, _table, acct) = setup();
        let before = host.rules();
        acct.register("1", "C1", client()).unwrap();
        acct.unregister("1").unwrap();

        let mut after = host.rules();
        // The restore rule and the sysctl are process-lifetime installs.
        after.restore_rule_installed = before.restore_rule_installed;
        after.conntrack_acct = before.conntrack_acct;
        assert_eq!(after, before);
        assert_eq!(acct.session_count(), 0);

        // Idempotent.
        acct.unregister("1").unwrap();
    }

    #[test]
    fn colliding_keys_get_unique_marks() {
        let (_host, _table, acct) = setup();
        // 33*'A'+'a' == 33*'B'+'@', so "Aa" and "B@" share a DJB2 hash.
        assert_eq!(djb2("Aa"), djb2("B@"));
        let m1 = acct.register("Aa", "C1", client()).unwrap();
        let m2 = acct.register("B@", "C2", "10.20.0.6".parse().unwrap()).unwrap();
        assert_ne!(m1, m2);
        assert!((MARK_BASE..=MARK_MAX).contains(&m2));
    }

    #[test]
    fn every_session_gets_unique_mark_until_pool_drains() {
        let (_host, _table, acct) = setup();
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..MARK_POOL_SIZE {
            let mark = acct
                .register(&i.to_string(), "C", client())
                .unwrap();
            assert!(seen.insert(mark), "mark {mark:#x} reused");
        }
        assert!(matches!(
            acct.register("overflow", "C", client()),
            Err(Error::MarkPoolExhausted)
        ));
    }

    #[test]
    fn stats_aggregate_by_mark_both_directions() {
        let (_host, table, acct) = setup();
        let mark = acct.register("1", "C1", client()).unwrap();
        table.set_entries(vec![
            ConntrackEntry {
                mark,
                orig_bytes: 600,
                orig_packets: 6,
                reply_bytes: 1200,
                reply_packets: 12,
            },
            ConntrackEntry {
                mark,
                orig_bytes: 400,
                orig_packets: 4,
                reply_bytes: 800,
                reply_packets: 8,
            },
            // Foreign mark, must be ignored.
            ConntrackEntry {
                mark: mark + 1,
                orig_bytes: 9999,
                ..Default::default()
            },
        ]);

        let stats = acct.stats("1").unwrap();
        assert_eq!(stats.bytes_in, 1000);
        assert_eq!(stats.bytes_out, 2000);
        assert_eq!(stats.packets_in, 10);
        assert_eq!(stats.packets_out, 20);
    }

    #[test]
    fn stats_cached_within_ttl() {
        let host = MemoryHost::new();
        let table = MemoryConntrack::new();
        let acct = Accounting::with_ttl(
            Arc::new(HostConfigurator::new(Box::new(host))),
            Box::new(table.clone()),
            Duration::from_secs(3600),
        );
        let mark = acct.register("1", "C1", client()).unwrap();
        table.push(ConntrackEntry {
            mark,
            orig_bytes: 1000,
            reply_bytes: 2000,
            ..Default::default()
        });

        assert_eq!(acct.stats("1").unwrap().bytes_in, 1000);

        // Kernel counters move on, but the cache holds.
        table.set_entries(vec![ConntrackEntry {
            mark,
            orig_bytes: 5000,
            reply_bytes: 9000,
            ..Default::default()
        }]);
        assert_eq!(acct.stats("1").unwrap().bytes_in, 1000);

        // An explicit refresh bypasses the TTL.
        acct.refresh_all();
        assert_eq!(acct.stats("1").unwrap().bytes_in, 5000);
    }

    #[test]
    fn stats_expire_after_ttl() {
        let host = MemoryHost::new();
        let table = MemoryConntrack::new();
        let acct = Accounting::with_ttl(
            Arc::new(HostConfigurator::new(Box::new(host))),
            Box::new(table.clone()),
            Duration::ZERO,
        );
        let mark = acct.register("1", "C1", client()).unwrap();
        table.push(ConntrackEntry {
            mark,
            orig_bytes: 1000,
            ..Default::default()
        });
        assert_eq!(acct.stats("1").unwrap().bytes_in, 1000);
        table.set_entries(vec![ConntrackEntry {
            mark,
            orig_bytes: 1500,
            ..Default::default()
        }]);
        assert_eq!(acct.stats("1").unwrap().bytes_in, 1500);
    }

    #[test]
    fn dump_failure_serves_cached_values() {
        let (_host, table, acct) = setup();
        let mark = acct.register("1", "C1", client()).unwrap();
        table.push(ConntrackEntry {
            mark,
            orig_bytes: 123,
            ..Default::default()
        });
        acct.refresh_all();
        assert_eq!(acct.stats("1").unwrap().bytes_in, 123);

        table.set_failing(true);
        acct.refresh_all();
        assert_eq!(
            acct.stats("1").unwrap().bytes_in,
            123,
            "cached value survives dump failure"
        );
    }

    #[test]
    fn aggregates_by_client_and_overall() {
        let (_host, table, acct) = setup();
        let m1 = acct.register("1", "C1", client()).unwrap();
        let m2 = acct.register("2", "C1", "10.20.0.6".parse().unwrap()).unwrap();
        let m3 = acct.register("3", "C2", "10.20.0.7".parse().unwrap()).unwrap();
        table.set_entries(vec![
            ConntrackEntry { mark: m1, orig_bytes: 100, ..Default::default() },
            ConntrackEntry { mark: m2, orig_bytes: 200, ..Default::default() },
            ConntrackEntry { mark: m3, orig_bytes: 400, ..Default::default() },
        ]);

        assert_eq!(acct.aggregate_client("C1").unwrap().bytes_in, 300);
        assert_eq!(acct.aggregate_client("C2").unwrap().bytes_in, 400);
        assert!(acct.aggregate_client("nobody").is_err());
        assert_eq!(acct.aggregate_all().bytes_in, 700);
    }

    #[test]
    fn unregistered_session_unknown_to_stats() {
        let (_host, _table, acct) = setup();
        acct.register("1", "C1", client()).unwrap();
        acct.unregister("1").unwrap();
        assert!(matches!(acct.stats("1"), Err(Error::SessionNotFound)));
    }

    #[test]
    #[should_panic(expected = "duplicate accounting registration")]
    fn duplicate_registration_aborts() {
        let (_host, _table, acct) = setup();
        acct.register("1", "C1", client()).unwrap();
        acct.register("1", "C1", client()).unwrap();
    }
}
