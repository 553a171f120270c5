//! Persistent report cache
//!
//! Durable store mapping scenario key → report + generation metadata, plus an
//! append-only performance log. All state transitions happen under an
//! exclusive cross-process file lock, which is what makes Absent→InFlight a
//! compare-and-set: at most one generation is ever in flight per key, even
//! across concurrent sessions in separate processes.
//!
//! Layout under the cache directory:
//! - `.lock`                  advisory lock file
//! - `reports/<key>.json`     one entry per scenario key
//! - `performance_log.jsonl`  append-only attempt rows
//!
//! Reads are corrupt-tolerant: an unreadable entry is treated as absent and
//! regenerated, never propagated as an error.

use crate::orchestrator::AttemptRecord;
use crate::report::{GenerationMetadata, Report};
use crate::scenario::ScenarioKey;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const REPORTS_DIR: &str = "reports";
const PERFORMANCE_LOG_FILE: &str = "performance_log.jsonl";
const CACHE_LOCK_TIMEOUT_SECS: u64 = 5;
const CACHE_LOCK_RETRY_MS: u64 = 50;

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheState {
    Ready(Report, GenerationMetadata),
    InFlight,
    Absent,
}

/// Result of attempting to start a generation.
#[derive(Debug)]
pub enum LeaseOutcome {
    /// This caller owns the generation; complete or abort with the lease.
    Acquired(Lease),
    /// Another caller is generating; wait for Ready instead of duplicating.
    AlreadyInFlight,
    /// A concurrent generation finished between lookup and begin.
    AlreadyReady(Report, GenerationMetadata),
}

/// Proof of ownership of one in-flight generation.
#[derive(Debug, Clone)]
pub struct Lease {
    key: ScenarioKey,
    token: Uuid,
}

impl Lease {
    pub fn key(&self) -> &ScenarioKey {
        &self.key
    }
}

/// Scoped ownership of an in-flight generation.
///
/// Dropping the guard without calling [`complete`](LeaseGuard::complete)
/// aborts the generation, so a cancelled caller (future dropped at an await
/// point) releases the entry immediately instead of leaving it in flight
/// until the grace period reclaims it.
pub struct LeaseGuard {
    cache: ReportCache,
    lease: Option<Lease>,
}

impl LeaseGuard {
    /// Transition InFlight→Ready. Disarms the drop-abort even when the write
    /// fails: on persistence failure the entry stays in flight and the grace
    /// period reclaims it, while the report is still handed to the caller.
    pub fn complete(mut self, report: &Report, metadata: &GenerationMetadata) -> anyhow::Result<()> {
        match self.lease.take() {
            Some(lease) => self.cache.complete_generation(&lease, report, metadata),
            None => Ok(()),
        }
    }

    /// Transition InFlight→Absent explicitly.
    pub fn abort(mut self) -> anyhow::Result<()> {
        match self.lease.take() {
            Some(lease) => self.cache.abort_generation(&lease),
            None => Ok(()),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(err) = self.cache.abort_generation(&lease) {
                warn!(error = %err, "failed to clear in-flight entry on drop");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EntryState {
    Ready,
    InFlight,
}

/// On-disk shape of one cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    state: EntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<Report>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<GenerationMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    began_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

/// The cache manager. Cloning is cheap; clones share the same on-disk store.
#[derive(Clone)]
pub struct ReportCache {
    cache_dir: PathBuf,
    /// Ready entries older than this read as absent.
    ttl: chrono::Duration,
    /// In-flight entries older than this are treated as abandoned and
    /// reclaimed (crash recovery).
    inflight_grace: chrono::Duration,
}

struct CacheLock {
    file: std::fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ReportCache {
    pub fn new(cache_dir: &Path, ttl: StdDuration, inflight_grace: StdDuration) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36500)),
            inflight_grace: chrono::Duration::from_std(inflight_grace)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        }
    }

    /// Default cache location under the user cache directory.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("trendscribe")
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        let reports = self.cache_dir.join(REPORTS_DIR);
        if !reports.exists() {
            fs::create_dir_all(&reports)?;
        }
        Ok(())
    }

    fn entry_path(&self, key: &ScenarioKey) -> PathBuf {
        self.cache_dir
            .join(REPORTS_DIR)
            .join(format!("{}.json", key.as_str()))
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<CacheLock> {
        if exclusive {
            self.ensure_dir()?;
        } else if !self.cache_dir.exists() {
            anyhow::bail!("cache directory missing");
        }

        let lock_path = self.cache_dir.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // Lock file content doesn't matter, just the lock
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= StdDuration::from_secs(CACHE_LOCK_TIMEOUT_SECS) {
                        anyhow::bail!(
                            "timed out waiting for cache lock ({}s)",
                            CACHE_LOCK_TIMEOUT_SECS
                        );
                    }
                    std::thread::sleep(StdDuration::from_millis(CACHE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(CacheLock { file })
    }

    fn read_entry(&self, key: &ScenarioKey) -> Option<StoredEntry> {
        let path = self.entry_path(key);
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(&path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_entry(&self, key: &ScenarioKey, entry: &StoredEntry) -> anyhow::Result<()> {
        let content = serde_json::to_string(entry)?;
        write_atomic(&self.entry_path(key), &content)
    }

    /// Classify an entry against TTL and the in-flight grace period.
    fn effective_state(&self, entry: &StoredEntry) -> CacheState {
        let now = Utc::now();
        match entry.state {
            EntryState::Ready => match (&entry.report, &entry.metadata) {
                (Some(report), Some(metadata)) => {
                    let age = now.signed_duration_since(entry.completed_at.unwrap_or(now));
                    if age > self.ttl {
                        debug!("cache entry expired (age {}s)", age.num_seconds());
                        CacheState::Absent
                    } else {
                        CacheState::Ready(report.clone(), metadata.clone())
                    }
                }
                _ => CacheState::Absent, // Ready without a report is corrupt
            },
            EntryState::InFlight => {
                let began = entry.began_at.unwrap_or(now);
                if now.signed_duration_since(began) > self.inflight_grace {
                    warn!("stale in-flight entry treated as abandoned");
                    CacheState::Absent
                } else {
                    CacheState::InFlight
                }
            }
        }
    }

    /// `Ready(report) | InFlight | Absent` for a key. Expired and stale
    /// entries read as absent.
    pub fn lookup(&self, key: &ScenarioKey) -> anyhow::Result<CacheState> {
        if !self.cache_dir.exists() {
            return Ok(CacheState::Absent);
        }
        let _lock = self.lock(false)?;
        Ok(match self.read_entry(key) {
            Some(entry) => self.effective_state(&entry),
            None => CacheState::Absent,
        })
    }

    /// Atomically transition Absent→InFlight. The single-flight guarantee:
    /// under the exclusive lock, exactly one caller can observe Absent and
    /// write the in-flight marker.
    pub fn begin_generation(&self, key: &ScenarioKey) -> anyhow::Result<LeaseOutcome> {
        let _lock = self.lock(true)?;

        if let Some(entry) = self.read_entry(key) {
            match self.effective_state(&entry) {
                CacheState::Ready(report, metadata) => {
                    return Ok(LeaseOutcome::AlreadyReady(report, metadata));
                }
                CacheState::InFlight => return Ok(LeaseOutcome::AlreadyInFlight),
                CacheState::Absent => {} // expired or abandoned, reclaim
            }
        }

        let token = Uuid::new_v4();
        self.write_entry(
            key,
            &StoredEntry {
                state: EntryState::InFlight,
                report: None,
                metadata: None,
                lease: Some(token),
                began_at: Some(Utc::now()),
                completed_at: None,
            },
        )?;
        debug!(key = %key, "generation lease acquired");
        Ok(LeaseOutcome::Acquired(Lease {
            key: key.clone(),
            token,
        }))
    }

    /// Wrap an acquired lease so the in-flight entry is cleared however the
    /// owning scope exits.
    pub fn guard(&self, lease: Lease) -> LeaseGuard {
        LeaseGuard {
            cache: self.clone(),
            lease: Some(lease),
        }
    }

    /// Transition InFlight→Ready and persist the report durably.
    ///
    /// Rejected if the lease no longer owns the entry (it went stale and was
    /// reclaimed by another caller).
    pub fn complete_generation(
        &self,
        lease: &Lease,
        report: &Report,
        metadata: &GenerationMetadata,
    ) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;

        match self.read_entry(&lease.key) {
            Some(entry)
                if entry.state == EntryState::InFlight && entry.lease == Some(lease.token) => {}
            _ => anyhow::bail!("lease no longer owns the in-flight entry"),
        }

        self.write_entry(
            &lease.key,
            &StoredEntry {
                state: EntryState::Ready,
                report: Some(report.clone()),
                metadata: Some(metadata.clone()),
                lease: None,
                began_at: None,
                completed_at: Some(Utc::now()),
            },
        )
    }

    /// Transition InFlight→Absent, leaving no partial state behind. A no-op
    /// if the lease was already superseded.
    pub fn abort_generation(&self, lease: &Lease) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;

        match self.read_entry(&lease.key) {
            Some(entry)
                if entry.state == EntryState::InFlight && entry.lease == Some(lease.token) =>
            {
                fs::remove_file(self.entry_path(&lease.key))?;
                debug!(key = %lease.key, "generation aborted, entry cleared");
            }
            _ => {}
        }
        Ok(())
    }

    /// Explicit cache-bust regardless of current state.
    pub fn force_refresh(&self, key: &ScenarioKey) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Append one attempt row to the performance log. Independent of the
    /// entry state machine; never blocks on it.
    pub fn record_attempt(&self, record: &AttemptRecord) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let path = self.cache_dir.join(PERFORMANCE_LOG_FILE);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let row = serde_json::to_string(record)?;
        use std::io::Write;
        writeln!(file, "{}", row)?;
        Ok(())
    }

    /// Load up to `limit` latest performance-log rows (newest last).
    pub fn load_performance_log(&self, limit: usize) -> anyhow::Result<Vec<AttemptRecord>> {
        let path = self.cache_dir.join(PERFORMANCE_LOG_FILE);
        if !path.exists() || limit == 0 {
            return Ok(Vec::new());
        }
        let _lock = self.lock(false)?;
        let content = fs::read_to_string(&path)?;
        let mut records: Vec<AttemptRecord> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<AttemptRecord>(line).ok())
            .collect();
        if records.len() > limit {
            let split = records.len() - limit;
            records.drain(0..split);
        }
        Ok(records)
    }
}

/// Write content atomically by writing to a temp file first, then renaming.
fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600); // Owner read/write only
        let _ = std::fs::set_permissions(&tmp_path, perms);
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Confidence;
    use crate::scenario::{build_key, ScenarioParams};
    use std::collections::BTreeMap;

    fn key(subject: &str) -> ScenarioKey {
        build_key(&ScenarioParams {
            subject: subject.to_string(),
            sources: vec!["Trends".to_string(), "Academic".to_string()],
            language: "en".to_string(),
            options: BTreeMap::new(),
        })
        .unwrap()
    }

    fn report() -> Report {
        Report {
            executive_summary: "Interest rose 42%.".to_string(),
            principal_findings: vec!["Peak in March.".to_string()],
            analytic_sections: BTreeMap::new(),
            confidence: Confidence::High,
        }
    }

    fn metadata() -> GenerationMetadata {
        GenerationMetadata {
            provider: "openrouter".to_string(),
            model: "model-a".to_string(),
            latency_ms: 1234,
            token_count: 512,
            attempt_number: 1,
            success: true,
            created_at: Utc::now(),
        }
    }

    fn cache(dir: &Path) -> ReportCache {
        ReportCache::new(
            dir,
            StdDuration::from_secs(3600),
            StdDuration::from_secs(600),
        )
    }

    fn attempt(provider: &str, success: bool) -> AttemptRecord {
        AttemptRecord {
            provider: provider.to_string(),
            model: "m".to_string(),
            latency_ms: 100,
            token_count: 50,
            success,
            error_kind: (!success).then(|| "timeout".to_string()),
            degraded: false,
            response_chars: 200,
            quantitative: success,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn absent_then_inflight_then_ready_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("Total Quality");

        assert!(matches!(cache.lookup(&k).unwrap(), CacheState::Absent));

        let lease = match cache.begin_generation(&k).unwrap() {
            LeaseOutcome::Acquired(lease) => lease,
            other => panic!("expected lease, got {:?}", other),
        };
        assert!(matches!(cache.lookup(&k).unwrap(), CacheState::InFlight));

        cache.complete_generation(&lease, &report(), &metadata()).unwrap();
        match cache.lookup(&k).unwrap() {
            CacheState::Ready(r, m) => {
                assert_eq!(r, report());
                assert_eq!(m.provider, "openrouter");
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn second_begin_sees_already_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("Total Quality");

        let _lease = cache.begin_generation(&k).unwrap();
        assert!(matches!(
            cache.begin_generation(&k).unwrap(),
            LeaseOutcome::AlreadyInFlight
        ));
    }

    #[test]
    fn begin_after_completion_returns_already_ready() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("Total Quality");

        match cache.begin_generation(&k).unwrap() {
            LeaseOutcome::Acquired(lease) => {
                cache.complete_generation(&lease, &report(), &metadata()).unwrap();
            }
            other => panic!("expected lease, got {:?}", other),
        }
        assert!(matches!(
            cache.begin_generation(&k).unwrap(),
            LeaseOutcome::AlreadyReady(_, _)
        ));
    }

    #[test]
    fn abort_returns_entry_to_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("Total Quality");

        match cache.begin_generation(&k).unwrap() {
            LeaseOutcome::Acquired(lease) => cache.abort_generation(&lease).unwrap(),
            other => panic!("expected lease, got {:?}", other),
        }
        assert!(matches!(cache.lookup(&k).unwrap(), CacheState::Absent));
        assert!(matches!(
            cache.begin_generation(&k).unwrap(),
            LeaseOutcome::Acquired(_)
        ));
    }

    #[test]
    fn dropped_guard_clears_inflight_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("Total Quality");

        match cache.begin_generation(&k).unwrap() {
            LeaseOutcome::Acquired(lease) => {
                let guard = cache.guard(lease);
                assert!(matches!(cache.lookup(&k).unwrap(), CacheState::InFlight));
                drop(guard);
            }
            other => panic!("expected lease, got {:?}", other),
        }
        assert!(matches!(cache.lookup(&k).unwrap(), CacheState::Absent));
        assert!(matches!(
            cache.begin_generation(&k).unwrap(),
            LeaseOutcome::Acquired(_)
        ));
    }

    #[test]
    fn completed_guard_does_not_abort_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("Total Quality");

        match cache.begin_generation(&k).unwrap() {
            LeaseOutcome::Acquired(lease) => {
                let guard = cache.guard(lease);
                guard.complete(&report(), &metadata()).unwrap();
            }
            other => panic!("expected lease, got {:?}", other),
        }
        assert!(matches!(cache.lookup(&k).unwrap(), CacheState::Ready(_, _)));
    }

    #[test]
    fn stale_inflight_entry_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        // Zero grace: any in-flight entry is immediately abandoned.
        let cache = ReportCache::new(
            dir.path(),
            StdDuration::from_secs(3600),
            StdDuration::from_secs(0),
        );
        let k = key("Total Quality");

        let first = cache.begin_generation(&k).unwrap();
        assert!(matches!(first, LeaseOutcome::Acquired(_)));

        // A second caller reclaims the abandoned flight...
        let second = match cache.begin_generation(&k).unwrap() {
            LeaseOutcome::Acquired(lease) => lease,
            other => panic!("expected reclaim, got {:?}", other),
        };

        // ...and the superseded lease can no longer complete.
        if let LeaseOutcome::Acquired(stale) = first {
            assert!(cache
                .complete_generation(&stale, &report(), &metadata())
                .is_err());
        }
        cache.complete_generation(&second, &report(), &metadata()).unwrap();
    }

    #[test]
    fn expired_ready_entry_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReportCache::new(
            dir.path(),
            StdDuration::from_secs(0), // everything expires immediately
            StdDuration::from_secs(600),
        );
        let k = key("Total Quality");

        match cache.begin_generation(&k).unwrap() {
            LeaseOutcome::Acquired(lease) => {
                cache.complete_generation(&lease, &report(), &metadata()).unwrap();
            }
            other => panic!("expected lease, got {:?}", other),
        }
        assert!(matches!(cache.lookup(&k).unwrap(), CacheState::Absent));
    }

    #[test]
    fn force_refresh_clears_ready_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("Total Quality");

        match cache.begin_generation(&k).unwrap() {
            LeaseOutcome::Acquired(lease) => {
                cache.complete_generation(&lease, &report(), &metadata()).unwrap();
            }
            other => panic!("expected lease, got {:?}", other),
        }
        cache.force_refresh(&k).unwrap();
        assert!(matches!(cache.lookup(&k).unwrap(), CacheState::Absent));
    }

    #[test]
    fn corrupt_entry_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let k = key("Total Quality");

        fs::create_dir_all(dir.path().join(REPORTS_DIR)).unwrap();
        fs::write(cache.entry_path(&k), "{ not valid json").unwrap();
        assert!(matches!(cache.lookup(&k).unwrap(), CacheState::Absent));
    }

    #[test]
    fn performance_log_appends_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        for i in 0..5 {
            cache.record_attempt(&attempt(&format!("p{}", i), i % 2 == 0)).unwrap();
        }

        let all = cache.load_performance_log(100).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].provider, "p0");

        let recent = cache.load_performance_log(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].provider, "p3");
        assert_eq!(recent[1].provider, "p4");
    }

    #[test]
    fn performance_log_skips_unparseable_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        cache.record_attempt(&attempt("good", true)).unwrap();
        let path = dir.path().join(PERFORMANCE_LOG_FILE);
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("not json\n");
        fs::write(&path, content).unwrap();
        cache.record_attempt(&attempt("also-good", false)).unwrap();

        let rows = cache.load_performance_log(100).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
