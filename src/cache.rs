use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::EngineError;
use crate::limits::MAX_CACHE_TTL_SECS;
use crate::model::*;
use crate::observability;
use crate::store::SourceError;

/// One stored cache record, as kept by a backing store.
///
/// `payload` is the JSON per-date slot map and `last_updated` an RFC 3339
/// string, so a damaged record can be detected and treated as absent.
/// `slot_count` is the aggregate across all dates, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRow {
    pub calendar_id: String,
    pub job_type: String,
    pub last_updated: String,
    pub payload: String,
    pub timezone: String,
    pub slot_count: u64,
}

impl CacheRow {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.calendar_id, &self.job_type)
    }

    fn encode(entry: &CacheEntry) -> Result<Self, EngineError> {
        let payload = serde_json::to_string(&entry.dates)
            .map_err(|e| EngineError::Storage(format!("encode slots: {e}")))?;
        Ok(Self {
            calendar_id: entry.calendar_id.clone(),
            job_type: entry.job_type.clone(),
            last_updated: entry.last_updated.to_rfc3339_opts(SecondsFormat::Millis, true),
            payload,
            timezone: entry.timezone.clone(),
            slot_count: entry.slot_count() as u64,
        })
    }

    fn decode(&self) -> Result<CacheEntry, String> {
        let last_updated = DateTime::parse_from_rfc3339(&self.last_updated)
            .map_err(|e| format!("bad last_updated {:?}: {e}", self.last_updated))?
            .with_timezone(&Utc);
        let dates: SlotMap =
            serde_json::from_str(&self.payload).map_err(|e| format!("bad payload: {e}"))?;
        Ok(CacheEntry {
            calendar_id: self.calendar_id.clone(),
            job_type: self.job_type.clone(),
            last_updated,
            dates,
            timezone: self.timezone.clone(),
        })
    }
}

/// Durable key-value persistence for cache rows.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheRow>, SourceError>;

    /// Insert or fully replace the row for `row.key()`.
    async fn upsert(&self, row: CacheRow) -> Result<(), SourceError>;

    async fn rows(&self) -> Result<Vec<CacheRow>, SourceError>;
}

#[derive(Default)]
pub struct MemoryBackend {
    rows: DashMap<CacheKey, CacheRow>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheRow>, SourceError> {
        Ok(self.rows.get(key).map(|r| r.value().clone()))
    }

    async fn upsert(&self, row: CacheRow) -> Result<(), SourceError> {
        self.rows.insert(row.key(), row);
        Ok(())
    }

    async fn rows(&self) -> Result<Vec<CacheRow>, SourceError> {
        Ok(self.rows.iter().map(|r| r.value().clone()).collect())
    }
}

/// Whether a cached slot string is the one a caller names. Accepts the
/// stored string verbatim or its local wall-clock time (`HH:MM[:SS]`).
pub fn slot_matches(stored: &str, requested: &str) -> bool {
    let requested = requested.trim();
    if stored == requested {
        return true;
    }
    let Some(wanted) = parse_wall_time(requested) else {
        return false;
    };
    DateTime::parse_from_rfc3339(stored)
        .map(|dt| dt.time() == wanted)
        .unwrap_or(false)
}

// ── Availability cache ───────────────────────────────────────────

/// Read-through store of computed availability keyed by
/// `(calendar id, job type)`, case-insensitively.
///
/// Entries older than the TTL read as absent, as do records that fail to
/// decode. `write` and `invalidate_slot` are serialized per key, so an
/// invalidation never loses a concurrent one. Whole-entry writes for the
/// same key remain last-writer-wins. A key's lock lives only while in use.
pub struct AvailabilityCache {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl AvailabilityCache {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            backend,
            clock,
            ttl: Duration::seconds(ttl_secs.min(MAX_CACHE_TTL_SECS) as i64),
            locks: DashMap::new(),
        }
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().value().clone()
    }

    /// Drop the key's lock once no caller holds or waits on it.
    fn release_lock(&self, key: &CacheKey, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn read(&self, calendar_id: &str, job_type: &str) -> Option<CacheEntry> {
        let entry = self.read_fresh(&CacheKey::new(calendar_id, job_type)).await;
        let outcome = if entry.is_some() { "hit" } else { "miss" };
        metrics::counter!(observability::CACHE_READS_TOTAL, "outcome" => outcome).increment(1);
        entry
    }

    async fn read_fresh(&self, key: &CacheKey) -> Option<CacheEntry> {
        let row = match self.backend.load(key).await {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                warn!("cache read failed for {}/{}: {e}", key.calendar_id, key.job_type);
                return None;
            }
        };
        let entry = match row.decode() {
            Ok(entry) => entry,
            Err(e) => {
                warn!("corrupt cache entry for {}/{}: {e}", key.calendar_id, key.job_type);
                return None;
            }
        };
        let age = self.clock.now() - entry.last_updated;
        if age >= self.ttl {
            debug!("stale cache entry for {}/{} ({}s old)", key.calendar_id, key.job_type, age.num_seconds());
            return None;
        }
        Some(entry)
    }

    /// Replace the entry for the key and refresh `last_updated`.
    pub async fn write(
        &self,
        calendar_id: &str,
        job_type: &str,
        dates: SlotMap,
        timezone: &str,
    ) -> Result<CacheEntry, EngineError> {
        let key = CacheKey::new(calendar_id, job_type);
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.write_locked(calendar_id, job_type, dates, timezone).await
        };
        self.release_lock(&key, lock);
        result
    }

    async fn write_locked(
        &self,
        calendar_id: &str,
        job_type: &str,
        dates: SlotMap,
        timezone: &str,
    ) -> Result<CacheEntry, EngineError> {
        let entry = CacheEntry {
            calendar_id: calendar_id.to_string(),
            job_type: job_type.to_string(),
            last_updated: self.clock.now(),
            dates,
            timezone: timezone.to_string(),
        };
        let row = CacheRow::encode(&entry)?;
        let count = row.slot_count;
        self.backend
            .upsert(row)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        metrics::gauge!(
            observability::CACHED_SLOTS,
            "calendar" => entry.calendar_id.clone(),
            "job_type" => entry.job_type.clone()
        )
        .set(count as f64);
        debug!("cached {count} slots for {calendar_id}/{job_type}");
        Ok(entry)
    }

    /// Remove one occurrence of `slot` from `date`. A date left empty is
    /// dropped from the map. The key, date and slot must all exist.
    pub async fn invalidate_slot(
        &self,
        calendar_id: &str,
        job_type: &str,
        date: &str,
        slot: &str,
    ) -> Result<CacheEntry, EngineError> {
        let key = CacheKey::new(calendar_id, job_type);
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.invalidate_locked(&key, date, slot).await
        };
        self.release_lock(&key, lock);
        result
    }

    async fn invalidate_locked(&self, key: &CacheKey, date: &str, slot: &str) -> Result<CacheEntry, EngineError> {
        let (calendar_id, job_type) = (&key.calendar_id, &key.job_type);
        let mut entry = self
            .read_fresh(key)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("cached availability for {calendar_id}/{job_type}")))?;
        let day = entry
            .dates
            .get_mut(date)
            .ok_or_else(|| EngineError::NotFound(format!("date {date}")))?;
        let pos = day
            .slots
            .iter()
            .position(|s| slot_matches(s, slot))
            .ok_or_else(|| EngineError::NotFound(format!("slot {slot} on {date}")))?;
        let removed = day.slots.remove(pos);
        if day.slots.is_empty() {
            entry.dates.remove(date);
        }

        let updated = self
            .write_locked(&entry.calendar_id, &entry.job_type, entry.dates, &entry.timezone)
            .await?;
        metrics::counter!(observability::SLOT_INVALIDATIONS_TOTAL).increment(1);
        info!("invalidated slot {removed} for {calendar_id}/{job_type}");
        Ok(updated)
    }

    /// Aggregate slot counts of every stored entry, fresh or not.
    pub async fn slot_counts(&self) -> Result<Vec<(String, String, u64)>, EngineError> {
        let rows = self
            .backend
            .rows()
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.calendar_id, r.job_type, r.slot_count))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    fn setup() -> (AvailabilityCache, Arc<FixedClock>, Arc<MemoryBackend>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let backend = Arc::new(MemoryBackend::new());
        let cache = AvailabilityCache::new(backend.clone(), clock.clone(), 6 * 3600);
        (cache, clock, backend)
    }

    fn day(slots: &[&str], code: AvailabilityCode) -> DateSlots {
        DateSlots {
            slots: slots.iter().map(|s| s.to_string()).collect(),
            availability_type: code,
        }
    }

    fn sample() -> SlotMap {
        let mut dates = SlotMap::new();
        dates.insert(
            "2026-10-19".into(),
            day(&["2026-10-19T07:30:00-04:00", "2026-10-19T08:00:00-04:00"], AvailabilityCode::F),
        );
        dates.insert("2026-10-20".into(), day(&["2026-10-20T07:30:00-04:00"], AvailabilityCode::P));
        dates
    }

    #[test]
    fn slot_matching() {
        let stored = "2026-10-19T07:30:00-04:00";
        assert!(slot_matches(stored, stored));
        assert!(slot_matches(stored, "07:30"));
        assert!(slot_matches(stored, "7:30"));
        assert!(slot_matches(stored, "7:30 AM"));
        assert!(!slot_matches(stored, "08:00"));
        assert!(!slot_matches(stored, "2026-10-19T07:30:00Z"));
        assert!(!slot_matches("garbage", "07:30"));
    }

    #[tokio::test]
    async fn read_after_write_returns_identical_data() {
        let (cache, _, _) = setup();
        cache.write("Cal@X.com", "Consult", sample(), "America/New_York").await.unwrap();
        let entry = cache.read("cal@x.com", "CONSULT").await.unwrap();
        assert_eq!(entry.dates, sample());
        assert_eq!(entry.calendar_id, "Cal@X.com");
        assert_eq!(entry.job_type, "Consult");
        assert_eq!(entry.timezone, "America/New_York");
        assert_eq!(entry.last_updated, t0());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let (cache, clock, backend) = setup();
        cache.write("cal", "job", sample(), "UTC").await.unwrap();
        clock.advance(Duration::hours(6) - Duration::seconds(1));
        assert!(cache.read("cal", "job").await.is_some());
        clock.advance(Duration::seconds(1));
        assert!(cache.read("cal", "job").await.is_none());
        // still physically stored
        assert!(backend.load(&CacheKey::new("cal", "job")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn write_replaces_and_refreshes() {
        let (cache, clock, _) = setup();
        cache.write("cal", "job", sample(), "UTC").await.unwrap();
        clock.advance(Duration::hours(5));
        let mut smaller = SlotMap::new();
        smaller.insert("2026-10-21".into(), day(&["2026-10-21T09:00:00Z"], AvailabilityCode::F));
        cache.write("CAL", "JOB", smaller.clone(), "UTC").await.unwrap();
        clock.advance(Duration::hours(5));
        let entry = cache.read("cal", "job").await.unwrap();
        assert_eq!(entry.dates, smaller);
        assert_eq!(entry.calendar_id, "CAL");
    }

    #[tokio::test]
    async fn aggregate_count_is_persisted() {
        let (cache, _, backend) = setup();
        cache.write("cal", "job", sample(), "UTC").await.unwrap();
        let row = backend.load(&CacheKey::new("cal", "job")).await.unwrap().unwrap();
        assert_eq!(row.slot_count, 3);
        assert_eq!(cache.slot_counts().await.unwrap(), vec![("cal".to_string(), "job".to_string(), 3u64)]);
    }

    #[tokio::test]
    async fn corrupt_entry_reads_as_absent() {
        let (cache, _, backend) = setup();
        cache.write("cal", "job", sample(), "UTC").await.unwrap();
        let mut row = backend.load(&CacheKey::new("cal", "job")).await.unwrap().unwrap();
        row.payload = "{not json".into();
        backend.upsert(row.clone()).await.unwrap();
        assert!(cache.read("cal", "job").await.is_none());

        row.payload = "{}".into();
        row.last_updated = "yesterday".into();
        backend.upsert(row).await.unwrap();
        assert!(cache.read("cal", "job").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_one_slot_and_decrements_count() {
        let (cache, _, backend) = setup();
        cache.write("cal", "job", sample(), "UTC").await.unwrap();
        let entry = cache
            .invalidate_slot("CAL", "job", "2026-10-19", "2026-10-19T07:30:00-04:00")
            .await
            .unwrap();
        assert_eq!(entry.dates["2026-10-19"].slots, vec!["2026-10-19T08:00:00-04:00"]);
        let row = backend.load(&CacheKey::new("cal", "job")).await.unwrap().unwrap();
        assert_eq!(row.slot_count, 2);
    }

    #[tokio::test]
    async fn invalidate_last_slot_drops_the_date() {
        let (cache, _, _) = setup();
        cache.write("cal", "job", sample(), "UTC").await.unwrap();
        let entry = cache.invalidate_slot("cal", "job", "2026-10-20", "07:30").await.unwrap();
        assert!(!entry.dates.contains_key("2026-10-20"));
        assert!(entry.dates.contains_key("2026-10-19"));
    }

    #[tokio::test]
    async fn invalidate_only_one_duplicate() {
        let (cache, _, _) = setup();
        let mut dates = SlotMap::new();
        dates.insert("2026-10-19".into(), day(&["2026-10-19T09:00:00Z", "2026-10-19T09:00:00Z"], AvailabilityCode::F));
        cache.write("cal", "job", dates, "UTC").await.unwrap();
        let entry = cache.invalidate_slot("cal", "job", "2026-10-19", "09:00").await.unwrap();
        assert_eq!(entry.dates["2026-10-19"].slots.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_reports_not_found() {
        let (cache, clock, _) = setup();
        let missing_key = cache.invalidate_slot("cal", "job", "2026-10-19", "07:30").await;
        assert!(matches!(missing_key, Err(EngineError::NotFound(_))));

        cache.write("cal", "job", sample(), "UTC").await.unwrap();
        let missing_date = cache.invalidate_slot("cal", "job", "2026-10-25", "07:30").await;
        assert!(matches!(missing_date, Err(EngineError::NotFound(_))));
        let missing_slot = cache.invalidate_slot("cal", "job", "2026-10-19", "11:00").await;
        assert!(matches!(missing_slot, Err(EngineError::NotFound(_))));

        // second removal of the same single slot
        cache.invalidate_slot("cal", "job", "2026-10-20", "07:30").await.unwrap();
        let again = cache.invalidate_slot("cal", "job", "2026-10-20", "07:30").await;
        assert!(matches!(again, Err(EngineError::NotFound(_))));

        clock.advance(Duration::hours(7));
        let stale = cache.invalidate_slot("cal", "job", "2026-10-19", "08:00").await;
        assert!(matches!(stale, Err(EngineError::NotFound(_))));
        assert!(cache.locks.is_empty());
    }

    #[tokio::test]
    async fn key_locks_are_released_after_use() {
        let (cache, _, _) = setup();
        for i in 0..50 {
            let cal = format!("cal{i}");
            cache.write(&cal, "job", sample(), "UTC").await.unwrap();
            cache.invalidate_slot(&cal, "job", "2026-10-20", "07:30").await.unwrap();
        }
        assert!(cache.locks.is_empty());
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let clock = Arc::new(FixedClock::new(t0()));
        let cache = AvailabilityCache::new(Arc::new(MemoryBackend::new()), clock, u64::MAX);
        assert_eq!(cache.ttl, Duration::seconds(MAX_CACHE_TTL_SECS as i64));
    }

    #[tokio::test]
    async fn concurrent_invalidations_do_not_lose_updates() {
        let clock = Arc::new(FixedClock::new(t0()));
        let backend = Arc::new(MemoryBackend::new());
        let cache = Arc::new(AvailabilityCache::new(backend.clone(), clock, 6 * 3600));

        let slots: Vec<String> = (0..20).map(|i| format!("2026-10-19T{:02}:00:00Z", i)).collect();
        let mut dates = SlotMap::new();
        dates.insert(
            "2026-10-19".into(),
            DateSlots { slots: slots.clone(), availability_type: AvailabilityCode::F },
        );
        cache.write("cal", "job", dates, "UTC").await.unwrap();

        let tasks: Vec<_> = slots
            .iter()
            .take(10)
            .cloned()
            .map(|slot| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.invalidate_slot("cal", "job", "2026-10-19", &slot).await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let entry = cache.read("cal", "job").await.unwrap();
        assert_eq!(entry.dates["2026-10-19"].slots, slots[10..].to_vec());
        let row = backend.load(&CacheKey::new("cal", "job")).await.unwrap().unwrap();
        assert_eq!(row.slot_count, 10);
        assert!(cache.locks.is_empty());
    }
}
