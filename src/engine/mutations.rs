use tracing::debug;

use crate::model::{parse_iso_date, CacheEntry};

use super::{require_id, Engine, EngineError};

impl Engine {
    /// Remove one booked slot from the cached availability of
    /// `(calendar_id, job_type)`. `time` is the cached slot string or its
    /// wall-clock time.
    pub async fn invalidate_slot(
        &self,
        calendar_id: &str,
        job_type: &str,
        date: &str,
        time: &str,
    ) -> Result<CacheEntry, EngineError> {
        let calendar_id = require_id("calendarId", calendar_id)?;
        let job_type = require_id("jobType", job_type)?;
        let day = parse_iso_date(date)
            .ok_or_else(|| EngineError::Validation(format!("malformed date: {date}")))?;
        let time = time.trim();
        if time.is_empty() {
            return Err(EngineError::Validation("time is required".into()));
        }

        let date_key = day.format("%Y-%m-%d").to_string();
        debug!("invalidating {time} on {date_key} for {calendar_id}/{job_type}");
        self.cache
            .invalidate_slot(calendar_id, job_type, &date_key, time)
            .await
    }

    /// `(calendar id, job type, slot count)` for every stored entry.
    pub async fn cached_slot_counts(&self) -> Result<Vec<(String, String, u64)>, EngineError> {
        self.cache.slot_counts().await
    }
}
