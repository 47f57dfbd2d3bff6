use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::clock::{day_bounds, format_slot, local_date, parse_timezone};
use crate::model::*;
use crate::observability;

use super::conflict::ConflictIndex;
use super::slots::slots_for_day;
use super::{require_id, Engine, EngineError, Resolver, TemplateDefaults};

impl Engine {
    /// Requested timezone, else the calendar's own, else the reference zone.
    /// Fails with `NotFound` when the calendar is unknown.
    async fn operating_timezone(
        &self,
        calendar_id: &str,
        requested: Option<&str>,
    ) -> Result<Tz, EngineError> {
        let info = self
            .busy
            .calendar(calendar_id)
            .await
            .map_err(|e| EngineError::Upstream(format!("calendar {calendar_id}: {e}")))?
            .ok_or_else(|| EngineError::NotFound(format!("calendar {calendar_id}")))?;

        if let Some(name) = requested.map(str::trim).filter(|s| !s.is_empty()) {
            return parse_timezone(name);
        }
        if info.timezone.trim().is_empty() {
            return Ok(self.reference_tz);
        }
        match parse_timezone(&info.timezone) {
            Ok(tz) => Ok(tz),
            Err(_) => {
                warn!(
                    "calendar {calendar_id} has unknown timezone {:?}, using {}",
                    info.timezone,
                    self.reference_tz.name()
                );
                Ok(self.reference_tz)
            }
        }
    }

    /// Slots for one bookable date, formatted in `tz`.
    #[allow(clippy::too_many_arguments)]
    async fn day_slots(
        &self,
        resolver: &mut Resolver<'_>,
        calendar_id: &str,
        tz: Tz,
        date: NaiveDate,
        code: AvailabilityCode,
        settings: &JobSettings,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, EngineError> {
        let ranges = resolver.time_ranges(code).await;
        if ranges.is_empty() {
            debug!("no time ranges for code {code} on {date}");
            return Ok(Vec::new());
        }

        let (day_start, day_end) = day_bounds(tz, date);
        let events = self
            .busy
            .busy_between(calendar_id, day_start, day_end)
            .await
            .map_err(|e| {
                metrics::counter!(observability::BUSY_SOURCE_ERRORS_TOTAL).increment(1);
                EngineError::Upstream(format!("busy intervals for {calendar_id} on {date}: {e}"))
            })?;
        let index = ConflictIndex::build(
            day_start,
            day_end,
            events.iter().filter(|e| !e.is_ignored(&self.ignore_marker)),
        );

        let slots = slots_for_day(tz, date, &ranges, settings, now, &index);
        Ok(slots.into_iter().map(|s| format_slot(tz, s)).collect())
    }

    /// Window mode: every bookable date from today (in the operating
    /// timezone) for `window_days` days. Dates without slots are omitted.
    pub async fn compute_window(
        &self,
        calendar_id: &str,
        job_type: &str,
        timezone: Option<&str>,
        defaults: &TemplateDefaults,
    ) -> Result<WindowAvailability, EngineError> {
        let calendar_id = require_id("calendarId", calendar_id)?;
        let job_type = require_id("jobType", job_type)?;
        let tz = self.operating_timezone(calendar_id, timezone).await?;
        let started = Instant::now();

        let mut resolver = self.resolver(defaults);
        let rules = resolver.rules(calendar_id, job_type).await;
        let now = self.clock.now();
        let today = local_date(tz, now);

        let mut dates = SlotMap::new();
        for date in today.iter_days().take(self.window_days as usize) {
            let code = rules.code_for(date);
            if !code.is_available() {
                continue;
            }
            let slots = self
                .day_slots(&mut resolver, calendar_id, tz, date, code, &rules.settings, now)
                .await?;
            if !slots.is_empty() {
                dates.insert(
                    date.format("%Y-%m-%d").to_string(),
                    DateSlots { slots, availability_type: code },
                );
            }
        }

        let result = WindowAvailability {
            job: rules.settings,
            timezone: tz.name().to_string(),
            dates,
            cached: false,
        };
        let count = result.slot_count();
        metrics::histogram!(observability::WINDOW_COMPUTE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(observability::SLOTS_GENERATED_TOTAL).increment(count as u64);
        info!(
            "computed {count} slots over {} dates for {calendar_id}/{job_type} ({} table reads)",
            result.dates.len(),
            resolver.table_reads()
        );
        Ok(result)
    }

    /// Single-date mode. `date` must be ISO `yyyy-MM-dd`. A date resolving to
    /// `N` is reported as not bookable rather than failing.
    pub async fn compute_date(
        &self,
        calendar_id: &str,
        job_type: &str,
        date: &str,
        timezone: Option<&str>,
        defaults: &TemplateDefaults,
    ) -> Result<DayReport, EngineError> {
        let calendar_id = require_id("calendarId", calendar_id)?;
        let job_type = require_id("jobType", job_type)?;
        if date.trim().is_empty() {
            return Err(EngineError::Validation("date is required".into()));
        }
        let day = parse_iso_date(date)
            .ok_or_else(|| EngineError::Validation(format!("malformed date: {date}")))?;
        let tz = self.operating_timezone(calendar_id, timezone).await?;

        let mut resolver = self.resolver(defaults);
        let rules = resolver.rules(calendar_id, job_type).await;
        let code = rules.code_for(day);
        let outcome = if code.is_available() {
            let now = self.clock.now();
            let slots = self
                .day_slots(&mut resolver, calendar_id, tz, day, code, &rules.settings, now)
                .await?;
            metrics::counter!(observability::SLOTS_GENERATED_TOTAL).increment(slots.len() as u64);
            DayOutcome::Open { availability_type: code, slots }
        } else {
            DayOutcome::NotBookable
        };

        Ok(DayReport {
            job: rules.settings,
            date: day,
            timezone: tz.name().to_string(),
            outcome,
        })
    }

    /// Window mode through the availability cache. A fresh entry written in
    /// the same operating timezone is served as is; anything else is
    /// recomputed and written back. Requests carrying their own time-range
    /// defaults neither read nor replace the shared entry.
    pub async fn load_window(
        &self,
        calendar_id: &str,
        job_type: &str,
        timezone: Option<&str>,
        defaults: &TemplateDefaults,
        bypass_cache: bool,
    ) -> Result<WindowAvailability, EngineError> {
        let calendar_id = require_id("calendarId", calendar_id)?;
        let job_type = require_id("jobType", job_type)?;

        let shared = defaults.is_empty();
        if shared && !bypass_cache {
            let tz = self.operating_timezone(calendar_id, timezone).await?;
            if let Some(entry) = self.cache.read(calendar_id, job_type).await {
                if entry.timezone == tz.name() {
                    let job = self.resolver(defaults).job_settings(job_type).await;
                    debug!("serving cached availability for {calendar_id}/{job_type}");
                    return Ok(WindowAvailability {
                        job,
                        timezone: entry.timezone,
                        dates: entry.dates,
                        cached: true,
                    });
                }
                debug!(
                    "cached availability for {calendar_id}/{job_type} is in {}, wanted {}",
                    entry.timezone,
                    tz.name()
                );
            }
        }

        let computed = self
            .compute_window(calendar_id, job_type, timezone, defaults)
            .await?;
        if !shared {
            debug!("request-specific templates for {calendar_id}/{job_type}, not cached");
            return Ok(computed);
        }
        if let Err(e) = self
            .cache
            .write(calendar_id, job_type, computed.dates.clone(), &computed.timezone)
            .await
        {
            warn!("could not cache availability for {calendar_id}/{job_type}: {e}");
        }
        Ok(computed)
    }
}
