use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Weekday};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::limits::MAX_JOB_MINUTES;
use crate::model::*;
use crate::store::{ConfigStore, Table, DATE_OVERRIDES, JOB_SETTINGS, TIME_RANGES, WEEKLY_PROFILES};

/// Per-code fallback templates used when no explicit time-range row exists.
pub type TemplateDefaults = HashMap<AvailabilityCode, Vec<TimeRange>>;

/// The built-in `F` and `P` templates.
pub fn builtin_defaults() -> TemplateDefaults {
    AvailabilityCode::ALL
        .into_iter()
        .map(|code| (code, code.builtin_ranges()))
        .filter(|(_, ranges)| !ranges.is_empty())
        .collect()
}

// ── Column mapping ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Calendar,
    JobType,
    Duration,
    Spacing,
    MinNotice,
    StartInterval,
    Title,
    Description,
    Date,
    Code,
    Start1,
    End1,
    Start2,
    End2,
    Day(Weekday),
}

const WEEKDAY_SYNONYMS: [(Weekday, &[&str]); 7] = [
    (Weekday::Sun, &["sunday", "sun", "su"]),
    (Weekday::Mon, &["monday", "mon", "mo"]),
    (Weekday::Tue, &["tuesday", "tues", "tue", "tu"]),
    (Weekday::Wed, &["wednesday", "wed", "we"]),
    (Weekday::Thu, &["thursday", "thurs", "thur", "thu", "th"]),
    (Weekday::Fri, &["friday", "fri", "fr"]),
    (Weekday::Sat, &["saturday", "sat", "sa"]),
];

impl Field {
    fn synonyms(&self) -> &'static [&'static str] {
        match self {
            Field::Calendar => &["calendar id", "calendarid", "calendar", "cal id", "calendar email"],
            Field::JobType => &["job type", "jobtype", "job", "service", "appointment type"],
            Field::Duration => &["duration", "length", "duration minutes"],
            Field::Spacing => &["spacing", "buffer", "gap"],
            Field::MinNotice => &["min notice", "minimum notice", "minnotice", "notice", "lead time"],
            Field::StartInterval => &["start interval", "startinterval", "interval", "slot interval"],
            Field::Title => &["title", "name"],
            Field::Description => &["description", "details"],
            Field::Date => &["date", "override date"],
            Field::Code => &["availability", "availability type", "availability code", "code", "type"],
            Field::Start1 => &["start", "start 1", "start1", "start time", "start time 1"],
            Field::End1 => &["end", "end 1", "end1", "end time", "end time 1"],
            Field::Start2 => &["start 2", "start2", "start time 2"],
            Field::End2 => &["end 2", "end2", "end time 2"],
            Field::Day(day) => WEEKDAY_SYNONYMS
                .iter()
                .find(|(d, _)| d == day)
                .map(|(_, names)| *names)
                .unwrap_or(&[]),
        }
    }

    fn weekdays() -> impl Iterator<Item = Field> {
        WEEKDAY_SYNONYMS.iter().map(|(day, _)| Field::Day(*day))
    }
}

/// Lowercase, `_`/`-` as spaces, parentheticals dropped, whitespace collapsed.
fn normalize_header(raw: &str) -> String {
    let without_parens = match raw.find('(') {
        Some(i) => &raw[..i],
        None => raw,
    };
    without_parens
        .to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Header cell → column index for the fields a table is read for.
struct ColumnMap {
    positions: HashMap<Field, usize>,
}

impl ColumnMap {
    fn new(header: &[String], fields: &[Field]) -> Self {
        let mut positions = HashMap::new();
        for (i, cell) in header.iter().enumerate() {
            let name = normalize_header(cell);
            if let Some(field) = fields.iter().find(|f| f.synonyms().contains(&name.as_str())) {
                positions.entry(*field).or_insert(i);
            }
        }
        Self { positions }
    }

    fn has(&self, field: Field) -> bool {
        self.positions.contains_key(&field)
    }

    fn cell<'r>(&self, row: &'r [String], field: Field) -> &'r str {
        self.positions
            .get(&field)
            .and_then(|&i| row.get(i))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    /// How specifically a row targets `(calendar, job_type)`. Blank key cells
    /// are wildcards; a non-blank mismatch excludes the row.
    fn score(&self, row: &[String], calendar_id: &str, job_type: &str) -> Option<u8> {
        let mut score = 0;
        for (field, wanted, weight) in [(Field::Calendar, calendar_id, 2), (Field::JobType, job_type, 1)] {
            if !self.has(field) {
                continue;
            }
            let cell = self.cell(row, field);
            if cell.is_empty() {
                continue;
            }
            if !keys_match(cell, wanted) {
                return None;
            }
            score += weight;
        }
        Some(score)
    }
}

fn keys_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Strip everything but digits and the first `.`, then parse. Empty or
/// unparsable input yields `default`; larger values saturate at
/// [`MAX_JOB_MINUTES`].
pub fn parse_minutes(raw: &str, default: Minutes) -> Minutes {
    let mut seen_dot = false;
    let cleaned: String = raw
        .chars()
        .filter(|c| {
            if c.is_ascii_digit() {
                true
            } else if *c == '.' && !seen_dot {
                seen_dot = true;
                true
            } else {
                false
            }
        })
        .collect();
    cleaned
        .parse::<f64>()
        .map(|v| v.trunc().min(MAX_JOB_MINUTES as f64) as Minutes)
        .unwrap_or(default)
}

/// An override date cell: ISO date, or a full timestamp read in `tz`.
fn parse_override_date(raw: &str, tz: Tz) -> Option<chrono::NaiveDate> {
    parse_iso_date(raw).or_else(|| {
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&tz).date_naive())
    })
}

// ── Resolver ─────────────────────────────────────────────────────

/// Tables read during one orchestration call, memoized by name on first
/// access. A failed read is remembered as `None` for the rest of the call.
#[derive(Default)]
pub struct RequestScope {
    tables: HashMap<String, Option<Arc<Table>>>,
    reads: usize,
}

/// Turns configuration tables into typed rules for one request.
///
/// Every lookup degrades to a default instead of failing: a missing or
/// unreadable table yields default job settings, an all-`N` profile and no
/// overrides.
pub struct Resolver<'a> {
    store: &'a dyn ConfigStore,
    reference_tz: Tz,
    defaults: TemplateDefaults,
    scope: RequestScope,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn ConfigStore, reference_tz: Tz) -> Self {
        Self {
            store,
            reference_tz,
            defaults: builtin_defaults(),
            scope: RequestScope::default(),
        }
    }

    /// Replace fallback templates for the codes present in `overrides`.
    pub fn with_defaults(mut self, overrides: TemplateDefaults) -> Self {
        self.defaults.extend(overrides);
        self
    }

    /// Number of store reads issued so far.
    pub fn table_reads(&self) -> usize {
        self.scope.reads
    }

    async fn table(&mut self, name: &str) -> Option<Arc<Table>> {
        if let Some(cached) = self.scope.tables.get(name) {
            return cached.clone();
        }
        self.scope.reads += 1;
        let loaded = match self.store.table(name).await {
            Ok(table) => Some(Arc::new(table)),
            Err(e) => {
                warn!("config table {name} unreadable, using defaults: {e}");
                None
            }
        };
        self.scope.tables.insert(name.to_string(), loaded.clone());
        loaded
    }

    pub async fn job_settings(&mut self, job_type: &str) -> JobSettings {
        let Some(table) = self.table(JOB_SETTINGS).await else {
            return JobSettings::default();
        };
        let map = ColumnMap::new(
            &table.header,
            &[
                Field::JobType,
                Field::Duration,
                Field::Spacing,
                Field::MinNotice,
                Field::StartInterval,
                Field::Title,
                Field::Description,
            ],
        );
        if !map.has(Field::JobType) {
            return JobSettings::default();
        }
        let Some(row) = table
            .rows
            .iter()
            .find(|row| keys_match(map.cell(row, Field::JobType), job_type))
        else {
            debug!("no job settings for {job_type}, using defaults");
            return JobSettings::default();
        };
        let defaults = JobSettings::default();
        JobSettings {
            duration: parse_minutes(map.cell(row, Field::Duration), defaults.duration),
            spacing: parse_minutes(map.cell(row, Field::Spacing), defaults.spacing),
            min_notice: parse_minutes(map.cell(row, Field::MinNotice), defaults.min_notice),
            start_interval: parse_minutes(map.cell(row, Field::StartInterval), defaults.start_interval),
            title: map.cell(row, Field::Title).to_string(),
            description: map.cell(row, Field::Description).to_string(),
        }
    }

    pub async fn day_profile(&mut self, calendar_id: &str, job_type: &str) -> DayProfile {
        let Some(table) = self.table(WEEKLY_PROFILES).await else {
            return DayProfile::default();
        };
        let mut fields = vec![Field::Calendar, Field::JobType];
        fields.extend(Field::weekdays());
        let map = ColumnMap::new(&table.header, &fields);

        let mut best: Option<(u8, &Vec<String>)> = None;
        for row in &table.rows {
            if let Some(score) = map.score(row, calendar_id, job_type)
                && best.is_none_or(|(s, _)| score > s)
            {
                best = Some((score, row));
            }
        }

        let mut profile = DayProfile::default();
        if let Some((_, row)) = best {
            for field in Field::weekdays() {
                let Field::Day(day) = field else { continue };
                let cell = map.cell(row, field);
                if !cell.is_empty() {
                    profile.set(day, AvailabilityCode::parse(cell));
                }
            }
        }
        profile
    }

    pub async fn date_overrides(&mut self, calendar_id: &str, job_type: &str) -> DateOverrides {
        let Some(table) = self.table(DATE_OVERRIDES).await else {
            return DateOverrides::new();
        };
        let map = ColumnMap::new(&table.header, &[Field::Calendar, Field::JobType, Field::Date, Field::Code]);
        if !map.has(Field::Date) {
            return DateOverrides::new();
        }

        let mut scored: HashMap<chrono::NaiveDate, (u8, AvailabilityCode)> = HashMap::new();
        for row in &table.rows {
            let Some(score) = map.score(row, calendar_id, job_type) else {
                continue;
            };
            let raw_date = map.cell(row, Field::Date);
            let Some(date) = parse_override_date(raw_date, self.reference_tz) else {
                debug!("skipping override with unparsable date {raw_date:?}");
                continue;
            };
            let code = AvailabilityCode::parse(map.cell(row, Field::Code));
            match scored.get(&date) {
                Some((existing, _)) if *existing >= score => {}
                _ => {
                    scored.insert(date, (score, code));
                }
            }
        }
        scored.into_iter().map(|(date, (_, code))| (date, code)).collect()
    }

    pub async fn rules(&mut self, calendar_id: &str, job_type: &str) -> RuleSet {
        RuleSet {
            settings: self.job_settings(job_type).await,
            profile: self.day_profile(calendar_id, job_type).await,
            overrides: self.date_overrides(calendar_id, job_type).await,
        }
    }

    /// Explicit template row > request/built-in default > nothing.
    pub async fn time_ranges(&mut self, code: AvailabilityCode) -> Vec<TimeRange> {
        if let Some(table) = self.table(TIME_RANGES).await {
            let map = ColumnMap::new(
                &table.header,
                &[Field::Code, Field::Start1, Field::End1, Field::Start2, Field::End2],
            );
            let explicit = table
                .rows
                .iter()
                .find(|row| map.has(Field::Code) && keys_match(map.cell(row, Field::Code), code.as_str()))
                .map(|row| {
                    [(Field::Start1, Field::End1), (Field::Start2, Field::End2)]
                        .into_iter()
                        .filter_map(|(s, e)| TimeRange::parse(map.cell(row, s), map.cell(row, e)))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if !explicit.is_empty() {
                return explicit;
            }
        }
        self.defaults.get(&code).cloned().unwrap_or_default()
    }
}
