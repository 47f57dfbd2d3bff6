use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::limits::DEFAULT_MIN_NOTICE_MINUTES;

/// Whole minutes — the unit every job setting is expressed in.
pub type Minutes = i64;

/// Per-date slot lists keyed by ISO date (`yyyy-MM-dd`). Lexical order is
/// chronological order.
pub type SlotMap = BTreeMap<String, DateSlots>;

/// Date-specific availability codes, keyed by date in the reference timezone.
pub type DateOverrides = BTreeMap<NaiveDate, AvailabilityCode>;

// ── Availability codes ───────────────────────────────────────────

/// Single-letter classification of a day's booking template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum AvailabilityCode {
    /// Full day.
    F,
    /// Partial day.
    P,
    /// Not available.
    #[default]
    N,
    M,
    L,
    A,
    E,
    O,
}

impl AvailabilityCode {
    pub const ALL: [AvailabilityCode; 8] = [
        AvailabilityCode::F,
        AvailabilityCode::P,
        AvailabilityCode::N,
        AvailabilityCode::M,
        AvailabilityCode::L,
        AvailabilityCode::A,
        AvailabilityCode::E,
        AvailabilityCode::O,
    ];

    /// Parse a stored or requested code. Anything unrecognized is `N`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "F" => AvailabilityCode::F,
            "P" => AvailabilityCode::P,
            "M" => AvailabilityCode::M,
            "L" => AvailabilityCode::L,
            "A" => AvailabilityCode::A,
            "E" => AvailabilityCode::E,
            "O" => AvailabilityCode::O,
            _ => AvailabilityCode::N,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityCode::F => "F",
            AvailabilityCode::P => "P",
            AvailabilityCode::N => "N",
            AvailabilityCode::M => "M",
            AvailabilityCode::L => "L",
            AvailabilityCode::A => "A",
            AvailabilityCode::E => "E",
            AvailabilityCode::O => "O",
        }
    }

    pub fn is_available(&self) -> bool {
        *self != AvailabilityCode::N
    }

    /// Template used when no explicit time-range row exists for the code.
    pub fn builtin_ranges(&self) -> Vec<TimeRange> {
        match self {
            AvailabilityCode::F => vec![
                TimeRange::hm((7, 30), (12, 45)),
                TimeRange::hm((12, 45), (15, 30)),
            ],
            AvailabilityCode::P => vec![TimeRange::hm((7, 30), (12, 45))],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for AvailabilityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Wall-clock ranges ────────────────────────────────────────────

/// Half-open wall-clock range `[start, end)` with no date attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Build from `(hour, minute)` pairs. Out-of-range parts clamp to midnight.
    pub fn hm(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    /// Parse a `(start, end)` pair of wall-clock strings; rejects empty ranges.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        let range = Self::new(parse_wall_time(start)?, parse_wall_time(end)?);
        (range.start < range.end).then_some(range)
    }
}

/// Parse a wall-clock time: `7:30`, `07:30`, `07:30:00`, `7:30 am`, `1:15PM`.
pub fn parse_wall_time(raw: &str) -> Option<NaiveTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    const FORMATS: [&str; 6] = ["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M%p", "%I:%M:%S %p", "%I:%M:%S%p"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
}

// ── Resolved configuration ───────────────────────────────────────

/// Per-job-type booking rules. Every duration is in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    pub duration: Minutes,
    pub spacing: Minutes,
    pub min_notice: Minutes,
    /// Overrides `duration + spacing` as the candidate step when > 0.
    pub start_interval: Minutes,
    pub title: String,
    pub description: String,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            duration: 0,
            spacing: 0,
            min_notice: DEFAULT_MIN_NOTICE_MINUTES,
            start_interval: 0,
            title: String::new(),
            description: String::new(),
        }
    }
}

impl JobSettings {
    pub fn effective_spacing(&self) -> Minutes {
        if self.start_interval > 0 {
            self.start_interval
        } else {
            self.duration.saturating_add(self.spacing)
        }
    }
}

/// Weekday → availability code. Unmapped days resolve to `N`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayProfile {
    codes: [Option<AvailabilityCode>; 7],
}

impl DayProfile {
    pub fn set(&mut self, day: Weekday, code: AvailabilityCode) {
        self.codes[day.num_days_from_sunday() as usize] = Some(code);
    }

    /// The mapped code, or `None` when the weekday has no entry.
    pub fn lookup(&self, day: Weekday) -> Option<AvailabilityCode> {
        self.codes[day.num_days_from_sunday() as usize]
    }

    pub fn get(&self, day: Weekday) -> AvailabilityCode {
        self.lookup(day).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.iter().all(Option::is_none)
    }
}

/// Where a date's availability code comes from. Tried in order; first hit wins.
#[derive(Debug, Clone, Copy)]
pub enum CodeSource<'a> {
    Override(&'a DateOverrides),
    Weekday(&'a DayProfile),
}

impl CodeSource<'_> {
    pub fn lookup(&self, date: NaiveDate) -> Option<AvailabilityCode> {
        match self {
            CodeSource::Override(overrides) => overrides.get(&date).copied(),
            CodeSource::Weekday(profile) => profile.lookup(date.weekday()),
        }
    }
}

/// Everything resolved for one `(calendar, job type)` pair.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub settings: JobSettings,
    pub profile: DayProfile,
    pub overrides: DateOverrides,
}

impl RuleSet {
    /// Override > weekday default > `N`.
    pub fn code_for(&self, date: NaiveDate) -> AvailabilityCode {
        let chain = [CodeSource::Override(&self.overrides), CodeSource::Weekday(&self.profile)];
        chain
            .iter()
            .find_map(|source| source.lookup(date))
            .unwrap_or_default()
    }
}

// ── Calendars ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub id: String,
    /// IANA identifier, e.g. `America/New_York`.
    pub timezone: String,
}

/// An existing event on a calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
}

impl BusyEvent {
    /// Events whose title carries the marker permit double-booking.
    pub fn is_ignored(&self, marker: &str) -> bool {
        !marker.is_empty() && self.title.to_lowercase().contains(&marker.to_lowercase())
    }
}

// ── Results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateSlots {
    pub slots: Vec<String>,
    pub availability_type: AvailabilityCode,
}

/// Window-mode result.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAvailability {
    pub job: JobSettings,
    pub timezone: String,
    pub dates: SlotMap,
    /// True when served from the availability cache.
    pub cached: bool,
}

impl WindowAvailability {
    pub fn slot_count(&self) -> usize {
        self.dates.values().map(|d| d.slots.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayOutcome {
    /// The date resolved to `N`.
    NotBookable,
    Open {
        availability_type: AvailabilityCode,
        slots: Vec<String>,
    },
}

/// Single-date result.
#[derive(Debug, Clone, PartialEq)]
pub struct DayReport {
    pub job: JobSettings,
    pub date: NaiveDate,
    pub timezone: String,
    pub outcome: DayOutcome,
}

// ── Cache ────────────────────────────────────────────────────────

/// Case-insensitive identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub calendar_id: String,
    pub job_type: String,
}

impl CacheKey {
    pub fn new(calendar_id: &str, job_type: &str) -> Self {
        Self {
            calendar_id: calendar_id.trim().to_lowercase(),
            job_type: job_type.trim().to_lowercase(),
        }
    }
}

/// A decoded availability snapshot. Identifiers are kept as first written.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub calendar_id: String,
    pub job_type: String,
    pub last_updated: DateTime<Utc>,
    pub dates: SlotMap,
    pub timezone: String,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.calendar_id, &self.job_type)
    }

    /// Aggregate slot count across every date.
    pub fn slot_count(&self) -> usize {
        self.dates.values().map(|d| d.slots.len()).sum()
    }
}

/// Strict ISO `yyyy-MM-dd`.
pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}
