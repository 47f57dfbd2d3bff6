use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{BusyEvent, CalendarInfo};

pub const JOB_SETTINGS: &str = "job_settings";
pub const WEEKLY_PROFILES: &str = "weekly_profiles";
pub const DATE_OVERRIDES: &str = "date_overrides";
pub const TIME_RANGES: &str = "time_ranges";

/// A collaborator read or write failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError(pub String);

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SourceError {}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError(e.to_string())
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError(e.to_string())
    }
}

/// Untyped rows as kept by a spreadsheet-like store. The first row of the
/// sheet is `header`; cells are raw strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub header: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(header: &[&str]) -> Self {
        Self {
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(mut self, cells: &[&str]) -> Self {
        self.rows.push(cells.iter().map(|c| c.to_string()).collect());
        self
    }
}

/// Row-oriented configuration tables, looked up by table name.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn table(&self, name: &str) -> Result<Table, SourceError>;
}

/// Calendars and their existing events.
#[async_trait]
pub trait BusySource: Send + Sync {
    /// `None` when the calendar is unknown.
    async fn calendar(&self, calendar_id: &str) -> Result<Option<CalendarInfo>, SourceError>;

    /// Every event overlapping `[start, end)`.
    async fn busy_between(
        &self,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BusyEvent>, SourceError>;
}

// ── In-memory implementations ────────────────────────────────────

#[derive(Default)]
pub struct MemoryConfigStore {
    tables: DashMap<String, Table>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_table(&self, name: &str, table: Table) {
        self.tables.insert(name.to_string(), table);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    /// A table that was never written reads as empty.
    async fn table(&self, name: &str) -> Result<Table, SourceError> {
        Ok(self
            .tables
            .get(name)
            .map(|t| t.value().clone())
            .unwrap_or_default())
    }
}

struct CalendarRecord {
    info: CalendarInfo,
    /// Sorted by start.
    events: Vec<BusyEvent>,
}

#[derive(Default)]
pub struct MemoryBusySource {
    calendars: DashMap<String, CalendarRecord>,
}

impl MemoryBusySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_calendar(&self, id: &str, timezone: &str) {
        self.calendars.insert(
            id.trim().to_lowercase(),
            CalendarRecord {
                info: CalendarInfo {
                    id: id.to_string(),
                    timezone: timezone.to_string(),
                },
                events: Vec::new(),
            },
        );
    }

    /// Returns false when the calendar is unknown.
    pub fn add_event(&self, calendar_id: &str, event: BusyEvent) -> bool {
        let Some(mut record) = self.calendars.get_mut(&calendar_id.trim().to_lowercase()) else {
            return false;
        };
        let pos = record.events.partition_point(|e| e.start <= event.start);
        record.events.insert(pos, event);
        true
    }
}

#[async_trait]
impl BusySource for MemoryBusySource {
    async fn calendar(&self, calendar_id: &str) -> Result<Option<CalendarInfo>, SourceError> {
        Ok(self
            .calendars
            .get(&calendar_id.trim().to_lowercase())
            .map(|r| r.info.clone()))
    }

    async fn busy_between(
        &self,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BusyEvent>, SourceError> {
        let Some(record) = self.calendars.get(&calendar_id.trim().to_lowercase()) else {
            return Ok(Vec::new());
        };
        let right_bound = record.events.partition_point(|e| e.start < end);
        Ok(record.events[..right_bound]
            .iter()
            .filter(|e| e.end > start)
            .cloned()
            .collect())
    }
}

// ── Fixture files ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarFixture {
    pub id: String,
    pub timezone: String,
    #[serde(default)]
    pub events: Vec<BusyEvent>,
}

/// JSON document seeding the in-memory store and source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub tables: HashMap<String, Table>,
    #[serde(default)]
    pub calendars: Vec<CalendarFixture>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn into_sources(self) -> (MemoryConfigStore, MemoryBusySource) {
        let store = MemoryConfigStore::new();
        for (name, table) in self.tables {
            store.put_table(&name, table);
        }
        let source = MemoryBusySource::new();
        for cal in self.calendars {
            source.add_calendar(&cal.id, &cal.timezone);
            for event in cal.events {
                source.add_event(&cal.id, event);
            }
        }
        (store, source)
    }
}
