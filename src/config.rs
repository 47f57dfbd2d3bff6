use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::*;

/// Process configuration, read once from `SLOTD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Window-mode lookahead in days, starting today.
    pub window_days: u32,
    pub cache_ttl_secs: u64,
    pub ignore_marker: String,
    /// Timezone date overrides are written in; last-resort operating timezone.
    pub reference_timezone: String,
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// JSON file with configuration tables and calendars for the binary.
    pub fixture: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            ignore_marker: DEFAULT_IGNORE_MARKER.to_string(),
            reference_timezone: DEFAULT_TIMEZONE.to_string(),
            data_dir: PathBuf::from("./data"),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            metrics_port: None,
            fixture: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or unparsable values
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let window_days: u32 = parsed(&lookup, "SLOTD_WINDOW_DAYS").unwrap_or(defaults.window_days);
        Self {
            window_days: window_days.clamp(1, MAX_WINDOW_DAYS),
            cache_ttl_secs: parsed(&lookup, "SLOTD_CACHE_TTL_SECS")
                .unwrap_or(defaults.cache_ttl_secs)
                .min(MAX_CACHE_TTL_SECS),
            ignore_marker: lookup("SLOTD_IGNORE_MARKER").unwrap_or(defaults.ignore_marker),
            reference_timezone: lookup("SLOTD_TIMEZONE")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.reference_timezone),
            data_dir: lookup("SLOTD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            compact_threshold: parsed(&lookup, "SLOTD_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "SLOTD_METRICS_PORT"),
            fixture: lookup("SLOTD_FIXTURE").map(PathBuf::from),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse().ok())
}
