/// Width of one conflict-index bucket.
pub const BUCKET_MINUTES: i64 = 5;

/// Applied when a job's minimum notice cell is empty or unparsable.
pub const DEFAULT_MIN_NOTICE_MINUTES: i64 = 1440;

/// Cache entries older than this are reported absent.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 6 * 60 * 60;

/// Window-mode lookahead when none is configured.
pub const DEFAULT_WINDOW_DAYS: u32 = 60;

pub const MAX_WINDOW_DAYS: u32 = 366;

/// Ceiling for any minute value read from job settings: one maximal window.
pub const MAX_JOB_MINUTES: i64 = MAX_WINDOW_DAYS as i64 * 24 * 60;

/// Ceiling for the cache TTL; entries older than a maximal window are stale anyway.
pub const MAX_CACHE_TTL_SECS: u64 = MAX_JOB_MINUTES as u64 * 60;

/// Upper bound on calendar ids and job types accepted from callers.
pub const MAX_ID_LEN: usize = 256;

/// Hard stop for the candidate loop of a single time range.
pub const MAX_CANDIDATES_PER_RANGE: usize = 24 * 60;

/// Busy-event title substring that permits double-booking.
pub const DEFAULT_IGNORE_MARKER: &str = "[ignore]";

pub const DEFAULT_TIMEZONE: &str = "UTC";

pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
