use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::{Engine, EngineError, TemplateDefaults};
use crate::model::*;
use crate::observability;

// ── Requests ─────────────────────────────────────────────────────

/// One line of input, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Request {
    Read(ReadRequest),
    Invalidate(WriteRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RangeDto {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadRequest {
    pub calendar_id: Option<String>,
    pub job_type: Option<String>,
    /// Per-code templates replacing the built-in fallbacks for this request.
    pub time_ranges: Option<BTreeMap<String, Vec<RangeDto>>>,
    pub load_all: bool,
    pub date: Option<String>,
    pub timezone: Option<String>,
    pub bypass_cache: bool,
}

impl ReadRequest {
    fn template_defaults(&self) -> Result<TemplateDefaults, EngineError> {
        let mut defaults = TemplateDefaults::new();
        let Some(ranges) = &self.time_ranges else {
            return Ok(defaults);
        };
        for (raw_code, pairs) in ranges {
            let code = AvailabilityCode::parse(raw_code);
            if code.as_str() != raw_code.trim().to_ascii_uppercase() {
                return Err(EngineError::Validation(format!(
                    "unknown availability code in timeRanges: {raw_code}"
                )));
            }
            let parsed = pairs
                .iter()
                .map(|p| {
                    TimeRange::parse(&p.start, &p.end).ok_or_else(|| {
                        EngineError::Validation(format!(
                            "invalid time range {}-{} for code {code}",
                            p.start, p.end
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            defaults.insert(code, parsed);
        }
        Ok(defaults)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteRequest {
    pub calendar_id: Option<String>,
    pub job_type: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
}

// ── Responses ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Window(WindowBody),
    Day(DayBody),
    Invalidated(InvalidatedBody),
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    pub title: String,
    pub description: String,
    pub duration: Minutes,
}

impl From<&JobSettings> for JobDetails {
    fn from(s: &JobSettings) -> Self {
        Self {
            title: s.title.clone(),
            description: s.description.clone(),
            duration: s.duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowBody {
    pub job: JobDetails,
    pub timezone: String,
    pub cached: bool,
    pub slot_count: usize,
    pub dates: SlotMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayBody {
    pub job: JobDetails,
    pub date: String,
    pub timezone: String,
    pub availability_type: AvailabilityCode,
    pub slots: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidatedBody {
    pub calendar_id: String,
    pub job_type: String,
    pub date: String,
    pub time: String,
    /// Slots left in the cache entry after removal.
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// `validation`, `not_found`, `upstream` or `storage`.
    pub error: &'static str,
    pub message: String,
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::Error(ErrorBody {
            error: e.kind(),
            message: e.to_string(),
        })
    }
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

// ── Dispatch ─────────────────────────────────────────────────────

/// Parse one newline-delimited JSON request.
pub fn parse_request(line: &str) -> Result<Request, EngineError> {
    serde_json::from_str(line).map_err(|e| EngineError::Validation(format!("malformed request: {e}")))
}

/// Parse and handle one input line. Never fails: errors become responses.
pub async fn handle_line(engine: &Engine, line: &str) -> Response {
    match parse_request(line) {
        Ok(request) => handle(engine, request).await,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "action" => "unknown", "status" => "error")
                .increment(1);
            e.into()
        }
    }
}

pub async fn handle(engine: &Engine, request: Request) -> Response {
    let action = observability::action_label(&request);
    let start = Instant::now();

    let result = match request {
        Request::Read(read) => handle_read(engine, read).await,
        Request::Invalidate(write) => handle_invalidate(engine, write).await,
    };
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            warn!("{action} failed: {e}");
            e.into()
        }
    };

    let status = if response.is_error() { "error" } else { "ok" };
    metrics::counter!(observability::REQUESTS_TOTAL, "action" => action, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "action" => action)
        .record(start.elapsed().as_secs_f64());
    response
}

async fn handle_read(engine: &Engine, read: ReadRequest) -> Result<Response, EngineError> {
    let defaults = read.template_defaults()?;
    let calendar_id = read.calendar_id.as_deref().unwrap_or_default();
    let job_type = read.job_type.as_deref().unwrap_or_default();
    let timezone = read.timezone.as_deref();

    if read.load_all {
        let window = engine
            .load_window(calendar_id, job_type, timezone, &defaults, read.bypass_cache)
            .await?;
        return Ok(Response::Window(WindowBody {
            job: JobDetails::from(&window.job),
            slot_count: window.slot_count(),
            timezone: window.timezone,
            cached: window.cached,
            dates: window.dates,
        }));
    }

    let date = read.date.as_deref().unwrap_or_default();
    let report = engine
        .compute_date(calendar_id, job_type, date, timezone, &defaults)
        .await?;
    let date = report.date.format("%Y-%m-%d").to_string();
    let (availability_type, slots, message) = match report.outcome {
        DayOutcome::NotBookable => (
            AvailabilityCode::N,
            Vec::new(),
            Some(format!("{date} is not available for booking")),
        ),
        DayOutcome::Open { availability_type, slots } => (availability_type, slots, None),
    };
    Ok(Response::Day(DayBody {
        job: JobDetails::from(&report.job),
        date,
        timezone: report.timezone,
        availability_type,
        slots,
        message,
    }))
}

async fn handle_invalidate(engine: &Engine, write: WriteRequest) -> Result<Response, EngineError> {
    let calendar_id = write.calendar_id.as_deref().unwrap_or_default();
    let job_type = write.job_type.as_deref().unwrap_or_default();
    let date = write.date.as_deref().unwrap_or_default();
    let time = write.time.as_deref().unwrap_or_default();

    let entry = engine.invalidate_slot(calendar_id, job_type, date, time).await?;
    Ok(Response::Invalidated(InvalidatedBody {
        calendar_id: entry.calendar_id.clone(),
        job_type: entry.job_type.clone(),
        date: date.trim().to_string(),
        time: time.trim().to_string(),
        remaining: entry.slot_count(),
    }))
}
