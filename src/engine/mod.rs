mod conflict;
mod error;
mod mutations;
mod queries;
pub mod resolver;
mod slots;

pub use conflict::ConflictIndex;
pub use error::EngineError;
pub use resolver::{builtin_defaults, Resolver, TemplateDefaults};
pub use slots::{generate_slots, slots_for_day};

use std::sync::Arc;

use chrono_tz::Tz;

use crate::cache::{AvailabilityCache, CacheBackend};
use crate::clock::{parse_timezone, Clock};
use crate::config::Config;
use crate::limits::MAX_ID_LEN;
use crate::store::{BusySource, ConfigStore};

/// The availability computation engine.
///
/// Stateless across requests apart from the availability cache: every
/// orchestration call builds its own [`Resolver`], so configuration tables
/// are read at most once per call and never shared between calls.
pub struct Engine {
    config_store: Arc<dyn ConfigStore>,
    busy: Arc<dyn BusySource>,
    clock: Arc<dyn Clock>,
    cache: AvailabilityCache,
    window_days: u32,
    ignore_marker: String,
    reference_tz: Tz,
}

impl Engine {
    pub fn new(
        config: &Config,
        config_store: Arc<dyn ConfigStore>,
        busy: Arc<dyn BusySource>,
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let reference_tz = parse_timezone(&config.reference_timezone)?;
        Ok(Self {
            config_store,
            busy,
            cache: AvailabilityCache::new(backend, clock.clone(), config.cache_ttl_secs),
            clock,
            window_days: config.window_days,
            ignore_marker: config.ignore_marker.clone(),
            reference_tz,
        })
    }

    pub fn cache(&self) -> &AvailabilityCache {
        &self.cache
    }

    pub fn window_days(&self) -> u32 {
        self.window_days
    }

    fn resolver(&self, defaults: &TemplateDefaults) -> Resolver<'_> {
        Resolver::new(self.config_store.as_ref(), self.reference_tz).with_defaults(defaults.clone())
    }
}

/// Trimmed, non-empty, bounded identifier.
fn require_id<'a>(field: &str, value: &'a str) -> Result<&'a str, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(EngineError::Validation(format!(
            "{field} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    Ok(value)
}
