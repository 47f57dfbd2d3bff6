#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Missing or malformed caller input.
    Validation(String),
    /// Unknown calendar, cache key, date or slot.
    NotFound(String),
    /// A collaborator could not be read and no default applies.
    Upstream(String),
    /// The cache backing store rejected a write.
    Storage(String),
}

impl EngineError {
    /// Short machine-readable kind, used in responses and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Upstream(_) => "upstream",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::Upstream(e) => write!(f, "upstream read failed: {e}"),
            EngineError::Storage(e) => write!(f, "cache storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
