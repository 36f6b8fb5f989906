use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A weight mutation that would breach one of the score budgets.
///
/// `current` is the total already consumed by every other field in the affected
/// budget and `remaining` the headroom left for the field being written.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("`{field}` exceeds its budget: {current} of {limit} already used, {remaining} remaining")]
pub struct BudgetError {
    pub field: String,
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
}

impl BudgetError {
    pub fn new(field: impl Into<String>, current: u32, limit: u32) -> Self {
        Self {
            field: field.into(),
            current,
            limit,
            remaining: limit.saturating_sub(current),
        }
    }
}

/// Delete or deactivate blocked because something still references the record.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{kind} `{id}` is in use: {reason}")]
pub struct InUseError {
    pub kind: String,
    pub id: String,
    pub reason: String,
}

impl InUseError {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Malformed risk threshold table.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigurationError {
    #[error("risk threshold table is empty")]
    EmptyTable,
    #[error("risk threshold table must start at 0 (starts at {min})")]
    DoesNotStartAtZero { min: u32 },
    #[error("risk threshold entry `{level}` has min {min} >= max {max}")]
    EmptyRange { level: String, min: u32, max: u32 },
    #[error("risk threshold gap or overlap between `{previous}` (ends {end}) and `{next}` (starts {start})")]
    NotContiguous {
        previous: String,
        end: u32,
        next: String,
        start: u32,
    },
    #[error("risk threshold table must end at {expected} (ends at {actual})")]
    DoesNotCoverMax { expected: u32, actual: u32 },
    #[error("risk threshold levels out of order: `{level}` at position {position}")]
    LevelOutOfOrder { level: String, position: usize },
    #[error("risk threshold table is missing level `{level}`")]
    MissingLevel { level: String },
    #[error("score {score} is outside the risk threshold table")]
    ScoreOutOfRange { score: u32 },
}

/// Every way a candidate configuration can fail validation.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ValidationError {
    #[error(transparent)]
    Budget(BudgetError),
    #[error(transparent)]
    Thresholds(ConfigurationError),
    #[error("`{field}` must be within {min}..={max} (got {value})")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("`{field}` references unknown {kind} `{id}`")]
    UnknownReference {
        field: String,
        kind: String,
        id: String,
    },
    #[error("`{field}` must not be blank")]
    Blank { field: String },
}

impl From<BudgetError> for ValidationError {
    fn from(err: BudgetError) -> Self {
        Self::Budget(err)
    }
}

impl From<ConfigurationError> for ValidationError {
    fn from(err: ConfigurationError) -> Self {
        Self::Thresholds(err)
    }
}

/// Errors surfaced to callers of the store, catalog and engine.
///
/// Scoring-time integration failures never appear here; they are absorbed into
/// the scan result as [`DegradedScanWarning`]s.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    InUse(#[from] InUseError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Validation(ValidationError),
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} `{id}` already exists")]
    Conflict { kind: &'static str, id: String },
    #[error("scan cancelled after {elapsed_ms} ms")]
    Cancelled { elapsed_ms: u64 },
}

impl From<ValidationError> for EngineError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Budget(budget) => Self::Budget(budget),
            ValidationError::Thresholds(thresholds) => Self::Configuration(thresholds),
            other => Self::Validation(other),
        }
    }
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Which external integration a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    Check,
    TiSource,
    AiModel,
}

/// A TI source, AI model or check integration that failed or timed out.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{kind:?} `{id}` failed: {message}")]
pub struct ExternalIntegrationError {
    pub kind: IntegrationKind,
    pub id: String,
    pub message: String,
    pub timed_out: bool,
}

/// Non-fatal degradations attached to a scan result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradedScanWarning {
    Stage2TimedOut { timeout_ms: u64 },
    CheckFailed { check_id: String, message: String },
    TiSourceFailed { source_id: String, message: String },
    AiUnavailable,
    AiLowConfidence,
}

impl From<&ExternalIntegrationError> for DegradedScanWarning {
    fn from(err: &ExternalIntegrationError) -> Self {
        match err.kind {
            IntegrationKind::Check => Self::CheckFailed {
                check_id: err.id.clone(),
                message: err.message.clone(),
            },
            IntegrationKind::TiSource => Self::TiSourceFailed {
                source_id: err.id.clone(),
                message: err.message.clone(),
            },
            IntegrationKind::AiModel => Self::AiUnavailable,
        }
    }
}
