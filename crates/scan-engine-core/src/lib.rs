pub mod admin;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod consensus;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod report;
pub mod settings;
pub mod stats;

/// Ceiling on the sum of category weights.
pub const MAX_CATEGORY_SCORE: u32 = 535;
/// Ceiling on the sum of TI source weights.
pub const MAX_TI_SCORE: u32 = 55;
pub const MAX_TOTAL_SCORE: u32 = MAX_CATEGORY_SCORE + MAX_TI_SCORE;
pub const MAX_CHECK_WEIGHT: u32 = 50;

pub use admin::{AdminApi, ApiError, ApiResponse};
pub use catalog::{AiModel, Catalog, CatalogSnapshot, Category, Check, CheckTier, Severity, TiSource};
pub use classifier::{classify, RiskLevel, RiskThresholdTable};
pub use config::{Configuration, ConfigurationDraft, ConfigurationStore, Preset, ScoringPolicy};
pub use consensus::{aggregate, ConsensusConfig, ConsensusOutcome, Strategy};
pub use error::{
    BudgetError, ConfigurationError, DegradedScanWarning, EngineError, InUseError, ValidationError,
};
pub use llm::{AiJudge, AiSettings, ChatCompletionJudge};
pub use pipeline::{
    CalibrationRequest, CheckEvaluator, IndicatorFeed, ScanEngine, ScanResult, ScanTarget,
    ScanVerdict, TargetKind, ThreatIntelProvider,
};
pub use report::{render_flow, render_report, OutputFormat};
pub use settings::EngineSettings;
