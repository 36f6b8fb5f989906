mod openai;
mod settings;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    catalog::AiModel,
    consensus::Verdict,
    pipeline::{Finding, ScanTarget},
};

pub use openai::ChatCompletionJudge;
pub use settings::AiSettings;

/// Everything a model is shown about the target.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub model: &'a AiModel,
    pub target: &'a ScanTarget,
    pub base_score: u32,
    pub findings: &'a [Finding],
}

/// One model's opinion. `confidence` is in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub verdict: Verdict,
    pub confidence: f64,
}

/// Client abstraction for asking a model whether a target is malicious.
#[async_trait]
pub trait AiJudge: Send + Sync {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Judgment>;
}

/// Judge used when no AI credentials are configured; every call fails, so
/// models surface as non-responsive and consensus stays neutral.
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredJudge;

#[async_trait]
impl AiJudge for UnconfiguredJudge {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Judgment> {
        bail!(
            "no AI judge configured for model {}; set {}",
            request.model.id,
            AiSettings::API_KEY_ENV
        )
    }
}
