use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{CheckTier, Severity},
    classifier::RiskLevel,
    consensus::ConsensusOutcome,
    error::DegradedScanWarning,
};

use super::target::ScanTarget;

/// A check that fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub check_id: String,
    pub category_id: String,
    pub name: String,
    pub severity: Severity,
    pub stage: CheckTier,
    /// Configured weight of the check.
    pub points: u32,
    /// Points actually counted after the category ceiling.
    pub awarded: u32,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiHit {
    pub source_id: String,
    pub indicator: String,
    pub weight: u32,
    pub reliability: f64,
    pub points: f64,
    pub tier1: bool,
    pub sinkhole: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideReason {
    DualTier1,
    Sinkhole,
}

impl OverrideReason {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideReason::DualTier1 => "dual_tier1",
            OverrideReason::Sinkhole => "sinkhole",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOverride {
    pub reason: OverrideReason,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanVerdict {
    Allow,
    Warn,
    Block,
}

impl ScanVerdict {
    pub fn for_level(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Safe | RiskLevel::Low => ScanVerdict::Allow,
            RiskLevel::Medium | RiskLevel::High => ScanVerdict::Warn,
            RiskLevel::Critical => ScanVerdict::Block,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanVerdict::Allow => "allow",
            ScanVerdict::Warn => "warn",
            ScanVerdict::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Stage1,
    Stage2,
    TiLookup,
    AiConsensus,
    PolicyOverride,
    Classify,
}

impl StageName {
    pub fn label(self) -> &'static str {
        match self {
            StageName::Stage1 => "Stage 1 checks",
            StageName::Stage2 => "Stage 2 deep checks",
            StageName::TiLookup => "Threat intelligence",
            StageName::AiConsensus => "AI consensus",
            StageName::PolicyOverride => "Policy override",
            StageName::Classify => "Classification",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Stage 1 was confident enough to skip Stage 2.
    EarlyExit,
    /// Stage 2 reached its confidence threshold before running every check.
    StoppedEarly,
    Skipped,
    TimedOut,
    Triggered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub stage: StageName,
    pub status: StageStatus,
    /// Points (or, for AI consensus, the multiplier) this stage produced.
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub duration_ms: u64,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub id: String,
    pub target: ScanTarget,
    pub configuration_id: String,
    pub configuration_version: u32,
    pub consensus_config_id: String,
    pub base_score: u32,
    pub ti_score: f64,
    pub ai_multiplier: f64,
    pub final_score: u32,
    pub risk_level: RiskLevel,
    pub verdict: ScanVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_override: Option<PolicyOverride>,
    pub stages: Vec<StageRecord>,
    pub findings: Vec<Finding>,
    pub ti_hits: Vec<TiHit>,
    pub consensus: ConsensusOutcome,
    pub degraded: bool,
    pub ai_unavailable: bool,
    pub warnings: Vec<DegradedScanWarning>,
    pub performance: Performance,
    pub scanned_at: DateTime<Utc>,
}

impl ScanResult {
    pub fn stage(&self, name: StageName) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.stage == name)
    }
}

/// One step of the calibration trace shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStep {
    pub step: usize,
    pub stage: StageName,
    pub label: String,
    pub status: StageStatus,
    pub detail: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calibration {
    pub result: ScanResult,
    pub visual_flow: Vec<FlowStep>,
}

impl Calibration {
    pub fn from_result(result: ScanResult) -> Self {
        let visual_flow = result
            .stages
            .iter()
            .enumerate()
            .map(|(idx, record)| FlowStep {
                step: idx + 1,
                stage: record.stage,
                label: record.stage.label().to_string(),
                status: record.status,
                detail: record.detail.clone(),
                duration_ms: record.duration_ms,
            })
            .collect();
        Self {
            result,
            visual_flow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_follows_level() {
        assert_eq!(ScanVerdict::for_level(RiskLevel::Safe), ScanVerdict::Allow);
        assert_eq!(ScanVerdict::for_level(RiskLevel::Low), ScanVerdict::Allow);
        assert_eq!(ScanVerdict::for_level(RiskLevel::Medium), ScanVerdict::Warn);
        assert_eq!(ScanVerdict::for_level(RiskLevel::High), ScanVerdict::Warn);
        assert_eq!(ScanVerdict::for_level(RiskLevel::Critical), ScanVerdict::Block);
    }

    #[test]
    fn override_reasons_use_wire_names() {
        let value = serde_json::to_value(PolicyOverride {
            reason: OverrideReason::DualTier1,
            detail: "x".into(),
        })
        .unwrap();
        assert_eq!(value["reason"], "dual_tier1");
        assert_eq!(OverrideReason::Sinkhole.as_str(), "sinkhole");
    }
}
