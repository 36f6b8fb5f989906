use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    classifier::RiskLevel,
    config::Configuration,
    pipeline::{OverrideReason, ScanResult, ScanVerdict},
};

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    by_level: BTreeMap<RiskLevel, u64>,
    by_verdict: BTreeMap<ScanVerdict, u64>,
    score_sum: u64,
    degraded: u64,
    ai_unavailable: u64,
    overrides: BTreeMap<OverrideReason, u64>,
    cancelled: u64,
}

/// Running totals over completed scans. Calibration runs in test mode are
/// not recorded.
#[derive(Debug, Default)]
pub struct ScanStats {
    counters: Mutex<Counters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_scans: u64,
    pub scans_by_level: BTreeMap<RiskLevel, u64>,
    pub scans_by_verdict: BTreeMap<ScanVerdict, u64>,
    pub average_final_score: f64,
    pub degraded_scans: u64,
    pub ai_unavailable_scans: u64,
    pub policy_overrides: BTreeMap<OverrideReason, u64>,
    pub cancelled_scans: u64,
    /// Scans that took a snapshot of each configuration, keyed by id.
    pub configuration_usage: BTreeMap<String, u64>,
}

impl ScanStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &ScanResult) {
        let mut counters = self.counters.lock();
        counters.total += 1;
        *counters.by_level.entry(result.risk_level).or_default() += 1;
        *counters.by_verdict.entry(result.verdict).or_default() += 1;
        counters.score_sum += u64::from(result.final_score);
        if result.degraded {
            counters.degraded += 1;
        }
        if result.ai_unavailable {
            counters.ai_unavailable += 1;
        }
        if let Some(policy_override) = &result.policy_override {
            *counters.overrides.entry(policy_override.reason).or_default() += 1;
        }
    }

    pub fn record_cancelled(&self) {
        self.counters.lock().cancelled += 1;
    }

    pub fn snapshot(&self, configurations: &[Configuration]) -> StatsSnapshot {
        let counters = self.counters.lock();
        let average_final_score = if counters.total == 0 {
            0.0
        } else {
            counters.score_sum as f64 / counters.total as f64
        };
        let mut scans_by_level: BTreeMap<RiskLevel, u64> =
            RiskLevel::ALL.iter().map(|level| (*level, 0)).collect();
        scans_by_level.extend(counters.by_level.iter().map(|(k, v)| (*k, *v)));
        StatsSnapshot {
            total_scans: counters.total,
            scans_by_level,
            scans_by_verdict: counters.by_verdict.clone(),
            average_final_score,
            degraded_scans: counters.degraded,
            ai_unavailable_scans: counters.ai_unavailable,
            policy_overrides: counters.overrides.clone(),
            cancelled_scans: counters.cancelled,
            configuration_usage: configurations
                .iter()
                .map(|config| (config.id.clone(), config.usage_count))
                .collect(),
        }
    }
}
