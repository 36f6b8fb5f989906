//! Scoring policy records, their budget validation, and the versioned store.

pub mod budget;
pub mod preset;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{CatalogSnapshot, Check},
    classifier::{RiskLevel, RiskThresholdTable},
    error::ConfigurationError,
};

pub use budget::{
    validate, validate_category_update, validate_check_update, validate_references,
    validate_ti_update,
};
pub use preset::Preset;
pub use store::{ConfigurationStore, ScoringSnapshot};

pub const DEFAULT_STAGE1_THRESHOLD: f64 = 70.0;
pub const DEFAULT_STAGE2_THRESHOLD: f64 = 85.0;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiConfig {
    #[serde(default)]
    pub source_weights: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmConfig {
    /// Lower boundary of each risk level.
    pub risk_thresholds: BTreeMap<RiskLevel, u32>,
    /// Denominator for Stage-1 confidence; defaults to the category budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_budget: Option<u32>,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        let risk_thresholds = RiskThresholdTable::default()
            .entries()
            .iter()
            .map(|entry| (entry.level, entry.min))
            .collect();
        Self {
            risk_thresholds,
            confidence_budget: None,
        }
    }
}

/// Hard-override and Stage-2 toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRules {
    #[serde(default)]
    pub enable_dual_tier1_block: bool,
    #[serde(default)]
    pub enable_sinkhole_block: bool,
    #[serde(default)]
    pub enable_brand_infra_check: bool,
    #[serde(default)]
    pub enable_form_origin_check: bool,
    #[serde(default)]
    pub enable_homoglyph_detection: bool,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            enable_dual_tier1_block: true,
            enable_sinkhole_block: true,
            enable_brand_infra_check: true,
            enable_form_origin_check: true,
            enable_homoglyph_detection: true,
        }
    }
}

impl PolicyRules {
    /// Whether the Stage-2 check with this id is switched on.
    pub fn allows_stage2(&self, check_id: &str) -> bool {
        match check_id {
            "brand_infrastructure" => self.enable_brand_infra_check,
            "form_origin" => self.enable_form_origin_check,
            "homoglyph_domain" => self.enable_homoglyph_detection,
            _ => true,
        }
    }
}

/// The tunable part of a configuration; shared by configurations, drafts and
/// preset templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringPolicy {
    #[serde(default)]
    pub category_weights: BTreeMap<String, u32>,
    #[serde(default)]
    pub check_weights: BTreeMap<String, u32>,
    #[serde(default)]
    pub ti_config: TiConfig,
    #[serde(default)]
    pub algorithm_config: AlgorithmConfig,
    #[serde(default)]
    pub rules: PolicyRules,
    #[serde(default = "default_stage1")]
    pub stage1_threshold: f64,
    #[serde(default = "default_stage2")]
    pub stage2_threshold: f64,
}

fn default_stage1() -> f64 {
    DEFAULT_STAGE1_THRESHOLD
}

fn default_stage2() -> f64 {
    DEFAULT_STAGE2_THRESHOLD
}

impl ScoringPolicy {
    /// Policy that uses every catalog default.
    pub fn from_catalog(catalog: &CatalogSnapshot) -> Self {
        Self {
            category_weights: catalog
                .categories
                .values()
                .map(|c| (c.id.clone(), c.default_weight))
                .collect(),
            check_weights: catalog
                .checks
                .values()
                .map(|c| (c.id.clone(), c.default_points))
                .collect(),
            ti_config: TiConfig {
                source_weights: catalog
                    .ti_sources
                    .values()
                    .map(|s| (s.id.clone(), s.default_points))
                    .collect(),
            },
            algorithm_config: AlgorithmConfig::default(),
            rules: PolicyRules::default(),
            stage1_threshold: DEFAULT_STAGE1_THRESHOLD,
            stage2_threshold: DEFAULT_STAGE2_THRESHOLD,
        }
    }

    pub fn category_total(&self) -> u64 {
        self.category_weights.values().map(|w| u64::from(*w)).sum()
    }

    pub fn ti_total(&self) -> u64 {
        self.ti_config
            .source_weights
            .values()
            .map(|w| u64::from(*w))
            .sum()
    }

    pub fn category_weight(&self, category_id: &str) -> u32 {
        self.category_weights.get(category_id).copied().unwrap_or(0)
    }

    /// Configured points for a check, falling back to its catalog default.
    pub fn check_weight(&self, check: &Check) -> u32 {
        self.check_weights
            .get(&check.id)
            .copied()
            .unwrap_or(check.default_points)
    }

    pub fn source_weight(&self, source_id: &str) -> u32 {
        self.ti_config
            .source_weights
            .get(source_id)
            .copied()
            .unwrap_or(0)
    }

    /// Denominator used to turn Stage-1 points into a 0-100 confidence.
    pub fn confidence_budget(&self) -> u64 {
        self.algorithm_config
            .confidence_budget
            .map(u64::from)
            .unwrap_or_else(|| self.category_total())
    }

    pub fn threshold_table(&self) -> Result<RiskThresholdTable, ConfigurationError> {
        RiskThresholdTable::from_boundaries(&self.algorithm_config.risk_thresholds)
    }
}

/// Input for creating or updating a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationDraft {
    pub name: String,
    #[serde(flatten)]
    pub policy: ScoringPolicy,
}

/// A versioned unit of scoring policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub is_active: bool,
    pub is_default: bool,
    #[serde(flatten)]
    pub policy: ScoringPolicy,
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Configuration {
    pub fn draft(&self) -> ConfigurationDraft {
        ConfigurationDraft {
            name: self.name.clone(),
            policy: self.policy.clone(),
        }
    }
}
