use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{catalog::CatalogSnapshot, classifier::RiskLevel};

use super::{PolicyRules, ScoringPolicy};

/// Named configuration template. Applying a preset never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Immutable presets pin the configuration named in `base_configuration`.
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub base_configuration: Option<String>,
    pub template: ScoringPolicy,
}

impl Preset {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// True when this preset blocks deletion of the configuration named `name`.
    pub fn pins(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.immutable && !self.is_expired(now) && self.base_configuration.as_deref() == Some(name)
    }
}

fn thresholds(bounds: [u32; 5]) -> std::collections::BTreeMap<RiskLevel, u32> {
    RiskLevel::ALL.iter().copied().zip(bounds).collect()
}

/// Presets shipped with the engine: balanced (catalog defaults), strict and
/// permissive.
pub fn builtin_presets(catalog: &CatalogSnapshot, default_name: &str) -> Vec<Preset> {
    let balanced = ScoringPolicy::from_catalog(catalog);

    let mut strict = balanced.clone();
    strict.algorithm_config.risk_thresholds = thresholds([0, 15, 30, 45, 60]);
    strict.stage1_threshold = 60.0;
    strict.stage2_threshold = 75.0;

    let mut permissive = balanced.clone();
    permissive.algorithm_config.risk_thresholds = thresholds([0, 30, 60, 90, 120]);
    permissive.stage1_threshold = 80.0;
    permissive.stage2_threshold = 95.0;
    permissive.rules = PolicyRules {
        enable_dual_tier1_block: false,
        enable_sinkhole_block: true,
        enable_brand_infra_check: true,
        enable_form_origin_check: false,
        enable_homoglyph_detection: false,
    };

    vec![
        Preset {
            id: "balanced".into(),
            name: "Balanced".into(),
            description: "Catalog defaults; the baseline the default configuration is built from".into(),
            immutable: true,
            expires_at: None,
            base_configuration: Some(default_name.to_string()),
            template: balanced,
        },
        Preset {
            id: "strict".into(),
            name: "Strict".into(),
            description: "Lower risk boundaries and earlier Stage-1 exit for high-exposure tenants".into(),
            immutable: false,
            expires_at: None,
            base_configuration: None,
            template: strict,
        },
        Preset {
            id: "permissive".into(),
            name: "Permissive".into(),
            description: "Higher risk boundaries with only the sinkhole override".into(),
            immutable: false,
            expires_at: None,
            base_configuration: None,
            template: permissive,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::defaults::default_catalog, config::budget};
    use chrono::Duration;

    #[test]
    fn builtin_presets_pass_validation() {
        for preset in builtin_presets(&default_catalog(), "Default") {
            budget::validate(&preset.template)
                .unwrap_or_else(|err| panic!("preset {} invalid: {err}", preset.id));
        }
    }

    #[test]
    fn only_unexpired_immutable_presets_pin() {
        let now = Utc::now();
        let mut preset = builtin_presets(&default_catalog(), "Default").remove(0);
        assert!(preset.pins("Default", now));
        assert!(!preset.pins("Other", now));
        preset.expires_at = Some(now - Duration::hours(1));
        assert!(!preset.pins("Default", now));
        preset.expires_at = None;
        preset.immutable = false;
        assert!(!preset.pins("Default", now));
    }
}
