//! Reference metadata for scoring: categories, checks, TI sources and AI models.
//!
//! Scans read an immutable [`CatalogSnapshot`]; every administrative mutation
//! builds a fresh snapshot and swaps it in, so a running scan never observes a
//! half-applied edit.

pub mod defaults;
pub mod probe;

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, InUseError, ValidationError};

pub use probe::{ConnectionProbe, ConnectionTest, HttpProbe};

/// Severity of the evidence produced by a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Which pass of the pipeline runs a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckTier {
    #[default]
    Stage1,
    Stage2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub default_weight: u32,
}

/// Smallest unit of rule-based evidence; belongs to exactly one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub id: String,
    pub category_id: String,
    pub name: String,
    pub severity: Severity,
    pub default_points: u32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub api_integration: Option<String>,
    #[serde(default)]
    pub automation_capable: bool,
    #[serde(default)]
    pub requires_manual_review: bool,
    #[serde(default)]
    pub tier: CheckTier,
}

/// External threat-intelligence feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiSource {
    pub id: String,
    pub name: String,
    pub default_points: u32,
    #[serde(default, rename = "requiresAPIKey")]
    pub requires_api_key: bool,
    pub priority: u32,
    pub reliability: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl TiSource {
    /// Tier-1 sources are the ones trusted enough for the dual-match block rule.
    pub fn is_tier1(&self) -> bool {
        self.priority == 1
    }
}

/// One model endpoint usable in consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiModel {
    pub id: String,
    pub model_id: String,
    pub name: String,
    pub provider: String,
    /// Tie-break priority, lower wins.
    pub rank: u32,
    /// Influence under the weighted strategy.
    pub weight: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub credential_present: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Category {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("id", &self.id)?;
        require_non_blank("name", &self.name)
    }
}

impl Check {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("id", &self.id)?;
        require_non_blank("categoryId", &self.category_id)?;
        require_non_blank("name", &self.name)?;
        if self.default_points > crate::MAX_CHECK_WEIGHT {
            return Err(ValidationError::OutOfRange {
                field: format!("checks.{}.defaultPoints", self.id),
                value: f64::from(self.default_points),
                min: 0.0,
                max: f64::from(crate::MAX_CHECK_WEIGHT),
            });
        }
        Ok(())
    }
}

impl TiSource {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("id", &self.id)?;
        require_non_blank("name", &self.name)?;
        if !(0.0..=1.0).contains(&self.reliability) {
            return Err(ValidationError::OutOfRange {
                field: format!("tiSources.{}.reliability", self.id),
                value: self.reliability,
                min: 0.0,
                max: 1.0,
            });
        }
        if self.default_points > crate::MAX_TI_SCORE {
            return Err(ValidationError::OutOfRange {
                field: format!("tiSources.{}.defaultPoints", self.id),
                value: f64::from(self.default_points),
                min: 0.0,
                max: f64::from(crate::MAX_TI_SCORE),
            });
        }
        Ok(())
    }
}

impl AiModel {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_blank("id", &self.id)?;
        require_non_blank("modelId", &self.model_id)?;
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: format!("aiModels.{}.weight", self.id),
                value: self.weight,
                min: 0.0,
                max: f64::MAX,
            });
        }
        Ok(())
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Immutable view of the catalog handed to a scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub categories: BTreeMap<String, Category>,
    pub checks: BTreeMap<String, Check>,
    pub ti_sources: BTreeMap<String, TiSource>,
    pub ai_models: BTreeMap<String, AiModel>,
}

impl CatalogSnapshot {
    pub fn enabled_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.values().filter(|check| check.enabled)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &TiSource> {
        self.ti_sources.values().filter(|source| source.enabled)
    }

    pub fn enabled_models(&self) -> impl Iterator<Item = &AiModel> {
        self.ai_models.values().filter(|model| model.enabled)
    }
}

/// Kinds of catalog record that can be probed with [`Catalog::test_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTarget {
    Check,
    TiSource,
    AiModel,
}

/// Administrative CRUD over reference data.
pub struct Catalog {
    // Serialises writers; readers go through `current`.
    write_lock: Mutex<()>,
    current: RwLock<Arc<CatalogSnapshot>>,
    probe: Arc<dyn ConnectionProbe>,
}

impl Catalog {
    pub fn new(snapshot: CatalogSnapshot, probe: Arc<dyn ConnectionProbe>) -> Self {
        Self {
            write_lock: Mutex::new(()),
            current: RwLock::new(Arc::new(snapshot)),
            probe,
        }
    }

    /// Catalog seeded with the built-in defaults.
    pub fn with_defaults(probe: Arc<dyn ConnectionProbe>) -> Self {
        Self::new(defaults::default_catalog(), probe)
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut CatalogSnapshot) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let _guard = self.write_lock.lock();
        let mut next = CatalogSnapshot::clone(&self.current.read());
        let out = apply(&mut next)?;
        *self.current.write() = Arc::new(next);
        Ok(out)
    }

    pub fn list_categories(&self) -> Vec<Category> {
        self.snapshot().categories.values().cloned().collect()
    }

    pub fn create_category(&self, category: Category) -> Result<Category, EngineError> {
        category.validate()?;
        self.mutate(|snap| {
            if snap.categories.contains_key(&category.id) {
                return Err(EngineError::Conflict {
                    kind: "category",
                    id: category.id.clone(),
                });
            }
            snap.categories
                .insert(category.id.clone(), category.clone());
            info!(category_id = %category.id, "category created");
            Ok(category)
        })
    }

    pub fn get_category(&self, id: &str) -> Result<Category, EngineError> {
        self.snapshot()
            .categories
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("category", id))
    }

    pub fn update_category(&self, id: &str, mut category: Category) -> Result<Category, EngineError> {
        category.id = id.to_string();
        category.validate()?;
        self.mutate(|snap| {
            if !snap.categories.contains_key(id) {
                return Err(EngineError::not_found("category", id));
            }
            snap.categories.insert(id.to_string(), category.clone());
            info!(category_id = %id, "category updated");
            Ok(category)
        })
    }

    pub fn delete_category(&self, id: &str) -> Result<(), EngineError> {
        self.mutate(|snap| {
            if !snap.categories.contains_key(id) {
                return Err(EngineError::not_found("category", id));
            }
            let owned = snap
                .checks
                .values()
                .filter(|check| check.category_id == id)
                .count();
            if owned > 0 {
                return Err(InUseError::new(
                    "category",
                    id,
                    format!("{owned} check(s) still belong to it"),
                )
                .into());
            }
            snap.categories.remove(id);
            Ok(())
        })
    }

    pub fn list_checks(&self) -> Vec<Check> {
        self.snapshot().checks.values().cloned().collect()
    }

    pub fn get_check(&self, id: &str) -> Result<Check, EngineError> {
        self.snapshot()
            .checks
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("check", id))
    }

    pub fn create_check(&self, check: Check) -> Result<Check, EngineError> {
        check.validate()?;
        self.mutate(|snap| {
            if snap.checks.contains_key(&check.id) {
                return Err(EngineError::Conflict {
                    kind: "check",
                    id: check.id.clone(),
                });
            }
            ensure_category(snap, &check)?;
            snap.checks.insert(check.id.clone(), check.clone());
            info!(check_id = %check.id, "check created");
            Ok(check)
        })
    }

    pub fn update_check(&self, id: &str, mut check: Check) -> Result<Check, EngineError> {
        check.id = id.to_string();
        check.validate()?;
        self.mutate(|snap| {
            if !snap.checks.contains_key(id) {
                return Err(EngineError::not_found("check", id));
            }
            ensure_category(snap, &check)?;
            snap.checks.insert(id.to_string(), check.clone());
            Ok(check)
        })
    }

    pub fn delete_check(&self, id: &str) -> Result<(), EngineError> {
        self.mutate(|snap| {
            snap.checks
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| EngineError::not_found("check", id))
        })
    }

    /// Flip a check's `enabled` flag; returns the new state.
    pub fn toggle_check(&self, id: &str) -> Result<Check, EngineError> {
        self.mutate(|snap| {
            let check = snap
                .checks
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found("check", id))?;
            check.enabled = !check.enabled;
            info!(check_id = %id, enabled = check.enabled, "check toggled");
            Ok(check.clone())
        })
    }

    pub fn list_sources(&self) -> Vec<TiSource> {
        self.snapshot().ti_sources.values().cloned().collect()
    }

    pub fn get_source(&self, id: &str) -> Result<TiSource, EngineError> {
        self.snapshot()
            .ti_sources
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("ti source", id))
    }

    pub fn create_source(&self, source: TiSource) -> Result<TiSource, EngineError> {
        source.validate()?;
        self.mutate(|snap| {
            if snap.ti_sources.contains_key(&source.id) {
                return Err(EngineError::Conflict {
                    kind: "ti source",
                    id: source.id.clone(),
                });
            }
            snap.ti_sources.insert(source.id.clone(), source.clone());
            info!(source_id = %source.id, "ti source created");
            Ok(source)
        })
    }

    pub fn update_source(&self, id: &str, mut source: TiSource) -> Result<TiSource, EngineError> {
        source.id = id.to_string();
        source.validate()?;
        self.mutate(|snap| {
            if !snap.ti_sources.contains_key(id) {
                return Err(EngineError::not_found("ti source", id));
            }
            snap.ti_sources.insert(id.to_string(), source.clone());
            Ok(source)
        })
    }

    pub fn delete_source(&self, id: &str) -> Result<(), EngineError> {
        self.mutate(|snap| {
            snap.ti_sources
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| EngineError::not_found("ti source", id))
        })
    }

    pub fn toggle_source(&self, id: &str) -> Result<TiSource, EngineError> {
        self.mutate(|snap| {
            let source = snap
                .ti_sources
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found("ti source", id))?;
            source.enabled = !source.enabled;
            info!(source_id = %id, enabled = source.enabled, "ti source toggled");
            Ok(source.clone())
        })
    }

    pub fn list_models(&self) -> Vec<AiModel> {
        self.snapshot().ai_models.values().cloned().collect()
    }

    pub fn get_model(&self, id: &str) -> Result<AiModel, EngineError> {
        self.snapshot()
            .ai_models
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("ai model", id))
    }

    pub fn create_model(&self, model: AiModel) -> Result<AiModel, EngineError> {
        model.validate()?;
        self.mutate(|snap| {
            if snap.ai_models.contains_key(&model.id) {
                return Err(EngineError::Conflict {
                    kind: "ai model",
                    id: model.id.clone(),
                });
            }
            snap.ai_models.insert(model.id.clone(), model.clone());
            info!(model_id = %model.id, "ai model created");
            Ok(model)
        })
    }

    pub fn update_model(&self, id: &str, mut model: AiModel) -> Result<AiModel, EngineError> {
        model.id = id.to_string();
        model.validate()?;
        self.mutate(|snap| {
            if !snap.ai_models.contains_key(id) {
                return Err(EngineError::not_found("ai model", id));
            }
            snap.ai_models.insert(id.to_string(), model.clone());
            Ok(model)
        })
    }

    pub fn delete_model(&self, id: &str) -> Result<(), EngineError> {
        self.mutate(|snap| {
            snap.ai_models
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| EngineError::not_found("ai model", id))
        })
    }

    pub fn toggle_model(&self, id: &str) -> Result<AiModel, EngineError> {
        self.mutate(|snap| {
            let model = snap
                .ai_models
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found("ai model", id))?;
            model.enabled = !model.enabled;
            Ok(model.clone())
        })
    }

    /// Liveness probe against the record's integration endpoint. Never mutates
    /// scoring state.
    pub async fn test_connection(
        &self,
        target: ProbeTarget,
        id: &str,
    ) -> Result<ConnectionTest, EngineError> {
        let snap = self.snapshot();
        let endpoint = match target {
            ProbeTarget::Check => snap
                .checks
                .get(id)
                .ok_or_else(|| EngineError::not_found("check", id))?
                .api_integration
                .clone(),
            ProbeTarget::TiSource => snap
                .ti_sources
                .get(id)
                .ok_or_else(|| EngineError::not_found("ti source", id))?
                .endpoint
                .clone(),
            ProbeTarget::AiModel => snap
                .ai_models
                .get(id)
                .ok_or_else(|| EngineError::not_found("ai model", id))?
                .endpoint
                .clone(),
        };
        let Some(endpoint) = endpoint else {
            return Ok(ConnectionTest::failed(0, "no integration endpoint configured"));
        };
        Ok(self.probe.probe(&endpoint).await)
    }
}

fn ensure_category(snap: &CatalogSnapshot, check: &Check) -> Result<(), EngineError> {
    if snap.categories.contains_key(&check.category_id) {
        return Ok(());
    }
    Err(ValidationError::UnknownReference {
        field: format!("checks.{}.categoryId", check.id),
        kind: "category".into(),
        id: check.category_id.clone(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedProbe;

    #[async_trait]
    impl ConnectionProbe for FixedProbe {
        async fn probe(&self, endpoint: &str) -> ConnectionTest {
            ConnectionTest {
                success: endpoint.starts_with("https://"),
                latency_ms: 7,
                error: None,
            }
        }
    }

    fn catalog() -> Catalog {
        Catalog::with_defaults(Arc::new(FixedProbe))
    }

    #[test]
    fn toggling_a_check_leaves_held_snapshots_untouched() {
        let catalog = catalog();
        let before = catalog.snapshot();
        let toggled = catalog.toggle_check("ip_address_host").unwrap();
        assert!(!toggled.enabled);
        assert!(before.checks["ip_address_host"].enabled);
        assert!(!catalog.snapshot().checks["ip_address_host"].enabled);
    }

    #[test]
    fn deleting_category_with_checks_is_in_use() {
        let catalog = catalog();
        let err = catalog.delete_category("url_structure").unwrap_err();
        assert!(matches!(err, EngineError::InUse(_)));
    }

    #[test]
    fn category_update_keeps_path_id_and_rejects_unknown() {
        let catalog = catalog();
        let mut category = catalog.get_category("url_structure").unwrap();
        category.id = "renamed".into();
        category.name = "URL shape".into();
        let updated = catalog.update_category("url_structure", category.clone()).unwrap();
        assert_eq!(updated.id, "url_structure");
        assert_eq!(catalog.get_category("url_structure").unwrap().name, "URL shape");
        assert!(catalog.get_category("renamed").is_err());

        let err = catalog.update_category("missing", category).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn check_must_reference_known_category() {
        let catalog = catalog();
        let check = Check {
            id: "orphan".into(),
            category_id: "nope".into(),
            name: "Orphan".into(),
            severity: Severity::Low,
            default_points: 5,
            enabled: true,
            api_integration: None,
            automation_capable: false,
            requires_manual_review: false,
            tier: CheckTier::Stage1,
        };
        let err = catalog.create_check(check).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::UnknownReference { .. })
        ));
    }

    #[test]
    fn check_default_points_are_capped() {
        let mut check = catalog().get_check("ip_address_host").unwrap();
        check.default_points = 51;
        assert!(matches!(
            check.validate(),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn duplicate_source_is_a_conflict() {
        let catalog = catalog();
        let source = catalog.get_source("phishtank").unwrap();
        let err = catalog.create_source(source).unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_connection_without_endpoint_reports_failure() {
        let catalog = catalog();
        let result = catalog
            .test_connection(ProbeTarget::Check, "long_url")
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no integration endpoint"));
    }

    #[tokio::test]
    async fn test_connection_uses_probe_for_configured_endpoint() {
        let catalog = catalog();
        let result = catalog
            .test_connection(ProbeTarget::TiSource, "phishtank")
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.latency_ms, 7);
    }

    #[tokio::test]
    async fn test_connection_unknown_id_is_not_found() {
        let err = catalog()
            .test_connection(ProbeTarget::AiModel, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
