//! Transport-independent admin handlers.
//!
//! Each route of the admin contract has a method on [`AdminApi`];
//! [`AdminApi::dispatch`] maps `(method, path, body)` onto them so an HTTP
//! layer, the CLI or a test can drive the same code.
//!
//! Routes under `/v2/admin/scan-engine`:
//! - `GET  /schema`
//! - `GET|POST /config`, `GET|PUT|DELETE /config/:id`, `PATCH /config/:id/activate`
//! - `PATCH /config/:id/category-weights/:category`, `/ti-weights/:source`,
//!   `/check-weights/:check` (body `{"points": n}`)
//! - `GET /presets`, `POST /preset/:id/apply`
//! - `GET|POST /categories`, `GET|PUT|DELETE /categories/:id`
//! - `GET|POST /checks`, `GET|PUT|DELETE /checks/:id`, `POST /checks/:id/test`,
//!   `PATCH /checks/:id/toggle`
//! - `GET|POST /ai-models`, `GET|PUT|DELETE /ai-models/:id`, `POST /ai-models/:id/test`,
//!   `PATCH /ai-models/:id/toggle`
//! - `GET|POST /ti-sources`, `GET|PUT|DELETE /ti-sources/:id`, `PATCH /ti-sources/:id/toggle`
//! - `GET|POST /consensus-configs`, `GET|PUT|DELETE /consensus-configs/:id`,
//!   `PATCH /consensus-configs/:id/activate`
//! - `POST /calibrate`
//! - `GET  /stats`
//!
//! Plus `GET /v2/threat-intel/sources/:id/config`.

use std::{collections::BTreeMap, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    catalog::{AiModel, Category, Check, ConnectionTest, ProbeTarget, TiSource},
    classifier::RiskLevel,
    config::{
        validate_references, AlgorithmConfig, Configuration, ConfigurationDraft, Preset, ScoringPolicy,
    },
    consensus::{ConsensusConfig, ConsensusDraft, Strategy},
    error::{EngineError, InUseError, ValidationError},
    pipeline::{Calibration, CalibrationRequest, ScanEngine},
    stats::StatsSnapshot,
    MAX_CATEGORY_SCORE, MAX_CHECK_WEIGHT, MAX_TI_SCORE, MAX_TOTAL_SCORE,
};

pub const ADMIN_PREFIX: &str = "/v2/admin/scan-engine";
pub const THREAT_INTEL_PREFIX: &str = "/v2/threat-intel/sources";

/// Error body returned by every failing route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub status: u16,
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
}

impl ApiError {
    fn new(status: u16, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.to_string(),
            message: message.into(),
            field: None,
            current: None,
            limit: None,
            remaining: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "bad_request", message)
    }

    fn route_not_found(method: &str, path: &str) -> Self {
        Self::new(404, "route_not_found", format!("no route for {method} {path}"))
    }
}

fn validation_field(err: &ValidationError) -> Option<String> {
    match err {
        ValidationError::Budget(budget) => Some(budget.field.clone()),
        ValidationError::OutOfRange { field, .. }
        | ValidationError::UnknownReference { field, .. }
        | ValidationError::Blank { field } => Some(field.clone()),
        ValidationError::Thresholds(_) => None,
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::Budget(budget) => Self {
                field: Some(budget.field),
                current: Some(budget.current),
                limit: Some(budget.limit),
                remaining: Some(budget.remaining),
                ..Self::new(422, "budget_exceeded", message)
            },
            EngineError::InUse(_) => Self::new(409, "in_use", message),
            EngineError::Configuration(_) => Self::new(422, "invalid_risk_thresholds", message),
            EngineError::Validation(validation) => Self {
                field: validation_field(&validation),
                ..Self::new(422, "validation_failed", message)
            },
            EngineError::NotFound { .. } => Self::new(404, "not_found", message),
            EngineError::Conflict { .. } => Self::new(409, "conflict", message),
            EngineError::Cancelled { .. } => Self::new(504, "scan_cancelled", message),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        EngineError::from(err).into()
    }
}

/// Status code plus JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Budgets, levels and catalog the admin UI renders its editors from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSchema {
    pub categories: Vec<Category>,
    pub checks: Vec<Check>,
    pub ti_sources: Vec<TiSource>,
    pub ai_models: Vec<AiModel>,
    pub risk_thresholds: BTreeMap<RiskLevel, u32>,
    /// Policy a new configuration starts from: every catalog default.
    pub default_config: ScoringPolicy,
    pub max_category_score: u32,
    pub max_ti_score: u32,
    pub max_total_score: u32,
    pub max_check_weight: u32,
    pub risk_levels: Vec<RiskLevel>,
    pub strategies: Vec<Strategy>,
}

/// What the TI service needs to query one source under the active weights.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TiSourceConfig {
    pub source_id: String,
    pub name: String,
    pub enabled: bool,
    pub requires_api_key: bool,
    pub endpoint: Option<String>,
    pub priority: u32,
    pub tier1: bool,
    pub reliability: f64,
    pub weight: u32,
    /// Points a hit contributes under the active configuration.
    pub effective_points: f64,
    pub configuration_id: String,
    pub configuration_version: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WeightUpdate {
    points: u32,
}

type Routed = Result<(u16, Value), ApiError>;

fn respond<T: Serialize>(status: u16, value: T) -> Routed {
    serde_json::to_value(value)
        .map(|body| (status, body))
        .map_err(|err| ApiError::new(500, "internal", format!("failed to encode response: {err}")))
}

fn no_content() -> Routed {
    Ok((204, Value::Null))
}

fn parse_body<T: DeserializeOwned>(body: Option<&str>) -> Result<T, ApiError> {
    let raw = body
        .filter(|raw| !raw.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("request body is required"))?;
    serde_json::from_str(raw).map_err(|err| ApiError::bad_request(format!("malformed request body: {err}")))
}

/// Admin operations over one engine.
#[derive(Clone)]
pub struct AdminApi {
    engine: Arc<ScanEngine>,
}

impl AdminApi {
    pub fn new(engine: Arc<ScanEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<ScanEngine> {
        &self.engine
    }

    pub fn schema(&self) -> EngineSchema {
        let catalog = self.engine.catalog().snapshot();
        EngineSchema {
            categories: catalog.categories.values().cloned().collect(),
            checks: catalog.checks.values().cloned().collect(),
            ti_sources: catalog.ti_sources.values().cloned().collect(),
            ai_models: catalog.ai_models.values().cloned().collect(),
            risk_thresholds: AlgorithmConfig::default().risk_thresholds,
            default_config: ScoringPolicy::from_catalog(&catalog),
            max_category_score: MAX_CATEGORY_SCORE,
            max_ti_score: MAX_TI_SCORE,
            max_total_score: MAX_TOTAL_SCORE,
            max_check_weight: MAX_CHECK_WEIGHT,
            risk_levels: RiskLevel::ALL.to_vec(),
            strategies: vec![
                Strategy::Majority,
                Strategy::Weighted,
                Strategy::Unanimous,
                Strategy::RankBased,
            ],
        }
    }

    // Configurations

    pub fn list_configs(&self) -> Vec<Configuration> {
        self.engine.store().list_all()
    }

    pub fn get_config(&self, id: &str) -> Result<Configuration, EngineError> {
        self.engine.store().get(id)
    }

    pub fn create_config(&self, draft: ConfigurationDraft) -> Result<Configuration, EngineError> {
        validate_references(&draft.policy, &self.engine.catalog().snapshot())?;
        self.engine.store().create(draft)
    }

    pub fn update_config(&self, id: &str, draft: ConfigurationDraft) -> Result<Configuration, EngineError> {
        validate_references(&draft.policy, &self.engine.catalog().snapshot())?;
        self.engine.store().update(id, draft)
    }

    pub fn delete_config(&self, id: &str) -> Result<(), EngineError> {
        self.engine.store().delete(id)
    }

    pub fn activate_config(&self, id: &str) -> Result<Configuration, EngineError> {
        self.engine.store().activate(id)
    }

    fn ensure_known(&self, kind: &'static str, id: &str) -> Result<(), EngineError> {
        let catalog = self.engine.catalog().snapshot();
        let known = match kind {
            "category" => catalog.categories.contains_key(id),
            "ti source" => catalog.ti_sources.contains_key(id),
            _ => catalog.checks.contains_key(id),
        };
        if known {
            Ok(())
        } else {
            Err(EngineError::not_found(kind, id))
        }
    }

    pub fn set_category_weight(&self, id: &str, category_id: &str, points: u32) -> Result<Configuration, EngineError> {
        self.ensure_known("category", category_id)?;
        self.engine.store().set_category_weight(id, category_id, points)
    }

    pub fn set_source_weight(&self, id: &str, source_id: &str, points: u32) -> Result<Configuration, EngineError> {
        self.ensure_known("ti source", source_id)?;
        self.engine.store().set_source_weight(id, source_id, points)
    }

    pub fn set_check_weight(&self, id: &str, check_id: &str, points: u32) -> Result<Configuration, EngineError> {
        self.ensure_known("check", check_id)?;
        self.engine.store().set_check_weight(id, check_id, points)
    }

    pub fn list_presets(&self) -> Vec<Preset> {
        self.engine.store().list_presets()
    }

    pub fn apply_preset(&self, preset_id: &str) -> Result<Configuration, EngineError> {
        self.engine.store().apply_preset(preset_id)
    }

    // Catalog

    pub fn list_categories(&self) -> Vec<Category> {
        self.engine.catalog().list_categories()
    }

    pub fn create_category(&self, category: Category) -> Result<Category, EngineError> {
        self.engine.catalog().create_category(category)
    }

    pub fn get_category(&self, id: &str) -> Result<Category, EngineError> {
        self.engine.catalog().get_category(id)
    }

    pub fn update_category(&self, id: &str, category: Category) -> Result<Category, EngineError> {
        self.engine.catalog().update_category(id, category)
    }

    /// Catalog records that a live configuration or consensus config still
    /// points at cannot be deleted.
    fn ensure_unreferenced(&self, kind: &'static str, id: &str) -> Result<(), EngineError> {
        match self.engine.store().reference_to(kind, id) {
            Some(reason) => Err(InUseError::new(kind, id, reason).into()),
            None => Ok(()),
        }
    }

    pub fn delete_category(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_unreferenced("category", id)?;
        self.engine.catalog().delete_category(id)
    }

    pub fn list_checks(&self) -> Vec<Check> {
        self.engine.catalog().list_checks()
    }

    pub fn get_check(&self, id: &str) -> Result<Check, EngineError> {
        self.engine.catalog().get_check(id)
    }

    pub fn create_check(&self, check: Check) -> Result<Check, EngineError> {
        self.engine.catalog().create_check(check)
    }

    pub fn update_check(&self, id: &str, check: Check) -> Result<Check, EngineError> {
        self.engine.catalog().update_check(id, check)
    }

    pub fn delete_check(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_unreferenced("check", id)?;
        self.engine.catalog().delete_check(id)
    }

    pub fn toggle_check(&self, id: &str) -> Result<Check, EngineError> {
        self.engine.catalog().toggle_check(id)
    }

    pub async fn test_check(&self, id: &str) -> Result<ConnectionTest, EngineError> {
        self.engine.catalog().test_connection(ProbeTarget::Check, id).await
    }

    pub fn list_models(&self) -> Vec<AiModel> {
        self.engine.catalog().list_models()
    }

    pub fn get_model(&self, id: &str) -> Result<AiModel, EngineError> {
        self.engine.catalog().get_model(id)
    }

    pub fn create_model(&self, model: AiModel) -> Result<AiModel, EngineError> {
        self.engine.catalog().create_model(model)
    }

    pub fn update_model(&self, id: &str, model: AiModel) -> Result<AiModel, EngineError> {
        self.engine.catalog().update_model(id, model)
    }

    pub fn delete_model(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_unreferenced("ai model", id)?;
        self.engine.catalog().delete_model(id)
    }

    pub fn toggle_model(&self, id: &str) -> Result<AiModel, EngineError> {
        self.engine.catalog().toggle_model(id)
    }

    pub async fn test_model(&self, id: &str) -> Result<ConnectionTest, EngineError> {
        self.engine.catalog().test_connection(ProbeTarget::AiModel, id).await
    }

    pub fn list_sources(&self) -> Vec<TiSource> {
        self.engine.catalog().list_sources()
    }

    pub fn get_source(&self, id: &str) -> Result<TiSource, EngineError> {
        self.engine.catalog().get_source(id)
    }

    pub fn create_source(&self, source: TiSource) -> Result<TiSource, EngineError> {
        self.engine.catalog().create_source(source)
    }

    pub fn update_source(&self, id: &str, source: TiSource) -> Result<TiSource, EngineError> {
        self.engine.catalog().update_source(id, source)
    }

    pub fn delete_source(&self, id: &str) -> Result<(), EngineError> {
        self.ensure_unreferenced("ti source", id)?;
        self.engine.catalog().delete_source(id)
    }

    pub fn toggle_source(&self, id: &str) -> Result<TiSource, EngineError> {
        self.engine.catalog().toggle_source(id)
    }

    pub fn ti_source_config(&self, id: &str) -> Result<TiSourceConfig, EngineError> {
        let source = self.engine.catalog().get_source(id)?;
        let active = self.engine.store().get_active();
        let weight = active.policy.source_weight(id);
        let effective_points = (source.reliability.clamp(0.0, 1.0) * f64::from(weight)).min(f64::from(weight));
        Ok(TiSourceConfig {
            source_id: source.id.clone(),
            name: source.name.clone(),
            enabled: source.enabled,
            requires_api_key: source.requires_api_key,
            endpoint: source.endpoint.clone(),
            priority: source.priority,
            tier1: source.is_tier1(),
            reliability: source.reliability,
            weight,
            effective_points,
            configuration_id: active.id,
            configuration_version: active.version,
        })
    }

    // Consensus configs

    pub fn list_consensus(&self) -> Vec<ConsensusConfig> {
        self.engine.store().list_consensus()
    }

    pub fn get_consensus(&self, id: &str) -> Result<ConsensusConfig, EngineError> {
        self.engine.store().get_consensus(id)
    }

    pub fn create_consensus(&self, draft: ConsensusDraft) -> Result<ConsensusConfig, EngineError> {
        self.ensure_ranked_models_exist(&draft)?;
        self.engine.store().create_consensus(draft)
    }

    pub fn update_consensus(&self, id: &str, draft: ConsensusDraft) -> Result<ConsensusConfig, EngineError> {
        self.ensure_ranked_models_exist(&draft)?;
        self.engine.store().update_consensus(id, draft)
    }

    fn ensure_ranked_models_exist(&self, draft: &ConsensusDraft) -> Result<(), EngineError> {
        let catalog = self.engine.catalog().snapshot();
        match draft
            .model_rankings
            .iter()
            .find(|id| !catalog.ai_models.contains_key(*id))
        {
            Some(id) => Err(ValidationError::UnknownReference {
                field: "modelRankings".into(),
                kind: "ai model".into(),
                id: id.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    pub fn delete_consensus(&self, id: &str) -> Result<(), EngineError> {
        self.engine.store().delete_consensus(id)
    }

    pub fn activate_consensus(&self, id: &str) -> Result<ConsensusConfig, EngineError> {
        self.engine.store().activate_consensus(id)
    }

    // Scans

    pub async fn calibrate(&self, request: CalibrationRequest) -> Result<Calibration, EngineError> {
        self.engine.calibrate(request).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats()
    }

    /// Route one request. Unknown routes answer 404, malformed bodies 400.
    pub async fn dispatch(&self, method: &str, path: &str, body: Option<&str>) -> ApiResponse {
        let method = method.to_ascii_uppercase();
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        debug!(%method, path, "admin request");
        let (status, body) = match self.route(&method, path, body).await {
            Ok(ok) => ok,
            Err(err) => {
                if err.status >= 500 {
                    warn!(%method, path, status = err.status, error = %err.message, "admin request failed");
                }
                (err.status, serde_json::to_value(&err).unwrap_or_default())
            }
        };
        if method != "GET" && (200..300).contains(&status) {
            info!(%method, path, status, "admin mutation applied");
        }
        ApiResponse { status, body }
    }

    async fn route(&self, method: &str, path: &str, body: Option<&str>) -> Routed {
        if let Some(rest) = path.strip_prefix(THREAT_INTEL_PREFIX) {
            let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
            return match (method, segments.as_slice()) {
                ("GET", [id, "config"]) => respond(200, self.ti_source_config(id)?),
                _ => Err(ApiError::route_not_found(method, path)),
            };
        }
        let rest = path
            .strip_prefix(ADMIN_PREFIX)
            .ok_or_else(|| ApiError::route_not_found(method, path))?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        match (method, segments.as_slice()) {
            ("GET", ["schema"]) => respond(200, self.schema()),
            ("GET", ["stats"]) => respond(200, self.stats()),
            ("POST", ["calibrate"]) => respond(200, self.calibrate(parse_body(body)?).await?),

            ("GET", ["config"]) => respond(200, self.list_configs()),
            ("POST", ["config"]) => respond(201, self.create_config(parse_body(body)?)?),
            ("GET", ["config", id]) => respond(200, self.get_config(id)?),
            ("PUT", ["config", id]) => respond(200, self.update_config(id, parse_body(body)?)?),
            ("DELETE", ["config", id]) => {
                self.delete_config(id)?;
                no_content()
            }
            ("PATCH", ["config", id, "activate"]) => respond(200, self.activate_config(id)?),
            ("PATCH", ["config", id, "category-weights", key]) => {
                let update: WeightUpdate = parse_body(body)?;
                respond(200, self.set_category_weight(id, key, update.points)?)
            }
            ("PATCH", ["config", id, "ti-weights", key]) => {
                let update: WeightUpdate = parse_body(body)?;
                respond(200, self.set_source_weight(id, key, update.points)?)
            }
            ("PATCH", ["config", id, "check-weights", key]) => {
                let update: WeightUpdate = parse_body(body)?;
                respond(200, self.set_check_weight(id, key, update.points)?)
            }

            ("GET", ["presets"]) => respond(200, self.list_presets()),
            ("POST", ["preset", id, "apply"]) => respond(201, self.apply_preset(id)?),

            ("GET", ["categories"]) => respond(200, self.list_categories()),
            ("POST", ["categories"]) => respond(201, self.create_category(parse_body(body)?)?),
            ("GET", ["categories", id]) => respond(200, self.get_category(id)?),
            ("PUT", ["categories", id]) => respond(200, self.update_category(id, parse_body(body)?)?),
            ("DELETE", ["categories", id]) => {
                self.delete_category(id)?;
                no_content()
            }

            ("GET", ["checks"]) => respond(200, self.list_checks()),
            ("POST", ["checks"]) => respond(201, self.create_check(parse_body(body)?)?),
            ("GET", ["checks", id]) => respond(200, self.get_check(id)?),
            ("PUT", ["checks", id]) => respond(200, self.update_check(id, parse_body(body)?)?),
            ("DELETE", ["checks", id]) => {
                self.delete_check(id)?;
                no_content()
            }
            ("POST", ["checks", id, "test"]) => respond(200, self.test_check(id).await?),
            ("PATCH", ["checks", id, "toggle"]) => respond(200, self.toggle_check(id)?),

            ("GET", ["ai-models"]) => respond(200, self.list_models()),
            ("POST", ["ai-models"]) => respond(201, self.create_model(parse_body(body)?)?),
            ("GET", ["ai-models", id]) => respond(200, self.get_model(id)?),
            ("PUT", ["ai-models", id]) => respond(200, self.update_model(id, parse_body(body)?)?),
            ("DELETE", ["ai-models", id]) => {
                self.delete_model(id)?;
                no_content()
            }
            ("POST", ["ai-models", id, "test"]) => respond(200, self.test_model(id).await?),
            ("PATCH", ["ai-models", id, "toggle"]) => respond(200, self.toggle_model(id)?),

            ("GET", ["ti-sources"]) => respond(200, self.list_sources()),
            ("POST", ["ti-sources"]) => respond(201, self.create_source(parse_body(body)?)?),
            ("GET", ["ti-sources", id]) => respond(200, self.get_source(id)?),
            ("PUT", ["ti-sources", id]) => respond(200, self.update_source(id, parse_body(body)?)?),
            ("DELETE", ["ti-sources", id]) => {
                self.delete_source(id)?;
                no_content()
            }
            ("PATCH", ["ti-sources", id, "toggle"]) => respond(200, self.toggle_source(id)?),

            ("GET", ["consensus-configs"]) => respond(200, self.list_consensus()),
            ("POST", ["consensus-configs"]) => respond(201, self.create_consensus(parse_body(body)?)?),
            ("GET", ["consensus-configs", id]) => respond(200, self.get_consensus(id)?),
            ("PUT", ["consensus-configs", id]) => {
                respond(200, self.update_consensus(id, parse_body(body)?)?)
            }
            ("DELETE", ["consensus-configs", id]) => {
                self.delete_consensus(id)?;
                no_content()
            }
            ("PATCH", ["consensus-configs", id, "activate"]) => {
                respond(200, self.activate_consensus(id)?)
            }

            _ => Err(ApiError::route_not_found(method, path)),
        }
    }
}
