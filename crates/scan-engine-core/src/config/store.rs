use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    catalog::CatalogSnapshot,
    consensus::{ConsensusConfig, ConsensusDraft, Strategy},
    error::{EngineError, InUseError},
};

use super::{
    budget, preset::builtin_presets, Configuration, ConfigurationDraft, Preset, ScoringPolicy,
};

pub const DEFAULT_CONFIGURATION_ID: &str = "default";
pub const DEFAULT_CONFIGURATION_NAME: &str = "Default";
pub const DEFAULT_CONSENSUS_ID: &str = "default-weighted";

/// Immutable inputs a scan holds for its whole run.
#[derive(Debug, Clone)]
pub struct ScoringSnapshot {
    pub configuration: Arc<Configuration>,
    pub consensus: Arc<ConsensusConfig>,
}

struct ConfigRecord {
    // Every version ever saved; the last one is current.
    versions: Vec<Arc<Configuration>>,
    usage: Arc<AtomicU64>,
    // Tombstoned: hidden from lookups, but its versions stay resolvable.
    deleted: bool,
}

impl ConfigRecord {
    fn latest(&self) -> &Arc<Configuration> {
        self.versions
            .last()
            .unwrap_or_else(|| unreachable!("config records are created with one version"))
    }
}

impl StoreState {
    fn live(&self, id: &str) -> Result<&ConfigRecord, EngineError> {
        self.configs
            .get(id)
            .filter(|record| !record.deleted)
            .ok_or_else(|| EngineError::not_found("configuration", id))
    }

    fn live_mut(&mut self, id: &str) -> Result<&mut ConfigRecord, EngineError> {
        self.configs
            .get_mut(id)
            .filter(|record| !record.deleted)
            .ok_or_else(|| EngineError::not_found("configuration", id))
    }
}

struct ActiveSet {
    configuration: Arc<Configuration>,
    consensus: Arc<ConsensusConfig>,
    usage: Arc<AtomicU64>,
}

struct StoreState {
    configs: BTreeMap<String, ConfigRecord>,
    presets: BTreeMap<String, Preset>,
    consensus: BTreeMap<String, Arc<ConsensusConfig>>,
    active_config: String,
    active_consensus: String,
}

/// Versioned configuration records with a single active pointer.
///
/// Every write takes `state`; activation additionally swaps `active` while
/// still holding it, so the flags seen through `list_all` and the pointer seen
/// by scans always agree. Scans only clone the `Arc` behind `active`.
pub struct ConfigurationStore {
    state: Mutex<StoreState>,
    active: RwLock<Arc<ActiveSet>>,
}

impl ConfigurationStore {
    /// Store seeded with a default configuration built from `catalog`, the
    /// built-in presets and a weighted consensus config.
    pub fn new(catalog: &CatalogSnapshot) -> Self {
        let now = Utc::now();
        let configuration = Arc::new(Configuration {
            id: DEFAULT_CONFIGURATION_ID.into(),
            name: DEFAULT_CONFIGURATION_NAME.into(),
            version: 1,
            is_active: true,
            is_default: true,
            policy: ScoringPolicy::from_catalog(catalog),
            usage_count: 0,
            created_at: now,
            updated_at: now,
        });

        let mut ranked: Vec<_> = catalog.ai_models.values().collect();
        ranked.sort_by_key(|model| (model.rank, model.id.clone()));
        let consensus = Arc::new(ConsensusConfig {
            id: DEFAULT_CONSENSUS_ID.into(),
            name: "Weighted consensus".into(),
            strategy: Strategy::Weighted,
            model_rankings: ranked.iter().map(|model| model.id.clone()).collect(),
            confidence_threshold: 0.6,
            is_active: true,
        });

        let usage = Arc::new(AtomicU64::new(0));
        let presets = builtin_presets(catalog, DEFAULT_CONFIGURATION_NAME)
            .into_iter()
            .map(|preset| (preset.id.clone(), preset))
            .collect();

        let mut configs = BTreeMap::new();
        configs.insert(
            configuration.id.clone(),
            ConfigRecord {
                versions: vec![Arc::clone(&configuration)],
                usage: Arc::clone(&usage),
                deleted: false,
            },
        );
        let mut consensus_map = BTreeMap::new();
        consensus_map.insert(consensus.id.clone(), Arc::clone(&consensus));

        Self {
            state: Mutex::new(StoreState {
                configs,
                presets,
                consensus: consensus_map,
                active_config: DEFAULT_CONFIGURATION_ID.into(),
                active_consensus: DEFAULT_CONSENSUS_ID.into(),
            }),
            active: RwLock::new(Arc::new(ActiveSet {
                configuration,
                consensus,
                usage,
            })),
        }
    }

    /// Snapshot for a new scan; counts one use of the active configuration.
    pub fn snapshot(&self) -> ScoringSnapshot {
        self.take_active(true)
    }

    /// Snapshot of the active configuration that does not count as a use.
    pub fn peek(&self) -> ScoringSnapshot {
        self.take_active(false)
    }

    fn take_active(&self, count_usage: bool) -> ScoringSnapshot {
        let active = self.active.read().clone();
        if count_usage {
            active.usage.fetch_add(1, Ordering::Relaxed);
        }
        ScoringSnapshot {
            configuration: Arc::clone(&active.configuration),
            consensus: Arc::clone(&active.consensus),
        }
    }

    /// Snapshot of a specific configuration under the active consensus config.
    pub fn snapshot_of(&self, id: &str, count_usage: bool) -> Result<ScoringSnapshot, EngineError> {
        let state = self.state.lock();
        let record = state.live(id)?;
        if count_usage {
            record.usage.fetch_add(1, Ordering::Relaxed);
        }
        let configuration = Arc::new(materialize(record, id == state.active_config));
        let consensus = state
            .consensus
            .get(&state.active_consensus)
            .cloned()
            .ok_or_else(|| EngineError::not_found("consensus config", &state.active_consensus))?;
        Ok(ScoringSnapshot {
            configuration,
            consensus,
        })
    }

    pub fn list_all(&self) -> Vec<Configuration> {
        let state = self.state.lock();
        state
            .configs
            .iter()
            .filter(|(_, record)| !record.deleted)
            .map(|(id, record)| materialize(record, *id == state.active_config))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Configuration, EngineError> {
        let state = self.state.lock();
        state
            .live(id)
            .map(|record| materialize(record, id == state.active_config))
    }

    /// A historical version, as referenced by a past scan result. Resolves
    /// versions of deleted configurations too. Only the current version of
    /// the active configuration reports `is_active`.
    pub fn get_version(&self, id: &str, version: u32) -> Result<Arc<Configuration>, EngineError> {
        let state = self.state.lock();
        let record = state.configs.get(id);
        let stored = record
            .and_then(|record| record.versions.iter().find(|c| c.version == version))
            .ok_or_else(|| EngineError::not_found("configuration version", format!("{id}@{version}")))?;
        let is_current = record.is_some_and(|record| !record.deleted && record.latest().version == version);
        let mut configuration = Configuration::clone(stored);
        configuration.is_active = is_current && state.active_config == id;
        Ok(Arc::new(configuration))
    }

    /// First live configuration or consensus config that still points at the
    /// catalog record `id`, rendered as a reason for an in-use error.
    pub fn reference_to(&self, kind: &str, id: &str) -> Option<String> {
        let state = self.state.lock();
        if kind == "ai model" {
            return state
                .consensus
                .values()
                .find(|config| config.model_rankings.iter().any(|model| model == id))
                .map(|config| format!("consensus config `{}` ranks it", config.id));
        }
        state
            .configs
            .iter()
            .filter(|(_, record)| !record.deleted)
            .find(|(_, record)| {
                let policy = &record.latest().policy;
                match kind {
                    "category" => policy.category_weights.contains_key(id),
                    "ti source" => policy.ti_config.source_weights.contains_key(id),
                    "check" => policy.check_weights.contains_key(id),
                    _ => false,
                }
            })
            .map(|(config_id, _)| format!("configuration `{config_id}` weights it"))
    }

    pub fn get_active(&self) -> Configuration {
        let active = self.active.read().clone();
        let mut configuration = Configuration::clone(&active.configuration);
        configuration.usage_count = active.usage.load(Ordering::Relaxed);
        configuration
    }

    /// Persist a new inactive configuration.
    pub fn create(&self, draft: ConfigurationDraft) -> Result<Configuration, EngineError> {
        validate_draft(&draft)?;
        let now = Utc::now();
        let configuration = Configuration {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            version: 1,
            is_active: false,
            is_default: false,
            policy: draft.policy,
            usage_count: 0,
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.lock();
        state.configs.insert(
            configuration.id.clone(),
            ConfigRecord {
                versions: vec![Arc::new(configuration.clone())],
                usage: Arc::new(AtomicU64::new(0)),
                deleted: false,
            },
        );
        info!(config_id = %configuration.id, name = %configuration.name, "configuration created");
        Ok(configuration)
    }

    /// Save a new version. Scans already running keep the version they started
    /// with; if the configuration is active, later scans see the new one.
    pub fn update(&self, id: &str, draft: ConfigurationDraft) -> Result<Configuration, EngineError> {
        validate_draft(&draft)?;
        self.push_version(id, |next| {
            next.name = draft.name;
            next.policy = draft.policy;
            Ok(())
        })
    }

    /// Replace one category weight, validated against the remaining budget.
    pub fn set_category_weight(
        &self,
        id: &str,
        category_id: &str,
        points: u32,
    ) -> Result<Configuration, EngineError> {
        self.push_version(id, |next| {
            budget::validate_category_update(&next.policy, category_id, points)?;
            next.policy
                .category_weights
                .insert(category_id.to_string(), points);
            Ok(())
        })
    }

    pub fn set_source_weight(
        &self,
        id: &str,
        source_id: &str,
        points: u32,
    ) -> Result<Configuration, EngineError> {
        self.push_version(id, |next| {
            budget::validate_ti_update(&next.policy, source_id, points)?;
            next.policy
                .ti_config
                .source_weights
                .insert(source_id.to_string(), points);
            Ok(())
        })
    }

    pub fn set_check_weight(
        &self,
        id: &str,
        check_id: &str,
        points: u32,
    ) -> Result<Configuration, EngineError> {
        self.push_version(id, |next| {
            budget::validate_check_update(check_id, points)?;
            next.policy.check_weights.insert(check_id.to_string(), points);
            Ok(())
        })
    }

    fn push_version(
        &self,
        id: &str,
        edit: impl FnOnce(&mut Configuration) -> Result<(), EngineError>,
    ) -> Result<Configuration, EngineError> {
        let mut state = self.state.lock();
        let is_active = state.active_config == id;
        let record = state.live_mut(id)?;
        let mut next = Configuration::clone(record.latest());
        edit(&mut next)?;
        budget::validate(&next.policy)?;
        next.version += 1;
        next.updated_at = Utc::now();
        next.is_active = is_active;
        let next = Arc::new(next);
        record.versions.push(Arc::clone(&next));
        let usage = Arc::clone(&record.usage);
        let version = next.version;

        if is_active {
            let consensus = Arc::clone(&self.active.read().consensus);
            *self.active.write() = Arc::new(ActiveSet {
                configuration: Arc::clone(&next),
                consensus,
                usage: Arc::clone(&usage),
            });
        }
        info!(config_id = %id, version, "configuration updated");
        let mut out = Configuration::clone(&next);
        out.usage_count = usage.load(Ordering::Relaxed);
        Ok(out)
    }

    /// Make `id` the single active configuration.
    pub fn activate(&self, id: &str) -> Result<Configuration, EngineError> {
        let mut state = self.state.lock();
        let record = state.live(id)?;
        budget::validate(&record.latest().policy)?;

        let mut configuration = Configuration::clone(record.latest());
        configuration.is_active = true;
        let configuration = Arc::new(configuration);
        let usage = Arc::clone(&record.usage);
        let previous = std::mem::replace(&mut state.active_config, id.to_string());

        let consensus = Arc::clone(&self.active.read().consensus);
        *self.active.write() = Arc::new(ActiveSet {
            configuration: Arc::clone(&configuration),
            consensus,
            usage: Arc::clone(&usage),
        });
        info!(config_id = %id, previous = %previous, "configuration activated");

        let mut out = Configuration::clone(&configuration);
        out.usage_count = usage.load(Ordering::Relaxed);
        Ok(out)
    }

    pub fn delete(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let record = state.live(id)?;
        if state.active_config == id {
            return Err(InUseError::new("configuration", id, "it is the active configuration").into());
        }
        let latest = record.latest();
        if latest.is_default {
            return Err(InUseError::new("configuration", id, "it is the default configuration").into());
        }
        let now = Utc::now();
        if let Some(preset) = state.presets.values().find(|p| p.pins(&latest.name, now)) {
            return Err(InUseError::new(
                "configuration",
                id,
                format!("immutable preset `{}` references it", preset.id),
            )
            .into());
        }
        if let Some(record) = state.configs.get_mut(id) {
            record.deleted = true;
        }
        info!(config_id = %id, "configuration deleted");
        Ok(())
    }

    pub fn list_presets(&self) -> Vec<Preset> {
        self.state.lock().presets.values().cloned().collect()
    }

    pub fn add_preset(&self, preset: Preset) -> Result<Preset, EngineError> {
        budget::validate(&preset.template)?;
        let mut state = self.state.lock();
        if state.presets.contains_key(&preset.id) {
            return Err(EngineError::Conflict {
                kind: "preset",
                id: preset.id,
            });
        }
        state.presets.insert(preset.id.clone(), preset.clone());
        Ok(preset)
    }

    /// Copy a preset's template into a new draft configuration.
    pub fn apply_preset(&self, preset_id: &str) -> Result<Configuration, EngineError> {
        let preset = self
            .state
            .lock()
            .presets
            .get(preset_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("preset", preset_id))?;
        debug!(preset_id, "applying preset");
        self.create(ConfigurationDraft {
            name: format!("{} ({})", preset.name, Utc::now().format("%Y-%m-%d %H:%M:%S")),
            policy: preset.template,
        })
    }

    pub fn list_consensus(&self) -> Vec<ConsensusConfig> {
        let state = self.state.lock();
        state
            .consensus
            .values()
            .map(|config| with_active_flag(config, config.id == state.active_consensus))
            .collect()
    }

    pub fn get_consensus(&self, id: &str) -> Result<ConsensusConfig, EngineError> {
        let state = self.state.lock();
        state
            .consensus
            .get(id)
            .map(|config| with_active_flag(config, id == state.active_consensus))
            .ok_or_else(|| EngineError::not_found("consensus config", id))
    }

    pub fn get_active_consensus(&self) -> ConsensusConfig {
        ConsensusConfig::clone(&self.active.read().consensus)
    }

    pub fn create_consensus(&self, draft: ConsensusDraft) -> Result<ConsensusConfig, EngineError> {
        draft.validate()?;
        let config = draft.into_config(Uuid::new_v4().to_string());
        self.state
            .lock()
            .consensus
            .insert(config.id.clone(), Arc::new(config.clone()));
        info!(consensus_id = %config.id, strategy = %config.strategy, "consensus config created");
        Ok(config)
    }

    pub fn update_consensus(
        &self,
        id: &str,
        draft: ConsensusDraft,
    ) -> Result<ConsensusConfig, EngineError> {
        draft.validate()?;
        let mut state = self.state.lock();
        if !state.consensus.contains_key(id) {
            return Err(EngineError::not_found("consensus config", id));
        }
        let is_active = state.active_consensus == id;
        let mut config = draft.into_config(id.to_string());
        config.is_active = is_active;
        let config = Arc::new(config);
        state.consensus.insert(id.to_string(), Arc::clone(&config));
        if is_active {
            self.swap_consensus(Arc::clone(&config));
        }
        Ok(ConsensusConfig::clone(&config))
    }

    pub fn activate_consensus(&self, id: &str) -> Result<ConsensusConfig, EngineError> {
        let mut state = self.state.lock();
        let stored = state
            .consensus
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("consensus config", id))?;
        let config = Arc::new(with_active_flag(&stored, true));
        state.active_consensus = id.to_string();
        self.swap_consensus(Arc::clone(&config));
        info!(consensus_id = %id, "consensus config activated");
        Ok(ConsensusConfig::clone(&config))
    }

    pub fn delete_consensus(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.consensus.contains_key(id) {
            return Err(EngineError::not_found("consensus config", id));
        }
        if state.active_consensus == id {
            return Err(
                InUseError::new("consensus config", id, "it is the active consensus config").into(),
            );
        }
        state.consensus.remove(id);
        Ok(())
    }

    // Caller must hold `state`.
    fn swap_consensus(&self, consensus: Arc<ConsensusConfig>) {
        let current = self.active.read().clone();
        *self.active.write() = Arc::new(ActiveSet {
            configuration: Arc::clone(&current.configuration),
            consensus,
            usage: Arc::clone(&current.usage),
        });
    }
}

fn validate_draft(draft: &ConfigurationDraft) -> Result<(), EngineError> {
    if draft.name.trim().is_empty() {
        return Err(crate::error::ValidationError::Blank {
            field: "name".into(),
        }
        .into());
    }
    budget::validate(&draft.policy)?;
    Ok(())
}

fn materialize(record: &ConfigRecord, is_active: bool) -> Configuration {
    let mut configuration = Configuration::clone(record.latest());
    configuration.is_active = is_active;
    configuration.usage_count = record.usage.load(Ordering::Relaxed);
    configuration
}

fn with_active_flag(config: &ConsensusConfig, is_active: bool) -> ConsensusConfig {
    ConsensusConfig {
        is_active,
        ..config.clone()
    }
}
