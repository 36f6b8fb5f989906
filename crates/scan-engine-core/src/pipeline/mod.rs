//! The per-scan pipeline:
//! Stage1 → (EarlyExit | Stage2) → TI lookup → AI consensus → policy override → classify.
//!
//! Each scan takes immutable snapshots of the active configuration, consensus
//! config and catalog when it starts and uses only those for the whole run.

pub mod checks;
pub mod intel;
pub mod result;
pub mod target;

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Instant};

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    catalog::{Catalog, CatalogSnapshot, Check, CheckTier, HttpProbe},
    classifier::{classify, RiskLevel},
    config::{ConfigurationStore, ScoringPolicy, ScoringSnapshot},
    consensus::{aggregate, ConsensusOutcome, ModelOutcome, ModelResponse},
    error::{DegradedScanWarning, EngineError, ExternalIntegrationError, IntegrationKind},
    llm::{AiJudge, JudgeRequest, UnconfiguredJudge},
    settings::EngineSettings,
    stats::{ScanStats, StatsSnapshot},
    MAX_TI_SCORE, MAX_TOTAL_SCORE,
};

pub use checks::{CheckEvaluator, LexicalCheckEvaluator};
pub use intel::{Indicator, IndicatorFeed, IndicatorKind, IntelMatch, ThreatIntelProvider};
pub use result::{
    Calibration, Finding, FlowStep, OverrideReason, Performance, PolicyOverride, ScanResult,
    ScanVerdict, StageName, StageRecord, StageStatus, TiHit,
};
pub use target::{ScanTarget, TargetKind, UrlParts};

/// Body of a calibration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRequest {
    pub url: String,
    #[serde(default)]
    pub configuration_id: Option<String>,
    /// Test runs are neither counted as configuration usage nor in stats.
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub resolved_addresses: Vec<std::net::IpAddr>,
    #[serde(default)]
    pub form_actions: Vec<String>,
    #[serde(default)]
    pub claimed_brand: Option<String>,
}

impl CalibrationRequest {
    fn target(&self) -> ScanTarget {
        ScanTarget {
            kind: TargetKind::Url,
            value: self.url.clone(),
            resolved_addresses: self.resolved_addresses.clone(),
            form_actions: self.form_actions.clone(),
            claimed_brand: self.claimed_brand.clone(),
        }
    }
}

/// Points awarded per category, each capped at its category weight.
#[derive(Debug, Clone, Default)]
struct CategoryLedger {
    used: BTreeMap<String, u32>,
}

impl CategoryLedger {
    fn award(&mut self, policy: &ScoringPolicy, check: &Check) -> u32 {
        let ceiling = policy.category_weight(&check.category_id);
        let used = self.used.entry(check.category_id.clone()).or_default();
        let awarded = policy.check_weight(check).min(ceiling.saturating_sub(*used));
        *used += awarded;
        awarded
    }

    fn total(&self) -> u32 {
        self.used.values().sum()
    }
}

fn confidence(points: u32, budget: u64) -> f64 {
    if budget == 0 {
        return 0.0;
    }
    (f64::from(points) * 100.0 / budget as f64).min(100.0)
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn finding(check: &Check, policy: &ScoringPolicy, awarded: u32, evidence: String) -> Finding {
    Finding {
        check_id: check.id.clone(),
        category_id: check.category_id.clone(),
        name: check.name.clone(),
        severity: check.severity,
        stage: check.tier,
        points: policy.check_weight(check),
        awarded,
        evidence,
    }
}

fn check_failure(check: &Check, err: anyhow::Error) -> DegradedScanWarning {
    warn!(check_id = %check.id, error = %format!("{err:#}"), "check failed; scoring it as zero");
    let failure = ExternalIntegrationError {
        kind: IntegrationKind::Check,
        id: check.id.clone(),
        message: format!("{err:#}"),
        timed_out: false,
    };
    DegradedScanWarning::from(&failure)
}

struct StageOneOutcome {
    ledger: CategoryLedger,
    findings: Vec<Finding>,
    warnings: Vec<DegradedScanWarning>,
}

struct IntelOutcome {
    hits: Vec<TiHit>,
    score: f64,
    warnings: Vec<DegradedScanWarning>,
}

/// Runs scans against the live catalog and the active configuration.
pub struct ScanEngine {
    catalog: Arc<Catalog>,
    store: Arc<ConfigurationStore>,
    checks: Arc<dyn CheckEvaluator>,
    intel: Arc<dyn ThreatIntelProvider>,
    judge: Arc<dyn AiJudge>,
    settings: EngineSettings,
    stats: ScanStats,
}

impl ScanEngine {
    /// Engine with the lexical check evaluator, an empty indicator feed and
    /// no AI judge.
    pub fn new(catalog: Arc<Catalog>, store: Arc<ConfigurationStore>, settings: EngineSettings) -> Self {
        Self {
            catalog,
            store,
            checks: Arc::new(LexicalCheckEvaluator::new()),
            intel: Arc::new(IndicatorFeed::new()),
            judge: Arc::new(UnconfiguredJudge),
            settings,
            stats: ScanStats::new(),
        }
    }

    /// Engine over the default catalog with a freshly seeded store.
    pub fn with_defaults(settings: EngineSettings) -> anyhow::Result<Self> {
        let probe = HttpProbe::new(settings.probe_timeout)?;
        let catalog = Arc::new(Catalog::with_defaults(Arc::new(probe)));
        let store = Arc::new(ConfigurationStore::new(&catalog.snapshot()));
        Ok(Self::new(catalog, store, settings))
    }

    pub fn with_check_evaluator(mut self, checks: Arc<dyn CheckEvaluator>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_threat_intel(mut self, intel: Arc<dyn ThreatIntelProvider>) -> Self {
        self.intel = intel;
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn AiJudge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<ConfigurationStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.store.list_all())
    }

    /// Score a target under the active configuration. Fails only with
    /// [`EngineError::Cancelled`] (overall timeout) or a malformed threshold
    /// table; integration failures are absorbed into the result.
    pub async fn scan(&self, target: ScanTarget) -> Result<ScanResult, EngineError> {
        let snapshot = self.store.snapshot();
        let result = self.run_bounded(&target, &snapshot).await?;
        self.stats.record(&result);
        Ok(result)
    }

    /// Like [`scan`](Self::scan), but abandons the run as soon as `cancel`
    /// resolves. In-flight TI and AI calls are dropped with it.
    pub async fn scan_with_cancel<F>(&self, target: ScanTarget, cancel: F) -> Result<ScanResult, EngineError>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        tokio::select! {
            result = self.scan(target) => result,
            _ = cancel => {
                self.stats.record_cancelled();
                info!(elapsed_ms = elapsed_ms(started), "scan cancelled by caller");
                Err(EngineError::Cancelled { elapsed_ms: elapsed_ms(started) })
            }
        }
    }

    /// Operator dry run against a URL, returning the step-by-step trace.
    pub async fn calibrate(&self, request: CalibrationRequest) -> Result<Calibration, EngineError> {
        let count_usage = !request.test_mode;
        let snapshot = match &request.configuration_id {
            Some(id) => self.store.snapshot_of(id, count_usage)?,
            None if count_usage => self.store.snapshot(),
            None => self.store.peek(),
        };
        let result = self.run_bounded(&request.target(), &snapshot).await?;
        if count_usage {
            self.stats.record(&result);
        }
        Ok(Calibration::from_result(result))
    }

    async fn run_bounded(
        &self,
        target: &ScanTarget,
        snapshot: &ScoringSnapshot,
    ) -> Result<ScanResult, EngineError> {
        let started = Instant::now();
        let catalog = self.catalog.snapshot();
        match timeout(self.settings.scan_timeout, self.run(target, snapshot, &catalog, started)).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.record_cancelled();
                warn!(
                    timeout_ms = u64::try_from(self.settings.scan_timeout.as_millis()).unwrap_or(u64::MAX),
                    "scan exceeded its overall timeout; discarding partial results"
                );
                Err(EngineError::Cancelled {
                    elapsed_ms: elapsed_ms(started),
                })
            }
        }
    }

    #[instrument(
        name = "scan",
        skip_all,
        fields(kind = target.kind.as_str(), config = %snapshot.configuration.id, version = snapshot.configuration.version)
    )]
    async fn run(
        &self,
        target: &ScanTarget,
        snapshot: &ScoringSnapshot,
        catalog: &CatalogSnapshot,
        started: Instant,
    ) -> Result<ScanResult, EngineError> {
        let policy = &snapshot.configuration.policy;
        let table = policy.threshold_table()?;
        let budget = policy.confidence_budget();
        let mut stages = Vec::with_capacity(6);
        let mut warnings = Vec::new();
        let mut degraded = false;

        // Stage 1
        let stage_started = Instant::now();
        let StageOneOutcome {
            mut ledger,
            mut findings,
            warnings: stage1_warnings,
        } = self.stage1(target, policy, catalog).await;
        warnings.extend(stage1_warnings);
        let stage1_confidence = confidence(ledger.total(), budget);
        let early_exit = stage1_confidence >= policy.stage1_threshold;
        stages.push(StageRecord {
            stage: StageName::Stage1,
            status: if early_exit {
                StageStatus::EarlyExit
            } else {
                StageStatus::Completed
            },
            value: f64::from(ledger.total()),
            confidence: Some(stage1_confidence),
            duration_ms: elapsed_ms(stage_started),
            detail: format!(
                "{} finding(s), {} point(s), confidence {:.1}% against threshold {:.1}%",
                findings.len(),
                ledger.total(),
                stage1_confidence,
                policy.stage1_threshold
            ),
        });

        // Stage 2
        let stage_started = Instant::now();
        let deep_checks: Vec<&Check> = catalog
            .enabled_checks()
            .filter(|check| check.tier == CheckTier::Stage2)
            .filter(|check| policy.rules.allows_stage2(&check.id))
            .filter(|check| policy.category_weight(&check.category_id) > 0)
            .collect();
        let stage2 = if early_exit {
            StageRecord {
                stage: StageName::Stage2,
                status: StageStatus::Skipped,
                value: 0.0,
                confidence: None,
                duration_ms: 0,
                detail: "skipped: Stage 1 confidence reached its threshold".into(),
            }
        } else if deep_checks.is_empty() {
            StageRecord {
                stage: StageName::Stage2,
                status: StageStatus::Skipped,
                value: 0.0,
                confidence: None,
                duration_ms: 0,
                detail: "skipped: no Stage 2 checks enabled".into(),
            }
        } else {
            let before = ledger.total();
            let deep = self.stage2(target, policy, &deep_checks, ledger.clone(), budget);
            match timeout(self.settings.stage2_timeout, deep).await {
                Ok((deep_ledger, deep_findings, deep_warnings, stopped_early)) => {
                    ledger = deep_ledger;
                    let found = deep_findings.len();
                    findings.extend(deep_findings);
                    warnings.extend(deep_warnings);
                    let combined = confidence(ledger.total(), budget);
                    StageRecord {
                        stage: StageName::Stage2,
                        status: if stopped_early {
                            StageStatus::StoppedEarly
                        } else {
                            StageStatus::Completed
                        },
                        value: f64::from(ledger.total() - before),
                        confidence: Some(combined),
                        duration_ms: elapsed_ms(stage_started),
                        detail: format!(
                            "{found} finding(s), combined confidence {combined:.1}% against threshold {:.1}%",
                            policy.stage2_threshold
                        ),
                    }
                }
                Err(_) => {
                    let timeout_ms =
                        u64::try_from(self.settings.stage2_timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(timeout_ms, "stage 2 timed out; falling back to stage 1 result");
                    degraded = true;
                    warnings.push(DegradedScanWarning::Stage2TimedOut { timeout_ms });
                    StageRecord {
                        stage: StageName::Stage2,
                        status: StageStatus::TimedOut,
                        value: 0.0,
                        confidence: None,
                        duration_ms: elapsed_ms(stage_started),
                        detail: format!("timed out after {timeout_ms} ms; contributions discarded"),
                    }
                }
            }
        };
        stages.push(stage2);
        findings.sort_by(|a, b| a.check_id.cmp(&b.check_id));
        let base_score = ledger.total();

        // TI lookup
        let stage_started = Instant::now();
        let intel = self.lookup_intel(target, policy, catalog).await;
        warnings.extend(intel.warnings);
        let ti_hits = intel.hits;
        let ti_score = intel.score;
        stages.push(StageRecord {
            stage: StageName::TiLookup,
            status: StageStatus::Completed,
            value: ti_score,
            confidence: None,
            duration_ms: elapsed_ms(stage_started),
            detail: if ti_hits.is_empty() {
                "no source matched".into()
            } else {
                let sources: Vec<&str> = ti_hits.iter().map(|hit| hit.source_id.as_str()).collect();
                format!("matched by {}", sources.join(", "))
            },
        });

        // AI consensus
        let stage_started = Instant::now();
        let consensus = self
            .consult_models(target, snapshot, catalog, base_score, &findings)
            .await;
        if consensus.ai_unavailable {
            warnings.push(DegradedScanWarning::AiUnavailable);
        } else if consensus.low_confidence {
            warnings.push(DegradedScanWarning::AiLowConfidence);
        }
        stages.push(StageRecord {
            stage: StageName::AiConsensus,
            status: if consensus.ai_unavailable {
                StageStatus::Skipped
            } else {
                StageStatus::Completed
            },
            value: consensus.multiplier,
            confidence: Some(consensus.average_confidence),
            duration_ms: elapsed_ms(stage_started),
            detail: format!(
                "{} via {}: {} participant(s), {} excluded, multiplier {:.2}",
                consensus.verdict.as_str(),
                consensus.strategy,
                consensus.participants.len(),
                consensus.excluded_models.len(),
                consensus.multiplier
            ),
        });

        // Policy override
        let stage_started = Instant::now();
        let policy_override = self.policy_override(target, policy, &ti_hits);
        stages.push(StageRecord {
            stage: StageName::PolicyOverride,
            status: if policy_override.is_some() {
                StageStatus::Triggered
            } else {
                StageStatus::Completed
            },
            value: 0.0,
            confidence: None,
            duration_ms: elapsed_ms(stage_started),
            detail: policy_override
                .as_ref()
                .map(|o| format!("{}: {}", o.reason.as_str(), o.detail))
                .unwrap_or_else(|| "no rule matched".into()),
        });

        // Classify
        let stage_started = Instant::now();
        let raw = (f64::from(base_score) + ti_score) * consensus.multiplier;
        let final_score = raw.round().clamp(0.0, f64::from(MAX_TOTAL_SCORE)) as u32;
        let scored_level = classify(final_score, &table)?;
        let (risk_level, verdict) = match &policy_override {
            Some(_) => (RiskLevel::Critical, ScanVerdict::Block),
            None => (scored_level, ScanVerdict::for_level(scored_level)),
        };
        stages.push(StageRecord {
            stage: StageName::Classify,
            status: StageStatus::Completed,
            value: f64::from(final_score),
            confidence: None,
            duration_ms: elapsed_ms(stage_started),
            detail: format!(
                "({base_score} + {ti_score:.2}) x {:.2} = {final_score} -> {} ({})",
                consensus.multiplier,
                risk_level,
                verdict.as_str()
            ),
        });

        let ai_unavailable = consensus.ai_unavailable;
        let total_duration_ms = elapsed_ms(started);
        info!(
            final_score,
            risk_level = %risk_level,
            verdict = verdict.as_str(),
            degraded,
            total_duration_ms,
            "scan completed"
        );

        Ok(ScanResult {
            id: Uuid::new_v4().to_string(),
            target: target.clone(),
            configuration_id: snapshot.configuration.id.clone(),
            configuration_version: snapshot.configuration.version,
            consensus_config_id: snapshot.consensus.id.clone(),
            base_score,
            ti_score,
            ai_multiplier: consensus.multiplier,
            final_score,
            risk_level,
            verdict,
            policy_override,
            stages,
            findings,
            ti_hits,
            consensus,
            degraded,
            ai_unavailable,
            warnings,
            performance: Performance { total_duration_ms },
            scanned_at: chrono::Utc::now(),
        })
    }

    #[instrument(name = "stage1", skip_all)]
    async fn stage1(
        &self,
        target: &ScanTarget,
        policy: &ScoringPolicy,
        catalog: &CatalogSnapshot,
    ) -> StageOneOutcome {
        let cheap: Vec<&Check> = catalog
            .enabled_checks()
            .filter(|check| check.tier == CheckTier::Stage1)
            .filter(|check| policy.category_weight(&check.category_id) > 0)
            .collect();

        let evaluator = &self.checks;
        let mut outcomes: Vec<_> = stream::iter(cheap)
            .map(|check| async move { (check, evaluator.evaluate(check, target).await) })
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;
        outcomes.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));

        let mut ledger = CategoryLedger::default();
        let mut findings = Vec::new();
        let mut warnings = Vec::new();
        for (check, outcome) in outcomes {
            match outcome {
                Ok(Some(evidence)) => {
                    let awarded = ledger.award(policy, check);
                    debug!(check_id = %check.id, awarded, "check fired");
                    findings.push(finding(check, policy, awarded, evidence));
                }
                Ok(None) => {}
                Err(err) => warnings.push(check_failure(check, err)),
            }
        }
        StageOneOutcome {
            ledger,
            findings,
            warnings,
        }
    }

    /// Runs deep checks in id order, stopping once combined confidence
    /// reaches the Stage 2 threshold.
    #[instrument(name = "stage2", skip_all, fields(checks = checks.len()))]
    async fn stage2(
        &self,
        target: &ScanTarget,
        policy: &ScoringPolicy,
        checks: &[&Check],
        mut ledger: CategoryLedger,
        budget: u64,
    ) -> (CategoryLedger, Vec<Finding>, Vec<DegradedScanWarning>, bool) {
        let mut findings = Vec::new();
        let mut warnings = Vec::new();
        for (idx, check) in checks.iter().enumerate() {
            match self.checks.evaluate(check, target).await {
                Ok(Some(evidence)) => {
                    let awarded = ledger.award(policy, check);
                    debug!(check_id = %check.id, awarded, "deep check fired");
                    findings.push(finding(check, policy, awarded, evidence));
                }
                Ok(None) => {}
                Err(err) => warnings.push(check_failure(check, err)),
            }
            let remaining = idx + 1 < checks.len();
            if remaining && confidence(ledger.total(), budget) >= policy.stage2_threshold {
                debug!(after = %check.id, "stage 2 threshold reached");
                return (ledger, findings, warnings, true);
            }
        }
        (ledger, findings, warnings, false)
    }

    #[instrument(name = "ti_lookup", skip_all)]
    async fn lookup_intel(
        &self,
        target: &ScanTarget,
        policy: &ScoringPolicy,
        catalog: &CatalogSnapshot,
    ) -> IntelOutcome {
        let sources: Vec<_> = catalog
            .enabled_sources()
            .filter(|source| policy.source_weight(&source.id) > 0)
            .collect();
        let intel = &self.intel;
        let per_call = self.settings.ti_timeout;
        let mut answers: Vec<_> = stream::iter(sources)
            .map(|source| async move { (source, timeout(per_call, intel.lookup(source, target)).await) })
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;
        answers.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));

        let mut hits = Vec::new();
        let mut warnings = Vec::new();
        for (source, answer) in answers {
            let failure = match answer {
                Ok(Ok(Some(matched))) => {
                    let weight = policy.source_weight(&source.id);
                    let points = (source.reliability.clamp(0.0, 1.0) * f64::from(weight)).min(f64::from(weight));
                    debug!(source_id = %source.id, indicator = %matched.indicator, points, "TI source matched");
                    hits.push(TiHit {
                        source_id: source.id.clone(),
                        indicator: matched.indicator,
                        weight,
                        reliability: source.reliability,
                        points,
                        tier1: source.is_tier1(),
                        sinkhole: matched.sinkhole,
                    });
                    continue;
                }
                Ok(Ok(None)) => continue,
                Ok(Err(err)) => ExternalIntegrationError {
                    kind: IntegrationKind::TiSource,
                    id: source.id.clone(),
                    message: format!("{err:#}"),
                    timed_out: false,
                },
                Err(_) => ExternalIntegrationError {
                    kind: IntegrationKind::TiSource,
                    id: source.id.clone(),
                    message: format!("timed out after {} ms", per_call.as_millis()),
                    timed_out: true,
                },
            };
            warn!(source_id = %failure.id, error = %failure.message, "TI lookup failed; contributing zero");
            warnings.push(DegradedScanWarning::from(&failure));
        }

        let score = hits
            .iter()
            .map(|hit| hit.points)
            .sum::<f64>()
            .min(f64::from(MAX_TI_SCORE));
        IntelOutcome {
            hits,
            score,
            warnings,
        }
    }

    #[instrument(name = "ai_consensus", skip_all, fields(strategy = %snapshot.consensus.strategy))]
    async fn consult_models(
        &self,
        target: &ScanTarget,
        snapshot: &ScoringSnapshot,
        catalog: &CatalogSnapshot,
        base_score: u32,
        findings: &[Finding],
    ) -> ConsensusOutcome {
        let judge = &self.judge;
        let per_call = self.settings.ai_timeout;
        let mut responses: Vec<ModelResponse> = stream::iter(catalog.enabled_models())
            .map(|model| async move {
                if !model.credential_present {
                    return ModelResponse {
                        model_id: model.id.clone(),
                        outcome: ModelOutcome::MissingCredential,
                    };
                }
                let request = JudgeRequest {
                    model,
                    target,
                    base_score,
                    findings,
                };
                let outcome = match timeout(per_call, judge.judge(&request)).await {
                    Ok(Ok(judgment)) => ModelOutcome::Responded {
                        verdict: judgment.verdict,
                        confidence: judgment.confidence,
                    },
                    Ok(Err(err)) => {
                        warn!(model = %model.id, error = %format!("{err:#}"), "model call failed");
                        ModelOutcome::Failed {
                            message: format!("{err:#}"),
                        }
                    }
                    Err(_) => {
                        warn!(model = %model.id, "model call timed out");
                        ModelOutcome::TimedOut
                    }
                };
                ModelResponse {
                    model_id: model.id.clone(),
                    outcome,
                }
            })
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;
        responses.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        aggregate(&responses, &snapshot.consensus, &catalog.ai_models)
    }

    fn policy_override(
        &self,
        target: &ScanTarget,
        policy: &ScoringPolicy,
        ti_hits: &[TiHit],
    ) -> Option<PolicyOverride> {
        let rules = &policy.rules;
        if rules.enable_dual_tier1_block {
            let tier1: Vec<&str> = ti_hits
                .iter()
                .filter(|hit| hit.tier1)
                .map(|hit| hit.source_id.as_str())
                .collect();
            if tier1.len() >= 2 {
                return Some(PolicyOverride {
                    reason: OverrideReason::DualTier1,
                    detail: format!("listed by tier-1 sources {}", tier1.join(", ")),
                });
            }
        }
        if rules.enable_sinkhole_block {
            if let Some(hit) = ti_hits.iter().find(|hit| hit.sinkhole) {
                return Some(PolicyOverride {
                    reason: OverrideReason::Sinkhole,
                    detail: format!("{} flags {} as a sinkhole", hit.source_id, hit.indicator),
                });
            }
            let url_hosts = target.urls().into_iter().filter_map(|url| url.ip_host());
            let mut addresses = target.resolved_addresses.iter().copied().chain(url_hosts);
            if let Some(addr) = addresses.find(|addr| self.settings.is_sinkhole(addr)) {
                return Some(PolicyOverride {
                    reason: OverrideReason::Sinkhole,
                    detail: format!("resolves to sinkhole address {addr}"),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests;
