use std::{
    collections::BTreeSet,
    net::IpAddr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::time::sleep;

use super::*;
use crate::{
    catalog::{
        defaults::default_catalog, ConnectionProbe, ConnectionTest, TiSource,
    },
    config::store::DEFAULT_CONFIGURATION_ID,
    consensus::{ConsensusVerdict, Verdict},
    llm::Judgment,
};

struct NullProbe;

#[async_trait]
impl ConnectionProbe for NullProbe {
    async fn probe(&self, _endpoint: &str) -> ConnectionTest {
        ConnectionTest::ok(0)
    }
}

/// Fires a fixed set of checks; optionally fails some and stalls Stage 2.
#[derive(Default)]
struct ScriptedChecks {
    fire: BTreeSet<&'static str>,
    fail: BTreeSet<&'static str>,
    stage2_delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedChecks {
    fn firing(ids: &[&'static str]) -> Self {
        Self {
            fire: ids.iter().copied().collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl CheckEvaluator for ScriptedChecks {
    async fn evaluate(&self, check: &Check, _target: &ScanTarget) -> anyhow::Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if check.tier == CheckTier::Stage2 {
            if let Some(delay) = self.stage2_delay {
                sleep(delay).await;
            }
        }
        if self.fail.contains(check.id.as_str()) {
            bail!("upstream 503");
        }
        Ok(self
            .fire
            .contains(check.id.as_str())
            .then(|| format!("{} fired", check.id)))
    }
}

/// Fails one source outright and stalls another past the TI timeout.
struct FlakyIntel {
    feed: IndicatorFeed,
    failing: &'static str,
    stalled: &'static str,
}

#[async_trait]
impl ThreatIntelProvider for FlakyIntel {
    async fn lookup(&self, source: &TiSource, target: &ScanTarget) -> anyhow::Result<Option<IntelMatch>> {
        if source.id == self.failing {
            return Err(anyhow!("connection refused"));
        }
        if source.id == self.stalled {
            sleep(Duration::from_secs(5)).await;
        }
        self.feed.lookup(source, target).await
    }
}

struct FixedJudge {
    verdict: Verdict,
    confidence: f64,
    delay: Option<Duration>,
}

#[async_trait]
impl AiJudge for FixedJudge {
    async fn judge(&self, _request: &JudgeRequest<'_>) -> anyhow::Result<Judgment> {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        Ok(Judgment {
            verdict: self.verdict,
            confidence: self.confidence,
        })
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        ti_timeout: Duration::from_millis(50),
        ai_timeout: Duration::from_millis(200),
        stage2_timeout: Duration::from_millis(100),
        scan_timeout: Duration::from_secs(5),
        ..EngineSettings::default()
    }
}

fn engine_with(settings: EngineSettings, credentials: bool) -> ScanEngine {
    let mut snapshot = default_catalog();
    for model in snapshot.ai_models.values_mut() {
        model.credential_present = credentials;
    }
    let catalog = Arc::new(Catalog::new(snapshot, Arc::new(NullProbe)));
    let store = Arc::new(ConfigurationStore::new(&catalog.snapshot()));
    ScanEngine::new(catalog, store, settings)
}

fn engine(checks: ScriptedChecks) -> ScanEngine {
    engine_with(settings(), false).with_check_evaluator(Arc::new(checks))
}

/// Rescale confidence so a handful of points is meaningful.
fn use_confidence_budget(engine: &ScanEngine, budget: u32) {
    let mut draft = engine.store().get(DEFAULT_CONFIGURATION_ID).unwrap().draft();
    draft.policy.algorithm_config.confidence_budget = Some(budget);
    engine.store().update(DEFAULT_CONFIGURATION_ID, draft).unwrap();
}

fn stage(result: &ScanResult, name: StageName) -> &StageRecord {
    result.stage(name).unwrap()
}

#[tokio::test]
async fn category_weight_caps_awarded_points() {
    let engine = engine(ScriptedChecks::firing(&[
        "ip_address_host",
        "excessive_subdomains",
        "at_symbol_in_url",
        "punycode_domain",
    ]));
    let result = engine.scan(ScanTarget::url("http://x")).await.unwrap();

    // url_structure is capped at 60; punycode_domain comes last and gets the rest.
    let awarded: Vec<(&str, u32)> = result
        .findings
        .iter()
        .map(|f| (f.check_id.as_str(), f.awarded))
        .collect();
    assert_eq!(
        awarded,
        vec![
            ("at_symbol_in_url", 15),
            ("excessive_subdomains", 10),
            ("ip_address_host", 25),
            ("punycode_domain", 10),
        ]
    );
    assert_eq!(result.findings[3].points, 20);
    assert_eq!(result.base_score, 60);
    assert_eq!(result.final_score, 60);
    assert_eq!(result.risk_level, RiskLevel::High);
    assert_eq!(result.verdict, ScanVerdict::Warn);
    assert!(!result.degraded);
}

#[tokio::test]
async fn confident_stage1_skips_stage2() {
    let checks = ScriptedChecks::firing(&[
        "insecure_scheme",
        "credential_keywords",
        "suspicious_tld",
        "brand_infrastructure",
    ]);
    let engine = engine(checks);
    use_confidence_budget(&engine, 100);

    let result = engine.scan(ScanTarget::url("http://x")).await.unwrap();
    let stage1 = stage(&result, StageName::Stage1);
    assert_eq!(stage1.status, StageStatus::EarlyExit);
    assert_eq!(stage1.confidence, Some(70.0));
    assert_eq!(stage(&result, StageName::Stage2).status, StageStatus::Skipped);
    assert!(result
        .findings
        .iter()
        .all(|finding| finding.stage == CheckTier::Stage1));
    assert_eq!(result.base_score, 70);
    assert_eq!(result.risk_level, RiskLevel::High);
}

#[tokio::test]
async fn stage2_stops_once_threshold_is_reached() {
    let checks = Arc::new(ScriptedChecks::firing(&[
        "credential_keywords",
        "insecure_scheme",
        "brand_infrastructure",
        "homoglyph_domain",
    ]));
    let engine = engine_with(settings(), false).with_check_evaluator(checks.clone());
    use_confidence_budget(&engine, 100);

    let result = engine.scan(ScanTarget::url("http://x")).await.unwrap();
    assert_eq!(stage(&result, StageName::Stage1).status, StageStatus::Completed);
    let stage2 = stage(&result, StageName::Stage2);
    assert_eq!(stage2.status, StageStatus::StoppedEarly);
    assert_eq!(stage2.value, 40.0);
    assert_eq!(stage2.confidence, Some(90.0));
    assert!(result.findings.iter().all(|f| f.check_id != "homoglyph_domain"));
    assert_eq!(result.base_score, 90);
    assert_eq!(result.risk_level, RiskLevel::Critical);
    assert_eq!(result.verdict, ScanVerdict::Block);
    // 18 Stage-1 checks plus a single Stage-2 check.
    assert_eq!(checks.calls.load(Ordering::SeqCst), 19);
}

#[tokio::test]
async fn stage2_rule_toggle_keeps_check_out() {
    let engine = engine(ScriptedChecks::firing(&["form_origin"]));
    let mut draft = engine.store().get(DEFAULT_CONFIGURATION_ID).unwrap().draft();
    draft.policy.rules.enable_form_origin_check = false;
    engine.store().update(DEFAULT_CONFIGURATION_ID, draft).unwrap();

    let result = engine.scan(ScanTarget::url("https://x")).await.unwrap();
    assert!(result.findings.is_empty());
    assert_eq!(result.base_score, 0);
}

#[tokio::test]
async fn stage2_timeout_falls_back_to_stage1() {
    let checks = ScriptedChecks {
        stage2_delay: Some(Duration::from_secs(2)),
        ..ScriptedChecks::firing(&["insecure_scheme", "form_origin"])
    };
    let engine = engine(checks);

    let result = engine.scan(ScanTarget::url("http://x")).await.unwrap();
    assert!(result.degraded);
    assert_eq!(stage(&result, StageName::Stage2).status, StageStatus::TimedOut);
    assert_eq!(result.base_score, 20);
    assert!(result
        .warnings
        .contains(&DegradedScanWarning::Stage2TimedOut { timeout_ms: 100 }));
    assert_eq!(result.risk_level, RiskLevel::Low);
}

#[tokio::test]
async fn failing_check_scores_zero_and_warns() {
    let checks = ScriptedChecks {
        fail: ["long_url"].into_iter().collect(),
        ..ScriptedChecks::firing(&["long_url", "insecure_scheme"])
    };
    let engine = engine(checks);

    let result = engine.scan(ScanTarget::url("http://x")).await.unwrap();
    assert_eq!(result.base_score, 20);
    assert!(!result.degraded);
    assert!(result.warnings.iter().any(|warning| matches!(
        warning,
        DegradedScanWarning::CheckFailed { check_id, .. } if check_id == "long_url"
    )));
}

fn listed_on_two_tier1_sources() -> IndicatorFeed {
    IndicatorFeed::new()
        .with_indicator("phishtank", Indicator::domain("bad.example"))
        .with_indicator("urlhaus", Indicator::domain("bad.example"))
}

#[tokio::test]
async fn two_tier1_hits_force_block() {
    let engine = engine(ScriptedChecks::default()).with_threat_intel(Arc::new(listed_on_two_tier1_sources()));

    let result = engine
        .scan(ScanTarget::url("https://login.bad.example/x"))
        .await
        .unwrap();
    assert_eq!(result.ti_hits.len(), 2);
    assert!((result.ti_score - 25.05).abs() < 1e-9);
    assert_eq!(result.final_score, 25);
    let policy_override = result.policy_override.as_ref().unwrap();
    assert_eq!(policy_override.reason, OverrideReason::DualTier1);
    assert_eq!(result.risk_level, RiskLevel::Critical);
    assert_eq!(result.verdict, ScanVerdict::Block);
    assert_eq!(
        stage(&result, StageName::PolicyOverride).status,
        StageStatus::Triggered
    );
}

#[tokio::test]
async fn disabled_dual_tier1_rule_leaves_score_alone() {
    let engine = engine(ScriptedChecks::default()).with_threat_intel(Arc::new(listed_on_two_tier1_sources()));
    let mut draft = engine.store().get(DEFAULT_CONFIGURATION_ID).unwrap().draft();
    draft.policy.rules.enable_dual_tier1_block = false;
    engine.store().update(DEFAULT_CONFIGURATION_ID, draft).unwrap();

    let result = engine
        .scan(ScanTarget::url("https://login.bad.example/x"))
        .await
        .unwrap();
    assert!(result.policy_override.is_none());
    assert_eq!(result.risk_level, RiskLevel::Low);
    assert_eq!(result.verdict, ScanVerdict::Allow);
}

#[tokio::test]
async fn ti_points_are_reliability_scaled_and_capped() {
    let feed = ["phishtank", "urlhaus", "openphish", "google_safe_browsing", "abuseipdb"]
        .into_iter()
        .fold(IndicatorFeed::new(), |feed, source| {
            feed.with_indicator(source, Indicator::domain("bad.example"))
        });
    let engine = engine(ScriptedChecks::default()).with_threat_intel(Arc::new(feed));

    let result = engine.scan(ScanTarget::url("https://bad.example")).await.unwrap();
    let expected = 0.95 * 15.0 + 0.9 * 12.0 + 0.85 * 10.0 + 0.98 * 10.0 + 0.8 * 8.0;
    assert!((result.ti_score - expected).abs() < 1e-9);
    assert!(result.ti_score <= f64::from(MAX_TI_SCORE));
    assert!(result
        .ti_hits
        .iter()
        .all(|hit| hit.points <= f64::from(hit.weight)));
}

#[tokio::test]
async fn sinkhole_address_forces_block() {
    let sinkhole: IpAddr = "192.0.2.53".parse().unwrap();
    let engine = engine_with(
        EngineSettings {
            sinkholes: vec![sinkhole],
            ..settings()
        },
        false,
    );

    let result = engine
        .scan(ScanTarget::url("https://parked.example").with_resolved(sinkhole))
        .await
        .unwrap();
    let policy_override = result.policy_override.unwrap();
    assert_eq!(policy_override.reason, OverrideReason::Sinkhole);
    assert!(policy_override.detail.contains("192.0.2.53"));
    assert_eq!(result.verdict, ScanVerdict::Block);
}

#[tokio::test]
async fn sinkholed_indicator_forces_block() {
    let feed = IndicatorFeed::new().with_indicator(
        "abuseipdb",
        Indicator::address("198.51.100.9".parse().unwrap()).sinkholed(),
    );
    let engine = engine(ScriptedChecks::default()).with_threat_intel(Arc::new(feed));

    let result = engine.scan(ScanTarget::url("http://198.51.100.9/")).await.unwrap();
    assert_eq!(
        result.policy_override.map(|o| o.reason),
        Some(OverrideReason::Sinkhole)
    );
}

#[tokio::test]
async fn ti_failures_degrade_to_zero_contribution() {
    let intel = FlakyIntel {
        feed: listed_on_two_tier1_sources(),
        failing: "urlhaus",
        stalled: "phishtank",
    };
    let engine = engine(ScriptedChecks::default()).with_threat_intel(Arc::new(intel));

    let result = engine.scan(ScanTarget::url("https://bad.example")).await.unwrap();
    assert!(result.ti_hits.is_empty());
    assert_eq!(result.ti_score, 0.0);
    assert!(result.policy_override.is_none());
    assert!(!result.degraded);
    let failed: Vec<&str> = result
        .warnings
        .iter()
        .filter_map(|warning| match warning {
            DegradedScanWarning::TiSourceFailed { source_id, .. } => Some(source_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec!["phishtank", "urlhaus"]);
}

#[tokio::test]
async fn missing_credentials_leave_multiplier_neutral() {
    let engine = engine(ScriptedChecks::firing(&["insecure_scheme"]));

    let result = engine.scan(ScanTarget::url("http://x")).await.unwrap();
    assert!(result.ai_unavailable);
    assert_eq!(result.ai_multiplier, 1.0);
    assert_eq!(result.consensus.excluded_models.len(), 3);
    assert!(result.warnings.contains(&DegradedScanWarning::AiUnavailable));
    assert!(!result.degraded);
    assert_eq!(stage(&result, StageName::AiConsensus).status, StageStatus::Skipped);
}

#[tokio::test]
async fn malicious_consensus_scales_score() {
    let engine = engine_with(settings(), true)
        .with_check_evaluator(Arc::new(ScriptedChecks::firing(&["insecure_scheme"])))
        .with_judge(Arc::new(FixedJudge {
            verdict: Verdict::Malicious,
            confidence: 0.9,
            delay: None,
        }));

    let result = engine.scan(ScanTarget::url("http://x")).await.unwrap();
    assert_eq!(result.consensus.verdict, ConsensusVerdict::Malicious);
    assert!((result.ai_multiplier - 1.9).abs() < 1e-9);
    assert_eq!(result.final_score, 38);
    assert_eq!(result.risk_level, RiskLevel::Low);
    assert!(!result.ai_unavailable);
}

#[tokio::test]
async fn slow_models_time_out_individually() {
    let engine = engine_with(settings(), true).with_judge(Arc::new(FixedJudge {
        verdict: Verdict::Malicious,
        confidence: 0.9,
        delay: Some(Duration::from_secs(2)),
    }));

    let result = engine.scan(ScanTarget::url("https://x")).await.unwrap();
    assert!(result.ai_unavailable);
    assert!(result
        .consensus
        .excluded_models
        .iter()
        .all(|m| m.reason == crate::consensus::ExclusionReason::TimedOut));
}

#[tokio::test]
async fn low_confidence_answers_are_excluded() {
    let engine = engine_with(settings(), true).with_judge(Arc::new(FixedJudge {
        verdict: Verdict::Benign,
        confidence: 0.3,
        delay: None,
    }));

    let result = engine.scan(ScanTarget::url("https://x")).await.unwrap();
    assert!(result.ai_unavailable);
    assert_eq!(result.ai_multiplier, 1.0);
}

#[tokio::test]
async fn cancellation_discards_the_scan() {
    let engine = engine_with(settings(), true).with_judge(Arc::new(FixedJudge {
        verdict: Verdict::Malicious,
        confidence: 0.9,
        delay: Some(Duration::from_millis(150)),
    }));

    let err = engine
        .scan_with_cancel(ScanTarget::url("https://x"), sleep(Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { .. }));
    let stats = engine.stats();
    assert_eq!(stats.cancelled_scans, 1);
    assert_eq!(stats.total_scans, 0);
}

#[tokio::test]
async fn overall_timeout_cancels() {
    let engine = engine_with(
        EngineSettings {
            scan_timeout: Duration::from_millis(20),
            ..settings()
        },
        true,
    )
    .with_judge(Arc::new(FixedJudge {
        verdict: Verdict::Malicious,
        confidence: 0.9,
        delay: Some(Duration::from_millis(150)),
    }));

    let err = engine.scan(ScanTarget::url("https://x")).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { .. }));
}

#[tokio::test]
async fn in_flight_scan_keeps_its_configuration_version() {
    let engine = engine_with(settings(), true)
        .with_check_evaluator(Arc::new(ScriptedChecks::firing(&["insecure_scheme"])))
        .with_judge(Arc::new(FixedJudge {
            verdict: Verdict::Benign,
            confidence: 0.9,
            delay: Some(Duration::from_millis(50)),
        }));

    let edit = async {
        sleep(Duration::from_millis(10)).await;
        engine
            .store()
            .set_category_weight(DEFAULT_CONFIGURATION_ID, "ssl_certificate", 10)
            .unwrap()
    };
    let (result, edited) = tokio::join!(engine.scan(ScanTarget::url("http://x")), edit);
    let result = result.unwrap();
    assert_eq!(edited.version, 2);
    assert_eq!(result.configuration_version, 1);
    assert_eq!(result.base_score, 20);

    let next = engine.scan(ScanTarget::url("http://x")).await.unwrap();
    assert_eq!(next.configuration_version, 2);
    assert_eq!(next.base_score, 10);
}

#[tokio::test]
async fn calibration_in_test_mode_is_not_counted() {
    let engine = engine(ScriptedChecks::firing(&["insecure_scheme"]));
    let request = CalibrationRequest {
        url: "http://x".into(),
        configuration_id: None,
        test_mode: true,
        resolved_addresses: vec![],
        form_actions: vec![],
        claimed_brand: None,
    };

    let calibration = engine.calibrate(request.clone()).await.unwrap();
    assert_eq!(calibration.visual_flow.len(), 6);
    assert_eq!(calibration.visual_flow[0].step, 1);
    assert_eq!(calibration.visual_flow[5].stage, StageName::Classify);
    assert_eq!(calibration.result.final_score, 20);
    assert_eq!(engine.stats().total_scans, 0);
    assert_eq!(engine.store().get_active().usage_count, 0);

    engine
        .calibrate(CalibrationRequest {
            test_mode: false,
            ..request
        })
        .await
        .unwrap();
    assert_eq!(engine.stats().total_scans, 1);
    assert_eq!(engine.store().get_active().usage_count, 1);
}

#[tokio::test]
async fn calibration_can_target_an_inactive_configuration() {
    let engine = engine(ScriptedChecks::firing(&["insecure_scheme"]));
    let mut draft = engine.store().get(DEFAULT_CONFIGURATION_ID).unwrap().draft();
    draft.name = "Tighter transport".into();
    draft.policy.category_weights.insert("ssl_certificate".into(), 5);
    let candidate = engine.store().create(draft).unwrap();

    let calibration = engine
        .calibrate(CalibrationRequest {
            url: "http://x".into(),
            configuration_id: Some(candidate.id.clone()),
            test_mode: true,
            resolved_addresses: vec![],
            form_actions: vec![],
            claimed_brand: None,
        })
        .await
        .unwrap();
    assert_eq!(calibration.result.configuration_id, candidate.id);
    assert_eq!(calibration.result.base_score, 5);

    let missing = engine
        .calibrate(CalibrationRequest {
            url: "http://x".into(),
            configuration_id: Some("nope".into()),
            test_mode: true,
            resolved_addresses: vec![],
            form_actions: vec![],
            claimed_brand: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(missing, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn completed_scans_feed_stats() {
    let engine = engine(ScriptedChecks::firing(&["insecure_scheme"]))
        .with_threat_intel(Arc::new(listed_on_two_tier1_sources()));

    engine.scan(ScanTarget::url("http://x")).await.unwrap();
    engine
        .scan(ScanTarget::url("http://bad.example"))
        .await
        .unwrap();

    let stats = engine.stats();
    assert_eq!(stats.total_scans, 2);
    assert_eq!(stats.scans_by_level[&RiskLevel::Low], 1);
    assert_eq!(stats.scans_by_level[&RiskLevel::Critical], 1);
    assert_eq!(stats.scans_by_level[&RiskLevel::Safe], 0);
    assert_eq!(stats.policy_overrides[&OverrideReason::DualTier1], 1);
    assert_eq!(stats.ai_unavailable_scans, 2);
    assert_eq!(stats.configuration_usage[DEFAULT_CONFIGURATION_ID], 2);
}

#[test]
fn confidence_handles_zero_budget() {
    assert_eq!(confidence(10, 0), 0.0);
    assert_eq!(confidence(50, 100), 50.0);
    assert_eq!(confidence(150, 100), 100.0);
}
