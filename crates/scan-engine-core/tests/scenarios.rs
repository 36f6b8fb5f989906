use std::{collections::BTreeMap, sync::Arc};

use insta::assert_json_snapshot;
use scan_engine_core::{
    aggregate,
    catalog::defaults::default_catalog,
    classify,
    config::{store::DEFAULT_CONFIGURATION_ID, validate, validate_ti_update, validate_category_update},
    consensus::{ModelResponse, Verdict},
    pipeline::{Indicator, OverrideReason},
    ConsensusConfig, EngineSettings, IndicatorFeed, RiskLevel, RiskThresholdTable, ScanEngine,
    ScanResult, ScanTarget, ScanVerdict, ScoringPolicy, Strategy, ValidationError,
};
use serde_json::json;

fn engine() -> ScanEngine {
    ScanEngine::with_defaults(EngineSettings::default())
        .unwrap_or_else(|err| panic!("engine failed to build: {err:#}"))
}

fn policy_with_categories(weights: &[(&str, u32)]) -> ScoringPolicy {
    let mut policy = ScoringPolicy::from_catalog(&default_catalog());
    policy.category_weights = weights
        .iter()
        .map(|(id, points)| (id.to_string(), *points))
        .collect();
    policy
}

fn project(result: &ScanResult) -> serde_json::Value {
    json!({
        "baseScore": result.base_score,
        "finalScore": result.final_score,
        "findings": result.findings.iter().map(|finding| json!({
            "awarded": finding.awarded,
            "checkId": finding.check_id,
            "evidence": finding.evidence,
        })).collect::<Vec<_>>(),
        "riskLevel": result.risk_level,
        "stages": result.stages.iter().map(|stage| format!(
            "{}:{}",
            serde_json::to_value(stage.stage).unwrap().as_str().unwrap(),
            serde_json::to_value(stage.status).unwrap().as_str().unwrap(),
        )).collect::<Vec<_>>(),
        "verdict": result.verdict,
    })
}

#[test]
fn category_budget_accepts_exact_fill_and_rejects_one_more_point() {
    let policy = policy_with_categories(&[("A", 300), ("B", 235)]);
    validate(&policy).expect("535 points fit the category budget");

    let err = validate_category_update(&policy, "C", 1).unwrap_err();
    assert_eq!(err.field, "categoryWeights.C");
    assert_eq!(err.current, 535);
    assert_eq!(err.limit, 535);
    assert_eq!(err.remaining, 0);
}

#[test]
fn ti_budget_rejects_fifty_six_points() {
    let mut policy = ScoringPolicy::from_catalog(&default_catalog());
    policy.ti_config.source_weights = BTreeMap::from([("s1".to_string(), 30)]);
    validate(&policy).expect("30 TI points fit");

    let err = validate_ti_update(&policy, "s2", 26).unwrap_err();
    assert_eq!(err.limit, 55);
    assert_eq!(err.current, 30);
    assert_eq!(err.remaining, 25);

    policy.ti_config.source_weights.insert("s2".into(), 26);
    match validate(&policy) {
        Err(ValidationError::Budget(err)) => {
            assert_eq!(err.field, "tiConfig.sourceWeights");
            assert_eq!(err.current, 56);
            assert_eq!(err.limit, 55);
        }
        other => panic!("expected a budget error, got {other:?}"),
    }
}

#[test]
fn seventy_two_points_classify_as_high() {
    let level = classify(72, &RiskThresholdTable::default()).unwrap();
    assert_eq!(level, RiskLevel::High);
}

#[test]
fn majority_of_two_malicious_votes_wins() {
    let config = ConsensusConfig {
        id: "majority".into(),
        name: "Majority".into(),
        strategy: Strategy::Majority,
        model_rankings: vec![],
        confidence_threshold: 0.5,
        is_active: false,
    };
    let responses = [
        ModelResponse::responded("m1", Verdict::Malicious, 0.9),
        ModelResponse::responded("m2", Verdict::Malicious, 0.8),
        ModelResponse::responded("m3", Verdict::Benign, 0.95),
    ];
    let outcome = aggregate(&responses, &config, &default_catalog().ai_models);
    assert_eq!(outcome.verdict.as_str(), "malicious");
    assert_eq!(outcome.participants.len(), 3);
    assert!((outcome.multiplier - 1.85).abs() < 1e-9);
}

#[tokio::test(flavor = "current_thread")]
async fn phishing_url_snapshot() {
    let result = engine()
        .scan(ScanTarget::url(
            "http://paypal.com.secure-login.verify-account.xyz/webscr?cmd=login",
        ))
        .await
        .unwrap_or_else(|err| panic!("scan failed: {err:#}"));

    assert!(result.ai_unavailable);
    assert!(result.policy_override.is_none());
    assert_json_snapshot!(project(&result), @r###"
    {
      "baseScore": 110,
      "finalScore": 110,
      "findings": [
        {
          "awarded": 30,
          "checkId": "brand_keyword_in_subdomain",
          "evidence": "`paypal` appears in paypal.com.secure-login.verify-account.xyz"
        },
        {
          "awarded": 30,
          "checkId": "credential_keywords",
          "evidence": "phrase `login`"
        },
        {
          "awarded": 10,
          "checkId": "excessive_subdomains",
          "evidence": "paypal.com.secure-login.verify-account.xyz has 5 labels"
        },
        {
          "awarded": 20,
          "checkId": "insecure_scheme",
          "evidence": "plain http"
        },
        {
          "awarded": 20,
          "checkId": "suspicious_tld",
          "evidence": "abused TLD .xyz"
        }
      ],
      "riskLevel": "critical",
      "stages": [
        "stage1:completed",
        "stage2:completed",
        "ti_lookup:completed",
        "ai_consensus:skipped",
        "policy_override:completed",
        "classify:completed"
      ],
      "verdict": "block"
    }
    "###);
}

#[tokio::test(flavor = "current_thread")]
async fn phishing_message_snapshot() {
    let result = engine()
        .scan(ScanTarget::message(
            "URGENT: Your account will be suspended within 24 hours. \
             Confirm your card number at http://bit.ly/acct-fix",
        ))
        .await
        .unwrap_or_else(|err| panic!("scan failed: {err:#}"));

    assert_json_snapshot!(project(&result), @r###"
    {
      "baseScore": 80,
      "finalScore": 80,
      "findings": [
        {
          "awarded": 20,
          "checkId": "insecure_scheme",
          "evidence": "plain http"
        },
        {
          "awarded": 30,
          "checkId": "sensitive_data_request",
          "evidence": "phrase `card number`"
        },
        {
          "awarded": 20,
          "checkId": "urgency_language",
          "evidence": "phrase `URGENT`"
        },
        {
          "awarded": 10,
          "checkId": "url_shortener",
          "evidence": "shortener bit.ly"
        }
      ],
      "riskLevel": "critical",
      "stages": [
        "stage1:completed",
        "stage2:completed",
        "ti_lookup:completed",
        "ai_consensus:skipped",
        "policy_override:completed",
        "classify:completed"
      ],
      "verdict": "block"
    }
    "###);
}

#[tokio::test(flavor = "current_thread")]
async fn clean_url_is_allowed() {
    let result = engine()
        .scan(ScanTarget::url("https://www.example.com/docs"))
        .await
        .unwrap_or_else(|err| panic!("scan failed: {err:#}"));

    assert!(result.findings.is_empty());
    assert_eq!(result.final_score, 0);
    assert_eq!(result.risk_level, RiskLevel::Safe);
    assert_eq!(result.verdict, ScanVerdict::Allow);
    assert!(!result.degraded);
}

#[tokio::test(flavor = "current_thread")]
async fn sinkholed_indicator_forces_block() {
    let feed = IndicatorFeed::new()
        .with_indicator("openphish", Indicator::domain("example-assets.net").sinkholed());
    let engine = engine().with_threat_intel(Arc::new(feed));
    let target = ScanTarget::url("https://cdn.example-assets.net/app.css");

    let result = engine.scan(target.clone()).await.unwrap();
    assert_eq!(result.base_score, 0);
    let policy_override = result.policy_override.as_ref().expect("sinkhole override");
    assert_eq!(policy_override.reason, OverrideReason::Sinkhole);
    assert_eq!(result.risk_level, RiskLevel::Critical);
    assert_eq!(result.verdict, ScanVerdict::Block);

    let store = engine.store();
    let mut draft = store.get(DEFAULT_CONFIGURATION_ID).unwrap().draft();
    draft.policy.rules.enable_sinkhole_block = false;
    store.update(DEFAULT_CONFIGURATION_ID, draft).unwrap();

    let relaxed = engine.scan(target).await.unwrap();
    assert!(relaxed.policy_override.is_none());
    assert_eq!(relaxed.risk_level, RiskLevel::Safe);
    assert_eq!(relaxed.verdict, ScanVerdict::Allow);
    assert_eq!(relaxed.ti_hits.len(), 1);
}
