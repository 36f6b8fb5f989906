//! Combines per-model AI verdicts into a single score multiplier.

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{catalog::AiModel, error::ValidationError};

pub const MIN_MULTIPLIER: f64 = 0.5;
pub const MAX_MULTIPLIER: f64 = 2.0;

/// How model verdicts are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Majority,
    Weighted,
    Unanimous,
    RankBased,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Strategy::Majority => "majority",
            Strategy::Weighted => "weighted",
            Strategy::Unanimous => "unanimous",
            Strategy::RankBased => "rank_based",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusConfig {
    pub id: String,
    pub name: String,
    pub strategy: Strategy,
    /// Model ids in priority order; earlier entries win rank-based ties.
    #[serde(default)]
    pub model_rankings: Vec<String>,
    pub confidence_threshold: f64,
    #[serde(default)]
    pub is_active: bool,
}

/// Editable fields of a consensus config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusDraft {
    pub name: String,
    pub strategy: Strategy,
    #[serde(default)]
    pub model_rankings: Vec<String>,
    pub confidence_threshold: f64,
}

impl ConsensusDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Blank {
                field: "name".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ValidationError::OutOfRange {
                field: "confidenceThreshold".into(),
                value: self.confidence_threshold,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(())
    }

    pub fn into_config(self, id: String) -> ConsensusConfig {
        ConsensusConfig {
            id,
            name: self.name,
            strategy: self.strategy,
            model_rankings: self.model_rankings,
            confidence_threshold: self.confidence_threshold,
            is_active: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Malicious,
    Benign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusVerdict {
    Malicious,
    Benign,
    Inconclusive,
}

impl ConsensusVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsensusVerdict::Malicious => "malicious",
            ConsensusVerdict::Benign => "benign",
            ConsensusVerdict::Inconclusive => "inconclusive",
        }
    }
}

/// What one model returned, or why it did not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelOutcome {
    Responded { verdict: Verdict, confidence: f64 },
    Failed { message: String },
    TimedOut,
    MissingCredential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    pub model_id: String,
    pub outcome: ModelOutcome,
}

impl ModelResponse {
    pub fn responded(model_id: impl Into<String>, verdict: Verdict, confidence: f64) -> Self {
        Self {
            model_id: model_id.into(),
            outcome: ModelOutcome::Responded {
                verdict,
                confidence,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    BelowThreshold { confidence: f64 },
    Failed { message: String },
    TimedOut,
    MissingCredential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedModel {
    pub model_id: String,
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusOutcome {
    pub strategy: Strategy,
    pub verdict: ConsensusVerdict,
    pub multiplier: f64,
    /// Mean confidence of participating models, as a percentage.
    pub average_confidence: f64,
    pub participants: Vec<String>,
    pub excluded_models: Vec<ExcludedModel>,
    pub low_confidence: bool,
    pub ai_unavailable: bool,
}

impl ConsensusOutcome {
    /// Neutral outcome used when no model answered.
    pub fn unavailable(strategy: Strategy, excluded_models: Vec<ExcludedModel>) -> Self {
        Self {
            strategy,
            verdict: ConsensusVerdict::Inconclusive,
            multiplier: 1.0,
            average_confidence: 0.0,
            participants: Vec::new(),
            excluded_models,
            low_confidence: true,
            ai_unavailable: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Vote<'a> {
    model_id: &'a str,
    verdict: Verdict,
    confidence: f64,
}

struct Decision {
    verdict: ConsensusVerdict,
    strength: f64,
    low_confidence: bool,
}

impl Decision {
    fn decided(verdict: Verdict, strength: f64) -> Self {
        let verdict = match verdict {
            Verdict::Malicious => ConsensusVerdict::Malicious,
            Verdict::Benign => ConsensusVerdict::Benign,
        };
        Self {
            verdict,
            strength,
            low_confidence: false,
        }
    }

    fn inconclusive() -> Self {
        Self {
            verdict: ConsensusVerdict::Inconclusive,
            strength: 0.0,
            low_confidence: true,
        }
    }

    fn multiplier(&self) -> f64 {
        let strength = self.strength.clamp(0.0, 1.0);
        let raw = match self.verdict {
            ConsensusVerdict::Malicious => 1.0 + strength,
            ConsensusVerdict::Benign => 1.0 - strength / 2.0,
            ConsensusVerdict::Inconclusive => 1.0,
        };
        raw.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
    }
}

/// Combine model responses under `config`.
///
/// `responses` should hold one entry per enabled model, including the ones that
/// failed, so `unanimous` can tell silence from agreement. `models` supplies
/// weights and ranks.
pub fn aggregate(
    responses: &[ModelResponse],
    config: &ConsensusConfig,
    models: &BTreeMap<String, AiModel>,
) -> ConsensusOutcome {
    let mut votes = Vec::new();
    let mut excluded = Vec::new();
    for response in responses {
        let reason = match &response.outcome {
            ModelOutcome::Responded {
                verdict,
                confidence,
            } => {
                if confidence.is_finite() && *confidence >= config.confidence_threshold {
                    votes.push(Vote {
                        model_id: &response.model_id,
                        verdict: *verdict,
                        confidence: confidence.clamp(0.0, 1.0),
                    });
                    continue;
                }
                ExclusionReason::BelowThreshold {
                    confidence: *confidence,
                }
            }
            ModelOutcome::Failed { message } => ExclusionReason::Failed {
                message: message.clone(),
            },
            ModelOutcome::TimedOut => ExclusionReason::TimedOut,
            ModelOutcome::MissingCredential => ExclusionReason::MissingCredential,
        };
        excluded.push(ExcludedModel {
            model_id: response.model_id.clone(),
            reason,
        });
    }

    if votes.is_empty() {
        debug!(excluded = excluded.len(), "no model passed the consensus gate");
        return ConsensusOutcome::unavailable(config.strategy, excluded);
    }

    let decision = match config.strategy {
        Strategy::Majority => majority(&votes, config, models),
        Strategy::Weighted => weighted(&votes, models),
        Strategy::Unanimous => unanimous(&votes, !excluded.is_empty()),
        Strategy::RankBased => rank_based(&votes, config, models),
    };

    let average_confidence =
        votes.iter().map(|v| v.confidence).sum::<f64>() / votes.len() as f64 * 100.0;
    let outcome = ConsensusOutcome {
        strategy: config.strategy,
        verdict: decision.verdict,
        multiplier: decision.multiplier(),
        average_confidence,
        participants: votes.iter().map(|v| v.model_id.to_string()).collect(),
        excluded_models: excluded,
        low_confidence: decision.low_confidence,
        ai_unavailable: false,
    };
    debug!(
        strategy = %config.strategy,
        verdict = ?outcome.verdict,
        multiplier = outcome.multiplier,
        "consensus reached"
    );
    outcome
}

fn mean_confidence<'a, 'b: 'a>(votes: impl Iterator<Item = &'a Vote<'b>>) -> f64 {
    let (sum, count) = votes.fold((0.0, 0usize), |(sum, count), v| (sum + v.confidence, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn majority(votes: &[Vote<'_>], config: &ConsensusConfig, models: &BTreeMap<String, AiModel>) -> Decision {
    let malicious = votes.iter().filter(|v| v.verdict == Verdict::Malicious).count();
    let benign = votes.len() - malicious;
    let winner = match malicious.cmp(&benign) {
        Ordering::Greater => Verdict::Malicious,
        Ordering::Less => Verdict::Benign,
        Ordering::Equal => return rank_based(votes, config, models),
    };
    Decision::decided(
        winner,
        mean_confidence(votes.iter().filter(|v| v.verdict == winner)),
    )
}

fn weighted(votes: &[Vote<'_>], models: &BTreeMap<String, AiModel>) -> Decision {
    let raw: Vec<f64> = votes
        .iter()
        .map(|v| {
            models
                .get(v.model_id)
                .map(|m| m.weight)
                .filter(|w| w.is_finite() && *w > 0.0)
                .unwrap_or(0.0)
        })
        .collect();
    let total: f64 = raw.iter().sum();
    // Renormalise over the models that actually voted.
    let shares: Vec<f64> = if total > 0.0 {
        raw.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / votes.len() as f64; votes.len()]
    };

    let signal: f64 = votes
        .iter()
        .zip(&shares)
        .map(|(vote, share)| {
            let sign = match vote.verdict {
                Verdict::Malicious => 1.0,
                Verdict::Benign => -1.0,
            };
            share * vote.confidence * sign
        })
        .sum();

    if signal > f64::EPSILON {
        Decision::decided(Verdict::Malicious, signal)
    } else if signal < -f64::EPSILON {
        Decision::decided(Verdict::Benign, -signal)
    } else {
        Decision::inconclusive()
    }
}

fn unanimous(votes: &[Vote<'_>], anyone_excluded: bool) -> Decision {
    if anyone_excluded {
        return Decision::inconclusive();
    }
    let first = votes[0].verdict;
    if votes.iter().all(|v| v.verdict == first) {
        Decision::decided(first, mean_confidence(votes.iter()))
    } else {
        Decision::inconclusive()
    }
}

fn rank_based(votes: &[Vote<'_>], config: &ConsensusConfig, models: &BTreeMap<String, AiModel>) -> Decision {
    let priority = |vote: &Vote<'_>| {
        let position = config
            .model_rankings
            .iter()
            .position(|id| id == vote.model_id)
            .unwrap_or(usize::MAX);
        let rank = models.get(vote.model_id).map(|m| m.rank).unwrap_or(u32::MAX);
        (position, rank, vote.model_id.to_string())
    };
    match votes.iter().min_by_key(|vote| priority(*vote)) {
        Some(best) => Decision::decided(best.verdict, best.confidence),
        None => Decision::inconclusive(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::defaults::default_models;

    fn models() -> BTreeMap<String, AiModel> {
        default_models().into_iter().map(|m| (m.id.clone(), m)).collect()
    }

    fn config(strategy: Strategy) -> ConsensusConfig {
        ConsensusConfig {
            id: "test".into(),
            name: "test".into(),
            strategy,
            model_rankings: vec![
                "openai-primary".into(),
                "anthropic-secondary".into(),
                "gemini-tertiary".into(),
            ],
            confidence_threshold: 0.5,
            is_active: true,
        }
    }

    fn three_votes() -> Vec<ModelResponse> {
        vec![
            ModelResponse::responded("openai-primary", Verdict::Malicious, 0.9),
            ModelResponse::responded("anthropic-secondary", Verdict::Malicious, 0.8),
            ModelResponse::responded("gemini-tertiary", Verdict::Benign, 0.95),
        ]
    }

    #[test]
    fn majority_picks_the_larger_side() {
        let outcome = aggregate(&three_votes(), &config(Strategy::Majority), &models());
        assert_eq!(outcome.verdict, ConsensusVerdict::Malicious);
        assert!((outcome.multiplier - 1.85).abs() < 1e-9);
        assert!((outcome.average_confidence - 88.333_333).abs() < 1e-3);
        assert!(!outcome.ai_unavailable);
    }

    #[test]
    fn majority_tie_defers_to_rank() {
        let responses = vec![
            ModelResponse::responded("gemini-tertiary", Verdict::Malicious, 0.9),
            ModelResponse::responded("anthropic-secondary", Verdict::Benign, 0.6),
        ];
        let outcome = aggregate(&responses, &config(Strategy::Majority), &models());
        assert_eq!(outcome.verdict, ConsensusVerdict::Benign);
        assert!((outcome.multiplier - 0.7).abs() < 1e-9);
    }

    #[test]
    fn weighted_renormalises_over_voters() {
        // openai 0.4 and gemini 0.25 vote; shares become 0.4/0.65 and 0.25/0.65.
        let responses = vec![
            ModelResponse::responded("openai-primary", Verdict::Malicious, 1.0),
            ModelResponse {
                model_id: "anthropic-secondary".into(),
                outcome: ModelOutcome::TimedOut,
            },
            ModelResponse::responded("gemini-tertiary", Verdict::Benign, 1.0),
        ];
        let outcome = aggregate(&responses, &config(Strategy::Weighted), &models());
        let expected = 0.4 / 0.65 - 0.25 / 0.65;
        assert_eq!(outcome.verdict, ConsensusVerdict::Malicious);
        assert!((outcome.multiplier - (1.0 + expected)).abs() < 1e-9);
        assert_eq!(outcome.excluded_models.len(), 1);
        assert_eq!(outcome.excluded_models[0].reason, ExclusionReason::TimedOut);
    }

    #[test]
    fn unanimous_never_malicious_with_dissent() {
        let outcome = aggregate(&three_votes(), &config(Strategy::Unanimous), &models());
        assert_ne!(outcome.verdict, ConsensusVerdict::Malicious);
        assert!(outcome.low_confidence);
        assert_eq!(outcome.multiplier, 1.0);
    }

    #[test]
    fn unanimous_never_malicious_with_silence() {
        let responses = vec![
            ModelResponse::responded("openai-primary", Verdict::Malicious, 0.9),
            ModelResponse::responded("anthropic-secondary", Verdict::Malicious, 0.9),
            ModelResponse {
                model_id: "gemini-tertiary".into(),
                outcome: ModelOutcome::Failed {
                    message: "503".into(),
                },
            },
        ];
        let outcome = aggregate(&responses, &config(Strategy::Unanimous), &models());
        assert_eq!(outcome.verdict, ConsensusVerdict::Inconclusive);
        assert!(outcome.low_confidence);
    }

    #[test]
    fn unanimous_agreement_is_malicious() {
        let responses = vec![
            ModelResponse::responded("openai-primary", Verdict::Malicious, 0.9),
            ModelResponse::responded("gemini-tertiary", Verdict::Malicious, 0.7),
        ];
        let outcome = aggregate(&responses, &config(Strategy::Unanimous), &models());
        assert_eq!(outcome.verdict, ConsensusVerdict::Malicious);
        assert!((outcome.multiplier - 1.8).abs() < 1e-9);
    }

    #[test]
    fn rank_based_uses_rankings_list_first() {
        let mut cfg = config(Strategy::RankBased);
        cfg.model_rankings = vec!["gemini-tertiary".into()];
        let outcome = aggregate(&three_votes(), &cfg, &models());
        assert_eq!(outcome.verdict, ConsensusVerdict::Benign);
    }

    #[test]
    fn low_confidence_models_are_excluded() {
        let mut cfg = config(Strategy::Majority);
        cfg.confidence_threshold = 0.85;
        let outcome = aggregate(&three_votes(), &cfg, &models());
        // Only openai (0.9) and gemini (0.95) remain: a tie resolved by rank.
        assert_eq!(outcome.verdict, ConsensusVerdict::Malicious);
        assert_eq!(outcome.excluded_models.len(), 1);
        assert_eq!(outcome.excluded_models[0].model_id, "anthropic-secondary");
    }

    #[test]
    fn no_responders_is_neutral() {
        let responses = vec![ModelResponse {
            model_id: "openai-primary".into(),
            outcome: ModelOutcome::MissingCredential,
        }];
        for strategy in [
            Strategy::Majority,
            Strategy::Weighted,
            Strategy::Unanimous,
            Strategy::RankBased,
        ] {
            let outcome = aggregate(&responses, &config(strategy), &models());
            assert_eq!(outcome.multiplier, 1.0);
            assert_eq!(outcome.average_confidence, 0.0);
            assert!(outcome.ai_unavailable);
        }
        assert!(aggregate(&[], &config(Strategy::Weighted), &models()).ai_unavailable);
    }

    #[test]
    fn multiplier_stays_in_bounds() {
        let responses = vec![ModelResponse::responded("openai-primary", Verdict::Benign, 1.0)];
        let outcome = aggregate(&responses, &config(Strategy::RankBased), &models());
        assert_eq!(outcome.multiplier, MIN_MULTIPLIER);
        let responses = vec![ModelResponse::responded("openai-primary", Verdict::Malicious, 1.0)];
        let outcome = aggregate(&responses, &config(Strategy::RankBased), &models());
        assert_eq!(outcome.multiplier, MAX_MULTIPLIER);
    }

    #[test]
    fn draft_validation_rejects_bad_threshold() {
        let draft = ConsensusDraft {
            name: "x".into(),
            strategy: Strategy::Weighted,
            model_rankings: vec![],
            confidence_threshold: 1.5,
        };
        assert!(draft.validate().is_err());
    }
}
