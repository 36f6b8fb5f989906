//! Score budget invariants. Pure functions with no side effects; the store
//! calls them on every save and activation.

use crate::{
    catalog::CatalogSnapshot,
    error::{BudgetError, ValidationError},
    MAX_CATEGORY_SCORE, MAX_CHECK_WEIGHT, MAX_TI_SCORE, MAX_TOTAL_SCORE,
};

use super::ScoringPolicy;

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Validate a whole candidate policy.
pub fn validate(policy: &ScoringPolicy) -> Result<(), ValidationError> {
    for (check_id, points) in &policy.check_weights {
        validate_check_update(check_id, *points)?;
    }

    let categories = policy.category_total();
    if categories > u64::from(MAX_CATEGORY_SCORE) {
        return Err(BudgetError::new("categoryWeights", clamp_u32(categories), MAX_CATEGORY_SCORE).into());
    }
    let ti = policy.ti_total();
    if ti > u64::from(MAX_TI_SCORE) {
        return Err(BudgetError::new("tiConfig.sourceWeights", clamp_u32(ti), MAX_TI_SCORE).into());
    }
    if categories + ti > u64::from(MAX_TOTAL_SCORE) {
        return Err(BudgetError::new("total", clamp_u32(categories + ti), MAX_TOTAL_SCORE).into());
    }

    for (field, value) in [
        ("stage1Threshold", policy.stage1_threshold),
        ("stage2Threshold", policy.stage2_threshold),
    ] {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(ValidationError::OutOfRange {
                field: field.into(),
                value,
                min: 0.0,
                max: 100.0,
            });
        }
    }
    if let Some(budget) = policy.algorithm_config.confidence_budget {
        if budget == 0 {
            return Err(ValidationError::OutOfRange {
                field: "algorithmConfig.confidenceBudget".into(),
                value: 0.0,
                min: 1.0,
                max: f64::from(MAX_TOTAL_SCORE),
            });
        }
    }

    policy.threshold_table()?;
    Ok(())
}

/// Validate replacing one category weight. `current` in the error is the total
/// of every other category.
pub fn validate_category_update(
    policy: &ScoringPolicy,
    category_id: &str,
    points: u32,
) -> Result<(), BudgetError> {
    let others: u64 = policy
        .category_weights
        .iter()
        .filter(|(id, _)| id.as_str() != category_id)
        .map(|(_, w)| u64::from(*w))
        .sum();
    if others + u64::from(points) > u64::from(MAX_CATEGORY_SCORE) {
        return Err(BudgetError::new(
            format!("categoryWeights.{category_id}"),
            clamp_u32(others),
            MAX_CATEGORY_SCORE,
        ));
    }
    let combined = others + policy.ti_total();
    if combined + u64::from(points) > u64::from(MAX_TOTAL_SCORE) {
        return Err(BudgetError::new("total", clamp_u32(combined), MAX_TOTAL_SCORE));
    }
    Ok(())
}

/// Validate replacing one TI source weight.
pub fn validate_ti_update(
    policy: &ScoringPolicy,
    source_id: &str,
    points: u32,
) -> Result<(), BudgetError> {
    let others: u64 = policy
        .ti_config
        .source_weights
        .iter()
        .filter(|(id, _)| id.as_str() != source_id)
        .map(|(_, w)| u64::from(*w))
        .sum();
    if others + u64::from(points) > u64::from(MAX_TI_SCORE) {
        return Err(BudgetError::new(
            format!("tiConfig.sourceWeights.{source_id}"),
            clamp_u32(others),
            MAX_TI_SCORE,
        ));
    }
    let combined = others + policy.category_total();
    if combined + u64::from(points) > u64::from(MAX_TOTAL_SCORE) {
        return Err(BudgetError::new("total", clamp_u32(combined), MAX_TOTAL_SCORE));
    }
    Ok(())
}

/// A single check is capped on its own; no other field shares its budget.
pub fn validate_check_update(check_id: &str, points: u32) -> Result<(), BudgetError> {
    if points > MAX_CHECK_WEIGHT {
        return Err(BudgetError::new(
            format!("checkWeights.{check_id}"),
            0,
            MAX_CHECK_WEIGHT,
        ));
    }
    Ok(())
}

/// Every weight key must name a catalog record.
pub fn validate_references(
    policy: &ScoringPolicy,
    catalog: &CatalogSnapshot,
) -> Result<(), ValidationError> {
    let unknown = |field: &str, kind: &str, id: &str| ValidationError::UnknownReference {
        field: field.into(),
        kind: kind.into(),
        id: id.into(),
    };
    if let Some(id) = policy
        .category_weights
        .keys()
        .find(|id| !catalog.categories.contains_key(*id))
    {
        return Err(unknown("categoryWeights", "category", id));
    }
    if let Some(id) = policy
        .check_weights
        .keys()
        .find(|id| !catalog.checks.contains_key(*id))
    {
        return Err(unknown("checkWeights", "check", id));
    }
    if let Some(id) = policy
        .ti_config
        .source_weights
        .keys()
        .find(|id| !catalog.ti_sources.contains_key(*id))
    {
        return Err(unknown("tiConfig.sourceWeights", "ti source", id));
    }
    Ok(())
}
