use std::fmt::Write;

use serde::Serialize;

use crate::{
    consensus::ConsensusOutcome,
    error::DegradedScanWarning,
    pipeline::{Calibration, Finding, FlowStep, PolicyOverride, ScanResult, TiHit},
};

/// Format styles supported in default reporter implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Produce a report string from a `ScanResult` using the desired format.
pub fn render_report(result: &ScanResult, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_human(result),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&JsonReport::from(result))?),
    }
}

/// Render a calibration trace: the step-by-step flow, then the result.
pub fn render_flow(calibration: &Calibration, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(calibration)?),
        OutputFormat::Human => {
            let mut out = String::new();
            writeln!(out, "Calibration flow:")?;
            for step in &calibration.visual_flow {
                write_step(&mut out, step)?;
            }
            writeln!(out)?;
            out.push_str(&render_human(&calibration.result)?);
            Ok(out)
        }
    }
}

fn write_step(out: &mut String, step: &FlowStep) -> anyhow::Result<()> {
    writeln!(
        out,
        "  {n}. {label:<20} {status:<13} {detail} ({ms} ms)",
        n = step.step,
        label = step.label,
        status = format!("{:?}", step.status),
        detail = step.detail,
        ms = step.duration_ms,
    )?;
    Ok(())
}

fn render_human(result: &ScanResult) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "Final Score: {} ({}) • Verdict: {}",
        result.final_score,
        result.risk_level,
        result.verdict.as_str()
    )?;
    writeln!(
        out,
        "Target: {} [{}]",
        sanitize(&result.target.value),
        result.target.kind.as_str()
    )?;
    writeln!(
        out,
        "Configuration: {} v{} • Consensus: {}",
        result.configuration_id, result.configuration_version, result.consensus_config_id
    )?;
    writeln!(out)?;

    if result.findings.is_empty() {
        writeln!(out, "No checks fired.")?;
    } else {
        writeln!(out, "Findings:")?;
        for finding in &result.findings {
            writeln!(
                out,
                "  - {id} [{awarded}/{points}] {category} ({severity:?})",
                id = finding.check_id,
                awarded = finding.awarded,
                points = finding.points,
                category = finding.category_id,
                severity = finding.severity,
            )?;
            if !finding.evidence.trim().is_empty() {
                writeln!(out, "    \"{}\"", sanitize(&finding.evidence))?;
            }
        }
    }

    if !result.ti_hits.is_empty() {
        writeln!(out)?;
        writeln!(out, "Threat Intelligence:")?;
        for hit in &result.ti_hits {
            writeln!(
                out,
                "  - {source:>20}: {points:.2} of {weight}{tier}{sinkhole} ({indicator})",
                source = hit.source_id,
                points = hit.points,
                weight = hit.weight,
                tier = if hit.tier1 { ", tier 1" } else { "" },
                sinkhole = if hit.sinkhole { ", sinkhole" } else { "" },
                indicator = hit.indicator,
            )?;
        }
    }

    writeln!(
        out,
        "\nBase: {} • TI: {:.2} • AI multiplier: {:.2}",
        result.base_score, result.ti_score, result.ai_multiplier
    )?;
    if result.ai_unavailable {
        writeln!(out, "AI consensus unavailable; multiplier left neutral.")?;
    } else {
        writeln!(
            out,
            "AI consensus: {} via {} ({} participant(s), {:.0}% average confidence)",
            result.consensus.verdict.as_str(),
            result.consensus.strategy,
            result.consensus.participants.len(),
            result.consensus.average_confidence
        )?;
    }

    if let Some(policy_override) = &result.policy_override {
        writeln!(
            out,
            "\nPolicy override: {} ({})",
            policy_override.reason.as_str(),
            policy_override.detail
        )?;
    }

    if !result.warnings.is_empty() {
        writeln!(out, "\nWarnings:")?;
        for warning in &result.warnings {
            writeln!(out, "  - {}", describe_warning(warning))?;
        }
    }

    Ok(out)
}

fn describe_warning(warning: &DegradedScanWarning) -> String {
    match warning {
        DegradedScanWarning::Stage2TimedOut { timeout_ms } => {
            format!("Stage 2 timed out after {timeout_ms} ms")
        }
        DegradedScanWarning::CheckFailed { check_id, message } => {
            format!("check {check_id} failed: {message}")
        }
        DegradedScanWarning::TiSourceFailed { source_id, message } => {
            format!("TI source {source_id} failed: {message}")
        }
        DegradedScanWarning::AiUnavailable => "no AI model produced a usable verdict".into(),
        DegradedScanWarning::AiLowConfidence => "AI consensus has low confidence".into(),
    }
}

fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    id: &'a str,
    final_score: u32,
    risk_level: crate::classifier::RiskLevel,
    verdict: crate::pipeline::ScanVerdict,
    base_score: u32,
    ti_score: f64,
    ai_multiplier: f64,
    findings: &'a [Finding],
    ti_hits: &'a [TiHit],
    consensus: &'a ConsensusOutcome,
    policy_override: Option<&'a PolicyOverride>,
    degraded: bool,
    warnings: &'a [DegradedScanWarning],
    total_duration_ms: u64,
}

impl<'a> From<&'a ScanResult> for JsonReport<'a> {
    fn from(result: &'a ScanResult) -> Self {
        Self {
            id: &result.id,
            final_score: result.final_score,
            risk_level: result.risk_level,
            verdict: result.verdict,
            base_score: result.base_score,
            ti_score: result.ti_score,
            ai_multiplier: result.ai_multiplier,
            findings: &result.findings,
            ti_hits: &result.ti_hits,
            consensus: &result.consensus,
            policy_override: result.policy_override.as_ref(),
            degraded: result.degraded,
            warnings: &result.warnings,
            total_duration_ms: result.performance.total_duration_ms,
        }
    }
}
