//! Per-outcome risk composition: pooled baseline odds adjusted by
//! confidence-weighted modifier odds ratios, with propagated uncertainty.

use serde::Serialize;
use tracing::warn;

use crate::evidence::store::PooledSnapshot;
use crate::evidence::{ContextLabel, EvidenceGrade};
use crate::extract::ExtractedFactor;

/// Adjusted probability ceiling (clinical plausibility).
pub const MAX_ADJUSTED_RISK: f64 = 0.95;
/// Risk-ratio ceiling relative to baseline.
pub const MAX_RISK_RATIO: f64 = 25.0;

const Z_95: f64 = 1.959_963_984_540_054;

#[derive(Debug, Clone, Serialize)]
pub struct ContributingFactor {
    pub factor: String,
    pub odds_ratio: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    /// Extraction confidence applied as the OR exponent.
    pub confidence: f64,
    pub evidence_grade: EvidenceGrade,
    pub pmids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub outcome: String,
    pub no_evidence: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_risk: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_risk: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_grade: Option<EvidenceGrade>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributing_factors: Vec<ContributingFactor>,
    /// Context the baseline was actually found at (after wildcard fallback).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_used: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub baseline_pmids: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub capped: bool,
}

impl RiskAssessment {
    pub fn no_evidence(outcome: &str) -> Self {
        Self {
            outcome: outcome.to_string(),
            no_evidence: true,
            baseline_risk: None,
            adjusted_risk: None,
            ci_low: None,
            ci_high: None,
            risk_ratio: None,
            evidence_grade: None,
            contributing_factors: Vec::new(),
            context_used: None,
            baseline_pmids: Vec::new(),
            capped: false,
        }
    }
}

/// Overall label across outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    High,
    Moderate,
    Low,
}

pub fn overall_level(assessments: &[RiskAssessment]) -> RiskLevel {
    let mut level = RiskLevel::Low;
    for a in assessments {
        let risk = a.adjusted_risk.unwrap_or(0.0);
        let ratio = a.risk_ratio.unwrap_or(0.0);
        if risk >= 0.10 || ratio >= 3.0 {
            return RiskLevel::High;
        }
        if risk >= 0.05 || ratio >= 1.5 {
            level = RiskLevel::Moderate;
        }
    }
    level
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

fn inv_logit(theta: f64) -> f64 {
    1.0 / (1.0 + (-theta).exp())
}

/// Variance on the log scale back-derived from a 95% interval.
fn log_ci_variance(lo: f64, hi: f64) -> f64 {
    if lo > 0.0 && hi > lo {
        ((hi.ln() - lo.ln()) / (2.0 * Z_95)).powi(2)
    } else {
        0.0
    }
}

/// Compute one outcome's adjusted risk for a resolved request context.
pub fn assess_outcome(
    snapshot: &PooledSnapshot,
    outcome: &str,
    context: &ContextLabel,
    factors: &[ExtractedFactor],
) -> RiskAssessment {
    let Some((baseline, found_at)) = snapshot.baseline(outcome, context) else {
        return RiskAssessment::no_evidence(outcome);
    };

    let p0 = baseline.p0.clamp(1e-6, 1.0 - 1e-6);
    let baseline_logit_var = log_ci_variance(
        baseline.p0_ci_low / (1.0 - baseline.p0_ci_low).max(1e-9),
        baseline.p0_ci_high / (1.0 - baseline.p0_ci_high).max(1e-9),
    );

    let mut log_odds = logit(p0);
    let mut variance = baseline_logit_var;
    let mut worst_grade = baseline.evidence_grade;
    let mut contributing = Vec::new();

    for factor in factors {
        let Some(effect) = snapshot.effect(outcome, &factor.token, context) else {
            continue;
        };
        let c = factor.confidence.clamp(0.0, 1.0);
        log_odds += c * effect.or_mean.ln();
        variance += c * c * log_ci_variance(effect.or_ci_low, effect.or_ci_high);
        worst_grade = worst_grade.max(effect.evidence_grade);
        contributing.push(ContributingFactor {
            factor: factor.token.clone(),
            odds_ratio: effect.or_mean,
            ci_low: effect.or_ci_low,
            ci_high: effect.or_ci_high,
            confidence: c,
            evidence_grade: effect.evidence_grade,
            pmids: effect.pmids.clone(),
        });
    }

    let mut adjusted = inv_logit(log_odds);
    let mut capped = false;
    let risk_cap = MAX_ADJUSTED_RISK.min(MAX_RISK_RATIO * p0);
    if adjusted > risk_cap {
        warn!(
            outcome,
            adjusted, cap = risk_cap, "Adjusted risk exceeded plausibility cap"
        );
        adjusted = risk_cap;
        capped = true;
    }

    // CI around the (uncapped) combined log-odds, then clamped to the cap.
    let half = Z_95 * variance.sqrt();
    let ci_low = inv_logit(log_odds - half).min(adjusted);
    let ci_high = inv_logit(log_odds + half).min(risk_cap.max(adjusted));

    RiskAssessment {
        outcome: outcome.to_string(),
        no_evidence: false,
        baseline_risk: Some(p0),
        adjusted_risk: Some(adjusted),
        ci_low: Some(ci_low),
        ci_high: Some(ci_high),
        risk_ratio: Some(adjusted / p0),
        evidence_grade: Some(worst_grade),
        contributing_factors: contributing,
        context_used: Some(found_at.to_string()),
        baseline_pmids: baseline.pmids.clone(),
        capped,
    }
}
