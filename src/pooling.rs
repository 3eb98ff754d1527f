//! Random-effects pooling of per-study estimates into baseline and effect
//! rows, per (outcome × modifier? × context) cell.
//!
//! Baselines pool on the logit scale, effects on ln(OR). Between-study
//! variance is DerSimonian–Laird, switching to Paule–Mandel from five studies;
//! small cells (3 ≤ k ≤ 10) get the Hartung–Knapp variance correction.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::PeriopError;
use crate::evidence::store::{EvidenceStore, PooledSnapshot};
use crate::evidence::{
    ContextLabel, Estimate, EvidenceGrade, Measure, Paper, PooledBaseline, PooledEffect,
    Population,
};

const Z_95: f64 = 1.959_963_984_540_054;
/// Minimum extraction confidence for a study to enter a pool.
const MIN_EXTRACTION_CONFIDENCE: f64 = 0.5;
/// CI inflation for single-study cells.
const SINGLETON_CI_FACTOR: f64 = 1.5;
/// Log-scale standard error assumed when a study reports no CI.
const DEFAULT_LOG_SE: f64 = 0.5;
/// Weight share a study needs to drive the pooled grade.
const GRADE_WEIGHT_SHARE: f64 = 0.25;

/// Two-sided 97.5% t-quantiles for the Hartung–Knapp window (df 2–9).
fn t_quantile(df: usize) -> f64 {
    match df {
        2 => 4.303,
        3 => 3.182,
        4 => 2.776,
        5 => 2.571,
        6 => 2.447,
        7 => 2.365,
        8 => 2.306,
        9 => 2.262,
        _ => Z_95,
    }
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

fn inv_logit(theta: f64) -> f64 {
    1.0 / (1.0 + (-theta).exp())
}

/// Wilson-adjusted proportion, used when the event count is small enough that
/// the normal approximation misbehaves.
fn wilson_adjusted(p: f64, n: f64) -> f64 {
    let x = p * n;
    (x + Z_95 * Z_95 / 2.0) / (n + Z_95 * Z_95)
}

/// One study's contribution on the pooling scale.
#[derive(Debug, Clone)]
struct StudyPoint {
    theta: f64,
    variance: f64,
    /// quality_weight × population_match, multiplied into the
    /// inverse-variance weight.
    multiplier: f64,
    pmid: String,
    grade: EvidenceGrade,
    approximate: bool,
}

fn population_match(study: Population, cell: Option<Population>) -> f64 {
    match cell {
        None => 1.0,
        Some(cell_pop) if cell_pop == study => 1.0,
        Some(_) if study == Population::Mixed => 0.6,
        Some(_) => 0.3,
    }
}

fn study_grade(paper: &Paper, cell: Option<Population>) -> EvidenceGrade {
    // Hard population mismatch decays the study one level.
    if population_match(paper.population, cell) < 0.6 {
        paper.evidence_grade.decayed()
    } else {
        paper.evidence_grade
    }
}

/// Pooled result on the pooling scale (logit or ln OR).
#[derive(Debug, Clone)]
struct PoolResult {
    mean: f64,
    ci_low: f64,
    ci_high: f64,
    k: usize,
    i_squared: f64,
    method: String,
    grade: EvidenceGrade,
    pmids: Vec<String>,
    singleton: bool,
    approximate: bool,
}

fn pooled_grade(points: &[StudyPoint], weights: &[f64]) -> EvidenceGrade {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return EvidenceGrade::D;
    }
    let dominant: Vec<EvidenceGrade> = points
        .iter()
        .zip(weights)
        .filter(|(_, w)| **w / total >= GRADE_WEIGHT_SHARE)
        .map(|(p, _)| p.grade)
        .collect();
    match dominant.iter().min() {
        Some(best) => *best,
        // No single study is load-bearing: grade by the weakest contributor.
        None => points
            .iter()
            .map(|p| p.grade)
            .max()
            .unwrap_or(EvidenceGrade::D),
    }
}

fn sorted_pmids(points: &[StudyPoint]) -> Vec<String> {
    let set: BTreeSet<String> = points.iter().map(|p| p.pmid.clone()).collect();
    set.into_iter().collect()
}

/// Paule–Mandel τ² by bisection on the generalized Q statistic.
fn paule_mandel_tau2(points: &[StudyPoint]) -> f64 {
    let k = points.len() as f64;
    let q_at = |tau2: f64| -> f64 {
        let weights: Vec<f64> = points
            .iter()
            .map(|p| p.multiplier / (p.variance + tau2))
            .collect();
        let sum_w: f64 = weights.iter().sum();
        let mean: f64 = points
            .iter()
            .zip(&weights)
            .map(|(p, w)| w * p.theta)
            .sum::<f64>()
            / sum_w;
        points
            .iter()
            .zip(&weights)
            .map(|(p, w)| w * (p.theta - mean).powi(2))
            .sum()
    };
    if q_at(0.0) <= k - 1.0 {
        return 0.0;
    }
    let (mut lo, mut hi) = (0.0_f64, 10.0_f64);
    for _ in 0..60 {
        let mid = (lo + hi) / 2.0;
        if q_at(mid) > k - 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

fn pool(points: &[StudyPoint]) -> Option<PoolResult> {
    if points.is_empty() {
        return None;
    }
    if points
        .iter()
        .any(|p| !p.theta.is_finite() || !p.variance.is_finite() || p.variance <= 0.0)
    {
        warn!("Non-finite study input; cell marked unavailable");
        return None;
    }

    let k = points.len();
    let approximate = points.iter().any(|p| p.approximate);

    if k == 1 {
        let p0 = &points[0];
        let half = Z_95 * p0.variance.sqrt() * SINGLETON_CI_FACTOR;
        return Some(PoolResult {
            mean: p0.theta,
            ci_low: p0.theta - half,
            ci_high: p0.theta + half,
            k,
            i_squared: 0.0,
            method: "singleton".into(),
            grade: p0.grade,
            pmids: sorted_pmids(points),
            singleton: true,
            approximate,
        });
    }

    // Fixed-effect stage.
    let fe_weights: Vec<f64> = points.iter().map(|p| p.multiplier / p.variance).collect();
    let sum_w: f64 = fe_weights.iter().sum();
    let fe_mean: f64 = points
        .iter()
        .zip(&fe_weights)
        .map(|(p, w)| w * p.theta)
        .sum::<f64>()
        / sum_w;
    let q: f64 = points
        .iter()
        .zip(&fe_weights)
        .map(|(p, w)| w * (p.theta - fe_mean).powi(2))
        .sum();
    let df = (k - 1) as f64;
    let i_squared = if q > 0.0 { ((q - df) / q).max(0.0) } else { 0.0 };

    // Between-study variance.
    let sum_w2: f64 = fe_weights.iter().map(|w| w * w).sum();
    let dl_denominator = sum_w - sum_w2 / sum_w;
    let tau2_dl = if dl_denominator > 0.0 {
        ((q - df) / dl_denominator).max(0.0)
    } else {
        0.0
    };
    let (tau2, mut method) = if k >= 5 {
        (paule_mandel_tau2(points), "PM".to_string())
    } else {
        (tau2_dl, "DL".to_string())
    };

    // Random-effects stage.
    let re_weights: Vec<f64> = points
        .iter()
        .map(|p| p.multiplier / (p.variance + tau2))
        .collect();
    let sum_re: f64 = re_weights.iter().sum();
    let mean: f64 = points
        .iter()
        .zip(&re_weights)
        .map(|(p, w)| w * p.theta)
        .sum::<f64>()
        / sum_re;

    let (se, crit) = if (3..=10).contains(&k) {
        let hk_var: f64 = points
            .iter()
            .zip(&re_weights)
            .map(|(p, w)| w * (p.theta - mean).powi(2))
            .sum::<f64>()
            / (df * sum_re);
        method.push_str("+HK");
        (hk_var.sqrt(), t_quantile(k - 1))
    } else {
        ((1.0 / sum_re).sqrt(), Z_95)
    };

    if !mean.is_finite() || !se.is_finite() {
        warn!(k, "Pooled arithmetic went non-finite; cell marked unavailable");
        return None;
    }

    let grade = pooled_grade(points, &re_weights);
    Some(PoolResult {
        mean,
        ci_low: mean - crit * se,
        ci_high: mean + crit * se,
        k,
        i_squared,
        method,
        grade,
        pmids: sorted_pmids(points),
        singleton: false,
        approximate,
    })
}

fn baseline_point(est: &Estimate, paper: &Paper, cell_pop: Option<Population>) -> StudyPoint {
    let n = est.n.unwrap_or(paper.n_total).max(1) as f64;
    let events = est.estimate * n;
    let p = if events <= 5.0 || n - events <= 5.0 {
        wilson_adjusted(est.estimate, n)
    } else {
        est.estimate
    };
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    StudyPoint {
        theta: logit(p),
        variance: 1.0 / (n * p * (1.0 - p)),
        multiplier: est.quality_weight * population_match(est.population, cell_pop),
        pmid: est.pmid.clone(),
        grade: study_grade(paper, cell_pop),
        approximate: false,
    }
}

/// Convert an RR/HR to an OR given a baseline incidence.
fn rr_to_or(rr: f64, p0: f64) -> f64 {
    rr * (1.0 - p0) / (1.0 - rr * p0)
}

fn effect_point(
    est: &Estimate,
    paper: &Paper,
    cell_pop: Option<Population>,
    baseline_p: Option<f64>,
) -> Option<StudyPoint> {
    let mut multiplier = est.quality_weight * population_match(est.population, cell_pop);
    let mut approximate = false;

    let (value, ci) = match est.measure {
        Measure::Incidence => return None,
        Measure::Or => (est.estimate, est.ci_low.zip(est.ci_high)),
        Measure::Rr | Measure::Hr => match baseline_p {
            Some(p0) if est.estimate * p0 < 1.0 => {
                let converted = rr_to_or(est.estimate, p0);
                let ci = est
                    .ci_low
                    .zip(est.ci_high)
                    .filter(|(lo, hi)| lo * p0 < 1.0 && hi * p0 < 1.0)
                    .map(|(lo, hi)| (rr_to_or(lo, p0), rr_to_or(hi, p0)));
                (converted, ci)
            }
            _ => {
                // No usable baseline: take the ratio as an OR approximation at
                // half weight.
                multiplier *= 0.5;
                approximate = true;
                (est.estimate, est.ci_low.zip(est.ci_high))
            }
        },
    };

    if value <= 0.0 {
        return None;
    }
    let variance = match ci {
        Some((lo, hi)) if lo > 0.0 && hi > lo => ((hi.ln() - lo.ln()) / (2.0 * Z_95)).powi(2),
        _ => {
            approximate = true;
            DEFAULT_LOG_SE * DEFAULT_LOG_SE
        }
    };

    Some(StudyPoint {
        theta: value.ln(),
        variance,
        multiplier,
        pmid: est.pmid.clone(),
        grade: study_grade(paper, cell_pop),
        approximate,
    })
}

/// Every context cell an outcome's estimates can answer for: each observed
/// context plus all of its wildcard parents.
fn cells_for<'a>(estimates: impl Iterator<Item = &'a Estimate>) -> Vec<ContextLabel> {
    let mut seen: Vec<ContextLabel> = Vec::new();
    for est in estimates {
        let Ok(ctx) = est.context() else { continue };
        for parent in ctx.fallback_chain() {
            if !seen.contains(&parent) {
                seen.push(parent);
            }
        }
    }
    // Deterministic order: most specific first, then by rendered label.
    seen.sort_by(|a, b| {
        b.specificity()
            .cmp(&a.specificity())
            .then_with(|| a.to_string().cmp(&b.to_string()))
    });
    seen
}

/// Pool the whole store into a fresh immutable snapshot for `version`.
pub fn build_snapshot(store: &EvidenceStore, version: &str) -> Result<PooledSnapshot, PeriopError> {
    let mut snapshot = PooledSnapshot::new(version);

    let mut outcomes: Vec<String> = store
        .estimates()
        .iter()
        .map(|e| e.outcome_token.clone())
        .collect();
    outcomes.sort();
    outcomes.dedup();

    for outcome in &outcomes {
        let outcome_estimates: Vec<&Estimate> = store
            .estimates()
            .iter()
            .filter(|e| {
                &e.outcome_token == outcome
                    && e.extraction_confidence >= MIN_EXTRACTION_CONFIDENCE
            })
            .collect();
        let cells = cells_for(outcome_estimates.iter().copied());

        // Baselines first: effect pooling needs them for RR/HR conversion.
        for cell in &cells {
            let points: Vec<StudyPoint> = outcome_estimates
                .iter()
                .filter(|e| e.is_baseline())
                .filter(|e| e.context().is_ok_and(|ctx| cell.subsumes(&ctx)))
                .filter_map(|e| store.paper(&e.pmid).map(|paper| (e, paper)))
                .map(|(e, paper)| baseline_point(e, paper, cell.population))
                .collect();
            let Some(result) = pool(&points) else {
                continue;
            };
            debug!(outcome, context = %cell, k = result.k, method = %result.method, "Pooled baseline");
            snapshot.insert_baseline(PooledBaseline {
                outcome_token: outcome.clone(),
                context_label: cell.to_string(),
                evidence_version: version.to_string(),
                k: result.k,
                p0: inv_logit(result.mean),
                p0_ci_low: inv_logit(result.ci_low),
                p0_ci_high: inv_logit(result.ci_high),
                method: result.method,
                evidence_grade: result.grade,
                pmids: result.pmids,
                singleton: result.singleton,
            })?;
        }

        // Effects per modifier.
        let mut modifiers: Vec<String> = outcome_estimates
            .iter()
            .filter_map(|e| e.modifier_token.clone())
            .collect();
        modifiers.sort();
        modifiers.dedup();

        for modifier in &modifiers {
            for cell in &cells {
                let baseline_p = snapshot.baseline(outcome, cell).map(|(row, _)| row.p0);
                let points: Vec<StudyPoint> = outcome_estimates
                    .iter()
                    .filter(|e| e.modifier_token.as_deref() == Some(modifier.as_str()))
                    .filter(|e| e.context().is_ok_and(|ctx| cell.subsumes(&ctx)))
                    .filter_map(|e| store.paper(&e.pmid).map(|paper| (e, paper)))
                    .filter_map(|(e, paper)| effect_point(e, paper, cell.population, baseline_p))
                    .collect();
                let Some(result) = pool(&points) else {
                    continue;
                };
                snapshot.insert_effect(PooledEffect {
                    outcome_token: outcome.clone(),
                    modifier_token: modifier.clone(),
                    context_label: cell.to_string(),
                    evidence_version: version.to_string(),
                    k: result.k,
                    or_mean: result.mean.exp(),
                    or_ci_low: result.ci_low.exp(),
                    or_ci_high: result.ci_high.exp(),
                    i_squared: result.i_squared,
                    method: result.method,
                    evidence_grade: result.grade,
                    pmids: result.pmids,
                    singleton: result.singleton,
                    approximate: result.approximate,
                })?;
            }
        }
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::seed;
    use crate::evidence::store::EvidenceStore;

    fn seeded_store() -> EvidenceStore {
        let mut store = EvidenceStore::new();
        store.ingest(seed::ingest_file()).expect("seed ingests");
        store
    }

    fn point(theta: f64, variance: f64) -> StudyPoint {
        StudyPoint {
            theta,
            variance,
            multiplier: 1.0,
            pmid: "11111111".into(),
            grade: EvidenceGrade::B,
            approximate: false,
        }
    }

    #[test]
    fn identical_studies_pool_to_their_common_value() {
        let points = vec![point(0.7, 0.04), point(0.7, 0.04), point(0.7, 0.04)];
        let result = pool(&points).expect("pool succeeds");
        assert!((result.mean - 0.7).abs() < 1e-12);
        assert_eq!(result.i_squared, 0.0);
        assert!(result.method.starts_with("DL"));
    }

    #[test]
    fn heterogeneous_studies_report_positive_i_squared() {
        let points = vec![point(0.1, 0.01), point(1.4, 0.01), point(0.2, 0.01)];
        let result = pool(&points).expect("pool succeeds");
        assert!(result.i_squared > 0.5);
        assert!(result.ci_high - result.ci_low > 0.0);
    }

    #[test]
    fn five_or_more_studies_use_paule_mandel() {
        let points: Vec<StudyPoint> = (0..5)
            .map(|i| point(0.3 + 0.1 * f64::from(i), 0.02))
            .collect();
        let result = pool(&points).expect("pool succeeds");
        assert!(result.method.starts_with("PM"), "method: {}", result.method);
        assert!(result.method.ends_with("+HK"));
    }

    #[test]
    fn two_studies_skip_hartung_knapp() {
        let points = vec![point(0.3, 0.02), point(0.5, 0.02)];
        let result = pool(&points).expect("pool succeeds");
        assert_eq!(result.method, "DL");
    }

    #[test]
    fn singleton_cell_inflates_ci_and_flags() {
        let points = vec![point(0.7, 0.04)];
        let result = pool(&points).expect("pool succeeds");
        assert!(result.singleton);
        assert_eq!(result.method, "singleton");
        let half = (result.ci_high - result.ci_low) / 2.0;
        let plain_half = Z_95 * 0.2;
        assert!((half - plain_half * 1.5).abs() < 1e-9);
    }

    #[test]
    fn non_finite_variance_marks_cell_unavailable() {
        let points = vec![point(0.7, f64::NAN), point(0.6, 0.04)];
        assert!(pool(&points).is_none());
    }

    #[test]
    fn quality_multiplier_shifts_the_mean_toward_better_studies() {
        let mut strong = point(0.2, 0.04);
        strong.multiplier = 1.0;
        let mut weak = point(1.0, 0.04);
        weak.multiplier = 0.3;
        let result = pool(&[strong, weak]).expect("pool succeeds");
        assert!(result.mean < 0.6, "mean {} should lean low", result.mean);
    }

    #[test]
    fn pooled_grade_prefers_dominant_study() {
        let mut a = point(0.2, 0.01);
        a.grade = EvidenceGrade::A;
        let mut d = point(0.3, 1.0);
        d.grade = EvidenceGrade::D;
        let weights = [100.0, 1.0];
        assert_eq!(pooled_grade(&[a, d], &weights), EvidenceGrade::A);
    }

    #[test]
    fn pooled_grade_falls_to_worst_without_a_dominant_study() {
        let grades = [
            EvidenceGrade::A,
            EvidenceGrade::B,
            EvidenceGrade::C,
            EvidenceGrade::D,
            EvidenceGrade::B,
        ];
        let points: Vec<StudyPoint> = grades
            .iter()
            .map(|g| {
                let mut p = point(0.3, 0.04);
                p.grade = *g;
                p
            })
            .collect();
        let weights = vec![1.0; 5];
        assert_eq!(pooled_grade(&points, &weights), EvidenceGrade::D);
    }

    #[test]
    fn rr_converts_toward_or_with_baseline() {
        // With a rare outcome RR and OR nearly coincide.
        assert!((rr_to_or(2.0, 0.01) - 2.02).abs() < 0.01);
        // With a common outcome the OR is materially larger.
        assert!(rr_to_or(2.0, 0.3) > 3.4);
    }

    #[test]
    fn population_mismatch_decays_grade_and_weight() {
        assert_eq!(population_match(Population::Mixed, Some(Population::Adult)), 0.6);
        assert_eq!(
            population_match(Population::Pediatric, Some(Population::Adult)),
            0.3
        );
        assert_eq!(population_match(Population::Adult, None), 1.0);
    }

    #[test]
    fn snapshot_covers_observed_cells_and_parents() {
        let store = seeded_store();
        let snapshot = build_snapshot(&store, "v2025.06").expect("snapshot builds");
        let ctx: ContextLabel = "PEDIATRIC\u{d7}ENT\u{d7}ELECTIVE"
            .parse()
            .expect("context parses");
        let (row, found_at) = snapshot
            .baseline("LARYNGOSPASM", &ctx)
            .expect("laryngospasm baseline");
        assert_eq!(found_at, ctx, "exact cell must exist, not a fallback");
        assert!(row.p0 > 0.01 && row.p0 < 0.03, "pooled p0 {}", row.p0);
        assert!(row.k >= 2);

        // Parent wildcard cells exist too.
        let wildcard = ContextLabel::wildcard();
        assert!(snapshot.baseline("LARYNGOSPASM", &wildcard).is_some());
    }

    #[test]
    fn effects_pool_with_bounded_confidence_intervals() {
        let store = seeded_store();
        let snapshot = build_snapshot(&store, "v2025.06").expect("snapshot builds");
        let ctx: ContextLabel = "PEDIATRIC\u{d7}*\u{d7}*".parse().expect("context parses");
        let row = snapshot
            .effect("LARYNGOSPASM", "RECENT_URI_2W", &ctx)
            .expect("pooled URI effect");
        assert_eq!(row.k, 2);
        assert!(row.or_mean > 1.5 && row.or_mean < 3.0, "OR {}", row.or_mean);
        assert!(row.or_ci_low < row.or_mean && row.or_mean < row.or_ci_high);
    }

    #[test]
    fn missing_context_falls_back_to_wildcard_pool() {
        let store = seeded_store();
        let snapshot = build_snapshot(&store, "v2025.06").expect("snapshot builds");
        let obstetric: ContextLabel = "OBSTETRIC\u{d7}*\u{d7}*".parse().expect("context parses");
        let (_, found_at) = snapshot
            .baseline("PONV", &obstetric)
            .expect("wildcard fallback");
        assert_eq!(found_at, ContextLabel::wildcard());
    }

    #[test]
    fn repooling_the_same_store_is_identical() {
        let store = seeded_store();
        let a = build_snapshot(&store, "v2025.06").expect("first run");
        let b = build_snapshot(&store, "v2025.06").expect("second run");
        let a_json = serde_json::to_string(&a).expect("serialize a");
        let b_json = serde_json::to_string(&b).expect("serialize b");
        assert_eq!(a_json, b_json);
    }

    #[test]
    fn aspiration_has_no_pooled_cells() {
        let store = seeded_store();
        let snapshot = build_snapshot(&store, "v2025.06").expect("snapshot builds");
        assert!(
            snapshot
                .baseline("ASPIRATION", &ContextLabel::wildcard())
                .is_none()
        );
    }
}
