//! Markdown rendering of analysis results and pooled evidence.

use crate::engine::{AnalysisResult, AnalysisStatus};
use crate::evidence::ContextLabel;
use crate::evidence::store::PooledSnapshot;
use crate::extract::AgeBand;
use crate::meds::MedicationRecommendation;

fn fmt_pct(p: f64) -> String {
    format!("{:.1}%", p * 100.0)
}

fn fmt_band(band: AgeBand) -> &'static str {
    match band {
        AgeBand::AgeLt1 => "<1y",
        AgeBand::Age1_5 => "1-5y",
        AgeBand::Age6_12 => "6-12y",
        AgeBand::Age13_17 => "13-17y",
        AgeBand::Age18_64 => "18-64y",
        AgeBand::AgeGe65 => ">=65y",
        AgeBand::Unknown => "unknown",
    }
}

fn push_med_section(out: &mut String, title: &str, recs: &[MedicationRecommendation]) {
    if recs.is_empty() {
        return;
    }
    out.push_str(&format!("\n### {title}\n\n"));
    for rec in recs {
        out.push_str(&format!("- **{}** ({})", rec.generic_name, rec.evidence_grade.as_str()));
        if let Some(dose) = &rec.dose_rule {
            out.push_str(&format!(" — {dose}"));
        }
        if !rec.patient_factors.is_empty() {
            out.push_str(&format!(" [{}]", rec.patient_factors.join(", ")));
        }
        if !rec.citations.is_empty() {
            out.push_str(&format!(" ({})", rec.citations.join(", ")));
        }
        if rec.unsupported {
            out.push_str(" *(unsupported)*");
        }
        out.push('\n');
    }
}

pub fn analysis_markdown(result: &AnalysisResult) -> String {
    let mut out = String::new();
    out.push_str("# Perioperative Risk Assessment\n\n");
    out.push_str(&format!(
        "Session `{}` | evidence {} | context {} | status {}\n\n",
        result.session_id,
        result.evidence_version,
        result.context,
        match result.status {
            AnalysisStatus::Ok => "OK",
            AnalysisStatus::PartialSuccess => "PARTIAL_SUCCESS",
        }
    ));

    out.push_str("## Demographics\n\n");
    let d = &result.demographics;
    out.push_str(&format!(
        "- Age: {} (band {})\n",
        d.age_years
            .map_or_else(|| "unknown".to_string(), |a| format!("{a:.1}y")),
        fmt_band(d.age_band)
    ));
    if let Some(sex) = d.sex {
        out.push_str(&format!("- Sex: {sex:?}\n"));
    }
    if let Some(procedure) = &d.procedure {
        out.push_str(&format!("- Procedure: {procedure}\n"));
    }
    out.push_str(&format!("- Urgency: {}\n", d.urgency.as_str()));
    if let Some(weight) = d.weight_kg {
        out.push_str(&format!("- Weight: {weight:.1} kg\n"));
    }

    if !result.factors.is_empty() {
        out.push_str("\n## Extracted factors\n\n");
        out.push_str("| Factor | Confidence | Category | Evidence |\n");
        out.push_str("|--------|------------|----------|----------|\n");
        for factor in &result.factors {
            let evidence = factor
                .evidence_text
                .first()
                .map_or_else(|| "(derived)".to_string(), |s| format!("\"{}\"", s.text));
            out.push_str(&format!(
                "| {} | {:.2} | {} | {} |\n",
                factor.token, factor.confidence, factor.category, evidence
            ));
        }
    }

    out.push_str(&format!("\n## Risks — overall {:?}\n\n", result.risk_level));
    out.push_str("| Outcome | Baseline | Adjusted | 95% CI | Ratio | Grade |\n");
    out.push_str("|---------|----------|----------|--------|-------|-------|\n");
    for risk in &result.risks {
        if risk.no_evidence {
            out.push_str(&format!("| {} | — | — | — | — | no evidence |\n", risk.outcome));
            continue;
        }
        out.push_str(&format!(
            "| {} | {} | {} | {}-{} | {:.1}x | {} |\n",
            risk.outcome,
            fmt_pct(risk.baseline_risk.unwrap_or_default()),
            fmt_pct(risk.adjusted_risk.unwrap_or_default()),
            fmt_pct(risk.ci_low.unwrap_or_default()),
            fmt_pct(risk.ci_high.unwrap_or_default()),
            risk.risk_ratio.unwrap_or_default(),
            risk.evidence_grade.map_or("-", |g| g.as_str()),
        ));
    }

    if let Some(meds) = &result.medications {
        out.push_str("\n## Medications\n");
        push_med_section(&mut out, "Draw now", &meds.draw_now);
        push_med_section(&mut out, "Contraindicated", &meds.contraindicated);
        push_med_section(&mut out, "Consider", &meds.consider);
        push_med_section(&mut out, "Ensure available", &meds.ensure_available);
        push_med_section(&mut out, "Standard", &meds.standard);
    }

    if !result.audit.is_empty() {
        out.push_str("\n## Notes\n\n");
        for event in &result.audit {
            out.push_str(&format!("- {:?}: {}\n", event.kind, event.detail));
        }
    }

    out
}

pub fn evidence_markdown(
    snapshot: &PooledSnapshot,
    outcome: &str,
    context: Option<&ContextLabel>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# Pooled evidence: {outcome} ({})\n\n",
        snapshot.version
    ));
    if let Some(ctx) = context {
        out.push_str(&format!("Context: {ctx} (including wildcard parents)\n\n"));
    }
    let baselines = snapshot.baselines_for(outcome, context);
    if baselines.is_empty() {
        out.push_str("No pooled baselines for this outcome.\n");
        return out;
    }
    out.push_str("## Baselines\n\n");
    out.push_str("| Context | k | p0 | 95% CI | Method | Grade | PMIDs |\n");
    out.push_str("|---------|---|----|--------|--------|-------|-------|\n");
    for row in baselines {
        out.push_str(&format!(
            "| {} | {} | {} | {}-{} | {} | {} | {} |\n",
            row.context_label,
            row.k,
            fmt_pct(row.p0),
            fmt_pct(row.p0_ci_low),
            fmt_pct(row.p0_ci_high),
            row.method,
            row.evidence_grade.as_str(),
            row.pmids.join(", "),
        ));
    }
    let effects = snapshot.effects_for(outcome, context);
    if !effects.is_empty() {
        out.push_str("\n## Modifier effects\n\n");
        out.push_str("| Modifier | Context | k | OR | 95% CI | I2 | Method | Grade |\n");
        out.push_str("|----------|---------|---|----|--------|----|--------|-------|\n");
        for row in effects {
            out.push_str(&format!(
                "| {} | {} | {} | {:.2} | {:.2}-{:.2} | {:.0}% | {} | {} |\n",
                row.modifier_token,
                row.context_label,
                row.k,
                row.or_mean,
                row.or_ci_low,
                row.or_ci_high,
                row.i_squared * 100.0,
                row.method,
                row.evidence_grade.as_str(),
            ));
        }
    }
    out
}
