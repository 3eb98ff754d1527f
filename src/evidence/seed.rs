//! Bundled evidence set.
//!
//! Per-study baselines and effect estimates curated from the perioperative
//! literature, keyed by PMID. These rows feed the default pooled snapshot so
//! the engine answers out of the box; production deployments ingest their own
//! estimate files and repool.

use super::store::{IngestFile, IngestPaper};
use super::{Estimate, Measure, Population, StudyDesign};

/// Version label of the bundled snapshot.
pub const DEFAULT_VERSION: &str = "v2025.06";

fn paper(
    pmid: &str,
    title: &str,
    year: u16,
    design: StudyDesign,
    n_total: u64,
    population: Population,
    time_horizon: &str,
    quality_score: f64,
) -> IngestPaper {
    IngestPaper {
        pmid: pmid.to_string(),
        title: title.to_string(),
        year,
        design,
        n_total,
        population,
        time_horizon: time_horizon.to_string(),
        evidence_grade: None,
        quality_score,
    }
}

#[allow(clippy::too_many_arguments)]
fn baseline(
    pmid: &str,
    outcome: &str,
    p: f64,
    ci: Option<(f64, f64)>,
    n: u64,
    population: Population,
    context: &str,
    quality_weight: f64,
) -> Estimate {
    Estimate {
        id: 0,
        pmid: pmid.to_string(),
        outcome_token: outcome.to_string(),
        modifier_token: None,
        measure: Measure::Incidence,
        estimate: p,
        ci_low: ci.map(|c| c.0),
        ci_high: ci.map(|c| c.1),
        adjusted: false,
        population,
        context_label: context.to_string(),
        quality_weight,
        extraction_confidence: 0.95,
        n: Some(n),
    }
}

#[allow(clippy::too_many_arguments)]
fn effect(
    pmid: &str,
    outcome: &str,
    modifier: &str,
    measure: Measure,
    value: f64,
    ci: Option<(f64, f64)>,
    adjusted: bool,
    population: Population,
    context: &str,
    quality_weight: f64,
) -> Estimate {
    Estimate {
        id: 0,
        pmid: pmid.to_string(),
        outcome_token: outcome.to_string(),
        modifier_token: Some(modifier.to_string()),
        measure,
        estimate: value,
        ci_low: ci.map(|c| c.0),
        ci_high: ci.map(|c| c.1),
        adjusted,
        population,
        context_label: context.to_string(),
        quality_weight,
        extraction_confidence: 0.9,
        n: None,
    }
}

const PEDS_ENT_ELECTIVE: &str = "PEDIATRIC\u{d7}ENT\u{d7}ELECTIVE";
const PEDS_ANY: &str = "PEDIATRIC\u{d7}*\u{d7}*";
const ADULT_ANY: &str = "ADULT\u{d7}*\u{d7}*";
const ADULT_CARDIAC: &str = "ADULT\u{d7}CARDIAC\u{d7}*";

pub fn ingest_file() -> IngestFile {
    let papers = vec![
        paper(
            "20816546",
            "Risk assessment for respiratory complications in paediatric anaesthesia",
            2010,
            StudyDesign::Cohort,
            9297,
            Population::Pediatric,
            "24h",
            0.95,
        ),
        paper(
            "18402590",
            "Laryngospasm during anesthesia in children: incidence and predictors",
            2008,
            StudyDesign::Cohort,
            1952,
            Population::Pediatric,
            "inhospital",
            0.85,
        ),
        paper(
            "11303952",
            "Upper respiratory tract infection and anesthetic complications in children",
            2001,
            StudyDesign::Cohort,
            1078,
            Population::Pediatric,
            "24h",
            0.85,
        ),
        paper(
            "15105230",
            "Perioperative adverse airway events in asthmatic children",
            2004,
            StudyDesign::CaseControl,
            720,
            Population::Pediatric,
            "24h",
            0.75,
        ),
        paper(
            "9366929",
            "Airway complications of general anesthesia in adult smokers",
            1997,
            StudyDesign::Cohort,
            3100,
            Population::Adult,
            "24h",
            0.8,
        ),
        paper(
            "10485781",
            "A simplified risk score for predicting postoperative nausea and vomiting",
            1999,
            StudyDesign::Cohort,
            2722,
            Population::Adult,
            "24h",
            0.95,
        ),
        paper(
            "24356162",
            "Consensus guidelines for the management of postoperative nausea and vomiting",
            2014,
            StudyDesign::MetaAnalysis,
            12000,
            Population::Mixed,
            "24h",
            0.9,
        ),
        paper(
            "28291590",
            "Myocardial injury after noncardiac surgery: a large international cohort",
            2017,
            StudyDesign::Cohort,
            21842,
            Population::Adult,
            "30d",
            0.95,
        ),
        paper(
            "19293698",
            "Acute kidney injury after cardiac surgery: incidence and risk factors",
            2009,
            StudyDesign::Cohort,
            3500,
            Population::Adult,
            "inhospital",
            0.9,
        ),
        paper(
            "24365829",
            "Chronic kidney disease and postoperative renal outcomes: a meta-analysis",
            2013,
            StudyDesign::MetaAnalysis,
            45000,
            Population::Adult,
            "30d",
            0.9,
        ),
        paper(
            "14766696",
            "Emergence agitation in preschool children after sevoflurane anesthesia",
            2004,
            StudyDesign::Cohort,
            521,
            Population::Pediatric,
            "24h",
            0.8,
        ),
        paper(
            "16492826",
            "Intraoperative hypotension and cardiac risk in elderly surgical patients",
            2006,
            StudyDesign::Cohort,
            1064,
            Population::Adult,
            "inhospital",
            0.85,
        ),
    ];

    let estimates = vec![
        // ── Laryngospasm ────────────────────────────────────────────────────
        baseline(
            "20816546",
            "LARYNGOSPASM",
            0.017,
            Some((0.013, 0.022)),
            4100,
            Population::Pediatric,
            PEDS_ENT_ELECTIVE,
            0.95,
        ),
        baseline(
            "18402590",
            "LARYNGOSPASM",
            0.021,
            Some((0.014, 0.031)),
            1320,
            Population::Pediatric,
            PEDS_ENT_ELECTIVE,
            0.85,
        ),
        baseline(
            "20816546",
            "LARYNGOSPASM",
            0.0087,
            Some((0.007, 0.011)),
            9297,
            Population::Pediatric,
            PEDS_ANY,
            0.95,
        ),
        baseline(
            "9366929",
            "LARYNGOSPASM",
            0.004,
            Some((0.002, 0.007)),
            3100,
            Population::Adult,
            ADULT_ANY,
            0.8,
        ),
        effect(
            "11303952",
            "LARYNGOSPASM",
            "RECENT_URI_2W",
            Measure::Or,
            2.05,
            Some((1.31, 3.21)),
            true,
            Population::Pediatric,
            PEDS_ANY,
            0.85,
        ),
        effect(
            "20816546",
            "LARYNGOSPASM",
            "RECENT_URI_2W",
            Measure::Or,
            2.34,
            Some((1.68, 3.25)),
            true,
            Population::Pediatric,
            PEDS_ANY,
            0.95,
        ),
        effect(
            "15105230",
            "LARYNGOSPASM",
            "ASTHMA",
            Measure::Or,
            2.13,
            Some((1.32, 3.44)),
            true,
            Population::Pediatric,
            PEDS_ANY,
            0.75,
        ),
        effect(
            "20816546",
            "LARYNGOSPASM",
            "ASTHMA",
            Measure::Or,
            1.92,
            Some((1.35, 2.73)),
            true,
            Population::Pediatric,
            PEDS_ANY,
            0.95,
        ),
        effect(
            "18402590",
            "LARYNGOSPASM",
            "AGE_1_5",
            Measure::Or,
            1.88,
            Some((1.22, 2.90)),
            false,
            Population::Pediatric,
            PEDS_ANY,
            0.85,
        ),
        effect(
            "9366929",
            "LARYNGOSPASM",
            "SMOKING_HISTORY",
            Measure::Or,
            2.17,
            Some((1.34, 3.51)),
            false,
            Population::Adult,
            ADULT_ANY,
            0.8,
        ),
        effect(
            "20816546",
            "LARYNGOSPASM",
            "OSA",
            Measure::Or,
            1.62,
            None,
            false,
            Population::Pediatric,
            PEDS_ANY,
            0.7,
        ),
        // ── Bronchospasm ────────────────────────────────────────────────────
        baseline(
            "20816546",
            "BRONCHOSPASM",
            0.0041,
            Some((0.003, 0.006)),
            9297,
            Population::Pediatric,
            PEDS_ANY,
            0.95,
        ),
        baseline(
            "9366929",
            "BRONCHOSPASM",
            0.0022,
            Some((0.001, 0.004)),
            3100,
            Population::Adult,
            ADULT_ANY,
            0.8,
        ),
        effect(
            "20816546",
            "BRONCHOSPASM",
            "ASTHMA",
            Measure::Or,
            3.24,
            Some((2.23, 4.71)),
            true,
            Population::Pediatric,
            PEDS_ANY,
            0.95,
        ),
        effect(
            "15105230",
            "BRONCHOSPASM",
            "ASTHMA",
            Measure::Rr,
            2.91,
            Some((1.74, 4.86)),
            false,
            Population::Pediatric,
            PEDS_ANY,
            0.75,
        ),
        effect(
            "11303952",
            "BRONCHOSPASM",
            "RECENT_URI_2W",
            Measure::Or,
            2.42,
            Some((1.45, 4.04)),
            true,
            Population::Pediatric,
            PEDS_ANY,
            0.85,
        ),
        effect(
            "9366929",
            "BRONCHOSPASM",
            "SMOKING_HISTORY",
            Measure::Or,
            1.83,
            Some((1.10, 3.05)),
            false,
            Population::Adult,
            ADULT_ANY,
            0.8,
        ),
        effect(
            "9366929",
            "BRONCHOSPASM",
            "COPD",
            Measure::Or,
            2.76,
            Some((1.52, 5.01)),
            false,
            Population::Adult,
            ADULT_ANY,
            0.8,
        ),
        // ── PONV ────────────────────────────────────────────────────────────
        baseline(
            "10485781",
            "PONV",
            0.30,
            Some((0.28, 0.32)),
            2722,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        baseline(
            "24356162",
            "PONV",
            0.42,
            Some((0.36, 0.48)),
            1800,
            Population::Pediatric,
            "PEDIATRIC\u{d7}ENT\u{d7}*",
            0.9,
        ),
        effect(
            "10485781",
            "PONV",
            "SEX_FEMALE",
            Measure::Or,
            2.57,
            Some((2.12, 3.12)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        effect(
            "10485781",
            "PONV",
            "PONV_HISTORY",
            Measure::Or,
            2.09,
            Some((1.66, 2.64)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        effect(
            "10485781",
            "PONV",
            "SMOKING_HISTORY",
            Measure::Or,
            0.61,
            Some((0.49, 0.75)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        effect(
            "24356162",
            "PONV",
            "SEX_FEMALE",
            Measure::Or,
            2.44,
            Some((1.91, 3.11)),
            true,
            Population::Mixed,
            ADULT_ANY,
            0.9,
        ),
        // ── Hypotension ─────────────────────────────────────────────────────
        baseline(
            "16492826",
            "HYPOTENSION",
            0.15,
            Some((0.13, 0.17)),
            1064,
            Population::Adult,
            ADULT_ANY,
            0.85,
        ),
        baseline(
            "19293698",
            "HYPOTENSION",
            0.25,
            Some((0.23, 0.27)),
            3500,
            Population::Adult,
            ADULT_CARDIAC,
            0.9,
        ),
        effect(
            "16492826",
            "HYPOTENSION",
            "AGE_GE_65",
            Measure::Or,
            1.78,
            Some((1.32, 2.40)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.85,
        ),
        effect(
            "16492826",
            "HYPOTENSION",
            "CHF",
            Measure::Or,
            2.21,
            Some((1.44, 3.39)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.85,
        ),
        effect(
            "16492826",
            "HYPOTENSION",
            "HYPERTENSION",
            Measure::Or,
            1.53,
            Some((1.15, 2.04)),
            false,
            Population::Adult,
            ADULT_ANY,
            0.85,
        ),
        effect(
            "16492826",
            "HYPOTENSION",
            "AFIB",
            Measure::Or,
            1.63,
            Some((1.12, 2.37)),
            false,
            Population::Adult,
            ADULT_ANY,
            0.85,
        ),
        // ── Emergence delirium ──────────────────────────────────────────────
        baseline(
            "14766696",
            "EMERGENCE_DELIRIUM",
            0.12,
            Some((0.09, 0.15)),
            521,
            Population::Pediatric,
            PEDS_ANY,
            0.8,
        ),
        effect(
            "14766696",
            "EMERGENCE_DELIRIUM",
            "AGE_1_5",
            Measure::Or,
            2.31,
            Some((1.38, 3.87)),
            false,
            Population::Pediatric,
            PEDS_ANY,
            0.8,
        ),
        // ── Acute kidney injury ─────────────────────────────────────────────
        baseline(
            "19293698",
            "ACUTE_KIDNEY_INJURY",
            0.18,
            Some((0.17, 0.19)),
            3500,
            Population::Adult,
            ADULT_CARDIAC,
            0.9,
        ),
        effect(
            "24365829",
            "ACUTE_KIDNEY_INJURY",
            "CKD",
            Measure::Or,
            3.42,
            Some((2.71, 4.32)),
            true,
            Population::Adult,
            ADULT_CARDIAC,
            0.9,
        ),
        effect(
            "19293698",
            "ACUTE_KIDNEY_INJURY",
            "DIABETES",
            Measure::Or,
            1.87,
            Some((1.45, 2.41)),
            true,
            Population::Adult,
            ADULT_CARDIAC,
            0.9,
        ),
        effect(
            "19293698",
            "ACUTE_KIDNEY_INJURY",
            "HYPERTENSION",
            Measure::Or,
            1.41,
            Some((1.09, 1.82)),
            false,
            Population::Adult,
            ADULT_CARDIAC,
            0.9,
        ),
        // ── Myocardial injury ───────────────────────────────────────────────
        baseline(
            "28291590",
            "MYOCARDIAL_INJURY",
            0.08,
            Some((0.075, 0.085)),
            21842,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        effect(
            "28291590",
            "MYOCARDIAL_INJURY",
            "CAD",
            Measure::Or,
            2.58,
            Some((2.11, 3.15)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        effect(
            "28291590",
            "MYOCARDIAL_INJURY",
            "DIABETES",
            Measure::Or,
            1.68,
            Some((1.39, 2.03)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        effect(
            "28291590",
            "MYOCARDIAL_INJURY",
            "AGE_GE_65",
            Measure::Or,
            2.02,
            Some((1.67, 2.44)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        effect(
            "28291590",
            "MYOCARDIAL_INJURY",
            "MI_HISTORY",
            Measure::Or,
            2.92,
            Some((2.31, 3.68)),
            true,
            Population::Adult,
            ADULT_ANY,
            0.95,
        ),
        // ASPIRATION intentionally has no bundled estimates: requests report
        // it as no-evidence until a deployment ingests aspiration data.
    ];

    IngestFile { papers, estimates }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::store::EvidenceStore;

    #[test]
    fn seed_ingests_cleanly() {
        let mut store = EvidenceStore::new();
        let (papers, estimates) = store.ingest(ingest_file()).expect("seed must ingest");
        assert!(papers >= 12);
        assert!(estimates >= 35);
    }

    #[test]
    fn seed_covers_scenario_contexts() {
        let mut store = EvidenceStore::new();
        store.ingest(ingest_file()).expect("seed must ingest");
        let has = |outcome: &str, modifier: Option<&str>| {
            store.estimates().iter().any(|e| {
                e.outcome_token == outcome && e.modifier_token.as_deref() == modifier
            })
        };
        assert!(has("LARYNGOSPASM", None));
        assert!(has("LARYNGOSPASM", Some("RECENT_URI_2W")));
        assert!(has("LARYNGOSPASM", Some("ASTHMA")));
        assert!(has("ACUTE_KIDNEY_INJURY", Some("CKD")));
        assert!(!has("ASPIRATION", None), "aspiration stays evidence-free");
    }

    #[test]
    fn seed_pmids_resolve_to_papers() {
        let mut store = EvidenceStore::new();
        store.ingest(ingest_file()).expect("seed must ingest");
        for est in store.estimates() {
            assert!(
                store.paper(&est.pmid).is_some(),
                "estimate {} cites missing paper {}",
                est.id,
                est.pmid
            );
        }
    }
}
