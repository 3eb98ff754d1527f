//! Medication decider: a predicate-driven rule table mapped onto five
//! buckets, with deterministic conflict resolution and dose placeholder
//! resolution.
//!
//! A medication's final bucket is driven solely by which predicates matched;
//! nothing mutates a recommendation after emission.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::evidence::{EvidenceGrade, Urgency};
use crate::extract::{AgeBand, Demographics, ExtractedFactor};
use crate::ontology::Ontology;
use crate::risk::RiskAssessment;

pub mod rules;

/// A factor participates in rule matching only above this confidence, so
/// negated or stale mentions cannot trigger medication changes.
pub const FACTOR_PRESENCE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bucket {
    Standard,
    EnsureAvailable,
    Consider,
    DrawNow,
    Contraindicated,
}

impl Bucket {
    /// Conflict-resolution priority; higher wins.
    pub fn priority(self) -> u8 {
        match self {
            Self::Standard => 0,
            Self::EnsureAvailable => 1,
            Self::Consider => 2,
            Self::DrawNow => 3,
            Self::Contraindicated => 4,
        }
    }
}

/// Composable trigger over factors, risks, and demographics.
#[derive(Debug, Clone)]
pub enum Predicate {
    Factor(&'static str),
    AnyFactor(&'static [&'static str]),
    AllOf(&'static [Predicate]),
    AnyOf(&'static [Predicate]),
    RiskAtLeast {
        outcome: &'static str,
        threshold: f64,
    },
    RiskRatioAtLeast {
        outcome: &'static str,
        ratio: f64,
    },
    AgeUnder(f64),
    AgeAtLeast(f64),
    UrgencyIs(Urgency),
    Procedure(&'static str),
}

/// Resolved request state the predicates evaluate against.
pub struct DecisionInput<'a> {
    pub demographics: &'a Demographics,
    pub factors: &'a [ExtractedFactor],
    pub risks: &'a [RiskAssessment],
}

impl DecisionInput<'_> {
    fn factor_present(&self, token: &str) -> bool {
        self.factors
            .iter()
            .any(|f| f.token == token && f.confidence > FACTOR_PRESENCE_THRESHOLD)
    }

    fn risk_for(&self, outcome: &str) -> Option<&RiskAssessment> {
        self.risks.iter().find(|r| r.outcome == outcome)
    }

    /// Age in years for rule evaluation: the parsed age, else the band's
    /// representative range. UNKNOWN yields `None` and age predicates fail.
    fn effective_age(&self) -> Option<(f64, f64)> {
        if let Some(age) = self.demographics.age_years {
            return Some((age, age));
        }
        match self.demographics.age_band {
            AgeBand::AgeLt1 => Some((0.0, 1.0)),
            AgeBand::Age1_5 => Some((1.0, 5.0)),
            AgeBand::Age6_12 => Some((6.0, 12.0)),
            AgeBand::Age13_17 => Some((13.0, 17.0)),
            AgeBand::Age18_64 => Some((18.0, 64.0)),
            AgeBand::AgeGe65 => Some((65.0, 120.0)),
            AgeBand::Unknown => None,
        }
    }
}

impl Predicate {
    pub fn matches(&self, input: &DecisionInput<'_>) -> bool {
        match self {
            Self::Factor(token) => input.factor_present(token),
            Self::AnyFactor(tokens) => tokens.iter().any(|t| input.factor_present(t)),
            Self::AllOf(preds) => preds.iter().all(|p| p.matches(input)),
            Self::AnyOf(preds) => preds.iter().any(|p| p.matches(input)),
            Self::RiskAtLeast { outcome, threshold } => input
                .risk_for(outcome)
                .and_then(|r| r.adjusted_risk)
                .is_some_and(|risk| risk >= *threshold),
            Self::RiskRatioAtLeast { outcome, ratio } => input
                .risk_for(outcome)
                .and_then(|r| r.risk_ratio)
                .is_some_and(|value| value >= *ratio),
            Self::AgeUnder(years) => input
                .effective_age()
                .is_some_and(|(_, upper)| upper < *years),
            Self::AgeAtLeast(years) => input
                .effective_age()
                .is_some_and(|(lower, _)| lower >= *years),
            Self::UrgencyIs(urgency) => input.demographics.urgency == *urgency,
            Self::Procedure(token) => input.demographics.procedure.as_deref() == Some(*token),
        }
    }

    /// Factor tokens referenced by this predicate that are present, for the
    /// `patient_factors` provenance list.
    pub fn matched_factors(&self, input: &DecisionInput<'_>) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_factors(input, &mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_factors(&self, input: &DecisionInput<'_>, out: &mut Vec<String>) {
        match self {
            Self::Factor(token) => {
                if input.factor_present(token) {
                    out.push((*token).to_string());
                }
            }
            Self::AnyFactor(tokens) => {
                for token in *tokens {
                    if input.factor_present(token) {
                        out.push((*token).to_string());
                    }
                }
            }
            Self::AllOf(preds) | Self::AnyOf(preds) => {
                for p in *preds {
                    p.collect_factors(input, out);
                }
            }
            _ => {}
        }
    }
}

/// One row of the rule table.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: &'static str,
    pub predicate: Predicate,
    pub medication: &'static str,
    pub bucket: Bucket,
    pub indication: &'static str,
    pub dose_rule: Option<&'static str>,
    pub citations: &'static [&'static str],
    pub justification: &'static str,
    pub evidence_grade: EvidenceGrade,
}

#[derive(Debug, Clone, Serialize)]
pub struct MedicationRecommendation {
    pub token: String,
    pub generic_name: String,
    pub bucket: Bucket,
    pub indication: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose_rule: Option<String>,
    pub evidence_grade: EvidenceGrade,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patient_factors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
    pub justification: String,
    /// Rule emitted without a citation and was downgraded to CONSIDER.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unsupported: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub missing_weight: bool,
}

/// The five buckets, each sorted by evidence grade then token.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MedicationPlan {
    pub standard: Vec<MedicationRecommendation>,
    pub draw_now: Vec<MedicationRecommendation>,
    pub consider: Vec<MedicationRecommendation>,
    pub ensure_available: Vec<MedicationRecommendation>,
    pub contraindicated: Vec<MedicationRecommendation>,
}

impl MedicationPlan {
    pub fn all(&self) -> impl Iterator<Item = &MedicationRecommendation> {
        self.standard
            .iter()
            .chain(&self.draw_now)
            .chain(&self.consider)
            .chain(&self.ensure_available)
            .chain(&self.contraindicated)
    }

    fn push(&mut self, rec: MedicationRecommendation) {
        match rec.bucket {
            Bucket::Standard => self.standard.push(rec),
            Bucket::DrawNow => self.draw_now.push(rec),
            Bucket::Consider => self.consider.push(rec),
            Bucket::EnsureAvailable => self.ensure_available.push(rec),
            Bucket::Contraindicated => self.contraindicated.push(rec),
        }
    }

    fn sort(&mut self) {
        for bucket in [
            &mut self.standard,
            &mut self.draw_now,
            &mut self.consider,
            &mut self.ensure_available,
            &mut self.contraindicated,
        ] {
            bucket.sort_by(|a, b| {
                a.evidence_grade
                    .cmp(&b.evidence_grade)
                    .then_with(|| a.token.cmp(&b.token))
            });
        }
    }
}

/// Candidate recommendation before conflict resolution.
#[derive(Debug, Clone)]
struct Candidate {
    medication: String,
    bucket: Bucket,
    indication: String,
    dose_rule: Option<String>,
    citations: Vec<String>,
    justification: String,
    patient_factors: Vec<String>,
    evidence_grade: EvidenceGrade,
    unsupported: bool,
}

fn resolve_dose(
    template: &str,
    demographics: &Demographics,
    warnings: &mut Vec<String>,
    medication: &str,
) -> (String, bool) {
    let mut resolved = template.to_string();
    let mut missing_weight = false;
    if resolved.contains("{weight_kg}") {
        match demographics.weight_kg {
            Some(weight) => {
                resolved = resolved.replace("{weight_kg}", &format!("{weight:.1}"));
            }
            None => {
                missing_weight = true;
                warnings.push(format!(
                    "missing_weight: dose for {medication} left unresolved"
                ));
            }
        }
    }
    if resolved.contains("{age_years}") {
        if let Some(age) = demographics.age_years {
            resolved = resolved.replace("{age_years}", &format!("{age:.0}"));
        }
    }
    (resolved, missing_weight)
}

/// Evaluate the rule table and the procedure's base set into a bucketed plan.
/// Returns the plan plus request-scoped warnings (e.g. unresolved doses).
pub fn decide(ontology: &Ontology, input: &DecisionInput<'_>) -> (MedicationPlan, Vec<String>) {
    let mut warnings = Vec::new();
    let mut candidates: Vec<Candidate> = Vec::new();

    for entry in rules::standard_set(input.demographics.procedure.as_deref()) {
        candidates.push(Candidate {
            medication: entry.medication.to_string(),
            bucket: Bucket::Standard,
            indication: entry.indication.to_string(),
            dose_rule: Some(entry.dose(input.demographics).to_string()),
            citations: Vec::new(),
            justification: format!("standard agent for {}", entry.indication),
            patient_factors: Vec::new(),
            evidence_grade: entry.evidence_grade,
            unsupported: false,
        });
    }

    for rule in rules::rules() {
        if !rule.predicate.matches(input) {
            continue;
        }
        let mut bucket = rule.bucket;
        let mut unsupported = false;
        // Every non-STANDARD recommendation needs a citation; an uncited rule
        // drops to CONSIDER and is flagged.
        if bucket != Bucket::Standard && rule.citations.is_empty() {
            bucket = Bucket::Consider;
            unsupported = true;
        }
        candidates.push(Candidate {
            medication: rule.medication.to_string(),
            bucket,
            indication: rule.indication.to_string(),
            dose_rule: rule.dose_rule.map(str::to_string),
            citations: rule.citations.iter().map(|c| (*c).to_string()).collect(),
            justification: rule.justification.to_string(),
            patient_factors: rule.predicate.matched_factors(input),
            evidence_grade: rule.evidence_grade,
            unsupported,
        });
    }

    // Conflict resolution per medication: CONTRAINDICATED wins outright and
    // evicts the medication from every lower bucket; otherwise the highest
    // priority bucket survives, merging same-bucket candidates.
    let mut by_medication: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        by_medication
            .entry(candidate.medication.clone())
            .or_default()
            .push(candidate);
    }

    let mut plan = MedicationPlan::default();
    for (medication, group) in by_medication {
        let top_bucket = group
            .iter()
            .map(|c| c.bucket)
            .max_by_key(|b| b.priority())
            .expect("group is never empty");
        let winners: Vec<&Candidate> = group.iter().filter(|c| c.bucket == top_bucket).collect();

        let mut citations: Vec<String> = winners
            .iter()
            .flat_map(|c| c.citations.iter().cloned())
            .collect();
        citations.sort();
        citations.dedup();
        let mut patient_factors: Vec<String> = winners
            .iter()
            .flat_map(|c| c.patient_factors.iter().cloned())
            .collect();
        patient_factors.sort();
        patient_factors.dedup();
        let justification = winners
            .iter()
            .map(|c| c.justification.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let grade = winners
            .iter()
            .map(|c| c.evidence_grade)
            .min()
            .expect("winners is never empty");

        let first = winners[0];
        let (dose_rule, missing_weight) = match first.dose_rule.as_deref() {
            Some(template) => {
                let (resolved, missing) =
                    resolve_dose(template, input.demographics, &mut warnings, &medication);
                (Some(resolved), missing)
            }
            None => (None, false),
        };

        let generic_name = ontology
            .get(&medication)
            .and_then(|t| t.generic_name.clone())
            .unwrap_or_else(|| medication.to_lowercase());

        plan.push(MedicationRecommendation {
            token: medication,
            generic_name,
            bucket: top_bucket,
            indication: first.indication.clone(),
            dose_rule,
            evidence_grade: grade,
            patient_factors,
            citations,
            justification,
            unsupported: winners.iter().any(|c| c.unsupported),
            missing_weight,
        });
    }

    plan.sort();
    (plan, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{AgeBand, Sex};
    use crate::ontology::Ontology;

    fn demographics_peds_ent() -> Demographics {
        Demographics {
            age_years: Some(5.0),
            age_band: AgeBand::Age1_5,
            sex: Some(Sex::Male),
            procedure: Some("TONSILLECTOMY".into()),
            urgency: Urgency::Elective,
            weight_kg: Some(18.0),
            age_ambiguous: false,
        }
    }

    fn factor(token: &str, confidence: f64) -> ExtractedFactor {
        ExtractedFactor {
            token: token.to_string(),
            plain_label: token.to_lowercase(),
            confidence,
            evidence_text: Vec::new(),
            category: "test".into(),
            severity_weight: 1.0,
        }
    }

    fn tokens(recs: &[MedicationRecommendation]) -> Vec<&str> {
        recs.iter().map(|r| r.token.as_str()).collect()
    }

    #[test]
    fn pediatric_asthma_plan_matches_expectations() {
        let ontology = Ontology::builtin();
        let demographics = demographics_peds_ent();
        let factors = vec![
            factor("ASTHMA", 0.95),
            factor("RECENT_URI_2W", 0.95),
            factor("AGE_1_5", 1.0),
            factor("SEX_MALE", 1.0),
        ];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);

        assert!(tokens(&plan.draw_now).contains(&"ALBUTEROL"));
        assert!(tokens(&plan.contraindicated).contains(&"SUCCINYLCHOLINE"));
        assert!(tokens(&plan.contraindicated).contains(&"DESFLURANE"));
        for expected in ["PROPOFOL", "SEVOFLURANE", "FENTANYL", "DEXAMETHASONE", "ONDANSETRON"] {
            assert!(
                tokens(&plan.standard).contains(&expected),
                "standard set missing {expected}"
            );
        }
    }

    #[test]
    fn contraindicated_medication_leaves_every_other_bucket() {
        let ontology = Ontology::builtin();
        let demographics = demographics_peds_ent();
        let factors = vec![factor("ASTHMA", 0.95)];
        let risks = vec![{
            let mut r = RiskAssessment::no_evidence("LARYNGOSPASM");
            r.no_evidence = false;
            r.adjusted_risk = Some(0.08);
            r.risk_ratio = Some(4.0);
            r
        }];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &risks,
        };
        let (plan, _) = decide(&ontology, &input);

        // The laryngospasm rescue rule wants succinylcholine available, but
        // the pediatric contraindication wins.
        assert!(tokens(&plan.contraindicated).contains(&"SUCCINYLCHOLINE"));
        for bucket in [&plan.standard, &plan.draw_now, &plan.consider, &plan.ensure_available] {
            assert!(!tokens(bucket).contains(&"SUCCINYLCHOLINE"));
        }
        // The co-triggered atropine rescue stays.
        assert!(tokens(&plan.ensure_available).contains(&"ATROPINE"));
        let sux = &plan
            .contraindicated
            .iter()
            .find(|r| r.token == "SUCCINYLCHOLINE")
            .expect("contraindicated succinylcholine");
        assert!(!sux.citations.is_empty());
    }

    #[test]
    fn renal_disease_blocks_nsaids_and_succinylcholine() {
        let ontology = Ontology::builtin();
        let demographics = Demographics {
            age_years: Some(68.0),
            age_band: AgeBand::AgeGe65,
            sex: Some(Sex::Male),
            procedure: Some("CABG".into()),
            urgency: Urgency::Elective,
            weight_kg: None,
            age_ambiguous: false,
        };
        let factors = vec![
            factor("CAD", 0.95),
            factor("DIABETES", 0.95),
            factor("HYPERTENSION", 0.95),
            factor("CKD", 0.95),
        ];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);

        assert!(tokens(&plan.contraindicated).contains(&"NSAID"));
        assert!(tokens(&plan.contraindicated).contains(&"SUCCINYLCHOLINE"));
        assert!(tokens(&plan.standard).contains(&"CISATRACURIUM"));
        let sux = plan
            .contraindicated
            .iter()
            .find(|r| r.token == "SUCCINYLCHOLINE")
            .expect("contraindicated succinylcholine");
        assert!(
            sux.patient_factors.contains(&"CKD".to_string()),
            "justification must name the blocking factor: {:?}",
            sux.patient_factors
        );
    }

    #[test]
    fn elevated_ponv_risk_adds_a_second_antiemetic() {
        let ontology = Ontology::builtin();
        let demographics = demographics_peds_ent();
        let risks = vec![{
            let mut r = RiskAssessment::no_evidence("PONV");
            r.no_evidence = false;
            r.adjusted_risk = Some(0.42);
            r.risk_ratio = Some(1.0);
            r
        }];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &[],
            risks: &risks,
        };
        let (plan, _) = decide(&ontology, &input);
        let droperidol = plan
            .consider
            .iter()
            .find(|r| r.token == "DROPERIDOL")
            .expect("second antiemetic considered");
        assert!(
            droperidol
                .dose_rule
                .as_deref()
                .is_some_and(|d| d.contains("mcg/kg")),
            "pediatric droperidol dose is weight-based"
        );
        assert!(!droperidol.citations.is_empty());

        // A documented PONV history triggers it without a pooled risk row.
        let factors = vec![factor("PONV_HISTORY", 0.9)];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);
        assert!(tokens(&plan.consider).contains(&"DROPERIDOL"));
    }

    #[test]
    fn healthy_adult_gets_standard_set_only() {
        let ontology = Ontology::builtin();
        let demographics = Demographics {
            age_years: None,
            age_band: AgeBand::Age18_64,
            sex: None,
            procedure: Some("HERNIA_REPAIR".into()),
            urgency: Urgency::Elective,
            weight_kg: None,
            age_ambiguous: false,
        };
        let input = DecisionInput {
            demographics: &demographics,
            factors: &[],
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);
        assert!(plan.draw_now.is_empty());
        assert!(plan.contraindicated.is_empty());
        assert!(!plan.standard.is_empty());
    }

    #[test]
    fn negated_factor_does_not_trigger_rules() {
        let ontology = Ontology::builtin();
        let demographics = demographics_peds_ent();
        let factors = vec![factor("ASTHMA", 0.095)];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);
        assert!(!tokens(&plan.draw_now).contains(&"ALBUTEROL"));
    }

    #[test]
    fn missing_weight_keeps_placeholder_and_warns() {
        let ontology = Ontology::builtin();
        let mut demographics = demographics_peds_ent();
        demographics.weight_kg = None;
        let factors = vec![factor("ASTHMA", 0.95)];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, warnings) = decide(&ontology, &input);
        let albuterol = plan
            .draw_now
            .iter()
            .find(|r| r.token == "ALBUTEROL")
            .expect("albuterol drawn");
        assert!(albuterol.missing_weight);
        assert!(
            albuterol
                .dose_rule
                .as_deref()
                .is_some_and(|d| d.contains("{weight_kg}")),
            "unresolved placeholder is kept"
        );
        assert!(warnings.iter().any(|w| w.contains("missing_weight")));
    }

    #[test]
    fn pediatric_doses_are_weight_based() {
        let ontology = Ontology::builtin();
        let demographics = demographics_peds_ent();
        let factors = vec![
            factor("ASTHMA", 0.95),
            factor("MALIGNANT_HYPERTHERMIA_HISTORY", 0.95),
        ];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);
        for rec in plan.all() {
            if rec.bucket == Bucket::Contraindicated {
                continue;
            }
            let dose = rec
                .dose_rule
                .as_deref()
                .unwrap_or_else(|| panic!("{} has no dose rule", rec.token));
            assert!(
                dose.contains("mg/kg") || dose.contains("mcg/kg") || dose.contains("{weight_kg}")
                    || dose.contains("kg"),
                "pediatric dose for {} is not weight-based: {dose}",
                rec.token
            );
        }
    }

    #[test]
    fn malignant_hyperthermia_triggers_dantrolene_and_blocks_triggers() {
        let ontology = Ontology::builtin();
        let demographics = demographics_peds_ent();
        let factors = vec![factor("MALIGNANT_HYPERTHERMIA_HISTORY", 0.95)];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);
        assert!(tokens(&plan.draw_now).contains(&"DANTROLENE"));
        assert!(tokens(&plan.contraindicated).contains(&"SEVOFLURANE"));
        assert!(tokens(&plan.contraindicated).contains(&"DESFLURANE"));
        assert!(tokens(&plan.contraindicated).contains(&"SUCCINYLCHOLINE"));
        assert!(
            tokens(&plan.standard).contains(&"PROPOFOL"),
            "non-triggering agents stay standard"
        );
    }

    #[test]
    fn buckets_are_ordered_by_grade_then_token() {
        let ontology = Ontology::builtin();
        let demographics = demographics_peds_ent();
        let factors = vec![
            factor("ASTHMA", 0.95),
            factor("MALIGNANT_HYPERTHERMIA_HISTORY", 0.95),
        ];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);
        for bucket in [&plan.standard, &plan.contraindicated] {
            for pair in bucket.windows(2) {
                assert!(
                    (pair[0].evidence_grade, pair[0].token.as_str())
                        <= (pair[1].evidence_grade, pair[1].token.as_str()),
                    "bucket ordering violated: {} before {}",
                    pair[0].token,
                    pair[1].token
                );
            }
        }
    }

    #[test]
    fn every_non_standard_recommendation_cites_evidence() {
        let ontology = Ontology::builtin();
        let demographics = demographics_peds_ent();
        let factors = vec![
            factor("ASTHMA", 0.95),
            factor("RECENT_URI_2W", 0.85),
            factor("CAD", 0.9),
        ];
        let input = DecisionInput {
            demographics: &demographics,
            factors: &factors,
            risks: &[],
        };
        let (plan, _) = decide(&ontology, &input);
        for rec in plan.all() {
            if rec.bucket != Bucket::Standard && !rec.unsupported {
                assert!(
                    !rec.citations.is_empty(),
                    "{} in {:?} lacks citations",
                    rec.token,
                    rec.bucket
                );
            }
        }
    }
}
