//! Rule data: per-procedure standard sets and the evidence-indexed trigger
//! table. Citations are PMIDs or guideline identifiers.

use crate::evidence::{EvidenceGrade, Urgency};
use crate::extract::{AgeBand, Demographics};
use crate::meds::{Bucket, Predicate, Rule};

#[derive(Debug, Clone)]
pub struct StandardEntry {
    pub medication: &'static str,
    pub indication: &'static str,
    pub dose_adult: &'static str,
    pub dose_peds: &'static str,
    pub evidence_grade: EvidenceGrade,
}

impl StandardEntry {
    pub fn dose(&self, demographics: &Demographics) -> &'static str {
        let pediatric = matches!(
            demographics.age_band,
            AgeBand::AgeLt1 | AgeBand::Age1_5 | AgeBand::Age6_12 | AgeBand::Age13_17
        );
        if pediatric { self.dose_peds } else { self.dose_adult }
    }
}

const fn entry(
    medication: &'static str,
    indication: &'static str,
    dose_adult: &'static str,
    dose_peds: &'static str,
    evidence_grade: EvidenceGrade,
) -> StandardEntry {
    StandardEntry {
        medication,
        indication,
        dose_adult,
        dose_peds,
        evidence_grade,
    }
}

const TONSILLECTOMY_SET: &[StandardEntry] = &[
    entry(
        "PROPOFOL",
        "induction",
        "1.5-2.5 mg/kg IV",
        "2-3 mg/kg IV",
        EvidenceGrade::B,
    ),
    entry(
        "SEVOFLURANE",
        "maintenance",
        "0.5-3% end-tidal, titrate to 1 MAC",
        "induction 8%, maintenance 2-3%; patient {weight_kg} kg",
        EvidenceGrade::B,
    ),
    entry(
        "FENTANYL",
        "analgesia",
        "1-2 mcg/kg IV increments",
        "1-2 mcg/kg IV increments",
        EvidenceGrade::B,
    ),
    entry(
        "DEXAMETHASONE",
        "PONV and edema prophylaxis",
        "4-8 mg IV",
        "0.15 mg/kg IV (max 8 mg)",
        EvidenceGrade::A,
    ),
    entry(
        "ONDANSETRON",
        "PONV prophylaxis",
        "4 mg IV",
        "0.1 mg/kg IV (max 4 mg)",
        EvidenceGrade::A,
    ),
];

const CABG_SET: &[StandardEntry] = &[
    entry(
        "PROPOFOL",
        "induction",
        "1-1.5 mg/kg IV, slow titration",
        "1-2 mg/kg IV, slow titration",
        EvidenceGrade::B,
    ),
    entry(
        "FENTANYL",
        "analgesia",
        "5-10 mcg/kg IV",
        "5-10 mcg/kg IV",
        EvidenceGrade::B,
    ),
    entry(
        "MIDAZOLAM",
        "anxiolysis and amnesia",
        "0.05-0.1 mg/kg IV",
        "0.05-0.1 mg/kg IV",
        EvidenceGrade::B,
    ),
    entry(
        "CISATRACURIUM",
        "neuromuscular blockade",
        "0.15-0.2 mg/kg IV",
        "0.15-0.2 mg/kg IV",
        EvidenceGrade::B,
    ),
];

const DEFAULT_SET: &[StandardEntry] = &[
    entry(
        "PROPOFOL",
        "induction",
        "1.5-2.5 mg/kg IV",
        "2-3 mg/kg IV",
        EvidenceGrade::B,
    ),
    entry(
        "SEVOFLURANE",
        "maintenance",
        "0.5-3% end-tidal, titrate to 1 MAC",
        "induction 8%, maintenance 2-3%; patient {weight_kg} kg",
        EvidenceGrade::B,
    ),
    entry(
        "FENTANYL",
        "analgesia",
        "1-2 mcg/kg IV increments",
        "1-2 mcg/kg IV increments",
        EvidenceGrade::B,
    ),
    entry(
        "ONDANSETRON",
        "PONV prophylaxis",
        "4 mg IV",
        "0.1 mg/kg IV (max 4 mg)",
        EvidenceGrade::A,
    ),
];

/// Base STANDARD set for a resolved procedure; unknown procedures get the
/// generic set.
pub fn standard_set(procedure: Option<&str>) -> &'static [StandardEntry] {
    match procedure {
        Some("TONSILLECTOMY" | "ADENOIDECTOMY" | "MYRINGOTOMY") => TONSILLECTOMY_SET,
        Some("CABG") => CABG_SET,
        _ => DEFAULT_SET,
    }
}

const REACTIVE_AIRWAY: &[&str] = &["ASTHMA", "RECENT_URI_2W", "COPD"];
const RENAL_FAILURE: &[&str] = &["CKD", "ESRD"];

pub fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "reactive-airway-desflurane",
            predicate: Predicate::AnyFactor(REACTIVE_AIRWAY),
            medication: "DESFLURANE",
            bucket: Bucket::Contraindicated,
            indication: "volatile maintenance",
            dose_rule: None,
            citations: &["20816546"],
            justification: "airway irritant volatile provokes bronchospasm and laryngospasm in reactive airway disease",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "pediatric-elective-succinylcholine",
            predicate: Predicate::AllOf(&[
                Predicate::AgeUnder(18.0),
                Predicate::UrgencyIs(Urgency::Elective),
            ]),
            medication: "SUCCINYLCHOLINE",
            bucket: Bucket::Contraindicated,
            indication: "routine paralysis",
            dose_rule: None,
            citations: &["FDA-ANECTINE-LABEL"],
            justification: "routine elective use in children risks hyperkalemic arrest with undiagnosed myopathy",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "renal-succinylcholine",
            predicate: Predicate::AnyFactor(RENAL_FAILURE),
            medication: "SUCCINYLCHOLINE",
            bucket: Bucket::Contraindicated,
            indication: "paralysis",
            dose_rule: None,
            citations: &["24365829"],
            justification: "potassium release is hazardous with impaired renal clearance",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "renal-nsaid",
            predicate: Predicate::AnyFactor(RENAL_FAILURE),
            medication: "NSAID",
            bucket: Bucket::Contraindicated,
            indication: "postoperative analgesia",
            dose_rule: None,
            citations: &["24365829", "KDIGO-2012-AKI"],
            justification: "prostaglandin inhibition worsens renal perfusion in chronic kidney disease",
            evidence_grade: EvidenceGrade::A,
        },
        Rule {
            name: "mh-sevoflurane",
            predicate: Predicate::Factor("MALIGNANT_HYPERTHERMIA_HISTORY"),
            medication: "SEVOFLURANE",
            bucket: Bucket::Contraindicated,
            indication: "volatile maintenance",
            dose_rule: None,
            citations: &["MHAUS-2018"],
            justification: "volatile anesthetics trigger malignant hyperthermia",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "mh-desflurane",
            predicate: Predicate::Factor("MALIGNANT_HYPERTHERMIA_HISTORY"),
            medication: "DESFLURANE",
            bucket: Bucket::Contraindicated,
            indication: "volatile maintenance",
            dose_rule: None,
            citations: &["MHAUS-2018"],
            justification: "volatile anesthetics trigger malignant hyperthermia",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "mh-succinylcholine",
            predicate: Predicate::Factor("MALIGNANT_HYPERTHERMIA_HISTORY"),
            medication: "SUCCINYLCHOLINE",
            bucket: Bucket::Contraindicated,
            indication: "paralysis",
            dose_rule: None,
            citations: &["MHAUS-2018"],
            justification: "depolarizing blockade triggers malignant hyperthermia",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "mh-dantrolene",
            predicate: Predicate::Factor("MALIGNANT_HYPERTHERMIA_HISTORY"),
            medication: "DANTROLENE",
            bucket: Bucket::DrawNow,
            indication: "malignant hyperthermia rescue",
            dose_rule: Some("2.5 mg/kg IV initial bolus; repeat to effect"),
            citations: &["MHAUS-2018"],
            justification: "trigger-free technique still requires immediate dantrolene access",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "asthma-albuterol",
            predicate: Predicate::Factor("ASTHMA"),
            medication: "ALBUTEROL",
            bucket: Bucket::DrawNow,
            indication: "bronchospasm prophylaxis and rescue",
            dose_rule: Some("2.5 mg nebulized pre-induction; repeat per {weight_kg} kg dosing"),
            citations: &["15105230"],
            justification: "pre-induction bronchodilation lowers intraoperative bronchospasm risk",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "bronchospasm-ketamine",
            predicate: Predicate::AnyOf(&[
                Predicate::Factor("ASTHMA"),
                Predicate::RiskRatioAtLeast {
                    outcome: "BRONCHOSPASM",
                    ratio: 2.0,
                },
            ]),
            medication: "KETAMINE",
            bucket: Bucket::Consider,
            indication: "induction",
            dose_rule: Some("1-2 mg/kg IV induction"),
            citations: &["15105230"],
            justification: "bronchodilating induction agent for reactive airway disease",
            evidence_grade: EvidenceGrade::C,
        },
        Rule {
            name: "laryngospasm-rescue-succinylcholine",
            predicate: Predicate::RiskRatioAtLeast {
                outcome: "LARYNGOSPASM",
                ratio: 2.0,
            },
            medication: "SUCCINYLCHOLINE",
            bucket: Bucket::EnsureAvailable,
            indication: "laryngospasm rescue",
            dose_rule: Some("0.1-0.5 mg/kg IV for refractory laryngospasm"),
            citations: &["20816546"],
            justification: "elevated laryngospasm risk warrants immediate rescue paralytic",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "laryngospasm-rescue-atropine",
            predicate: Predicate::RiskRatioAtLeast {
                outcome: "LARYNGOSPASM",
                ratio: 2.0,
            },
            medication: "ATROPINE",
            bucket: Bucket::EnsureAvailable,
            indication: "bradycardia during laryngospasm",
            dose_rule: Some("0.02 mg/kg IV (minimum 0.1 mg)"),
            citations: &["20816546"],
            justification: "rescue paralytic dosing can provoke bradycardia in small children",
            evidence_grade: EvidenceGrade::C,
        },
        Rule {
            name: "emergence-delirium-dexmedetomidine",
            predicate: Predicate::AllOf(&[
                Predicate::AgeUnder(18.0),
                Predicate::RiskAtLeast {
                    outcome: "EMERGENCE_DELIRIUM",
                    threshold: 0.10,
                },
            ]),
            medication: "DEXMEDETOMIDINE",
            bucket: Bucket::Consider,
            indication: "emergence delirium prophylaxis",
            dose_rule: Some("0.5-1 mcg/kg IV over 10 minutes"),
            citations: &["14766696"],
            justification: "alpha-2 agonism reduces sevoflurane emergence agitation",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "ponv-droperidol",
            predicate: Predicate::AnyOf(&[
                Predicate::RiskAtLeast {
                    outcome: "PONV",
                    threshold: 0.35,
                },
                Predicate::Factor("PONV_HISTORY"),
            ]),
            medication: "DROPERIDOL",
            bucket: Bucket::Consider,
            indication: "second-line PONV prophylaxis",
            dose_rule: Some("0.625-1.25 mg IV (adult); 10-15 mcg/kg pediatric"),
            citations: &["24356162"],
            justification: "elevated nausea risk warrants a second antiemetic class beyond baseline prophylaxis",
            evidence_grade: EvidenceGrade::A,
        },
        Rule {
            name: "osa-dexmedetomidine",
            predicate: Predicate::Factor("OSA"),
            medication: "DEXMEDETOMIDINE",
            bucket: Bucket::Consider,
            indication: "opioid-sparing sedation",
            dose_rule: Some("0.2-0.7 mcg/kg/h infusion"),
            citations: &["ASA-OSA-2014"],
            justification: "opioid-sparing technique limits postoperative airway obstruction",
            evidence_grade: EvidenceGrade::C,
        },
        Rule {
            name: "cad-nitroglycerin",
            predicate: Predicate::Factor("CAD"),
            medication: "NITROGLYCERIN",
            bucket: Bucket::EnsureAvailable,
            indication: "myocardial ischemia",
            dose_rule: Some("0.25-0.5 mcg/kg/min infusion, titrate"),
            citations: &["28291590"],
            justification: "ischemia during known coronary disease needs immediate vasodilator access",
            evidence_grade: EvidenceGrade::B,
        },
        Rule {
            name: "hypotension-phenylephrine",
            predicate: Predicate::AnyOf(&[
                Predicate::Factor("CAD"),
                Predicate::RiskAtLeast {
                    outcome: "HYPOTENSION",
                    threshold: 0.20,
                },
            ]),
            medication: "PHENYLEPHRINE",
            bucket: Bucket::EnsureAvailable,
            indication: "pressure support",
            dose_rule: Some("50-100 mcg IV bolus; 0.5-1 mcg/kg pediatric"),
            citations: &["16492826"],
            justification: "coronary perfusion pressure must be defended against induction hypotension",
            evidence_grade: EvidenceGrade::B,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_sets_cover_expected_procedures() {
        let tonsil: Vec<&str> = standard_set(Some("TONSILLECTOMY"))
            .iter()
            .map(|e| e.medication)
            .collect();
        assert_eq!(
            tonsil,
            vec!["PROPOFOL", "SEVOFLURANE", "FENTANYL", "DEXAMETHASONE", "ONDANSETRON"]
        );
        let cabg: Vec<&str> = standard_set(Some("CABG"))
            .iter()
            .map(|e| e.medication)
            .collect();
        assert!(cabg.contains(&"CISATRACURIUM"));
        assert!(!standard_set(None).is_empty());
    }

    #[test]
    fn pediatric_standard_doses_carry_weight_terms() {
        for set in [
            standard_set(Some("TONSILLECTOMY")),
            standard_set(Some("CABG")),
            standard_set(None),
        ] {
            for entry in set {
                assert!(
                    entry.dose_peds.contains("mg/kg")
                        || entry.dose_peds.contains("mcg/kg")
                        || entry.dose_peds.contains("{weight_kg}"),
                    "{} pediatric dose is not weight-based: {}",
                    entry.medication,
                    entry.dose_peds
                );
            }
        }
    }

    #[test]
    fn every_rule_carries_a_citation() {
        for rule in rules() {
            assert!(
                !rule.citations.is_empty(),
                "rule {} has no citations",
                rule.name
            );
        }
    }

    #[test]
    fn rule_medications_exist_in_the_ontology() {
        let ontology = crate::ontology::Ontology::builtin();
        for rule in rules() {
            let term = ontology
                .get(rule.medication)
                .unwrap_or_else(|| panic!("rule {} names unknown medication", rule.name));
            assert_eq!(term.term_type, crate::ontology::TermType::Medication);
        }
        for set in [
            standard_set(Some("TONSILLECTOMY")),
            standard_set(Some("CABG")),
            standard_set(None),
        ] {
            for entry in set {
                assert!(ontology.get(entry.medication).is_some());
            }
        }
    }
}
