//! Built-in clinical vocabulary.
//!
//! Severity weights are clinical-importance priors used for factor ranking in
//! rendered output; they do not enter the pooled arithmetic.

use super::{OntologyTerm, TermType};

fn outcome(token: &str, label: &str, category: &str, weight: f64) -> OntologyTerm {
    OntologyTerm::new(token, TermType::Outcome, label, category, weight)
}

fn factor(token: &str, label: &str, category: &str, weight: f64) -> OntologyTerm {
    OntologyTerm::new(token, TermType::RiskFactor, label, category, weight)
}

fn medication(token: &str, label: &str, category: &str) -> OntologyTerm {
    OntologyTerm::new(token, TermType::Medication, label, category, 0.0)
        .generic(&label.to_ascii_lowercase())
}

fn demographic(token: &str, label: &str) -> OntologyTerm {
    OntologyTerm::new(token, TermType::Demographic, label, "demographic", 0.0)
}

fn procedure(token: &str, label: &str, case_type: &str) -> OntologyTerm {
    OntologyTerm::new(token, TermType::Procedure, label, "procedure", 0.0).case_type(case_type)
}

pub fn terms() -> Vec<OntologyTerm> {
    vec![
        // ── Outcomes ────────────────────────────────────────────────────────
        outcome("LARYNGOSPASM", "laryngospasm", "airway", 3.0),
        outcome("BRONCHOSPASM", "bronchospasm", "respiratory", 2.5),
        outcome("PONV", "postoperative nausea and vomiting", "gi", 1.0).syn("postop nausea"),
        outcome("HYPOTENSION", "intraoperative hypotension", "cardiac", 2.0),
        outcome("EMERGENCE_DELIRIUM", "emergence delirium", "neuro", 1.0)
            .syn("emergence agitation"),
        outcome("ASPIRATION", "pulmonary aspiration", "airway", 3.0),
        outcome("ACUTE_KIDNEY_INJURY", "acute kidney injury", "renal", 2.0).weak("aki"),
        outcome("MYOCARDIAL_INJURY", "perioperative myocardial injury", "cardiac", 3.0)
            .syn("myocardial injury"),
        // ── Risk factors ────────────────────────────────────────────────────
        factor("ASTHMA", "asthma", "respiratory", 2.0)
            .syn("reactive airway disease")
            .weak("rad"),
        factor(
            "RECENT_URI_2W",
            "recent upper respiratory infection",
            "respiratory",
            2.0,
        )
        .syn("upper respiratory infection")
        .weak("uri")
        .window_days(14),
        factor("SMOKING_HISTORY", "smoking", "respiratory", 1.5)
            .syn("smoker")
            .syn("tobacco use")
            .syn("cigarette use"),
        factor("SMOKING_HEAVY", "heavy smoking", "respiratory", 2.0)
            .syn("pack a day")
            .parent("SMOKING_HISTORY"),
        factor("OSA", "obstructive sleep apnea", "airway", 2.5).syn("sleep apnea"),
        factor("OBESITY", "obesity", "metabolic", 1.5)
            .syn("obese")
            .syn("morbid obesity"),
        factor("GERD", "gastroesophageal reflux", "gi", 1.5)
            .syn("reflux")
            .syn("heartburn"),
        factor("CAD", "coronary artery disease", "cardiac", 2.5).syn("ischemic heart disease"),
        factor("MI_HISTORY", "prior myocardial infarction", "cardiac", 2.5)
            .syn("myocardial infarction")
            .syn("heart attack"),
        factor("AFIB", "atrial fibrillation", "cardiac", 2.0).syn("irregular heart rhythm"),
        factor("DIABETES", "diabetes", "metabolic", 1.5)
            .syn("diabetes mellitus")
            .syn("diabetic"),
        factor("HYPERTENSION", "hypertension", "cardiac", 1.5).syn("high blood pressure"),
        factor("CKD", "chronic kidney disease", "renal", 2.5)
            .syn("chronic renal insufficiency")
            .syn("renal insufficiency"),
        factor("ESRD", "end-stage renal disease", "renal", 3.0)
            .syn("dialysis dependent")
            .syn("dialysis")
            .parent("CKD"),
        factor("CHF", "congestive heart failure", "cardiac", 2.5)
            .syn("heart failure")
            .syn("reduced ejection fraction"),
        factor(
            "COPD",
            "chronic obstructive pulmonary disease",
            "respiratory",
            2.0,
        )
        .syn("emphysema")
        .syn("chronic bronchitis"),
        factor("PREMATURITY", "prematurity", "neonatal", 2.0)
            .syn("premature birth")
            .syn("former preemie")
            .syn("preterm"),
        factor(
            "MALIGNANT_HYPERTHERMIA_HISTORY",
            "malignant hyperthermia",
            "metabolic",
            3.0,
        )
        .syn("mh history")
        .weak("mh"),
        factor("SEIZURE_DISORDER", "seizure disorder", "neuro", 1.5)
            .syn("epilepsy")
            .syn("seizures")
            .syn("seizure"),
        factor("DIFFICULT_AIRWAY_HISTORY", "difficult airway", "airway", 3.0)
            .syn("difficult intubation")
            .syn("difficult mask ventilation"),
        factor("ANEMIA", "anemia", "heme", 1.5).syn("low hemoglobin"),
        factor("PONV_HISTORY", "prior postoperative nausea", "gi", 1.0)
            .syn("history of ponv")
            .syn("motion sickness"),
        // ── Demographic-derived factors ─────────────────────────────────────
        demographic("AGE_LT_1", "age under 1 year"),
        demographic("AGE_1_5", "age 1-5 years"),
        demographic("AGE_6_12", "age 6-12 years"),
        demographic("AGE_13_17", "age 13-17 years"),
        demographic("AGE_18_64", "age 18-64 years"),
        demographic("AGE_GE_65", "age 65 years or older"),
        demographic("SEX_MALE", "male sex"),
        demographic("SEX_FEMALE", "female sex"),
        // ── Medications ─────────────────────────────────────────────────────
        medication("PROPOFOL", "propofol", "induction"),
        medication("KETAMINE", "ketamine", "induction"),
        medication("MIDAZOLAM", "midazolam", "premedication"),
        medication("SEVOFLURANE", "sevoflurane", "volatile"),
        medication("DESFLURANE", "desflurane", "volatile"),
        medication("FENTANYL", "fentanyl", "opioid"),
        medication("REMIFENTANIL", "remifentanil", "opioid"),
        medication("DEXAMETHASONE", "dexamethasone", "antiemetic"),
        medication("ONDANSETRON", "ondansetron", "antiemetic"),
        medication("DROPERIDOL", "droperidol", "antiemetic"),
        medication("ALBUTEROL", "albuterol", "bronchodilator").syn("salbutamol"),
        medication("SUCCINYLCHOLINE", "succinylcholine", "paralytic").syn("suxamethonium"),
        medication("ROCURONIUM", "rocuronium", "paralytic"),
        medication("CISATRACURIUM", "cisatracurium", "paralytic"),
        medication("DEXMEDETOMIDINE", "dexmedetomidine", "sedative").syn("precedex"),
        medication("ATROPINE", "atropine", "anticholinergic"),
        medication("NITROGLYCERIN", "nitroglycerin", "vasodilator"),
        medication("PHENYLEPHRINE", "phenylephrine", "vasopressor"),
        medication("DANTROLENE", "dantrolene", "rescue"),
        medication("NSAID", "nsaid", "analgesic")
            .syn("nsaids")
            .syn("ketorolac")
            .syn("ibuprofen"),
        // ── Procedures ──────────────────────────────────────────────────────
        procedure("TONSILLECTOMY", "tonsillectomy", "ENT")
            .syn("tonsillectomy and adenoidectomy"),
        procedure("ADENOIDECTOMY", "adenoidectomy", "ENT"),
        procedure("MYRINGOTOMY", "myringotomy", "ENT")
            .syn("ear tubes")
            .syn("tympanostomy"),
        procedure("CABG", "coronary artery bypass graft", "CARDIAC")
            .syn("coronary artery bypass grafting")
            .syn("cardiac bypass")
            .weak("cabg"),
        procedure("HERNIA_REPAIR", "hernia repair", "GENERAL")
            .syn("inguinal hernia repair")
            .syn("herniorrhaphy"),
        procedure("APPENDECTOMY", "appendectomy", "GENERAL").syn("appy"),
        procedure("BRONCHOSCOPY", "bronchoscopy", "AIRWAY"),
    ]
}
