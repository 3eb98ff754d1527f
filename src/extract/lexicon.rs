//! Fixed lexical tables for the extractor: abbreviation expansions, negation
//! and temporal cues, and the demographics regexes.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Clinical abbreviations expanded during normalization. Keys and values are
/// lowercase; values may be multi-word.
pub fn abbreviations() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("htn", "hypertension"),
            ("dm", "diabetes"),
            ("sob", "dyspnea"),
            ("osa", "obstructive sleep apnea"),
            ("uri", "upper respiratory infection"),
            ("urti", "upper respiratory infection"),
            ("cad", "coronary artery disease"),
            ("chf", "congestive heart failure"),
            ("copd", "chronic obstructive pulmonary disease"),
            ("ckd", "chronic kidney disease"),
            ("esrd", "end-stage renal disease"),
            ("gerd", "gastroesophageal reflux"),
            ("mi", "myocardial infarction"),
            ("afib", "atrial fibrillation"),
            ("t&a", "tonsillectomy and adenoidectomy"),
            ("ent", "ear nose and throat"),
            ("gi", "gastrointestinal"),
            ("mh", "malignant hyperthermia"),
            ("ponv", "postoperative nausea"),
            ("hx", "history"),
        ])
    })
}

/// Cues that negate a following mention within the negation window.
pub const NEGATION_CUES: &[&str] = &["no", "denies", "denied", "without", "ruled", "negative"];

/// Number of tokens a negation cue reaches forward.
pub const NEGATION_WINDOW: usize = 5;

/// Cues that satisfy a time-windowed factor's recency requirement.
pub const TEMPORAL_CUES: &[&str] = &[
    "recent",
    "recently",
    "ago",
    "last",
    "yesterday",
    "today",
    "current",
    "ongoing",
];

/// Tokens a temporal cue may sit away from the match.
pub const TEMPORAL_WINDOW: usize = 10;

/// Confidence multiplier when a time-windowed factor has no temporal cue.
pub const MISSING_TEMPORAL_PENALTY: f64 = 0.6;

/// Confidence multiplier for a negated mention.
pub const NEGATION_PENALTY: f64 = 0.1;

pub fn age_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,3})\s*-?\s*(years?|yrs?|y/?o|months?|mos?)\b")
            .expect("age regex compiles")
    })
}

pub fn weight_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,3}(?:\.\d+)?)\s*kg\b").expect("weight regex compiles")
    })
}

pub fn urgency_emergent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(emergent|emergency|stat)\b").expect("regex compiles"))
}

pub fn urgency_urgent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(urgent|asap)\b").expect("regex compiles"))
}

pub fn sex_slash_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b([mf])/o\b").expect("regex compiles"))
}

/// Relative mentions like "3 months ago" near a time-windowed factor.
pub fn relative_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,3})\s*(days?|weeks?|months?|years?)\b")
            .expect("relative time regex compiles")
    })
}

pub const MALE_TOKENS: &[&str] = &["male", "man", "boy", "gentleman"];
pub const FEMALE_TOKENS: &[&str] = &["female", "woman", "girl", "lady"];

/// Age-band keywords used when no numeric age parses.
pub const AGE_KEYWORDS: &[(&str, f64)] = &[
    ("neonate", 0.05),
    ("infant", 0.5),
    ("toddler", 2.0),
    ("preschooler", 4.0),
    ("teenager", 15.0),
    ("adolescent", 15.0),
    ("adult", 40.0),
    ("elderly", 75.0),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbreviation_table_expands_common_shorthand() {
        let table = abbreviations();
        assert_eq!(table.get("htn"), Some(&"hypertension"));
        assert_eq!(table.get("uri"), Some(&"upper respiratory infection"));
        assert_eq!(table.get("ckd"), Some(&"chronic kidney disease"));
        assert_eq!(table.get("mi"), Some(&"myocardial infarction"));
        assert_eq!(table.get("afib"), Some(&"atrial fibrillation"));
        assert_eq!(table.get("t&a"), Some(&"tonsillectomy and adenoidectomy"));
        assert_eq!(table.get("ent"), Some(&"ear nose and throat"));
        assert_eq!(table.get("gi"), Some(&"gastrointestinal"));
    }

    #[test]
    fn age_regex_matches_hyphenated_and_shorthand_forms() {
        let re = age_regex();
        for text in ["5-year-old", "5 year old", "5yo", "5 y/o", "18 months"] {
            assert!(re.is_match(text), "age regex should match {text:?}");
        }
        assert!(!re.is_match("otherwise healthy"));
    }

    #[test]
    fn weight_regex_captures_decimal_kilograms() {
        let caps = weight_regex().captures("weight 18.4 kg").expect("match");
        assert_eq!(&caps[1], "18.4");
    }

    #[test]
    fn urgency_regexes_do_not_overlap() {
        assert!(urgency_emergent_regex().is_match("emergency laparotomy"));
        assert!(urgency_urgent_regex().is_match("urgent washout"));
        assert!(!urgency_emergent_regex().is_match("urgent washout"));
    }
}
