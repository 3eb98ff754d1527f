//! Rule-based HPI extraction: demographics plus a confidence-weighted factor
//! set over the closed ontology.
//!
//! The pipeline is pure and single-threaded per input: tokenize with byte
//! offsets, expand abbreviations, read demographics, then run the factor,
//! negation, and temporal passes as separate steps over the token stream so
//! each pass stays testable on its own.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::evidence::Urgency;
use crate::ontology::{Ontology, SynonymKind, TermType};

pub mod lexicon;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgeBand {
    #[serde(rename = "AGE_LT_1")]
    AgeLt1,
    #[serde(rename = "AGE_1_5")]
    Age1_5,
    #[serde(rename = "AGE_6_12")]
    Age6_12,
    #[serde(rename = "AGE_13_17")]
    Age13_17,
    #[serde(rename = "AGE_18_64")]
    Age18_64,
    #[serde(rename = "AGE_GE_65")]
    AgeGe65,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl AgeBand {
    pub fn from_years(years: f64) -> Self {
        if years < 0.0 {
            Self::Unknown
        } else if years < 1.0 {
            Self::AgeLt1
        } else if years <= 5.0 {
            Self::Age1_5
        } else if years <= 12.0 {
            Self::Age6_12
        } else if years < 18.0 {
            Self::Age13_17
        } else if years < 65.0 {
            Self::Age18_64
        } else {
            Self::AgeGe65
        }
    }

    /// Ontology token for the derived factor, when the band is known.
    pub fn token(self) -> Option<&'static str> {
        match self {
            Self::AgeLt1 => Some("AGE_LT_1"),
            Self::Age1_5 => Some("AGE_1_5"),
            Self::Age6_12 => Some("AGE_6_12"),
            Self::Age13_17 => Some("AGE_13_17"),
            Self::Age18_64 => Some("AGE_18_64"),
            Self::AgeGe65 => Some("AGE_GE_65"),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    pub fn token(self) -> &'static str {
        match self {
            Self::Male => "SEX_MALE",
            Self::Female => "SEX_FEMALE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Demographics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_years: Option<f64>,
    pub age_band: AgeBand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex: Option<Sex>,
    /// Ontology PROCEDURE token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure: Option<String>,
    pub urgency: Urgency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f64>,
    /// Conflicting numeric ages were found; band stays UNKNOWN.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub age_ambiguous: bool,
}

impl Default for Demographics {
    fn default() -> Self {
        Self {
            age_years: None,
            age_band: AgeBand::Unknown,
            sex: None,
            procedure: None,
            urgency: Urgency::Elective,
            weight_kg: None,
            age_ambiguous: false,
        }
    }
}

/// Byte span into the original HPI text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFactor {
    pub token: String,
    pub plain_label: String,
    pub confidence: f64,
    pub evidence_text: Vec<EvidenceSpan>,
    pub category: String,
    pub severity_weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub demographics: Demographics,
    pub factors: Vec<ExtractedFactor>,
}

/// Word token with byte offsets into the original text.
#[derive(Debug, Clone)]
struct Token {
    text: String,
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            if start.is_none() {
                start = Some(idx);
            }
        } else if let Some(s) = start.take() {
            tokens.push(Token {
                text: text[s..idx].to_lowercase(),
                start: s,
                end: idx,
            });
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            text: text[s..].to_lowercase(),
            start: s,
            end: text.len(),
        });
    }
    tokens
}

/// Expand abbreviations in place. A multi-word expansion yields several tokens
/// sharing the source token's span, so evidence spans always index the
/// original text.
///
/// Shorthand written with `&` or `/` (e.g. "t&a") tokenizes as separate
/// words; adjacent tokens are re-joined first when the composite is an
/// abbreviation-table key.
fn expand_abbreviations(tokens: Vec<Token>, text: &str) -> Vec<Token> {
    let table = lexicon::abbreviations();

    let mut merged: Vec<Token> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(prev) = merged.last()
            && let Some(sep) = text.get(prev.end..token.start)
            && (sep == "&" || sep == "/")
        {
            let key = format!("{}{sep}{}", prev.text, token.text);
            if table.contains_key(key.as_str()) {
                let prev = merged.pop().expect("joined token has a predecessor");
                merged.push(Token {
                    text: key,
                    start: prev.start,
                    end: token.end,
                });
                continue;
            }
        }
        merged.push(token);
    }

    let mut out = Vec::with_capacity(merged.len());
    for token in merged {
        match table.get(token.text.as_str()) {
            Some(expansion) => {
                for word in synonym_words(expansion) {
                    out.push(Token {
                        text: word,
                        start: token.start,
                        end: token.end,
                    });
                }
            }
            None => out.push(token),
        }
    }
    out
}

#[derive(Debug, Clone)]
struct SynonymPattern {
    words: Vec<String>,
    term_token: String,
    kind: SynonymKind,
}

fn synonym_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_patterns(ontology: &Ontology, term_type: TermType) -> PatternSet {
    let table = lexicon::abbreviations();
    let mut patterns = Vec::new();
    for term in ontology.terms_of_type(term_type) {
        for syn in &term.synonyms {
            // Run synonyms through the same expansion as the token stream so
            // a synonym written with an abbreviation still matches.
            let words: Vec<String> = synonym_words(&syn.text)
                .into_iter()
                .flat_map(|word| match table.get(word.as_str()) {
                    Some(expansion) => synonym_words(expansion),
                    None => vec![word],
                })
                .collect();
            if words.is_empty() {
                continue;
            }
            patterns.push(SynonymPattern {
                words,
                term_token: term.token.clone(),
                kind: syn.kind,
            });
        }
    }
    // Longest synonym wins at any given position.
    patterns.sort_by(|a, b| {
        b.words
            .len()
            .cmp(&a.words.len())
            .then_with(|| a.term_token.cmp(&b.term_token))
    });
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, pattern) in patterns.iter().enumerate() {
        index.entry(pattern.words[0].clone()).or_default().push(i);
    }
    PatternSet { patterns, index }
}

#[derive(Debug)]
struct PatternSet {
    patterns: Vec<SynonymPattern>,
    index: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Clone)]
struct SynonymMatch {
    term_token: String,
    kind: SynonymKind,
    /// Token positions in the normalized stream.
    position: usize,
    width: usize,
    span: EvidenceSpan,
}

impl PatternSet {
    fn scan(&self, tokens: &[Token], original: &str) -> Vec<SynonymMatch> {
        let mut matches = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let Some(candidates) = self.index.get(tokens[i].text.as_str()) else {
                i += 1;
                continue;
            };
            let mut advanced = false;
            for &p in candidates {
                let pattern = &self.patterns[p];
                let width = pattern.words.len();
                if i + width > tokens.len() {
                    continue;
                }
                if pattern
                    .words
                    .iter()
                    .zip(&tokens[i..i + width])
                    .all(|(w, t)| *w == t.text)
                {
                    let start = tokens[i].start;
                    let end = tokens[i + width - 1].end;
                    matches.push(SynonymMatch {
                        term_token: pattern.term_token.clone(),
                        kind: pattern.kind,
                        position: i,
                        width,
                        span: EvidenceSpan {
                            text: original[start..end].to_string(),
                            start,
                            end,
                        },
                    });
                    i += width;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                i += 1;
            }
        }
        matches
    }
}

/// Extractor over a shared read-only ontology. Cheap to call concurrently;
/// pattern tables are built once at construction.
pub struct Extractor {
    ontology: Arc<Ontology>,
    factors: PatternSet,
    procedures: PatternSet,
}

impl Extractor {
    pub fn new(ontology: Arc<Ontology>) -> Self {
        let factors = build_patterns(&ontology, TermType::RiskFactor);
        let procedures = build_patterns(&ontology, TermType::Procedure);
        Self {
            ontology,
            factors,
            procedures,
        }
    }

    pub fn extract(&self, text: &str) -> Extraction {
        if text.trim().is_empty() {
            return Extraction {
                demographics: Demographics::default(),
                factors: Vec::new(),
            };
        }

        let tokens = expand_abbreviations(tokenize(text), text);
        let demographics = self.demographics(text, &tokens);
        let factors = self.factor_pass(text, &tokens, &demographics);

        Extraction {
            demographics,
            factors,
        }
    }

    fn demographics(&self, text: &str, tokens: &[Token]) -> Demographics {
        let mut demo = Demographics::default();

        // Age: first numeric match wins; conflicting bands leave UNKNOWN.
        let mut bands: Vec<(f64, AgeBand)> = Vec::new();
        for caps in lexicon::age_regex().captures_iter(text) {
            let Ok(value) = caps[1].parse::<f64>() else {
                continue;
            };
            let unit = caps[2].to_ascii_lowercase();
            let years = if unit.starts_with("mo") {
                value / 12.0
            } else {
                value
            };
            bands.push((years, AgeBand::from_years(years)));
        }
        match bands.as_slice() {
            [] => {
                // Keyword bands when no numeric age parses.
                for (keyword, representative_years) in lexicon::AGE_KEYWORDS {
                    if tokens.iter().any(|t| t.text == *keyword) {
                        demo.age_band = AgeBand::from_years(*representative_years);
                        break;
                    }
                }
            }
            [(years, band), rest @ ..] => {
                if rest.iter().all(|(_, b)| b == band) {
                    demo.age_years = Some(*years);
                    demo.age_band = *band;
                } else {
                    demo.age_ambiguous = true;
                }
            }
        }

        // Sex: explicit tokens, then the m/o-f/o shorthand.
        demo.sex = tokens.iter().find_map(|t| {
            if lexicon::MALE_TOKENS.contains(&t.text.as_str()) {
                Some(Sex::Male)
            } else if lexicon::FEMALE_TOKENS.contains(&t.text.as_str()) {
                Some(Sex::Female)
            } else {
                None
            }
        });
        if demo.sex.is_none()
            && let Some(caps) = lexicon::sex_slash_regex().captures(text)
        {
            demo.sex = match caps[1].to_ascii_lowercase().as_str() {
                "m" => Some(Sex::Male),
                "f" => Some(Sex::Female),
                _ => None,
            };
        }

        // Procedure: earliest span wins.
        demo.procedure = self
            .procedures
            .scan(tokens, text)
            .into_iter()
            .min_by(|a, b| {
                a.span
                    .start
                    .cmp(&b.span.start)
                    .then_with(|| a.term_token.cmp(&b.term_token))
            })
            .map(|m| m.term_token);

        demo.urgency = if lexicon::urgency_emergent_regex().is_match(text) {
            Urgency::Emergent
        } else if lexicon::urgency_urgent_regex().is_match(text) {
            Urgency::Urgent
        } else {
            Urgency::Elective
        };

        demo.weight_kg = lexicon::weight_regex()
            .captures(text)
            .and_then(|caps| caps[1].parse().ok());

        demo
    }

    /// True when a negation cue sits within the window before the match.
    fn negated(tokens: &[Token], position: usize) -> bool {
        let from = position.saturating_sub(lexicon::NEGATION_WINDOW);
        tokens[from..position]
            .iter()
            .any(|t| lexicon::NEGATION_CUES.contains(&t.text.as_str()))
    }

    /// Temporal pass for time-windowed factors. Returns `None` to drop the
    /// factor (an explicit mention outside the window), otherwise the
    /// confidence multiplier.
    fn temporal_modifier(
        tokens: &[Token],
        position: usize,
        width: usize,
        window_days: u32,
    ) -> Option<f64> {
        let from = position.saturating_sub(lexicon::TEMPORAL_WINDOW);
        let to = (position + width + lexicon::TEMPORAL_WINDOW).min(tokens.len());
        let window = &tokens[from..to];

        let mut cue_found = false;
        for (i, token) in window.iter().enumerate() {
            let days = match token.text.as_str() {
                "day" | "days" => Some(1.0),
                "week" | "weeks" => Some(7.0),
                "month" | "months" => Some(30.0),
                "year" | "years" => Some(365.0),
                _ => None,
            };
            if let Some(per_unit) = days {
                let count = i
                    .checked_sub(1)
                    .and_then(|prev| window[prev].text.parse::<f64>().ok())
                    .unwrap_or(1.0);
                if count * per_unit > f64::from(window_days) {
                    return None;
                }
                cue_found = true;
            } else if lexicon::TEMPORAL_CUES.contains(&token.text.as_str()) {
                cue_found = true;
            }
        }

        Some(if cue_found {
            1.0
        } else {
            lexicon::MISSING_TEMPORAL_PENALTY
        })
    }

    fn factor_pass(
        &self,
        text: &str,
        tokens: &[Token],
        demographics: &Demographics,
    ) -> Vec<ExtractedFactor> {
        // Dedup: highest confidence wins per token, all spans retained.
        let mut by_token: BTreeMap<String, ExtractedFactor> = BTreeMap::new();
        let mut add = |factor: ExtractedFactor| match by_token.get_mut(&factor.token) {
            Some(existing) => {
                existing.evidence_text.extend(factor.evidence_text);
                if factor.confidence > existing.confidence {
                    existing.confidence = factor.confidence;
                }
            }
            None => {
                by_token.insert(factor.token.clone(), factor);
            }
        };

        for m in self.factors.scan(tokens, text) {
            let Some(term) = self.ontology.get(&m.term_token) else {
                continue;
            };
            let mut confidence = m.kind.base_confidence();
            if Self::negated(tokens, m.position) {
                confidence *= lexicon::NEGATION_PENALTY;
            }
            if let Some(window_days) = term.time_window_days {
                match Self::temporal_modifier(tokens, m.position, m.width, window_days) {
                    Some(modifier) => confidence *= modifier,
                    None => continue,
                }
            }
            add(ExtractedFactor {
                token: term.token.clone(),
                plain_label: term.plain_label.clone(),
                confidence,
                evidence_text: vec![m.span],
                category: term.category.clone(),
                severity_weight: term.severity_weight,
            });
        }

        // Demographic-derived factors at full confidence.
        let mut derived: Vec<&'static str> = Vec::new();
        if !demographics.age_ambiguous
            && let Some(token) = demographics.age_band.token()
        {
            derived.push(token);
        }
        if let Some(sex) = demographics.sex {
            derived.push(sex.token());
        }
        for token in derived {
            if let Some(term) = self.ontology.get(token) {
                add(ExtractedFactor {
                    token: term.token.clone(),
                    plain_label: term.plain_label.clone(),
                    confidence: 1.0,
                    evidence_text: Vec::new(),
                    category: term.category.clone(),
                    severity_weight: term.severity_weight,
                });
            }
        }

        by_token.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        Extractor::new(Arc::new(Ontology::builtin()))
    }

    fn factor_tokens(extraction: &Extraction) -> Vec<&str> {
        extraction
            .factors
            .iter()
            .map(|f| f.token.as_str())
            .collect()
    }

    fn confident_factor<'a>(extraction: &'a Extraction, token: &str) -> &'a ExtractedFactor {
        extraction
            .factors
            .iter()
            .find(|f| f.token == token && f.confidence > 0.5)
            .unwrap_or_else(|| panic!("factor {token} should be extracted confidently"))
    }

    #[test]
    fn empty_input_yields_unknown_demographics_without_error() {
        let out = extractor().extract("   ");
        assert_eq!(out.demographics.age_band, AgeBand::Unknown);
        assert!(out.factors.is_empty());
    }

    #[test]
    fn pediatric_ent_hpi_extracts_factors_and_demographics() {
        let out = extractor().extract(
            "5-year-old male presenting for tonsillectomy. History significant for asthma \
             and recent URI 2 weeks ago.",
        );
        assert_eq!(out.demographics.age_years, Some(5.0));
        assert_eq!(out.demographics.age_band, AgeBand::Age1_5);
        assert_eq!(out.demographics.sex, Some(Sex::Male));
        assert_eq!(out.demographics.procedure.as_deref(), Some("TONSILLECTOMY"));
        assert_eq!(out.demographics.urgency, Urgency::Elective);

        let tokens = factor_tokens(&out);
        for expected in ["ASTHMA", "RECENT_URI_2W", "AGE_1_5", "SEX_MALE"] {
            assert!(tokens.contains(&expected), "missing {expected} in {tokens:?}");
        }
        let uri = confident_factor(&out, "RECENT_URI_2W");
        assert!(uri.confidence >= 0.85, "temporal cue keeps confidence high");
    }

    #[test]
    fn abbreviations_expand_before_matching() {
        let out = extractor()
            .extract("68-year-old male with CAD, diabetes, HTN, CKD stage 4 for CABG.");
        assert_eq!(out.demographics.age_band, AgeBand::AgeGe65);
        assert_eq!(out.demographics.procedure.as_deref(), Some("CABG"));
        let tokens = factor_tokens(&out);
        for expected in ["CAD", "DIABETES", "HYPERTENSION", "CKD", "AGE_GE_65", "SEX_MALE"] {
            assert!(tokens.contains(&expected), "missing {expected} in {tokens:?}");
        }
    }

    #[test]
    fn ampersand_shorthand_joins_before_expansion() {
        let out = extractor().extract("4-year-old girl scheduled for T&A next month.");
        assert_eq!(out.demographics.procedure.as_deref(), Some("TONSILLECTOMY"));
        assert_eq!(out.demographics.age_band, AgeBand::Age1_5);
    }

    #[test]
    fn cardiac_history_abbreviations_resolve_to_factors() {
        let out = extractor().extract("68-year-old male with prior MI and afib for CABG.");
        let tokens = factor_tokens(&out);
        assert!(tokens.contains(&"MI_HISTORY"), "missing MI_HISTORY in {tokens:?}");
        assert!(tokens.contains(&"AFIB"), "missing AFIB in {tokens:?}");
        let mi = confident_factor(&out, "MI_HISTORY");
        assert!((mi.confidence - 0.95).abs() < 1e-9, "\"prior MI\" hits the canonical label");
    }

    #[test]
    fn negated_mentions_are_suppressed() {
        let out = extractor().extract("Patient denies asthma, no history of smoking.");
        for factor in &out.factors {
            if factor.token == "ASTHMA" || factor.token == "SMOKING_HISTORY" {
                assert!(
                    factor.confidence < 0.5,
                    "{} should be negated, got {}",
                    factor.token,
                    factor.confidence
                );
            }
        }
    }

    #[test]
    fn adult_keyword_infers_band_without_numeric_age() {
        let out = extractor().extract("Adult for elective hernia repair, otherwise healthy.");
        assert_eq!(out.demographics.age_band, AgeBand::Age18_64);
        assert_eq!(out.demographics.age_years, None);
        assert_eq!(out.demographics.procedure.as_deref(), Some("HERNIA_REPAIR"));
        assert!(factor_tokens(&out).contains(&"AGE_18_64"));
    }

    #[test]
    fn stale_temporal_mention_drops_time_windowed_factor() {
        let out = extractor().extract("Patient had URI 3 months ago.");
        assert!(
            !factor_tokens(&out).contains(&"RECENT_URI_2W"),
            "URI outside its window must be dropped"
        );
    }

    #[test]
    fn uri_without_temporal_cue_is_penalized_not_dropped() {
        let out = extractor().extract("History of URI noted on intake.");
        let uri = out
            .factors
            .iter()
            .find(|f| f.token == "RECENT_URI_2W")
            .expect("URI factor should survive without a cue");
        assert!((uri.confidence - 0.85 * 0.6).abs() < 1e-9);
    }

    #[test]
    fn duplicate_mentions_dedup_to_highest_confidence_with_all_spans() {
        let out = extractor().extract("Asthma on admission. Known asthmatic, asthma well controlled.");
        let asthma: Vec<_> = out.factors.iter().filter(|f| f.token == "ASTHMA").collect();
        assert_eq!(asthma.len(), 1, "duplicates must collapse");
        assert!(asthma[0].evidence_text.len() >= 2);
        assert!((asthma[0].confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn evidence_spans_index_the_original_text() {
        let text = "Hx of HTN and reflux.";
        let out = extractor().extract(text);
        let reflux = confident_factor(&out, "GERD");
        let span = &reflux.evidence_text[0];
        assert_eq!(&text[span.start..span.end], span.text);
        assert_eq!(span.text, "reflux");
        // The HTN span covers the abbreviation as written.
        let htn = confident_factor(&out, "HYPERTENSION");
        assert_eq!(htn.evidence_text[0].text, "HTN");
    }

    #[test]
    fn urgency_keywords_map_to_levels() {
        let urgency = |text: &str| extractor().extract(text).demographics.urgency;
        assert_eq!(urgency("emergent exploratory laparotomy"), Urgency::Emergent);
        assert_eq!(urgency("urgent appendectomy"), Urgency::Urgent);
        assert_eq!(urgency("elective hernia repair"), Urgency::Elective);
    }

    #[test]
    fn months_convert_to_fractional_years() {
        let out = extractor().extract("9 month old girl for myringotomy");
        assert_eq!(out.demographics.age_band, AgeBand::AgeLt1);
        assert_eq!(out.demographics.sex, Some(Sex::Female));
    }

    #[test]
    fn conflicting_ages_leave_band_unknown() {
        let out = extractor().extract("5 year old, chart also lists 45 years");
        assert_eq!(out.demographics.age_band, AgeBand::Unknown);
        assert!(out.demographics.age_ambiguous);
        assert!(
            !factor_tokens(&out).iter().any(|t| t.starts_with("AGE_")),
            "no derived age factor on ambiguity"
        );
    }

    #[test]
    fn weight_is_read_in_kilograms() {
        let out = extractor().extract("Toddler, 14.5 kg, for ear tubes");
        assert_eq!(out.demographics.weight_kg, Some(14.5));
        assert_eq!(out.demographics.procedure.as_deref(), Some("MYRINGOTOMY"));
    }
}
