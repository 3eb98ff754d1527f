//! Closed clinical vocabulary shared by the extractor, pooler, and decider.
//!
//! Terms are keyed by a stable uppercase token. Synonyms carry an explicit
//! tier so extraction confidence is reproducible data, not code.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::PeriopError;

pub mod seed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TermType {
    Outcome,
    RiskFactor,
    Medication,
    Demographic,
    Procedure,
}

impl TermType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outcome => "OUTCOME",
            Self::RiskFactor => "RISK_FACTOR",
            Self::Medication => "MEDICATION",
            Self::Demographic => "DEMOGRAPHIC",
            Self::Procedure => "PROCEDURE",
        }
    }

    pub fn from_flag(value: &str) -> Result<Self, PeriopError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "outcome" => Ok(Self::Outcome),
            "risk-factor" | "risk_factor" | "factor" => Ok(Self::RiskFactor),
            "medication" | "drug" => Ok(Self::Medication),
            "demographic" => Ok(Self::Demographic),
            "procedure" => Ok(Self::Procedure),
            _ => Err(PeriopError::invalid(
                "--type must be one of: outcome, risk-factor, medication, demographic, procedure",
            )),
        }
    }
}

/// Synonym tier. The tier fixes the base extraction confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynonymKind {
    /// The canonical plain label itself.
    Canonical,
    /// A listed clinical synonym or expanded abbreviation.
    Listed,
    /// A short, collision-prone abbreviation.
    Weak,
}

impl SynonymKind {
    pub fn base_confidence(self) -> f64 {
        match self {
            Self::Canonical => 0.95,
            Self::Listed => 0.85,
            Self::Weak => 0.70,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synonym {
    pub text: String,
    pub kind: SynonymKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyTerm {
    pub token: String,
    pub term_type: TermType,
    pub plain_label: String,
    #[serde(default)]
    pub synonyms: Vec<Synonym>,
    pub category: String,
    pub severity_weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// PROCEDURE terms: the case_type dimension of the context tuple.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_type: Option<String>,
    /// Time-windowed factors (e.g., RECENT_URI_2W): window length in days.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_window_days: Option<u32>,
    /// MEDICATION terms: lowercase generic name for recommendations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generic_name: Option<String>,
}

impl OntologyTerm {
    pub fn new(
        token: &str,
        term_type: TermType,
        plain_label: &str,
        category: &str,
        severity_weight: f64,
    ) -> Self {
        let canonical = Synonym {
            text: plain_label.to_ascii_lowercase(),
            kind: SynonymKind::Canonical,
        };
        Self {
            token: token.to_string(),
            term_type,
            plain_label: plain_label.to_string(),
            synonyms: vec![canonical],
            category: category.to_string(),
            severity_weight,
            parent: None,
            children: Vec::new(),
            case_type: None,
            time_window_days: None,
            generic_name: None,
        }
    }

    pub fn syn(mut self, text: &str) -> Self {
        self.synonyms.push(Synonym {
            text: text.to_ascii_lowercase(),
            kind: SynonymKind::Listed,
        });
        self
    }

    pub fn weak(mut self, text: &str) -> Self {
        self.synonyms.push(Synonym {
            text: text.to_ascii_lowercase(),
            kind: SynonymKind::Weak,
        });
        self
    }

    pub fn parent(mut self, token: &str) -> Self {
        self.parent = Some(token.to_string());
        self
    }

    pub fn case_type(mut self, case_type: &str) -> Self {
        self.case_type = Some(case_type.to_string());
        self
    }

    pub fn window_days(mut self, days: u32) -> Self {
        self.time_window_days = Some(days);
        self
    }

    pub fn generic(mut self, name: &str) -> Self {
        self.generic_name = Some(name.to_string());
        self
    }
}

/// Immutable term table plus the `synonym → token` secondary index the
/// extractor needs for O(1) lookup. Constructed once at process init and
/// shared read-only across requests.
#[derive(Debug)]
pub struct Ontology {
    terms: BTreeMap<String, OntologyTerm>,
    synonym_index: HashMap<String, String>,
}

impl Ontology {
    pub fn new(term_list: Vec<OntologyTerm>) -> Result<Self, PeriopError> {
        let mut terms: BTreeMap<String, OntologyTerm> = BTreeMap::new();
        let mut synonym_index: HashMap<String, String> = HashMap::new();

        for term in term_list {
            if term.token.is_empty() || term.token != term.token.to_ascii_uppercase() {
                return Err(PeriopError::Internal(format!(
                    "ontology token must be uppercase: {:?}",
                    term.token
                )));
            }
            if terms.contains_key(&term.token) {
                return Err(PeriopError::Internal(format!(
                    "duplicate ontology token: {}",
                    term.token
                )));
            }
            for syn in &term.synonyms {
                if syn.text != syn.text.to_lowercase() {
                    return Err(PeriopError::Internal(format!(
                        "synonym must be lowercase: {:?} on {}",
                        syn.text, term.token
                    )));
                }
                // First term wins; later duplicates would make extraction
                // ambiguous, so reject them outright.
                if let Some(existing) = synonym_index.get(&syn.text)
                    && existing != &term.token
                {
                    return Err(PeriopError::Internal(format!(
                        "synonym {:?} maps to both {existing} and {}",
                        syn.text, term.token
                    )));
                }
                synonym_index.insert(syn.text.clone(), term.token.clone());
            }
            terms.insert(term.token.clone(), term);
        }

        // Wire children from declared parents.
        let links: Vec<(String, String)> = terms
            .values()
            .filter_map(|t| t.parent.clone().map(|p| (p, t.token.clone())))
            .collect();
        for (parent, child) in links {
            let Some(parent_term) = terms.get_mut(&parent) else {
                return Err(PeriopError::Internal(format!(
                    "unknown parent {parent} on {child}"
                )));
            };
            parent_term.children.push(child);
        }

        Ok(Self {
            terms,
            synonym_index,
        })
    }

    /// The built-in clinical vocabulary.
    pub fn builtin() -> Self {
        Self::new(seed::terms()).expect("builtin ontology must satisfy invariants")
    }

    pub fn get(&self, token: &str) -> Option<&OntologyTerm> {
        self.terms.get(token)
    }

    pub fn resolve_synonym(&self, synonym: &str) -> Option<&OntologyTerm> {
        self.synonym_index
            .get(&synonym.to_lowercase())
            .and_then(|token| self.terms.get(token))
    }

    pub fn terms_of_type(&self, term_type: TermType) -> impl Iterator<Item = &OntologyTerm> {
        self.terms
            .values()
            .filter(move |t| t.term_type == term_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OntologyTerm> {
        self.terms.values()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}
