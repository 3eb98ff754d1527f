//! Evidence store schema: source papers, per-study estimates, context labels,
//! and the pooled rows produced by the meta-analysis engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PeriopError;

pub mod seed;
pub mod store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Population {
    Pediatric,
    Adult,
    Obstetric,
    Mixed,
}

impl Population {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pediatric => "PEDIATRIC",
            Self::Adult => "ADULT",
            Self::Obstetric => "OBSTETRIC",
            Self::Mixed => "MIXED",
        }
    }
}

impl FromStr for Population {
    type Err = PeriopError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PEDIATRIC" => Ok(Self::Pediatric),
            "ADULT" => Ok(Self::Adult),
            "OBSTETRIC" => Ok(Self::Obstetric),
            "MIXED" => Ok(Self::Mixed),
            other => Err(PeriopError::invalid(format!(
                "Unknown population {other:?}. Expected PEDIATRIC, ADULT, OBSTETRIC, or MIXED"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Elective,
    Urgent,
    Emergent,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Elective => "ELECTIVE",
            Self::Urgent => "URGENT",
            Self::Emergent => "EMERGENT",
        }
    }
}

impl FromStr for Urgency {
    type Err = PeriopError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ELECTIVE" => Ok(Self::Elective),
            "URGENT" => Ok(Self::Urgent),
            "EMERGENT" => Ok(Self::Emergent),
            other => Err(PeriopError::invalid(format!(
                "Unknown urgency {other:?}. Expected ELECTIVE, URGENT, or EMERGENT"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudyDesign {
    Rct,
    MetaAnalysis,
    Cohort,
    CaseControl,
    CaseSeries,
    Other,
}

/// A/B/C/D quality tier. Ordering: A is best, D is worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EvidenceGrade {
    A,
    B,
    C,
    D,
}

impl EvidenceGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }

    /// One level worse; D saturates.
    pub fn decayed(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::C,
            Self::C => Self::D,
            Self::D => Self::D,
        }
    }

    /// Deterministic grade from design and size (spec derivation rule).
    pub fn derive(design: StudyDesign, n_total: u64) -> Self {
        match design {
            StudyDesign::MetaAnalysis => Self::A,
            StudyDesign::Rct if n_total >= 500 => Self::A,
            StudyDesign::Rct => Self::B,
            StudyDesign::Cohort if n_total >= 200 => Self::B,
            StudyDesign::Cohort | StudyDesign::CaseControl => Self::C,
            StudyDesign::CaseSeries | StudyDesign::Other => Self::D,
        }
    }
}

impl FromStr for EvidenceGrade {
    type Err = PeriopError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            _ => Err(PeriopError::invalid(
                "evidence grade must be one of: A, B, C, D",
            )),
        }
    }
}

/// A source study record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub pmid: String,
    pub title: String,
    pub year: u16,
    pub design: StudyDesign,
    pub n_total: u64,
    pub population: Population,
    /// Free label, e.g. 24h / 30d / inhospital.
    pub time_horizon: String,
    pub evidence_grade: EvidenceGrade,
    pub quality_score: f64,
}

impl Paper {
    pub fn validate(&self) -> Result<(), PeriopError> {
        if self.pmid.trim().is_empty() || !self.pmid.chars().all(|c| c.is_ascii_digit()) {
            return Err(PeriopError::invalid(format!(
                "pmid must be numeric: {:?}",
                self.pmid
            )));
        }
        if !(0.0..=1.0).contains(&self.quality_score) {
            return Err(PeriopError::invalid(format!(
                "quality_score must be in [0,1]: {} (pmid {})",
                self.quality_score, self.pmid
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Measure {
    Incidence,
    Or,
    Rr,
    Hr,
}

/// One extracted quantitative finding. `modifier_token = None` means a
/// baseline incidence row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    pub id: u64,
    pub pmid: String,
    pub outcome_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifier_token: Option<String>,
    pub measure: Measure,
    pub estimate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_high: Option<f64>,
    pub adjusted: bool,
    pub population: Population,
    pub context_label: String,
    pub quality_weight: f64,
    pub extraction_confidence: f64,
    /// Denominator for incidence rows, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u64>,
}

impl Estimate {
    pub fn validate(&self) -> Result<(), PeriopError> {
        match (&self.modifier_token, self.measure) {
            (None, Measure::Incidence) => {
                if !(0.0..=1.0).contains(&self.estimate) {
                    return Err(PeriopError::invalid(format!(
                        "baseline incidence must be in [0,1]: {} (estimate {})",
                        self.estimate, self.id
                    )));
                }
            }
            (None, _) => {
                return Err(PeriopError::invalid(format!(
                    "estimate {} has no modifier but measure is not INCIDENCE",
                    self.id
                )));
            }
            (Some(_), Measure::Incidence) => {
                return Err(PeriopError::invalid(format!(
                    "estimate {} has a modifier but measure INCIDENCE",
                    self.id
                )));
            }
            (Some(_), _) => {
                if self.estimate <= 0.0 {
                    return Err(PeriopError::invalid(format!(
                        "effect estimate must be > 0: {} (estimate {})",
                        self.estimate, self.id
                    )));
                }
            }
        }
        if let (Some(lo), Some(hi)) = (self.ci_low, self.ci_high)
            && lo > hi
        {
            return Err(PeriopError::invalid(format!(
                "ci_low > ci_high on estimate {}",
                self.id
            )));
        }
        if !(self.quality_weight > 0.0 && self.quality_weight <= 1.0) {
            return Err(PeriopError::invalid(format!(
                "quality_weight must be in (0,1]: estimate {}",
                self.id
            )));
        }
        if !(self.extraction_confidence > 0.0 && self.extraction_confidence <= 1.0) {
            return Err(PeriopError::invalid(format!(
                "extraction_confidence must be in (0,1]: estimate {}",
                self.id
            )));
        }
        self.context()?;
        Ok(())
    }

    pub fn context(&self) -> Result<ContextLabel, PeriopError> {
        self.context_label.parse()
    }

    pub fn is_baseline(&self) -> bool {
        self.modifier_token.is_none()
    }
}

/// Canonical `population × case_type × urgency` tuple. Missing dimensions are
/// wildcards, written `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ContextLabel {
    pub population: Option<Population>,
    pub case_type: Option<String>,
    pub urgency: Option<Urgency>,
}

impl ContextLabel {
    pub fn new(
        population: Option<Population>,
        case_type: Option<&str>,
        urgency: Option<Urgency>,
    ) -> Self {
        Self {
            population,
            case_type: case_type.map(|c| c.trim().to_ascii_uppercase()),
            urgency,
        }
    }

    pub fn wildcard() -> Self {
        Self::default()
    }

    /// Fallback chain from this context up the wildcard tree, most specific
    /// first. Within equal specificity, population is the last dimension to
    /// generalize, then case_type, then urgency.
    pub fn fallback_chain(&self) -> Vec<ContextLabel> {
        // Masks are (population, case_type, urgency) keep-flags, ordered by
        // specificity then by dimension priority.
        const MASKS: [(bool, bool, bool); 8] = [
            (true, true, true),
            (true, true, false),
            (true, false, true),
            (false, true, true),
            (true, false, false),
            (false, true, false),
            (false, false, true),
            (false, false, false),
        ];
        let mut chain = Vec::with_capacity(8);
        for (keep_p, keep_c, keep_u) in MASKS {
            let candidate = ContextLabel {
                population: if keep_p { self.population } else { None },
                case_type: if keep_c { self.case_type.clone() } else { None },
                urgency: if keep_u { self.urgency } else { None },
            };
            if !chain.contains(&candidate) {
                chain.push(candidate);
            }
        }
        chain
    }

    /// True when every concrete dimension of `self` matches `other`. A
    /// wildcard dimension subsumes anything, so a parent cell subsumes all of
    /// its specializations.
    pub fn subsumes(&self, other: &ContextLabel) -> bool {
        (self.population.is_none() || self.population == other.population)
            && (self.case_type.is_none() || self.case_type == other.case_type)
            && (self.urgency.is_none() || self.urgency == other.urgency)
    }

    /// Count of concrete (non-wildcard) dimensions.
    pub fn specificity(&self) -> usize {
        usize::from(self.population.is_some())
            + usize::from(self.case_type.is_some())
            + usize::from(self.urgency.is_some())
    }
}

impl fmt::Display for ContextLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\u{d7}{}\u{d7}{}",
            self.population.map_or("*", Population::as_str),
            self.case_type.as_deref().unwrap_or("*"),
            self.urgency.map_or("*", Urgency::as_str),
        )
    }
}

impl FromStr for ContextLabel {
    type Err = PeriopError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(['\u{d7}', 'x']).map(str::trim).collect();
        if parts.len() != 3 {
            return Err(PeriopError::invalid(format!(
                "context label must be population\u{d7}case_type\u{d7}urgency: {value:?}"
            )));
        }
        let population = match parts[0] {
            "*" | "" => None,
            p => Some(p.parse()?),
        };
        let case_type = match parts[1] {
            "*" | "" => None,
            c => Some(c.to_ascii_uppercase()),
        };
        let urgency = match parts[2] {
            "*" | "" => None,
            u => Some(u.parse()?),
        };
        Ok(Self {
            population,
            case_type,
            urgency,
        })
    }
}

/// Pooled incidence of an outcome in a context, immutable per version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledBaseline {
    pub outcome_token: String,
    pub context_label: String,
    pub evidence_version: String,
    pub k: usize,
    pub p0: f64,
    pub p0_ci_low: f64,
    pub p0_ci_high: f64,
    pub method: String,
    pub evidence_grade: EvidenceGrade,
    pub pmids: Vec<String>,
    #[serde(default)]
    pub singleton: bool,
}

/// Pooled odds ratio for a modifier on an outcome in a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledEffect {
    pub outcome_token: String,
    pub modifier_token: String,
    pub context_label: String,
    pub evidence_version: String,
    pub k: usize,
    pub or_mean: f64,
    pub or_ci_low: f64,
    pub or_ci_high: f64,
    pub i_squared: f64,
    pub method: String,
    pub evidence_grade: EvidenceGrade,
    pub pmids: Vec<String>,
    #[serde(default)]
    pub singleton: bool,
    /// Any contributing RR/HR converted without a baseline incidence.
    #[serde(default)]
    pub approximate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline_estimate() -> Estimate {
        Estimate {
            id: 1,
            pmid: "18211591".into(),
            outcome_token: "LARYNGOSPASM".into(),
            modifier_token: None,
            measure: Measure::Incidence,
            estimate: 0.017,
            ci_low: Some(0.012),
            ci_high: Some(0.024),
            adjusted: false,
            population: Population::Pediatric,
            context_label: "PEDIATRIC\u{d7}ENT\u{d7}ELECTIVE".into(),
            quality_weight: 0.9,
            extraction_confidence: 0.95,
            n: Some(1800),
        }
    }

    #[test]
    fn grade_derivation_follows_design_and_size() {
        assert_eq!(
            EvidenceGrade::derive(StudyDesign::MetaAnalysis, 0),
            EvidenceGrade::A
        );
        assert_eq!(EvidenceGrade::derive(StudyDesign::Rct, 600), EvidenceGrade::A);
        assert_eq!(EvidenceGrade::derive(StudyDesign::Rct, 120), EvidenceGrade::B);
        assert_eq!(
            EvidenceGrade::derive(StudyDesign::Cohort, 450),
            EvidenceGrade::B
        );
        assert_eq!(
            EvidenceGrade::derive(StudyDesign::Cohort, 80),
            EvidenceGrade::C
        );
        assert_eq!(
            EvidenceGrade::derive(StudyDesign::CaseControl, 5000),
            EvidenceGrade::C
        );
        assert_eq!(
            EvidenceGrade::derive(StudyDesign::CaseSeries, 5000),
            EvidenceGrade::D
        );
    }

    #[test]
    fn grade_decay_saturates_at_d() {
        assert_eq!(EvidenceGrade::A.decayed(), EvidenceGrade::B);
        assert_eq!(EvidenceGrade::D.decayed(), EvidenceGrade::D);
    }

    #[test]
    fn grade_ordering_puts_a_first() {
        assert!(EvidenceGrade::A < EvidenceGrade::B);
        assert!(EvidenceGrade::C < EvidenceGrade::D);
        assert_eq!(
            EvidenceGrade::B.max(EvidenceGrade::D),
            EvidenceGrade::D,
            "max is the worse grade"
        );
    }

    #[test]
    fn baseline_estimate_validates() {
        baseline_estimate().validate().expect("valid baseline");
    }

    #[test]
    fn baseline_with_or_measure_is_rejected() {
        let mut est = baseline_estimate();
        est.measure = Measure::Or;
        assert!(est.validate().is_err());
    }

    #[test]
    fn modifier_estimate_must_be_positive() {
        let mut est = baseline_estimate();
        est.modifier_token = Some("ASTHMA".into());
        est.measure = Measure::Or;
        est.estimate = 0.0;
        assert!(est.validate().is_err());
        est.estimate = 2.1;
        est.validate().expect("positive OR is valid");
    }

    #[test]
    fn context_label_round_trips() {
        let ctx: ContextLabel = "PEDIATRIC\u{d7}ENT\u{d7}ELECTIVE"
            .parse()
            .expect("label should parse");
        assert_eq!(ctx.population, Some(Population::Pediatric));
        assert_eq!(ctx.case_type.as_deref(), Some("ENT"));
        assert_eq!(ctx.urgency, Some(Urgency::Elective));
        assert_eq!(ctx.to_string(), "PEDIATRIC\u{d7}ENT\u{d7}ELECTIVE");
    }

    #[test]
    fn context_label_accepts_ascii_x_separator() {
        let ctx: ContextLabel = "ADULT x CARDIAC x *".parse().expect("label should parse");
        assert_eq!(ctx.population, Some(Population::Adult));
        assert_eq!(ctx.urgency, None);
    }

    #[test]
    fn fallback_chain_is_most_specific_first() {
        let ctx: ContextLabel = "PEDIATRIC\u{d7}ENT\u{d7}ELECTIVE"
            .parse()
            .expect("label should parse");
        let chain = ctx.fallback_chain();
        assert_eq!(chain.len(), 8);
        assert_eq!(chain[0], ctx);
        assert_eq!(chain[7], ContextLabel::wildcard());
        for window in chain.windows(2) {
            assert!(
                window[0].specificity() >= window[1].specificity(),
                "chain must not gain specificity: {} -> {}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn fallback_chain_deduplicates_wildcard_dimensions() {
        let ctx = ContextLabel::new(Some(Population::Adult), None, None);
        assert_eq!(ctx.fallback_chain().len(), 2);
    }

    #[test]
    fn wildcard_dimensions_subsume_concrete_ones() {
        let cell: ContextLabel = "PEDIATRIC\u{d7}ENT\u{d7}*".parse().expect("cell parses");
        let estimate: ContextLabel = "PEDIATRIC\u{d7}ENT\u{d7}ELECTIVE"
            .parse()
            .expect("estimate context parses");
        assert!(cell.subsumes(&estimate));
        assert!(!estimate.subsumes(&cell));
        assert!(ContextLabel::wildcard().subsumes(&estimate));
    }
}
