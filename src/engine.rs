//! Request orchestration: extraction, per-outcome risk, medication decision,
//! and in-band degradation reporting.
//!
//! The engine core is synchronous and pure. Shared state is read-only: the
//! ontology and the pinned pooled snapshot acquired at request start. A
//! version flip during a request never invalidates the acquired reference.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PeriopError;
use crate::evidence::store::{EvidenceHub, EvidenceSource, PooledSnapshot};
use crate::evidence::{ContextLabel, Population};
use crate::extract::{AgeBand, Extraction, Extractor};
use crate::meds::{DecisionInput, MedicationPlan};
use crate::ontology::{Ontology, TermType};
use crate::risk::{self, RiskAssessment, RiskLevel};

/// Default per-request wall-clock budget.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisMode {
    ModelBased,
    LiteratureLive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    Ok,
    PartialSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    EvidenceMissing,
    ExtractionDegraded,
    RiskCapped,
    MissingWeight,
    Timeout,
}

/// Request-scoped degradation record, carried on the result for
/// observability.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub evidence_version: Option<String>,
    pub context_override: Option<String>,
    pub mode: AnalysisMode,
    pub include_medications: bool,
    pub budget: Duration,
    pub cancel: CancellationToken,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            evidence_version: None,
            context_override: None,
            mode: AnalysisMode::ModelBased,
            include_medications: true,
            budget: DEFAULT_BUDGET,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub session_id: String,
    pub status: AnalysisStatus,
    pub mode: AnalysisMode,
    pub evidence_version: String,
    pub context: String,
    pub demographics: crate::extract::Demographics,
    pub factors: Vec<crate::extract::ExtractedFactor>,
    pub risks: Vec<RiskAssessment>,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medications: Option<MedicationPlan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit: Vec<AuditEvent>,
}

/// Process-wide engine context: one ontology, one evidence hub, shared
/// read-only by concurrent requests.
pub struct Engine {
    ontology: Arc<Ontology>,
    extractor: Extractor,
    hub: Arc<EvidenceHub>,
    live_source: Option<Arc<dyn EvidenceSource>>,
}

impl Engine {
    pub fn new(ontology: Ontology, hub: EvidenceHub) -> Self {
        let ontology = Arc::new(ontology);
        let extractor = Extractor::new(Arc::clone(&ontology));
        Self {
            ontology,
            extractor,
            hub: Arc::new(hub),
            live_source: None,
        }
    }

    /// Built-in ontology plus the bundled evidence snapshot.
    pub fn builtin() -> Result<Self, PeriopError> {
        Ok(Self::new(Ontology::builtin(), EvidenceHub::with_builtin()?))
    }

    /// Plug a literature-live evidence source behind the same interface.
    pub fn with_live_source(mut self, source: Arc<dyn EvidenceSource>) -> Self {
        self.live_source = Some(source);
        self
    }

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    pub fn hub(&self) -> &Arc<EvidenceHub> {
        &self.hub
    }

    fn source_for(&self, mode: AnalysisMode) -> &dyn EvidenceSource {
        match (mode, self.live_source.as_deref()) {
            (AnalysisMode::LiteratureLive, Some(live)) => live,
            _ => self.hub.as_ref(),
        }
    }

    /// Resolve the runtime context tuple from demographics and procedure.
    fn resolve_context(&self, extraction: &Extraction) -> ContextLabel {
        let population = match extraction.demographics.age_band {
            AgeBand::AgeLt1 | AgeBand::Age1_5 | AgeBand::Age6_12 | AgeBand::Age13_17 => {
                Some(Population::Pediatric)
            }
            AgeBand::Age18_64 | AgeBand::AgeGe65 => Some(Population::Adult),
            AgeBand::Unknown => None,
        };
        let case_type = extraction
            .demographics
            .procedure
            .as_deref()
            .and_then(|token| self.ontology.get(token))
            .and_then(|term| term.case_type.clone());
        ContextLabel::new(
            population,
            case_type.as_deref(),
            Some(extraction.demographics.urgency),
        )
    }

    fn session_id(hpi: &str, options: &AnalyzeOptions, version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(hpi.as_bytes());
        hasher.update([0u8]);
        hasher.update(version.as_bytes());
        hasher.update([0u8]);
        hasher.update(options.context_override.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(match options.mode {
            AnalysisMode::ModelBased => b"model".as_slice(),
            AnalysisMode::LiteratureLive => b"live".as_slice(),
        });
        hasher.update([u8::from(options.include_medications)]);
        let digest = hasher.finalize();
        let mut out = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// The core operation: free-text HPI in, structured assessment out.
    ///
    /// Only invalid input, an unknown pinned version, and cancellation fail
    /// the request; every other degradation is reported in-band.
    pub fn analyze(
        &self,
        hpi_text: &str,
        options: &AnalyzeOptions,
    ) -> Result<AnalysisResult, PeriopError> {
        let started = Instant::now();
        if hpi_text.trim().is_empty() {
            return Err(PeriopError::invalid("hpi_text must not be empty"));
        }

        // Scoped acquisition: pin the snapshot for the whole request.
        let source = self.source_for(options.mode);
        let snapshot: Arc<PooledSnapshot> = source.snapshot(options.evidence_version.as_deref())?;
        debug!(
            source = source.label(),
            version = %snapshot.version,
            "Pinned evidence snapshot"
        );

        let mut audit: Vec<AuditEvent> = Vec::new();
        let extraction = self.extractor.extract(hpi_text);
        let text_extracted = extraction
            .factors
            .iter()
            .any(|f| !f.evidence_text.is_empty());
        if !text_extracted {
            audit.push(AuditEvent {
                kind: AuditKind::ExtractionDegraded,
                detail: "no clinical factors recognized in non-empty text".into(),
            });
        }

        let context = match options.context_override.as_deref() {
            Some(raw) => raw.parse::<ContextLabel>()?,
            None => self.resolve_context(&extraction),
        };
        debug!(%context, "Resolved request context");

        let mut status = AnalysisStatus::Ok;
        let mut risks: Vec<RiskAssessment> = Vec::new();
        let mut outcomes: Vec<&str> = self
            .ontology
            .terms_of_type(TermType::Outcome)
            .map(|t| t.token.as_str())
            .collect();
        outcomes.sort_unstable();

        for outcome in outcomes {
            if options.cancel.is_cancelled() {
                // Cooperative cancellation discards partial results.
                return Err(PeriopError::Cancelled);
            }
            if started.elapsed() > options.budget {
                warn!(outcome, "Request budget exhausted; returning partial result");
                audit.push(AuditEvent {
                    kind: AuditKind::Timeout,
                    detail: format!("budget exhausted before {outcome}"),
                });
                status = AnalysisStatus::PartialSuccess;
                break;
            }
            let assessment =
                risk::assess_outcome(&snapshot, outcome, &context, &extraction.factors);
            if assessment.no_evidence {
                audit.push(AuditEvent {
                    kind: AuditKind::EvidenceMissing,
                    detail: format!("no pooled baseline for {outcome} in {context}"),
                });
                status = AnalysisStatus::PartialSuccess;
            }
            if assessment.capped {
                audit.push(AuditEvent {
                    kind: AuditKind::RiskCapped,
                    detail: format!("adjusted risk for {outcome} hit the plausibility cap"),
                });
            }
            risks.push(assessment);
        }

        let risk_level = risk::overall_level(&risks);

        let medications = if options.include_medications {
            let input = DecisionInput {
                demographics: &extraction.demographics,
                factors: &extraction.factors,
                risks: &risks,
            };
            let (plan, warnings) = crate::meds::decide(&self.ontology, &input);
            for warning in warnings {
                audit.push(AuditEvent {
                    kind: AuditKind::MissingWeight,
                    detail: warning,
                });
            }
            Some(plan)
        } else {
            None
        };

        Ok(AnalysisResult {
            session_id: Self::session_id(hpi_text, options, &snapshot.version),
            status,
            mode: options.mode,
            evidence_version: snapshot.version.clone(),
            context: context.to_string(),
            demographics: extraction.demographics,
            factors: extraction.factors,
            risks,
            risk_level,
            medications,
            audit,
        })
    }
}
