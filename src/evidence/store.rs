//! Append-only estimate store and versioned, immutable pooled snapshots.
//!
//! A pooling run builds a fresh [`PooledSnapshot`] and publishes it with a
//! single pointer flip; in-flight requests keep reading the `Arc` they
//! acquired at request start, so a version swap never invalidates them.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PeriopError;
use crate::evidence::{
    ContextLabel, Estimate, EvidenceGrade, Paper, PooledBaseline, PooledEffect,
};

/// Append-only tables of papers and per-study estimates.
#[derive(Debug, Default)]
pub struct EvidenceStore {
    papers: BTreeMap<String, Paper>,
    estimates: Vec<Estimate>,
}

/// On-disk ingest format. `evidence_grade` may be omitted; it is then derived
/// from design and size per the deterministic grading rule.
#[derive(Debug, Deserialize)]
pub struct IngestFile {
    pub papers: Vec<IngestPaper>,
    pub estimates: Vec<Estimate>,
}

#[derive(Debug, Deserialize)]
pub struct IngestPaper {
    pub pmid: String,
    pub title: String,
    pub year: u16,
    pub design: crate::evidence::StudyDesign,
    pub n_total: u64,
    pub population: crate::evidence::Population,
    pub time_horizon: String,
    #[serde(default)]
    pub evidence_grade: Option<EvidenceGrade>,
    pub quality_score: f64,
}

impl EvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_paper(&mut self, paper: Paper) -> Result<(), PeriopError> {
        paper.validate()?;
        // Append-only: a pmid seen twice must agree or the second is dropped.
        if let Some(existing) = self.papers.get(&paper.pmid) {
            if existing.year != paper.year {
                warn!(pmid = %paper.pmid, "Conflicting re-ingest of paper; keeping first record");
            }
            return Ok(());
        }
        self.papers.insert(paper.pmid.clone(), paper);
        Ok(())
    }

    pub fn append_estimate(&mut self, mut estimate: Estimate) -> Result<u64, PeriopError> {
        if estimate.id == 0 {
            estimate.id = self.estimates.len() as u64 + 1;
        }
        estimate.validate()?;
        if !self.papers.contains_key(&estimate.pmid) {
            return Err(PeriopError::invalid(format!(
                "estimate {} cites unknown pmid {}",
                estimate.id, estimate.pmid
            )));
        }
        let id = estimate.id;
        self.estimates.push(estimate);
        Ok(id)
    }

    pub fn ingest(&mut self, file: IngestFile) -> Result<(usize, usize), PeriopError> {
        let mut papers = 0usize;
        for p in file.papers {
            let grade = p
                .evidence_grade
                .unwrap_or_else(|| EvidenceGrade::derive(p.design, p.n_total));
            self.add_paper(Paper {
                pmid: p.pmid,
                title: p.title,
                year: p.year,
                design: p.design,
                n_total: p.n_total,
                population: p.population,
                time_horizon: p.time_horizon,
                evidence_grade: grade,
                quality_score: p.quality_score,
            })?;
            papers += 1;
        }
        let mut estimates = 0usize;
        for e in file.estimates {
            self.append_estimate(e)?;
            estimates += 1;
        }
        Ok((papers, estimates))
    }

    pub fn ingest_path(&mut self, path: &Path) -> Result<(usize, usize), PeriopError> {
        let raw = std::fs::read_to_string(path)?;
        let file: IngestFile = serde_json::from_str(&raw)?;
        self.ingest(file)
    }

    pub fn paper(&self, pmid: &str) -> Option<&Paper> {
        self.papers.get(pmid)
    }

    pub fn estimates(&self) -> &[Estimate] {
        &self.estimates
    }
}

fn baseline_key(outcome: &str, context: &ContextLabel) -> String {
    format!("{outcome}|{context}")
}

fn row_in_chain(label: &str, chain: Option<&[ContextLabel]>) -> bool {
    match chain {
        None => true,
        Some(chain) => label
            .parse::<ContextLabel>()
            .is_ok_and(|ctx| chain.contains(&ctx)),
    }
}

fn effect_key(outcome: &str, modifier: &str, context: &ContextLabel) -> String {
    format!("{outcome}|{modifier}|{context}")
}

/// All pooled rows for one evidence version. Immutable once published.
#[derive(Debug, Default, Serialize)]
pub struct PooledSnapshot {
    pub version: String,
    baselines: BTreeMap<String, PooledBaseline>,
    effects: BTreeMap<String, PooledEffect>,
}

impl PooledSnapshot {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            baselines: BTreeMap::new(),
            effects: BTreeMap::new(),
        }
    }

    pub fn insert_baseline(&mut self, row: PooledBaseline) -> Result<(), PeriopError> {
        let context: ContextLabel = row.context_label.parse()?;
        self.baselines
            .insert(baseline_key(&row.outcome_token, &context), row);
        Ok(())
    }

    pub fn insert_effect(&mut self, row: PooledEffect) -> Result<(), PeriopError> {
        let context: ContextLabel = row.context_label.parse()?;
        self.effects.insert(
            effect_key(&row.outcome_token, &row.modifier_token, &context),
            row,
        );
        Ok(())
    }

    /// Baseline lookup with wildcard fallback. Returns the row plus the
    /// context it was actually found at.
    pub fn baseline(
        &self,
        outcome: &str,
        context: &ContextLabel,
    ) -> Option<(&PooledBaseline, ContextLabel)> {
        for candidate in context.fallback_chain() {
            if let Some(row) = self.baselines.get(&baseline_key(outcome, &candidate)) {
                if candidate != *context {
                    debug!(outcome, from = %context, to = %candidate, "Baseline wildcard fallback");
                }
                return Some((row, candidate));
            }
        }
        None
    }

    /// Effect lookup with wildcard fallback.
    pub fn effect(
        &self,
        outcome: &str,
        modifier: &str,
        context: &ContextLabel,
    ) -> Option<&PooledEffect> {
        context
            .fallback_chain()
            .into_iter()
            .find_map(|candidate| self.effects.get(&effect_key(outcome, modifier, &candidate)))
    }

    /// Pooled baselines for an outcome, optionally restricted to a context
    /// and its wildcard parents.
    pub fn baselines_for(
        &self,
        outcome: &str,
        context: Option<&ContextLabel>,
    ) -> Vec<&PooledBaseline> {
        let chain = context.map(ContextLabel::fallback_chain);
        self.baselines
            .values()
            .filter(|row| row.outcome_token == outcome)
            .filter(|row| row_in_chain(&row.context_label, chain.as_deref()))
            .collect()
    }

    /// Pooled effects for an outcome, optionally restricted to a context and
    /// its wildcard parents.
    pub fn effects_for(
        &self,
        outcome: &str,
        context: Option<&ContextLabel>,
    ) -> Vec<&PooledEffect> {
        let chain = context.map(ContextLabel::fallback_chain);
        self.effects
            .values()
            .filter(|row| row.outcome_token == outcome)
            .filter(|row| row_in_chain(&row.context_label, chain.as_deref()))
            .collect()
    }

    pub fn baseline_rows(&self) -> impl Iterator<Item = &PooledBaseline> {
        self.baselines.values()
    }

    pub fn effect_rows(&self) -> impl Iterator<Item = &PooledEffect> {
        self.effects.values()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty() && self.effects.is_empty()
    }
}

static VERSION_LABEL: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

/// Monotonic version label `vYYYY.MM[.N]`.
pub fn validate_version_label(label: &str) -> Result<(), PeriopError> {
    let re = VERSION_LABEL
        .get_or_init(|| Regex::new(r"^v\d{4}\.\d{2}(\.\d+)?$").expect("version regex compiles"));
    if label == "current" || re.is_match(label) {
        Ok(())
    } else {
        Err(PeriopError::invalid(format!(
            "evidence version must look like vYYYY.MM[.N]: {label:?}"
        )))
    }
}

/// Anything that can hand out a pinned pooled snapshot. The bundled
/// implementation reads precomputed pools; a literature-live source plugs in
/// behind the same trait.
pub trait EvidenceSource: Send + Sync {
    fn label(&self) -> &'static str;
    fn snapshot(&self, version: Option<&str>) -> Result<Arc<PooledSnapshot>, PeriopError>;
}

/// Shared evidence state: the append-only store plus published snapshots and
/// the `current` pointer.
pub struct EvidenceHub {
    store: Mutex<EvidenceStore>,
    versions: RwLock<BTreeMap<String, Arc<PooledSnapshot>>>,
    current: RwLock<Option<Arc<PooledSnapshot>>>,
}

impl Default for EvidenceHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EvidenceHub {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(EvidenceStore::new()),
            versions: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
        }
    }

    /// Run `f` against the append-only store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut EvidenceStore) -> R) -> R {
        let mut store = self.store.lock().expect("evidence store lock poisoned");
        f(&mut store)
    }

    /// Pool the current estimate set and publish the result under `version`.
    /// The `current` pointer flips atomically; prior versions stay readable.
    pub fn repool(&self, version: &str) -> Result<Arc<PooledSnapshot>, PeriopError> {
        validate_version_label(version)?;
        if version == "current" {
            return Err(PeriopError::invalid(
                "\"current\" is a pointer, not a publishable version label",
            ));
        }
        {
            let versions = self.versions.read().expect("versions lock poisoned");
            if versions.contains_key(version) {
                return Err(PeriopError::invalid(format!(
                    "evidence version {version} already published; versions are immutable"
                )));
            }
            if let Some(last) = versions.keys().next_back()
                && last.as_str() >= version
            {
                warn!(version, last, "Evidence version label is not monotonic");
            }
        }
        let snapshot = {
            let store = self.store.lock().expect("evidence store lock poisoned");
            crate::pooling::build_snapshot(&store, version)?
        };
        let snapshot = Arc::new(snapshot);
        self.versions
            .write()
            .expect("versions lock poisoned")
            .insert(version.to_string(), Arc::clone(&snapshot));
        *self.current.write().expect("current lock poisoned") = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn versions(&self) -> Vec<String> {
        self.versions
            .read()
            .expect("versions lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Seeded hub: built-in papers and estimates pooled under the bundled
    /// default version.
    pub fn with_builtin() -> Result<Self, PeriopError> {
        let hub = Self::new();
        hub.with_store(|store| store.ingest(crate::evidence::seed::ingest_file()))?;
        hub.repool(crate::evidence::seed::DEFAULT_VERSION)?;
        Ok(hub)
    }
}

impl EvidenceSource for EvidenceHub {
    fn label(&self) -> &'static str {
        "snapshot"
    }

    fn snapshot(&self, version: Option<&str>) -> Result<Arc<PooledSnapshot>, PeriopError> {
        match version.map(str::trim).filter(|v| !v.is_empty() && *v != "current") {
            None => self
                .current
                .read()
                .expect("current lock poisoned")
                .clone()
                .ok_or_else(|| PeriopError::VersionNotFound {
                    version: "current".into(),
                    available: "(none published)".into(),
                }),
            Some(label) => {
                let versions = self.versions.read().expect("versions lock poisoned");
                versions
                    .get(label)
                    .cloned()
                    .ok_or_else(|| PeriopError::VersionNotFound {
                        version: label.to_string(),
                        available: if versions.is_empty() {
                            "(none published)".into()
                        } else {
                            versions.keys().cloned().collect::<Vec<_>>().join(", ")
                        },
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::seed;

    #[test]
    fn version_labels_are_validated() {
        validate_version_label("v2025.06").expect("plain label");
        validate_version_label("v2025.06.2").expect("patched label");
        assert!(validate_version_label("2025.06").is_err());
        assert!(validate_version_label("v25.6").is_err());
    }

    #[test]
    fn builtin_hub_publishes_a_current_snapshot() {
        let hub = EvidenceHub::with_builtin().expect("builtin hub");
        let snapshot = hub.snapshot(None).expect("current snapshot");
        assert_eq!(snapshot.version, seed::DEFAULT_VERSION);
        assert!(!snapshot.is_empty());
        let pinned = hub
            .snapshot(Some(seed::DEFAULT_VERSION))
            .expect("pinned snapshot");
        assert!(Arc::ptr_eq(&snapshot, &pinned));
    }

    #[test]
    fn unknown_version_lists_available_ones() {
        let hub = EvidenceHub::with_builtin().expect("builtin hub");
        let err = hub
            .snapshot(Some("v1999.01"))
            .expect_err("missing version must fail");
        let msg = err.to_string();
        assert!(msg.contains("v1999.01"));
        assert!(msg.contains(seed::DEFAULT_VERSION));
    }

    #[test]
    fn published_versions_are_immutable() {
        let hub = EvidenceHub::with_builtin().expect("builtin hub");
        let err = hub
            .repool(seed::DEFAULT_VERSION)
            .expect_err("republishing must fail");
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn version_flip_keeps_prior_snapshot_readable() {
        let hub = EvidenceHub::with_builtin().expect("builtin hub");
        let before = hub.snapshot(None).expect("first snapshot");
        hub.repool("v2099.01").expect("second pooling run");
        let after = hub.snapshot(None).expect("current after flip");
        assert_eq!(after.version, "v2099.01");
        // The in-flight reference still answers against its pinned version.
        assert_eq!(before.version, seed::DEFAULT_VERSION);
        assert!(
            hub.snapshot(Some(seed::DEFAULT_VERSION)).is_ok(),
            "prior version stays published"
        );
    }

    #[test]
    fn row_listings_filter_to_a_context_chain() {
        let hub = EvidenceHub::with_builtin().expect("builtin hub");
        let snapshot = hub.snapshot(None).expect("current snapshot");
        let peds: ContextLabel = "PEDIATRIC\u{d7}*\u{d7}*".parse().expect("context parses");

        let filtered = snapshot.baselines_for("LARYNGOSPASM", Some(&peds));
        assert!(!filtered.is_empty());
        assert!(
            filtered
                .iter()
                .all(|row| !row.context_label.starts_with("ADULT")),
            "adult rows must not survive a pediatric filter"
        );
        let all = snapshot.baselines_for("LARYNGOSPASM", None);
        assert!(all.len() > filtered.len());

        let effects = snapshot.effects_for("LARYNGOSPASM", Some(&peds));
        assert!(effects.iter().all(|row| {
            row.context_label == peds.to_string() || row.context_label == "*\u{d7}*\u{d7}*"
        }));
    }

    #[test]
    fn estimate_citing_unknown_pmid_is_rejected() {
        let mut store = EvidenceStore::new();
        let est = seed::ingest_file().estimates.into_iter().next().expect("seed estimate");
        let err = store.append_estimate(est).expect_err("unknown pmid");
        assert!(err.to_string().contains("unknown pmid"));
    }
}
