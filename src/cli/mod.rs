//! Top-level CLI parsing and command execution.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::try_join_all;

use crate::engine::{AnalysisMode, AnalyzeOptions, Engine};
use crate::error::PeriopError;
use crate::evidence::ContextLabel;
use crate::evidence::store::EvidenceSource;
use crate::ontology::TermType;

#[derive(Parser, Debug)]
#[command(
    name = "periop",
    about = "Evidence-based perioperative risk and medication recommendations from free-text HPIs",
    version,
    after_help = "Risks are pooled from the bundled evidence snapshot by default; ingest your own \
                  estimate files with `periop pool` and pin versions with --evidence-version."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON instead of Markdown
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze a free-text HPI into risks and medication guidance
    #[command(after_help = "\
EXAMPLES:
  periop analyze \"5-year-old male with asthma and recent URI for tonsillectomy\"
  periop analyze \"68-year-old with CAD and CKD for CABG\" --json
  periop analyze \"adult for hernia repair\" --context \"ADULT\u{d7}GENERAL\u{d7}ELECTIVE\"
  periop analyze \"...\" --evidence-version v2025.06 --no-meds")]
    Analyze {
        /// History of present illness text
        hpi: String,
        /// Pin a published evidence version (default: current)
        #[arg(long = "evidence-version")]
        evidence_version: Option<String>,
        /// Override the resolved context tuple (population x case_type x urgency)
        #[arg(long)]
        context: Option<String>,
        /// Evidence mode [values: model, live]
        #[arg(long, default_value = "model")]
        mode: String,
        /// Skip medication recommendations
        #[arg(long = "no-meds")]
        no_medications: bool,
        /// Per-request wall-clock budget in milliseconds (default: 5000)
        #[arg(long = "budget-ms", default_value = "5000")]
        budget_ms: u64,
    },
    /// Analyze a file of HPIs, one per line, in parallel
    #[command(after_help = "\
EXAMPLES:
  periop batch hpis.txt
  periop batch hpis.txt --json")]
    Batch {
        /// Input file, one HPI per line (blank lines skipped)
        file: PathBuf,
    },
    /// Ingest an estimates file and publish a new pooled evidence version
    #[command(after_help = "\
EXAMPLES:
  periop pool estimates.json --version v2025.07
  periop pool estimates.json --version v2025.07.1 --json")]
    Pool {
        /// JSON file with papers and per-study estimates
        estimates: PathBuf,
        /// Version label for the published snapshot (vYYYY.MM[.N])
        #[arg(long)]
        version: String,
    },
    /// Show pooled baselines and effects for an outcome
    #[command(after_help = "\
EXAMPLES:
  periop evidence LARYNGOSPASM
  periop evidence LARYNGOSPASM --context \"PEDIATRIC\u{d7}ENT\u{d7}ELECTIVE\"
  periop evidence PONV --evidence-version v2025.06 --json")]
    Evidence {
        /// Outcome token (e.g., LARYNGOSPASM)
        outcome: String,
        /// Restrict rows to a context tuple and its wildcard parents
        #[arg(long)]
        context: Option<String>,
        /// Pin a published evidence version (default: current)
        #[arg(long = "evidence-version")]
        evidence_version: Option<String>,
    },
    /// List ontology terms, or show one term
    #[command(after_help = "\
EXAMPLES:
  periop ontology
  periop ontology ASTHMA
  periop ontology --type medication")]
    Ontology {
        /// Term token (e.g., ASTHMA)
        token: Option<String>,
        /// Filter by term type (outcome, risk-factor, medication, demographic, procedure)
        #[arg(long = "type")]
        term_type: Option<String>,
    },
    /// Show version
    Version,
}

fn parse_mode(value: &str) -> Result<AnalysisMode, PeriopError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "model" | "model-based" => Ok(AnalysisMode::ModelBased),
        "live" | "literature-live" => Ok(AnalysisMode::LiteratureLive),
        _ => Err(PeriopError::invalid("--mode must be one of: model, live")),
    }
}

fn version_output() -> String {
    let cargo_version = env!("CARGO_PKG_VERSION");
    let git_tag = option_env!("PERIOP_BUILD_GIT_TAG");
    let git = option_env!("PERIOP_BUILD_GIT_SHA").unwrap_or("unknown");
    let build = option_env!("PERIOP_BUILD_DATE").unwrap_or("unknown");
    let version = git_tag
        .filter(|t| t.starts_with('v') && !t.contains('-'))
        .map(|t| &t[1..])
        .unwrap_or(cargo_version);
    format!("periop {version} (git {git}, build {build})")
}

async fn run_batch(engine: Arc<Engine>, file: &PathBuf, json: bool) -> anyhow::Result<String> {
    let content = std::fs::read_to_string(file).map_err(PeriopError::Io)?;
    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if lines.is_empty() {
        return Err(PeriopError::invalid("batch file contains no HPIs").into());
    }

    let tasks = lines.into_iter().map(|hpi| {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || {
            engine
                .analyze(&hpi, &AnalyzeOptions::default())
                .map(|result| (hpi, result))
        })
    });
    let joined = try_join_all(tasks).await?;
    let results: Vec<_> = joined.into_iter().collect::<Result<Vec<_>, _>>()?;

    if json {
        let payload: Vec<_> = results.iter().map(|(_, r)| r).collect();
        return Ok(crate::render::json::to_pretty(&payload)?);
    }
    let mut out = String::new();
    for (hpi, result) in &results {
        out.push_str(&format!("<!-- {hpi} -->\n"));
        out.push_str(&crate::render::markdown::analysis_markdown(result));
        out.push('\n');
    }
    Ok(out)
}

pub async fn run(cli: Cli) -> anyhow::Result<String> {
    let engine = Arc::new(Engine::builtin()?);

    match cli.command {
        Commands::Analyze {
            hpi,
            evidence_version,
            context,
            mode,
            no_medications,
            budget_ms,
        } => {
            let options = AnalyzeOptions {
                evidence_version,
                context_override: context,
                mode: parse_mode(&mode)?,
                include_medications: !no_medications,
                budget: Duration::from_millis(budget_ms),
                ..Default::default()
            };
            let result = engine.analyze(&hpi, &options)?;
            if cli.json {
                Ok(crate::render::json::to_pretty(&result)?)
            } else {
                Ok(crate::render::markdown::analysis_markdown(&result))
            }
        }
        Commands::Batch { file } => run_batch(engine, &file, cli.json).await,
        Commands::Pool { estimates, version } => {
            let (papers, rows) = engine
                .hub()
                .with_store(|store| store.ingest_path(&estimates))?;
            let snapshot = engine.hub().repool(&version)?;
            let pooled_at = time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "unknown".into());
            if cli.json {
                Ok(crate::render::json::to_pretty(&serde_json::json!({
                    "version": snapshot.version,
                    "pooled_at": pooled_at,
                    "papers_ingested": papers,
                    "estimates_ingested": rows,
                    "baselines": snapshot.baseline_rows().count(),
                    "effects": snapshot.effect_rows().count(),
                }))?)
            } else {
                Ok(format!(
                    "Published {} at {}: {} papers, {} estimates ingested; {} baselines, {} effects pooled\n",
                    snapshot.version,
                    pooled_at,
                    papers,
                    rows,
                    snapshot.baseline_rows().count(),
                    snapshot.effect_rows().count(),
                ))
            }
        }
        Commands::Evidence {
            outcome,
            context,
            evidence_version,
        } => {
            let outcome = outcome.trim().to_ascii_uppercase();
            let term = engine.ontology().get(&outcome);
            if !term.is_some_and(|t| t.term_type == TermType::Outcome) {
                return Err(PeriopError::NotFound {
                    entity: "outcome".into(),
                    id: outcome,
                    suggestion: "Try: periop ontology --type outcome".into(),
                }
                .into());
            }
            let context = context
                .as_deref()
                .map(str::parse::<ContextLabel>)
                .transpose()?;
            let snapshot = engine.hub().snapshot(evidence_version.as_deref())?;
            if cli.json {
                Ok(crate::render::json::to_pretty(&serde_json::json!({
                    "outcome": outcome,
                    "version": snapshot.version,
                    "context": context.as_ref().map(ContextLabel::to_string),
                    "baselines": snapshot.baselines_for(&outcome, context.as_ref()),
                    "effects": snapshot.effects_for(&outcome, context.as_ref()),
                }))?)
            } else {
                Ok(crate::render::markdown::evidence_markdown(
                    &snapshot,
                    &outcome,
                    context.as_ref(),
                ))
            }
        }
        Commands::Ontology { token, term_type } => {
            let filter = term_type.as_deref().map(TermType::from_flag).transpose()?;
            match token
                .map(|t| t.trim().to_ascii_uppercase())
                .filter(|t| !t.is_empty())
            {
                Some(token) => {
                    // Accept a synonym where no token matches.
                    let term = engine
                        .ontology()
                        .get(&token)
                        .or_else(|| engine.ontology().resolve_synonym(&token))
                        .ok_or_else(|| PeriopError::NotFound {
                            entity: "ontology term".into(),
                            id: token.clone(),
                            suggestion: "Try: periop ontology".into(),
                        })?;
                    Ok(crate::render::json::to_pretty(term)?)
                }
                None => {
                    let terms: Vec<_> = engine
                        .ontology()
                        .iter()
                        .filter(|t| filter.is_none_or(|f| t.term_type == f))
                        .collect();
                    if cli.json {
                        return Ok(crate::render::json::to_pretty(&terms)?);
                    }
                    let mut out = String::from("| Token | Type | Label | Category |\n");
                    out.push_str("|-------|------|-------|----------|\n");
                    for term in terms {
                        out.push_str(&format!(
                            "| {} | {} | {} | {} |\n",
                            term.token,
                            term.term_type.as_str(),
                            term.plain_label,
                            term.category
                        ));
                    }
                    Ok(out)
                }
            }
        }
        Commands::Version => Ok(format!(
            "{}\nevidence versions: {}",
            version_output(),
            engine.hub().versions().join(", ")
        )),
    }
}
