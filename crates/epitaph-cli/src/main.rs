mod import;
mod report;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use epitaph_client::{ProviderConfig, build_orchestrator};
use epitaph_core::aggregate::CauseOfDeathPolicy;
use epitaph_core::batch::{BatchConfig, BatchController, DEFAULT_RUN_TYPE, TracingBatchReporter};
use epitaph_core::models::Subject;
use epitaph_core::orchestrator::RunConfig;
use epitaph_core::provenance::build_update;
use epitaph_core::rating::{AggregateOptions, RatingInput, aggregate_ratings};
use epitaph_core::replay::{ReplayOptions, replay_failures};
use epitaph_core::traits::{CheckpointStore, SubjectSource};
use epitaph_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "epitaph", version, about = "Death-fact enrichment engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich subjects in a resumable batch run
    Enrich {
        #[command(flatten)]
        run: RunArgs,

        /// Checkpoint key; runs of the same type resume each other
        #[arg(long, default_value = DEFAULT_RUN_TYPE)]
        run_type: String,

        /// Maximum number of subjects to process
        #[arg(short, long)]
        limit: Option<u64>,

        /// Only these subject ids (comma separated)
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,

        /// Include subjects whose cause of death is already known
        #[arg(long, default_value_t = false)]
        all: bool,

        /// USD ceiling for the whole run
        #[arg(long)]
        max_total_cost: Option<f64>,

        /// Consecutive transient failures that halt the run
        #[arg(long, default_value_t = 5)]
        breaker_threshold: u32,

        /// Pause between subjects, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        /// Discard the existing checkpoint and start over
        #[arg(long, default_value_t = false)]
        fresh: bool,

        /// Write one CSV row per processed subject
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Enrich one subject without writing anything and print the result
    Lookup {
        #[command(flatten)]
        run: RunArgs,

        /// Load the subject from the database
        #[arg(long, conflicts_with = "name")]
        id: Option<i64>,

        /// Ad-hoc subject name (no database needed)
        #[arg(long, requires = "deathday")]
        name: Option<String>,

        /// Death date, YYYY-MM-DD
        #[arg(long)]
        deathday: Option<NaiveDate>,

        /// Birth date, YYYY-MM-DD
        #[arg(long)]
        birthday: Option<NaiveDate>,
    },

    /// Re-parse stored provider payloads that failed to parse
    ReplayFailures {
        /// Only failures from this provider
        #[arg(short, long)]
        provider: Option<String>,

        #[arg(short, long, default_value_t = 100)]
        limit: usize,

        /// Parse and report without writing
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Inspect or clear a run checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Clear failure bookkeeping so subjects become eligible again
    ResetFailures {
        /// Only these subject ids (comma separated); all subjects otherwise
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,
    },

    /// Load subjects from a CSV file (id,name,birthday,deathday,cause_of_death)
    Import {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Aggregate ratings from a JSON file into one score
    Score {
        /// JSON array of {source, value, scale, votes?, weight?}
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long, default_value_t = epitaph_core::rating::DEFAULT_PRIOR_MEAN)]
        prior_mean: f64,

        #[arg(long, default_value_t = epitaph_core::rating::DEFAULT_MIN_CONFIDENCE)]
        min_confidence: f64,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    Show {
        #[arg(long, default_value = DEFAULT_RUN_TYPE)]
        run_type: String,
    },
    Clear {
        #[arg(long, default_value = DEFAULT_RUN_TYPE)]
        run_type: String,
    },
}

/// Provider selection shared by `enrich` and `lookup`.
#[derive(clap::Args)]
struct RunArgs {
    /// Allow paid providers
    #[arg(long, env = "EPITAPH_ALLOW_PAID", default_value_t = false)]
    paid: bool,

    /// Allow AI providers (implies --paid)
    #[arg(long, env = "EPITAPH_USE_AI", default_value_t = false)]
    use_ai: bool,

    /// Follow citation links through the fallback chain
    #[arg(long, default_value_t = false)]
    follow_links: bool,

    /// USD ceiling per subject
    #[arg(long, default_value_t = 0.25)]
    max_cost_per_subject: f64,

    #[arg(long, default_value_t = 0.5)]
    confidence_threshold: f64,

    /// Drop weakly sourced narrative claims without a knowledge-base hit
    #[arg(long, default_value_t = false)]
    require_corroboration: bool,

    #[arg(long, value_enum, default_value_t = CausePolicy::AiFirst)]
    cause_policy: CausePolicy,
}

#[derive(Clone, Copy, ValueEnum)]
enum CausePolicy {
    AiFirst,
    TierOrder,
}

impl RunArgs {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            free_only: !(self.paid || self.use_ai),
            use_ai: self.use_ai,
            max_cost_per_subject: Some(self.max_cost_per_subject),
            follow_links: self.follow_links,
            confidence_threshold: self.confidence_threshold,
            require_corroboration: self.require_corroboration,
            cause_of_death_policy: match self.cause_policy {
                CausePolicy::AiFirst => CauseOfDeathPolicy::AiFirst,
                CausePolicy::TierOrder => CauseOfDeathPolicy::TierOrder,
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("epitaph=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enrich {
            run,
            run_type,
            limit,
            ids,
            all,
            max_total_cost,
            breaker_threshold,
            delay_ms,
            fresh,
            report,
        } => {
            let config = BatchConfig {
                run_type,
                run: run.run_config(),
                limit,
                subject_ids: ids,
                only_missing: !all,
                circuit_breaker_threshold: breaker_threshold,
                max_total_cost,
                delay_between_subjects: Duration::from_millis(delay_ms),
                ..Default::default()
            };
            let db = connect_db().await?;
            return cmd_enrich(db, config, fresh, report).await;
        }
        Commands::Lookup {
            run,
            id,
            name,
            deathday,
            birthday,
        } => {
            let subject = match (id, name) {
                (Some(id), _) => {
                    let db = connect_db().await?;
                    db.get_subject(id)
                        .await
                        .map_err(|e| anyhow::anyhow!(e))?
                        .with_context(|| format!("Subject {id} not found"))?
                }
                (None, Some(name)) => {
                    let mut subject = Subject::new(0, name);
                    subject.deathday = deathday;
                    subject.birthday = birthday;
                    subject
                }
                (None, None) => anyhow::bail!("Either --id or --name is required"),
            };
            cmd_lookup(&subject, &run.run_config()).await?;
        }
        Commands::ReplayFailures {
            provider,
            limit,
            dry_run,
        } => {
            let db = connect_db().await?;
            let options = ReplayOptions {
                provider,
                limit,
                dry_run,
                ..Default::default()
            };
            cmd_replay(&db, &options).await?;
        }
        Commands::Checkpoint { action } => {
            let db = connect_db().await?;
            cmd_checkpoint(&db, action).await?;
        }
        Commands::ResetFailures { ids } => {
            let db = connect_db().await?;
            let reset = db
                .reset_subject_failures(ids.as_deref())
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Reset failure bookkeeping on {reset} subjects");
        }
        Commands::Import { file } => {
            let db = connect_db().await?;
            cmd_import(&db, &file).await?;
        }
        Commands::Score {
            file,
            prior_mean,
            min_confidence,
        } => {
            let options = AggregateOptions {
                prior_mean,
                min_confidence,
            };
            cmd_score(&file, &options)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Connect to PostgreSQL using DATABASE_URL and apply pending migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e))
        .context("DATABASE_URL not set or invalid")?;
    let db = Database::connect(&config)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db)
}

async fn cmd_enrich(
    db: Database,
    config: BatchConfig,
    fresh: bool,
    report: Option<PathBuf>,
) -> Result<ExitCode> {
    if fresh
        && db
            .clear_checkpoint(&config.run_type)
            .await
            .map_err(|e| anyhow::anyhow!(e))?
    {
        tracing::info!(run_type = %config.run_type, "Checkpoint cleared");
    }

    let providers = ProviderConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let orchestrator = build_orchestrator(&providers)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    if orchestrator.registry().prioritized(&config.run).is_empty() {
        anyhow::bail!("No provider is available for this configuration");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing the current subject");
            on_signal.cancel();
        }
    });

    let controller = BatchController::new(db, Arc::clone(&orchestrator), config);
    let summary = controller
        .run(Uuid::new_v4(), cancel, &TracingBatchReporter, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if let Some(path) = report {
        let rows = report::write_report_file(&path, &summary.reports)?;
        tracing::info!(rows, path = %path.display(), "Report written");
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "run_id": summary.run_id,
            "status": summary.status,
            "counters": summary.counters,
            "accumulated_cost": summary.accumulated_cost,
            "exit_reason": summary.exit_reason,
        }))?
    );

    Ok(ExitCode::from(summary.status.exit_code()))
}

async fn cmd_lookup(subject: &Subject, config: &RunConfig) -> Result<()> {
    subject.validate().map_err(|e| anyhow::anyhow!(e))?;

    let providers = ProviderConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let orchestrator = build_orchestrator(&providers)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(subject_id = subject.id, name = %subject.name, "Looking up");
    let outcome = orchestrator.enrich(subject, config).await;
    let update = build_update(subject.id, Uuid::nil(), &outcome.claims, &outcome.results);

    tracing::info!(
        providers = outcome.providers_attempted.len(),
        stop_reason = outcome.stop_reason.as_str(),
        cost = outcome.total_cost,
        "Lookup complete"
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "subject": subject,
            "outcome": outcome,
            "would_write": update,
        }))?
    );
    Ok(())
}

async fn cmd_replay(db: &Database, options: &ReplayOptions) -> Result<()> {
    let providers = ProviderConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let orchestrator = build_orchestrator(&providers)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let summary = replay_failures(orchestrator.registry(), db, Uuid::new_v4(), options)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        examined = summary.examined,
        recovered = summary.recovered,
        still_failing = summary.still_failing,
        "Replay complete"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_checkpoint(db: &Database, action: CheckpointAction) -> Result<()> {
    match action {
        CheckpointAction::Show { run_type } => {
            match db
                .load_checkpoint(&run_type)
                .await
                .map_err(|e| anyhow::anyhow!(e))?
            {
                Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
                None => println!("No checkpoint for run type '{run_type}'"),
            }
        }
        CheckpointAction::Clear { run_type } => {
            let cleared = db
                .clear_checkpoint(&run_type)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            if cleared {
                println!("Cleared checkpoint for run type '{run_type}'");
            } else {
                println!("No checkpoint for run type '{run_type}'");
            }
        }
    }
    Ok(())
}

async fn cmd_import(db: &Database, path: &Path) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open subjects file: {}", path.display()))?;
    let subjects = import::read_subjects(file)?;
    let written = db
        .subject_repo()
        .upsert_subjects(&subjects)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("Imported {} subjects ({written} rows written)", subjects.len());
    Ok(())
}

fn cmd_score(path: &Path, options: &AggregateOptions) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read ratings file: {}", path.display()))?;
    let inputs: Vec<RatingInput> =
        serde_json::from_str(&raw).context("Invalid JSON in ratings file")?;

    match aggregate_ratings(&inputs, options) {
        Some(score) => println!("{}", serde_json::to_string_pretty(&score.rounded())?),
        None => println!("No usable ratings in {}", path.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_flags_map_to_batch_settings() {
        let cli = Cli::try_parse_from([
            "epitaph", "enrich", "--ids", "3,5,8", "--use-ai", "--cause-policy", "tier-order",
        ])
        .unwrap();
        let Commands::Enrich { run, ids, all, .. } = cli.command else {
            panic!("expected enrich");
        };
        assert_eq!(ids, Some(vec![3, 5, 8]));
        assert!(!all);
        let config = run.run_config();
        assert!(!config.free_only);
        assert!(config.use_ai);
        assert_eq!(config.cause_of_death_policy, CauseOfDeathPolicy::TierOrder);
    }

    #[test]
    fn test_defaults_are_free_only() {
        let cli = Cli::try_parse_from(["epitaph", "enrich"]).unwrap();
        let Commands::Enrich { run, run_type, .. } = cli.command else {
            panic!("expected enrich");
        };
        assert_eq!(run_type, DEFAULT_RUN_TYPE);
        let config = run.run_config();
        assert!(config.free_only);
        assert!(!config.use_ai);
        assert_eq!(config.max_cost_per_subject, Some(0.25));
    }

    #[test]
    fn test_ad_hoc_lookup_requires_death_date() {
        assert!(Cli::try_parse_from(["epitaph", "lookup", "--name", "Jane Doe"]).is_err());
        assert!(
            Cli::try_parse_from([
                "epitaph", "lookup", "--name", "Jane Doe", "--deathday", "2021-03-04"
            ])
            .is_ok()
        );
    }
}
