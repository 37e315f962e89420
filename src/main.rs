use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use refill_bundle_risk::mapping::StatusMapper;
use refill_bundle_risk::report;
use refill_bundle_risk::validation;
use refill_bundle_risk::{PipelineConfig, RefillRiskPipeline};

mod db;

#[derive(Parser)]
#[command(name = "refill-bundle-risk")]
#[command(about = "Explainable risk scoring for coordinated pharmacy refill bundles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Evaluation instant (RFC 3339 with offset); defaults to now
    #[arg(long)]
    as_of: Option<String>,
    /// JSON pipeline configuration; every field is optional
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small set of pseudonymized source records
    Seed,
    /// Import raw source-status records from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Score stored records and persist the resulting artifacts
    #[command(group(
        ArgGroup::new("scope")
            .args(["bundle", "member"])
            .multiple(false)
    ))]
    Score {
        #[arg(long)]
        bundle: Option<String>,
        #[arg(long)]
        member: Option<String>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Generate a markdown report
    #[command(group(
        ArgGroup::new("scope")
            .args(["bundle", "member"])
            .multiple(false)
    ))]
    Report {
        #[arg(long)]
        bundle: Option<String>,
        #[arg(long)]
        member: Option<String>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run the pipeline over a CSV file without a database and print JSON
    Assess {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Print mapping rule statistics and consistency issues
    Rules {
        /// Print every rule instead of the statistics
        #[arg(long)]
        export: bool,
    },
}

fn resolve_as_of(raw: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    match raw {
        Some(raw) => Ok(validation::parse_timestamp("as_of", raw)?),
        None => Ok(Utc::now()),
    }
}

fn build_pipeline(config: Option<&Path>) -> anyhow::Result<RefillRiskPipeline> {
    let config = match config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    Ok(RefillRiskPipeline::new(config)?)
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("refill_bundle_risk=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            let inserted = db::seed(&pool).await?;
            println!("Seed data inserted ({inserted} new records).");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let outcome = db::import_csv(&pool, &csv).await?;
            println!(
                "Inserted {} records from {} ({} already present).",
                outcome.inserted,
                csv.display(),
                outcome.duplicates
            );
            for (row, reason) in &outcome.rejected {
                println!("- row {row} rejected: {reason}");
            }
        }
        Commands::Score {
            bundle,
            member,
            since_days,
            limit,
            run,
        } => {
            let as_of = resolve_as_of(run.as_of.as_deref())?;
            let pipeline = build_pipeline(run.config.as_deref())?;
            let pool = connect().await?;
            let since = as_of - Duration::days(since_days);
            let records =
                db::fetch_records(&pool, since, bundle.as_deref(), member.as_deref()).await?;
            let output = pipeline
                .run(&records, as_of)
                .context("pipeline run failed")?;
            db::persist_output(&pool, &output).await?;

            let ranked = report::rank_assessments(&output);
            if ranked.is_empty() {
                println!("No refill activity found for this window.");
                return Ok(());
            }

            println!("Highest risk refills as of {}:", as_of.to_rfc3339());
            for assessment in ranked.iter().take(limit) {
                println!(
                    "- {} ({}) {} {} probability {:.2} confidence {:.2}{}",
                    assessment.refill_id,
                    assessment.bundle_id.as_deref().unwrap_or("unbundled"),
                    assessment.risk_type,
                    assessment.severity,
                    assessment.probability,
                    assessment.confidence,
                    if assessment.degraded { " (degraded)" } else { "" }
                );
            }
            if !output.rejected.is_empty() {
                println!("{} records were rejected.", output.rejected.len());
            }
        }
        Commands::Report {
            bundle,
            member,
            since_days,
            limit,
            out,
            run,
        } => {
            let as_of = resolve_as_of(run.as_of.as_deref())?;
            let pipeline = build_pipeline(run.config.as_deref())?;
            let pool = connect().await?;
            let since = as_of - Duration::days(since_days);
            let records =
                db::fetch_records(&pool, since, bundle.as_deref(), member.as_deref()).await?;
            let output = pipeline
                .run(&records, as_of)
                .context("pipeline run failed")?;
            let report = report::build_report(
                bundle.as_deref().or(member.as_deref()),
                since,
                &output,
                limit,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Assess { csv, run } => {
            let as_of = resolve_as_of(run.as_of.as_deref())?;
            let pipeline = build_pipeline(run.config.as_deref())?;
            let records = db::read_csv(&csv)?;
            let output = pipeline
                .run(&records, as_of)
                .context("pipeline run failed")?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Rules { export } => {
            let mapper = StatusMapper::with_default_rules();
            if export {
                println!("{}", serde_json::to_string_pretty(&mapper.export_rules())?);
                return Ok(());
            }
            println!("{}", serde_json::to_string_pretty(&mapper.statistics())?);
            let issues = mapper.validate_consistency();
            if issues.is_empty() {
                println!("No consistency issues.");
            } else {
                for issue in issues {
                    println!("- {issue}");
                }
            }
        }
    }

    Ok(())
}
