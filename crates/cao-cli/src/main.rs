//! cao - dealership inventory "Compare and Order" toolkit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cao_core::{DealershipConfig, FilteringRules, OutputRules};
use cao_ingest::StandardNormalizer;
use cao_order::{CaoConfig, OrderOptions, OrderPipeline, Severity};
use cao_storage::RulesKind;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cao")]
#[command(about = "Dealership CAO command-line interface")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Import a scraper CSV export as a new batch
    Import {
        csv: PathBuf,
        /// Make the new batch the active import
        #[arg(long)]
        activate: bool,
        /// Location for rows without a dealer column
        #[arg(long)]
        location: Option<String>,
    },
    /// Make an import the single active one
    Activate { import_id: i64 },
    /// List recent imports
    Imports {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// (Re)derive normalized rows; defaults to the active import
    Normalize { import_id: Option<i64> },
    /// Run CAO for one dealership
    Order {
        dealership: String,
        #[arg(long)]
        dry_run: bool,
        /// Record exported VINs in the VIN log
        #[arg(long)]
        record: bool,
        #[arg(long)]
        order_number: Option<String>,
    },
    /// Run CAO for every active dealership
    OrderAll {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        record: bool,
        #[arg(long)]
        order_number: Option<String>,
    },
    #[command(subcommand)]
    VinLog(VinLogCommands),
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Report data consistency problems
    Check,
    /// Run the cron scheduler until interrupted
    Schedule,
}

#[derive(Debug, Subcommand)]
enum VinLogCommands {
    /// Load a VIN-log history CSV
    Import { dealership: String, csv: PathBuf },
    /// Bring a VIN log to the uniform layout
    Standardize { dealership: String },
    Count { dealership: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    Show { dealership: String },
    /// Merge a JSON object into filtering_rules
    SetFilter { dealership: String, json: String },
    /// Merge a JSON object into output_rules
    SetOutput { dealership: String, json: String },
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "cao=debug,cao_core=debug,cao_ingest=debug,cao_storage=debug,cao_order=debug"
    } else {
        "cao=info,cao_core=info,cao_ingest=info,cao_storage=info,cao_order=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CaoConfig::from_env();
    let pipeline = OrderPipeline::from_config(config).await?;
    let store = pipeline.store();

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Import {
            csv,
            activate,
            location,
        } => {
            let summary = pipeline
                .import_scraper_file(&csv, location.as_deref(), activate)
                .await?;
            println!(
                "import {}: vehicles={} skipped={} normalized={} status={} reused={}",
                summary.import.import_id,
                summary.import.total_vehicles,
                summary.skipped_rows,
                summary.normalized_rows,
                summary.import.status.as_str(),
                summary.already_imported
            );
        }
        Commands::Activate { import_id } => {
            let import = store.activate_import(import_id).await?;
            println!("import {} is now active", import.import_id);
        }
        Commands::Imports { limit } => {
            for import in store.list_imports(limit).await? {
                println!(
                    "{:>6}  {:<8}  {}  vehicles={:<6} {}",
                    import.import_id,
                    import.status.as_str(),
                    import.import_date.format("%Y-%m-%d %H:%M"),
                    import.total_vehicles,
                    import.dealerships_list.join(", ")
                );
            }
        }
        Commands::Normalize { import_id } => {
            let import_id = match import_id {
                Some(id) => id,
                None => store.active_import().await?.import_id,
            };
            let rows = store.normalize_import(import_id, &StandardNormalizer).await?;
            println!("import {import_id}: normalized {rows} rows");
        }
        Commands::Order {
            dealership,
            dry_run,
            record,
            order_number,
        } => {
            let options = OrderOptions {
                dry_run,
                record,
                order_number,
            };
            let summary = pipeline.run(&dealership, &options).await?;
            print_json(&summary)?;
        }
        Commands::OrderAll {
            dry_run,
            record,
            order_number,
        } => {
            let options = OrderOptions {
                dry_run,
                record,
                order_number,
            };
            let batch = pipeline.run_all(&options).await?;
            for summary in &batch.succeeded {
                println!(
                    "{}: new={} logged={} passed={} export={}",
                    summary.dealership,
                    summary.new_vehicles,
                    summary.already_logged,
                    summary.passed_filters,
                    summary.export_path.as_deref().unwrap_or("-")
                );
            }
            for (name, err) in &batch.failed {
                eprintln!("{name}: FAILED {err}");
            }
            if !batch.failed.is_empty() {
                bail!(
                    "{} of {} dealerships failed",
                    batch.failed.len(),
                    batch.failed.len() + batch.succeeded.len()
                );
            }
        }
        Commands::VinLog(VinLogCommands::Import { dealership, csv }) => {
            let summary = pipeline.import_vin_log_file(&dealership, &csv).await?;
            print_json(&summary)?;
        }
        Commands::VinLog(VinLogCommands::Standardize { dealership }) => {
            let resolved = pipeline.resolve(&dealership);
            let layout = store.ensure_vin_log(&resolved.config_name).await?;
            print_json(&layout.to_json())?;
        }
        Commands::VinLog(VinLogCommands::Count { dealership }) => {
            let resolved = pipeline.resolve(&dealership);
            let count = store.vin_log_count(&resolved.config_name).await?;
            println!("{}: {count} logged VINs", resolved.config_name);
        }
        Commands::Config(ConfigCommands::Show { dealership }) => {
            let (_, config) = pipeline.resolve_config(&dealership).await?;
            print_json(&config)?;
        }
        Commands::Config(ConfigCommands::SetFilter { dealership, json }) => {
            set_rules(&pipeline, &dealership, RulesKind::Filtering, &json).await?;
        }
        Commands::Config(ConfigCommands::SetOutput { dealership, json }) => {
            set_rules(&pipeline, &dealership, RulesKind::Output, &json).await?;
        }
        Commands::Check => {
            let report = pipeline.check_consistency().await?;
            for finding in &report.findings {
                println!(
                    "[{:?}] {} {}: {}",
                    finding.severity, finding.code, finding.subject, finding.message
                );
            }
            println!(
                "{} errors, {} warnings, {} notes",
                report.count(Severity::Error),
                report.count(Severity::Warning),
                report.count(Severity::Info)
            );
            if report.has_errors() {
                bail!("consistency check failed");
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set CAO_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().order_cron, "scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("scheduler stopping");
        }
    }

    Ok(())
}

/// Merges `json` into one rule blob, creating the config on first use.
async fn set_rules(
    pipeline: &OrderPipeline,
    dealership: &str,
    kind: RulesKind,
    json: &str,
) -> Result<()> {
    let patch: serde_json::Value =
        serde_json::from_str(json).context("rules patch is not valid JSON")?;
    if !patch.is_object() {
        bail!("rules patch must be a JSON object");
    }

    let store = pipeline.store();
    let name = pipeline.resolve(dealership).config_name;
    if store.get_config(&name).await?.is_none() {
        store.upsert_config(&DealershipConfig::new(name.as_str())).await?;
    }
    let config = store.patch_rules(&name, kind, &patch).await?;

    let warnings = match kind {
        RulesKind::Filtering => filtering_warnings(&config.filtering_rules),
        RulesKind::Output => output_warnings(&config.output_rules),
    };
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    print_json(&config)
}

fn filtering_warnings(rules: &FilteringRules) -> Vec<String> {
    let mut warnings = rules.contradictions();
    for token in rules.unknown_condition_tokens() {
        warnings.push(format!("unknown condition `{token}` is ignored"));
    }
    warnings
}

fn output_warnings(rules: &OutputRules) -> Vec<String> {
    rules
        .unknown_fields()
        .into_iter()
        .map(|f| format!("unknown output field `{f}`"))
        .collect()
}
