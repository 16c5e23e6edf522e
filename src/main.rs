use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod aggregate;
mod allocate;
mod db;
mod diagnostics;
mod fiscal;
mod import;
mod models;
mod report;
mod sync;
mod verify;

#[derive(Parser)]
#[command(name = "tni-reconcile")]
#[command(
    about = "Training target reconciliation and factory-balanced nominee allocation",
    long_about = None
)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[arg(long, env = "TNI_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Import the training catalog from a CSV file
    ImportCatalog {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Replace a year's nominees with a wide nomination sheet
    ImportNominees {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        year: Option<i32>,
        /// Run allocation and verification after the upload
        #[arg(long)]
        allocate: bool,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Import attendance records from a CSV file
    ImportAttendance {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Create a fiscal year from an earlier year's structure and the catalog
    InitYear {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        source_year: Option<i32>,
    },
    /// Seed target rows from the active training catalog
    SyncTargets {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        json: bool,
    },
    /// Set the target headcount and batch size of one training
    SetTarget {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        training: String,
        #[arg(long)]
        target: i32,
        #[arg(long, default_value_t = 0)]
        batch_size: i32,
    },
    /// Select a factory-balanced set of nominees for every training
    Allocate {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        skip_verify: bool,
        #[arg(long)]
        json: bool,
    },
    /// Re-count allocations against targets and repair mismatches
    Verify {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Roll attendance up into monthly and year-to-date actuals
    Aggregate {
        #[arg(long)]
        year: Option<i32>,
        /// Only count trainings whose name contains this text
        #[arg(long)]
        training: Option<String>,
        /// TNI status filter ("All" disables it)
        #[arg(long)]
        tni_status: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List attendance training names that do not match the catalog
    ValidateNames {
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Export the target dashboard as CSV
    ExportTargets {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long, default_value = "targets.csv")]
        out: PathBuf,
    },
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn resolve_year(year: Option<i32>) -> i32 {
    year.unwrap_or_else(|| fiscal::fiscal_year_of(today()))
}

/// Seeded RNG; a fresh seed is drawn and logged when none is given so the run
/// can be replayed.
fn rng_for(seed: Option<u64>) -> StdRng {
    let seed = seed.unwrap_or_else(rand::random);
    info!(seed, "sampling seed");
    StdRng::seed_from_u64(seed)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn allocate_and_verify(
    pool: &sqlx::PgPool,
    year: i32,
    seed: Option<u64>,
    skip_verify: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut rng = rng_for(seed);
    let summary = allocate::run(pool, year, &mut rng).await?;
    let verification = if skip_verify {
        None
    } else {
        Some(verify::run(pool, year, &mut rng).await?)
    };

    if json {
        return print_json(&serde_json::json!({
            "allocation": summary,
            "verification": verification,
        }));
    }

    println!("Allocation for fiscal year {year}:");
    for outcome in &summary.outcomes {
        let status = if outcome.target_met() { "" } else { " (target not met)" };
        println!(
            "- {}: {} of {} nominees selected for target {}{}",
            outcome.training_name,
            outcome.selected.len(),
            outcome.actual_count,
            outcome.target,
            status
        );
    }
    println!(
        "Total records inserted: {} ({} trainings skipped with zero target)",
        summary.total_inserted, summary.skipped_zero_target
    );
    if let Some(report) = verification {
        print_verification(&report);
    }
    Ok(())
}

fn print_verification(report: &verify::VerificationReport) {
    println!(
        "Repairs applied: {}",
        report.repairs.len() - report.failed.len()
    );
    for training in &report.failed {
        println!("- repair failed for {training}");
    }
    for mismatch in &report.residual {
        println!(
            "Warning: {} has {} records but target is {}",
            mismatch.training_name, mismatch.final_count, mismatch.target
        );
    }
    println!("Final grand total: {}", report.grand_total);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tni_reconcile=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let pool = db::connect(&cli.database_url, cli.max_connections).await?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { year } => {
            let year = resolve_year(year);
            db::seed(&pool, year).await?;
            println!("Seed data inserted for fiscal year {year}.");
        }
        Commands::ImportCatalog { csv } => {
            let entries = import::read_catalog_file(&csv)?;
            let written = db::upsert_catalog(&pool, &entries).await?;
            println!("Imported {written} catalog entries from {}.", csv.display());
        }
        Commands::ImportNominees {
            csv,
            year,
            allocate,
            seed,
        } => {
            let year = resolve_year(year);
            let sheet = import::read_nominee_file(&csv, year)?;
            let inserted = db::replace_nominees(&pool, year, &sheet.records).await?;
            println!(
                "Inserted {inserted} nominations across {} trainings for fiscal year {year} ({} rows skipped).",
                sheet.training_columns.len(),
                sheet.skipped
            );
            if allocate {
                allocate_and_verify(&pool, year, seed, false, false).await?;
            }
        }
        Commands::ImportAttendance { csv } => {
            let records = import::read_attendance_file(&csv)?;
            let written = db::insert_attendance(&pool, &records).await?;
            println!("Recorded {written} attendance rows from {}.", csv.display());
        }
        Commands::InitYear { year, source_year } => {
            let summary = sync::initialize_year(&pool, year, source_year).await?;
            match summary.source_year {
                Some(source) => println!(
                    "Initialized {year} from {source}: {} copied, {} added from catalog.",
                    summary.copied, summary.sync.inserted
                ),
                None => println!(
                    "Initialized {year} from catalog: {} trainings added.",
                    summary.sync.inserted
                ),
            }
        }
        Commands::SyncTargets { year, json } => {
            let summary = sync::sync_catalog_into_targets(&pool, resolve_year(year)).await?;
            if json {
                print_json(&summary)?;
            } else {
                println!(
                    "Synced {} training records ({} new, {} recategorized).",
                    summary.catalog_rows, summary.inserted, summary.refreshed
                );
            }
        }
        Commands::SetTarget {
            year,
            training,
            target,
            batch_size,
        } => {
            let year = resolve_year(year);
            sync::set_target(&pool, year, &training, target, batch_size, today()).await?;
            println!("Updated {training} for fiscal year {year}.");
        }
        Commands::Allocate {
            year,
            seed,
            skip_verify,
            json,
        } => {
            allocate_and_verify(&pool, resolve_year(year), seed, skip_verify, json).await?;
        }
        Commands::Verify { year, seed, json } => {
            let mut rng = rng_for(seed);
            let report = verify::run(&pool, resolve_year(year), &mut rng).await?;
            if json {
                print_json(&report)?;
            } else {
                print_verification(&report);
            }
        }
        Commands::Aggregate {
            year,
            training,
            tni_status,
            json,
        } => {
            let filter = db::AttendanceFilter::new(training, tni_status);
            let outcome = aggregate::run(&pool, resolve_year(year), &filter, today()).await?;
            if json {
                print_json(&outcome)?;
            } else {
                match outcome {
                    aggregate::AggregationOutcome::NoRecords => {
                        println!("No attendance records found matching criteria.");
                    }
                    aggregate::AggregationOutcome::Updated {
                        updated,
                        matched,
                        unmatched,
                        ..
                    } => {
                        println!("Updated {updated} targets ({matched} with attendance).");
                        for entry in unmatched {
                            if entry.suggestions.is_empty() {
                                println!("- unmatched: {}", entry.training_name);
                            } else {
                                println!(
                                    "- unmatched: {} -> potential match(es): {}",
                                    entry.training_name,
                                    entry.suggestions.join(", ")
                                );
                            }
                        }
                    }
                }
            }
        }
        Commands::ValidateNames { json } => {
            let report = diagnostics::validate_names(&pool).await?;
            if json {
                print_json(&report)?;
            } else {
                println!("{} attendance names have no catalog match.", report.unmatched_count);
                for (name, candidates) in &report.potential_matches {
                    println!("- {name}: possibly {}", candidates.join(", "));
                }
                for name in &report.fully_unmatched {
                    println!("- {name}: no candidates");
                }
            }
        }
        Commands::Report { year, out } => {
            let year = resolve_year(year);
            let targets = db::fetch_targets(&pool, year).await?;
            let dashboard = report::build_dashboard(&targets, fiscal::month_index(today()));
            let nominee_counts = db::fetch_nominee_counts(&pool, year).await?;
            let summary = report::training_summary(&nominee_counts, &targets);
            let submitted = report::factory_pivot(
                &db::fetch_factory_counts(&pool, year, db::NomineeSource::Submitted).await?,
            );
            let allocated = report::factory_pivot(
                &db::fetch_factory_counts(&pool, year, db::NomineeSource::Allocated).await?,
            );
            let body = report::build_report(
                year,
                &dashboard,
                &summary,
                submitted.as_ref(),
                allocated.as_ref(),
            );
            std::fs::write(&out, body)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::ExportTargets { year, out } => {
            let year = resolve_year(year);
            let targets = db::fetch_targets(&pool, year).await?;
            let rows = report::build_dashboard(&targets, fiscal::month_index(today()));
            let writer = csv::Writer::from_path(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            report::write_dashboard_csv(writer, &rows)?;
            println!("Exported {} rows to {}.", rows.len(), out.display());
        }
    }

    pool.close().await;
    Ok(())
}
