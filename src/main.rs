mod browser;
mod config;
mod error;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "waterq-etl", about = "Surface water quality harvest ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest all configured pages once and persist readings
    Run,

    /// Show database statistics
    Stats,

    /// List all stored monitoring stations
    Stations,

    /// Apply schema migrations without harvesting
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "waterq_etl=info,warn",
        1 => "waterq_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run => {
            let _t = utils::Timer::start("Harvest run");
            let stats = Pipeline::new(config).run().await?;
            info!(
                "Done: {} pages, {} rows seen, {} new readings, {} snapshots -> {}",
                stats.pages_processed,
                utils::fmt_number(stats.rows_seen as i64),
                utils::fmt_number(stats.rows_inserted as i64),
                stats.snapshots.len(),
                stats.database_path,
            );
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path)?;
            let stations = repo.station_count()?;
            let readings = repo.reading_count()?;
            let (min, max) = repo.observed_range().unwrap_or((None, None));
            println!("─────────────────────────────────");
            println!("  waterq-etl — Database Stats");
            println!("─────────────────────────────────");
            println!("  Stations : {}", utils::fmt_number(stations));
            println!("  Readings : {}", utils::fmt_number(readings));
            println!("  From     : {}", utils::fmt_opt_timestamp(min));
            println!("  To       : {}", utils::fmt_opt_timestamp(max));
            println!("─────────────────────────────────");
        }

        Command::Stations => {
            let repo = Repository::open(&config.storage.db_path)?;
            let stations = repo.list_stations()?;
            if stations.is_empty() {
                println!("No stations — run `waterq-etl run` first.");
            } else {
                println!("{} stations:", stations.len());
                for s in &stations {
                    println!(
                        "  {:<10} {} / {} / {}",
                        s.fields.station_code.as_deref().unwrap_or("-"),
                        s.fields.province.as_deref().unwrap_or("—"),
                        s.fields.city.as_deref().unwrap_or("—"),
                        s.fields.station_name.as_deref().unwrap_or("—"),
                    );
                }
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
