mod config;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::models::DataEnvelope;
use crate::pipeline::Pipeline;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "weather-etl", about = "CWA weather observation ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize on first run, otherwise fill the history gap and refresh realtime
    Run,

    /// Re-crawl the station roster
    RefreshStations,

    /// Refresh latest observations of active stations
    RefreshRealtime,

    /// Crawl daily history; without a range, fill the gap up to yesterday
    RefreshHistory {
        /// First day (YYYY-MM-DD)
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        /// Last day (YYYY-MM-DD), inclusive
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
    },

    /// Apply schema migrations without crawling
    Migrate,

    /// Show database statistics
    Stats,

    /// Print all stations as JSON
    Stations,

    /// Print latest observations of active stations as JSON
    Realtime,

    /// Print daily history as JSON
    History {
        /// Single station code
        #[arg(long, conflicts_with = "stations", required_unless_present = "stations")]
        station: Option<String>,
        /// Comma-separated station codes
        #[arg(long, value_delimiter = ',')]
        stations: Vec<String>,
        /// Range start, epoch seconds (inclusive)
        #[arg(long)]
        start: i64,
        /// Range end, epoch seconds (inclusive)
        #[arg(long)]
        end: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "weather_etl=info,warn",
        1 => "weather_etl=debug,info",
        _ => "trace",
    };

    // Logs go to stderr so JSON on stdout stays clean
    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run => {
            let _t = utils::Timer::start("Pipeline run");
            let stats = Pipeline::from_config(config)?.run().await?;
            println!("{}", stats);
        }

        Command::RefreshStations => {
            let _t = utils::Timer::start("Station roster refresh");
            let stats = Pipeline::from_config(config)?.refresh_stations().await?;
            println!("{}", stats);
        }

        Command::RefreshRealtime => {
            let _t = utils::Timer::start("Realtime refresh");
            let stats = Pipeline::from_config(config)?.refresh_realtime().await?;
            println!("{}", stats);
        }

        Command::RefreshHistory { start, end } => {
            let _t = utils::Timer::start("History refresh");
            let pipeline = Pipeline::from_config(config)?;
            let stats = match (start, end) {
                (Some(start), Some(end)) => pipeline.refresh_history(start, end).await?,
                _ => pipeline.fill_history_gap().await?,
            };
            println!("{}", stats);
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }

        Command::Stats => {
            let repo = open_store(&config)?;
            let offset = config.pipeline.utc_offset()?;
            let (min, max) = repo.history_date_range().unwrap_or((None, None));
            let initialized = repo
                .initialized_at()?
                .map(|at| at.to_string())
                .unwrap_or_else(|| "no".into());
            let last_run = repo
                .last_run()?
                .map(|(mode, status)| format!("{} ({})", mode, status))
                .unwrap_or_else(|| "—".into());

            println!("─────────────────────────────────");
            println!("  Weather ETL — Database Stats");
            println!("─────────────────────────────────");
            println!("  Stations     : {}", utils::fmt_number(repo.station_count()?));
            println!("  Realtime rows: {}", utils::fmt_number(repo.realtime_count()?));
            println!("  History rows : {}", utils::fmt_number(repo.history_count()?));
            println!("  From         : {}", utils::fmt_epoch_date(min, &offset));
            println!("  To           : {}", utils::fmt_epoch_date(max, &offset));
            println!("  Initialized  : {}", initialized);
            println!("  Last run     : {}", last_run);
            println!("  Realtime     : {}", if repo.realtime_is_stale()? { "STALE" } else { "fresh" });
            println!("─────────────────────────────────");
        }

        Command::Stations => {
            let repo = open_store(&config)?;
            print_json(&DataEnvelope::new(repo.list_stations()?))?;
        }

        Command::Realtime => {
            let repo = open_store(&config)?;
            let rows = repo.latest_realtime()?;
            print_json(&DataEnvelope::with_staleness(rows, repo.realtime_is_stale()?))?;
        }

        Command::History { station, stations, start, end } => {
            let repo = open_store(&config)?;
            let ids = match station {
                Some(id) => vec![id],
                None => stations,
            };
            print_json(&DataEnvelope::new(repo.history(&ids, start, end)?))?;
        }
    }

    Ok(())
}

fn open_store(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}

fn print_json<T: Serialize>(envelope: &DataEnvelope<T>) -> Result<()> {
    println!("{}", serde_json::to_string(envelope)?);
    Ok(())
}
