//! Floorcast CLI
//!
//! Forecast zone completion times or play a whole workday from a
//! warehouse JSON file.

use chrono::{NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use floorcast_core::{EstimatorRegistry, LinearPickModel, Warehouse, ZoneForecast};
use floorcast_env::{TokioContext, ZoneId};
use floorcast_sim::{
    DayConfig, DaySimulation, ForecastExport, MemorySink, MonteCarloConfig, MonteCarloEngine,
    SimContext,
};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Floorcast warehouse completion forecaster
#[derive(Parser, Debug)]
#[command(name = "floorcast-sim")]
#[command(about = "Forecast when each warehouse zone finishes its day", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a Monte Carlo forecast
    Forecast(ForecastArgs),
    /// Play one workday minute by minute
    Day(DayArgs),
}

#[derive(Args, Debug)]
struct ForecastArgs {
    /// Warehouse JSON file
    #[arg(short, long)]
    input: String,

    /// Number of trials
    #[arg(short, long, default_value = "100")]
    trials: usize,

    /// Forecast a single zone
    #[arg(short, long)]
    zone: Option<u64>,

    /// Reference time, "YYYY-MM-DD HH:MM" (default: now)
    #[arg(long)]
    at: Option<String>,

    /// Master seed (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// Export the forecast and trial summaries to a JSON file
    #[arg(long)]
    export: Option<String>,
}

#[derive(Args, Debug)]
struct DayArgs {
    /// Warehouse JSON file
    #[arg(short, long)]
    input: String,

    /// Day to play, "YYYY-MM-DD" (default: today)
    #[arg(short, long)]
    date: Option<String>,

    /// Real minutes one simulated day takes (0 = as fast as possible)
    #[arg(short, long, default_value = "0")]
    minutes: f64,

    /// Speed multiplier
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Trials per forecast refresh
    #[arg(short, long, default_value = "50")]
    trials: usize,

    /// Seed for refresh forecasts (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// JSON output
    #[arg(long)]
    json: bool,
}

fn fail(message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    std::process::exit(1);
}

fn resolve_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(42)
}

fn load_warehouse(path: &str) -> Warehouse {
    let json = std::fs::read_to_string(path)
        .unwrap_or_else(|e| fail(format!("Cannot read {}: {}", path, e)));
    let warehouse = Warehouse::from_json(&json).unwrap_or_else(|e| fail(e));
    if let Err(e) = warehouse.validate() {
        fail(e);
    }
    warehouse
}

/// One linear pick model per pick zone.
fn estimators_for(warehouse: &Warehouse) -> Arc<EstimatorRegistry> {
    let mut registry = EstimatorRegistry::new();
    for zone in warehouse.zones.iter().filter(|z| z.is_pick_zone) {
        registry.register(&zone.name, Arc::new(LinearPickModel::default()));
    }
    Arc::new(registry)
}

fn zone_line(warehouse: &Warehouse, forecast: &ZoneForecast) -> String {
    let zone = forecast.zone();
    match (warehouse.zone(zone), forecast) {
        (Some(z), ZoneForecast::Completion { .. }) => {
            format!("zone {} {}: {}", zone.get(), z.name, forecast.wire())
        }
        (None, ZoneForecast::Completion { .. }) => {
            format!("zone {}: {}", zone.get(), forecast.wire())
        }
        (_, ZoneForecast::Failed { .. }) => {
            format!("zone {}: error {}", zone.get(), forecast.wire())
        }
    }
}

async fn run_forecast(args: ForecastArgs) {
    let warehouse = load_warehouse(&args.input);
    let reference = match &args.at {
        Some(at) => NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M")
            .unwrap_or_else(|e| fail(format!("Invalid --at '{}': {}", at, e))),
        None => chrono::Local::now().naive_local(),
    };
    let seed = resolve_seed(args.seed);

    let engine = MonteCarloEngine::new(
        SimContext::shared(seed),
        MonteCarloConfig::default().with_trials(args.trials).with_seed(seed),
        estimators_for(&warehouse),
    );

    let trials = match args.zone {
        Some(zone) => {
            engine
                .run_zone_trials(args.trials, &warehouse, ZoneId(zone), reference)
                .await
        }
        None => engine.run_trials(args.trials, &warehouse, reference).await,
    }
    .unwrap_or_else(|e| fail(e));
    let export = ForecastExport::from_trials(&trials, reference, seed);

    if let Some(path) = &args.export {
        match export.write_to_file(path) {
            Ok(()) => info!("Exported {} trials to {}", export.trials.len(), path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&export.forecast) {
            Ok(json) => println!("{}", json),
            Err(e) => fail(e),
        }
        return;
    }

    info!("Forecast at {} ({} trials, seed={})", reference, export.forecast.trials, seed);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for forecast in export.forecast.zones.values() {
        println!("{}", zone_line(&warehouse, forecast));
    }
    if let Some(finish) = export.forecast.finish_at() {
        info!("Warehouse done at {}", finish.format("%H:%M"));
    }
}

async fn run_day(args: DayArgs) {
    let warehouse = load_warehouse(&args.input);
    let date = match &args.date {
        Some(date) => NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap_or_else(|e| fail(format!("Invalid --date '{}': {}", date, e))),
        None => chrono::Local::now().date_naive(),
    };
    let seed = resolve_seed(args.seed);

    let config = DayConfig::default()
        .with_simulation_minutes(args.minutes)
        .with_speed(args.speed)
        .with_forecast(
            MonteCarloConfig::default()
                .with_trials(args.trials)
                .with_seed(seed),
        );
    // The live day runs on the wall clock so --minutes and --speed pace it.
    let sink = Arc::new(MemorySink::new());
    let mut day = DaySimulation::new(
        TokioContext::shared(),
        config,
        &warehouse,
        date,
        estimators_for(&warehouse),
        Arc::clone(&sink),
    )
    .unwrap_or_else(|e| fail(e));
    let handle = day.handle();

    let report = day.run().await.unwrap_or_else(|e| fail(e));
    let forecast = handle.latest_forecast();

    if args.json {
        let summary = serde_json::json!({
            "report": report,
            "started": sink.started().len(),
            "finished": sink.finished().len(),
            "forecast": forecast,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => fail(e),
        }
        return;
    }

    info!(
        "Day {} finished: {} ticks, {} refreshes, {} tasks done",
        report.date,
        report.ticks,
        report.refreshes,
        sink.finished().len()
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for (zone, progress) in &report.zones {
        println!(
            "zone {}: {} done, {} outstanding, {} items picked",
            zone.get(),
            progress.completed_tasks,
            progress.outstanding_tasks,
            progress.items_picked
        );
    }
    if let Some(forecast) = forecast {
        info!("Last forecast (made at {}):", forecast.reference.format("%H:%M"));
        for zone in forecast.zones.values() {
            println!("  {}", zone_line(&warehouse, zone));
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    match cli.command {
        Command::Forecast(args) => run_forecast(args).await,
        Command::Day(args) => run_day(args).await,
    }
}
