//! Floorcast simulation engines.
//!
//! This crate runs the warehouse model from `floorcast_core`: a per-zone
//! discrete simulation, the Monte Carlo forecaster built on it, and the
//! live minute-stepped day simulation that refreshes forecasts while it
//! plays.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DaySimulation                         │
//! │   minute ticks: shifts ─► staffing ─► picks ─► reap ─► sink  │
//! │                              │                               │
//! │                    every 30 min (one in flight)              │
//! │                              ▼                               │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ MonteCarloEngine  (N trials, bounded parallelism)      │  │
//! │  │    trial ─► ZoneSimulator × zones ─► TrialResult       │  │
//! │  │                      │                                 │  │
//! │  │                 WorkerPool + ZoneClock                 │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                              │                               │
//! │                              ▼                               │
//! │                WarehouseForecast (watch channel)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use floorcast_sim::{MonteCarloConfig, MonteCarloEngine, SimContext};
//!
//! let engine = MonteCarloEngine::new(
//!     SimContext::shared(42),
//!     MonteCarloConfig::default().with_trials(100),
//!     estimators,
//! );
//! let forecast = engine.forecast(&warehouse, reference).await?;
//! ```

mod cancel;
mod context;
pub mod day;
mod exporter;
pub mod monte_carlo;
mod sink;
pub mod zone;

pub use cancel::CancellationToken;
pub use context::SimContext;
pub use day::{DayConfig, DayError, DayHandle, DayReport, DaySimulation, DayStatus};
pub use exporter::{ForecastExport, TrialSummary, ZoneTrialSummary};
pub use monte_carlo::{ForecastError, MonteCarloConfig, MonteCarloEngine};
pub use sink::{MemorySink, NullSink, ProgressSink, SinkError, TaskEvent, TaskKind, ZoneProgress};
pub use zone::{ZoneRunConfig, ZoneSimulator, ZoneWork};
