//! Floorcast Core - the warehouse workday model
//!
//! Everything both engines share: the data model, the shift timetable, the
//! task duration model, the per-zone worker pool and the aggregation of
//! trial results into completion forecasts.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────────┐    ┌──────────────────┐
//! │  Warehouse   │───►│   WorkerPool   │◄──►│    ZoneClock     │
//! │ (snapshot)   │    │ acquire/release│    │ monotonic max    │
//! └──────┬───────┘    └───────┬────────┘    └──────────────────┘
//!        │                    │ grant
//!        ▼                    ▼
//! ┌──────────────┐    ┌────────────────┐    ┌──────────────────┐
//! │  Timetable   │    │ DurationModel  │───►│ EstimatorRegistry│
//! │ shift windows│    │ interpolation  │    │ (pick tasks)     │
//! └──────────────┘    └───────┬────────┘    └──────────────────┘
//!                             ▼
//!                     ┌────────────────┐
//!                     │  TrialResult   │──► aggregate() ──► ZoneForecast
//!                     └────────────────┘
//! ```

pub mod duration;
pub mod error;
pub mod estimator;
pub mod model;
pub mod pool;
pub mod results;
pub mod timetable;

// Re-export key types for convenience
pub use duration::{minutes_to_duration, DurationModel, Jitter};
pub use error::{ModelError, ZoneError};
pub use estimator::{EstimateError, EstimatorRegistry, LinearPickModel, PickTimeModel};
pub use model::{
    ActiveTask, Assignment, PickAttributes, PickTask, TaskDefinition, Warehouse, Worker, Zone,
};
pub use pool::{AcquireRequest, Grant, WorkerPool, ZoneClock};
pub use results::{
    aggregate, completion_curve, CompletedTask, CurvePoint, TrialResult, WarehouseForecast,
    ZoneForecast, ZoneOutcome, ZoneRun,
};
pub use timetable::{ShiftWindow, Timetable};
