//! MonteCarloEngine - many independent trials of the remaining workday.
//!
//! ```text
//! forecast(warehouse, reference)
//!   └─ Semaphore(max_parallel_trials)
//!        ├─ trial 0 ─ JoinSet ─┬─ ZoneSimulator(zone A, private copy)
//!        │                     └─ ZoneSimulator(zone B, private copy)
//!        ├─ trial 1 ─ ...
//!        └─ trial N-1
//!   └─ aggregate() ─► WarehouseForecast
//! ```

use chrono::NaiveDateTime;
use floorcast_core::{
    EstimateError, EstimatorRegistry, ModelError, PickTimeModel, Timetable, TrialResult, Warehouse,
    WarehouseForecast, ZoneForecast,
};
use floorcast_env::{EnvError, FloorContext, ZoneId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::zone::{ZoneRunConfig, ZoneSimulator, ZoneWork};

/// Errors from a forecast request.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("at least one trial is required")]
    NoTrials,

    #[error("unknown zone {0}")]
    UnknownZone(ZoneId),

    #[error(transparent)]
    MissingModel(#[from] EstimateError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("trial failed: {0}")]
    Env(#[from] EnvError),

    #[error("forecast cancelled")]
    Cancelled,
}

/// Configuration for a forecast run.
#[derive(Debug, Clone, Copy)]
pub struct MonteCarloConfig {
    /// Trials per forecast
    pub trials: usize,

    /// Wall-clock ceiling per zone-trial
    pub zone_timeout: Duration,

    /// Trials allowed to run at once
    pub max_parallel_trials: usize,

    /// Context sleep per simulated task minute
    pub minute_scale: Duration,

    /// Master seed (only meaningful with a deterministic context)
    pub seed: u64,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            trials: 100,
            zone_timeout: Duration::from_secs(120),
            max_parallel_trials: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            minute_scale: Duration::ZERO,
            seed: 42,
        }
    }
}

impl MonteCarloConfig {
    pub fn with_trials(mut self, trials: usize) -> Self {
        self.trials = trials;
        self
    }

    pub fn with_zone_timeout(mut self, timeout: Duration) -> Self {
        self.zone_timeout = timeout;
        self
    }

    pub fn with_max_parallel_trials(mut self, n: usize) -> Self {
        self.max_parallel_trials = n.max(1);
        self
    }

    pub fn with_minute_scale(mut self, scale: Duration) -> Self {
        self.minute_scale = scale;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Everything a trial needs, shared read-only across trials.
struct TrialInput {
    warehouse: Warehouse,
    timetable: Arc<Timetable>,
    zones: Vec<ZoneId>,
    models: HashMap<ZoneId, Arc<dyn PickTimeModel>>,
    reference: NaiveDateTime,
}

/// Runs forecast trials against a [`FloorContext`].
pub struct MonteCarloEngine<Ctx: FloorContext> {
    context: Arc<Ctx>,
    config: MonteCarloConfig,
    estimators: Arc<EstimatorRegistry>,
    cancel: Option<CancellationToken>,
}

impl<Ctx: FloorContext> Clone for MonteCarloEngine<Ctx> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            config: self.config,
            estimators: Arc::clone(&self.estimators),
            cancel: self.cancel.clone(),
        }
    }
}

impl<Ctx: FloorContext> MonteCarloEngine<Ctx> {
    pub fn new(
        context: Arc<Ctx>,
        config: MonteCarloConfig,
        estimators: Arc<EstimatorRegistry>,
    ) -> Self {
        Self {
            context,
            config,
            estimators,
            cancel: None,
        }
    }

    /// Stops scheduling new trials once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &MonteCarloConfig {
        &self.config
    }

    /// Runs `trials` trials over every zone of `warehouse`.
    pub async fn run_trials(
        &self,
        trials: usize,
        warehouse: &Warehouse,
        reference: NaiveDateTime,
    ) -> Result<Vec<TrialResult>, ForecastError> {
        let zones = warehouse.zones.iter().map(|z| z.id).collect();
        self.run_selected(trials, warehouse, zones, reference).await
    }

    /// Runs `trials` trials over a single zone.
    pub async fn run_zone_trials(
        &self,
        trials: usize,
        warehouse: &Warehouse,
        zone: ZoneId,
        reference: NaiveDateTime,
    ) -> Result<Vec<TrialResult>, ForecastError> {
        if warehouse.zone(zone).is_none() {
            return Err(ForecastError::UnknownZone(zone));
        }
        self.run_selected(trials, warehouse, vec![zone], reference).await
    }

    /// Runs the configured number of trials and aggregates them.
    pub async fn forecast(
        &self,
        warehouse: &Warehouse,
        reference: NaiveDateTime,
    ) -> Result<WarehouseForecast, ForecastError> {
        let trials = self.run_trials(self.config.trials, warehouse, reference).await?;
        let forecast = WarehouseForecast::from_trials(&trials, reference);
        for zone in forecast.zones.values() {
            if let ZoneForecast::Failed { zone, error } = zone {
                warn!(zone = %zone, code = error.code(), "Zone produced no completion: {}", error);
            }
        }
        info!(
            trials = forecast.trials,
            zones = forecast.zones.len(),
            finish = ?forecast.finish_at(),
            "Forecast complete"
        );
        Ok(forecast)
    }

    /// Forecast for one zone only.
    pub async fn forecast_zone(
        &self,
        warehouse: &Warehouse,
        zone: ZoneId,
        reference: NaiveDateTime,
    ) -> Result<ZoneForecast, ForecastError> {
        let trials = self
            .run_zone_trials(self.config.trials, warehouse, zone, reference)
            .await?;
        floorcast_core::aggregate(&trials, reference)
            .remove(&zone)
            .ok_or(ForecastError::UnknownZone(zone))
    }

    async fn run_selected(
        &self,
        trials: usize,
        warehouse: &Warehouse,
        zones: Vec<ZoneId>,
        reference: NaiveDateTime,
    ) -> Result<Vec<TrialResult>, ForecastError> {
        if trials == 0 {
            return Err(ForecastError::NoTrials);
        }

        let snapshot = warehouse.snapshot_for(reference.date());
        let mut models = HashMap::new();
        for zone in snapshot.zones.iter().filter(|z| z.is_pick_zone && zones.contains(&z.id)) {
            if snapshot.zone_pick_tasks(zone.id).next().is_some() {
                models.insert(zone.id, self.estimators.model_for(&zone.name)?);
            }
        }

        info!(trials, zones = zones.len(), %reference, "Starting forecast trials");

        let input = Arc::new(TrialInput {
            timetable: Arc::new(snapshot.timetable.clone()),
            warehouse: snapshot,
            zones,
            models,
            reference,
        });
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_trials.max(1)));
        let mut set = JoinSet::new();

        for trial in 0..trials {
            if self.is_cancelled() {
                set.abort_all();
                info!(trial, "Forecast cancelled before trial start");
                return Err(ForecastError::Cancelled);
            }
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(EnvError::join)?;
            let input = Arc::clone(&input);
            let context = Arc::clone(&self.context);
            let config = self.config;
            set.spawn(async move {
                let result = run_trial(trial, &input, context, config).await;
                drop(permit);
                result
            });
        }

        let mut results = Vec::with_capacity(trials);
        while let Some(joined) = set.join_next().await {
            results.push(joined.map_err(EnvError::join)?);
        }
        results.sort_by_key(|r| r.trial);
        Ok(results)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// One trial: every selected zone concurrently, on private copies.
async fn run_trial<Ctx: FloorContext>(
    trial: usize,
    input: &TrialInput,
    context: Arc<Ctx>,
    config: MonteCarloConfig,
) -> TrialResult {
    let mut zones = JoinSet::new();

    for zone_id in &input.zones {
        let Some(zone) = input.warehouse.zone(*zone_id).cloned() else {
            continue;
        };
        let workers = input.warehouse.zone_workers(zone.id).cloned().collect();
        let work = if zone.is_pick_zone {
            let tasks: Vec<_> = input.warehouse.zone_pick_tasks(zone.id).cloned().collect();
            match input.models.get(&zone.id) {
                Some(model) => ZoneWork::Pick {
                    tasks,
                    model: Arc::clone(model),
                },
                // No pick tasks, so no model was resolved
                None => ZoneWork::Active(Vec::new()),
            }
        } else {
            ZoneWork::Active(input.warehouse.zone_active_tasks(zone.id).cloned().collect())
        };

        let seed = context.derive_seed(((trial as u64) << 32) ^ zone.id.get());
        let simulator = ZoneSimulator::new(
            Arc::clone(&context),
            ZoneRunConfig::default()
                .with_timeout(config.zone_timeout)
                .with_minute_scale(config.minute_scale)
                .with_seed(seed),
        );
        let timetable = Arc::clone(&input.timetable);
        let reference = input.reference;
        zones.spawn(async move {
            let outcome = simulator.run(&zone, workers, work, timetable, reference).await;
            (zone.id, outcome)
        });
    }

    let mut result = TrialResult::new(trial);
    while let Some(joined) = zones.join_next().await {
        match joined {
            Ok((zone, outcome)) => {
                if let Err(err) = &outcome {
                    debug!(trial, zone = %zone, code = err.code(), "Zone failed");
                }
                result.zones.insert(zone, outcome);
            }
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => {}
        }
    }
    debug!(trial, latest = ?result.latest_end(), "Trial finished");
    result
}
