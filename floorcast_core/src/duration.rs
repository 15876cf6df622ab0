//! Task duration model.
//!
//! Generic tasks interpolate between their duration bounds by crew size:
//!
//! ```text
//! f        = clamp((assigned - min_workers) / (max_workers - min_workers), 0, 1)
//! duration = (max_duration - f * (max_duration - min_duration)) / mean_efficiency
//! ```
//!
//! Pick tasks are scored by the zone's [`PickTimeModel`](crate::PickTimeModel).

use chrono::Duration;
use rand::Rng;
use std::sync::Arc;

use crate::estimator::{EstimateError, EstimatorRegistry, PickTimeModel};
use crate::model::{PickAttributes, TaskDefinition, Worker};

/// Mean efficiency of a crew; an empty crew counts as nominal.
pub fn mean_efficiency<'a, I>(crew: I) -> f64
where
    I: IntoIterator<Item = &'a Worker>,
{
    let (sum, n) = crew
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), worker| (sum + worker.efficiency, n + 1));
    if n == 0 || sum <= 0.0 {
        1.0
    } else {
        sum / n as f64
    }
}

/// Converts fractional minutes to a whole-second offset.
pub fn minutes_to_duration(minutes: f64) -> Duration {
    if !minutes.is_finite() || minutes <= 0.0 {
        return Duration::zero();
    }
    Duration::seconds((minutes * 60.0).round() as i64)
}

/// Computes task durations in minutes.
#[derive(Debug, Clone, Default)]
pub struct DurationModel {
    estimators: Arc<EstimatorRegistry>,
}

impl DurationModel {
    pub fn new(estimators: Arc<EstimatorRegistry>) -> Self {
        Self { estimators }
    }

    /// Staffing fraction `f` for a crew of `assigned` workers.
    ///
    /// `max_workers == min_workers` is treated as a span of one worker.
    pub fn staffing_fraction(definition: &TaskDefinition, assigned: usize) -> f64 {
        let min = definition.min_crew() as f64;
        let span = (definition.max_crew() as f64 - min).max(1.0);
        ((assigned as f64 - min) / span).clamp(0.0, 1.0)
    }

    /// Minutes a generic task takes with `crew`.
    pub fn active_minutes(definition: &TaskDefinition, crew: &[Worker]) -> f64 {
        let f = Self::staffing_fraction(definition, crew.len());
        let max = f64::from(definition.max_duration);
        let min = f64::from(definition.min_duration);
        (max - f * (max - min)) / mean_efficiency(crew)
    }

    /// Minutes a pick takes for `worker`, via the model registered for `zone_name`.
    pub fn pick_minutes(
        &self,
        zone_name: &str,
        attributes: &PickAttributes,
        worker: &Worker,
    ) -> Result<f64, EstimateError> {
        Ok(self.estimators.estimate(zone_name, attributes, worker)? / 60.0)
    }

    /// Minutes a pick takes with an already resolved model.
    ///
    /// Non-finite or negative estimates count as zero.
    pub fn pick_minutes_with(
        model: &dyn PickTimeModel,
        attributes: &PickAttributes,
        worker: &Worker,
    ) -> f64 {
        (model.estimate_seconds(attributes, worker) / 60.0).max(0.0)
    }
}

/// Uniform real-world noise added by the day simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    spread_minutes: f64,
}

impl Jitter {
    pub fn minutes(spread_minutes: f64) -> Self {
        Self {
            spread_minutes: spread_minutes.abs(),
        }
    }

    pub fn none() -> Self {
        Self::minutes(0.0)
    }

    /// Adds a uniform offset in `[-spread, spread]`, never going below zero.
    pub fn apply<R: Rng + ?Sized>(&self, minutes: f64, rng: &mut R) -> f64 {
        if self.spread_minutes == 0.0 {
            return minutes.max(0.0);
        }
        let offset = rng.gen_range(-self.spread_minutes..=self.spread_minutes);
        (minutes + offset).max(0.0)
    }
}
