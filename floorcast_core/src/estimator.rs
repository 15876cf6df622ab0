//! Pick-time estimator contract.
//!
//! The regression model that scores pick tasks lives outside this crate.
//! Engines only see [`PickTimeModel`]: attributes and a worker in, seconds
//! out. Models are registered per zone name, case-insensitively.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{PickAttributes, Worker};

/// Errors raised when asking for a pick-time estimate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimateError {
    /// No model registered under the zone's name
    #[error("no pick-time model registered for zone '{0}'")]
    MissingModel(String),

    /// The model produced something that is not a duration
    #[error("model for zone '{zone}' returned invalid estimate {seconds}")]
    InvalidEstimate { zone: String, seconds: f64 },
}

/// An opaque pick-time estimator.
pub trait PickTimeModel: Send + Sync {
    /// Estimated seconds for `worker` to complete a pick with `attributes`.
    fn estimate_seconds(&self, attributes: &PickAttributes, worker: &Worker) -> f64;
}

/// A linear estimator over the pick attributes, scaled by worker efficiency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearPickModel {
    pub base_s: f64,
    pub per_meter_s: f64,
    pub per_pack_s: f64,
    pub per_line_s: f64,
    pub per_kg_s: f64,
    pub per_litre_s: f64,
    pub per_height_s: f64,
}

impl Default for LinearPickModel {
    fn default() -> Self {
        Self {
            base_s: 30.0,
            per_meter_s: 0.9,
            per_pack_s: 4.0,
            per_line_s: 12.0,
            per_kg_s: 1.5,
            per_litre_s: 0.5,
            per_height_s: 3.0,
        }
    }
}

impl PickTimeModel for LinearPickModel {
    fn estimate_seconds(&self, a: &PickAttributes, worker: &Worker) -> f64 {
        let raw = self.base_s
            + self.per_meter_s * a.distance_m
            + self.per_pack_s * f64::from(a.pack_count)
            + self.per_line_s * f64::from(a.lines)
            + self.per_kg_s * f64::from(a.weight_g) / 1000.0
            + self.per_litre_s * f64::from(a.volume_ml) / 1000.0
            + self.per_height_s * a.avg_height;
        let efficiency = if worker.efficiency > 0.0 { worker.efficiency } else { 1.0 };
        raw / efficiency
    }
}

/// Pick-time models keyed by upper-cased zone name.
#[derive(Clone, Default)]
pub struct EstimatorRegistry {
    models: HashMap<String, Arc<dyn PickTimeModel>>,
}

impl fmt::Debug for EstimatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.models.keys().collect();
        names.sort();
        f.debug_struct("EstimatorRegistry").field("models", &names).finish()
    }
}

impl EstimatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `model` for the zone called `zone_name`.
    pub fn register(&mut self, zone_name: &str, model: Arc<dyn PickTimeModel>) {
        self.models.insert(zone_name.to_uppercase(), model);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_model(mut self, zone_name: &str, model: Arc<dyn PickTimeModel>) -> Self {
        self.register(zone_name, model);
        self
    }

    /// Looks up the model for a zone.
    pub fn model_for(&self, zone_name: &str) -> Result<Arc<dyn PickTimeModel>, EstimateError> {
        self.models
            .get(&zone_name.to_uppercase())
            .cloned()
            .ok_or_else(|| EstimateError::MissingModel(zone_name.to_string()))
    }

    /// Runs the zone's model and validates the output.
    pub fn estimate(
        &self,
        zone_name: &str,
        attributes: &PickAttributes,
        worker: &Worker,
    ) -> Result<f64, EstimateError> {
        let seconds = self.model_for(zone_name)?.estimate_seconds(attributes, worker);
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(EstimateError::InvalidEstimate {
                zone: zone_name.to_string(),
                seconds,
            });
        }
        Ok(seconds)
    }
}
