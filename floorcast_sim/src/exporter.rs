//! JSON exporter for forecast runs.
//!
//! Writes one forecast, its per-trial summaries and (optionally) a day
//! report to a JSON file for dashboards and offline analysis.

use chrono::NaiveDateTime;
use floorcast_core::{TrialResult, WarehouseForecast, ZoneOutcome};
use floorcast_env::ZoneId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use uuid::Uuid;

use crate::day::DayReport;

/// Outcome of one zone in one trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ZoneTrialSummary {
    Finished {
        tasks: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_end: Option<NaiveDateTime>,
    },
    Failed {
        code: u16,
    },
}

impl From<&ZoneOutcome> for ZoneTrialSummary {
    fn from(outcome: &ZoneOutcome) -> Self {
        match outcome {
            Ok(run) => ZoneTrialSummary::Finished {
                tasks: run.tasks.len(),
                last_end: run.last_end(),
            },
            Err(err) => ZoneTrialSummary::Failed { code: err.code() },
        }
    }
}

/// Condensed view of one trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialSummary {
    pub trial: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_end: Option<NaiveDateTime>,

    pub zones: BTreeMap<ZoneId, ZoneTrialSummary>,
}

impl From<&TrialResult> for TrialSummary {
    fn from(trial: &TrialResult) -> Self {
        Self {
            trial: trial.trial,
            latest_end: trial.latest_end(),
            zones: trial
                .zones
                .iter()
                .map(|(zone, outcome)| (*zone, ZoneTrialSummary::from(outcome)))
                .collect(),
        }
    }
}

/// Complete forecast export.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastExport {
    /// Unique id of this run
    pub run_id: Uuid,

    /// Seed used
    pub seed: u64,

    /// Aggregated forecast
    pub forecast: WarehouseForecast,

    /// Per-trial summaries, in trial order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trials: Vec<TrialSummary>,

    /// Day simulation report, if one was run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<DayReport>,
}

impl ForecastExport {
    /// Creates an export for `forecast`.
    pub fn new(forecast: WarehouseForecast, seed: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            seed,
            forecast,
            trials: Vec::new(),
            day: None,
        }
    }

    /// Aggregates `trials` and keeps their summaries.
    pub fn from_trials(trials: &[TrialResult], reference: NaiveDateTime, seed: u64) -> Self {
        let mut export = Self::new(WarehouseForecast::from_trials(trials, reference), seed);
        export.trials = trials.iter().map(TrialSummary::from).collect();
        export
    }

    pub fn with_day(mut self, report: DayReport) -> Self {
        self.day = Some(report);
        self
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use floorcast_core::{CompletedTask, ZoneError, ZoneRun};
    use floorcast_env::{TaskId, WorkerId};

    fn trials() -> Vec<TrialResult> {
        (0..2)
            .map(|i| {
                let mut run = ZoneRun::new(ZoneId(1), at(6, 0));
                run.record(CompletedTask {
                    task: TaskId(1),
                    workers: vec![WorkerId(1)],
                    start: at(6, 0),
                    end: at(7, i as u32 * 10),
                });
                let mut trial = TrialResult::new(i);
                trial.zones.insert(ZoneId(1), Ok(run));
                trial.zones.insert(ZoneId(3), Err(ZoneError::NoTasks { zone: ZoneId(3) }));
                trial
            })
            .collect()
    }

    #[test]
    fn test_export_summarizes_trials() {
        let export = ForecastExport::from_trials(&trials(), at(6, 0), 42);

        assert_eq!(export.trials.len(), 2);
        assert_eq!(export.trials[1].latest_end, Some(at(7, 10)));
        assert_eq!(
            export.trials[0].zones[&ZoneId(3)],
            ZoneTrialSummary::Failed { code: 101 }
        );
        assert_eq!(export.forecast.zones.len(), 2);
    }

    #[test]
    fn test_write_to_file() {
        let export = ForecastExport::from_trials(&trials(), at(6, 0), 7);
        let path = std::env::temp_dir().join(format!("floorcast-export-{}.json", export.run_id));
        let path = path.to_string_lossy().into_owned();

        export.write_to_file(&path).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(written["seed"], 7);
        assert_eq!(written["run_id"], export.run_id.to_string());
        assert_eq!(written["trials"].as_array().unwrap().len(), 2);
        assert!(written.get("day").is_none());
    }
}
