//! Trial results and their aggregation into per-zone forecasts.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use floorcast_env::{TaskId, WorkerId, ZoneId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::duration::minutes_to_duration;
use crate::error::ZoneError;

/// Spacing of the completion curve.
pub const CURVE_STEP_MINUTES: i64 = 10;

/// One finished task inside a zone-trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedTask {
    pub task: TaskId,
    pub workers: Vec<WorkerId>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// A zone's successful run for one trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneRun {
    /// Zone that ran
    pub zone: ZoneId,

    /// Effective start of the zone (after shift look-up)
    pub started_at: NaiveDateTime,

    /// Completed tasks in completion order
    pub tasks: Vec<CompletedTask>,
}

impl ZoneRun {
    pub fn new(zone: ZoneId, started_at: NaiveDateTime) -> Self {
        Self {
            zone,
            started_at,
            tasks: Vec::new(),
        }
    }

    pub fn record(&mut self, task: CompletedTask) {
        self.tasks.push(task);
    }

    /// End of the last task to finish.
    pub fn last_end(&self) -> Option<NaiveDateTime> {
        self.tasks.iter().map(|t| t.end).max()
    }

    /// Tasks finished at or before `at`.
    pub fn completed_by(&self, at: NaiveDateTime) -> usize {
        self.tasks.iter().filter(|t| t.end <= at).count()
    }

    /// Minutes from `reference` to the last end, zero when nothing ran.
    pub fn minutes_from(&self, reference: NaiveDateTime) -> f64 {
        self.last_end()
            .map(|end| (end - reference).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0)
    }
}

/// What a single zone-trial produced.
pub type ZoneOutcome = Result<ZoneRun, ZoneError>;

/// Every zone's outcome for one trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialResult {
    /// Trial index, 0-based
    pub trial: usize,

    /// Per-zone outcome
    pub zones: BTreeMap<ZoneId, ZoneOutcome>,
}

impl TrialResult {
    pub fn new(trial: usize) -> Self {
        Self {
            trial,
            zones: BTreeMap::new(),
        }
    }

    /// Latest end across all successful zones; the trial's completion time.
    pub fn latest_end(&self) -> Option<NaiveDateTime> {
        self.zones
            .values()
            .filter_map(|outcome| outcome.as_ref().ok())
            .filter_map(ZoneRun::last_end)
            .max()
    }

    /// Tasks finished at or before `at`, across zones.
    pub fn completed_by(&self, at: NaiveDateTime) -> usize {
        self.zones
            .values()
            .filter_map(|outcome| outcome.as_ref().ok())
            .map(|run| run.completed_by(at))
            .sum()
    }

    /// Number of zones that failed.
    pub fn failed_zones(&self) -> usize {
        self.zones.values().filter(|outcome| outcome.is_err()).count()
    }
}

/// The aggregate answer for one zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ZoneForecast {
    /// At least one trial finished after the reference time
    Completion {
        zone: ZoneId,
        /// Reference time plus the mean duration
        finish_at: NaiveDateTime,
        /// Mean duration over trials with a positive duration
        mean_minutes: f64,
        /// Earliest last-end seen across trials
        best_case: NaiveDateTime,
        successful_trials: usize,
        failed_trials: usize,
    },
    /// No trial produced a usable duration
    Failed { zone: ZoneId, error: ZoneError },
}

impl ZoneForecast {
    pub fn zone(&self) -> ZoneId {
        match self {
            ZoneForecast::Completion { zone, .. } | ZoneForecast::Failed { zone, .. } => *zone,
        }
    }

    pub fn finish_at(&self) -> Option<NaiveDateTime> {
        match self {
            ZoneForecast::Completion { finish_at, .. } => Some(*finish_at),
            ZoneForecast::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ZoneError> {
        match self {
            ZoneForecast::Completion { .. } => None,
            ZoneForecast::Failed { error, .. } => Some(error),
        }
    }

    /// Control-surface string: `HH:mm` or the bare error code.
    pub fn wire(&self) -> String {
        match self {
            ZoneForecast::Completion { finish_at, .. } => finish_at.format("%H:%M").to_string(),
            ZoneForecast::Failed { error, .. } => error.wire(),
        }
    }
}

/// Aggregates trials into one forecast per zone.
///
/// A zone's duration in a trial is `last_end - reference`. Trials where
/// that is not positive (failures, nothing left to do) are left out of the
/// mean. A zone with no usable trial reports the first recorded error, or
/// [`ZoneError::NoTasks`] if every trial succeeded without work.
pub fn aggregate(
    trials: &[TrialResult],
    reference: NaiveDateTime,
) -> BTreeMap<ZoneId, ZoneForecast> {
    let zones: BTreeSet<ZoneId> = trials
        .iter()
        .flat_map(|trial| trial.zones.keys().copied())
        .collect();

    zones
        .into_iter()
        .map(|zone| (zone, aggregate_zone(zone, trials, reference)))
        .collect()
}

fn aggregate_zone(zone: ZoneId, trials: &[TrialResult], reference: NaiveDateTime) -> ZoneForecast {
    let outcomes: Vec<&ZoneOutcome> = trials.iter().filter_map(|t| t.zones.get(&zone)).collect();
    let failed_trials = outcomes.iter().filter(|o| o.is_err()).count();

    let finished: Vec<(f64, NaiveDateTime)> = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_ref().ok())
        .filter_map(|run| run.last_end().map(|end| (run.minutes_from(reference), end)))
        .filter(|(minutes, _)| *minutes > 0.0)
        .collect();

    if finished.is_empty() {
        let error = outcomes
            .iter()
            .find_map(|outcome| outcome.as_ref().err().cloned())
            .unwrap_or(ZoneError::NoTasks { zone });
        return ZoneForecast::Failed { zone, error };
    }

    let mean_minutes = finished.iter().map(|(m, _)| m).sum::<f64>() / finished.len() as f64;
    let best_case = finished
        .iter()
        .map(|(_, end)| *end)
        .min()
        .unwrap_or(reference);

    ZoneForecast::Completion {
        zone,
        finish_at: reference + minutes_to_duration(mean_minutes),
        mean_minutes,
        best_case,
        successful_trials: finished.len(),
        failed_trials,
    }
}

/// Mean completed-task count at one grid instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurvePoint {
    pub at: NaiveDateTime,
    pub completed: f64,
}

/// Mean tasks completed at each 10-minute step from `reference` to the end
/// of its day.
pub fn completion_curve(trials: &[TrialResult], reference: NaiveDateTime) -> Vec<CurvePoint> {
    if trials.is_empty() {
        return Vec::new();
    }
    let end = reference.date().and_time(NaiveTime::MIN) + Duration::days(1) - Duration::seconds(1);
    let step = Duration::minutes(CURVE_STEP_MINUTES);

    let mut curve = Vec::new();
    let mut at = reference;
    while at <= end {
        let total: usize = trials.iter().map(|trial| trial.completed_by(at)).sum();
        curve.push(CurvePoint {
            at,
            completed: total as f64 / trials.len() as f64,
        });
        at += step;
    }
    curve
}

/// The full answer to "when will we finish?".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarehouseForecast {
    /// Instant the forecast was made for
    pub reference: NaiveDateTime,

    /// Number of trials aggregated
    pub trials: usize,

    /// One entry per zone seen in any trial
    pub zones: BTreeMap<ZoneId, ZoneForecast>,

    /// Expected completions over the rest of the day
    pub curve: Vec<CurvePoint>,

    /// Latest completion across all trials
    pub latest: Option<NaiveDateTime>,
}

impl WarehouseForecast {
    pub fn from_trials(trials: &[TrialResult], reference: NaiveDateTime) -> Self {
        Self {
            reference,
            trials: trials.len(),
            zones: aggregate(trials, reference),
            curve: completion_curve(trials, reference),
            latest: trials.iter().filter_map(TrialResult::latest_end).max(),
        }
    }

    /// Forecasted finish of the whole warehouse (latest zone ETA).
    pub fn finish_at(&self) -> Option<NaiveDateTime> {
        self.zones.values().filter_map(ZoneForecast::finish_at).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn run(zone: u64, ends: &[NaiveDateTime]) -> ZoneOutcome {
        let mut run = ZoneRun::new(ZoneId(zone), at(8, 0));
        for (i, end) in ends.iter().enumerate() {
            run.record(CompletedTask {
                task: TaskId(i as u64 + 1),
                workers: vec![WorkerId(1)],
                start: at(8, 0),
                end: *end,
            });
        }
        Ok(run)
    }

    fn trial(index: usize, outcomes: Vec<(u64, ZoneOutcome)>) -> TrialResult {
        TrialResult {
            trial: index,
            zones: outcomes.into_iter().map(|(z, o)| (ZoneId(z), o)).collect(),
        }
    }

    #[test]
    fn test_mean_of_positive_durations() {
        let reference = at(8, 0);
        let trials = vec![
            trial(0, vec![(1, run(1, &[at(9, 0)]))]),
            trial(1, vec![(1, run(1, &[at(8, 30), at(10, 0)]))]),
            trial(2, vec![(1, Err(ZoneError::NoWorkers { zone: ZoneId(1) }))]),
        ];

        let zones = aggregate(&trials, reference);
        match &zones[&ZoneId(1)] {
            ZoneForecast::Completion {
                finish_at,
                mean_minutes,
                best_case,
                successful_trials,
                failed_trials,
                ..
            } => {
                assert_relative_eq!(*mean_minutes, 90.0);
                assert_eq!(*finish_at, at(9, 30));
                assert_eq!(*best_case, at(9, 0));
                assert_eq!(*successful_trials, 2);
                assert_eq!(*failed_trials, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(zones[&ZoneId(1)].wire(), "09:30");
    }

    #[test]
    fn test_all_failed_falls_back_to_first_error() {
        let trials = vec![
            trial(0, vec![(2, Err(ZoneError::NoWorkers { zone: ZoneId(2) }))]),
            trial(1, vec![(2, Err(ZoneError::Timeout { zone: ZoneId(2), ceiling_secs: 1 }))]),
        ];
        let zones = aggregate(&trials, at(8, 0));
        assert_eq!(zones[&ZoneId(2)].wire(), "102");
    }

    #[test]
    fn test_no_usable_duration_without_error_reports_101() {
        let trials = vec![trial(0, vec![(3, run(3, &[]))])];
        let zones = aggregate(&trials, at(8, 0));
        assert_eq!(zones[&ZoneId(3)].error().map(ZoneError::code), Some(101));
    }

    #[test]
    fn test_one_entry_per_zone() {
        let trials = vec![
            trial(0, vec![(1, run(1, &[at(9, 0)])), (2, run(2, &[at(11, 0)]))]),
            trial(
                1,
                vec![
                    (1, run(1, &[at(9, 0)])),
                    (3, Err(ZoneError::NoTasks { zone: ZoneId(3) })),
                ],
            ),
        ];
        let forecast = WarehouseForecast::from_trials(&trials, at(8, 0));
        let keys: Vec<ZoneId> = forecast.zones.keys().copied().collect();
        assert_eq!(keys, vec![ZoneId(1), ZoneId(2), ZoneId(3)]);
        assert_eq!(forecast.latest, Some(at(11, 0)));
        assert_eq!(forecast.finish_at(), Some(at(11, 0)));
        assert_eq!(trials[0].latest_end(), Some(at(11, 0)));
        assert_eq!(trials[1].failed_zones(), 1);
    }

    #[test]
    fn test_completion_curve_steps_to_end_of_day() {
        let trials = vec![
            trial(0, vec![(1, run(1, &[at(23, 20), at(23, 45)]))]),
            trial(1, vec![(1, run(1, &[at(23, 25)]))]),
        ];
        let curve = completion_curve(&trials, at(23, 20));
        let points: Vec<(NaiveDateTime, f64)> = curve.iter().map(|p| (p.at, p.completed)).collect();
        assert_eq!(
            points,
            vec![
                (at(23, 20), 0.5),
                (at(23, 30), 1.0),
                (at(23, 40), 1.0),
                (at(23, 50), 1.5),
            ]
        );
    }
}
