//! Shift windows and the timetable queries both engines run against them.
//!
//! Every window has a nominal interval and, once jitter has been applied, a
//! "real" interval. Presence checks always use the real interval when one
//! exists.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use floorcast_env::WorkerId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One worker's on-duty interval for one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    /// Worker this shift belongs to
    pub worker: WorkerId,

    /// Nominal shift start
    pub start: NaiveDateTime,

    /// Nominal shift end
    pub end: NaiveDateTime,

    /// Jittered arrival, if the day has been perturbed
    #[serde(default)]
    pub real_start: Option<NaiveDateTime>,

    /// Jittered departure, if the day has been perturbed
    #[serde(default)]
    pub real_end: Option<NaiveDateTime>,
}

impl ShiftWindow {
    /// Creates a shift without jitter.
    pub fn new(worker: WorkerId, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            worker,
            start,
            end,
            real_start: None,
            real_end: None,
        }
    }

    /// Workday of the shift (date of the nominal start).
    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }

    /// Arrival instant used for presence checks.
    pub fn effective_start(&self) -> NaiveDateTime {
        self.real_start.unwrap_or(self.start)
    }

    /// Departure instant used for presence checks.
    pub fn effective_end(&self) -> NaiveDateTime {
        self.real_end.unwrap_or(self.end)
    }

    /// Returns true if the worker is present at `at` (`start <= at < end`).
    pub fn covers(&self, at: NaiveDateTime) -> bool {
        self.effective_start() <= at && at < self.effective_end()
    }

    /// Midpoint of the nominal shift, when the lunch break is due.
    pub fn break_due(&self) -> NaiveDateTime {
        self.start + (self.end - self.start) / 2
    }
}

/// All shift windows known for the simulated period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timetable {
    shifts: Vec<ShiftWindow>,
}

impl Timetable {
    pub fn new(shifts: Vec<ShiftWindow>) -> Self {
        Self { shifts }
    }

    pub fn shifts(&self) -> &[ShiftWindow] {
        &self.shifts
    }

    /// Keeps only the shifts whose nominal start falls on `date`.
    pub fn for_date(&self, date: NaiveDate) -> Timetable {
        Timetable {
            shifts: self
                .shifts
                .iter()
                .filter(|shift| shift.date() == date)
                .cloned()
                .collect(),
        }
    }

    /// Shifts of one worker.
    pub fn for_worker(&self, worker: WorkerId) -> impl Iterator<Item = &ShiftWindow> {
        self.shifts.iter().filter(move |shift| shift.worker == worker)
    }

    /// Returns true if `worker` has a shift covering `at`.
    pub fn is_on_shift(&self, worker: WorkerId, at: NaiveDateTime) -> bool {
        self.for_worker(worker).any(|shift| shift.covers(at))
    }

    /// Number of `candidates` present at `at`.
    pub fn count_on_shift(&self, candidates: &[WorkerId], at: NaiveDateTime) -> usize {
        candidates
            .iter()
            .filter(|worker| self.is_on_shift(**worker, at))
            .count()
    }

    /// Earliest arrival among `candidates` on `date`, if any of them works that day.
    pub fn first_start(&self, candidates: &[WorkerId], date: NaiveDate) -> Option<NaiveDateTime> {
        self.shifts
            .iter()
            .filter(|shift| shift.date() == date && candidates.contains(&shift.worker))
            .map(ShiftWindow::effective_start)
            .min()
    }

    /// Distinct arrival instants of `candidates` in `(after, until]`, ascending.
    pub fn arrivals_between(
        &self,
        candidates: &[WorkerId],
        after: NaiveDateTime,
        until: NaiveDateTime,
    ) -> Vec<NaiveDateTime> {
        self.shifts
            .iter()
            .filter(|shift| candidates.contains(&shift.worker))
            .map(ShiftWindow::effective_start)
            .filter(|at| *at > after && *at <= until)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Earliest instant in `[from, until]` at which at least `min` of
    /// `candidates` are present at the same time.
    ///
    /// Only `from` and later arrivals are checked: presence can only grow at
    /// an arrival.
    pub fn earliest_staffing(
        &self,
        candidates: &[WorkerId],
        min: usize,
        from: NaiveDateTime,
        until: NaiveDateTime,
    ) -> Option<NaiveDateTime> {
        std::iter::once(from)
            .chain(self.arrivals_between(candidates, from, until))
            .find(|at| self.count_on_shift(candidates, *at) >= min)
    }

    /// Perturbs every shift by a uniform offset in `[-minutes, minutes]` at
    /// both ends, keeping each window non-empty.
    pub fn apply_jitter<R: Rng + ?Sized>(&mut self, rng: &mut R, minutes: i64) {
        if minutes <= 0 {
            return;
        }
        for shift in &mut self.shifts {
            let start = shift.start + Duration::minutes(rng.gen_range(-minutes..=minutes));
            let mut end = shift.end + Duration::minutes(rng.gen_range(-minutes..=minutes));
            if end <= start {
                end = start + Duration::minutes(1);
            }
            shift.real_start = Some(start);
            shift.real_end = Some(end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn table() -> Timetable {
        Timetable::new(vec![
            ShiftWindow::new(WorkerId(1), at(6, 0), at(14, 0)),
            ShiftWindow::new(WorkerId(2), at(8, 0), at(16, 0)),
            ShiftWindow::new(WorkerId(3), at(10, 0), at(18, 0)),
        ])
    }

    #[test]
    fn test_presence_is_half_open() {
        let t = table();
        assert!(t.is_on_shift(WorkerId(1), at(6, 0)));
        assert!(t.is_on_shift(WorkerId(1), at(13, 59)));
        assert!(!t.is_on_shift(WorkerId(1), at(14, 0)));
        assert!(!t.is_on_shift(WorkerId(9), at(9, 0)));
    }

    #[test]
    fn test_real_window_overrides_nominal() {
        let mut shift = ShiftWindow::new(WorkerId(1), at(6, 0), at(14, 0));
        shift.real_start = Some(at(6, 10));
        assert!(!shift.covers(at(6, 5)));
        assert!(shift.covers(at(6, 10)));
    }

    #[test]
    fn test_first_start_and_earliest_staffing() {
        let t = table();
        let all = [WorkerId(1), WorkerId(2), WorkerId(3)];
        let date = at(0, 0).date();

        assert_eq!(t.first_start(&all, date), Some(at(6, 0)));
        assert_eq!(t.first_start(&all[1..], date), Some(at(8, 0)));
        assert_eq!(t.earliest_staffing(&all, 1, at(0, 0), at(23, 59)), Some(at(6, 0)));
        assert_eq!(t.earliest_staffing(&all, 3, at(0, 0), at(23, 59)), Some(at(10, 0)));
        assert_eq!(t.earliest_staffing(&all, 2, at(9, 0), at(23, 59)), Some(at(9, 0)));
        assert_eq!(t.earliest_staffing(&all, 4, at(0, 0), at(23, 59)), None);
    }

    #[test]
    fn test_first_start_without_shifts_that_day() {
        let t = table();
        let tomorrow = at(0, 0).date().succ_opt().unwrap();
        assert_eq!(t.first_start(&[WorkerId(1)], tomorrow), None);
    }

    #[test]
    fn test_break_is_mid_shift() {
        let shift = ShiftWindow::new(WorkerId(1), at(6, 0), at(14, 0));
        assert_eq!(shift.break_due(), at(10, 0));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut t = table();
        let mut rng = StdRng::seed_from_u64(7);
        t.apply_jitter(&mut rng, 15);
        for shift in t.shifts() {
            let start = shift.real_start.unwrap();
            let end = shift.real_end.unwrap();
            assert!((start - shift.start).num_minutes().abs() <= 15);
            assert!((end - shift.end).num_minutes().abs() <= 15);
            assert!(end > start);
        }
    }
}
