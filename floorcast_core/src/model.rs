//! The warehouse data model: workers, task definitions, the day's task
//! instances and zones.
//!
//! Entities are created and edited by the persistence layer. The engines
//! only ever mutate assignment and start/end fields, and always on their
//! own copies (see [`Warehouse::snapshot_for`]).

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use floorcast_env::{TaskId, WorkerId, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ModelError;
use crate::timetable::Timetable;

fn default_true() -> bool {
    true
}

// =============================================================================
// WORKERS
// =============================================================================

/// What a worker is currently doing.
///
/// A worker holds at most one assignment, so "both an active task and a
/// pick task at once" is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "task", rename_all = "snake_case")]
pub enum Assignment {
    /// Working on an [`ActiveTask`]
    Active(TaskId),
    /// Working on a [`PickTask`]
    Pick(TaskId),
}

impl Assignment {
    /// Returns the task id regardless of kind.
    pub fn task(&self) -> TaskId {
        match self {
            Assignment::Active(id) | Assignment::Pick(id) => *id,
        }
    }
}

/// A person on the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique worker ID
    pub id: WorkerId,

    /// Display name (for logging)
    #[serde(default)]
    pub name: String,

    /// Home zone
    pub zone: ZoneId,

    /// Speed multiplier, 1.0 = nominal
    pub efficiency: f64,

    /// Licenses held (forklift, reach truck, ...)
    #[serde(default)]
    pub licenses: BTreeSet<String>,

    /// Whether the worker may be scheduled at all
    #[serde(default = "default_true")]
    pub available: bool,

    /// Current assignment, if any
    #[serde(default)]
    pub assignment: Option<Assignment>,
}

impl Worker {
    /// Creates an available, unassigned worker without licenses.
    pub fn new(id: u64, name: &str, zone: ZoneId, efficiency: f64) -> Self {
        Self {
            id: WorkerId(id),
            name: name.to_string(),
            zone,
            efficiency,
            licenses: BTreeSet::new(),
            available: true,
            assignment: None,
        }
    }

    /// Adds licenses to the worker.
    pub fn with_licenses<I, S>(mut self, licenses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.licenses.extend(licenses.into_iter().map(Into::into));
        self
    }

    /// Returns true if the worker holds every license in `required`.
    pub fn qualifies_for(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.licenses)
    }
}

// =============================================================================
// TASK DEFINITIONS AND INSTANCES
// =============================================================================

/// A kind of work, with its staffing and duration envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task name
    pub name: String,

    /// Zone the task belongs to
    pub zone: ZoneId,

    /// Licenses every assigned worker must hold
    #[serde(default)]
    pub required_licenses: BTreeSet<String>,

    /// Duration in minutes at full staffing
    pub min_duration: u32,

    /// Duration in minutes at minimum staffing
    pub max_duration: u32,

    /// Workers needed before the task can start
    pub min_workers: u32,

    /// Workers that can usefully work on it
    pub max_workers: u32,
}

impl TaskDefinition {
    /// Creates a definition and normalizes its worker bounds.
    pub fn new(
        name: &str,
        zone: ZoneId,
        (min_duration, max_duration): (u32, u32),
        (min_workers, max_workers): (u32, u32),
    ) -> Self {
        Self {
            name: name.to_string(),
            zone,
            required_licenses: BTreeSet::new(),
            min_duration,
            max_duration,
            min_workers,
            max_workers,
        }
        .normalized()
    }

    /// Adds required licenses.
    pub fn with_licenses<I, S>(mut self, licenses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_licenses
            .extend(licenses.into_iter().map(Into::into));
        self
    }

    /// Enforces `1 <= min_workers <= max_workers`.
    ///
    /// A definition with `max_workers < min_workers` gets
    /// `max_workers = min_workers + 1`.
    pub fn normalized(mut self) -> Self {
        self.min_workers = self.min_workers.max(1);
        if self.max_workers < self.min_workers {
            self.max_workers = self.min_workers + 1;
        }
        self
    }

    /// Minimum crew size as a count.
    pub fn min_crew(&self) -> usize {
        self.min_workers.max(1) as usize
    }

    /// Maximum crew size as a count.
    pub fn max_crew(&self) -> usize {
        (self.max_workers as usize).max(self.min_crew())
    }
}

/// One day's instance of a [`TaskDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    /// Unique task ID
    pub id: TaskId,

    /// What has to be done
    pub definition: TaskDefinition,

    /// The workday this instance belongs to
    pub date: NaiveDate,

    /// Due instant; a due time of exactly midnight means "some time today"
    #[serde(default)]
    pub due: Option<NaiveDateTime>,

    /// Earliest instant the task may be started
    #[serde(default)]
    pub strict_start: Option<NaiveDateTime>,

    /// Recurrence tag from the planner (not interpreted here)
    #[serde(default)]
    pub recurrence: Option<String>,

    /// Workers currently on the task
    #[serde(default)]
    pub assigned: Vec<WorkerId>,

    /// When work started
    #[serde(default)]
    pub start: Option<NaiveDateTime>,

    /// When work finished
    #[serde(default)]
    pub end: Option<NaiveDateTime>,
}

impl ActiveTask {
    /// Creates an unstaffed task for `date`.
    pub fn new(id: u64, definition: TaskDefinition, date: NaiveDate) -> Self {
        Self {
            id: TaskId(id),
            definition: definition.normalized(),
            date,
            due: None,
            strict_start: None,
            recurrence: None,
            assigned: Vec::new(),
            start: None,
            end: None,
        }
    }

    /// Sets the due instant.
    pub fn with_due(mut self, due: NaiveDateTime) -> Self {
        self.due = Some(due);
        self
    }

    /// Sets the strict start instant.
    pub fn with_strict_start(mut self, at: NaiveDateTime) -> Self {
        self.strict_start = Some(at);
        self
    }

    /// Zone this task runs in.
    pub fn zone(&self) -> ZoneId {
        self.definition.zone
    }

    /// Returns the due instant if it carries a real time of day.
    pub fn due_time(&self) -> Option<NaiveDateTime> {
        self.due.filter(|due| due.time() != NaiveTime::MIN)
    }

    /// Returns true once the task has an end time.
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    /// Adds a worker if the crew is below its maximum.
    ///
    /// Returns false (and leaves the crew untouched) when the task is full
    /// or the worker is already on it.
    pub fn try_assign(&mut self, worker: WorkerId) -> bool {
        if self.assigned.len() >= self.definition.max_crew() || self.assigned.contains(&worker) {
            return false;
        }
        self.assigned.push(worker);
        true
    }
}

/// Physical description of a pick job, the input to the pick-time model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PickAttributes {
    /// Walking distance in meters
    pub distance_m: f64,
    /// Pack-equivalent amount
    pub pack_count: u32,
    /// Order lines
    pub lines: u32,
    /// Total weight in grams
    pub weight_g: u32,
    /// Total volume in millilitres
    pub volume_ml: u32,
    /// Average shelf height
    #[serde(default)]
    pub avg_height: f64,
}

/// A single-worker picking job in a pick zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickTask {
    /// Unique task ID
    pub id: TaskId,

    /// Zone the pick happens in
    pub zone: ZoneId,

    /// Workday
    pub date: NaiveDate,

    /// Physical attributes
    #[serde(flatten)]
    pub attributes: PickAttributes,

    /// Assigned picker
    #[serde(default)]
    pub worker: Option<WorkerId>,

    #[serde(default)]
    pub start: Option<NaiveDateTime>,

    #[serde(default)]
    pub end: Option<NaiveDateTime>,
}

impl PickTask {
    /// Creates an unassigned pick task.
    pub fn new(id: u64, zone: ZoneId, date: NaiveDate, attributes: PickAttributes) -> Self {
        Self {
            id: TaskId(id),
            zone,
            date,
            attributes,
            worker: None,
            start: None,
            end: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }
}

// =============================================================================
// ZONES AND THE WAREHOUSE SNAPSHOT
// =============================================================================

/// A warehouse area. Runs either active tasks or pick tasks, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    #[serde(default)]
    pub is_pick_zone: bool,
}

impl Zone {
    pub fn new(id: u64, name: &str, is_pick_zone: bool) -> Self {
        Self {
            id: ZoneId(id),
            name: name.to_string(),
            is_pick_zone,
        }
    }
}

/// Everything the engines read: roster, zones, tasks and shifts.
///
/// This is the read snapshot handed over by the persistence layer. The
/// engines never write into it; they copy what they mutate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Warehouse {
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub workers: Vec<Worker>,
    #[serde(default)]
    pub active_tasks: Vec<ActiveTask>,
    #[serde(default)]
    pub pick_tasks: Vec<PickTask>,
    #[serde(default)]
    pub timetable: Timetable,
}

impl Warehouse {
    /// Loads a warehouse from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        serde_json::from_str(json).map_err(|e| ModelError::Parse(e.to_string()))
    }

    /// Looks up a zone.
    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.iter().find(|zone| zone.id == id)
    }

    /// Looks up a worker.
    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.iter().find(|worker| worker.id == id)
    }

    /// Workers whose home zone is `zone`.
    pub fn zone_workers(&self, zone: ZoneId) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(move |worker| worker.zone == zone)
    }

    /// Unfinished active tasks of `zone`.
    pub fn zone_active_tasks(&self, zone: ZoneId) -> impl Iterator<Item = &ActiveTask> {
        self.active_tasks
            .iter()
            .filter(move |task| task.zone() == zone && !task.is_finished())
    }

    /// Unfinished pick tasks of `zone`.
    pub fn zone_pick_tasks(&self, zone: ZoneId) -> impl Iterator<Item = &PickTask> {
        self.pick_tasks
            .iter()
            .filter(move |task| task.zone == zone && !task.is_finished())
    }

    /// Copies out the part of the warehouse relevant to `date`: that day's
    /// unfinished tasks and that day's shifts.
    pub fn snapshot_for(&self, date: NaiveDate) -> Warehouse {
        Warehouse {
            zones: self.zones.clone(),
            workers: self.workers.clone(),
            active_tasks: self
                .active_tasks
                .iter()
                .filter(|task| task.date == date && !task.is_finished())
                .cloned()
                .collect(),
            pick_tasks: self
                .pick_tasks
                .iter()
                .filter(|task| task.date == date && !task.is_finished())
                .cloned()
                .collect(),
            timetable: self.timetable.for_date(date),
        }
    }

    /// Checks referential integrity and value ranges.
    pub fn validate(&self) -> Result<(), ModelError> {
        for worker in &self.workers {
            if !(worker.efficiency.is_finite() && worker.efficiency > 0.0) {
                return Err(ModelError::InvalidEfficiency {
                    worker: worker.id,
                    efficiency: worker.efficiency,
                });
            }
            if self.zone(worker.zone).is_none() {
                return Err(ModelError::UnknownZone(worker.zone));
            }
        }
        for task in &self.active_tasks {
            match self.zone(task.zone()) {
                None => return Err(ModelError::UnknownZone(task.zone())),
                Some(zone) if zone.is_pick_zone => {
                    return Err(ModelError::WrongTaskKind { zone: zone.id, task: task.id })
                }
                Some(_) => {}
            }
        }
        for task in &self.pick_tasks {
            match self.zone(task.zone) {
                None => return Err(ModelError::UnknownZone(task.zone)),
                Some(zone) if !zone.is_pick_zone => {
                    return Err(ModelError::WrongTaskKind { zone: zone.id, task: task.id })
                }
                Some(_) => {}
            }
        }
        for shift in self.timetable.shifts() {
            if shift.end <= shift.start {
                return Err(ModelError::InvalidShift { worker: shift.worker });
            }
            if self.worker(shift.worker).is_none() {
                return Err(ModelError::UnknownWorker(shift.worker));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timetable::ShiftWindow;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
    }

    #[test]
    fn test_inverted_worker_bounds_are_coerced() {
        let def = TaskDefinition::new("restock", ZoneId(1), (10, 20), (3, 2));
        assert_eq!(def.min_workers, 3);
        assert_eq!(def.max_workers, 4);
    }

    #[test]
    fn test_zero_min_workers_becomes_one() {
        let def = TaskDefinition::new("sweep", ZoneId(1), (10, 20), (0, 0));
        assert_eq!(def.min_crew(), 1);
        assert_eq!(def.max_crew(), 2);
    }

    #[test]
    fn test_try_assign_respects_max() {
        let def = TaskDefinition::new("unload", ZoneId(1), (10, 30), (1, 2));
        let mut task = ActiveTask::new(1, def, day());

        assert!(task.try_assign(WorkerId(1)));
        assert!(!task.try_assign(WorkerId(1)));
        assert!(task.try_assign(WorkerId(2)));
        assert!(!task.try_assign(WorkerId(3)));
        assert_eq!(task.assigned.len(), 2);
    }

    #[test]
    fn test_midnight_due_is_not_a_due_time() {
        let def = TaskDefinition::new("count", ZoneId(1), (10, 30), (1, 2));
        let midnight = day().and_hms_opt(0, 0, 0).unwrap();
        let noon = day().and_hms_opt(12, 0, 0).unwrap();

        assert_eq!(ActiveTask::new(1, def.clone(), day()).with_due(midnight).due_time(), None);
        assert_eq!(ActiveTask::new(2, def, day()).with_due(noon).due_time(), Some(noon));
    }

    #[test]
    fn test_worker_license_check() {
        let worker = Worker::new(1, "Ada", ZoneId(1), 1.0).with_licenses(["forklift"]);
        let mut required = BTreeSet::new();
        assert!(worker.qualifies_for(&required));
        required.insert("forklift".to_string());
        assert!(worker.qualifies_for(&required));
        required.insert("reach".to_string());
        assert!(!worker.qualifies_for(&required));
    }

    #[test]
    fn test_snapshot_filters_other_days_and_finished_tasks() {
        let zone = Zone::new(1, "dock", false);
        let def = TaskDefinition::new("unload", zone.id, (10, 30), (1, 2));
        let mut done = ActiveTask::new(2, def.clone(), day());
        done.end = Some(day().and_hms_opt(9, 0, 0).unwrap());
        let tomorrow = day().succ_opt().unwrap();

        let warehouse = Warehouse {
            zones: vec![zone],
            workers: vec![Worker::new(1, "Ada", ZoneId(1), 1.0)],
            active_tasks: vec![
                ActiveTask::new(1, def.clone(), day()),
                done,
                ActiveTask::new(3, def, tomorrow),
            ],
            pick_tasks: vec![],
            timetable: Timetable::new(vec![
                ShiftWindow::new(
                    WorkerId(1),
                    day().and_hms_opt(7, 0, 0).unwrap(),
                    day().and_hms_opt(15, 0, 0).unwrap(),
                ),
                ShiftWindow::new(
                    WorkerId(1),
                    tomorrow.and_hms_opt(7, 0, 0).unwrap(),
                    tomorrow.and_hms_opt(15, 0, 0).unwrap(),
                ),
            ]),
        };

        let snapshot = warehouse.snapshot_for(day());
        assert_eq!(snapshot.active_tasks.len(), 1);
        assert_eq!(snapshot.active_tasks[0].id, TaskId(1));
        assert_eq!(snapshot.timetable.shifts().len(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_efficiency() {
        let warehouse = Warehouse {
            zones: vec![Zone::new(1, "dock", false)],
            workers: vec![Worker::new(1, "Ada", ZoneId(1), 0.0)],
            ..Default::default()
        };
        assert!(matches!(
            warehouse.validate(),
            Err(ModelError::InvalidEfficiency { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_pick_task_in_generic_zone() {
        let warehouse = Warehouse {
            zones: vec![Zone::new(1, "dock", false)],
            pick_tasks: vec![PickTask::new(9, ZoneId(1), day(), PickAttributes::default())],
            ..Default::default()
        };
        assert!(matches!(
            warehouse.validate(),
            Err(ModelError::WrongTaskKind { .. })
        ));
    }

    #[test]
    fn test_json_round_trip_of_assignment() {
        let mut worker = Worker::new(4, "Bo", ZoneId(2), 1.2);
        worker.assignment = Some(Assignment::Pick(TaskId(8)));
        let json = serde_json::to_string(&worker).unwrap();
        assert!(json.contains("\"kind\":\"pick\""));
        let back: Worker = serde_json::from_str(&json).unwrap();
        assert_eq!(back.assignment.map(|a| a.task()), Some(TaskId(8)));
    }
}
