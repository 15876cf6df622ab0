//! DaySimulation - the live, minute-stepped workday.
//!
//! One authoritative copy of the day: workers arrive and leave on their
//! jittered shifts, take a lunch break, get greedily assigned to ready
//! tasks and picks, and free up again when their tasks end. Every tick
//! runs, in order:
//!
//! ```text
//! (a) shift transitions + breaks
//! (b) staff active tasks that reach their minimum crew
//! (c) park idle workers in the zone's waiting pool while due-dated tasks are short
//! (d) one worker per unstaffed pick task
//! (e) reap finished tasks
//! (f) fire-and-forget forecast refresh (one in flight)
//! (g) periodic progress snapshot
//! ```
//!
//! The loop is controlled from a cloneable [`DayHandle`].

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use floorcast_core::{
    minutes_to_duration, ActiveTask, Assignment, DurationModel, EstimateError, EstimatorRegistry,
    Jitter, ModelError, Warehouse, WarehouseForecast, Worker,
};
use floorcast_env::{FloorContext, TaskId, WorkerId, ZoneId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::monte_carlo::{MonteCarloConfig, MonteCarloEngine};
use crate::sink::{ProgressSink, SinkError, TaskEvent, TaskKind, ZoneProgress};

/// Ticks in one simulated day (00:01 through 00:00 the next day).
pub const MINUTES_PER_DAY: i64 = 1440;

/// Errors from the day simulation.
#[derive(Debug, Error)]
pub enum DayError {
    #[error("invalid day configuration: {0}")]
    InvalidConfig(String),

    #[error("day simulation is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Estimate(#[from] EstimateError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Configuration for a day run.
#[derive(Debug, Clone, Copy)]
pub struct DayConfig {
    /// Real minutes one simulated day should take (0 = no per-tick delay)
    pub simulation_minutes: f64,

    /// Speed multiplier applied on top of `simulation_minutes`
    pub speed: f64,

    /// Uniform noise added to every task duration (minutes)
    pub task_jitter_minutes: f64,

    /// Uniform noise on shift starts and ends (minutes)
    pub shift_jitter_minutes: i64,

    /// Minutes between forecast refreshes
    pub refresh_interval_minutes: i64,

    /// Minutes after the first arrival before the first refresh
    pub refresh_after_first_arrival_minutes: i64,

    /// Minutes between progress snapshots
    pub snapshot_interval_minutes: i64,

    /// Length of the lunch break
    pub break_minutes: i64,

    /// Trials and limits for refresh forecasts
    pub forecast: MonteCarloConfig,
}

impl Default for DayConfig {
    fn default() -> Self {
        Self {
            simulation_minutes: 0.0,
            speed: 1.0,
            task_jitter_minutes: 5.0,
            shift_jitter_minutes: 15,
            refresh_interval_minutes: 30,
            refresh_after_first_arrival_minutes: 60,
            snapshot_interval_minutes: 10,
            break_minutes: 30,
            forecast: MonteCarloConfig::default(),
        }
    }
}

impl DayConfig {
    pub fn with_simulation_minutes(mut self, minutes: f64) -> Self {
        self.simulation_minutes = minutes;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_task_jitter(mut self, minutes: f64) -> Self {
        self.task_jitter_minutes = minutes;
        self
    }

    pub fn with_shift_jitter(mut self, minutes: i64) -> Self {
        self.shift_jitter_minutes = minutes;
        self
    }

    pub fn with_forecast(mut self, forecast: MonteCarloConfig) -> Self {
        self.forecast = forecast;
        self
    }

    fn validate(&self) -> Result<(), DayError> {
        if !(self.simulation_minutes.is_finite() && self.simulation_minutes >= 0.0) {
            return Err(DayError::InvalidConfig(format!(
                "simulation_minutes must be >= 0, got {}",
                self.simulation_minutes
            )));
        }
        validate_speed(self.speed)?;
        let intervals = [
            ("refresh_interval_minutes", self.refresh_interval_minutes),
            ("snapshot_interval_minutes", self.snapshot_interval_minutes),
        ];
        for (name, value) in intervals {
            if value < 1 {
                return Err(DayError::InvalidConfig(format!("{name} must be >= 1, got {value}")));
            }
        }
        Ok(())
    }
}

fn validate_speed(speed: f64) -> Result<(), DayError> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(DayError::InvalidConfig(format!("speed must be > 0, got {speed}")))
    }
}

// =============================================================================
// CONTROL SURFACE
// =============================================================================

/// Playback state of the day loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DayStatus {
    Stopped = 0,
    Running = 1,
    Paused = 2,
}

impl DayStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => DayStatus::Running,
            2 => DayStatus::Paused,
            _ => DayStatus::Stopped,
        }
    }
}

struct Control {
    status: AtomicU8,
    speed_bits: AtomicU64,
    stop_requested: AtomicBool,
    reset_requested: AtomicBool,
    refresh_in_flight: AtomicBool,
    wake: Notify,
    now: Mutex<NaiveDateTime>,
    forecasts: watch::Sender<Option<WarehouseForecast>>,
}

impl Control {
    fn status(&self) -> DayStatus {
        DayStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: DayStatus, to: DayStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    fn set_now(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable remote control for a [`DaySimulation`].
#[derive(Clone)]
pub struct DayHandle {
    control: Arc<Control>,
}

impl DayHandle {
    pub fn status(&self) -> DayStatus {
        self.control.status()
    }

    /// True while the loop is running or paused.
    pub fn is_playing(&self) -> bool {
        self.status() != DayStatus::Stopped
    }

    /// Pauses a running loop. Returns false if it was not running.
    pub fn pause(&self) -> bool {
        self.control.transition(DayStatus::Running, DayStatus::Paused)
    }

    /// Resumes a paused loop. Returns false if it was not paused.
    pub fn resume(&self) -> bool {
        let resumed = self.control.transition(DayStatus::Paused, DayStatus::Running);
        self.control.wake.notify_waiters();
        resumed
    }

    /// Ends the loop at the next tick; the clock goes back to the start of
    /// the day and in-progress assignments are dropped.
    pub fn stop(&self) {
        self.control.stop_requested.store(true, Ordering::Release);
        self.control.wake.notify_waiters();
    }

    /// Scales the per-tick delay.
    pub fn change_speed(&self, speed: f64) -> Result<(), DayError> {
        validate_speed(speed)?;
        self.control.speed_bits.store(speed.to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        self.control.speed()
    }

    /// Requests a fresh day. Applied once the loop is not active.
    pub fn reset(&self) {
        self.control.reset_requested.store(true, Ordering::Release);
    }

    /// Simulated time of the last tick.
    pub fn current_time(&self) -> NaiveDateTime {
        self.control.now()
    }

    /// Receiver for refreshed forecasts.
    pub fn forecasts(&self) -> watch::Receiver<Option<WarehouseForecast>> {
        self.control.forecasts.subscribe()
    }

    pub fn latest_forecast(&self) -> Option<WarehouseForecast> {
        self.control.forecasts.borrow().clone()
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.control.refresh_in_flight.load(Ordering::Acquire)
    }
}

/// Summary of one `run()`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DayReport {
    pub date: NaiveDate,
    pub ticks: u32,
    /// True if the loop ended through `stop()`
    pub stopped: bool,
    pub refreshes: usize,
    pub zones: BTreeMap<ZoneId, ZoneProgress>,
}

// =============================================================================
// LIVE STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakState {
    Pending,
    OnBreak(NaiveDateTime),
    Taken,
}

/// The mutable day: live copies plus bookkeeping.
struct LiveDay {
    warehouse: Warehouse,
    running_active: BTreeSet<TaskId>,
    running_picks: BTreeSet<TaskId>,
    present: BTreeSet<WorkerId>,
    /// Workers held back for due-dated tasks, shared by every such task in the zone
    waiting: BTreeMap<ZoneId, BTreeSet<WorkerId>>,
    breaks: HashMap<WorkerId, BreakState>,
    completed: BTreeMap<ZoneId, usize>,
    items_picked: BTreeMap<ZoneId, u64>,
    first_arrival: Option<NaiveDateTime>,
    last_refresh: Option<NaiveDateTime>,
}

/// Per-tick knobs handed down to [`LiveDay`].
struct TickEnv<'a> {
    jitter: Jitter,
    break_length: ChronoDuration,
    durations: &'a DurationModel,
    sink: &'a dyn ProgressSink,
}

impl LiveDay {
    fn new(initial: &Warehouse, rng: &mut ChaCha8Rng, shift_jitter_minutes: i64) -> Self {
        let mut warehouse = initial.clone();
        warehouse.timetable.apply_jitter(rng, shift_jitter_minutes);
        let breaks = warehouse
            .timetable
            .shifts()
            .iter()
            .map(|shift| (shift.worker, BreakState::Pending))
            .collect();
        Self {
            warehouse,
            running_active: BTreeSet::new(),
            running_picks: BTreeSet::new(),
            present: BTreeSet::new(),
            waiting: BTreeMap::new(),
            breaks,
            completed: BTreeMap::new(),
            items_picked: BTreeMap::new(),
            first_arrival: None,
            last_refresh: None,
        }
    }

    fn is_available(&self, worker: &Worker) -> bool {
        worker.available
            && worker.assignment.is_none()
            && self.present.contains(&worker.id)
            && !matches!(self.breaks.get(&worker.id), Some(BreakState::OnBreak(_)))
    }

    fn is_waiting(&self, worker: &Worker) -> bool {
        self.waiting
            .get(&worker.zone)
            .is_some_and(|pool| pool.contains(&worker.id))
    }

    /// Idle, present and not held in a waiting pool.
    fn is_free(&self, worker: &Worker) -> bool {
        self.is_available(worker) && !self.is_waiting(worker)
    }

    fn leave_waiting(&mut self, worker: WorkerId) {
        for pool in self.waiting.values_mut() {
            pool.remove(&worker);
        }
    }

    /// (a) arrivals, departures and lunch breaks.
    fn shift_transitions(&mut self, now: NaiveDateTime, break_length: ChronoDuration) {
        let timetable = &self.warehouse.timetable;
        let on_shift: BTreeSet<WorkerId> = self
            .warehouse
            .workers
            .iter()
            .filter(|w| w.available && timetable.is_on_shift(w.id, now))
            .map(|w| w.id)
            .collect();

        for worker in on_shift.difference(&self.present) {
            debug!(worker = %worker, %now, "Worker arrived");
            self.first_arrival.get_or_insert(now);
        }
        let departed: Vec<WorkerId> = self.present.difference(&on_shift).copied().collect();
        self.present = on_shift;

        // Leaving drops any place in a waiting pool; running work is finished first.
        for worker in departed {
            debug!(worker = %worker, %now, "Worker left");
            self.leave_waiting(worker);
        }

        let mut on_break = Vec::new();
        for worker in &self.warehouse.workers {
            let Some(state) = self.breaks.get(&worker.id).copied() else {
                continue;
            };
            match state {
                BreakState::Pending => {
                    let due = self
                        .warehouse
                        .timetable
                        .for_worker(worker.id)
                        .any(|shift| shift.break_due() <= now && shift.covers(now));
                    // A busy worker takes the break once free.
                    if due && worker.assignment.is_none() && self.present.contains(&worker.id) {
                        debug!(worker = %worker.id, %now, "Break started");
                        self.breaks.insert(worker.id, BreakState::OnBreak(now + break_length));
                        on_break.push(worker.id);
                    }
                }
                BreakState::OnBreak(until) if now >= until => {
                    debug!(worker = %worker.id, %now, "Break ended");
                    self.breaks.insert(worker.id, BreakState::Taken);
                }
                _ => {}
            }
        }
        for worker in on_break {
            self.leave_waiting(worker);
        }
    }

    /// (b) + (c) staff active tasks, parking workers on short due-dated ones.
    fn staff_active_tasks(
        &mut self,
        now: NaiveDateTime,
        env: &TickEnv<'_>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(), DayError> {
        let mut order: Vec<usize> = self
            .warehouse
            .active_tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.start.is_none() && t.end.is_none() && is_open(t, now))
            .map(|(i, _)| i)
            .collect();
        order.sort_by_key(|i| {
            let t = &self.warehouse.active_tasks[*i];
            (t.due_time().is_none(), t.due_time(), t.strict_start, t.id)
        });

        for index in order {
            let task = &self.warehouse.active_tasks[index];
            let zone = task.zone();
            let may_wait = task.due_time().is_some();
            let mut eligible: Vec<usize> = self
                .warehouse
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| {
                    w.zone == zone
                        && w.qualifies_for(&task.definition.required_licenses)
                        && (self.is_free(w)
                            || (may_wait && self.is_available(w) && self.is_waiting(w)))
                })
                .map(|(i, _)| i)
                .collect();

            if task.assigned.len() + eligible.len() < task.definition.min_crew() {
                if may_wait && !eligible.is_empty() {
                    let pool = self.waiting.entry(zone).or_default();
                    for worker_index in eligible {
                        pool.insert(self.warehouse.workers[worker_index].id);
                    }
                    debug!(
                        task = %task.id,
                        %zone,
                        waiting = pool.len(),
                        "Workers waiting for crew"
                    );
                }
                continue;
            }

            // Parked workers go first so the pool drains.
            eligible.sort_by_key(|i| !self.is_waiting(&self.warehouse.workers[*i]));
            let task = &mut self.warehouse.active_tasks[index];
            for worker_index in eligible {
                let worker = &mut self.warehouse.workers[worker_index];
                if !task.try_assign(worker.id) {
                    break;
                }
                worker.assignment = Some(Assignment::Active(task.id));
                if let Some(pool) = self.waiting.get_mut(&zone) {
                    pool.remove(&worker.id);
                }
            }

            let crew: Vec<Worker> = task
                .assigned
                .iter()
                .filter_map(|id| self.warehouse.workers.iter().find(|w| w.id == *id))
                .cloned()
                .collect();
            let minutes = env
                .jitter
                .apply(DurationModel::active_minutes(&task.definition, &crew), rng);
            task.start = Some(now);
            task.end = Some(now + minutes_to_duration(minutes));
            self.running_active.insert(task.id);

            debug!(task = %task.id, crew = crew.len(), minutes, "Task started");
            env.sink.task_started(&TaskEvent {
                task: task.id,
                kind: TaskKind::Active,
                zone: task.zone(),
                workers: task.assigned.clone(),
                start: now,
                end: now + minutes_to_duration(minutes),
            })?;
        }
        Ok(())
    }

    /// (d) one free zone worker per unstaffed pick task.
    fn assign_picks(
        &mut self,
        now: NaiveDateTime,
        env: &TickEnv<'_>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(), DayError> {
        for index in 0..self.warehouse.pick_tasks.len() {
            let task = &self.warehouse.pick_tasks[index];
            if task.worker.is_some() || task.end.is_some() {
                continue;
            }
            let Some(zone) = self.warehouse.zone(task.zone) else {
                continue;
            };
            let Some(worker_index) = self
                .warehouse
                .workers
                .iter()
                .position(|w| w.zone == task.zone && self.is_free(w))
            else {
                continue;
            };

            let worker = &self.warehouse.workers[worker_index];
            let estimate = match env.durations.pick_minutes(&zone.name, &task.attributes, worker) {
                Ok(estimate) => estimate,
                Err(err) => {
                    warn!(task = %task.id, %now, "Pick not assigned this tick: {}", err);
                    continue;
                }
            };
            let minutes = env.jitter.apply(estimate, rng);
            let worker_id = worker.id;

            let task = &mut self.warehouse.pick_tasks[index];
            task.worker = Some(worker_id);
            task.start = Some(now);
            task.end = Some(now + minutes_to_duration(minutes));
            self.warehouse.workers[worker_index].assignment = Some(Assignment::Pick(task.id));
            self.running_picks.insert(task.id);

            env.sink.task_started(&TaskEvent {
                task: task.id,
                kind: TaskKind::Pick,
                zone: task.zone,
                workers: vec![worker_id],
                start: now,
                end: now + minutes_to_duration(minutes),
            })?;
        }
        Ok(())
    }

    /// (e) frees the crews of tasks whose end has been reached.
    fn reap(&mut self, now: NaiveDateTime, env: &TickEnv<'_>) -> Result<(), DayError> {
        let mut freed: Vec<WorkerId> = Vec::new();

        for task in self.warehouse.active_tasks.iter() {
            let (Some(start), Some(end)) = (task.start, task.end) else {
                continue;
            };
            if end > now || !self.running_active.remove(&task.id) {
                continue;
            }
            *self.completed.entry(task.zone()).or_default() += 1;
            freed.extend(task.assigned.iter().copied());
            debug!(task = %task.id, %end, "Task finished");
            env.sink.task_finished(&TaskEvent {
                task: task.id,
                kind: TaskKind::Active,
                zone: task.zone(),
                workers: task.assigned.clone(),
                start,
                end,
            })?;
        }

        for task in self.warehouse.pick_tasks.iter() {
            let (Some(start), Some(end), Some(worker)) = (task.start, task.end, task.worker) else {
                continue;
            };
            if end > now || !self.running_picks.remove(&task.id) {
                continue;
            }
            *self.completed.entry(task.zone).or_default() += 1;
            *self.items_picked.entry(task.zone).or_default() +=
                u64::from(task.attributes.pack_count);
            freed.push(worker);
            env.sink.task_finished(&TaskEvent {
                task: task.id,
                kind: TaskKind::Pick,
                zone: task.zone,
                workers: vec![worker],
                start,
                end,
            })?;
        }

        for worker in self.warehouse.workers.iter_mut() {
            if freed.contains(&worker.id) {
                worker.assignment = None;
            }
        }
        Ok(())
    }

    fn is_finished_active(&self, id: TaskId, end: Option<NaiveDateTime>) -> bool {
        end.is_some() && !self.running_active.contains(&id)
    }

    fn is_finished_pick(&self, id: TaskId, end: Option<NaiveDateTime>) -> bool {
        end.is_some() && !self.running_picks.contains(&id)
    }

    /// Current state as a forecast input: unfinished work restarts from
    /// scratch, crews already on a task stay with it.
    fn forecast_snapshot(&self) -> Warehouse {
        let mut snapshot = self.warehouse.clone();
        snapshot
            .active_tasks
            .retain(|t| !self.is_finished_active(t.id, t.end));
        snapshot
            .pick_tasks
            .retain(|t| !self.is_finished_pick(t.id, t.end));
        for task in snapshot.active_tasks.iter_mut() {
            task.start = None;
            task.end = None;
        }
        for task in snapshot.pick_tasks.iter_mut() {
            task.start = None;
            task.end = None;
        }
        snapshot
    }

    fn progress(&self) -> BTreeMap<ZoneId, ZoneProgress> {
        self.warehouse
            .zones
            .iter()
            .map(|zone| {
                let outstanding = self
                    .warehouse
                    .active_tasks
                    .iter()
                    .filter(|t| t.zone() == zone.id && !self.is_finished_active(t.id, t.end))
                    .count()
                    + self
                        .warehouse
                        .pick_tasks
                        .iter()
                        .filter(|t| t.zone == zone.id && !self.is_finished_pick(t.id, t.end))
                        .count();
                let progress = ZoneProgress {
                    completed_tasks: self.completed.get(&zone.id).copied().unwrap_or(0),
                    outstanding_tasks: outstanding,
                    items_picked: self.items_picked.get(&zone.id).copied().unwrap_or(0),
                };
                (zone.id, progress)
            })
            .collect()
    }

    /// Drops every in-progress assignment after a stop.
    fn flush_in_progress(&mut self) {
        for task in self.warehouse.active_tasks.iter_mut() {
            if self.running_active.contains(&task.id) {
                task.assigned.clear();
                task.start = None;
                task.end = None;
            }
        }
        for task in self.warehouse.pick_tasks.iter_mut() {
            if self.running_picks.contains(&task.id) {
                task.worker = None;
                task.start = None;
                task.end = None;
            }
        }
        for worker in self.warehouse.workers.iter_mut() {
            worker.assignment = None;
        }
        self.waiting.clear();
        self.running_active.clear();
        self.running_picks.clear();
        self.present.clear();
    }
}

/// Whether an active task may be staffed at `now`.
///
/// Due-dated tasks open one full (longest) duration before they are due;
/// a strict start is never violated.
fn is_open(task: &ActiveTask, now: NaiveDateTime) -> bool {
    if task.strict_start.is_some_and(|at| now < at) {
        return false;
    }
    match task.due_time() {
        Some(due) => {
            let lead = task.definition.max_duration.max(task.definition.min_duration);
            now >= due - ChronoDuration::minutes(i64::from(lead))
        }
        None => true,
    }
}

// =============================================================================
// DAY SIMULATION
// =============================================================================

/// The live simulation of one workday.
pub struct DaySimulation<Ctx: FloorContext, S: ProgressSink> {
    context: Arc<Ctx>,
    config: DayConfig,
    date: NaiveDate,
    initial: Warehouse,
    live: LiveDay,
    durations: DurationModel,
    engine: MonteCarloEngine<Ctx>,
    sink: Arc<S>,
    control: Arc<Control>,
    rng: ChaCha8Rng,
}

impl<Ctx: FloorContext, S: ProgressSink> DaySimulation<Ctx, S> {
    /// Prepares a day from `warehouse`, keeping only `date`'s work and shifts.
    pub fn new(
        context: Arc<Ctx>,
        config: DayConfig,
        warehouse: &Warehouse,
        date: NaiveDate,
        estimators: Arc<EstimatorRegistry>,
        sink: Arc<S>,
    ) -> Result<Self, DayError> {
        config.validate()?;
        warehouse.validate()?;

        let initial = warehouse.snapshot_for(date);
        for zone in initial.zones.iter().filter(|z| z.is_pick_zone) {
            if initial.zone_pick_tasks(zone.id).next().is_some() {
                estimators.model_for(&zone.name)?;
            }
        }

        let mut rng =
            ChaCha8Rng::seed_from_u64(context.derive_seed(date.num_days_from_ce() as u64));
        let live = LiveDay::new(&initial, &mut rng, config.shift_jitter_minutes);
        let (forecasts, _) = watch::channel(None);
        let control = Arc::new(Control {
            status: AtomicU8::new(DayStatus::Stopped as u8),
            speed_bits: AtomicU64::new(config.speed.to_bits()),
            stop_requested: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            refresh_in_flight: AtomicBool::new(false),
            wake: Notify::new(),
            now: Mutex::new(date.and_time(NaiveTime::MIN)),
            forecasts,
        });

        Ok(Self {
            engine: MonteCarloEngine::new(
                Arc::clone(&context),
                config.forecast,
                Arc::clone(&estimators),
            ),
            durations: DurationModel::new(estimators),
            context,
            config,
            date,
            initial,
            live,
            sink,
            control,
            rng,
        })
    }

    /// A control handle for this simulation.
    pub fn handle(&self) -> DayHandle {
        DayHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// The live state (workers, tasks, jittered shifts).
    pub fn warehouse(&self) -> &Warehouse {
        &self.live.warehouse
    }

    /// Per-zone counters right now.
    pub fn progress(&self) -> BTreeMap<ZoneId, ZoneProgress> {
        self.live.progress()
    }

    fn day_start(&self) -> NaiveDateTime {
        self.date.and_time(NaiveTime::MIN)
    }

    fn tick_delay(&self) -> Duration {
        let per_tick = self.config.simulation_minutes * 60.0 / MINUTES_PER_DAY as f64;
        Duration::from_secs_f64((per_tick / self.control.speed()).max(0.0))
    }

    fn apply_pending_reset(&mut self) {
        if self.control.reset_requested.swap(false, Ordering::AcqRel) {
            self.live = LiveDay::new(
                &self.initial,
                &mut self.rng,
                self.config.shift_jitter_minutes,
            );
            self.control.set_now(self.day_start());
            info!(date = %self.date, "Day reset");
        }
    }

    /// Runs the day from 00:01 to 00:00 the next day, or until stopped.
    pub async fn run(&mut self) -> Result<DayReport, DayError> {
        if !self.control.transition(DayStatus::Stopped, DayStatus::Running) {
            return Err(DayError::AlreadyRunning);
        }
        self.control.stop_requested.store(false, Ordering::Release);
        self.apply_pending_reset();
        info!(
            date = %self.date,
            workers = self.live.warehouse.workers.len(),
            "Day simulation started"
        );

        let outcome = self.run_loop().await;

        self.control.status.store(DayStatus::Stopped as u8, Ordering::Release);
        // A failed tick ends the day like a stop.
        if !matches!(outcome, Ok((_, false, _))) {
            self.live.flush_in_progress();
            self.control.set_now(self.day_start());
        }
        self.apply_pending_reset();
        let (ticks, stopped, refreshes) = outcome?;

        info!(date = %self.date, ticks, stopped, refreshes, "Day simulation finished");
        Ok(DayReport {
            date: self.date,
            ticks,
            stopped,
            refreshes,
            zones: self.live.progress(),
        })
    }

    async fn run_loop(&mut self) -> Result<(u32, bool, usize), DayError> {
        let day_start = self.day_start();
        let mut ticks = 0;
        let mut refreshes = 0;

        for minute in 1..=MINUTES_PER_DAY {
            if !self.wait_while_paused().await {
                return Ok((ticks, true, refreshes));
            }
            let now = day_start + ChronoDuration::minutes(minute);
            self.control.set_now(now);

            if self.tick(now, minute)? {
                refreshes += 1;
            }
            ticks += 1;

            self.context.sleep(self.tick_delay()).await;
        }
        Ok((ticks, false, refreshes))
    }

    /// Returns false if a stop was requested.
    async fn wait_while_paused(&self) -> bool {
        loop {
            let mut woken = std::pin::pin!(self.control.wake.notified());
            woken.as_mut().enable();
            if self.control.stop_requested.load(Ordering::Acquire) {
                return false;
            }
            if self.control.status() != DayStatus::Paused {
                return true;
            }
            woken.await;
        }
    }

    /// One minute. Returns true if a forecast refresh was launched.
    fn tick(&mut self, now: NaiveDateTime, minute: i64) -> Result<bool, DayError> {
        let env = TickEnv {
            jitter: Jitter::minutes(self.config.task_jitter_minutes),
            break_length: ChronoDuration::minutes(self.config.break_minutes),
            durations: &self.durations,
            sink: self.sink.as_ref(),
        };

        self.live.shift_transitions(now, env.break_length);
        self.live.staff_active_tasks(now, &env, &mut self.rng)?;
        self.live.assign_picks(now, &env, &mut self.rng)?;
        self.live.reap(now, &env)?;

        let refreshed = self.maybe_refresh(now, minute);

        if minute % self.config.snapshot_interval_minutes == 0 {
            self.sink.record_progress(now, &self.live.progress())?;
        }
        Ok(refreshed)
    }

    /// (f) launches a background forecast unless one is already running.
    fn maybe_refresh(&mut self, now: NaiveDateTime, minute: i64) -> bool {
        if minute >= MINUTES_PER_DAY {
            return false;
        }
        let Some(first) = self.live.first_arrival else {
            return false;
        };
        if now < first + ChronoDuration::minutes(self.config.refresh_after_first_arrival_minutes) {
            return false;
        }
        if let Some(last) = self.live.last_refresh {
            if now < last + ChronoDuration::minutes(self.config.refresh_interval_minutes) {
                return false;
            }
        }
        if self
            .control
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.live.last_refresh = Some(now);
        let snapshot = self.live.forecast_snapshot();
        let engine = self.engine.clone();
        let control = Arc::clone(&self.control);
        self.context.spawn("forecast-refresh", async move {
            match engine.forecast(&snapshot, now).await {
                Ok(forecast) => {
                    control.forecasts.send_replace(Some(forecast));
                }
                Err(err) => warn!(%now, "Forecast refresh failed: {}", err),
            }
            control.refresh_in_flight.store(false, Ordering::Release);
        });
        info!(%now, "Forecast refresh launched");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimContext;
    use crate::sink::{MemorySink, NullSink};
    use crate::test_support::*;
    use floorcast_core::{
        LinearPickModel, PickAttributes, PickTimeModel, ShiftWindow, TaskDefinition, Timetable,
        Zone,
    };
    use floorcast_env::TokioContext;

    fn estimators() -> Arc<EstimatorRegistry> {
        Arc::new(EstimatorRegistry::new().with_model("dry", Arc::new(LinearPickModel::default())))
    }

    fn config() -> DayConfig {
        DayConfig::default().with_forecast(
            MonteCarloConfig::default()
                .with_trials(3)
                .with_max_parallel_trials(2),
        )
    }

    fn simulation<S: ProgressSink>(sink: Arc<S>) -> DaySimulation<SimContext, S> {
        DaySimulation::new(
            SimContext::shared(11),
            config(),
            &sample_warehouse(),
            day(),
            estimators(),
            sink,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_zero_simulation_time_runs_full_day() {
        let mut sim = simulation(Arc::new(NullSink));
        let handle = sim.handle();

        let report = sim.run().await.unwrap();

        assert_eq!(report.ticks, 1440);
        assert!(!report.stopped);
        assert!(!handle.is_playing());
        assert_eq!(handle.status(), DayStatus::Stopped);
        assert_eq!(handle.current_time(), day().succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_all_work_completes() {
        let sink = Arc::new(MemorySink::new());
        let mut sim = simulation(Arc::clone(&sink));
        let warehouse = sample_warehouse();
        let total = warehouse.active_tasks.len() + warehouse.pick_tasks.len();

        let report = sim.run().await.unwrap();

        assert_eq!(sink.finished().len(), total);
        assert!(report.zones.values().all(|p| p.outstanding_tasks == 0));
        let completed: usize = report.zones.values().map(|p| p.completed_tasks).sum();
        assert_eq!(completed, total);
        let packs: u64 = warehouse
            .pick_tasks
            .iter()
            .map(|t| u64::from(t.attributes.pack_count))
            .sum();
        assert_eq!(report.zones[&ZoneId(2)].items_picked, packs);
    }

    #[tokio::test]
    async fn test_crews_respect_bounds() {
        let sink = Arc::new(MemorySink::new());
        let mut sim = simulation(Arc::clone(&sink));
        sim.run().await.unwrap();

        let warehouse = sample_warehouse();
        for event in sink.started().iter().filter(|e| e.kind == TaskKind::Active) {
            let task = warehouse.active_tasks.iter().find(|t| t.id == event.task).unwrap();
            assert!(event.workers.len() >= task.definition.min_crew(), "{event:?}");
            assert!(event.workers.len() <= task.definition.max_crew(), "{event:?}");
        }
        for event in sink.started().iter().filter(|e| e.kind == TaskKind::Pick) {
            assert_eq!(event.workers.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_no_worker_on_two_tasks_at_once() {
        let sink = Arc::new(MemorySink::new());
        let mut sim = simulation(Arc::clone(&sink));
        sim.run().await.unwrap();

        let events = sink.started();
        for (i, a) in events.iter().enumerate() {
            for b in &events[i + 1..] {
                let shared = a.workers.iter().any(|w| b.workers.contains(w));
                let overlap = a.start < b.end && b.start < a.end;
                assert!(!(shared && overlap), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_snapshots_every_ten_minutes() {
        let sink = Arc::new(MemorySink::new());
        let mut sim = simulation(Arc::clone(&sink));
        sim.run().await.unwrap();

        let snapshots = sink.snapshots();
        assert_eq!(snapshots.len(), 144);
        assert_eq!(snapshots[0].0, at(0, 10));
        assert_eq!(snapshots[0].1.len(), 3);
    }

    #[tokio::test]
    async fn test_forecast_refresh_is_published() {
        let mut sim = simulation(Arc::new(NullSink));
        let handle = sim.handle();
        let mut forecasts = handle.forecasts();

        let report = sim.run().await.unwrap();
        assert!(report.refreshes >= 1);

        if forecasts.borrow().is_none() {
            tokio::time::timeout(Duration::from_secs(10), forecasts.changed())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(handle.latest_forecast().is_some());
    }

    #[tokio::test]
    async fn test_pause_resume_stop() {
        let sim = simulation(Arc::new(NullSink));
        let handle = sim.handle();
        let task = tokio::spawn(async move {
            let mut sim = sim;
            let report = sim.run().await;
            (sim, report)
        });

        while handle.status() != DayStatus::Running {
            tokio::task::yield_now().await;
        }
        assert!(handle.pause());
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.status(), DayStatus::Paused);
        let frozen = handle.current_time();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.current_time(), frozen);

        assert!(handle.resume());
        assert!(!handle.resume());
        handle.stop();

        let (sim, report) = task.await.unwrap();
        let report = report.unwrap();
        assert!(report.stopped);
        assert!(report.ticks < 1440);
        assert!(!handle.is_playing());
        assert_eq!(handle.current_time(), at(0, 0));
        assert!(sim.warehouse().workers.iter().all(|w| w.assignment.is_none()));
    }

    #[tokio::test]
    async fn test_reset_restores_fresh_day() {
        let sink = Arc::new(MemorySink::new());
        let mut sim = simulation(Arc::clone(&sink));
        let handle = sim.handle();
        let total = sample_warehouse().active_tasks.len() + sample_warehouse().pick_tasks.len();

        sim.run().await.unwrap();
        handle.reset();
        sim.run().await.unwrap();

        assert_eq!(sink.finished().len(), total * 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_speed() {
        let sim = simulation(Arc::new(NullSink));
        let handle = sim.handle();
        assert!(matches!(handle.change_speed(0.0), Err(DayError::InvalidConfig(_))));
        assert!(handle.change_speed(4.0).is_ok());
        assert_eq!(handle.speed(), 4.0);
    }

    #[tokio::test]
    async fn test_missing_pick_model_is_rejected_up_front() {
        let result = DaySimulation::new(
            SimContext::shared(1),
            config(),
            &sample_warehouse(),
            day(),
            Arc::new(EstimatorRegistry::new()),
            Arc::new(NullSink),
        );
        assert!(matches!(result, Err(DayError::Estimate(_))));
    }

    #[test]
    fn test_due_task_opens_one_duration_early() {
        let def = floorcast_core::TaskDefinition::new("ship", ZoneId(1), (20, 45), (1, 2));
        let task = ActiveTask::new(1, def, day()).with_due(at(12, 0));
        assert!(!is_open(&task, at(11, 14)));
        assert!(is_open(&task, at(11, 15)));

        let def = floorcast_core::TaskDefinition::new("sweep", ZoneId(1), (20, 45), (1, 2));
        let task = ActiveTask::new(2, def, day()).with_strict_start(at(9, 0));
        assert!(!is_open(&task, at(8, 59)));
        assert!(is_open(&task, at(9, 0)));
    }

    // -------------------------------------------------------------------------
    // LiveDay step by step
    // -------------------------------------------------------------------------

    fn dock_warehouse(
        workers: u64,
        tasks: Vec<ActiveTask>,
        shifts: Vec<ShiftWindow>,
    ) -> Warehouse {
        Warehouse {
            zones: vec![Zone::new(1, "dock", false)],
            workers: (1..=workers)
                .map(|i| Worker::new(i, "w", ZoneId(1), 1.0))
                .collect(),
            active_tasks: tasks,
            pick_tasks: vec![],
            timetable: Timetable::new(shifts),
        }
    }

    fn live(warehouse: &Warehouse) -> LiveDay {
        LiveDay::new(warehouse, &mut ChaCha8Rng::seed_from_u64(1), 0)
    }

    fn tick_env<'a>(durations: &'a DurationModel, sink: &'a dyn ProgressSink) -> TickEnv<'a> {
        TickEnv {
            jitter: Jitter::none(),
            break_length: ChronoDuration::minutes(30),
            durations,
            sink,
        }
    }

    /// Plays every minute in `from..=to`.
    fn play(floor: &mut LiveDay, env: &TickEnv<'_>, from: NaiveDateTime, to: NaiveDateTime) {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut now = from;
        while now <= to {
            floor.shift_transitions(now, env.break_length);
            floor.staff_active_tasks(now, env, &mut rng).unwrap();
            floor.assign_picks(now, env, &mut rng).unwrap();
            floor.reap(now, env).unwrap();
            now += ChronoDuration::minutes(1);
        }
    }

    fn worker(floor: &LiveDay, id: u64) -> &Worker {
        floor.warehouse.worker(WorkerId(id)).unwrap()
    }

    fn is_parked(floor: &LiveDay, id: u64) -> bool {
        floor.is_waiting(worker(floor, id))
    }

    #[test]
    fn test_due_tasks_share_one_waiting_pool() {
        let ship = TaskDefinition::new("ship", ZoneId(1), (60, 60), (2, 2));
        let rush = TaskDefinition::new("rush", ZoneId(1), (20, 20), (2, 2));
        let warehouse = dock_warehouse(
            2,
            vec![
                ActiveTask::new(1, ship, day()).with_due(at(10, 0)),
                ActiveTask::new(2, rush, day()).with_due(at(9, 40)),
            ],
            vec![
                shift(1, 8, 16),
                ShiftWindow::new(WorkerId(2), at(9, 30), at(17, 0)),
            ],
        );
        let durations = DurationModel::new(Arc::new(EstimatorRegistry::new()));
        let sink = MemorySink::new();
        let env = tick_env(&durations, &sink);
        let mut floor = live(&warehouse);

        play(&mut floor, &env, at(0, 1), at(9, 29));
        assert!(sink.started().is_empty());
        assert!(is_parked(&floor, 1));
        assert!(worker(&floor, 1).assignment.is_none());

        play(&mut floor, &env, at(9, 30), at(11, 0));
        let started = sink.started();
        let rush = started.iter().find(|e| e.task == TaskId(2)).unwrap();
        let ship = started.iter().find(|e| e.task == TaskId(1)).unwrap();
        assert_eq!(rush.start, at(9, 30));
        assert_eq!(rush.workers.len(), 2);
        assert_eq!(ship.start, at(9, 51));
        assert_eq!(sink.finished().len(), 2);
        assert!(floor.waiting.values().all(BTreeSet::is_empty));
    }

    #[test]
    fn test_parked_worker_is_not_used_for_undated_work() {
        let ship = TaskDefinition::new("ship", ZoneId(1), (60, 60), (2, 2));
        let sweep = TaskDefinition::new("sweep", ZoneId(1), (15, 15), (1, 1));
        let warehouse = dock_warehouse(
            1,
            vec![
                ActiveTask::new(1, ship, day()).with_due(at(10, 0)),
                ActiveTask::new(2, sweep, day()).with_strict_start(at(9, 30)),
            ],
            vec![shift(1, 8, 16)],
        );
        let durations = DurationModel::new(Arc::new(EstimatorRegistry::new()));
        let sink = MemorySink::new();
        let env = tick_env(&durations, &sink);
        let mut floor = live(&warehouse);

        play(&mut floor, &env, at(0, 1), at(9, 45));
        assert!(is_parked(&floor, 1));
        assert!(sink.started().is_empty());
    }

    #[test]
    fn test_departure_leaves_waiting_pool() {
        let ship = TaskDefinition::new("ship", ZoneId(1), (60, 60), (2, 2));
        let warehouse = dock_warehouse(
            1,
            vec![ActiveTask::new(1, ship, day()).with_due(at(9, 30))],
            vec![shift(1, 6, 9)],
        );
        let durations = DurationModel::new(Arc::new(EstimatorRegistry::new()));
        let env = tick_env(&durations, &NullSink);
        let mut floor = live(&warehouse);

        play(&mut floor, &env, at(0, 1), at(8, 45));
        assert!(is_parked(&floor, 1));

        play(&mut floor, &env, at(8, 46), at(9, 0));
        assert!(!floor.present.contains(&WorkerId(1)));
        assert!(!is_parked(&floor, 1));
        assert!(worker(&floor, 1).assignment.is_none());
        assert!(floor.warehouse.active_tasks[0].assigned.is_empty());
    }

    #[test]
    fn test_lunch_break_takes_worker_off_the_floor() {
        let warehouse = dock_warehouse(1, vec![], vec![shift(1, 6, 14)]);
        let durations = DurationModel::new(Arc::new(EstimatorRegistry::new()));
        let env = tick_env(&durations, &NullSink);
        let mut floor = live(&warehouse);

        play(&mut floor, &env, at(0, 1), at(9, 59));
        assert_eq!(floor.breaks[&WorkerId(1)], BreakState::Pending);
        assert!(floor.is_free(worker(&floor, 1)));

        play(&mut floor, &env, at(10, 0), at(10, 0));
        assert_eq!(floor.breaks[&WorkerId(1)], BreakState::OnBreak(at(10, 30)));
        play(&mut floor, &env, at(10, 1), at(10, 29));
        assert!(!floor.is_free(worker(&floor, 1)));

        play(&mut floor, &env, at(10, 30), at(10, 30));
        assert_eq!(floor.breaks[&WorkerId(1)], BreakState::Taken);
        assert!(floor.is_free(worker(&floor, 1)));
    }

    #[test]
    fn test_busy_worker_breaks_after_task() {
        let haul = TaskDefinition::new("haul", ZoneId(1), (300, 300), (1, 1));
        let warehouse = dock_warehouse(
            1,
            vec![ActiveTask::new(1, haul, day())],
            vec![shift(1, 6, 14)],
        );
        let durations = DurationModel::new(Arc::new(EstimatorRegistry::new()));
        let sink = MemorySink::new();
        let env = tick_env(&durations, &sink);
        let mut floor = live(&warehouse);

        play(&mut floor, &env, at(0, 1), at(10, 30));
        assert_eq!(sink.started()[0].start, at(6, 0));
        assert_eq!(floor.breaks[&WorkerId(1)], BreakState::Pending);

        play(&mut floor, &env, at(10, 31), at(11, 1));
        assert_eq!(sink.finished().len(), 1);
        assert_eq!(floor.breaks[&WorkerId(1)], BreakState::OnBreak(at(11, 31)));
    }

    // -------------------------------------------------------------------------
    // Failure handling and pacing
    // -------------------------------------------------------------------------

    /// Scores every pick except two-pack ones, which come back as NaN.
    struct NanOnTwoPacks;

    impl PickTimeModel for NanOnTwoPacks {
        fn estimate_seconds(&self, attributes: &PickAttributes, _: &Worker) -> f64 {
            if attributes.pack_count == 2 {
                f64::NAN
            } else {
                60.0
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_pick_estimate_skips_the_pick() {
        let sink = Arc::new(MemorySink::new());
        let mut sim = DaySimulation::new(
            SimContext::shared(11),
            config(),
            &sample_warehouse(),
            day(),
            Arc::new(EstimatorRegistry::new().with_model("dry", Arc::new(NanOnTwoPacks))),
            Arc::clone(&sink),
        )
        .unwrap();
        let warehouse = sample_warehouse();
        let total = warehouse.active_tasks.len() + warehouse.pick_tasks.len();

        let report = sim.run().await.unwrap();

        assert_eq!(report.ticks, 1440);
        assert_eq!(sink.finished().len(), total - 1);
        assert!(sink.finished().iter().all(|e| e.task != TaskId(102)));
        assert_eq!(report.zones[&ZoneId(2)].outstanding_tasks, 1);
    }

    /// Refuses every task start.
    struct ReadOnlyStore;

    impl ProgressSink for ReadOnlyStore {
        fn task_started(&self, _: &TaskEvent) -> Result<(), SinkError> {
            Err(SinkError::Rejected("read-only".to_string()))
        }

        fn task_finished(&self, _: &TaskEvent) -> Result<(), SinkError> {
            Ok(())
        }

        fn record_progress(
            &self,
            _: NaiveDateTime,
            _: &BTreeMap<ZoneId, ZoneProgress>,
        ) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_failure_ends_day_cleanly() {
        let mut sim = simulation(Arc::new(ReadOnlyStore));
        let handle = sim.handle();

        let err = sim.run().await.unwrap_err();

        assert!(matches!(err, DayError::Sink(SinkError::Rejected(_))));
        assert!(!handle.is_playing());
        assert_eq!(handle.current_time(), at(0, 0));
        assert!(sim.warehouse().workers.iter().all(|w| w.assignment.is_none()));
        assert!(sim.warehouse().active_tasks.iter().all(|t| t.start.is_none()));
    }

    #[tokio::test]
    async fn test_wall_clock_context_paces_ticks() {
        let warehouse = dock_warehouse(1, vec![], vec![shift(1, 6, 14)]);
        let config = config().with_simulation_minutes(0.012);
        let mut sim = DaySimulation::new(
            TokioContext::shared(),
            config,
            &warehouse,
            day(),
            Arc::new(EstimatorRegistry::new()),
            Arc::new(NullSink),
        )
        .unwrap();

        let started = std::time::Instant::now();
        let report = sim.run().await.unwrap();

        assert_eq!(report.ticks, 1440);
        // 1440 ticks of 0.5 ms each
        assert!(started.elapsed() >= Duration::from_millis(700));
    }
}
