//! ZoneSimulator - runs one zone's task queue to completion for one trial.
//!
//! Each task becomes a unit of work on a bounded `JoinSet`. A unit acquires
//! its crew from the zone's [`WorkerPool`], computes its duration, sleeps
//! for the (scaled) duration and stamps start/end against the shared
//! [`ZoneClock`].

use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use floorcast_core::{
    minutes_to_duration, AcquireRequest, ActiveTask, Assignment, CompletedTask, DurationModel,
    PickTask, PickTimeModel, Timetable, Worker, WorkerPool, Zone, ZoneClock, ZoneError,
    ZoneOutcome, ZoneRun,
};
use floorcast_env::{FloorContext, TaskId, WorkerId, ZoneId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Knobs for a single zone-trial.
#[derive(Debug, Clone, Copy)]
pub struct ZoneRunConfig {
    /// Wall-clock ceiling for the whole zone
    pub timeout: Duration,

    /// Context sleep per simulated minute (zero = run as fast as possible)
    pub minute_scale: Duration,

    /// Seed for the worker pool's ordering
    pub seed: u64,
}

impl Default for ZoneRunConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            minute_scale: Duration::ZERO,
            seed: 0,
        }
    }
}

impl ZoneRunConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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

/// The tasks a zone has to get through.
#[derive(Clone)]
pub enum ZoneWork {
    /// Generic tasks
    Active(Vec<ActiveTask>),

    /// Pick tasks, scored by the zone's resolved model
    Pick {
        tasks: Vec<PickTask>,
        model: Arc<dyn PickTimeModel>,
    },
}

impl std::fmt::Debug for ZoneWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneWork::Active(tasks) => f.debug_tuple("Active").field(&tasks.len()).finish(),
            ZoneWork::Pick { tasks, .. } => f.debug_tuple("Pick").field(&tasks.len()).finish(),
        }
    }
}

impl ZoneWork {
    pub fn len(&self) -> usize {
        match self {
            ZoneWork::Active(tasks) => tasks.len(),
            ZoneWork::Pick { tasks, .. } => tasks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Which worker is already on which task, according to the task lists.
    fn holders(&self) -> HashMap<WorkerId, Assignment> {
        match self {
            ZoneWork::Active(tasks) => tasks
                .iter()
                .flat_map(|t| t.assigned.iter().map(move |w| (*w, Assignment::Active(t.id))))
                .collect(),
            ZoneWork::Pick { tasks, .. } => tasks
                .iter()
                .filter_map(|t| t.worker.map(|w| (w, Assignment::Pick(t.id))))
                .collect(),
        }
    }
}

/// One schedulable unit inside the zone.
enum Unit {
    Active(ActiveTask),
    Pick(PickTask, Arc<dyn PickTimeModel>),
}

impl Unit {
    fn id(&self) -> TaskId {
        match self {
            Unit::Active(task) => task.id,
            Unit::Pick(task, _) => task.id,
        }
    }

    fn request(&self) -> AcquireRequest {
        match self {
            Unit::Active(task) => AcquireRequest {
                task: task.id,
                desired: task.definition.max_crew(),
                min: task.definition.min_crew(),
                licenses: task.definition.required_licenses.clone(),
            },
            Unit::Pick(task, _) => AcquireRequest {
                task: task.id,
                desired: 1,
                min: 1,
                licenses: Default::default(),
            },
        }
    }

    fn minutes(&self, crew: &[Worker]) -> f64 {
        match (self, crew.first()) {
            (Unit::Active(task), _) => DurationModel::active_minutes(&task.definition, crew),
            (Unit::Pick(task, model), Some(worker)) => {
                DurationModel::pick_minutes_with(model.as_ref(), &task.attributes, worker)
            }
            (Unit::Pick(..), None) => 0.0,
        }
    }
}

/// Runs single zones for single trials.
pub struct ZoneSimulator<Ctx: FloorContext> {
    context: Arc<Ctx>,
    config: ZoneRunConfig,
}

impl<Ctx: FloorContext> ZoneSimulator<Ctx> {
    pub fn new(context: Arc<Ctx>, config: ZoneRunConfig) -> Self {
        Self { context, config }
    }

    /// Runs `zone` from `reference` until every task is done.
    ///
    /// `workers` and `work` are this trial's private copies.
    pub async fn run(
        &self,
        zone: &Zone,
        mut workers: Vec<Worker>,
        work: ZoneWork,
        timetable: Arc<Timetable>,
        reference: NaiveDateTime,
    ) -> ZoneOutcome {
        if work.is_empty() {
            return Err(ZoneError::NoTasks { zone: zone.id });
        }
        workers.retain(|w| w.available);
        if workers.is_empty() {
            return Err(ZoneError::NoWorkers { zone: zone.id });
        }

        let date = reference.date();
        let day_end = date.and_time(NaiveTime::MIN) + ChronoDuration::days(1);
        let start = effective_start(zone.id, &workers, &work, &timetable, reference)?;

        // The task lists are authoritative for who is already on what.
        let holders = work.holders();
        for worker in &mut workers {
            worker.assignment = holders.get(&worker.id).copied();
        }

        let units = prioritize(work);
        let pool = Arc::new(WorkerPool::new(zone.id, timetable, day_end, self.config.seed));
        pool.initialize(&workers, start);
        let clock = Arc::new(ZoneClock::new(start));
        let permits = Arc::new(Semaphore::new(workers.len()));

        debug!(
            zone = %zone.id,
            tasks = units.len(),
            workers = workers.len(),
            %start,
            "Zone run started"
        );

        let zone_id = zone.id;
        let context = Arc::clone(&self.context);
        let minute_scale = self.config.minute_scale;
        let mut run = ZoneRun::new(zone_id, start);

        let drive = async {
            let mut set = JoinSet::new();
            for unit in units {
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let pool = Arc::clone(&pool);
                let clock = Arc::clone(&clock);
                let context = Arc::clone(&context);
                set.spawn(async move {
                    let outcome =
                        execute(unit, &pool, &clock, context.as_ref(), minute_scale).await;
                    drop(permit);
                    outcome
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(done)) => run.record(done),
                    Ok(Err(err)) => {
                        set.abort_all();
                        return Err(err);
                    }
                    Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Err(_) => {}
                }
            }
            Ok(())
        };

        match tokio::time::timeout(self.config.timeout, drive).await {
            Ok(Ok(())) => {
                debug!(
                    zone = %zone_id,
                    completed = run.tasks.len(),
                    last_end = ?run.last_end(),
                    "Zone run finished"
                );
                Ok(run)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ZoneError::Timeout {
                zone: zone_id,
                ceiling_secs: self.config.timeout.as_secs(),
            }),
        }
    }
}

/// First instant the zone can start work.
///
/// That is the earliest shift start among the zone's workers or, when
/// due-dated tasks exist, the earliest instant the task with the smallest
/// minimum crew can be staffed; never before `reference`.
fn effective_start(
    zone: ZoneId,
    workers: &[Worker],
    work: &ZoneWork,
    timetable: &Timetable,
    reference: NaiveDateTime,
) -> Result<NaiveDateTime, ZoneError> {
    let date = reference.date();
    let ids: Vec<WorkerId> = workers.iter().map(|w| w.id).collect();
    let first = timetable
        .first_start(&ids, date)
        .ok_or(ZoneError::NoShifts { zone, date })?;

    let anchor = match work {
        ZoneWork::Active(tasks) if tasks.iter().any(|t| t.due.is_some()) => tasks
            .iter()
            .min_by_key(|t| t.definition.min_crew())
            .and_then(|task| {
                let qualified: Vec<WorkerId> = workers
                    .iter()
                    .filter(|w| w.qualifies_for(&task.definition.required_licenses))
                    .map(|w| w.id)
                    .collect();
                timetable.earliest_staffing(
                    &qualified,
                    task.definition.min_crew(),
                    date.and_time(NaiveTime::MIN),
                    date.and_time(NaiveTime::MIN) + ChronoDuration::days(1),
                )
            })
            .unwrap_or(first),
        _ => first,
    };

    Ok(anchor.max(reference))
}

/// Orders units: tasks already holding workers first, then by due date.
fn prioritize(work: ZoneWork) -> Vec<Unit> {
    match work {
        ZoneWork::Active(mut tasks) => {
            tasks.sort_by_key(|t| {
                (
                    t.assigned.is_empty(),
                    t.due.unwrap_or(NaiveDateTime::MAX),
                    t.id,
                )
            });
            tasks.into_iter().map(Unit::Active).collect()
        }
        ZoneWork::Pick { mut tasks, model } => {
            tasks.sort_by_key(|t| t.worker.is_none());
            tasks
                .into_iter()
                .map(|t| Unit::Pick(t, Arc::clone(&model)))
                .collect()
        }
    }
}

async fn execute<Ctx: FloorContext>(
    unit: Unit,
    pool: &WorkerPool,
    clock: &ZoneClock,
    context: &Ctx,
    minute_scale: Duration,
) -> Result<CompletedTask, ZoneError> {
    let grant = pool.acquire(&unit.request(), clock).await?;
    let minutes = unit.minutes(&grant.workers);

    let start = clock.advance_to(grant.ready_at);
    let end = start + minutes_to_duration(minutes);
    trace!(task = %unit.id(), crew = grant.workers.len(), minutes, %start, "Task started");

    context.sleep(minute_scale.mul_f64(minutes)).await;

    let crew = grant.ids();
    pool.release_all(&crew, end);
    trace!(task = %unit.id(), %end, "Task finished");

    Ok(CompletedTask {
        task: unit.id(),
        workers: crew,
        start,
        end,
    })
}
