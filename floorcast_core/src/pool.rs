//! Per-zone, per-trial worker pool and logical clock.
//!
//! ```text
//!   task unit ──acquire(desired, min)──► WorkerPool ──► Granted(workers, ready_at)
//!       ▲                                  │  │
//!       │            Notify (release) ◄────┘  └──► ZoneClock.advance_to(ready_at)
//!       └──────────── release(workers, free_at)
//! ```
//!
//! The pool is the only place that moves the zone clock forward because of
//! staffing: when a crew is only complete after a release or a later shift
//! arrival, the clock jumps there. Acquisition is all-or-nothing: a caller
//! either gets at least `min` workers in one step or holds nothing while it
//! waits.

use chrono::{DateTime, NaiveDateTime};
use floorcast_env::{TaskId, WorkerId, ZoneId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::ZoneError;
use crate::model::Worker;
use crate::timetable::Timetable;

// =============================================================================
// ZONE CLOCK
// =============================================================================

/// Monotonic logical clock shared by the task units of one zone-trial.
#[derive(Debug)]
pub struct ZoneClock {
    secs: AtomicI64,
}

fn to_secs(at: NaiveDateTime) -> i64 {
    at.and_utc().timestamp()
}

fn from_secs(secs: i64) -> NaiveDateTime {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or(NaiveDateTime::MIN)
}

impl ZoneClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            secs: AtomicI64::new(to_secs(start)),
        }
    }

    /// Current logical time.
    pub fn now(&self) -> NaiveDateTime {
        from_secs(self.secs.load(Ordering::Acquire))
    }

    /// Moves the clock to `at` unless it is already later.
    ///
    /// Returns the clock value after the update.
    pub fn advance_to(&self, at: NaiveDateTime) -> NaiveDateTime {
        let target = to_secs(at);
        let previous = self.secs.fetch_max(target, Ordering::AcqRel);
        from_secs(previous.max(target))
    }
}

// =============================================================================
// WORKER POOL
// =============================================================================

/// What a caller wants from the pool.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Task the workers are for
    pub task: TaskId,

    /// Upper bound on the crew
    pub desired: usize,

    /// Fewest workers the task can start with
    pub min: usize,

    /// Licenses every granted worker must hold
    pub licenses: BTreeSet<String>,
}

/// A successful acquisition.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Granted workers, at least `min` and at most `desired`
    pub workers: Vec<Worker>,

    /// Earliest instant every granted worker is free and present
    pub ready_at: NaiveDateTime,
}

impl Grant {
    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Not yet seen on shift
    Absent,
    Free,
    /// Pre-assigned to a task that has not claimed it yet
    Reserved(TaskId),
    Busy(TaskId),
}

#[derive(Debug)]
struct Slot {
    worker: Worker,
    state: SlotState,
    free_at: NaiveDateTime,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    rng: StdRng,
}

/// Outcome of one non-blocking acquisition attempt.
#[derive(Debug)]
enum Attempt {
    Granted(Grant),
    /// Workers held by other tasks may yield an earlier start once released
    Wait,
}

/// Exclusive accounting of one zone's workers for one trial.
#[derive(Debug)]
pub struct WorkerPool {
    zone: ZoneId,
    timetable: Arc<Timetable>,
    day_end: NaiveDateTime,
    state: Mutex<PoolState>,
    released: Notify,
}

impl WorkerPool {
    /// Creates an empty pool. `day_end` bounds the shift look-ahead.
    pub fn new(zone: ZoneId, timetable: Arc<Timetable>, day_end: NaiveDateTime, seed: u64) -> Self {
        Self {
            zone,
            timetable,
            day_end,
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds the pool with the zone's roster as of `at`.
    ///
    /// Unavailable workers are ignored. Workers carrying an assignment are
    /// reserved for that task; everyone else is free if on shift at `at`
    /// and admitted later otherwise.
    pub fn initialize(&self, roster: &[Worker], at: NaiveDateTime) {
        let mut state = self.lock();
        state.slots = roster
            .iter()
            .filter(|worker| worker.available)
            .map(|worker| {
                let slot_state = match worker.assignment {
                    Some(assignment) => SlotState::Reserved(assignment.task()),
                    None if self.timetable.is_on_shift(worker.id, at) => SlotState::Free,
                    None => SlotState::Absent,
                };
                Slot {
                    worker: worker.clone(),
                    state: slot_state,
                    free_at: at,
                }
            })
            .collect();
        debug!(
            zone = %self.zone,
            workers = state.slots.len(),
            on_shift = state.slots.iter().filter(|s| s.state == SlotState::Free).count(),
            "Worker pool initialized"
        );
    }

    /// Acquires between `request.min` and `request.desired` workers.
    ///
    /// The grant's `ready_at` is the earliest instant at which `min` of the
    /// claimable workers are free and on shift together, counting later
    /// shift arrivals. While workers held by other tasks could make that
    /// earlier, the call waits for their release. Fails with
    /// [`ZoneError::InsufficientWorkers`] when nothing before the end of the
    /// day can staff the task.
    pub async fn acquire(
        &self,
        request: &AcquireRequest,
        clock: &ZoneClock,
    ) -> Result<Grant, ZoneError> {
        loop {
            let mut notified = std::pin::pin!(self.released.notified());
            notified.as_mut().enable();

            match self.try_acquire(request, clock.now())? {
                Attempt::Granted(grant) => {
                    clock.advance_to(grant.ready_at);
                    return Ok(grant);
                }
                Attempt::Wait => notified.await,
            }
        }
    }

    fn try_acquire(
        &self,
        request: &AcquireRequest,
        now: NaiveDateTime,
    ) -> Result<Attempt, ZoneError> {
        let mut guard = self.lock();
        let PoolState { slots, rng } = &mut *guard;
        let min = request.min.max(1);
        let desired = request.desired.max(min);

        // Lazy admission of workers whose shift has started.
        for slot in slots.iter_mut() {
            if slot.state == SlotState::Absent && self.timetable.is_on_shift(slot.worker.id, now) {
                slot.state = SlotState::Free;
                slot.free_at = slot.free_at.max(now);
                debug!(zone = %self.zone, worker = %slot.worker.id, %now, "Worker arrived");
            }
        }

        let licensed = |slot: &Slot| slot.worker.qualifies_for(&request.licenses);
        let claimable = |slot: &Slot| match slot.state {
            SlotState::Reserved(task) => task == request.task,
            SlotState::Free | SlotState::Absent => true,
            SlotState::Busy(_) => false,
        };

        let candidates: Vec<usize> = (0..slots.len())
            .filter(|&index| licensed(&slots[index]) && claimable(&slots[index]))
            .collect();
        // Only running crews are sure to come back; another task's
        // reservation may be waiting itself.
        let held_elsewhere = slots
            .iter()
            .any(|slot| licensed(slot) && matches!(slot.state, SlotState::Busy(_)));

        let ready = |slot: &Slot, at: NaiveDateTime| {
            slot.free_at <= at
                && (slot.state == SlotState::Reserved(request.task)
                    || self.timetable.is_on_shift(slot.worker.id, at))
        };

        // Presence only grows at a release or an arrival.
        let ids: Vec<WorkerId> = candidates.iter().map(|&index| slots[index].worker.id).collect();
        let mut instants: BTreeSet<NaiveDateTime> = candidates
            .iter()
            .map(|&index| slots[index].free_at)
            .filter(|at| *at > now && *at <= self.day_end)
            .collect();
        instants.insert(now);
        instants.extend(self.timetable.arrivals_between(&ids, now, self.day_end));

        let mut best = 0;
        let mut start = None;
        for at in instants {
            let count = candidates.iter().filter(|&&index| ready(&slots[index], at)).count();
            if count >= min {
                start = Some(at);
                break;
            }
            best = best.max(count);
        }

        let start = match start {
            // A busy crew may come back before `at`; decide once it has.
            Some(at) if at > now && held_elsewhere => return Ok(Attempt::Wait),
            Some(at) => at,
            None if held_elsewhere => return Ok(Attempt::Wait),
            None => {
                return Err(ZoneError::InsufficientWorkers {
                    zone: self.zone,
                    task: request.task,
                    required: min,
                    available: best,
                })
            }
        };

        let mut reserved = Vec::new();
        let mut others = Vec::new();
        for index in candidates {
            if !ready(&slots[index], start) {
                continue;
            }
            if slots[index].state == SlotState::Reserved(request.task) {
                reserved.push(index);
            } else {
                others.push(index);
            }
        }
        others.shuffle(rng);
        others.sort_by_key(|index| slots[*index].free_at);

        let mut workers = Vec::with_capacity(desired);
        for index in reserved.into_iter().chain(others).take(desired) {
            let slot = &mut slots[index];
            slot.state = SlotState::Busy(request.task);
            workers.push(slot.worker.clone());
        }
        if start > now {
            debug!(
                zone = %self.zone,
                task = %request.task,
                %start,
                "Crew ready at a later instant"
            );
        }
        Ok(Attempt::Granted(Grant {
            workers,
            ready_at: start,
        }))
    }

    /// Returns one worker, free again from `free_at`.
    pub fn release(&self, worker: WorkerId, free_at: NaiveDateTime) {
        self.release_all(&[worker], free_at);
    }

    /// Returns a crew, free again from `free_at`, and wakes waiters.
    pub fn release_all(&self, workers: &[WorkerId], free_at: NaiveDateTime) {
        {
            let mut state = self.lock();
            for slot in state.slots.iter_mut() {
                if workers.contains(&slot.worker.id) {
                    slot.state = SlotState::Free;
                    slot.free_at = slot.free_at.max(free_at);
                }
            }
        }
        self.released.notify_waiters();
    }
}
