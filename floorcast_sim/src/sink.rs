//! Write-back seam to the persistence layer.
//!
//! The day simulation reports task starts, task completions and periodic
//! per-zone progress through [`ProgressSink`]. Storage lives elsewhere;
//! failures are handed back to the caller unchanged.

use chrono::NaiveDateTime;
use floorcast_env::{TaskId, WorkerId, ZoneId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Failure reported by a sink implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("progress store unavailable: {0}")]
    Unavailable(String),

    #[error("progress store rejected write: {0}")]
    Rejected(String),
}

/// Which kind of task an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Active,
    Pick,
}

/// A task start or completion, with the fields the store needs to update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEvent {
    pub task: TaskId,
    pub kind: TaskKind,
    pub zone: ZoneId,
    pub workers: Vec<WorkerId>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Per-zone counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ZoneProgress {
    pub completed_tasks: usize,
    pub outstanding_tasks: usize,
    /// Sum of pack counts of completed picks
    pub items_picked: u64,
}

/// Receives the day simulation's write-backs.
pub trait ProgressSink: Send + Sync + 'static {
    fn task_started(&self, event: &TaskEvent) -> Result<(), SinkError>;

    fn task_finished(&self, event: &TaskEvent) -> Result<(), SinkError>;

    fn record_progress(
        &self,
        at: NaiveDateTime,
        zones: &BTreeMap<ZoneId, ZoneProgress>,
    ) -> Result<(), SinkError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn task_started(&self, _: &TaskEvent) -> Result<(), SinkError> {
        Ok(())
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

/// Keeps everything in memory; used by the CLI summary and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    started: Mutex<Vec<TaskEvent>>,
    finished: Mutex<Vec<TaskEvent>>,
    snapshots: Mutex<Vec<(NaiveDateTime, BTreeMap<ZoneId, ZoneProgress>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<TaskEvent> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn finished(&self) -> Vec<TaskEvent> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn snapshots(&self) -> Vec<(NaiveDateTime, BTreeMap<ZoneId, ZoneProgress>)> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ProgressSink for MemorySink {
    fn task_started(&self, event: &TaskEvent) -> Result<(), SinkError> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn task_finished(&self, event: &TaskEvent) -> Result<(), SinkError> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn record_progress(
        &self,
        at: NaiveDateTime,
        zones: &BTreeMap<ZoneId, ZoneProgress>,
    ) -> Result<(), SinkError> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((at, zones.clone()));
        Ok(())
    }
}
