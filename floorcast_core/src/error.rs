//! Failure taxonomy for zone trials and the warehouse model.

use chrono::NaiveDate;
use floorcast_env::{TaskId, WorkerId, ZoneId};
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Why a single zone-trial produced no result.
///
/// These are values, not aborts: one zone failing never cancels its sibling
/// zones or the other trials. The numeric [`code`](ZoneError::code) is the
/// stable representation handed across the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZoneError {
    /// The zone did not finish within its wall-clock ceiling
    #[error("zone {zone} did not finish within {ceiling_secs}s")]
    Timeout { zone: ZoneId, ceiling_secs: u64 },

    /// Nothing scheduled in the zone for the simulated window
    #[error("zone {zone} has no tasks")]
    NoTasks { zone: ZoneId },

    /// Empty roster or nobody marked available
    #[error("zone {zone} has no available workers")]
    NoWorkers { zone: ZoneId },

    /// Workers exist but none of them has a shift that day
    #[error("zone {zone} has no worker on shift on {date}")]
    NoShifts { zone: ZoneId, date: NaiveDate },

    /// A task's minimum crew can never be reached before the day ends
    #[error("task {task} in zone {zone} needs {required} workers, at most {available} ever qualify")]
    InsufficientWorkers {
        zone: ZoneId,
        task: TaskId,
        required: usize,
        available: usize,
    },
}

impl ZoneError {
    /// Numeric error code (100-104).
    pub fn code(&self) -> u16 {
        match self {
            ZoneError::Timeout { .. } => 100,
            ZoneError::NoTasks { .. } => 101,
            ZoneError::NoWorkers { .. } => 102,
            ZoneError::NoShifts { .. } => 103,
            ZoneError::InsufficientWorkers { .. } => 104,
        }
    }

    /// Zone the failure belongs to.
    pub fn zone(&self) -> ZoneId {
        match self {
            ZoneError::Timeout { zone, .. }
            | ZoneError::NoTasks { zone }
            | ZoneError::NoWorkers { zone }
            | ZoneError::NoShifts { zone, .. }
            | ZoneError::InsufficientWorkers { zone, .. } => *zone,
        }
    }

    /// Bare code string used on the control surface.
    pub fn wire(&self) -> String {
        self.code().to_string()
    }
}

impl Serialize for ZoneError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ZoneError", 3)?;
        state.serialize_field("code", &self.code())?;
        state.serialize_field("zone", &self.zone())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Problems with the warehouse input itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("failed to parse warehouse: {0}")]
    Parse(String),

    #[error("unknown zone {0}")]
    UnknownZone(ZoneId),

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {worker} has non-positive efficiency {efficiency}")]
    InvalidEfficiency { worker: WorkerId, efficiency: f64 },

    #[error("task {task} does not match the kind of zone {zone}")]
    WrongTaskKind { zone: ZoneId, task: TaskId },

    #[error("shift of worker {worker} ends before it starts")]
    InvalidShift { worker: WorkerId },
}
