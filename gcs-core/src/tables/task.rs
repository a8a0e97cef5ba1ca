//! Task table
//!
//! Tracks each task's scheduling state and owning scheduler. Ownership
//! changes race between schedulers, so they go through `test_and_update`
//! rather than `add`.
//!
//! ```text
//! WAITING -> SCHEDULED -> QUEUED -> RUNNING -> DONE
//!            SCHEDULED | QUEUED | RUNNING    -> LOST
//!            any state                        -> RECONSTRUCTING
//! ```

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{decode, encode, entry_key, write_publication, Table, TableEntry, TableKind};
use crate::dispatch::Completion;
use crate::error::Result;
use crate::id::{ClientId, JobId, TaskId};
use crate::metrics::standard;

/// Scheduling state of a task. Discriminants are single bits so states
/// can be combined into a `SchedulingStateMask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulingState {
    Waiting = 1,
    Scheduled = 2,
    Queued = 4,
    Running = 8,
    Done = 16,
    Lost = 32,
    Reconstructing = 64,
}

impl SchedulingState {
    pub const ALL: [SchedulingState; 7] = [
        SchedulingState::Waiting,
        SchedulingState::Scheduled,
        SchedulingState::Queued,
        SchedulingState::Running,
        SchedulingState::Done,
        SchedulingState::Lost,
        SchedulingState::Reconstructing,
    ];

    pub fn bit(self) -> u32 {
        self as u32
    }

    /// DONE and LOST end the normal lifecycle; only reconstruction restarts it
    pub fn is_terminal(self) -> bool {
        matches!(self, SchedulingState::Done | SchedulingState::Lost)
    }
}

impl fmt::Display for SchedulingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulingState::Waiting => "WAITING",
            SchedulingState::Scheduled => "SCHEDULED",
            SchedulingState::Queued => "QUEUED",
            SchedulingState::Running => "RUNNING",
            SchedulingState::Done => "DONE",
            SchedulingState::Lost => "LOST",
            SchedulingState::Reconstructing => "RECONSTRUCTING",
        };
        f.write_str(name)
    }
}

/// Set of acceptable current states for a conditional update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchedulingStateMask(u32);

impl SchedulingStateMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        SchedulingState::ALL.into_iter().fold(Self::empty(), |mask, s| mask | s)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, state: SchedulingState) -> bool {
        self.0 & state.bit() != 0
    }
}

impl From<SchedulingState> for SchedulingStateMask {
    fn from(state: SchedulingState) -> Self {
        Self(state.bit())
    }
}

impl BitOr<SchedulingState> for SchedulingStateMask {
    type Output = SchedulingStateMask;

    fn bitor(self, rhs: SchedulingState) -> Self::Output {
        Self(self.0 | rhs.bit())
    }
}

impl BitOr for SchedulingState {
    type Output = SchedulingStateMask;

    fn bitor(self, rhs: SchedulingState) -> Self::Output {
        SchedulingStateMask::from(self) | rhs
    }
}

/// Stored record of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTableData {
    pub scheduling_state: SchedulingState,
    /// Scheduler that currently owns the task
    pub scheduler_id: ClientId,
}

impl TableEntry for TaskTableData {
    type Id = TaskId;
    const KIND: TableKind = TableKind::Task;
}

/// Condition and new state for `test_and_update`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTableTestAndUpdate {
    /// Expected owner. Nil matches any owner.
    pub test_scheduler_id: ClientId,
    /// States the task may currently be in
    pub test_state_bitmask: SchedulingStateMask,
    /// State written when the test matches
    pub update_state: SchedulingState,
}

impl TaskTableTestAndUpdate {
    pub fn matches(&self, current: &TaskTableData) -> bool {
        let owner_matches =
            self.test_scheduler_id.is_nil() || self.test_scheduler_id == current.scheduler_id;
        owner_matches && self.test_state_bitmask.contains(current.scheduling_state)
    }
}

/// Outcome of a conditional update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAndUpdateResult {
    /// The stored entry afterwards: updated if the test matched, otherwise
    /// unchanged. `None` if the task has no entry.
    pub entry: Option<TaskTableData>,
    /// Whether the test matched and the update was written
    pub updated: bool,
}

pub type TaskTable = Table<TaskTableData>;

impl Table<TaskTableData> {
    /// Atomically test the stored entry against `update` and, if it
    /// matches, write the new state and publish it.
    ///
    /// A mismatch is not an error: it resolves with `updated = false`.
    /// When another writer changes the entry between the read and the
    /// write, the test is evaluated again against the newer value.
    pub fn test_and_update(
        &self,
        job_id: JobId,
        id: TaskId,
        update: TaskTableTestAndUpdate,
    ) -> Result<Completion<TestAndUpdateResult>> {
        let key = entry_key(TableKind::Task, id.into());

        self.connection.issue("TEST_AND_UPDATE", move |backend| async move {
            loop {
                let Some(stored) = backend.get(&key).await? else {
                    standard::TEST_AND_UPDATE_MISMATCHED.inc();
                    debug!("Test-and-update on missing task {}", id);
                    return Ok(TestAndUpdateResult { entry: None, updated: false });
                };
                let mut entry: TaskTableData = decode::<TaskTableData, _>(&stored)?;

                if !update.matches(&entry) {
                    standard::TEST_AND_UPDATE_MISMATCHED.inc();
                    debug!(
                        "Test-and-update on task {} did not match (state={}, owner={})",
                        id, entry.scheduling_state, entry.scheduler_id
                    );
                    return Ok(TestAndUpdateResult { entry: Some(entry), updated: false });
                }

                let previous = entry.scheduling_state;
                entry.scheduling_state = update.update_state;
                let payload = encode::<TaskTableData>(&entry)?;
                let publication = write_publication(backend.as_ref(), job_id, id, &entry, false).await?;
                if backend
                    .compare_and_swap_and_publish(&key, Some(stored), payload, &publication)
                    .await?
                {
                    standard::TEST_AND_UPDATE_MATCHED.inc();
                    info!("Task {} moved {} -> {}", id, previous, entry.scheduling_state);
                    return Ok(TestAndUpdateResult { entry: Some(entry), updated: true });
                }
                debug!("Task {} changed during test-and-update, re-testing", id);
            }
        })
    }
}
