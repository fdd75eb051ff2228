//! Queue items and their completion futures.

use crate::blockage::CauseOfBlockage;
use chrono::{DateTime, Utc};
use crucible_core::actions::Action;
use crucible_core::ids::{BuildId, ItemId, TaskId};
use crucible_core::interrupt::Interrupt;
use crucible_core::result::BuildResult;
use crucible_core::task::Task;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// The terminal outcome a completion handle resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub build_id: BuildId,
    pub build_number: u32,
    pub result: BuildResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Completed(BuildOutcome),
    Cancelled,
}

impl CompletionState {
    pub fn result(&self) -> BuildResult {
        match self {
            CompletionState::Completed(outcome) => outcome.result,
            CompletionState::Cancelled => BuildResult::Aborted,
        }
    }
}

/// Cloneable future handle for a scheduled item.
///
/// Resolves when the item's build reaches a terminal state or the item
/// is cancelled; every clone observes the same resolution. Duplicate
/// submissions collapsed into an existing waiting item share its handle.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<Option<CompletionState>>,
}

impl CompletionHandle {
    /// Wrap the subscribe side of a completion channel. Coordinators
    /// that track completion outside the queue build their own channel.
    pub fn new(rx: watch::Receiver<Option<CompletionState>>) -> Self {
        Self { rx }
    }

    /// Wait for the terminal state. A queue that goes away without
    /// resolving the item counts as cancellation.
    pub async fn wait(mut self) -> CompletionState {
        loop {
            if let Some(state) = *self.rx.borrow_and_update() {
                return state;
            }
            if self.rx.changed().await.is_err() {
                return CompletionState::Cancelled;
            }
        }
    }

    /// Non-blocking peek at the terminal state.
    pub fn peek(&self) -> Option<CompletionState> {
        *self.rx.borrow()
    }
}

/// Outcome of a schedule call.
///
/// `Refused` carries no handle: a task whose definition forbids queuing
/// (disabled) yields no new item and no future, not an error.
#[derive(Debug)]
pub enum ScheduleResult {
    /// A fresh item entered the queue.
    Created { item: ItemId, handle: CompletionHandle },
    /// An equivalent item was already waiting; its quiet period was
    /// extended and its handle returned.
    Existing { item: ItemId, handle: CompletionHandle },
    Refused,
}

impl ScheduleResult {
    pub fn handle(self) -> Option<CompletionHandle> {
        match self {
            ScheduleResult::Created { handle, .. } | ScheduleResult::Existing { handle, .. } => {
                Some(handle)
            }
            ScheduleResult::Refused => None,
        }
    }

    pub fn item(&self) -> Option<ItemId> {
        match self {
            ScheduleResult::Created { item, .. } | ScheduleResult::Existing { item, .. } => {
                Some(*item)
            }
            ScheduleResult::Refused => None,
        }
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, ScheduleResult::Refused)
    }
}

/// Which stage collection an item currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Waiting,
    Blocked,
    Buildable,
    Pending,
}

/// Execution bookkeeping attached when an item goes pending.
#[derive(Debug, Clone)]
pub(crate) struct Execution {
    pub build_id: BuildId,
    pub build_number: u32,
    pub interrupt: Interrupt,
}

/// A task's live instance inside the queue.
///
/// Identity (`id`), actions, and the completion sender survive every
/// stage transition; the stage itself is encoded by which collection
/// holds the item, never duplicated.
pub(crate) struct Item {
    pub id: ItemId,
    pub task: Task,
    pub actions: Vec<Action>,
    pub queued_at: DateTime<Utc>,
    /// End of the quiet period.
    pub eligible_at: Instant,
    /// Set when the item (re-)enters the buildable stage.
    pub buildable_since: Option<Instant>,
    pub why: Option<CauseOfBlockage>,
    pub completion: watch::Sender<Option<CompletionState>>,
    pub execution: Option<Execution>,
}

impl Item {
    pub fn handle(&self) -> CompletionHandle {
        CompletionHandle::new(self.completion.subscribe())
    }

    pub fn resolve(&self, state: CompletionState) {
        self.completion.send_replace(Some(state));
    }
}

/// Read-only view of one item for status surfaces; the engine exposes
/// these, it does not format them.
#[derive(Debug, Clone, Serialize)]
pub struct ItemSnapshot {
    pub id: ItemId,
    pub task_id: TaskId,
    pub task_name: String,
    pub state: ItemState,
    pub why: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub stuck: bool,
    pub build_id: Option<BuildId>,
    pub build_number: Option<u32>,
}
