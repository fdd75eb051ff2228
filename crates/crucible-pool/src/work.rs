//! Work units: the pairing of queued work with an execution slot.

use crucible_core::actions::Action;
use crucible_core::ids::{BuildId, ItemId, NodeId, TaskId};
use crucible_core::interrupt::Interrupt;
use crucible_core::result::BuildResult;
use crucible_core::task::Task;

/// Addresses one executor slot on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub node: NodeId,
    pub number: usize,
}

/// A queue item that has been matched to an execution slot.
///
/// Exists only while the work is pending/running; the executor consumes
/// it, runs the task's executable, and emits a [`CompletionReport`].
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub item_id: ItemId,
    pub task: Task,
    pub actions: Vec<Action>,
    pub build_id: BuildId,
    pub build_number: u32,
    pub interrupt: Interrupt,
}

/// Emitted by an executor (or a flyweight coordinator task) when its
/// work reaches a terminal state.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub item_id: ItemId,
    pub task_id: TaskId,
    pub task_name: String,
    pub build_id: BuildId,
    pub build_number: u32,
    pub result: BuildResult,
    /// `None` for flyweight work, which consumed no slot.
    pub slot: Option<SlotId>,
}
