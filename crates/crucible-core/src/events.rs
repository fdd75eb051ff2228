//! Engine events published on the broadcast bus.

use crate::ids::{BuildId, ItemId, NodeId, ProjectId, TaskId};
use crate::result::BuildResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events emitted by the scheduling engine.
///
/// Consumers subscribe through the engine's broadcast bus; a lagging
/// subscriber may miss events but never blocks the emitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Queue item lifecycle
    ItemEnqueued(ItemEventPayload),
    ItemBlocked(ItemEventPayload),
    ItemBuildable(ItemEventPayload),
    ItemCancelled(ItemEventPayload),
    /// The item left the queue for execution.
    ItemLeft(ItemEventPayload),

    // Build lifecycle
    BuildStarted(BuildEventPayload),
    BuildCompleted(BuildCompletedPayload),

    // Node lifecycle
    NodeOnline(NodeEventPayload),
    NodeOffline(NodeEventPayload),

    // Matrix
    MatrixFanOut(MatrixFanOutPayload),
    MatrixAggregated(MatrixAggregatedPayload),
}

impl Event {
    /// A stable subject string for log filtering and routing.
    pub fn subject(&self) -> String {
        match self {
            Event::ItemEnqueued(p) => format!("queue.item.{}.enqueued", p.item_id),
            Event::ItemBlocked(p) => format!("queue.item.{}.blocked", p.item_id),
            Event::ItemBuildable(p) => format!("queue.item.{}.buildable", p.item_id),
            Event::ItemCancelled(p) => format!("queue.item.{}.cancelled", p.item_id),
            Event::ItemLeft(p) => format!("queue.item.{}.left", p.item_id),
            Event::BuildStarted(p) => format!("build.{}.started", p.build_id),
            Event::BuildCompleted(p) => format!("build.{}.completed", p.build_id),
            Event::NodeOnline(p) => format!("node.{}.online", p.node_id),
            Event::NodeOffline(p) => format!("node.{}.offline", p.node_id),
            Event::MatrixFanOut(p) => format!("matrix.{}.fanout", p.project),
            Event::MatrixAggregated(p) => format!("matrix.{}.aggregated", p.project),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEventPayload {
    pub item_id: ItemId,
    pub task_id: TaskId,
    pub task_name: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEventPayload {
    pub build_id: BuildId,
    pub task_id: TaskId,
    pub build_number: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletedPayload {
    pub build_id: BuildId,
    pub task_id: TaskId,
    pub build_number: u32,
    pub result: BuildResult,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEventPayload {
    pub node_id: NodeId,
    pub node_name: String,
    pub cause: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixFanOutPayload {
    pub project: ProjectId,
    pub build_number: u32,
    pub active_configurations: usize,
    pub touchstone_configurations: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixAggregatedPayload {
    pub project: ProjectId,
    pub build_number: u32,
    pub result: BuildResult,
    pub at: DateTime<Utc>,
}
