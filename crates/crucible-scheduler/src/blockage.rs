//! Why an item cannot run yet.

use crucible_core::label::Label;
use crucible_core::task::Resource;
use std::fmt;

/// Transient blocking is not an error: it is a human-readable reason,
/// re-evaluated on every maintenance sweep until it clears or the item
/// is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CauseOfBlockage {
    /// The item has not reached the end of its quiet period.
    InQuietPeriod,
    /// Another build of the same non-concurrent task is in progress.
    BlockedBySelf { task_name: String },
    /// A required resource is held by another in-progress activity.
    BlockedByResource {
        resource: Resource,
        holder: String,
    },
    /// The project is configured to wait while an upstream project is
    /// building or queued.
    BlockedByUpstream { project_name: String },
    /// Same, for a downstream project.
    BlockedByDownstream { project_name: String },
    /// No online node satisfies the assigned label.
    LabelOffline { label: Label },
    /// Nodes satisfying the label exist but all their executors are busy.
    LabelBusy { label: Label },
    /// No label constraint; every executor in the pool is busy.
    WaitingForExecutor,
    /// The only matching nodes are draining for removal.
    NodeDraining { node_name: String },
    /// The engine is quieting down; nothing new starts.
    ShuttingDown,
}

impl fmt::Display for CauseOfBlockage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CauseOfBlockage::InQuietPeriod => write!(f, "In the quiet period"),
            CauseOfBlockage::BlockedBySelf { task_name } => {
                write!(f, "A build of {task_name} is already in progress")
            }
            CauseOfBlockage::BlockedByResource { resource, holder } => {
                write!(f, "Resource {resource} is held by {holder}")
            }
            CauseOfBlockage::BlockedByUpstream { project_name } => {
                write!(f, "Upstream project {project_name} is already building")
            }
            CauseOfBlockage::BlockedByDownstream { project_name } => {
                write!(f, "Downstream project {project_name} is already building")
            }
            CauseOfBlockage::LabelOffline { label } => {
                write!(f, "All nodes of label {label} are offline")
            }
            CauseOfBlockage::LabelBusy { label } => {
                write!(f, "Waiting for next available executor on {label}")
            }
            CauseOfBlockage::WaitingForExecutor => {
                write!(f, "Waiting for next available executor")
            }
            CauseOfBlockage::NodeDraining { node_name } => {
                write!(f, "Node {node_name} is shutting down")
            }
            CauseOfBlockage::ShuttingDown => write!(f, "The engine is shutting down"),
        }
    }
}
