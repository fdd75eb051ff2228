//! Tasks: the schedulable unit of work definition.

use crate::axes::Combination;
use crate::ids::{BuildId, ProjectId, TaskId};
use crate::interrupt::Interrupt;
use crate::label::Label;
use crate::result::BuildResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The closed set of task kinds the queue knows how to schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// An ordinary project build.
    Project,
    /// The coordinator build of a multi-configuration project. Flyweight:
    /// it fans sub-builds out through the queue instead of doing real
    /// work, so it does not consume an executor slot.
    MatrixParent,
    /// One configuration of a multi-configuration project.
    MatrixConfiguration { combination: Combination },
}

/// A mutual-exclusion tag for something a task needs exclusive access to
/// while running (a workspace, label-scoped capacity, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(String);

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The set of resources a task holds while running. Overlap between two
/// lists blocks the later one; there is no read/write distinction and no
/// priority inheritance, only queue order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ResourceList(BTreeSet<Resource>);

impl ResourceList {
    pub fn new(resources: impl IntoIterator<Item = Resource>) -> Self {
        Self(resources.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.0.iter()
    }

    pub fn is_colliding_with(&self, other: &ResourceList) -> bool {
        self.0.intersection(&other.0).next().is_some()
    }

    /// The first resource shared with `other`, for blockage messages.
    pub fn colliding_resource<'a>(&'a self, other: &'a ResourceList) -> Option<&'a Resource> {
        self.0.intersection(&other.0).next()
    }
}

/// Everything an executable gets handed when an executor starts it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub build_id: BuildId,
    pub build_number: u32,
    /// Set for matrix configuration builds.
    pub combination: Option<Combination>,
    pub interrupt: Interrupt,
}

/// The `createExecutable` capability: produces the live behavior of a
/// task once the queue has matched it to an execution slot.
///
/// Implementations must observe `ctx.interrupt` at their checkpoints and
/// return [`BuildResult::Aborted`] when interrupted; panics are caught at
/// the executor and reported as failures, never propagated to the queue.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, ctx: ExecutionContext) -> BuildResult;
}

/// A schedulable unit of work: what to run, under what constraints.
///
/// This is definition data only; the live, running instantiation is
/// produced by the [`TaskRunner`] once the task is matched to an executor.
#[derive(Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub display_name: String,
    /// `None` means the task may run on any node.
    pub assigned_label: Option<Label>,
    /// `None` means unknown; feeds the stuck-item diagnostic.
    pub estimated_duration: Option<Duration>,
    /// Whether two builds of this task may execute at the same time.
    pub concurrent_build: bool,
    /// A non-blocking task does not block other tasks with the same node
    /// affinity while it runs.
    pub non_blocking: bool,
    /// A disabled task refuses scheduling outright (no queue item, no
    /// future) rather than erroring.
    pub enabled: bool,
    pub resources: ResourceList,
    /// Ownership chain for permission checks at the security boundary.
    pub owner: ProjectId,
    pub runner: Arc<dyn TaskRunner>,
}

impl Task {
    /// Flyweight tasks coordinate other work and do not require a
    /// physical executor slot.
    pub fn is_flyweight(&self) -> bool {
        matches!(self.kind, TaskKind::MatrixParent)
    }

    pub fn combination(&self) -> Option<&Combination> {
        match &self.kind {
            TaskKind::MatrixConfiguration { combination } => Some(combination),
            _ => None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("display_name", &self.display_name)
            .field("assigned_label", &self.assigned_label)
            .field("concurrent_build", &self.concurrent_build)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_collision() {
        let a = ResourceList::new([Resource::new("workspace/app"), Resource::new("db")]);
        let b = ResourceList::new([Resource::new("db")]);
        let c = ResourceList::new([Resource::new("workspace/web")]);
        assert!(a.is_colliding_with(&b));
        assert!(!a.is_colliding_with(&c));
        assert_eq!(a.colliding_resource(&b).unwrap().as_str(), "db");
    }
}
