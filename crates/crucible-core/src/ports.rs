//! Port traits (hexagonal architecture).
//!
//! These traits define the seams between the scheduling engine and the
//! excluded collaborators: security enforcement lives elsewhere, the
//! engine only calls the checkpoint.

use crate::task::Task;

/// The actor on whose behalf a boundary-checked operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub name: String,
}

impl Actor {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The engine's own maintenance identity, exempt from checks.
    pub fn system() -> Self {
        Self {
            name: "SYSTEM".to_string(),
        }
    }
}

/// Security checkpoint consulted before honoring a cancel request.
///
/// Authentication and policy live outside the engine; implementations
/// receive the task's ownership chain and decide.
pub trait PermissionChecker: Send + Sync {
    fn can_cancel(&self, actor: &Actor, task: &Task) -> bool;
}

/// Default checker for embedders that enforce permissions upstream.
#[derive(Debug, Default)]
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn can_cancel(&self, _actor: &Actor, _task: &Task) -> bool {
        true
    }
}
