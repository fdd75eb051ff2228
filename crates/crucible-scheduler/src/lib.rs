//! The Crucible build queue and scheduling policy.
//!
//! The queue is the central state machine: submitted tasks advance
//! through waiting, blocked, buildable, and pending stages under a
//! single coarse lock, re-evaluated by a maintenance sweep that runs
//! periodically and eagerly after every schedule/cancel/completion.

pub mod balancer;
pub mod blockage;
pub mod graph;
pub mod item;
pub mod queue;
pub mod resources;

pub use balancer::{Consistent, LoadBalancer};
pub use blockage::CauseOfBlockage;
pub use graph::{DependencyGraph, DependencyGraphBuilder, DependencyRunner};
pub use item::{BuildOutcome, CompletionHandle, CompletionState, ItemSnapshot, ItemState, ScheduleResult};
pub use queue::{DependencyWatch, Queue, QueueCounts, QueuePolicy, WatchDirection};
