//! Load balancer: maps buildable work onto idle executors.

use crucible_core::task::Task;
use crucible_pool::{ComputerView, SlotId};

/// Strategy for picking the executor a buildable item runs on.
///
/// Invoked by the maintenance sweep for each buildable item in queue
/// order; returning `None` leaves the item buildable with a cause of
/// blockage explaining why.
pub trait LoadBalancer: Send + Sync {
    fn choose(&self, task: &Task, computers: &[ComputerView]) -> Option<SlotId>;
}

/// The default strategy: first online, accepting computer that satisfies
/// the label and has a free slot, in stable node order, skipping
/// computers already running a conflicting build of the same task.
#[derive(Debug, Default)]
pub struct Consistent;

impl LoadBalancer for Consistent {
    fn choose(&self, task: &Task, computers: &[ComputerView]) -> Option<SlotId> {
        for view in computers {
            if !view.online || !view.accepting {
                continue;
            }
            if !view.node.satisfies(task.assigned_label.as_ref()) {
                continue;
            }
            // A computer already executing this task conflicts unless the
            // task permits concurrent builds or the running occupant is
            // non-blocking.
            if !task.concurrent_build
                && view
                    .occupants
                    .iter()
                    .any(|o| o.task_id == task.id && !o.non_blocking)
            {
                continue;
            }
            if let Some(&number) = view.idle_slots.first() {
                return Some(SlotId {
                    node: view.node.id,
                    number,
                });
            }
        }
        None
    }
}
