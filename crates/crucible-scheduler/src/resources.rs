//! Resource/activity mutual exclusion.

use crucible_core::ids::ItemId;
use crucible_core::task::{Resource, ResourceList};

/// One in-progress activity and the resources it holds.
#[derive(Debug, Clone)]
pub struct ResourceActivity {
    pub item_id: ItemId,
    pub task_name: String,
    pub resources: ResourceList,
}

/// Tracks which resources are held by executing items.
///
/// A plain set check: a candidate whose declared resources overlap any
/// in-progress activity is blocked until that activity stops. No
/// priority inheritance, no fairness beyond queue order. Owned by the
/// queue state and mutated only under the queue lock.
#[derive(Debug, Default)]
pub struct ResourceController {
    active: Vec<ResourceActivity>,
}

impl ResourceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an activity as started. No-op for empty resource lists.
    pub fn start(&mut self, item_id: ItemId, task_name: String, resources: ResourceList) {
        if resources.is_empty() {
            return;
        }
        self.active.push(ResourceActivity {
            item_id,
            task_name,
            resources,
        });
    }

    pub fn stop(&mut self, item_id: ItemId) {
        self.active.retain(|a| a.item_id != item_id);
    }

    /// The activity (and the first shared resource) blocking the
    /// candidate, if any.
    pub fn blocking_activity<'a>(&'a self, candidate: &'a ResourceList) -> Option<(&'a ResourceActivity, &'a Resource)> {
        if candidate.is_empty() {
            return None;
        }
        self.active.iter().find_map(|activity| {
            activity
                .resources
                .colliding_resource(candidate)
                .map(|resource| (activity, resource))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_blocks_until_stop() {
        let mut controller = ResourceController::new();
        let held = ResourceList::new([Resource::new("workspace/app")]);
        controller.start(ItemId(1), "app".into(), held.clone());

        assert!(controller.blocking_activity(&held).is_some());
        let other = ResourceList::new([Resource::new("workspace/web")]);
        assert!(controller.blocking_activity(&other).is_none());

        controller.stop(ItemId(1));
        assert!(controller.blocking_activity(&held).is_none());
    }
}
