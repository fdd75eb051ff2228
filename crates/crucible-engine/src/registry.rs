//! Bounded registry of completed builds.

use chrono::{DateTime, Utc};
use crucible_core::ids::{BuildId, ProjectId};
use crucible_core::result::BuildResult;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// One completed build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRecord {
    pub build_id: BuildId,
    pub project: ProjectId,
    pub task_name: String,
    pub build_number: u32,
    pub result: BuildResult,
    pub completed_at: DateTime<Utc>,
}

/// Keeps the most recent completed builds, evicting the oldest record
/// explicitly once the capacity is reached. Eviction is by insertion
/// order, not by access.
#[derive(Debug)]
pub struct BuildRegistry {
    capacity: usize,
    order: VecDeque<BuildId>,
    records: HashMap<BuildId, BuildRecord>,
}

impl BuildRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            records: HashMap::new(),
        }
    }

    pub fn insert(&mut self, record: BuildRecord) {
        if self.records.insert(record.build_id, record.clone()).is_none() {
            self.order.push_back(record.build_id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.records.remove(&evicted);
            }
        }
    }

    pub fn get(&self, build_id: BuildId) -> Option<&BuildRecord> {
        self.records.get(&build_id)
    }

    /// The most recent `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<BuildRecord> {
        self.order
            .iter()
            .rev()
            .take(n)
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }

    /// The newest record for a project, if one survives eviction.
    pub fn latest_for(&self, project: ProjectId) -> Option<&BuildRecord> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.records.get(id))
            .find(|r| r.project == project)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
