//! The multi-configuration project model.

use crate::filter::CombinationFilter;
use crucible_core::axes::{AxisList, Combination};
use crucible_core::result::BuildResult;
use std::collections::BTreeMap;

/// Configuration of a matrix project: the axes spanning the cartesian
/// product, an optional filter pruning it, and the touchstone policy
/// gating the bulk of the matrix behind a representative subset.
#[derive(Debug, Clone)]
pub struct MatrixProject {
    pub axes: AxisList,
    pub combination_filter: Option<CombinationFilter>,
    /// Configurations matching this run first; the rest only run when
    /// the combined touchstone result meets the condition below.
    pub touchstone_filter: Option<CombinationFilter>,
    pub touchstone_result_condition: BuildResult,
    pub run_sequentially: bool,
}

impl MatrixProject {
    pub fn new(axes: AxisList) -> Self {
        Self {
            axes,
            combination_filter: None,
            touchstone_filter: None,
            touchstone_result_condition: BuildResult::Unstable,
            run_sequentially: false,
        }
    }

    /// The combinations that build: the cartesian product of the axes,
    /// pruned by the combination filter.
    pub fn active_configurations(&self) -> Vec<Combination> {
        self.axes
            .combinations()
            .into_iter()
            .filter(|c| {
                self.combination_filter
                    .as_ref()
                    .is_none_or(|f| f.eval(c))
            })
            .collect()
    }

    /// Split the active configurations into the touchstone set and the
    /// delayed remainder. Without a touchstone filter everything is
    /// delayed and the gate never fires.
    pub fn partition(&self) -> MatrixPartition {
        let mut partition = MatrixPartition::default();
        for combination in self.active_configurations() {
            match &self.touchstone_filter {
                Some(filter) if filter.eval(&combination) => {
                    partition.touchstone.push(combination)
                }
                _ => partition.delayed.push(combination),
            }
        }
        partition
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatrixPartition {
    pub touchstone: Vec<Combination>,
    pub delayed: Vec<Combination>,
}

/// One known configuration of a matrix project, active or archived.
#[derive(Debug, Clone)]
pub struct ConfigurationRecord {
    pub combination: Combination,
    pub active: bool,
}

/// Every configuration a matrix project has ever had, keyed by the
/// canonical combination string.
///
/// When axes or filters change, configurations that fall out of the
/// active set are archived in place, never deleted: their history stays
/// addressable, they just stop building. A configuration that becomes
/// valid again is reactivated under the same key.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationSet {
    records: BTreeMap<String, ConfigurationRecord>,
}

impl ConfigurationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile with the project's current axes and filters.
    pub fn reconcile(&mut self, project: &MatrixProject) {
        for record in self.records.values_mut() {
            record.active = false;
        }
        for combination in project.active_configurations() {
            self.records
                .entry(combination.to_string())
                .and_modify(|r| r.active = true)
                .or_insert(ConfigurationRecord {
                    combination,
                    active: true,
                });
        }
    }

    pub fn get(&self, combination: &Combination) -> Option<&ConfigurationRecord> {
        self.records.get(&combination.to_string())
    }

    pub fn active(&self) -> impl Iterator<Item = &ConfigurationRecord> {
        self.records.values().filter(|r| r.active)
    }

    pub fn archived(&self) -> impl Iterator<Item = &ConfigurationRecord> {
        self.records.values().filter(|r| !r.active)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
