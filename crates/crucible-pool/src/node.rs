//! Node configuration data.

use crucible_core::ids::NodeId;
use crucible_core::label::Label;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Configuration of one execution node, as materialized by the embedder.
///
/// The live runtime state (executor slots, online flag, load statistics)
/// lives on the corresponding `Computer`; this struct is just the
/// definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub labels: HashSet<Label>,
    pub num_executors: usize,
}

impl Node {
    pub fn new(name: impl Into<String>, num_executors: usize) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            labels: HashSet::new(),
            num_executors,
        }
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// A node satisfies a label if it is the node's own name or one of
    /// its configured labels. `None` (no constraint) matches everything.
    pub fn satisfies(&self, label: Option<&Label>) -> bool {
        match label {
            None => true,
            Some(l) => l.as_str() == self.name || self.labels.contains(l),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_satisfaction() {
        let node = Node::new("linux-1", 2).with_labels([Label::new("linux"), Label::new("docker")]);
        assert!(node.satisfies(None));
        assert!(node.satisfies(Some(&Label::new("linux"))));
        assert!(node.satisfies(Some(&Label::new("linux-1"))));
        assert!(!node.satisfies(Some(&Label::new("windows"))));
    }
}
