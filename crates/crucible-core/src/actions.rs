//! Actions: immutable annotations carried by queue items.

use crate::ids::ProjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Why a build was triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cause {
    /// A user asked for the build.
    User { name: String },
    /// An upstream project's build completed and triggered this one.
    Upstream {
        project: ProjectId,
        project_name: String,
        build_number: u32,
    },
    /// A periodic timer fired.
    Timer,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::User { name } => write!(f, "Started by user {name}"),
            Cause::Upstream {
                project_name,
                build_number,
                ..
            } => write!(f, "Started by upstream project {project_name} build #{build_number}"),
            Cause::Timer => write!(f, "Started by timer"),
        }
    }
}

/// An annotation attached to a queue item at scheduling time.
///
/// Actions are immutable once attached; when a duplicate submission is
/// collapsed into an already-waiting item, the two action lists are merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Cause(Cause),
    Parameters(BTreeMap<String, String>),
}

impl Action {
    pub fn user(name: impl Into<String>) -> Self {
        Action::Cause(Cause::User { name: name.into() })
    }
}

/// Merge newly submitted actions into an existing list, skipping exact
/// duplicates so a re-triggered item does not accumulate identical causes.
pub fn merge_actions(existing: &mut Vec<Action>, incoming: Vec<Action>) {
    for action in incoming {
        if !existing.contains(&action) {
            existing.push(action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_skips_duplicates() {
        let mut actions = vec![Action::user("alice")];
        merge_actions(
            &mut actions,
            vec![Action::user("alice"), Action::user("bob")],
        );
        assert_eq!(actions.len(), 2);
    }
}
