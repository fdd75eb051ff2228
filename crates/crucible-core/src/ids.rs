//! Strongly-typed identifiers for domain entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(ProjectId, "prj");
define_id!(BuildId, "bld");
define_id!(NodeId, "nod");

/// Identity of an item inside the queue.
///
/// Unlike the uuid-backed ids above, item ids are a monotonically
/// increasing integer assigned by the queue: the id is unique per engine
/// and stable across the item's stage transitions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a schedulable task.
///
/// Two queue submissions are "the same task" when their `TaskId`s are
/// equal: the owning project plus, for matrix configuration builds, the
/// canonical combination string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub project: ProjectId,
    pub configuration: Option<String>,
}

impl TaskId {
    pub fn project(project: ProjectId) -> Self {
        Self {
            project,
            configuration: None,
        }
    }

    pub fn configuration(project: ProjectId, combination: impl Into<String>) -> Self {
        Self {
            project,
            configuration: Some(combination.into()),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.configuration {
            Some(c) => write!(f, "{}/{}", self.project, c),
            None => write!(f, "{}", self.project),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_display() {
        let id = ProjectId::new();
        let s = id.to_string();
        assert!(s.starts_with("prj_"));
    }

    #[test]
    fn test_project_id_parse() {
        let id = ProjectId::new();
        let s = id.to_string();
        let parsed: ProjectId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_item_id_ordering() {
        assert!(ItemId(1) < ItemId(2));
    }
}
