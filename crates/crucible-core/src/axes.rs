//! Matrix axes and combinations.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One dimension of a matrix project: a name and an ordered list of
/// string values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub values: Vec<String>,
}

impl Axis {
    pub fn new(name: impl Into<String>, values: Vec<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// The ordered set of axes defining a matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct AxisList(Vec<Axis>);

impl AxisList {
    /// Axis names must be unique; rejected at construction time.
    pub fn new(axes: Vec<Axis>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for axis in &axes {
            if !seen.insert(axis.name.clone()) {
                return Err(Error::DuplicateAxis(axis.name.clone()));
            }
        }
        Ok(Self(axes))
    }

    pub fn axes(&self) -> &[Axis] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn axis(&self, name: &str) -> Option<&Axis> {
        self.0.iter().find(|a| a.name == name)
    }

    /// All combinations of the current axes, in axis-major order (the
    /// first axis varies slowest). An empty axis list yields the single
    /// empty combination.
    pub fn combinations(&self) -> Vec<Combination> {
        let mut result = vec![BTreeMap::new()];
        for axis in &self.0 {
            let mut next = Vec::with_capacity(result.len() * axis.values.len());
            for partial in result {
                for value in &axis.values {
                    let mut combo: BTreeMap<String, String> = partial.clone();
                    combo.insert(axis.name.clone(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }
        result.into_iter().map(Combination).collect()
    }
}

/// One complete assignment of values to axes, identifying a single matrix
/// configuration. Immutable; the canonical string form is ordered by axis
/// name (`arch=amd64,os=linux`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Combination(BTreeMap<String, String>);

impl Combination {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0.get(axis).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// A configuration is only valid against its parent's current axis
    /// list if it carries a value for every axis and no stale extras.
    pub fn is_complete_for(&self, axes: &AxisList) -> bool {
        self.0.len() == axes.axes().len()
            && axes
                .axes()
                .iter()
                .all(|a| self.0.get(&a.name).is_some_and(|v| a.values.contains(v)))
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn axes() -> AxisList {
        AxisList::new(vec![
            Axis::new("os", vec!["linux", "macos"]),
            Axis::new("arch", vec!["amd64", "arm64"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_cartesian_combinations() {
        let combos = axes().combinations();
        assert_eq!(combos.len(), 4);
        assert_eq!(combos[0].to_string(), "arch=amd64,os=linux");
        assert_eq!(combos[3].to_string(), "arch=arm64,os=macos");
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let result = AxisList::new(vec![
            Axis::new("os", vec!["linux"]),
            Axis::new("os", vec!["macos"]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_complete_for_detects_stale_axes() {
        let combos = axes().combinations();
        assert!(combos[0].is_complete_for(&axes()));

        let shrunk = AxisList::new(vec![Axis::new("os", vec!["linux", "macos"])]).unwrap();
        assert!(!combos[0].is_complete_for(&shrunk));
    }

    #[test]
    fn test_empty_axis_list_yields_single_combination() {
        let combos = AxisList::default().combinations();
        assert_eq!(combos.len(), 1);
        assert_eq!(combos[0].to_string(), "");
    }
}
