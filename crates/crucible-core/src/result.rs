//! Build results and the worst-result-wins combine operator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome of a build, ordered by severity.
///
/// `NotBuilt` sits below `Success` so it can seed aggregation loops;
/// anything real combined with it wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    #[default]
    NotBuilt,
    Success,
    Unstable,
    Failure,
    Aborted,
}

impl BuildResult {
    /// Combine two results, keeping the more severe one.
    ///
    /// Monotone and commutative: combine(SUCCESS, UNSTABLE) = UNSTABLE,
    /// combine(UNSTABLE, FAILURE) = FAILURE, combine(FAILURE, ABORTED) =
    /// ABORTED.
    pub fn combine(self, other: BuildResult) -> BuildResult {
        self.max(other)
    }

    pub fn is_worse_than(self, other: BuildResult) -> bool {
        self > other
    }

    pub fn is_better_or_equal_to(self, other: BuildResult) -> bool {
        self <= other
    }

    /// Whether a completed build with this result counts as succeeded
    /// for downstream-trigger thresholds.
    pub fn is_success(self) -> bool {
        self == BuildResult::Success
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildResult::NotBuilt => "NOT_BUILT",
            BuildResult::Success => "SUCCESS",
            BuildResult::Unstable => "UNSTABLE",
            BuildResult::Failure => "FAILURE",
            BuildResult::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_is_severity_monotonic() {
        assert_eq!(
            BuildResult::Success.combine(BuildResult::Unstable),
            BuildResult::Unstable
        );
        assert_eq!(
            BuildResult::Unstable.combine(BuildResult::Failure),
            BuildResult::Failure
        );
        assert_eq!(
            BuildResult::Failure.combine(BuildResult::Aborted),
            BuildResult::Aborted
        );
    }

    #[test]
    fn test_combine_is_commutative() {
        for a in [
            BuildResult::NotBuilt,
            BuildResult::Success,
            BuildResult::Unstable,
            BuildResult::Failure,
            BuildResult::Aborted,
        ] {
            for b in [
                BuildResult::Success,
                BuildResult::Failure,
                BuildResult::Aborted,
            ] {
                assert_eq!(a.combine(b), b.combine(a));
            }
        }
    }

    #[test]
    fn test_not_built_seeds_aggregation() {
        assert_eq!(
            BuildResult::NotBuilt.combine(BuildResult::Success),
            BuildResult::Success
        );
    }
}
