//! Multi-configuration (matrix) projects for Crucible.
//!
//! A matrix project spans a cartesian product of axes. Its parent build
//! is a flyweight coordinator that fans one sub-build per active
//! configuration out through the ordinary queue, optionally gated
//! behind a touchstone subset, and combines the results worst-wins.

pub mod aggregator;
pub mod execution;
pub mod filter;
pub mod project;

pub use aggregator::{MatrixAggregator, SubBuildReport};
pub use execution::{ConfigurationScheduler, MatrixExecution, SubBuild};
pub use filter::CombinationFilter;
pub use project::{ConfigurationRecord, ConfigurationSet, MatrixPartition, MatrixProject};
