//! Aggregation hooks around a matrix build.

use crucible_core::axes::Combination;
use crucible_core::error::Result;
use crucible_core::ids::BuildId;
use crucible_core::result::BuildResult;
use async_trait::async_trait;

/// What one configuration's sub-build came to. Build identifiers are
/// absent when the sub-build was cancelled before it started.
#[derive(Debug, Clone)]
pub struct SubBuildReport {
    pub combination: Combination,
    pub build_id: Option<BuildId>,
    pub build_number: Option<u32>,
    pub result: BuildResult,
}

/// Observes a matrix parent build as its configurations complete.
///
/// `start_build` runs before any configuration is scheduled; an error
/// fails the parent without fanning out. `end_run` runs after each
/// configuration; an error is a veto that cancels the configurations
/// still queued, interrupts those executing, and fails the parent.
/// `end_build` always runs on the way out, whatever happened.
#[async_trait]
pub trait MatrixAggregator: Send + Sync {
    async fn start_build(&self) -> Result<()> {
        Ok(())
    }

    async fn end_run(&self, _report: &SubBuildReport) -> Result<()> {
        Ok(())
    }

    async fn end_build(&self) -> Result<()> {
        Ok(())
    }
}
