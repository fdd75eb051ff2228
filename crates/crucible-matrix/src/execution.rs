//! Fan-out execution of a matrix parent build.
//!
//! The parent is a flyweight: its runner never occupies an executor
//! slot. It schedules one sub-build per active configuration through
//! the ordinary queue, waits on their completion handles, and combines
//! results worst-wins.

use crate::aggregator::{MatrixAggregator, SubBuildReport};
use crate::project::{MatrixPartition, MatrixProject};
use async_trait::async_trait;
use chrono::Utc;
use crucible_core::actions::{Action, Cause};
use crucible_core::axes::Combination;
use crucible_core::error::Result;
use crucible_core::events::{Event, MatrixAggregatedPayload, MatrixFanOutPayload};
use crucible_core::ids::{ItemId, ProjectId};
use crucible_core::result::BuildResult;
use crucible_core::task::{ExecutionContext, TaskRunner};
use crucible_scheduler::{CompletionHandle, CompletionState};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A configuration build that has been handed to the queue.
#[derive(Debug)]
pub struct SubBuild {
    pub combination: Combination,
    pub item_id: ItemId,
    pub handle: CompletionHandle,
}

/// How the matrix runner reaches the queue, implemented by the engine.
#[async_trait]
pub trait ConfigurationScheduler: Send + Sync {
    /// Queue one configuration's build.
    async fn schedule(&self, combination: &Combination, actions: Vec<Action>) -> Result<SubBuild>;

    /// Cancel the sub-build's queue item, or interrupt its executor if
    /// it is already running.
    async fn abort(&self, sub: &SubBuild);
}

/// The matrix parent's runner.
pub struct MatrixExecution {
    project: ProjectId,
    project_name: String,
    matrix: MatrixProject,
    scheduler: Arc<dyn ConfigurationScheduler>,
    aggregators: Vec<Arc<dyn MatrixAggregator>>,
    events: broadcast::Sender<Event>,
}

impl MatrixExecution {
    pub fn new(
        project: ProjectId,
        project_name: impl Into<String>,
        matrix: MatrixProject,
        scheduler: Arc<dyn ConfigurationScheduler>,
        aggregators: Vec<Arc<dyn MatrixAggregator>>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            project,
            project_name: project_name.into(),
            matrix,
            scheduler,
            aggregators,
            events,
        }
    }

    async fn fan_out(&self, ctx: &ExecutionContext) -> BuildResult {
        let MatrixPartition { touchstone, delayed } = self.matrix.partition();
        self.emit(Event::MatrixFanOut(MatrixFanOutPayload {
            project: self.project,
            build_number: ctx.build_number,
            active_configurations: touchstone.len() + delayed.len(),
            touchstone_configurations: touchstone.len(),
            at: Utc::now(),
        }));

        for aggregator in &self.aggregators {
            if let Err(err) = aggregator.start_build().await {
                warn!(project = %self.project_name, %err, "aggregator refused to start the build");
                return BuildResult::Failure;
            }
        }

        let mut combined = BuildResult::NotBuilt;
        if let Err(result) = self.run_set(ctx, touchstone, &mut combined).await {
            return result;
        }
        if self.matrix.touchstone_filter.is_some()
            && combined.is_worse_than(self.matrix.touchstone_result_condition)
        {
            info!(
                project = %self.project_name,
                combined = %combined,
                condition = %self.matrix.touchstone_result_condition,
                skipped = delayed.len(),
                "touchstone below the required result; remaining configurations will not build"
            );
            return combined;
        }
        if let Err(result) = self.run_set(ctx, delayed, &mut combined).await {
            return result;
        }
        combined
    }

    /// Run one partition to completion. `Err` carries the parent result
    /// of an early exit (scheduling failure, veto, or interruption).
    async fn run_set(
        &self,
        ctx: &ExecutionContext,
        combinations: Vec<Combination>,
        combined: &mut BuildResult,
    ) -> std::result::Result<(), BuildResult> {
        if self.matrix.run_sequentially {
            for combination in combinations {
                if ctx.interrupt.is_interrupted() {
                    return Err(BuildResult::Aborted);
                }
                let sub = self.schedule_one(ctx, &combination).await?;
                self.wait_one(ctx, sub, &VecDeque::new(), combined).await?;
            }
            return Ok(());
        }

        let mut subs = VecDeque::with_capacity(combinations.len());
        for combination in &combinations {
            match self.schedule_one(ctx, combination).await {
                Ok(sub) => subs.push_back(sub),
                Err(result) => {
                    self.abort_all(subs.iter()).await;
                    return Err(result);
                }
            }
        }
        while let Some(sub) = subs.pop_front() {
            self.wait_one(ctx, sub, &subs, combined).await?;
        }
        Ok(())
    }

    async fn schedule_one(
        &self,
        ctx: &ExecutionContext,
        combination: &Combination,
    ) -> std::result::Result<SubBuild, BuildResult> {
        let actions = vec![Action::Cause(Cause::Upstream {
            project: self.project,
            project_name: self.project_name.clone(),
            build_number: ctx.build_number,
        })];
        match self.scheduler.schedule(combination, actions).await {
            Ok(sub) => {
                debug!(project = %self.project_name, configuration = %combination, "configuration queued");
                Ok(sub)
            }
            Err(err) => {
                warn!(project = %self.project_name, configuration = %combination, %err, "failed to queue configuration");
                Err(BuildResult::Failure)
            }
        }
    }

    /// Wait for one sub-build and feed the aggregators. Interruption of
    /// the parent and an aggregator veto both cancel `rest`.
    async fn wait_one(
        &self,
        ctx: &ExecutionContext,
        sub: SubBuild,
        rest: &VecDeque<SubBuild>,
        combined: &mut BuildResult,
    ) -> std::result::Result<(), BuildResult> {
        let state = tokio::select! {
            state = sub.handle.clone().wait() => state,
            _ = ctx.interrupt.interrupted() => {
                self.scheduler.abort(&sub).await;
                self.abort_all(rest.iter()).await;
                return Err(BuildResult::Aborted);
            }
        };
        let report = match state {
            CompletionState::Completed(outcome) => SubBuildReport {
                combination: sub.combination,
                build_id: Some(outcome.build_id),
                build_number: Some(outcome.build_number),
                result: outcome.result,
            },
            CompletionState::Cancelled => SubBuildReport {
                combination: sub.combination,
                build_id: None,
                build_number: None,
                result: BuildResult::Aborted,
            },
        };
        *combined = combined.combine(report.result);
        for aggregator in &self.aggregators {
            if let Err(err) = aggregator.end_run(&report).await {
                warn!(
                    project = %self.project_name,
                    configuration = %report.combination,
                    %err,
                    "aggregator vetoed the run; cancelling remaining configurations"
                );
                self.abort_all(rest.iter()).await;
                return Err(BuildResult::Failure);
            }
        }
        Ok(())
    }

    async fn abort_all(&self, subs: impl Iterator<Item = &SubBuild>) {
        for sub in subs {
            self.scheduler.abort(sub).await;
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TaskRunner for MatrixExecution {
    async fn run(&self, ctx: ExecutionContext) -> BuildResult {
        let result = self.fan_out(&ctx).await;
        for aggregator in &self.aggregators {
            if let Err(err) = aggregator.end_build().await {
                warn!(project = %self.project_name, %err, "aggregator end_build failed");
            }
        }
        self.emit(Event::MatrixAggregated(MatrixAggregatedPayload {
            project: self.project,
            build_number: ctx.build_number,
            result,
            at: Utc::now(),
        }));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CombinationFilter;
    use crucible_core::axes::{Axis, AxisList};
    use crucible_core::error::Error;
    use crucible_core::ids::BuildId;
    use crucible_core::interrupt::Interrupt;
    use crucible_scheduler::BuildOutcome;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::watch;

    /// Resolves every sub-build immediately with a canned result;
    /// records what was scheduled and what was aborted.
    #[derive(Default)]
    struct MockScheduler {
        results: HashMap<String, BuildResult>,
        hold: bool,
        scheduled: Mutex<Vec<String>>,
        aborted: Mutex<Vec<String>>,
        holders: Mutex<Vec<watch::Sender<Option<CompletionState>>>>,
        next_item: AtomicU64,
    }

    #[async_trait]
    impl ConfigurationScheduler for MockScheduler {
        async fn schedule(
            &self,
            combination: &Combination,
            _actions: Vec<Action>,
        ) -> Result<SubBuild> {
            let key = combination.to_string();
            self.scheduled.lock().unwrap().push(key.clone());
            let number = self.next_item.fetch_add(1, Ordering::Relaxed) + 1;
            let initial = if self.hold {
                None
            } else {
                let result = self.results.get(&key).copied().unwrap_or(BuildResult::Success);
                Some(CompletionState::Completed(BuildOutcome {
                    build_id: BuildId::new(),
                    build_number: number as u32,
                    result,
                }))
            };
            let (tx, rx) = watch::channel(initial);
            self.holders.lock().unwrap().push(tx);
            Ok(SubBuild {
                combination: combination.clone(),
                item_id: ItemId(number),
                handle: CompletionHandle::new(rx),
            })
        }

        async fn abort(&self, sub: &SubBuild) {
            self.aborted.lock().unwrap().push(sub.combination.to_string());
        }
    }

    struct VetoOn(String);

    #[async_trait]
    impl MatrixAggregator for VetoOn {
        async fn end_run(&self, report: &SubBuildReport) -> Result<()> {
            if report.combination.to_string() == self.0 {
                return Err(Error::Internal("veto".to_string()));
            }
            Ok(())
        }
    }

    struct RefuseStart;

    #[async_trait]
    impl MatrixAggregator for RefuseStart {
        async fn start_build(&self) -> Result<()> {
            Err(Error::Internal("not today".to_string()))
        }
    }

    fn matrix() -> MatrixProject {
        MatrixProject::new(
            AxisList::new(vec![
                Axis::new("os", vec!["linux", "macos"]),
                Axis::new("arch", vec!["amd64", "arm64"]),
            ])
            .unwrap(),
        )
    }

    fn execution(
        matrix: MatrixProject,
        scheduler: Arc<MockScheduler>,
        aggregators: Vec<Arc<dyn MatrixAggregator>>,
    ) -> MatrixExecution {
        let (events, _) = broadcast::channel(16);
        MatrixExecution::new(
            ProjectId::new(),
            "matrix-job",
            matrix,
            scheduler,
            aggregators,
            events,
        )
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            build_id: BuildId::new(),
            build_number: 7,
            combination: None,
            interrupt: Interrupt::new(),
        }
    }

    #[tokio::test]
    async fn test_worst_result_wins() {
        let scheduler = Arc::new(MockScheduler {
            results: HashMap::from([(
                "arch=arm64,os=macos".to_string(),
                BuildResult::Unstable,
            )]),
            ..Default::default()
        });
        let exec = execution(matrix(), scheduler.clone(), vec![]);
        assert_eq!(exec.run(ctx()).await, BuildResult::Unstable);
        assert_eq!(scheduler.scheduled.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_touchstone_failure_skips_delayed_set() {
        let mut m = matrix();
        m.touchstone_filter = Some(CombinationFilter::parse(r#"os == "linux""#).unwrap());
        let scheduler = Arc::new(MockScheduler {
            results: HashMap::from([(
                "arch=amd64,os=linux".to_string(),
                BuildResult::Failure,
            )]),
            ..Default::default()
        });
        let exec = execution(m, scheduler.clone(), vec![]);
        assert_eq!(exec.run(ctx()).await, BuildResult::Failure);

        let scheduled = scheduler.scheduled.lock().unwrap();
        assert_eq!(scheduled.len(), 2);
        assert!(scheduled.iter().all(|c| c.contains("os=linux")));
    }

    #[tokio::test]
    async fn test_touchstone_pass_builds_everything() {
        let mut m = matrix();
        m.touchstone_filter = Some(CombinationFilter::parse(r#"os == "linux""#).unwrap());
        let scheduler = Arc::new(MockScheduler::default());
        let exec = execution(m, scheduler.clone(), vec![]);
        assert_eq!(exec.run(ctx()).await, BuildResult::Success);
        assert_eq!(scheduler.scheduled.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_veto_cancels_remaining_configurations() {
        let scheduler = Arc::new(MockScheduler::default());
        let exec = execution(
            matrix(),
            scheduler.clone(),
            vec![Arc::new(VetoOn("arch=amd64,os=linux".to_string()))],
        );
        assert_eq!(exec.run(ctx()).await, BuildResult::Failure);
        // The first configuration was vetoed; the other three were cancelled.
        assert_eq!(scheduler.aborted.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_start_build_error_prevents_fan_out() {
        let scheduler = Arc::new(MockScheduler::default());
        let exec = execution(matrix(), scheduler.clone(), vec![Arc::new(RefuseStart)]);
        assert_eq!(exec.run(ctx()).await, BuildResult::Failure);
        assert!(scheduler.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parent_interrupt_aborts_sub_builds() {
        let scheduler = Arc::new(MockScheduler {
            hold: true,
            ..Default::default()
        });
        let exec = execution(matrix(), scheduler.clone(), vec![]);
        let ctx = ctx();
        ctx.interrupt.fire();
        assert_eq!(exec.run(ctx).await, BuildResult::Aborted);
        // All four were scheduled, none resolved, all were aborted.
        assert_eq!(scheduler.scheduled.lock().unwrap().len(), 4);
        assert_eq!(scheduler.aborted.lock().unwrap().len(), 4);
    }
}
