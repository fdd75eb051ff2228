//! Matrix fan-out, touchstone gating, and aggregation through a
//! running engine.

use crucible_core::axes::{Axis, AxisList};
use crucible_core::events::Event;
use crucible_core::result::BuildResult;
use crucible_engine::Project;
use crucible_matrix::{CombinationFilter, MatrixProject};
use crucible_tests::fixtures::{PerCombinationRunner, ScriptedRunner, test_engine, worker};
use std::time::Duration;

fn os_arch_matrix() -> MatrixProject {
    MatrixProject::new(
        AxisList::new(vec![
            Axis::new("os", vec!["linux", "macos"]),
            Axis::new("arch", vec!["amd64", "arm64"]),
        ])
        .unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_matrix_parent_combines_worst_result() {
    let engine = test_engine();
    engine.add_node(worker("grid", 4));
    engine.start();

    let id = engine
        .add_project(Project::matrix(
            "grid-build",
            os_arch_matrix(),
            PerCombinationRunner::new("os", "macos", BuildResult::Unstable),
        ))
        .unwrap();
    let handle = engine.schedule_build(id, vec![]).await.unwrap().handle().unwrap();
    assert_eq!(handle.wait().await.result(), BuildResult::Unstable);
    // Four configurations plus the parent coordinator.
    assert_eq!(engine.recent_builds(10).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_touchstone_failure_skips_the_rest() {
    let engine = test_engine();
    engine.add_node(worker("grid", 4));
    engine.start();

    let mut matrix = os_arch_matrix();
    matrix.touchstone_filter = Some(CombinationFilter::parse(r#"os == "linux""#).unwrap());
    let id = engine
        .add_project(Project::matrix(
            "gated",
            matrix,
            PerCombinationRunner::new("os", "linux", BuildResult::Failure),
        ))
        .unwrap();
    let handle = engine.schedule_build(id, vec![]).await.unwrap().handle().unwrap();
    assert_eq!(handle.wait().await.result(), BuildResult::Failure);
    // Only the two touchstone configurations built, plus the parent.
    assert_eq!(engine.recent_builds(10).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_touchstone_pass_builds_the_delayed_set() {
    let engine = test_engine();
    engine.add_node(worker("grid", 4));
    engine.start();

    let mut matrix = os_arch_matrix();
    matrix.touchstone_filter = Some(CombinationFilter::parse(r#"os == "linux""#).unwrap());
    let id = engine
        .add_project(Project::matrix("gated", matrix, ScriptedRunner::success()))
        .unwrap();
    let handle = engine.schedule_build(id, vec![]).await.unwrap().handle().unwrap();
    assert_eq!(handle.wait().await.result(), BuildResult::Success);
    assert_eq!(engine.recent_builds(10).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_matrix_runs_one_configuration_at_a_time() {
    let engine = test_engine();
    engine.add_node(worker("grid", 4));
    engine.start();

    let mut matrix = os_arch_matrix();
    matrix.run_sequentially = true;
    let runner = ScriptedRunner::new(BuildResult::Success, Duration::from_secs(5));
    let id = engine
        .add_project(Project::matrix("serial", matrix, runner.clone()))
        .unwrap();
    let handle = engine.schedule_build(id, vec![]).await.unwrap().handle().unwrap();
    assert_eq!(handle.wait().await.result(), BuildResult::Success);
    assert_eq!(runner.peak_concurrency(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_aborting_the_parent_aborts_the_configurations() {
    let engine = test_engine();
    engine.add_node(worker("grid", 2));
    engine.start();

    let id = engine
        .add_project(Project::matrix(
            "doomed",
            os_arch_matrix(),
            ScriptedRunner::new(BuildResult::Success, Duration::from_secs(3600)),
        ))
        .unwrap();
    let mut events = engine.subscribe();
    let handle = engine.schedule_build(id, vec![]).await.unwrap().handle().unwrap();

    // The parent coordinator is the build without a configuration key.
    let parent_build = loop {
        if let Ok(Event::BuildStarted(payload)) = events.recv().await
            && payload.task_id.configuration.is_none()
        {
            break payload.build_id;
        }
    };
    // Let the fan-out reach the executors before pulling the plug.
    loop {
        if engine.executor_counts().busy == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(engine.abort_build(parent_build).await);
    assert_eq!(handle.wait().await.result(), BuildResult::Aborted);

    // Queued configurations were cancelled, running ones interrupted.
    loop {
        if engine.queue_counts().await.total() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(engine.executor_counts().busy, 0);
}
