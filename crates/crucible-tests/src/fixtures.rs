//! Shared fixtures: engines with test-friendly timings and scripted
//! task runners.

use async_trait::async_trait;
use crucible_core::result::BuildResult;
use crucible_core::task::{ExecutionContext, TaskRunner};
use crucible_engine::{Engine, EngineConfig};
use crucible_pool::Node;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Initialize tracing once per test binary; respects `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// An engine with a zero default quiet period and a short sweep, so
/// paused-clock tests advance through it quickly.
pub fn test_engine() -> Arc<Engine> {
    init_tracing();
    Engine::new(EngineConfig {
        maintenance_interval_secs: 1,
        default_quiet_period_secs: 0,
        ..EngineConfig::default()
    })
}

pub fn worker(name: &str, executors: usize) -> Node {
    Node::new(name, executors)
}

/// Runs for a fixed duration, returns a fixed result, and honors
/// interruption. Tracks how many instances run at once so tests can
/// assert mutual exclusion.
pub struct ScriptedRunner {
    result: BuildResult,
    duration: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new(result: BuildResult, duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            result,
            duration,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn success() -> Arc<Self> {
        Self::new(BuildResult::Success, Duration::from_secs(1))
    }

    /// The most instances ever running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, ctx: ExecutionContext) -> BuildResult {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = tokio::select! {
            _ = tokio::time::sleep(self.duration) => self.result,
            _ = ctx.interrupt.interrupted() => BuildResult::Aborted,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Decides the result per matrix combination: combinations matching
/// `(axis, value)` get `matched`, everything else succeeds.
pub struct PerCombinationRunner {
    axis: String,
    value: String,
    matched: BuildResult,
    duration: Duration,
}

impl PerCombinationRunner {
    pub fn new(
        axis: impl Into<String>,
        value: impl Into<String>,
        matched: BuildResult,
    ) -> Arc<Self> {
        Arc::new(Self {
            axis: axis.into(),
            value: value.into(),
            matched,
            duration: Duration::from_secs(1),
        })
    }
}

#[async_trait]
impl TaskRunner for PerCombinationRunner {
    async fn run(&self, ctx: ExecutionContext) -> BuildResult {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {
                let matches = ctx
                    .combination
                    .as_ref()
                    .and_then(|c| c.get(&self.axis))
                    == Some(self.value.as_str());
                if matches { self.matched } else { BuildResult::Success }
            }
            _ = ctx.interrupt.interrupted() => BuildResult::Aborted,
        }
    }
}
