//! The engine: explicit wiring of queue, pool, projects, and the
//! background loops that keep them converging.
//!
//! Everything hangs off one explicitly constructed [`Engine`] value;
//! there are no global singletons. Embedders build it, register nodes
//! and projects, call [`Engine::start`], and talk to it through its
//! methods and the event bus.

use crate::config::EngineConfig;
use crate::project::{Project, ProjectKind};
use crate::registry::{BuildRecord, BuildRegistry};
use async_trait::async_trait;
use chrono::Utc;
use crucible_core::actions::{Action, Cause};
use crucible_core::axes::Combination;
use crucible_core::error::{Error, Result};
use crucible_core::events::{BuildCompletedPayload, Event, NodeEventPayload};
use crucible_core::ids::{BuildId, ItemId, NodeId, ProjectId, TaskId};
use crucible_core::interrupt::Interrupt;
use crucible_core::label::Label;
use crucible_core::ports::{Actor, AllowAll, PermissionChecker};
use crucible_core::result::BuildResult;
use crucible_core::task::{ExecutionContext, ResourceList, Task, TaskKind, TaskRunner};
use crucible_matrix::{
    ConfigurationRecord, ConfigurationScheduler, ConfigurationSet, MatrixExecution, SubBuild,
};
use crucible_pool::{
    CompletionReport, ComputerSet, ExecutorCounts, LoadSample, LoadSnapshot, LoadStatistics, Node,
    WorkUnit,
};
use crucible_scheduler::{
    BuildOutcome, CompletionHandle, Consistent, DependencyGraph, DependencyGraphBuilder,
    DependencyRunner, DependencyWatch, ItemSnapshot, Queue, QueueCounts, QueuePolicy,
    ScheduleResult, WatchDirection,
};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shared project/graph state, also serving as the queue's policy.
#[derive(Default)]
struct ProjectRegistry {
    projects: RwLock<HashMap<ProjectId, Arc<Project>>>,
    graph: RwLock<Arc<DependencyGraph>>,
    build_numbers: Mutex<HashMap<ProjectId, u32>>,
}

impl ProjectRegistry {
    fn get(&self, id: ProjectId) -> Option<Arc<Project>> {
        self.projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<Project>> {
        self.projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn insert(&self, project: Arc<Project>) {
        self.projects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project.id, project);
    }

    fn remove(&self, id: ProjectId) -> Option<Arc<Project>> {
        self.projects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    fn graph(&self) -> Arc<DependencyGraph> {
        self.graph
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_graph(&self, graph: Arc<DependencyGraph>) {
        *self.graph.write().unwrap_or_else(|e| e.into_inner()) = graph;
    }
}

impl QueuePolicy for ProjectRegistry {
    fn project_exists(&self, project: ProjectId) -> bool {
        self.projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&project)
    }

    fn dependency_watches(&self, task: &Task) -> Vec<DependencyWatch> {
        let Some(project) = self.get(task.owner) else {
            return Vec::new();
        };
        let graph = self.graph();
        let mut watches = Vec::new();
        let mut push = |projects: std::collections::HashSet<ProjectId>,
                        direction: WatchDirection| {
            for p in projects {
                watches.push(DependencyWatch {
                    project: p,
                    project_name: graph
                        .name(p)
                        .map(str::to_string)
                        .unwrap_or_else(|| p.to_string()),
                    direction,
                });
            }
        };
        if project.block_on_upstream {
            push(graph.transitive_upstream(project.id), WatchDirection::Upstream);
        }
        if project.block_on_downstream {
            push(
                graph.transitive_downstream(project.id),
                WatchDirection::Downstream,
            );
        }
        watches
    }

    fn next_build_number(&self, project: ProjectId) -> u32 {
        let mut numbers = self.build_numbers.lock().unwrap_or_else(|e| e.into_inner());
        let number = numbers.entry(project).or_insert(0);
        *number += 1;
        *number
    }

    fn recycle_build_number(&self, project: ProjectId, number: u32) {
        let mut numbers = self.build_numbers.lock().unwrap_or_else(|e| e.into_inner());
        // Only the most recent allocation can be handed back.
        if let Some(current) = numbers.get_mut(&project)
            && *current == number
        {
            *current = number - 1;
        }
    }
}

/// The matrix coordinator's path back into the queue.
struct MatrixConfigurationScheduler {
    queue: Arc<Queue>,
    project: ProjectId,
    project_name: String,
    label: Option<Label>,
    estimated_duration: Option<Duration>,
    runner: Arc<dyn TaskRunner>,
}

#[async_trait]
impl ConfigurationScheduler for MatrixConfigurationScheduler {
    async fn schedule(&self, combination: &Combination, actions: Vec<Action>) -> Result<SubBuild> {
        let task = Task {
            id: TaskId::configuration(self.project, combination.to_string()),
            kind: TaskKind::MatrixConfiguration {
                combination: combination.clone(),
            },
            display_name: format!("{} ({})", self.project_name, combination),
            assigned_label: self.label.clone(),
            estimated_duration: self.estimated_duration,
            concurrent_build: false,
            non_blocking: false,
            enabled: true,
            // Resources are held by the parent for the whole matrix build.
            resources: ResourceList::default(),
            owner: self.project,
            runner: self.runner.clone(),
        };
        match self.queue.schedule(task, Duration::ZERO, actions).await {
            ScheduleResult::Created { item, handle }
            | ScheduleResult::Existing { item, handle } => Ok(SubBuild {
                combination: combination.clone(),
                item_id: item,
                handle,
            }),
            ScheduleResult::Refused => Err(Error::Internal(format!(
                "configuration {combination} refused by the queue"
            ))),
        }
    }

    async fn abort(&self, sub: &SubBuild) {
        // Still queued: the cancel is final. Already executing: fire the
        // interrupt and let the completion path run.
        if !self.queue.cancel(sub.item_id).await {
            self.queue.interrupt_item(sub.item_id).await;
        }
    }
}

/// The scheduling engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ProjectRegistry>,
    queue: Arc<Queue>,
    computers: Arc<ComputerSet>,
    events: broadcast::Sender<Event>,
    permissions: Arc<dyn PermissionChecker>,
    builds: Mutex<BuildRegistry>,
    /// Every configuration each matrix project has ever had; stale ones
    /// are archived on reconfiguration, never deleted.
    configurations: Mutex<HashMap<ProjectId, ConfigurationSet>>,
    load: Mutex<LoadStatistics>,
    completions_tx: mpsc::UnboundedSender<CompletionReport>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<CompletionReport>>>,
    flyweights_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkUnit>>>,
    shutdown: Interrupt,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_permissions(config, Arc::new(AllowAll))
    }

    pub fn with_permissions(
        config: EngineConfig,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Arc<Self> {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (flyweights_tx, flyweights_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_bus_capacity.max(16));
        let computers = Arc::new(ComputerSet::new(completions_tx.clone()));
        let registry = Arc::new(ProjectRegistry::default());
        let queue = Arc::new(Queue::new(
            registry.clone(),
            Arc::new(Consistent),
            computers.clone(),
            events.clone(),
            flyweights_tx,
        ));
        Arc::new(Self {
            builds: Mutex::new(BuildRegistry::new(config.build_registry_capacity)),
            configurations: Mutex::new(HashMap::new()),
            load: Mutex::new(LoadStatistics::new()),
            config,
            registry,
            queue,
            computers,
            events,
            permissions,
            completions_tx,
            completions_rx: Mutex::new(Some(completions_rx)),
            flyweights_rx: Mutex::new(Some(flyweights_rx)),
            shutdown: Interrupt::new(),
        })
    }

    /// Spawn the background loops. Idempotent: the channel receivers are
    /// taken on the first call, later calls only respawn the tickers.
    pub fn start(self: &Arc<Self>) {
        if let Some(rx) = self
            .completions_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tokio::spawn(completion_loop(self.clone(), rx));
        }
        if let Some(rx) = self
            .flyweights_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tokio::spawn(flyweight_loop(self.clone(), rx));
        }
        tokio::spawn(maintenance_loop(self.clone()));
        tokio::spawn(statistics_loop(self.clone()));
        info!("engine started");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // ---- nodes ----

    pub fn add_node(&self, node: Node) {
        self.emit(Event::NodeOnline(NodeEventPayload {
            node_id: node.id,
            node_name: node.name.clone(),
            cause: None,
            at: Utc::now(),
        }));
        self.computers.add_node(node);
        self.queue.signal_maintenance();
    }

    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        let Some(view) = self.computers.views().into_iter().find(|v| v.node.id == id) else {
            return Err(Error::NodeNotFound(id.to_string()));
        };
        self.computers.remove_node(id);
        self.emit(Event::NodeOffline(NodeEventPayload {
            node_id: id,
            node_name: view.node.name,
            cause: Some("removed from the pool".to_string()),
            at: Utc::now(),
        }));
        Ok(())
    }

    pub fn set_node_online(&self, id: NodeId, online: bool, cause: Option<String>) -> Result<()> {
        let Some(view) = self.computers.views().into_iter().find(|v| v.node.id == id) else {
            return Err(Error::NodeNotFound(id.to_string()));
        };
        self.computers.set_online(id, online, cause.clone());
        let payload = NodeEventPayload {
            node_id: id,
            node_name: view.node.name,
            cause,
            at: Utc::now(),
        };
        self.emit(if online {
            Event::NodeOnline(payload)
        } else {
            Event::NodeOffline(payload)
        });
        self.queue.signal_maintenance();
        Ok(())
    }

    pub fn set_num_executors(&self, id: NodeId, count: usize) -> Result<()> {
        if !self.computers.set_num_executors(id, count) {
            return Err(Error::NodeNotFound(id.to_string()));
        }
        self.queue.signal_maintenance();
        Ok(())
    }

    // ---- projects ----

    /// Register a project and rebuild the dependency graph. A cycle
    /// introduced by the new project rejects the registration wholesale.
    pub fn add_project(&self, project: Project) -> Result<ProjectId> {
        let id = project.id;
        let project = Arc::new(project);
        self.registry.insert(project.clone());
        if let Err(err) = self.rebuild_dependency_graph() {
            self.registry.remove(id);
            return Err(err);
        }
        if let ProjectKind::Matrix { matrix, .. } = &project.kind {
            self.configurations_lock()
                .entry(id)
                .or_default()
                .reconcile(matrix);
        }
        Ok(id)
    }

    /// Deregister a project. Queue items it owns are dropped by the next
    /// maintenance sweep.
    pub fn remove_project(&self, id: ProjectId) -> Result<()> {
        if self.registry.remove(id).is_none() {
            return Err(Error::UnknownProject(id.to_string()));
        }
        self.configurations_lock().remove(&id);
        // Removal cannot introduce a cycle.
        let _ = self.rebuild_dependency_graph();
        self.queue.signal_maintenance();
        Ok(())
    }

    /// Rebuild the dependency graph wholesale from the registered
    /// projects and swap it in atomically. On a cycle the old graph
    /// stays in effect and the error names a project on the cycle.
    pub fn rebuild_dependency_graph(&self) -> Result<()> {
        let projects = self.registry.all();
        let mut builder = DependencyGraphBuilder::new();
        for project in &projects {
            builder.add_project(project.id, project.name.clone());
        }
        for project in &projects {
            for (upstream, threshold) in &project.upstream {
                // Declarations pointing at deregistered projects are inert.
                if projects.iter().any(|p| p.id == *upstream) {
                    builder.add_dependency(*upstream, project.id, *threshold);
                }
            }
        }
        let graph = builder.build()?;
        self.registry.set_graph(Arc::new(graph));
        Ok(())
    }

    // ---- builds ----

    pub async fn schedule_build(
        &self,
        project: ProjectId,
        actions: Vec<Action>,
    ) -> Result<ScheduleResult> {
        if self.shutdown.is_interrupted() {
            return Err(Error::Shutdown);
        }
        let Some(project) = self.registry.get(project) else {
            return Err(Error::UnknownProject(project.to_string()));
        };
        let quiet = project
            .quiet_period
            .unwrap_or_else(|| self.config.default_quiet_period());
        let task = self.task_for(&project);
        Ok(self.queue.schedule(task, quiet, actions).await)
    }

    /// Cancel a queued item on behalf of an actor. The permission
    /// checkpoint sees the task's ownership chain; a denial is an error,
    /// a vanished item is plain `false`.
    pub async fn cancel_item(&self, id: ItemId, actor: &Actor) -> Result<bool> {
        let Some(task) = self.queue.task_of(id).await else {
            return Ok(false);
        };
        if !self.permissions.can_cancel(actor, &task) {
            return Err(Error::PermissionDenied(format!(
                "{} may not cancel {}",
                actor.name, task.display_name
            )));
        }
        Ok(self.queue.cancel(id).await)
    }

    /// Interrupt whatever is executing the given build.
    pub async fn abort_build(&self, build_id: BuildId) -> bool {
        self.queue.interrupt_build(build_id).await || self.computers.interrupt_build(build_id)
    }

    /// Schedule every project once, upstream before downstream, each
    /// project exactly once even when reachable along several paths.
    pub async fn rebuild_all(&self, actions: Vec<Action>) -> usize {
        let graph = self.registry.graph();
        let mut scheduled = 0;
        for project in DependencyRunner::ordered(&graph) {
            match self.schedule_build(project, actions.clone()).await {
                Ok(result) if !result.is_refused() => scheduled += 1,
                Ok(_) => {}
                Err(err) => warn!(project = %project, %err, "rebuild-all skipped a project"),
            }
        }
        scheduled
    }

    // ---- lifecycle ----

    pub fn quiet_down(&self) {
        info!("quieting down; queued work is held");
        self.queue.quiet_down();
    }

    pub fn cancel_quiet_down(&self) {
        self.queue.cancel_quiet_down();
    }

    pub fn is_quieting(&self) -> bool {
        self.queue.is_quieting()
    }

    /// Drop every item not yet handed to an executor. Their handles
    /// resolve cancelled; executing builds are untouched.
    pub async fn clear_queue(&self) {
        self.queue.clear().await;
    }

    /// Stop matching and stop the background loops. Builds already
    /// executing finish; their completions are still processed while the
    /// completion channel lives.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.queue.quiet_down();
        self.shutdown.fire();
    }

    // ---- status surfaces ----

    pub async fn queue_snapshot(&self) -> Vec<ItemSnapshot> {
        self.queue.snapshot().await
    }

    pub async fn queue_counts(&self) -> QueueCounts {
        self.queue.counts().await
    }

    pub fn executor_counts(&self) -> ExecutorCounts {
        self.computers.executor_counts()
    }

    pub fn build_record(&self, build_id: BuildId) -> Option<BuildRecord> {
        self.builds_lock().get(build_id).cloned()
    }

    pub fn recent_builds(&self, n: usize) -> Vec<BuildRecord> {
        self.builds_lock().recent(n)
    }

    pub fn latest_build(&self, project: ProjectId) -> Option<BuildRecord> {
        self.builds_lock().latest_for(project).cloned()
    }

    /// Engine-wide load statistics.
    pub fn load_snapshot(&self) -> LoadSnapshot {
        self.load
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    pub fn node_load(&self, id: NodeId) -> Option<LoadSnapshot> {
        self.computers.load_snapshot(id)
    }

    /// Every configuration a matrix project has ever had, archived ones
    /// included. Empty for freestyle or unknown projects.
    pub fn matrix_configurations(&self, project: ProjectId) -> Vec<ConfigurationRecord> {
        self.configurations_lock()
            .get(&project)
            .map(|set| set.active().chain(set.archived()).cloned().collect())
            .unwrap_or_default()
    }

    // ---- internals ----

    fn task_for(&self, project: &Project) -> Task {
        let (kind, runner): (TaskKind, Arc<dyn TaskRunner>) = match &project.kind {
            ProjectKind::Freestyle { runner } => (TaskKind::Project, runner.clone()),
            ProjectKind::Matrix {
                matrix,
                configuration_runner,
                aggregators,
            } => (
                TaskKind::MatrixParent,
                Arc::new(MatrixExecution::new(
                    project.id,
                    project.name.clone(),
                    matrix.clone(),
                    Arc::new(MatrixConfigurationScheduler {
                        queue: self.queue.clone(),
                        project: project.id,
                        project_name: project.name.clone(),
                        label: project.label.clone(),
                        estimated_duration: project.estimated_duration,
                        runner: configuration_runner.clone(),
                    }),
                    aggregators.clone(),
                    self.events.clone(),
                )),
            ),
        };
        Task {
            id: TaskId::project(project.id),
            kind,
            display_name: project.name.clone(),
            assigned_label: project.label.clone(),
            estimated_duration: project.estimated_duration,
            concurrent_build: project.concurrent_build,
            non_blocking: project.non_blocking,
            enabled: project.enabled,
            resources: project.resources.clone(),
            owner: project.id,
            runner,
        }
    }

    /// Schedule the downstream projects whose trigger threshold the
    /// completed build meets. Configuration builds complete into their
    /// matrix parent, never into the graph.
    async fn trigger_downstream(&self, report: &CompletionReport) {
        if report.task_id.configuration.is_some() {
            return;
        }
        if self.shutdown.is_interrupted() || self.queue.is_quieting() {
            return;
        }
        let graph = self.registry.graph();
        let upstream_name = graph
            .name(report.task_id.project)
            .map(str::to_string)
            .unwrap_or_else(|| report.task_name.clone());
        for (downstream, threshold) in graph.downstream(report.task_id.project) {
            if !report.result.is_better_or_equal_to(threshold) {
                debug!(
                    upstream = %upstream_name,
                    result = %report.result,
                    threshold = %threshold,
                    "result below downstream trigger threshold"
                );
                continue;
            }
            let cause = Action::Cause(Cause::Upstream {
                project: report.task_id.project,
                project_name: upstream_name.clone(),
                build_number: report.build_number,
            });
            if let Err(err) = self.schedule_build(downstream, vec![cause]).await {
                warn!(project = %downstream, %err, "downstream trigger failed");
            }
        }
    }

    fn builds_lock(&self) -> MutexGuard<'_, BuildRegistry> {
        self.builds.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn configurations_lock(&self) -> MutexGuard<'_, HashMap<ProjectId, ConfigurationSet>> {
        self.configurations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

/// Runs the maintenance sweep on the periodic tick and on every eager
/// signal, and yanks dead executors first so the sweep sees live state.
async fn maintenance_loop(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config.maintenance_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = engine.shutdown.interrupted() => break,
            _ = interval.tick() => {}
            _ = engine.queue.maintenance_signal() => {}
        }
        engine.computers.yank_dead();
        engine.queue.maintain().await;
    }
    debug!("maintenance loop stopped");
}

async fn statistics_loop(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config.statistics_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = engine.shutdown.interrupted() => break,
            _ = interval.tick() => {}
        }
        let per_node = engine.queue.buildable_by_node().await;
        engine.computers.update_load_statistics(&per_node);
        let counts = engine.computers.executor_counts();
        let queue_counts = engine.queue.counts().await;
        engine
            .load
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(LoadSample {
                busy_executors: counts.busy,
                online_executors: counts.online,
                idle_executors: counts.idle,
                queue_length: queue_counts.buildable,
            });
    }
    debug!("statistics loop stopped");
}

/// Mediates every completion: frees the slot, records the build, tells
/// the queue, and triggers downstream projects.
async fn completion_loop(engine: Arc<Engine>, mut rx: mpsc::UnboundedReceiver<CompletionReport>) {
    while let Some(report) = rx.recv().await {
        if let Some(slot) = report.slot {
            engine.computers.complete(slot);
        }
        engine.builds_lock().insert(BuildRecord {
            build_id: report.build_id,
            project: report.task_id.project,
            task_name: report.task_name.clone(),
            build_number: report.build_number,
            result: report.result,
            completed_at: Utc::now(),
        });
        engine.emit(Event::BuildCompleted(BuildCompletedPayload {
            build_id: report.build_id,
            task_id: report.task_id.clone(),
            build_number: report.build_number,
            result: report.result,
            at: Utc::now(),
        }));
        engine
            .queue
            .on_completed(
                report.item_id,
                BuildOutcome {
                    build_id: report.build_id,
                    build_number: report.build_number,
                    result: report.result,
                },
            )
            .await;
        engine.trigger_downstream(&report).await;
    }
    debug!("completion loop stopped");
}

/// Runs flyweight work units on one-off coordinator tasks; they occupy
/// no executor slot but report through the same completion channel.
async fn flyweight_loop(engine: Arc<Engine>, mut rx: mpsc::UnboundedReceiver<WorkUnit>) {
    while let Some(work) = rx.recv().await {
        let completions = engine.completions_tx.clone();
        tokio::spawn(async move {
            debug!(task = %work.task.display_name, "flyweight coordinator starting");
            let ctx = ExecutionContext {
                build_id: work.build_id,
                build_number: work.build_number,
                combination: work.task.combination().cloned(),
                interrupt: work.interrupt.clone(),
            };
            let outcome = AssertUnwindSafe(work.task.runner.run(ctx)).catch_unwind().await;
            let result = match outcome {
                Ok(_) if work.interrupt.is_interrupted() => BuildResult::Aborted,
                Ok(result) => result,
                Err(_) => {
                    warn!(task = %work.task.display_name, "flyweight coordinator panicked");
                    BuildResult::Failure
                }
            };
            let _ = completions.send(CompletionReport {
                item_id: work.item_id,
                task_id: work.task.id.clone(),
                task_name: work.task.display_name.clone(),
                build_id: work.build_id,
                build_number: work.build_number,
                result,
                slot: None,
            });
        });
    }
    debug!("flyweight loop stopped");
}

/// Convenience re-export so embedders can await a scheduled build.
pub type BuildHandle = CompletionHandle;
