//! The build queue state machine.
//!
//! Items advance `Waiting -> {Blocked <-> Buildable} -> Pending` and
//! leave on completion or cancellation. All stage collections are
//! guarded by one coarse lock; schedule, cancel, and the maintenance
//! sweep are mutually exclusive. The sweep runs on the engine's
//! periodic timer and is also signalled eagerly after every
//! schedule/cancel/completion so blocking conditions are re-evaluated
//! promptly.

use crate::balancer::LoadBalancer;
use crate::blockage::CauseOfBlockage;
use crate::item::{
    BuildOutcome, CompletionState, Execution, Item, ItemSnapshot, ItemState, ScheduleResult,
};
use crate::resources::ResourceController;
use chrono::Utc;
use crucible_core::actions::{Action, merge_actions};
use crucible_core::events::{BuildEventPayload, Event, ItemEventPayload};
use crucible_core::ids::{BuildId, ItemId, NodeId, ProjectId};
use crucible_core::interrupt::Interrupt;
use crucible_core::task::Task;
use crucible_pool::{ComputerSet, ComputerView, WorkUnit};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Which side of a dependency edge a watch guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchDirection {
    Upstream,
    Downstream,
}

/// A project whose queue/execution activity blocks a candidate task,
/// derived by the engine from project configuration and the current
/// dependency-graph snapshot.
#[derive(Debug, Clone)]
pub struct DependencyWatch {
    pub project: ProjectId,
    pub project_name: String,
    pub direction: WatchDirection,
}

/// What the queue needs to know about the world outside its lock.
pub trait QueuePolicy: Send + Sync {
    /// A task whose project disappeared is silently dropped on the next
    /// sweep rather than erroring.
    fn project_exists(&self, project: ProjectId) -> bool;

    /// Projects whose activity blocks this task (upstream/downstream
    /// blocking policy, transitively resolved).
    fn dependency_watches(&self, task: &Task) -> Vec<DependencyWatch>;

    fn next_build_number(&self, project: ProjectId) -> u32;

    /// Return a build number whose hand-off fell through before the
    /// work reached an executor. Called under the queue lock, before
    /// any later allocation for the same project, so the next build
    /// reuses the number instead of leaving a gap.
    fn recycle_build_number(&self, project: ProjectId, number: u32);
}

/// Per-stage item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub blocked: usize,
    pub buildable: usize,
    pub pending: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.blocked + self.buildable + self.pending
    }
}

struct QueueState {
    /// Ordered by `(eligible_at, id)`.
    waiting: Vec<Item>,
    blocked: Vec<Item>,
    /// FIFO by entry into the buildable stage.
    buildables: VecDeque<Item>,
    pending: Vec<Item>,
    resources: ResourceController,
}

/// The central scheduling state machine.
pub struct Queue {
    state: Mutex<QueueState>,
    policy: Arc<dyn QueuePolicy>,
    balancer: Arc<dyn LoadBalancer>,
    computers: Arc<ComputerSet>,
    events: broadcast::Sender<Event>,
    flyweights: mpsc::UnboundedSender<WorkUnit>,
    maintenance: Notify,
    quieting: AtomicBool,
    next_id: AtomicU64,
}

impl Queue {
    pub fn new(
        policy: Arc<dyn QueuePolicy>,
        balancer: Arc<dyn LoadBalancer>,
        computers: Arc<ComputerSet>,
        events: broadcast::Sender<Event>,
        flyweights: mpsc::UnboundedSender<WorkUnit>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                waiting: Vec::new(),
                blocked: Vec::new(),
                buildables: VecDeque::new(),
                pending: Vec::new(),
                resources: ResourceController::new(),
            }),
            policy,
            balancer,
            computers,
            events,
            flyweights,
            maintenance: Notify::new(),
            quieting: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    /// Submit a task. A disabled task is refused outright; a duplicate
    /// of a non-concurrent task already waiting collapses into the
    /// existing item, extending its quiet period to the longest path
    /// and merging actions.
    pub async fn schedule(
        &self,
        task: Task,
        quiet_period: Duration,
        actions: Vec<Action>,
    ) -> ScheduleResult {
        if !task.enabled {
            debug!(task = %task.display_name, "task is disabled; refusing to queue");
            return ScheduleResult::Refused;
        }
        let mut state = self.state.lock().await;
        if !task.concurrent_build
            && let Some(existing) = state.waiting.iter_mut().find(|i| i.task.id == task.id)
        {
            let extended = Instant::now() + quiet_period;
            if extended > existing.eligible_at {
                existing.eligible_at = extended;
            }
            merge_actions(&mut existing.actions, actions);
            let item = existing.id;
            let handle = existing.handle();
            debug!(item = %item, task = %task.display_name, "collapsed duplicate submission");
            state.waiting.sort_by_key(|i| (i.eligible_at, i.id));
            drop(state);
            self.maintenance.notify_one();
            return ScheduleResult::Existing { item, handle };
        }

        let id = ItemId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (completion, _) = watch::channel(None);
        let item = Item {
            id,
            queued_at: Utc::now(),
            eligible_at: Instant::now() + quiet_period,
            buildable_since: None,
            why: Some(CauseOfBlockage::InQuietPeriod),
            completion,
            execution: None,
            actions,
            task,
        };
        let handle = item.handle();
        self.emit(Event::ItemEnqueued(item_payload(&item)));
        state.waiting.push(item);
        state.waiting.sort_by_key(|i| (i.eligible_at, i.id));
        drop(state);
        self.maintenance.notify_one();
        ScheduleResult::Created { item: id, handle }
    }

    /// Cancel an item from Waiting, Blocked, or Buildable: immediate
    /// and synchronous. A Pending item is not a queue transition; use
    /// [`Queue::interrupt_item`] to stop the running executor instead.
    pub async fn cancel(&self, id: ItemId) -> bool {
        let mut state = self.state.lock().await;
        let found = remove_by_id(&mut state.waiting, id)
            .or_else(|| remove_by_id(&mut state.blocked, id))
            .or_else(|| {
                state
                    .buildables
                    .iter()
                    .position(|i| i.id == id)
                    .and_then(|pos| state.buildables.remove(pos))
            });
        match found {
            Some(item) => {
                item.resolve(CompletionState::Cancelled);
                self.emit(Event::ItemCancelled(item_payload(&item)));
                drop(state);
                self.maintenance.notify_one();
                true
            }
            None => false,
        }
    }

    /// Fire the interrupt of a pending item's execution.
    pub async fn interrupt_item(&self, id: ItemId) -> bool {
        let state = self.state.lock().await;
        match state
            .pending
            .iter()
            .find(|i| i.id == id)
            .and_then(|i| i.execution.as_ref())
        {
            Some(execution) => {
                execution.interrupt.fire();
                true
            }
            None => false,
        }
    }

    /// Fire the interrupt of whichever pending item owns this build.
    pub async fn interrupt_build(&self, build_id: BuildId) -> bool {
        let state = self.state.lock().await;
        match state
            .pending
            .iter()
            .filter_map(|i| i.execution.as_ref())
            .find(|e| e.build_id == build_id)
        {
            Some(execution) => {
                execution.interrupt.fire();
                true
            }
            None => false,
        }
    }

    /// The task behind an item, whichever stage it occupies. Used for
    /// permission checks at the cancel boundary.
    pub async fn task_of(&self, id: ItemId) -> Option<Task> {
        let state = self.state.lock().await;
        state
            .waiting
            .iter()
            .chain(state.blocked.iter())
            .chain(state.buildables.iter())
            .chain(state.pending.iter())
            .find(|i| i.id == id)
            .map(|i| i.task.clone())
    }

    /// Called by the engine when an executor (or flyweight coordinator)
    /// reports its work unit finished.
    pub async fn on_completed(&self, item_id: ItemId, outcome: BuildOutcome) {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.pending.iter().position(|i| i.id == item_id) {
            let item = state.pending.remove(pos);
            state.resources.stop(item.id);
            item.resolve(CompletionState::Completed(outcome));
        }
        drop(state);
        self.maintenance.notify_one();
    }

    /// Stop matching new work; queued items stay put with a
    /// shutting-down cause.
    pub fn quiet_down(&self) {
        self.quieting.store(true, Ordering::Relaxed);
    }

    pub fn cancel_quiet_down(&self) {
        self.quieting.store(false, Ordering::Relaxed);
        self.maintenance.notify_one();
    }

    pub fn is_quieting(&self) -> bool {
        self.quieting.load(Ordering::Relaxed)
    }

    /// Resolves when eager maintenance has been requested.
    pub async fn maintenance_signal(&self) {
        self.maintenance.notified().await;
    }

    pub fn signal_maintenance(&self) {
        self.maintenance.notify_one();
    }

    /// The maintenance sweep: matures waiting items, re-evaluates
    /// blocking, and matches buildable items to idle executors.
    pub async fn maintain(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();

        // Waiting items whose quiet period has passed leave Waiting.
        let mut candidates: Vec<Item> = Vec::new();
        while state.waiting.first().is_some_and(|i| i.eligible_at <= now) {
            candidates.push(state.waiting.remove(0));
        }
        // Blocked items are re-evaluated every sweep.
        candidates.extend(state.blocked.drain(..));

        for mut item in candidates {
            if !self.policy.project_exists(item.task.owner) {
                debug!(item = %item.id, task = %item.task.display_name, "task vanished; dropping");
                item.resolve(CompletionState::Cancelled);
                continue;
            }
            let came_from_waiting = item.why == Some(CauseOfBlockage::InQuietPeriod);
            match self.blocking_cause(state, &item) {
                Some(cause) => {
                    if came_from_waiting {
                        self.emit(Event::ItemBlocked(item_payload(&item)));
                    }
                    item.why = Some(cause);
                    state.blocked.push(item);
                }
                None => {
                    item.why = None;
                    item.buildable_since = Some(now);
                    self.emit(Event::ItemBuildable(item_payload(&item)));
                    state.buildables.push_back(item);
                }
            }
        }

        if self.is_quieting() {
            for item in state.buildables.iter_mut() {
                item.why = Some(CauseOfBlockage::ShuttingDown);
            }
            return;
        }

        // Match buildable items to executors in FIFO order by entry
        // into the buildable stage.
        let mut views = self.computers.views();
        let mut remaining: VecDeque<Item> = VecDeque::new();
        while let Some(mut item) = state.buildables.pop_front() {
            // Conditions may have re-blocked the item since it became
            // buildable.
            let reblocked = self.blocking_cause(&*state, &item).or_else(|| {
                (!item.task.concurrent_build
                    && remaining.iter().any(|i| i.task.id == item.task.id))
                .then(|| CauseOfBlockage::BlockedBySelf {
                    task_name: item.task.display_name.clone(),
                })
            });
            if let Some(cause) = reblocked {
                item.why = Some(cause);
                item.buildable_since = None;
                state.blocked.push(item);
                continue;
            }

            if item.task.is_flyweight() {
                // Flyweight tasks do not require a physical slot; they
                // transition immediately and run on a one-off
                // coordinator task.
                let unit = self.begin_execution(&mut item);
                if self.flyweights.send(unit).is_ok() {
                    self.start_pending(state, item);
                } else {
                    self.rescind_execution(&mut item);
                    item.why = Some(CauseOfBlockage::ShuttingDown);
                    remaining.push_back(item);
                }
                continue;
            }

            match self.balancer.choose(&item.task, &views) {
                Some(slot) => {
                    let unit = self.begin_execution(&mut item);
                    let (task_id, task_name) =
                        (unit.task.id.clone(), unit.task.display_name.clone());
                    let (build_id, concurrent, non_blocking) = (
                        unit.build_id,
                        unit.task.concurrent_build,
                        unit.task.non_blocking,
                    );
                    if self.computers.try_assign(slot, unit) {
                        // Reflect the assignment in our local views so
                        // later items this sweep see the slot as taken.
                        if let Some(view) = views.iter_mut().find(|v| v.node.id == slot.node) {
                            view.idle_slots.retain(|&n| n != slot.number);
                            view.occupants.push(crucible_pool::OccupantView {
                                task_id,
                                task_name,
                                build_id,
                                concurrent,
                                non_blocking,
                            });
                        }
                        self.start_pending(state, item);
                    } else {
                        self.rescind_execution(&mut item);
                        item.why = Some(CauseOfBlockage::WaitingForExecutor);
                        remaining.push_back(item);
                    }
                }
                None => {
                    item.why = Some(self.unmatched_cause(&item.task, &views));
                    remaining.push_back(item);
                }
            }
        }
        state.buildables = remaining;
    }

    /// All items, one snapshot per item, each in exactly one stage.
    pub async fn snapshot(&self) -> Vec<ItemSnapshot> {
        let state = self.state.lock().await;
        let views = self.computers.views();
        let mut out = Vec::new();
        for item in &state.waiting {
            out.push(snapshot_of(item, ItemState::Waiting, false));
        }
        for item in &state.blocked {
            out.push(snapshot_of(item, ItemState::Blocked, false));
        }
        for item in &state.buildables {
            out.push(snapshot_of(item, ItemState::Buildable, is_stuck(item, &views)));
        }
        for item in &state.pending {
            out.push(snapshot_of(item, ItemState::Pending, false));
        }
        out
    }

    pub async fn counts(&self) -> QueueCounts {
        let state = self.state.lock().await;
        QueueCounts {
            waiting: state.waiting.len(),
            blocked: state.blocked.len(),
            buildable: state.buildables.len(),
            pending: state.pending.len(),
        }
    }

    /// Buildable items per node able to take them, for per-computer
    /// load statistics.
    pub async fn buildable_by_node(&self) -> HashMap<NodeId, usize> {
        let state = self.state.lock().await;
        let views = self.computers.views();
        let mut census: HashMap<NodeId, usize> = HashMap::new();
        for item in &state.buildables {
            for view in &views {
                if view.node.satisfies(item.task.assigned_label.as_ref()) {
                    *census.entry(view.node.id).or_insert(0) += 1;
                }
            }
        }
        census
    }

    /// Remove every not-yet-running item, resolving their futures as
    /// cancelled. Pending work is untouched.
    pub async fn clear(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        for item in state
            .waiting
            .drain(..)
            .chain(state.blocked.drain(..))
            .chain(state.buildables.drain(..))
        {
            item.resolve(CompletionState::Cancelled);
            self.emit(Event::ItemCancelled(item_payload(&item)));
        }
    }

    fn begin_execution(&self, item: &mut Item) -> WorkUnit {
        let build_id = BuildId::new();
        let build_number = self.policy.next_build_number(item.task.owner);
        let interrupt = Interrupt::new();
        item.execution = Some(Execution {
            build_id,
            build_number,
            interrupt: interrupt.clone(),
        });
        WorkUnit {
            item_id: item.id,
            task: item.task.clone(),
            actions: item.actions.clone(),
            build_id,
            build_number,
            interrupt,
        }
    }

    /// Undo [`Queue::begin_execution`] when the hand-off failed.
    fn rescind_execution(&self, item: &mut Item) {
        if let Some(execution) = item.execution.take() {
            self.policy
                .recycle_build_number(item.task.owner, execution.build_number);
        }
    }

    fn start_pending(&self, state: &mut QueueState, item: Item) {
        state.resources.start(
            item.id,
            item.task.display_name.clone(),
            item.task.resources.clone(),
        );
        self.emit(Event::ItemLeft(item_payload(&item)));
        if let Some(execution) = &item.execution {
            self.emit(Event::BuildStarted(BuildEventPayload {
                build_id: execution.build_id,
                task_id: item.task.id.clone(),
                build_number: execution.build_number,
                at: Utc::now(),
            }));
        }
        state.pending.push(item);
    }

    /// Classify whether an item must stay blocked, in spec order:
    /// same-task exclusion, resource overlap, dependency policy.
    fn blocking_cause(&self, state: &QueueState, item: &Item) -> Option<CauseOfBlockage> {
        let task = &item.task;
        if !task.concurrent_build {
            let same = |i: &Item| i.task.id == task.id && i.id != item.id;
            if state.pending.iter().any(same) || state.buildables.iter().any(same) {
                return Some(CauseOfBlockage::BlockedBySelf {
                    task_name: task.display_name.clone(),
                });
            }
        }
        if let Some((activity, resource)) = state.resources.blocking_activity(&task.resources) {
            return Some(CauseOfBlockage::BlockedByResource {
                resource: resource.clone(),
                holder: activity.task_name.clone(),
            });
        }
        for watch in self.policy.dependency_watches(task) {
            let active = |i: &Item| i.task.owner == watch.project && i.id != item.id;
            if state.pending.iter().any(active)
                || state.buildables.iter().any(active)
                || state.blocked.iter().any(active)
                || state.waiting.iter().any(active)
            {
                return Some(match watch.direction {
                    WatchDirection::Upstream => CauseOfBlockage::BlockedByUpstream {
                        project_name: watch.project_name,
                    },
                    WatchDirection::Downstream => CauseOfBlockage::BlockedByDownstream {
                        project_name: watch.project_name,
                    },
                });
            }
        }
        None
    }

    fn unmatched_cause(&self, task: &Task, views: &[ComputerView]) -> CauseOfBlockage {
        let matching: Vec<&ComputerView> = views
            .iter()
            .filter(|v| v.node.satisfies(task.assigned_label.as_ref()))
            .collect();
        match &task.assigned_label {
            Some(label) => {
                if matching.iter().all(|v| !v.online) {
                    CauseOfBlockage::LabelOffline {
                        label: label.clone(),
                    }
                } else if matching.iter().all(|v| !v.online || !v.accepting) {
                    let node_name = matching
                        .iter()
                        .find(|v| v.online)
                        .map(|v| v.node.name.clone())
                        .unwrap_or_default();
                    CauseOfBlockage::NodeDraining { node_name }
                } else {
                    CauseOfBlockage::LabelBusy {
                        label: label.clone(),
                    }
                }
            }
            None => CauseOfBlockage::WaitingForExecutor,
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

fn remove_by_id(items: &mut Vec<Item>, id: ItemId) -> Option<Item> {
    items
        .iter()
        .position(|i| i.id == id)
        .map(|pos| items.remove(pos))
}

fn item_payload(item: &Item) -> ItemEventPayload {
    ItemEventPayload {
        item_id: item.id,
        task_id: item.task.id.clone(),
        task_name: item.task.display_name.clone(),
        at: Utc::now(),
    }
}

fn snapshot_of(item: &Item, state: ItemState, stuck: bool) -> ItemSnapshot {
    ItemSnapshot {
        id: item.id,
        task_id: item.task.id.clone(),
        task_name: item.task.display_name.clone(),
        state,
        why: item.why.as_ref().map(|c| c.to_string()),
        queued_at: item.queued_at,
        stuck,
        build_id: item.execution.as_ref().map(|e| e.build_id),
        build_number: item.execution.as_ref().map(|e| e.build_number),
    }
}

/// A buildable item is stuck when its label is wholly offline, or when
/// it has waited longer than 10x its estimated duration (minimum basis
/// 60 s), or more than 24 h when the duration is unknown. Diagnostic
/// only; it never triggers a retry.
fn is_stuck(item: &Item, views: &[ComputerView]) -> bool {
    if let Some(label) = &item.task.assigned_label {
        let any_online = views
            .iter()
            .any(|v| v.online && v.node.satisfies(Some(label)));
        if !any_online {
            return true;
        }
    }
    let Some(since) = item.buildable_since else {
        return false;
    };
    let elapsed = since.elapsed();
    match item.task.estimated_duration {
        Some(d) => elapsed > d.max(Duration::from_secs(60)) * 10,
        None => elapsed > Duration::from_secs(24 * 60 * 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Consistent;
    use async_trait::async_trait;
    use crucible_core::ids::TaskId;
    use crucible_core::result::BuildResult;
    use crucible_core::task::{ExecutionContext, Resource, ResourceList, TaskKind, TaskRunner};
    use crucible_pool::{CompletionReport, Node, SlotId};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct SleepRunner(Duration);

    #[async_trait]
    impl TaskRunner for SleepRunner {
        async fn run(&self, ctx: ExecutionContext) -> BuildResult {
            tokio::select! {
                _ = tokio::time::sleep(self.0) => BuildResult::Success,
                _ = ctx.interrupt.interrupted() => BuildResult::Aborted,
            }
        }
    }

    #[derive(Default)]
    struct StubPolicy {
        gone: StdMutex<HashSet<ProjectId>>,
        counter: AtomicU64,
    }

    impl QueuePolicy for StubPolicy {
        fn project_exists(&self, project: ProjectId) -> bool {
            !self.gone.lock().unwrap().contains(&project)
        }

        fn dependency_watches(&self, _task: &Task) -> Vec<DependencyWatch> {
            Vec::new()
        }

        fn next_build_number(&self, _project: ProjectId) -> u32 {
            self.counter.fetch_add(1, Ordering::Relaxed) as u32 + 1
        }

        fn recycle_build_number(&self, _project: ProjectId, number: u32) {
            let _ = self.counter.compare_exchange(
                number as u64,
                number as u64 - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    struct Fixture {
        queue: Arc<Queue>,
        computers: Arc<ComputerSet>,
        policy: Arc<StubPolicy>,
        completions: mpsc::UnboundedReceiver<CompletionReport>,
        _flyweights: mpsc::UnboundedReceiver<WorkUnit>,
    }

    fn fixture() -> Fixture {
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (flyweight_tx, flyweights) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let computers = Arc::new(ComputerSet::new(completion_tx));
        let policy = Arc::new(StubPolicy::default());
        let queue = Arc::new(Queue::new(
            policy.clone(),
            Arc::new(Consistent),
            computers.clone(),
            events,
            flyweight_tx,
        ));
        Fixture {
            queue,
            computers,
            policy,
            completions,
            _flyweights: flyweights,
        }
    }

    fn task(name: &str, resources: ResourceList) -> Task {
        let project = ProjectId::new();
        Task {
            id: TaskId::project(project),
            kind: TaskKind::Project,
            display_name: name.to_string(),
            assigned_label: None,
            estimated_duration: Some(Duration::from_secs(30)),
            concurrent_build: false,
            non_blocking: false,
            enabled: true,
            resources,
            owner: project,
            runner: Arc::new(SleepRunner(Duration::from_secs(1))),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_task_refused() {
        let f = fixture();
        let mut t = task("disabled", Default::default());
        t.enabled = false;
        assert!(f.queue.schedule(t, Duration::ZERO, vec![]).await.is_refused());
        assert_eq!(f.queue.counts().await.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_waiting_collapses_and_extends() {
        let f = fixture();
        let t = task("job", Default::default());
        let first = f
            .queue
            .schedule(t.clone(), Duration::from_secs(60), vec![])
            .await;
        assert!(matches!(first, ScheduleResult::Created { .. }));

        tokio::time::advance(Duration::from_secs(30)).await;
        let second = f
            .queue
            .schedule(t.clone(), Duration::from_secs(60), vec![])
            .await;
        assert!(matches!(second, ScheduleResult::Existing { .. }));
        assert_eq!(f.queue.counts().await.waiting, 1);

        // 65 s after the first submission the original quiet period has
        // passed, but the refreshed one has not.
        tokio::time::advance(Duration::from_secs(35)).await;
        f.queue.maintain().await;
        assert_eq!(f.queue.counts().await.waiting, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        f.queue.maintain().await;
        let counts = f.queue.counts().await;
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.buildable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_blocking_resolves_after_completion() {
        let mut f = fixture();
        f.computers.add_node(Node::new("worker", 2));

        let shared = ResourceList::new([Resource::new("db")]);
        let first = task("first", shared.clone());
        let second = task("second", shared);
        f.queue.schedule(first, Duration::ZERO, vec![]).await;
        f.queue.schedule(second, Duration::ZERO, vec![]).await;
        f.queue.maintain().await;

        let counts = f.queue.counts().await;
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.blocked, 1);

        // First finishes; one sweep later the second proceeds.
        let report = f.completions.recv().await.unwrap();
        f.computers.complete(report.slot.unwrap());
        f.queue
            .on_completed(
                report.item_id,
                BuildOutcome {
                    build_id: report.build_id,
                    build_number: report.build_number,
                    result: report.result,
                },
            )
            .await;
        f.queue.maintain().await;
        let counts = f.queue.counts().await;
        assert_eq!(counts.blocked, 0);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_exclusivity() {
        let mut f = fixture();
        f.computers.add_node(Node::new("worker", 1));
        let t1 = task("one", Default::default());
        let t2 = task("two", Default::default());
        f.queue.schedule(t1, Duration::ZERO, vec![]).await;
        f.queue.schedule(t2, Duration::from_secs(5), vec![]).await;
        f.queue.maintain().await;

        let snaps = f.queue.snapshot().await;
        assert_eq!(snaps.len(), 2);
        let mut ids = HashSet::new();
        for snap in &snaps {
            assert!(ids.insert(snap.id), "item present in two stages");
        }
        assert_eq!(
            snaps.iter().filter(|s| s.state == ItemState::Pending).count(),
            1
        );
        assert_eq!(
            snaps.iter().filter(|s| s.state == ItemState::Waiting).count(),
            1
        );
        // Drain the assigned work so the runtime is not left waiting.
        let report = f.completions.recv().await.unwrap();
        f.computers.complete(report.slot.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waiting_resolves_cancelled() {
        let f = fixture();
        let t = task("job", Default::default());
        let handle = f
            .queue
            .schedule(t, Duration::from_secs(60), vec![])
            .await
            .handle()
            .unwrap();
        let snaps = f.queue.snapshot().await;
        assert!(f.queue.cancel(snaps[0].id).await);
        assert_eq!(handle.wait().await, CompletionState::Cancelled);
        assert_eq!(f.queue.counts().await.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_project_dropped_silently() {
        let f = fixture();
        let t = task("doomed", Default::default());
        let owner = t.owner;
        let handle = f
            .queue
            .schedule(t, Duration::from_secs(1), vec![])
            .await
            .handle()
            .unwrap();
        f.policy.gone.lock().unwrap().insert(owner);
        tokio::time::advance(Duration::from_secs(2)).await;
        f.queue.maintain().await;
        assert_eq!(f.queue.counts().await.total(), 0);
        assert_eq!(handle.wait().await, CompletionState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_threshold() {
        let f = fixture();
        // No executors at all: the item stays buildable.
        let t = task("stuck", Default::default());
        f.queue.schedule(t, Duration::ZERO, vec![]).await;
        f.queue.maintain().await;

        // Estimated duration 30 s -> basis is max(30, 60) = 60 s, so the
        // threshold is 600 s.
        tokio::time::advance(Duration::from_secs(599)).await;
        let snaps = f.queue.snapshot().await;
        assert!(!snaps[0].stuck);

        tokio::time::advance(Duration::from_secs(2)).await;
        let snaps = f.queue.snapshot().await;
        assert!(snaps[0].stuck);
    }

    /// Points the first item at a slot that does not exist, then defers
    /// to the real strategy.
    struct FlakySlot(AtomicU64);

    impl LoadBalancer for FlakySlot {
        fn choose(&self, task: &Task, computers: &[ComputerView]) -> Option<SlotId> {
            if self.0.fetch_add(1, Ordering::Relaxed) == 0 {
                computers.first().map(|v| SlotId {
                    node: v.node.id,
                    number: 99,
                })
            } else {
                Consistent.choose(task, computers)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_hand_off_recycles_build_number() {
        let (completion_tx, mut completions) = mpsc::unbounded_channel();
        let (flyweight_tx, _flyweights) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let computers = Arc::new(ComputerSet::new(completion_tx));
        computers.add_node(Node::new("worker", 1));
        let queue = Queue::new(
            Arc::new(StubPolicy::default()),
            Arc::new(FlakySlot(AtomicU64::new(0))),
            computers.clone(),
            events,
            flyweight_tx,
        );

        queue
            .schedule(task("job", Default::default()), Duration::ZERO, vec![])
            .await;
        queue.maintain().await;
        // The bogus slot refused the work; the item stays buildable.
        assert_eq!(queue.counts().await.buildable, 1);

        // The retried hand-off reuses the number; no gap in the sequence.
        queue.maintain().await;
        let report = completions.recv().await.unwrap();
        assert_eq!(report.build_number, 1);
        computers.complete(report.slot.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_queued_items_only() {
        let mut f = fixture();
        f.computers.add_node(Node::new("worker", 1));
        f.queue
            .schedule(task("running", Default::default()), Duration::ZERO, vec![])
            .await;
        f.queue.maintain().await;
        let held = f
            .queue
            .schedule(task("queued", Default::default()), Duration::from_secs(60), vec![])
            .await
            .handle()
            .unwrap();

        f.queue.clear().await;
        let counts = f.queue.counts().await;
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 1);
        assert_eq!(held.wait().await, CompletionState::Cancelled);

        let report = f.completions.recv().await.unwrap();
        f.computers.complete(report.slot.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_down_stops_matching() {
        let f = fixture();
        f.computers.add_node(Node::new("worker", 1));
        f.queue.quiet_down();
        f.queue
            .schedule(task("held", Default::default()), Duration::ZERO, vec![])
            .await;
        f.queue.maintain().await;
        let counts = f.queue.counts().await;
        assert_eq!(counts.buildable, 1);
        assert_eq!(counts.pending, 0);
        let snaps = f.queue.snapshot().await;
        assert_eq!(
            snaps[0].why.as_deref(),
            Some("The engine is shutting down")
        );
        drop(f.completions);
    }
}
