//! Live node state: computers and their executor slots.
//!
//! A `Computer` exists while a configured node is part of the pool; each
//! of its executor slots is a long-lived tokio task that waits for a
//! [`WorkUnit`], runs the task's executable to a [`BuildResult`], and
//! reports completion. The queue reads idle/busy state and writes
//! assignments through [`ComputerSet`] under its own lock discipline.

use crate::load::{LoadSample, LoadSnapshot, LoadStatistics};
use crate::node::Node;
use crate::work::{CompletionReport, SlotId, WorkUnit};
use crucible_core::ids::{BuildId, NodeId, TaskId};
use crucible_core::interrupt::Interrupt;
use crucible_core::result::BuildResult;
use crucible_core::task::ExecutionContext;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Aggregated executor counts across online computers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorCounts {
    pub online: usize,
    pub busy: usize,
    pub idle: usize,
}

/// What one slot is currently running.
#[derive(Debug, Clone)]
pub struct OccupantView {
    pub task_id: TaskId,
    pub task_name: String,
    pub build_id: BuildId,
    pub concurrent: bool,
    pub non_blocking: bool,
}

/// Read-only view of one computer, consumed by the load balancer.
#[derive(Debug, Clone)]
pub struct ComputerView {
    pub node: Node,
    pub online: bool,
    pub accepting: bool,
    pub idle_slots: Vec<usize>,
    pub occupants: Vec<OccupantView>,
}

struct Occupant {
    item_id: crucible_core::ids::ItemId,
    task_id: TaskId,
    task_name: String,
    build_id: BuildId,
    build_number: u32,
    concurrent: bool,
    non_blocking: bool,
    interrupt: Interrupt,
}

struct ExecutorSlot {
    number: usize,
    tx: mpsc::Sender<WorkUnit>,
    busy: Option<Occupant>,
    marked_for_removal: bool,
    handle: JoinHandle<()>,
}

struct Computer {
    node: Node,
    online: bool,
    offline_cause: Option<String>,
    /// False while the node is draining for removal: busy executors
    /// finish, nothing new is assigned.
    accepting: bool,
    removing: bool,
    executors: Vec<ExecutorSlot>,
    next_slot: usize,
    load: LoadStatistics,
}

impl Computer {
    fn live_count(&self) -> usize {
        self.executors.len()
    }

    fn idle_count(&self) -> usize {
        self.executors.iter().filter(|s| s.busy.is_none()).count()
    }
}

/// The pool of computers. Owned by the engine; the queue only reads
/// executor state and writes work-unit assignments through it.
pub struct ComputerSet {
    inner: Arc<Mutex<Vec<Computer>>>,
    completions: mpsc::UnboundedSender<CompletionReport>,
}

impl ComputerSet {
    pub fn new(completions: mpsc::UnboundedSender<CompletionReport>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            completions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Computer>> {
        // A panic while holding this lock is a bug in the pool itself;
        // recover the data rather than poisoning every later caller.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bring a configured node online with its executor slots.
    pub fn add_node(&self, node: Node) {
        let mut computers = self.lock();
        let mut computer = Computer {
            online: true,
            offline_cause: None,
            accepting: true,
            removing: false,
            executors: Vec::with_capacity(node.num_executors),
            next_slot: 0,
            load: LoadStatistics::new(),
            node,
        };
        for _ in 0..computer.node.num_executors {
            let slot = spawn_slot(&computer.node, computer.next_slot, self.completions.clone());
            computer.next_slot += 1;
            computer.executors.push(slot);
        }
        debug!(node = %computer.node.name, executors = computer.node.num_executors, "node added to pool");
        computers.push(computer);
    }

    /// Begin removing a node. Idle executors go away immediately; busy
    /// ones finish their current work first. Returns true when the
    /// computer was fully removed synchronously.
    pub fn remove_node(&self, id: NodeId) -> bool {
        let mut computers = self.lock();
        let Some(pos) = computers.iter().position(|c| c.node.id == id) else {
            return false;
        };
        let computer = &mut computers[pos];
        computer.accepting = false;
        computer.executors.retain(|s| s.busy.is_some());
        if computer.executors.is_empty() {
            computers.remove(pos);
            return true;
        }
        for slot in &mut computer.executors {
            slot.marked_for_removal = true;
        }
        computer.removing = true;
        false
    }

    pub fn set_online(&self, id: NodeId, online: bool, cause: Option<String>) -> bool {
        let mut computers = self.lock();
        match computers.iter_mut().find(|c| c.node.id == id) {
            Some(c) => {
                c.online = online;
                c.offline_cause = if online { None } else { cause };
                true
            }
            None => false,
        }
    }

    /// Reconfigure a node's executor count.
    ///
    /// Growing spawns fresh slots immediately. Shrinking removes idle
    /// slots now and marks busy ones for removal on completion, so the
    /// live count only ever approaches the configured count from above.
    pub fn set_num_executors(&self, id: NodeId, count: usize) -> bool {
        let mut computers = self.lock();
        let Some(computer) = computers.iter_mut().find(|c| c.node.id == id) else {
            return false;
        };
        computer.node.num_executors = count;

        while computer.live_count() < count {
            let slot = spawn_slot(&computer.node, computer.next_slot, self.completions.clone());
            computer.next_slot += 1;
            computer.executors.push(slot);
        }

        let mut excess = computer.live_count().saturating_sub(count);
        if excess > 0 {
            // Idle slots first, newest first.
            let mut keep = Vec::with_capacity(computer.executors.len());
            for slot in computer.executors.drain(..).rev() {
                if excess > 0 && slot.busy.is_none() {
                    excess -= 1;
                    // Dropped: the sender goes away and the loop exits.
                } else {
                    keep.push(slot);
                }
            }
            keep.reverse();
            computer.executors = keep;
            // Still over target: busy slots finish, then leave.
            let over = computer.live_count().saturating_sub(count);
            for slot in computer
                .executors
                .iter_mut()
                .rev()
                .filter(|s| s.busy.is_some())
                .take(over)
            {
                slot.marked_for_removal = true;
            }
        }
        true
    }

    /// Views for the load balancer and status snapshots.
    pub fn views(&self) -> Vec<ComputerView> {
        self.lock()
            .iter()
            .map(|c| ComputerView {
                node: c.node.clone(),
                online: c.online,
                accepting: c.accepting,
                idle_slots: c
                    .executors
                    .iter()
                    .filter(|s| s.busy.is_none() && !s.marked_for_removal)
                    .map(|s| s.number)
                    .collect(),
                occupants: c
                    .executors
                    .iter()
                    .filter_map(|s| s.busy.as_ref())
                    .map(|o| OccupantView {
                        task_id: o.task_id.clone(),
                        task_name: o.task_name.clone(),
                        build_id: o.build_id,
                        concurrent: o.concurrent,
                        non_blocking: o.non_blocking,
                    })
                    .collect(),
            })
            .collect()
    }

    /// Hand a work unit to an idle slot. Fails if the slot went away or
    /// became busy since the caller looked.
    pub fn try_assign(&self, slot_id: SlotId, work: WorkUnit) -> bool {
        let mut computers = self.lock();
        let Some(computer) = computers
            .iter_mut()
            .find(|c| c.node.id == slot_id.node && c.online && c.accepting)
        else {
            return false;
        };
        let Some(slot) = computer
            .executors
            .iter_mut()
            .find(|s| s.number == slot_id.number && s.busy.is_none() && !s.marked_for_removal)
        else {
            return false;
        };
        let occupant = Occupant {
            item_id: work.item_id,
            build_number: work.build_number,
            task_id: work.task.id.clone(),
            task_name: work.task.display_name.clone(),
            build_id: work.build_id,
            concurrent: work.task.concurrent_build,
            non_blocking: work.task.non_blocking,
            interrupt: work.interrupt.clone(),
        };
        match slot.tx.try_send(work) {
            Ok(()) => {
                slot.busy = Some(occupant);
                true
            }
            Err(err) => {
                warn!(node = %computer.node.name, slot = slot_id.number, %err, "slot refused work");
                false
            }
        }
    }

    /// Mark a slot idle again after its work completed, honoring any
    /// pending removal.
    pub fn complete(&self, slot_id: SlotId) {
        let mut computers = self.lock();
        let Some(pos) = computers.iter().position(|c| c.node.id == slot_id.node) else {
            return;
        };
        let computer = &mut computers[pos];
        if let Some(slot_pos) = computer
            .executors
            .iter()
            .position(|s| s.number == slot_id.number)
        {
            computer.executors[slot_pos].busy = None;
            if computer.executors[slot_pos].marked_for_removal {
                computer.executors.remove(slot_pos);
            }
        }
        if computer.removing && computer.executors.is_empty() {
            computers.remove(pos);
        }
    }

    /// Fire the interrupt of whichever slot is running the given build.
    pub fn interrupt_build(&self, build_id: BuildId) -> bool {
        let computers = self.lock();
        for computer in computers.iter() {
            for slot in &computer.executors {
                if let Some(occ) = &slot.busy
                    && occ.build_id == build_id
                {
                    occ.interrupt.fire();
                    return true;
                }
            }
        }
        false
    }

    /// Replace executors whose tasks died without reporting.
    ///
    /// A dead slot is removed; its in-flight build, if any, is reported
    /// as failed so the queue does not wait forever; a replacement is
    /// spawned while the configured count requires one. Never surfaces
    /// to the queue as a scheduling error.
    pub fn yank_dead(&self) {
        let mut computers = self.lock();
        for computer in computers.iter_mut() {
            let mut dead = Vec::new();
            computer.executors.retain_mut(|slot| {
                // A slot in the vec still holds its sender, so a finished
                // loop can only mean the executor task died.
                if slot.handle.is_finished() {
                    if let Some(occ) = slot.busy.take() {
                        dead.push((slot.number, occ));
                    }
                    return false;
                }
                true
            });
            for (number, occ) in dead {
                warn!(node = %computer.node.name, slot = number, task = %occ.task_name, "executor died; yanking");
                let _ = self.completions.send(CompletionReport {
                    item_id: occ.item_id,
                    task_id: occ.task_id,
                    task_name: occ.task_name,
                    build_id: occ.build_id,
                    build_number: occ.build_number,
                    result: BuildResult::Failure,
                    slot: None,
                });
            }
            while computer.accepting && computer.live_count() < computer.node.num_executors {
                let slot = spawn_slot(&computer.node, computer.next_slot, self.completions.clone());
                computer.next_slot += 1;
                computer.executors.push(slot);
            }
        }
    }

    pub fn executor_counts(&self) -> ExecutorCounts {
        let computers = self.lock();
        let mut counts = ExecutorCounts::default();
        for c in computers.iter().filter(|c| c.online) {
            counts.online += c.live_count();
            counts.idle += c.idle_count();
        }
        counts.busy = counts.online - counts.idle;
        counts
    }

    /// Feed the per-computer statistics from the shared clock tick.
    pub fn update_load_statistics(&self, queue_lengths: &HashMap<NodeId, usize>) {
        let mut computers = self.lock();
        for c in computers.iter_mut() {
            let online = if c.online { c.live_count() } else { 0 };
            let idle = if c.online { c.idle_count() } else { 0 };
            c.load.update(LoadSample {
                busy_executors: online - idle,
                online_executors: online,
                idle_executors: idle,
                queue_length: queue_lengths.get(&c.node.id).copied().unwrap_or(0),
            });
        }
    }

    pub fn load_snapshot(&self, id: NodeId) -> Option<LoadSnapshot> {
        self.lock()
            .iter()
            .find(|c| c.node.id == id)
            .map(|c| c.load.snapshot())
    }
}

fn spawn_slot(
    node: &Node,
    number: usize,
    completions: mpsc::UnboundedSender<CompletionReport>,
) -> ExecutorSlot {
    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(executor_loop(
        node.name.clone(),
        node.id,
        number,
        rx,
        completions,
    ));
    ExecutorSlot {
        number,
        tx,
        busy: None,
        marked_for_removal: false,
        handle,
    }
}

/// The executor contract: idle, receive work, run it synchronously on
/// this task, report the terminal result, loop. Interruption surfaces as
/// an aborted build; a panicking executable is caught here and reported
/// as a failure, never propagated.
async fn executor_loop(
    node_name: String,
    node_id: NodeId,
    number: usize,
    mut rx: mpsc::Receiver<WorkUnit>,
    completions: mpsc::UnboundedSender<CompletionReport>,
) {
    while let Some(work) = rx.recv().await {
        debug!(node = %node_name, slot = number, task = %work.task.display_name, "executor starting");
        let ctx = ExecutionContext {
            build_id: work.build_id,
            build_number: work.build_number,
            combination: work.task.combination().cloned(),
            interrupt: work.interrupt.clone(),
        };
        let outcome = AssertUnwindSafe(work.task.runner.run(ctx))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(_) if work.interrupt.is_interrupted() => BuildResult::Aborted,
            Ok(result) => result,
            Err(_) => {
                warn!(node = %node_name, slot = number, task = %work.task.display_name, "executable panicked");
                BuildResult::Failure
            }
        };
        let report = CompletionReport {
            item_id: work.item_id,
            task_id: work.task.id.clone(),
            task_name: work.task.display_name.clone(),
            build_id: work.build_id,
            build_number: work.build_number,
            result,
            slot: Some(SlotId {
                node: node_id,
                number,
            }),
        };
        if completions.send(report).is_err() {
            // Engine gone; nothing left to report to.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crucible_core::ids::{ItemId, ProjectId};
    use crucible_core::task::{Task, TaskKind, TaskRunner};
    use std::sync::Arc;
    use std::time::Duration;

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

    fn task(name: &str, duration: Duration) -> Task {
        let project = ProjectId::new();
        Task {
            id: crucible_core::ids::TaskId::project(project),
            kind: TaskKind::Project,
            display_name: name.to_string(),
            assigned_label: None,
            estimated_duration: Some(duration),
            concurrent_build: false,
            non_blocking: false,
            enabled: true,
            resources: Default::default(),
            owner: project,
            runner: Arc::new(SleepRunner(duration)),
        }
    }

    fn work(task: Task) -> WorkUnit {
        WorkUnit {
            item_id: ItemId(1),
            build_id: BuildId::new(),
            build_number: 1,
            interrupt: Interrupt::new(),
            actions: vec![],
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_assign_run_complete() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let set = ComputerSet::new(tx);
        let node = Node::new("worker", 1);
        let node_id = node.id;
        set.add_node(node);

        let slot = SlotId {
            node: node_id,
            number: 0,
        };
        assert!(set.try_assign(slot, work(task("build", Duration::from_secs(1)))));
        // Slot is busy until completion is acknowledged.
        assert!(!set.try_assign(slot, work(task("second", Duration::from_secs(1)))));

        let report = rx.recv().await.unwrap();
        assert_eq!(report.result, BuildResult::Success);
        set.complete(slot);
        assert_eq!(set.executor_counts().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_converges_from_above() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let set = ComputerSet::new(tx);
        let node = Node::new("worker", 3);
        let node_id = node.id;
        set.add_node(node);

        // Occupy all three slots.
        for number in 0..3 {
            let slot = SlotId {
                node: node_id,
                number,
            };
            assert!(set.try_assign(slot, work(task("busy", Duration::from_secs(5)))));
        }
        set.set_num_executors(node_id, 1);
        // All three are busy: none removed yet.
        assert_eq!(set.executor_counts().online, 3);

        for _ in 0..3 {
            let report = rx.recv().await.unwrap();
            set.complete(report.slot.unwrap());
        }
        assert_eq!(set.executor_counts().online, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_surfaces_as_aborted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let set = ComputerSet::new(tx);
        let node = Node::new("worker", 1);
        let node_id = node.id;
        set.add_node(node);

        let unit = work(task("long", Duration::from_secs(600)));
        let build_id = unit.build_id;
        let slot = SlotId {
            node: node_id,
            number: 0,
        };
        assert!(set.try_assign(slot, unit));
        assert!(set.interrupt_build(build_id));

        let report = rx.recv().await.unwrap();
        assert_eq!(report.result, BuildResult::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_node_waits_for_busy() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let set = ComputerSet::new(tx);
        let node = Node::new("worker", 2);
        let node_id = node.id;
        set.add_node(node);

        let slot = SlotId {
            node: node_id,
            number: 0,
        };
        assert!(set.try_assign(slot, work(task("busy", Duration::from_secs(2)))));
        assert!(!set.remove_node(node_id));
        // Draining node accepts nothing new.
        assert!(!set.try_assign(
            SlotId {
                node: node_id,
                number: 1
            },
            work(task("late", Duration::from_secs(1)))
        ));

        let report = rx.recv().await.unwrap();
        set.complete(report.slot.unwrap());
        assert!(set.views().is_empty());
    }
}
