//! ReassignmentEngine - worker を失ったタスクの再割り当て
//!
//! # トリガー
//! 1. タスク作成: その場で 1 件だけ割り当てる（`submit`）
//! 2. ノード消失イベント: そのノードに紐づくタスクを pool に戻す
//! 3. 起動時の reconcile: ジッター後に全件走査し、死んだノードに紐づく Running をロック付きで回収
//! 4. pool の drain: 生存中かつ接続中の worker に割り当てて Run を push
//!
//! 割り当ては楽観的: 先に runtime_node を書き、push に失敗したら戻す。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::app::lock::{LeaseLock, LockGuard};
use crate::app::registry::NodeRegistry;
use crate::app::task_store::{StoredState, TaskStore};
use crate::domain::{
    GateError, NodeKind, Result, RunState, TaskDefinition, TaskState, WorkerCommand,
};
use crate::ports::{DispatchStrategy, WorkerCandidate, WorkerChannel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Orphaned tasks this coordinator released (and tried to reassign).
    pub reclaimed: usize,
    /// Orphaned tasks whose lock was held by another coordinator.
    pub skipped: usize,
}

pub struct ReassignmentEngine {
    store: Arc<TaskStore>,
    registry: Arc<NodeRegistry>,
    channel: Arc<dyn WorkerChannel>,
    dispatch: Arc<dyn DispatchStrategy>,
    lock: LeaseLock,
}

impl ReassignmentEngine {
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<NodeRegistry>,
        channel: Arc<dyn WorkerChannel>,
        dispatch: Arc<dyn DispatchStrategy>,
        lock: LeaseLock,
    ) -> Self {
        Self {
            store,
            registry,
            channel,
            dispatch,
            lock,
        }
    }

    /// Live workers holding a session here, with the load their sessions report.
    async fn candidates(&self) -> Result<Vec<WorkerCandidate>> {
        let live: HashSet<String> = self
            .registry
            .live_nodes(NodeKind::Runtime)
            .await?
            .into_iter()
            .map(|node| node.key())
            .collect();

        let mut candidates: Vec<WorkerCandidate> = self
            .channel
            .connected()
            .into_iter()
            .filter(|worker| live.contains(worker))
            .map(|name| WorkerCandidate {
                load: self.channel.load(&name),
                name,
            })
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(candidates)
    }

    /// Creates the task and offers it to a worker right away.
    ///
    /// Without a worker to take it the task waits in the pool; that is not an error.
    pub async fn submit(&self, definition: TaskDefinition) -> Result<TaskState> {
        let task_name = definition.task_name.clone();
        let state = self.store.create(definition).await?;
        match self.assign(&task_name).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!(task = %task_name, "no worker took the new task; it waits in the pool"),
            Err(e) => warn!(task = %task_name, error = %e, "assignment after create failed; task waits in the pool"),
        }
        Ok(state)
    }

    /// Releases every task bound to a lost worker, then drains the pool.
    pub async fn on_node_lost(&self, worker: &str) -> Result<usize> {
        let mut released = 0;
        for stored in self.store.states().await? {
            if !stored.state.is_bound_to(worker) {
                continue;
            }
            if self.release(&stored.state.task_name, worker).await? {
                released += 1;
            }
        }
        if released > 0 {
            info!(worker = %worker, released, "tasks released from lost worker");
        }
        self.drain_pool().await?;
        Ok(released)
    }

    /// Clears the binding if the task is still bound to `worker`.
    pub async fn release(&self, task_name: &str, worker: &str) -> Result<bool> {
        let result = self
            .store
            .mutate_state(task_name, |state, now| {
                if state.is_bound_to(worker) {
                    state.release(now);
                    true
                } else {
                    false
                }
            })
            .await;
        match result {
            Ok(updated) => Ok(updated.is_some()),
            // 並行して削除された
            Err(GateError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Assigns every task in the pool. Returns how many were delivered.
    pub async fn drain_pool(&self) -> Result<usize> {
        let states = self.store.states().await?;
        let pool: Vec<&StoredState> = states.iter().filter(|s| s.state.is_assignable()).collect();
        if pool.is_empty() {
            return Ok(0);
        }

        let mut candidates = self.candidates().await?;
        if candidates.is_empty() {
            debug!(pending = pool.len(), "no live worker connected; tasks stay in the pool");
            return Ok(0);
        }

        let mut assigned = 0;
        for stored in pool {
            let task_name = &stored.state.task_name;
            match self.assign_to_candidates(task_name, &candidates).await {
                Ok(Some(worker)) => {
                    assigned += 1;
                    if let Some(c) = candidates.iter_mut().find(|c| c.name == worker) {
                        c.load += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(task = %task_name, error = %e, "assignment failed"),
            }
        }
        Ok(assigned)
    }

    /// Assigns a single task if it is in the pool.
    pub async fn assign(&self, task_name: &str) -> Result<Option<String>> {
        let candidates = self.candidates().await?;
        self.assign_to_candidates(task_name, &candidates).await
    }

    async fn assign_to_candidates(
        &self,
        task_name: &str,
        candidates: &[WorkerCandidate],
    ) -> Result<Option<String>> {
        let Some(worker) = self.dispatch.select_worker(task_name, candidates) else {
            return Ok(None);
        };
        let Some(definition) = self.store.definition(task_name).await? else {
            return Ok(None);
        };

        let bound = self
            .store
            .mutate_state(task_name, |state, now| {
                if state.is_assignable() {
                    state.bind(worker.as_str(), now);
                    true
                } else {
                    false
                }
            })
            .await;
        match bound {
            Ok(Some(_)) => {}
            // 他の gate が先に取った / 削除された
            Ok(None) | Err(GateError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        match self
            .channel
            .push(&worker, WorkerCommand::Run { definition })
            .await
        {
            Ok(()) => {
                info!(task = %task_name, worker = %worker, "task assigned");
                Ok(Some(worker))
            }
            Err(e) => {
                warn!(task = %task_name, worker = %worker, error = %e, "run not delivered; reverting assignment");
                self.store
                    .mutate_state(task_name, |state, now| {
                        if state.is_bound_to(&worker) && !state.in_runtime {
                            state.release(now);
                            true
                        } else {
                            false
                        }
                    })
                    .await?;
                Ok(None)
            }
        }
    }

    /// Startup pass: after a random jitter, reclaims Running tasks bound to dead workers.
    ///
    /// Each task is reclaimed under a lease-backed lock so concurrent
    /// coordinators reclaim it once.
    pub async fn reconcile_on_startup(&self, max_jitter: Duration) -> Result<ReconcileReport> {
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter.as_millis() as u64);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let live: HashSet<String> = self
            .registry
            .live_nodes(NodeKind::Runtime)
            .await?
            .into_iter()
            .map(|node| node.key())
            .collect();

        let mut report = ReconcileReport::default();
        for stored in self.store.states().await? {
            let state = &stored.state;
            if state.state != RunState::Running || !state.is_bound() || live.contains(&state.runtime_node) {
                continue;
            }

            match self.reclaim_locked(&state.task_name).await {
                Ok(true) => report.reclaimed += 1,
                Ok(false) => {}
                // 他の coordinator が担当している
                Err(GateError::LockContention(_)) => report.skipped += 1,
                Err(e) if e.is_retryable() => {
                    warn!(task = %state.task_name, error = %e, "reclaim deferred to the next liveness event");
                }
                Err(e) => return Err(e),
            }
        }

        self.drain_pool().await?;
        info!(reclaimed = report.reclaimed, skipped = report.skipped, "startup reconciliation done");
        Ok(report)
    }

    async fn reclaim_locked(&self, task_name: &str) -> Result<bool> {
        let guard = self.lock.acquire(task_name).await?;
        let outcome = self.reclaim_and_assign(task_name, &guard).await;
        if let Err(e) = guard.release().await {
            debug!(task = %task_name, error = %e, "lock release failed; it will expire");
        }
        outcome
    }

    async fn reclaim_and_assign(&self, task_name: &str, guard: &LockGuard) -> Result<bool> {
        if !self.reclaim(task_name).await? {
            return Ok(false);
        }
        // 再割り当ての間だけ保持を延ばす
        if let Err(e) = guard.renew().await {
            warn!(task = %task_name, lock = %guard.key(), error = %e, "lock lost after release; task left in the pool");
            return Ok(true);
        }
        if let Err(e) = self.assign(task_name).await {
            warn!(task = %task_name, error = %e, "reclaimed task not reassigned; it waits in the pool");
        }
        Ok(true)
    }

    /// Re-reads under the lock: another coordinator may have finished first.
    async fn reclaim(&self, task_name: &str) -> Result<bool> {
        let Some(current) = self.store.get(task_name).await? else {
            return Ok(false);
        };
        let state = current.state;
        if state.state != RunState::Running || !state.is_bound() {
            return Ok(false);
        }
        if self
            .registry
            .is_live(NodeKind::Runtime, &state.runtime_node)
            .await?
        {
            return Ok(false);
        }
        info!(task = %task_name, worker = %state.runtime_node, "reclaiming task from dead worker");
        self.release(task_name, &state.runtime_node).await
    }
}
