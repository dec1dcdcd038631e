//! TaskStore - タスク定義と実行状態の読み書き
//!
//! # 学習ポイント
//! - 定義キーと状態キーは 1 トランザクションで作成・削除する（片方だけ残らない）
//! - 状態の更新は mod_revision による CAS + 有限回リトライ
//! - 実行中の worker へのコマンドはベストエフォート（失敗はログのみ）

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::app::status::{ListQuery, TaskPage, TaskStatusItem};
use crate::domain::keys::{self, TASK_STATE_PREFIX, name_from_key, prefix_end};
use crate::domain::{
    GateError, NodeKind, Result, TaskAction, TaskDefinition, TaskState, WorkerCommand,
};
use crate::ports::{
    Clock, Compare, CompareOp, CoordinationService, IdGenerator, RangeEnd, RangeRequest,
    Revision, SortOrder, Txn, TxnOp, WorkerChannel,
};

/// CAS retries before a state mutation gives up with `TransactionConflict`.
const MAX_CAS_ATTEMPTS: usize = 8;

const PIVOT_ALPHABET: &[u8] = b"-.0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Two random characters from the usual task-name alphabet.
fn random_pivot() -> String {
    let mut rng = rand::thread_rng();
    (0..2)
        .filter_map(|_| PIVOT_ALPHABET.choose(&mut rng).map(|b| *b as char))
        .collect()
}

/// A state record together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub state: TaskState,
    pub mod_revision: Revision,
}

pub struct TaskStore {
    coord: Arc<dyn CoordinationService>,
    channel: Arc<dyn WorkerChannel>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    ack_timeout: Duration,
}

impl TaskStore {
    pub fn new(
        coord: Arc<dyn CoordinationService>,
        channel: Arc<dyn WorkerChannel>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            coord,
            channel,
            clock,
            ids,
            ack_timeout,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persists a new task and its initial `CanRun` state atomically.
    pub async fn create(&self, definition: TaskDefinition) -> Result<TaskState> {
        definition.validate()?;
        let name = definition.task_name.clone();
        let task_key = keys::task_path(&name);
        let state_key = keys::state_path(&name);

        // keys-only の事前チェック。競合はトランザクションで最終判定する
        let existing = self
            .coord
            .range(RangeRequest {
                end: RangeEnd::Single,
                ..RangeRequest::prefix(task_key.clone())
            }
            .keys_only())
            .await?;
        if !existing.kvs.is_empty() {
            return Err(GateError::DuplicateTask(task_key));
        }

        let state = TaskState::new(self.ids.generate_task_id(), name.as_str(), self.clock.now());
        let txn = Txn::new()
            .when(Compare::absent(task_key.clone()))
            .when(Compare::absent(state_key.clone()))
            .then(TxnOp::put(task_key.clone(), serde_json::to_string(&definition)?))
            .then(TxnOp::put(state_key, serde_json::to_string(&state)?));

        let response = self.coord.txn(txn).await?;
        if !response.succeeded {
            warn!(task = %name, "create lost a write race");
            return Err(GateError::TransactionConflict(task_key));
        }

        info!(task = %name, task_id = %state.task_id, revision = response.revision, "task created");
        Ok(state)
    }

    pub async fn get(&self, task_name: &str) -> Result<Option<StoredState>> {
        let Some(kv) = self.coord.get(&keys::state_path(task_name)).await? else {
            return Ok(None);
        };
        Ok(Some(StoredState {
            state: serde_json::from_str(&kv.value)?,
            mod_revision: kv.mod_revision,
        }))
    }

    pub async fn definition(&self, task_name: &str) -> Result<Option<TaskDefinition>> {
        let Some(kv) = self.coord.get(&keys::task_path(task_name)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&kv.value)?))
    }

    /// Full scan of every state record. Undecodable records are skipped with a warning.
    pub async fn states(&self) -> Result<Vec<StoredState>> {
        let response = self
            .coord
            .range(RangeRequest::prefix(TASK_STATE_PREFIX))
            .await?;
        Ok(response
            .kvs
            .into_iter()
            .filter_map(|kv| match serde_json::from_str::<TaskState>(&kv.value) {
                Ok(state) => Some(StoredState {
                    state,
                    mod_revision: kv.mod_revision,
                }),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping undecodable task state");
                    None
                }
            })
            .collect())
    }

    /// Up to `limit` task names, read keys-only from a random point of the
    /// state range and wrapping around to its start.
    ///
    /// At most two bounded range reads; the whole range is never scanned.
    pub async fn sample_names(&self, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let pivot = format!("{TASK_STATE_PREFIX}{}", random_pivot());
        let mut kvs = self
            .coord
            .range(
                RangeRequest::between(pivot.clone(), prefix_end(TASK_STATE_PREFIX))
                    .with_limit(limit)
                    .keys_only(),
            )
            .await?
            .kvs;
        if kvs.len() < limit {
            let wrapped = self
                .coord
                .range(
                    RangeRequest::between(TASK_STATE_PREFIX, pivot)
                        .with_limit(limit - kvs.len())
                        .keys_only(),
                )
                .await?;
            kvs.extend(wrapped.kvs);
        }
        Ok(kvs
            .iter()
            .filter_map(|kv| name_from_key(TASK_STATE_PREFIX, &kv.key).map(str::to_string))
            .collect())
    }

    /// Read-modify-write of one state record, guarded on its mod_revision.
    ///
    /// `mutate` returns `false` to leave the record untouched; then `Ok(None)` is returned.
    /// It may run several times, once per attempt.
    pub async fn mutate_state<F>(&self, task_name: &str, mut mutate: F) -> Result<Option<TaskState>>
    where
        F: FnMut(&mut TaskState, DateTime<Utc>) -> bool + Send,
    {
        let state_key = keys::state_path(task_name);
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(StoredState {
                mut state,
                mod_revision,
            }) = self.get(task_name).await?
            else {
                return Err(GateError::NotFound(task_name.to_string()));
            };

            if !mutate(&mut state, self.clock.now()) {
                return Ok(None);
            }

            let txn = Txn::new()
                .when(Compare::mod_revision(
                    state_key.clone(),
                    CompareOp::Equal,
                    mod_revision,
                ))
                .then(TxnOp::put(state_key.clone(), serde_json::to_string(&state)?));
            if self.coord.txn(txn).await?.succeeded {
                return Ok(Some(state));
            }
            debug!(task = %task_name, attempt, "state changed underneath; retrying");
        }
        Err(GateError::TransactionConflict(state_key))
    }

    /// Records that the bound worker confirmed the task is executing.
    ///
    /// Returns `false` when the task is gone or bound elsewhere.
    pub async fn mark_in_runtime(&self, task_name: &str, worker: &str) -> Result<bool> {
        let result = self
            .mutate_state(task_name, |state, now| {
                if state.is_bound_to(worker) && !state.in_runtime {
                    state.confirm_in_runtime(now);
                    true
                } else {
                    false
                }
            })
            .await;
        match result {
            Ok(updated) => {
                if updated.is_some() {
                    debug!(task = %task_name, worker = %worker, "task confirmed in runtime");
                }
                Ok(updated.is_some())
            }
            Err(GateError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replaces the definition (last writer wins) and forwards it to the bound worker.
    pub async fn update(&self, task_name: &str, definition: TaskDefinition) -> Result<()> {
        definition.validate()?;
        if definition.task_name != task_name {
            return Err(GateError::Validation(format!(
                "task_name {:?} does not match path {:?}",
                definition.task_name, task_name
            )));
        }

        let task_key = keys::task_path(task_name);
        let txn = Txn::new()
            .when(Compare::exists(task_key.clone()))
            .then(TxnOp::put(task_key, serde_json::to_string(&definition)?));
        if !self.coord.txn(txn).await?.succeeded {
            return Err(GateError::NotFound(task_name.to_string()));
        }

        let Some(state) = self
            .mutate_state(task_name, |state, now| {
                state.mark(TaskAction::Update, now);
                true
            })
            .await?
        else {
            return Ok(());
        };

        if state.is_bound() {
            let worker = state.runtime_node.as_str();
            if let Err(e) = self
                .channel
                .push(worker, WorkerCommand::Update { definition })
                .await
            {
                warn!(task = %task_name, worker = %worker, error = %e, "update not delivered");
            }
        }
        info!(task = %task_name, "task updated");
        Ok(())
    }

    /// Stops the task and takes it out of the assignment pool. Nothing is deleted.
    pub async fn stop(&self, task_name: &str) -> Result<()> {
        let mut bound_worker = None;
        self.mutate_state(task_name, |state, now| {
            bound_worker = state.is_bound().then(|| state.runtime_node.clone());
            state.stop(now);
            true
        })
        .await?;

        if let Some(worker) = bound_worker {
            let command = WorkerCommand::Stop {
                task_name: task_name.to_string(),
            };
            if let Err(e) = self.channel.push(&worker, command).await {
                warn!(task = %task_name, worker = %worker, error = %e, "stop not delivered");
            }
        }
        info!(task = %task_name, "task stopped");
        Ok(())
    }

    /// Marks the task for deletion, asks the bound worker to drop it, then removes both records.
    ///
    /// A worker that does not acknowledge within the ack timeout does not block the removal.
    pub async fn delete(&self, task_name: &str) -> Result<()> {
        let mut bound_worker = None;
        self.mutate_state(task_name, |state, now| {
            bound_worker = state.is_bound().then(|| state.runtime_node.clone());
            state.mark(TaskAction::Delete, now);
            true
        })
        .await?;

        if let Some(worker) = bound_worker {
            let command = WorkerCommand::Delete {
                task_name: task_name.to_string(),
            };
            match self
                .channel
                .push_and_wait(&worker, command, self.ack_timeout)
                .await
            {
                Ok(true) => debug!(task = %task_name, worker = %worker, "delete acknowledged"),
                Ok(false) => warn!(task = %task_name, worker = %worker, "delete not acknowledged in time"),
                Err(e) => warn!(task = %task_name, worker = %worker, error = %e, "delete not delivered"),
            }
        }

        let txn = Txn::new()
            .then(TxnOp::delete(keys::task_path(task_name)))
            .then(TxnOp::delete(keys::state_path(task_name)));
        self.coord.txn(txn).await?;
        info!(task = %task_name, "task deleted");
        Ok(())
    }

    /// Number of state records.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.coord.count_prefix(TASK_STATE_PREFIX).await?)
    }

    /// One task's state with its worker address.
    pub async fn status(&self, task_name: &str) -> Result<Option<TaskStatusItem>> {
        let Some(stored) = self.get(task_name).await? else {
            return Ok(None);
        };
        let runtime_ip = self.runtime_address(&stored.state).await;
        Ok(Some(TaskStatusItem {
            state: stored.state,
            runtime_ip,
        }))
    }

    /// One page of task states ordered by key, with each bound worker's address.
    pub async fn list(&self, query: &ListQuery) -> Result<TaskPage> {
        if let Some(start) = query.start_key.as_deref()
            && !start.starts_with(TASK_STATE_PREFIX)
        {
            return Err(GateError::Validation(format!(
                "start_key {start:?} is outside {TASK_STATE_PREFIX}"
            )));
        }
        if query.limit == 0 {
            return Err(GateError::Validation("limit must be positive".to_string()));
        }

        let upper = prefix_end(TASK_STATE_PREFIX);
        let request = match query.order {
            SortOrder::Ascend => RangeRequest::between(
                query.start_key.as_deref().unwrap_or(TASK_STATE_PREFIX),
                upper,
            ),
            // 降順のトークンは「このキー未満」を意味する
            SortOrder::Descend => RangeRequest::between(
                TASK_STATE_PREFIX,
                query.start_key.clone().unwrap_or(upper),
            ),
        }
        .with_limit(query.limit)
        .with_order(query.order);

        let response = self.coord.range(request).await?;
        let total = self.count().await?;

        let next_start_key = match (response.more, response.kvs.last()) {
            (true, Some(last)) => match query.order {
                SortOrder::Ascend => format!("{}\0", last.key),
                SortOrder::Descend => last.key.clone(),
            },
            _ => String::new(),
        };

        let mut items = Vec::with_capacity(response.kvs.len());
        for kv in response.kvs {
            let state: TaskState = serde_json::from_str(&kv.value)?;
            let runtime_ip = self.runtime_address(&state).await;
            items.push(TaskStatusItem { state, runtime_ip });
        }

        Ok(TaskPage {
            total,
            items,
            start_key: next_start_key,
        })
    }

    async fn runtime_address(&self, state: &TaskState) -> String {
        if !state.is_bound() {
            return String::new();
        }
        match self
            .coord
            .get(&keys::node_path(NodeKind::Runtime, &state.runtime_node))
            .await
        {
            Ok(kv) => kv.map(|kv| kv.value).unwrap_or_default(),
            Err(e) => {
                warn!(task = %state.task_name, worker = %state.runtime_node, error = %e, "worker address lookup failed");
                String::new()
            }
        }
    }
}
