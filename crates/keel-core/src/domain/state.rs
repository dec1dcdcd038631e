//! State - タスクの実行状態
//!
//! TaskDefinition とは別キーに保存し、状態の更新で定義を書き換えないようにします。
//!
//! # 状態遷移
//! - CanRun -> Running: worker に割り当て（runtime_node を設定）
//! - Running -> CanRun: ノード消失・patrol による補正
//! - * -> Stopped: stop 要求
//! - * -> Failed: worker が失敗を報告

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    CanRun,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::CanRun => "CanRun",
            RunState::Running => "Running",
            RunState::Stopped => "Stopped",
            RunState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// The last administrative request applied to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Create,
    Update,
    Stop,
    Delete,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskAction::Create => "create",
            TaskAction::Update => "update",
            TaskAction::Stop => "stop",
            TaskAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Mutable runtime status of one logical task.
///
/// Invariant: an empty `runtime_node` implies `in_runtime == false`.
/// All transitions go through the methods below so the invariant holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: TaskId,
    pub task_name: String,
    pub state: RunState,
    pub action: TaskAction,

    /// Registry key of the worker the task is bound to (empty when unbound).
    #[serde(default)]
    pub runtime_node: String,

    /// Set once the bound worker confirms it is executing the task.
    #[serde(default)]
    pub in_runtime: bool,

    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl TaskState {
    pub fn new(task_id: TaskId, task_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            state: RunState::CanRun,
            action: TaskAction::Create,
            runtime_node: String::new(),
            in_runtime: false,
            create_time: now,
            update_time: now,
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.runtime_node.is_empty()
    }

    pub fn is_bound_to(&self, node: &str) -> bool {
        self.is_bound() && self.runtime_node == node
    }

    /// Member of the assignment pool: runnable, unbound, and not being torn down.
    pub fn is_assignable(&self) -> bool {
        self.state == RunState::CanRun
            && !self.is_bound()
            && !matches!(self.action, TaskAction::Stop | TaskAction::Delete)
    }

    /// Optimistically bind to a worker; `in_runtime` waits for the worker's confirmation.
    pub fn bind(&mut self, node: impl Into<String>, now: DateTime<Utc>) {
        self.runtime_node = node.into();
        self.in_runtime = false;
        self.state = RunState::Running;
        self.update_time = now;
    }

    /// Drop the worker binding. A Running task goes back to CanRun; Stopped/Failed stay put.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.runtime_node.clear();
        self.in_runtime = false;
        if self.state == RunState::Running {
            self.state = RunState::CanRun;
        }
        self.update_time = now;
    }

    pub fn confirm_in_runtime(&mut self, now: DateTime<Utc>) {
        if self.is_bound() {
            self.in_runtime = true;
            self.state = RunState::Running;
            self.update_time = now;
        }
    }

    pub fn mark(&mut self, action: TaskAction, now: DateTime<Utc>) {
        self.action = action;
        self.update_time = now;
    }

    pub fn stop(&mut self, now: DateTime<Utc>) {
        self.release(now);
        self.action = TaskAction::Stop;
        self.state = RunState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn fresh() -> TaskState {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TaskState::new(TaskId::from_ulid(Ulid::new()), "build-1", t0)
    }

    #[test]
    fn new_state_is_assignable() {
        let s = fresh();
        assert_eq!(s.state, RunState::CanRun);
        assert_eq!(s.action, TaskAction::Create);
        assert!(s.is_assignable());
        assert!(!s.in_runtime);
    }

    #[test]
    fn release_clears_binding_and_in_runtime() {
        let mut s = fresh();
        s.bind("w1", Utc::now());
        s.confirm_in_runtime(Utc::now());
        assert!(s.in_runtime);
        assert_eq!(s.state, RunState::Running);

        s.release(Utc::now());
        assert!(!s.is_bound());
        assert!(!s.in_runtime);
        assert_eq!(s.state, RunState::CanRun);
    }

    #[test]
    fn confirm_requires_binding() {
        let mut s = fresh();
        s.confirm_in_runtime(Utc::now());
        assert!(!s.in_runtime);
    }

    #[test]
    fn stopped_task_leaves_the_pool() {
        let mut s = fresh();
        s.bind("w1", Utc::now());
        s.stop(Utc::now());
        assert_eq!(s.state, RunState::Stopped);
        assert!(!s.is_bound());
        assert!(!s.is_assignable());

        // release keeps Stopped
        s.release(Utc::now());
        assert_eq!(s.state, RunState::Stopped);
    }

    #[test]
    fn serialized_form_uses_wire_names() {
        let s = fresh();
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["state"], "CanRun");
        assert_eq!(v["action"], "create");
        assert_eq!(v["runtime_node"], "");
    }
}
