//! WorkerChannel port - bound worker へのコマンド送信
//!
//! コマンドは worker のセッション経由で push します（ポーリングはしない）。
//! 実装は `app::session::SessionManager` です。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{Result, WorkerCommand};

/// What a worker last told this gateway about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub last_seen: Instant,
    /// `None` until the worker sends a heartbeat carrying a running list.
    pub running: Option<HashSet<String>>,
}

impl WorkerReport {
    pub fn is_stale(&self, window: Duration) -> bool {
        self.last_seen.elapsed() > window
    }

    /// Whether the report contradicts `task_name` being executed.
    /// Workers that never report a running list are trusted.
    pub fn denies(&self, task_name: &str) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.contains(task_name))
    }
}

#[async_trait]
pub trait WorkerChannel: Send + Sync {
    /// Fire-and-forget delivery. Errors with `Transport` when the worker has no session here.
    async fn push(&self, worker: &str, command: WorkerCommand) -> Result<()>;

    /// Delivers and waits for the worker's ack. `Ok(false)` means the wait timed out.
    async fn push_and_wait(
        &self,
        worker: &str,
        command: WorkerCommand,
        timeout: Duration,
    ) -> Result<bool>;

    /// Workers bound to a session on this gateway.
    fn connected(&self) -> Vec<String>;

    fn report(&self, worker: &str) -> Option<WorkerReport>;

    /// Tasks the worker is believed to be running, used to pick the least
    /// loaded worker. Defaults to the size of its last running list.
    fn load(&self, worker: &str) -> usize {
        self.report(worker)
            .and_then(|r| r.running.map(|running| running.len()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_workers_are_trusted() {
        let report = WorkerReport {
            last_seen: Instant::now(),
            running: None,
        };
        assert!(!report.denies("a"));
    }

    #[test]
    fn running_list_is_authoritative() {
        let report = WorkerReport {
            last_seen: Instant::now(),
            running: Some(HashSet::from(["a".to_string()])),
        };
        assert!(!report.denies("a"));
        assert!(report.denies("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_uses_last_seen() {
        let report = WorkerReport {
            last_seen: Instant::now(),
            running: None,
        };
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(report.is_stale(Duration::from_secs(10)));
        assert!(!report.is_stale(Duration::from_secs(12)));
    }
}
