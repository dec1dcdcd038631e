//! PatrolLoop - 実行状態の抜き取り検査
//!
//! # フロー
//! 1. 状態キーのランダムな位置から keys-only で `sample_size` 件だけ読む（全件は読まない）
//! 2. この gate に接続中の worker に紐づく Running タスクだけを検査
//! 3. worker の報告と食い違う / 報告が途絶えたものはノード消失と同じく pool に戻す
//! 4. 標本のうち pool にいるもの（戻したものを含む）だけを割り当て直す
//!
//! TaskDefinition は決して消しません。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::reassign::ReassignmentEngine;
use crate::app::task_store::TaskStore;
use crate::config::PatrolConfig;
use crate::domain::{Result, RunState, TaskState};
use crate::ports::{WorkerChannel, WorkerReport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatrolReport {
    pub sampled: usize,
    pub corrected: usize,
    pub assigned: usize,
}

pub struct PatrolLoop {
    store: Arc<TaskStore>,
    engine: Arc<ReassignmentEngine>,
    channel: Arc<dyn WorkerChannel>,
    config: PatrolConfig,
}

impl PatrolLoop {
    pub fn new(
        store: Arc<TaskStore>,
        engine: Arc<ReassignmentEngine>,
        channel: Arc<dyn WorkerChannel>,
        config: PatrolConfig,
    ) -> Self {
        Self {
            store,
            engine,
            channel,
            config,
        }
    }

    pub async fn patrol_once(&self) -> Result<PatrolReport> {
        let sample = self.store.sample_names(self.config.sample_size).await?;
        let connected: HashSet<String> = self.channel.connected().into_iter().collect();

        let mut report = PatrolReport {
            sampled: sample.len(),
            ..PatrolReport::default()
        };
        let mut pooled = Vec::new();
        for task_name in &sample {
            let Some(stored) = self.store.get(task_name).await? else {
                continue;
            };
            let state = stored.state;
            if state.is_assignable() {
                pooled.push(task_name.as_str());
                continue;
            }
            if state.state != RunState::Running || !state.is_bound() {
                continue;
            }
            // 他の gate に接続している worker はその gate が検査する
            if !connected.contains(&state.runtime_node) {
                continue;
            }

            let worker_report = self.channel.report(&state.runtime_node);
            let Some(reason) = self.drift(&state, worker_report.as_ref(), self.store.now()) else {
                continue;
            };
            warn!(task = %task_name, worker = %state.runtime_node, reason, "task state drifted; releasing");
            if self.engine.release(task_name, &state.runtime_node).await? {
                report.corrected += 1;
                pooled.push(task_name.as_str());
            }
        }

        for task_name in pooled {
            match self.engine.assign(task_name).await {
                Ok(Some(_)) => report.assigned += 1,
                Ok(None) => {}
                Err(e) => warn!(task = %task_name, error = %e, "patrol assignment failed"),
            }
        }
        if report.corrected > 0 || report.assigned > 0 {
            info!(sampled = report.sampled, corrected = report.corrected, assigned = report.assigned, "patrol cycle");
        } else {
            debug!(sampled = report.sampled, "patrol cycle clean");
        }
        Ok(report)
    }

    fn drift(
        &self,
        state: &TaskState,
        report: Option<&WorkerReport>,
        now: DateTime<Utc>,
    ) -> Option<&'static str> {
        let stale_after = self.config.stale_after;
        let Some(report) = report else {
            return Some("worker never reported");
        };
        if report.is_stale(stale_after) {
            return Some("worker silent past the staleness window");
        }
        if state.in_runtime && report.denies(&state.task_name) {
            return Some("worker does not report the task running");
        }
        let unconfirmed_for = (now - state.update_time).to_std().unwrap_or_default();
        if !state.in_runtime && unconfirmed_for > stale_after {
            return Some("assignment never confirmed");
        }
        None
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 起動直後は reconcile に任せる
        interval.tick().await;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.patrol_once().await {
                warn!(error = %e, "patrol cycle failed");
            }
        }
    }
}
