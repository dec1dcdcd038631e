//! LeastLoadedDispatch - 担当タスク数が最少の worker を選ぶ
//!
//! 同じ負荷の worker が複数いる場合は、呼び出しごとにローテーションして
//! 同じ worker に偏らないようにします。

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ports::{DispatchStrategy, WorkerCandidate};

#[derive(Debug, Default)]
pub struct LeastLoadedDispatch {
    cursor: AtomicUsize,
}

impl LeastLoadedDispatch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DispatchStrategy for LeastLoadedDispatch {
    fn select_worker(&self, _task_name: &str, candidates: &[WorkerCandidate]) -> Option<String> {
        let min_load = candidates.iter().map(|c| c.load).min()?;
        let mut tied: Vec<&WorkerCandidate> =
            candidates.iter().filter(|c| c.load == min_load).collect();
        tied.sort_by(|a, b| a.name.cmp(&b.name));

        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(tied[turn % tied.len()].name.clone())
    }
}
