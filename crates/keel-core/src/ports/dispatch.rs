//! DispatchStrategy port - タスクをどの worker に割り当てるか
//!
//! # デフォルト
//! - LeastLoadedDispatch: 担当タスク数が最少の worker（同数ならローテーション）

/// A live worker that holds a session on this gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCandidate {
    pub name: String,
    /// Tasks currently bound to this worker.
    pub load: usize,
}

/// DispatchStrategy は候補の中から割り当て先を 1 つ選ぶ
///
/// - 候補は呼び出し側で「生存中かつ接続中」に絞り込み済み
/// - 候補が空なら None（タスクは pool に残る）
pub trait DispatchStrategy: Send + Sync {
    fn select_worker(&self, task_name: &str, candidates: &[WorkerCandidate]) -> Option<String>;
}
