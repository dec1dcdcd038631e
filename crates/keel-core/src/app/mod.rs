//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **GateBuilder / Gate**: gate の構築、起動、停止
//! - **NodeRegistry**: lease 付きのノード登録と liveness watch
//! - **TaskStore**: タスク定義と実行状態（create / update / stop / delete / list）
//! - **SessionManager**: worker セッションと heartbeat の中継
//! - **ReassignmentEngine**: ノード消失・起動時 reconcile・pool の割り当て
//! - **ReaperLoop**: liveness イベントを ReassignmentEngine に流す
//! - **PatrolLoop**: 実行状態の抜き取り検査
//! - **LeaseLock**: lease 付きキーによるタスク単位のロック

pub mod builder;
pub mod lock;
pub mod patrol_loop;
pub mod reaper_loop;
pub mod reassign;
pub mod registry;
pub mod retry;
pub mod session;
pub mod status;
pub mod task_store;

// 主要な型を再エクスポート
pub use self::builder::{Gate, GateBuilder};
pub use self::lock::{LeaseLock, LockGuard};
pub use self::patrol_loop::{PatrolLoop, PatrolReport};
pub use self::reaper_loop::ReaperLoop;
pub use self::reassign::{ReassignmentEngine, ReconcileReport};
pub use self::registry::{LivenessWatch, NodeRegistry};
pub use self::retry::RetryPolicy;
pub use self::session::{Session, SessionManager, SessionSignal, SessionState};
pub use self::status::{
    ListQuery, OutputFormat, StatusOutput, StatusQuery, TaskPage, TaskStatusItem, query_status,
};
pub use self::task_store::{StoredState, TaskStore};
