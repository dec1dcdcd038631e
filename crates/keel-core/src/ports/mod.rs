//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（coordination service、worker セッション）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - coordination service が source of truth（正本）
//! - gate プロセスはクラスタ状態をローカルに保持しない（セッション表を除く）

pub mod clock;
pub mod coordination;
pub mod dispatch;
pub mod id_generator;
pub mod worker_channel;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::coordination::{
    Compare, CompareOp, CompareTarget, CoordinationService, KeyValue, RangeEnd, RangeRequest,
    RangeResponse, Revision, SortOrder, Txn, TxnOp, TxnResponse, WatchEvent, WatchEventKind,
    WatchStream,
};
pub use self::dispatch::{DispatchStrategy, WorkerCandidate};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::worker_channel::{WorkerChannel, WorkerReport};
