//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryCoordination**: プロセス内の coordination service（standalone / テスト用）
//! - **LeastLoadedDispatch**: デフォルトの DispatchStrategy
//!
//! ネットワーク越しの coordination service クライアントは別クレートに置く想定です。

pub mod dispatch;
pub mod inmem_coordination;

pub use self::dispatch::LeastLoadedDispatch;
pub use self::inmem_coordination::InMemoryCoordination;
