//! CoordinationService port - クラスタの正本（source of truth）
//!
//! 線形化可能な KV ストアに求める最小限のプロトコルです。
//! - リビジョン付きのキー（create_revision / mod_revision）
//! - 条件付きトランザクション（compare → then / else）
//! - TTL 付き lease と keepalive（lease が切れると紐づくキーは消える）
//! - prefix 単位の watch
//!
//! 実装は `impls::InMemoryCoordination` を参照してください。

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{CoordError, LeaseId};

/// Global, monotonically increasing write counter. 0 means "never written".
pub type Revision = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascend,
    Descend,
}

impl SortOrder {
    /// A sort token with a leading `-` means descending.
    pub fn from_sort_token(token: &str) -> Self {
        if token.starts_with('-') {
            SortOrder::Descend
        } else {
            SortOrder::Ascend
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeEnd {
    /// Only `start` itself.
    Single,
    /// Every key starting with `start`.
    Prefix,
    /// `[start, end)`.
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: String,
    pub end: RangeEnd,
    /// 0 means unlimited.
    pub limit: usize,
    pub order: SortOrder,
    pub keys_only: bool,
}

impl RangeRequest {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            start: prefix.into(),
            end: RangeEnd::Prefix,
            limit: 0,
            order: SortOrder::Ascend,
            keys_only: false,
        }
    }

    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            end: RangeEnd::Key(end.into()),
            ..Self::prefix(start)
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    /// Number of keys in the range before `limit` was applied.
    pub count: usize,
    pub more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    pub fn holds<T: Ord>(self, actual: T, expected: T) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(Revision),
    ModRevision(Revision),
    Value(String),
}

/// A guard evaluated atomically at the start of a transaction.
///
/// Revisions of a missing key compare as 0; a value comparison on a missing key never holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Value(value.into()),
        }
    }

    /// "creation revision = 0"
    pub fn absent(key: impl Into<String>) -> Self {
        Self::create_revision(key, CompareOp::Equal, 0)
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::create_revision(key, CompareOp::Greater, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<String>, lease: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }
}

/// `If(compares...).Then(success...).Else(failure...)`, applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn otherwise(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// For deletes, the last known value with `mod_revision` set to the deletion revision.
    pub kv: KeyValue,
}

/// Change stream for one watch. Ends when the service drops the watch.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// CoordinationService は gate / worker / task の全状態を保持する外部サービス
///
/// # 設計原則
/// - 競合する書き込みはサービス側のトランザクションで直列化する（プロセス内ロック不要）
/// - liveness は lease に紐づくキーの存在だけで判断する
/// - 呼び出し側はタイムアウトを自分で決める
#[async_trait]
pub trait CoordinationService: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, CoordError>;

    async fn range(&self, request: RangeRequest) -> Result<RangeResponse, CoordError>;

    async fn count_prefix(&self, prefix: &str) -> Result<usize, CoordError>;

    async fn put(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Result<Revision, CoordError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, CoordError>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, CoordError>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordError>;

    /// Refreshes the lease to its full TTL and returns that TTL.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration, CoordError>;

    /// Drops the lease and every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordError>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, CoordError>;
}
