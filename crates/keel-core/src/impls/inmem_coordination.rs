//! InMemoryCoordination - プロセス内の coordination service
//!
//! # 学習ポイント
//! - BTreeMap によるキー順序付き range 読み取り
//! - 1 トランザクション = 1 リビジョン
//! - lease の期限切れは sweeper タスクで検出し、Delete イベントとして watch に流す
//!
//! standalone の gate とテストで使います。時刻は `tokio::time` なので
//! `start_paused` のテストで TTL を決定的に扱えます。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::domain::keys::prefix_end;
use crate::domain::{CoordError, LeaseId};
use crate::ports::{
    CompareTarget, CoordinationService, KeyValue, RangeEnd, RangeRequest, RangeResponse,
    Revision, SortOrder, Txn, TxnOp, TxnResponse, WatchEvent, WatchEventKind, WatchStream,
};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    create_revision: Revision,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

impl Entry {
    fn to_kv(&self, key: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            lease: self.lease,
        }
    }
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

struct CoordState {
    kvs: BTreeMap<String, Entry>,
    revision: Revision,
    next_lease: i64,
    leases: HashMap<LeaseId, LeaseState>,
    watchers: Vec<Watcher>,
    available: bool,
}

impl CoordState {
    fn new() -> Self {
        Self {
            kvs: BTreeMap::new(),
            revision: 0,
            next_lease: 1,
            leases: HashMap::new(),
            watchers: Vec::new(),
            available: true,
        }
    }

    fn check_available(&self) -> Result<(), CoordError> {
        if self.available {
            Ok(())
        } else {
            Err(CoordError::Unavailable("in-memory service marked down".to_string()))
        }
    }

    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if event.kv.key.starts_with(&w.prefix) {
                w.tx.send(event.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
    }

    fn apply_put(&mut self, key: &str, value: String, lease: Option<LeaseId>, revision: Revision) {
        let create_revision = match self.kvs.get(key) {
            Some(old) => {
                if old.lease != lease
                    && let Some(old_lease) = old.lease
                    && let Some(state) = self.leases.get_mut(&old_lease)
                {
                    state.keys.remove(key);
                }
                old.create_revision
            }
            None => revision,
        };
        if let Some(lease) = lease
            && let Some(state) = self.leases.get_mut(&lease)
        {
            state.keys.insert(key.to_string());
        }
        let entry = Entry {
            value,
            create_revision,
            mod_revision: revision,
            lease,
        };
        let kv = entry.to_kv(key);
        self.kvs.insert(key.to_string(), entry);
        self.notify(WatchEvent {
            kind: WatchEventKind::Put,
            kv,
        });
    }

    fn apply_delete(&mut self, key: &str, revision: Revision) -> bool {
        let Some(old) = self.kvs.remove(key) else {
            return false;
        };
        if let Some(lease) = old.lease
            && let Some(state) = self.leases.get_mut(&lease)
        {
            state.keys.remove(key);
        }
        let mut kv = old.to_kv(key);
        kv.mod_revision = revision;
        self.notify(WatchEvent {
            kind: WatchEventKind::Delete,
            kv,
        });
        true
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        let Some(state) = self.leases.remove(&lease) else {
            return false;
        };
        if !state.keys.is_empty() {
            self.revision += 1;
            let revision = self.revision;
            for key in state.keys {
                self.apply_delete(&key, revision);
            }
        }
        true
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, state)| state.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            tracing::debug!(%lease, "lease expired");
            self.drop_lease(lease);
        }
    }

    fn compare_holds(&self, compare: &crate::ports::Compare) -> bool {
        let entry = self.kvs.get(&compare.key);
        match &compare.target {
            CompareTarget::CreateRevision(rev) => compare
                .op
                .holds(entry.map_or(0, |e| e.create_revision), *rev),
            CompareTarget::ModRevision(rev) => {
                compare.op.holds(entry.map_or(0, |e| e.mod_revision), *rev)
            }
            CompareTarget::Value(value) => {
                entry.is_some_and(|e| compare.op.holds(e.value.as_str(), value.as_str()))
            }
        }
    }
}

/// In-memory coordination service.
///
/// `new()` spawns the lease sweeper, so it must be called inside a tokio runtime.
pub struct InMemoryCoordination {
    state: Arc<Mutex<CoordState>>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(CoordState::new()));
        tokio::spawn(sweep_loop(Arc::downgrade(&state)));
        Self { state }
    }

    /// Failure injection: while down every call fails with `Unavailable`.
    /// Leases keep expiring in the background.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    /// Failure injection: ends every open watch stream.
    pub async fn close_watches(&self) {
        self.state.lock().await.watchers.clear();
    }

    pub async fn revision(&self) -> Revision {
        self.state.lock().await.revision
    }
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

async fn sweep_loop(state: Weak<Mutex<CoordState>>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let Some(shared) = state.upgrade() else {
            break;
        };
        shared.lock().await.expire_leases(Instant::now());
    }
}

#[async_trait]
impl CoordinationService for InMemoryCoordination {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, CoordError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.expire_leases(Instant::now());
        Ok(state.kvs.get(key).map(|e| e.to_kv(key)))
    }

    async fn range(&self, request: RangeRequest) -> Result<RangeResponse, CoordError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.expire_leases(Instant::now());

        let mut kvs: Vec<KeyValue> = match &request.end {
            RangeEnd::Single => state
                .kvs
                .get(&request.start)
                .map(|e| vec![e.to_kv(&request.start)])
                .unwrap_or_default(),
            end => {
                let end = match end {
                    RangeEnd::Key(end) => end.clone(),
                    _ => prefix_end(&request.start),
                };
                if end <= request.start {
                    Vec::new()
                } else {
                    state
                        .kvs
                        .range::<str, _>((
                            Bound::Included(request.start.as_str()),
                            Bound::Excluded(end.as_str()),
                        ))
                        .map(|(k, e)| e.to_kv(k))
                        .collect()
                }
            }
        };

        let count = kvs.len();
        if request.order == SortOrder::Descend {
            kvs.reverse();
        }
        let more = request.limit > 0 && count > request.limit;
        if request.limit > 0 {
            kvs.truncate(request.limit);
        }
        if request.keys_only {
            for kv in &mut kvs {
                kv.value.clear();
            }
        }
        Ok(RangeResponse { kvs, count, more })
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, CoordError> {
        let response = self.range(RangeRequest::prefix(prefix).keys_only()).await?;
        Ok(response.count)
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        lease: Option<LeaseId>,
    ) -> Result<Revision, CoordError> {
        let response = self
            .txn(Txn::new().then(TxnOp::Put {
                key: key.to_string(),
                value,
                lease,
            }))
            .await?;
        Ok(response.revision)
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.expire_leases(Instant::now());
        if !state.kvs.contains_key(key) {
            return Ok(false);
        }
        state.revision += 1;
        let revision = state.revision;
        Ok(state.apply_delete(key, revision))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, CoordError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.expire_leases(Instant::now());

        let succeeded = txn.compares.iter().all(|c| state.compare_holds(c));
        let ops = if succeeded { txn.success } else { txn.failure };

        // lease の存在確認は適用前にまとめて行う（途中失敗で半端に書かないため）
        for op in &ops {
            if let TxnOp::Put {
                lease: Some(lease), ..
            } = op
                && !state.leases.contains_key(lease)
            {
                return Err(CoordError::LeaseNotFound(*lease));
            }
        }

        if !ops.is_empty() {
            state.revision += 1;
            let revision = state.revision;
            for op in ops {
                match op {
                    TxnOp::Put { key, value, lease } => {
                        state.apply_put(&key, value, lease, revision)
                    }
                    TxnOp::Delete { key } => {
                        state.apply_delete(&key, revision);
                    }
                }
            }
        }

        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
        })
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let id = LeaseId(state.next_lease);
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration, CoordError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let now = Instant::now();
        state.expire_leases(now);
        let lease_state = state
            .leases
            .get_mut(&lease)
            .ok_or(CoordError::LeaseNotFound(lease))?;
        lease_state.deadline = now + lease_state.ttl;
        Ok(lease_state.ttl)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(CoordError::LeaseNotFound(lease))
        }
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, CoordError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{Compare, CompareOp};

    #[tokio::test]
    async fn create_if_absent_succeeds_once() {
        let coord = InMemoryCoordination::new();
        let txn = || {
            Txn::new()
                .when(Compare::absent("/t/a"))
                .then(TxnOp::put("/t/a", "def"))
                .then(TxnOp::put("/s/a", "state"))
        };

        let first = coord.txn(txn()).await.unwrap();
        let second = coord.txn(txn()).await.unwrap();

        assert!(first.succeeded);
        assert!(!second.succeeded);
        // 2 つの put は同じリビジョン
        let a = coord.get("/t/a").await.unwrap().unwrap();
        let s = coord.get("/s/a").await.unwrap().unwrap();
        assert_eq!(a.mod_revision, s.mod_revision);
        assert_eq!(a.create_revision, first.revision);
    }

    #[tokio::test]
    async fn mod_revision_guards_compare_and_swap() {
        let coord = InMemoryCoordination::new();
        let rev = coord.put("/k", "1".into(), None).await.unwrap();

        let stale = Txn::new()
            .when(Compare::mod_revision("/k", CompareOp::Equal, rev - 1))
            .then(TxnOp::put("/k", "2"));
        assert!(!coord.txn(stale).await.unwrap().succeeded);

        let fresh = Txn::new()
            .when(Compare::mod_revision("/k", CompareOp::Equal, rev))
            .then(TxnOp::put("/k", "2"));
        assert!(coord.txn(fresh).await.unwrap().succeeded);

        let kv = coord.get("/k").await.unwrap().unwrap();
        assert_eq!(kv.value, "2");
        assert_eq!(kv.create_revision, rev);
    }

    #[tokio::test]
    async fn value_compare_on_missing_key_fails() {
        let coord = InMemoryCoordination::new();
        let txn = Txn::new()
            .when(Compare::value("/missing", CompareOp::NotEqual, "x"))
            .then(TxnOp::put("/missing", "y"));
        assert!(!coord.txn(txn).await.unwrap().succeeded);
    }

    #[tokio::test]
    async fn range_orders_limits_and_counts() {
        let coord = InMemoryCoordination::new();
        for name in ["c", "a", "e", "b", "d"] {
            coord.put(&format!("/p/{name}"), name.into(), None).await.unwrap();
        }
        coord.put("/q/x", "x".into(), None).await.unwrap();

        let asc = coord
            .range(RangeRequest::prefix("/p/").with_limit(2))
            .await
            .unwrap();
        assert_eq!(asc.count, 5);
        assert!(asc.more);
        let keys: Vec<_> = asc.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, ["/p/a", "/p/b"]);

        let desc = coord
            .range(
                RangeRequest::prefix("/p/")
                    .with_order(SortOrder::Descend)
                    .with_limit(2)
                    .keys_only(),
            )
            .await
            .unwrap();
        let keys: Vec<_> = desc.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, ["/p/e", "/p/d"]);
        assert!(desc.kvs.iter().all(|kv| kv.value.is_empty()));

        assert_eq!(coord.count_prefix("/p/").await.unwrap(), 5);
        assert_eq!(coord.count_prefix("/nothing/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inverted_range_is_empty() {
        let coord = InMemoryCoordination::new();
        coord.put("/p/a", "a".into(), None).await.unwrap();
        let resp = coord
            .range(RangeRequest::between("/p/z", "/p/a"))
            .await
            .unwrap();
        assert!(resp.kvs.is_empty());
        assert_eq!(resp.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_deletes_keys_and_notifies_watchers() {
        let coord = InMemoryCoordination::new();
        let mut watch = coord.watch_prefix("/nodes/").await.unwrap();

        let lease = coord.grant_lease(Duration::from_secs(2)).await.unwrap();
        coord
            .put("/nodes/w1", "addr".into(), Some(lease))
            .await
            .unwrap();
        assert_eq!(watch.next().await.unwrap().kind, WatchEventKind::Put);

        tokio::time::sleep(Duration::from_millis(2200)).await;

        let event = watch.next().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Delete);
        assert_eq!(event.kv.key, "/nodes/w1");
        assert!(coord.get("/nodes/w1").await.unwrap().is_none());
        assert_eq!(
            coord.keep_alive_once(lease).await,
            Err(CoordError::LeaseNotFound(lease))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_extends_the_deadline() {
        let coord = InMemoryCoordination::new();
        let lease = coord.grant_lease(Duration::from_secs(2)).await.unwrap();
        coord.put("/n", "a".into(), Some(lease)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            coord.keep_alive_once(lease).await.unwrap();
        }
        assert!(coord.get("/n").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_removes_attached_keys() {
        let coord = InMemoryCoordination::new();
        let lease = coord.grant_lease(Duration::from_secs(30)).await.unwrap();
        coord.put("/n/a", "a".into(), Some(lease)).await.unwrap();
        coord.put("/n/b", "b".into(), Some(lease)).await.unwrap();
        coord.put("/n/c", "c".into(), None).await.unwrap();

        coord.revoke_lease(lease).await.unwrap();
        assert_eq!(coord.count_prefix("/n/").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_with_unknown_lease_writes_nothing() {
        let coord = InMemoryCoordination::new();
        let err = coord
            .txn(
                Txn::new()
                    .then(TxnOp::put("/a", "1"))
                    .then(TxnOp::put_with_lease("/b", "2", LeaseId(99))),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::LeaseNotFound(LeaseId(99)));
        assert!(coord.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_service_rejects_calls() {
        let coord = InMemoryCoordination::new();
        coord.set_available(false).await;
        assert!(matches!(
            coord.get("/a").await,
            Err(CoordError::Unavailable(_))
        ));
        coord.set_available(true).await;
        assert!(coord.get("/a").await.unwrap().is_none());
    }
}
