//! NodeRegistry - lease に紐づくノード登録と liveness の監視
//!
//! # 学習ポイント
//! - ノードの生存 = lease 付きキーが存在すること（プロセス内に状態を持たない）
//! - watch が切れたら subscribe → snapshot の順で張り直し、差分を合成イベントとして流す
//! - keepalive ループは watch チャネルで停止する

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::retry::RetryPolicy;
use crate::domain::keys::{self, name_from_key};
use crate::domain::{
    CoordError, GateError, LeaseBinding, LeaseId, LivenessEvent, NodeIdentity, NodeKind, Result,
};
use crate::ports::{CoordinationService, RangeRequest, WatchEvent, WatchEventKind, WatchStream};

pub struct NodeRegistry {
    coord: Arc<dyn CoordinationService>,
}

impl NodeRegistry {
    pub fn new(coord: Arc<dyn CoordinationService>) -> Self {
        Self { coord }
    }

    /// Creates a lease of `ttl` and attaches the node record to it.
    ///
    /// The record's value is the node's address. The gate treats a failure
    /// for its own identity as fatal; worker sessions retry it.
    pub async fn register_self(
        &self,
        identity: &NodeIdentity,
        ttl: Duration,
    ) -> Result<LeaseBinding> {
        let registration = |source: CoordError| GateError::Registration {
            node: identity.to_string(),
            source,
        };

        let lease = self.coord.grant_lease(ttl).await.map_err(registration)?;
        if let Err(e) = self
            .coord
            .put(&identity.path(), identity.address.clone(), Some(lease))
            .await
        {
            // 付けられなかった lease は片付けておく
            let _ = self.coord.revoke_lease(lease).await;
            return Err(registration(e));
        }

        info!(node = %identity, %lease, ttl_ms = ttl.as_millis() as u64, "node registered");
        Ok(LeaseBinding::new(lease, ttl))
    }

    /// Extends the lease to its full TTL.
    pub async fn renew(&self, lease: LeaseId) -> Result<Duration> {
        Ok(self.coord.keep_alive_once(lease).await?)
    }

    /// Explicit teardown. Deletes every record attached to the lease.
    pub async fn revoke(&self, lease: LeaseId) -> Result<()> {
        Ok(self.coord.revoke_lease(lease).await?)
    }

    pub async fn live_nodes(&self, kind: NodeKind) -> Result<Vec<NodeIdentity>> {
        let prefix = keys::node_prefix(kind);
        let response = self.coord.range(RangeRequest::prefix(prefix)).await?;
        Ok(response
            .kvs
            .into_iter()
            .filter_map(|kv| {
                name_from_key(prefix, &kv.key).map(|key| NodeIdentity::from_key(kind, key, kv.value))
            })
            .collect())
    }

    pub async fn is_live(&self, kind: NodeKind, node_key: &str) -> Result<bool> {
        Ok(self.address_of(kind, node_key).await?.is_some())
    }

    /// The address a node registered with, if its record is live.
    pub async fn address_of(&self, kind: NodeKind, node_key: &str) -> Result<Option<String>> {
        let kv = self.coord.get(&keys::node_path(kind, node_key)).await?;
        Ok(kv.map(|kv| kv.value))
    }

    /// Lazily subscribes on the first `next()`.
    pub fn watch_liveness(&self, kind: NodeKind) -> LivenessWatch {
        LivenessWatch::new(Arc::clone(&self.coord), kind)
    }

    /// Keeps this process's own lease alive until shutdown, then revokes it.
    ///
    /// A lease that disappears (e.g. after a partition) is re-created under the same identity.
    pub async fn keep_alive(
        &self,
        identity: NodeIdentity,
        mut binding: LeaseBinding,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let retry = RetryPolicy::for_lease(binding.ttl);
        let mut failures = 0u32;
        let mut interval = tokio::time::interval(binding.renew_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

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

            match self.renew(binding.id).await {
                Ok(_) => {
                    binding.renewed();
                    failures = 0;
                }
                Err(GateError::Coordination(CoordError::LeaseNotFound(lease))) => {
                    warn!(node = %identity, %lease, "lease lost; registering again");
                    match self.register_self(&identity, binding.ttl).await {
                        Ok(fresh) => {
                            binding = fresh;
                            failures = 0;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(node = %identity, error = %e, "re-registration failed");
                            tokio::time::sleep(retry.next_delay(failures)).await;
                        }
                    }
                }
                Err(e) => {
                    // lease はそのまま失効させる
                    warn!(node = %identity, lease = %binding.id, error = %e, "keepalive failed");
                }
            }
        }

        match self.revoke(binding.id).await {
            Ok(()) => info!(node = %identity, "node deregistered"),
            Err(e) => debug!(node = %identity, error = %e, "revoke on shutdown failed"),
        }
    }
}

/// Stream of node add/remove events for one node kind.
///
/// `next()` never ends: a dropped watch is re-established and the gap is
/// covered by diffing a fresh snapshot against the nodes already reported.
pub struct LivenessWatch {
    coord: Arc<dyn CoordinationService>,
    kind: NodeKind,
    stream: Option<WatchStream>,
    /// node key -> address
    known: HashMap<String, String>,
    pending: VecDeque<LivenessEvent>,
    retry: RetryPolicy,
    failures: u32,
}

impl LivenessWatch {
    fn new(coord: Arc<dyn CoordinationService>, kind: NodeKind) -> Self {
        Self {
            coord,
            kind,
            stream: None,
            known: HashMap::new(),
            pending: VecDeque::new(),
            retry: RetryPolicy::new(Duration::from_millis(200), 2.0, Duration::from_secs(5)),
            failures: 0,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub async fn next(&mut self) -> LivenessEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }

            let Some(stream) = self.stream.as_mut() else {
                self.resubscribe().await;
                continue;
            };

            match stream.next().await {
                Some(event) => {
                    if let Some(event) = self.apply(event) {
                        return event;
                    }
                }
                None => {
                    warn!(kind = %self.kind, "liveness watch ended; re-subscribing");
                    self.stream = None;
                }
            }
        }
    }

    async fn resubscribe(&mut self) {
        let prefix = keys::node_prefix(self.kind);

        // subscribe → snapshot の順。間に起きた変更は watch 側にも届く
        let stream = match self.coord.watch_prefix(prefix).await {
            Ok(stream) => stream,
            Err(e) => return self.back_off(e).await,
        };
        let snapshot = match self.coord.range(RangeRequest::prefix(prefix)).await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.back_off(e).await,
        };

        let current: HashMap<String, String> = snapshot
            .kvs
            .into_iter()
            .filter_map(|kv| name_from_key(prefix, &kv.key).map(|k| (k.to_string(), kv.value)))
            .collect();

        for (key, address) in &self.known {
            if !current.contains_key(key) {
                self.pending.push_back(LivenessEvent::Removed(NodeIdentity::from_key(
                    self.kind,
                    key.clone(),
                    address.clone(),
                )));
            }
        }
        for (key, address) in &current {
            if !self.known.contains_key(key) {
                self.pending.push_back(LivenessEvent::Added(NodeIdentity::from_key(
                    self.kind,
                    key.clone(),
                    address.clone(),
                )));
            }
        }

        debug!(kind = %self.kind, live = current.len(), synthetic = self.pending.len(), "liveness watch subscribed");
        self.known = current;
        self.stream = Some(stream);
        self.failures = 0;
    }

    async fn back_off(&mut self, error: CoordError) {
        self.failures += 1;
        let delay = self.retry.next_delay(self.failures);
        warn!(kind = %self.kind, error = %error, delay_ms = delay.as_millis() as u64, "liveness watch unavailable");
        tokio::time::sleep(delay).await;
    }

    fn apply(&mut self, event: WatchEvent) -> Option<LivenessEvent> {
        let key = name_from_key(keys::node_prefix(self.kind), &event.kv.key)?.to_string();
        match event.kind {
            WatchEventKind::Put => {
                // 同じキーへの再 put（keepalive 以外の上書き）はイベントにしない
                let previous = self.known.insert(key.clone(), event.kv.value.clone());
                previous
                    .is_none()
                    .then(|| LivenessEvent::Added(NodeIdentity::from_key(self.kind, key, event.kv.value)))
            }
            WatchEventKind::Delete => self
                .known
                .remove(&key)
                .map(|address| LivenessEvent::Removed(NodeIdentity::from_key(self.kind, key, address))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryCoordination;

    fn worker(name: &str) -> NodeIdentity {
        NodeIdentity::new(NodeKind::Runtime, "pool", name, format!("{name}:7000"))
    }

    #[tokio::test]
    async fn registered_node_is_live_until_revoked() {
        let coord = Arc::new(InMemoryCoordination::new());
        let registry = NodeRegistry::new(coord);

        let binding = registry
            .register_self(&worker("w1"), Duration::from_secs(4))
            .await
            .unwrap();
        assert!(registry.is_live(NodeKind::Runtime, "pool-w1").await.unwrap());
        assert_eq!(
            registry.address_of(NodeKind::Runtime, "pool-w1").await.unwrap(),
            Some("w1:7000".to_string())
        );

        let live = registry.live_nodes(NodeKind::Runtime).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key(), "pool-w1");
        assert!(registry.live_nodes(NodeKind::Gate).await.unwrap().is_empty());

        registry.revoke(binding.id).await.unwrap();
        assert!(!registry.is_live(NodeKind::Runtime, "pool-w1").await.unwrap());
    }

    #[tokio::test]
    async fn registration_fails_when_service_is_down() {
        let coord = Arc::new(InMemoryCoordination::new());
        coord.set_available(false).await;
        let registry = NodeRegistry::new(coord.clone());

        let err = registry
            .register_self(&worker("w1"), Duration::from_secs(4))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Registration { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_the_node_alive_past_its_ttl() {
        let coord = Arc::new(InMemoryCoordination::new());
        let registry = NodeRegistry::new(coord);
        let binding = registry
            .register_self(&worker("w1"), Duration::from_secs(4))
            .await
            .unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(2)).await;
            registry.renew(binding.id).await.unwrap();
        }
        assert!(registry.is_live(NodeKind::Runtime, "pool-w1").await.unwrap());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!registry.is_live(NodeKind::Runtime, "pool-w1").await.unwrap());
        let err = registry.renew(binding.id).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Coordination(CoordError::LeaseNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_reports_initial_nodes_then_expiry() {
        let coord = Arc::new(InMemoryCoordination::new());
        let registry = NodeRegistry::new(coord);
        registry
            .register_self(&worker("w1"), Duration::from_secs(4))
            .await
            .unwrap();

        let mut watch = registry.watch_liveness(NodeKind::Runtime);
        assert_eq!(
            watch.next().await,
            LivenessEvent::Added(NodeIdentity::from_key(NodeKind::Runtime, "pool-w1", "w1:7000"))
        );

        // 更新されない lease は TTL 後に消える
        let event = watch.next().await;
        assert_eq!(
            event,
            LivenessEvent::Removed(NodeIdentity::from_key(NodeKind::Runtime, "pool-w1", "w1:7000"))
        );
    }

    #[tokio::test]
    async fn restarted_watch_synthesizes_missed_changes() {
        let coord = Arc::new(InMemoryCoordination::new());
        let registry = NodeRegistry::new(coord.clone());
        let w1 = registry
            .register_self(&worker("w1"), Duration::from_secs(30))
            .await
            .unwrap();

        let mut watch = registry.watch_liveness(NodeKind::Runtime);
        assert!(matches!(watch.next().await, LivenessEvent::Added(_)));

        // watch が落ちている間に w1 が消え w2 が来る
        coord.close_watches().await;
        registry.revoke(w1.id).await.unwrap();
        registry
            .register_self(&worker("w2"), Duration::from_secs(30))
            .await
            .unwrap();

        let mut events = vec![watch.next().await, watch.next().await];
        events.sort_by_key(|e| e.node().key());
        assert_eq!(
            events,
            vec![
                LivenessEvent::Removed(NodeIdentity::from_key(NodeKind::Runtime, "pool-w1", "w1:7000")),
                LivenessEvent::Added(NodeIdentity::from_key(NodeKind::Runtime, "pool-w2", "w2:7000")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_re_registers_a_lost_lease_and_revokes_on_shutdown() {
        let coord = Arc::new(InMemoryCoordination::new());
        let registry = Arc::new(NodeRegistry::new(coord.clone()));
        let gate = NodeIdentity::new(NodeKind::Gate, "", "g1", "127.0.0.1:8080");
        let binding = registry
            .register_self(&gate, Duration::from_secs(4))
            .await
            .unwrap();

        // lease を外部から消す
        registry.revoke(binding.id).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let registry = Arc::clone(&registry);
            let gate = gate.clone();
            tokio::spawn(async move { registry.keep_alive(gate, binding, shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(registry.is_live(NodeKind::Gate, "g1").await.unwrap());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.is_live(NodeKind::Gate, "g1").await.unwrap());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(!registry.is_live(NodeKind::Gate, "g1").await.unwrap());
    }
}
