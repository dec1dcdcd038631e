//! GateBuilder - gate の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定不備と coordination service の欠落は build() で弾く
//! - バックグラウンドループは watch チャネル 1 本でまとめて停止する

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::lock::LeaseLock;
use crate::app::patrol_loop::PatrolLoop;
use crate::app::reaper_loop::ReaperLoop;
use crate::app::reassign::ReassignmentEngine;
use crate::app::registry::NodeRegistry;
use crate::app::session::{Session, SessionManager, SessionSignal};
use crate::app::task_store::TaskStore;
use crate::config::GateConfig;
use crate::domain::{GateError, NodeIdentity, Result};
use crate::impls::LeastLoadedDispatch;
use crate::ports::{
    Clock, CoordinationService, DispatchStrategy, SystemClock, UlidGenerator, WorkerChannel,
};

/// GateBuilder は gate を構築
///
/// # 使用例
/// ```ignore
/// let mut gate = GateBuilder::new(config)
///     .coordination(Arc::new(InMemoryCoordination::new()))
///     .build()?;
/// gate.start().await?;
/// ```
pub struct GateBuilder {
    config: GateConfig,
    coord: Option<Arc<dyn CoordinationService>>,
    dispatch: Option<Arc<dyn DispatchStrategy>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GateBuilder {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            coord: None,
            dispatch: None,
            clock: None,
        }
    }

    pub fn coordination(mut self, coord: Arc<dyn CoordinationService>) -> Self {
        self.coord = Some(coord);
        self
    }

    /// Defaults to [`LeastLoadedDispatch`].
    pub fn dispatch(mut self, dispatch: Arc<dyn DispatchStrategy>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// # 検証
    /// - GateConfig::validate()
    /// - coordination service が設定されていること
    pub fn build(self) -> Result<Gate> {
        self.config.validate()?;
        let coord = self.coord.ok_or_else(|| {
            GateError::StartupFatal("no coordination service configured".to_string())
        })?;
        let dispatch = self
            .dispatch
            .unwrap_or_else(|| Arc::new(LeastLoadedDispatch::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = Arc::new(UlidGenerator::new(SystemClock));

        let config = self.config;
        let identity = config.identity();
        let registry = Arc::new(NodeRegistry::new(Arc::clone(&coord)));
        let (sessions, signals) =
            SessionManager::new(Arc::clone(&registry), ids.clone(), config.lease_ttl);
        let channel: Arc<dyn WorkerChannel> = sessions.clone();
        let store = Arc::new(TaskStore::new(
            Arc::clone(&coord),
            Arc::clone(&channel),
            clock,
            ids,
            config.ack_timeout,
        ));
        let engine = Arc::new(ReassignmentEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            channel,
            dispatch,
            LeaseLock::new(Arc::clone(&coord), identity.key(), config.lock_ttl),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Gate {
            config,
            identity,
            registry,
            store,
            sessions,
            engine,
            signals: Some(signals),
            shutdown_tx,
            joins: Vec::new(),
        })
    }
}

/// Gate は起動済みの gate プロセス
///
/// - `start()` で自身を登録し、バックグラウンドループを起動
/// - `shutdown()` でループを止め、自身の lease を revoke
pub struct Gate {
    config: GateConfig,
    identity: NodeIdentity,
    registry: Arc<NodeRegistry>,
    store: Arc<TaskStore>,
    sessions: Arc<SessionManager>,
    engine: Arc<ReassignmentEngine>,
    signals: Option<mpsc::UnboundedReceiver<SessionSignal>>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl Gate {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn engine(&self) -> &Arc<ReassignmentEngine> {
        &self.engine
    }

    pub fn open_session(&self) -> Session {
        self.sessions.open()
    }

    /// Registers this gate and spawns its background loops.
    ///
    /// Failing to register is fatal; the caller should exit.
    pub async fn start(&mut self) -> Result<()> {
        let Some(signals) = self.signals.take() else {
            return Err(GateError::StartupFatal("gate already started".to_string()));
        };

        let binding = self
            .registry
            .register_self(&self.identity, self.config.lease_ttl)
            .await?;

        let registry = Arc::clone(&self.registry);
        let identity = self.identity.clone();
        let rx = self.shutdown_tx.subscribe();
        self.joins.push(tokio::spawn(async move {
            registry.keep_alive(identity, binding, rx).await
        }));

        let reaper = ReaperLoop::new(Arc::clone(&self.registry), Arc::clone(&self.engine));
        self.joins
            .push(tokio::spawn(reaper.run(self.shutdown_tx.subscribe())));

        let patrol = PatrolLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
            self.sessions.clone(),
            self.config.patrol.clone(),
        );
        self.joins
            .push(tokio::spawn(patrol.run(self.shutdown_tx.subscribe())));

        self.joins.push(tokio::spawn(apply_signals(
            Arc::clone(&self.store),
            signals,
            self.shutdown_tx.subscribe(),
        )));

        let engine = Arc::clone(&self.engine);
        let jitter = self.config.reconcile_jitter;
        let mut rx = self.shutdown_tx.subscribe();
        self.joins.push(tokio::spawn(async move {
            tokio::select! {
                _ = rx.changed() => {}
                result = engine.reconcile_on_startup(jitter) => {
                    if let Err(e) = result {
                        warn!(error = %e, "startup reconciliation failed");
                    }
                }
            }
        }));

        info!(node = %self.identity, address = %self.config.server_addr, "gate started");
        Ok(())
    }

    /// Request shutdown for all loops and wait for them.
    pub async fn shutdown(self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
        for join in self.joins {
            let _ = join.await;
        }
        info!(node = %self.identity, "gate stopped");
    }
}

/// Writes worker confirmations back to the task store.
async fn apply_signals(
    store: Arc<TaskStore>,
    mut signals: mpsc::UnboundedReceiver<SessionSignal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let signal = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            signal = signals.recv() => signal,
        };

        match signal {
            Some(SessionSignal::Confirmed { worker, task_name }) => {
                if let Err(e) = store.mark_in_runtime(&task_name, &worker).await {
                    warn!(task = %task_name, worker = %worker, error = %e, "could not record confirmation");
                }
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CommandKind, NodeKind, TaskDefinition, WorkerCommand, WorkerMessage};
    use crate::impls::InMemoryCoordination;
    use std::time::Duration;

    fn config() -> GateConfig {
        GateConfig {
            reconcile_jitter: Duration::ZERO,
            ..GateConfig::new("127.0.0.1:8080", "g1")
        }
    }

    #[test]
    fn build_without_coordination_fails_fast() {
        let gate = GateBuilder::new(config()).build();
        assert!(matches!(gate, Err(GateError::StartupFatal(_))));
    }

    #[tokio::test]
    async fn build_rejects_invalid_config() {
        let gate = GateBuilder::new(GateConfig::new("", "g1"))
            .coordination(Arc::new(InMemoryCoordination::new()))
            .build();
        assert!(matches!(gate, Err(GateError::StartupFatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_receives_tasks_and_confirms_them() {
        let coord = Arc::new(InMemoryCoordination::new());
        let mut gate = GateBuilder::new(config())
            .coordination(coord.clone())
            .build()
            .unwrap();
        gate.start().await.unwrap();

        let registry = NodeRegistry::new(coord.clone());
        assert!(registry.is_live(NodeKind::Gate, "g1").await.unwrap());

        gate.store()
            .create(TaskDefinition::new("build-1", serde_json::json!({"cmd": "make"})))
            .await
            .unwrap();

        let mut session = gate.open_session();
        session
            .on_message(WorkerMessage::Whoami {
                name: "w1".into(),
                prefix: String::new(),
                address: "10.0.0.7:7000".into(),
            })
            .unwrap();
        let mut outbound = session.take_outbound().unwrap();

        let command = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(&command, WorkerCommand::Run { definition } if definition.task_name == "build-1"));

        session
            .on_message(WorkerMessage::Ack {
                task_name: "build-1".into(),
                command: CommandKind::Run,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = gate.store().get("build-1").await.unwrap().unwrap().state;
        assert_eq!(state.runtime_node, "w1");
        assert!(state.in_runtime);

        drop(session);
        gate.shutdown().await;
        assert!(!registry.is_live(NodeKind::Gate, "g1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn new_task_reaches_a_connected_worker_without_a_patrol_cycle() {
        let coord = Arc::new(InMemoryCoordination::new());
        let mut gate = GateBuilder::new(config())
            .coordination(coord.clone())
            .build()
            .unwrap();
        gate.start().await.unwrap();
        let registry = NodeRegistry::new(coord.clone());

        let mut session = gate.open_session();
        session
            .on_message(WorkerMessage::Whoami {
                name: "w1".into(),
                prefix: String::new(),
                address: "10.0.0.7:7000".into(),
            })
            .unwrap();
        let mut outbound = session.take_outbound().unwrap();
        while !registry.is_live(NodeKind::Runtime, "w1").await.unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // node 追加イベントの drain を先に終わらせる
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = tokio::time::Instant::now();

        gate.engine()
            .submit(TaskDefinition::new("build-1", serde_json::json!({"cmd": "make"})))
            .await
            .unwrap();

        let command = outbound.try_recv().unwrap();
        assert!(matches!(&command, WorkerCommand::Run { definition } if definition.task_name == "build-1"));
        assert!(started.elapsed() < gate.config().patrol.interval);
        assert_eq!(
            gate.store().get("build-1").await.unwrap().unwrap().state.runtime_node,
            "w1"
        );

        drop(session);
        gate.shutdown().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut gate = GateBuilder::new(config())
            .coordination(Arc::new(InMemoryCoordination::new()))
            .build()
            .unwrap();
        gate.start().await.unwrap();
        assert!(matches!(
            gate.start().await,
            Err(GateError::StartupFatal(_))
        ));
        gate.shutdown().await;
    }
}
