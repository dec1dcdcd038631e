//! SessionManager - worker との常時接続セッション
//!
//! # 学習ポイント
//! - セッションは明示的な状態機械: `Unbound → Bound(worker) → Closed`
//! - whoami 以降のメッセージはすべて heartbeat。mpsc で relay タスクに流し、lease を更新する
//! - 切断時は relay を止めるだけ。lease は TTL で自然に失効させる
//! - worker へのコマンドはセッションの送信キュー経由で push（ポーリングしない）

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app::registry::NodeRegistry;
use crate::app::retry::RetryPolicy;
use crate::domain::{
    CommandKind, CoordError, GateError, LeaseBinding, NodeIdentity, NodeKind, Result, SessionId,
    WorkerCommand, WorkerMessage,
};
use crate::ports::{IdGenerator, WorkerChannel, WorkerReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Bound(NodeIdentity),
    Closed,
}

/// Facts learned from workers that must be written back to the task store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// The worker confirmed it is executing the task.
    Confirmed { worker: String, task_name: String },
}

struct SessionHandle {
    session_id: SessionId,
    outbound: mpsc::UnboundedSender<WorkerCommand>,
}

type AckKey = (String, String, CommandKind);
type AckTable = DashMap<AckKey, (u64, oneshot::Sender<()>)>;

/// Removes its ack entry when the waiting future finishes or is dropped.
struct AckWaiter<'a> {
    acks: &'a AckTable,
    key: AckKey,
    id: u64,
}

impl Drop for AckWaiter<'_> {
    fn drop(&mut self) {
        // 同じキーで後から登録された待ち手は残す
        self.acks.remove_if(&self.key, |_, (id, _)| *id == self.id);
    }
}

pub struct SessionManager {
    registry: Arc<NodeRegistry>,
    ids: Arc<dyn IdGenerator>,
    lease_ttl: Duration,
    retry: RetryPolicy,
    sessions: DashMap<String, SessionHandle>,
    reports: DashMap<String, WorkerReport>,
    /// Run commands pushed since the worker's last running list.
    pending_runs: DashMap<String, usize>,
    acks: AckTable,
    next_waiter: AtomicU64,
    signals: mpsc::UnboundedSender<SessionSignal>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        ids: Arc<dyn IdGenerator>,
        lease_ttl: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionSignal>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            registry,
            ids,
            lease_ttl,
            retry: RetryPolicy::for_lease(lease_ttl),
            sessions: DashMap::new(),
            reports: DashMap::new(),
            pending_runs: DashMap::new(),
            acks: DashMap::new(),
            next_waiter: AtomicU64::new(0),
            signals,
        });
        (manager, signal_rx)
    }

    /// A new, unbound session for one transport connection.
    pub fn open(self: &Arc<Self>) -> Session {
        let id = self.ids.generate_session_id();
        debug!(session = %id, "session opened");
        Session {
            id,
            manager: Arc::clone(self),
            state: SessionState::Unbound,
            ticks: None,
            outbound: None,
        }
    }

    fn bind(&self, worker: &str, session_id: SessionId, outbound: mpsc::UnboundedSender<WorkerCommand>) {
        let previous = self.sessions.insert(
            worker.to_string(),
            SessionHandle {
                session_id,
                outbound,
            },
        );
        if let Some(previous) = previous {
            // 新しい接続が優先。古い送信キューはここで閉じる
            warn!(worker = %worker, replaced = %previous.session_id, session = %session_id, "worker reconnected; replacing session");
        }
        self.touch(worker);
    }

    fn unbind(&self, worker: &str, session_id: SessionId) {
        let removed = self
            .sessions
            .remove_if(worker, |_, handle| handle.session_id == session_id);
        if removed.is_some() {
            self.reports.remove(worker);
            self.pending_runs.remove(worker);
            info!(worker = %worker, session = %session_id, "worker session closed");
        }
    }

    fn touch(&self, worker: &str) {
        self.reports
            .entry(worker.to_string())
            .and_modify(|report| report.last_seen = Instant::now())
            .or_insert_with(|| WorkerReport {
                last_seen: Instant::now(),
                running: None,
            });
    }

    fn record_running(&self, worker: &str, running: Vec<String>) {
        let running: HashSet<String> = running.into_iter().collect();
        let newly_running: Vec<String> = {
            let mut report = self
                .reports
                .entry(worker.to_string())
                .or_insert_with(|| WorkerReport {
                    last_seen: Instant::now(),
                    running: None,
                });
            let fresh = running
                .iter()
                .filter(|task| !report.running.as_ref().is_some_and(|prev| prev.contains(*task)))
                .cloned()
                .collect();
            report.last_seen = Instant::now();
            report.running = Some(running);
            fresh
        };
        self.pending_runs.remove(worker);
        for task_name in newly_running {
            self.signal(worker, task_name);
        }
    }

    fn resolve_ack(&self, worker: &str, task_name: &str, command: CommandKind) {
        let key = (worker.to_string(), task_name.to_string(), command);
        if let Some((_, (_, waiter))) = self.acks.remove(&key) {
            let _ = waiter.send(());
        }
        if command == CommandKind::Run {
            self.signal(worker, task_name.to_string());
        }
    }

    fn signal(&self, worker: &str, task_name: String) {
        let _ = self.signals.send(SessionSignal::Confirmed {
            worker: worker.to_string(),
            task_name,
        });
    }

    /// Registers the worker, then renews its lease once per heartbeat tick.
    /// Ends when the session drops its tick sender.
    async fn relay(self: Arc<Self>, identity: NodeIdentity, mut ticks: mpsc::UnboundedReceiver<()>) {
        let Some(mut binding) = self.register_with_retry(&identity, &mut ticks).await else {
            debug!(worker = %identity, "session ended before registration");
            return;
        };

        while ticks.recv().await.is_some() {
            // 溜まった tick は 1 回の更新にまとめる
            while ticks.try_recv().is_ok() {}

            match self.registry.renew(binding.id).await {
                Ok(_) => binding.renewed(),
                Err(GateError::Coordination(CoordError::LeaseNotFound(lease))) => {
                    warn!(worker = %identity, %lease, "worker lease lost; registering again");
                    match self.register_with_retry(&identity, &mut ticks).await {
                        Some(fresh) => binding = fresh,
                        None => break,
                    }
                }
                Err(e) => warn!(worker = %identity, lease = %binding.id, error = %e, "worker keepalive failed"),
            }
        }
        debug!(worker = %identity, lease = %binding.id, "heartbeat relay stopped; lease left to expire");
    }

    /// `None` when the session closes while retrying.
    async fn register_with_retry(
        &self,
        identity: &NodeIdentity,
        ticks: &mut mpsc::UnboundedReceiver<()>,
    ) -> Option<LeaseBinding> {
        let mut attempts = 0u32;
        loop {
            match self.registry.register_self(identity, self.lease_ttl).await {
                Ok(binding) => return Some(binding),
                Err(e) => {
                    attempts += 1;
                    let delay = self.retry.next_delay(attempts);
                    warn!(worker = %identity, attempts, delay_ms = delay.as_millis() as u64, error = %e, "worker registration failed");

                    let deadline = tokio::time::sleep(delay);
                    tokio::pin!(deadline);
                    loop {
                        tokio::select! {
                            _ = &mut deadline => break,
                            tick = ticks.recv() => {
                                if tick.is_none() {
                                    return None;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl WorkerChannel for SessionManager {
    async fn push(&self, worker: &str, command: WorkerCommand) -> Result<()> {
        let Some(handle) = self.sessions.get(worker) else {
            return Err(GateError::Transport(format!(
                "worker {worker} has no session on this gate"
            )));
        };
        debug!(worker = %worker, task = %command.task_name(), command = ?command.kind(), "pushing command");
        let is_run = command.kind() == CommandKind::Run;
        handle
            .outbound
            .send(command)
            .map_err(|_| GateError::Transport(format!("session of worker {worker} is closing")))?;
        drop(handle);
        if is_run {
            *self.pending_runs.entry(worker.to_string()).or_default() += 1;
        }
        Ok(())
    }

    async fn push_and_wait(
        &self,
        worker: &str,
        command: WorkerCommand,
        timeout: Duration,
    ) -> Result<bool> {
        let key = (worker.to_string(), command.task_name().to_string(), command.kind());
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.acks.insert(key.clone(), (id, tx));
        let _waiter = AckWaiter {
            acks: &self.acks,
            key,
            id,
        };

        self.push(worker, command).await?;
        Ok(matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(()))))
    }

    fn connected(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    fn report(&self, worker: &str) -> Option<WorkerReport> {
        self.reports.get(worker).map(|r| r.value().clone())
    }

    fn load(&self, worker: &str) -> usize {
        let reported = self
            .reports
            .get(worker)
            .and_then(|r| r.running.as_ref().map(HashSet::len))
            .unwrap_or(0);
        let pending = self.pending_runs.get(worker).map(|p| *p).unwrap_or(0);
        reported + pending
    }
}

/// One worker connection.
///
/// Dropping the session closes it.
pub struct Session {
    id: SessionId,
    manager: Arc<SessionManager>,
    state: SessionState,
    ticks: Option<mpsc::UnboundedSender<()>>,
    outbound: Option<mpsc::UnboundedReceiver<WorkerCommand>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn worker(&self) -> Option<&NodeIdentity> {
        match &self.state {
            SessionState::Bound(identity) => Some(identity),
            _ => None,
        }
    }

    /// Commands to write to the transport. Available once, after whoami.
    pub fn take_outbound(&mut self) -> Option<mpsc::UnboundedReceiver<WorkerCommand>> {
        self.outbound.take()
    }

    /// Decodes one text frame and applies it.
    ///
    /// An undecodable frame from a bound worker still counts as a heartbeat.
    pub fn on_text(&mut self, text: &str) -> Result<()> {
        match serde_json::from_str::<WorkerMessage>(text) {
            Ok(message) => self.on_message(message),
            Err(e) => match &self.state {
                SessionState::Bound(identity) => {
                    warn!(session = %self.id, worker = %identity, error = %e, "undecodable frame");
                    self.tick();
                    Ok(())
                }
                SessionState::Unbound => {
                    self.close();
                    Err(e.into())
                }
                SessionState::Closed => Err(GateError::Transport("session closed".to_string())),
            },
        }
    }

    pub fn on_message(&mut self, message: WorkerMessage) -> Result<()> {
        let identity = match &self.state {
            SessionState::Unbound => return self.bind(message),
            SessionState::Bound(identity) => identity.clone(),
            SessionState::Closed => {
                return Err(GateError::Transport("session closed".to_string()));
            }
        };
        let worker = identity.key();

        match message {
            WorkerMessage::Whoami { .. } => {
                self.close();
                Err(GateError::Transport(format!("{identity} sent whoami twice")))
            }
            WorkerMessage::Heartbeat { running } => {
                self.tick();
                match running {
                    Some(running) => self.manager.record_running(&worker, running),
                    None => self.manager.touch(&worker),
                }
                Ok(())
            }
            WorkerMessage::Ack { task_name, command } => {
                self.tick();
                self.manager.touch(&worker);
                self.manager.resolve_ack(&worker, &task_name, command);
                Ok(())
            }
        }
    }

    /// `Unbound → Bound`: the only transition a worker can trigger.
    fn bind(&mut self, message: WorkerMessage) -> Result<()> {
        let (name, prefix, address) = match message {
            WorkerMessage::Whoami {
                name,
                prefix,
                address,
            } => (name, prefix, address),
            other => {
                self.close();
                return Err(GateError::Transport(format!(
                    "expected whoami as first message, got {other:?}"
                )));
            }
        };

        let identity = NodeIdentity::new(NodeKind::Runtime, prefix, name, address);
        let worker = identity.key();
        if identity.name.is_empty() || worker.contains('/') {
            self.close();
            return Err(GateError::Validation(format!("invalid worker name {worker:?}")));
        }

        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.manager.bind(&worker, self.id, out_tx);
        tokio::spawn(Arc::clone(&self.manager).relay(identity.clone(), tick_rx));

        info!(session = %self.id, worker = %identity, "worker bound");
        self.ticks = Some(tick_tx);
        self.outbound = Some(out_rx);
        self.state = SessionState::Bound(identity);
        Ok(())
    }

    /// Terminal. Stops the heartbeat relay and drops the worker's command queue.
    pub fn close(&mut self) {
        if let SessionState::Bound(identity) = &self.state {
            self.manager.unbind(&identity.key(), self.id);
        }
        self.ticks = None;
        self.outbound = None;
        self.state = SessionState::Closed;
    }

    fn tick(&self) {
        if let Some(ticks) = &self.ticks {
            let _ = ticks.send(());
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.close();
        }
    }
}
