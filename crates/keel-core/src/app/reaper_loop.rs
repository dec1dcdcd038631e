//! ReaperLoop - worker 消失の検知と回収
//!
//! liveness watch を購読し、worker が消えたらそのタスクを pool に戻して再割り当てします。
//! worker が増えたときも pool を drain します。

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::app::reassign::ReassignmentEngine;
use crate::app::registry::NodeRegistry;
use crate::domain::{LivenessEvent, NodeKind};

pub struct ReaperLoop {
    registry: Arc<NodeRegistry>,
    engine: Arc<ReassignmentEngine>,
}

impl ReaperLoop {
    pub fn new(registry: Arc<NodeRegistry>, engine: Arc<ReassignmentEngine>) -> Self {
        Self { registry, engine }
    }

    pub async fn handle(&self, event: LivenessEvent) {
        match event {
            LivenessEvent::Removed(node) => {
                info!(worker = %node.key(), "worker lost");
                if let Err(e) = self.engine.on_node_lost(&node.key()).await {
                    warn!(worker = %node.key(), error = %e, "reassignment after node loss failed");
                }
            }
            LivenessEvent::Added(node) => {
                info!(worker = %node.key(), address = %node.address, "worker joined");
                if let Err(e) = self.engine.drain_pool().await {
                    warn!(error = %e, "pool drain failed");
                }
            }
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut liveness = self.registry.watch_liveness(NodeKind::Runtime);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let event = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                event = liveness.next() => event,
            };
            self.handle(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::lock::LeaseLock;
    use crate::app::task_store::TaskStore;
    use crate::app::task_store::tests::{RecordingChannel, store_with};
    use crate::domain::{NodeIdentity, TaskDefinition};
    use crate::impls::{InMemoryCoordination, LeastLoadedDispatch};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn expired_worker_loses_its_tasks_to_a_live_one() {
        let coord = Arc::new(InMemoryCoordination::new());
        let channel = Arc::new(RecordingChannel::default());
        let store: Arc<TaskStore> = Arc::new(store_with(coord.clone(), channel.clone()));
        let registry = Arc::new(NodeRegistry::new(coord.clone()));
        let engine = Arc::new(ReassignmentEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            channel.clone(),
            Arc::new(LeastLoadedDispatch::new()),
            LeaseLock::new(coord.clone(), "g1", Duration::from_secs(5)),
        ));

        // w1 は更新されない短い lease、w2 は長い lease
        registry
            .register_self(&NodeIdentity::new(NodeKind::Runtime, "", "w1", ""), Duration::from_secs(4))
            .await
            .unwrap();
        registry
            .register_self(&NodeIdentity::new(NodeKind::Runtime, "", "w2", ""), Duration::from_secs(600))
            .await
            .unwrap();
        channel.connect("w2");
        store
            .create(TaskDefinition::new("a", serde_json::Value::Null))
            .await
            .unwrap();
        store
            .mutate_state("a", |s, now| {
                s.bind("w1", now);
                true
            })
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = tokio::spawn(ReaperLoop::new(registry, engine).run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(6)).await;
        let state = store.get("a").await.unwrap().unwrap().state;
        assert_eq!(state.runtime_node, "w2");

        shutdown_tx.send(true).unwrap();
        reaper.await.unwrap();
    }
}
