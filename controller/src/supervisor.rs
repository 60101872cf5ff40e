use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::client::ClusterClient;
use crate::elector::LeaderState;
use crate::engine::Engine;
use crate::executor::RestartExecutor;
use crate::{log_error, log_info};

type EngineRun = (CancellationToken, oneshot::Receiver<()>);

/// Wires leadership transitions to engine lifecycle: starts a fresh engine
/// on acquisition, stops and joins it (with a bounded timeout) on loss, and
/// treats an engine that exits on its own as an unexpected crash that
/// forces a full process shutdown — never leaving a zombie watch loop.
pub struct Supervisor {
    client: ClusterClient,
    base_selector: BTreeMap<String, String>,
    rollout_annotation_key: String,
    debounce_seconds: u64,
    engine_ready: Arc<AtomicBool>,
    stop_timeout: Duration,
    shutdown: CancellationToken,
    state: Mutex<Option<EngineRun>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: ClusterClient,
        base_selector: BTreeMap<String, String>,
        rollout_annotation_key: String,
        debounce_seconds: u64,
        engine_ready: Arc<AtomicBool>,
        stop_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Supervisor {
            client,
            base_selector,
            rollout_annotation_key,
            debounce_seconds,
            engine_ready,
            stop_timeout,
            shutdown,
            state: Mutex::new(None),
        }
    }

    pub async fn run(&self, mut state_rx: watch::Receiver<LeaderState>, leader_ready: Arc<AtomicBool>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    if self.state.lock().await.is_some() {
                        self.on_stopped_leading(&leader_ready).await;
                    }
                    break;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state_rx.borrow();
                    match current {
                        LeaderState::Leading => self.on_started_leading(&leader_ready).await,
                        LeaderState::Standby => self.on_stopped_leading(&leader_ready).await,
                    }
                }
            }
        }
    }

    fn build_engine(&self) -> Engine {
        let executor = RestartExecutor::new(
            self.client.clone(),
            self.base_selector.clone(),
            self.rollout_annotation_key.clone(),
        );
        Engine::new(
            self.client.clone(),
            executor,
            self.base_selector.clone(),
            self.rollout_annotation_key.clone(),
            self.debounce_seconds,
            self.engine_ready.clone(),
        )
    }

    async fn on_started_leading(&self, leader_ready: &Arc<AtomicBool>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            log_error!("leadership acquired while a previous engine run is still tracked; forcing shutdown");
            self.shutdown.cancel();
            return;
        }

        let engine_cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let task_cancel = engine_cancel.clone();
        let shutdown = self.shutdown.clone();
        let mut engine = self.build_engine();

        tokio::spawn(async move {
            let result = engine.run_forever(task_cancel.clone()).await;
            if let Err(e) = &result {
                log_error!("engine exited with error: {e}");
            }
            if !task_cancel.is_cancelled() && !shutdown.is_cancelled() {
                log_error!("engine exited unexpectedly without a stop request; forcing shutdown");
                shutdown.cancel();
            }
            let _ = done_tx.send(());
        });

        *guard = Some((engine_cancel, done_rx));
        leader_ready.store(true, Ordering::SeqCst);
        log_info!("supervisor: engine started");
    }

    async fn on_stopped_leading(&self, leader_ready: &Arc<AtomicBool>) {
        leader_ready.store(false, Ordering::SeqCst);
        let Some((engine_cancel, done_rx)) = self.state.lock().await.take() else {
            return;
        };
        engine_cancel.cancel();
        match tokio::time::timeout(self.stop_timeout, done_rx).await {
            Ok(_) => log_info!("supervisor: engine stopped cleanly"),
            Err(_) => {
                log_error!(
                    "engine did not stop within {:?}; forcing process shutdown",
                    self.stop_timeout
                );
                self.shutdown.cancel();
            }
        }
    }
}
