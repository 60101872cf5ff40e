pub mod decide;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::WatchEvent;
use tokio_util::sync::CancellationToken;

use decide::{ChangeDecision, EventKind, Key};

use crate::annotations::hash_annotation_key;
use crate::client::ClusterClient;
use crate::executor::{RestartExecutor, annotation_value};
use crate::hash::hash_data;
use crate::util::Error;
use crate::util::time::sleep_cancellable;
use crate::{log_error, log_info, log_warn};

/// Runs the list-then-watch reconciliation loop for one leadership term.
/// All state here (`last_hash`, `pending`, `retry_attempt`, `last_restart`)
/// is touched only from this struct's own async task — there is no locking
/// because there is no sharing.
pub struct Engine {
    client: ClusterClient,
    executor: RestartExecutor,
    selector: BTreeMap<String, String>,
    rollout_annotation_key: String,
    debounce_seconds: u64,
    start: Instant,
    last_hash: HashMap<Key, String>,
    last_restart: HashMap<Key, u64>,
    pending: HashMap<Key, u64>,
    retry_attempt: HashMap<Key, u32>,
    resource_version: String,
    ready: Arc<AtomicBool>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: ClusterClient,
        executor: RestartExecutor,
        selector: BTreeMap<String, String>,
        rollout_annotation_key: String,
        debounce_seconds: u64,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Engine {
            client,
            executor,
            selector,
            rollout_annotation_key,
            debounce_seconds,
            start: Instant::now(),
            last_hash: HashMap::new(),
            last_restart: HashMap::new(),
            pending: HashMap::new(),
            retry_attempt: HashMap::new(),
            resource_version: String::new(),
            ready,
        }
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    fn selector_string(&self) -> String {
        self.selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn nearest_pending_deadline(&self) -> Option<u64> {
        self.pending.values().copied().min()
    }

    /// Runs until `cancel` fires or a fatal (unauthorized) error occurs.
    /// Always force-flushes pending restarts before returning, except when
    /// the initial list itself fails fatally (nothing has run yet, so there
    /// is nothing pending to flush and `ready` stays cleared).
    pub async fn run_forever(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        self.ready.store(false, Ordering::SeqCst);

        match self.initial_list(&cancel).await {
            Ok(false) => return Ok(()), // cancelled during initial-list backoff
            Err(e) => return Err(e),
            Ok(true) => {}
        }

        self.reconcile_drift().await;
        self.ready.store(true, Ordering::SeqCst);
        log_info!(
            "engine ready, resource_version={}",
            self.resource_version
        );

        let result = self.watch_loop(&cancel).await;
        self.ready.store(false, Ordering::SeqCst);
        self.force_flush().await;
        result
    }

    /// Returns `Ok(false)` if cancelled while retrying, `Ok(true)` once the
    /// list succeeds. A 401/403 is fatal RBAC misconfiguration and is
    /// returned as `Err` so `run_forever` can exit immediately with `ready`
    /// left cleared, without reconciling drift or opening a watch.
    async fn initial_list(&mut self, cancel: &CancellationToken) -> Result<bool, Error> {
        let mut backoff = 1.0_f64;
        loop {
            match self.client.list_configmaps(&self.selector_string()).await {
                Ok(list) => {
                    self.resource_version =
                        list.metadata.resource_version.clone().unwrap_or_default();
                    for cm in &list.items {
                        if let Some(key) = key_for(cm) {
                            self.last_hash.insert(key, hash_data(cm.data.as_ref()));
                        }
                    }
                    return Ok(true);
                }
                Err(Error::Unauthorized { source }) => {
                    log_error!(
                        "initial list unauthorized (check RBAC), giving up: {source}"
                    );
                    return Err(Error::Unauthorized { source });
                }
                Err(e) => {
                    log_warn!("initial list failed, retrying: {e}");
                    let delay = decide::jittered_delay_secs(backoff, rand::random::<f64>());
                    backoff = decide::next_backoff_secs(backoff);
                    if sleep_cancellable(delay, cancel).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn reconcile_drift(&mut self) {
        let mut by_env: HashMap<String, Vec<Key>> = HashMap::new();
        for key in self.last_hash.keys() {
            by_env.entry(key.env.clone()).or_default().push(key.clone());
        }
        for (env, keys) in by_env {
            let selector = self.executor.selector_for_env(&env);
            let deployments = match self.client.list_deployments(&selector).await {
                Ok(list) => list,
                Err(e) => {
                    log_warn!(
                        "drift reconciliation: listing deployments for env {env} failed: {e}"
                    );
                    continue;
                }
            };
            for key in keys {
                let Some(expected_hash) = self.last_hash.get(&key).cloned() else {
                    continue;
                };
                let hash_key =
                    hash_annotation_key(&self.rollout_annotation_key, &key.configmap_name);
                let needs = deployments.items.iter().any(|dep| {
                    let hash_annotation = annotation_value(dep, &hash_key);
                    let rollout_present =
                        annotation_value(dep, &self.rollout_annotation_key).is_some();
                    decide::classify_drift(
                        hash_annotation.as_deref(),
                        rollout_present,
                        &expected_hash,
                    )
                    .needs_reconcile()
                });
                if needs {
                    log_info!(
                        "startup drift detected for {}/{}, reconciling",
                        key.env,
                        key.configmap_name
                    );
                    let now = self.now();
                    self.execute(&key, now).await;
                }
            }
        }
    }

    async fn watch_loop(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut backoff = 1.0_f64;
        let mut first_open = true;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let now = self.now();
            self.drain(now).await;

            let timeout = decide::watch_timeout_secs(self.now(), self.nearest_pending_deadline());
            let stream = match self
                .client
                .watch_configmaps(&self.selector_string(), &self.resource_version, timeout)
                .await
            {
                Ok(s) => {
                    if first_open {
                        first_open = false;
                    } else {
                        metrics::counter!("watch_reconnects_total").increment(1);
                    }
                    s
                }
                Err(Error::Unauthorized { source }) => {
                    log_error!("watch unauthorized, exiting: {source}");
                    return Err(Error::Unauthorized { source });
                }
                Err(Error::HistoryCompacted) => {
                    log_warn!("watch history compacted, re-listing");
                    match self.relist_and_sync().await {
                        Ok(true) => backoff = 1.0,
                        Ok(false) => {
                            let delay = decide::jittered_delay_secs(backoff, rand::random::<f64>());
                            backoff = decide::next_backoff_secs(backoff);
                            if sleep_cancellable(delay, cancel).await {
                                return Ok(());
                            }
                        }
                        Err(e) => return Err(e),
                    }
                    continue;
                }
                Err(e) => {
                    log_warn!("opening watch failed, retrying: {e}");
                    let delay = decide::jittered_delay_secs(backoff, rand::random::<f64>());
                    backoff = decide::next_backoff_secs(backoff);
                    if sleep_cancellable(delay, cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            futures::pin_mut!(stream);

            let mut stream_errored = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = stream.next() => {
                        match next {
                            None => break,
                            Some(Ok(event)) => {
                                if let Some(rv) = event_resource_version(&event) {
                                    self.resource_version = rv;
                                }
                                self.handle_watch_event(event).await;
                                let now = self.now();
                                self.drain(now).await;
                            }
                            Some(Err(e)) => {
                                let err = Error::from_kube(e);
                                match err {
                                    Error::Unauthorized { source } => {
                                        log_error!("watch stream unauthorized, exiting: {source}");
                                        return Err(Error::Unauthorized { source });
                                    }
                                    Error::HistoryCompacted => {
                                        log_warn!("watch stream compacted mid-stream, re-listing");
                                        match self.relist_and_sync().await {
                                            Ok(true) => {}
                                            Ok(false) => stream_errored = true,
                                            Err(e) => return Err(e),
                                        }
                                    }
                                    _ => {
                                        log_warn!("watch stream error: {err}");
                                        stream_errored = true;
                                    }
                                }
                                break;
                            }
                        }
                    }
                }
            }

            if stream_errored {
                let delay = decide::jittered_delay_secs(backoff, rand::random::<f64>());
                backoff = decide::next_backoff_secs(backoff);
                if sleep_cancellable(delay, cancel).await {
                    return Ok(());
                }
            } else {
                backoff = 1.0;
            }
        }
    }

    /// Re-lists after a 410 and syncs the hash cache, scheduling a restart
    /// for any key whose content changed while the watch was stale.
    ///
    /// Returns `Ok(true)` on a successful re-list, `Ok(false)` if the
    /// re-list itself hit a transient (non-auth) error — logged here and
    /// left for the caller's own backoff, never propagated as a watch-loop
    /// failure. Only `Unauthorized` is fatal.
    async fn relist_and_sync(&mut self) -> Result<bool, Error> {
        let list = match self.client.list_configmaps(&self.selector_string()).await {
            Ok(list) => list,
            Err(Error::Unauthorized { source }) => return Err(Error::Unauthorized { source }),
            Err(e) => {
                log_warn!("re-list after history compaction failed, will retry: {e}");
                self.resource_version.clear();
                return Ok(false);
            }
        };
        self.resource_version = list
            .metadata
            .resource_version
            .clone()
            .unwrap_or_else(|| self.resource_version.clone());
        for cm in &list.items {
            let Some(key) = key_for(cm) else { continue };
            let current_hash = hash_data(cm.data.as_ref());
            let previous = self.last_hash.insert(key.clone(), current_hash.clone());
            if previous.as_deref() != Some(current_hash.as_str()) {
                let now = self.now();
                self.schedule(&key, now);
            }
        }
        Ok(true)
    }

    async fn handle_watch_event(&mut self, event: WatchEvent<ConfigMap>) {
        let (kind, cm) = match event {
            WatchEvent::Added(cm) => (EventKind::Added, cm),
            WatchEvent::Modified(cm) => (EventKind::Modified, cm),
            WatchEvent::Deleted(cm) => (EventKind::Deleted, cm),
            WatchEvent::Bookmark(_) => return,
            WatchEvent::Error(e) => {
                log_warn!("watch stream reported object error: {e:?}");
                return;
            }
        };

        let labels = cm.metadata.labels.clone().unwrap_or_default();
        if !decide::passes_filter(kind, &labels, &self.selector) {
            return;
        }
        let Some(key) = decide::extract_key(&labels, cm.metadata.name.as_deref()) else {
            return;
        };

        let current_hash = hash_data(cm.data.as_ref());
        let previous_hash = self.last_hash.insert(key.clone(), current_hash.clone());
        if let ChangeDecision::Changed =
            decide::classify_change(kind, previous_hash.as_deref(), &current_hash)
        {
            let now = self.now();
            self.schedule(&key, now);
        }
    }

    /// Applies the debounce decision for `key` at time `now`: either marks
    /// it due immediately or defers it into `pending`.
    fn schedule(&mut self, key: &Key, now: u64) {
        let remaining = decide::debounce_remaining(
            self.debounce_seconds,
            now,
            self.last_restart.get(key).copied(),
        );
        if remaining == 0 {
            self.retry_attempt.remove(key);
            self.pending.insert(key.clone(), now);
        } else {
            metrics::counter!("debounce_suppressed_total").increment(1);
            let candidate = now + remaining;
            let deadline = decide::coalesce_deadline(self.pending.get(key).copied(), candidate);
            self.pending.insert(key.clone(), deadline);
            self.retry_attempt.remove(key);
        }
        metrics::gauge!("pending_queue_depth").set(self.pending.len() as f64);
    }

    /// Executes every key whose deadline has arrived.
    async fn drain(&mut self, now: u64) {
        let due: Vec<Key> = self
            .pending
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            self.execute(&key, now).await;
        }
    }

    async fn execute(&mut self, key: &Key, now: u64) {
        let Some(content_hash) = self.last_hash.get(key).cloned() else {
            self.pending.remove(key);
            self.retry_attempt.remove(key);
            return;
        };
        let result = self
            .executor
            .restart_matching(&key.env, &key.configmap_name, &content_hash)
            .await;
        metrics::counter!("restart_total").increment(result.restarted as u64);
        if result.failed > 0 {
            metrics::counter!("restart_failed_total").increment(result.failed as u64);
            metrics::counter!("retry_attempts_total").increment(1);
            let attempt = self.retry_attempt.get(key).copied().unwrap_or(0) + 1;
            self.retry_attempt.insert(key.clone(), attempt);
            let delay = decide::retry_backoff_secs(attempt);
            self.pending.insert(key.clone(), now + delay);
        } else {
            self.last_restart.insert(key.clone(), now);
            self.pending.remove(key);
            self.retry_attempt.remove(key);
        }
        metrics::gauge!("pending_queue_depth").set(self.pending.len() as f64);
    }

    /// Shutdown-time drain: execute every remaining pending key once and
    /// drop it regardless of outcome, so shutdown never blocks.
    async fn force_flush(&mut self) {
        let keys: Vec<Key> = self.pending.keys().cloned().collect();
        for key in keys {
            if let Some(content_hash) = self.last_hash.get(&key).cloned() {
                let result = self
                    .executor
                    .restart_matching(&key.env, &key.configmap_name, &content_hash)
                    .await;
                if result.failed > 0 {
                    metrics::counter!("dropped_on_shutdown_total").increment(1);
                    log_warn!(
                        "dropping pending restart for {}/{} at shutdown after repeated failure",
                        key.env,
                        key.configmap_name
                    );
                }
            }
            self.pending.remove(&key);
            self.retry_attempt.remove(&key);
        }
    }
}

fn key_for(cm: &ConfigMap) -> Option<Key> {
    let labels = cm.metadata.labels.clone().unwrap_or_default();
    decide::extract_key(&labels, cm.metadata.name.as_deref())
}

fn event_resource_version(event: &WatchEvent<ConfigMap>) -> Option<String> {
    let cm = match event {
        WatchEvent::Added(cm) | WatchEvent::Modified(cm) | WatchEvent::Deleted(cm) => cm,
        _ => return None,
    };
    cm.metadata.resource_version.clone()
}
