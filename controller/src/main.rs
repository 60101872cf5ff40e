mod annotations;
mod client;
mod config;
mod elector;
mod engine;
mod executor;
mod hash;
mod supervisor;
mod util;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use kube::Client;
use owo_colors::OwoColorize;
use shipshape_common::metrics::{HealthState, run_health_server};
use shipshape_common::shutdown::shutdown_signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use client::ClusterClient;
use config::Config;
use elector::{Elector, ElectorConfig, LeaderState};
use engine::Engine;
use executor::RestartExecutor;
use supervisor::Supervisor;

use crate::{log_error, log_info};

#[tokio::main]
async fn main() {
    shipshape_common::init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", format!("🛑 invalid configuration: {e}").red());
            std::process::exit(1);
        }
    };

    log_info!(
        "shipshape-controller starting • namespace={} selector={} leader_election={}",
        config.watch_namespace,
        config.app_selector,
        config.leader_election_enabled
    );

    let kube_client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            log_error!("failed to build kubernetes client: {e}");
            std::process::exit(1);
        }
    };
    let client = ClusterClient::new(kube_client, &config.watch_namespace);

    let selector = config
        .selector_clauses()
        .expect("already validated in Config::from_env");

    let shutdown = CancellationToken::new();
    let engine_ready = Arc::new(AtomicBool::new(false));
    let leader_ready = Arc::new(AtomicBool::new(!config.leader_election_enabled));

    let health_state = HealthState {
        engine_ready: engine_ready.clone(),
        leader_ready: leader_ready.clone(),
        identity: config.leader_election_identity.clone(),
    };
    let health_port = config.health_port;
    tokio::spawn(run_health_server(health_port, health_state));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    if config.leader_election_enabled {
        let elector = Elector::new(
            client.clone(),
            ElectorConfig {
                lease_name: config.leader_election_lease_name.clone(),
                identity: config.leader_election_identity.clone(),
                lease_duration_secs: config.lease_duration_seconds,
                renew_deadline_secs: config.renew_deadline_seconds,
                retry_period_secs: config.retry_period_seconds,
            },
        );
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);

        let supervisor = Supervisor::new(
            client.clone(),
            selector.clone(),
            config.rollout_annotation_key.clone(),
            config.debounce_seconds,
            engine_ready.clone(),
            Duration::from_secs(config.controller_stop_timeout_seconds),
            shutdown.clone(),
        );

        let elector_cancel = shutdown.clone();
        let elector_handle = tokio::spawn(async move {
            elector.run(elector_cancel, state_tx).await;
        });
        let supervisor_handle =
            tokio::spawn(async move { supervisor.run(state_rx, leader_ready).await });

        let _ = tokio::join!(elector_handle, supervisor_handle);
    } else {
        let executor = RestartExecutor::new(
            client.clone(),
            selector.clone(),
            config.rollout_annotation_key.clone(),
        );
        let mut engine = Engine::new(
            client,
            executor,
            selector,
            config.rollout_annotation_key.clone(),
            config.debounce_seconds,
            engine_ready,
        );
        if let Err(e) = engine.run_forever(shutdown.clone()).await {
            log_error!("engine exited with error: {e}");
        }
    }

    log_info!("shipshape-controller stopped");
}
