//! Composition root (`spec.md` §2, §9 "a composition root wires every
//! component's collaborators explicitly"): tracing init, config load,
//! background loops spawned alongside the axum server, all joined on
//! shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use runnerhub::api::{self, ApiState};
use runnerhub::autoscaler::prewarmer::PreWarmer;
use runnerhub::autoscaler::{self, AutoScaler};
use runnerhub::config::Settings;
use runnerhub::containers::lifecycle::{run_cleanup_loop, run_monitor_loop};
use runnerhub::containers::{ContainerLifecycle, DockerRuntime};
use runnerhub::events_bus::EventBus;
use runnerhub::github::GitHubRegistrar;
use runnerhub::ha::{self, HaCoordinator};
use runnerhub::pool::{self, PoolManager};
use runnerhub::queue::{self, JobQueue};
use runnerhub::store::{RedisStore, SharedStore};
use runnerhub::webhook::{self, WebhookState};

const DISPATCHER_WORKERS: usize = 4;
const DISPATCHER_BATCH_SIZE: usize = 10;
/// `spec.md` §4.6: "stop within 1s" of `became_follower`.
const LEADER_GATED_STOP_GRACE: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(EnvFilter::from_default_env())
        .init();

    let settings = Settings::load()?;
    let events = Arc::new(EventBus::new());
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&settings.network.cache_url).await?);

    let registrar = Arc::new(GitHubRegistrar::new(
        settings.github.org.clone(),
        settings.github.token.clone(),
    )?);
    let runtime = Arc::new(DockerRuntime::connect()?);
    let lifecycle = Arc::new(ContainerLifecycle::new(
        runtime.clone(),
        store.clone(),
        registrar,
        events.clone(),
    ));
    let prewarmer = Arc::new(PreWarmer::new(
        runtime,
        store.clone(),
        lifecycle.clone(),
        settings.prewarm.clone(),
    ));
    let pool_manager = Arc::new(
        PoolManager::new(store.clone(), lifecycle.clone(), events.clone()).with_prewarmer(prewarmer.clone()),
    );
    let job_queue = Arc::new(JobQueue::new(store.clone(), events.clone()));
    let autoscaler = Arc::new(AutoScaler::new(
        store.clone(),
        pool_manager.clone(),
        prewarmer,
        settings.scaling.clone(),
        settings.prewarm.clone(),
        settings.budget.clone(),
    ));
    let ha_coordinator = Arc::new(HaCoordinator::new(store.clone(), events.clone(), settings.ha.clone()));

    // Data-plane: runs on every node regardless of leadership (`spec.md` §4.6).
    let webhook_state = WebhookState::new(
        job_queue.clone(),
        events.clone(),
        pool_manager.clone(),
        settings.github.webhook_secret.clone(),
    );
    let api_state = ApiState {
        store: store.clone(),
        queue: job_queue.clone(),
        pool_manager: pool_manager.clone(),
        lifecycle: lifecycle.clone(),
        ha: ha_coordinator.clone(),
    };
    let app = Router::new()
        .merge(webhook::router(webhook_state))
        .merge(api::router(api_state));

    let data_plane_cancel = CancellationToken::new();
    let ha_cancel = CancellationToken::new();

    let mut background = Vec::new();
    background.push(tokio::spawn(queue::run_recovery_loop(
        job_queue.clone(),
        data_plane_cancel.child_token(),
    )));
    background.push(tokio::spawn(ha::run_ha_loop(ha_coordinator.clone(), ha_cancel.clone())));

    // Control loops: single-writer, leader-gated, started/stopped as
    // leadership flips (`spec.md` §4.6 "on became_leader, they start; on
    // became_follower, they stop within 1s").
    let control_loops = Arc::new(ControlLoops {
        job_queue,
        pool_manager,
        lifecycle,
        autoscaler,
    });
    background.push(tokio::spawn(run_leader_gated_loops(
        control_loops,
        ha_coordinator.clone(),
        events.clone(),
        data_plane_cancel.child_token(),
    )));

    let addr: SocketAddr = settings.network.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "runnerhub listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, relinquishing leadership and draining in-flight dispatchers");
    ha_cancel.cancel();
    data_plane_cancel.cancel();
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(background)).await;

    Ok(())
}

struct ControlLoops {
    job_queue: Arc<JobQueue>,
    pool_manager: Arc<PoolManager>,
    lifecycle: Arc<ContainerLifecycle>,
    autoscaler: Arc<AutoScaler>,
}

/// Watches `EventBus`'s leader channel and spawns/cancels the leader-gated
/// control loops (C2 dispatcher, C3 pool scaler, C4 monitor/cleanup, C5
/// predictor/controller/prewarmer) in lockstep with this node's role.
async fn run_leader_gated_loops(
    loops: Arc<ControlLoops>,
    ha: Arc<HaCoordinator>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
) {
    let mut leader_rx = events.subscribe_leader();
    let mut current: Option<(CancellationToken, Vec<tokio::task::JoinHandle<()>>)> = None;

    if ha.is_leader() {
        current = Some(spawn_control_loops(&loops, &cancel));
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some((token, handles)) = current.take() {
                    stop_control_loops(token, handles).await;
                }
                return;
            }
            event = leader_rx.recv() => {
                match event {
                    Ok(event) if event.became_leader => {
                        if current.is_none() {
                            info!(node_id = %event.node_id, term = event.term, "became leader, starting control loops");
                            current = Some(spawn_control_loops(&loops, &cancel));
                        }
                    }
                    Ok(event) => {
                        if let Some((token, handles)) = current.take() {
                            info!(node_id = %event.node_id, term = event.term, "became follower, stopping control loops");
                            stop_control_loops(token, handles).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

fn spawn_control_loops(
    loops: &Arc<ControlLoops>,
    parent: &CancellationToken,
) -> (CancellationToken, Vec<tokio::task::JoinHandle<()>>) {
    let token = parent.child_token();
    let handles = vec![
        tokio::spawn(queue::run_dispatcher(
            loops.job_queue.clone(),
            loops.pool_manager.clone(),
            loops.pool_manager.clone(),
            DISPATCHER_WORKERS,
            DISPATCHER_BATCH_SIZE,
            token.child_token(),
        )),
        tokio::spawn(pool::run_scaling_loop(loops.pool_manager.clone(), token.child_token())),
        tokio::spawn(run_monitor_loop(loops.lifecycle.clone(), token.child_token())),
        tokio::spawn(run_cleanup_loop(loops.lifecycle.clone(), token.child_token())),
        tokio::spawn(autoscaler::run_metrics_loop(loops.autoscaler.clone(), token.child_token())),
        tokio::spawn(autoscaler::run_coordinator_loop(
            loops.autoscaler.clone(),
            token.child_token(),
        )),
        tokio::spawn(autoscaler::run_prewarm_loop(loops.autoscaler.clone(), token.child_token())),
    ];
    (token, handles)
}

async fn stop_control_loops(token: CancellationToken, handles: Vec<tokio::task::JoinHandle<()>>) {
    token.cancel();
    if tokio::time::timeout(LEADER_GATED_STOP_GRACE, futures::future::join_all(handles))
        .await
        .is_err()
    {
        warn!("control loops did not stop within the 1s leadership grace period");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
