use crate::cli::actions::Action;
use crate::config::Config;
use crate::lag::LagTracker;
use crate::monitor::ClusterMonitor;
use crate::state::ClusterState;
use crate::stats::Stats;
use crate::supervisor::Supervisor;
use crate::webserver;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info};

/// Wire up the shared state, channels, and the three long-lived tasks, then
/// drive the supervisor until shutdown.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded at startup or a
/// task cannot be set up.
pub async fn handle(action: Action) -> Result<()> {
    let Action::Run {
        config: config_path,
    } = action;

    // an invalid configuration is fatal at startup; on SIGHUP reloads the
    // supervisor keeps the previous one instead
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        own_db = ?config.own_db,
        peers = config.remote_conns.len(),
        observers = config.observers.len(),
        "pg_sentinel initialized"
    );

    let http_address = config.http_address.clone();
    let http_port = config.http_port;

    let config = Arc::new(RwLock::new(config));
    let state = Arc::new(ClusterState::new());
    let stats = Arc::new(Stats::new());
    let running = Arc::new(AtomicBool::new(true));
    let lag_tracker = LagTracker::new();

    // check requests flow from the HTTP handler to the monitor; completion
    // acks flow from the monitor to the supervisor's decision loop
    let (check_tx, check_rx) = mpsc::channel(16);
    let (decision_tx, decision_rx) = mpsc::channel(16);

    let monitor = ClusterMonitor::new(
        Arc::clone(&config),
        Arc::clone(&state),
        Arc::clone(&stats),
        Arc::clone(&running),
        lag_tracker.warning_flag(),
        check_rx,
        decision_tx,
    )?;
    tokio::spawn(monitor.run());

    let webserver_state = Arc::clone(&state);
    let webserver_running = Arc::clone(&running);
    tokio::spawn(async move {
        if let Err(err) = webserver::serve(
            &http_address,
            http_port,
            webserver_state,
            check_tx,
            webserver_running,
        )
        .await
        {
            error!("webserver failed: {err:#}");
        }
    });

    let supervisor = Supervisor::new(
        config_path,
        config,
        state,
        stats,
        running,
        lag_tracker,
        decision_rx,
    );
    supervisor.run().await
}
