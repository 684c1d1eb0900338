//! The decision loop.
//!
//! The supervisor owns the daemon lifecycle: it reloads configuration on
//! SIGHUP, begins shutdown on SIGINT/SIGTERM, and on every tick snapshots the
//! shared state, merges it into a node map, follows master changes, checks
//! the local replication lag, runs the failover decision when warranted, and
//! dumps the overall state to the JSON status file.

use crate::alerts::{self, Alert};
use crate::config::Config;
use crate::dsn;
use crate::failover::{self, FailoverDecision, execute_external_command};
use crate::lag::{LagCheck, LagTracker};
use crate::merge::{NodeMap, create_node_map};
use crate::state::{ClusterState, MemberState};
use crate::stats::Stats;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{RwLock, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub struct Supervisor {
    config_path: PathBuf,
    config: Arc<RwLock<Config>>,
    state: Arc<ClusterState>,
    stats: Arc<Stats>,
    running: Arc<AtomicBool>,
    lag_tracker: LagTracker,
    decision_rx: mpsc::Receiver<String>,
    current_master: Option<String>,
    /// When the set of configured cluster nodes last changed; used for the
    /// cold-start failover timeout.
    cluster_nodes_change_time: Instant,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        config_path: PathBuf,
        config: Arc<RwLock<Config>>,
        state: Arc<ClusterState>,
        stats: Arc<Stats>,
        running: Arc<AtomicBool>,
        lag_tracker: LagTracker,
        decision_rx: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            config_path,
            config,
            state,
            stats,
            running,
            lag_tracker,
            decision_rx,
            current_master: None,
            cluster_nodes_change_time: Instant::now(),
        }
    }

    /// Run decision passes until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be installed.
    pub async fn run(mut self) -> Result<()> {
        let mut sighup =
            signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        info!("supervisor started");
        while self.running.load(Ordering::Relaxed) {
            let check_interval = self
                .config
                .read()
                .await
                .replication_state_check_interval();
            tokio::select! {
                _ = sighup.recv() => {
                    info!("Received SIGHUP signal, reloading configuration");
                    self.reload_config().await;
                }
                _ = sigint.recv() => {
                    warn!("Received SIGINT signal, quitting");
                    self.running.store(false, Ordering::Relaxed);
                }
                _ = sigterm.recv() => {
                    warn!("Received SIGTERM signal, quitting");
                    self.running.store(false, Ordering::Relaxed);
                }
                received = timeout(check_interval, self.decision_rx.recv()) => {
                    match received {
                        Ok(Some(reason)) => debug!(reason, "decision pass requested"),
                        Ok(None) => {
                            // the monitor is gone; keep the periodic cadence
                            tokio::time::sleep(check_interval).await;
                        }
                        Err(_) => {} // periodic pass
                    }
                    if let Err(err) = self.check_cluster_state().await {
                        self.stats.unexpected_error("check_cluster_state", &err);
                    }
                    self.write_cluster_state_to_json_file().await;
                }
            }
        }
        info!("supervisor stopped");
        Ok(())
    }

    pub async fn reload_config(&mut self) {
        debug!(path = %self.config_path.display(), "loading JSON config");
        match Config::load(&self.config_path) {
            Ok(new_config) => {
                let mut config = self.config.write().await;
                if config.remote_conns != new_config.remote_conns {
                    self.cluster_nodes_change_time = Instant::now();
                }
                *config = new_config;
                info!("configuration reloaded");
            }
            Err(err) => {
                error!("invalid configuration, keeping the previous one: {err:#}");
            }
        }
    }

    async fn check_cluster_state(&mut self) -> Result<()> {
        let (cluster_state, observer_state) = self.state.snapshot().await;
        if cluster_state.is_empty() {
            warn!("no cluster state, probably still starting up");
            return Ok(());
        }
        let config = self.config.read().await.clone();

        let node_map =
            create_node_map(&cluster_state, &observer_state, config.own_db.as_deref());
        if node_map.multiple_masters {
            alerts::create_alert_file(&config.alert_file_dir(), Alert::MultipleMasterWarning);
            return Ok(());
        }

        if let Some(master_host) = node_map.master_host.clone()
            && self.current_master.as_deref() != Some(master_host.as_str())
        {
            info!(
                old = ?self.current_master,
                new = %master_host,
                "new master node detected"
            );
            self.current_master = Some(master_host.clone());
            if config.autofollow
                && config
                    .own_db
                    .as_deref()
                    .is_some_and(|own_db| own_db != master_host)
            {
                self.start_following_new_master(&config, &master_host).await;
            }
        }

        let Some(own_db) = config.own_db.clone() else {
            debug!("pure observer, not considering failover");
            return Ok(());
        };
        if self.current_master.as_deref() == Some(own_db.as_str()) {
            debug!(own_db, "we are still the master node of this cluster, nothing to do");
            return Ok(());
        }
        let Some(own_state) = cluster_state.get(&own_db).cloned() else {
            warn!(own_db, "own state has not been fetched yet");
            return Ok(());
        };
        if node_map.standby_nodes.is_empty() {
            warn!(master = ?node_map.master_host, "no standby nodes set");
            return Ok(());
        }

        self.consider_failover(&config, &node_map, &own_state, &own_db)
            .await;
        Ok(())
    }

    async fn consider_failover(
        &mut self,
        config: &Config,
        node_map: &NodeMap,
        own_state: &MemberState,
        own_db: &str,
    ) {
        if node_map.master_node.is_none() {
            warn!(
                standbys = node_map.standby_nodes.len(),
                seconds_since_node_change = self.cluster_nodes_change_time.elapsed().as_secs_f64(),
                failover_timeout = config.max_failover_replication_time_lag,
                "no master node in cluster"
            );
            if self.current_master.is_some() {
                // we have seen a master at some point, but now it is gone
                // entirely; promote one of the standbys right away
                warn!("performing failover decision because the existing master node disappeared");
                self.do_failover_decision(config, node_map, own_db).await;
                return;
            }
            if self.cluster_nodes_change_time.elapsed().as_secs_f64()
                >= config.max_failover_replication_time_lag
            {
                warn!("performing failover decision because no master node was seen before the timeout");
                self.do_failover_decision(config, node_map, own_db).await;
                return;
            }
        }

        if self.lag_tracker.check(own_state, config).await == LagCheck::OverCritical {
            self.do_failover_decision(config, node_map, own_db).await;
        }
    }

    async fn do_failover_decision(&self, config: &Config, node_map: &NodeMap, own_db: &str) {
        let decision =
            failover::do_failover_decision(config, node_map, own_db, &self.lag_tracker).await;
        if let FailoverDecision::Promoted { return_code } = decision {
            warn!(return_code, "failover to ourselves attempted");
        }
    }

    async fn start_following_new_master(&self, config: &Config, new_master_host: &str) {
        let start_time = Instant::now();
        let updated =
            match modify_recovery_conf_to_point_at_new_master(config, new_master_host) {
                Ok(updated) => updated,
                Err(err) => {
                    self.stats.unexpected_error("start_following_new_master", &err);
                    return;
                }
            };
        if !updated {
            info!(
                new_master_host,
                "already following master, no need to start following it again"
            );
            return;
        }
        info!(
            new_master_host,
            pg_stop_command = %config.pg_stop_command,
            pg_start_command = %config.pg_start_command,
            "starting to follow new master, modified recovery configuration and restarting PostgreSQL"
        );
        execute_external_command(&config.pg_stop_command).await;
        execute_external_command(&config.pg_start_command).await;
        info!(
            new_master_host,
            took = ?start_time.elapsed(),
            "started following new master"
        );
    }

    async fn write_cluster_state_to_json_file(&self) {
        let start_time = Instant::now();
        let state_file_path = self.config.read().await.json_state_file_path.clone();
        let (db_nodes, observer_nodes) = self.state.snapshot().await;
        let overall_state = serde_json::json!({
            "db_nodes": db_nodes,
            "observer_nodes": observer_nodes,
            "current_master": self.current_master,
        });

        let json_to_dump = match serde_json::to_string_pretty(&overall_state) {
            Ok(json) => json,
            Err(err) => {
                error!(%err, "problem serializing cluster state");
                return;
            }
        };
        debug!(
            path = %state_file_path.display(),
            file_size = json_to_dump.len(),
            "writing JSON state file"
        );
        let temp_path = PathBuf::from(format!("{}.tmp", state_file_path.display()));
        let written: Result<()> = async {
            tokio::fs::write(&temp_path, &json_to_dump).await?;
            tokio::fs::rename(&temp_path, &state_file_path).await?;
            Ok(())
        }
        .await;
        match written {
            Ok(()) => debug!(took = ?start_time.elapsed(), "wrote JSON state file to disk"),
            Err(err) => error!(
                path = %state_file_path.display(),
                "problem writing JSON state file to disk: {err:#}"
            ),
        }
    }

    #[must_use]
    pub fn current_master(&self) -> Option<&str> {
        self.current_master.as_deref()
    }
}

/// Rewrite `recovery.conf` so the local standby streams from the newly
/// promoted master. Returns false when the file already points there and has
/// a recovery target timeline, in which case nothing was written.
///
/// # Errors
///
/// Returns an error if `pg_data_directory` or the conninfo template are
/// missing, or on any filesystem failure.
pub fn modify_recovery_conf_to_point_at_new_master(
    config: &Config,
    new_master_host: &str,
) -> Result<bool> {
    let data_directory = config
        .pg_data_directory
        .as_ref()
        .context("pg_data_directory is not configured")?;
    let path_to_recovery_conf = data_directory.join("recovery.conf");
    let old_conf = std::fs::read_to_string(&path_to_recovery_conf).with_context(|| {
        format!("failed to read {}", path_to_recovery_conf.display())
    })?;

    let mut has_recovery_target_timeline = false;
    let mut old_conn_info = None;
    let mut new_conf: Vec<String> = Vec::new();
    for line in old_conf.lines() {
        if line.starts_with("recovery_target_timeline") {
            has_recovery_target_timeline = true;
        }
        if line.starts_with("primary_conninfo") {
            match dsn::get_connection_info_from_config_line(line) {
                Ok(info) => old_conn_info = Some(info),
                Err(err) => warn!(line, %err, "failed to parse previous primary_conninfo, ignoring"),
            }
            continue; // the new conninfo replaces this line
        }
        new_conf.push(line.to_string());
    }

    let mut new_conn_info = config
        .primary_conninfo_template_info()
        .context("primary_conninfo_template is not configured")?;
    new_conn_info.insert("host".to_string(), new_master_host.to_string());

    if old_conn_info.as_ref() == Some(&new_conn_info) && has_recovery_target_timeline {
        debug!(
            new_master_host,
            "recovery.conf already contains a matching conninfo, not updating"
        );
        return Ok(false);
    }

    let conninfo = dsn::create_connection_string(&new_conn_info);
    new_conf.push(format!("primary_conninfo = '{}'", conninfo.replace('\'', "''")));
    // promotion bumps the timeline, so the standby must follow the latest one
    if !has_recovery_target_timeline {
        new_conf.push("recovery_target_timeline = 'latest'".to_string());
    }
    new_conf.insert(
        0,
        format!(
            "# pg_sentinel updated primary_conninfo for host {new_master_host} at {}",
            Utc::now().to_rfc3339()
        ),
    );

    let temp_path = PathBuf::from(format!("{}_temp", path_to_recovery_conf.display()));
    std::fs::write(&temp_path, format!("{}\n", new_conf.join("\n")))
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    std::fs::rename(&temp_path, &path_to_recovery_conf)
        .with_context(|| format!("failed to replace {}", path_to_recovery_conf.display()))?;
    Ok(true)
}
