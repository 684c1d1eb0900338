//! The cluster monitor loop.
//!
//! A dedicated task that keeps one prober per configured database peer and
//! fans out all probes plus observer fetches concurrently each pass. Results
//! are folded into the shared state maps; individual failures are absorbed
//! into the per-peer records and never abort a pass. The loop wakes early
//! when a check is requested over HTTP and acknowledges such passes on the
//! decision channel.

use crate::alerts::{self, Alert};
use crate::config::Config;
use crate::state::{ClusterState, ObserverState, ReplicationSlot};
use crate::stats::Stats;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub mod observer;
pub mod probe;

use probe::PeerProber;

/// The last slot definitions seen on a primary, kept around in case the
/// primary goes away and the information is needed to rebuild the slots.
#[derive(Debug, Clone)]
pub struct KnownReplicationSlots {
    pub instance: String,
    pub slots: Vec<ReplicationSlot>,
    pub last_updated: Instant,
}

pub struct ClusterMonitor {
    config: Arc<RwLock<Config>>,
    state: Arc<ClusterState>,
    stats: Arc<Stats>,
    running: Arc<AtomicBool>,
    lag_over_warning: Arc<AtomicBool>,
    check_rx: mpsc::Receiver<String>,
    decision_tx: mpsc::Sender<String>,
    probers: BTreeMap<String, PeerProber>,
    observer_client: reqwest::Client,
    known_replication_slots: Option<KnownReplicationSlots>,
}

impl ClusterMonitor {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        config: Arc<RwLock<Config>>,
        state: Arc<ClusterState>,
        stats: Arc<Stats>,
        running: Arc<AtomicBool>,
        lag_over_warning: Arc<AtomicBool>,
        check_rx: mpsc::Receiver<String>,
        decision_tx: mpsc::Sender<String>,
    ) -> Result<Self> {
        let observer_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build observer HTTP client")?;
        Ok(Self {
            config,
            state,
            stats,
            running,
            lag_over_warning,
            check_rx,
            decision_tx,
            probers: BTreeMap::new(),
            observer_client,
            known_replication_slots: None,
        })
    }

    /// Drop probers and state for peers that left the configuration and make
    /// sure one prober exists for every configured peer.
    async fn reconcile_probers(&mut self, config: &Config) {
        let leftover: Vec<String> = self
            .probers
            .keys()
            .filter(|instance| !config.remote_conns.contains_key(*instance))
            .cloned()
            .collect();
        for instance in leftover {
            debug!(instance, "removing leftover state");
            if let Some(mut prober) = self.probers.remove(&instance) {
                prober.close().await;
            }
        }
        self.state
            .retain_configured(&config.remote_conns, &config.observers)
            .await;

        for (instance, dsn) in &config.remote_conns {
            self.probers
                .entry(instance.clone())
                .or_insert_with(|| PeerProber::new(instance, dsn));
        }
    }

    /// One full monitoring pass: reconcile probers with the configuration,
    /// fan out all probes and observer fetches, fold the results in, and ack
    /// explicitly requested passes on the decision channel.
    pub async fn run_monitoring_pass(&mut self, requested_check: bool) {
        let config = self.config.read().await.clone();
        self.reconcile_probers(&config).await;

        let always_observers = !config.poll_observers_on_warning_only;
        let poll_observers =
            always_observers || self.lag_over_warning.load(Ordering::Relaxed);
        let observer_targets: Vec<(String, String)> = if poll_observers {
            config
                .observers
                .iter()
                .map(|(instance, uri)| (instance.clone(), uri.clone()))
                .collect()
        } else {
            Vec::new()
        };

        let client = &self.observer_client;
        let probe_futures = join_all(self.probers.iter_mut().map(|(instance, prober)| {
            let instance = instance.clone();
            async move {
                let started = Instant::now();
                let report = prober.probe().await;
                debug!(
                    instance,
                    took = ?started.elapsed(),
                    connection = report.state.connection,
                    "probed database state"
                );
                (instance, report)
            }
        }));
        let observer_futures = join_all(observer_targets.iter().map(|(instance, uri)| {
            let instance = instance.clone();
            async move {
                let started = Instant::now();
                let observed = observer::fetch_observer_state(client, &instance, uri).await;
                debug!(instance, took = ?started.elapsed(), "fetched observer state");
                (instance, observed)
            }
        }));
        let (probe_results, observer_results) =
            futures::future::join(probe_futures, observer_futures).await;

        for (instance, report) in probe_results {
            if report.authentication_failure {
                alerts::create_alert_file(&config.alert_file_dir(), Alert::AuthenticationError);
            }
            if let Some(slots) = report.state.replication_slots.clone() {
                debug!(instance, count = slots.len(), "remembering replication slots");
                self.known_replication_slots = Some(KnownReplicationSlots {
                    instance: instance.clone(),
                    slots,
                    last_updated: Instant::now(),
                });
            }
            self.state.apply_member_result(&instance, report.state).await;
        }
        for (instance, observed) in observer_results {
            // a response discarded for clock skew still degrades the
            // observer record to connection=false
            let observed =
                observed.unwrap_or_else(|| ObserverState::disconnected(Utc::now()));
            self.state.apply_observer_result(&instance, observed).await;
        }

        if requested_check
            && let Err(err) = self
                .decision_tx
                .send("completed requested monitoring loop".to_string())
                .await
        {
            self.stats
                .unexpected_error("monitor", &anyhow::anyhow!(err).context("decision channel"));
        }
    }

    pub async fn run(mut self) {
        info!("cluster monitor started");
        self.run_monitoring_pass(false).await;
        while self.running.load(Ordering::Relaxed) {
            let poll_interval = self.config.read().await.db_poll_interval();
            let requested_check = match timeout(poll_interval, self.check_rx.recv()).await {
                Ok(Some(reason)) => {
                    debug!(reason, "monitoring pass requested");
                    true
                }
                Ok(None) => break, // all request senders are gone
                Err(_) => false,   // periodic pass
            };
            self.run_monitoring_pass(requested_check).await;
        }
        info!("cluster monitor stopped");
    }

    #[must_use]
    pub fn known_replication_slots(&self) -> Option<&KnownReplicationSlots> {
        self.known_replication_slots.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with_config(config: Config) -> (ClusterMonitor, mpsc::Sender<String>, mpsc::Receiver<String>) {
        let (check_tx, check_rx) = mpsc::channel(8);
        let (decision_tx, decision_rx) = mpsc::channel(8);
        let monitor = ClusterMonitor::new(
            Arc::new(RwLock::new(config)),
            Arc::new(ClusterState::new()),
            Arc::new(Stats::new()),
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            check_rx,
            decision_tx,
        )
        .unwrap();
        (monitor, check_tx, decision_rx)
    }

    #[tokio::test]
    async fn test_pass_records_unreachable_peers() {
        let mut config = Config::default();
        config
            .remote_conns
            .insert("db1".to_string(), "host=127.0.0.1 port=1 user=x".to_string());
        let (mut monitor, _check_tx, _decision_rx) = monitor_with_config(config);

        monitor.run_monitoring_pass(false).await;

        let members = monitor.state.members_snapshot().await;
        assert!(members.contains_key("db1"));
        assert!(!members["db1"].connection);
    }

    #[tokio::test]
    async fn test_requested_pass_acknowledges_on_decision_channel() {
        let (mut monitor, _check_tx, mut decision_rx) = monitor_with_config(Config::default());

        monitor.run_monitoring_pass(true).await;

        let token = decision_rx.try_recv().unwrap();
        assert_eq!(token, "completed requested monitoring loop");
    }

    #[tokio::test]
    async fn test_reconcile_evicts_removed_peers() {
        let mut config = Config::default();
        config
            .remote_conns
            .insert("db1".to_string(), "host=127.0.0.1 port=1 user=x".to_string());
        config
            .remote_conns
            .insert("db2".to_string(), "host=127.0.0.1 port=1 user=x".to_string());
        let (mut monitor, _check_tx, _decision_rx) = monitor_with_config(config);

        monitor.run_monitoring_pass(false).await;
        assert_eq!(monitor.probers.len(), 2);

        let trimmed = {
            let mut config = monitor.config.read().await.clone();
            config.remote_conns.remove("db2");
            config
        };
        *monitor.config.write().await = trimmed;

        monitor.run_monitoring_pass(false).await;
        assert_eq!(monitor.probers.len(), 1);
        let members = monitor.state.members_snapshot().await;
        assert!(members.contains_key("db1"));
        assert!(!members.contains_key("db2"));
    }
}
