//! Daemon configuration.
//!
//! A single JSON object on disk; every key has a default so a minimal config
//! only needs `remote_conns` and `own_db`. The file is reloaded on SIGHUP: a
//! parse failure at startup is fatal, at reload the previous configuration is
//! kept.

use crate::dsn;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// peer id → libpq DSN or postgres:// URL
    pub remote_conns: BTreeMap<String, String>,
    /// observer id → base URI of its HTTP endpoint
    pub observers: BTreeMap<String, String>,
    /// local peer id; None means this daemon is a pure observer
    pub own_db: Option<String>,
    pub http_address: String,
    pub http_port: u16,
    pub db_poll_interval: f64,
    pub replication_state_check_interval: f64,
    pub warning_replication_time_lag: f64,
    pub max_failover_replication_time_lag: f64,
    pub never_promote_these_nodes: Vec<String>,
    pub failover_command: String,
    pub over_warning_limit_command: String,
    pub pg_start_command: String,
    pub pg_stop_command: String,
    pub maintenance_mode_file: PathBuf,
    pub alert_file_dir: Option<PathBuf>,
    pub json_state_file_path: PathBuf,
    pub autofollow: bool,
    pub primary_conninfo_template: Option<String>,
    pub pg_data_directory: Option<PathBuf>,
    pub poll_observers_on_warning_only: bool,
    pub failover_sleep_time: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_conns: BTreeMap::new(),
            observers: BTreeMap::new(),
            own_db: None,
            http_address: String::new(),
            http_port: 15000,
            db_poll_interval: 5.0,
            replication_state_check_interval: 5.0,
            warning_replication_time_lag: 30.0,
            max_failover_replication_time_lag: 120.0,
            never_promote_these_nodes: Vec::new(),
            failover_command: String::new(),
            over_warning_limit_command: String::new(),
            pg_start_command: String::new(),
            pg_stop_command: String::new(),
            maintenance_mode_file: PathBuf::from("/tmp/pg_sentinel_maintenance_mode_file"),
            alert_file_dir: None,
            json_state_file_path: PathBuf::from("/tmp/pg_sentinel_state.json"),
            autofollow: false,
            primary_conninfo_template: None,
            pg_data_directory: None,
            poll_observers_on_warning_only: false,
            failover_sleep_time: 0.0,
        }
    }
}

impl Config {
    /// Load and validate the configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON config in {}", path.display()))?;
        config.validate_autofollow();
        Ok(config)
    }

    /// Autofollow requires a parseable `primary_conninfo_template`; without
    /// one the feature is disabled rather than leaving a half-configured
    /// daemon running.
    fn validate_autofollow(&mut self) {
        if !self.autofollow {
            return;
        }
        let template_ok = self
            .primary_conninfo_template
            .as_deref()
            .is_some_and(|template| dsn::get_connection_info(template).is_ok());
        if !template_ok {
            error!("invalid or missing primary_conninfo_template; not enabling autofollow");
            self.autofollow = false;
        }
    }

    /// The primary_conninfo template as a parsed key → value map.
    #[must_use]
    pub fn primary_conninfo_template_info(&self) -> Option<dsn::ConnectionInfo> {
        self.primary_conninfo_template
            .as_deref()
            .and_then(|template| dsn::get_connection_info(template).ok())
    }

    #[must_use]
    pub fn alert_file_dir(&self) -> PathBuf {
        self.alert_file_dir.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    #[must_use]
    pub fn db_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.db_poll_interval.max(0.0))
    }

    #[must_use]
    pub fn replication_state_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.replication_state_check_interval.max(0.0))
    }
}
