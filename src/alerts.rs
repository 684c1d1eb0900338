//! Alert sentinel files.
//!
//! Cluster-level anomalies are surfaced to the operator as empty marker files
//! in `alert_file_dir`, named from a fixed vocabulary. External monitoring is
//! expected to watch for these files; creation and deletion are idempotent
//! and never propagate errors into the monitoring loops.

use std::path::{Path, PathBuf};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    AuthenticationError,
    MultipleMasterWarning,
    ReplicationDelayWarning,
    FailoverHasHappened,
}

impl Alert {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Alert::AuthenticationError => "authentication_error",
            Alert::MultipleMasterWarning => "multiple_master_warning",
            Alert::ReplicationDelayWarning => "replication_delay_warning",
            Alert::FailoverHasHappened => "failover_has_happened",
        }
    }

    #[must_use]
    pub fn path_in(&self, alert_file_dir: &Path) -> PathBuf {
        alert_file_dir.join(self.as_str())
    }
}

pub fn create_alert_file(alert_file_dir: &Path, alert: Alert) {
    let filepath = alert.path_in(alert_file_dir);
    debug!(path = %filepath.display(), "creating alert file");
    if let Err(err) = std::fs::write(&filepath, "alert") {
        error!(path = %filepath.display(), %err, "problem writing alert file");
    }
}

pub fn delete_alert_file(alert_file_dir: &Path, alert: Alert) {
    let filepath = alert.path_in(alert_file_dir);
    if filepath.exists() {
        debug!(path = %filepath.display(), "deleting alert file");
        if let Err(err) = std::fs::remove_file(&filepath) {
            error!(path = %filepath.display(), %err, "problem unlinking alert file");
        }
    }
}
