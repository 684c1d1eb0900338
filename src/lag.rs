//! Replication-lag tracking for the local node.
//!
//! Warning alerts are edge-triggered: one alert file when the lag first
//! crosses the warning boundary, removed once it drops back under. Crossing
//! the critical boundary escalates to the failover decider.

use crate::alerts::{self, Alert};
use crate::config::Config;
use crate::failover::execute_external_command;
use crate::state::MemberState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Eq)]
pub enum LagCheck {
    /// The local node reported no usable lag value.
    NoLag,
    /// Lag is known and below the critical boundary.
    Normal,
    /// Lag crossed the critical boundary; run the failover decision.
    OverCritical,
}

#[derive(Debug, Clone, Default)]
pub struct LagTracker {
    over_warning: Arc<AtomicBool>,
}

impl LagTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle for the monitor loop, which only polls observers while
    /// the warning boundary is exceeded when `poll_observers_on_warning_only`
    /// is set.
    #[must_use]
    pub fn warning_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.over_warning)
    }

    #[must_use]
    pub fn is_over_warning(&self) -> bool {
        self.over_warning.load(Ordering::Relaxed)
    }

    /// Reset the warning edge and remove its alert file, used after a
    /// successful promotion.
    pub fn clear(&self, alert_file_dir: &std::path::Path) {
        self.over_warning.store(false, Ordering::Relaxed);
        alerts::delete_alert_file(alert_file_dir, Alert::ReplicationDelayWarning);
    }

    pub async fn check(&self, own_state: &MemberState, config: &Config) -> LagCheck {
        let Some(replication_lag) = own_state.replication_lag().filter(|lag| *lag != 0.0) else {
            warn!(
                fetch_time = ?own_state.fetch_time,
                "no replication lag set in own node state"
            );
            return LagCheck::NoLag;
        };

        if replication_lag >= config.warning_replication_time_lag {
            warn!(
                replication_lag,
                warning_boundary = config.warning_replication_time_lag,
                "replication time lag is over the WARNING boundary"
            );
            if !self.over_warning.swap(true, Ordering::Relaxed) {
                alerts::create_alert_file(
                    &config.alert_file_dir(),
                    Alert::ReplicationDelayWarning,
                );
                if config.over_warning_limit_command.is_empty() {
                    warn!("no over_warning_limit_command set");
                } else {
                    warn!(
                        command = %config.over_warning_limit_command,
                        "executing over_warning_limit_command"
                    );
                    let return_code =
                        execute_external_command(&config.over_warning_limit_command).await;
                    warn!(return_code, "executed over_warning_limit_command");
                }
            }
        } else if self.over_warning.swap(false, Ordering::Relaxed) {
            alerts::delete_alert_file(&config.alert_file_dir(), Alert::ReplicationDelayWarning);
        }

        if replication_lag >= config.max_failover_replication_time_lag {
            warn!(
                replication_lag,
                critical_boundary = config.max_failover_replication_time_lag,
                "replication time lag is over the CRITICAL boundary, checking if we need to failover"
            );
            LagCheck::OverCritical
        } else {
            debug!(replication_lag, "replication lag within bounds");
            LagCheck::Normal
        }
    }
}
