//! Database peer probing.
//!
//! One prober per configured peer, holding a long-lived connection that is
//! dropped on any error and reopened on the next pass. Every network wait is
//! bounded by the probe timeout so a hung peer can never stall the monitor.

use crate::dsn;
use crate::state::{MemberState, ReplicationSlot};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgConnection;
use sqlx::{ConnectOptions, Connection, Row};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Servers at or above this version use the `pg_last_wal_*` function names.
const PG_VERSION_10: u32 = 100_000;

const SLOTS_SQL: &str = "SELECT
    slot_name::text,
    plugin::text,
    slot_type::text,
    database::text,
    catalog_xmin::text,
    restart_lsn::text,
    confirmed_flush_lsn::text,
    pg_catalog.encode(pg_catalog.pg_read_binary_file(
        'pg_replslot/' || slot_name || '/state'), 'base64'
    ) AS state_data
  FROM pg_catalog.pg_replication_slots
  WHERE slot_type = 'logical' AND NOT temporary";

#[derive(Debug)]
pub struct ProbeReport {
    pub state: MemberState,
    /// The peer rejected our credentials; the caller raises the alert file.
    pub authentication_failure: bool,
}

pub struct PeerProber {
    instance: String,
    dsn: SecretString,
    conn: Option<PgConnection>,
}

impl PeerProber {
    #[must_use]
    pub fn new(instance: &str, dsn: &str) -> Self {
        Self {
            instance: instance.to_string(),
            dsn: SecretString::from(dsn.to_string()),
            conn: None,
        }
    }

    /// Query the peer for its current state. Never returns an error: failures
    /// degrade to a `connection=false` record and drop the connection.
    pub async fn probe(&mut self) -> ProbeReport {
        let fetch_time = Utc::now();
        match self.query_member_state(fetch_time).await {
            Ok(state) => ProbeReport {
                state,
                authentication_failure: false,
            },
            Err(err) => {
                let message = format!("{err:#}");
                warn!(
                    instance = %self.instance,
                    "problem querying status: {message}"
                );
                self.conn = None;
                ProbeReport {
                    state: MemberState::disconnected(fetch_time),
                    authentication_failure: message.contains("password authentication"),
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close().await;
        }
    }

    async fn connection(&mut self) -> Result<&mut PgConnection> {
        if self.conn.is_none() {
            let connection_info = dsn::get_connection_info(self.dsn.expose_secret())?;
            let options =
                dsn::connect_options(&connection_info)?.application_name("pg_sentinel");
            info!(
                instance = %self.instance,
                conninfo = %dsn::mask_connection_info(self.dsn.expose_secret()),
                "connecting"
            );
            let conn = timeout(PROBE_TIMEOUT, options.connect())
                .await
                .context("timed out connecting")??;
            debug!(instance = %self.instance, "connected");
            self.conn = Some(conn);
        }
        self.conn.as_mut().context("connection not established")
    }

    async fn query_member_state(&mut self, fetch_time: DateTime<Utc>) -> Result<MemberState> {
        let conn = self.connection().await?;
        let server_version = conn.server_version_num().unwrap_or(0);

        let status_sql = if server_version >= PG_VERSION_10 {
            "SELECT now() AS db_time, pg_is_in_recovery(), pg_last_xact_replay_timestamp(), \
             pg_last_wal_receive_lsn()::text AS pg_last_xlog_receive_location, \
             pg_last_wal_replay_lsn()::text AS pg_last_xlog_replay_location"
        } else {
            "SELECT now() AS db_time, pg_is_in_recovery(), pg_last_xact_replay_timestamp(), \
             pg_last_xlog_receive_location()::text, pg_last_xlog_replay_location()::text"
        };
        let row = timeout(PROBE_TIMEOUT, sqlx::query(status_sql).fetch_one(&mut *conn))
            .await
            .context("timed out querying status")??;

        let db_time: DateTime<Utc> = row.try_get("db_time")?;
        let pg_is_in_recovery: bool = row.try_get("pg_is_in_recovery")?;
        let replay_timestamp: Option<DateTime<Utc>> =
            row.try_get("pg_last_xact_replay_timestamp")?;
        let receive_location: Option<String> = row.try_get("pg_last_xlog_receive_location")?;
        let mut replay_location: Option<String> = row.try_get("pg_last_xlog_replay_location")?;

        let mut state = MemberState::disconnected(fetch_time);
        state.connection = true;
        state.db_time = Some(db_time);
        state.pg_is_in_recovery = Some(pg_is_in_recovery);

        if pg_is_in_recovery {
            state.pg_last_xlog_receive_location = Some(receive_location);
            state.pg_last_xlog_replay_location = Some(replay_location);
            state.pg_last_xact_replay_timestamp = Some(replay_timestamp);
            state.replication_time_lag =
                replay_timestamp.map(|ts| Some(seconds_between(db_time, ts)));
            return Ok(state);
        }

        // On a primary the current WAL position is read separately first, as
        // txid_current() can fail in situations where the plain read works.
        let wal_lsn_column = if server_version >= PG_VERSION_10 {
            "pg_current_wal_lsn()::text AS pg_last_xlog_replay_location"
        } else {
            "pg_current_xlog_location()::text AS pg_last_xlog_replay_location"
        };
        let row = timeout(
            PROBE_TIMEOUT,
            sqlx::query(&format!("SELECT {wal_lsn_column}"))
                .fetch_one(&mut *conn),
        )
        .await
        .context("timed out getting master LSN position")??;
        replay_location = row.try_get("pg_last_xlog_replay_location")?;

        if server_version >= PG_VERSION_10 {
            state.replication_slots = Some(self.fetch_replication_slot_info().await?);
        }

        // txid_current() forces a new transaction every poll interval so the
        // standbys always have a heartbeat to measure their lag against
        let conn = self.connection().await?;
        let row = timeout(
            PROBE_TIMEOUT,
            sqlx::query(&format!("SELECT txid_current(), {wal_lsn_column}"))
                .fetch_one(&mut *conn),
        )
        .await
        .context("timed out updating transaction")??;
        replay_location = row.try_get("pg_last_xlog_replay_location")?;

        // these are nulled so a standby promoted to primary looks identical
        // to a node that has never been a standby
        state.pg_last_xlog_receive_location = Some(None);
        state.pg_last_xact_replay_timestamp = Some(None);
        state.replication_time_lag = Some(None);
        state.pg_last_xlog_replay_location = Some(replay_location);
        Ok(state)
    }

    async fn fetch_replication_slot_info(&mut self) -> Result<Vec<ReplicationSlot>> {
        debug!(instance = %self.instance, "reading replication slot state");
        let conn = self.connection().await?;
        let rows = timeout(PROBE_TIMEOUT, sqlx::query(SLOTS_SQL).fetch_all(&mut *conn))
            .await
            .context("timed out reading replication slots")??;

        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            slots.push(ReplicationSlot {
                slot_name: row.try_get("slot_name")?,
                plugin: row.try_get("plugin")?,
                slot_type: row.try_get("slot_type")?,
                database: row.try_get("database")?,
                catalog_xmin: row.try_get("catalog_xmin")?,
                restart_lsn: row.try_get("restart_lsn")?,
                confirmed_flush_lsn: row.try_get("confirmed_flush_lsn")?,
                state_data: row.try_get("state_data")?,
            });
        }
        debug!(
            instance = %self.instance,
            count = slots.len(),
            "found replication slots"
        );
        Ok(slots)
    }
}

/// Wall-clock seconds between two timestamps. The absolute value catches
/// time travel between a skewed primary clock and the replay timestamp.
fn seconds_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (a.signed_duration_since(b).num_milliseconds() as f64 / 1000.0).abs()
}
