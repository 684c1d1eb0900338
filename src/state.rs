//! Shared cluster state.
//!
//! Two maps are maintained here: per-peer database state records and per-
//! observer snapshots. Monitor workers write them, the supervisor reads them
//! through point-in-time snapshots, and the HTTP endpoint serves the member
//! map verbatim as `/state.json`.
//!
//! Serialization preserves the null-vs-absent distinction on the fields that
//! are explicitly nulled on primaries: `replication_time_lag = null` is the
//! signature of a primary, while a missing key just means the value was never
//! produced. Fields of type `Option<Option<T>>` model exactly that.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::RwLock;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since the daemon started; a serializable stand-in for a monotonic
/// reading.
#[must_use]
pub fn process_uptime() -> f64 {
    PROCESS_START.elapsed().as_secs_f64()
}

/// Deserialize helper distinguishing a key set to `null` (`Some(None)`) from
/// a missing key (`None`, via `#[serde(default)]`).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// A logical replication slot definition, including the base64-encoded
/// contents of its on-disk state file so it can be recreated elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub plugin: String,
    pub slot_type: String,
    pub database: String,
    pub catalog_xmin: String,
    pub restart_lsn: String,
    pub confirmed_flush_lsn: String,
    pub state_data: String,
}

/// State record for a single database peer, produced by the prober and
/// amended in place across probes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberState {
    pub fetch_time: DateTime<Utc>,
    pub connection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_is_in_recovery: Option<bool>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub pg_last_xact_replay_timestamp: Option<Option<DateTime<Utc>>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub pg_last_xlog_receive_location: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub pg_last_xlog_replay_location: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub replication_time_lag: Option<Option<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replication_time_lag: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_start_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_slots: Option<Vec<ReplicationSlot>>,
}

impl MemberState {
    /// The record produced when a probe fails before fetching anything.
    #[must_use]
    pub fn disconnected(fetch_time: DateTime<Utc>) -> Self {
        Self {
            fetch_time,
            connection: false,
            db_time: None,
            pg_is_in_recovery: None,
            pg_last_xact_replay_timestamp: None,
            pg_last_xlog_receive_location: None,
            pg_last_xlog_replay_location: None,
            replication_time_lag: None,
            min_replication_time_lag: None,
            replication_start_time: None,
            replication_slots: None,
        }
    }

    #[must_use]
    pub fn replication_lag(&self) -> Option<f64> {
        self.replication_time_lag.flatten()
    }

    /// The WAL position to rank this standby by: the receive location when
    /// present, otherwise the replay location. A node restored from a backup
    /// that never connected to a primary has no receive location but does
    /// have a replay location.
    #[must_use]
    pub fn wal_location(&self) -> Option<&str> {
        self.pg_last_xlog_receive_location
            .as_ref()
            .and_then(Option::as_deref)
            .or_else(|| {
                self.pg_last_xlog_replay_location
                    .as_ref()
                    .and_then(Option::as_deref)
            })
    }

    /// Fold a newer probe result into this record. Only the fields the new
    /// result actually carries are overwritten, so a failed probe updates
    /// `fetch_time` and `connection` while preserving the last good data.
    pub fn update_from(&mut self, newer: &Self) {
        self.fetch_time = newer.fetch_time;
        self.connection = newer.connection;
        if newer.db_time.is_some() {
            self.db_time = newer.db_time;
        }
        if newer.pg_is_in_recovery.is_some() {
            self.pg_is_in_recovery = newer.pg_is_in_recovery;
        }
        if newer.pg_last_xact_replay_timestamp.is_some() {
            self.pg_last_xact_replay_timestamp = newer.pg_last_xact_replay_timestamp;
        }
        if newer.pg_last_xlog_receive_location.is_some() {
            self.pg_last_xlog_receive_location = newer.pg_last_xlog_receive_location.clone();
        }
        if newer.pg_last_xlog_replay_location.is_some() {
            self.pg_last_xlog_replay_location = newer.pg_last_xlog_replay_location.clone();
        }
        if newer.replication_time_lag.is_some() {
            self.replication_time_lag = newer.replication_time_lag;
        }
        if newer.replication_slots.is_some() {
            self.replication_slots = newer.replication_slots.clone();
        }
    }
}

/// One observer's snapshot: its own fetch bookkeeping plus its view of every
/// peer it watches, keyed by peer id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObserverState {
    pub fetch_time: DateTime<Utc>,
    pub connection: bool,
    #[serde(flatten)]
    pub nodes: BTreeMap<String, MemberState>,
}

impl ObserverState {
    #[must_use]
    pub fn disconnected(fetch_time: DateTime<Utc>) -> Self {
        Self {
            fetch_time,
            connection: false,
            nodes: BTreeMap::new(),
        }
    }

    pub fn update_from(&mut self, newer: &Self) {
        self.fetch_time = newer.fetch_time;
        self.connection = newer.connection;
        for (peer, record) in &newer.nodes {
            self.nodes.insert(peer.clone(), record.clone());
        }
    }
}

/// The shared state container: written by monitor workers, snapshotted by
/// the supervisor and the HTTP endpoint. Each per-peer entry has a single
/// writer (its probe task), so entry updates never race.
#[derive(Debug, Default)]
pub struct ClusterState {
    members: RwLock<BTreeMap<String, MemberState>>,
    observers: RwLock<BTreeMap<String, ObserverState>>,
}

impl ClusterState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a probe result into the member map, maintaining the derived
    /// minimum-lag and replication-start bookkeeping.
    pub async fn apply_member_result(&self, instance: &str, result: MemberState) {
        let new_lag = result.replication_lag();
        let started_replicating = result
            .pg_last_xlog_receive_location
            .as_ref()
            .and_then(Option::as_deref)
            .is_some();

        let mut members = self.members.write().await;
        let entry = members
            .entry(instance.to_string())
            .and_modify(|existing| existing.update_from(&result))
            .or_insert(result);

        if started_replicating && entry.replication_start_time.is_none() {
            entry.replication_start_time = Some(process_uptime());
        }
        if let Some(lag) = new_lag {
            entry.min_replication_time_lag = Some(match entry.min_replication_time_lag {
                Some(min_lag) => min_lag.min(lag),
                None => lag,
            });
        }
    }

    /// Merge an observer fetch result into the observer map. A failed fetch
    /// updates only the bookkeeping fields and keeps the last known nodes.
    pub async fn apply_observer_result(&self, instance: &str, result: ObserverState) {
        let mut observers = self.observers.write().await;
        observers
            .entry(instance.to_string())
            .and_modify(|existing| existing.update_from(&result))
            .or_insert(result);
    }

    /// Drop state for peers that are no longer configured. Returns the ids
    /// that were evicted from the member map.
    pub async fn retain_configured(
        &self,
        db_peers: &BTreeMap<String, String>,
        observer_peers: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut evicted = Vec::new();
        {
            let mut members = self.members.write().await;
            members.retain(|instance, _| {
                let keep = db_peers.contains_key(instance);
                if !keep {
                    evicted.push(instance.clone());
                }
                keep
            });
        }
        {
            let mut observers = self.observers.write().await;
            observers.retain(|instance, _| observer_peers.contains_key(instance));
        }
        evicted
    }

    pub async fn members_snapshot(&self) -> BTreeMap<String, MemberState> {
        self.members.read().await.clone()
    }

    pub async fn observers_snapshot(&self) -> BTreeMap<String, ObserverState> {
        self.observers.read().await.clone()
    }

    pub async fn snapshot(
        &self,
    ) -> (
        BTreeMap<String, MemberState>,
        BTreeMap<String, ObserverState>,
    ) {
        (self.members_snapshot().await, self.observers_snapshot().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetch_time(seconds: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, seconds).unwrap()
    }

    fn standby_state(seconds: u32, lag: f64) -> MemberState {
        let mut state = MemberState::disconnected(fetch_time(seconds));
        state.connection = true;
        state.db_time = Some(fetch_time(seconds));
        state.pg_is_in_recovery = Some(true);
        state.pg_last_xlog_receive_location = Some(Some("0/4000".to_string()));
        state.pg_last_xlog_replay_location = Some(Some("0/3000".to_string()));
        state.pg_last_xact_replay_timestamp = Some(Some(fetch_time(seconds)));
        state.replication_time_lag = Some(Some(lag));
        state
    }

    #[test]
    fn test_primary_serializes_null_lag() {
        let mut state = MemberState::disconnected(fetch_time(0));
        state.connection = true;
        state.pg_is_in_recovery = Some(false);
        state.replication_time_lag = Some(None);
        state.pg_last_xlog_receive_location = Some(None);
        state.pg_last_xact_replay_timestamp = Some(None);
        state.pg_last_xlog_replay_location = Some(Some("0/5000".to_string()));

        let value = serde_json::to_value(&state).unwrap();
        assert!(value["replication_time_lag"].is_null());
        assert!(value["pg_last_xlog_receive_location"].is_null());
        assert_eq!(value["pg_last_xlog_replay_location"], "0/5000");

        let parsed: MemberState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_absent_fields_stay_absent() {
        let state = MemberState::disconnected(fetch_time(0));
        let value = serde_json::to_value(&state).unwrap();

        let object = value.as_object().unwrap();
        assert!(!object.contains_key("replication_time_lag"));
        assert!(!object.contains_key("pg_last_xlog_receive_location"));
        assert!(!object.contains_key("db_time"));

        let parsed: MemberState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.replication_time_lag, None);
    }

    #[test]
    fn test_update_from_failed_probe_preserves_fields() {
        let mut state = standby_state(0, 2.0);
        let failed = MemberState::disconnected(fetch_time(10));
        state.update_from(&failed);

        assert_eq!(state.fetch_time, fetch_time(10));
        assert!(!state.connection);
        assert_eq!(state.pg_is_in_recovery, Some(true));
        assert_eq!(state.replication_lag(), Some(2.0));
        assert_eq!(state.wal_location(), Some("0/4000"));
    }

    #[test]
    fn test_wal_location_prefers_receive() {
        let mut state = standby_state(0, 1.0);
        assert_eq!(state.wal_location(), Some("0/4000"));

        state.pg_last_xlog_receive_location = Some(None);
        assert_eq!(state.wal_location(), Some("0/3000"));

        state.pg_last_xlog_replay_location = Some(None);
        assert_eq!(state.wal_location(), None);
    }

    #[tokio::test]
    async fn test_min_replication_time_lag_never_regresses() {
        let state = ClusterState::new();
        state.apply_member_result("db1", standby_state(0, 5.0)).await;
        state.apply_member_result("db1", standby_state(1, 2.0)).await;
        state.apply_member_result("db1", standby_state(2, 9.0)).await;

        let members = state.members_snapshot().await;
        let record = &members["db1"];
        assert_eq!(record.replication_lag(), Some(9.0));
        assert_eq!(record.min_replication_time_lag, Some(2.0));
        assert!(record.min_replication_time_lag.unwrap() <= record.replication_lag().unwrap());
    }

    #[tokio::test]
    async fn test_replication_start_time_recorded_once() {
        let state = ClusterState::new();
        state.apply_member_result("db1", standby_state(0, 5.0)).await;
        let first = state.members_snapshot().await["db1"].replication_start_time;
        assert!(first.is_some());

        state.apply_member_result("db1", standby_state(1, 5.0)).await;
        let second = state.members_snapshot().await["db1"].replication_start_time;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_retain_configured_evicts_removed_peers() {
        let state = ClusterState::new();
        state.apply_member_result("db1", standby_state(0, 1.0)).await;
        state.apply_member_result("db2", standby_state(0, 1.0)).await;

        let mut configured = BTreeMap::new();
        configured.insert("db1".to_string(), "host=db1".to_string());
        let evicted = state.retain_configured(&configured, &BTreeMap::new()).await;

        assert_eq!(evicted, vec!["db2".to_string()]);
        assert!(state.members_snapshot().await.contains_key("db1"));
        assert!(!state.members_snapshot().await.contains_key("db2"));
    }

    #[test]
    fn test_observer_state_flattens_nodes() {
        let mut observer = ObserverState::disconnected(fetch_time(0));
        observer.connection = true;
        observer
            .nodes
            .insert("db1".to_string(), standby_state(0, 1.5));

        let value = serde_json::to_value(&observer).unwrap();
        assert_eq!(value["connection"], true);
        assert_eq!(value["db1"]["pg_is_in_recovery"], true);

        let parsed: ObserverState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, observer);
    }

    #[test]
    fn test_observer_update_keeps_old_nodes_on_failure() {
        let mut observer = ObserverState::disconnected(fetch_time(0));
        observer.connection = true;
        observer
            .nodes
            .insert("db1".to_string(), standby_state(0, 1.5));

        let failed = ObserverState::disconnected(fetch_time(10));
        observer.update_from(&failed);

        assert!(!observer.connection);
        assert_eq!(observer.fetch_time, fetch_time(10));
        assert!(observer.nodes.contains_key("db1"));
    }
}
