//! The self-promotion decision.
//!
//! Every surviving daemon runs the same deterministic computation over the
//! merged node map, so at most one of them concludes that it should promote
//! its local database. The gates, in order: no master may remain reachable
//! (or recently heard from), usable replication positions must exist, this
//! node must be the furthest along (ties broken by lowest peer id), no
//! maintenance sentinel, not on the never-promote list, and more than half of
//! the cluster must be accounted for.

use crate::alerts::{self, Alert};
use crate::config::Config;
use crate::lag::LagTracker;
use crate::merge::NodeMap;
use crate::state::MemberState;
use crate::wal::convert_xlog_location_to_offset;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, error, warn};

/// A standby's replication position is only trusted if it was fetched within
/// this window.
const REPLICATION_POSITION_MAX_AGE_SECONDS: i64 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverDecision {
    /// A master is still connected or was heard from recently.
    MasterStillAround,
    /// No standby had a usable, fresh replication position.
    NoReplicationPositions,
    /// Another node is furthest along and will promote itself.
    FurthestAlongIsOther(String),
    /// The maintenance sentinel file exists on this node.
    MaintenanceMode,
    /// This node is on the never-promote list.
    NeverPromote,
    /// Less than a majority of the cluster is accounted for.
    NotEnoughKnownState,
    /// The failover command was invoked.
    Promoted { return_code: i32 },
}

/// Run a shell command, returning its exit code. Errors (including a missing
/// binary or an empty command) are logged and reported as -1.
pub async fn execute_external_command(command: &str) -> i32 {
    warn!(command, "executing external command");
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        error!("cannot execute an empty external command");
        return -1;
    };
    match tokio::process::Command::new(program)
        .args(parts)
        .status()
        .await
    {
        Ok(status) => {
            let return_code = status.code().unwrap_or(-1);
            warn!(command, return_code, "executed external command");
            return_code
        }
        Err(err) => {
            error!(command, %err, "problem executing external command");
            -1
        }
    }
}

/// Map WAL offsets to the set of standbys at that offset. Only connected
/// standbys with a fresh record that are allowed to be promoted take part.
#[must_use]
pub fn get_replication_positions(
    standby_nodes: &BTreeMap<String, MemberState>,
    config: &Config,
    now: DateTime<Utc>,
) -> BTreeMap<u64, BTreeSet<String>> {
    debug!(standbys = ?standby_nodes.keys().collect::<Vec<_>>(), "getting replication positions");
    let mut known_replication_positions: BTreeMap<u64, BTreeSet<String>> = BTreeMap::new();
    let max_age = TimeDelta::seconds(REPLICATION_POSITION_MAX_AGE_SECONDS);

    for (hostname, node_state) in standby_nodes {
        if !node_state.connection
            || now.signed_duration_since(node_state.fetch_time) >= max_age
            || config.never_promote_these_nodes.contains(hostname)
        {
            continue;
        }
        let offset = match node_state.wal_location() {
            Some(lsn) => convert_xlog_location_to_offset(lsn).unwrap_or_else(|err| {
                warn!(hostname, %err, "could not parse WAL location");
                0
            }),
            None => 0,
        };
        known_replication_positions
            .entry(offset)
            .or_default()
            .insert(hostname.clone());
    }
    known_replication_positions
}

/// True if any disconnected master reported a database time within the
/// failover timeout, meaning it died too recently to give up on.
fn master_heard_from_within_failover_timeout(
    node_map: &NodeMap,
    config: &Config,
    now: DateTime<Utc>,
) -> bool {
    for (host, node) in &node_map.disconnected_master_nodes {
        let db_time = node.db_time.unwrap_or(now);
        let time_since_last_contact = now.signed_duration_since(db_time);
        if time_since_last_contact
            < TimeDelta::milliseconds((config.max_failover_replication_time_lag * 1000.0) as i64)
        {
            debug!(
                host,
                ?time_since_last_contact,
                "had contact with the master within the failover timeout, not failing over"
            );
            return true;
        }
    }
    false
}

pub async fn do_failover_decision(
    config: &Config,
    node_map: &NodeMap,
    own_db: &str,
    lag_tracker: &LagTracker,
) -> FailoverDecision {
    let now = Utc::now();

    if !node_map.connected_master_nodes.is_empty()
        || master_heard_from_within_failover_timeout(node_map, config, now)
    {
        warn!(
            connected_masters = ?node_map.connected_master_nodes.keys().collect::<Vec<_>>(),
            "we still have some connected masters, not failing over"
        );
        return FailoverDecision::MasterStillAround;
    }

    let known_replication_positions =
        get_replication_positions(&node_map.standby_nodes, config, now);
    let furthest_along_host = known_replication_positions
        .iter()
        .next_back()
        .and_then(|(_, hosts)| hosts.iter().next())
        .cloned();
    let Some(furthest_along_host) = furthest_along_host else {
        warn!("no known replication positions, canceling failover consideration");
        return FailoverDecision::NoReplicationPositions;
    };
    warn!(
        furthest_along_host,
        positions = ?known_replication_positions,
        "node that is furthest along"
    );

    if furthest_along_host != own_db {
        warn!(
            furthest_along_host,
            "nothing to do, another node is the furthest along"
        );
        return FailoverDecision::FurthestAlongIsOther(furthest_along_host);
    }

    if config.maintenance_mode_file.exists() {
        warn!(
            maintenance_mode_file = %config.maintenance_mode_file.display(),
            "canceling failover even though we are the node furthest along, \
             this node has an existing maintenance_mode_file"
        );
        return FailoverDecision::MaintenanceMode;
    }

    if config
        .never_promote_these_nodes
        .iter()
        .any(|node| node == own_db)
    {
        warn!(
            own_db,
            "not doing a failover even though we are the node furthest along, \
             this node should never be promoted to master"
        );
        return FailoverDecision::NeverPromote;
    }

    let total_observers =
        node_map.connected_observer_nodes.len() + node_map.disconnected_observer_nodes.len();
    // the +1 accounts for the master node
    let total_amount_of_nodes = node_map.standby_nodes.len() as f64 + 1.0
        - config.never_promote_these_nodes.len() as f64
        + total_observers as f64;
    let size_of_needed_majority = total_amount_of_nodes * 0.5;
    let amount_of_known_replication_positions: usize = known_replication_positions
        .values()
        .map(BTreeSet::len)
        .sum();
    let size_of_known_state =
        amount_of_known_replication_positions + node_map.connected_observer_nodes.len();
    debug!(
        size_of_known_state,
        size_of_needed_majority, "failover quorum accounting"
    );

    if (size_of_known_state as f64) < size_of_needed_majority {
        warn!(
            "not doing a failover even though we are the node furthest along, \
             we are not aware of the states of enough of the other nodes"
        );
        return FailoverDecision::NotEnoughKnownState;
    }

    let start_time = Instant::now();
    warn!("we will now do a failover to ourselves since we are the host furthest along");
    let return_code = execute_external_command(&config.failover_command).await;
    warn!(
        command = %config.failover_command,
        return_code,
        took = ?start_time.elapsed(),
        "executed failover command"
    );
    alerts::create_alert_file(&config.alert_file_dir(), Alert::FailoverHasHappened);

    // give the database time to restart in promotion mode before the next
    // probe in case the failover command does not block until it is done
    if config.failover_sleep_time > 0.0 {
        tokio::time::sleep(std::time::Duration::from_secs_f64(config.failover_sleep_time)).await;
    }

    if return_code == 0 {
        lag_tracker.clear(&config.alert_file_dir());
    }
    FailoverDecision::Promoted { return_code }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standby(seconds_ago: i64, location: Option<&str>) -> MemberState {
        let mut state = MemberState::disconnected(Utc::now() - TimeDelta::seconds(seconds_ago));
        state.connection = true;
        state.pg_is_in_recovery = Some(true);
        state.pg_last_xlog_receive_location = Some(location.map(String::from));
        state
    }

    fn node_map_with_standbys(standbys: Vec<(&str, MemberState)>) -> NodeMap {
        let mut map = NodeMap::default();
        for (host, state) in standbys {
            map.standby_nodes.insert(host.to_string(), state);
        }
        map
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            alert_file_dir: Some(dir.to_path_buf()),
            maintenance_mode_file: dir.join("maintenance_mode_file"),
            failover_command: "true".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_replication_positions_staleness_and_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.never_promote_these_nodes = vec!["db4".to_string()];

        let mut standbys = BTreeMap::new();
        standbys.insert("db1".to_string(), standby(0, Some("1/0")));
        standbys.insert("db2".to_string(), standby(60, Some("1/0"))); // stale
        let mut disconnected = standby(0, Some("1/0"));
        disconnected.connection = false;
        standbys.insert("db3".to_string(), disconnected);
        standbys.insert("db4".to_string(), standby(0, Some("1/0"))); // never promote

        let positions = get_replication_positions(&standbys, &config, Utc::now());
        let hosts: Vec<_> = positions.values().flatten().cloned().collect();
        assert_eq!(hosts, vec!["db1".to_string()]);
    }

    #[test]
    fn test_replication_positions_fall_back_to_replay_location() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let mut restored_from_backup = standby(0, None);
        restored_from_backup.pg_last_xlog_replay_location = Some(Some("2/A".to_string()));
        let mut standbys = BTreeMap::new();
        standbys.insert("db1".to_string(), restored_from_backup);
        standbys.insert("db2".to_string(), standby(0, None));

        let positions = get_replication_positions(&standbys, &config, Utc::now());
        let expected_offset = convert_xlog_location_to_offset("2/A").unwrap();
        assert!(positions[&expected_offset].contains("db1"));
        // a standby with no locations at all still takes part at offset 0
        assert!(positions[&0].contains("db2"));
    }

    #[tokio::test]
    async fn test_failover_promotes_furthest_standby() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let tracker = LagTracker::new();

        // primary went away a while ago; we hold the larger offset
        let mut map = node_map_with_standbys(vec![
            ("db2", standby(0, Some("1/1"))),
            ("db3", standby(0, Some("1/2"))),
        ]);
        let mut dead_master = MemberState::disconnected(Utc::now());
        dead_master.pg_is_in_recovery = Some(false);
        dead_master.db_time = Some(Utc::now() - TimeDelta::seconds(600));
        map.disconnected_master_nodes
            .insert("db1".to_string(), dead_master);

        let decision = do_failover_decision(&config, &map, "db3", &tracker).await;
        assert_eq!(decision, FailoverDecision::Promoted { return_code: 0 });
        assert!(Alert::FailoverHasHappened.path_in(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_failover_aborts_with_connected_master() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let tracker = LagTracker::new();

        let mut map = node_map_with_standbys(vec![("db2", standby(0, Some("1/2")))]);
        let mut master = MemberState::disconnected(Utc::now());
        master.connection = true;
        master.pg_is_in_recovery = Some(false);
        map.connected_master_nodes.insert("db1".to_string(), master);

        let decision = do_failover_decision(&config, &map, "db2", &tracker).await;
        assert_eq!(decision, FailoverDecision::MasterStillAround);
        assert!(!Alert::FailoverHasHappened.path_in(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_failover_aborts_on_recent_master_contact() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let tracker = LagTracker::new();

        let mut map = node_map_with_standbys(vec![("db2", standby(0, Some("1/2")))]);
        let mut recently_seen = MemberState::disconnected(Utc::now());
        recently_seen.pg_is_in_recovery = Some(false);
        recently_seen.db_time = Some(Utc::now() - TimeDelta::seconds(10));
        map.disconnected_master_nodes
            .insert("db1".to_string(), recently_seen);

        let decision = do_failover_decision(&config, &map, "db2", &tracker).await;
        assert_eq!(decision, FailoverDecision::MasterStillAround);
    }

    #[tokio::test]
    async fn test_failover_defers_to_node_further_along() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let tracker = LagTracker::new();

        let map = node_map_with_standbys(vec![
            ("db2", standby(0, Some("1/1"))),
            ("db3", standby(0, Some("1/2"))),
        ]);

        let decision = do_failover_decision(&config, &map, "db2", &tracker).await;
        assert_eq!(
            decision,
            FailoverDecision::FurthestAlongIsOther("db3".to_string())
        );
        assert!(!Alert::FailoverHasHappened.path_in(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_tied_offsets_break_to_lowest_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let tracker = LagTracker::new();

        let map = node_map_with_standbys(vec![
            ("db3", standby(0, Some("1/2"))),
            ("db2", standby(0, Some("1/2"))),
            ("db4", standby(0, Some("1/1"))),
        ]);

        // db2 and db3 tie at the max offset; every decider must pick db2
        let decision = do_failover_decision(&config, &map, "db3", &tracker).await;
        assert_eq!(
            decision,
            FailoverDecision::FurthestAlongIsOther("db2".to_string())
        );

        let decision = do_failover_decision(&config, &map, "db2", &tracker).await;
        assert_eq!(decision, FailoverDecision::Promoted { return_code: 0 });
    }

    #[tokio::test]
    async fn test_failover_respects_maintenance_mode_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let tracker = LagTracker::new();
        std::fs::write(&config.maintenance_mode_file, "").unwrap();

        let map = node_map_with_standbys(vec![("db2", standby(0, Some("1/2")))]);

        let decision = do_failover_decision(&config, &map, "db2", &tracker).await;
        assert_eq!(decision, FailoverDecision::MaintenanceMode);
        assert!(!Alert::FailoverHasHappened.path_in(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_failover_respects_never_promote_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.never_promote_these_nodes = vec!["db9".to_string()];

        // db9 is excluded from the position map entirely, so db2 wins and
        // db9 never considers itself a candidate
        let map = node_map_with_standbys(vec![
            ("db2", standby(0, Some("1/1"))),
            ("db9", standby(0, Some("1/2"))),
        ]);
        let tracker = LagTracker::new();

        let decision = do_failover_decision(&config, &map, "db9", &tracker).await;
        assert_eq!(
            decision,
            FailoverDecision::FurthestAlongIsOther("db2".to_string())
        );
        assert!(!Alert::FailoverHasHappened.path_in(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_failover_requires_quorum() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let tracker = LagTracker::new();

        // four standbys + master = 5 nodes, but only 2 fresh positions and
        // no observers: 2 < 2.5 so the decision must abort
        let mut map = node_map_with_standbys(vec![
            ("db2", standby(0, Some("1/2"))),
            ("db3", standby(0, Some("1/1"))),
            ("db4", standby(120, Some("1/3"))),
            ("db5", standby(120, Some("1/4"))),
        ]);

        let decision = do_failover_decision(&config, &map, "db2", &tracker).await;
        assert_eq!(decision, FailoverDecision::NotEnoughKnownState);

        // a connected observer vouching for the cluster tips the balance:
        // known 2 + 1 = 3 against total (4 + 1 + 1) / 2 = 3, and the abort
        // condition is strictly less-than
        map.connected_observer_nodes
            .insert("observer1".to_string(), Utc::now());
        let decision = do_failover_decision(&config, &map, "db2", &tracker).await;
        assert_eq!(decision, FailoverDecision::Promoted { return_code: 0 });
    }

    #[tokio::test]
    async fn test_failed_promotion_still_raises_alert() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.failover_command = "false".to_string();
        let tracker = LagTracker::new();

        let map = node_map_with_standbys(vec![("db2", standby(0, Some("1/2")))]);

        let decision = do_failover_decision(&config, &map, "db2", &tracker).await;
        assert_eq!(decision, FailoverDecision::Promoted { return_code: 1 });
        // the promotion was attempted, so the alert is raised regardless
        assert!(Alert::FailoverHasHappened.path_in(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_execute_external_command_exit_codes() {
        assert_eq!(execute_external_command("true").await, 0);
        assert_eq!(execute_external_command("false").await, 1);
        assert_eq!(execute_external_command("").await, -1);
        assert_eq!(
            execute_external_command("/nonexistent-command-for-tests").await,
            -1
        );
    }
}
