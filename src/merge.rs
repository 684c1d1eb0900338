//! Fusing local and observer views into a single node map.
//!
//! The local view wins whenever it is fresher or concerns the local node
//! itself; observer records fill in the peers we cannot reach. The outcome
//! partitions the cluster into standbys, connected masters, and disconnected
//! masters, and selects the master the rest of the decision pass works with.

use crate::state::{MemberState, ObserverState};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

#[derive(Debug, Default, Clone)]
pub struct NodeMap {
    pub master_host: Option<String>,
    pub master_node: Option<MemberState>,
    pub standby_nodes: BTreeMap<String, MemberState>,
    pub connected_master_nodes: BTreeMap<String, MemberState>,
    pub disconnected_master_nodes: BTreeMap<String, MemberState>,
    pub connected_observer_nodes: BTreeMap<String, DateTime<Utc>>,
    pub disconnected_observer_nodes: BTreeMap<String, DateTime<Utc>>,
    /// More than one connected master was seen; the decision pass must abort.
    pub multiple_masters: bool,
}

#[must_use]
pub fn create_node_map(
    cluster_state: &BTreeMap<String, MemberState>,
    observer_state: &BTreeMap<String, ObserverState>,
    own_db: Option<&str>,
) -> NodeMap {
    let mut map = NodeMap::default();

    for (host, state) in cluster_state {
        match state.pg_is_in_recovery {
            Some(true) => {
                map.standby_nodes.insert(host.clone(), state.clone());
            }
            Some(false) if state.connection => {
                map.connected_master_nodes.insert(host.clone(), state.clone());
            }
            Some(false) => {
                map.disconnected_master_nodes
                    .insert(host.clone(), state.clone());
            }
            None => {
                debug!(host, "no knowledge of whether the host is in recovery");
            }
        }
    }

    for (observer_name, state) in observer_state {
        if state.connection {
            map.connected_observer_nodes
                .insert(observer_name.clone(), state.fetch_time);
        } else {
            map.disconnected_observer_nodes
                .insert(observer_name.clone(), state.fetch_time);
        }

        for (host, db_state) in &state.nodes {
            // a single observer can span multiple replication clusters;
            // ignore peers that are not part of ours
            let Some(own_record) = cluster_state.get(host) else {
                debug!(
                    observer_name,
                    host, "ignoring node that is not part of our own replication cluster"
                );
                continue;
            };
            if db_state.fetch_time < own_record.fetch_time {
                continue;
            }
            if Some(host.as_str()) == own_db {
                // we always trust ourselves the most for our own state
                continue;
            }
            match db_state.pg_is_in_recovery {
                Some(true) => {
                    let connected_locally = map
                        .standby_nodes
                        .get(host)
                        .is_some_and(|state| state.connection);
                    if !connected_locally {
                        map.standby_nodes.insert(host.clone(), db_state.clone());
                    }
                }
                Some(false) => {
                    debug!(
                        observer_name,
                        host,
                        connection = db_state.connection,
                        "observer sees host as master"
                    );
                    if db_state.connection {
                        map.disconnected_master_nodes.remove(host);
                        map.connected_master_nodes
                            .insert(host.clone(), db_state.clone());
                    } else {
                        map.connected_master_nodes.remove(host);
                        map.disconnected_master_nodes
                            .insert(host.clone(), db_state.clone());
                    }
                }
                None => {
                    warn!(
                        observer_name,
                        host, "observer has no knowledge of whether the host is in recovery"
                    );
                }
            }
        }
    }

    match map.connected_master_nodes.len() {
        0 => {
            warn!(
                disconnected = ?map.disconnected_master_nodes.keys().collect::<Vec<_>>(),
                "no known master node"
            );
            if let Some((host, node)) = map.disconnected_master_nodes.iter().next() {
                map.master_host = Some(host.clone());
                map.master_node = Some(node.clone());
            }
        }
        1 => {
            if let Some((host, node)) = map.connected_master_nodes.iter().next() {
                map.master_host = Some(host.clone());
                map.master_node = Some(node.clone());
            }
            if !map.disconnected_master_nodes.is_empty() {
                warn!(
                    master = ?map.master_host,
                    disconnected = ?map.disconnected_master_nodes.keys().collect::<Vec<_>>(),
                    "picked master while other masters are in a disconnected state"
                );
            }
        }
        _ => {
            error!(
                connected = ?map.connected_master_nodes.keys().collect::<Vec<_>>(),
                disconnected = ?map.disconnected_master_nodes.keys().collect::<Vec<_>>(),
                "more than one master node connected"
            );
            map.multiple_masters = true;
        }
    }

    map
}
