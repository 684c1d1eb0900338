//! Observer peers.
//!
//! Observers are passive daemons that expose their own cluster view over
//! HTTP; their snapshots are used as tie-breaking witnesses when this node
//! cannot see enough of the cluster directly. A response whose `Date` header
//! disagrees with our clock by more than the tolerance is discarded outright:
//! a skewed witness is worse than no witness.

use crate::state::{MemberState, ObserverState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{error, warn};

const MAX_CLOCK_SKEW_SECONDS: i64 = 5;

/// Fetch one observer's `/state.json`.
///
/// Returns `None` when the response was discarded because of clock skew;
/// connection and parse failures yield a `connection=false` record instead.
pub async fn fetch_observer_state(
    client: &reqwest::Client,
    instance: &str,
    uri: &str,
) -> Option<ObserverState> {
    let fetch_time = Utc::now();
    let fetch_uri = format!("{}/state.json", uri.trim_end_matches('/'));
    match try_fetch(client, &fetch_uri, fetch_time).await {
        Ok(observed) => {
            if observed.is_none() {
                error!(
                    instance,
                    fetch_uri, "clock skew over tolerance, ignoring observer response"
                );
            }
            observed
        }
        Err(err) => {
            warn!(instance, fetch_uri, "problem fetching observer state: {err:#}");
            Some(ObserverState::disconnected(fetch_time))
        }
    }
}

async fn try_fetch(
    client: &reqwest::Client,
    fetch_uri: &str,
    fetch_time: DateTime<Utc>,
) -> Result<Option<ObserverState>> {
    let response = client.get(fetch_uri).send().await?;

    // check the advertised server time for large skews
    let date_header = response
        .headers()
        .get(reqwest::header::DATE)
        .context("response carries no Date header")?
        .to_str()
        .context("unreadable Date header")?;
    let remote_server_time = DateTime::parse_from_rfc2822(date_header)
        .with_context(|| format!("unparseable Date header {date_header:?}"))?
        .with_timezone(&Utc);
    let skew = fetch_time
        .signed_duration_since(remote_server_time)
        .num_seconds()
        .abs();
    if skew > MAX_CLOCK_SKEW_SECONDS {
        return Ok(None);
    }

    let nodes: BTreeMap<String, MemberState> = response.json().await?;
    Ok(Some(ObserverState {
        fetch_time,
        connection: true,
        nodes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderValue;
    use axum::response::IntoResponse;
    use axum::routing::get;

    async fn serve_state(date_offset_seconds: i64) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Router::new().route(
            "/state.json",
            get(move || async move {
                let date = (Utc::now() + chrono::TimeDelta::seconds(date_offset_seconds))
                    .to_rfc2822();
                let mut response = axum::Json(serde_json::json!({
                    "db1": {
                        "fetch_time": Utc::now(),
                        "connection": true,
                        "pg_is_in_recovery": false,
                    }
                }))
                .into_response();
                response
                    .headers_mut()
                    .insert("date", HeaderValue::from_str(&date).unwrap());
                response
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_fetch_accepts_in_sync_observer() {
        let uri = serve_state(0).await;
        let client = reqwest::Client::new();

        let observed = fetch_observer_state(&client, "observer1", &uri).await;
        let observed = observed.expect("in-sync response should be kept");
        assert!(observed.connection);
        assert_eq!(
            observed.nodes["db1"].pg_is_in_recovery,
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_fetch_discards_skewed_observer() {
        // remote clock 10 s behind ours: the whole response is dropped
        let uri = serve_state(-10).await;
        let client = reqwest::Client::new();

        let observed = fetch_observer_state(&client, "observer1", &uri).await;
        assert_eq!(observed, None);
    }

    #[tokio::test]
    async fn test_fetch_degrades_on_connection_error() {
        let client = reqwest::Client::new();

        let observed =
            fetch_observer_state(&client, "observer1", "http://127.0.0.1:1").await;
        let observed = observed.expect("connection errors yield a disconnected record");
        assert!(!observed.connection);
        assert!(observed.nodes.is_empty());
    }
}
