//! The HTTP status surface.
//!
//! `GET /state.json` serves this node's member map so observers and peer
//! daemons can merge our view into theirs; `POST /check` asks the monitor for
//! an immediate pass; `GET /health` identifies the daemon.

use crate::state::{ClusterState, MemberState};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug, debug_span, info, warn};
use ulid::Ulid;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: Option<&str> = built_info::GIT_COMMIT_HASH;

/// The token pushed onto the monitor's check queue for `POST /check`.
const CHECK_REQUEST_TOKEN: &str = "request from webserver";

/// How often the server re-checks the running flag while draining.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
    name: String,
    version: String,
}

/// Bind and serve the status endpoint until the shared running flag is
/// cleared by the supervisor.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(
    address: &str,
    port: u16,
    state: Arc<ClusterState>,
    check_tx: mpsc::Sender<String>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let app = router(state, check_tx);

    let bind_address = if address.is_empty() {
        format!("[::]:{port}")
    } else {
        format!("{address}:{port}")
    };
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;

    info!(%bind_address, "listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(until_stopped(running))
        .await?;

    Ok(())
}

#[must_use]
pub fn router(state: Arc<ClusterState>, check_tx: mpsc::Sender<String>) -> Router {
    Router::new()
        .route("/state.json", get(cluster_state))
        .route("/check", post(request_check))
        .route("/health", get(health).options(health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state))
                .layer(Extension(check_tx)),
        )
}

async fn cluster_state(
    Extension(state): Extension<Arc<ClusterState>>,
) -> Json<BTreeMap<String, MemberState>> {
    Json(state.members_snapshot().await)
}

async fn request_check(Extension(check_tx): Extension<mpsc::Sender<String>>) -> StatusCode {
    debug!("check requested over HTTP");
    if let Err(err) = check_tx.try_send(CHECK_REQUEST_TOKEN.to_string()) {
        // a full queue means a check is already pending, which is as good
        warn!(%err, "could not enqueue check request");
    }
    StatusCode::NO_CONTENT
}

async fn health() -> Json<Health> {
    Json(Health {
        commit: GIT_COMMIT_HASH.map(ToString::to_string),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let path = request.uri().path();
    let request_id = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, request_id)
}

/// Resolves once the shared running flag is cleared, so in-flight requests
/// drain before the listener closes. The supervisor owns signal handling and
/// flips the flag; this task, like the monitor loop, only polls it.
async fn until_stopped(running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
    }
}
