//! HTTP and WebSocket handlers for the groupcast server.
//!
//! Routes:
//! - `POST /create?id=<id>` creates a group
//! - `DELETE /groups/:id` deletes a group and disconnects its members
//! - `GET /groups/:id` upgrades to a WebSocket and joins the group
//! - `GET /groups` lists live groups
//! - `GET /health`, `GET /stats`

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MeteredTransport};
use anyhow::Result;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use groupcast_core::{validate_group_id, GroupHandle, Relay, RelayConfig, RelayError};
use groupcast_transport::WebSocketTransport;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// How often relay-wide gauges are refreshed.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The relay.
    pub relay: Relay,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state, starting the relay's registry.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            relay: Relay::with_config(RelayConfig::from(&config.relay)),
            config,
        }
    }
}

/// An error returned to HTTP callers.
#[derive(Debug)]
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            RelayError::InvalidId(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::AlreadyExists(_) => StatusCode::CONFLICT,
            RelayError::RegistryStopped => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Query parameters of `POST /create`.
#[derive(Debug, Deserialize)]
pub struct CreateParams {
    #[serde(default)]
    id: String,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/create", post(create_handler))
        .route("/groups", get(list_handler))
        .route("/groups/:id", get(ws_handler).delete(delete_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(refresh_stats(state.relay.clone()));
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("groupcast listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/groups/<id>", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Periodically publish relay-wide gauges.
async fn refresh_stats(relay: Relay) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        interval.tick().await;
        match relay.stats().await {
            Ok(stats) => metrics::record_relay_stats(&stats),
            Err(e) => {
                error!(error = %e, "Stopping stats refresh");
                break;
            }
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Relay statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let stats = state.relay.stats().await?;
    metrics::record_relay_stats(&stats);
    Ok(Json(json!({
        "groups": stats.groups,
        "dropped_messages": stats.dropped_messages
    }))
    .into_response())
}

/// Create a group.
async fn create_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CreateParams>,
) -> Result<Response, ApiError> {
    state.relay.create_group(&params.id).await?;

    let body = json!({ "message": format!("created group with id: {}", params.id) });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// Delete a group.
async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.relay.delete_group(&id).await?;

    let body = json!({ "message": format!("deleted group with id: {}", id) });
    Ok(Json(body).into_response())
}

/// List live groups.
async fn list_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let groups = state.relay.group_ids().await?;
    Ok(Json(json!({ "groups": groups })).into_response())
}

/// WebSocket upgrade handler.
///
/// The group is looked up before upgrading so a missing group is a plain
/// HTTP error rather than an immediately closed socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    validate_group_id(&id).map_err(RelayError::InvalidId)?;
    let group = state
        .relay
        .lookup(&id)
        .await?
        .ok_or(RelayError::NotFound(id))?;

    Ok(ws
        .max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, group, state)))
}

/// Join an upgraded socket to its group and serve it until it disconnects.
async fn handle_websocket(socket: WebSocket, group: GroupHandle, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let transport = MeteredTransport::new(WebSocketTransport::new(socket));

    match state.relay.join(&group, transport).await {
        Ok(joined) => {
            debug!(group = %group.id(), member = %joined.tag, "WebSocket joined");
            joined.tasks.wait().await;
            debug!(group = %group.id(), member = %joined.tag, "WebSocket disconnected");
        }
        Err(e) => {
            // Dropping the transport closes the socket.
            debug!(group = %group.id(), error = %e, "Group closed before join");
            metrics::record_error("join");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    const WAIT: Duration = Duration::from_secs(2);

    fn state() -> Arc<AppState> {
        let mut config = Config::default();
        config.metrics.enabled = false;
        Arc::new(AppState::new(config))
    }

    fn params(id: &str) -> Query<CreateParams> {
        Query(CreateParams { id: id.to_string() })
    }

    async fn serve(state: Arc<AppState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_create_and_conflict() {
        let state = state();

        let created = create_handler(State(state.clone()), params("lobby")).await;
        assert_eq!(created.unwrap().status(), StatusCode::CREATED);

        let conflict = create_handler(State(state.clone()), params("lobby")).await;
        assert_eq!(conflict.unwrap_err().into_response().status(), StatusCode::CONFLICT);

        let invalid = create_handler(State(state), params("")).await;
        assert_eq!(invalid.unwrap_err().into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_missing_group() {
        let state = state();

        let missing = delete_handler(State(state.clone()), Path("ghost".to_string())).await;
        assert_eq!(missing.unwrap_err().into_response().status(), StatusCode::NOT_FOUND);

        state.relay.create_group("ghost").await.unwrap();
        let deleted = delete_handler(State(state), Path("ghost".to_string())).await;
        assert_eq!(deleted.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_join_missing_group_is_rejected() {
        let addr = serve(state()).await;
        let result = connect_async(format!("ws://{addr}/groups/nowhere")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_websocket_relay_and_delete() {
        let state = state();
        state.relay.create_group("lobby").await.unwrap();
        let addr = serve(state.clone()).await;
        let url = format!("ws://{addr}/groups/lobby");

        let (mut alice, _) = connect_async(&url).await.unwrap();
        let (mut bob, _) = connect_async(&url).await.unwrap();

        // Bob's join completes after his handshake, so keep sending until
        // he sees a message.
        let received = timeout(WAIT, async {
            loop {
                alice.send(Message::Text("hi".into())).await.unwrap();
                let next = timeout(Duration::from_millis(50), bob.next()).await;
                if let Ok(Some(Ok(Message::Text(text)))) = next {
                    return text;
                }
            }
        })
        .await
        .unwrap();
        assert!(received.ends_with(" - hi"));
        assert_eq!(received.len(), "xxxxxx - hi".len());

        state.relay.delete_group("lobby").await.unwrap();

        for client in [&mut alice, &mut bob] {
            let closed = timeout(WAIT, async {
                while let Some(Ok(message)) = client.next().await {
                    if message.is_close() {
                        return;
                    }
                }
            })
            .await;
            assert!(closed.is_ok());
        }
        assert!(state.relay.lookup("lobby").await.unwrap().is_none());
    }
}
