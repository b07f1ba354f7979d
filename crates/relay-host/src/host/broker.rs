// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::host::{
    credentials::CredentialStore,
    guard::{AbuseGuard, GuardConfig, Rejection},
    registry::ConnectionRegistry,
    ws_connection::WebSocketConnection,
};
use axum::{
    Json, Router,
    extract::{ConnectInfo, State, WebSocketUpgrade, ws::WebSocket},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use clipsync_common::{DEFAULT_MAX_MESSAGE_BYTES, MessageCodec};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::select;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen_address: SocketAddr,
    pub max_message_bytes: usize,
    pub auth_timeout: Duration,
    pub max_auth_attempts: u32,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub outbound_queue_depth: usize,
    pub max_malformed_frames: u32,
    pub guard: GuardConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8765)),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            auth_timeout: Duration::from_secs(30),
            max_auth_attempts: 3,
            idle_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(10),
            outbound_queue_depth: 64,
            max_malformed_frames: 3,
            guard: GuardConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Frames past this size are dropped by the transport itself. Anything between the
    /// configured limit and this ceiling reaches the codec and is answered with an error.
    pub fn transport_frame_ceiling(&self) -> usize {
        self.max_message_bytes.saturating_mul(2)
    }
}

/// Shared state behind every route: credentials, abuse tracking and the live connection set.
#[derive(Clone)]
pub struct SyncBroker {
    config: Arc<RelayConfig>,
    credentials: Arc<CredentialStore>,
    guard: Arc<AbuseGuard>,
    registry: Arc<ConnectionRegistry>,
    codec: MessageCodec,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl SyncBroker {
    pub fn new(config: RelayConfig, credentials: Arc<CredentialStore>) -> Self {
        let guard = AbuseGuard::new(config.guard.clone());
        let codec = MessageCodec::new(config.max_message_bytes);
        Self {
            config: Arc::new(config),
            credentials,
            guard: Arc::new(guard),
            registry: Arc::new(ConnectionRegistry::new()),
            codec,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn guard(&self) -> &AbuseGuard {
        &self.guard
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn codec(&self) -> MessageCodec {
        self.codec
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting work and close every live connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connections.close();
        let closed = self.registry.close_all();
        if closed > 0 {
            info!(closed, "Closed live connections");
        }
    }

    /// Wait for connection tasks to finish after [`Self::shutdown`]. Returns false if `grace`
    /// ran out first.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.connections.close();
        tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_ok()
    }

    /// Periodically forget expired blocks and stale rate windows.
    pub async fn run_janitor(self) {
        let mut interval = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let pruned = self.guard.prune();
                    if pruned > 0 {
                        debug!(pruned, tracked = self.guard.tracked_addresses(), "Pruned abuse records");
                    }
                }
            }
        }
    }

    pub(crate) async fn handle_socket(&self, socket: WebSocket, peer_addr: SocketAddr) {
        let connection = WebSocketConnection::new(self.clone(), peer_addr);
        self.connections
            .track_future(connection.run(socket))
            .await;
    }
}

/// WebSocket upgrade handler. Throttled and blocked addresses are refused before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(broker): State<SyncBroker>,
) -> Response {
    if broker.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Err(rejection) = broker.guard.admit_connection(addr.ip()) {
        warn!(peer_addr = ?addr, %rejection, "Refusing connection");
        let status = match rejection {
            Rejection::Blocked { .. } => StatusCode::FORBIDDEN,
            Rejection::TooManyConnections => StatusCode::TOO_MANY_REQUESTS,
        };
        return (status, rejection.to_string()).into_response();
    }
    debug!(peer_addr = ?addr, "Upgrading connection");

    let ceiling = broker.config.transport_frame_ceiling();
    ws.max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_upgrade(move |socket| async move { broker.handle_socket(socket, addr).await })
}

pub async fn health_handler(State(broker): State<SyncBroker>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connections": broker.registry.count(),
    }))
}

pub fn mk_routes(broker: SyncBroker) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CredentialSource, HashingParams};
    use pretty_assertions::assert_eq;

    fn broker() -> SyncBroker {
        let credentials = CredentialStore::load(
            &[CredentialSource::Static(vec![("alice".into(), "pw".into())])],
            HashingParams::new(1024, 1),
        )
        .unwrap();
        SyncBroker::new(RelayConfig::default(), Arc::new(credentials))
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let broker = broker();
        let Json(body) = health_handler(State(broker)).await;
        assert_eq!(body, json!({"status": "ok", "connections": 0}));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_drains() {
        let broker = broker();
        broker.shutdown();
        broker.shutdown();
        assert!(broker.shutdown_token().is_cancelled());
        assert!(broker.drain(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_janitor_stops_on_shutdown() {
        let broker = broker();
        let janitor = tokio::spawn(broker.clone().run_janitor());
        broker.shutdown();
        tokio::time::timeout(Duration::from_secs(1), janitor)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_transport_ceiling_above_limit() {
        let config = RelayConfig::default();
        assert!(config.transport_frame_ceiling() > config.max_message_bytes);
    }
}
