use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use chatdesk_store::{AccountRepo, Database, SessionRepo};
use chatdesk_telemetry::TelemetryGuard;

use crate::broker::{self, ChatBroker};
use crate::client::{self, ClientId, ClientRegistry};
use crate::config::ServerConfig;
use crate::http;
use crate::identity::{IdentityResolver, JwtIdentityResolver, TokenIssuer};
use crate::rooms::RoomRouter;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<ChatBroker>,
    pub telemetry: Arc<TelemetryGuard>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(http::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server without a persisted log sink.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    start_with_telemetry(config, db, Arc::new(TelemetryGuard::disabled())).await
}

/// Create and start the server. Returns a handle that keeps it running.
pub async fn start_with_telemetry(
    config: ServerConfig,
    db: Database,
    telemetry: Arc<TelemetryGuard>,
) -> Result<ServerHandle, std::io::Error> {
    let secret = config.signing_secret();
    let resolver: Arc<dyn IdentityResolver> =
        Arc::new(JwtIdentityResolver::new(&secret, AccountRepo::new(db.clone())));
    let issuer = TokenIssuer::new(&secret, config.token_ttl);

    let registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let router = Arc::new(RoomRouter::new(registry));
    let sessions = SessionRepo::new(db).with_preview_chars(config.preview_chars);
    let broker = Arc::new(ChatBroker::new(
        sessions,
        resolver,
        router,
        config.lock_timeout,
    ));

    let cleanup = broker::start_cleanup_task(Arc::clone(&broker), config.cleanup_interval);

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let processor = tokio::spawn(process_client_events(msg_rx, Arc::clone(&broker)));

    let app_state = AppState {
        broker: Arc::clone(&broker),
        telemetry,
        message_tx: msg_tx,
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(port = local_addr.port(), host = %config.host, "chatdesk server started");

    let app = build_router(app_state);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server exited");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        broker,
        issuer,
        server,
        processor,
        cleanup,
    })
}

/// Handle returned by `start()`. Dropping it leaves the tasks running;
/// call [`ServerHandle::shutdown`] to stop them.
pub struct ServerHandle {
    pub port: u16,
    broker: Arc<ChatBroker>,
    issuer: TokenIssuer,
    server: tokio::task::JoinHandle<()>,
    processor: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn broker(&self) -> &Arc<ChatBroker> {
        &self.broker
    }

    /// Issuer signing with the same secret the server verifies against.
    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn shutdown(self) {
        self.server.abort();
        self.processor.abort();
        self.cleanup.abort();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let registry = Arc::clone(state.broker.registry());
    let (client_id, rx) = registry.register();
    tracing::info!(client_id = %client_id, "WebSocket client connected");

    client::handle_ws_connection(socket, client_id.clone(), rx, registry, state.message_tx).await;

    state.broker.disconnect(&client_id);
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.broker.registry().count(),
    }))
}

/// Each inbound event runs on its own task so a slow store write for one
/// session never stalls events for another.
async fn process_client_events(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    broker: Arc<ChatBroker>,
) {
    while let Some((client_id, raw)) = rx.recv().await {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker.handle_event(&client_id, &raw).await;
        });
    }
}
