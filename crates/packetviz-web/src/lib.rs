//! Real-time transport for PacketViz
//!
//! Serves a plain landing page, a health endpoint, and a WebSocket that
//! pushes every captured packet event to each connected client as JSON.

mod ws;

use axum::{response::Json, routing::get, Router};
use packetviz_core::config::WebSettings;
use packetviz_core::NormalizedPacketEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Web server configuration
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

impl From<&WebSettings> for WebConfig {
    fn from(settings: &WebSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
        }
    }
}

/// Shared application state
pub struct AppState {
    pub event_tx: broadcast::Sender<Arc<NormalizedPacketEvent>>,
    clients: AtomicUsize,
}

impl AppState {
    pub fn new(event_tx: broadcast::Sender<Arc<NormalizedPacketEvent>>) -> Self {
        Self {
            event_tx,
            clients: AtomicUsize::new(0),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/api/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve on an already bound listener until the task is dropped
pub async fn serve(
    listener: TcpListener,
    event_tx: broadcast::Sender<Arc<NormalizedPacketEvent>>,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(event_tx));
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Start the web server
pub async fn start_server(
    config: WebConfig,
    event_tx: broadcast::Sender<Arc<NormalizedPacketEvent>>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);
    info!("  - WebSocket at /ws");

    serve(listener, event_tx).await
}

async fn index() -> &'static str {
    "PacketViz backend running"
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "packetviz",
        "version": packetviz_core::SENSOR_VERSION,
        "clients": state.client_count(),
    }))
}
