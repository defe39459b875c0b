//! Web server module.

mod handlers;

pub use handlers::*;

use crate::alert::Notifier;
use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::db::Store;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub coordinator: Arc<Coordinator>,
    pub notifier: Notifier,
    /// Serializes read-modify-write of the stored integration config.
    pub config_lock: Arc<Mutex<()>>,
}

/// Web server for connmon.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, coordinator: Arc<Coordinator>, notifier: Notifier) -> Self {
        Self {
            state: AppState {
                config,
                store,
                coordinator,
                notifier,
                config_lock: Arc::new(Mutex::new(())),
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        // Status page
        .route("/", get(handlers::handle_status))
        // Integration settings
        .route(
            "/api/settings",
            get(handlers::handle_get_settings).put(handlers::handle_update_settings),
        )
        // Devices and sensors
        .route(
            "/api/devices",
            get(handlers::handle_get_devices).post(handlers::handle_add_device),
        )
        .route("/api/devices/{host}", delete(handlers::handle_delete_device))
        .route("/api/devices/{host}/alerts", put(handlers::handle_update_alerts))
        .route("/api/sensors", get(handlers::handle_get_sensors))
        .route("/api/sensors/{unique_id}", delete(handlers::handle_delete_sensor))
        .route("/api/history", get(handlers::handle_get_history))
        .route("/api/notify-groups", get(handlers::handle_get_notify_groups))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}
