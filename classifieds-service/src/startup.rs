//! Application startup and lifecycle management.
//!
//! Builds the HTTP router, wires the store connection according to the
//! deployment mode, and tears everything down on shutdown.

use crate::config::{ClassifiedsConfig, DeploymentMode};
use crate::handlers::{
    self,
    resources::{self, Advertisements, Areas, Categories},
    users,
};
use crate::middleware::cold_start_middleware;
use crate::services::{
    spawn_event_logger, spawn_reconnect, ConnectionManager, MongoConnector, ReconnectOutcome,
    StoreConnector,
};
use axum::{
    body::Body,
    http::{header, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    http_request_span, metrics_middleware, not_found_handler, panic_response,
    request_id_middleware,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ClassifiedsConfig>,
    pub connection: ConnectionManager,
}

impl AppState {
    pub fn new(config: ClassifiedsConfig, connector: Arc<dyn StoreConnector>) -> Self {
        let connection = ConnectionManager::new(
            config.mongodb.uri.clone(),
            config.mongodb.database.clone(),
            config.mongodb.options.clone(),
            connector,
        );
        Self {
            config: Arc::new(config),
            connection,
        }
    }
}

/// Build the full HTTP router for `state`.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(handlers::root))
        .route("/env-check", get(handlers::env_check))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .nest("/createCategory", resources::router::<Categories>())
        .nest("/createArea", resources::router::<Areas>())
        .nest("/createAdvertisement", resources::router::<Advertisements>())
        .nest("/createuser", users::signup_router())
        .nest("/createlogin", users::login_router());

    if state.config.deployment_mode == DeploymentMode::OnDemand {
        router = router
            .route("/demo-data", get(handlers::demo_data))
            .layer(from_fn_with_state(
                state.connection.clone(),
                cold_start_middleware,
            ));
    }

    router
        .fallback(not_found_handler)
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(http_request_span::<Body>))
        .layer(from_fn(request_id_middleware))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
    reconnect: Option<JoinHandle<ReconnectOutcome>>,
}

impl Application {
    /// Build the application against MongoDB.
    pub async fn build(config: ClassifiedsConfig) -> Result<Self, AppError> {
        Self::build_with_connector(config, Arc::new(MongoConnector)).await
    }

    /// Build the application with the given store connector.
    ///
    /// Long-running deployments start connecting in the background right
    /// away; on-demand deployments wait for the first request.
    pub async fn build_with_connector(
        config: ClassifiedsConfig,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self, AppError> {
        let state = AppState::new(config, connector);
        spawn_event_logger(&state.connection);

        // Bind HTTP listener (port 0 = random port for testing)
        let addr = SocketAddr::from(([0, 0, 0, 0], state.config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            mode = ?state.config.deployment_mode,
            environment = %state.config.environment,
            "Classifieds service listening"
        );

        let cancel = CancellationToken::new();
        let reconnect = match state.config.deployment_mode {
            DeploymentMode::LongRunning => Some(spawn_reconnect(
                state.connection.clone(),
                state.config.reconnect.clone(),
                cancel.clone(),
            )),
            DeploymentMode::OnDemand => {
                tracing::info!("On-demand mode: store connects on first request");
                None
            }
        };

        Ok(Self {
            port,
            listener,
            state,
            cancel,
            reconnect,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.state.connection
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `signal` resolves, then stop reconnecting and close the
    /// store connection.
    pub async fn run_with_shutdown<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = build_router(self.state.clone());
        let result = axum::serve(self.listener, router)
            .with_graceful_shutdown(signal)
            .await;

        if let Err(e) = &result {
            tracing::error!("HTTP server error: {}", e);
        }

        self.cancel.cancel();
        if let Some(handle) = self.reconnect {
            match handle.await {
                Ok(outcome) => tracing::info!(?outcome, "Store reconnect task finished"),
                Err(e) => tracing::warn!("Store reconnect task failed: {}", e),
            }
        }
        self.state.connection.disconnect().await;

        result
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
