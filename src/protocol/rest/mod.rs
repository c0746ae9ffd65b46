//! HTTP API Module
//!
//! Provides the HTTP server: health/metrics endpoints and the table service under
//! `/{account}/{resource}`. Every table service request goes through
//! [`TableHandler::handle`].

pub mod dto;
pub mod handlers;
pub mod response;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::protocol::TableHandler;

use self::handlers::{admin, tables};

/// Global connection counter for enforcing max_connections limit.
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Middleware: Enforce maximum concurrent connections.
async fn connection_limit_middleware(
    Extension(max_conns): Extension<MaxConnections>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let limit = max_conns.0;
    if limit > 0 {
        let current = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        if current >= limit {
            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!(limit, "connection_limit_reached");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
        let response = next.run(req).await;
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        response
    } else {
        next.run(req).await
    }
}

#[derive(Clone)]
struct MaxConnections(usize);

/// How OData links are built when the request does not name its host.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub scheme: String,
    /// `host:port` used when the request has no `Host` header
    pub default_host: String,
}

impl ServiceEndpoint {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            scheme: config.scheme.clone(),
            default_host: format!("{}:{}", config.host, config.port),
        }
    }
}

/// Creates the Axum router
pub fn create_router(handler: Arc<TableHandler>, config: &HttpConfig) -> Router {
    // Build CORS layer
    let cors = if !config.cors_origins.is_empty() {
        // Explicit origins configured: restrict to those
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|s| {
                let parsed = s.parse();
                if parsed.is_err() {
                    tracing::warn!(origin = %s, "invalid_cors_origin_ignored");
                }
                parsed.ok()
            })
            .collect();
        Some(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
    } else if config.cors_allow_all {
        // Explicit dev mode opt-in: allow all origins
        Some(CorsLayer::permissive())
    } else {
        // Default: same-origin only
        None
    };

    let mut app = Router::new()
        .route("/health", get(admin::health))
        .route("/live", get(admin::liveness))
        .route("/ready", get(admin::readiness))
        .route("/metrics", get(admin::stats))
        .route("/:account/*resource", any(tables::dispatch))
        .layer(Extension(handler))
        .layer(Extension(ServiceEndpoint::from_config(config)))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes));

    // Apply connection limit middleware
    // Extension(MaxConnections) must be outer so the middleware can extract it.
    // In Axum, .layer(A).layer(B) means B wraps A, so B runs first.
    let max_conns = MaxConnections(config.max_connections);
    app = app
        .layer(middleware::from_fn(connection_limit_middleware))
        .layer(Extension(max_conns));

    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    app.layer(TraceLayer::new_for_http())
}

/// Starts the HTTP server with graceful shutdown support.
///
/// Listens for SIGINT (ctrl-c) and SIGTERM to trigger graceful shutdown.
pub async fn start_http_server(
    handler: Arc<TableHandler>,
    config: &HttpConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(handler, config);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(%addr, "http_server_listening");

    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("http_server_stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "sigterm_handler_failed");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            () = ctrl_c => tracing::info!(signal = "SIGINT", "shutdown_requested"),
            () = sigterm => tracing::info!(signal = "SIGTERM", "shutdown_requested"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!(signal = "SIGINT", "shutdown_requested");
    }
}
