use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    middleware,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    bootstrap::CoreServices, config::AppConfig, dashboard_ws, handlers,
    middleware as app_middleware,
};

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<CoreServices>,
}

pub fn build_app(cfg: &AppConfig, services: Arc<CoreServices>) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    let timeout = Duration::from_millis(cfg.server.request_timeout_ms);
    let state = AppState { services };

    // The WebSocket route stays outside the request timeout.
    let dashboard = Router::new().route("/dashboard/ws", get(dashboard_ws::dashboard_ws_handler));

    Router::new()
        .route("/auth/login", post(handlers::login))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/revoke", post(handlers::revoke))
        .route("/auth/session/{jti}", get(handlers::session_status))
        .route("/auth/sessions/{user_id}", get(handlers::list_sessions))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/metrics/snapshot", get(handlers::metrics_snapshot))
        .layer(TimeoutLayer::new(timeout))
        .merge(dashboard)
        .with_state(state)
        // Middleware stack (order: correlation id -> cors/trace -> body limit)
        .layer(middleware::from_fn(app_middleware::correlation_id))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        correlation_id = Empty
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        // Set by the correlation middleware, which runs inside this layer.
                        if let Some(id) = res
                            .headers()
                            .get(app_middleware::CORRELATION_HEADER)
                            .and_then(|v| v.to_str().ok())
                        {
                            span.record("correlation_id", id);
                        }
                        tracing::info!(
                            http.status = res.status().as_u16(),
                            elapsed_ms = latency.as_millis() as u64,
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Connect backends and start every service.
    pub async fn build(self) -> anyhow::Result<WiseupServer> {
        let services = Arc::new(CoreServices::build(&self.config).await?);
        let app = build_app(&self.config, Arc::clone(&services));
        Ok(WiseupServer {
            addr: self.addr,
            app,
            services,
        })
    }
}

pub struct WiseupServer {
    addr: SocketAddr,
    app: Router,
    services: Arc<CoreServices>,
}

impl WiseupServer {
    pub fn services(&self) -> &Arc<CoreServices> {
        &self.services
    }

    /// Serve until Ctrl-C, then stop accepting and shut the services down in
    /// order.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        // Open dashboard sockets hold the listener until they close.
        let services = Arc::clone(&self.services);
        let served = axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            services.dashboard.shutdown().await;
        })
        .await;

        self.services.shutdown().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
