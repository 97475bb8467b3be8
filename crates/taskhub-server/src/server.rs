use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    response::IntoResponse,
    routing::get,
};
use taskhub_api::ApiError;
use taskhub_storage::DynTaskStore;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::auth::{self, JwtVerifier};
use crate::cache::{CacheBackend, CachedTaskStore};
use crate::config::AppConfig;
use crate::lock::LockCoordinator;
use crate::ratelimit::{self, RateLimiter};
use crate::tasks::TaskService;
use crate::{Backends, create_backends, create_task_store, handlers, metrics, timeout};
use crate::middleware as app_middleware;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<TaskService>,
    pub cache: Arc<dyn CacheBackend>,
    pub metrics_enabled: bool,
}

impl AppState {
    /// Wires the cache decorator and lock coordinator around `store`.
    pub fn new(cfg: &AppConfig, store: DynTaskStore, backends: &Backends) -> Self {
        let cached: DynTaskStore = Arc::new(CachedTaskStore::new(
            store,
            Arc::clone(&backends.cache),
            cfg.cache.task_ttl(),
        ));
        let locks = LockCoordinator::new(Arc::clone(&backends.coordination), &cfg.lock);
        Self {
            tasks: Arc::new(TaskService::new(cached, locks)),
            cache: Arc::clone(&backends.cache),
            metrics_enabled: cfg.metrics.enabled,
        }
    }
}

fn panic_response(_err: Box<dyn Any + Send + 'static>) -> axum::response::Response {
    tracing::error!("handler panicked");
    ApiError::internal("handler panicked").into_response()
}

pub fn build_app(cfg: &AppConfig, state: AppState) -> Router {
    let verifier = Arc::new(JwtVerifier::new(&cfg.auth.jwt_secret));

    let task_routes = Router::new()
        .route(
            "/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route(
            "/tasks/{id}",
            get(handlers::get_task)
                .put(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route_layer(middleware::from_fn_with_state(
            verifier,
            auth::require_identity,
        ));

    let mut app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .merge(task_routes)
        .with_state(state.clone())
        // Innermost: the timeout guard, then the rate limiter around it
        .layer(middleware::from_fn_with_state(
            cfg.server.request_timeout(),
            timeout::request_timeout,
        ));

    if cfg.rate_limit.enabled {
        let limiter = RateLimiter::new(Arc::clone(&state.cache), &cfg.rate_limit)
            .with_check_timeout(Duration::from_millis(cfg.redis.timeout_ms))
            .trust_forwarded_for(cfg.server.trust_forwarded_for);
        app = app.layer(middleware::from_fn_with_state(
            Arc::new(limiter),
            ratelimit::rate_limit,
        ));
    }

    // ServiceBuilder applies top to bottom, so the first layer is outermost
    app.layer(
        ServiceBuilder::new()
            .layer(middleware::from_fn(record_request_metrics))
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(middleware::from_fn(app_middleware::request_id))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &axum::http::Request<_>| {
                        use tracing::field::Empty;
                        let req_id = req
                            .extensions()
                            .get::<axum::http::HeaderValue>()
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        tracing::info_span!(
                            "http.request",
                            http.method = %req.method(),
                            http.target = %req.uri(),
                            http.status_code = Empty,
                            request_id = %req_id
                        )
                    })
                    .on_request(())
                    .on_response(
                        |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                            let status = res.status().as_u16();
                            span.record("http.status_code", tracing::field::display(status));
                            tracing::info!(
                                http.status = status,
                                elapsed_ms = latency.as_millis() as u64,
                                "request handled"
                            );
                        },
                    )
                    .on_failure(()),
            )
            .layer(DefaultBodyLimit::max(cfg.server.body_limit_bytes)),
    )
}

async fn record_request_metrics(
    req: axum::extract::Request,
    next: middleware::Next,
) -> axum::response::Response {
    let method = req.method().clone();
    let started = tokio::time::Instant::now();
    let res = next.run(req).await;
    metrics::record_http_request(method.as_str(), res.status().as_u16(), started.elapsed());
    res
}

pub struct TaskhubServer {
    addr: SocketAddr,
    app: Router,
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

    /// Connects the store and shared backends and assembles the router.
    pub async fn build(self) -> anyhow::Result<TaskhubServer> {
        if self.config.metrics.enabled {
            metrics::init_metrics();
        }

        let store = create_task_store(&self.config.storage).await?;
        let backends = create_backends(&self.config.redis).await;
        tracing::info!(
            storage = store.backend_name(),
            cache = backends.cache.mode(),
            lock = backends.coordination.mode(),
            "backends ready"
        );

        let state = AppState::new(&self.config, store, &backends);
        let app = build_app(&self.config, state);

        Ok(TaskhubServer {
            addr: self.addr,
            app,
        })
    }
}

impl TaskhubServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
