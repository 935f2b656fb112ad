//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the counter store, rate limiter, route table and router
//! - Create the Axum app with a catch-all gateway handler
//! - Wire up middleware (tracing, request ID, whole-request timeout)
//! - Apply route table reloads while serving
//! - Drain connections on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    routing::any,
    Router as AxumRouter,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::schema::{ProxyConfig, StoreBackend};
use crate::http::client::{Dispatcher, HyperDispatcher};
use crate::http::request::MakeRequestUuid;
use crate::routing::{RouteTable, RouteTableError, Router};
use crate::security::rate_limit::RateLimiter;
use crate::security::store::{CounterStore, MemoryStore, RedisStore, StoreError};

/// The server could not be assembled from its configuration.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid route table: {0}")]
    Routes(#[from] RouteTableError),

    #[error("rate limit store: {0}")]
    Store(#[from] StoreError),
}

/// HTTP server for the gateway.
pub struct HttpServer {
    app: AxumRouter,
    router: Arc<Router>,
    memory_store: Option<Arc<MemoryStore>>,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a server that dispatches upstream over HTTP.
    pub fn new(config: ProxyConfig) -> Result<Self, StartupError> {
        let dispatcher = Arc::new(HyperDispatcher::new(&config.timeouts));
        Self::with_dispatcher(config, dispatcher)
    }

    /// Create a server with a custom upstream dispatcher.
    pub fn with_dispatcher(config: ProxyConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self, StartupError> {
        let table = RouteTable::from_config(&config)?;

        let memory_store = match config.rate_limiter.backend {
            StoreBackend::Memory => Some(Arc::new(MemoryStore::new())),
            StoreBackend::Redis => None,
        };
        let store: Arc<dyn CounterStore> = match &memory_store {
            Some(store) => store.clone(),
            None => {
                let url = config
                    .rate_limiter
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| StoreError::Unavailable("redis_url is not set".to_string()))?;
                Arc::new(RedisStore::new(url, config.rate_limiter.redis_max_connections)?)
            }
        };

        let limiter = RateLimiter::new(
            store,
            config.rate_limiter.on_store_error,
            config.rate_limiter.key_prefix.clone(),
        );

        tracing::info!(
            routes = table.len(),
            store = ?config.rate_limiter.backend,
            on_store_error = ?config.rate_limiter.on_store_error,
            "Gateway initialized"
        );

        let router = Arc::new(Router::new(
            table,
            limiter,
            dispatcher,
            config.security.max_body_size,
        ));
        let app = Self::build_app(&config, router.clone());

        Ok(Self {
            app,
            router,
            memory_store,
            config,
        })
    }

    /// Build the Axum app with all middleware layers.
    #[allow(deprecated)]
    fn build_app(config: &ProxyConfig, router: Arc<Router>) -> AxumRouter {
        AxumRouter::new()
            .route("/{*path}", any(gateway_handler))
            .route("/", any(gateway_handler))
            .with_state(router)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Handle to the request pipeline.
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serve until `shutdown` fires, applying configs received on `config_updates`.
    ///
    /// Only routes and key resolvers are reloaded; listener, store and
    /// timeout changes need a restart.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        tokio::spawn(reload_routes(
            self.router.clone(),
            config_updates,
            shutdown.resubscribe(),
        ));

        if let Some(store) = self.memory_store.clone() {
            let interval = Duration::from_secs(self.config.rate_limiter.sweep_interval_secs.max(1));
            tokio::spawn(store.run_sweeper(interval, shutdown.resubscribe()));
        }

        let app = self.app.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Compile and publish every config received until shutdown.
async fn reload_routes(
    router: Arc<Router>,
    mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = config_updates.recv() => {
                let Some(config) = update else {
                    tracing::debug!("Config update channel closed");
                    break;
                };
                match RouteTable::from_config(&config) {
                    Ok(table) => router.publish(table),
                    Err(e) => tracing::error!(error = %e, "Rejected route table, keeping current routes"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Catch-all handler: every request goes through the gateway pipeline.
async fn gateway_handler(
    State(router): State<Arc<Router>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    router.handle(request, Some(addr)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use crate::config::parse_config;
    use crate::http::client::DispatchError;

    /// Answers with the target URI and reports the request id it received.
    #[derive(Debug)]
    struct EchoUpstream;

    #[async_trait]
    impl Dispatcher for EchoUpstream {
        async fn dispatch(&self, request: Request<Body>) -> Result<Response, DispatchError> {
            let seen_id = request.headers().get("x-request-id").cloned();
            let mut response = Response::new(Body::from(request.uri().to_string()));
            if let Some(id) = seen_id {
                response.headers_mut().insert("x-upstream-request-id", id);
            }
            Ok(response)
        }
    }

    fn app() -> AxumRouter {
        let config = parse_config(
            r#"
            [[routes]]
            id = "api"
            path = "/api"
            uri = "http://upstream.test"
            "#,
        )
        .unwrap();
        let server = HttpServer::with_dispatcher(config, Arc::new(EchoUpstream)).unwrap();
        server
            .app
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))))
    }

    #[tokio::test]
    async fn test_request_id_is_generated_and_forwarded() {
        let request = Request::builder()
            .uri("/api/items?page=2")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()["x-request-id"].clone();
        assert!(uuid::Uuid::parse_str(id.to_str().unwrap()).is_ok());
        assert_eq!(response.headers()["x-upstream-request-id"], id);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"http://upstream.test/api/items?page=2");
    }

    #[tokio::test]
    async fn test_client_request_id_is_kept() {
        let request = Request::builder()
            .uri("/other")
            .header("x-request-id", "client-id")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-request-id"], "client-id");
    }

    #[test]
    fn test_redis_backend_without_url_fails() {
        let mut config = ProxyConfig::default();
        config.rate_limiter.backend = StoreBackend::Redis;
        let err = HttpServer::with_dispatcher(config, Arc::new(EchoUpstream)).err().unwrap();
        assert!(matches!(err, StartupError::Store(StoreError::Unavailable(_))));
    }
}
