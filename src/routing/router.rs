//! Request orchestration.
//!
//! # Data Flow
//! ```text
//! handle(request)
//!     → table.rs (first matching route, 404 on miss)
//!     → headers.rs (strip inbound hop-by-hop headers)
//!     → filters in declared order:
//!         AddHeader  → append to outbound headers
//!         RateLimit  → rate_limit.rs (429 + Retry-After on denial, chain stops)
//!         CircuitBreak → remembered, wraps the final dispatch
//!     → dispatch: direct, or guarded by the route's breaker
//!         open / timeout / error → fallback route (direct, no breaker)
//! ```
//!
//! # Design Decisions
//! - The table is read through an `ArcSwap` snapshot; one snapshot per request
//! - Guarded routes buffer both bodies so the fallback can replay the request
//!   and a timed-out response is never partially streamed
//! - Only the fallback route's AddHeader filters run on fallback dispatch

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, Request, Response, Version};
use axum::response::IntoResponse;
use tokio::time::Instant;

use crate::config::schema::CircuitBreakerConfig;
use crate::http::client::{DispatchError, Dispatcher};
use crate::http::request::request_id;
use crate::http::response::ProxyError;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::routing::filter::{append_header, FilterSpec};
use crate::routing::table::{Route, RouteTable, Upstream};
use crate::security::headers::{prepare_forward_headers, strip_hop_by_hop};
use crate::security::key_resolver::RequestIdentity;
use crate::security::rate_limit::{RateLimitDecision, RateLimiter};

/// The gateway's request pipeline.
pub struct Router {
    table: ArcSwap<RouteTable>,
    limiter: RateLimiter,
    breakers: CircuitBreakerRegistry,
    dispatcher: Arc<dyn Dispatcher>,
    max_body_bytes: usize,
}

impl Router {
    pub fn new(table: RouteTable, limiter: RateLimiter, dispatcher: Arc<dyn Dispatcher>, max_body_bytes: usize) -> Self {
        let breakers = CircuitBreakerRegistry::new();
        breakers.sync(table.guarded());
        Self {
            table: ArcSwap::from_pointee(table),
            limiter,
            breakers,
            dispatcher,
            max_body_bytes,
        }
    }

    /// Atomically replace the route table.
    ///
    /// In-flight requests finish on the table they started with.
    pub fn publish(&self, table: RouteTable) {
        self.breakers.sync(table.guarded());
        let routes = table.len();
        self.table.store(Arc::new(table));
        tracing::info!(routes, "Route table published");
    }

    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Route one request and produce its response.
    pub async fn handle(&self, request: Request<Body>, client_addr: Option<SocketAddr>) -> Response<Body> {
        let start = Instant::now();
        let request_id = request_id(&request);
        let table = self.table.load_full();

        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| request.uri().host())
            .map(str::to_string);

        let route = match table.match_route(host.as_deref(), request.uri().path()) {
            Ok(route) => route,
            Err(e) => {
                tracing::warn!(request_id = %request_id, host = ?e.host, path = %e.path, "No route matched");
                metrics::record_request("none", 404, start);
                return ProxyError::from(e).into_response();
            }
        };

        tracing::debug!(
            request_id = %request_id,
            route = %route.id,
            method = %request.method(),
            path = %request.uri().path(),
            "Route matched"
        );

        let response = match self.run_filters(&table, &route, request, client_addr, &request_id).await {
            Ok(response) => response,
            Err(e) => {
                if !matches!(e, ProxyError::RateLimitExceeded { .. }) {
                    tracing::error!(request_id = %request_id, route = %route.id, error = %e, "Request failed");
                }
                e.into_response()
            }
        };

        metrics::record_request(&route.id, response.status().as_u16(), start);
        response
    }

    async fn run_filters(
        &self,
        table: &RouteTable,
        route: &Route,
        mut request: Request<Body>,
        client_addr: Option<SocketAddr>,
        request_id: &str,
    ) -> Result<Response<Body>, ProxyError> {
        let mut breaker = None;
        strip_hop_by_hop(request.headers_mut());

        for filter in &route.filters {
            match filter {
                FilterSpec::AddHeader { name, value } => append_header(request.headers_mut(), name, value),
                FilterSpec::RateLimit { limits, resolver } => {
                    let identity = RequestIdentity {
                        headers: request.headers(),
                        uri: request.uri(),
                        client_addr,
                    };
                    let bucket = self.limiter.bucket_key(&route.id, &resolver.key(&identity));

                    if let RateLimitDecision::Denied { retry_after, remaining } = self.limiter.allow(&bucket, limits).await {
                        tracing::warn!(
                            request_id = %request_id,
                            route = %route.id,
                            bucket = %bucket,
                            retry_after = ?retry_after,
                            "Rate limit exceeded"
                        );
                        metrics::record_rate_limited(&route.id);
                        return Err(ProxyError::RateLimitExceeded {
                            retry_after,
                            remaining,
                            limits: *limits,
                        });
                    }
                }
                FilterSpec::CircuitBreak(config) => breaker = Some(config),
            }
        }

        match breaker {
            None => self.forward(route, request, client_addr).await,
            Some(config) => {
                self.guarded_dispatch(table, route, config, request, client_addr, request_id)
                    .await
            }
        }
    }

    /// Send the request to the route's upstream without any protection.
    async fn forward(
        &self,
        route: &Route,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        let upstream = match &route.upstream {
            Upstream::Static(response) => return Ok(response.to_response()),
            Upstream::Http(upstream) => upstream,
        };

        let (mut parts, body) = request.into_parts();
        parts.uri = upstream
            .target_uri(&parts.uri)
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        parts.version = Version::HTTP_11;

        prepare_forward_headers(&mut parts.headers, client_addr);
        let host = HeaderValue::from_str(upstream.authority().as_str())
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        parts.headers.insert(header::HOST, host);

        Ok(self.dispatcher.dispatch(Request::from_parts(parts, body)).await?)
    }

    /// `forward`, reading the whole response body before returning.
    async fn forward_buffered(
        &self,
        route: &Route,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        let response = self.forward(route, request, client_addr).await?;
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| DispatchError::Body(e.to_string()))?;
        Ok(Response::from_parts(parts, Body::from(body)))
    }

    async fn guarded_dispatch(
        &self,
        table: &RouteTable,
        route: &Route,
        config: &CircuitBreakerConfig,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
        request_id: &str,
    ) -> Result<Response<Body>, ProxyError> {
        let breaker = self.breakers.get_or_detached(&route.id, config);

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| ProxyError::BodyTooLarge(self.max_body_bytes))?;

        let outbound = rebuild_request(&parts, body.clone());
        let fail_on_5xx = config.fail_on_5xx;
        let is_failure = move |response: &Response<Body>| fail_on_5xx && response.status().is_server_error();
        let outcome = breaker
            .call(|| self.forward_buffered(route, outbound, client_addr), is_failure)
            .await;

        let Some(fallback_id) = config.fallback.as_deref() else {
            return outcome.map_err(|e| breaker_error(&route.id, e).1);
        };

        let (reason, cause) = match outcome {
            Ok(response) if !is_failure(&response) => return Ok(response),
            Ok(response) => ("status", format!("upstream answered {}", response.status())),
            Err(e) => {
                let (reason, error) = breaker_error(&route.id, e);
                (reason, error.to_string())
            }
        };

        tracing::info!(
            request_id = %request_id,
            route = %route.id,
            breaker = %config.name,
            fallback = %fallback_id,
            reason,
            cause = %cause,
            "Dispatching to fallback route"
        );
        metrics::record_fallback(&route.id, reason);

        let fallback_failed = |reason: String| ProxyError::FallbackFailed {
            fallback: fallback_id.to_string(),
            reason,
        };
        let fallback = table
            .get(fallback_id)
            .ok_or_else(|| fallback_failed("route not found".to_string()))?;

        let mut request = rebuild_request(&parts, body);
        for filter in &fallback.filters {
            if let FilterSpec::AddHeader { name, value } = filter {
                append_header(request.headers_mut(), name, value);
            }
        }

        self.forward(&fallback, request, client_addr)
            .await
            .map_err(|e| fallback_failed(e.to_string()))
    }
}

/// Fallback reason label and client-facing error for a failed guarded call.
fn breaker_error(route_id: &str, error: BreakerError<ProxyError>) -> (&'static str, ProxyError) {
    match error {
        BreakerError::Open => ("open", ProxyError::CircuitOpen(route_id.to_string())),
        BreakerError::Timeout(deadline) => ("timeout", ProxyError::UpstreamTimeout(deadline)),
        BreakerError::Failed(e) => ("error", e),
    }
}

fn rebuild_request(parts: &Parts, body: Bytes) -> Request<Body> {
    let mut request = Request::new(Body::from(body));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::{HeaderMap, StatusCode, Uri};

    use crate::config::parse_config;
    use crate::config::schema::StoreFailurePolicy;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::security::store::MemoryStore;

    const GATEWAY: &str = r#"
        [key_resolvers.throttle]
        kind = "constant"
        value = "throttle"

        [[routes]]
        id = "path_route"
        path = "/get"
        uri = "http://upstream.test:8081"
        [[routes.filters]]
        type = "add_request_header"
        name = "X-CUSTOM-HEADER"
        value = "Hello, World!"

        [[routes]]
        id = "hystrix_route"
        host = "*.hystrix.com"
        uri = "http://upstream.test:8081"
        [[routes.filters]]
        type = "circuit_breaker"
        name = "mycmd"
        fallback = "fallback"
        timeout_ms = 1000
        failure_threshold = 3
        reset_timeout_ms = 5000

        [[routes]]
        id = "bare_breaker"
        host = "*.bare.com"
        uri = "http://upstream.test:8081"
        [[routes.filters]]
        type = "circuit_breaker"
        name = "bare"
        failure_threshold = 2
        fail_on_5xx = true

        [[routes]]
        id = "strict_route"
        host = "*.strict.com"
        uri = "http://upstream.test:8081"
        [[routes.filters]]
        type = "circuit_breaker"
        name = "strict"
        fallback = "fallback"
        fail_on_5xx = true

        [[routes]]
        id = "throttle_route"
        host = "*.throttle.com"
        uri = "http://upstream.test:8081"
        [[routes.filters]]
        type = "rate_limit"
        replenish_rate = 1
        burst_capacity = 1
        key_resolver = "throttle"

        [[routes]]
        id = "fallback"
        path = "/fallback"
        uri = "static:"
        response = { body = "fallback" }
    "#;

    #[derive(Debug, Default)]
    struct MockUpstream {
        calls: AtomicU32,
        delay: Duration,
        fail: bool,
        status: Option<StatusCode>,
        last: Mutex<Option<(Uri, HeaderMap)>>,
    }

    #[async_trait]
    impl Dispatcher for MockUpstream {
        async fn dispatch(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some((request.uri().clone(), request.headers().clone()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(DispatchError::InvalidRequest("connection refused".to_string()));
            }
            let mut response = Response::new(Body::from("upstream"));
            *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
            Ok(response)
        }
    }

    fn router(upstream: Arc<MockUpstream>) -> Router {
        let config = parse_config(GATEWAY).unwrap();
        let table = RouteTable::from_config(&config).unwrap();
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), StoreFailurePolicy::FailOpen, "test");
        Router::new(table, limiter, upstream, 1024 * 1024)
    }

    fn request(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_add_header_appends_and_forwards() {
        let upstream = Arc::new(MockUpstream::default());
        let router = router(upstream.clone());

        let mut req = request("gateway.local:8080", "/get?show_env=1");
        req.headers_mut()
            .insert("x-custom-header", HeaderValue::from_static("from-client"));
        let response = router.handle(req, Some("10.1.2.3:5555".parse().unwrap())).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "upstream");

        let (uri, headers) = upstream.last.lock().unwrap().clone().unwrap();
        assert_eq!(uri, "http://upstream.test:8081/get?show_env=1");
        let custom: Vec<_> = headers.get_all("x-custom-header").iter().collect();
        assert_eq!(custom, vec!["from-client", "Hello, World!"]);
        assert_eq!(headers[header::HOST], "upstream.test:8081");
        assert_eq!(headers["x-forwarded-host"], "gateway.local:8080");
        assert_eq!(headers["x-forwarded-for"], "10.1.2.3");
    }

    #[tokio::test]
    async fn test_connection_header_cannot_strip_added_header() {
        let upstream = Arc::new(MockUpstream::default());
        let router = router(upstream.clone());

        let mut req = request("gateway.local", "/get");
        req.headers_mut().insert(
            header::CONNECTION,
            HeaderValue::from_static("x-custom-header, x-forwarded-host"),
        );
        let response = router.handle(req, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let (_, headers) = upstream.last.lock().unwrap().clone().unwrap();
        let custom: Vec<_> = headers.get_all("x-custom-header").iter().collect();
        assert_eq!(custom, vec!["Hello, World!"]);
        assert!(headers.get(header::CONNECTION).is_none());
        assert_eq!(headers["x-forwarded-host"], "gateway.local");
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404() {
        let upstream = Arc::new(MockUpstream::default());
        let router = router(upstream.clone());

        let response = router.handle(request("example.org", "/nothing"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_denies_then_recovers() {
        let upstream = Arc::new(MockUpstream::default());
        let router = router(upstream.clone());

        let first = router.handle(request("foo.throttle.com", "/anything"), None).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = router.handle(request("bar.throttle.com", "/anything"), None).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[header::RETRY_AFTER], "1");
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let third = router.handle(request("foo.throttle.com", "/anything"), None).await;
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_dispatches_fallback() {
        let upstream = Arc::new(MockUpstream {
            delay: Duration::from_secs(3),
            ..Default::default()
        });
        let router = router(upstream.clone());

        let start = Instant::now();
        let response = router.handle(request("foo.hystrix.com", "/delay/3"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "fallback");
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_upstream() {
        let upstream = Arc::new(MockUpstream {
            fail: true,
            ..Default::default()
        });
        let router = router(upstream.clone());

        for _ in 0..3 {
            let response = router.handle(request("foo.hystrix.com", "/status"), None).await;
            assert_eq!(body_text(response).await, "fallback");
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            router.breakers().get("hystrix_route").unwrap().state(),
            CircuitState::Open
        );

        let response = router.handle(request("foo.hystrix.com", "/status"), None).await;
        assert_eq!(body_text(response).await, "fallback");
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);

        // Other routes are unaffected.
        let response = router.handle(request("gateway.local", "/get"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_without_fallback_surfaces_errors() {
        let upstream = Arc::new(MockUpstream {
            status: Some(StatusCode::INTERNAL_SERVER_ERROR),
            ..Default::default()
        });
        let router = router(upstream.clone());

        for _ in 0..2 {
            let response = router.handle(request("api.bare.com", "/"), None).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body_text(response).await, "upstream");
        }

        let response = router.handle(request("api.bare.com", "/"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_status_dispatches_fallback() {
        let upstream = Arc::new(MockUpstream {
            status: Some(StatusCode::INTERNAL_SERVER_ERROR),
            ..Default::default()
        });
        let router = router(upstream.clone());

        let response = router.handle(request("api.strict.com", "/status/500"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "fallback");
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.breakers().get("strict_route").unwrap().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_swaps_table_and_breakers() {
        let upstream = Arc::new(MockUpstream::default());
        let router = router(upstream.clone());
        assert!(router.breakers().get("hystrix_route").is_some());

        let config = parse_config(
            r#"
            [[routes]]
            id = "only"
            path = "/only"
            uri = "http://upstream.test:8081"
            "#,
        )
        .unwrap();
        router.publish(RouteTable::from_config(&config).unwrap());

        assert_eq!(router.table().len(), 1);
        assert!(router.breakers().get("hystrix_route").is_none());
        let response = router.handle(request("gateway.local", "/get"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = router.handle(request("gateway.local", "/only"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
