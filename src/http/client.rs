//! Upstream HTTP client.
//!
//! # Responsibilities
//! - Send prepared requests to upstreams
//! - Enforce the connect timeout
//! - Strip hop-by-hop headers from upstream responses
//!
//! # Design Decisions
//! - `Dispatcher` is a trait so the router can be driven without sockets
//! - Connection pooling is left to hyper-util's legacy client

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::config::schema::TimeoutConfig;
use crate::security::headers::strip_hop_by_hop;

/// Upstream could not be reached or answered malformed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to build upstream request: {0}")]
    InvalidRequest(String),

    #[error("upstream request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read upstream body: {0}")]
    Body(String),
}

/// Sends a request to its upstream and returns the response.
#[async_trait]
pub trait Dispatcher: Send + Sync + std::fmt::Debug {
    async fn dispatch(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError>;
}

/// Dispatcher backed by a pooled hyper client.
#[derive(Debug, Clone)]
pub struct HyperDispatcher {
    client: Client<HttpConnector, Body>,
}

impl HyperDispatcher {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }
}

#[async_trait]
impl Dispatcher for HyperDispatcher {
    async fn dispatch(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let response: Response<Incoming> = self.client.request(request).await?;
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}
