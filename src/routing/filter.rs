//! Compiled route filters.
//!
//! Filters run in declaration order. `AddHeader` appends to the outbound
//! request, `RateLimit` may short-circuit with 429, and `CircuitBreak` wraps
//! the final dispatch wherever it is declared.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

use crate::config::schema::{CircuitBreakerConfig, FilterConfig, KeyResolverConfig};
use crate::security::key_resolver::KeyResolverRef;
use crate::security::rate_limit::RateLimiterConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InvalidFilter(pub String);

/// A filter ready to run against requests.
#[derive(Debug, Clone)]
pub enum FilterSpec {
    AddHeader { name: HeaderName, value: HeaderValue },
    RateLimit { limits: RateLimiterConfig, resolver: KeyResolverRef },
    CircuitBreak(CircuitBreakerConfig),
}

impl FilterSpec {
    /// Compile a configured filter, resolving key resolver references.
    pub fn from_config(
        config: &FilterConfig,
        resolvers: &BTreeMap<String, KeyResolverConfig>,
    ) -> Result<Self, InvalidFilter> {
        match config {
            FilterConfig::AddRequestHeader { name, value } => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| InvalidFilter(format!("invalid header name '{}'", name)))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| InvalidFilter(format!("invalid value for header '{}'", name)))?;
                Ok(FilterSpec::AddHeader { name, value })
            }
            FilterConfig::RateLimit {
                replenish_rate,
                burst_capacity,
                requested_tokens,
                key_resolver,
            } => {
                if burst_capacity < replenish_rate {
                    return Err(InvalidFilter(format!(
                        "burst_capacity ({}) must be >= replenish_rate ({})",
                        burst_capacity, replenish_rate
                    )));
                }
                if *requested_tokens == 0 {
                    return Err(InvalidFilter("requested_tokens must be >= 1".to_string()));
                }

                let resolver = match key_resolver {
                    None => KeyResolverRef::client_ip(),
                    Some(name) => resolvers
                        .get(name)
                        .and_then(|config| KeyResolverRef::from_config(name, config))
                        .ok_or_else(|| InvalidFilter(format!("unusable key resolver '{}'", name)))?,
                };

                Ok(FilterSpec::RateLimit {
                    limits: RateLimiterConfig::new(*replenish_rate, *burst_capacity)
                        .with_requested_tokens(*requested_tokens),
                    resolver,
                })
            }
            FilterConfig::CircuitBreaker(breaker) => Ok(FilterSpec::CircuitBreak(breaker.clone())),
        }
    }
}

/// Append a header, keeping any values already present under the same name.
pub fn append_header(headers: &mut HeaderMap, name: &HeaderName, value: &HeaderValue) {
    headers.append(name.clone(), value.clone());
}
