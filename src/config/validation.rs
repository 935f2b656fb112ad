//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (fallbacks and key resolvers exist)
//! - Validate value ranges (bucket sizes, breaker thresholds)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::{HashMap, HashSet};

use axum::http::{HeaderName, HeaderValue, StatusCode};
use thiserror::Error;
use url::Url;

use crate::config::schema::{
    FilterConfig, KeySourceKind, ProxyConfig, RouteConfig, StoreBackend,
};
use crate::routing::matcher::HostMatcher;
use crate::routing::table::STATIC_SCHEME;

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("route #{index} has an empty id")]
    EmptyRouteId { index: usize },

    #[error("duplicate route id '{0}'")]
    DuplicateRouteId(String),

    #[error("route '{0}' needs a host or path predicate")]
    MissingPredicate(String),

    #[error("route '{route}': invalid host pattern '{pattern}'")]
    InvalidHost { route: String, pattern: String },

    #[error("route '{route}': path '{path}' must start with '/'")]
    InvalidPath { route: String, path: String },

    #[error("route '{0}' has an empty uri")]
    EmptyUri(String),

    #[error("route '{route}': invalid uri '{uri}': {reason}")]
    InvalidUri { route: String, uri: String, reason: String },

    #[error("route '{0}': a response block is only allowed on static: routes")]
    UnexpectedResponse(String),

    #[error("route '{route}': invalid status code {status}")]
    InvalidStatus { route: String, status: u16 },

    #[error("route '{route}': invalid header '{name}'")]
    InvalidHeader { route: String, name: String },

    #[error("route '{route}': {reason}")]
    InvalidRateLimit { route: String, reason: String },

    #[error("route '{route}': unknown key resolver '{resolver}'")]
    UnknownKeyResolver { route: String, resolver: String },

    #[error("key resolver '{resolver}': {reason}")]
    IncompleteKeyResolver { resolver: String, reason: String },

    #[error("route '{0}' declares more than one circuit_breaker filter")]
    MultipleCircuitBreakers(String),

    #[error("route '{route}': circuit breaker {reason}")]
    InvalidCircuitBreaker { route: String, reason: String },

    #[error("route '{route}': fallback route '{fallback}' does not exist")]
    UnknownFallback { route: String, fallback: String },

    #[error("route '{route}': fallback route '{fallback}' must not be circuit breaker guarded")]
    GuardedFallback { route: String, fallback: String },

    #[error("rate_limiter.redis_url is required for the redis backend")]
    MissingRedisUrl,
}

/// Validate the whole configuration, collecting every problem.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let routes_by_id: HashMap<&str, &RouteConfig> = config
        .routes
        .iter()
        .map(|r| (r.id.as_str(), r))
        .collect();

    let mut seen = HashSet::new();
    for (index, route) in config.routes.iter().enumerate() {
        if route.id.trim().is_empty() {
            errors.push(ValidationError::EmptyRouteId { index });
        } else if !seen.insert(route.id.as_str()) {
            errors.push(ValidationError::DuplicateRouteId(route.id.clone()));
        }

        validate_predicates(route, &mut errors);
        validate_upstream(route, &mut errors);
        validate_filters(config, route, &routes_by_id, &mut errors);
    }

    for (name, resolver) in &config.key_resolvers {
        let missing = match resolver.kind {
            KeySourceKind::Constant if is_blank(&resolver.value) => Some("constant resolver needs a value"),
            KeySourceKind::Header if is_blank(&resolver.name) => Some("header resolver needs a name"),
            KeySourceKind::Query if is_blank(&resolver.name) => Some("query resolver needs a name"),
            _ => None,
        };
        if let Some(reason) = missing {
            errors.push(ValidationError::IncompleteKeyResolver {
                resolver: name.clone(),
                reason: reason.to_string(),
            });
        } else if resolver.kind == KeySourceKind::Header {
            let valid = resolver
                .name
                .as_deref()
                .is_some_and(|n| HeaderName::from_bytes(n.as_bytes()).is_ok());
            if !valid {
                errors.push(ValidationError::IncompleteKeyResolver {
                    resolver: name.clone(),
                    reason: "header name is not a valid HTTP header".to_string(),
                });
            }
        }
    }

    if config.rate_limiter.backend == StoreBackend::Redis && is_blank(&config.rate_limiter.redis_url) {
        errors.push(ValidationError::MissingRedisUrl);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn validate_predicates(route: &RouteConfig, errors: &mut Vec<ValidationError>) {
    if route.host.is_none() && route.path.is_none() {
        errors.push(ValidationError::MissingPredicate(route.id.clone()));
    }

    if let Some(pattern) = &route.host {
        if HostMatcher::new(pattern).is_err() {
            errors.push(ValidationError::InvalidHost {
                route: route.id.clone(),
                pattern: pattern.clone(),
            });
        }
    }

    if let Some(path) = &route.path {
        if !path.starts_with('/') {
            errors.push(ValidationError::InvalidPath {
                route: route.id.clone(),
                path: path.clone(),
            });
        }
    }
}

fn validate_upstream(route: &RouteConfig, errors: &mut Vec<ValidationError>) {
    let uri = route.uri.trim();
    if uri.is_empty() {
        errors.push(ValidationError::EmptyUri(route.id.clone()));
        return;
    }

    if uri == STATIC_SCHEME {
        if let Some(response) = &route.response {
            if StatusCode::from_u16(response.status).is_err() {
                errors.push(ValidationError::InvalidStatus {
                    route: route.id.clone(),
                    status: response.status,
                });
            }
            if let Some(content_type) = &response.content_type {
                if HeaderValue::from_str(content_type).is_err() {
                    errors.push(ValidationError::InvalidHeader {
                        route: route.id.clone(),
                        name: "content-type".to_string(),
                    });
                }
            }
        }
        return;
    }

    if route.response.is_some() {
        errors.push(ValidationError::UnexpectedResponse(route.id.clone()));
    }

    let invalid = |reason: &str| ValidationError::InvalidUri {
        route: route.id.clone(),
        uri: route.uri.clone(),
        reason: reason.to_string(),
    };

    match Url::parse(uri) {
        Ok(url) if url.scheme() != "http" => errors.push(invalid("only http upstreams are supported")),
        Ok(url) if url.host_str().is_none() => errors.push(invalid("missing host")),
        Ok(url) if url.query().is_some() || url.fragment().is_some() => {
            errors.push(invalid("query and fragment are not allowed"))
        }
        Ok(_) => {}
        Err(e) => errors.push(invalid(&e.to_string())),
    }
}

fn validate_filters(
    config: &ProxyConfig,
    route: &RouteConfig,
    routes_by_id: &HashMap<&str, &RouteConfig>,
    errors: &mut Vec<ValidationError>,
) {
    let mut breakers = 0;

    for filter in &route.filters {
        match filter {
            FilterConfig::AddRequestHeader { name, value } => {
                if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
                    errors.push(ValidationError::InvalidHeader {
                        route: route.id.clone(),
                        name: name.clone(),
                    });
                }
            }
            FilterConfig::RateLimit {
                replenish_rate,
                burst_capacity,
                requested_tokens,
                key_resolver,
            } => {
                let reason = if burst_capacity < replenish_rate {
                    Some(format!(
                        "burst_capacity ({}) must be >= replenish_rate ({})",
                        burst_capacity, replenish_rate
                    ))
                } else if *requested_tokens == 0 {
                    Some("requested_tokens must be >= 1".to_string())
                } else if *replenish_rate > 0 && requested_tokens > burst_capacity {
                    Some(format!(
                        "requested_tokens ({}) exceeds burst_capacity ({})",
                        requested_tokens, burst_capacity
                    ))
                } else {
                    None
                };
                if let Some(reason) = reason {
                    errors.push(ValidationError::InvalidRateLimit {
                        route: route.id.clone(),
                        reason,
                    });
                }

                if let Some(resolver) = key_resolver {
                    if !config.key_resolvers.contains_key(resolver) {
                        errors.push(ValidationError::UnknownKeyResolver {
                            route: route.id.clone(),
                            resolver: resolver.clone(),
                        });
                    }
                }
            }
            FilterConfig::CircuitBreaker(breaker) => {
                breakers += 1;

                let reason = if breaker.timeout_ms == 0 {
                    Some("timeout_ms must be >= 1")
                } else if breaker.failure_threshold == 0 {
                    Some("failure_threshold must be >= 1")
                } else if breaker.half_open_max_calls == 0 {
                    Some("half_open_max_calls must be >= 1")
                } else if breaker.success_threshold == 0 {
                    Some("success_threshold must be >= 1")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    errors.push(ValidationError::InvalidCircuitBreaker {
                        route: route.id.clone(),
                        reason: reason.to_string(),
                    });
                }

                if let Some(fallback) = &breaker.fallback {
                    match routes_by_id.get(fallback.as_str()) {
                        None => errors.push(ValidationError::UnknownFallback {
                            route: route.id.clone(),
                            fallback: fallback.clone(),
                        }),
                        Some(target) => {
                            let guarded = target.id == route.id
                                || target
                                    .filters
                                    .iter()
                                    .any(|f| matches!(f, FilterConfig::CircuitBreaker(_)));
                            if guarded {
                                errors.push(ValidationError::GuardedFallback {
                                    route: route.id.clone(),
                                    fallback: fallback.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    if breakers > 1 {
        errors.push(ValidationError::MultipleCircuitBreakers(route.id.clone()));
    }
}
