//! Custom error types for the speech-rpc-gateway.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages and proper error conversion
//! into both gRPC statuses (proxy listeners) and HTTP responses (admin surface).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;
use tonic::{Code, Status};

use crate::pool::EngineFamily;

/// Reasons a call could not be routed to a backend lease.
///
/// None of these consume a lease.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// The method lives under the reserved internal prefix.
    #[error("invalid or unsupported method: {0}")]
    ReservedMethod(String),

    /// The `:authority` did not match any engine family listener.
    #[error("unknown method")]
    UnknownAuthority,

    /// Identity routing is active but no `token` metadata was sent.
    #[error("unknown engine pool: missing routing token")]
    MissingToken,

    /// The token was not valid base64 / UTF-8.
    #[error("token decode failed")]
    TokenDecode,

    /// The decoded token has fewer than two `-` separated segments.
    #[error("unknown engine token")]
    MalformedToken,

    /// No per-instance pool is registered under the token's identifier.
    #[error("unknown engine pool: {0}")]
    UnknownPool(String),

    /// No tenant pool is registered under the token's identifier.
    #[error("unknown tenant pool: {0}")]
    UnknownTenant(String),

    /// Every candidate pool of the family is down (or there are none).
    #[error("no healthy {0} pool available")]
    NoHealthyPool(EngineFamily),
}

/// Primary error type for the gateway, covering all possible error cases.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or missing configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Establishing a backend channel failed.
    #[error("Dial error for {address}: {reason}")]
    Dial { address: String, reason: String },

    /// Tenant reservation could not be satisfied from the family's pools.
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// The pool (or tenant pool) has been closed.
    #[error("Pool {0} is closed")]
    PoolClosed(String),

    /// No lease became available before the deadline.
    #[error("Timed out acquiring a connection from pool {0}")]
    AcquireTimeout(String),

    /// A call could not be routed.
    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    /// The orchestration layer could not list instances.
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// Invalid input from the management surface.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A named resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal server errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results with ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<RouteError> for Status {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoHealthyPool(_) => Status::unavailable(err.to_string()),
            _ => Status::unimplemented(err.to_string()),
        }
    }
}

impl From<ProxyError> for Status {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Route(route) => route.into(),
            ProxyError::AcquireTimeout(_) => Status::new(Code::DeadlineExceeded, err.to_string()),
            ProxyError::PoolClosed(_) | ProxyError::Dial { .. } | ProxyError::Allocation(_) => {
                Status::unavailable(err.to_string())
            }
            _ => Status::internal(err.to_string()),
        }
    }
}

/// Implementation to convert ProxyError into an HTTP response for Axum.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Route(_) => StatusCode::BAD_REQUEST,
            ProxyError::Dial { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Orchestration(_) => StatusCode::BAD_GATEWAY,
            ProxyError::AcquireTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            ProxyError::PoolClosed(_) | ProxyError::Allocation(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_errors_map_to_grpc_codes() {
        let status: Status = RouteError::MalformedToken.into();
        assert_eq!(status.code(), Code::Unimplemented);

        let status: Status = RouteError::NoHealthyPool(EngineFamily::Tts).into();
        assert_eq!(status.code(), Code::Unavailable);

        let status: Status = ProxyError::AcquireTimeout("p1".to_string()).into();
        assert_eq!(status.code(), Code::DeadlineExceeded);

        let status: Status = ProxyError::Route(RouteError::UnknownAuthority).into();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "unknown method");
    }

    #[test]
    fn test_http_status_mapping() {
        let response = ProxyError::NotFound("pool".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ProxyError::Validation("capacity".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
