//! Authentication gate for Feed Gateway
//!
//! Realtime upgrades and protected HTTP routes present a token either in the
//! `Authorization: Bearer` header or, for clients that cannot set headers on a
//! WebSocket handshake, in the `token` query parameter.

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

use crate::error::AuthError;
use crate::token::{bearer_token, Claims, TokenService};

/// Request context used to authenticate a caller
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// HTTP method (GET for upgrades)
    pub method: Method,
    /// Full request URI (path + query string)
    pub uri: Uri,
    /// HTTP headers from the request
    pub headers: HeaderMap,
    /// Client IP address (from X-Forwarded-For or direct connection)
    pub client_ip: Option<String>,
}

impl AuthRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let client_ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .or_else(|| remote_addr.map(|addr| addr.ip().to_string()));

        Self {
            method,
            uri,
            headers,
            client_ip,
        }
    }

    /// Get a header value as string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the request path
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get a query parameter value by name
    ///
    /// Note: This is a simple implementation that doesn't handle URL decoding.
    /// JWTs only use URL-safe characters, so tokens pass through unchanged.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.uri.query().and_then(|query| {
            query.split('&').find_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next()?;
                let value = parts.next()?;
                if key == name { Some(value) } else { None }
            })
        })
    }

    /// The presented token.
    ///
    /// An `Authorization` header wins and must use the Bearer scheme; otherwise
    /// the `token` query parameter is used.
    pub fn token(&self) -> Result<&str, AuthError> {
        if let Some(header) = self.header("authorization") {
            return bearer_token(Some(header));
        }
        match self.query_param("token") {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(AuthError::MissingToken),
        }
    }

    /// Validate the presented token
    pub fn authenticate(&self, tokens: &TokenService) -> Result<Claims, AuthError> {
        tokens.validate(self.token()?)
    }
}

/// Helper to create the `401` response for a failed authentication
pub fn deny(err: &AuthError) -> Response {
    deny_json(
        StatusCode::UNAUTHORIZED,
        serde_json::json!({ "error": err.to_string() }),
    )
}

/// Helper to create a JSON error response
pub fn deny_json(status: StatusCode, body: impl serde::Serialize) -> Response {
    (status, axum::Json(body)).into_response()
}
