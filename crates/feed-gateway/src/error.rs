//! Error types for Feed Gateway

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a caller is not authenticated.
///
/// Kept distinct so the HTTP layer can report a precise reason; every variant
/// is answered with `401 Unauthorized`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    /// Authorization header present but not `Bearer <token>`
    #[error("invalid authorization header")]
    MalformedScheme,

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token has expired")]
    ExpiredToken,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user already exists")]
    UserExists,
}

/// Errors that can occur in Feed Gateway
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed request fields
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bad credentials or an unusable token
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthError),

    /// Token signing failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Credential store or data source unreachable or failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Read/write failure on a realtime connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Missing or invalid startup configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Error::Upstream(err.to_string())
    }

    /// Whether this error means the caller is not authenticated
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }
}

#[cfg(feature = "server")]
mod response {
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::Json;

    use super::Error;

    impl Error {
        /// HTTP status used when this error reaches a request boundary
        pub fn status_code(&self) -> StatusCode {
            match self {
                Error::Validation(_) => StatusCode::BAD_REQUEST,
                Error::Authentication(_) => StatusCode::UNAUTHORIZED,
                Error::Signing(_)
                | Error::Upstream(_)
                | Error::Transport(_)
                | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        }

        /// Message exposed to HTTP clients
        pub fn public_message(&self) -> String {
            match self {
                Error::Validation(msg) => msg.clone(),
                Error::Authentication(err) => err.to_string(),
                _ => "internal server error".to_string(),
            }
        }
    }

    impl IntoResponse for Error {
        fn into_response(self) -> Response {
            let status = self.status_code();
            if status.is_server_error() {
                tracing::error!(error = %self, "Request failed");
            }
            (status, Json(serde_json::json!({ "error": self.public_message() }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_convert() {
        let err: Error = AuthError::ExpiredToken.into();
        assert!(err.is_auth());
        assert_eq!(err.to_string(), "Authentication error: token has expired");
    }

    #[cfg(feature = "server")]
    #[test]
    fn status_codes() {
        use axum::http::StatusCode;

        assert_eq!(Error::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::from(AuthError::InvalidSignature).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::upstream("redis down").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(Error::upstream("redis down").public_message(), "internal server error");
    }
}
