//! Signed, expiring identity tokens
//!
//! Tokens are HS256 JWTs. Nothing is stored server-side: a token is valid iff
//! its signature verifies against the process secret and `now < exp`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::credentials::User;
use crate::error::{AuthError, Error, Result};

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3 * 60 * 60);

const BEARER_PREFIX: &str = "Bearer ";

/// Claims carried by every token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user email)
    pub sub: String,
    pub admin: bool,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expires at (unix seconds)
    pub exp: i64,
}

impl Claims {
    pub fn email(&self) -> &str {
        &self.sub
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.iat, 0)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// A token is live strictly before its expiry second
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }
}

/// Issues and validates tokens with a process-wide secret
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: chrono::Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("ttl_secs", &self.ttl.num_seconds())
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Create a token service with the default 3 hour lifetime
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        Self::with_ttl(secret, DEFAULT_TOKEN_TTL)
    }

    pub fn with_ttl(secret: impl AsRef<[u8]>, ttl: Duration) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::Config("token signing secret is empty".to_string()));
        }
        if ttl.is_zero() {
            return Err(Error::Config("token ttl must be positive".to_string()));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("invalid token ttl: {}", e)))?;

        // Expiry is checked against an explicit clock in `validate_at`
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        })
    }

    /// Token lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl.to_std().unwrap_or_default()
    }

    /// Issue a token for `user`
    pub fn issue(&self, user: &User) -> Result<String> {
        self.issue_at(user, Utc::now())
    }

    /// Issue a token for `user` as if the current time were `now`
    pub fn issue_at(&self, user: &User, now: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            sub: user.email.clone(),
            admin: true,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Signing(e.to_string()))
    }

    /// Validate a raw token (no scheme prefix)
    pub fn validate(&self, token: &str) -> std::result::Result<Claims, AuthError> {
        self.validate_at(token, Utc::now())
    }

    /// Validate a raw token as if the current time were `now`
    pub fn validate_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::MalformedToken(e.to_string()),
            }
        })?;

        if data.claims.is_expired_at(now) {
            return Err(AuthError::ExpiredToken);
        }
        Ok(data.claims)
    }

    /// Validate an `Authorization` header value of the form `Bearer <token>`
    pub fn validate_bearer(&self, header: Option<&str>) -> std::result::Result<Claims, AuthError> {
        let token = bearer_token(header)?;
        self.validate(token)
    }
}

/// Extract the token from an `Authorization` header value
pub fn bearer_token(header: Option<&str>) -> std::result::Result<&str, AuthError> {
    let header = header.map(str::trim).filter(|h| !h.is_empty());
    let Some(header) = header else {
        return Err(AuthError::MissingToken);
    };
    match header.strip_prefix(BEARER_PREFIX) {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::MalformedScheme),
    }
}
