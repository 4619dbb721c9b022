//! Password hashing and verification

use bcrypt::{hash, verify, DEFAULT_COST};

use crate::error::{Error, Result};

/// Bcrypt cost used for new accounts
pub const BCRYPT_COST: u32 = DEFAULT_COST;

/// Maximum password length (bcrypt has a 72-byte limit)
pub const MAX_PASSWORD_LENGTH: usize = 72;

/// Hash a password on the blocking pool.
pub async fn hash_password(password: &str, cost: u32) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        hash(password, cost).map_err(|e| Error::Upstream(e.to_string()))
    })
    .await
    .map_err(|e| Error::Upstream(format!("Task join error: {}", e)))?
}

/// Verify a password against a bcrypt hash on the blocking pool.
///
/// A hash that cannot be parsed counts as a mismatch.
pub async fn verify_password(password: &str, hashed: &str) -> Result<bool> {
    let password = password.to_string();
    let hashed = hashed.to_string();
    tokio::task::spawn_blocking(move || verify(password, &hashed).unwrap_or(false))
        .await
        .map_err(|e| Error::Upstream(format!("Task join error: {}", e)))
}
