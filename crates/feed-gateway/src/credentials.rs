//! Credential Store trait and implementations
//!
//! Implement `CredentialStore` to keep accounts in any backend. Passwords are
//! always stored as bcrypt hashes.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AuthError, Error, Result};
use crate::password::{hash_password, verify_password, BCRYPT_COST, MAX_PASSWORD_LENGTH};

/// An account holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self { email: email.into() }
    }
}

/// Email/password pair as submitted to login and signup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Check that both fields are present and usable
    pub fn validate(&self) -> Result<()> {
        let email = self.email.trim();
        if email.is_empty() || self.password.is_empty() {
            return Err(Error::Validation("missing credentials".to_string()));
        }
        if !email.contains('@') {
            return Err(Error::Validation("invalid email".to_string()));
        }
        if self.password.len() > MAX_PASSWORD_LENGTH {
            return Err(Error::Validation(format!(
                "password must be at most {} bytes",
                MAX_PASSWORD_LENGTH
            )));
        }
        Ok(())
    }

    /// Email with surrounding whitespace removed, used as the account key
    pub fn email(&self) -> &str {
        self.email.trim()
    }
}

/// Trait for account storage
///
/// # Example
///
/// ```rust,ignore
/// use feed_gateway::{CredentialStore, User};
/// use async_trait::async_trait;
///
/// struct MyStore { db: Database }
///
/// #[async_trait]
/// impl CredentialStore for MyStore {
///     async fn verify(&self, email: &str, password: &str) -> feed_gateway::Result<User> { .. }
///     async fn create(&self, email: &str, password: &str) -> feed_gateway::Result<User> { .. }
///     fn name(&self) -> &'static str { "MyStore" }
/// }
/// ```
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Look up `email` and check `password` against the stored hash.
    ///
    /// Unknown users and wrong passwords both yield `AuthError::InvalidCredentials`.
    async fn verify(&self, email: &str, password: &str) -> Result<User>;

    /// Persist a new account. Fails with `AuthError::UserExists` on a taken email.
    async fn create(&self, email: &str, password: &str) -> Result<User>;

    /// Return the store name (for logging)
    fn name(&self) -> &'static str;
}

/// In-memory credential store
///
/// Suitable for development and testing.
#[derive(Clone)]
pub struct MemoryCredentialStore {
    users: Arc<DashMap<String, String>>,
    cost: u32,
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::with_cost(BCRYPT_COST)
    }
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a custom bcrypt cost (lower costs keep tests fast)
    pub fn with_cost(cost: u32) -> Self {
        Self {
            users: Arc::new(DashMap::new()),
            cost,
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn verify(&self, email: &str, password: &str) -> Result<User> {
        let hashed = self
            .users
            .get(email)
            .map(|h| h.value().clone())
            .ok_or(AuthError::InvalidCredentials)?;

        if verify_password(password, &hashed).await? {
            Ok(User::new(email))
        } else {
            Err(AuthError::InvalidCredentials.into())
        }
    }

    async fn create(&self, email: &str, password: &str) -> Result<User> {
        if self.users.contains_key(email) {
            return Err(AuthError::UserExists.into());
        }
        let hashed = hash_password(password, self.cost).await?;

        match self.users.entry(email.to_string()) {
            Entry::Occupied(_) => Err(AuthError::UserExists.into()),
            Entry::Vacant(slot) => {
                slot.insert(hashed);
                tracing::info!(email, "User created");
                Ok(User::new(email))
            }
        }
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
