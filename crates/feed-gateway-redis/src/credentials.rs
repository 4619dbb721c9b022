//! Accounts stored in Redis, one key per user

use async_trait::async_trait;
use feed_gateway::password::{hash_password, verify_password, BCRYPT_COST};
use feed_gateway::{AuthError, CredentialStore, Error, Result, User};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::{manager, open, timed, SharedManager, COMMAND_TIMEOUT};

/// Redis-backed credential store
///
/// The bcrypt hash for each account is kept at `user:{email}`. Creation uses
/// `SET NX` so concurrent sign-ups for one email cannot both succeed.
#[derive(Clone)]
pub struct RedisCredentialStore {
    redis: SharedManager,
    cost: u32,
}

impl Default for RedisCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RedisCredentialStore {
    pub fn new() -> Self {
        Self::with_cost(BCRYPT_COST)
    }

    /// Create with a custom bcrypt cost
    pub fn with_cost(cost: u32) -> Self {
        Self {
            redis: Arc::new(RwLock::new(None)),
            cost,
        }
    }

    /// Connect to Redis
    pub async fn connect(&self, redis_url: &str) -> anyhow::Result<()> {
        *self.redis.write().await = Some(open(redis_url).await?);
        info!("Redis credential store connected");
        Ok(())
    }

    fn user_key(email: &str) -> String {
        format!("user:{}", email)
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn verify(&self, email: &str, password: &str) -> Result<User> {
        let mut conn = manager(&self.redis).await?;

        let key = Self::user_key(email);
        let mut cmd = redis::cmd("GET");
        cmd.arg(&key);
        let hashed = timed(
            COMMAND_TIMEOUT,
            &format!("GET {}", key),
            cmd.query_async::<Option<String>>(&mut conn),
        )
        .await?;
        let hashed = hashed.ok_or(AuthError::InvalidCredentials)?;

        if verify_password(password, &hashed).await? {
            Ok(User::new(email))
        } else {
            Err(AuthError::InvalidCredentials.into())
        }
    }

    async fn create(&self, email: &str, password: &str) -> Result<User> {
        let mut conn = manager(&self.redis).await?;
        let hashed = hash_password(password, self.cost).await?;

        let key = Self::user_key(email);
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(&hashed).arg("NX");
        let created = timed(
            COMMAND_TIMEOUT,
            &format!("SET {}", key),
            cmd.query_async::<Option<String>>(&mut conn),
        )
        .await?;

        match created {
            Some(_) => {
                info!(email, "User created");
                Ok(User::new(email))
            }
            None => Err(AuthError::UserExists.into()),
        }
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_format() {
        assert_eq!(RedisCredentialStore::user_key("bob@test.com"), "user:bob@test.com");
    }

    #[tokio::test]
    async fn unconnected_store_reports_upstream_error() {
        let store = RedisCredentialStore::with_cost(4);
        assert!(matches!(
            store.verify("bob@test.com", "password").await,
            Err(Error::Upstream(_))
        ));
    }
}
