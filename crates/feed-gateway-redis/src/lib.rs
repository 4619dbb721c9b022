//! Redis adapters for Feed Gateway
//!
//! This crate provides:
//! - `RedisDataSource`: Poll feed payloads stored in Redis hashes
//! - `RedisCredentialStore`: Keep bcrypt-hashed accounts in Redis

mod credentials;
mod source;

pub use credentials::RedisCredentialStore;
pub use source::RedisDataSource;

use feed_gateway::{Error, Result};
use redis::aio::ConnectionManager;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Upper bound on a single Redis command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

type SharedManager = Arc<RwLock<Option<ConnectionManager>>>;

/// Open a connection manager for `redis_url`
async fn open(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Clone the manager out of the lock, failing when `connect` was never called
async fn manager(redis: &SharedManager) -> Result<ConnectionManager> {
    redis
        .read()
        .await
        .clone()
        .ok_or_else(|| Error::Upstream("redis not connected".to_string()))
}

/// Await a Redis command, mapping timeouts and failures to `Error::Upstream`
async fn timed<T>(
    timeout: Duration,
    what: &str,
    command: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, command)
        .await
        .map_err(|_| Error::Upstream(format!("{} timed out", what)))?
        .map_err(Error::upstream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hung_command_times_out() {
        let hung = std::future::pending::<redis::RedisResult<()>>();
        let result = timed(Duration::from_millis(20), "GET user:bob", hung).await;
        match result {
            Err(Error::Upstream(msg)) => assert_eq!(msg, "GET user:bob timed out"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn command_result_passes_through() {
        let ok = async { Ok::<_, redis::RedisError>(7) };
        assert_eq!(timed(COMMAND_TIMEOUT, "GET", ok).await.unwrap(), 7);
    }
}
