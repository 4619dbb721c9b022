//! Feed payloads stored as Redis hashes

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use feed_gateway::{DataSource, Error, FeedPayload, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::{manager, open, timed, SharedManager, COMMAND_TIMEOUT};

/// Redis-backed feed source
///
/// Each feed lives in a hash at `feed:{id}` with a `data` field holding the
/// raw payload and an `updated_at` field (RFC 3339).
///
/// # Example
///
/// ```rust,ignore
/// use feed_gateway::Gateway;
/// use feed_gateway_redis::RedisDataSource;
///
/// let source = RedisDataSource::new();
/// source.connect("redis://localhost:6379").await?;
///
/// Gateway::builder()
///     .source(source)
///     .feed_id("LDRIFARMDATA")
///     .build()?
///     .run()
///     .await
/// ```
#[derive(Clone, Default)]
pub struct RedisDataSource {
    redis: SharedManager,
}

impl RedisDataSource {
    pub fn new() -> Self {
        Self {
            redis: Arc::new(RwLock::new(None)),
        }
    }

    /// Connect to Redis
    pub async fn connect(&self, redis_url: &str) -> anyhow::Result<()> {
        *self.redis.write().await = Some(open(redis_url).await?);
        info!("Redis data source connected");
        Ok(())
    }

    fn feed_key(feed_id: &str) -> String {
        format!("feed:{}", feed_id)
    }
}

#[async_trait]
impl DataSource for RedisDataSource {
    async fn fetch(&self, feed_id: &str) -> Result<FeedPayload> {
        let mut conn = manager(&self.redis).await?;
        let key = Self::feed_key(feed_id);

        let mut cmd = redis::cmd("HMGET");
        cmd.arg(&key).arg("data").arg("updated_at");
        let (data, updated_at) = timed(
            COMMAND_TIMEOUT,
            &format!("HMGET {}", key),
            cmd.query_async::<(Option<Vec<u8>>, Option<String>)>(&mut conn),
        )
        .await?;

        let data = data.ok_or_else(|| Error::Upstream(format!("feed {} not found", feed_id)))?;
        let updated_at = updated_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(FeedPayload {
            id: feed_id.to_string(),
            data: Bytes::from(data),
            updated_at,
        })
    }

    async fn store(&self, feed_id: &str, data: Bytes) -> Result<FeedPayload> {
        let mut conn = manager(&self.redis).await?;
        let key = Self::feed_key(feed_id);
        let payload = FeedPayload::new(feed_id, data);

        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key)
            .arg("data")
            .arg(&payload.data[..])
            .arg("updated_at")
            .arg(payload.updated_at.to_rfc3339());
        timed(
            COMMAND_TIMEOUT,
            &format!("HSET {}", key),
            cmd.query_async::<()>(&mut conn),
        )
        .await?;

        tracing::debug!(feed_id, bytes = payload.data.len(), "Feed payload stored");
        Ok(payload)
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
