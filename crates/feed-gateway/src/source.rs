//! Data Source trait and implementations
//!
//! Implement `DataSource` to poll feed payloads from any backend.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// The current value of one named feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPayload {
    /// Feed identifier
    pub id: String,
    /// Opaque payload bytes, delivered to clients as-is
    pub data: Bytes,
    /// When this value was produced or stored
    pub updated_at: DateTime<Utc>,
}

impl FeedPayload {
    pub fn new(id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the payload bytes equal `other`'s, ignoring timestamps
    pub fn same_data(&self, other: &FeedPayload) -> bool {
        self.data == other.data
    }
}

/// Trait for feed data sources
///
/// # Example
///
/// ```rust,ignore
/// use feed_gateway::{DataSource, FeedPayload};
/// use async_trait::async_trait;
///
/// struct HttpSource { url: String }
///
/// #[async_trait]
/// impl DataSource for HttpSource {
///     async fn fetch(&self, feed_id: &str) -> feed_gateway::Result<FeedPayload> {
///         let body = download(&self.url).await?;
///         Ok(FeedPayload::new(feed_id, body))
///     }
///
///     async fn store(
///         &self,
///         feed_id: &str,
///         data: bytes::Bytes,
///     ) -> feed_gateway::Result<FeedPayload> {
///         Ok(FeedPayload::new(feed_id, data))
///     }
///
///     fn name(&self) -> &'static str { "Http" }
/// }
/// ```
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// Fetch the latest payload for `feed_id`.
    ///
    /// Return `Error::Upstream` when the feed is missing or the backend fails.
    async fn fetch(&self, feed_id: &str) -> Result<FeedPayload>;

    /// Record `data` as the current payload for `feed_id`, replacing any previous value.
    async fn store(&self, feed_id: &str, data: Bytes) -> Result<FeedPayload>;

    /// Return the source name (for logging)
    fn name(&self) -> &'static str;
}

/// In-memory data source
///
/// Suitable for development and testing. `set` stands in for the upstream
/// producing a new value.
#[derive(Clone, Default)]
pub struct MemorySource {
    feeds: Arc<DashMap<String, FeedPayload>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current value of a feed
    pub fn set(&self, feed_id: &str, data: impl Into<Bytes>) {
        self.feeds
            .insert(feed_id.to_string(), FeedPayload::new(feed_id, data));
    }

    pub fn get(&self, feed_id: &str) -> Option<FeedPayload> {
        self.feeds.get(feed_id).map(|p| p.value().clone())
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn fetch(&self, feed_id: &str) -> Result<FeedPayload> {
        self.get(feed_id)
            .ok_or_else(|| Error::Upstream(format!("feed {} not found", feed_id)))
    }

    async fn store(&self, feed_id: &str, data: Bytes) -> Result<FeedPayload> {
        let payload = FeedPayload::new(feed_id, data);
        self.feeds.insert(feed_id.to_string(), payload.clone());
        Ok(payload)
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
