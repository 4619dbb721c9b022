//! # Feed Gateway
//!
//! A token-gated realtime broadcast gateway. A single broadcaster polls an
//! upstream feed on an interval and fans every new payload out to all open
//! WebSocket connections. Clients log in over HTTP to obtain a signed token
//! and present it when opening the feed.
//!
//! ## Features
//!
//! - **Pluggable Data Sources**: Implement `DataSource` to poll any backend
//! - **Pluggable Credential Stores**: Implement `CredentialStore`; passwords are bcrypt-hashed
//! - **Stateless Tokens**: HS256 JWTs with a fixed lifetime, validated without server-side state
//! - **Change Detection**: Only new payloads are broadcast (configurable)
//! - **Failure Isolation**: A failing connection is dropped without affecting the others
//! - **Built-in Server**: Optional Axum-based HTTP API and WebSocket feed endpoint
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use feed_gateway::{Gateway, MemoryCredentialStore, MemorySource, TokenService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = MemorySource::new();
//!     source.set("farm-data", "name,age");
//!
//!     Gateway::builder()
//!         .http_port(3000)
//!         .feed_port(8080)
//!         .feed_id("farm-data")
//!         .source(source)
//!         .credentials(MemoryCredentialStore::default())
//!         .tokens(TokenService::new("change-me")?)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## Custom Data Source
//!
//! ```rust,ignore
//! use feed_gateway::{async_trait, DataSource, FeedPayload, Result};
//!
//! struct ApiSource { url: String }
//!
//! #[async_trait]
//! impl DataSource for ApiSource {
//!     async fn fetch(&self, feed_id: &str) -> Result<FeedPayload> { .. }
//!     async fn store(&self, feed_id: &str, data: bytes::Bytes) -> Result<FeedPayload> { .. }
//!     fn name(&self) -> &'static str { "Api" }
//! }
//! ```

pub mod broadcaster;
mod connection;
pub mod credentials;
mod error;
pub mod password;
mod registry;
pub mod source;
pub mod token;

#[cfg(feature = "server")]
pub mod auth;
#[cfg(feature = "server")]
mod gateway;
#[cfg(feature = "server")]
pub mod handler;

// Re-exports
pub use broadcaster::{
    BroadcastPolicy, Broadcaster, BroadcasterConfig, BroadcasterState, CycleOutcome, CycleReport,
};
pub use connection::{ConnectionMetadata, FeedConnection};
pub use credentials::{CredentialStore, Credentials, MemoryCredentialStore, User};
pub use error::{AuthError, Error, Result};
pub use registry::ConnectionRegistry;
pub use source::{DataSource, FeedPayload, MemorySource};
pub use token::{Claims, TokenService};

#[cfg(feature = "server")]
pub use gateway::{Gateway, GatewayBuilder};

// Re-export commonly used types from dependencies
pub use async_trait::async_trait;
pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
