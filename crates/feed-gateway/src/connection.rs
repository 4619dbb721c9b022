//! Feed Connection types

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default number of payloads queued per connection before writes start timing out
pub const DEFAULT_SEND_QUEUE: usize = 16;

/// Metadata about a connection
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// When the connection was established
    pub connected_at: chrono::DateTime<chrono::Utc>,
    /// Peer address (if available)
    pub remote_addr: Option<SocketAddr>,
    /// Authenticated subject (token email), if the upgrade carried a token
    pub subject: Option<String>,
    /// User agent (if available)
    pub user_agent: Option<String>,
}

/// One client's realtime session
///
/// Payloads written here are queued and drained onto the socket by the
/// connection's own task. Clones share the queue and the close signal.
#[derive(Debug, Clone)]
pub struct FeedConnection {
    /// Unique connection ID
    pub id: String,
    sender: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    /// Connection metadata
    pub metadata: ConnectionMetadata,
}

impl FeedConnection {
    /// Create a new connection with the default queue size
    pub fn new(
        remote_addr: Option<SocketAddr>,
        subject: Option<String>,
        user_agent: Option<String>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_capacity(DEFAULT_SEND_QUEUE, remote_addr, subject, user_agent)
    }

    pub fn with_capacity(
        capacity: usize,
        remote_addr: Option<SocketAddr>,
        subject: Option<String>,
        user_agent: Option<String>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            closed: CancellationToken::new(),
            metadata: ConnectionMetadata {
                connected_at: chrono::Utc::now(),
                remote_addr,
                subject,
                user_agent,
            },
        };
        (connection, receiver)
    }

    /// Check if the connection is still open on both ends
    pub fn is_active(&self) -> bool {
        !self.closed.is_cancelled() && !self.sender.is_closed()
    }

    /// Queue a payload for this connection.
    ///
    /// Fails with `Error::Transport` if the connection is closed or its queue
    /// stays full for longer than `timeout`.
    pub async fn write(&self, data: Bytes, timeout: Duration) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Transport("connection closed".to_string()));
        }
        self.sender
            .send_timeout(data, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => Error::Transport("write timed out".to_string()),
                SendTimeoutError::Closed(_) => Error::Transport("connection closed".to_string()),
            })
    }

    /// Signal the socket task to close the stream
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` has been called on any clone
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn write_reaches_receiver() {
        let (conn, mut rx) = FeedConnection::new(None, Some("bob@test.com".into()), None);
        assert!(conn.is_active());

        conn.write(Bytes::from_static(b"hello"), TIMEOUT).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(conn.metadata.subject.as_deref(), Some("bob@test.com"));
    }

    #[tokio::test]
    async fn write_after_receiver_dropped_is_transport_error() {
        let (conn, rx) = FeedConnection::new(None, None, None);
        drop(rx);

        assert!(!conn.is_active());
        let err = conn.write(Bytes::from_static(b"x"), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn full_queue_times_out() {
        let (conn, _rx) = FeedConnection::with_capacity(1, None, None, None);
        conn.write(Bytes::from_static(b"1"), TIMEOUT).await.unwrap();

        let err = conn.write(Bytes::from_static(b"2"), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Transport(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn close_is_shared_between_clones() {
        let (conn, _rx) = FeedConnection::new(None, None, None);
        let other = conn.clone();

        conn.close();
        other.closed().await;
        assert!(other.is_closed());
        assert!(other.write(Bytes::from_static(b"x"), TIMEOUT).await.is_err());
    }
}
