//! Gateway builder and runner

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::broadcaster::{
    BroadcastPolicy, Broadcaster, BroadcasterConfig, DEFAULT_POLL_INTERVAL, DEFAULT_WRITE_TIMEOUT,
};
use crate::connection::DEFAULT_SEND_QUEUE;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::handler::{self, GatewayState};
use crate::registry::ConnectionRegistry;
use crate::source::DataSource;
use crate::token::TokenService;

/// Gateway configuration and runner
///
/// Serves two listeners: the HTTP API (login, signup, token validation) and
/// the realtime feed endpoint. Exactly one broadcaster loop runs per gateway.
pub struct Gateway {
    http_port: u16,
    feed_port: u16,
    cleanup_interval: Duration,
    state: GatewayState,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.state.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.state.broadcaster
    }

    pub fn tokens(&self) -> &TokenService {
        &self.state.tokens
    }

    /// Router for the HTTP API
    pub fn http_router(&self) -> Router {
        Router::new()
            .route("/health", get(handler::health))
            .route("/login", post(handler::login))
            .route("/signup", post(handler::signup))
            .route("/validate", post(handler::validate))
            .route("/data", get(handler::data))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Router for the realtime feed
    pub fn feed_router(&self) -> Router {
        Router::new()
            .route("/", get(handler::feed_connect))
            .route("/feed", get(handler::feed_connect))
            .route("/health", get(handler::health))
            .route("/stats", get(handler::get_stats))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Run the gateway on the configured ports until SIGINT/SIGTERM
    pub async fn run(self) -> anyhow::Result<()> {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let feed_addr = SocketAddr::from(([0, 0, 0, 0], self.feed_port));

        let http_listener = TcpListener::bind(http_addr).await?;
        let feed_listener = TcpListener::bind(feed_addr).await?;

        let shutdown = CancellationToken::new();
        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_shutdown.cancel();
        });

        self.serve(http_listener, feed_listener, shutdown).await
    }

    /// Serve on already-bound listeners until `shutdown` is cancelled.
    ///
    /// On shutdown the broadcaster is stopped and every feed connection is
    /// closed before this returns.
    pub async fn serve(
        self,
        http_listener: TcpListener,
        feed_listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!(
            http_addr = %http_listener.local_addr()?,
            feed_addr = %feed_listener.local_addr()?,
            feed_id = %self.state.broadcaster.feed_id(),
            credentials = self.state.credentials.name(),
            require_auth = self.state.require_auth,
            "Starting Feed Gateway"
        );

        let tasks = CancellationToken::new();

        // Start the broadcaster
        let broadcaster_handle = self.state.broadcaster.start(tasks.clone());

        // Start cleanup task
        let cleanup_registry = self.state.registry.clone();
        let cleanup_cancel = tasks.clone();
        let cleanup_interval = self.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = cleanup_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let cleaned = cleanup_registry.cleanup_dead_connections();
                        tracing::debug!(
                            connections = cleanup_registry.connection_count(),
                            cleaned,
                            "Connection cleanup"
                        );
                    }
                }
            }
        });

        // Feed sockets are detached from the HTTP server once upgraded, so
        // they are closed explicitly when shutdown starts
        let stop_registry = self.state.registry.clone();
        let stop_tasks = tasks.clone();
        let stop_shutdown = shutdown.clone();
        tokio::spawn(async move {
            stop_shutdown.cancelled().await;
            stop_tasks.cancel();
            stop_registry.close_all();
        });

        let http_app = self.http_router();
        let feed_app = self.feed_router();

        let http_server = axum::serve(http_listener, http_app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let feed_server = axum::serve(
            feed_listener,
            feed_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

        let result = tokio::try_join!(
            async { http_server.await },
            async { feed_server.await },
        );

        // A server error ends the other one too
        shutdown.cancel();
        tasks.cancel();
        if let Err(e) = broadcaster_handle.await {
            tracing::warn!(error = %e, "Broadcaster task failed");
        }
        let _ = cleanup_handle.await;
        self.state.registry.close_all();

        result?;
        tracing::info!("Gateway shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Builder for Gateway
pub struct GatewayBuilder {
    http_port: u16,
    feed_port: u16,
    source: Option<Arc<dyn DataSource>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    tokens: Option<TokenService>,
    feed_id: Option<String>,
    poll_interval: Duration,
    policy: BroadcastPolicy,
    write_timeout: Duration,
    cleanup_interval: Duration,
    send_queue: usize,
    require_auth: bool,
    replay_latest: bool,
    close_on_expiry: bool,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            http_port: 3000,
            feed_port: 8080,
            source: None,
            credentials: None,
            tokens: None,
            feed_id: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            policy: BroadcastPolicy::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            cleanup_interval: Duration::from_secs(30),
            send_queue: DEFAULT_SEND_QUEUE,
            require_auth: true,
            replay_latest: true,
            close_on_expiry: false,
        }
    }
}

impl GatewayBuilder {
    /// Set the HTTP API port
    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the realtime feed port
    pub fn feed_port(mut self, port: u16) -> Self {
        self.feed_port = port;
        self
    }

    /// Set the upstream data source
    pub fn source<S: DataSource>(mut self, source: S) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Set the credential store
    pub fn credentials<C: CredentialStore>(mut self, credentials: C) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    /// Set the token service
    pub fn tokens(mut self, tokens: TokenService) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Set the feed identifier to poll and broadcast
    pub fn feed_id(mut self, feed_id: impl Into<String>) -> Self {
        self.feed_id = Some(feed_id.into());
        self
    }

    /// Set the broadcast interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn policy(mut self, policy: BroadcastPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the per-connection write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set how many payloads may be queued per connection
    pub fn send_queue(mut self, size: usize) -> Self {
        self.send_queue = size;
        self
    }

    /// Require a valid token on feed upgrades
    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    /// Send the last broadcast payload to newly admitted connections
    pub fn replay_latest(mut self, replay: bool) -> Self {
        self.replay_latest = replay;
        self
    }

    /// Close authenticated feed connections once their token expires
    pub fn close_on_expiry(mut self, close: bool) -> Self {
        self.close_on_expiry = close;
        self
    }

    /// Build the gateway
    pub fn build(self) -> Result<Gateway> {
        let source = self
            .source
            .ok_or_else(|| Error::Config("data source is required".to_string()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| Error::Config("credential store is required".to_string()))?;
        let tokens = self
            .tokens
            .ok_or_else(|| Error::Config("token service is required".to_string()))?;
        let feed_id = self
            .feed_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::Config("feed id is required".to_string()))?;
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(Error::Config("cleanup interval must be positive".to_string()));
        }

        if self.require_auth {
            tracing::info!("Authentication enabled for feed connections");
        }

        let registry = ConnectionRegistry::new();
        let broadcaster = Broadcaster::new(
            source,
            registry.clone(),
            BroadcasterConfig {
                feed_id,
                interval: self.poll_interval,
                policy: self.policy,
                write_timeout: self.write_timeout,
            },
        );

        Ok(Gateway {
            http_port: self.http_port,
            feed_port: self.feed_port,
            cleanup_interval: self.cleanup_interval,
            state: GatewayState {
                registry,
                broadcaster,
                credentials,
                tokens,
                require_auth: self.require_auth,
                replay_latest: self.replay_latest,
                close_on_expiry: self.close_on_expiry,
                send_queue: self.send_queue,
            },
        })
    }
}
