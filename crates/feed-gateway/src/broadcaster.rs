//! Periodic feed broadcaster
//!
//! Every tick the broadcaster fetches the configured feed, skips it when
//! nothing changed (under [`BroadcastPolicy::OnChange`]), stores it back and
//! fans it out to every registered connection. Cycles never overlap.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::FeedConnection;
use crate::error::{Error, Result};
use crate::registry::ConnectionRegistry;
use crate::source::{DataSource, FeedPayload};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// When a fetched payload is fanned out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Only when the fetched bytes differ from the last broadcast
    #[default]
    OnChange,
    /// Every tick, even if nothing changed
    Always,
}

impl FromStr for BroadcastPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_change" | "on-change" | "onchange" => Ok(Self::OnChange),
            "always" => Ok(Self::Always),
            other => Err(Error::Config(format!("unknown broadcast policy: {}", other))),
        }
    }
}

/// Broadcaster settings
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub feed_id: String,
    pub interval: Duration,
    pub policy: BroadcastPolicy,
    /// Per-connection bound on a single write
    pub write_timeout: Duration,
}

impl BroadcasterConfig {
    pub fn new(feed_id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            interval: DEFAULT_POLL_INTERVAL,
            policy: BroadcastPolicy::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Idle between ticks, Cycling while a cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    Idle,
    Cycling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Payload was stored and fanned out
    Broadcast,
    /// Payload matched the last broadcast; nothing stored or sent
    Unchanged,
}

/// Result of one completed cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub feed_id: String,
    pub outcome: CycleOutcome,
    pub bytes: usize,
    pub delivered: usize,
    pub failed: usize,
}

struct Inner {
    source: Arc<dyn DataSource>,
    registry: ConnectionRegistry,
    config: BroadcasterConfig,
    latest: RwLock<Option<FeedPayload>>,
    cycle_lock: Mutex<()>,
    cycling: AtomicBool,
}

/// Clears the cycling flag even if the cycle future is dropped midway
struct CyclingGuard<'a>(&'a AtomicBool);

impl Drop for CyclingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Pulls the feed on an interval and fans it out to the registry
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new(
        source: Arc<dyn DataSource>,
        registry: ConnectionRegistry,
        config: BroadcasterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                registry,
                config,
                latest: RwLock::new(None),
                cycle_lock: Mutex::new(()),
                cycling: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.inner.config
    }

    pub fn feed_id(&self) -> &str {
        &self.inner.config.feed_id
    }

    pub fn state(&self) -> BroadcasterState {
        if self.inner.cycling.load(Ordering::SeqCst) {
            BroadcasterState::Cycling
        } else {
            BroadcasterState::Idle
        }
    }

    /// Last payload that was broadcast, if any
    pub async fn latest(&self) -> Option<FeedPayload> {
        self.inner.latest.read().await.clone()
    }

    /// Spawn the periodic loop. It stops when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move { broadcaster.run(cancel).await })
    }

    /// Run cycles on the configured interval until cancelled.
    ///
    /// The first cycle runs immediately. Failed cycles are logged and retried
    /// on the next tick only.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            feed_id = %self.inner.config.feed_id,
            source = self.inner.source.name(),
            interval_secs = self.inner.config.interval.as_secs_f64(),
            policy = ?self.inner.config.policy,
            "Broadcaster started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(
                            feed_id = %self.inner.config.feed_id,
                            error = %e,
                            "Broadcast cycle aborted"
                        );
                    }
                }
            }
        }

        info!(feed_id = %self.inner.config.feed_id, "Broadcaster stopped");
    }

    /// Execute one fetch, compare, store, fan-out cycle.
    ///
    /// Concurrent callers are serialized. Fetch or store failures abort the
    /// cycle; individual write failures only deregister their connection.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _lock = self.inner.cycle_lock.lock().await;
        self.inner.cycling.store(true, Ordering::SeqCst);
        let _guard = CyclingGuard(&self.inner.cycling);

        let feed_id = self.inner.config.feed_id.as_str();
        let fetched = self.inner.source.fetch(feed_id).await?;

        if self.inner.config.policy == BroadcastPolicy::OnChange {
            let latest = self.inner.latest.read().await;
            if latest.as_ref().is_some_and(|last| last.same_data(&fetched)) {
                debug!(feed_id, "Feed unchanged, skipping broadcast");
                return Ok(CycleReport {
                    feed_id: feed_id.to_string(),
                    outcome: CycleOutcome::Unchanged,
                    bytes: fetched.data.len(),
                    delivered: 0,
                    failed: 0,
                });
            }
        }

        let stored = self.inner.source.store(feed_id, fetched.data).await?;
        let data = stored.data.clone();
        *self.inner.latest.write().await = Some(stored);

        let (delivered, failed) = self.fan_out(data.clone()).await;

        info!(
            feed_id,
            bytes = data.len(),
            delivered,
            failed,
            "Feed broadcast"
        );

        Ok(CycleReport {
            feed_id: feed_id.to_string(),
            outcome: CycleOutcome::Broadcast,
            bytes: data.len(),
            delivered,
            failed,
        })
    }

    /// Register `connection`, first queueing the last broadcast payload when
    /// `replay` is set.
    ///
    /// Holds the cycle lock, so a concurrent cycle reaches the connection
    /// either entirely before or entirely after admission.
    pub async fn admit(&self, connection: FeedConnection, replay: bool) -> bool {
        let _lock = self.inner.cycle_lock.lock().await;

        if replay {
            let latest = self.inner.latest.read().await.as_ref().map(|p| p.data.clone());
            if let Some(data) = latest {
                if let Err(e) = connection.write(data, self.inner.config.write_timeout).await {
                    debug!(connection_id = %connection.id, error = %e, "Replay skipped");
                }
            }
        }

        self.inner.registry.register(connection)
    }

    /// Write `data` to every registered connection concurrently.
    ///
    /// Returns `(delivered, failed)`.
    async fn fan_out(&self, data: Bytes) -> (usize, usize) {
        let timeout = self.inner.config.write_timeout;
        let mut writes = JoinSet::new();
        let mut pending = HashMap::new();

        for connection in self.inner.registry.snapshot() {
            let data = data.clone();
            let connection_id = connection.id.clone();
            let handle = writes.spawn(async move { connection.write(data, timeout).await });
            pending.insert(handle.id(), connection_id);
        }

        self.settle_writes(writes, pending).await
    }

    /// Collect write results, deregistering every connection whose write
    /// failed or whose task panicked
    async fn settle_writes(
        &self,
        mut writes: JoinSet<Result<()>>,
        mut pending: HashMap<task::Id, String>,
    ) -> (usize, usize) {
        let mut delivered = 0;
        let mut failed = 0;

        while let Some(joined) = writes.join_next_with_id().await {
            let (task_id, error) = match joined {
                Ok((task_id, Ok(()))) => {
                    pending.remove(&task_id);
                    delivered += 1;
                    continue;
                }
                Ok((task_id, Err(e))) => (task_id, e.to_string()),
                Err(e) => (e.id(), e.to_string()),
            };

            failed += 1;
            match pending.remove(&task_id) {
                Some(connection_id) => {
                    warn!(connection_id = %connection_id, error = %error, "Broadcast write failed");
                    self.inner.registry.deregister(&connection_id);
                }
                None => warn!(error = %error, "Broadcast write task failed"),
            }
        }
        (delivered, failed)
    }
}
