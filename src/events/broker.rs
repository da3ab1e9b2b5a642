//! Keyed multicast of optimization events.
//!
//! Each optimization id owns a broadcast channel. Subscribers receive every
//! event published after they subscribe; multiple subscribers per id are
//! fine. A terminal event starts a grace timer, after which the channel is
//! dropped and every subscriber's stream ends. Ids with no activity for an
//! hour are expired by the periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::OptimizationEvent;

/// Grace window between a terminal event and stream close.
pub const DEFAULT_TERMINAL_GRACE_SECS: u64 = 5;

/// Idle lifetime of an id's channel.
pub const DEFAULT_CHANNEL_IDLE_SECS: u64 = 3600;

/// Buffered events per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 64;

struct Channel {
    sender: broadcast::Sender<OptimizationEvent>,
    last_activity: Instant,
}

struct BrokerInner {
    channels: RwLock<HashMap<String, Channel>>,
    terminal_grace: Duration,
    channel_idle: Duration,
}

impl BrokerInner {
    /// Drop the channel for an id, ending all of its subscriber streams.
    async fn close(&self, id: &str) {
        if self.channels.write().await.remove(id).is_some() {
            debug!(id = %id, "closed event channel");
        }
    }
}

// =============================================================================
// SSE Broker
// =============================================================================

/// Keyed multicast hub for [`OptimizationEvent`]s.
///
/// The broker is an explicitly constructed resource; cloning it shares the
/// underlying channel table, and terminal-close timers hold a clone.
#[derive(Clone)]
pub struct SseBroker {
    inner: Arc<BrokerInner>,
}

impl Default for SseBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SseBroker {
    /// Create a broker with production timings (5 s grace, 1 h idle).
    pub fn new() -> Self {
        Self::with_timings(
            Duration::from_secs(DEFAULT_TERMINAL_GRACE_SECS),
            Duration::from_secs(DEFAULT_CHANNEL_IDLE_SECS),
        )
    }

    /// Create a broker with custom timings (used by tests).
    pub fn with_timings(terminal_grace: Duration, channel_idle: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                channels: RwLock::new(HashMap::new()),
                terminal_grace,
                channel_idle,
            }),
        }
    }

    /// Subscribe to events for an id.
    ///
    /// Returns a receiver carrying every event published after this call.
    /// An empty (or whitespace) id is rejected.
    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Result<broadcast::Receiver<OptimizationEvent>, SubscribeError> {
        if id.trim().is_empty() {
            return Err(SubscribeError::EmptyId);
        }

        let mut channels = self.inner.channels.write().await;
        let channel = channels.entry(id.to_string()).or_insert_with(|| Channel {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            last_activity: Instant::now(),
        });
        channel.last_activity = Instant::now();
        Ok(channel.sender.subscribe())
    }

    /// Publish an event to all current subscribers of its id.
    ///
    /// Events for ids without a channel are dropped. A terminal event
    /// schedules the channel close after the grace window.
    pub async fn publish(&self, event: OptimizationEvent) {
        let id = event.optimization_id().to_string();
        let terminal = event.is_terminal();

        {
            let mut channels = self.inner.channels.write().await;
            match channels.get_mut(&id) {
                Some(channel) => {
                    channel.last_activity = Instant::now();
                    // Send fails only when no receiver is subscribed.
                    if let Err(e) = channel.sender.send(event) {
                        debug!(id = %id, error = %e, "no subscribers for event");
                    }
                }
                None => {
                    debug!(id = %id, "dropping event for unknown id");
                    return;
                }
            }
        }

        if terminal {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(inner.terminal_grace).await;
                inner.close(&id).await;
            });
        }
    }

    /// Drop the channel for an id, ending all of its subscriber streams.
    pub async fn close(&self, id: &str) {
        self.inner.close(id).await;
    }

    /// Expire channels idle past their lifetime. Returns how many were
    /// removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut channels = self.inner.channels.write().await;
        let before = channels.len();
        channels.retain(|id, channel| {
            let keep = now.duration_since(channel.last_activity) < self.inner.channel_idle;
            if !keep {
                warn!(id = %id, "expiring idle event channel");
            }
            keep
        });
        before - channels.len()
    }

    /// Number of live id channels.
    pub async fn channel_count(&self) -> usize {
        self.inner.channels.read().await.len()
    }

    /// Number of subscribers for an id.
    pub async fn subscriber_count(&self, id: &str) -> usize {
        self.inner
            .channels
            .read()
            .await
            .get(id)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }
}

/// Rejection reasons for [`SseBroker::subscribe`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("subscription id must not be empty")]
    EmptyId,
}

// =============================================================================
// Tests
// =============================================================================
