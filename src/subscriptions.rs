//! Topic subscription registry.
//!
//! Reference-counts local interest per order id and issues `join-tracking`
//! on the first subscriber (when live) and again for every active topic on
//! each reconnect. No `leave` message is ever sent; the server keeps the
//! order joined until the connection drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::TrackingError;
use crate::wire::OutboundMessage;

/// Where join messages go. Implemented by [`ConnectionManager`].
pub trait ControlSink: Send + Sync {
    fn send_control(&self, message: &OutboundMessage) -> Result<(), TrackingError>;
}

impl ControlSink for ConnectionManager {
    fn send_control(&self, message: &OutboundMessage) -> Result<(), TrackingError> {
        self.send(message)
    }
}

#[derive(Default)]
struct RegistryState {
    topics: HashMap<String, usize>,
    /// Tracks the channel as seen through `on_connected`/`on_disconnected`,
    /// so a join is never sent both on subscribe and on replay.
    live: bool,
    /// Bumped by `clear()`; guards from an older epoch release nothing.
    epoch: u64,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    sink: Arc<dyn ControlSink>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn join(&self, order_id: &str) -> bool {
        let message = OutboundMessage::JoinTracking {
            order_id: order_id.to_string(),
        };
        match self.sink.send_control(&message) {
            Ok(()) => {
                debug!(order_id, "Joined tracking topic");
                true
            }
            Err(e) => {
                warn!(order_id, error = %e, "Join failed; will replay on next connect");
                false
            }
        }
    }

    fn release(&self, order_id: &str, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        let remaining = match state.topics.get_mut(order_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.topics.remove(order_id);
            debug!(order_id, "Last subscriber left tracking topic (no leave message sent)");
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

/// A live interest in one topic. Dropping it (or calling
/// [`Subscription::unsubscribe`]) releases the reference.
pub struct Subscription {
    order_id: String,
    epoch: u64,
    registry: Weak<RegistryInner>,
    released: bool,
}

impl Subscription {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(inner) = self.registry.upgrade() {
            inner.release(&self.order_id, self.epoch);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("order_id", &self.order_id)
            .field("released", &self.released)
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new(sink: Arc<dyn ControlSink>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                sink,
            }),
        }
    }

    pub fn subscribe(&self, order_id: &str) -> Subscription {
        let mut state = self.inner.lock();
        let count = state.topics.entry(order_id.to_string()).or_insert(0);
        *count += 1;
        let first = *count == 1;

        if first {
            if state.live {
                self.inner.join(order_id);
            } else {
                info!(order_id, "Tracking topic queued until connected");
            }
        }

        Subscription {
            order_id: order_id.to_string(),
            epoch: state.epoch,
            registry: Arc::downgrade(&self.inner),
            released: false,
        }
    }

    /// Replay `join-tracking` once for every active topic. Returns how many
    /// joins were sent.
    pub fn on_connected(&self) -> usize {
        let mut state = self.inner.lock();
        state.live = true;
        let mut topics: Vec<&String> = state.topics.keys().collect();
        topics.sort();
        let sent = topics.iter().filter(|t| self.inner.join(t)).count();
        if !topics.is_empty() {
            info!(topics = topics.len(), sent, "Replayed tracking joins after connect");
        }
        sent
    }

    pub fn on_disconnected(&self) {
        self.inner.lock().live = false;
    }

    /// The channel state as last reported through `on_connected` /
    /// `on_disconnected`.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().live
    }

    pub fn active_topics(&self) -> Vec<String> {
        let state = self.inner.lock();
        let mut topics: Vec<String> = state.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, order_id: &str) -> usize {
        self.inner.lock().topics.get(order_id).copied().unwrap_or(0)
    }

    /// Drop every topic. Outstanding guards become no-ops.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        let dropped = state.topics.len();
        state.topics.clear();
        state.epoch += 1;
        dropped
    }
}
