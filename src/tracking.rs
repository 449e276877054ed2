//! Tracking client shell.
//!
//! Composes the [`ConnectionManager`], the [`SubscriptionRegistry`] and the
//! [`reduce`] function into one client that publishes a snapshot per watched
//! order through a `tokio::sync::watch` channel, plus a broadcast stream of
//! transient notifications.
//!
//! A single dispatcher task consumes connection events in order, so no two
//! events for the same order are ever reduced concurrently. Reconnects use
//! capped exponential backoff with jitter; every reconnect replays the
//! topic joins and refreshes each watched order over REST.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::error::TrackingError;
use crate::reducer::{reduce, ReduceOutcome, RemoteSnapshot, TrackingEvent, TrackingSnapshot};
use crate::scheduler::ScheduledTask;
use crate::subscriptions::{ControlSink, Subscription, SubscriptionRegistry};
use crate::wire::{InboundMessage, OutboundMessage, TrackingNotification};

/// Default cadence of the REST fallback refresh.
pub const DEFAULT_FALLBACK_REFRESH: Duration = Duration::from_secs(120);

/// Buffered notifications per observer.
const NOTIFICATION_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// REST seam
// ---------------------------------------------------------------------------

/// Source of authoritative tracking snapshots (`GET /delivery-tracking/{id}`).
#[async_trait]
pub trait TrackingApi: Send + Sync {
    async fn fetch_tracking(&self, order_id: &str) -> Result<RemoteSnapshot, TrackingError>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Spread each delay uniformly over `[d/2, d]`.
    pub jitter: bool,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: true,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
        let capped = self.base.saturating_mul(factor).min(self.max);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let half = capped / 2;
        let spread = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

#[derive(Debug, Clone)]
pub struct TrackingClientConfig {
    pub socket_url: String,
    /// `None` disables the periodic REST refresh.
    pub fallback_refresh: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl TrackingClientConfig {
    pub fn new(socket_url: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            fallback_refresh: Some(DEFAULT_FALLBACK_REFRESH),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Session {
    auth_token: Zeroizing<String>,
    user_id: Option<String>,
}

struct ClientInner {
    config: TrackingClientConfig,
    api: Arc<dyn TrackingApi>,
    connection: Arc<ConnectionManager>,
    registry: SubscriptionRegistry,
    orders: Mutex<HashMap<String, watch::Sender<TrackingSnapshot>>>,
    notifications: broadcast::Sender<TrackingNotification>,
    session: Mutex<Option<Session>>,
    /// Parent of every background task and in-flight fetch.
    cancel: CancellationToken,
    /// Stops the reconnect loop; cancelled before the connection is closed.
    reconnect_cancel: CancellationToken,
    tasks: TaskTracker,
    fallback: Mutex<Option<ScheduledTask>>,
    started: AtomicBool,
    disposed: AtomicBool,
    reconnecting: AtomicBool,
    connected_once: AtomicBool,
}

/// Live tracking client. Call [`TrackingClient::start`] once, then
/// [`TrackingClient::watch`] any number of orders.
pub struct TrackingClient {
    inner: Arc<ClientInner>,
}

impl TrackingClient {
    pub fn new(
        config: TrackingClientConfig,
        api: Arc<dyn TrackingApi>,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        let sink: Arc<dyn ControlSink> = connection.clone();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let cancel = CancellationToken::new();
        let reconnect_cancel = cancel.child_token();
        Self {
            inner: Arc::new(ClientInner {
                config,
                api,
                registry: SubscriptionRegistry::new(sink),
                connection,
                orders: Mutex::new(HashMap::new()),
                notifications,
                session: Mutex::new(None),
                cancel,
                reconnect_cancel,
                tasks: TaskTracker::new(),
                fallback: Mutex::new(None),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                connected_once: AtomicBool::new(false),
            }),
        }
    }

    /// Open the live channel in the background and keep it open until
    /// [`dispose`](Self::dispose). Connect failures are retried and surface
    /// as `last_error` on every watched order.
    pub fn start(&self, auth_token: &str, user_id: Option<&str>) -> Result<(), TrackingError> {
        let inner = &self.inner;
        inner.ensure_active()?;
        if inner.started.swap(true, Ordering::SeqCst) {
            warn!("Tracking client already started");
            return Ok(());
        }

        *lock(&inner.session) = Some(Session {
            auth_token: Zeroizing::new(auth_token.to_string()),
            user_id: user_id.map(str::to_string).filter(|u| !u.is_empty()),
        });

        // Listen before the first open so `Connected` is never missed.
        let events = inner.connection.listen();
        inner.tasks.spawn(Arc::clone(inner).run_dispatcher(events));

        if let Some(period) = inner.config.fallback_refresh.filter(|p| !p.is_zero()) {
            let weak = Arc::downgrade(inner);
            let task = ScheduledTask::every("tracking-fallback-refresh", period, &inner.cancel, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.refresh_all_now().await;
                    }
                }
            });
            *lock(&inner.fallback) = Some(task);
        }

        info!(endpoint = %inner.config.socket_url, "Tracking client started");
        inner.spawn_connect(true);
        Ok(())
    }

    /// Watch one order. The first watcher of an order seeds its snapshot over
    /// REST and joins its topic; later watchers share the same snapshot.
    pub fn watch(&self, order_id: &str) -> Result<OrderWatch, TrackingError> {
        let inner = &self.inner;
        inner.ensure_active()?;

        let (receiver, subscription, first) = {
            let mut orders = lock(&inner.orders);
            let (receiver, first) = match orders.get(order_id) {
                Some(tx) => (tx.subscribe(), false),
                None => {
                    let mut initial = TrackingSnapshot::empty(order_id);
                    initial.connection_state.connected = inner.connection.is_live();
                    let (tx, rx) = watch::channel(initial);
                    orders.insert(order_id.to_string(), tx);
                    (rx, true)
                }
            };
            // Subscribed under the orders lock so a concurrent release cannot
            // remove the entry in between.
            (receiver, inner.registry.subscribe(order_id), first)
        };

        if first {
            debug!(order_id, "Seeding tracking snapshot");
            inner.spawn_fetch(order_id.to_string());
        }

        Ok(OrderWatch {
            order_id: order_id.to_string(),
            receiver,
            subscription: Some(subscription),
            client: Arc::downgrade(inner),
        })
    }

    /// Re-fetch one watched order and return the resulting snapshot. A
    /// failed fetch is also recorded in the snapshot's `last_error`.
    pub async fn refresh(&self, order_id: &str) -> Result<TrackingSnapshot, TrackingError> {
        let inner = &self.inner;
        inner.ensure_active()?;
        if !lock(&inner.orders).contains_key(order_id) {
            return Err(TrackingError::Fetch(format!("Order {order_id} is not being watched")));
        }

        let result = inner.fetch(order_id).await;
        inner.apply_fetch(order_id, &result);
        result?;
        self.snapshot(order_id).ok_or(TrackingError::Disposed)
    }

    pub fn snapshot(&self, order_id: &str) -> Option<TrackingSnapshot> {
        lock(&self.inner.orders)
            .get(order_id)
            .map(|tx| tx.borrow().clone())
    }

    pub fn watched_orders(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.orders).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn notifications(&self) -> broadcast::Receiver<TrackingNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn is_live(&self) -> bool {
        self.inner.connection.is_live()
    }

    pub fn live_signal(&self) -> watch::Receiver<bool> {
        self.inner.connection.live_signal()
    }

    /// Tear down: drop every topic, close the channel, then cancel in-flight
    /// fetches and background tasks and wait for them. Observers see their
    /// snapshot channels close.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let topics = inner.registry.clear();
        inner.reconnect_cancel.cancel();
        inner.connection.shutdown().await;

        let fallback = lock(&inner.fallback).take();
        if let Some(task) = fallback {
            task.shutdown().await;
        }
        inner.cancel.cancel();
        inner.tasks.close();
        inner.tasks.wait().await;

        lock(&inner.orders).clear();
        *lock(&inner.session) = None;
        info!(topics, "Tracking client disposed");
    }
}

impl Drop for TrackingClient {
    fn drop(&mut self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let connection = Arc::clone(&self.inner.connection);
            runtime.spawn(async move { connection.shutdown().await });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ClientInner {
    fn ensure_active(&self) -> Result<(), TrackingError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(TrackingError::Disposed)
        } else {
            Ok(())
        }
    }

    // -- Reduction ----------------------------------------------------------

    fn apply(&self, order_id: &str, event: &TrackingEvent) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut notification = None;
        {
            let orders = lock(&self.orders);
            let Some(tx) = orders.get(order_id) else {
                debug!(order_id, "Dropping tracking event for an order nobody watches");
                return;
            };
            tx.send_if_modified(|snapshot| match reduce(snapshot, event) {
                ReduceOutcome::Applied(next) => {
                    *snapshot = next;
                    true
                }
                ReduceOutcome::Notify(n) => {
                    notification = Some(n);
                    false
                }
                ReduceOutcome::Unchanged | ReduceOutcome::Ignored(_) => false,
            });
        }
        if let Some(n) = notification {
            let _ = self.notifications.send(n);
        }
    }

    fn apply_all(&self, event: &TrackingEvent) {
        for order_id in self.order_ids() {
            self.apply(&order_id, event);
        }
    }

    fn order_ids(&self) -> Vec<String> {
        lock(&self.orders).keys().cloned().collect()
    }

    /// Drop the snapshot channel once the last watcher of `order_id` is gone.
    fn release_order(&self, order_id: &str) {
        let mut orders = lock(&self.orders);
        if self.registry.subscriber_count(order_id) == 0 && orders.remove(order_id).is_some() {
            debug!(order_id, "Stopped tracking order");
        }
    }

    // -- REST ---------------------------------------------------------------

    async fn fetch(&self, order_id: &str) -> Result<RemoteSnapshot, TrackingError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TrackingError::Disposed),
            result = self.api.fetch_tracking(order_id) => result,
        }
    }

    fn apply_fetch(&self, order_id: &str, result: &Result<RemoteSnapshot, TrackingError>) {
        match result {
            Ok(remote) => self.apply(order_id, &TrackingEvent::Seeded(remote.clone())),
            Err(TrackingError::Disposed) => {}
            Err(e) => {
                warn!(order_id, error = %e, "Tracking snapshot fetch failed");
                self.apply(order_id, &TrackingEvent::FetchFailed(e.to_string()));
            }
        }
    }

    fn spawn_fetch(self: &Arc<Self>, order_id: String) {
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let result = inner.fetch(&order_id).await;
            inner.apply_fetch(&order_id, &result);
        });
    }

    fn refresh_all(self: &Arc<Self>) {
        for order_id in self.order_ids() {
            self.spawn_fetch(order_id);
        }
    }

    async fn refresh_all_now(&self) {
        let ids = self.order_ids();
        if ids.is_empty() {
            return;
        }
        debug!(orders = ids.len(), "Fallback tracking refresh");
        join_all(ids.iter().map(|order_id| async move {
            let result = self.fetch(order_id).await;
            self.apply_fetch(order_id, &result);
        }))
        .await;
    }

    // -- Connection lifecycle ----------------------------------------------

    async fn run_dispatcher(self: Arc<Self>, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.on_connection_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Tracking dispatcher lagged; resyncing every order");
                    self.resync_after_lag();
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Tracking dispatcher stopped");
    }

    /// Skipped events may include `Connected` or `Disconnected`; rebuild the
    /// lifecycle state from the live signal, then refetch every order.
    fn resync_after_lag(self: &Arc<Self>) {
        let live = self.connection.is_live();
        self.apply_all(&TrackingEvent::ConnectionChanged(live));
        match (live, self.registry.is_connected()) {
            (true, false) => {
                self.registry.on_connected();
            }
            (false, true) => {
                self.registry.on_disconnected();
                self.spawn_connect(false);
            }
            (false, false) => self.spawn_connect(false),
            (true, true) => {}
        }
        self.refresh_all();
    }

    fn on_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.apply_all(&TrackingEvent::ConnectionChanged(true));
                let user_id = lock(&self.session).as_ref().and_then(|s| s.user_id.clone());
                if let Some(user_id) = user_id {
                    if let Err(e) = self.connection.send(&OutboundMessage::UserConnect { user_id }) {
                        warn!(error = %e, "Failed to announce user on tracking channel");
                    }
                }
                self.registry.on_connected();
                // The first connect races the initial seeds; later ones may
                // have missed updates while offline.
                if self.connected_once.swap(true, Ordering::SeqCst) {
                    self.refresh_all();
                }
            }
            ConnectionEvent::Disconnected => {
                self.registry.on_disconnected();
                self.apply_all(&TrackingEvent::ConnectionChanged(false));
                // A newer connection may already be up.
                if !self.connection.is_live() {
                    self.spawn_connect(false);
                }
            }
            ConnectionEvent::Error(reason) => {
                self.apply_all(&TrackingEvent::ChannelError(reason));
            }
            ConnectionEvent::Message(message) => self.route(message),
        }
    }

    fn route(&self, message: InboundMessage) {
        if let InboundMessage::Unknown { event } = &message {
            debug!(event, "Ignoring unhandled tracking event");
            return;
        }

        let target = match message.order_id() {
            Some(id) => id.to_string(),
            None => {
                let orders = lock(&self.orders);
                let mut ids = orders.keys();
                match (ids.next(), ids.next()) {
                    (Some(only), None) => only.clone(),
                    _ => {
                        warn!(watched = orders.len(), "Dropping tracking message without orderId");
                        return;
                    }
                }
            }
        };

        match TrackingEvent::from_inbound(message) {
            Some(event) => self.apply(&target, &event),
            None => debug!(order_id = %target, "Tracking message has no snapshot effect"),
        }
    }

    fn spawn_connect(self: &Arc<Self>, initial: bool) {
        if self.disposed.load(Ordering::SeqCst) || self.reconnect_cancel.is_cancelled() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let connected = inner.connect_loop(initial).await;
            inner.reconnecting.store(false, Ordering::SeqCst);
            // A `Disconnected` handled before the flag cleared was dropped by
            // the guard above; catch it here.
            if connected && !inner.connection.is_live() {
                debug!("Tracking channel dropped while connecting; retrying");
                inner.spawn_connect(false);
            }
        });
    }

    /// Returns whether a channel was opened.
    async fn connect_loop(&self, initial: bool) -> bool {
        let token = match lock(&self.session).as_ref() {
            Some(session) => session.auth_token.clone(),
            None => return false,
        };
        let endpoint = self.config.socket_url.as_str();
        let policy = &self.config.reconnect;
        let cancel = &self.reconnect_cancel;

        let mut failures: u32 = 0;
        loop {
            if !(initial && failures == 0) {
                let delay = policy.delay(failures);
                info!(attempt = failures + 1, delay_ms = delay.as_millis() as u64, "Reconnecting tracking channel");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                result = self.connection.open(endpoint, &token) => result,
            };
            match result {
                Ok(handle) => {
                    debug!(handle = handle.id(), "Tracking channel open");
                    return true;
                }
                Err(e) => {
                    failures += 1;
                    if policy.exhausted(failures) {
                        error!(failures, error = %e, "Giving up on tracking channel; REST refresh only");
                        return false;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Order watch
// ---------------------------------------------------------------------------

/// One observer of an order's snapshot. Dropping it releases the topic.
pub struct OrderWatch {
    order_id: String,
    receiver: watch::Receiver<TrackingSnapshot>,
    subscription: Option<Subscription>,
    client: Weak<ClientInner>,
}

impl OrderWatch {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next published snapshot.
    pub async fn changed(&mut self) -> Result<TrackingSnapshot, TrackingError> {
        self.receiver
            .changed()
            .await
            .map_err(|_| TrackingError::Disposed)?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// Wait until the snapshot satisfies `predicate` (checked immediately).
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&TrackingSnapshot) -> bool,
    ) -> Result<TrackingSnapshot, TrackingError> {
        self.receiver
            .wait_for(|s| predicate(s))
            .await
            .map(|s| s.clone())
            .map_err(|_| TrackingError::Disposed)
    }

    pub fn receiver(&self) -> watch::Receiver<TrackingSnapshot> {
        self.receiver.clone()
    }
}

impl Drop for OrderWatch {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(inner) = self.client.upgrade() {
            inner.release_order(&self.order_id);
        }
    }
}

impl std::fmt::Debug for OrderWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderWatch")
            .field("order_id", &self.order_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{MemoryConnector, ServerEnd};
    use crate::wire::{GeoPoint, TimelineEntry};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct FakeApi {
        responses: Mutex<HashMap<String, Result<RemoteSnapshot, TrackingError>>>,
        calls: AtomicUsize,
    }

    impl FakeApi {
        fn respond(&self, order_id: &str, response: Result<RemoteSnapshot, TrackingError>) {
            self.responses
                .lock()
                .unwrap()
                .insert(order_id.to_string(), response);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrackingApi for FakeApi {
        async fn fetch_tracking(&self, order_id: &str) -> Result<RemoteSnapshot, TrackingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .get(order_id)
                .cloned()
                .unwrap_or_else(|| Ok(RemoteSnapshot::default()))
        }
    }

    struct Harness {
        client: TrackingClient,
        api: Arc<FakeApi>,
        connector: Arc<MemoryConnector>,
        servers: mpsc::UnboundedReceiver<ServerEnd>,
    }

    fn harness(fallback_refresh: Option<Duration>) -> Harness {
        let (connector, servers) = MemoryConnector::new();
        let api = Arc::new(FakeApi::default());
        let connection = Arc::new(ConnectionManager::new(connector.clone()));
        let config = TrackingClientConfig {
            socket_url: "ws://tracking.test/ws".into(),
            fallback_refresh,
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(40),
                jitter: false,
                max_attempts: None,
            },
        };
        Harness {
            client: TrackingClient::new(config, api.clone(), connection),
            api,
            connector,
            servers,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
        tokio::time::timeout(WAIT, servers.recv())
            .await
            .expect("no connection attempt")
            .expect("connector closed")
    }

    /// Read exactly `n` frames, then make sure nothing else follows.
    async fn expect_frames(server: &mut ServerEnd, n: usize) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        for _ in 0..n {
            let text = tokio::time::timeout(WAIT, server.from_client.recv())
                .await
                .expect("frame timeout")
                .expect("client closed");
            frames.push(serde_json::from_str(&text).unwrap());
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(server.drain_sent().is_empty(), "unexpected extra frames");
        frames
    }

    fn joined(frames: &[serde_json::Value]) -> Vec<String> {
        frames
            .iter()
            .filter(|f| f["event"] == "join-tracking")
            .map(|f| f["data"]["orderId"].as_str().unwrap().to_string())
            .collect()
    }

    fn at(minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_watch_seeds_then_applies_live_updates() {
        let mut h = harness(None);
        h.api.respond(
            "o-1",
            Ok(RemoteSnapshot {
                status: Some("pending".into()),
                ..RemoteSnapshot::default()
            }),
        );
        let mut watch = h.client.watch("o-1").unwrap();
        let seeded = watch
            .wait_for(|s| s.status.as_deref() == Some("pending"))
            .await
            .unwrap();
        assert!(seeded.timeline.is_empty());
        assert_eq!(seeded.driver_location, None);

        h.client.start("tok", Some("u-1")).unwrap();
        let mut server = next_server(&mut h.servers).await;
        watch.wait_for(|s| s.connection_state.connected).await.unwrap();

        server.push(r#"{"event":"location-update","data":{"orderId":"o-1","location":{"lat":10.0,"lng":20.0}}}"#);
        server.push(
            r#"{"event":"status-update","data":{"orderId":"o-1","status":"out_for_delivery","timeline":[{"status":"out_for_delivery","at":"2026-10-18T12:01:00Z"}]}}"#,
        );
        let snapshot = watch
            .wait_for(|s| s.status.as_deref() == Some("out_for_delivery"))
            .await
            .unwrap();
        assert_eq!(snapshot.driver_location, Some(GeoPoint { lat: 10.0, lng: 20.0 }));
        assert_eq!(
            snapshot.timeline,
            vec![TimelineEntry {
                status: "out_for_delivery".into(),
                at: at(1),
            }]
        );
        assert_eq!(snapshot.last_error, None);

        let frames = expect_frames(&mut server, 2).await;
        assert_eq!(frames[0]["event"], "user-connect");
        assert_eq!(frames[0]["data"]["userId"], "u-1");
        assert_eq!(joined(&frames), vec!["o-1".to_string()]);
        assert_eq!(h.api.calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_replays_each_join_once() {
        let mut h = harness(None);
        h.client.start("tok", None).unwrap();
        let mut first = next_server(&mut h.servers).await;
        eventually(|| h.client.is_live()).await;

        let _a = h.client.watch("o-1").unwrap();
        let _b = h.client.watch("o-2").unwrap();
        let _b2 = h.client.watch("o-2").unwrap();
        assert_eq!(joined(&expect_frames(&mut first, 2).await), vec!["o-1", "o-2"]);

        drop(first);
        let mut second = next_server(&mut h.servers).await;
        eventually(|| h.client.is_live()).await;
        assert_eq!(joined(&expect_frames(&mut second, 2).await), vec!["o-1", "o-2"]);

        // Both orders are refreshed after the reconnect.
        eventually(|| h.api.calls() >= 4).await;
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnects_after_immediate_hang_ups() {
        let mut h = harness(None);
        h.connector.hang_up_next(3);
        h.client.start("tok", None).unwrap();

        // Only the fourth connection reaches a server end.
        let _server = next_server(&mut h.servers).await;
        eventually(|| h.client.is_live() && h.connector.attempts.load(Ordering::SeqCst) == 4).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.client.is_live());
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_lag_resync_restores_connection_state_and_joins() {
        let mut h = harness(None);
        h.client.start("tok", None).unwrap();
        let mut server = next_server(&mut h.servers).await;
        eventually(|| h.client.is_live()).await;

        let mut watch = h.client.watch("o-1").unwrap();
        assert_eq!(joined(&expect_frames(&mut server, 1).await), vec!["o-1"]);
        eventually(|| h.api.calls() == 1).await;
        watch.wait_for(|s| s.connection_state.connected).await.unwrap();

        // As if the dispatcher had missed the latest `Connected`.
        let inner = &h.client.inner;
        inner.registry.on_disconnected();
        inner.apply("o-1", &TrackingEvent::ConnectionChanged(false));
        assert!(!watch.snapshot().connection_state.connected);

        inner.resync_after_lag();
        assert!(watch.snapshot().connection_state.connected);
        assert_eq!(joined(&expect_frames(&mut server, 1).await), vec!["o-1"]);
        eventually(|| h.api.calls() == 2).await;

        // In sync already: no duplicate join.
        inner.resync_after_lag();
        assert!(expect_frames(&mut server, 0).await.is_empty());
        eventually(|| h.api.calls() == 3).await;
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_marks_snapshots_offline() {
        let mut h = harness(None);
        h.connector.refuse_next("refused");
        h.connector.refuse_next("refused");
        h.client.start("tok", None).unwrap();
        let server = next_server(&mut h.servers).await;
        eventually(|| h.client.is_live()).await;

        let mut watch = h.client.watch("o-1").unwrap();
        watch.wait_for(|s| s.connection_state.connected).await.unwrap();

        // Block the reconnect so the offline state is observable.
        h.connector.refuse_next("still down");
        drop(server);
        let snapshot = watch
            .wait_for(|s| !s.connection_state.connected)
            .await
            .unwrap();
        assert!(snapshot.is_degraded());
        assert!(h.connector.attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_channel_error_kept_until_refresh_succeeds() {
        let mut h = harness(None);
        let mut watch = h.client.watch("o-1").unwrap();
        eventually(|| h.api.calls() == 1).await;

        h.connector.refuse_next("connection refused");
        h.client.start("tok", None).unwrap();
        let _server = next_server(&mut h.servers).await;
        let snapshot = watch.wait_for(|s| s.connection_state.connected).await.unwrap();
        assert_eq!(snapshot.last_error.as_deref(), Some("connection refused"));
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);

        let refreshed = h.client.refresh("o-1").await.unwrap();
        assert_eq!(refreshed.last_error, None);
        assert!(!refreshed.is_degraded());
    }

    #[tokio::test]
    async fn test_failed_seed_keeps_snapshot_and_records_error() {
        let h = harness(None);
        h.api
            .respond("o-1", Err(TrackingError::Fetch("HTTP 500".into())));
        let mut watch = h.client.watch("o-1").unwrap();
        let snapshot = watch.wait_for(|s| s.last_error.is_some()).await.unwrap();
        assert_eq!(snapshot.status, None);
        assert_eq!(snapshot.last_error.as_deref(), Some("Fetch error: HTTP 500"));

        let err = h.client.refresh("o-1").await.unwrap_err();
        assert_eq!(err, TrackingError::Fetch("HTTP 500".into()));
    }

    #[tokio::test]
    async fn test_message_without_order_id_needs_single_watch() {
        let mut h = harness(None);
        h.client.start("tok", None).unwrap();
        let server = next_server(&mut h.servers).await;
        eventually(|| h.client.is_live()).await;

        let mut one = h.client.watch("o-1").unwrap();
        eventually(|| h.api.calls() == 1).await;
        server.push(r#"{"event":"eta-update","data":{"estimatedTime":"7 min"}}"#);
        let snapshot = one
            .wait_for(|s| s.estimated_time_text.is_some())
            .await
            .unwrap();
        assert_eq!(snapshot.estimated_time_text.as_deref(), Some("7 min"));

        let two = h.client.watch("o-2").unwrap();
        eventually(|| h.api.calls() == 2).await;
        server.push(r#"{"event":"eta-update","data":{"estimatedTime":"1 min"}}"#);
        server.push(r#"{"event":"eta-update","data":{"orderId":"o-2","estimatedTime":"3 min"}}"#);
        let mut two_rx = two.receiver();
        two_rx
            .wait_for(|s| s.estimated_time_text.as_deref() == Some("3 min"))
            .await
            .unwrap();
        // The unaddressed update was dropped, not applied to either order.
        assert_eq!(one.snapshot().estimated_time_text.as_deref(), Some("7 min"));
    }

    #[tokio::test]
    async fn test_notifications_are_broadcast_not_stored() {
        let mut h = harness(None);
        let mut notifications = h.client.notifications();
        h.client.start("tok", None).unwrap();
        let server = next_server(&mut h.servers).await;
        eventually(|| h.client.is_live()).await;
        let mut watch = h.client.watch("o-1").unwrap();
        eventually(|| h.api.calls() == 1).await;
        let before = watch.wait_for(|s| s.connection_state.connected).await.unwrap();

        server.push(r#"{"event":"notification","data":{"orderId":"o-1","type":"arriving","description":"Driver is nearby"}}"#);
        let n = tokio::time::timeout(WAIT, notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.kind, "arriving");
        assert_eq!(n.description, "Driver is nearby");
        assert_eq!(watch.snapshot(), before);
    }

    #[tokio::test]
    async fn test_dispose_closes_everything() {
        let mut h = harness(Some(Duration::from_secs(60)));
        h.client.start("tok", None).unwrap();
        let _server = next_server(&mut h.servers).await;
        eventually(|| h.client.is_live()).await;
        let watch = h.client.watch("o-1").unwrap();

        h.client.dispose().await;
        assert!(!h.client.is_live());
        assert_eq!(h.client.watch("o-2").unwrap_err(), TrackingError::Disposed);
        assert_eq!(h.client.refresh("o-1").await.unwrap_err(), TrackingError::Disposed);
        assert!(watch.receiver().has_changed().is_err(), "snapshot channel still open");

        // No reconnect after the disposal-triggered disconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_watch_drop_releases_order() {
        let h = harness(None);
        let a = h.client.watch("o-1").unwrap();
        let b = h.client.watch("o-1").unwrap();
        drop(a);
        assert_eq!(h.client.watched_orders(), vec!["o-1".to_string()]);
        drop(b);
        assert!(h.client.watched_orders().is_empty());
        assert!(h.client.snapshot("o-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_refresh_runs_on_schedule() {
        let mut h = harness(Some(Duration::from_secs(60)));
        h.client.start("tok", None).unwrap();
        let _server = next_server(&mut h.servers).await;
        let _watch = h.client.watch("o-1").unwrap();

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(h.api.calls(), 3);
    }

    #[test]
    fn test_reconnect_delay_doubles_up_to_cap() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: false,
            max_attempts: None,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_reconnect_jitter_stays_within_half_to_full() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(400),
            ..ReconnectPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
        assert!(!policy.exhausted(100));
        let bounded = ReconnectPolicy {
            max_attempts: Some(3),
            ..policy
        };
        assert!(bounded.exhausted(3));
    }
}
