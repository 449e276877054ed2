//! Connection manager for the live tracking channel.
//!
//! Owns at most one logical connection at a time and fans its lifecycle out
//! to every listener as ordered [`ConnectionEvent`]s. The physical channel
//! sits behind the [`Connector`] trait; [`WsConnector`] is the WebSocket
//! implementation used in production.
//!
//! The manager never retries on its own. Callers decide when to reopen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TrackingError;
use crate::wire::{InboundMessage, OutboundMessage};

/// Buffered lifecycle events per listener before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Default timeout for the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Connector seam
// ---------------------------------------------------------------------------

/// Both directions of an open channel, as text frames.
///
/// `inbound` yields `Err` once for a transport failure and then ends; it ends
/// without an error on a clean close.
pub struct WireChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Result<String, String>>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str, auth_token: &str) -> Result<WireChannel, String>;
}

/// WebSocket connector with the bearer token in the `Authorization` header.
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str, auth_token: &str) -> Result<WireChannel, String> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| format!("Invalid tracking endpoint {endpoint}: {e}"))?;
        if !auth_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {auth_token}"))
                .map_err(|_| "Auth token contains invalid header characters".to_string())?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| format!("Connection to {endpoint} timed out"))?
                .map_err(|e| format!("Cannot reach tracking server at {endpoint}: {e}"))?;

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<String, String>>();

        // Writer: drains outbound frames; closes the socket once the manager
        // drops its sender.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(error = %e, "WebSocket send failed, stopping writer");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forwards text frames until close or error.
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(Ok(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = in_tx.send(Err(e.to_string()));
                        break;
                    }
                }
            }
        });

        Ok(WireChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(String),
    Message(InboundMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

struct ActiveConnection {
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<ConnectionEvent>,
    live: Arc<watch::Sender<bool>>,
    active: Mutex<Option<ActiveConnection>>,
    /// Serialises open/close so two opens cannot interleave.
    lifecycle: tokio::sync::Mutex<()>,
    next_handle: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (live, _) = watch::channel(false);
        Self {
            connector,
            events,
            live: Arc::new(live),
            active: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to lifecycle and message events from now on.
    pub fn listen(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    pub fn live_signal(&self) -> watch::Receiver<bool> {
        self.live.subscribe()
    }

    /// Open the channel, closing any existing connection first.
    pub async fn open(
        &self,
        endpoint: &str,
        auth_token: &str,
    ) -> Result<ConnectionHandle, TrackingError> {
        let _guard = self.lifecycle.lock().await;

        if self.close_current(None).await {
            info!("Closed previous tracking connection before reopening");
        }

        let channel = match self.connector.connect(endpoint, auth_token).await {
            Ok(c) => c,
            Err(reason) => {
                warn!(endpoint, error = %reason, "Tracking channel failed to open");
                let _ = self.events.send(ConnectionEvent::Error(reason.clone()));
                return Err(TrackingError::Connection(reason));
            }
        };

        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        *self.slot() = Some(ActiveConnection {
            handle,
            outbound: channel.outbound,
            cancel: cancel.clone(),
            reader: None,
        });

        // `Connected` goes out before the reader can forward any message.
        self.live.send_replace(true);
        let _ = self.events.send(ConnectionEvent::Connected);
        info!(handle = handle.0, endpoint, "Tracking channel connected");

        let reader = tokio::spawn(pump_inbound(
            channel.inbound,
            cancel,
            self.events.clone(),
            self.live.clone(),
            handle,
        ));
        if let Some(active) = self.slot().as_mut().filter(|a| a.handle == handle) {
            active.reader = Some(reader);
        }

        Ok(handle)
    }

    /// Close the connection identified by `handle`. Stale handles are ignored.
    pub async fn close(&self, handle: ConnectionHandle) {
        let _guard = self.lifecycle.lock().await;
        if !self.close_current(Some(handle)).await {
            debug!(handle = handle.0, "Close ignored for stale connection handle");
        }
    }

    /// Close whatever connection is open.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.close_current(None).await;
    }

    async fn close_current(&self, only: Option<ConnectionHandle>) -> bool {
        let active = {
            let mut slot = self.slot();
            match slot.as_ref() {
                Some(a) if only.map_or(true, |h| h == a.handle) => slot.take(),
                _ => None,
            }
        };
        let Some(mut active) = active else {
            return false;
        };

        active.cancel.cancel();
        if let Some(reader) = active.reader.take() {
            let _ = reader.await;
        }
        drop(active.outbound);

        if self.live.send_replace(false) {
            let _ = self.events.send(ConnectionEvent::Disconnected);
            info!(handle = active.handle.0, "Tracking channel closed");
        }
        true
    }

    /// Send a control message over the open channel.
    pub fn send(&self, message: &OutboundMessage) -> Result<(), TrackingError> {
        if !self.is_live() {
            return Err(TrackingError::Connection("Tracking channel is not connected".into()));
        }
        let slot = self.slot();
        let active = slot
            .as_ref()
            .ok_or_else(|| TrackingError::Connection("Tracking channel is not open".into()))?;
        active
            .outbound
            .send(message.to_text())
            .map_err(|_| TrackingError::Connection("Tracking channel writer has stopped".into()))?;
        debug!(event = message.event_name(), "Sent control message");
        Ok(())
    }
}

async fn pump_inbound(
    mut inbound: mpsc::UnboundedReceiver<Result<String, String>>,
    cancel: CancellationToken,
    events: broadcast::Sender<ConnectionEvent>,
    live: Arc<watch::Sender<bool>>,
    handle: ConnectionHandle,
) {
    loop {
        tokio::select! {
            biased;
            // close_current reports the disconnect itself.
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(Ok(text)) => match InboundMessage::decode(&text) {
                    Ok(InboundMessage::ServerError { message }) => {
                        warn!(handle = handle.0, error = %message, "Tracking server reported an error");
                        let _ = events.send(ConnectionEvent::Error(message));
                    }
                    Ok(message) => {
                        let _ = events.send(ConnectionEvent::Message(message));
                    }
                    Err(e) => warn!(handle = handle.0, error = %e, "Dropping malformed frame"),
                },
                Some(Err(reason)) => {
                    warn!(handle = handle.0, error = %reason, "Tracking channel transport error");
                    let _ = events.send(ConnectionEvent::Error(reason));
                }
                None => {
                    if live.send_replace(false) {
                        info!(handle = handle.0, "Tracking channel dropped by remote");
                        let _ = events.send(ConnectionEvent::Disconnected);
                    }
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory connector for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Server end of an in-memory channel.
    pub struct ServerEnd {
        pub to_client: mpsc::UnboundedSender<Result<String, String>>,
        pub from_client: mpsc::UnboundedReceiver<String>,
    }

    impl ServerEnd {
        pub fn push(&self, text: &str) {
            let _ = self.to_client.send(Ok(text.to_string()));
        }

        /// Drain everything the client has sent so far.
        pub fn drain_sent(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(text) = self.from_client.try_recv() {
                out.push(text);
            }
            out
        }
    }

    /// Hands out in-memory channels; refuses connections when `refusals` is
    /// non-empty.
    #[derive(Default)]
    pub struct MemoryConnector {
        refusals: Mutex<VecDeque<String>>,
        /// Connections to accept and close at once, before the client reads.
        hang_ups: Mutex<u32>,
        servers: Mutex<Option<mpsc::UnboundedSender<ServerEnd>>>,
        pub attempts: AtomicU64,
    }

    impl MemoryConnector {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Self {
                servers: Mutex::new(Some(tx)),
                ..Self::default()
            };
            (Arc::new(connector), rx)
        }

        pub fn refuse_next(&self, reason: &str) {
            self.refusals.lock().unwrap().push_back(reason.to_string());
        }

        pub fn hang_up_next(&self, count: u32) {
            *self.hang_ups.lock().unwrap() += count;
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _endpoint: &str, _auth_token: &str) -> Result<WireChannel, String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(reason) = self.refusals.lock().unwrap().pop_front() {
                return Err(reason);
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            {
                let mut hang_ups = self.hang_ups.lock().unwrap();
                if *hang_ups > 0 {
                    *hang_ups -= 1;
                    return Ok(WireChannel {
                        outbound: out_tx,
                        inbound: in_rx,
                    });
                }
            }
            if let Some(servers) = self.servers.lock().unwrap().as_ref() {
                let _ = servers.send(ServerEnd {
                    to_client: in_tx,
                    from_client: out_rx,
                });
            }
            Ok(WireChannel {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}
