//! Live channel wire format.
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Inbound frames decode into [`InboundMessage`]; outbound control messages
//! are built from [`OutboundMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TrackingError;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const EVENT_USER_CONNECT: &str = "user-connect";
pub const EVENT_JOIN_TRACKING: &str = "join-tracking";
pub const EVENT_LOCATION_UPDATE: &str = "location-update";
pub const EVENT_STATUS_UPDATE: &str = "status-update";
pub const EVENT_ETA_UPDATE: &str = "eta-update";
pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_ERROR: &str = "error";

// ---------------------------------------------------------------------------
// Shared payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub status: String,
    pub at: DateTime<Utc>,
}

/// Raw envelope as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    UserConnect { user_id: String },
    JoinTracking { order_id: String },
}

impl OutboundMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::UserConnect { .. } => EVENT_USER_CONNECT,
            Self::JoinTracking { .. } => EVENT_JOIN_TRACKING,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            Self::UserConnect { user_id } => serde_json::json!({ "userId": user_id }),
            Self::JoinTracking { order_id } => serde_json::json!({ "orderId": order_id }),
        };
        Envelope {
            event: self.event_name().to_string(),
            data,
        }
    }

    pub fn to_text(&self) -> String {
        // Envelope holds only strings and a json! object; serialization cannot fail.
        serde_json::to_string(&self.to_envelope()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationPayload {
    #[serde(default)]
    order_id: Option<String>,
    location: GeoPoint,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    #[serde(default)]
    order_id: Option<String>,
    status: String,
    #[serde(default)]
    timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtaPayload {
    #[serde(default)]
    order_id: Option<String>,
    #[serde(alias = "estimatedDeliveryTime")]
    estimated_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationPayload {
    #[serde(default)]
    order_id: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    description: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// A transient notification surfaced to observers; never stored in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingNotification {
    pub order_id: Option<String>,
    pub kind: String,
    pub description: String,
    pub extra: Map<String, Value>,
}

/// Typed inbound message union.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    LocationUpdate {
        order_id: Option<String>,
        location: GeoPoint,
    },
    StatusUpdate {
        order_id: Option<String>,
        status: String,
        timeline: Vec<TimelineEntry>,
    },
    EtaUpdate {
        order_id: Option<String>,
        estimated_time: Option<String>,
    },
    Notification(TrackingNotification),
    ServerError {
        message: String,
    },
    /// A well-formed frame with an event name this client does not handle.
    Unknown {
        event: String,
    },
}

impl InboundMessage {
    /// The order the message is addressed to, when the server names one.
    pub fn order_id(&self) -> Option<&str> {
        match self {
            Self::LocationUpdate { order_id, .. }
            | Self::StatusUpdate { order_id, .. }
            | Self::EtaUpdate { order_id, .. } => order_id.as_deref(),
            Self::Notification(n) => n.order_id.as_deref(),
            Self::ServerError { .. } | Self::Unknown { .. } => None,
        }
    }

    pub fn decode(text: &str) -> Result<Self, TrackingError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| TrackingError::Decode(format!("invalid envelope: {e}")))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, TrackingError> {
        let Envelope { event, data } = envelope;
        let decode_err =
            |e: serde_json::Error| TrackingError::Decode(format!("invalid {event} payload: {e}"));

        match event.as_str() {
            EVENT_LOCATION_UPDATE => {
                let p: LocationPayload = serde_json::from_value(data).map_err(decode_err)?;
                Ok(Self::LocationUpdate {
                    order_id: p.order_id,
                    location: p.location,
                })
            }
            EVENT_STATUS_UPDATE => {
                let p: StatusPayload = serde_json::from_value(data).map_err(decode_err)?;
                Ok(Self::StatusUpdate {
                    order_id: p.order_id,
                    status: p.status,
                    timeline: p.timeline,
                })
            }
            EVENT_ETA_UPDATE => {
                let p: EtaPayload = serde_json::from_value(data).map_err(decode_err)?;
                Ok(Self::EtaUpdate {
                    order_id: p.order_id,
                    estimated_time: p.estimated_time,
                })
            }
            EVENT_NOTIFICATION => {
                let p: NotificationPayload = serde_json::from_value(data).map_err(decode_err)?;
                Ok(Self::Notification(TrackingNotification {
                    order_id: p.order_id,
                    kind: p.kind,
                    description: p.description,
                    extra: p.extra,
                }))
            }
            EVENT_ERROR => {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| data.as_str())
                    .unwrap_or("unknown server error")
                    .to_string();
                Ok(Self::ServerError { message })
            }
            _ => Ok(Self::Unknown {
                event: event.clone(),
            }),
        }
    }
}
