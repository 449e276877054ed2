//! Tracking state reducer.
//!
//! `reduce` folds one [`TrackingEvent`] into a [`TrackingSnapshot`] and
//! returns a new snapshot; the input is never mutated. Stale or malformed
//! events come back as [`ReduceOutcome::Ignored`] and are logged, never
//! raised.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::wire::{GeoPoint, InboundMessage, TimelineEntry, TrackingNotification};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
}

/// Full replace-on-write view of one order's tracking state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSnapshot {
    pub order_id: String,
    pub status: Option<String>,
    pub driver_location: Option<GeoPoint>,
    pub estimated_time_text: Option<String>,
    pub timeline: Vec<TimelineEntry>,
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
}

impl TrackingSnapshot {
    /// All-null snapshot used before the first REST fetch resolves.
    pub fn empty(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: None,
            driver_location: None,
            estimated_time_text: None,
            timeline: Vec::new(),
            connection_state: ConnectionState::default(),
            last_error: None,
        }
    }

    /// "Offline or stale" indicator for display surfaces.
    pub fn is_degraded(&self) -> bool {
        !self.connection_state.connected || self.last_error.is_some()
    }

    pub fn latest_timeline_entry(&self) -> Option<&TimelineEntry> {
        self.timeline.last()
    }
}

/// Server-sourced fields returned by `GET /delivery-tracking/{orderId}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    #[serde(default)]
    pub driver_location: Option<GeoPoint>,
    #[serde(default, alias = "estimatedTime")]
    pub estimated_delivery_time: Option<String>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TrackingEvent {
    LocationUpdate(GeoPoint),
    StatusUpdate {
        status: String,
        timeline: Vec<TimelineEntry>,
    },
    EtaUpdate(Option<String>),
    Notification(TrackingNotification),
    /// REST seed or manual/fallback refresh result.
    Seeded(RemoteSnapshot),
    FetchFailed(String),
    ConnectionChanged(bool),
    /// Channel-level failure (connect error or server `error` event).
    ChannelError(String),
}

impl TrackingEvent {
    /// Map a live channel message to a reducer event. Messages that do not
    /// target a single order (server errors, unknown events) map to `None`.
    pub fn from_inbound(message: InboundMessage) -> Option<Self> {
        match message {
            InboundMessage::LocationUpdate { location, .. } => Some(Self::LocationUpdate(location)),
            InboundMessage::StatusUpdate {
                status, timeline, ..
            } => Some(Self::StatusUpdate { status, timeline }),
            InboundMessage::EtaUpdate { estimated_time, .. } => {
                Some(Self::EtaUpdate(estimated_time))
            }
            InboundMessage::Notification(n) => Some(Self::Notification(n)),
            InboundMessage::ServerError { .. } | InboundMessage::Unknown { .. } => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::LocationUpdate(_) => "location-update",
            Self::StatusUpdate { .. } => "status-update",
            Self::EtaUpdate(_) => "eta-update",
            Self::Notification(_) => "notification",
            Self::Seeded(_) => "seeded",
            Self::FetchFailed(_) => "fetch-failed",
            Self::ConnectionChanged(_) => "connection-changed",
            Self::ChannelError(_) => "channel-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReduceOutcome {
    Applied(TrackingSnapshot),
    /// Transient signal for observers; the snapshot is unchanged.
    Notify(TrackingNotification),
    /// The event restates what the snapshot already holds.
    Unchanged,
    Ignored(&'static str),
}

impl ReduceOutcome {
    /// The snapshot to publish, if the reduction produced a new one.
    pub fn into_snapshot(self) -> Option<TrackingSnapshot> {
        match self {
            Self::Applied(s) => Some(s),
            Self::Notify(_) | Self::Unchanged | Self::Ignored(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

fn is_non_decreasing(timeline: &[TimelineEntry]) -> bool {
    timeline.windows(2).all(|w| w[0].at <= w[1].at)
}

pub fn reduce(snapshot: &TrackingSnapshot, event: &TrackingEvent) -> ReduceOutcome {
    let outcome = match event {
        TrackingEvent::LocationUpdate(location) => ReduceOutcome::Applied(TrackingSnapshot {
            driver_location: Some(*location),
            ..snapshot.clone()
        }),

        TrackingEvent::StatusUpdate { status, timeline } => {
            if timeline.is_empty() && !snapshot.timeline.is_empty() {
                ReduceOutcome::Ignored("empty timeline would replace a non-empty one")
            } else if !is_non_decreasing(timeline) {
                ReduceOutcome::Ignored("timeline is not in chronological order")
            } else {
                ReduceOutcome::Applied(TrackingSnapshot {
                    status: Some(status.clone()),
                    timeline: timeline.clone(),
                    ..snapshot.clone()
                })
            }
        }

        TrackingEvent::EtaUpdate(text) => ReduceOutcome::Applied(TrackingSnapshot {
            estimated_time_text: text.clone(),
            ..snapshot.clone()
        }),

        TrackingEvent::Notification(n) => ReduceOutcome::Notify(n.clone()),

        TrackingEvent::Seeded(remote) => {
            if !is_non_decreasing(&remote.timeline) {
                ReduceOutcome::Ignored("fetched timeline is not in chronological order")
            } else {
                ReduceOutcome::Applied(TrackingSnapshot {
                    order_id: snapshot.order_id.clone(),
                    status: remote.status.clone(),
                    driver_location: remote.driver_location,
                    estimated_time_text: remote.estimated_delivery_time.clone(),
                    timeline: remote.timeline.clone(),
                    connection_state: snapshot.connection_state,
                    last_error: None,
                })
            }
        }

        TrackingEvent::FetchFailed(reason) => ReduceOutcome::Applied(TrackingSnapshot {
            last_error: Some(reason.clone()),
            ..snapshot.clone()
        }),

        TrackingEvent::ConnectionChanged(connected) => {
            if snapshot.connection_state.connected == *connected {
                ReduceOutcome::Unchanged
            } else {
                ReduceOutcome::Applied(TrackingSnapshot {
                    connection_state: ConnectionState {
                        connected: *connected,
                    },
                    ..snapshot.clone()
                })
            }
        }

        TrackingEvent::ChannelError(reason) => ReduceOutcome::Applied(TrackingSnapshot {
            last_error: Some(reason.clone()),
            ..snapshot.clone()
        }),
    };

    match &outcome {
        ReduceOutcome::Ignored(reason) => warn!(
            order_id = %snapshot.order_id,
            event = event.kind(),
            reason,
            "Dropped tracking event"
        ),
        ReduceOutcome::Applied(_) => {
            debug!(order_id = %snapshot.order_id, event = event.kind(), "Applied tracking event")
        }
        ReduceOutcome::Notify(_) | ReduceOutcome::Unchanged => {}
    }
    outcome
}
