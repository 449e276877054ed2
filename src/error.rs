//! Error taxonomy for the tracking client and the driver console.
//!
//! Every failure is returned as a value to the caller of the affected
//! operation. The tracking reducer never produces these: malformed or stale
//! events are dropped and logged instead.

use serde::Serialize;

/// Failures of the live-tracking side (channel + snapshot fetch).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackingError {
    /// The live channel failed to open or dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The REST snapshot fetch failed. The retained snapshot is kept.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// A payload could not be decoded.
    #[error("Malformed payload: {0}")]
    Decode(String),

    /// The client was disposed while the operation was in flight.
    #[error("Tracking client disposed")]
    Disposed,
}

/// An id dropped from a bulk request, with the reason it was ineligible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedId {
    pub id: String,
    pub reason: String,
}

/// Failures of the delivery fulfillment side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The requested transition fails the eligibility predicate. Never sent
    /// to the backend.
    #[error("Delivery {id} cannot transition: {reason}")]
    Validation { id: String, reason: String },

    /// A bulk request had no eligible ids left after filtering.
    #[error("No eligible deliveries ({} rejected)", rejected.len())]
    NoEligibleRecords { rejected: Vec<RejectedId> },

    /// A transition into `delivered` was attempted without going through the
    /// confirmation gate.
    #[error("Completing a delivery requires confirmation")]
    ConfirmationRequired,

    /// The backend call itself failed. The local cache is unchanged.
    #[error("Delivery update failed: {0}")]
    Transport(String),
}

impl DeliveryError {
    pub fn validation(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Errors that block the action before any confirmation dialog is shown.
    pub fn blocks_before_confirmation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::NoEligibleRecords { .. }
        )
    }
}

/// Missing or invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
