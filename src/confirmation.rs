//! Human confirmation before completing deliveries.
//!
//! Marking a delivery `delivered` is irreversible, so the console never does
//! it directly. It asks the gate for a [`ConfirmationRequest`], shows it,
//! and resolves it exactly once. The action is captured when the request is
//! created: a bulk request completes the ids selected at that moment, even if
//! the selection changes while the dialog is open.

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::deliveries::{BulkOutcome, DeliveryRecord, DeliveryStatus, DeliveryStatusEngine};
use crate::error::{DeliveryError, RejectedId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationMode {
    Single,
    Bulk,
}

/// What a confirmed request will complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationPayload {
    Single { id: String, notes: Option<String> },
    Bulk { ids: Vec<String> },
}

impl ConfirmationPayload {
    pub fn mode(&self) -> ConfirmationMode {
        match self {
            Self::Single { .. } => ConfirmationMode::Single,
            Self::Bulk { .. } => ConfirmationMode::Bulk,
        }
    }

    fn count(&self) -> usize {
        match self {
            Self::Single { .. } => 1,
            Self::Bulk { ids } => ids.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub id: Uuid,
    pub mode: ConfirmationMode,
    pub count: usize,
    /// A representative record for the dialog.
    pub sample_details: Option<DeliveryRecord>,
    /// Selected ids left out because they cannot be completed.
    pub rejected: Vec<RejectedId>,
    #[serde(skip)]
    payload: ConfirmationPayload,
}

impl ConfirmationRequest {
    pub fn payload(&self) -> &ConfirmationPayload {
        &self.payload
    }

    /// One-line prompt for text surfaces.
    pub fn prompt(&self) -> String {
        match self.mode {
            ConfirmationMode::Single => {
                let name = self
                    .sample_details
                    .as_ref()
                    .and_then(|r| r.details.get("customerName"))
                    .and_then(|v| v.as_str());
                match (name, &self.payload) {
                    (Some(name), _) => format!("Mark the delivery for {name} as delivered?"),
                    (None, ConfirmationPayload::Single { id, .. }) => {
                        format!("Mark delivery {id} as delivered?")
                    }
                    (None, ConfirmationPayload::Bulk { .. }) => "Mark this delivery as delivered?".into(),
                }
            }
            ConfirmationMode::Bulk => {
                let mut text = format!("Mark {} deliveries as delivered?", self.count);
                if !self.rejected.is_empty() {
                    text.push_str(&format!(" ({} selected cannot be completed)", self.rejected.len()));
                }
                text
            }
        }
    }
}

/// Outcome of [`ConfirmationGate::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    NothingPending,
    Cancelled,
    Completed(DeliveryRecord),
    BulkCompleted(BulkOutcome),
}

/// Holds at most one pending request.
#[derive(Debug, Default)]
pub struct ConfirmationGate {
    pending: Option<ConfirmationRequest>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<&ConfirmationRequest> {
        self.pending.as_ref()
    }

    /// Open a request for `payload`, replacing any pending one. No
    /// validation happens here; see [`request_single`](Self::request_single)
    /// and [`request_bulk`](Self::request_bulk).
    pub fn request_confirmation(
        &mut self,
        payload: ConfirmationPayload,
        sample_details: Option<DeliveryRecord>,
        rejected: Vec<RejectedId>,
    ) -> &ConfirmationRequest {
        if let Some(previous) = self.pending.take() {
            debug!(request = %previous.id, "Replacing pending confirmation");
        }
        let request = ConfirmationRequest {
            id: Uuid::new_v4(),
            mode: payload.mode(),
            count: payload.count(),
            sample_details,
            rejected,
            payload,
        };
        debug!(request = %request.id, mode = ?request.mode, count = request.count, "Confirmation requested");
        self.pending.insert(request)
    }

    /// Validate completing one delivery, then open its request.
    pub fn request_single(
        &mut self,
        engine: &DeliveryStatusEngine,
        id: &str,
        notes: Option<String>,
    ) -> Result<&ConfirmationRequest, DeliveryError> {
        let record = engine.validate_single(id, DeliveryStatus::Delivered)?.clone();
        let payload = ConfirmationPayload::Single {
            id: id.to_string(),
            notes,
        };
        Ok(self.request_confirmation(payload, Some(record), Vec::new()))
    }

    /// Validate completing the current selection, then open a request for
    /// the eligible part of it.
    pub fn request_bulk(
        &mut self,
        engine: &DeliveryStatusEngine,
    ) -> Result<&ConfirmationRequest, DeliveryError> {
        let selected = engine.selected_ids();
        let prepared = engine.prepare_bulk(&selected, DeliveryStatus::Delivered)?;
        let ids: Vec<String> = prepared.ids.into_iter().collect();
        let sample = ids.first().and_then(|id| engine.get(id)).cloned();
        Ok(self.request_confirmation(ConfirmationPayload::Bulk { ids }, sample, prepared.rejected))
    }

    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Resolve the pending request. It is cleared whatever the outcome.
    pub async fn resolve(
        &mut self,
        confirm: bool,
        engine: &mut DeliveryStatusEngine,
    ) -> Result<Resolution, DeliveryError> {
        let Some(request) = self.pending.take() else {
            return Ok(Resolution::NothingPending);
        };
        if !confirm {
            info!(request = %request.id, "Delivery completion cancelled");
            return Ok(Resolution::Cancelled);
        }

        info!(request = %request.id, mode = ?request.mode, count = request.count, "Delivery completion confirmed");
        match request.payload {
            ConfirmationPayload::Single { id, notes } => engine
                .apply_single_confirmed(&id, DeliveryStatus::Delivered, notes)
                .await
                .map(Resolution::Completed),
            ConfirmationPayload::Bulk { ids } => engine
                .apply_bulk_confirmed(&ids, DeliveryStatus::Delivered)
                .await
                .map(Resolution::BulkCompleted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliveries::testing::{pending, FakeBackend};
    use crate::deliveries::{DailyDeliveriesQuery, Shift};
    use chrono::NaiveDate;
    use std::sync::Arc;

    async fn engine_with(
        records: Vec<DeliveryRecord>,
    ) -> (DeliveryStatusEngine, Arc<FakeBackend>) {
        let backend = FakeBackend::with_records(records);
        let mut engine = DeliveryStatusEngine::new(backend.clone(), "driver-1");
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        engine.load(&DailyDeliveriesQuery::for_date(date)).await.unwrap();
        (engine, backend)
    }

    #[tokio::test]
    async fn test_bulk_confirmation_completes_selected_ids_in_one_call() {
        let (mut engine, backend) =
            engine_with(vec![pending("A"), pending("B"), pending("C"), pending("D")]).await;
        for id in ["A", "B", "C"] {
            engine.set_selected(id, true);
        }

        let mut gate = ConfirmationGate::new();
        let request = gate.request_bulk(&engine).unwrap();
        assert_eq!(request.mode, ConfirmationMode::Bulk);
        assert_eq!(request.count, 3);
        assert_eq!(request.prompt(), "Mark 3 deliveries as delivered?");
        assert_eq!(backend.call_count(), 0);

        let resolution = gate.resolve(true, &mut engine).await.unwrap();
        let calls = backend.bulk_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].delivery_ids, vec!["A", "B", "C"]);
        assert_eq!(calls[0].status, DeliveryStatus::Delivered);
        match resolution {
            Resolution::BulkCompleted(outcome) => assert_eq!(outcome.applied, 3),
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert!(gate.pending().is_none());
        assert_eq!(engine.get("D").unwrap().delivery_status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn test_bulk_request_uses_selection_at_request_time() {
        let (mut engine, backend) = engine_with(vec![pending("A"), pending("B")]).await;
        engine.set_selected("A", true);

        let mut gate = ConfirmationGate::new();
        gate.request_bulk(&engine).unwrap();
        engine.set_selected("B", true);

        gate.resolve(true, &mut engine).await.unwrap();
        assert_eq!(backend.bulk_calls.lock().unwrap()[0].delivery_ids, vec!["A"]);
        assert_eq!(engine.get("B").unwrap().delivery_status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_clears_request_without_calls() {
        let (mut engine, backend) = engine_with(vec![pending("A")]).await;
        let mut gate = ConfirmationGate::new();
        gate.request_single(&engine, "A", None).unwrap();

        assert_eq!(gate.resolve(false, &mut engine).await.unwrap(), Resolution::Cancelled);
        assert!(gate.pending().is_none());
        assert_eq!(
            gate.resolve(true, &mut engine).await.unwrap(),
            Resolution::NothingPending
        );
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_single_confirmation_applies_with_notes() {
        let mut record = pending("A");
        record
            .details
            .insert("customerName".into(), serde_json::json!("Maria"));
        let (mut engine, backend) = engine_with(vec![record]).await;

        let mut gate = ConfirmationGate::new();
        let request = gate
            .request_single(&engine, "A", Some("left at door".into()))
            .unwrap();
        assert_eq!(request.count, 1);
        assert_eq!(request.prompt(), "Mark the delivery for Maria as delivered?");

        match gate.resolve(true, &mut engine).await.unwrap() {
            Resolution::Completed(r) => {
                assert_eq!(r.delivery_status, DeliveryStatus::Delivered);
                assert!(r.delivered_at.is_some());
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        let calls = backend.single_calls.lock().unwrap();
        assert_eq!(calls[0].notes.as_deref(), Some("left at door"));
        assert!(calls[0].delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_ineligible_requests_are_blocked_before_a_dialog() {
        let mut skipped = pending("A");
        skipped.is_skipped = true;
        let (mut engine, _backend) = engine_with(vec![
            skipped,
            DeliveryRecord::new("B", Shift::Evening, DeliveryStatus::Delivered),
        ])
        .await;
        let mut gate = ConfirmationGate::new();

        let err = gate.request_single(&engine, "B", None).unwrap_err();
        assert!(matches!(err, DeliveryError::Validation { .. }));

        engine.set_selected("A", true);
        engine.set_selected("B", true);
        let err = gate.request_bulk(&engine).unwrap_err();
        assert!(matches!(err, DeliveryError::NoEligibleRecords { .. }));
        assert!(err.blocks_before_confirmation());
        assert!(gate.pending().is_none());
    }

    #[tokio::test]
    async fn test_new_request_replaces_pending_one() {
        let (engine, _backend) = engine_with(vec![pending("A"), pending("B")]).await;
        let mut gate = ConfirmationGate::new();
        let first = gate.request_single(&engine, "A", None).unwrap().id;
        let second = gate.request_single(&engine, "B", None).unwrap().id;
        assert_ne!(first, second);
        assert_eq!(gate.pending().map(|r| r.id), Some(second));
        assert_eq!(
            gate.pending().unwrap().payload(),
            &ConfirmationPayload::Single {
                id: "B".into(),
                notes: None
            }
        );
    }
}
