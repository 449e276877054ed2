//! Driver console: the delivery engine behind the confirmation gate.
//!
//! Every intent goes through [`DriverConsole::submit`]. Transitions that need
//! no confirmation are applied at once; completions come back as
//! [`ConsoleStep::NeedsConfirmation`] and are finished by
//! [`DriverConsole::confirm`].

use std::sync::Arc;

use tracing::info;

use crate::confirmation::{ConfirmationGate, ConfirmationRequest, Resolution};
use crate::deliveries::{
    BulkOutcome, DailyDeliveriesQuery, DeliveryBackend, DeliveryRecord, DeliveryStats,
    DeliveryStatus, DeliveryStatusEngine,
};
use crate::error::DeliveryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Move one delivery to `target`.
    SetStatus {
        id: String,
        target: DeliveryStatus,
        notes: Option<String>,
    },
    /// Move every selected delivery to `target`.
    SetSelected { target: DeliveryStatus },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleStep {
    Applied(DeliveryRecord),
    BulkApplied(BulkOutcome),
    NeedsConfirmation(ConfirmationRequest),
}

pub struct DriverConsole {
    engine: DeliveryStatusEngine,
    gate: ConfirmationGate,
}

impl DriverConsole {
    pub fn new(backend: Arc<dyn DeliveryBackend>, driver_id: impl Into<String>) -> Self {
        Self {
            engine: DeliveryStatusEngine::new(backend, driver_id),
            gate: ConfirmationGate::new(),
        }
    }

    pub fn engine(&self) -> &DeliveryStatusEngine {
        &self.engine
    }

    /// Selection changes go straight to the engine.
    pub fn engine_mut(&mut self) -> &mut DeliveryStatusEngine {
        &mut self.engine
    }

    pub fn pending_confirmation(&self) -> Option<&ConfirmationRequest> {
        self.gate.pending()
    }

    /// Reload the day's deliveries. A pending confirmation refers to the old
    /// list and is dropped.
    pub async fn load(&mut self, query: &DailyDeliveriesQuery) -> Result<DeliveryStats, DeliveryError> {
        if self.gate.cancel() {
            info!("Dropped pending confirmation on reload");
        }
        self.engine.load(query).await
    }

    pub async fn submit(&mut self, intent: Intent) -> Result<ConsoleStep, DeliveryError> {
        match intent {
            Intent::SetStatus { id, target, notes } if target.requires_confirmation() => {
                let request = self.gate.request_single(&self.engine, &id, notes)?;
                Ok(ConsoleStep::NeedsConfirmation(request.clone()))
            }
            Intent::SetStatus { id, target, notes } => self
                .engine
                .apply_single(&id, target, notes)
                .await
                .map(ConsoleStep::Applied),
            Intent::SetSelected { target } if target.requires_confirmation() => {
                let request = self.gate.request_bulk(&self.engine)?;
                Ok(ConsoleStep::NeedsConfirmation(request.clone()))
            }
            Intent::SetSelected { target } => {
                let ids = self.engine.selected_ids();
                self.engine
                    .apply_bulk(&ids, target)
                    .await
                    .map(ConsoleStep::BulkApplied)
            }
        }
    }

    /// Answer the pending confirmation.
    pub async fn confirm(&mut self, yes: bool) -> Result<Resolution, DeliveryError> {
        self.gate.resolve(yes, &mut self.engine).await
    }

    pub fn stats(&self) -> DeliveryStats {
        self.engine.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliveries::testing::{pending, FakeBackend};
    use chrono::NaiveDate;

    async fn console_with(records: Vec<DeliveryRecord>) -> (DriverConsole, Arc<FakeBackend>) {
        let backend = FakeBackend::with_records(records);
        let mut console = DriverConsole::new(backend.clone(), "driver-1");
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        console.load(&DailyDeliveriesQuery::for_date(date)).await.unwrap();
        (console, backend)
    }

    #[tokio::test]
    async fn test_non_terminal_status_applies_without_confirmation() {
        let (mut console, backend) = console_with(vec![pending("A")]).await;
        let step = console
            .submit(Intent::SetStatus {
                id: "A".into(),
                target: DeliveryStatus::Customized,
                notes: None,
            })
            .await
            .unwrap();
        match step {
            ConsoleStep::Applied(r) => assert_eq!(r.delivery_status, DeliveryStatus::Customized),
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_selected_goes_through_gate() {
        let (mut console, backend) = console_with(vec![pending("A"), pending("B")]).await;
        assert_eq!(console.engine_mut().select_all_eligible(), 2);

        let step = console
            .submit(Intent::SetSelected {
                target: DeliveryStatus::Delivered,
            })
            .await
            .unwrap();
        let ConsoleStep::NeedsConfirmation(request) = step else {
            panic!("expected a confirmation request");
        };
        assert_eq!(request.count, 2);
        assert_eq!(backend.call_count(), 0);

        match console.confirm(true).await.unwrap() {
            Resolution::BulkCompleted(outcome) => assert_eq!(outcome.applied, 2),
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert_eq!(console.stats().delivered, 2);
        assert!(console.engine().selected_ids().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_skip_applies_directly() {
        let (mut console, backend) = console_with(vec![pending("A"), pending("B")]).await;
        console.engine_mut().set_selected("B", true);
        let step = console
            .submit(Intent::SetSelected {
                target: DeliveryStatus::Skipped,
            })
            .await
            .unwrap();
        match step {
            ConsoleStep::BulkApplied(outcome) => assert_eq!(outcome.applied_ids, vec!["B"]),
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(backend.bulk_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_drops_pending_confirmation() {
        let (mut console, _backend) = console_with(vec![pending("A")]).await;
        console
            .submit(Intent::SetStatus {
                id: "A".into(),
                target: DeliveryStatus::Delivered,
                notes: None,
            })
            .await
            .unwrap();
        assert!(console.pending_confirmation().is_some());

        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        console.load(&DailyDeliveriesQuery::for_date(date)).await.unwrap();
        assert!(console.pending_confirmation().is_none());
        assert_eq!(console.confirm(true).await.unwrap(), Resolution::NothingPending);
    }
}
