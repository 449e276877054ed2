//! Delivery fulfillment state machine.
//!
//! Holds the driver's local cache of delivery records, decides which status
//! transitions are legal, and applies single or bulk transitions through the
//! [`DeliveryBackend`]. The backend response is authoritative: on success the
//! cached records are replaced with what the server returned; on failure the
//! cache is left untouched.
//!
//! Transitions into `delivered` must go through the confirmation gate. The
//! public `apply_*` methods refuse them with
//! [`DeliveryError::ConfirmationRequired`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, RejectedId};

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shift {
    Morning,
    Evening,
}

impl Shift {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Evening => "evening",
        }
    }
}

impl FromStr for Shift {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "morning" => Ok(Self::Morning),
            "evening" => Ok(Self::Evening),
            other => Err(format!("Unknown shift: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    #[serde(alias = "completed")]
    Delivered,
    Skipped,
    Replaced,
    Customized,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Skipped => "skipped",
            Self::Replaced => "replaced",
            Self::Customized => "customized",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Skipped)
    }

    /// Targets that are irreversible and need a human confirmation first.
    pub fn requires_confirmation(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "delivered" | "completed" => Ok(Self::Delivered),
            "skipped" => Ok(Self::Skipped),
            "replaced" => Ok(Self::Replaced),
            "customized" => Ok(Self::Customized),
            other => Err(format!("Unknown delivery status: {other}")),
        }
    }
}

/// One delivery as the backend reports it, plus local selection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: String,
    pub shift: Shift,
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub is_skipped: bool,
    #[serde(default)]
    pub is_replaced: bool,
    #[serde(default)]
    pub is_customized: bool,
    /// Backend eligibility for completion; absent means not forbidden.
    #[serde(default)]
    pub can_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Remaining backend fields (customer, address, items...), kept verbatim.
    #[serde(flatten)]
    pub details: Map<String, Value>,
    /// UI selection; never persisted.
    #[serde(skip)]
    pub selected: bool,
}

impl DeliveryRecord {
    pub fn new(id: impl Into<String>, shift: Shift, status: DeliveryStatus) -> Self {
        Self {
            id: id.into(),
            shift,
            delivery_status: status,
            is_skipped: status == DeliveryStatus::Skipped,
            is_replaced: status == DeliveryStatus::Replaced,
            is_customized: status == DeliveryStatus::Customized,
            can_complete: None,
            notes: None,
            delivered_at: None,
            details: Map::new(),
            selected: false,
        }
    }

    /// The record as it would look after `target` was applied locally. Used
    /// only when the backend confirms a change without echoing the records.
    fn transitioned(&self, target: DeliveryStatus, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.delivery_status = target;
        match target {
            DeliveryStatus::Delivered => next.delivered_at = Some(at),
            DeliveryStatus::Skipped => {
                next.is_skipped = true;
                next.can_complete = Some(false);
            }
            DeliveryStatus::Replaced => next.is_replaced = true,
            DeliveryStatus::Customized => next.is_customized = true,
            DeliveryStatus::Pending => {}
        }
        next.selected = false;
        next
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Why `record` may not move to `target`, or `Ok(())` if it may.
pub fn check_transition(record: &DeliveryRecord, target: DeliveryStatus) -> Result<(), String> {
    if record.delivery_status.is_terminal() {
        return Err(format!("already {}", record.delivery_status));
    }
    if record.delivery_status == target {
        return Err(format!("already {target}"));
    }
    match target {
        DeliveryStatus::Pending => Err("cannot move back to pending".into()),
        DeliveryStatus::Delivered => {
            if record.is_skipped {
                Err("delivery was skipped".into())
            } else if record.can_complete == Some(false) {
                Err("not eligible for completion".into())
            } else {
                Ok(())
            }
        }
        DeliveryStatus::Skipped | DeliveryStatus::Replaced | DeliveryStatus::Customized => {
            if record.delivery_status == DeliveryStatus::Pending {
                Ok(())
            } else {
                Err(format!("only pending deliveries can be {target}"))
            }
        }
    }
}

pub fn can_transition(record: &DeliveryRecord, target: DeliveryStatus) -> bool {
    check_transition(record, target).is_ok()
}

/// Candidate for "select all": still open for completion.
fn is_selectable(record: &DeliveryRecord) -> bool {
    matches!(
        record.delivery_status,
        DeliveryStatus::Pending | DeliveryStatus::Replaced | DeliveryStatus::Customized
    ) && record.can_complete != Some(false)
}

// ---------------------------------------------------------------------------
// Requests & outcomes
// ---------------------------------------------------------------------------

/// A bulk transition after eligibility filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkTransitionRequest {
    pub ids: BTreeSet<String>,
    pub target_status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    pub rejected: Vec<RejectedId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    pub delivery_id: String,
    pub status: DeliveryStatus,
    pub notes: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub driver_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatusUpdateRequest {
    pub delivery_ids: Vec<String>,
    pub status: DeliveryStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub driver_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatusUpdateResponse {
    #[serde(default)]
    pub applied_count: Option<usize>,
    #[serde(default)]
    pub records: Vec<DeliveryRecord>,
}

/// Result of a bulk transition. `applied < requested` is a partial success,
/// not an error; the ids that were applied must not be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub requested: usize,
    pub applied: usize,
    pub applied_ids: Vec<String>,
    pub rejected: Vec<RejectedId>,
}

impl BulkOutcome {
    pub fn is_partial(&self) -> bool {
        self.applied < self.requested
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub pending: usize,
    #[serde(default)]
    pub delivered: usize,
    #[serde(default)]
    pub skipped: usize,
    #[serde(default)]
    pub replaced: usize,
    #[serde(default)]
    pub morning: usize,
    #[serde(default)]
    pub evening: usize,
}

impl DeliveryStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DeliveryRecord>) -> Self {
        let mut stats = Self::default();
        for r in records {
            stats.total += 1;
            // `customized` has no counter of its own and is still open, so it
            // counts as pending; `replaced` keeps its own bucket.
            match r.delivery_status {
                DeliveryStatus::Pending | DeliveryStatus::Customized => stats.pending += 1,
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Skipped => stats.skipped += 1,
                DeliveryStatus::Replaced => stats.replaced += 1,
            }
            match r.shift {
                Shift::Morning => stats.morning += 1,
                Shift::Evening => stats.evening += 1,
            }
        }
        stats
    }
}

/// Parameters of the driver daily-deliveries query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyDeliveriesQuery {
    pub date: NaiveDate,
    pub shift: Option<Shift>,
    pub status: Option<DeliveryStatus>,
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
}

impl DailyDeliveriesQuery {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date,
            shift: None,
            status: None,
            search: None,
            page: 1,
            limit: 100,
        }
    }

    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("date", self.date.format("%Y-%m-%d").to_string())];
        if let Some(shift) = self.shift {
            pairs.push(("shift", shift.as_str().to_string()));
        }
        if let Some(status) = self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            pairs.push(("search", search.to_string()));
        }
        pairs.push(("page", self.page.max(1).to_string()));
        pairs.push(("limit", self.limit.clamp(1, 500).to_string()));
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct DailyDeliveries {
    #[serde(default)]
    pub data: Vec<DeliveryRecord>,
    #[serde(default)]
    pub stats: DeliveryStats,
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DeliveryBackend: Send + Sync {
    async fn update_status(
        &self,
        request: &StatusUpdateRequest,
    ) -> Result<DeliveryRecord, DeliveryError>;

    async fn bulk_update_status(
        &self,
        request: &BulkStatusUpdateRequest,
    ) -> Result<BulkStatusUpdateResponse, DeliveryError>;

    async fn daily_deliveries(
        &self,
        query: &DailyDeliveriesQuery,
    ) -> Result<DailyDeliveries, DeliveryError>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DeliveryStatusEngine {
    backend: Arc<dyn DeliveryBackend>,
    driver_id: String,
    records: HashMap<String, DeliveryRecord>,
    /// Server order of the cached ids.
    order: Vec<String>,
    server_stats: Option<DeliveryStats>,
}

impl DeliveryStatusEngine {
    pub fn new(backend: Arc<dyn DeliveryBackend>, driver_id: impl Into<String>) -> Self {
        Self {
            backend,
            driver_id: driver_id.into(),
            records: HashMap::new(),
            order: Vec::new(),
            server_stats: None,
        }
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    // -- Cache --------------------------------------------------------------

    /// Replace the cache from the daily-deliveries query.
    pub async fn load(&mut self, query: &DailyDeliveriesQuery) -> Result<DeliveryStats, DeliveryError> {
        let response = self.backend.daily_deliveries(query).await?;
        info!(
            date = %query.date,
            shift = query.shift.map(|s| s.as_str()).unwrap_or("all"),
            count = response.data.len(),
            "Loaded driver deliveries"
        );
        self.replace_records(response.data);
        self.server_stats = Some(response.stats.clone());
        Ok(response.stats)
    }

    pub fn replace_records(&mut self, records: Vec<DeliveryRecord>) {
        self.records.clear();
        self.order.clear();
        for record in records {
            if self.records.contains_key(&record.id) {
                warn!(id = %record.id, "Duplicate delivery id in response; keeping the first");
                continue;
            }
            self.order.push(record.id.clone());
            self.records.insert(record.id.clone(), record);
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &DeliveryRecord> + '_ {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&DeliveryRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Counters recomputed from the cache, which reflects every transition
    /// applied since the last load.
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats::from_records(self.records())
    }

    pub fn server_stats(&self) -> Option<&DeliveryStats> {
        self.server_stats.as_ref()
    }

    /// Replace a cached record with the server's version. Selection is
    /// cleared; unknown ids are appended.
    fn reconcile(&mut self, mut record: DeliveryRecord) {
        record.selected = false;
        if !self.records.contains_key(&record.id) {
            self.order.push(record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    // -- Eligibility --------------------------------------------------------

    pub fn can_transition(&self, id: &str, target: DeliveryStatus) -> bool {
        self.check(id, target).is_ok()
    }

    fn check(&self, id: &str, target: DeliveryStatus) -> Result<&DeliveryRecord, DeliveryError> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| DeliveryError::validation(id, "not in the current delivery list"))?;
        check_transition(record, target).map_err(|reason| DeliveryError::validation(id, reason))?;
        Ok(record)
    }

    /// Validate a single transition without applying it.
    pub fn validate_single(&self, id: &str, target: DeliveryStatus) -> Result<&DeliveryRecord, DeliveryError> {
        self.check(id, target)
    }

    /// Filter `ids` down to the eligible ones, recording why each of the
    /// others was dropped. Fails with `NoEligibleRecords` when none remain.
    pub fn prepare_bulk(
        &self,
        ids: &[String],
        target: DeliveryStatus,
    ) -> Result<BulkTransitionRequest, DeliveryError> {
        let mut eligible = BTreeSet::new();
        let mut rejected = Vec::new();
        for id in ids {
            if eligible.contains(id) {
                continue;
            }
            match self.check(id, target) {
                Ok(_) => {
                    eligible.insert(id.clone());
                }
                Err(DeliveryError::Validation { id, reason }) => {
                    rejected.push(RejectedId { id, reason });
                }
                Err(other) => return Err(other),
            }
        }

        if eligible.is_empty() {
            return Err(DeliveryError::NoEligibleRecords { rejected });
        }
        for r in &rejected {
            debug!(id = %r.id, reason = %r.reason, target = %target, "Dropped ineligible delivery from bulk request");
        }
        Ok(BulkTransitionRequest {
            ids: eligible,
            target_status: target,
            timestamp: Utc::now(),
            rejected,
        })
    }

    // -- Transitions --------------------------------------------------------

    /// Apply one transition. `delivered` must go through the confirmation gate.
    pub async fn apply_single(
        &mut self,
        id: &str,
        target: DeliveryStatus,
        notes: Option<String>,
    ) -> Result<DeliveryRecord, DeliveryError> {
        self.check(id, target)?;
        if target.requires_confirmation() {
            return Err(DeliveryError::ConfirmationRequired);
        }
        self.execute_single(id, target, notes).await
    }

    pub(crate) async fn apply_single_confirmed(
        &mut self,
        id: &str,
        target: DeliveryStatus,
        notes: Option<String>,
    ) -> Result<DeliveryRecord, DeliveryError> {
        self.execute_single(id, target, notes).await
    }

    async fn execute_single(
        &mut self,
        id: &str,
        target: DeliveryStatus,
        notes: Option<String>,
    ) -> Result<DeliveryRecord, DeliveryError> {
        self.check(id, target)?;

        let now = Utc::now();
        let request = StatusUpdateRequest {
            delivery_id: id.to_string(),
            status: target,
            notes: notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            delivered_at: (target == DeliveryStatus::Delivered).then_some(now),
            driver_id: self.driver_id.clone(),
        };

        let record = match self.backend.update_status(&request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(id, target = %target, error = %e, "Delivery status update failed");
                return Err(e);
            }
        };
        if record.id != id {
            warn!(requested = id, returned = %record.id, "Backend returned a different delivery id");
            return Err(DeliveryError::Transport(format!(
                "Server answered for delivery {} instead of {id}; reload the list",
                record.id
            )));
        }

        info!(id, target = %target, "Delivery status updated");
        self.reconcile(record.clone());
        Ok(record)
    }

    /// Apply one transition to many records. `delivered` must go through the
    /// confirmation gate.
    pub async fn apply_bulk(
        &mut self,
        ids: &[String],
        target: DeliveryStatus,
    ) -> Result<BulkOutcome, DeliveryError> {
        let request = self.prepare_bulk(ids, target)?;
        if target.requires_confirmation() {
            return Err(DeliveryError::ConfirmationRequired);
        }
        self.execute_bulk(request).await
    }

    pub(crate) async fn apply_bulk_confirmed(
        &mut self,
        ids: &[String],
        target: DeliveryStatus,
    ) -> Result<BulkOutcome, DeliveryError> {
        let request = self.prepare_bulk(ids, target)?;
        self.execute_bulk(request).await
    }

    async fn execute_bulk(&mut self, request: BulkTransitionRequest) -> Result<BulkOutcome, DeliveryError> {
        let target = request.target_status;
        let requested_ids: Vec<String> = request.ids.iter().cloned().collect();
        let body = BulkStatusUpdateRequest {
            delivery_ids: requested_ids.clone(),
            status: target,
            delivered_at: (target == DeliveryStatus::Delivered).then_some(request.timestamp),
            driver_id: self.driver_id.clone(),
        };

        let response = match self.backend.bulk_update_status(&body).await {
            Ok(r) => r,
            Err(e) => {
                warn!(count = requested_ids.len(), target = %target, error = %e, "Bulk delivery update failed");
                return Err(e);
            }
        };

        let requested = requested_ids.len();
        let applied_ids: Vec<String> = if !response.records.is_empty() {
            let ids: Vec<String> = response.records.iter().map(|r| r.id.clone()).collect();
            for record in response.records {
                self.reconcile(record);
            }
            ids
        } else if response.applied_count.map_or(true, |n| n >= requested) {
            // Full application confirmed without records; mirror it locally.
            for id in &requested_ids {
                if let Some(next) = self
                    .records
                    .get(id)
                    .map(|r| r.transitioned(target, request.timestamp))
                {
                    self.reconcile(next);
                }
            }
            requested_ids.clone()
        } else {
            warn!(
                requested,
                applied = response.applied_count.unwrap_or(0),
                "Partial bulk update without records; reload to see which deliveries changed"
            );
            Vec::new()
        };
        let applied = response
            .applied_count
            .unwrap_or(applied_ids.len())
            .min(requested);

        if applied < requested {
            warn!(requested, applied, target = %target, "Bulk delivery update partially applied");
        } else {
            info!(applied, target = %target, "Bulk delivery update applied");
        }

        Ok(BulkOutcome {
            requested,
            applied,
            applied_ids,
            rejected: request.rejected,
        })
    }

    // -- Selection ----------------------------------------------------------

    pub fn set_selected(&mut self, id: &str, selected: bool) -> bool {
        match self.records.get_mut(id) {
            Some(r) => {
                r.selected = selected;
                true
            }
            None => false,
        }
    }

    pub fn toggle_selected(&mut self, id: &str) -> Option<bool> {
        self.records.get_mut(id).map(|r| {
            r.selected = !r.selected;
            r.selected
        })
    }

    /// Select exactly the records still open for completion. Returns how
    /// many are selected.
    pub fn select_all_eligible(&mut self) -> usize {
        let mut count = 0;
        for record in self.records.values_mut() {
            record.selected = is_selectable(record);
            if record.selected {
                count += 1;
            }
        }
        count
    }

    pub fn clear_selection(&mut self) {
        for record in self.records.values_mut() {
            record.selected = false;
        }
    }

    /// Selected ids in list order.
    pub fn selected_ids(&self) -> Vec<String> {
        self.records()
            .filter(|r| r.selected)
            .map(|r| r.id.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory backend for tests
// ---------------------------------------------------------------------------
