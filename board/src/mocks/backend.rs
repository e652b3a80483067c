//! In-memory inventory backend.

use crate::backend::{
    BackendError, InventoryBackend, QueryFilter, QueryMeta, QueryResponse, ServedEnv, UpdateOutcome,
    UpdateRequest,
};
use crate::board::Board;
use crate::card::card_id;
use crate::location::normalize;
use crate::types::{InventoryUnit, PackingAction, RequestId, RowIndexRef, UnitStatus};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    records: Board,
    locations: Vec<String>,
    served_env: Option<ServedEnv>,
    applied: HashSet<RequestId>,
    requests: Vec<UpdateRequest>,
    update_failures: VecDeque<BackendError>,
    responses_to_lose: usize,
    update_delays: VecDeque<Duration>,
    query_delays: VecDeque<Duration>,
    query_failures: VecDeque<BackendError>,
    completed_queries: usize,
}

/// System of record held in memory.
///
/// Applies each request id at most once and answers `dedup` for repeats.
/// Failures, lost responses and slow queries can be scripted.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Create a backend holding `units`.
    #[must_use]
    pub fn new(units: Vec<InventoryUnit>) -> Self {
        let mut records = Board::new();
        for unit in units {
            records.merge(unit);
        }
        Self {
            state: Mutex::new(MockState {
                records,
                ..MockState::default()
            }),
        }
    }

    /// Report these labels as the known locations.
    #[must_use]
    pub fn with_locations(self, locations: Vec<String>) -> Self {
        self.lock().locations = locations;
        self
    }

    /// Report this environment in query metadata.
    #[must_use]
    pub fn with_served_env(self, key: &str, label: &str) -> Self {
        self.lock().served_env = Some(ServedEnv {
            key: key.to_string(),
            label: label.to_string(),
        });
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next update without applying it.
    pub fn fail_next_update(&self, error: BackendError) {
        self.lock().update_failures.push_back(error);
    }

    /// Apply the next update but report it as failed.
    pub fn lose_next_response(&self) {
        self.lock().responses_to_lose += 1;
    }

    /// Hold the next update for `delay` before handling it.
    pub fn delay_next_update(&self, delay: Duration) {
        self.lock().update_delays.push_back(delay);
    }

    /// Hold the next query for `delay` before answering.
    pub fn delay_next_query(&self, delay: Duration) {
        self.lock().query_delays.push_back(delay);
    }

    /// Fail the next query.
    pub fn fail_next_query(&self, error: BackendError) {
        self.lock().query_failures.push_back(error);
    }

    /// Every update received, including repeats.
    #[must_use]
    pub fn requests(&self) -> Vec<UpdateRequest> {
        self.lock().requests.clone()
    }

    /// Number of distinct request ids applied.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.lock().applied.len()
    }

    /// Current records.
    #[must_use]
    pub fn units(&self) -> Vec<InventoryUnit> {
        self.lock().records.units()
    }

    /// Quantity of a row across every stage.
    #[must_use]
    pub fn total_for_row(&self, row: RowIndexRef) -> i64 {
        self.lock().records.total_for_row(row)
    }

    /// Queries that ran to completion.
    #[must_use]
    pub fn completed_queries(&self) -> usize {
        self.lock().completed_queries
    }
}

fn rejected(reason: impl Into<String>) -> BackendError {
    BackendError::Rejected(reason.into())
}

/// Apply one update to the records.
fn apply_to_records(records: &mut Board, request: &UpdateRequest) -> Result<(), BackendError> {
    let (source_status, source_location) = match request.action {
        PackingAction::Pack | PackingAction::ShipFromManufactured => (UnitStatus::Manufactured, None),
        PackingAction::Ship | PackingAction::Move => {
            (UnitStatus::Stocked, request.audit.from_location.as_deref().map(normalize))
        },
        PackingAction::Restore => (UnitStatus::Shipped, None),
    };

    let probe = InventoryUnit::new(request.row, 0, source_status, source_location, 0);
    let source_id = card_id(&probe);
    let Some(source) = records.card(&source_id).cloned() else {
        return Err(rejected(format!("no {} record for row {}", source_status.as_str(), request.row)));
    };

    let quantity = request.resulting_quantity;
    if quantity <= 0 || quantity > source.quantity_at_location {
        return Err(rejected(format!(
            "quantity {quantity} exceeds {} available",
            source.quantity_at_location
        )));
    }

    let mut moved = source.clone();
    moved.quantity_at_location = quantity;
    match request.action {
        PackingAction::Pack | PackingAction::Move | PackingAction::Restore => {
            let location = request
                .resulting_location
                .as_deref()
                .map(normalize)
                .filter(|location| !location.is_empty())
                .ok_or_else(|| rejected("location is required"))?;
            moved.status = UnitStatus::Stocked;
            moved.location = Some(location);
            moved.ship_type = None;
        },
        PackingAction::Ship | PackingAction::ShipFromManufactured => {
            moved.status = UnitStatus::Shipped;
            moved.ship_type.clone_from(&request.audit.ship_type);
        },
    }

    records.set_quantity(&source_id, source.quantity_at_location - quantity);
    records.merge(moved);
    Ok(())
}

impl InventoryBackend for MockBackend {
    fn query(
        &self,
        filter: QueryFilter,
    ) -> Pin<Box<dyn Future<Output = Result<QueryResponse, BackendError>> + Send + '_>> {
        Box::pin(async move {
            let delay = self.lock().query_delays.pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.lock();
            if let Some(error) = state.query_failures.pop_front() {
                return Err(error);
            }
            state.completed_queries += 1;

            Ok(QueryResponse {
                units: state
                    .records
                    .units()
                    .into_iter()
                    .filter(|unit| filter.matches(unit))
                    .collect(),
                locations: state.locations.clone(),
                meta: QueryMeta {
                    env: state.served_env.clone(),
                    ..QueryMeta::default()
                },
            })
        })
    }

    fn apply(
        &self,
        request: UpdateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpdateOutcome, BackendError>> + Send + '_>> {
        Box::pin(async move {
            let delay = self.lock().update_delays.pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.lock();
            state.requests.push(request.clone());

            if let Some(error) = state.update_failures.pop_front() {
                return Err(error);
            }
            if state.applied.contains(&request.request_id) {
                return Ok(UpdateOutcome { dedup: true });
            }

            apply_to_records(&mut state.records, &request)?;
            state.applied.insert(request.request_id.clone());

            if state.responses_to_lose > 0 {
                state.responses_to_lose -= 1;
                return Err(BackendError::Unavailable("response lost".to_string()));
            }
            Ok(UpdateOutcome { dedup: false })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AuditLog;
    use packboard_testing::test_epoch;

    fn request(action: PackingAction, quantity: i64, from: Option<&str>, to: Option<&str>, id: &str) -> UpdateRequest {
        UpdateRequest {
            action,
            row: RowIndexRef(1645),
            resulting_location: to.map(str::to_string),
            resulting_quantity: quantity,
            remaining_quantity: 0,
            audit: AuditLog {
                when: test_epoch(),
                ship_type: None,
                user: None,
                from_location: from.map(str::to_string),
                to_location: to.map(str::to_string),
            },
            request_id: RequestId::from(id.to_string()),
        }
    }

    fn manufactured() -> InventoryUnit {
        InventoryUnit::new(RowIndexRef(1645), 200, UnitStatus::Manufactured, None, 200)
    }

    #[tokio::test]
    async fn applies_each_request_id_once() {
        let backend = MockBackend::new(vec![manufactured()]);

        let first = backend
            .apply(request(PackingAction::Pack, 50, None, Some("Pallet1"), "r1"))
            .await
            .unwrap();
        let repeat = backend
            .apply(request(PackingAction::Pack, 50, None, Some("Pallet1"), "r1"))
            .await
            .unwrap();

        assert!(!first.dedup);
        assert!(repeat.dedup);
        assert_eq!(backend.applied_count(), 1);
        assert_eq!(backend.requests().len(), 2);
        assert_eq!(backend.total_for_row(RowIndexRef(1645)), 200);

        let units = backend.units();
        assert!(units.iter().any(|u| u.status == UnitStatus::Stocked && u.quantity_at_location == 50));
        assert!(units.iter().any(|u| u.status == UnitStatus::Manufactured && u.quantity_at_location == 150));
    }

    #[tokio::test]
    async fn rejects_impossible_updates() {
        let backend = MockBackend::new(vec![manufactured()]);

        let error = backend
            .apply(request(PackingAction::Ship, 1, Some("Pallet 9"), None, "r1"))
            .await
            .unwrap_err();
        assert!(matches!(error, BackendError::Rejected(_)));

        let error = backend
            .apply(request(PackingAction::Pack, 500, None, Some("Pallet1"), "r2"))
            .await
            .unwrap_err();
        assert!(matches!(error, BackendError::Rejected(_)));
        assert_eq!(backend.applied_count(), 0);
    }

    #[tokio::test]
    async fn lost_response_still_applies() {
        let backend = MockBackend::new(vec![manufactured()]);
        backend.lose_next_response();

        let lost = backend
            .apply(request(PackingAction::ShipFromManufactured, 200, None, None, "r1"))
            .await;
        let retry = backend
            .apply(request(PackingAction::ShipFromManufactured, 200, None, None, "r1"))
            .await
            .unwrap();

        assert!(lost.is_err());
        assert!(retry.dedup);
        assert_eq!(backend.units().len(), 1);
        assert_eq!(backend.units()[0].status, UnitStatus::Shipped);
    }

    #[tokio::test]
    async fn query_filters_records() {
        let mut other = manufactured();
        other.row = RowIndexRef(1);
        other.base_quantity = 5;
        let backend = MockBackend::new(vec![manufactured(), other]).with_locations(vec!["Dock A".to_string()]);

        let response = backend
            .query(QueryFilter {
                quantity_min: Some(100),
                ..QueryFilter::default()
            })
            .await
            .unwrap();

        assert_eq!(response.units.len(), 1);
        assert_eq!(response.locations, vec!["Dock A".to_string()]);
        assert_eq!(backend.completed_queries(), 1);
    }
}
