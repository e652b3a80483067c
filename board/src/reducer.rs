//! The board reducer.
//!
//! Owns the board projection and turns operator commands into an optimistic
//! local change plus one backend update. A successful update clears its
//! idempotency key and re-queries; a failed one leaves the optimistic change
//! in place until the next successful query rebuilds the board.
//!
//! Queries run as a cancellable effect under [`QUERY_EFFECT_ID`], so issuing a
//! new query aborts the one in flight. Results also carry a [`QueryToken`] and
//! anything but the latest token is dropped.

use crate::backend::{
    AuditLog, BackendError, InventoryBackend, QueryFilter, QueryMeta, QueryResponse, UpdateRequest,
};
use crate::board::Board;
use crate::card::merge_into_board;
use crate::config::BackendEnv;
use crate::idempotency::IdempotencyKeyStore;
use crate::location::{Location, LocationCatalog, normalize};
use crate::sequence::{QuerySequencer, QueryToken};
use crate::split::{Split, split};
use crate::types::{CardId, InventoryUnit, PackingAction, RequestId, RowIndexRef, UnitStatus};
use packboard_core::effect::{Effect, EffectId};
use packboard_core::environment::Clock;
use packboard_core::reducer::Reducer;
use packboard_core::{SmallVec, smallvec};
use packboard_runtime::metrics::BoardMetrics;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Cancellation id of the board query effect.
pub const QUERY_EFFECT_ID: EffectId = EffectId::from_static("board-query");

// ============================================================================
// Errors
// ============================================================================

/// A command rejected before anything was changed or sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The card is not on the board
    #[error("Card {0} is not on the board")]
    UnknownCard(CardId),
    /// The command does not apply to a card in this stage
    #[error("Cannot {command} a {status:?} card")]
    NotAllowed {
        /// Command name
        command: &'static str,
        /// Stage of the card
        status: UnitStatus,
    },
    /// Quantity is not between 1 and what the card holds
    #[error("Invalid quantity {requested}: {available} available")]
    InvalidQuantity {
        /// Requested quantity
        requested: i64,
        /// Quantity on the card
        available: i64,
    },
    /// No destination location was given
    #[error("A destination location is required")]
    MissingLocation,
    /// Moving to the location the card is already at
    #[error("Card is already at {0}")]
    SameLocation(String),
}

// ============================================================================
// State
// ============================================================================

/// Board state owned by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoardState {
    /// The projection
    pub board: Board,
    /// Selectable locations
    pub locations: LocationCatalog,
    /// Filter of the current query
    pub filter: QueryFilter,
    /// Metadata of the last applied query
    pub meta: QueryMeta,
    /// Environment the backend last reported
    pub env: BackendEnv,
    /// Query tokens
    pub queries: QuerySequencer,
    /// A query is in flight
    pub loading: bool,
    /// `(row, action)` pairs with an update in flight
    pub in_flight: HashSet<(RowIndexRef, PackingAction)>,
    /// Last user-facing error
    pub last_error: Option<String>,
    /// Last rejected command
    pub last_rejection: Option<ValidationError>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            board: Board::new(),
            locations: LocationCatalog::seeded::<&str>(&[]),
            filter: QueryFilter::default(),
            meta: QueryMeta::default(),
            env: BackendEnv::default(),
            queries: QuerySequencer::new(),
            loading: false,
            in_flight: HashSet::new(),
            last_error: None,
            last_rejection: None,
        }
    }
}

impl BoardState {
    /// Empty state targeting `env`.
    #[must_use]
    pub fn new(env: BackendEnv) -> Self {
        Self {
            env,
            ..Self::default()
        }
    }

    /// State with a pre-built board, as if a query had just been applied.
    #[must_use]
    pub fn with_units(units: Vec<InventoryUnit>) -> Self {
        let (board, locations) = merge_into_board::<&str>(units, &[]);
        Self {
            board,
            locations,
            ..Self::default()
        }
    }

    /// `true` while an update for `(row, action)` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, row: RowIndexRef, action: PackingAction) -> bool {
        self.in_flight.contains(&(row, action))
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Inputs of the board reducer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BoardAction {
    // Commands
    /// Re-query the backend; `Some` replaces the stored filter
    Refresh {
        /// New filter
        filter: Option<QueryFilter>,
    },
    /// Pack manufactured units at a location
    Pack {
        /// Source card
        card: CardId,
        /// Units to pack
        quantity: i64,
        /// Destination location, free text
        location: String,
    },
    /// Ship manufactured or stocked units
    Ship {
        /// Source card
        card: CardId,
        /// Units to ship
        quantity: i64,
        /// Carrier label
        ship_type: Option<String>,
    },
    /// Move stocked units to another location
    Move {
        /// Source card
        card: CardId,
        /// Units to move
        quantity: i64,
        /// Destination location, free text
        location: String,
    },
    /// Return shipped units to stock
    Restore {
        /// Source card
        card: CardId,
        /// Units to restore
        quantity: i64,
        /// Destination location, free text
        location: String,
    },
    /// Clear the last error
    DismissError,

    // Effect results
    /// A query finished
    QueryCompleted {
        /// Token minted when the query began
        token: QueryToken,
        /// Outcome
        result: Result<QueryResponse, BackendError>,
    },
    /// The backend applied an update
    UpdateSucceeded {
        /// Row of the update
        row: RowIndexRef,
        /// Action of the update
        action: PackingAction,
        /// Request id used
        request_id: RequestId,
        /// The backend had already applied it
        dedup: bool,
    },
    /// An update failed after all retries
    UpdateFailed {
        /// Row of the update
        row: RowIndexRef,
        /// Action of the update
        action: PackingAction,
        /// Cause
        error: BackendError,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies of the board reducer.
#[derive(Clone)]
pub struct BoardEnvironment {
    /// Clock for audit timestamps
    pub clock: Arc<dyn Clock>,
    /// Request ids per `(row, action)`
    pub keys: IdempotencyKeyStore,
    /// Query and update collaborator
    pub backend: Arc<dyn InventoryBackend>,
    /// Operator recorded in the audit log
    pub operator: Option<String>,
}

impl BoardEnvironment {
    /// Creates a new `BoardEnvironment`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, keys: IdempotencyKeyStore, backend: Arc<dyn InventoryBackend>) -> Self {
        Self {
            clock,
            keys,
            backend,
            operator: None,
        }
    }

    /// Record `operator` in every audit log.
    #[must_use]
    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer of the inventory board.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoardReducer;

/// A command before it is bound to a card's stage.
enum Intent {
    Pack(String),
    Ship(Option<String>),
    Move(String),
    Restore(String),
}

impl Intent {
    const fn name(&self) -> &'static str {
        match self {
            Self::Pack(_) => "pack",
            Self::Ship(_) => "ship",
            Self::Move(_) => "move",
            Self::Restore(_) => "restore",
        }
    }
}

/// A validated transition ready to apply.
struct Plan {
    action: PackingAction,
    source_id: CardId,
    source: InventoryUnit,
    split: Split,
    destination: InventoryUnit,
}

impl BoardReducer {
    /// Creates a new `BoardReducer`.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Backend action for a command on a card.
    fn action_for(source: &InventoryUnit, intent: &Intent) -> Result<PackingAction, ValidationError> {
        match (intent, source.status) {
            (Intent::Pack(_), UnitStatus::Manufactured) => Ok(PackingAction::Pack),
            (Intent::Ship(_), UnitStatus::Manufactured) => Ok(PackingAction::ShipFromManufactured),
            (Intent::Ship(_), UnitStatus::Stocked) => Ok(PackingAction::Ship),
            (Intent::Move(_), UnitStatus::Stocked) => Ok(PackingAction::Move),
            (Intent::Restore(_), UnitStatus::Shipped) => Ok(PackingAction::Restore),
            (intent, status) => Err(ValidationError::NotAllowed {
                command: intent.name(),
                status,
            }),
        }
    }

    fn destination_location(raw: &str) -> Result<Location, ValidationError> {
        let location = normalize(raw);
        if location.is_empty() {
            Err(ValidationError::MissingLocation)
        } else {
            Ok(location)
        }
    }

    /// Validate a command against the board and compute its effect.
    fn plan(
        source_id: CardId,
        source: InventoryUnit,
        action: PackingAction,
        quantity: i64,
        intent: Intent,
    ) -> Result<Plan, ValidationError> {
        let available = source.quantity_at_location;
        if quantity <= 0 || quantity > available {
            return Err(ValidationError::InvalidQuantity {
                requested: quantity,
                available,
            });
        }

        let mut destination = source.clone();
        match intent {
            Intent::Pack(raw) | Intent::Restore(raw) => {
                destination.status = UnitStatus::Stocked;
                destination.location = Some(Self::destination_location(&raw)?);
                destination.ship_type = None;
            },
            Intent::Move(raw) => {
                let location = Self::destination_location(&raw)?;
                if source.stock_key() == Some(location.key.as_str()) {
                    return Err(ValidationError::SameLocation(location.label));
                }
                destination.location = Some(location);
            },
            Intent::Ship(ship_type) => {
                destination.status = UnitStatus::Shipped;
                destination.ship_type = ship_type;
            },
        }

        let split = split(available, quantity);
        destination.quantity_at_location = split.moved;

        Ok(Plan {
            action,
            source_id,
            source,
            split,
            destination,
        })
    }

    fn reject(state: &mut BoardState, command: &'static str, error: ValidationError) {
        tracing::debug!(command, error = %error, "Command rejected");
        BoardMetrics::record_rejected(command);
        state.last_error = Some(error.to_string());
        state.last_rejection = Some(error);
    }

    /// Mint a token and build the cancellable query effect.
    fn begin_query(state: &mut BoardState, env: &BoardEnvironment) -> Effect<BoardAction> {
        let token = state.queries.begin();
        state.loading = true;
        tracing::debug!(%token, "Query issued");

        let backend = Arc::clone(&env.backend);
        let filter = state.filter.clone();
        Effect::Future(Box::pin(async move {
            let result = backend.query(filter).await;
            Some(BoardAction::QueryCompleted { token, result })
        }))
        .cancellable(QUERY_EFFECT_ID)
    }

    fn command(
        state: &mut BoardState,
        env: &BoardEnvironment,
        card: CardId,
        quantity: i64,
        intent: Intent,
    ) -> SmallVec<[Effect<BoardAction>; 4]> {
        let command = intent.name();
        let Some(source) = state.board.card(&card).cloned() else {
            Self::reject(state, command, ValidationError::UnknownCard(card));
            return SmallVec::new();
        };

        let action = match Self::action_for(&source, &intent) {
            Ok(action) => action,
            Err(error) => {
                Self::reject(state, command, error);
                return SmallVec::new();
            },
        };

        if state.is_in_flight(source.row, action) {
            tracing::debug!(row = %source.row, %action, "Update already in flight, ignoring");
            return SmallVec::new();
        }

        let plan = match Self::plan(card, source, action, quantity, intent) {
            Ok(plan) => plan,
            Err(error) => {
                Self::reject(state, command, error);
                return SmallVec::new();
            },
        };

        Self::apply_optimistic(state, &plan);
        let request = Self::update_request(env, &plan);
        state.in_flight.insert((plan.source.row, plan.action));
        state.last_rejection = None;

        tracing::debug!(
            row = %request.row,
            action = %request.action,
            request_id = %request.request_id,
            moved = plan.split.moved,
            remain = plan.split.remain,
            "Optimistic update applied"
        );

        let backend = Arc::clone(&env.backend);
        smallvec![Effect::Future(Box::pin(async move {
            let row = request.row;
            let action = request.action;
            let request_id = request.request_id.clone();
            Some(match backend.apply(request).await {
                Ok(outcome) => BoardAction::UpdateSucceeded {
                    row,
                    action,
                    request_id,
                    dedup: outcome.dedup,
                },
                Err(error) => BoardAction::UpdateFailed { row, action, error },
            })
        }))]
    }

    /// Move `split.moved` units from the source card to the destination card.
    fn apply_optimistic(state: &mut BoardState, plan: &Plan) {
        state.board.set_quantity(&plan.source_id, plan.split.remain);
        if plan.destination.status == UnitStatus::Stocked {
            if let Some(location) = &plan.destination.location {
                state.locations.observe(location);
            }
        }
        state.board.merge(plan.destination.clone());
    }

    fn update_request(env: &BoardEnvironment, plan: &Plan) -> UpdateRequest {
        let label = |unit: &InventoryUnit| unit.location.as_ref().map(|l| l.label.clone());
        let from_location = match plan.source.status {
            UnitStatus::Manufactured => None,
            UnitStatus::Stocked | UnitStatus::Shipped => label(&plan.source),
        };
        let to_location = match plan.destination.status {
            UnitStatus::Stocked => label(&plan.destination),
            UnitStatus::Manufactured | UnitStatus::Shipped => None,
        };

        UpdateRequest {
            action: plan.action,
            row: plan.source.row,
            resulting_location: to_location.clone(),
            resulting_quantity: plan.split.moved,
            remaining_quantity: plan.split.remain,
            audit: AuditLog {
                when: env.clock.now(),
                ship_type: plan.destination.ship_type.clone(),
                user: env.operator.clone(),
                from_location,
                to_location,
            },
            request_id: env.keys.get_or_create_key(plan.source.row, plan.action),
        }
    }

    fn apply_query(state: &mut BoardState, token: QueryToken, result: Result<QueryResponse, BackendError>) {
        if !state.queries.is_current(token) {
            tracing::debug!(%token, latest = ?state.queries.latest(), "Discarding stale query result");
            BoardMetrics::record_stale_query();
            return;
        }
        state.loading = false;

        match result {
            Ok(response) => {
                let (board, locations) = merge_into_board(response.units, &response.locations);
                tracing::debug!(%token, cards = board.len(), "Query applied");
                state.board = board;
                state.locations = locations;
                if let Some(env) = response.meta.env.as_ref().and_then(|env| BackendEnv::parse(&env.key)) {
                    state.env = env;
                }
                state.meta = response.meta;
            },
            Err(BackendError::Cancelled) => {
                tracing::debug!(%token, "Query cancelled");
            },
            Err(error) => {
                tracing::warn!(%token, error = %error, "Query failed");
                state.last_error = Some(error.user_message());
            },
        }
    }
}

impl Reducer for BoardReducer {
    type State = BoardState;
    type Action = BoardAction;
    type Environment = BoardEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Commands ==========
            BoardAction::Refresh { filter } => {
                if let Some(filter) = filter {
                    state.filter = filter;
                }
                smallvec![Self::begin_query(state, env)]
            },

            BoardAction::Pack {
                card,
                quantity,
                location,
            } => Self::command(state, env, card, quantity, Intent::Pack(location)),

            BoardAction::Ship {
                card,
                quantity,
                ship_type,
            } => Self::command(state, env, card, quantity, Intent::Ship(ship_type)),

            BoardAction::Move {
                card,
                quantity,
                location,
            } => Self::command(state, env, card, quantity, Intent::Move(location)),

            BoardAction::Restore {
                card,
                quantity,
                location,
            } => Self::command(state, env, card, quantity, Intent::Restore(location)),

            BoardAction::DismissError => {
                state.last_error = None;
                state.last_rejection = None;
                SmallVec::new()
            },

            // ========== Effect results ==========
            BoardAction::QueryCompleted { token, result } => {
                Self::apply_query(state, token, result);
                SmallVec::new()
            },

            BoardAction::UpdateSucceeded {
                row,
                action,
                request_id,
                dedup,
            } => {
                state.in_flight.remove(&(row, action));
                env.keys.clear_key(row, action);
                tracing::info!(%row, %action, %request_id, dedup, "Update applied");
                smallvec![Self::begin_query(state, env)]
            },

            BoardAction::UpdateFailed { row, action, error } => {
                state.in_flight.remove(&(row, action));
                tracing::error!(%row, %action, error = %error, "Update failed");
                state.last_error = Some(error.user_message());
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::{InMemoryKeyValueStore, storage_key};
    use crate::idempotency::KeyValueStore;
    use crate::mocks::MockBackend;
    use crate::types::Column;
    use packboard_testing::{ReducerTest, assertions, test_clock};

    fn stocked(row: u64, location: &str, quantity: i64) -> InventoryUnit {
        InventoryUnit::new(RowIndexRef(row), 200, UnitStatus::Stocked, Some(normalize(location)), quantity)
    }

    fn manufactured(row: u64, quantity: i64) -> InventoryUnit {
        InventoryUnit::new(RowIndexRef(row), quantity, UnitStatus::Manufactured, None, quantity)
    }

    fn env_with(storage: &InMemoryKeyValueStore) -> BoardEnvironment {
        let clock = Arc::new(test_clock());
        BoardEnvironment::new(
            clock.clone(),
            IdempotencyKeyStore::new(Arc::new(storage.clone()), clock),
            Arc::new(MockBackend::new(Vec::new())),
        )
    }

    fn env() -> BoardEnvironment {
        env_with(&InMemoryKeyValueStore::new())
    }

    #[test]
    fn refresh_issues_a_cancellable_query() {
        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::default())
            .when_action(BoardAction::Refresh { filter: None })
            .then_state(|state| {
                assert!(state.loading);
                assert!(state.queries.latest().is_some());
            })
            .then_effects(|effects| {
                assert_eq!(effects.len(), 1);
                assertions::assert_has_cancellable_effect(effects, &QUERY_EFFECT_ID);
            })
            .run();
    }

    #[test]
    fn refresh_with_filter_replaces_filter() {
        let filter = QueryFilter {
            product: Some("B-645".to_string()),
            ..QueryFilter::default()
        };
        let expected = filter.clone();

        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::default())
            .when_action(BoardAction::Refresh { filter: Some(filter) })
            .then_state(move |state| assert_eq!(state.filter, expected))
            .run();
    }

    #[test]
    fn full_ship_from_stock_removes_the_stocked_card() {
        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::with_units(vec![stocked(1646, "Pallet2", 100)]))
            .when_action(BoardAction::Ship {
                card: CardId::from("1646_pallet-2"),
                quantity: 100,
                ship_type: Some("Logicam".to_string()),
            })
            .then_state(|state| {
                assert!(state.board.column(Column::Stock).is_empty());
                let shipped: Vec<_> = state.board.cards_in(Column::Shipped).collect();
                assert_eq!(shipped.len(), 1);
                assert_eq!(shipped[0].quantity_at_location, 100);
                assert_eq!(shipped[0].ship_type.as_deref(), Some("Logicam"));
                assert!(state.is_in_flight(RowIndexRef(1646), PackingAction::Ship));
            })
            .then_effects(|effects| assert!(matches!(effects, [Effect::Future(_)])))
            .run();
    }

    #[test]
    fn partial_pack_reduces_the_manufactured_card() {
        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::with_units(vec![manufactured(1645, 200)]))
            .when_action(BoardAction::Pack {
                card: CardId::from("1645_manufactured"),
                quantity: 50,
                location: "Pallet1".to_string(),
            })
            .then_state(|state| {
                let source = state.board.card(&CardId::from("1645_manufactured")).unwrap();
                assert_eq!(source.quantity_at_location, 150);
                let packed = state.board.card(&CardId::from("1645_pallet-1")).unwrap();
                assert_eq!(packed.quantity_at_location, 50);
                assert_eq!(packed.status, UnitStatus::Stocked);
                assert_eq!(state.board.column(Column::Manufactured).len(), 1);
                assert_eq!(state.board.total_for_row(RowIndexRef(1645)), 200);
            })
            .run();
    }

    #[test]
    fn move_merges_into_existing_destination() {
        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::with_units(vec![
                stocked(7, "Pallet 1", 30),
                stocked(7, "Pallet 3", 5),
            ]))
            .when_action(BoardAction::Move {
                card: CardId::from("7_pallet-1"),
                quantity: 10,
                location: "パレット③".to_string(),
            })
            .then_state(|state| {
                assert_eq!(state.board.column(Column::Stock).len(), 2);
                assert_eq!(
                    state.board.card(&CardId::from("7_pallet-3")).map(|c| c.quantity_at_location),
                    Some(15)
                );
                assert_eq!(
                    state.board.card(&CardId::from("7_pallet-1")).map(|c| c.quantity_at_location),
                    Some(20)
                );
            })
            .run();
    }

    #[test]
    fn restore_returns_shipped_units_to_stock() {
        let shipped = InventoryUnit::new(RowIndexRef(9), 40, UnitStatus::Shipped, None, 40);

        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::with_units(vec![shipped, stocked(9, "Pallet 2", 0)]))
            .when_action(BoardAction::Restore {
                card: CardId::from("9_shipped"),
                quantity: 40,
                location: "仮置きパレット".to_string(),
            })
            .then_state(|state| {
                assert!(state.board.column(Column::Shipped).is_empty());
                let restored: Vec<_> = state.board.cards_in(Column::Stock).collect();
                assert_eq!(restored.len(), 1);
                assert_eq!(restored[0].quantity_at_location, 40);
                assert_eq!(restored[0].stock_key(), Some(crate::location::TEMPORARY_PALLET_KEY));
            })
            .run();
    }

    #[test]
    fn invalid_quantities_are_rejected_without_effects() {
        for quantity in [0, -3, 101] {
            ReducerTest::new(BoardReducer::new())
                .with_env(env())
                .given_state(BoardState::with_units(vec![stocked(1646, "Pallet2", 100)]))
                .when_action(BoardAction::Ship {
                    card: CardId::from("1646_pallet-2"),
                    quantity,
                    ship_type: None,
                })
                .then_state(move |state| {
                    assert_eq!(
                        state.last_rejection,
                        Some(ValidationError::InvalidQuantity {
                            requested: quantity,
                            available: 100
                        })
                    );
                    assert!(state.last_error.is_some());
                    assert_eq!(state.board.column(Column::Stock).len(), 1);
                    assert!(state.in_flight.is_empty());
                })
                .then_effects(|effects| assertions::assert_no_effects(effects))
                .run();
        }
    }

    #[test]
    fn commands_must_match_the_card_stage() {
        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::with_units(vec![manufactured(1, 10)]))
            .when_action(BoardAction::Move {
                card: CardId::from("1_manufactured"),
                quantity: 1,
                location: "Pallet 1".to_string(),
            })
            .then_state(|state| {
                assert_eq!(
                    state.last_rejection,
                    Some(ValidationError::NotAllowed {
                        command: "move",
                        status: UnitStatus::Manufactured
                    })
                );
            })
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn missing_and_same_locations_are_rejected() {
        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::with_units(vec![manufactured(1, 10)]))
            .when_action(BoardAction::Pack {
                card: CardId::from("1_manufactured"),
                quantity: 1,
                location: " （未定） ".to_string(),
            })
            .then_state(|state| assert_eq!(state.last_rejection, Some(ValidationError::MissingLocation)))
            .run();

        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::with_units(vec![stocked(1, "Pallet 1", 10)]))
            .when_action(BoardAction::Move {
                card: CardId::from("1_pallet-1"),
                quantity: 1,
                location: "パレット①".to_string(),
            })
            .then_state(|state| {
                assert_eq!(state.last_rejection, Some(ValidationError::SameLocation("Pallet1".to_string())));
            })
            .run();
    }

    #[test]
    fn unknown_cards_are_rejected() {
        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::default())
            .when_action(BoardAction::Ship {
                card: CardId::from("404_stocked"),
                quantity: 1,
                ship_type: None,
            })
            .then_state(|state| {
                assert_eq!(state.last_rejection, Some(ValidationError::UnknownCard(CardId::from("404_stocked"))));
            })
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn second_command_for_the_same_pair_is_ignored_while_in_flight() {
        let mut state = BoardState::with_units(vec![manufactured(1645, 200)]);
        state.in_flight.insert((RowIndexRef(1645), PackingAction::Pack));
        let before = state.board.clone();

        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(BoardAction::Pack {
                card: CardId::from("1645_manufactured"),
                quantity: 50,
                location: "Pallet1".to_string(),
            })
            .then_state(move |state| {
                assert_eq!(state.board, before);
                assert!(state.last_rejection.is_none());
            })
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[test]
    fn ship_from_manufactured_uses_its_own_action() {
        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(BoardState::with_units(vec![manufactured(3, 20)]))
            .when_action(BoardAction::Ship {
                card: CardId::from("3_manufactured"),
                quantity: 20,
                ship_type: None,
            })
            .then_state(|state| {
                assert!(state.is_in_flight(RowIndexRef(3), PackingAction::ShipFromManufactured));
                assert!(state.board.column(Column::Manufactured).is_empty());
                assert_eq!(state.board.column(Column::Shipped).len(), 1);
            })
            .run();
    }

    #[test]
    fn stale_query_results_are_discarded() {
        let mut state = BoardState::default();
        let stale = state.queries.begin();
        let _latest = state.queries.begin();
        state.loading = true;

        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(BoardAction::QueryCompleted {
                token: stale,
                result: Ok(QueryResponse {
                    units: vec![manufactured(1, 10)],
                    ..QueryResponse::default()
                }),
            })
            .then_state(|state| {
                assert!(state.board.is_empty());
                assert!(state.loading);
            })
            .run();
    }

    #[test]
    fn current_query_rebuilds_the_board() {
        let mut state = BoardState::with_units(vec![manufactured(99, 1)]);
        let token = state.queries.begin();

        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(BoardAction::QueryCompleted {
                token,
                result: Ok(QueryResponse {
                    units: vec![stocked(1646, "パレット②", 60), stocked(1646, "Pallet 2", 40)],
                    locations: vec!["Dock A".to_string()],
                    meta: QueryMeta {
                        env: Some(crate::backend::ServedEnv {
                            key: "prod".to_string(),
                            label: "Production".to_string(),
                        }),
                        ..QueryMeta::default()
                    },
                }),
            })
            .then_state(|state| {
                assert!(!state.loading);
                assert_eq!(state.board.len(), 1);
                assert_eq!(
                    state.board.card(&CardId::from("1646_pallet-2")).map(|c| c.quantity_at_location),
                    Some(100)
                );
                assert_eq!(state.locations.labels(), vec!["Dock A".to_string(), "Pallet2".to_string()]);
                assert_eq!(state.env, BackendEnv::Prod);
            })
            .run();
    }

    #[test]
    fn failed_query_keeps_the_board_and_surfaces_an_error() {
        let mut state = BoardState::with_units(vec![manufactured(1, 10)]);
        let token = state.queries.begin();

        ReducerTest::new(BoardReducer::new())
            .with_env(env())
            .given_state(state)
            .when_action(BoardAction::QueryCompleted {
                token,
                result: Err(BackendError::Unavailable("connection reset".to_string())),
            })
            .then_state(|state| {
                assert_eq!(state.board.len(), 1);
                assert!(state.last_error.as_deref().is_some_and(|m| m.contains("Could not reach")));
            })
            .run();
    }

    #[test]
    fn success_clears_the_key_and_re_queries() {
        let storage = InMemoryKeyValueStore::new();
        let env = env_with(&storage);
        let request_id = env.keys.get_or_create_key(RowIndexRef(5), PackingAction::Move);
        let mut state = BoardState::default();
        state.in_flight.insert((RowIndexRef(5), PackingAction::Move));

        ReducerTest::new(BoardReducer::new())
            .with_env(env)
            .given_state(state)
            .when_action(BoardAction::UpdateSucceeded {
                row: RowIndexRef(5),
                action: PackingAction::Move,
                request_id,
                dedup: false,
            })
            .then_state(move |state| {
                assert!(state.in_flight.is_empty());
                assert!(state.loading);
                assert!(storage.get(&storage_key(RowIndexRef(5), PackingAction::Move)).unwrap().is_none());
            })
            .then_effects(|effects| assertions::assert_has_cancellable_effect(effects, &QUERY_EFFECT_ID))
            .run();
    }

    #[test]
    fn failure_keeps_the_optimistic_board_and_the_key() {
        let storage = InMemoryKeyValueStore::new();
        let env = env_with(&storage);
        let _ = env.keys.get_or_create_key(RowIndexRef(5), PackingAction::Move);
        let mut state = BoardState::with_units(vec![stocked(5, "Pallet 4", 3)]);
        state.in_flight.insert((RowIndexRef(5), PackingAction::Move));
        let before = state.board.clone();

        ReducerTest::new(BoardReducer::new())
            .with_env(env)
            .given_state(state)
            .when_action(BoardAction::UpdateFailed {
                row: RowIndexRef(5),
                action: PackingAction::Move,
                error: BackendError::Unavailable("HTTP 503".to_string()),
            })
            .then_state(move |state| {
                assert_eq!(state.board, before);
                assert!(state.in_flight.is_empty());
                assert!(state.last_error.is_some());
                assert!(storage.get(&storage_key(RowIndexRef(5), PackingAction::Move)).unwrap().is_some());
            })
            .then_effects(|effects| assertions::assert_no_effects(effects))
            .run();
    }

    #[tokio::test]
    async fn update_effect_reports_the_backend_outcome() {
        let backend = Arc::new(MockBackend::new(vec![manufactured(1645, 200)]));
        let clock = Arc::new(test_clock());
        let env = BoardEnvironment::new(
            clock.clone(),
            IdempotencyKeyStore::new(Arc::new(InMemoryKeyValueStore::new()), clock),
            backend.clone(),
        )
        .with_operator("A");

        let (_, mut effects) = ReducerTest::new(BoardReducer::new())
            .with_env(env)
            .given_state(BoardState::with_units(vec![manufactured(1645, 200)]))
            .when_action(BoardAction::Pack {
                card: CardId::from("1645_manufactured"),
                quantity: 50,
                location: "Pallet1".to_string(),
            })
            .run_returning();

        let future = assertions::into_future(effects.remove(0)).unwrap();
        let action = future.await.unwrap();

        assert!(matches!(
            action,
            BoardAction::UpdateSucceeded {
                row: RowIndexRef(1645),
                action: PackingAction::Pack,
                dedup: false,
                ..
            }
        ));
        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].resulting_location.as_deref(), Some("Pallet1"));
        assert_eq!(requests[0].resulting_quantity, 50);
        assert_eq!(requests[0].remaining_quantity, 150);
        assert_eq!(requests[0].audit.user.as_deref(), Some("A"));
    }
}
