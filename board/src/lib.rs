//! # Packboard
//!
//! An inventory pipeline board. Units move from **manufactured** to
//! **stocked** (on a storage location) to **shipped**, and every move is
//! reflected locally at once and then reconciled with a remote backend.
//!
//! ## Architecture
//!
//! The board is a reducer driven by a [`Store`]:
//!
//! ```text
//! Command → BoardReducer → (optimistic board, backend update effect)
//!                                   ↓
//!                  UpdateSucceeded / UpdateFailed
//!                                   ↓
//!                   re-query → QueryCompleted → rebuilt board
//! ```
//!
//! - [`location`]: free-text storage locations normalized to canonical keys
//! - [`card`]: card identity and merging of query results into a [`Board`]
//! - [`split`]: quantity split between the part that stays and the part that moves
//! - [`idempotency`]: request ids reused per `(row, action)` across retries
//! - [`client`]: HTTP updates with timeout, retries, jitter and cancellation
//! - [`backend`]: query and update calls against the inventory backend
//! - [`reducer`]: the reconciliation controller
//!
//! ## Example
//!
//! ```ignore
//! use packboard::{BoardAction, BoardEnvironment, BoardReducer, BoardState, BoardStore};
//!
//! let store = BoardStore::new(BoardState::default(), BoardReducer::new(), env);
//! store.send(BoardAction::Refresh { filter: None }).await?;
//! ```

pub mod backend;
pub mod board;
pub mod card;
pub mod client;
pub mod config;
pub mod idempotency;
pub mod location;
pub mod mocks;
pub mod reducer;
pub mod sequence;
pub mod split;
pub mod types;

pub use backend::{
    BackendError, HttpBackend, InventoryBackend, QueryFilter, QueryResponse, QueryScope, UpdateRequest,
};
pub use board::Board;
pub use card::{card_id, merge_into_board};
pub use client::{ReqwestTransport, SendOptions, Transport, UpdateClient, UpdateError};
pub use config::{BackendEnv, BoardConfig, ConfigError};
pub use idempotency::{IdempotencyKeyStore, InMemoryKeyValueStore, JsonFileKeyValueStore, KeyValueStore};
pub use location::{Location, LocationCatalog, normalize};
pub use reducer::{BoardAction, BoardEnvironment, BoardReducer, BoardState, QUERY_EFFECT_ID, ValidationError};
pub use split::{Split, split};
pub use types::{CardId, Column, InventoryUnit, PackingAction, RequestId, RowIndexRef, UnitStatus};

use packboard_runtime::Store;

/// Store running the board reducer.
pub type BoardStore = Store<BoardState, BoardAction, BoardEnvironment, BoardReducer>;
