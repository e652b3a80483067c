//! Mock collaborator implementations for testing.
//!
//! In-memory stand-ins for the key-value store, the inventory backend and the
//! HTTP transport, for use in unit and integration tests and the demo binary.

pub mod backend;
pub mod key_value;
pub mod transport;

pub use backend::MockBackend;
pub use key_value::FailingKeyValueStore;
pub use transport::{Scripted, ScriptedTransport, SimulatedBackendTransport};
