//! Query sequence tokens.
//!
//! Every query is tagged with a token minted when it begins. Only the result
//! carrying the most recently minted token may be applied; anything older
//! was superseded while in flight.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Token identifying one issued query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryToken(u64);

impl QueryToken {
    /// Raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mints tokens in issue order and remembers the latest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuerySequencer {
    issued: u64,
}

impl QuerySequencer {
    /// A sequencer that has issued nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self { issued: 0 }
    }

    /// Mint the next token, superseding every earlier one.
    pub const fn begin(&mut self) -> QueryToken {
        self.issued += 1;
        QueryToken(self.issued)
    }

    /// The most recently minted token.
    #[must_use]
    pub const fn latest(&self) -> Option<QueryToken> {
        if self.issued == 0 {
            None
        } else {
            Some(QueryToken(self.issued))
        }
    }

    /// `true` when `token` is the most recently minted one.
    #[must_use]
    pub const fn is_current(&self, token: QueryToken) -> bool {
        self.issued != 0 && token.0 == self.issued
    }
}
