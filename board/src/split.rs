//! Splitting a card's quantity into the part that moves and the part that stays.

/// Outcome of a split.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Split {
    /// Units left on the source card
    pub remain: i64,
    /// Units moved to the destination
    pub moved: i64,
}

impl Split {
    /// `true` when the source card is emptied.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.remain == 0
    }
}

/// Split `requested` units off a card holding `original`.
///
/// Negative quantities count as zero and the request is clamped to
/// `[1, original]`, so `remain + moved == max(original, 0)`. A card with
/// nothing on it moves nothing.
#[must_use]
pub fn split(original: i64, requested: i64) -> Split {
    let original = original.max(0);
    if original == 0 {
        return Split { remain: 0, moved: 0 };
    }

    let moved = requested.clamp(1, original);
    Split {
        remain: original - moved,
        moved,
    }
}
