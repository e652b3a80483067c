//! Domain types shared by the board, the backend adapter and the reducer.

use crate::location::Location;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque backend identifier of one production batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowIndexRef(pub u64);

impl fmt::Display for RowIndexRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RowIndexRef {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Pipeline stage of an inventory unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Produced, not yet packed
    Manufactured,
    /// Packed and stored at a location
    Stocked,
    /// Left the warehouse
    Shipped,
}

impl UnitStatus {
    /// Canonical name, also used in card ids.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manufactured => "manufactured",
            Self::Stocked => "stocked",
            Self::Shipped => "shipped",
        }
    }

    /// Status label used by the backend's sheet (`未処理`, `完了`, `出荷済み`).
    #[must_use]
    pub const fn legacy_label(self) -> &'static str {
        match self {
            Self::Manufactured => "未処理",
            Self::Stocked => "完了",
            Self::Shipped => "出荷済み",
        }
    }

    /// Parse either a canonical name or a legacy label.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "manufactured" | "未処理" => Some(Self::Manufactured),
            "stocked" | "stock" | "完了" => Some(Self::Stocked),
            "shipped" | "出荷済み" => Some(Self::Shipped),
            _ => None,
        }
    }

    /// Board column this status is shown in.
    #[must_use]
    pub const fn column(self) -> Column {
        match self {
            Self::Manufactured => Column::Manufactured,
            Self::Stocked => Column::Stock,
            Self::Shipped => Column::Shipped,
        }
    }
}

/// A board column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Column {
    /// Manufactured units
    Manufactured,
    /// Stocked units
    Stock,
    /// Shipped units
    Shipped,
}

impl Column {
    /// All columns in pipeline order.
    pub const ALL: [Self; 3] = [Self::Manufactured, Self::Stock, Self::Shipped];

    /// Column name as used in query parameters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manufactured => "manufactured",
            Self::Stock => "stock",
            Self::Shipped => "shipped",
        }
    }

    /// Status of units in this column.
    #[must_use]
    pub const fn status(self) -> UnitStatus {
        match self {
            Self::Manufactured => UnitStatus::Manufactured,
            Self::Stock => UnitStatus::Stocked,
            Self::Shipped => UnitStatus::Shipped,
        }
    }
}

/// One display record: a quantity of a batch in one stage (and, when
/// stocked, at one location).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnit {
    /// Backend row of the batch
    pub row: RowIndexRef,
    /// Quantity of the whole batch
    pub base_quantity: i64,
    /// Pipeline stage
    pub status: UnitStatus,
    /// Storage location; meaningful only when stocked
    pub location: Option<Location>,
    /// Quantity this record represents
    pub quantity_at_location: i64,
    /// Production batch number
    pub batch_no: Option<String>,
    /// Product name
    pub product: Option<String>,
    /// Manufacture date as sent by the backend
    pub manufactured_on: Option<String>,
    /// Carrier label for shipped units
    pub ship_type: Option<String>,
}

impl InventoryUnit {
    /// A unit with no descriptive metadata.
    #[must_use]
    pub const fn new(
        row: RowIndexRef,
        base_quantity: i64,
        status: UnitStatus,
        location: Option<Location>,
        quantity_at_location: i64,
    ) -> Self {
        Self {
            row,
            base_quantity,
            status,
            location,
            quantity_at_location,
            batch_no: None,
            product: None,
            manufactured_on: None,
            ship_type: None,
        }
    }

    /// Location key when the unit is stocked at a known location.
    #[must_use]
    pub fn stock_key(&self) -> Option<&str> {
        match (&self.location, self.status) {
            (Some(location), UnitStatus::Stocked) if !location.is_empty() => {
                Some(location.key.as_str())
            },
            _ => None,
        }
    }
}

/// Deterministic identity of a card on the board.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CardId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CardId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stage transition sent to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackingAction {
    /// Manufactured → stocked
    #[serde(rename = "pack")]
    Pack,
    /// Stocked → shipped
    #[serde(rename = "ship")]
    Ship,
    /// Manufactured → shipped
    #[serde(rename = "ship_from_manu")]
    ShipFromManufactured,
    /// Stocked at one location → stocked at another
    #[serde(rename = "move")]
    Move,
    /// Shipped → stocked
    #[serde(rename = "restore")]
    Restore,
}

impl PackingAction {
    /// Backend action name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pack => "pack",
            Self::Ship => "ship",
            Self::ShipFromManufactured => "ship_from_manu",
            Self::Move => "move",
            Self::Restore => "restore",
        }
    }
}

impl fmt::Display for PackingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-generated id the backend uses to deduplicate retried updates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Mint a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
