//! The board projection: three ordered columns of cards.

use crate::card::card_id;
use crate::types::{CardId, Column, InventoryUnit, RowIndexRef};
use std::collections::HashMap;

/// Cards grouped into the manufactured, stock and shipped columns.
///
/// Every id in a column has exactly one card, and every card sits in the
/// column of its status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Board {
    manufactured: Vec<CardId>,
    stock: Vec<CardId>,
    shipped: Vec<CardId>,
    cards: HashMap<CardId, InventoryUnit>,
}

impl Board {
    /// An empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Card ids of a column, in display order.
    #[must_use]
    pub fn column(&self, column: Column) -> &[CardId] {
        match column {
            Column::Manufactured => &self.manufactured,
            Column::Stock => &self.stock,
            Column::Shipped => &self.shipped,
        }
    }

    fn column_mut(&mut self, column: Column) -> &mut Vec<CardId> {
        match column {
            Column::Manufactured => &mut self.manufactured,
            Column::Stock => &mut self.stock,
            Column::Shipped => &mut self.shipped,
        }
    }

    /// Look up a card.
    #[must_use]
    pub fn card(&self, id: &CardId) -> Option<&InventoryUnit> {
        self.cards.get(id)
    }

    /// Cards of a column, in display order.
    pub fn cards_in(&self, column: Column) -> impl Iterator<Item = &InventoryUnit> {
        self.column(column).iter().filter_map(|id| self.cards.get(id))
    }

    /// All cards, column by column.
    #[must_use]
    pub fn units(&self) -> Vec<InventoryUnit> {
        Column::ALL
            .iter()
            .flat_map(|column| self.cards_in(*column))
            .cloned()
            .collect()
    }

    /// Number of cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// `true` when the board has no cards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Insert a card, replacing any card with the same identity.
    pub fn upsert(&mut self, unit: InventoryUnit) -> CardId {
        let id = card_id(&unit);
        let column = unit.status.column();
        if self.cards.insert(id.clone(), unit).is_none() {
            self.column_mut(column).push(id.clone());
        }
        id
    }

    /// Insert a card, adding its quantity to an existing card with the same
    /// identity instead of replacing it. The sum saturates at `i64::MAX`.
    pub fn merge(&mut self, unit: InventoryUnit) -> CardId {
        let id = card_id(&unit);
        match self.cards.get_mut(&id) {
            Some(existing) => {
                existing.quantity_at_location =
                    existing.quantity_at_location.saturating_add(unit.quantity_at_location);
                if unit.ship_type.is_some() {
                    existing.ship_type = unit.ship_type;
                }
                id
            },
            None => self.upsert(unit),
        }
    }

    /// Set a card's quantity, removing the card when nothing is left.
    pub fn set_quantity(&mut self, id: &CardId, quantity: i64) {
        if quantity <= 0 {
            self.remove(id);
        } else if let Some(card) = self.cards.get_mut(id) {
            card.quantity_at_location = quantity;
        }
    }

    /// Remove a card.
    pub fn remove(&mut self, id: &CardId) -> Option<InventoryUnit> {
        let unit = self.cards.remove(id)?;
        self.column_mut(unit.status.column()).retain(|c| c != id);
        Some(unit)
    }

    /// Units of a batch across every column.
    #[must_use]
    pub fn total_for_row(&self, row: RowIndexRef) -> i64 {
        self.cards
            .values()
            .filter(|unit| unit.row == row)
            .fold(0i64, |total, unit| total.saturating_add(unit.quantity_at_location))
    }

    /// Rows that have at least one card.
    #[must_use]
    pub fn rows(&self) -> Vec<RowIndexRef> {
        let mut rows: Vec<RowIndexRef> = self.cards.values().map(|unit| unit.row).collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::normalize;
    use crate::types::UnitStatus;

    fn stocked(row: u64, location: &str, quantity: i64) -> InventoryUnit {
        InventoryUnit::new(RowIndexRef(row), 200, UnitStatus::Stocked, Some(normalize(location)), quantity)
    }

    #[test]
    fn upsert_places_cards_by_status() {
        let mut board = Board::new();
        board.upsert(InventoryUnit::new(RowIndexRef(1), 10, UnitStatus::Manufactured, None, 10));
        board.upsert(stocked(2, "Pallet 1", 5));

        assert_eq!(board.column(Column::Manufactured).len(), 1);
        assert_eq!(board.column(Column::Stock), &[CardId::from("2_pallet-1")]);
        assert!(board.column(Column::Shipped).is_empty());
    }

    #[test]
    fn upsert_replaces_without_duplicating_ids() {
        let mut board = Board::new();
        board.upsert(stocked(2, "Pallet 1", 5));
        board.upsert(stocked(2, "パレット１", 7));

        assert_eq!(board.len(), 1);
        assert_eq!(board.column(Column::Stock).len(), 1);
        assert_eq!(board.total_for_row(RowIndexRef(2)), 7);
    }

    #[test]
    fn merge_adds_to_existing_card() {
        let mut board = Board::new();
        board.merge(stocked(2, "Pallet 1", 5));
        let id = board.merge(stocked(2, "pallet1", 7));

        assert_eq!(board.card(&id).map(|c| c.quantity_at_location), Some(12));
    }

    #[test]
    fn merge_saturates_instead_of_overflowing() {
        let mut board = Board::new();
        board.merge(stocked(2, "Pallet 1", i64::MAX));
        let id = board.merge(stocked(2, "Pallet 1", 1));

        assert_eq!(board.card(&id).map(|c| c.quantity_at_location), Some(i64::MAX));

        board.upsert(stocked(2, "Pallet 3", 5));
        assert_eq!(board.total_for_row(RowIndexRef(2)), i64::MAX);
    }

    #[test]
    fn zero_quantity_removes_card() {
        let mut board = Board::new();
        let id = board.upsert(stocked(3, "Pallet 4", 5));

        board.set_quantity(&id, 0);

        assert!(board.is_empty());
        assert!(board.column(Column::Stock).is_empty());
        assert!(board.remove(&id).is_none());
    }
}
