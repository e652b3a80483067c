//! Card identity and merging of query results into a board.
//!
//! A stocked batch can come back from the backend as several records at the
//! same location (multiple packing rows, or spellings that normalize to the
//! same key). Those records collapse into one card whose quantity is their
//! sum. Manufactured and shipped records share one card per row and status,
//! so several shipments of a batch add up on that card.

use crate::board::Board;
use crate::location::{LocationCatalog, normalize};
use crate::types::{CardId, InventoryUnit, RowIndexRef, UnitStatus};
use std::collections::HashMap;

/// Deterministic card id: `{row}_{location key}` for a stocked unit at a
/// known location, `{row}_{status}` otherwise.
#[must_use]
pub fn card_id(unit: &InventoryUnit) -> CardId {
    match unit.stock_key() {
        Some(key) => CardId::from(format!("{}_{key}", unit.row)),
        None => CardId::from(format!("{}_{}", unit.row, unit.status.as_str())),
    }
}

/// Build a board and its location catalog from one batch of query results.
///
/// `known_locations` seeds the catalog (the built-in storage options are used
/// when it is empty); every location seen on a stocked record is added to it.
/// Stocked groups whose total is zero or less are dropped. Quantities never
/// overflow; sums saturate at `i64::MAX`.
#[must_use]
pub fn merge_into_board<S: AsRef<str>>(
    units: Vec<InventoryUnit>,
    known_locations: &[S],
) -> (Board, LocationCatalog) {
    let mut catalog = LocationCatalog::seeded(known_locations);
    let mut board = Board::new();

    let mut groups: Vec<InventoryUnit> = Vec::new();
    let mut group_index: HashMap<(RowIndexRef, String), usize> = HashMap::new();

    for mut unit in units {
        if unit.status != UnitStatus::Stocked {
            board.merge(unit);
            continue;
        }

        unit.location = unit
            .location
            .as_ref()
            .map(|location| normalize(&location.label))
            .filter(|location| !location.is_empty());

        if let Some(location) = &unit.location {
            catalog.observe(location);
        }

        let key = (unit.row, unit.stock_key().unwrap_or_default().to_string());
        match group_index.get(&key) {
            Some(&index) => {
                let group = &mut groups[index];
                group.quantity_at_location =
                    group.quantity_at_location.saturating_add(unit.quantity_at_location);
            },
            None => {
                group_index.insert(key, groups.len());
                groups.push(unit);
            },
        }
    }

    for group in groups {
        if group.quantity_at_location > 0 {
            board.upsert(group);
        }
    }

    (board, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::types::Column;
    use proptest::prelude::*;

    fn unit(row: u64, status: UnitStatus, location: Option<&str>, quantity: i64) -> InventoryUnit {
        InventoryUnit::new(
            RowIndexRef(row),
            200,
            status,
            location.map(|raw| Location {
                key: raw.to_string(),
                label: raw.to_string(),
            }),
            quantity,
        )
    }

    #[test]
    fn ids_follow_location_or_status() {
        let stocked = unit(1645, UnitStatus::Stocked, Some("Pallet 1"), 50);
        let mut normalized = stocked.clone();
        normalized.location = Some(normalize("Pallet 1"));

        assert_eq!(card_id(&normalized), CardId::from("1645_pallet-1"));
        assert_eq!(card_id(&unit(1645, UnitStatus::Manufactured, None, 150)), CardId::from("1645_manufactured"));
        assert_eq!(card_id(&unit(1645, UnitStatus::Shipped, Some("Pallet 1"), 5)), CardId::from("1645_shipped"));
        assert_eq!(card_id(&unit(9, UnitStatus::Stocked, None, 5)), CardId::from("9_stocked"));
    }

    #[test]
    fn stocked_records_at_one_location_collapse() {
        let (board, catalog) = merge_into_board::<&str>(
            vec![
                unit(1646, UnitStatus::Stocked, Some("パレット２"), 60),
                unit(1646, UnitStatus::Stocked, Some("Pallet 2"), 40),
                unit(1646, UnitStatus::Stocked, Some("Pallet 3"), 10),
                unit(1645, UnitStatus::Manufactured, None, 200),
            ],
            &[],
        );

        let stock: Vec<_> = board.cards_in(Column::Stock).collect();
        assert_eq!(stock.len(), 2);
        assert_eq!(stock[0].quantity_at_location, 100);
        assert_eq!(stock[0].location.as_ref().map(|l| l.label.as_str()), Some("Pallet2"));
        assert_eq!(board.column(Column::Manufactured).len(), 1);
        assert_eq!(catalog.label_for("pallet-3"), Some("Pallet3"));
    }

    #[test]
    fn empty_groups_are_dropped() {
        let (board, _) = merge_into_board::<&str>(
            vec![
                unit(7, UnitStatus::Stocked, Some("Pallet 1"), 0),
                unit(8, UnitStatus::Stocked, Some("Pallet 1"), 5),
                unit(8, UnitStatus::Stocked, Some("Pallet 1"), -5),
            ],
            &[],
        );

        assert!(board.is_empty());
    }

    #[test]
    fn shipped_records_for_one_row_keep_their_total() {
        let (board, _) = merge_into_board::<&str>(
            vec![
                unit(1646, UnitStatus::Shipped, Some("パレット①"), 30),
                unit(1646, UnitStatus::Shipped, Some("パレット②"), 20),
                unit(1646, UnitStatus::Stocked, Some("Pallet 2"), 50),
            ],
            &[],
        );

        let shipped: Vec<_> = board.cards_in(Column::Shipped).collect();
        assert_eq!(shipped.len(), 1);
        assert_eq!(shipped[0].quantity_at_location, 50);
        assert_eq!(board.total_for_row(RowIndexRef(1646)), 100);
    }

    #[test]
    fn manufactured_records_for_one_row_add_up() {
        let (board, _) = merge_into_board::<&str>(
            vec![
                unit(1645, UnitStatus::Manufactured, None, 150),
                unit(1645, UnitStatus::Manufactured, None, 25),
                unit(1645, UnitStatus::Shipped, None, 10),
                unit(1645, UnitStatus::Shipped, Some("Dock A"), 15),
                unit(1645, UnitStatus::Shipped, None, 5),
            ],
            &[],
        );

        let manufactured = board.card(&CardId::from("1645_manufactured")).unwrap();
        assert_eq!(manufactured.quantity_at_location, 175);
        let shipped = board.card(&CardId::from("1645_shipped")).unwrap();
        assert_eq!(shipped.quantity_at_location, 30);
        assert_eq!(board.total_for_row(RowIndexRef(1645)), 205);
    }

    #[test]
    fn stocked_sums_saturate() {
        let (board, _) = merge_into_board::<&str>(
            vec![
                unit(5, UnitStatus::Stocked, Some("Pallet 1"), i64::MAX),
                unit(5, UnitStatus::Stocked, Some("Pallet 1"), 10),
            ],
            &[],
        );

        assert_eq!(board.total_for_row(RowIndexRef(5)), i64::MAX);
    }

    #[test]
    fn known_locations_seed_the_catalog() {
        let (_, catalog) = merge_into_board(Vec::new(), &["Dock A".to_string()]);
        assert_eq!(catalog.labels(), vec!["Dock A".to_string()]);
    }

    fn arbitrary_unit() -> impl Strategy<Value = InventoryUnit> {
        (
            1u64..4,
            prop_oneof![
                Just(UnitStatus::Manufactured),
                Just(UnitStatus::Stocked),
                Just(UnitStatus::Shipped)
            ],
            prop::option::of(prop_oneof![
                Just("Pallet 1"),
                Just("パレット①"),
                Just("pallet2"),
                Just("仮置きパレット"),
                Just("台車")
            ]),
            0i64..500,
        )
            .prop_map(|(row, status, location, quantity)| unit(row, status, location, quantity))
    }

    proptest! {
        #[test]
        fn merging_is_a_fixpoint(units in prop::collection::vec(arbitrary_unit(), 0..20)) {
            let (once, _) = merge_into_board::<&str>(units, &[]);
            let (twice, _) = merge_into_board::<&str>(once.units(), &[]);
            prop_assert_eq!(twice, once);
        }

        #[test]
        fn merging_keeps_stocked_totals(units in prop::collection::vec(arbitrary_unit(), 0..20)) {
            let stocked_total: i64 = units
                .iter()
                .filter(|u| u.status == UnitStatus::Stocked)
                .map(|u| u.quantity_at_location)
                .sum();
            let (board, _) = merge_into_board::<&str>(units, &[]);
            let merged_total: i64 = board.cards_in(Column::Stock).map(|u| u.quantity_at_location).sum();
            prop_assert_eq!(merged_total, stocked_total);
        }

        #[test]
        fn merging_keeps_row_totals(units in prop::collection::vec(arbitrary_unit(), 0..20)) {
            let mut expected: HashMap<RowIndexRef, i64> = HashMap::new();
            for unit in &units {
                *expected.entry(unit.row).or_default() += unit.quantity_at_location;
            }
            let (board, _) = merge_into_board::<&str>(units, &[]);
            for (row, total) in expected {
                prop_assert_eq!(board.total_for_row(row), total);
            }
        }
    }
}
