use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedItemState;

/// In-memory half of the Interval Store: per-item state plus a reverse
/// index from reservation id to item.
pub struct ReservationStore {
    items: DashMap<ItemId, SharedItemState>,
    reservation_to_item: DashMap<Ulid, ItemId>,
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            reservation_to_item: DashMap::new(),
        }
    }

    // ── Items ────────────────────────────────────────────────

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn get_item(&self, item_id: ItemId) -> Option<SharedItemState> {
        self.items.get(&item_id).map(|e| e.value().clone())
    }

    /// Item state, created empty on first use.
    pub fn get_or_create_item(&self, item_id: ItemId) -> SharedItemState {
        self.items
            .entry(item_id)
            .or_insert_with(|| Arc::new(RwLock::new(ItemState::new(item_id))))
            .value()
            .clone()
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|e| *e.key()).collect()
    }

    // ── Reservation index ────────────────────────────────────

    pub fn item_for_reservation(&self, id: &Ulid) -> Option<ItemId> {
        self.reservation_to_item.get(id).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to an item. Caller holds the item lock.
    pub fn apply_event(&self, item: &mut ItemState, event: &Event) {
        match event {
            Event::BookingConfirmed {
                id,
                item_id,
                holder_id,
                range,
            } => {
                item.insert(Reservation {
                    id: *id,
                    item_id: *item_id,
                    holder_id: *holder_id,
                    range: *range,
                    status: ReservationStatus::Confirmed,
                    is_hold: false,
                });
                self.reservation_to_item.insert(*id, *item_id);
            }
            Event::HoldPlaced { id, item_id, range } => {
                item.insert(Reservation {
                    id: *id,
                    item_id: *item_id,
                    holder_id: SYSTEM_HOLDER,
                    range: *range,
                    status: ReservationStatus::Confirmed,
                    is_hold: true,
                });
                self.reservation_to_item.insert(*id, *item_id);
            }
            // Cancelled records stay in the item for audit.
            Event::ReservationCancelled { id, .. } => {
                item.cancel(*id);
            }
        }
    }
}
