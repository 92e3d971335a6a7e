use ulid::Ulid;

use crate::model::*;

use super::availability::{availability, empty_availability};
use super::Engine;

impl Engine {
    /// Occupied calendar for an item. Unknown items yield an empty result.
    pub async fn availability(&self, item_id: ItemId) -> Availability {
        let item = match self.store.get_item(item_id) {
            Some(item) => item,
            None => return empty_availability(item_id),
        };
        let guard = item.read().await;
        availability(&guard)
    }

    /// Reservations on the item overlapping `range` with the given status.
    pub async fn find_overlapping(
        &self,
        item_id: ItemId,
        range: DateRange,
        status: ReservationStatus,
    ) -> Vec<Reservation> {
        let item = match self.store.get_item(item_id) {
            Some(item) => item,
            None => return vec![],
        };
        let guard = item.read().await;
        guard
            .overlapping(&range)
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// All confirmed bookings and holds on the item.
    pub async fn list_confirmed(&self, item_id: ItemId) -> Vec<Reservation> {
        let item = match self.store.get_item(item_id) {
            Some(item) => item,
            None => return vec![],
        };
        let guard = item.read().await;
        guard.confirmed().cloned().collect()
    }

    /// Every reservation on the item, cancelled ones included.
    pub async fn list_reservations(&self, item_id: ItemId) -> Vec<Reservation> {
        let item = match self.store.get_item(item_id) {
            Some(item) => item,
            None => return vec![],
        };
        let guard = item.read().await;
        guard.reservations.clone()
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let item_id = self.store.item_for_reservation(&id)?;
        let item = self.store.get_item(item_id)?;
        let guard = item.read().await;
        guard.get(id).cloned()
    }
}
