use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::conflict::check_no_conflict;
use super::{Engine, EngineError, HoldPolicy, SharedItemState, WalCommand};

impl Engine {
    /// Resolve the item for a write, enforcing the item-count limit only when
    /// a new item would be created.
    fn item_for_write(&self, item_id: ItemId) -> Result<SharedItemState, EngineError> {
        if let Some(item) = self.store.get_item(item_id) {
            return Ok(item);
        }
        if self.store.item_count() >= self.max_items {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        Ok(self.store.get_or_create_item(item_id))
    }

    /// Reserve `[start, end]` on an item for a user.
    ///
    /// The conflict check and the insert run under the item's write lock, so
    /// two overlapping requests for the same item can never both succeed.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Reservation, EngineError> {
        let range = req.validate()?;
        let _compaction = self.compaction.read().await;
        let item = self.item_for_write(req.item_id)?;
        let mut guard = item.write().await;
        if guard.reservations.len() >= self.max_reservations_per_item {
            return Err(EngineError::LimitExceeded("too many reservations on item"));
        }

        if let Err(e) = check_no_conflict(&guard, &range) {
            debug!("booking on item {} rejected: {e}", req.item_id);
            metrics::counter!(crate::observability::CONFLICTS_TOTAL, "kind" => "booking").increment(1);
            return Err(e);
        }

        let id = Ulid::new();
        let event = Event::BookingConfirmed {
            id,
            item_id: req.item_id,
            holder_id: req.holder_id,
            range,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL, "kind" => "booking").increment(1);
        info!("booking {id} confirmed on item {} for holder {} ({range})", req.item_id, req.holder_id);
        created(&guard, id)
    }

    /// Block `[start, end]` on an item on behalf of the system.
    pub async fn create_hold(&self, req: HoldRequest) -> Result<Reservation, EngineError> {
        let range = req.validate()?;
        let _compaction = self.compaction.read().await;
        let item = self.item_for_write(req.item_id)?;
        let mut guard = item.write().await;
        if guard.reservations.len() >= self.max_reservations_per_item {
            return Err(EngineError::LimitExceeded("too many reservations on item"));
        }

        match self.hold_policy() {
            HoldPolicy::Checked => {
                if let Err(e) = check_no_conflict(&guard, &range) {
                    debug!("hold on item {} rejected: {e}", req.item_id);
                    metrics::counter!(crate::observability::CONFLICTS_TOTAL, "kind" => "hold").increment(1);
                    return Err(e);
                }
            }
            HoldPolicy::Override => {}
        }

        let id = Ulid::new();
        let event = Event::HoldPlaced {
            id,
            item_id: req.item_id,
            range,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL, "kind" => "hold").increment(1);
        info!("hold {id} placed on item {} ({range})", req.item_id);
        created(&guard, id)
    }

    /// Transition a reservation to `cancelled`. Cancelling twice is a no-op.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _compaction = self.compaction.read().await;
        let item_id = self
            .store
            .item_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let item = self.store.get_item(item_id).ok_or(EngineError::NotFound(id))?;
        let mut guard = item.write().await;

        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if !current.is_confirmed() {
            debug!("reservation {id} already cancelled");
            return Ok(current.clone());
        }

        let event = Event::ReservationCancelled { id, item_id };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
        info!("reservation {id} on item {item_id} cancelled");
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state. Cancelled reservations are kept for audit.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction.write().await;
        let mut events = Vec::new();

        for item_id in self.store.item_ids() {
            let Some(item) = self.store.get_item(item_id) else {
                continue;
            };
            let guard = item.read().await;
            for r in &guard.reservations {
                events.push(if r.is_hold {
                    Event::HoldPlaced {
                        id: r.id,
                        item_id: r.item_id,
                        range: r.range,
                    }
                } else {
                    Event::BookingConfirmed {
                        id: r.id,
                        item_id: r.item_id,
                        holder_id: r.holder_id,
                        range: r.range,
                    }
                });
                if !r.is_confirmed() {
                    events.push(Event::ReservationCancelled {
                        id: r.id,
                        item_id: r.item_id,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn created(item: &ItemState, id: Ulid) -> Result<Reservation, EngineError> {
    item.get(id).cloned().ok_or(EngineError::NotFound(id))
}
