mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{availability, occupied_dates};
pub use conflict::has_conflict;
pub use error::EngineError;
pub use store::ReservationStore;

use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::model::*;
use crate::wal::Wal;

pub type SharedItemState = Arc<RwLock<ItemState>>;

/// Whether administrative holds go through the conflict check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HoldPolicy {
    /// Holds are rejected when they overlap a confirmed booking or hold.
    #[default]
    Checked,
    /// Holds are placed regardless of existing reservations.
    Override,
}

impl FromStr for HoldPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checked" => Ok(HoldPolicy::Checked),
            "override" => Ok(HoldPolicy::Override),
            other => Err(format!("unknown hold policy: {other} (expected checked or override)")),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailNextWrite,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel drained
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

/// Stage and commit the whole batch, or none of it. Any failure rolls the
/// file back to the last committed entry so a rejected event can never be
/// replayed later.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further writes: {e}");
        }
    }
    result
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailNextWrite => wal.fail_next_write(),
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The booking/hold lifecycle manager and sole writer of the store.
pub struct Engine {
    pub(super) store: ReservationStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared; compaction holds it exclusively so its
    /// snapshot can't miss an append that lands in the old WAL file.
    pub(super) compaction: RwLock<()>,
    hold_policy: HoldPolicy,
    pub(super) max_items: usize,
    pub(super) max_reservations_per_item: usize,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the background writer.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf, hold_policy: HoldPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: ReservationStore::new(),
            wal_tx,
            compaction: RwLock::new(()),
            hold_policy,
            max_items: crate::limits::MAX_ITEMS,
            max_reservations_per_item: crate::limits::MAX_RESERVATIONS_PER_ITEM,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this runs inside an async context.
        for event in &events {
            let shared = engine.store.get_or_create_item(event.item_id());
            let mut guard = shared
                .try_write()
                .map_err(|_| io::Error::other("replay: item state contended"))?;
            engine.store.apply_event(&mut guard, event);
        }

        info!(
            "replayed {} events into {} items from {}",
            events.len(),
            engine.store.item_count(),
            wal_path.display()
        );
        Ok(engine)
    }

    pub fn hold_policy(&self) -> HoldPolicy {
        self.hold_policy
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    #[cfg(test)]
    pub(super) fn with_ceilings(mut self, max_items: usize, max_reservations_per_item: usize) -> Self {
        self.max_items = max_items;
        self.max_reservations_per_item = max_reservations_per_item;
        self
    }

    /// Make the writer's next flush fail after a partial write.
    #[cfg(test)]
    pub(super) async fn fail_next_wal_write(&self) {
        let _ = self.wal_tx.send(WalCommand::FailNextWrite).await;
    }

    pub fn get_item(&self, item_id: ItemId) -> Option<SharedItemState> {
        self.store.get_item(item_id)
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        item: &mut ItemState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(item, event);
        Ok(())
    }
}
