use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque rentable-item id, supplied by the catalog.
pub type ItemId = i64;

/// Opaque holder id, supplied by the identity service.
pub type HolderId = i64;

/// Holder id recorded on administrative holds.
pub const SYSTEM_HOLDER: HolderId = 0;

/// Closed date interval `[start, end]`, day granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Every date in the range, ascending.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        let mut next = Some(self.start);
        std::iter::from_fn(move || {
            let current = next?;
            next = if current < self.end { current.succ_opt() } else { None };
            Some(current)
        })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booking or an administrative hold on one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub item_id: ItemId,
    pub holder_id: HolderId,
    pub range: DateRange,
    pub status: ReservationStatus,
    pub is_hold: bool,
}

impl Reservation {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

/// All reservations of one item, sorted by `range.start`.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub item_id: ItemId,
    pub reservations: Vec<Reservation>,
}

impl ItemState {
    pub fn new(item_id: ItemId) -> Self {
        Self {
            item_id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by range.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.range.start <= reservation.range.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Mark a reservation cancelled. Returns the updated record.
    pub fn cancel(&mut self, id: Ulid) -> Option<&Reservation> {
        let r = self.reservations.iter_mut().find(|r| r.id == id)?;
        r.status = ReservationStatus::Cancelled;
        Some(r)
    }

    /// Reservations (any status) whose range overlaps the query.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.range.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.range.end >= query.start)
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_confirmed())
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed().count()
    }
}

/// WAL record format. Flat, one variant per state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingConfirmed {
        id: Ulid,
        item_id: ItemId,
        holder_id: HolderId,
        range: DateRange,
    },
    HoldPlaced {
        id: Ulid,
        item_id: ItemId,
        range: DateRange,
    },
    ReservationCancelled {
        id: Ulid,
        item_id: ItemId,
    },
}

impl Event {
    pub fn item_id(&self) -> ItemId {
        match self {
            Event::BookingConfirmed { item_id, .. }
            | Event::HoldPlaced { item_id, .. }
            | Event::ReservationCancelled { item_id, .. } => *item_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Occupied calendar of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub item_id: ItemId,
    pub booked_dates: Vec<NaiveDate>,
    pub count: usize,
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub item_id: ItemId,
    pub holder_id: HolderId,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldRequest {
    pub item_id: ItemId,
    pub start: NaiveDate,
    pub end: NaiveDate,
}
