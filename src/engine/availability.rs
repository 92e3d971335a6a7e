use chrono::NaiveDate;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Occupied calendar of an item: every date covered by a confirmed
/// reservation (booking or hold), ascending and deduplicated.
pub fn availability(item: &ItemState) -> Availability {
    let booked = occupied_dates(item.confirmed());
    Availability {
        item_id: item.item_id,
        count: booked.len(),
        booked_dates: booked,
    }
}

/// Dates covered by `reservations`. Ranges are merged first, so each
/// occupied day is produced once no matter how many holds stack on it.
pub fn occupied_dates<'a>(reservations: impl IntoIterator<Item = &'a Reservation>) -> Vec<NaiveDate> {
    let mut ranges: Vec<DateRange> = reservations.into_iter().map(|r| r.range).collect();
    ranges.sort_by_key(|r| r.start);
    merge_overlapping(&ranges)
        .iter()
        .flat_map(|r| r.dates())
        .collect()
}

/// Merge start-sorted ranges that share at least one day into disjoint ranges.
pub fn merge_overlapping(sorted: &[DateRange]) -> Vec<DateRange> {
    let mut merged: Vec<DateRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// Result for an item the store has never seen.
pub fn empty_availability(item_id: ItemId) -> Availability {
    Availability {
        item_id,
        booked_dates: Vec::new(),
        count: 0,
    }
}
