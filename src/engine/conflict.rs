use chrono::NaiveDate;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    use crate::limits::*;
    if start > end {
        return Err(EngineError::Validation(format!(
            "start date {start} is after end date {end}"
        )));
    }
    if start < MIN_VALID_DATE || end > MAX_VALID_DATE {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    let range = DateRange::new(start, end);
    if range.days() > MAX_RESERVATION_DAYS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(range)
}

/// First confirmed reservation on the item overlapping `range`, if any.
/// Bookings and holds block alike; cancelled records never do.
pub fn has_conflict<'a>(item: &'a ItemState, range: &DateRange) -> Option<&'a Reservation> {
    item.overlapping(range).find(|r| r.is_confirmed())
}

pub(crate) fn check_no_conflict(item: &ItemState, range: &DateRange) -> Result<(), EngineError> {
    match has_conflict(item, range) {
        Some(existing) => Err(EngineError::Conflict {
            item_id: item.item_id,
            existing: Box::new(existing.clone()),
        }),
        None => Ok(()),
    }
}

impl BookingRequest {
    /// Check the request before anything touches the store.
    pub fn validate(&self) -> Result<DateRange, EngineError> {
        validate_range(self.start, self.end)
    }
}

impl HoldRequest {
    pub fn validate(&self) -> Result<DateRange, EngineError> {
        validate_range(self.start, self.end)
    }
}
