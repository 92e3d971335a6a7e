use chrono::NaiveDate;

pub const MIN_VALID_DATE: NaiveDate = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
pub const MAX_VALID_DATE: NaiveDate = NaiveDate::from_ymd_opt(9999, 12, 31).unwrap();

/// Longest single reservation, in days (both ends inclusive).
pub const MAX_RESERVATION_DAYS: i64 = 3_660;

pub const MAX_RESERVATIONS_PER_ITEM: usize = 100_000;
pub const MAX_ITEMS: usize = 1_000_000;
pub const MAX_SQL_LEN: usize = 64 * 1024;
