//! Hard caps on catalogue size, field lengths and date ranges.

use chrono::NaiveDate;

pub const MAX_COTTAGES: usize = 10_000;
pub const MAX_AMENITIES: usize = 10_000;
pub const MAX_AMENITIES_PER_COTTAGE: usize = 64;
pub const MAX_RESERVATIONS_PER_COTTAGE: usize = 20_000;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_CALLER_ID_LEN: usize = 255;

/// Longest single stay, in nights.
pub const MAX_STAY_NIGHTS: i64 = 366;

/// Widest window accepted by the vacancy calendar, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;

pub const MIN_VALID_DATE: NaiveDate = match NaiveDate::from_ymd_opt(2000, 1, 1) {
    Some(d) => d,
    None => panic!("invalid MIN_VALID_DATE"),
};

pub const MAX_VALID_DATE: NaiveDate = match NaiveDate::from_ymd_opt(2200, 1, 1) {
    Some(d) => d,
    None => panic!("invalid MAX_VALID_DATE"),
};

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
