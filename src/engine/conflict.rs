use std::collections::HashMap;

use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::cottage_conflict;
use super::EngineError;

/// Strict `check_in < check_out`; zero-night stays are rejected.
pub(crate) fn checked_stay(check_in: Day, check_out: Day) -> Result<Stay, EngineError> {
    let stay = Stay::try_new(check_in, check_out)
        .ok_or(EngineError::InvalidRange { check_in, check_out })?;
    validate_stay(&stay)?;
    Ok(stay)
}

pub(crate) fn validate_stay(stay: &Stay) -> Result<(), EngineError> {
    if stay.check_in < MIN_VALID_DATE || stay.check_out > MAX_VALID_DATE {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn validate_window(window: &Stay) -> Result<(), EngineError> {
    if window.check_in < MIN_VALID_DATE || window.check_out > MAX_VALID_DATE {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if window.nights() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn check_no_conflict(
    cottage: &CottageState,
    stay: &Stay,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match cottage_conflict(cottage, stay, exclude) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

/// Guest-level overlap across all cottages. `stays` holds every reservation of one guest.
pub(crate) fn check_no_guest_conflict(
    stays: &HashMap<Ulid, Stay>,
    stay: &Stay,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for (id, existing) in stays {
        if Some(*id) != exclude && existing.overlaps(stay) {
            return Err(EngineError::GuestConflict(*id));
        }
    }
    Ok(())
}

/// Trimmed, non-empty, bounded text field.
pub(crate) fn required_text(field: &'static str, value: &str, max_len: usize) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidField {
            field,
            reason: "must not be empty".into(),
        });
    }
    if trimmed.len() > max_len {
        return Err(EngineError::LimitExceeded(match field {
            "customer_email" => "email too long",
            "owner" => "caller id too long",
            _ => "name too long",
        }));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn validate_cottage_numbers(base_capacity: u32, price_per_night: Decimal) -> Result<(), EngineError> {
    if base_capacity == 0 {
        return Err(EngineError::InvalidField {
            field: "base_capacity",
            reason: "must be at least 1".into(),
        });
    }
    if price_per_night.is_sign_negative() && !price_per_night.is_zero() {
        return Err(EngineError::InvalidField {
            field: "price_per_night",
            reason: "must not be negative".into(),
        });
    }
    Ok(())
}
