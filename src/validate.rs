//! Field-level validation of reservation requests, run before the ledger sees them.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use validator::{Validate, ValidationErrors};

use crate::engine::{Engine, ErrorKind};
use crate::model::{Day, ReservationFields, ReservationPatch};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Field name used for violations that span more than one field.
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

const REQUIRED: &str = "This field is required.";
const INVALID_DATE: &str = "Enter a valid date in YYYY-MM-DD format.";
const INVALID_EMAIL: &str = "Enter a valid email address.";
const DATE_ORDER: &str = "Check-out date must be after check-in date.";

/// Fields whose violations mean the date range itself is bad.
const RANGE_FIELDS: [&str; 3] = ["check_in", "check_out", NON_FIELD_ERRORS];

/// Unparsed reservation input as it arrives from a client.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct RawReservation {
    #[validate(length(min = 1, message = "This field is required."))]
    pub cottage_id: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub check_in: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub check_out: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub customer_name: String,
    #[validate(email(message = "Enter a valid email address."))]
    pub customer_email: String,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct RawReservationPatch {
    pub check_in: Option<String>,
    pub check_out: Option<String>,
    #[validate(length(min = 1, message = "This field may not be blank."))]
    pub customer_name: Option<String>,
    #[validate(email(message = "Enter a valid email address."))]
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationFailure {
    pub violations: Vec<FieldViolation>,
}

impl ValidationFailure {
    fn push(&mut self, field: &str, message: &str) {
        self.violations.push(FieldViolation {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    fn has(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }

    /// `InvalidRange` when only the dates are wrong, `Invalid` otherwise.
    pub fn kind(&self) -> ErrorKind {
        let range_only = !self.violations.is_empty()
            && self.violations.iter().all(|v| RANGE_FIELDS.contains(&v.field.as_str()));
        if range_only { ErrorKind::InvalidRange } else { ErrorKind::Invalid }
    }

    fn into_result<T>(mut self, value: impl FnOnce() -> T) -> Result<T, ValidationFailure> {
        if self.violations.is_empty() {
            Ok(value())
        } else {
            self.violations.sort_by(|a, b| a.field.cmp(&b.field));
            Err(self)
        }
    }
}

impl From<ValidationErrors> for ValidationFailure {
    fn from(errors: ValidationErrors) -> Self {
        let violations = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| FieldViolation {
                    field: field.to_string(),
                    message: e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string()),
                })
            })
            .collect();
        Self { violations }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.violations.is_empty() {
            return write!(f, "validation failed");
        }
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", v.field, v.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationFailure {}

fn parse_date(failure: &mut ValidationFailure, field: &str, value: &str) -> Option<Day> {
    match NaiveDate::parse_from_str(value, DATE_FORMAT) {
        Ok(day) => Some(day),
        Err(_) => {
            if !failure.has(field) {
                failure.push(field, INVALID_DATE);
            }
            None
        }
    }
}

fn trim_opt(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string())
}

/// Normalize and check a new reservation. Every violation is reported, not just the first.
pub fn validate_reservation(raw: RawReservation, engine: &Engine) -> Result<ReservationFields, ValidationFailure> {
    let raw = RawReservation {
        cottage_id: raw.cottage_id.trim().to_string(),
        check_in: raw.check_in.trim().to_string(),
        check_out: raw.check_out.trim().to_string(),
        customer_name: raw.customer_name.trim().to_string(),
        customer_email: raw.customer_email.trim().to_string(),
    };

    let mut failure = match raw.validate() {
        Ok(()) => ValidationFailure::default(),
        Err(errors) => errors.into(),
    };
    if raw.customer_email.is_empty() && !failure.has("customer_email") {
        failure.push("customer_email", REQUIRED);
    }

    let check_in = parse_date(&mut failure, "check_in", &raw.check_in);
    let check_out = parse_date(&mut failure, "check_out", &raw.check_out);
    if let (Some(a), Some(b)) = (check_in, check_out)
        && a >= b
    {
        failure.push(NON_FIELD_ERRORS, DATE_ORDER);
    }

    let cottage_id = if failure.has("cottage_id") {
        None
    } else {
        match raw.cottage_id.parse::<Ulid>() {
            Ok(id) if engine.contains_cottage(&id) => Some(id),
            _ => {
                failure.push("cottage_id", &format!("Invalid pk \"{}\" - object does not exist.", raw.cottage_id));
                None
            }
        }
    };

    failure.into_result(|| ReservationFields {
        cottage_id: cottage_id.unwrap_or_default(),
        check_in: check_in.unwrap_or_default(),
        check_out: check_out.unwrap_or_default(),
        customer_name: raw.customer_name,
        customer_email: raw.customer_email,
    })
}

/// Normalize and check a reservation update. When both dates are given they
/// must be ordered; ordering against stored dates is left to the ledger.
pub fn validate_patch(raw: RawReservationPatch) -> Result<ReservationPatch, ValidationFailure> {
    let raw = RawReservationPatch {
        check_in: trim_opt(raw.check_in),
        check_out: trim_opt(raw.check_out),
        customer_name: trim_opt(raw.customer_name),
        customer_email: trim_opt(raw.customer_email),
    };

    let mut failure = match raw.validate() {
        Ok(()) => ValidationFailure::default(),
        Err(errors) => errors.into(),
    };

    let check_in = raw
        .check_in
        .as_deref()
        .and_then(|v| parse_date(&mut failure, "check_in", v));
    let check_out = raw
        .check_out
        .as_deref()
        .and_then(|v| parse_date(&mut failure, "check_out", v));
    if let (Some(a), Some(b)) = (check_in, check_out)
        && a >= b
    {
        failure.push(NON_FIELD_ERRORS, DATE_ORDER);
    }

    failure.into_result(|| ReservationPatch {
        check_in,
        check_out,
        customer_name: raw.customer_name,
        customer_email: raw.customer_email,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LedgerOptions;
    use crate::model::NewCottage;
    use crate::notify::NotifyHub;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    async fn engine_with_cottage(name: &str) -> (Engine, Ulid) {
        let dir = std::env::temp_dir().join("cottage_ledger_test_validate");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), LedgerOptions::default()).unwrap();
        let cottage = engine
            .create_cottage(NewCottage {
                name: "Pine".into(),
                category: Default::default(),
                base_capacity: 4,
                price_per_night: Decimal::new(9900, 2),
            })
            .await
            .unwrap();
        (engine, cottage.id)
    }

    fn raw(cottage_id: Ulid) -> RawReservation {
        RawReservation {
            cottage_id: cottage_id.to_string(),
            check_in: "2024-10-01".into(),
            check_out: "2024-10-05".into(),
            customer_name: " John Doe ".into(),
            customer_email: "john.doe@example.com".into(),
        }
    }

    fn fields(failure: &ValidationFailure) -> Vec<&str> {
        failure.violations.iter().map(|v| v.field.as_str()).collect()
    }

    #[tokio::test]
    async fn valid_request_is_normalized() {
        let (engine, cid) = engine_with_cottage("valid.wal").await;
        let out = assert_ok!(validate_reservation(raw(cid), &engine));
        assert_eq!(out.cottage_id, cid);
        assert_eq!(out.customer_name, "John Doe");
        assert_eq!(out.check_in.to_string(), "2024-10-01");
    }

    #[tokio::test]
    async fn reversed_dates_are_a_non_field_error() {
        let (engine, cid) = engine_with_cottage("reversed.wal").await;
        let mut r = raw(cid);
        r.check_in = "2024-10-05".into();
        r.check_out = "2024-10-01".into();
        let failure = assert_err!(validate_reservation(r, &engine));
        assert_eq!(fields(&failure), vec![NON_FIELD_ERRORS]);
        assert_eq!(failure.kind(), ErrorKind::InvalidRange);
    }

    #[tokio::test]
    async fn reports_every_bad_field() {
        let (engine, cid) = engine_with_cottage("every.wal").await;
        let mut r = raw(cid);
        r.check_in = "01/10/2024".into();
        r.customer_name = "   ".into();
        r.customer_email = "not-an-email".into();
        let failure = assert_err!(validate_reservation(r, &engine));
        assert_eq!(fields(&failure), vec!["check_in", "customer_email", "customer_name"]);
        assert_eq!(failure.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn unknown_cottage_is_rejected() {
        let (engine, _) = engine_with_cottage("unknown.wal").await;
        let failure = assert_err!(validate_reservation(raw(Ulid::new()), &engine));
        assert_eq!(fields(&failure), vec!["cottage_id"]);

        let mut r = raw(Ulid::new());
        r.cottage_id = "42".into();
        let failure = assert_err!(validate_reservation(r, &engine));
        assert_eq!(fields(&failure), vec!["cottage_id"]);
    }

    #[tokio::test]
    async fn missing_fields_are_required() {
        let (engine, _) = engine_with_cottage("missing.wal").await;
        let failure = assert_err!(validate_reservation(RawReservation::default(), &engine));
        assert_eq!(
            fields(&failure),
            vec!["check_in", "check_out", "cottage_id", "customer_email", "customer_name"]
        );
        assert!(failure.violations.iter().all(|v| v.message == REQUIRED || v.message == INVALID_EMAIL));
    }

    #[test]
    fn patch_checks_only_present_fields() {
        let patch = assert_ok!(validate_patch(RawReservationPatch {
            check_out: Some("2024-10-09".into()),
            ..Default::default()
        }));
        assert_eq!(patch.check_out.map(|d| d.to_string()).as_deref(), Some("2024-10-09"));
        assert!(patch.check_in.is_none());

        let failure = assert_err!(validate_patch(RawReservationPatch {
            check_in: Some("2024-10-09".into()),
            check_out: Some("2024-10-09".into()),
            customer_email: Some("nope".into()),
            ..Default::default()
        }));
        assert_eq!(fields(&failure), vec!["customer_email", NON_FIELD_ERRORS]);
        assert_eq!(failure.kind(), ErrorKind::Invalid);

        let failure = assert_err!(validate_patch(RawReservationPatch {
            check_in: Some("someday".into()),
            ..Default::default()
        }));
        assert_eq!(fields(&failure), vec!["check_in"]);
        assert_eq!(failure.kind(), ErrorKind::InvalidRange);
    }

    #[test]
    fn display_joins_violations() {
        let mut failure = ValidationFailure::default();
        failure.push("check_in", INVALID_DATE);
        failure.push(NON_FIELD_ERRORS, DATE_ORDER);
        assert_eq!(
            failure.to_string(),
            format!("check_in: {INVALID_DATE}; non_field_errors: {DATE_ORDER}")
        );
    }
}
