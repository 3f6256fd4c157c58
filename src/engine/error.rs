use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::Day;

#[derive(Debug)]
pub enum EngineError {
    InvalidRange { check_in: Day, check_out: Day },
    Conflict(Ulid),
    GuestConflict(Ulid),
    CottageNotFound(Ulid),
    AmenityNotFound(Ulid),
    ReservationNotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidField { field: &'static str, reason: String },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRange { .. } => ErrorKind::InvalidRange,
            EngineError::Conflict(_) | EngineError::GuestConflict(_) | EngineError::AlreadyExists(_) => {
                ErrorKind::Conflict
            }
            EngineError::CottageNotFound(_)
            | EngineError::AmenityNotFound(_)
            | EngineError::ReservationNotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidField { .. } => ErrorKind::Invalid,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { check_in, check_out } => {
                write!(f, "check-in {check_in} must be before check-out {check_out}")
            }
            EngineError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            EngineError::GuestConflict(id) => {
                write!(f, "guest already holds an overlapping reservation: {id}")
            }
            EngineError::CottageNotFound(id) => write!(f, "cottage not found: {id}"),
            EngineError::AmenityNotFound(id) => write!(f, "amenity not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidField { field, reason } => write!(f, "invalid {field}: {reason}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Machine-readable error class handed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRange,
    Conflict,
    NotFound,
    Invalid,
    LimitExceeded,
    Storage,
}

impl ErrorKind {
    /// HTTP status an HTTP front end should answer with.
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::InvalidRange | ErrorKind::Invalid => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::LimitExceeded => 422,
            ErrorKind::Storage => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRange => "invalid_range",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Storage => "storage",
        }
    }
}
