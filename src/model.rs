use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::capacity;

/// A calendar day. A stay occupies the night that starts on each of its days.
pub type Day = NaiveDate;

/// Half-open date range `[check_in, check_out)`.
///
/// The check-out day is not occupied, so a stay ending on day D and another
/// starting on day D share no night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub check_in: Day,
    pub check_out: Day,
}

impl Stay {
    pub fn new(check_in: Day, check_out: Day) -> Self {
        debug_assert!(check_in < check_out, "Stay check-in must be before check-out");
        Self { check_in, check_out }
    }

    /// Returns `None` unless `check_in` strictly precedes `check_out`.
    pub fn try_new(check_in: Day, check_out: Day) -> Option<Self> {
        (check_in < check_out).then_some(Self { check_in, check_out })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

}

impl fmt::Display for Stay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

/// Cottage tier. A plain tag: nothing in the ledger branches on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Standard,
    Luxury,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Standard => f.write_str("standard"),
            Category::Luxury => f.write_str("luxury"),
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Category::Standard),
            "luxury" => Ok(Category::Luxury),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Identity of an already-authorised caller, kept for attribution only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amenity {
    pub id: Ulid,
    pub name: String,
    pub additional_capacity: u32,
    pub owner: CallerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub cottage_id: Ulid,
    pub owner: CallerId,
    pub stay: Stay,
    pub customer_name: String,
    pub customer_email: String,
    pub confirmed: bool,
}

impl Reservation {
    /// Key used to match the same guest across cottages.
    pub fn guest_key(&self) -> String {
        guest_key(&self.customer_email)
    }
}

pub fn guest_key(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct CottageState {
    pub id: Ulid,
    pub name: String,
    pub category: Category,
    pub base_capacity: u32,
    pub price_per_night: Decimal,
    pub amenities: BTreeSet<Ulid>,
    /// Cached `base_capacity + Σ additional_capacity`; only [`CottageState::recompute_capacity`] writes it.
    total_capacity: u32,
    /// Reservations sorted by `stay.check_in`.
    pub reservations: Vec<Reservation>,
}

impl CottageState {
    pub fn new(id: Ulid, name: String, category: Category, base_capacity: u32, price_per_night: Decimal) -> Self {
        Self {
            id,
            name,
            category,
            base_capacity,
            price_per_night,
            amenities: BTreeSet::new(),
            total_capacity: base_capacity,
            reservations: Vec::new(),
        }
    }

    pub fn total_capacity(&self) -> u32 {
        self.total_capacity
    }

    /// Refresh the capacity cache from the given amenity capacities.
    pub fn recompute_capacity(&mut self, additional: impl IntoIterator<Item = u32>) {
        self.total_capacity = capacity::total_capacity(self.base_capacity, additional);
    }

    /// Insert reservation maintaining sort order by check-in.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.stay.check_in, |r| r.stay.check_in)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Return only reservations whose stay overlaps the query.
    /// Uses binary search to skip reservations checking in at or after `query.check_out`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.stay.check_in < query.check_out);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay.check_out > query.check_in)
    }

    pub fn info(&self) -> CottageInfo {
        CottageInfo {
            id: self.id,
            name: self.name.clone(),
            category: self.category,
            base_capacity: self.base_capacity,
            price_per_night: self.price_per_night,
            amenities: self.amenities.iter().copied().collect(),
            total_capacity: self.total_capacity,
        }
    }
}

/// Committed changes, flat. This is also the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CottageCreated {
        id: Ulid,
        name: String,
        category: Category,
        base_capacity: u32,
        price_per_night: Decimal,
    },
    CottageUpdated {
        id: Ulid,
        name: String,
        category: Category,
        base_capacity: u32,
        price_per_night: Decimal,
    },
    CottageDeleted {
        id: Ulid,
    },
    AmenityCreated {
        id: Ulid,
        name: String,
        additional_capacity: u32,
        owner: CallerId,
    },
    AmenityUpdated {
        id: Ulid,
        name: String,
        additional_capacity: u32,
    },
    AmenityDeleted {
        id: Ulid,
    },
    AmenityAttached {
        cottage_id: Ulid,
        amenity_id: Ulid,
    },
    AmenityDetached {
        cottage_id: Ulid,
        amenity_id: Ulid,
    },
    ReservationAdmitted {
        id: Ulid,
        cottage_id: Ulid,
        owner: CallerId,
        stay: Stay,
        customer_name: String,
        customer_email: String,
    },
    ReservationModified {
        id: Ulid,
        cottage_id: Ulid,
        stay: Stay,
        customer_name: String,
        customer_email: String,
    },
    ReservationCancelled {
        id: Ulid,
        cottage_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CottageInfo {
    pub id: Ulid,
    pub name: String,
    pub category: Category,
    pub base_capacity: u32,
    pub price_per_night: Decimal,
    pub amenities: Vec<Ulid>,
    pub total_capacity: u32,
}

/// Read-only availability answer. A snapshot, not a hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityCheck {
    pub available: bool,
    pub message: String,
}

pub const AVAILABLE_MESSAGE: &str = "The cottage is available for the selected dates.";
pub const NOT_AVAILABLE_MESSAGE: &str = "The cottage is not available for the selected dates.";

impl AvailabilityCheck {
    pub fn from_free(free: bool) -> Self {
        let message = if free { AVAILABLE_MESSAGE } else { NOT_AVAILABLE_MESSAGE };
        Self {
            available: free,
            message: message.to_string(),
        }
    }
}

// ── Command inputs ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCottage {
    pub name: String,
    #[serde(default)]
    pub category: Category,
    pub base_capacity: u32,
    pub price_per_night: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CottagePatch {
    pub name: Option<String>,
    pub category: Option<Category>,
    pub base_capacity: Option<u32>,
    pub price_per_night: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmenityPatch {
    pub name: Option<String>,
    pub additional_capacity: Option<u32>,
}

/// Reservation fields after request validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationFields {
    pub cottage_id: Ulid,
    pub check_in: Day,
    pub check_out: Day,
    pub customer_name: String,
    pub customer_email: String,
}

/// Fields of an in-place reservation edit; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub check_in: Option<Day>,
    pub check_out: Option<Day>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
}
