use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;

use super::availability::{cottage_conflict, vacancies};
use super::conflict::{checked_stay, validate_window};
use super::{Engine, EngineError, SharedCottageState};

impl Engine {
    /// Read-only availability snapshot. Not a hold: a later `admit` can still
    /// lose the race for the same nights.
    pub async fn check_availability(
        &self,
        cottage_id: Ulid,
        check_in: Day,
        check_out: Day,
    ) -> Result<AvailabilityCheck, EngineError> {
        let stay = checked_stay(check_in, check_out)?;
        let rs = self
            .get_cottage_state(&cottage_id)
            .ok_or(EngineError::CottageNotFound(cottage_id))?;
        let guard = rs.read().await;
        let free = cottage_conflict(&guard, &stay, None).is_none();
        Ok(AvailabilityCheck::from_free(free))
    }

    /// Free stays of a cottage inside `[from, to)`.
    pub async fn vacancies(&self, cottage_id: Ulid, from: Day, to: Day) -> Result<Vec<Stay>, EngineError> {
        let window = Stay::try_new(from, to).ok_or(EngineError::InvalidRange {
            check_in: from,
            check_out: to,
        })?;
        validate_window(&window)?;
        let rs = self
            .get_cottage_state(&cottage_id)
            .ok_or(EngineError::CottageNotFound(cottage_id))?;
        let guard = rs.read().await;
        Ok(vacancies(&guard, &window))
    }

    pub async fn get_cottage(&self, id: Ulid) -> Result<CottageInfo, EngineError> {
        let rs = self
            .get_cottage_state(&id)
            .ok_or(EngineError::CottageNotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    /// All cottages, ordered by name.
    pub async fn list_cottages(&self) -> Vec<CottageInfo> {
        let mut out = Vec::with_capacity(self.cottages.len());
        for rs in self.cottage_snapshot() {
            out.push(rs.read().await.info());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn get_amenity(&self, id: Ulid) -> Result<Amenity, EngineError> {
        self.amenities
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::AmenityNotFound(id))
    }

    /// Amenities ordered by name, descending. With `assigned_only`, only those
    /// attached to at least one cottage.
    pub fn list_amenities(&self, assigned_only: bool) -> Vec<Amenity> {
        let mut out: Vec<Amenity> = self
            .amenities
            .iter()
            .filter(|e| {
                !assigned_only
                    || self
                        .amenity_cottages
                        .get(e.key())
                        .is_some_and(|attached| !attached.is_empty())
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.name.cmp(&a.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let cottage_id = self
            .get_cottage_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let rs = self
            .get_cottage_state(&cottage_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let guard = rs.read().await;
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Reservations of one cottage, ordered by check-in.
    pub async fn list_reservations(&self, cottage_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_cottage_state(&cottage_id)
            .ok_or(EngineError::CottageNotFound(cottage_id))?;
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    /// Reservations made by one caller across all cottages, latest check-in first.
    pub async fn list_reservations_for_owner(&self, owner: &CallerId) -> Vec<Reservation> {
        let mut out = Vec::new();
        for rs in self.cottage_snapshot() {
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().filter(|r| &r.owner == owner).cloned());
        }
        out.sort_by(|a, b| b.stay.check_in.cmp(&a.stay.check_in).then(a.id.cmp(&b.id)));
        out
    }

    /// Subscribe to committed events touching a cottage.
    pub fn subscribe(&self, cottage_id: Ulid) -> Result<broadcast::Receiver<Event>, EngineError> {
        if !self.contains_cottage(&cottage_id) {
            return Err(EngineError::CottageNotFound(cottage_id));
        }
        let rx = self.notify.subscribe(cottage_id);
        // A delete that raced past the first check has already dropped its
        // channel, so the one just created would never be removed.
        if !self.contains_cottage(&cottage_id) {
            self.notify.remove(&cottage_id);
            return Err(EngineError::CottageNotFound(cottage_id));
        }
        Ok(rx)
    }

    pub fn cottage_count(&self) -> usize {
        self.cottages.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_to_cottage.len()
    }

    /// Clone out the cottage handles so no map shard is held across an await.
    fn cottage_snapshot(&self) -> Vec<SharedCottageState> {
        self.cottages.iter().map(|e| e.value().clone()).collect()
    }
}
