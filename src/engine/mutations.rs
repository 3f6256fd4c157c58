use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, checked_stay, required_text, validate_cottage_numbers};
use super::{CottageWriteGuard, Engine, EngineError, GuestGuard, WalCommand};

impl Engine {
    // ── Cottages ─────────────────────────────────────────────

    pub async fn create_cottage(&self, new: NewCottage) -> Result<CottageInfo, EngineError> {
        let _catalogue = self.catalogue.lock().await;
        if self.cottages.len() >= MAX_COTTAGES {
            return Err(EngineError::LimitExceeded("too many cottages"));
        }
        let name = required_text("name", &new.name, MAX_NAME_LEN)?;
        validate_cottage_numbers(new.base_capacity, new.price_per_night)?;

        let id = Ulid::new();
        let event = Event::CottageCreated {
            id,
            name: name.clone(),
            category: new.category,
            base_capacity: new.base_capacity,
            price_per_night: new.price_per_night,
        };
        self.wal_append(&event).await?;
        let cs = CottageState::new(id, name, new.category, new.base_capacity, new.price_per_night);
        let info = cs.info();
        self.cottages.insert(id, Arc::new(RwLock::new(cs)));
        self.notify.send(id, &event);
        info!("cottage {id} created ({})", info.name);
        Ok(info)
    }

    pub async fn update_cottage(&self, id: Ulid, patch: CottagePatch) -> Result<CottageInfo, EngineError> {
        let mut guard = self.lock_cottage(id).await?;
        let name = match patch.name {
            Some(ref n) => required_text("name", n, MAX_NAME_LEN)?,
            None => guard.name.clone(),
        };
        let category = patch.category.unwrap_or(guard.category);
        let base_capacity = patch.base_capacity.unwrap_or(guard.base_capacity);
        let price_per_night = patch.price_per_night.unwrap_or(guard.price_per_night);
        validate_cottage_numbers(base_capacity, price_per_night)?;

        let event = Event::CottageUpdated { id, name, category, base_capacity, price_per_night };
        self.persist_and_apply(id, &mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Delete a cottage together with all of its reservations. Returns how many
    /// reservations went with it.
    pub async fn delete_cottage(&self, id: Ulid) -> Result<usize, EngineError> {
        let _catalogue = self.catalogue.lock().await;
        let mut guard = self.lock_cottage(id).await?;

        let event = Event::CottageDeleted { id };
        self.wal_append(&event).await?;
        self.forget_cottage(&guard);
        // Removed while still locked so waiters see the cottage as gone.
        self.cottages.remove(&id);
        let cascaded = guard.reservations.len();
        guard.reservations.clear();
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!("cottage {id} deleted with {cascaded} reservations");
        Ok(cascaded)
    }

    // ── Amenities ────────────────────────────────────────────

    pub async fn create_amenity(
        &self,
        name: &str,
        additional_capacity: u32,
        owner: CallerId,
    ) -> Result<Amenity, EngineError> {
        let _catalogue = self.catalogue.lock().await;
        if self.amenities.len() >= MAX_AMENITIES {
            return Err(EngineError::LimitExceeded("too many amenities"));
        }
        let name = required_text("name", name, MAX_NAME_LEN)?;
        let owner = CallerId(required_text("owner", owner.as_str(), MAX_CALLER_ID_LEN)?);

        let amenity = Amenity {
            id: Ulid::new(),
            name,
            additional_capacity,
            owner,
        };
        let event = Event::AmenityCreated {
            id: amenity.id,
            name: amenity.name.clone(),
            additional_capacity: amenity.additional_capacity,
            owner: amenity.owner.clone(),
        };
        self.wal_append(&event).await?;
        self.apply_amenity_event(&event, &mut []);
        info!("amenity {} created ({} +{})", amenity.id, amenity.name, additional_capacity);
        Ok(amenity)
    }

    /// Edit an amenity. A capacity change is pushed into every cottage that
    /// carries it before any of them is unlocked.
    pub async fn update_amenity(&self, id: Ulid, patch: AmenityPatch) -> Result<Amenity, EngineError> {
        let _catalogue = self.catalogue.lock().await;
        let current = self
            .amenities
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::AmenityNotFound(id))?;
        let name = match patch.name {
            Some(ref n) => required_text("name", n, MAX_NAME_LEN)?,
            None => current.name.clone(),
        };
        let additional_capacity = patch.additional_capacity.unwrap_or(current.additional_capacity);

        let mut guards = self.lock_cottages(self.attached_cottages(&id)).await;
        let event = Event::AmenityUpdated { id, name: name.clone(), additional_capacity };
        self.wal_append(&event).await?;
        self.apply_amenity_event(&event, &mut guards);
        for guard in &guards {
            self.notify.send(guard.id, &event);
        }
        if additional_capacity != current.additional_capacity {
            info!(
                "amenity {id} capacity {} -> {additional_capacity}, {} cottages recomputed",
                current.additional_capacity,
                guards.len()
            );
        }
        Ok(Amenity { name, additional_capacity, ..current })
    }

    /// Delete an amenity, detaching it from every cottage.
    pub async fn delete_amenity(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalogue = self.catalogue.lock().await;
        if !self.amenities.contains_key(&id) {
            return Err(EngineError::AmenityNotFound(id));
        }
        let mut guards = self.lock_cottages(self.attached_cottages(&id)).await;
        let event = Event::AmenityDeleted { id };
        self.wal_append(&event).await?;
        self.apply_amenity_event(&event, &mut guards);
        for guard in &guards {
            self.notify.send(guard.id, &event);
        }
        info!("amenity {id} deleted, detached from {} cottages", guards.len());
        Ok(())
    }

    pub async fn attach_amenity(&self, cottage_id: Ulid, amenity_id: Ulid) -> Result<CottageInfo, EngineError> {
        let _catalogue = self.catalogue.lock().await;
        if !self.amenities.contains_key(&amenity_id) {
            return Err(EngineError::AmenityNotFound(amenity_id));
        }
        let mut guard = self.lock_cottage(cottage_id).await?;
        if guard.amenities.contains(&amenity_id) {
            return Ok(guard.info());
        }
        if guard.amenities.len() >= MAX_AMENITIES_PER_COTTAGE {
            return Err(EngineError::LimitExceeded("too many amenities on cottage"));
        }
        let event = Event::AmenityAttached { cottage_id, amenity_id };
        self.persist_and_apply(cottage_id, &mut guard, &event).await?;
        Ok(guard.info())
    }

    pub async fn detach_amenity(&self, cottage_id: Ulid, amenity_id: Ulid) -> Result<CottageInfo, EngineError> {
        let _catalogue = self.catalogue.lock().await;
        if !self.amenities.contains_key(&amenity_id) {
            return Err(EngineError::AmenityNotFound(amenity_id));
        }
        let mut guard = self.lock_cottage(cottage_id).await?;
        if !guard.amenities.contains(&amenity_id) {
            return Ok(guard.info());
        }
        let event = Event::AmenityDetached { cottage_id, amenity_id };
        self.persist_and_apply(cottage_id, &mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Write-lock several cottages in id order. Cottages deleted meanwhile are skipped.
    async fn lock_cottages(&self, ids: BTreeSet<Ulid>) -> Vec<CottageWriteGuard> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(guard) = self.lock_cottage(id).await {
                guards.push(guard);
            }
        }
        guards
    }

    // ── Reservations ─────────────────────────────────────────

    /// Admit a new reservation. The overlap check and the insert happen under
    /// the same cottage write lock.
    pub async fn admit(&self, fields: ReservationFields, owner: CallerId) -> Result<Reservation, EngineError> {
        let stay = checked_stay(fields.check_in, fields.check_out)?;
        let customer_name = required_text("customer_name", &fields.customer_name, MAX_NAME_LEN)?;
        let customer_email = required_text("customer_email", &fields.customer_email, MAX_EMAIL_LEN)?;
        let owner = CallerId(required_text("owner", owner.as_str(), MAX_CALLER_ID_LEN)?);
        let cottage_id = fields.cottage_id;
        let guest = guest_key(&customer_email);

        let _guest = self.guest_guard(&guest).await;
        let mut guard = self.lock_cottage(cottage_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_COTTAGE {
            return Err(EngineError::LimitExceeded("too many reservations on cottage"));
        }
        self.reject_if_taken(&guard, &guest, &stay, None)?;

        let reservation = Reservation {
            id: Ulid::new(),
            cottage_id,
            owner,
            stay,
            customer_name,
            customer_email,
            confirmed: true,
        };
        let event = Event::ReservationAdmitted {
            id: reservation.id,
            cottage_id,
            owner: reservation.owner.clone(),
            stay,
            customer_name: reservation.customer_name.clone(),
            customer_email: reservation.customer_email.clone(),
        };
        self.persist_and_apply(cottage_id, &mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_ADMITTED_TOTAL).increment(1);
        info!("reservation {} admitted on cottage {cottage_id} for {stay}", reservation.id);
        Ok(reservation)
    }

    /// Edit a reservation in place, re-checking overlap against its siblings.
    pub async fn modify(&self, id: Ulid, patch: ReservationPatch) -> Result<Reservation, EngineError> {
        if let Some(ref email) = patch.customer_email {
            required_text("customer_email", email, MAX_EMAIL_LEN)?;
        }
        let (cottage_id, mut guard, _guest) = self.lock_for_modify(id, patch.customer_email.as_deref()).await?;
        let current = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;

        let stay = checked_stay(
            patch.check_in.unwrap_or(current.stay.check_in),
            patch.check_out.unwrap_or(current.stay.check_out),
        )?;
        let customer_name = match patch.customer_name {
            Some(ref n) => required_text("customer_name", n, MAX_NAME_LEN)?,
            None => current.customer_name.clone(),
        };
        let customer_email = match patch.customer_email {
            Some(ref e) => required_text("customer_email", e, MAX_EMAIL_LEN)?,
            None => current.customer_email.clone(),
        };
        self.reject_if_taken(&guard, &guest_key(&customer_email), &stay, Some(id))?;

        let event = Event::ReservationModified {
            id,
            cottage_id,
            stay,
            customer_name: customer_name.clone(),
            customer_email: customer_email.clone(),
        };
        self.persist_and_apply(cottage_id, &mut guard, &event).await?;
        info!("reservation {id} on cottage {cottage_id} modified to {stay}");
        Ok(Reservation {
            stay,
            customer_name,
            customer_email,
            ..current
        })
    }

    /// Cancel a reservation; its nights are free again as soon as this returns.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (cottage_id, mut guard) = self.resolve_reservation_write(id).await?;
        let removed = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        let event = Event::ReservationCancelled { id, cottage_id };
        self.persist_and_apply(cottage_id, &mut guard, &event).await?;
        info!("reservation {id} on cottage {cottage_id} cancelled, {} released", removed.stay);
        Ok(removed)
    }

    fn reject_if_taken(
        &self,
        cottage: &CottageState,
        guest: &str,
        stay: &Stay,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let checked = check_no_conflict(cottage, stay, exclude).and_then(|()| self.check_guest(guest, stay, exclude));
        if let Err(ref e) = checked {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            debug!("cottage {} rejected {stay}: {e}", cottage.id);
        }
        checked
    }

    /// Lock order for an edit: guest lock (new email, or the stored one), then the cottage.
    async fn lock_for_modify(
        &self,
        id: Ulid,
        new_email: Option<&str>,
    ) -> Result<(Ulid, CottageWriteGuard, Option<GuestGuard<'_>>), EngineError> {
        if !self.options.reject_guest_overlap {
            let (cottage_id, guard) = self.resolve_reservation_write(id).await?;
            return Ok((cottage_id, guard, None));
        }
        loop {
            let target = match new_email {
                Some(email) => guest_key(email),
                None => self.stored_guest_key(id).await?,
            };
            let guest = self.guest_guard(&target).await;
            let (cottage_id, guard) = self.resolve_reservation_write(id).await?;
            let stored = guard
                .reservation(id)
                .map(Reservation::guest_key)
                .ok_or(EngineError::ReservationNotFound(id))?;
            // The stored email may have changed before we got the lock.
            if new_email.is_some() || stored == target {
                return Ok((cottage_id, guard, guest));
            }
        }
    }

    async fn stored_guest_key(&self, id: Ulid) -> Result<String, EngineError> {
        let cottage_id = self
            .get_cottage_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let rs = self
            .get_cottage_state(&cottage_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let guard = rs.read().await;
        guard
            .reservation(id)
            .map(Reservation::guest_key)
            .ok_or(EngineError::ReservationNotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// Writers are held off until the swap completes.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalogue = self.catalogue.lock().await;

        let mut events = Vec::new();
        let mut amenities: Vec<Amenity> = self.amenities.iter().map(|e| e.value().clone()).collect();
        amenities.sort_by_key(|a| a.id);
        for a in amenities {
            events.push(Event::AmenityCreated {
                id: a.id,
                name: a.name,
                additional_capacity: a.additional_capacity,
                owner: a.owner,
            });
        }

        let mut cottage_ids: Vec<Ulid> = self.cottages.iter().map(|e| *e.key()).collect();
        cottage_ids.sort();
        let mut guards = Vec::with_capacity(cottage_ids.len());
        for id in cottage_ids {
            if let Some(rs) = self.get_cottage_state(&id) {
                guards.push(rs.read_owned().await);
            }
        }

        for cs in &guards {
            events.push(Event::CottageCreated {
                id: cs.id,
                name: cs.name.clone(),
                category: cs.category,
                base_capacity: cs.base_capacity,
                price_per_night: cs.price_per_night,
            });
            for amenity_id in &cs.amenities {
                events.push(Event::AmenityAttached {
                    cottage_id: cs.id,
                    amenity_id: *amenity_id,
                });
            }
            for r in &cs.reservations {
                events.push(Event::ReservationAdmitted {
                    id: r.id,
                    cottage_id: cs.id,
                    owner: r.owner.clone(),
                    stay: r.stay,
                    customer_name: r.customer_name.clone(),
                    customer_email: r.customer_email.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
