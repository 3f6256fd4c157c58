mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{cottage_conflict, find_conflict, is_free, merge_overlapping, subtract_stays, vacancies};
pub use error::{EngineError, ErrorKind};

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{ReplayReport, Wal};

pub type SharedCottageState = Arc<RwLock<CottageState>>;
pub type CottageWriteGuard = OwnedRwLockWriteGuard<CottageState>;

/// Ledger policy switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerOptions {
    /// Also reject a stay when the same guest (by email) already holds an
    /// overlapping reservation in any cottage.
    pub reject_guest_overlap: bool,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            commit_batch(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    commit_batch(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        // Nobody was told these committed, so none of them may survive a restart
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further appends: {e}");
        }
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    for (event, _) in batch {
        wal.append_buffered(event)?;
    }
    wal.flush_sync()
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One guest's lock. The map entry goes away with the last holder or waiter.
pub(super) struct GuestGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for GuestGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The booking ledger: cottages, amenities and reservations, with one write
/// lock per cottage.
pub struct Engine {
    pub(super) cottages: DashMap<Ulid, SharedCottageState>,
    pub(super) amenities: DashMap<Ulid, Amenity>,
    /// Amenity id → cottages it is attached to.
    pub(super) amenity_cottages: DashMap<Ulid, BTreeSet<Ulid>>,
    /// Reverse lookup: reservation id → cottage id
    pub(super) reservation_to_cottage: DashMap<Ulid, Ulid>,
    /// Guest key → that guest's stays, across all cottages.
    pub(super) guest_stays: DashMap<String, HashMap<Ulid, Stay>>,
    pub(super) guest_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Serializes catalogue changes (cottage create/delete, amenity set edits, compaction).
    /// Always taken before any cottage lock.
    pub(super) catalogue: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) options: LedgerOptions,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, options: LedgerOptions) -> io::Result<Self> {
        let ReplayReport { events, valid_len, discarded_tail } = Wal::recover(&wal_path)?;
        if let Some(reason) = discarded_tail {
            tracing::warn!(
                path = %wal_path.display(),
                events = events.len(),
                truncated_to = valid_len,
                reason = %reason,
                "cut damaged ledger tail"
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            cottages: DashMap::new(),
            amenities: DashMap::new(),
            amenity_cottages: DashMap::new(),
            reservation_to_cottage: DashMap::new(),
            guest_stays: DashMap::new(),
            guest_locks: DashMap::new(),
            catalogue: Mutex::new(()),
            wal_tx,
            notify,
            options,
        };

        // Replay: we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly. Never use blocking_read/blocking_write here
        // because this runs inside an async context.
        for event in &events {
            match event {
                Event::CottageCreated { id, name, category, base_capacity, price_per_night } => {
                    let cs = CottageState::new(*id, name.clone(), *category, *base_capacity, *price_per_night);
                    engine.cottages.insert(*id, Arc::new(RwLock::new(cs)));
                }
                Event::CottageDeleted { id } => {
                    if let Some((_, rs)) = engine.cottages.remove(id) {
                        let guard = rs.try_read().expect("replay: uncontended read");
                        engine.forget_cottage(&guard);
                    }
                }
                Event::AmenityCreated { id, .. }
                | Event::AmenityUpdated { id, .. }
                | Event::AmenityDeleted { id } => {
                    let mut guards: Vec<CottageWriteGuard> = engine
                        .attached_cottages(id)
                        .into_iter()
                        .filter_map(|cid| engine.get_cottage_state(&cid))
                        .map(|rs| rs.try_write_owned().expect("replay: uncontended write"))
                        .collect();
                    engine.apply_amenity_event(event, &mut guards);
                }
                other => {
                    if let Some(cottage_id) = event_cottage_id(other)
                        && let Some(rs) = engine.get_cottage_state(&cottage_id) {
                            let mut guard = rs.try_write().expect("replay: uncontended write");
                            engine.apply_to_cottage(&mut guard, other);
                        }
                }
            }
        }

        tracing::info!(
            "ledger replayed {} events: {} cottages, {} amenities, {} reservations",
            events.len(),
            engine.cottages.len(),
            engine.amenities.len(),
            engine.reservation_to_cottage.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_cottage_state(&self, id: &Ulid) -> Option<SharedCottageState> {
        self.cottages.get(id).map(|e| e.value().clone())
    }

    pub fn contains_cottage(&self, id: &Ulid) -> bool {
        self.cottages.contains_key(id)
    }

    pub(super) fn get_cottage_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_cottage.get(reservation_id).map(|e| *e.value())
    }

    pub(super) fn attached_cottages(&self, amenity_id: &Ulid) -> BTreeSet<Ulid> {
        self.amenity_cottages
            .get(amenity_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Acquire a cottage's write lock, failing if it was deleted while we waited.
    pub(super) async fn lock_cottage(&self, id: Ulid) -> Result<CottageWriteGuard, EngineError> {
        let rs = self.get_cottage_state(&id).ok_or(EngineError::CottageNotFound(id))?;
        let guard = rs.clone().write_owned().await;
        let still_live = self
            .cottages
            .get(&id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &rs));
        if !still_live {
            return Err(EngineError::CottageNotFound(id));
        }
        Ok(guard)
    }

    /// Lookup reservation → cottage, acquire the cottage's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: Ulid,
    ) -> Result<(Ulid, CottageWriteGuard), EngineError> {
        let cottage_id = self
            .get_cottage_for_reservation(&reservation_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;
        let guard = self
            .lock_cottage(cottage_id)
            .await
            .map_err(|_| EngineError::ReservationNotFound(reservation_id))?;
        if guard.reservation(reservation_id).is_none() {
            return Err(EngineError::ReservationNotFound(reservation_id));
        }
        Ok((cottage_id, guard))
    }

    /// Per-guest lock, only taken when the guest-overlap policy is on.
    /// Always acquired before the cottage lock.
    pub(super) async fn guest_guard(&self, guest: &str) -> Option<GuestGuard<'_>> {
        if !self.options.reject_guest_overlap {
            return None;
        }
        let lock = self.guest_locks.entry(guest.to_string()).or_default().clone();
        Some(GuestGuard {
            locks: &self.guest_locks,
            key: guest.to_string(),
            held: Some(lock.lock_owned().await),
        })
    }

    pub(super) fn check_guest(&self, guest: &str, stay: &Stay, exclude: Option<Ulid>) -> Result<(), EngineError> {
        if !self.options.reject_guest_overlap {
            return Ok(());
        }
        match self.guest_stays.get(guest) {
            Some(stays) => conflict::check_no_guest_conflict(&stays, stay, exclude),
            None => Ok(()),
        }
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        cottage_id: Ulid,
        cs: &mut CottageState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_cottage(cs, event);
        self.notify.send(cottage_id, event);
        Ok(())
    }

    /// Apply a cottage-scoped event. The caller holds the cottage's write lock.
    fn apply_to_cottage(&self, cs: &mut CottageState, event: &Event) {
        match event {
            Event::CottageUpdated { name, category, base_capacity, price_per_night, .. } => {
                cs.name = name.clone();
                cs.category = *category;
                cs.base_capacity = *base_capacity;
                cs.price_per_night = *price_per_night;
                self.refresh_capacity(cs);
            }
            Event::AmenityAttached { cottage_id, amenity_id } => {
                cs.amenities.insert(*amenity_id);
                self.amenity_cottages.entry(*amenity_id).or_default().insert(*cottage_id);
                self.refresh_capacity(cs);
            }
            Event::AmenityDetached { cottage_id, amenity_id } => {
                cs.amenities.remove(amenity_id);
                if let Some(mut attached) = self.amenity_cottages.get_mut(amenity_id) {
                    attached.remove(cottage_id);
                }
                self.refresh_capacity(cs);
            }
            Event::ReservationAdmitted { id, cottage_id, owner, stay, customer_name, customer_email } => {
                let reservation = Reservation {
                    id: *id,
                    cottage_id: *cottage_id,
                    owner: owner.clone(),
                    stay: *stay,
                    customer_name: customer_name.clone(),
                    customer_email: customer_email.clone(),
                    confirmed: true,
                };
                self.index_guest_stay(&reservation);
                cs.insert_reservation(reservation);
                self.reservation_to_cottage.insert(*id, *cottage_id);
            }
            Event::ReservationModified { id, stay, customer_name, customer_email, .. } => {
                if let Some(mut reservation) = cs.remove_reservation(*id) {
                    self.unindex_guest_stay(&reservation);
                    reservation.stay = *stay;
                    reservation.customer_name = customer_name.clone();
                    reservation.customer_email = customer_email.clone();
                    self.index_guest_stay(&reservation);
                    cs.insert_reservation(reservation);
                }
            }
            Event::ReservationCancelled { id, .. } => {
                if let Some(reservation) = cs.remove_reservation(*id) {
                    self.unindex_guest_stay(&reservation);
                }
                self.reservation_to_cottage.remove(id);
            }
            // Catalogue-level events are handled at the DashMap level, not here
            Event::CottageCreated { .. }
            | Event::CottageDeleted { .. }
            | Event::AmenityCreated { .. }
            | Event::AmenityUpdated { .. }
            | Event::AmenityDeleted { .. } => {}
        }
    }

    /// Apply an amenity-level event. `guards` must cover every cottage the amenity is attached to.
    fn apply_amenity_event(&self, event: &Event, guards: &mut [CottageWriteGuard]) {
        match event {
            Event::AmenityCreated { id, name, additional_capacity, owner } => {
                self.amenities.insert(
                    *id,
                    Amenity {
                        id: *id,
                        name: name.clone(),
                        additional_capacity: *additional_capacity,
                        owner: owner.clone(),
                    },
                );
            }
            Event::AmenityUpdated { id, name, additional_capacity } => {
                if let Some(mut amenity) = self.amenities.get_mut(id) {
                    amenity.name = name.clone();
                    amenity.additional_capacity = *additional_capacity;
                }
                for guard in guards.iter_mut() {
                    self.refresh_capacity(guard);
                }
            }
            Event::AmenityDeleted { id } => {
                self.amenities.remove(id);
                self.amenity_cottages.remove(id);
                for guard in guards.iter_mut() {
                    guard.amenities.remove(id);
                    self.refresh_capacity(guard);
                }
            }
            _ => {}
        }
    }

    /// Recompute the capacity cache from the current amenity catalogue.
    fn refresh_capacity(&self, cs: &mut CottageState) {
        let additional: Vec<u32> = cs
            .amenities
            .iter()
            .filter_map(|a| self.amenities.get(a).map(|e| e.additional_capacity))
            .collect();
        cs.recompute_capacity(additional);
    }

    fn index_guest_stay(&self, reservation: &Reservation) {
        self.guest_stays
            .entry(reservation.guest_key())
            .or_default()
            .insert(reservation.id, reservation.stay);
    }

    fn unindex_guest_stay(&self, reservation: &Reservation) {
        let key = reservation.guest_key();
        let now_empty = match self.guest_stays.get_mut(&key) {
            Some(mut stays) => {
                stays.remove(&reservation.id);
                stays.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.guest_stays.remove_if(&key, |_, stays| stays.is_empty());
        }
    }

    /// Drop every index entry pointing into a deleted cottage.
    fn forget_cottage(&self, cs: &CottageState) {
        for reservation in &cs.reservations {
            self.reservation_to_cottage.remove(&reservation.id);
            self.unindex_guest_stay(reservation);
        }
        for amenity_id in &cs.amenities {
            if let Some(mut attached) = self.amenity_cottages.get_mut(amenity_id) {
                attached.remove(&cs.id);
            }
        }
    }
}

/// Extract the cottage id from a cottage-scoped event.
fn event_cottage_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::CottageUpdated { id, .. } => Some(*id),
        Event::AmenityAttached { cottage_id, .. }
        | Event::AmenityDetached { cottage_id, .. }
        | Event::ReservationAdmitted { cottage_id, .. }
        | Event::ReservationModified { cottage_id, .. }
        | Event::ReservationCancelled { cottage_id, .. } => Some(*cottage_id),
        Event::CottageCreated { .. }
        | Event::CottageDeleted { .. }
        | Event::AmenityCreated { .. }
        | Event::AmenityUpdated { .. }
        | Event::AmenityDeleted { .. } => None,
    }
}
