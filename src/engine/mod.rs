mod allocate;
mod availability;
mod conflict;
mod error;
mod idempotency;
mod mutations;
mod queries;

pub use allocate::{best_fit, rank_candidates};
pub use availability::{SLOT_GRANULARITY_MIN, busy_spans, slot_is_free, slot_starts};
pub use error::EngineError;
pub use idempotency::IdempotencyGuard;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedVenueState = Arc<RwLock<VenueState>>;
pub type SharedResourceState = Arc<RwLock<ResourceState>>;

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
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
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
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's booking engine: venue catalog, resource inventory, the
/// booking ledger, and the WAL that makes it all durable.
pub struct Engine {
    pub venues: DashMap<Ulid, SharedVenueState>,
    pub resources: DashMap<Ulid, SharedResourceState>,
    /// System of record, including unassigned bookings. Writes are ordered
    /// by the owning resource's lock (or the venue lock while unassigned).
    pub bookings: DashMap<Ulid, Booking>,
    /// Venue → resource ids, for O(1) venue scans.
    pub(super) venue_resources: DashMap<Ulid, Vec<Ulid>>,
    /// Reverse lookup: shift id → venue id.
    pub(super) shift_to_venue: DashMap<Ulid, Ulid>,
    pub(super) idempotency: IdempotencyGuard,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            venues: DashMap::new(),
            resources: DashMap::new(),
            bookings: DashMap::new(),
            venue_resources: DashMap::new(),
            shift_to_venue: DashMap::new(),
            idempotency: IdempotencyGuard::new(),
            wal_tx,
            notify,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant
        // creation).
        for event in &events {
            engine.apply_replay(event);
        }

        Ok(engine)
    }

    fn apply_replay(&self, event: &Event) {
        match event {
            Event::VenueCreated { id, name, policy } => {
                let vs = VenueState::new(*id, name.clone(), *policy);
                self.venues.insert(*id, Arc::new(RwLock::new(vs)));
                self.venue_resources.entry(*id).or_default();
            }
            Event::VenueUpdated { id, name, policy } => {
                if let Some(entry) = self.venues.get(id) {
                    let mut vs = entry.try_write().expect("replay: uncontended write");
                    vs.name = name.clone();
                    vs.policy = *policy;
                }
            }
            Event::ShiftAdded {
                id,
                venue_id,
                start_min,
                end_min,
                weekdays,
                active,
            } => {
                if let Some(entry) = self.venues.get(venue_id) {
                    let mut vs = entry.try_write().expect("replay: uncontended write");
                    vs.shifts.push(Shift {
                        id: *id,
                        venue_id: *venue_id,
                        start_min: *start_min,
                        end_min: *end_min,
                        weekdays: *weekdays,
                        active: *active,
                    });
                    self.shift_to_venue.insert(*id, *venue_id);
                }
            }
            Event::ShiftUpdated {
                id,
                venue_id,
                start_min,
                end_min,
                weekdays,
                active,
            } => {
                if let Some(entry) = self.venues.get(venue_id) {
                    let mut vs = entry.try_write().expect("replay: uncontended write");
                    if let Some(shift) = vs.shift_mut(*id) {
                        shift.start_min = *start_min;
                        shift.end_min = *end_min;
                        shift.weekdays = *weekdays;
                        shift.active = *active;
                    }
                }
            }
            Event::ShiftRemoved { id, venue_id } => {
                if let Some(entry) = self.venues.get(venue_id) {
                    let mut vs = entry.try_write().expect("replay: uncontended write");
                    vs.remove_shift(*id);
                }
                self.shift_to_venue.remove(id);
            }
            Event::ResourceAdded {
                id,
                venue_id,
                name,
                capacity,
                combinable,
                active,
            } => {
                let mut rs = ResourceState::new(*id, *venue_id, name.clone(), *capacity, *combinable);
                rs.active = *active;
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
                self.venue_resources.entry(*venue_id).or_default().push(*id);
            }
            Event::ResourceUpdated {
                id,
                name,
                capacity,
                combinable,
                active,
                ..
            } => {
                if let Some(entry) = self.resources.get(id) {
                    let mut rs = entry.try_write().expect("replay: uncontended write");
                    rs.name = name.clone();
                    rs.capacity = *capacity;
                    rs.combinable = *combinable;
                    rs.active = *active;
                }
            }
            Event::ResourceRemoved { id, venue_id } => {
                self.resources.remove(id);
                if let Some(mut ids) = self.venue_resources.get_mut(venue_id) {
                    ids.retain(|r| r != id);
                }
            }
            Event::BookingCreated { booking } => {
                self.index_booking(booking);
            }
            Event::BookingAssigned { id, resource_id, .. } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.resource_id = Some(*resource_id);
                    let slot = BookingSlot {
                        booking_id: *id,
                        span: booking.span(),
                        status: booking.status,
                    };
                    drop(booking);
                    if let Some(entry) = self.resources.get(resource_id) {
                        let mut rs = entry.try_write().expect("replay: uncontended write");
                        rs.insert_slot(slot);
                    }
                }
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.status = *status;
                    let resource_id = booking.resource_id;
                    drop(booking);
                    if let Some(rid) = resource_id
                        && let Some(entry) = self.resources.get(&rid)
                    {
                        let mut rs = entry.try_write().expect("replay: uncontended write");
                        rs.set_slot_status(*id, *status);
                    }
                }
            }
        }
    }

    /// Replay-only: index a booking row into the bookings map, its
    /// resource's slot list, and the idempotency table. The live create path
    /// does this itself under the resource lock it already holds.
    fn index_booking(&self, booking: &Booking) {
        if let Some(rid) = booking.resource_id
            && let Some(entry) = self.resources.get(&rid)
        {
            let mut rs = entry.try_write().expect("replay: uncontended write");
            rs.insert_slot(BookingSlot {
                booking_id: booking.id,
                span: booking.span(),
                status: booking.status,
            });
        }
        self.idempotency
            .restore(booking.idempotency_key.clone(), booking.id);
        self.bookings.insert(booking.id, booking.clone());
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub fn get_venue(&self, id: &Ulid) -> Option<SharedVenueState> {
        self.venues.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub(super) fn resources_of(&self, venue_id: &Ulid) -> Vec<Ulid> {
        self.venue_resources
            .get(venue_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: one event per venue, shift and resource,
    /// plus every booking row with its final status folded in.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.venues.iter() {
            let vs = entry.value().clone();
            let guard = vs.try_read().expect("compact: uncontended read");
            events.push(Event::VenueCreated {
                id: guard.id,
                name: guard.name.clone(),
                policy: guard.policy,
            });
            for shift in &guard.shifts {
                events.push(Event::ShiftAdded {
                    id: shift.id,
                    venue_id: shift.venue_id,
                    start_min: shift.start_min,
                    end_min: shift.end_min,
                    weekdays: shift.weekdays,
                    active: shift.active,
                });
            }
        }

        for entry in self.resources.iter() {
            let rs = entry.value().clone();
            let guard = rs.try_read().expect("compact: uncontended read");
            events.push(Event::ResourceAdded {
                id: guard.id,
                venue_id: guard.venue_id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                combinable: guard.combinable,
                active: guard.active,
            });
        }

        // Bookings are never dropped; their status history collapses into
        // the final row.
        for entry in self.bookings.iter() {
            events.push(Event::BookingCreated {
                booking: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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
