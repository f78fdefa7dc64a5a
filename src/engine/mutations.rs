use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::allocate::rank_candidates;
use super::conflict::{check_no_conflict, now_ms, validate_request};
use super::idempotency::Reservation;
use super::{Engine, EngineError};

/// How long a duplicate request waits for the in-flight original before
/// giving up (250ms × 20 ≈ 5s).
const KEY_WAIT: Duration = Duration::from_millis(250);
const KEY_WAIT_ATTEMPTS: u32 = 20;

impl Engine {
    // ── Venue catalog ────────────────────────────────────────

    pub async fn create_venue(
        &self,
        id: Ulid,
        name: Option<String>,
        policy: LocationPolicy,
    ) -> Result<(), EngineError> {
        if self.venues.len() >= MAX_VENUES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many venues"));
        }
        validate_name(&name)?;
        validate_policy(&policy)?;
        if self.venues.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VenueCreated {
            id,
            name: name.clone(),
            policy,
        };
        self.wal_append(&event).await?;
        self.venues
            .insert(id, Arc::new(RwLock::new(VenueState::new(id, name, policy))));
        self.venue_resources.entry(id).or_default();
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_venue(
        &self,
        id: Ulid,
        name: Option<String>,
        default_duration_min: Option<Min>,
        buffer_min: Option<Min>,
        auto_accept: Option<bool>,
        allow_unassigned: Option<bool>,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        let venue = self.get_venue(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = venue.write().await;

        let name = name.or_else(|| guard.name.clone());
        let policy = LocationPolicy {
            default_duration_min: default_duration_min
                .unwrap_or(guard.policy.default_duration_min),
            buffer_min: buffer_min.unwrap_or(guard.policy.buffer_min),
            auto_accept: auto_accept.unwrap_or(guard.policy.auto_accept),
            allow_unassigned: allow_unassigned.unwrap_or(guard.policy.allow_unassigned),
        };
        validate_policy(&policy)?;

        let event = Event::VenueUpdated {
            id,
            name: name.clone(),
            policy,
        };
        self.wal_append(&event).await?;
        guard.name = name;
        guard.policy = policy;
        self.notify.send(id, &event);
        Ok(())
    }

    // ── Shift catalog ────────────────────────────────────────

    pub async fn add_shift(
        &self,
        id: Ulid,
        venue_id: Ulid,
        start_min: Min,
        end_min: Min,
        weekdays: u8,
    ) -> Result<(), EngineError> {
        validate_shift_window(start_min, end_min, weekdays)?;
        let venue = self
            .get_venue(&venue_id)
            .ok_or(EngineError::NotFound(venue_id))?;
        let mut guard = venue.write().await;
        if guard.shifts.len() >= MAX_SHIFTS_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many shifts on venue"));
        }
        if guard.shifts.iter().any(|s| s.id == id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ShiftAdded {
            id,
            venue_id,
            start_min,
            end_min,
            weekdays,
            active: true,
        };
        self.wal_append(&event).await?;
        guard.shifts.push(Shift {
            id,
            venue_id,
            start_min,
            end_min,
            weekdays,
            active: true,
        });
        self.shift_to_venue.insert(id, venue_id);
        self.notify.send(venue_id, &event);
        Ok(())
    }

    pub async fn update_shift(
        &self,
        id: Ulid,
        start_min: Option<Min>,
        end_min: Option<Min>,
        weekdays: Option<u8>,
        active: Option<bool>,
    ) -> Result<Ulid, EngineError> {
        let venue_id = self
            .shift_to_venue
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let venue = self
            .get_venue(&venue_id)
            .ok_or(EngineError::NotFound(venue_id))?;
        let mut guard = venue.write().await;
        let current = guard.shift_mut(id).ok_or(EngineError::NotFound(id))?;

        let start_min = start_min.unwrap_or(current.start_min);
        let end_min = end_min.unwrap_or(current.end_min);
        let weekdays = weekdays.unwrap_or(current.weekdays);
        let active = active.unwrap_or(current.active);
        validate_shift_window(start_min, end_min, weekdays)?;

        let event = Event::ShiftUpdated {
            id,
            venue_id,
            start_min,
            end_min,
            weekdays,
            active,
        };
        self.wal_append(&event).await?;
        let shift = guard.shift_mut(id).expect("shift present under lock");
        shift.start_min = start_min;
        shift.end_min = end_min;
        shift.weekdays = weekdays;
        shift.active = active;
        self.notify.send(venue_id, &event);
        Ok(venue_id)
    }

    pub async fn remove_shift(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let venue_id = self
            .shift_to_venue
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let venue = self
            .get_venue(&venue_id)
            .ok_or(EngineError::NotFound(venue_id))?;
        let mut guard = venue.write().await;

        let event = Event::ShiftRemoved { id, venue_id };
        self.wal_append(&event).await?;
        guard.remove_shift(id);
        self.shift_to_venue.remove(&id);
        self.notify.send(venue_id, &event);
        Ok(venue_id)
    }

    // ── Resource inventory ───────────────────────────────────

    pub async fn add_resource(
        &self,
        id: Ulid,
        venue_id: Ulid,
        name: Option<String>,
        capacity: u32,
        combinable: bool,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        validate_capacity(capacity)?;
        if !self.venues.contains_key(&venue_id) {
            return Err(EngineError::NotFound(venue_id));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.resources_of(&venue_id).len() >= MAX_RESOURCES_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many resources on venue"));
        }

        let event = Event::ResourceAdded {
            id,
            venue_id,
            name: name.clone(),
            capacity,
            combinable,
            active: true,
        };
        self.wal_append(&event).await?;
        self.resources.insert(
            id,
            Arc::new(RwLock::new(ResourceState::new(
                id, venue_id, name, capacity, combinable,
            ))),
        );
        self.venue_resources.entry(venue_id).or_default().push(id);
        self.notify.send(venue_id, &event);
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
        combinable: Option<bool>,
        active: Option<bool>,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let name = name.or_else(|| guard.name.clone());
        let capacity = capacity.unwrap_or(guard.capacity);
        let combinable = combinable.unwrap_or(guard.combinable);
        let active = active.unwrap_or(guard.active);
        validate_capacity(capacity)?;

        let event = Event::ResourceUpdated {
            id,
            venue_id: guard.venue_id,
            name: name.clone(),
            capacity,
            combinable,
            active,
        };
        self.wal_append(&event).await?;
        guard.name = name;
        guard.capacity = capacity;
        guard.combinable = combinable;
        guard.active = active;
        self.notify.send(guard.venue_id, &event);
        Ok(())
    }

    pub async fn remove_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.has_active_slots() {
            return Err(EngineError::HasBookings(id));
        }
        let venue_id = guard.venue_id;

        let event = Event::ResourceRemoved { id, venue_id };
        self.wal_append(&event).await?;
        // In-flight allocations holding the old Arc re-check `active` under
        // the lock, so flip it before unlinking.
        guard.active = false;
        self.resources.remove(&id);
        if let Some(mut ids) = self.venue_resources.get_mut(&venue_id) {
            ids.retain(|r| r != &id);
        }
        self.notify.send(venue_id, &event);
        Ok(())
    }

    // ── Booking ledger ───────────────────────────────────────

    /// Create a booking. Returns the booking and whether it was newly
    /// created — a replayed idempotency key returns the original row with
    /// `false` and has no side effects.
    pub async fn create_booking(
        &self,
        req: BookingRequest,
    ) -> Result<(Booking, bool), EngineError> {
        validate_request(&req)?;

        let mut attempts = 0;
        loop {
            match self.idempotency.begin(&req.idempotency_key) {
                Reservation::Existing(id) => {
                    let booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
                    return Ok((booking, false));
                }
                Reservation::New => break,
                Reservation::InFlight(notify) => {
                    attempts += 1;
                    if attempts > KEY_WAIT_ATTEMPTS {
                        return Err(EngineError::KeyInFlight);
                    }
                    let _ = tokio::time::timeout(KEY_WAIT, notify.notified()).await;
                }
            }
        }

        let result = self.create_booking_inner(&req).await;
        match &result {
            Ok(booking) => self.idempotency.commit(&req.idempotency_key, booking.id),
            Err(_) => self.idempotency.abort(&req.idempotency_key),
        }
        result.map(|booking| (booking, true))
    }

    async fn create_booking_inner(&self, req: &BookingRequest) -> Result<Booking, EngineError> {
        let venue = self
            .get_venue(&req.venue_id)
            .ok_or(EngineError::NotFound(req.venue_id))?;
        let (policy, covered) = {
            let vs = venue.read().await;
            let weekday = req.date.weekday();
            let buffer = vs.policy.buffer_min;
            let covered = vs
                .shifts_for(weekday)
                .any(|s| req.start_min >= s.start_min && req.end_min + buffer <= s.end_min);
            (vs.policy, covered)
        };
        if !covered {
            return Err(EngineError::Validation("requested time is outside opening hours"));
        }

        let origin = day_origin(req.date);
        let span = Span::new(origin + req.start_min, origin + req.end_min);

        // Candidate order: the explicitly requested resource, or the venue's
        // active inventory in best-fit order.
        let candidates = match req.resource_id {
            Some(rid) => {
                let rs = self.get_resource(&rid).ok_or(EngineError::NotFound(rid))?;
                let guard = rs.read().await;
                if guard.venue_id != req.venue_id {
                    return Err(EngineError::NotFound(rid));
                }
                if !guard.active {
                    return Err(EngineError::Validation("resource is inactive"));
                }
                if guard.capacity < req.party_size {
                    return Err(EngineError::Capacity(req.party_size));
                }
                vec![rid]
            }
            None => {
                let mut sized = Vec::new();
                for rid in self.resources_of(&req.venue_id) {
                    if let Some(rs) = self.get_resource(&rid) {
                        let guard = rs.read().await;
                        if guard.active {
                            sized.push((guard.capacity, rid));
                        }
                    }
                }
                let ranked = rank_candidates(sized, req.party_size);
                if ranked.is_empty() {
                    if policy.allow_unassigned {
                        return self.persist_unassigned(req, policy).await;
                    }
                    return Err(EngineError::Capacity(req.party_size));
                }
                ranked
            }
        };

        let explicit = req.resource_id.is_some();
        for rid in candidates {
            let rs = match self.get_resource(&rid) {
                Some(rs) => rs,
                None => continue, // removed since ranking
            };
            let mut guard = rs.write().await;
            if !guard.active || guard.capacity < req.party_size {
                continue; // changed since ranking
            }
            if guard.slots.len() >= MAX_SLOTS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many bookings on resource"));
            }
            match check_no_conflict(&guard, &span, policy.buffer_min) {
                Ok(()) => {
                    let booking = new_booking(req, Some(rid), policy);
                    let event = Event::BookingCreated {
                        booking: booking.clone(),
                    };
                    self.wal_append(&event).await?;
                    guard.insert_slot(BookingSlot {
                        booking_id: booking.id,
                        span,
                        status: booking.status,
                    });
                    self.bookings.insert(booking.id, booking.clone());
                    self.notify.send(req.venue_id, &event);
                    return Ok(booking);
                }
                Err(EngineError::Conflict(_)) => {
                    // Lost the race for this resource — try the next candidate.
                    metrics::counter!(crate::observability::ALLOCATION_CONFLICTS_TOTAL)
                        .increment(1);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        if !explicit && policy.allow_unassigned {
            return self.persist_unassigned(req, policy).await;
        }
        Err(EngineError::SlotUnavailable)
    }

    /// Persist a booking with no resource, queued for manual assignment.
    /// The venue write lock orders these with status updates and assigns.
    async fn persist_unassigned(
        &self,
        req: &BookingRequest,
        policy: LocationPolicy,
    ) -> Result<Booking, EngineError> {
        let venue = self
            .get_venue(&req.venue_id)
            .ok_or(EngineError::NotFound(req.venue_id))?;
        let _guard = venue.write().await;
        let booking = new_booking(req, None, policy);
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        self.bookings.insert(booking.id, booking.clone());
        self.notify.send(req.venue_id, &event);
        Ok(booking)
    }

    pub async fn update_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        loop {
            let current = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
            match current.resource_id {
                Some(rid) => match self.get_resource(&rid) {
                    Some(rs) => {
                        let mut guard = rs.write().await;
                        return self.commit_status(id, status, Some(&mut *guard)).await;
                    }
                    // Resource removed — only closed bookings can reference
                    // it, and those reject every transition anyway.
                    None => return self.commit_status(id, status, None).await,
                },
                None => {
                    let venue = self
                        .get_venue(&current.venue_id)
                        .ok_or(EngineError::NotFound(current.venue_id))?;
                    let _vguard = venue.write().await;
                    // A concurrent assign may have moved the booking under a
                    // resource lock while we waited.
                    let latest = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
                    if latest.resource_id.is_some() {
                        continue;
                    }
                    return self.commit_status(id, status, None).await;
                }
            }
        }
    }

    async fn commit_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        resource: Option<&mut ResourceState>,
    ) -> Result<Booking, EngineError> {
        let mut booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: status,
            });
        }
        let event = Event::BookingStatusChanged {
            id,
            venue_id: booking.venue_id,
            status,
        };
        self.wal_append(&event).await?;
        booking.status = status;
        self.bookings.insert(id, booking.clone());
        if let Some(rs) = resource {
            rs.set_slot_status(id, status);
        }
        self.notify.send(booking.venue_id, &event);
        Ok(booking)
    }

    /// Manually assign an unassigned booking to a resource, with the same
    /// capacity and conflict checks as a create.
    pub async fn assign_booking(
        &self,
        id: Ulid,
        resource_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let current = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        if current.resource_id.is_some() {
            return Err(EngineError::Validation("booking already has a resource"));
        }
        let venue = self
            .get_venue(&current.venue_id)
            .ok_or(EngineError::NotFound(current.venue_id))?;
        let vguard = venue.write().await;
        let policy = vguard.policy;

        let booking = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.resource_id.is_some() {
            return Err(EngineError::Validation("booking already has a resource"));
        }
        if !booking.status.blocks_slot() {
            return Err(EngineError::Validation("booking is closed"));
        }

        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if guard.venue_id != booking.venue_id {
            return Err(EngineError::NotFound(resource_id));
        }
        if !guard.active {
            return Err(EngineError::Validation("resource is inactive"));
        }
        if guard.capacity < booking.party_size {
            return Err(EngineError::Capacity(booking.party_size));
        }
        if guard.slots.len() >= MAX_SLOTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }

        let span = booking.span();
        match check_no_conflict(&guard, &span, policy.buffer_min) {
            Ok(()) => {}
            Err(EngineError::Conflict(_)) => return Err(EngineError::SlotUnavailable),
            Err(e) => return Err(e),
        }

        let event = Event::BookingAssigned {
            id,
            venue_id: booking.venue_id,
            resource_id,
        };
        self.wal_append(&event).await?;
        guard.insert_slot(BookingSlot {
            booking_id: id,
            span,
            status: booking.status,
        });
        let mut updated = booking;
        updated.resource_id = Some(resource_id);
        self.bookings.insert(id, updated.clone());
        drop(guard);
        drop(vguard);
        self.notify.send(updated.venue_id, &event);
        Ok(updated)
    }
}

fn new_booking(req: &BookingRequest, resource_id: Option<Ulid>, policy: LocationPolicy) -> Booking {
    let status = if policy.auto_accept {
        BookingStatus::Confirmed
    } else {
        BookingStatus::Pending
    };
    Booking {
        id: Ulid::new(),
        venue_id: req.venue_id,
        resource_id,
        date: req.date,
        start_min: req.start_min,
        duration_min: req.end_min - req.start_min,
        party_size: req.party_size,
        status,
        contact: req.contact.clone(),
        idempotency_key: req.idempotency_key.clone(),
        created_at_ms: now_ms(),
    }
}

fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity < 1 {
        return Err(EngineError::Validation("capacity must be at least 1"));
    }
    if capacity > MAX_RESOURCE_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

fn validate_policy(policy: &LocationPolicy) -> Result<(), EngineError> {
    if policy.default_duration_min < 1 || policy.default_duration_min > MAX_DURATION_MIN {
        return Err(EngineError::Validation("default duration out of range"));
    }
    if policy.buffer_min < 0 || policy.buffer_min > MAX_BUFFER_MIN {
        return Err(EngineError::Validation("buffer out of range"));
    }
    Ok(())
}

fn validate_shift_window(start_min: Min, end_min: Min, weekdays: u8) -> Result<(), EngineError> {
    if start_min < 0 || end_min > MINUTES_PER_DAY || start_min >= end_min {
        return Err(EngineError::Validation("shift start must be before end within the day"));
    }
    if weekdays == 0 || weekdays & 0x80 != 0 {
        return Err(EngineError::Validation("weekday mask out of range"));
    }
    Ok(())
}
