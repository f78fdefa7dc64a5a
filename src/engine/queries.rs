use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{busy_spans, slot_is_free, slot_starts};
use super::{Engine, EngineError};

impl Engine {
    /// Availability snapshot for one venue and date. Read-only: takes no
    /// lock beyond per-resource read guards, and may be stale by the time a
    /// caller books — correctness is re-checked at create time.
    ///
    /// Every candidate slot is returned; `available` is false when no
    /// active, capacity-sufficient resource is free for the slot's
    /// `[t, t + default_duration + buffer)` window. Candidate resources are
    /// listed in best-fit order so the allocator can reuse them directly.
    pub async fn availability(
        &self,
        venue_id: Ulid,
        date: NaiveDate,
        party_size: u32,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        if party_size == 0 {
            return Err(EngineError::Validation("party size must be positive"));
        }
        if party_size > MAX_PARTY_SIZE {
            return Err(EngineError::LimitExceeded("party size too large"));
        }
        if date.year() < MIN_VALID_YEAR || date.year() > MAX_VALID_YEAR {
            return Err(EngineError::Validation("date out of range"));
        }
        let venue = self
            .get_venue(&venue_id)
            .ok_or(EngineError::NotFound(venue_id))?;

        let (policy, starts) = {
            let vs = venue.read().await;
            let occupied = vs.policy.default_duration_min + vs.policy.buffer_min;
            (vs.policy, slot_starts(&vs.shifts, date.weekday(), occupied))
        };
        if starts.is_empty() {
            // No shift covers this weekday — the venue is not configured
            // for it.
            return Ok(Vec::new());
        }

        let occupied = policy.default_duration_min + policy.buffer_min;
        let origin = day_origin(date);
        let window = Span::new(
            origin + starts[0],
            origin + starts[starts.len() - 1] + occupied,
        );

        // Snapshot each fitting resource's busy spans once for the whole day.
        let mut fitting: Vec<(u32, Ulid, Vec<Span>)> = Vec::new();
        for rid in self.resources_of(&venue_id) {
            if let Some(rs) = self.get_resource(&rid) {
                let guard = rs.read().await;
                if guard.active && guard.capacity >= party_size {
                    fitting.push((
                        guard.capacity,
                        rid,
                        busy_spans(&guard, &window, policy.buffer_min),
                    ));
                }
            }
        }
        fitting.sort_by_key(|(capacity, id, _)| (*capacity, *id));

        let slots = starts
            .into_iter()
            .map(|start| {
                let slot = Span::new(origin + start, origin + start + occupied);
                let resources: Vec<Ulid> = fitting
                    .iter()
                    .filter(|(_, _, busy)| slot_is_free(busy, &slot))
                    .map(|(_, id, _)| *id)
                    .collect();
                SlotAvailability {
                    start_min: start,
                    available: !resources.is_empty(),
                    resources,
                }
            })
            .collect();

        Ok(slots)
    }

    // ── Listings ─────────────────────────────────────────────

    pub fn list_venues(&self) -> Vec<VenueState> {
        self.venues
            .iter()
            .map(|entry| {
                let vs = entry.value().clone();
                let guard = vs.try_read().expect("list_venues: uncontended read");
                guard.clone()
            })
            .collect()
    }

    pub async fn list_shifts(&self, venue_id: Ulid) -> Result<Vec<Shift>, EngineError> {
        let venue = match self.get_venue(&venue_id) {
            Some(v) => v,
            None => return Ok(Vec::new()),
        };
        let guard = venue.read().await;
        Ok(guard.shifts.clone())
    }

    pub async fn list_resources(&self, venue_id: Ulid) -> Result<Vec<ResourceState>, EngineError> {
        let mut out = Vec::new();
        for rid in self.resources_of(&venue_id) {
            if let Some(rs) = self.get_resource(&rid) {
                let guard = rs.read().await;
                out.push(guard.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    pub fn bookings_for_venue(&self, venue_id: Ulid, date: Option<NaiveDate>) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|entry| {
                let b = entry.value();
                b.venue_id == venue_id && date.is_none_or(|d| b.date == d)
            })
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|b| (b.date, b.start_min, b.id));
        out
    }

    pub fn bookings_for_resource(&self, resource_id: Ulid, date: Option<NaiveDate>) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|entry| {
                let b = entry.value();
                b.resource_id == Some(resource_id) && date.is_none_or(|d| b.date == d)
            })
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|b| (b.date, b.start_min, b.id));
        out
    }
}
