use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes — the only duration/instant unit. Minute-of-day in catalog types,
/// absolute minutes (days-from-CE × 1440 + minute-of-day) in `Span`.
pub type Min = i64;

pub const MINUTES_PER_DAY: Min = 1440;

/// Absolute minute at which `date` begins.
pub fn day_origin(date: NaiveDate) -> Min {
    date.num_days_from_ce() as Min * MINUTES_PER_DAY
}

/// Half-open interval `[start, end)` in absolute minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Min,
    pub end: Min,
}

impl Span {
    pub fn new(start: Min, end: Min) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Min {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Catalog types ────────────────────────────────────────────────

/// Recurring open-hours window for a venue. `weekdays` is a bitmask with
/// bit 0 = Monday … bit 6 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: Ulid,
    pub venue_id: Ulid,
    pub start_min: Min,
    pub end_min: Min,
    pub weekdays: u8,
    pub active: bool,
}

impl Shift {
    pub fn applies_on(&self, weekday: Weekday) -> bool {
        self.weekdays & (1 << weekday.num_days_from_monday()) != 0
    }
}

pub fn weekday_bit(weekday: Weekday) -> u8 {
    1 << weekday.num_days_from_monday()
}

/// Per-venue booking policy, consumed as an immutable snapshot by every
/// engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationPolicy {
    pub default_duration_min: Min,
    /// Gap enforced after each booking before the next may start.
    pub buffer_min: Min,
    /// New bookings start CONFIRMED instead of PENDING.
    pub auto_accept: bool,
    /// Persist bookings with no fitting resource instead of rejecting them.
    pub allow_unassigned: bool,
}

impl Default for LocationPolicy {
    fn default() -> Self {
        Self {
            default_duration_min: 120,
            buffer_min: 0,
            auto_accept: false,
            allow_unassigned: false,
        }
    }
}

/// Venue-level state: policy plus the shift catalog.
#[derive(Debug, Clone)]
pub struct VenueState {
    pub id: Ulid,
    pub name: Option<String>,
    pub policy: LocationPolicy,
    pub shifts: Vec<Shift>,
}

impl VenueState {
    pub fn new(id: Ulid, name: Option<String>, policy: LocationPolicy) -> Self {
        Self {
            id,
            name,
            policy,
            shifts: Vec::new(),
        }
    }

    /// Active shifts covering the given weekday.
    pub fn shifts_for(&self, weekday: Weekday) -> impl Iterator<Item = &Shift> {
        self.shifts
            .iter()
            .filter(move |s| s.active && s.applies_on(weekday))
    }

    pub fn shift_mut(&mut self, id: Ulid) -> Option<&mut Shift> {
        self.shifts.iter_mut().find(|s| s.id == id)
    }

    pub fn remove_shift(&mut self, id: Ulid) -> Option<Shift> {
        let pos = self.shifts.iter().position(|s| s.id == id)?;
        Some(self.shifts.remove(pos))
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Seated,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Statuses that occupy their resource's time slot.
    pub fn blocks_slot(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Seated)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// The closed transition table. No-show only applies before seating.
    pub fn can_transition_to(self, next: Self) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
                | (Confirmed, Seated)
                | (Confirmed, NoShow)
                | (Seated, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Seated => "seated",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "seated" => Some(Self::Seated),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "no_show" => Some(Self::NoShow),
            _ => None,
        }
    }
}

/// Guest contact record. Opaque to the scheduling logic; structured so the
/// wire format stays a closed shape rather than an open map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub venue_id: Ulid,
    /// None until a resource is assigned (manual-assignment queue).
    pub resource_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start_min: Min,
    pub duration_min: Min,
    pub party_size: u32,
    pub status: BookingStatus,
    pub contact: Contact,
    pub idempotency_key: String,
    pub created_at_ms: i64,
}

impl Booking {
    /// Occupied span in absolute minutes, without buffer.
    pub fn span(&self) -> Span {
        let start = day_origin(self.date) + self.start_min;
        Span::new(start, start + self.duration_min)
    }

    /// Span including the venue's post-booking buffer.
    pub fn effective_span(&self, buffer: Min) -> Span {
        let span = self.span();
        Span::new(span.start, span.end + buffer)
    }
}

/// Input to `Engine::create_booking`. The engine assigns the booking id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub idempotency_key: String,
    pub venue_id: Ulid,
    pub date: NaiveDate,
    pub start_min: Min,
    pub end_min: Min,
    pub party_size: u32,
    pub contact: Contact,
    /// Explicitly requested resource; best-fit allocation when None.
    pub resource_id: Option<Ulid>,
}

// ── Resource state ───────────────────────────────────────────────

/// One committed booking's claim on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingSlot {
    pub booking_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub venue_id: Ulid,
    pub name: Option<String>,
    /// Seats. A booking occupies the whole resource regardless of party size.
    pub capacity: u32,
    /// Stored for the inventory; allocation never combines resources.
    pub combinable: bool,
    pub active: bool,
    /// Booking slots sorted by `span.start`.
    pub slots: Vec<BookingSlot>,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        venue_id: Ulid,
        name: Option<String>,
        capacity: u32,
        combinable: bool,
    ) -> Self {
        Self {
            id,
            venue_id,
            name,
            capacity,
            combinable,
            active: true,
            slots: Vec::new(),
        }
    }

    /// Insert a slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: BookingSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn set_slot_status(&mut self, booking_id: Ulid, status: BookingStatus) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.booking_id == booking_id) {
            slot.status = status;
            true
        } else {
            false
        }
    }

    /// Return only slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingSlot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// True if any slot still occupies time (active-status booking).
    pub fn has_active_slots(&self) -> bool {
        self.slots.iter().any(|s| s.status.blocks_slot())
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VenueCreated {
        id: Ulid,
        name: Option<String>,
        policy: LocationPolicy,
    },
    VenueUpdated {
        id: Ulid,
        name: Option<String>,
        policy: LocationPolicy,
    },
    ShiftAdded {
        id: Ulid,
        venue_id: Ulid,
        start_min: Min,
        end_min: Min,
        weekdays: u8,
        active: bool,
    },
    ShiftUpdated {
        id: Ulid,
        venue_id: Ulid,
        start_min: Min,
        end_min: Min,
        weekdays: u8,
        active: bool,
    },
    ShiftRemoved {
        id: Ulid,
        venue_id: Ulid,
    },
    ResourceAdded {
        id: Ulid,
        venue_id: Ulid,
        name: Option<String>,
        capacity: u32,
        combinable: bool,
        active: bool,
    },
    ResourceUpdated {
        id: Ulid,
        venue_id: Ulid,
        name: Option<String>,
        capacity: u32,
        combinable: bool,
        active: bool,
    },
    ResourceRemoved {
        id: Ulid,
        venue_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingAssigned {
        id: Ulid,
        venue_id: Ulid,
        resource_id: Ulid,
    },
    BookingStatusChanged {
        id: Ulid,
        venue_id: Ulid,
        status: BookingStatus,
    },
}

impl Event {
    /// Venue the event belongs to, for notification routing.
    pub fn venue_id(&self) -> Ulid {
        match self {
            Event::VenueCreated { id, .. } | Event::VenueUpdated { id, .. } => *id,
            Event::ShiftAdded { venue_id, .. }
            | Event::ShiftUpdated { venue_id, .. }
            | Event::ShiftRemoved { venue_id, .. }
            | Event::ResourceAdded { venue_id, .. }
            | Event::ResourceUpdated { venue_id, .. }
            | Event::ResourceRemoved { venue_id, .. }
            | Event::BookingAssigned { venue_id, .. }
            | Event::BookingStatusChanged { venue_id, .. } => *venue_id,
            Event::BookingCreated { booking } => booking.venue_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// One candidate slot from an availability query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    /// Minute-of-day the slot starts.
    pub start_min: Min,
    pub available: bool,
    /// Free, capacity-sufficient resources in best-fit order.
    pub resources: Vec<Ulid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_min(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn shift_weekday_mask() {
        let shift = Shift {
            id: Ulid::new(),
            venue_id: Ulid::new(),
            start_min: 11 * 60,
            end_min: 15 * 60,
            weekdays: weekday_bit(Weekday::Mon) | weekday_bit(Weekday::Fri),
            active: true,
        };
        assert!(shift.applies_on(Weekday::Mon));
        assert!(shift.applies_on(Weekday::Fri));
        assert!(!shift.applies_on(Weekday::Tue));
        assert!(!shift.applies_on(Weekday::Sun));
    }

    #[test]
    fn booking_span_is_date_anchored() {
        let b = Booking {
            id: Ulid::new(),
            venue_id: Ulid::new(),
            resource_id: None,
            date: date("2026-08-10"),
            start_min: 11 * 60,
            duration_min: 120,
            party_size: 2,
            status: BookingStatus::Pending,
            contact: Contact::default(),
            idempotency_key: "k".into(),
            created_at_ms: 0,
        };
        let span = b.span();
        assert_eq!(span.duration_min(), 120);
        assert_eq!(span.start, day_origin(date("2026-08-10")) + 11 * 60);

        let next_day = Booking {
            date: date("2026-08-11"),
            ..b.clone()
        };
        // Same time on consecutive days never overlaps.
        assert!(!b.span().overlaps(&next_day.span()));
    }

    #[test]
    fn effective_span_extends_by_buffer() {
        let b = Booking {
            id: Ulid::new(),
            venue_id: Ulid::new(),
            resource_id: None,
            date: date("2026-08-10"),
            start_min: 660,
            duration_min: 120,
            party_size: 2,
            status: BookingStatus::Confirmed,
            contact: Contact::default(),
            idempotency_key: "k".into(),
            created_at_ms: 0,
        };
        assert_eq!(b.effective_span(15).duration_min(), 135);
        assert_eq!(b.effective_span(0), b.span());
    }

    #[test]
    fn status_transition_table() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Seated));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(Seated.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Seated));
        assert!(!Seated.can_transition_to(NoShow)); // no-show only before seating
        assert!(!Seated.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Confirmed));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!NoShow.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Completed)); // must pass through seated
    }

    #[test]
    fn status_blocking_sets() {
        use BookingStatus::*;
        for s in [Pending, Confirmed, Seated] {
            assert!(s.blocks_slot());
            assert!(!s.is_terminal());
        }
        for s in [Completed, Cancelled, NoShow] {
            assert!(!s.blocks_slot());
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn status_string_roundtrip() {
        use BookingStatus::*;
        for s in [Pending, Confirmed, Seated, Completed, Cancelled, NoShow] {
            assert_eq!(BookingStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(BookingStatus::parse("arrived"), None);
    }

    #[test]
    fn slot_ordering() {
        let mut rs = ResourceState::new(Ulid::new(), Ulid::new(), None, 4, false);
        for start in [300, 100, 200] {
            rs.insert_slot(BookingSlot {
                booking_id: Ulid::new(),
                span: Span::new(start, start + 50),
                status: BookingStatus::Confirmed,
            });
        }
        assert_eq!(rs.slots[0].span.start, 100);
        assert_eq!(rs.slots[1].span.start, 200);
        assert_eq!(rs.slots[2].span.start, 300);
    }

    #[test]
    fn overlapping_skips_non_overlapping() {
        let mut rs = ResourceState::new(Ulid::new(), Ulid::new(), None, 4, false);
        rs.insert_slot(BookingSlot {
            booking_id: Ulid::new(),
            span: Span::new(100, 200),
            status: BookingStatus::Confirmed,
        });
        rs.insert_slot(BookingSlot {
            booking_id: Ulid::new(),
            span: Span::new(450, 600),
            status: BookingStatus::Confirmed,
        });
        rs.insert_slot(BookingSlot {
            booking_id: Ulid::new(),
            span: Span::new(1000, 1100),
            status: BookingStatus::Confirmed,
        });

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Slot ending exactly at query.start is NOT overlapping (half-open)
        let mut rs = ResourceState::new(Ulid::new(), Ulid::new(), None, 4, false);
        rs.insert_slot(BookingSlot {
            booking_id: Ulid::new(),
            span: Span::new(100, 200),
            status: BookingStatus::Confirmed,
        });
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn set_slot_status_finds_booking() {
        let mut rs = ResourceState::new(Ulid::new(), Ulid::new(), None, 4, false);
        let id = Ulid::new();
        rs.insert_slot(BookingSlot {
            booking_id: id,
            span: Span::new(100, 200),
            status: BookingStatus::Pending,
        });
        assert!(rs.set_slot_status(id, BookingStatus::Cancelled));
        assert!(!rs.set_slot_status(Ulid::new(), BookingStatus::Seated));
        assert!(!rs.has_active_slots());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                venue_id: Ulid::new(),
                resource_id: Some(Ulid::new()),
                date: date("2026-08-10"),
                start_min: 690,
                duration_min: 90,
                party_size: 4,
                status: BookingStatus::Confirmed,
                contact: Contact {
                    name: "Ada".into(),
                    phone: Some("555-0100".into()),
                    ..Contact::default()
                },
                idempotency_key: "req-1".into(),
                created_at_ms: 1_700_000_000_000,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
