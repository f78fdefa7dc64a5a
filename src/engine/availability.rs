use std::collections::BTreeSet;

use chrono::Weekday;

use crate::model::*;

/// Candidate slot spacing within a shift.
pub const SLOT_GRANULARITY_MIN: Min = 30;

// ── Availability Algorithm ────────────────────────────────────────

/// Candidate start times (minute-of-day) for one weekday.
///
/// Each active shift contributes starts on a 30-minute grid anchored at its
/// own start; a start survives only while the full occupied window
/// (`occupied_min` = default duration + buffer) fits before the shift ends.
/// Overlapping shifts produce each time once.
pub fn slot_starts(shifts: &[Shift], weekday: Weekday, occupied_min: Min) -> Vec<Min> {
    let mut starts = BTreeSet::new();
    for shift in shifts {
        if !shift.active || !shift.applies_on(weekday) {
            continue;
        }
        let mut t = shift.start_min;
        while t + occupied_min <= shift.end_min {
            starts.insert(t);
            t += SLOT_GRANULARITY_MIN;
        }
    }
    starts.into_iter().collect()
}

/// True if `slot` collides with none of the busy effective spans.
/// `busy` must be sorted by start.
pub fn slot_is_free(busy: &[Span], slot: &Span) -> bool {
    // Everything at index >= right_bound starts at or after slot.end.
    let right_bound = busy.partition_point(|s| s.start < slot.end);
    !busy[..right_bound].iter().any(|s| s.end > slot.start)
}

/// Busy effective spans for a resource within the query window: every
/// active-status slot extended by the venue buffer, sorted by start.
/// Terminal statuses (completed/cancelled/no-show) never block.
pub fn busy_spans(resource: &ResourceState, query: &Span, buffer: Min) -> Vec<Span> {
    let search = Span::new((query.start - buffer).max(0), query.end + buffer);
    let mut busy: Vec<Span> = resource
        .overlapping(&search)
        .filter(|slot| slot.status.blocks_slot())
        .map(|slot| Span::new(slot.span.start, slot.span.end + buffer))
        .collect();
    busy.sort_by_key(|s| s.start);
    busy
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Min = 60;

    fn shift(start: Min, end: Min, weekdays: u8) -> Shift {
        Shift {
            id: Ulid::new(),
            venue_id: Ulid::new(),
            start_min: start,
            end_min: end,
            weekdays,
            active: true,
        }
    }

    const ALL_DAYS: u8 = 0x7f;

    // ── slot_starts ───────────────────────────────────────

    #[test]
    fn slots_fit_duration_and_buffer_before_close() {
        // Shift 11:00-15:00, duration 120 + buffer 15: the last start whose
        // [t, t+135) window fits is 12:30 on the 30-minute grid.
        let shifts = vec![shift(11 * H, 15 * H, ALL_DAYS)];
        let starts = slot_starts(&shifts, Weekday::Mon, 135);
        assert_eq!(starts, vec![11 * H, 11 * H + 30, 12 * H, 12 * H + 30]);
    }

    #[test]
    fn slots_without_buffer_reach_later() {
        let shifts = vec![shift(11 * H, 15 * H, ALL_DAYS)];
        let starts = slot_starts(&shifts, Weekday::Mon, 120);
        assert_eq!(
            starts,
            vec![11 * H, 11 * H + 30, 12 * H, 12 * H + 30, 13 * H]
        );
    }

    #[test]
    fn slots_empty_when_no_shift_covers_weekday() {
        let shifts = vec![shift(11 * H, 15 * H, weekday_bit(Weekday::Mon))];
        assert!(slot_starts(&shifts, Weekday::Tue, 120).is_empty());
    }

    #[test]
    fn slots_skip_inactive_shifts() {
        let mut s = shift(11 * H, 15 * H, ALL_DAYS);
        s.active = false;
        assert!(slot_starts(&[s], Weekday::Mon, 120).is_empty());
    }

    #[test]
    fn slots_shorter_than_occupancy_yield_nothing() {
        let shifts = vec![shift(11 * H, 12 * H, ALL_DAYS)];
        assert!(slot_starts(&shifts, Weekday::Mon, 120).is_empty());
    }

    #[test]
    fn overlapping_shifts_merge_duplicate_starts() {
        // 11:00-15:00 and 13:00-17:00 both produce 13:00; it appears once.
        let shifts = vec![
            shift(11 * H, 15 * H, ALL_DAYS),
            shift(13 * H, 17 * H, ALL_DAYS),
        ];
        let starts = slot_starts(&shifts, Weekday::Mon, 120);
        let expected: Vec<Min> = vec![
            11 * H,
            11 * H + 30,
            12 * H,
            12 * H + 30,
            13 * H,
            13 * H + 30,
            14 * H,
            14 * H + 30,
            15 * H,
        ];
        assert_eq!(starts, expected);
    }

    #[test]
    fn disjoint_shifts_produce_sorted_union() {
        let shifts = vec![
            shift(18 * H, 21 * H, ALL_DAYS),
            shift(11 * H, 14 * H, ALL_DAYS),
        ];
        let starts = slot_starts(&shifts, Weekday::Mon, 120);
        assert_eq!(starts, vec![11 * H, 11 * H + 30, 12 * H, 18 * H, 18 * H + 30, 19 * H]);
    }

    #[test]
    fn off_grid_shift_start_anchors_grid() {
        // A 10:15 shift start produces 10:15, 10:45, ... — the grid is
        // anchored at the shift, not at midnight.
        let shifts = vec![shift(10 * H + 15, 12 * H + 15, ALL_DAYS)];
        let starts = slot_starts(&shifts, Weekday::Mon, 120);
        assert_eq!(starts, vec![10 * H + 15]);
    }

    // ── slot_is_free / busy_spans ─────────────────────────

    #[test]
    fn free_when_no_busy_spans() {
        assert!(slot_is_free(&[], &Span::new(100, 200)));
    }

    #[test]
    fn busy_overlap_detected() {
        let busy = vec![Span::new(100, 200), Span::new(400, 500)];
        assert!(!slot_is_free(&busy, &Span::new(150, 250)));
        assert!(!slot_is_free(&busy, &Span::new(450, 460)));
        assert!(slot_is_free(&busy, &Span::new(200, 400))); // exactly between
        assert!(slot_is_free(&busy, &Span::new(500, 600)));
    }

    fn resource_with(slots: Vec<(Min, Min, BookingStatus)>) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), Ulid::new(), None, 4, false);
        for (start, end, status) in slots {
            rs.insert_slot(BookingSlot {
                booking_id: Ulid::new(),
                span: Span::new(start, end),
                status,
            });
        }
        rs
    }

    #[test]
    fn busy_spans_extend_by_buffer() {
        let rs = resource_with(vec![(1000, 1120, BookingStatus::Confirmed)]);
        let busy = busy_spans(&rs, &Span::new(0, 2000), 15);
        assert_eq!(busy, vec![Span::new(1000, 1135)]);
    }

    #[test]
    fn terminal_statuses_never_block() {
        let rs = resource_with(vec![
            (1000, 1120, BookingStatus::Cancelled),
            (1000, 1120, BookingStatus::NoShow),
            (1000, 1120, BookingStatus::Completed),
        ]);
        assert!(busy_spans(&rs, &Span::new(0, 2000), 15).is_empty());
    }

    #[test]
    fn busy_spans_catch_booking_just_before_window() {
        // A booking ending right before the window still blocks it through
        // its buffer; the search window is widened backwards to find it.
        let rs = resource_with(vec![(900, 1000, BookingStatus::Seated)]);
        let busy = busy_spans(&rs, &Span::new(1000, 1100), 30);
        assert_eq!(busy, vec![Span::new(900, 1030)]);
        assert!(!slot_is_free(&busy, &Span::new(1000, 1100)));
    }
}
