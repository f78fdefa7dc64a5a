use chrono::Datelike;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

pub(crate) fn validate_request(req: &BookingRequest) -> Result<(), EngineError> {
    if req.idempotency_key.is_empty() {
        return Err(EngineError::Validation("idempotency key required"));
    }
    if req.idempotency_key.len() > MAX_KEY_LEN {
        return Err(EngineError::LimitExceeded("idempotency key too long"));
    }
    if req.party_size == 0 {
        return Err(EngineError::Validation("party size must be positive"));
    }
    if req.party_size > MAX_PARTY_SIZE {
        return Err(EngineError::LimitExceeded("party size too large"));
    }
    if req.contact.name.is_empty() {
        return Err(EngineError::Validation("contact name required"));
    }
    if req.contact.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("contact name too long"));
    }
    validate_window(req.date, req.start_min, req.end_min)?;
    Ok(())
}

pub(crate) fn validate_window(
    date: chrono::NaiveDate,
    start_min: Min,
    end_min: Min,
) -> Result<(), EngineError> {
    if date.year() < MIN_VALID_YEAR || date.year() > MAX_VALID_YEAR {
        return Err(EngineError::Validation("date out of range"));
    }
    if start_min < 0 || end_min > MINUTES_PER_DAY || start_min >= end_min {
        return Err(EngineError::Validation("start must be before end within the day"));
    }
    if end_min - start_min > MAX_DURATION_MIN {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}

/// Reject the span if any active booking's effective interval overlaps its
/// effective interval. Both sides carry the venue buffer; the search window
/// is widened by the buffer to catch bookings whose buffer reaches in from
/// outside the raw span. Caller holds the resource's write lock.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    buffer: Min,
) -> Result<(), EngineError> {
    let search = Span::new((span.start - buffer).max(0), span.end + buffer);
    let ours = Span::new(span.start, span.end + buffer);
    for slot in rs.overlapping(&search) {
        if !slot.status.blocks_slot() {
            continue;
        }
        let theirs = Span::new(slot.span.start, slot.span.end + buffer);
        if theirs.overlaps(&ours) {
            return Err(EngineError::Conflict(slot.booking_id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

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
    fn overlap_is_conflict() {
        let rs = resource_with(vec![(1000, 1120, BookingStatus::Confirmed)]);
        let result = check_no_conflict(&rs, &Span::new(1060, 1180), 0);
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[test]
    fn adjacent_without_buffer_is_fine() {
        let rs = resource_with(vec![(1000, 1120, BookingStatus::Confirmed)]);
        assert!(check_no_conflict(&rs, &Span::new(1120, 1240), 0).is_ok());
    }

    #[test]
    fn buffer_blocks_back_to_back() {
        // Existing booking ends at 1120; with a 15-minute buffer the next
        // may not start before 1135.
        let rs = resource_with(vec![(1000, 1120, BookingStatus::Confirmed)]);
        assert!(matches!(
            check_no_conflict(&rs, &Span::new(1120, 1240), 15),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            check_no_conflict(&rs, &Span::new(1134, 1240), 15),
            Err(EngineError::Conflict(_))
        ));
        assert!(check_no_conflict(&rs, &Span::new(1135, 1240), 15).is_ok());
    }

    #[test]
    fn own_buffer_reaches_forward() {
        // New booking's buffer collides with a booking starting right after it.
        let rs = resource_with(vec![(1130, 1250, BookingStatus::Pending)]);
        assert!(matches!(
            check_no_conflict(&rs, &Span::new(1000, 1120), 15),
            Err(EngineError::Conflict(_))
        ));
        assert!(check_no_conflict(&rs, &Span::new(1000, 1115), 15).is_ok());
    }

    #[test]
    fn terminal_bookings_do_not_conflict() {
        let rs = resource_with(vec![
            (1000, 1120, BookingStatus::Cancelled),
            (1000, 1120, BookingStatus::Completed),
            (1000, 1120, BookingStatus::NoShow),
        ]);
        assert!(check_no_conflict(&rs, &Span::new(1000, 1120), 15).is_ok());
    }

    #[test]
    fn all_active_statuses_conflict() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::Seated,
        ] {
            let rs = resource_with(vec![(1000, 1120, status)]);
            assert!(matches!(
                check_no_conflict(&rs, &Span::new(1100, 1200), 0),
                Err(EngineError::Conflict(_))
            ));
        }
    }

    #[test]
    fn window_validation() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 8, 10).unwrap();
        assert!(validate_window(date, 660, 780).is_ok());
        assert!(validate_window(date, 780, 660).is_err());
        assert!(validate_window(date, 660, 660).is_err());
        assert!(validate_window(date, -10, 60).is_err());
        assert!(validate_window(date, 0, MINUTES_PER_DAY + 1).is_err());

        let ancient = chrono::NaiveDate::from_ymd_opt(1999, 1, 1).unwrap();
        assert!(validate_window(ancient, 660, 780).is_err());
    }
}
