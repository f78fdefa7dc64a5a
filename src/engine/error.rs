use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// No resource at the venue can ever seat a party of this size.
    Capacity(u32),
    /// Every capacity-sufficient resource is taken for the requested interval.
    SlotUnavailable,
    /// Lost the race for one resource; retried internally against the next
    /// candidate and only escalated as SlotUnavailable.
    Conflict(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Another request with the same idempotency key is still committing.
    KeyInFlight,
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Capacity(party) => {
                write!(f, "no resource can seat a party of {party}")
            }
            EngineError::SlotUnavailable => {
                write!(f, "no free resource for the requested interval")
            }
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(
                    f,
                    "invalid status transition: {} -> {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            EngineError::KeyInFlight => {
                write!(f, "idempotency key is held by an in-flight request")
            }
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete resource {id}: has active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
