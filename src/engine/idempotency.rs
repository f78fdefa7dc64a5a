use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use ulid::Ulid;

/// Deduplicates booking creation by client-supplied key.
///
/// `begin` atomically claims a key (DashMap entry lock, held only
/// synchronously). Exactly one caller ever sees `New` for a given key; a
/// concurrent duplicate gets the in-flight `Notify` and waits for the winner
/// to commit or abort. Committed keys map to the booking id forever — a
/// retried request returns the original booking, never an error.
pub struct IdempotencyGuard {
    keys: DashMap<String, KeySlot>,
}

enum KeySlot {
    InFlight(Arc<Notify>),
    Committed(Ulid),
}

pub(super) enum Reservation {
    /// Key claimed; caller must `commit` or `abort`.
    New,
    /// Key already committed to this booking.
    Existing(Ulid),
    /// Another request holds the key; wait on the notify and retry `begin`.
    InFlight(Arc<Notify>),
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    pub(super) fn begin(&self, key: &str) -> Reservation {
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                KeySlot::Committed(id) => Reservation::Existing(*id),
                KeySlot::InFlight(notify) => Reservation::InFlight(notify.clone()),
            },
            Entry::Vacant(entry) => {
                entry.insert(KeySlot::InFlight(Arc::new(Notify::new())));
                Reservation::New
            }
        }
    }

    pub(super) fn commit(&self, key: &str, booking_id: Ulid) {
        let notify = match self.keys.get_mut(key) {
            Some(mut slot) => match std::mem::replace(&mut *slot, KeySlot::Committed(booking_id)) {
                KeySlot::InFlight(notify) => Some(notify),
                KeySlot::Committed(_) => None,
            },
            None => None,
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    pub(super) fn abort(&self, key: &str) {
        let removed = self
            .keys
            .remove_if(key, |_, slot| matches!(slot, KeySlot::InFlight(_)));
        if let Some((_, KeySlot::InFlight(notify))) = removed {
            notify.notify_waiters();
        }
    }

    /// Rebuild a committed key during WAL replay.
    pub(super) fn restore(&self, key: String, booking_id: Ulid) {
        self.keys.insert(key, KeySlot::Committed(booking_id));
    }

    pub fn committed(&self, key: &str) -> Option<Ulid> {
        match self.keys.get(key).as_deref() {
            Some(KeySlot::Committed(id)) => Some(*id),
            _ => None,
        }
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_begin_is_new_second_waits() {
        let guard = IdempotencyGuard::new();
        assert!(matches!(guard.begin("k"), Reservation::New));
        assert!(matches!(guard.begin("k"), Reservation::InFlight(_)));
    }

    #[test]
    fn commit_resolves_to_existing() {
        let guard = IdempotencyGuard::new();
        let id = Ulid::new();
        assert!(matches!(guard.begin("k"), Reservation::New));
        guard.commit("k", id);
        match guard.begin("k") {
            Reservation::Existing(found) => assert_eq!(found, id),
            _ => panic!("expected Existing"),
        }
        assert_eq!(guard.committed("k"), Some(id));
    }

    #[test]
    fn abort_releases_the_key() {
        let guard = IdempotencyGuard::new();
        assert!(matches!(guard.begin("k"), Reservation::New));
        guard.abort("k");
        assert!(matches!(guard.begin("k"), Reservation::New));
    }

    #[test]
    fn abort_never_drops_a_committed_key() {
        let guard = IdempotencyGuard::new();
        let id = Ulid::new();
        assert!(matches!(guard.begin("k"), Reservation::New));
        guard.commit("k", id);
        guard.abort("k");
        assert_eq!(guard.committed("k"), Some(id));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let guard = IdempotencyGuard::new();
        assert!(matches!(guard.begin("a"), Reservation::New));
        assert!(matches!(guard.begin("b"), Reservation::New));
    }

    #[tokio::test]
    async fn waiter_wakes_on_commit() {
        let guard = IdempotencyGuard::new();
        assert!(matches!(guard.begin("k"), Reservation::New));

        let notify = match guard.begin("k") {
            Reservation::InFlight(n) => n,
            _ => panic!("expected InFlight"),
        };

        // Register interest before the commit so the wakeup cannot be missed.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let id = Ulid::new();
        guard.commit("k", id);

        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .expect("waiter timed out");
        assert_eq!(guard.committed("k"), Some(id));
    }
}
