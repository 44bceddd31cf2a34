use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hybrid logical timestamp: a per-client monotone counter plus the
/// producing client's id. The derived order (counter first, then client id)
/// is the total order used everywhere facts are reconciled.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub counter: u64,
    pub client_id: CompactString,
}

impl Timestamp {
    pub fn new(counter: u64, client_id: impl Into<CompactString>) -> Self {
        Self {
            counter,
            client_id: client_id.into(),
        }
    }
}

/// Source of transaction timestamps for one store.
///
/// `initialize` is called once at store construction with the greatest
/// timestamp previously persisted for this client, so counters stay monotone
/// across restarts. Implementations must make `next_timestamp` strictly
/// increasing under concurrent callers.
pub trait Clock: Send + Sync {
    fn client_id(&self) -> CompactString;
    fn initialize(&self, max_seen: Option<Timestamp>);
    fn next_timestamp(&self) -> Timestamp;
}

/// In-memory monotone counter clock. The default when no clock is supplied.
pub struct MemoryClock {
    client_id: CompactString,
    counter: AtomicU64,
}

impl MemoryClock {
    pub fn new(client_id: impl Into<CompactString>) -> Self {
        Self {
            client_id: client_id.into(),
            counter: AtomicU64::new(1),
        }
    }

    pub fn with_random_client() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string().as_str())
    }
}

impl Clock for MemoryClock {
    fn client_id(&self) -> CompactString {
        self.client_id.clone()
    }

    fn initialize(&self, max_seen: Option<Timestamp>) {
        if let Some(max) = max_seen {
            if max.client_id == self.client_id {
                self.counter.fetch_max(max.counter + 1, Ordering::SeqCst);
            }
        }
    }

    fn next_timestamp(&self) -> Timestamp {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        Timestamp::new(counter, self.client_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, MemoryClock, Timestamp};

    #[test]
    fn timestamps_order_by_counter_then_client() {
        let a = Timestamp::new(1, "c2");
        let b = Timestamp::new(2, "c1");
        let c = Timestamp::new(2, "c2");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn successive_timestamps_strictly_increase() {
        let clock = MemoryClock::new("c1");
        let mut prev = clock.next_timestamp();
        for _ in 0..100 {
            let next = clock.next_timestamp();
            assert!(prev < next);
            prev = next;
        }
    }

    #[test]
    fn initialize_resumes_past_persisted_maximum() {
        let clock = MemoryClock::new("c1");
        clock.initialize(Some(Timestamp::new(41, "c1")));
        assert_eq!(clock.next_timestamp(), Timestamp::new(42, "c1"));
    }

    #[test]
    fn initialize_ignores_other_clients() {
        let clock = MemoryClock::new("c1");
        clock.initialize(Some(Timestamp::new(900, "someone-else")));
        assert_eq!(clock.next_timestamp().counter, 1);
    }

    #[test]
    fn initialize_never_moves_the_counter_backwards() {
        let clock = MemoryClock::new("c1");
        for _ in 0..10 {
            clock.next_timestamp();
        }
        clock.initialize(Some(Timestamp::new(3, "c1")));
        assert!(clock.next_timestamp().counter >= 11);
    }
}
