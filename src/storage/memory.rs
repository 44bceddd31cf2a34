use crate::error::TripleStoreError;
use crate::storage::encoded_key::EncodedKey;
use crate::storage::KeyRange;
use im::OrdMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One committed batch of writes, as delivered to subscribers.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub set: Vec<(EncodedKey, Arc<[u8]>)>,
    pub remove: Vec<EncodedKey>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

pub type WriteCallback = Arc<dyn Fn(&WriteBatch) + Send + Sync>;

struct Subscriber {
    id: u64,
    range: KeyRange,
    callback: WriteCallback,
}

pub(crate) struct StoreState {
    entries: OrdMap<EncodedKey, Arc<[u8]>>,
    seq: u64,
}

/// Ordered key-value backend: a persistent sorted map plus a commit sequence
/// number. Snapshots are O(1) clones of the map; commits validate the
/// sequence they were staged against and fail with a retryable conflict when
/// another commit got there first.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                entries: OrdMap::new(),
                seq: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock();
        StoreSnapshot {
            entries: state.entries.clone(),
            seq: state.seq,
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock()
    }

    /// Single-participant commit path: validate and apply in one step, then
    /// publish to subscribers.
    pub fn commit(&self, expected_seq: u64, batch: &WriteBatch) -> Result<u64, TripleStoreError> {
        let seq = {
            let mut state = self.state.lock();
            state.validate(expected_seq)?;
            state.apply(batch)
        };
        self.publish(batch);
        Ok(seq)
    }

    /// Delivers a committed batch to every subscriber whose range intersects
    /// it, filtered down to the matching keys.
    pub(crate) fn publish(&self, batch: &WriteBatch) {
        if batch.is_empty() {
            return;
        }
        let subscribers: Vec<(KeyRange, WriteCallback)> = {
            let subs = self.subscribers.lock();
            subs.iter()
                .map(|s| (s.range.clone(), Arc::clone(&s.callback)))
                .collect()
        };
        for (range, callback) in subscribers {
            let filtered = WriteBatch {
                set: batch
                    .set
                    .iter()
                    .filter(|(key, _)| range.contains(key))
                    .cloned()
                    .collect(),
                remove: batch
                    .remove
                    .iter()
                    .filter(|key| range.contains(key))
                    .cloned()
                    .collect(),
            };
            if !filtered.is_empty() {
                callback(&filtered);
            }
        }
    }

    pub fn subscribe(&self, range: KeyRange, callback: WriteCallback) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            range,
            callback,
        });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries = OrdMap::new();
        state.seq += 1;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoreState {
    pub(crate) fn validate(&self, expected_seq: u64) -> Result<(), TripleStoreError> {
        if self.seq != expected_seq {
            return Err(TripleStoreError::Conflict(format!(
                "store sequence moved from {expected_seq} to {}",
                self.seq
            )));
        }
        Ok(())
    }

    pub(crate) fn apply(&mut self, batch: &WriteBatch) -> u64 {
        for (key, value) in &batch.set {
            self.entries.insert(key.clone(), Arc::clone(value));
        }
        for key in &batch.remove {
            self.entries.remove(key);
        }
        self.seq += 1;
        self.seq
    }
}

/// Immutable view of a store at one commit sequence.
#[derive(Clone)]
pub struct StoreSnapshot {
    entries: OrdMap<EncodedKey, Arc<[u8]>>,
    pub seq: u64,
}

impl StoreSnapshot {
    /// Ordered scan over the byte range. `reverse` yields the exact reversal.
    pub fn scan(&self, range: &KeyRange, reverse: bool) -> Vec<(EncodedKey, Arc<[u8]>)> {
        if range.is_degenerate() {
            return Vec::new();
        }
        let mut out: Vec<(EncodedKey, Arc<[u8]>)> = self
            .entries
            .range(range.as_bounds())
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        if reverse {
            out.reverse();
        }
        out
    }

    pub fn get(&self, key: &EncodedKey) -> Option<Arc<[u8]>> {
        self.entries.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryStore, WriteBatch};
    use crate::storage::encoded_key::EncodedKey;
    use crate::storage::ScanArgs;
    use crate::tuple::KeyElem;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn key(parts: &[&str]) -> EncodedKey {
        let elems: Vec<KeyElem> = parts.iter().map(|p| KeyElem::Text((*p).into())).collect();
        EncodedKey::from_elems(&elems)
    }

    fn value(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    #[test]
    fn commit_applies_and_bumps_sequence() {
        let store = MemoryStore::new();
        let batch = WriteBatch {
            set: vec![(key(&["a"]), value("1")), (key(&["b"]), value("2"))],
            remove: vec![],
        };
        let seq = store.commit(0, &batch).expect("commit");
        assert_eq!(seq, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.snapshot().get(&key(&["a"])), Some(value("1")));
    }

    #[test]
    fn stale_commit_conflicts() {
        let store = MemoryStore::new();
        let batch = WriteBatch {
            set: vec![(key(&["a"]), value("1"))],
            remove: vec![],
        };
        store.commit(0, &batch).expect("first commit");
        let err = store.commit(0, &batch).expect_err("stale commit");
        assert!(err.is_retryable());
    }

    #[test]
    fn snapshot_is_isolated_from_later_commits() {
        let store = MemoryStore::new();
        store
            .commit(
                0,
                &WriteBatch {
                    set: vec![(key(&["a"]), value("1"))],
                    remove: vec![],
                },
            )
            .expect("seed");
        let snap = store.snapshot();
        store
            .commit(
                1,
                &WriteBatch {
                    set: vec![(key(&["b"]), value("2"))],
                    remove: vec![key(&["a"])],
                },
            )
            .expect("second");
        assert!(snap.get(&key(&["a"])).is_some());
        assert!(snap.get(&key(&["b"])).is_none());
    }

    #[test]
    fn reverse_scan_is_exact_reversal() {
        let store = MemoryStore::new();
        let batch = WriteBatch {
            set: vec![
                (key(&["a"]), value("1")),
                (key(&["b"]), value("2")),
                (key(&["c"]), value("3")),
            ],
            remove: vec![],
        };
        store.commit(0, &batch).expect("commit");
        let range = ScanArgs::default().key_range(&[]);
        let snap = store.snapshot();
        let forward: Vec<_> = snap.scan(&range, false).into_iter().map(|(k, _)| k).collect();
        let mut backward: Vec<_> = snap.scan(&range, true).into_iter().map(|(k, _)| k).collect();
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 3);
    }

    #[test]
    fn subscribers_only_see_keys_in_range() {
        let store = MemoryStore::new();
        let seen: Arc<Mutex<Vec<EncodedKey>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = Arc::clone(&seen);
        let range = ScanArgs::with_prefix(vec![KeyElem::Text("b".into())]).key_range(&[]);
        store.subscribe(
            range,
            Arc::new(move |batch| {
                seen_in_cb
                    .lock()
                    .extend(batch.set.iter().map(|(k, _)| k.clone()));
            }),
        );
        store
            .commit(
                0,
                &WriteBatch {
                    set: vec![
                        (key(&["a", "x"]), value("1")),
                        (key(&["b", "y"]), value("2")),
                    ],
                    remove: vec![],
                },
            )
            .expect("commit");
        let seen = seen.lock();
        assert_eq!(seen.as_slice(), &[key(&["b", "y"])]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let store = MemoryStore::new();
        let count = Arc::new(Mutex::new(0usize));
        let count_in_cb = Arc::clone(&count);
        let id = store.subscribe(
            ScanArgs::default().key_range(&[]),
            Arc::new(move |_| *count_in_cb.lock() += 1),
        );
        let batch = WriteBatch {
            set: vec![(key(&["a"]), value("1"))],
            remove: vec![],
        };
        store.commit(0, &batch).expect("commit");
        store.unsubscribe(id);
        store.commit(1, &batch).expect("commit");
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn clear_drops_everything_and_invalidates_staged_commits() {
        let store = MemoryStore::new();
        let batch = WriteBatch {
            set: vec![(key(&["a"]), value("1"))],
            remove: vec![],
        };
        store.commit(0, &batch).expect("commit");
        store.clear();
        assert!(store.is_empty());
        assert!(store.commit(1, &batch).is_err());
    }
}
