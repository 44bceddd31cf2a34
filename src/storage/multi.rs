use crate::error::TripleStoreError;
use crate::storage::encoded_key::EncodedKey;
use crate::storage::memory::{MemoryStore, StoreSnapshot, WriteBatch};
use crate::storage::{KeyRange, ScanArgs};
use crate::tuple::KeyElem;
use compact_str::CompactString;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub type StoreName = CompactString;

pub(crate) const MAX_COMMIT_ATTEMPTS: usize = 8;

/// A committed write batch with keys decoded to tuples, ambient prefix
/// stripped.
#[derive(Debug, Clone, Default)]
pub struct TupleWriteBatch {
    pub set: Vec<(Vec<KeyElem>, Arc<[u8]>)>,
    pub remove: Vec<Vec<KeyElem>>,
}

pub type TupleWriteCallback = Arc<dyn Fn(&TupleWriteBatch) + Send + Sync>;

struct MultiSubscriber {
    id: u64,
    range: KeyRange,
    strip: usize,
    callback: TupleWriteCallback,
}

type SubscriberRegistry = Arc<Mutex<Vec<MultiSubscriber>>>;

/// Handle returned by `subscribe`; dropping it keeps the subscription alive,
/// `unsubscribe` tears it down.
pub struct SubscriptionHandle {
    subscribers: SubscriberRegistry,
    id: u64,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        self.subscribers.lock().retain(|s| s.id != self.id);
    }
}

/// One logical ordered key-value surface over named physical stores.
///
/// Every operation is scoped to the active subset of stores and prefixed
/// with the ambient subspace (tenant scoping). Scans union across the scoped
/// stores merge-sorted by key; writes fan out to all of them.
#[derive(Clone)]
pub struct MultiStore {
    stores: Arc<BTreeMap<StoreName, Arc<MemoryStore>>>,
    scope: Arc<BTreeSet<StoreName>>,
    prefix: Vec<KeyElem>,
    subscribers: SubscriberRegistry,
    next_subscriber_id: Arc<AtomicU64>,
}

impl MultiStore {
    pub fn new(stores: BTreeMap<StoreName, Arc<MemoryStore>>) -> Self {
        let scope = stores.keys().cloned().collect();
        Self {
            stores: Arc::new(stores),
            scope: Arc::new(scope),
            prefix: Vec::new(),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn single(store: Arc<MemoryStore>) -> Self {
        let mut stores = BTreeMap::new();
        stores.insert(StoreName::from("default"), store);
        Self::new(stores)
    }

    pub fn store_names(&self) -> Vec<StoreName> {
        self.stores.keys().cloned().collect()
    }

    pub fn scope_names(&self) -> Vec<StoreName> {
        self.scope.iter().cloned().collect()
    }

    /// Restricts subsequent operations to the named subset.
    pub fn with_scope(&self, names: &[&str]) -> Result<Self, TripleStoreError> {
        let mut scope = BTreeSet::new();
        for name in names {
            if !self.stores.contains_key(*name) {
                return Err(TripleStoreError::Options(format!(
                    "unknown storage '{name}'"
                )));
            }
            scope.insert(StoreName::from(*name));
        }
        Ok(Self {
            stores: Arc::clone(&self.stores),
            scope: Arc::new(scope),
            prefix: self.prefix.clone(),
            subscribers: Arc::clone(&self.subscribers),
            next_subscriber_id: Arc::clone(&self.next_subscriber_id),
        })
    }

    /// A view whose every operation is automatically prefixed.
    pub fn subspace(&self, prefix: &[KeyElem]) -> Self {
        let mut extended = self.prefix.clone();
        extended.extend_from_slice(prefix);
        Self {
            stores: Arc::clone(&self.stores),
            scope: Arc::clone(&self.scope),
            prefix: extended,
            subscribers: Arc::clone(&self.subscribers),
            next_subscriber_id: Arc::clone(&self.next_subscriber_id),
        }
    }

    fn scoped(&self) -> impl Iterator<Item = (&StoreName, &Arc<MemoryStore>)> {
        self.stores
            .iter()
            .filter(|(name, _)| self.scope.contains(*name))
    }

    /// Union of scans across the scoped stores, merge-sorted by key. Equal
    /// keys dedupe to the first store in name order.
    pub fn scan(
        &self,
        args: &ScanArgs,
    ) -> Result<Vec<(Vec<KeyElem>, Arc<[u8]>)>, TripleStoreError> {
        let range = args.key_range(&self.prefix);
        let mut merged: BTreeMap<EncodedKey, Arc<[u8]>> = BTreeMap::new();
        for (_, store) in self.scoped() {
            for (key, value) in store.snapshot().scan(&range, false) {
                merged.entry(key).or_insert(value);
            }
        }
        decode_merged(merged, self.prefix.len(), args.reverse)
    }

    /// Registers for committed write batches intersecting the range. A write
    /// fanned out to several stores is delivered once, deduplicated by key.
    pub fn subscribe(&self, args: &ScanArgs, callback: TupleWriteCallback) -> SubscriptionHandle {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(MultiSubscriber {
            id,
            range: args.key_range(&self.prefix),
            strip: self.prefix.len(),
            callback,
        });
        SubscriptionHandle {
            subscribers: Arc::clone(&self.subscribers),
            id,
        }
    }

    /// Opens a transaction spanning the currently scoped stores.
    pub fn transact(&self) -> MultiTransaction {
        let participants = self
            .scoped()
            .map(|(name, store)| {
                (
                    name.clone(),
                    Participant {
                        store: Arc::clone(store),
                        snapshot: store.snapshot(),
                        staged: BTreeMap::new(),
                    },
                )
            })
            .collect();
        MultiTransaction {
            participants,
            prefix: self.prefix.clone(),
            subscribers: Arc::clone(&self.subscribers),
            closed: false,
        }
    }

    /// Opens a transaction spanning an explicit store subset.
    pub fn transact_with(&self, names: &[&str]) -> Result<MultiTransaction, TripleStoreError> {
        self.with_scope(names).map(|scoped| scoped.transact())
    }

    /// Opens a transaction, runs `body`, commits; re-runs the whole body on
    /// retryable commit conflicts.
    pub fn auto_transact<T>(
        &self,
        mut body: impl FnMut(&mut MultiTransaction) -> Result<T, TripleStoreError>,
    ) -> Result<T, TripleStoreError> {
        let mut attempt = 1;
        loop {
            let mut tx = self.transact();
            let result = body(&mut tx).and_then(|value| tx.commit().map(|_| value));
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(attempt, error = %err, "retrying conflicted transaction");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn clear(&self) {
        for (_, store) in self.scoped() {
            store.clear();
        }
    }
}

struct Participant {
    store: Arc<MemoryStore>,
    snapshot: StoreSnapshot,
    staged: BTreeMap<EncodedKey, Option<Arc<[u8]>>>,
}

/// Staged reads and writes over per-store snapshots. Commit is two-phase:
/// lock every written participant in name order, validate every base
/// sequence, then apply all batches and publish after release.
pub struct MultiTransaction {
    participants: BTreeMap<StoreName, Participant>,
    prefix: Vec<KeyElem>,
    subscribers: SubscriberRegistry,
    closed: bool,
}

impl MultiTransaction {
    pub fn participant_names(&self) -> Vec<StoreName> {
        self.participants.keys().cloned().collect()
    }

    pub fn contains_store(&self, name: &str) -> bool {
        self.participants.contains_key(name)
    }

    fn scoped<'a>(
        &'a self,
        scope: Option<&'a BTreeSet<StoreName>>,
    ) -> impl Iterator<Item = (&'a StoreName, &'a Participant)> {
        self.participants
            .iter()
            .filter(move |(name, _)| scope.map_or(true, |s| s.contains(*name)))
    }

    /// Transactional scan: staged writes layered over each store snapshot,
    /// then merged across stores.
    pub fn scan(
        &self,
        scope: Option<&BTreeSet<StoreName>>,
        args: &ScanArgs,
    ) -> Result<Vec<(Vec<KeyElem>, Arc<[u8]>)>, TripleStoreError> {
        let range = args.key_range(&self.prefix);
        let mut merged: BTreeMap<EncodedKey, Arc<[u8]>> = BTreeMap::new();
        for (_, participant) in self.scoped(scope) {
            let mut layered: BTreeMap<EncodedKey, Arc<[u8]>> = participant
                .snapshot
                .scan(&range, false)
                .into_iter()
                .collect();
            for (key, staged) in &participant.staged {
                if !range.contains(key) {
                    continue;
                }
                match staged {
                    Some(value) => {
                        layered.insert(key.clone(), Arc::clone(value));
                    }
                    None => {
                        layered.remove(key);
                    }
                }
            }
            for (key, value) in layered {
                merged.entry(key).or_insert(value);
            }
        }
        decode_merged(merged, self.prefix.len(), args.reverse)
    }

    pub fn set(
        &mut self,
        scope: Option<&BTreeSet<StoreName>>,
        key: &[KeyElem],
        value: Arc<[u8]>,
    ) {
        let encoded = EncodedKey::from_elems(&self.prefix).concat(key);
        for participant in self.scoped_mut(scope) {
            participant
                .staged
                .insert(encoded.clone(), Some(Arc::clone(&value)));
        }
    }

    pub fn remove(&mut self, scope: Option<&BTreeSet<StoreName>>, key: &[KeyElem]) {
        let encoded = EncodedKey::from_elems(&self.prefix).concat(key);
        for participant in self.scoped_mut(scope) {
            participant.staged.insert(encoded.clone(), None);
        }
    }

    fn scoped_mut<'a>(
        &'a mut self,
        scope: Option<&'a BTreeSet<StoreName>>,
    ) -> impl Iterator<Item = &'a mut Participant> {
        self.participants
            .iter_mut()
            .filter(move |(name, _)| scope.map_or(true, |s| s.contains(*name)))
            .map(|(_, participant)| participant)
    }

    /// Commits all participants atomically. Staged state survives a conflict
    /// error only in the sense that the caller retries with a fresh
    /// transaction; this one is closed either way.
    pub fn commit(&mut self) -> Result<(), TripleStoreError> {
        if self.closed {
            return Err(TripleStoreError::Internal(
                "transaction already closed".into(),
            ));
        }
        self.closed = true;

        let written: Vec<(StoreName, Arc<MemoryStore>, u64, WriteBatch)> = self
            .participants
            .iter()
            .filter(|(_, p)| !p.staged.is_empty())
            .map(|(name, p)| {
                let mut batch = WriteBatch::default();
                for (key, staged) in &p.staged {
                    match staged {
                        Some(value) => batch.set.push((key.clone(), Arc::clone(value))),
                        None => batch.remove.push(key.clone()),
                    }
                }
                (name.clone(), Arc::clone(&p.store), p.snapshot.seq, batch)
            })
            .collect();
        if written.is_empty() {
            return Ok(());
        }

        {
            let mut guards = Vec::with_capacity(written.len());
            for (_, store, _, _) in &written {
                guards.push(store.lock_state());
            }
            for (guard, (name, _, base_seq, _)) in guards.iter().zip(&written) {
                guard.validate(*base_seq).map_err(|err| {
                    TripleStoreError::Conflict(format!("store '{name}': {err}"))
                })?;
            }
            for (guard, (_, _, _, batch)) in guards.iter_mut().zip(&written) {
                guard.apply(batch);
            }
        }

        for (name, store, _, batch) in &written {
            debug!(
                store = %name,
                sets = batch.set.len(),
                removes = batch.remove.len(),
                "committed store batch"
            );
            store.publish(batch);
        }
        self.publish_merged(&written);
        Ok(())
    }

    /// Delivers one key-deduplicated batch per commit to multi-store
    /// subscribers, so fan-out writes are not observed once per store.
    fn publish_merged(&self, written: &[(StoreName, Arc<MemoryStore>, u64, WriteBatch)]) {
        let mut merged: BTreeMap<EncodedKey, Option<Arc<[u8]>>> = BTreeMap::new();
        for (_, _, _, batch) in written {
            for (key, value) in &batch.set {
                merged
                    .entry(key.clone())
                    .or_insert_with(|| Some(Arc::clone(value)));
            }
            for key in &batch.remove {
                merged.entry(key.clone()).or_insert(None);
            }
        }
        let subscribers: Vec<(KeyRange, usize, TupleWriteCallback)> = {
            let subs = self.subscribers.lock();
            subs.iter()
                .map(|s| (s.range.clone(), s.strip, Arc::clone(&s.callback)))
                .collect()
        };
        for (range, strip, callback) in subscribers {
            let mut batch = WriteBatch::default();
            for (key, value) in &merged {
                if !range.contains(key) {
                    continue;
                }
                match value {
                    Some(value) => batch.set.push((key.clone(), Arc::clone(value))),
                    None => batch.remove.push(key.clone()),
                }
            }
            if batch.is_empty() {
                continue;
            }
            let decoded = decode_write_batch(&batch, strip);
            if !decoded.set.is_empty() || !decoded.remove.is_empty() {
                callback(&decoded);
            }
        }
    }

    /// Discards all staged writes.
    pub fn cancel(&mut self) {
        self.closed = true;
        for participant in self.participants.values_mut() {
            participant.staged.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn decode_merged(
    merged: BTreeMap<EncodedKey, Arc<[u8]>>,
    strip: usize,
    reverse: bool,
) -> Result<Vec<(Vec<KeyElem>, Arc<[u8]>)>, TripleStoreError> {
    let mut out = Vec::with_capacity(merged.len());
    for (key, value) in merged {
        let elems = key.decode()?;
        if elems.len() < strip {
            return Err(TripleStoreError::Decode(
                "key shorter than subspace prefix".into(),
            ));
        }
        out.push((elems[strip..].to_vec(), value));
    }
    if reverse {
        out.reverse();
    }
    Ok(out)
}

fn decode_write_batch(batch: &WriteBatch, strip: usize) -> TupleWriteBatch {
    let mut decoded = TupleWriteBatch::default();
    for (key, value) in &batch.set {
        match key.decode() {
            Ok(elems) if elems.len() >= strip => {
                decoded.set.push((elems[strip..].to_vec(), Arc::clone(value)));
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "skipping undecodable subscribed key"),
        }
    }
    for key in &batch.remove {
        match key.decode() {
            Ok(elems) if elems.len() >= strip => decoded.remove.push(elems[strip..].to_vec()),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "skipping undecodable subscribed key"),
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::{MultiStore, StoreName};
    use crate::storage::memory::MemoryStore;
    use crate::storage::ScanArgs;
    use crate::tuple::KeyElem;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn text(s: &str) -> KeyElem {
        KeyElem::Text(s.into())
    }

    fn pair() -> MultiStore {
        let mut stores = BTreeMap::new();
        stores.insert(StoreName::from("outbox"), Arc::new(MemoryStore::new()));
        stores.insert(StoreName::from("primary"), Arc::new(MemoryStore::new()));
        MultiStore::new(stores)
    }

    fn value(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    #[test]
    fn writes_fan_out_to_every_scoped_store() {
        let multi = pair();
        let mut tx = multi.transact();
        tx.set(None, &[text("k")], value("v"));
        tx.commit().expect("commit");

        let primary_only = multi.with_scope(&["primary"]).expect("scope");
        let outbox_only = multi.with_scope(&["outbox"]).expect("scope");
        assert_eq!(primary_only.scan(&ScanArgs::default()).unwrap().len(), 1);
        assert_eq!(outbox_only.scan(&ScanArgs::default()).unwrap().len(), 1);
    }

    #[test]
    fn scoped_writes_skip_other_stores() {
        let multi = pair();
        let mut tx = multi.transact();
        let scope: BTreeSet<StoreName> = [StoreName::from("primary")].into_iter().collect();
        tx.set(Some(&scope), &[text("k")], value("v"));
        tx.commit().expect("commit");

        let outbox_only = multi.with_scope(&["outbox"]).expect("scope");
        assert!(outbox_only.scan(&ScanArgs::default()).unwrap().is_empty());
        let primary_only = multi.with_scope(&["primary"]).expect("scope");
        assert_eq!(primary_only.scan(&ScanArgs::default()).unwrap().len(), 1);
    }

    #[test]
    fn scan_merges_and_dedupes_across_stores() {
        let multi = pair();
        let mut tx = multi.transact();
        tx.set(None, &[text("both")], value("shared"));
        tx.commit().expect("commit");

        let mut tx = multi.transact_with(&["primary"]).expect("tx");
        tx.set(None, &[text("only-primary")], value("p"));
        tx.commit().expect("commit");

        let rows = multi.scan(&ScanArgs::default()).expect("scan");
        let keys: Vec<_> = rows.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![vec![text("both")], vec![text("only-primary")]]);
    }

    #[test]
    fn transactional_reads_see_staged_writes() {
        let multi = pair();
        let mut seed = multi.transact();
        seed.set(None, &[text("a")], value("1"));
        seed.commit().expect("commit");

        let mut tx = multi.transact();
        tx.set(None, &[text("b")], value("2"));
        tx.remove(None, &[text("a")]);
        let rows = tx.scan(None, &ScanArgs::default()).expect("scan");
        let keys: Vec<_> = rows.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![vec![text("b")]]);

        // Nothing visible outside until commit.
        assert_eq!(multi.scan(&ScanArgs::default()).unwrap().len(), 1);
        tx.commit().expect("commit");
        let keys: Vec<_> = multi
            .scan(&ScanArgs::default())
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![vec![text("b")]]);
    }

    #[test]
    fn concurrent_commit_conflicts_and_auto_transact_retries() {
        let multi = pair();
        let mut first = multi.transact();
        let mut second = multi.transact();
        first.set(None, &[text("a")], value("1"));
        second.set(None, &[text("b")], value("2"));
        first.commit().expect("first commit");
        let err = second.commit().expect_err("second commit conflicts");
        assert!(err.is_retryable());

        let attempts = Arc::new(Mutex::new(0usize));
        let attempts_in_body = Arc::clone(&attempts);
        let multi_in_body = multi.clone();
        multi
            .auto_transact(move |tx| {
                let mut attempts = attempts_in_body.lock();
                *attempts += 1;
                if *attempts == 1 {
                    // Interleave a competing commit so the first attempt conflicts.
                    let mut competitor = multi_in_body.transact();
                    competitor.set(None, &[text("competitor")], value("x"));
                    competitor.commit().expect("competitor commit");
                }
                tx.set(None, &[text("retried")], value("y"));
                Ok(())
            })
            .expect("auto transact");
        assert_eq!(*attempts.lock(), 2);
    }

    #[test]
    fn cancel_discards_staged_writes() {
        let multi = pair();
        let mut tx = multi.transact();
        tx.set(None, &[text("a")], value("1"));
        tx.cancel();
        assert!(multi.scan(&ScanArgs::default()).unwrap().is_empty());
        assert!(tx.commit().is_err());
    }

    #[test]
    fn subspace_prefixes_writes_and_strips_scan_results() {
        let multi = pair();
        let tenant_a = multi.subspace(&[text("tenant-a")]);
        let tenant_b = multi.subspace(&[text("tenant-b")]);

        let mut tx = tenant_a.transact();
        tx.set(None, &[text("k")], value("v"));
        tx.commit().expect("commit");

        let rows = tenant_a.scan(&ScanArgs::default()).expect("scan");
        assert_eq!(rows[0].0, vec![text("k")]);
        assert!(tenant_b.scan(&ScanArgs::default()).unwrap().is_empty());
    }

    #[test]
    fn subscription_delivers_after_commit_with_prefix_stripped() {
        let multi = pair().subspace(&[text("tenant")]);
        let seen: Arc<Mutex<Vec<Vec<KeyElem>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = Arc::clone(&seen);
        let handle = multi.subscribe(
            &ScanArgs::with_prefix(vec![text("watched")]),
            Arc::new(move |batch| {
                seen_in_cb
                    .lock()
                    .extend(batch.set.iter().map(|(k, _)| k.clone()));
            }),
        );

        let mut tx = multi.transact_with(&["primary"]).expect("tx");
        tx.set(None, &[text("watched"), text("k")], value("v"));
        tx.set(None, &[text("other"), text("k")], value("v"));
        assert!(seen.lock().is_empty(), "nothing delivered before commit");
        tx.commit().expect("commit");

        let seen_now = seen.lock().clone();
        assert_eq!(seen_now, vec![vec![text("watched"), text("k")]]);
        handle.unsubscribe();
    }
}
