use crate::clock::{Clock, MemoryClock, Timestamp};
use crate::error::TripleStoreError;
use crate::index::{decode_fact, decode_meta, IndexFamily, MetadataTuple, TripleRow};
use crate::scan::{self, Order, TimestampOp, TupleScanner, ValueRange};
use crate::storage::memory::MemoryStore;
use crate::storage::multi::{
    MultiStore, StoreName, SubscriptionHandle, TupleWriteBatch, MAX_COMMIT_ATTEMPTS,
};
use crate::storage::ScanArgs;
use crate::transaction::TripleTransaction;
use crate::tuple::{AttrPart, Attribute, KeyElem, Value};
use compact_str::CompactString;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hook invoked with each incoming batch and the active transaction before
/// any index is touched; an error vetoes the whole batch.
pub trait BeforeInsertHook: Send + Sync {
    fn before_insert(
        &self,
        batch: &[TripleRow],
        tx: &TripleTransaction,
    ) -> Result<(), TripleStoreError>;
}

impl<F> BeforeInsertHook for F
where
    F: Fn(&[TripleRow], &TripleTransaction) -> Result<(), TripleStoreError> + Send + Sync,
{
    fn before_insert(
        &self,
        batch: &[TripleRow],
        tx: &TripleTransaction,
    ) -> Result<(), TripleStoreError> {
        self(batch, tx)
    }
}

/// Hook invoked at the start of commit; an error aborts the commit.
pub trait BeforeCommitHook: Send + Sync {
    fn before_commit(&self, tx: &TripleTransaction) -> Result<(), TripleStoreError>;
}

impl<F> BeforeCommitHook for F
where
    F: Fn(&TripleTransaction) -> Result<(), TripleStoreError> + Send + Sync,
{
    fn before_commit(&self, tx: &TripleTransaction) -> Result<(), TripleStoreError> {
        self(tx)
    }
}

#[derive(Debug, Default)]
pub struct StoreMetrics {
    commits_total: AtomicU64,
    conflict_retries: AtomicU64,
    facts_written: AtomicU64,
    facts_deleted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub commits_total: u64,
    pub conflict_retries: u64,
    pub facts_written: u64,
    pub facts_deleted: u64,
}

impl StoreMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits_total: self.commits_total.load(Ordering::Relaxed),
            conflict_retries: self.conflict_retries.load(Ordering::Relaxed),
            facts_written: self.facts_written.load(Ordering::Relaxed),
            facts_deleted: self.facts_deleted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict_retry(&self) {
        self.conflict_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_facts_written(&self, count: u64) {
        self.facts_written.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_facts_deleted(&self, count: u64) {
        self.facts_deleted.fetch_add(count, Ordering::Relaxed);
    }
}

/// Backend supplied at construction: one store, or several under names.
pub enum StorageConfig {
    Single(Arc<MemoryStore>),
    Named(BTreeMap<StoreName, Arc<MemoryStore>>),
}

/// Construction options. Exactly one of `storage`/`stores` must be supplied.
pub struct TripleStoreOptions {
    pub storage: Option<StorageConfig>,
    pub stores: Option<BTreeMap<StoreName, Arc<MemoryStore>>>,
    pub tenant_id: CompactString,
    pub storage_scope: Option<Vec<CompactString>>,
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for TripleStoreOptions {
    fn default() -> Self {
        Self {
            storage: None,
            stores: None,
            tenant_id: CompactString::from("client"),
            storage_scope: None,
            clock: None,
        }
    }
}

impl TripleStoreOptions {
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_single_storage(self, store: Arc<MemoryStore>) -> Self {
        self.with_storage(StorageConfig::Single(store))
    }

    pub fn with_stores(mut self, stores: BTreeMap<StoreName, Arc<MemoryStore>>) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<CompactString>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_storage_scope<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        self.storage_scope = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// Inserts and deletes of one committed write batch, decoded to rows.
/// Deleted rows carry `expired = false` because the erased value is
/// unavailable; consumers must not rely on that flag.
#[derive(Debug, Clone, Default)]
pub struct WriteEvent {
    pub inserts: Vec<TripleRow>,
    pub deletes: Vec<TripleRow>,
}

/// Public entry point: reads run against the committed multi-store state,
/// every mutation runs inside a transaction, hooks and the clock live here.
#[derive(Clone)]
pub struct TripleStore {
    multi: MultiStore,
    clock: Arc<dyn Clock>,
    before_insert_hooks: Arc<Mutex<Vec<Arc<dyn BeforeInsertHook>>>>,
    before_commit_hooks: Arc<Mutex<Vec<Arc<dyn BeforeCommitHook>>>>,
    metrics: Arc<StoreMetrics>,
}

impl std::fmt::Debug for TripleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripleStore").finish_non_exhaustive()
    }
}

impl TupleScanner for TripleStore {
    fn scan_tuples(
        &self,
        args: &ScanArgs,
    ) -> Result<Vec<(Vec<KeyElem>, Arc<[u8]>)>, TripleStoreError> {
        self.multi.scan(args)
    }
}

impl TripleStore {
    pub fn open(options: TripleStoreOptions) -> Result<Self, TripleStoreError> {
        let stores = match (options.storage, options.stores) {
            (Some(storage), None) => match storage {
                StorageConfig::Single(store) => {
                    let mut stores = BTreeMap::new();
                    stores.insert(StoreName::from("default"), store);
                    stores
                }
                StorageConfig::Named(stores) => stores,
            },
            (None, Some(stores)) => stores,
            (Some(_), Some(_)) => {
                return Err(TripleStoreError::Options(
                    "supply exactly one of 'storage' or 'stores', not both".into(),
                ))
            }
            (None, None) => {
                return Err(TripleStoreError::Options(
                    "supply one of 'storage' or 'stores'".into(),
                ))
            }
        };
        if stores.is_empty() {
            return Err(TripleStoreError::Options(
                "at least one storage is required".into(),
            ));
        }

        let mut multi =
            MultiStore::new(stores).subspace(&[KeyElem::Text(options.tenant_id.clone())]);
        if let Some(scope) = &options.storage_scope {
            let names: Vec<&str> = scope.iter().map(|s| s.as_str()).collect();
            multi = multi.with_scope(&names)?;
        }
        let clock = options
            .clock
            .unwrap_or_else(|| Arc::new(MemoryClock::with_random_client()) as Arc<dyn Clock>);

        let store = Self {
            multi,
            clock,
            before_insert_hooks: Arc::new(Mutex::new(Vec::new())),
            before_commit_hooks: Arc::new(Mutex::new(Vec::new())),
            metrics: Arc::new(StoreMetrics::default()),
        };
        let client_id = store.clock.client_id();
        let max_seen = store.find_max_timestamp(&client_id)?;
        store.clock.initialize(max_seen);
        Ok(store)
    }

    pub fn client_id(&self) -> CompactString {
        self.clock.client_id()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// A logically identical store restricted to the named storages; shares
    /// hooks, clock and metrics with the parent.
    pub fn set_storage_scope(&self, names: &[&str]) -> Result<TripleStore, TripleStoreError> {
        Ok(Self {
            multi: self.multi.with_scope(names)?,
            clock: Arc::clone(&self.clock),
            before_insert_hooks: Arc::clone(&self.before_insert_hooks),
            before_commit_hooks: Arc::clone(&self.before_commit_hooks),
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Opens a transaction, runs `body`, commits. A write-rule error from the
    /// body cancels the transaction and surfaces; a commit conflict re-runs
    /// the whole body against fresh snapshots.
    pub fn transact<T>(
        &self,
        mut body: impl FnMut(&TripleTransaction) -> Result<T, TripleStoreError>,
    ) -> Result<T, TripleStoreError> {
        let mut attempt = 1;
        loop {
            let tx = self.begin_transaction();
            match body(&tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(err) if err.is_retryable() && attempt < MAX_COMMIT_ATTEMPTS => {
                        self.metrics.record_conflict_retry();
                        warn!(attempt, error = %err, "retrying conflicted transaction");
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    if matches!(err, TripleStoreError::WriteRule(_)) {
                        tx.cancel();
                    }
                    return Err(err);
                }
            }
        }
    }

    fn begin_transaction(&self) -> TripleTransaction {
        TripleTransaction::new(
            self.multi.transact(),
            Arc::clone(&self.clock),
            self.before_insert_hooks.lock().clone(),
            self.before_commit_hooks.lock().clone(),
            Arc::clone(&self.metrics),
        )
    }

    pub fn before_insert(&self, hook: Arc<dyn BeforeInsertHook>) {
        self.before_insert_hooks.lock().push(hook);
    }

    pub fn before_commit(&self, hook: Arc<dyn BeforeCommitHook>) {
        self.before_commit_hooks.lock().push(hook);
    }

    /// Subscribes to decoded fact inserts, delivered strictly after commit in
    /// commit order.
    pub fn on_insert(
        &self,
        callback: impl Fn(&TripleRow) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.multi.subscribe(
            &ScanArgs::with_prefix(vec![IndexFamily::Eav.key_elem()]),
            Arc::new(move |batch: &TupleWriteBatch| {
                for (tuple, blob) in &batch.set {
                    match decode_meta(blob).and_then(|expired| decode_fact(tuple, expired)) {
                        Ok(row) => callback(&row),
                        Err(err) => debug!(error = %err, "skipping undecodable insert"),
                    }
                }
            }),
        )
    }

    /// Subscribes to both inserts and deletes of facts.
    pub fn on_write(
        &self,
        callback: impl Fn(&WriteEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.multi.subscribe(
            &ScanArgs::with_prefix(vec![IndexFamily::Eav.key_elem()]),
            Arc::new(move |batch: &TupleWriteBatch| {
                let mut event = WriteEvent::default();
                for (tuple, blob) in &batch.set {
                    match decode_meta(blob).and_then(|expired| decode_fact(tuple, expired)) {
                        Ok(row) => event.inserts.push(row),
                        Err(err) => debug!(error = %err, "skipping undecodable insert"),
                    }
                }
                for tuple in &batch.remove {
                    match decode_fact(tuple, false) {
                        Ok(row) => event.deletes.push(row),
                        Err(err) => debug!(error = %err, "skipping undecodable delete"),
                    }
                }
                if !event.inserts.is_empty() || !event.deletes.is_empty() {
                    callback(&event);
                }
            }),
        )
    }

    /// Drops all data in every scoped backend.
    pub fn clear(&self) {
        self.multi.clear();
        info!("cleared triple store");
    }

    pub fn insert_triple(&self, row: TripleRow) -> Result<(), TripleStoreError> {
        self.insert_triples(vec![row])
    }

    pub fn insert_triples(&self, rows: Vec<TripleRow>) -> Result<(), TripleStoreError> {
        self.transact(|tx| tx.insert_triples(rows.clone()))
    }

    pub fn delete_triple(&self, row: TripleRow) -> Result<(), TripleStoreError> {
        self.delete_triples(vec![row])
    }

    pub fn delete_triples(&self, rows: Vec<TripleRow>) -> Result<(), TripleStoreError> {
        self.transact(|tx| tx.delete_triples(rows.clone()))
    }

    pub fn set_value(
        &self,
        entity: &str,
        attribute: Attribute,
        value: Value,
    ) -> Result<(), TripleStoreError> {
        self.transact(|tx| tx.set_value(entity, attribute.clone(), value.clone()))
    }

    pub fn set_values(
        &self,
        updates: Vec<(CompactString, Attribute, Value)>,
    ) -> Result<(), TripleStoreError> {
        self.transact(|tx| tx.set_values(updates.clone()))
    }

    pub fn expire_entity(&self, entity: &str) -> Result<(), TripleStoreError> {
        self.transact(|tx| tx.expire_entity(entity))
    }

    pub fn expire_entity_attributes(
        &self,
        pairs: Vec<(CompactString, Attribute)>,
    ) -> Result<(), TripleStoreError> {
        self.transact(|tx| tx.expire_entity_attributes(pairs.clone()))
    }

    pub fn update_metadata_tuples(
        &self,
        tuples: Vec<MetadataTuple>,
    ) -> Result<(), TripleStoreError> {
        self.transact(|tx| tx.update_metadata_tuples(tuples.clone()))
    }

    pub fn delete_metadata_tuples(
        &self,
        deletes: Vec<(CompactString, Option<Vec<AttrPart>>)>,
    ) -> Result<(), TripleStoreError> {
        self.transact(|tx| tx.delete_metadata_tuples(deletes.clone()))
    }

    pub fn find_by_collection(
        &self,
        collection: &str,
        order: Order,
    ) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_collection(self, collection, order)
    }

    pub fn find_by_eav(
        &self,
        entity: Option<&str>,
        attribute: Option<&Attribute>,
        value: Option<&Value>,
        order: Order,
    ) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_eav(self, entity, attribute, value, order)
    }

    pub fn find_by_entity(&self, entity: &str) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_eav(self, Some(entity), None, None, Order::Asc)
    }

    pub fn find_by_entity_attribute(
        &self,
        entity: &str,
        attribute: &Attribute,
    ) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_eav(self, Some(entity), Some(attribute), None, Order::Asc)
    }

    pub fn find_by_ave(
        &self,
        attribute: Option<&Attribute>,
        value: Option<&Value>,
        entity: Option<&str>,
        order: Order,
    ) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_ave(self, attribute, value, entity, order)
    }

    pub fn find_by_attribute(
        &self,
        attribute: &Attribute,
    ) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_ave(self, Some(attribute), None, None, Order::Asc)
    }

    pub fn find_by_vae(
        &self,
        value: Option<&Value>,
        attribute: Option<&Attribute>,
        entity: Option<&str>,
        order: Order,
    ) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_vae(self, value, attribute, entity, order)
    }

    pub fn find_by_value(&self, value: &Value) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_vae(self, Some(value), None, None, Order::Asc)
    }

    pub fn find_values_in_range(
        &self,
        attribute: &Attribute,
        range: &ValueRange,
    ) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_values_in_range(self, attribute, range)
    }

    pub fn find_by_client_timestamp(
        &self,
        client_id: &str,
        op: TimestampOp,
        timestamp: Option<&Timestamp>,
    ) -> Result<Vec<TripleRow>, TripleStoreError> {
        scan::find_by_client_timestamp(self, client_id, op, timestamp)
    }

    pub fn find_max_timestamp(
        &self,
        client_id: &str,
    ) -> Result<Option<Timestamp>, TripleStoreError> {
        scan::find_max_timestamp(self, client_id)
    }

    pub fn read_metadata_tuples(
        &self,
        entity: &str,
        attribute_prefix: &[AttrPart],
    ) -> Result<Vec<MetadataTuple>, TripleStoreError> {
        scan::read_metadata_tuples(self, entity, attribute_prefix)
    }

    pub fn is_entity_expired(&self, entity: &str) -> Result<bool, TripleStoreError> {
        scan::is_entity_expired(self, entity)
    }
}
