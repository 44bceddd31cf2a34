use crate::clock::{Clock, Timestamp};
use crate::error::TripleStoreError;
use crate::index::{
    decode_meta, encode_meta, encode_metadata_value, index_keys, metadata_key, COLLECTION_ATTRIBUTE,
};
use crate::index::{eav_key, MetadataTuple, TripleRow};
use crate::scan::{self, Order, TimestampOp, TupleScanner, ValueRange};
use crate::storage::multi::{MultiTransaction, StoreName};
use crate::storage::ScanArgs;
use crate::store::{BeforeCommitHook, BeforeInsertHook, StoreMetrics};
use crate::tuple::{AttrPart, Attribute, KeyElem, Value};
use compact_str::CompactString;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Metadata writes applied by one operation, as seen by transaction-local
/// listeners.
#[derive(Debug, Clone, Default)]
pub struct MetadataChange {
    pub updates: Vec<MetadataTuple>,
    pub deletes: Vec<(CompactString, Option<Vec<AttrPart>>)>,
}

pub type MetadataCallback = Arc<dyn Fn(&MetadataChange) + Send + Sync>;

struct TxInner {
    multi: MultiTransaction,
    clock: Arc<dyn Clock>,
    timestamp: Option<Timestamp>,
    before_insert_hooks: Vec<Arc<dyn BeforeInsertHook>>,
    before_commit_hooks: Vec<Arc<dyn BeforeCommitHook>>,
    metadata_listeners: Vec<MetadataCallback>,
    metrics: Arc<StoreMetrics>,
}

/// One transaction over the multi-store: stages reads and writes, assigns the
/// transaction timestamp lazily on first need, runs hooks, and commits or
/// cancels atomically. Scoped views created by `with_scope` share this state.
#[derive(Clone)]
pub struct TripleTransaction {
    inner: Arc<Mutex<TxInner>>,
    scope: Option<BTreeSet<StoreName>>,
}

impl TupleScanner for TripleTransaction {
    fn scan_tuples(
        &self,
        args: &ScanArgs,
    ) -> Result<Vec<(Vec<KeyElem>, Arc<[u8]>)>, TripleStoreError> {
        self.inner.lock().multi.scan(self.scope.as_ref(), args)
    }
}

impl TripleTransaction {
    pub(crate) fn new(
        multi: MultiTransaction,
        clock: Arc<dyn Clock>,
        before_insert_hooks: Vec<Arc<dyn BeforeInsertHook>>,
        before_commit_hooks: Vec<Arc<dyn BeforeCommitHook>>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TxInner {
                multi,
                clock,
                timestamp: None,
                before_insert_hooks,
                before_commit_hooks,
                metadata_listeners: Vec::new(),
                metrics,
            })),
            scope: None,
        }
    }

    /// The transaction's timestamp, drawn from the clock on first call and
    /// shared by every timestamped write in this transaction (including
    /// scoped views).
    pub fn transaction_timestamp(&self) -> Timestamp {
        let mut inner = self.inner.lock();
        if inner.timestamp.is_none() {
            inner.timestamp = Some(inner.clock.next_timestamp());
        }
        inner.timestamp.clone().expect("timestamp just assigned")
    }

    /// Restricts backend operations to the named storages while sharing the
    /// parent transaction's staged state, timestamp and hooks.
    pub fn with_scope(&self, names: &[&str]) -> Result<TripleTransaction, TripleStoreError> {
        let mut scope = BTreeSet::new();
        {
            let inner = self.inner.lock();
            for name in names {
                if !inner.multi.contains_store(name) {
                    return Err(TripleStoreError::Options(format!(
                        "unknown storage '{name}' in transaction scope"
                    )));
                }
                scope.insert(StoreName::from(*name));
            }
        }
        Ok(Self {
            inner: Arc::clone(&self.inner),
            scope: Some(scope),
        })
    }

    pub fn before_insert(&self, hook: Arc<dyn BeforeInsertHook>) {
        self.inner.lock().before_insert_hooks.push(hook);
    }

    pub fn before_commit(&self, hook: Arc<dyn BeforeCommitHook>) {
        self.inner.lock().before_commit_hooks.push(hook);
    }

    pub fn on_metadata_change(&self, callback: impl Fn(&MetadataChange) + Send + Sync + 'static) {
        self.inner.lock().metadata_listeners.push(Arc::new(callback));
    }

    pub fn insert_triple(&self, row: TripleRow) -> Result<(), TripleStoreError> {
        self.insert_triples(vec![row])
    }

    /// Stages a batch of facts. Hooks run first and may veto the whole batch;
    /// re-inserting an existing fact with the same `expired` is a no-op,
    /// with a differing `expired` it rewrites all index families.
    pub fn insert_triples(&self, batch: Vec<TripleRow>) -> Result<(), TripleStoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let hooks = self.inner.lock().before_insert_hooks.clone();
        for hook in &hooks {
            hook.before_insert(&batch, self)?;
        }
        for row in &batch {
            if !row.value.is_well_formed() {
                return Err(TripleStoreError::InvalidValue(row.value.clone()));
            }
        }
        let mut written = 0u64;
        for row in &batch {
            let existing = self.scan_tuples(&ScanArgs::with_prefix(eav_key(row)))?;
            if existing.len() > 1 {
                return Err(TripleStoreError::Internal(format!(
                    "multiple tuples under one EAV key for entity '{}'",
                    row.id
                )));
            }
            if let Some((_, blob)) = existing.first() {
                if decode_meta(blob)? == row.expired {
                    continue;
                }
            }
            let blob = encode_meta(row.expired)?;
            let mut inner = self.inner.lock();
            for key in index_keys(row) {
                inner
                    .multi
                    .set(self.scope.as_ref(), &key, Arc::clone(&blob));
            }
            written += 1;
        }
        if written > 0 {
            self.inner.lock().metrics.add_facts_written(written);
        }
        Ok(())
    }

    pub fn delete_triple(&self, row: TripleRow) -> Result<(), TripleStoreError> {
        self.delete_triples(vec![row])
    }

    /// Removes every index key of each fact. Idempotent against the backend.
    pub fn delete_triples(&self, batch: Vec<TripleRow>) -> Result<(), TripleStoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        for row in &batch {
            for key in index_keys(row) {
                inner.multi.remove(self.scope.as_ref(), &key);
            }
        }
        inner.metrics.add_facts_deleted(batch.len() as u64);
        Ok(())
    }

    pub fn set_value(
        &self,
        entity: &str,
        attribute: Attribute,
        value: Value,
    ) -> Result<(), TripleStoreError> {
        self.set_values(vec![(entity.into(), attribute, value)])
    }

    /// Last-writer-wins staging: each update becomes a new fact at the
    /// transaction timestamp unless a strictly newer fact already exists for
    /// that entity-attribute.
    pub fn set_values(
        &self,
        updates: Vec<(CompactString, Attribute, Value)>,
    ) -> Result<(), TripleStoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let timestamp = self.transaction_timestamp();
        let mut rows = Vec::with_capacity(updates.len());
        for (entity, attribute, value) in updates {
            if !value.is_well_formed() {
                return Err(TripleStoreError::InvalidValue(value));
            }
            let existing =
                scan::find_by_eav(self, Some(entity.as_str()), Some(&attribute), None, Order::Asc)?;
            if existing.iter().any(|f| f.timestamp > timestamp) {
                debug!(%entity, "dropping stale value update");
                continue;
            }
            rows.push(TripleRow::new(
                entity,
                attribute,
                value,
                timestamp.clone(),
                false,
            ));
        }
        self.insert_triples(rows)
    }

    /// Tombstones the entity: one expired `_collection` fact per marker at
    /// the transaction timestamp survives, everything else is removed.
    pub fn expire_entity(&self, entity: &str) -> Result<(), TripleStoreError> {
        let timestamp = self.transaction_timestamp();
        let rows = scan::find_by_eav(self, Some(entity), None, None, Order::Asc)?;
        let marker = Attribute::from(vec![COLLECTION_ATTRIBUTE]);
        let mut tombstones: Vec<TripleRow> = Vec::new();
        for row in rows.iter().filter(|r| r.attribute == marker) {
            let tombstone = TripleRow::new(
                row.id.clone(),
                row.attribute.clone(),
                row.value.clone(),
                timestamp.clone(),
                true,
            );
            if !tombstones.contains(&tombstone) {
                tombstones.push(tombstone);
            }
        }
        // A pre-existing marker at the transaction timestamp shares its key
        // with the staged tombstone; deleting it would erase the tombstone.
        let doomed: Vec<TripleRow> = rows
            .into_iter()
            .filter(|row| {
                !tombstones.iter().any(|t| {
                    t.attribute == row.attribute
                        && t.value == row.value
                        && t.timestamp == row.timestamp
                })
            })
            .collect();
        self.insert_triples(tombstones)?;
        self.delete_triples(doomed)
    }

    /// Expires individual attributes: existing facts for each pair are
    /// removed and replaced by one expired null fact at the transaction
    /// timestamp.
    pub fn expire_entity_attributes(
        &self,
        pairs: Vec<(CompactString, Attribute)>,
    ) -> Result<(), TripleStoreError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let timestamp = self.transaction_timestamp();
        for (entity, attribute) in &pairs {
            let existing =
                scan::find_by_eav(self, Some(entity.as_str()), Some(attribute), None, Order::Asc)?;
            self.delete_triples(existing)?;
        }
        let rows = pairs
            .into_iter()
            .map(|(entity, attribute)| {
                TripleRow::new(entity, attribute, Value::Null, timestamp.clone(), true)
            })
            .collect();
        self.insert_triples(rows)
    }

    pub fn read_metadata_tuples(
        &self,
        entity: &str,
        attribute_prefix: &[AttrPart],
    ) -> Result<Vec<MetadataTuple>, TripleStoreError> {
        scan::read_metadata_tuples(self, entity, attribute_prefix)
    }

    pub fn update_metadata_tuples(
        &self,
        tuples: Vec<MetadataTuple>,
    ) -> Result<(), TripleStoreError> {
        if tuples.is_empty() {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock();
            for tuple in &tuples {
                let key = metadata_key(&tuple.entity, &tuple.attribute);
                let blob = encode_metadata_value(&tuple.value)?;
                inner.multi.set(self.scope.as_ref(), &key, blob);
            }
        }
        self.notify_metadata(MetadataChange {
            updates: tuples,
            deletes: Vec::new(),
        });
        Ok(())
    }

    /// Deletes metadata tuples by exact attribute or, with `None`, every
    /// tuple of the entity. Attribute arguments delete by prefix.
    pub fn delete_metadata_tuples(
        &self,
        deletes: Vec<(CompactString, Option<Vec<AttrPart>>)>,
    ) -> Result<(), TripleStoreError> {
        if deletes.is_empty() {
            return Ok(());
        }
        for (entity, attribute) in &deletes {
            let prefix = attribute.as_deref().unwrap_or(&[]);
            let found = self.scan_tuples(&scan::metadata_scan(entity, prefix))?;
            let mut inner = self.inner.lock();
            for (tuple, _) in found {
                inner.multi.remove(self.scope.as_ref(), &tuple);
            }
        }
        self.notify_metadata(MetadataChange {
            updates: Vec::new(),
            deletes,
        });
        Ok(())
    }

    fn notify_metadata(&self, change: MetadataChange) {
        let listeners = self.inner.lock().metadata_listeners.clone();
        for listener in listeners {
            listener(&change);
        }
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

    pub fn is_entity_expired(&self, entity: &str) -> Result<bool, TripleStoreError> {
        scan::is_entity_expired(self, entity)
    }

    /// Runs before-commit hooks, then flushes the underlying multi-store
    /// transaction.
    pub fn commit(&self) -> Result<(), TripleStoreError> {
        let hooks = self.inner.lock().before_commit_hooks.clone();
        for hook in &hooks {
            hook.before_commit(self)?;
        }
        let mut inner = self.inner.lock();
        inner.multi.commit()?;
        inner.metrics.record_commit();
        Ok(())
    }

    /// Discards all staged writes.
    pub fn cancel(&self) {
        self.inner.lock().multi.cancel();
    }
}
