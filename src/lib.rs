pub mod clock;
pub mod error;
pub mod index;
pub mod scan;
pub mod storage;
pub mod store;
pub mod transaction;
pub mod tuple;

pub use crate::clock::{Clock, MemoryClock, Timestamp};
pub use crate::error::{TripleStoreError, TripleStoreErrorCode};
pub use crate::index::{IndexFamily, MetadataTuple, TripleRow, COLLECTION_ATTRIBUTE};
pub use crate::scan::{Order, TimestampOp, ValueCursor, ValueRange};
pub use crate::storage::memory::{MemoryStore, WriteBatch};
pub use crate::storage::multi::{
    MultiStore, MultiTransaction, StoreName, SubscriptionHandle, TupleWriteBatch,
};
pub use crate::storage::{KeyRange, ScanArgs};
pub use crate::store::{
    BeforeCommitHook, BeforeInsertHook, MetricsSnapshot, StorageConfig, StoreMetrics, TripleStore,
    TripleStoreOptions, WriteEvent,
};
pub use crate::transaction::{MetadataChange, TripleTransaction};
pub use crate::tuple::{AttrPart, Attribute, KeyElem, Value};
