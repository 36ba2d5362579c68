//! Persistit storage engine
//!
//! An embedded, transactional, B-Tree key-value storage engine providing
//! durable, crash-recoverable storage of sorted key-value pairs over paged
//! volume files, with snapshot-isolated multi-version concurrency control.
//!
//! ## Architecture
//! - Transaction layer: sharded transaction index, visibility oracle,
//!   SUM/MIN/MAX/SEQ accumulators
//! - Volume layer: self-describing paged files, on-demand extension,
//!   journal-first page I/O
//! - Tree layer: split-policy-driven B-Trees navigated through cursors
//!   (`Exchange`), order-preserving key encoding, multi-version value
//!   cells, range-delete tombstones
//! - Class index: compact integer handles for application class
//!   identities, persisted in a reserved tree

pub mod buffer;
pub mod class_index;
pub mod config;
pub mod engine;
pub mod journal;
pub mod timestamp;
pub mod tree;
pub mod txn;
pub mod volume;

mod error;

pub use class_index::{ClassDescriptor, ClassIndex, ClassInfo, ClassResolver};
pub use config::EngineConfig;
pub use engine::Persistit;
pub use error::{PersistitError, Result};
pub use journal::{FileJournal, JournalManager, MemoryJournal};
pub use timestamp::TimestampAllocator;
pub use tree::{Exchange, Key, SplitPolicy, Tree};
pub use txn::{Accumulator, AccumulatorType, Transaction, TransactionIndex, TransactionStatus};
pub use volume::{Volume, VolumeSpecification};
