//! mrgc-state — the global state store.
//!
//! Each region's control plane writes to a local [redb](https://docs.rs/redb)
//! replica; replication between regions is external and arrives through
//! [`StateStore::merge_replicated`] with last-writer-wins semantics.
//!
//! # Architecture
//!
//! Records are JSON-serialized into `&[u8]` value columns wrapped in a
//! [`Stored`] envelope (write time, expiry, origin region). Every record type
//! implements [`Record`], which names its tables, primary key, secondary
//! index entries and TTL. Index tables use composite keys
//! `{index}\x1f{partition}\x1f{sort:020}\x1f{primary}` so a partition scan
//! is a single ordered range read.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod record;
pub mod retry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use record::{IndexEntry, Record, RecordMeta, Stored, TtlPolicy, index, metric_partition};
pub use retry::{RetryPolicy, Transient, retry};
pub use store::{Query, StateStore};
pub use types::*;
