#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
//! A single-node, disk-backed, schema-aware ordered key/value store.
//!
//! Tables are described by an ordered list of typed fields; the first
//! field is the primary key. Records live in a B+ tree of 4096-byte
//! slotted pages behind a pinning, clock-evicting page cache, and every
//! mutation is made durable in a write-ahead log before it touches a
//! page. Background checkpointing bounds the log; crash recovery replays
//! it.
//!
//! Layers, leaves first: binary codecs, schemas, slotted pages, the table
//! file, the page cache (which owns the table header and the free-page
//! allocator), the tree, the WAL, checkpointing, recovery, the per-table
//! store facade, and a process-wide registry.

pub mod cache;
pub mod checkpoint;
pub mod codec;
pub mod file;
pub mod header;
pub mod page;
pub mod recovery;
pub mod registry;
pub mod schema;
pub mod store;
pub mod tree;
pub mod wal;

pub use cache::{CacheStats, PageCache};
pub use checkpoint::CheckpointConfig;
pub use recovery::RecoveryReport;
pub use registry::StoreRegistry;
pub use schema::{Field, FieldType, Schema, Value};
pub use store::{Store, StoreError, StoreOptions};
pub use tree::BPlusTree;
