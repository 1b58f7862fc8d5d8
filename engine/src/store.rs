//! Per-table store facade.
//!
//! A [`Store`] binds a schema, a B+ tree over a page cache, a WAL writer,
//! a reader/writer lock, and a periodic checkpoint task. All mutations are
//! serialized by the write lock and made durable in the WAL before they
//! touch the tree; reads share the read lock and never touch the WAL.
//!
//! # Usage
//!
//! ```ignore
//! let schema = Schema::new("people", vec![
//!     Field::new("id", FieldType::Int),
//!     Field::new("name", FieldType::Str),
//! ])?;
//! let store = Store::create(&path, schema, StoreOptions::default()).await?;
//! store.insert(&[Value::Int(1), Value::Str("alice".into())]).await?;
//! let row = store.find(&Value::Int(1)).await?;
//! store.close().await?;
//! ```
//!
//! Dropping a store without [`Store::close`] loses no committed data (the
//! WAL already holds every mutation) but leaves replay work for the next
//! open.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

use crate::cache::{CacheError, CacheStats, DEFAULT_CACHE_CAPACITY, PageCache};
use crate::checkpoint::{self, CheckpointConfig};
use crate::recovery::{self, RecoveryReport};
use crate::schema::{Schema, SchemaError, Value};
use crate::tree::{BPlusTree, TreeError};
use crate::wal::{self, WalError, WalHandle, WalPayload};

/// Tuning knobs for a store.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Page cache capacity in frames.
    pub cache_capacity: usize,
    /// Automatic checkpoint scheduling.
    pub checkpoint: CheckpointConfig,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            checkpoint: CheckpointConfig::default(),
        }
    }
}

/// Shared state between the facade and its background tasks.
pub(crate) struct StoreInner {
    schema: Schema,
    cache: Arc<PageCache>,
    tree: RwLock<BPlusTree>,
    wal: WalHandle,
}

impl StoreInner {
    /// Checkpoint protocol: under the write lock, log a CHECKPOINT record,
    /// flush every dirty page and the header, then truncate the WAL.
    pub(crate) async fn run_checkpoint(&self) -> Result<(), StoreError> {
        let _tree = self.tree.write().await;
        let stats = self.cache.stats();
        self.wal
            .append(vec![WalPayload::Checkpoint {
                root_page: stats.root_page,
                next_page_id: stats.next_page_id,
            }])
            .await?;
        self.cache.flush_all()?;
        self.wal.truncate().await?;
        tracing::debug!(
            root = stats.root_page,
            pages = stats.num_pages,
            "checkpoint complete"
        );
        Ok(())
    }
}

/// Background task handles, taken once at close.
struct StoreTasks {
    checkpointer: Option<JoinHandle<()>>,
    wal_writer: JoinHandle<()>,
}

/// A single open table.
///
/// Only one live store per table file may exist in a process; the
/// [`registry`](crate::registry) enforces this for callers that go
/// through it.
pub struct Store {
    inner: Arc<StoreInner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Option<StoreTasks>>,
}

impl Store {
    /// Create a new table at `path` (the matching `.wal` file lives next
    /// to it). Fails if the file already exists.
    pub async fn create(
        path: &Path,
        schema: Schema,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let cache = PageCache::create(path, schema.clone(), options.cache_capacity)?;
        let tree = BPlusTree::new(Arc::clone(&cache))?;
        Self::assemble(schema, cache, tree, path, options)
    }

    /// Open an existing table, replaying the WAL if the last shutdown was
    /// not clean. After a replay the store checkpoints immediately, so the
    /// WAL is empty once `open` returns.
    pub async fn open(path: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        let cache = PageCache::open(path, options.cache_capacity)?;
        let schema = cache.schema();
        let tree = BPlusTree::new(Arc::clone(&cache))?;
        let store = Self::assemble(schema, cache, tree, path, options)?;

        let report = store.recover().await?;
        if report.records_scanned > 0 {
            store.inner.run_checkpoint().await?;
            tracing::info!(
                table = store.inner.schema.table(),
                scanned = report.records_scanned,
                applied = report.inserts_applied + report.deletes_applied,
                redundant = report.redundant,
                "recovered table from write-ahead log"
            );
        }
        Ok(store)
    }

    /// Open `path` if it exists, else create it. An existing table's
    /// stored schema must match `schema`.
    pub async fn open_or_create(
        path: &Path,
        schema: Schema,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        if path.exists() {
            let store = Self::open(path, options).await?;
            if *store.schema() != schema {
                store.close().await?;
                return Err(StoreError::SchemaMismatch {
                    table: schema.table().to_owned(),
                });
            }
            Ok(store)
        } else {
            Self::create(path, schema, options).await
        }
    }

    fn assemble(
        schema: Schema,
        cache: Arc<PageCache>,
        tree: BPlusTree,
        path: &Path,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let wal_path = path.with_extension("wal");
        let (wal, wal_writer) = wal::spawn_writer(&wal_path)?;

        let inner = Arc::new(StoreInner {
            schema,
            cache,
            tree: RwLock::new(tree),
            wal,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let checkpointer = if options.checkpoint.is_disabled() {
            None
        } else {
            Some(checkpoint::spawn_checkpointer(
                Arc::downgrade(&inner),
                options.checkpoint.interval,
                shutdown_rx,
            ))
        };

        Ok(Self {
            inner,
            shutdown,
            tasks: Mutex::new(Some(StoreTasks {
                checkpointer,
                wal_writer,
            })),
        })
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Allocator and cache counters for this table.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    fn key_of(&self, key: &Value) -> Result<u64, StoreError> {
        let field = self.inner.schema.key_field();
        if !key.matches(field.ftype) {
            return Err(StoreError::Schema(SchemaError::TypeMismatch {
                field: field.name.as_str().to_owned(),
                expected: field.ftype,
            }));
        }
        Ok(key.key_u64())
    }

    // ------------------------------------------------------------------
    // Mutations (write lock, WAL first)
    // ------------------------------------------------------------------

    /// Insert one record. The first value is the primary key; inserting an
    /// existing key fails with `DuplicateKey`.
    pub async fn insert(&self, values: &[Value]) -> Result<(), StoreError> {
        let key = self.inner.schema.primary_key(values)?;
        let bytes = self.inner.schema.encode_record(values)?;

        let mut tree = self.inner.tree.write().await;
        self.inner
            .wal
            .append(vec![WalPayload::Insert {
                key,
                record: bytes.clone(),
            }])
            .await?;
        tree.insert(key, &bytes)?;
        Ok(())
    }

    /// Insert many records with a single WAL write and fsync. Records are
    /// applied in order; on the first tree error the earlier records of
    /// the batch remain applied (and all of them are in the log, which
    /// replay tolerates).
    pub async fn insert_many(&self, rows: &[Vec<Value>]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::with_capacity(rows.len());
        let mut payloads = Vec::with_capacity(rows.len());
        for values in rows {
            let key = self.inner.schema.primary_key(values)?;
            let bytes = self.inner.schema.encode_record(values)?;
            payloads.push(WalPayload::Insert {
                key,
                record: bytes.clone(),
            });
            encoded.push((key, bytes));
        }

        let mut tree = self.inner.tree.write().await;
        self.inner.wal.append(payloads).await?;
        for (key, bytes) in &encoded {
            tree.insert(*key, bytes)?;
        }
        Ok(())
    }

    /// Delete the record whose primary key equals `key`.
    pub async fn delete(&self, key: &Value) -> Result<(), StoreError> {
        let key = self.key_of(key)?;

        let mut tree = self.inner.tree.write().await;
        self.inner
            .wal
            .append(vec![WalPayload::Delete { key }])
            .await?;
        tree.delete(key)?;
        Ok(())
    }

    /// Delete many records with a single WAL write and fsync.
    pub async fn delete_many(&self, keys: &[Value]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut raw_keys = Vec::with_capacity(keys.len());
        for key in keys {
            raw_keys.push(self.key_of(key)?);
        }
        let payloads = raw_keys
            .iter()
            .map(|&key| WalPayload::Delete { key })
            .collect();

        let mut tree = self.inner.tree.write().await;
        self.inner.wal.append(payloads).await?;
        for key in raw_keys {
            tree.delete(key)?;
        }
        Ok(())
    }

    /// Rebuild the table as a dense tree, dropping tombstones and freed
    /// pages. Content is preserved exactly.
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        let mut tree = self.inner.tree.write().await;
        let stats = self.inner.cache.stats();
        self.inner
            .wal
            .append(vec![WalPayload::Vacuum {
                root_page: stats.root_page,
                next_page_id: stats.next_page_id,
            }])
            .await?;
        tree.vacuum()?;
        Ok(())
    }

    /// Run a checkpoint now.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        self.inner.run_checkpoint().await
    }

    // ------------------------------------------------------------------
    // Reads (read lock, no WAL)
    // ------------------------------------------------------------------

    /// Look up one record by primary key.
    pub async fn find(&self, key: &Value) -> Result<Vec<Value>, StoreError> {
        let key = self.key_of(key)?;
        let tree = self.inner.tree.read().await;
        let bytes = tree.search(key)?;
        Ok(self.inner.schema.decode_record(&bytes)?)
    }

    /// All records with tree keys in `[start, end]`, in key order.
    pub async fn range_scan(&self, start: u64, end: u64) -> Result<Vec<Vec<Value>>, StoreError> {
        let tree = self.inner.tree.read().await;
        let raw = tree.range_scan(start, end)?;
        raw.into_iter()
            .map(|(_, bytes)| Ok(self.inner.schema.decode_record(&bytes)?))
            .collect()
    }

    /// Every record in the table, in key order.
    pub async fn scan_all(&self) -> Result<Vec<Vec<Value>>, StoreError> {
        self.range_scan(0, u64::MAX).await
    }

    /// Number of live records.
    pub async fn count(&self) -> Result<usize, StoreError> {
        let tree = self.inner.tree.read().await;
        Ok(tree.count()?)
    }

    // ------------------------------------------------------------------
    // Recovery and shutdown
    // ------------------------------------------------------------------

    /// Replay the WAL into the tree. Records whose effects are already in
    /// the data file count as redundant, not as errors.
    pub async fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let records = wal::read_log(self.inner.wal.path())?;
        let mut tree = self.inner.tree.write().await;
        Ok(recovery::replay(&mut tree, &records)?)
    }

    /// Controlled shutdown: stop the checkpointer, run a final checkpoint,
    /// flush the cache, and stop the WAL writer. Idempotent.
    pub async fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.tasks.lock().await;
        let Some(tasks) = guard.take() else {
            return Ok(());
        };

        let _ = self.shutdown.send(true);
        if let Some(checkpointer) = tasks.checkpointer {
            let _ = checkpointer.await;
        }

        self.inner.run_checkpoint().await?;
        self.inner.cache.close()?;

        self.inner.wal.shutdown().await?;
        let _ = tasks.wal_writer.await;
        Ok(())
    }
}

/// Errors surfaced by the store.
#[derive(Debug)]
pub enum StoreError {
    /// Point lookup or delete on an absent key.
    NotFound(u64),
    /// Insert of a key that is already present.
    DuplicateKey(u64),
    /// An existing table's stored schema differs from the requested one.
    SchemaMismatch { table: String },
    /// Record or schema (de)serialization failure.
    Schema(SchemaError),
    /// Tree failure (including corruption).
    Tree(TreeError),
    /// WAL failure.
    Wal(WalError),
    /// Cache, allocator, or file failure.
    Cache(CacheError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "key not found: {key}"),
            Self::DuplicateKey(key) => write!(f, "duplicate key: {key}"),
            Self::SchemaMismatch { table } => {
                write!(f, "stored schema for table '{table}' does not match")
            }
            Self::Schema(e) => write!(f, "schema error: {e}"),
            Self::Tree(e) => write!(f, "tree error: {e}"),
            Self::Wal(e) => write!(f, "WAL error: {e}"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Schema(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::Wal(e) => Some(e),
            Self::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TreeError> for StoreError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::NotFound(key) => Self::NotFound(key),
            TreeError::DuplicateKey(key) => Self::DuplicateKey(key),
            other => Self::Tree(other),
        }
    }
}

impl From<SchemaError> for StoreError {
    fn from(e: SchemaError) -> Self {
        Self::Schema(e)
    }
}

impl From<WalError> for StoreError {
    fn from(e: WalError) -> Self {
        Self::Wal(e)
    }
}

impl From<CacheError> for StoreError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}
