//! Registry of open tables, keyed by table name.
//!
//! Exactly one live [`Store`] per table file is permitted in a process;
//! the registry enforces this by handing every caller the same shared
//! instance. Table files live under one base directory as `<name>.db`
//! with the WAL beside them as `<name>.wal`.
//!
//! The map is behind an `RwLock`: lookups of already-open tables take the
//! read lock; the first open of a table takes the write lock and
//! double-checks before creating, so two racing callers still end up with
//! one instance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::schema::Schema;
use crate::store::{Store, StoreError, StoreOptions};

/// Longest accepted table name.
const MAX_TABLE_NAME_LENGTH: usize = 128;

/// Process-wide cache of open stores.
pub struct StoreRegistry {
    base_dir: PathBuf,
    options: StoreOptions,
    stores: RwLock<HashMap<String, Arc<Store>>>,
}

impl StoreRegistry {
    /// Create a registry storing tables under `base_dir`.
    #[must_use]
    pub fn new(base_dir: PathBuf) -> Self {
        Self::with_options(base_dir, StoreOptions::default())
    }

    /// Create a registry with non-default store options applied to every
    /// table it opens.
    #[must_use]
    pub fn with_options(base_dir: PathBuf, options: StoreOptions) -> Self {
        Self {
            base_dir,
            options,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Path of a table's data file.
    #[must_use]
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.base_dir.join(format!("{table}.db"))
    }

    /// Open the table described by `schema`, creating its file on first
    /// use. Callers racing on the same table all receive one instance.
    pub async fn open_or_create(&self, schema: Schema) -> Result<Arc<Store>, RegistryError> {
        let table = schema.table().to_owned();
        validate_table_name(&table)?;

        // Fast path: the table is already open.
        {
            let stores = self.stores.read().await;
            if let Some(store) = stores.get(&table) {
                return Ok(Arc::clone(store));
            }
        }

        let mut stores = self.stores.write().await;
        // Another task may have opened it while we waited for the lock.
        if let Some(store) = stores.get(&table) {
            return Ok(Arc::clone(store));
        }

        let path = self.table_path(&table);
        let store = Store::open_or_create(&path, schema, self.options).await?;
        tracing::info!(table = %table, path = %path.display(), "opened table");

        let store = Arc::new(store);
        stores.insert(table, Arc::clone(&store));
        Ok(store)
    }

    /// The already-open store for `table`, if any.
    pub async fn get(&self, table: &str) -> Option<Arc<Store>> {
        self.stores.read().await.get(table).map(Arc::clone)
    }

    /// Close every open table and empty the registry.
    pub async fn close_all(&self) -> Result<(), RegistryError> {
        let mut stores = self.stores.write().await;
        for (table, store) in stores.drain() {
            store.close().await?;
            tracing::info!(table = %table, "closed table");
        }
        Ok(())
    }
}

/// Table names become file names, so they are restricted to a safe
/// character set.
fn validate_table_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TABLE_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTableName(name.to_owned()))
    }
}

/// Errors from the registry.
#[derive(Debug)]
pub enum RegistryError {
    /// The table name is empty, too long, or not filesystem-safe.
    InvalidTableName(String),
    /// The underlying store failed to open or close.
    Store(StoreError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTableName(name) => write!(f, "invalid table name: '{name}'"),
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::InvalidTableName(_) => None,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
