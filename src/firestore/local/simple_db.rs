//! Transactional key/value storage with named tables and ordered range scans.
//!
//! Keys are tuples of [`KeyPart`]s compared element-wise, so a key prefix
//! selects a contiguous range. Values are serde records stored as JSON.
//! Transactions stage their writes and apply them atomically on commit; the
//! backend lock guarantees that at most one transaction runs at a time for
//! every connection sharing the same backend.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::firestore::error::{
    data_loss, internal_error, is_transient_storage_error, unavailable, FirestoreResult,
};

/// How often a transaction is attempted before a transient error is returned.
const TRANSACTION_ATTEMPTS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl From<Vec<u8>> for KeyPart {
    fn from(value: Vec<u8>) -> Self {
        KeyPart::Bytes(value)
    }
}

pub type DbKey = Vec<KeyPart>;

/// Builds a [`DbKey`] from heterogeneous parts.
#[macro_export]
macro_rules! db_key {
    ($($part:expr),* $(,)?) => {
        vec![$($crate::firestore::local::KeyPart::from($part)),*]
    };
}

/// Keys that start with `prefix` and fall between `lower` and `upper`.
#[derive(Clone, Debug)]
pub struct KeyRange {
    lower: Bound<DbKey>,
    upper: Bound<DbKey>,
    prefix: DbKey,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::prefix(Vec::new())
    }

    pub fn prefix(prefix: DbKey) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            prefix,
        }
    }

    pub fn bounded(lower: Bound<DbKey>, upper: Bound<DbKey>) -> Self {
        Self {
            lower,
            upper,
            prefix: Vec::new(),
        }
    }

    /// Narrows a prefix range with explicit bounds.
    pub fn with_bounds(mut self, lower: Bound<DbKey>, upper: Bound<DbKey>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn contains(&self, key: &DbKey) -> bool {
        key.starts_with(&self.prefix) && self.above_lower(key) && self.below_upper(key)
    }

    fn above_lower(&self, key: &DbKey) -> bool {
        match &self.lower {
            Bound::Included(lower) => key >= lower,
            Bound::Excluded(lower) => key > lower,
            Bound::Unbounded => true,
        }
    }

    fn below_upper(&self, key: &DbKey) -> bool {
        match &self.upper {
            Bound::Included(upper) => key <= upper,
            Bound::Excluded(upper) => key < upper,
            Bound::Unbounded => true,
        }
    }

    fn scan_start(&self) -> Bound<DbKey> {
        match &self.lower {
            Bound::Unbounded => Bound::Included(self.prefix.clone()),
            Bound::Included(lower) if *lower < self.prefix => Bound::Included(self.prefix.clone()),
            Bound::Excluded(lower) if *lower < self.prefix => Bound::Included(self.prefix.clone()),
            other => other.clone(),
        }
    }
}

pub type Table = BTreeMap<DbKey, JsonValue>;

#[derive(Clone, Debug, Default)]
pub struct Tables {
    stores: BTreeMap<String, Table>,
}

impl Tables {
    fn read(&self, store: &str, key: &DbKey) -> Option<JsonValue> {
        self.stores.get(store).and_then(|table| table.get(key)).cloned()
    }

    fn scan(&self, store: &str, range: &KeyRange) -> Vec<(DbKey, JsonValue)> {
        let Some(table) = self.stores.get(store) else {
            return Vec::new();
        };
        table
            .range((range.scan_start(), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&range.prefix) && range.below_upper(key))
            .filter(|(key, _)| range.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn apply(&mut self, writes: Vec<StagedWrite>) {
        for write in writes {
            let table = self.stores.entry(write.store).or_default();
            match write.value {
                Some(value) => {
                    table.insert(write.key, value);
                }
                None => {
                    table.remove(&write.key);
                }
            }
        }
        self.stores.retain(|_, table| !table.is_empty());
    }
}

/// A single staged put (`Some`) or delete (`None`).
#[derive(Clone, Debug)]
pub struct StagedWrite {
    pub store: String,
    pub key: DbKey,
    pub value: Option<JsonValue>,
}

/// The storage driver behind [`SimpleDb`].
pub trait StorageBackend: Send + Sync {
    fn read(&self, store: &str, key: &DbKey) -> FirestoreResult<Option<JsonValue>>;

    fn scan(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(DbKey, JsonValue)>>;

    /// Applies all writes atomically.
    fn commit(&self, writes: Vec<StagedWrite>) -> FirestoreResult<()>;

    /// Held for the whole lifetime of a transaction.
    fn transaction_lock(&self) -> &Mutex<()>;
}

/// In-process storage. Clones of the `Arc` act as separate connections to
/// the same database, which is how several clients share one cache.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
    lock: Mutex<()>,
    failing_commits: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `count` commits fail with a transient error.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self, store: &str, key: &DbKey) -> FirestoreResult<Option<JsonValue>> {
        Ok(self.tables().read(store, key))
    }

    fn scan(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(DbKey, JsonValue)>> {
        Ok(self.tables().scan(store, range))
    }

    fn commit(&self, writes: Vec<StagedWrite>) -> FirestoreResult<()> {
        let failing = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(unavailable("Simulated storage failure"));
        }
        self.tables().apply(writes);
        Ok(())
    }

    fn transaction_lock(&self) -> &Mutex<()> {
        &self.lock
    }
}

#[derive(Serialize, Deserialize)]
struct FileSnapshot {
    stores: BTreeMap<String, Vec<(DbKey, JsonValue)>>,
}

/// Storage persisted as one JSON file. Every commit rewrites the file
/// through a temporary sibling and an atomic rename, so a crash leaves either
/// the old or the new contents.
///
/// Single-process only: the tables are read once at [`FileStorage::open`]
/// and every commit overwrites the whole file, so two processes on the same
/// path lose each other's batches and leases. Clients that share storage
/// must share one backend instance, such as an `Arc<MemoryStorage>` or one
/// `Arc<FileStorage>` within a process.
pub struct FileStorage {
    path: PathBuf,
    tables: Mutex<Tables>,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> FirestoreResult<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let tables = match fs::read(&path) {
            Ok(bytes) => {
                let snapshot: FileSnapshot = serde_json::from_slice(&bytes).map_err(|err| {
                    data_loss(format!("Corrupt database file {}: {err}", path.display()))
                })?;
                Tables {
                    stores: snapshot
                        .stores
                        .into_iter()
                        .map(|(store, rows)| (store, rows.into_iter().collect()))
                        .collect(),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(err) => {
                return Err(unavailable(format!(
                    "Failed to read database file {}: {err}",
                    path.display()
                )))
            }
        };
        log::debug!("opened file storage at {}", path.display());
        Ok(Arc::new(Self {
            path,
            tables: Mutex::new(tables),
            lock: Mutex::new(()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshot(&self, tables: &Tables) -> FirestoreResult<()> {
        let snapshot = FileSnapshot {
            stores: tables
                .stores
                .iter()
                .map(|(store, table)| {
                    let rows = table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    (store.clone(), rows)
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|err| internal_error(format!("Failed to encode database: {err}")))?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, bytes)
            .and_then(|_| fs::rename(&temp, &self.path))
            .map_err(|err| {
                unavailable(format!(
                    "Failed to write database file {}: {err}",
                    self.path.display()
                ))
            })
    }
}

impl StorageBackend for FileStorage {
    fn read(&self, store: &str, key: &DbKey) -> FirestoreResult<Option<JsonValue>> {
        Ok(self.tables().read(store, key))
    }

    fn scan(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(DbKey, JsonValue)>> {
        Ok(self.tables().scan(store, range))
    }

    fn commit(&self, writes: Vec<StagedWrite>) -> FirestoreResult<()> {
        let mut tables = self.tables();
        let mut updated = tables.clone();
        updated.apply(writes);
        self.write_snapshot(&updated)?;
        *tables = updated;
        Ok(())
    }

    fn transaction_lock(&self) -> &Mutex<()> {
        &self.lock
    }
}

/// A unit of work against a [`StorageBackend`]. Reads observe the
/// transaction's own staged writes.
pub struct SimpleDbTransaction<'a> {
    backend: &'a dyn StorageBackend,
    read_only: bool,
    staged: BTreeMap<String, BTreeMap<DbKey, Option<JsonValue>>>,
}

impl<'a> SimpleDbTransaction<'a> {
    fn new(backend: &'a dyn StorageBackend, read_only: bool) -> Self {
        Self {
            backend,
            read_only,
            staged: BTreeMap::new(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn get_raw(&self, store: &str, key: &DbKey) -> FirestoreResult<Option<JsonValue>> {
        if let Some(staged) = self.staged.get(store).and_then(|table| table.get(key)) {
            return Ok(staged.clone());
        }
        self.backend.read(store, key)
    }

    pub fn get<T: DeserializeOwned>(&self, store: &str, key: &DbKey) -> FirestoreResult<Option<T>> {
        self.get_raw(store, key)?
            .map(|value| decode_row(store, value))
            .transpose()
    }

    pub fn put<T: Serialize>(&mut self, store: &str, key: DbKey, value: &T) -> FirestoreResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|err| internal_error(format!("Failed to encode {store} row: {err}")))?;
        self.stage(store, key, Some(value))
    }

    pub fn delete(&mut self, store: &str, key: DbKey) -> FirestoreResult<()> {
        self.stage(store, key, None)
    }

    /// Rows in `range`, ordered by key.
    pub fn scan_raw(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(DbKey, JsonValue)>> {
        let mut rows: BTreeMap<DbKey, JsonValue> =
            self.backend.scan(store, range)?.into_iter().collect();
        if let Some(staged) = self.staged.get(store) {
            for (key, value) in staged.iter().filter(|(key, _)| range.contains(key)) {
                match value {
                    Some(value) => {
                        rows.insert(key.clone(), value.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    pub fn scan<T: DeserializeOwned>(
        &self,
        store: &str,
        range: &KeyRange,
    ) -> FirestoreResult<Vec<(DbKey, T)>> {
        self.scan_raw(store, range)?
            .into_iter()
            .map(|(key, value)| Ok((key, decode_row(store, value)?)))
            .collect()
    }

    pub fn scan_keys(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<DbKey>> {
        Ok(self
            .scan_raw(store, range)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    pub fn count(&self, store: &str, range: &KeyRange) -> FirestoreResult<usize> {
        Ok(self.scan_raw(store, range)?.len())
    }

    pub fn delete_range(&mut self, store: &str, range: &KeyRange) -> FirestoreResult<usize> {
        let keys = self.scan_keys(store, range)?;
        let count = keys.len();
        for key in keys {
            self.delete(store, key)?;
        }
        Ok(count)
    }

    fn stage(&mut self, store: &str, key: DbKey, value: Option<JsonValue>) -> FirestoreResult<()> {
        if self.read_only {
            return Err(internal_error(format!(
                "Cannot write to {store} in a read-only transaction"
            )));
        }
        self.staged
            .entry(store.to_string())
            .or_default()
            .insert(key, value);
        Ok(())
    }

    fn commit(self) -> FirestoreResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let writes = self
            .staged
            .into_iter()
            .flat_map(|(store, rows)| {
                rows.into_iter().map(move |(key, value)| StagedWrite {
                    store: store.clone(),
                    key,
                    value,
                })
            })
            .collect();
        self.backend.commit(writes)
    }
}

fn decode_row<T: DeserializeOwned>(store: &str, value: JsonValue) -> FirestoreResult<T> {
    serde_json::from_value(value)
        .map_err(|err| data_loss(format!("Failed to decode {store} row: {err}")))
}

/// Connection to a database held by a [`StorageBackend`].
#[derive(Clone)]
pub struct SimpleDb {
    backend: Arc<dyn StorageBackend>,
}

impl SimpleDb {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Runs `body` in a transaction and commits its writes if it succeeds.
    /// A transient storage failure retries the whole body once.
    pub fn run_transaction<T, F>(&self, action: &str, read_only: bool, mut body: F) -> FirestoreResult<T>
    where
        F: FnMut(&mut SimpleDbTransaction<'_>) -> FirestoreResult<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _guard = self
                    .backend
                    .transaction_lock()
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let mut txn = SimpleDbTransaction::new(self.backend.as_ref(), read_only);
                body(&mut txn).and_then(|value| txn.commit().map(|_| value))
            };
            match result {
                Err(err) if is_transient_storage_error(&err) && attempt < TRANSACTION_ATTEMPTS => {
                    log::debug!("transaction '{action}' failed with {err}; retrying");
                }
                Err(err) => {
                    log::debug!("transaction '{action}' failed: {err}");
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_key;

    fn db() -> (Arc<MemoryStorage>, SimpleDb) {
        let storage = MemoryStorage::new();
        (Arc::clone(&storage), SimpleDb::new(storage))
    }

    #[test]
    fn prefix_scans_are_ordered_and_bounded() {
        let (_, db) = db();
        db.run_transaction("fill", false, |txn| {
            for (user, batch) in [("b", 2), ("a", 3), ("a", 1), ("c", 1)] {
                txn.put("mutations", db_key![user, batch], &batch)?;
            }
            Ok(())
        })
        .unwrap();

        let rows: Vec<(DbKey, i32)> = db
            .run_transaction("scan", true, |txn| {
                txn.scan("mutations", &KeyRange::prefix(db_key!["a"]))
            })
            .unwrap();
        assert_eq!(rows.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![1, 3]);

        let after = db
            .run_transaction("scan", true, |txn| {
                let range = KeyRange::prefix(db_key!["a"])
                    .with_bounds(Bound::Excluded(db_key!["a", 1]), Bound::Unbounded);
                txn.scan_keys("mutations", &range)
            })
            .unwrap();
        assert_eq!(after, vec![db_key!["a", 3]]);
    }

    #[test]
    fn reads_see_staged_writes_and_failures_roll_back() {
        let (_, db) = db();
        let result: FirestoreResult<()> = db.run_transaction("partial", false, |txn| {
            txn.put("globals", db_key!["x"], &1)?;
            assert_eq!(txn.get::<i32>("globals", &db_key!["x"])?, Some(1));
            assert_eq!(txn.count("globals", &KeyRange::all())?, 1);
            Err(internal_error("abort"))
        });
        assert!(result.is_err());
        let value: Option<i32> = db
            .run_transaction("read", true, |txn| txn.get("globals", &db_key!["x"]))
            .unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn read_only_transactions_reject_writes() {
        let (_, db) = db();
        let err = db
            .run_transaction("ro", true, |txn| txn.put("globals", db_key!["x"], &1))
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[test]
    fn retries_once_on_transient_failure() {
        let (storage, db) = db();
        storage.fail_next_commits(1);
        let mut attempts = 0;
        db.run_transaction("retry", false, |txn| {
            attempts += 1;
            txn.put("globals", db_key!["x"], &attempts)
        })
        .unwrap();
        assert_eq!(attempts, 2);

        storage.fail_next_commits(2);
        let err = db
            .run_transaction("retry", false, |txn| txn.put("globals", db_key!["y"], &1))
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/unavailable");
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "firestore-sync-simple-db-{}-{}",
            std::process::id(),
            crate::platform::runtime::now_millis()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("db.json");
        {
            let db = SimpleDb::new(FileStorage::open(&path).unwrap());
            db.run_transaction("write", false, |txn| {
                txn.put("remoteDocuments", db_key!["rooms", "eros"], &"doc")?;
                txn.delete_range("missing", &KeyRange::all())?;
                Ok(())
            })
            .unwrap();
        }
        let db = SimpleDb::new(FileStorage::open(&path).unwrap());
        let value: Option<String> = db
            .run_transaction("read", true, |txn| {
                txn.get("remoteDocuments", &db_key!["rooms", "eros"])
            })
            .unwrap();
        assert_eq!(value.as_deref(), Some("doc"));
        fs::remove_dir_all(&dir).unwrap();
    }
}
