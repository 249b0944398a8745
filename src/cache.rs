//! Persistent, versioned key/value cache for expensive external lookups.
//!
//! Values are stored as JSON payloads under keys of the form
//! `namespace/vN/body`. A store is either purely in memory or backed by a
//! JSON file that is rewritten atomically (temp file + rename) with dated
//! backups.
//!
//! Entries live in a sharded concurrent map. At most one computation per key
//! is in flight at any time: callers of [`CacheStore::get_or_try_insert_with`]
//! that find a computation running for their key wait on that key's gate and
//! reuse its result.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::model::unix_now;

/// On-disk document format. Files with another format are ignored.
const CACHE_FORMAT: u32 = 1;

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the cache file; `None` keeps the cache in memory.
    pub dir: Option<PathBuf>,
    pub file_name: String,
    /// Flush to disk after this many writes (0 disables auto-save).
    pub auto_save_every: usize,
    pub max_backups: usize,
    /// Time-to-live applied when a write does not specify one.
    pub default_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("cache")),
            file_name: "cache.json".to_string(),
            auto_save_every: 10,
            max_backups: 5,
            default_ttl_secs: Some(30 * SECONDS_PER_DAY),
        }
    }
}

impl CacheConfig {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            default_ttl_secs: None,
            ..Self::default()
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }
}

/// Deterministic identifier of a memoized computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    version: u32,
    body: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, version: u32, body: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            version,
            body: body.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/v{}/{}", self.namespace, self.version, self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub namespace: String,
    pub version: u32,
    pub value: serde_json::Value,
    pub created_at: u64,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        match self.ttl_secs {
            Some(ttl) => now >= self.created_at.saturating_add(ttl),
            None => false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    format: u32,
    entries: Vec<serde_json::Value>,
}

/// Usage counters of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries (or files) that failed to decode and were treated as misses.
    pub corrupt: u64,
    /// Callers that waited for another caller's in-flight computation.
    pub waits: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub expired: usize,
    pub orphaned: usize,
    pub files_removed: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    corrupt: AtomicU64,
    waits: AtomicU64,
}

struct Persistence {
    dir: PathBuf,
    path: PathBuf,
    write_lock: Mutex<()>,
}

/// Gate serializing computations of one key. Unrelated keys never share one.
type Gate = Arc<Mutex<()>>;

pub struct CacheStore {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, Gate>,
    schemas: DashMap<String, u32>,
    pending_writes: AtomicUsize,
    counters: Counters,
    persistence: Option<Persistence>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.persistence.as_ref().map(|p| &p.path))
            .field("entries", &self.len())
            .finish()
    }
}

impl CacheStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::with_entries(CacheConfig::in_memory(), DashMap::new(), Counters::default(), None)
    }

    /// Opens the store described by `config`, loading any persisted entries.
    ///
    /// A corrupt cache file is not an error: the newest readable backup is
    /// used instead, or the store starts empty.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let Some(dir) = config.dir.clone() else {
            return Ok(Self::with_entries(config, DashMap::new(), Counters::default(), None));
        };

        fs::create_dir_all(&dir)?;
        let path = dir.join(&config.file_name);
        let persistence = Persistence {
            dir,
            path,
            write_lock: Mutex::new(()),
        };

        let counters = Counters::default();
        let entries: DashMap<String, CacheEntry> =
            load_entries(&persistence, &config, &counters).into_iter().collect();
        info!(path = %persistence.path.display(), entries = entries.len(), "cache opened");

        Ok(Self::with_entries(config, entries, counters, Some(persistence)))
    }

    fn with_entries(
        config: CacheConfig,
        entries: DashMap<String, CacheEntry>,
        counters: Counters,
        persistence: Option<Persistence>,
    ) -> Self {
        Self {
            config,
            entries,
            in_flight: DashMap::new(),
            schemas: DashMap::new(),
            pending_writes: AtomicUsize::new(0),
            counters,
            persistence,
        }
    }

    /// Declares the current schema version of a namespace.
    ///
    /// Entries of that namespace written under any other version are dropped.
    /// Returns how many were removed.
    pub fn register_schema(&self, namespace: &str, version: u32) -> usize {
        self.schemas.insert(namespace.to_string(), version);
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.namespace != namespace || entry.version == version;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            self.pending_writes.fetch_add(1, Ordering::Relaxed);
            info!(namespace, version, removed, "dropped entries of outdated schema");
        }
        removed
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let value = self.lookup_live(&key.to_string());
        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .get(&key.to_string())
            .is_some_and(|entry| !entry.is_expired(unix_now()))
    }

    /// Stores `value` under `key`.
    ///
    /// A live entry holding a different value is never replaced; invalidate
    /// it first. Expired or undecodable entries are overwritten.
    pub fn put<T>(&self, key: &CacheKey, value: &T, ttl: Option<Duration>) -> Result<(), CacheError>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = serde_json::to_value(value)?;
        let key_text = key.to_string();
        let entry = self.new_entry(key, key_text.clone(), payload, ttl);

        // The shard stays locked between the conflict check and the insert.
        match self.entries.entry(key_text) {
            MapEntry::Occupied(mut occupied) => {
                let existing = occupied.get();
                let live = !existing.is_expired(unix_now())
                    && serde_json::from_value::<T>(existing.value.clone()).is_ok();
                if live {
                    if existing.value == entry.value {
                        return Ok(());
                    }
                    return Err(CacheError::Conflict {
                        key: occupied.key().clone(),
                    });
                }
                occupied.insert(entry);
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        if self.note_write() {
            self.flush()?;
        }
        Ok(())
    }

    /// Returns the cached value for `key`, computing and storing it on a miss.
    ///
    /// Concurrent callers for the same key never run `compute` at the same
    /// time: later callers block on that key's gate until the running
    /// computation finishes and then read its result. If it failed, one of
    /// them computes next. Callers for other keys are not held up.
    pub fn get_or_try_insert_with<T, E, F>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        let key_text = key.to_string();
        if let Some(value) = self.lookup_live(&key_text) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let gate = Arc::clone(self.in_flight.entry(key_text.clone()).or_default().value());
        let result = {
            let _turn = match gate.try_lock() {
                Ok(turn) => turn,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    self.counters.waits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key_text, "waiting for in-flight computation");
                    gate.lock().unwrap_or_else(PoisonError::into_inner)
                }
            };
            self.compute_under_gate(key, &key_text, ttl, compute)
        };

        drop(gate);
        // Only the map holds the gate once nobody else is queued on it.
        self.in_flight
            .remove_if(&key_text, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    fn compute_under_gate<T, E, F>(
        &self,
        key: &CacheKey,
        key_text: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        // The previous holder of the gate may have stored the value already.
        if let Some(value) = self.lookup_live(key_text) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let value = compute()?;
        match serde_json::to_value(&value) {
            Ok(payload) => {
                let entry = self.new_entry(key, key_text.to_string(), payload, ttl);
                self.entries.insert(key_text.to_string(), entry);
                if self.note_write() {
                    if let Err(err) = self.flush() {
                        warn!(error = %err, "cache auto-save failed");
                    }
                }
            }
            Err(err) => warn!(key = %key, error = %err, "value not cacheable"),
        }
        Ok(value)
    }

    /// Removes one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(&key.to_string()).is_some();
        if removed {
            self.pending_writes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            self.pending_writes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drops expired entries and entries of outdated schema versions, then
    /// clears stray temporary files and surplus backups from the cache
    /// directory.
    pub fn purge(&self) -> Result<PurgeReport, CacheError> {
        let now = unix_now();
        let mut report = PurgeReport::default();
        let schemas: HashMap<String, u32> = self
            .schemas
            .iter()
            .map(|schema| (schema.key().clone(), *schema.value()))
            .collect();
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                report.expired += 1;
                return false;
            }
            match schemas.get(&entry.namespace) {
                Some(version) if *version != entry.version => {
                    report.orphaned += 1;
                    false
                }
                _ => true,
            }
        });
        if report.expired + report.orphaned > 0 {
            self.pending_writes.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(persistence) = &self.persistence {
            {
                let _writer = persistence
                    .write_lock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                report.files_removed += remove_temp_files(persistence)?;
                report.files_removed += prune_backups(persistence, self.config.max_backups)?;
            }
            self.flush()?;
        }

        info!(
            expired = report.expired,
            orphaned = report.orphaned,
            files_removed = report.files_removed,
            "cache purged"
        );
        Ok(report)
    }

    /// Writes all entries to disk. A no-op for in-memory stores.
    pub fn flush(&self) -> Result<(), CacheError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let _writer = persistence
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.pending_writes.store(0, Ordering::Relaxed);
        let mut snapshot: Vec<CacheEntry> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        let document = CacheFile {
            format: CACHE_FORMAT,
            entries: snapshot
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?,
        };

        write_atomically(persistence, &document)?;
        prune_backups(persistence, self.config.max_backups)?;
        debug!(path = %persistence.path.display(), entries = document.entries.len(), "cache saved");
        Ok(())
    }

    /// Flushes pending writes and releases the store.
    pub fn close(self) -> Result<(), CacheError> {
        if self.pending_writes.load(Ordering::Relaxed) > 0 {
            self.flush()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.path.as_path())
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            corrupt: self.counters.corrupt.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            entries: self.len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Writes a JSON report of the store's state and backups to `path`.
    pub fn write_report(&self, path: &Path) -> Result<(), CacheError> {
        let (file, backups) = match &self.persistence {
            Some(persistence) => {
                let size_bytes = fs::metadata(&persistence.path).map(|m| m.len()).unwrap_or(0);
                let file = serde_json::json!({
                    "path": persistence.path.display().to_string(),
                    "size_bytes": size_bytes,
                });
                let backups = backup_files(persistence)?
                    .into_iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>();
                (Some(file), backups)
            }
            None => (None, Vec::new()),
        };

        let report = serde_json::json!({
            "generated_at": unix_now(),
            "stats": self.stats(),
            "file": file,
            "backups": backups,
        });

        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writer.flush()?;
        Ok(())
    }

    fn lookup_live<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let decoded = {
            let entry = self.entries.get(key)?;
            if entry.is_expired(unix_now()) {
                None
            } else {
                Some(serde_json::from_value::<T>(entry.value.clone()))
            }
        };

        match decoded {
            Some(Ok(value)) => Some(value),
            None => {
                debug!(key, "cache entry expired");
                let now = unix_now();
                if self.entries.remove_if(key, |_, entry| entry.is_expired(now)).is_some() {
                    self.pending_writes.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
            Some(Err(err)) => {
                warn!(key, error = %err, "corrupt cache entry treated as miss");
                self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                let still_corrupt = |_: &String, entry: &CacheEntry| {
                    serde_json::from_value::<T>(entry.value.clone()).is_err()
                };
                if self.entries.remove_if(key, still_corrupt).is_some() {
                    self.pending_writes.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
        }
    }

    fn new_entry(
        &self,
        key: &CacheKey,
        key_text: String,
        payload: serde_json::Value,
        ttl: Option<Duration>,
    ) -> CacheEntry {
        CacheEntry {
            key: key_text,
            namespace: key.namespace().to_string(),
            version: key.version(),
            value: payload,
            created_at: unix_now(),
            ttl_secs: ttl.map(|ttl| ttl.as_secs()).or(self.config.default_ttl_secs),
        }
    }

    /// Counts a write; returns whether an auto-save is due.
    fn note_write(&self) -> bool {
        let pending = self.pending_writes.fetch_add(1, Ordering::Relaxed) + 1;
        self.persistence.is_some()
            && self.config.auto_save_every > 0
            && pending >= self.config.auto_save_every
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if self.pending_writes.load(Ordering::Relaxed) > 0 && self.persistence.is_some() {
            if let Err(err) = self.flush() {
                warn!(error = %err, "failed to save cache on drop");
            }
        }
    }
}

fn load_entries(
    persistence: &Persistence,
    config: &CacheConfig,
    counters: &Counters,
) -> HashMap<String, CacheEntry> {
    if !persistence.path.exists() {
        return HashMap::new();
    }

    match read_cache_file(&persistence.path, counters) {
        Ok(entries) => return entries,
        Err(err) => {
            warn!(path = %persistence.path.display(), error = %err, "cache file unreadable");
            counters.corrupt.fetch_add(1, Ordering::Relaxed);
        }
    }

    let mut backups = backup_files(persistence).unwrap_or_default();
    backups.reverse();
    for backup in backups.into_iter().take(config.max_backups.max(1)) {
        match read_cache_file(&backup, counters) {
            Ok(entries) => {
                info!(backup = %backup.display(), entries = entries.len(), "cache restored from backup");
                return entries;
            }
            Err(err) => warn!(backup = %backup.display(), error = %err, "backup unreadable"),
        }
    }

    HashMap::new()
}

fn read_cache_file(
    path: &Path,
    counters: &Counters,
) -> Result<HashMap<String, CacheEntry>, CacheError> {
    let bytes = fs::read(path)?;
    let file: CacheFile = serde_json::from_slice(&bytes)
        .map_err(|err| CacheError::Corruption(err.to_string()))?;
    if file.format != CACHE_FORMAT {
        return Err(CacheError::Corruption(format!(
            "unsupported cache format {}",
            file.format
        )));
    }

    let mut entries = HashMap::with_capacity(file.entries.len());
    for raw in file.entries {
        match serde_json::from_value::<CacheEntry>(raw) {
            Ok(entry) => {
                entries.insert(entry.key.clone(), entry);
            }
            Err(err) => {
                counters.corrupt.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "skipping corrupt cache record");
            }
        }
    }
    Ok(entries)
}

fn write_atomically(persistence: &Persistence, document: &CacheFile) -> Result<(), CacheError> {
    let tmp_path = persistence.path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, document)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    // One backup per day of the previous file.
    if persistence.path.exists() {
        let backup = backup_path(persistence, unix_now() / SECONDS_PER_DAY);
        if !backup.exists() {
            fs::copy(&persistence.path, &backup)?;
        }
    }

    fs::rename(&tmp_path, &persistence.path)?;
    Ok(())
}

fn backup_path(persistence: &Persistence, day: u64) -> PathBuf {
    let name = persistence
        .path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    persistence.dir.join(format!("{}.{:06}.bak", name, day))
}

/// Backup files of the cache, oldest first.
fn backup_files(persistence: &Persistence) -> Result<Vec<PathBuf>, CacheError> {
    let prefix = persistence
        .path
        .file_name()
        .map(|name| format!("{}.", name.to_string_lossy()))
        .unwrap_or_default();

    let mut backups = Vec::new();
    for entry in fs::read_dir(&persistence.dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.starts_with(&prefix) && name.ends_with(".bak") {
            backups.push(path);
        }
    }
    backups.sort();
    Ok(backups)
}

fn prune_backups(persistence: &Persistence, keep: usize) -> Result<usize, CacheError> {
    let backups = backup_files(persistence)?;
    if backups.len() <= keep {
        return Ok(0);
    }

    let surplus = backups.len() - keep;
    for old in &backups[..surplus] {
        fs::remove_file(old)?;
        debug!(backup = %old.display(), "removed old cache backup");
    }
    Ok(surplus)
}

fn remove_temp_files(persistence: &Persistence) -> Result<usize, CacheError> {
    let mut removed = 0;
    for entry in fs::read_dir(&persistence.dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
