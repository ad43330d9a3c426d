//! The in-memory event store.
//!
//! The store keeps a bounded history per service, a bounded global history
//! and a byte-bounded media cache per folder. Every write wakes the listeners
//! of the affected scopes while the exclusive lock is still held, so a
//! listener that registered before taking a snapshot can never miss a write.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use statushub_server::store::{EventStore, FixedLimits};
//!
//! let store = EventStore::new(Arc::new(FixedLimits::new(2, 1024)));
//! store.add("backup", "started");
//! store.add("backup", "copied 10 files");
//! store.add("backup", "done");
//!
//! let log = store.service_log("backup").unwrap();
//! assert_eq!(log.len(), 2);
//! assert_eq!(log[0].message, "done");
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::broadcast::{WakeHandle, WakeRegistry};
use crate::error::StoreError;
use crate::settings::{DEFAULT_LOG_SIZE, DEFAULT_MEDIA_CACHE_BYTES};
use crate::types::{LogRecord, MediaRecord, Scope};

/// Source of the store's retention limits.
///
/// Limits are read before the store lock is taken, so implementations may
/// take locks of their own.
pub trait StoreLimits: Send + Sync {
    /// Maximum records kept per service and globally; 0 means unlimited.
    fn log_size(&self) -> usize;

    /// Byte budget of each media folder.
    fn media_cache_bytes(&self) -> usize;
}

/// Constant retention limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLimits {
    pub log_size: usize,
    pub media_cache_bytes: usize,
}

impl FixedLimits {
    pub fn new(log_size: usize, media_cache_bytes: usize) -> Self {
        Self {
            log_size,
            media_cache_bytes,
        }
    }
}

impl Default for FixedLimits {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_SIZE, DEFAULT_MEDIA_CACHE_BYTES)
    }
}

impl StoreLimits for FixedLimits {
    fn log_size(&self) -> usize {
        self.log_size
    }

    fn media_cache_bytes(&self) -> usize {
        self.media_cache_bytes
    }
}

/// Records newer than a stream's high-water mark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Id of the most recent record in the scope, `None` if it is empty.
    pub head: Option<u64>,

    /// Records with ids above the requested mark, oldest first.
    pub records: Vec<LogRecord>,
}

#[derive(Debug, Default)]
struct MediaFolder {
    records: VecDeque<MediaRecord>,
    bytes: usize,
}

impl MediaFolder {
    fn push(&mut self, record: MediaRecord) {
        self.bytes += record.len();
        self.records.push_back(record);
    }

    fn remove_named(&mut self, filename: &str) -> usize {
        let before = self.records.len();
        let mut freed = 0;
        self.records.retain(|record| {
            let keep = record.filename != filename;
            if !keep {
                freed += record.len();
            }
            keep
        });
        self.bytes -= freed;
        before - self.records.len()
    }

    /// Evicts oldest records until the folder fits `budget`, never going
    /// below one record.
    fn trim(&mut self, budget: usize) -> usize {
        let mut evicted = 0;
        while self.bytes > budget && self.records.len() > 1 {
            if let Some(oldest) = self.records.pop_front() {
                self.bytes -= oldest.len();
                evicted += 1;
            }
        }
        evicted
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    next_id: u64,
    services: HashMap<String, VecDeque<LogRecord>>,
    all: VecDeque<LogRecord>,
    media: HashMap<String, MediaFolder>,
    signals: WakeRegistry,
}

impl StoreInner {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push_log(&mut self, service: &str, message: &str, log_size: usize) -> u64 {
        let record = LogRecord::new(self.allocate_id(), service, message);
        let id = record.id;

        let history = self.services.entry(service.to_string()).or_default();
        history.push_back(record.clone());
        trim_log(history, log_size);

        self.all.push_back(record);
        trim_log(&mut self.all, log_size);
        id
    }

    fn scope_log(&self, scope: &Scope) -> Option<&VecDeque<LogRecord>> {
        match scope {
            Scope::Global => Some(&self.all),
            Scope::Service(name) => self.services.get(name),
        }
    }
}

/// Drops the oldest records beyond `log_size`; 0 keeps everything.
fn trim_log(log: &mut VecDeque<LogRecord>, log_size: usize) -> usize {
    if log_size == 0 || log.len() <= log_size {
        return 0;
    }
    let excess = log.len() - log_size;
    log.drain(..excess);
    excess
}

/// Thread-safe store of log and media records.
pub struct EventStore {
    limits: Arc<dyn StoreLimits>,
    inner: RwLock<StoreInner>,
}

impl EventStore {
    /// Creates an empty store governed by `limits`.
    pub fn new(limits: Arc<dyn StoreLimits>) -> Self {
        Self {
            limits,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message to `service` and returns its id.
    pub fn add(&self, service: &str, message: &str) -> u64 {
        let log_size = self.limits.log_size();
        let mut inner = self.write();
        let id = inner.push_log(service, message, log_size);
        inner.signals.wake(service);
        id
    }

    /// Appends several messages to `service` in order, waking listeners
    /// once. Returns the ids in message order.
    pub fn add_batch<S: AsRef<str>>(&self, service: &str, messages: &[S]) -> Vec<u64> {
        if messages.is_empty() {
            return Vec::new();
        }
        let log_size = self.limits.log_size();
        let mut inner = self.write();
        let ids = messages
            .iter()
            .map(|message| inner.push_log(service, message.as_ref(), log_size))
            .collect();
        inner.signals.wake(service);
        ids
    }

    /// Stores a media blob in `folder` and returns its id.
    ///
    /// With `replace`, earlier records of the same file name in the folder
    /// are removed first.
    pub fn add_media(
        &self,
        folder: &str,
        filename: &str,
        mime_type: &str,
        data: Vec<u8>,
        replace: bool,
    ) -> u64 {
        let budget = self.limits.media_cache_bytes();
        let mut inner = self.write();
        let id = inner.allocate_id();
        let entry = inner.media.entry(folder.to_string()).or_default();
        if replace {
            let replaced = entry.remove_named(filename);
            if replaced > 0 {
                debug!(folder, filename, replaced, "Replaced media records");
            }
        }
        entry.push(MediaRecord::new(id, folder, filename, mime_type, data));
        entry.trim(budget);
        id
    }

    /// Removes every record of `service` and wakes its listeners.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownService`] if the service has no records.
    pub fn delete_service(&self, service: &str) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner.services.remove(service).is_none() {
            return Err(StoreError::UnknownService(service.to_string()));
        }
        inner.all.retain(|record| record.service != service);
        inner.signals.wake(service);
        Ok(())
    }

    /// Removes a media folder.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownFolder`] if the folder does not exist.
    pub fn delete_media(&self, folder: &str) -> Result<(), StoreError> {
        match self.write().media.remove(folder) {
            Some(_) => Ok(()),
            None => Err(StoreError::UnknownFolder(folder.to_string())),
        }
    }

    /// The most recent record of each service, newest first.
    pub fn overview(&self) -> Vec<LogRecord> {
        let inner = self.read();
        let mut latest: Vec<LogRecord> = inner
            .services
            .values()
            .filter_map(|log| log.back().cloned())
            .collect();
        latest.sort_unstable_by(|a, b| b.id.cmp(&a.id));
        latest
    }

    /// The most recent record of each media folder, newest first.
    pub fn media_overview(&self) -> Vec<MediaRecord> {
        let inner = self.read();
        let mut latest: Vec<MediaRecord> = inner
            .media
            .values()
            .filter_map(|folder| folder.records.back().cloned())
            .collect();
        latest.sort_unstable_by(|a, b| b.id.cmp(&a.id));
        latest
    }

    /// The global history, newest first.
    pub fn full_log(&self) -> Vec<LogRecord> {
        self.read().all.iter().rev().cloned().collect()
    }

    /// The history of one service, newest first.
    pub fn service_log(&self, service: &str) -> Result<Vec<LogRecord>, StoreError> {
        self.read()
            .services
            .get(service)
            .map(|log| log.iter().rev().cloned().collect())
            .ok_or_else(|| StoreError::UnknownService(service.to_string()))
    }

    /// The records of one media folder, newest first.
    pub fn media_log(&self, folder: &str) -> Result<Vec<MediaRecord>, StoreError> {
        self.read()
            .media
            .get(folder)
            .map(|f| f.records.iter().rev().cloned().collect())
            .ok_or_else(|| StoreError::UnknownFolder(folder.to_string()))
    }

    /// Looks up a media record by id across all folders.
    pub fn media_record(&self, id: u64) -> Option<MediaRecord> {
        self.read()
            .media
            .values()
            .flat_map(|folder| folder.records.iter())
            .find(|record| record.id == id)
            .cloned()
    }

    /// Records of `scope` with ids above `after`, oldest first, together
    /// with the scope's current head.
    ///
    /// Scanning stops at the first record at or below the mark, matching a
    /// walk over the newest-first snapshot.
    pub fn delta(&self, scope: &Scope, after: Option<u64>) -> Delta {
        let inner = self.read();
        let Some(log) = inner.scope_log(scope) else {
            return Delta::default();
        };
        let head = log.back().map(|record| record.id);
        let mut records: Vec<LogRecord> = log
            .iter()
            .rev()
            .take_while(|record| after.map_or(true, |mark| record.id > mark))
            .cloned()
            .collect();
        records.reverse();
        Delta { head, records }
    }

    /// Id of the most recent record in `scope`.
    pub fn head(&self, scope: &Scope) -> Option<u64> {
        self.read()
            .scope_log(scope)
            .and_then(|log| log.back())
            .map(|record| record.id)
    }

    /// Registers a one-shot waiter that resolves on the next change to
    /// `scope`.
    pub fn wait(&self, scope: &Scope) -> WakeHandle {
        self.write().signals.subscribe(scope)
    }

    /// Re-applies the log size limit; services whose history shrank are
    /// woken.
    pub fn log_size_changed(&self) {
        let log_size = self.limits.log_size();
        let mut inner = self.write();
        let inner = &mut *inner;

        let shrunk: Vec<String> = inner
            .services
            .iter_mut()
            .filter_map(|(name, log)| (trim_log(log, log_size) > 0).then(|| name.clone()))
            .collect();
        let global_shrunk = trim_log(&mut inner.all, log_size) > 0;

        for name in &shrunk {
            inner.signals.wake(name);
        }
        if global_shrunk {
            inner.signals.wake_global();
        }
        debug!(log_size, services = shrunk.len(), "Applied new log size");
    }

    /// Re-applies the media byte budget to every folder.
    pub fn media_cache_changed(&self) {
        let budget = self.limits.media_cache_bytes();
        let mut inner = self.write();
        let evicted: usize = inner
            .media
            .values_mut()
            .map(|folder| folder.trim(budget))
            .sum();
        debug!(budget, evicted, "Applied new media cache budget");
    }

    /// Number of services with records.
    pub fn service_count(&self) -> usize {
        self.read().services.len()
    }

    /// Number of waiters currently registered on any scope.
    pub fn listener_count(&self) -> usize {
        self.read().signals.total_listeners()
    }

    /// Number of waiters registered on `scope`.
    pub fn scope_listener_count(&self, scope: &Scope) -> usize {
        self.read().signals.listener_count(scope)
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("EventStore")
            .field("services", &inner.services.len())
            .field("records", &inner.all.len())
            .field("media_folders", &inner.media.len())
            .finish()
    }
}
