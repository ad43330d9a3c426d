//! Durable server settings.
//!
//! Settings hold the password hash and the retention limits of the event
//! store. They are kept in memory behind their own lock and written through
//! to a [`SettingsStore`] on every change. A change becomes visible only
//! after it has been written, and the write happens without holding the
//! lock that readers take, so a slow disk never stalls log ingestion.
//!
//! # File Format
//!
//! ```json
//! {"pass": "<sha512 hex>", "log_size": 1000, "media_cache": 10000000}
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{hash_password, verify_password_hash};
use crate::store::StoreLimits;

/// Default number of log records retained per service and globally.
pub const DEFAULT_LOG_SIZE: usize = 1000;

/// Default byte budget of a single media folder.
pub const DEFAULT_MEDIA_CACHE_BYTES: usize = 10_000_000;

/// Errors that can occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Reading or writing the backing resource failed.
    #[error("settings I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The settings could not be encoded or decoded.
    #[error("malformed settings: {0}")]
    Format(#[from] serde_json::Error),

    /// A setter rejected the new value.
    #[error("{0}")]
    Invalid(String),

    /// The initial password could not be obtained.
    #[error("could not read initial password: {0}")]
    Prompt(String),
}

/// Byte-oriented access to the single resource holding the settings.
///
/// Implementations must replace the resource atomically on [`save`](Self::save).
pub trait SettingsStore: Send + Sync {
    /// Reads the stored bytes, or `None` if the resource does not exist yet.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;

    /// Atomically replaces the stored bytes.
    fn save(&self, contents: &[u8]) -> io::Result<()>;
}

/// Settings persisted as a file on the local filesystem.
///
/// Writes go to a temporary sibling file that is renamed over the target.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    /// Creates a store backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save(&self, contents: &[u8]) -> io::Result<()> {
        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(contents)?;
            file.sync_all()?;
        }
        rename_with_fallback(&temp, &self.path)
    }
}

/// Renames `temp` over `destination`, retrying once after removing the
/// destination on platforms where rename refuses to overwrite.
fn rename_with_fallback(temp: &Path, destination: &Path) -> io::Result<()> {
    if let Err(initial_err) = fs::rename(temp, destination) {
        let _ = fs::remove_file(destination);
        fs::rename(temp, destination).map_err(|retry_err| {
            let _ = fs::remove_file(temp);
            io::Error::new(
                retry_err.kind(),
                format!("atomic rename failed (initial: {initial_err}, retry: {retry_err})"),
            )
        })?;
    }
    Ok(())
}

/// Settings kept purely in memory.
///
/// Useful for embedding the server without a settings file.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    contents: RwLock<Option<Vec<u8>>>,
}

impl MemorySettingsStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .contents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, contents: &[u8]) -> io::Result<()> {
        *self.contents.write().unwrap_or_else(PoisonError::into_inner) = Some(contents.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SettingsData {
    #[serde(rename = "pass")]
    password_hash: String,

    #[serde(rename = "log_size")]
    log_size: usize,

    #[serde(rename = "media_cache")]
    media_cache_bytes: usize,
}

/// Durable, atomically updated server settings.
pub struct Settings {
    store: Box<dyn SettingsStore>,
    data: RwLock<SettingsData>,
    /// Serializes writers; held across the save instead of `data`.
    save_lock: Mutex<()>,
}

impl Settings {
    /// Loads settings from `store`, creating them on first run.
    ///
    /// When the store holds nothing yet, `initial_password` is called to
    /// obtain the password for the new settings, which are written before
    /// this returns.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read or written, the stored bytes are
    /// malformed, or the initial password cannot be obtained.
    pub fn open<S, F>(store: S, initial_password: F) -> Result<Self, SettingsError>
    where
        S: SettingsStore + 'static,
        F: FnOnce() -> Result<String, SettingsError>,
    {
        match store.load()? {
            Some(contents) => {
                let data: SettingsData = serde_json::from_slice(&contents)?;
                debug!(
                    log_size = data.log_size,
                    media_cache_bytes = data.media_cache_bytes,
                    "Loaded settings"
                );
                Ok(Self {
                    store: Box::new(store),
                    data: RwLock::new(data),
                    save_lock: Mutex::new(()),
                })
            }
            None => {
                info!("No settings found, creating new settings");
                let password = initial_password()?;
                Self::create(store, &password)
            }
        }
    }

    /// Creates fresh settings with default limits and writes them to `store`.
    ///
    /// # Errors
    ///
    /// Fails if the password is empty or the settings cannot be written.
    pub fn create<S>(store: S, password: &str) -> Result<Self, SettingsError>
    where
        S: SettingsStore + 'static,
    {
        validate_password(password)?;
        let settings = Self {
            store: Box::new(store),
            data: RwLock::new(SettingsData {
                password_hash: hash_password(password),
                log_size: DEFAULT_LOG_SIZE,
                media_cache_bytes: DEFAULT_MEDIA_CACHE_BYTES,
            }),
            save_lock: Mutex::new(()),
        };
        settings.persist(&settings.read())?;
        Ok(settings)
    }

    /// Returns `true` if `candidate` matches the stored password.
    pub fn check_password(&self, candidate: &str) -> bool {
        verify_password_hash(candidate, &self.read().password_hash)
    }

    /// Replaces the password.
    pub fn set_password(&self, password: &str) -> Result<(), SettingsError> {
        validate_password(password)?;
        let hash = hash_password(password);
        self.alter(|data| data.password_hash = hash)
    }

    /// Current per-service log retention limit (0 means unlimited).
    pub fn log_size(&self) -> usize {
        self.read().log_size
    }

    /// Sets the log retention limit.
    pub fn set_log_size(&self, log_size: usize) -> Result<(), SettingsError> {
        self.alter(|data| data.log_size = log_size)
    }

    /// Current byte budget of each media folder.
    pub fn media_cache_bytes(&self) -> usize {
        self.read().media_cache_bytes
    }

    /// Sets the media folder byte budget.
    pub fn set_media_cache_bytes(&self, bytes: usize) -> Result<(), SettingsError> {
        self.alter(|data| data.media_cache_bytes = bytes)
    }

    fn read(&self) -> RwLockReadGuard<'_, SettingsData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` to a copy, persists the copy and then publishes it.
    /// The in-memory value is untouched if the write fails.
    fn alter(&self, change: impl FnOnce(&mut SettingsData)) -> Result<(), SettingsError> {
        let _saving = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.read().clone();
        change(&mut next);
        if let Err(err) = self.persist(&next) {
            warn!(error = %err, "Failed to save settings, keeping previous values");
            return Err(err);
        }
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    fn persist(&self, data: &SettingsData) -> Result<(), SettingsError> {
        let contents = serde_json::to_vec(data)?;
        self.store.save(&contents)?;
        Ok(())
    }
}

impl StoreLimits for Settings {
    fn log_size(&self) -> usize {
        Settings::log_size(self)
    }

    fn media_cache_bytes(&self) -> usize {
        Settings::media_cache_bytes(self)
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.read();
        f.debug_struct("Settings")
            .field("password_hash", &"<redacted>")
            .field("log_size", &data.log_size)
            .field("media_cache_bytes", &data.media_cache_bytes)
            .finish()
    }
}

fn validate_password(password: &str) -> Result<(), SettingsError> {
    if password.is_empty() {
        return Err(SettingsError::Invalid("password cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    use crate::store::EventStore;

    /// Store whose writes can be made to fail on demand.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemorySettingsStore,
        fail: Arc<AtomicBool>,
    }

    impl SettingsStore for FlakyStore {
        fn load(&self) -> io::Result<Option<Vec<u8>>> {
            self.inner.load()
        }

        fn save(&self, contents: &[u8]) -> io::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.inner.save(contents)
        }
    }

    /// Store whose writes stall once `slow` is set; `saving` reports that a
    /// write is in progress.
    #[derive(Default)]
    struct SlowStore {
        inner: MemorySettingsStore,
        slow: Arc<AtomicBool>,
        saving: Arc<AtomicBool>,
    }

    impl SettingsStore for SlowStore {
        fn load(&self) -> io::Result<Option<Vec<u8>>> {
            self.inner.load()
        }

        fn save(&self, contents: &[u8]) -> io::Result<()> {
            if self.slow.load(Ordering::SeqCst) {
                self.saving.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1500));
            }
            self.inner.save(contents)
        }
    }

    fn no_prompt() -> Result<String, SettingsError> {
        panic!("should not prompt for an existing settings file");
    }

    #[test]
    fn create_uses_defaults_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let settings = Settings::create(FileSettingsStore::new(&path), "hunter2").unwrap();
        assert_eq!(settings.log_size(), DEFAULT_LOG_SIZE);
        assert_eq!(settings.media_cache_bytes(), DEFAULT_MEDIA_CACHE_BYTES);
        assert!(settings.check_password("hunter2"));
        assert!(!settings.check_password("hunter3"));

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["log_size"], 1000);
        assert_eq!(raw["media_cache"], 10_000_000);
        assert_eq!(raw["pass"], hash_password("hunter2"));
    }

    #[test]
    fn open_prompts_only_on_first_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut prompted = false;
        let first = Settings::open(FileSettingsStore::new(&path), || {
            prompted = true;
            Ok("first-pass".to_string())
        })
        .unwrap();
        assert!(prompted);
        first.set_log_size(25).unwrap();
        drop(first);

        let reopened = Settings::open(FileSettingsStore::new(&path), no_prompt).unwrap();
        assert_eq!(reopened.log_size(), 25);
        assert!(reopened.check_password("first-pass"));
    }

    #[test]
    fn open_reads_existing_file_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let contents = format!(
            r#"{{"pass":"{}","log_size":50,"media_cache":1234}}"#,
            hash_password("legacy")
        );
        fs::write(&path, contents).unwrap();

        let settings = Settings::open(FileSettingsStore::new(&path), no_prompt).unwrap();
        assert_eq!(settings.log_size(), 50);
        assert_eq!(settings.media_cache_bytes(), 1234);
        assert!(settings.check_password("legacy"));
    }

    #[test]
    fn open_rejects_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();

        let err = Settings::open(FileSettingsStore::new(&path), no_prompt).unwrap_err();
        assert!(matches!(err, SettingsError::Format(_)));
    }

    #[test]
    fn prompt_failure_is_reported() {
        let err = Settings::open(MemorySettingsStore::new(), || {
            Err(SettingsError::Prompt("not a terminal".into()))
        })
        .unwrap_err();
        assert!(matches!(err, SettingsError::Prompt(_)));
    }

    #[test]
    fn failed_write_rolls_back() {
        let store = FlakyStore::default();
        let fail = store.fail.clone();
        let settings = Settings::create(store, "original").unwrap();
        settings.set_log_size(10).unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(matches!(settings.set_log_size(99), Err(SettingsError::Io(_))));
        assert!(settings.set_media_cache_bytes(1).is_err());
        assert!(settings.set_password("changed").is_err());

        assert_eq!(settings.log_size(), 10);
        assert_eq!(settings.media_cache_bytes(), DEFAULT_MEDIA_CACHE_BYTES);
        assert!(settings.check_password("original"));
        assert!(!settings.check_password("changed"));

        fail.store(false, Ordering::SeqCst);
        settings.set_log_size(99).unwrap();
        assert_eq!(settings.log_size(), 99);
    }

    #[test]
    fn slow_write_does_not_block_store_writes() {
        let store = SlowStore::default();
        let slow = store.slow.clone();
        let saving = store.saving.clone();
        let settings = Arc::new(Settings::create(store, "pw").unwrap());
        let events = EventStore::new(settings.clone());

        slow.store(true, Ordering::SeqCst);
        let writer = {
            let settings = settings.clone();
            std::thread::spawn(move || settings.set_log_size(5))
        };
        while !saving.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        events.add("svc", "msg");
        assert_eq!(settings.log_size(), DEFAULT_LOG_SIZE);
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "store write waited {:?} on the settings file",
            started.elapsed()
        );

        writer.join().unwrap().unwrap();
        assert_eq!(settings.log_size(), 5);
    }

    #[test]
    fn empty_password_is_rejected() {
        assert!(matches!(
            Settings::create(MemorySettingsStore::new(), ""),
            Err(SettingsError::Invalid(_))
        ));

        let settings = Settings::create(MemorySettingsStore::new(), "pw").unwrap();
        assert!(matches!(
            settings.set_password(""),
            Err(SettingsError::Invalid(_))
        ));
        assert!(settings.check_password("pw"));
    }

    #[test]
    fn set_password_replaces_hash() {
        let settings = Settings::create(MemorySettingsStore::new(), "old").unwrap();
        settings.set_password("new").unwrap();
        assert!(settings.check_password("new"));
        assert!(!settings.check_password("old"));
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = FileSettingsStore::new(&path);
        store.save(b"one").unwrap();
        store.save(b"two").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn settings_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        Settings::create(FileSettingsStore::new(&path), "pw").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn debug_redacts_password_hash() {
        let settings = Settings::create(MemorySettingsStore::new(), "pw").unwrap();
        let debug = format!("{settings:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&hash_password("pw")));
    }
}
