//! Shared store module.
//!
//! A directory-backed key-value store visible to every process on the
//! device. Each key lives in its own file and writes replace that file
//! atomically. Every `LocalStore` opened on a directory is one context:
//! changes written by other contexts are reported to its listeners as
//! storage events, its own writes never are.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// How often the event scanner looks for foreign writes by default.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(250);

// In-flight temp files start with a dot, as do rejected keys
const HIDDEN_PREFIX: char = '.';
const TEMP_PREFIX: &str = ".tmp-";

/// Errors that can occur while accessing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid key: {0:?}")]
    InvalidKey(String),
}

/// A change made to the store by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

/// Callback type for storage events.
pub type StorageListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

struct ListenerState {
    next_id: u64,
    listeners: Vec<(u64, StorageListener)>,
    scanning: bool,
}

struct Inner {
    dir: PathBuf,
    scan_interval: Duration,
    /// Contents as this context last saw them. `None` while no scanner runs.
    known: Mutex<Option<HashMap<String, String>>>,
    listeners: Mutex<ListenerState>,
}

/// Handle to the shared store. Clones share one context.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    /// Opens the store at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::with_scan_interval(dir, DEFAULT_SCAN_INTERVAL)
    }

    /// Opens the store with a custom storage event scan interval.
    pub fn with_scan_interval(
        dir: impl Into<PathBuf>,
        scan_interval: Duration,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                scan_interval,
                known: Mutex::new(None),
                listeners: Mutex::new(ListenerState {
                    next_id: 0,
                    listeners: Vec::new(),
                    scanning: false,
                }),
            }),
        })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Reads the value stored under `key`.
    pub fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.inner.path_for(key)?;
        match fs::read_to_string(path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the value stored under `key`.
    pub fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.inner.path_for(key)?;

        // Held across the write so the scanner never mistakes it for a foreign one
        let mut known = self.inner.known.lock();

        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.inner.dir)?;
        file.write_all(value.as_bytes())?;
        file.persist(&path).map_err(|e| e.error)?;

        if let Some(known) = known.as_mut() {
            known.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Removes `key` from the store. Removing a missing key is not an error.
    pub fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        let path = self.inner.path_for(key)?;
        let mut known = self.inner.known.lock();

        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(known) = known.as_mut() {
            known.remove(key);
        }
        Ok(())
    }

    /// Registers a listener for changes made by other contexts.
    ///
    /// Writes made after this returns are reported. The listener stays
    /// registered until the returned subscription is dropped.
    pub fn listen(&self, listener: StorageListener) -> Subscription {
        let mut state = self.inner.listeners.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, listener));

        if !state.scanning {
            // Baseline first so existing content is not reported
            self.inner.scan();

            let inner = Arc::clone(&self.inner);
            match thread::Builder::new()
                .name("store-events".to_string())
                .spawn(move || scan_loop(inner))
            {
                Ok(_) => {
                    state.scanning = true;
                    log::debug!("Storage event scanner started for {:?}", self.inner.dir);
                }
                Err(e) => {
                    log::error!("Failed to start storage event scanner: {}", e);
                    *self.inner.known.lock() = None;
                }
            }
        }

        Subscription {
            inner: Arc::clone(&self.inner),
            id,
        }
    }
}

impl Inner {
    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.starts_with(HIDDEN_PREFIX) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(urlencoding::encode(key).as_ref()))
    }

    /// Diffs the directory against the last known contents.
    fn scan(&self) -> Vec<StorageEvent> {
        let mut known = self.known.lock();

        let current = match read_all(&self.dir) {
            Ok(current) => current,
            Err(e) => {
                log::warn!("Failed to scan store {:?}: {}", self.dir, e);
                return Vec::new();
            }
        };

        if known.is_none() {
            *known = Some(current);
            return Vec::new();
        }
        let Some(previous) = known.as_mut() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for (key, value) in &current {
            let old_value = previous.get(key);
            if old_value != Some(value) {
                events.push(StorageEvent {
                    key: key.clone(),
                    old_value: old_value.cloned(),
                    new_value: Some(value.clone()),
                });
            }
        }
        for (key, old_value) in previous.iter() {
            if !current.contains_key(key) {
                events.push(StorageEvent {
                    key: key.clone(),
                    old_value: Some(old_value.clone()),
                    new_value: None,
                });
            }
        }

        *previous = current;
        events
    }
}

/// Reads every stored key and value.
fn read_all(dir: &Path) -> io::Result<HashMap<String, String>> {
    let mut contents = HashMap::new();

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("Skipping unreadable store entry in {:?}: {}", dir, e);
                continue;
            }
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(HIDDEN_PREFIX) {
            continue;
        }
        let Ok(key) = urlencoding::decode(name) else {
            continue;
        };

        match fs::read_to_string(entry.path()) {
            Ok(value) => {
                contents.insert(key.into_owned(), value);
            }
            // Removed since read_dir
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                log::debug!("Skipping store entry {:?}: {}", name, e);
            }
        }
    }

    Ok(contents)
}

/// Scanner loop, exits once the last listener is gone.
fn scan_loop(inner: Arc<Inner>) {
    loop {
        thread::sleep(inner.scan_interval);

        let listeners: Vec<StorageListener> = {
            let mut state = inner.listeners.lock();
            if state.listeners.is_empty() {
                state.scanning = false;
                *inner.known.lock() = None;
                break;
            }
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        // Listeners run outside of the locks
        for event in inner.scan() {
            log::debug!(
                "Storage event for key {:?} ({} -> {})",
                event.key,
                if event.old_value.is_some() { "set" } else { "unset" },
                if event.new_value.is_some() { "set" } else { "unset" }
            );
            for listener in &listeners {
                listener(&event);
            }
        }
    }

    log::debug!("Storage event scanner stopped for {:?}", inner.dir);
}

/// Keeps a storage listener registered while alive.
pub struct Subscription {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.inner.listeners.lock();
        state.listeners.retain(|(id, _)| *id != self.id);
    }
}
