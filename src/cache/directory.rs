//! Directory index for the file cache
//!
//! An in-memory `name -> { added, lastLoaded }` map persisted as a single
//! JSON blob under the reserved `[dir]` record. Mutations are cheap and
//! eager; persistence is debounced so a burst of N updates costs one write,
//! issued one debounce window after the last mutation. An immediate flush
//! short-circuits the timer for callers that need a durable index before
//! proceeding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{StoreHandle, StoreManager};

/// Reserved record name holding the serialized directory index.
pub const DIR_SENTINEL: &str = "[dir]";

/// Provenance metadata for one cached record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub added: DateTime<Utc>,
    #[serde(rename = "lastLoaded")]
    pub last_loaded: DateTime<Utc>,
}

impl DirEntry {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            added: now,
            last_loaded: now,
        }
    }
}

/// The directory index. Owned by the store manager and shared with the
/// cache engine; all mutation goes through these methods.
pub struct DirectoryIndex {
    entries: Mutex<HashMap<String, DirEntry>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    flushes: AtomicU64,
}

impl DirectoryIndex {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(None),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn get(&self, name: &str) -> Option<DirEntry> {
        self.lock_entries().get(name).cloned()
    }

    pub fn insert(&self, name: &str, entry: DirEntry) {
        self.lock_entries().insert(name.to_string(), entry);
    }

    pub fn remove(&self, name: &str) -> Option<DirEntry> {
        self.lock_entries().remove(name)
    }

    /// Update `lastLoaded` for an existing entry. No-op if absent.
    pub fn touch(&self, name: &str) {
        if let Some(entry) = self.lock_entries().get_mut(name) {
            entry.last_loaded = Utc::now();
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock_entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Snapshot of every entry, for enumeration and eviction scans.
    pub fn snapshot(&self) -> Vec<(String, DirEntry)> {
        self.lock_entries()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace the whole index, e.g. when seeding from the persisted
    /// sentinel on open.
    pub fn replace(&self, entries: HashMap<String, DirEntry>) {
        *self.lock_entries() = entries;
    }

    pub fn reset(&self) {
        self.lock_entries().clear();
    }

    /// Number of persisted index writes issued so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Cancel any pending debounced save.
    pub fn cancel_pending(&self) {
        if let Some(handle) = self.lock_pending().take() {
            handle.abort();
        }
    }

    /// Persist the index now. The serialized form reflects the in-memory
    /// state at flush time, never an earlier snapshot.
    pub fn flush_now(&self, store: &StoreHandle) -> Result<()> {
        let bytes = {
            let entries = self.lock_entries();
            serde_json::to_vec(&*entries)?
        };
        store.put(DIR_SENTINEL, &bytes)?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(entries = self.len(), "directory index persisted");
        Ok(())
    }

    /// Schedule a debounced save. A new call cancels and reschedules any
    /// pending one, so N rapid mutations cost exactly one write.
    pub fn schedule_save(dir: Arc<DirectoryIndex>, manager: Arc<StoreManager>, delay: Duration) {
        dir.cancel_pending();
        let task_dir = dir.clone();
        // Weak so a pending save never outlives the store it would write to.
        let manager = Arc::downgrade(&manager);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if let Ok(Some(store)) = manager.open().await {
                if let Err(e) = task_dir.flush_now(&store) {
                    warn!(error = %e, "debounced directory save failed");
                }
            }
        });
        *dir.lock_pending() = Some(handle);
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, DirEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for DirectoryIndex {
    fn default() -> Self {
        Self::new()
    }
}
