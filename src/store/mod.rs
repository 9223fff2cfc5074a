//! Storage handle manager
//!
//! Owns the single lazily-opened handle to the sled database backing the
//! file cache. The open is memoized: every caller, including callers racing
//! the first open, shares one underlying `sled` open. On first success the
//! `[dir]` sentinel record is read and seeded into the directory index.
//!
//! An unopenable store is memoized too. Under a permissive configuration the
//! handle settles to `None` and the cache degrades to pass-through mode;
//! otherwise every caller observes `StorageUnavailable`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cache::directory::{DirectoryIndex, DIR_SENTINEL};
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};

/// Handle to the open record store: one sled tree keyed by logical name,
/// values are opaque blobs.
pub struct StoreHandle {
    _db: sled::Db,
    files: sled::Tree,
}

impl StoreHandle {
    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get(name.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn put(&self, name: &str, content: &[u8]) -> Result<()> {
        self.files.insert(name.as_bytes(), content)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.files.remove(name.as_bytes())?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.files.clear()?;
        Ok(())
    }
}

/// Memoizing manager for the store handle. Also owns the directory index,
/// which mirrors the persisted sentinel record.
pub struct StoreManager {
    config: Arc<KernelConfig>,
    cell: OnceCell<Option<Arc<StoreHandle>>>,
    dir: Arc<DirectoryIndex>,
    open_attempts: AtomicU64,
}

impl StoreManager {
    pub fn new(config: Arc<KernelConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            cell: OnceCell::new(),
            dir: Arc::new(DirectoryIndex::new()),
            open_attempts: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Arc<DirectoryIndex> {
        &self.dir
    }

    /// Underlying open attempts. Stays at 1 no matter how many callers race.
    pub fn open_count(&self) -> u64 {
        self.open_attempts.load(Ordering::Relaxed)
    }

    /// Open the record store, or return the memoized handle.
    ///
    /// `Ok(None)` means "cache unavailable, operate in pass-through mode";
    /// only a permissive configuration produces it.
    pub async fn open(&self) -> Result<Option<Arc<StoreHandle>>> {
        let handle = self
            .cell
            .get_or_init(|| async {
                self.open_attempts.fetch_add(1, Ordering::Relaxed);
                match self.try_open() {
                    Ok(handle) => {
                        let handle = Arc::new(handle);
                        self.seed_directory(&handle);
                        info!(path = %self.config.db_path.display(), "record store opened");
                        Some(handle)
                    }
                    Err(e) => {
                        warn!(error = %e, path = %self.config.db_path.display(), "record store could not open");
                        self.dir.reset();
                        None
                    }
                }
            })
            .await;

        match handle {
            Some(h) => Ok(Some(h.clone())),
            None if self.config.permissive_open => Ok(None),
            None => Err(KernelError::StorageUnavailable),
        }
    }

    fn try_open(&self) -> Result<StoreHandle> {
        if let Some(parent) = self.config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = sled::Config::new().path(&self.config.db_path).open()?;
        let files = db.open_tree("files")?;
        Ok(StoreHandle { _db: db, files })
    }

    /// Read the `[dir]` sentinel into the directory index. An absent or
    /// unreadable sentinel yields an empty index (cold cache, not an error).
    fn seed_directory(&self, handle: &StoreHandle) {
        match handle.get(DIR_SENTINEL) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(entries) => {
                    self.dir.replace(entries);
                    debug!(entries = self.dir.len(), "directory index loaded");
                }
                Err(e) => {
                    warn!(error = %e, "directory sentinel unreadable, starting cold");
                    self.dir.reset();
                }
            },
            Ok(None) => self.dir.reset(),
            Err(e) => {
                warn!(error = %e, "directory sentinel read failed, starting cold");
                self.dir.reset();
            }
        }
    }
}
