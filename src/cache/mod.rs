//! Persistent file cache
//!
//! Load/save/delete/clear operations keyed by logical name, with directory
//! metadata (`added`, `lastLoaded`) and age-based eviction. Content is an
//! opaque JSON value stored 1:1 with its directory entry. Every operation
//! funnels through the store manager's single-flight open.
//!
//! Degraded mode: when the store cannot open, every operation resolves to a
//! safe empty/no-op outcome except `load`, which still fails so callers fall
//! back to the network.

pub mod directory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::store::{StoreHandle, StoreManager};
use directory::{DirEntry, DirectoryIndex};

/// Name matcher for [`FileCache::delete`].
pub enum Pattern {
    Exact(String),
    Regex(regex::Regex),
}

impl Pattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(s) => s == name,
            Pattern::Regex(re) => re.is_match(name),
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::Exact(s.to_string())
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::Exact(s)
    }
}

impl From<regex::Regex> for Pattern {
    fn from(re: regex::Regex) -> Self {
        Pattern::Regex(re)
    }
}

/// Timestamp overrides for [`FileCache::save`], used to preserve `added`
/// across metadata-only updates.
#[derive(Debug, Clone, Default)]
pub struct SaveAttribs {
    pub added: Option<DateTime<Utc>>,
    pub last_loaded: Option<DateTime<Utc>>,
}

/// The cache engine.
pub struct FileCache {
    manager: Arc<StoreManager>,
    config: Arc<KernelConfig>,
    sweep_scheduled: AtomicBool,
}

impl FileCache {
    pub fn new(manager: Arc<StoreManager>, config: Arc<KernelConfig>) -> Self {
        Self {
            manager,
            config,
            sweep_scheduled: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Arc<DirectoryIndex> {
        self.manager.dir()
    }

    /// Open (or reuse) the store handle. The first successful open schedules
    /// the deferred eviction sweep.
    pub async fn open(&self) -> Result<Option<Arc<StoreHandle>>> {
        let result = self.manager.open().await;
        if let Ok(Some(_)) = &result {
            if !self.sweep_scheduled.swap(true, Ordering::Relaxed) {
                self.spawn_sweep();
            }
        }
        result
    }

    /// Load a cached file. A missing directory entry and an orphaned record
    /// both report `NotFound`; callers use the failure to trigger a network
    /// fallback. On hit, bumps `lastLoaded` and schedules a debounced index
    /// save.
    pub async fn load(&self, name: &str) -> Result<Value> {
        let store = match self.open().await? {
            Some(s) => s,
            None => return Err(KernelError::NotFound(name.to_string())),
        };

        if self.dir().get(name).is_none() {
            return Err(KernelError::NotFound(name.to_string()));
        }

        let bytes = match store.get(name)? {
            Some(b) => b,
            None => {
                // Directory entry without a physical record; self-heal by
                // treating it as a miss.
                debug!(name = name, "orphaned directory entry");
                return Err(KernelError::NotFound(name.to_string()));
            }
        };

        self.dir().touch(name);
        self.dir_save();
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Save a file, unconditionally overwriting any existing record. The
    /// directory index is persisted before this resolves, so a resolved save
    /// is a durable one. With storage unavailable the caller still gets the
    /// name back; the value lives on in memory.
    pub async fn save(&self, name: &str, content: &Value, attribs: SaveAttribs) -> Result<String> {
        let store = match self.open().await {
            Ok(Some(s)) => s,
            _ => return Ok(name.to_string()),
        };

        store.put(name, &serde_json::to_vec(content)?)?;

        let now = Utc::now();
        self.dir().insert(
            name,
            DirEntry {
                added: attribs.added.unwrap_or(now),
                last_loaded: attribs.last_loaded.unwrap_or(now),
            },
        );
        self.dir().cancel_pending();
        self.dir().flush_now(&store)?;
        Ok(name.to_string())
    }

    /// Delete every cached file whose name matches the pattern. Returns the
    /// names actually removed; an empty list when nothing matched or storage
    /// is unavailable, never an error for "nothing to delete".
    pub async fn delete(&self, pattern: impl Into<Pattern>) -> Result<Vec<String>> {
        let store = match self.open().await {
            Ok(Some(s)) => s,
            _ => return Ok(Vec::new()),
        };
        let pattern = pattern.into();

        let matched: Vec<String> = self
            .dir()
            .keys()
            .into_iter()
            .filter(|name| pattern.matches(name))
            .collect();

        for name in &matched {
            store.remove(name)?;
            self.dir().remove(name);
        }
        if !matched.is_empty() {
            self.dir_save();
        }
        Ok(matched)
    }

    /// Empty the index and the underlying store entirely. Used for
    /// cross-identity cache invalidation.
    pub async fn clear(&self) -> Result<()> {
        self.dir().reset();
        let store = match self.open().await {
            Ok(Some(s)) => s,
            _ => return Ok(()),
        };
        store.clear()?;
        Ok(())
    }

    /// Evict entries whose `lastLoaded` predates the retention window.
    /// Names under the settings prefix are exempt regardless of age.
    pub async fn cleanup(&self) -> Result<Vec<String>> {
        sweep(&self.manager, &self.config).await
    }

    /// Sorted logical names currently in the directory.
    pub fn ls(&self) -> Vec<String> {
        let mut names = self.dir().keys();
        names.sort();
        names
    }

    /// Force an immediate save of the directory index.
    pub async fn flush(&self) -> Result<()> {
        if let Ok(Some(store)) = self.open().await {
            self.dir().cancel_pending();
            self.dir().flush_now(&store)?;
        }
        Ok(())
    }

    fn dir_save(&self) {
        DirectoryIndex::schedule_save(self.dir().clone(), self.manager.clone(), self.config.debounce);
    }

    fn spawn_sweep(&self) {
        // Weak so a waiting sweep does not keep the store (and its lock)
        // alive past the cache's own lifetime.
        let manager = Arc::downgrade(&self.manager);
        let config = self.config.clone();
        tokio::spawn(async move {
            tokio::time::sleep(config.cleanup_delay).await;
            loop {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = sweep(&manager, &config).await {
                    tracing::warn!(error = %e, "cache eviction sweep failed");
                }
                drop(manager);
                match config.cleanup_interval {
                    Some(interval) => tokio::time::sleep(interval).await,
                    None => break,
                }
            }
        });
    }
}

/// One eviction pass over the directory. Returns the evicted names.
async fn sweep(manager: &Arc<StoreManager>, config: &Arc<KernelConfig>) -> Result<Vec<String>> {
    let store = match manager.open().await {
        Ok(Some(s)) => s,
        _ => return Ok(Vec::new()),
    };

    let threshold = Utc::now()
        - chrono::Duration::from_std(config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(14));

    let old: Vec<String> = manager
        .dir()
        .snapshot()
        .into_iter()
        .filter(|(name, entry)| {
            !name.starts_with(&config.settings_prefix) && entry.last_loaded < threshold
        })
        .map(|(name, _)| name)
        .collect();

    if old.is_empty() {
        return Ok(old);
    }

    info!(count = old.len(), "evicting stale cache entries");
    for name in &old {
        debug!(name = %name, "evicted");
        store.remove(name)?;
        manager.dir().remove(name);
    }
    DirectoryIndex::schedule_save(manager.dir().clone(), manager.clone(), config.debounce);
    Ok(old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::directory::DIR_SENTINEL;
    use std::collections::HashMap;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn cache_at(temp: &TempDir) -> FileCache {
        let config = Arc::new(KernelConfig {
            db_path: temp.path().join("files.sled"),
            ..KernelConfig::default()
        });
        FileCache::new(StoreManager::new(config.clone()), config)
    }

    fn unavailable_cache(temp: &TempDir) -> FileCache {
        let path = temp.path().join("blocked");
        std::fs::write(&path, b"not a database").unwrap();
        let config = Arc::new(KernelConfig {
            db_path: path,
            permissive_open: true,
            ..KernelConfig::default()
        });
        FileCache::new(StoreManager::new(config.clone()), config)
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache = cache_at(&temp);

        let content = serde_json::json!({ "data": { "apikey": "abc" } });
        let name = cache
            .save("Mod.user", &content, SaveAttribs::default())
            .await
            .unwrap();
        assert_eq!(name, "Mod.user");

        let loaded = cache.load("Mod.user").await.unwrap();
        assert_eq!(loaded, content);
    }

    #[tokio::test]
    async fn test_load_miss_is_not_found() {
        let temp = TempDir::new().unwrap();
        let cache = cache_at(&temp);
        assert!(matches!(
            cache.load("never.cached").await,
            Err(KernelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_durable_before_resolve() {
        let temp = TempDir::new().unwrap();
        let cache = cache_at(&temp);

        cache
            .save("Mod.user", &serde_json::json!(1), SaveAttribs::default())
            .await
            .unwrap();

        // The persisted sentinel already contains the entry.
        let store = cache.open().await.unwrap().unwrap();
        let bytes = store.get(DIR_SENTINEL).unwrap().unwrap();
        let persisted: HashMap<String, DirEntry> = serde_json::from_slice(&bytes).unwrap();
        assert!(persisted.contains_key("Mod.user"));
    }

    #[tokio::test]
    async fn test_delete_by_regex() {
        let temp = TempDir::new().unwrap();
        let cache = cache_at(&temp);

        for name in ["Apiv2.user", "Apiv2.subjects", "Other.file"] {
            cache
                .save(name, &serde_json::json!(1), SaveAttribs::default())
                .await
                .unwrap();
        }

        let removed = cache
            .delete(regex::Regex::new(r"^Apiv2\.").unwrap())
            .await
            .unwrap();
        let removed: HashSet<String> = removed.into_iter().collect();
        let expected: HashSet<String> = ["Apiv2.user", "Apiv2.subjects"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(removed, expected);

        assert!(matches!(
            cache.load("Apiv2.user").await,
            Err(KernelError::NotFound(_))
        ));
        assert!(cache.load("Other.file").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_nothing_is_empty_not_error() {
        let temp = TempDir::new().unwrap();
        let cache = cache_at(&temp);
        assert!(cache.delete("no.such.file").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_empties_everything() {
        let temp = TempDir::new().unwrap();
        let cache = cache_at(&temp);
        cache
            .save("a", &serde_json::json!(1), SaveAttribs::default())
            .await
            .unwrap();
        cache.clear().await.unwrap();
        assert!(cache.ls().is_empty());
        assert!(cache.load("a").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_respects_settings_exemption() {
        let temp = TempDir::new().unwrap();
        let cache = cache_at(&temp);

        let stale = Utc::now() - chrono::Duration::days(30);
        let old_attribs = SaveAttribs {
            added: Some(stale),
            last_loaded: Some(stale),
        };
        cache
            .save("pagekit.settings.myscript", &serde_json::json!(1), old_attribs.clone())
            .await
            .unwrap();
        cache
            .save("Mod.data", &serde_json::json!(2), old_attribs)
            .await
            .unwrap();
        cache
            .save("Mod.fresh", &serde_json::json!(3), SaveAttribs::default())
            .await
            .unwrap();

        let evicted = cache.cleanup().await.unwrap();
        assert_eq!(evicted, vec!["Mod.data".to_string()]);

        assert!(cache.load("pagekit.settings.myscript").await.is_ok());
        assert!(cache.load("Mod.fresh").await.is_ok());
        assert!(matches!(
            cache.load("Mod.data").await,
            Err(KernelError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_saves_coalesce() {
        let temp = TempDir::new().unwrap();
        let cache = cache_at(&temp);

        cache
            .save("Mod.user", &serde_json::json!(1), SaveAttribs::default())
            .await
            .unwrap();
        let after_save = cache.dir().flush_count();

        // A burst of loads schedules (and reschedules) one debounced save.
        for _ in 0..5 {
            cache.load("Mod.user").await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;

        assert_eq!(cache.dir().flush_count(), after_save + 1);

        // The single write carries the state after the whole burst.
        let in_memory = cache.dir().get("Mod.user").unwrap();
        let store = cache.open().await.unwrap().unwrap();
        let bytes = store.get(DIR_SENTINEL).unwrap().unwrap();
        let persisted: HashMap<String, DirEntry> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(persisted.get("Mod.user"), Some(&in_memory));
    }

    #[tokio::test]
    async fn test_degraded_mode() {
        let temp = TempDir::new().unwrap();
        let cache = unavailable_cache(&temp);

        // save resolves with the name, delete and clear are no-ops.
        assert_eq!(
            cache
                .save("a", &serde_json::json!(1), SaveAttribs::default())
                .await
                .unwrap(),
            "a"
        );
        assert!(cache.delete("a").await.unwrap().is_empty());
        cache.clear().await.unwrap();
        assert!(cache.cleanup().await.unwrap().is_empty());

        // load still fails, triggering the caller's network fallback.
        assert!(cache.load("a").await.is_err());
    }
}
