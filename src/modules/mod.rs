//! Module inclusion
//!
//! The sequencer resolves module names against a static table, loads each
//! script (cache-first) and aggregates success/failure across the whole
//! request. Concurrent `include` calls for the same module share one
//! in-flight load: the pending future is inserted into the map before the
//! first suspension point, and repeated calls for an already-resolved module
//! reuse the settled future.

pub mod loader;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use thiserror::Error;
use tracing::debug;

use crate::cache::FileCache;
use crate::state::StateRegistry;
use loader::FileLoader;

/// One supported module: a name resolvable to a script URL.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub url: String,
}

/// Static module table, injected at kernel construction.
#[derive(Debug, Clone, Default)]
pub struct ModuleTable {
    entries: HashMap<String, ModuleDescriptor>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, url: impl Into<String>) {
        self.entries
            .insert(name.into(), ModuleDescriptor { url: url.into() });
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl<N: Into<String>, U: Into<String>> FromIterator<(N, U)> for ModuleTable {
    fn from_iter<T: IntoIterator<Item = (N, U)>>(iter: T) -> Self {
        let mut table = Self::new();
        for (name, url) in iter {
            table.insert(name, url);
        }
        table
    }
}

/// Per-item failure in an aggregate include: an unknown name, or a URL that
/// could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedInclude {
    pub name: Option<String>,
    pub url: Option<String>,
}

/// Successful include outcome: the script URLs that loaded.
#[derive(Debug, Clone, Default)]
pub struct IncludeOutcome {
    pub loaded: Vec<String>,
}

/// Aggregate include failure. Carries the partial successes alongside the
/// itemized failures so callers can decide whether partial functionality is
/// acceptable.
#[derive(Debug, Error)]
#[error("failure loading modules: {} failed", .failed.len())]
pub struct IncludeError {
    pub loaded: Vec<String>,
    pub failed: Vec<FailedInclude>,
}

/// User-settable cache-bypass lists. Module names and raw file URLs are
/// independent; `"*"` disables caching for the whole category.
pub struct NocacheLists {
    modules: Mutex<HashSet<String>>,
    files: Mutex<HashSet<String>>,
}

impl NocacheLists {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(HashSet::new()),
            files: Mutex::new(HashSet::new()),
        }
    }

    pub fn bypass_module(&self, name: &str) -> bool {
        let modules = self.modules.lock().unwrap_or_else(|e| e.into_inner());
        modules.contains(name) || modules.contains("*")
    }

    pub fn bypass_file(&self, url: &str) -> bool {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.contains(url) || files.contains("*")
    }

    pub fn set_modules<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.modules.lock().unwrap_or_else(|e| e.into_inner()) =
            names.into_iter().map(Into::into).collect();
    }

    pub fn set_files<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.files.lock().unwrap_or_else(|e| e.into_inner()) =
            urls.into_iter().map(Into::into).collect();
    }

    /// Parse a user-supplied bypass list and split it into module names vs
    /// URLs against the module table. Returns the two resulting lists.
    pub fn configure(&self, input: &str, table: &ModuleTable) -> (Vec<String>, Vec<String>) {
        let mut modules = Vec::new();
        let mut files = Vec::new();
        for item in split_list(input) {
            if item == "*" {
                modules.push(item.clone());
                files.push(item);
            } else if table.contains(&item) {
                modules.push(item);
            } else {
                files.push(item);
            }
        }
        self.set_modules(modules.clone());
        self.set_files(files.clone());
        (modules, files)
    }

    /// Current bypass lists: `(module names, file URLs)`.
    pub fn snapshot(&self) -> (Vec<String>, Vec<String>) {
        let mut modules: Vec<String> = self
            .modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        let mut files: Vec<String> = self
            .files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        modules.sort();
        files.sort();
        (modules, files)
    }
}

impl Default for NocacheLists {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a comma / full-width-comma / whitespace separated list.
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(|c: char| c == ',' || c == '\u{3001}' || c == '\u{ff0c}' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

type PendingLoad = Shared<BoxFuture<'static, Result<String, FailedInclude>>>;

/// The inclusion sequencer.
pub struct Sequencer {
    table: ModuleTable,
    pending: Mutex<HashMap<String, PendingLoad>>,
    state: Arc<StateRegistry>,
    loader: Arc<FileLoader>,
    cache: Arc<FileCache>,
    nocache: Arc<NocacheLists>,
}

impl Sequencer {
    pub fn new(
        table: ModuleTable,
        state: Arc<StateRegistry>,
        loader: Arc<FileLoader>,
        cache: Arc<FileCache>,
        nocache: Arc<NocacheLists>,
    ) -> Self {
        Self {
            table,
            pending: Mutex::new(HashMap::new()),
            state,
            loader,
            cache,
            nocache,
        }
    }

    pub fn table(&self) -> &ModuleTable {
        &self.table
    }

    /// Include a list of modules. Waits for kernel readiness first; unknown
    /// names fail without a network attempt. The result settles only after
    /// every requested name's outcome is known, and any failure rejects with
    /// both the partial `loaded` and the itemized `failed` lists.
    pub async fn include(&self, names: &[&str]) -> Result<IncludeOutcome, IncludeError> {
        self.state
            .wait(&self.state.kernel_key(), crate::state::READY, None, false)
            .await;

        let mut failed = Vec::new();
        let mut waits = Vec::new();

        for name in names {
            let descriptor = match self.table.get(name) {
                Some(d) => d.clone(),
                None => {
                    debug!(module = name, "unknown module");
                    failed.push(FailedInclude {
                        name: Some(name.to_string()),
                        url: None,
                    });
                    continue;
                }
            };

            let use_cache = !self.nocache.bypass_module(name);
            if !use_cache {
                // Force re-fetch: drop the cached copy before loading.
                let _ = self.cache.delete(descriptor.url.as_str()).await;
            }

            // Insert before the first await so concurrent includes share
            // one load.
            let pending = {
                let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                map.entry(name.to_string())
                    .or_insert_with(|| {
                        let loader = self.loader.clone();
                        let url = descriptor.url.clone();
                        async move {
                            loader
                                .load_script(&url, use_cache)
                                .await
                                .map_err(|_| FailedInclude {
                                    name: None,
                                    url: Some(url),
                                })
                        }
                        .boxed()
                        .shared()
                    })
                    .clone()
            };
            waits.push(pending);
        }

        let mut loaded = Vec::new();
        for wait in waits {
            match wait.await {
                Ok(url) => loaded.push(url),
                Err(item) => failed.push(item),
            }
        }

        if failed.is_empty() {
            Ok(IncludeOutcome { loaded })
        } else {
            Err(IncludeError { loaded, failed })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::store::StoreManager;
    use crate::testing::{CountingFetcher, FakePage};
    use tempfile::TempDir;

    fn sequencer_at(
        temp: &TempDir,
        fetcher: Arc<CountingFetcher>,
        table: ModuleTable,
    ) -> (Arc<Sequencer>, Arc<StateRegistry>) {
        let config = Arc::new(KernelConfig {
            db_path: temp.path().join("files.sled"),
            ..KernelConfig::default()
        });
        let state = Arc::new(StateRegistry::new(config.namespace.clone()));
        let cache = Arc::new(FileCache::new(StoreManager::new(config.clone()), config));
        let nocache = Arc::new(NocacheLists::new());
        let loader = Arc::new(FileLoader::new(
            cache.clone(),
            fetcher,
            Arc::new(FakePage::new()),
            nocache.clone(),
        ));
        let sequencer = Arc::new(Sequencer::new(
            table,
            state.clone(),
            loader,
            cache,
            nocache,
        ));
        state.set(&state.kernel_key(), crate::state::READY);
        (sequencer, state)
    }

    fn one_module_table() -> ModuleTable {
        ModuleTable::from_iter([("Menu", "https://x/menu.js")])
    }

    #[tokio::test]
    async fn test_unknown_module_fails_without_fetch() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::ok("body"));
        let (sequencer, _state) = sequencer_at(&temp, fetcher.clone(), one_module_table());

        let err = sequencer.include(&["Unknown"]).await.unwrap_err();
        assert!(err.loaded.is_empty());
        assert_eq!(
            err.failed,
            vec![FailedInclude {
                name: Some("Unknown".to_string()),
                url: None,
            }]
        );
        assert_eq!(fetcher.count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_includes_share_one_fetch() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::ok("body"));
        let (sequencer, _state) = sequencer_at(&temp, fetcher.clone(), one_module_table());

        let (a, b, c) = tokio::join!(
            sequencer.include(&["Menu"]),
            sequencer.include(&["Menu"]),
            sequencer.include(&["Menu"]),
        );
        for outcome in [a, b, c] {
            assert_eq!(outcome.unwrap().loaded, vec!["https://x/menu.js"]);
        }
        assert_eq!(fetcher.count(), 1);

        // A later include reuses the settled future.
        sequencer.include(&["Menu"]).await.unwrap();
        assert_eq!(fetcher.count(), 1);
    }

    #[tokio::test]
    async fn test_all_callers_observe_the_shared_failure() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::failing("boom"));
        let (sequencer, _state) = sequencer_at(&temp, fetcher.clone(), one_module_table());

        let (a, b) = tokio::join!(sequencer.include(&["Menu"]), sequencer.include(&["Menu"]));
        for outcome in [a, b] {
            let err = outcome.unwrap_err();
            assert_eq!(
                err.failed,
                vec![FailedInclude {
                    name: None,
                    url: Some("https://x/menu.js".to_string()),
                }]
            );
        }
        assert_eq!(fetcher.count(), 1);
    }

    #[tokio::test]
    async fn test_mixed_outcome_carries_both_lists() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::ok("body"));
        let (sequencer, _state) = sequencer_at(&temp, fetcher, one_module_table());

        let err = sequencer.include(&["Menu", "Unknown"]).await.unwrap_err();
        assert_eq!(err.loaded, vec!["https://x/menu.js"]);
        assert_eq!(err.failed.len(), 1);
        assert_eq!(err.failed[0].name.as_deref(), Some("Unknown"));
    }

    #[tokio::test]
    async fn test_include_waits_for_kernel_readiness() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::ok("body"));
        let config = Arc::new(KernelConfig {
            db_path: temp.path().join("files.sled"),
            ..KernelConfig::default()
        });
        let state = Arc::new(StateRegistry::new(config.namespace.clone()));
        let cache = Arc::new(FileCache::new(StoreManager::new(config.clone()), config));
        let nocache = Arc::new(NocacheLists::new());
        let loader = Arc::new(FileLoader::new(
            cache.clone(),
            fetcher,
            Arc::new(FakePage::new()),
            nocache.clone(),
        ));
        let sequencer = Arc::new(Sequencer::new(
            one_module_table(),
            state.clone(),
            loader,
            cache,
            nocache,
        ));

        let seq = sequencer.clone();
        let include = tokio::spawn(async move { seq.include(&["Menu"]).await });
        tokio::task::yield_now().await;
        assert!(!include.is_finished());

        state.set(&state.kernel_key(), crate::state::READY);
        include.await.unwrap().unwrap();
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,c"), vec!["a", "b", "c"]);
        assert_eq!(split_list("a\u{3001}b"), vec!["a", "b"]);
        assert_eq!(split_list("  a\u{3000}b  "), vec!["a", "b"]);
        assert!(split_list("  ,, ").is_empty());
    }

    #[test]
    fn test_nocache_configure_splits_by_table() {
        let nocache = NocacheLists::new();
        let table = one_module_table();
        let (modules, files) = nocache.configure("Menu, https://x/raw.js", &table);
        assert_eq!(modules, vec!["Menu"]);
        assert_eq!(files, vec!["https://x/raw.js"]);
        assert!(nocache.bypass_module("Menu"));
        assert!(nocache.bypass_file("https://x/raw.js"));
        assert!(!nocache.bypass_module("Settings"));
    }
}
