//! Kernel facade
//!
//! Wires the storage manager, file cache, state registry, inclusion
//! sequencer and observer hub together behind one handle and owns the
//! startup sequence: open the cache, then publish kernel readiness so
//! queued `include` calls proceed.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::FileCache;
use crate::config::KernelConfig;
use crate::error::Result;
use crate::modules::loader::{FileLoader, ResourceFetcher};
use crate::modules::{IncludeError, IncludeOutcome, ModuleTable, NocacheLists, Sequencer};
use crate::observer::{DomWatch, ObserverHub};
use crate::page::PageHost;
use crate::state::{StateCallback, StateRegistry, READY};
use crate::store::StoreManager;
use crate::version::Version;

/// The assembled kernel. Construct with [`Kernel::new`], call
/// [`Kernel::startup`] once, then share the `Arc` with every client.
pub struct Kernel {
    config: Arc<KernelConfig>,
    state: Arc<StateRegistry>,
    cache: Arc<FileCache>,
    sequencer: Arc<Sequencer>,
    observers: Arc<ObserverHub>,
    nocache: Arc<NocacheLists>,
    version: Version,
}

impl Kernel {
    pub fn new(
        config: KernelConfig,
        page: Arc<dyn PageHost>,
        fetcher: Arc<dyn ResourceFetcher>,
        table: ModuleTable,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let state = Arc::new(StateRegistry::new(config.namespace.clone()));
        let cache = Arc::new(FileCache::new(StoreManager::new(config.clone()), config.clone()));
        let nocache = Arc::new(NocacheLists::new());
        let loader = Arc::new(FileLoader::new(
            cache.clone(),
            fetcher,
            page.clone(),
            nocache.clone(),
        ));
        let sequencer = Arc::new(Sequencer::new(
            table,
            state.clone(),
            loader,
            cache.clone(),
            nocache.clone(),
        ));
        let observers = Arc::new(ObserverHub::new(
            state.clone(),
            page,
            config.poll_interval,
        ));

        Arc::new(Self {
            config,
            state,
            cache,
            sequencer,
            observers,
            nocache,
            version: Version::new(env!("CARGO_PKG_VERSION")),
        })
    }

    /// Bring the kernel up: open the cache store, then signal readiness.
    /// A failed open is logged, not fatal; the cache runs degraded and
    /// clients still come up.
    pub async fn startup(&self) {
        if let Err(e) = self.cache.open().await {
            warn!(error = %e, "file cache unavailable, running without persistence");
        }
        self.state.set(&self.state.kernel_key(), READY);
        info!(version = self.version.value(), "kernel ready");
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn state(&self) -> &Arc<StateRegistry> {
        &self.state
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    pub fn observers(&self) -> &Arc<ObserverHub> {
        &self.observers
    }

    /// Include modules by name. See [`Sequencer::include`].
    pub async fn include(&self, names: &[&str]) -> std::result::Result<IncludeOutcome, IncludeError> {
        self.sequencer.include(names).await
    }

    /// Wait until every listed module has signaled readiness.
    pub async fn ready(&self, modules: &[&str]) {
        self.state.ready(modules).await
    }

    /// Publish a module's readiness.
    pub fn set_ready(&self, module: &str) {
        self.state.set(&self.state.module_key(module), READY);
    }

    /// Wait for an arbitrary state variable. See [`StateRegistry::wait`].
    pub async fn wait_state(
        &self,
        name: &str,
        value: &str,
        callback: Option<StateCallback>,
        persistent: bool,
    ) -> String {
        self.state.wait(name, value, callback, persistent).await
    }

    /// Replace the cache-bypass lists from a user-supplied string. Items
    /// matching a module name bypass the module cache; everything else is
    /// treated as a raw file URL. Returns `(module names, file URLs)`.
    pub fn set_nocache(&self, list: &str) -> (Vec<String>, Vec<String>) {
        let lists = self.nocache.configure(list, self.sequencer.table());
        info!(modules = ?lists.0, files = ?lists.1, "cache bypass lists updated");
        lists
    }

    /// Register a DOM watch and publish its initial presence.
    pub fn observe(&self, watch: DomWatch) -> Result<()> {
        self.observers.add(watch)
    }

    /// Start the observer loop. `mutations` carries one notice per DOM
    /// mutation batch from the page host.
    pub fn run_observers(&self, mutations: mpsc::UnboundedReceiver<()>) -> JoinHandle<()> {
        self.observers.clone().run(mutations)
    }
}
