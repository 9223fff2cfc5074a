//! pagekit - a page-augmentation kernel
//!
//! The shared runtime a family of page-augmentation scripts builds on: a
//! persistent file/module cache, a readiness-coordination state registry,
//! a module inclusion sequencer and a selector-watch observer hub, wired
//! together behind the [`Kernel`] facade.
//!
//! ## Components
//!
//! - [`store`]: single-flight open of the sled record store backing the cache
//! - [`cache`]: file cache with directory metadata and age-based eviction
//! - [`state`]: named state variables with listener/wait semantics
//! - [`modules`]: module table, inclusion sequencer and cache-first loading
//! - [`observer`]: named selector watches republished as state variables
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pagekit::{Kernel, KernelConfig, ModuleTable};
//! use pagekit::modules::loader::HttpFetcher;
//! # use pagekit::testing::FakePage;
//!
//! # async fn run() {
//! let config = KernelConfig::from_env();
//! let fetcher = Arc::new(HttpFetcher::new(&config));
//! let page = Arc::new(FakePage::new());
//! let table = ModuleTable::from_iter([("Menu", "https://host/menu.js")]);
//!
//! let kernel = Kernel::new(config, page, fetcher, table);
//! kernel.startup().await;
//! kernel.include(&["Menu"]).await.unwrap();
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod kernel;
pub mod modules;
pub mod observer;
pub mod page;
pub mod state;
pub mod store;
pub mod testing;
pub mod version;

pub use cache::directory::DirEntry;
pub use cache::{FileCache, Pattern, SaveAttribs};
pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use kernel::Kernel;
pub use modules::loader::{FileLoader, HttpFetcher, ResourceFetcher};
pub use modules::{FailedInclude, IncludeError, IncludeOutcome, ModuleTable};
pub use observer::{DomWatch, ObserverHub};
pub use page::PageHost;
pub use state::{StateCallback, StateRegistry};
pub use version::{Version, VersionOrder};
