//! Test doubles for the kernel's collaborator seams
//!
//! Used by the crate's own unit and integration tests: a selector-set backed
//! [`PageHost`] and a counting [`ResourceFetcher`]. Kept small and
//! dependency-free; embedders may also find them useful for harnessing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{KernelError, Result};
use crate::modules::loader::ResourceFetcher;
use crate::page::PageHost;

/// Page host backed by a set of "present" selectors.
pub struct FakePage {
    present: Mutex<HashSet<String>>,
    scripts: Mutex<HashMap<String, String>>,
    styles: Mutex<HashMap<String, String>>,
}

impl FakePage {
    pub fn new() -> Self {
        Self {
            present: Mutex::new(HashSet::new()),
            scripts: Mutex::new(HashMap::new()),
            styles: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a selector as currently matching.
    pub fn add_selector(&self, selector: &str) {
        self.present.lock().unwrap().insert(selector.to_string());
    }

    pub fn remove_selector(&self, selector: &str) {
        self.present.lock().unwrap().remove(selector);
    }

    pub fn installed_script(&self, url: &str) -> Option<String> {
        self.scripts.lock().unwrap().get(url).cloned()
    }

    pub fn installed_css(&self, url: &str) -> Option<String> {
        self.styles.lock().unwrap().get(url).cloned()
    }
}

impl Default for FakePage {
    fn default() -> Self {
        Self::new()
    }
}

impl PageHost for FakePage {
    fn query(&self, selector: &str) -> bool {
        self.present.lock().unwrap().contains(selector)
    }

    fn append_script(&self, url: &str, content: &str) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), content.to_string());
    }

    fn append_css(&self, url: &str, content: &str) {
        self.styles
            .lock()
            .unwrap()
            .insert(url.to_string(), content.to_string());
    }
}

/// Fetcher returning a fixed body (or a fixed failure) and counting calls.
pub struct CountingFetcher {
    body: std::result::Result<String, String>,
    calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn ok(body: &str) -> Self {
        Self {
            body: Ok(body.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            body: Err(reason.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of fetches issued.
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Yield once so concurrent callers genuinely interleave.
        tokio::task::yield_now().await;
        match &self.body {
            Ok(body) => Ok(body.clone()),
            Err(reason) => Err(KernelError::FetchFailed {
                url: url.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}
