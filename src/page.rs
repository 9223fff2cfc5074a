//! Page host interface
//!
//! The kernel never touches the DOM directly. The embedding script supplies a
//! [`PageHost`] that answers selector-presence queries for the observer hub
//! and installs fetched script/CSS bodies into the page.

/// The DOM-side collaborator the kernel is wired against.
pub trait PageHost: Send + Sync {
    /// Whether the given CSS selector currently matches an element.
    fn query(&self, selector: &str) -> bool;

    /// Install a fetched script body into the page. Deduplication by URL is
    /// the host's concern.
    fn append_script(&self, url: &str, content: &str);

    /// Install a fetched stylesheet into the page.
    fn append_css(&self, url: &str, content: &str);
}
