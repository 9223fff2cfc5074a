//! Configuration for the pagekit kernel
//!
//! Defaults match the behavior of the deployed framework; every knob can be
//! overridden through `PAGEKIT_*` environment variables via [`KernelConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the kernel and its components.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Namespace prefix for state variables and reserved cache keys.
    pub namespace: String,
    /// Path to the sled database backing the file cache.
    pub db_path: PathBuf,
    /// Debounce window for directory index persistence (default: 2 s).
    pub debounce: Duration,
    /// Retention window for cache eviction by last-loaded age (default: 14 days).
    pub retention: Duration,
    /// Delay before the post-open eviction sweep (default: 10 s).
    pub cleanup_delay: Duration,
    /// Re-sweep interval. `None` (the default) runs a single sweep per
    /// process lifetime, matching the deployed behavior.
    pub cleanup_interval: Option<Duration>,
    /// Cache keys with this prefix are exempt from time-based eviction.
    pub settings_prefix: String,
    /// When true, an unopenable store degrades to a null handle
    /// (pass-through mode) instead of an error.
    pub permissive_open: bool,
    /// Fallback poll interval for the DOM observer (default: 100 ms).
    pub poll_interval: Duration,
    /// Maximum fetch attempts while rate-limited (default: 40).
    pub fetch_max_attempts: u32,
    /// Linear backoff step between rate-limited attempts (default: 500 ms).
    pub fetch_backoff_step: Duration,
    /// Backoff ceiling (default: 5 s).
    pub fetch_backoff_cap: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            namespace: "pagekit".to_string(),
            db_path: PathBuf::from(".pagekit").join("files.sled"),
            debounce: Duration::from_secs(2),
            retention: Duration::from_secs(14 * 24 * 60 * 60),
            cleanup_delay: Duration::from_secs(10),
            cleanup_interval: None,
            settings_prefix: "pagekit.settings.".to_string(),
            permissive_open: false,
            poll_interval: Duration::from_millis(100),
            fetch_max_attempts: 40,
            fetch_backoff_step: Duration::from_millis(500),
            fetch_backoff_cap: Duration::from_secs(5),
        }
    }
}

impl KernelConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PAGEKIT_NAMESPACE") {
            config.settings_prefix = format!("{val}.settings.");
            config.namespace = val;
        }

        if let Ok(val) = std::env::var("PAGEKIT_SETTINGS_PREFIX") {
            config.settings_prefix = val;
        }

        if let Ok(val) = std::env::var("PAGEKIT_DB_PATH") {
            config.db_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("PAGEKIT_DEBOUNCE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.debounce = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("PAGEKIT_RETENTION_DAYS") {
            if let Ok(days) = val.parse::<u64>() {
                config.retention = Duration::from_secs(days * 24 * 60 * 60);
            }
        }

        if let Ok(val) = std::env::var("PAGEKIT_CLEANUP_DELAY_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.cleanup_delay = Duration::from_secs(secs);
            }
        }

        if let Ok(val) = std::env::var("PAGEKIT_CLEANUP_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.cleanup_interval = Some(Duration::from_secs(secs));
            }
        }

        if let Ok(val) = std::env::var("PAGEKIT_PERMISSIVE_OPEN") {
            config.permissive_open = val == "1" || val.eq_ignore_ascii_case("true");
        }

        if let Ok(val) = std::env::var("PAGEKIT_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.poll_interval = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("PAGEKIT_FETCH_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                config.fetch_max_attempts = attempts;
            }
        }

        if let Ok(val) = std::env::var("PAGEKIT_FETCH_BACKOFF_STEP_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.fetch_backoff_step = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("PAGEKIT_FETCH_BACKOFF_CAP_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.fetch_backoff_cap = Duration::from_millis(ms);
            }
        }

        config
    }

    /// State variable marking kernel readiness, e.g. `pagekit.kernel`.
    pub fn kernel_state_key(&self) -> String {
        format!("{}.kernel", self.namespace)
    }
}
