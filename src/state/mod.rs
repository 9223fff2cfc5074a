//! State/readiness registry
//!
//! Named, single-valued state variables with listener semantics, used for
//! cross-script readiness coordination. Listeners carry a target value, a
//! persistent flag and an optional callback; `wait` layers a future on top
//! with an immediate-resolution shortcut when the state already matches.
//!
//! Conventions: kernel readiness lives under `"{ns}.kernel"`, per-module
//! readiness under `"{ns}.{module}"`, DOM observers under
//! `"{ns}.dom_observer.{name}"`. Any string is a legal state name.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::warn;

/// Listener callback: `(new_value, previous_value)`.
pub type StateCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Wildcard target value matching every state change.
pub const WILDCARD: &str = "*";

/// The value modules publish when they finish initializing.
pub const READY: &str = "ready";

struct StateListener {
    target: String,
    persistent: bool,
    callback: Option<StateCallback>,
    notify: Option<oneshot::Sender<String>>,
}

#[derive(Default)]
struct StateVar {
    value: Option<String>,
    listeners: Vec<StateListener>,
}

/// The registry. One per kernel; shared by every component.
pub struct StateRegistry {
    namespace: String,
    vars: Mutex<HashMap<String, StateVar>>,
}

impl StateRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            vars: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kernel_key(&self) -> String {
        format!("{}.kernel", self.namespace)
    }

    pub fn module_key(&self, module: &str) -> String {
        format!("{}.{}", self.namespace, module)
    }

    pub fn dom_observer_key(&self, name: &str) -> String {
        format!("{}.dom_observer.{}", self.namespace, name)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).and_then(|v| v.value.clone())
    }

    /// Set a state variable and notify listeners in registration order.
    /// Setting the current value again is a no-op. A listener fires when its
    /// target equals the new value or is the `"*"` wildcard; non-persistent
    /// listeners are dropped after their first matching invocation.
    pub fn set(&self, name: &str, value: &str) {
        let (old, to_fire) = {
            let mut vars = self.lock();
            let var = vars.entry(name.to_string()).or_default();
            if var.value.as_deref() == Some(value) {
                return;
            }
            let old = var.value.replace(value.to_string());

            let mut to_fire = Vec::new();
            let mut kept = Vec::new();
            for mut listener in var.listeners.drain(..) {
                if listener.target == value || listener.target == WILDCARD {
                    to_fire.push((listener.callback.clone(), listener.notify.take()));
                    if listener.persistent {
                        kept.push(listener);
                    }
                } else {
                    kept.push(listener);
                }
            }
            var.listeners = kept;
            (old, to_fire)
        };

        // Callbacks run outside the lock so a listener may re-enter the
        // registry; panics are isolated so one bad listener cannot block
        // the rest.
        for (callback, notify) in to_fire {
            if let Some(cb) = callback {
                Self::invoke(&cb, value, old.as_deref());
            }
            if let Some(tx) = notify {
                let _ = tx.send(value.to_string());
            }
        }
    }

    /// Wait for a state variable to reach `value`.
    ///
    /// The listener is registered synchronously, before the returned future
    /// is first polled, so callers cannot miss a transition that happens in
    /// between. If the state already matches, the callback is invoked
    /// immediately and the future resolves without any further `set`. With
    /// `persistent`, the callback keeps firing on every later match; the
    /// future still settles only once.
    pub fn wait(
        &self,
        name: &str,
        value: &str,
        callback: Option<StateCallback>,
        persistent: bool,
    ) -> impl Future<Output = String> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let target = value.to_string();

        let immediate = {
            let mut vars = self.lock();
            let var = vars.entry(name.to_string()).or_default();
            let current = var.value.clone();
            let matches = current.as_deref() == Some(value);

            if persistent || !matches {
                var.listeners.push(StateListener {
                    target: target.clone(),
                    persistent,
                    callback: callback.clone(),
                    notify: if matches { None } else { tx.take() },
                });
            }
            if matches {
                Some(current)
            } else {
                None
            }
        };

        if let Some(current) = immediate {
            if let Some(cb) = &callback {
                Self::invoke(cb, value, current.as_deref());
            }
            if let Some(tx) = tx.take() {
                let _ = tx.send(target.clone());
            }
        }

        async move { rx.await.unwrap_or(target) }
    }

    /// Wait until every listed module has signaled readiness. Zero modules
    /// resolves immediately.
    pub fn ready(&self, modules: &[&str]) -> impl Future<Output = ()> + Send + 'static {
        let waits: Vec<_> = modules
            .iter()
            .map(|m| self.wait(&self.module_key(m), READY, None, false))
            .collect();
        async move {
            if !waits.is_empty() {
                join_all(waits).await;
            }
        }
    }

    fn invoke(callback: &StateCallback, value: &str, old: Option<&str>) {
        let result = catch_unwind(AssertUnwindSafe(|| callback(value, old)));
        if result.is_err() {
            warn!(value = value, "state listener panicked; ignoring");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StateVar>> {
        self.vars.lock().unwrap_or_else(|e| e.into_inner())
    }
}
