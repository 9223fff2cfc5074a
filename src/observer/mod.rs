//! DOM change observation
//!
//! Named CSS-selector watches whose presence/absence is republished into the
//! state registry under `"{ns}.dom_observer.{name}"`. The hub re-evaluates
//! every watch on each mutation notice from the page, and additionally on a
//! periodic fallback poll: some host pages do not reliably deliver mutation
//! callbacks during dynamic re-renders, so the poll is a correctness
//! mitigation, not a redundancy.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{KernelError, Result};
use crate::page::PageHost;
use crate::state::StateRegistry;

/// Published value when the watched selector matches.
pub const PRESENT: &str = "present";
/// Published value when it does not.
pub const ABSENT: &str = "absent";

/// One named selector watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomWatch {
    pub name: String,
    pub query: String,
}

impl DomWatch {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
        }
    }
}

/// Registry of selector watches plus the background re-evaluation task.
pub struct ObserverHub {
    watches: Mutex<Vec<DomWatch>>,
    state: Arc<StateRegistry>,
    page: Arc<dyn PageHost>,
    poll_interval: Duration,
}

impl ObserverHub {
    pub fn new(
        state: Arc<StateRegistry>,
        page: Arc<dyn PageHost>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            watches: Mutex::new(Vec::new()),
            state,
            page,
            poll_interval,
        }
    }

    /// Register a watch and publish its initial presence. Registering a name
    /// or query twice is a programmer error and fails loudly.
    pub fn add(&self, watch: DomWatch) -> Result<()> {
        {
            let mut watches = self.lock();
            for existing in watches.iter() {
                if existing.name == watch.name {
                    return Err(KernelError::DuplicateObserver(format!(
                        "observer named {:?} already exists",
                        watch.name
                    )));
                }
                if existing.query == watch.query {
                    return Err(KernelError::DuplicateObserver(format!(
                        "query {:?} already registered under {:?}",
                        watch.query, existing.name
                    )));
                }
            }
            watches.push(watch.clone());
        }
        self.check(&watch);
        Ok(())
    }

    /// Re-evaluate every registered watch.
    pub fn check_all(&self) {
        // Snapshot first: state listeners fired by check() may re-enter the
        // hub, so the watches lock must not be held across evaluation.
        let watches = self.lock().clone();
        for watch in watches {
            self.check(&watch);
        }
    }

    fn check(&self, watch: &DomWatch) {
        let present = self.page.query(&watch.query);
        self.state.set(
            &self.state.dom_observer_key(&watch.name),
            if present { PRESENT } else { ABSENT },
        );
    }

    /// Start the background re-evaluation task. `mutations` carries one
    /// notice per observed DOM mutation batch; the fallback poll fires on
    /// `poll_interval` regardless. The task runs until the returned handle
    /// is aborted; it does not stop when the watch list empties or the
    /// mutation channel closes.
    pub fn run(self: Arc<Self>, mutations: mpsc::UnboundedReceiver<()>) -> JoinHandle<()> {
        let hub = self;
        tokio::spawn(async move {
            let mut mutations = Some(mutations);
            let mut tick = tokio::time::interval(hub.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            debug!(poll_ms = hub.poll_interval.as_millis() as u64, "observer loop started");
            loop {
                match mutations.as_mut() {
                    Some(rx) => {
                        tokio::select! {
                            notice = rx.recv() => {
                                match notice {
                                    Some(()) => hub.check_all(),
                                    None => mutations = None,
                                }
                            }
                            _ = tick.tick() => hub.check_all(),
                        }
                    }
                    None => {
                        tick.tick().await;
                        hub.check_all();
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DomWatch>> {
        self.watches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePage;

    fn hub() -> (Arc<ObserverHub>, Arc<FakePage>, Arc<StateRegistry>) {
        let state = Arc::new(StateRegistry::new("pagekit"));
        let page = Arc::new(FakePage::new());
        let hub = Arc::new(ObserverHub::new(
            state.clone(),
            page.clone(),
            Duration::from_millis(100),
        ));
        (hub, page, state)
    }

    #[tokio::test]
    async fn test_add_publishes_initial_presence() {
        let (hub, page, state) = hub();
        page.add_selector("#study .outcome");

        hub.add(DomWatch::new("study_outcome", "#study .outcome"))
            .unwrap();
        hub.add(DomWatch::new("lessons", "#lessons .section"))
            .unwrap();

        assert_eq!(
            state.get(&state.dom_observer_key("study_outcome")).as_deref(),
            Some(PRESENT)
        );
        assert_eq!(
            state.get(&state.dom_observer_key("lessons")).as_deref(),
            Some(ABSENT)
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let (hub, _page, _state) = hub();
        hub.add(DomWatch::new("a", "#a")).unwrap();

        assert!(matches!(
            hub.add(DomWatch::new("a", "#other")),
            Err(KernelError::DuplicateObserver(_))
        ));
        assert!(matches!(
            hub.add(DomWatch::new("b", "#a")),
            Err(KernelError::DuplicateObserver(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_may_reenter_the_hub() {
        let (hub, page, state) = hub();
        hub.add(DomWatch::new("a", "#a")).unwrap();

        // A presence listener that registers another watch from inside the
        // notification must not block on the hub's own lock.
        let reentrant = hub.clone();
        let cb: crate::state::StateCallback = Arc::new(move |_new, _old| {
            reentrant.add(DomWatch::new("b", "#b")).unwrap();
        });
        let _wait = state.wait(&state.dom_observer_key("a"), PRESENT, Some(cb), true);

        page.add_selector("#a");
        hub.check_all();

        assert_eq!(
            state.get(&state.dom_observer_key("a")).as_deref(),
            Some(PRESENT)
        );
        assert_eq!(
            state.get(&state.dom_observer_key("b")).as_deref(),
            Some(ABSENT)
        );
    }

    #[tokio::test]
    async fn test_mutation_notice_triggers_recheck() {
        let (hub, page, state) = hub();
        hub.add(DomWatch::new("a", "#a")).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = hub.run(rx);

        let wait = state.wait(&state.dom_observer_key("a"), PRESENT, None, false);
        page.add_selector("#a");
        tx.send(()).unwrap();
        assert_eq!(wait.await, PRESENT);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_poll_catches_missed_mutations() {
        let (hub, page, state) = hub();
        hub.add(DomWatch::new("a", "#a")).unwrap();

        // No mutation notices at all: the poll alone must pick up the change.
        let (_tx, rx) = mpsc::unbounded_channel();
        let task = hub.run(rx);

        let wait = state.wait(&state.dom_observer_key("a"), PRESENT, None, false);
        page.add_selector("#a");
        assert_eq!(wait.await, PRESENT);

        task.abort();
    }
}
