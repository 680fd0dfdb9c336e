//! Keel controllers: leader-gated consumers of cache events and direct work.
//!
//! A controller starts `Paused`. While paused it keeps draining its inputs so that
//! producers never stall, but acts on nothing. `resume` is the only way into `Active`
//! and always performs a catch-up scan of the store on that transition.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use keel_cache::{Cache, CacheEvent};
use keel_core::{Action, Kind, Namespace, Stateful};
use keel_storage::Storage;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod deployment;
mod reconciler;

pub use deployment::DeploymentReconciler;
pub use reconciler::Reconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Paused,
    Active,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("controller is already observing")]
    AlreadyObserving,
}

/// One unit of work on the controller's channel.
#[derive(Debug)]
pub enum WorkItem<T> {
    /// Desired state changed, or the item was (re)discovered.
    Spec(Arc<T>),
    /// Only the observed status changed.
    Status(Arc<T>),
    /// The item is gone; carries its last known value.
    Removed(Arc<T>),
}

impl<T: Stateful> WorkItem<T> {
    pub fn object(&self) -> &Arc<T> {
        match self {
            WorkItem::Spec(o) | WorkItem::Status(o) | WorkItem::Removed(o) => o,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            WorkItem::Spec(_) => "spec",
            WorkItem::Status(_) => "status",
            WorkItem::Removed(_) => "removed",
        }
    }
}

/// Split a cache event into spec and status work.
pub fn classify<T: Stateful>(ev: &CacheEvent<T>) -> Vec<WorkItem<T>> {
    match (ev.action, &ev.prev, &ev.current) {
        (Action::Create, _, Some(cur)) => vec![WorkItem::Spec(Arc::clone(cur))],
        (Action::Update, Some(prev), Some(cur)) => {
            let mut out = Vec::new();
            if prev.spec() != cur.spec() {
                out.push(WorkItem::Spec(Arc::clone(cur)));
            }
            if prev.status() != cur.status() {
                out.push(WorkItem::Status(Arc::clone(cur)));
            }
            out
        }
        (Action::Update, None, Some(cur)) => vec![WorkItem::Spec(Arc::clone(cur))],
        (Action::Delete, Some(prev), _) => vec![WorkItem::Removed(Arc::clone(prev))],
        _ => Vec::new(),
    }
}

pub struct Controller<T: Stateful> {
    storage: Storage,
    cache: Arc<Cache<T>>,
    reconciler: Arc<dyn Reconciler<T>>,
    state: watch::Sender<State>,
    work_tx: mpsc::UnboundedSender<WorkItem<T>>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkItem<T>>>>,
}

impl<T: Stateful> Controller<T> {
    pub fn new(storage: Storage, cache: Arc<Cache<T>>, reconciler: Arc<dyn Reconciler<T>>) -> Self {
        let (state, _) = watch::channel(State::Paused);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Self { storage, cache, reconciler, state, work_tx, work_rx: Mutex::new(Some(work_rx)) }
    }

    pub fn kind(&self) -> Kind {
        T::KIND
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    fn is_active(&self) -> bool {
        self.state() == State::Active
    }

    /// Stop acting on work. Returns the previous state.
    pub fn pause(&self) -> State {
        let prev = self.state.send_replace(State::Paused);
        if prev == State::Active {
            info!(kind = %T::KIND, "controller paused");
        }
        prev
    }

    /// Become active and re-enqueue everything in the store.
    ///
    /// Only the `Paused -> Active` transition scans; resuming an active controller is a
    /// no-op returning 0. Otherwise returns the number of items enqueued. A namespace
    /// whose listing fails is logged and skipped, as is every item that cannot be decoded.
    pub async fn resume(&self, cancel: &CancellationToken) -> usize {
        let resumed = self.state.send_if_modified(|s| {
            if *s == State::Paused {
                *s = State::Active;
                true
            } else {
                false
            }
        });
        if !resumed {
            debug!(kind = %T::KIND, "resume: already active");
            return 0;
        }
        let t0 = Instant::now();
        info!(kind = %T::KIND, "controller resumed; catch-up scan");

        let scopes: Vec<String> = if T::KIND.namespaced() {
            match self.storage.list::<Namespace>(cancel, Kind::Namespace, "").await {
                Ok(nss) => nss.into_iter().map(|ns| ns.meta.name).collect(),
                Err(e) => {
                    error!(kind = %T::KIND, error = %e, "catch-up: listing namespaces failed");
                    return 0;
                }
            }
        } else {
            vec![String::new()]
        };

        let mut count = 0usize;
        for scope in scopes {
            match self.storage.list_lenient::<T>(cancel, T::KIND, &scope).await {
                Ok((items, bad)) => {
                    for key in bad {
                        counter!("controller_catchup_skipped_total", 1u64, "kind" => T::KIND.as_str());
                        warn!(kind = %T::KIND, namespace = %scope, key = %key, "catch-up: skipping undecodable item");
                    }
                    for item in items {
                        self.enqueue(WorkItem::Spec(Arc::new(item)));
                        count += 1;
                    }
                }
                Err(e) => warn!(kind = %T::KIND, namespace = %scope, error = %e, "catch-up: skipping namespace"),
            }
        }
        histogram!("controller_catchup_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => T::KIND.as_str());
        info!(kind = %T::KIND, count, took_ms = %t0.elapsed().as_millis(), "catch-up done");
        count
    }

    /// Never blocks: the work channel is unbounded.
    pub fn enqueue(&self, item: WorkItem<T>) {
        // The receiver lives inside `self`, so this only fails while being dropped.
        if self.work_tx.send(item).is_err() {
            debug!(kind = %T::KIND, "work channel closed");
        }
    }

    /// Direct enqueue of a freshly written value, outside the watch path.
    pub fn update(&self, item: T) {
        self.enqueue(WorkItem::Spec(Arc::new(item)));
    }

    async fn handle(&self, cancel: &CancellationToken, item: WorkItem<T>) {
        let label = item.label();
        let link = item.object().self_link();
        let t0 = Instant::now();
        let res = match item {
            WorkItem::Spec(o) => self.reconciler.reconcile_spec(cancel, o).await,
            WorkItem::Status(o) => self.reconciler.reconcile_status(cancel, o).await,
            WorkItem::Removed(o) => self.reconciler.remove(cancel, o).await,
        };
        histogram!("controller_handle_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => T::KIND.as_str());
        match res {
            Ok(()) => {
                counter!("controller_items_handled_total", 1u64, "kind" => T::KIND.as_str());
                debug!(kind = %T::KIND, link = %link, work = label, "handled");
            }
            Err(_) if cancel.is_cancelled() => debug!(kind = %T::KIND, link = %link, "interrupted"),
            Err(e) => {
                counter!("controller_items_failed_total", 1u64, "kind" => T::KIND.as_str());
                error!(kind = %T::KIND, link = %link, work = label, error = %format!("{:#}", e), "reconcile failed");
            }
        }
    }

    fn skip(&self, what: &str) {
        counter!("controller_items_skipped_total", 1u64, "kind" => T::KIND.as_str());
        debug!(kind = %T::KIND, what, "paused; skipping");
    }

    /// Run both consumers until `cancel` fires.
    ///
    /// One drains the work channel and runs the reconciler; the other turns cache
    /// events into spec/status/removal work on that same channel. Both check `cancel`
    /// before every receive and before acting.
    pub async fn observe(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let mut work_rx = self
            .work_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ControllerError::AlreadyObserving)?;
        let mut events = self.cache.subscribe();
        info!(kind = %T::KIND, "controller observing");

        let work = async {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = work_rx.recv() => next,
                };
                let Some(item) = next else { break };
                if cancel.is_cancelled() {
                    break;
                }
                if !self.is_active() {
                    self.skip("work");
                    continue;
                }
                self.handle(&cancel, item).await;
            }
        };

        let watch = async {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = events.recv() => next,
                };
                let Some(ev) = next else { break };
                if ev.action == Action::Error {
                    error!(kind = %T::KIND, error = ?ev.error, "cache stopped following the store");
                    continue;
                }
                if cancel.is_cancelled() {
                    break;
                }
                if !self.is_active() {
                    self.skip("event");
                    continue;
                }
                for item in classify(&ev) {
                    self.enqueue(item);
                }
            }
        };

        tokio::join!(work, watch);
        *self.work_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(work_rx);
        info!(kind = %T::KIND, "controller stopped");
        Ok(())
    }
}

impl Controller<keel_core::Deployment> {
    pub fn update_deployment(&self, d: keel_core::Deployment) {
        self.update(d);
    }
}
