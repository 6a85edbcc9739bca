//! Asynchronous supervision notifier.
//!
//! ```text
//! notify(event) ──► [control/event queue] ──► dispatcher ─┬─► [queue 1] ──► worker 1 ──► listener 1
//!                    (ordered, unbounded)                 ├─► [queue 2] ──► worker 2 ──► listener 2
//!                                                         └─► [queue N] ──► worker N ──► listener N
//! ```
//!
//! - `notify` only enqueues; it never waits for a listener.
//! - Registration travels through the same queue as events, so a listener
//!   sees every event notified after `register_listener` returned.
//! - Each listener has its own worker and FIFO queue: a slow or failing
//!   listener delays nobody else.
//! - Errors and panics raised by a listener are caught, counted and logged.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::SupervisionEvent;
use crate::config::NotifierConfig;

/// Error type listeners return from their callbacks.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receiver of supervision events.
pub trait SupervisionListener: Send + Sync {
    /// Called for every status change.
    fn on_supervision_event(&self, event: &SupervisionEvent) -> Result<(), ListenerError>;

    /// Called for redundant reports that only refresh the timestamp.
    fn on_heartbeat(&self, _event: &SupervisionEvent) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Name used in logs.
    fn name(&self) -> &str {
        "supervision-listener"
    }
}

/// Errors raised by the notifier itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifierError {
    #[error("Supervision notifier has shut down")]
    Shutdown,
}

/// Unique identifier for a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by [`SupervisionNotifier::register_listener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRegistration {
    id: ListenerId,
    name: String,
}

impl ListenerRegistration {
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
enum Delivery {
    Change(Arc<SupervisionEvent>),
    Heartbeat(Arc<SupervisionEvent>),
}

enum Msg {
    Register {
        id: ListenerId,
        listener: Arc<dyn SupervisionListener>,
        reply: Sender<()>,
    },
    Unregister {
        id: ListenerId,
        reply: Sender<bool>,
    },
    Deliver(Delivery),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicUsize,
    listeners: AtomicUsize,
    delivered: AtomicU64,
    failed_deliveries: AtomicU64,
    rejected: AtomicU64,
}

struct Worker {
    id: ListenerId,
    tx: Sender<Delivery>,
    join: JoinHandle<()>,
}

/// Fans supervision events out to registered listeners off the caller's
/// thread.
#[derive(Debug)]
pub struct SupervisionNotifier {
    cfg: NotifierConfig,
    tx: Sender<Msg>,
    counters: Arc<Counters>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisionNotifier {
    /// Starts the dispatcher thread.
    #[must_use]
    pub fn new(cfg: NotifierConfig) -> Self {
        let (tx, rx) = unbounded::<Msg>();
        let counters = Arc::new(Counters::default());

        let thread_counters = Arc::clone(&counters);
        let thread_name = cfg.thread_name.clone();
        let join = thread::Builder::new()
            .name(cfg.thread_name.clone())
            .spawn(move || dispatch_loop(&thread_name, &rx, &thread_counters))
            .expect("failed to spawn supervision dispatcher");

        Self {
            cfg,
            tx,
            counters,
            join: Mutex::new(Some(join)),
        }
    }

    /// Registers a listener; it receives every event notified after this
    /// call returns.
    pub fn register_listener(
        &self,
        listener: Arc<dyn SupervisionListener>,
    ) -> Result<ListenerRegistration, NotifierError> {
        let id = ListenerId::new();
        let name = listener.name().to_string();
        let (reply_tx, reply_rx) = bounded::<()>(1);
        self.tx
            .send(Msg::Register {
                id,
                listener,
                reply: reply_tx,
            })
            .map_err(|_| NotifierError::Shutdown)?;
        reply_rx.recv().map_err(|_| NotifierError::Shutdown)?;
        debug!(listener = %name, id = %id, "supervision listener registered");
        Ok(ListenerRegistration { id, name })
    }

    /// Stops delivery to a listener. Events already queued for it are still
    /// delivered. Returns false if the registration was unknown.
    pub fn unregister(&self, registration: &ListenerRegistration) -> Result<bool, NotifierError> {
        let (reply_tx, reply_rx) = bounded::<bool>(1);
        self.tx
            .send(Msg::Unregister {
                id: registration.id,
                reply: reply_tx,
            })
            .map_err(|_| NotifierError::Shutdown)?;
        reply_rx.recv().map_err(|_| NotifierError::Shutdown)
    }

    /// Queues a status-change event and returns immediately.
    ///
    /// An absent event is logged and dropped. Returns true if the event was
    /// queued.
    pub fn notify(&self, event: impl Into<Option<SupervisionEvent>>) -> bool {
        let Some(event) = event.into() else {
            warn!("rejecting absent supervision event");
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        self.enqueue(Delivery::Change(Arc::new(event)))
    }

    /// Queues a heartbeat (a report that changed nothing but the timestamp).
    pub fn notify_heartbeat(&self, event: SupervisionEvent) -> bool {
        self.enqueue(Delivery::Heartbeat(Arc::new(event)))
    }

    fn enqueue(&self, delivery: Delivery) -> bool {
        let depth = self.counters.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if backlog_warning_due(depth, self.cfg.backlog_warn_threshold) {
            warn!(
                pending = depth,
                threshold = self.cfg.backlog_warn_threshold,
                "supervision event backlog reached warning threshold"
            );
        }
        if self.tx.send(Msg::Deliver(delivery)).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::Relaxed);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("supervision notifier has shut down; dropping event");
            return false;
        }
        true
    }

    /// Events queued but not yet handed to listener workers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.counters.listeners.load(Ordering::Relaxed)
    }

    /// Successful listener callbacks.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Listener callbacks that returned an error or panicked.
    #[must_use]
    pub fn failed_deliveries(&self) -> u64 {
        self.counters.failed_deliveries.load(Ordering::Relaxed)
    }

    /// Events refused by `notify` (absent, or after shutdown).
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::Relaxed)
    }

    /// Delivers everything already queued, then stops all threads.
    ///
    /// Must not be called from inside a listener callback.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("supervision dispatcher panicked");
            }
        }
    }
}

impl Drop for SupervisionNotifier {
    fn drop(&mut self) {
        // Detach instead of joining: a listener may still hold the last
        // reference and drop us from its own worker thread.
        let _ = self.tx.send(Msg::Shutdown);
        drop(self.join.lock().take());
    }
}

fn dispatch_loop(thread_name: &str, rx: &Receiver<Msg>, counters: &Arc<Counters>) {
    let mut workers: Vec<Worker> = Vec::new();
    let mut spawned = 0usize;

    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Register { id, listener, reply } => {
                let (tx, worker_rx) = unbounded::<Delivery>();
                let worker_counters = Arc::clone(counters);
                let spawn = thread::Builder::new()
                    .name(format!("{thread_name}-listener-{spawned}"))
                    .spawn(move || worker_loop(listener.as_ref(), &worker_rx, &worker_counters));
                spawned += 1;
                match spawn {
                    Ok(join) => {
                        workers.push(Worker { id, tx, join });
                        counters.listeners.store(workers.len(), Ordering::Relaxed);
                    }
                    Err(e) => error!(error = %e, "failed to spawn supervision listener worker"),
                }
                let _ = reply.send(());
            }
            Msg::Unregister { id, reply } => {
                let found = workers.iter().position(|w| w.id == id).map(|pos| {
                    // Dropping the sender lets the worker drain and exit.
                    drop(workers.remove(pos));
                });
                counters.listeners.store(workers.len(), Ordering::Relaxed);
                debug!(id = %id, found = found.is_some(), "supervision listener unregistered");
                let _ = reply.send(found.is_some());
            }
            Msg::Deliver(delivery) => {
                counters.pending.fetch_sub(1, Ordering::Relaxed);
                for worker in &workers {
                    // Worker queues are unbounded; send only fails once the
                    // worker has exited.
                    let _ = worker.tx.send(delivery.clone());
                }
            }
            Msg::Shutdown => break,
        }
    }

    let joins: Vec<JoinHandle<()>> = workers
        .into_iter()
        .map(|w| {
            drop(w.tx);
            w.join
        })
        .collect();
    for join in joins {
        if join.join().is_err() {
            error!("supervision listener worker panicked outside a callback");
        }
    }
    counters.listeners.store(0, Ordering::Relaxed);
    info!("supervision notifier stopped");
}

fn worker_loop(listener: &dyn SupervisionListener, rx: &Receiver<Delivery>, counters: &Counters) {
    // Suppression state for the current failure streak of this listener.
    let mut failing = false;

    for delivery in rx {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &delivery {
            Delivery::Change(event) => listener.on_supervision_event(event),
            Delivery::Heartbeat(event) => listener.on_heartbeat(event),
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        let event = match &delivery {
            Delivery::Change(e) | Delivery::Heartbeat(e) => e,
        };
        match failure {
            None => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                if failing {
                    info!(listener = listener.name(), "supervision listener recovered");
                    failing = false;
                }
            }
            Some(reason) => {
                counters.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                if failing {
                    debug!(
                        listener = listener.name(),
                        entity = %event.entity,
                        id = %event.entity_id,
                        reason = %reason,
                        "supervision listener still failing"
                    );
                } else {
                    error!(
                        listener = listener.name(),
                        entity = %event.entity,
                        id = %event.entity_id,
                        reason = %reason,
                        "supervision listener failed; further failures logged at debug"
                    );
                    failing = true;
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// True each time the backlog grows onto a multiple of the threshold, so a
/// backlog that keeps growing keeps being reported.
fn backlog_warning_due(depth: usize, threshold: usize) -> bool {
    threshold > 0 && depth % threshold == 0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::entity::EntityId;
    use crate::supervision::{SupervisionEntity, SupervisionStatus};

    fn event(id: u64, status: SupervisionStatus) -> SupervisionEvent {
        SupervisionEvent {
            entity: SupervisionEntity::Equipment,
            entity_id: EntityId::new(id),
            status,
            timestamp: Utc::now(),
            message: None,
        }
    }

    struct Channel(Sender<SupervisionEvent>);

    impl SupervisionListener for Channel {
        fn on_supervision_event(&self, event: &SupervisionEvent) -> Result<(), ListenerError> {
            self.0.send(event.clone())?;
            Ok(())
        }
    }

    #[test]
    fn test_registered_listener_receives_event() {
        let notifier = SupervisionNotifier::new(NotifierConfig::default());
        let (tx, rx) = unbounded();
        let reg = notifier.register_listener(Arc::new(Channel(tx))).unwrap();
        assert_eq!(notifier.listener_count(), 1);
        assert_eq!(reg.name(), "supervision-listener");

        assert!(notifier.notify(event(1, SupervisionStatus::Running)));
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.entity_id, EntityId::new(1));
        notifier.shutdown();
    }

    #[test]
    fn test_absent_event_is_rejected() {
        let notifier = SupervisionNotifier::new(NotifierConfig::default());
        assert!(!notifier.notify(None));
        assert_eq!(notifier.rejected(), 1);
        notifier.shutdown();
    }

    #[test]
    fn test_unregistered_listener_stops_receiving() {
        let notifier = SupervisionNotifier::new(NotifierConfig::default());
        let (tx, rx) = unbounded();
        let reg = notifier.register_listener(Arc::new(Channel(tx))).unwrap();
        assert!(notifier.unregister(&reg).unwrap());
        assert!(!notifier.unregister(&reg).unwrap());
        notifier.notify(event(2, SupervisionStatus::Down));
        notifier.shutdown();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_notify_after_shutdown_is_dropped() {
        let notifier = SupervisionNotifier::new(NotifierConfig::default());
        notifier.shutdown();
        assert!(!notifier.notify(event(3, SupervisionStatus::Running)));
        assert!(matches!(
            notifier.register_listener(Arc::new(Channel(unbounded().0))),
            Err(NotifierError::Shutdown)
        ));
    }

    #[test]
    fn test_backlog_warning_repeats_at_each_multiple() {
        let due: Vec<usize> = (1..=35).filter(|d| backlog_warning_due(*d, 10)).collect();
        assert_eq!(due, vec![10, 20, 30]);
        assert!(!backlog_warning_due(5, 0));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
