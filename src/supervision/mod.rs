//! Supervision: the per-entity state machine, the manager that applies
//! status reports, and the asynchronous notifier.

mod manager;
mod notifier;
mod state;

pub use manager::SupervisionManager;
pub use notifier::{
    ListenerError, ListenerId, ListenerRegistration, NotifierError, SupervisionListener,
    SupervisionNotifier,
};
pub use state::{SupervisionEntity, SupervisionEvent, SupervisionState, SupervisionStatus, Transition};
