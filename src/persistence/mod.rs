//! Persistence: the durable-store contract, an in-memory adapter, and the
//! transaction scopes the configuration engine runs in.

mod memory;
mod traits;
mod transaction;

pub use memory::{FailPoint, InMemoryPersistence, JournalEntry};
pub use traits::{PersistenceAdapter, PersistenceError, PersistenceOp};
pub use transaction::{Compensation, Propagation, RollbackOutcome, Transaction};
