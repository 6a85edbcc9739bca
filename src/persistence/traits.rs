//! Durable store contract.
//!
//! The engine treats the adapter as a black box with one call per logical
//! step: every call either completes or fails with no partial write visible.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{Entity, EntityId, EntityKind};

/// One kind of durable write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistenceOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for PersistenceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Errors that can occur during persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Store could not be reached; the same call may succeed later.
    #[error("Persistent store unavailable: {0}")]
    Unavailable(String),

    /// Store refused the write (constraint violation and similar).
    #[error("Persistent store rejected the write: {0}")]
    Rejected(String),

    /// Row already present on insert.
    #[error("{kind} {id} is already persisted")]
    Duplicate { kind: EntityKind, id: EntityId },

    /// Row absent on update.
    #[error("{kind} {id} is not persisted")]
    Missing { kind: EntityKind, id: EntityId },

    /// Row could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PersistenceError {
    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Storage trait for configuration entities.
pub trait PersistenceAdapter: Send + Sync {
    /// Loads every persisted entity of `kind`. Called once at startup.
    fn load_all(&self, kind: EntityKind) -> Result<Vec<Entity>, PersistenceError>;

    /// Inserts a new row. Fails if the id is already persisted.
    fn insert(&self, entity: &Entity) -> Result<(), PersistenceError>;

    /// Writes `entity`; `changed_fields` names the properties that changed.
    fn update(&self, entity: &Entity, changed_fields: &[String]) -> Result<(), PersistenceError>;

    /// Deletes a row. Deleting an absent row succeeds.
    fn delete(&self, kind: EntityKind, id: EntityId) -> Result<(), PersistenceError>;
}
