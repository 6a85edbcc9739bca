//! Error types for tagcore.
//!
//! All errors are strongly typed using thiserror so that the configuration
//! engine can pattern match on the failure class and pick the right
//! compensation path. Configuration actions never hand these to the caller
//! directly; they are folded into a `ConfigurationElementReport`.

use thiserror::Error;

use crate::entity::{EntityId, EntityKind};
use crate::persistence::PersistenceError;
use crate::store::StoreError;

/// Validation errors raised before any mutation takes place.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required property '{property}' is missing")]
    MissingProperty {
        property: String,
    },

    #[error("Property '{property}' has invalid value '{value}': {reason}")]
    InvalidProperty {
        property: String,
        value: String,
        reason: String,
    },

    #[error("Unknown property '{property}' for {kind}")]
    UnknownProperty {
        property: String,
        kind: EntityKind,
    },

    #[error("Property '{property}' cannot be changed after creation")]
    ImmutableProperty {
        property: String,
    },

    #[error("{kind} {id} already exists")]
    AlreadyExists {
        kind: EntityKind,
        id: EntityId,
    },

    #[error("Entity {id} is a {actual}, not a {expected}")]
    KindMismatch {
        id: EntityId,
        expected: EntityKind,
        actual: EntityKind,
    },

    #[error("Property '{property}' references {id}, which does not exist")]
    MissingReference {
        property: String,
        id: EntityId,
    },

    #[error("{kind} {id} cannot be removed while {dependent} depends on it")]
    HasDependents {
        kind: EntityKind,
        id: EntityId,
        dependent: EntityId,
    },

    /// `reference` is the input as written in the rule text, e.g. `#42`.
    #[error("Rule {rule_id} cannot use {reference} as input: {reason}")]
    InvalidRuleInput {
        rule_id: EntityId,
        reference: String,
        reason: String,
    },

    #[error("Rule {rule_id} would introduce a dependency cycle through tag {tag_id}")]
    DependencyCycle {
        rule_id: EntityId,
        tag_id: EntityId,
    },
}

/// Top-level error type for tagcore.
#[derive(Debug, Error)]
pub enum TagCoreError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{kind} {id} not found")]
    NotFound {
        kind: EntityKind,
        id: EntityId,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Transaction aborted: {reason}")]
    TransactionAborted {
        reason: String,
        /// False when a compensation step itself failed.
        rollback_complete: bool,
    },

    #[error("Timed out after {waited_ms}ms waiting for the write lock on {kind} {id}")]
    LockTimeout {
        kind: EntityKind,
        id: EntityId,
        waited_ms: u64,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl TagCoreError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub const fn not_found(kind: EntityKind, id: EntityId) -> Self {
        Self::NotFound { kind, id }
    }

    /// Creates a transaction-aborted error.
    #[must_use]
    pub fn aborted(reason: impl Into<String>, rollback_complete: bool) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
            rollback_complete,
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the referenced entity was absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the durable store rejected the operation.
    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Returns true if a compensating rollback was attempted.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::TransactionAborted { .. })
    }

    /// Returns true if this is a lock timeout.
    #[must_use]
    pub const fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::Persistence(e) => e.is_transient(),
            Self::Validation(_)
            | Self::NotFound { .. }
            | Self::TransactionAborted { .. }
            | Self::Internal { .. } => false,
        }
    }
}

impl From<StoreError> for TagCoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::LockTimeout { kind, id, waited_ms } => {
                Self::LockTimeout { kind, id, waited_ms }
            }
            StoreError::LockNotHeld { kind, id } => Self::Internal {
                message: format!("write lock on {kind} {id} is not held by the current thread"),
            },
        }
    }
}

/// Result type alias for tagcore operations.
pub type TagCoreResult<T> = Result<T, TagCoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::MissingProperty {
            property: "ruleText".to_string(),
        };
        assert!(err.to_string().contains("ruleText"));

        let err = ValidationError::DependencyCycle {
            rule_id: EntityId::new(200),
            tag_id: EntityId::new(201),
        };
        let msg = err.to_string();
        assert!(msg.contains("200"));
        assert!(msg.contains("cycle"));
    }

    #[test]
    fn test_store_error_maps_to_taxonomy() {
        let err: TagCoreError = StoreError::NotFound {
            kind: EntityKind::DataTag,
            id: EntityId::new(7),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err: TagCoreError = StoreError::LockTimeout {
            kind: EntityKind::Alarm,
            id: EntityId::new(3),
            waited_ms: 50,
        }
        .into();
        assert!(err.is_lock_timeout());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn test_persistence_error_retryable_when_transient() {
        let err: TagCoreError = PersistenceError::Unavailable("db down".to_string()).into();
        assert!(err.is_persistence());
        assert!(err.is_retryable());

        let err: TagCoreError = PersistenceError::Rejected("constraint".to_string()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_aborted_error() {
        let err = TagCoreError::aborted("edge update failed", false);
        assert!(err.is_aborted());
        match err {
            TagCoreError::TransactionAborted {
                rollback_complete, ..
            } => assert!(!rollback_complete),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
