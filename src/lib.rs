//! # tagcore - runtime configuration model for industrial monitoring
//!
//! tagcore keeps the live configuration of a monitoring server (tags, rules,
//! alarms and the supervised process/equipment tree) consistent between an
//! in-memory cache and a durable store while reconfiguration runs
//! concurrently with supervision traffic.
//!
//! ## Core Concepts
//!
//! - **EntityCache**: one keyed store per id space with per-key reentrant
//!   write locks
//! - **DependencyGraph**: rule → input tag and alarm → tag edges, kept
//!   symmetric through the `TagGateway`
//! - **ConfigurationEngine**: applies create/update/remove requests as
//!   transactions with compensating rollback
//! - **SupervisionManager / SupervisionNotifier**: status state machine and
//!   asynchronous, per-listener FIFO event delivery
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use tagcore::config::EngineConfig;
//! use tagcore::configuration::{ConfigurationElement, ConfigurationEngine};
//! use tagcore::persistence::InMemoryPersistence;
//! use tagcore::store::EntityCache;
//! use tagcore::{EntityId, EntityKind};
//!
//! let cache = Arc::new(EntityCache::default());
//! let engine = ConfigurationEngine::new(cache, Arc::new(InMemoryPersistence::new()), EngineConfig::default());
//!
//! let tag = engine.apply(&ConfigurationElement::create(EntityKind::DataTag, 100).with("name", "pump.flow"));
//! assert!(tag.is_ok());
//! let rule = engine.apply(
//!     &ConfigurationElement::create(EntityKind::RuleTag, 200)
//!         .with("name", "pump.flow.high")
//!         .with("ruleText", "#100 > 25"),
//! );
//! assert!(rule.is_ok());
//! assert!(engine.graph().dependent_rules(EntityId::new(100)).contains(&EntityId::new(200)));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod configuration;
pub mod entity;
pub mod error;
pub mod graph;
pub mod persistence;
pub mod store;
pub mod supervision;

// Re-export primary types at crate root for convenience
pub use config::{ConfigError, EngineConfig, NotifierConfig, TagCoreConfig};
pub use configuration::{
    Action, Configuration, ConfigurationElement, ConfigurationElementReport, ConfigurationEngine,
    ConfigurationReport, ReportStatus,
};
pub use entity::{Entity, EntityId, EntityKind, Tag};
pub use error::{TagCoreError, TagCoreResult, ValidationError};
pub use graph::{DependencyGraph, GraphViolation, TagGateway};
pub use persistence::{PersistenceAdapter, PersistenceError, Propagation, Transaction};
pub use store::{CacheChange, CacheListener, EntityCache, KeyedStore, StoreError, WriteLock};
pub use supervision::{
    SupervisionEvent, SupervisionListener, SupervisionManager, SupervisionNotifier, SupervisionStatus,
};
