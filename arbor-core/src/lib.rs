//! # arbor-core — Data model for the Arbor real-time tree database
//!
//! A single JSON-like tree addressed by `/`-separated paths. Every mutation
//! is turned into an ordered [`ChangeLog`] of fine-grained entries that the
//! sync layer fans out to listeners.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   apply(event)   ┌──────────────┐   ChangeLog   ┌────────────┐
//! │   Event     │ ───────────────► │ Persistence  │ ────────────► │ arbor-sync │
//! │ (wire JSON) │                  │  (tree owner)│               │ Distributor│
//! └─────────────┘                  └──────┬───────┘               └────────────┘
//!                                         │
//!                        ┌────────────────┼────────────────┐
//!                        ▼                ▼                ▼
//!                 ┌────────────┐   ┌─────────────┐  ┌──────────────┐
//!                 │ Node/Value │   │Authorization│  │ChangeLog     │
//!                 │ (IndexMap) │   │ (RuleSet)   │  │Builder       │
//!                 └────────────┘   └─────────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`path`] — Path algebra
//! - [`node`] — Ordered tree with dense child priorities
//! - [`changelog`] — Change entries and the diffing builder
//! - [`expr`] — Expression language shared by rules and queries
//! - [`auth`] — Rules, authorization checks and read filtering
//! - [`query`] — Per-connection query membership
//! - [`persistence`] — Mutation engine
//! - [`event`] — Inbound event wire shape

pub mod auth;
pub mod changelog;
pub mod error;
pub mod event;
pub mod expr;
pub mod node;
pub mod path;
pub mod persistence;
pub mod query;

// Re-exports for convenience
pub use auth::{AuthContext, Authorization, Operation, PredicateEvaluator, RuleSet};
pub use changelog::{
    ChangeLog, ChangeLogBuilder, ChangeLogEntry, ChildEntry, MovedEntry, RemovedEntry,
    ValueEntry, WriteMode,
};
pub use error::{Error, Result};
pub use event::{Event, EventType};
pub use expr::{ExprError, Expression};
pub use node::{Node, SubtreeEntry, Value};
pub use path::Path;
pub use persistence::{Listener, Persistence};
pub use query::{QueryChange, QueryEvaluator, QueryTransition};
