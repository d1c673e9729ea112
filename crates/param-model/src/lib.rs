#![forbid(unsafe_code)]

//! `param-model` defines the core records for multi-scope parameters.
//!
//! The crate is intentionally self-contained so it can be reused by:
//! - the recalculation engine (dependency resolution, evaluation ordering)
//! - persistence/import layers via `serde` (JSON-safe schema)
//!
//! Parameters live at three nested scope levels: project-wide, per-database
//! and per-activity-group. The [`ScopeStore`] owns every record and enforces
//! the structural invariants (name uniqueness, scope containment, acyclic
//! group dependencies) at the point of mutation, the way a SQL schema would
//! enforce them with constraints and triggers.

mod records;
mod store;

pub use records::{
    ActivityParameter, DatabaseParameter, ExchangeId, Extra, Group, GroupDependency, ParameterDef,
    ParameterizedExchange, ProjectParameter, Scope, PROJECT_SCOPE,
};
pub use store::{ConstraintError, ScopeStore};
