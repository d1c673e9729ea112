use param_model::ConstraintError;
use thiserror::Error;

use crate::interpreter::EvalError;
use crate::parser::ParseError;

/// Errors surfaced by engine operations.
///
/// Every variant is detected before any persistence write for the current
/// top-level operation; a failed operation leaves the store unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParameterError {
    /// A formula references identifiers with no definition anywhere in the
    /// scope chain. `names` lists every missing symbol, sorted.
    #[error("no value found for symbols: {}", .names.join(", "))]
    UnresolvedName { names: Vec<String> },

    /// A dependency edge or a same-scope formula reference would create a
    /// cycle.
    #[error("circular dependency: {0}")]
    CircularDependency(String),

    /// Reserved-name or cross-database containment broken.
    #[error("scope containment violation: {0}")]
    ScopeContainment(String),

    /// Name uniqueness violated within a scope or across a batch.
    #[error("duplicate parameter name {0}")]
    DuplicateName(String),

    /// Rename/delete blocked by live dependents and no cascade requested.
    #[error("parameter `{name}` is referenced by formulas in: {}", .scopes.join(", "))]
    DependentInUse { name: String, scopes: Vec<String> },

    /// Reference to a scope or exchange binding that does not exist.
    #[error("unknown scope `{0}`")]
    UnknownScope(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

pub type ParameterResult<T> = Result<T, ParameterError>;

impl From<ConstraintError> for ParameterError {
    fn from(err: ConstraintError) -> Self {
        match err {
            ConstraintError::DuplicateName { scope, name } => {
                ParameterError::DuplicateName(format!("`{name}` in scope `{scope}`"))
            }
            ConstraintError::ScopeContainment(msg) => ParameterError::ScopeContainment(msg),
            ConstraintError::CircularDependency { group, depends } => {
                ParameterError::CircularDependency(format!(
                    "dependency edge `{group}` -> `{depends}` would create a cycle"
                ))
            }
            ConstraintError::UnknownScope(name) => ParameterError::UnknownScope(name),
            ConstraintError::ActivityAlreadyGrouped {
                database,
                code,
                group,
            } => ParameterError::ScopeContainment(format!(
                "activity ({database}, {code}) already belongs to group `{group}`"
            )),
        }
    }
}
