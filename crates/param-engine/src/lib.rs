#![forbid(unsafe_code)]
#![deny(unreachable_patterns)]

//! Dependency resolution and recalculation for multi-scope parameters.
//!
//! Parameters are named numeric values defined at one of three nested
//! levels (project, database, activity group). A parameter may carry a
//! literal amount or a formula referencing other parameters by name; the
//! engine discovers each formula's free variables, resolves where every
//! name is defined by searching outward through the scope chain, and
//! recomputes all derived amounts in dependency order whenever an upstream
//! value changes.
//!
//! The central type is [`ParameterManager`], an explicit engine instance
//! owning a [`param_model::ScopeStore`]. Results of a recalculation can be
//! pushed into externally owned numeric fields ("parameterized exchanges")
//! through a host attached with [`ParameterManager::set_exchange_host`].
//!
//! Formulas use a small arithmetic expression grammar (numbers, `+ - * /
//! % **`, function calls, named constants) evaluated by [`Interpreter`];
//! anything outside that grammar is rejected at parse time.

mod analyze;
mod ast;
mod engine;
mod error;
mod host;
mod interpreter;
mod parser;
mod rename;
mod resolve;

pub use analyze::free_symbols;
pub use ast::{BinaryOp, Expr, UnaryOp};
pub use engine::{validate_parameter_name, ParameterManager};
pub use error::{ParameterError, ParameterResult};
pub use host::{ExchangeHost, ExchangeRecord, MemoryHost};
pub use interpreter::{builtin_symbols, is_builtin, EvalError, Interpreter};
pub use parser::{parse_formula, ParseError, Span};
pub use resolve::{dependency_chain, Dependency, DependencyKind};

pub use param_model::{
    ActivityParameter, DatabaseParameter, ExchangeId, Extra, Group, GroupDependency, ParameterDef,
    ParameterizedExchange, ProjectParameter, Scope, ScopeStore, PROJECT_SCOPE,
};
