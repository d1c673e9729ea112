//! Scope-chain dependency resolution.

use std::collections::BTreeSet;

use log::trace;
use param_model::{Scope, ScopeStore, PROJECT_SCOPE};

use crate::analyze::free_symbols;
use crate::error::{ParameterError, ParameterResult};

/// Which nesting level a dependency chain entry resolves against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyKind {
    /// Names defined in the queried scope itself (only reported when
    /// `include_self` is set).
    SameScope,
    Activity,
    Database,
    Project,
}

/// One entry of a dependency chain: the scope `group` resolves `names`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub group: String,
    pub names: BTreeSet<String>,
}

/// Compute the ordered chain of outside scopes that resolve every free
/// variable used by `scope`'s formulas (parameters plus any parameterized
/// exchanges bound to it).
///
/// Names defined in `scope` itself are always evaluated locally and never
/// treated as external dependencies; with `include_self` they are
/// additionally reported as a leading [`DependencyKind::SameScope`] entry
/// (same-scope definitions shadow upstream ones).
///
/// Search order for an activity scope: the explicit `Group.order` siblings
/// (most local first), then the database scope(s) of the activities bound
/// to the group, then the project scope. A database scope consults only
/// the project scope; the project scope consults nothing.
///
/// Any name still unresolved after all levels raises
/// [`ParameterError::UnresolvedName`] listing every missing symbol.
pub fn dependency_chain(
    store: &ScopeStore,
    scope: &Scope,
    include_self: bool,
) -> ParameterResult<Vec<Dependency>> {
    let mut needed = used_symbols(store, scope)?;
    if needed.is_empty() {
        return Ok(Vec::new());
    }

    let own = store.names_in_scope(scope);
    let local: BTreeSet<String> = needed.intersection(&own).cloned().collect();
    needed.retain(|name| !own.contains(name));

    let mut chain = Vec::new();
    if include_self && !local.is_empty() {
        chain.push(Dependency {
            kind: DependencyKind::SameScope,
            group: scope.name().to_string(),
            names: local,
        });
    }

    match scope {
        Scope::Project => {}
        Scope::Database(_) => {
            resolve_level(store, &mut chain, &mut needed, DependencyKind::Project, PROJECT_SCOPE);
        }
        Scope::Activity(group) => {
            let order = store
                .group(group)
                .map(|g| g.order.clone())
                .unwrap_or_default();
            for sibling in &order {
                resolve_level(store, &mut chain, &mut needed, DependencyKind::Activity, sibling);
            }
            for database in store.activity_databases(group) {
                resolve_level(store, &mut chain, &mut needed, DependencyKind::Database, &database);
            }
            resolve_level(store, &mut chain, &mut needed, DependencyKind::Project, PROJECT_SCOPE);
        }
    }

    if !needed.is_empty() {
        return Err(ParameterError::UnresolvedName {
            names: needed.into_iter().collect(),
        });
    }

    trace!("dependency chain for {scope}: {} entries", chain.len());
    Ok(chain)
}

/// Union of free variables over every formula attached to `scope`.
fn used_symbols(store: &ScopeStore, scope: &Scope) -> ParameterResult<BTreeSet<String>> {
    let mut needed = BTreeSet::new();
    match scope {
        Scope::Project => {
            for param in store.project_parameters() {
                if let Some(formula) = &param.formula {
                    needed.extend(free_symbols(formula, None)?);
                }
            }
        }
        Scope::Database(database) => {
            for param in store.database_parameters(database) {
                if let Some(formula) = &param.formula {
                    needed.extend(free_symbols(formula, None)?);
                }
            }
        }
        Scope::Activity(group) => {
            for param in store.activity_parameters(group) {
                if let Some(formula) = &param.formula {
                    needed.extend(free_symbols(formula, None)?);
                }
            }
            for exchange in store.exchanges_for_group(group) {
                needed.extend(free_symbols(&exchange.formula, None)?);
            }
        }
    }
    Ok(needed)
}

/// Move every name of `needed` that `level` defines into a chain entry.
fn resolve_level(
    store: &ScopeStore,
    chain: &mut Vec<Dependency>,
    needed: &mut BTreeSet<String>,
    kind: DependencyKind,
    level: &str,
) {
    if needed.is_empty() {
        return;
    }
    let defined = store.names_in_scope(&store.classify(level));
    let resolved: BTreeSet<String> = needed.intersection(&defined).cloned().collect();
    if resolved.is_empty() {
        return;
    }
    needed.retain(|name| !resolved.contains(name));
    chain.push(Dependency {
        kind,
        group: level.to_string(),
        names: resolved,
    });
}
