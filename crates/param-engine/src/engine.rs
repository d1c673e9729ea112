//! The parameter manager: batch definition, group membership and the
//! recalculation pass.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use log::debug;
use param_model::{
    ActivityParameter, DatabaseParameter, ExchangeId, ParameterDef, ParameterizedExchange,
    ProjectParameter, Scope, ScopeStore, PROJECT_SCOPE,
};

use crate::analyze::free_symbols;
use crate::error::{ParameterError, ParameterResult};
use crate::host::ExchangeHost;
use crate::interpreter::{is_builtin, EvalError, Interpreter};
use crate::parser::{self, parse_formula, ParseError, Span};
use crate::resolve::{dependency_chain, Dependency, DependencyKind};

/// Check that `name` can be defined as a parameter: a valid identifier
/// that does not shadow a builtin constant or function.
pub fn validate_parameter_name(name: &str) -> ParameterResult<()> {
    let mut chars = name.chars();
    let well_formed = match chars.next() {
        Some(first) => parser::is_ident_start(first) && chars.all(parser::is_ident_continue),
        None => false,
    };
    if !well_formed {
        return Err(ParameterError::Parse(ParseError {
            message: format!("invalid parameter name `{name}`"),
            span: Span::new(0, name.len()),
        }));
    }
    if is_builtin(name) {
        return Err(ParameterError::DuplicateName(format!(
            "`{name}` shadows a builtin symbol"
        )));
    }
    Ok(())
}

/// One formula that references a parameter under rename or removal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DependentRef {
    Project(String),
    Database(String, String),
    Activity(String, String),
    Exchange(String, ExchangeId),
}

impl DependentRef {
    pub(crate) fn scope_name(&self) -> &str {
        match self {
            DependentRef::Project(_) => PROJECT_SCOPE,
            DependentRef::Database(database, _) => database,
            DependentRef::Activity(group, _) | DependentRef::Exchange(group, _) => group,
        }
    }
}

/// Engine instance owning the parameter store and an optional exchange
/// host.
///
/// Every public operation is transactional: it either commits all of its
/// writes or restores the store to its prior state and returns the error.
/// Exchange amounts are pushed to the host only after the owning
/// recalculation has committed.
pub struct ParameterManager {
    pub(crate) store: ScopeStore,
    pub(crate) host: Option<Box<dyn ExchangeHost>>,
}

impl fmt::Debug for ParameterManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Default for ParameterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: ScopeStore::new(),
            host: None,
        }
    }

    #[must_use]
    pub fn with_store(store: ScopeStore) -> Self {
        Self { store, host: None }
    }

    #[must_use]
    pub fn store(&self) -> &ScopeStore {
        &self.store
    }

    /// Attach the host that owns activity records and their exchanges.
    pub fn set_exchange_host(&mut self, host: impl ExchangeHost + 'static) {
        self.host = Some(Box::new(host));
    }

    // ----- batch definition -----

    /// Define (or with `overwrite`, redefine) project-scope parameters.
    pub fn new_project_parameters(
        &mut self,
        defs: Vec<ParameterDef>,
        overwrite: bool,
    ) -> ParameterResult<()> {
        Self::check_defs(&defs)?;
        let snap = self.store.snapshot();
        let result = defs.into_iter().try_for_each(|def| {
            self.store
                .insert_project_parameter(
                    ProjectParameter {
                        name: def.name,
                        formula: def.formula,
                        amount: def.amount,
                        extra: def.extra,
                    },
                    overwrite,
                )
                .map_err(ParameterError::from)
        });
        if let Err(err) = result {
            self.store.restore(snap);
            return Err(err);
        }
        self.expire_dependents(PROJECT_SCOPE);
        Ok(())
    }

    /// Define parameters in the scope of one database.
    pub fn new_database_parameters(
        &mut self,
        database: &str,
        defs: Vec<ParameterDef>,
        overwrite: bool,
    ) -> ParameterResult<()> {
        Self::check_defs(&defs)?;
        let snap = self.store.snapshot();
        let result = defs.into_iter().try_for_each(|def| {
            self.store
                .insert_database_parameter(
                    DatabaseParameter {
                        database: database.to_string(),
                        name: def.name,
                        formula: def.formula,
                        amount: def.amount,
                        extra: def.extra,
                    },
                    overwrite,
                )
                .map_err(ParameterError::from)
        });
        if let Err(err) = result {
            self.store.restore(snap);
            return Err(err);
        }
        self.expire_dependents(database);
        Ok(())
    }

    /// Define parameters in an activity group, binding them to the external
    /// node `(database, code)`.
    pub fn new_activity_parameters(
        &mut self,
        group: &str,
        database: &str,
        code: &str,
        defs: Vec<ParameterDef>,
        overwrite: bool,
    ) -> ParameterResult<()> {
        Self::check_defs(&defs)?;
        let snap = self.store.snapshot();
        let result = (|| -> ParameterResult<()> {
            self.store.ensure_activity_group(group)?;
            for def in defs {
                self.store.insert_activity_parameter(
                    ActivityParameter {
                        group: group.to_string(),
                        database: database.to_string(),
                        code: code.to_string(),
                        name: def.name,
                        formula: def.formula,
                        amount: def.amount,
                        extra: def.extra,
                    },
                    overwrite,
                )?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            self.store.restore(snap);
            return Err(err);
        }
        self.expire_dependents(group);
        Ok(())
    }

    /// Declare the sibling search order of an activity group.
    ///
    /// Recalculation rewrites the order to the subset of siblings that
    /// actually resolve names, so this is how a cross-group reference is
    /// first made resolvable.
    pub fn set_group_order(&mut self, group: &str, order: Vec<String>) -> ParameterResult<()> {
        self.store.set_order(group, order)?;
        self.store.set_fresh(group, false);
        self.expire_dependents(group);
        Ok(())
    }

    // ----- group membership -----

    /// Copy the parameter definitions and formula-bearing exchanges of an
    /// external node into `group`, then clear them on the host. Returns the
    /// number of parameters taken over.
    pub fn add_to_group(&mut self, group: &str, database: &str, code: &str) -> ParameterResult<usize> {
        let (defs, exchanges) = {
            let Some(host) = self.host.as_ref() else {
                return Err(ParameterError::UnknownScope(format!(
                    "external node ({database}, {code})"
                )));
            };
            if !host.has_node(database, code) {
                return Err(ParameterError::UnknownScope(format!(
                    "external node ({database}, {code})"
                )));
            }
            (
                host.node_parameters(database, code),
                host.node_exchanges(database, code),
            )
        };
        Self::check_defs(&defs)?;
        let count = defs.len();

        let snap = self.store.snapshot();
        let result = (|| -> ParameterResult<()> {
            self.store.ensure_activity_group(group)?;
            for def in defs {
                self.store.insert_activity_parameter(
                    ActivityParameter {
                        group: group.to_string(),
                        database: database.to_string(),
                        code: code.to_string(),
                        name: def.name,
                        formula: def.formula,
                        amount: def.amount,
                        extra: def.extra,
                    },
                    true,
                )?;
            }
            for (exchange, formula) in exchanges {
                self.store.insert_parameterized_exchange(ParameterizedExchange {
                    group: group.to_string(),
                    exchange,
                    formula,
                })?;
            }
            self.store.set_fresh(group, false);
            Ok(())
        })();
        match result {
            Ok(()) => {
                if let Some(host) = self.host.as_mut() {
                    host.clear_node_parameters(database, code);
                }
                self.expire_dependents(group);
                debug!("bound node ({database}, {code}) to group `{group}`, {count} parameter(s)");
                Ok(count)
            }
            Err(err) => {
                self.store.restore(snap);
                Err(err)
            }
        }
    }

    /// Remove the parameters (and exchange bindings) of one node from
    /// `group`. Without `force`, refuses while other formulas still
    /// reference any removed name. Returns the number of parameters removed.
    pub fn remove_from_group(
        &mut self,
        group: &str,
        database: &str,
        code: &str,
        force: bool,
    ) -> ParameterResult<usize> {
        let removed: BTreeSet<String> = self
            .store
            .activity_parameters(group)
            .filter(|p| p.database == database && p.code == code)
            .map(|p| p.name.clone())
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }
        let node_exchange_ids: BTreeSet<ExchangeId> = match self.host.as_ref() {
            Some(host) => host
                .node_exchanges(database, code)
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
            None => BTreeSet::new(),
        };

        if !force {
            for name in &removed {
                // References among the rows being removed don't count.
                let survivors: Vec<DependentRef> = self
                    .formula_dependents(group, name)?
                    .into_iter()
                    .filter(|d| match d {
                        DependentRef::Activity(g, n) => !(g == group && removed.contains(n)),
                        DependentRef::Exchange(_, id) => !node_exchange_ids.contains(id),
                        _ => true,
                    })
                    .collect();
                if !survivors.is_empty() {
                    let mut scopes: Vec<String> = survivors
                        .iter()
                        .map(|d| d.scope_name().to_string())
                        .collect();
                    scopes.sort();
                    scopes.dedup();
                    return Err(ParameterError::DependentInUse {
                        name: name.clone(),
                        scopes,
                    });
                }
            }
        }

        let count = self
            .store
            .delete_activity_parameters_for_node(group, database, code);
        for id in node_exchange_ids {
            self.store.delete_parameterized_exchange(id);
        }
        self.expire_dependents(group);
        Ok(count)
    }

    // ----- recalculation -----

    /// Bring `scope_name` (and, recursively, everything it depends on) up
    /// to date. A fresh scope is a no-op.
    pub fn recalculate(&mut self, scope_name: &str) -> ParameterResult<()> {
        let Some(group) = self.store.group(scope_name) else {
            return Err(ParameterError::UnknownScope(scope_name.to_string()));
        };
        if group.fresh {
            debug!("`{scope_name}` is fresh, skipping recalculation");
            return Ok(());
        }
        let scope = self.store.classify(scope_name);
        let snap = self.store.snapshot();
        let mut writes = Vec::new();
        match self.recalc_scope(&scope, &mut writes) {
            Ok(()) => {
                self.flush_exchange_writes(writes);
                Ok(())
            }
            Err(err) => {
                self.store.restore(snap);
                Err(err)
            }
        }
    }

    /// Recalculate every stale scope, outermost level first, until the
    /// whole store is fresh.
    pub fn recalculate_all(&mut self) -> ParameterResult<()> {
        loop {
            let mut stale = self.store.stale_scopes();
            if stale.is_empty() {
                return Ok(());
            }
            stale.sort_by_key(|name| match self.store.classify(name) {
                Scope::Project => 0,
                Scope::Database(_) => 1,
                Scope::Activity(_) => 2,
            });
            for name in stale {
                self.recalculate(&name)?;
            }
        }
    }

    fn recalc_scope(
        &mut self,
        scope: &Scope,
        writes: &mut Vec<(ExchangeId, f64)>,
    ) -> ParameterResult<()> {
        let fresh = match self.store.group(scope.name()) {
            Some(group) => group.fresh,
            None => return Err(ParameterError::UnknownScope(scope.name().to_string())),
        };
        if fresh {
            return Ok(());
        }
        debug!("recalculating {scope}");

        // Re-derive and persist the dependency edges (and, for activity
        // scopes, the sibling search order) before touching any amounts, so
        // a cycle introduced by a formula edit is caught here.
        let chain = dependency_chain(&self.store, scope, false)?;
        let upstream: Vec<String> = chain.iter().map(|entry| entry.group.clone()).collect();
        self.store.replace_group_dependencies(scope.name(), &upstream)?;
        if let Scope::Activity(group_name) = scope {
            let order: Vec<String> = chain
                .iter()
                .filter(|entry| entry.kind == DependencyKind::Activity)
                .map(|entry| entry.group.clone())
                .collect();
            self.store.set_order(group_name, order)?;
        }

        for entry in &chain {
            let upstream_scope = self.store.classify(&entry.group);
            self.recalc_scope(&upstream_scope, writes)?;
        }

        // Most-local definitions last, so they win on a name collision.
        let mut interp = Interpreter::new();
        for entry in chain.iter().rev() {
            for name in &entry.names {
                interp.define(name.clone(), self.resolved_amount(entry, name)?);
            }
        }

        let amounts = self.solve_scope(scope, &mut interp)?;
        self.store.update_amounts(scope, &amounts);
        self.store.set_fresh(scope.name(), true);
        for dependent in self.store.dependents_of(scope.name()) {
            self.store.set_fresh(&dependent, false);
        }

        if let Scope::Activity(group_name) = scope {
            let pending: Vec<(ExchangeId, String)> = self
                .store
                .exchanges_for_group(group_name)
                .map(|e| (e.exchange, e.formula.clone()))
                .collect();
            for (id, formula) in pending {
                writes.push((id, interp.eval(&formula)?));
            }
        }
        Ok(())
    }

    /// Evaluate the formulas defined directly in `scope`, literals first,
    /// then formulas in same-scope reference order.
    fn solve_scope(
        &self,
        scope: &Scope,
        interp: &mut Interpreter,
    ) -> ParameterResult<BTreeMap<String, f64>> {
        let own: Vec<(String, Option<String>, Option<f64>)> = match scope {
            Scope::Project => self
                .store
                .project_parameters()
                .map(|p| (p.name.clone(), p.formula.clone(), p.amount))
                .collect(),
            Scope::Database(db) => self
                .store
                .database_parameters(db)
                .map(|p| (p.name.clone(), p.formula.clone(), p.amount))
                .collect(),
            Scope::Activity(group) => self
                .store
                .activity_parameters(group)
                .map(|p| (p.name.clone(), p.formula.clone(), p.amount))
                .collect(),
        };
        let own_names: BTreeSet<String> = own.iter().map(|(name, _, _)| name.clone()).collect();

        let mut amounts = BTreeMap::new();
        let mut pending: Vec<(String, crate::ast::Expr, BTreeSet<String>)> = Vec::new();
        for (name, formula, amount) in own {
            match formula {
                Some(formula) => {
                    let expr = parse_formula(&formula)?;
                    let mut deps = BTreeSet::new();
                    expr.for_each_name(&mut |n| {
                        if own_names.contains(n) {
                            deps.insert(n.to_string());
                        }
                    });
                    pending.push((name, expr, deps));
                }
                None => {
                    if let Some(amount) = amount {
                        interp.define(name.clone(), amount);
                        amounts.insert(name, amount);
                    }
                }
            }
        }

        // Peel off formulas whose same-scope inputs are all known; whatever
        // never unblocks is a same-scope reference cycle.
        while !pending.is_empty() {
            let mut remaining = Vec::with_capacity(pending.len());
            let mut progressed = false;
            for (name, expr, deps) in pending {
                if deps.iter().all(|dep| amounts.contains_key(dep)) {
                    let value = interp.eval_expr(&expr)?;
                    interp.define(name.clone(), value);
                    amounts.insert(name, value);
                    progressed = true;
                } else {
                    remaining.push((name, expr, deps));
                }
            }
            if !progressed {
                let stuck: BTreeSet<String> =
                    remaining.iter().map(|(name, _, _)| name.clone()).collect();
                // A blocked formula with no stuck inputs is waiting on a
                // parameter that simply has no value; evaluating it
                // surfaces the missing symbol instead of a bogus cycle.
                for (_, expr, deps) in &remaining {
                    if deps.iter().all(|dep| !stuck.contains(dep)) {
                        interp.eval_expr(expr)?;
                    }
                }
                let names: Vec<String> = stuck.into_iter().collect();
                return Err(ParameterError::CircularDependency(format!(
                    "parameters of {scope} form a reference cycle: {}",
                    names.join(", ")
                )));
            }
            pending = remaining;
        }
        Ok(amounts)
    }

    fn resolved_amount(&self, entry: &Dependency, name: &str) -> ParameterResult<f64> {
        let amount = match entry.kind {
            DependencyKind::SameScope => None,
            DependencyKind::Activity => self
                .store
                .activity_parameter(&entry.group, name)
                .and_then(|p| p.amount),
            DependencyKind::Database => self
                .store
                .database_parameter(&entry.group, name)
                .and_then(|p| p.amount),
            DependencyKind::Project => self.store.project_parameter(name).and_then(|p| p.amount),
        };
        amount.ok_or_else(|| EvalError::MissingSymbol(name.to_string()).into())
    }

    fn flush_exchange_writes(&mut self, writes: Vec<(ExchangeId, f64)>) {
        if let Some(host) = self.host.as_mut() {
            for (exchange, amount) in writes {
                host.write_exchange_amount(exchange, amount);
            }
        }
    }

    // ----- shared helpers -----

    /// Mark every scope reachable through depends-on edges into
    /// `scope_name` as stale.
    pub(crate) fn expire_dependents(&mut self, scope_name: &str) {
        let mut queue: VecDeque<String> = self.store.dependents_of(scope_name).into();
        let mut seen: BTreeSet<String> = queue.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            self.store.set_fresh(&current, false);
            for next in self.store.dependents_of(&current) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
    }

    /// Every formula that references `name` as defined in `defining_scope`:
    /// same-scope formulas mentioning the token, plus formulas in scopes
    /// whose recorded dependency chain attributes `name` to
    /// `defining_scope`.
    pub(crate) fn formula_dependents(
        &self,
        defining_scope: &str,
        name: &str,
    ) -> ParameterResult<Vec<DependentRef>> {
        let mut out = Vec::new();
        self.collect_scope_refs(&self.store.classify(defining_scope), name, Some(name), &mut out)?;

        let mut queue: VecDeque<String> = self.store.dependents_of(defining_scope).into();
        let mut seen: BTreeSet<String> = queue.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            let scope = self.store.classify(&current);
            let chain = dependency_chain(&self.store, &scope, false)?;
            if chain
                .iter()
                .any(|entry| entry.group == defining_scope && entry.names.contains(name))
            {
                self.collect_scope_refs(&scope, name, None, &mut out)?;
            }
            for next in self.store.dependents_of(&current) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        Ok(out)
    }

    fn collect_scope_refs(
        &self,
        scope: &Scope,
        token: &str,
        skip: Option<&str>,
        out: &mut Vec<DependentRef>,
    ) -> ParameterResult<()> {
        let mentions = |formula: &str| -> ParameterResult<bool> {
            Ok(free_symbols(formula, None)?.contains(token))
        };
        match scope {
            Scope::Project => {
                for param in self.store.project_parameters() {
                    if skip == Some(param.name.as_str()) {
                        continue;
                    }
                    if let Some(formula) = &param.formula {
                        if mentions(formula)? {
                            out.push(DependentRef::Project(param.name.clone()));
                        }
                    }
                }
            }
            Scope::Database(db) => {
                for param in self.store.database_parameters(db) {
                    if skip == Some(param.name.as_str()) {
                        continue;
                    }
                    if let Some(formula) = &param.formula {
                        if mentions(formula)? {
                            out.push(DependentRef::Database(db.clone(), param.name.clone()));
                        }
                    }
                }
            }
            Scope::Activity(group) => {
                for param in self.store.activity_parameters(group) {
                    if skip == Some(param.name.as_str()) {
                        continue;
                    }
                    if let Some(formula) = &param.formula {
                        if mentions(formula)? {
                            out.push(DependentRef::Activity(group.clone(), param.name.clone()));
                        }
                    }
                }
                for exchange in self.store.exchanges_for_group(group) {
                    if mentions(&exchange.formula)? {
                        out.push(DependentRef::Exchange(group.clone(), exchange.exchange));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_defs(defs: &[ParameterDef]) -> ParameterResult<()> {
        let mut seen = BTreeSet::new();
        for def in defs {
            validate_parameter_name(&def.name)?;
            if !seen.insert(def.name.as_str()) {
                return Err(ParameterError::DuplicateName(format!(
                    "`{}` appears twice in one batch",
                    def.name
                )));
            }
        }
        Ok(())
    }
}
