use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;

use thiserror::Error;

use crate::records::{
    ActivityParameter, DatabaseParameter, ExchangeId, Group, GroupDependency,
    ParameterizedExchange, ProjectParameter, Scope, PROJECT_SCOPE,
};

/// Structural invariant violations, checked at the point of mutation.
///
/// These are the trigger-equivalent preconditions of the store: every
/// mutating method either commits fully or fails with one of these without
/// touching any table.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("duplicate parameter name `{name}` in scope `{scope}`")]
    DuplicateName { scope: String, name: String },

    #[error("scope containment violation: {0}")]
    ScopeContainment(String),

    #[error("dependency edge `{group}` -> `{depends}` would create a cycle")]
    CircularDependency { group: String, depends: String },

    #[error("unknown scope `{0}`")]
    UnknownScope(String),

    #[error("activity ({database}, {code}) already belongs to group `{group}`")]
    ActivityAlreadyGrouped {
        database: String,
        code: String,
        group: String,
    },
}

/// In-memory store for all parameter, group and dependency records.
///
/// All iteration orders are deterministic (records live in B-tree maps keyed
/// by their scope keys). Atomicity across multiple writes is provided by
/// [`ScopeStore::snapshot`] / [`ScopeStore::restore`]: a caller takes a
/// snapshot before a multi-write operation and restores it if any step
/// fails, so a reader never observes partial state.
#[derive(Clone, Debug, Default)]
pub struct ScopeStore {
    project: BTreeMap<String, ProjectParameter>,
    database: BTreeMap<(String, String), DatabaseParameter>,
    activity: BTreeMap<(String, String), ActivityParameter>,
    exchanges: BTreeMap<ExchangeId, ParameterizedExchange>,
    groups: BTreeMap<String, Group>,
    edges: BTreeSet<GroupDependency>,
    /// Database scopes seen so far. A database becomes known when its first
    /// parameter is written.
    databases: BTreeSet<String>,
}

impl ScopeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of parameter records across all three scope levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.project.len() + self.database.len() + self.activity.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cheap copy of every table, used as a rollback point.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Discard current state and return to `snapshot`.
    pub fn restore(&mut self, snapshot: Self) {
        *self = snapshot;
    }

    // ----- scope classification -----

    /// Map a scope name to its nesting level.
    ///
    /// The reserved project name wins over everything; known database names
    /// win over activity groups; any other name is an activity-level scope.
    #[must_use]
    pub fn classify(&self, name: &str) -> Scope {
        if name == PROJECT_SCOPE {
            Scope::Project
        } else if self.databases.contains(name) {
            Scope::Database(name.to_string())
        } else {
            Scope::Activity(name.to_string())
        }
    }

    #[must_use]
    pub fn is_database(&self, name: &str) -> bool {
        self.databases.contains(name)
    }

    pub fn databases(&self) -> impl Iterator<Item = &str> {
        self.databases.iter().map(String::as_str)
    }

    // ----- groups -----

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    #[must_use]
    pub fn group_exists(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Create the `Group` row for an activity-level scope if it does not
    /// exist yet, enforcing reserved-name containment.
    pub fn ensure_activity_group(&mut self, name: &str) -> Result<(), ConstraintError> {
        self.check_activity_scope_name(name)?;
        self.ensure_group_row(name);
        Ok(())
    }

    /// Set the freshness bit for a scope. Returns `false` if the scope has
    /// no `Group` row yet.
    pub fn set_fresh(&mut self, name: &str, fresh: bool) -> bool {
        match self.groups.get_mut(name) {
            Some(group) => {
                group.fresh = fresh;
                true
            }
            None => false,
        }
    }

    /// Replace the explicit search order of an activity-level scope.
    ///
    /// Entries must be activity-level names: the reserved project scope and
    /// database names are implicit and always searched last.
    pub fn set_order(&mut self, name: &str, order: Vec<String>) -> Result<(), ConstraintError> {
        if !self.groups.contains_key(name) {
            return Err(ConstraintError::UnknownScope(name.to_string()));
        }
        for entry in &order {
            if entry == name {
                return Err(ConstraintError::CircularDependency {
                    group: name.to_string(),
                    depends: entry.clone(),
                });
            }
            if entry == PROJECT_SCOPE || self.databases.contains(entry) {
                return Err(ConstraintError::ScopeContainment(format!(
                    "search order of `{name}` may not list reserved scope `{entry}`"
                )));
            }
        }
        if let Some(group) = self.groups.get_mut(name) {
            group.order = order;
        }
        Ok(())
    }

    /// All scopes currently marked not fresh, in name order.
    #[must_use]
    pub fn stale_scopes(&self) -> Vec<String> {
        self.groups
            .values()
            .filter(|g| !g.fresh)
            .map(|g| g.name.clone())
            .collect()
    }

    // ----- parameters -----

    pub fn insert_project_parameter(
        &mut self,
        param: ProjectParameter,
        overwrite: bool,
    ) -> Result<(), ConstraintError> {
        if !overwrite && self.project.contains_key(&param.name) {
            return Err(ConstraintError::DuplicateName {
                scope: PROJECT_SCOPE.to_string(),
                name: param.name,
            });
        }
        self.ensure_group_row(PROJECT_SCOPE);
        self.project.insert(param.name.clone(), param);
        self.set_fresh(PROJECT_SCOPE, false);
        Ok(())
    }

    pub fn insert_database_parameter(
        &mut self,
        param: DatabaseParameter,
        overwrite: bool,
    ) -> Result<(), ConstraintError> {
        let db = param.database.clone();
        if db == PROJECT_SCOPE {
            return Err(ConstraintError::ScopeContainment(format!(
                "database scope may not use the reserved name `{PROJECT_SCOPE}`"
            )));
        }
        // A name already taken by an activity group cannot become a
        // database; the activity containment invariant would silently break.
        if self.groups.contains_key(&db) && !self.databases.contains(&db) {
            return Err(ConstraintError::ScopeContainment(format!(
                "`{db}` is already an activity group and cannot name a database"
            )));
        }
        let key = (db.clone(), param.name.clone());
        if !overwrite && self.database.contains_key(&key) {
            return Err(ConstraintError::DuplicateName {
                scope: db,
                name: param.name,
            });
        }
        self.databases.insert(db.clone());
        self.ensure_group_row(&db);
        self.database.insert(key, param);
        self.set_fresh(&db, false);
        Ok(())
    }

    pub fn insert_activity_parameter(
        &mut self,
        param: ActivityParameter,
        overwrite: bool,
    ) -> Result<(), ConstraintError> {
        self.check_activity_scope_name(&param.group)?;
        if let Some(existing) = self.group_for_node(&param.database, &param.code) {
            if existing != param.group {
                return Err(ConstraintError::ActivityAlreadyGrouped {
                    database: param.database,
                    code: param.code,
                    group: existing.to_string(),
                });
            }
        }
        let key = (param.group.clone(), param.name.clone());
        if !overwrite && self.activity.contains_key(&key) {
            return Err(ConstraintError::DuplicateName {
                scope: param.group,
                name: param.name,
            });
        }
        let group = param.group.clone();
        self.ensure_group_row(&group);
        self.activity.insert(key, param);
        self.set_fresh(&group, false);
        Ok(())
    }

    /// Persist newly computed amounts for parameters of `scope`.
    ///
    /// Amount-only update: freshness bookkeeping is left to the caller,
    /// since this runs inside a recalculation pass.
    pub fn update_amounts(&mut self, scope: &Scope, amounts: &BTreeMap<String, f64>) {
        match scope {
            Scope::Project => {
                for (name, amount) in amounts {
                    if let Some(param) = self.project.get_mut(name) {
                        param.amount = Some(*amount);
                    }
                }
            }
            Scope::Database(db) => {
                for (name, amount) in amounts {
                    if let Some(param) = self.database.get_mut(&(db.clone(), name.clone())) {
                        param.amount = Some(*amount);
                    }
                }
            }
            Scope::Activity(group) => {
                for (name, amount) in amounts {
                    if let Some(param) = self.activity.get_mut(&(group.clone(), name.clone())) {
                        param.amount = Some(*amount);
                    }
                }
            }
        }
    }

    pub fn project_parameters(&self) -> impl Iterator<Item = &ProjectParameter> {
        self.project.values()
    }

    pub fn database_parameters<'a>(
        &'a self,
        database: &'a str,
    ) -> impl Iterator<Item = &'a DatabaseParameter> {
        self.scoped(&self.database, database)
    }

    pub fn activity_parameters<'a>(
        &'a self,
        group: &'a str,
    ) -> impl Iterator<Item = &'a ActivityParameter> {
        self.scoped(&self.activity, group)
    }

    #[must_use]
    pub fn project_parameter(&self, name: &str) -> Option<&ProjectParameter> {
        self.project.get(name)
    }

    #[must_use]
    pub fn database_parameter(&self, database: &str, name: &str) -> Option<&DatabaseParameter> {
        self.database
            .get(&(database.to_string(), name.to_string()))
    }

    #[must_use]
    pub fn activity_parameter(&self, group: &str, name: &str) -> Option<&ActivityParameter> {
        self.activity.get(&(group.to_string(), name.to_string()))
    }

    pub fn delete_project_parameter(&mut self, name: &str) -> bool {
        let removed = self.project.remove(name).is_some();
        if removed {
            self.set_fresh(PROJECT_SCOPE, false);
        }
        removed
    }

    pub fn delete_database_parameter(&mut self, database: &str, name: &str) -> bool {
        let removed = self
            .database
            .remove(&(database.to_string(), name.to_string()))
            .is_some();
        if removed {
            self.set_fresh(database, false);
        }
        removed
    }

    pub fn delete_activity_parameter(&mut self, group: &str, name: &str) -> bool {
        let removed = self
            .activity
            .remove(&(group.to_string(), name.to_string()))
            .is_some();
        if removed {
            self.set_fresh(group, false);
        }
        removed
    }

    /// Bulk delete: all of `group`'s parameters bound to one external node.
    pub fn delete_activity_parameters_for_node(
        &mut self,
        group: &str,
        database: &str,
        code: &str,
    ) -> usize {
        let doomed: Vec<(String, String)> = self
            .activity_parameters(group)
            .filter(|p| p.database == database && p.code == code)
            .map(|p| (p.group.clone(), p.name.clone()))
            .collect();
        let count = doomed.len();
        for key in doomed {
            self.activity.remove(&key);
        }
        if count > 0 {
            self.set_fresh(group, false);
        }
        count
    }

    /// Parameter names defined directly inside `scope`.
    #[must_use]
    pub fn names_in_scope(&self, scope: &Scope) -> BTreeSet<String> {
        match scope {
            Scope::Project => self.project.keys().cloned().collect(),
            Scope::Database(db) => self.database_parameters(db).map(|p| p.name.clone()).collect(),
            Scope::Activity(group) => self
                .activity_parameters(group)
                .map(|p| p.name.clone())
                .collect(),
        }
    }

    /// Distinct databases of the activities bound to `group`, in name order.
    #[must_use]
    pub fn activity_databases(&self, group: &str) -> BTreeSet<String> {
        self.activity_parameters(group)
            .map(|p| p.database.clone())
            .collect()
    }

    /// The group an external node `(database, code)` currently belongs to.
    #[must_use]
    pub fn group_for_node(&self, database: &str, code: &str) -> Option<&str> {
        self.activity
            .values()
            .find(|p| p.database == database && p.code == code)
            .map(|p| p.group.as_str())
    }

    // ----- parameterized exchanges -----

    /// Insert or replace the binding for one exchange.
    ///
    /// The target group must already exist as a live activity scope.
    pub fn insert_parameterized_exchange(
        &mut self,
        exchange: ParameterizedExchange,
    ) -> Result<(), ConstraintError> {
        if !self.groups.contains_key(&exchange.group) {
            return Err(ConstraintError::UnknownScope(exchange.group));
        }
        if !matches!(self.classify(&exchange.group), Scope::Activity(_)) {
            return Err(ConstraintError::ScopeContainment(format!(
                "parameterized exchanges may only bind to activity groups, not `{}`",
                exchange.group
            )));
        }
        self.exchanges.insert(exchange.exchange, exchange);
        Ok(())
    }

    #[must_use]
    pub fn parameterized_exchange(&self, id: ExchangeId) -> Option<&ParameterizedExchange> {
        self.exchanges.get(&id)
    }

    /// Exchanges bound to `group`, in exchange-id order.
    pub fn exchanges_for_group<'a>(
        &'a self,
        group: &'a str,
    ) -> impl Iterator<Item = &'a ParameterizedExchange> {
        self.exchanges.values().filter(move |e| e.group == group)
    }

    pub fn delete_exchanges_for_group(&mut self, group: &str) -> usize {
        let doomed: Vec<ExchangeId> = self
            .exchanges_for_group(group)
            .map(|e| e.exchange)
            .collect();
        for id in &doomed {
            self.exchanges.remove(id);
        }
        doomed.len()
    }

    pub fn delete_parameterized_exchange(&mut self, id: ExchangeId) -> bool {
        self.exchanges.remove(&id).is_some()
    }

    /// Replace the formula text of one exchange (rename rewrites).
    pub fn set_exchange_formula(&mut self, id: ExchangeId, formula: String) -> bool {
        match self.exchanges.get_mut(&id) {
            Some(exchange) => {
                exchange.formula = formula;
                true
            }
            None => false,
        }
    }

    // ----- group dependencies -----

    /// Insert a depends-on edge, rejecting self-loops, illegal containment
    /// and anything that would close a cycle (checked transitively in both
    /// directions before the write).
    pub fn insert_group_dependency(
        &mut self,
        group: &str,
        depends: &str,
    ) -> Result<(), ConstraintError> {
        if group == depends {
            return Err(ConstraintError::CircularDependency {
                group: group.to_string(),
                depends: depends.to_string(),
            });
        }
        if group == PROJECT_SCOPE {
            return Err(ConstraintError::ScopeContainment(
                "the project scope cannot depend on other scopes".to_string(),
            ));
        }
        if self.is_database(group) && depends != PROJECT_SCOPE {
            return Err(ConstraintError::ScopeContainment(format!(
                "database scope `{group}` may only depend on the project scope"
            )));
        }
        if self.depends_transitively(depends, group) {
            return Err(ConstraintError::CircularDependency {
                group: group.to_string(),
                depends: depends.to_string(),
            });
        }
        self.edges.insert(GroupDependency {
            group: group.to_string(),
            depends: depends.to_string(),
        });
        Ok(())
    }

    /// Drop every edge out of `group` and insert `depends` in its place.
    pub fn replace_group_dependencies(
        &mut self,
        group: &str,
        depends: &[String],
    ) -> Result<(), ConstraintError> {
        let old: Vec<GroupDependency> = self
            .edges
            .iter()
            .filter(|e| e.group == group)
            .cloned()
            .collect();
        for edge in &old {
            self.edges.remove(edge);
        }
        for target in depends {
            if let Err(err) = self.insert_group_dependency(group, target) {
                // Put the original edges back; the caller sees no change.
                self.edges.retain(|e| e.group != group);
                self.edges.extend(old);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Scopes `group` has a direct depends-on edge to, in name order.
    #[must_use]
    pub fn dependencies_of(&self, group: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.group == group)
            .map(|e| e.depends.clone())
            .collect()
    }

    /// Scopes with a direct depends-on edge into `scope`, in name order.
    #[must_use]
    pub fn dependents_of(&self, scope: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .edges
            .iter()
            .filter(|e| e.depends == scope)
            .map(|e| e.group.clone())
            .collect();
        out.sort();
        out
    }

    pub fn group_dependencies(&self) -> impl Iterator<Item = &GroupDependency> {
        self.edges.iter()
    }

    /// Whether `from` reaches `to` through depends-on edges.
    #[must_use]
    pub fn depends_transitively(&self, from: &str, to: &str) -> bool {
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        queue.push_back(from);
        seen.insert(from);
        while let Some(current) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.group == current) {
                if edge.depends == to {
                    return true;
                }
                if seen.insert(edge.depends.as_str()) {
                    queue.push_back(edge.depends.as_str());
                }
            }
        }
        false
    }

    // ----- internals -----

    fn ensure_group_row(&mut self, name: &str) {
        if !self.groups.contains_key(name) {
            self.groups.insert(name.to_string(), Group::new(name));
        }
    }

    fn check_activity_scope_name(&self, group: &str) -> Result<(), ConstraintError> {
        if group == PROJECT_SCOPE {
            return Err(ConstraintError::ScopeContainment(format!(
                "activity group may not use the reserved name `{PROJECT_SCOPE}`"
            )));
        }
        if self.databases.contains(group) {
            return Err(ConstraintError::ScopeContainment(format!(
                "activity group may not use the database name `{group}`"
            )));
        }
        Ok(())
    }

    fn scoped<'a, V>(
        &'a self,
        table: &'a BTreeMap<(String, String), V>,
        key: &'a str,
    ) -> impl Iterator<Item = &'a V> {
        table
            .range((
                Bound::Included((key.to_string(), String::new())),
                Bound::Unbounded,
            ))
            .take_while(move |((scope, _), _)| scope == key)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::records::{Extra, ParameterDef};

    fn project(name: &str, formula: Option<&str>) -> ProjectParameter {
        ProjectParameter {
            name: name.to_string(),
            formula: formula.map(str::to_string),
            amount: None,
            extra: Extra::default(),
        }
    }

    fn db_param(database: &str, name: &str) -> DatabaseParameter {
        DatabaseParameter {
            database: database.to_string(),
            name: name.to_string(),
            formula: None,
            amount: Some(1.0),
            extra: Extra::default(),
        }
    }

    fn act_param(group: &str, database: &str, code: &str, name: &str) -> ActivityParameter {
        ActivityParameter {
            group: group.to_string(),
            database: database.to_string(),
            code: code.to_string(),
            name: name.to_string(),
            formula: None,
            amount: Some(1.0),
            extra: Extra::default(),
        }
    }

    #[test]
    fn duplicate_names_rejected_per_scope() {
        let mut store = ScopeStore::new();
        store
            .insert_project_parameter(project("foo", None), false)
            .unwrap();
        let err = store
            .insert_project_parameter(project("foo", None), false)
            .unwrap_err();
        assert!(matches!(err, ConstraintError::DuplicateName { .. }));

        // Same name in a different scope is fine.
        store
            .insert_database_parameter(db_param("db", "foo"), false)
            .unwrap();
    }

    #[test]
    fn reserved_scope_names_rejected() {
        let mut store = ScopeStore::new();
        let err = store
            .insert_database_parameter(db_param("project", "x"), false)
            .unwrap_err();
        assert!(matches!(err, ConstraintError::ScopeContainment(_)));

        store
            .insert_database_parameter(db_param("db", "x"), false)
            .unwrap();
        let err = store
            .insert_activity_parameter(act_param("db", "db", "c", "y"), false)
            .unwrap_err();
        assert!(matches!(err, ConstraintError::ScopeContainment(_)));
    }

    #[test]
    fn database_name_may_not_shadow_activity_group() {
        let mut store = ScopeStore::new();
        store
            .insert_activity_parameter(act_param("shared", "db", "c", "y"), false)
            .unwrap();
        let err = store
            .insert_database_parameter(db_param("shared", "x"), false)
            .unwrap_err();
        assert!(matches!(err, ConstraintError::ScopeContainment(_)));
    }

    #[test]
    fn activity_node_belongs_to_one_group() {
        let mut store = ScopeStore::new();
        store
            .insert_activity_parameter(act_param("g1", "db", "c", "a"), false)
            .unwrap();
        let err = store
            .insert_activity_parameter(act_param("g2", "db", "c", "b"), false)
            .unwrap_err();
        assert_eq!(
            err,
            ConstraintError::ActivityAlreadyGrouped {
                database: "db".to_string(),
                code: "c".to_string(),
                group: "g1".to_string(),
            }
        );
    }

    #[test]
    fn cycle_rejected_transitively() {
        let mut store = ScopeStore::new();
        store
            .insert_activity_parameter(act_param("a", "db", "1", "x"), false)
            .unwrap();
        store
            .insert_activity_parameter(act_param("b", "db", "2", "y"), false)
            .unwrap();
        store
            .insert_activity_parameter(act_param("c", "db", "3", "z"), false)
            .unwrap();
        store.insert_group_dependency("a", "b").unwrap();
        store.insert_group_dependency("b", "c").unwrap();
        let err = store.insert_group_dependency("c", "a").unwrap_err();
        assert!(matches!(err, ConstraintError::CircularDependency { .. }));
        // The failed insert must leave no edge behind.
        assert_eq!(store.dependencies_of("c"), Vec::<String>::new());

        let err = store.insert_group_dependency("a", "a").unwrap_err();
        assert!(matches!(err, ConstraintError::CircularDependency { .. }));
    }

    #[test]
    fn project_scope_has_no_dependencies() {
        let mut store = ScopeStore::new();
        store
            .insert_project_parameter(project("foo", None), false)
            .unwrap();
        let err = store
            .insert_group_dependency("project", "anything")
            .unwrap_err();
        assert!(matches!(err, ConstraintError::ScopeContainment(_)));
    }

    #[test]
    fn database_edges_point_at_project_only() {
        let mut store = ScopeStore::new();
        store
            .insert_database_parameter(db_param("db", "x"), false)
            .unwrap();
        let err = store.insert_group_dependency("db", "other").unwrap_err();
        assert!(matches!(err, ConstraintError::ScopeContainment(_)));
        store.insert_group_dependency("db", "project").unwrap();
    }

    #[test]
    fn exchange_requires_live_group() {
        let mut store = ScopeStore::new();
        let err = store
            .insert_parameterized_exchange(ParameterizedExchange {
                group: "ghost".to_string(),
                exchange: ExchangeId(1),
                formula: "x + 1".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, ConstraintError::UnknownScope("ghost".to_string()));

        store
            .insert_activity_parameter(act_param("g", "db", "c", "x"), false)
            .unwrap();
        store
            .insert_parameterized_exchange(ParameterizedExchange {
                group: "g".to_string(),
                exchange: ExchangeId(1),
                formula: "x + 1".to_string(),
            })
            .unwrap();
    }

    #[test]
    fn writes_mark_scope_stale() {
        let mut store = ScopeStore::new();
        store
            .insert_project_parameter(project("foo", None), false)
            .unwrap();
        assert!(!store.group("project").unwrap().fresh);
        store.set_fresh("project", true);
        store
            .insert_project_parameter(project("bar", Some("foo + 1")), false)
            .unwrap();
        assert!(!store.group("project").unwrap().fresh);
        assert_eq!(store.stale_scopes(), vec!["project".to_string()]);
    }

    #[test]
    fn snapshot_restores_everything() {
        let mut store = ScopeStore::new();
        store
            .insert_project_parameter(project("foo", None), false)
            .unwrap();
        let snap = store.snapshot();
        store
            .insert_project_parameter(project("bar", None), false)
            .unwrap();
        store
            .insert_database_parameter(db_param("db", "x"), false)
            .unwrap();
        assert_eq!(store.len(), 3);
        store.restore(snap);
        assert_eq!(store.len(), 1);
        assert!(!store.is_database("db"));
    }

    #[test]
    fn parameter_def_helpers() {
        let def = ParameterDef::formula("bar", "2 * foo");
        assert_eq!(def.formula.as_deref(), Some("2 * foo"));
        assert!(def.amount.is_none());
        let def = ParameterDef::literal("foo", 3.14);
        assert_eq!(def.amount, Some(3.14));
    }
}
