//! Parameter rename with dependent-formula rewriting.
//!
//! Renaming a parameter is only safe if every formula that resolves the
//! old name against the renamed definition is rewritten in the same
//! transaction. The rewrite is a whole-token substitution restricted to
//! formulas proven to depend on the renamed definition, so an identical
//! name shadowed in a nearer scope is left alone.

use log::debug;
use param_model::Scope;
use regex::Regex;

use crate::engine::{validate_parameter_name, DependentRef, ParameterManager};
use crate::error::{ParameterError, ParameterResult};
use crate::parser::{ParseError, Span};

impl ParameterManager {
    /// Rename `name` in `scope_name` to `new_name`.
    ///
    /// With `update_dependencies`, every dependent formula (parameters and
    /// parameterized exchanges) is rewritten token-for-token and the whole
    /// store is recalculated; without it, the rename fails with
    /// [`ParameterError::DependentInUse`] if any dependent formula exists.
    /// Renaming to the current name is a no-op.
    pub fn rename_parameter(
        &mut self,
        scope_name: &str,
        name: &str,
        new_name: &str,
        update_dependencies: bool,
    ) -> ParameterResult<()> {
        if name == new_name {
            return Ok(());
        }
        validate_parameter_name(new_name)?;

        let scope = self.store.classify(scope_name);
        let exists = match &scope {
            Scope::Project => self.store.project_parameter(name).is_some(),
            Scope::Database(db) => self.store.database_parameter(db, name).is_some(),
            Scope::Activity(group) => self.store.activity_parameter(group, name).is_some(),
        };
        if !exists {
            return Err(ParameterError::UnresolvedName {
                names: vec![name.to_string()],
            });
        }
        if self.store.names_in_scope(&scope).contains(new_name) {
            return Err(ParameterError::DuplicateName(format!(
                "`{new_name}` in scope `{scope_name}`"
            )));
        }

        let dependents = self.formula_dependents(scope_name, name)?;
        if !dependents.is_empty() && !update_dependencies {
            let mut scopes: Vec<String> = dependents
                .iter()
                .map(|d| d.scope_name().to_string())
                .collect();
            scopes.sort();
            scopes.dedup();
            return Err(ParameterError::DependentInUse {
                name: name.to_string(),
                scopes,
            });
        }

        let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(name))).map_err(|err| {
            ParameterError::Parse(ParseError {
                message: format!("cannot build rename pattern for `{name}`: {err}"),
                span: Span::default(),
            })
        })?;

        let snap = self.store.snapshot();
        match self.apply_rename(&scope, name, new_name, &pattern, &dependents) {
            Ok(()) => {
                debug!("renamed `{name}` to `{new_name}` in {scope}");
                Ok(())
            }
            Err(err) => {
                self.store.restore(snap);
                Err(err)
            }
        }
    }

    fn apply_rename(
        &mut self,
        scope: &Scope,
        name: &str,
        new_name: &str,
        pattern: &Regex,
        dependents: &[DependentRef],
    ) -> ParameterResult<()> {
        for target in dependents {
            self.rewrite_target(target, pattern, new_name)?;
        }

        match scope {
            Scope::Project => {
                let Some(mut param) = self.store.project_parameter(name).cloned() else {
                    return Err(ParameterError::UnresolvedName {
                        names: vec![name.to_string()],
                    });
                };
                self.store.delete_project_parameter(name);
                param.name = new_name.to_string();
                self.store.insert_project_parameter(param, false)?;
            }
            Scope::Database(db) => {
                let Some(mut param) = self.store.database_parameter(db, name).cloned() else {
                    return Err(ParameterError::UnresolvedName {
                        names: vec![name.to_string()],
                    });
                };
                self.store.delete_database_parameter(db, name);
                param.name = new_name.to_string();
                self.store.insert_database_parameter(param, false)?;
            }
            Scope::Activity(group) => {
                let Some(mut param) = self.store.activity_parameter(group, name).cloned() else {
                    return Err(ParameterError::UnresolvedName {
                        names: vec![name.to_string()],
                    });
                };
                self.store.delete_activity_parameter(group, name);
                param.name = new_name.to_string();
                self.store.insert_activity_parameter(param, false)?;
            }
        }

        self.recalculate_all()
    }

    fn rewrite_target(
        &mut self,
        target: &DependentRef,
        pattern: &Regex,
        new_name: &str,
    ) -> ParameterResult<()> {
        match target {
            DependentRef::Project(pname) => {
                if let Some(mut param) = self.store.project_parameter(pname).cloned() {
                    if let Some(formula) = param.formula.take() {
                        param.formula = Some(pattern.replace_all(&formula, new_name).into_owned());
                    }
                    self.store.insert_project_parameter(param, true)?;
                }
            }
            DependentRef::Database(db, pname) => {
                if let Some(mut param) = self.store.database_parameter(db, pname).cloned() {
                    if let Some(formula) = param.formula.take() {
                        param.formula = Some(pattern.replace_all(&formula, new_name).into_owned());
                    }
                    self.store.insert_database_parameter(param, true)?;
                }
            }
            DependentRef::Activity(group, pname) => {
                if let Some(mut param) = self.store.activity_parameter(group, pname).cloned() {
                    if let Some(formula) = param.formula.take() {
                        param.formula = Some(pattern.replace_all(&formula, new_name).into_owned());
                    }
                    self.store.insert_activity_parameter(param, true)?;
                }
            }
            DependentRef::Exchange(group, id) => {
                let formula = self
                    .store
                    .parameterized_exchange(*id)
                    .map(|e| e.formula.clone());
                if let Some(formula) = formula {
                    let rewritten = pattern.replace_all(&formula, new_name).into_owned();
                    self.store.set_exchange_formula(*id, rewritten);
                }
                self.store.set_fresh(group, false);
            }
        }
        Ok(())
    }
}
