use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved name of the project-wide scope.
///
/// No database or activity group may use this name as its own scope key.
pub const PROJECT_SCOPE: &str = "project";

/// Open metadata map carried on every parameter record.
///
/// The engine never interprets these values; they are stored and passed
/// through verbatim.
pub type Extra = BTreeMap<String, serde_json::Value>;

/// Identifier of an externally owned exchange record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exchange:{}", self.0)
    }
}

/// A project-wide parameter. Key: `name` (globally unique).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Extra,
}

/// A per-database parameter. Key: `(database, name)`.
///
/// `database` must not equal [`PROJECT_SCOPE`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseParameter {
    pub database: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Extra,
}

/// A per-activity-group parameter. Key: `(group, name)`.
///
/// `(database, code)` identifies the bound external node; the pair may
/// belong to at most one group at a time. `group` must not equal
/// [`PROJECT_SCOPE`] or any known database name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityParameter {
    pub group: String,
    pub database: String,
    pub code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Extra,
}

/// A numeric field on an externally owned record, derived by evaluating
/// `formula` against the symbol table of `group`.
///
/// `group` must reference an existing [`Group`] row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterizedExchange {
    pub group: String,
    pub exchange: ExchangeId,
    pub formula: String,
}

/// Persisted state of a single named scope: freshness plus the explicit
/// search order over sibling activity-level scopes.
///
/// `order` is most-local first and excludes the reserved names (the project
/// scope and database names), which are implicit and always searched last.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub fresh: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
}

impl Group {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fresh: true,
            order: Vec::new(),
        }
    }
}

/// Directed "depends-on" edge between two scopes, unique per pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupDependency {
    pub group: String,
    pub depends: String,
}

/// Input shape for batch parameter definition, and for parameter
/// definitions carried on external nodes before they are bound to a group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Extra,
}

impl ParameterDef {
    #[must_use]
    pub fn literal(name: impl Into<String>, amount: f64) -> Self {
        Self {
            name: name.into(),
            amount: Some(amount),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn formula(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: Some(formula.into()),
            ..Self::default()
        }
    }
}

/// One of the three nesting levels a scope name can refer to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Project,
    Database(String),
    Activity(String),
}

impl Scope {
    /// The scope's persisted name (the `Group` row key).
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Scope::Project => PROJECT_SCOPE,
            Scope::Database(name) | Scope::Activity(name) => name,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Project => f.write_str("project scope"),
            Scope::Database(name) => write!(f, "database scope `{name}`"),
            Scope::Activity(name) => write!(f, "activity group `{name}`"),
        }
    }
}
