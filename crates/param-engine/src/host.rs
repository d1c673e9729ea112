//! Seam to the externally owned records that carry parameterized exchanges.
//!
//! The engine does not own activity records or their exchanges; a host
//! implements [`ExchangeHost`] to let the engine read parameter definitions
//! carried on an external node, and to receive recalculated exchange
//! amounts. [`MemoryHost`] is a self-contained implementation for tests
//! and embedders without their own record store.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use param_model::{ExchangeId, ParameterDef};

/// Host-side view of the external records bound to activity groups.
pub trait ExchangeHost {
    /// Whether the node `(database, code)` exists on the host.
    fn has_node(&self, database: &str, code: &str) -> bool;

    /// Parameter definitions carried on the node, in definition order.
    fn node_parameters(&self, database: &str, code: &str) -> Vec<ParameterDef>;

    /// Drop the node's own parameter definitions after they have been
    /// copied into activity parameter rows.
    fn clear_node_parameters(&mut self, database: &str, code: &str);

    /// The node's formula-bearing exchanges, in exchange-id order.
    fn node_exchanges(&self, database: &str, code: &str) -> Vec<(ExchangeId, String)>;

    /// Push a recalculated amount into the bound numeric field, marking
    /// the owning record's container as modified.
    fn write_exchange_amount(&mut self, exchange: ExchangeId, amount: f64);
}

/// One numeric exchange field on an external node.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeRecord {
    pub formula: Option<String>,
    pub amount: f64,
}

#[derive(Clone, Debug, Default)]
struct NodeRecord {
    parameters: Vec<ParameterDef>,
    exchanges: BTreeMap<ExchangeId, ExchangeRecord>,
}

/// In-memory [`ExchangeHost`].
#[derive(Clone, Debug, Default)]
pub struct MemoryHost {
    nodes: BTreeMap<(String, String), NodeRecord>,
    owner: BTreeMap<ExchangeId, (String, String)>,
    modified: BTreeSet<String>,
}

impl MemoryHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, database: &str, code: &str, parameters: Vec<ParameterDef>) {
        self.nodes
            .entry((database.to_string(), code.to_string()))
            .or_default()
            .parameters = parameters;
    }

    pub fn add_exchange(
        &mut self,
        database: &str,
        code: &str,
        exchange: ExchangeId,
        formula: Option<&str>,
        amount: f64,
    ) {
        let key = (database.to_string(), code.to_string());
        self.nodes.entry(key.clone()).or_default().exchanges.insert(
            exchange,
            ExchangeRecord {
                formula: formula.map(str::to_string),
                amount,
            },
        );
        self.owner.insert(exchange, key);
    }

    #[must_use]
    pub fn exchange_amount(&self, exchange: ExchangeId) -> Option<f64> {
        let (database, code) = self.owner.get(&exchange)?;
        self.nodes
            .get(&(database.clone(), code.clone()))?
            .exchanges
            .get(&exchange)
            .map(|e| e.amount)
    }

    /// Whether any exchange in `database` received a recalculated amount.
    #[must_use]
    pub fn is_modified(&self, database: &str) -> bool {
        self.modified.contains(database)
    }
}

impl ExchangeHost for MemoryHost {
    fn has_node(&self, database: &str, code: &str) -> bool {
        self.nodes
            .contains_key(&(database.to_string(), code.to_string()))
    }

    fn node_parameters(&self, database: &str, code: &str) -> Vec<ParameterDef> {
        self.nodes
            .get(&(database.to_string(), code.to_string()))
            .map(|node| node.parameters.clone())
            .unwrap_or_default()
    }

    fn clear_node_parameters(&mut self, database: &str, code: &str) {
        if let Some(node) = self
            .nodes
            .get_mut(&(database.to_string(), code.to_string()))
        {
            node.parameters.clear();
            self.modified.insert(database.to_string());
        }
    }

    fn node_exchanges(&self, database: &str, code: &str) -> Vec<(ExchangeId, String)> {
        self.nodes
            .get(&(database.to_string(), code.to_string()))
            .map(|node| {
                node.exchanges
                    .iter()
                    .filter_map(|(id, e)| e.formula.clone().map(|f| (*id, f)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write_exchange_amount(&mut self, exchange: ExchangeId, amount: f64) {
        let Some((database, code)) = self.owner.get(&exchange).cloned() else {
            return;
        };
        if let Some(record) = self
            .nodes
            .get_mut(&(database.clone(), code))
            .and_then(|node| node.exchanges.get_mut(&exchange))
        {
            record.amount = amount;
            self.modified.insert(database);
        }
    }
}

/// Shared handle so a caller can keep inspecting the host after handing it
/// to the engine.
impl ExchangeHost for Rc<RefCell<MemoryHost>> {
    fn has_node(&self, database: &str, code: &str) -> bool {
        self.borrow().has_node(database, code)
    }

    fn node_parameters(&self, database: &str, code: &str) -> Vec<ParameterDef> {
        self.borrow().node_parameters(database, code)
    }

    fn clear_node_parameters(&mut self, database: &str, code: &str) {
        self.borrow_mut().clear_node_parameters(database, code);
    }

    fn node_exchanges(&self, database: &str, code: &str) -> Vec<(ExchangeId, String)> {
        self.borrow().node_exchanges(database, code)
    }

    fn write_exchange_amount(&mut self, exchange: ExchangeId, amount: f64) {
        self.borrow_mut().write_exchange_amount(exchange, amount);
    }
}
