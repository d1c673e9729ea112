use std::cell::RefCell;
use std::rc::Rc;

use param_engine::{
    ExchangeHost, ExchangeId, MemoryHost, ParameterDef, ParameterError, ParameterManager,
};

fn host_with_node() -> Rc<RefCell<MemoryHost>> {
    let mut host = MemoryHost::new();
    host.add_node(
        "B",
        "c1",
        vec![
            ParameterDef::literal("d", 4.0),
            ParameterDef::formula("f", "d * 3"),
        ],
    );
    host.add_exchange("B", "c1", ExchangeId(7), Some("d * 2"), 0.0);
    host.add_exchange("B", "c1", ExchangeId(8), None, 1.5);
    Rc::new(RefCell::new(host))
}

#[test]
fn add_to_group_copies_node_parameters_and_exchanges() {
    let host = host_with_node();
    let mut pm = ParameterManager::new();
    pm.set_exchange_host(host.clone());

    let count = pm.add_to_group("G", "B", "c1").unwrap();
    assert_eq!(count, 2);

    // The definitions moved off the node into activity parameter rows.
    assert!(host.borrow().node_parameters("B", "c1").is_empty());
    assert_eq!(pm.store().activity_parameter("G", "d").unwrap().code, "c1");
    assert!(pm.store().parameterized_exchange(ExchangeId(7)).is_some());
    // The formula-less exchange is not parameterized.
    assert!(pm.store().parameterized_exchange(ExchangeId(8)).is_none());
    assert!(!pm.store().group("G").unwrap().fresh);
}

#[test]
fn recalculation_pushes_exchange_amounts_to_the_host() {
    let host = host_with_node();
    let mut pm = ParameterManager::new();
    pm.set_exchange_host(host.clone());
    pm.add_to_group("G", "B", "c1").unwrap();

    pm.recalculate("G").unwrap();

    assert_eq!(pm.store().activity_parameter("G", "f").unwrap().amount, Some(12.0));
    assert_eq!(host.borrow().exchange_amount(ExchangeId(7)), Some(8.0));
    // Untouched exchange keeps its stored amount.
    assert_eq!(host.borrow().exchange_amount(ExchangeId(8)), Some(1.5));
    assert!(host.borrow().is_modified("B"));
}

#[test]
fn failed_recalculation_writes_nothing_to_the_host() {
    let mut host = MemoryHost::new();
    host.add_node("B", "c1", vec![ParameterDef::literal("d", 4.0)]);
    host.add_exchange("B", "c1", ExchangeId(7), Some("d * missing"), 0.0);
    let host = Rc::new(RefCell::new(host));

    let mut pm = ParameterManager::new();
    pm.set_exchange_host(host.clone());
    pm.add_to_group("G", "B", "c1").unwrap();

    let err = pm.recalculate("G").unwrap_err();
    assert!(matches!(err, ParameterError::UnresolvedName { .. }));
    assert_eq!(host.borrow().exchange_amount(ExchangeId(7)), Some(0.0));
}

#[test]
fn add_to_group_without_host_or_node_is_unknown() {
    let mut pm = ParameterManager::new();
    let err = pm.add_to_group("G", "B", "c1").unwrap_err();
    assert!(matches!(err, ParameterError::UnknownScope(_)));

    pm.set_exchange_host(Rc::new(RefCell::new(MemoryHost::new())));
    let err = pm.add_to_group("G", "B", "nope").unwrap_err();
    assert!(matches!(err, ParameterError::UnknownScope(_)));
}

#[test]
fn remove_from_group_refuses_while_referenced() {
    let host = host_with_node();
    let mut pm = ParameterManager::new();
    pm.set_exchange_host(host.clone());
    pm.add_to_group("G", "B", "c1").unwrap();

    // A sibling group references `d` through its declared search order.
    pm.new_activity_parameters(
        "G2",
        "B",
        "c2",
        vec![ParameterDef::formula("e", "d * 2")],
        false,
    )
    .unwrap();
    pm.set_group_order("G2", vec!["G".to_string()]).unwrap();
    pm.recalculate_all().unwrap();

    let err = pm.remove_from_group("G", "B", "c1", false).unwrap_err();
    assert_eq!(
        err,
        ParameterError::DependentInUse {
            name: "d".to_string(),
            scopes: vec!["G2".to_string()],
        }
    );
    assert!(pm.store().activity_parameter("G", "d").is_some());

    let removed = pm.remove_from_group("G", "B", "c1", true).unwrap();
    assert_eq!(removed, 2);
    assert!(pm.store().activity_parameter("G", "d").is_none());
    assert!(pm.store().parameterized_exchange(ExchangeId(7)).is_none());
    assert!(!pm.store().group("G").unwrap().fresh);
}

#[test]
fn references_within_the_removed_node_do_not_block() {
    let host = host_with_node();
    let mut pm = ParameterManager::new();
    pm.set_exchange_host(host);
    pm.add_to_group("G", "B", "c1").unwrap();
    pm.recalculate("G").unwrap();

    // `f = d * 3` and the exchange both reference `d`, but every reference
    // lives on the node being removed.
    let removed = pm.remove_from_group("G", "B", "c1", false).unwrap();
    assert_eq!(removed, 2);
}
