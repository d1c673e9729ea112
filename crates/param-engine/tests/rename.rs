use std::cell::RefCell;
use std::rc::Rc;

use param_engine::{
    ExchangeId, MemoryHost, ParameterDef, ParameterError, ParameterManager, PROJECT_SCOPE,
};

fn three_scope_manager() -> ParameterManager {
    let mut pm = ParameterManager::new();
    pm.new_project_parameters(vec![ParameterDef::formula("bar", "2 * 2 * 2")], false)
        .unwrap();
    pm.new_database_parameters("B", vec![ParameterDef::formula("foo", "2 ** 2")], false)
        .unwrap();
    pm.new_activity_parameters(
        "A",
        "B",
        "c1",
        vec![
            ParameterDef::formula("D", "2 ** 3"),
            ParameterDef::formula("F", "foo + bar + D"),
        ],
        false,
    )
    .unwrap();
    pm.recalculate_all().unwrap();
    pm
}

#[test]
fn rename_rewrites_dependent_formulas_and_recalculates() {
    let mut pm = three_scope_manager();

    pm.rename_parameter(PROJECT_SCOPE, "bar", "baz", true).unwrap();

    assert!(pm.store().project_parameter("bar").is_none());
    assert_eq!(pm.store().project_parameter("baz").unwrap().amount, Some(8.0));
    assert_eq!(
        pm.store().activity_parameter("A", "F").unwrap().formula.as_deref(),
        Some("foo + baz + D")
    );
    assert_eq!(pm.store().activity_parameter("A", "F").unwrap().amount, Some(20.0));
    assert!(pm.store().stale_scopes().is_empty());
}

#[test]
fn rename_round_trip_restores_the_exact_formula_text() {
    let mut pm = three_scope_manager();

    pm.rename_parameter(PROJECT_SCOPE, "bar", "baz", true).unwrap();
    pm.rename_parameter(PROJECT_SCOPE, "baz", "bar", true).unwrap();

    assert_eq!(
        pm.store().activity_parameter("A", "F").unwrap().formula.as_deref(),
        Some("foo + bar + D")
    );
    assert_eq!(pm.store().activity_parameter("A", "F").unwrap().amount, Some(20.0));
}

#[test]
fn rename_without_cascade_is_refused_while_referenced() {
    let mut pm = three_scope_manager();

    let err = pm
        .rename_parameter(PROJECT_SCOPE, "bar", "baz", false)
        .unwrap_err();
    assert_eq!(
        err,
        ParameterError::DependentInUse {
            name: "bar".to_string(),
            scopes: vec!["A".to_string()],
        }
    );
    assert!(pm.store().project_parameter("bar").is_some());

    // A parameter nothing references renames freely.
    pm.rename_parameter("A", "D", "E", true).unwrap();
    assert!(pm.store().activity_parameter("A", "E").is_some());
    assert_eq!(
        pm.store().activity_parameter("A", "F").unwrap().formula.as_deref(),
        Some("foo + bar + E")
    );
}

#[test]
fn rename_validates_names_and_collisions() {
    let mut pm = three_scope_manager();

    assert!(matches!(
        pm.rename_parameter(PROJECT_SCOPE, "bar", "2fast", true),
        Err(ParameterError::Parse(_))
    ));
    assert!(matches!(
        pm.rename_parameter(PROJECT_SCOPE, "bar", "sqrt", true),
        Err(ParameterError::DuplicateName(_))
    ));
    assert!(matches!(
        pm.rename_parameter("A", "D", "F", true),
        Err(ParameterError::DuplicateName(_))
    ));
    assert!(matches!(
        pm.rename_parameter(PROJECT_SCOPE, "ghost", "spirit", true),
        Err(ParameterError::UnresolvedName { .. })
    ));
    // Renaming to the current name is a no-op.
    pm.rename_parameter(PROJECT_SCOPE, "bar", "bar", true).unwrap();
}

#[test]
fn rename_matches_whole_tokens_only() {
    let mut pm = ParameterManager::new();
    pm.new_project_parameters(
        vec![
            ParameterDef::literal("foo", 1.0),
            ParameterDef::literal("food", 2.0),
            ParameterDef::formula("m", "food + foo"),
        ],
        false,
    )
    .unwrap();
    pm.recalculate_all().unwrap();

    pm.rename_parameter(PROJECT_SCOPE, "foo", "bar", true).unwrap();

    assert_eq!(
        pm.store().project_parameter("m").unwrap().formula.as_deref(),
        Some("food + bar")
    );
    assert_eq!(pm.store().project_parameter("m").unwrap().amount, Some(3.0));
}

#[test]
fn shadowed_names_in_nearer_scopes_are_left_alone() {
    let mut pm = ParameterManager::new();
    pm.new_project_parameters(vec![ParameterDef::literal("bar", 8.0)], false)
        .unwrap();
    pm.new_activity_parameters(
        "G",
        "db",
        "c1",
        vec![
            ParameterDef::literal("bar", 100.0),
            ParameterDef::formula("F", "bar + 1"),
        ],
        false,
    )
    .unwrap();
    pm.recalculate_all().unwrap();
    assert_eq!(pm.store().activity_parameter("G", "F").unwrap().amount, Some(101.0));

    // `G` resolves `bar` locally, so renaming the project-level `bar` must
    // not touch its formula.
    pm.rename_parameter(PROJECT_SCOPE, "bar", "qux", true).unwrap();
    assert_eq!(
        pm.store().activity_parameter("G", "F").unwrap().formula.as_deref(),
        Some("bar + 1")
    );
    assert_eq!(pm.store().activity_parameter("G", "F").unwrap().amount, Some(101.0));
}

#[test]
fn rename_rewrites_parameterized_exchange_formulas() {
    let mut host = MemoryHost::new();
    host.add_node("B", "c1", vec![ParameterDef::literal("d", 4.0)]);
    host.add_exchange("B", "c1", ExchangeId(7), Some("d * 2"), 0.0);
    let host = Rc::new(RefCell::new(host));

    let mut pm = ParameterManager::new();
    pm.set_exchange_host(host.clone());
    pm.add_to_group("G", "B", "c1").unwrap();
    pm.recalculate("G").unwrap();
    assert_eq!(host.borrow().exchange_amount(ExchangeId(7)), Some(8.0));

    pm.rename_parameter("G", "d", "len", true).unwrap();

    assert_eq!(
        pm.store()
            .parameterized_exchange(ExchangeId(7))
            .unwrap()
            .formula,
        "len * 2"
    );
    assert!(pm.store().activity_parameter("G", "len").is_some());
    assert!(pm.store().stale_scopes().is_empty());
}
