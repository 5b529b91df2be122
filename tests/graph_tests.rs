/// Graph loading tests — RON parsing, validation errors and lint output.

use narrative_flow::core::database::{Database, VariableSet};
use narrative_flow::schema::graph::{FlowGraph, FlowObject, GraphError, NodeKind, Severity};
use narrative_flow::schema::ids::{CloneId, NodeId};
use narrative_flow::schema::value::Value;

#[test]
fn scenarios_fixture_indexes_nodes_and_pins() {
    let graph = FlowGraph::load_from_ron(std::path::Path::new("tests/fixtures/scenarios.ron")).unwrap();

    let check = graph.id_by_name("Cond_Check").unwrap();
    let node = graph.node(check).unwrap();
    assert!(matches!(node.kind, NodeKind::Condition { .. }));
    assert_eq!(node.output_pins.len(), 2);

    match graph.object(NodeId(1101)) {
        Some(FlowObject::OutputPin { owner, .. }) => assert_eq!(owner.id, check),
        other => panic!("expected an output pin, got {other:?}"),
    }
    match graph.object(NodeId(2400)) {
        Some(FlowObject::InputPin { pin, .. }) => assert_eq!(pin.script, "Game.x == 0"),
        other => panic!("expected an input pin, got {other:?}"),
    }
    assert!(graph.object(NodeId(9999)).is_none());
}

#[test]
fn scenarios_fixture_has_no_lint_errors() {
    let graph = FlowGraph::load_from_ron(std::path::Path::new("tests/fixtures/scenarios.ron")).unwrap();
    let issues = graph.lint();
    assert!(issues.iter().all(|i| i.severity == Severity::Warning));
    // the dialogue's own output pin is never connected
    assert!(issues.iter().any(|i| i.object == NodeId(6001)));
}

#[test]
fn condition_needs_two_outputs() {
    let input = r#"(
        packages: [(name: "p", is_default: true, objects: [
            (id: 1, kind: Condition(expression: "Game.flag"), output_pins: [(id: 101)]),
        ])],
    )"#;
    assert!(matches!(
        FlowGraph::parse_ron(input),
        Err(GraphError::MalformedCondition { pins: 1, .. })
    ));
}

#[test]
fn pin_ids_must_be_unique() {
    let input = r#"(
        packages: [(name: "p", objects: [
            (id: 1, kind: Hub, input_pins: [(id: 100)]),
            (id: 2, kind: Hub, input_pins: [(id: 100)]),
        ])],
    )"#;
    assert!(matches!(
        FlowGraph::parse_ron(input),
        Err(GraphError::DuplicateId(NodeId(100)))
    ));
}

#[test]
fn float_variables_are_rejected() {
    let input = r#"(
        variables: [(name: "Game", variables: [(name: "speed", value: Float(1.5))])],
    )"#;
    assert!(matches!(
        FlowGraph::parse_ron(input),
        Err(GraphError::InvalidVariable { .. })
    ));
}

#[test]
fn dangling_connection_is_a_lint_error() {
    let input = r#"(
        packages: [(name: "p", objects: [
            (id: 1, kind: DialogueFragment,
             output_pins: [(id: 101, connections: [(target: 9, target_pin: 900)])]),
        ])],
    )"#;
    let graph = FlowGraph::parse_ron(input).unwrap();
    let errors: Vec<_> = graph
        .lint()
        .into_iter()
        .filter(|i| i.severity == Severity::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].object, NodeId(101));
}

#[test]
fn database_starts_with_default_packages_and_variables() {
    let graph = FlowGraph::load_from_ron(std::path::Path::new("demo_data/tavern/graph.ron")).unwrap();
    let mut db = Database::new(graph).unwrap();

    assert_eq!(db.loaded_packages(), ["tavern".to_string()]);
    assert!(db.is_default_package("tavern"));
    assert!(!db.is_default_package("cellar"));
    assert_eq!(db.variables().get("Tavern", "mood"), (Value::from("calm"), true));

    let barkeep = db.objects_mut().get_by_name("Chr_Barkeep", CloneId::ORIGINAL).unwrap();
    let state = db.objects().object(barkeep).unwrap();
    assert_eq!(state.property("Trade.ale_price"), Some(&Value::Int(2)));

    let replay = VariableSet::Named("replay".to_string());
    db.variable_set_mut(&replay).set_int("Tavern", "gold", 50);
    assert_eq!(db.variables().get_int("Tavern", "gold").0, 5);
    assert_eq!(db.variable_set(&replay).unwrap().get_int("Tavern", "gold").0, 50);
}
