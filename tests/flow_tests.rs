/// Flow traversal integration tests — exploration, fast-forward and playback
/// over the scenarios in tests/fixtures/scenarios.ron.

use narrative_flow::core::database::Database;
use narrative_flow::core::player::{FlowPlayer, FlowPlayerBuilder};
use narrative_flow::core::script::ScriptRunner;
use narrative_flow::schema::graph::{FlowGraph, PausableType, PauseMask};
use narrative_flow::schema::ids::{CloneId, FlowRef, NodeId};

fn scenario_scripts() -> ScriptRunner {
    let mut scripts = ScriptRunner::with_seed(7);
    scripts.add_condition("Game.flag", |ctx| ctx.get_bool("Game.flag"));
    scripts.add_condition("Game.x == 0", |ctx| ctx.get_int("Game.x") == 0);
    scripts.add_instruction("Game.x = 1", |ctx| {
        ctx.set("Game.x", 1);
    });
    scripts.add_instruction("Game.gold += 1", |ctx| {
        let gold = ctx.get_int("Game.gold");
        ctx.set("Game.gold", gold + 1);
    });
    scripts.add_instruction("Game.visits += 1", |ctx| {
        let visits = ctx.get_int("Game.visits");
        ctx.set("Game.visits", visits + 1);
    });
    scripts
}

fn scenario_player() -> FlowPlayerBuilder {
    let graph = FlowGraph::load_from_ron(std::path::Path::new("tests/fixtures/scenarios.ron")).unwrap();
    let db = Database::new(graph).unwrap().with_scripts(scenario_scripts());
    FlowPlayer::builder(db).pause_on(PauseMask::empty().with(PausableType::DialogueFragment))
}

/// Technical names of the nodes on each available branch, pins left out.
fn branch_names(player: &FlowPlayer) -> Vec<Vec<String>> {
    let graph = player.database().graph();
    player
        .available_branches()
        .iter()
        .map(|b| {
            b.flow_nodes(graph)
                .iter()
                .filter_map(|r| graph.node(r.id))
                .map(|n| n.technical_name.clone())
                .collect()
        })
        .collect()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn int_var(player: &FlowPlayer, name: &str) -> i64 {
    player.database().variables().get_int("Game", name).0
}

#[test]
fn condition_routes_to_matching_output() {
    let mut player = scenario_player().start_node_by_name("Cond_Start").build().unwrap();
    assert_eq!(
        branch_names(&player),
        vec![names(&["Cond_Start", "Cond_Check", "Cond_False"])]
    );

    player.variables_mut().set_bool("Game", "flag", true);
    player.update_available_branches();
    assert_eq!(
        branch_names(&player),
        vec![names(&["Cond_Start", "Cond_Check", "Cond_True"])]
    );
}

#[test]
fn alternatives_do_not_see_each_others_writes() {
    let player = scenario_player()
        .ignore_invalid_branches(false)
        .start_node_by_name("Fan_Start")
        .build()
        .unwrap();

    assert_eq!(
        branch_names(&player),
        vec![
            names(&["Fan_Start", "Fan_Write", "Fan_Left"]),
            names(&["Fan_Start", "Fan_Hub", "Fan_Right"]),
        ]
    );
    assert!(player.available_branches().iter().all(|b| b.is_valid));
    assert_eq!(int_var(&player, "x"), 0);
}

#[test]
fn playing_commits_the_branch_instructions() {
    let mut player = scenario_player().start_node_by_name("Fan_Start").build().unwrap();
    player.play(0).unwrap();
    assert_eq!(int_var(&player, "x"), 1);
    let cursor = player.cursor().unwrap();
    assert_eq!(player.database().graph().node(cursor.id).unwrap().technical_name, "Fan_Left");
}

#[test]
fn fast_forward_runs_each_instruction_once() {
    let player = scenario_player().start_node_by_name("FF_A").build().unwrap();

    let graph = player.database().graph();
    assert_eq!(player.cursor().map(|c| c.id), graph.id_by_name("FF_C"));
    assert_eq!(int_var(&player, "gold"), 2);
    assert_eq!(int_var(&player, "visits"), 2);
}

#[test]
fn start_on_pausable_node_does_not_fast_forward() {
    let player = scenario_player().start_node_by_name("Cond_Start").build().unwrap();
    assert_eq!(player.cursor(), player.start_node());
}

#[test]
fn self_loop_is_cut_at_depth_limit() {
    let player = scenario_player()
        .explore_depth_limit(5)
        .start_node_by_name("Loop")
        .build()
        .unwrap();

    let branches = player.available_branches();
    assert_eq!(branches.len(), 1);
    // the cursor, then depth 1 through 6
    assert_eq!(branches[0].path.len(), 7);
    assert_eq!(branches[0].target(), player.cursor());
}

#[test]
fn failed_input_condition_marks_branch_invalid() {
    let player = scenario_player()
        .ignore_invalid_branches(false)
        .start_node_by_name("Gate_Start")
        .build()
        .unwrap();

    let branches = player.available_branches();
    assert_eq!(branches.len(), 2);
    assert!(!branches[0].is_valid);
    assert!(branches[1].is_valid);
}

#[test]
fn invalid_branches_can_be_dropped() {
    let player = scenario_player().start_node_by_name("Gate_Start").build().unwrap();
    assert_eq!(
        branch_names(&player),
        vec![names(&["Gate_Start", "Gate_Open"])]
    );
    assert_eq!(player.available_branches()[0].index, Some(0));
}

#[test]
fn container_is_entered_through_its_input_pin() {
    let player = scenario_player()
        .pause_on(
            PauseMask::empty()
                .with(PausableType::Dialogue)
                .with(PausableType::DialogueFragment),
        )
        .start_node_by_name("Talk")
        .build()
        .unwrap();

    assert_eq!(
        branch_names(&player),
        vec![names(&["Talk", "Talk_First"])]
    );
}

#[test]
fn jump_continues_at_its_target() {
    let player = scenario_player().start_node_by_name("Jump_Start").build().unwrap();
    assert_eq!(
        branch_names(&player),
        vec![names(&["Jump_Start", "Jump_Away", "Jump_Target"])]
    );
}

#[test]
fn traversal_stays_in_the_cursor_clone_where_it_exists() {
    let mut player = scenario_player().build().unwrap();
    let start = player.database().graph().id_by_name("Clone_Start").unwrap();
    let end = player.database().graph().id_by_name("Clone_End").unwrap();
    let clone = CloneId(1);

    assert!(player
        .database_mut()
        .objects_mut()
        .clone_object(start, clone, true)
        .is_some());
    player.set_cursor_to(FlowRef::new(start, clone)).unwrap();

    let path = &player.available_branches()[0].path;
    assert_eq!(path[0], FlowRef::new(start, clone));
    assert_eq!(path[1], FlowRef::new(NodeId(8001), clone));
    assert_eq!(path.last(), Some(&FlowRef::original(end)));

    assert!(player
        .database_mut()
        .objects_mut()
        .clone_object(end, clone, true)
        .is_some());
    player.update_available_branches();
    let path = &player.available_branches()[0].path;
    assert_eq!(path.last(), Some(&FlowRef::new(end, clone)));
}

#[test]
fn settings_file_configures_the_player() {
    let player = scenario_player()
        .settings_path("tests/fixtures/settings.ron")
        .start_node_by_name("Gate_Start")
        .build()
        .unwrap();
    assert_eq!(player.settings().branch_limit, 8);
    assert!(!player.ignores_invalid_branches());
    // the builder's pause mask wins over the file
    assert!(!player.pause_on().contains(PausableType::Hub));
    assert_eq!(player.available_branches().len(), 2);
}

#[test]
fn fast_forward_onto_a_shared_pin_runs_it_once() {
    let mut player = scenario_player().start_node_by_name("Spend_Start").build().unwrap();

    // both branches leave through the paying pin, so fast-forward stops on it
    assert_eq!(player.cursor(), Some(FlowRef::original(NodeId(9101))));
    assert_eq!(int_var(&player, "gold"), 1);
    assert_eq!(
        branch_names(&player),
        vec![names(&["Spend_Left"]), names(&["Spend_Right"])]
    );

    player.play(0).unwrap();
    assert_eq!(int_var(&player, "gold"), 1);
    let cursor = player.cursor().unwrap();
    assert_eq!(player.database().graph().node(cursor.id).unwrap().technical_name, "Spend_Left");
}

#[test]
fn failed_gate_invalidates_every_branch_behind_it() {
    let player = scenario_player()
        .ignore_invalid_branches(false)
        .start_node_by_name("Guard_Start")
        .build()
        .unwrap();

    assert_eq!(
        branch_names(&player),
        vec![
            names(&["Guard_Start", "Guard_Hub", "Guard_Left"]),
            names(&["Guard_Start", "Guard_Hub", "Guard_Right"]),
        ]
    );
    assert!(player.available_branches().iter().all(|b| !b.is_valid));
}

#[test]
fn open_gate_keeps_every_branch_behind_it() {
    let mut player = scenario_player().start_node_by_name("Guard_Start").build().unwrap();
    assert!(player.available_branches().is_empty());

    player.variables_mut().set_bool("Game", "flag", true);
    player.update_available_branches();
    assert_eq!(player.available_branches().len(), 2);
    assert!(player.available_branches().iter().all(|b| b.is_valid));
}
