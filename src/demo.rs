//! Embedded demo content: the tavern conversation and its compiled scripts.

use thiserror::Error;
use tracing::warn;

use crate::core::database::{Database, DatabaseError};
use crate::core::script::{ScriptContext, ScriptRunner};
use crate::schema::graph::{FlowGraph, GraphError};
use crate::schema::ids::CloneId;
use crate::schema::value::Value;

pub const TAVERN_GRAPH: &str = include_str!("../demo_data/tavern/graph.ron");

/// Technical name of the tavern's entry node.
pub const TAVERN_START: &str = "Tavern_Enter";

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

/// The tavern graph with its scripts registered on a seeded runner.
pub fn tavern(seed: u64) -> Result<Database, DemoError> {
    let graph = FlowGraph::parse_ron(TAVERN_GRAPH)?;
    let mut scripts = ScriptRunner::with_seed(seed);
    register_tavern_scripts(&mut scripts);
    Ok(Database::new(graph)?.with_scripts(scripts))
}

fn barkeep_patience(ctx: &mut ScriptContext<'_>) -> Option<i64> {
    let barkeep = ctx.get_obj("Chr_Barkeep", CloneId::ORIGINAL)?;
    match ctx.get_prop(barkeep, "patience") {
        Ok(value) => value.as_int().ok(),
        Err(e) => {
            warn!(error = %e, "barkeep has no patience");
            None
        }
    }
}

/// Register every script fragment used by the tavern graph.
pub fn register_tavern_scripts(scripts: &mut ScriptRunner) {
    scripts.add_condition("Tavern.gold >= 2", |ctx| ctx.get_int("Tavern.gold") >= 2);
    scripts.add_condition("Tavern.has_ale", |ctx| ctx.get_bool("Tavern.has_ale"));
    scripts.add_condition(
        r#"getProp(getObj("Chr_Barkeep"), "patience") > 0"#,
        |ctx| barkeep_patience(ctx).is_some_and(|p| p > 0),
    );

    scripts.add_instruction("Quest.visits += 1", |ctx| {
        let visits = ctx.get_int("Quest.visits");
        ctx.set("Quest.visits", visits + 1);
    });
    scripts.add_instruction("Tavern.gold -= 2; Tavern.has_ale = true", |ctx| {
        let gold = ctx.get_int("Tavern.gold");
        ctx.set("Tavern.gold", gold - 2);
        ctx.set("Tavern.has_ale", true);
    });
    scripts.add_instruction(
        r#"decrementProp(getObj("Chr_Barkeep"), "patience")"#,
        |ctx| {
            let Some(barkeep) = ctx.get_obj("Chr_Barkeep", CloneId::ORIGINAL) else {
                return;
            };
            if let Err(e) = ctx.decrement_prop(barkeep, "patience", 1) {
                warn!(error = %e, "could not lower patience");
            }
        },
    );
    scripts.add_instruction("Quest.accepted = true", |ctx| {
        ctx.set("Quest.accepted", true);
    });
    scripts.add_instruction(r#"print("Leaving with {0} gold", Tavern.gold)"#, |ctx| {
        let gold = ctx.get("Tavern.gold");
        ctx.print("Leaving with {0} gold", &[gold]);
    });
}

/// Compact one-line rendering of a value for previews.
pub fn describe_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}
