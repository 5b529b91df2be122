//! WASM bindings for narrative-flow — powers the interactive tavern demo.

use wasm_bindgen::prelude::*;

use narrative_flow::core::player::{Branch, FlowPlayer};
use narrative_flow::demo;
use narrative_flow::schema::graph::FlowGraph;
use narrative_flow::schema::ids::FlowRef;

// ---------------------------------------------------------------------------
// JSON helper types for communication across the WASM boundary
// ---------------------------------------------------------------------------
#[derive(serde::Serialize)]
struct NodeInfo {
    id: String,
    clone: i32,
    technical_name: String,
    kind: String,
    text: String,
    speaker: Option<String>,
}

#[derive(serde::Serialize)]
struct BranchInfo {
    index: usize,
    valid: bool,
    target: Option<NodeInfo>,
    /// Technical names of the nodes passed through, pins left out.
    steps: Vec<String>,
}

#[derive(serde::Serialize)]
struct VariableInfo {
    namespace: String,
    name: String,
    value: String,
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------
fn node_info(graph: &FlowGraph, node: FlowRef) -> Option<NodeInfo> {
    let n = graph.node(node.id)?;
    Some(NodeInfo {
        id: n.id.to_string(),
        clone: node.clone.0,
        technical_name: n.technical_name.clone(),
        kind: n.kind.name().to_string(),
        text: n.text.clone(),
        speaker: n.speaker.and_then(|s| graph.node(s)).map(|s| s.text.clone()),
    })
}

fn branch_info(graph: &FlowGraph, branch: &Branch) -> BranchInfo {
    BranchInfo {
        index: branch.index.unwrap_or(0),
        valid: branch.is_valid,
        target: branch.target().and_then(|t| node_info(graph, t)),
        steps: branch
            .flow_nodes(graph)
            .into_iter()
            .filter_map(|r| graph.node(r.id))
            .map(|n| n.technical_name.clone())
            .collect(),
    }
}

fn build_player(seed: u64) -> Result<FlowPlayer, JsError> {
    let db = demo::tavern(seed).map_err(|e| JsError::new(&format!("Demo load error: {e}")))?;
    FlowPlayer::builder(db)
        .start_node_by_name(demo::TAVERN_START)
        .build()
        .map_err(|e| JsError::new(&format!("Player build error: {e}")))
}

// ---------------------------------------------------------------------------
// TavernDemo — the main exported struct
// ---------------------------------------------------------------------------
#[wasm_bindgen]
pub struct TavernDemo {
    player: FlowPlayer,
    seed: u64,
}

#[wasm_bindgen]
impl TavernDemo {
    /// Start the tavern conversation with a seeded script runner.
    #[wasm_bindgen(constructor)]
    pub fn new(seed: u64) -> Result<TavernDemo, JsError> {
        Ok(TavernDemo {
            player: build_player(seed)?,
            seed,
        })
    }

    /// The available branches as a JSON array.
    pub fn branches(&self) -> Result<String, JsError> {
        let graph = self.player.database().graph();
        let branches: Vec<BranchInfo> = self
            .player
            .available_branches()
            .iter()
            .map(|b| branch_info(graph, b))
            .collect();
        serde_json::to_string(&branches).map_err(|e| JsError::new(&e.to_string()))
    }

    /// Play branch `index` and return the new cursor as JSON.
    pub fn play(&mut self, index: usize) -> Result<String, JsError> {
        self.player
            .play(index)
            .map_err(|e| JsError::new(&format!("Play error: {e}")))?;
        self.cursor()
    }

    /// The node the player is paused on as JSON, or `null`.
    pub fn cursor(&self) -> Result<String, JsError> {
        let graph = self.player.database().graph();
        let info = self.player.cursor().and_then(|c| node_info(graph, c));
        serde_json::to_string(&info).map_err(|e| JsError::new(&e.to_string()))
    }

    /// Every variable of the active set as a JSON array.
    pub fn variables(&self) -> Result<String, JsError> {
        let vars: Vec<VariableInfo> = self
            .player
            .variables()
            .map(|store| {
                store
                    .iter()
                    .map(|(namespace, name, value)| VariableInfo {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        value: demo::describe_value(value),
                    })
                    .collect()
            })
            .unwrap_or_default();
        serde_json::to_string(&vars).map_err(|e| JsError::new(&e.to_string()))
    }

    /// Start over with fresh state and the original seed.
    pub fn reset(&mut self) -> Result<(), JsError> {
        self.player = build_player(self.seed)?;
        Ok(())
    }
}
