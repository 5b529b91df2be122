//! The flow player: speculative traversal of the flow graph, branch
//! selection and commitment.
//!
//! From the cursor the player explores every reachable path up to the next
//! pausable object. Conditions and instructions met on the way run inside
//! shadow levels, so exploring never changes live state. Playing a branch
//! re-runs its instructions for real and moves the cursor to its end.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::database::{Database, DatabaseError, VariableSet};
use crate::core::script::MethodProvider;
use crate::core::shadow::{ShadowLevel, ShadowScope, ShadowStateManager};
use crate::core::variables::VariableStore;
use crate::schema::fragment::FragmentId;
use crate::schema::graph::{Connection, FlowGraph, FlowNode, FlowObject, NodeKind, PauseMask};
use crate::schema::ids::{CloneId, FlowRef, NodeId};

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("branch {index} not available ({available} branches)")]
    BranchNotFound { index: usize, available: usize },
    #[error("flow object not found: {0}")]
    InvalidNode(String),
}

/// One candidate continuation from the cursor to the next pause point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Every flow object passed through, pins included, starting at the cursor.
    pub path: Vec<FlowRef>,
    /// `false` if an input pin condition on the way evaluated false.
    pub is_valid: bool,
    /// Position in the player's branch list.
    pub index: Option<usize>,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            path: Vec::new(),
            is_valid: true,
            index: None,
        }
    }
}

impl Branch {
    fn ending_at(node: FlowRef) -> Self {
        Self {
            path: vec![node],
            ..Self::default()
        }
    }

    /// Where the cursor lands when this branch is played.
    pub fn target(&self) -> Option<FlowRef> {
        self.path.last().copied()
    }

    /// The path without pins.
    pub fn flow_nodes(&self, graph: &FlowGraph) -> Vec<FlowRef> {
        self.path
            .iter()
            .copied()
            .filter(|r| graph.node(r.id).is_some())
            .collect()
    }
}

/// Player configuration, loadable from RON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    /// Object types the player stops at.
    pub pause_on: PauseMask,
    /// Maximum number of branches collected in one update.
    pub branch_limit: usize,
    /// Maximum path length explored from the cursor.
    pub explore_depth_limit: u32,
    /// Maximum nesting of speculative scopes.
    pub shadow_level_limit: ShadowLevel,
    /// Drop branches whose conditions failed instead of reporting them invalid.
    pub ignore_invalid_branches: bool,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            pause_on: PauseMask::default(),
            branch_limit: 32,
            explore_depth_limit: 128,
            shadow_level_limit: 10,
            ignore_invalid_branches: true,
        }
    }
}

impl PlayerSettings {
    /// Load settings from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<Self, PlayerError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse settings from a RON string. Missing fields take their defaults.
    pub fn parse_ron(input: &str) -> Result<Self, PlayerError> {
        Ok(ron::from_str(input)?)
    }
}

/// Start or end of a speculative scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowOp {
    Started(ShadowLevel),
    Ended(ShadowLevel),
}

enum StartNode {
    Id(NodeId),
    Name(String),
}

/// Builder for constructing a [`FlowPlayer`].
pub struct FlowPlayerBuilder {
    database: Database,
    settings: PlayerSettings,
    settings_path: Option<PathBuf>,
    pause_on: Option<PauseMask>,
    branch_limit: Option<usize>,
    explore_depth_limit: Option<u32>,
    shadow_level_limit: Option<ShadowLevel>,
    ignore_invalid_branches: Option<bool>,
    start_node: Option<StartNode>,
    methods: Option<Box<dyn MethodProvider>>,
    variable_set: VariableSet,
}

impl FlowPlayerBuilder {
    /// Base settings. Individual setters override them.
    pub fn settings(mut self, settings: PlayerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Read base settings from a RON file during `build()`.
    pub fn settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn pause_on(mut self, mask: PauseMask) -> Self {
        self.pause_on = Some(mask);
        self
    }

    pub fn branch_limit(mut self, limit: usize) -> Self {
        self.branch_limit = Some(limit);
        self
    }

    pub fn explore_depth_limit(mut self, limit: u32) -> Self {
        self.explore_depth_limit = Some(limit);
        self
    }

    pub fn shadow_level_limit(mut self, limit: ShadowLevel) -> Self {
        self.shadow_level_limit = Some(limit);
        self
    }

    pub fn ignore_invalid_branches(mut self, ignore: bool) -> Self {
        self.ignore_invalid_branches = Some(ignore);
        self
    }

    pub fn start_node(mut self, id: NodeId) -> Self {
        self.start_node = Some(StartNode::Id(id));
        self
    }

    pub fn start_node_by_name(mut self, technical_name: impl Into<String>) -> Self {
        self.start_node = Some(StartNode::Name(technical_name.into()));
        self
    }

    pub fn methods(mut self, provider: impl MethodProvider + 'static) -> Self {
        self.methods = Some(Box::new(provider));
        self
    }

    /// Run scripts against a named variable set instead of the default one.
    pub fn variable_set(mut self, name: impl Into<String>) -> Self {
        self.variable_set = VariableSet::Named(name.into());
        self
    }

    pub fn build(self) -> Result<FlowPlayer, PlayerError> {
        let mut settings = match &self.settings_path {
            Some(path) => PlayerSettings::load_from_ron(path)?,
            None => self.settings,
        };
        if let Some(mask) = self.pause_on {
            settings.pause_on = mask;
        }
        if let Some(limit) = self.branch_limit {
            settings.branch_limit = limit;
        }
        if let Some(limit) = self.explore_depth_limit {
            settings.explore_depth_limit = limit;
        }
        if let Some(limit) = self.shadow_level_limit {
            settings.shadow_level_limit = limit;
        }
        if let Some(ignore) = self.ignore_invalid_branches {
            settings.ignore_invalid_branches = ignore;
        }

        let mut player = FlowPlayer {
            db: self.database,
            settings,
            variable_set: self.variable_set,
            methods: self.methods,
            start_on: None,
            cursor: None,
            branches: Vec::new(),
            shadow_level: 0,
            finished_pin: None,
            paused_observers: Vec::new(),
            branches_observers: Vec::new(),
            shadow_observers: Vec::new(),
        };
        match self.start_node {
            Some(StartNode::Id(id)) => player.set_start_node(id)?,
            Some(StartNode::Name(name)) => player.set_start_node_by_name(&name)?,
            None => {}
        }
        Ok(player)
    }
}

/// Walks the flow graph from a cursor, offering branches to play.
pub struct FlowPlayer {
    db: Database,
    settings: PlayerSettings,
    variable_set: VariableSet,
    methods: Option<Box<dyn MethodProvider>>,
    start_on: Option<FlowRef>,
    cursor: Option<FlowRef>,
    branches: Vec<Branch>,
    shadow_level: ShadowLevel,
    /// Output pin already executed by `finish_current_paused_object`.
    finished_pin: Option<FlowRef>,
    paused_observers: Vec<Box<dyn FnMut(FlowRef)>>,
    branches_observers: Vec<Box<dyn FnMut(&[Branch])>>,
    shadow_observers: Vec<Box<dyn FnMut(ShadowOp)>>,
}

impl std::fmt::Debug for FlowPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowPlayer")
            .field("settings", &self.settings)
            .field("start_on", &self.start_on)
            .field("cursor", &self.cursor)
            .field("branches", &self.branches.len())
            .field("shadow_level", &self.shadow_level)
            .finish_non_exhaustive()
    }
}

impl FlowPlayer {
    pub fn builder(database: Database) -> FlowPlayerBuilder {
        FlowPlayerBuilder {
            database,
            settings: PlayerSettings::default(),
            settings_path: None,
            pause_on: None,
            branch_limit: None,
            explore_depth_limit: None,
            shadow_level_limit: None,
            ignore_invalid_branches: None,
            start_node: None,
            methods: None,
            variable_set: VariableSet::Default,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    /// The variable set scripts currently run against.
    pub fn variables(&self) -> Option<&VariableStore> {
        self.db.variable_set(&self.variable_set)
    }

    pub fn variables_mut(&mut self) -> &mut VariableStore {
        self.db.variable_set_mut(&self.variable_set)
    }

    pub fn variable_set(&self) -> &VariableSet {
        &self.variable_set
    }

    pub fn set_variable_set(&mut self, set: VariableSet) {
        self.variable_set = set;
    }

    pub fn set_methods(&mut self, provider: impl MethodProvider + 'static) {
        self.methods = Some(Box::new(provider));
    }

    pub fn pause_on(&self) -> PauseMask {
        self.settings.pause_on
    }

    pub fn set_pause_on(&mut self, mask: PauseMask) {
        self.settings.pause_on = mask;
    }

    pub fn ignores_invalid_branches(&self) -> bool {
        self.settings.ignore_invalid_branches
    }

    pub fn set_ignore_invalid_branches(&mut self, ignore: bool) {
        self.settings.ignore_invalid_branches = ignore;
    }

    pub fn start_node(&self) -> Option<FlowRef> {
        self.start_on
    }

    pub fn cursor(&self) -> Option<FlowRef> {
        self.cursor
    }

    pub fn available_branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Called with the cursor whenever the player comes to rest.
    pub fn on_player_paused(&mut self, observer: impl FnMut(FlowRef) + 'static) {
        self.paused_observers.push(Box::new(observer));
    }

    /// Called with the new branch list after every update that pauses.
    pub fn on_branches_updated(&mut self, observer: impl FnMut(&[Branch]) + 'static) {
        self.branches_observers.push(Box::new(observer));
    }

    pub fn on_shadow_op(&mut self, observer: impl FnMut(ShadowOp) + 'static) {
        self.shadow_observers.push(Box::new(observer));
    }

    /// Make `id` the start node and move the cursor there.
    pub fn set_start_node(&mut self, id: NodeId) -> Result<(), PlayerError> {
        let start = FlowRef::original(id);
        if !self.exists(start) {
            warn!(node = %id, "start node not found");
            return Err(PlayerError::InvalidNode(id.to_string()));
        }
        self.start_on = Some(start);
        self.set_cursor_to(start)
    }

    pub fn set_start_node_by_name(&mut self, technical_name: &str) -> Result<(), PlayerError> {
        match self.db.objects().id_by_name(technical_name) {
            Some(id) => self.set_start_node(id),
            None => {
                warn!(name = technical_name, "start node not found");
                Err(PlayerError::InvalidNode(technical_name.to_string()))
            }
        }
    }

    /// Move the cursor and recompute the available branches.
    pub fn set_cursor_to(&mut self, node: FlowRef) -> Result<(), PlayerError> {
        if !self.exists(node) {
            warn!(%node, "cursor target not found");
            return Err(PlayerError::InvalidNode(node.to_string()));
        }
        self.cursor = Some(node);
        self.finished_pin = None;
        self.update_available_branches();
        Ok(())
    }

    fn exists(&self, node: FlowRef) -> bool {
        self.resolve(self.db.graph(), node).is_some()
    }

    /// Resolve `node` in `graph`, provided its owner's clone is loaded.
    fn resolve<'g>(&self, graph: &'g FlowGraph, node: FlowRef) -> Option<FlowObject<'g>> {
        let object = graph.object(node.id)?;
        self.db
            .objects()
            .contains(object.owner().id, node.clone)
            .then_some(object)
    }

    fn pauses_on(&self, object: &FlowObject<'_>) -> bool {
        object
            .pausable_type()
            .is_some_and(|t| self.settings.pause_on.contains(t))
    }

    pub fn should_pause_on(&self, node: FlowRef) -> bool {
        self.resolve(self.db.graph(), node)
            .is_some_and(|o| self.pauses_on(&o))
    }

    /// Recompute the branches available from the cursor and publish them,
    /// unless the start node can be skipped past with a fast-forward.
    pub fn update_available_branches(&mut self) {
        self.branches.clear();
        if self.settings.pause_on.is_empty() {
            warn!("pause mask is empty, the player would never stop");
            return;
        }
        let Some(cursor) = self.cursor else {
            warn!("no cursor set, nothing to explore");
            return;
        };

        let graph = Arc::clone(self.db.graph());
        let mut branches = self.explore(&graph, Some(cursor), true, 0);
        if self.settings.ignore_invalid_branches {
            branches.retain(|b| b.is_valid);
        }
        if branches.len() > self.settings.branch_limit {
            warn!(
                found = branches.len(),
                limit = self.settings.branch_limit,
                "branch limit reached, dropping the rest"
            );
            branches.truncate(self.settings.branch_limit);
        }
        for (i, branch) in branches.iter_mut().enumerate() {
            branch.index = Some(i);
        }
        self.branches = branches;
        debug!(%cursor, branches = self.branches.len(), "branches updated");

        if self.start_on == Some(cursor) && self.fast_forward_to_pause() {
            return;
        }

        for observer in &mut self.paused_observers {
            observer(cursor);
        }
        for observer in &mut self.branches_observers {
            observer(&self.branches);
        }
    }

    /// Skip the shared prefix of all branches up to the first pausable
    /// object or the first point where they diverge.
    fn fast_forward_to_pause(&mut self) -> bool {
        let Some(first) = self.branches.first() else {
            return false;
        };
        let len = first.path.len();
        let mut stop = 0;
        let mut diverged = false;
        while stop < len {
            let node = first.path[stop];
            if self.should_pause_on(node) {
                break;
            }
            if self.branches[1..]
                .iter()
                .any(|b| b.path.get(stop) != Some(&node))
            {
                diverged = true;
                break;
            }
            stop += 1;
        }
        let stop = if diverged { stop.checked_sub(1) } else { Some(stop) };
        let Some(stop) = stop.filter(|&i| i > 0 && i < len) else {
            return false;
        };

        let branch = Branch {
            path: first.path[..=stop].to_vec(),
            is_valid: first.is_valid,
            index: None,
        };
        debug!(to = ?branch.target(), "fast-forwarding");
        self.play_branch(branch);
        true
    }

    /// Play the branch at `index` of the available branches.
    pub fn play(&mut self, index: usize) -> Result<(), PlayerError> {
        let Some(branch) = self.branches.get(index).cloned() else {
            let available = self.branches.len();
            error!(index, available, "branch index out of range");
            return Err(PlayerError::BranchNotFound { index, available });
        };
        self.play_branch(branch);
        Ok(())
    }

    /// Commit a branch: run its instructions at the live level, move the
    /// cursor to its end and recompute the branches.
    ///
    /// Panics if called while a shadow level is open.
    pub fn play_branch(&mut self, branch: Branch) {
        assert_eq!(
            self.shadow_level, 0,
            "a branch can only be played at the live level"
        );
        let graph = Arc::clone(self.db.graph());
        let already_run = self.finished_pin.take();
        for &step in &branch.path {
            if Some(step) == already_run {
                continue;
            }
            let Some(object) = self.resolve(&graph, step) else {
                continue;
            };
            let fragment = match object {
                FlowObject::OutputPin { pin, .. } => pin.fragment(),
                FlowObject::Node(FlowNode {
                    kind: NodeKind::Instruction { expression },
                    ..
                }) => FragmentId::from_source(expression),
                _ => continue,
            };
            self.bind_script_context(step, &object);
            self.execute(fragment);
        }
        self.cursor = branch.target();
        // a branch ending on an output pin has already run it
        self.finished_pin = self
            .cursor
            .filter(|c| matches!(graph.object(c.id), Some(FlowObject::OutputPin { .. })));
        info!(cursor = ?self.cursor, steps = branch.path.len(), "played branch");
        self.update_available_branches();
    }

    /// Run output pin `pin_index` of the paused cursor now. The pin is not
    /// run again when the next branch through it is played.
    pub fn finish_current_paused_object(&mut self, pin_index: usize) -> bool {
        let Some(cursor) = self.cursor else {
            warn!("no cursor to finish");
            return false;
        };
        let graph = Arc::clone(self.db.graph());
        let Some(FlowObject::Node(node)) = self.resolve(&graph, cursor) else {
            warn!(%cursor, "cursor is not a node with output pins");
            return false;
        };
        let Some(pin) = node.output_pins.get(pin_index) else {
            warn!(
                %cursor,
                pin_index,
                pins = node.output_pins.len(),
                "output pin index out of bounds"
            );
            return false;
        };
        let pin_ref = FlowRef::new(pin.id, cursor.clone);
        self.bind_script_context(pin_ref, &FlowObject::OutputPin { owner: node, pin });
        self.execute(pin.fragment());
        self.finished_pin = Some(pin_ref);
        true
    }

    fn bind_script_context(&mut self, node: FlowRef, object: &FlowObject<'_>) {
        let speaker = object.speaker().map(FlowRef::original);
        let scripts = self.db.scripts_mut();
        scripts.set_current_object(Some(node));
        scripts.set_speaker(speaker);
    }

    fn evaluate(&mut self, fragment: FragmentId) -> bool {
        self.db
            .evaluate(fragment, &self.variable_set, self.methods.as_deref_mut())
    }

    fn execute(&mut self, fragment: FragmentId) -> bool {
        self.db
            .execute(fragment, &self.variable_set, self.methods.as_deref_mut())
    }

    /// Run `op` one shadow level deeper, or not at all if the level limit
    /// is reached.
    fn shadowed_operation<R>(&mut self, op: impl FnOnce(&mut FlowPlayer) -> R) -> Option<R> {
        if self.shadow_level >= self.settings.shadow_level_limit {
            warn!(
                limit = self.settings.shadow_level_limit,
                "shadow level limit reached, abandoning speculative exploration"
            );
            return None;
        }
        let mut scope = ShadowScope::enter(self);
        Some(op(&mut *scope))
    }

    fn explore(
        &mut self,
        graph: &FlowGraph,
        node: Option<FlowRef>,
        shadowed: bool,
        depth: u32,
    ) -> Vec<Branch> {
        let Some((node, object)) = node.and_then(|r| Some((r, self.resolve(graph, r)?))) else {
            warn!(node = ?node, depth, "flow object not found, treating as dead end");
            return vec![Branch::default()];
        };
        if depth > self.settings.explore_depth_limit {
            warn!(
                %node,
                limit = self.settings.explore_depth_limit,
                "explore depth limit reached, truncating branch"
            );
            return vec![Branch::ending_at(node)];
        }
        if Some(node) != self.cursor && self.pauses_on(&object) {
            return vec![Branch::ending_at(node)];
        }

        self.bind_script_context(node, &object);

        let mut branches = Vec::new();
        let submerged =
            depth == 0 && self.try_submerge(graph, node, &object, shadowed, depth + 1, &mut branches);
        if !submerged {
            if shadowed {
                let found =
                    self.shadowed_operation(|player| player.explore_object(graph, node, object, depth));
                branches.extend(found.into_iter().flatten());
            } else {
                branches = self.explore_object(graph, node, object, depth);
            }
        }
        for branch in &mut branches {
            branch.path.insert(0, node);
        }
        branches
    }

    /// Enter a container node through its own input pins.
    fn try_submerge(
        &mut self,
        graph: &FlowGraph,
        node: FlowRef,
        object: &FlowObject<'_>,
        force_shadowed: bool,
        depth: u32,
        out: &mut Vec<Branch>,
    ) -> bool {
        let FlowObject::Node(owner) = object else {
            return false;
        };
        let Some(first) = owner.input_pins.first() else {
            return false;
        };
        let shadowed =
            force_shadowed || owner.input_pins.len() > 1 || first.connections.len() > 1;
        let mut submerged = false;
        for pin in &owner.input_pins {
            if pin.connections.is_empty() {
                continue;
            }
            submerged = true;
            let pin_ref = FlowRef::new(pin.id, node.clone);
            out.extend(self.explore(graph, Some(pin_ref), shadowed, depth));
        }
        submerged
    }

    fn explore_object(
        &mut self,
        graph: &FlowGraph,
        node: FlowRef,
        object: FlowObject<'_>,
        depth: u32,
    ) -> Vec<Branch> {
        let next = depth + 1;
        match object {
            FlowObject::Node(owner) => match &owner.kind {
                NodeKind::Jump { target, target_pin } => {
                    let connection = Connection {
                        target: *target,
                        target_pin: *target_pin,
                    };
                    let target = self.follow(graph, node.clone, &connection);
                    self.explore(graph, target, false, next)
                }
                NodeKind::Condition { expression } if owner.output_pins.len() == 2 => {
                    let passed = self.evaluate(FragmentId::from_source(expression));
                    let pin = &owner.output_pins[if passed { 0 } else { 1 }];
                    let pin_ref = FlowRef::new(pin.id, node.clone);
                    self.explore(graph, Some(pin_ref), false, next)
                }
                NodeKind::Condition { .. } => {
                    error!(%node, pins = owner.output_pins.len(), "condition without two output pins");
                    self.explore_outputs(graph, node, owner, next)
                }
                NodeKind::Instruction { expression } => {
                    self.execute(FragmentId::from_source(expression));
                    self.explore_outputs(graph, node, owner, next)
                }
                NodeKind::Entity => {
                    debug!(%node, "entity reached in flow, treating as dead end");
                    vec![Branch::default()]
                }
                _ => self.explore_outputs(graph, node, owner, next),
            },
            FlowObject::OutputPin { pin, .. } => {
                self.execute(pin.fragment());
                self.explore_connections(graph, node.clone, &pin.connections, next)
            }
            FlowObject::InputPin { owner, pin } => {
                let valid = self.evaluate(pin.fragment());
                if !valid && self.settings.ignore_invalid_branches {
                    return Vec::new();
                }
                let owner_ref = FlowRef::new(owner.id, node.clone);
                let owner_pauses = self.pauses_on(&FlowObject::Node(owner));
                let mut branches = if depth > 1 && owner_pauses {
                    self.explore(graph, Some(owner_ref), false, next)
                } else if !pin.connections.is_empty() {
                    self.explore_connections(graph, node.clone, &pin.connections, next)
                } else {
                    self.explore(graph, Some(owner_ref), false, next)
                };
                if !valid {
                    for branch in &mut branches {
                        branch.is_valid = false;
                    }
                }
                branches
            }
        }
    }

    fn explore_outputs(
        &mut self,
        graph: &FlowGraph,
        node: FlowRef,
        owner: &FlowNode,
        depth: u32,
    ) -> Vec<Branch> {
        let targets: Vec<Option<FlowRef>> = owner
            .output_pins
            .iter()
            .map(|pin| Some(FlowRef::new(pin.id, node.clone)))
            .collect();
        self.fan_out(graph, targets, depth)
    }

    fn explore_connections(
        &mut self,
        graph: &FlowGraph,
        clone: CloneId,
        connections: &[Connection],
        depth: u32,
    ) -> Vec<Branch> {
        let targets: Vec<Option<FlowRef>> = connections
            .iter()
            .map(|c| self.follow(graph, clone, c))
            .collect();
        self.fan_out(graph, targets, depth)
    }

    /// Explore alternatives, each in its own shadow level when there is
    /// more than one. No alternatives is a dead end.
    fn fan_out(&mut self, graph: &FlowGraph, targets: Vec<Option<FlowRef>>, depth: u32) -> Vec<Branch> {
        if targets.is_empty() {
            return vec![Branch::default()];
        }
        let shadowed = targets.len() > 1;
        let mut branches = Vec::new();
        for target in targets {
            if branches.len() >= self.settings.branch_limit {
                warn!(
                    limit = self.settings.branch_limit,
                    "branch limit reached, skipping remaining alternatives"
                );
                break;
            }
            branches.extend(self.explore(graph, target, shadowed, depth));
        }
        branches
    }

    /// The pin a connection leads to, in the traversing clone when the
    /// target has that clone and in the original otherwise.
    fn follow(&self, graph: &FlowGraph, clone: CloneId, connection: &Connection) -> Option<FlowRef> {
        let Some(target) = graph.connection_target(connection) else {
            warn!(
                target = %connection.target,
                pin = %connection.target_pin,
                "connection leads to an unknown object"
            );
            return None;
        };
        let owner = target.owner().id;
        let clone = if self.db.objects().contains(owner, clone) {
            clone
        } else {
            CloneId::ORIGINAL
        };
        Some(FlowRef::new(target.id(), clone))
    }
}

impl ShadowStateManager for FlowPlayer {
    fn shadow_level(&self) -> ShadowLevel {
        self.shadow_level
    }

    fn push_state(&mut self, level: ShadowLevel) {
        assert_eq!(
            level,
            self.shadow_level + 1,
            "flow player shadow push out of order"
        );
        self.shadow_level = level;
        self.db.push_state(level, &self.variable_set);
        for observer in &mut self.shadow_observers {
            observer(ShadowOp::Started(level));
        }
    }

    fn pop_state(&mut self, level: ShadowLevel) {
        assert_eq!(level, self.shadow_level, "flow player shadow pop out of order");
        for observer in &mut self.shadow_observers {
            observer(ShadowOp::Ended(level));
        }
        self.db.pop_state(level, &self.variable_set);
        self.shadow_level -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::ScriptRunner;
    use crate::schema::graph::{GraphDescription, NamespaceDef, Package, PausableType, Pin, VariableDef};
    use crate::schema::value::Value;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn input(id: u64) -> Pin {
        Pin {
            id: NodeId(id * 100),
            script: String::new(),
            connections: vec![],
        }
    }

    /// Node `id` with input pin `id*100` and one output pin `id*100+1+i`
    /// per entry of `outputs`, each connected to the listed nodes' input pins.
    fn make_node(id: u64, kind: NodeKind, outputs: &[&[u64]]) -> FlowNode {
        FlowNode {
            id: NodeId(id),
            technical_name: format!("n{id}"),
            kind,
            text: String::new(),
            speaker: None,
            input_pins: vec![input(id)],
            output_pins: outputs
                .iter()
                .enumerate()
                .map(|(i, targets)| Pin {
                    id: NodeId(id * 100 + 1 + i as u64),
                    script: String::new(),
                    connections: targets
                        .iter()
                        .map(|&t| Connection {
                            target: NodeId(t),
                            target_pin: NodeId(t * 100),
                        })
                        .collect(),
                })
                .collect(),
            properties: HashMap::new(),
            features: HashMap::new(),
        }
    }

    fn make_player(nodes: Vec<FlowNode>, scripts: ScriptRunner) -> FlowPlayerBuilder {
        let description = GraphDescription {
            packages: vec![Package {
                name: "test".to_string(),
                is_default: true,
                objects: nodes,
            }],
            variables: vec![NamespaceDef {
                name: "Game".to_string(),
                description: String::new(),
                variables: vec![VariableDef {
                    name: "x".to_string(),
                    value: Value::Int(0),
                    description: String::new(),
                }],
            }],
        };
        let graph = FlowGraph::from_description(description).unwrap();
        let db = Database::new(graph).unwrap().with_scripts(scripts);
        FlowPlayer::builder(db).pause_on(PauseMask::empty().with(PausableType::DialogueFragment))
    }

    fn ids(refs: &[FlowRef]) -> Vec<u64> {
        refs.iter().map(|r| r.id.0).collect()
    }

    #[test]
    fn settings_parse_with_defaults() {
        let settings = PlayerSettings::parse_ron("(branch_limit: 4, pause_on: [Hub])").unwrap();
        assert_eq!(settings.branch_limit, 4);
        assert!(settings.pause_on.contains(PausableType::Hub));
        assert!(!settings.pause_on.contains(PausableType::Dialogue));
        assert_eq!(settings.explore_depth_limit, 128);
        assert_eq!(settings.shadow_level_limit, 10);
        assert!(settings.ignore_invalid_branches);
    }

    #[test]
    fn default_pause_mask() {
        let mask = PlayerSettings::default().pause_on;
        assert!(mask.contains(PausableType::DialogueFragment));
        assert!(mask.contains(PausableType::Dialogue));
        assert!(mask.contains(PausableType::FlowFragment));
        assert!(!mask.contains(PausableType::Hub));
    }

    #[test]
    fn branches_run_from_cursor_to_pause() {
        let nodes = vec![
            make_node(1, NodeKind::DialogueFragment, &[&[2, 3]]),
            make_node(2, NodeKind::DialogueFragment, &[]),
            make_node(3, NodeKind::DialogueFragment, &[]),
        ];
        let player = make_player(nodes, ScriptRunner::with_seed(0))
            .start_node(NodeId(1))
            .build()
            .unwrap();
        let branches = player.available_branches();
        assert_eq!(branches.len(), 2);
        assert_eq!(ids(&branches[0].path), vec![1, 101, 200, 2]);
        assert_eq!(ids(&branches[1].path), vec![1, 101, 300, 3]);
        assert_eq!(branches[1].index, Some(1));
        let graph = player.database().graph();
        assert_eq!(ids(&branches[0].flow_nodes(graph)), vec![1, 2]);
    }

    #[test]
    fn bad_index_is_an_error() {
        let nodes = vec![
            make_node(1, NodeKind::DialogueFragment, &[&[2]]),
            make_node(2, NodeKind::DialogueFragment, &[]),
        ];
        let mut player = make_player(nodes, ScriptRunner::with_seed(0))
            .start_node(NodeId(1))
            .build()
            .unwrap();
        assert!(matches!(
            player.play(5),
            Err(PlayerError::BranchNotFound { index: 5, available: 1 })
        ));
        player.play(0).unwrap();
        assert_eq!(player.cursor(), Some(FlowRef::original(NodeId(2))));
    }

    #[test]
    fn empty_pause_mask_offers_nothing() {
        let nodes = vec![
            make_node(1, NodeKind::DialogueFragment, &[&[2]]),
            make_node(2, NodeKind::DialogueFragment, &[]),
        ];
        let player = make_player(nodes, ScriptRunner::with_seed(0))
            .pause_on(PauseMask::empty())
            .start_node(NodeId(1))
            .build()
            .unwrap();
        assert!(player.available_branches().is_empty());
    }

    #[test]
    fn unknown_start_node_is_rejected() {
        let nodes = vec![make_node(1, NodeKind::DialogueFragment, &[])];
        let result = make_player(nodes, ScriptRunner::with_seed(0))
            .start_node(NodeId(9))
            .build();
        assert!(matches!(result, Err(PlayerError::InvalidNode(_))));
    }

    #[test]
    fn branch_limit_caps_fan_out() {
        let nodes = vec![
            make_node(1, NodeKind::DialogueFragment, &[&[2, 3, 4]]),
            make_node(2, NodeKind::DialogueFragment, &[]),
            make_node(3, NodeKind::DialogueFragment, &[]),
            make_node(4, NodeKind::DialogueFragment, &[]),
        ];
        let player = make_player(nodes, ScriptRunner::with_seed(0))
            .branch_limit(2)
            .start_node(NodeId(1))
            .build()
            .unwrap();
        assert_eq!(player.available_branches().len(), 2);
    }

    #[test]
    fn shadow_level_limit_abandons_exploration() {
        let nodes = vec![
            make_node(1, NodeKind::DialogueFragment, &[&[2, 3]]),
            make_node(2, NodeKind::DialogueFragment, &[]),
            make_node(3, NodeKind::DialogueFragment, &[]),
        ];
        let player = make_player(nodes, ScriptRunner::with_seed(0))
            .shadow_level_limit(1)
            .start_node(NodeId(1))
            .build()
            .unwrap();
        assert!(player.available_branches().is_empty());
        assert_eq!(player.shadow_level(), 0);
    }

    #[test]
    fn observers_see_pauses_updates_and_balanced_shadow_ops() {
        let nodes = vec![
            make_node(1, NodeKind::DialogueFragment, &[&[2, 3]]),
            make_node(2, NodeKind::DialogueFragment, &[]),
            make_node(3, NodeKind::DialogueFragment, &[]),
        ];
        let mut player = make_player(nodes, ScriptRunner::with_seed(0)).build().unwrap();

        let paused = Rc::new(RefCell::new(Vec::new()));
        let updates = Rc::new(RefCell::new(Vec::new()));
        let ops = Rc::new(RefCell::new(Vec::new()));
        let (p, u, o) = (Rc::clone(&paused), Rc::clone(&updates), Rc::clone(&ops));
        player.on_player_paused(move |cursor| p.borrow_mut().push(cursor.id.0));
        player.on_branches_updated(move |branches| u.borrow_mut().push(branches.len()));
        player.on_shadow_op(move |op| o.borrow_mut().push(op));

        player.set_start_node(NodeId(1)).unwrap();
        assert_eq!(*paused.borrow(), vec![1]);
        assert_eq!(*updates.borrow(), vec![2]);

        let ops = ops.borrow();
        let started = ops.iter().filter(|op| matches!(op, ShadowOp::Started(_))).count();
        let ended = ops.iter().filter(|op| matches!(op, ShadowOp::Ended(_))).count();
        assert!(started > 0);
        assert_eq!(started, ended);
        assert_eq!(ops.first(), Some(&ShadowOp::Started(1)));
        assert_eq!(ops.last(), Some(&ShadowOp::Ended(1)));
    }

    #[test]
    fn finished_pin_is_not_run_twice() {
        let mut scripts = ScriptRunner::with_seed(0);
        scripts.add_instruction("Game.x += 1", |ctx| {
            let x = ctx.get_int("Game.x");
            ctx.set("Game.x", x + 1);
        });
        let mut first = make_node(1, NodeKind::DialogueFragment, &[&[2]]);
        first.output_pins[0].script = "Game.x += 1".to_string();
        let nodes = vec![first, make_node(2, NodeKind::DialogueFragment, &[])];
        let mut player = make_player(nodes, scripts).start_node(NodeId(1)).build().unwrap();

        assert!(player.finish_current_paused_object(0));
        assert_eq!(player.variables_mut().get_int("Game", "x").0, 1);
        assert!(!player.finish_current_paused_object(3));
        player.play(0).unwrap();
        assert_eq!(player.variables_mut().get_int("Game", "x").0, 1);
    }

    #[test]
    fn speculative_writes_never_reach_live_state() {
        let mut scripts = ScriptRunner::with_seed(0);
        scripts.add_instruction("Game.x = 5", |ctx| {
            ctx.set("Game.x", 5);
        });
        let mut first = make_node(1, NodeKind::DialogueFragment, &[&[2]]);
        first.output_pins[0].script = "Game.x = 5".to_string();
        let nodes = vec![first, make_node(2, NodeKind::DialogueFragment, &[])];
        let mut player = make_player(nodes, scripts).start_node(NodeId(1)).build().unwrap();

        assert_eq!(player.available_branches().len(), 1);
        assert_eq!(player.variables_mut().get_int("Game", "x").0, 0);
        player.play(0).unwrap();
        assert_eq!(player.variables_mut().get_int("Game", "x").0, 5);
    }

    #[test]
    fn named_variable_sets_are_separate() {
        let mut scripts = ScriptRunner::with_seed(0);
        scripts.add_instruction("Game.x = 5", |ctx| {
            ctx.set("Game.x", 5);
        });
        let mut first = make_node(1, NodeKind::DialogueFragment, &[&[2]]);
        first.output_pins[0].script = "Game.x = 5".to_string();
        let nodes = vec![first, make_node(2, NodeKind::DialogueFragment, &[])];
        let mut player = make_player(nodes, scripts)
            .variable_set("replay")
            .start_node(NodeId(1))
            .build()
            .unwrap();
        player.play(0).unwrap();
        assert_eq!(player.variables_mut().get_int("Game", "x").0, 5);
        assert_eq!(player.database().variables().get_int("Game", "x").0, 0);
    }
}
