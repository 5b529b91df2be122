//! Runtime object database: per-object clone sets, shadow copies, packages
//! and the variable sets scripts run against.

use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::script::{Methods, ScriptRunner};
use crate::core::shadow::{ShadowLevel, ShadowStack, ShadowStateManager, ShadowedValue};
use crate::core::variables::{VariableError, VariableStore};
use crate::schema::fragment::FragmentId;
use crate::schema::graph::{FlowGraph, FlowNode};
use crate::schema::ids::{CloneId, FlowRef, NodeId};
use crate::schema::value::Value;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("variable error: {0}")]
    Variable(#[from] VariableError),
    #[error("unknown package: {0}")]
    UnknownPackage(String),
}

/// The mutable runtime state of one clone of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    pub id: NodeId,
    pub clone: CloneId,
    pub technical_name: String,
    pub kind: &'static str,
    pub properties: HashMap<String, Value>,
    pub features: HashMap<String, HashMap<String, Value>>,
}

impl ObjectState {
    pub fn from_node(node: &FlowNode) -> Self {
        Self {
            id: node.id,
            clone: CloneId::ORIGINAL,
            technical_name: node.technical_name.clone(),
            kind: node.kind.name(),
            properties: node.properties.clone(),
            features: node.features.clone(),
        }
    }

    pub fn flow_ref(&self) -> FlowRef {
        FlowRef::new(self.id, self.clone)
    }

    /// Look up `"Property"` or `"Feature.Property"`.
    pub fn property(&self, path: &str) -> Option<&Value> {
        match path.split_once('.') {
            Some((feature, property)) => self.features.get(feature)?.get(property),
            None => self.properties.get(path),
        }
    }

    /// Overwrite an existing property. Returns `false` if it is not declared.
    pub fn set_property(&mut self, path: &str, value: Value) -> bool {
        let slot = match path.split_once('.') {
            Some((feature, property)) => self
                .features
                .get_mut(feature)
                .and_then(|f| f.get_mut(property)),
            None => self.properties.get_mut(path),
        };
        match slot {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

/// Stable reference to one version of an object in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct ArenaSlot {
    generation: u32,
    state: Option<ObjectState>,
}

/// Generational storage for object versions.
#[derive(Debug, Default)]
struct Arena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
}

impl Arena {
    fn insert(&mut self, state: ObjectState) -> ObjectHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = Some(state);
            return ObjectHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(ArenaSlot {
            generation: 0,
            state: Some(state),
        });
        ObjectHandle {
            index,
            generation: 0,
        }
    }

    fn get(&self, handle: ObjectHandle) -> Option<&ObjectState> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.state.as_ref()
    }

    fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut ObjectState> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.state.as_mut()
    }

    fn remove(&mut self, handle: ObjectHandle) -> Option<ObjectState> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let state = slot.state.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(state)
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_some()).count()
    }
}

/// All clones of one object. Clone 0 always exists once the set does.
#[derive(Debug, Default)]
struct CloneSet {
    clones: BTreeMap<CloneId, ShadowedValue<ObjectHandle>>,
}

impl CloneSet {
    fn first_free_id(&self) -> CloneId {
        let mut candidate = 0;
        for id in self.clones.keys() {
            if id.0 == candidate {
                candidate += 1;
            } else if id.0 > candidate {
                break;
            }
        }
        CloneId(candidate)
    }
}

#[derive(Debug, Clone, Copy)]
enum ObjectUndo {
    /// Discard the shadow copy made at this level.
    Shadow { id: NodeId, clone: CloneId },
    /// Remove a clone created at this level.
    RemoveClone { id: NodeId, clone: CloneId },
}

/// Per-object clone sets with lazily created shadow copies.
#[derive(Debug, Default)]
pub struct CloneRegistry {
    templates: FxHashMap<NodeId, ObjectState>,
    by_name: FxHashMap<String, Vec<NodeId>>,
    sets: FxHashMap<NodeId, CloneSet>,
    arena: Arena,
    shadow: ShadowStack<ObjectUndo>,
}

impl CloneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `state` available as clone 0 of its id.
    pub fn insert_template(&mut self, state: ObjectState) {
        if !state.technical_name.is_empty() {
            let ids = self.by_name.entry(state.technical_name.clone()).or_default();
            if !ids.contains(&state.id) {
                ids.push(state.id);
            }
        }
        self.templates.insert(state.id, state);
    }

    /// Forget an object and every clone of it.
    pub fn remove_object(&mut self, id: NodeId) -> bool {
        let Some(template) = self.templates.remove(&id) else {
            return false;
        };
        if let Some(ids) = self.by_name.get_mut(&template.technical_name) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.by_name.remove(&template.technical_name);
            }
        }
        if let Some(set) = self.sets.remove(&id) {
            for slot in set.clones.into_values() {
                for handle in slot.iter() {
                    self.arena.remove(*handle);
                }
            }
        }
        true
    }

    fn ensure_set(&mut self, id: NodeId) -> bool {
        if self.sets.contains_key(&id) {
            return true;
        }
        let Some(template) = self.templates.get(&id) else {
            return false;
        };
        let handle = self.arena.insert(template.clone());
        let mut set = CloneSet::default();
        set.clones
            .insert(CloneId::ORIGINAL, ShadowedValue::new(handle));
        self.sets.insert(id, set);
        true
    }

    /// Resolve `(id, clone)` to the version visible at the current shadow level.
    ///
    /// Inside a shadow level the first access duplicates the most recent
    /// version; the copy is discarded when the level is popped. With
    /// `force_unshadowed` the live (level 0) version is returned.
    pub fn get(&mut self, id: NodeId, clone: CloneId, force_unshadowed: bool) -> Option<ObjectHandle> {
        if !self.ensure_set(id) {
            return None;
        }
        let level = self.shadow.level();
        let slot = self.sets.get_mut(&id)?.clones.get_mut(&clone)?;
        if force_unshadowed {
            return Some(*slot.original());
        }
        let own = slot.level();
        if own >= level {
            if own > level {
                error!(%id, %clone, own, level, "object shadow is deeper than the open level");
                debug_assert!(false, "object shadow is deeper than the open level");
            }
            return Some(*slot.get());
        }
        let copy = self.arena.get(*slot.get())?.clone();
        let handle = self.arena.insert(copy);
        if slot.set(level, handle) {
            self.shadow.register(ObjectUndo::Shadow { id, clone });
        }
        Some(handle)
    }

    /// Create `clone` of `id` by duplicating clone 0 as currently visible.
    ///
    /// If the clone already exists it is returned, or `None` when
    /// `fail_if_exists` is set. [`CloneId::AUTO`] picks the lowest free id.
    pub fn clone_object(
        &mut self,
        id: NodeId,
        clone: CloneId,
        fail_if_exists: bool,
    ) -> Option<ObjectHandle> {
        if !clone.is_auto() {
            if let Some(existing) = self.get(id, clone, false) {
                return (!fail_if_exists).then_some(existing);
            }
        }
        let source = self.get(id, CloneId::ORIGINAL, false)?;
        let mut state = self.arena.get(source)?.clone();
        let level = self.shadow.level();
        let set = self.sets.get_mut(&id)?;
        let new_id = if clone.is_auto() {
            set.first_free_id()
        } else {
            clone
        };
        state.clone = new_id;
        let handle = self.arena.insert(state);
        set.clones.insert(new_id, ShadowedValue::new_at(level, handle));
        if level > 0 {
            self.shadow.register(ObjectUndo::RemoveClone { id, clone: new_id });
        }
        debug!(%id, clone = %new_id, level, "cloned object");
        Some(handle)
    }

    pub fn get_or_clone(&mut self, id: NodeId, clone: CloneId) -> Option<ObjectHandle> {
        self.clone_object(id, clone, false)
    }

    /// Whether `(id, clone)` resolves, without creating anything.
    pub fn contains(&self, id: NodeId, clone: CloneId) -> bool {
        match self.sets.get(&id) {
            Some(set) => set.clones.contains_key(&clone),
            None => clone == CloneId::ORIGINAL && self.templates.contains_key(&id),
        }
    }

    pub fn contains_ref(&self, r: FlowRef) -> bool {
        self.contains(r.id, r.clone)
    }

    pub fn clone_ids(&self, id: NodeId) -> Vec<CloneId> {
        match self.sets.get(&id) {
            Some(set) => set.clones.keys().copied().collect(),
            None if self.templates.contains_key(&id) => vec![CloneId::ORIGINAL],
            None => Vec::new(),
        }
    }

    pub fn object(&self, handle: ObjectHandle) -> Option<&ObjectState> {
        self.arena.get(handle)
    }

    pub fn object_mut(&mut self, handle: ObjectHandle) -> Option<&mut ObjectState> {
        self.arena.get_mut(handle)
    }

    /// The first loaded object with `technical_name`.
    pub fn id_by_name(&self, technical_name: &str) -> Option<NodeId> {
        self.by_name.get(technical_name)?.first().copied()
    }

    pub fn objects_named(&self, technical_name: &str) -> &[NodeId] {
        self.by_name
            .get(technical_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn get_by_name(&mut self, technical_name: &str, clone: CloneId) -> Option<ObjectHandle> {
        let id = self.id_by_name(technical_name)?;
        self.get(id, clone, false)
    }

    pub fn clone_by_name(
        &mut self,
        technical_name: &str,
        clone: CloneId,
        fail_if_exists: bool,
    ) -> Option<ObjectHandle> {
        let id = self.id_by_name(technical_name)?;
        self.clone_object(id, clone, fail_if_exists)
    }

    pub fn get_or_clone_by_name(&mut self, technical_name: &str, clone: CloneId) -> Option<ObjectHandle> {
        self.clone_by_name(technical_name, clone, false)
    }

    /// Ids of loaded objects whose kind name is `kind`, sorted.
    pub fn objects_of_kind(&self, kind: &str) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .templates
            .values()
            .filter(|t| t.kind == kind)
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    /// Every loaded object id, sorted.
    pub fn all_objects(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.templates.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of object versions currently stored.
    pub fn live_versions(&self) -> usize {
        self.arena.live()
    }
}

impl ShadowStateManager for CloneRegistry {
    fn shadow_level(&self) -> ShadowLevel {
        self.shadow.level()
    }

    fn push_state(&mut self, level: ShadowLevel) {
        self.shadow.push(level);
    }

    fn pop_state(&mut self, level: ShadowLevel) {
        for undo in self.shadow.pop(level) {
            match undo {
                ObjectUndo::Shadow { id, clone } => {
                    let discarded = self
                        .sets
                        .get_mut(&id)
                        .and_then(|set| set.clones.get_mut(&clone))
                        .and_then(|slot| slot.pop(level));
                    if let Some(handle) = discarded {
                        self.arena.remove(handle);
                    }
                }
                ObjectUndo::RemoveClone { id, clone } => {
                    let removed = self.sets.get_mut(&id).and_then(|set| set.clones.remove(&clone));
                    if let Some(slot) = removed {
                        self.arena.remove(*slot.get());
                    }
                }
            }
        }
    }
}

/// Which variable store scripts read and write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum VariableSet {
    #[default]
    Default,
    /// A separately stored copy of the variable definitions, created on first use.
    Named(String),
}

/// The runtime database: graph, objects, scripts and variable sets.
pub struct Database {
    graph: Arc<FlowGraph>,
    objects: CloneRegistry,
    scripts: ScriptRunner,
    variables: VariableStore,
    alternative_variables: FxHashMap<String, VariableStore>,
    loaded_packages: Vec<String>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("objects", &self.graph.len())
            .field("loaded_packages", &self.loaded_packages)
            .field("variable_sets", &self.alternative_variables.len())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Build a database over `graph` with every default package loaded.
    pub fn new(graph: impl Into<Arc<FlowGraph>>) -> Result<Self, DatabaseError> {
        let graph = graph.into();
        let variables = VariableStore::from_definitions(graph.variables())?;
        let mut db = Self {
            graph,
            objects: CloneRegistry::new(),
            scripts: ScriptRunner::new(),
            variables,
            alternative_variables: FxHashMap::default(),
            loaded_packages: Vec::new(),
        };
        let defaults: Vec<String> = db
            .graph
            .packages()
            .iter()
            .filter(|p| p.is_default)
            .map(|p| p.name.clone())
            .collect();
        for name in defaults {
            db.load_package(&name)?;
        }
        Ok(db)
    }

    pub fn with_scripts(mut self, scripts: ScriptRunner) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn graph(&self) -> &Arc<FlowGraph> {
        &self.graph
    }

    pub fn objects(&self) -> &CloneRegistry {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut CloneRegistry {
        &mut self.objects
    }

    pub fn scripts(&self) -> &ScriptRunner {
        &self.scripts
    }

    pub fn scripts_mut(&mut self) -> &mut ScriptRunner {
        &mut self.scripts
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.variables
    }

    /// A variable set, if it exists yet.
    pub fn variable_set(&self, set: &VariableSet) -> Option<&VariableStore> {
        match set {
            VariableSet::Default => Some(&self.variables),
            VariableSet::Named(name) => self.alternative_variables.get(name),
        }
    }

    /// A variable set, creating a pristine named copy on first use.
    pub fn variable_set_mut(&mut self, set: &VariableSet) -> &mut VariableStore {
        let Database {
            graph,
            variables,
            alternative_variables,
            ..
        } = self;
        variable_store(graph, variables, alternative_variables, set)
    }

    /// Load the objects of a package. Already loaded packages are left alone.
    pub fn load_package(&mut self, name: &str) -> Result<(), DatabaseError> {
        if self.is_loaded(name) {
            return Ok(());
        }
        let package = self
            .graph
            .package(name)
            .ok_or_else(|| DatabaseError::UnknownPackage(name.to_string()))?;
        for node in &package.objects {
            self.objects.insert_template(ObjectState::from_node(node));
        }
        info!(package = name, objects = package.objects.len(), "loaded package");
        self.loaded_packages.push(name.to_string());
        Ok(())
    }

    /// Unload a package and every clone of its objects.
    pub fn unload_package(&mut self, name: &str) -> bool {
        let Some(pos) = self.loaded_packages.iter().position(|p| p == name) else {
            warn!(package = name, "unloading a package that is not loaded");
            return false;
        };
        if self.objects.is_shadowed() {
            warn!(package = name, "unloading a package during speculative exploration");
        }
        self.loaded_packages.remove(pos);
        if let Some(package) = self.graph.package(name) {
            for node in &package.objects {
                self.objects.remove_object(node.id);
            }
        }
        info!(package = name, "unloaded package");
        true
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded_packages.iter().any(|p| p == name)
    }

    pub fn loaded_packages(&self) -> &[String] {
        &self.loaded_packages
    }

    pub fn is_default_package(&self, name: &str) -> bool {
        self.graph.package(name).is_some_and(|p| p.is_default)
    }

    /// Evaluate a condition fragment against `set`.
    pub fn evaluate(&mut self, fragment: FragmentId, set: &VariableSet, methods: Methods<'_>) -> bool {
        let Database {
            graph,
            objects,
            scripts,
            variables,
            alternative_variables,
            ..
        } = self;
        let store = variable_store(graph, variables, alternative_variables, set);
        scripts.evaluate(fragment, store, objects, methods)
    }

    /// Run an instruction fragment against `set`.
    pub fn execute(&mut self, fragment: FragmentId, set: &VariableSet, methods: Methods<'_>) -> bool {
        let Database {
            graph,
            objects,
            scripts,
            variables,
            alternative_variables,
            ..
        } = self;
        let store = variable_store(graph, variables, alternative_variables, set);
        scripts.execute(fragment, store, objects, methods)
    }

    /// Open a shadow level on the objects and on `set`, in lockstep.
    pub fn push_state(&mut self, level: ShadowLevel, set: &VariableSet) {
        self.variable_set_mut(set).push_state(level);
        self.objects.push_state(level);
        self.scripts.push_state(level);
    }

    /// Close a level opened with [`Database::push_state`].
    pub fn pop_state(&mut self, level: ShadowLevel, set: &VariableSet) {
        self.scripts.pop_state(level);
        self.objects.pop_state(level);
        self.variable_set_mut(set).pop_state(level);
    }
}

fn variable_store<'a>(
    graph: &FlowGraph,
    variables: &'a mut VariableStore,
    alternatives: &'a mut FxHashMap<String, VariableStore>,
    set: &VariableSet,
) -> &'a mut VariableStore {
    match set {
        VariableSet::Default => variables,
        VariableSet::Named(name) => alternatives.entry(name.clone()).or_insert_with(|| {
            debug!(set = %name, "creating variable set");
            VariableStore::from_definitions(graph.variables()).unwrap_or_else(|e| {
                error!(set = %name, "variable definitions rejected: {e}");
                VariableStore::new()
            })
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::graph::{NodeKind, Package};

    fn make_state(id: u64, name: &str, gold: i64) -> ObjectState {
        ObjectState {
            id: NodeId(id),
            clone: CloneId::ORIGINAL,
            technical_name: name.to_string(),
            kind: "Entity",
            properties: HashMap::from([("gold".to_string(), Value::Int(gold))]),
            features: HashMap::from([(
                "Stats".to_string(),
                HashMap::from([("hp".to_string(), Value::Int(10))]),
            )]),
        }
    }

    fn make_registry() -> CloneRegistry {
        let mut registry = CloneRegistry::new();
        registry.insert_template(make_state(1, "innkeeper", 50));
        registry.insert_template(make_state(2, "bard", 5));
        registry
    }

    fn gold(registry: &CloneRegistry, handle: ObjectHandle) -> i64 {
        registry.object(handle).unwrap().property("gold").unwrap().as_int().unwrap()
    }

    #[test]
    fn clone_zero_exists_for_loaded_objects() {
        let mut registry = make_registry();
        assert!(registry.contains(NodeId(1), CloneId::ORIGINAL));
        assert!(!registry.contains(NodeId(1), CloneId(1)));
        let h = registry.get(NodeId(1), CloneId::ORIGINAL, false).unwrap();
        assert_eq!(gold(&registry, h), 50);
        assert!(registry.get(NodeId(9), CloneId::ORIGINAL, false).is_none());
        assert!(registry.get(NodeId(1), CloneId(3), false).is_none());
    }

    #[test]
    fn clone_with_fail_if_exists() {
        let mut registry = make_registry();
        let first = registry.clone_object(NodeId(1), CloneId(2), true);
        assert!(first.is_some(), "clone 2 did not exist yet");
        let second = registry.clone_object(NodeId(1), CloneId(2), true);
        assert!(second.is_none(), "clone 2 exists now");
        let existing = registry.clone_object(NodeId(1), CloneId(2), false);
        assert_eq!(existing, first);
        assert_eq!(
            registry.object(first.unwrap()).unwrap().clone,
            CloneId(2)
        );
    }

    #[test]
    fn auto_clone_picks_lowest_free_id() {
        let mut registry = make_registry();
        registry.clone_object(NodeId(1), CloneId(2), true).unwrap();
        let auto = registry.clone_object(NodeId(1), CloneId::AUTO, true).unwrap();
        assert_eq!(registry.object(auto).unwrap().clone, CloneId(1));
        let next = registry.clone_object(NodeId(1), CloneId::AUTO, false).unwrap();
        assert_eq!(registry.object(next).unwrap().clone, CloneId(3));
    }

    #[test]
    fn get_or_clone_is_idempotent_per_level() {
        let mut registry = make_registry();
        let a = registry.get_or_clone(NodeId(2), CloneId(1));
        let b = registry.get_or_clone(NodeId(2), CloneId(1));
        assert_eq!(a, b);

        registry.push_state(1);
        let c = registry.get_or_clone(NodeId(2), CloneId(1));
        let d = registry.get_or_clone(NodeId(2), CloneId(1));
        assert_eq!(c, d);
        assert_ne!(a, c, "level 1 works on its own copy");
        registry.pop_state(1);
    }

    #[test]
    fn shadow_copies_are_isolated_and_discarded() {
        let mut registry = make_registry();
        let live = registry.get(NodeId(1), CloneId::ORIGINAL, false).unwrap();
        let versions = registry.live_versions();

        registry.push_state(1);
        let shadow = registry.get(NodeId(1), CloneId::ORIGINAL, false).unwrap();
        assert_ne!(shadow, live);
        registry
            .object_mut(shadow)
            .unwrap()
            .set_property("gold", Value::Int(0));
        let unshadowed = registry.get(NodeId(1), CloneId::ORIGINAL, true).unwrap();
        assert_eq!(unshadowed, live);
        assert_eq!(gold(&registry, live), 50);
        registry.pop_state(1);

        assert_eq!(registry.live_versions(), versions);
        assert!(registry.object(shadow).is_none(), "stale handle");
        let again = registry.get(NodeId(1), CloneId::ORIGINAL, false).unwrap();
        assert_eq!(gold(&registry, again), 50);
    }

    #[test]
    fn clones_made_while_shadowed_vanish_on_pop() {
        let mut registry = make_registry();
        registry.push_state(1);
        registry.clone_object(NodeId(2), CloneId(4), true).unwrap();
        assert!(registry.contains(NodeId(2), CloneId(4)));
        registry.pop_state(1);
        assert!(!registry.contains(NodeId(2), CloneId(4)));
    }

    #[test]
    fn removing_a_shadowed_object_frees_every_version() {
        let mut registry = make_registry();
        let before = registry.live_versions();

        registry.push_state(1);
        registry.get(NodeId(1), CloneId::ORIGINAL, false).unwrap();
        registry.clone_object(NodeId(1), CloneId(1), true).unwrap();
        // the live original, its level 1 copy and the new clone
        assert_eq!(registry.live_versions(), before + 3);

        assert!(registry.remove_object(NodeId(1)));
        assert_eq!(registry.live_versions(), before);
        registry.pop_state(1);
        assert_eq!(registry.live_versions(), before);
        assert!(!registry.contains(NodeId(1), CloneId::ORIGINAL));
    }

    #[test]
    fn clone_copies_the_shadowed_original() {
        let mut registry = make_registry();
        registry.push_state(1);
        let h = registry.get(NodeId(2), CloneId::ORIGINAL, false).unwrap();
        registry
            .object_mut(h)
            .unwrap()
            .set_property("gold", Value::Int(7));
        let c = registry.clone_object(NodeId(2), CloneId::AUTO, true).unwrap();
        assert_eq!(gold(&registry, c), 7);
        registry.pop_state(1);
    }

    #[test]
    fn feature_properties_reroute() {
        let mut state = make_state(1, "innkeeper", 50);
        assert_eq!(state.property("Stats.hp"), Some(&Value::Int(10)));
        assert!(state.set_property("Stats.hp", Value::Int(3)));
        assert_eq!(state.property("Stats.hp"), Some(&Value::Int(3)));
        assert!(!state.set_property("Stats.mana", Value::Int(3)));
        assert!(state.property("Missing.hp").is_none());
    }

    #[test]
    fn name_and_kind_lookups() {
        let mut registry = make_registry();
        assert_eq!(registry.id_by_name("bard"), Some(NodeId(2)));
        assert!(registry.get_by_name("bard", CloneId::ORIGINAL).is_some());
        assert!(registry.get_or_clone_by_name("bard", CloneId(1)).is_some());
        assert_eq!(registry.objects_of_kind("Entity"), vec![NodeId(1), NodeId(2)]);
        assert!(registry.remove_object(NodeId(2)));
        assert!(registry.objects_named("bard").is_empty());
        assert_eq!(registry.all_objects(), vec![NodeId(1)]);
    }

    fn entity(id: u64, name: &str) -> FlowNode {
        FlowNode {
            id: NodeId(id),
            technical_name: name.to_string(),
            kind: NodeKind::Entity,
            text: String::new(),
            speaker: None,
            input_pins: vec![],
            output_pins: vec![],
            properties: HashMap::new(),
            features: HashMap::new(),
        }
    }

    #[test]
    fn packages_load_and_unload() {
        let graph = FlowGraph::new(
            vec![
                Package {
                    name: "core".to_string(),
                    is_default: true,
                    objects: vec![entity(1, "hero")],
                },
                Package {
                    name: "dlc".to_string(),
                    is_default: false,
                    objects: vec![entity(2, "dragon")],
                },
            ],
            vec![],
        )
        .unwrap();
        let mut db = Database::new(graph).unwrap();
        assert_eq!(db.loaded_packages(), ["core".to_string()]);
        assert!(db.objects().contains(NodeId(1), CloneId::ORIGINAL));
        assert!(!db.objects().contains(NodeId(2), CloneId::ORIGINAL));

        db.load_package("dlc").unwrap();
        assert!(db.objects().contains(NodeId(2), CloneId::ORIGINAL));
        assert!(db.unload_package("dlc"));
        assert!(!db.objects().contains(NodeId(2), CloneId::ORIGINAL));
        assert!(!db.unload_package("dlc"));
        assert!(db.is_default_package("core"));
        assert!(matches!(
            db.load_package("missing"),
            Err(DatabaseError::UnknownPackage(_))
        ));
    }

    #[test]
    fn named_variable_sets_start_pristine() {
        let mut graph_vars = crate::schema::graph::NamespaceDef {
            name: "Game".to_string(),
            description: String::new(),
            variables: vec![],
        };
        graph_vars.variables.push(crate::schema::graph::VariableDef {
            name: "gold".to_string(),
            value: Value::Int(1),
            description: String::new(),
        });
        let graph = FlowGraph::new(vec![], vec![graph_vars]).unwrap();
        let mut db = Database::new(graph).unwrap();
        db.variables_mut().set_int("Game", "gold", 40);

        let alt = VariableSet::Named("replay".to_string());
        assert!(db.variable_set(&alt).is_none());
        assert_eq!(db.variable_set_mut(&alt).get_int("Game", "gold"), (1, true));
        assert_eq!(db.variables().get_int("Game", "gold"), (40, true));
    }

    #[test]
    fn shadow_levels_reach_objects_variables_and_scripts() {
        let mut db = Database::new(FlowGraph::new(vec![], vec![]).unwrap()).unwrap();
        db.push_state(1, &VariableSet::Default);
        assert_eq!(db.objects().shadow_level(), 1);
        assert_eq!(db.variables().shadow_level(), 1);
        assert_eq!(db.scripts().shadow_level(), 1);
        db.pop_state(1, &VariableSet::Default);
        assert_eq!(db.scripts().shadow_level(), 0);
    }
}
