//! Global variables: typed, namespaced, shadow-aware, with change observers.

use rustc_hash::FxHashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::shadow::{ShadowLevel, ShadowStack, ShadowStateManager, ShadowedValue};
use crate::schema::graph::NamespaceDef;
use crate::schema::ids::FlowRef;
use crate::schema::value::{Value, ValueKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VariableError {
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("variable {name} cannot hold a {kind} value")]
    UnsupportedType { name: String, kind: ValueKind },
    #[error("variable defined twice: {0}")]
    DuplicateVariable(String),
    #[error("malformed variable name {0:?}: expected \"Namespace.Variable\"")]
    MalformedName(String),
}

/// A fully qualified variable name, `"Namespace.Variable"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GvName {
    pub namespace: String,
    pub variable: String,
}

impl GvName {
    pub fn new(namespace: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            variable: variable.into(),
        }
    }
}

impl FromStr for GvName {
    type Err = VariableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('.') {
            Some((ns, var)) if !ns.is_empty() && !var.is_empty() && !var.contains('.') => {
                Ok(GvName::new(ns, var))
            }
            _ => Err(VariableError::MalformedName(s.to_string())),
        }
    }
}

impl fmt::Display for GvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.variable)
    }
}

/// A committed (level 0) variable write.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableChange {
    pub name: GvName,
    pub value: Value,
}

/// Handle returned by the `subscribe*` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn FnMut(&VariableChange)>;

enum Filter {
    All,
    Namespace(String),
    Variable(GvName),
}

impl Filter {
    fn matches(&self, name: &GvName) -> bool {
        match self {
            Filter::All => true,
            Filter::Namespace(ns) => *ns == name.namespace,
            Filter::Variable(v) => v == name,
        }
    }
}

#[derive(Debug, Clone)]
struct Variable {
    name: String,
    description: String,
    value: ShadowedValue<Value>,
}

#[derive(Debug, Clone)]
struct Namespace {
    name: String,
    description: String,
    variables: Vec<Variable>,
    by_name: FxHashMap<String, usize>,
}

#[derive(Debug, Clone, Copy)]
struct VariableUndo {
    namespace: usize,
    variable: usize,
}

/// The global variable store.
pub struct VariableStore {
    namespaces: Vec<Namespace>,
    by_namespace: FxHashMap<String, usize>,
    shadow: ShadowStack<VariableUndo>,
    observers: Vec<(SubscriptionId, Filter, Observer)>,
    next_subscription: u64,
    log_access: bool,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableStore")
            .field("namespaces", &self.namespaces)
            .field("shadow_level", &self.shadow.level())
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            namespaces: Vec::new(),
            by_namespace: FxHashMap::default(),
            shadow: ShadowStack::new(),
            observers: Vec::new(),
            next_subscription: 0,
            log_access: false,
        }
    }

    /// Build a store holding the initial values of `definitions`.
    pub fn from_definitions(definitions: &[NamespaceDef]) -> Result<Self, VariableError> {
        let mut store = Self::new();
        for namespace in definitions {
            let ns = store.namespace_index_or_insert(&namespace.name);
            store.namespaces[ns].description = namespace.description.clone();
            for def in &namespace.variables {
                store.define(&namespace.name, &def.name, def.value.clone())?;
                if let Some(var) = store.variable_mut(&namespace.name, &def.name) {
                    var.description = def.description.clone();
                }
            }
        }
        Ok(store)
    }

    fn namespace_index_or_insert(&mut self, namespace: &str) -> usize {
        if let Some(&idx) = self.by_namespace.get(namespace) {
            return idx;
        }
        let idx = self.namespaces.len();
        self.namespaces.push(Namespace {
            name: namespace.to_string(),
            description: String::new(),
            variables: Vec::new(),
            by_name: FxHashMap::default(),
        });
        self.by_namespace.insert(namespace.to_string(), idx);
        idx
    }

    /// Declare a variable. Only bool, int and string values may be stored.
    pub fn define(
        &mut self,
        namespace: &str,
        name: &str,
        initial: impl Into<Value>,
    ) -> Result<(), VariableError> {
        let initial = initial.into();
        let full = GvName::new(namespace, name);
        if initial.kind() == ValueKind::Float {
            return Err(VariableError::UnsupportedType {
                name: full.to_string(),
                kind: ValueKind::Float,
            });
        }
        let ns = self.namespace_index_or_insert(namespace);
        let namespace = &mut self.namespaces[ns];
        if namespace.by_name.contains_key(name) {
            return Err(VariableError::DuplicateVariable(full.to_string()));
        }
        namespace.by_name.insert(name.to_string(), namespace.variables.len());
        namespace.variables.push(Variable {
            name: name.to_string(),
            description: String::new(),
            value: ShadowedValue::new(initial),
        });
        Ok(())
    }

    fn locate(&self, namespace: &str, name: &str) -> Option<(usize, usize)> {
        let ns = *self.by_namespace.get(namespace)?;
        let var = *self.namespaces[ns].by_name.get(name)?;
        Some((ns, var))
    }

    fn variable_mut(&mut self, namespace: &str, name: &str) -> Option<&mut Variable> {
        let (ns, var) = self.locate(namespace, name)?;
        Some(&mut self.namespaces[ns].variables[var])
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.locate(namespace, name).is_some()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.by_namespace.contains_key(namespace)
    }

    /// Current value and whether the variable exists. Unknown variables log a
    /// warning and read as `false`.
    pub fn get(&self, namespace: &str, name: &str) -> (Value, bool) {
        match self.locate(namespace, name) {
            Some((ns, var)) => {
                let value = self.namespaces[ns].variables[var].value.get().clone();
                if self.log_access {
                    debug!(variable = %GvName::new(namespace, name), %value, "read");
                }
                (value, true)
            }
            None => {
                warn!(namespace, name, "unknown variable read");
                (Value::Bool(false), false)
            }
        }
    }

    pub fn get_by_name(&self, full_name: &str) -> (Value, bool) {
        match full_name.parse::<GvName>() {
            Ok(gv) => self.get(&gv.namespace, &gv.variable),
            Err(e) => {
                warn!("{e}");
                (Value::Bool(false), false)
            }
        }
    }

    fn get_typed<T>(
        &self,
        namespace: &str,
        name: &str,
        default: T,
        convert: impl Fn(&Value) -> Option<T>,
    ) -> (T, bool) {
        let (value, found) = self.get(namespace, name);
        if !found {
            return (default, false);
        }
        match convert(&value) {
            Some(v) => (v, true),
            None => {
                warn!(namespace, name, found = %value.kind(), "variable read with the wrong type");
                (default, false)
            }
        }
    }

    pub fn get_bool(&self, namespace: &str, name: &str) -> (bool, bool) {
        self.get_typed(namespace, name, false, |v| v.as_bool().ok())
    }

    pub fn get_int(&self, namespace: &str, name: &str) -> (i64, bool) {
        self.get_typed(namespace, name, 0, |v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        })
    }

    pub fn get_string(&self, namespace: &str, name: &str) -> (String, bool) {
        self.get_typed(namespace, name, String::new(), |v| {
            v.as_str().ok().map(str::to_string)
        })
    }

    /// Assign a variable. Returns `false` if it does not exist or cannot hold
    /// the value.
    ///
    /// Inside a shadow level the first write snapshots the previous value so
    /// popping the level restores it. Writes at level 0 notify observers.
    pub fn set(&mut self, namespace: &str, name: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        let Some((ns, var)) = self.locate(namespace, name) else {
            warn!(namespace, name, "unknown variable write");
            return false;
        };
        let level = self.shadow.level();
        let slot = &mut self.namespaces[ns].variables[var].value;
        let Some(value) = coerce_for(slot.get().kind(), value) else {
            warn!(
                namespace,
                name,
                expected = %slot.get().kind(),
                "variable assigned a value of the wrong type"
            );
            return false;
        };
        if self.log_access {
            debug!(variable = %GvName::new(namespace, name), %value, level, "write");
        }
        let notify = (level == 0).then(|| value.clone());
        if slot.set(level, value) {
            self.shadow.register(VariableUndo {
                namespace: ns,
                variable: var,
            });
        }
        if let Some(value) = notify {
            self.notify(VariableChange {
                name: GvName::new(namespace, name),
                value,
            });
        }
        true
    }

    pub fn set_by_name(&mut self, full_name: &str, value: impl Into<Value>) -> bool {
        match full_name.parse::<GvName>() {
            Ok(gv) => self.set(&gv.namespace, &gv.variable, value),
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    pub fn set_bool(&mut self, namespace: &str, name: &str, value: bool) -> bool {
        self.set(namespace, name, Value::Bool(value))
    }

    pub fn set_int(&mut self, namespace: &str, name: &str, value: i64) -> bool {
        self.set(namespace, name, Value::Int(value))
    }

    pub fn set_string(&mut self, namespace: &str, name: &str, value: impl Into<String>) -> bool {
        self.set(namespace, name, Value::String(value.into()))
    }

    /// Read-modify-write an integer variable (`+=`, `*=`, `++` and friends).
    pub fn update_int(&mut self, namespace: &str, name: &str, f: impl FnOnce(i64) -> i64) -> bool {
        let (current, found) = self.get_int(namespace, name);
        found && self.set_int(namespace, name, f(current))
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&VariableChange) + 'static) -> SubscriptionId {
        self.add_observer(Filter::All, Box::new(observer))
    }

    pub fn subscribe_namespace(
        &mut self,
        namespace: &str,
        observer: impl FnMut(&VariableChange) + 'static,
    ) -> SubscriptionId {
        self.add_observer(Filter::Namespace(namespace.to_string()), Box::new(observer))
    }

    pub fn subscribe_variable(
        &mut self,
        name: GvName,
        observer: impl FnMut(&VariableChange) + 'static,
    ) -> SubscriptionId {
        self.add_observer(Filter::Variable(name), Box::new(observer))
    }

    fn add_observer(&mut self, filter: Filter, observer: Observer) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, filter, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sub, _, _)| *sub != id);
        self.observers.len() != before
    }

    fn notify(&mut self, change: VariableChange) {
        for (_, filter, observer) in &mut self.observers {
            if filter.matches(&change.name) {
                observer(&change);
            }
        }
    }

    pub fn set_access_logging(&mut self, enabled: bool) {
        self.log_access = enabled;
    }

    pub fn access_logging(&self) -> bool {
        self.log_access
    }

    /// Render `"Namespace::Variable = value"` and log it.
    pub fn describe(&self, full_name: &str) -> Option<String> {
        let gv = full_name.parse::<GvName>().ok()?;
        let (ns, var) = self.locate(&gv.namespace, &gv.variable)?;
        let line = format!(
            "{}::{} = {}",
            gv.namespace,
            gv.variable,
            self.namespaces[ns].variables[var].value.get()
        );
        info!("{line}");
        Some(line)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.iter().map(|ns| ns.name.as_str())
    }

    pub fn namespace_description(&self, namespace: &str) -> Option<&str> {
        let ns = *self.by_namespace.get(namespace)?;
        Some(self.namespaces[ns].description.as_str())
    }

    pub fn description(&self, namespace: &str, name: &str) -> Option<&str> {
        let (ns, var) = self.locate(namespace, name)?;
        Some(self.namespaces[ns].variables[var].description.as_str())
    }

    /// Every variable as `(namespace, name, value)`, in definition order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.namespaces.iter().flat_map(|ns| {
            ns.variables
                .iter()
                .map(move |v| (ns.name.as_str(), v.name.as_str(), v.value.get()))
        })
    }
}

impl ShadowStateManager for VariableStore {
    fn shadow_level(&self) -> ShadowLevel {
        self.shadow.level()
    }

    fn push_state(&mut self, level: ShadowLevel) {
        self.shadow.push(level);
    }

    fn pop_state(&mut self, level: ShadowLevel) {
        for undo in self.shadow.pop(level) {
            self.namespaces[undo.namespace].variables[undo.variable]
                .value
                .pop(level);
        }
    }
}

/// Adapt `value` to a variable of kind `target`, or `None` if it cannot hold it.
fn coerce_for(target: ValueKind, value: Value) -> Option<Value> {
    match (target, value) {
        (t, v) if v.kind() == t => Some(v),
        (ValueKind::Int, Value::Float(f)) => Some(Value::Int(f as i64)),
        (ValueKind::String, Value::Int(id)) if id >= 0 => {
            Some(Value::object(FlowRef::original(crate::schema::ids::NodeId(id as u64))))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shadow::ShadowScope;
    use crate::schema::graph::VariableDef;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn make_store() -> VariableStore {
        let mut store = VariableStore::new();
        store.define("Game", "gold", 10).unwrap();
        store.define("Game", "met_bard", false).unwrap();
        store.define("Game", "title", "stranger").unwrap();
        store.define("Quest", "stage", 0).unwrap();
        store
    }

    #[test]
    fn reads_typed_values() {
        let store = make_store();
        assert_eq!(store.get_int("Game", "gold"), (10, true));
        assert_eq!(store.get_bool("Game", "met_bard"), (false, true));
        assert_eq!(store.get_string("Game", "title"), ("stranger".to_string(), true));
    }

    #[test]
    fn unknown_variables_read_as_defaults() {
        let store = make_store();
        assert_eq!(store.get_int("Game", "silver"), (0, false));
        assert_eq!(store.get_bool("Nope", "x"), (false, false));
        assert_eq!(store.get_by_name("Game.gold"), (Value::Int(10), true));
        assert_eq!(store.get_by_name("gold").1, false);
    }

    #[test]
    fn float_variables_cannot_be_defined() {
        let mut store = VariableStore::new();
        let err = store.define("Game", "ratio", 0.5).unwrap_err();
        assert!(matches!(err, VariableError::UnsupportedType { .. }));
    }

    #[test]
    fn assignments_coerce_like_the_variable_type() {
        let mut store = make_store();
        assert!(store.set("Game", "gold", 3.9));
        assert_eq!(store.get_int("Game", "gold"), (3, true));
        assert!(store.set("Game", "title", 42));
        assert_eq!(store.get_string("Game", "title").0, "42_0");
        assert!(!store.set("Game", "met_bard", 1));
        assert_eq!(store.get_bool("Game", "met_bard"), (false, true));
    }

    #[test]
    fn shadowed_writes_are_undone_on_pop() {
        let mut store = make_store();
        store.push_state(1);
        store.set_int("Game", "gold", 99);
        store.set_int("Game", "gold", 100);
        store.push_state(2);
        store.set_bool("Game", "met_bard", true);
        store.set_int("Game", "gold", 5);
        assert_eq!(store.get_int("Game", "gold").0, 5);
        store.pop_state(2);
        assert_eq!(store.get_int("Game", "gold").0, 100);
        assert_eq!(store.get_bool("Game", "met_bard").0, false);
        store.pop_state(1);
        assert_eq!(store.get_int("Game", "gold").0, 10);
    }

    #[test]
    fn observers_only_see_live_writes() {
        let mut store = make_store();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        store.subscribe(move |change| sink.borrow_mut().push(change.name.to_string()));

        {
            let mut scope = ShadowScope::enter(&mut store);
            scope.set_int("Game", "gold", 1);
        }
        assert!(seen.borrow().is_empty(), "shadowed write must not notify");

        store.set_int("Game", "gold", 2);
        assert_eq!(*seen.borrow(), vec!["Game.gold".to_string()]);
    }

    #[test]
    fn namespace_and_variable_observers_filter() {
        let mut store = make_store();
        let quest_changes = Rc::new(RefCell::new(0));
        let gold_changes = Rc::new(RefCell::new(0));
        let q = Rc::clone(&quest_changes);
        let g = Rc::clone(&gold_changes);
        store.subscribe_namespace("Quest", move |_| *q.borrow_mut() += 1);
        let sub = store.subscribe_variable(GvName::new("Game", "gold"), move |_| {
            *g.borrow_mut() += 1
        });

        store.set_int("Quest", "stage", 1);
        store.set_int("Game", "gold", 11);
        store.set_bool("Game", "met_bard", true);
        assert_eq!(*quest_changes.borrow(), 1);
        assert_eq!(*gold_changes.borrow(), 1);

        assert!(store.unsubscribe(sub));
        store.set_int("Game", "gold", 12);
        assert_eq!(*gold_changes.borrow(), 1);
    }

    #[test]
    fn update_int_reads_and_writes() {
        let mut store = make_store();
        assert!(store.update_int("Game", "gold", |g| g + 5));
        assert_eq!(store.get_int("Game", "gold").0, 15);
        assert!(!store.update_int("Game", "title", |g| g + 1));
    }

    #[test]
    fn loads_definitions_and_describes() {
        let defs = vec![NamespaceDef {
            name: "Tavern".to_string(),
            description: "The inn".to_string(),
            variables: vec![VariableDef {
                name: "open".to_string(),
                value: Value::Bool(true),
                description: "Doors unlocked".to_string(),
            }],
        }];
        let store = VariableStore::from_definitions(&defs).unwrap();
        assert_eq!(store.describe("Tavern.open").as_deref(), Some("Tavern::open = true"));
        assert_eq!(store.description("Tavern", "open"), Some("Doors unlocked"));
        assert_eq!(store.namespace_description("Tavern"), Some("The inn"));
        assert_eq!(store.iter().count(), 1);
    }

    #[test]
    fn gv_names_parse() {
        let gv: GvName = "Game.gold".parse().unwrap();
        assert_eq!(gv, GvName::new("Game", "gold"));
        assert!("Game.".parse::<GvName>().is_err());
        assert!("a.b.c".parse::<GvName>().is_err());
    }
}
