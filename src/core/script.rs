//! Script fragments: compiled condition/instruction callables keyed by
//! [`FragmentId`], and the context they run in.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::database::{CloneRegistry, ObjectHandle};
use crate::core::shadow::{ShadowLevel, ShadowStack, ShadowStateManager};
use crate::core::variables::VariableStore;
use crate::schema::fragment::FragmentId;
use crate::schema::ids::{CloneId, FlowRef, NodeId};
use crate::schema::value::{Value, ValueError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("unknown {kind} fragment {id}")]
    UnknownFragment { kind: &'static str, id: FragmentId },
    #[error("malformed object reference: {0:?}")]
    MalformedReference(String),
    #[error("object not found: {0}")]
    UnknownObject(String),
    #[error("object {object} has no property {property:?}")]
    UnknownProperty { object: FlowRef, property: String },
    #[error("no method provider to call {0:?}")]
    NoMethodProvider(String),
    #[error("method not handled: {0:?}")]
    UnknownMethod(String),
    #[error("value error: {0}")]
    Value(#[from] ValueError),
}

/// Host-side functions scripts can call by name.
pub trait MethodProvider {
    /// Handle `method`, or return `None` if this provider does not know it.
    ///
    /// `shadow_level` is non-zero while the call is speculative; providers
    /// with outside side effects should skip them then.
    fn call(&mut self, method: &str, args: &[Value], shadow_level: ShadowLevel) -> Option<Value>;
}

/// An optional method provider borrowed for one script call.
pub type Methods<'a> = Option<&'a mut (dyn MethodProvider + 'static)>;

pub type ConditionFn = Box<dyn Fn(&mut ScriptContext<'_>) -> bool>;
pub type InstructionFn = Box<dyn Fn(&mut ScriptContext<'_>)>;

/// Everything a fragment can see while it runs.
pub struct ScriptContext<'a> {
    variables: &'a mut VariableStore,
    objects: &'a mut CloneRegistry,
    methods: Methods<'a>,
    self_object: Option<FlowRef>,
    speaker: Option<FlowRef>,
    rng: &'a mut StdRng,
}

impl<'a> ScriptContext<'a> {
    /// The flow object whose script is running.
    pub fn self_object(&self) -> Option<FlowRef> {
        self.self_object
    }

    /// The speaker of the running object, if it has one.
    pub fn speaker(&self) -> Option<FlowRef> {
        self.speaker
    }

    pub fn shadow_level(&self) -> ShadowLevel {
        self.variables.shadow_level()
    }

    pub fn variables(&mut self) -> &mut VariableStore {
        self.variables
    }

    pub fn objects(&mut self) -> &mut CloneRegistry {
        self.objects
    }

    pub fn get(&self, full_name: &str) -> Value {
        self.variables.get_by_name(full_name).0
    }

    pub fn get_bool(&self, full_name: &str) -> bool {
        self.get(full_name).as_bool().unwrap_or(false)
    }

    pub fn get_int(&self, full_name: &str) -> i64 {
        self.get(full_name).as_int().unwrap_or(0)
    }

    pub fn get_string(&self, full_name: &str) -> String {
        match self.get(full_name) {
            Value::String(s) => s,
            _ => String::new(),
        }
    }

    pub fn set(&mut self, full_name: &str, value: impl Into<Value>) -> bool {
        self.variables.set_by_name(full_name, value)
    }

    /// Find an object by `0x` hex id, decimal id or technical name.
    pub fn get_obj(&mut self, name_or_id: &str, clone: CloneId) -> Option<FlowRef> {
        let id = match name_or_id.parse::<NodeId>() {
            Ok(id) => id,
            Err(_) => self.objects.id_by_name(name_or_id)?,
        };
        let handle = self.objects.get(id, clone, false)?;
        self.objects.object(handle).map(|o| o.flow_ref())
    }

    /// Resolve an object value (a `"<id>_<clone>"` string).
    pub fn resolve(&mut self, key: &Value) -> Result<FlowRef, ScriptError> {
        let handle = ScriptRunner::get_object_by_compound_key(self.objects, key)?;
        self.objects
            .object(handle)
            .map(|o| o.flow_ref())
            .ok_or_else(|| ScriptError::UnknownObject(key.to_string()))
    }

    fn handle(&mut self, object: FlowRef) -> Result<ObjectHandle, ScriptError> {
        self.objects
            .get(object.id, object.clone, false)
            .ok_or_else(|| ScriptError::UnknownObject(object.to_string()))
    }

    /// Read `"Property"` or `"Feature.Property"` of an object.
    pub fn get_prop(&mut self, object: FlowRef, property: &str) -> Result<Value, ScriptError> {
        let handle = self.handle(object)?;
        self.objects
            .object(handle)
            .and_then(|o| o.property(property))
            .cloned()
            .ok_or_else(|| ScriptError::UnknownProperty {
                object,
                property: property.to_string(),
            })
    }

    /// Write a declared property. Inside a shadow level this touches the
    /// level's private copy of the object.
    pub fn set_prop(
        &mut self,
        object: FlowRef,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<(), ScriptError> {
        let handle = self.handle(object)?;
        let written = self
            .objects
            .object_mut(handle)
            .is_some_and(|o| o.set_property(property, value.into()));
        if !written {
            return Err(ScriptError::UnknownProperty {
                object,
                property: property.to_string(),
            });
        }
        Ok(())
    }

    pub fn increment_prop(
        &mut self,
        object: FlowRef,
        property: &str,
        by: impl Into<Value>,
    ) -> Result<(), ScriptError> {
        let current = self.get_prop(object, property)?;
        self.set_prop(object, property, current.add(&by.into())?)
    }

    pub fn decrement_prop(
        &mut self,
        object: FlowRef,
        property: &str,
        by: impl Into<Value>,
    ) -> Result<(), ScriptError> {
        let current = self.get_prop(object, property)?;
        self.set_prop(object, property, current.sub(&by.into())?)
    }

    /// `low <= value <= high`, for numbers or strings.
    pub fn is_in_range(value: &Value, low: &Value, high: &Value) -> Result<bool, ValueError> {
        Ok(value.greater_or_equal(low)? && value.less_or_equal(high)?)
    }

    pub fn is_prop_in_range(
        &mut self,
        object: FlowRef,
        property: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Result<bool, ScriptError> {
        let value = self.get_prop(object, property)?;
        Ok(Self::is_in_range(&value, &low.into(), &high.into())?)
    }

    /// Uniform integer in `[min, max]`.
    pub fn random_int(&mut self, min: i64, max: i64) -> i64 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        self.rng.gen_range(lo..=hi)
    }

    /// Uniform float in `[min, max)`; `min` when the range is empty.
    pub fn random_float(&mut self, min: f64, max: f64) -> f64 {
        if min < max {
            self.rng.gen_range(min..max)
        } else {
            min
        }
    }

    /// Random value between two values: an Int for two Ints, a Float otherwise.
    pub fn random(&mut self, min: &Value, max: &Value) -> Result<Value, ValueError> {
        match (min, max) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(self.random_int(*a, *b))),
            _ => Ok(Value::Float(self.random_float(min.as_float()?, max.as_float()?))),
        }
    }

    /// Substitute `{0}`, `{1}`… with `args`, log the result at info level
    /// and return it.
    pub fn print(&self, message: &str, args: &[Value]) -> String {
        let mut text = message.to_string();
        for (i, arg) in args.iter().enumerate() {
            text = text.replace(&format!("{{{i}}}"), &arg.to_string());
        }
        info!(target: "narrative_flow::script", "{text}");
        text
    }

    /// Call a host method through the method provider.
    pub fn call_method(&mut self, method: &str, args: &[Value]) -> Result<Value, ScriptError> {
        let level = self.shadow_level();
        let provider = self
            .methods
            .as_deref_mut()
            .ok_or_else(|| ScriptError::NoMethodProvider(method.to_string()))?;
        provider
            .call(method, args, level)
            .ok_or_else(|| ScriptError::UnknownMethod(method.to_string()))
    }
}

/// Compiled fragments and the bindings they run with.
pub struct ScriptRunner {
    conditions: FxHashMap<FragmentId, ConditionFn>,
    instructions: FxHashMap<FragmentId, InstructionFn>,
    current_object: Option<FlowRef>,
    speaker: Option<FlowRef>,
    rng: StdRng,
    /// RNG state saved as each shadow level opens.
    rng_shadow: ShadowStack<StdRng>,
    default_methods: Option<Box<dyn MethodProvider>>,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("conditions", &self.conditions.len())
            .field("instructions", &self.instructions.len())
            .field("current_object", &self.current_object)
            .field("speaker", &self.speaker)
            .finish_non_exhaustive()
    }
}

impl ScriptRunner {
    /// A runner with an entropy-seeded RNG.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// A runner whose `random*` helpers are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        let mut runner = Self {
            conditions: FxHashMap::default(),
            instructions: FxHashMap::default(),
            current_object: None,
            speaker: None,
            rng,
            rng_shadow: ShadowStack::new(),
            default_methods: None,
        };
        runner.insert_condition(FragmentId::empty(), |_| true);
        runner.insert_instruction(FragmentId::empty(), |_| {});
        runner
    }

    /// Register the condition compiled from `source`.
    pub fn add_condition(
        &mut self,
        source: &str,
        condition: impl Fn(&mut ScriptContext<'_>) -> bool + 'static,
    ) -> FragmentId {
        let id = FragmentId::from_source(source);
        self.insert_condition(id, condition);
        id
    }

    /// Register the instruction compiled from `source`.
    pub fn add_instruction(
        &mut self,
        source: &str,
        instruction: impl Fn(&mut ScriptContext<'_>) + 'static,
    ) -> FragmentId {
        let id = FragmentId::from_source(source);
        self.insert_instruction(id, instruction);
        id
    }

    pub fn insert_condition(
        &mut self,
        id: FragmentId,
        condition: impl Fn(&mut ScriptContext<'_>) -> bool + 'static,
    ) {
        self.conditions.insert(id, Box::new(condition));
    }

    pub fn insert_instruction(
        &mut self,
        id: FragmentId,
        instruction: impl Fn(&mut ScriptContext<'_>) + 'static,
    ) {
        self.instructions.insert(id, Box::new(instruction));
    }

    pub fn has_condition(&self, id: FragmentId) -> bool {
        self.conditions.contains_key(&id)
    }

    pub fn has_instruction(&self, id: FragmentId) -> bool {
        self.instructions.contains_key(&id)
    }

    pub fn set_current_object(&mut self, object: Option<FlowRef>) {
        self.current_object = object;
    }

    pub fn set_speaker(&mut self, speaker: Option<FlowRef>) {
        self.speaker = speaker;
    }

    pub fn current_object(&self) -> Option<FlowRef> {
        self.current_object
    }

    pub fn speaker(&self) -> Option<FlowRef> {
        self.speaker
    }

    /// Used when a call passes no method provider.
    pub fn set_default_methods(&mut self, provider: Box<dyn MethodProvider>) {
        self.default_methods = Some(provider);
    }

    /// Run a condition. Unknown fragments log a warning and read as `false`.
    pub fn evaluate(
        &mut self,
        id: FragmentId,
        variables: &mut VariableStore,
        objects: &mut CloneRegistry,
        methods: Methods<'_>,
    ) -> bool {
        let ScriptRunner {
            conditions,
            current_object,
            speaker,
            rng,
            default_methods,
            ..
        } = self;
        let Some(condition) = conditions.get(&id) else {
            let e = ScriptError::UnknownFragment { kind: "condition", id };
            warn!(object = ?current_object, "{e}");
            return false;
        };
        let methods = match methods {
            Some(m) => Some(m),
            None => default_methods.as_deref_mut(),
        };
        let mut ctx = ScriptContext {
            variables,
            objects,
            methods,
            self_object: *current_object,
            speaker: *speaker,
            rng,
        };
        let result = condition(&mut ctx);
        debug!(fragment = %id, result, "evaluated condition");
        result
    }

    /// Run an instruction. Returns `false` if the fragment is unknown.
    pub fn execute(
        &mut self,
        id: FragmentId,
        variables: &mut VariableStore,
        objects: &mut CloneRegistry,
        methods: Methods<'_>,
    ) -> bool {
        let ScriptRunner {
            instructions,
            current_object,
            speaker,
            rng,
            default_methods,
            ..
        } = self;
        let Some(instruction) = instructions.get(&id) else {
            let e = ScriptError::UnknownFragment { kind: "instruction", id };
            warn!(object = ?current_object, "{e}");
            return false;
        };
        let methods = match methods {
            Some(m) => Some(m),
            None => default_methods.as_deref_mut(),
        };
        let mut ctx = ScriptContext {
            variables,
            objects,
            methods,
            self_object: *current_object,
            speaker: *speaker,
            rng,
        };
        instruction(&mut ctx);
        debug!(fragment = %id, "executed instruction");
        true
    }

    /// Resolve a `"<id>_<clone>"` object value to the version visible at
    /// the current shadow level.
    pub fn get_object_by_compound_key(
        objects: &mut CloneRegistry,
        key: &Value,
    ) -> Result<ObjectHandle, ScriptError> {
        let text = key
            .as_str()
            .map_err(|_| ScriptError::MalformedReference(key.to_string()))?;
        let r = FlowRef::from_compound_key(text)
            .map_err(|_| ScriptError::MalformedReference(text.to_string()))?;
        objects
            .get(r.id, r.clone, false)
            .ok_or_else(|| ScriptError::UnknownObject(text.to_string()))
    }
}

/// Draws made inside a shadow level are rewound when it pops.
impl ShadowStateManager for ScriptRunner {
    fn shadow_level(&self) -> ShadowLevel {
        self.rng_shadow.level()
    }

    fn push_state(&mut self, level: ShadowLevel) {
        self.rng_shadow.push(level);
        self.rng_shadow.register(self.rng.clone());
    }

    fn pop_state(&mut self, level: ShadowLevel) {
        if let Some(saved) = self.rng_shadow.pop(level).into_iter().next() {
            self.rng = saved;
        }
    }
}
