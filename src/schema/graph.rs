//! Flow graph description: nodes, pins, connections, packages and variable definitions.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use super::fragment::FragmentId;
use super::ids::NodeId;
use super::value::{Value, ValueKind};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("duplicate object id {0}")]
    DuplicateId(NodeId),
    #[error("condition {id} must have exactly two output pins, found {pins}")]
    MalformedCondition { id: NodeId, pins: usize },
    #[error("variable {namespace}.{name}: {reason}")]
    InvalidVariable {
        namespace: String,
        name: String,
        reason: String,
    },
}

/// Flow object categories the player can be configured to pause on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PausableType {
    FlowFragment,
    Dialogue,
    DialogueFragment,
    Hub,
    Jump,
    Condition,
    Instruction,
    Pin,
}

impl PausableType {
    pub const ALL: [PausableType; 8] = [
        PausableType::FlowFragment,
        PausableType::Dialogue,
        PausableType::DialogueFragment,
        PausableType::Hub,
        PausableType::Jump,
        PausableType::Condition,
        PausableType::Instruction,
        PausableType::Pin,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// A set of [`PausableType`]s, stored as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<PausableType>", into = "Vec<PausableType>")]
pub struct PauseMask(u8);

impl PauseMask {
    pub const fn empty() -> Self {
        PauseMask(0)
    }

    pub fn all() -> Self {
        PausableType::ALL.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, t: PausableType) -> bool {
        self.0 & t.bit() != 0
    }

    pub fn insert(&mut self, t: PausableType) {
        self.0 |= t.bit();
    }

    pub fn remove(&mut self, t: PausableType) {
        self.0 &= !t.bit();
    }

    pub fn with(mut self, t: PausableType) -> Self {
        self.insert(t);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = PausableType> + '_ {
        PausableType::ALL.into_iter().filter(|t| self.contains(*t))
    }
}

impl Default for PauseMask {
    /// Dialogue fragments, dialogues and flow fragments.
    fn default() -> Self {
        [
            PausableType::DialogueFragment,
            PausableType::Dialogue,
            PausableType::FlowFragment,
        ]
        .into_iter()
        .collect()
    }
}

impl FromIterator<PausableType> for PauseMask {
    fn from_iter<I: IntoIterator<Item = PausableType>>(iter: I) -> Self {
        let mut mask = PauseMask::empty();
        for t in iter {
            mask.insert(t);
        }
        mask
    }
}

impl From<Vec<PausableType>> for PauseMask {
    fn from(types: Vec<PausableType>) -> Self {
        types.into_iter().collect()
    }
}

impl From<PauseMask> for Vec<PausableType> {
    fn from(mask: PauseMask) -> Self {
        mask.iter().collect()
    }
}

/// An edge from an output pin (or a parent's input pin) to a target pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// The object owning the target pin.
    pub target: NodeId,
    pub target_pin: NodeId,
}

/// An input or output pin. Input pin scripts are conditions, output pin
/// scripts are instructions; an empty script is always true / a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: NodeId,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Pin {
    pub fn fragment(&self) -> FragmentId {
        FragmentId::from_source(&self.script)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    FlowFragment,
    Dialogue,
    DialogueFragment,
    Hub,
    Jump { target: NodeId, target_pin: NodeId },
    Condition { expression: String },
    Instruction { expression: String },
    /// A database object that is not part of the flow (a speaker, an item).
    Entity,
}

impl NodeKind {
    pub fn pausable_type(&self) -> Option<PausableType> {
        match self {
            NodeKind::FlowFragment => Some(PausableType::FlowFragment),
            NodeKind::Dialogue => Some(PausableType::Dialogue),
            NodeKind::DialogueFragment => Some(PausableType::DialogueFragment),
            NodeKind::Hub => Some(PausableType::Hub),
            NodeKind::Jump { .. } => Some(PausableType::Jump),
            NodeKind::Condition { .. } => Some(PausableType::Condition),
            NodeKind::Instruction { .. } => Some(PausableType::Instruction),
            NodeKind::Entity => None,
        }
    }

    /// Short name used in logs and by `objects_of_kind`.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::FlowFragment => "FlowFragment",
            NodeKind::Dialogue => "Dialogue",
            NodeKind::DialogueFragment => "DialogueFragment",
            NodeKind::Hub => "Hub",
            NodeKind::Jump { .. } => "Jump",
            NodeKind::Condition { .. } => "Condition",
            NodeKind::Instruction { .. } => "Instruction",
            NodeKind::Entity => "Entity",
        }
    }
}

/// One authored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    #[serde(default)]
    pub technical_name: String,
    pub kind: NodeKind,
    /// Spoken or displayed text, if any.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub speaker: Option<NodeId>,
    #[serde(default)]
    pub input_pins: Vec<Pin>,
    #[serde(default)]
    pub output_pins: Vec<Pin>,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    /// Named property groups, addressed by scripts as `"Feature.Property"`.
    #[serde(default)]
    pub features: HashMap<String, HashMap<String, Value>>,
}

/// A named group of objects that is loaded and unloaded as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub objects: Vec<FlowNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
}

/// The on-disk form of a [`FlowGraph`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub variables: Vec<NamespaceDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Node { package: usize, node: usize },
    InputPin { package: usize, node: usize, pin: usize },
    OutputPin { package: usize, node: usize, pin: usize },
}

/// A resolved view of one flow object in a [`FlowGraph`].
#[derive(Debug, Clone, Copy)]
pub enum FlowObject<'g> {
    Node(&'g FlowNode),
    InputPin { owner: &'g FlowNode, pin: &'g Pin },
    OutputPin { owner: &'g FlowNode, pin: &'g Pin },
}

impl<'g> FlowObject<'g> {
    pub fn id(&self) -> NodeId {
        match self {
            FlowObject::Node(n) => n.id,
            FlowObject::InputPin { pin, .. } | FlowObject::OutputPin { pin, .. } => pin.id,
        }
    }

    /// The node itself, or the node owning the pin.
    pub fn owner(&self) -> &'g FlowNode {
        match *self {
            FlowObject::Node(n) => n,
            FlowObject::InputPin { owner, .. } | FlowObject::OutputPin { owner, .. } => owner,
        }
    }

    pub fn pausable_type(&self) -> Option<PausableType> {
        match self {
            FlowObject::Node(n) => n.kind.pausable_type(),
            FlowObject::InputPin { .. } | FlowObject::OutputPin { .. } => Some(PausableType::Pin),
        }
    }

    /// The speaker bound while this object's scripts run.
    pub fn speaker(&self) -> Option<NodeId> {
        self.owner().speaker
    }
}

/// Severity of a [`LintIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LintIssue {
    pub severity: Severity,
    pub object: NodeId,
    pub message: String,
}

/// An indexed, validated flow graph.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    packages: Vec<Package>,
    variables: Vec<NamespaceDef>,
    index: FxHashMap<NodeId, Slot>,
    by_name: FxHashMap<String, NodeId>,
}

impl FlowGraph {
    /// Index and validate packages and variable definitions.
    pub fn new(packages: Vec<Package>, variables: Vec<NamespaceDef>) -> Result<Self, GraphError> {
        let mut index = FxHashMap::default();
        let mut by_name = FxHashMap::default();

        for (p, package) in packages.iter().enumerate() {
            for (n, node) in package.objects.iter().enumerate() {
                insert_unique(&mut index, node.id, Slot::Node { package: p, node: n })?;
                for (i, pin) in node.input_pins.iter().enumerate() {
                    let slot = Slot::InputPin { package: p, node: n, pin: i };
                    insert_unique(&mut index, pin.id, slot)?;
                }
                for (i, pin) in node.output_pins.iter().enumerate() {
                    let slot = Slot::OutputPin { package: p, node: n, pin: i };
                    insert_unique(&mut index, pin.id, slot)?;
                }
                if let NodeKind::Condition { .. } = node.kind {
                    if node.output_pins.len() != 2 {
                        return Err(GraphError::MalformedCondition {
                            id: node.id,
                            pins: node.output_pins.len(),
                        });
                    }
                }
                if !node.technical_name.is_empty() {
                    by_name.insert(node.technical_name.clone(), node.id);
                }
            }
        }

        for namespace in &variables {
            let mut seen = FxHashSet::default();
            for var in &namespace.variables {
                let invalid = |reason: &str| GraphError::InvalidVariable {
                    namespace: namespace.name.clone(),
                    name: var.name.clone(),
                    reason: reason.to_string(),
                };
                if !seen.insert(var.name.as_str()) {
                    return Err(invalid("defined twice"));
                }
                if var.value.kind() == ValueKind::Float {
                    return Err(invalid("variables must be bool, int or string"));
                }
            }
        }

        Ok(Self {
            packages,
            variables,
            index,
            by_name,
        })
    }

    pub fn from_description(description: GraphDescription) -> Result<Self, GraphError> {
        Self::new(description.packages, description.variables)
    }

    /// Load a graph from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<Self, GraphError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse a graph from a RON string.
    pub fn parse_ron(input: &str) -> Result<Self, GraphError> {
        let description: GraphDescription = ron::from_str(input)?;
        Self::from_description(description)
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn variables(&self) -> &[NamespaceDef] {
        &self.variables
    }

    pub fn len(&self) -> usize {
        self.packages.iter().map(|p| p.objects.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.packages.iter().flat_map(|p| p.objects.iter())
    }

    /// Resolve any node or pin id.
    pub fn object(&self, id: NodeId) -> Option<FlowObject<'_>> {
        let slot = *self.index.get(&id)?;
        let object = match slot {
            Slot::Node { package, node } => FlowObject::Node(&self.packages[package].objects[node]),
            Slot::InputPin { package, node, pin } => {
                let owner = &self.packages[package].objects[node];
                FlowObject::InputPin {
                    owner,
                    pin: &owner.input_pins[pin],
                }
            }
            Slot::OutputPin { package, node, pin } => {
                let owner = &self.packages[package].objects[node];
                FlowObject::OutputPin {
                    owner,
                    pin: &owner.output_pins[pin],
                }
            }
        };
        Some(object)
    }

    /// Resolve a node id; pins resolve to `None`.
    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        match self.object(id)? {
            FlowObject::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn id_by_name(&self, technical_name: &str) -> Option<NodeId> {
        self.by_name.get(technical_name).copied()
    }

    /// The pin a connection lands on, falling back to the target object itself.
    pub fn connection_target(&self, connection: &Connection) -> Option<FlowObject<'_>> {
        self.object(connection.target_pin)
            .or_else(|| self.object(connection.target))
    }

    /// Report structural problems that do not prevent loading.
    pub fn lint(&self) -> Vec<LintIssue> {
        let mut issues = Vec::new();
        let mut referenced: FxHashSet<NodeId> = FxHashSet::default();

        for node in self.nodes() {
            let pins = node.input_pins.iter().chain(node.output_pins.iter());
            for pin in pins {
                for connection in &pin.connections {
                    match self.connection_target(connection) {
                        Some(target) => {
                            referenced.insert(target.owner().id);
                        }
                        None => issues.push(LintIssue {
                            severity: Severity::Error,
                            object: pin.id,
                            message: format!(
                                "connection to unknown pin {} on {}",
                                connection.target_pin, connection.target
                            ),
                        }),
                    }
                }
            }
            for pin in &node.output_pins {
                if pin.connections.is_empty() && node.kind != NodeKind::Entity {
                    issues.push(LintIssue {
                        severity: Severity::Warning,
                        object: pin.id,
                        message: format!("output pin of '{}' leads nowhere", label(node)),
                    });
                }
            }
            if let NodeKind::Jump { target, target_pin } = &node.kind {
                match self.object(*target_pin) {
                    Some(FlowObject::InputPin { .. }) => {
                        referenced.insert(*target);
                    }
                    _ => issues.push(LintIssue {
                        severity: Severity::Warning,
                        object: node.id,
                        message: format!("jump '{}' has no valid target pin", label(node)),
                    }),
                }
            }
        }

        for node in self.nodes() {
            let has_entry = !node.input_pins.is_empty();
            if has_entry && node.kind != NodeKind::Entity && !referenced.contains(&node.id) {
                issues.push(LintIssue {
                    severity: Severity::Warning,
                    object: node.id,
                    message: format!("'{}' is never reached by a connection", label(node)),
                });
            }
        }

        issues
    }
}

fn insert_unique(
    index: &mut FxHashMap<NodeId, Slot>,
    id: NodeId,
    slot: Slot,
) -> Result<(), GraphError> {
    if index.insert(id, slot).is_some() {
        return Err(GraphError::DuplicateId(id));
    }
    Ok(())
}

fn label(node: &FlowNode) -> String {
    if node.technical_name.is_empty() {
        node.id.to_string()
    } else {
        node.technical_name.clone()
    }
}
