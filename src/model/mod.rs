//! Static model of aggregate types and process definitions.
//!
//! Everything here is immutable once built: states are plain data records,
//! hierarchy resolution is a table lookup followed by a walk up the
//! super-state chain, and the nearest declaring state wins.
//!
//! - `builder`: fluent construction plus load-time validation
//! - `guard`: declarative transition guards
//! - `definition`: YAML model documents
//! - `registry`: process-wide lookup of validated models

pub mod builder;
pub mod definition;
pub mod guard;
pub mod registry;
mod validate;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Properties;

pub use builder::{AggregateTypeBuilder, ProcessDefinitionBuilder};
pub use guard::{Condition, Guard};
pub use registry::ModelRegistry;

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Model authoring defects, detected when a model is built or loaded.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("State '{state}' references unknown state '{referenced}'")]
    UnknownState { state: String, referenced: String },

    #[error("State '{state}' references unknown command '{command}'")]
    UnknownCommand { state: String, command: String },

    #[error("State '{state}' handles unknown event '{event}'")]
    UnknownEvent { state: String, event: String },

    #[error("{owner} references unknown property '{property}'")]
    UnknownProperty { owner: String, property: String },

    #[error("Duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("Super-state chain of '{state}' is cyclic")]
    CyclicHierarchy { state: String },

    #[error("Virtual state '{state}' is not a super-state of any concrete state")]
    OrphanVirtualState { state: String },

    #[error("Transition in '{state}' targets virtual state '{target}'")]
    VirtualTarget { state: String, target: String },

    #[error("Initial state '{state}' is not defined")]
    MissingInitialState { state: String },

    #[error("Initial state '{state}' is virtual")]
    VirtualInitialState { state: String },

    #[error("Ambiguous transitions on '{event}' in state '{state}': [{first}] overlaps [{second}]")]
    AmbiguousTransition {
        state: String,
        event: String,
        first: String,
        second: String,
    },

    #[error("State '{state}' accepts '{command}' but nothing in its chain handles '{event}'")]
    UnhandledEvent {
        state: String,
        command: String,
        event: String,
    },

    #[error("Transition on '{event}' in '{state}' produces '{command}', which '{target}' does not accept")]
    ProducedCommandNotAccepted {
        state: String,
        event: String,
        command: String,
        target: String,
    },

    #[error("Command '{command}' computes its effect but no hook is registered")]
    MissingHook { command: String },

    #[error("Unknown aggregate type '{0}'")]
    UnknownAggregateType(String),

    #[error("Invalid model document {path}: {message}")]
    Document { path: String, message: String },

    #[error("Failed to read model {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Properties
// ============================================================================

/// Metadata flags carried for external collaborators (schema validation, UI).
/// The runtime does not enforce them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyFlags {
    pub unique: bool,
    pub hidden: bool,
    pub meta: bool,
}

/// Property of an aggregate (or saga flag of a process definition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    #[serde(rename = "type", default = "default_semantic_type")]
    pub semantic_type: String,
    #[serde(default)]
    pub flags: PropertyFlags,
    /// Value the property starts with when an instance is created.
    #[serde(default)]
    pub default: Option<Value>,
}

fn default_semantic_type() -> String {
    "string".to_string()
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, semantic_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            semantic_type: semantic_type.into(),
            flags: PropertyFlags::default(),
            default: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.flags.unique = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.flags.hidden = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.flags.meta = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

// ============================================================================
// Commands and events
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Create,
    Update,
    Delete,
    #[default]
    Custom,
}

/// How a command turns into proposed property values.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Merge the (prepared) payload into the properties.
    Merge,
    /// Set literal values, ignoring the payload for property purposes.
    Assign(Properties),
    /// Record the event without touching properties.
    Record,
    /// Delegate to the command hook; only the changes it returns are applied.
    Compute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandDef {
    pub name: String,
    pub kind: CommandKind,
    /// Payload keys the command accepts. A merging command left without
    /// parameters accepts every non-meta property of its aggregate.
    pub parameters: Vec<String>,
    pub effect: Effect,
    /// Name of the event this command produces.
    pub event: String,
}

impl CommandDef {
    pub fn new(name: impl Into<String>, kind: CommandKind) -> Self {
        let name = name.into();
        let effect = match kind {
            CommandKind::Create | CommandKind::Update => Effect::Merge,
            CommandKind::Delete | CommandKind::Custom => Effect::Record,
        };
        Self {
            event: default_event_name(&name),
            name,
            kind,
            parameters: Vec::new(),
            effect,
        }
    }

    pub fn create(name: impl Into<String>) -> Self {
        Self::new(name, CommandKind::Create)
    }

    pub fn update(name: impl Into<String>) -> Self {
        Self::new(name, CommandKind::Update)
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self::new(name, CommandKind::Delete)
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::new(name, CommandKind::Custom)
    }

    /// Update command that sets literal property values (`updateBy`).
    pub fn assign(name: impl Into<String>, values: Properties) -> Self {
        Self::new(name, CommandKind::Update).with_effect(Effect::Assign(values))
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }

    pub fn emits(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn params<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts(&self, parameter: &str) -> bool {
        self.parameters.iter().any(|p| p == parameter)
    }

    /// Whether payload keys are checked against `parameters`.
    pub fn restricts_payload(&self) -> bool {
        self.effect == Effect::Merge || !self.parameters.is_empty()
    }
}

/// Default event name: capitalised past tense (`disable` -> `Disabled`).
pub fn default_event_name(command: &str) -> String {
    let mut chars = command.chars();
    let mut name = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => return String::new(),
    };
    if name.ends_with('e') {
        name.push('d');
    } else {
        name.push_str("ed");
    }
    name
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDef {
    pub name: String,
    /// The single command that produces this event.
    pub command: String,
}

// ============================================================================
// States and transitions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event: String,
    pub guard: Guard,
    /// `None` keeps the current state.
    pub target: Option<String>,
    /// Follow-up commands run against the same instance after this transition.
    pub produce: Vec<String>,
    pub assign: Properties,
}

impl Transition {
    pub fn on(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            guard: Guard::always(),
            target: None,
            produce: Vec::new(),
            assign: Properties::new(),
        }
    }

    pub fn when(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn produce(mut self, command: impl Into<String>) -> Self {
        self.produce.push(command.into());
        self
    }

    pub fn assign(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assign.insert(property.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateDef {
    pub name: String,
    pub super_state: Option<String>,
    pub is_virtual: bool,
    pub commands: Vec<String>,
    pub transitions: Vec<Transition>,
}

impl StateDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_state: None,
            is_virtual: false,
            commands: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn extends(mut self, super_state: impl Into<String>) -> Self {
        self.super_state = Some(super_state.into());
        self
    }

    pub fn virtual_state(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn executes(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn handles(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn declares_command(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }

    pub fn transitions_for(&self, event: &str) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.event == event).collect()
    }
}

/// Result of picking the transition for an event.
#[derive(Debug)]
pub enum TransitionSelection<'a> {
    /// Exactly one guard matched in the nearest declaring state.
    Selected {
        declared_in: &'a StateDef,
        transition: &'a Transition,
    },
    /// The nearest declaring state has handlers, but no guard matched.
    NoMatch { declared_in: &'a StateDef },
    /// Nothing in the chain handles the event.
    Unhandled,
}

/// States plus hierarchy, shared by aggregates and process definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct StateGraph {
    states: BTreeMap<String, StateDef>,
    initial: String,
}

impl StateGraph {
    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.get(name)
    }

    pub fn states(&self) -> impl Iterator<Item = &StateDef> {
        self.states.values()
    }

    /// The state itself followed by its super-states, nearest first.
    pub fn chain(&self, state: &str) -> Chain<'_> {
        Chain {
            graph: self,
            next: self.states.get(state),
            remaining: self.states.len(),
        }
    }

    /// Nearest state in the chain that declares `command`.
    pub fn resolve_command(&self, state: &str, command: &str) -> Option<&StateDef> {
        self.chain(state).find(|s| s.declares_command(command))
    }

    /// Nearest state in the chain with at least one handler for `event`.
    pub fn resolve_transitions(&self, state: &str, event: &str) -> Option<(&StateDef, Vec<&Transition>)> {
        self.chain(state).find_map(|s| {
            let transitions = s.transitions_for(event);
            if transitions.is_empty() {
                None
            } else {
                Some((s, transitions))
            }
        })
    }

    /// Pick the transition for `event` given the values the guards see.
    pub fn select_transition(
        &self,
        state: &str,
        event: &str,
        properties: &Properties,
    ) -> TransitionSelection<'_> {
        match self.resolve_transitions(state, event) {
            None => TransitionSelection::Unhandled,
            Some((declared_in, candidates)) => {
                match candidates.into_iter().find(|t| t.guard.matches(properties)) {
                    Some(transition) => TransitionSelection::Selected {
                        declared_in,
                        transition,
                    },
                    None => TransitionSelection::NoMatch { declared_in },
                }
            }
        }
    }

    /// Commands executable from `state`, including inherited ones.
    pub fn available_commands(&self, state: &str) -> BTreeSet<&str> {
        self.chain(state)
            .flat_map(|s| s.commands.iter().map(String::as_str))
            .collect()
    }

    /// A state is terminal when nothing in its chain accepts a command.
    pub fn is_terminal(&self, state: &str) -> bool {
        self.chain(state).all(|s| s.commands.is_empty())
    }
}

/// Iterator over a state and its ancestors.
pub struct Chain<'a> {
    graph: &'a StateGraph,
    next: Option<&'a StateDef>,
    remaining: usize,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a StateDef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let state = self.next.take()?;
        self.remaining -= 1;
        self.next = state
            .super_state
            .as_deref()
            .and_then(|name| self.graph.states.get(name));
        Some(state)
    }
}

// ============================================================================
// Aggregate types and process definitions
// ============================================================================

/// Immutable definition of one aggregate type.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateType {
    name: String,
    properties: Vec<PropertyDef>,
    commands: BTreeMap<String, CommandDef>,
    events: BTreeMap<String, EventDef>,
    graph: StateGraph,
    allow_recreate: bool,
}

impl AggregateType {
    pub fn builder(name: impl Into<String>) -> AggregateTypeBuilder {
        AggregateTypeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn commands(&self) -> impl Iterator<Item = &CommandDef> {
        self.commands.values()
    }

    pub fn command(&self, name: &str) -> Option<&CommandDef> {
        self.commands.get(name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDef> {
        self.events.get(name)
    }

    /// The event a command produces.
    pub fn event_of(&self, command: &str) -> Option<&EventDef> {
        self.commands
            .get(command)
            .and_then(|c| self.events.get(&c.event))
    }

    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    /// Whether a create command may revive an instance sitting in a terminal state.
    pub fn allow_recreate(&self) -> bool {
        self.allow_recreate
    }

    /// Property values a freshly created instance starts from.
    pub fn initial_properties(&self) -> Properties {
        defaults_of(&self.properties)
    }
}

/// Immutable definition of a process manager (saga).
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDefinition {
    name: String,
    source: String,
    flags: Vec<PropertyDef>,
    graph: StateGraph,
}

impl ProcessDefinition {
    pub fn builder(name: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aggregate type whose events this process consumes and commands.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn flags(&self) -> &[PropertyDef] {
        &self.flags
    }

    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    pub fn initial_flags(&self) -> Properties {
        defaults_of(&self.flags)
    }
}

fn defaults_of(properties: &[PropertyDef]) -> Properties {
    properties
        .iter()
        .filter_map(|p| p.default.clone().map(|v| (p.name.clone(), v)))
        .collect()
}
