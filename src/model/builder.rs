//! Fluent construction of aggregate types and process definitions.
//!
//! `build()` always validates; an invalid model never escapes a builder.

use std::collections::{BTreeMap, BTreeSet};

use super::validate::{self, Vocabulary};
use super::{
    AggregateType, CommandDef, Effect, EventDef, ModelError, ProcessDefinition, PropertyDef,
    Result, StateDef, StateGraph,
};

pub struct AggregateTypeBuilder {
    name: String,
    properties: Vec<PropertyDef>,
    commands: Vec<CommandDef>,
    states: Vec<StateDef>,
    initial: Option<String>,
    allow_recreate: bool,
}

impl AggregateTypeBuilder {
    pub(super) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            commands: Vec::new(),
            states: Vec::new(),
            initial: None,
            allow_recreate: false,
        }
    }

    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn command(mut self, command: CommandDef) -> Self {
        self.commands.push(command);
        self
    }

    pub fn state(mut self, state: StateDef) -> Self {
        self.states.push(state);
        self
    }

    /// Initial state. Defaults to `Initial`.
    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    pub fn allow_recreate(mut self, allow: bool) -> Self {
        self.allow_recreate = allow;
        self
    }

    pub fn build(self) -> Result<AggregateType> {
        check_unique("property", self.properties.iter().map(|p| p.name.as_str()))?;
        let declared: BTreeSet<&str> = self.properties.iter().map(|p| p.name.as_str()).collect();
        let mergeable: Vec<String> = self
            .properties
            .iter()
            .filter(|p| !p.flags.meta)
            .map(|p| p.name.clone())
            .collect();

        let mut commands = BTreeMap::new();
        for mut command in self.commands {
            if command.effect == Effect::Merge && command.parameters.is_empty() {
                command.parameters = mergeable.clone();
            }
            if commands.contains_key(&command.name) {
                return Err(duplicate("command", &command.name));
            }
            commands.insert(command.name.clone(), command);
        }

        let mut events = BTreeMap::new();
        for command in commands.values() {
            if events.contains_key(&command.event) {
                return Err(duplicate("event", &command.event));
            }
            events.insert(
                command.event.clone(),
                EventDef {
                    name: command.event.clone(),
                    command: command.name.clone(),
                },
            );
        }

        validate::validate_commands(&commands, &declared)?;
        let graph = build_graph(self.states, self.initial)?;
        validate::validate_graph(
            &graph,
            &Vocabulary {
                commands: &commands,
                events: &events,
                readable: declared.clone(),
                writable: declared,
            },
        )?;
        validate::validate_events_handled(&graph, &commands)?;

        Ok(AggregateType {
            name: self.name,
            properties: self.properties,
            commands,
            events,
            graph,
            allow_recreate: self.allow_recreate,
        })
    }
}

pub struct ProcessDefinitionBuilder {
    name: String,
    flags: Vec<PropertyDef>,
    states: Vec<StateDef>,
    initial: Option<String>,
}

impl ProcessDefinitionBuilder {
    pub(super) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: Vec::new(),
            states: Vec::new(),
            initial: None,
        }
    }

    /// Saga-owned flag, kept on the process instance rather than the aggregate.
    pub fn flag(mut self, flag: PropertyDef) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn state(mut self, state: StateDef) -> Self {
        self.states.push(state);
        self
    }

    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Validate against the aggregate type whose events drive this process.
    pub fn build(self, source: &AggregateType) -> Result<ProcessDefinition> {
        check_unique("flag", self.flags.iter().map(|p| p.name.as_str()))?;

        // Guards see the saga flags merged with the payload of the event.
        let flags: BTreeSet<&str> = self.flags.iter().map(|f| f.name.as_str()).collect();
        let readable = flags
            .iter()
            .copied()
            .chain(source.properties.iter().map(|p| p.name.as_str()))
            .chain(
                source
                    .commands
                    .values()
                    .flat_map(|c| c.parameters.iter().map(String::as_str)),
            )
            .collect();

        let graph = build_graph(self.states, self.initial)?;
        validate::validate_graph(
            &graph,
            &Vocabulary {
                commands: &source.commands,
                events: &source.events,
                readable,
                writable: flags,
            },
        )?;

        Ok(ProcessDefinition {
            name: self.name,
            source: source.name.clone(),
            flags: self.flags,
            graph,
        })
    }
}

fn build_graph(states: Vec<StateDef>, initial: Option<String>) -> Result<StateGraph> {
    let mut by_name = BTreeMap::new();
    for state in states {
        if by_name.contains_key(&state.name) {
            return Err(duplicate("state", &state.name));
        }
        by_name.insert(state.name.clone(), state);
    }
    Ok(StateGraph {
        states: by_name,
        initial: initial.unwrap_or_else(|| "Initial".to_string()),
    })
}

fn check_unique<'a>(kind: &'static str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(duplicate(kind, name));
        }
    }
    Ok(())
}

fn duplicate(kind: &'static str, name: &str) -> ModelError {
    ModelError::Duplicate {
        kind,
        name: name.to_string(),
    }
}
