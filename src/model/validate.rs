//! Load-time checks shared by aggregate types and process definitions.

use std::collections::{BTreeMap, BTreeSet};

use super::{CommandDef, Effect, EventDef, ModelError, Result, StateGraph};

/// Commands, events and properties a graph may reference.
pub(super) struct Vocabulary<'a> {
    pub commands: &'a BTreeMap<String, CommandDef>,
    pub events: &'a BTreeMap<String, EventDef>,
    /// Names guards may test.
    pub readable: BTreeSet<&'a str>,
    /// Names transitions may assign.
    pub writable: BTreeSet<&'a str>,
}

pub(super) fn validate_graph(graph: &StateGraph, vocabulary: &Vocabulary<'_>) -> Result<()> {
    check_initial(graph)?;
    check_references(graph, vocabulary)?;
    check_property_references(graph, vocabulary)?;
    check_acyclic(graph)?;
    check_virtual_states(graph)?;
    check_exclusive_guards(graph)?;
    check_produced_commands(graph)?;
    Ok(())
}

/// Every command reachable from a concrete state must have a handler for
/// its event somewhere in that state's chain.
pub(super) fn validate_events_handled(
    graph: &StateGraph,
    commands: &BTreeMap<String, CommandDef>,
) -> Result<()> {
    for state in graph.states().filter(|s| !s.is_virtual) {
        for command in graph.available_commands(&state.name) {
            let Some(def) = commands.get(command) else {
                continue;
            };
            if graph.resolve_transitions(&state.name, &def.event).is_none() {
                return Err(ModelError::UnhandledEvent {
                    state: state.name.clone(),
                    command: command.to_string(),
                    event: def.event.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Merge parameters and assigned literals must name declared properties.
pub(super) fn validate_commands(
    commands: &BTreeMap<String, CommandDef>,
    properties: &BTreeSet<&str>,
) -> Result<()> {
    for command in commands.values() {
        let assigned: Vec<&String> = match &command.effect {
            Effect::Merge => command.parameters.iter().collect(),
            Effect::Assign(values) => values.keys().collect(),
            Effect::Record | Effect::Compute => Vec::new(),
        };
        if let Some(unknown) = assigned.into_iter().find(|p| !properties.contains(p.as_str())) {
            return Err(ModelError::UnknownProperty {
                owner: format!("Command '{}'", command.name),
                property: unknown.clone(),
            });
        }
    }
    Ok(())
}

fn check_initial(graph: &StateGraph) -> Result<()> {
    match graph.state(graph.initial()) {
        None => Err(ModelError::MissingInitialState {
            state: graph.initial().to_string(),
        }),
        Some(state) if state.is_virtual => Err(ModelError::VirtualInitialState {
            state: state.name.clone(),
        }),
        Some(_) => Ok(()),
    }
}

fn check_references(graph: &StateGraph, vocabulary: &Vocabulary<'_>) -> Result<()> {
    let unknown_state = |state: &str, referenced: &str| ModelError::UnknownState {
        state: state.to_string(),
        referenced: referenced.to_string(),
    };

    for state in graph.states() {
        if let Some(super_state) = &state.super_state {
            if graph.state(super_state).is_none() {
                return Err(unknown_state(&state.name, super_state));
            }
        }
        for command in &state.commands {
            if !vocabulary.commands.contains_key(command) {
                return Err(ModelError::UnknownCommand {
                    state: state.name.clone(),
                    command: command.clone(),
                });
            }
        }
        for transition in &state.transitions {
            if !vocabulary.events.contains_key(&transition.event) {
                return Err(ModelError::UnknownEvent {
                    state: state.name.clone(),
                    event: transition.event.clone(),
                });
            }
            if let Some(target) = &transition.target {
                match graph.state(target) {
                    None => return Err(unknown_state(&state.name, target)),
                    Some(t) if t.is_virtual => {
                        return Err(ModelError::VirtualTarget {
                            state: state.name.clone(),
                            target: target.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            for command in &transition.produce {
                if !vocabulary.commands.contains_key(command) {
                    return Err(ModelError::UnknownCommand {
                        state: state.name.clone(),
                        command: command.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_property_references(graph: &StateGraph, vocabulary: &Vocabulary<'_>) -> Result<()> {
    for state in graph.states() {
        for transition in &state.transitions {
            let unknown = |property: &str| ModelError::UnknownProperty {
                owner: format!("Transition on '{}' in '{}'", transition.event, state.name),
                property: property.to_string(),
            };
            for condition in transition.guard.conditions() {
                if !vocabulary.readable.contains(condition.property()) {
                    return Err(unknown(condition.property()));
                }
            }
            if let Some(property) = transition
                .assign
                .keys()
                .find(|p| !vocabulary.writable.contains(p.as_str()))
            {
                return Err(unknown(property));
            }
        }
    }
    Ok(())
}

fn check_acyclic(graph: &StateGraph) -> Result<()> {
    for state in graph.states() {
        let mut seen = BTreeSet::new();
        let mut current = Some(state);
        while let Some(s) = current {
            if !seen.insert(s.name.as_str()) {
                return Err(ModelError::CyclicHierarchy {
                    state: state.name.clone(),
                });
            }
            current = s.super_state.as_deref().and_then(|name| graph.state(name));
        }
    }
    Ok(())
}

fn check_virtual_states(graph: &StateGraph) -> Result<()> {
    let ancestors: BTreeSet<&str> = graph
        .states()
        .filter(|s| !s.is_virtual)
        .flat_map(|s| graph.chain(&s.name).skip(1).map(|a| a.name.as_str()))
        .collect();

    match graph
        .states()
        .find(|s| s.is_virtual && !ancestors.contains(s.name.as_str()))
    {
        Some(orphan) => Err(ModelError::OrphanVirtualState {
            state: orphan.name.clone(),
        }),
        None => Ok(()),
    }
}

fn check_exclusive_guards(graph: &StateGraph) -> Result<()> {
    for state in graph.states() {
        let transitions = &state.transitions;
        for (i, first) in transitions.iter().enumerate() {
            for second in transitions.iter().skip(i + 1) {
                if first.event == second.event && !first.guard.excludes(&second.guard) {
                    return Err(ModelError::AmbiguousTransition {
                        state: state.name.clone(),
                        event: first.event.clone(),
                        first: first.guard.to_string(),
                        second: second.guard.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_produced_commands(graph: &StateGraph) -> Result<()> {
    for state in graph.states() {
        for transition in &state.transitions {
            let target = transition.target.as_deref().unwrap_or(&state.name);
            for command in &transition.produce {
                if graph.resolve_command(target, command).is_none() {
                    return Err(ModelError::ProducedCommandNotAccepted {
                        state: state.name.clone(),
                        event: transition.event.clone(),
                        command: command.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}
