//! YAML model documents.
//!
//! ```yaml
//! aggregates:
//!   - name: Account
//!     properties:
//!       - { name: disabled, type: boolean, flags: { meta: true }, default: false }
//!     commands:
//!       - { name: create, kind: create, params: [disabled] }
//!       - { name: disable, kind: update, assign: { disabled: true } }
//!     states:
//!       - name: Initial
//!         executes: [create]
//!         handles:
//!           - { event: Created, when: { disabled: true }, to: Disabled }
//! processes:
//!   - name: AccountConfirmation
//!     source: Account
//!     states: [...]
//! ```

use serde::Deserialize;

use super::{
    AggregateType, CommandDef, CommandKind, Condition, Effect, Guard, ModelError,
    ProcessDefinition, PropertyDef, Result, StateDef, Transition,
};
use crate::types::Properties;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDocument {
    #[serde(default)]
    pub aggregates: Vec<AggregateDoc>,
    #[serde(default)]
    pub processes: Vec<ProcessDoc>,
}

impl ModelDocument {
    /// Parse a document; `origin` names the source in error messages.
    pub fn from_yaml(text: &str, origin: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| ModelError::Document {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateDoc {
    pub name: String,
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(default)]
    pub allow_recreate: bool,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    #[serde(default)]
    pub commands: Vec<CommandDoc>,
    pub states: Vec<StateDoc>,
}

impl AggregateDoc {
    pub fn build(self) -> Result<AggregateType> {
        let mut builder = AggregateType::builder(self.name).allow_recreate(self.allow_recreate);
        if let Some(initial) = self.initial {
            builder = builder.initial(initial);
        }
        for property in self.properties {
            builder = builder.property(property);
        }
        for command in self.commands {
            builder = builder.command(command.into_def());
        }
        for state in self.states {
            builder = builder.state(state.into_def());
        }
        builder.build()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessDoc {
    pub name: String,
    /// Aggregate type whose events drive the process.
    pub source: String,
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(default)]
    pub flags: Vec<PropertyDef>,
    pub states: Vec<StateDoc>,
}

impl ProcessDoc {
    pub fn build(self, source: &AggregateType) -> Result<ProcessDefinition> {
        let mut builder = ProcessDefinition::builder(self.name);
        if let Some(initial) = self.initial {
            builder = builder.initial(initial);
        }
        for flag in self.flags {
            builder = builder.flag(flag);
        }
        for state in self.states {
            builder = builder.state(state.into_def());
        }
        builder.build(source)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Merge,
    Assign,
    Record,
    Compute,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandDoc {
    pub name: String,
    #[serde(default)]
    pub kind: CommandKind,
    #[serde(default)]
    pub params: Vec<String>,
    /// Defaults to `assign` when literals are given, otherwise to the kind's default.
    #[serde(default)]
    pub effect: Option<EffectKind>,
    #[serde(default)]
    pub assign: Properties,
    #[serde(default)]
    pub emits: Option<String>,
}

impl CommandDoc {
    fn into_def(self) -> CommandDef {
        let mut def = CommandDef::new(self.name, self.kind).params(self.params);
        let effect = match (self.effect, self.assign.is_empty()) {
            (Some(EffectKind::Merge), _) => Some(Effect::Merge),
            (Some(EffectKind::Record), _) => Some(Effect::Record),
            (Some(EffectKind::Compute), _) => Some(Effect::Compute),
            (Some(EffectKind::Assign), _) | (None, false) => Some(Effect::Assign(self.assign)),
            (None, true) => None,
        };
        if let Some(effect) = effect {
            def = def.with_effect(effect);
        }
        if let Some(event) = self.emits {
            def = def.emits(event);
        }
        def
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDoc {
    pub name: String,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    #[serde(default)]
    pub executes: Vec<String>,
    #[serde(default)]
    pub handles: Vec<TransitionDoc>,
}

impl StateDoc {
    fn into_def(self) -> StateDef {
        let mut state = StateDef::new(self.name);
        state.super_state = self.extends;
        state.is_virtual = self.is_virtual;
        state.commands = self.executes;
        state.transitions = self.handles.into_iter().map(TransitionDoc::into_def).collect();
        state
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionDoc {
    pub event: String,
    /// Properties that must equal the given values.
    #[serde(default)]
    pub when: Properties,
    /// Properties that must differ from the given values.
    #[serde(default)]
    pub when_not: Properties,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub produce: Vec<String>,
    #[serde(default)]
    pub assign: Properties,
}

impl TransitionDoc {
    fn into_def(self) -> Transition {
        let equals = self
            .when
            .into_iter()
            .map(|(property, value)| Condition::Equals { property, value });
        let not_equals = self
            .when_not
            .into_iter()
            .map(|(property, value)| Condition::NotEquals { property, value });

        Transition {
            event: self.event,
            guard: Guard::from_conditions(equals.chain(not_equals).collect()),
            target: self.to,
            produce: self.produce,
            assign: self.assign,
        }
    }
}
