//! Account aggregate and the `AccountConfirmation` process.
//!
//! States: `Initial` → `Enabled`/`Disabled` (both under the virtual `Exist`)
//! → `Deleted`. The confirmation process follows enable/disable events and
//! asks the account to send the matching confirmation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::handler::{CommandHook, HookContext, HookError, HookOutcome, HookRegistry};
use crate::model::{
    AggregateType, CommandDef, Effect, Guard, ModelError, ModelRegistry, ProcessDefinition,
    PropertyDef, StateDef, Transition,
};
use crate::types::Properties;

pub const ACCOUNT: &str = "Account";
pub const ACCOUNT_CONFIRMATION: &str = "AccountConfirmation";

pub const CREATE: &str = "create";
pub const UPDATE: &str = "update";
pub const DELETE: &str = "delete";
pub const ENABLE: &str = "enable";
pub const DISABLE: &str = "disable";
pub const LOGIN: &str = "login";
pub const SEND_ENABLED_CONFIRMATION: &str = "sendEnabledConfirmation";
pub const SEND_DISABLED_CONFIRMATION: &str = "sendDisabledConfirmation";

const DISABLED: &str = "disabled";
const PASSWORD: &str = "password";

fn literal(property: &str, value: bool) -> Properties {
    let mut values = Properties::new();
    values.insert(property.to_string(), Value::Bool(value));
    values
}

pub fn aggregate_type() -> Result<AggregateType, ModelError> {
    AggregateType::builder(ACCOUNT)
        .property(PropertyDef::new("name", "PersonName"))
        .property(PropertyDef::new("username", "string").unique())
        .property(PropertyDef::new(PASSWORD, "string").hidden())
        .property(PropertyDef::new("email", "string").unique())
        .property(PropertyDef::new("roles", "list<string>"))
        .property(PropertyDef::new(DISABLED, "boolean").meta().with_default(false))
        .command(
            CommandDef::create(CREATE).params(["name", "username", PASSWORD, "email", "roles", DISABLED]),
        )
        .command(CommandDef::update(UPDATE))
        .command(CommandDef::delete(DELETE))
        .command(CommandDef::assign(ENABLE, literal(DISABLED, false)))
        .command(CommandDef::assign(DISABLE, literal(DISABLED, true)))
        .command(
            CommandDef::custom(LOGIN)
                .params(["username", "email", PASSWORD])
                .with_effect(Effect::Compute)
                .emits("Logged"),
        )
        .command(CommandDef::custom(SEND_ENABLED_CONFIRMATION).emits("SentEnabledConfirmation"))
        .command(CommandDef::custom(SEND_DISABLED_CONFIRMATION).emits("SentDisabledConfirmation"))
        .state(
            StateDef::new("Initial")
                .executes(CREATE)
                .handles(Transition::on("Created").when(Guard::is_true(DISABLED)).to("Disabled"))
                .handles(
                    Transition::on("Created")
                        .when(Guard::not_equals(DISABLED, true))
                        .to("Enabled"),
                ),
        )
        .state(
            StateDef::new("Exist")
                .virtual_state()
                .executes(UPDATE)
                .executes(DELETE)
                .handles(Transition::on("Updated"))
                .handles(Transition::on("Deleted").to("Deleted")),
        )
        .state(
            StateDef::new("Disabled")
                .extends("Exist")
                .executes(ENABLE)
                .executes(SEND_DISABLED_CONFIRMATION)
                .handles(Transition::on("Enabled").to("Enabled"))
                .handles(Transition::on("SentDisabledConfirmation")),
        )
        .state(
            StateDef::new("Enabled")
                .extends("Exist")
                .executes(DISABLE)
                .executes(LOGIN)
                .executes(SEND_ENABLED_CONFIRMATION)
                .handles(Transition::on("Disabled").to("Disabled"))
                .handles(Transition::on("Logged"))
                .handles(Transition::on("SentEnabledConfirmation")),
        )
        .state(StateDef::new("Deleted"))
        .build()
}

/// Confirmation saga. The `sent*Confirmation` flags live on the saga.
pub fn confirmation_process(account: &AggregateType) -> Result<ProcessDefinition, ModelError> {
    ProcessDefinition::builder(ACCOUNT_CONFIRMATION)
        .flag(PropertyDef::new("sentDisabledConfirmation", "boolean").with_default(false))
        .flag(PropertyDef::new("sentEnabledConfirmation", "boolean").with_default(false))
        .state(
            StateDef::new("Initial")
                .handles(Transition::on("Created").when(Guard::is_true(DISABLED)).to("Disabled"))
                .handles(
                    Transition::on("Created")
                        .when(Guard::not_equals(DISABLED, true))
                        .to("Enabled"),
                ),
        )
        .state(
            StateDef::new("Disabled")
                .executes(SEND_DISABLED_CONFIRMATION)
                .handles(
                    Transition::on("Enabled")
                        .to("Enabled")
                        .produce(SEND_ENABLED_CONFIRMATION)
                        .assign("sentEnabledConfirmation", true),
                ),
        )
        .state(
            StateDef::new("Enabled")
                .executes(SEND_ENABLED_CONFIRMATION)
                .handles(
                    Transition::on("Disabled")
                        .to("Disabled")
                        .produce(SEND_DISABLED_CONFIRMATION)
                        .assign("sentDisabledConfirmation", true),
                ),
        )
        .build(account)
}

pub fn hooks() -> HookRegistry {
    let preparer: Arc<dyn CommandHook> = Arc::new(PasswordPreparer);
    HookRegistry::new()
        .with(ACCOUNT, CREATE, preparer.clone())
        .with(ACCOUNT, UPDATE, preparer)
        .with(ACCOUNT, LOGIN, Arc::new(LoginHook))
}

/// Register the account model, its process and hooks.
pub fn register(registry: &mut ModelRegistry, hooks: &mut HookRegistry) -> Result<(), ModelError> {
    let account = registry.register_aggregate(aggregate_type()?)?;
    registry.register_process(confirmation_process(&account)?)?;
    hooks.extend(self::hooks());
    Ok(())
}

/// Hex-encoded SHA-256 of a password.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Replaces a non-empty `password` in the payload with its hash.
pub struct PasswordPreparer;

#[async_trait]
impl CommandHook for PasswordPreparer {
    async fn execute(
        &self,
        _ctx: HookContext<'_>,
        mut payload: Properties,
    ) -> Result<HookOutcome, HookError> {
        let password = match payload.remove(PASSWORD) {
            None | Some(Value::Null) => None,
            Some(Value::String(password)) => Some(password),
            Some(_) => return Err(HookError::Rejected("password must be a string".to_string())),
        };
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            payload.insert(PASSWORD.to_string(), Value::String(hash_password(&password)));
        }
        Ok(HookOutcome::prepared(payload))
    }
}

/// Verifies credentials against the stored hash. The recorded event carries
/// the identifying fields only.
pub struct LoginHook;

#[async_trait]
impl CommandHook for LoginHook {
    async fn execute(
        &self,
        ctx: HookContext<'_>,
        mut payload: Properties,
    ) -> Result<HookOutcome, HookError> {
        let invalid = || HookError::Rejected("invalid credentials".to_string());

        let supplied = payload
            .get(PASSWORD)
            .and_then(Value::as_str)
            .ok_or_else(|| HookError::Rejected("password required".to_string()))?;
        let stored = ctx
            .properties
            .get(PASSWORD)
            .and_then(Value::as_str)
            .ok_or_else(invalid)?;

        for field in ["username", "email"] {
            if let Some(given) = payload.get(field).and_then(Value::as_str) {
                if ctx.properties.get(field).and_then(Value::as_str) != Some(given) {
                    return Err(invalid());
                }
            }
        }
        if hash_password(supplied) != stored {
            return Err(invalid());
        }

        payload.remove(PASSWORD);
        Ok(HookOutcome::prepared(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::test_utils::props;
    use crate::types::InstanceId;

    #[test]
    fn test_models_build() {
        let account = aggregate_type().unwrap();
        let process = confirmation_process(&account).unwrap();

        assert_eq!(account.event_of(LOGIN).unwrap().name, "Logged");
        assert_eq!(account.event_of(ENABLE).unwrap().name, "Enabled");
        assert!(account.graph().is_terminal("Deleted"));
        assert_eq!(process.source(), ACCOUNT);
        assert_eq!(process.initial_flags()["sentEnabledConfirmation"], json!(false));
    }

    #[test]
    fn test_yaml_model_matches_code() {
        let mut registry = ModelRegistry::new();
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("models/account.yaml");
        registry.load_file(&path).unwrap();

        let account = aggregate_type().unwrap();
        assert_eq!(*registry.aggregate(ACCOUNT).unwrap(), account);
        assert_eq!(
            *registry.process(ACCOUNT_CONFIRMATION).unwrap(),
            confirmation_process(&account).unwrap()
        );
    }

    #[test]
    fn test_hash_password() {
        let hash = hash_password("secret");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_password("secret"));
        assert_ne!(hash, hash_password("Secret"));
    }

    fn ctx<'a>(id: &'a InstanceId, properties: &'a Properties) -> HookContext<'a> {
        HookContext {
            aggregate_type: ACCOUNT,
            instance_id: id,
            command: LOGIN,
            state: "Enabled",
            properties,
        }
    }

    #[tokio::test]
    async fn test_preparer_hashes_password() {
        let id = InstanceId::new("acc-1");
        let properties = Properties::new();
        let outcome = PasswordPreparer
            .execute(ctx(&id, &properties), props(json!({"password": "secret"})))
            .await
            .unwrap();

        assert_eq!(outcome.payload["password"], json!(hash_password("secret")));
        assert!(outcome.changes.is_empty());
    }

    #[tokio::test]
    async fn test_preparer_drops_empty_password() {
        let id = InstanceId::new("acc-1");
        let properties = Properties::new();
        let outcome = PasswordPreparer
            .execute(ctx(&id, &properties), props(json!({"password": "", "email": "a@x"})))
            .await
            .unwrap();

        assert!(!outcome.payload.contains_key("password"));
        assert_eq!(outcome.payload["email"], json!("a@x"));
    }

    #[tokio::test]
    async fn test_preparer_rejects_non_string_password() {
        let id = InstanceId::new("acc-1");
        let properties = Properties::new();
        let result = PasswordPreparer
            .execute(ctx(&id, &properties), props(json!({"password": 42})))
            .await;
        assert!(matches!(result, Err(HookError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_login_verifies_credentials() {
        let id = InstanceId::new("acc-1");
        let properties = props(json!({
            "username": "ada",
            "password": hash_password("secret"),
        }));

        let outcome = LoginHook
            .execute(
                ctx(&id, &properties),
                props(json!({"username": "ada", "password": "secret"})),
            )
            .await
            .unwrap();
        assert_eq!(outcome.payload, props(json!({"username": "ada"})));

        let wrong_password = LoginHook
            .execute(
                ctx(&id, &properties),
                props(json!({"username": "ada", "password": "guess"})),
            )
            .await;
        assert!(matches!(wrong_password, Err(HookError::Rejected(_))));

        let wrong_user = LoginHook
            .execute(
                ctx(&id, &properties),
                props(json!({"username": "bob", "password": "secret"})),
            )
            .await;
        assert!(matches!(wrong_user, Err(HookError::Rejected(_))));

        let missing = LoginHook
            .execute(ctx(&id, &properties), props(json!({"username": "ada"})))
            .await;
        assert!(matches!(missing, Err(HookError::Rejected(_))));
    }
}
