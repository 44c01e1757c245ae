//! Built-in domain models.
//!
//! - `account`: user accounts with enable/disable confirmation saga

pub mod account;

use crate::handler::HookRegistry;
use crate::model::{ModelError, ModelRegistry};

/// Register every built-in model and its hooks.
pub fn register_builtin(
    registry: &mut ModelRegistry,
    hooks: &mut HookRegistry,
) -> Result<(), ModelError> {
    account::register(registry, hooks)
}
