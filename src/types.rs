//! Core value types shared by every layer: instance identities, command
//! requests and recorded events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Property values of an aggregate instance, and payloads of commands/events.
pub type Properties = serde_json::Map<String, Value>;

/// Opaque identity of an aggregate instance.
///
/// Process managers use the same identity as their correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identity for a new instance.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for InstanceId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// A request to run a command against one aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub aggregate_type: String,
    pub instance_id: InstanceId,
    pub command: String,
    #[serde(default)]
    pub payload: Properties,
    /// When set, the command is only accepted if the instance is still at this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommandRequest {
    pub fn new(
        aggregate_type: impl Into<String>,
        instance_id: InstanceId,
        command: impl Into<String>,
        payload: Properties,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            instance_id,
            command: command.into(),
            payload,
            expected_version: None,
            correlation_id: None,
        }
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// An immutable fact: a command was applied to an aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub aggregate_type: String,
    pub instance_id: InstanceId,
    pub name: String,
    /// Command whose execution produced this event.
    pub command: String,
    /// Position within the instance stream, starting at 1. Equals the
    /// instance version right after this event was applied.
    pub sequence: u64,
    pub payload: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Overlay `changes` onto `target`, replacing existing keys.
pub fn merge_properties(target: &mut Properties, changes: &Properties) {
    for (key, value) in changes {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let id = InstanceId::from(uuid);
        assert_eq!(id.as_str(), uuid.to_string());
    }

    #[test]
    fn test_instance_id_serializes_transparently() {
        let id = InstanceId::new("acc-1");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("acc-1"));
    }

    #[test]
    fn test_command_request_deserializes_without_optional_fields() {
        let request: CommandRequest = serde_json::from_value(json!({
            "aggregate_type": "Account",
            "instance_id": "acc-1",
            "command": "disable"
        }))
        .unwrap();

        assert_eq!(request.instance_id, InstanceId::new("acc-1"));
        assert!(request.payload.is_empty());
        assert!(request.expected_version.is_none());
    }

    #[test]
    fn test_merge_properties_overwrites() {
        let mut target = Properties::new();
        target.insert("disabled".into(), json!(false));
        target.insert("email".into(), json!("a@x"));

        let mut changes = Properties::new();
        changes.insert("disabled".into(), json!(true));

        merge_properties(&mut target, &changes);
        assert_eq!(target["disabled"], json!(true));
        assert_eq!(target["email"], json!("a@x"));
    }
}
