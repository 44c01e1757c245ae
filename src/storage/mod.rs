//! Persistence ports for aggregate instances and process instances.
//!
//! Implementations:
//! - `MemoryInstanceStore` / `MemoryProcessStore`: in-memory stores
//!
//! Durable backends live outside this crate and plug in through the traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Event, InstanceId, Properties};

pub mod memory;

pub use memory::{MemoryInstanceStore, MemoryProcessStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Version conflict: expected {expected}, actual {actual}")]
    ConcurrentModification { expected: u64, actual: u64 },

    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Materialised aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateInstance {
    pub aggregate_type: String,
    pub id: InstanceId,
    pub state: String,
    /// Number of applied events.
    pub version: u64,
    pub properties: Properties,
}

/// Everything one unit of work writes: the resulting instance snapshot and
/// the events that led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub aggregate_type: String,
    pub instance_id: InstanceId,
    /// Version the instance had when the unit of work loaded it.
    pub expected_version: u64,
    pub state: String,
    pub properties: Properties,
    /// Sequences run contiguously from `expected_version + 1`.
    pub events: Vec<Event>,
}

impl Commit {
    pub fn new_version(&self) -> u64 {
        self.expected_version + self.events.len() as u64
    }

    /// Check the event sequences line up with the expected version.
    pub fn validate(&self) -> Result<()> {
        if self.events.is_empty() {
            return Err(StorageError::InvalidCommit("commit has no events".to_string()));
        }
        for (offset, event) in self.events.iter().enumerate() {
            let expected = self.expected_version + offset as u64 + 1;
            if event.sequence != expected {
                return Err(StorageError::InvalidCommit(format!(
                    "event {} has sequence {}, expected {}",
                    event.name, event.sequence, expected
                )));
            }
        }
        Ok(())
    }
}

/// Aggregate instance persistence with optimistic concurrency.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Current snapshot of an instance, if it was ever created.
    async fn load(&self, aggregate_type: &str, id: &InstanceId) -> Result<Option<AggregateInstance>>;

    /// Atomically append the commit's events and replace the snapshot.
    ///
    /// Fails with `ConcurrentModification` when the stored version differs
    /// from `commit.expected_version`. Returns the new version.
    async fn append(&self, commit: Commit) -> Result<u64>;

    /// Recorded events of an instance with sequence greater than `after`.
    async fn events(&self, aggregate_type: &str, id: &InstanceId, after: u64) -> Result<Vec<Event>>;

    /// All instances of an aggregate type, ordered by id.
    async fn list(&self, aggregate_type: &str) -> Result<Vec<AggregateInstance>>;

    async fn count(&self, aggregate_type: &str) -> Result<usize> {
        Ok(self.list(aggregate_type).await?.len())
    }

    async fn exists(&self, aggregate_type: &str, id: &InstanceId) -> Result<bool> {
        Ok(self.load(aggregate_type, id).await?.is_some())
    }

    // Publication outbox: the store remembers, per instance, the highest
    // sequence known to have reached the event feed.

    /// Events of an instance recorded after its publication mark, in order.
    async fn unpublished(&self, aggregate_type: &str, id: &InstanceId) -> Result<Vec<Event>>;

    /// Instances with events recorded after their publication mark, ordered by id.
    async fn unpublished_ids(&self, aggregate_type: &str) -> Result<Vec<InstanceId>>;

    /// Move the publication mark of an instance forward to `sequence`.
    async fn mark_published(&self, aggregate_type: &str, id: &InstanceId, sequence: u64) -> Result<()>;
}

/// A command a process manager emitted that could not be dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchFailure {
    pub command: String,
    /// Sequence of the event that triggered the command.
    pub trigger_sequence: u64,
    pub reason: String,
    pub retryable: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted saga state, keyed by (process, correlation id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub process: String,
    pub correlation_id: InstanceId,
    pub state: String,
    pub flags: Properties,
    /// Highest event sequence already processed.
    pub last_sequence: u64,
    /// Record version for optimistic concurrency; 0 before the first save.
    pub version: u64,
    #[serde(default)]
    pub failures: Vec<DispatchFailure>,
}

impl ProcessInstance {
    pub fn new(
        process: impl Into<String>,
        correlation_id: InstanceId,
        state: impl Into<String>,
        flags: Properties,
    ) -> Self {
        Self {
            process: process.into(),
            correlation_id,
            state: state.into(),
            flags,
            last_sequence: 0,
            version: 0,
            failures: Vec::new(),
        }
    }
}

/// Process instance persistence.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn load(&self, process: &str, correlation_id: &InstanceId) -> Result<Option<ProcessInstance>>;

    /// Save if the stored record is still at `expected_version` (0 = absent).
    /// Returns the new record version.
    async fn save(&self, instance: &ProcessInstance, expected_version: u64) -> Result<u64>;

    /// All instances of a process.
    async fn list(&self, process: &str) -> Result<Vec<ProcessInstance>>;
}
