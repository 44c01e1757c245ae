//! In-memory store implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    AggregateInstance, Commit, InstanceStore, ProcessInstance, ProcessStore, Result, StorageError,
};
use crate::types::{Event, InstanceId};

/// Key type for both stores: (aggregate type or process, instance id).
type Key = (String, InstanceId);

struct StoredInstance {
    snapshot: AggregateInstance,
    events: Vec<Event>,
    /// Highest sequence confirmed published.
    published: u64,
}

impl StoredInstance {
    fn unpublished(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |e| e.sequence > self.published)
    }
}

/// Instance store that keeps snapshots and event streams in memory.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<Key, StoredInstance>>,
    fail_on_append: RwLock<bool>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_append(&self, fail: bool) {
        *self.fail_on_append.write().await = fail;
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn load(&self, aggregate_type: &str, id: &InstanceId) -> Result<Option<AggregateInstance>> {
        let instances = self.instances.read().await;
        Ok(instances
            .get(&(aggregate_type.to_string(), id.clone()))
            .map(|stored| stored.snapshot.clone()))
    }

    async fn append(&self, commit: Commit) -> Result<u64> {
        if *self.fail_on_append.read().await {
            return Err(StorageError::Backend("append disabled".to_string()));
        }
        commit.validate()?;

        let key = (commit.aggregate_type.clone(), commit.instance_id.clone());
        let mut instances = self.instances.write().await;

        let actual = instances.get(&key).map_or(0, |s| s.snapshot.version);
        if actual != commit.expected_version {
            return Err(StorageError::ConcurrentModification {
                expected: commit.expected_version,
                actual,
            });
        }

        let version = commit.new_version();
        let snapshot = AggregateInstance {
            aggregate_type: commit.aggregate_type,
            id: commit.instance_id,
            state: commit.state,
            version,
            properties: commit.properties,
        };
        let stored = instances.entry(key).or_insert_with(|| StoredInstance {
            snapshot: snapshot.clone(),
            events: Vec::new(),
            published: 0,
        });
        stored.snapshot = snapshot;
        stored.events.extend(commit.events);
        Ok(version)
    }

    async fn events(&self, aggregate_type: &str, id: &InstanceId, after: u64) -> Result<Vec<Event>> {
        let instances = self.instances.read().await;
        Ok(instances
            .get(&(aggregate_type.to_string(), id.clone()))
            .map(|stored| {
                stored
                    .events
                    .iter()
                    .filter(|e| e.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list(&self, aggregate_type: &str) -> Result<Vec<AggregateInstance>> {
        let instances = self.instances.read().await;
        let mut found: Vec<_> = instances
            .iter()
            .filter(|((t, _), _)| t == aggregate_type)
            .map(|(_, stored)| stored.snapshot.clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn count(&self, aggregate_type: &str) -> Result<usize> {
        let instances = self.instances.read().await;
        Ok(instances.keys().filter(|(t, _)| t == aggregate_type).count())
    }

    async fn exists(&self, aggregate_type: &str, id: &InstanceId) -> Result<bool> {
        let instances = self.instances.read().await;
        Ok(instances.contains_key(&(aggregate_type.to_string(), id.clone())))
    }

    async fn unpublished(&self, aggregate_type: &str, id: &InstanceId) -> Result<Vec<Event>> {
        let instances = self.instances.read().await;
        Ok(instances
            .get(&(aggregate_type.to_string(), id.clone()))
            .map(|stored| stored.unpublished().cloned().collect())
            .unwrap_or_default())
    }

    async fn unpublished_ids(&self, aggregate_type: &str) -> Result<Vec<InstanceId>> {
        let instances = self.instances.read().await;
        let mut ids: Vec<_> = instances
            .iter()
            .filter(|((t, _), stored)| t == aggregate_type && stored.unpublished().next().is_some())
            .map(|((_, id), _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn mark_published(&self, aggregate_type: &str, id: &InstanceId, sequence: u64) -> Result<()> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(&(aggregate_type.to_string(), id.clone()))
            .ok_or_else(|| StorageError::Backend(format!("unknown instance {aggregate_type}/{id}")))?;
        stored.published = stored.published.max(sequence);
        Ok(())
    }
}

/// Process store that keeps saga records in memory.
#[derive(Default)]
pub struct MemoryProcessStore {
    instances: RwLock<HashMap<Key, ProcessInstance>>,
}

impl MemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for MemoryProcessStore {
    async fn load(&self, process: &str, correlation_id: &InstanceId) -> Result<Option<ProcessInstance>> {
        let instances = self.instances.read().await;
        Ok(instances
            .get(&(process.to_string(), correlation_id.clone()))
            .cloned())
    }

    async fn save(&self, instance: &ProcessInstance, expected_version: u64) -> Result<u64> {
        let key = (instance.process.clone(), instance.correlation_id.clone());
        let mut instances = self.instances.write().await;

        let actual = instances.get(&key).map_or(0, |i| i.version);
        if actual != expected_version {
            return Err(StorageError::ConcurrentModification {
                expected: expected_version,
                actual,
            });
        }

        let version = expected_version + 1;
        let mut stored = instance.clone();
        stored.version = version;
        instances.insert(key, stored);
        Ok(version)
    }

    async fn list(&self, process: &str) -> Result<Vec<ProcessInstance>> {
        let instances = self.instances.read().await;
        let mut found: Vec<_> = instances
            .iter()
            .filter(|((p, _), _)| p == process)
            .map(|(_, instance)| instance.clone())
            .collect();
        found.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));
        Ok(found)
    }
}
