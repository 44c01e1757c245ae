//! Per-instance serialisation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::InstanceId;

/// Prune idle entries once the table grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per instance id; different ids never contend.
#[derive(Default)]
pub(crate) struct InstanceLocks {
    locks: Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub(crate) async fn acquire(&self, id: &InstanceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
