//! Account lifecycle integration tests.
//!
//! Drives the in-process runtime end to end: commands through the intake,
//! events through the feed, the confirmation saga back into the aggregate.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Barrier;

use estate::config::{Config, ModelsConfig};
use estate::domains::account::{hash_password, ACCOUNT, ACCOUNT_CONFIRMATION};
use estate::handler::HandlerError;
use estate::runtime::{Runtime, RuntimeBuilder};
use estate::storage::{InstanceStore, MemoryInstanceStore, MemoryProcessStore, ProcessStore};
use estate::types::{CommandRequest, InstanceId, Properties};
use estate::utils::retry::RetryConfig;

// ============================================================================
// Test Fixtures
// ============================================================================

const SETTLE: Duration = Duration::from_secs(5);

struct Harness {
    runtime: Runtime,
    instances: Arc<MemoryInstanceStore>,
    processes: Arc<MemoryProcessStore>,
}

async fn start_runtime() -> Harness {
    let instances = Arc::new(MemoryInstanceStore::new());
    let processes = Arc::new(MemoryProcessStore::new());
    let config = Config {
        models: ModelsConfig {
            paths: Vec::new(),
            builtin: true,
        },
        ..Config::for_test()
    };

    let mut runtime = RuntimeBuilder::from_config(config)
        .with_instance_store(instances.clone())
        .with_process_store(processes.clone())
        .build()
        .await
        .unwrap();
    runtime.start().await.unwrap();

    Harness {
        runtime,
        instances,
        processes,
    }
}

fn payload(value: Value) -> Properties {
    value.as_object().cloned().unwrap_or_default()
}

fn request(id: &InstanceId, command: &str, body: Value) -> CommandRequest {
    CommandRequest::new(ACCOUNT, id.clone(), command, payload(body))
}

impl Harness {
    async fn submit(&self, id: &InstanceId, command: &str, body: Value) -> Result<Vec<String>, HandlerError> {
        let events = self
            .runtime
            .intake()
            .submit_request(request(id, command, body))
            .await?;
        Ok(events.into_iter().map(|e| e.name).collect())
    }

    async fn state(&self, id: &InstanceId) -> (String, u64) {
        let instance = self.instances.load(ACCOUNT, id).await.unwrap().unwrap();
        (instance.state, instance.version)
    }

    async fn settle(&self) {
        assert!(self.runtime.settle(SETTLE).await, "consumers did not settle");
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_create_then_disable() {
    let h = start_runtime().await;
    let id = InstanceId::generate();

    let created = h
        .submit(&id, "create", json!({"username": "ada", "password": "secret"}))
        .await
        .unwrap();
    assert_eq!(created, vec!["Created"]);
    assert_eq!(h.state(&id).await, ("Enabled".to_string(), 1));

    let disabled = h.submit(&id, "disable", json!({})).await.unwrap();
    assert_eq!(disabled, vec!["Disabled"]);
    assert_eq!(h.state(&id).await, ("Disabled".to_string(), 2));

    h.settle().await;

    // The saga asked the account to send the disabled confirmation.
    let events = h.instances.events(ACCOUNT, &id, 0).await.unwrap();
    let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["Created", "Disabled", "SentDisabledConfirmation"]);
    assert_eq!(events[2].correlation_id.as_deref(), Some(id.as_str()));
    assert_eq!(h.state(&id).await, ("Disabled".to_string(), 3));

    let saga = h
        .processes
        .load(ACCOUNT_CONFIRMATION, &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saga.state, "Disabled");
    assert_eq!(saga.last_sequence, 3);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_password_never_stored_in_clear() {
    let h = start_runtime().await;
    let id = InstanceId::generate();

    h.submit(&id, "create", json!({"username": "ada", "password": "secret"}))
        .await
        .unwrap();

    let events = h.instances.events(ACCOUNT, &id, 0).await.unwrap();
    assert_eq!(events[0].payload["password"], json!(hash_password("secret")));

    let logged = h
        .submit(&id, "login", json!({"username": "ada", "password": "secret"}))
        .await
        .unwrap();
    assert_eq!(logged, vec!["Logged"]);

    let rejected = h.submit(&id, "login", json!({"password": "nope"})).await;
    assert!(matches!(rejected, Err(HandlerError::GuardEvaluation { .. })));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_delete_is_final_from_either_state() {
    let h = start_runtime().await;

    for disabled in [false, true] {
        let id = InstanceId::generate();
        h.submit(&id, "create", json!({"disabled": disabled}))
            .await
            .unwrap();
        h.submit(&id, "delete", json!({})).await.unwrap();
        assert_eq!(h.state(&id).await.0, "Deleted");

        for command in ["update", "enable", "disable", "login", "delete"] {
            let result = h.submit(&id, command, json!({})).await;
            assert!(
                matches!(result, Err(HandlerError::CommandNotAllowedInState { .. })),
                "{command} after delete: {result:?}"
            );
        }
        let recreate = h.submit(&id, "create", json!({})).await;
        assert!(matches!(recreate, Err(HandlerError::DuplicateCreate { .. })));
    }

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_toggling_confirms_each_change() {
    let h = start_runtime().await;
    let id = InstanceId::generate();

    h.submit(&id, "create", json!({"disabled": true})).await.unwrap();
    for command in ["enable", "disable", "enable"] {
        h.submit(&id, command, json!({})).await.unwrap();
        h.settle().await;
    }

    let events = h.instances.events(ACCOUNT, &id, 0).await.unwrap();
    let confirmations: Vec<_> = events
        .iter()
        .filter(|e| e.name.starts_with("Sent"))
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(
        confirmations,
        vec![
            "SentEnabledConfirmation",
            "SentDisabledConfirmation",
            "SentEnabledConfirmation",
        ]
    );
    assert_eq!(h.state(&id).await, ("Enabled".to_string(), 7));

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn test_update_keeps_state_and_merges() {
    let h = start_runtime().await;
    let id = InstanceId::generate();

    h.submit(&id, "create", json!({"username": "ada", "email": "a@x"}))
        .await
        .unwrap();
    h.submit(&id, "update", json!({"email": "b@x"})).await.unwrap();

    let instance = h.instances.load(ACCOUNT, &id).await.unwrap().unwrap();
    assert_eq!(instance.state, "Enabled");
    assert_eq!(instance.properties["username"], json!("ada"));
    assert_eq!(instance.properties["email"], json!("b@x"));

    h.runtime.shutdown().await;
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pinned_concurrent_writers() {
    let h = start_runtime().await;
    let id = InstanceId::generate();
    h.submit(&id, "create", json!({})).await.unwrap();

    let intake = h.runtime.intake();
    let barrier = Arc::new(Barrier::new(2));
    let mut tasks = Vec::new();
    for command in ["disable", "update"] {
        let intake = intake.clone();
        let barrier = barrier.clone();
        let req = request(&id, command, json!({})).with_expected_version(1);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            intake.submit_request(req).await
        }));
    }

    let mut succeeded = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e @ HandlerError::ConcurrentModification { .. }) => {
                assert!(e.is_retryable());
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((succeeded, conflicts), (1, 1));

    h.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unpinned_writers_all_apply() {
    let h = start_runtime().await;
    let id = InstanceId::generate();
    h.submit(&id, "create", json!({})).await.unwrap();

    let intake = h.runtime.intake();
    let mut tasks = Vec::new();
    for n in 0..8 {
        let intake = intake.clone();
        let req = request(&id, "update", json!({"name": format!("n{n}")}));
        tasks.push(tokio::spawn(async move {
            intake.submit_with_retry(req, &RetryConfig::for_test()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Per-instance serialisation keeps the version equal to the event count.
    let (_, version) = h.state(&id).await;
    let events = h.instances.events(ACCOUNT, &id, 0).await.unwrap();
    assert_eq!(version, 9);
    assert_eq!(events.len() as u64, version);
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=9).collect::<Vec<_>>());

    h.runtime.shutdown().await;
}
