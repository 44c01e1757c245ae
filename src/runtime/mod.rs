//! In-process runtime: wires models, handlers, stores, the event feed and
//! process managers together.
//!
//! ```ignore
//! let mut runtime = RuntimeBuilder::from_config(Config::load(None)?).build().await?;
//! runtime.start().await?;
//! runtime.intake().submit("Account", id, "create", payload).await?;
//! runtime.shutdown().await;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::domains;
use crate::feed::{spawn_consumer, EventFeed, EventHandler, FeedError, MemoryFeed};
use crate::handler::{AggregateHandler, CommandHook, HookRegistry};
use crate::intake::CommandIntake;
use crate::model::{ModelError, ModelRegistry};
use crate::process::{ProcessManager, ProcessManagerHandler};
use crate::storage::{InstanceStore, MemoryInstanceStore, MemoryProcessStore, ProcessStore};

/// Poll interval while waiting for consumers to catch up.
const SETTLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Consumer already attached: {0}")]
    DuplicateConsumer(String),
}

/// Builder for an in-process runtime.
pub struct RuntimeBuilder {
    config: Config,
    registry: ModelRegistry,
    hooks: HookRegistry,
    instance_store: Option<Arc<dyn InstanceStore>>,
    process_store: Option<Arc<dyn ProcessStore>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Defaults: in-memory stores, built-in models.
    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            registry: ModelRegistry::new(),
            hooks: HookRegistry::new(),
            instance_store: None,
            process_store: None,
        }
    }

    /// Models registered in code, in addition to configured ones.
    pub fn registry_mut(&mut self) -> &mut ModelRegistry {
        &mut self.registry
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_hook(
        mut self,
        aggregate_type: &str,
        command: &str,
        hook: Arc<dyn CommandHook>,
    ) -> Self {
        self.hooks.register(aggregate_type, command, hook);
        self
    }

    pub fn with_instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.instance_store = Some(store);
        self
    }

    pub fn with_process_store(mut self, store: Arc<dyn ProcessStore>) -> Self {
        self.process_store = Some(store);
        self
    }

    /// Load configured models and create one handler per aggregate type and
    /// one manager per process definition.
    pub async fn build(self) -> Result<Runtime, RuntimeError> {
        let RuntimeBuilder {
            config,
            mut registry,
            mut hooks,
            instance_store,
            process_store,
        } = self;

        if config.models.builtin {
            domains::register_builtin(&mut registry, &mut hooks)?;
        }
        registry.load_paths(&config.models.paths)?;

        let instance_store: Arc<dyn InstanceStore> =
            instance_store.unwrap_or_else(|| Arc::new(MemoryInstanceStore::new()));
        let process_store: Arc<dyn ProcessStore> =
            process_store.unwrap_or_else(|| Arc::new(MemoryProcessStore::new()));
        let feed = MemoryFeed::new();

        let mut intake = CommandIntake::new();
        for model in registry.aggregates() {
            let handler = AggregateHandler::new(
                model.clone(),
                instance_store.clone(),
                Arc::new(feed.clone()),
                hooks.clone(),
            )?
            .with_max_produce_depth(config.handler.max_produce_depth);
            intake.register(Arc::new(handler));
        }
        let intake = Arc::new(intake);

        let managers: HashMap<String, Arc<ProcessManager>> = registry
            .processes()
            .map(|definition| {
                let manager =
                    ProcessManager::new(definition.clone(), process_store.clone(), intake.clone());
                (definition.name().to_string(), Arc::new(manager))
            })
            .collect();

        info!(
            aggregates = intake.aggregate_types().len(),
            processes = managers.len(),
            "Runtime built"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Runtime {
            config,
            registry: Arc::new(registry),
            intake,
            managers,
            feed,
            shutdown_tx,
            consumers: Vec::new(),
            recovery: None,
            started: false,
        })
    }
}

struct Consumer {
    name: String,
    filter: String,
    task: JoinHandle<()>,
}

pub struct Runtime {
    config: Config,
    registry: Arc<ModelRegistry>,
    intake: Arc<CommandIntake>,
    managers: HashMap<String, Arc<ProcessManager>>,
    feed: MemoryFeed,
    shutdown_tx: watch::Sender<bool>,
    consumers: Vec<Consumer>,
    recovery: Option<JoinHandle<()>>,
    started: bool,
}

impl Runtime {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn intake(&self) -> Arc<CommandIntake> {
        self.intake.clone()
    }

    pub fn process_manager(&self, name: &str) -> Option<Arc<ProcessManager>> {
        self.managers.get(name).cloned()
    }

    pub fn feed(&self) -> &MemoryFeed {
        &self.feed
    }

    /// Publish events left behind by failed publications.
    pub async fn recover(&self) -> usize {
        self.intake.republish_pending().await
    }

    /// Start one feed consumer per process manager and the publication
    /// recovery sweep. Calling again is a no-op.
    pub async fn start(&mut self) -> Result<(), RuntimeError> {
        if self.started {
            warn!("Runtime already started");
            return Ok(());
        }

        let recovered = self.recover().await;
        if recovered > 0 {
            info!(events = recovered, "Published events left from an earlier run");
        }
        self.recovery = Some(spawn_recovery_task(
            self.intake.clone(),
            Duration::from_millis(self.config.feed.recovery_interval_ms),
            self.shutdown_tx.subscribe(),
        ));

        let mut managers: Vec<_> = self.managers.values().cloned().collect();
        managers.sort_by(|a, b| a.definition().name().cmp(b.definition().name()));
        for manager in managers {
            let name = format!("pm.{}", manager.definition().name());
            let source = manager.definition().source().to_string();
            self.attach(name, &source, Arc::new(ProcessManagerHandler::new(manager)))
                .await?;
        }

        self.started = true;
        info!(consumers = self.consumers.len(), "Runtime started");
        Ok(())
    }

    /// Subscribe `handler` to the feed under consumer `name`.
    pub async fn attach(
        &mut self,
        name: impl Into<String>,
        aggregate_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.consumers.iter().any(|c| c.name == name) {
            return Err(RuntimeError::DuplicateConsumer(name));
        }

        let subscription = self.feed.subscribe(&name, aggregate_type).await?;
        let task = spawn_consumer(
            name.clone(),
            subscription,
            handler,
            &self.config.feed.redelivery,
            self.shutdown_tx.subscribe(),
        );
        self.consumers.push(Consumer {
            name,
            filter: aggregate_type.to_string(),
            task,
        });
        Ok(())
    }

    /// Wait until every recorded event is published and every consumer has
    /// acknowledged it. Returns false if that did not happen within `timeout`.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let mut pending = match self.intake.unpublished_count().await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(error = %e, "Failed to count unpublished events");
                        1
                    }
                };
                for consumer in &self.consumers {
                    pending += self.feed.pending(&consumer.name, &consumer.filter).await;
                }
                if pending == 0 {
                    return;
                }
                tokio::time::sleep(SETTLE_POLL).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Stop all consumers and close the feed.
    pub async fn shutdown(self) {
        info!("Shutting down runtime");
        self.shutdown_tx.send_replace(true);
        if let Some(recovery) = self.recovery {
            if let Err(e) = recovery.await {
                warn!(error = %e, "Recovery task failed");
            }
        }
        for consumer in self.consumers {
            if let Err(e) = consumer.task.await {
                warn!(consumer = %consumer.name, error = %e, "Consumer task failed");
            }
        }
        self.feed.close();
    }
}

/// Periodically republish events whose publication failed, until shutdown.
fn spawn_recovery_task(
    intake: Arc<CommandIntake>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Publication recovery started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    intake.republish_pending().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Publication recovery stopped");
                        break;
                    }
                }
            }
        }
    })
}
