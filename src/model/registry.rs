//! Process-wide lookup of validated models.
//!
//! Populated once at startup, then shared read-only. Only models that passed
//! validation can be registered, so every handler serves a valid model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::definition::ModelDocument;
use super::{AggregateType, ModelError, ProcessDefinition, Result};

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    aggregates: HashMap<String, Arc<AggregateType>>,
    processes: HashMap<String, Arc<ProcessDefinition>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_aggregate(&mut self, aggregate: AggregateType) -> Result<Arc<AggregateType>> {
        if self.aggregates.contains_key(aggregate.name()) {
            return Err(ModelError::Duplicate {
                kind: "aggregate type",
                name: aggregate.name().to_string(),
            });
        }
        let aggregate = Arc::new(aggregate);
        info!(
            aggregate_type = %aggregate.name(),
            states = aggregate.graph().states().count(),
            "Registered aggregate type"
        );
        self.aggregates
            .insert(aggregate.name().to_string(), aggregate.clone());
        Ok(aggregate)
    }

    /// Register a process definition. Its source aggregate type must already be registered.
    pub fn register_process(&mut self, process: ProcessDefinition) -> Result<Arc<ProcessDefinition>> {
        if !self.aggregates.contains_key(process.source()) {
            return Err(ModelError::UnknownAggregateType(process.source().to_string()));
        }
        if self.processes.contains_key(process.name()) {
            return Err(ModelError::Duplicate {
                kind: "process",
                name: process.name().to_string(),
            });
        }
        let process = Arc::new(process);
        info!(
            process = %process.name(),
            source = %process.source(),
            "Registered process definition"
        );
        self.processes
            .insert(process.name().to_string(), process.clone());
        Ok(process)
    }

    pub fn aggregate(&self, name: &str) -> Option<Arc<AggregateType>> {
        self.aggregates.get(name).cloned()
    }

    pub fn process(&self, name: &str) -> Option<Arc<ProcessDefinition>> {
        self.processes.get(name).cloned()
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &Arc<AggregateType>> {
        self.aggregates.values()
    }

    pub fn processes(&self) -> impl Iterator<Item = &Arc<ProcessDefinition>> {
        self.processes.values()
    }

    /// Register every aggregate type, then every process, of a parsed document.
    ///
    /// Processes may reference aggregates from the same document or ones
    /// registered earlier.
    pub fn load_document(&mut self, document: ModelDocument) -> Result<()> {
        for doc in document.aggregates {
            self.register_aggregate(doc.build()?)?;
        }
        for doc in document.processes {
            let source = self
                .aggregate(&doc.source)
                .ok_or_else(|| ModelError::UnknownAggregateType(doc.source.clone()))?;
            self.register_process(doc.build(&source)?)?;
        }
        Ok(())
    }

    pub fn load_str(&mut self, yaml: &str, origin: &str) -> Result<()> {
        self.load_document(ModelDocument::from_yaml(yaml, origin)?)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "Loading model document");
        self.load_str(&text, &path.display().to_string())
    }

    /// Load files, and every `.yaml`/`.yml` file (sorted) of directories.
    pub fn load_paths(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            if path.is_dir() {
                for file in model_files(path)? {
                    self.load_file(&file)?;
                }
            } else {
                self.load_file(path)?;
            }
        }
        Ok(())
    }
}

fn model_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let io_error = |source| ModelError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
