//! Playbook catalog collaborator.
//!
//! Resolves a playbook reference to a parsed, document-validated playbook.
//! Versioning and registration live outside the orchestration core; these
//! implementations cover tests and file-based deployments.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::playbook::{parse_playbook, Playbook};

#[async_trait]
pub trait PlaybookCatalog: Send + Sync {
    /// Resolve `reference` to a playbook.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown reference, `Parse`/`Validation` for a
    /// malformed document.
    async fn resolve(&self, reference: &str) -> EngineResult<Playbook>;
}

/// Catalog held in memory, keyed by reference.
#[derive(Default)]
pub struct InMemoryCatalog {
    playbooks: RwLock<HashMap<String, Playbook>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a playbook under its reference (path, else name).
    pub async fn register(&self, playbook: Playbook) -> String {
        let reference = playbook.reference().to_string();
        self.playbooks
            .write()
            .await
            .insert(reference.clone(), playbook);
        reference
    }

    /// Parse and register a YAML document.
    pub async fn register_yaml(&self, yaml: &str) -> EngineResult<String> {
        let playbook = parse_playbook(yaml)?;
        Ok(self.register(playbook).await)
    }
}

#[async_trait]
impl PlaybookCatalog for InMemoryCatalog {
    async fn resolve(&self, reference: &str) -> EngineResult<Playbook> {
        self.playbooks
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Playbook '{}' not found", reference)))
    }
}

/// Catalog reading `{root}/{reference}.yaml`.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, reference: &str) -> EngineResult<PathBuf> {
        let relative = Path::new(reference);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if reference.is_empty() || escapes {
            return Err(EngineError::Validation(format!(
                "Invalid playbook reference '{}'",
                reference
            )));
        }
        Ok(self.root.join(format!("{}.yaml", reference)))
    }
}

#[async_trait]
impl PlaybookCatalog for DirectoryCatalog {
    async fn resolve(&self, reference: &str) -> EngineResult<Playbook> {
        let path = self.path_for(reference)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(format!(
                    "Playbook '{}' not found at {}",
                    reference,
                    path.display()
                )))
            }
            Err(e) => {
                return Err(EngineError::StoreUnavailable(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        tracing::debug!(reference = %reference, path = %path.display(), "Playbook loaded");
        parse_playbook(&content)
    }
}
