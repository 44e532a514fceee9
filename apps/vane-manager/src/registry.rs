//! Controller registry: the authoritative store of callable controllers,
//! persisted as one JSON file. Reads take a shared lock, every mutation
//! takes the exclusive lock and rewrites the whole file (serialize first,
//! then write).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("controller id {0:?} contains periods (.), which are not allowed; use hyphens (-) or underscores (_) instead")]
    InvalidId(String),
    #[error("controller with id {0:?} not found")]
    NotFound(String),
    #[error("error reading registry file: {0}")]
    Read(#[source] std::io::Error),
    #[error("error writing registry file: {0}")]
    Write(#[source] std::io::Error),
    #[error("error parsing registry file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    pub internal: u16,
    pub external: u16,
}

impl Default for PortPair {
    fn default() -> Self {
        Self {
            internal: 8080,
            external: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub image: String,
    #[serde(default)]
    pub description: String,
    pub library_path: String,
    pub proc_name: String,
    #[serde(default)]
    pub ports: PortPair,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub validate_info: String,
}

impl ControllerDescriptor {
    /// Scalar-equality diff for discovery ingestion; timestamps are managed
    /// by the registry and excluded.
    fn needs_update(&self, other: &ControllerDescriptor) -> bool {
        self.name != other.name
            || self.version != other.version
            || self.image != other.image
            || self.description != other.description
            || self.library_path != other.library_path
            || self.proc_name != other.proc_name
            || self.ports != other.ports
            || self.is_valid != other.is_valid
            || self.validate_info != other.validate_info
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    controllers: Vec<ControllerDescriptor>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub failed_ids: Vec<String>,
}

/// Insertion order is preserved: "the first registered controller" is stable
/// across restarts because it is the first entry of the persisted file.
pub struct Registry {
    path: PathBuf,
    controllers: RwLock<Vec<ControllerDescriptor>>,
}

impl Registry {
    /// Opens the registry at `path`, creating an empty file if none exists.
    pub fn open(path: &Path) -> Result<Registry, RegistryError> {
        let registry = Registry {
            path: path.to_path_buf(),
            controllers: RwLock::new(Vec::new()),
        };
        if path.exists() {
            let data = fs::read(path).map_err(RegistryError::Read)?;
            let file: RegistryFile = serde_json::from_slice(&data)?;
            *registry.write() = file.controllers;
        } else {
            registry.save(&registry.read())?;
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<ControllerDescriptor> {
        self.read().iter().find(|c| c.id == id).cloned()
    }

    pub fn get_by_version(&self, version: &str) -> Option<ControllerDescriptor> {
        self.read().iter().find(|c| c.version == version).cloned()
    }

    pub fn first(&self) -> Option<ControllerDescriptor> {
        self.read().first().cloned()
    }

    pub fn list(&self) -> Vec<ControllerDescriptor> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Inserts or replaces a controller. Ids with periods are rejected: they
    /// appear in session URLs.
    pub fn add(&self, mut controller: ControllerDescriptor) -> Result<(), RegistryError> {
        if controller.id.contains('.') {
            return Err(RegistryError::InvalidId(controller.id));
        }
        let mut controllers = self.write();
        controller.updated_at = OffsetDateTime::now_utc();
        match controllers.iter_mut().find(|c| c.id == controller.id) {
            Some(existing) => {
                controller.created_at = existing.created_at;
                *existing = controller;
            }
            None => controllers.push(controller),
        }
        self.save(&controllers)
    }

    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let mut controllers = self.write();
        let before = controllers.len();
        controllers.retain(|c| c.id != id);
        if controllers.len() == before {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.save(&controllers)
    }

    /// Applies a batch of externally-sourced descriptors: per-descriptor
    /// diff, add/update/no-op, optional removal of entries absent from the
    /// batch. Invalid descriptors and ids with periods are counted as failed
    /// and skipped.
    pub fn ingest(
        &self,
        batch: Vec<ControllerDescriptor>,
        remove_missing: bool,
    ) -> Result<DiscoveryStats, RegistryError> {
        let mut stats = DiscoveryStats::default();
        let mut seen_ids: Vec<String> = Vec::new();
        let mut controllers = self.write();

        for mut incoming in batch {
            if incoming.id.contains('.') || !incoming.is_valid {
                stats.failed += 1;
                stats.failed_ids.push(incoming.id);
                continue;
            }
            seen_ids.push(incoming.id.clone());
            match controllers.iter_mut().find(|c| c.id == incoming.id) {
                Some(existing) => {
                    if existing.needs_update(&incoming) {
                        incoming.created_at = existing.created_at;
                        incoming.updated_at = OffsetDateTime::now_utc();
                        *existing = incoming;
                        stats.updated += 1;
                    } else {
                        stats.unchanged += 1;
                    }
                }
                None => {
                    controllers.push(incoming);
                    stats.added += 1;
                }
            }
        }

        if remove_missing {
            let before = controllers.len();
            controllers.retain(|c| seen_ids.iter().any(|id| *id == c.id));
            stats.removed = before - controllers.len();
        }

        if stats.added > 0 || stats.updated > 0 || stats.removed > 0 {
            self.save(&controllers)?;
        } else {
            debug!("discovery batch made no registry changes");
        }
        Ok(stats)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<ControllerDescriptor>> {
        self.controllers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ControllerDescriptor>> {
        self.controllers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self, controllers: &[ControllerDescriptor]) -> Result<(), RegistryError> {
        let file = RegistryFile {
            controllers: controllers.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        fs::write(&self.path, data).map_err(RegistryError::Write)
    }
}
