//! Pool stack configuration.
//!
//! A [`PoolRegistry`] is the ordered list of pools a project uses, highest
//! precedence first. It is owned by the caller and passed explicitly to the
//! updater and to resolution.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::{PoolError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
    pub base_path: PathBuf,
}

impl PoolEntry {
    pub fn new(uuid: Uuid, name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            uuid,
            name: name.into(),
            base_path: base_path.into(),
        }
    }

    /// Fail if the pool root is missing or not a directory.
    pub fn check_root(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.base_path).map_err(|e| {
            PoolError::Config(format!(
                "Pool {} root {} is not readable: {}",
                self.uuid,
                self.base_path.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(PoolError::Config(format!(
                "Pool {} root {} is not a directory",
                self.uuid,
                self.base_path.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    pools: Vec<PoolEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolRegistry {
    pools: Vec<PoolEntry>,
}

impl PoolRegistry {
    /// Build a registry from pools ordered highest precedence first.
    pub fn new(pools: Vec<PoolEntry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for pool in &pools {
            if !seen.insert(pool.uuid) {
                return Err(PoolError::Config(format!("Pool {} is listed twice", pool.uuid)));
            }
        }
        Ok(Self { pools })
    }

    /// Load `{"pools": [{"uuid", "name", "base_path"}, ...]}`.
    ///
    /// Relative base paths are taken relative to the config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let file: RegistryFile = serde_json::from_str(&content)
            .map_err(|e| PoolError::Config(format!("Invalid pool config {}: {}", path.display(), e)))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let pools = file
            .pools
            .into_iter()
            .map(|mut p| {
                if p.base_path.is_relative() {
                    p.base_path = dir.join(&p.base_path);
                }
                p
            })
            .collect();
        debug!("Loaded pool config from {}", path.display());
        Self::new(pools)
    }

    pub fn pools(&self) -> &[PoolEntry] {
        &self.pools
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&PoolEntry> {
        self.pools.iter().find(|p| &p.uuid == uuid)
    }

    /// 0 is the highest precedence.
    pub fn precedence(&self, uuid: &Uuid) -> Option<usize> {
        self.pools.iter().position(|p| &p.uuid == uuid)
    }

    /// Pool uuids, highest precedence first.
    pub fn stack(&self) -> Vec<Uuid> {
        self.pools.iter().map(|p| p.uuid).collect()
    }

    /// The pool whose root contains `path`; the deepest root wins when roots nest.
    pub fn pool_for_path(&self, path: &Path) -> Option<&PoolEntry> {
        self.pools
            .iter()
            .filter(|p| path.starts_with(&p.base_path))
            .max_by_key(|p| p.base_path.components().count())
    }

    /// Check every pool root.
    pub fn validate(&self) -> Result<()> {
        self.pools.iter().try_for_each(PoolEntry::check_root)
    }
}
