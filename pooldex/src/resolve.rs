//! Override resolution: which pool's copy of an item a project uses.
//!
//! Resolution is a plain read against the index. Nothing is cached between
//! calls because every project brings its own pool stack.

use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::core::{PoolError, Result};
use crate::db::{ItemRow, PoolIndex};
use crate::item::ObjectType;
use crate::registry::PoolRegistry;

/// An item resolved against a pool stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved {
    pub row: ItemRow,
    /// Absolute path of the item file, when the owning pool is in the registry.
    pub path: Option<PathBuf>,
}

/// First row for `(ty, uuid)` in `stack` (highest precedence first).
pub fn resolve(index: &PoolIndex, ty: ObjectType, uuid: &Uuid, stack: &[Uuid]) -> Result<ItemRow> {
    for pool in stack {
        if let Some(row) = index.get_item(pool, ty, uuid)? {
            return Ok(row);
        }
    }
    Err(PoolError::NotFound(format!("{} {}", ty, uuid)))
}

/// Like [`resolve`], for callers that only know the uuid.
pub fn resolve_any(index: &PoolIndex, uuid: &Uuid, stack: &[Uuid]) -> Result<ItemRow> {
    for pool in stack {
        for ty in ObjectType::ALL {
            if let Some(row) = index.get_item(pool, ty, uuid)? {
                return Ok(row);
            }
        }
    }
    Err(PoolError::NotFound(uuid.to_string()))
}

/// Resolve against the registry's stack and turn the row into a file path.
pub fn resolve_path(
    index: &PoolIndex,
    registry: &PoolRegistry,
    ty: Option<ObjectType>,
    uuid: &Uuid,
) -> Result<Resolved> {
    let stack = registry.stack();
    let row = match ty {
        Some(ty) => resolve(index, ty, uuid, &stack)?,
        None => resolve_any(index, uuid, &stack)?,
    };
    let path = registry
        .get(&row.pool_uuid)
        .map(|pool| pool.base_path.join(&row.filename));
    Ok(Resolved { row, path })
}
