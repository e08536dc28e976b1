//! Pooldex - pool indexing and dependency tracking for EDA part libraries
//!
//! A pool is a directory of JSON item files (units, symbols, entities,
//! padstacks, packages, parts, frames, decals). This library walks pools,
//! parses their items, records every item, tag and dependency edge in one
//! SQLite index and keeps that index current as files change. When several
//! pools define the same uuid, the copy in the highest-precedence pool wins
//! and the others are flagged as overridden.
//!
//! # Quick Start
//!
//! ```no_run
//! use pooldex::{CollectingSink, PoolIndex, PoolRegistry, Updater};
//! use std::path::Path;
//!
//! let registry = PoolRegistry::load(Path::new("pools.json")).unwrap();
//! let mut index = PoolIndex::open(Path::new("pool.db")).unwrap();
//! let mut sink = CollectingSink::new();
//!
//! let report = Updater::new(&mut index, &registry)
//!     .update_all(&mut sink)
//!     .unwrap();
//! println!("{} files, {} errors", report.files, report.error_count());
//! ```
//!
//! # Features
//!
//! - **Full and partial updates**: whole pools, or one changed file plus its direct dependents
//! - **Override resolution**: per-project pool stacks resolved against the index
//! - **Search**: name prefix and tag queries with deterministic paging
//! - **Watching**: debounced filesystem events for incremental updates

pub mod core;
pub mod db;
pub mod item;
pub mod registry;
pub mod resolve;
pub mod search;
pub mod status;
pub mod updater;
pub mod walker;
pub mod watcher;

// Re-export main types
pub use crate::core::{FileFailure, PoolError, Result, UpdateOptions, UpdatePhase, UpdateReport};
pub use db::{AttrValue, DatabaseError, Edge, IndexEntry, ItemKey, ItemRow, PoolIndex, PoolRecord};
pub use item::{Dependency, ItemParser, ItemRecord, ObjectType, ParseError};
pub use registry::{PoolEntry, PoolRegistry};
pub use resolve::{resolve, resolve_any, resolve_path, Resolved};
pub use search::{ItemQuery, SearchHit};
pub use status::{CollectingSink, NullSink, StatusEvent, StatusSink};
pub use updater::Updater;
pub use watcher::{PoolWatcher, WatchEvent};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        ItemQuery, ObjectType, PoolError, PoolIndex, PoolRegistry, StatusEvent, StatusSink, UpdateOptions,
        UpdateReport, Updater,
    };
}
