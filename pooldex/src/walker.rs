//! Pool directory traversal.
//!
//! Layout of a pool root:
//!
//! ```text
//! units/**/*.json
//! symbols/**/*.json
//! entities/**/*.json
//! padstacks/**/*.json
//! packages/**/package.json           one directory per package
//! packages/**/padstacks/*.json       padstacks local to a package
//! parts/**/*.json
//! frames/**/*.json
//! decals/**/*.json
//! ```
//!
//! Hidden files and directories are skipped. Entries are visited in file name
//! order so walks are reproducible.

use std::path::{Component, Path, PathBuf};

use tracing::warn;
use walkdir::{DirEntry, WalkDir};

use crate::item::ObjectType;

const PACKAGE_FILE: &str = "package.json";
const LOCAL_PADSTACK_DIR: &str = "padstacks";

/// A candidate item file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    pub object_type: ObjectType,
    pub path: PathBuf,
    /// Path relative to the pool root, `/` separated.
    pub filename: String,
}

/// Every candidate file of a pool, grouped by type in index order.
pub fn walk_pool(root: &Path) -> Vec<WalkedFile> {
    ObjectType::ALL
        .iter()
        .flat_map(|ty| walk_type(root, *ty))
        .collect()
}

/// Candidate files of one type.
pub fn walk_type(root: &Path, ty: ObjectType) -> Vec<WalkedFile> {
    let mut files = Vec::new();
    let mut dirs = vec![root.join(ty.directory())];
    if ty == ObjectType::Padstack {
        dirs.push(root.join(ObjectType::Package.directory()));
    }
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        let walker = WalkDir::new(&dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry below {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if classify(root, path) != Some(ty) {
                continue;
            }
            if let Some(filename) = relative_filename(root, path) {
                files.push(WalkedFile {
                    object_type: ty,
                    path: path.to_path_buf(),
                    filename,
                });
            }
        }
    }
    files
}

/// Type of the item stored at `path` inside `root`, judged by location alone.
///
/// Paths with a hidden component below `root` are not item files, matching
/// what the walk skips.
pub fn classify(root: &Path, path: &Path) -> Option<ObjectType> {
    let rel = path.strip_prefix(root).ok()?;
    if path.extension().and_then(|e| e.to_str()) != Some("json") || has_hidden_component(rel) {
        return None;
    }
    let first = match rel.components().next()? {
        Component::Normal(name) => name.to_str()?,
        _ => return None,
    };
    let ty = ObjectType::ALL.iter().copied().find(|t| t.directory() == first)?;
    if ty != ObjectType::Package {
        return Some(ty);
    }
    let file_name = path.file_name()?.to_str()?;
    let parent = path.parent()?.file_name()?.to_str()?;
    if parent == LOCAL_PADSTACK_DIR && rel.components().count() > 3 {
        Some(ObjectType::Padstack)
    } else if file_name == PACKAGE_FILE {
        Some(ObjectType::Package)
    } else {
        None
    }
}

/// `path` relative to `root` with `/` separators.
pub fn relative_filename(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str().map(str::to_string),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

fn has_hidden_component(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(name) => name.to_str().map(|s| s.starts_with('.')).unwrap_or(false),
        _ => false,
    })
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}
