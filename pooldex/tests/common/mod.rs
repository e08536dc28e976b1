//! Shared helpers for the pooldex integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use pooldex::{PoolEntry, PoolRegistry};
use tempfile::TempDir;
use uuid::Uuid;
use walkdir::WalkDir;

pub const UNIT: &str = "11111111-1111-4111-8111-000000000001";
pub const SYMBOL: &str = "22222222-2222-4222-8222-000000000001";
pub const ENTITY: &str = "33333333-3333-4333-8333-000000000001";
pub const PADSTACK: &str = "44444444-4444-4444-8444-000000000001";
pub const PACKAGE: &str = "55555555-5555-4555-8555-000000000001";
pub const PART: &str = "66666666-6666-4666-8666-000000000001";
pub const BASED_PART: &str = "66666666-6666-4666-8666-000000000002";
pub const FRAME: &str = "77777777-7777-4777-8777-000000000001";

pub fn uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap()
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Copy the fixture pool into `dest` so tests can modify it.
pub fn copy_fixture_pool(dest: &Path) {
    let src = fixture_path("pool");
    for entry in WalkDir::new(&src) {
        let entry = entry.unwrap();
        let target = dest.join(entry.path().strip_prefix(&src).unwrap());
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).unwrap();
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

pub fn write_file(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
}

/// A temporary directory holding a copy of the fixture pool and the
/// registry entry pointing at it.
pub struct TestPool {
    pub dir: TempDir,
    pub entry: PoolEntry,
}

impl TestPool {
    pub fn fixture(name: &str) -> Self {
        let pool = Self::empty(name);
        copy_fixture_pool(pool.root());
        pool
    }

    pub fn empty(name: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let entry = PoolEntry::new(Uuid::new_v4(), name, dir.path());
        Self { dir, entry }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

pub fn registry(pools: &[&TestPool]) -> PoolRegistry {
    PoolRegistry::new(pools.iter().map(|p| p.entry.clone()).collect()).unwrap()
}
