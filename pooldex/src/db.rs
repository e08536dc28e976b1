//! SQLite-backed pool index.
//!
//! One index file holds the rows of every pool of a stack. Each item table is
//! keyed by `(uuid, pool_uuid)`, so the same item may be present once per pool;
//! `overridden` marks rows shadowed by a higher-precedence pool.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, ToSql};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::item::{Dependency, ObjectType};
use crate::registry::{PoolEntry, PoolRegistry};

/// Bumped whenever the table layout changes; older indexes are rebuilt.
pub const INDEX_SCHEMA_VERSION: i64 = 3;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid data in index: {0}")]
    InvalidData(String),
    #[error("Lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Type specific columns of each item table.
pub fn extra_columns(ty: ObjectType) -> &'static [(&'static str, &'static str)] {
    match ty {
        ObjectType::Unit => &[("manufacturer", "TEXT"), ("n_pins", "INTEGER")],
        ObjectType::Symbol => &[("unit", "TEXT")],
        ObjectType::Entity => &[("manufacturer", "TEXT"), ("prefix", "TEXT"), ("n_gates", "INTEGER")],
        ObjectType::Padstack => &[("well_known_name", "TEXT"), ("padstack_type", "TEXT")],
        ObjectType::Package => &[("manufacturer", "TEXT"), ("n_pads", "INTEGER"), ("alternate_for", "TEXT")],
        ObjectType::Part => &[
            ("manufacturer", "TEXT"),
            ("value", "TEXT"),
            ("description", "TEXT"),
            ("datasheet", "TEXT"),
            ("entity", "TEXT"),
            ("package", "TEXT"),
            ("base", "TEXT"),
        ],
        ObjectType::Frame | ObjectType::Decal => &[],
    }
}

/// Value of a type specific column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Int(i64),
    Text(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl From<usize> for AttrValue {
    fn from(n: usize) -> Self {
        AttrValue::Int(n as i64)
    }
}

impl From<Option<Uuid>> for AttrValue {
    fn from(uuid: Option<Uuid>) -> Self {
        match uuid {
            Some(u) => AttrValue::Text(u.to_string()),
            None => AttrValue::Null,
        }
    }
}

impl From<ValueRef<'_>> for AttrValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => AttrValue::Null,
            ValueRef::Integer(i) => AttrValue::Int(i),
            ValueRef::Real(f) => AttrValue::Text(f.to_string()),
            ValueRef::Text(t) | ValueRef::Blob(t) => AttrValue::Text(String::from_utf8_lossy(t).into_owned()),
        }
    }
}

impl ToSql for AttrValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            AttrValue::Null => ToSqlOutput::Owned(Value::Null),
            AttrValue::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            AttrValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// Identity of one index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemKey {
    pub object_type: ObjectType,
    pub uuid: Uuid,
    pub pool_uuid: Uuid,
}

impl ItemKey {
    pub fn new(object_type: ObjectType, uuid: Uuid, pool_uuid: Uuid) -> Self {
        Self {
            object_type,
            uuid,
            pool_uuid,
        }
    }
}

/// One row of an item table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRow {
    pub object_type: ObjectType,
    pub uuid: Uuid,
    pub pool_uuid: Uuid,
    pub name: String,
    /// Path relative to the pool root, `/` separated.
    pub filename: String,
    pub overridden: bool,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl ItemRow {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.object_type, self.uuid, self.pool_uuid)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttrValue::as_str)
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(AttrValue::as_int)
    }

    pub fn attr_uuid(&self, key: &str) -> Option<Uuid> {
        self.attr_str(key).and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Everything written for one item file.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub row: ItemRow,
    pub tags: Vec<String>,
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolRecord {
    pub uuid: Uuid,
    pub name: String,
    pub base_path: PathBuf,
    pub precedence: Option<i64>,
}

/// A dependency edge as stored in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Edge {
    pub from: ItemKey,
    pub to: Dependency,
}

pub struct PoolIndex {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl PoolIndex {
    /// Open or create an index file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        let index = PoolIndex {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        index.initialize()?;
        Ok(index)
    }

    /// Open an existing index for reading while another handle writes to it.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(PoolIndex {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let index = PoolIndex {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        index.initialize()?;
        Ok(index)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn get_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| DatabaseError::Lock(e.to_string()))
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS info (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let version: Option<String> = conn
            .query_row("SELECT value FROM info WHERE key = 'schema_version'", [], |row| row.get(0))
            .optional()?;
        if let Some(version) = version {
            if version != INDEX_SCHEMA_VERSION.to_string() {
                info!(
                    "Index schema version {} differs from {}, rebuilding",
                    version, INDEX_SCHEMA_VERSION
                );
                let mut statements = String::new();
                for ty in ObjectType::ALL {
                    statements.push_str(&format!("DROP TABLE IF EXISTS {};", ty.table()));
                }
                statements.push_str("DROP TABLE IF EXISTS tags; DROP TABLE IF EXISTS dependencies; DROP TABLE IF EXISTS pools;");
                conn.execute_batch(&statements)?;
            }
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pools (
                uuid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_path TEXT NOT NULL,
                precedence INTEGER
            )",
            [],
        )?;

        for ty in ObjectType::ALL {
            let extra: String = extra_columns(ty)
                .iter()
                .map(|(name, sql_type)| format!("{} {},\n", name, sql_type))
                .collect();
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        uuid TEXT NOT NULL,
                        pool_uuid TEXT NOT NULL,
                        name TEXT NOT NULL,
                        filename TEXT NOT NULL,
                        overridden BOOLEAN NOT NULL DEFAULT 0,
                        {extra}PRIMARY KEY (uuid, pool_uuid)
                    )",
                    table = ty.table(),
                    extra = extra
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(name)",
                    table = ty.table()
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_filename ON {table}(pool_uuid, filename)",
                    table = ty.table()
                ),
                [],
            )?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tags (
                tag TEXT NOT NULL,
                uuid TEXT NOT NULL,
                type TEXT NOT NULL,
                pool_uuid TEXT NOT NULL,
                PRIMARY KEY (tag, uuid, type, pool_uuid)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tags_item ON tags(type, uuid, pool_uuid)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dependencies (
                pool_uuid TEXT NOT NULL,
                type TEXT NOT NULL,
                uuid TEXT NOT NULL,
                dep_type TEXT NOT NULL,
                dep_uuid TEXT NOT NULL,
                PRIMARY KEY (pool_uuid, type, uuid, dep_type, dep_uuid)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_dependencies_target ON dependencies(dep_type, dep_uuid)",
            [],
        )?;

        conn.execute(
            "INSERT OR REPLACE INTO info (key, value) VALUES ('schema_version', ?1)",
            params![INDEX_SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    // Pool methods

    pub fn register_pool(&self, pool: &PoolEntry, precedence: usize) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO pools (uuid, name, base_path, precedence) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(uuid) DO UPDATE SET name = ?2, base_path = ?3, precedence = ?4",
            params![
                pool.uuid.to_string(),
                pool.name,
                pool.base_path.to_string_lossy(),
                precedence as i64
            ],
        )?;
        Ok(())
    }

    /// Make the index's pool precedences match `registry`.
    ///
    /// Pools known to the index but absent from the registry keep their rows
    /// but lose their precedence until dropped or registered again.
    pub fn sync_registry(&self, registry: &PoolRegistry) -> Result<()> {
        self.get_conn()?.execute("UPDATE pools SET precedence = NULL", [])?;
        for (precedence, pool) in registry.pools().iter().enumerate() {
            self.register_pool(pool, precedence)?;
        }
        Ok(())
    }

    pub fn pools(&self) -> Result<Vec<PoolRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT uuid, name, base_path, precedence FROM pools
             ORDER BY precedence IS NULL, precedence, uuid",
        )?;
        let pools = stmt
            .query_map([], |row| {
                Ok(PoolRecord {
                    uuid: get_uuid(row, 0)?,
                    name: row.get(1)?,
                    base_path: PathBuf::from(row.get::<_, String>(2)?),
                    precedence: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pools)
    }

    /// Remove a pool and every row it owns.
    pub fn drop_pool(&self, pool_uuid: &Uuid) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let pool = pool_uuid.to_string();
        let mut removed = 0;
        for ty in ObjectType::ALL {
            removed += tx.execute(
                &format!("DELETE FROM {} WHERE pool_uuid = ?1", ty.table()),
                params![pool],
            )?;
        }
        tx.execute("DELETE FROM tags WHERE pool_uuid = ?1", params![pool])?;
        tx.execute("DELETE FROM dependencies WHERE pool_uuid = ?1", params![pool])?;
        tx.execute("DELETE FROM pools WHERE uuid = ?1", params![pool])?;
        for ty in ObjectType::ALL {
            recompute_overridden_in(&tx, ty, None)?;
        }
        tx.commit()?;
        info!("Dropped pool {} ({} items)", pool_uuid, removed);
        Ok(removed)
    }

    // Item methods

    /// Replace the row, tags and outgoing edges of one item in one transaction.
    ///
    /// The overridden flags of every row sharing the item's uuid are refreshed
    /// in the same transaction.
    pub fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        let row = &entry.row;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        delete_rows(&tx, &row.key())?;

        let columns = extra_columns(row.object_type);
        let mut names = vec!["uuid", "pool_uuid", "name", "filename", "overridden"];
        names.extend(columns.iter().map(|(name, _)| *name));
        let placeholders = (1..=names.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            row.object_type.table(),
            names.join(", "),
            placeholders
        );

        let mut values: Vec<AttrValue> = vec![
            row.uuid.to_string().into(),
            row.pool_uuid.to_string().into(),
            row.name.clone().into(),
            row.filename.clone().into(),
            AttrValue::Int(0),
        ];
        for (name, _) in columns {
            values.push(row.attributes.get(*name).cloned().unwrap_or(AttrValue::Null));
        }
        tx.execute(&sql, params_from_iter(values.iter()))?;

        {
            let mut tag_stmt =
                tx.prepare("INSERT OR IGNORE INTO tags (tag, uuid, type, pool_uuid) VALUES (?1, ?2, ?3, ?4)")?;
            for tag in &entry.tags {
                tag_stmt.execute(params![
                    tag,
                    row.uuid.to_string(),
                    row.object_type.as_str(),
                    row.pool_uuid.to_string()
                ])?;
            }

            let mut dep_stmt = tx.prepare(
                "INSERT OR IGNORE INTO dependencies (pool_uuid, type, uuid, dep_type, dep_uuid)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for dep in &entry.dependencies {
                if dep.uuid == row.uuid && dep.object_type == row.object_type {
                    continue;
                }
                dep_stmt.execute(params![
                    row.pool_uuid.to_string(),
                    row.object_type.as_str(),
                    row.uuid.to_string(),
                    dep.object_type.as_str(),
                    dep.uuid.to_string()
                ])?;
            }
        }

        recompute_overridden_in(&tx, row.object_type, Some(&row.uuid))?;
        tx.commit()?;
        debug!("Indexed {} {} in pool {}", row.object_type, row.uuid, row.pool_uuid);
        Ok(())
    }

    /// Remove an item's row, tags and outgoing edges.
    ///
    /// Edges of other items pointing at it are kept and become dangling.
    pub fn delete_item(&self, pool_uuid: &Uuid, ty: ObjectType, uuid: &Uuid) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let removed = delete_rows(&tx, &ItemKey::new(ty, *uuid, *pool_uuid))?;
        recompute_overridden_in(&tx, ty, Some(uuid))?;
        tx.commit()?;
        if removed {
            debug!("Deleted {} {} from pool {}", ty, uuid, pool_uuid);
        }
        Ok(removed)
    }

    /// Delete an item and, transitively, every item of the same pool depending on it.
    pub fn delete_item_cascade(&self, pool_uuid: &Uuid, ty: ObjectType, uuid: &Uuid) -> Result<Vec<ItemKey>> {
        let mut deleted = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([ItemKey::new(ty, *uuid, *pool_uuid)]);
        while let Some(key) = queue.pop_front() {
            if !seen.insert(key) {
                continue;
            }
            for dependent in self.dependents_of(key.object_type, &key.uuid)? {
                if dependent.pool_uuid == *pool_uuid {
                    queue.push_back(dependent);
                }
            }
            if self.delete_item(&key.pool_uuid, key.object_type, &key.uuid)? {
                deleted.push(key);
            }
        }
        Ok(deleted)
    }

    /// Pool-local existence check.
    pub fn exists(&self, pool_uuid: &Uuid, ty: ObjectType, uuid: &Uuid) -> Result<bool> {
        let conn = self.get_conn()?;
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE uuid = ?1 AND pool_uuid = ?2", ty.table()),
                params![uuid.to_string(), pool_uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Whether any pool holds the item.
    pub fn exists_in_any_pool(&self, ty: ObjectType, uuid: &Uuid) -> Result<bool> {
        let conn = self.get_conn()?;
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE uuid = ?1 LIMIT 1", ty.table()),
                params![uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_item(&self, pool_uuid: &Uuid, ty: ObjectType, uuid: &Uuid) -> Result<Option<ItemRow>> {
        let conn = self.get_conn()?;
        let sql = format!("{} WHERE uuid = ?1 AND pool_uuid = ?2", select_rows_sql(ty));
        let row = conn
            .query_row(&sql, params![uuid.to_string(), pool_uuid.to_string()], |row| {
                read_item_row(ty, row)
            })
            .optional()?;
        Ok(row)
    }

    /// Rows of one type, optionally restricted to a pool, ordered by name then uuid.
    pub fn items(&self, pool_uuid: Option<&Uuid>, ty: ObjectType) -> Result<Vec<ItemRow>> {
        let conn = self.get_conn()?;
        let (sql, args): (String, Vec<String>) = match pool_uuid {
            Some(pool) => (
                format!("{} WHERE pool_uuid = ?1 ORDER BY name, uuid, pool_uuid", select_rows_sql(ty)),
                vec![pool.to_string()],
            ),
            None => (format!("{} ORDER BY name, uuid, pool_uuid", select_rows_sql(ty)), vec![]),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| read_item_row(ty, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn uuids(&self, pool_uuid: &Uuid, ty: ObjectType) -> Result<BTreeSet<Uuid>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT uuid FROM {} WHERE pool_uuid = ?1", ty.table()))?;
        let uuids = stmt
            .query_map(params![pool_uuid.to_string()], |row| get_uuid(row, 0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(uuids)
    }

    /// Items of a pool backed by the given pool-relative filename.
    pub fn find_by_filename(&self, pool_uuid: &Uuid, filename: &str) -> Result<Vec<ItemKey>> {
        let conn = self.get_conn()?;
        let mut keys = Vec::new();
        for ty in ObjectType::ALL {
            let mut stmt = conn.prepare(&format!(
                "SELECT uuid FROM {} WHERE pool_uuid = ?1 AND filename = ?2",
                ty.table()
            ))?;
            let found = stmt
                .query_map(params![pool_uuid.to_string(), filename], |row| get_uuid(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            keys.extend(found.into_iter().map(|uuid| ItemKey::new(ty, uuid, *pool_uuid)));
        }
        Ok(keys)
    }

    pub fn tags_of(&self, pool_uuid: &Uuid, ty: ObjectType, uuid: &Uuid) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT tag FROM tags WHERE type = ?1 AND uuid = ?2 AND pool_uuid = ?3 ORDER BY tag",
        )?;
        let tags = stmt
            .query_map(
                params![ty.as_str(), uuid.to_string(), pool_uuid.to_string()],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tags)
    }

    /// Distinct tags of one type with the number of items carrying each.
    pub fn all_tags(&self, ty: ObjectType) -> Result<Vec<(String, usize)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT tag, COUNT(DISTINCT uuid) FROM tags WHERE type = ?1 GROUP BY tag ORDER BY tag",
        )?;
        let tags = stmt
            .query_map(params![ty.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    // Dependency methods

    pub fn dependencies_of(&self, pool_uuid: &Uuid, ty: ObjectType, uuid: &Uuid) -> Result<Vec<Dependency>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT dep_type, dep_uuid FROM dependencies
             WHERE pool_uuid = ?1 AND type = ?2 AND uuid = ?3
             ORDER BY dep_type, dep_uuid",
        )?;
        let deps = stmt
            .query_map(
                params![pool_uuid.to_string(), ty.as_str(), uuid.to_string()],
                |row| Ok(Dependency::new(get_type(row, 0)?, get_uuid(row, 1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deps)
    }

    /// Items of any pool with an edge to `(ty, uuid)`.
    pub fn dependents_of(&self, ty: ObjectType, uuid: &Uuid) -> Result<Vec<ItemKey>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT type, uuid, pool_uuid FROM dependencies
             WHERE dep_type = ?1 AND dep_uuid = ?2
             ORDER BY type, uuid, pool_uuid",
        )?;
        let keys = stmt
            .query_map(params![ty.as_str(), uuid.to_string()], |row| {
                Ok(ItemKey::new(get_type(row, 0)?, get_uuid(row, 1)?, get_uuid(row, 2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// Every edge, in a stable order.
    pub fn all_dependencies(&self) -> Result<Vec<Edge>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT type, uuid, pool_uuid, dep_type, dep_uuid FROM dependencies
             ORDER BY pool_uuid, type, uuid, dep_type, dep_uuid",
        )?;
        let edges = stmt
            .query_map([], read_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Edges whose target is not indexed in any pool.
    pub fn dangling_dependencies(&self) -> Result<Vec<Edge>> {
        let conn = self.get_conn()?;
        let mut edges = Vec::new();
        for ty in ObjectType::ALL {
            let mut stmt = conn.prepare(&format!(
                "SELECT d.type, d.uuid, d.pool_uuid, d.dep_type, d.dep_uuid FROM dependencies d
                 WHERE d.dep_type = ?1
                 AND NOT EXISTS (SELECT 1 FROM {} t WHERE t.uuid = d.dep_uuid)",
                ty.table()
            ))?;
            let found = stmt
                .query_map(params![ty.as_str()], read_edge)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            edges.extend(found);
        }
        edges.sort();
        Ok(edges)
    }

    /// Number of rows per type.
    pub fn counts(&self) -> Result<BTreeMap<ObjectType, usize>> {
        let conn = self.get_conn()?;
        let mut counts = BTreeMap::new();
        for ty in ObjectType::ALL {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", ty.table()), [], |row| {
                row.get(0)
            })?;
            counts.insert(ty, n as usize);
        }
        Ok(counts)
    }

    // Override flags

    /// Recompute the overridden flag of every row.
    pub fn recompute_overridden_all(&self) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        for ty in ObjectType::ALL {
            recompute_overridden_in(&tx, ty, None)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Recompute the overridden flag of every row with this uuid, across all pools.
    pub fn recompute_overridden(&self, ty: ObjectType, uuid: &Uuid) -> Result<()> {
        let conn = self.get_conn()?;
        recompute_overridden_in(&conn, ty, Some(uuid))
    }
}

fn select_rows_sql(ty: ObjectType) -> String {
    let mut columns = vec!["uuid", "pool_uuid", "name", "filename", "overridden"];
    columns.extend(extra_columns(ty).iter().map(|(name, _)| *name));
    format!("SELECT {} FROM {}", columns.join(", "), ty.table())
}

pub(crate) fn read_item_row(ty: ObjectType, row: &Row<'_>) -> rusqlite::Result<ItemRow> {
    let mut attributes = BTreeMap::new();
    for (i, (name, _)) in extra_columns(ty).iter().enumerate() {
        attributes.insert(name.to_string(), AttrValue::from(row.get_ref(5 + i)?));
    }
    Ok(ItemRow {
        object_type: ty,
        uuid: get_uuid(row, 0)?,
        pool_uuid: get_uuid(row, 1)?,
        name: row.get(2)?,
        filename: row.get(3)?,
        overridden: row.get(4)?,
        attributes,
    })
}

fn read_edge(row: &Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        from: ItemKey::new(get_type(row, 0)?, get_uuid(row, 1)?, get_uuid(row, 2)?),
        to: Dependency::new(get_type(row, 3)?, get_uuid(row, 4)?),
    })
}

fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn get_type(row: &Row<'_>, idx: usize) -> rusqlite::Result<ObjectType> {
    let text: String = row.get(idx)?;
    text.parse::<ObjectType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Delete the row, tags and outgoing edges of `key`. Returns whether a row existed.
fn delete_rows(conn: &Connection, key: &ItemKey) -> rusqlite::Result<bool> {
    let uuid = key.uuid.to_string();
    let pool = key.pool_uuid.to_string();
    let removed = conn.execute(
        &format!("DELETE FROM {} WHERE uuid = ?1 AND pool_uuid = ?2", key.object_type.table()),
        params![uuid, pool],
    )?;
    conn.execute(
        "DELETE FROM tags WHERE type = ?1 AND uuid = ?2 AND pool_uuid = ?3",
        params![key.object_type.as_str(), uuid, pool],
    )?;
    conn.execute(
        "DELETE FROM dependencies WHERE type = ?1 AND uuid = ?2 AND pool_uuid = ?3",
        params![key.object_type.as_str(), uuid, pool],
    )?;
    Ok(removed > 0)
}

/// A row is overridden when a pool of higher precedence holds the same uuid.
fn recompute_overridden_in(conn: &Connection, ty: ObjectType, uuid: Option<&Uuid>) -> Result<()> {
    let table = ty.table();
    let sql = format!(
        "UPDATE {table} SET overridden = EXISTS (
            SELECT 1 FROM {table} AS other
            JOIN pools AS other_pool ON other_pool.uuid = other.pool_uuid
            JOIN pools AS this_pool ON this_pool.uuid = {table}.pool_uuid
            WHERE other.uuid = {table}.uuid
            AND other.pool_uuid != {table}.pool_uuid
            AND other_pool.precedence < this_pool.precedence
        )",
        table = table
    );
    match uuid {
        Some(uuid) => conn.execute(&format!("{} WHERE uuid = ?1", sql), params![uuid.to_string()])?,
        None => conn.execute(&sql, [])?,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (PoolIndex, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("pool.db");
        let db = PoolIndex::open(&db_path).unwrap();
        (db, temp_dir)
    }

    fn unit_entry(pool: Uuid, uuid: Uuid, name: &str) -> IndexEntry {
        let mut attributes = BTreeMap::new();
        attributes.insert("manufacturer".to_string(), AttrValue::from("Acme"));
        attributes.insert("n_pins".to_string(), AttrValue::Int(2));
        IndexEntry {
            row: ItemRow {
                object_type: ObjectType::Unit,
                uuid,
                pool_uuid: pool,
                name: name.to_string(),
                filename: format!("units/{}.json", name),
                overridden: false,
                attributes,
            },
            tags: vec!["passive".to_string()],
            dependencies: vec![],
        }
    }

    fn symbol_entry(pool: Uuid, uuid: Uuid, unit: Uuid) -> IndexEntry {
        let mut attributes = BTreeMap::new();
        attributes.insert("unit".to_string(), AttrValue::from(Some(unit)));
        IndexEntry {
            row: ItemRow {
                object_type: ObjectType::Symbol,
                uuid,
                pool_uuid: pool,
                name: "R".to_string(),
                filename: "symbols/r.json".to_string(),
                overridden: false,
                attributes,
            },
            tags: vec![],
            dependencies: vec![Dependency::new(ObjectType::Unit, unit)],
        }
    }

    fn register(db: &PoolIndex, pools: &[Uuid]) {
        for (i, uuid) in pools.iter().enumerate() {
            db.register_pool(&PoolEntry::new(*uuid, format!("pool{}", i), "/tmp"), i)
                .unwrap();
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let (db, _temp) = create_test_db();
        let pool = Uuid::new_v4();
        let unit = Uuid::new_v4();
        register(&db, &[pool]);

        db.upsert(&unit_entry(pool, unit, "resistor")).unwrap();

        assert!(db.exists(&pool, ObjectType::Unit, &unit).unwrap());
        assert!(!db.exists(&Uuid::new_v4(), ObjectType::Unit, &unit).unwrap());
        let row = db.get_item(&pool, ObjectType::Unit, &unit).unwrap().unwrap();
        assert_eq!(row.name, "resistor");
        assert_eq!(row.attr_int("n_pins"), Some(2));
        assert_eq!(row.attr_str("manufacturer"), Some("Acme"));
        assert_eq!(db.tags_of(&pool, ObjectType::Unit, &unit).unwrap(), vec!["passive"]);
    }

    #[test]
    fn test_upsert_replaces_edges() {
        let (db, _temp) = create_test_db();
        let pool = Uuid::new_v4();
        register(&db, &[pool]);
        let symbol = Uuid::new_v4();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

        db.upsert(&symbol_entry(pool, symbol, u1)).unwrap();
        db.upsert(&symbol_entry(pool, symbol, u2)).unwrap();

        assert_eq!(
            db.dependencies_of(&pool, ObjectType::Symbol, &symbol).unwrap(),
            vec![Dependency::new(ObjectType::Unit, u2)]
        );
        assert_eq!(db.counts().unwrap()[&ObjectType::Symbol], 1);
    }

    #[test]
    fn test_delete_leaves_incoming_edges_dangling() {
        let (db, _temp) = create_test_db();
        let pool = Uuid::new_v4();
        register(&db, &[pool]);
        let unit = Uuid::new_v4();
        let symbol = Uuid::new_v4();
        db.upsert(&unit_entry(pool, unit, "resistor")).unwrap();
        db.upsert(&symbol_entry(pool, symbol, unit)).unwrap();
        assert!(db.dangling_dependencies().unwrap().is_empty());

        assert!(db.delete_item(&pool, ObjectType::Unit, &unit).unwrap());

        assert!(db.exists(&pool, ObjectType::Symbol, &symbol).unwrap());
        let dangling = db.dangling_dependencies().unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].from.uuid, symbol);
        assert_eq!(dangling[0].to, Dependency::new(ObjectType::Unit, unit));
    }

    #[test]
    fn test_delete_cascade_removes_dependents() {
        let (db, _temp) = create_test_db();
        let pool = Uuid::new_v4();
        register(&db, &[pool]);
        let unit = Uuid::new_v4();
        let symbol = Uuid::new_v4();
        db.upsert(&unit_entry(pool, unit, "resistor")).unwrap();
        db.upsert(&symbol_entry(pool, symbol, unit)).unwrap();

        let deleted = db.delete_item_cascade(&pool, ObjectType::Unit, &unit).unwrap();

        assert_eq!(deleted.len(), 2);
        assert!(!db.exists(&pool, ObjectType::Symbol, &symbol).unwrap());
        assert!(db.all_dependencies().unwrap().is_empty());
    }

    #[test]
    fn test_overridden_follows_precedence() {
        let (db, _temp) = create_test_db();
        let (high, low) = (Uuid::new_v4(), Uuid::new_v4());
        register(&db, &[high, low]);
        let unit = Uuid::new_v4();

        db.upsert(&unit_entry(low, unit, "resistor")).unwrap();
        assert!(!db.get_item(&low, ObjectType::Unit, &unit).unwrap().unwrap().overridden);

        db.upsert(&unit_entry(high, unit, "resistor")).unwrap();
        assert!(db.get_item(&low, ObjectType::Unit, &unit).unwrap().unwrap().overridden);
        assert!(!db.get_item(&high, ObjectType::Unit, &unit).unwrap().unwrap().overridden);

        db.delete_item(&high, ObjectType::Unit, &unit).unwrap();
        assert!(!db.get_item(&low, ObjectType::Unit, &unit).unwrap().unwrap().overridden);
    }

    #[test]
    fn test_drop_pool() {
        let (db, _temp) = create_test_db();
        let (high, low) = (Uuid::new_v4(), Uuid::new_v4());
        register(&db, &[high, low]);
        let unit = Uuid::new_v4();
        db.upsert(&unit_entry(low, unit, "resistor")).unwrap();
        db.upsert(&unit_entry(high, unit, "resistor")).unwrap();

        assert_eq!(db.drop_pool(&high).unwrap(), 1);

        assert_eq!(db.pools().unwrap().len(), 1);
        assert!(!db.get_item(&low, ObjectType::Unit, &unit).unwrap().unwrap().overridden);
    }

    #[test]
    fn test_find_by_filename() {
        let (db, _temp) = create_test_db();
        let pool = Uuid::new_v4();
        register(&db, &[pool]);
        let unit = Uuid::new_v4();
        db.upsert(&unit_entry(pool, unit, "cap")).unwrap();

        let keys = db.find_by_filename(&pool, "units/cap.json").unwrap();
        assert_eq!(keys, vec![ItemKey::new(ObjectType::Unit, unit, pool)]);
        assert!(db.find_by_filename(&pool, "units/other.json").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pool.db");
        let pool = Uuid::new_v4();
        let unit = Uuid::new_v4();
        {
            let db = PoolIndex::open(&path).unwrap();
            register(&db, &[pool]);
            db.upsert(&unit_entry(pool, unit, "resistor")).unwrap();
        }
        let db = PoolIndex::open(&path).unwrap();
        assert!(db.exists(&pool, ObjectType::Unit, &unit).unwrap());

        let reader = PoolIndex::open_read_only(&path).unwrap();
        assert!(reader.exists(&pool, ObjectType::Unit, &unit).unwrap());
    }
}
