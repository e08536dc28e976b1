//! Update orchestration.
//!
//! A full update walks a pool, parses and writes every item file type by type
//! in index order, then deletes the rows whose files are gone. A partial
//! update re-indexes one file and refreshes the items that directly depend on
//! it. Each file is written in its own transaction; a failing file is reported
//! as [`StatusEvent::FileError`] and the run moves on.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{FileFailure, PoolError, Result, UpdateOptions, UpdatePhase, UpdateReport};
use crate::db::{AttrValue, IndexEntry, ItemKey, ItemRow, PoolIndex};
use crate::item::{extract_dependencies, Dependency, ItemParser, ItemRecord, ObjectType, Part};
use crate::registry::{PoolEntry, PoolRegistry};
use crate::resolve::resolve;
use crate::status::{StatusEvent, StatusSink};
use crate::walker::{self, WalkedFile};

/// Drives updates of the pools of one registry into one index.
///
/// The updater borrows the index mutably for its lifetime, so a single
/// updater is the only writer of that index handle.
pub struct Updater<'a> {
    index: &'a mut PoolIndex,
    registry: &'a PoolRegistry,
    options: UpdateOptions,
    phase: UpdatePhase,
}

impl<'a> Updater<'a> {
    pub fn new(index: &'a mut PoolIndex, registry: &'a PoolRegistry) -> Self {
        Self {
            index,
            registry,
            options: UpdateOptions::default(),
            phase: UpdatePhase::Idle,
        }
    }

    pub fn with_options(mut self, options: UpdateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    fn set_phase(&mut self, phase: UpdatePhase) {
        if self.phase != phase {
            debug!("Update phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    /// Full update of every registered pool, lowest precedence first.
    pub fn update_all(&mut self, sink: &mut dyn StatusSink) -> Result<UpdateReport> {
        let root = self
            .registry
            .pools()
            .first()
            .map(|p| p.base_path.clone())
            .unwrap_or_default();
        if let Err(e) = self.registry.validate() {
            return Err(self.fail_run(&root, e, sink));
        }
        let mut report = UpdateReport::start();
        self.sync_registry(&root, &mut report, sink);

        let registry = self.registry;
        for pool in registry.pools().iter().rev() {
            let pool_report = self.run_full(pool, sink);
            report.merge(pool_report);
            if report.cancelled {
                break;
            }
        }
        self.recompute_overridden(&root, &mut report, sink);
        Ok(self.finish(report, &root, sink))
    }

    /// Full update of one registered pool.
    pub fn update_pool(&mut self, pool_uuid: &Uuid, sink: &mut dyn StatusSink) -> Result<UpdateReport> {
        let registry = self.registry;
        let pool = match registry.get(pool_uuid) {
            Some(pool) => pool,
            None => {
                let e = PoolError::Config(format!("Pool {} is not registered", pool_uuid));
                return Err(self.fail_run(Path::new(""), e, sink));
            }
        };
        if let Err(e) = pool.check_root() {
            return Err(self.fail_run(&pool.base_path, e, sink));
        }
        let mut report = UpdateReport::start();
        self.sync_registry(&pool.base_path, &mut report, sink);

        let pool_report = self.run_full(pool, sink);
        report.merge(pool_report);
        self.recompute_overridden(&pool.base_path, &mut report, sink);
        Ok(self.finish(report, &pool.base_path, sink))
    }

    /// Partial update after `path` changed, was created or was removed.
    ///
    /// Rows of every pool sharing the item's uuid get their overridden flag
    /// recomputed. Items directly depending on the changed item are re-indexed
    /// from their files (one hop only); deeper staleness needs a full update.
    pub fn update_file(&mut self, path: &Path, sink: &mut dyn StatusSink) -> Result<UpdateReport> {
        let registry = self.registry;
        let (pool, path) = match locate(registry, path) {
            Some(found) => found,
            None => {
                let e = PoolError::Config(format!("{} is not inside a registered pool", path.display()));
                return Err(self.fail_run(path, e, sink));
            }
        };
        let mut report = UpdateReport::start();
        self.sync_registry(&path, &mut report, sink);

        let Some(object_type) = walker::classify(&pool.base_path, &path) else {
            let message = "Not an item file".to_string();
            self.record_failure(&mut report, &path, message, sink);
            return Ok(self.finish(report, &path, sink));
        };
        let filename = walker::relative_filename(&pool.base_path, &path).unwrap_or_default();
        let previous = match self.index.find_by_filename(&pool.uuid, &filename) {
            Ok(previous) => previous,
            Err(e) => {
                self.record_failure(&mut report, &path, e.to_string(), sink);
                return Ok(self.finish(report, &path, sink));
            }
        };

        let mut changed: Vec<ItemKey> = Vec::new();
        if path.is_file() {
            let file = WalkedFile {
                object_type,
                path: path.clone(),
                filename,
            };
            report.files += 1;
            match self.process_file(pool, &file) {
                Ok(uuid) => {
                    report.written += 1;
                    sink.on_status(&StatusEvent::File {
                        path: path.clone(),
                        message: String::new(),
                    });
                    changed.push(ItemKey::new(object_type, uuid, pool.uuid));
                    for key in previous.iter().filter(|k| k.uuid != uuid || k.object_type != object_type) {
                        if self.remove_reported(key, &path, &mut report, sink) {
                            changed.push(*key);
                        }
                    }
                }
                Err(e) => self.record_failure(&mut report, &path, e.to_string(), sink),
            }
        } else {
            for key in &previous {
                if self.remove_reported(key, &path, &mut report, sink) {
                    changed.push(*key);
                }
            }
            if changed.len() == previous.len() {
                sink.on_status(&StatusEvent::File {
                    path: path.clone(),
                    message: format!("removed {} item(s)", previous.len()),
                });
            }
        }

        if self.options.refresh_dependents {
            self.refresh_dependents(&changed, &mut report, sink);
        }
        Ok(self.finish(report, &path, sink))
    }

    /// Walk and index one pool. Does not emit `Done`.
    ///
    /// Store errors are reported against the pool root or the file involved
    /// and never end the run early.
    fn run_full(&mut self, pool: &PoolEntry, sink: &mut dyn StatusSink) -> UpdateReport {
        info!("Updating pool {} ({})", pool.name, pool.base_path.display());
        let mut report = UpdateReport::start();

        self.set_phase(UpdatePhase::Walking);
        let mut by_type: BTreeMap<ObjectType, Vec<WalkedFile>> = BTreeMap::new();
        for file in walker::walk_pool(&pool.base_path) {
            by_type.entry(file.object_type).or_default().push(file);
        }

        for ty in ObjectType::ALL {
            let previous = match self.index.uuids(&pool.uuid, ty) {
                Ok(previous) => Some(previous),
                Err(e) => {
                    let message = format!("cannot list indexed {} items, stale rows kept: {}", ty, e);
                    self.record_failure(&mut report, &pool.base_path, message, sink);
                    None
                }
            };
            let files = by_type.remove(&ty).unwrap_or_default();
            let seen = if ty == ObjectType::Part {
                self.index_parts(pool, previous.as_ref(), &files, &mut report, sink)
            } else {
                self.index_files(pool, &files, &mut report, sink)
            };
            if report.cancelled {
                info!("Update of pool {} cancelled", pool.name);
                break;
            }
            for uuid in previous.iter().flat_map(|p| p.difference(&seen)) {
                let key = ItemKey::new(ty, *uuid, pool.uuid);
                debug!("Removing stale {} {}", ty, uuid);
                self.remove_reported(&key, &pool.base_path, &mut report, sink);
            }
        }
        report.finished_at = Utc::now();
        report
    }

    fn index_files(
        &mut self,
        pool: &PoolEntry,
        files: &[WalkedFile],
        report: &mut UpdateReport,
        sink: &mut dyn StatusSink,
    ) -> BTreeSet<Uuid> {
        let mut seen = BTreeSet::new();
        for file in files {
            if self.check_cancelled(report) {
                break;
            }
            report.files += 1;
            match self.process_file(pool, file) {
                Ok(uuid) => {
                    if !seen.insert(uuid) {
                        warn!("{} {} is defined by more than one file", file.object_type, uuid);
                    }
                    report.written += 1;
                    sink.on_status(&StatusEvent::File {
                        path: file.path.clone(),
                        message: String::new(),
                    });
                }
                Err(e) => self.record_failure(report, &file.path, e.to_string(), sink),
            }
        }
        seen
    }

    /// Parts in walk order. A based part whose base is another part of this
    /// pool waits until that base is written, then the waiting parts are
    /// retried in rounds.
    ///
    /// Stale part rows are dropped before anything is written so that a based
    /// part never inherits from a part whose file is gone.
    fn index_parts(
        &mut self,
        pool: &PoolEntry,
        previous: Option<&BTreeSet<Uuid>>,
        files: &[WalkedFile],
        report: &mut UpdateReport,
        sink: &mut dyn StatusSink,
    ) -> BTreeSet<Uuid> {
        let mut seen = BTreeSet::new();
        let mut parsed: Vec<(&WalkedFile, std::result::Result<Part, String>)> = Vec::new();

        self.set_phase(UpdatePhase::Parsing);
        for file in files {
            if self.check_cancelled(report) {
                return seen;
            }
            report.files += 1;
            let part = match ItemParser::parse_file(&file.path, ObjectType::Part) {
                Ok(ItemRecord::Part(part)) => Ok(part),
                Ok(other) => Err(format!("expected part, found {}", other.object_type())),
                Err(e) => Err(PoolError::from(e).to_string()),
            };
            parsed.push((file, part));
        }

        let in_pool: HashSet<Uuid> = parsed
            .iter()
            .filter_map(|(_, part)| part.as_ref().ok().map(|p| p.uuid))
            .collect();
        for uuid in previous.into_iter().flatten().filter(|u| !in_pool.contains(*u)) {
            let key = ItemKey::new(ObjectType::Part, *uuid, pool.uuid);
            self.remove_reported(&key, &pool.base_path, report, sink);
        }

        let mut pending = Vec::new();
        for (file, part) in parsed {
            if self.check_cancelled(report) {
                return seen;
            }
            match part {
                Ok(part) if base_ready(&part, &in_pool, &seen) => {
                    self.write_part(pool, file, part, &mut seen, report, sink)
                }
                Ok(part) => pending.push((file, part)),
                Err(message) => self.record_failure(report, &file.path, message, sink),
            }
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for (file, part) in pending {
                if self.check_cancelled(report) {
                    return seen;
                }
                if base_ready(&part, &in_pool, &seen) {
                    self.write_part(pool, file, part, &mut seen, report, sink);
                } else {
                    waiting.push((file, part));
                }
            }
            pending = waiting;
            if pending.len() == before {
                break;
            }
        }
        for (file, part) in pending {
            let message = PoolError::Reference(format!(
                "base part {} of part {} could not be indexed",
                part.base.unwrap_or_default(),
                part.uuid
            ))
            .to_string();
            self.record_failure(report, &file.path, message, sink);
        }
        seen
    }

    fn write_part(
        &mut self,
        pool: &PoolEntry,
        file: &WalkedFile,
        part: Part,
        seen: &mut BTreeSet<Uuid>,
        report: &mut UpdateReport,
        sink: &mut dyn StatusSink,
    ) {
        match self.write_record(pool, &ItemRecord::Part(part), &file.filename) {
            Ok(uuid) => {
                seen.insert(uuid);
                report.written += 1;
                sink.on_status(&StatusEvent::File {
                    path: file.path.clone(),
                    message: String::new(),
                });
            }
            Err(e) => self.record_failure(report, &file.path, e.to_string(), sink),
        }
    }

    /// Parse and write one file. Everything that can go wrong with a single
    /// file surfaces as the returned error.
    fn process_file(&mut self, pool: &PoolEntry, file: &WalkedFile) -> Result<Uuid> {
        self.set_phase(UpdatePhase::Parsing);
        let record = ItemParser::parse_file(&file.path, file.object_type)?;
        self.write_record(pool, &record, &file.filename)
    }

    fn write_record(&mut self, pool: &PoolEntry, record: &ItemRecord, filename: &str) -> Result<Uuid> {
        self.set_phase(UpdatePhase::Writing);
        let entry = self.build_entry(pool, record, filename)?;
        for dep in &entry.dependencies {
            if !self.index.exists_in_any_pool(dep.object_type, &dep.uuid)? {
                warn!(
                    "{} {} references missing {} {}",
                    record.object_type(),
                    record.uuid(),
                    dep.object_type,
                    dep.uuid
                );
            }
        }
        self.index.upsert(&entry)?;
        Ok(record.uuid())
    }

    /// Turn a parsed record into the rows written for it. Based parts pull
    /// their inherited attributes from the base part's indexed row.
    fn build_entry(&self, pool: &PoolEntry, record: &ItemRecord, filename: &str) -> Result<IndexEntry> {
        let mut attributes: BTreeMap<String, AttrValue> = BTreeMap::new();
        let mut set = |key: &str, value: AttrValue| {
            attributes.insert(key.to_string(), value);
        };
        let mut name = record.name().to_string();
        let mut tags = record.tags().to_vec();
        let mut dependencies = extract_dependencies(record);

        match record {
            ItemRecord::Unit(unit) => {
                set("manufacturer", unit.manufacturer.as_str().into());
                set("n_pins", unit.pins.len().into());
            }
            ItemRecord::Symbol(symbol) => {
                set("unit", Some(symbol.unit).into());
            }
            ItemRecord::Entity(entity) => {
                set("manufacturer", entity.manufacturer.as_str().into());
                set("prefix", entity.prefix.as_str().into());
                set("n_gates", entity.gates.len().into());
            }
            ItemRecord::Padstack(padstack) => {
                set("well_known_name", padstack.well_known_name.as_str().into());
                set("padstack_type", padstack.padstack_type.as_str().into());
            }
            ItemRecord::Package(package) => {
                set("manufacturer", package.manufacturer.as_str().into());
                set("n_pads", package.pads.len().into());
                set("alternate_for", package.alternate_for.into());
            }
            ItemRecord::Part(part) => {
                let base = match part.base {
                    Some(base_uuid) => Some(self.base_part(&base_uuid, &part.uuid)?),
                    None => None,
                };
                let inherited = |key: &str| -> String {
                    base.as_ref()
                        .and_then(|b| b.row.attr_str(key))
                        .unwrap_or_default()
                        .to_string()
                };
                name = part.mpn.resolve(base.as_ref().map(|b| b.row.name.as_str()).unwrap_or(""));
                set("manufacturer", part.manufacturer.resolve(&inherited("manufacturer")).into());
                set("value", part.value.resolve(&inherited("value")).into());
                set("description", part.description.resolve(&inherited("description")).into());
                set("datasheet", part.datasheet.resolve(&inherited("datasheet")).into());

                let entity = part.entity.or_else(|| base.as_ref().and_then(|b| b.row.attr_uuid("entity")));
                let package = part.package.or_else(|| base.as_ref().and_then(|b| b.row.attr_uuid("package")));
                set("entity", entity.into());
                set("package", package.into());
                set("base", part.base.into());
                dependencies.extend(entity.map(|u| Dependency::new(ObjectType::Entity, u)));
                dependencies.extend(package.map(|u| Dependency::new(ObjectType::Package, u)));

                if let Some(base) = &base {
                    if part.inherit_tags {
                        tags.extend(base.tags.iter().cloned());
                    }
                }
            }
            ItemRecord::Frame(_) | ItemRecord::Decal(_) => {}
        }

        tags.sort();
        tags.dedup();
        dependencies.sort();
        dependencies.dedup();
        Ok(IndexEntry {
            row: ItemRow {
                object_type: record.object_type(),
                uuid: record.uuid(),
                pool_uuid: pool.uuid,
                name,
                filename: filename.to_string(),
                overridden: false,
                attributes,
            },
            tags,
            dependencies,
        })
    }

    fn base_part(&self, base: &Uuid, part: &Uuid) -> Result<BasePart> {
        let row = resolve(&*self.index, ObjectType::Part, base, &self.registry.stack()).map_err(|e| match e {
            PoolError::NotFound(_) => {
                PoolError::Reference(format!("base part {} of part {} is not indexed", base, part))
            }
            other => other,
        })?;
        let tags = self.index.tags_of(&row.pool_uuid, ObjectType::Part, base)?;
        Ok(BasePart { row, tags })
    }

    /// Re-index items directly depending on `changed`, once each.
    fn refresh_dependents(
        &mut self,
        changed: &[ItemKey],
        report: &mut UpdateReport,
        sink: &mut dyn StatusSink,
    ) {
        let changed_set: HashSet<ItemKey> = changed.iter().copied().collect();
        let mut targets = BTreeSet::new();
        for key in changed {
            match self.index.dependents_of(key.object_type, &key.uuid) {
                Ok(dependents) => {
                    targets.extend(dependents.into_iter().filter(|d| !changed_set.contains(d)));
                }
                Err(e) => {
                    let root = self.registry.get(&key.pool_uuid).map(|p| p.base_path.clone()).unwrap_or_default();
                    let message = format!("cannot look up dependents of {} {}: {}", key.object_type, key.uuid, e);
                    self.record_failure(report, &root, message, sink);
                }
            }
        }

        let registry = self.registry;
        for key in targets {
            if self.check_cancelled(report) {
                break;
            }
            let Some(pool) = registry.get(&key.pool_uuid) else {
                debug!("Skipping dependent {} {} of unregistered pool", key.object_type, key.uuid);
                continue;
            };
            let row = match self.index.get_item(&key.pool_uuid, key.object_type, &key.uuid) {
                Ok(Some(row)) => row,
                Ok(None) => continue,
                Err(e) => {
                    let message = format!("cannot refresh dependent {} {}: {}", key.object_type, key.uuid, e);
                    self.record_failure(report, &pool.base_path, message, sink);
                    continue;
                }
            };
            let file = WalkedFile {
                object_type: key.object_type,
                path: pool.base_path.join(&row.filename),
                filename: row.filename,
            };
            debug!("Refreshing dependent {} {}", key.object_type, key.uuid);
            report.files += 1;
            match self.process_file(pool, &file) {
                Ok(_) => {
                    report.written += 1;
                    sink.on_status(&StatusEvent::File {
                        path: file.path.clone(),
                        message: "refreshed dependent".to_string(),
                    });
                }
                Err(e) => self.record_failure(report, &file.path, e.to_string(), sink),
            }
        }
    }

    /// Delete one row, honouring `cascade_delete`. Returns the number of rows removed.
    fn remove(&mut self, key: &ItemKey) -> Result<usize> {
        if self.options.cascade_delete {
            Ok(self
                .index
                .delete_item_cascade(&key.pool_uuid, key.object_type, &key.uuid)?
                .len())
        } else {
            Ok(usize::from(self.index.delete_item(&key.pool_uuid, key.object_type, &key.uuid)?))
        }
    }

    /// Delete one row, reporting a store error against `path` instead of
    /// returning it. Returns whether the delete went through.
    fn remove_reported(
        &mut self,
        key: &ItemKey,
        path: &Path,
        report: &mut UpdateReport,
        sink: &mut dyn StatusSink,
    ) -> bool {
        match self.remove(key) {
            Ok(removed) => {
                report.deleted += removed;
                true
            }
            Err(e) => {
                let message = format!("cannot remove {} {}: {}", key.object_type, key.uuid, e);
                self.record_failure(report, path, message, sink);
                false
            }
        }
    }

    fn sync_registry(&mut self, root: &Path, report: &mut UpdateReport, sink: &mut dyn StatusSink) {
        if let Err(e) = self.index.sync_registry(self.registry) {
            let message = format!("cannot record pool registry: {}", e);
            self.record_failure(report, root, message, sink);
        }
    }

    fn recompute_overridden(&mut self, root: &Path, report: &mut UpdateReport, sink: &mut dyn StatusSink) {
        if let Err(e) = self.index.recompute_overridden_all() {
            let message = format!("cannot recompute overridden flags: {}", e);
            self.record_failure(report, root, message, sink);
        }
    }

    fn check_cancelled(&self, report: &mut UpdateReport) -> bool {
        if self.options.is_cancelled() {
            report.cancelled = true;
        }
        report.cancelled
    }

    fn record_failure(&mut self, report: &mut UpdateReport, path: &Path, message: String, sink: &mut dyn StatusSink) {
        warn!("Failed to index {}: {}", path.display(), message);
        sink.on_status(&StatusEvent::FileError {
            path: path.to_path_buf(),
            message: message.clone(),
        });
        report.failures.push(FileFailure {
            file: path.to_path_buf(),
            message,
        });
    }

    /// Report a run that could not start and hand back its error.
    fn fail_run(&mut self, root: &Path, error: PoolError, sink: &mut dyn StatusSink) -> PoolError {
        let mut report = UpdateReport::start();
        self.record_failure(&mut report, root, error.to_string(), sink);
        self.finish(report, root, sink);
        error
    }

    fn finish(&mut self, mut report: UpdateReport, root: &Path, sink: &mut dyn StatusSink) -> UpdateReport {
        self.set_phase(UpdatePhase::Done);
        report.finished_at = Utc::now();
        let message = if report.cancelled {
            format!("cancelled after {} files, {} errors", report.files, report.error_count())
        } else {
            format!("{} files, {} errors", report.files, report.error_count())
        };
        info!("Update done: {}", message);
        sink.on_status(&StatusEvent::Done {
            path: root.to_path_buf(),
            message,
            errors: report.error_count(),
        });
        report
    }
}

/// A part can be written once its base is outside this pool's part files or
/// already written in this run.
fn base_ready(part: &Part, in_pool: &HashSet<Uuid>, written: &BTreeSet<Uuid>) -> bool {
    part.base
        .map(|base| !in_pool.contains(&base) || written.contains(&base))
        .unwrap_or(true)
}

struct BasePart {
    row: ItemRow,
    tags: Vec<String>,
}

/// Find the registered pool owning `path`, retrying with canonical paths
/// when the caller and the registry spell the location differently.
fn locate<'r>(registry: &'r PoolRegistry, path: &Path) -> Option<(&'r PoolEntry, PathBuf)> {
    if let Some(pool) = registry.pool_for_path(path) {
        return Some((pool, path.to_path_buf()));
    }
    let canonical = canonical_lenient(path)?;
    registry
        .pools()
        .iter()
        .filter_map(|p| {
            let base = p.base_path.canonicalize().ok()?;
            let rel = canonical.strip_prefix(&base).ok()?;
            Some((p, base.components().count(), p.base_path.join(rel)))
        })
        .max_by_key(|(_, depth, _)| *depth)
        .map(|(p, _, path)| (p, path))
}

/// Canonicalize a path whose last component may no longer exist.
fn canonical_lenient(path: &Path) -> Option<PathBuf> {
    if let Ok(p) = path.canonicalize() {
        return Some(p);
    }
    let parent = path.parent()?.canonicalize().ok()?;
    Some(parent.join(path.file_name()?))
}
