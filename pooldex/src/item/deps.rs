//! Outgoing references of pool items.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ItemRecord, ObjectType};

/// Target of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    pub object_type: ObjectType,
    pub uuid: Uuid,
}

impl Dependency {
    pub fn new(object_type: ObjectType, uuid: Uuid) -> Self {
        Self { object_type, uuid }
    }
}

/// Items referenced by `item`, sorted and without duplicates.
///
/// Only the file content is looked at; whether the targets exist is decided
/// when the item is written to the index.
pub fn extract_dependencies(item: &ItemRecord) -> Vec<Dependency> {
    let mut deps = Vec::new();
    match item {
        ItemRecord::Symbol(symbol) => {
            deps.push(Dependency::new(ObjectType::Unit, symbol.unit));
        }
        ItemRecord::Entity(entity) => {
            deps.extend(entity.gates.iter().map(|g| Dependency::new(ObjectType::Unit, g.unit)));
        }
        ItemRecord::Package(package) => {
            deps.extend(
                package
                    .pads
                    .iter()
                    .map(|p| Dependency::new(ObjectType::Padstack, p.padstack)),
            );
            if let Some(alt) = package.alternate_for {
                deps.push(Dependency::new(ObjectType::Package, alt));
            }
        }
        ItemRecord::Part(part) => {
            if let Some(entity) = part.entity {
                deps.push(Dependency::new(ObjectType::Entity, entity));
            }
            if let Some(package) = part.package {
                deps.push(Dependency::new(ObjectType::Package, package));
            }
            if let Some(base) = part.base {
                deps.push(Dependency::new(ObjectType::Part, base));
            }
        }
        ItemRecord::Unit(_) | ItemRecord::Padstack(_) | ItemRecord::Frame(_) | ItemRecord::Decal(_) => {}
    }
    let own = item.uuid();
    deps.retain(|d| d.uuid != own);
    deps.sort();
    deps.dedup();
    deps
}
