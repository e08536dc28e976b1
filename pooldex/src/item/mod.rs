//! Typed records for pool items.
//!
//! Every artifact in a pool is one JSON file describing one item. The parser
//! in [`parser`] turns such a file into an [`ItemRecord`], and [`deps`]
//! derives the items it references.

pub mod deps;
pub mod parser;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use deps::{extract_dependencies, Dependency};
pub use parser::{ItemParser, ParseError};

/// Kind of pool item.
///
/// The declaration order is the index order: an item only references items of
/// types declared before its own (parts may also reference other parts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Unit,
    Symbol,
    Entity,
    Padstack,
    Package,
    Part,
    Frame,
    Decal,
}

impl ObjectType {
    /// All types in index order.
    pub const ALL: [ObjectType; 8] = [
        ObjectType::Unit,
        ObjectType::Symbol,
        ObjectType::Entity,
        ObjectType::Padstack,
        ObjectType::Package,
        ObjectType::Part,
        ObjectType::Frame,
        ObjectType::Decal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Unit => "unit",
            ObjectType::Symbol => "symbol",
            ObjectType::Entity => "entity",
            ObjectType::Padstack => "padstack",
            ObjectType::Package => "package",
            ObjectType::Part => "part",
            ObjectType::Frame => "frame",
            ObjectType::Decal => "decal",
        }
    }

    /// Name of the index table holding items of this type.
    pub fn table(&self) -> &'static str {
        match self {
            ObjectType::Unit => "units",
            ObjectType::Symbol => "symbols",
            ObjectType::Entity => "entities",
            ObjectType::Padstack => "padstacks",
            ObjectType::Package => "packages",
            ObjectType::Part => "parts",
            ObjectType::Frame => "frames",
            ObjectType::Decal => "decals",
        }
    }

    /// Top-level directory of this type inside a pool root.
    pub fn directory(&self) -> &'static str {
        self.table()
    }

    /// Position in index order.
    pub fn index_order(&self) -> usize {
        Self::ALL.iter().position(|t| t == self).unwrap_or(Self::ALL.len())
    }

    /// Most recent on-disk schema version understood for this type.
    pub fn schema_version(&self) -> u32 {
        match self {
            ObjectType::Unit => 0,
            ObjectType::Symbol => 1,
            ObjectType::Entity => 0,
            ObjectType::Padstack => 2,
            ObjectType::Package => 2,
            ObjectType::Part => 1,
            ObjectType::Frame => 0,
            ObjectType::Decal => 0,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub uuid: Uuid,
    pub name: String,
    pub manufacturer: String,
    pub pins: Vec<UnitPin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPin {
    pub uuid: Uuid,
    pub primary_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub uuid: Uuid,
    pub name: String,
    pub unit: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub uuid: Uuid,
    pub name: String,
    pub manufacturer: String,
    pub prefix: String,
    pub tags: Vec<String>,
    pub gates: Vec<Gate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub uuid: Uuid,
    pub name: String,
    pub suffix: String,
    pub unit: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Padstack {
    pub uuid: Uuid,
    pub name: String,
    pub well_known_name: String,
    pub padstack_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub uuid: Uuid,
    pub name: String,
    pub manufacturer: String,
    pub tags: Vec<String>,
    pub pads: Vec<Pad>,
    pub alternate_for: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pad {
    pub uuid: Uuid,
    pub name: String,
    pub padstack: Uuid,
}

/// A part attribute that is either set locally or taken from the base part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attribute {
    Own(String),
    Inherited,
}

impl Attribute {
    pub fn own(&self) -> Option<&str> {
        match self {
            Attribute::Own(s) => Some(s),
            Attribute::Inherited => None,
        }
    }

    pub fn is_inherited(&self) -> bool {
        matches!(self, Attribute::Inherited)
    }

    /// The local value, or `inherited` if the attribute comes from the base.
    pub fn resolve(&self, inherited: &str) -> String {
        match self {
            Attribute::Own(s) => s.clone(),
            Attribute::Inherited => inherited.to_string(),
        }
    }
}

impl Default for Attribute {
    fn default() -> Self {
        Attribute::Own(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub uuid: Uuid,
    pub mpn: Attribute,
    pub manufacturer: Attribute,
    pub value: Attribute,
    pub description: Attribute,
    pub datasheet: Attribute,
    /// `None` only for parts with a base, in which case the base's entity is used.
    pub entity: Option<Uuid>,
    pub package: Option<Uuid>,
    pub base: Option<Uuid>,
    pub inherit_tags: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decal {
    pub uuid: Uuid,
    pub name: String,
}

/// A parsed pool item of any type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemRecord {
    Unit(Unit),
    Symbol(Symbol),
    Entity(Entity),
    Padstack(Padstack),
    Package(Package),
    Part(Part),
    Frame(Frame),
    Decal(Decal),
}

impl ItemRecord {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ItemRecord::Unit(_) => ObjectType::Unit,
            ItemRecord::Symbol(_) => ObjectType::Symbol,
            ItemRecord::Entity(_) => ObjectType::Entity,
            ItemRecord::Padstack(_) => ObjectType::Padstack,
            ItemRecord::Package(_) => ObjectType::Package,
            ItemRecord::Part(_) => ObjectType::Part,
            ItemRecord::Frame(_) => ObjectType::Frame,
            ItemRecord::Decal(_) => ObjectType::Decal,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            ItemRecord::Unit(x) => x.uuid,
            ItemRecord::Symbol(x) => x.uuid,
            ItemRecord::Entity(x) => x.uuid,
            ItemRecord::Padstack(x) => x.uuid,
            ItemRecord::Package(x) => x.uuid,
            ItemRecord::Part(x) => x.uuid,
            ItemRecord::Frame(x) => x.uuid,
            ItemRecord::Decal(x) => x.uuid,
        }
    }

    /// Display name. For parts this is the locally set MPN, if any.
    pub fn name(&self) -> &str {
        match self {
            ItemRecord::Unit(x) => &x.name,
            ItemRecord::Symbol(x) => &x.name,
            ItemRecord::Entity(x) => &x.name,
            ItemRecord::Padstack(x) => &x.name,
            ItemRecord::Package(x) => &x.name,
            ItemRecord::Part(x) => x.mpn.own().unwrap_or(""),
            ItemRecord::Frame(x) => &x.name,
            ItemRecord::Decal(x) => &x.name,
        }
    }

    /// Tags stored with the item itself (not including inherited ones).
    pub fn tags(&self) -> &[String] {
        match self {
            ItemRecord::Entity(x) => &x.tags,
            ItemRecord::Package(x) => &x.tags,
            ItemRecord::Part(x) => &x.tags,
            _ => &[],
        }
    }
}
