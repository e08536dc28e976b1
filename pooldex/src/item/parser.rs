//! Pool item file parser
//!
//! Item files are JSON objects. Every file names its own type in `"type"` and
//! may carry a `"version"` (absent means 0). Each type has a current schema
//! version, see [`ObjectType::schema_version`]; files written by a newer
//! schema are rejected instead of being read partially.
//!
//! Part attributes (`MPN`, `manufacturer`, `value`, `description`,
//! `datasheet`) are either a plain string or an `[inherit, value]` pair, where
//! `inherit == true` takes the value from the part's `base`.

use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::*;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid item format: {0}")]
    InvalidFormat(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid UUID in field {field}: {value:?}")]
    InvalidUuid { field: String, value: String },
    #[error("Unknown item type: {0}")]
    UnknownType(String),
    #[error("Expected a {expected} file, found {found}")]
    TypeMismatch { expected: ObjectType, found: String },
    #[error("Unsupported {object_type} schema version {found} (supported up to {supported})")]
    UnsupportedVersion {
        object_type: ObjectType,
        found: u64,
        supported: u32,
    },
    #[error("Unresolved reference: {0}")]
    Reference(String),
}

/// Parser for pool item files.
pub struct ItemParser;

impl ItemParser {
    /// Parse an item file whose type is known from its location in the pool.
    pub fn parse_file(path: &Path, expected: ObjectType) -> Result<ItemRecord, ParseError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content, Some(expected))
    }

    /// Parse item JSON. With `expected` set, a file of another type is an error.
    pub fn parse_str(content: &str, expected: Option<ObjectType>) -> Result<ItemRecord, ParseError> {
        let root: Value = serde_json::from_str(content)?;
        let obj = root
            .as_object()
            .ok_or_else(|| ParseError::InvalidFormat("Expected a JSON object at top level".to_string()))?;
        let fields = Fields(obj);

        let type_name = fields.str("type")?;
        let object_type = match (type_name.parse::<ObjectType>(), expected) {
            (Ok(found), Some(expected)) if found != expected => {
                return Err(ParseError::TypeMismatch {
                    expected,
                    found: type_name.to_string(),
                })
            }
            (Err(_), Some(expected)) => {
                return Err(ParseError::TypeMismatch {
                    expected,
                    found: type_name.to_string(),
                })
            }
            (Ok(found), _) => found,
            (Err(e), None) => return Err(e),
        };

        let version = match obj.get("version") {
            None => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ParseError::InvalidFormat("version must be a non-negative integer".to_string()))?,
        };
        if version > u64::from(object_type.schema_version()) {
            return Err(ParseError::UnsupportedVersion {
                object_type,
                found: version,
                supported: object_type.schema_version(),
            });
        }

        let uuid = fields.uuid("uuid")?;
        let record = match object_type {
            ObjectType::Unit => ItemRecord::Unit(Unit {
                uuid,
                name: fields.str("name")?.to_string(),
                manufacturer: fields.opt_str("manufacturer").to_string(),
                pins: fields
                    .keyed("pins")?
                    .into_iter()
                    .map(|(uuid, pin)| {
                        Ok(UnitPin {
                            uuid,
                            primary_name: pin.str("primary_name")?.to_string(),
                        })
                    })
                    .collect::<Result<_, ParseError>>()?,
            }),
            ObjectType::Symbol => ItemRecord::Symbol(Symbol {
                uuid,
                name: fields.str("name")?.to_string(),
                unit: fields.uuid("unit")?,
            }),
            ObjectType::Entity => {
                let gates = fields
                    .keyed("gates")?
                    .into_iter()
                    .map(|(uuid, gate)| {
                        Ok(Gate {
                            uuid,
                            name: gate.str("name")?.to_string(),
                            suffix: gate.opt_str("suffix").to_string(),
                            unit: gate.uuid("unit")?,
                        })
                    })
                    .collect::<Result<Vec<_>, ParseError>>()?;
                if gates.is_empty() {
                    return Err(ParseError::InvalidFormat("Entity has no gates".to_string()));
                }
                ItemRecord::Entity(Entity {
                    uuid,
                    name: fields.str("name")?.to_string(),
                    manufacturer: fields.opt_str("manufacturer").to_string(),
                    prefix: fields.str("prefix")?.to_string(),
                    tags: fields.tags()?,
                    gates,
                })
            }
            ObjectType::Padstack => ItemRecord::Padstack(Padstack {
                uuid,
                name: fields.str("name")?.to_string(),
                well_known_name: fields.opt_str("well_known_name").to_string(),
                padstack_type: match fields.opt_str("padstack_type") {
                    "" => "top".to_string(),
                    t => t.to_string(),
                },
            }),
            ObjectType::Package => ItemRecord::Package(Package {
                uuid,
                name: fields.str("name")?.to_string(),
                manufacturer: fields.opt_str("manufacturer").to_string(),
                tags: fields.tags()?,
                pads: fields
                    .keyed("pads")?
                    .into_iter()
                    .map(|(uuid, pad)| {
                        Ok(Pad {
                            uuid,
                            name: pad.str("name")?.to_string(),
                            padstack: pad.uuid("padstack")?,
                        })
                    })
                    .collect::<Result<_, ParseError>>()?,
                alternate_for: fields.opt_uuid("alternate_for")?,
            }),
            ObjectType::Part => ItemRecord::Part(Self::parse_part(uuid, &fields)?),
            ObjectType::Frame => ItemRecord::Frame(Frame {
                uuid,
                name: fields.str("name")?.to_string(),
            }),
            ObjectType::Decal => ItemRecord::Decal(Decal {
                uuid,
                name: fields.str("name")?.to_string(),
            }),
        };
        Ok(record)
    }

    fn parse_part(uuid: Uuid, fields: &Fields<'_>) -> Result<Part, ParseError> {
        let base = fields.opt_uuid("base")?;
        let part = Part {
            uuid,
            mpn: fields.attribute("MPN", true)?,
            manufacturer: fields.attribute("manufacturer", false)?,
            value: fields.attribute("value", false)?,
            description: fields.attribute("description", false)?,
            datasheet: fields.attribute("datasheet", false)?,
            entity: fields.opt_uuid("entity")?,
            package: fields.opt_uuid("package")?,
            base,
            inherit_tags: fields.opt_bool("inherit_tags")?,
            tags: fields.tags()?,
        };

        match base {
            Some(base) if base == uuid => {
                return Err(ParseError::Reference(format!("part {} uses itself as base", uuid)));
            }
            Some(_) => {}
            None => {
                if part.entity.is_none() {
                    return Err(ParseError::MissingField("entity".to_string()));
                }
                if part.package.is_none() {
                    return Err(ParseError::MissingField("package".to_string()));
                }
                let inherited = [
                    ("MPN", &part.mpn),
                    ("manufacturer", &part.manufacturer),
                    ("value", &part.value),
                    ("description", &part.description),
                    ("datasheet", &part.datasheet),
                ];
                if let Some((name, _)) = inherited.iter().find(|(_, a)| a.is_inherited()) {
                    return Err(ParseError::Reference(format!(
                        "{} is inherited but the part has no base",
                        name
                    )));
                }
                if part.inherit_tags {
                    return Err(ParseError::Reference(
                        "tags are inherited but the part has no base".to_string(),
                    ));
                }
            }
        }
        Ok(part)
    }
}

/// Field accessors over one JSON object with typed errors.
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn str(&self, key: &str) -> Result<&'a str, ParseError> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::MissingField(key.to_string()))
    }

    fn opt_str(&self, key: &str) -> &'a str {
        self.0.get(key).and_then(Value::as_str).unwrap_or("")
    }

    fn opt_bool(&self, key: &str) -> Result<bool, ParseError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(ParseError::InvalidFormat(format!("{} must be a boolean", key))),
        }
    }

    fn uuid(&self, key: &str) -> Result<Uuid, ParseError> {
        parse_uuid(key, self.str(key)?)
    }

    fn opt_uuid(&self, key: &str) -> Result<Option<Uuid>, ParseError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => parse_uuid(key, s).map(Some),
            Some(other) => Err(ParseError::InvalidUuid {
                field: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    fn tags(&self) -> Result<Vec<String>, ParseError> {
        let Some(value) = self.0.get("tags") else {
            return Ok(Vec::new());
        };
        let list = value
            .as_array()
            .ok_or_else(|| ParseError::InvalidFormat("tags must be an array".to_string()))?;
        let mut tags = list
            .iter()
            .map(|t| {
                t.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ParseError::InvalidFormat("tags must be strings".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// Entries of an object keyed by UUID, sorted by key.
    fn keyed(&self, key: &str) -> Result<Vec<(Uuid, Fields<'a>)>, ParseError> {
        let map = match self.0.get(key) {
            None => return Ok(Vec::new()),
            Some(v) => v
                .as_object()
                .ok_or_else(|| ParseError::InvalidFormat(format!("{} must be an object", key)))?,
        };
        let mut entries = map
            .iter()
            .map(|(k, v)| {
                let obj = v
                    .as_object()
                    .ok_or_else(|| ParseError::InvalidFormat(format!("{}.{} must be an object", key, k)))?;
                Ok((parse_uuid(key, k)?, Fields(obj)))
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        entries.sort_by_key(|(uuid, _)| *uuid);
        Ok(entries)
    }

    fn attribute(&self, key: &str, required: bool) -> Result<Attribute, ParseError> {
        match self.0.get(key) {
            None | Some(Value::Null) if required => Err(ParseError::MissingField(key.to_string())),
            None | Some(Value::Null) => Ok(Attribute::default()),
            Some(Value::String(s)) => Ok(Attribute::Own(s.clone())),
            Some(Value::Array(pair)) => match pair.as_slice() {
                [Value::Bool(true), _] => Ok(Attribute::Inherited),
                [Value::Bool(false), Value::String(s)] => Ok(Attribute::Own(s.clone())),
                _ => Err(ParseError::InvalidFormat(format!(
                    "{} must be a string or an [inherit, value] pair",
                    key
                ))),
            },
            Some(_) => Err(ParseError::InvalidFormat(format!("{} must be a string", key))),
        }
    }
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, ParseError> {
    Uuid::parse_str(value).map_err(|_| ParseError::InvalidUuid {
        field: field.to_string(),
        value: value.to_string(),
    })
}
