//! Flattened wire forms of the geometry model.
//!
//! These are what the host pulls through `iterAttributes` and `iterPoints`,
//! one JSON object per stream chunk.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::geometry::{AttributeDefinition, Point};

/// Wire form of an [`AttributeDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    /// Attribute name.
    pub name: String,
    /// Domain name, one of `Global`, `Point`, `Prim` or `Vertex`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Default value.
    pub default: Value,
}

impl From<&AttributeDefinition> for AttributeRecord {
    fn from(def: &AttributeDefinition) -> Self {
        Self {
            name: def.name.clone(),
            kind: def.domain.as_str().to_string(),
            default: def.default.clone(),
        }
    }
}

impl TryFrom<AttributeRecord> for AttributeDefinition {
    type Error = Error;

    fn try_from(record: AttributeRecord) -> Result<Self> {
        AttributeDefinition::parse(record.name, &record.kind, record.default)
    }
}

/// Wire form of a [`Point`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PointRecord {
    /// X position.
    pub x: f64,
    /// Y position.
    pub y: f64,
    /// Z position.
    pub z: f64,
    /// Attribute values.
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

impl From<&Point> for PointRecord {
    fn from(point: &Point) -> Self {
        Self {
            x: point.x,
            y: point.y,
            z: point.z,
            attrs: point.attrs.clone(),
        }
    }
}

impl From<PointRecord> for Point {
    fn from(record: PointRecord) -> Self {
        Self {
            x: record.x,
            y: record.y,
            z: record.z,
            attrs: record.attrs,
        }
    }
}
