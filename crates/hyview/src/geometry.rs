//! Host-agnostic representation of point geometry.
//!
//! A [`Geometry`] is a list of attribute definitions plus either a flat list of
//! points or a list of primitives grouping points. Attribute values are opaque
//! JSON here; their meaning is up to the host's scene builder.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::c4::{Datum, Identifier};
use crate::error::{Error, Result};

/// Check that `name` can name a host node: non-empty, starting with an ASCII
/// letter.
pub fn validate_name(name: &str) -> Result<()> {
    match name.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => Ok(()),
        _ => Err(Error::InvalidName(name.to_string())),
    }
}

/// Where an attribute lives on the host geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeDomain {
    /// One value for the whole geometry.
    Global,
    /// One value per point.
    Point,
    /// One value per primitive.
    Prim,
    /// One value per vertex.
    Vertex,
}

impl AttributeDomain {
    /// Every supported domain.
    pub const ALL: [AttributeDomain; 4] = [
        AttributeDomain::Global,
        AttributeDomain::Point,
        AttributeDomain::Prim,
        AttributeDomain::Vertex,
    ];

    /// Name used on the wire and by the host.
    pub fn as_str(self) -> &'static str {
        match self {
            AttributeDomain::Global => "Global",
            AttributeDomain::Point => "Point",
            AttributeDomain::Prim => "Prim",
            AttributeDomain::Vertex => "Vertex",
        }
    }
}

impl fmt::Display for AttributeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| Error::UnknownDomain(s.to_string()))
    }
}

/// Declaration of a custom attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Attribute name, e.g. `Cd`.
    pub name: String,
    /// Domain the attribute is created on.
    pub domain: AttributeDomain,
    /// Value used where a point does not set the attribute.
    #[serde(default = "default_attribute_value")]
    pub default: Value,
}

fn default_attribute_value() -> Value {
    Value::from(-1)
}

impl AttributeDefinition {
    /// Define an attribute.
    pub fn new(name: impl Into<String>, domain: AttributeDomain, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            domain,
            default: default.into(),
        }
    }

    /// Define an attribute from a domain name, rejecting unknown domains.
    pub fn parse(name: impl Into<String>, domain: &str, default: impl Into<Value>) -> Result<Self> {
        Ok(Self::new(name, domain.parse()?, default))
    }

    /// Define an attribute with the `-1` default.
    pub fn with_default(name: impl Into<String>, domain: AttributeDomain) -> Self {
        Self::new(name, domain, default_attribute_value())
    }
}

/// A point and its attribute values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// X position.
    pub x: f64,
    /// Y position.
    pub y: f64,
    /// Z position.
    pub z: f64,
    /// Attribute values by name.
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

impl Point {
    /// A point with no attribute values.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            attrs: BTreeMap::new(),
        }
    }

    /// Set an attribute value.
    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Position as a tuple.
    pub fn pos(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }
}

/// A group of points.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Primitive {
    /// Member points in order.
    pub points: Vec<Point>,
    /// Primitive attribute values by name.
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

impl Primitive {
    /// A primitive over `points`.
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points,
            attrs: BTreeMap::new(),
        }
    }
}

/// Points either as a flat list or grouped into primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryBody {
    /// Flat point list.
    Points(Vec<Point>),
    /// Points grouped by primitive.
    Primitives(Vec<Primitive>),
}

impl Default for GeometryBody {
    fn default() -> Self {
        GeometryBody::Points(Vec::new())
    }
}

/// Geometry to build on the host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Geometry {
    /// Attribute definitions, applied in this order.
    pub attributes: Vec<AttributeDefinition>,
    /// The points.
    pub body: GeometryBody,
}

impl Geometry {
    /// Geometry from a flat list of points.
    pub fn from_points(attributes: Vec<AttributeDefinition>, points: Vec<Point>) -> Self {
        Self {
            attributes,
            body: GeometryBody::Points(points),
        }
    }

    /// Geometry from primitives.
    pub fn from_primitives(attributes: Vec<AttributeDefinition>, primitives: Vec<Primitive>) -> Self {
        Self {
            attributes,
            body: GeometryBody::Primitives(primitives),
        }
    }

    /// Check that every coordinate is finite.
    ///
    /// JSON has no NaN or infinity, so such points could neither be named
    /// apart nor sent to the host.
    pub fn validate(&self) -> Result<()> {
        for (index, point) in self.points().enumerate() {
            let (x, y, z) = point.pos();
            if !(x.is_finite() && y.is_finite() && z.is_finite()) {
                return Err(Error::InvalidGeometry(format!(
                    "point {index} has a non-finite coordinate ({x}, {y}, {z})"
                )));
            }
        }
        Ok(())
    }

    /// Content identifier of this geometry, used as the default build name.
    ///
    /// Always starts with `c4`, so it is a valid node name. Fails for
    /// geometry that does not [`validate`](Geometry::validate).
    pub fn identifier(&self) -> Result<Identifier> {
        self.validate()?;
        Ok(Identifier::of([Datum::structured(self)?])?)
    }

    /// All points in order, flattening primitives.
    pub fn points(&self) -> Box<dyn Iterator<Item = &Point> + '_> {
        match &self.body {
            GeometryBody::Points(points) => Box::new(points.iter()),
            GeometryBody::Primitives(prims) => Box::new(prims.iter().flat_map(|p| p.points.iter())),
        }
    }

    /// Total number of points.
    pub fn point_count(&self) -> usize {
        match &self.body {
            GeometryBody::Points(points) => points.len(),
            GeometryBody::Primitives(prims) => prims.iter().map(|p| p.points.len()).sum(),
        }
    }

    /// Advance `cursor` to the next point.
    ///
    /// Lets a caller walk the points without holding a borrow across await
    /// points.
    pub fn next_point(&self, cursor: &mut PointCursor) -> Option<&Point> {
        match &self.body {
            GeometryBody::Points(points) => {
                let point = points.get(cursor.point)?;
                cursor.point += 1;
                Some(point)
            }
            GeometryBody::Primitives(prims) => loop {
                let prim = prims.get(cursor.prim)?;
                if let Some(point) = prim.points.get(cursor.point) {
                    cursor.point += 1;
                    return Some(point);
                }
                cursor.prim += 1;
                cursor.point = 0;
            },
        }
    }
}

/// Position within a [`Geometry`]'s points. See [`Geometry::next_point`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointCursor {
    prim: usize,
    point: usize,
}
