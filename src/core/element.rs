//! OSM element data model
//!
//! Elements share a common attribute set and are discriminated on the wire by
//! a `type` field. Anything a hook emits is a [`Record`], which may or may not
//! still look like an element.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// A structured output record, as routed to collections and cached
pub type Record = serde_json::Value;

/// Discriminator for the three OSM primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    #[serde(alias = "node")]
    Point,
    Way,
    Relation,
}

impl ElementType {
    pub const ALL: [ElementType; 3] = [ElementType::Point, ElementType::Way, ElementType::Relation];

    /// Wire name, also used as the cache key prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Point => "point",
            ElementType::Way => "way",
            ElementType::Relation => "relation",
        }
    }

    /// Name of the collection elements of this type are routed to by default
    pub fn default_collection(&self) -> &'static str {
        match self {
            ElementType::Point => "points",
            ElementType::Way => "ways",
            ElementType::Relation => "relations",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "point" | "node" => Ok(ElementType::Point),
            "way" => Ok(ElementType::Way),
            "relation" => Ok(ElementType::Relation),
            other => Err(Error::Decode(format!("unknown element type '{other}'"))),
        }
    }
}

fn default_visible() -> bool {
    true
}

/// Attributes shared by every element
///
/// See <http://wiki.openstreetmap.org/wiki/Data_Primitives#Common_attributes>.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Common {
    pub id: i64,

    /// Bulk-import document key, usually the id rendered as a string
    #[serde(rename = "_key", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default = "default_visible")]
    pub visible: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset: Option<i64>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Common {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            visible: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(flatten)]
    pub common: Common,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Way {
    #[serde(flatten)]
    pub common: Common,

    /// Ordered point refs describing the way's shape; ids may repeat
    #[serde(default)]
    pub nodes: Vec<i64>,
}

/// One typed reference inside a relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "type")]
    pub kind: ElementType,
    #[serde(rename = "ref")]
    pub reference: i64,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(flatten)]
    pub common: Common,
    #[serde(default)]
    pub members: Vec<Member>,
}

/// A point, way or relation parsed from an extract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Element {
    #[serde(alias = "node")]
    Point(Point),
    Way(Way),
    Relation(Relation),
}

impl Element {
    /// Decode one element from its JSON wire form
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn kind(&self) -> ElementType {
        match self {
            Element::Point(_) => ElementType::Point,
            Element::Way(_) => ElementType::Way,
            Element::Relation(_) => ElementType::Relation,
        }
    }

    pub fn common(&self) -> &Common {
        match self {
            Element::Point(p) => &p.common,
            Element::Way(w) => &w.common,
            Element::Relation(r) => &r.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut Common {
        match self {
            Element::Point(p) => &mut p.common,
            Element::Way(w) => &mut w.common,
            Element::Relation(r) => &mut r.common,
        }
    }

    pub fn id(&self) -> i64 {
        self.common().id
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.common().tags
    }

    /// Convert into the structured form that gets cached and routed
    pub fn to_record(&self) -> Result<Record> {
        Ok(serde_json::to_value(self)?)
    }
}

impl From<Point> for Element {
    fn from(point: Point) -> Self {
        Element::Point(point)
    }
}

impl From<Way> for Element {
    fn from(way: Way) -> Self {
        Element::Way(way)
    }
}

impl From<Relation> for Element {
    fn from(relation: Relation) -> Self {
        Element::Relation(relation)
    }
}
