//! Reference resolution for ways and relations
//!
//! Lookups for one element's refs run concurrently against the cache and are
//! all awaited before the element moves on. Missing refs are normal, since
//! bounded extracts cut off referenced elements, and are skipped silently.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use serde::Serialize;

use crate::core::cache::{CacheStore, ReferenceCache};
use crate::core::element::{ElementType, Record, Relation, Way};
use crate::core::error::Result;

/// Objects referenced by a way
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WayRelated {
    /// `[lat, lon]` of every resolved ref carrying coordinates, in ref order
    pub polyline: Vec<[f64; 2]>,
    /// Resolved points by id
    pub points: BTreeMap<i64, Record>,
}

/// Objects referenced by a relation, bucketed by member type
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelationRelated {
    pub points: BTreeMap<i64, Record>,
    pub ways: BTreeMap<i64, Record>,
    pub relations: BTreeMap<i64, Record>,
}

impl RelationRelated {
    pub fn bucket(&self, kind: ElementType) -> &BTreeMap<i64, Record> {
        match kind {
            ElementType::Point => &self.points,
            ElementType::Way => &self.ways,
            ElementType::Relation => &self.relations,
        }
    }

    fn bucket_mut(&mut self, kind: ElementType) -> &mut BTreeMap<i64, Record> {
        match kind {
            ElementType::Point => &mut self.points,
            ElementType::Way => &mut self.ways,
            ElementType::Relation => &mut self.relations,
        }
    }
}

/// Related-objects bundle handed to a hook alongside its element
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Related {
    /// Points reference nothing
    #[default]
    None,
    Way(WayRelated),
    Relation(RelationRelated),
}

impl Related {
    pub fn as_way(&self) -> Option<&WayRelated> {
        match self {
            Related::Way(related) => Some(related),
            _ => None,
        }
    }

    pub fn as_relation(&self) -> Option<&RelationRelated> {
        match self {
            Related::Relation(related) => Some(related),
            _ => None,
        }
    }
}

fn coordinates(record: &Record) -> Option<[f64; 2]> {
    let lat = record.get("lat")?.as_f64()?;
    let lon = record.get("lon")?.as_f64()?;
    Some([lat, lon])
}

/// Resolve a way's point refs into a polyline and a points bundle
pub async fn resolve_way<S: CacheStore>(cache: &ReferenceCache<S>, way: &Way) -> Result<WayRelated> {
    let lookups = way
        .nodes
        .iter()
        .map(|&id| async move { cache.get(ElementType::Point, id).await.map(|hit| (id, hit)) });
    let results = try_join_all(lookups).await?;

    let mut related = WayRelated::default();
    for (id, hit) in results {
        let Some(record) = hit else { continue };
        if let Some(coordinate) = coordinates(&record) {
            related.polyline.push(coordinate);
        }
        related.points.insert(id, record);
    }

    Ok(related)
}

/// Resolve a relation's members by their declared type
pub async fn resolve_relation<S: CacheStore>(
    cache: &ReferenceCache<S>,
    relation: &Relation,
) -> Result<RelationRelated> {
    let lookups = relation.members.iter().map(|member| async move {
        cache
            .get(member.kind, member.reference)
            .await
            .map(|hit| (member.kind, member.reference, hit))
    });
    let results = try_join_all(lookups).await?;

    let mut related = RelationRelated::default();
    for (kind, id, hit) in results {
        if let Some(record) = hit {
            related.bucket_mut(kind).insert(id, record);
        }
    }

    Ok(related)
}
