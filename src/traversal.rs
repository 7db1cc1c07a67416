//! C3: the bounded breadth/depth walk used by the Clustering Pipeline to
//! "grow" a cluster from a seed object (§4.3). Recursion depth is bounded by
//! the object graph itself — `alreadyVisited` guarantees each key is
//! expanded at most once, so the walk always terminates.

use std::collections::BTreeMap;

use log::debug;

use crate::geometry;
use crate::model::{Activities, Geometry, MemberObject};
use crate::store::{ObjectStore, SearchContext, SearchType};

/// Design constant: maximum single-hop distance for a non-fixed search area.
pub const MAX_HOP_KM: f64 = 0.5;

fn split_polygons(geom: &Geometry) -> Vec<Geometry> {
    match geom {
        Geometry::MultiPolygon(mp) => mp.iter().cloned().map(Geometry::Polygon).collect(),
        other => vec![other.clone()],
    }
}

/// Walks outward from `seed_geometry` (the geometry of the object `ctx.id`
/// was derived from, or the fixed search polygon), returning every object
/// found, deduplicated via `ctx.already_visited`. The seed itself is not
/// included — callers that need it in the union add it separately, since
/// the seed is often a SkiArea (not a `MemberObject`).
pub async fn walk(
    store: &dyn ObjectStore,
    seed_geometry: &Geometry,
    seed_activities: &Activities,
    ctx: &mut SearchContext,
) -> Result<Vec<MemberObject>, crate::error::StorageError> {
    let search_area = match &ctx.search_polygon {
        Some(p) => Some(p.clone()),
        None => geometry::buffer_to_polygon(seed_geometry, MAX_HOP_KM),
    };

    let Some(search_area) = search_area else {
        debug!("buffering failed for {}, stopping walk", ctx.id);
        return Ok(Vec::new());
    };

    // Filter ctx.activities to those also present on the object; if the
    // intersection is empty, keep ctx.activities unchanged to avoid
    // dead-ending on objects with incomplete tags (§4.3 step 3).
    let filtered: Activities = ctx.activities.intersection(seed_activities).copied().collect();
    if !filtered.is_empty() {
        ctx.activities = filtered;
    }

    let mut found = Vec::new();
    for part in split_polygons(&search_area) {
        let neighbors = store.find_nearby_objects(&part, ctx).await?;

        if ctx.is_fixed_search_area {
            found.extend(neighbors);
            continue;
        }

        for neighbor in neighbors {
            let neighbor_geom = neighbor.geometry().clone();
            let neighbor_activities = neighbor.activities();
            found.push(neighbor);
            let nested = Box::pin(walk(store, &neighbor_geom, &neighbor_activities, ctx)).await?;
            found.extend(nested);
        }
    }

    Ok(dedupe_by_id(found))
}

fn dedupe_by_id(objects: Vec<MemberObject>) -> Vec<MemberObject> {
    let mut by_id: BTreeMap<String, MemberObject> = BTreeMap::new();
    for obj in objects {
        by_id.entry(obj.id().to_string()).or_insert(obj);
    }
    by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activity, Flags, Kind, Run};
    use crate::store::memory::MemoryStore;
    use crate::store::{Record, SkiAreaFilter};
    use std::collections::BTreeSet;

    fn point_run(id: &str, lon: f64, lat: f64, activities: &[Activity]) -> Run {
        Run {
            id: id.to_string(),
            difficulty: None,
            geometry: Geometry::Point(geo::Point::new(lon, lat)),
            geometry_with_elevation: None,
            activities: activities.iter().copied().collect::<BTreeSet<_>>(),
            flags: Flags::default(),
            ski_areas: Default::default(),
            raster_pixels: vec![],
            is_groomed: false,
            has_snowmaking: false,
            has_snowfarming: false,
        }
    }

    fn ctx(id: &str, activities: &[Activity]) -> SearchContext {
        SearchContext {
            id: id.to_string(),
            activities: activities.iter().copied().collect(),
            search_type: SearchType::Intersects,
            is_fixed_search_area: false,
            search_polygon: None,
            already_visited: vec![],
            exclude_objects_already_in_ski_area: false,
            buffer_distance_km: Some(MAX_HOP_KM),
        }
    }

    #[tokio::test]
    async fn walk_visits_each_key_at_most_once() {
        let store = MemoryStore::new();
        store
            .save_many(vec![
                Record::Run(point_run("run-a", 0.0, 0.0, &[Activity::Downhill])),
                Record::Run(point_run("run-b", 0.0001, 0.0001, &[Activity::Downhill])),
            ])
            .await
            .unwrap();

        let seed = Geometry::Point(geo::Point::new(0.0, 0.0));
        let seed_activities: Activities = [Activity::Downhill].into_iter().collect();
        let mut ctx = ctx("sa-new", &[Activity::Downhill]);

        let found = walk(&store, &seed, &seed_activities, &mut ctx).await.unwrap();
        let mut ids: Vec<&str> = found.iter().map(|o| o.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(found.len(), ids.len());
        assert!(found.iter().any(|o| o.kind() == Kind::Run));
    }

    #[tokio::test]
    async fn fixed_search_area_does_not_recurse() {
        let store = MemoryStore::new();
        store
            .save_many(vec![Record::Run(point_run(
                "run-a",
                0.0,
                0.0,
                &[Activity::Downhill],
            ))])
            .await
            .unwrap();

        let polygon = Geometry::Polygon(geo::Polygon::new(
            geo::LineString::from(vec![(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0), (-1.0, -1.0)]),
            vec![],
        ));
        let mut ctx = SearchContext {
            id: "sa-1".into(),
            activities: [Activity::Downhill].into_iter().collect(),
            search_type: SearchType::Contains,
            is_fixed_search_area: true,
            search_polygon: Some(polygon.clone()),
            already_visited: vec![],
            exclude_objects_already_in_ski_area: false,
            buffer_distance_km: None,
        };

        let found = walk(&store, &polygon, &Activities::new(), &mut ctx).await.unwrap();
        assert_eq!(found.len(), 1);
        let _ = store.get_ski_areas(SkiAreaFilter::default()).await.unwrap();
    }
}
