//! In-process `ObjectStore` backed by `geo` predicates instead of PostGIS.
//! Used by the unit/integration test suite (§10.4) — same contract as
//! [`super::postgres::PostgresStore`], so every component above the store is
//! exercised without a database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use geo::{Contains, Intersects};
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::geometry;
use crate::model::{Key, Lift, MemberObject, Run, SkiArea, Spot};

use super::{Cursor, Delta, ObjectStore, Record, SearchContext, SearchType, SkiAreaFilter};

#[derive(Default)]
struct Inner {
    ski_areas: BTreeMap<Key, SkiArea>,
    lifts: BTreeMap<Key, Lift>,
    runs: BTreeMap<Key, Run>,
    spots: BTreeMap<Key, Spot>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn member_objects(inner: &Inner) -> Vec<MemberObject> {
    let mut out = Vec::new();
    for l in inner.lifts.values() {
        out.push(MemberObject::Lift(l.clone()));
    }
    for r in inner.runs.values() {
        out.push(MemberObject::Run(r.clone()));
    }
    for s in inner.spots.values() {
        out.push(MemberObject::Spot(s.clone()));
    }
    out.sort_by(|a, b| a.id().cmp(b.id()));
    out
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn save(&self, record: Record) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        match record {
            Record::SkiArea(s) => {
                inner.ski_areas.insert(s.id.clone(), s);
            }
            Record::Lift(l) => {
                inner.lifts.insert(l.id.clone(), l);
            }
            Record::Run(r) => {
                inner.runs.insert(r.id.clone(), r);
            }
            Record::Spot(s) => {
                inner.spots.insert(s.id.clone(), s);
            }
        }
        Ok(())
    }

    async fn save_many(&self, records: Vec<Record>) -> Result<(), StorageError> {
        for r in records {
            self.save(r).await?;
        }
        Ok(())
    }

    async fn update(&self, key: &str, delta: Delta) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        match delta {
            Delta::SkiArea(d) => {
                let sa = inner
                    .ski_areas
                    .get_mut(key)
                    .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
                if let Some(g) = d.geometry {
                    sa.geometry = g;
                }
                if let Some(a) = d.activities {
                    sa.activities = a;
                }
                if let Some(p) = d.properties {
                    sa.properties = p;
                }
                if let Some(f) = d.flags {
                    sa.flags = f;
                }
            }
            Delta::Lift(d) => {
                let lift = inner
                    .lifts
                    .get_mut(key)
                    .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
                if let Some(a) = d.activities {
                    lift.activities = a;
                }
                if let Some(f) = d.flags {
                    lift.flags = f;
                }
                if let Some(s) = d.ski_areas {
                    lift.ski_areas = s;
                }
            }
            Delta::Run(d) => {
                let run = inner
                    .runs
                    .get_mut(key)
                    .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
                if let Some(a) = d.activities {
                    run.activities = a;
                }
                if let Some(f) = d.flags {
                    run.flags = f;
                }
                if let Some(s) = d.ski_areas {
                    run.ski_areas = s;
                }
            }
            Delta::Spot(d) => {
                let spot = inner
                    .spots
                    .get_mut(key)
                    .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
                if let Some(lift_id) = d.lift_id {
                    spot.lift_id = lift_id;
                }
                if let Some(s) = d.ski_areas {
                    spot.ski_areas = s;
                }
            }
        }
        Ok(())
    }

    async fn update_many(&self, deltas: Vec<(Key, Delta)>) -> Result<(), StorageError> {
        for (key, delta) in deltas {
            self.update(&key, delta).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.ski_areas.remove(key).is_some() {
            for lift in inner.lifts.values_mut() {
                lift.ski_areas.remove(key);
            }
            for run in inner.runs.values_mut() {
                run.ski_areas.remove(key);
            }
            for spot in inner.spots.values_mut() {
                spot.ski_areas.remove(key);
            }
        } else {
            inner.lifts.remove(key);
            inner.runs.remove(key);
            inner.spots.remove(key);
        }
        Ok(())
    }

    async fn get_ski_area(&self, key: &str) -> Result<Option<SkiArea>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.ski_areas.get(key).cloned())
    }

    async fn get_ski_areas(&self, filter: SkiAreaFilter) -> Result<Cursor<SkiArea>, StorageError> {
        let inner = self.inner.lock().await;
        let items: Vec<SkiArea> = inner
            .ski_areas
            .values()
            .filter(|sa| filter.only_source.is_none_or(|s| s == sa.source))
            .filter(|sa| !filter.only_polygons || sa.is_polygon())
            .filter(|sa| {
                filter
                    .only_in_polygon
                    .is_none_or(|want| sa.flags.is_in_ski_area_polygon == want)
            })
            .cloned()
            .collect();
        Ok(Cursor::materialized(items))
    }

    async fn get_ski_areas_by_ids(&self, ids: &[Key]) -> Result<Cursor<SkiArea>, StorageError> {
        let inner = self.inner.lock().await;
        let items: Vec<SkiArea> = ids.iter().filter_map(|id| inner.ski_areas.get(id).cloned()).collect();
        Ok(Cursor::materialized(items))
    }

    async fn find_nearby_objects(
        &self,
        geometry: &crate::model::Geometry,
        ctx: &mut SearchContext,
    ) -> Result<Vec<MemberObject>, StorageError> {
        let query_geom = match ctx.buffer_distance_km {
            Some(km) => match geometry::buffer_to_polygon(geometry, km) {
                Some(g) => g,
                None => {
                    warn!("invalid geometry while buffering search area for {}", ctx.id);
                    return Ok(Vec::new());
                }
            },
            None => geometry.clone(),
        };
        let query = query_geom.to_geo();

        let inner = self.inner.lock().await;
        let candidates = member_objects(&inner);
        drop(inner);

        let mut matched = Vec::new();
        for obj in candidates {
            if obj.ski_areas().contains(&ctx.id) {
                continue;
            }
            if ctx.has_visited(obj.id()) {
                continue;
            }
            if ctx.exclude_objects_already_in_ski_area && !obj.ski_areas().is_empty() {
                continue;
            }
            if obj.activities().is_disjoint(&ctx.activities) {
                continue;
            }

            let candidate_geom = obj.geometry().to_geo();
            let relates = match ctx.search_type {
                SearchType::Contains => query.contains(&candidate_geom),
                SearchType::Intersects => query.intersects(&candidate_geom),
            };
            if relates {
                matched.push(obj);
            }
        }

        ctx.record_visited(matched.iter().map(|o| o.id().to_string()));
        debug!(
            "find_nearby_objects for {}: {} matches ({:?})",
            ctx.id,
            matched.len(),
            ctx.search_type
        );
        Ok(matched)
    }

    async fn get_objects_for_ski_area(&self, ski_area_id: &str) -> Result<Vec<MemberObject>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(member_objects(&inner)
            .into_iter()
            .filter(|o| o.ski_areas().contains(ski_area_id))
            .collect())
    }

    async fn get_all_objects(&self) -> Result<Vec<MemberObject>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(member_objects(&inner))
    }

    async fn mark_objects_as_part_of_ski_area(
        &self,
        ski_area_id: &str,
        keys: &[Key],
        is_in_ski_area_polygon: bool,
    ) -> Result<(), StorageError> {
        let mut sorted_keys = keys.to_vec();
        sorted_keys.sort();

        let mut inner = self.inner.lock().await;
        for key in &sorted_keys {
            if let Some(lift) = inner.lifts.get_mut(key) {
                lift.ski_areas.insert(ski_area_id.to_string());
                lift.flags.is_in_ski_area_polygon |= is_in_ski_area_polygon;
                lift.flags.is_basis_for_new_ski_area = false;
                continue;
            }
            if let Some(run) = inner.runs.get_mut(key) {
                run.ski_areas.insert(ski_area_id.to_string());
                run.flags.is_in_ski_area_polygon |= is_in_ski_area_polygon;
                run.flags.is_basis_for_new_ski_area = false;
                continue;
            }
            if let Some(spot) = inner.spots.get_mut(key) {
                spot.ski_areas.insert(ski_area_id.to_string());
            }
        }
        Ok(())
    }

    async fn get_next_unassigned_run(&self) -> Result<Option<Run>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .find(|r| r.flags.is_basis_for_new_ski_area)
            .cloned())
    }

    async fn build_indexes(&self) -> Result<(), StorageError> {
        // No-op: the in-memory store has no indexes to build, only the
        // BTreeMap key ordering the rest of the contract relies on.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activity, Flags, Geometry, Source};
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

    #[tokio::test]
    async fn save_and_get_ski_area_round_trips() {
        let store = MemoryStore::new();
        let sa = SkiArea {
            id: "sa-1".into(),
            source: Source::Osm,
            geometry: Geometry::Point(geo::Point::new(1.0, 1.0)),
            activities: Default::default(),
            flags: Default::default(),
            properties: Default::default(),
        };
        store.save(Record::SkiArea(sa)).await.unwrap();
        let fetched = store.get_ski_area("sa-1").await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn remove_ski_area_cascades_membership() {
        let store = MemoryStore::new();
        let sa = SkiArea {
            id: "sa-1".into(),
            source: Source::Osm,
            geometry: Geometry::Point(geo::Point::new(1.0, 1.0)),
            activities: Default::default(),
            flags: Default::default(),
            properties: Default::default(),
        };
        store.save(Record::SkiArea(sa)).await.unwrap();
        let mut run = point_run("run-1", 1.0, 1.0, &[Activity::Downhill]);
        run.ski_areas.insert("sa-1".into());
        store.save(Record::Run(run)).await.unwrap();

        store.remove("sa-1").await.unwrap();

        let objs = store.get_objects_for_ski_area("sa-1").await.unwrap();
        assert!(objs.is_empty());
    }

    #[tokio::test]
    async fn mark_objects_sets_flags_and_dedupes() {
        let store = MemoryStore::new();
        let run = point_run("run-1", 1.0, 1.0, &[Activity::Downhill]);
        store.save(Record::Run(run)).await.unwrap();

        store
            .mark_objects_as_part_of_ski_area("sa-1", &["run-1".into(), "run-1".into()], true)
            .await
            .unwrap();

        let objs = store.get_objects_for_ski_area("sa-1").await.unwrap();
        assert_eq!(objs.len(), 1);
        match &objs[0] {
            MemberObject::Run(r) => {
                assert_eq!(r.ski_areas.as_slice(), &["sa-1".to_string()]);
                assert!(r.flags.is_in_ski_area_polygon);
                assert!(!r.flags.is_basis_for_new_ski_area);
            }
            _ => panic!("expected run"),
        }
    }
}
