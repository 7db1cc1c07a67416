//! The seven-plus-one ordered phases (§4.4). Each phase function takes the
//! store and whatever pipeline-wide config it needs and returns a small
//! summary struct for logging; the orchestrator in [`super`] sequences them.
//!
//! Phases 3 and 8 fan out across `parallel_ski_areas` concurrent tasks, one
//! per SkiArea, gated by a `Semaphore` the same way the teacher's `main.rs`
//! bounds its per-file concurrency with an `Arc`-shared pool. Each task in
//! those phases only touches the one SkiArea it was spawned for, so there's
//! no shared mutable state to race on. Phase 5 stays a sequential loop
//! because its candidates share an `already_merged` exclusion set that a
//! concurrent OSM candidate could otherwise double-absorb. Phases 4 and 6
//! are sequential by specification regardless (§5). Phase 7 pulls one
//! unassigned run at a time off the store rather than iterating a list of
//! SkiAreas, so there is nothing to fan out over.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use geo::{Contains, Intersects};
use log::{debug, info, warn};
use tokio::sync::Semaphore;

use crate::error::ClusterError;
use crate::geometry;
use crate::merger;
use crate::model::{Activities, Activity, Geometry, Key, Kind, SkiArea, Source};
use crate::store::{Delta, ObjectStore, SearchContext, SearchType, SkiAreaDelta, SkiAreaFilter};
use crate::traversal;

fn full_activity_set() -> Activities {
    [Activity::Downhill, Activity::Nordic].into_iter().collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseSummary {
    pub examined: usize,
    pub changed: usize,
    pub removed: usize,
}

/// Phase 1 — derive activities/geometry from members for seeded ski areas.
pub async fn derive_seeded(store: &dyn ObjectStore) -> Result<PhaseSummary, ClusterError> {
    let mut summary = PhaseSummary::default();
    let ski_areas = store.get_ski_areas(SkiAreaFilter::default()).await?.into_vec();

    for sa in ski_areas {
        if !sa.activities.is_empty() {
            continue;
        }
        summary.examined += 1;

        let members = store.get_objects_for_ski_area(&sa.id).await?;
        if members.is_empty() {
            continue;
        }

        let activities: Activities = members.iter().flat_map(|m| m.activities()).collect();
        let geometries: Vec<Geometry> = members.iter().map(|m| m.geometry().clone()).collect();
        let point = geometry::derive_point(&geometries);

        let new_geometry = point.map(Geometry::Point);
        store
            .update(
                &sa.id,
                Delta::SkiArea(SkiAreaDelta {
                    geometry: new_geometry,
                    activities: Some(activities),
                    properties: None,
                    flags: None,
                }),
            )
            .await?;
        summary.changed += 1;
    }

    info!("phase 1: examined {}, updated {}", summary.examined, summary.changed);
    Ok(summary)
}

/// Phase 2 — remove ambiguous duplicate OSM polygons (super-clusters).
pub async fn remove_ambiguous_osm_polygons(store: &dyn ObjectStore) -> Result<PhaseSummary, ClusterError> {
    let mut summary = PhaseSummary::default();
    let osm_polygons = store
        .get_ski_areas(SkiAreaFilter {
            only_source: Some(Source::Osm),
            only_polygons: true,
            ..Default::default()
        })
        .await?
        .into_vec();
    let skimap_areas = store
        .get_ski_areas(SkiAreaFilter { only_source: Some(Source::Skimap), ..Default::default() })
        .await?
        .into_vec();

    for osm in osm_polygons {
        summary.examined += 1;
        let polygon = osm.geometry.to_geo();
        let inside_count = skimap_areas
            .iter()
            .filter(|sk| polygon.contains(&sk.geometry.to_geo()))
            .count();
        if inside_count > 1 {
            debug!("removing ambiguous osm super-polygon {} ({} skimap areas inside)", osm.id, inside_count);
            store.remove(&osm.id).await?;
            summary.removed += 1;
        }
    }

    info!("phase 2: examined {}, removed {}", summary.examined, summary.removed);
    Ok(summary)
}

enum ContainmentOutcome {
    Removed,
    Assigned,
    Unchanged,
}

async fn assign_containment_for_one(store: &dyn ObjectStore, osm: SkiArea) -> Result<ContainmentOutcome, ClusterError> {
    let activities = if osm.activities.is_empty() { full_activity_set() } else { osm.activities.clone() };
    let mut ctx = SearchContext {
        id: osm.id.clone(),
        activities,
        search_type: SearchType::Contains,
        is_fixed_search_area: true,
        search_polygon: Some(osm.geometry.clone()),
        already_visited: vec![],
        exclude_objects_already_in_ski_area: false,
        buffer_distance_km: None,
    };

    let found = traversal::walk(store, &osm.geometry, &osm.activities, &mut ctx).await?;

    if found.is_empty() {
        store.remove(&osm.id).await?;
        return Ok(ContainmentOutcome::Removed);
    }

    let already_in_site =
        found.iter().filter(|m| m.flags().map(|f| f.is_in_ski_area_site).unwrap_or(false)).count();
    if (already_in_site as f64) / (found.len() as f64) > 0.5 {
        store.remove(&osm.id).await?;
        return Ok(ContainmentOutcome::Removed);
    }

    let keys: Vec<Key> = found.iter().map(|m| m.id().to_string()).collect();
    store.mark_objects_as_part_of_ski_area(&osm.id, &keys, true).await?;
    Ok(ContainmentOutcome::Assigned)
}

/// Phase 3 — assign containment for OSM polygon ski areas. Fanned out across
/// `parallel_ski_areas` concurrent tasks, one per OSM polygon: each task only
/// reads/writes the records reachable from its own polygon, so the fan-out
/// carries no shared mutable state.
pub async fn assign_containment_osm(
    store: Arc<dyn ObjectStore>,
    parallel_ski_areas: usize,
) -> Result<PhaseSummary, ClusterError> {
    let osm_polygons = store
        .get_ski_areas(SkiAreaFilter {
            only_source: Some(Source::Osm),
            only_polygons: true,
            ..Default::default()
        })
        .await?
        .into_vec();

    let semaphore = Arc::new(Semaphore::new(parallel_ski_areas.max(1)));
    let mut tasks = Vec::with_capacity(osm_polygons.len());
    for osm in osm_polygons {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            assign_containment_for_one(store.as_ref(), osm).await
        }));
    }

    let mut summary = PhaseSummary::default();
    for task in tasks {
        let outcome = task
            .await
            .map_err(|e| ClusterError::Invariant(format!("phase 3 task panicked: {e}")))??;
        summary.examined += 1;
        match outcome {
            ContainmentOutcome::Removed => summary.removed += 1,
            ContainmentOutcome::Assigned => summary.changed += 1,
            ContainmentOutcome::Unchanged => {}
        }
    }

    info!("phase 3: examined {}, assigned {}, removed {}", summary.examined, summary.changed, summary.removed);
    Ok(summary)
}

/// Phase 4 — assign nearby for OSM ski areas. Runs sequentially (§5).
pub async fn assign_nearby_osm(store: &dyn ObjectStore) -> Result<PhaseSummary, ClusterError> {
    assign_nearby(store, Source::Osm).await
}

/// Phase 6 — assign nearby for SKIMAP ski areas. Same shape as phase 4.
pub async fn assign_nearby_skimap(store: &dyn ObjectStore) -> Result<PhaseSummary, ClusterError> {
    assign_nearby(store, Source::Skimap).await
}

async fn assign_nearby(store: &dyn ObjectStore, source: Source) -> Result<PhaseSummary, ClusterError> {
    let mut summary = PhaseSummary::default();
    let ski_areas = store
        .get_ski_areas(SkiAreaFilter { only_source: Some(source), ..Default::default() })
        .await?
        .into_vec();

    for sa in ski_areas {
        summary.examined += 1;
        let activities = if sa.activities.is_empty() { full_activity_set() } else { sa.activities.clone() };
        let mut ctx = SearchContext {
            id: sa.id.clone(),
            activities,
            search_type: SearchType::Intersects,
            is_fixed_search_area: false,
            search_polygon: None,
            already_visited: vec![],
            exclude_objects_already_in_ski_area: true,
            buffer_distance_km: Some(traversal::MAX_HOP_KM),
        };

        let found = traversal::walk(store, &sa.geometry, &sa.activities, &mut ctx).await?;
        if found.is_empty() {
            continue;
        }

        let keys: Vec<Key> = found.iter().map(|m| m.id().to_string()).collect();
        store.mark_objects_as_part_of_ski_area(&sa.id, &keys, false).await?;
        summary.changed += 1;
    }

    Ok(summary)
}

const MERGE_BUFFER_KM: f64 = 0.25;

/// Phase 5 — merge SKIMAP into OSM. Linear scan over OSM candidates: the
/// Object Store contract (§4.1) exposes `findNearbyObjects` for
/// lift/run/spot records only, not ski-area-to-ski-area proximity, so this
/// phase resolves neighbors client-side via `getSkiAreas` + `geo::Intersects`
/// rather than a dedicated spatial query.
pub async fn merge_skimap_into_osm(store: &dyn ObjectStore) -> Result<PhaseSummary, ClusterError> {
    let mut summary = PhaseSummary::default();
    let skimap_areas = store
        .get_ski_areas(SkiAreaFilter { only_source: Some(Source::Skimap), ..Default::default() })
        .await?
        .into_vec();

    let mut already_merged: BTreeSet<Key> = BTreeSet::new();

    for skimap in skimap_areas {
        if already_merged.contains(&skimap.id) {
            continue;
        }
        summary.examined += 1;

        let Some(buffered) = geometry::buffer_to_polygon(&skimap.geometry, MERGE_BUFFER_KM) else {
            continue;
        };
        let buffered_geo = buffered.to_geo();

        let osm_candidates: Vec<SkiArea> = store
            .get_ski_areas(SkiAreaFilter { only_source: Some(Source::Osm), ..Default::default() })
            .await?
            .into_vec()
            .into_iter()
            .filter(|osm| buffered_geo.intersects(&osm.geometry.to_geo()))
            .collect();

        if osm_candidates.is_empty() {
            continue;
        }

        let mut participants = vec![skimap.clone()];
        participants.extend(osm_candidates);
        let absorbed_ids: Vec<Key> = participants.iter().map(|p| p.id.clone()).collect();

        merger::merge_into_store(store, participants).await?;
        for id in absorbed_ids {
            already_merged.insert(id);
        }
        summary.changed += 1;
    }

    info!("phase 5: examined {}, merged {}", summary.examined, summary.changed);
    Ok(summary)
}

const LOOP_GUARD_WINDOW: usize = 8;

/// Phase 7 — generate ski areas for orphan runs. See §11 REDESIGN FLAGS for
/// the bounded visited-set loop guard (replaces the spec's bare
/// last-key-equality check).
pub async fn generate_from_orphans(
    store: &dyn ObjectStore,
    new_id: &dyn Fn() -> Key,
) -> Result<PhaseSummary, ClusterError> {
    let mut summary = PhaseSummary::default();
    let mut recent_keys: VecDeque<Key> = VecDeque::with_capacity(LOOP_GUARD_WINDOW);

    loop {
        let Some(run) = store.get_next_unassigned_run().await? else {
            break;
        };
        summary.examined += 1;

        if run.activities.is_empty() {
            return Err(ClusterError::Invariant(format!(
                "run {} returned as unassigned with empty activity set",
                run.id
            )));
        }

        if recent_keys.contains(&run.id) {
            warn!("phase 7 loop guard triggered on run {}, forcing isBasisForNewSkiArea=false", run.id);
            store
                .update(
                    &run.id,
                    Delta::Run(crate::store::RunDelta {
                        activities: None,
                        flags: Some(crate::model::Flags {
                            is_basis_for_new_ski_area: false,
                            ..run.flags.clone()
                        }),
                        ski_areas: None,
                    }),
                )
                .await?;
            continue;
        }
        if recent_keys.len() == LOOP_GUARD_WINDOW {
            recent_keys.pop_front();
        }
        recent_keys.push_back(run.id.clone());

        let ski_area_id = new_id();
        let mut ctx = SearchContext {
            id: ski_area_id.clone(),
            activities: run.activities.clone(),
            search_type: SearchType::Intersects,
            is_fixed_search_area: false,
            search_polygon: None,
            already_visited: vec![run.id.clone()],
            exclude_objects_already_in_ski_area: false,
            buffer_distance_km: Some(traversal::MAX_HOP_KM),
        };

        let mut neighbors = traversal::walk(store, &run.geometry, &run.activities, &mut ctx).await?;
        let run_as_member = crate::model::MemberObject::Run(run.clone());
        let seed_already_present = neighbors.iter().any(|m| m.id() == run.id);
        if !seed_already_present {
            neighbors.push(run_as_member);
        }

        let mut activities: Activities = run.activities.clone();
        let has_lift = neighbors.iter().any(|m| m.kind() == Kind::Lift);
        if activities.contains(&Activity::Downhill) && !has_lift {
            activities.remove(&Activity::Downhill);
            neighbors.retain(|m| !m.activities().is_disjoint(&activities));
        }

        if activities.is_empty() || neighbors.is_empty() {
            store
                .update(
                    &run.id,
                    Delta::Run(crate::store::RunDelta {
                        activities: None,
                        flags: Some(crate::model::Flags { is_basis_for_new_ski_area: false, ..run.flags.clone() }),
                        ski_areas: None,
                    }),
                )
                .await?;
            continue;
        }

        let geometries: Vec<Geometry> = neighbors.iter().map(|m| m.geometry().clone()).collect();
        let point = geometry::derive_point(&geometries)
            .expect("neighbors is non-empty at this point, so derive_point always succeeds");

        let new_ski_area = SkiArea {
            id: ski_area_id.clone(),
            source: Source::Osm,
            geometry: Geometry::Point(point),
            activities: activities.clone(),
            flags: crate::model::Flags::default(),
            properties: crate::model::SkiAreaProperties { generated: true, ..Default::default() },
        };
        store.save(crate::store::Record::SkiArea(new_ski_area)).await?;

        let keys: Vec<Key> = neighbors.iter().map(|m| m.id().to_string()).collect();
        store.mark_objects_as_part_of_ski_area(&ski_area_id, &keys, false).await?;
        summary.changed += 1;
    }

    info!("phase 7: examined {}, generated {}", summary.examined, summary.changed);
    Ok(summary)
}

/// Phase 8 — remove SkiAreas still carrying the sentinel point. Fanned out
/// across `parallel_ski_areas` concurrent tasks, one per SkiArea: each
/// removal only touches its own row.
pub async fn remove_sentinel_ski_areas(
    store: Arc<dyn ObjectStore>,
    parallel_ski_areas: usize,
) -> Result<PhaseSummary, ClusterError> {
    let ski_areas = store.get_ski_areas(SkiAreaFilter::default()).await?.into_vec();

    let semaphore = Arc::new(Semaphore::new(parallel_ski_areas.max(1)));
    let mut tasks = Vec::with_capacity(ski_areas.len());
    for sa in ski_areas {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            if sa.geometry.is_sentinel() {
                store.remove(&sa.id).await?;
                Ok::<bool, ClusterError>(true)
            } else {
                Ok(false)
            }
        }));
    }

    let mut summary = PhaseSummary::default();
    for task in tasks {
        let removed = task
            .await
            .map_err(|e| ClusterError::Invariant(format!("phase 8 task panicked: {e}")))??;
        summary.examined += 1;
        if removed {
            summary.removed += 1;
        }
    }

    info!("phase 8: examined {}, removed {}", summary.examined, summary.removed);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Flags, SkiAreaProperties};
    use crate::store::memory::MemoryStore;
    use crate::store::Record;
    use std::collections::BTreeSet;

    fn sentinel_ski_area(id: &str) -> SkiArea {
        SkiArea {
            id: id.to_string(),
            source: Source::Osm,
            geometry: Geometry::sentinel_point(id),
            activities: BTreeSet::new(),
            flags: Flags::default(),
            properties: SkiAreaProperties { generated: true, ..Default::default() },
        }
    }

    fn real_ski_area(id: &str, lon: f64, lat: f64) -> SkiArea {
        SkiArea {
            id: id.to_string(),
            source: Source::Osm,
            geometry: Geometry::Point(geo::Point::new(lon, lat)),
            activities: BTreeSet::from([Activity::Downhill]),
            flags: Flags::default(),
            properties: SkiAreaProperties::default(),
        }
    }

    #[tokio::test]
    async fn remove_sentinel_ski_areas_fans_out_across_parallel_tasks() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        for i in 0..6 {
            store.save(Record::SkiArea(sentinel_ski_area(&format!("sentinel-{i}")))).await.unwrap();
        }
        store.save(Record::SkiArea(real_ski_area("kept", 10.0, 45.0))).await.unwrap();

        let summary = remove_sentinel_ski_areas(Arc::clone(&store), 4).await.unwrap();

        assert_eq!(summary.examined, 7);
        assert_eq!(summary.removed, 6);
        let remaining = store.get_ski_areas(SkiAreaFilter::default()).await.unwrap().into_vec();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "kept");
    }
}
