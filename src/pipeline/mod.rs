//! C4: orchestrates the seven-plus-one ordered phases over the Object
//! Store (§4.4, §5). Phase order is strict and total; phases never run
//! concurrently with each other (a hard barrier between each). Within a
//! phase, individual SkiAreas can run concurrently up to
//! `parallel_ski_areas`; see `phases.rs` for which phases do and why.

pub mod phases;

use std::sync::Arc;

use log::info;
use uuid::Uuid;

use crate::error::ClusterError;
use crate::model::Key;
use crate::store::ObjectStore;

/// Tunables threaded through from [`crate::config::Config`]. `id_source` is
/// injectable so phase 7's generated-ski-area ids are reproducible in tests
/// (§9 "globally unique IDs for generated areas ... injected for
/// testability").
#[derive(Clone)]
pub struct PipelineConfig {
    pub parallel_ski_areas: usize,
    pub id_source: Arc<dyn Fn() -> Key + Send + Sync>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { parallel_ski_areas: 10, id_source: Arc::new(|| Uuid::new_v4().to_string()) }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineSummary {
    pub phase1: phases::PhaseSummary,
    pub phase2: phases::PhaseSummary,
    pub phase3: phases::PhaseSummary,
    pub phase4: phases::PhaseSummary,
    pub phase5: phases::PhaseSummary,
    pub phase6: phases::PhaseSummary,
    pub phase7: phases::PhaseSummary,
    pub phase8: phases::PhaseSummary,
}

pub async fn run(store: Arc<dyn ObjectStore>, config: &PipelineConfig) -> Result<PipelineSummary, ClusterError> {
    info!("clustering pipeline starting");
    let phase1 = phases::derive_seeded(store.as_ref()).await?;
    let phase2 = phases::remove_ambiguous_osm_polygons(store.as_ref()).await?;
    let phase3 = phases::assign_containment_osm(Arc::clone(&store), config.parallel_ski_areas).await?;
    let phase4 = phases::assign_nearby_osm(store.as_ref()).await?;
    let phase5 = phases::merge_skimap_into_osm(store.as_ref()).await?;
    let phase6 = phases::assign_nearby_skimap(store.as_ref()).await?;
    let phase7 = phases::generate_from_orphans(store.as_ref(), config.id_source.as_ref()).await?;
    let phase8 = phases::remove_sentinel_ski_areas(Arc::clone(&store), config.parallel_ski_areas).await?;
    info!("clustering pipeline finished");

    Ok(PipelineSummary { phase1, phase2, phase3, phase4, phase5, phase6, phase7, phase8 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activity, Flags, Geometry, Lift, LiftType, Membership, Run};
    use crate::store::memory::MemoryStore;
    use crate::store::Record;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn point_lift(id: &str, lon: f64, lat: f64) -> Lift {
        Lift {
            id: id.to_string(),
            lift_type: LiftType::ChairLift,
            geometry: Geometry::LineString(geo::LineString::from(vec![(lon, lat), (lon + 0.0001, lat + 0.0001)])),
            geometry_with_elevation: None,
            activities: BTreeSet::from([Activity::Downhill]),
            flags: Flags::default(),
            ski_areas: Membership::new(),
        }
    }

    fn point_run(id: &str, lon: f64, lat: f64, activities: &[Activity], is_basis: bool) -> Run {
        Run {
            id: id.to_string(),
            difficulty: None,
            geometry: Geometry::Point(geo::Point::new(lon, lat)),
            geometry_with_elevation: None,
            activities: activities.iter().copied().collect(),
            flags: Flags { is_basis_for_new_ski_area: is_basis, ..Default::default() },
            ski_areas: Membership::new(),
            raster_pixels: vec![],
            is_groomed: false,
            has_snowmaking: false,
            has_snowfarming: false,
        }
    }

    fn deterministic_ids() -> Arc<dyn Fn() -> Key + Send + Sync> {
        let counter = AtomicU32::new(0);
        Arc::new(move || format!("generated-{}", counter.fetch_add(1, Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn orphan_downhill_run_without_lift_is_not_generated() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        store
            .save(Record::Run(point_run("run-1", 0.0, 0.0, &[Activity::Downhill], true)))
            .await
            .unwrap();

        let config = PipelineConfig { parallel_ski_areas: 1, id_source: deterministic_ids() };
        let summary = run(Arc::clone(&store), &config).await.unwrap();

        assert_eq!(summary.phase7.changed, 0);
        let run_after = store.get_next_unassigned_run().await.unwrap();
        assert!(run_after.is_none());
    }

    #[tokio::test]
    async fn orphan_nordic_run_generates_ski_area() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        store
            .save(Record::Run(point_run("run-1", 0.0, 0.0, &[Activity::Nordic], true)))
            .await
            .unwrap();

        let config = PipelineConfig { parallel_ski_areas: 1, id_source: deterministic_ids() };
        let summary = run(Arc::clone(&store), &config).await.unwrap();

        assert_eq!(summary.phase7.changed, 1);
        let objs = store.get_objects_for_ski_area("generated-0").await.unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].id(), "run-1");
    }

    #[tokio::test]
    async fn downhill_run_with_nearby_lift_generates_ski_area() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        store
            .save(Record::Run(point_run("run-1", 0.0, 0.0, &[Activity::Downhill], true)))
            .await
            .unwrap();
        store.save(Record::Lift(point_lift("lift-1", 0.0001, 0.0001))).await.unwrap();

        let config = PipelineConfig { parallel_ski_areas: 1, id_source: deterministic_ids() };
        let summary = run(Arc::clone(&store), &config).await.unwrap();

        assert!(summary.phase7.changed >= 1);
        let run_after = store.get_next_unassigned_run().await.unwrap();
        assert!(run_after.is_none());
    }
}
