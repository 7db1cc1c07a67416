//! C1: the Object Store. The only stateful component — CRUD, spatial and
//! set-membership queries, and ordered streaming iteration over subsets.
//! Two backends implement this trait: [`postgres::PostgresStore`] (PostGIS,
//! used in production) and [`memory::MemoryStore`] (an in-process `geo`-based
//! implementation used by the test suite and by components under unit test).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{Activities, Flags, Geometry, Key, Lift, MemberObject, Run, SkiArea, Source, Spot};

/// `searchType` ∈ {contains, intersects} (§4.1, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    Contains,
    Intersects,
}

/// Inputs to `findNearbyObjects`, also threaded through the Traversal Core
/// as the walk's mutable dedupe cursor (§4.3).
#[derive(Debug, Clone)]
pub struct SearchContext {
    pub id: Key,
    pub activities: Activities,
    pub search_type: SearchType,
    pub is_fixed_search_area: bool,
    pub search_polygon: Option<Geometry>,
    pub already_visited: Vec<Key>,
    pub exclude_objects_already_in_ski_area: bool,
    pub buffer_distance_km: Option<f64>,
}

impl SearchContext {
    pub fn has_visited(&self, key: &str) -> bool {
        self.already_visited.iter().any(|k| k == key)
    }

    pub fn record_visited(&mut self, keys: impl IntoIterator<Item = Key>) {
        for k in keys {
            if !self.has_visited(&k) {
                self.already_visited.push(k);
            }
        }
    }
}

/// Filters for `getSkiAreas` (§4.1). `use_batching = false` materializes
/// everything up front (safe to mutate the store while iterating);
/// `use_batching = true` paginates and requires the caller not to mutate.
#[derive(Debug, Clone, Default)]
pub struct SkiAreaFilter {
    pub only_source: Option<Source>,
    pub only_polygons: bool,
    pub only_in_polygon: Option<bool>,
    pub use_batching: bool,
}

/// A cursor over query results. `Materialized` is always safe to iterate
/// while mutating the store concurrently (the whole result set already sits
/// in memory); `Streaming` is a paginated view over a totally-ordered key
/// range and must not be iterated while the underlying set is mutated — the
/// type itself carries no enforcement beyond this contract, callers follow
/// §9's "cooperative iteration during mutation" rule by construction (every
/// phase that mutates while iterating passes `use_batching: false`).
pub enum Cursor<T> {
    Materialized(std::vec::IntoIter<T>),
    Streaming {
        current: std::vec::IntoIter<T>,
        remaining_pages: std::collections::VecDeque<Vec<T>>,
    },
}

impl<T> Cursor<T> {
    pub fn materialized(items: Vec<T>) -> Self {
        Cursor::Materialized(items.into_iter())
    }

    pub fn streaming(pages: Vec<Vec<T>>) -> Self {
        let mut pages: std::collections::VecDeque<Vec<T>> = pages.into();
        let current = pages.pop_front().unwrap_or_default().into_iter();
        Cursor::Streaming { current, remaining_pages: pages }
    }

    pub fn into_vec(self) -> Vec<T> {
        self.collect()
    }
}

impl<T> Iterator for Cursor<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self {
            Cursor::Materialized(it) => it.next(),
            Cursor::Streaming { current, remaining_pages } => loop {
                if let Some(item) = current.next() {
                    return Some(item);
                }
                *current = remaining_pages.pop_front()?.into_iter();
            },
        }
    }
}

/// Partial update to a SkiArea; `None` fields are left unmodified (§4.1 `update`).
#[derive(Debug, Clone, Default)]
pub struct SkiAreaDelta {
    pub geometry: Option<Geometry>,
    pub activities: Option<Activities>,
    pub properties: Option<crate::model::SkiAreaProperties>,
    pub flags: Option<Flags>,
}

#[derive(Debug, Clone, Default)]
pub struct LiftDelta {
    pub activities: Option<Activities>,
    pub flags: Option<Flags>,
    pub ski_areas: Option<crate::model::Membership>,
}

#[derive(Debug, Clone, Default)]
pub struct RunDelta {
    pub activities: Option<Activities>,
    pub flags: Option<Flags>,
    pub ski_areas: Option<crate::model::Membership>,
}

#[derive(Debug, Clone, Default)]
pub struct SpotDelta {
    pub lift_id: Option<Option<Key>>,
    pub ski_areas: Option<crate::model::Membership>,
}

pub enum Delta {
    SkiArea(SkiAreaDelta),
    Lift(LiftDelta),
    Run(RunDelta),
    Spot(SpotDelta),
}

impl Delta {
    /// Convenience for the Merger: rewrites just the membership list,
    /// leaving whichever other fields this variant already carried.
    pub fn with_ski_areas(mut self, ski_areas: crate::model::Membership) -> Self {
        match &mut self {
            Delta::Lift(d) => d.ski_areas = Some(ski_areas),
            Delta::Run(d) => d.ski_areas = Some(ski_areas),
            Delta::Spot(d) => d.ski_areas = Some(ski_areas),
            Delta::SkiArea(_) => {}
        }
        self
    }
}

pub enum Record {
    SkiArea(SkiArea),
    Lift(Lift),
    Run(Run),
    Spot(Spot),
}

/// The Object Store contract (§4.1). Implemented by both the PostGIS-backed
/// production store and the in-memory test store so every other component
/// (Loader, Traversal Core, pipeline phases, Merger, Augmenter) is written
/// once against the trait.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn save(&self, record: Record) -> Result<(), StorageError>;
    async fn save_many(&self, records: Vec<Record>) -> Result<(), StorageError>;

    async fn update(&self, key: &str, delta: Delta) -> Result<(), StorageError>;
    async fn update_many(&self, deltas: Vec<(Key, Delta)>) -> Result<(), StorageError>;

    /// Removing a SkiArea cascades: `key` is scrubbed from every other
    /// record's membership list atomically (Invariant 1).
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    async fn get_ski_area(&self, key: &str) -> Result<Option<SkiArea>, StorageError>;

    async fn get_ski_areas(&self, filter: SkiAreaFilter) -> Result<Cursor<SkiArea>, StorageError>;

    async fn get_ski_areas_by_ids(&self, ids: &[Key]) -> Result<Cursor<SkiArea>, StorageError>;

    /// Swallows `InvalidGeometryError` from the spatial engine, returning an
    /// empty set and logging — never fatal (§4.1, §7). Appends every
    /// returned key to `ctx.already_visited` as a side effect.
    async fn find_nearby_objects(
        &self,
        geometry: &Geometry,
        ctx: &mut SearchContext,
    ) -> Result<Vec<MemberObject>, StorageError>;

    async fn get_objects_for_ski_area(&self, ski_area_id: &str) -> Result<Vec<MemberObject>, StorageError>;

    /// Every Lift/Run/Spot record regardless of membership, key-ordered.
    /// Used by the Exporter, which must emit every input feature exactly
    /// once whether or not clustering ever assigned it to a SkiArea.
    async fn get_all_objects(&self) -> Result<Vec<MemberObject>, StorageError>;

    /// Single exclusive transaction; retries transient deadlocks with
    /// capped exponential backoff and jitter (§4.1, §5, §9). Keys are
    /// sorted before locking to eliminate deadlock cycles.
    async fn mark_objects_as_part_of_ski_area(
        &self,
        ski_area_id: &str,
        keys: &[Key],
        is_in_ski_area_polygon: bool,
    ) -> Result<(), StorageError>;

    /// Returns one Run with `isBasisForNewSkiArea = true`, or `None` when
    /// exhausted. Returning a run with an empty activity set is a loader
    /// bug and must be reported as a `PipelineInvariantError` by the caller,
    /// not silently skipped.
    async fn get_next_unassigned_run(&self) -> Result<Option<Run>, StorageError>;

    /// Builds spatial/secondary indexes; called once after bulk load (§4.2).
    async fn build_indexes(&self) -> Result<(), StorageError>;
}
