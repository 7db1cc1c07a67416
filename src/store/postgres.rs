//! PostGIS-backed [`ObjectStore`]. Mirrors the teacher's `db.rs`/`feature.rs`
//! shape — declarative DDL, raw parameterized SQL built from small helper
//! functions, upsert-by-key, everything inside explicit transactions — but
//! generalized from "one layer table per S-57 feature type" to "one table
//! per entity Kind" with the spatial/membership indexes §4.1 specifies.

use async_trait::async_trait;
use log::{debug, warn};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::StorageError;
use crate::model::{
    Activities, Activity, Flags, Geometry, Key, Lift, LiftType, MemberObject, Run, RunDifficulty,
    SkiArea, SkiAreaProperties, Source, Spot, SpotPosition,
};
use crate::retry::retry_transient;

use super::{
    Cursor, Delta, ObjectStore, Record, SearchContext, SearchType, SkiAreaFilter,
};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Constraint(e.to_string()))
    }
}

fn activity_str(a: Activity) -> &'static str {
    match a {
        Activity::Downhill => "downhill",
        Activity::Nordic => "nordic",
    }
}

fn parse_activity(s: &str) -> Option<Activity> {
    match s {
        "downhill" => Some(Activity::Downhill),
        "nordic" => Some(Activity::Nordic),
        _ => None,
    }
}

fn activities_to_array(a: &Activities) -> Vec<String> {
    a.iter().map(|x| activity_str(*x).to_string()).collect()
}

fn activities_from_array(arr: &[String]) -> Activities {
    arr.iter().filter_map(|s| parse_activity(s)).collect()
}

fn source_str(s: Source) -> &'static str {
    s.as_str()
}

fn parse_source(s: &str) -> Source {
    if s == Source::Osm.as_str() {
        Source::Osm
    } else {
        Source::Skimap
    }
}

fn parse_status(s: &str) -> Option<crate::model::SkiAreaStatus> {
    use crate::model::SkiAreaStatus;
    match s {
        "Operating" => Some(SkiAreaStatus::Operating),
        "Disused" => Some(SkiAreaStatus::Disused),
        "Proposed" => Some(SkiAreaStatus::Proposed),
        "Abandoned" => Some(SkiAreaStatus::Abandoned),
        _ => None,
    }
}

fn lift_type_str(t: LiftType) -> &'static str {
    match t {
        LiftType::CableCar => "cable_car",
        LiftType::Gondola => "gondola",
        LiftType::ChairLift => "chair_lift",
        LiftType::DragLift => "drag_lift",
        LiftType::MagicCarpet => "magic_carpet",
        LiftType::RopeTow => "rope_tow",
        LiftType::TBar => "t_bar",
        LiftType::JBar => "j_bar",
        LiftType::Funicular => "funicular",
        LiftType::Other => "other",
    }
}

fn parse_lift_type(s: &str) -> LiftType {
    match s {
        "cable_car" => LiftType::CableCar,
        "gondola" => LiftType::Gondola,
        "chair_lift" => LiftType::ChairLift,
        "drag_lift" => LiftType::DragLift,
        "magic_carpet" => LiftType::MagicCarpet,
        "rope_tow" => LiftType::RopeTow,
        "t_bar" => LiftType::TBar,
        "j_bar" => LiftType::JBar,
        "funicular" => LiftType::Funicular,
        _ => LiftType::Other,
    }
}

fn difficulty_str(d: RunDifficulty) -> &'static str {
    match d {
        RunDifficulty::Easy => "easy",
        RunDifficulty::Intermediate => "intermediate",
        RunDifficulty::Advanced => "advanced",
        RunDifficulty::Expert => "expert",
        RunDifficulty::Other => "other",
    }
}

fn parse_difficulty(s: &str) -> RunDifficulty {
    match s {
        "easy" => RunDifficulty::Easy,
        "intermediate" => RunDifficulty::Intermediate,
        "advanced" => RunDifficulty::Advanced,
        "expert" => RunDifficulty::Expert,
        _ => RunDifficulty::Other,
    }
}

fn geom_to_geojson_str(g: &Geometry) -> String {
    g.to_geojson().to_string()
}

fn geom_from_geojson_str(s: &str) -> Option<Geometry> {
    let gj: geojson::Geometry = s.parse().ok()?;
    Geometry::from_geojson(&gj)
}

/// True when the SQL error looks like a PostGIS geometry-validity failure
/// (self-intersecting rings, malformed multipolygons from user tagging),
/// which §7 requires `findNearbyObjects` to swallow rather than propagate.
fn is_invalid_geometry_error(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        let msg = db_err.message().to_ascii_lowercase();
        return msg.contains("topologyexception")
            || msg.contains("geosexception")
            || msg.contains("invalid geometry")
            || msg.contains("self-intersection");
    }
    false
}

#[async_trait]
impl ObjectStore for PostgresStore {
    async fn save(&self, record: Record) -> Result<(), StorageError> {
        self.save_many(vec![record]).await
    }

    async fn save_many(&self, records: Vec<Record>) -> Result<(), StorageError> {
        retry_transient(|| async {
            let mut tx = self.pool.begin().await?;
            for record in &records {
                save_one(&mut tx, record).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn update(&self, key: &str, delta: Delta) -> Result<(), StorageError> {
        self.update_many(vec![(key.to_string(), delta)]).await
    }

    async fn update_many(&self, deltas: Vec<(Key, Delta)>) -> Result<(), StorageError> {
        retry_transient(|| async {
            let mut tx = self.pool.begin().await?;
            for (key, delta) in &deltas {
                apply_delta(&mut tx, key, delta).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        retry_transient(|| async {
            let mut tx = self.pool.begin().await?;
            let removed_ski_area = sqlx::query("DELETE FROM ski_areas WHERE id = $1")
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;

            if removed_ski_area {
                for table in ["lifts", "runs", "spots"] {
                    let sql = format!(
                        "UPDATE {table} SET ski_areas = array_remove(ski_areas, $1) WHERE $1 = ANY(ski_areas)"
                    );
                    sqlx::query(&sql).bind(key).execute(&mut *tx).await?;
                }
            } else {
                sqlx::query("DELETE FROM lifts WHERE id = $1").bind(key).execute(&mut *tx).await?;
                sqlx::query("DELETE FROM runs WHERE id = $1").bind(key).execute(&mut *tx).await?;
                sqlx::query("DELETE FROM spots WHERE id = $1").bind(key).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn get_ski_area(&self, key: &str) -> Result<Option<SkiArea>, StorageError> {
        let row = sqlx::query(
            "SELECT id, source, activities, properties, is_polygon, is_in_ski_area_polygon, \
             ST_AsGeoJSON(geom) AS geom_json FROM ski_areas WHERE id = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_ski_area(&r)))
    }

    async fn get_ski_areas(&self, filter: SkiAreaFilter) -> Result<Cursor<SkiArea>, StorageError> {
        let mut sql = String::from(
            "SELECT id, source, activities, properties, is_polygon, is_in_ski_area_polygon, \
             ST_AsGeoJSON(geom) AS geom_json FROM ski_areas WHERE 1=1",
        );
        let mut binds: Vec<String> = Vec::new();
        if let Some(source) = filter.only_source {
            binds.push(source_str(source).to_string());
            sql.push_str(&format!(" AND source = ${}", binds.len()));
        }
        if filter.only_polygons {
            sql.push_str(" AND is_polygon = true");
        }
        if let Some(want) = filter.only_in_polygon {
            sql.push_str(&format!(" AND is_in_ski_area_polygon = {}", want));
        }
        sql.push_str(" ORDER BY id");

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let items: Vec<SkiArea> = rows.iter().map(row_to_ski_area).collect();

        if filter.use_batching {
            const PAGE_SIZE: usize = 500;
            let pages = items.chunks(PAGE_SIZE).map(|c| c.to_vec()).collect();
            Ok(Cursor::streaming(pages))
        } else {
            Ok(Cursor::materialized(items))
        }
    }

    async fn get_ski_areas_by_ids(&self, ids: &[Key]) -> Result<Cursor<SkiArea>, StorageError> {
        if ids.is_empty() {
            return Ok(Cursor::materialized(Vec::new()));
        }
        let rows = sqlx::query(
            "SELECT id, source, activities, properties, is_polygon, is_in_ski_area_polygon, \
             ST_AsGeoJSON(geom) AS geom_json FROM ski_areas WHERE id = ANY($1) ORDER BY id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(Cursor::materialized(rows.iter().map(row_to_ski_area).collect()))
    }

    async fn find_nearby_objects(
        &self,
        geometry: &Geometry,
        ctx: &mut SearchContext,
    ) -> Result<Vec<MemberObject>, StorageError> {
        let geojson_str = geom_to_geojson_str(geometry);
        let query_expr = match ctx.buffer_distance_km {
            Some(km) => format!(
                "ST_Buffer(ST_SetSRID(ST_GeomFromGeoJSON($1), 4326)::geography, {}::float8 * 1000)::geometry",
                km
            ),
            None => "ST_SetSRID(ST_GeomFromGeoJSON($1), 4326)".to_string(),
        };
        let predicate = match ctx.search_type {
            SearchType::Contains => "ST_CoveredBy(t.geom, q.area)",
            SearchType::Intersects => "ST_Intersects(t.geom, q.area)",
        };
        let activities: Vec<String> = activities_to_array(&ctx.activities);
        let already_visited = ctx.already_visited.clone();

        let mut matched = Vec::new();
        for table in ["lifts", "runs"] {
            let sql = format!(
                "WITH q AS (SELECT {query_expr} AS area) \
                 SELECT t.id \
                 FROM {table} t, q \
                 WHERE {predicate} \
                   AND NOT ($2 = ANY(t.ski_areas)) \
                   AND NOT (t.id = ANY($3)) \
                   AND (NOT $4 OR cardinality(t.ski_areas) = 0) \
                   AND t.activities && $5 \
                 ORDER BY t.id"
            );
            let result = sqlx::query(&sql)
                .bind(&geojson_str)
                .bind(&ctx.id)
                .bind(&already_visited)
                .bind(ctx.exclude_objects_already_in_ski_area)
                .bind(&activities)
                .fetch_all(&self.pool)
                .await;

            let rows = match result {
                Ok(rows) => rows,
                Err(e) if is_invalid_geometry_error(&e) => {
                    warn!("invalid geometry in findNearbyObjects for {}: {}", ctx.id, e);
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e.into()),
            };

            for row in rows {
                let id: String = row.try_get("id").unwrap_or_default();
                matched.push(self.fetch_member_by_id(table, &id).await?);
            }
        }

        ctx.record_visited(matched.iter().filter_map(|o| o.as_ref().map(|o| o.id().to_string())));
        debug!("find_nearby_objects for {}: {} matches", ctx.id, matched.len());
        Ok(matched.into_iter().flatten().collect())
    }

    async fn get_objects_for_ski_area(&self, ski_area_id: &str) -> Result<Vec<MemberObject>, StorageError> {
        let mut out = Vec::new();
        for table in ["lifts", "runs", "spots"] {
            let sql = format!("SELECT id FROM {table} WHERE $1 = ANY(ski_areas) ORDER BY id");
            let rows = sqlx::query(&sql).bind(ski_area_id).fetch_all(&self.pool).await?;
            for row in rows {
                let id: String = row.try_get("id").unwrap_or_default();
                if let Some(obj) = self.fetch_member_by_id(table, &id).await? {
                    out.push(obj);
                }
            }
        }
        Ok(out)
    }

    async fn get_all_objects(&self) -> Result<Vec<MemberObject>, StorageError> {
        self.fetch_all_members().await
    }

    async fn mark_objects_as_part_of_ski_area(
        &self,
        ski_area_id: &str,
        keys: &[Key],
        is_in_ski_area_polygon: bool,
    ) -> Result<(), StorageError> {
        let mut sorted_keys = keys.to_vec();
        sorted_keys.sort();

        retry_transient(|| async {
            // Exclusive per-row transaction, keys pre-sorted: eliminates the
            // deadlock cycle two concurrent phase workers would otherwise hit
            // locking the same two rows in opposite order (§5, §9).
            let mut tx = self.pool.begin().await?;
            for table in ["lifts", "runs"] {
                let sql = format!(
                    "UPDATE {table} SET \
                       ski_areas = CASE WHEN $1 = ANY(ski_areas) THEN ski_areas ELSE array_append(ski_areas, $1) END, \
                       is_in_ski_area_polygon = is_in_ski_area_polygon OR $2, \
                       is_basis_for_new_ski_area = false \
                     WHERE id = ANY($3)"
                );
                sqlx::query(&sql)
                    .bind(ski_area_id)
                    .bind(is_in_ski_area_polygon)
                    .bind(&sorted_keys)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query(
                "UPDATE spots SET ski_areas = CASE WHEN $1 = ANY(ski_areas) THEN ski_areas ELSE array_append(ski_areas, $1) END \
                 WHERE id = ANY($2)",
            )
            .bind(ski_area_id)
            .bind(&sorted_keys)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn get_next_unassigned_run(&self) -> Result<Option<Run>, StorageError> {
        let row = sqlx::query(
            "SELECT id, difficulty, activities, is_groomed, has_snowmaking, has_snowfarming, \
             ski_areas, raster_pixels, ST_AsGeoJSON(geom) AS geom_json \
             FROM runs WHERE is_basis_for_new_ski_area = true ORDER BY id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_run(&r)))
    }

    async fn build_indexes(&self) -> Result<(), StorageError> {
        let statements = [
            "CREATE INDEX IF NOT EXISTS ski_areas_geom_idx ON ski_areas USING GIST(geom)",
            "CREATE INDEX IF NOT EXISTS ski_areas_source_idx ON ski_areas(source, is_polygon)",
            "CREATE INDEX IF NOT EXISTS lifts_geom_idx ON lifts USING GIST(geom)",
            "CREATE INDEX IF NOT EXISTS lifts_ski_areas_idx ON lifts USING GIN(ski_areas)",
            "CREATE INDEX IF NOT EXISTS runs_geom_idx ON runs USING GIST(geom)",
            "CREATE INDEX IF NOT EXISTS runs_ski_areas_idx ON runs USING GIN(ski_areas)",
            "CREATE INDEX IF NOT EXISTS runs_unassigned_idx ON runs(id) WHERE is_basis_for_new_ski_area = true",
            "CREATE INDEX IF NOT EXISTS spots_geom_idx ON spots USING GIST(geom)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

impl PostgresStore {
    async fn fetch_member_by_id(&self, table: &str, id: &str) -> Result<Option<MemberObject>, StorageError> {
        match table {
            "lifts" => {
                let row = sqlx::query(
                    "SELECT id, lift_type, activities, is_in_ski_area_site, ski_areas, \
                     ST_AsGeoJSON(geom) AS geom_json FROM lifts WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.map(|r| MemberObject::Lift(row_to_lift(&r))))
            }
            "runs" => {
                let row = sqlx::query(
                    "SELECT id, difficulty, activities, is_groomed, has_snowmaking, has_snowfarming, \
                     ski_areas, raster_pixels, ST_AsGeoJSON(geom) AS geom_json FROM runs WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.map(|r| MemberObject::Run(row_to_run(&r))))
            }
            "spots" => {
                let row = sqlx::query(
                    "SELECT id, lift_id, position, ski_areas, ST_AsGeoJSON(geom) AS geom_json FROM spots WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(row.map(|r| MemberObject::Spot(row_to_spot(&r))))
            }
            _ => unreachable!("unknown member table {table}"),
        }
    }
}

impl PostgresStore {
    async fn fetch_all_members(&self) -> Result<Vec<MemberObject>, StorageError> {
        let mut out = Vec::new();

        let lifts = sqlx::query(
            "SELECT id, lift_type, activities, is_in_ski_area_site, ski_areas, \
             ST_AsGeoJSON(geom) AS geom_json FROM lifts ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        out.extend(lifts.iter().map(|r| MemberObject::Lift(row_to_lift(r))));

        let runs = sqlx::query(
            "SELECT id, difficulty, activities, is_groomed, has_snowmaking, has_snowfarming, \
             ski_areas, raster_pixels, ST_AsGeoJSON(geom) AS geom_json FROM runs ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        out.extend(runs.iter().map(|r| MemberObject::Run(row_to_run(r))));

        let spots = sqlx::query(
            "SELECT id, lift_id, position, ski_areas, ST_AsGeoJSON(geom) AS geom_json FROM spots ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        out.extend(spots.iter().map(|r| MemberObject::Spot(row_to_spot(r))));

        Ok(out)
    }
}

async fn save_one(tx: &mut Transaction<'_, Postgres>, record: &Record) -> Result<(), sqlx::Error> {
    match record {
        Record::SkiArea(sa) => {
            let geom_json = geom_to_geojson_str(&sa.geometry);
            let activities = activities_to_array(&sa.activities);
            let websites = sa.properties.websites.clone();
            let properties_json = serde_json::json!({
                "name": sa.properties.name,
                "websites": websites,
                "status": sa.properties.status.map(|s| format!("{:?}", s)),
                "generated": sa.properties.generated,
                "location": sa.properties.location,
                "statistics": sa.properties.statistics,
                "runConvention": sa.properties.run_convention,
                "sources": sa.properties.sources.iter().map(|s| serde_json::json!({
                    "type": s.source.as_str(), "id": s.id,
                })).collect::<Vec<_>>(),
            });
            sqlx::query(
                "INSERT INTO ski_areas (id, source, activities, properties, is_polygon, \
                   is_in_ski_area_polygon, geom) \
                 VALUES ($1, $2, $3, $4, $5, $6, ST_SetSRID(ST_GeomFromGeoJSON($7), 4326)) \
                 ON CONFLICT (id) DO UPDATE SET \
                   activities = EXCLUDED.activities, properties = EXCLUDED.properties, \
                   is_polygon = EXCLUDED.is_polygon, \
                   is_in_ski_area_polygon = EXCLUDED.is_in_ski_area_polygon, \
                   geom = EXCLUDED.geom",
            )
            .bind(&sa.id)
            .bind(source_str(sa.source))
            .bind(&activities)
            .bind(properties_json)
            .bind(sa.is_polygon())
            .bind(sa.flags.is_in_ski_area_polygon)
            .bind(geom_json)
            .execute(&mut **tx)
            .await?;
        }
        Record::Lift(lift) => {
            let geom_json = geom_to_geojson_str(&lift.geometry);
            let activities = activities_to_array(&lift.activities);
            sqlx::query(
                "INSERT INTO lifts (id, lift_type, activities, is_in_ski_area_site, \
                   is_in_ski_area_polygon, is_basis_for_new_ski_area, ski_areas, geom) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, ST_SetSRID(ST_GeomFromGeoJSON($8), 4326)) \
                 ON CONFLICT (id) DO UPDATE SET \
                   activities = EXCLUDED.activities, ski_areas = EXCLUDED.ski_areas, \
                   is_in_ski_area_polygon = EXCLUDED.is_in_ski_area_polygon, \
                   is_basis_for_new_ski_area = EXCLUDED.is_basis_for_new_ski_area, \
                   geom = EXCLUDED.geom",
            )
            .bind(&lift.id)
            .bind(lift_type_str(lift.lift_type))
            .bind(&activities)
            .bind(lift.flags.is_in_ski_area_site)
            .bind(lift.flags.is_in_ski_area_polygon)
            .bind(lift.flags.is_basis_for_new_ski_area)
            .bind(lift.ski_areas.as_slice())
            .bind(geom_json)
            .execute(&mut **tx)
            .await?;
        }
        Record::Run(run) => {
            let geom_json = geom_to_geojson_str(&run.geometry);
            let activities = activities_to_array(&run.activities);
            sqlx::query(
                "INSERT INTO runs (id, difficulty, activities, is_groomed, has_snowmaking, \
                   has_snowfarming, is_in_ski_area_polygon, is_basis_for_new_ski_area, \
                   ski_areas, raster_pixels, geom) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, ST_SetSRID(ST_GeomFromGeoJSON($11), 4326)) \
                 ON CONFLICT (id) DO UPDATE SET \
                   activities = EXCLUDED.activities, ski_areas = EXCLUDED.ski_areas, \
                   is_in_ski_area_polygon = EXCLUDED.is_in_ski_area_polygon, \
                   is_basis_for_new_ski_area = EXCLUDED.is_basis_for_new_ski_area, \
                   geom = EXCLUDED.geom",
            )
            .bind(&run.id)
            .bind(run.difficulty.map(difficulty_str))
            .bind(&activities)
            .bind(run.is_groomed)
            .bind(run.has_snowmaking)
            .bind(run.has_snowfarming)
            .bind(run.flags.is_in_ski_area_polygon)
            .bind(run.flags.is_basis_for_new_ski_area)
            .bind(run.ski_areas.as_slice())
            .bind(&run.raster_pixels)
            .bind(geom_json)
            .execute(&mut **tx)
            .await?;
        }
        Record::Spot(spot) => {
            let geom_json = geom_to_geojson_str(&spot.geometry);
            sqlx::query(
                "INSERT INTO spots (id, lift_id, position, ski_areas, geom) \
                 VALUES ($1, $2, $3, $4, ST_SetSRID(ST_GeomFromGeoJSON($5), 4326)) \
                 ON CONFLICT (id) DO UPDATE SET \
                   lift_id = EXCLUDED.lift_id, position = EXCLUDED.position, \
                   ski_areas = EXCLUDED.ski_areas, geom = EXCLUDED.geom",
            )
            .bind(&spot.id)
            .bind(&spot.lift_id)
            .bind(spot.position.map(|p| match p {
                SpotPosition::Top => "top",
                SpotPosition::Mid => "mid",
                SpotPosition::Bottom => "bottom",
            }))
            .bind(spot.ski_areas.as_slice())
            .bind(geom_json)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn apply_delta(tx: &mut Transaction<'_, Postgres>, key: &str, delta: &Delta) -> Result<(), sqlx::Error> {
    match delta {
        Delta::SkiArea(d) => {
            if let Some(geom) = &d.geometry {
                sqlx::query(
                    "UPDATE ski_areas SET geom = ST_SetSRID(ST_GeomFromGeoJSON($1), 4326), is_polygon = $2 WHERE id = $3",
                )
                .bind(geom_to_geojson_str(geom))
                .bind(geom.is_polygonal())
                .bind(key)
                .execute(&mut **tx)
                .await?;
            }
            if let Some(activities) = &d.activities {
                sqlx::query("UPDATE ski_areas SET activities = $1 WHERE id = $2")
                    .bind(activities_to_array(activities))
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
            if let Some(props) = &d.properties {
                let properties_json = serde_json::json!({
                    "name": props.name,
                    "websites": props.websites,
                    "status": props.status.map(|s| format!("{:?}", s)),
                    "generated": props.generated,
                    "location": props.location,
                    "statistics": props.statistics,
                    "runConvention": props.run_convention,
                    "sources": props.sources.iter().map(|s| serde_json::json!({
                        "type": s.source.as_str(), "id": s.id,
                    })).collect::<Vec<_>>(),
                });
                sqlx::query("UPDATE ski_areas SET properties = $1 WHERE id = $2")
                    .bind(properties_json)
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
            if let Some(flags) = &d.flags {
                sqlx::query("UPDATE ski_areas SET is_in_ski_area_polygon = is_in_ski_area_polygon OR $1 WHERE id = $2")
                    .bind(flags.is_in_ski_area_polygon)
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Delta::Lift(d) => {
            if let Some(activities) = &d.activities {
                sqlx::query("UPDATE lifts SET activities = $1 WHERE id = $2")
                    .bind(activities_to_array(activities))
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
            if let Some(flags) = &d.flags {
                sqlx::query(
                    "UPDATE lifts SET is_in_ski_area_polygon = is_in_ski_area_polygon OR $1, \
                       is_basis_for_new_ski_area = $2 WHERE id = $3",
                )
                .bind(flags.is_in_ski_area_polygon)
                .bind(flags.is_basis_for_new_ski_area)
                .bind(key)
                .execute(&mut **tx)
                .await?;
            }
            if let Some(ski_areas) = &d.ski_areas {
                sqlx::query("UPDATE lifts SET ski_areas = $1 WHERE id = $2")
                    .bind(ski_areas.as_slice())
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Delta::Run(d) => {
            if let Some(activities) = &d.activities {
                sqlx::query("UPDATE runs SET activities = $1 WHERE id = $2")
                    .bind(activities_to_array(activities))
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
            if let Some(flags) = &d.flags {
                sqlx::query(
                    "UPDATE runs SET is_in_ski_area_polygon = is_in_ski_area_polygon OR $1, \
                       is_basis_for_new_ski_area = $2 WHERE id = $3",
                )
                .bind(flags.is_in_ski_area_polygon)
                .bind(flags.is_basis_for_new_ski_area)
                .bind(key)
                .execute(&mut **tx)
                .await?;
            }
            if let Some(ski_areas) = &d.ski_areas {
                sqlx::query("UPDATE runs SET ski_areas = $1 WHERE id = $2")
                    .bind(ski_areas.as_slice())
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Delta::Spot(d) => {
            if let Some(lift_id) = &d.lift_id {
                sqlx::query("UPDATE spots SET lift_id = $1 WHERE id = $2")
                    .bind(lift_id)
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
            if let Some(ski_areas) = &d.ski_areas {
                sqlx::query("UPDATE spots SET ski_areas = $1 WHERE id = $2")
                    .bind(ski_areas.as_slice())
                    .bind(key)
                    .execute(&mut **tx)
                    .await?;
            }
        }
    }
    Ok(())
}

fn row_to_ski_area(row: &sqlx::postgres::PgRow) -> SkiArea {
    let activities: Vec<String> = row.try_get("activities").unwrap_or_default();
    let properties: serde_json::Value = row.try_get("properties").unwrap_or(serde_json::Value::Null);
    let geom_json: String = row.try_get("geom_json").unwrap_or_default();
    SkiArea {
        id: row.try_get("id").unwrap_or_default(),
        source: parse_source(&row.try_get::<String, _>("source").unwrap_or_default()),
        geometry: geom_from_geojson_str(&geom_json).unwrap_or_else(|| Geometry::sentinel_point("")),
        activities: activities_from_array(&activities),
        flags: Flags {
            is_polygon: row.try_get("is_polygon").unwrap_or(false),
            is_basis_for_new_ski_area: false,
            is_in_ski_area_polygon: row.try_get("is_in_ski_area_polygon").unwrap_or(false),
            is_in_ski_area_site: false,
        },
        properties: properties_from_json(properties),
    }
}

fn properties_from_json(v: serde_json::Value) -> SkiAreaProperties {
    SkiAreaProperties {
        name: v.get("name").and_then(|x| x.as_str()).map(String::from),
        websites: v
            .get("websites")
            .and_then(|x| x.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        sources: v
            .get("sources")
            .and_then(|x| x.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| {
                        let source = parse_source(s.get("type")?.as_str()?);
                        let id = s.get("id")?.as_str()?.to_string();
                        Some(crate::model::SourceRef { source, id })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        status: v.get("status").and_then(|x| x.as_str()).and_then(parse_status),
        generated: v.get("generated").and_then(|x| x.as_bool()).unwrap_or(false),
        location: v.get("location").cloned(),
        statistics: v.get("statistics").cloned(),
        run_convention: v.get("runConvention").and_then(|x| x.as_str()).map(String::from),
    }
}

fn row_to_lift(row: &sqlx::postgres::PgRow) -> Lift {
    let activities: Vec<String> = row.try_get("activities").unwrap_or_default();
    let ski_areas: Vec<String> = row.try_get("ski_areas").unwrap_or_default();
    let geom_json: String = row.try_get("geom_json").unwrap_or_default();
    Lift {
        id: row.try_get("id").unwrap_or_default(),
        lift_type: parse_lift_type(&row.try_get::<String, _>("lift_type").unwrap_or_default()),
        geometry: geom_from_geojson_str(&geom_json).unwrap_or_else(|| Geometry::sentinel_point("")),
        geometry_with_elevation: None,
        activities: activities_from_array(&activities),
        flags: Flags {
            is_polygon: false,
            is_basis_for_new_ski_area: false,
            is_in_ski_area_polygon: false,
            is_in_ski_area_site: row.try_get("is_in_ski_area_site").unwrap_or(false),
        },
        ski_areas: crate::model::Membership::from_vec(ski_areas),
    }
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> Run {
    let activities: Vec<String> = row.try_get("activities").unwrap_or_default();
    let ski_areas: Vec<String> = row.try_get("ski_areas").unwrap_or_default();
    let raster_pixels: Vec<String> = row.try_get("raster_pixels").unwrap_or_default();
    let geom_json: String = row.try_get("geom_json").unwrap_or_default();
    let difficulty: Option<String> = row.try_get("difficulty").unwrap_or(None);
    Run {
        id: row.try_get("id").unwrap_or_default(),
        difficulty: difficulty.as_deref().map(parse_difficulty),
        geometry: geom_from_geojson_str(&geom_json).unwrap_or_else(|| Geometry::sentinel_point("")),
        geometry_with_elevation: None,
        activities: activities_from_array(&activities),
        flags: Flags {
            is_polygon: false,
            is_basis_for_new_ski_area: row.try_get("is_basis_for_new_ski_area").unwrap_or(false),
            is_in_ski_area_polygon: row.try_get("is_in_ski_area_polygon").unwrap_or(false),
            is_in_ski_area_site: false,
        },
        ski_areas: crate::model::Membership::from_vec(ski_areas),
        raster_pixels,
        is_groomed: row.try_get("is_groomed").unwrap_or(false),
        has_snowmaking: row.try_get("has_snowmaking").unwrap_or(false),
        has_snowfarming: row.try_get("has_snowfarming").unwrap_or(false),
    }
}

fn row_to_spot(row: &sqlx::postgres::PgRow) -> Spot {
    let ski_areas: Vec<String> = row.try_get("ski_areas").unwrap_or_default();
    let geom_json: String = row.try_get("geom_json").unwrap_or_default();
    let position: Option<String> = row.try_get("position").unwrap_or(None);
    Spot {
        id: row.try_get("id").unwrap_or_default(),
        geometry: geom_from_geojson_str(&geom_json).unwrap_or_else(|| Geometry::sentinel_point("")),
        lift_id: row.try_get("lift_id").unwrap_or(None),
        position: position.as_deref().map(|p| match p {
            "top" => SpotPosition::Top,
            "bottom" => SpotPosition::Bottom,
            _ => SpotPosition::Mid,
        }),
        ski_areas: crate::model::Membership::from_vec(ski_areas),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SkiAreaStatus, SourceRef};

    #[test]
    fn properties_from_json_round_trips_status_and_sources() {
        let stored = serde_json::json!({
            "name": "Test Area",
            "websites": ["https://example.com"],
            "status": "Operating",
            "generated": false,
            "location": serde_json::Value::Null,
            "statistics": serde_json::Value::Null,
            "runConvention": serde_json::Value::Null,
            "sources": [
                {"type": "openstreetmap", "id": "osm-1"},
                {"type": "skimap_org", "id": "skimap-1"},
            ],
        });

        let props = properties_from_json(stored);
        assert_eq!(props.status, Some(SkiAreaStatus::Operating));
        assert_eq!(
            props.sources,
            vec![
                SourceRef { source: Source::Osm, id: "osm-1".to_string() },
                SourceRef { source: Source::Skimap, id: "skimap-1".to_string() },
            ]
        );
    }

    #[test]
    fn properties_from_json_defaults_when_fields_missing() {
        let props = properties_from_json(serde_json::json!({}));
        assert_eq!(props.status, None);
        assert!(props.sources.is_empty());
    }
}
