//! C2: transforms raw input features into draft store records and
//! classifies activity sets (§4.2). Failures are per-feature: logged and
//! skipped, the batch continues (§7 `LoaderError`).

use log::{info, warn};
use serde::Deserialize;

use crate::error::ClusterError;
use crate::model::{
    Activities, Activity, Flags, Geometry, Lift, LiftType, Membership, Run, RunDifficulty,
    SkiArea, SkiAreaProperties, SkiAreaStatus, Source, SourceRef, Spot, SpotPosition,
};
use crate::store::{ObjectStore, Record};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawSkiAreaProps {
    source: String,
    #[serde(default)]
    activities: Vec<String>,
    name: Option<String>,
    #[serde(default)]
    websites: Vec<String>,
    status: Option<String>,
    #[serde(default)]
    generated: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawLiftProps {
    lift_type: String,
    status: Option<String>,
    #[serde(default)]
    ski_areas: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawRunProps {
    difficulty: Option<String>,
    #[serde(default)]
    uses: Vec<String>,
    grooming: Option<String>,
    patrolled: Option<bool>,
    #[serde(default)]
    ski_areas: Vec<String>,
    #[serde(default)]
    raster_pixels: Vec<String>,
    #[serde(default)]
    is_groomed: bool,
    #[serde(default)]
    has_snowmaking: bool,
    #[serde(default)]
    has_snowfarming: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawSpotProps {
    lift_id: Option<String>,
    position: Option<String>,
}

fn parse_activity(s: &str) -> Option<Activity> {
    match s.to_ascii_lowercase().as_str() {
        "downhill" => Some(Activity::Downhill),
        "nordic" => Some(Activity::Nordic),
        _ => None,
    }
}

fn parse_source(s: &str) -> Option<Source> {
    match s {
        "openstreetmap" => Some(Source::Osm),
        "skimap.org" => Some(Source::Skimap),
        _ => None,
    }
}

fn parse_status(s: &str) -> Option<SkiAreaStatus> {
    match s.to_ascii_lowercase().as_str() {
        "operating" => Some(SkiAreaStatus::Operating),
        "disused" => Some(SkiAreaStatus::Disused),
        "proposed" => Some(SkiAreaStatus::Proposed),
        "abandoned" => Some(SkiAreaStatus::Abandoned),
        _ => None,
    }
}

fn parse_lift_type(s: &str) -> LiftType {
    match s.to_ascii_lowercase().as_str() {
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

fn parse_difficulty(s: &str) -> RunDifficulty {
    match s.to_ascii_lowercase().as_str() {
        "easy" => RunDifficulty::Easy,
        "intermediate" => RunDifficulty::Intermediate,
        "advanced" => RunDifficulty::Advanced,
        "expert" => RunDifficulty::Expert,
        _ => RunDifficulty::Other,
    }
}

fn feature_id(feature: &geojson::Feature) -> String {
    feature
        .id
        .as_ref()
        .map(|id| match id {
            geojson::feature::Id::String(s) => s.clone(),
            geojson::feature::Id::Number(n) => n.to_string(),
        })
        .unwrap_or_default()
}

fn feature_geometry(feature: &geojson::Feature, id: &str) -> Result<Geometry, ClusterError> {
    let g = feature.geometry.as_ref().ok_or_else(|| ClusterError::Loader {
        feature: id.to_string(),
        reason: "missing geometry".into(),
    })?;
    Geometry::from_geojson(g).ok_or_else(|| ClusterError::Loader {
        feature: id.to_string(),
        reason: "unsupported geometry type".into(),
    })
}

fn feature_props<T: for<'de> Deserialize<'de> + Default>(
    feature: &geojson::Feature,
    id: &str,
) -> Result<T, ClusterError> {
    match &feature.properties {
        Some(map) => serde_json::from_value(serde_json::Value::Object(map.clone())).map_err(|e| {
            ClusterError::Loader {
                feature: id.to_string(),
                reason: format!("invalid properties: {e}"),
            }
        }),
        None => Ok(T::default()),
    }
}

pub fn load_ski_area(feature: &geojson::Feature) -> Result<SkiArea, ClusterError> {
    let id = feature_id(feature);
    let geometry = feature_geometry(feature, &id)?;
    let raw: RawSkiAreaProps = feature_props(feature, &id)?;

    let source = parse_source(&raw.source).ok_or_else(|| ClusterError::Loader {
        feature: id.clone(),
        reason: format!("unrecognized or missing source: {:?}", raw.source),
    })?;

    let activities: Activities = raw.activities.iter().filter_map(|s| parse_activity(s)).collect();
    let is_polygon = geometry.is_polygonal();

    Ok(SkiArea {
        id: id.clone(),
        source,
        flags: Flags {
            is_polygon,
            is_basis_for_new_ski_area: false,
            is_in_ski_area_polygon: false,
            is_in_ski_area_site: false,
        },
        geometry,
        activities,
        properties: SkiAreaProperties {
            name: raw.name,
            websites: raw.websites,
            sources: vec![SourceRef { source, id }],
            status: raw.status.as_deref().and_then(parse_status),
            generated: raw.generated,
            location: None,
            statistics: None,
            run_convention: None,
        },
    })
}

pub fn load_lift(feature: &geojson::Feature) -> Result<Lift, ClusterError> {
    let id = feature_id(feature);
    let geometry = feature_geometry(feature, &id)?;
    let raw: RawLiftProps = feature_props(feature, &id)?;

    let is_operating = raw
        .status
        .as_deref()
        .and_then(parse_status)
        .map(|s| s == SkiAreaStatus::Operating)
        .unwrap_or(false);
    let activities: Activities = if is_operating {
        [Activity::Downhill].into_iter().collect()
    } else {
        Activities::new()
    };

    Ok(Lift {
        id,
        lift_type: parse_lift_type(&raw.lift_type),
        geometry,
        // 3D/elevation-aware coordinates aren't representable by `geo`'s 2D
        // types; this variant is reserved for a future export path.
        geometry_with_elevation: None,
        activities,
        flags: Flags {
            is_polygon: false,
            is_basis_for_new_ski_area: false,
            is_in_ski_area_polygon: false,
            is_in_ski_area_site: !raw.ski_areas.is_empty(),
        },
        ski_areas: Membership::from_vec(raw.ski_areas),
    })
}

pub fn load_run(feature: &geojson::Feature) -> Result<Run, ClusterError> {
    let id = feature_id(feature);
    let geometry = feature_geometry(feature, &id)?;
    let raw: RawRunProps = feature_props(feature, &id)?;

    let in_site = !raw.ski_areas.is_empty();
    let is_backcountry = raw
        .grooming
        .as_deref()
        .map(|g| g.eq_ignore_ascii_case("backcountry"))
        .unwrap_or(false);
    let patrolled = raw.patrolled.unwrap_or(false);

    let activities: Activities = if !in_site && is_backcountry && !patrolled {
        Activities::new()
    } else {
        raw.uses
            .iter()
            .filter_map(|u| match u.to_ascii_lowercase().as_str() {
                "downhill" | "snow_park" => Some(Activity::Downhill),
                "nordic" => Some(Activity::Nordic),
                _ => None,
            })
            .collect()
    };

    let declared_downhill_or_nordic = raw
        .uses
        .iter()
        .any(|u| matches!(u.to_ascii_lowercase().as_str(), "downhill" | "nordic"));
    let is_basis_for_new_ski_area = declared_downhill_or_nordic && !activities.is_empty() && !in_site;

    Ok(Run {
        id,
        difficulty: raw.difficulty.as_deref().map(parse_difficulty),
        geometry,
        geometry_with_elevation: None,
        activities,
        flags: Flags {
            is_polygon: false,
            is_basis_for_new_ski_area,
            is_in_ski_area_polygon: false,
            is_in_ski_area_site: in_site,
        },
        ski_areas: Membership::from_vec(raw.ski_areas),
        raster_pixels: raw.raster_pixels,
        is_groomed: raw.is_groomed,
        has_snowmaking: raw.has_snowmaking,
        has_snowfarming: raw.has_snowfarming,
    })
}

pub fn load_spot(feature: &geojson::Feature) -> Result<Spot, ClusterError> {
    let id = feature_id(feature);
    let geometry = feature_geometry(feature, &id)?;
    let raw: RawSpotProps = feature_props(feature, &id)?;

    Ok(Spot {
        id,
        geometry,
        lift_id: raw.lift_id,
        position: raw.position.as_deref().map(|p| match p {
            "top" => SpotPosition::Top,
            "bottom" => SpotPosition::Bottom,
            _ => SpotPosition::Mid,
        }),
        ski_areas: Membership::new(),
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoadSummary {
    pub ski_areas_loaded: usize,
    pub lifts_loaded: usize,
    pub runs_loaded: usize,
    pub skipped: usize,
}

/// Loads all three input streams into the store, then builds indexes.
/// Per-feature failures are logged and excluded from the batch (§4.2, §7).
pub async fn load_all(
    store: &dyn ObjectStore,
    ski_areas: Vec<geojson::Feature>,
    lifts: Vec<geojson::Feature>,
    runs: Vec<geojson::Feature>,
) -> Result<LoadSummary, ClusterError> {
    let mut summary = LoadSummary::default();
    let mut records = Vec::with_capacity(ski_areas.len() + lifts.len() + runs.len());

    for feature in &ski_areas {
        match load_ski_area(feature) {
            Ok(sa) => {
                records.push(Record::SkiArea(sa));
                summary.ski_areas_loaded += 1;
            }
            Err(e) => {
                warn!("skipping ski area feature: {e}");
                summary.skipped += 1;
            }
        }
    }
    for feature in &lifts {
        match load_lift(feature) {
            Ok(lift) => {
                records.push(Record::Lift(lift));
                summary.lifts_loaded += 1;
            }
            Err(e) => {
                warn!("skipping lift feature: {e}");
                summary.skipped += 1;
            }
        }
    }
    for feature in &runs {
        match load_run(feature) {
            Ok(run) => {
                records.push(Record::Run(run));
                summary.runs_loaded += 1;
            }
            Err(e) => {
                warn!("skipping run feature: {e}");
                summary.skipped += 1;
            }
        }
    }

    store.save_many(records).await?;
    store.build_indexes().await?;

    info!(
        "loaded {} ski areas, {} lifts, {} runs ({} skipped)",
        summary.ski_areas_loaded, summary.lifts_loaded, summary.runs_loaded, summary.skipped
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geojson::{Feature, Geometry as GjGeometry, Value};
    use serde_json::json;

    fn feature_with(geometry: Value, props: serde_json::Value) -> Feature {
        Feature {
            bbox: None,
            geometry: Some(GjGeometry::new(geometry)),
            id: Some(geojson::feature::Id::String("f-1".into())),
            properties: props.as_object().cloned(),
            foreign_members: None,
        }
    }

    #[test]
    fn backcountry_unpatrolled_run_gets_no_activities() {
        let f = feature_with(
            Value::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]]),
            json!({"uses": ["downhill"], "grooming": "backcountry"}),
        );
        let run = load_run(&f).unwrap();
        assert!(run.activities.is_empty());
        assert!(!run.flags.is_basis_for_new_ski_area);
    }

    #[test]
    fn patrolled_backcountry_run_keeps_activities() {
        let f = feature_with(
            Value::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]]),
            json!({"uses": ["downhill"], "grooming": "backcountry", "patrolled": true}),
        );
        let run = load_run(&f).unwrap();
        assert!(run.activities.contains(&Activity::Downhill));
    }

    #[test]
    fn skitour_only_run_is_never_a_basis() {
        let f = feature_with(
            Value::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]]),
            json!({"uses": ["skitour"]}),
        );
        let run = load_run(&f).unwrap();
        assert!(run.activities.is_empty());
        assert!(!run.flags.is_basis_for_new_ski_area);
    }

    #[test]
    fn run_already_in_site_is_never_a_basis() {
        let f = feature_with(
            Value::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]]),
            json!({"uses": ["nordic"], "skiAreas": ["sa-1"]}),
        );
        let run = load_run(&f).unwrap();
        assert!(run.activities.contains(&Activity::Nordic));
        assert!(!run.flags.is_basis_for_new_ski_area);
    }

    #[test]
    fn lift_activities_require_operating_status() {
        let f = feature_with(
            Value::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]]),
            json!({"liftType": "chair_lift", "status": "disused"}),
        );
        let lift = load_lift(&f).unwrap();
        assert!(lift.activities.is_empty());
    }

    #[test]
    fn ski_area_requires_recognized_source() {
        let f = feature_with(Value::Point(vec![0.0, 0.0]), json!({"source": "nonsense"}));
        assert!(load_ski_area(&f).is_err());
    }

    #[test]
    fn ski_area_polygon_flag_follows_geometry() {
        let f = feature_with(
            Value::Polygon(vec![vec![
                vec![0.0, 0.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
                vec![0.0, 0.0],
            ]]),
            json!({"source": "openstreetmap"}),
        );
        let sa = load_ski_area(&f).unwrap();
        assert!(sa.flags.is_polygon);
        assert!(sa.is_polygon());
    }
}
