//! C7: streams SkiAreas/Lifts/Runs back out of the store into the three
//! GeoJSON FeatureCollections (§4.7).

use std::collections::BTreeMap;

use geojson::{Feature, FeatureCollection, JsonObject, JsonValue};
use log::info;

use crate::error::ClusterError;
use crate::model::{Activities, Key, Lift, Membership, Run, SkiArea, SkiAreaStatus, Spot};
use crate::store::{ObjectStore, SkiAreaFilter};

#[derive(Debug, Default, Clone)]
pub struct ExportSummary {
    pub ski_areas: usize,
    pub lifts: usize,
    pub runs: usize,
}

#[derive(Debug, Clone)]
pub struct Exported {
    pub ski_areas: FeatureCollection,
    pub lifts: FeatureCollection,
    pub runs: FeatureCollection,
}

fn empty_collection() -> FeatureCollection {
    FeatureCollection { bbox: None, features: Vec::new(), foreign_members: None }
}

/// Reads every record back out of the store, attaching a `skiAreas` summary
/// array to each non-SkiArea feature's properties.
pub async fn export(store: &dyn ObjectStore) -> Result<(Exported, ExportSummary), ClusterError> {
    let ski_areas = store.get_ski_areas(SkiAreaFilter::default()).await?.into_vec();
    let summaries: BTreeMap<Key, JsonValue> =
        ski_areas.iter().map(|sa| (sa.id.clone(), ski_area_summary(sa))).collect();

    let mut summary = ExportSummary::default();
    let mut out = Exported { ski_areas: empty_collection(), lifts: empty_collection(), runs: empty_collection() };

    for sa in &ski_areas {
        out.ski_areas.features.push(ski_area_feature(sa));
        summary.ski_areas += 1;
    }

    for member in store.get_all_objects().await? {
        match member {
            crate::model::MemberObject::Lift(lift) => {
                out.lifts.features.push(lift_feature(&lift, &summaries));
                summary.lifts += 1;
            }
            crate::model::MemberObject::Run(run) => {
                out.runs.features.push(run_feature(&run, &summaries));
                summary.runs += 1;
            }
            crate::model::MemberObject::Spot(_) => {}
        }
    }

    info!(
        "exporter: wrote {} ski area(s), {} lift(s), {} run(s)",
        summary.ski_areas, summary.lifts, summary.runs
    );
    Ok((out, summary))
}

fn ski_area_summary(sa: &SkiArea) -> JsonValue {
    let mut obj = JsonObject::new();
    obj.insert("id".into(), JsonValue::String(sa.id.clone()));
    if let Some(name) = &sa.properties.name {
        obj.insert("name".into(), JsonValue::String(name.clone()));
    } else {
        obj.insert("name".into(), JsonValue::Null);
    }
    obj.insert("activities".into(), activities_json(&sa.activities));
    obj.insert("status".into(), status_json(sa.properties.status));
    JsonValue::Object(obj)
}

fn activities_json(activities: &Activities) -> JsonValue {
    JsonValue::Array(
        activities
            .iter()
            .map(|a| JsonValue::String(activity_str(*a).to_string()))
            .collect(),
    )
}

fn activity_str(a: crate::model::Activity) -> &'static str {
    match a {
        crate::model::Activity::Downhill => "downhill",
        crate::model::Activity::Nordic => "nordic",
    }
}

fn sources_json(sources: &[crate::model::SourceRef]) -> JsonValue {
    JsonValue::Array(
        sources
            .iter()
            .map(|s| {
                let mut obj = JsonObject::new();
                obj.insert("source".into(), JsonValue::String(s.source.as_str().to_string()));
                obj.insert("id".into(), JsonValue::String(s.id.clone()));
                JsonValue::Object(obj)
            })
            .collect(),
    )
}

fn status_json(status: Option<SkiAreaStatus>) -> JsonValue {
    match status {
        Some(SkiAreaStatus::Operating) => JsonValue::String("operating".into()),
        Some(SkiAreaStatus::Disused) => JsonValue::String("disused".into()),
        Some(SkiAreaStatus::Proposed) => JsonValue::String("proposed".into()),
        Some(SkiAreaStatus::Abandoned) => JsonValue::String("abandoned".into()),
        None => JsonValue::Null,
    }
}

fn membership_summaries(membership: &Membership, summaries: &BTreeMap<Key, JsonValue>) -> JsonValue {
    JsonValue::Array(
        membership
            .iter()
            .filter_map(|id| summaries.get(id).cloned())
            .collect(),
    )
}

fn ski_area_feature(sa: &SkiArea) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("id".into(), JsonValue::String(sa.id.clone()));
    properties.insert("source".into(), JsonValue::String(sa.source.as_str().to_string()));
    properties.insert("activities".into(), activities_json(&sa.activities));
    properties.insert("status".into(), status_json(sa.properties.status));
    properties.insert(
        "name".into(),
        sa.properties.name.clone().map(JsonValue::String).unwrap_or(JsonValue::Null),
    );
    properties.insert(
        "websites".into(),
        JsonValue::Array(sa.properties.websites.iter().cloned().map(JsonValue::String).collect()),
    );
    properties.insert("generated".into(), JsonValue::Bool(sa.properties.generated));
    properties.insert("sources".into(), sources_json(&sa.properties.sources));
    if let Some(stats) = &sa.properties.statistics {
        properties.insert("statistics".into(), stats.clone());
    }
    if let Some(loc) = &sa.properties.location {
        properties.insert("location".into(), loc.clone());
    }
    if let Some(rc) = &sa.properties.run_convention {
        properties.insert("runConvention".into(), JsonValue::String(rc.clone()));
    }

    Feature {
        bbox: None,
        geometry: Some(sa.geometry.to_geojson()),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn lift_feature(lift: &Lift, summaries: &BTreeMap<Key, JsonValue>) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("id".into(), JsonValue::String(lift.id.clone()));
    properties.insert("activities".into(), activities_json(&lift.activities));
    properties.insert("skiAreas".into(), membership_summaries(&lift.ski_areas, summaries));

    Feature {
        bbox: None,
        geometry: Some(lift.geometry.to_geojson()),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn run_feature(run: &Run, summaries: &BTreeMap<Key, JsonValue>) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("id".into(), JsonValue::String(run.id.clone()));
    properties.insert("activities".into(), activities_json(&run.activities));
    properties.insert("isBasisForNewSkiArea".into(), JsonValue::Bool(run.flags.is_basis_for_new_ski_area));
    properties.insert("skiAreas".into(), membership_summaries(&run.ski_areas, summaries));

    Feature {
        bbox: None,
        geometry: Some(run.geometry.to_geojson()),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

#[allow(dead_code)]
fn spot_feature(spot: &Spot, summaries: &BTreeMap<Key, JsonValue>) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("id".into(), JsonValue::String(spot.id.clone()));
    properties.insert("skiAreas".into(), membership_summaries(&spot.ski_areas, summaries));

    Feature {
        bbox: None,
        geometry: Some(spot.geometry.to_geojson()),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activity, Flags, Geometry, Source, SourceRef, SkiAreaProperties};
    use crate::store::memory::MemoryStore;
    use crate::store::{ObjectStore, Record};
    use std::collections::BTreeSet;

    fn ski_area(id: &str) -> SkiArea {
        SkiArea {
            id: id.to_string(),
            source: Source::Osm,
            geometry: Geometry::Point(geo::Point::new(10.0, 45.0)),
            activities: BTreeSet::from([Activity::Downhill]),
            flags: Flags::default(),
            properties: SkiAreaProperties {
                name: Some("Test Area".into()),
                websites: vec![],
                sources: vec![SourceRef { source: Source::Osm, id: id.to_string() }],
                status: Some(SkiAreaStatus::Operating),
                generated: false,
                location: None,
                statistics: None,
                run_convention: None,
            },
        }
    }

    fn lift(id: &str, ski_areas: &[&str]) -> Lift {
        Lift {
            id: id.to_string(),
            lift_type: crate::model::LiftType::ChairLift,
            geometry: Geometry::LineString(geo::LineString::from(vec![(10.0, 45.0), (10.01, 45.01)])),
            geometry_with_elevation: None,
            activities: BTreeSet::from([Activity::Downhill]),
            flags: Flags::default(),
            ski_areas: Membership::from_vec(ski_areas.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[tokio::test]
    async fn lift_gains_ski_area_summary_with_name_and_status() {
        let store = MemoryStore::new();
        store.save(Record::SkiArea(ski_area("sa-1"))).await.unwrap();
        store.save(Record::Lift(lift("lift-1", &["sa-1"]))).await.unwrap();

        let (exported, summary) = export(&store).await.unwrap();
        assert_eq!(summary.lifts, 1);
        let feature = &exported.lifts.features[0];
        let ski_areas = feature.properties.as_ref().unwrap().get("skiAreas").unwrap();
        let arr = ski_areas.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["name"], JsonValue::String("Test Area".into()));
        assert_eq!(arr[0]["status"], JsonValue::String("operating".into()));
    }

    #[tokio::test]
    async fn lift_with_no_membership_gets_empty_ski_areas_array() {
        let store = MemoryStore::new();
        store.save(Record::Lift(lift("lift-1", &[]))).await.unwrap();

        let (exported, _summary) = export(&store).await.unwrap();
        let feature = &exported.lifts.features[0];
        let ski_areas = feature.properties.as_ref().unwrap().get("skiAreas").unwrap();
        assert!(ski_areas.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ski_area_feature_exports_all_merged_sources() {
        let mut sa = ski_area("sa-1");
        sa.properties.sources =
            vec![SourceRef { source: Source::Osm, id: "osm-1".into() }, SourceRef { source: Source::Skimap, id: "skimap-1".into() }];

        let store = MemoryStore::new();
        store.save(Record::SkiArea(sa)).await.unwrap();

        let (exported, _summary) = export(&store).await.unwrap();
        let feature = &exported.ski_areas.features[0];
        let sources = feature.properties.as_ref().unwrap().get("sources").unwrap().as_array().unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0]["source"], JsonValue::String("openstreetmap".into()));
        assert_eq!(sources[0]["id"], JsonValue::String("osm-1".into()));
        assert_eq!(sources[1]["source"], JsonValue::String("skimap_org".into()));
        assert_eq!(sources[1]["id"], JsonValue::String("skimap-1".into()));
    }
}
