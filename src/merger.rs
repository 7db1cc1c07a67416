//! C5: merges two or more same-cluster SkiArea records from different
//! sources into one canonical record (§4.5). The OSM-preference rule is
//! asymmetric for `websites` — see §9/§11 "merge preference" — and that
//! asymmetry is deliberate, not a bug.

use std::collections::BTreeSet;

use log::info;

use crate::error::ClusterError;
use crate::model::{Key, Membership, SkiArea, Source, SourceRef};
use crate::store::{ObjectStore, SkiAreaDelta};

/// Picks the primary participant: OSM if present, else the first input.
fn choose_primary_index(participants: &[SkiArea]) -> usize {
    participants
        .iter()
        .position(|p| p.source == Source::Osm)
        .unwrap_or(0)
}

fn merge_sources(participants: &[SkiArea]) -> Vec<SourceRef> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for p in participants {
        for s in &p.properties.sources {
            let key = (s.source.as_str(), s.id.clone());
            if seen.insert(key) {
                out.push(s.clone());
            }
        }
    }
    out
}

/// Produces the merged record. Does not touch the store; callers persist
/// the result and rewrite membership lists (see [`merge_into_store`]).
pub fn merge(participants: Vec<SkiArea>) -> SkiArea {
    assert!(!participants.is_empty(), "merge requires at least one participant");
    let primary_idx = choose_primary_index(&participants);

    let activities = participants
        .iter()
        .flat_map(|p| p.activities.iter().copied())
        .collect();

    let name = participants[primary_idx]
        .properties
        .name
        .clone()
        .or_else(|| participants.iter().find_map(|p| p.properties.name.clone()));

    let status = participants[primary_idx]
        .properties
        .status
        .or_else(|| participants.iter().find_map(|p| p.properties.status));

    let websites = if !participants[primary_idx].properties.websites.is_empty() {
        participants[primary_idx].properties.websites.clone()
    } else {
        let mut all: Vec<String> = participants
            .iter()
            .flat_map(|p| p.properties.websites.iter().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    };

    let generated = participants.iter().all(|p| p.properties.generated);
    let sources = merge_sources(&participants);

    let mut primary = participants[primary_idx].clone();
    primary.activities = activities;
    primary.properties.name = name;
    primary.properties.status = status;
    primary.properties.websites = websites;
    primary.properties.generated = generated;
    primary.properties.sources = sources;
    primary.properties.location = None;
    primary
}

/// Runs the full merge against the store: persists the merged record,
/// rewrites every other record's membership list to drop the absorbed keys
/// in favor of the primary's key, and removes the absorbed SkiAreas.
pub async fn merge_into_store(
    store: &dyn ObjectStore,
    participants: Vec<SkiArea>,
) -> Result<Key, ClusterError> {
    let absorbed_keys: Vec<Key> = {
        let primary_idx = choose_primary_index(&participants);
        participants
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != primary_idx)
            .map(|(_, p)| p.id.clone())
            .collect()
    };

    let merged = merge(participants);
    let primary_key = merged.id.clone();

    store
        .update(
            &primary_key,
            crate::store::Delta::SkiArea(SkiAreaDelta {
                geometry: None,
                activities: Some(merged.activities.clone()),
                properties: Some(merged.properties.clone()),
                flags: None,
            }),
        )
        .await?;

    for absorbed_key in &absorbed_keys {
        let members = store.get_objects_for_ski_area(absorbed_key).await?;
        let mut deltas = Vec::new();
        for member in members {
            let mut ski_areas = member.ski_areas().clone();
            ski_areas.remove(absorbed_key);
            ski_areas.insert(primary_key.clone());
            deltas.push(rewrite_membership_delta(&member, ski_areas));
        }
        store.update_many(deltas).await?;
        store.remove(absorbed_key).await?;
    }

    info!("merged {} ski area(s) into {}", absorbed_keys.len(), primary_key);
    Ok(primary_key)
}

fn rewrite_membership_delta(
    member: &crate::model::MemberObject,
    ski_areas: Membership,
) -> (Key, crate::store::Delta) {
    use crate::model::MemberObject;
    use crate::store::{Delta, LiftDelta, RunDelta};

    match member {
        MemberObject::Lift(l) => (
            l.id.clone(),
            Delta::Lift(LiftDelta::default()).with_ski_areas(ski_areas),
        ),
        MemberObject::Run(r) => (
            r.id.clone(),
            Delta::Run(RunDelta::default()).with_ski_areas(ski_areas),
        ),
        MemberObject::Spot(s) => (
            s.id.clone(),
            Delta::Spot(crate::store::SpotDelta::default()).with_ski_areas(ski_areas),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activity, Flags, Geometry, SkiAreaProperties};
    use std::collections::BTreeSet;

    fn ski_area(id: &str, source: Source, websites: Vec<String>, generated: bool) -> SkiArea {
        SkiArea {
            id: id.to_string(),
            source,
            geometry: Geometry::Point(geo::Point::new(0.0, 0.0)),
            activities: BTreeSet::from([Activity::Downhill]),
            flags: Flags::default(),
            properties: SkiAreaProperties {
                name: None,
                websites,
                sources: vec![SourceRef { source, id: id.to_string() }],
                status: None,
                generated,
                location: None,
                statistics: None,
                run_convention: None,
            },
        }
    }

    #[test]
    fn osm_wins_primary_over_skimap() {
        let osm = ski_area("osm-1", Source::Osm, vec![], false);
        let skimap = ski_area("skimap-1", Source::Skimap, vec![], false);
        let merged = merge(vec![skimap, osm]);
        assert_eq!(merged.id, "osm-1");
        assert_eq!(merged.source, Source::Osm);
    }

    #[test]
    fn websites_prefer_osm_when_osm_has_any() {
        let osm = ski_area("osm-1", Source::Osm, vec!["https://osm.example".into()], false);
        let skimap = ski_area("skimap-1", Source::Skimap, vec!["https://skimap.example".into()], false);
        let merged = merge(vec![osm, skimap]);
        assert_eq!(merged.properties.websites, vec!["https://osm.example".to_string()]);
    }

    #[test]
    fn websites_union_when_osm_has_none() {
        let osm = ski_area("osm-1", Source::Osm, vec![], false);
        let skimap = ski_area("skimap-1", Source::Skimap, vec!["https://skimap.example".into()], false);
        let merged = merge(vec![osm, skimap]);
        assert_eq!(merged.properties.websites, vec!["https://skimap.example".to_string()]);
    }

    #[test]
    fn generated_is_logical_and() {
        let a = ski_area("osm-1", Source::Osm, vec![], true);
        let b = ski_area("skimap-1", Source::Skimap, vec![], false);
        let merged = merge(vec![a, b]);
        assert!(!merged.properties.generated);
    }

    #[test]
    fn sources_are_deduplicated_by_type_and_id() {
        let mut a = ski_area("osm-1", Source::Osm, vec![], false);
        a.properties.sources.push(SourceRef { source: Source::Osm, id: "osm-1".into() });
        let b = ski_area("skimap-1", Source::Skimap, vec![], false);
        let merged = merge(vec![a, b]);
        assert_eq!(merged.properties.sources.len(), 2);
    }
}
