//! Core record types shared by every component: the Object Store persists
//! these, the Loader produces them, the pipeline mutates them, the Exporter
//! reads them back out.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Stable identifier, primary key in the store.
pub type Key = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    SkiArea,
    Lift,
    Run,
    Spot,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::SkiArea => "ski_area",
            Kind::Lift => "lift",
            Kind::Run => "run",
            Kind::Spot => "spot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Osm,
    Skimap,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Osm => "openstreetmap",
            Source::Skimap => "skimap_org",
        }
    }
}

/// The two activities that drive clustering. Other declared uses on an
/// input feature (e.g. Skitour) never reach this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Activity {
    Downhill,
    Nordic,
}

pub type Activities = BTreeSet<Activity>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiftType {
    CableCar,
    Gondola,
    ChairLift,
    DragLift,
    MagicCarpet,
    RopeTow,
    TBar,
    JBar,
    Funicular,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDifficulty {
    Easy,
    Intermediate,
    Advanced,
    Expert,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotPosition {
    Top,
    Mid,
    Bottom,
}

/// Sentinel point used for OSM ski areas imported from a site relation
/// before they have real geometry. Phase 8 removes any SkiArea still
/// carrying this point after augmentation.
pub const SENTINEL_LON: f64 = 360.0;
pub const SENTINEL_LAT: f64 = 360.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(geo::Point<f64>),
    LineString(geo::LineString<f64>),
    MultiLineString(geo::MultiLineString<f64>),
    Polygon(geo::Polygon<f64>),
    MultiPolygon(geo::MultiPolygon<f64>),
}

impl Geometry {
    pub fn is_polygonal(&self) -> bool {
        matches!(self, Geometry::Polygon(_) | Geometry::MultiPolygon(_))
    }

    pub fn to_geo(&self) -> geo::Geometry<f64> {
        match self {
            Geometry::Point(p) => geo::Geometry::Point(*p),
            Geometry::LineString(l) => geo::Geometry::LineString(l.clone()),
            Geometry::MultiLineString(m) => geo::Geometry::MultiLineString(m.clone()),
            Geometry::Polygon(p) => geo::Geometry::Polygon(p.clone()),
            Geometry::MultiPolygon(m) => geo::Geometry::MultiPolygon(m.clone()),
        }
    }

    pub fn sentinel_point(ski_area_id: &str) -> Self {
        let _ = ski_area_id; // the sentinel carries the id only in GeoJSON output properties
        Geometry::Point(geo::Point::new(SENTINEL_LON, SENTINEL_LAT))
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Geometry::Point(p) if p.x() == SENTINEL_LON && p.y() == SENTINEL_LAT)
    }

    pub fn to_geojson(&self) -> geojson::Geometry {
        use geojson::Value;
        let value = match self {
            Geometry::Point(p) => Value::Point(vec![p.x(), p.y()]),
            Geometry::LineString(l) => {
                Value::LineString(l.points().map(|p| vec![p.x(), p.y()]).collect())
            }
            Geometry::MultiLineString(m) => Value::MultiLineString(
                m.iter()
                    .map(|l| l.points().map(|p| vec![p.x(), p.y()]).collect())
                    .collect(),
            ),
            Geometry::Polygon(poly) => Value::Polygon(polygon_coords(poly)),
            Geometry::MultiPolygon(mp) => {
                Value::MultiPolygon(mp.iter().map(polygon_coords).collect())
            }
        };
        geojson::Geometry::new(value)
    }

    pub fn from_geojson(g: &geojson::Geometry) -> Option<Self> {
        use geojson::Value;
        Some(match &g.value {
            Value::Point(c) => Geometry::Point(geo::Point::new(c[0], c[1])),
            Value::LineString(c) => Geometry::LineString(coords_to_linestring(c)),
            Value::MultiLineString(c) => {
                Geometry::MultiLineString(geo::MultiLineString::new(
                    c.iter().map(|l| coords_to_linestring(l)).collect(),
                ))
            }
            Value::Polygon(rings) => Geometry::Polygon(rings_to_polygon(rings)),
            Value::MultiPolygon(polys) => Geometry::MultiPolygon(geo::MultiPolygon::new(
                polys.iter().map(|rings| rings_to_polygon(rings)).collect(),
            )),
            Value::GeometryCollection(_) => return None,
        })
    }
}

fn coords_to_linestring(coords: &[Vec<f64>]) -> geo::LineString<f64> {
    geo::LineString::new(
        coords
            .iter()
            .map(|c| geo::Coord { x: c[0], y: c[1] })
            .collect(),
    )
}

fn rings_to_polygon(rings: &[Vec<Vec<f64>>]) -> geo::Polygon<f64> {
    let exterior = rings.first().map(|r| coords_to_linestring(r)).unwrap_or_default();
    let interiors = rings
        .iter()
        .skip(1)
        .map(|r| coords_to_linestring(r))
        .collect();
    geo::Polygon::new(exterior, interiors)
}

fn polygon_coords(poly: &geo::Polygon<f64>) -> Vec<Vec<Vec<f64>>> {
    let mut rings = vec![poly
        .exterior()
        .points()
        .map(|p| vec![p.x(), p.y()])
        .collect()];
    for interior in poly.interiors() {
        rings.push(interior.points().map(|p| vec![p.x(), p.y()]).collect());
    }
    rings
}

/// One ski area the spatial engine links to; appears in export summaries and
/// in the merger's `sources` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub source: Source,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkiAreaStatus {
    Operating,
    Disused,
    Proposed,
    Abandoned,
}

#[derive(Debug, Clone, Default)]
pub struct SkiAreaProperties {
    pub name: Option<String>,
    pub websites: Vec<String>,
    pub sources: Vec<SourceRef>,
    pub status: Option<SkiAreaStatus>,
    pub generated: bool,
    pub location: Option<serde_json::Value>,
    pub statistics: Option<serde_json::Value>,
    pub run_convention: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Flags {
    pub is_polygon: bool,
    pub is_basis_for_new_ski_area: bool,
    pub is_in_ski_area_polygon: bool,
    pub is_in_ski_area_site: bool,
}

/// The `skiAreas` membership list: ordered but set-semantics (invariant P3 —
/// never contains a duplicate key).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership(Vec<Key>);

impl Membership {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_vec(v: Vec<Key>) -> Self {
        let mut m = Self::new();
        for k in v {
            m.insert(k);
        }
        m
    }

    pub fn insert(&mut self, key: Key) -> bool {
        if self.0.contains(&key) {
            false
        } else {
            self.0.push(key);
            true
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|k| k != key);
        before != self.0.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|k| k == key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Key] {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct SkiArea {
    pub id: Key,
    pub source: Source,
    pub geometry: Geometry,
    pub activities: Activities,
    pub flags: Flags,
    pub properties: SkiAreaProperties,
}

impl SkiArea {
    pub fn is_polygon(&self) -> bool {
        self.geometry.is_polygonal()
    }
}

#[derive(Debug, Clone)]
pub struct Lift {
    pub id: Key,
    pub lift_type: LiftType,
    pub geometry: Geometry,
    pub geometry_with_elevation: Option<Geometry>,
    pub activities: Activities,
    pub flags: Flags,
    pub ski_areas: Membership,
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: Key,
    pub difficulty: Option<RunDifficulty>,
    pub geometry: Geometry,
    pub geometry_with_elevation: Option<Geometry>,
    pub activities: Activities,
    pub flags: Flags,
    pub ski_areas: Membership,
    pub raster_pixels: Vec<String>,
    pub is_groomed: bool,
    pub has_snowmaking: bool,
    pub has_snowfarming: bool,
}

#[derive(Debug, Clone)]
pub struct Spot {
    pub id: Key,
    pub geometry: Geometry,
    pub lift_id: Option<Key>,
    pub position: Option<SpotPosition>,
    pub ski_areas: Membership,
}

/// A non-SkiArea record, the shape `findNearbyObjects` and the Traversal
/// Core operate over.
#[derive(Debug, Clone)]
pub enum MemberObject {
    Lift(Lift),
    Run(Run),
    Spot(Spot),
}

impl MemberObject {
    pub fn id(&self) -> &str {
        match self {
            MemberObject::Lift(l) => &l.id,
            MemberObject::Run(r) => &r.id,
            MemberObject::Spot(s) => &s.id,
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            MemberObject::Lift(_) => Kind::Lift,
            MemberObject::Run(_) => Kind::Run,
            MemberObject::Spot(_) => Kind::Spot,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        match self {
            MemberObject::Lift(l) => &l.geometry,
            MemberObject::Run(r) => &r.geometry,
            MemberObject::Spot(s) => &s.geometry,
        }
    }

    pub fn activities(&self) -> Activities {
        match self {
            MemberObject::Lift(l) => l.activities.clone(),
            MemberObject::Run(r) => r.activities.clone(),
            MemberObject::Spot(_) => Activities::new(),
        }
    }

    pub fn ski_areas(&self) -> &Membership {
        match self {
            MemberObject::Lift(l) => &l.ski_areas,
            MemberObject::Run(r) => &r.ski_areas,
            MemberObject::Spot(s) => &s.ski_areas,
        }
    }

    pub fn flags(&self) -> Option<&Flags> {
        match self {
            MemberObject::Lift(l) => Some(&l.flags),
            MemberObject::Run(r) => Some(&r.flags),
            MemberObject::Spot(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_has_set_semantics() {
        let mut m = Membership::new();
        assert!(m.insert("a".into()));
        assert!(!m.insert("a".into()));
        assert_eq!(m.as_slice(), &["a".to_string()]);
    }

    #[test]
    fn membership_remove_scrubs_key() {
        let mut m = Membership::from_vec(vec!["a".into(), "b".into()]);
        assert!(m.remove("a"));
        assert!(!m.contains("a"));
        assert!(m.contains("b"));
    }

    #[test]
    fn sentinel_point_round_trips() {
        let g = Geometry::sentinel_point("ski-area-1");
        assert!(g.is_sentinel());
        let other = Geometry::Point(geo::Point::new(1.0, 1.0));
        assert!(!other.is_sentinel());
    }

    #[test]
    fn geojson_round_trip_polygon() {
        let poly = geo::Polygon::new(
            geo::LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]),
            vec![],
        );
        let g = Geometry::Polygon(poly);
        let gj = g.to_geojson();
        let back = Geometry::from_geojson(&gj).unwrap();
        assert_eq!(g, back);
    }
}
