//! Planar/geodesic geometry math shared by the in-memory store and the
//! Augmenter's point-derivation algorithm (§4.6). The PostGIS-backed store
//! delegates the same operations to `ST_Centroid`/`ST_Buffer` on geography,
//! which are geodesically exact; the helpers here back the in-memory store
//! and are a documented planar approximation suitable for the short
//! distances (hundreds of meters to a few km) this pipeline ever buffers by.

use geo::{Centroid, Coord, GeometryCollection, HaversineDistance, HaversineLength};

use crate::model::Geometry;

const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Converts a great-circle distance in kilometers to a (lon, lat) degree
/// delta at the given latitude, so buffering stays roughly isotropic as you
/// move away from the equator.
fn km_to_degrees(km: f64, latitude_deg: f64) -> (f64, f64) {
    let meters = km * 1000.0;
    let lat_deg = meters / METERS_PER_DEGREE_LAT;
    let lon_scale = latitude_deg.to_radians().cos().max(0.01);
    let lon_deg = meters / (METERS_PER_DEGREE_LAT * lon_scale);
    (lon_deg, lat_deg)
}

/// Buffers a geometry outward by `km`, approximated as an axis-aligned
/// envelope expansion in the in-memory store (the algorithm only ever uses
/// the buffered shape for a bounding `Intersects`/`Contains` test against
/// other geometries' vertex sets, so a conservative rectangular expansion of
/// the geometry's bounding box is sufficient and cheap).
pub fn buffer_bbox(geom: &Geometry, km: f64) -> Option<geo::Rect<f64>> {
    use geo::BoundingRect;
    let g = geom.to_geo();
    let rect = g.bounding_rect()?;
    let mid_lat = (rect.min().y + rect.max().y) / 2.0;
    let (dlon, dlat) = km_to_degrees(km, mid_lat);
    Some(geo::Rect::new(
        Coord {
            x: rect.min().x - dlon,
            y: rect.min().y - dlat,
        },
        Coord {
            x: rect.max().x + dlon,
            y: rect.max().y + dlat,
        },
    ))
}

/// Buffers a geometry by `km` and returns it as a polygon, for use as a
/// `SearchContext.search_polygon`-style query shape. `None` only when the
/// geometry has no bounding rect (an empty collection), mirroring the
/// PostGIS backend's "buffering failed" case (§4.3 step 2).
pub fn buffer_to_polygon(geom: &Geometry, km: f64) -> Option<Geometry> {
    buffer_bbox(geom, km).map(|rect| Geometry::Polygon(rect.to_polygon()))
}

/// Collects every vertex coordinate of a geometry (§4.6 step 2: "nearest
/// point N to C among the vertex set of all member geometries").
pub fn vertices(geom: &Geometry) -> Vec<Coord<f64>> {
    use geo::coords_iter::CoordsIter;
    geom.to_geo().coords_iter().collect()
}

/// Great-circle length in kilometers. Polygonal geometries have no defined
/// length — the Augmenter excludes them from length totals per §4.6.
pub fn length_km(geom: &Geometry) -> f64 {
    match geom {
        Geometry::LineString(l) => l.haversine_length() / 1000.0,
        Geometry::MultiLineString(m) => m.haversine_length() / 1000.0,
        _ => 0.0,
    }
}

/// SkiArea point derivation (§4.6): centroid of the member geometries,
/// biased toward a real vertex rather than floating over empty space.
pub fn derive_point(members: &[Geometry]) -> Option<geo::Point<f64>> {
    if members.is_empty() {
        return None;
    }

    let collection = GeometryCollection::new_from(members.iter().map(Geometry::to_geo).collect());
    let centroid = collection.centroid()?;

    let all_vertices: Vec<Coord<f64>> = members.iter().flat_map(vertices).collect();
    if all_vertices.is_empty() {
        return Some(centroid);
    }

    let nearest = all_vertices
        .into_iter()
        .map(|c| geo::Point::from(c))
        .min_by(|a, b| {
            a.haversine_distance(&centroid)
                .partial_cmp(&b.haversine_distance(&centroid))
                .unwrap()
        })?;

    let distance_m = nearest.haversine_distance(&centroid);
    if distance_m <= 100.0 {
        return Some(centroid);
    }

    // Interpolate 100m along the N -> C segment (planar approximation: the
    // segment is always short relative to the earth's curvature here).
    let frac = 100.0 / distance_m;
    let lon = nearest.x() + frac * (centroid.x() - nearest.x());
    let lat = nearest.y() + frac * (centroid.y() - nearest.y());
    Some(geo::Point::new(lon, lat))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(coords: &[(f64, f64)]) -> Geometry {
        Geometry::LineString(geo::LineString::from(coords.to_vec()))
    }

    #[test]
    fn derive_point_uses_centroid_when_close_to_a_vertex() {
        let members = vec![line(&[(0.0, 0.0), (0.0001, 0.0001)])];
        let p = derive_point(&members).unwrap();
        // centroid of a 2-point line is its midpoint, which is within 100m
        // of both endpoints at this scale.
        assert!((p.x() - 0.00005).abs() < 1e-6);
    }

    #[test]
    fn derive_point_biases_toward_interior_when_far_from_vertices() {
        // A long line: centroid (midpoint) sits far from either endpoint,
        // so the derived point should be pulled back toward the nearest end.
        let members = vec![line(&[(0.0, 0.0), (1.0, 0.0)])];
        let p = derive_point(&members).unwrap();
        let nearest_vertex_dist = p.haversine_distance(&geo::Point::new(0.0, 0.0));
        assert!(nearest_vertex_dist <= 150.0);
    }

    #[test]
    fn length_km_is_zero_for_polygons() {
        let poly = Geometry::Polygon(geo::Polygon::new(
            geo::LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]),
            vec![],
        ));
        assert_eq!(length_km(&poly), 0.0);
    }

    #[test]
    fn buffer_bbox_expands_symmetrically() {
        let g = Geometry::Point(geo::Point::new(10.0, 47.0));
        let rect = buffer_bbox(&g, 0.5).unwrap();
        assert!(rect.min().x < 10.0 && rect.max().x > 10.0);
        assert!(rect.min().y < 47.0 && rect.max().y > 47.0);
    }
}
