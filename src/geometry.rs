//! Polygon repair, dissolve and simplification.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::orient::Direction;
use geo::{unary_union, Area, BooleanOps, Coord, CoordsIter, Line, LineString, MultiPolygon, Orient, Polygon};
use geo::{Simplify, SimplifyVwPreserve, Validation};

/// Rebuild an invalid geometry from simple rings.
///
/// Valid input is returned untouched. Self-intersecting rings are cut at
/// each crossing into simple loops, so every lobe of a bow-tie survives
/// with its full area; hole loops are subtracted from the shell loops. If
/// the pieces still overlap they are unioned, which may move vertices near
/// the defects.
pub fn repair_geometry(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    if geometry.is_valid() {
        return geometry.clone();
    }
    let candidate = MultiPolygon::new(geometry.0.iter().flat_map(repair_polygon).collect());
    if candidate.is_valid() {
        candidate
    } else {
        unary_union(candidate.0.iter())
    }
}

fn repair_polygon(polygon: &Polygon<f64>) -> Vec<Polygon<f64>> {
    let shells = simple_loops(polygon.exterior());
    let holes: Vec<Polygon<f64>> = polygon.interiors().iter().flat_map(simple_loops).collect();
    if holes.is_empty() {
        return shells;
    }
    unary_union(shells.iter()).difference(&unary_union(holes.iter())).0
}

/// Split a ring into counter-clockwise polygons with no self-crossings.
/// Zero-area loops are discarded.
fn simple_loops(ring: &LineString<f64>) -> Vec<Polygon<f64>> {
    let mut pending = vec![ring.0.clone()];
    let mut loops = Vec::new();

    while let Some(mut coords) = pending.pop() {
        coords.dedup();
        while coords.len() > 1 && coords.first() == coords.last() {
            coords.pop();
        }
        if coords.len() < 3 {
            continue;
        }
        match split_at_crossing(&coords) {
            Some((first, second)) => {
                pending.push(first);
                pending.push(second);
            }
            None => {
                let polygon = Polygon::new(LineString::from(coords), vec![]);
                if polygon.unsigned_area() > 0.0 {
                    loops.push(polygon.orient(Direction::Default));
                }
            }
        }
    }
    loops
}

/// Find the first pair of non-adjacent edges of an open ring that meet in a
/// single point and cut the ring there into two shorter rings.
fn split_at_crossing(coords: &[Coord<f64>]) -> Option<(Vec<Coord<f64>>, Vec<Coord<f64>>)> {
    let n = coords.len();
    let edge = |k: usize| Line::new(coords[k], coords[(k + 1) % n]);

    for i in 0..n {
        for j in (i + 2)..n {
            if i == 0 && j == n - 1 {
                continue;
            }
            if let Some(LineIntersection::SinglePoint { intersection, .. }) = line_intersection(edge(i), edge(j)) {
                let mut first = vec![intersection];
                first.extend_from_slice(&coords[i + 1..=j]);
                let mut second = vec![intersection];
                second.extend_from_slice(&coords[j + 1..]);
                second.extend_from_slice(&coords[..=i]);
                return Some((first, second));
            }
        }
    }
    None
}

/// Union every polygon of every member into one geometry.
pub fn dissolve_group<'a>(members: impl IntoIterator<Item = &'a MultiPolygon<f64>>) -> MultiPolygon<f64> {
    let polygons: Vec<&Polygon<f64>> = members.into_iter().flat_map(|mp| mp.0.iter()).collect();
    unary_union(polygons)
}

/// Douglas-Peucker simplification that never returns a geometry less
/// valid than its input.
///
/// Rings that would collapse keep their vertices. A polygon whose
/// simplified form is invalid falls back to the topology-preserving
/// Visvalingam-Whyatt variant (area threshold `tolerance²`), then to the
/// original polygon.
pub fn simplify_preserving(geometry: &MultiPolygon<f64>, tolerance: f64) -> MultiPolygon<f64> {
    if tolerance <= 0.0 {
        return geometry.clone();
    }
    let simplified = MultiPolygon::new(
        geometry
            .0
            .iter()
            .map(|p| simplify_polygon(p, tolerance))
            .collect(),
    );
    // Members may start overlapping each other after simplification.
    if geometry.is_valid() && !simplified.is_valid() {
        return geometry.clone();
    }
    simplified
}

fn simplify_polygon(polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64> {
    let exterior = simplify_ring(polygon.exterior(), tolerance);
    let interiors: Vec<LineString<f64>> = polygon
        .interiors()
        .iter()
        .map(|ring| simplify_ring(ring, tolerance))
        .collect();
    let candidate = Polygon::new(exterior, interiors);
    if candidate.is_valid() {
        return candidate;
    }

    let fallback = polygon.simplify_vw_preserve(&(tolerance * tolerance));
    if fallback.exterior().0.len() >= 4 && fallback.is_valid() {
        return fallback;
    }
    polygon.clone()
}

fn simplify_ring(ring: &LineString<f64>, tolerance: f64) -> LineString<f64> {
    let simplified = ring.simplify(&tolerance);
    if simplified.0.len() < 4 {
        ring.clone()
    } else {
        simplified
    }
}

pub fn vertex_count(geometry: &MultiPolygon<f64>) -> usize {
    geometry.coords_count()
}

pub fn area(geometry: &MultiPolygon<f64>) -> f64 {
    geometry.unsigned_area()
}

pub fn is_valid(geometry: &MultiPolygon<f64>) -> bool {
    geometry.is_valid()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use geo::{polygon, BoundingRect};

    pub(crate) fn unit_square(x: f64, y: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x, y: y),
            (x: x + 1.0, y: y),
            (x: x + 1.0, y: y + 1.0),
            (x: x, y: y + 1.0),
        ]])
    }

    fn wobbly_square() -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 0.5, y: 0.0004),
            (x: 1.0, y: 0.0),
            (x: 1.0003, y: 0.5),
            (x: 1.0, y: 1.0),
            (x: 0.5, y: 0.9998),
            (x: 0.0, y: 1.0),
            (x: -0.0002, y: 0.5),
        ]])
    }

    #[test]
    fn test_valid_geometry_is_not_touched() {
        let square = unit_square(0.0, 0.0);
        assert_eq!(repair_geometry(&square), square);
    }

    #[test]
    fn test_repair_bow_tie() {
        let bow_tie = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 2.0, y: 2.0),
            (x: 2.0, y: 0.0),
            (x: 0.0, y: 2.0),
        ]]);
        assert!(!is_valid(&bow_tie));

        let repaired = repair_geometry(&bow_tie);
        assert!(is_valid(&repaired));
        assert_eq!(repaired.0.len(), 2, "both lobes should survive");
        assert!((area(&repaired) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_repair_keeps_holes_out() {
        let shell = LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)]);
        let twisted_hole = LineString::from(vec![(2.0, 2.0), (4.0, 4.0), (4.0, 2.0), (2.0, 4.0), (2.0, 2.0)]);
        let shape = MultiPolygon::new(vec![Polygon::new(shell, vec![twisted_hole])]);
        assert!(!is_valid(&shape));

        let repaired = repair_geometry(&shape);
        assert!((area(&repaired) - 98.0).abs() < 1e-9);
    }

    #[test]
    fn test_crossing_split_covers_every_vertex() {
        let coords: Vec<Coord<f64>> = vec![(0.0, 0.0).into(), (2.0, 2.0).into(), (2.0, 0.0).into(), (0.0, 2.0).into()];
        let (first, second) = split_at_crossing(&coords).unwrap();
        assert_eq!(first.len() + second.len(), coords.len() + 2);
        assert_eq!(first[0], Coord { x: 1.0, y: 1.0 });
        assert_eq!(second[0], Coord { x: 1.0, y: 1.0 });

        let square: Vec<Coord<f64>> = vec![(0.0, 0.0).into(), (1.0, 0.0).into(), (1.0, 1.0).into(), (0.0, 1.0).into()];
        assert!(split_at_crossing(&square).is_none());
    }

    #[test]
    fn test_dissolve_adjacent_squares() {
        let a = unit_square(0.0, 0.0);
        let b = unit_square(1.0, 0.0);
        let merged = dissolve_group([&a, &b]);

        assert_eq!(merged.0.len(), 1, "adjacent squares should form one polygon");
        assert!((area(&merged) - 2.0).abs() < 1e-9);
        let bbox = merged.bounding_rect().unwrap();
        assert_eq!((bbox.min().x, bbox.min().y), (0.0, 0.0));
        assert_eq!((bbox.max().x, bbox.max().y), (2.0, 1.0));
    }

    #[test]
    fn test_dissolve_disjoint_squares_keeps_both() {
        let a = unit_square(0.0, 0.0);
        let b = unit_square(5.0, 5.0);
        let merged = dissolve_group([&a, &b]);
        assert_eq!(merged.0.len(), 2);
        assert!((area(&merged) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_simplify_reduces_and_stays_valid() {
        let shape = wobbly_square();
        let simplified = simplify_preserving(&shape, 1e-3);

        assert!(vertex_count(&simplified) < vertex_count(&shape));
        assert!(is_valid(&simplified));
        assert_eq!(simplified.0[0].exterior().0.first(), simplified.0[0].exterior().0.last());
    }

    #[test]
    fn test_simplify_zero_tolerance_is_identity() {
        let shape = wobbly_square();
        assert_eq!(simplify_preserving(&shape, 0.0), shape);
    }

    #[test]
    fn test_simplify_never_collapses_small_polygons() {
        let tiny = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 0.0001, y: 0.0),
            (x: 0.0001, y: 0.0001),
            (x: 0.0, y: 0.0001),
        ]]);
        let simplified = simplify_preserving(&tiny, 1e-3);

        assert!(is_valid(&simplified));
        assert!(vertex_count(&simplified) <= vertex_count(&tiny));
        assert!(area(&simplified) > 0.0);
    }
}
