// Exact rectangle / segment predicates shared by routing, crossing counts and
// label placement. Rectangles are closed for segment tests and open for
// rectangle-rectangle overlap, so touching edges never count as overlap.

use crate::ir::{Bounds, Point};

const EPS: f32 = 1e-4;

/// True only for a non-zero-area intersection.
pub fn rects_overlap(a: &Bounds, b: &Bounds) -> bool {
    let w = a.right().min(b.right()) - a.x.max(b.x);
    let h = a.bottom().min(b.bottom()) - a.y.max(b.y);
    w > 0.0 && h > 0.0
}

fn point_inside_rect(point: Point, rect: &Bounds) -> bool {
    point.x >= rect.x && point.x <= rect.right() && point.y >= rect.y && point.y <= rect.bottom()
}

fn orientation(a: Point, b: Point, c: Point) -> f32 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn within_span(point: Point, a: Point, b: Point) -> bool {
    point.x >= a.x.min(b.x) - EPS
        && point.x <= a.x.max(b.x) + EPS
        && point.y >= a.y.min(b.y) - EPS
        && point.y <= a.y.max(b.y) + EPS
}

/// Proper crossings plus collinear / endpoint contact.
pub fn segments_intersect(a: Point, b: Point, c: Point, d: Point) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);
    let crosses = ((o1 > EPS && o2 < -EPS) || (o1 < -EPS && o2 > EPS))
        && ((o3 > EPS && o4 < -EPS) || (o3 < -EPS && o4 > EPS));
    if crosses {
        return true;
    }
    (o1.abs() <= EPS && within_span(c, a, b))
        || (o2.abs() <= EPS && within_span(d, a, b))
        || (o3.abs() <= EPS && within_span(a, c, d))
        || (o4.abs() <= EPS && within_span(b, c, d))
}

/// Whether segment `a`-`b` crosses or lies within `rect`.
///
/// The bounding-box test only rejects; acceptance always comes from an exact
/// containment or edge-crossing test, so a diagonal whose box covers a corner
/// of the rectangle without entering it is reported as clear.
pub fn segment_intersects_rect(a: Point, b: Point, rect: &Bounds) -> bool {
    let seg_box = Bounds::new(
        a.x.min(b.x),
        a.y.min(b.y),
        (a.x - b.x).abs(),
        (a.y - b.y).abs(),
    );
    if seg_box.x > rect.right()
        || seg_box.right() < rect.x
        || seg_box.y > rect.bottom()
        || seg_box.bottom() < rect.y
    {
        return false;
    }
    if point_inside_rect(a, rect) || point_inside_rect(b, rect) {
        return true;
    }
    let corners = [
        Point::new(rect.x, rect.y),
        Point::new(rect.right(), rect.y),
        Point::new(rect.right(), rect.bottom()),
        Point::new(rect.x, rect.bottom()),
    ];
    (0..4).any(|i| segments_intersect(a, b, corners[i], corners[(i + 1) % 4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f32, y: f32) -> Point {
        Point::new(x, y)
    }

    #[test]
    fn overlap_is_symmetric() {
        let rects = [
            Bounds::new(0.0, 0.0, 100.0, 50.0),
            Bounds::new(50.0, 25.0, 100.0, 50.0),
            Bounds::new(100.0, 0.0, 100.0, 50.0),
            Bounds::new(-10.0, -10.0, 5.0, 5.0),
            Bounds::new(20.0, 10.0, 10.0, 10.0),
        ];
        for a in &rects {
            for b in &rects {
                assert_eq!(rects_overlap(a, b), rects_overlap(b, a));
            }
        }
    }

    #[test]
    fn edge_touching_rects_do_not_overlap() {
        let a = Bounds::new(0.0, 0.0, 100.0, 40.0);
        let b = Bounds::new(100.0, 0.0, 100.0, 40.0);
        assert!(!rects_overlap(&a, &b));
        let corner = Bounds::new(100.0, 40.0, 10.0, 10.0);
        assert!(!rects_overlap(&a, &corner));
    }

    #[test]
    fn partial_and_contained_rects_overlap() {
        let a = Bounds::new(0.0, 0.0, 20.0, 20.0);
        assert!(rects_overlap(&a, &Bounds::new(10.0, 10.0, 20.0, 20.0)));
        assert!(rects_overlap(&a, &Bounds::new(5.0, 5.0, 5.0, 5.0)));
        assert!(!rects_overlap(&a, &Bounds::new(25.0, 5.0, 5.0, 5.0)));
    }

    #[test]
    fn horizontal_segment_through_rect() {
        let rect = Bounds::new(10.0, 10.0, 20.0, 20.0);
        assert!(segment_intersects_rect(p(0.0, 20.0), p(40.0, 20.0), &rect));
    }

    #[test]
    fn vertical_segment_through_rect() {
        let rect = Bounds::new(10.0, 10.0, 20.0, 20.0);
        assert!(segment_intersects_rect(p(20.0, 0.0), p(20.0, 40.0), &rect));
    }

    #[test]
    fn segment_fully_inside_rect() {
        let rect = Bounds::new(10.0, 10.0, 20.0, 20.0);
        assert!(segment_intersects_rect(p(12.0, 12.0), p(28.0, 25.0), &rect));
    }

    #[test]
    fn diagonal_segment_crossing_rect() {
        let rect = Bounds::new(10.0, 10.0, 20.0, 20.0);
        assert!(segment_intersects_rect(p(0.0, 0.0), p(40.0, 40.0), &rect));
    }

    #[test]
    fn segment_with_disjoint_bounding_box_misses() {
        let rect = Bounds::new(10.0, 10.0, 20.0, 20.0);
        assert!(!segment_intersects_rect(p(50.0, 0.0), p(80.0, 5.0), &rect));
    }

    #[test]
    fn diagonal_near_corner_misses_despite_box_overlap() {
        let rect = Bounds::new(10.0, 10.0, 20.0, 20.0);
        // The segment's box covers the top-right corner area but the line
        // passes outside it.
        assert!(!segment_intersects_rect(p(25.0, 0.0), p(40.0, 15.0), &rect));
    }

    #[test]
    fn crossing_and_parallel_segments() {
        assert!(segments_intersect(p(0.0, 0.0), p(10.0, 10.0), p(0.0, 10.0), p(10.0, 0.0)));
        assert!(!segments_intersect(p(0.0, 0.0), p(10.0, 0.0), p(0.0, 5.0), p(10.0, 5.0)));
        assert!(segments_intersect(p(0.0, 0.0), p(10.0, 0.0), p(5.0, 0.0), p(15.0, 0.0)));
    }
}
