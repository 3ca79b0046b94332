use super::geometry::segments_intersect;
use crate::ir::{Bounds, Connection, Direction, Point};

// How strongly one axis has to dominate before it wins over the flow direction.
const DIRECTION_PREF_RATIO: f32 = 1.35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum EdgeSide {
    Left,
    Right,
    Top,
    Bottom,
}

pub(super) fn edge_sides(from: &Bounds, to: &Bounds, direction: Direction) -> (EdgeSide, EdgeSide) {
    let from_c = from.center();
    let to_c = to.center();
    let dx = to_c.x - from_c.x;
    let dy = to_c.y - from_c.y;
    let x_overlap = from.x < to.right() && to.x < from.right();
    let y_overlap = from.y < to.bottom() && to.y < from.bottom();

    let ratio = dx.abs() / dy.abs().max(1e-3);
    let horiz_pref = ratio > DIRECTION_PREF_RATIO || (y_overlap && ratio > 0.9);
    let vert_pref = ratio < (1.0 / DIRECTION_PREF_RATIO) || (x_overlap && ratio < 1.1);
    let use_horizontal = if horiz_pref && !vert_pref {
        true
    } else if vert_pref && !horiz_pref {
        false
    } else {
        direction == Direction::LeftRight
    };

    if use_horizontal {
        if dx >= 0.0 {
            (EdgeSide::Right, EdgeSide::Left)
        } else {
            (EdgeSide::Left, EdgeSide::Right)
        }
    } else if dy >= 0.0 {
        (EdgeSide::Bottom, EdgeSide::Top)
    } else {
        (EdgeSide::Top, EdgeSide::Bottom)
    }
}

pub(super) fn side_anchor(bounds: &Bounds, side: EdgeSide) -> Point {
    let c = bounds.center();
    match side {
        EdgeSide::Left => Point::new(bounds.x, c.y),
        EdgeSide::Right => Point::new(bounds.right(), c.y),
        EdgeSide::Top => Point::new(c.x, bounds.y),
        EdgeSide::Bottom => Point::new(c.x, bounds.bottom()),
    }
}

fn side_is_horizontal(side: EdgeSide) -> bool {
    matches!(side, EdgeSide::Left | EdgeSide::Right)
}

/// Orthogonal route between two shapes with at most two bends.
pub(super) fn route_orthogonal(from: &Bounds, to: &Bounds, direction: Direction) -> Vec<Point> {
    let (start_side, end_side) = edge_sides(from, to, direction);
    let start = side_anchor(from, start_side);
    let end = side_anchor(to, end_side);
    let points = if side_is_horizontal(start_side) {
        let mid_x = (start.x + end.x) / 2.0;
        vec![
            start,
            Point::new(mid_x, start.y),
            Point::new(mid_x, end.y),
            end,
        ]
    } else {
        let mid_y = (start.y + end.y) / 2.0;
        vec![
            start,
            Point::new(start.x, mid_y),
            Point::new(end.x, mid_y),
            end,
        ]
    };
    compress_path(&points)
}

/// Drop duplicate and collinear interior points.
pub(super) fn compress_path(points: &[Point]) -> Vec<Point> {
    if points.len() <= 2 {
        return points.to_vec();
    }
    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    out.push(points[0]);
    for idx in 1..points.len() - 1 {
        let prev = out[out.len() - 1];
        let curr = points[idx];
        if (curr.x - prev.x).abs() <= 1e-4 && (curr.y - prev.y).abs() <= 1e-4 {
            continue;
        }
        let next = points[idx + 1];
        let dx1 = curr.x - prev.x;
        let dy1 = curr.y - prev.y;
        let dx2 = next.x - curr.x;
        let dy2 = next.y - curr.y;
        if (dx1.abs() <= 1e-4 && dx2.abs() <= 1e-4) || (dy1.abs() <= 1e-4 && dy2.abs() <= 1e-4) {
            continue;
        }
        out.push(curr);
    }
    let last = points[points.len() - 1];
    let tail = out[out.len() - 1];
    if (last.x - tail.x).abs() > 1e-4 || (last.y - tail.y).abs() > 1e-4 || out.len() == 1 {
        out.push(last);
    }
    out
}

/// Number of connection pairs whose paths cross.
///
/// Connections sharing an endpoint shape meet there by construction and are
/// not compared; within a pair, only segments of distinct connections are tested.
pub fn count_crossings(connections: &[&Connection]) -> usize {
    let mut crossings = 0usize;
    for (i, a) in connections.iter().enumerate() {
        for b in &connections[i + 1..] {
            if a.touches(&b.source) || a.touches(&b.target) {
                continue;
            }
            let crossed = a.waypoints.windows(2).any(|sa| {
                b.waypoints
                    .windows(2)
                    .any(|sb| segments_intersect(sa[0], sa[1], sb[0], sb[1]))
            });
            if crossed {
                crossings += 1;
            }
        }
    }
    crossings
}
