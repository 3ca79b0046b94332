// Floating label placement. Runs after geometry is final and only moves
// label rectangles; shapes and connection paths are obstacles.

use super::geometry::{rects_overlap, segment_intersects_rect};
use crate::config::LabelConfig;
use crate::ir::{Bounds, Diagram, Point};
use serde::Serialize;

// Moves smaller than this are rounding noise, not a placement change.
const LABEL_MOVE_EPS: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelOrientation {
    Top,
    Bottom,
    Left,
    Right,
}

/// Tie-break order; earlier entries win equal scores.
pub const ORIENTATION_PRIORITY: [LabelOrientation; 4] = [
    LabelOrientation::Bottom,
    LabelOrientation::Right,
    LabelOrientation::Left,
    LabelOrientation::Top,
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LabelCandidate {
    pub bounds: Bounds,
    pub orientation: LabelOrientation,
    pub score: f32,
}

/// The four fixed-offset positions around `anchor`, in priority order.
///
/// Flow labels pass a zero-size anchor at the path midpoint.
pub fn label_candidates(anchor: &Bounds, config: &LabelConfig) -> [LabelCandidate; 4] {
    let w = config.width;
    let h = config.height;
    let m = config.margin;
    let c = anchor.center();
    ORIENTATION_PRIORITY.map(|orientation| {
        let bounds = match orientation {
            LabelOrientation::Bottom => Bounds::new(c.x - w / 2.0, anchor.bottom() + m, w, h),
            LabelOrientation::Right => Bounds::new(anchor.right() + m, c.y - h / 2.0, w, h),
            LabelOrientation::Left => Bounds::new(anchor.x - m - w, c.y - h / 2.0, w, h),
            LabelOrientation::Top => Bounds::new(c.x - w / 2.0, anchor.y - m - h, w, h),
        };
        LabelCandidate {
            bounds,
            orientation,
            score: 0.0,
        }
    })
}

/// Weighted penalty for putting a label at `rect`. Zero means collision free.
pub fn score_candidate(
    rect: &Bounds,
    segments: &[(Point, Point)],
    placed: &[Bounds],
    host: Option<&Bounds>,
    config: &LabelConfig,
) -> f32 {
    let crossings = segments
        .iter()
        .filter(|(a, b)| segment_intersects_rect(*a, *b, rect))
        .count();
    let overlaps = placed.iter().filter(|other| rects_overlap(rect, other)).count();
    let mut score = crossings as f32 * config.crossing_weight
        + overlaps as f32 * config.label_overlap_weight;
    if host.is_some_and(|host| rects_overlap(rect, host)) {
        score += config.host_overlap_weight;
    }
    score
}

/// Lowest-scoring candidate; the first one wins ties.
pub fn best_candidate(
    anchor: &Bounds,
    segments: &[(Point, Point)],
    placed: &[Bounds],
    host: Option<&Bounds>,
    config: &LabelConfig,
) -> LabelCandidate {
    let mut candidates = label_candidates(anchor, config);
    for candidate in &mut candidates {
        candidate.score = score_candidate(&candidate.bounds, segments, placed, host, config);
    }
    let mut best = candidates[0];
    for candidate in &candidates[1..] {
        if candidate.score < best.score {
            best = *candidate;
        }
    }
    best
}

enum LabelOwner {
    Shape(usize),
    Connection(usize),
}

struct PendingLabel {
    owner: LabelOwner,
    anchor: Bounds,
    host: Option<Bounds>,
}

fn pending_labels(diagram: &Diagram) -> Vec<PendingLabel> {
    let mut pending = Vec::new();
    for (idx, shape) in diagram.shapes.iter().enumerate() {
        if shape.label.is_none() || !shape.kind.has_external_label() {
            continue;
        }
        let host = match shape.kind.boundary_host() {
            Some(host_id) => diagram.shape(host_id).map(|host| host.bounds),
            None => Some(shape.bounds),
        };
        pending.push(PendingLabel {
            owner: LabelOwner::Shape(idx),
            anchor: shape.bounds,
            host,
        });
    }
    for (idx, conn) in diagram.connections.iter().enumerate() {
        if conn.label.is_none() || !conn.kind.is_flow() {
            continue;
        }
        let Some(mid) = conn.midpoint() else {
            continue;
        };
        pending.push(PendingLabel {
            owner: LabelOwner::Connection(idx),
            anchor: Bounds::new(mid.x, mid.y, 0.0, 0.0),
            host: None,
        });
    }
    pending
}

/// Re-place every floating label in document order. Returns how many moved.
pub fn adjust_labels(diagram: &mut Diagram, config: &LabelConfig) -> usize {
    adjust_labels_within(diagram, config, |_| true)
}

/// Re-place the labels whose owning element `movable` accepts.
///
/// Every other label stays put and is an obstacle for the ones that move.
pub fn adjust_labels_within(
    diagram: &mut Diagram,
    config: &LabelConfig,
    movable: impl Fn(&str) -> bool,
) -> usize {
    let segments: Vec<(Point, Point)> = diagram
        .connections
        .iter()
        .flat_map(|conn| conn.waypoints.windows(2).map(|seg| (seg[0], seg[1])))
        .collect();
    let (pending, fixed): (Vec<PendingLabel>, Vec<PendingLabel>) = pending_labels(diagram)
        .into_iter()
        .partition(|item| movable(owner_id(diagram, &item.owner)));
    let mut placed: Vec<Bounds> = fixed
        .iter()
        .filter_map(|item| label_of(diagram, &item.owner))
        .collect();
    let mut moved = 0usize;

    for item in &pending {
        let best = best_candidate(
            &item.anchor,
            &segments,
            &placed,
            item.host.as_ref(),
            config,
        );
        let label = match item.owner {
            LabelOwner::Shape(idx) => diagram.shapes[idx].label.as_mut(),
            LabelOwner::Connection(idx) => diagram.connections[idx].label.as_mut(),
        };
        let Some(label) = label else {
            continue;
        };
        let old = label.bounds;
        if (old.x - best.bounds.x).abs() > LABEL_MOVE_EPS
            || (old.y - best.bounds.y).abs() > LABEL_MOVE_EPS
            || (old.width - best.bounds.width).abs() > LABEL_MOVE_EPS
            || (old.height - best.bounds.height).abs() > LABEL_MOVE_EPS
        {
            label.bounds = best.bounds;
            moved += 1;
        }
        placed.push(best.bounds);
    }

    log::debug!(labels = pending.len(), fixed = fixed.len(), moved = moved; "label placement pass finished");
    moved
}

fn owner_id<'a>(diagram: &'a Diagram, owner: &LabelOwner) -> &'a str {
    match *owner {
        LabelOwner::Shape(idx) => diagram.shapes[idx].id.as_str(),
        LabelOwner::Connection(idx) => diagram.connections[idx].id.as_str(),
    }
}

fn label_of(diagram: &Diagram, owner: &LabelOwner) -> Option<Bounds> {
    let label = match *owner {
        LabelOwner::Shape(idx) => diagram.shapes[idx].label,
        LabelOwner::Connection(idx) => diagram.connections[idx].label,
    };
    label.map(|label| label.bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConnectionKind, Label, Shape, ShapeKind};

    fn config() -> LabelConfig {
        LabelConfig::default()
    }

    #[test]
    fn free_candidate_scores_zero() {
        let rect = Bounds::new(0.0, 0.0, 90.0, 20.0);
        assert_eq!(score_candidate(&rect, &[], &[], None, &config()), 0.0);
    }

    #[test]
    fn crossing_segment_makes_score_positive() {
        let rect = Bounds::new(0.0, 0.0, 90.0, 20.0);
        let segments = [(Point::new(45.0, -50.0), Point::new(45.0, 50.0))];
        let score = score_candidate(&rect, &segments, &[], None, &config());
        assert!(score > 0.0);
    }

    #[test]
    fn host_overlap_outweighs_crossings_and_labels() {
        let rect = Bounds::new(0.0, 0.0, 90.0, 20.0);
        let host = Bounds::new(80.0, 10.0, 50.0, 50.0);
        let crossing = [(Point::new(45.0, -50.0), Point::new(45.0, 50.0))];
        let placed = [Bounds::new(10.0, 5.0, 20.0, 20.0)];
        let on_host = score_candidate(&rect, &[], &[], Some(&host), &config());
        let busy = score_candidate(&rect, &crossing, &placed, None, &config());
        assert!(on_host >= 10.0 * config().crossing_weight);
        assert!(on_host > busy);
    }

    #[test]
    fn touching_label_is_not_an_overlap() {
        let rect = Bounds::new(0.0, 0.0, 90.0, 20.0);
        let neighbour = [Bounds::new(90.0, 0.0, 90.0, 20.0)];
        assert_eq!(score_candidate(&rect, &[], &neighbour, None, &config()), 0.0);
    }

    #[test]
    fn ties_follow_orientation_priority() {
        let anchor = Bounds::new(100.0, 100.0, 36.0, 36.0);
        let best = best_candidate(&anchor, &[], &[], None, &config());
        assert_eq!(best.orientation, LabelOrientation::Bottom);
        assert_eq!(best.bounds, Bounds::new(73.0, 144.0, 90.0, 20.0));

        // Block the bottom slot; right is next in line.
        let blocker = [Bounds::new(73.0, 144.0, 90.0, 20.0)];
        let best = best_candidate(&anchor, &[], &blocker, None, &config());
        assert_eq!(best.orientation, LabelOrientation::Right);
    }

    #[test]
    fn boundary_label_avoids_its_host_even_across_a_flow() {
        let mut diagram = Diagram::new("d");
        diagram.add_shape(Shape::new(
            "Task",
            ShapeKind::Task,
            Bounds::new(100.0, 100.0, 100.0, 80.0),
        ));
        diagram.add_shape(
            Shape::new(
                "Timer",
                ShapeKind::BoundaryEvent {
                    attached_to: "Task".into(),
                },
                Bounds::new(132.0, 162.0, 36.0, 36.0),
            )
            .with_label(Bounds::new(132.0, 120.0, 90.0, 20.0)),
        );
        diagram.add_shape(Shape::new(
            "Escalate",
            ShapeKind::Task,
            Bounds::new(100.0, 300.0, 100.0, 80.0),
        ));
        diagram.connect("Flow", ConnectionKind::SequenceFlow, "Timer", "Escalate");
        diagram.connections[0].waypoints = vec![Point::new(150.0, 198.0), Point::new(150.0, 300.0)];

        let moved = adjust_labels(&mut diagram, &config());
        assert_eq!(moved, 1);
        let label = diagram.shape("Timer").and_then(|s| s.label).unwrap();
        let task = diagram.shape("Task").unwrap().bounds;
        assert!(!rects_overlap(&label.bounds, &task));
        assert_eq!(label.bounds.y, 206.0);
    }

    #[test]
    fn flow_label_leaves_its_path_and_settles() {
        let mut diagram = Diagram::new("d");
        diagram.connect("Flow", ConnectionKind::SequenceFlow, "A", "B");
        diagram.connections[0].waypoints = vec![Point::new(0.0, 50.0), Point::new(300.0, 50.0)];
        diagram.connections[0].label = Some(Label {
            bounds: Bounds::new(105.0, 40.0, 90.0, 20.0),
        });

        assert_eq!(adjust_labels(&mut diagram, &config()), 1);
        let label = diagram.connections[0].label.unwrap().bounds;
        assert_eq!(label, Bounds::new(105.0, 58.0, 90.0, 20.0));
        assert_eq!(adjust_labels(&mut diagram, &config()), 0);
    }

    #[test]
    fn labels_outside_the_movable_set_stay_and_block() {
        let mut diagram = Diagram::new("d");
        diagram.add_shape(
            Shape::new("Start", ShapeKind::StartEvent, Bounds::new(100.0, 100.0, 36.0, 36.0))
                .with_label(Bounds::new(0.0, 0.0, 90.0, 20.0)),
        );
        // Parked on Start's bottom slot.
        diagram.add_shape(
            Shape::new("Other", ShapeKind::EndEvent, Bounds::new(400.0, 400.0, 36.0, 36.0))
                .with_label(Bounds::new(73.0, 144.0, 90.0, 20.0)),
        );

        let moved = adjust_labels_within(&mut diagram, &config(), |id| id == "Start");
        assert_eq!(moved, 1);
        let other = diagram.shape("Other").and_then(|s| s.label).unwrap();
        assert_eq!(other.bounds, Bounds::new(73.0, 144.0, 90.0, 20.0));
        let start = diagram.shape("Start").and_then(|s| s.label).unwrap();
        assert_eq!(start.bounds, Bounds::new(144.0, 108.0, 90.0, 20.0));
    }

    #[test]
    fn nothing_to_place_moves_nothing() {
        let mut diagram = Diagram::new("d");
        diagram.add_shape(Shape::new(
            "Task",
            ShapeKind::Task,
            Bounds::new(0.0, 0.0, 100.0, 80.0),
        ));
        assert_eq!(adjust_labels(&mut diagram, &config()), 0);
    }
}
