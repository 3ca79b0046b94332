// Lane ordering: flow cost model, search over orderings, and the geometry
// needed to restack lanes and band nodes into them.

use super::pins::PinRegistry;
use super::routing::route_orthogonal;
use crate::config::{LaneConfig, LayoutConfig};
use crate::error::{ElementClass, LayoutError};
use crate::ir::{Bounds, ConnectionKind, Diagram, Direction, ElementStore};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Node → lane mapping for one participant, lanes in vertical order.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneAssignment {
    pub participant_id: String,
    pub lanes: Vec<String>,
    pub node_lanes: BTreeMap<String, usize>,
}

impl LaneAssignment {
    /// `None` when the participant has fewer than two lanes.
    pub fn from_diagram(diagram: &Diagram, participant_id: &str) -> Option<Self> {
        let lanes: Vec<String> = diagram
            .lanes_of(participant_id)
            .iter()
            .map(|lane| lane.id.clone())
            .collect();
        if lanes.len() < 2 {
            return None;
        }
        let index: HashMap<&str, usize> = lanes
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.as_str(), idx))
            .collect();
        let mut node_lanes = BTreeMap::new();
        for id in diagram.descendants(participant_id) {
            let Some(shape) = diagram.shape(&id) else {
                continue;
            };
            if shape.kind.is_lane() {
                continue;
            }
            if let Some(lane_idx) = diagram
                .resolved_lane(&id)
                .and_then(|lane| index.get(lane.as_str()).copied())
            {
                node_lanes.insert(id, lane_idx);
            }
        }
        Some(Self {
            participant_id: participant_id.to_string(),
            lanes,
            node_lanes,
        })
    }

    /// Lane index pairs of every sequence flow with both ends in this pool.
    pub fn assessed_flows(&self, diagram: &Diagram) -> Vec<(usize, usize)> {
        diagram
            .connections
            .iter()
            .filter(|conn| conn.kind == ConnectionKind::SequenceFlow)
            .filter_map(|conn| {
                let from = self.node_lanes.get(&conn.source)?;
                let to = self.node_lanes.get(&conn.target)?;
                Some((*from, *to))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneScore {
    pub coherence_score: f32,
    pub same_lane_percent: f32,
    pub hop_cost: usize,
    pub assessed_flows: usize,
}

fn total_hop_cost(flows: &[(usize, usize)], position: &[usize]) -> usize {
    flows
        .iter()
        .map(|&(a, b)| position[a].abs_diff(position[b]))
        .sum()
}

fn positions_of(order: &[usize]) -> Vec<usize> {
    let mut position = vec![0usize; order.len()];
    for (pos, &lane) in order.iter().enumerate() {
        position[lane] = pos;
    }
    position
}

/// Score `flows` when lane `order[k]` sits at vertical position `k`.
///
/// Every flow contributes `1 - hop / (lanes - 1)`; coherence is the mean in
/// percent, so it reaches 100 only when no flow leaves its lane and rises
/// whenever total hop cost falls.
pub fn lane_score(flows: &[(usize, usize)], order: &[usize]) -> LaneScore {
    let position = positions_of(order);
    let hop_cost = total_hop_cost(flows, &position);
    let assessed = flows.len();
    let same_lane = flows.iter().filter(|(a, b)| a == b).count();
    let span = order.len().saturating_sub(1);
    let (coherence, same_pct) = if assessed == 0 || span == 0 {
        (100.0, 100.0)
    } else {
        let closeness: f32 = flows
            .iter()
            .map(|&(a, b)| 1.0 - position[a].abs_diff(position[b]) as f32 / span as f32)
            .sum();
        (
            100.0 * closeness / assessed as f32,
            100.0 * same_lane as f32 / assessed as f32,
        )
    };
    LaneScore {
        coherence_score: coherence.clamp(0.0, 100.0),
        same_lane_percent: same_pct.clamp(0.0, 100.0),
        hop_cost,
        assessed_flows: assessed,
    }
}

/// Rearrange `perm` into its lexicographic successor; false once exhausted.
fn next_permutation(perm: &mut [usize]) -> bool {
    if perm.len() < 2 {
        return false;
    }
    let mut i = perm.len() - 1;
    while i > 0 && perm[i - 1] >= perm[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = perm.len() - 1;
    while perm[j] <= perm[i - 1] {
        j -= 1;
    }
    perm.swap(i - 1, j);
    perm[i..].reverse();
    true
}

/// Ordering with minimum hop cost; the current order wins ties.
pub fn best_order(flows: &[(usize, usize)], lane_count: usize, config: &LaneConfig) -> Vec<usize> {
    let identity: Vec<usize> = (0..lane_count).collect();
    let mut best = identity.clone();
    let mut best_cost = total_hop_cost(flows, &positions_of(&best));
    if best_cost == 0 || lane_count < 2 {
        return best;
    }

    if lane_count <= config.exhaustive_limit {
        let mut perm = identity;
        while next_permutation(&mut perm) {
            let cost = total_hop_cost(flows, &positions_of(&perm));
            if cost < best_cost {
                best_cost = cost;
                best = perm.clone();
            }
        }
        return best;
    }

    for _ in 0..config.max_swap_passes {
        let mut improved = false;
        for i in 0..lane_count {
            for j in (i + 1)..lane_count {
                best.swap(i, j);
                let cost = total_hop_cost(flows, &positions_of(&best));
                if cost < best_cost {
                    best_cost = cost;
                    improved = true;
                } else {
                    best.swap(i, j);
                }
            }
        }
        if !improved {
            break;
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneOptimizationReport {
    pub success: bool,
    pub optimized: bool,
    pub coherence_score: f32,
    pub before: Option<LaneScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<LaneScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    pub lane_order: Vec<String>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LaneOptimizationReport {
    pub(super) fn ineligible(reason: impl Into<String>, dry_run: bool) -> Self {
        Self {
            success: false,
            optimized: false,
            coherence_score: 0.0,
            before: None,
            after: None,
            participant_id: None,
            lane_order: Vec::new(),
            dry_run,
            reason: Some(reason.into()),
        }
    }
}

/// Pick the pool to optimize: the requested one, or the first with ≥2 lanes.
fn eligible_participant(
    diagram: &Diagram,
    participant_id: Option<&str>,
) -> Result<Option<String>, LayoutError> {
    match participant_id {
        Some(id) => {
            let shape = diagram
                .shape(id)
                .ok_or_else(|| LayoutError::not_found(ElementClass::Participant, id))?;
            if !shape.kind.is_participant() {
                return Err(LayoutError::validation(format!(
                    "{id} is not a participant"
                )));
            }
            Ok((diagram.lanes_of(id).len() >= 2).then(|| id.to_string()))
        }
        None => Ok(diagram
            .shapes
            .iter()
            .filter(|shape| shape.kind.is_participant())
            .find(|shape| diagram.lanes_of(&shape.id).len() >= 2)
            .map(|shape| shape.id.clone())),
    }
}

pub fn optimize_lane_assignments(
    diagram: &mut Diagram,
    pins: &PinRegistry,
    participant_id: Option<&str>,
    dry_run: bool,
    config: &LayoutConfig,
) -> Result<LaneOptimizationReport, LayoutError> {
    let Some(pool_id) = eligible_participant(diagram, participant_id)? else {
        return Ok(LaneOptimizationReport::ineligible(
            "no participant with at least two lanes",
            dry_run,
        ));
    };
    let Some(assignment) = LaneAssignment::from_diagram(diagram, &pool_id) else {
        return Ok(LaneOptimizationReport::ineligible(
            "no participant with at least two lanes",
            dry_run,
        ));
    };
    let flows = assignment.assessed_flows(diagram);
    let lane_count = assignment.lanes.len();
    let identity: Vec<usize> = (0..lane_count).collect();
    let before = lane_score(&flows, &identity);

    let mut report = LaneOptimizationReport {
        success: true,
        optimized: false,
        coherence_score: before.coherence_score,
        before: Some(before),
        after: None,
        participant_id: Some(pool_id.clone()),
        lane_order: assignment.lanes.clone(),
        dry_run,
        reason: None,
    };

    if before.coherence_score >= config.lanes.skip_above_coherence {
        log::debug!(participant = pool_id.as_str(), coherence = before.coherence_score; "lane order already coherent");
        return Ok(report);
    }

    let order = best_order(&flows, lane_count, &config.lanes);
    let after = lane_score(&flows, &order);
    if after.hop_cost >= before.hop_cost {
        log::debug!(participant = pool_id.as_str(), hop_cost = before.hop_cost; "lane order already optimal");
        return Ok(report);
    }

    let new_lanes: Vec<String> = order
        .iter()
        .map(|&idx| assignment.lanes[idx].clone())
        .collect();
    report.optimized = true;
    report.after = Some(after);
    report.coherence_score = after.coherence_score;
    report.lane_order = new_lanes.clone();

    log::info!(
        participant = pool_id.as_str(),
        before = before.coherence_score,
        after = after.coherence_score,
        dry_run = dry_run;
        "lane order optimized"
    );

    if !dry_run {
        apply_lane_order(diagram, &pool_id, &new_lanes, pins, config.direction)?;
    }
    Ok(report)
}

/// Restack the lanes of `participant_id` in `new_order`, carrying their nodes.
pub fn apply_lane_order(
    diagram: &mut Diagram,
    participant_id: &str,
    new_order: &[String],
    pins: &PinRegistry,
    direction: Direction,
) -> Result<(), LayoutError> {
    let lanes: Vec<Bounds> = new_order
        .iter()
        .map(|id| {
            diagram
                .shape(id)
                .map(|lane| lane.bounds)
                .ok_or_else(|| LayoutError::not_found(ElementClass::Element, id))
        })
        .collect::<Result<_, _>>()?;
    let Some(top) = lanes.iter().map(|b| b.y).reduce(f32::min) else {
        return Ok(());
    };

    let mut lane_shift: HashMap<&str, f32> = HashMap::new();
    let mut cursor = top;
    for (id, bounds) in new_order.iter().zip(&lanes) {
        lane_shift.insert(id.as_str(), cursor - bounds.y);
        cursor += bounds.height;
    }

    let mut shifts: BTreeMap<String, f32> = BTreeMap::new();
    for (lane_id, dy) in &lane_shift {
        if *dy != 0.0 {
            shifts.insert(lane_id.to_string(), *dy);
        }
    }
    // Boundary events follow their host's lane, parent or not.
    let members: Vec<String> = diagram
        .shapes
        .iter()
        .filter(|shape| !shape.kind.is_lane())
        .map(|shape| shape.id.clone())
        .collect();
    for id in members {
        let Some(lane) = diagram.resolved_lane(&id) else {
            continue;
        };
        if let Some(dy) = lane_shift.get(lane.as_str()) {
            if *dy != 0.0 {
                shifts.insert(id, *dy);
            }
        }
    }
    log::debug!(participant = participant_id, shifted = shifts.len(); "restacked lanes");

    for (id, dy) in &shifts {
        diagram.move_element(id, 0.0, *dy)?;
    }

    let mut carried: Vec<(String, f32)> = Vec::new();
    let mut reroute: Vec<(String, String, String)> = Vec::new();
    for conn in &diagram.connections {
        let ds = shifts.get(&conn.source).copied();
        let dt = shifts.get(&conn.target).copied();
        match (ds, dt) {
            (None, None) => {}
            (Some(a), Some(b)) if a == b => carried.push((conn.id.clone(), a)),
            _ if pins.is_pinned(&conn.id) => {}
            _ => reroute.push((conn.id.clone(), conn.source.clone(), conn.target.clone())),
        }
    }
    for (id, dy) in carried {
        diagram.move_element(&id, 0.0, dy)?;
    }
    for (id, source, target) in reroute {
        let (Some(from), Some(to)) = (
            diagram.shape(&source).map(|s| s.bounds),
            diagram.shape(&target).map(|s| s.bounds),
        ) else {
            continue;
        };
        diagram.update_waypoints(&id, route_orthogonal(&from, &to, direction))?;
    }
    Ok(())
}

/// Pack the given pool members into rows inside their lanes, then restack the
/// lanes and fit the pool around them.
///
/// Members keep their x. Returns the ids of every shape that moved.
pub(super) fn band_participant(
    diagram: &mut Diagram,
    participant_id: &str,
    members: &[String],
    config: &LayoutConfig,
) -> Result<BTreeSet<String>, LayoutError> {
    let lanes: Vec<String> = diagram
        .lanes_of(participant_id)
        .iter()
        .map(|lane| lane.id.clone())
        .collect();
    let mut moved = BTreeSet::new();
    let Some(pool) = diagram.shape(participant_id).map(|s| s.bounds) else {
        return Err(LayoutError::not_found(ElementClass::Participant, participant_id));
    };
    if lanes.is_empty() {
        return Ok(moved);
    }
    let lane_index: HashMap<&str, usize> = lanes
        .iter()
        .enumerate()
        .map(|(idx, id)| (id.as_str(), idx))
        .collect();

    let mut per_lane: Vec<Vec<(String, Bounds)>> = vec![Vec::new(); lanes.len()];
    for id in members {
        let Some(bounds) = diagram.shape(id).map(|s| s.bounds) else {
            continue;
        };
        let idx = match diagram.resolved_lane(id) {
            Some(lane) => lane_index.get(lane.as_str()).copied().unwrap_or(0),
            None => {
                log::warn!(node = id.as_str(), participant = participant_id; "node has no lane, placing it in the first lane");
                0
            }
        };
        per_lane[idx].push((id.clone(), bounds));
    }

    let pad = config.container_padding;
    let gap = config.node_spacing;
    let mut cursor = pool.y;
    let lane_x = pool.x + config.participant_header_width;
    let lane_width = (pool.width - config.participant_header_width).max(0.0);
    for (lane_idx, nodes) in per_lane.iter_mut().enumerate() {
        nodes.sort_by(|a, b| {
            a.1.y
                .total_cmp(&b.1.y)
                .then(a.1.x.total_cmp(&b.1.x))
                .then(a.0.cmp(&b.0))
        });
        // rows: (right edge, height); assignment: (node, row)
        let mut rows: Vec<(f32, f32)> = Vec::new();
        let mut row_of: Vec<usize> = Vec::with_capacity(nodes.len());
        for (_, bounds) in nodes.iter() {
            let slot = rows
                .iter()
                .position(|(right, _)| bounds.x >= right + gap);
            let row = match slot {
                Some(row) => {
                    rows[row].0 = bounds.right();
                    rows[row].1 = rows[row].1.max(bounds.height);
                    row
                }
                None => {
                    rows.push((bounds.right(), bounds.height));
                    rows.len() - 1
                }
            };
            row_of.push(row);
        }
        let content: f32 = rows.iter().map(|(_, h)| *h).sum::<f32>()
            + gap * rows.len().saturating_sub(1) as f32;
        let lane_height = (content + 2.0 * pad).max(config.min_lane_height);
        let top = cursor + (lane_height - content) / 2.0;
        let mut row_top = Vec::with_capacity(rows.len());
        let mut offset = top;
        for (_, h) in &rows {
            row_top.push(offset);
            offset += h + gap;
        }
        for ((id, bounds), row) in nodes.iter().zip(&row_of) {
            let target_y = row_top[*row] + (rows[*row].1 - bounds.height) / 2.0;
            let dy = target_y - bounds.y;
            if dy.abs() > f32::EPSILON {
                moved.extend(diagram.translate_subtree(id, 0.0, dy));
            }
        }
        let lane_id = &lanes[lane_idx];
        let lane_bounds = Bounds::new(lane_x, cursor, lane_width, lane_height);
        if diagram.shape(lane_id).map(|s| s.bounds) != Some(lane_bounds) {
            diagram.resize_element(lane_id, lane_bounds)?;
            moved.insert(lane_id.clone());
        }
        cursor += lane_height;
    }
    let pool_bounds = Bounds::new(pool.x, pool.y, pool.width, cursor - pool.y);
    if pool_bounds != pool {
        diagram.resize_element(participant_id, pool_bounds)?;
        moved.insert(participant_id.to_string());
    }
    Ok(moved)
}
