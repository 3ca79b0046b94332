mod deterministic;
pub mod engine;
pub mod geometry;
pub mod label_placement;
pub mod lanes;
pub mod pins;
mod routing;

pub use engine::{
    DagreEngine, EngineEdge, EngineNode, EngineRequest, EngineResponse, LayoutEngine,
};
pub use label_placement::{LabelCandidate, LabelOrientation, adjust_labels, adjust_labels_within};
pub use lanes::{LaneOptimizationReport, LaneScore, optimize_lane_assignments};
pub use pins::{PinOutcome, PinRegistry, parse_waypoints, set_waypoints};
pub use routing::count_crossings;

use crate::config::{DisplacementConfig, LayoutConfig};
use crate::error::{ElementClass, EngineError, LayoutError};
use crate::ir::{Bounds, Connection, Diagram, Direction, ElementRef, ElementStore, Point};
use routing::route_orthogonal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum LayoutStrategy {
    #[default]
    Full,
    Deterministic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum LaneStrategy {
    #[default]
    Preserve,
    Optimize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutOptions {
    /// Participant or sub-process whose contents are laid out.
    pub scope_element_id: Option<String>,
    /// Shapes to lay out as one group, anchored where they are now.
    pub element_ids: Option<Vec<String>>,
    pub layout_strategy: LayoutStrategy,
    pub lane_strategy: LaneStrategy,
    pub dry_run: bool,
}

impl LayoutOptions {
    /// Unscoped and without an element subset: the only kind that consumes pins.
    pub fn is_whole_diagram(&self) -> bool {
        self.scope_element_id.is_none() && self.element_ids.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Displacement {
    pub element_id: String,
    pub dx: f32,
    pub dy: f32,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutReport {
    pub success: bool,
    pub element_count: usize,
    pub moved_count: usize,
    pub crossing_flows: usize,
    /// Strategy actually used; `Full` after a fast-path fallback.
    pub layout_strategy: LayoutStrategy,
    pub dry_run: bool,
    pub max_displacement: f32,
    pub avg_displacement: f32,
    pub top_displacements: Vec<Displacement>,
    pub labels_moved: usize,
    pub pins_restored: usize,
    pub pins_cleared: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lane_optimization: Vec<LaneOptimizationReport>,
}

/// Lay out `diagram` as `options` describe.
///
/// Everything is computed on a copy; the diagram and the pin registry change
/// only when the whole computation succeeds and `dry_run` is off.
pub fn run_layout(
    diagram: &mut Diagram,
    pins: &mut PinRegistry,
    engine: &dyn LayoutEngine,
    options: &LayoutOptions,
    config: &LayoutConfig,
) -> Result<LayoutReport, LayoutError> {
    let selection = validate_options(diagram, options)?;
    let scope = options.scope_element_id.as_deref();
    let mut working = diagram.clone();

    let mut lane_optimization = Vec::new();
    if options.lane_strategy == LaneStrategy::Optimize {
        let pools = pools_in_scope(&working, scope);
        if pools.is_empty() {
            lane_optimization.push(LaneOptimizationReport::ineligible(
                "no participant with at least two lanes in scope",
                options.dry_run,
            ));
        }
        for pool in &pools {
            let mut report =
                optimize_lane_assignments(&mut working, pins, Some(pool), false, config)?;
            report.dry_run = options.dry_run;
            lane_optimization.push(report);
        }
    }

    let mut pass = UnitPass::new(engine, pins, config, options.layout_strategy);
    let in_scope: BTreeSet<String> = match (selection.as_deref(), scope) {
        (Some(members), _) => {
            pass.place_selection(&mut working, members)?;
            members
                .iter()
                .flat_map(|id| working.subtree_ids(id))
                .collect()
        }
        (None, Some(scope)) => {
            pass.layout_scope(&mut working, scope)?;
            working.subtree_ids(scope)
        }
        (None, None) => {
            pass.layout_all(&mut working)?;
            working.shapes.iter().map(|shape| shape.id.clone()).collect()
        }
    };
    let layout_strategy = pass.strategy_used();

    let rerouted = reroute_moved(
        &mut working,
        diagram,
        &pass.routed,
        &in_scope,
        pins,
        config.direction,
    )?;

    let pinned_in_scope: BTreeSet<String> = working
        .connections
        .iter()
        .filter(|conn| {
            pins.is_pinned(&conn.id)
                && (in_scope.contains(&conn.source) || in_scope.contains(&conn.target))
        })
        .map(|conn| conn.id.clone())
        .collect();
    let pins_restored = pins.restore(&mut working, |id| pinned_in_scope.contains(id))?;

    // Labels outside the scope stay where they are.
    let touching: BTreeSet<String> = working
        .connections
        .iter()
        .filter(|conn| in_scope.contains(&conn.source) || in_scope.contains(&conn.target))
        .map(|conn| conn.id.clone())
        .collect();
    let labels_moved = adjust_labels_within(&mut working, &config.labels, |id| {
        in_scope.contains(id) || touching.contains(id)
    });

    let flows: Vec<&Connection> = working
        .connections
        .iter()
        .filter(|conn| conn.kind.is_flow())
        .collect();
    let crossing_flows = count_crossings(&flows);
    let displacement = measure_displacement(diagram, &working, &config.displacement);

    log::debug!(
        elements = diagram.shapes.len(),
        moved = displacement.moved,
        rerouted = rerouted,
        crossings = crossing_flows,
        strategy:? = layout_strategy,
        dry_run = options.dry_run;
        "layout finished"
    );

    let mut pins_cleared = 0;
    if !options.dry_run {
        if options.is_whole_diagram() {
            pins_cleared = pins.len();
            pins.clear_on_full_layout();
        }
        *diagram = working;
    }

    Ok(LayoutReport {
        success: true,
        element_count: diagram.shapes.len(),
        moved_count: displacement.moved,
        crossing_flows,
        layout_strategy,
        dry_run: options.dry_run,
        max_displacement: displacement.max,
        avg_displacement: displacement.avg,
        top_displacements: displacement.top,
        labels_moved,
        pins_restored,
        pins_cleared,
        lane_optimization,
    })
}

/// Check scope and element ids before anything is touched.
///
/// Returns the shapes an `elementIds` layout will place, without boundary
/// events (they follow their host) and without shapes nested in another
/// selected shape.
fn validate_options(
    diagram: &Diagram,
    options: &LayoutOptions,
) -> Result<Option<Vec<String>>, LayoutError> {
    let scope = options.scope_element_id.as_deref();
    if let Some(scope) = scope {
        match diagram.element(scope) {
            None => return Err(LayoutError::not_found(ElementClass::Element, scope)),
            Some(element) if element.is_participant() || element.is_subprocess() => {}
            Some(_) => {
                return Err(LayoutError::validation(format!(
                    "scope {scope} must be a participant or a sub-process"
                )));
            }
        }
    }

    let Some(ids) = options.element_ids.as_ref() else {
        return Ok(None);
    };
    if ids.is_empty() {
        return Err(LayoutError::validation("elementIds must not be empty"));
    }
    if options.lane_strategy == LaneStrategy::Optimize {
        // Reordering lanes moves every node of the pool, not just the selection.
        return Err(LayoutError::validation(
            "laneStrategy optimize needs a participant scope or a whole-diagram layout, not elementIds",
        ));
    }
    let mut members: Vec<String> = Vec::new();
    for id in ids {
        let shape = match diagram.element(id) {
            None => return Err(LayoutError::not_found(ElementClass::Element, id)),
            Some(ElementRef::Connection(_)) => {
                return Err(LayoutError::validation(format!(
                    "{id} is a connection; elementIds takes shapes"
                )));
            }
            Some(ElementRef::Shape(shape)) => shape,
        };
        if shape.kind.is_lane() || shape.kind.is_participant() {
            return Err(LayoutError::validation(format!(
                "{id} is a container; use scopeElementId to lay out its contents"
            )));
        }
        if let Some(scope) = scope {
            if !diagram.is_descendant_of(id, scope) {
                return Err(LayoutError::validation(format!(
                    "{id} lies outside scope {scope}"
                )));
            }
        }
        if shape.kind.boundary_host().is_some() || members.contains(id) {
            continue;
        }
        members.push(id.clone());
    }
    let nested: Vec<String> = members
        .iter()
        .filter(|id| members.iter().any(|other| diagram.is_descendant_of(id, other)))
        .cloned()
        .collect();
    members.retain(|id| !nested.contains(id));
    if members.is_empty() {
        return Err(LayoutError::validation(
            "elementIds holds nothing that can be laid out on its own",
        ));
    }
    Ok(Some(members))
}

fn pools_in_scope(diagram: &Diagram, scope: Option<&str>) -> Vec<String> {
    let candidates: Vec<String> = match scope {
        Some(scope) => {
            if diagram.shape(scope).is_some_and(|s| s.kind.is_participant()) {
                vec![scope.to_string()]
            } else {
                diagram
                    .participant_of(scope)
                    .map(|pool| vec![pool.id.clone()])
                    .unwrap_or_default()
            }
        }
        None => diagram
            .shapes
            .iter()
            .filter(|shape| shape.kind.is_participant())
            .map(|shape| shape.id.clone())
            .collect(),
    };
    let mut pools: Vec<String> = Vec::new();
    for pool in candidates {
        if !pools.contains(&pool) && diagram.lanes_of(&pool).len() >= 2 {
            pools.push(pool);
        }
    }
    pools
}

/// Nearest enclosing participant or sub-process; lanes are skipped.
fn layout_parent(diagram: &Diagram, id: &str) -> Option<String> {
    let mut current = diagram.shape(id)?.parent.clone();
    let mut guard = diagram.shapes.len();
    while let Some(parent_id) = current {
        let parent = diagram.shape(&parent_id)?;
        if parent.kind.is_container() {
            return Some(parent_id);
        }
        if guard == 0 {
            return None;
        }
        guard -= 1;
        current = parent.parent.clone();
    }
    None
}

fn members_of(diagram: &Diagram, container: Option<&str>) -> Vec<String> {
    diagram
        .shapes
        .iter()
        .filter(|shape| shape.kind.is_flow_node())
        .filter(|shape| layout_parent(diagram, &shape.id).as_deref() == container)
        .map(|shape| shape.id.clone())
        .collect()
}

fn depth(diagram: &Diagram, id: &str) -> usize {
    let mut depth = 0;
    let mut current = diagram.shape(id).and_then(|shape| shape.parent.clone());
    while let Some(parent) = current {
        depth += 1;
        if depth > diagram.shapes.len() {
            break;
        }
        current = diagram.shape(&parent).and_then(|shape| shape.parent.clone());
    }
    depth
}

/// Sub-processes (optionally only those below `within`), deepest first.
fn subprocesses_deepest_first(diagram: &Diagram, within: Option<&str>) -> Vec<String> {
    let mut found: Vec<(usize, usize, String)> = diagram
        .shapes
        .iter()
        .enumerate()
        .filter(|(_, shape)| shape.kind.is_subprocess())
        .filter(|(_, shape)| within.is_none_or(|root| diagram.is_descendant_of(&shape.id, root)))
        .map(|(idx, shape)| (depth(diagram, &shape.id), idx, shape.id.clone()))
        .collect();
    found.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    found.into_iter().map(|(_, _, id)| id).collect()
}

fn lane_hints(diagram: &Diagram, participant_id: &str, members: &[String]) -> HashMap<String, usize> {
    let lanes: HashMap<String, usize> = diagram
        .lanes_of(participant_id)
        .iter()
        .enumerate()
        .map(|(idx, lane)| (lane.id.clone(), idx))
        .collect();
    members
        .iter()
        .filter_map(|id| {
            let lane = diagram.resolved_lane(id)?;
            Some((id.clone(), *lanes.get(&lane)?))
        })
        .collect()
}

/// Member standing in for `id`: itself, its boundary host, or the enclosing
/// member sub-process.
fn member_for(diagram: &Diagram, id: &str, members: &BTreeSet<&str>) -> Option<String> {
    let mut current = id.to_string();
    let mut guard = diagram.shapes.len() + 1;
    loop {
        if members.contains(current.as_str()) {
            return Some(current);
        }
        if guard == 0 {
            return None;
        }
        guard -= 1;
        let shape = diagram.shape(&current)?;
        current = shape
            .kind
            .boundary_host()
            .or(shape.parent.as_deref())?
            .to_string();
    }
}

struct UnitEdge {
    id: String,
    from: String,
    to: String,
    /// Connection runs between the two members themselves, not via a
    /// boundary event or nested shape.
    direct: bool,
    fixed: bool,
}

fn unit_edges(diagram: &Diagram, members: &BTreeSet<&str>, pins: &PinRegistry) -> Vec<UnitEdge> {
    diagram
        .connections
        .iter()
        .filter(|conn| conn.kind.is_flow())
        .filter_map(|conn| {
            let from = member_for(diagram, &conn.source, members)?;
            let to = member_for(diagram, &conn.target, members)?;
            if from == to {
                return None;
            }
            Some(UnitEdge {
                id: conn.id.clone(),
                direct: from == conn.source && to == conn.target,
                fixed: pins.is_pinned(&conn.id),
                from,
                to,
            })
        })
        .collect()
}

/// Lays out one container level at a time and remembers which connections
/// already got a route from the engine.
struct UnitPass<'a> {
    engine: &'a dyn LayoutEngine,
    pins: &'a PinRegistry,
    config: &'a LayoutConfig,
    strategy: LayoutStrategy,
    routed: BTreeSet<String>,
    fast_path_units: usize,
    engine_units: usize,
}

impl<'a> UnitPass<'a> {
    fn new(
        engine: &'a dyn LayoutEngine,
        pins: &'a PinRegistry,
        config: &'a LayoutConfig,
        strategy: LayoutStrategy,
    ) -> Self {
        Self {
            engine,
            pins,
            config,
            strategy,
            routed: BTreeSet::new(),
            fast_path_units: 0,
            engine_units: 0,
        }
    }

    fn strategy_used(&self) -> LayoutStrategy {
        if self.strategy == LayoutStrategy::Deterministic && self.engine_units == 0 {
            LayoutStrategy::Deterministic
        } else {
            LayoutStrategy::Full
        }
    }

    fn layout_all(&mut self, diagram: &mut Diagram) -> Result<(), LayoutError> {
        for sub in subprocesses_deepest_first(diagram, None) {
            self.layout_subprocess(diagram, &sub)?;
        }
        let pools: Vec<String> = diagram
            .shapes
            .iter()
            .filter(|shape| shape.kind.is_participant())
            .map(|shape| shape.id.clone())
            .collect();
        for pool in &pools {
            self.layout_participant(diagram, pool)?;
        }

        let margin = self.config.margin;
        let mut cursor = margin;
        for pool in &pools {
            let Some(bounds) = diagram.shape(pool).map(|shape| shape.bounds) else {
                continue;
            };
            diagram.translate_subtree(pool, margin - bounds.x, cursor - bounds.y);
            cursor += bounds.height + self.config.pool_spacing;
        }

        let root = members_of(diagram, None);
        self.place(diagram, &root, &HashMap::new(), Point::new(margin, cursor), true)?;
        Ok(())
    }

    fn layout_scope(&mut self, diagram: &mut Diagram, scope: &str) -> Result<(), LayoutError> {
        for sub in subprocesses_deepest_first(diagram, Some(scope)) {
            self.layout_subprocess(diagram, &sub)?;
        }
        if diagram.shape(scope).is_some_and(|s| s.kind.is_participant()) {
            self.layout_participant(diagram, scope)
        } else {
            self.layout_subprocess(diagram, scope)
        }
    }

    fn layout_subprocess(&mut self, diagram: &mut Diagram, id: &str) -> Result<(), LayoutError> {
        let Some(bounds) = diagram.shape(id).map(|shape| shape.bounds) else {
            return Ok(());
        };
        let pad = self.config.container_padding;
        let members = members_of(diagram, Some(id));
        let origin = Point::new(bounds.x + pad, bounds.y + pad);
        if let Some(content) = self.place(diagram, &members, &HashMap::new(), origin, true)? {
            let fitted = Bounds::new(
                bounds.x,
                bounds.y,
                content.right() + pad - bounds.x,
                content.bottom() + pad - bounds.y,
            );
            diagram.resize_element(id, fitted)?;
        }
        Ok(())
    }

    fn layout_participant(&mut self, diagram: &mut Diagram, id: &str) -> Result<(), LayoutError> {
        let Some(pool) = diagram.shape(id).map(|shape| shape.bounds) else {
            return Ok(());
        };
        let config = self.config;
        let pad = config.container_padding;
        let members = members_of(diagram, Some(id));
        let has_lanes = !diagram.lanes_of(id).is_empty();
        let hints = if has_lanes {
            lane_hints(diagram, id, &members)
        } else {
            HashMap::new()
        };
        let origin = Point::new(pool.x + config.participant_header_width + pad, pool.y + pad);
        let content = self.place(diagram, &members, &hints, origin, !has_lanes)?;
        let width = content.map_or(pool.width, |c| {
            (c.right() + pad - pool.x).max(config.min_pool_width)
        });

        if has_lanes {
            diagram.resize_element(id, Bounds::new(pool.x, pool.y, width, pool.height))?;
            let banded = lanes::band_participant(diagram, id, &members, config)?;
            log::debug!(participant = id, moved = banded.len(); "banded participant into lanes");
        } else {
            let height = content.map_or(pool.height, |c| {
                (c.bottom() + pad - pool.y).max(config.min_lane_height)
            });
            diagram.resize_element(id, Bounds::new(pool.x, pool.y, width, height))?;
        }
        Ok(())
    }

    /// Lay out an explicit element set anchored at its current top-left corner.
    fn place_selection(&mut self, diagram: &mut Diagram, members: &[String]) -> Result<(), LayoutError> {
        let origin = Bounds::enclosing(
            members
                .iter()
                .filter_map(|id| diagram.shape(id))
                .map(|shape| &shape.bounds),
        )
        .map(|b| Point::new(b.x, b.y))
        .unwrap_or_default();
        let hints = members
            .first()
            .and_then(|id| diagram.participant_of(id))
            .map(|pool| pool.id.clone())
            .map(|pool| lane_hints(diagram, &pool, members))
            .unwrap_or_default();
        let keep_routes = hints.is_empty();
        self.place(diagram, members, &hints, origin, keep_routes)?;
        contain_in_lanes(diagram, members);
        Ok(())
    }

    fn fast_path_order(
        &self,
        members: &[String],
        edges: &[UnitEdge],
        lane_hint: &HashMap<String, usize>,
    ) -> Option<Vec<String>> {
        if self.strategy != LayoutStrategy::Deterministic {
            return None;
        }
        let lanes: BTreeSet<usize> = members
            .iter()
            .filter_map(|id| lane_hint.get(id).copied())
            .collect();
        if lanes.len() > 1 {
            log::debug!(nodes = members.len(), lanes = lanes.len(); "path spans several lanes, using full layout");
            return None;
        }
        let mut pairs: Vec<(String, String)> = edges
            .iter()
            .map(|edge| (edge.from.clone(), edge.to.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();
        let order =
            deterministic::simple_path_order(members, &pairs, self.config.deterministic.max_nodes);
        if order.is_none() {
            log::debug!(nodes = members.len(), edges = pairs.len(); "graph is not a simple path, using full layout");
        }
        order
    }

    fn invoke_engine(
        &self,
        members: &[String],
        edges: &[UnitEdge],
        sizes: &BTreeMap<String, Bounds>,
        lane_hint: &HashMap<String, usize>,
    ) -> Result<EngineResponse, LayoutError> {
        let request = EngineRequest {
            nodes: members
                .iter()
                .filter_map(|id| {
                    let size = sizes.get(id)?;
                    Some(EngineNode {
                        id: id.clone(),
                        width: size.width,
                        height: size.height,
                        order: lane_hint.get(id).copied(),
                    })
                })
                .collect(),
            edges: edges
                .iter()
                .map(|edge| EngineEdge {
                    id: edge.id.clone(),
                    source: edge.from.clone(),
                    target: edge.to.clone(),
                    fixed: edge.fixed,
                })
                .collect(),
            direction: self.config.direction,
            node_spacing: self.config.node_spacing,
            rank_spacing: self.config.rank_spacing,
        };
        log::debug!(nodes = request.nodes.len(), edges = request.edges.len(); "invoking layout engine");
        self.engine.layout(&request).map_err(|err| {
            log::warn!(error = err.to_string(); "layout engine failed");
            LayoutError::from(err)
        })
    }

    /// Position `members` with their top-left content corner at `origin`.
    ///
    /// Returns the bounds of the placed members, `None` if there were none.
    fn place(
        &mut self,
        diagram: &mut Diagram,
        members: &[String],
        lane_hint: &HashMap<String, usize>,
        origin: Point,
        keep_routes: bool,
    ) -> Result<Option<Bounds>, LayoutError> {
        if members.is_empty() {
            return Ok(None);
        }
        let member_set: BTreeSet<&str> = members.iter().map(String::as_str).collect();
        let edges = unit_edges(diagram, &member_set, self.pins);
        let sizes: BTreeMap<String, Bounds> = members
            .iter()
            .filter_map(|id| diagram.shape(id).map(|shape| (id.clone(), shape.bounds)))
            .collect();

        let (raw, routes) = match self.fast_path_order(members, &edges, lane_hint) {
            Some(order) => {
                self.fast_path_units += 1;
                let line = deterministic::place_on_line(
                    &order,
                    &sizes,
                    Point::default(),
                    self.config.deterministic.spacing,
                );
                (line, BTreeMap::new())
            }
            None => {
                self.engine_units += 1;
                let response = self.invoke_engine(members, &edges, &sizes, lane_hint)?;
                (response.positions, response.routes)
            }
        };

        let mut placed: Vec<(&str, Point)> = Vec::with_capacity(members.len());
        for id in members {
            let point = raw
                .get(id)
                .copied()
                .ok_or_else(|| EngineError::MissingNode(id.clone()))?;
            if !point.is_finite() {
                return Err(EngineError::InvalidCoordinate { id: id.clone() }.into());
            }
            placed.push((id.as_str(), point));
        }
        let min_x = placed.iter().map(|(_, p)| p.x).fold(f32::INFINITY, f32::min);
        let min_y = placed.iter().map(|(_, p)| p.y).fold(f32::INFINITY, f32::min);
        let shift_x = origin.x - min_x;
        let shift_y = origin.y - min_y;

        for (id, point) in &placed {
            let Some(old) = sizes.get(*id) else {
                continue;
            };
            diagram.translate_subtree(id, point.x + shift_x - old.x, point.y + shift_y - old.y);
        }

        if keep_routes {
            for edge in edges.iter().filter(|edge| edge.direct && !edge.fixed) {
                let Some(route) = routes.get(&edge.id) else {
                    continue;
                };
                if route.len() < 2 || route.iter().any(|p| !p.is_finite()) {
                    continue;
                }
                let points = route
                    .iter()
                    .map(|p| p.translated(shift_x, shift_y))
                    .collect();
                diagram.update_waypoints(&edge.id, points)?;
                self.routed.insert(edge.id.clone());
            }
        }

        Ok(Bounds::enclosing(
            members
                .iter()
                .filter_map(|id| diagram.shape(id))
                .map(|shape| &shape.bounds),
        ))
    }
}

/// Pull selected nodes back inside their lane band.
fn contain_in_lanes(diagram: &mut Diagram, members: &[String]) {
    for id in members {
        let Some(lane_id) = diagram.resolved_lane(id) else {
            continue;
        };
        let (Some(lane), Some(node)) = (
            diagram.shape(&lane_id).map(|shape| shape.bounds),
            diagram.shape(id).map(|shape| shape.bounds),
        ) else {
            continue;
        };
        if node.y >= lane.y && node.bottom() <= lane.bottom() {
            continue;
        }
        let target = lane.y + ((lane.height - node.height) / 2.0).max(0.0);
        diagram.translate_subtree(id, 0.0, target - node.y);
    }
}

/// Route every unpinned connection that lost its geometry: one whose
/// endpoint moved and that the engine did not route, or an in-scope one
/// with no path.
fn reroute_moved(
    working: &mut Diagram,
    original: &Diagram,
    routed: &BTreeSet<String>,
    in_scope: &BTreeSet<String>,
    pins: &PinRegistry,
    direction: Direction,
) -> Result<usize, LayoutError> {
    let before: HashMap<&str, Bounds> = original
        .shapes
        .iter()
        .map(|shape| (shape.id.as_str(), shape.bounds))
        .collect();
    let mut jobs: Vec<(String, Bounds, Bounds)> = Vec::new();
    for conn in &working.connections {
        if routed.contains(&conn.id) || pins.is_pinned(&conn.id) {
            continue;
        }
        let (Some(from), Some(to)) = (working.shape(&conn.source), working.shape(&conn.target))
        else {
            continue;
        };
        let moved = before.get(from.id.as_str()) != Some(&from.bounds)
            || before.get(to.id.as_str()) != Some(&to.bounds);
        let pathless = conn.waypoints.len() < 2
            && (in_scope.contains(&conn.source) || in_scope.contains(&conn.target));
        if moved || pathless {
            jobs.push((conn.id.clone(), from.bounds, to.bounds));
        }
    }
    let count = jobs.len();
    for (id, from, to) in jobs {
        working.update_waypoints(&id, route_orthogonal(&from, &to, direction))?;
    }
    Ok(count)
}

struct DisplacementSummary {
    moved: usize,
    max: f32,
    avg: f32,
    top: Vec<Displacement>,
}

fn measure_displacement(
    before: &Diagram,
    after: &Diagram,
    config: &DisplacementConfig,
) -> DisplacementSummary {
    let current: HashMap<&str, Bounds> = after
        .shapes
        .iter()
        .map(|shape| (shape.id.as_str(), shape.bounds))
        .collect();
    let mut moved: Vec<Displacement> = before
        .shapes
        .iter()
        .filter_map(|shape| {
            let now = current.get(shape.id.as_str())?;
            let dx = now.x - shape.bounds.x;
            let dy = now.y - shape.bounds.y;
            let distance = dx.hypot(dy);
            (distance > config.epsilon).then(|| Displacement {
                element_id: shape.id.clone(),
                dx,
                dy,
                distance,
            })
        })
        .collect();
    let max = moved.iter().map(|d| d.distance).fold(0.0f32, f32::max);
    let avg = if moved.is_empty() {
        0.0
    } else {
        moved.iter().map(|d| d.distance).sum::<f32>() / moved.len() as f32
    };
    let count = moved.len();
    moved.sort_by(|a, b| {
        b.distance
            .total_cmp(&a.distance)
            .then_with(|| a.element_id.cmp(&b.element_id))
    });
    moved.truncate(config.top_count);
    DisplacementSummary {
        moved: count,
        max,
        avg,
        top: moved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConnectionKind, Shape, ShapeKind};

    /// Places nodes in request order on a grid: one column per node, one row
    /// per order hint. Never routes.
    struct ColumnEngine;

    impl LayoutEngine for ColumnEngine {
        fn layout(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
            let mut response = EngineResponse::default();
            for (idx, node) in request.nodes.iter().enumerate() {
                let row = node.order.unwrap_or(0) as f32;
                response
                    .positions
                    .insert(node.id.clone(), Point::new(idx as f32 * 200.0, row * 150.0));
            }
            Ok(response)
        }
    }

    struct FailingEngine;

    impl LayoutEngine for FailingEngine {
        fn layout(&self, _request: &EngineRequest) -> Result<EngineResponse, EngineError> {
            Err(EngineError::Unavailable("engine offline".into()))
        }
    }

    fn task(id: &str, x: f32, y: f32) -> Shape {
        Shape::new(id, ShapeKind::Task, Bounds::new(x, y, 100.0, 80.0))
    }

    fn chain() -> Diagram {
        let mut d = Diagram::new("chain");
        d.add_shape(Shape::new(
            "Start",
            ShapeKind::StartEvent,
            Bounds::new(400.0, 300.0, 36.0, 36.0),
        ));
        d.add_shape(task("Task", 10.0, 10.0));
        d.add_shape(Shape::new(
            "End",
            ShapeKind::EndEvent,
            Bounds::new(200.0, 500.0, 36.0, 36.0),
        ));
        d.connect("f1", ConnectionKind::SequenceFlow, "Start", "Task");
        d.connect("f2", ConnectionKind::SequenceFlow, "Task", "End");
        d
    }

    fn run(
        diagram: &mut Diagram,
        pins: &mut PinRegistry,
        options: LayoutOptions,
    ) -> Result<LayoutReport, LayoutError> {
        run_layout(diagram, pins, &ColumnEngine, &options, &LayoutConfig::default())
    }

    #[test]
    fn deterministic_chain_shares_a_center_line() {
        let mut diagram = chain();
        let mut pins = PinRegistry::new();
        let report = run(
            &mut diagram,
            &mut pins,
            LayoutOptions {
                layout_strategy: LayoutStrategy::Deterministic,
                ..LayoutOptions::default()
            },
        )
        .unwrap();
        assert_eq!(report.layout_strategy, LayoutStrategy::Deterministic);
        let c = |id: &str| diagram.shape(id).unwrap().bounds.center();
        assert!(c("Start").x < c("Task").x && c("Task").x < c("End").x);
        assert!((c("Start").y - c("Task").y).abs() < 0.5);
        assert!((c("End").y - c("Task").y).abs() < 0.5);
        assert_eq!(diagram.shape("Task").unwrap().bounds.y, 20.0);
    }

    #[test]
    fn branching_graph_falls_back_to_full() {
        let mut diagram = chain();
        diagram.add_shape(task("Other", 0.0, 0.0));
        diagram.connect("f3", ConnectionKind::SequenceFlow, "Task", "Other");
        let report = run(
            &mut diagram,
            &mut PinRegistry::new(),
            LayoutOptions {
                layout_strategy: LayoutStrategy::Deterministic,
                ..LayoutOptions::default()
            },
        )
        .unwrap();
        assert_eq!(report.layout_strategy, LayoutStrategy::Full);
    }

    #[test]
    fn invalid_scope_is_rejected_before_any_change() {
        let mut diagram = chain();
        let snapshot = diagram.clone();
        let mut pins = PinRegistry::new();
        let task_scope = LayoutOptions {
            scope_element_id: Some("Task".into()),
            ..LayoutOptions::default()
        };
        assert!(matches!(
            run(&mut diagram, &mut pins, task_scope),
            Err(LayoutError::Validation(_))
        ));
        let missing = LayoutOptions {
            scope_element_id: Some("Nope".into()),
            ..LayoutOptions::default()
        };
        assert!(matches!(
            run(&mut diagram, &mut pins, missing),
            Err(LayoutError::NotFound { .. })
        ));
        assert_eq!(diagram, snapshot);
    }

    #[test]
    fn engine_failure_changes_nothing() {
        let mut diagram = chain();
        let mut pins = PinRegistry::new();
        set_waypoints(
            &mut diagram,
            &mut pins,
            "f1",
            &[Point::new(0.0, 0.0), Point::new(5.0, 5.0)],
        )
        .unwrap();
        let snapshot = diagram.clone();
        let err = run_layout(
            &mut diagram,
            &mut pins,
            &FailingEngine,
            &LayoutOptions::default(),
            &LayoutConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::Engine(EngineError::Unavailable(_))));
        assert_eq!(diagram, snapshot);
        assert!(pins.is_pinned("f1"));
    }

    #[test]
    fn full_layout_restores_then_consumes_pins() {
        let mut diagram = chain();
        let mut pins = PinRegistry::new();
        let pinned = [
            Point::new(436.0, 318.0),
            Point::new(436.0, 0.0),
            Point::new(10.0, 0.0),
        ];
        set_waypoints(&mut diagram, &mut pins, "f1", &pinned).unwrap();
        let report = run(&mut diagram, &mut pins, LayoutOptions::default()).unwrap();
        assert_eq!(report.pins_restored, 1);
        assert_eq!(report.pins_cleared, 1);
        assert_eq!(diagram.connection("f1").unwrap().waypoints, pinned.to_vec());
        assert!(pins.is_empty());
        assert!(diagram.connection("f2").unwrap().waypoints.len() >= 2);
    }

    #[test]
    fn element_subset_keeps_foreign_pins() {
        let mut diagram = chain();
        diagram.add_shape(task("Left", 0.0, 700.0));
        diagram.add_shape(task("Right", 150.0, 900.0));
        diagram.connect("f3", ConnectionKind::SequenceFlow, "Left", "Right");
        let mut pins = PinRegistry::new();
        let pinned = [Point::new(1.0, 1.0), Point::new(2.0, 2.0)];
        set_waypoints(&mut diagram, &mut pins, "f1", &pinned).unwrap();

        let report = run(
            &mut diagram,
            &mut pins,
            LayoutOptions {
                element_ids: Some(vec!["Left".into(), "Right".into()]),
                ..LayoutOptions::default()
            },
        )
        .unwrap();
        assert_eq!(report.pins_cleared, 0);
        assert!(pins.is_pinned("f1"));
        assert_eq!(diagram.connection("f1").unwrap().waypoints, pinned.to_vec());
        // Anchored at the old top-left corner of the pair.
        assert_eq!(diagram.shape("Left").unwrap().bounds.x, 0.0);
        assert_eq!(diagram.shape("Left").unwrap().bounds.y, 700.0);
        assert_eq!(diagram.shape("Right").unwrap().bounds.x, 200.0);
        assert_eq!(diagram.shape("Start").unwrap().bounds.x, 400.0);
    }

    #[test]
    fn dry_run_reports_without_mutating() {
        let mut diagram = chain();
        let mut pins = PinRegistry::new();
        set_waypoints(
            &mut diagram,
            &mut pins,
            "f2",
            &[Point::new(0.0, 0.0), Point::new(5.0, 5.0)],
        )
        .unwrap();
        let snapshot = diagram.clone();
        let report = run(
            &mut diagram,
            &mut pins,
            LayoutOptions {
                dry_run: true,
                ..LayoutOptions::default()
            },
        )
        .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.element_count, 3);
        assert_eq!(report.moved_count, 3);
        assert!(report.max_displacement >= report.avg_displacement);
        assert_eq!(report.top_displacements.len(), 3);
        assert_eq!(
            report.top_displacements[0].distance,
            report.max_displacement
        );
        assert_eq!(diagram, snapshot);
        assert!(pins.is_pinned("f2"));
    }

    #[test]
    fn subprocess_scope_leaves_outside_alone() {
        let mut diagram = Diagram::new("sub");
        diagram.add_shape(task("Outside", 0.0, 0.0));
        diagram.add_shape(Shape::new(
            "Sub",
            ShapeKind::SubProcess,
            Bounds::new(300.0, 0.0, 150.0, 100.0),
        ));
        diagram.add_shape(task("X", 900.0, 900.0).with_parent("Sub"));
        diagram.add_shape(task("Y", 310.0, 10.0).with_parent("Sub"));
        diagram.connect("inner", ConnectionKind::SequenceFlow, "X", "Y");
        diagram.connect("outer", ConnectionKind::SequenceFlow, "Outside", "Sub");

        run(
            &mut diagram,
            &mut PinRegistry::new(),
            LayoutOptions {
                scope_element_id: Some("Sub".into()),
                ..LayoutOptions::default()
            },
        )
        .unwrap();
        assert_eq!(diagram.shape("Outside").unwrap().bounds, task("Outside", 0.0, 0.0).bounds);
        let sub = diagram.shape("Sub").unwrap().bounds;
        assert_eq!((sub.x, sub.y), (300.0, 0.0));
        for id in ["X", "Y"] {
            let b = diagram.shape(id).unwrap().bounds;
            assert!(b.x >= sub.x && b.right() <= sub.right(), "{id} {b:?} {sub:?}");
            assert!(b.y >= sub.y && b.bottom() <= sub.bottom(), "{id} {b:?} {sub:?}");
        }
        assert!(diagram.connection("inner").unwrap().waypoints.len() >= 2);
    }

    #[test]
    fn scoped_layout_keeps_outside_labels() {
        let mut diagram = Diagram::new("sub-labels");
        diagram.add_shape(
            Shape::new("Outside", ShapeKind::StartEvent, Bounds::new(0.0, 0.0, 36.0, 36.0))
                .with_label(Bounds::new(0.0, -30.0, 90.0, 20.0)),
        );
        diagram.add_shape(Shape::new(
            "Sub",
            ShapeKind::SubProcess,
            Bounds::new(300.0, 0.0, 150.0, 100.0),
        ));
        diagram.add_shape(task("X", 900.0, 900.0).with_parent("Sub"));
        diagram.add_shape(task("Y", 310.0, 10.0).with_parent("Sub"));
        diagram.connect("inner", ConnectionKind::SequenceFlow, "X", "Y");
        diagram.connect("outer", ConnectionKind::SequenceFlow, "Outside", "Sub");

        run(
            &mut diagram,
            &mut PinRegistry::new(),
            LayoutOptions {
                scope_element_id: Some("Sub".into()),
                ..LayoutOptions::default()
            },
        )
        .unwrap();
        let outside = diagram.shape("Outside").unwrap();
        assert_eq!(outside.bounds, Bounds::new(0.0, 0.0, 36.0, 36.0));
        assert_eq!(
            outside.label.as_ref().map(|label| label.bounds),
            Some(Bounds::new(0.0, -30.0, 90.0, 20.0))
        );
    }

    #[test]
    fn optimize_lanes_rejects_element_selection() {
        let mut diagram = chain();
        let before = diagram.clone();
        let err = run(
            &mut diagram,
            &mut PinRegistry::new(),
            LayoutOptions {
                element_ids: Some(vec!["Task".into()]),
                lane_strategy: LaneStrategy::Optimize,
                ..LayoutOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::Validation(_)), "{err:?}");
        assert_eq!(diagram, before);
    }

    #[test]
    fn boundary_event_moves_with_its_host() {
        let mut diagram = Diagram::new("boundary");
        diagram.add_shape(task("Host", 500.0, 500.0));
        diagram.add_shape(Shape::new(
            "Timer",
            ShapeKind::BoundaryEvent {
                attached_to: "Host".into(),
            },
            Bounds::new(532.0, 562.0, 36.0, 36.0),
        ));
        diagram.add_shape(task("Escalate", 0.0, 0.0));
        diagram.connect("esc", ConnectionKind::SequenceFlow, "Timer", "Escalate");

        run(&mut diagram, &mut PinRegistry::new(), LayoutOptions::default()).unwrap();
        let host = diagram.shape("Host").unwrap().bounds;
        let timer = diagram.shape("Timer").unwrap().bounds;
        assert_eq!((timer.x - host.x, timer.y - host.y), (32.0, 62.0));
        let route = &diagram.connection("esc").unwrap().waypoints;
        assert!(route.len() >= 2);
    }

    #[test]
    fn lanes_contain_their_nodes_after_full_layout() {
        let mut diagram = Diagram::new("pool");
        diagram.add_shape(Shape::new(
            "Pool",
            ShapeKind::Participant,
            Bounds::new(300.0, 300.0, 600.0, 240.0),
        ));
        diagram.add_shape(
            Shape::new("Top", ShapeKind::Lane, Bounds::new(330.0, 300.0, 570.0, 120.0))
                .with_parent("Pool"),
        );
        diagram.add_shape(
            Shape::new("Bottom", ShapeKind::Lane, Bounds::new(330.0, 420.0, 570.0, 120.0))
                .with_parent("Pool"),
        );
        diagram.add_shape(task("A", 400.0, 320.0).with_parent("Pool").with_lane("Top"));
        diagram.add_shape(task("B", 400.0, 440.0).with_parent("Pool").with_lane("Bottom"));
        diagram.add_shape(task("C", 700.0, 320.0).with_parent("Pool").with_lane("Top"));
        diagram.connect("ab", ConnectionKind::SequenceFlow, "A", "B");
        diagram.connect("bc", ConnectionKind::SequenceFlow, "B", "C");

        run(&mut diagram, &mut PinRegistry::new(), LayoutOptions::default()).unwrap();
        let pool = diagram.shape("Pool").unwrap().bounds;
        assert_eq!((pool.x, pool.y), (20.0, 20.0));
        for (node, lane) in [("A", "Top"), ("B", "Bottom"), ("C", "Top")] {
            let n = diagram.shape(node).unwrap().bounds;
            let l = diagram.shape(lane).unwrap().bounds;
            assert!(n.y >= l.y && n.bottom() <= l.bottom(), "{node} {n:?} in {lane} {l:?}");
            assert!(n.right() <= pool.right());
        }
        let lanes = diagram.lanes_of("Pool");
        assert_eq!(lanes[0].bounds.bottom(), lanes[1].bounds.y);
    }

    #[test]
    fn lane_strategy_optimize_reports_per_pool() {
        let mut diagram = Diagram::new("empty");
        diagram.add_shape(task("Solo", 0.0, 0.0));
        let report = run(
            &mut diagram,
            &mut PinRegistry::new(),
            LayoutOptions {
                lane_strategy: LaneStrategy::Optimize,
                ..LayoutOptions::default()
            },
        )
        .unwrap();
        assert_eq!(report.lane_optimization.len(), 1);
        assert!(!report.lane_optimization[0].success);
    }

    #[test]
    fn options_parse_from_camel_case_json() {
        let options: LayoutOptions = serde_json::from_value(serde_json::json!({
            "scopeElementId": "Pool",
            "layoutStrategy": "deterministic",
            "laneStrategy": "optimize",
            "dryRun": true
        }))
        .unwrap();
        assert_eq!(options.scope_element_id.as_deref(), Some("Pool"));
        assert_eq!(options.layout_strategy, LayoutStrategy::Deterministic);
        assert_eq!(options.lane_strategy, LaneStrategy::Optimize);
        assert!(options.dry_run);
        assert!(!options.is_whole_diagram());
    }
}
