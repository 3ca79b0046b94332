use super::routing::route_orthogonal;
use crate::error::EngineError;
use crate::ir::{Bounds, Direction, Point};
use dagre_rust::{
    GraphConfig as DagreConfig, GraphEdge as DagreEdge, GraphNode as DagreNode,
    layout as dagre_layout,
};
use graphlib_rust::{Graph as DagreGraph, GraphOption};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineNode {
    pub id: String,
    pub width: f32,
    pub height: f32,
    /// Position hint inside the node's rank; keeps lane members grouped.
    pub order: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Pinned connection: ranks nodes but must not be re-routed.
    pub fixed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub nodes: Vec<EngineNode>,
    pub edges: Vec<EngineEdge>,
    pub direction: Direction,
    pub node_spacing: f32,
    pub rank_spacing: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResponse {
    /// Top-left corner of each node.
    pub positions: BTreeMap<String, Point>,
    pub routes: BTreeMap<String, Vec<Point>>,
}

/// Hierarchical layout collaborator. Treated as a black box.
pub trait LayoutEngine: Send + Sync {
    fn layout(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError>;
}

/// Layered layout backed by `dagre_rust`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DagreEngine;

fn dagre_rankdir(direction: Direction) -> &'static str {
    match direction {
        Direction::LeftRight => "lr",
        Direction::TopDown => "tb",
    }
}

impl LayoutEngine for DagreEngine {
    fn layout(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        if request.nodes.is_empty() {
            return Ok(EngineResponse::default());
        }

        let mut dagre_graph: DagreGraph<DagreConfig, DagreNode, DagreEdge> =
            DagreGraph::new(Some(GraphOption {
                directed: Some(true),
                multigraph: Some(false),
                compound: Some(false),
            }));

        let mut graph_config = DagreConfig::default();
        graph_config.rankdir = Some(dagre_rankdir(request.direction).to_string());
        graph_config.nodesep = Some(request.node_spacing);
        graph_config.ranksep = Some(request.rank_spacing);
        graph_config.marginx = Some(0.0);
        graph_config.marginy = Some(0.0);
        dagre_graph.set_graph(graph_config);

        for node in &request.nodes {
            let mut dagre_node = DagreNode::default();
            dagre_node.width = node.width;
            dagre_node.height = node.height;
            dagre_node.order = node.order;
            dagre_graph.set_node(node.id.clone(), Some(dagre_node));
        }

        let node_set: HashSet<&str> = request.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut edge_set: HashSet<(String, String)> = HashSet::new();
        for edge in &request.edges {
            if edge.source == edge.target
                || !node_set.contains(edge.source.as_str())
                || !node_set.contains(edge.target.as_str())
            {
                continue;
            }
            let from = edge.source.clone();
            let to = edge.target.clone();
            if !edge_set.insert((from.clone(), to.clone())) {
                continue;
            }
            let edge_label = DagreEdge::default();
            let _ = dagre_graph.set_edge(&from, &to, Some(edge_label), None);
        }

        dagre_layout::run_layout(&mut dagre_graph);

        let mut response = EngineResponse::default();
        let mut placed: BTreeMap<&str, Bounds> = BTreeMap::new();
        for node in &request.nodes {
            let dagre_node = dagre_graph
                .node(&node.id)
                .ok_or_else(|| EngineError::MissingNode(node.id.clone()))?;
            let x = dagre_node.x - node.width / 2.0;
            let y = dagre_node.y - node.height / 2.0;
            if !x.is_finite() || !y.is_finite() {
                return Err(EngineError::InvalidCoordinate {
                    id: node.id.clone(),
                });
            }
            response.positions.insert(node.id.clone(), Point::new(x, y));
            placed.insert(node.id.as_str(), Bounds::new(x, y, node.width, node.height));
        }

        for edge in &request.edges {
            if edge.fixed {
                continue;
            }
            let (Some(from), Some(to)) = (
                placed.get(edge.source.as_str()),
                placed.get(edge.target.as_str()),
            ) else {
                continue;
            };
            response.routes.insert(
                edge.id.clone(),
                route_orthogonal(from, to, request.direction),
            );
        }

        Ok(response)
    }
}
