use crate::ir::{Bounds, Point};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Nodes in path order if the graph is one unbranched, acyclic chain.
pub(super) fn simple_path_order(
    node_ids: &[String],
    edges: &[(String, String)],
    max_nodes: usize,
) -> Option<Vec<String>> {
    if node_ids.is_empty() || node_ids.len() > max_nodes {
        return None;
    }
    let node_set: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
    let mut next: HashMap<&str, &str> = HashMap::new();
    let mut incoming: HashMap<&str, usize> = HashMap::new();
    for (from, to) in edges {
        if !node_set.contains(from.as_str()) || !node_set.contains(to.as_str()) {
            continue;
        }
        if from == to || next.insert(from.as_str(), to.as_str()).is_some() {
            return None;
        }
        let count = incoming.entry(to.as_str()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return None;
        }
    }
    if next.len() + 1 != node_ids.len() {
        return None;
    }
    let mut heads = node_ids
        .iter()
        .filter(|id| !incoming.contains_key(id.as_str()));
    let head = heads.next()?;
    if heads.next().is_some() {
        return None;
    }
    let mut order = vec![head.clone()];
    let mut current = head.as_str();
    while let Some(&succ) = next.get(current) {
        if order.len() >= node_ids.len() {
            return None;
        }
        order.push(succ.to_string());
        current = succ;
    }
    (order.len() == node_ids.len()).then_some(order)
}

/// Left-to-right placement at uniform gaps around a shared vertical centre.
pub(super) fn place_on_line(
    order: &[String],
    sizes: &BTreeMap<String, Bounds>,
    origin: Point,
    spacing: f32,
) -> BTreeMap<String, Point> {
    let max_height = order
        .iter()
        .filter_map(|id| sizes.get(id))
        .map(|b| b.height)
        .fold(0.0f32, f32::max);
    let center_y = origin.y + max_height / 2.0;
    let mut cursor = origin.x;
    let mut positions = BTreeMap::new();
    for id in order {
        let Some(size) = sizes.get(id) else {
            continue;
        };
        positions.insert(id.clone(), Point::new(cursor, center_y - size.height / 2.0));
        cursor += size.width + spacing;
    }
    positions
}
