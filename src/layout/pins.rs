use crate::error::{ElementClass, LayoutError};
use crate::ir::{Diagram, ElementRef, ElementStore, Point};
use serde::Serialize;
use std::collections::BTreeMap;

/// Connections whose routing the user fixed by hand.
///
/// A pin survives partial layouts and is consumed by the next full layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PinRegistry {
    pins: BTreeMap<String, Vec<Point>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PinOutcome {
    pub success: bool,
    pub pinned: bool,
    pub previous_waypoints: Vec<Point>,
    pub new_waypoints: Vec<Point>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, connection_id: &str) -> Option<&[Point]> {
        self.pins.get(connection_id).map(Vec::as_slice)
    }

    pub fn is_pinned(&self, connection_id: &str) -> bool {
        self.pins.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.pins.keys().map(String::as_str)
    }

    /// Last write wins.
    pub(crate) fn insert(&mut self, connection_id: &str, points: Vec<Point>) {
        self.pins.insert(connection_id.to_string(), points);
    }

    pub(crate) fn clear_on_full_layout(&mut self) {
        if !self.pins.is_empty() {
            log::debug!(count = self.pins.len(); "full layout consumed waypoint pins");
        }
        self.pins.clear();
    }

    /// Write pinned waypoints back for every pin `in_scope` accepts.
    pub(crate) fn restore<S: ElementStore>(
        &self,
        store: &mut S,
        in_scope: impl Fn(&str) -> bool,
    ) -> Result<usize, LayoutError> {
        let mut restored = 0usize;
        for (id, points) in &self.pins {
            if !in_scope(id) {
                continue;
            }
            if store.element(id).is_none() {
                // Connection deleted since it was pinned.
                continue;
            }
            store.update_waypoints(id, points.clone())?;
            restored += 1;
        }
        Ok(restored)
    }
}

pub fn validate_waypoints(points: &[Point]) -> Result<(), LayoutError> {
    if points.len() < 2 {
        return Err(LayoutError::validation(format!(
            "at least 2 waypoints are required, got {}",
            points.len()
        )));
    }
    if let Some(idx) = points.iter().position(|p| !p.is_finite()) {
        return Err(LayoutError::validation(format!(
            "waypoint {idx} has a non-numeric coordinate"
        )));
    }
    Ok(())
}

/// Parse untyped `[{"x": .., "y": ..}, ..]` input into waypoints.
pub fn parse_waypoints(value: &serde_json::Value) -> Result<Vec<Point>, LayoutError> {
    let items = value
        .as_array()
        .ok_or_else(|| LayoutError::validation("waypoints must be an array"))?;
    let mut points = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let coord = |axis: &str| {
            item.get(axis)
                .and_then(serde_json::Value::as_f64)
                .ok_or_else(|| {
                    LayoutError::validation(format!("waypoint {idx} lacks a numeric {axis}"))
                })
        };
        let x = coord("x")?;
        let y = coord("y")?;
        points.push(Point::new(x as f32, y as f32));
    }
    validate_waypoints(&points)?;
    Ok(points)
}

/// Pin a connection and apply the points to the live diagram immediately.
pub fn set_waypoints(
    diagram: &mut Diagram,
    pins: &mut PinRegistry,
    connection_id: &str,
    points: &[Point],
) -> Result<PinOutcome, LayoutError> {
    validate_waypoints(points)?;
    let previous = match diagram.element(connection_id) {
        Some(ElementRef::Connection(conn)) => conn.waypoints.clone(),
        Some(ElementRef::Shape(_)) => {
            return Err(LayoutError::validation(format!(
                "{connection_id} is not a connection"
            )));
        }
        None => {
            return Err(LayoutError::not_found(
                ElementClass::Connection,
                connection_id,
            ));
        }
    };
    diagram.update_waypoints(connection_id, points.to_vec())?;
    pins.insert(connection_id, points.to_vec());
    log::debug!(connection = connection_id, points = points.len(); "pinned connection waypoints");
    Ok(PinOutcome {
        success: true,
        pinned: true,
        previous_waypoints: previous,
        new_waypoints: points.to_vec(),
    })
}
