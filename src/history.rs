use crate::ir::{Bounds, Diagram, Label, Point};
use crate::layout::PinRegistry;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeGeometry {
    pub bounds: Bounds,
    pub label: Option<Label>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionGeometry {
    pub waypoints: Vec<Point>,
    pub label: Option<Label>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub id: String,
    pub before: T,
    pub after: T,
}

/// Geometry of every element an operation touched, before and after.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometryDelta {
    pub shapes: Vec<Change<ShapeGeometry>>,
    pub connections: Vec<Change<ConnectionGeometry>>,
}

impl GeometryDelta {
    /// Elements present in both diagrams whose geometry differs.
    pub fn between(before: &Diagram, after: &Diagram) -> Self {
        let old_shapes: HashMap<&str, ShapeGeometry> = before
            .shapes
            .iter()
            .map(|shape| {
                (
                    shape.id.as_str(),
                    ShapeGeometry {
                        bounds: shape.bounds,
                        label: shape.label,
                    },
                )
            })
            .collect();
        let old_connections: HashMap<&str, ConnectionGeometry> = before
            .connections
            .iter()
            .map(|conn| {
                (
                    conn.id.as_str(),
                    ConnectionGeometry {
                        waypoints: conn.waypoints.clone(),
                        label: conn.label,
                    },
                )
            })
            .collect();

        let mut delta = GeometryDelta::default();
        for shape in &after.shapes {
            let Some(old) = old_shapes.get(shape.id.as_str()) else {
                continue;
            };
            let new = ShapeGeometry {
                bounds: shape.bounds,
                label: shape.label,
            };
            if *old != new {
                delta.shapes.push(Change {
                    id: shape.id.clone(),
                    before: old.clone(),
                    after: new,
                });
            }
        }
        for conn in &after.connections {
            let Some(old) = old_connections.get(conn.id.as_str()) else {
                continue;
            };
            if old.waypoints != conn.waypoints || old.label != conn.label {
                delta.connections.push(Change {
                    id: conn.id.clone(),
                    before: old.clone(),
                    after: ConnectionGeometry {
                        waypoints: conn.waypoints.clone(),
                        label: conn.label,
                    },
                });
            }
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty() && self.connections.is_empty()
    }

    fn apply(&self, diagram: &mut Diagram, forward: bool) {
        for change in &self.shapes {
            let target = if forward { &change.after } else { &change.before };
            if let Some(shape) = diagram.shape_mut(&change.id) {
                shape.bounds = target.bounds;
                shape.label = target.label;
            }
        }
        for change in &self.connections {
            let target = if forward { &change.after } else { &change.before };
            if let Some(conn) = diagram.connection_mut(&change.id) {
                conn.waypoints = target.waypoints.clone();
                conn.label = target.label;
            }
        }
    }
}

/// A reversible change to one session.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Geometry(GeometryDelta),
    Pins {
        before: PinRegistry,
        after: PinRegistry,
    },
}

impl Command {
    fn apply(&self, diagram: &mut Diagram, pins: &mut PinRegistry, forward: bool) {
        match self {
            Command::Geometry(delta) => delta.apply(diagram, forward),
            Command::Pins { before, after } => {
                *pins = if forward { after.clone() } else { before.clone() };
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Name of the operation that produced the entry.
    pub operation: String,
    pub commands: Vec<Command>,
}

impl HistoryEntry {
    /// Diff two session states into an entry; empty if nothing changed.
    pub fn capture(
        operation: &str,
        before: (&Diagram, &PinRegistry),
        after: (&Diagram, &PinRegistry),
    ) -> Self {
        let mut commands = Vec::new();
        let delta = GeometryDelta::between(before.0, after.0);
        if !delta.is_empty() {
            commands.push(Command::Geometry(delta));
        }
        if before.1 != after.1 {
            commands.push(Command::Pins {
                before: before.1.clone(),
                after: after.1.clone(),
            });
        }
        Self {
            operation: operation.to_string(),
            commands,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Bounded undo/redo log.
#[derive(Debug, Clone)]
pub struct History {
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            limit,
        }
    }

    /// Empty entries are dropped. A recorded entry invalidates the redo stack.
    pub fn record(&mut self, entry: HistoryEntry) {
        if entry.is_empty() || self.limit == 0 {
            return;
        }
        self.redo.clear();
        self.undo.push_back(entry);
        while self.undo.len() > self.limit {
            self.undo.pop_front();
        }
    }

    /// Revert the latest entry. Returns its operation name.
    pub fn undo(&mut self, diagram: &mut Diagram, pins: &mut PinRegistry) -> Option<String> {
        let entry = self.undo.pop_back()?;
        for command in entry.commands.iter().rev() {
            command.apply(diagram, pins, false);
        }
        let operation = entry.operation.clone();
        self.redo.push(entry);
        Some(operation)
    }

    pub fn redo(&mut self, diagram: &mut Diagram, pins: &mut PinRegistry) -> Option<String> {
        let entry = self.redo.pop()?;
        for command in &entry.commands {
            command.apply(diagram, pins, true);
        }
        let operation = entry.operation.clone();
        self.undo.push_back(entry);
        Some(operation)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }
}
