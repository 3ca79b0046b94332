use crate::error::{ElementClass, LayoutError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    LeftRight,
    TopDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn translated(self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Bounds::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn enclosing<'a>(items: impl IntoIterator<Item = &'a Bounds>) -> Option<Bounds> {
        items
            .into_iter()
            .fold(None, |acc: Option<Bounds>, b| match acc {
                Some(acc) => Some(acc.union(b)),
                None => Some(*b),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ShapeKind {
    StartEvent,
    EndEvent,
    IntermediateEvent,
    BoundaryEvent {
        #[serde(rename = "attachedTo")]
        attached_to: String,
    },
    Task,
    Gateway,
    SubProcess,
    Participant,
    Lane,
    DataObject,
    TextAnnotation,
}

impl ShapeKind {
    /// Nodes that take part in sequence flow and get positioned by layout.
    pub fn is_flow_node(&self) -> bool {
        match self {
            ShapeKind::StartEvent
            | ShapeKind::EndEvent
            | ShapeKind::IntermediateEvent
            | ShapeKind::Task
            | ShapeKind::Gateway
            | ShapeKind::SubProcess
            | ShapeKind::DataObject
            | ShapeKind::TextAnnotation => true,
            ShapeKind::BoundaryEvent { .. } | ShapeKind::Participant | ShapeKind::Lane => false,
        }
    }

    pub fn is_container(&self) -> bool {
        match self {
            ShapeKind::SubProcess | ShapeKind::Participant => true,
            ShapeKind::StartEvent
            | ShapeKind::EndEvent
            | ShapeKind::IntermediateEvent
            | ShapeKind::BoundaryEvent { .. }
            | ShapeKind::Task
            | ShapeKind::Gateway
            | ShapeKind::Lane
            | ShapeKind::DataObject
            | ShapeKind::TextAnnotation => false,
        }
    }

    pub fn is_lane(&self) -> bool {
        matches!(self, ShapeKind::Lane)
    }

    pub fn is_participant(&self) -> bool {
        matches!(self, ShapeKind::Participant)
    }

    pub fn is_subprocess(&self) -> bool {
        matches!(self, ShapeKind::SubProcess)
    }

    /// Shapes whose name is drawn as a floating label outside the shape.
    pub fn has_external_label(&self) -> bool {
        match self {
            ShapeKind::StartEvent
            | ShapeKind::EndEvent
            | ShapeKind::IntermediateEvent
            | ShapeKind::BoundaryEvent { .. }
            | ShapeKind::Gateway
            | ShapeKind::DataObject => true,
            ShapeKind::Task
            | ShapeKind::SubProcess
            | ShapeKind::Participant
            | ShapeKind::Lane
            | ShapeKind::TextAnnotation => false,
        }
    }

    pub fn boundary_host(&self) -> Option<&str> {
        match self {
            ShapeKind::BoundaryEvent { attached_to } => Some(attached_to.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionKind {
    SequenceFlow,
    MessageFlow,
    Association,
    DataAssociation,
}

impl ConnectionKind {
    /// Flows carry process semantics; associations only annotate.
    pub fn is_flow(&self) -> bool {
        match self {
            ConnectionKind::SequenceFlow | ConnectionKind::MessageFlow => true,
            ConnectionKind::Association | ConnectionKind::DataAssociation => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub bounds: Bounds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    pub id: String,
    #[serde(flatten)]
    pub kind: ShapeKind,
    pub bounds: Bounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
}

impl Shape {
    pub fn new(id: impl Into<String>, kind: ShapeKind, bounds: Bounds) -> Self {
        Self {
            id: id.into(),
            kind,
            bounds,
            parent: None,
            lane: None,
            name: None,
            label: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn with_label(mut self, bounds: Bounds) -> Self {
        self.label = Some(Label { bounds });
        self
    }

    fn translate(&mut self, dx: f32, dy: f32) {
        self.bounds = self.bounds.translated(dx, dy);
        if let Some(label) = self.label.as_mut() {
            label.bounds = label.bounds.translated(dx, dy);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub waypoints: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        kind: ConnectionKind,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            source: source.into(),
            target: target.into(),
            waypoints: Vec::new(),
            label: None,
        }
    }

    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }

    /// Point halfway along the polyline, measured by length.
    pub fn midpoint(&self) -> Option<Point> {
        let points = &self.waypoints;
        match points.len() {
            0 => return None,
            1 => return Some(points[0]),
            _ => {}
        }
        let total: f32 = points
            .windows(2)
            .map(|seg| (seg[1].x - seg[0].x).hypot(seg[1].y - seg[0].y))
            .sum();
        if total <= 1e-6 {
            return Some(points[0]);
        }
        let mut remaining = total / 2.0;
        for seg in points.windows(2) {
            let len = (seg[1].x - seg[0].x).hypot(seg[1].y - seg[0].y);
            if remaining <= len && len > 0.0 {
                let t = remaining / len;
                return Some(Point::new(
                    seg[0].x + (seg[1].x - seg[0].x) * t,
                    seg[0].y + (seg[1].y - seg[0].y) * t,
                ));
            }
            remaining -= len;
        }
        points.last().copied()
    }

    fn translate(&mut self, dx: f32, dy: f32) {
        for point in &mut self.waypoints {
            *point = point.translated(dx, dy);
        }
        if let Some(label) = self.label.as_mut() {
            label.bounds = label.bounds.translated(dx, dy);
        }
    }
}

/// Borrowed view of one diagram element, as handed out by an [`ElementStore`].
#[derive(Debug, Clone, Copy)]
pub enum ElementRef<'a> {
    Shape(&'a Shape),
    Connection(&'a Connection),
}

impl ElementRef<'_> {
    pub fn id(&self) -> &str {
        match self {
            ElementRef::Shape(shape) => &shape.id,
            ElementRef::Connection(conn) => &conn.id,
        }
    }

    pub fn is_connection(&self) -> bool {
        match self {
            ElementRef::Shape(_) => false,
            ElementRef::Connection(_) => true,
        }
    }

    pub fn is_lane(&self) -> bool {
        match self {
            ElementRef::Shape(shape) => shape.kind.is_lane(),
            ElementRef::Connection(_) => false,
        }
    }

    pub fn is_participant(&self) -> bool {
        match self {
            ElementRef::Shape(shape) => shape.kind.is_participant(),
            ElementRef::Connection(_) => false,
        }
    }

    pub fn is_subprocess(&self) -> bool {
        match self {
            ElementRef::Shape(shape) => shape.kind.is_subprocess(),
            ElementRef::Connection(_) => false,
        }
    }
}

/// Mutation surface the layout core needs from whatever owns the elements.
pub trait ElementStore {
    fn element(&self, id: &str) -> Option<ElementRef<'_>>;
    fn update_waypoints(&mut self, connection_id: &str, points: Vec<Point>)
    -> Result<(), LayoutError>;
    fn move_element(&mut self, id: &str, dx: f32, dy: f32) -> Result<(), LayoutError>;
    fn resize_element(&mut self, id: &str, bounds: Bounds) -> Result<(), LayoutError>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Diagram {
    pub id: String,
    #[serde(default)]
    pub shapes: Vec<Shape>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Diagram {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shapes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn add_shape(&mut self, shape: Shape) {
        self.shapes.push(shape);
    }

    pub fn connect(
        &mut self,
        id: impl Into<String>,
        kind: ConnectionKind,
        source: impl Into<String>,
        target: impl Into<String>,
    ) {
        self.connections
            .push(Connection::new(id, kind, source, target));
    }

    pub fn shape(&self, id: &str) -> Option<&Shape> {
        self.shapes.iter().find(|shape| shape.id == id)
    }

    pub fn shape_mut(&mut self, id: &str) -> Option<&mut Shape> {
        self.shapes.iter_mut().find(|shape| shape.id == id)
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections.iter().find(|conn| conn.id == id)
    }

    pub fn connection_mut(&mut self, id: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|conn| conn.id == id)
    }

    pub fn children_of<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a Shape> + 'a {
        self.shapes
            .iter()
            .filter(move |shape| shape.parent.as_deref() == Some(parent_id))
    }

    /// Every shape nested below `id`, in document order. Lanes count as descendants.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for child in self.children_of(&current) {
                if found.insert(child.id.clone()) {
                    frontier.push(child.id.clone());
                }
            }
        }
        self.shapes
            .iter()
            .filter(|shape| found.contains(&shape.id))
            .map(|shape| shape.id.clone())
            .collect()
    }

    pub fn is_descendant_of(&self, id: &str, ancestor: &str) -> bool {
        let mut current = self.shape(id).and_then(|shape| shape.parent.clone());
        let mut guard = self.shapes.len();
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            if guard == 0 {
                return false;
            }
            guard -= 1;
            current = self.shape(&parent).and_then(|shape| shape.parent.clone());
        }
        false
    }

    /// Lanes of a participant, top to bottom.
    pub fn lanes_of(&self, participant_id: &str) -> Vec<&Shape> {
        let mut lanes: Vec<&Shape> = self
            .shapes
            .iter()
            .filter(|shape| shape.kind.is_lane() && shape.parent.as_deref() == Some(participant_id))
            .collect();
        lanes.sort_by(|a, b| a.bounds.y.total_cmp(&b.bounds.y));
        lanes
    }

    /// Lane a node belongs to: its own, its ancestors', or its boundary host's.
    pub fn resolved_lane(&self, node_id: &str) -> Option<String> {
        let mut current = self.shape(node_id);
        let mut guard = self.shapes.len() + 1;
        while let Some(shape) = current {
            if let Some(lane) = &shape.lane {
                return Some(lane.clone());
            }
            if guard == 0 {
                return None;
            }
            guard -= 1;
            let next = shape
                .kind
                .boundary_host()
                .or(shape.parent.as_deref())
                .map(str::to_string);
            current = next.and_then(|id| self.shape(&id));
        }
        None
    }

    /// Nearest participant enclosing `id`, if any.
    pub fn participant_of(&self, id: &str) -> Option<&Shape> {
        let mut current = self.shape(id).and_then(|shape| shape.parent.clone());
        let mut guard = self.shapes.len();
        while let Some(parent_id) = current {
            let parent = self.shape(&parent_id)?;
            if parent.kind.is_participant() {
                return Some(parent);
            }
            if guard == 0 {
                return None;
            }
            guard -= 1;
            current = parent.parent.clone();
        }
        None
    }

    /// `id`, its descendants, and every boundary event attached to any of them.
    pub fn subtree_ids(&self, id: &str) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = BTreeSet::new();
        ids.insert(id.to_string());
        ids.extend(self.descendants(id));
        loop {
            let attached: Vec<String> = self
                .shapes
                .iter()
                .filter(|shape| {
                    !ids.contains(&shape.id)
                        && shape
                            .kind
                            .boundary_host()
                            .is_some_and(|host| ids.contains(host))
                })
                .map(|shape| shape.id.clone())
                .collect();
            if attached.is_empty() {
                break;
            }
            ids.extend(attached);
        }
        ids
    }

    /// Move a shape with everything that visually belongs to it.
    ///
    /// Descendants, attached boundary events and labels move by the same delta.
    /// Connections whose endpoints both move are translated; the rest are left
    /// for the caller to re-route. Returns the ids of the moved shapes.
    pub fn translate_subtree(&mut self, id: &str, dx: f32, dy: f32) -> BTreeSet<String> {
        let moved = self.subtree_ids(id);
        if dx == 0.0 && dy == 0.0 {
            return moved;
        }
        for shape in &mut self.shapes {
            if moved.contains(&shape.id) {
                shape.translate(dx, dy);
            }
        }
        for conn in &mut self.connections {
            if moved.contains(&conn.source) && moved.contains(&conn.target) {
                conn.translate(dx, dy);
            }
        }
        moved
    }
}

impl ElementStore for Diagram {
    fn element(&self, id: &str) -> Option<ElementRef<'_>> {
        if let Some(shape) = self.shape(id) {
            return Some(ElementRef::Shape(shape));
        }
        self.connection(id).map(ElementRef::Connection)
    }

    fn update_waypoints(
        &mut self,
        connection_id: &str,
        points: Vec<Point>,
    ) -> Result<(), LayoutError> {
        if self.shape(connection_id).is_some() {
            return Err(LayoutError::validation(format!(
                "{connection_id} is a shape, not a connection"
            )));
        }
        let conn = self
            .connection_mut(connection_id)
            .ok_or_else(|| LayoutError::not_found(ElementClass::Connection, connection_id))?;
        conn.waypoints = points;
        Ok(())
    }

    fn move_element(&mut self, id: &str, dx: f32, dy: f32) -> Result<(), LayoutError> {
        if let Some(shape) = self.shape_mut(id) {
            shape.translate(dx, dy);
            return Ok(());
        }
        if let Some(conn) = self.connection_mut(id) {
            conn.translate(dx, dy);
            return Ok(());
        }
        Err(LayoutError::not_found(ElementClass::Element, id))
    }

    fn resize_element(&mut self, id: &str, bounds: Bounds) -> Result<(), LayoutError> {
        let Some(shape) = self.shape_mut(id) else {
            if self.connection(id).is_some() {
                return Err(LayoutError::validation(format!(
                    "{id} is a connection and has no bounds"
                )));
            }
            return Err(LayoutError::not_found(ElementClass::Element, id));
        };
        let old_center = shape.bounds.center();
        let new_center = bounds.center();
        shape.bounds = bounds;
        if let Some(label) = shape.label.as_mut() {
            label.bounds = label
                .bounds
                .translated(new_center.x - old_center.x, new_center.y - old_center.y);
        }
        Ok(())
    }
}
