use crate::config::LayoutConfig;
use crate::error::{ElementClass, LayoutError};
use crate::history::{History, HistoryEntry};
use crate::ir::{Diagram, Point};
use crate::layout::{
    self, DagreEngine, LaneOptimizationReport, LayoutEngine, LayoutOptions, LayoutReport,
    PinOutcome, PinRegistry,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Mutable state of one open diagram. Pins live here and nowhere else.
#[derive(Debug)]
pub struct DiagramSession {
    diagram: Diagram,
    pins: PinRegistry,
    history: History,
}

impl DiagramSession {
    pub fn new(diagram: Diagram, history_limit: usize) -> Self {
        Self {
            diagram,
            pins: PinRegistry::new(),
            history: History::new(history_limit),
        }
    }

    pub fn diagram(&self) -> &Diagram {
        &self.diagram
    }

    pub fn pins(&self) -> &PinRegistry {
        &self.pins
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Run a mutating operation; on error the session is rolled back, on
    /// success the change is recorded for undo.
    fn record<T>(
        &mut self,
        operation: &str,
        op: impl FnOnce(&mut Diagram, &mut PinRegistry) -> Result<T, LayoutError>,
    ) -> Result<T, LayoutError> {
        let diagram_before = self.diagram.clone();
        let pins_before = self.pins.clone();
        match op(&mut self.diagram, &mut self.pins) {
            Ok(value) => {
                self.history.record(HistoryEntry::capture(
                    operation,
                    (&diagram_before, &pins_before),
                    (&self.diagram, &self.pins),
                ));
                Ok(value)
            }
            Err(err) => {
                self.diagram = diagram_before;
                self.pins = pins_before;
                Err(err)
            }
        }
    }

    pub fn layout(
        &mut self,
        engine: &dyn LayoutEngine,
        options: &LayoutOptions,
        config: &LayoutConfig,
    ) -> Result<LayoutReport, LayoutError> {
        if options.dry_run {
            return layout::run_layout(&mut self.diagram, &mut self.pins, engine, options, config);
        }
        self.record("layout", |diagram, pins| {
            layout::run_layout(diagram, pins, engine, options, config)
        })
    }

    pub fn set_connection_waypoints(
        &mut self,
        connection_id: &str,
        points: &[Point],
    ) -> Result<PinOutcome, LayoutError> {
        self.record("set-connection-waypoints", |diagram, pins| {
            layout::set_waypoints(diagram, pins, connection_id, points)
        })
    }

    pub fn optimize_lane_assignments(
        &mut self,
        participant_id: Option<&str>,
        dry_run: bool,
        config: &LayoutConfig,
    ) -> Result<LaneOptimizationReport, LayoutError> {
        if dry_run {
            return layout::optimize_lane_assignments(
                &mut self.diagram,
                &self.pins,
                participant_id,
                true,
                config,
            );
        }
        self.record("optimize-lanes", |diagram, pins| {
            layout::optimize_lane_assignments(diagram, pins, participant_id, false, config)
        })
    }

    pub fn adjust_labels(&mut self, config: &LayoutConfig) -> Result<usize, LayoutError> {
        self.record("adjust-labels", |diagram, _| {
            Ok(layout::adjust_labels(diagram, &config.labels))
        })
    }

    pub fn undo(&mut self) -> Option<String> {
        self.history.undo(&mut self.diagram, &mut self.pins)
    }

    pub fn redo(&mut self) -> Option<String> {
        self.history.redo(&mut self.diagram, &mut self.pins)
    }
}

/// Open diagrams keyed by id.
///
/// Each session sits behind its own mutex which every operation holds for
/// its whole duration, engine call included, so operations on one diagram
/// queue up instead of interleaving. Different diagrams proceed in parallel.
pub struct DiagramRegistry {
    sessions: Mutex<HashMap<String, Arc<Mutex<DiagramSession>>>>,
    engine: Arc<dyn LayoutEngine>,
    config: LayoutConfig,
}

impl DiagramRegistry {
    pub fn new(engine: Arc<dyn LayoutEngine>, config: LayoutConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            engine,
            config,
        }
    }

    pub fn with_dagre(config: LayoutConfig) -> Self {
        Self::new(Arc::new(DagreEngine), config)
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    fn sessions(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, Arc<Mutex<DiagramSession>>>>, LayoutError> {
        self.sessions
            .lock()
            .map_err(|_| LayoutError::SessionPoisoned("registry".to_string()))
    }

    pub fn open(&self, diagram: Diagram) -> Result<(), LayoutError> {
        let mut sessions = self.sessions()?;
        if sessions.contains_key(&diagram.id) {
            return Err(LayoutError::validation(format!(
                "diagram {} is already open",
                diagram.id
            )));
        }
        log::debug!(diagram = diagram.id.as_str(), shapes = diagram.shapes.len(); "opened diagram session");
        let id = diagram.id.clone();
        let session = DiagramSession::new(diagram, self.config.history_limit);
        sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Drop the session and hand back its diagram. Pins die with the session.
    pub fn close(&self, diagram_id: &str) -> Result<Diagram, LayoutError> {
        let session = self
            .sessions()?
            .remove(diagram_id)
            .ok_or_else(|| LayoutError::not_found(ElementClass::Diagram, diagram_id))?;
        let guard = session
            .lock()
            .map_err(|_| LayoutError::SessionPoisoned(diagram_id.to_string()))?;
        Ok(guard.diagram.clone())
    }

    pub fn ids(&self) -> Result<Vec<String>, LayoutError> {
        let mut ids: Vec<String> = self.sessions()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Run `f` with the session locked.
    pub fn with_session<T>(
        &self,
        diagram_id: &str,
        f: impl FnOnce(&mut DiagramSession) -> Result<T, LayoutError>,
    ) -> Result<T, LayoutError> {
        let session = self
            .sessions()?
            .get(diagram_id)
            .cloned()
            .ok_or_else(|| LayoutError::not_found(ElementClass::Diagram, diagram_id))?;
        let mut guard = session
            .lock()
            .map_err(|_| LayoutError::SessionPoisoned(diagram_id.to_string()))?;
        f(&mut guard)
    }

    pub fn layout(
        &self,
        diagram_id: &str,
        options: &LayoutOptions,
    ) -> Result<LayoutReport, LayoutError> {
        self.with_session(diagram_id, |session| {
            session.layout(self.engine.as_ref(), options, &self.config)
        })
    }

    pub fn set_connection_waypoints(
        &self,
        diagram_id: &str,
        connection_id: &str,
        points: &[Point],
    ) -> Result<PinOutcome, LayoutError> {
        self.with_session(diagram_id, |session| {
            session.set_connection_waypoints(connection_id, points)
        })
    }

    /// Like [`Self::set_connection_waypoints`], for untyped `[{x, y}, ..]` input.
    pub fn set_connection_waypoints_json(
        &self,
        diagram_id: &str,
        connection_id: &str,
        waypoints: &serde_json::Value,
    ) -> Result<PinOutcome, LayoutError> {
        let points = layout::parse_waypoints(waypoints)?;
        self.set_connection_waypoints(diagram_id, connection_id, &points)
    }

    pub fn optimize_lane_assignments(
        &self,
        diagram_id: &str,
        participant_id: Option<&str>,
        dry_run: bool,
    ) -> Result<LaneOptimizationReport, LayoutError> {
        self.with_session(diagram_id, |session| {
            session.optimize_lane_assignments(participant_id, dry_run, &self.config)
        })
    }

    pub fn adjust_labels(&self, diagram_id: &str) -> Result<usize, LayoutError> {
        self.with_session(diagram_id, |session| session.adjust_labels(&self.config))
    }

    /// Current diagram, as it would be exported.
    pub fn snapshot(&self, diagram_id: &str) -> Result<Diagram, LayoutError> {
        self.with_session(diagram_id, |session| Ok(session.diagram.clone()))
    }

    pub fn pinned_connections(&self, diagram_id: &str) -> Result<Vec<String>, LayoutError> {
        self.with_session(diagram_id, |session| {
            Ok(session.pins.ids().map(str::to_string).collect())
        })
    }

    pub fn undo(&self, diagram_id: &str) -> Result<Option<String>, LayoutError> {
        self.with_session(diagram_id, |session| Ok(session.undo()))
    }

    pub fn redo(&self, diagram_id: &str) -> Result<Option<String>, LayoutError> {
        self.with_session(diagram_id, |session| Ok(session.redo()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::ir::{Bounds, ConnectionKind, Shape, ShapeKind};
    use crate::layout::{EngineRequest, EngineResponse};
    use serde_json::json;

    struct RowEngine;

    impl LayoutEngine for RowEngine {
        fn layout(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
            let mut response = EngineResponse::default();
            for (idx, node) in request.nodes.iter().enumerate() {
                response
                    .positions
                    .insert(node.id.clone(), Point::new(idx as f32 * 180.0, 0.0));
            }
            Ok(response)
        }
    }

    fn diagram(id: &str) -> Diagram {
        let mut d = Diagram::new(id);
        d.add_shape(Shape::new(
            "A",
            ShapeKind::Task,
            Bounds::new(300.0, 300.0, 100.0, 80.0),
        ));
        d.add_shape(Shape::new(
            "B",
            ShapeKind::Task,
            Bounds::new(0.0, 0.0, 100.0, 80.0),
        ));
        d.connect("f", ConnectionKind::SequenceFlow, "A", "B");
        d
    }

    fn registry() -> DiagramRegistry {
        DiagramRegistry::new(Arc::new(RowEngine), LayoutConfig::default())
    }

    #[test]
    fn unknown_diagram_is_not_found() {
        let registry = registry();
        let err = registry.layout("missing", &LayoutOptions::default()).unwrap_err();
        assert_eq!(err, LayoutError::not_found(ElementClass::Diagram, "missing"));
    }

    #[test]
    fn opening_twice_is_rejected() {
        let registry = registry();
        registry.open(diagram("d1")).unwrap();
        assert!(matches!(
            registry.open(diagram("d1")),
            Err(LayoutError::Validation(_))
        ));
        assert_eq!(registry.ids().unwrap(), vec!["d1".to_string()]);
    }

    #[test]
    fn layout_can_be_undone_and_redone() {
        let registry = registry();
        let original = diagram("d1");
        registry.open(original.clone()).unwrap();
        registry.layout("d1", &LayoutOptions::default()).unwrap();
        let laid_out = registry.snapshot("d1").unwrap();
        assert_ne!(laid_out, original);

        assert_eq!(registry.undo("d1").unwrap().as_deref(), Some("layout"));
        assert_eq!(registry.snapshot("d1").unwrap(), original);
        assert_eq!(registry.redo("d1").unwrap().as_deref(), Some("layout"));
        assert_eq!(registry.snapshot("d1").unwrap(), laid_out);
    }

    #[test]
    fn undoing_a_full_layout_brings_pins_back() {
        let registry = registry();
        registry.open(diagram("d1")).unwrap();
        registry
            .set_connection_waypoints_json("d1", "f", &json!([{"x": 0, "y": 0}, {"x": 9, "y": 9}]))
            .unwrap();
        registry.layout("d1", &LayoutOptions::default()).unwrap();
        assert!(registry.pinned_connections("d1").unwrap().is_empty());
        registry.undo("d1").unwrap();
        assert_eq!(registry.pinned_connections("d1").unwrap(), vec!["f".to_string()]);
    }

    #[test]
    fn json_waypoints_are_validated() {
        let registry = registry();
        registry.open(diagram("d1")).unwrap();
        let err = registry
            .set_connection_waypoints_json("d1", "f", &json!([{"x": 0, "y": "zero"}, {"x": 9, "y": 9}]))
            .unwrap_err();
        assert!(matches!(err, LayoutError::Validation(_)));
        assert!(registry.pinned_connections("d1").unwrap().is_empty());
    }

    #[test]
    fn dry_runs_leave_no_history() {
        let registry = registry();
        registry.open(diagram("d1")).unwrap();
        let options = LayoutOptions {
            dry_run: true,
            ..LayoutOptions::default()
        };
        let report = registry.layout("d1", &options).unwrap();
        assert!(report.moved_count > 0);
        assert_eq!(registry.undo("d1").unwrap(), None);
        assert_eq!(registry.snapshot("d1").unwrap(), diagram("d1"));
    }

    #[test]
    fn close_returns_the_diagram_without_pins() {
        let registry = registry();
        registry.open(diagram("d1")).unwrap();
        registry
            .set_connection_waypoints("d1", "f", &[Point::new(1.0, 1.0), Point::new(2.0, 2.0)])
            .unwrap();
        let closed = registry.close("d1").unwrap();
        assert_eq!(closed.connection("f").unwrap().waypoints.len(), 2);
        assert!(registry.ids().unwrap().is_empty());
        assert!(matches!(
            registry.snapshot("d1"),
            Err(LayoutError::NotFound { .. })
        ));
    }

    #[test]
    fn operations_on_one_diagram_are_serialized() {
        let registry = Arc::new(registry());
        registry.open(diagram("d1")).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.layout("d1", &LayoutOptions::default()))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        // The first layout moves everything; the rest find nothing to move
        // and record no history.
        assert_eq!(registry.undo("d1").unwrap().as_deref(), Some("layout"));
        assert_eq!(registry.undo("d1").unwrap(), None);
    }
}
