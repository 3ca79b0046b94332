use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementClass {
    Diagram,
    Element,
    Connection,
    Participant,
}

impl std::fmt::Display for ElementClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementClass::Diagram => "diagram",
            ElementClass::Element => "element",
            ElementClass::Connection => "connection",
            ElementClass::Participant => "participant",
        };
        f.write_str(name)
    }
}

/// Failure reported by an external layout engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("layout engine did not return a position for node {0}")]
    MissingNode(String),
    #[error("layout engine returned a non-finite coordinate for node {id}")]
    InvalidCoordinate { id: String },
    #[error("layout engine unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LayoutError {
    /// Bad argument shape. Raised before the diagram is touched.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: ElementClass, id: String },
    #[error("layout engine failed: {0}")]
    Engine(#[from] EngineError),
    #[error("diagram session {0} is poisoned by an earlier panic")]
    SessionPoisoned(String),
}

impl LayoutError {
    pub fn validation(message: impl Into<String>) -> Self {
        LayoutError::Validation(message.into())
    }

    pub fn not_found(kind: ElementClass, id: impl Into<String>) -> Self {
        LayoutError::NotFound {
            kind,
            id: id.into(),
        }
    }
}
