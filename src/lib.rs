#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod ir;
pub mod layout;
pub mod layout_dump;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::run;
pub use config::{LayoutConfig, load_config};
pub use error::{ElementClass, EngineError, LayoutError};
pub use ir::{Bounds, Connection, ConnectionKind, Diagram, Point, Shape, ShapeKind};
pub use layout::{
    LaneStrategy, LayoutOptions, LayoutReport, LayoutStrategy, PinRegistry, run_layout,
};
pub use layout_dump::{export_json, parse_diagram};
pub use session::{DiagramRegistry, DiagramSession};
