use crate::config::load_config;
use crate::ir::Point;
use crate::layout::{LaneStrategy, LayoutOptions, LayoutStrategy};
use crate::layout_dump::{read_diagram, write_diagram};
use crate::session::DiagramRegistry;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(name = "plx", version, about = "Auto-layout for process diagrams")]
pub struct Args {
    /// Input diagram (.json) or '-' for stdin
    #[arg(short = 'i', long = "input", global = true)]
    pub input: Option<PathBuf>,

    /// Output file. Defaults to stdout if omitted.
    #[arg(short = 'o', long = "output", global = true)]
    pub output: Option<PathBuf>,

    /// Layout config file (JSON5)
    #[arg(short = 'c', long = "configFile", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level", default_value = "warn", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lay out the whole diagram, one container, or a group of elements
    Layout {
        /// Participant or sub-process to lay out
        #[arg(long = "scope")]
        scope: Option<String>,

        /// Comma-separated shape ids to lay out as a group
        #[arg(long = "elements", value_delimiter = ',')]
        elements: Option<Vec<String>>,

        #[arg(long = "strategy", value_enum, default_value = "full")]
        strategy: LayoutStrategy,

        #[arg(long = "lanes", value_enum, default_value = "preserve")]
        lanes: LaneStrategy,

        #[arg(long = "dry-run")]
        dry_run: bool,

        /// Pin a connection before layout: CONN=x,y;x,y
        #[arg(long = "pin", value_parser = parse_pin)]
        pins: Vec<PinArg>,
    },
    /// Move external labels off flows, other labels and their hosts
    Labels,
    /// Reorder the lanes of one pool to shorten lane hops
    Lanes {
        #[arg(long = "participant")]
        participant: Option<String>,

        #[arg(long = "dry-run")]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PinArg {
    pub connection_id: String,
    pub waypoints: Vec<Point>,
}

fn parse_pin(raw: &str) -> Result<PinArg, String> {
    let (id, points) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected CONN=x,y;x,y, got {raw}"))?;
    let id = id.trim();
    if id.is_empty() {
        return Err("pin needs a connection id".to_string());
    }
    let mut waypoints = Vec::new();
    for pair in points.split(';').filter(|pair| !pair.trim().is_empty()) {
        let (x, y) = pair
            .split_once(',')
            .ok_or_else(|| format!("waypoint {pair} is not x,y"))?;
        let x: f32 = x.trim().parse().map_err(|_| format!("bad x in {pair}"))?;
        let y: f32 = y.trim().parse().map_err(|_| format!("bad y in {pair}"))?;
        waypoints.push(Point::new(x, y));
    }
    Ok(PinArg {
        connection_id: id.to_string(),
        waypoints,
    })
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    let level = LevelFilter::from_str(&args.log_level).unwrap_or_else(|_| {
        eprintln!("Invalid log level: {}. Using 'warn' instead.", args.log_level);
        LevelFilter::Warn
    });
    // A second init (embedding callers, tests) keeps the existing logger.
    let _ = env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .try_init();
    log::debug!(args:?; "parsed arguments");
    execute(&args)
}

pub fn execute(args: &Args) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let diagram = read_diagram(args.input.as_deref())?;
    let diagram_id = diagram.id.clone();
    let registry = DiagramRegistry::with_dagre(config);
    registry.open(diagram)?;

    match &args.command {
        Command::Layout {
            scope,
            elements,
            strategy,
            lanes,
            dry_run,
            pins,
        } => {
            for pin in pins {
                registry
                    .set_connection_waypoints(&diagram_id, &pin.connection_id, &pin.waypoints)
                    .with_context(|| format!("pinning {}", pin.connection_id))?;
            }
            let options = LayoutOptions {
                scope_element_id: scope.clone(),
                element_ids: elements.clone(),
                layout_strategy: *strategy,
                lane_strategy: *lanes,
                dry_run: *dry_run,
            };
            let report = registry.layout(&diagram_id, &options)?;
            print_report(&report)?;
        }
        Command::Labels => {
            let moved = registry.adjust_labels(&diagram_id)?;
            print_report(&serde_json::json!({ "success": true, "labelsMoved": moved }))?;
        }
        Command::Lanes {
            participant,
            dry_run,
        } => {
            let report =
                registry.optimize_lane_assignments(&diagram_id, participant.as_deref(), *dry_run)?;
            print_report(&report)?;
        }
    }

    let diagram = registry.close(&diagram_id)?;
    write_diagram(args.output.as_deref(), &diagram)?;
    log::info!(diagram = diagram_id.as_str(); "diagram written");
    Ok(())
}

fn print_report(report: &impl Serialize) -> Result<()> {
    eprintln!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
