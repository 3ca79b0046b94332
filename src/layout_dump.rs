use crate::ir::Diagram;
use anyhow::{Context, bail};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

/// Pretty JSON in document order. Session-only state such as pins is not part
/// of a diagram and never appears here.
pub fn export_json(diagram: &Diagram) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(diagram)?)
}

pub fn parse_diagram(input: &str) -> anyhow::Result<Diagram> {
    let diagram: Diagram = serde_json::from_str(input).context("invalid diagram JSON")?;
    check_references(&diagram)?;
    Ok(diagram)
}

/// Reject duplicate ids and references to elements that do not exist.
pub fn check_references(diagram: &Diagram) -> anyhow::Result<()> {
    let mut ids: HashSet<&str> = HashSet::new();
    for id in diagram
        .shapes
        .iter()
        .map(|shape| shape.id.as_str())
        .chain(diagram.connections.iter().map(|conn| conn.id.as_str()))
    {
        if !ids.insert(id) {
            bail!("duplicate element id {id}");
        }
    }
    let shape_ids: HashSet<&str> = diagram.shapes.iter().map(|s| s.id.as_str()).collect();
    for shape in &diagram.shapes {
        let refs = [
            ("parent", shape.parent.as_deref()),
            ("lane", shape.lane.as_deref()),
            ("attachedTo", shape.kind.boundary_host()),
        ];
        for (field, target) in refs {
            if let Some(target) = target {
                if !shape_ids.contains(target) {
                    bail!("shape {} has {field} {target}, which does not exist", shape.id);
                }
            }
        }
        if let Some(lane) = shape.lane.as_deref() {
            if diagram.shape(lane).is_some_and(|lane| !lane.kind.is_lane()) {
                bail!("shape {} names {lane} as its lane, which is not a lane", shape.id);
            }
        }
    }
    for conn in &diagram.connections {
        for endpoint in [&conn.source, &conn.target] {
            if !shape_ids.contains(endpoint.as_str()) {
                bail!("connection {} references missing shape {endpoint}", conn.id);
            }
        }
    }
    Ok(())
}

/// Read a diagram from `path`, or stdin for `-` / `None`.
pub fn read_diagram(path: Option<&Path>) -> anyhow::Result<Diagram> {
    let input = match path {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        _ => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    parse_diagram(&input)
}

/// Write `diagram` to `path`, or stdout when no path is given.
pub fn write_diagram(path: Option<&Path>, diagram: &Diagram) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path)?;
            let writer = BufWriter::new(file);
            serde_json::to_writer_pretty(writer, diagram)?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, diagram)?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "id": "d",
        "shapes": [
            {"id": "Pool", "type": "participant", "bounds": {"x": 0, "y": 0, "width": 600, "height": 250}},
            {"id": "Lane", "type": "lane", "parent": "Pool", "bounds": {"x": 30, "y": 0, "width": 570, "height": 250}},
            {"id": "Task", "type": "task", "parent": "Pool", "lane": "Lane", "bounds": {"x": 100, "y": 50, "width": 100, "height": 80}},
            {"id": "Timer", "type": "boundaryEvent", "attachedTo": "Task", "parent": "Pool", "bounds": {"x": 132, "y": 112, "width": 36, "height": 36}}
        ],
        "connections": [
            {"id": "Flow", "type": "sequenceFlow", "source": "Timer", "target": "Task"}
        ]
    }"#;

    #[test]
    fn parses_and_exports_stably() {
        let diagram = parse_diagram(SAMPLE).unwrap();
        assert_eq!(diagram.shapes.len(), 4);
        let first = export_json(&diagram).unwrap();
        let second = export_json(&parse_diagram(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn dangling_references_are_rejected() {
        let broken = SAMPLE.replace(r#""target": "Task""#, r#""target": "Ghost""#);
        let err = parse_diagram(&broken).unwrap_err();
        assert!(err.to_string().contains("Ghost"), "{err}");

        let bad_host = SAMPLE.replace(r#""attachedTo": "Task""#, r#""attachedTo": "Nope""#);
        assert!(parse_diagram(&bad_host).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dup = SAMPLE.replace(r#""id": "Flow""#, r#""id": "Task""#);
        assert!(parse_diagram(&dup).unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn lane_must_name_a_lane() {
        let wrong = SAMPLE.replace(r#""lane": "Lane""#, r#""lane": "Pool""#);
        assert!(parse_diagram(&wrong).is_err());
    }
}
