use crate::ir::Direction;
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeterministicConfig {
    /// Largest simple path the fast path will take.
    pub max_nodes: usize,
    /// Gap between consecutive nodes on the path.
    pub spacing: f32,
}

impl Default for DeterministicConfig {
    fn default() -> Self {
        Self {
            max_nodes: 12,
            spacing: 80.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub width: f32,
    pub height: f32,
    pub margin: f32,
    pub crossing_weight: f32,
    pub label_overlap_weight: f32,
    pub host_overlap_weight: f32,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            width: 90.0,
            height: 20.0,
            margin: 8.0,
            crossing_weight: 1.0,
            label_overlap_weight: 1.0,
            host_overlap_weight: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    /// Lane counts up to this are searched exhaustively.
    pub exhaustive_limit: usize,
    pub max_swap_passes: usize,
    /// Pools at or above this coherence are reported as already optimal.
    pub skip_above_coherence: f32,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            exhaustive_limit: 7,
            max_swap_passes: 64,
            skip_above_coherence: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplacementConfig {
    /// Moves shorter than this are not counted as moves.
    pub epsilon: f32,
    pub top_count: usize,
}

impl Default for DisplacementConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.5,
            top_count: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub direction: Direction,
    pub node_spacing: f32,
    pub rank_spacing: f32,
    pub margin: f32,
    pub container_padding: f32,
    pub participant_header_width: f32,
    pub pool_spacing: f32,
    pub min_lane_height: f32,
    pub min_pool_width: f32,
    pub history_limit: usize,
    pub deterministic: DeterministicConfig,
    pub labels: LabelConfig,
    pub lanes: LaneConfig,
    pub displacement: DisplacementConfig,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            direction: Direction::LeftRight,
            node_spacing: 50.0,
            rank_spacing: 60.0,
            margin: 20.0,
            container_padding: 20.0,
            participant_header_width: 30.0,
            pool_spacing: 40.0,
            min_lane_height: 120.0,
            min_pool_width: 300.0,
            history_limit: 100,
            deterministic: DeterministicConfig::default(),
            labels: LabelConfig::default(),
            lanes: LaneConfig::default(),
            displacement: DisplacementConfig::default(),
        }
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_spacing < 0.0 || self.rank_spacing < 0.0 || self.deterministic.spacing < 0.0 {
            bail!("spacing values must be non-negative");
        }
        let labels = &self.labels;
        if labels.width <= 0.0 || labels.height <= 0.0 {
            bail!("label size must be positive");
        }
        if labels.crossing_weight < 0.0 || labels.label_overlap_weight < 0.0 {
            bail!("label penalty weights must be non-negative");
        }
        let unit = labels.crossing_weight.max(labels.label_overlap_weight);
        if labels.host_overlap_weight < unit * 10.0 {
            bail!(
                "labels.host_overlap_weight ({}) must be at least 10x the crossing/label weight ({})",
                labels.host_overlap_weight,
                unit
            );
        }
        if !(0.0..=100.0).contains(&self.lanes.skip_above_coherence) {
            bail!("lanes.skip_above_coherence must be within 0..=100");
        }
        Ok(())
    }
}

/// Load a JSON5 config file on top of the defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<LayoutConfig> {
    let Some(path) = path else {
        return Ok(LayoutConfig::default());
    };
    let contents = std::fs::read_to_string(path)?;
    let config: LayoutConfig = json5::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
