// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::detect::{Detect, deserialize_detect_list};
use crate::error::{Result, SpotError};
use crate::spot::Color;

/// How one named colour channel is detected.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Index of the channel cube.
    pub channel: usize,

    /// Detection steps, written like `"cc(120)"` or `"tight(120, 15);
    /// spheres(2, 3)"`.
    #[serde(deserialize_with = "deserialize_detect_list")]
    pub detect: Vec<Detect>,

    /// Inclusive size range applied after detection.
    pub min_size: usize,
    pub max_size: usize,
}

impl ChannelConfig {
    pub fn new(channel: usize) -> ChannelConfig {
        ChannelConfig{channel, ..Default::default()}
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig{
            channel: 0,
            detect: vec![Detect::ConnectedComponents{level: 120}],
            min_size: 15,
            max_size: 500,
        }
    }
}

/// Settings for [crate::analysis::analyze].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Name of the channel whose spots are cells.
    pub cell_channel: String,

    /// Per-channel detection settings, keyed by channel name.
    pub channels: BTreeMap<String, ChannelConfig>,

    /// Channel cube replaced by its neighbourhood-normalized version.
    pub normalize_channel: usize,

    /// Neighbourhood radius in (y, x); z gets a third of it. Zero turns
    /// normalization off.
    pub neighborhood_size: usize,

    pub neighborhood_stretch_quantiles: Option<(f64, f64)>,
    pub neighborhood_shift_quantile: Option<f64>,
    pub neighborhood_set_level: i32,

    /// (y, x) expansions for which per-spot occupancy stats are produced.
    pub spot_sizes: Vec<usize>,

    /// Channels whose pairs get an onion distance.
    pub onion_channels: Vec<String>,

    /// Colour of spot outlines in drawn overlays.
    pub border_color: Color,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let mut channels = BTreeMap::new();
        for (index, name) in ["red", "green", "blue"].into_iter().enumerate() {
            channels.insert(name.to_string(), ChannelConfig::new(index));
        }
        AnalysisConfig{
            cell_channel: "blue".to_string(),
            channels,
            normalize_channel: 0,
            neighborhood_size: 25,
            neighborhood_stretch_quantiles: None,
            neighborhood_shift_quantile: None,
            neighborhood_set_level: 100,
            spot_sizes: vec![0, 1, 3],
            onion_channels: vec!["red".to_string()],
            border_color: [255, 160, 80],
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_str(text: &str) -> Result<AnalysisConfig> {
        let config: AnalysisConfig = serde_json::from_str(text)?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<AnalysisConfig> {
        let text = fs::read_to_string(path.as_ref())?;
        let config = AnalysisConfig::from_json_str(&text)?;
        info!("Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }

    /// The shift quantile to normalize with. Falls back to 0.5 when neither
    /// a shift nor a stretch is configured.
    pub fn shift_quantile(&self) -> Option<f64> {
        match (self.neighborhood_shift_quantile, self.neighborhood_stretch_quantiles) {
            (Some(q), _) if q > 0.0 => Some(q),
            (Some(_), _) => None,
            (None, None) => Some(0.5),
            (None, Some(_)) => None,
        }
    }

    pub fn cell_config(&self) -> Result<&ChannelConfig> {
        self.channels.get(&self.cell_channel).ok_or_else(|| SpotError::InvalidConfig(
            format!("cell channel '{}' has no channel settings", self.cell_channel)))
    }

    /// Checks that names and channel indices refer to something among
    /// `channel_count` input cubes.
    pub fn validate(&self, channel_count: usize) -> Result<()> {
        self.cell_config()?;
        let check_index = |what: &str, index: usize| {
            if index >= channel_count {
                return Err(SpotError::InvalidConfig(
                    format!("{} refers to channel {} of {}", what, index, channel_count)));
            }
            Ok(())
        };
        check_index("normalize_channel", self.normalize_channel)?;
        for (name, channel) in &self.channels {
            check_index(name.as_str(), channel.channel)?;
            if channel.min_size > channel.max_size {
                return Err(SpotError::InvalidConfig(
                    format!("{}: min_size {} exceeds max_size {}",
                            name, channel.min_size, channel.max_size)));
            }
        }
        for name in &self.onion_channels {
            if !self.channels.contains_key(name) {
                return Err(SpotError::InvalidConfig(
                    format!("onion channel '{}' is not configured", name)));
            }
        }
        Ok(())
    }
}

// mod tests.
