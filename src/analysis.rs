// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Cell-centred analysis of a multi-channel stack.
//!
//! Cells are detected on one channel. Their neighbourhoods optionally
//! normalize another channel, after which every other channel is searched
//! for signals separately inside each cell. The result yields three record
//! kinds: one row per signal ([SignalRecord]), one per ordered pair of
//! signals sharing a cell ([PairRecord]), and per-spot occupancy of
//! expanded spots against other channels ([StatRecord]). Boundary distances
//! of every spot against one channel come as [VarietyRecord]s.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use serde::Serialize;

use crate::config::{AnalysisConfig, ChannelConfig};
use crate::cube::VoxelCube;
use crate::detect::run_detection;
use crate::error::{Result, SpotError};
use crate::spot::DEFAULT_VARIETY_STEPS;
use crate::spots::{SpotCollection, SpotView};

/// `onion_distance` when the first spot's channel is not an onion channel.
pub const ONION_NOT_REQUESTED: f64 = -2.0;

/// `onion_distance` when no boundary was reached within the step cap.
pub const ONION_NOT_FOUND: f64 = -1.0;

const ONION_STEP: [usize; 3] = [0, 1, 1];

// Ellipsoid growth per step for VarietyRecord::ellipsoid_steps.
const ELLIPSOID_STEP: [f64; 3] = [0.3, 1.0, 1.0];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignalRecord {
    pub cell: usize,
    pub channel: String,
    pub spot: usize,
    /// (z, y, x)
    pub center_of_mass: [f64; 3],
    pub size: usize,
    /// nm^3; None without a physical scale.
    pub volume: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PairRecord {
    pub cell: usize,
    pub channel1: String,
    pub spot1: usize,
    pub channel2: String,
    pub spot2: usize,
    pub distance: f64,
    pub physical_distance: Option<f64>,
    /// Growth steps until spot1 meets a boundary of channel2's spots, scaled
    /// to nm along x when a scale is known. See [ONION_NOT_REQUESTED] and
    /// [ONION_NOT_FOUND].
    pub onion_distance: f64,
    /// Voxels shared by the two spots.
    pub overlap: usize,
    pub overlap_volume: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatRecord {
    pub channel: String,
    pub other: String,
    /// (y, x) expansion applied to `channel`'s spots.
    pub extension: usize,
    pub spot: usize,
    /// Unweighted (z, y, x) centre of the expanded spot.
    pub center: [f64; 3],
    pub size: usize,
    /// Voxels of the expanded spot covered by `other`'s spots.
    pub occupancy: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VarietyRecord {
    pub channel: String,
    pub other: String,
    pub spot: usize,
    /// Footprint growth steps of (0, 1, 1) until `other`'s boundary is met.
    pub extend_steps: Option<usize>,
    /// Ellipsoid steps of (0.3, 1, 1) radii around the centre of mass until
    /// `other`'s boundary is met. None for empty spots.
    pub ellipsoid_steps: Option<usize>,
}

/// Spots found by [analyze], keyed by channel name. The cell channel's
/// collection holds the cells.
#[derive(Clone, Debug)]
pub struct Analysis {
    cell_channel: String,
    cubes: Vec<Arc<VoxelCube>>,
    spots: BTreeMap<String, SpotCollection>,
}

fn detect_channel(cube: Arc<VoxelCube>, config: &ChannelConfig) -> Result<SpotCollection> {
    Ok(run_detection(cube, &config.detect)?.filter_by_size(config.min_size, config.max_size))
}

// Normalizes the neighbourhoods' cube: an optional stretch, then an optional
// shift applied to the stretched values.
fn normalize_neighborhoods(neighborhoods: SpotCollection, config: &AnalysisConfig)
                           -> Result<VoxelCube> {
    let mut neighborhoods = neighborhoods;
    let mut answer = neighborhoods.cube().clone();
    if let Some((low, high)) = config.neighborhood_stretch_quantiles {
        let stretched = Arc::new(neighborhoods.stretched_cube(low, high)?);
        answer = (*stretched).clone();
        neighborhoods = neighborhoods.with_cube(stretched)?;
    }
    if let Some(q) = config.shift_quantile() {
        answer = neighborhoods.normalized_cube(q, config.neighborhood_set_level)?;
    }
    Ok(answer)
}

/// Runs the cell-centred pipeline on `cubes`, indexed by channel number.
/// All cubes must have the same shape.
pub fn analyze(cubes: Vec<Arc<VoxelCube>>, config: &AnalysisConfig) -> Result<Analysis> {
    let analysis_start = Instant::now();
    config.validate(cubes.len())?;
    if let Some(first) = cubes.first() {
        for cube in &cubes[1..] {
            first.shape().check_same(&cube.shape())?;
        }
    }
    let mut cubes = cubes;

    let cell_config = config.cell_config()?;
    let cells = detect_channel(cubes[cell_config.channel].clone(), cell_config)?;
    info!("Found {} cells in channel '{}'", cells.len(), config.cell_channel);

    if config.neighborhood_size > 0 {
        let size = config.neighborhood_size;
        let radii = [(size / 3) as f64, size as f64, size as f64];
        let neighborhoods = cells.ellipsoids(radii)?
            .with_cube(cubes[config.normalize_channel].clone())?;
        let normalized = normalize_neighborhoods(neighborhoods, config)?;
        cubes[config.normalize_channel] = Arc::new(normalized);
        debug!("Channel {} replaced by its normalized neighbourhoods",
               config.normalize_channel);
    }

    let mut spots = BTreeMap::new();
    for (name, channel_config) in &config.channels {
        if *name == config.cell_channel {
            continue;
        }
        let cube = cubes[channel_config.channel].clone();
        let mut found = SpotCollection::empty(cube.clone());
        for cell in cells.spots() {
            let restricted = Arc::new(cube.restricted_to(cell)?);
            let in_cell = detect_channel(restricted, channel_config)?;
            found.extend(in_cell.with_cube(cube.clone())?)?;
        }
        info!("Found {} '{}' signals", found.len(), name);
        spots.insert(name.clone(), found);
    }
    spots.insert(config.cell_channel.clone(), cells);

    info!("Analysis done in {:?}", analysis_start.elapsed());
    Ok(Analysis{cell_channel: config.cell_channel.clone(), cubes, spots})
}

impl Analysis {
    pub fn cell_channel(&self) -> &str {
        &self.cell_channel
    }

    pub fn cells(&self) -> &SpotCollection {
        // `analyze` always inserts the cell collection.
        &self.spots[&self.cell_channel]
    }

    /// Channel cubes after normalization.
    pub fn cubes(&self) -> &[Arc<VoxelCube>] {
        &self.cubes
    }

    pub fn spots(&self, channel: &str) -> Option<&SpotCollection> {
        self.spots.get(channel)
    }

    /// All collections by channel name, cells included.
    pub fn collections(&self) -> &BTreeMap<String, SpotCollection> {
        &self.spots
    }

    fn signal_channels(&self) -> impl Iterator<Item = (&String, &SpotCollection)> {
        self.spots.iter().filter(move |(name, _)| **name != self.cell_channel)
    }

    // Signals overlapping `cell`, in channel then id order.
    fn cell_signals(&self, cell: usize) -> Result<Vec<(&str, SpotView<'_>)>> {
        let cell = self.cells().view(cell);
        let mut signals = Vec::new();
        for (name, collection) in self.signal_channels() {
            for id in cell.intersection_ids(collection)? {
                signals.push((name.as_str(), collection.view(id)));
            }
        }
        Ok(signals)
    }

    fn signal_record(cell: usize, channel: &str, view: &SpotView) -> Result<SignalRecord> {
        Ok(SignalRecord{
            cell,
            channel: channel.to_string(),
            spot: view.id(),
            center_of_mass: view.center_of_mass()?,
            size: view.size(),
            volume: view.physical_volume().ok(),
        })
    }

    /// The cell itself, then every signal overlapping it.
    pub fn signal_records(&self) -> Result<Vec<SignalRecord>> {
        let mut records = Vec::new();
        for cell in self.cells().views() {
            records.push(Analysis::signal_record(cell.id(), &self.cell_channel, &cell)?);
            for (channel, view) in self.cell_signals(cell.id())? {
                records.push(Analysis::signal_record(cell.id(), channel, &view)?);
            }
        }
        Ok(records)
    }

    /// Boundary distance from `view` into `other_channel`'s spots; see
    /// [PairRecord::onion_distance]. Fails if `other_channel` has no
    /// collection.
    pub fn onion_distance(&self, view: &SpotView, channel: &str, other_channel: &str,
                          onion_channels: &[String]) -> Result<f64> {
        if !onion_channels.iter().any(|c| c == channel) {
            return Ok(ONION_NOT_REQUESTED);
        }
        let others = self.spots.get(other_channel).ok_or_else(|| SpotError::InvalidConfig(
            format!("no spots for channel '{}'", other_channel)))?;
        match view.distance_to_variety(others, DEFAULT_VARIETY_STEPS, ONION_STEP)? {
            None => Ok(ONION_NOT_FOUND),
            Some(steps) => {
                // x and y resolution are taken to be equal.
                let scale = view.cube().scale().map_or(1.0, |s| s.x);
                Ok(steps as f64 * scale)
            },
        }
    }

    /// Every ordered pair of distinct signals within the same cell.
    pub fn pair_records(&self, onion_channels: &[String]) -> Result<Vec<PairRecord>> {
        let start = Instant::now();
        let mut records = Vec::new();
        for cell in self.cells().ids() {
            let signals = self.cell_signals(cell)?;
            for (channel1, view1) in &signals {
                for (channel2, view2) in &signals {
                    if channel1 == channel2 && view1.id() == view2.id() {
                        continue;
                    }
                    let overlap = view1.spot().shared_voxels(view2.spot());
                    records.push(PairRecord{
                        cell,
                        channel1: channel1.to_string(),
                        spot1: view1.id(),
                        channel2: channel2.to_string(),
                        spot2: view2.id(),
                        distance: view1.distance(view2)?,
                        physical_distance: match view1.physical_distance(view2) {
                            Ok(d) => Some(d),
                            Err(SpotError::MissingScale) => None,
                            Err(e) => return Err(e),
                        },
                        onion_distance: self.onion_distance(view1, channel1, channel2,
                                                            onion_channels)?,
                        overlap,
                        overlap_volume: view1.cube().physical_volume(overlap).ok(),
                    });
                }
            }
        }
        info!("Measured {} signal pairs in {:?}", records.len(), start.elapsed());
        Ok(records)
    }

    /// Occupancy of each channel's spots, expanded by each of `spot_sizes`
    /// in (y, x), against every other channel's spots.
    pub fn stat_records(&self, spot_sizes: &[usize]) -> Result<Vec<StatRecord>> {
        let mut records = Vec::new();
        for (channel, collection) in &self.spots {
            for &extension in spot_sizes {
                let expanded = collection.expanded([0, extension, extension]);
                let centers = expanded.centers()?;
                for (other, other_collection) in &self.spots {
                    if other == channel {
                        continue;
                    }
                    for (id, spot) in expanded.spots().iter().enumerate() {
                        records.push(StatRecord{
                            channel: channel.clone(),
                            other: other.clone(),
                            extension,
                            spot: id,
                            center: centers[id],
                            size: spot.size(),
                            occupancy: spot.intersection_occupancy(other_collection)?,
                        });
                    }
                }
            }
        }
        Ok(records)
    }

    /// Boundary distances of every other channel's spots against
    /// `other_channel`'s spots.
    pub fn variety_records(&self, other_channel: &str) -> Result<Vec<VarietyRecord>> {
        let others = self.spots.get(other_channel).ok_or_else(|| SpotError::InvalidConfig(
            format!("no spots for channel '{}'", other_channel)))?;
        let mut records = Vec::new();
        for (channel, collection) in &self.spots {
            if channel == other_channel {
                continue;
            }
            for view in collection.views() {
                let ellipsoid_steps = match view.center_to_variety(
                    others, DEFAULT_VARIETY_STEPS, ELLIPSOID_STEP) {
                    Ok(steps) => steps,
                    Err(SpotError::EmptySpot) => None,
                    Err(e) => return Err(e),
                };
                records.push(VarietyRecord{
                    channel: channel.clone(),
                    other: other_channel.to_string(),
                    spot: view.id(),
                    extend_steps: view.distance_to_variety(
                        others, DEFAULT_VARIETY_STEPS, ONION_STEP)?,
                    ellipsoid_steps,
                });
            }
        }
        Ok(records)
    }
}

// mod tests.
