// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! SpotDetect finds and measures spots of fluorescent signal in 3-D
//! microscopy stacks. Given one 8-bit cube per colour channel, SpotDetect
//! returns collections of spots (sets of voxels) together with their sizes,
//! centres, pairwise distances and overlaps.
//!
//! Features:
//!
//! * Connected-component detection over face-adjacent voxels above a level,
//!   optionally dropping loose voxels first ("tightness").
//! * Levels picked directly, as a percentile of the cube, or as the value of
//!   the n-th brightest voxel.
//! * Greedy fitting of ellipsoids or full-height cylinders to the brightest
//!   remaining peaks, with centroid refinement of each fit.
//! * A small algebra over spots: expansion, subtraction, and intersection
//!   against other collections.
//! * Per-spot intensity normalization into fresh cubes.
//! * A cell-centred analysis pipeline producing per-signal, per-pair and
//!   occupancy records.
//!
//! # Coordinates
//!
//! Voxels are addressed `[z, y, x]`. Spots never hold coordinates outside
//! their cube: anything a shape or an expansion would put outside is
//! dropped, never wrapped.
//!
//! # Spot ids
//!
//! A [spots::SpotCollection] owns its spots in a `Vec`; a spot's id is its
//! index. Filters renumber the survivors densely, while expansion and
//! reshaping keep spot `i` of the result matched to spot `i` of the input.
//!
//! # Caveats
//!
//! Ties between equally bright voxels in shape fitting go to the first voxel
//! in raster order. Inputs with several equal maxima therefore depend on
//! that order.
//!
//! Quantiles are nearest-rank (index `floor(q * count)` of the sorted
//! values), not interpolated.

pub mod analysis;
pub mod colors;
pub mod config;
pub mod coords;
pub mod cube;
pub mod detect;
pub mod error;
pub mod histogram_funcs;
pub mod normalize;
pub mod shapes;
pub mod spot;
pub mod spots;

pub use crate::analysis::{Analysis, PairRecord, SignalRecord, StatRecord, VarietyRecord,
                          analyze};
pub use crate::config::{AnalysisConfig, ChannelConfig};
pub use crate::coords::{Coord, Shape};
pub use crate::cube::{PhysicalScale, VoxelCube};
pub use crate::detect::{ConnectedComponentDetector, Detect, run_detection};
pub use crate::error::{Result, SpotError};
pub use crate::shapes::{ShapeFitDetector, ShapeKind};
pub use crate::spot::{Color, Spot};
pub use crate::spots::{SpotCollection, SpotView};
