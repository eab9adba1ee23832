// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Parametric shapes and the greedy shape-fitting detector.
//!
//! The detector repeatedly:
//!
//! 1. finds the brightest voxel of a private working copy of the cube;
//! 2. places a shape (ellipsoid or z-extruded cylinder) on it;
//! 3. moves the shape's centre (its "navel") to the intensity centroid of
//!    the voxels it covers, until the navel stops moving or the iteration cap
//!    is hit;
//! 4. records the shape as a spot;
//! 5. "wipes" (zeroes) the working copy under a possibly larger version of
//!    the shape so the next round finds a different maximum.
//!
//! Exactly `n` spots are produced, even when the working copy runs dark.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::coords::{Coord, Shape};
use crate::cube::VoxelCube;
use crate::error::{Result, SpotError};
use crate::spot::Spot;
use crate::spots::SpotCollection;

/// Radii below this many voxels are raised to it when fitting shapes.
pub const MIN_RADIUS: f64 = 1.5;

/// Default cap on navel refinement rounds.
pub const DEFAULT_REFINE_ITERATIONS: usize = 5;

// Slack on the implicit-equation test so that voxels lying exactly on the
// surface are not lost to float rounding of the centre.
const SURFACE_TOLERANCE: f64 = 1e-9;

/// Per-axis radii, (z, y, x), in voxels.
pub type Radii = [f64; 3];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeKind {
    /// Axis-aligned ellipsoid with independent z, y, x radii.
    Ellipsoid,
    /// An ellipse in (y, x) extruded through the full z extent. The z radius
    /// is ignored.
    Cylinder,
}

fn check_radii(radii: Radii) -> Result<()> {
    for r in radii {
        if !r.is_finite() || r < 0.0 {
            return Err(SpotError::InvalidRadius(r));
        }
    }
    Ok(())
}

// Per-axis integer range covered by `center +- radius`, clipped to `extent`.
fn axis_range(center: f64, radius: f64, extent: usize) -> std::ops::Range<usize> {
    let lo = (center - radius).floor().max(0.0);
    let hi = ((center + radius).ceil() + 1.0).min(extent as f64);
    if hi <= lo {
        return 0..0;
    }
    lo as usize..hi as usize
}

// Squared normalized offset along one axis. A zero radius admits only a zero
// offset.
fn normalized_sq(offset: f64, radius: f64) -> f64 {
    if radius == 0.0 {
        if offset.abs() <= SURFACE_TOLERANCE { 0.0 } else { f64::INFINITY }
    } else {
        (offset / radius) * (offset / radius)
    }
}

/// Voxels satisfying `sum((p - center) / radii)^2 <= 1`, clipped to `shape`,
/// in raster order. Radii are used as given (no minimum).
pub fn rasterize_ellipsoid(center: [f64; 3], radii: Radii, shape: Shape)
                           -> Result<Vec<Coord>> {
    check_radii(radii)?;
    let mut coords = Vec::new();
    for z in axis_range(center[0], radii[0], shape.z) {
        let nz = normalized_sq(z as f64 - center[0], radii[0]);
        if nz > 1.0 + SURFACE_TOLERANCE {
            continue;
        }
        for y in axis_range(center[1], radii[1], shape.y) {
            let ny = normalized_sq(y as f64 - center[1], radii[1]);
            if nz + ny > 1.0 + SURFACE_TOLERANCE {
                continue;
            }
            for x in axis_range(center[2], radii[2], shape.x) {
                let nx = normalized_sq(x as f64 - center[2], radii[2]);
                if nz + ny + nx <= 1.0 + SURFACE_TOLERANCE {
                    coords.push([z, y, x]);
                }
            }
        }
    }
    Ok(coords)
}

/// The (y, x) ellipse around `center` repeated on every z slice of `shape`.
pub fn rasterize_cylinder(center: [f64; 3], radii: Radii, shape: Shape)
                          -> Result<Vec<Coord>> {
    let slice = rasterize_ellipsoid([0.0, center[1], center[2]],
                                    [0.0, radii[1], radii[2]],
                                    Shape::new(1, shape.y, shape.x))?;
    let mut coords = Vec::with_capacity(slice.len() * shape.z);
    for z in 0..shape.z {
        coords.extend(slice.iter().map(|p| [z, p[1], p[2]]));
    }
    Ok(coords)
}

impl ShapeKind {
    pub fn rasterize(&self, center: [f64; 3], radii: Radii, shape: Shape)
                     -> Result<Vec<Coord>> {
        match self {
            ShapeKind::Ellipsoid => rasterize_ellipsoid(center, radii, shape),
            ShapeKind::Cylinder => rasterize_cylinder(center, radii, shape),
        }
    }

    /// Raises each radius to [MIN_RADIUS]. The cylinder's z radius is fixed
    /// at 0.
    pub fn floored(&self, radii: Radii) -> Result<Radii> {
        check_radii(radii)?;
        let floored = radii.map(|r| r.max(MIN_RADIUS));
        Ok(match self {
            ShapeKind::Ellipsoid => floored,
            ShapeKind::Cylinder => [0.0, floored[1], floored[2]],
        })
    }
}

/// A spot shaped as `kind` with `radii` (floored to [MIN_RADIUS]) centred at
/// `center`.
pub fn shape_spot(kind: ShapeKind, center: [f64; 3], radii: Radii, shape: Shape)
                  -> Result<Spot> {
    let radii = kind.floored(radii)?;
    Ok(Spot::from_coords(kind.rasterize(center, radii, shape)?))
}

/// Greedy peak fitting of ellipsoids or cylinders.
#[derive(Clone, Debug)]
pub struct ShapeFitDetector {
    pub kind: ShapeKind,
    pub n: usize,
    pub radii: Radii,
    pub wipe_radii: Radii,
    pub max_iterations: usize,
}

impl ShapeFitDetector {
    /// `wipe_radii` defaults to `radii` when None.
    pub fn new(kind: ShapeKind, n: usize, radii: Radii, wipe_radii: Option<Radii>)
               -> ShapeFitDetector {
        ShapeFitDetector{kind, n, radii,
                         wipe_radii: wipe_radii.unwrap_or(radii),
                         max_iterations: DEFAULT_REFINE_ITERATIONS}
    }

    // Moves the navel to the intensity centroid under the shape until it
    // settles or the iteration cap is reached. Returns the final navel and
    // footprint.
    fn refine(&self, working: &VoxelCube, start: Coord, radii: Radii)
              -> Result<(Coord, Vec<Coord>)> {
        let shape = working.shape();
        let mut navel = start;
        let mut coords = self.kind.rasterize(to_f64(navel), radii, shape)?;
        for iteration in 0..self.max_iterations {
            let footprint = Spot::from_coords(coords.iter().copied());
            let centroid = match footprint.center_of_mass(working) {
                Ok(c) => c,
                Err(_) => break,  // Shape fell outside the cube.
            };
            let moved = round_to_voxel(centroid, shape);
            if moved == navel {
                debug!("Navel settled at {:?} after {} iterations",
                       navel, iteration);
                break;
            }
            navel = moved;
            coords = self.kind.rasterize(to_f64(navel), radii, shape)?;
        }
        Ok((navel, coords))
    }

    /// Runs the detector on a private copy of `cube`; the caller's cube is not
    /// modified. Always returns `n` spots.
    pub fn detect(&self, cube: Arc<VoxelCube>) -> Result<SpotCollection> {
        let fit_start = Instant::now();
        let radii = self.kind.floored(self.radii)?;
        let wipe_radii = self.kind.floored(self.wipe_radii)?;
        let mut working = (*cube).clone();
        let mut spots = Vec::<Spot>::with_capacity(self.n);
        for _ in 0..self.n {
            let (peak, peak_value) = match working.argmax() {
                Some(found) => found,
                None => ([0, 0, 0], 0),  // Zero-sized cube.
            };
            let (navel, coords) = self.refine(&working, peak, radii)?;
            debug!("{:?} peak {} at {:?} refined to {:?}",
                   self.kind, peak_value, peak, navel);
            spots.push(Spot::from_coords(coords));
            for p in self.kind.rasterize(to_f64(navel), wipe_radii, working.shape())? {
                working.set(p, 0);
            }
        }
        info!("{:?} fitting placed {} shapes in {:?}",
              self.kind, spots.len(), fit_start.elapsed());
        Ok(SpotCollection::new(cube, spots))
    }
}

fn to_f64(p: Coord) -> [f64; 3] {
    [p[0] as f64, p[1] as f64, p[2] as f64]
}

fn round_to_voxel(c: [f64; 3], shape: Shape) -> Coord {
    let limit = [shape.z, shape.y, shape.x];
    let mut p = [0_usize; 3];
    for axis in 0..3 {
        let max = limit[axis].saturating_sub(1) as f64;
        p[axis] = c[axis].round().clamp(0.0, max) as usize;
    }
    p
}

// mod tests.
