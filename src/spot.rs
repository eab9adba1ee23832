// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::{BTreeMap, HashSet};

use log::debug;

use crate::coords::{BoxRadius, Coord, Shape, box_neighbors, clip_to_bounds};
use crate::cube::VoxelCube;
use crate::error::{Result, SpotError};
use crate::histogram_funcs::Histogram;
use crate::shapes::rasterize_ellipsoid;
use crate::spots::SpotCollection;

/// Display colour, (r, g, b).
pub type Color = [u8; 3];

/// Growth cap used by the boundary-distance measurements.
pub const DEFAULT_VARIETY_STEPS: usize = 20;

// Added to every intensity weight so that an all-dark footprint still has a
// centre of mass (its unweighted centre).
const WEIGHT_EPSILON: f64 = 1e-6;

/// One detected region: a set of distinct voxel coordinates plus a display
/// colour. Coordinates are kept sorted in (z, y, x) order, so "first" and
/// "last" voxels are reproducible.
///
/// A Spot does not own a cube. Measurements that need intensities take the
/// cube explicitly, which lets a spot detected in one channel be measured
/// against another; [crate::spots::SpotView] supplies the owning
/// collection's cube for the common case.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Spot {
    coords: Vec<Coord>,
    color: Option<Color>,
}

impl Spot {
    /// Builds a spot from coordinates in any order; duplicates are dropped.
    pub fn from_coords<I: IntoIterator<Item = Coord>>(coords: I) -> Spot {
        let mut coords: Vec<Coord> = coords.into_iter().collect();
        coords.sort_unstable();
        coords.dedup();
        Spot{coords, color: None}
    }

    pub fn coords(&self) -> &[Coord] {
        &self.coords
    }

    pub fn size(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn contains(&self, p: &Coord) -> bool {
        self.coords.binary_search(p).is_ok()
    }

    pub fn color(&self) -> Option<Color> {
        self.color
    }

    pub fn set_color(&mut self, color: Option<Color>) {
        self.color = color;
    }

    /// Smallest shape holding every voxel of the footprint.
    pub fn extent(&self) -> Shape {
        let mut extent = Shape::new(0, 0, 0);
        for p in &self.coords {
            extent.z = extent.z.max(p[0] + 1);
            extent.y = extent.y.max(p[1] + 1);
            extent.x = extent.x.max(p[2] + 1);
        }
        extent
    }

    /// Fails with [SpotError::ShapeMismatch] if any voxel lies outside
    /// `shape`.
    pub fn check_fits(&self, shape: Shape) -> Result<()> {
        let extent = self.extent();
        if extent.z > shape.z || extent.y > shape.y || extent.x > shape.x {
            return Err(SpotError::ShapeMismatch{expected: shape, actual: extent});
        }
        Ok(())
    }

    /// Intensities under the footprint, in coordinate order.
    pub fn values<'a>(&'a self, cube: &'a VoxelCube)
                      -> Result<impl Iterator<Item = u8> + 'a> {
        self.check_fits(cube.shape())?;
        Ok(self.coords.iter().map(move |&p| cube.value(p)))
    }

    pub fn histogram(&self, cube: &VoxelCube) -> Result<Histogram> {
        Ok(Histogram::from_values(self.values(cube)?))
    }

    /// Sum of intensities under the footprint.
    pub fn mass(&self, cube: &VoxelCube) -> Result<u64> {
        Ok(self.values(cube)?.map(|v| v as u64).sum())
    }

    /// Unweighted mean position, (z, y, x).
    pub fn center(&self) -> Result<[f64; 3]> {
        if self.is_empty() {
            return Err(SpotError::EmptySpot);
        }
        let mut sum = [0.0_f64; 3];
        for p in &self.coords {
            for axis in 0..3 {
                sum[axis] += p[axis] as f64;
            }
        }
        let n = self.coords.len() as f64;
        Ok([sum[0] / n, sum[1] / n, sum[2] / n])
    }

    /// Intensity-weighted mean position, (z, y, x).
    pub fn center_of_mass(&self, cube: &VoxelCube) -> Result<[f64; 3]> {
        if self.is_empty() {
            return Err(SpotError::EmptySpot);
        }
        self.check_fits(cube.shape())?;
        let mut m0 = 0.0_f64;
        let mut m1 = [0.0_f64; 3];
        for &p in &self.coords {
            let weight = cube.value(p) as f64 + WEIGHT_EPSILON;
            m0 += weight;
            for axis in 0..3 {
                m1[axis] += p[axis] as f64 * weight;
            }
        }
        Ok([m1[0] / m0, m1[1] / m0, m1[2] / m0])
    }

    /// Nearest-rank quantile of the intensities under the footprint; see
    /// [Histogram::quantile].
    pub fn quantile(&self, q: f64, cube: &VoxelCube) -> Result<u8> {
        self.histogram(cube)?.quantile(q)
    }

    /// Number of voxels under the footprint strictly brighter than `level`.
    pub fn occupancy(&self, level: i32, cube: &VoxelCube) -> Result<usize> {
        Ok(self.values(cube)?.filter(|&v| v as i32 > level).count())
    }

    /// Number of z slices holding at least `min_presence` voxels.
    pub fn height(&self, min_presence: usize) -> usize {
        let mut per_slice = BTreeMap::<usize, usize>::new();
        for p in &self.coords {
            *per_slice.entry(p[0]).or_insert(0) += 1;
        }
        per_slice.values().filter(|&&count| count >= min_presence).count()
    }

    /// The footprint grown by `radius` along each axis, clipped to `shape`.
    /// The colour is kept.
    pub fn expanded(&self, radius: BoxRadius, shape: Shape) -> Spot {
        if radius == [0, 0, 0] {
            return self.clone();
        }
        let mut grown = HashSet::<Coord>::with_capacity(self.coords.len() * 2);
        for &p in &self.coords {
            grown.extend(clip_to_bounds(box_neighbors(p, radius), shape));
        }
        let mut spot = Spot::from_coords(grown);
        spot.color = self.color;
        spot
    }

    /// The footprint minus every voxel of `other`. The colour is kept.
    pub fn subtracted(&self, other: &Spot) -> Spot {
        let coords = self.coords.iter()
            .filter(|p| !other.contains(p))
            .copied()
            .collect();
        Spot{coords, color: self.color}
    }

    /// Voxels of this footprint that `other` also covers.
    pub fn shared_voxels(&self, other: &Spot) -> usize {
        self.coords.iter().filter(|p| other.contains(p)).count()
    }

    /// Ids of the `collection` spots covering any voxel of this footprint,
    /// ascending.
    pub fn intersection_ids(&self, collection: &SpotCollection) -> Result<Vec<usize>> {
        self.check_fits(collection.cube().shape())?;
        let id_cube = collection.id_cube();
        let sentinel = collection.no_spot_id();
        let mut ids: Vec<usize> = self.coords.iter()
            .map(|&p| id_cube[p])
            .filter(|&id| id != sentinel)
            .map(|id| id as usize)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Number of voxels of this footprint covered by some `collection` spot.
    pub fn intersection_occupancy(&self, collection: &SpotCollection) -> Result<usize> {
        self.check_fits(collection.cube().shape())?;
        let id_cube = collection.id_cube();
        let sentinel = collection.no_spot_id();
        Ok(self.coords.iter().filter(|&&p| id_cube[p] != sentinel).count())
    }

    // True if the footprint covers more than one distinct value of the id
    // cube, the "no spot" id included. `coords` must lie within the
    // collection's cube.
    fn sees_variety(coords: &[Coord], collection: &SpotCollection) -> bool {
        let id_cube = collection.id_cube();
        let mut first = None;
        for &p in coords {
            let id = id_cube[p];
            match first {
                None => first = Some(id),
                Some(f) if f != id => return true,
                Some(_) => (),
            }
        }
        false
    }

    /// Grows the footprint one `step` ring at a time until it covers more
    /// than one distinct id of `collection` (the "no spot" id counts as an
    /// id). Returns the number of growth steps taken, 0 if the footprint
    /// already straddles a boundary, or None once `max_steps` growths found
    /// none.
    pub fn distance_to_variety(&self, collection: &SpotCollection,
                               max_steps: usize, step: BoxRadius)
                               -> Result<Option<usize>> {
        let shape = collection.cube().shape();
        self.check_fits(shape)?;
        let mut current = self.clone();
        if Spot::sees_variety(&current.coords, collection) {
            return Ok(Some(0));
        }
        for steps in 1..=max_steps {
            current = current.expanded(step, shape);
            if Spot::sees_variety(&current.coords, collection) {
                debug!("Variety reached after {} steps", steps);
                return Ok(Some(steps));
            }
        }
        Ok(None)
    }

    /// Like [Spot::distance_to_variety], but grows an ellipsoid of radii
    /// `k * step` around the centre of mass (measured in `cube`) instead of
    /// the footprint itself. Returns the first such k, or None after
    /// `max_steps`.
    pub fn center_to_variety(&self, cube: &VoxelCube, collection: &SpotCollection,
                             max_steps: usize, step: [f64; 3]) -> Result<Option<usize>> {
        let shape = collection.cube().shape();
        cube.shape().check_same(&shape)?;
        let center = self.center_of_mass(cube)?;
        for k in 1..=max_steps {
            let radii = [step[0] * k as f64, step[1] * k as f64, step[2] * k as f64];
            let coords = rasterize_ellipsoid(center, radii, shape)?;
            if Spot::sees_variety(&coords, collection) {
                return Ok(Some(k));
            }
        }
        Ok(None)
    }
}

/// Euclidean distance between two (z, y, x) points, optionally scaled per
/// axis.
pub fn euclidean(a: [f64; 3], b: [f64; 3], scale: [f64; 3]) -> f64 {
    (0..3).map(|axis| {
        let d = (a[axis] - b[axis]) * scale[axis];
        d * d
    }).sum::<f64>().sqrt()
}

// mod tests.
