// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use ndarray::{Array2, Array3, Axis, Zip};
use serde::Serialize;

use crate::coords::{Coord, Shape};
use crate::error::Result;
use crate::histogram_funcs::Histogram;
use crate::spot::Spot;

/// Physical voxel size in nm along (z, y, x).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PhysicalScale {
    pub z: f64,
    pub y: f64,
    pub x: f64,
}

impl PhysicalScale {
    pub fn new(z: f64, y: f64, x: f64) -> PhysicalScale {
        PhysicalScale{z, y, x}
    }

    pub fn voxel_volume(&self) -> f64 {
        self.z * self.y * self.x
    }
}

/// One colour channel of a 3-D image stack, axes (z, y, x).
#[derive(Clone, Debug)]
pub struct VoxelCube {
    data: Array3<u8>,
    scale: Option<PhysicalScale>,
}

impl VoxelCube {
    pub fn new(data: Array3<u8>) -> VoxelCube {
        VoxelCube{data, scale: None}
    }

    pub fn zeros(shape: Shape) -> VoxelCube {
        VoxelCube::new(Array3::zeros(shape.dims()))
    }

    pub fn with_scale(mut self, scale: PhysicalScale) -> VoxelCube {
        self.scale = Some(scale);
        self
    }

    pub fn scale(&self) -> Option<PhysicalScale> {
        self.scale
    }

    pub fn shape(&self) -> Shape {
        self.data.dim().into()
    }

    pub fn data(&self) -> &Array3<u8> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<u8> {
        &mut self.data
    }

    pub fn into_data(self) -> Array3<u8> {
        self.data
    }

    /// Bounds-checked read.
    pub fn get(&self, p: Coord) -> Option<u8> {
        self.data.get(p).copied()
    }

    /// Read of a coordinate already known to be in bounds.
    pub fn value(&self, p: Coord) -> u8 {
        self.data[p]
    }

    pub fn set(&mut self, p: Coord, value: u8) {
        self.data[p] = value;
    }

    /// Coordinates of all voxels strictly brighter than `level`, in raster
    /// order.
    pub fn foreground(&self, level: i32) -> Vec<Coord> {
        self.data.indexed_iter()
            .filter(|(_, &v)| v as i32 > level)
            .map(|((z, y, x), _)| [z, y, x])
            .collect()
    }

    /// Location and value of the brightest voxel. Ties go to the first voxel
    /// in (z, y, x) raster order. None for an empty cube.
    pub fn argmax(&self) -> Option<(Coord, u8)> {
        let mut best: Option<(Coord, u8)> = None;
        for ((z, y, x), &v) in self.data.indexed_iter() {
            match best {
                Some((_, b)) if v <= b => (),
                _ => best = Some(([z, y, x], v)),
            }
        }
        best
    }

    pub fn histogram(&self) -> Histogram {
        Histogram::from_values(self.data.iter().copied())
    }

    /// A same-shaped cube holding this cube's values under `spot` and zero
    /// everywhere else. Fails if `spot` reaches outside this cube.
    pub fn restricted_to(&self, spot: &Spot) -> Result<VoxelCube> {
        spot.check_fits(self.shape())?;
        let mut restricted = VoxelCube{data: Array3::zeros(self.data.dim()),
                                       scale: self.scale};
        for &p in spot.coords() {
            restricted.data[p] = self.data[p];
        }
        Ok(restricted)
    }

    /// Maximum projection along z; result is indexed (y, x).
    pub fn max_projection(&self) -> Array2<u8> {
        self.data.fold_axis(Axis(0), 0_u8, |&acc, &v| acc.max(v))
    }

    /// Element-wise maximum with `other`, which must have the same shape.
    pub fn merge_max(&mut self, other: &VoxelCube) -> Result<()> {
        self.shape().check_same(&other.shape())?;
        Zip::from(&mut self.data).and(&other.data)
            .for_each(|a, &b| *a = (*a).max(b));
        Ok(())
    }

    /// Volume in nm^3 of `voxel_count` voxels. Fails without a scale.
    pub fn physical_volume(&self, voxel_count: usize) -> Result<f64> {
        match self.scale {
            Some(scale) => Ok(voxel_count as f64 * scale.voxel_volume()),
            None => Err(crate::error::SpotError::MissingScale),
        }
    }
}

impl From<Array3<u8>> for VoxelCube {
    fn from(data: Array3<u8>) -> VoxelCube {
        VoxelCube::new(data)
    }
}

// mod tests.
