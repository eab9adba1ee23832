// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Per-spot intensity normalization. Both transforms read the collection's
//! cube and write a fresh cube of the same shape and scale, in which voxels
//! outside every footprint are zero. Where footprints overlap, the spot with
//! the higher id is written last and wins.

use std::time::Instant;

use log::{debug, info};

use crate::cube::VoxelCube;
use crate::error::Result;
use crate::histogram_funcs::check_quantile;
use crate::spots::SpotCollection;

fn clip_to_u8(v: f64) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

impl SpotCollection {
    /// Shifts each spot's intensities so that its `quantile` lands on
    /// `level`, then halves whatever still falls below `level`.
    ///
    /// Arithmetic is done in i32 and the halved values are truncated toward
    /// zero before clipping to 0..=255. Empty spots are skipped.
    pub fn normalized_cube(&self, quantile: f64, level: i32) -> Result<VoxelCube> {
        check_quantile(quantile)?;
        let start = Instant::now();
        let cube = self.cube();
        let mut result = cube.clone();
        result.data_mut().fill(0);
        for (id, spot) in self.spots().iter().enumerate() {
            if spot.is_empty() {
                debug!("Spot {} is empty; not normalized", id);
                continue;
            }
            let offset = level - spot.quantile(quantile, cube)? as i32;
            for &p in spot.coords() {
                let shifted = cube.value(p) as i32 + offset;
                let damped = if shifted >= level {
                    shifted as f64
                } else {
                    (shifted as f64 * 0.5).trunc()
                };
                result.set(p, clip_to_u8(damped));
            }
        }
        info!("Normalized {} spots to level {} in {:?}",
              self.len(), level, start.elapsed());
        Ok(result)
    }

    /// Linearly maps each spot's `[quantile(low_quantile),
    /// quantile(1 - high_quantile)]` onto `[0, 256)`, clipping to 0..=255.
    ///
    /// A spot whose two quantiles coincide has no range to stretch; its
    /// voxels above the low quantile become 255 and the rest 0.
    pub fn stretched_cube(&self, low_quantile: f64, high_quantile: f64)
                          -> Result<VoxelCube> {
        check_quantile(low_quantile)?;
        check_quantile(1.0 - high_quantile)?;
        let start = Instant::now();
        let cube = self.cube();
        let mut result = cube.clone();
        result.data_mut().fill(0);
        for (id, spot) in self.spots().iter().enumerate() {
            if spot.is_empty() {
                debug!("Spot {} is empty; not stretched", id);
                continue;
            }
            let histogram = spot.histogram(cube)?;
            let low = histogram.quantile(low_quantile)? as f64;
            let high = histogram.quantile(1.0 - high_quantile)? as f64;
            for &p in spot.coords() {
                let v = cube.value(p) as f64;
                let stretched = if high > low {
                    clip_to_u8((v - low) * 256.0 / (high - low))
                } else if v > low {
                    255
                } else {
                    0
                };
                result.set(p, stretched);
            }
        }
        info!("Stretched {} spots in {:?}", self.len(), start.elapsed());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::coords::{Coord, Shape};
    use crate::error::SpotError;
    use crate::spot::Spot;

    fn block(z: usize, y: usize, x: usize) -> Vec<Coord> {
        let mut coords = Vec::new();
        for dz in 0..2 {
            for dy in 0..2 {
                for dx in 0..2 {
                    coords.push([z + dz, y + dy, x + dx]);
                }
            }
        }
        coords
    }

    #[test]
    fn test_normalized_uniform_spot() {
        let mut cube = VoxelCube::zeros(Shape::new(4, 4, 4));
        cube.data_mut().fill(50);
        let spots = SpotCollection::new(Arc::new(cube),
                                        vec![Spot::from_coords(block(0, 0, 0))]);
        let normalized = spots.normalized_cube(0.5, 100).unwrap();
        for ((z, y, x), &v) in normalized.data().indexed_iter() {
            if z < 2 && y < 2 && x < 2 {
                assert_eq!(v, 100);
            } else {
                assert_eq!(v, 0);
            }
        }
    }

    #[test]
    fn test_normalized_dampens_below_level() {
        let mut cube = VoxelCube::zeros(Shape::new(1, 1, 5));
        for (x, v) in [10, 20, 30, 40, 50].into_iter().enumerate() {
            cube.set([0, 0, x], v);
        }
        let spots = SpotCollection::new(Arc::new(cube),
                                        vec![Spot::from_coords((0..5).map(|x| [0, 0, x]))]);
        // Quantile 0.5 is 30, so the offset is +70.
        let normalized = spots.normalized_cube(0.5, 100).unwrap();
        let values: Vec<u8> = normalized.data().iter().copied().collect();
        // 80 and 90 are halved; 100 and up pass unchanged.
        assert_eq!(values, vec![40, 45, 100, 110, 120]);
    }

    #[test]
    fn test_normalized_clips() {
        let mut cube = VoxelCube::zeros(Shape::new(1, 1, 3));
        cube.set([0, 0, 0], 0);
        cube.set([0, 0, 1], 10);
        cube.set([0, 0, 2], 255);
        let spots = SpotCollection::new(Arc::new(cube),
                                        vec![Spot::from_coords((0..3).map(|x| [0, 0, x]))]);
        // Quantile 0.5 is 10; offset +190 pushes 255 past the top.
        let normalized = spots.normalized_cube(0.5, 200).unwrap();
        assert_eq!(normalized.value([0, 0, 2]), 255);
        assert_eq!(normalized.value([0, 0, 0]), 95);
        assert!(matches!(spots.normalized_cube(1.5, 100),
                         Err(SpotError::InvalidQuantile(_))));
    }

    #[test]
    fn test_normalized_does_not_touch_input() {
        let mut cube = VoxelCube::zeros(Shape::new(2, 2, 2));
        cube.data_mut().fill(7);
        let spots = SpotCollection::new(Arc::new(cube),
                                        vec![Spot::from_coords(block(0, 0, 0)), Spot::default()]);
        let _ = spots.normalized_cube(0.5, 100).unwrap();
        assert!(spots.cube().data().iter().all(|&v| v == 7));
    }

    #[test]
    fn test_stretched_cube() {
        let mut cube = VoxelCube::zeros(Shape::new(1, 2, 5));
        for (x, v) in [0, 64, 128, 192, 255].into_iter().enumerate() {
            cube.set([0, 0, x], v);
        }
        let spots = SpotCollection::new(Arc::new(cube),
                                        vec![Spot::from_coords((0..5).map(|x| [0, 0, x]))]);
        // Low quantile 0.2 is 64, high (q = 0.8) is 255.
        let stretched = spots.stretched_cube(0.2, 0.2).unwrap();
        assert_eq!(stretched.value([0, 0, 0]), 0);
        assert_eq!(stretched.value([0, 0, 1]), 0);
        assert_eq!(stretched.value([0, 0, 2]), 85);
        assert_eq!(stretched.value([0, 0, 4]), 255);
        assert_eq!(stretched.value([0, 1, 4]), 0);
    }

    #[test]
    fn test_stretched_flat_spot() {
        let mut cube = VoxelCube::zeros(Shape::new(1, 1, 4));
        cube.data_mut().fill(30);
        cube.set([0, 0, 3], 31);
        let spots = SpotCollection::new(Arc::new(cube),
                                        vec![Spot::from_coords((0..4).map(|x| [0, 0, x]))]);
        let stretched = spots.stretched_cube(0.2, 0.5).unwrap();
        assert_eq!(stretched.value([0, 0, 0]), 0);
        assert_eq!(stretched.value([0, 0, 3]), 255);
    }
}  // mod tests.
