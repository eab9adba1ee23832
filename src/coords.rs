// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Voxel coordinates and the neighbourhood helpers every detector is built
//! on. Axis order is always (z, y, x).

use std::fmt;

use crate::error::{Result, SpotError};

/// An in-bounds voxel position, (z, y, x).
pub type Coord = [usize; 3];

/// A possibly out-of-bounds position, produced by neighbour enumeration
/// before clipping.
pub type SignedCoord = [i64; 3];

/// Per-axis integer radius, (z, y, x).
pub type BoxRadius = [usize; 3];

/// Extent of a cube along each axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl Shape {
    pub fn new(z: usize, y: usize, x: usize) -> Shape {
        Shape { z, y, x }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.z, self.y, self.x)
    }

    pub fn len(&self) -> usize {
        self.z * self.y * self.x
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, p: SignedCoord) -> bool {
        p[0] >= 0 && p[1] >= 0 && p[2] >= 0 &&
            (p[0] as usize) < self.z &&
            (p[1] as usize) < self.y &&
            (p[2] as usize) < self.x
    }

    /// Converts `p` to an in-bounds coordinate, or None if it falls outside.
    pub fn clip(&self, p: SignedCoord) -> Option<Coord> {
        if self.contains(p) {
            Some([p[0] as usize, p[1] as usize, p[2] as usize])
        } else {
            None
        }
    }

    /// Fails with [SpotError::ShapeMismatch] unless `other` equals self.
    pub fn check_same(&self, other: &Shape) -> Result<()> {
        if self != other {
            return Err(SpotError::ShapeMismatch{expected: *self, actual: *other});
        }
        Ok(())
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from(dims: (usize, usize, usize)) -> Shape {
        Shape::new(dims.0, dims.1, dims.2)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}x{}", self.z, self.y, self.x)
    }
}

pub fn signed(p: Coord) -> SignedCoord {
    [p[0] as i64, p[1] as i64, p[2] as i64]
}

/// The 6 positions differing from `p` by one step along exactly one axis.
/// Diagonal positions are not neighbours; "touching" means sharing a face.
pub fn face_neighbors(p: Coord) -> [SignedCoord; 6] {
    let [z, y, x] = signed(p);
    [
        [z - 1, y, x],
        [z, y - 1, x],
        [z, y, x - 1],
        [z + 1, y, x],
        [z, y + 1, x],
        [z, y, x + 1],
    ]
}

/// All positions in the box `[-rz,+rz] x [-ry,+ry] x [-rx,+rx]` around `p`,
/// `p` itself included. Yields positions in (z, y, x) raster order.
pub fn box_neighbors(p: Coord, radius: BoxRadius)
                     -> impl Iterator<Item = SignedCoord> {
    let [z0, y0, x0] = signed(p);
    let [rz, ry, rx] = [radius[0] as i64, radius[1] as i64, radius[2] as i64];
    (z0 - rz..=z0 + rz).flat_map(move |z| {
        (y0 - ry..=y0 + ry).flat_map(move |y| {
            (x0 - rx..=x0 + rx).map(move |x| [z, y, x])
        })
    })
}

/// Drops any position with a component outside `[0, shape[axis])`. Never
/// wraps.
pub fn clip_to_bounds<I>(coords: I, shape: Shape) -> impl Iterator<Item = Coord>
where I: IntoIterator<Item = SignedCoord>
{
    coords.into_iter().filter_map(move |p| shape.clip(p))
}

// mod tests.
