// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::cell::OnceCell;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use ndarray::Array3;

use crate::coords::{BoxRadius, Coord};
use crate::cube::VoxelCube;
use crate::error::{Result, SpotError};
use crate::histogram_funcs::percentile_of;
use crate::shapes::{Radii, ShapeKind, shape_spot};
use crate::spot::{Spot, euclidean};

/// An ordered set of spots over one shared cube. A spot's id is its index;
/// ids are always the dense range `0..len()`.
///
/// Operations that replace every spot (`expanded`, `ellipsoids`,
/// `cylinders`, `subtracted`) return a new collection of the same length, so
/// id `i` in the result is "spot `i`, grown/replaced". Filters consume the
/// collection and renumber the survivors; spot colours and the id cube are
/// reset by any filter.
#[derive(Clone, Debug)]
pub struct SpotCollection {
    cube: Arc<VoxelCube>,
    spots: Vec<Spot>,

    // Lazily built map from voxel to id of the spot covering it, with
    // `spots.len()` meaning "no spot". Reset whenever `spots` changes.
    id_cube: OnceCell<Array3<u32>>,
}

impl SpotCollection {
    /// Spots are expected to lie within `cube`. Measuring one that does not
    /// fails with [SpotError::ShapeMismatch].
    pub fn new(cube: Arc<VoxelCube>, spots: Vec<Spot>) -> SpotCollection {
        SpotCollection{cube, spots, id_cube: OnceCell::new()}
    }

    pub fn empty(cube: Arc<VoxelCube>) -> SpotCollection {
        SpotCollection::new(cube, Vec::new())
    }

    pub fn cube(&self) -> &VoxelCube {
        &self.cube
    }

    pub fn shared_cube(&self) -> Arc<VoxelCube> {
        self.cube.clone()
    }

    pub fn len(&self) -> usize {
        self.spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    pub fn spots(&self) -> &[Spot] {
        &self.spots
    }

    /// Panics if `id` is out of range, like slice indexing.
    pub fn spot(&self, id: usize) -> &Spot {
        &self.spots[id]
    }

    pub fn ids(&self) -> std::ops::Range<usize> {
        0..self.spots.len()
    }

    pub fn into_spots(self) -> Vec<Spot> {
        self.spots
    }

    pub fn view(&self, id: usize) -> SpotView<'_> {
        SpotView{id, spot: &self.spots[id], collection: self}
    }

    pub fn views(&self) -> impl Iterator<Item = SpotView<'_>> {
        self.ids().map(move |id| self.view(id))
    }

    pub(crate) fn spots_mut(&mut self) -> &mut [Spot] {
        &mut self.spots
    }

    fn invalidate(&mut self) {
        self.id_cube = OnceCell::new();
    }

    pub fn push(&mut self, spot: Spot) {
        self.spots.push(spot);
        self.invalidate();
    }

    /// Appends the spots of `other`, whose cube must have the same shape.
    /// Appended spots get ids after the existing ones.
    pub fn extend(&mut self, other: SpotCollection) -> Result<()> {
        self.cube.shape().check_same(&other.cube.shape())?;
        self.spots.extend(other.spots);
        self.invalidate();
        Ok(())
    }

    /// The same spots over a different, same-shaped cube.
    pub fn with_cube(self, cube: Arc<VoxelCube>) -> Result<SpotCollection> {
        self.cube.shape().check_same(&cube.shape())?;
        Ok(SpotCollection{cube, spots: self.spots, id_cube: self.id_cube})
    }

    /// The id used in [SpotCollection::id_cube] for voxels outside every
    /// spot.
    pub fn no_spot_id(&self) -> u32 {
        self.spots.len() as u32
    }

    /// Voxel to spot-id map, built on first use. Where spots overlap, the
    /// higher id wins.
    pub fn id_cube(&self) -> &Array3<u32> {
        self.id_cube.get_or_init(|| {
            let build_start = Instant::now();
            let mut ids = Array3::from_elem(self.cube.shape().dims(), self.no_spot_id());
            for (id, spot) in self.spots.iter().enumerate() {
                // Voxels outside the cube cannot be looked up; skip them.
                for &p in spot.coords() {
                    if let Some(slot) = ids.get_mut(p) {
                        *slot = id as u32;
                    }
                }
            }
            debug!("Built id cube for {} spots in {:?}",
                   self.spots.len(), build_start.elapsed());
            ids
        })
    }

    /// Id of the spot covering `p`, if any.
    pub fn spot_at(&self, p: Coord) -> Option<usize> {
        let id = *self.id_cube().get(p)?;
        if id == self.no_spot_id() { None } else { Some(id as usize) }
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.spots.iter().map(|s| s.size()).collect()
    }

    pub fn masses(&self) -> Result<Vec<u64>> {
        self.spots.iter().map(|s| s.mass(&self.cube)).collect()
    }

    pub fn centers(&self) -> Result<Vec<[f64; 3]>> {
        self.spots.iter().map(|s| s.center()).collect()
    }

    /// Per spot, the number of voxels strictly brighter than `level`.
    pub fn occupancies(&self, level: i32) -> Result<Vec<usize>> {
        self.spots.iter().map(|s| s.occupancy(level, &self.cube)).collect()
    }

    // Keeps spots for which `keep` holds, renumbering them densely and
    // dropping colours and the id cube.
    fn retain_spots<F>(self, what: &str, mut keep: F) -> SpotCollection
    where F: FnMut(&Spot) -> bool
    {
        let before = self.spots.len();
        let spots: Vec<Spot> = self.spots.into_iter()
            .filter(|s| keep(s))
            .map(|mut s| { s.set_color(None); s })
            .collect();
        info!("{} filter kept {} of {} spots", what, spots.len(), before);
        SpotCollection::new(self.cube, spots)
    }

    /// Keeps spots with `min_size <= size <= max_size`.
    pub fn filter_by_size(self, min_size: usize, max_size: usize) -> SpotCollection {
        self.retain_spots("Size", |s| (min_size..=max_size).contains(&s.size()))
    }

    /// Keeps spots spanning at least `min_height` z slices that each hold at
    /// least `min_presence` voxels.
    pub fn filter_by_height(self, min_height: usize, min_presence: usize)
                            -> SpotCollection {
        self.retain_spots("Height", |s| s.height(min_presence) >= min_height)
    }

    /// Takes the `percentile` of all spot masses as a reference and keeps
    /// spots whose mass lies in `[reference * min_ratio, reference * max_ratio]`.
    pub fn filter_by_mass(self, percentile: f64, min_ratio: f64, max_ratio: f64)
                          -> Result<SpotCollection> {
        if self.is_empty() {
            return Ok(self);
        }
        let masses: Vec<f64> = self.masses()?.into_iter().map(|m| m as f64).collect();
        let reference = percentile_of(&masses, percentile)?;
        let (low, high) = (reference * min_ratio, reference * max_ratio);
        debug!("Mass reference {} at percentile {}; keeping [{}, {}]",
               reference, percentile, low, high);
        let mut masses = masses.into_iter();
        Ok(self.retain_spots("Mass", move |_| {
            let m = masses.next().unwrap_or(f64::NAN);
            low <= m && m <= high
        }))
    }

    /// Every spot grown by `radius` (clipped to the cube).
    pub fn expanded(&self, radius: BoxRadius) -> SpotCollection {
        let shape = self.cube.shape();
        let spots = self.spots.iter().map(|s| s.expanded(radius, shape)).collect();
        SpotCollection::new(self.cube.clone(), spots)
    }

    fn shaped(&self, kind: ShapeKind, radii: Radii) -> Result<SpotCollection> {
        let shape = self.cube.shape();
        let mut spots = Vec::with_capacity(self.spots.len());
        for spot in &self.spots {
            let replaced = match spot.center_of_mass(&self.cube) {
                Ok(center) => {
                    let mut s = shape_spot(kind, center, radii, shape)?;
                    s.set_color(spot.color());
                    s
                },
                // Nothing to centre on; keep the slot so ids still line up.
                Err(SpotError::EmptySpot) => Spot::default(),
                Err(e) => return Err(e),
            };
            spots.push(replaced);
        }
        Ok(SpotCollection::new(self.cube.clone(), spots))
    }

    /// Every spot replaced by an ellipsoid of `radii` (floored to 1.5)
    /// centred at the spot's centre of mass.
    pub fn ellipsoids(&self, radii: Radii) -> Result<SpotCollection> {
        self.shaped(ShapeKind::Ellipsoid, radii)
    }

    /// Every spot replaced by a full-height cylinder of (y, x) radii centred
    /// at the spot's centre of mass.
    pub fn cylinders(&self, radii: Radii) -> Result<SpotCollection> {
        self.shaped(ShapeKind::Cylinder, radii)
    }

    /// Spot `i` of the result is spot `i` minus spot `i` of `other`. Both
    /// collections must have the same length. Returns a new collection; self
    /// is not modified.
    pub fn subtracted(&self, other: &SpotCollection) -> Result<SpotCollection> {
        if self.len() != other.len() {
            return Err(SpotError::LengthMismatch{expected: self.len(),
                                                 actual: other.len()});
        }
        let spots = self.spots.iter().zip(&other.spots)
            .map(|(a, b)| a.subtracted(b))
            .collect();
        Ok(SpotCollection::new(self.cube.clone(), spots))
    }

    /// Every spot projected onto the z = 0 slice.
    pub fn flattened(&self) -> SpotCollection {
        let spots = self.spots.iter().map(|s| {
            let mut flat = Spot::from_coords(s.coords().iter().map(|p| [0, p[1], p[2]]));
            flat.set_color(s.color());
            flat
        }).collect();
        SpotCollection::new(self.cube.clone(), spots)
    }

    /// One-voxel (y, x) rings around the flattened spots, on z = 0.
    pub fn outlines(&self) -> Result<SpotCollection> {
        let flat = self.flattened();
        flat.expanded([0, 1, 1]).subtracted(&flat)
    }
}

/// A spot together with the collection that owns it; supplies the
/// collection's cube to intensity measurements.
#[derive(Clone, Copy, Debug)]
pub struct SpotView<'a> {
    id: usize,
    spot: &'a Spot,
    collection: &'a SpotCollection,
}

impl<'a> SpotView<'a> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn spot(&self) -> &'a Spot {
        self.spot
    }

    pub fn collection(&self) -> &'a SpotCollection {
        self.collection
    }

    pub fn cube(&self) -> &'a VoxelCube {
        self.collection.cube()
    }

    pub fn size(&self) -> usize {
        self.spot.size()
    }

    pub fn mass(&self) -> Result<u64> {
        self.spot.mass(self.cube())
    }

    pub fn center(&self) -> Result<[f64; 3]> {
        self.spot.center()
    }

    pub fn center_of_mass(&self) -> Result<[f64; 3]> {
        self.spot.center_of_mass(self.cube())
    }

    pub fn quantile(&self, q: f64) -> Result<u8> {
        self.spot.quantile(q, self.cube())
    }

    pub fn occupancy(&self, level: i32) -> Result<usize> {
        self.spot.occupancy(level, self.cube())
    }

    /// Distance in voxels between the centres of mass, each measured in its
    /// own collection's cube.
    pub fn distance(&self, other: &SpotView) -> Result<f64> {
        Ok(euclidean(self.center_of_mass()?, other.center_of_mass()?, [1.0; 3]))
    }

    /// Distance in nm between the centres of mass, using this spot's cube
    /// scale.
    pub fn physical_distance(&self, other: &SpotView) -> Result<f64> {
        let scale = self.cube().scale().ok_or(SpotError::MissingScale)?;
        Ok(euclidean(self.center_of_mass()?, other.center_of_mass()?,
                     [scale.z, scale.y, scale.x]))
    }

    pub fn physical_volume(&self) -> Result<f64> {
        self.cube().physical_volume(self.size())
    }

    // Collections compared against this spot must share its cube's shape.
    fn check_comparable(&self, other: &SpotCollection) -> Result<()> {
        self.cube().shape().check_same(&other.cube().shape())
    }

    pub fn intersection_ids(&self, other: &SpotCollection) -> Result<Vec<usize>> {
        self.check_comparable(other)?;
        self.spot.intersection_ids(other)
    }

    pub fn intersection_occupancy(&self, other: &SpotCollection) -> Result<usize> {
        self.check_comparable(other)?;
        self.spot.intersection_occupancy(other)
    }

    pub fn distance_to_variety(&self, other: &SpotCollection, max_steps: usize,
                               step: BoxRadius) -> Result<Option<usize>> {
        self.check_comparable(other)?;
        self.spot.distance_to_variety(other, max_steps, step)
    }

    pub fn center_to_variety(&self, other: &SpotCollection, max_steps: usize,
                             step: [f64; 3]) -> Result<Option<usize>> {
        self.check_comparable(other)?;
        self.spot.center_to_variety(self.cube(), other, max_steps, step)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::coords::Shape;
    use crate::cube::PhysicalScale;

    fn line(z: usize, y: usize, xs: std::ops::Range<usize>) -> Spot {
        Spot::from_coords(xs.map(|x| [z, y, x]))
    }

    fn sample() -> SpotCollection {
        let cube = Arc::new(VoxelCube::zeros(Shape::new(4, 10, 10)));
        SpotCollection::new(cube, vec![line(0, 0, 0..2), line(1, 5, 0..6),
                                       line(2, 8, 0..4), line(3, 3, 0..9)])
    }

    #[test]
    fn test_filter_by_size_renumbers() {
        let spots = sample();
        let before: Vec<Spot> = spots.spots().to_vec();
        let filtered = spots.filter_by_size(3, 6);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.ids(), 0..2);
        // Coordinate sets survive unchanged, in their previous order.
        assert_eq!(filtered.spot(0), &before[1]);
        assert_eq!(filtered.spot(1), &before[2]);
        assert_eq!(filtered.spot_at([2, 8, 0]), Some(1));
    }

    #[test]
    fn test_filter_by_size_idempotent() {
        let once = sample().filter_by_size(3, 6);
        let twice = once.clone().filter_by_size(3, 6);
        assert_eq!(once.spots(), twice.spots());
    }

    #[test]
    fn test_filter_resets_colors_and_id_cube() {
        let mut spots = sample();
        spots.assign_color([1, 2, 3]);
        assert_eq!(spots.spot_at([0, 0, 0]), Some(0));
        let filtered = spots.filter_by_size(3, 100);
        assert!(filtered.spots().iter().all(|s| s.color().is_none()));
        assert_eq!(filtered.no_spot_id(), 3);
        assert_eq!(filtered.spot_at([0, 0, 0]), None);
        assert_eq!(filtered.spot_at([3, 3, 8]), Some(2));
    }

    #[test]
    fn test_filter_by_height() {
        let cube = Arc::new(VoxelCube::zeros(Shape::new(4, 10, 10)));
        let mut tall: Vec<Coord> = Vec::new();
        for z in 0..3 {
            tall.extend((0..5).map(|x| [z, 0, x]));
        }
        let spots = SpotCollection::new(cube, vec![
            Spot::from_coords(tall),
            line(0, 5, 0..9),
        ]);
        let kept = spots.filter_by_height(2, 5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.spot(0).size(), 15);
    }

    #[test]
    fn test_filter_by_mass() {
        let mut cube = VoxelCube::zeros(Shape::new(1, 4, 10));
        for x in 0..10 {
            cube.set([0, 0, x], 10);  // Mass 100.
            cube.set([0, 1, x], 11);  // Mass 110.
            cube.set([0, 2, x], 1);   // Mass 10.
            cube.set([0, 3, x], 100); // Mass 1000.
        }
        let spots = SpotCollection::new(Arc::new(cube), (0..4).map(|y| line(0, y, 0..10)).collect());
        // Median mass is 105; keep [52.5, 210].
        let kept = spots.filter_by_mass(50.0, 0.5, 2.0).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.masses().unwrap(), vec![100, 110]);

        let empty = SpotCollection::empty(Arc::new(VoxelCube::zeros(Shape::new(1, 1, 1))));
        assert!(empty.filter_by_mass(50.0, 0.5, 2.0).unwrap().is_empty());
    }

    #[test]
    fn test_expanded_preserves_correspondence() {
        let spots = sample();
        let grown = spots.expanded([0, 1, 1]);
        assert_eq!(grown.len(), spots.len());
        for (a, b) in spots.spots().iter().zip(grown.spots()) {
            assert!(a.coords().iter().all(|p| b.contains(p)));
        }
    }

    #[test]
    fn test_subtracted_builds_rings() {
        let spots = sample();
        let inner = spots.expanded([0, 1, 1]);
        let outer = spots.expanded([0, 2, 2]);
        let rings = outer.subtracted(&inner).unwrap();
        assert_eq!(rings.len(), spots.len());
        for (ring, core) in rings.spots().iter().zip(inner.spots()) {
            assert_eq!(ring.shared_voxels(core), 0);
        }
        assert!(matches!(spots.subtracted(&spots.clone().filter_by_size(100, 200)),
                         Err(SpotError::LengthMismatch{expected: 4, actual: 0})));
    }

    #[test]
    fn test_ellipsoids_and_cylinders() {
        let mut cube = VoxelCube::zeros(Shape::new(5, 11, 11));
        cube.set([2, 5, 5], 100);
        let cube = Arc::new(cube);
        let spots = SpotCollection::new(cube, vec![
            Spot::from_coords(vec![[2, 5, 5], [2, 5, 6], [2, 5, 4]]),
            Spot::default(),
        ]);
        let balls = spots.ellipsoids([1.0, 2.0, 2.0]).unwrap();
        assert_eq!(balls.len(), 2);
        assert!(balls.spot(0).contains(&[2, 5, 7]));
        assert!(balls.spot(0).contains(&[3, 5, 5]));
        assert!(!balls.spot(0).contains(&[4, 5, 5]));
        assert!(balls.spot(1).is_empty());

        let columns = spots.cylinders([1.0, 2.0, 2.0]).unwrap();
        for z in 0..5 {
            assert!(columns.spot(0).contains(&[z, 5, 5]));
        }
    }

    #[test]
    fn test_outlines() {
        let cube = Arc::new(VoxelCube::zeros(Shape::new(3, 5, 5)));
        let spots = SpotCollection::new(cube, vec![Spot::from_coords(vec![[2, 2, 2]])]);
        let outlines = spots.outlines().unwrap();
        assert_eq!(outlines.spot(0).size(), 8);
        assert!(outlines.spot(0).coords().iter().all(|p| p[0] == 0));
        assert!(!outlines.spot(0).contains(&[0, 2, 2]));
    }

    #[test]
    fn test_extend_and_with_cube() {
        let mut spots = sample();
        let _ = spots.id_cube();
        let more = SpotCollection::new(spots.shared_cube(), vec![line(0, 9, 5..7)]);
        spots.extend(more).unwrap();
        assert_eq!(spots.len(), 5);
        assert_eq!(spots.spot_at([0, 9, 5]), Some(4));

        let wrong = Arc::new(VoxelCube::zeros(Shape::new(1, 1, 1)));
        assert!(matches!(spots.clone().with_cube(wrong.clone()),
                         Err(SpotError::ShapeMismatch{..})));
        assert!(spots.extend(SpotCollection::empty(wrong)).is_err());
    }

    #[test]
    fn test_view_distances() {
        let mut cube = VoxelCube::zeros(Shape::new(2, 10, 10));
        cube.set([0, 0, 0], 10);
        cube.set([0, 3, 4], 10);
        let cube = Arc::new(cube);
        let spots = SpotCollection::new(cube.clone(), vec![
            Spot::from_coords(vec![[0, 0, 0]]),
            Spot::from_coords(vec![[0, 3, 4]]),
        ]);
        let (a, b) = (spots.view(0), spots.view(1));
        assert_abs_diff_eq!(a.distance(&b).unwrap(), 5.0, epsilon = 1e-9);
        assert!(matches!(a.physical_distance(&b), Err(SpotError::MissingScale)));

        let scaled = Arc::new((*cube).clone().with_scale(PhysicalScale::new(300.0, 100.0, 100.0)));
        let spots = spots.with_cube(scaled).unwrap();
        let (a, b) = (spots.view(0), spots.view(1));
        assert_abs_diff_eq!(a.physical_distance(&b).unwrap(), 500.0, epsilon = 1e-6);
        assert_abs_diff_eq!(a.physical_volume().unwrap(), 3_000_000.0);
    }

    #[test]
    fn test_view_against_other_shape() {
        let cube = Arc::new(VoxelCube::zeros(Shape::new(2, 10, 10)));
        let spots = SpotCollection::new(cube, vec![Spot::from_coords(vec![[0, 1, 1]])]);
        // The spot would fit, but the cubes disagree.
        let larger = SpotCollection::new(
            Arc::new(VoxelCube::zeros(Shape::new(2, 10, 12))),
            vec![Spot::from_coords(vec![[0, 1, 1]])]);
        let view = spots.view(0);
        assert!(matches!(view.intersection_ids(&larger),
                         Err(SpotError::ShapeMismatch{..})));
        assert!(matches!(view.intersection_occupancy(&larger),
                         Err(SpotError::ShapeMismatch{..})));
        assert!(matches!(view.distance_to_variety(&larger, 5, [0, 1, 1]),
                         Err(SpotError::ShapeMismatch{..})));
        assert_eq!(view.intersection_ids(&spots).unwrap(), vec![0]);

        // A spot reaching outside its own cube fails to measure.
        let stray = SpotCollection::new(
            Arc::new(VoxelCube::zeros(Shape::new(1, 1, 4))),
            vec![Spot::from_coords(vec![[0, 0, 1], [0, 0, 9]])]);
        assert_eq!(stray.spot_at([0, 0, 1]), Some(0));
        assert!(matches!(stray.view(0).mass(), Err(SpotError::ShapeMismatch{..})));
        assert!(matches!(stray.masses(), Err(SpotError::ShapeMismatch{..})));
    }
}  // mod tests.
