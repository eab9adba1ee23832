// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Display colours for spots. Nothing in detection or measurement looks at
//! them; they only feed the drawing code in the driver.

use std::time::Instant;

use log::debug;
use petgraph::graphmap::UnGraphMap;
use rand::Rng;

use crate::spot::Color;
use crate::spots::SpotCollection;

pub const DEFAULT_PALETTE: [Color; 4] =
    [[0, 255, 0], [0, 128, 0], [0, 255, 128], [0, 128, 255]];

/// Spots closer than this (box distance, voxels) must get different colours
/// from [SpotCollection::assign_few_colors] when the palette allows it.
pub const CONFLICT_RADIUS: usize = 3;

impl SpotCollection {
    fn has_colors(&self) -> bool {
        self.spots().iter().any(|s| s.color().is_some())
    }

    // Graph over spot ids with an edge between spots whose footprints come
    // within CONFLICT_RADIUS of each other.
    fn conflict_graph(&self) -> UnGraphMap<usize, ()> {
        let mut graph = UnGraphMap::<usize, ()>::with_capacity(self.len(), 0);
        let radius = [CONFLICT_RADIUS; 3];
        for id in self.ids() {
            graph.add_node(id);
            let near = self.spot(id).expanded(radius, self.cube().shape());
            // `near` is clipped to this collection's cube, so the lookup
            // cannot fail.
            for other in near.intersection_ids(self).unwrap_or_default() {
                if other != id {
                    graph.add_edge(id, other, ());
                }
            }
        }
        graph
    }

    /// Colours spots from `palette` so that nearby spots differ, using as
    /// few colours as a greedy pass finds. Spots are visited by descending
    /// number of neighbours, then by id, so the result depends only on the
    /// footprints. When the palette runs out the first colour is reused.
    /// Existing colours are kept unless `force` is set.
    pub fn assign_few_colors(&mut self, palette: &[Color], force: bool) {
        if palette.is_empty() || (self.has_colors() && !force) {
            return;
        }
        let start = Instant::now();
        let graph = self.conflict_graph();
        let mut order: Vec<usize> = self.ids().collect();
        order.sort_by_key(|&id| (std::cmp::Reverse(graph.neighbors(id).count()), id));

        let mut chosen: Vec<Option<usize>> = vec![None; self.len()];
        for id in order {
            let taken: Vec<usize> = graph.neighbors(id).filter_map(|n| chosen[n]).collect();
            let pick = (0..palette.len()).find(|c| !taken.contains(c)).unwrap_or(0);
            chosen[id] = Some(pick);
        }
        let used = chosen.iter().flatten().max().map_or(0, |&c| c + 1);
        for (spot, pick) in self.spots_mut().iter_mut().zip(chosen) {
            spot.set_color(pick.map(|c| palette[c]));
        }
        debug!("Coloured {} spots with {} colours in {:?}",
               self.len(), used, start.elapsed());
    }

    /// Gives every spot its own colour. Components passed as `Some` are
    /// fixed; the others are drawn from 128..=255.
    pub fn assign_random_colors<R: Rng>(&mut self, rng: &mut R,
                                        r: Option<u8>, g: Option<u8>, b: Option<u8>,
                                        force: bool) {
        if self.has_colors() && !force {
            return;
        }
        for spot in self.spots_mut() {
            let mut component = |fixed: Option<u8>| {
                fixed.unwrap_or_else(|| rng.random_range(128..=255))
            };
            let color = [component(r), component(g), component(b)];
            spot.set_color(Some(color));
        }
    }

    /// Paints every spot `color`, replacing any existing colours.
    pub fn assign_color(&mut self, color: Color) {
        for spot in self.spots_mut() {
            spot.set_color(Some(color));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::coords::Shape;
    use crate::cube::VoxelCube;
    use crate::spot::Spot;

    fn row_of_dots(xs: &[usize]) -> SpotCollection {
        let cube = Arc::new(VoxelCube::zeros(Shape::new(1, 3, 40)));
        SpotCollection::new(cube, xs.iter().map(|&x| Spot::from_coords(vec![[0, 1, x]])).collect())
    }

    #[test]
    fn test_few_colors_separates_neighbours() {
        // 0-1 and 1-2 are within reach; 3 stands alone.
        let mut spots = row_of_dots(&[0, 2, 4, 30]);
        spots.assign_few_colors(&DEFAULT_PALETTE, false);
        let colors: Vec<Color> = spots.spots().iter().map(|s| s.color().unwrap()).collect();
        assert_ne!(colors[0], colors[1]);
        assert_ne!(colors[1], colors[2]);
        // Spot 1 has most neighbours so it is coloured first.
        assert_eq!(colors[1], DEFAULT_PALETTE[0]);
        assert_eq!(colors[3], DEFAULT_PALETTE[0]);
    }

    #[test]
    fn test_few_colors_deterministic() {
        let mut a = row_of_dots(&[0, 1, 2, 3, 4, 5, 6]);
        let mut b = a.clone();
        a.assign_few_colors(&DEFAULT_PALETTE, false);
        b.assign_few_colors(&DEFAULT_PALETTE, false);
        assert_eq!(a.spots(), b.spots());
    }

    #[test]
    fn test_few_colors_palette_exhausted() {
        // Four mutually close dots cannot all differ with two colours.
        let mut spots = row_of_dots(&[0, 1, 2, 3]);
        spots.assign_few_colors(&DEFAULT_PALETTE[..2], false);
        assert!(spots.spots().iter().all(|s| s.color().is_some()));
    }

    #[test]
    fn test_random_colors() {
        let mut spots = row_of_dots(&[0, 10, 20]);
        let mut rng = StdRng::seed_from_u64(42);
        spots.assign_random_colors(&mut rng, None, Some(7), None, false);
        for spot in spots.spots() {
            let [r, g, b] = spot.color().unwrap();
            assert!(r >= 128);
            assert_eq!(g, 7);
            assert!(b >= 128);
        }
        // Existing colours survive without force.
        let before = spots.spots().to_vec();
        spots.assign_random_colors(&mut rng, Some(1), Some(1), Some(1), false);
        assert_eq!(spots.spots(), &before[..]);
        spots.assign_random_colors(&mut rng, Some(1), Some(1), Some(1), true);
        assert_eq!(spots.spot(0).color(), Some([1, 1, 1]));
    }

    #[test]
    fn test_assign_color() {
        let mut spots = row_of_dots(&[0, 10]);
        spots.assign_color([9, 8, 7]);
        assert!(spots.spots().iter().all(|s| s.color() == Some([9, 8, 7])));
    }
}  // mod tests.
