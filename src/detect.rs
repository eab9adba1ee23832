// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use ndarray::Array3;
use petgraph::graphmap::UnGraphMap;
use petgraph::visit::{Dfs, VisitMap};
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::coords::{Coord, box_neighbors, face_neighbors};
use crate::cube::VoxelCube;
use crate::error::{Result, SpotError};
use crate::shapes::{ShapeFitDetector, ShapeKind};
use crate::spot::Spot;
use crate::spots::SpotCollection;

/// Finds spots as face-connected groups of voxels strictly brighter than a
/// level. Diagonal contact does not join voxels.
#[derive(Clone, Copy, Debug)]
pub struct ConnectedComponentDetector {
    level: i32,
    // Minimum number of foreground voxels (the voxel itself included) in a
    // voxel's 3x3x3 box for the voxel to stay in the foreground. None keeps
    // all foreground voxels.
    tightness: Option<usize>,
}

impl ConnectedComponentDetector {
    pub fn new(level: i32) -> ConnectedComponentDetector {
        ConnectedComponentDetector{level, tightness: None}
    }

    /// Drops foreground voxels with fewer than `tightness` foreground voxels
    /// in their radius-1 box before grouping.
    pub fn with_tightness(mut self, tightness: usize) -> ConnectedComponentDetector {
        self.tightness = Some(tightness);
        self
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn detect(&self, cube: Arc<VoxelCube>) -> SpotCollection {
        let start = Instant::now();
        let mut foreground = cube.foreground(self.level);
        if let Some(tightness) = self.tightness {
            let before = foreground.len();
            foreground = tight_voxels(&foreground, &cube, tightness);
            debug!("Tightness {} kept {} of {} foreground voxels",
                   tightness, foreground.len(), before);
        }
        let spots = connected_components(&foreground, &cube);
        info!("Connected components above {} found {} spots in {:?}",
              self.level, spots.len(), start.elapsed());
        SpotCollection::new(cube, spots)
    }
}

// Keeps voxels with at least `tightness` members of `voxels` in their
// radius-1 box. Membership is judged against the unfiltered set.
fn tight_voxels(voxels: &[Coord], cube: &VoxelCube, tightness: usize) -> Vec<Coord> {
    let shape = cube.shape();
    let mut mask = Array3::<bool>::from_elem(shape.dims(), false);
    for &p in voxels {
        mask[p] = true;
    }
    voxels.iter().copied().filter(|&p| {
        let count = box_neighbors(p, [1, 1, 1])
            .filter_map(|q| shape.clip(q))
            .filter(|&q| mask[q])
            .count();
        count >= tightness
    }).collect()
}

// Groups `voxels` (raster ordered) into face-connected components. Each
// component comes out as one spot; components are ordered by their first
// voxel in raster order.
fn connected_components(voxels: &[Coord], cube: &VoxelCube) -> Vec<Spot> {
    let shape = cube.shape();
    let mut graph = UnGraphMap::<Coord, ()>::with_capacity(voxels.len(), voxels.len() * 3);
    for &p in voxels {
        graph.add_node(p);
    }
    for &p in voxels {
        for q in face_neighbors(p) {
            if let Some(q) = shape.clip(q) {
                if graph.contains_node(q) {
                    graph.add_edge(p, q, ());
                }
            }
        }
    }

    // Iterative traversal; large components never deepen the call stack.
    let mut spots = Vec::new();
    let mut dfs = Dfs::empty(&graph);
    for &p in voxels {
        if dfs.discovered.is_visited(&p) {
            continue;
        }
        dfs.move_to(p);
        let mut component = Vec::new();
        while let Some(q) = dfs.next(&graph) {
            component.push(q);
        }
        debug!("Component of {} voxels starting at {:?}", component.len(), p);
        spots.push(Spot::from_coords(component));
    }
    spots
}

/// One detection step, as named in channel configurations.
#[derive(Clone, Debug, PartialEq)]
pub enum Detect {
    /// `cc(level)`
    ConnectedComponents{level: i32},
    /// `tight(level, tightness)`
    Tight{level: i32, tightness: usize},
    /// `percentile(p)`: connected components above the `p`-th percentile of
    /// the whole cube.
    Percentile{percentile: f64},
    /// `topvoxels(n)`: connected components above the `n`-th brightest
    /// voxel's value.
    TopVoxels{voxels: usize},
    /// `spheres(n, radius[, wipe])`
    Spheres{n: usize, radius: f64, wipe: Option<f64>},
    /// `cylinders(n, radius[, wipe])`
    Cylinders{n: usize, radius: f64, wipe: Option<f64>},
}

impl Detect {
    /// Runs this step on `cube`.
    pub fn run(&self, cube: Arc<VoxelCube>) -> Result<SpotCollection> {
        match *self {
            Detect::ConnectedComponents{level} => {
                Ok(ConnectedComponentDetector::new(level).detect(cube))
            },
            Detect::Tight{level, tightness} => {
                Ok(ConnectedComponentDetector::new(level)
                   .with_tightness(tightness).detect(cube))
            },
            Detect::Percentile{percentile} => {
                let level = cube.histogram().percentile(percentile)?;
                debug!("Percentile {} is level {}", percentile, level);
                // Voxel values are integral, so `v > level` iff
                // `v > floor(level)`.
                Ok(ConnectedComponentDetector::new(level.floor() as i32).detect(cube))
            },
            Detect::TopVoxels{voxels} => {
                let level = match cube.histogram().nth_largest(voxels as u64) {
                    Some(v) => v as i32,
                    None if voxels == 0 => u8::MAX as i32,
                    None => -1,
                };
                debug!("Top {} voxels give level {}", voxels, level);
                Ok(ConnectedComponentDetector::new(level).detect(cube))
            },
            Detect::Spheres{n, radius, wipe} => {
                shape_detector(ShapeKind::Ellipsoid, n, radius, wipe).detect(cube)
            },
            Detect::Cylinders{n, radius, wipe} => {
                shape_detector(ShapeKind::Cylinder, n, radius, wipe).detect(cube)
            },
        }
    }

    /// Parses a `;`-separated list of steps, e.g. `"cc(120); spheres(3, 2)"`.
    pub fn parse_list(text: &str) -> Result<Vec<Detect>> {
        text.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Detect::from_str)
            .collect()
    }
}

fn shape_detector(kind: ShapeKind, n: usize, radius: f64, wipe: Option<f64>)
                  -> ShapeFitDetector {
    let wipe = wipe.unwrap_or(radius);
    ShapeFitDetector::new(kind, n, [radius; 3], Some([wipe; 3]))
}

/// Runs `steps` in order on `cube` and concatenates their spots. A later
/// step never replaces what an earlier one found; each step sees the
/// unmodified cube.
pub fn run_detection(cube: Arc<VoxelCube>, steps: &[Detect]) -> Result<SpotCollection> {
    let mut spots = SpotCollection::empty(cube.clone());
    for step in steps {
        spots.extend(step.run(cube.clone())?)?;
    }
    Ok(spots)
}

fn command_regex() -> Result<Regex> {
    Regex::new(r"^\s*([a-z]+)\s*\(([^()]*)\)\s*$")
        .map_err(|e| SpotError::ParseDetect(e.to_string()))
}

// Splits "a, b=2, c" into ["a", "2", "c"]; keyword names are accepted and
// ignored, the position decides the meaning.
fn split_args(args: &str) -> Vec<&str> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    args.split(',')
        .map(|a| match a.split_once('=') {
            Some((_, value)) => value.trim(),
            None => a.trim(),
        })
        .collect()
}

fn parse_arg<T: FromStr>(text: &str, args: &[&str], index: usize) -> Result<T> {
    args.get(index)
        .and_then(|a| a.parse::<T>().ok())
        .ok_or_else(|| SpotError::ParseDetect(format!("bad argument {} in '{}'", index + 1, text)))
}

fn optional_arg<T: FromStr>(text: &str, args: &[&str], index: usize) -> Result<Option<T>> {
    if index >= args.len() {
        return Ok(None);
    }
    parse_arg(text, args, index).map(Some)
}

impl FromStr for Detect {
    type Err = SpotError;

    fn from_str(text: &str) -> Result<Detect> {
        let re = command_regex()?;
        let captures = re.captures(text)
            .ok_or_else(|| SpotError::ParseDetect(format!("not a detect command: '{}'", text)))?;
        let name = &captures[1];
        let args = split_args(&captures[2]);
        let expect_args = |min: usize, max: usize| -> Result<()> {
            if args.len() < min || args.len() > max {
                return Err(SpotError::ParseDetect(
                    format!("{} takes {} to {} arguments, got {} in '{}'",
                            name, min, max, args.len(), text)));
            }
            Ok(())
        };
        let detect = match name {
            "cc" => {
                expect_args(1, 1)?;
                Detect::ConnectedComponents{level: parse_arg(text, &args, 0)?}
            },
            "tight" => {
                expect_args(2, 2)?;
                Detect::Tight{level: parse_arg(text, &args, 0)?,
                              tightness: parse_arg(text, &args, 1)?}
            },
            "percentile" => {
                expect_args(1, 1)?;
                Detect::Percentile{percentile: parse_arg(text, &args, 0)?}
            },
            "topvoxels" => {
                expect_args(1, 1)?;
                Detect::TopVoxels{voxels: parse_arg(text, &args, 0)?}
            },
            "spheres" => {
                expect_args(2, 3)?;
                Detect::Spheres{n: parse_arg(text, &args, 0)?,
                                radius: parse_arg(text, &args, 1)?,
                                wipe: optional_arg(text, &args, 2)?}
            },
            "cylinders" => {
                expect_args(2, 3)?;
                Detect::Cylinders{n: parse_arg(text, &args, 0)?,
                                  radius: parse_arg(text, &args, 1)?,
                                  wipe: optional_arg(text, &args, 2)?}
            },
            _ => return Err(SpotError::ParseDetect(format!("unknown detector '{}'", name))),
        };
        Ok(detect)
    }
}

impl fmt::Display for Detect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detect::ConnectedComponents{level} => write!(f, "cc({})", level),
            Detect::Tight{level, tightness} => write!(f, "tight({}, {})", level, tightness),
            Detect::Percentile{percentile} => write!(f, "percentile({})", percentile),
            Detect::TopVoxels{voxels} => write!(f, "topvoxels({})", voxels),
            Detect::Spheres{n, radius, wipe: None} => write!(f, "spheres({}, {})", n, radius),
            Detect::Spheres{n, radius, wipe: Some(w)} =>
                write!(f, "spheres({}, {}, {})", n, radius, w),
            Detect::Cylinders{n, radius, wipe: None} => write!(f, "cylinders({}, {})", n, radius),
            Detect::Cylinders{n, radius, wipe: Some(w)} =>
                write!(f, "cylinders({}, {}, {})", n, radius, w),
        }
    }
}

impl<'de> Deserialize<'de> for Detect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Detect, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Deserializes a `;`-separated detection string into its steps.
pub fn deserialize_detect_list<'de, D>(deserializer: D) -> std::result::Result<Vec<Detect>, D::Error>
where D: Deserializer<'de>
{
    let text = String::deserialize(deserializer)?;
    Detect::parse_list(&text).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::coords::Shape;

    fn cube_with(shape: Shape, voxels: &[(Coord, u8)]) -> Arc<VoxelCube> {
        let mut cube = VoxelCube::zeros(shape);
        for &(p, v) in voxels {
            cube.set(p, v);
        }
        Arc::new(cube)
    }

    fn voxel_sets(spots: &SpotCollection) -> BTreeSet<Vec<Coord>> {
        spots.spots().iter().map(|s| s.coords().to_vec()).collect()
    }

    #[test]
    fn test_two_clusters() {
        let cube = cube_with(Shape::new(5, 10, 10), &[
            ([1, 1, 1], 200), ([1, 1, 2], 200), ([2, 1, 1], 200),
            ([3, 8, 8], 150), ([3, 8, 7], 150),
        ]);
        let spots = ConnectedComponentDetector::new(120).detect(cube);
        assert_eq!(spots.len(), 2);
        let expected: BTreeSet<Vec<Coord>> = [
            vec![[1, 1, 1], [1, 1, 2], [2, 1, 1]],
            vec![[3, 8, 7], [3, 8, 8]],
        ].into_iter().collect();
        assert_eq!(voxel_sets(&spots), expected);
    }

    #[test]
    fn test_face_adjacency_only() {
        let diagonal = cube_with(Shape::new(3, 3, 3), &[([0, 0, 0], 9), ([1, 1, 0], 9)]);
        assert_eq!(ConnectedComponentDetector::new(0).detect(diagonal).len(), 2);

        let face = cube_with(Shape::new(3, 3, 3), &[([0, 0, 0], 9), ([1, 0, 0], 9)]);
        let spots = ConnectedComponentDetector::new(0).detect(face);
        assert_eq!(spots.len(), 1);
        assert_eq!(spots.spot(0).size(), 2);
    }

    #[test]
    fn test_threshold_is_strict() {
        let cube = cube_with(Shape::new(1, 1, 3), &[([0, 0, 0], 120), ([0, 0, 2], 121)]);
        let spots = ConnectedComponentDetector::new(120).detect(cube);
        assert_eq!(spots.len(), 1);
        assert_eq!(spots.spot(0).coords(), &[[0, 0, 2]]);
    }

    #[test]
    fn test_isolated_voxel_and_empty_foreground() {
        let cube = cube_with(Shape::new(3, 3, 3), &[([1, 1, 1], 50)]);
        let spots = ConnectedComponentDetector::new(10).detect(cube.clone());
        assert_eq!(spots.len(), 1);
        assert_eq!(spots.spot(0).size(), 1);
        assert!(ConnectedComponentDetector::new(50).detect(cube).is_empty());
    }

    #[test]
    fn test_long_snake_component() {
        // One component winding through every voxel of a 1x40x40 slab.
        let mut voxels = Vec::new();
        for y in 0..40 {
            for x in 0..40 {
                if y % 2 == 0 || (y % 4 == 1 && x == 39) || (y % 4 == 3 && x == 0) {
                    voxels.push(([0, y, x], 100));
                }
            }
        }
        let cube = cube_with(Shape::new(1, 40, 40), &voxels);
        let spots = ConnectedComponentDetector::new(0).detect(cube);
        assert_eq!(spots.len(), 1);
        assert_eq!(spots.spot(0).size(), voxels.len());
    }

    #[test]
    fn test_tightness() {
        // A full 3x3x3 block plus a stray voxel touching one face.
        let mut voxels = Vec::new();
        for z in 0..3 {
            for y in 0..3 {
                for x in 0..3 {
                    voxels.push(([z, y, x], 100));
                }
            }
        }
        voxels.push(([1, 1, 3], 100));
        let cube = cube_with(Shape::new(3, 5, 5), &voxels);
        let loose = ConnectedComponentDetector::new(0).detect(cube.clone());
        assert_eq!(loose.spot(0).size(), 28);
        // The stray voxel sees 9 foreground voxels in its box plus itself.
        let tight = ConnectedComponentDetector::new(0).with_tightness(11).detect(cube);
        assert_eq!(tight.len(), 1);
        assert!(!tight.spot(0).contains(&[1, 1, 3]));
        assert!(tight.spot(0).contains(&[1, 1, 1]));
    }

    #[test]
    fn test_percentile_and_top_voxels() {
        let cube = cube_with(Shape::new(1, 2, 5), &[
            ([0, 0, 0], 10), ([0, 0, 1], 20), ([0, 1, 3], 30), ([0, 1, 4], 40),
        ]);
        // Top 2 voxels: level is 30, so only the 40 survives.
        let top = Detect::TopVoxels{voxels: 2}.run(cube.clone()).unwrap();
        assert_eq!(voxel_sets(&top), [vec![[0, 1, 4]]].into_iter().collect());
        assert!(Detect::TopVoxels{voxels: 0}.run(cube.clone()).unwrap().is_empty());
        assert_eq!(Detect::TopVoxels{voxels: 100}.run(cube.clone()).unwrap().len(), 1);

        // Percentile 85 of six zeros and 10, 20, 30, 40 is 26.5.
        let high = Detect::Percentile{percentile: 85.0}.run(cube.clone()).unwrap();
        assert_eq!(voxel_sets(&high), [vec![[0, 1, 3], [0, 1, 4]]].into_iter().collect());
        assert!(Detect::Percentile{percentile: 150.0}.run(cube).is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("cc(120)".parse::<Detect>().unwrap(),
                   Detect::ConnectedComponents{level: 120});
        assert_eq!(" tight( 120 , 15 ) ".parse::<Detect>().unwrap(),
                   Detect::Tight{level: 120, tightness: 15});
        assert_eq!("percentile(99.5)".parse::<Detect>().unwrap(),
                   Detect::Percentile{percentile: 99.5});
        assert_eq!("topvoxels(500)".parse::<Detect>().unwrap(),
                   Detect::TopVoxels{voxels: 500});
        assert_eq!("spheres(3, 2.5)".parse::<Detect>().unwrap(),
                   Detect::Spheres{n: 3, radius: 2.5, wipe: None});
        assert_eq!("cylinders(n=2, radius=6, wipe_radius=8)".parse::<Detect>().unwrap(),
                   Detect::Cylinders{n: 2, radius: 6.0, wipe: Some(8.0)});

        for bad in ["cc()", "cc(1, 2)", "blur(3)", "spheres(x, 2)", "cc(120", ""] {
            assert!(matches!(bad.parse::<Detect>(), Err(SpotError::ParseDetect(_))), "{}", bad);
        }
    }

    #[test]
    fn test_parse_list_and_display() {
        let steps = Detect::parse_list("cc(120); spheres(3, 2.5, 4);").unwrap();
        assert_eq!(steps, vec![Detect::ConnectedComponents{level: 120},
                               Detect::Spheres{n: 3, radius: 2.5, wipe: Some(4.0)}]);
        let text: Vec<String> = steps.iter().map(|s| s.to_string()).collect();
        assert_eq!(text, vec!["cc(120)", "spheres(3, 2.5, 4)"]);
    }

    #[test]
    fn test_deserialize() {
        let detect: Detect = serde_json::from_str("\"topvoxels(7)\"").unwrap();
        assert_eq!(detect, Detect::TopVoxels{voxels: 7});
        assert!(serde_json::from_str::<Detect>("\"nope(1)\"").is_err());
    }

    #[test]
    fn test_run_detection_concatenates() {
        let cube = cube_with(Shape::new(3, 9, 9), &[
            ([1, 2, 2], 200), ([1, 6, 6], 100),
        ]);
        let steps = Detect::parse_list("cc(150); spheres(2, 1)").unwrap();
        let spots = run_detection(cube, &steps).unwrap();
        assert_eq!(spots.len(), 3);
        assert_eq!(spots.spot(0).coords(), &[[1, 2, 2]]);
        // The sphere pass finds the brightest voxel first.
        assert!(spots.spot(1).contains(&[1, 2, 2]));
        assert!(spots.spot(2).contains(&[1, 6, 6]));
    }
}  // mod tests.
