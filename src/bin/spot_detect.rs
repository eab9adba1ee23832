// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use env_logger;
use image::{ImageReader, Rgb, RgbImage};
use imageproc::drawing;
use log::{info, warn};
use ndarray::Array3;
use serde::Serialize;

use spot_detect::colors::DEFAULT_PALETTE;
use spot_detect::{AnalysisConfig, PairRecord, PhysicalScale, SignalRecord,
                  SpotCollection, StatRecord, VarietyRecord, VoxelCube, analyze};

/// Runs cell-centred spot analysis on a stack of RGB slice images.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Directory holding one RGB image per z slice; slices are taken in
    /// file name order.
    #[arg(short, long)]
    input: String,

    /// Directory where the overlay image and records are written.
    #[arg(short, long)]
    output: String,

    /// JSON analysis configuration. Defaults are used when absent.
    #[arg(short, long)]
    config: Option<String>,

    /// Voxel size along z, nm.
    #[arg(long)]
    scale_z: Option<f64>,

    /// Voxel size along y, nm.
    #[arg(long)]
    scale_y: Option<f64>,

    /// Voxel size along x, nm.
    #[arg(long)]
    scale_x: Option<f64>,

    /// Log every record, not just the counts.
    #[arg(short, long, default_value_t = false)]
    verbose: std::primitive::bool,
}

#[derive(Serialize)]
struct Report {
    scale: Option<PhysicalScale>,
    signals: Vec<SignalRecord>,
    pairs: Vec<PairRecord>,
    stats: Vec<StatRecord>,
    varieties: Vec<VarietyRecord>,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let input_metadata = fs::metadata(&args.input).unwrap_or_else(|e| {
        panic!("Input dir '{}' does not exist? {:?}", args.input, e);
    });
    assert!(input_metadata.is_dir(), "Input '{}' must be a directory", args.input);
    let output_metadata = fs::metadata(&args.output).unwrap_or_else(|e| {
        panic!("Output dir '{}' does not exist? {:?}", args.output, e);
    });
    assert!(output_metadata.is_dir(), "Output '{}' must be a directory", args.output);

    let config = match &args.config {
        Some(path) => AnalysisConfig::from_json_file(path).unwrap_or_else(|e| {
            panic!("Cannot load config '{}': {}", path, e);
        }),
        None => AnalysisConfig::default(),
    };
    let scale = match (args.scale_z, args.scale_y, args.scale_x) {
        (Some(z), Some(y), Some(x)) => Some(PhysicalScale::new(z, y, x)),
        (None, None, None) => None,
        _ => panic!("Give all of --scale-z, --scale-y, --scale-x or none"),
    };

    let cubes = load_channels(Path::new(&args.input), scale);
    let analysis_start = Instant::now();
    let analysis = analyze(cubes, &config).unwrap_or_else(|e| {
        panic!("Analysis failed: {}", e);
    });
    let mut varieties = Vec::new();
    for channel in &config.onion_channels {
        varieties.extend(analysis.variety_records(channel).unwrap());
    }
    let report = Report{
        scale,
        signals: analysis.signal_records().unwrap(),
        pairs: analysis.pair_records(&config.onion_channels).unwrap(),
        stats: analysis.stat_records(&config.spot_sizes).unwrap(),
        varieties,
    };
    info!("{} signal, {} pair, {} stat and {} variety records in {:?}",
          report.signals.len(), report.pairs.len(), report.stats.len(),
          report.varieties.len(), analysis_start.elapsed());
    if args.verbose {
        for record in &report.signals {
            info!("{:?}", record);
        }
        for record in &report.pairs {
            info!("{:?}", record);
        }
    }

    let mut records_path = PathBuf::from(&args.output);
    records_path.push("records.json");
    fs::write(&records_path, serde_json::to_string_pretty(&report).unwrap()).unwrap();
    info!("Wrote {:?}", records_path);

    // Outline cells in the border colour and signals in the few-colour
    // palette, over the flat view of all channels.
    let mut overlay = flat_image(analysis.cubes());
    for (name, collection) in analysis.collections() {
        let mut collection = collection.clone();
        if name == analysis.cell_channel() {
            collection.assign_color(config.border_color);
        } else {
            collection.assign_few_colors(&DEFAULT_PALETTE, false);
            circle_centers(&mut overlay, &collection);
        }
        draw_outlines(&mut overlay, &collection);
    }
    let mut overlay_path = PathBuf::from(&args.output);
    overlay_path.push("overlay.png");
    overlay.save(&overlay_path).unwrap();
    info!("Wrote {:?}", overlay_path);
}

// Reads every decodable image in `dir` as one z slice, splitting the
// r, g and b components into three cubes.
fn load_channels(dir: &Path, scale: Option<PhysicalScale>) -> Vec<Arc<VoxelCube>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir).unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let load_start = Instant::now();
    let mut slices = Vec::<RgbImage>::new();
    for path in &paths {
        match ImageReader::open(path).unwrap().decode() {
            Ok(img) => slices.push(img.into_rgb8()),
            Err(e) => warn!("Skipping {:?} due to: {:?}", path, e),
        }
    }
    assert!(!slices.is_empty(), "No images in '{:?}'", dir);
    let (width, height) = slices[0].dimensions();
    for (path, slice) in paths.iter().zip(&slices) {
        assert_eq!(slice.dimensions(), (width, height),
                   "Slice {:?} differs in size", path);
    }

    let shape = (slices.len(), height as usize, width as usize);
    let mut channels = vec![Array3::<u8>::zeros(shape); 3];
    for (z, slice) in slices.iter().enumerate() {
        for (x, y, pixel) in slice.enumerate_pixels() {
            for (c, channel) in channels.iter_mut().enumerate() {
                channel[[z, y as usize, x as usize]] = pixel.0[c];
            }
        }
    }
    info!("Loaded {} slices of WxH {}x{} in {:?}",
          slices.len(), width, height, load_start.elapsed());
    channels.into_iter().map(|data| {
        let cube = VoxelCube::new(data);
        Arc::new(match scale {
            Some(s) => cube.with_scale(s),
            None => cube,
        })
    }).collect()
}

// Maximum projections of the first three channels as r, g, b.
fn flat_image(cubes: &[Arc<VoxelCube>]) -> RgbImage {
    let flats: Vec<_> = cubes.iter().take(3).map(|c| c.max_projection()).collect();
    let (height, width) = flats[0].dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let mut rgb = [0_u8; 3];
        for (c, flat) in flats.iter().enumerate() {
            rgb[c] = flat[[y as usize, x as usize]];
        }
        Rgb(rgb)
    })
}

fn draw_outlines(image: &mut RgbImage, spots: &SpotCollection) {
    let outlines = match spots.outlines() {
        Ok(outlines) => outlines,
        Err(e) => {
            warn!("No outlines: {}", e);
            return;
        },
    };
    for spot in outlines.spots() {
        let color = Rgb(spot.color().unwrap_or([255, 255, 255]));
        for p in spot.coords() {
            image.put_pixel(p[2] as u32, p[1] as u32, color);
        }
    }
}

fn circle_centers(image: &mut RgbImage, spots: &SpotCollection) {
    for view in spots.views() {
        if let Ok([_, y, x]) = view.center_of_mass() {
            let color = Rgb(view.spot().color().unwrap_or([255, 255, 255]));
            drawing::draw_hollow_circle_mut(image, (x as i32, y as i32), 4, color);
        }
    }
}
