//! Orientation fixes tried on a plate crop before reading it again.

use image::{ imageops, GrayImage, Rgb, RgbImage };
use imageproc::{ edges, filter, geometric_transformations::{ rotate_about_center, Interpolation }, hough };
use imageproc::hough::{ LineDetectionOptions, PolarLine };
use palette::{ Lab, LinSrgb, Srgb };

use std::fmt;

use crate::utils;

const CLIP_LIMIT: f32 = 3.0;
const TILE_GRID: u32 = 8;
// tilts above this are taken for vertical strokes, not the plate border
const MAX_TILT: f32 = 30.0;
// with center threshold lines centred this close to the top edge are ignored
const TOP_MARGIN: f32 = 7.0;
const MIN_VOTES: u32 = 30;
// distance in pixels for an edge pixel to count as lying on a line
const ON_LINE: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeskewVariant {
    pub change_contrast: bool,
    pub center_threshold: bool,
}

impl DeskewVariant {

    /// Every variant, in the order they are tried.
    pub const ALL: [DeskewVariant; 4] = [
        DeskewVariant { change_contrast: false, center_threshold: false },
        DeskewVariant { change_contrast: false, center_threshold: true },
        DeskewVariant { change_contrast: true, center_threshold: false },
        DeskewVariant { change_contrast: true, center_threshold: true },
    ];
}

impl fmt::Display for DeskewVariant {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contrast={} center={}", self.change_contrast as u8, self.center_threshold as u8)
    }
}

/// CLAHE on the L* channel, colour is left alone.
pub fn change_contrast(img: &RgbImage) -> RgbImage {
    let (width, height) = img.dimensions();
    let labs: Vec<Lab> = img.pixels().map(|p| {
        let rgb = Srgb::new(p.0[0] as f32 / 255.0, p.0[1] as f32 / 255.0, p.0[2] as f32 / 255.0);
        Lab::from(rgb)
    }).collect();
    let lightness = image::GrayImage::from_fn(width, height, |x, y| {
        let l = labs[(y * width + x) as usize].l;
        image::Luma([(l * 255.0 / 100.0).round().max(0.0).min(255.0) as u8])
    });
    let lightness = utils::clahe(&lightness, CLIP_LIMIT, TILE_GRID);

    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let mut lab = labs[(y * width + x) as usize];
        lab.l = lightness.get_pixel(x, y).0[0] as f32 * 100.0 / 255.0;
        let rgb = Srgb::from_linear(LinSrgb::from(lab));
        let to_u8 = |c: f32| (c * 255.0).round().max(0.0).min(255.0) as u8;
        *pixel = Rgb([to_u8(rgb.red), to_u8(rgb.green), to_u8(rgb.blue)]);
    }
    out
}

/// Tilt in degrees of the topmost near horizontal line, 0 when there is none.
/// A positive tilt means the line falls to the right.
pub fn skew_from_lines(lines: &[PolarLine], width: u32, height: u32, center_threshold: bool) -> f32 {
    let mid_x = width as f32 / 2.0;
    lines.iter().filter_map(|line| {
        let tilt = line.angle_in_degrees as f32 - 90.0;
        if tilt.abs() > MAX_TILT {
            return None;
        }
        // x cos(t) + y sin(t) = r, evaluated in the middle of the crop
        let theta = (line.angle_in_degrees as f32).to_radians();
        let center_y = (line.r - mid_x * theta.cos()) / theta.sin();
        if center_y < 0.0 || center_y >= height as f32 {
            return None;
        }
        if center_threshold && center_y < TOP_MARGIN {
            return None;
        }
        Some((center_y, tilt))
    }).fold(None, |top: Option<(f32, f32)>, candidate| match top {
        Some(current) if current.0 <= candidate.0 => Some(current),
        _ => Some(candidate),
    }).map(|(_, tilt)| tilt).unwrap_or(0.0)
}

/// Length of the longest run of edge pixels lying on `line`, measured along it.
/// Pixels further apart than `max_gap` split the run.
fn line_span(edges: &GrayImage, line: &PolarLine, max_gap: f32) -> f32 {
    let (sin, cos) = (line.angle_in_degrees as f32).to_radians().sin_cos();
    let mut along: Vec<i32> = edges.enumerate_pixels()
        .filter(|(x, y, p)| p.0[0] > 0 && (*x as f32 * cos + *y as f32 * sin - line.r).abs() <= ON_LINE)
        .map(|(x, y, _)| (y as f32 * cos - x as f32 * sin).round() as i32)
        .collect();
    along.sort_unstable();

    let mut best = 0;
    let mut start = match along.first() {
        Some(&first) => first,
        None => return 0.0,
    };
    for pair in along.windows(2) {
        if (pair[1] - pair[0]) as f32 > max_gap {
            start = pair[1];
        }
        best = best.max(pair[1] - start);
    }
    best as f32
}

/// Detects lines with at least 30 votes, keeps the ones spanning two thirds of the
/// crop width, and measures the topmost.
pub fn compute_skew(img: &RgbImage, center_threshold: bool) -> f32 {
    let (width, height) = img.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }
    let gray = imageops::grayscale(img);
    let gray = filter::median_filter(&gray, 1, 1);
    let edges = edges::canny(&gray, 30.0, 100.0);
    let options = LineDetectionOptions {
        vote_threshold: MIN_VOTES,
        suppression_radius: 8,
    };
    let min_length = width as f32 / 1.5;
    let max_gap = height as f32 / 3.0;
    let lines: Vec<PolarLine> = hough::detect_lines(&edges, options).into_iter()
        .filter(|line| line_span(&edges, line, max_gap) >= min_length)
        .collect();
    skew_from_lines(&lines, width, height, center_threshold)
}

/// Rotate about the centre, positive degrees turn counter clockwise.
pub fn rotate(img: &RgbImage, degrees: f32) -> RgbImage {
    if degrees == 0.0 {
        return img.clone();
    }
    rotate_about_center(img, -degrees.to_radians(), Interpolation::Bilinear, Rgb([0, 0, 0]))
}

pub fn deskew(img: &RgbImage, variant: DeskewVariant) -> RgbImage {
    let angle = if variant.change_contrast {
        compute_skew(&change_contrast(img), variant.center_threshold)
    } else {
        compute_skew(img, variant.center_threshold)
    };
    rotate(img, angle)
}
