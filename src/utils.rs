use image::{ GrayImage, Luma };
use tensorflow::{ Graph, ImportGraphDefOptions };

use std::fs::File;
use std::path::Path;
use std::io::prelude::*;

use crate::error::LprError;

/// Names of every operation in a frozen graph, handy to find the input and output of
/// an exported model.
pub fn graph_operation_names(pb_file: impl AsRef<Path>) -> Result<Vec<String>, LprError> {
    let mut pb_file = File::open(pb_file)?;
    let mut pb = Vec::new();
    pb_file.read_to_end(&mut pb)?;
    // import graph def
    let mut graph = Graph::new();
    let graph_def_options = ImportGraphDefOptions::new();
    graph.import_graph_def(&pb, &graph_def_options)?;
    let mut names = Vec::new();
    for op in graph.operation_iter() {
        names.push(op.name().map_err(tensorflow::Status::from)?);
    }
    Ok(names)
}

// cumulative mapping of one tile, the histogram is clipped at `clip_limit` times the
// average bin and the excess spread over all bins
fn tile_lut(img: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[img.get_pixel(x, y).0[0] as usize] += 1;
        }
    }
    let area = ((x1 - x0) * (y1 - y0)).max(1);
    let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
    let mut excess = 0;
    hist.iter_mut().for_each(|v| {
        if *v > limit {
            excess += *v - limit;
            *v = limit;
        }
    });
    let bonus = excess / 256;
    let rest = (excess % 256) as usize;
    hist.iter_mut().enumerate().for_each(|(i, v)| {
        *v += bonus + if i < rest { 1 } else { 0 };
    });

    let mut lut = [0u8; 256];
    let mut cdf = 0;
    for (i, v) in hist.iter().enumerate() {
        cdf += v;
        lut[i] = ((cdf as f32 * 255.0 / area as f32).round()).min(255.0) as u8;
    }
    lut
}

/// Contrast limited adaptive histogram equalization on a `grid`x`grid` tiling, each
/// pixel is bilinearly blended from the four surrounding tile mappings.
pub fn clahe(img: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = img.dimensions();
    let (gx, gy) = (grid.min(width).max(1), grid.min(height).max(1));
    let tile_w = ((width + gx - 1) / gx).max(1);
    let tile_h = ((height + gy - 1) / gy).max(1);
    // no empty trailing tiles
    let grid_x = (width + tile_w - 1) / tile_w;
    let grid_y = (height + tile_h - 1) / tile_h;

    let mut luts = Vec::with_capacity((grid_x * grid_y) as usize);
    for ty in 0..grid_y {
        for tx in 0..grid_x {
            let (x0, y0) = ((tx * tile_w).min(width), (ty * tile_h).min(height));
            let (x1, y1) = ((x0 + tile_w).min(width), (y0 + tile_h).min(height));
            luts.push(tile_lut(img, x0, y0, x1, y1, clip_limit));
        }
    }

    // position of a pixel between tile centres, as (lower tile, upper tile, weight of upper)
    let locate = |p: u32, tile: u32, tiles: u32| -> (usize, usize, f32) {
        let pos = (p as f32 + 0.5) / tile as f32 - 0.5;
        if pos <= 0.0 {
            return (0, 0, 0.0);
        }
        let lo = (pos.floor() as u32).min(tiles - 1);
        let hi = (lo + 1).min(tiles - 1);
        (lo as usize, hi as usize, pos - lo as f32)
    };

    let mut out = GrayImage::new(width, height);
    for (x, y, pixel) in img.enumerate_pixels() {
        let v = pixel.0[0] as usize;
        let (x_lo, x_hi, wx) = locate(x, tile_w, grid_x);
        let (y_lo, y_hi, wy) = locate(y, tile_h, grid_y);
        let at = |tx: usize, ty: usize| luts[ty * grid_x as usize + tx][v] as f32;
        let top = at(x_lo, y_lo) * (1.0 - wx) + at(x_hi, y_lo) * wx;
        let bottom = at(x_lo, y_hi) * (1.0 - wx) + at(x_hi, y_hi) * wx;
        let value = top * (1.0 - wy) + bottom * wy;
        out.put_pixel(x, y, Luma([value.round().max(0.0).min(255.0) as u8]));
    }
    out
}


#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn clahe_keeps_size_and_flat_images_flat() {
        let img = GrayImage::from_pixel(37, 21, Luma([90]));
        let out = clahe(&img, 3.0, 8);
        assert_eq!(out.dimensions(), (37, 21));
        let first = out.get_pixel(0, 0).0[0];
        assert!(out.pixels().all(|p| p.0[0] == first));
    }

    #[test]
    fn clahe_stretches_low_contrast() {
        // texture with values between 100 and 115 only
        let img = GrayImage::from_fn(256, 256, |x, y| Luma([100 + ((x + y) % 16) as u8]));
        let out = clahe(&img, 3.0, 8);
        let (min, max) = out.pixels().fold((255u8, 0u8), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
        assert!(max - min > 40, "range {}..{}", min, max);
    }

    #[test]
    fn missing_graph_is_io_error() {
        assert!(graph_operation_names("/no/such/graph.pb").is_err());
    }
}
