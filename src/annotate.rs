use image::{ Rgb, RgbImage };
use imageproc::{ drawing, rect };
use rusttype::{ Font, Scale };

use std::fs;
use std::path::Path;

use crate::error::LprError;
use crate::model::BoundingBox;

pub const BOX_COLOR: Rgb<u8> = Rgb([225, 0, 0]);
pub const TEXT_COLOR: Rgb<u8> = Rgb([12, 255, 36]);
const BOX_THICKNESS: u32 = 2;
const TEXT_SCALE: f32 = 24.0;

pub fn load_font(path: impl AsRef<Path>) -> Result<Font<'static>, LprError> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    Font::try_from_vec(data).ok_or_else(|| LprError::font(format!("{} is not a usable font", path.display())))
}

/// Hollow rectangle, grown inwards to `BOX_THICKNESS` pixels.
pub fn draw_box(img: &mut RgbImage, bbox: &BoundingBox) {
    let (width, height) = img.dimensions();
    let [x, y, w, h] = match bbox.pixel_rect(width, height) {
        Some(r) => r,
        None => return,
    };
    for i in 0..BOX_THICKNESS {
        if w <= 2 * i || h <= 2 * i {
            break;
        }
        let rect = rect::Rect::at((x + i) as i32, (y + i) as i32).of_size(w - 2 * i, h - 2 * i);
        drawing::draw_hollow_rect_mut(img, rect, BOX_COLOR);
    }
}

/// Write `text` with its baseline at `baseline`.
pub fn draw_label(img: &mut RgbImage, font: &Font<'_>, x: u32, baseline: u32, text: &str) {
    let scale = Scale::uniform(TEXT_SCALE);
    let top = text_top(baseline, font.v_metrics(scale).ascent);
    drawing::draw_text_mut(img, TEXT_COLOR, x, top, scale, font, text);
}

// draw_text_mut places the top of the line box, the baseline sits one ascent lower
fn text_top(baseline: u32, ascent: f32) -> u32 {
    baseline.saturating_sub(ascent.max(0.0).ceil() as u32)
}
