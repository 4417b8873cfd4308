use image::{ imageops, RgbImage };
use rusttype::Font;
use tracing::{ debug, trace };

use error::LprError;

pub mod annotate;
pub mod config;
pub mod deskew;
pub mod error;
pub mod history;
pub mod model;
pub mod plate_reader;
pub mod session;
pub mod tracker;
pub mod utils;
pub mod video;

pub use config::Config;
pub use deskew::DeskewVariant;
pub use model::{ BoundingBox, Detection, Detector, YoloGraph };

use config::ReaderConfig;

// baseline of a plate read from the whole frame
const FRAME_TEXT_POS: (u32, u32) = (7, 70);
// gap between a box and the baseline of its label
const TEXT_LIFT: u32 = 10;

/// One successful reading inside a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateReading {
    pub text: String,
    /// `None` when no plate was localized and the whole frame was read
    pub bbox: Option<BoundingBox>,
    pub variant: Option<DeskewVariant>,
}

#[derive(Debug, Clone)]
pub struct FrameResult {
    pub annotated: RgbImage,
    /// distinct plates in the order they were read
    pub plates: Vec<String>,
    pub readings: Vec<PlateReading>,
    /// annotated frame as it was right after the last successful reading
    pub captured: Option<RgbImage>,
}

impl FrameResult {

    pub fn primary_plate(&self) -> Option<&str> {
        self.plates.first().map(String::as_str)
    }

    fn record(&mut self, reading: PlateReading) {
        if !self.plates.contains(&reading.text) {
            self.plates.push(reading.text.clone());
        }
        self.readings.push(reading);
        self.captured = Some(self.annotated.clone());
    }
}

pub struct Lpr<D, O> {
    detection: D,
    ocr: O,
    reader: ReaderConfig,
    font: Option<Font<'static>>,
}

impl Lpr<YoloGraph, YoloGraph> {

    /// Load both graphs and the optional font named in `config`.
    pub fn from_config(config: &Config) -> Result<Self, LprError> {
        let detection = YoloGraph::new(&config.detector)?;
        let ocr = YoloGraph::new(&config.ocr)?;
        let font = match &config.font {
            Some(path) => Some(annotate::load_font(path)?),
            None => None,
        };
        Ok(Lpr::new(detection, ocr, config.reader.clone()).with_font(font))
    }
}

impl<D: Detector, O: Detector> Lpr<D, O> {

    pub fn new(detection: D, ocr: O, reader: ReaderConfig) -> Self {
        Lpr { detection, ocr, reader, font: None }
    }

    pub fn with_font(mut self, font: Option<Font<'static>>) -> Self {
        self.font = font;
        self
    }

    /// Read a plate image, `None` is the unknown reading.
    pub fn read_plate(&self, img: &RgbImage) -> Result<Option<String>, LprError> {
        let chars = self.ocr.detect(img)?;
        trace!(chars = chars.len(), "ocr");
        Ok(plate_reader::read_plate(&chars, &self.reader))
    }

    /// Localize plates, read each one and draw the results.
    ///
    /// Without any localized plate the whole frame goes to the OCR model. Otherwise each
    /// crop is tried with every deskew variant until one of them reads.
    pub fn process_frame(&self, frame: &RgbImage) -> Result<FrameResult, LprError> {
        let mut result = FrameResult {
            annotated: frame.clone(),
            plates: Vec::new(),
            readings: Vec::new(),
            captured: None,
        };
        let (width, height) = frame.dimensions();
        let plates = self.detection.detect(frame)?;
        debug!(boxes = plates.len(), "plate detection");

        if plates.is_empty() {
            if let Some(text) = self.read_plate(frame)? {
                let (x, y) = FRAME_TEXT_POS;
                self.label(&mut result.annotated, x, y, &text);
                result.record(PlateReading { text, bbox: None, variant: None });
            }
            return Ok(result);
        }

        for plate in plates {
            let [x, y, w, h] = match plate.bbox.pixel_rect(width, height) {
                Some(r) => r,
                None => continue,
            };
            let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
            annotate::draw_box(&mut result.annotated, &plate.bbox);
            for variant in DeskewVariant::ALL.iter() {
                let fixed = deskew::deskew(&crop, *variant);
                if let Some(text) = self.read_plate(&fixed)? {
                    debug!(plate = %text, %variant, "plate read");
                    self.label(&mut result.annotated, x, y.saturating_sub(TEXT_LIFT), &text);
                    result.record(PlateReading { text, bbox: Some(plate.bbox), variant: Some(*variant) });
                    break;
                }
            }
        }
        Ok(result)
    }

    fn label(&self, img: &mut RgbImage, x: u32, baseline: u32, text: &str) {
        if let Some(font) = &self.font {
            annotate::draw_label(img, font, x, baseline, text);
        }
    }
}


#[cfg(test)]
pub(crate) mod test {

    use image::Rgb;

    use super::*;

    use std::cell::Cell;

    /// Returns the same boxes for every image.
    pub struct FixedDetector(pub Vec<Detection>);

    impl Detector for FixedDetector {
        fn detect(&self, _img: &RgbImage) -> Result<Vec<Detection>, LprError> {
            Ok(self.0.clone())
        }
    }

    /// Reads the plate only after failing `misses` times.
    pub struct StubbornOcr {
        pub misses: Cell<usize>,
        pub chars: Vec<Detection>,
    }

    impl Detector for StubbornOcr {
        fn detect(&self, _img: &RgbImage) -> Result<Vec<Detection>, LprError> {
            let left = self.misses.get();
            if left > 0 {
                self.misses.set(left - 1);
                Ok(Vec::new())
            } else {
                Ok(self.chars.clone())
            }
        }
    }

    pub fn plate_chars(classes: &[usize]) -> Vec<Detection> {
        classes.iter().enumerate().map(|(i, class)| Detection {
            bbox: BoundingBox::new(i as f32 * 10.0, 0.0, i as f32 * 10.0 + 8.0, 12.0),
            score: 0.9,
            class: *class,
        }).collect()
    }

    pub fn plate_box(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Detection {
        Detection { bbox: BoundingBox::new(xmin, ymin, xmax, ymax), score: 0.8, class: 0 }
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(80, 60, Rgb([40, 40, 40]))
    }

    #[test]
    fn whole_frame_read_without_boxes() -> Result<(), LprError> {
        let ocr = StubbornOcr { misses: Cell::new(0), chars: plate_chars(&[0, 1, 9, 2, 3, 4, 5]) };
        let lpr = Lpr::new(FixedDetector(vec![]), ocr, ReaderConfig::default());
        let res = lpr.process_frame(&frame())?;
        assert_eq!(res.plates, vec!["12A3456".to_string()]);
        assert_eq!(res.readings[0].bbox, None);
        assert!(res.captured.is_some());
        Ok(())
    }

    #[test]
    fn nothing_read_nothing_captured() -> Result<(), LprError> {
        let ocr = StubbornOcr { misses: Cell::new(usize::MAX), chars: vec![] };
        let lpr = Lpr::new(FixedDetector(vec![plate_box(10.0, 10.0, 50.0, 30.0)]), ocr, ReaderConfig::default());
        let res = lpr.process_frame(&frame())?;
        assert!(res.plates.is_empty());
        assert!(res.captured.is_none());
        // the box is drawn anyway
        assert_eq!(res.annotated.get_pixel(10, 10), &annotate::BOX_COLOR);
        Ok(())
    }

    #[test]
    fn variants_tried_in_order_until_read() -> Result<(), LprError> {
        let ocr = StubbornOcr { misses: Cell::new(2), chars: plate_chars(&[0, 1, 9, 2, 3, 4, 5]) };
        let lpr = Lpr::new(FixedDetector(vec![plate_box(10.0, 10.0, 50.0, 30.0)]), ocr, ReaderConfig::default());
        let res = lpr.process_frame(&frame())?;
        assert_eq!(res.readings.len(), 1);
        assert_eq!(res.readings[0].variant, Some(DeskewVariant::ALL[2]));
        assert_eq!(res.primary_plate(), Some("12A3456"));
        Ok(())
    }

    #[test]
    fn same_plate_twice_is_deduplicated() -> Result<(), LprError> {
        let boxes = vec![plate_box(0.0, 0.0, 30.0, 20.0), plate_box(40.0, 30.0, 75.0, 55.0), plate_box(90.0, 90.0, 99.0, 99.0)];
        let ocr = StubbornOcr { misses: Cell::new(0), chars: plate_chars(&[0, 1, 9, 2, 3, 4, 5]) };
        let lpr = Lpr::new(FixedDetector(boxes), ocr, ReaderConfig::default());
        let res = lpr.process_frame(&frame())?;
        // the third box is outside the frame
        assert_eq!(res.readings.len(), 2);
        assert_eq!(res.plates.len(), 1);
        Ok(())
    }
}
