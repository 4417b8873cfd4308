use tensorflow::{ Tensor, Session, SessionOptions, Graph, SessionRunArgs, ImportGraphDefOptions };
use image::{ imageops, imageops::FilterType, Rgb, RgbImage };
use tracing::debug;

use std::cmp::Ordering;
use std::fs::File;
use std::io::prelude::*;

use crate::config::ModelConfig;
use crate::error::LprError;

const PAD_VALUE: u8 = 114;

/// A box in source image pixels, corners as xmin, ymin, xmax, ymax.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub class: usize,
}

/// Anything that turns an image into scored, classed boxes.
pub trait Detector {
    fn detect(&self, img: &RgbImage) -> Result<Vec<Detection>, LprError>;
}

impl BoundingBox {

    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        BoundingBox { xmin, ymin, xmax, ymax }
    }

    pub fn width(&self) -> f32 {
        (self.xmax - self.xmin).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.ymax - self.ymin).max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let w = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin)).max(0.0);
        let h = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin)).max(0.0);
        let inter = w * h;
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// x, y, width, height truncated to whole pixels inside a `width`x`height` image,
    /// `None` when nothing is left.
    pub fn pixel_rect(&self, width: u32, height: u32) -> Option<[u32; 4]> {
        let x = self.xmin.max(0.0) as u32;
        let y = self.ymin.max(0.0) as u32;
        if x >= width || y >= height {
            return None;
        }
        let w = (self.width() as u32).min(width - x);
        let h = (self.height() as u32).min(height - y);
        if w == 0 || h == 0 {
            None
        } else {
            Some([x, y, w, h])
        }
    }
}

/// Resize keeping the aspect ratio, centred on a square gray canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {

    pub fn apply(img: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
        let (width, height) = img.dimensions();
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).max(1).min(size);
        let new_h = ((height as f32 * scale).round() as u32).max(1).min(size);
        let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);
        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;
        let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
        imageops::replace(&mut canvas, &resized, pad_x, pad_y);
        (canvas, Letterbox { scale, pad_x, pad_y })
    }

    /// model input coordinates back to the source image, clipped to it
    pub fn restore(&self, bbox: BoundingBox, width: u32, height: u32) -> BoundingBox {
        let unmap = |v: f32, pad: u32, limit: u32| ((v - pad as f32) / self.scale).max(0.0).min(limit as f32);
        BoundingBox {
            xmin: unmap(bbox.xmin, self.pad_x, width),
            ymin: unmap(bbox.ymin, self.pad_y, height),
            xmax: unmap(bbox.xmax, self.pad_x, width),
            ymax: unmap(bbox.ymax, self.pad_y, height),
        }
    }
}

/// Turn a raw `[1, N, 5 + classes]` YOLOv5 output into boxes in model input pixels.
/// Rows are `cx, cy, w, h, objectness, class scores...`.
pub fn decode_output(output: &[f32], row_len: usize, config: &ModelConfig) -> Result<Vec<Detection>, LprError> {
    if row_len <= 5 || output.len() % row_len != 0 {
        return Err(LprError::invalid_input(format!(
            "unexpected detector output: {} values in rows of {}", output.len(), row_len)));
    }
    let coord_scale = if config.normalized_boxes { config.input_size as f32 } else { 1.0 };
    let candidates: Vec<Detection> = output.chunks(row_len).filter_map(|row| {
        let objectness = row[4];
        if objectness <= config.confidence {
            return None;
        }
        let (class, class_score) = row[5..].iter().enumerate().fold((0, f32::MIN), |best, (i, v)| {
            if *v > best.1 { (i, *v) } else { best }
        });
        let score = objectness * class_score;
        if score <= config.confidence {
            return None;
        }
        let (cx, cy) = (row[0] * coord_scale, row[1] * coord_scale);
        let (w, h) = (row[2] * coord_scale, row[3] * coord_scale);
        let bbox = BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
        Some(Detection { bbox, score, class })
    }).collect();
    Ok(non_max_suppression(candidates, config.iou, config.max_detections))
}

/// Greedy per-class suppression, highest score first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou: f32, max_detections: usize) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.len() == max_detections {
            break;
        }
        let suppressed = keep.iter().any(|k| k.class == det.class && k.bbox.iou(&det.bbox) > iou);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}

/// A YOLOv5 network exported as a frozen TensorFlow graph.
pub struct YoloGraph {
    graph: Graph,
    session: Session,
    config: ModelConfig,
}

impl YoloGraph {

    pub fn new(config: &ModelConfig) -> Result<Self, LprError> {
        let mut pb_file = File::open(&config.model)?;
        let mut pb = Vec::new();
        pb_file.read_to_end(&mut pb)?;
        // import graph def
        let mut graph = Graph::new();
        let graph_def_options = ImportGraphDefOptions::new();
        graph.import_graph_def(&pb, &graph_def_options)?;
        // new session
        let session_option = SessionOptions::new();
        let session = Session::new(&session_option, &graph)?;
        debug!(model = %config.model.display(), "graph loaded");
        Ok(Self { graph, session, config: config.clone() })
    }

    /// Feed one NHWC image tensor, return the raw output and its last dimension.
    pub fn run(&self, input: &Tensor<f32>) -> Result<(Tensor<f32>, usize), LprError> {
        let graph = &self.graph;
        let mut args = SessionRunArgs::new();
        args.add_feed(&graph.operation_by_name_required(&self.config.input_op)?, 0, input);
        let token = args.request_fetch(&graph.operation_by_name_required(&self.config.output_op)?, 0);
        self.session.run(&mut args)?;
        let res: Tensor<f32> = args.fetch(token)?;
        let row_len = res.dims().last().copied().unwrap_or(0) as usize;
        Ok((res, row_len))
    }
}

impl Detector for YoloGraph {

    fn detect(&self, img: &RgbImage) -> Result<Vec<Detection>, LprError> {
        let size = self.config.input_size;
        let (width, height) = img.dimensions();
        let (input, letterbox) = Letterbox::apply(img, size);
        let data: Vec<f32> = input.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
        let tensor: Tensor<f32> = Tensor::new(&[1, size as u64, size as u64, 3]);
        let tensor = tensor.with_values(&data)?;

        let (output, row_len) = self.run(&tensor)?;
        let detections = decode_output(&output, row_len, &self.config)?;
        Ok(detections.into_iter().map(|det| Detection {
            bbox: letterbox.restore(det.bbox, width, height),
            ..det
        }).collect())
    }
}
