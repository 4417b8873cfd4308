use serde::{ Deserialize, Deserializer, Serialize };
use tracing::{ debug, info, warn };

use std::fs;
use std::io::ErrorKind;
use std::path::{ Path, PathBuf };

use crate::error::{ LprError, LprErrorKind };

/// Labels of the character model, indexed by class id.
pub const PLATE_CHARS: [&str; 30] = ["1", "2", "3", "4", "5", "6", "7", "8", "9", "A", "B", "C", "D", "E", "F",
             "G", "H", "K", "L", "M", "N", "P", "S", "T", "U", "V", "X", "Y", "Z", "0"
             ];

pub const DEFAULT_CAMERA: &str = "http://192.168.1.18:4747/video";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "detector_section")]
    pub detector: ModelConfig,
    #[serde(deserialize_with = "ocr_section")]
    pub ocr: ModelConfig,
    pub reader: ReaderConfig,
    pub history: HistoryConfig,
    pub realtime: RealtimeConfig,
    /// TTF used to write plates on the annotated frames, no text is drawn without it
    pub font: Option<PathBuf>,
}

/// One exported YOLOv5 graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub model: PathBuf,
    pub input_op: String,
    pub output_op: String,
    pub input_size: u32,
    pub confidence: f32,
    pub iou: f32,
    pub max_detections: usize,
    /// exported graphs emit xywh divided by the input size
    pub normalized_boxes: bool,
}

// A model section as written in the file, missing keys fall back to the
// defaults of the model it configures.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ModelSection {
    model: Option<PathBuf>,
    input_op: Option<String>,
    output_op: Option<String>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
    max_detections: Option<usize>,
    normalized_boxes: Option<bool>,
}

impl ModelSection {

    fn over(self, base: ModelConfig) -> ModelConfig {
        ModelConfig {
            model: self.model.unwrap_or(base.model),
            input_op: self.input_op.unwrap_or(base.input_op),
            output_op: self.output_op.unwrap_or(base.output_op),
            input_size: self.input_size.unwrap_or(base.input_size),
            confidence: self.confidence.unwrap_or(base.confidence),
            iou: self.iou.unwrap_or(base.iou),
            max_detections: self.max_detections.unwrap_or(base.max_detections),
            normalized_boxes: self.normalized_boxes.unwrap_or(base.normalized_boxes),
        }
    }
}

fn detector_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ModelConfig, D::Error> {
    Ok(ModelSection::deserialize(deserializer)?.over(ModelConfig::detector()))
}

fn ocr_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ModelConfig, D::Error> {
    Ok(ModelSection::deserialize(deserializer)?.over(ModelConfig::ocr()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub labels: Vec<String>,
    pub min_chars: usize,
    pub max_chars: usize,
    pub line_tolerance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub image_dir: PathBuf,
    pub video_dir: PathBuf,
    pub log_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub source: String,
    pub record_fps: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            detector: ModelConfig::detector(),
            ocr: ModelConfig::ocr(),
            reader: ReaderConfig::default(),
            history: HistoryConfig::default(),
            realtime: RealtimeConfig::default(),
            font: None,
        }
    }
}

impl ModelConfig {

    pub fn detector() -> Self {
        ModelConfig {
            model: PathBuf::from("./model/LP_detector_nano.pb"),
            ..ModelConfig::default()
        }
    }

    pub fn ocr() -> Self {
        ModelConfig {
            model: PathBuf::from("./model/LP_ocr_nano.pb"),
            confidence: 0.60,
            ..ModelConfig::default()
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            model: PathBuf::new(),
            input_op: "x".to_string(),
            output_op: "Identity".to_string(),
            input_size: 640,
            confidence: 0.25,
            iou: 0.45,
            max_detections: 1000,
            normalized_boxes: true,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            labels: PLATE_CHARS.iter().map(|c| c.to_string()).collect(),
            min_chars: 7,
            max_chars: 10,
            line_tolerance: 3.0,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            image_dir: PathBuf::from("history_image"),
            video_dir: PathBuf::from("history_video"),
            log_file: "history.txt".to_string(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            source: DEFAULT_CAMERA.to_string(),
            record_fps: 30,
        }
    }
}

impl Config {

    /// Read a JSON config, absent keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LprError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Without a path, or when the file does not exist, the defaults are used.
    /// A file that exists but does not parse is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, LprError> {
        match path {
            Some(path) => match Self::from_file(path) {
                Err(e) if matches!(e.kind(), LprErrorKind::IOError(io) if io.kind() == ErrorKind::NotFound) => {
                    warn!(path = %path.display(), "config file not found, using defaults");
                    Ok(Config::default())
                }
                res => res,
            },
            None => {
                debug!("no config given, using defaults");
                Ok(Config::default())
            }
        }
    }
}


#[cfg(test)]
mod test {

    use tempfile::tempdir;

    use super::*;

    use std::error::Error;

    #[test]
    fn ocr_is_stricter_than_detector() {
        let config = Config::default();
        assert_eq!(config.detector.confidence, 0.25);
        assert_eq!(config.ocr.confidence, 0.60);
        assert_eq!(config.detector.input_size, 640);
        assert_eq!(config.reader.labels.len(), 30);
        assert_eq!(config.realtime.source, DEFAULT_CAMERA);
        assert!(config.font.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() -> Result<(), Box<dyn Error>> {
        let raw = r#"{
            "detector": { "iou": 0.5 },
            "ocr": { "model": "m/ocr.pb" },
            "history": { "image_dir": "/tmp/plates" },
            "font": "fonts/DejaVuSans.ttf"
        }"#;
        let config: Config = serde_json::from_str(raw)?;
        assert_eq!(config.ocr.model, PathBuf::from("m/ocr.pb"));
        assert_eq!(config.ocr.confidence, 0.60);
        assert_eq!(config.detector.iou, 0.5);
        assert_eq!(config.detector.model, ModelConfig::detector().model);
        assert_eq!(config.ocr.output_op, "Identity");
        assert_eq!(config.history.image_dir, PathBuf::from("/tmp/plates"));
        assert_eq!(config.history.video_dir, PathBuf::from("history_video"));
        assert_eq!(config.font, Some(PathBuf::from("fonts/DejaVuSans.ttf")));
        Ok(())
    }

    #[test]
    fn missing_file_falls_back_to_defaults() -> Result<(), Box<dyn Error>> {
        let missing = Path::new("/definitely/not/here.json");
        assert!(Config::from_file(missing).is_err());
        assert_eq!(Config::load_or_default(Some(missing))?, Config::default());
        assert_eq!(Config::load_or_default(None)?, Config::default());
        Ok(())
    }

    #[test]
    fn broken_file_is_an_error() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, "{ \"detector\": ")?;
        assert!(Config::load_or_default(Some(&path)).is_err());
        Ok(())
    }
}
