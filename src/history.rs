use chrono::Local;
use image::RgbImage;
use tracing::{ info, warn };

use std::fs::{ self, OpenOptions };
use std::io::prelude::*;
use std::path::{ Path, PathBuf };

use crate::config::HistoryConfig;
use crate::error::LprError;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub file_name: String,
    pub plate: String,
}

/// Saved plate snapshots, their `filename,plate` log and the realtime recordings.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    image_dir: PathBuf,
    video_dir: PathBuf,
    log_path: PathBuf,
}

impl HistoryStore {

    pub fn open(config: &HistoryConfig) -> Result<Self, LprError> {
        for dir in [&config.image_dir, &config.video_dir].iter() {
            fs::create_dir_all(dir)?;
        }
        Ok(HistoryStore {
            image_dir: config.image_dir.clone(),
            video_dir: config.video_dir.clone(),
            log_path: config.image_dir.join(&config.log_file),
        })
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn video_dir(&self) -> &Path {
        &self.video_dir
    }

    /// Write the snapshot as `plate_<stamp>.jpg` and log it.
    pub fn save_capture(&self, image: &RgbImage, plate: &str) -> Result<PathBuf, LprError> {
        let path = unique_path(&self.image_dir, &format!("plate_{}", stamp()), "jpg");
        image.save(&path)?;
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let mut log = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        writeln!(log, "{},{}", file_name, plate)?;
        info!(plate, file = %file_name, "saved capture");
        Ok(path)
    }

    pub fn new_recording_path(&self) -> PathBuf {
        unique_path(&self.video_dir, &format!("realtime_{}", stamp()), "mp4")
    }

    pub fn list_images(&self) -> Result<Vec<String>, LprError> {
        list_with_extension(&self.image_dir, "jpg")
    }

    pub fn list_videos(&self) -> Result<Vec<String>, LprError> {
        list_with_extension(&self.video_dir, "mp4")
    }

    pub fn entries(&self) -> Result<Vec<HistoryEntry>, LprError> {
        let raw = match fs::read_to_string(&self.log_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(raw.lines().filter_map(|line| {
            let mut parts = line.splitn(2, ',');
            match (parts.next(), parts.next()) {
                (Some(file_name), Some(plate)) if !file_name.is_empty() && !plate.is_empty() => Some(HistoryEntry {
                    file_name: file_name.to_string(),
                    plate: plate.to_string(),
                }),
                _ => {
                    if !line.trim().is_empty() {
                        warn!(line, "skipping malformed history line");
                    }
                    None
                }
            }
        }).collect())
    }
}

fn stamp() -> String {
    Local::now().format(STAMP_FORMAT).to_string()
}

// `<stem>.<ext>`, or `<stem>_<n>.<ext>` for the first free n
fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let mut path = dir.join(format!("{}.{}", stem, ext));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.{}", stem, n, ext));
        n += 1;
    }
    path
}

fn list_with_extension(dir: &Path, ext: &str) -> Result<Vec<String>, LprError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == ext) {
            if let Some(name) = path.file_name() {
                names.push(name.to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}
