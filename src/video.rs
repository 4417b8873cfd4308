use gstreamer::prelude::*;
use gstreamer::prelude::MulDiv;
use gstreamer::{ Buffer, Caps, ClockTime, MessageView, Pipeline, State };
use gstreamer_app::{ AppSink, AppSrc };
use gstreamer_video::{ VideoCapsBuilder, VideoFormat, VideoInfo };
use image::RgbImage;
use tracing::{ debug, info, warn };

use std::path::{ Path, PathBuf };

use crate::error::LprError;

/// Anything producing RGB frames, `None` once the stream is over.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, LprError>;
}

/// Anything consuming annotated frames.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), LprError>;

    fn finish(self: Box<Self>) -> Result<(), LprError>;
}

/// Where frames come from, as typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Camera(u32),
    Uri(String),
    File(PathBuf),
}

impl SourceKind {

    /// `0` is a local camera, anything with a scheme is a URI, the rest is a file.
    pub fn parse(source: &str) -> Self {
        if let Ok(index) = source.parse::<u32>() {
            SourceKind::Camera(index)
        } else if source.contains("://") {
            SourceKind::Uri(source.to_string())
        } else {
            SourceKind::File(PathBuf::from(source))
        }
    }

    pub fn is_live(&self) -> bool {
        match self {
            SourceKind::File(_) => false,
            SourceKind::Uri(uri) => !uri.starts_with("file://"),
            SourceKind::Camera(_) => true,
        }
    }

    /// gst-launch description decoding to RGB into an appsink called `sink`.
    pub fn pipeline_description(&self) -> String {
        let src = match self {
            SourceKind::Camera(index) => format!("v4l2src device=/dev/video{}", index),
            SourceKind::Uri(uri) => format!("uridecodebin uri=\"{}\"", uri),
            SourceKind::File(path) => format!("filesrc location=\"{}\" ! decodebin", path.display()),
        };
        // live sources only keep the newest frame
        let sink = if self.is_live() {
            "appsink name=sink sync=false max-buffers=1 drop=true"
        } else {
            "appsink name=sink sync=false max-buffers=4 drop=false"
        };
        format!("{} ! videoconvert ! video/x-raw,format=RGB ! {}", src, sink)
    }
}

pub fn create_caps(width: u32, height: u32, fps: u32) -> Caps {
    VideoCapsBuilder::new()
        .width(width as i32)
        .height(height as i32)
        .framerate(gstreamer::Fraction::new(fps as i32, 1))
        .format(VideoFormat::Rgb)
        .build()
}

fn launch(description: &str) -> Result<Pipeline, LprError> {
    gstreamer::init()?;
    let element = gstreamer::parse_launch(description)?;
    element.dynamic_cast::<Pipeline>()
        .map_err(|_| LprError::pipeline(format!("not a pipeline: {}", description)))
}

// strip gstreamer row padding, frames are `stride` bytes per row
fn frame_from_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Option<RgbImage> {
    let row = width as usize * 3;
    if height == 0 || stride < row || data.len() < stride * (height as usize - 1) + row {
        return None;
    }
    let mut pixels = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        pixels.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    RgbImage::from_raw(width, height, pixels)
}

// lay a tightly packed frame out on `stride` byte rows
fn rows_from_frame(frame: &RgbImage, stride: usize) -> Vec<u8> {
    let row = frame.width() as usize * 3;
    if stride == row {
        return frame.as_raw().clone();
    }
    let mut data = vec![0u8; stride * frame.height() as usize];
    for (y, chunk) in frame.as_raw().chunks(row).enumerate() {
        data[y * stride..y * stride + row].copy_from_slice(chunk);
    }
    data
}

/// Decodes a file, a network stream or a camera through gstreamer.
pub struct VideoReader {
    pipeline: Pipeline,
    sink: AppSink,
    source: SourceKind,
}

impl VideoReader {

    pub fn open(source: &str) -> Result<Self, LprError> {
        let source = SourceKind::parse(source);
        let pipeline = launch(&source.pipeline_description())?;
        let sink = pipeline.by_name("sink")
            .and_dynamic_cast::<AppSink>()
            .map_err(|_| LprError::pipeline("missing appsink"))?;
        pipeline.set_state(State::Playing)?;
        info!(?source, "video opened");
        Ok(VideoReader { pipeline, sink, source })
    }

    // the first error posted on the bus, if any
    fn bus_error(&self) -> Option<LprError> {
        let bus = self.pipeline.bus()?;
        while let Some(msg) = bus.pop() {
            if let MessageView::Error(err) = msg.view() {
                return Some(LprError::pipeline(format!("{}", err.error())));
            }
        }
        None
    }
}

impl FrameSource for VideoReader {

    fn next_frame(&mut self) -> Result<Option<RgbImage>, LprError> {
        let sample = match self.sink.pull_sample() {
            Ok(sample) => sample,
            // pulling fails at end of stream, or when the pipeline broke
            Err(_) => {
                return match self.bus_error() {
                    Some(err) => Err(err),
                    None => {
                        debug!("end of stream");
                        Ok(None)
                    }
                };
            }
        };
        let buffer = sample.buffer().ok_or_else(|| LprError::pipeline("sample without buffer"))?;
        let caps = sample.caps().ok_or_else(|| LprError::pipeline("sample without caps"))?;
        let info = VideoInfo::from_caps(caps)?;
        let map = buffer.map_readable()?;
        let stride = info.stride()[0] as usize;
        frame_from_rows(map.as_slice(), info.width(), info.height(), stride)
            .map(Some)
            .ok_or_else(|| LprError::pipeline("short video buffer"))
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(State::Null) {
            warn!(error = %e, "cannot stop video reader");
        }
        debug!(source = ?self.source, "video closed");
    }
}

/// Encodes frames to an MP4 file at a fixed rate. The size is fixed by the first frame.
pub struct VideoRecorder {
    path: PathBuf,
    fps: u32,
    started: Option<Recording>,
    frames: u64,
}

struct Recording {
    pipeline: Pipeline,
    app_src: AppSrc,
    width: u32,
    height: u32,
    stride: usize,
}

impl VideoRecorder {

    pub fn new(path: impl AsRef<Path>, fps: u32) -> Self {
        VideoRecorder { path: path.as_ref().to_path_buf(), fps: fps.max(1), started: None, frames: 0 }
    }

    fn start(&self, width: u32, height: u32) -> Result<Recording, LprError> {
        let description = format!(
            "appsrc name=src ! videoconvert ! x264enc ! mp4mux ! filesink location=\"{}\"",
            self.path.display());
        let pipeline = launch(&description)?;
        let app_src = pipeline.by_name("src")
            .and_dynamic_cast::<AppSrc>()
            .map_err(|_| LprError::pipeline("missing appsrc"))?;
        let caps = create_caps(width, height, self.fps);
        let stride = VideoInfo::from_caps(&caps)?.stride()[0] as usize;
        app_src.set_caps(Some(&caps));
        app_src.set_format(gstreamer::Format::Time);
        pipeline.set_state(State::Playing)?;
        info!(path = %self.path.display(), width, height, "recording started");
        Ok(Recording { pipeline, app_src, width, height, stride })
    }
}

impl FrameSink for VideoRecorder {

    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), LprError> {
        if self.started.is_none() {
            self.started = Some(self.start(frame.width(), frame.height())?);
        }
        let duration = ClockTime::SECOND
            .mul_div_floor(1, self.fps as u64)
            .ok_or_else(|| LprError::pipeline("bad frame rate"))?;
        let pts = duration * self.frames;
        let recording = match self.started.as_ref() {
            Some(recording) => recording,
            None => return Ok(()),
        };
        if frame.dimensions() != (recording.width, recording.height) {
            warn!(got = ?frame.dimensions(), "frame size changed, frame dropped");
            return Ok(());
        }
        let mut buffer = Buffer::from_mut_slice(rows_from_frame(frame, recording.stride));
        {
            let buffer = buffer.get_mut().ok_or_else(|| LprError::pipeline("shared buffer"))?;
            buffer.set_duration(duration);
            buffer.set_pts(pts);
            buffer.set_dts(pts);
        }
        recording.app_src.push_buffer(buffer)
            .map_err(|e| LprError::pipeline(format!("cannot push frame: {:?}", e)))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), LprError> {
        let mut this = *self;
        let recording = match this.started.take() {
            Some(recording) => recording,
            None => {
                debug!("nothing recorded");
                return Ok(());
            }
        };
        if let Err(e) = recording.app_src.end_of_stream() {
            // dropping `this` stops the pipeline
            this.started = Some(recording);
            return Err(LprError::pipeline(format!("cannot end stream: {:?}", e)));
        }
        // the muxer only writes its index once EOS went through
        if let Some(bus) = recording.pipeline.bus() {
            let msg = bus.timed_pop_filtered(ClockTime::NONE, &[gstreamer::MessageType::Eos, gstreamer::MessageType::Error]);
            if let Some(msg) = msg {
                if let MessageView::Error(err) = msg.view() {
                    recording.pipeline.set_state(State::Null)?;
                    return Err(LprError::pipeline(format!("{}", err.error())));
                }
            }
        }
        recording.pipeline.set_state(State::Null)?;
        info!(path = %this.path.display(), frames = this.frames, "recording saved");
        Ok(())
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        // finished recorders have already handed their pipeline back
        if let Some(recording) = self.started.take() {
            warn!(path = %self.path.display(), "recorder dropped before finishing, the file may be unplayable");
            if let Err(e) = recording.pipeline.set_state(State::Null) {
                warn!(error = %e, "cannot stop recorder");
            }
        }
    }
}


#[cfg(test)]
mod test {

    use image::Rgb;

    use super::*;

    #[test]
    fn sources_are_told_apart() {
        assert_eq!(SourceKind::parse("0"), SourceKind::Camera(0));
        assert_eq!(SourceKind::parse("http://192.168.1.18:4747/video"),
            SourceKind::Uri("http://192.168.1.18:4747/video".to_string()));
        assert_eq!(SourceKind::parse("clips/car.mp4"), SourceKind::File(PathBuf::from("clips/car.mp4")));
        assert!(SourceKind::parse("rtsp://cam/1").is_live());
        assert!(!SourceKind::parse("file:///tmp/a.mp4").is_live());
        assert!(!SourceKind::parse("a.mp4").is_live());
    }

    #[test]
    fn live_pipelines_drop_frames() {
        let live = SourceKind::Camera(2).pipeline_description();
        assert!(live.starts_with("v4l2src device=/dev/video2"));
        assert!(live.contains("drop=true"));
        let file = SourceKind::parse("a b.mp4").pipeline_description();
        assert!(file.contains("filesrc location=\"a b.mp4\" ! decodebin"));
        assert!(file.contains("drop=false"));
        assert!(file.contains("format=RGB"));
    }

    #[test]
    fn idle_recorder_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("idle.mp4");
        Box::new(VideoRecorder::new(&path, 30)).finish()?;
        drop(VideoRecorder::new(&path, 0));
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn padded_rows_round_trip() {
        let frame = RgbImage::from_fn(5, 3, |x, y| Rgb([x as u8, y as u8, 7]));
        let padded = rows_from_frame(&frame, 16);
        assert_eq!(padded.len(), 48);
        assert_eq!(frame_from_rows(&padded, 5, 3, 16), Some(frame.clone()));
        assert_eq!(rows_from_frame(&frame, 15), frame.as_raw().clone());
        assert_eq!(frame_from_rows(&padded[..20], 5, 3, 16), None);
    }
}
