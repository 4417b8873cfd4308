//! The callers of `process_frame`: still images, whole videos and the realtime loop.

use crossbeam::channel::{ self, Receiver, Sender };
use image::RgbImage;
use tracing::{ debug, info, warn };

use std::path::{ Path, PathBuf };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;
use std::thread::{ self, JoinHandle };
use std::time::Instant;

use crate::error::LprError;
use crate::history::HistoryStore;
use crate::model::Detector;
use crate::tracker::NewPlateFilter;
use crate::video::{ FrameSink, FrameSource };
use crate::{ FrameResult, Lpr };

pub fn process_image<D: Detector, O: Detector>(lpr: &Lpr<D, O>, path: impl AsRef<Path>) -> Result<FrameResult, LprError> {
    let path = path.as_ref();
    let img = image::open(path)
        .map_err(|e| LprError::invalid_input(format!("cannot read image {}: {}", path.display(), e)))?;
    lpr.process_frame(&img.to_rgb8())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoSummary {
    pub frames: u64,
    /// every plate read in the video, in the order first seen
    pub plates: Vec<String>,
}

/// Run every frame through the pipeline, the annotated frames go to `sink` when given.
pub fn process_video<D, O>(
    lpr: &Lpr<D, O>,
    source: &mut dyn FrameSource,
    mut sink: Option<Box<dyn FrameSink>>,
) -> Result<VideoSummary, LprError>
where D: Detector, O: Detector
{
    let mut summary = VideoSummary::default();
    let outcome = (|| -> Result<(), LprError> {
        while let Some(frame) = source.next_frame()? {
            let result = lpr.process_frame(&frame)?;
            if let Some(sink) = sink.as_mut() {
                sink.write_frame(&result.annotated)?;
            }
            for plate in result.plates {
                if !summary.plates.contains(&plate) {
                    info!(plate = %plate, frame = summary.frames, "plate in video");
                    summary.plates.push(plate);
                }
            }
            summary.frames += 1;
        }
        Ok(())
    })();
    if let Some(sink) = sink {
        sink.finish()?;
    }
    outcome?;
    Ok(summary)
}

/// A new plate seen by the realtime loop.
#[derive(Debug, Clone)]
pub struct PlateEvent {
    pub plate: String,
    pub image_path: PathBuf,
    pub frame_index: u64,
    pub captured: RgbImage,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealtimeSummary {
    pub frames: u64,
    pub last_plate: Option<String>,
    pub saved: Vec<PathBuf>,
    pub mean_fps: f32,
}

/// Realtime recognition running on its own thread.
///
/// Frames are processed and recorded on the worker, every new plate is saved to the
/// history and sent over `events`. The loop ends when the source runs dry or `stop` is
/// called, the recording is always finished.
pub struct RealtimeSession {
    events: Receiver<PlateEvent>,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<Result<RealtimeSummary, LprError>>,
}

impl RealtimeSession {

    pub fn start<D, O, S>(
        lpr: Lpr<D, O>,
        source: S,
        recorder: Option<Box<dyn FrameSink + Send>>,
        history: HistoryStore,
    ) -> Result<Self, LprError>
    where D: Detector + Send + 'static,
          O: Detector + Send + 'static,
          S: FrameSource + Send + 'static,
    {
        let (sender, events) = channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker = thread::Builder::new()
            .name("lpr-realtime".to_string())
            .spawn(move || realtime_loop(lpr, source, recorder, history, sender, worker_stop))?;
        Ok(RealtimeSession { events, stop, worker })
    }

    pub fn events(&self) -> &Receiver<PlateEvent> {
        &self.events
    }

    /// Shared flag, setting it ends the loop after the current frame.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(self) -> Result<RealtimeSummary, LprError> {
        self.worker.join()
            .map_err(|_| LprError::pipeline("realtime worker panicked"))?
    }
}

fn realtime_loop<D, O, S>(
    lpr: Lpr<D, O>,
    mut source: S,
    mut recorder: Option<Box<dyn FrameSink + Send>>,
    history: HistoryStore,
    events: Sender<PlateEvent>,
    stop: Arc<AtomicBool>,
) -> Result<RealtimeSummary, LprError>
where D: Detector, O: Detector, S: FrameSource
{
    let mut summary = RealtimeSummary::default();
    let mut filter = NewPlateFilter::new();
    let mut fps_sum = 0.0;
    let mut prev_frame_time: Option<Instant> = None;

    let outcome = (|| -> Result<(), LprError> {
        while !stop.load(Ordering::SeqCst) {
            let frame = match source.next_frame()? {
                Some(frame) => frame,
                None => break,
            };
            let result = lpr.process_frame(&frame)?;
            if let Some(recorder) = recorder.as_mut() {
                recorder.write_frame(&result.annotated)?;
            }

            if let Some(plate) = filter.observe(&result) {
                if let Some(captured) = result.captured {
                    let image_path = history.save_capture(&captured, &plate)?;
                    summary.saved.push(image_path.clone());
                    let event = PlateEvent { plate, image_path, frame_index: summary.frames, captured };
                    // nobody listening is fine, the history has it
                    if events.send(event).is_err() {
                        debug!("plate event dropped");
                    }
                }
            }

            let now = Instant::now();
            if let Some(prev) = prev_frame_time {
                let elapsed = now.duration_since(prev).as_secs_f32();
                if elapsed > 0.0 {
                    fps_sum += 1.0 / elapsed;
                    debug!(fps = (1.0 / elapsed) as u32, "frame");
                }
            }
            prev_frame_time = Some(now);
            summary.frames += 1;
        }
        Ok(())
    })();

    let finished = match recorder {
        Some(recorder) => recorder.finish(),
        None => Ok(()),
    };
    if let Err(e) = &finished {
        warn!(error = %e, "recording not finalized");
    }
    outcome?;
    finished?;

    summary.last_plate = filter.last_plate().map(str::to_string);
    if summary.frames > 1 {
        summary.mean_fps = fps_sum / (summary.frames - 1) as f32;
    }
    info!(frames = summary.frames, saved = summary.saved.len(), "realtime session ended");
    Ok(summary)
}


#[cfg(test)]
mod test {

    use image::Rgb;

    use super::*;
    use crate::config::ReaderConfig;
    use crate::history::test::temp_history;
    use crate::model::Detection;
    use crate::test::{ plate_box, plate_chars, FixedDetector };

    use std::collections::VecDeque;
    use std::error::Error;
    use std::sync::Mutex;

    struct Frames(VecDeque<RgbImage>);

    impl FrameSource for Frames {
        fn next_frame(&mut self) -> Result<Option<RgbImage>, LprError> {
            Ok(self.0.pop_front())
        }
    }

    /// Reads the plate whose characters are encoded in the red channel of pixel (0, 0):
    /// 0 is nothing, 1 and 2 are two different plates.
    struct PixelOcr;

    impl Detector for PixelOcr {
        fn detect(&self, img: &RgbImage) -> Result<Vec<Detection>, LprError> {
            Ok(match img.get_pixel(0, 0).0[0] {
                1 => plate_chars(&[0, 1, 9, 2, 3, 4, 5]),
                2 => plate_chars(&[5, 0, 10, 0, 2, 3, 4, 8]),
                _ => Vec::new(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct CountingSink(Arc<Mutex<(usize, bool)>>);

    impl FrameSink for CountingSink {
        fn write_frame(&mut self, _frame: &RgbImage) -> Result<(), LprError> {
            self.0.lock().unwrap().0 += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), LprError> {
            self.0.lock().unwrap().1 = true;
            Ok(())
        }
    }

    fn frames(codes: &[u8]) -> Frames {
        Frames(codes.iter().map(|c| RgbImage::from_pixel(32, 24, Rgb([*c, 0, 0]))).collect())
    }

    fn whole_frame_lpr() -> Lpr<FixedDetector, PixelOcr> {
        Lpr::new(FixedDetector(vec![]), PixelOcr, ReaderConfig::default())
    }

    #[test]
    fn video_collects_all_plates() -> Result<(), Box<dyn Error>> {
        let sink = CountingSink::default();
        let mut source = frames(&[0, 1, 1, 2, 0, 1]);
        let summary = process_video(&whole_frame_lpr(), &mut source, Some(Box::new(sink.clone())))?;
        assert_eq!(summary.frames, 6);
        assert_eq!(summary.plates, vec!["12A3456".to_string(), "61B13459".to_string()]);
        assert_eq!(*sink.0.lock().unwrap(), (6, true));
        Ok(())
    }

    #[test]
    fn realtime_saves_only_new_plates() -> Result<(), Box<dyn Error>> {
        let (_root, config) = temp_history()?;
        let history = HistoryStore::open(&config)?;
        let sink = CountingSink::default();
        let session = RealtimeSession::start(
            whole_frame_lpr(), frames(&[0, 1, 1, 0, 2, 2, 1]), Some(Box::new(sink.clone())), history.clone())?;
        let summary = session.join()?;

        assert_eq!(summary.frames, 7);
        assert_eq!(summary.saved.len(), 3);
        assert_eq!(summary.last_plate.as_deref(), Some("12A3456"));
        assert_eq!(*sink.0.lock().unwrap(), (7, true));

        let logged: Vec<String> = history.entries()?.into_iter().map(|e| e.plate).collect();
        assert_eq!(logged.len(), 3);
        assert_eq!(logged[0], logged[2]);
        assert_ne!(logged[0], logged[1]);
        Ok(())
    }

    #[test]
    fn realtime_events_reach_the_caller() -> Result<(), Box<dyn Error>> {
        let (_root, config) = temp_history()?;
        let history = HistoryStore::open(&config)?;
        let lpr = Lpr::new(FixedDetector(vec![plate_box(2.0, 2.0, 30.0, 20.0)]), PixelOcr, ReaderConfig::default());
        let session = RealtimeSession::start(lpr, frames(&[1, 1, 1]), None, history)?;
        let first = session.events().recv_timeout(std::time::Duration::from_secs(30))?;
        assert_eq!(first.plate, "12A3456");
        assert_eq!(first.frame_index, 0);
        assert!(first.image_path.exists());
        let summary = session.join()?;
        assert_eq!(summary.saved.len(), 1);
        Ok(())
    }

    /// Never runs dry.
    struct Endless(u8);

    impl FrameSource for Endless {
        fn next_frame(&mut self) -> Result<Option<RgbImage>, LprError> {
            Ok(Some(RgbImage::from_pixel(8, 8, Rgb([self.0, 0, 0]))))
        }
    }

    #[test]
    fn stop_ends_an_endless_stream() -> Result<(), Box<dyn Error>> {
        let (_root, config) = temp_history()?;
        let history = HistoryStore::open(&config)?;
        let session = RealtimeSession::start(whole_frame_lpr(), Endless(2), None, history)?;
        let event = session.events().recv_timeout(std::time::Duration::from_secs(30))?;
        assert_eq!(event.plate, "61B13459");
        session.stop();
        let summary = session.join()?;
        assert!(summary.frames >= 1);
        assert_eq!(summary.saved.len(), 1);
        Ok(())
    }

    #[test]
    fn stopped_session_reads_nothing() -> Result<(), Box<dyn Error>> {
        let (_root, config) = temp_history()?;
        let history = HistoryStore::open(&config)?;
        let stop = Arc::new(AtomicBool::new(true));
        let summary = realtime_loop(whole_frame_lpr(), frames(&[1, 2]), None, history,
            channel::unbounded().0, stop)?;
        assert_eq!(summary.frames, 0);
        assert!(summary.saved.is_empty());
        Ok(())
    }

    #[test]
    fn unreadable_image_is_reported() {
        let err = process_image(&whole_frame_lpr(), "/no/such/plate.jpg").unwrap_err();
        assert!(err.to_string().starts_with("cannot read image"));
    }
}
