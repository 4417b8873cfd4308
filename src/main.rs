use clap::{ App, AppSettings, Arg, ArgMatches, SubCommand };
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::error::Error;
use std::io::{ self, BufRead };
use std::path::{ Path, PathBuf };
use std::sync::atomic::Ordering;
use std::thread;

use lpr_watch::history::HistoryStore;
use lpr_watch::session::{ self, RealtimeSession };
use lpr_watch::video::{ FrameSink, VideoReader, VideoRecorder };
use lpr_watch::{ utils, Config, Lpr };

const NO_PLATE: &str = "no plate";

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("lpr-watch")
                    .version("0.1.0")
                    .author("kingrong")
                    .about("Reads license plates from images, videos and live cameras")
                    .setting(AppSettings::SubcommandRequiredElseHelp)
                    .arg(Arg::with_name("config")
                        .long("config")
                        .short("c")
                        .takes_value(true)
                        .global(true)
                        .help("JSON config file"))
                    .arg(Arg::with_name("font")
                        .long("font")
                        .takes_value(true)
                        .global(true)
                        .help("TTF font used to write plates on frames"))
                    .subcommand(SubCommand::with_name("image")
                        .about("read the plates of one image")
                        .arg(Arg::with_name("INPUT")
                            .help("image file with license plate")
                            .required(true)
                            .index(1))
                        .arg(Arg::with_name("output")
                            .long("output")
                            .short("o")
                            .takes_value(true)
                            .help("save the annotated image"))
                        .arg(Arg::with_name("display")
                            .long("display")
                            .help("show the annotated image in a window")))
                    .subcommand(SubCommand::with_name("video")
                        .about("read the plates of every frame of a video")
                        .arg(Arg::with_name("INPUT")
                            .help("video file or stream")
                            .required(true)
                            .index(1))
                        .arg(Arg::with_name("output")
                            .long("output")
                            .short("o")
                            .takes_value(true)
                            .help("record the annotated frames to an mp4 file")))
                    .subcommand(SubCommand::with_name("realtime")
                        .about("watch a camera, saving every new plate to the history")
                        .arg(Arg::with_name("SOURCE")
                            .help("camera index, stream URI or file, the config default otherwise")
                            .index(1))
                        .arg(Arg::with_name("no-record")
                            .long("no-record")
                            .help("do not keep a recording of the session")))
                    .subcommand(SubCommand::with_name("history")
                        .about("list saved snapshots, recordings and plates"))
                    .subcommand(SubCommand::with_name("ops")
                        .about("list the operations of a frozen graph")
                        .arg(Arg::with_name("MODEL")
                            .required(true)
                            .index(1)))
                    .get_matches();

    let mut config = Config::load_or_default(matches.value_of("config").map(Path::new))?;
    if let Some(font) = matches.value_of("font") {
        config.font = Some(PathBuf::from(font));
    }

    match matches.subcommand() {
        ("image", Some(sub)) => run_image(&config, sub),
        ("video", Some(sub)) => run_video(&config, sub),
        ("realtime", Some(sub)) => run_realtime(&config, sub),
        ("history", Some(_)) => run_history(&config),
        ("ops", Some(sub)) => {
            let model = sub.value_of("MODEL").ok_or("model is required")?;
            for name in utils::graph_operation_names(model)? {
                println!("{}", name);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn run_image(config: &Config, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let file_name = matches.value_of("INPUT").ok_or("image is required")?;
    let lpr = Lpr::from_config(config)?;
    let res = session::process_image(&lpr, file_name)?;

    match res.primary_plate() {
        Some(_) => res.plates.iter().for_each(|plate| println!("plate: {}", plate)),
        None => println!("{}", NO_PLATE),
    }
    if let Some(output) = matches.value_of("output") {
        res.annotated.save(output)?;
        info!(output, "annotated image saved");
    }
    if matches.is_present("display") {
        display(&res.annotated);
    }
    Ok(())
}

#[cfg(feature = "display-window")]
fn display(img: &image::RgbImage) {
    let (width, height) = img.dimensions();
    let rgba = image::DynamicImage::ImageRgb8(img.clone()).to_rgba8();
    imageproc::window::display_image("lpr-watch", &rgba, width, height);
}

#[cfg(not(feature = "display-window"))]
fn display(_img: &image::RgbImage) {
    tracing::warn!("built without the display-window feature, nothing to show");
}

fn run_video(config: &Config, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let input = matches.value_of("INPUT").ok_or("video is required")?;
    let lpr = Lpr::from_config(config)?;
    let mut reader = VideoReader::open(input)?;
    let sink = matches.value_of("output")
        .map(|path| Box::new(VideoRecorder::new(path, config.realtime.record_fps)) as Box<dyn FrameSink>);
    let summary = session::process_video(&lpr, &mut reader, sink)?;

    println!("plate: {}", summary.plates.first().map(String::as_str).unwrap_or(NO_PLATE));
    if summary.plates.len() > 1 {
        println!("all plates: {}", summary.plates.join(", "));
    }
    info!(frames = summary.frames, "video done");
    Ok(())
}

fn run_realtime(config: &Config, matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let source = matches.value_of("SOURCE").unwrap_or(config.realtime.source.as_str());
    let history = HistoryStore::open(&config.history)?;
    let lpr = Lpr::from_config(config)?;
    let reader = VideoReader::open(source)?;
    let recorder = if matches.is_present("no-record") {
        None
    } else {
        let path = history.new_recording_path();
        Some(Box::new(VideoRecorder::new(path, config.realtime.record_fps)) as Box<dyn FrameSink + Send>)
    };

    let session = RealtimeSession::start(lpr, reader, recorder, history)?;
    let stop = session.stop_handle();
    println!("watching {}, type q and enter to stop", source);
    // detached, it dies with the process
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if line.trim() == "q" => {
                    stop.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    for event in session.events().iter() {
        println!("plate: {} ({})", event.plate, event.image_path.display());
    }
    let summary = session.join()?;
    println!("plate: {}", summary.last_plate.as_deref().unwrap_or(NO_PLATE));
    info!(frames = summary.frames, saved = summary.saved.len(), fps = summary.mean_fps, "realtime closed");
    Ok(())
}

fn run_history(config: &Config) -> Result<(), Box<dyn Error>> {
    let history = HistoryStore::open(&config.history)?;
    println!("images ({}):", history.image_dir().display());
    for name in history.list_images()? {
        println!("  {}", name);
    }
    println!("videos ({}):", history.video_dir().display());
    for name in history.list_videos()? {
        println!("  {}", name);
    }
    println!("plates:");
    for entry in history.entries()? {
        println!("  {} {}", entry.file_name, entry.plate);
    }
    Ok(())
}
