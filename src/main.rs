//! Pointer Pilot - Main entry point
//!
//! Runs the pipeline with a dry-run or uinput actuator and feeds it detection
//! batches replayed from a JSON-lines file (or stdin).
//!
//! # Usage
//!
//! ```bash
//! # Replay recorded detections, logging the motion that would be emitted
//! pointer-pilot --replay detections.jsonl
//!
//! # Drive a real virtual mouse (Linux, needs /dev/uinput access)
//! pointer-pilot --uinput --replay -
//! ```

use pointer_pilot::{Actuator, Config, DetectionBatch, LogActuator, Pipeline};
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line options
#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    /// `-` means stdin
    replay: Option<String>,
    uinput: bool,
}

/// Parse command line arguments
fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("pointer-pilot v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i]));
                }
            }
            "--replay" | "-r" => {
                i += 1;
                parsed.replay = Some(args.get(i).cloned().unwrap_or_else(|| "-".to_string()));
            }
            "--uinput" => {
                parsed.uinput = true;
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                eprintln!("Use --help for usage information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"Pointer Pilot - detection-to-pointer control pipeline

USAGE:
    pointer-pilot [OPTIONS]

OPTIONS:
    -h, --help              Show this help message
    -v, --version           Show version
    -c, --config <PATH>     Path to configuration file
    -r, --replay <FILE>     Replay JSON-lines detection batches ("-" for stdin)
    --uinput                Emit motion through a uinput virtual mouse (Linux)

Without --replay the pipeline idles until Ctrl-C.

REPLAY FORMAT:
    One detection batch per line:
    {{"frame_seq":1,"frame_size":{{"width":640,"height":480}},
     "detections":[{{"bbox":{{"x1":330,"y1":230,"x2":350,"y2":250}},"confidence":0.8,"class_id":0}}]}}

ENVIRONMENT:
    RUST_LOG                Log filter (overrides general.log_level)
"#
    );
}

fn build_actuator(uinput: bool) -> Result<Box<dyn Actuator>, Box<dyn std::error::Error>> {
    if uinput {
        #[cfg(target_os = "linux")]
        {
            let mouse = pointer_pilot::VirtualMouse::create("pointer-pilot")?;
            return Ok(Box::new(mouse));
        }
        #[cfg(not(target_os = "linux"))]
        {
            warn!("--uinput is only supported on Linux, falling back to log actuator");
        }
    }
    Ok(Box::new(LogActuator::new()))
}

/// Publish each batch from `reader` at the capture cadence until `running` clears
fn replay(
    pipeline: &Pipeline,
    reader: impl BufRead,
    running: &AtomicBool,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut published = 0;

    for (index, line) in reader.lines().enumerate() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<DetectionBatch>(&line) {
            Ok(batch) => {
                pipeline.publish_batch(batch);
                published += 1;
            }
            Err(e) => warn!("Skipping line {}: {}", index + 1, e),
        }

        thread::sleep(pipeline.store().config.get().capture.interval());
    }

    Ok(published)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => Config::load_from_path(path.clone()),
        None => Config::load(),
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting Pointer Pilot");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    let actuator = build_actuator(args.uinput)?;
    let mut pipeline = Pipeline::new(config, actuator)?;
    pipeline.start()?;

    match args.replay.as_deref() {
        Some("-") => {
            let count = replay(&pipeline, io::stdin().lock(), &running)?;
            info!("Replayed {} batches from stdin", count);
        }
        Some(path) => {
            let file = std::fs::File::open(path)?;
            let count = replay(&pipeline, BufReader::new(file), &running)?;
            info!("Replayed {} batches from {}", count, path);
        }
        None => {
            info!("No replay source, idling until Ctrl-C");
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    // Let the driver finish decaying the last command
    if running.load(Ordering::SeqCst) {
        thread::sleep(pipeline.store().config.get().driver.max_duration() * 4);
    }

    pipeline.stop();
    println!("{}", pipeline.status());

    Ok(())
}
