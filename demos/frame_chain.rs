//! Live-frame pipeline demo
//!
//! A synthetic camera feeds five stages that mimic a pose-estimation app:
//!
//! 1. Convert: BGR -> RGB
//! 2. Resize: nearest-neighbour down to the model input size
//! 3. Preprocess: normalise to floats
//! 4. Inference: a stand-in model locating the brightest pixel
//! 5. Postprocess: mark the result on the original frame
//!
//! Usage: cargo run --example frame_chain --release -- --qinfo --frames 300
//!        RUST_LOG=debug shows the queue report through tracing as well

use clap::Parser;
use relay_pipeline::{
    ChainBuilder, ChainConfig, Flow, FnSource, FnSink, Map, Orchestrator, QueueReport,
};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MODEL_INPUT: usize = 224;

#[derive(Debug, Parser)]
#[command(about = "Synthetic camera through a drop-oldest stage chain")]
struct Args {
    /// Capture width
    #[arg(long, default_value_t = 800, value_parser = clap::value_parser!(u32).range(1..))]
    width: u32,
    /// Capture height
    #[arg(long, default_value_t = 600, value_parser = clap::value_parser!(u32).range(1..))]
    height: u32,
    /// Capture frame rate
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..))]
    fps: u32,
    /// Relay capacity of every stage
    #[arg(long)]
    qsize: Option<usize>,
    /// Print queue depth and drop counts on every frame
    #[arg(long)]
    qinfo: bool,
    /// Stop after this many displayed frames
    #[arg(long, default_value_t = 200)]
    frames: u64,
    /// TOML chain config; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Packed 3-channel frame
#[derive(Debug, Clone)]
struct Frame {
    seq: u64,
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

struct Keypoint {
    x: usize,
    y: usize,
}

fn synthetic_camera(width: usize, height: usize, fps: u32) -> impl FnMut() -> Flow<Frame> + Send {
    let period = Duration::from_secs_f64(1.0 / fps as f64);
    let mut next_at = Instant::now();
    let mut seq = 0u64;
    move || {
        let now = Instant::now();
        if next_at > now {
            std::thread::sleep(next_at - now);
        }
        next_at += period;
        seq += 1;
        let hot = (seq as usize * 7) % (width * height);
        let mut pixels = vec![16u8; width * height * 3];
        pixels[hot * 3..hot * 3 + 3].copy_from_slice(&[255, 255, 255]);
        Flow::Continue(Frame {
            seq,
            width,
            height,
            pixels,
        })
    }
}

fn bgr_to_rgb(frame: Frame) -> (Frame, Frame) {
    let mut rgb = frame.clone();
    for px in rgb.pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    (rgb, frame)
}

fn resize((frame, original): (Frame, Frame)) -> (Frame, Frame) {
    let mut pixels = Vec::with_capacity(MODEL_INPUT * MODEL_INPUT * 3);
    for y in 0..MODEL_INPUT {
        let sy = y * frame.height / MODEL_INPUT;
        for x in 0..MODEL_INPUT {
            let sx = x * frame.width / MODEL_INPUT;
            let at = (sy * frame.width + sx) * 3;
            pixels.extend_from_slice(&frame.pixels[at..at + 3]);
        }
    }
    let resized = Frame {
        seq: frame.seq,
        width: MODEL_INPUT,
        height: MODEL_INPUT,
        pixels,
    };
    (resized, original)
}

fn preprocess((frame, original): (Frame, Frame)) -> (Vec<f32>, Frame) {
    let tensor = frame.pixels.iter().map(|&p| p as f32 / 255.0).collect();
    (tensor, original)
}

fn infer((tensor, original): (Vec<f32>, Frame)) -> (Option<Keypoint>, Frame) {
    let brightest = tensor
        .chunks_exact(3)
        .enumerate()
        .map(|(i, px)| (i, px.iter().sum::<f32>()))
        .filter(|(_, v)| *v > 2.5)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| Keypoint {
            x: i % MODEL_INPUT,
            y: i / MODEL_INPUT,
        });
    (brightest, original)
}

fn annotate((keypoint, mut frame): (Option<Keypoint>, Frame)) -> Frame {
    if let Some(kp) = keypoint {
        let x = kp.x * frame.width / MODEL_INPUT;
        let y = kp.y * frame.height / MODEL_INPUT;
        let at = (y * frame.width + x) * 3;
        frame.pixels[at..at + 3].copy_from_slice(&[0, 0, 255]);
    }
    frame
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ChainConfig::load(path)?,
        None => ChainConfig::default(),
    };
    if let Some(qsize) = args.qsize {
        config = config.with_capacity(qsize);
    }
    config.validate()?;

    let chain = ChainBuilder::new(config)
        .source("capture", FnSource::new(synthetic_camera(args.width as usize, args.height as usize, args.fps)))
        .stage("convert", Map::new(bgr_to_rgb))
        .stage("resize", Map::new(resize))
        .stage("preprocess", Map::new(preprocess))
        .stage("inference", Map::new(infer))
        .stage("postprocess", Map::new(annotate))
        .build()?;

    let mut orchestrator = Orchestrator::new(chain);
    if args.qinfo {
        orchestrator = orchestrator.with_sink(FnSink(|report: &QueueReport| println!("{report}")));
    }

    let limit = args.frames;
    let summary = orchestrator.run(|tick| {
        if let Some(fps) = tick.rate_hz() {
            println!("frame {:>6}  FPS:{:.2}", tick.item.seq, fps);
        }
        if tick.item.seq >= limit {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;

    println!("\nDisplayed {} frames", summary.ticks);
    if let Some(mean) = summary.mean_interval {
        println!("Mean frame interval: {:.2} ms", mean.as_secs_f64() * 1000.0);
    }
    println!("Final queues: {}", summary.report);
    Ok(())
}
