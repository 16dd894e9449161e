//! ship-stream: live camera client for the ship detector.
//!
//! `stream` runs the live session and takes operator commands on stdin;
//! `detect` and `export` wrap the detector's one-shot endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use image::DynamicImage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ship_stream::api::{self, DetectClient, ExportFormat};
use ship_stream::capture;
use ship_stream::render::{JpegFileSink, LabelFont, LatestFrameSink};
use ship_stream::{AnnotationRenderer, AppConfig, OverlaySink, SessionState, StreamSession, WsTransport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream a camera to the ship detector and overlay the results")]
struct Cli {
    /// Config file (INI). Defaults to <config dir>/ship-stream/config.ini
    #[arg(long, global = true, env = "SHIP_STREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Detector base address, e.g. http://localhost:8001
    #[arg(long, global = true)]
    api_base: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Live stream. Commands on stdin: start, stop, status, quit
    Stream(StreamArgs),
    /// Upload one image or video for detection
    Detect {
        file: PathBuf,
        /// Use the video endpoint
        #[arg(long)]
        video: bool,
        /// Write the image with detections drawn on it
        #[arg(long)]
        annotate: Option<PathBuf>,
        /// Save the raw response for a later export
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Turn a saved detect response into a PDF or Excel report
    Export {
        results: PathBuf,
        /// pdf or excel
        #[arg(long, default_value = "pdf")]
        format: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct StreamArgs {
    /// Camera device, e.g. /dev/video0 or synthetic://camera
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Send loop cadence in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// JPEG quality, 1-100
    #[arg(long)]
    quality: Option<u8>,
    /// Write annotated frames to this JPEG file
    #[arg(long)]
    preview: Option<PathBuf>,
    /// TrueType font for labels
    #[arg(long)]
    font: Option<PathBuf>,
    /// Start streaming without waiting for a command
    #[arg(long)]
    autostart: bool,
}

impl StreamArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval_ms = interval;
        }
        if let Some(quality) = self.quality {
            config.jpeg_quality = quality.clamp(1, 100);
        }
        if let Some(preview) = &self.preview {
            config.preview_path = Some(preview.clone());
        }
        if let Some(font) = &self.font {
            config.font_path = Some(font.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(base) = cli.api_base {
        config.api_base = base;
    }

    match cli.command {
        Command::Stream(args) => {
            args.apply(&mut config);
            run_stream(config, args.autostart).await
        }
        Command::Detect {
            file,
            video,
            annotate,
            save,
        } => run_detect(&config, file, video, annotate, save).await,
        Command::Export {
            results,
            format,
            out,
        } => run_export(&config, results, &format, out).await,
    }
}

fn build_renderer(config: &AppConfig) -> Result<AnnotationRenderer> {
    let font = match &config.font_path {
        Some(path) => LabelFont::load(path, config.font_size)?,
        None => LabelFont::default(),
    };
    Ok(AnnotationRenderer::new(font))
}

async fn run_stream(config: AppConfig, autostart: bool) -> Result<()> {
    let session_config = config.session_config()?;
    let source = capture::source_for_device(&config.device)?;
    let sink: Arc<dyn OverlaySink> = match &config.preview_path {
        Some(path) => {
            info!("Writing annotated preview to {}", path.display());
            Arc::new(JpegFileSink::new(path, config.jpeg_quality))
        }
        None => Arc::new(LatestFrameSink::new()),
    };

    let mut session = StreamSession::new(session_config, source, Arc::new(WsTransport::default()))
        .with_renderer(build_renderer(&config)?)
        .with_sink(sink);

    info!(
        "Ship stream ready: {} -> {}",
        config.device,
        session.config().stream_url
    );
    println!("commands: start, stop, status, quit");

    if autostart {
        start_session(&mut session).await;
    }

    let mut state_rx = session.subscribe_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if state == SessionState::Errored {
                    if let Some(err) = session.last_error() {
                        println!("error: {}", err);
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "start" => start_session(&mut session).await,
                    "stop" => {
                        session.stop().await;
                        print_status(&session);
                    }
                    "status" => print_status(&session),
                    "quit" | "exit" => break,
                    "" => {}
                    other => println!("unknown command '{}' (start, stop, status, quit)", other),
                }
            }
        }
    }

    session.stop().await;
    Ok(())
}

async fn start_session(session: &mut StreamSession) {
    if let Err(e) = session.start().await {
        println!("error: {}", e);
        return;
    }
    let state = session.wait_settled().await;
    println!("stream {}", state);
}

fn print_status(session: &StreamSession) {
    let stats = session.stats();
    println!(
        "state: {}  fps: {}  ships: {}  frames sent: {}",
        session.state(),
        stats.fps,
        stats.ships,
        stats.frames_sent
    );
    if let Some(err) = session.last_error() {
        println!("last error: {}", err);
    }
}

async fn run_detect(
    config: &AppConfig,
    file: PathBuf,
    video: bool,
    annotate: Option<PathBuf>,
    save: Option<PathBuf>,
) -> Result<()> {
    let client = DetectClient::new(&config.api_base)?;
    let response = if video {
        client.detect_video(&file).await?
    } else {
        client.detect_image(&file).await?
    };

    if !response.success {
        bail!(
            "Detection failed: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }

    let summary = &response.results;
    println!(
        "ships: {}  processing time: {:.3}s",
        summary.total_ships, response.processing_time
    );
    if let Some(ships) = &summary.ships {
        for ship in ships {
            let [x1, y1, x2, y2] = ship.bbox;
            println!("  {}  [{:.0}, {:.0}, {:.0}, {:.0}]", ship.label(), x1, y1, x2, y2);
        }
    }
    if let Some(frames) = summary.total_frames_processed {
        println!(
            "frames: {}  with ships: {}  max per frame: {}  total detected: {}",
            frames,
            summary.frames_with_ships.unwrap_or(0),
            summary.max_ships_per_frame.unwrap_or(0),
            summary.total_ships_detected.unwrap_or(0)
        );
    }

    if let Some(path) = save {
        let json = serde_json::to_vec_pretty(&response)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved response to {}", path.display());
    }

    if let Some(out) = annotate {
        if video {
            warn!("--annotate only applies to image detection");
        } else {
            let image = image::open(&file)
                .with_context(|| format!("Failed to decode {}", file.display()))?
                .to_rgb8();
            let annotated = api::render_still(&build_renderer(config)?, &image, summary);
            DynamicImage::ImageRgba8(annotated)
                .to_rgb8()
                .save(&out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            info!("Annotated image written to {}", out.display());
        }
    }

    Ok(())
}

async fn run_export(
    config: &AppConfig,
    results: PathBuf,
    format: &str,
    out: Option<PathBuf>,
) -> Result<()> {
    let format: ExportFormat = format.parse()?;
    let data = tokio::fs::read(&results)
        .await
        .with_context(|| format!("Failed to read {}", results.display()))?;
    let summary = api::summary_from_json(&data)?;

    let client = DetectClient::new(&config.api_base)?;
    let report = client.export(format, &summary).await?;

    let out = out.unwrap_or_else(|| PathBuf::from(format.file_name(chrono::Local::now())));
    tokio::fs::write(&out, &report)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("saved {} ({} bytes)", out.display(), report.len());
    Ok(())
}
