use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use vigil_core::{
    DenylistStore, FaceEncoder, FaceMatcher, FirstMatch, Gallery, Listing, OnnxFaceEncoder,
    YoloWeaponDetector,
};
use vigil_hw::Camera;

mod alerts;
mod annotator;
mod config;
mod display;
mod events;
mod recorder;
mod session;

use alerts::ChannelNotifier;
use annotator::FrameAnnotator;
use config::Config;
use display::{Display, Headless};
use events::{Event, EventSink, LineEventLog, Severity};
use recorder::{FfmpegBackend, Recorder};
use session::{RunOutcome, Session};

/// Pending alerts beyond this are dropped.
const ALERT_QUEUE: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "vigild", version, about = "Weapon and denylist monitoring daemon")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// V4L2 device, overriding the configuration
    #[arg(long)]
    camera: Option<String>,

    /// Run weapon and face inference concurrently
    #[arg(long)]
    parallel: bool,

    /// Never open a preview window
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(camera) = cli.camera {
        config.camera_device = camera;
    }
    if cli.parallel {
        config.parallel_inference = true;
    }

    tracing::info!(camera = %config.camera_device, "vigild starting");

    let (mut events, log_path) = LineEventLog::create_in(&config.log_dir, Local::now())
        .with_context(|| format!("failed to create event log in {}", config.log_dir.display()))?;
    tracing::info!(path = %log_path.display(), "event log opened");

    let mut encoder = OnnxFaceEncoder::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("failed to load face models")?;
    let gallery = build_gallery(&config, &mut encoder, &mut events)?;
    let weapons = YoloWeaponDetector::load(&config.weapon_model_path())
        .context("failed to load weapon model")?;

    let camera = match Camera::open(&config.camera_device, config.capture_width, config.capture_height) {
        Ok(camera) => camera,
        Err(e) => {
            events.record(Event::now(Severity::Error, "Camera not accessible."));
            events.flush();
            return Err(e).with_context(|| format!("failed to open camera {}", config.camera_device));
        }
    };

    let (tx, rx) = mpsc::channel(ALERT_QUEUE);
    let presenter = tokio::spawn(alerts::present(rx, config.desktop_notifications));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let matcher = FaceMatcher::new(
        Box::new(encoder),
        gallery,
        FirstMatch {
            tolerance: config.match_tolerance,
        },
    );
    let mut session = Session::new(
        matcher,
        Box::new(weapons),
        Recorder::new(Box::new(FfmpegBackend::new(&config.ffmpeg_path)), &config.output_dir),
        Box::new(events),
        Box::new(ChannelNotifier::new(tx)),
    )
    .with_annotator(FrameAnnotator::load(&config.font_path))
    .with_recording(config.recording.clone())
    .with_parallel_inference(config.parallel_inference);

    let headless = cli.headless;
    let outcome = tokio::task::spawn_blocking(move || -> Result<RunOutcome> {
        let mut stream = match camera.stream() {
            Ok(stream) => stream,
            Err(e) => {
                session.log(Severity::Error, "Camera not accessible.");
                session.release();
                return Err(e).context("failed to start camera stream");
            }
        };
        session.log(Severity::Info, "Monitoring started.");
        let mut display = open_display(headless);
        Ok(session::run(&mut stream, &mut session, display.as_mut(), &stop)?)
    })
    .await
    .context("capture thread panicked")??;

    // The session owned the last alert sender; the presenter drains and exits.
    if let Err(e) = presenter.await {
        tracing::warn!(error = %e, "alert presenter failed");
    }

    tracing::info!(?outcome, "vigild stopped");
    Ok(())
}

/// Denylist entries first, then known persons. Match order follows this.
fn build_gallery(
    config: &Config,
    encoder: &mut dyn FaceEncoder,
    events: &mut dyn EventSink,
) -> Result<Gallery> {
    let mut gallery = Gallery::new();
    let denylist = DenylistStore::new(&config.denylist_csv, &config.denylist_image_dir);
    enroll(&mut gallery, &denylist, Listing::Denied, encoder, events)?;

    if let Some(known_csv) = &config.known_csv {
        let known = DenylistStore::new(known_csv, &config.known_image_dir);
        enroll(&mut gallery, &known, Listing::Known, encoder, events)?;
    }

    if gallery.is_empty() {
        tracing::warn!("no reference faces enrolled; every face will be reported as unknown");
    }
    Ok(gallery)
}

fn enroll(
    gallery: &mut Gallery,
    store: &DenylistStore,
    listing: Listing,
    encoder: &mut dyn FaceEncoder,
    events: &mut dyn EventSink,
) -> Result<()> {
    let path = store.csv_path().display();
    let records = match store.load() {
        Ok(records) => records,
        Err(e) => {
            events.record(Event::now(Severity::Error, format!("Failed to load {path}: {e}")));
            events.flush();
            return Err(e).with_context(|| format!("failed to load {path}"));
        }
    };
    let report = DenylistStore::encode(&records, encoder);
    tracing::info!(
        ?listing,
        enrolled = report.entries.len(),
        skipped = report.skipped.len(),
        "reference faces encoded"
    );
    for skipped in &report.skipped {
        events.record(Event::now(
            Severity::Warning,
            format!("No usable face for {}; entry skipped ({})", skipped.name, skipped.reason),
        ));
    }
    for entry in report.entries {
        gallery.push(entry.name, listing, entry.embedding);
    }
    Ok(())
}

fn open_display(headless: bool) -> Box<dyn Display> {
    #[cfg(feature = "highgui")]
    if !headless {
        match display::Window::open("Vigil") {
            Ok(window) => return Box::new(window),
            Err(e) => tracing::warn!(error = %e, "failed to open display window; running headless"),
        }
    }
    #[cfg(not(feature = "highgui"))]
    let _ = headless;
    Box::new(Headless)
}
