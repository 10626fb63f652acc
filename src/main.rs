use clap::{Args, Parser, Subcommand};
use image::RgbaImage;
use moodcam::camera::{MediaDevice, StillImageDevice};
use moodcam::config::{AppConfig, BackendKind, CameraConfig, DetectionConfig, StorageConfig};
use moodcam::detection::{DetectionAdapter, ExpressionModel};
use moodcam::error::{MoodcamError, Result};
use moodcam::gallery::{Activation, DeleteReport, Filter, Gallery};
use moodcam::logging::init_logging;
use moodcam::models::FacingMode;
use moodcam::notify::{LogNotifier, Notice, NoticeLevel, Notifier};
use moodcam::overlay;
use moodcam::sampler::{DetectionSession, LiveUpdate, SessionHandle};
use moodcam::store::{CaptureId, CaptureStore, JsonFileBackend, OwnerId, PersistenceBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

/// Live emotion detection with a capture gallery.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML settings file. Defaults to `moodcam.toml` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory holding captures and the owner id.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the log level (error, warn, info, debug, trace).
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a live detection session. Type `c` to capture, `s` to switch
    /// camera, `stats` for counters and `q` to quit.
    Live(LiveArgs),
    /// Browse and manage stored captures.
    #[command(subcommand)]
    Gallery(GalleryCommand),
}

#[derive(Debug, Args)]
struct LiveArgs {
    /// Starting camera (front or back).
    #[arg(long)]
    facing: Option<FacingMode>,

    /// Serve this image instead of a webcam.
    #[arg(long)]
    still: Option<PathBuf>,

    /// Image for the back camera when using `--still`.
    #[arg(long, requires = "still")]
    still_back: Option<PathBuf>,

    /// Detection period in milliseconds.
    #[arg(long)]
    period_ms: Option<u64>,

    /// Directory containing the cascade and classifier files.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Stop after this many seconds.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Write the latest overlay to this PNG after every cycle.
    #[arg(long)]
    overlay_dump: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum GalleryCommand {
    /// List captures, optionally filtered by emotion.
    List {
        #[arg(long, default_value = "All")]
        filter: Filter,
    },
    /// Show the filters that currently match at least one capture.
    Labels,
    /// Write a capture's image to a file.
    Show {
        id: CaptureId,
        #[arg(long)]
        out: PathBuf,
    },
    /// Delete captures by id.
    Delete {
        #[arg(required = true)]
        ids: Vec<CaptureId>,
    },
}

/// Prints notices to stderr and mirrors them into the log
#[derive(Default)]
struct ConsoleNotifier {
    log: LogNotifier,
}

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Success | NoticeLevel::Info => eprintln!("{}", notice.message),
            NoticeLevel::Error => eprintln!("error: {}", notice.message),
        }
        self.log.notify(notice);
    }
}

#[cfg(feature = "onnx")]
fn build_model(detection: &DetectionConfig) -> Arc<dyn ExpressionModel> {
    Arc::new(moodcam::onnx::OnnxExpressionModel::new(
        detection.cascade_path(),
        detection.classifier_path(),
    ))
}

#[cfg(not(feature = "onnx"))]
fn build_model(_detection: &DetectionConfig) -> Arc<dyn ExpressionModel> {
    Arc::new(UnavailableModel)
}

/// Stand-in used when no inference backend is compiled in; always fails to load
#[cfg(not(feature = "onnx"))]
struct UnavailableModel;

#[cfg(not(feature = "onnx"))]
#[async_trait::async_trait]
impl ExpressionModel for UnavailableModel {
    async fn load(&self) -> Result<()> {
        Err(MoodcamError::ModelLoad(
            "built without the `onnx` feature".to_string(),
        ))
    }

    async fn infer(
        &self,
        _frame: &moodcam::models::Frame,
    ) -> Result<Vec<moodcam::models::FaceDetection>> {
        Ok(Vec::new())
    }
}

fn build_device(camera: &CameraConfig) -> Result<Arc<dyn MediaDevice>> {
    if let Some(still) = &camera.still_source {
        let mut device = StillImageDevice::new(still);
        if let Some(back) = &camera.still_source_back {
            device = device.with_back(back);
        }
        return Ok(Arc::new(device));
    }
    native_device(camera)
}

#[cfg(feature = "camera")]
fn native_device(camera: &CameraConfig) -> Result<Arc<dyn MediaDevice>> {
    use moodcam::camera::{CameraSettings, NokhwaDevice};
    use tracing::info;

    match NokhwaDevice::list_devices() {
        Ok(devices) => info!("Available cameras: {:?}", devices),
        Err(e) => warn!("Could not list cameras: {}", e),
    }
    Ok(Arc::new(NokhwaDevice::new(CameraSettings {
        front_index: camera.front_index,
        back_index: camera.back_index,
        width: camera.width,
        height: camera.height,
        fps: camera.fps,
    })))
}

#[cfg(not(feature = "camera"))]
fn native_device(_camera: &CameraConfig) -> Result<Arc<dyn MediaDevice>> {
    Err(MoodcamError::CameraAccess(
        "built without the `camera` feature; pass --still <IMAGE>".to_string(),
    ))
}

fn build_backend(storage: &StorageConfig) -> Result<Arc<dyn PersistenceBackend>> {
    match storage.backend {
        BackendKind::Local => Ok(Arc::new(JsonFileBackend::new(storage.captures_dir()))),
        BackendKind::Remote => remote_backend(storage),
    }
}

#[cfg(feature = "remote")]
fn remote_backend(storage: &StorageConfig) -> Result<Arc<dyn PersistenceBackend>> {
    let url = storage
        .remote_url
        .clone()
        .ok_or_else(|| MoodcamError::Config("storage.remote_url is not set".to_string()))?;
    Ok(Arc::new(moodcam::store::HttpBackend::new(url)))
}

#[cfg(not(feature = "remote"))]
fn remote_backend(_storage: &StorageConfig) -> Result<Arc<dyn PersistenceBackend>> {
    Err(MoodcamError::Config(
        "built without the `remote` feature".to_string(),
    ))
}

async fn open_store(storage: &StorageConfig) -> Result<CaptureStore> {
    let owner = OwnerId::load_or_create(&storage.data_dir)?;
    CaptureStore::open(build_backend(storage)?, owner).await
}

async fn wait_for(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn capture_once(handle: &SessionHandle, store: &mut CaptureStore, notifier: &dyn Notifier) {
    let still = match handle.grab().await {
        Ok(still) => still,
        Err(e) => {
            notifier.notify(Notice::error(format!("Capture failed: {e}")));
            return;
        }
    };
    match store.capture(&still.frame, &still.expressions).await {
        Ok(capture) => notifier.notify(Notice::success(format!(
            "Captured {} ({})",
            capture.id(),
            capture.dominant_label()
        ))),
        Err(e) => notifier.notify(Notice::error(format!("Capture failed: {e}"))),
    }
}

/// Prints the per-face panels when they change and refreshes the overlay dump
fn show_update(
    update: &LiveUpdate,
    last_summary: &mut String,
    canvas: &mut RgbaImage,
    dump: Option<&PathBuf>,
) {
    let summary = if update.faces.is_empty() {
        "no face detected".to_string()
    } else {
        update
            .faces
            .iter()
            .enumerate()
            .map(|(i, face)| format!("face {}: {}", i + 1, face.dominant_label()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    if summary != *last_summary {
        println!("{summary}");
        for (i, face) in update.faces.iter().enumerate() {
            println!("  face {}: {}", i + 1, face);
        }
        *last_summary = summary;
    }

    if let Some(path) = dump {
        overlay::paint(&update.overlay, canvas);
        if let Err(e) = canvas.save(path) {
            warn!("Failed to write overlay to {}: {}", path.display(), e);
        }
    }
}

async fn run_live(config: AppConfig, args: LiveArgs, notifier: &dyn Notifier) -> Result<()> {
    let device = build_device(&config.camera)?;
    let adapter = Arc::new(DetectionAdapter::new(build_model(&config.detection)));
    let mut store = open_store(&config.storage).await?;

    let session = DetectionSession::new(device, adapter)
        .with_facing(config.camera.facing)
        .with_period(config.detection.sample_period());
    let mut updates = session.subscribe();
    let handle = session.spawn();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let deadline = wait_for(args.duration_secs.map(Duration::from_secs));
    tokio::pin!(deadline);
    let mut last_summary = String::new();
    let mut canvas = RgbaImage::new(0, 0);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = handle.closed() => break,
            update = updates.recv() => match update {
                Ok(update) => {
                    let dump = args.overlay_dump.as_ref();
                    show_update(&update, &mut last_summary, &mut canvas, dump);
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} live update(s)", skipped),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "c" => capture_once(&handle, &mut store, notifier).await,
                    "s" => match handle.switch_camera().await {
                        Ok(facing) => {
                            notifier.notify(Notice::info(format!("Switched to {facing} camera")));
                        }
                        Err(e) => {
                            notifier.notify(Notice::error(format!("Camera switch failed: {e}")));
                            break;
                        }
                    },
                    "stats" => match handle.stats().await {
                        Ok(stats) => println!("{stats:?}"),
                        Err(e) => warn!("Stats unavailable: {}", e),
                    },
                    "q" => break,
                    "" => {}
                    other => println!("unknown command '{other}' (c, s, stats, q)"),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin closed: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    match handle.stop().await {
        Ok(stats) => {
            println!(
                "{} cycle(s) completed, {} tick(s) dropped, {} failed",
                stats.cycles_completed, stats.dropped_ticks, stats.failed_cycles
            );
            Ok(())
        }
        Err(e) if e.is_fatal_to_session() => {
            notifier.notify(Notice::error(format!("Live session failed: {e}")));
            Err(e)
        }
        Err(e) => {
            notifier.notify(Notice::error(format!("Live session ended early: {e}")));
            Err(e)
        }
    }
}

async fn run_gallery(
    config: AppConfig,
    command: GalleryCommand,
    notifier: &dyn Notifier,
) -> Result<()> {
    let store = open_store(&config.storage).await?;
    let mut gallery = Gallery::load(&store).await?;

    match command {
        GalleryCommand::List { filter } => {
            gallery.set_filter(filter);
            for item in gallery.view() {
                let capture = &item.capture;
                let snapshot = capture
                    .emotion_snapshot()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no face".to_string());
                println!(
                    "{}  {}  {:<9} {}",
                    capture.id(),
                    capture.created_at().format("%Y-%m-%d %H:%M:%S"),
                    capture.dominant_label(),
                    snapshot
                );
            }
        }
        GalleryCommand::Labels => {
            for filter in gallery.available_filters() {
                println!("{filter}");
            }
        }
        GalleryCommand::Show { id, out } => {
            if let Activation::Zoom(png) = gallery.activate(id)? {
                std::fs::write(&out, png)?;
                println!("Wrote capture {} to {}", id, out.display());
            }
        }
        GalleryCommand::Delete { ids } => {
            gallery.toggle_selection_mode();
            for id in ids {
                gallery.toggle_select(id)?;
            }
            let report = gallery.delete_selected(&store, notifier).await?;
            if let DeleteReport::Deleted(outcome) = report {
                println!("{}", outcome.message);
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Command::Live(args) = &cli.command {
        if let Some(facing) = args.facing {
            config.camera.facing = facing;
        }
        if let Some(still) = &args.still {
            config.camera.still_source = Some(still.clone());
        }
        if let Some(back) = &args.still_back {
            config.camera.still_source_back = Some(back.clone());
        }
        if let Some(period) = args.period_ms {
            config.detection.sample_period_ms = period.max(1);
        }
        if let Some(dir) = &args.model_dir {
            config.detection.model_dir = dir.clone();
        }
    }

    init_logging(&config.logging)?;
    config.log_summary();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let notifier = ConsoleNotifier::default();

    let result = runtime.block_on(async {
        match cli.command {
            Command::Live(args) => run_live(config, args, &notifier).await,
            Command::Gallery(command) => run_gallery(config, command, &notifier).await,
        }
    });

    if let Err(e) = &result {
        error!("moodcam failed: {}", e);
    }
    result
}
