//! Daily capture daemon and operator CLI.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use analemma_capture::camera::sim::SimCamera;
use analemma_capture::camera::CameraPort;
use analemma_capture::clock::{Clock, SystemClock};
use analemma_capture::config::{Settings, DEFAULT_CONFIG_FILE};
use analemma_capture::metadata::MetadataRecorder;
use analemma_capture::orchestrator::CaptureOrchestrator;
use analemma_capture::scheduler::{drive_attempts, ScheduleState, Scheduler};
use analemma_capture::status::StatusReporter;
use analemma_capture::storage::StorageManager;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "analemma", version, about = "Unattended daily image capture")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduling daemon (the default).
    Daemon,
    /// Run one capture immediately, with retries, and exit.
    Capture,
    /// Print a status snapshot.
    Status,
    /// Probe the camera and print its description.
    CameraInfo,
    /// List captured images.
    ListImages {
        /// Restrict to one month, `YYYY-MM`.
        #[arg(long)]
        month: Option<String>,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    init_tracing(&settings.logging.level);

    match cli.command.unwrap_or(Command::Daemon) {
        Command::Daemon => run_daemon(settings).await,
        Command::Capture => run_capture(settings).await,
        Command::Status => run_status(settings).await,
        Command::CameraInfo => run_camera_info(settings).await,
        Command::ListImages { month } => run_list_images(settings, month.as_deref()),
        Command::Config => run_show_config(&settings),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("analemma_capture={level},analemma={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_camera(settings: &Settings) -> Result<Arc<dyn CameraPort>> {
    match settings.camera.driver.as_str() {
        "sim" => Ok(Arc::new(SimCamera::new(1600, 1200))),
        other => bail!("unknown camera driver '{other}'"),
    }
}

async fn run_daemon(settings: Settings) -> Result<()> {
    let camera = build_camera(&settings)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (scheduler, handle) = Scheduler::new(&settings, camera, clock)?;

    info!(version = env!("CARGO_PKG_VERSION"), "daemon starting");
    let task = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("interrupt received, shutting down");
    handle.shutdown();

    task.await.context("scheduler task panicked")?;
    Ok(())
}

/// One-shot capture: same orchestrator and retry loop the daemon uses, but
/// without touching the daemon's schedule state.
async fn run_capture(settings: Settings) -> Result<()> {
    let camera = build_camera(&settings)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let spec = settings.schedule.parse()?;
    let orchestrator = CaptureOrchestrator::new(
        camera,
        StorageManager::new(settings.storage.clone()),
        MetadataRecorder::new(settings.storage.checksum),
        Arc::clone(&clock),
        spec.tz,
    );

    let now = clock.now_utc();
    let (result, _) = drive_attempts(
        &orchestrator,
        &settings.retry,
        &clock,
        &settings.camera,
        now,
        true,
        None,
    )
    .await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.outcome.is_success() {
        error!(outcome = %result.outcome, "capture failed");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_status(settings: Settings) -> Result<()> {
    let camera = build_camera(&settings)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let spec = settings.schedule.parse()?;
    let state = ScheduleState::load(&settings.storage.state_path());

    let reporter = StatusReporter::new(
        Arc::new(RwLock::new(state)),
        Arc::new(AtomicBool::new(false)),
        Arc::new(Mutex::new(())),
        camera,
        StorageManager::new(settings.storage.clone()),
        spec,
        clock,
    );

    let snapshot = reporter.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run_camera_info(settings: Settings) -> Result<()> {
    let camera = build_camera(&settings)?;
    let mut handle = camera
        .open()
        .await
        .map_err(analemma_capture::CaptureError::from)?;
    let descriptor = handle
        .describe()
        .await
        .map_err(analemma_capture::CaptureError::from)?;
    let _ = handle.close().await;

    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

fn run_list_images(settings: Settings, month: Option<&str>) -> Result<()> {
    let storage = StorageManager::new(settings.storage);
    for path in storage.list_images(month)? {
        println!("{}", path.display());
    }
    Ok(())
}

fn run_show_config(settings: &Settings) -> Result<()> {
    println!("{}", toml::to_string_pretty(settings)?);
    Ok(())
}
