//! Capture orchestration.
//!
//! One end-to-end capture attempt: resolve storage, guard free space, open
//! the camera, configure it from the job's snapshot, acquire a frame, encode
//! and atomically persist the image, record provenance, and release the
//! camera on every exit path.
//!
//! Every failure inside an attempt is caught and converted into a
//! `CaptureResult`; nothing here can terminate the scheduling process. The
//! storage guard runs before the camera is touched - if free space is below
//! the minimum, the device is never opened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::camera::{CameraHandle, CameraPort};
use crate::clock::Clock;
use crate::config::CameraConfig;
use crate::encode;
use crate::error::{AppResult, CaptureError, Outcome};
use crate::metadata::{CaptureProvenance, MetadataRecorder};
use crate::storage::{self, StorageLocation, StorageManager};

/// One unit of capture work, created by the scheduler at fire time and
/// discarded when the attempt resolves. Never persisted.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub due: DateTime<Utc>,
    pub attempt: u32,
    pub camera: CameraConfig,
    pub manual: bool,
}

/// The resolution of one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    pub outcome: Outcome,
    pub image_path: Option<std::path::PathBuf>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// Runs capture attempts with exclusive camera ownership.
pub struct CaptureOrchestrator {
    camera: Arc<dyn CameraPort>,
    storage: StorageManager,
    recorder: MetadataRecorder,
    clock: Arc<dyn Clock>,
    tz: Tz,
    camera_lock: Arc<Mutex<()>>,
    in_progress: Arc<AtomicBool>,
}

impl CaptureOrchestrator {
    pub fn new(
        camera: Arc<dyn CameraPort>,
        storage: StorageManager,
        recorder: MetadataRecorder,
        clock: Arc<dyn Clock>,
        tz: Tz,
    ) -> Self {
        Self {
            camera,
            storage,
            recorder,
            clock,
            tz,
            camera_lock: Arc::new(Mutex::new(())),
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The mutex that serializes camera ownership. The status reporter
    /// try-locks it for its reachability probe.
    pub fn camera_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.camera_lock)
    }

    /// Set while an attempt is between lock acquisition and release.
    pub fn in_progress_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.in_progress)
    }

    pub fn camera(&self) -> Arc<dyn CameraPort> {
        Arc::clone(&self.camera)
    }

    /// Run one attempt to completion. Never returns an error: every failure
    /// is classified into the result's outcome.
    pub async fn run(&self, job: &CaptureJob) -> CaptureResult {
        let _guard = self.camera_lock.lock().await;
        self.in_progress.store(true, Ordering::SeqCst);

        let started = self.clock.now_utc();
        let t0 = Instant::now();

        info!(
            attempt = job.attempt,
            manual = job.manual,
            "capture attempt started"
        );

        let result = match self.try_capture(job).await {
            Ok(path) => CaptureResult {
                outcome: Outcome::Success,
                image_path: Some(path),
                timestamp: started,
                duration: t0.elapsed(),
            },
            Err(err) => {
                let outcome = Outcome::from_error(&err);
                warn!(attempt = job.attempt, %outcome, "capture attempt failed");
                CaptureResult {
                    outcome,
                    image_path: None,
                    timestamp: started,
                    duration: t0.elapsed(),
                }
            }
        };

        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn try_capture(&self, job: &CaptureJob) -> AppResult<std::path::PathBuf> {
        let now_local = self.clock.now_utc().with_timezone(&self.tz);

        // (1) Storage guard. Runs before the camera is touched.
        let location = self.storage.resolve(now_local.date_naive())?;
        if !self.storage.check_minimum(location.available_bytes) {
            return Err(CaptureError::InsufficientStorage {
                available: location.available_bytes,
                required: self.storage.config().min_free_bytes(),
            });
        }

        // (2) Scoped camera acquisition: released on every path below.
        let mut handle = self.camera.open().await?;
        let captured = self.capture_with(handle.as_mut(), job, &location).await;
        if let Err(e) = handle.close().await {
            warn!(error = %e, "error releasing camera handle");
        }
        captured
    }

    async fn capture_with(
        &self,
        handle: &mut dyn CameraHandle,
        job: &CaptureJob,
        location: &StorageLocation,
    ) -> AppResult<std::path::PathBuf> {
        // (3) Configure from the job's snapshot.
        handle.configure(&job.camera).await?;

        // (4) Acquire one frame, bounded.
        let frame = handle.acquire_frame(job.camera.acquire_timeout).await?;
        if !frame.is_well_formed() {
            return Err(CaptureError::CorruptFrame(format!(
                "{}x{}x{} frame with {} bytes",
                frame.width,
                frame.height,
                frame.channels,
                frame.data.len()
            )));
        }

        let descriptor = handle.describe().await?;
        let captured_local = frame.captured_at.with_timezone(&self.tz);
        let provenance = CaptureProvenance {
            captured_utc: frame.captured_at,
            captured_local: captured_local.to_rfc3339(),
            timezone: self.tz.name().to_string(),
            exposure_us: job.camera.exposure_us,
            gain: job.camera.gain,
            wb_r: job.camera.wb_r,
            wb_b: job.camera.wb_b,
            format: job.camera.image_type,
            camera_model: descriptor.model,
            camera_serial: descriptor.serial,
            width: frame.width,
            height: frame.height,
        };

        // (5) Encode, write to temp, atomically rename into place.
        let bytes = encode::encode(&frame, &provenance)?;
        let filename = StorageManager::image_filename(
            captured_local.naive_local(),
            provenance.format.extension(),
        );
        let image_path = location.dir.join(filename);
        storage::write_atomic(&image_path, &bytes)?;

        // (6) Provenance record. If it cannot be written the image is
        // removed too: a failed attempt leaves nothing behind.
        match self.recorder.record(&image_path, &bytes, &provenance) {
            Ok(_) => {
                info!(path = %image_path.display(), "image and metadata persisted");
                Ok(image_path)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&image_path);
                Err(e)
            }
        }
    }
}
