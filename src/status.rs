//! Operational status reporting.
//!
//! A read-only projection over the scheduler's state: it never mutates the
//! schedule, never opens the camera while an attempt holds it, and never
//! blocks a capture. Reachability is probed by try-locking the shared camera
//! mutex - if the lock is held the camera is busy, otherwise a short
//! open/describe/close cycle confirms the device answers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::camera::CameraPort;
use crate::clock::Clock;
use crate::config::ScheduleSpec;
use crate::orchestrator::CaptureResult;
use crate::scheduler::{next_due, ScheduleState};
use crate::storage::{StorageManager, StorageUsage};

/// Result of the camera reachability probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail")]
pub enum CameraReachability {
    /// The device opened and answered a describe call.
    Reachable,
    /// A capture attempt is running right now.
    CaptureInProgress,
    /// The camera mutex is held by another caller.
    Busy,
    /// Opening the device failed.
    Unreachable(String),
}

/// Point-in-time view of the daemon, serializable for operators.
///
/// `storage` is `None` when the free-space query fails; the rest of the
/// snapshot is still reported, with the failure in `storage_error`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub now: DateTime<Utc>,
    pub next_due: DateTime<Utc>,
    pub timezone: String,
    pub last_result: Option<CaptureResult>,
    pub last_success: Option<chrono::NaiveDate>,
    pub last_attempt: Option<chrono::NaiveDate>,
    pub camera: CameraReachability,
    pub storage: Option<StorageUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<String>,
}

/// Builds status snapshots from shared scheduler state.
pub struct StatusReporter {
    state: Arc<RwLock<ScheduleState>>,
    in_progress: Arc<AtomicBool>,
    camera_lock: Arc<Mutex<()>>,
    camera: Arc<dyn CameraPort>,
    storage: StorageManager,
    spec: ScheduleSpec,
    clock: Arc<dyn Clock>,
}

impl StatusReporter {
    pub fn new(
        state: Arc<RwLock<ScheduleState>>,
        in_progress: Arc<AtomicBool>,
        camera_lock: Arc<Mutex<()>>,
        camera: Arc<dyn CameraPort>,
        storage: StorageManager,
        spec: ScheduleSpec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state,
            in_progress,
            camera_lock,
            camera,
            storage,
            spec,
            clock,
        }
    }

    /// Assemble a snapshot. The due instant is recomputed from the schedule
    /// rule rather than read from a cache, so the report is correct even
    /// across DST transitions. A failing storage query degrades that
    /// section instead of failing the whole snapshot.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let now = self.clock.now_utc();
        let state = self.state.read().await.clone();
        let camera = self.probe_camera().await;
        let (storage, storage_error) = match self.storage.usage() {
            Ok(usage) => (Some(usage), None),
            Err(e) => {
                warn!(error = %e, "storage usage unavailable");
                (None, Some(e.to_string()))
            }
        };

        StatusSnapshot {
            now,
            next_due: next_due(now, &state, &self.spec),
            timezone: self.spec.tz.name().to_string(),
            last_result: state.last_result,
            last_success: state.last_success,
            last_attempt: state.last_attempt,
            camera,
            storage,
            storage_error,
        }
    }

    /// Non-blocking reachability probe. Holds the camera mutex only for the
    /// duration of an open/describe/close cycle, and skips the device
    /// entirely when a capture owns it.
    async fn probe_camera(&self) -> CameraReachability {
        if self.in_progress.load(Ordering::SeqCst) {
            return CameraReachability::CaptureInProgress;
        }
        let Ok(_guard) = self.camera_lock.try_lock() else {
            return CameraReachability::Busy;
        };

        match self.camera.open().await {
            Ok(mut handle) => {
                let reachability = match handle.describe().await {
                    Ok(_) => CameraReachability::Reachable,
                    Err(e) => CameraReachability::Unreachable(e.to_string()),
                };
                let _ = handle.close().await;
                reachability
            }
            Err(e) => CameraReachability::Unreachable(e.to_string()),
        }
    }
}
