//! End-to-end capture attempt tests: retry loop, failure classification,
//! storage guard, and on-disk artifacts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use tempfile::TempDir;

use analemma_capture::camera::mock::{MockBehavior, MockCamera};
use analemma_capture::clock::{Clock, ManualClock};
use analemma_capture::config::{CameraConfig, ImageType, StorageConfig};
use analemma_capture::error::Outcome;
use analemma_capture::metadata::{MetadataRecord, MetadataRecorder};
use analemma_capture::orchestrator::CaptureOrchestrator;
use analemma_capture::retry::RetryPolicy;
use analemma_capture::scheduler::drive_attempts;
use analemma_capture::storage::StorageManager;

fn storage_for(tmp: &TempDir) -> StorageManager {
    StorageManager::new(StorageConfig {
        base_path: tmp.path().to_path_buf(),
        min_free_space_mb: 0,
        ..StorageConfig::default()
    })
}

fn orchestrator_for(tmp: &TempDir, camera: MockCamera, clock: Arc<dyn Clock>) -> CaptureOrchestrator {
    CaptureOrchestrator::new(
        Arc::new(camera),
        storage_for(tmp),
        MetadataRecorder::new(true),
        clock,
        chrono_tz::UTC,
    )
}

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_at(
        Utc.with_ymd_and_hms(2025, 6, 21, 12, 0, 0).unwrap(),
    ))
}

fn camera_config() -> CameraConfig {
    CameraConfig {
        image_type: ImageType::Png,
        ..CameraConfig::default()
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn test_transient_failure_recovers_within_window() {
    let tmp = TempDir::new().unwrap();
    let camera = MockCamera::with_behavior(MockBehavior {
        acquire_timeouts: 1,
        ..MockBehavior::default()
    });
    let clock = manual_clock();
    let orch = orchestrator_for(&tmp, camera.clone(), clock.clone());

    let generic: Arc<dyn Clock> = clock.clone();
    let (result, interrupted) = drive_attempts(
        &orch,
        &policy(),
        &generic,
        &camera_config(),
        clock.now_utc(),
        false,
        None,
    )
    .await;

    assert!(!interrupted);
    assert!(result.outcome.is_success());
    assert!(result.image_path.is_some());
    assert_eq!(camera.acquire_count(), 2);
    // Backoff before the second attempt.
    assert_eq!(clock.slept(), vec![Duration::from_secs(1)]);
}

#[tokio::test]
async fn test_retries_exhausted_with_doubling_backoff() {
    let tmp = TempDir::new().unwrap();
    let camera = MockCamera::with_behavior(MockBehavior {
        always_timeout: true,
        ..MockBehavior::default()
    });
    let clock = manual_clock();
    let orch = orchestrator_for(&tmp, camera.clone(), clock.clone());

    let generic: Arc<dyn Clock> = clock.clone();
    let (result, _) = drive_attempts(
        &orch,
        &policy(),
        &generic,
        &camera_config(),
        clock.now_utc(),
        false,
        None,
    )
    .await;

    assert!(matches!(result.outcome, Outcome::Transient(_)));
    assert!(result.image_path.is_none());
    assert_eq!(camera.acquire_count(), 3);
    assert_eq!(
        clock.slept(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    // Every handle was released despite the failures.
    assert_eq!(camera.open_count(), camera.close_count());
}

#[tokio::test]
async fn test_fatal_rejection_stops_after_one_attempt() {
    let tmp = TempDir::new().unwrap();
    let camera = MockCamera::with_behavior(MockBehavior {
        reject_configure: true,
        ..MockBehavior::default()
    });
    let clock = manual_clock();
    let orch = orchestrator_for(&tmp, camera.clone(), clock.clone());

    let generic: Arc<dyn Clock> = clock.clone();
    let (result, _) = drive_attempts(
        &orch,
        &policy(),
        &generic,
        &camera_config(),
        clock.now_utc(),
        false,
        None,
    )
    .await;

    assert!(matches!(result.outcome, Outcome::Fatal(_)));
    assert_eq!(camera.configure_count(), 1);
    assert!(clock.slept().is_empty());
}

#[tokio::test]
async fn test_low_free_space_never_touches_camera() {
    let tmp = TempDir::new().unwrap();
    let camera = MockCamera::new();
    let clock = manual_clock();
    let orch = CaptureOrchestrator::new(
        Arc::new(camera.clone()),
        StorageManager::new(StorageConfig {
            base_path: tmp.path().to_path_buf(),
            min_free_space_mb: u64::MAX / (1024 * 1024),
            ..StorageConfig::default()
        }),
        MetadataRecorder::new(true),
        clock.clone(),
        chrono_tz::UTC,
    );

    let generic: Arc<dyn Clock> = clock.clone();
    let (result, _) = drive_attempts(
        &orch,
        &policy(),
        &generic,
        &camera_config(),
        clock.now_utc(),
        false,
        None,
    )
    .await;

    assert!(matches!(result.outcome, Outcome::Fatal(_)));
    assert_eq!(camera.open_count(), 0);
}

#[tokio::test]
async fn test_artifacts_land_in_monthly_partition() {
    let tmp = TempDir::new().unwrap();
    let camera = MockCamera::new();
    let clock = manual_clock();
    let orch = orchestrator_for(&tmp, camera, clock.clone());

    let generic: Arc<dyn Clock> = clock.clone();
    let (result, _) = drive_attempts(
        &orch,
        &policy(),
        &generic,
        &camera_config(),
        clock.now_utc(),
        false,
        None,
    )
    .await;

    let image_path = result.image_path.expect("image written");
    let month_dir = tmp.path().join(format!(
        "{:04}-{:02}",
        clock.now_utc().year(),
        clock.now_utc().month()
    ));
    assert_eq!(image_path.parent(), Some(month_dir.as_path()));

    let name = image_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("analemma_"), "unexpected name: {name}");
    assert!(name.ends_with(".png"));
    // No temp file left behind.
    let leftovers: Vec<_> = std::fs::read_dir(&month_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());

    // Sidecar record references the image and carries a matching checksum.
    let sidecar = image_path.with_extension("json");
    let record: MetadataRecord =
        serde_json::from_slice(&std::fs::read(&sidecar).unwrap()).unwrap();
    assert_eq!(record.image_path, image_path);
    let image_bytes = std::fs::read(&image_path).unwrap();
    let digest = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&image_bytes);
        format!("{:x}", hasher.finalize())
    };
    assert_eq!(record.sha256.as_deref(), Some(digest.as_str()));
    assert_eq!(record.provenance.timezone, "UTC");

    // Provenance reflects the job's configuration snapshot.
    let config = camera_config();
    assert_eq!(record.provenance.exposure_us, config.exposure_us);
    assert_eq!(record.provenance.gain, config.gain);
    assert_eq!(record.provenance.wb_r, config.wb_r);
    assert_eq!(record.provenance.wb_b, config.wb_b);
    assert_eq!(record.provenance.camera_model, "MockCam");
}

#[tokio::test]
async fn test_concurrent_attempts_serialize_on_camera() {
    let tmp = TempDir::new().unwrap();
    let camera = MockCamera::new();
    let clock = manual_clock();
    let orch = Arc::new(orchestrator_for(&tmp, camera.clone(), clock.clone()));

    let generic: Arc<dyn Clock> = clock.clone();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let orch = Arc::clone(&orch);
        let generic = Arc::clone(&generic);
        let config = camera_config();
        let due = clock.now_utc();
        tasks.push(tokio::spawn(async move {
            drive_attempts(&orch, &policy(), &generic, &config, due, false, None).await
        }));
    }
    for task in tasks {
        let (result, _) = task.await.unwrap();
        assert!(result.outcome.is_success());
    }

    assert_eq!(camera.max_concurrent_handles(), 1);
    assert_eq!(camera.open_count(), 4);
    assert_eq!(camera.close_count(), 4);
}
