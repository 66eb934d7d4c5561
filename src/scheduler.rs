//! Daily capture scheduling.
//!
//! A single long-lived task computes the next due instant from the timezone
//! rule, sleeps until it arrives, and drives the orchestrator through the
//! retry policy until the day resolves. The due instant is recomputed from
//! the timezone rule at every scheduling decision - never derived from a
//! cached elapsed duration - so DST transitions and offset changes cannot
//! introduce drift.
//!
//! Day-level state guarantees at-most-one successful capture per calendar
//! date and at-least-one attempt: it is persisted atomically after every
//! resolved attempt, so a restart on the same day after a success does not
//! re-trigger, while a restart after a missed instant fires immediately.
//!
//! Manual (`capture_now`) requests share the orchestrator and therefore its
//! camera mutex; they are served after any in-progress attempt completes and
//! never mutate the scheduled slot's bookkeeping.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, LocalResult, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, warn};

use crate::camera::CameraPort;
use crate::clock::Clock;
use crate::config::{CameraConfig, ScheduleSpec, Settings};
use crate::error::{AppResult, CaptureError};
use crate::metadata::MetadataRecorder;
use crate::orchestrator::{CaptureJob, CaptureOrchestrator, CaptureResult};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::status::StatusReporter;
use crate::storage::{self, StorageManager};

/// Day-level capture bookkeeping, owned exclusively by the scheduler.
///
/// `last_attempt` records the date whose *scheduled* slot last resolved
/// (success or exhausted retries); manual captures only touch
/// `last_manual`, so they never satisfy or consume a scheduled slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleState {
    pub last_success: Option<NaiveDate>,
    pub last_attempt: Option<NaiveDate>,
    pub last_manual: Option<NaiveDate>,
    pub last_result: Option<CaptureResult>,
}

impl ScheduleState {
    /// Whether the scheduled slot for `date` has already resolved.
    pub fn day_resolved(&self, date: NaiveDate) -> bool {
        self.last_success == Some(date) || self.last_attempt == Some(date)
    }

    /// Load persisted state; a missing or unreadable file yields a fresh
    /// state (the scheduler then behaves as on first deployment).
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt schedule state, starting fresh");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist atomically (temp + rename), creating the parent directory.
    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CaptureError::Storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| CaptureError::Scheduler(format!("cannot serialize state: {e}")))?;
        storage::write_atomic(path, &json)
    }
}

/// Resolve the capture instant for a calendar date against the timezone
/// rule. A wall-clock time erased by a spring-forward gap fires one hour
/// later; an ambiguous (fall-back) time resolves to the earlier instant.
pub fn local_instant(date: NaiveDate, spec: &ScheduleSpec) -> DateTime<Utc> {
    let naive = date.and_time(spec.time);
    match spec.tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + chrono::Duration::hours(1);
            spec.tz
                .from_local_datetime(&shifted)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&shifted))
        }
    }
}

/// Compute the next due instant.
///
/// If today's instant has passed and today's scheduled slot is unresolved
/// (restart after a crash, or a daemon started late), the capture is due
/// immediately. Otherwise the next unresolved day's instant is returned.
pub fn next_due(now: DateTime<Utc>, state: &ScheduleState, spec: &ScheduleSpec) -> DateTime<Utc> {
    let today = now.with_timezone(&spec.tz).date_naive();
    if !state.day_resolved(today) {
        let today_instant = local_instant(today, spec);
        if today_instant > now {
            return today_instant;
        }
        return now; // overdue and unresolved: due immediately
    }
    let tomorrow = today.succ_opt().unwrap_or(today);
    local_instant(tomorrow, spec)
}

/// An out-of-band capture request with its reply channel.
#[derive(Debug)]
pub struct ManualRequest {
    reply: oneshot::Sender<CaptureResult>,
}

/// Operator-facing handle for enqueueing manual captures.
#[derive(Debug, Clone)]
pub struct CaptureService {
    tx: mpsc::Sender<ManualRequest>,
}

impl CaptureService {
    /// Enqueue an immediate out-of-band capture.
    ///
    /// Returns a queued acknowledgment in the form of a receiver for the
    /// final `CaptureResult`; the attempt runs after any in-progress
    /// attempt completes. This queued-ack policy applies whether or not a
    /// capture is currently active.
    pub async fn capture_now(&self) -> AppResult<oneshot::Receiver<CaptureResult>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManualRequest { reply })
            .await
            .map_err(|_| CaptureError::Scheduler("scheduler is not running".to_string()))?;
        Ok(rx)
    }
}

/// Control handle returned alongside the scheduler: manual-capture service
/// plus the shutdown signal.
pub struct SchedulerHandle {
    service: CaptureService,
    shutdown: watch::Sender<bool>,
}

impl SchedulerHandle {
    pub fn service(&self) -> CaptureService {
        self.service.clone()
    }

    /// Signal shutdown. An in-progress sleep aborts immediately; an
    /// in-progress attempt finishes its cleanup first.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Drive the orchestrator through the retry policy until the due window
/// resolves. Returns the final result and whether the loop was interrupted
/// by shutdown during a backoff sleep (in which case the day must not be
/// marked resolved - a restart should try again).
pub async fn drive_attempts(
    orchestrator: &CaptureOrchestrator,
    policy: &RetryPolicy,
    clock: &Arc<dyn Clock>,
    camera: &CameraConfig,
    due: DateTime<Utc>,
    manual: bool,
    mut shutdown: Option<&mut watch::Receiver<bool>>,
) -> (CaptureResult, bool) {
    let mut attempt = 1u32;
    loop {
        let job = CaptureJob {
            due,
            attempt,
            camera: camera.clone(),
            manual,
        };
        let result = orchestrator.run(&job).await;

        match policy.decide(attempt, &result.outcome) {
            RetryDecision::GiveUp => return (result, false),
            RetryDecision::Retry { delay } => {
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                let interrupted = match shutdown.as_mut() {
                    Some(rx) => {
                        tokio::select! {
                            _ = clock.sleep(delay) => false,
                            _ = rx.changed() => true,
                        }
                    }
                    None => {
                        clock.sleep(delay).await;
                        false
                    }
                };
                if interrupted {
                    return (result, true);
                }
                attempt += 1;
            }
        }
    }
}

/// The scheduling engine: owns the state, the loop, and the orchestrator.
pub struct Scheduler {
    spec: ScheduleSpec,
    camera_config: CameraConfig,
    policy: RetryPolicy,
    orchestrator: Arc<CaptureOrchestrator>,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<ScheduleState>>,
    state_path: PathBuf,
    storage: StorageManager,
    manual_rx: mpsc::Receiver<ManualRequest>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        settings: &Settings,
        camera: Arc<dyn CameraPort>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<(Self, SchedulerHandle)> {
        let spec = settings.schedule.parse()?;
        let storage = StorageManager::new(settings.storage.clone());
        let recorder = MetadataRecorder::new(settings.storage.checksum);
        let orchestrator = Arc::new(CaptureOrchestrator::new(
            camera,
            storage.clone(),
            recorder,
            Arc::clone(&clock),
            spec.tz,
        ));

        let state_path = settings.storage.state_path();
        let state = Arc::new(RwLock::new(ScheduleState::load(&state_path)));

        let (manual_tx, manual_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = Self {
            spec,
            camera_config: settings.camera.clone(),
            policy: settings.retry.clone(),
            orchestrator,
            clock,
            state,
            state_path,
            storage,
            manual_rx,
            shutdown_rx,
        };
        let handle = SchedulerHandle {
            service: CaptureService { tx: manual_tx },
            shutdown: shutdown_tx,
        };
        Ok((scheduler, handle))
    }

    /// Build the read-only status projection over this scheduler's state.
    pub fn status_reporter(&self) -> StatusReporter {
        StatusReporter::new(
            Arc::clone(&self.state),
            self.orchestrator.in_progress_flag(),
            self.orchestrator.camera_lock(),
            self.orchestrator.camera(),
            self.storage.clone(),
            self.spec,
            Arc::clone(&self.clock),
        )
    }

    /// Run the scheduling loop until shutdown.
    pub async fn run(mut self) {
        info!(
            timezone = self.spec.tz.name(),
            capture_time = %self.spec.time.format("%H:%M"),
            "scheduler started"
        );

        loop {
            let now = self.clock.now_utc();
            let due = {
                let state = self.state.read().await;
                next_due(now, &state, &self.spec)
            };
            let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
            debug!(due = %due, wait_secs = wait.as_secs(), "waiting for next due instant");

            tokio::select! {
                _ = self.clock.sleep(wait) => {
                    // Attribute the result to the date the timer actually
                    // fired on: after a multi-day host suspend the due
                    // instant is stale.
                    let date = self.clock.now_utc().with_timezone(&self.spec.tz).date_naive();
                    let mut shutdown = self.shutdown_rx.clone();
                    let (result, interrupted) = drive_attempts(
                        &self.orchestrator,
                        &self.policy,
                        &self.clock,
                        &self.camera_config,
                        due,
                        false,
                        Some(&mut shutdown),
                    )
                    .await;
                    if interrupted {
                        info!("shutdown during retry backoff, day left unresolved");
                        break;
                    }
                    self.record(date, result, false).await;
                }
                Some(request) = self.manual_rx.recv() => {
                    let now = self.clock.now_utc();
                    let date = now.with_timezone(&self.spec.tz).date_naive();
                    let mut shutdown = self.shutdown_rx.clone();
                    let (result, interrupted) = drive_attempts(
                        &self.orchestrator,
                        &self.policy,
                        &self.clock,
                        &self.camera_config,
                        now,
                        true,
                        Some(&mut shutdown),
                    )
                    .await;
                    let _ = request.reply.send(result.clone());
                    if interrupted {
                        break;
                    }
                    self.record(date, result, true).await;
                }
                _ = self.shutdown_rx.changed() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Record a resolved attempt and persist the state.
    async fn record(&self, date: NaiveDate, result: CaptureResult, manual: bool) {
        let mut state = self.state.write().await;
        if manual {
            state.last_manual = Some(date);
            info!(%date, outcome = %result.outcome, "manual capture resolved");
        } else {
            state.last_attempt = Some(date);
            if result.outcome.is_success() {
                state.last_success = Some(date);
            }
            info!(%date, outcome = %result.outcome, "day resolved");
        }
        state.last_result = Some(result);
        if let Err(e) = state.persist(&self.state_path) {
            warn!(error = %e, path = %self.state_path.display(), "failed to persist schedule state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use tempfile::TempDir;

    fn spec(time: &str, tz: &str) -> ScheduleSpec {
        ScheduleSpec {
            time: NaiveTime::parse_from_str(time, "%H:%M").unwrap(),
            tz: tz.parse().unwrap(),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_due_today_when_instant_ahead() {
        let spec = spec("12:00", "Asia/Tokyo");
        // 08:00 JST on the 22nd
        let now = utc(2025, 6, 21, 23, 0);
        let state = ScheduleState::default();
        let due = next_due(now, &state, &spec);
        // 12:00 JST on 2025-06-22 (now is 08:00 JST on the 22nd)
        assert_eq!(due, utc(2025, 6, 22, 3, 0));
    }

    #[test]
    fn test_due_immediately_after_missed_instant() {
        let spec = spec("12:00", "Asia/Tokyo");
        // 15:00 JST, nothing resolved today
        let now = utc(2025, 6, 22, 6, 0);
        let state = ScheduleState::default();
        assert_eq!(next_due(now, &state, &spec), now);
    }

    #[test]
    fn test_due_tomorrow_after_success_today() {
        let spec = spec("12:00", "Asia/Tokyo");
        let now = utc(2025, 6, 22, 6, 0); // 15:00 JST
        let state = ScheduleState {
            last_success: NaiveDate::from_ymd_opt(2025, 6, 22),
            last_attempt: NaiveDate::from_ymd_opt(2025, 6, 22),
            ..ScheduleState::default()
        };
        assert_eq!(next_due(now, &state, &spec), utc(2025, 6, 23, 3, 0));
    }

    #[test]
    fn test_due_tomorrow_after_failed_day() {
        let spec = spec("12:00", "Asia/Tokyo");
        let now = utc(2025, 6, 22, 6, 0);
        // Retries exhausted today, no success
        let state = ScheduleState {
            last_attempt: NaiveDate::from_ymd_opt(2025, 6, 22),
            ..ScheduleState::default()
        };
        assert_eq!(next_due(now, &state, &spec), utc(2025, 6, 23, 3, 0));
    }

    #[test]
    fn test_manual_capture_does_not_consume_slot() {
        let spec = spec("12:00", "Asia/Tokyo");
        let now = utc(2025, 6, 22, 6, 0); // past today's instant
        let state = ScheduleState {
            last_manual: NaiveDate::from_ymd_opt(2025, 6, 22),
            ..ScheduleState::default()
        };
        // Scheduled slot still unresolved: due immediately
        assert_eq!(next_due(now, &state, &spec), now);
    }

    #[test]
    fn test_spring_forward_gap_shifts_one_hour() {
        // 2025-03-09 02:30 does not exist in America/New_York
        let spec = spec("02:30", "America/New_York");
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        let instant = local_instant(date, &spec);
        // Resolved as 03:30 EDT = 07:30 UTC
        assert_eq!(instant, utc(2025, 3, 9, 7, 30));
    }

    #[test]
    fn test_fall_back_ambiguity_takes_earlier() {
        // 2025-11-02 01:30 occurs twice in America/New_York
        let spec = spec("01:30", "America/New_York");
        let date = NaiveDate::from_ymd_opt(2025, 11, 2).unwrap();
        let instant = local_instant(date, &spec);
        // Earlier occurrence is EDT (UTC-4): 05:30 UTC
        assert_eq!(instant, utc(2025, 11, 2, 5, 30));
    }

    #[test]
    fn test_state_persistence_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state/schedule_state.json");

        let state = ScheduleState {
            last_success: NaiveDate::from_ymd_opt(2025, 6, 21),
            last_attempt: NaiveDate::from_ymd_opt(2025, 6, 22),
            last_manual: None,
            last_result: None,
        };
        state.persist(&path).unwrap();

        let loaded = ScheduleState::load(&path);
        assert_eq!(loaded.last_success, state.last_success);
        assert_eq!(loaded.last_attempt, state.last_attempt);
    }

    #[test]
    fn test_missing_state_file_is_fresh() {
        let loaded = ScheduleState::load(Path::new("/nonexistent/state.json"));
        assert!(loaded.last_success.is_none());
        assert!(loaded.last_attempt.is_none());
    }

    #[test]
    fn test_corrupt_state_file_is_fresh() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        let loaded = ScheduleState::load(&path);
        assert!(loaded.last_success.is_none());
    }
}
