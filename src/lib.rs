//! Unattended daily image capture for a fixed hardware camera.
//!
//! A single long-running scheduler fires once per local calendar day at a
//! configured wall-clock time, drives a capture attempt through a bounded
//! retry policy, and persists each image with a sibling provenance record.
//! Day-level state survives restarts, so a crash never doubles a day's
//! capture and a missed instant fires as soon as the daemon is back up.

pub mod camera;
pub mod clock;
pub mod config;
pub mod encode;
pub mod error;
pub mod metadata;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod storage;

pub use config::Settings;
pub use error::{AppResult, CaptureError, Outcome};
pub use orchestrator::{CaptureOrchestrator, CaptureResult};
pub use scheduler::{CaptureService, Scheduler, SchedulerHandle};
pub use status::{StatusReporter, StatusSnapshot};
