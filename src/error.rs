//! Custom error types for the application.
//!
//! This module defines the primary error type, `CaptureError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle different kinds of errors, from configuration and
//! I/O issues to camera hardware problems.
//!
//! ## Failure taxonomy
//!
//! Every error classifies as either *fatal* or *transient* for the purposes of
//! the per-day retry loop:
//!
//! - **Fatal**: storage exhausted, directory uncreatable, free space
//!   unqueryable, configuration rejected by the hardware. These will not
//!   self-resolve within the same day's capture window and are never retried.
//! - **Transient**: camera not enumerable, frame acquisition timeout, corrupt
//!   frame, ordinary I/O errors. These are retried per [`RetryPolicy`]
//!   (`crate::retry::RetryPolicy`) up to its bound.
//!
//! The [`Outcome`] enum is the attempt-level projection of this taxonomy. An
//! orchestrator run never propagates a `CaptureError` to its caller; it is
//! always converted to an `Outcome` inside a `CaptureResult`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera not found: {0}")]
    CameraNotFound(String),

    #[error("Camera rejected configuration: {0}")]
    ConfigRejected(String),

    #[error("Frame acquisition timed out after {0:?}")]
    AcquireTimeout(Duration),

    #[error("Corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("Camera fault: {0}")]
    Camera(String),

    #[error("Insufficient storage: {available} bytes available, {required} required")]
    InsufficientStorage { available: u64, required: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Image encoding error: {0}")]
    Encode(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl CaptureError {
    /// Whether this failure will not self-resolve within the day's window.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::Config(_)
                | CaptureError::ConfigRejected(_)
                | CaptureError::InsufficientStorage { .. }
                | CaptureError::Storage(_)
                | CaptureError::Scheduler(_)
        )
    }
}

impl From<crate::camera::CameraError> for CaptureError {
    fn from(err: crate::camera::CameraError) -> Self {
        use crate::camera::CameraError;
        match err {
            CameraError::NotFound(msg) => CaptureError::CameraNotFound(msg),
            CameraError::Rejected(msg) => CaptureError::ConfigRejected(msg),
            CameraError::Timeout(dur) => CaptureError::AcquireTimeout(dur),
            CameraError::Corrupt(msg) => CaptureError::CorruptFrame(msg),
            CameraError::Fault(msg) => CaptureError::Camera(msg),
        }
    }
}

/// The resolution of a single capture attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Retried per policy within the same due window.
    Transient(String),
    /// Not retried; the day is marked failed.
    Fatal(String),
}

impl Outcome {
    pub fn from_error(err: &CaptureError) -> Self {
        if err.is_fatal() {
            Outcome::Fatal(err.to_string())
        } else {
            Outcome::Transient(err.to_string())
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Transient(reason) => write!(f, "transient failure: {reason}"),
            Outcome::Fatal(reason) => write!(f, "fatal failure: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::CameraNotFound("no device on USB".to_string());
        assert_eq!(err.to_string(), "Camera not found: no device on USB");
    }

    #[test]
    fn test_fatal_classification() {
        let fatal = CaptureError::InsufficientStorage {
            available: 10,
            required: 1024,
        };
        assert!(fatal.is_fatal());
        assert!(matches!(Outcome::from_error(&fatal), Outcome::Fatal(_)));

        let transient = CaptureError::AcquireTimeout(Duration::from_secs(5));
        assert!(!transient.is_fatal());
        assert!(matches!(
            Outcome::from_error(&transient),
            Outcome::Transient(_)
        ));
    }

    #[test]
    fn test_outcome_roundtrip() {
        let outcome = Outcome::Transient("timeout".to_string());
        let json = serde_json::to_string(&outcome).expect("serialize");
        let back: Outcome = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(outcome, back);
    }
}
