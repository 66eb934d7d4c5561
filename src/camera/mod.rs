//! Camera abstraction layer.
//!
//! Defines the logical capability contract the capture engine consumes:
//! open, configure (exposure/gain/white-balance), acquire one frame with a
//! bounded timeout, describe, close. The engine treats the camera as a
//! fallible, exclusively-owned resource; it never sees SDK register-level
//! detail.
//!
//! Two implementations ship with the crate:
//!
//! - [`sim::SimCamera`] - deterministic synthetic frames, used by the daemon
//!   when no vendor SDK is linked
//! - [`mock::MockCamera`] - scriptable fault injection for tests
//!
//! A handle is scoped to a single capture attempt: acquired at the start of
//! an orchestrator run and closed on every exit path before control returns
//! to the scheduler. No two attempts hold a handle concurrently.

pub mod mock;
pub mod sim;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CameraConfig;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device could not be enumerated or opened. Transient: retried.
    #[error("no camera found: {0}")]
    NotFound(String),
    /// The hardware refused the requested configuration. Fatal: not retried.
    #[error("configuration rejected: {0}")]
    Rejected(String),
    /// Frame acquisition exceeded its bound. Transient: retried.
    #[error("frame acquisition timed out after {0:?}")]
    Timeout(Duration),
    /// The frame arrived malformed. Transient: retried.
    #[error("corrupt frame: {0}")]
    Corrupt(String),
    /// Any other hardware fault.
    #[error("camera fault: {0}")]
    Fault(String),
}

/// Result type for camera operations.
pub type CameraResult<T> = Result<T, CameraError>;

/// Static description of an attached camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub model: String,
    pub serial: String,
    pub width: u32,
    pub height: u32,
    pub is_color: bool,
}

/// One raw frame as delivered by the sensor.
///
/// Pixel data is row-major, interleaved (`RGBRGB...` for 3 channels).
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// A frame is well-formed when its buffer length matches its geometry.
    pub fn is_well_formed(&self) -> bool {
        let expected = self.width as usize * self.height as usize * self.channels as usize;
        expected > 0 && self.data.len() == expected
    }
}

/// A camera device that can be opened for one capture attempt.
#[async_trait]
pub trait CameraPort: Send + Sync {
    /// Enumerate and open the device, returning an exclusive handle.
    async fn open(&self) -> CameraResult<Box<dyn CameraHandle>>;
}

/// An exclusively-owned open camera.
#[async_trait]
pub trait CameraHandle: Send {
    /// Apply the exposure/gain/white-balance snapshot.
    async fn configure(&mut self, config: &CameraConfig) -> CameraResult<()>;

    /// Acquire a single frame, bounded by `timeout`.
    async fn acquire_frame(&mut self, timeout: Duration) -> CameraResult<Frame>;

    /// Describe the device without capturing.
    async fn describe(&self) -> CameraResult<CameraDescriptor>;

    /// Release the device. Idempotent.
    async fn close(&mut self) -> CameraResult<()>;
}
