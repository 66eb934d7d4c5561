//! Scriptable mock camera for tests.
//!
//! Fault injection mirrors the failure modes the retry policy classifies:
//! open failures (device not enumerable), configuration rejection,
//! acquisition timeouts, and corrupt frames. Counters record every call so
//! tests can assert on exactly what the orchestrator did - including that
//! no two handles were ever open concurrently.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::CameraConfig;

use super::{CameraDescriptor, CameraError, CameraHandle, CameraPort, CameraResult, Frame};

/// Fault script applied to subsequent operations.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Fail the first N `open` calls with `NotFound`.
    pub open_failures: u32,
    /// Reject every `configure` call.
    pub reject_configure: bool,
    /// Time out the first N `acquire_frame` calls.
    pub acquire_timeouts: u32,
    /// Time out every `acquire_frame` call.
    pub always_timeout: bool,
    /// Return a truncated frame for the first N acquisitions.
    pub corrupt_frames: u32,
}

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicU32,
    configures: AtomicU32,
    acquires: AtomicU32,
    closes: AtomicU32,
    open_handles: AtomicU32,
    max_open_handles: AtomicU32,
}

/// Mock camera with scriptable failures and call accounting.
#[derive(Clone, Default)]
pub struct MockCamera {
    behavior: Arc<Mutex<MockBehavior>>,
    counters: Arc<Counters>,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn open_count(&self) -> u32 {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn configure_count(&self) -> u32 {
        self.counters.configures.load(Ordering::SeqCst)
    }

    pub fn acquire_count(&self) -> u32 {
        self.counters.acquires.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Highest number of handles open at the same time.
    pub fn max_concurrent_handles(&self) -> u32 {
        self.counters.max_open_handles.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> std::sync::MutexGuard<'_, MockBehavior> {
        self.behavior
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl CameraPort for MockCamera {
    async fn open(&self) -> CameraResult<Box<dyn CameraHandle>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);

        {
            let mut behavior = self.behavior();
            if behavior.open_failures > 0 {
                behavior.open_failures -= 1;
                return Err(CameraError::NotFound(
                    "mock device not enumerable".to_string(),
                ));
            }
        }

        let now_open = self.counters.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .max_open_handles
            .fetch_max(now_open, Ordering::SeqCst);

        Ok(Box::new(MockHandle {
            camera: self.clone(),
            closed: false,
        }))
    }
}

struct MockHandle {
    camera: MockCamera,
    closed: bool,
}

impl MockHandle {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.camera
                .counters
                .open_handles
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl CameraHandle for MockHandle {
    async fn configure(&mut self, _config: &CameraConfig) -> CameraResult<()> {
        self.camera.counters.configures.fetch_add(1, Ordering::SeqCst);
        if self.camera.behavior().reject_configure {
            return Err(CameraError::Rejected(
                "mock rejected configuration".to_string(),
            ));
        }
        Ok(())
    }

    async fn acquire_frame(&mut self, timeout: Duration) -> CameraResult<Frame> {
        self.camera.counters.acquires.fetch_add(1, Ordering::SeqCst);

        {
            let mut behavior = self.camera.behavior();
            if behavior.always_timeout {
                return Err(CameraError::Timeout(timeout));
            }
            if behavior.acquire_timeouts > 0 {
                behavior.acquire_timeouts -= 1;
                return Err(CameraError::Timeout(timeout));
            }
            if behavior.corrupt_frames > 0 {
                behavior.corrupt_frames -= 1;
                return Ok(Frame {
                    width: 8,
                    height: 8,
                    channels: 3,
                    data: vec![0u8; 10], // deliberately truncated
                    captured_at: chrono::Utc::now(),
                });
            }
        }

        let (width, height) = (8u32, 8u32);
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y) % 256) as u8;
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Ok(Frame {
            width,
            height,
            channels: 3,
            data,
            captured_at: chrono::Utc::now(),
        })
    }

    async fn describe(&self) -> CameraResult<CameraDescriptor> {
        Ok(CameraDescriptor {
            model: "MockCam".to_string(),
            serial: "MOCK0001".to_string(),
            width: 8,
            height: 8,
            is_color: true,
        })
    }

    async fn close(&mut self) -> CameraResult<()> {
        self.camera.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.release();
        Ok(())
    }
}
