//! Simulated camera.
//!
//! Generates synthetic frames so the daemon runs end to end without a vendor
//! SDK. Exposure timing is honored (capped, so absurd configurations do not
//! stall the pipeline) and frames carry a gradient pattern with a little
//! noise, matching what the encoders expect from real hardware.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;

use crate::config::CameraConfig;

use super::{CameraDescriptor, CameraError, CameraHandle, CameraPort, CameraResult, Frame};

/// Longest exposure the simulator will actually wait out.
const MAX_SIMULATED_EXPOSURE: Duration = Duration::from_millis(100);

/// Simulated camera device.
#[derive(Debug, Clone)]
pub struct SimCamera {
    descriptor: CameraDescriptor,
}

impl SimCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            descriptor: CameraDescriptor {
                model: "SimCam-1600".to_string(),
                serial: "SIM0001".to_string(),
                width,
                height,
                is_color: true,
            },
        }
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

#[async_trait]
impl CameraPort for SimCamera {
    async fn open(&self) -> CameraResult<Box<dyn CameraHandle>> {
        Ok(Box::new(SimHandle {
            descriptor: self.descriptor.clone(),
            configured: None,
            closed: false,
        }))
    }
}

struct SimHandle {
    descriptor: CameraDescriptor,
    configured: Option<CameraConfig>,
    closed: bool,
}

impl SimHandle {
    fn render_frame(&self, width: u32, height: u32) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            for x in 0..width {
                let base = ((x + y) % 256) as u8;
                let noise: u8 = rng.gen_range(0..8);
                data.push(base.saturating_add(noise));
                data.push(base / 2);
                data.push(base / 3);
            }
        }
        data
    }
}

#[async_trait]
impl CameraHandle for SimHandle {
    async fn configure(&mut self, config: &CameraConfig) -> CameraResult<()> {
        if self.closed {
            return Err(CameraError::Fault("handle already closed".to_string()));
        }
        self.configured = Some(config.clone());
        Ok(())
    }

    async fn acquire_frame(&mut self, _timeout: Duration) -> CameraResult<Frame> {
        if self.closed {
            return Err(CameraError::Fault("handle already closed".to_string()));
        }
        let config = self
            .configured
            .as_ref()
            .ok_or_else(|| CameraError::Fault("acquire before configure".to_string()))?;

        let exposure = Duration::from_micros(u64::from(config.exposure_us));
        sleep(exposure.min(MAX_SIMULATED_EXPOSURE)).await;

        let (width, height) = (self.descriptor.width, self.descriptor.height);
        Ok(Frame {
            width,
            height,
            channels: 3,
            data: self.render_frame(width, height),
            captured_at: chrono::Utc::now(),
        })
    }

    async fn describe(&self) -> CameraResult<CameraDescriptor> {
        Ok(self.descriptor.clone())
    }

    async fn close(&mut self) -> CameraResult<()> {
        self.closed = true;
        Ok(())
    }
}
