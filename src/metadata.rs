//! Provenance metadata records.
//!
//! Every successful capture is paired with a sibling `.json` record carrying
//! the exact configuration snapshot used for that attempt, the camera
//! identity, both UTC and local capture timestamps, and an optional SHA-256
//! checksum of the image file. The record is immutable after write and is
//! written with the same temp-then-rename discipline as the image itself, so
//! a crash mid-write never leaves a record referencing a missing or
//! mismatched image.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ImageType;
use crate::error::{AppResult, CaptureError};
use crate::storage::write_atomic;

/// Everything known about a capture before it hits the disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureProvenance {
    pub captured_utc: DateTime<Utc>,
    /// Local capture time, RFC 3339 with offset.
    pub captured_local: String,
    pub timezone: String,
    pub exposure_us: u32,
    pub gain: u32,
    pub wb_r: u32,
    pub wb_b: u32,
    pub format: ImageType,
    pub camera_model: String,
    pub camera_serial: String,
    pub width: u32,
    pub height: u32,
}

/// The persisted provenance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(flatten)]
    pub provenance: CaptureProvenance,
    pub image_path: PathBuf,
    pub sha256: Option<String>,
    pub software_name: String,
    pub software_version: String,
}

/// Writes provenance records alongside images.
#[derive(Debug, Clone)]
pub struct MetadataRecorder {
    checksum: bool,
}

impl MetadataRecorder {
    pub fn new(checksum: bool) -> Self {
        Self { checksum }
    }

    /// Build and atomically write the sibling record for `image_path`.
    ///
    /// `image_bytes` is the exact content written to the image file; the
    /// checksum is computed from it rather than re-reading the disk.
    pub fn record(
        &self,
        image_path: &Path,
        image_bytes: &[u8],
        provenance: &CaptureProvenance,
    ) -> AppResult<MetadataRecord> {
        let sha256 = self.checksum.then(|| {
            let mut hasher = Sha256::new();
            hasher.update(image_bytes);
            format!("{:x}", hasher.finalize())
        });

        let record = MetadataRecord {
            provenance: provenance.clone(),
            image_path: image_path.to_path_buf(),
            sha256,
            software_name: env!("CARGO_PKG_NAME").to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| CaptureError::Metadata(format!("cannot serialize record: {e}")))?;

        write_atomic(&record_path_for(image_path), &json)?;
        Ok(record)
    }
}

/// Sibling record path: same base name, `.json` extension.
pub fn record_path_for(image_path: &Path) -> PathBuf {
    image_path.with_extension("json")
}
