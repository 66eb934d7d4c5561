//! Image storage management.
//!
//! Resolves destination directories (optionally month-partitioned), enforces
//! the minimum free-space guard, and provides the atomic write discipline
//! every persisted artifact uses: write to a `.tmp` sibling, then rename into
//! place. An observer never sees a truncated file at a final path.
//!
//! A `StorageLocation` is computed fresh for every attempt; free-space
//! numbers are never cached across attempts.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{AppResult, CaptureError};

/// Suffix used for in-flight writes.
const TEMP_SUFFIX: &str = ".tmp";

/// A resolved destination for one capture attempt.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    pub dir: PathBuf,
    pub available_bytes: u64,
}

/// Aggregate storage usage for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StorageUsage {
    pub base_path: PathBuf,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub image_count: usize,
}

/// Destination-path resolution and capacity guard.
#[derive(Debug, Clone)]
pub struct StorageManager {
    config: StorageConfig,
}

impl StorageManager {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Resolve the destination directory for a given capture date.
    ///
    /// Creates the directory if absent (idempotent), sweeps any temp files a
    /// crashed previous run left behind, and queries free space fresh.
    /// Directory-creation or free-space failures are fatal for the attempt.
    pub fn resolve(&self, date: NaiveDate) -> AppResult<StorageLocation> {
        let dir = if self.config.monthly_subfolders {
            self.config
                .base_path
                .join(date.format("%Y-%m").to_string())
        } else {
            self.config.base_path.clone()
        };

        fs::create_dir_all(&dir).map_err(|e| {
            CaptureError::Storage(format!(
                "cannot create storage directory {}: {e}",
                dir.display()
            ))
        })?;

        self.sweep_stale_temps(&dir);

        let available_bytes = available_bytes_for(&dir)?;
        debug!(
            dir = %dir.display(),
            available_mb = available_bytes / (1024 * 1024),
            "storage location resolved"
        );

        Ok(StorageLocation {
            dir,
            available_bytes,
        })
    }

    /// Whether the given free-space figure clears the configured minimum.
    pub fn check_minimum(&self, available_bytes: u64) -> bool {
        available_bytes >= self.config.min_free_bytes()
    }

    /// Deterministic image filename for a local capture timestamp.
    pub fn image_filename(local: NaiveDateTime, extension: &str) -> String {
        format!("analemma_{}.{extension}", local.format("%Y%m%d_%H%M%S"))
    }

    /// List captured images, optionally filtered by `YYYY-MM`.
    pub fn list_images(&self, year_month: Option<&str>) -> AppResult<Vec<PathBuf>> {
        let search_root = match year_month {
            Some(month) => {
                let dir = self.config.base_path.join(month);
                if !dir.exists() {
                    return Ok(Vec::new());
                }
                dir
            }
            None => self.config.base_path.clone(),
        };

        let mut images = Vec::new();
        collect_images(&search_root, &mut images)?;
        images.sort();
        Ok(images)
    }

    /// Storage usage snapshot for status reporting.
    pub fn usage(&self) -> AppResult<StorageUsage> {
        let (total_bytes, free_bytes) = if self.config.base_path.exists() {
            disk_space_for(&self.config.base_path)?
        } else {
            (0, 0)
        };
        let image_count = self.list_images(None)?.len();
        Ok(StorageUsage {
            base_path: self.config.base_path.clone(),
            total_bytes,
            free_bytes,
            image_count,
        })
    }

    /// Remove leftover `.tmp` files from an interrupted previous run.
    fn sweep_stale_temps(&self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX))
            {
                warn!(path = %path.display(), "removing stale temp file");
                let _ = fs::remove_file(&path);
            }
        }
    }
}

/// Write `bytes` to `path` atomically: temp sibling first, then rename.
///
/// On any failure the temp file is removed; the final path either holds the
/// complete previous content or the complete new content, never a partial.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let tmp = temp_path_for(path);

    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(CaptureError::Io(e));
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(CaptureError::Io(e));
    }

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> AppResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()), // base path not created yet
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("fits") | Some("png")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

fn disk_space_for(path: &Path) -> AppResult<(u64, u64)> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| canonical.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .ok_or_else(|| {
            CaptureError::Storage(format!(
                "cannot determine disk for {}",
                canonical.display()
            ))
        })?;
    Ok((disk.total_space(), disk.available_space()))
}

fn available_bytes_for(path: &Path) -> AppResult<u64> {
    disk_space_for(path).map(|(_, free)| free)
}
