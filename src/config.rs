//! Pipeline configuration, loaded from TOML. Every field has a default,
//! so an empty file (or none at all) gives a working setup.

use crate::error::CaptureError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CHUNK_SIZE: usize = 5 * 1024 * 1024;
pub const MAX_CONCURRENCY: usize = 6;
pub const QUEUE_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Base URL of the upload API, without trailing slash
    pub api_base_url: String,
    /// SQLite file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Directory for cached PDF derivatives; `None` disables the local tier
    pub pdf_cache_dir: Option<PathBuf>,
    pub upload: UploadSettings,
    pub queue: QueueSettings,
    pub recovery: RecoverySettings,
    pub transform: TransformSettings,
    pub capability: CapabilitySettings,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3001/api".to_string(),
            database_path: Some(PathBuf::from("./data/capture.db")),
            pdf_cache_dir: Some(PathBuf::from("./data/pdf-cache")),
            upload: UploadSettings::default(),
            queue: QueueSettings::default(),
            recovery: RecoverySettings::default(),
            transform: TransformSettings::default(),
            capability: CapabilitySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadSettings {
    /// In-flight uploads per run, clamped to 1..=6
    pub concurrency: usize,
    pub chunk_size: usize,
    /// Payloads above this go through the multipart sequence
    pub multipart_threshold: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            chunk_size: CHUNK_SIZE,
            multipart_threshold: CHUNK_SIZE as u64,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            request_timeout_secs: 60,
        }
    }
}

impl UploadSettings {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub resync_interval_secs: u64,
    /// First backoff step between sweeps of the same task
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: QUEUE_MAX_RETRIES,
            resync_interval_secs: 30,
            backoff_base_secs: 60,
            backoff_max_secs: 960,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoverySettings {
    pub heartbeat_interval_secs: u64,
    pub crash_threshold_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            crash_threshold_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransformSettings {
    pub worker_threads: usize,
    pub ready_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_input_bytes: u64,
    pub max_pixels: u64,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            ready_timeout_secs: 5,
            request_timeout_secs: 30,
            max_input_bytes: 40 * 1024 * 1024,
            max_pixels: 100_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapabilitySettings {
    pub benchmark_timeout_secs: u64,
    pub benchmark_shapes: usize,
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            benchmark_timeout_secs: 5,
            benchmark_shapes: 500,
        }
    }
}

impl CaptureConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CaptureError> {
        toml::from_str(content).map_err(|e| CaptureError::Config(e.to_string()))
    }

    /// Reads a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, CaptureError> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn api_base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }
}
