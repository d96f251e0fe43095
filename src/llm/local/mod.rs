// src/llm/local/mod.rs
// On-device model subsystem: acquisition state machine, resumable download,
// and the inference adapter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub mod acquisition;
pub mod client;
pub mod download;

pub use acquisition::{AcquisitionSettings, AcquisitionStatus, ModelAcquisition};
pub use client::LocalLlmClient;

/// Errors from the on-device model subsystem.
#[derive(Error, Debug, Clone)]
pub enum LocalLlmError {
    #[error("Model not available: {0}")]
    ModelMissing(String),

    #[error("Model download failed: {0}")]
    ModelDownloadFailed(String),

    #[error("Downloaded model is corrupt: {size} bytes, expected at least {min_valid}")]
    ModelCorrupt { size: u64, min_valid: u64 },

    #[error("Insufficient storage: need {need_bytes} bytes, have {have_bytes}")]
    InsufficientStorage { need_bytes: u64, have_bytes: u64 },

    #[error("Waiting for an unmetered network connection")]
    MeteredNetwork,

    #[error("Local inference failed: {0}")]
    InferenceFailed(String),

    #[error("Local inference server unavailable: {0}")]
    ServerUnavailable(String),
}

/// Lifecycle state of the on-device model file.
///
/// Exposed as a watch channel so the (excluded) UI can observe transitions;
/// the "model ready" notification fires exactly once per transition into
/// `Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadState {
    NotStarted,
    Downloading { progress: f32 },
    Completed,
    Failed { message: String },
    NeedsStorage { need_bytes: u64, have_bytes: u64 },
    WaitingForWifi,
}

impl DownloadState {
    /// Forward-looking, user-facing text for every state. Raw errors never
    /// reach the end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotStarted => "Your coach will finish setting up shortly.".to_string(),
            Self::Downloading { progress } => {
                format!("Installing your coach... {:.0}% complete.", progress * 100.0)
            }
            Self::Completed => "Your coach is ready.".to_string(),
            Self::Failed { .. } => {
                "Setup hit a snag. We'll retry automatically - check back soon.".to_string()
            }
            Self::NeedsStorage { need_bytes, .. } => format!(
                "Free up about {} MB of storage to finish setting up your coach.",
                need_bytes / (1024 * 1024)
            ),
            Self::WaitingForWifi => "Connect to Wi-Fi to finish setting up your coach.".to_string(),
        }
    }
}

/// Device capabilities the acquisition machine depends on. Injected so tests
/// (and the embedding app, which knows real network meteredness) can supply
/// their own answers.
pub trait DeviceProbe: Send + Sync {
    fn free_storage_bytes(&self, path: &Path) -> u64;
    fn is_unmetered_network(&self) -> bool;
}

/// Probe backed by sysinfo. Network meteredness cannot be detected portably
/// from here, so host networks are treated as unmetered; mobile embeddings
/// override this trait with the platform connectivity signal.
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn free_storage_bytes(&self, path: &Path) -> u64 {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| absolute.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .unwrap_or_else(|| {
                disks
                    .list()
                    .iter()
                    .map(|disk| disk.available_space())
                    .max()
                    .unwrap_or(u64::MAX)
            })
    }

    fn is_unmetered_network(&self) -> bool {
        true
    }
}
