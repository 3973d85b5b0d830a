//! Administrative contract types
//!
//! Supervisor lifecycle, update progress and health reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::types::PlatformFamily;

/// Lifecycle of the supervised backend process
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl SupervisorState {
    pub fn is_running(&self) -> bool {
        matches!(self, SupervisorState::Running)
    }
}

/// Backend process health as seen by the supervisor
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BackendHealth {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
    pub model: Option<String>,
}

impl BackendHealth {
    pub fn not_started() -> Self {
        Self {
            state: SupervisorState::NotStarted,
            pid: None,
            uptime_seconds: None,
            model: None,
        }
    }
}

/// Overall health answer for `/health`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthReport {
    pub hypervisor: String,
    pub backend: BackendHealth,
    pub status: String,
    pub timestamp: i64,
}

impl HealthReport {
    pub fn from_backend(backend: BackendHealth) -> Self {
        let status = if backend.state.is_running() { "healthy" } else { "degraded" };
        Self {
            hypervisor: "healthy".to_string(),
            backend,
            status: status.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Update request handed to the station
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BundleDescriptor {
    pub new_bundle_path: PathBuf,
    pub old_installed_path: PathBuf,
    pub supervising_process_id: u32,
    pub grace_period_seconds: f64,
    pub platform_family: PlatformFamily,
    /// Version of the new bundle; when present it must be newer than the installed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Install even when the version is not newer
    #[serde(default)]
    pub force: bool,
}

/// Phases of the update state machine
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Requested,
    Draining,
    Terminating,
    Replacing,
    Verifying,
    Relaunching,
    Done,
    Failed,
}

impl UpdatePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdatePhase::Done | UpdatePhase::Failed)
    }

    /// True while a job occupies the single update slot
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, UpdatePhase::Idle | UpdatePhase::Done | UpdatePhase::Failed)
    }

    /// Admission stays closed from draining until the job ends
    pub fn blocks_admission(&self) -> bool {
        matches!(
            self,
            UpdatePhase::Draining
                | UpdatePhase::Terminating
                | UpdatePhase::Replacing
                | UpdatePhase::Verifying
                | UpdatePhase::Relaunching
        )
    }
}

/// Observable status of the current or last update job
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UpdateStatus {
    pub job_id: Option<Uuid>,
    pub phase: UpdatePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UpdateStatus {
    pub fn idle() -> Self {
        Self {
            job_id: None,
            phase: UpdatePhase::Idle,
            reason: None,
            started_at: None,
            finished_at: None,
        }
    }
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Result class of an administrative call
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdminStatus {
    Ok,
    InProgress,
    Error,
}

/// Generic administrative answer
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AdminResponse {
    pub status: AdminStatus,
    pub message: String,
}

impl AdminResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: AdminStatus::Ok,
            message: message.into(),
        }
    }

    pub fn in_progress(message: impl Into<String>) -> Self {
        Self {
            status: AdminStatus::InProgress,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AdminStatus::Error,
            message: message.into(),
        }
    }
}
