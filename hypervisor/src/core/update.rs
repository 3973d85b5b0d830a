//! Update job validation and phase bookkeeping
//!
//! The phase order is fixed: `Idle → Requested → Draining → Terminating →
//! Replacing → Verifying → Relaunching → Done`, with `Failed` reachable from
//! every in-flight phase.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use shared::{
    wait_duration, BundleDescriptor, BundleShape, PlatformFamily, UpdatePhase, UpdateStatus, VersionDescriptor,
    MAX_WAIT_SECONDS,
};

use crate::error::{HypervisorError, HypervisorResult};

/// A validated update request
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateJob {
    pub id: Uuid,
    pub new_bundle_path: PathBuf,
    pub old_installed_path: PathBuf,
    pub supervising_process_id: u32,
    pub grace_period: Duration,
    pub platform: PlatformFamily,
    pub version: Option<String>,
}

impl UpdateJob {
    /// Validate a descriptor against the installed version
    pub fn from_descriptor(
        id: Uuid,
        descriptor: BundleDescriptor,
        installed: &VersionDescriptor,
    ) -> HypervisorResult<Self> {
        let grace = descriptor.grace_period_seconds;
        let grace_period = wait_duration("grace_period_seconds", grace).map_err(|_| {
            invalid(format!(
                "grace period must be between 0 and {MAX_WAIT_SECONDS}s, got {grace}"
            ))
        })?;
        if descriptor.supervising_process_id == 0 {
            return Err(invalid("supervising process id is unknown"));
        }
        if descriptor.old_installed_path.as_os_str().is_empty() {
            return Err(invalid("installed path is unknown"));
        }
        if !descriptor.new_bundle_path.exists() {
            return Err(invalid(format!(
                "new bundle {} does not exist",
                descriptor.new_bundle_path.display()
            )));
        }
        if descriptor.new_bundle_path == descriptor.old_installed_path {
            return Err(invalid("new bundle and installed target are the same path"));
        }
        if let Some(version) = &descriptor.version {
            if !descriptor.force && !installed.is_older_than(version) {
                return Err(invalid(format!(
                    "version {} is not newer than installed {}",
                    version, installed.version
                )));
            }
        }

        Ok(Self {
            id,
            new_bundle_path: descriptor.new_bundle_path,
            old_installed_path: descriptor.old_installed_path,
            supervising_process_id: descriptor.supervising_process_id,
            grace_period,
            platform: descriptor.platform_family,
            version: descriptor.version,
        })
    }

    pub fn shape(&self) -> BundleShape {
        self.platform.bundle_shape()
    }
}

fn invalid(reason: impl Into<String>) -> HypervisorError {
    HypervisorError::InvalidUpdate { reason: reason.into() }
}

/// Next phase on the success path
pub fn successor(phase: UpdatePhase) -> Option<UpdatePhase> {
    match phase {
        UpdatePhase::Idle => Some(UpdatePhase::Requested),
        UpdatePhase::Requested => Some(UpdatePhase::Draining),
        UpdatePhase::Draining => Some(UpdatePhase::Terminating),
        UpdatePhase::Terminating => Some(UpdatePhase::Replacing),
        UpdatePhase::Replacing => Some(UpdatePhase::Verifying),
        UpdatePhase::Verifying => Some(UpdatePhase::Relaunching),
        UpdatePhase::Relaunching => Some(UpdatePhase::Done),
        UpdatePhase::Done | UpdatePhase::Failed => None,
    }
}

/// Open a new job unless one is in flight
pub fn begin(status: &mut UpdateStatus, job_id: Uuid, now: DateTime<Utc>) -> bool {
    if status.phase.is_in_flight() {
        return false;
    }
    *status = UpdateStatus {
        job_id: Some(job_id),
        phase: UpdatePhase::Requested,
        reason: None,
        started_at: Some(now),
        finished_at: None,
    };
    true
}

/// Move to `next` if it is the successor of the current phase
pub fn advance(status: &mut UpdateStatus, next: UpdatePhase, now: DateTime<Utc>) -> bool {
    if successor(status.phase) != Some(next) {
        return false;
    }
    status.phase = next;
    if next.is_terminal() {
        status.finished_at = Some(now);
    }
    true
}

/// Terminate the current job with a reason
pub fn fail(status: &mut UpdateStatus, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
    if !status.phase.is_in_flight() {
        return false;
    }
    status.phase = UpdatePhase::Failed;
    status.reason = Some(reason.into());
    status.finished_at = Some(now);
    true
}
