//! Test fixtures and data for hypervisor tests
//!
//! This module provides consistent test data used across all test suites.

use serde_json::json;
use shared::{BundleDescriptor, InferenceRequest, PlatformFamily, Settings, VersionDescriptor};
use std::path::Path;
use std::time::Duration;

/// Standard test data and fixtures
pub struct TestFixtures;

impl TestFixtures {
    pub const FUNCTION: &'static str = "caption";
    pub const SUPERVISOR_PID: u32 = 4242;

    /// Sweep interval used by test control loops
    pub const TICK: Duration = Duration::from_millis(20);
    /// Upper bound for any single wait in a test
    pub const WAIT: Duration = Duration::from_secs(5);

    /// Settings with no backend executable, so restarts never touch a process
    pub fn settings(workers: u32, max_queue: usize) -> Settings {
        Settings {
            worker_count: workers,
            max_queue_size: max_queue,
            timeout_seconds: 30.0,
            drain_grace_seconds: 5.0,
            ..Settings::default()
        }
    }

    pub fn request() -> InferenceRequest {
        InferenceRequest::new(Self::FUNCTION, json!({"image": "cat.png"}))
    }

    pub fn request_with_timeout(timeout: Duration) -> InferenceRequest {
        Self::request().with_timeout(timeout)
    }

    pub fn installed() -> VersionDescriptor {
        VersionDescriptor::new("hypervisor", "v0.1.0", "2025-01-01", PlatformFamily::Linux)
    }

    /// Descriptor for a staged single-file bundle under `dir`
    pub fn bundle(dir: &Path, grace_seconds: f64) -> BundleDescriptor {
        let staged = dir.join("staging").join("station");
        std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
        std::fs::write(&staged, b"#!/bin/sh\nexit 0\n").unwrap();

        BundleDescriptor {
            new_bundle_path: staged,
            old_installed_path: dir.join("installed").join("station"),
            supervising_process_id: Self::SUPERVISOR_PID,
            grace_period_seconds: grace_seconds,
            platform_family: PlatformFamily::Linux,
            version: None,
            force: false,
        }
    }
}
