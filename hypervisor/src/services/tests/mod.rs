//! Service-specific tests
//!
//! Each service has its own test file; the real filesystem, sockets and
//! child processes are exercised here, the control loop uses mocks instead.

#[cfg(test)]
mod backend_client;
#[cfg(test)]
mod settings;

// Common test utilities for services
#[cfg(test)]
pub mod common {
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Standard timeout for async operations in tests
    pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Helper to run async operations with timeout
    pub async fn with_timeout<T, F>(future: F) -> Result<T, tokio::time::error::Elapsed>
    where
        F: std::future::Future<Output = T>,
    {
        timeout(TEST_TIMEOUT, future).await
    }

    /// Write an executable shell script
    #[cfg(unix)]
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut permissions = std::fs::metadata(&path).expect("script metadata").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("chmod script");
        path
    }
}
