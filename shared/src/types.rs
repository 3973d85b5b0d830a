//! Core types used throughout the model station

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::errors::{SharedError, SharedResult};

/// Global process role - set once at startup, used to tag log events
static PROCESS_ID: OnceLock<ProcessId> = OnceLock::new();

/// Role of the running process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessId {
    /// Long-running station process serving requests
    Hypervisor,
    /// Standalone update run launched outside the serving process
    Updater,
}

impl ProcessId {
    /// Initialize the global process role for the serving hypervisor
    pub fn init_hypervisor() -> &'static ProcessId {
        PROCESS_ID.get_or_init(|| ProcessId::Hypervisor)
    }

    /// Initialize the global process role for a standalone update run
    pub fn init_updater() -> &'static ProcessId {
        PROCESS_ID.get_or_init(|| ProcessId::Updater)
    }

    /// Current process role; defaults to the hypervisor when never initialized
    pub fn current() -> &'static ProcessId {
        PROCESS_ID.get_or_init(|| ProcessId::Hypervisor)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Hypervisor => write!(f, "hypervisor"),
            ProcessId::Updater => write!(f, "updater"),
        }
    }
}

/// Unique identifier for an inference request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = SharedError;

    fn from_str(s: &str) -> SharedResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| SharedError::InvalidRequestId { input: s.to_string() })
    }
}

/// Identifier of a worker slot in the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker_{}", self.0)
    }
}

/// Shape of an installed bundle on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleShape {
    /// A directory such as `Station.app`
    Directory,
    /// A single executable file
    File,
}

/// Operating system family; selects bundle shape and relaunch mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformFamily {
    MacOs,
    Linux,
    Windows,
}

impl PlatformFamily {
    /// Platform family of the running binary
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            PlatformFamily::MacOs
        } else if cfg!(target_os = "windows") {
            PlatformFamily::Windows
        } else {
            PlatformFamily::Linux
        }
    }

    pub fn bundle_shape(&self) -> BundleShape {
        match self {
            PlatformFamily::MacOs => BundleShape::Directory,
            PlatformFamily::Linux | PlatformFamily::Windows => BundleShape::File,
        }
    }
}

impl fmt::Display for PlatformFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformFamily::MacOs => write!(f, "macos"),
            PlatformFamily::Linux => write!(f, "linux"),
            PlatformFamily::Windows => write!(f, "windows"),
        }
    }
}

impl FromStr for PlatformFamily {
    type Err = SharedError;

    fn from_str(s: &str) -> SharedResult<Self> {
        match s.to_lowercase().as_str() {
            "macos" | "mac" | "darwin" => Ok(PlatformFamily::MacOs),
            "linux" | "ubuntu" => Ok(PlatformFamily::Linux),
            "windows" => Ok(PlatformFamily::Windows),
            _ => Err(SharedError::UnknownPlatform { input: s.to_string() }),
        }
    }
}

/// Version information for one installed component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub component: String,
    pub version: String,
    pub build_date: String,
    pub target_platform: PlatformFamily,
}

impl VersionDescriptor {
    pub fn new(
        component: impl Into<String>,
        version: impl Into<String>,
        build_date: impl Into<String>,
        target_platform: PlatformFamily,
    ) -> Self {
        Self {
            component: component.into(),
            version: version.into(),
            build_date: build_date.into(),
            target_platform,
        }
    }

    /// True when `candidate` parses and compares strictly greater than this version
    pub fn is_older_than(&self, candidate: &str) -> bool {
        match (parse_version(&self.version), parse_version(candidate)) {
            (Ok(current), Ok(latest)) => latest > current,
            _ => false,
        }
    }
}

/// Parse `v0.0.10` / `1.2.3` into numeric components
pub fn parse_version(input: &str) -> SharedResult<Vec<u64>> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(SharedError::InvalidVersion { input: input.to_string() });
    }

    digits
        .split('.')
        .map(|part| part.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| SharedError::InvalidVersion { input: input.to_string() })
}

/// Longest timeout or grace period accepted from clients and operators
pub const MAX_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MAX_WAIT_SECONDS: f64 = 604_800.0;

/// Deadlines that cannot be represented are pushed out this far instead
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Convert a seconds value into a `Duration` in `0..=MAX_WAIT`
pub fn wait_duration(field: &str, seconds: f64) -> SharedResult<Duration> {
    if !(seconds.is_finite() && (0.0..=MAX_WAIT_SECONDS).contains(&seconds)) {
        return Err(invalid(field, seconds));
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid(field, seconds))
}

/// `now + wait` without overflowing the platform clock
pub fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Default preferred service port
pub const SERVICE_PORT: u16 = 2020;
/// Default number of ports tried upward from the preferred one
pub const PORT_SEARCH_RANGE: u16 = 20;
/// Default port handed to the backend process
pub const BACKEND_PORT: u16 = 20200;

/// Mutable station settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub worker_count: u32,
    pub max_queue_size: usize,
    pub timeout_seconds: f64,
    pub preferred_port: u16,
    pub port_search_range: u16,
    pub service_host: String,
    pub backend_executable: Option<PathBuf>,
    pub backend_working_dir: Option<PathBuf>,
    pub backend_port: u16,
    pub backend_required_files: Vec<PathBuf>,
    pub backend_ready_marker: String,
    pub backend_ready_timeout_seconds: u64,
    pub backend_stop_timeout_seconds: u64,
    pub launch_retries: u32,
    pub drain_grace_seconds: f64,
    pub model: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_count: 1,
            max_queue_size: 10,
            timeout_seconds: 30.0,
            preferred_port: SERVICE_PORT,
            port_search_range: PORT_SEARCH_RANGE,
            service_host: "127.0.0.1".to_string(),
            backend_executable: None,
            backend_working_dir: None,
            backend_port: BACKEND_PORT,
            backend_required_files: Vec::new(),
            backend_ready_marker: "READY".to_string(),
            backend_ready_timeout_seconds: 600,
            backend_stop_timeout_seconds: 5,
            launch_retries: 2,
            drain_grace_seconds: 30.0,
            model: None,
        }
    }
}

impl Settings {
    /// Reject values the pool and supervisor cannot operate with
    pub fn validate(&self) -> SharedResult<()> {
        if self.worker_count == 0 {
            return Err(invalid("worker_count", self.worker_count));
        }
        if self.timeout_seconds <= 0.0 {
            return Err(invalid("timeout_seconds", self.timeout_seconds));
        }
        wait_duration("timeout_seconds", self.timeout_seconds)?;
        wait_duration("drain_grace_seconds", self.drain_grace_seconds)?;
        if self.backend_ready_timeout_seconds > MAX_WAIT.as_secs() {
            return Err(invalid("backend_ready_timeout_seconds", self.backend_ready_timeout_seconds));
        }
        if self.backend_stop_timeout_seconds > MAX_WAIT.as_secs() {
            return Err(invalid("backend_stop_timeout_seconds", self.backend_stop_timeout_seconds));
        }
        if self.backend_ready_marker.is_empty() {
            return Err(invalid("backend_ready_marker", "\"\""));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        wait_duration("timeout_seconds", self.timeout_seconds).unwrap_or(MAX_WAIT)
    }

    pub fn drain_grace(&self) -> Duration {
        wait_duration("drain_grace_seconds", self.drain_grace_seconds).unwrap_or(MAX_WAIT)
    }

    /// True when a change between `self` and `next` needs the pool to be rebuilt
    pub fn requires_resize(&self, next: &Settings) -> bool {
        self.worker_count != next.worker_count || self.max_queue_size != next.max_queue_size
    }

    /// True when a change needs the backend process relaunched without resizing
    pub fn requires_restart(&self, next: &Settings) -> bool {
        self.backend_executable != next.backend_executable
            || self.backend_working_dir != next.backend_working_dir
            || self.backend_port != next.backend_port
            || self.model != next.model
    }
}

fn invalid(field: &str, value: impl fmt::Display) -> SharedError {
    SharedError::InvalidConfig {
        field: field.to_string(),
        value: value.to_string(),
    }
}
