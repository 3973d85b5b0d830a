//! File-backed settings and version accessor
//!
//! Settings live in `config.json` inside the station data directory. A missing
//! or unreadable file falls back to defaults. Environment variables (also read
//! from a `.env` file when present) override individual fields:
//!
//! - `STATION_WORKERS`: worker count
//! - `STATION_MAX_QUEUE_SIZE`: queue capacity
//! - `STATION_TIMEOUT`: default request timeout in seconds
//! - `STATION_PORT`: preferred service port
//! - `STATION_BACKEND`: backend executable path
//!
//! This accessor is the single writer; every accepted change is persisted and
//! broadcast to subscribers.

use std::path::{Path, PathBuf};
use tokio::sync::{watch, Mutex};

use shared::{process_debug, process_warn, PlatformFamily, ProcessId, Settings, VersionDescriptor};

use crate::error::HypervisorResult;
use crate::traits::ConfigAccessor;

pub const CONFIG_FILE: &str = "config.json";
pub const APP_DIR: &str = "ModelStation";

/// Settings persisted as pretty JSON
pub struct FileConfigAccessor {
    path: PathBuf,
    tx: watch::Sender<Settings>,
    write_lock: Mutex<()>,
}

impl FileConfigAccessor {
    /// Default station data directory, e.g. `~/.local/share/ModelStation`
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Load settings from `data_dir`, applying environment overrides
    pub fn load(data_dir: &Path) -> Self {
        let _ = dotenv::dotenv();
        Self::load_with(data_dir, |key| std::env::var(key).ok())
    }

    /// Load settings with an explicit override source
    pub fn load_with<F>(data_dir: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = data_dir.join(CONFIG_FILE);
        let stored = read_settings(&path);
        let settings = apply_overrides(stored.clone(), lookup);

        let settings = match settings.validate() {
            Ok(()) => settings,
            Err(e) => {
                process_warn!(ProcessId::current(), "⚠️ Ignoring environment overrides: {}", e);
                stored
            }
        };

        let (tx, _) = watch::channel(settings);
        Self {
            path,
            tx,
            write_lock: Mutex::new(()),
        }
    }

    /// Apply a change for this run only, without writing it to disk
    pub fn override_runtime<F>(&self, change: F) -> HypervisorResult<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut next = self.tx.borrow().clone();
        change(&mut next);
        next.validate()?;
        self.tx.send_replace(next.clone());
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ConfigAccessor for FileConfigAccessor {
    fn version(&self, component: &str) -> VersionDescriptor {
        VersionDescriptor::new(
            component,
            format!("v{}", env!("CARGO_PKG_VERSION")),
            option_env!("STATION_BUILD_DATE").unwrap_or("unknown"),
            PlatformFamily::current(),
        )
    }

    fn settings(&self) -> Settings {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    async fn update(&self, settings: Settings) -> HypervisorResult<Settings> {
        settings.validate()?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&settings)?;
        tokio::fs::write(&self.path, json).await?;

        process_debug!(ProcessId::current(), "💾 Settings saved to {}", self.path.display());
        self.tx.send_replace(settings.clone());
        Ok(settings)
    }
}

fn read_settings(path: &Path) -> Settings {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return Settings::default(),
    };

    match serde_json::from_str::<Settings>(&contents) {
        Ok(settings) if settings.validate().is_ok() => settings,
        Ok(_) => {
            process_warn!(ProcessId::current(), "⚠️ {} holds invalid values, using defaults", path.display());
            Settings::default()
        }
        Err(e) => {
            process_warn!(ProcessId::current(), "⚠️ Could not parse {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

/// Apply `STATION_*` overrides; unparsable values are ignored
pub fn apply_overrides<F>(mut settings: Settings, lookup: F) -> Settings
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(workers) = parse_var(&lookup, "STATION_WORKERS") {
        settings.worker_count = workers;
    }
    if let Some(size) = parse_var(&lookup, "STATION_MAX_QUEUE_SIZE") {
        settings.max_queue_size = size;
    }
    if let Some(timeout) = parse_var(&lookup, "STATION_TIMEOUT") {
        settings.timeout_seconds = timeout;
    }
    if let Some(port) = parse_var(&lookup, "STATION_PORT") {
        settings.preferred_port = port;
    }
    if let Some(backend) = lookup("STATION_BACKEND").filter(|v| !v.trim().is_empty()) {
        settings.backend_executable = Some(PathBuf::from(backend.trim()));
    }
    settings
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            process_warn!(ProcessId::current(), "⚠️ Ignoring {}={}: not a valid value", key, raw);
            None
        }
    }
}

