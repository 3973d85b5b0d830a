//! Tests for FileConfigAccessor

use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;

use shared::Settings;

use crate::error::HypervisorError;
use crate::services::settings::{apply_overrides, FileConfigAccessor, CONFIG_FILE};
use crate::traits::ConfigAccessor;

fn no_env(_: &str) -> Option<String> {
    None
}

fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let accessor = FileConfigAccessor::load_with(dir.path(), no_env);

    assert_eq!(accessor.settings(), Settings::default());
    assert_eq!(accessor.path(), dir.path().join(CONFIG_FILE));
}

#[test]
fn test_unparsable_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();

    let accessor = FileConfigAccessor::load_with(dir.path(), no_env);

    assert_eq!(accessor.settings(), Settings::default());
}

#[test]
fn test_invalid_values_yield_defaults() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(CONFIG_FILE), r#"{"worker_count": 0}"#).unwrap();

    let accessor = FileConfigAccessor::load_with(dir.path(), no_env);

    assert_eq!(accessor.settings().worker_count, 1);
}

#[tokio::test]
async fn test_update_persists_and_broadcasts() {
    let dir = TempDir::new().unwrap();
    let accessor = FileConfigAccessor::load_with(dir.path(), no_env);
    let mut changes = accessor.subscribe();

    let next = Settings {
        worker_count: 3,
        max_queue_size: 4,
        ..Settings::default()
    };
    accessor.update(next.clone()).await.unwrap();

    assert!(changes.has_changed().unwrap());
    assert_eq!(*changes.borrow_and_update(), next);

    let reloaded = FileConfigAccessor::load_with(dir.path(), no_env);
    assert_eq!(reloaded.settings(), next);
}

#[tokio::test]
async fn test_update_rejects_invalid_settings() {
    let dir = TempDir::new().unwrap();
    let accessor = FileConfigAccessor::load_with(dir.path(), no_env);

    let result = accessor
        .update(Settings {
            timeout_seconds: 0.0,
            ..Settings::default()
        })
        .await;

    assert!(matches!(result, Err(HypervisorError::Shared(_))));
    assert!(!dir.path().join(CONFIG_FILE).exists());
}

#[test]
fn test_environment_overrides() {
    let settings = apply_overrides(
        Settings::default(),
        env(&[
            ("STATION_WORKERS", "4"),
            ("STATION_TIMEOUT", "12.5"),
            ("STATION_PORT", "not-a-port"),
            ("STATION_BACKEND", " /opt/station/server "),
        ]),
    );

    assert_eq!(settings.worker_count, 4);
    assert_eq!(settings.timeout_seconds, 12.5);
    assert_eq!(settings.preferred_port, 2020);
    assert_eq!(settings.backend_executable, Some(PathBuf::from("/opt/station/server")));
}

#[test]
fn test_invalid_override_keeps_stored_settings() {
    let dir = TempDir::new().unwrap();
    let accessor = FileConfigAccessor::load_with(dir.path(), env(&[("STATION_WORKERS", "0")]));

    assert_eq!(accessor.settings().worker_count, 1);
}

#[test]
fn test_runtime_override_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    let accessor = FileConfigAccessor::load_with(dir.path(), no_env);

    let settings = accessor.override_runtime(|s| s.preferred_port = 3030).unwrap();

    assert_eq!(settings.preferred_port, 3030);
    assert_eq!(accessor.settings().preferred_port, 3030);
    assert!(!dir.path().join(CONFIG_FILE).exists());
}

#[test]
fn test_version_descriptor() {
    let dir = TempDir::new().unwrap();
    let accessor = FileConfigAccessor::load_with(dir.path(), no_env);

    let version = accessor.version("hypervisor");

    assert_eq!(version.component, "hypervisor");
    assert!(version.version.starts_with('v'));
}
