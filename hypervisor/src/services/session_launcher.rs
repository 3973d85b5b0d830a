//! Relaunching an installed bundle in a new top-level session
//!
//! macOS bundles are opened through Terminal (`osascript`) or `open -n`; on
//! Linux the first terminal emulator on `PATH` is used when a display is
//! available. Whenever no launcher works the executable is started directly
//! in a new session with its output appended to `update_log.txt`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use shared::{process_info, process_warn, PlatformFamily, ProcessId};

use crate::error::{HypervisorError, HypervisorResult};
use crate::traits::{LaunchMethod, SessionLauncher};

pub const UPDATE_LOG: &str = "update_log.txt";

const LINUX_TERMINALS: &[&str] = &["x-terminal-emulator", "gnome-terminal", "konsole", "xterm"];

pub struct RealSessionLauncher {
    platform: PlatformFamily,
    log_dir: PathBuf,
    use_terminal: bool,
}

impl RealSessionLauncher {
    pub fn new(platform: PlatformFamily, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            log_dir: log_dir.into(),
            use_terminal: true,
        }
    }

    /// Skip terminal launchers and always start detached
    pub fn detached_only(mut self) -> Self {
        self.use_terminal = false;
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(UPDATE_LOG)
    }

    async fn launch_in_terminal(&self, target: &Path) -> Result<LaunchMethod, String> {
        match self.platform {
            PlatformFamily::MacOs => launch_macos(target).await,
            PlatformFamily::Linux => launch_linux_terminal(target),
            PlatformFamily::Windows => Err("no terminal launcher for windows".to_string()),
        }
    }

    fn launch_detached(&self, target: &Path) -> HypervisorResult<LaunchMethod> {
        let executable = match self.platform {
            PlatformFamily::MacOs if target.is_dir() => bundle_executable(target)
                .ok_or_else(|| HypervisorError::launch(format!("no executable inside {}", target.display())))?,
            _ => target.to_path_buf(),
        };

        std::fs::create_dir_all(&self.log_dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;

        let mut command = std::process::Command::new(&executable);
        command
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }
        new_session(&mut command);

        let child = command
            .spawn()
            .map_err(|e| HypervisorError::launch(format!("{}: {}", executable.display(), e)))?;
        process_info!(
            ProcessId::current(),
            "🚀 Relaunched {} detached (pid {}), output in {}",
            executable.display(),
            child.id(),
            self.log_path().display()
        );
        Ok(LaunchMethod::Detached)
    }
}

#[async_trait]
impl SessionLauncher for RealSessionLauncher {
    async fn launch(&self, target: &Path) -> HypervisorResult<LaunchMethod> {
        if self.use_terminal {
            match self.launch_in_terminal(target).await {
                Ok(method) => return Ok(method),
                Err(reason) => {
                    process_warn!(
                        ProcessId::current(),
                        "⚠️ Terminal launch unavailable ({}), falling back to a detached launch",
                        reason
                    );
                }
            }
        }
        self.launch_detached(target)
    }
}

async fn launch_macos(bundle: &Path) -> Result<LaunchMethod, String> {
    if let Some(executable) = bundle_executable(bundle) {
        let script = format!(
            "tell application \"Terminal\" to do script \"{}\"",
            executable.display().to_string().replace('"', "\\\"")
        );
        let status = tokio::process::Command::new("osascript")
            .args(["-e", &script])
            .stdin(Stdio::null())
            .status()
            .await;
        if matches!(status, Ok(s) if s.success()) {
            return Ok(LaunchMethod::Terminal {
                program: "osascript".to_string(),
            });
        }
    }

    let status = tokio::process::Command::new("open")
        .arg("-n")
        .arg(bundle)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| format!("open: {e}"))?;
    if status.success() {
        Ok(LaunchMethod::Terminal {
            program: "open".to_string(),
        })
    } else {
        Err(format!("open exited with {status}"))
    }
}

fn launch_linux_terminal(target: &Path) -> Result<LaunchMethod, String> {
    let has_display = ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()));
    if !has_display {
        return Err("no display available".to_string());
    }

    let program = LINUX_TERMINALS
        .iter()
        .find(|name| find_on_path(name).is_some())
        .ok_or_else(|| "no terminal emulator on PATH".to_string())?;

    let mut command = std::process::Command::new(program);
    match *program {
        "gnome-terminal" => command.arg("--").arg(target),
        _ => command.arg("-e").arg(target),
    };
    if let Some(dir) = target.parent() {
        command.current_dir(dir);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    new_session(&mut command);

    command.spawn().map_err(|e| format!("{program}: {e}"))?;
    Ok(LaunchMethod::Terminal {
        program: program.to_string(),
    })
}

/// Main executable of a `Name.app` bundle, preferring `Contents/MacOS/Name`
fn bundle_executable(bundle: &Path) -> Option<PathBuf> {
    let macos = bundle.join("Contents").join("MacOS");
    let preferred = bundle.file_stem().map(|stem| macos.join(stem));
    if let Some(path) = preferred.filter(|p| p.is_file()) {
        return Some(path);
    }
    std::fs::read_dir(&macos)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.is_file())
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn new_session(command: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and touches no parent state
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_session(_command: &mut std::process::Command) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bundle_executable_prefers_bundle_name() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("Station.app");
        let macos = bundle.join("Contents").join("MacOS");
        std::fs::create_dir_all(&macos).unwrap();
        std::fs::write(macos.join("helper"), b"x").unwrap();
        std::fs::write(macos.join("Station"), b"x").unwrap();

        assert_eq!(bundle_executable(&bundle), Some(macos.join("Station")));
    }

    #[test]
    fn test_bundle_without_executable() {
        let dir = TempDir::new().unwrap();
        assert_eq!(bundle_executable(&dir.path().join("Empty.app")), None);
    }
}
