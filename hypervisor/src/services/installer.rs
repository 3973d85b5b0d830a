//! Filesystem installer for update bundles
//!
//! The new bundle is copied to a staging name next to the target, checked,
//! and swapped in with a rename. The previous target is renamed to a backup
//! first so it can be restored if anything after the swap fails.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use shared::{process_debug, process_info, process_warn, BundleShape, ProcessId};

use crate::error::{HypervisorError, HypervisorResult};
use crate::traits::{Installer, Replacement};

#[derive(Debug, Default, Clone)]
pub struct RealInstaller;

impl RealInstaller {
    pub fn new() -> Self {
        Self
    }

    /// Sibling path used while staging or backing up `target`
    fn sibling(target: &Path, tag: &str) -> HypervisorResult<PathBuf> {
        let name = target
            .file_name()
            .ok_or_else(|| replace_failed(target, "target has no file name"))?
            .to_string_lossy();
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        Ok(parent.join(format!(".{}.{}-{}", name, tag, Uuid::new_v4().simple())))
    }
}

#[async_trait]
impl Installer for RealInstaller {
    async fn replace(&self, new_bundle: &Path, target: &Path, shape: BundleShape) -> HypervisorResult<Replacement> {
        check_shape(new_bundle, shape).map_err(|reason| replace_failed(new_bundle, &reason))?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| replace_failed(target, &format!("creating parent: {e}")))?;
        }

        let staged = Self::sibling(target, "staged")?;
        copy_bundle(new_bundle, &staged, shape)
            .await
            .map_err(|e| replace_failed(target, &format!("staging copy: {e}")))?;
        if let Err(reason) = check_shape(&staged, shape) {
            remove_path(&staged).await;
            return Err(replace_failed(target, &format!("staged copy: {reason}")));
        }
        process_debug!(ProcessId::current(), "📦 Staged {} at {}", new_bundle.display(), staged.display());

        let backup = if tokio::fs::symlink_metadata(target).await.is_ok() {
            let backup = Self::sibling(target, "backup")?;
            if let Err(e) = tokio::fs::rename(target, &backup).await {
                remove_path(&staged).await;
                return Err(replace_failed(target, &format!("moving old target aside: {e}")));
            }
            Some(backup)
        } else {
            None
        };

        if let Err(e) = tokio::fs::rename(&staged, target).await {
            remove_path(&staged).await;
            if let Some(backup) = &backup {
                if let Err(restore) = tokio::fs::rename(backup, target).await {
                    process_warn!(
                        ProcessId::current(),
                        "⚠️ Could not restore {} from {}: {}",
                        target.display(),
                        backup.display(),
                        restore
                    );
                }
            }
            return Err(replace_failed(target, &format!("swapping in new bundle: {e}")));
        }

        process_info!(ProcessId::current(), "📦 Installed {} at {}", new_bundle.display(), target.display());
        Ok(Replacement {
            target: target.to_path_buf(),
            backup,
        })
    }

    async fn verify(&self, target: &Path, shape: BundleShape) -> HypervisorResult<()> {
        check_shape(target, shape).map_err(|reason| HypervisorError::VerifyFailed {
            path: target.display().to_string(),
            reason,
        })
    }

    async fn commit(&self, replacement: Replacement) -> HypervisorResult<()> {
        if let Some(backup) = replacement.backup {
            if is_dir(&backup).await {
                tokio::fs::remove_dir_all(&backup).await?;
            } else {
                tokio::fs::remove_file(&backup).await?;
            }
            process_debug!(ProcessId::current(), "🗑️ Removed backup {}", backup.display());
        }
        Ok(())
    }

    async fn rollback(&self, replacement: Replacement) -> HypervisorResult<()> {
        remove_path(&replacement.target).await;
        if let Some(backup) = replacement.backup {
            tokio::fs::rename(&backup, &replacement.target)
                .await
                .map_err(|e| replace_failed(&replacement.target, &format!("restoring backup: {e}")))?;
            process_warn!(
                ProcessId::current(),
                "↩️ Restored previous install at {}",
                replacement.target.display()
            );
        }
        Ok(())
    }

    async fn make_executable(&self, target: &Path, shape: BundleShape) -> HypervisorResult<()> {
        let executables = match shape {
            BundleShape::File => vec![target.to_path_buf()],
            BundleShape::Directory => bundle_executables(target).await?,
        };
        for executable in executables {
            set_executable(&executable).await?;
        }
        Ok(())
    }
}

/// `Ok` when `path` exists with the expected shape, `Err(reason)` otherwise
fn check_shape(path: &Path, shape: BundleShape) -> Result<(), String> {
    let metadata = std::fs::metadata(path).map_err(|_| "target missing".to_string())?;
    match shape {
        BundleShape::Directory if !metadata.is_dir() => Err("expected a directory bundle".to_string()),
        BundleShape::Directory => {
            let mut entries = std::fs::read_dir(path).map_err(|e| format!("unreadable bundle: {e}"))?;
            if entries.next().is_none() {
                Err("directory bundle is empty".to_string())
            } else {
                Ok(())
            }
        }
        BundleShape::File if !metadata.is_file() => Err("expected a single executable file".to_string()),
        BundleShape::File if metadata.len() == 0 => Err("executable is empty".to_string()),
        BundleShape::File => Ok(()),
    }
}

async fn copy_bundle(from: &Path, to: &Path, shape: BundleShape) -> std::io::Result<()> {
    match shape {
        BundleShape::File => tokio::fs::copy(from, to).await.map(|_| ()),
        BundleShape::Directory => {
            let (from, to) = (from.to_path_buf(), to.to_path_buf());
            tokio::task::spawn_blocking(move || copy_dir(&from, &to))
                .await
                .map_err(std::io::Error::other)?
        }
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&source, &dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(&source, &dest)?;
        } else {
            std::fs::copy(&source, &dest)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    let link = std::fs::read_link(source)?;
    std::os::unix::fs::symlink(link, dest)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::copy(source, dest).map(|_| ())
}

/// Executables inside a `*.app` style bundle (`Contents/MacOS/*`)
async fn bundle_executables(bundle: &Path) -> HypervisorResult<Vec<PathBuf>> {
    let macos = bundle.join("Contents").join("MacOS");
    let mut found = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(&macos).await else {
        return Ok(found);
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            found.push(entry.path());
        }
    }
    Ok(found)
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> HypervisorResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    tokio::fs::set_permissions(path, permissions).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> HypervisorResult<()> {
    Ok(())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Best-effort removal used while unwinding a failed step
async fn remove_path(path: &Path) {
    let result = if is_dir(path).await {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            process_warn!(ProcessId::current(), "⚠️ Could not remove {}: {}", path.display(), e);
        }
    }
}

fn replace_failed(path: &Path, reason: &str) -> HypervisorError {
    HypervisorError::ReplaceFailed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}
