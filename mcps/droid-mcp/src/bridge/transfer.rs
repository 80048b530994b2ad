//! Push/pull through a `.part` staging path
//!
//! A transfer is only committed (renamed into place) once the staged size
//! matches the source size. Failed transfers remove the staging file. A push
//! to a device directory lands under the local file's name, like `adb push`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{device_args, shell_quote, BridgeAdapter, BridgeError, BridgeResult, CallKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub source: String,
    pub destination: String,
    pub bytes: u64,
}

impl BridgeAdapter {
    pub async fn push_file(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
    ) -> BridgeResult<TransferReport> {
        let metadata = tokio::fs::metadata(local)
            .await
            .map_err(|e| BridgeError::Transfer(format!("cannot read {}: {}", local.display(), e)))?;
        if !metadata.is_file() {
            return Err(BridgeError::Transfer(format!(
                "{} is not a regular file",
                local.display()
            )));
        }

        let destination = self
            .push_destination(serial, local, remote)
            .await
            .map_err(into_transfer_error)?;
        let remote = destination.as_str();
        let staging = format!("{}.part", remote);
        info!(device = serial, local = %local.display(), remote, "pushing file");

        let result = async {
            let local_arg = local.to_string_lossy().into_owned();
            self.invoke_checked(
                &device_args(serial, ["push", local_arg.as_str(), staging.as_str()]),
                CallKind::Query,
            )
            .await?;

            let staged = self.remote_size(serial, &staging).await?;
            if staged != metadata.len() {
                return Err(BridgeError::Transfer(format!(
                    "size mismatch after push: expected {} bytes, device has {}",
                    metadata.len(),
                    staged
                )));
            }

            self.shell_args(serial, &["mv", "-f", shell_quote(&staging).as_str(), shell_quote(remote).as_str()])
                .await?;
            Ok(staged)
        }
        .await;

        match result {
            Ok(bytes) => Ok(TransferReport {
                source: local.display().to_string(),
                destination: remote.to_string(),
                bytes,
            }),
            Err(e) => {
                if let Err(cleanup) = self
                    .query(serial, &["rm", "-f", shell_quote(&staging).as_str()])
                    .await
                {
                    warn!(device = serial, staging = %staging, error = %cleanup, "failed to remove staged push");
                }
                Err(into_transfer_error(e))
            }
        }
    }

    pub async fn pull_file(
        &self,
        serial: &str,
        remote: &str,
        local: &Path,
    ) -> BridgeResult<TransferReport> {
        let expected = self.remote_size(serial, remote).await.map_err(|e| match e {
            BridgeError::CommandFailed { stderr, .. } => {
                BridgeError::Transfer(format!("cannot stat {} on device: {}", remote, stderr))
            }
            other => into_transfer_error(other),
        })?;

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BridgeError::Transfer(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let staging = staging_path(local);
        info!(device = serial, remote, local = %local.display(), "pulling file");

        let result = async {
            let staging_arg = staging.to_string_lossy().into_owned();
            self.invoke_checked(
                &device_args(serial, ["pull", remote, staging_arg.as_str()]),
                CallKind::Query,
            )
            .await?;

            let pulled = tokio::fs::metadata(&staging)
                .await
                .map_err(|e| BridgeError::Transfer(format!("staged file missing: {}", e)))?
                .len();
            if pulled != expected {
                return Err(BridgeError::Transfer(format!(
                    "size mismatch after pull: expected {} bytes, got {}",
                    expected, pulled
                )));
            }

            tokio::fs::rename(&staging, local).await.map_err(|e| {
                BridgeError::Transfer(format!("cannot move into {}: {}", local.display(), e))
            })?;
            Ok(pulled)
        }
        .await;

        match result {
            Ok(bytes) => Ok(TransferReport {
                source: remote.to_string(),
                destination: local.display().to_string(),
                bytes,
            }),
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(staging = %staging.display(), error = %cleanup, "failed to remove staged pull");
                    }
                }
                Err(into_transfer_error(e))
            }
        }
    }

    /// Final device path of a push to `remote`
    async fn push_destination(&self, serial: &str, local: &Path, remote: &str) -> BridgeResult<String> {
        let is_dir = remote.ends_with('/') || self.remote_is_dir(serial, remote).await?;
        if !is_dir {
            return Ok(remote.to_string());
        }

        let name = local.file_name().ok_or_else(|| {
            BridgeError::Transfer(format!("{} has no file name", local.display()))
        })?;
        let destination = join_remote(remote, &name.to_string_lossy());
        debug!(remote, %destination, "pushing into directory");
        Ok(destination)
    }

    /// A path that does not exist is not a directory
    async fn remote_is_dir(&self, serial: &str, path: &str) -> BridgeResult<bool> {
        match self
            .query(serial, &["stat", "-c", "%F", shell_quote(path).as_str()])
            .await
        {
            Ok(output) => Ok(output.stdout.trim() == "directory"),
            Err(BridgeError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remote_size(&self, serial: &str, path: &str) -> BridgeResult<u64> {
        let output = self
            .query(serial, &["stat", "-c", "%s", shell_quote(path).as_str()])
            .await?;
        let size = output.stdout.trim();
        debug!(path, size, "remote size");
        size.parse().map_err(|_| BridgeError::InvalidOutput {
            command: format!("shell stat -c %s {}", path),
            reason: format!("not a size: {:?}", size),
        })
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn staging_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    local.with_file_name(name)
}

/// Command-level failures inside a transfer are transfer failures; timeouts
/// and unreachable devices keep their own kind
fn into_transfer_error(e: BridgeError) -> BridgeError {
    match e {
        BridgeError::CommandFailed { stderr, command, .. } => {
            BridgeError::Transfer(format!("adb {}: {}", command, stderr))
        }
        BridgeError::InvalidOutput { reason, .. } => BridgeError::Transfer(reason),
        other => other,
    }
}
