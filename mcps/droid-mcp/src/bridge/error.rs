//! Error types for adb invocations

use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;

/// Terminal outcome of a bridge call, after any retries
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The per-call deadline elapsed; the child process was killed
    #[error("adb did not answer within {timeout:?}: adb {command}")]
    Timeout { command: String, timeout: Duration },

    /// adb ran but reported failure
    #[error("adb command failed (exit code {code}): adb {command}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// adb succeeded but produced output we could not use
    #[error("unexpected output from adb {command}: {reason}")]
    InvalidOutput { command: String, reason: String },

    /// A push or pull did not complete; nothing was committed
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// Transient failures persisted through every attempt
    #[error("device unreachable after {attempts} attempt(s): {reason}")]
    Unreachable { attempts: u32, reason: String },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Timeout { .. } => ErrorKind::BridgeTimeout,
            BridgeError::CommandFailed { .. } | BridgeError::InvalidOutput { .. } => {
                ErrorKind::BridgeExecutionError
            }
            BridgeError::Transfer(_) => ErrorKind::TransferError,
            BridgeError::Unreachable { .. } => ErrorKind::DeviceUnreachable,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, BridgeError::Unreachable { .. })
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
