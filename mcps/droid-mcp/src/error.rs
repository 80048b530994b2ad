//! Error taxonomy shared by the registry, recognition pipeline and dispatcher
//!
//! Every failure a caller can observe maps onto one [`ErrorKind`]. The kind is
//! what clients branch on; the message is for humans.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::BridgeError;

/// Stable, machine-readable classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidParameters,
    UnknownMethod,
    DeviceNotFound,
    AmbiguousDevice,
    DeviceBusy,
    BridgeTimeout,
    BridgeExecutionError,
    TransferError,
    DeviceUnreachable,
    RecognitionUnavailable,
    RecognitionFailed,
    Cancelled,
    Uncertain,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameters => "InvalidParameters",
            ErrorKind::UnknownMethod => "UnknownMethod",
            ErrorKind::DeviceNotFound => "DeviceNotFound",
            ErrorKind::AmbiguousDevice => "AmbiguousDevice",
            ErrorKind::DeviceBusy => "DeviceBusy",
            ErrorKind::BridgeTimeout => "BridgeTimeout",
            ErrorKind::BridgeExecutionError => "BridgeExecutionError",
            ErrorKind::TransferError => "TransferError",
            ErrorKind::DeviceUnreachable => "DeviceUnreachable",
            ErrorKind::RecognitionUnavailable => "RecognitionUnavailable",
            ErrorKind::RecognitionFailed => "RecognitionFailed",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Uncertain => "Uncertain",
        }
    }

    /// Kinds produced before any device work starts
    pub fn is_rejection(&self) -> bool {
        matches!(self, ErrorKind::InvalidParameters | ErrorKind::UnknownMethod)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kind plus human-readable message, as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DroidError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown method \"{0}\"")]
    UnknownMethod(String),

    #[error("device \"{0}\" is not attached")]
    DeviceNotFound(String),

    #[error("{0}")]
    AmbiguousDevice(String),

    #[error("device \"{0}\" is busy with another command")]
    DeviceBusy(String),

    /// The session lost its device while the request waited for it
    #[error("device \"{device}\" is unreachable: {reason}")]
    Unreachable { device: String, reason: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("{stage} is unavailable: {reason}")]
    RecognitionUnavailable { stage: String, reason: String },

    #[error("{stage} failed: {reason}")]
    RecognitionFailed { stage: String, reason: String },

    #[error("request cancelled before execution started")]
    Cancelled,

    #[error("request cancelled during execution, device state unknown: {0}")]
    Uncertain(String),
}

impl DroidError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DroidError::InvalidParameters(_) => ErrorKind::InvalidParameters,
            DroidError::UnknownMethod(_) => ErrorKind::UnknownMethod,
            DroidError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            DroidError::AmbiguousDevice(_) => ErrorKind::AmbiguousDevice,
            DroidError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            DroidError::Unreachable { .. } => ErrorKind::DeviceUnreachable,
            DroidError::Bridge(e) => e.kind(),
            DroidError::RecognitionUnavailable { .. } => ErrorKind::RecognitionUnavailable,
            DroidError::RecognitionFailed { .. } => ErrorKind::RecognitionFailed,
            DroidError::Cancelled => ErrorKind::Cancelled,
            DroidError::Uncertain(_) => ErrorKind::Uncertain,
        }
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        DroidError::InvalidParameters(message.into())
    }
}

pub type DroidResult<T> = Result<T, DroidError>;
