// lenscheck/src/error.rs
//
// Closed error taxonomy for the worker.
//
// Every failure a caller can observe belongs to exactly one ErrorKind, which
// carries a stable snake_case code. WorkerError variants refine the kind and
// provide the "<Tag>: <message>" string written into response.error.

use std::any::Any;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized through `code()`; that table is the only spelling of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum ErrorKind {
    ParseError,
    ValidationError,
    DetectorFailure,
    SubsystemUnavailable,
    InternalError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        Self::ParseError,
        Self::ValidationError,
        Self::DetectorFailure,
        Self::SubsystemUnavailable,
        Self::InternalError,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError           => "parse_error",
            Self::ValidationError      => "validation_error",
            Self::DetectorFailure      => "detector_failure",
            Self::SubsystemUnavailable => "subsystem_unavailable",
            Self::InternalError        => "internal_error",
        }
    }
}

impl From<ErrorKind> for &'static str {
    fn from(kind: ErrorKind) -> Self {
        kind.code()
    }
}

impl TryFrom<String> for ErrorKind {
    type Error = String;

    fn try_from(code: String) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|k| k.code() == code)
            .ok_or_else(|| format!("unknown error kind {:?}", code))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Bad JSON input: {0}")]
    BadJson(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field: {field} {reason}")]
    InvalidField { field: &'static str, reason: &'static str },

    #[error("Image not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("{detector} detector failed: {reason}")]
    Detector { detector: &'static str, reason: String },

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    ClassificationFailed(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadJson(_)                 => ErrorKind::ParseError,
            Self::MissingField(_)
            | Self::InvalidField { .. }
            | Self::FileNotFound(_)          => ErrorKind::ValidationError,
            Self::Detector { .. }            => ErrorKind::DetectorFailure,
            Self::Unavailable(_)             => ErrorKind::SubsystemUnavailable,
            Self::ClassificationFailed(_)
            | Self::Io(_)
            | Self::Internal(_)              => ErrorKind::InternalError,
        }
    }

    /// Variant tag used as the `<ErrorKind>` prefix of the response string.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BadJson(_)              => "BadJson",
            Self::MissingField(_)         => "MissingField",
            Self::InvalidField { .. }     => "InvalidField",
            Self::FileNotFound(_)         => "FileNotFound",
            Self::Detector { .. }         => "DetectorFailure",
            Self::Unavailable(_)          => "SubsystemUnavailable",
            Self::ClassificationFailed(_) => "ClassificationFailed",
            Self::Io(_)                   => "Io",
            Self::Internal(_)             => "Internal",
        }
    }

    /// The string written to `response.error`. Parse errors keep their bare
    /// "Bad JSON input: ..." form; everything else is tagged.
    pub fn response_message(&self) -> String {
        match self {
            Self::BadJson(_) => self.to_string(),
            _ => format!("{}: {}", self.tag(), self),
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
