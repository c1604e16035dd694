// lenscheck/src/detectors/mod.rs
//
// Forensic signal detectors.
//
// Each detector is a pure function: raw image bytes + its policy → Signal.
// Detectors never fail past their own boundary; internal errors come back as
// an error Signal with every statistic null, `suspicious: null`, and the
// ErrorKind of the failure.

pub mod ela;
pub mod exif;
pub mod metadata;
pub mod noise;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, WorkerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Ela,
    Metadata,
    Noise,
}

impl DetectorKind {
    /// Statistic keys present (as null) in this detector's error form.
    pub fn null_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Ela      => &["mean", "max", "std"],
            Self::Metadata => &["has_exif"],
            Self::Noise    => &["variance", "mean_abs"],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ela      => "ela",
            Self::Metadata => "metadata",
            Self::Noise    => "noise",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One forensic measurement.
///
/// `suspicious == None` means "not evaluated", distinct from `Some(false)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(flatten)]
    pub stats: BTreeMap<String, Value>,
    pub suspicious: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl Signal {
    pub fn evaluated(stats: BTreeMap<String, Value>, suspicious: bool) -> Self {
        Self { stats, suspicious: Some(suspicious), error: None, error_kind: None }
    }

    /// Error form for a detector that could not evaluate its input.
    pub fn failed(kind: DetectorKind, reason: impl Into<String>) -> Self {
        Self::error_form(kind, reason.into(), ErrorKind::DetectorFailure)
    }

    /// Error form carrying the kind of an arbitrary worker error.
    pub fn from_error(kind: DetectorKind, err: &WorkerError) -> Self {
        Self::error_form(kind, err.to_string(), err.kind())
    }

    fn error_form(kind: DetectorKind, reason: String, error_kind: ErrorKind) -> Self {
        let stats = kind
            .null_fields()
            .iter()
            .map(|k| (k.to_string(), Value::Null))
            .collect();
        Self { stats, suspicious: None, error: Some(reason), error_kind: Some(error_kind) }
    }

    pub fn is_flagged(&self) -> bool {
        self.suspicious == Some(true)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Round to 4 decimals for stable, readable wire output.
pub(crate) fn round4(v: f64) -> f64 {
    (v * 10000.0).round() / 10000.0
}
