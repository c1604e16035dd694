// lenscheck/src/protocol.rs
//
// NDJSON wire types.
//
// stdin  : one AnalysisRequest per line  {"id": ..., "image_path": "..."}
// stdout : one ReadinessRecord at startup, then exactly one AnalysisResponse
//          per non-blank input line, in input order.
//
// Requests are read as loose JSON values rather than a typed struct so that
// a wrong-typed field is reported against its name and the caller's `id` is
// still echoed back verbatim.

use std::io::Cursor;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::detectors::metadata::format_name;
use crate::ensemble::MlPrediction;
use crate::error::{ErrorKind, WorkerError};
use crate::forensics::ForensicReport;

// ── Request ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub id:         Value,
    pub image_path: PathBuf,
}

/// Echoed when a request object carries no `id` key.
pub const MISSING_ID: &str = "no-id";

/// A line that could not become a request. `id` is whatever could be
/// recovered (null when the line was not a JSON object).
#[derive(Debug)]
pub struct Rejected {
    pub id:    Value,
    pub error: WorkerError,
}

impl AnalysisRequest {
    /// Parse and shape-check one line. Existence of the file is checked
    /// later, by the worker, against the filesystem.
    pub fn parse(line: &str) -> Result<Self, Rejected> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| Rejected { id: Value::Null, error: WorkerError::BadJson(e) })?;

        let Value::Object(mut obj) = value else {
            return Err(Rejected {
                id:    Value::Null,
                error: WorkerError::InvalidField { field: "request", reason: "must be a JSON object" },
            });
        };

        let id = obj.remove("id").unwrap_or_else(|| Value::from(MISSING_ID));
        let reject = |error: WorkerError| Rejected { id: id.clone(), error };

        match obj.remove("image_path") {
            None | Some(Value::Null) => Err(reject(WorkerError::MissingField("image_path"))),
            Some(Value::String(s)) if s.trim().is_empty() => {
                Err(reject(WorkerError::MissingField("image_path")))
            }
            Some(Value::String(s)) => Ok(Self { id, image_path: PathBuf::from(s) }),
            Some(_) => Err(reject(WorkerError::InvalidField {
                field:  "image_path",
                reason: "must be a string",
            })),
        }
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// Facts about the file itself, independent of any detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFacts {
    pub size_bytes: u64,
    pub md5:        String,
    pub format:     Option<String>,
    pub width:      Option<u32>,
    pub height:     Option<u32>,
}

impl FileFacts {
    pub fn inspect(bytes: &[u8]) -> Self {
        let format = image::guess_format(bytes).ok();
        let dims = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()
            .and_then(|r| r.into_dimensions().ok());
        Self {
            size_bytes: bytes.len() as u64,
            md5:        hex::encode(md5::compute(bytes).0),
            format:     format.map(format_name),
            width:      dims.map(|(w, _)| w),
            height:     dims.map(|(_, h)| h),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub id:    Value,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(flatten)]
    pub ml: Option<MlPrediction>,
    #[serde(flatten)]
    pub forensics: Option<ForensicReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileFacts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl AnalysisResponse {
    /// Error-only response: no ML or forensic fields.
    pub fn failure(id: Value, err: &WorkerError) -> Self {
        Self {
            id,
            error:      Some(err.response_message()),
            error_kind: Some(err.kind()),
            trace:      None,
            ml:         None,
            forensics:  None,
            file:       None,
            elapsed_ms: None,
        }
    }

    /// Unexpected failure caught at the outermost request boundary.
    pub fn internal(id: Value, err: &WorkerError, trace: String) -> Self {
        Self { trace: Some(trace), ..Self::failure(id, err) }
    }

    /// Merge of both subsystems. A classifier error is reported alongside
    /// the forensic section; the ML fields are then absent.
    pub fn analysed(
        id: Value,
        ml: Result<MlPrediction, WorkerError>,
        forensics: ForensicReport,
        file: Option<FileFacts>,
        elapsed_ms: u64,
    ) -> Self {
        let (ml, error, error_kind) = match ml {
            Ok(p) => (Some(p), None, None),
            Err(e) => (None, Some(e.response_message()), Some(e.kind())),
        };
        Self {
            id,
            error,
            error_kind,
            trace: None,
            ml,
            forensics: Some(forensics),
            file,
            elapsed_ms: Some(elapsed_ms),
        }
    }
}

// ── Readiness ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ready,
    Error,
}

/// What the worker can do for the rest of its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub classification: bool,
    pub forensics:      bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessRecord {
    pub status:         Status,
    pub ml:             bool,
    pub forensics:      bool,
    pub forensics_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

impl ReadinessRecord {
    pub fn ready(caps: Capabilities, forensics_note: Option<String>, models: Vec<String>) -> Self {
        Self {
            status: Status::Ready,
            ml: caps.classification,
            forensics: caps.forensics,
            forensics_note,
            message: None,
            trace: None,
            version: env!("CARGO_PKG_VERSION"),
            models,
        }
    }

    /// The classifier could not be brought up; the worker will exit.
    pub fn failed(caps: Capabilities, forensics_note: Option<String>, err: &anyhow::Error) -> Self {
        Self {
            status: Status::Error,
            ml: caps.classification,
            forensics: caps.forensics,
            forensics_note,
            message: Some(format!("Model loading failed: {:#}", err)),
            trace: Some(format!("{:?}", err)),
            version: env!("CARGO_PKG_VERSION"),
            models: Vec::new(),
        }
    }
}
