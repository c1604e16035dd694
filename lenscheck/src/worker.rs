// lenscheck/src/worker.rs
//
// Request/response channel.
//
//   start()  - bring up the ensemble and the forensic suite independently,
//              produce the single readiness record
//   serve()  - read lines until EOF; every non-blank line yields exactly one
//              response line, written and flushed before the next is read
//
// Per request:
//   parse → validate (MissingField / InvalidField / FileNotFound)
//         → read file once
//         → join!(classifier, forensic suite, file facts)
//         → merge into one response
//
// The analysis runs in its own task so a panic anywhere inside it becomes an
// InternalError response and the loop carries on.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::ensemble::{Ensemble, MlPrediction, ModelLoader};
use crate::error::{panic_message, ErrorKind, WorkerError};
use crate::forensics::Forensics;
use crate::protocol::{
    AnalysisRequest, AnalysisResponse, Capabilities, FileFacts, ReadinessRecord, Rejected,
};

/// Everything a request needs. Built once, never mutated.
pub struct Context {
    ensemble:  Arc<dyn Ensemble>,
    forensics: Forensics,
}

impl Context {
    pub fn new(ensemble: Arc<dyn Ensemble>, forensics: Forensics) -> Self {
        Self { ensemble, forensics }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities { classification: true, forensics: self.forensics.is_available() }
    }
}

pub enum Startup {
    Ready(Arc<Context>, ReadinessRecord),
    /// The classifier is mandatory; the caller must emit the record and exit.
    Failed(ReadinessRecord),
}

impl Startup {
    pub fn record(&self) -> &ReadinessRecord {
        match self {
            Self::Ready(_, rec) | Self::Failed(rec) => rec,
        }
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

pub fn start(loader: &dyn ModelLoader, forensics: Forensics) -> Startup {
    let note = forensics.note().map(str::to_string);
    match loader.load() {
        Ok(ensemble) => {
            let models = ensemble.models();
            let ctx = Context::new(ensemble, forensics);
            let caps = ctx.capabilities();
            info!("Worker ready (ml={}, forensics={})", caps.classification, caps.forensics);
            let record = ReadinessRecord::ready(caps, note, models);
            Startup::Ready(Arc::new(ctx), record)
        }
        Err(e) => {
            error!("Model loading failed: {:#}", e);
            let caps = Capabilities { classification: false, forensics: forensics.is_available() };
            Startup::Failed(ReadinessRecord::failed(caps, note, &e))
        }
    }
}

// ── Line loop ─────────────────────────────────────────────────────────────────

/// Serve until the input closes. Returns the number of responses written.
/// Only a broken output stream ends the loop early.
pub async fn serve<R, W>(ctx: Arc<Context>, mut input: R, output: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut handled = 0u64;
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        // Undecodable bytes still get a (parse error) response.
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(&ctx, line).await;
        write_record(output, &encode(&response)).await?;
        handled += 1;
    }
    info!("Input closed after {} requests", handled);
    Ok(handled)
}

pub async fn handle_line(ctx: &Arc<Context>, line: &str) -> AnalysisResponse {
    let request = match AnalysisRequest::parse(line) {
        Ok(r) => r,
        Err(Rejected { id, error }) => {
            warn!("Rejected request {}: {}", id, error);
            return AnalysisResponse::failure(id, &error);
        }
    };

    let id = request.id.clone();
    contain(id, analyse(Arc::clone(ctx), request)).await
}

/// Run one request's work in its own task. Errors and panics both come back
/// as a response for `id`; internal ones carry a trace.
async fn contain<F>(id: Value, work: F) -> AnalysisResponse
where
    F: Future<Output = Result<AnalysisResponse, WorkerError>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) if e.kind() == ErrorKind::InternalError => {
            error!("Request {} failed: {}", id, e);
            AnalysisResponse::internal(id, &e, format!("{:?}", e))
        }
        Ok(Err(e)) => {
            warn!("Request {} rejected: {}", id, e);
            AnalysisResponse::failure(id, &e)
        }
        Err(join) => {
            let detail = if join.is_panic() {
                panic_message(join.into_panic().as_ref())
            } else {
                "request task cancelled".to_string()
            };
            let e = WorkerError::Internal(format!("request handler panicked: {}", detail));
            error!("Request {}: {}", id, e);
            AnalysisResponse::internal(id, &e, detail)
        }
    }
}

async fn analyse(ctx: Arc<Context>, request: AnalysisRequest) -> Result<AnalysisResponse, WorkerError> {
    let started = Instant::now();
    let AnalysisRequest { id, image_path } = request;

    let is_file = tokio::fs::metadata(&image_path).await.map(|m| m.is_file()).unwrap_or(false);
    if !is_file {
        return Err(WorkerError::FileNotFound(image_path));
    }
    let bytes: Arc<[u8]> = tokio::fs::read(&image_path).await?.into();
    debug!("Request {}: read {} bytes from {}", id, bytes.len(), image_path.display());

    let facts_bytes = Arc::clone(&bytes);
    let (ml, forensics, file) = tokio::join!(
        classify(Arc::clone(&ctx.ensemble), image_path),
        ctx.forensics.analyze(bytes),
        tokio::task::spawn_blocking(move || FileFacts::inspect(&facts_bytes)),
    );

    if let Err(e) = &ml {
        warn!("Request {}: classifier failed: {}", id, e);
    }
    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        "Request {} done: prediction={} verdict={} flags={} elapsed={}ms",
        id,
        ml.as_ref().map(|p| p.prediction.to_string()).unwrap_or_else(|_| "error".into()),
        forensics.forensic_verdict,
        forensics.forensic_flags,
        elapsed_ms,
    );
    Ok(AnalysisResponse::analysed(id, ml, forensics, file.ok(), elapsed_ms))
}

async fn classify(ensemble: Arc<dyn Ensemble>, path: PathBuf) -> Result<MlPrediction, WorkerError> {
    match tokio::task::spawn_blocking(move || ensemble.predict(&path)).await {
        Ok(result) => result,
        Err(join) if join.is_panic() => Err(WorkerError::ClassificationFailed(format!(
            "classifier panicked: {}",
            panic_message(join.into_panic().as_ref())
        ))),
        Err(_) => Err(WorkerError::ClassificationFailed("classifier task cancelled".into())),
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

fn encode(response: &AnalysisResponse) -> Vec<u8> {
    match serde_json::to_vec(response) {
        Ok(v) => v,
        Err(e) => {
            error!("Response encoding failed: {}", e);
            let err = WorkerError::Internal(format!("response encoding failed: {}", e));
            json!({
                "id": response.id,
                "error": err.response_message(),
                "error_kind": err.kind(),
            })
            .to_string()
            .into_bytes()
        }
    }
}

/// One record, one line, flushed immediately.
pub async fn write_record<W: AsyncWrite + Unpin>(output: &mut W, record: &[u8]) -> Result<()> {
    output.write_all(record).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
