// lenscheck/src/ensemble.rs
//
// Classifier ensemble adapter.
//
// The ensemble itself (CNN members + meta-model) is an opaque capability.
// This module loads it once at startup through a ModelLoader, invokes it
// exactly once per request, and hands back its fields untouched.
//
// The shipped implementation drives one long-lived predictor process,
// started as `<predictor> [predictor-args...]` and spoken to over NDJSON:
//
//   predictor -> worker   {"status":"ready"}            weights loaded
//                         {"status":"error","message":..} load failed
//   worker -> predictor   {"image_path":"/abs/path.jpg"}
//   predictor -> worker   {prediction, confidence, real_prob, fake_prob,
//                          flag_review, model_votes}  or  {"error": ".."}
//
// Lines that are not JSON objects are predictor chatter and are skipped.
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EnsembleConfig;
use crate::error::WorkerError;

const PROB_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Real,
    #[serde(rename = "AI/Fake")]
    Fake,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            Self::Fake => write!(f, "AI/Fake"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlPrediction {
    pub prediction:  Label,
    pub confidence:  f64,
    pub real_prob:   f64,
    pub fake_prob:   f64,
    pub flag_review: bool,
    pub model_votes: BTreeMap<String, Label>,
}

impl MlPrediction {
    /// Contract check only; values are never rewritten.
    pub fn validate(&self) -> Result<(), WorkerError> {
        let unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !unit(self.confidence) {
            return Err(WorkerError::ClassificationFailed(format!(
                "confidence {} outside [0, 1]", self.confidence
            )));
        }
        if !unit(self.real_prob) || !unit(self.fake_prob) {
            return Err(WorkerError::ClassificationFailed(format!(
                "probabilities real={} fake={} outside [0, 1]", self.real_prob, self.fake_prob
            )));
        }
        if (self.real_prob + self.fake_prob - 1.0).abs() > PROB_TOLERANCE {
            return Err(WorkerError::ClassificationFailed(format!(
                "real_prob + fake_prob = {} (expected 1)", self.real_prob + self.fake_prob
            )));
        }
        Ok(())
    }
}

/// An initialised ensemble. Called from the blocking pool, one request at a time.
pub trait Ensemble: Send + Sync {
    fn predict(&self, image_path: &Path) -> Result<MlPrediction, WorkerError>;

    /// Member model names, announced in the readiness record.
    fn models(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Produces the ensemble at startup. Failure here is fatal for the worker.
pub trait ModelLoader {
    fn load(&self) -> Result<Arc<dyn Ensemble>>;
}

// ── External predictor ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CommandLoader {
    config: EnsembleConfig,
}

impl CommandLoader {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }
}

impl ModelLoader for CommandLoader {
    /// Spawns the predictor and blocks until it reports its weights loaded.
    fn load(&self) -> Result<Arc<dyn Ensemble>> {
        let Some(program) = &self.config.predictor else {
            bail!("no predictor configured (use --predictor)");
        };
        let meta = std::fs::metadata(program)
            .with_context(|| format!("predictor {} not found", program.display()))?;
        if !meta.is_file() {
            bail!("predictor {} is not a regular file", program.display());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                bail!("predictor {} is not executable", program.display());
            }
        }

        let mut process = PredictorProcess::spawn(program, &self.config.predictor_args)?;
        process
            .await_ready()
            .with_context(|| format!("loading predictor {}", program.display()))?;

        info!(
            "Predictor {} ready (pid {}, {} models)",
            program.display(), process.child.id(), self.config.models.len()
        );
        Ok(Arc::new(CommandEnsemble {
            models:  self.config.models.clone(),
            process: Mutex::new(process),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum SetupMessage {
    Ready,
    Error { message: String },
}

#[derive(Debug)]
struct PredictorProcess {
    child:  Child,
    stdin:  ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl PredictorProcess {
    fn spawn(program: &Path, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawning predictor {}", program.display()))?;
        let stdin  = child.stdin.take().ok_or_else(|| anyhow!("predictor stdin not captured"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("predictor stdout not captured"))?;
        Ok(Self { child, stdin, stdout: BufReader::new(stdout) })
    }

    fn await_ready(&mut self) -> Result<()> {
        loop {
            let Some(line) = self.next_object()? else {
                bail!("predictor exited before becoming ready ({})", self.exit_status());
            };
            match serde_json::from_str::<SetupMessage>(&line) {
                Ok(SetupMessage::Ready) => return Ok(()),
                Ok(SetupMessage::Error { message }) => bail!("predictor setup failed: {}", message),
                Err(_) => debug!("predictor setup: {}", line),
            }
        }
    }

    /// Next line that looks like a JSON object, or None once stdout closes.
    fn next_object(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.starts_with('{') {
                return Ok(Some(trimmed.to_string()));
            }
            if !trimmed.is_empty() {
                debug!("predictor: {}", trimmed);
            }
        }
    }

    fn send(&mut self, image_path: &Path) -> std::io::Result<()> {
        let mut request = serde_json::json!({ "image_path": image_path.to_string_lossy() }).to_string();
        request.push('\n');
        self.stdin.write_all(request.as_bytes())?;
        self.stdin.flush()
    }

    fn exit_status(&mut self) -> String {
        match self.child.wait() {
            Ok(status) => status.to_string(),
            Err(e) => format!("status unknown: {}", e),
        }
    }
}

impl Drop for PredictorProcess {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

/// The predictor serves one image at a time; the mutex serialises requests
/// over its single stdin/stdout pair.
#[derive(Debug)]
pub struct CommandEnsemble {
    models:  Vec<String>,
    process: Mutex<PredictorProcess>,
}

impl Ensemble for CommandEnsemble {
    fn predict(&self, image_path: &Path) -> Result<MlPrediction, WorkerError> {
        let mut process = self.process.lock();

        process.send(image_path).map_err(|e| {
            WorkerError::ClassificationFailed(format!("writing to predictor: {}", e))
        })?;
        let line = process
            .next_object()
            .map_err(|e| WorkerError::ClassificationFailed(format!("reading from predictor: {}", e)))?;
        let Some(line) = line else {
            let status = process.exit_status();
            warn!("Predictor exited mid-request ({})", status);
            return Err(WorkerError::ClassificationFailed(format!("predictor exited ({})", status)));
        };
        drop(process);

        let prediction = parse_reply(&line)?;
        debug!(
            "predictor verdict {} ({:.4}) for {}",
            prediction.prediction, prediction.confidence, image_path.display()
        );
        Ok(prediction)
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }
}

/// One reply line: either a prediction or `{"error": ".."}`.
pub fn parse_reply(line: &str) -> Result<MlPrediction, WorkerError> {
    let unreadable = |e: serde_json::Error| {
        WorkerError::ClassificationFailed(format!("predictor output unreadable: {}", e))
    };
    let value: Value = serde_json::from_str(line).map_err(unreadable)?;
    if let Some(message) = value.get("error") {
        let message = match message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(WorkerError::ClassificationFailed(message));
    }
    let prediction: MlPrediction = serde_json::from_value(value).map_err(unreadable)?;
    prediction.validate()?;
    Ok(prediction)
}
