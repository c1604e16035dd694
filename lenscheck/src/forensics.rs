// lenscheck/src/forensics.rs
//
// Forensic orchestrator: runs every detector for one image and aggregates.
//
// Each detector runs on its own blocking task. A detector that panics past
// its own error handling surfaces here as a JoinError and is converted into
// that detector's error Signal; the others are unaffected.
//
// Aggregation:
//   forensic_flags   = number of signals with suspicious == true
//   forensic_verdict = Unavailable  if every signal errored (none evaluated)
//                      Suspicious   if forensic_flags >= 1
//                      Clean        otherwise

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ElaPolicy, ForensicPolicy, NoisePolicy};
use crate::detectors::metadata::MetadataRules;
use crate::detectors::{ela, metadata, noise, DetectorKind, Signal};
use crate::error::{panic_message, WorkerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Clean,
    Suspicious,
    Unavailable,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean       => write!(f, "Clean"),
            Self::Suspicious  => write!(f, "Suspicious"),
            Self::Unavailable => write!(f, "Unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicReport {
    pub ela:              Signal,
    pub metadata:         Signal,
    pub noise:            Signal,
    pub forensic_flags:   u32,
    pub forensic_verdict: Verdict,
}

impl ForensicReport {
    pub fn aggregate(ela: Signal, metadata: Signal, noise: Signal) -> Self {
        let signals = [&ela, &metadata, &noise];
        let forensic_flags = signals.iter().filter(|s| s.is_flagged()).count() as u32;
        let forensic_verdict = if signals.iter().all(|s| s.is_error()) {
            Verdict::Unavailable
        } else if forensic_flags >= 1 {
            Verdict::Suspicious
        } else {
            Verdict::Clean
        };
        Self { ela, metadata, noise, forensic_flags, forensic_verdict }
    }

    /// Uniform degraded form used when the subsystem never initialised.
    pub fn unavailable(reason: &str) -> Self {
        let err = WorkerError::Unavailable(reason.to_string());
        Self {
            ela:              Signal::from_error(DetectorKind::Ela, &err),
            metadata:         Signal::from_error(DetectorKind::Metadata, &err),
            noise:            Signal::from_error(DetectorKind::Noise, &err),
            forensic_flags:   0,
            forensic_verdict: Verdict::Unavailable,
        }
    }
}

// ── Suite ─────────────────────────────────────────────────────────────────────

/// Initialised detector configuration, immutable after startup.
#[derive(Debug)]
pub struct ForensicSuite {
    ela:      ElaPolicy,
    metadata: MetadataRules,
    noise:    NoisePolicy,
}

impl ForensicSuite {
    pub fn initialise(policy: &ForensicPolicy) -> Result<Self> {
        policy.validate().context("invalid forensic policy")?;
        let metadata = MetadataRules::compile(&policy.metadata)?;
        codec_self_test(policy.ela.quality)?;
        Ok(Self { ela: policy.ela.clone(), metadata, noise: policy.noise.clone() })
    }

    pub async fn run(self: &Arc<Self>, bytes: Arc<[u8]>) -> ForensicReport {
        let (e_suite, e_bytes) = (Arc::clone(self), Arc::clone(&bytes));
        let (m_suite, m_bytes) = (Arc::clone(self), Arc::clone(&bytes));
        let (n_suite, n_bytes) = (Arc::clone(self), bytes);

        let (ela, metadata, noise) = tokio::join!(
            isolate(DetectorKind::Ela, move || ela::analyze(&e_bytes, &e_suite.ela)),
            isolate(DetectorKind::Metadata, move || metadata::analyze(&m_bytes, &m_suite.metadata)),
            isolate(DetectorKind::Noise, move || noise::analyze(&n_bytes, &n_suite.noise)),
        );
        ForensicReport::aggregate(ela, metadata, noise)
    }
}

/// Run one detector on the blocking pool; a panic becomes its error Signal.
pub async fn isolate<F>(kind: DetectorKind, detector: F) -> Signal
where
    F: FnOnce() -> Signal + Send + 'static,
{
    match tokio::task::spawn_blocking(detector).await {
        Ok(signal) => {
            if let Some(err) = &signal.error {
                debug!("{} detector degraded: {}", kind, err);
            }
            signal
        }
        Err(join) => {
            let reason = if join.is_panic() {
                format!("panicked: {}", panic_message(join.into_panic().as_ref()))
            } else {
                "cancelled".to_string()
            };
            let err = WorkerError::Detector { detector: kind.name(), reason };
            warn!("{}", err);
            Signal::from_error(kind, &err)
        }
    }
}

/// The JPEG codec must survive an encode/decode round trip at the
/// configured quality before ELA can be trusted.
fn codec_self_test(quality: u8) -> Result<()> {
    let sample = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 96]));
    let back = ela::round_trip(&sample, quality).context("JPEG codec self-test")?;
    if back.dimensions() != sample.dimensions() {
        bail!("JPEG codec self-test changed dimensions to {:?}", back.dimensions());
    }
    Ok(())
}

// ── Availability ──────────────────────────────────────────────────────────────

/// Forensic capability as negotiated once at startup.
#[derive(Debug, Clone)]
pub enum Forensics {
    Available(Arc<ForensicSuite>),
    Unavailable(String),
}

impl Forensics {
    pub fn negotiate(policy: Result<ForensicPolicy>) -> Self {
        match policy.and_then(|p| ForensicSuite::initialise(&p)) {
            Ok(suite) => Self::Available(Arc::new(suite)),
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!("forensics unavailable: {}", reason);
                Self::Unavailable(reason)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            Self::Available(_) => None,
            Self::Unavailable(reason) => Some(reason.as_str()),
        }
    }

    pub async fn analyze(&self, bytes: Arc<[u8]>) -> ForensicReport {
        match self {
            Self::Available(suite) => suite.run(bytes).await,
            Self::Unavailable(reason) => {
                ForensicReport::unavailable(&format!("Forensics module unavailable: {}", reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ok(suspicious: bool) -> Signal {
        Signal::evaluated(BTreeMap::new(), suspicious)
    }

    fn jpeg(img: &RgbImage) -> Arc<[u8]> {
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(img)
            .unwrap();
        out.into()
    }

    #[test]
    fn flags_count_only_true() {
        let r = ForensicReport::aggregate(
            ok(true),
            Signal::failed(DetectorKind::Metadata, "x"),
            ok(false),
        );
        assert_eq!(r.forensic_flags, 1);
        assert_eq!(r.forensic_verdict, Verdict::Suspicious);
    }

    #[test]
    fn all_clear_is_clean() {
        let r = ForensicReport::aggregate(ok(false), ok(false), ok(false));
        assert_eq!(r.forensic_flags, 0);
        assert_eq!(r.forensic_verdict, Verdict::Clean);
    }

    #[test]
    fn partial_failure_without_flags_is_still_clean() {
        let r = ForensicReport::aggregate(
            Signal::failed(DetectorKind::Ela, "a"),
            Signal::failed(DetectorKind::Metadata, "b"),
            ok(false),
        );
        assert_eq!(r.forensic_verdict, Verdict::Clean);
    }

    #[test]
    fn every_signal_errored_is_unavailable() {
        let r = ForensicReport::aggregate(
            Signal::failed(DetectorKind::Ela, "a"),
            Signal::failed(DetectorKind::Metadata, "b"),
            Signal::failed(DetectorKind::Noise, "c"),
        );
        assert_eq!(r.forensic_flags, 0);
        assert_eq!(r.forensic_verdict, Verdict::Unavailable);
    }

    #[test]
    fn unavailable_form_is_uniform() {
        let r = ForensicReport::unavailable("no codec");
        assert_eq!(r.ela.error.as_deref(), Some("no codec"));
        assert_eq!(r.ela.error, r.metadata.error);
        assert_eq!(r.metadata.error, r.noise.error);
        assert_eq!(r.forensic_flags, 0);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["forensic_verdict"], json!("Unavailable"));
        assert_eq!(
            v["noise"],
            json!({
                "variance": null, "mean_abs": null, "suspicious": null,
                "error": "no codec", "error_kind": "subsystem_unavailable"
            })
        );
    }

    #[tokio::test]
    async fn panicking_detector_is_contained() {
        let s = isolate(DetectorKind::Noise, || panic!("kernel exploded")).await;
        assert_eq!(s.suspicious, None);
        let err = s.error.unwrap();
        assert!(err.contains("noise detector failed: panicked"), "{}", err);
        assert!(err.contains("kernel exploded"), "{}", err);
        assert_eq!(s.error_kind, Some(ErrorKind::DetectorFailure));
    }

    #[tokio::test]
    async fn suite_runs_all_detectors() {
        let suite = Arc::new(ForensicSuite::initialise(&ForensicPolicy::default()).unwrap());
        let img = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 40]));
        let r = suite.run(jpeg(&img)).await;
        assert!(r.ela.error.is_none(), "{:?}", r.ela.error);
        assert!(r.metadata.error.is_none(), "{:?}", r.metadata.error);
        assert!(r.noise.error.is_none(), "{:?}", r.noise.error);
        let flagged = [&r.ela, &r.metadata, &r.noise].iter().filter(|s| s.is_flagged()).count();
        assert_eq!(r.forensic_flags as usize, flagged);
        assert_ne!(r.forensic_verdict, Verdict::Unavailable);
    }

    #[tokio::test]
    async fn garbage_bytes_make_verdict_unavailable() {
        let suite = Arc::new(ForensicSuite::initialise(&ForensicPolicy::default()).unwrap());
        let r = suite.run(Arc::from(&b"not an image at all"[..])).await;
        assert_eq!(r.forensic_verdict, Verdict::Unavailable);
        assert_eq!(r.forensic_flags, 0);
    }

    #[tokio::test]
    async fn negotiation_failure_degrades_every_request() {
        let mut policy = ForensicPolicy::default();
        policy.ela.quality = 0;
        let f = Forensics::negotiate(Ok(policy));
        assert!(!f.is_available());
        assert!(f.note().unwrap().contains("ela.quality"));
        let r = f.analyze(Arc::from(Vec::<u8>::new())).await;
        assert_eq!(r.forensic_verdict, Verdict::Unavailable);
        assert!(r.ela.error.as_deref().unwrap().starts_with("Forensics module unavailable"));
        assert_eq!(r.ela.error, r.noise.error);
    }
}
