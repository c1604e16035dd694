// lenscheck/src/config.rs
//
// Forensic calibration policy and ensemble wiring.
//
// Thresholds differ between image sources (phone JPEGs, scanner TIFFs,
// re-shared social media images) so none of them are baked into detector
// logic. The policy is loaded once at startup from an optional JSON file,
// every field optional, and then held immutably for the process lifetime.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_ELA_QUALITY: u8 = 90;

const DEFAULT_SOFTWARE_SIGNATURES: &[&str] = &[
    "photoshop",
    "gimp",
    "lightroom",
    "affinity",
    "pixelmator",
    "snapseed",
    "picsart",
    "facetune",
    "canva",
    "midjourney",
    "stable diffusion",
    "dall-e",
    "firefly",
    "comfyui",
];

// ── Per-detector policy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElaPolicy {
    /// JPEG quality used for the re-encode pass.
    pub quality: u8,
    /// Mean raw channel difference above which the image is suspicious.
    pub mean_threshold: f64,
}

impl Default for ElaPolicy {
    fn default() -> Self {
        Self { quality: DEFAULT_ELA_QUALITY, mean_threshold: 15.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataPolicy {
    /// Case-insensitive substrings matched against the Software tag.
    pub software_signatures: Vec<String>,
    /// DateTime differing from DateTimeOriginal marks a post-capture edit.
    pub flag_datetime_mismatch: bool,
    pub datetime_tolerance_secs: i64,
    /// Software tag present while Make and Model are both absent.
    pub flag_software_without_camera: bool,
    /// An image without any tag table. Off by default: stripped metadata
    /// is the norm for re-shared images.
    pub flag_missing_exif: bool,
}

impl Default for MetadataPolicy {
    fn default() -> Self {
        Self {
            software_signatures: DEFAULT_SOFTWARE_SIGNATURES.iter().map(|s| s.to_string()).collect(),
            flag_datetime_mismatch: true,
            datetime_tolerance_secs: 2,
            flag_software_without_camera: false,
            flag_missing_exif: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoisePolicy {
    /// Residual variance below this is unnaturally smooth. Zero disables the
    /// floor: clean renders and graphics legitimately carry no noise.
    pub min_variance: f64,
    /// Residual variance above this is implausibly noisy.
    pub max_variance: f64,
    /// Coefficient of variation of per-block residual energy above which
    /// the noise field is inconsistent across the frame.
    pub block_cv_threshold: f64,
    pub block_size: u32,
}

impl Default for NoisePolicy {
    fn default() -> Self {
        Self { min_variance: 0.0, max_variance: 400.0, block_cv_threshold: 1.5, block_size: 32 }
    }
}

// ── Ensemble ──────────────────────────────────────────────────────────────────

/// How to reach the classifier ensemble. Filled from the CLI.
#[derive(Debug, Clone, Default)]
pub struct EnsembleConfig {
    pub predictor:      Option<PathBuf>,
    /// Passed once, when the predictor process is started.
    pub predictor_args: Vec<String>,
    pub models:         Vec<String>,
}

// ── Aggregate policy ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForensicPolicy {
    pub ela:      ElaPolicy,
    pub metadata: MetadataPolicy,
    pub noise:    NoisePolicy,
}

impl ForensicPolicy {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy {}", path.display()))?;
        let policy: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing policy {}", path.display()))?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.ela.quality) {
            bail!("ela.quality must be within 1..=100, got {}", self.ela.quality);
        }
        check_threshold("ela.mean_threshold", self.ela.mean_threshold)?;
        check_threshold("noise.min_variance", self.noise.min_variance)?;
        check_threshold("noise.max_variance", self.noise.max_variance)?;
        check_threshold("noise.block_cv_threshold", self.noise.block_cv_threshold)?;
        if self.noise.min_variance >= self.noise.max_variance {
            bail!(
                "noise.min_variance ({}) must be below noise.max_variance ({})",
                self.noise.min_variance, self.noise.max_variance
            );
        }
        if self.noise.block_size < 8 {
            bail!("noise.block_size must be at least 8, got {}", self.noise.block_size);
        }
        if self.metadata.datetime_tolerance_secs < 0 {
            bail!("metadata.datetime_tolerance_secs must not be negative");
        }
        if self.metadata.software_signatures.iter().any(|s| s.trim().is_empty()) {
            bail!("metadata.software_signatures must not contain empty entries");
        }
        Ok(())
    }
}

fn check_threshold(name: &str, v: f64) -> Result<()> {
    if !v.is_finite() || v < 0.0 {
        bail!("{} must be a finite non-negative number, got {}", name, v);
    }
    Ok(())
}
