// lenscheck/src/detectors/noise.rs
//
// Noise-residual detector.
//
// Sensor noise is roughly stationary across a camera frame. Generated images
// tend to be unnaturally clean, and spliced regions carry a noise level that
// differs from their surroundings.
//
// Residual: the luma plane convolved with Immerkær's noise kernel
//     [ 1 -2  1]
//     [-2  4 -2]   / 6
//     [ 1 -2  1]
// which cancels smooth gradients and edges to first order and leaves the
// high-frequency noise at unit gain.
//
// Statistics:
//   variance  : variance of the residual
//   mean_abs  : mean absolute residual
//   sigma     : Immerkær estimate of the noise std (sqrt(π/2) · mean_abs)
//   block_cv  : coefficient of variation of per-block residual energy
//               (null when fewer than 4 blocks fit)

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use image::GrayImage;
use serde_json::json;

use super::{round4, DetectorKind, Signal};
use crate::config::NoisePolicy;

const KERNEL: [[i32; 3]; 3] = [[1, -2, 1], [-2, 4, -2], [1, -2, 1]];
const KERNEL_SCALE: f64 = 6.0;
const MIN_BLOCKS: usize = 4;

pub fn analyze(bytes: &[u8], policy: &NoisePolicy) -> Signal {
    match compute(bytes, policy) {
        Ok(signal) => signal,
        Err(e) => Signal::failed(DetectorKind::Noise, format!("Noise analysis failed: {:#}", e)),
    }
}

fn compute(bytes: &[u8], policy: &NoisePolicy) -> Result<Signal> {
    let luma = image::load_from_memory(bytes)
        .context("decoding image")?
        .to_luma8();
    let residual = Residual::of(&luma, policy.block_size as usize)?;

    let variance = residual.variance();
    let mean_abs = residual.mean_abs();
    let sigma = (std::f64::consts::PI / 2.0).sqrt() * mean_abs;

    let energies = residual.block_energies();
    let block_cv = (energies.len() >= MIN_BLOCKS).then(|| coefficient_of_variation(&energies));

    let out_of_band = variance < policy.min_variance || variance > policy.max_variance;
    let inconsistent = block_cv.is_some_and(|cv| cv > policy.block_cv_threshold);

    let fields: BTreeMap<String, serde_json::Value> = [
        ("variance".into(), json!(round4(variance))),
        ("mean_abs".into(), json!(round4(mean_abs))),
        ("sigma".into(),    json!(round4(sigma))),
        ("block_cv".into(), json!(block_cv.map(round4))),
        ("blocks".into(),   json!(energies.len())),
    ]
    .into_iter()
    .collect();

    Ok(Signal::evaluated(fields, out_of_band || inconsistent))
}

/// Running sums of the high-pass residual over the interior (w-2)×(h-2) grid.
///
/// The kernel output is an integer 6× the residual, so every sum is kept
/// exact in integers and scaled once at the end. Nothing per-pixel is stored.
struct Residual {
    count:   u64,
    sum:     i64,
    sum_sq:  i64,
    sum_abs: i64,
    block:   usize,
    /// Sum of squared kernel outputs per full block, row-major.
    blocks:  Vec<i64>,
}

impl Residual {
    fn of(luma: &GrayImage, block: usize) -> Result<Self> {
        let (w, h) = (luma.width() as usize, luma.height() as usize);
        if w < 3 || h < 3 {
            bail!("image {}x{} too small for a 3x3 residual", w, h);
        }
        let px = luma.as_raw();
        let (rw, rh) = (w - 2, h - 2);
        let (bx, by) = if block == 0 { (0, 0) } else { (rw / block, rh / block) };

        let mut r = Self { count: 0, sum: 0, sum_sq: 0, sum_abs: 0, block, blocks: vec![0; bx * by] };
        for y in 1..h - 1 {
            let ry = y - 1;
            for x in 1..w - 1 {
                let mut acc = 0i64;
                for (ky, row) in KERNEL.iter().enumerate() {
                    let base = (y + ky - 1) * w + x - 1;
                    for (kx, k) in row.iter().enumerate() {
                        acc += i64::from(*k) * i64::from(px[base + kx]);
                    }
                }
                let sq = acc * acc;
                r.count += 1;
                r.sum += acc;
                r.sum_sq += sq;
                r.sum_abs += acc.abs();

                let rx = x - 1;
                if block > 0 && rx / block < bx && ry / block < by {
                    r.blocks[(ry / block) * bx + rx / block] += sq;
                }
            }
        }
        Ok(r)
    }

    fn variance(&self) -> f64 {
        let n = self.count as f64;
        let mean = self.sum as f64 / n;
        let raw = (self.sum_sq as f64 / n - mean * mean).max(0.0);
        raw / (KERNEL_SCALE * KERNEL_SCALE)
    }

    fn mean_abs(&self) -> f64 {
        self.sum_abs as f64 / self.count as f64 / KERNEL_SCALE
    }

    /// Mean squared residual of each full block.
    fn block_energies(&self) -> Vec<f64> {
        let area = (self.block * self.block) as f64;
        self.blocks
            .iter()
            .map(|&e| e as f64 / area / (KERNEL_SCALE * KERNEL_SCALE))
            .collect()
    }
}

fn coefficient_of_variation(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return 0.0;
    }
    let mean = vals.iter().sum::<f64>() / vals.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / vals.len() as f64;
    var.sqrt() / mean
}
