// lenscheck/src/detectors/ela.rs
//
// Error-level analysis.
//
// Re-encode the image through JPEG at a fixed quality, decode the result and
// diff it against the original decode. Regions pasted in from a source with a
// different compression history re-compress differently from the rest of the
// frame, so the difference image lights up around them.
//
// Statistics (raw difference units, 0–255 per channel):
//   mean  : mean absolute channel difference (drives `suspicious`)
//   max   : largest channel difference observed
//   std   : standard deviation of the channel differences
// Brightness-normalised view (largest difference stretched to 255):
//   scaled_mean, confidence = scaled_mean / 255

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use serde_json::json;

use super::{round4, DetectorKind, Signal};
use crate::config::ElaPolicy;

pub fn analyze(bytes: &[u8], policy: &ElaPolicy) -> Signal {
    match compute(bytes, policy) {
        Ok(signal) => signal,
        Err(e) => Signal::failed(DetectorKind::Ela, format!("ELA failed: {:#}", e)),
    }
}

fn compute(bytes: &[u8], policy: &ElaPolicy) -> Result<Signal> {
    let original = image::load_from_memory(bytes)
        .context("decoding image")?
        .to_rgb8();
    if original.width() == 0 || original.height() == 0 {
        bail!("image has no pixels");
    }

    let resaved = round_trip(&original, policy.quality)?;
    if resaved.dimensions() != original.dimensions() {
        bail!(
            "re-encoded dimensions {:?} differ from original {:?}",
            resaved.dimensions(),
            original.dimensions()
        );
    }

    let stats = difference_stats(original.as_raw(), resaved.as_raw());
    let suspicious = stats.mean > policy.mean_threshold;

    let fields: BTreeMap<String, serde_json::Value> = [
        ("mean".into(),        json!(round4(stats.mean))),
        ("max".into(),         json!(stats.max)),
        ("std".into(),         json!(round4(stats.std))),
        ("scaled_mean".into(), json!(round4(stats.scaled_mean))),
        ("confidence".into(),  json!(round4((stats.scaled_mean / 255.0).min(1.0)))),
        ("quality".into(),     json!(policy.quality)),
        ("threshold".into(),   json!(policy.mean_threshold)),
    ]
    .into_iter()
    .collect();

    Ok(Signal::evaluated(fields, suspicious))
}

/// Encode to JPEG in memory and decode back to the same RGB representation.
pub(crate) fn round_trip(img: &RgbImage, quality: u8) -> Result<RgbImage> {
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality)
        .encode_image(img)
        .context("re-encoding as JPEG")?;
    let decoded = image::load_from_memory_with_format(&encoded, ImageFormat::Jpeg)
        .context("decoding re-encoded JPEG")?
        .to_rgb8();
    Ok(decoded)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DiffStats {
    mean:        f64,
    max:         u8,
    std:         f64,
    scaled_mean: f64,
}

fn difference_stats(a: &[u8], b: &[u8]) -> DiffStats {
    let n = a.len().min(b.len());
    if n == 0 {
        return DiffStats { mean: 0.0, max: 0, std: 0.0, scaled_mean: 0.0 };
    }

    let mut max = 0u8;
    let mut sum = 0u64;
    let mut sum_sq = 0u64;
    for (&x, &y) in a[..n].iter().zip(&b[..n]) {
        let d = x.abs_diff(y);
        max = max.max(d);
        sum += d as u64;
        sum_sq += (d as u64) * (d as u64);
    }

    let mean = sum as f64 / n as f64;
    let var = (sum_sq as f64 / n as f64 - mean * mean).max(0.0);

    // A perfect round trip has max 0; stretch by 255/1 so the scaled image
    // stays all-zero instead of dividing by zero.
    let scale = 255.0 / f64::from(max.max(1));
    let scaled_sum: f64 = a[..n]
        .iter()
        .zip(&b[..n])
        .map(|(&x, &y)| (f64::from(x.abs_diff(y)) * scale).min(255.0).round())
        .sum();

    DiffStats { mean, max, std: var.sqrt(), scaled_mean: scaled_sum / n as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn jpeg_at(img: &RgbImage, quality: u8) -> Vec<u8> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality).encode_image(img).unwrap();
        out
    }

    fn noise_image(w: u32, h: u32) -> RgbImage {
        let mut state = 0x2545_f491_u32;
        RgbImage::from_fn(w, h, |_, _| {
            let mut next = || {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xff) as u8
            };
            Rgb([next(), next(), next()])
        })
    }

    #[test]
    fn same_quality_round_trip_is_near_zero() {
        let solid = RgbImage::from_pixel(64, 64, Rgb([200, 30, 30]));
        let bytes = jpeg_at(&solid, 90);
        let s = analyze(&bytes, &ElaPolicy::default());
        assert!(s.error.is_none(), "{:?}", s.error);
        assert_eq!(s.suspicious, Some(false));
        assert!(s.stats["mean"].as_f64().unwrap() < 1.0);
    }

    #[test]
    fn smooth_gradient_stays_below_default_threshold() {
        let grad = RgbImage::from_fn(96, 96, |x, y| Rgb([(x * 2) as u8, (y * 2) as u8, 128]));
        let s = analyze(&jpeg_at(&grad, 90), &ElaPolicy::default());
        assert_eq!(s.suspicious, Some(false));
        assert!(s.stats["mean"].as_f64().unwrap() < 3.0);
    }

    #[test]
    fn uncompressed_noise_scores_higher_than_flat_image() {
        let policy = ElaPolicy::default();
        let flat = analyze(&encode(&RgbImage::from_pixel(64, 64, Rgb([90, 90, 90])), ImageFormat::Png), &policy);
        let noisy = analyze(&encode(&noise_image(64, 64), ImageFormat::Png), &policy);
        let flat_mean = flat.stats["mean"].as_f64().unwrap();
        let noisy_mean = noisy.stats["mean"].as_f64().unwrap();
        assert!(noisy_mean > flat_mean, "noisy={} flat={}", noisy_mean, flat_mean);
    }

    #[test]
    fn threshold_is_policy_not_constant() {
        let noisy = encode(&noise_image(48, 48), ImageFormat::Png);
        let strict = ElaPolicy { mean_threshold: 0.0, ..ElaPolicy::default() };
        let lax = ElaPolicy { mean_threshold: 255.0, ..ElaPolicy::default() };
        assert_eq!(analyze(&noisy, &strict).suspicious, Some(true));
        assert_eq!(analyze(&noisy, &lax).suspicious, Some(false));
    }

    #[test]
    fn garbage_bytes_degrade_to_error_signal() {
        let s = analyze(b"definitely not an image", &ElaPolicy::default());
        assert_eq!(s.suspicious, None);
        assert!(s.error.as_deref().unwrap().starts_with("ELA failed"));
        assert!(s.stats["mean"].is_null());
        assert!(s.stats["max"].is_null());
        assert!(s.stats["std"].is_null());
    }

    #[test]
    fn zero_difference_scales_to_zero() {
        let px = [10u8, 20, 30, 40];
        let d = difference_stats(&px, &px);
        assert_eq!(d.max, 0);
        assert_eq!(d.mean, 0.0);
        assert_eq!(d.scaled_mean, 0.0);
    }

    #[test]
    fn largest_difference_maps_to_full_intensity() {
        let d = difference_stats(&[0, 0, 0, 0], &[4, 2, 0, 0]);
        assert_eq!(d.max, 4);
        assert!((d.mean - 1.5).abs() < 1e-9);
        // 4 → 255, 2 → 127.5 → 128
        assert!((d.scaled_mean - (255.0 + 128.0) / 4.0).abs() < 1e-9);
    }
}
