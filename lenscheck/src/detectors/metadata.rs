// lenscheck/src/detectors/metadata.rs
//
// Embedded-metadata detector.
//
// Locates the EXIF tag table inside the container (JPEG APP1, PNG eXIf,
// WebP EXIF chunk, or the TIFF file itself), decodes it, and evaluates the
// configured rule set:
//   software_signature:<sig> : Software/ProcessingSoftware names a known editor
//                              or generator (Aho-Corasick, case-insensitive)
//   datetime_mismatch        : DateTime moved away from DateTimeOriginal
//   software_without_camera  : editor recorded, camera make/model absent
//   missing_exif             : no tag table at all (off unless enabled)
//
// A present tag table with no rule hits is not suspicious.

use std::collections::BTreeMap;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use image::ImageFormat;
use serde_json::json;

use super::exif::{self, TagTable};
use super::{DetectorKind, Signal};
use crate::config::MetadataPolicy;

const EXIF_DATETIME: &str = "%Y:%m:%d %H:%M:%S";

/// Metadata policy with its signature automaton compiled once at startup.
#[derive(Debug, Clone)]
pub struct MetadataRules {
    policy:     MetadataPolicy,
    signatures: AhoCorasick,
    labels:     Vec<String>,
}

impl MetadataRules {
    pub fn compile(policy: &MetadataPolicy) -> Result<Self> {
        let labels: Vec<String> = policy
            .software_signatures
            .iter()
            .map(|s| s.trim().to_lowercase())
            .collect();
        let signatures = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(&labels)
            .context("building software signature automaton")?;
        Ok(Self { policy: policy.clone(), signatures, labels })
    }

    fn software_hits(&self, software: &str) -> Vec<&str> {
        let mut hits: Vec<&str> = self
            .signatures
            .find_iter(software)
            .map(|m| self.labels[m.pattern().as_usize()].as_str())
            .collect();
        hits.sort_unstable();
        hits.dedup();
        hits
    }
}

pub fn analyze(bytes: &[u8], rules: &MetadataRules) -> Signal {
    match compute(bytes, rules) {
        Ok(signal) => signal,
        Err(e) => Signal::failed(
            DetectorKind::Metadata,
            format!("Error extracting EXIF: {:#}", e),
        ),
    }
}

fn compute(bytes: &[u8], rules: &MetadataRules) -> Result<Signal> {
    let format = image::guess_format(bytes).context("unrecognised image container")?;
    let table = match exif_block(bytes, format)? {
        Some(block) => exif::parse(block).context("decoding EXIF tag table")?,
        None => TagTable::default(),
    };

    let make = table.text("Make");
    let model = table.text("Model");
    let software = table.text("Software").or_else(|| table.text("ProcessingSoftware"));
    let datetime = table.text("DateTime");
    let datetime_original = table.text("DateTimeOriginal");
    let has_exif = !table.is_empty();

    let mut matched: Vec<String> = Vec::new();
    let policy = &rules.policy;

    if let Some(sw) = software.as_deref() {
        for hit in rules.software_hits(sw) {
            matched.push(format!("software_signature:{}", hit));
        }
        if policy.flag_software_without_camera && make.is_none() && model.is_none() {
            matched.push("software_without_camera".into());
        }
    }

    if policy.flag_datetime_mismatch {
        if let (Some(dt), Some(orig)) = (datetime.as_deref(), datetime_original.as_deref()) {
            if let (Some(a), Some(b)) = (parse_exif_datetime(dt), parse_exif_datetime(orig)) {
                if (a - b).num_seconds().abs() > policy.datetime_tolerance_secs {
                    matched.push("datetime_mismatch".into());
                }
            }
        }
    }

    if policy.flag_missing_exif && !has_exif {
        matched.push("missing_exif".into());
    }

    let suspicious = !matched.is_empty();
    let fields: BTreeMap<String, serde_json::Value> = [
        ("has_exif".into(),          json!(has_exif)),
        ("tag_count".into(),         json!(table.len())),
        ("format".into(),            json!(format_name(format))),
        ("make".into(),              json!(make)),
        ("model".into(),             json!(model)),
        ("software".into(),          json!(software)),
        ("datetime".into(),          json!(datetime)),
        ("datetime_original".into(), json!(datetime_original)),
        ("has_gps".into(),           json!(table.has_gps())),
        ("matched_rules".into(),     json!(matched)),
    ]
    .into_iter()
    .collect();

    Ok(Signal::evaluated(fields, suspicious))
}

fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim(), EXIF_DATETIME).ok()
}

pub(crate) fn format_name(format: ImageFormat) -> String {
    format!("{:?}", format).to_lowercase()
}

// ── Container walkers ─────────────────────────────────────────────────────────

/// Slice of the raw TIFF-structured EXIF block, if the container carries one.
/// Containers with no EXIF location cannot be evaluated at all.
fn exif_block(bytes: &[u8], format: ImageFormat) -> Result<Option<&[u8]>> {
    match format {
        ImageFormat::Jpeg => jpeg_app1(bytes),
        ImageFormat::Png  => png_exif(bytes),
        ImageFormat::WebP => webp_exif(bytes),
        ImageFormat::Tiff => Ok(Some(bytes)),
        other => bail!("{} container has no EXIF support", format_name(other)),
    }
}

fn be_u16(b: &[u8], at: usize) -> Option<usize> {
    b.get(at..at + 2).map(|s| u16::from_be_bytes([s[0], s[1]]) as usize)
}

fn be_u32(b: &[u8], at: usize) -> Option<usize> {
    b.get(at..at + 4).map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]) as usize)
}

fn le_u32(b: &[u8], at: usize) -> Option<usize> {
    b.get(at..at + 4).map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]) as usize)
}

fn strip_exif_header(payload: &[u8]) -> &[u8] {
    payload.strip_prefix(b"Exif\0\0").unwrap_or(payload)
}

fn jpeg_app1(b: &[u8]) -> Result<Option<&[u8]>> {
    let mut pos = 2; // past SOI
    loop {
        match b.get(pos) {
            None => return Ok(None),
            Some(0xFF) => {}
            Some(other) => bail!("corrupt JPEG marker 0x{:02X} at offset {}", other, pos),
        }
        while b.get(pos) == Some(&0xFF) {
            pos += 1;
        }
        let Some(&marker) = b.get(pos) else { return Ok(None) };
        pos += 1;

        match marker {
            0xD9 | 0xDA => return Ok(None), // EOI / start of scan: no more metadata
            0x01 | 0xD0..=0xD7 => continue,
            _ => {}
        }

        let len = be_u16(b, pos).context("truncated JPEG segment length")?;
        if len < 2 {
            bail!("invalid JPEG segment length {} at offset {}", len, pos);
        }
        let payload = b
            .get(pos + 2..pos + len)
            .context("truncated JPEG segment")?;
        if marker == 0xE1 && payload.starts_with(b"Exif\0\0") {
            return Ok(Some(&payload[6..]));
        }
        pos += len;
    }
}

fn png_exif(b: &[u8]) -> Result<Option<&[u8]>> {
    let mut pos = 8; // past signature
    while pos < b.len() {
        let len = be_u32(b, pos).context("truncated PNG chunk length")?;
        let kind = b.get(pos + 4..pos + 8).context("truncated PNG chunk type")?;
        let data = b
            .get(pos + 8..pos + 8 + len)
            .context("truncated PNG chunk data")?;
        match kind {
            b"eXIf" => return Ok(Some(strip_exif_header(data))),
            b"IEND" => return Ok(None),
            _ => {}
        }
        pos += 12 + len; // length + type + data + crc
    }
    Ok(None)
}

fn webp_exif(b: &[u8]) -> Result<Option<&[u8]>> {
    let mut pos = 12; // RIFF <size> WEBP
    while pos + 8 <= b.len() {
        let kind = &b[pos..pos + 4];
        let len = le_u32(b, pos + 4).context("truncated WebP chunk size")?;
        let data = b
            .get(pos + 8..pos + 8 + len)
            .context("truncated WebP chunk")?;
        if kind == b"EXIF" {
            return Ok(Some(strip_exif_header(data)));
        }
        pos += 8 + len + (len & 1); // chunks are padded to even length
    }
    Ok(None)
}
