// lenscheck/src/detectors/exif.rs
//
// EXIF tag-table decoder.
//
// An EXIF block is a little TIFF file: byte-order mark, magic 42, offset of
// IFD0. IFD0 may point at the Exif sub-IFD (0x8769) and the GPS sub-IFD
// (0x8825). Each IFD is a u16 entry count followed by 12-byte entries:
//   tag u16 | type u16 | count u32 | value-or-offset u32
// Values of 4 bytes or less are stored inline in the last field.
//
// Only the parts needed for provenance are decoded: text values in full,
// numeric values as f64, everything else as a byte count.

use std::collections::HashSet;

use thiserror::Error;

const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_GPS_IFD:  u16 = 0x8825;

/// Hard cap on entries per IFD; real files stay far below this.
const MAX_ENTRIES: u16 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExifError {
    #[error("tag table truncated at offset {0}")]
    Truncated(usize),
    #[error("bad byte-order mark")]
    BadByteOrder,
    #[error("bad TIFF magic {0}")]
    BadMagic(u16),
    #[error("IFD at offset {0} declares {1} entries")]
    TooManyEntries(usize, u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ifd {
    Primary,
    Exif,
    Gps,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Text(String),
    Numbers(Vec<f64>),
    Bytes(usize),
}

impl TagValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagEntry {
    pub ifd:   Ifd,
    pub tag:   u16,
    pub value: TagValue,
}

impl TagEntry {
    /// Canonical tag name, or the hex id for tags outside the known table.
    pub fn name(&self) -> String {
        tag_name(self.ifd, self.tag)
            .map(str::to_string)
            .unwrap_or_else(|| format!("0x{:04X}", self.tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagTable {
    pub entries: Vec<TagEntry>,
}

impl TagTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// First text value stored under `name`, trimmed of padding.
    pub fn text(&self, name: &str) -> Option<String> {
        self.entries
            .iter()
            .filter(|e| e.ifd != Ifd::Gps)
            .find(|e| e.name() == name)
            .and_then(|e| e.value.as_text())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn has_gps(&self) -> bool {
        self.entries.iter().any(|e| e.ifd == Ifd::Gps)
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Order {
    Little,
    Big,
}

struct Reader<'a> {
    buf:   &'a [u8],
    order: Order,
}

impl<'a> Reader<'a> {
    fn bytes(&self, at: usize, len: usize) -> Result<&'a [u8], ExifError> {
        at.checked_add(len)
            .and_then(|end| self.buf.get(at..end))
            .ok_or(ExifError::Truncated(at))
    }

    fn u16(&self, at: usize) -> Result<u16, ExifError> {
        let b = self.bytes(at, 2)?;
        Ok(match self.order {
            Order::Little => u16::from_le_bytes([b[0], b[1]]),
            Order::Big    => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    fn u32(&self, at: usize) -> Result<u32, ExifError> {
        let b = self.bytes(at, 4)?;
        Ok(match self.order {
            Order::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            Order::Big    => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        })
    }
}

/// Decode a TIFF-structured EXIF block into a flat tag table.
pub fn parse(buf: &[u8]) -> Result<TagTable, ExifError> {
    let order = match buf.get(0..2) {
        Some(b"II") => Order::Little,
        Some(b"MM") => Order::Big,
        Some(_)     => return Err(ExifError::BadByteOrder),
        None        => return Err(ExifError::Truncated(0)),
    };
    let r = Reader { buf, order };
    let magic = r.u16(2)?;
    if magic != 42 {
        return Err(ExifError::BadMagic(magic));
    }

    let mut table = TagTable::default();
    let mut visited = HashSet::new();
    let ifd0 = r.u32(4)? as usize;
    read_ifd(&r, ifd0, Ifd::Primary, &mut table, &mut visited)?;
    Ok(table)
}

fn read_ifd(
    r:       &Reader<'_>,
    offset:  usize,
    ifd:     Ifd,
    table:   &mut TagTable,
    visited: &mut HashSet<usize>,
) -> Result<(), ExifError> {
    // Offset cycles show up in corrupted or hostile files.
    if !visited.insert(offset) {
        return Ok(());
    }

    let count = r.u16(offset)?;
    if count > MAX_ENTRIES {
        return Err(ExifError::TooManyEntries(offset, count));
    }

    let mut sub_ifds = Vec::new();
    for i in 0..count as usize {
        let at = offset + 2 + i * 12;
        let tag = r.u16(at)?;
        let kind = r.u16(at + 2)?;
        let n = r.u32(at + 4)? as usize;

        if ifd == Ifd::Primary && (tag == TAG_EXIF_IFD || tag == TAG_GPS_IFD) {
            let target = r.u32(at + 8)? as usize;
            let sub = if tag == TAG_EXIF_IFD { Ifd::Exif } else { Ifd::Gps };
            sub_ifds.push((target, sub));
            continue;
        }

        let value = read_value(r, at, kind, n)?;
        table.entries.push(TagEntry { ifd, tag, value });
    }

    for (target, sub) in sub_ifds {
        read_ifd(r, target, sub, table, visited)?;
    }
    Ok(())
}

fn type_size(kind: u16) -> Option<usize> {
    match kind {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8         => Some(2),
        4 | 9 | 11    => Some(4),
        5 | 10 | 12   => Some(8),
        _             => None,
    }
}

fn read_value(r: &Reader<'_>, entry: usize, kind: u16, n: usize) -> Result<TagValue, ExifError> {
    let Some(size) = type_size(kind) else {
        return Ok(TagValue::Bytes(0));
    };
    let total = size.checked_mul(n).ok_or(ExifError::Truncated(entry))?;
    let data_at = if total <= 4 { entry + 8 } else { r.u32(entry + 8)? as usize };

    // Large undefined blobs (MakerNote, thumbnails) are only sized.
    if kind == 7 || kind == 1 || kind == 6 {
        if kind != 7 && n <= 8 {
            let raw = r.bytes(data_at, total)?;
            return Ok(TagValue::Numbers(raw.iter().map(|&b| f64::from(b)).collect()));
        }
        return Ok(TagValue::Bytes(total));
    }

    if kind == 2 {
        let raw = r.bytes(data_at, total)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        return Ok(TagValue::Text(String::from_utf8_lossy(&raw[..end]).into_owned()));
    }

    let mut nums = Vec::with_capacity(n.min(64));
    for i in 0..n.min(64) {
        let at = data_at + i * size;
        let v = match kind {
            3  => f64::from(r.u16(at)?),
            8  => f64::from(r.u16(at)? as i16),
            4  => f64::from(r.u32(at)?),
            9  => f64::from(r.u32(at)? as i32),
            11 => f64::from(f32::from_bits(r.u32(at)?)),
            5 | 10 => {
                let (num, den) = (r.u32(at)?, r.u32(at + 4)?);
                let (num, den) = if kind == 10 {
                    (f64::from(num as i32), f64::from(den as i32))
                } else {
                    (f64::from(num), f64::from(den))
                };
                if den == 0.0 { 0.0 } else { num / den }
            }
            12 => {
                let hi = u64::from(r.u32(at)?);
                let lo = u64::from(r.u32(at + 4)?);
                match r.order {
                    Order::Big    => f64::from_bits(hi << 32 | lo),
                    Order::Little => f64::from_bits(lo << 32 | hi),
                }
            }
            _ => 0.0,
        };
        nums.push(v);
    }
    Ok(TagValue::Numbers(nums))
}

// ── Tag names ─────────────────────────────────────────────────────────────────

const PRIMARY_TAGS: &[(u16, &str)] = &[
    (0x000B, "ProcessingSoftware"),
    (0x010E, "ImageDescription"),
    (0x010F, "Make"),
    (0x0110, "Model"),
    (0x0112, "Orientation"),
    (0x011A, "XResolution"),
    (0x011B, "YResolution"),
    (0x0128, "ResolutionUnit"),
    (0x0131, "Software"),
    (0x0132, "DateTime"),
    (0x013B, "Artist"),
    (0x013C, "HostComputer"),
    (0x0213, "YCbCrPositioning"),
    (0x8298, "Copyright"),
    (0x8769, "ExifOffset"),
    (0x8825, "GPSInfo"),
];

const EXIF_TAGS: &[(u16, &str)] = &[
    (0x829A, "ExposureTime"),
    (0x829D, "FNumber"),
    (0x8822, "ExposureProgram"),
    (0x8827, "ISOSpeedRatings"),
    (0x9000, "ExifVersion"),
    (0x9003, "DateTimeOriginal"),
    (0x9004, "DateTimeDigitized"),
    (0x9010, "OffsetTime"),
    (0x9011, "OffsetTimeOriginal"),
    (0x9101, "ComponentsConfiguration"),
    (0x9201, "ShutterSpeedValue"),
    (0x9202, "ApertureValue"),
    (0x9204, "ExposureBiasValue"),
    (0x9207, "MeteringMode"),
    (0x9209, "Flash"),
    (0x920A, "FocalLength"),
    (0x927C, "MakerNote"),
    (0x9286, "UserComment"),
    (0x9290, "SubsecTime"),
    (0x9291, "SubsecTimeOriginal"),
    (0xA000, "FlashpixVersion"),
    (0xA001, "ColorSpace"),
    (0xA002, "ExifImageWidth"),
    (0xA003, "ExifImageHeight"),
    (0xA005, "ExifInteroperabilityOffset"),
    (0xA402, "ExposureMode"),
    (0xA403, "WhiteBalance"),
    (0xA405, "FocalLengthIn35mmFilm"),
    (0xA406, "SceneCaptureType"),
    (0xA420, "ImageUniqueID"),
    (0xA430, "CameraOwnerName"),
    (0xA431, "BodySerialNumber"),
    (0xA433, "LensMake"),
    (0xA434, "LensModel"),
];

const GPS_TAGS: &[(u16, &str)] = &[
    (0x0000, "GPSVersionID"),
    (0x0001, "GPSLatitudeRef"),
    (0x0002, "GPSLatitude"),
    (0x0003, "GPSLongitudeRef"),
    (0x0004, "GPSLongitude"),
    (0x0005, "GPSAltitudeRef"),
    (0x0006, "GPSAltitude"),
    (0x0007, "GPSTimeStamp"),
    (0x0012, "GPSMapDatum"),
    (0x001D, "GPSDateStamp"),
];

pub fn tag_name(ifd: Ifd, tag: u16) -> Option<&'static str> {
    let table = match ifd {
        Ifd::Primary => PRIMARY_TAGS,
        Ifd::Exif    => EXIF_TAGS,
        Ifd::Gps     => GPS_TAGS,
    };
    table.iter().find(|(id, _)| *id == tag).map(|(_, name)| *name)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Little-endian EXIF block builder for tests.
    pub(crate) struct ExifBuilder {
        primary: Vec<(u16, String)>,
        exif:    Vec<(u16, String)>,
        gps:     bool,
    }

    impl ExifBuilder {
        pub(crate) fn new() -> Self {
            Self { primary: Vec::new(), exif: Vec::new(), gps: false }
        }

        pub(crate) fn primary(mut self, tag: u16, text: &str) -> Self {
            self.primary.push((tag, text.to_string()));
            self
        }

        pub(crate) fn exif(mut self, tag: u16, text: &str) -> Self {
            self.exif.push((tag, text.to_string()));
            self
        }

        pub(crate) fn gps(mut self) -> Self {
            self.gps = true;
            self
        }

        pub(crate) fn build(self) -> Vec<u8> {
            // Layout: header | IFD0 | Exif IFD | GPS IFD | string pool
            let n0 = self.primary.len() + usize::from(!self.exif.is_empty()) + usize::from(self.gps);
            let ifd0_at = 8;
            let ifd0_len = 2 + n0 * 12 + 4;
            let exif_at = ifd0_at + ifd0_len;
            let exif_len = if self.exif.is_empty() { 0 } else { 2 + self.exif.len() * 12 + 4 };
            let gps_at = exif_at + exif_len;
            let gps_len = if self.gps { 2 + 12 + 4 } else { 0 };
            let mut pool_at = gps_at + gps_len;

            let mut out = b"II".to_vec();
            out.extend_from_slice(&42u16.to_le_bytes());
            out.extend_from_slice(&(ifd0_at as u32).to_le_bytes());

            let mut pool = Vec::new();
            let mut ascii = |out: &mut Vec<u8>, tag: u16, text: &str, pool_at: &mut usize| {
                let mut bytes = text.as_bytes().to_vec();
                bytes.push(0);
                out.extend_from_slice(&tag.to_le_bytes());
                out.extend_from_slice(&2u16.to_le_bytes());
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                if bytes.len() <= 4 {
                    bytes.resize(4, 0);
                    out.extend_from_slice(&bytes);
                } else {
                    out.extend_from_slice(&(*pool_at as u32).to_le_bytes());
                    *pool_at += bytes.len();
                    pool.extend_from_slice(&bytes);
                }
            };
            let pointer = |out: &mut Vec<u8>, tag: u16, target: usize| {
                out.extend_from_slice(&tag.to_le_bytes());
                out.extend_from_slice(&4u16.to_le_bytes());
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&(target as u32).to_le_bytes());
            };

            out.extend_from_slice(&(n0 as u16).to_le_bytes());
            for (tag, text) in &self.primary {
                ascii(&mut out, *tag, text, &mut pool_at);
            }
            if !self.exif.is_empty() {
                pointer(&mut out, TAG_EXIF_IFD, exif_at);
            }
            if self.gps {
                pointer(&mut out, TAG_GPS_IFD, gps_at);
            }
            out.extend_from_slice(&0u32.to_le_bytes());

            if !self.exif.is_empty() {
                out.extend_from_slice(&(self.exif.len() as u16).to_le_bytes());
                for (tag, text) in &self.exif {
                    ascii(&mut out, *tag, text, &mut pool_at);
                }
                out.extend_from_slice(&0u32.to_le_bytes());
            }

            if self.gps {
                // GPSLatitudeRef = "N"
                out.extend_from_slice(&1u16.to_le_bytes());
                ascii(&mut out, 0x0001, "N", &mut pool_at);
                out.extend_from_slice(&0u32.to_le_bytes());
            }

            out.extend_from_slice(&pool);
            out
        }
    }

    #[test]
    fn decodes_primary_and_exif_text() {
        let block = ExifBuilder::new()
            .primary(0x010F, "Canon")
            .primary(0x0110, "EOS 5D Mark IV")
            .exif(0x9003, "2024:05:01 10:00:00")
            .build();
        let t = parse(&block).unwrap();
        assert_eq!(t.text("Make").as_deref(), Some("Canon"));
        assert_eq!(t.text("Model").as_deref(), Some("EOS 5D Mark IV"));
        assert_eq!(t.text("DateTimeOriginal").as_deref(), Some("2024:05:01 10:00:00"));
        assert!(!t.has_gps());
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn gps_sub_ifd_is_detected() {
        let t = parse(&ExifBuilder::new().primary(0x010F, "Apple").gps().build()).unwrap();
        assert!(t.has_gps());
        let gps = t.entries.iter().find(|e| e.ifd == Ifd::Gps).unwrap();
        assert_eq!(gps.name(), "GPSLatitudeRef");
    }

    #[test]
    fn unknown_tags_fall_back_to_hex_ids() {
        let e = TagEntry { ifd: Ifd::Primary, tag: 0xBEEF, value: TagValue::Bytes(3) };
        assert_eq!(e.name(), "0xBEEF");
    }

    #[test]
    fn big_endian_short_is_decoded() {
        // MM, 42, IFD0 at 8, one entry: Orientation SHORT 1 = 6
        let mut b = b"MM".to_vec();
        b.extend_from_slice(&42u16.to_be_bytes());
        b.extend_from_slice(&8u32.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&0x0112u16.to_be_bytes());
        b.extend_from_slice(&3u16.to_be_bytes());
        b.extend_from_slice(&1u32.to_be_bytes());
        b.extend_from_slice(&[0, 6, 0, 0]);
        b.extend_from_slice(&0u32.to_be_bytes());
        let t = parse(&b).unwrap();
        assert_eq!(t.entries[0].value, TagValue::Numbers(vec![6.0]));
        assert_eq!(t.entries[0].name(), "Orientation");
    }

    #[test]
    fn malformed_blocks_are_errors_not_panics() {
        assert_eq!(parse(b"XX\x2a\x00").unwrap_err(), ExifError::BadByteOrder);
        assert_eq!(parse(b"II\x2b\x00\x08\x00\x00\x00").unwrap_err(), ExifError::BadMagic(43));
        assert!(matches!(parse(b"II\x2a\x00\xff\xff\x00\x00"), Err(ExifError::Truncated(_))));
        assert!(matches!(parse(b"I"), Err(ExifError::Truncated(0))));
    }

    #[test]
    fn self_referencing_ifd_terminates() {
        // IFD0 with one ExifOffset entry pointing back at IFD0.
        let mut b = b"II".to_vec();
        b.extend_from_slice(&42u16.to_le_bytes());
        b.extend_from_slice(&8u32.to_le_bytes());
        b.extend_from_slice(&1u16.to_le_bytes());
        b.extend_from_slice(&TAG_EXIF_IFD.to_le_bytes());
        b.extend_from_slice(&4u16.to_le_bytes());
        b.extend_from_slice(&1u32.to_le_bytes());
        b.extend_from_slice(&8u32.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        assert!(parse(&b).unwrap().is_empty());
    }
}
