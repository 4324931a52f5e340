//! FITS primary-HDU codec for 2D frames.
//!
//! Decoding keeps every header card's original 80-byte image so that a
//! decode/encode cycle without header edits reproduces the input bytes.

use crate::types::{
    parse_header_timestamp, CalError, CalResult, FrameImage, Header, HeaderCard, HeaderValue,
};
use ndarray::Array2;
use num_traits::{Bounded, NumCast, ToPrimitive, Zero};
use std::borrow::Cow;
use std::io::Read;

/// FITS logical block size in bytes
pub const BLOCK_SIZE: usize = 2880;

/// Header record size in bytes
pub const CARD_SIZE: usize = 80;

const MANDATORY_KEYS: [&str; 5] = ["SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2"];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Supported sample encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitpix {
    U8,
    I16,
    I32,
    F32,
    F64,
}

impl Bitpix {
    pub fn from_value(value: i64) -> CalResult<Self> {
        match value {
            8 => Ok(Bitpix::U8),
            16 => Ok(Bitpix::I16),
            32 => Ok(Bitpix::I32),
            -32 => Ok(Bitpix::F32),
            -64 => Ok(Bitpix::F64),
            other => Err(CalError::UnsupportedBitpix(other)),
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Bitpix::U8 => 8,
            Bitpix::I16 => 16,
            Bitpix::I32 => 32,
            Bitpix::F32 => -32,
            Bitpix::F64 => -64,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.value().unsigned_abs() / 8) as usize
    }

    pub fn is_integer(&self) -> bool {
        self.value() > 0
    }
}

/// Frame encoder/decoder with an optional allocation ceiling
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    max_image_bytes: Option<u64>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject frames whose `W·H·4` exceeds `limit` before allocating pixels
    pub fn with_max_image_bytes(limit: u64) -> Self {
        Self {
            max_image_bytes: Some(limit),
        }
    }

    pub fn max_image_bytes(&self) -> Option<u64> {
        self.max_image_bytes
    }

    /// Decode a primary HDU into an image and its header
    pub fn decode(&self, bytes: &[u8]) -> CalResult<(FrameImage, Header)> {
        log::debug!("Decoding FITS frame of {} bytes", bytes.len());

        let (header, data_offset) = parse_header(bytes)?;
        let bitpix = Bitpix::from_value(required_int(&header, "BITPIX")?)?;

        let naxis = required_int(&header, "NAXIS")?;
        if naxis != 2 {
            return Err(CalError::MalformedContainer(format!(
                "expected a 2D image, NAXIS = {}",
                naxis
            )));
        }
        let width = required_int(&header, "NAXIS1")?;
        let height = required_int(&header, "NAXIS2")?;
        if width < 1 || height < 1 {
            return Err(CalError::MalformedContainer(format!(
                "invalid image dimensions {}x{}",
                width, height
            )));
        }
        let (width, height) = (width as usize, height as usize);

        if let Some(limit) = self.max_image_bytes {
            check_image_size(width, height, limit)?;
        }

        let payload_len = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(bitpix.bytes_per_sample()))
            .ok_or_else(|| CalError::MalformedContainer("image dimensions overflow".to_string()))?;
        let available = bytes.len().saturating_sub(data_offset);
        if available < payload_len {
            return Err(CalError::DimensionMismatch(format!(
                "NAXIS1 x NAXIS2 = {}x{} requires {} payload bytes, found {}",
                width, height, payload_len, available
            )));
        }

        let bscale = header.get_f64("BSCALE").unwrap_or(1.0);
        let bzero = header.get_f64("BZERO").unwrap_or(0.0);
        let payload = &bytes[data_offset..data_offset + payload_len];
        let samples = decode_samples(payload, bitpix, bscale, bzero);

        let image = Array2::from_shape_vec((height, width), samples)
            .map_err(|e| CalError::DimensionMismatch(format!("Failed to reshape payload: {}", e)))?;

        log::debug!(
            "Decoded {}x{} frame, BITPIX {}, {} header cards",
            width,
            height,
            bitpix.value(),
            header.len()
        );
        Ok((image, header))
    }

    /// Encode an image with its header; payload is written in the header's BITPIX
    pub fn encode(&self, image: &FrameImage, header: &Header) -> CalResult<Vec<u8>> {
        let (height, width) = image.dim();
        if let Some(limit) = self.max_image_bytes {
            check_image_size(width, height, limit)?;
        }

        for (key, expected) in [("NAXIS1", width), ("NAXIS2", height)] {
            if let Some(v) = header.get_i64(key) {
                if v != expected as i64 {
                    return Err(CalError::DimensionMismatch(format!(
                        "{} = {} but image has {}",
                        key, v, expected
                    )));
                }
            }
        }
        if let Some(naxis) = header.get_i64("NAXIS") {
            if naxis != 2 {
                return Err(CalError::DimensionMismatch(format!(
                    "NAXIS = {} for a 2D image",
                    naxis
                )));
            }
        }

        let bitpix = Bitpix::from_value(header.get_i64("BITPIX").unwrap_or(-32))?;
        let bscale = header.get_f64("BSCALE").unwrap_or(1.0);
        let bzero = header.get_f64("BZERO").unwrap_or(0.0);
        if bscale == 0.0 {
            return Err(CalError::MalformedContainer("BSCALE must be non-zero".to_string()));
        }

        let mut out = Vec::with_capacity(
            BLOCK_SIZE * 2 + padded_len(width * height * bitpix.bytes_per_sample()),
        );

        // Mandatory cards lead in the required order
        let generated = Header::for_image(width, height);
        for key in MANDATORY_KEYS {
            let card = header
                .card(key)
                .or_else(|| generated.card(key))
                .ok_or_else(|| CalError::MalformedContainer(format!("missing {}", key)))?;
            out.extend_from_slice(&card_bytes(card));
        }
        for card in header.cards() {
            if card.key == "END"
                || (!card.is_commentary() && MANDATORY_KEYS.contains(&card.key.as_str()))
            {
                continue;
            }
            out.extend_from_slice(&card_bytes(card));
        }
        out.extend_from_slice(&blank_card("END"));
        pad_to_block(&mut out, b' ');

        encode_samples(image, bitpix, bscale, bzero, &mut out);
        pad_to_block(&mut out, 0);

        log::debug!("Encoded {}x{} frame into {} bytes", width, height, out.len());
        Ok(out)
    }
}

/// Decode with no size ceiling
pub fn decode(bytes: &[u8]) -> CalResult<(FrameImage, Header)> {
    FrameCodec::new().decode(bytes)
}

/// Encode with no size ceiling
pub fn encode(image: &FrameImage, header: &Header) -> CalResult<Vec<u8>> {
    FrameCodec::new().encode(image, header)
}

/// Fail `ImageTooLarge` when a `width x height` f32 image exceeds `limit` bytes
pub fn check_image_size(width: usize, height: usize, limit: u64) -> CalResult<()> {
    let bytes = (width as u64)
        .saturating_mul(height as u64)
        .saturating_mul(std::mem::size_of::<f32>() as u64);
    if bytes > limit {
        return Err(CalError::ImageTooLarge { bytes, limit });
    }
    Ok(())
}

/// Inflate gzip-compressed frames; other input is passed through
pub fn maybe_decompress(bytes: &[u8]) -> CalResult<Cow<'_, [u8]>> {
    if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut inflated = Vec::new();
        decoder
            .read_to_end(&mut inflated)
            .map_err(|e| CalError::MalformedContainer(format!("gzip stream: {}", e)))?;
        log::debug!("Inflated gzip frame {} -> {} bytes", bytes.len(), inflated.len());
        Ok(Cow::Owned(inflated))
    } else {
        Ok(Cow::Borrowed(bytes))
    }
}

/// Read the header only, returning it with the payload offset
pub fn parse_header(bytes: &[u8]) -> CalResult<(Header, usize)> {
    if bytes.len() < BLOCK_SIZE {
        return Err(CalError::MalformedContainer(format!(
            "{} bytes is shorter than one {}-byte block",
            bytes.len(),
            BLOCK_SIZE
        )));
    }
    if !bytes.starts_with(b"SIMPLE  =") {
        return Err(CalError::MalformedContainer(
            "first card is not SIMPLE".to_string(),
        ));
    }

    let mut header = Header::new();
    let mut offset = 0;
    let mut found_end = false;
    while offset + CARD_SIZE <= bytes.len() {
        let record = &bytes[offset..offset + CARD_SIZE];
        offset += CARD_SIZE;
        if !record.iter().all(|b| (0x20..=0x7e).contains(b)) {
            return Err(CalError::MalformedContainer(format!(
                "non-ASCII header record at byte {}",
                offset - CARD_SIZE
            )));
        }
        // Checked ASCII above
        let text = String::from_utf8_lossy(record).into_owned();
        let key = text[..8].trim_end();
        if key == "END" {
            found_end = true;
            break;
        }
        header.push(parse_card(&text));
    }
    if !found_end {
        return Err(CalError::MalformedContainer("END card not found".to_string()));
    }
    if header.get_bool("SIMPLE") != Some(true) {
        return Err(CalError::MalformedContainer("SIMPLE is not T".to_string()));
    }

    Ok((header, padded_len(offset)))
}

fn required_int(header: &Header, key: &str) -> CalResult<i64> {
    header
        .get_i64(key)
        .ok_or_else(|| CalError::MalformedContainer(format!("missing or non-integer {}", key)))
}

fn parse_card(text: &str) -> HeaderCard {
    let key = text[..8].trim_end().to_string();
    let has_value = &text[8..10] == "= " && key != "HISTORY" && key != "COMMENT";

    if !has_value {
        return HeaderCard {
            key,
            value: HeaderValue::Commentary(text[8..].trim_end().to_string()),
            comment: None,
            raw: Some(text.to_string()),
        };
    }

    let (value, comment) = parse_value_field(&text[10..]);
    HeaderCard {
        key,
        value,
        comment,
        raw: Some(text.to_string()),
    }
}

fn parse_value_field(field: &str) -> (HeaderValue, Option<String>) {
    let trimmed = field.trim_start();

    if let Some(rest) = trimmed.strip_prefix('\'') {
        // Quoted string; '' is an escaped quote
        let mut value = String::new();
        let mut chars = rest.char_indices().peekable();
        let mut end = rest.len();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    value.push('\'');
                    chars.next();
                } else {
                    end = i + 1;
                    break;
                }
            } else {
                value.push(c);
            }
        }
        let comment = parse_comment(&rest[end.min(rest.len())..]);
        let value = value.trim_end().to_string();
        let value = match parse_header_timestamp(&value) {
            Some(t) => HeaderValue::Timestamp(t),
            None => HeaderValue::Str(value),
        };
        return (value, comment);
    }

    let (value_part, comment) = match trimmed.find('/') {
        Some(idx) => (trimmed[..idx].trim(), parse_comment(&trimmed[idx..])),
        None => (trimmed.trim(), None),
    };

    let value = if value_part == "T" {
        HeaderValue::Logical(true)
    } else if value_part == "F" {
        HeaderValue::Logical(false)
    } else if let Ok(i) = value_part.parse::<i64>() {
        HeaderValue::Integer(i)
    } else if let Ok(f) = value_part.replace(['D', 'd'], "E").parse::<f64>() {
        HeaderValue::Float(f)
    } else {
        HeaderValue::Str(value_part.to_string())
    };
    (value, comment)
}

fn parse_comment(rest: &str) -> Option<String> {
    let rest = rest.trim_start();
    let comment = rest.strip_prefix('/')?.trim();
    if comment.is_empty() {
        None
    } else {
        Some(comment.to_string())
    }
}

fn format_float(v: f64) -> String {
    if v.is_finite() && v == v.trunc() && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else if v.abs() >= 1e-4 && v.abs() < 1e15 {
        format!("{}", v)
    } else {
        format!("{:E}", v)
    }
}

fn format_value(value: &HeaderValue) -> (String, bool) {
    match value {
        HeaderValue::Logical(b) => ((if *b { "T" } else { "F" }).to_string(), false),
        HeaderValue::Integer(i) => (i.to_string(), false),
        HeaderValue::Float(f) => (format_float(*f), false),
        HeaderValue::Str(s) => (quote(s), true),
        HeaderValue::Timestamp(t) => (quote(&t.format("%Y-%m-%dT%H:%M:%S").to_string()), true),
        HeaderValue::Commentary(s) => (s.clone(), true),
    }
}

fn quote(s: &str) -> String {
    let escaped: String = s
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .collect::<String>()
        .replace('\'', "''");
    let escaped: String = escaped.chars().take(67).collect();
    format!("'{:<8}'", escaped)
}

fn card_bytes(card: &HeaderCard) -> [u8; CARD_SIZE] {
    if let Some(raw) = &card.raw {
        if raw.len() == CARD_SIZE {
            let mut record = [b' '; CARD_SIZE];
            record.copy_from_slice(raw.as_bytes());
            return record;
        }
    }

    let mut record = blank_card(&card.key);
    if let HeaderValue::Commentary(text) = &card.value {
        let text = text.as_bytes();
        let len = text.len().min(CARD_SIZE - 8);
        record[8..8 + len].copy_from_slice(&text[..len]);
        return record;
    }

    record[8] = b'=';
    record[9] = b' ';
    let (value, left_justified) = format_value(&card.value);
    let value = value.as_bytes();
    let start = if left_justified {
        10
    } else {
        30usize.saturating_sub(value.len()).max(10)
    };
    let len = value.len().min(CARD_SIZE - start);
    record[start..start + len].copy_from_slice(&value[..len]);

    if let Some(comment) = &card.comment {
        let pos = (start + len + 1).max(31);
        if pos + 2 < CARD_SIZE {
            record[pos] = b'/';
            let text = comment.as_bytes();
            let avail = CARD_SIZE - pos - 2;
            let n = text.len().min(avail);
            record[pos + 2..pos + 2 + n].copy_from_slice(&text[..n]);
        }
    }
    record
}

fn blank_card(key: &str) -> [u8; CARD_SIZE] {
    let mut record = [b' '; CARD_SIZE];
    let key = key.as_bytes();
    let len = key.len().min(8);
    record[..len].copy_from_slice(&key[..len]);
    record
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

fn pad_to_block(out: &mut Vec<u8>, fill: u8) {
    let target = padded_len(out.len());
    out.resize(target, fill);
}

fn decode_samples(payload: &[u8], bitpix: Bitpix, bscale: f64, bzero: f64) -> Vec<f32> {
    let scaled = bscale != 1.0 || bzero != 0.0;
    let convert = move |chunk: &[u8]| -> f32 {
        let raw = match bitpix {
            Bitpix::U8 => chunk[0] as f64,
            Bitpix::I16 => i16::from_be_bytes([chunk[0], chunk[1]]) as f64,
            Bitpix::I32 => i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            Bitpix::F32 => {
                let v = f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if !scaled {
                    return v;
                }
                v as f64
            }
            Bitpix::F64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&chunk[..8]);
                f64::from_be_bytes(b)
            }
        };
        if scaled {
            (bscale * raw + bzero) as f32
        } else {
            raw as f32
        }
    };

    let n = bitpix.bytes_per_sample();
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        payload.par_chunks_exact(n).map(convert).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        payload.chunks_exact(n).map(convert).collect()
    }
}

fn encode_samples(image: &FrameImage, bitpix: Bitpix, bscale: f64, bzero: f64, out: &mut Vec<u8>) {
    let scaled = bscale != 1.0 || bzero != 0.0;
    let to_raw = |v: f32| -> f64 {
        if scaled {
            (v as f64 - bzero) / bscale
        } else {
            v as f64
        }
    };

    for &v in image.iter() {
        match bitpix {
            Bitpix::U8 => out.push(quantize::<u8>(to_raw(v))),
            Bitpix::I16 => out.extend_from_slice(&quantize::<i16>(to_raw(v)).to_be_bytes()),
            Bitpix::I32 => out.extend_from_slice(&quantize::<i32>(to_raw(v)).to_be_bytes()),
            Bitpix::F32 => {
                let raw = if scaled { to_raw(v) as f32 } else { v };
                out.extend_from_slice(&raw.to_be_bytes());
            }
            Bitpix::F64 => out.extend_from_slice(&to_raw(v).to_be_bytes()),
        }
    }
}

/// Round to the nearest representable integer sample, saturating at the type bounds
fn quantize<T>(raw: f64) -> T
where
    T: Bounded + NumCast + Zero,
{
    if raw.is_nan() {
        return T::zero();
    }
    let lo = T::min_value().to_f64().unwrap_or(f64::MIN);
    let hi = T::max_value().to_f64().unwrap_or(f64::MAX);
    NumCast::from(raw.round().clamp(lo, hi)).unwrap_or_else(T::zero)
}
