#![forbid(unsafe_code)]

//! Evidence codec: fixed-resolution visual observations to and from a
//! transport-safe symptom text.
//!
//! The round trip is lossy by construction. Every sample is quantised to an
//! 8-bit level (`round(v * 255)`) and decoded as `level / 255`, so
//! `decode(encode(x))` lies within half a quantisation step (1/510) of `x`,
//! comfortably inside the 1/255 bound callers rely on. The endpoints 0.0 and
//! 1.0 map to levels 0 and 255 and come back exactly.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use medrec_kernel_contracts::observation::{
    ObservationGrid, OBSERVATION_CHANNELS, OBSERVATION_HEIGHT, OBSERVATION_VALUE_COUNT,
    OBSERVATION_WIDTH,
};
use thiserror::Error;

pub const OBSERVATION_TEXT_PREFIX: &str = "obs.v1:120x120x3:";
pub const QUANTIZATION_STEP: f32 = 1.0 / 255.0;

// 43 200 bytes is a multiple of 3, so the base64 body carries no padding.
const ENCODED_BODY_LEN: usize = OBSERVATION_VALUE_COUNT / 3 * 4;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("observation shape {width}x{height}x{channels} does not match 120x120x3")]
    DimensionMismatch {
        width: u32,
        height: u32,
        channels: u32,
    },
    #[error("observation value {value} at index {index} is outside [0, 1]")]
    ValueOutOfRange { index: usize, value: f64 },
    #[error("observation value at index {index} is not finite")]
    NotFinite { index: usize },
    #[error("observation text is truncated: expected {expected} samples, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("observation text is malformed: {reason}")]
    Malformed { reason: String },
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        reason: reason.into(),
    }
}

fn quantize(index: usize, value: f64) -> Result<u8, CodecError> {
    if !value.is_finite() {
        return Err(CodecError::NotFinite { index });
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(CodecError::ValueOutOfRange { index, value });
    }
    Ok((value * 255.0).round() as u8)
}

fn dequantize(level: u8) -> f32 {
    level as f32 / 255.0
}

fn grid_from_levels(levels: &[u8]) -> Result<ObservationGrid, CodecError> {
    ObservationGrid::new(
        OBSERVATION_WIDTH,
        OBSERVATION_HEIGHT,
        OBSERVATION_CHANNELS,
        levels.iter().copied().map(dequantize).collect(),
    )
    .map_err(|v| malformed(v.to_string()))
}

pub fn encode_observation(grid: &ObservationGrid) -> Result<String, CodecError> {
    if !grid.has_fixed_resolution() {
        return Err(CodecError::DimensionMismatch {
            width: grid.width(),
            height: grid.height(),
            channels: grid.channels(),
        });
    }
    let levels = grid
        .values()
        .iter()
        .enumerate()
        .map(|(i, v)| quantize(i, *v as f64))
        .collect::<Result<Vec<u8>, CodecError>>()?;
    let mut out = String::with_capacity(OBSERVATION_TEXT_PREFIX.len() + ENCODED_BODY_LEN);
    out.push_str(OBSERVATION_TEXT_PREFIX);
    out.push_str(&BASE64.encode(levels));
    Ok(out)
}

/// Accepts the `obs.v1` form produced by [`encode_observation`] and the older
/// nested JSON list form (`[[[r, g, b], ...], ...]`).
pub fn decode_observation(text: &str) -> Result<ObservationGrid, CodecError> {
    let text = text.trim();
    if let Some(body) = text.strip_prefix(OBSERVATION_TEXT_PREFIX) {
        return decode_v1_body(body);
    }
    if text.starts_with('[') {
        return decode_legacy_json(text);
    }
    if text.starts_with("obs.") {
        return Err(malformed("unsupported observation header"));
    }
    Err(malformed("text is not an encoded observation"))
}

fn decode_v1_body(body: &str) -> Result<ObservationGrid, CodecError> {
    if body.len() < ENCODED_BODY_LEN {
        return Err(CodecError::Truncated {
            expected: OBSERVATION_VALUE_COUNT,
            got: body.len() / 4 * 3,
        });
    }
    if body.len() > ENCODED_BODY_LEN {
        return Err(malformed("trailing data after observation body"));
    }
    let levels = BASE64
        .decode(body)
        .map_err(|err| malformed(format!("base64 decode failed: {err}")))?;
    if levels.len() != OBSERVATION_VALUE_COUNT {
        return Err(CodecError::Truncated {
            expected: OBSERVATION_VALUE_COUNT,
            got: levels.len(),
        });
    }
    grid_from_levels(&levels)
}

fn decode_legacy_json(text: &str) -> Result<ObservationGrid, CodecError> {
    let rows: Vec<Vec<Vec<f64>>> = serde_json::from_str(text)
        .map_err(|err| malformed(format!("legacy observation json: {err}")))?;
    let shape_ok = rows.len() == OBSERVATION_HEIGHT as usize
        && rows.iter().all(|row| {
            row.len() == OBSERVATION_WIDTH as usize
                && row
                    .iter()
                    .all(|px| px.len() == OBSERVATION_CHANNELS as usize)
        });
    if !shape_ok {
        return Err(malformed("legacy observation must be 120x120x3"));
    }
    let levels = rows
        .iter()
        .flatten()
        .flatten()
        .enumerate()
        .map(|(i, v)| quantize(i, *v))
        .collect::<Result<Vec<u8>, CodecError>>()?;
    grid_from_levels(&levels)
}

/// Nearest-neighbour resample of an RGB8 raster onto the fixed evidence
/// resolution, normalised into [0, 1].
pub fn observation_from_rgb8(
    width: u32,
    height: u32,
    pixels: &[u8],
) -> Result<ObservationGrid, CodecError> {
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(OBSERVATION_CHANNELS as usize));
    if width == 0 || height == 0 || expected != Some(pixels.len()) {
        return Err(CodecError::DimensionMismatch {
            width,
            height,
            channels: if width == 0 || height == 0 {
                0
            } else {
                (pixels.len() / (width as usize * height as usize)) as u32
            },
        });
    }
    let mut levels = Vec::with_capacity(OBSERVATION_VALUE_COUNT);
    for y in 0..OBSERVATION_HEIGHT {
        let src_y = (y as u64 * height as u64 / OBSERVATION_HEIGHT as u64) as usize;
        for x in 0..OBSERVATION_WIDTH {
            let src_x = (x as u64 * width as u64 / OBSERVATION_WIDTH as u64) as usize;
            let base = (src_y * width as usize + src_x) * OBSERVATION_CHANNELS as usize;
            levels.extend_from_slice(&pixels[base..base + OBSERVATION_CHANNELS as usize]);
        }
    }
    grid_from_levels(&levels)
}

/// Back to 8-bit RGB for display; the inverse of the normalisation step.
pub fn observation_to_rgb8(grid: &ObservationGrid) -> Result<Vec<u8>, CodecError> {
    if !grid.has_fixed_resolution() {
        return Err(CodecError::DimensionMismatch {
            width: grid.width(),
            height: grid.height(),
            channels: grid.channels(),
        });
    }
    grid.values()
        .iter()
        .enumerate()
        .map(|(i, v)| quantize(i, *v as f64))
        .collect()
}
