#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ContractViolation;

pub const OBSERVATION_WIDTH: u32 = 120;
pub const OBSERVATION_HEIGHT: u32 = 120;
pub const OBSERVATION_CHANNELS: u32 = 3;
pub const OBSERVATION_VALUE_COUNT: usize =
    (OBSERVATION_WIDTH * OBSERVATION_HEIGHT * OBSERVATION_CHANNELS) as usize;

/// Row-major `height x width x channels` grid of normalised samples.
///
/// Only the shape is checked here. Resolution and value range are enforced by
/// the evidence codec, which is the only consumer that cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationGrid {
    width: u32,
    height: u32,
    channels: u32,
    values: Vec<f32>,
}

impl ObservationGrid {
    pub fn new(
        width: u32,
        height: u32,
        channels: u32,
        values: Vec<f32>,
    ) -> Result<Self, ContractViolation> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "observation_grid.shape",
                reason: "dimensions must be > 0",
            });
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(channels as usize));
        if expected != Some(values.len()) {
            return Err(ContractViolation::InvalidValue {
                field: "observation_grid.values",
                reason: "length must equal width * height * channels",
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            values,
        })
    }

    /// A grid at the fixed evidence resolution with every sample set to `fill`.
    pub fn filled(fill: f32) -> Self {
        Self {
            width: OBSERVATION_WIDTH,
            height: OBSERVATION_HEIGHT,
            channels: OBSERVATION_CHANNELS,
            values: vec![fill; OBSERVATION_VALUE_COUNT],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn value_at(&self, row: u32, col: u32, channel: u32) -> Option<f32> {
        if row >= self.height || col >= self.width || channel >= self.channels {
            return None;
        }
        let idx = ((row * self.width + col) * self.channels + channel) as usize;
        self.values.get(idx).copied()
    }

    pub fn has_fixed_resolution(&self) -> bool {
        self.width == OBSERVATION_WIDTH
            && self.height == OBSERVATION_HEIGHT
            && self.channels == OBSERVATION_CHANNELS
    }
}
