//! Layer order keys.
//!
//! Keys are `f64`. New keys go above the current max, below the current min,
//! or at the midpoint between two neighbours, so reordering one shape never
//! rewrites its siblings. When neighbouring keys get too close to split, the
//! allocator asks for a renormalization pass that rewrites every shape to
//! evenly spaced integer keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shapeshare_core::types::ShapeId;
use tracing::debug;

/// Gaps below this fraction of the key magnitude trigger renormalization.
const MIN_RELATIVE_GAP: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayerOrderError {
    #[error("no representable key between {lower} and {upper}")]
    Exhausted { lower: f64, upper: f64 },

    #[error("layer keys must be finite")]
    NonFinite,
}

/// Where a shape goes in the stacking order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Top,
    Bottom,
    /// Directly above `lower` and below `upper`.
    Between { lower: ShapeId, upper: ShapeId },
}

/// Relative reorder verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reorder {
    ToFront,
    ToBack,
    Forward,
    Backward,
}

impl fmt::Display for Reorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reorder::ToFront => "to_front",
            Reorder::ToBack => "to_back",
            Reorder::Forward => "forward",
            Reorder::Backward => "backward",
        })
    }
}

impl FromStr for Reorder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "to_front" | "front" | "top" => Ok(Reorder::ToFront),
            "to_back" | "back" | "bottom" => Ok(Reorder::ToBack),
            "forward" | "up" => Ok(Reorder::Forward),
            "backward" | "down" => Ok(Reorder::Backward),
            other => Err(format!("unknown reorder '{other}'")),
        }
    }
}

/// Smallest `f64` strictly greater than `x`.
pub fn next_up(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

#[derive(Debug, Default)]
pub struct LayerOrderAllocator {
    needs_renormalization: bool,
}

impl LayerOrderAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key above every existing key (`max + 1`, or 0 for an empty canvas).
    ///
    /// Past 2^53 a step of 1 no longer changes the key; that is reported as
    /// exhaustion and the caller must renormalize and retry.
    pub fn top(&mut self, keys: impl IntoIterator<Item = f64>) -> Result<f64, LayerOrderError> {
        let Some(max) = keys.into_iter().reduce(f64::max) else {
            return Ok(0.0);
        };
        let key = max + 1.0;
        if key > max && key.is_finite() {
            return Ok(key);
        }
        debug!(max, "No key above the top layer");
        self.needs_renormalization = true;
        Err(LayerOrderError::Exhausted {
            lower: max,
            upper: f64::INFINITY,
        })
    }

    /// Key below every existing key (`min - 1`, or 0 for an empty canvas).
    pub fn bottom(&mut self, keys: impl IntoIterator<Item = f64>) -> Result<f64, LayerOrderError> {
        let Some(min) = keys.into_iter().reduce(f64::min) else {
            return Ok(0.0);
        };
        let key = min - 1.0;
        if key < min && key.is_finite() {
            return Ok(key);
        }
        debug!(min, "No key below the bottom layer");
        self.needs_renormalization = true;
        Err(LayerOrderError::Exhausted {
            lower: f64::NEG_INFINITY,
            upper: min,
        })
    }

    /// Key strictly between `lower` and `upper`.
    ///
    /// Returns the midpoint when it is distinct from both neighbours. On a
    /// precision collision the next representable key above `lower` is used
    /// and a renormalization is requested. If nothing fits, the caller must
    /// renormalize and retry.
    pub fn between(&mut self, lower: f64, upper: f64) -> Result<f64, LayerOrderError> {
        if !lower.is_finite() || !upper.is_finite() {
            return Err(LayerOrderError::NonFinite);
        }
        if lower >= upper {
            return Err(LayerOrderError::Exhausted { lower, upper });
        }

        let mid = lower + (upper - lower) / 2.0;
        if mid > lower && mid < upper {
            let scale = lower.abs().max(upper.abs()).max(1.0);
            if (mid - lower).min(upper - mid) < scale * MIN_RELATIVE_GAP {
                debug!(lower, upper, "Layer keys running out of headroom");
                self.needs_renormalization = true;
            }
            return Ok(mid);
        }

        let bumped = next_up(lower);
        if bumped < upper {
            debug!(lower, upper, key = bumped, "Midpoint collided; using next key above lower");
            self.needs_renormalization = true;
            return Ok(bumped);
        }

        self.needs_renormalization = true;
        Err(LayerOrderError::Exhausted { lower, upper })
    }

    pub fn needs_renormalization(&self) -> bool {
        self.needs_renormalization
    }

    /// Evenly spaced integer keys for `count` shapes, bottom to top.
    pub fn renormalized_keys(&mut self, count: usize) -> Vec<f64> {
        self.needs_renormalization = false;
        (0..count).map(|i| i as f64).collect()
    }
}
