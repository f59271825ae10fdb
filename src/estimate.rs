//! Pre-flight size estimation.
//!
//! Pure functions projecting the memory and disk footprint of a coherence run
//! from the input shape and the transform size. An admission layer uses these
//! numbers to admit or reject a job before any I/O happens.
//!
//! Only one variable's worth of input is ever materialized, so the estimates
//! use `used_shape = (t, 1, n, m)` rather than the full input shape.

use crate::error::{CoherenceError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes per element. Every array the pipeline touches is f64.
pub const ELEMENT_BYTES: u64 = 8;

/// Number of frequency bins produced for a transform size: `floor(nfft/2) + 1`.
pub fn freq_bins(nfft: usize) -> usize {
    nfft / 2 + 1
}

/// Reject transform sizes that cannot produce a result.
pub fn validate_nfft(nfft: usize) -> Result<()> {
    if nfft == 0 {
        return Err(CoherenceError::invalid_parameter(
            "nfft (data-points per block) must be > 0",
        ));
    }
    if nfft % 2 != 0 {
        tracing::warn!("nfft={} is odd; frequency bins are floor(nfft/2)+1", nfft);
    } else if !nfft.is_power_of_two() {
        tracing::warn!("nfft={} is not a power of two", nfft);
    }
    Ok(())
}

/// Shapes of the main result and its frequency vector.
///
/// Returns `[(freq, n, n, v, m), (freq,)]` for an input shape `(t, v, n, m)`.
pub fn result_shape(input_shape: [usize; 4], nfft: usize) -> ([usize; 5], [usize; 1]) {
    let freq = freq_bins(nfft);
    (
        [freq, input_shape[2], input_shape[2], input_shape[1], input_shape[3]],
        [freq],
    )
}

/// Storage size in bytes of the result (tensor plus frequency vector).
pub fn result_size_bytes(input_shape: [usize; 4], nfft: usize) -> Result<u64> {
    validate_nfft(nfft)?;
    let (tensor, frequency) = result_shape(input_shape, nfft);
    let elements = checked_product(&tensor)?
        .checked_add(checked_product(&frequency)?)
        .ok_or_else(overflow)?;
    elements.checked_mul(ELEMENT_BYTES).ok_or_else(overflow)
}

/// The shape actually held in memory at once: one variable slice.
pub fn used_shape(input_shape: [usize; 4]) -> [usize; 4] {
    [input_shape[0], 1, input_shape[2], input_shape[3]]
}

/// Required memory in bytes: one input slice plus one variable's result.
pub fn estimate_memory_bytes(input_shape: [usize; 4], nfft: usize) -> Result<u64> {
    let used = used_shape(input_shape);
    let input_bytes = checked_product(&used)?
        .checked_mul(ELEMENT_BYTES)
        .ok_or_else(overflow)?;
    input_bytes
        .checked_add(result_size_bytes(used, nfft)?)
        .ok_or_else(overflow)
}

/// Required disk space in kilobytes for one variable's result.
///
/// The disk figure covers only the result. Callers are expected to discard the
/// input after the output has been produced.
pub fn estimate_disk_kilobytes(input_shape: [usize; 4], nfft: usize) -> Result<u64> {
    Ok(result_size_bytes(used_shape(input_shape), nfft)? / 1024)
}

fn checked_product(dims: &[usize]) -> Result<u64> {
    dims.iter()
        .try_fold(1u64, |acc, &d| acc.checked_mul(d as u64))
        .ok_or_else(overflow)
}

fn overflow() -> CoherenceError {
    CoherenceError::invalid_parameter("size estimate overflows u64")
}

/// Memory and disk projection for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimate {
    /// Peak memory in bytes
    pub memory_bytes: u64,
    /// Disk footprint in kilobytes
    pub disk_kilobytes: u64,
}

impl SizeEstimate {
    /// Compute both estimates for an input shape and transform size.
    pub fn compute(input_shape: [usize; 4], nfft: usize) -> Result<Self> {
        Ok(Self {
            memory_bytes: estimate_memory_bytes(input_shape, nfft)?,
            disk_kilobytes: estimate_disk_kilobytes(input_shape, nfft)?,
        })
    }

    /// Check the estimate against admission limits.
    pub fn admit(&self, limits: &Limits) -> Result<()> {
        if let Some(limit) = limits.max_memory_bytes {
            if self.memory_bytes > limit {
                return Err(CoherenceError::AdmissionDenied {
                    resource: "memory bytes",
                    estimate: self.memory_bytes,
                    limit,
                });
            }
        }
        if let Some(limit) = limits.max_disk_kilobytes {
            if self.disk_kilobytes > limit {
                return Err(CoherenceError::AdmissionDenied {
                    resource: "disk kilobytes",
                    estimate: self.disk_kilobytes,
                    limit,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for SizeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory={:.2} MB, disk={} kB",
            self.memory_bytes as f64 / (1024.0 * 1024.0),
            self.disk_kilobytes
        )
    }
}

/// Resource limits for the admission check. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum memory a run may require, in bytes
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,

    /// Maximum disk a run may require, in kilobytes
    #[serde(default)]
    pub max_disk_kilobytes: Option<u64>,
}
