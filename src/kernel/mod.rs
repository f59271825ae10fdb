//! Coherence kernel interface.
//!
//! The pipeline treats the kernel as a deterministic, side-effect-free
//! function from one transient series slice to one partial result.

mod welch;

pub use welch::WelchCoherence;

use ndarray::{Array1, Array4, Array5};
use thiserror::Error;

/// Failure reported by a kernel for one slice.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct KernelError {
    /// Description of why the slice was rejected
    pub message: String,
}

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A small series view carrying one variable slice plus the series attributes.
#[derive(Debug, Clone)]
pub struct TransientSeries {
    /// Slice data, shape `(time, 1, node, mode)`
    pub data: Array4<f64>,

    /// Sampling period, in `sample_period_unit`
    pub sample_period: f64,

    /// Unit of the sampling period ("ms", "s", ...)
    pub sample_period_unit: String,
}

impl TransientSeries {
    /// Sampling rate in Hz derived from the period and its unit.
    pub fn sample_rate_hz(&self) -> Result<f64, KernelError> {
        let seconds = period_unit_seconds(&self.sample_period_unit).ok_or_else(|| {
            KernelError::new(format!(
                "unsupported sample period unit '{}'",
                self.sample_period_unit
            ))
        })?;
        if !(self.sample_period.is_finite() && self.sample_period > 0.0) {
            return Err(KernelError::new(format!(
                "sample period must be positive, got {}",
                self.sample_period
            )));
        }
        Ok(1.0 / (self.sample_period * seconds))
    }
}

/// Seconds per unit for the sample period units the analyzer understands.
pub fn period_unit_seconds(unit: &str) -> Option<f64> {
    match unit.trim() {
        "s" | "sec" | "second" | "seconds" => Some(1.0),
        "ms" | "msec" | "millisecond" | "milliseconds" => Some(1e-3),
        "us" | "\u{3bc}s" | "\u{b5}s" | "microsecond" | "microseconds" => Some(1e-6),
        "ns" | "nanosecond" | "nanoseconds" => Some(1e-9),
        _ => None,
    }
}

/// Kernel output for one variable slice.
#[derive(Debug, Clone)]
pub struct PartialResult {
    /// Coherence tensor, shape `(freq, node, node, 1, mode)`
    pub tensor: Array5<f64>,

    /// Frequencies in Hz for each bin
    pub frequency: Array1<f64>,

    /// Transform size the result was computed with
    pub nfft: usize,
}

/// A cross-coherence kernel.
pub trait CoherenceKernel {
    /// Compute coherence for every node pair of `series`.
    fn compute(&self, series: &TransientSeries, nfft: usize) -> Result<PartialResult, KernelError>;
}

impl<K: CoherenceKernel + ?Sized> CoherenceKernel for &K {
    fn compute(&self, series: &TransientSeries, nfft: usize) -> Result<PartialResult, KernelError> {
        (**self).compute(series, nfft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(period: f64, unit: &str) -> TransientSeries {
        TransientSeries {
            data: Array4::zeros((4, 1, 1, 1)),
            sample_period: period,
            sample_period_unit: unit.to_string(),
        }
    }

    #[test]
    fn test_sample_rate() {
        assert!((series(1.0, "ms").sample_rate_hz().unwrap() - 1000.0).abs() < 1e-9);
        assert!((series(0.5, "s").sample_rate_hz().unwrap() - 2.0).abs() < 1e-12);
        assert!((series(250.0, "us").sample_rate_hz().unwrap() - 4000.0).abs() < 1e-6);
    }

    #[test]
    fn test_sample_rate_rejects_bad_attributes() {
        assert!(series(1.0, "fortnight").sample_rate_hz().is_err());
        assert!(series(0.0, "ms").sample_rate_hz().is_err());
        assert!(series(f64::NAN, "ms").sample_rate_hz().is_err());
    }
}
