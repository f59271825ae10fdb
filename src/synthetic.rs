//! Deterministic synthetic input series for trial runs.

use crate::error::Result;
use crate::io::{SeriesAttributes, ZarrSeriesWriter};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

/// Parameters of a synthetic series: one shared tone per variable with a
/// per-node phase offset, plus deterministic hash noise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticSeries {
    /// `(time, variable, node, mode)`
    pub shape: [usize; 4],
    /// Sampling period in milliseconds
    pub sample_period_ms: f64,
    /// Tone frequency in Hz
    pub tone_hz: f64,
    /// Peak noise amplitude relative to the unit tone
    pub noise: f64,
}

impl Default for SyntheticSeries {
    fn default() -> Self {
        Self {
            shape: [4096, 2, 8, 1],
            sample_period_ms: 1.0,
            tone_hz: 40.0,
            noise: 0.2,
        }
    }
}

impl SyntheticSeries {
    /// Generate the samples.
    pub fn generate(&self) -> Array4<f64> {
        let [t, v, n, m] = self.shape;
        let dt = self.sample_period_ms / 1000.0;
        Array4::from_shape_fn((t, v, n, m), |(ti, vi, ni, mi)| {
            let phase = ni as f64 * 0.25 + vi as f64 * 0.5 + mi as f64 * 0.1;
            let tone = (2.0 * PI * self.tone_hz * ti as f64 * dt + phase).sin();
            tone + self.noise * hash_noise(ti, vi, ni, mi)
        })
    }

    /// Generate and write the series to a container at `path`.
    pub fn write(&self, path: impl AsRef<Path>, gid: impl Into<String>) -> Result<()> {
        let attributes = SeriesAttributes {
            gid: gid.into(),
            sample_period: self.sample_period_ms,
            sample_period_unit: "ms".to_string(),
        };
        let writer = ZarrSeriesWriter::create(path.as_ref(), self.shape, &attributes, 3)?;
        writer.write_all(self.generate().view())?;
        tracing::info!(
            "Wrote synthetic series {:?} to {}",
            self.shape,
            path.as_ref().display()
        );
        Ok(())
    }
}

/// Uniform value in [-1, 1) from a splitmix64 hash of the sample position.
fn hash_noise(t: usize, v: usize, n: usize, m: usize) -> f64 {
    let mut x = (t as u64)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((v as u64) << 48)
        .wrapping_add((n as u64) << 32)
        .wrapping_add((m as u64) << 24);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
}
