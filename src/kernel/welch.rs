//! Welch magnitude-squared coherence.
//!
//! Each node's signal is cut into non-overlapping blocks of `nfft` samples,
//! Hann-windowed and transformed. Cross and auto spectra are averaged over
//! blocks and combined as
//!
//! ```text
//! C_xy(f) = |P_xy(f)|² / (P_xx(f) · P_yy(f))
//! ```
//!
//! A signal shorter than one block is zero-padded to `nfft`. A trailing
//! partial block is dropped.

use super::{CoherenceKernel, KernelError, PartialResult, TransientSeries};
use crate::estimate::freq_bins;
use ndarray::{s, Array1, Array5, ArrayView1};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

type Cx = Complex<f64>;

/// Default coherence kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct WelchCoherence;

impl WelchCoherence {
    pub fn new() -> Self {
        Self
    }
}

/// Symmetric Hann window of length `n`.
fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|k| 0.5 - 0.5 * (2.0 * PI * k as f64 / denom).cos())
        .collect()
}

/// One-sided spectra of every block of `signal`, concatenated block after block.
fn block_spectra(
    signal: ArrayView1<f64>,
    nfft: usize,
    bins: usize,
    window: &[f64],
    fft: &Arc<dyn Fft<f64>>,
) -> Vec<Cx> {
    let len = signal.len();
    let blocks = (len / nfft).max(1);
    let mut out = Vec::with_capacity(blocks * bins);
    let mut buffer = vec![Cx::new(0.0, 0.0); nfft];

    for block in 0..blocks {
        let start = block * nfft;
        for (k, slot) in buffer.iter_mut().enumerate() {
            let sample = signal.get(start + k).copied().unwrap_or(0.0);
            *slot = Cx::new(sample * window[k], 0.0);
        }
        fft.process(&mut buffer);
        out.extend_from_slice(&buffer[..bins]);
    }
    out
}

impl CoherenceKernel for WelchCoherence {
    fn compute(&self, series: &TransientSeries, nfft: usize) -> Result<PartialResult, KernelError> {
        if nfft == 0 {
            return Err(KernelError::new("nfft must be > 0"));
        }
        let (time_len, vars, nodes, modes) = series.data.dim();
        if time_len == 0 || nodes == 0 || modes == 0 || vars == 0 {
            return Err(KernelError::new(format!(
                "empty slice with shape {:?}",
                series.data.shape()
            )));
        }
        if let Some(bad) = series.data.iter().find(|v| !v.is_finite()) {
            return Err(KernelError::new(format!("non-finite sample {}", bad)));
        }

        let sample_rate = series.sample_rate_hz()?;
        let bins = freq_bins(nfft);
        let window = hann(nfft);
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(nfft);

        if time_len < nfft {
            tracing::debug!(
                "Slice has {} samples, fewer than nfft={}; zero-padding a single block",
                time_len,
                nfft
            );
        }

        let mut tensor = Array5::<f64>::zeros((bins, nodes, nodes, vars, modes));

        for var in 0..vars {
            for mode in 0..modes {
                let spectra: Vec<Vec<Cx>> = (0..nodes)
                    .map(|node| {
                        let signal = series.data.slice(s![.., var, node, mode]);
                        block_spectra(signal, nfft, bins, &window, &fft)
                    })
                    .collect();
                let blocks = spectra[0].len() / bins;

                let auto: Vec<Vec<f64>> = spectra
                    .iter()
                    .map(|s| {
                        (0..bins)
                            .map(|b| (0..blocks).map(|k| s[k * bins + b].norm_sqr()).sum::<f64>())
                            .collect()
                    })
                    .collect();

                for i in 0..nodes {
                    for j in i..nodes {
                        for b in 0..bins {
                            let denom = auto[i][b] * auto[j][b];
                            let coh = if denom > 0.0 {
                                let cross: Cx = (0..blocks)
                                    .map(|k| spectra[i][k * bins + b].conj() * spectra[j][k * bins + b])
                                    .sum();
                                (cross.norm_sqr() / denom).min(1.0)
                            } else {
                                0.0
                            };
                            tensor[[b, i, j, var, mode]] = coh;
                            tensor[[b, j, i, var, mode]] = coh;
                        }
                    }
                }
            }
        }

        let frequency = Array1::from_iter((0..bins).map(|b| b as f64 * sample_rate / nfft as f64));

        Ok(PartialResult {
            tensor,
            frequency,
            nfft,
        })
    }
}
