//! Slice-by-slice coherence orchestration.
//!
//! ```text
//! Configured ─▶ Estimating ─▶ Running(0..v) ─▶ Finalizing ─▶ Done
//!      └────────────┴──────────────┴──────────────┴──────▶ Failed
//! ```
//!
//! Each iteration reads one variable slice `(t, 1, n, m)`, runs the kernel on
//! it and hands the partial result to the writer before the next slice is
//! touched. Peak memory is one input slice plus one partial result, which is
//! exactly what `estimate` reports.

use crate::error::{CoherenceError, Result};
use crate::estimate::{freq_bins, validate_nfft, SizeEstimate};
use crate::io::{ResultLayout, ResultSink, ScalarMetadata, SeriesReader, SliceIndex};
use crate::kernel::{period_unit_seconds, CoherenceKernel, PartialResult, TransientSeries};
use crate::pipeline::{Metrics, MetricsSnapshot};
use ndarray::Array1;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Configured,
    Estimating,
    Running { variable: usize },
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configured => write!(f, "configured"),
            Self::Estimating => write!(f, "estimating"),
            Self::Running { variable } => write!(f, "running variable {}", variable),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Shared flag for abandoning a run between slices.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Series metadata captured by `configure`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesInfo {
    /// `(time, variable, node, mode)`
    pub shape: [usize; 4],
    pub sample_period: f64,
    pub sample_period_unit: String,
    pub gid: String,
}

/// Scalar kernel outputs carried across slices.
///
/// Every slice must produce the same frequency vector and nfft; the values are
/// a function of the transform parameters only.
#[derive(Debug, Clone, Default)]
pub struct ScalarAccumulator {
    frequency: Option<Array1<f64>>,
    nfft: Option<usize>,
}

impl ScalarAccumulator {
    /// Fold one partial result in, checking it agrees with earlier slices.
    pub fn fold(self, variable: usize, partial: &PartialResult) -> Result<Self> {
        if let Some(nfft) = self.nfft {
            if nfft != partial.nfft {
                return Err(CoherenceError::kernel_failure(
                    variable,
                    format!("nfft changed from {} to {} between slices", nfft, partial.nfft),
                ));
            }
        }
        if let Some(frequency) = &self.frequency {
            if *frequency != partial.frequency {
                return Err(CoherenceError::kernel_failure(
                    variable,
                    "frequency vector differs from earlier slices",
                ));
            }
        }
        Ok(Self {
            frequency: Some(partial.frequency.clone()),
            nfft: Some(partial.nfft),
        })
    }

    /// The retained frequency vector and nfft, if any slice was folded.
    pub fn finish(self) -> Option<(Array1<f64>, usize)> {
        self.frequency.zip(self.nfft)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Identifier stamped on the result
    pub gid: Uuid,
    /// Identifier of the input series
    pub source_gid: String,
    /// `(freq, n, n, v, m)`
    pub result_shape: [usize; 5],
    pub frequency_bins: usize,
    pub slices_written: usize,
    pub metrics: MetricsSnapshot,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "result {} from {}: shape {:?}, {} frequency bins, {} slices",
            self.gid, self.source_gid, self.result_shape, self.frequency_bins, self.slices_written
        )
    }
}

/// Out-of-core node coherence over one input series.
pub struct CoherencePipeline<R: SeriesReader, K: CoherenceKernel> {
    reader: R,
    kernel: K,
    info: SeriesInfo,
    state: PipelineState,
    metrics: Arc<Metrics>,
    cancel: CancelFlag,
}

impl<R: SeriesReader, K: CoherenceKernel> CoherencePipeline<R, K> {
    /// Read the input shape and scalar attributes.
    ///
    /// Fails with `InvalidInput` if the series is not 4D or has an empty axis.
    /// The reader is closed on failure.
    pub fn configure(mut reader: R, kernel: K) -> Result<Self> {
        match read_info(&reader) {
            Ok(info) => {
                tracing::debug!("Time series shape is {:?}", info.shape);
                Ok(Self {
                    reader,
                    kernel,
                    info,
                    state: PipelineState::Configured,
                    metrics: Metrics::new(),
                    cancel: CancelFlag::new(),
                })
            }
            Err(e) => {
                let _ = reader.close();
                Err(e)
            }
        }
    }

    /// Use an external cancellation flag.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record into an external metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn info(&self) -> &SeriesInfo {
        &self.info
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Give back the reader, e.g. to inspect it after a run.
    pub fn into_reader(self) -> R {
        self.reader
    }

    /// Layout of the result this pipeline produces for `nfft`.
    pub fn layout(&self, nfft: usize) -> ResultLayout {
        ResultLayout::new(self.info.shape, nfft)
    }

    /// Memory and disk estimate for running with `nfft`.
    pub fn estimate(&mut self, nfft: usize) -> Result<SizeEstimate> {
        match self.state {
            PipelineState::Configured | PipelineState::Estimating => {}
            state => {
                return Err(CoherenceError::InvalidState {
                    operation: "estimate",
                    state: state.to_string(),
                })
            }
        }
        self.state = PipelineState::Estimating;
        let estimate = SizeEstimate::compute(self.info.shape, nfft)?;
        tracing::info!("Estimate for shape {:?}, nfft={}: {}", self.info.shape, nfft, estimate);
        Ok(estimate)
    }

    /// Compute coherence for every variable and write it through `writer`.
    ///
    /// On any failure the writer is discarded, the reader closed, and the
    /// original error returned. Nothing is retried.
    pub fn run<W: ResultSink>(&mut self, nfft: usize, writer: &mut W) -> Result<RunReport> {
        match self.state {
            PipelineState::Configured | PipelineState::Estimating => {}
            state => {
                return Err(CoherenceError::InvalidState {
                    operation: "run",
                    state: state.to_string(),
                })
            }
        }

        match self.run_inner(nfft, writer) {
            Ok(report) => {
                self.state = PipelineState::Done;
                tracing::info!("Coherence complete: {}", report);
                Ok(report)
            }
            Err(e) => {
                if e.is_contract_violation() {
                    tracing::error!("Writer contract violated while {}: {}", self.state, e);
                } else {
                    tracing::error!("Coherence failed while {}: {}", self.state, e);
                }
                self.state = PipelineState::Failed;
                self.metrics.add_failure();
                if let Err(discard_err) = writer.discard() {
                    tracing::warn!("Failed to discard partial result: {}", discard_err);
                }
                if let Err(close_err) = self.reader.close() {
                    tracing::warn!("Failed to close input: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn run_inner<W: ResultSink>(&mut self, nfft: usize, writer: &mut W) -> Result<RunReport> {
        validate_nfft(nfft)?;

        let variables = self.info.shape[1];
        tracing::info!(
            "Computing coherence for {} variables (nfft={}, {} frequency bins)",
            variables,
            nfft,
            freq_bins(nfft)
        );

        let mut acc = ScalarAccumulator::default();
        for variable in 0..variables {
            if self.cancel.is_cancelled() {
                tracing::warn!("Cancellation requested after {} slices", variable);
                return Err(CoherenceError::Cancelled {
                    completed: variable,
                });
            }
            self.state = PipelineState::Running { variable };
            acc = self.process_slice(variable, nfft, writer, acc)?;
            self.metrics.log_progress(variables);
        }

        self.state = PipelineState::Finalizing;
        let (frequency, kernel_nfft) = acc
            .finish()
            .ok_or_else(|| CoherenceError::invalid_input("series has no variables"))?;

        let metadata = ScalarMetadata {
            gid: Uuid::new_v4(),
            source_gid: self.info.gid.clone(),
            sample_period: self.info.sample_period,
            sample_period_unit: self.info.sample_period_unit.clone(),
            nfft: kernel_nfft,
            frequency_bins: frequency.len(),
        };

        writer.write_frequency_vector(&frequency)?;
        writer.write_scalar_metadata(&metadata)?;
        self.metrics.add_bytes_written(frequency.len() as u64 * 8);
        // Sealing is the last fallible step so a failure never discards a sealed result
        self.reader.close()?;
        writer.close()?;

        let layout = self.layout(nfft);
        Ok(RunReport {
            gid: metadata.gid,
            source_gid: metadata.source_gid,
            result_shape: layout.tensor_shape(),
            frequency_bins: metadata.frequency_bins,
            slices_written: variables,
            metrics: self.metrics.snapshot(),
        })
    }

    /// Read, transform and write one variable slice.
    fn process_slice<W: ResultSink>(
        &mut self,
        variable: usize,
        nfft: usize,
        writer: &mut W,
        acc: ScalarAccumulator,
    ) -> Result<ScalarAccumulator> {
        let index = SliceIndex::variable(self.info.shape, variable);
        tracing::debug!("Reading variable {} with ranges {:?}", variable, index.ranges);

        let read_start = Instant::now();
        let data = self.reader.read_slice(&index)?;
        self.metrics.add_read_time(read_start.elapsed());
        self.metrics.add_bytes_read(data.len() as u64 * 8);

        let series = TransientSeries {
            data,
            sample_period: self.info.sample_period,
            sample_period_unit: self.info.sample_period_unit.clone(),
        };

        let kernel_start = Instant::now();
        let partial = self
            .kernel
            .compute(&series, nfft)
            .map_err(|e| CoherenceError::kernel_failure(variable, e.message))?;
        self.metrics.add_kernel_time(kernel_start.elapsed());
        self.metrics.add_kernel_call();
        drop(series);

        let expected = self.layout(nfft).slice_shape();
        if partial.tensor.shape() != expected {
            return Err(CoherenceError::kernel_failure(
                variable,
                format!(
                    "partial result shape {:?} does not match expected {:?}",
                    partial.tensor.shape(),
                    expected
                ),
            ));
        }
        let acc = acc.fold(variable, &partial)?;

        let write_start = Instant::now();
        writer.write_slice(variable, &partial.tensor)?;
        self.metrics.add_write_time(write_start.elapsed());
        self.metrics.add_bytes_written(partial.tensor.len() as u64 * 8);
        self.metrics.add_slice_written();

        tracing::debug!("Variable {} written", variable);
        Ok(acc)
    }
}

fn read_info<R: SeriesReader>(reader: &R) -> Result<SeriesInfo> {
    let dims = reader.shape()?;
    if dims.len() != 4 {
        return Err(CoherenceError::invalid_input(format!(
            "expected a 4D (time, variable, node, mode) series, got {} dimensions",
            dims.len()
        )));
    }
    let shape = [dims[0], dims[1], dims[2], dims[3]];
    if let Some(axis) = shape.iter().position(|&d| d == 0) {
        return Err(CoherenceError::invalid_input(format!(
            "axis {} of series shape {:?} is empty",
            axis, shape
        )));
    }

    let sample_period = reader.sample_period()?;
    if !(sample_period.is_finite() && sample_period > 0.0) {
        return Err(CoherenceError::invalid_input(format!(
            "sample period must be positive, got {}",
            sample_period
        )));
    }

    let sample_period_unit = reader.sample_period_unit()?;
    if period_unit_seconds(&sample_period_unit).is_none() {
        return Err(CoherenceError::invalid_input(format!(
            "unsupported sample period unit '{}'",
            sample_period_unit
        )));
    }

    Ok(SeriesInfo {
        shape,
        sample_period,
        sample_period_unit,
        gid: reader.gid()?,
    })
}
