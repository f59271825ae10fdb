//! Integration tests for CoherencePipeline at the reader/kernel/writer boundaries.
//!
//! Tests cover:
//! 1. Call ordering against recording collaborators
//! 2. Failure and cancellation cleanup
//! 3. Full round trip through Zarr series and result containers

use crate::error::CoherenceError;
use crate::io::{
    CoherenceResultReader, InMemorySeries, ResultSink, ScalarMetadata, SeriesAttributes,
    ZarrResultWriter, ZarrSeriesReader, ZarrSeriesWriter,
};
use crate::kernel::{CoherenceKernel, KernelError, PartialResult, TransientSeries, WelchCoherence};
use crate::pipeline::{CancelFlag, CoherencePipeline, PipelineState};
use ndarray::{Array1, Array4, Array5};
use std::cell::Cell;
use std::f64::consts::PI;
use tempfile::TempDir;

fn attributes() -> SeriesAttributes {
    SeriesAttributes {
        gid: "series-abc".to_string(),
        sample_period: 1.0,
        sample_period_unit: "ms".to_string(),
    }
}

/// Per-node sinusoids at 125 Hz (bin 32 of 256 at 1 kHz) with node-specific
/// phase and a little deterministic noise.
fn synthetic(shape: [usize; 4]) -> Array4<f64> {
    Array4::from_shape_fn((shape[0], shape[1], shape[2], shape[3]), |(t, v, n, m)| {
        let phase = (n as f64) * 0.3 + (v as f64) * 0.1 + (m as f64) * 0.05;
        let noise = (((t * 7919 + n * 104_729 + v * 31 + m * 17) % 1000) as f64 / 1000.0 - 0.5) * 0.1;
        (2.0 * PI * 125.0 * t as f64 / 1000.0 + phase).sin() + noise
    })
}

/// Records every call made to it.
#[derive(Default)]
struct RecordingSink {
    slices: Vec<usize>,
    shapes: Vec<Vec<usize>>,
    frequency: Option<Array1<f64>>,
    metadata: Option<ScalarMetadata>,
    closed: bool,
    discarded: bool,
}

impl ResultSink for RecordingSink {
    fn write_slice(&mut self, index: usize, tensor: &Array5<f64>) -> crate::error::Result<()> {
        self.slices.push(index);
        self.shapes.push(tensor.shape().to_vec());
        Ok(())
    }

    fn write_frequency_vector(&mut self, frequency: &Array1<f64>) -> crate::error::Result<()> {
        self.frequency = Some(frequency.clone());
        Ok(())
    }

    fn write_scalar_metadata(&mut self, metadata: &ScalarMetadata) -> crate::error::Result<()> {
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    fn close(&mut self) -> crate::error::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn discard(&mut self) -> crate::error::Result<()> {
        self.discarded = true;
        Ok(())
    }
}

/// Wraps the Welch kernel, counting calls and optionally misbehaving on one.
#[derive(Default)]
struct ScriptedKernel {
    calls: Cell<usize>,
    fail_on: Option<usize>,
    drift_nfft_on: Option<usize>,
    cancel_on: Option<(usize, CancelFlag)>,
}

impl CoherenceKernel for ScriptedKernel {
    fn compute(&self, series: &TransientSeries, nfft: usize) -> Result<PartialResult, KernelError> {
        let call = self.calls.get();
        self.calls.set(call + 1);

        if self.fail_on == Some(call) {
            return Err(KernelError::new("scripted failure"));
        }
        if let Some((on, flag)) = &self.cancel_on {
            if *on == call {
                flag.cancel();
            }
        }

        let mut partial = WelchCoherence::new().compute(series, nfft)?;
        if self.drift_nfft_on == Some(call) {
            partial.nfft += 1;
        }
        Ok(partial)
    }
}

/// Test 1: (100, 2, 5, 1) with nfft 256
#[test]
fn test_two_variable_scenario() {
    let shape = [100, 2, 5, 1];
    let series = InMemorySeries::new(synthetic(shape), attributes());
    let kernel = ScriptedKernel::default();
    let mut sink = RecordingSink::default();

    let mut pipeline = CoherencePipeline::configure(series, &kernel).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Configured);
    assert_eq!(pipeline.info().shape, shape);

    let report = pipeline.run(256, &mut sink).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Done);

    assert_eq!(kernel.calls.get(), 2);
    assert_eq!(sink.slices, vec![0, 1]);
    assert!(sink.shapes.iter().all(|s| s == &[129, 5, 5, 1, 1]));
    assert_eq!(report.result_shape, [129, 5, 5, 2, 1]);
    assert_eq!(report.frequency_bins, 129);
    assert_eq!(report.slices_written, 2);
    assert_eq!(report.source_gid, "series-abc");
    assert_eq!(report.metrics.kernel_calls, 2);
    assert_eq!(report.metrics.slices_written, 2);
    assert_eq!(report.metrics.bytes_read, 100 * 2 * 5 * 8);

    let frequency = sink.frequency.as_ref().unwrap();
    assert_eq!(frequency.len(), 129);
    assert!((frequency[1] - 1000.0 / 256.0).abs() < 1e-9);

    let metadata = sink.metadata.as_ref().unwrap();
    assert_eq!(metadata.gid, report.gid);
    assert_eq!(metadata.source_gid, "series-abc");
    assert_eq!(metadata.nfft, 256);
    assert_eq!(metadata.frequency_bins, 129);
    assert!(sink.closed);
    assert!(!sink.discarded);

    assert!(pipeline.into_reader().is_closed());
}

/// Test 2: kernel invoked once per variable, slices written in ascending order
#[test]
fn test_slices_written_in_order() {
    let shape = [64, 5, 3, 2];
    let series = InMemorySeries::new(synthetic(shape), attributes());
    let kernel = ScriptedKernel::default();
    let mut sink = RecordingSink::default();

    let mut pipeline = CoherencePipeline::configure(series, &kernel).unwrap();
    pipeline.run(16, &mut sink).unwrap();

    assert_eq!(kernel.calls.get(), 5);
    assert_eq!(sink.slices, (0..5).collect::<Vec<_>>());
    assert_eq!(pipeline.into_reader().reads(), 5);
}

/// Test 3: nfft 0 fails before any read
#[test]
fn test_zero_nfft_reads_nothing() {
    let series = InMemorySeries::new(synthetic([100, 2, 5, 1]), attributes());
    let kernel = ScriptedKernel::default();
    let mut sink = RecordingSink::default();

    let mut pipeline = CoherencePipeline::configure(series, &kernel).unwrap();
    let err = pipeline.run(0, &mut sink).unwrap_err();

    assert!(matches!(err, CoherenceError::InvalidParameter { .. }));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(kernel.calls.get(), 0);
    assert!(sink.slices.is_empty());
    assert!(sink.discarded);
    assert_eq!(pipeline.into_reader().reads(), 0);
}

/// Test 4: invalid inputs are rejected at configure time
#[test]
fn test_configure_rejects_empty_axis() {
    let empty_variables = InMemorySeries::new(Array4::zeros((10, 0, 3, 1)), attributes());
    assert!(matches!(
        CoherencePipeline::configure(empty_variables, WelchCoherence::new()),
        Err(CoherenceError::InvalidInput { .. })
    ));

    let empty_time = InMemorySeries::new(Array4::zeros((0, 2, 3, 1)), attributes());
    assert!(matches!(
        CoherencePipeline::configure(empty_time, WelchCoherence::new()),
        Err(CoherenceError::InvalidInput { .. })
    ));

    let mut bad_period = attributes();
    bad_period.sample_period = 0.0;
    let series = InMemorySeries::new(Array4::zeros((10, 2, 3, 1)), bad_period);
    assert!(matches!(
        CoherencePipeline::configure(series, WelchCoherence::new()),
        Err(CoherenceError::InvalidInput { .. })
    ));

    let mut bad_unit = attributes();
    bad_unit.sample_period_unit = "furlongs".to_string();
    let series = InMemorySeries::new(Array4::zeros((10, 2, 3, 1)), bad_unit);
    assert!(matches!(
        CoherencePipeline::configure(series, WelchCoherence::new()),
        Err(CoherenceError::InvalidInput { .. })
    ));
}

/// Test 5: a kernel failure mid-run discards the output
#[test]
fn test_kernel_failure_discards() {
    let series = InMemorySeries::new(synthetic([64, 3, 2, 1]), attributes());
    let kernel = ScriptedKernel {
        fail_on: Some(1),
        ..Default::default()
    };
    let mut sink = RecordingSink::default();

    let mut pipeline = CoherencePipeline::configure(series, &kernel).unwrap();
    let err = pipeline.run(16, &mut sink).unwrap_err();

    match err {
        CoherenceError::KernelFailure { variable, .. } => assert_eq!(variable, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sink.slices, vec![0]);
    assert!(sink.discarded);
    assert!(!sink.closed);
    assert_eq!(pipeline.metrics().snapshot().failures, 1);
    assert!(pipeline.into_reader().is_closed());
}

/// Test 6: scalar outputs that drift between slices abort the run
#[test]
fn test_inconsistent_scalars_abort() {
    let series = InMemorySeries::new(synthetic([64, 3, 2, 1]), attributes());
    let kernel = ScriptedKernel {
        drift_nfft_on: Some(2),
        ..Default::default()
    };
    let mut sink = RecordingSink::default();

    let mut pipeline = CoherencePipeline::configure(series, &kernel).unwrap();
    let err = pipeline.run(16, &mut sink).unwrap_err();

    assert!(matches!(err, CoherenceError::KernelFailure { variable: 2, .. }));
    // The drifted slice never reaches the writer
    assert_eq!(sink.slices, vec![0, 1]);
    assert!(sink.metadata.is_none());
    assert!(sink.discarded);
}

/// Test 7: cancellation is observed before the next slice
#[test]
fn test_cancellation_between_slices() {
    let flag = CancelFlag::new();
    let series = InMemorySeries::new(synthetic([64, 4, 2, 1]), attributes());
    let kernel = ScriptedKernel {
        cancel_on: Some((0, flag.clone())),
        ..Default::default()
    };
    let mut sink = RecordingSink::default();

    let mut pipeline = CoherencePipeline::configure(series, &kernel)
        .unwrap()
        .with_cancel_flag(flag);
    let err = pipeline.run(16, &mut sink).unwrap_err();

    assert!(matches!(err, CoherenceError::Cancelled { completed: 1 }));
    assert_eq!(kernel.calls.get(), 1);
    assert_eq!(sink.slices, vec![0]);
    assert!(sink.discarded);
    assert_eq!(pipeline.state(), PipelineState::Failed);
}

/// Test 8: estimate and run are only valid before a run completes
#[test]
fn test_state_transitions() {
    let series = InMemorySeries::new(synthetic([100, 2, 5, 1]), attributes());
    let mut pipeline = CoherencePipeline::configure(series, WelchCoherence::new()).unwrap();

    let estimate = pipeline.estimate(256).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Estimating);
    assert_eq!(estimate.memory_bytes, 100 * 5 * 8 + (129 * 5 * 5 + 129) * 8);
    // Re-estimating is allowed
    pipeline.estimate(128).unwrap();

    let mut sink = RecordingSink::default();
    pipeline.run(256, &mut sink).unwrap();

    assert!(matches!(
        pipeline.estimate(256),
        Err(CoherenceError::InvalidState { operation: "estimate", .. })
    ));
    let mut second = RecordingSink::default();
    assert!(matches!(
        pipeline.run(256, &mut second),
        Err(CoherenceError::InvalidState { operation: "run", .. })
    ));
    assert!(second.slices.is_empty());
    assert!(!second.discarded);
}

/// Test 9: Zarr series in, Zarr result out, reopened and checked
#[test]
fn test_zarr_end_to_end() {
    let temp = TempDir::new().unwrap();
    let series_path = temp.path().join("series.zarr");
    let result_path = temp.path().join("result.zarr");
    let shape = [512, 2, 3, 2];
    let nfft = 64;

    let writer = ZarrSeriesWriter::create(&series_path, shape, &attributes(), 3).unwrap();
    writer.write_all(synthetic(shape).view()).unwrap();

    let reader = ZarrSeriesReader::open(&series_path).unwrap();
    let mut pipeline = CoherencePipeline::configure(reader, WelchCoherence::new()).unwrap();
    let estimate = pipeline.estimate(nfft).unwrap();

    let mut sink = ZarrResultWriter::open(&result_path, pipeline.layout(nfft), 3).unwrap();
    let report = pipeline.run(nfft, &mut sink).unwrap();
    drop(sink);

    let result = CoherenceResultReader::open(&result_path).unwrap();
    assert_eq!(result.shape(), vec![33, 3, 3, 2, 2]);
    assert_eq!(result.metadata().gid, report.gid);
    assert_eq!(result.metadata().source_gid, "series-abc");
    assert_eq!(result.metadata().nfft, nfft);
    assert_eq!(result.frequency().unwrap().len(), 33);

    // One variable's uncompressed result plus the frequency vector
    assert_eq!(estimate.disk_kilobytes, ((33 * 3 * 3 * 2 + 33) * 8 / 1024) as u64);

    for variable in 0..2 {
        let coherence = result.read_variable(variable).unwrap();
        assert!(coherence.iter().all(|&c| (0.0..=1.0).contains(&c)));
        for node in 0..3 {
            for mode in 0..2 {
                // Bin 8 carries the 125 Hz tone at 1 kHz with nfft 64
                assert!((coherence[[8, node, node, 0, mode]] - 1.0).abs() < 1e-9);
            }
        }
        assert!(coherence[[8, 0, 2, 0, 0]] > 0.9);
        assert_eq!(coherence[[8, 0, 2, 0, 0]], coherence[[8, 2, 0, 0, 0]]);
    }
}

/// Test 10: a failed Zarr run leaves no container behind
#[test]
fn test_zarr_failure_leaves_nothing() {
    let temp = TempDir::new().unwrap();
    let result_path = temp.path().join("result.zarr");
    let series = InMemorySeries::new(synthetic([64, 3, 2, 1]), attributes());
    let kernel = ScriptedKernel {
        fail_on: Some(2),
        ..Default::default()
    };

    let mut pipeline = CoherencePipeline::configure(series, &kernel).unwrap();
    let mut sink = ZarrResultWriter::open(&result_path, pipeline.layout(16), 3).unwrap();
    assert!(result_path.exists());

    assert!(pipeline.run(16, &mut sink).is_err());
    assert!(!result_path.exists());
    assert_eq!(sink.slices_written(), 2);
}
