//! Node Coherence
//!
//! Out-of-core cross-coherence between every pair of nodes of a 4D time
//! series `(time, variable, node, mode)`, written to a chunked Zarr container
//! one variable slice at a time.
//!
//! # Architecture
//!
//! - **Estimate**: Pure memory/disk projections and admission limits
//! - **Kernel**: Welch-style magnitude-squared coherence over FFT blocks
//! - **I/O**: Zarr series reader and the sequential result writer
//! - **Pipeline**: The slice-by-slice state machine with metrics
//!
//! # Usage
//!
//! ```no_run
//! use node_coherence::{run_analysis, CancelFlag, Config};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_analysis(&config, CancelFlag::new())?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod estimate;
pub mod io;
pub mod kernel;
pub mod pipeline;
pub mod synthetic;

pub use config::Config;
pub use error::{CoherenceError, Result};
pub use estimate::{estimate_disk_kilobytes, estimate_memory_bytes, freq_bins, Limits, SizeEstimate};
pub use io::{CoherenceResultReader, ZarrResultWriter, ZarrSeriesReader};
pub use kernel::{CoherenceKernel, WelchCoherence};
pub use pipeline::{CancelFlag, CoherencePipeline, Metrics, PipelineState, RunReport, SeriesInfo};
pub use synthetic::SyntheticSeries;

use anyhow::Context;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Pre-flight view of a configured run.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub series: SeriesInfo,
    pub nfft: usize,
    /// `(freq, n, n, v, m)`
    pub result_shape: [usize; 5],
    pub estimate: SizeEstimate,
    /// Why admission was refused, if it was
    pub denied: Option<String>,
}

impl Analysis {
    pub fn admitted(&self) -> bool {
        self.denied.is_none()
    }
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Series: {} shape {:?}", self.series.gid, self.series.shape)?;
        writeln!(
            f,
            "Sample period: {} {}",
            self.series.sample_period, self.series.sample_period_unit
        )?;
        writeln!(f, "nfft: {} ({} frequency bins)", self.nfft, freq_bins(self.nfft))?;
        writeln!(f, "Result shape: {:?}", self.result_shape)?;
        writeln!(f, "Estimate: {}", self.estimate)?;
        match &self.denied {
            None => write!(f, "Admission: accepted"),
            Some(reason) => write!(f, "Admission: denied ({})", reason),
        }
    }
}

/// Estimate a configured run without computing anything.
pub fn analyze(config: &Config) -> anyhow::Result<Analysis> {
    config.validate()?;

    let reader = ZarrSeriesReader::open(&config.input.path)
        .with_context(|| format!("opening input series {}", config.input.path))?;
    let mut pipeline = CoherencePipeline::configure(reader, WelchCoherence::new())?;

    let nfft = config.analysis.nfft;
    let estimate = pipeline.estimate(nfft)?;
    let denied = estimate.admit(&config.limits).err().map(|e| e.to_string());

    Ok(Analysis {
        series: pipeline.info().clone(),
        nfft,
        result_shape: pipeline.layout(nfft).tensor_shape(),
        estimate,
        denied,
    })
}

/// Run the full coherence analysis with the given configuration.
pub fn run_analysis(config: &Config, cancel: CancelFlag) -> anyhow::Result<RunReport> {
    config.validate()?;

    tracing::info!("Starting node coherence analysis");
    tracing::info!("Reading time series from {}", config.input.path);

    let reader = ZarrSeriesReader::open(&config.input.path)
        .with_context(|| format!("opening input series {}", config.input.path))?;

    let mut pipeline =
        CoherencePipeline::configure(reader, WelchCoherence::new())?.with_cancel_flag(cancel);

    // Admission happens before the destination is touched
    let nfft = config.analysis.nfft;
    let estimate = pipeline.estimate(nfft)?;
    estimate.admit(&config.limits)?;

    let output = Path::new(&config.output.path);
    if output.exists() && !config.output.overwrite {
        return Err(CoherenceError::storage_unavailable(
            output,
            "destination exists and output.overwrite is false",
        )
        .into());
    }

    tracing::info!("Writing coherence result to: {}", output.display());
    let mut writer = ZarrResultWriter::open(output, pipeline.layout(nfft), config.output.compression_level)?;

    let report = pipeline.run(nfft, &mut writer)?;

    if let Some(path) = &config.processing.metrics_output_path {
        report
            .metrics
            .save_to_file(path)
            .with_context(|| format!("saving metrics to {}", path))?;
    }

    tracing::info!("Analysis complete: {}", report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn trial(temp: &TempDir) -> Config {
        let input = temp.path().join("series.zarr");
        SyntheticSeries {
            shape: [256, 2, 3, 1],
            ..Default::default()
        }
        .write(&input, "trial")
        .unwrap();

        let mut config = Config::new(
            input.to_string_lossy(),
            temp.path().join("result.zarr").to_string_lossy(),
        );
        config.analysis.nfft = 32;
        config
    }

    #[test]
    fn test_analyze_reports_estimate() {
        let temp = TempDir::new().unwrap();
        let mut config = trial(&temp);

        let analysis = analyze(&config).unwrap();
        assert_eq!(analysis.result_shape, [17, 3, 3, 2, 1]);
        assert!(analysis.admitted());
        assert!(!Path::new(&config.output.path).exists());

        config.limits.max_memory_bytes = Some(1);
        let analysis = analyze(&config).unwrap();
        assert!(!analysis.admitted());
    }

    #[test]
    fn test_run_analysis_writes_sealed_result() {
        let temp = TempDir::new().unwrap();
        let mut config = trial(&temp);
        let metrics_path = temp.path().join("metrics.json");
        config.processing.metrics_output_path = Some(metrics_path.to_string_lossy().into_owned());

        let report = run_analysis(&config, CancelFlag::new()).unwrap();
        assert_eq!(report.source_gid, "trial");
        assert!(metrics_path.exists());

        let result = CoherenceResultReader::open(&config.output.path).unwrap();
        assert_eq!(result.shape(), vec![17, 3, 3, 2, 1]);
        assert_eq!(result.metadata().gid, report.gid);
    }

    #[test]
    fn test_run_analysis_admission_denied() {
        let temp = TempDir::new().unwrap();
        let mut config = trial(&temp);
        config.limits.max_disk_kilobytes = Some(1);
        config.analysis.nfft = 4096;

        let err = run_analysis(&config, CancelFlag::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoherenceError>(),
            Some(CoherenceError::AdmissionDenied { .. })
        ));
        assert!(!Path::new(&config.output.path).exists());
    }

    #[test]
    fn test_run_analysis_zero_nfft_is_invalid_parameter() {
        let temp = TempDir::new().unwrap();
        let mut config = trial(&temp);
        config.analysis.nfft = 0;

        let err = run_analysis(&config, CancelFlag::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoherenceError>(),
            Some(CoherenceError::InvalidParameter { .. })
        ));
        assert!(!Path::new(&config.output.path).exists());
    }

    #[test]
    fn test_run_analysis_respects_overwrite() {
        let temp = TempDir::new().unwrap();
        let mut config = trial(&temp);
        run_analysis(&config, CancelFlag::new()).unwrap();

        assert!(run_analysis(&config, CancelFlag::new()).is_err());
        // The existing result is untouched
        assert!(CoherenceResultReader::open(&config.output.path).is_ok());

        config.output.overwrite = true;
        assert!(run_analysis(&config, CancelFlag::new()).is_ok());
    }
}
