//! Pipeline orchestration for slice-by-slice coherence.

mod coherence;
mod metrics;

#[cfg(test)]
mod pipeline_integration_tests;

pub use coherence::{
    CancelFlag, CoherencePipeline, PipelineState, RunReport, ScalarAccumulator, SeriesInfo,
};
pub use metrics::{Metrics, MetricsSnapshot};
