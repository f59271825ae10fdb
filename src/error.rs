//! Error types for the coherence pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, CoherenceError>;

/// Errors that can occur while estimating, computing or persisting coherence.
///
/// Every variant aborts a run. Nothing is retried internally.
#[derive(Debug, Error)]
pub enum CoherenceError {
    /// A parameter is structurally invalid (e.g. `nfft == 0`).
    #[error("Invalid parameter: {message}")]
    InvalidParameter {
        /// Description of what's wrong with the parameter
        message: String,
    },

    /// The input series has an unsupported rank, an empty axis or bad attributes.
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Description of what's wrong with the input
        message: String,
    },

    /// The input container could not be opened or read.
    #[error("Input unavailable at {path}: {message}")]
    InputUnavailable {
        /// Location of the input container
        path: PathBuf,
        /// Underlying failure
        message: String,
    },

    /// The output destination could not be created or written.
    #[error("Storage unavailable at {path}: {message}")]
    StorageUnavailable {
        /// Location of the output container
        path: PathBuf,
        /// Underlying failure
        message: String,
    },

    /// A slice was written out of order or more than once.
    #[error("Out-of-order write: expected slice {expected}, got {actual}")]
    OutOfOrderWrite {
        /// The next index the writer accepts
        expected: usize,
        /// The index that was supplied
        actual: usize,
    },

    /// Finalization was attempted before every slice was written, or repeated.
    #[error("Premature finalize of {field}: {written} of {expected} slices written")]
    PrematureFinalize {
        /// Which finalization step was attempted
        field: &'static str,
        /// Slices written so far
        written: usize,
        /// Slices the container expects
        expected: usize,
    },

    /// A tensor does not have the shape the container expects.
    #[error("Shape mismatch: expected {expected:?}, actual {actual:?}")]
    ShapeMismatch {
        /// Expected tensor shape
        expected: Vec<usize>,
        /// Shape that was supplied
        actual: Vec<usize>,
    },

    /// The writer has already been closed or discarded.
    #[error("Writer for {path} is closed")]
    WriterClosed {
        /// Location of the output container
        path: PathBuf,
    },

    /// The coherence kernel rejected a slice.
    #[error("Kernel failure on variable {variable}: {message}")]
    KernelFailure {
        /// Variable index being processed
        variable: usize,
        /// Description of the failure
        message: String,
    },

    /// A size estimate exceeds a configured limit.
    #[error("Admission denied: {resource} estimate {estimate} exceeds limit {limit}")]
    AdmissionDenied {
        /// Which resource was exceeded ("memory bytes" or "disk kilobytes")
        resource: &'static str,
        /// Estimated requirement
        estimate: u64,
        /// Configured limit
        limit: u64,
    },

    /// A pipeline operation was called in the wrong state.
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// Current pipeline state
        state: String,
    },

    /// The run was cancelled between iterations.
    #[error("Cancelled after {completed} slices")]
    Cancelled {
        /// Slices fully written before cancellation was observed
        completed: usize,
    },
}

impl CoherenceError {
    /// Create an InvalidParameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create an InvalidInput error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an InputUnavailable error.
    pub fn input_unavailable(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::InputUnavailable {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a StorageUnavailable error.
    pub fn storage_unavailable(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a KernelFailure error.
    pub fn kernel_failure(variable: usize, message: impl Into<String>) -> Self {
        Self::KernelFailure {
            variable,
            message: message.into(),
        }
    }

    /// True for writer contract violations, which indicate an orchestration bug.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::OutOfOrderWrite { .. }
                | Self::PrematureFinalize { .. }
                | Self::ShapeMismatch { .. }
                | Self::WriterClosed { .. }
        )
    }
}
