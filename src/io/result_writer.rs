//! Sequential Zarr writing of coherence results.
//!
//! The result tensor `(freq, node, node, variable, mode)` is chunked as
//! `(freq, node, node, 1, mode)`, so one variable slice maps to exactly one
//! chunk. `write_slice` therefore performs one bounded-size store per call and
//! never holds more than a single slice in memory.
//!
//! Writers accept slices strictly in order `0, 1, ..., v-1`. The frequency
//! vector and scalar metadata follow once every slice is in, then `close`
//! seals the container.

use super::store::{create_store, prepare_destination, PreparedDestination};
use crate::error::{CoherenceError, Result};
use crate::estimate::freq_bins;
use ndarray::{Array1, Array5};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;
use zarrs::array::codec::bytes_to_bytes::zstd::ZstdCodec;
use zarrs::array::{Array, ArrayBuilder};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};

/// Path of the coherence tensor inside a result container.
pub const RESULT_DATA_PATH: &str = "/array_data";

/// Path of the frequency vector inside a result container.
pub const RESULT_FREQUENCY_PATH: &str = "/frequency";

/// Group attribute marking a fully written container.
pub const SEALED_ATTRIBUTE: &str = "sealed";

/// Dimensions of a result container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLayout {
    pub freq_bins: usize,
    pub nodes: usize,
    pub variables: usize,
    pub modes: usize,
}

impl ResultLayout {
    /// Layout of the result for an input shape `(t, v, n, m)` and transform size.
    pub fn new(input_shape: [usize; 4], nfft: usize) -> Self {
        Self {
            freq_bins: freq_bins(nfft),
            nodes: input_shape[2],
            variables: input_shape[1],
            modes: input_shape[3],
        }
    }

    /// `(freq, n, n, v, m)`
    pub fn tensor_shape(&self) -> [usize; 5] {
        [self.freq_bins, self.nodes, self.nodes, self.variables, self.modes]
    }

    /// `(freq, n, n, 1, m)`: the shape of one partial result.
    pub fn slice_shape(&self) -> [usize; 5] {
        [self.freq_bins, self.nodes, self.nodes, 1, self.modes]
    }

    /// Bytes of one slice at 8 bytes per element.
    pub fn slice_bytes(&self) -> u64 {
        self.slice_shape().iter().map(|&d| d as u64).product::<u64>() * 8
    }
}

/// Finalized scalar metadata of a result container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarMetadata {
    /// Unique identifier of this result
    pub gid: Uuid,

    /// Identifier of the series the result was computed from
    pub source_gid: String,

    /// Sampling period of the source series
    pub sample_period: f64,

    /// Unit of `sample_period`
    pub sample_period_unit: String,

    /// Transform size (data points per block)
    pub nfft: usize,

    /// Number of frequency bins
    pub frequency_bins: usize,
}

/// Sink for sequentially written coherence results.
pub trait ResultSink {
    /// Write the partial result for variable `index`.
    fn write_slice(&mut self, index: usize, tensor: &Array5<f64>) -> Result<()>;

    /// Write the frequency vector. Valid only after every slice.
    fn write_frequency_vector(&mut self, frequency: &Array1<f64>) -> Result<()>;

    /// Write the scalar metadata. Valid only after every slice.
    fn write_scalar_metadata(&mut self, metadata: &ScalarMetadata) -> Result<()>;

    /// Flush and seal. Idempotent once closed.
    fn close(&mut self) -> Result<()>;

    /// Delete the container. Idempotent.
    fn discard(&mut self) -> Result<()>;
}

impl<S: ResultSink + ?Sized> ResultSink for &mut S {
    fn write_slice(&mut self, index: usize, tensor: &Array5<f64>) -> Result<()> {
        (**self).write_slice(index, tensor)
    }

    fn write_frequency_vector(&mut self, frequency: &Array1<f64>) -> Result<()> {
        (**self).write_frequency_vector(frequency)
    }

    fn write_scalar_metadata(&mut self, metadata: &ScalarMetadata) -> Result<()> {
        (**self).write_scalar_metadata(metadata)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn discard(&mut self) -> Result<()> {
        (**self).discard()
    }
}

/// Lifecycle of a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    Closed,
    Discarded,
}

/// Bookkeeping for the sequential-write contract, independent of storage.
#[derive(Debug, Clone)]
pub struct WriteCursor {
    path: PathBuf,
    expected: usize,
    next_index: usize,
    frequency_written: bool,
    metadata_written: bool,
    state: WriterState,
}

impl WriteCursor {
    pub fn new(path: impl Into<PathBuf>, expected: usize) -> Self {
        Self {
            path: path.into(),
            expected,
            next_index: 0,
            frequency_written: false,
            metadata_written: false,
            state: WriterState::Open,
        }
    }

    /// Slices accepted so far.
    pub fn written(&self) -> usize {
        self.next_index
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            _ => Err(CoherenceError::WriterClosed {
                path: self.path.clone(),
            }),
        }
    }

    /// Check `index` is the next slice to write.
    pub fn check_slice(&self, index: usize) -> Result<()> {
        self.ensure_open()?;
        if index != self.next_index || index >= self.expected {
            return Err(CoherenceError::OutOfOrderWrite {
                expected: self.next_index,
                actual: index,
            });
        }
        Ok(())
    }

    /// Record a successful slice write.
    pub fn advance(&mut self) {
        self.next_index += 1;
    }

    fn check_finalize(&self, field: &'static str, already: bool) -> Result<()> {
        self.ensure_open()?;
        if already || self.next_index < self.expected {
            return Err(CoherenceError::PrematureFinalize {
                field,
                written: self.next_index,
                expected: self.expected,
            });
        }
        Ok(())
    }

    pub fn check_frequency(&self) -> Result<()> {
        self.check_finalize("frequency", self.frequency_written)
    }

    pub fn mark_frequency(&mut self) {
        self.frequency_written = true;
    }

    pub fn check_metadata(&self) -> Result<()> {
        self.check_finalize("metadata", self.metadata_written)
    }

    pub fn mark_metadata(&mut self) {
        self.metadata_written = true;
    }

    /// Check the container can be sealed. `Ok(false)` means it already is.
    pub fn check_close(&self) -> Result<bool> {
        match self.state {
            WriterState::Closed | WriterState::Discarded => Ok(false),
            WriterState::Open => {
                if self.next_index < self.expected || !self.frequency_written || !self.metadata_written {
                    return Err(CoherenceError::PrematureFinalize {
                        field: "close",
                        written: self.next_index,
                        expected: self.expected,
                    });
                }
                Ok(true)
            }
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = WriterState::Closed;
    }

    pub fn mark_discarded(&mut self) {
        self.state = WriterState::Discarded;
    }
}

/// Writes a coherence result container on the local filesystem.
pub struct ZarrResultWriter {
    destination: PreparedDestination,
    layout: ResultLayout,
    group: Group<FilesystemStore>,
    data: Array<FilesystemStore>,
    frequency: Array<FilesystemStore>,
    cursor: WriteCursor,
    bytes_written: u64,
}

impl ZarrResultWriter {
    /// Create (or overwrite) a result container at `destination`.
    ///
    /// Fails with `StorageUnavailable` if the container cannot be created, in
    /// which case nothing is left behind, or if another writer still holds
    /// `destination`, in which case its container is left untouched.
    pub fn open(destination: impl AsRef<Path>, layout: ResultLayout, compression_level: i32) -> Result<Self> {
        let path = destination.as_ref().to_path_buf();
        if layout.tensor_shape().iter().any(|&d| d == 0) {
            return Err(CoherenceError::invalid_input(format!(
                "result layout {:?} has an empty axis",
                layout
            )));
        }

        let prepared = prepare_destination(&path)?;
        match Self::build(&path, &layout, compression_level) {
            Ok((group, data, frequency)) => {
                tracing::info!(
                    "Created result container at {} with shape {:?}",
                    path.display(),
                    layout.tensor_shape()
                );
                Ok(Self {
                    cursor: WriteCursor::new(&path, layout.variables),
                    destination: prepared,
                    layout,
                    group,
                    data,
                    frequency,
                    bytes_written: 0,
                })
            }
            Err(e) => {
                if let Err(cleanup) = prepared.remove() {
                    tracing::warn!("Failed to remove partial container at {}: {}", path.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    fn build(
        path: &Path,
        layout: &ResultLayout,
        compression_level: i32,
    ) -> Result<(Group<FilesystemStore>, Array<FilesystemStore>, Array<FilesystemStore>)> {
        let store = create_store(path)?;
        let storage_err = |e: String| CoherenceError::storage_unavailable(path, e);

        let group = GroupBuilder::new()
            .build(store.clone(), "/")
            .map_err(|e| storage_err(e.to_string()))?;
        group.store_metadata().map_err(|e| storage_err(e.to_string()))?;

        let shape = layout.tensor_shape();
        let chunk = layout.slice_shape();

        let mut builder = ArrayBuilder::new(
            shape.iter().map(|&d| d as u64).collect::<Vec<_>>(),
            chunk.iter().map(|&d| d as u64).collect::<Vec<_>>(),
            "float64",
            0.0f64,
        );
        builder.dimension_names(Some(vec![
            Some("frequency".to_string()),
            Some("node".to_string()),
            Some("node_to".to_string()),
            Some("variable".to_string()),
            Some("mode".to_string()),
        ]));
        builder.bytes_to_bytes_codecs(vec![Arc::new(ZstdCodec::new(compression_level, false))]);
        let data = builder
            .build(store.clone(), RESULT_DATA_PATH)
            .map_err(|e| storage_err(e.to_string()))?;
        data.store_metadata().map_err(|e| storage_err(e.to_string()))?;

        let mut builder = ArrayBuilder::new(
            vec![layout.freq_bins as u64],
            vec![layout.freq_bins as u64],
            "float64",
            0.0f64,
        );
        builder.dimension_names(Some(vec![Some("frequency".to_string())]));
        let frequency = builder
            .build(store, RESULT_FREQUENCY_PATH)
            .map_err(|e| storage_err(e.to_string()))?;
        frequency.store_metadata().map_err(|e| storage_err(e.to_string()))?;

        Ok((group, data, frequency))
    }

    pub fn path(&self) -> &Path {
        &self.destination.path
    }

    pub fn layout(&self) -> &ResultLayout {
        &self.layout
    }

    /// Slices written so far.
    pub fn slices_written(&self) -> usize {
        self.cursor.written()
    }

    /// Uncompressed bytes handed to the store so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn state(&self) -> WriterState {
        self.cursor.state()
    }

    fn storage_err(&self, e: impl ToString) -> CoherenceError {
        CoherenceError::storage_unavailable(&self.destination.path, e)
    }
}

impl ResultSink for ZarrResultWriter {
    fn write_slice(&mut self, index: usize, tensor: &Array5<f64>) -> Result<()> {
        self.cursor.check_slice(index)?;

        let expected = self.layout.slice_shape();
        if tensor.shape() != expected {
            return Err(CoherenceError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }

        let elements: Vec<f64> = tensor.iter().copied().collect();
        let chunk_indices = [0u64, 0, 0, index as u64, 0];

        tracing::trace!("Writing slice {} ({} elements)", index, elements.len());
        self.data
            .store_chunk_elements(&chunk_indices, elements.as_slice())
            .map_err(|e| {
                tracing::error!("Slice {} write failed: {:?}", index, e);
                self.storage_err(e)
            })?;

        self.cursor.advance();
        self.bytes_written += self.layout.slice_bytes();
        Ok(())
    }

    fn write_frequency_vector(&mut self, frequency: &Array1<f64>) -> Result<()> {
        self.cursor.check_frequency()?;
        if frequency.len() != self.layout.freq_bins {
            return Err(CoherenceError::ShapeMismatch {
                expected: vec![self.layout.freq_bins],
                actual: vec![frequency.len()],
            });
        }

        let elements: Vec<f64> = frequency.iter().copied().collect();
        self.frequency
            .store_chunk_elements(&[0], elements.as_slice())
            .map_err(|e| self.storage_err(e))?;
        self.cursor.mark_frequency();
        self.bytes_written += elements.len() as u64 * 8;
        Ok(())
    }

    fn write_scalar_metadata(&mut self, metadata: &ScalarMetadata) -> Result<()> {
        self.cursor.check_metadata()?;
        if metadata.frequency_bins != self.layout.freq_bins {
            return Err(CoherenceError::ShapeMismatch {
                expected: vec![self.layout.freq_bins],
                actual: vec![metadata.frequency_bins],
            });
        }

        let fields = match serde_json::to_value(metadata) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => return Err(self.storage_err("metadata did not serialize to an object")),
            Err(e) => return Err(self.storage_err(e)),
        };
        self.group.attributes_mut().extend(fields);
        self.group.store_metadata().map_err(|e| self.storage_err(e))?;
        self.cursor.mark_metadata();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.cursor.check_close()? {
            return Ok(());
        }
        self.group
            .attributes_mut()
            .insert(SEALED_ATTRIBUTE.to_string(), serde_json::Value::Bool(true));
        self.group.store_metadata().map_err(|e| self.storage_err(e))?;
        self.cursor.mark_closed();
        if let Err(e) = self.destination.release() {
            tracing::warn!("Sealed container but failed to release its writer marker: {}", e);
        }

        tracing::info!(
            "Sealed result container at {} ({} slices)",
            self.destination.path.display(),
            self.cursor.written()
        );
        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        if self.cursor.state() == WriterState::Discarded {
            return Ok(());
        }
        self.cursor.mark_discarded();
        tracing::warn!("Discarding result container at {}", self.destination.path.display());
        self.destination.remove()
    }
}

impl Drop for ZarrResultWriter {
    fn drop(&mut self) {
        if self.cursor.state() == WriterState::Open {
            if let Err(e) = self.discard() {
                tracing::warn!("Failed to discard unsealed container: {}", e);
            }
        }
    }
}
