//! Input time series access.
//!
//! A series is a 4D float64 array `(time, variable, node, mode)` plus a sample
//! period, its unit, and a stable identifier. The pipeline only ever reads it
//! one variable slice at a time through [`SeriesReader`].
//!
//! On disk a series is a Zarr v3 group holding a `data` array chunked as
//! `(t, 1, n, m)`, so each variable slice is a single chunk.

use super::store::{create_store, open_store, prepare_destination, PreparedDestination};
use crate::error::{CoherenceError, Result};
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::codec::bytes_to_bytes::zstd::ZstdCodec;
use zarrs::array::{Array, ArrayBuilder};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};

/// Path of the data array inside a series container.
pub const SERIES_DATA_PATH: &str = "/data";

/// Scalar attributes of a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesAttributes {
    /// Stable identifier of the series
    pub gid: String,

    /// Sampling period
    pub sample_period: f64,

    /// Unit of `sample_period`
    #[serde(default = "default_sample_period_unit")]
    pub sample_period_unit: String,
}

fn default_sample_period_unit() -> String {
    "ms".to_string()
}

/// Index tuple for a slice read: one half-open range per axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceIndex {
    pub ranges: [Range<usize>; 4],
}

impl SliceIndex {
    /// All time, all nodes, all modes, restricted to one variable.
    pub fn variable(shape: [usize; 4], variable: usize) -> Self {
        Self {
            ranges: [0..shape[0], variable..variable + 1, 0..shape[2], 0..shape[3]],
        }
    }

    /// Shape of the sub-array this index selects.
    pub fn shape(&self) -> [usize; 4] {
        [
            self.ranges[0].len(),
            self.ranges[1].len(),
            self.ranges[2].len(),
            self.ranges[3].len(),
        ]
    }

    /// Number of elements selected.
    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    /// Check every range lies within `shape`.
    pub fn check_bounds(&self, shape: &[usize]) -> Result<()> {
        if shape.len() != 4 {
            return Err(CoherenceError::invalid_input(format!(
                "slice index is 4D but series has {} dimensions",
                shape.len()
            )));
        }
        for (axis, (range, &len)) in self.ranges.iter().zip(shape).enumerate() {
            if range.start > range.end || range.end > len {
                return Err(CoherenceError::invalid_input(format!(
                    "slice range {:?} out of bounds for axis {} of length {}",
                    range, axis, len
                )));
            }
        }
        Ok(())
    }

    fn to_subset(&self) -> ArraySubset {
        let ranges: Vec<Range<u64>> = self
            .ranges
            .iter()
            .map(|r| r.start as u64..r.end as u64)
            .collect();
        ArraySubset::new_with_ranges(&ranges)
    }
}

/// Read-only access to an input series.
pub trait SeriesReader {
    /// Shape of the stored array. Expected to be 4D.
    fn shape(&self) -> Result<Vec<usize>>;

    /// Sampling period.
    fn sample_period(&self) -> Result<f64>;

    /// Unit of the sampling period.
    fn sample_period_unit(&self) -> Result<String>;

    /// Stable identifier used as the source reference of results.
    fn gid(&self) -> Result<String>;

    /// Read the sub-array selected by `index`.
    fn read_slice(&mut self, index: &SliceIndex) -> Result<Array4<f64>>;

    /// Release underlying handles. Further reads fail.
    fn close(&mut self) -> Result<()>;
}

/// Series reader over a Zarr container on the local filesystem.
pub struct ZarrSeriesReader {
    path: PathBuf,
    array: Option<Array<FilesystemStore>>,
    attributes: SeriesAttributes,
}

impl ZarrSeriesReader {
    /// Open the series container at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = open_store(&path)?;

        let group = Group::open(store.clone(), "/")
            .map_err(|e| CoherenceError::input_unavailable(&path, e))?;
        let array = Array::open(store, SERIES_DATA_PATH)
            .map_err(|e| CoherenceError::input_unavailable(&path, e))?;

        let attributes: SeriesAttributes =
            serde_json::from_value(serde_json::Value::Object(group.attributes().clone()))
                .map_err(|e| {
                    CoherenceError::invalid_input(format!(
                        "series attributes at {}: {}",
                        path.display(),
                        e
                    ))
                })?;

        tracing::debug!(
            "Opened series {} at {} with shape {:?}",
            attributes.gid,
            path.display(),
            array.shape()
        );

        Ok(Self {
            path,
            array: Some(array),
            attributes,
        })
    }

    fn array(&self) -> Result<&Array<FilesystemStore>> {
        self.array
            .as_ref()
            .ok_or_else(|| CoherenceError::input_unavailable(&self.path, "reader is closed"))
    }
}

impl SeriesReader for ZarrSeriesReader {
    fn shape(&self) -> Result<Vec<usize>> {
        Ok(self.array()?.shape().iter().map(|&d| d as usize).collect())
    }

    fn sample_period(&self) -> Result<f64> {
        Ok(self.attributes.sample_period)
    }

    fn sample_period_unit(&self) -> Result<String> {
        Ok(self.attributes.sample_period_unit.clone())
    }

    fn gid(&self) -> Result<String> {
        Ok(self.attributes.gid.clone())
    }

    fn read_slice(&mut self, index: &SliceIndex) -> Result<Array4<f64>> {
        let shape = self.shape()?;
        index.check_bounds(&shape)?;

        let elements: Vec<f64> = self
            .array()?
            .retrieve_array_subset_elements::<f64>(&index.to_subset())
            .map_err(|e| CoherenceError::input_unavailable(&self.path, e))?;

        let dims = index.shape();
        Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), elements)
            .map_err(|e| CoherenceError::input_unavailable(&self.path, e))
    }

    fn close(&mut self) -> Result<()> {
        if self.array.take().is_some() {
            tracing::debug!("Closed series reader for {}", self.path.display());
        }
        Ok(())
    }
}

/// Writes a series container, one variable at a time.
///
/// The destination stays held against other writers until the writer is dropped.
pub struct ZarrSeriesWriter {
    destination: PreparedDestination,
    array: Array<FilesystemStore>,
    shape: [usize; 4],
}

impl ZarrSeriesWriter {
    /// Create a series container at `path` with the given shape and attributes.
    pub fn create(
        path: impl AsRef<Path>,
        shape: [usize; 4],
        attributes: &SeriesAttributes,
        compression_level: i32,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if shape.iter().any(|&d| d == 0) {
            return Err(CoherenceError::invalid_input(format!(
                "series shape {:?} has an empty axis",
                shape
            )));
        }

        let prepared = prepare_destination(&path)?;
        let build = || -> Result<Array<FilesystemStore>> {
            let store = create_store(&path)?;

            let mut group = GroupBuilder::new()
                .build(store.clone(), "/")
                .map_err(|e| CoherenceError::storage_unavailable(&path, e))?;
            group.attributes_mut().extend(attributes_map(attributes)?);
            group.store_metadata().map_err(|e| CoherenceError::storage_unavailable(&path, e))?;

            let mut builder = ArrayBuilder::new(
                shape.iter().map(|&d| d as u64).collect::<Vec<_>>(),
                vec![shape[0] as u64, 1, shape[2] as u64, shape[3] as u64],
                "float64",
                0.0f64,
            );
            builder.dimension_names(Some(vec![
                Some("time".to_string()),
                Some("variable".to_string()),
                Some("node".to_string()),
                Some("mode".to_string()),
            ]));
            builder.bytes_to_bytes_codecs(vec![Arc::new(ZstdCodec::new(compression_level, false))]);
            builder.attributes(attributes_map(attributes)?);

            let array = builder
                .build(store, SERIES_DATA_PATH)
                .map_err(|e| CoherenceError::storage_unavailable(&path, e))?;
            array.store_metadata().map_err(|e| CoherenceError::storage_unavailable(&path, e))?;
            Ok(array)
        };

        match build() {
            Ok(array) => Ok(Self {
                destination: prepared,
                array,
                shape,
            }),
            Err(e) => {
                let _ = prepared.remove();
                Err(e)
            }
        }
    }

    /// Write the data for one variable, shape `(t, 1, n, m)`.
    pub fn write_variable(&self, variable: usize, data: ArrayView4<f64>) -> Result<()> {
        let expected = [self.shape[0], 1, self.shape[2], self.shape[3]];
        if data.shape() != expected {
            return Err(CoherenceError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: data.shape().to_vec(),
            });
        }
        if variable >= self.shape[1] {
            return Err(CoherenceError::invalid_input(format!(
                "variable {} out of range for {} variables",
                variable, self.shape[1]
            )));
        }

        let elements: Vec<f64> = data.iter().copied().collect();
        self.array
            .store_chunk_elements(&[0, variable as u64, 0, 0], elements.as_slice())
            .map_err(|e| CoherenceError::storage_unavailable(&self.destination.path, e))
    }

    /// Write a whole in-memory series.
    pub fn write_all(&self, data: ArrayView4<f64>) -> Result<()> {
        if data.shape() != self.shape {
            return Err(CoherenceError::ShapeMismatch {
                expected: self.shape.to_vec(),
                actual: data.shape().to_vec(),
            });
        }
        for variable in 0..self.shape[1] {
            let slice = data.slice(ndarray::s![.., variable..variable + 1, .., ..]);
            self.write_variable(variable, slice)?;
        }
        Ok(())
    }
}

impl Drop for ZarrSeriesWriter {
    fn drop(&mut self) {
        if let Err(e) = self.destination.release() {
            tracing::warn!("Failed to release series container: {}", e);
        }
    }
}

fn attributes_map(attributes: &SeriesAttributes) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(attributes) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(CoherenceError::invalid_input(format!(
            "series attributes serialized to non-object {}",
            other
        ))),
        Err(e) => Err(CoherenceError::invalid_input(e.to_string())),
    }
}

/// A series held fully in memory. Counts slice reads.
#[derive(Debug, Clone)]
pub struct InMemorySeries {
    data: Array4<f64>,
    attributes: SeriesAttributes,
    reads: usize,
    closed: bool,
}

impl InMemorySeries {
    pub fn new(data: Array4<f64>, attributes: SeriesAttributes) -> Self {
        Self {
            data,
            attributes,
            reads: 0,
            closed: false,
        }
    }

    /// Number of `read_slice` calls so far.
    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl SeriesReader for InMemorySeries {
    fn shape(&self) -> Result<Vec<usize>> {
        Ok(self.data.shape().to_vec())
    }

    fn sample_period(&self) -> Result<f64> {
        Ok(self.attributes.sample_period)
    }

    fn sample_period_unit(&self) -> Result<String> {
        Ok(self.attributes.sample_period_unit.clone())
    }

    fn gid(&self) -> Result<String> {
        Ok(self.attributes.gid.clone())
    }

    fn read_slice(&mut self, index: &SliceIndex) -> Result<Array4<f64>> {
        if self.closed {
            return Err(CoherenceError::input_unavailable("<memory>", "reader is closed"));
        }
        index.check_bounds(self.data.shape())?;
        self.reads += 1;
        let [t, v, n, m] = index.ranges.clone();
        Ok(self.data.slice(ndarray::s![t, v, n, m]).to_owned())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
