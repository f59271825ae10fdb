//! Read access to sealed coherence result containers.

use super::result_writer::{ScalarMetadata, RESULT_DATA_PATH, RESULT_FREQUENCY_PATH, SEALED_ATTRIBUTE};
use super::store::open_store;
use crate::error::{CoherenceError, Result};
use ndarray::{Array1, Array5};
use std::path::{Path, PathBuf};
use zarrs::array::Array;
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::Group;

/// Reader for a result container written by `ZarrResultWriter`.
pub struct CoherenceResultReader {
    path: PathBuf,
    data: Array<FilesystemStore>,
    frequency: Array<FilesystemStore>,
    metadata: ScalarMetadata,
}

impl CoherenceResultReader {
    /// Open a sealed result container.
    ///
    /// Containers that were never sealed are rejected with `InvalidInput`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = open_store(&path)?;
        let unavailable = |e: String| CoherenceError::input_unavailable(&path, e);

        let group = Group::open(store.clone(), "/").map_err(|e| unavailable(e.to_string()))?;
        let attributes = group.attributes();

        let sealed = attributes
            .get(SEALED_ATTRIBUTE)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !sealed {
            return Err(CoherenceError::invalid_input(format!(
                "result container at {} is not sealed",
                path.display()
            )));
        }

        let metadata: ScalarMetadata =
            serde_json::from_value(serde_json::Value::Object(attributes.clone())).map_err(|e| {
                CoherenceError::invalid_input(format!("result metadata at {}: {}", path.display(), e))
            })?;

        let data = Array::open(store.clone(), RESULT_DATA_PATH).map_err(|e| unavailable(e.to_string()))?;
        let frequency =
            Array::open(store, RESULT_FREQUENCY_PATH).map_err(|e| unavailable(e.to_string()))?;

        Ok(Self {
            path,
            data,
            frequency,
            metadata,
        })
    }

    /// Shape of the coherence tensor `(freq, n, n, v, m)`.
    pub fn shape(&self) -> Vec<usize> {
        self.data.shape().iter().map(|&d| d as usize).collect()
    }

    pub fn metadata(&self) -> &ScalarMetadata {
        &self.metadata
    }

    /// The frequency vector.
    pub fn frequency(&self) -> Result<Array1<f64>> {
        let subset = ArraySubset::new_with_shape(self.frequency.shape().to_vec());
        let elements: Vec<f64> = self
            .frequency
            .retrieve_array_subset_elements::<f64>(&subset)
            .map_err(|e| CoherenceError::input_unavailable(&self.path, e))?;
        Ok(Array1::from_vec(elements))
    }

    /// Coherence for one variable, shape `(freq, n, n, 1, m)`.
    pub fn read_variable(&self, variable: usize) -> Result<Array5<f64>> {
        let shape = self.shape();
        if variable >= shape[3] {
            return Err(CoherenceError::invalid_input(format!(
                "variable {} out of range for {} variables",
                variable, shape[3]
            )));
        }

        let elements: Vec<f64> = self
            .data
            .retrieve_chunk_elements::<f64>(&[0, 0, 0, variable as u64, 0])
            .map_err(|e| CoherenceError::input_unavailable(&self.path, e))?;
        Array5::from_shape_vec((shape[0], shape[1], shape[2], 1, shape[4]), elements)
            .map_err(|e| CoherenceError::input_unavailable(&self.path, e))
    }
}
