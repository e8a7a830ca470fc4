//! Datasets stored as a single SafeTensors file.
//!
//! Graph `i` is stored under the keys `graph.{i}.x`, `graph.{i}.e`,
//! `graph.{i}.y` and either `graph.{i}.a` (dense) or the sparse quadruple
//! `graph.{i}.a.rows`, `graph.{i}.a.cols`, `graph.{i}.a.values`,
//! `graph.{i}.a.n_nodes`. The dataset name and graph count are kept as JSON
//! in the file metadata.

use super::safetensors_io::{read_tensors, write_tensors, SafeTensorsError, StoredTensor};
use crate::data::{Adjacency, CooAdjacency, Dataset, DatasetError, Graph, GraphSource};
use ndarray::{arr1, ArrayD, Ix2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const METADATA_KEY: &str = "rustygnn.dataset";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DatasetHeader {
    name: String,
    n_graphs: usize,
}

fn key(i: usize, field: &str) -> String {
    format!("graph.{i}.{field}")
}

fn as_i64(values: &[usize]) -> StoredTensor {
    StoredTensor::I64(arr1(&values.iter().map(|&v| v as i64).collect::<Vec<_>>()).into_dyn())
}

pub fn save_dataset<P: AsRef<Path>>(dataset: &Dataset, path: P) -> Result<(), SafeTensorsError> {
    let mut entries = Vec::new();
    for (i, graph) in dataset.iter().enumerate() {
        if let Some(x) = &graph.x {
            entries.push((key(i, "x"), StoredTensor::F32(x.clone().into_dyn())));
        }
        match &graph.a {
            Some(Adjacency::Dense(m)) => entries.push((key(i, "a"), StoredTensor::F32(m.clone().into_dyn()))),
            Some(Adjacency::Sparse(coo)) => {
                entries.push((key(i, "a.rows"), as_i64(coo.rows())));
                entries.push((key(i, "a.cols"), as_i64(coo.cols())));
                entries.push((key(i, "a.values"), StoredTensor::F32(arr1(coo.values()).into_dyn())));
                entries.push((key(i, "a.n_nodes"), as_i64(&[coo.n_nodes()])));
            }
            None => {}
        }
        if let Some(e) = &graph.e {
            entries.push((key(i, "e"), StoredTensor::F32(e.clone().into_dyn())));
        }
        if let Some(y) = &graph.y {
            entries.push((key(i, "y"), StoredTensor::F32(y.clone())));
        }
    }

    let header = DatasetHeader { name: dataset.name().to_string(), n_graphs: dataset.len() };
    let json = serde_json::to_string(&header).map_err(|e| SafeTensorsError::Metadata(e.to_string()))?;
    debug!(dataset = %header.name, n_tensors = entries.len(), "saving dataset");
    write_tensors(path, &entries, Some(HashMap::from([(METADATA_KEY.to_string(), json)])))
}

struct Fields {
    tensors: HashMap<String, StoredTensor>,
}

impl Fields {
    fn f32(&mut self, name: &str) -> Result<Option<ArrayD<f32>>, SafeTensorsError> {
        match self.tensors.remove(name) {
            None => Ok(None),
            Some(StoredTensor::F32(a)) => Ok(Some(a)),
            Some(StoredTensor::I64(_)) => {
                Err(SafeTensorsError::UnsupportedDtype { name: name.to_string(), dtype: "I64".to_string() })
            }
        }
    }

    fn matrix(&mut self, name: &str) -> Result<Option<ndarray::Array2<f32>>, SafeTensorsError> {
        self.f32(name)?
            .map(|a| {
                let shape = a.shape().to_vec();
                let len = a.len();
                a.into_dimensionality::<Ix2>()
                    .map_err(|_| SafeTensorsError::ShapeMismatch { name: name.to_string(), shape, len })
            })
            .transpose()
    }

    fn indices(&mut self, name: &str) -> Result<Vec<usize>, SafeTensorsError> {
        match self.tensors.remove(name) {
            Some(StoredTensor::I64(a)) => a
                .iter()
                .map(|&v| {
                    usize::try_from(v).map_err(|_| SafeTensorsError::Metadata(format!("{name}: negative index {v}")))
                })
                .collect(),
            Some(StoredTensor::F32(_)) => {
                Err(SafeTensorsError::UnsupportedDtype { name: name.to_string(), dtype: "F32".to_string() })
            }
            None => Err(SafeTensorsError::TensorNotFound(name.to_string())),
        }
    }

    fn adjacency(&mut self, i: usize) -> Result<Option<Adjacency>, SafeTensorsError> {
        let invalid = |e: crate::data::GraphError| SafeTensorsError::Metadata(format!("graph {i}: {e}"));
        if let Some(dense) = self.matrix(&key(i, "a"))? {
            return Adjacency::dense(dense).map(Some).map_err(invalid);
        }
        if !self.tensors.contains_key(&key(i, "a.rows")) {
            return Ok(None);
        }
        let rows = self.indices(&key(i, "a.rows"))?;
        let cols = self.indices(&key(i, "a.cols"))?;
        let values = self
            .f32(&key(i, "a.values"))?
            .ok_or_else(|| SafeTensorsError::TensorNotFound(key(i, "a.values")))?;
        let n_nodes = self.indices(&key(i, "a.n_nodes"))?.first().copied().unwrap_or(0);
        CooAdjacency::new(n_nodes, rows, cols, values.iter().copied().collect())
            .map(|coo| Some(Adjacency::Sparse(coo)))
            .map_err(invalid)
    }
}

pub fn load_dataset<P: AsRef<Path>>(path: P) -> Result<Dataset, SafeTensorsError> {
    let (tensors, metadata) = read_tensors(path)?;
    let json = metadata
        .get(METADATA_KEY)
        .ok_or_else(|| SafeTensorsError::Metadata(format!("missing '{METADATA_KEY}' entry")))?;
    let header: DatasetHeader = serde_json::from_str(json).map_err(|e| SafeTensorsError::Metadata(e.to_string()))?;

    let mut fields = Fields { tensors };
    let mut graphs = Vec::with_capacity(header.n_graphs);
    for i in 0..header.n_graphs {
        let x = fields.matrix(&key(i, "x"))?;
        let a = fields.adjacency(i)?;
        let e = fields.matrix(&key(i, "e"))?;
        let y = fields.f32(&key(i, "y"))?;
        let graph = Graph::new(x, a, e, y).map_err(|e| SafeTensorsError::Metadata(format!("graph {i}: {e}")))?;
        graphs.push(graph);
    }
    Dataset::from_graphs(header.name, graphs).map_err(|e| SafeTensorsError::Metadata(e.to_string()))
}

/// A dataset previously written with [`save_dataset`].
#[derive(Debug, Clone)]
pub struct SafetensorsSource {
    name: String,
    path: PathBuf,
}

impl SafetensorsSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), path: path.into() }
    }
}

impl GraphSource for SafetensorsSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn download(&self) -> Result<(), DatasetError> {
        Err(DatasetError::Download {
            name: self.name.clone(),
            reason: format!("{} does not exist", self.path.display()),
        })
    }

    fn read(&self) -> Result<Vec<Graph>, DatasetError> {
        load_dataset(&self.path)
            .map(Dataset::into_graphs)
            .map_err(|e| DatasetError::Read { name: self.name.clone(), reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array2};

    fn dataset() -> Dataset {
        let sparse = Graph::new(
            Some(Array2::ones((3, 2))),
            Some(Adjacency::Sparse(CooAdjacency::from_edges(&[(0, 1), (1, 2)], 3).unwrap())),
            Some(arr2(&[[0.5f32], [1.5]])),
            Some(arr1(&[1.0f32]).into_dyn()),
        )
        .unwrap();
        let dense = Graph::new(
            Some(arr2(&[[1.0f32, 2.0], [3.0, 4.0]])),
            Some(Adjacency::dense(arr2(&[[0.0f32, 1.0], [1.0, 0.0]])).unwrap()),
            None,
            None,
        )
        .unwrap();
        Dataset::from_graphs("Saved", vec![sparse, dense, Graph::default()]).unwrap()
    }

    #[test]
    fn test_dataset_file_keeps_layout_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.safetensors");
        let original = dataset();
        save_dataset(&original, &path).unwrap();

        let loaded = load_dataset(&path).unwrap();
        assert_eq!(loaded, original);
        assert!(loaded[0].a.as_ref().unwrap().is_sparse());
        assert!(loaded[2].x.is_none());
    }

    #[test]
    fn test_source_reads_saved_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.safetensors");
        save_dataset(&dataset(), &path).unwrap();

        let loaded = Dataset::load(&SafetensorsSource::new("Saved", &path), &[]).unwrap();
        assert_eq!(loaded.len(), 3);

        let missing = SafetensorsSource::new("Missing", dir.path().join("none.safetensors"));
        assert!(matches!(Dataset::load(&missing, &[]), Err(DatasetError::Download { .. })));
    }

    #[test]
    fn test_negative_edge_index_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.safetensors");
        save_dataset(&dataset(), &path).unwrap();

        let (mut tensors, metadata) = read_tensors(&path).unwrap();
        tensors.insert(key(0, "a.rows"), StoredTensor::I64(arr1(&[-1i64, 1]).into_dyn()));
        let entries: Vec<(String, StoredTensor)> = tensors.into_iter().collect();
        write_tensors(&path, &entries, Some(metadata)).unwrap();

        let err = load_dataset(&path).unwrap_err();
        assert!(matches!(&err, SafeTensorsError::Metadata(m) if m.contains("negative index -1")), "{err}");
    }
}
