//! `Dataset`: an ordered collection of graphs.
//!
//! A dataset is filled from a [`GraphSource`], which knows where its data
//! lives (`path`), how to fetch it (`download`, called only when `path` does
//! not exist) and how to turn it into graphs (`read`). After reading, the
//! optional transforms are applied in order.
//!
//! Datasets behave like a one-dimensional sequence: graphs are reached with
//! an index, a range (`slice`) or a list of indices (`select`), the last two
//! producing a new `Dataset`.

use super::graph::{Adjacency, Graph, GraphError};
use super::transforms::GraphTransform;
use crate::asg::DType;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;
use std::ops::{Bound, Index, RangeBounds};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable overriding the dataset folder.
pub const DATASET_FOLDER_ENV: &str = "RUSTYGNN_DATASET_FOLDER";

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Datasets cannot be empty")]
    Empty,
    #[error("index {index} out of range for a dataset of {len} graphs")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("cannot assign {graphs} graphs to {indices} locations")]
    LengthMismatch { indices: usize, graphs: usize },
    #[error("failed to download dataset '{name}': {reason}")]
    Download { name: String, reason: String },
    #[error("failed to read dataset '{name}': {reason}")]
    Read { name: String, reason: String },
    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Root folder for datasets: `$RUSTYGNN_DATASET_FOLDER`, else
/// `$HOME/.rustygnn/datasets`.
pub fn dataset_folder() -> PathBuf {
    if let Some(folder) = std::env::var_os(DATASET_FOLDER_ENV) {
        return PathBuf::from(folder);
    }
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".rustygnn").join("datasets")
}

/// Where graphs come from.
pub trait GraphSource {
    /// Name of the dataset, used for `Display` and the default path.
    fn name(&self) -> String;

    fn path(&self) -> PathBuf {
        dataset_folder().join(self.name())
    }

    /// Makes the data available at `path`. Called by `Dataset::load` only
    /// when `path` does not exist.
    fn download(&self) -> Result<(), DatasetError> {
        Ok(())
    }

    fn read(&self) -> Result<Vec<Graph>, DatasetError>;
}

/// Storage layout of one graph matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Dense,
    Sparse,
}

/// Layout, shape and dtype of one matrix; `None` marks a size that varies
/// between graphs.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSignature {
    pub layout: Layout,
    pub shape: Vec<Option<usize>>,
    pub dtype: DType,
}

/// Description of the matrices every graph of a dataset carries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Signature {
    pub x: Option<FieldSignature>,
    pub a: Option<FieldSignature>,
    pub e: Option<FieldSignature>,
    pub y: Option<FieldSignature>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    name: String,
    graphs: Vec<Graph>,
}

impl Dataset {
    /// Downloads if needed, reads, checks for emptiness, then applies
    /// `transforms` in order.
    pub fn load<S: GraphSource + ?Sized>(
        source: &S,
        transforms: &[&dyn GraphTransform],
    ) -> Result<Self, DatasetError> {
        let name = source.name();
        let path = source.path();
        if !path.exists() {
            debug!(dataset = %name, path = %path.display(), "dataset path missing, downloading");
            source.download()?;
        }

        let graphs = source.read()?;
        if graphs.is_empty() {
            return Err(DatasetError::Empty);
        }

        let mut dataset = Self { name, graphs };
        for transform in transforms {
            dataset.apply(*transform);
        }
        info!(dataset = %dataset.name, n_graphs = dataset.len(), "loaded dataset");
        Ok(dataset)
    }

    /// Dataset over graphs already in memory.
    pub fn from_graphs(name: impl Into<String>, graphs: Vec<Graph>) -> Result<Self, DatasetError> {
        if graphs.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self { name: name.into(), graphs })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graphs(&self) -> &[Graph] {
        &self.graphs
    }

    pub fn into_graphs(self) -> Vec<Graph> {
        self.graphs
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Graph> {
        self.graphs.iter()
    }

    // --- Indexing ---

    pub fn get(&self, index: usize) -> Option<&Graph> {
        self.graphs.get(index)
    }

    /// Negative indices count from the end.
    pub fn get_signed(&self, index: isize) -> Option<&Graph> {
        let resolved = if index < 0 { self.len() as isize + index } else { index };
        usize::try_from(resolved).ok().and_then(|i| self.graphs.get(i))
    }

    /// Sub-dataset over `range`; bounds past the end are clamped.
    pub fn slice<R: RangeBounds<usize>>(&self, range: R) -> Dataset {
        let (start, end) = self.clamp_range(range);
        self.derived(self.graphs[start..end].to_vec())
    }

    /// Sub-dataset with the graphs at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Dataset, DatasetError> {
        let graphs = indices
            .iter()
            .map(|&i| self.graphs.get(i).cloned().ok_or(DatasetError::IndexOutOfRange { index: i, len: self.len() }))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.derived(graphs))
    }

    // --- Mutation ---

    pub fn set(&mut self, index: usize, graph: Graph) -> Result<(), DatasetError> {
        let len = self.len();
        let slot = self.graphs.get_mut(index).ok_or(DatasetError::IndexOutOfRange { index, len })?;
        *slot = graph;
        Ok(())
    }

    /// Replaces the graphs in `range` with `graphs`; the length may change.
    pub fn set_range<R: RangeBounds<usize>>(&mut self, range: R, graphs: Vec<Graph>) {
        let (start, end) = self.clamp_range(range);
        self.graphs.splice(start..end, graphs);
    }

    /// Assigns `graphs[i]` to position `indices[i]`.
    pub fn set_many(&mut self, indices: &[usize], graphs: Vec<Graph>) -> Result<(), DatasetError> {
        if indices.len() != graphs.len() {
            return Err(DatasetError::LengthMismatch { indices: indices.len(), graphs: graphs.len() });
        }
        let len = self.len();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(DatasetError::IndexOutOfRange { index, len });
        }
        for (&i, graph) in indices.iter().zip(graphs) {
            self.graphs[i] = graph;
        }
        Ok(())
    }

    pub fn push(&mut self, graph: Graph) {
        self.graphs.push(graph);
    }

    /// Replaces every graph with `transform(graph)`.
    pub fn apply<T: GraphTransform + ?Sized>(&mut self, transform: &T) {
        let graphs = std::mem::take(&mut self.graphs);
        self.graphs = graphs.into_iter().map(|g| transform.transform(g)).collect();
        let empty = self.graphs.iter().filter(|g| g.n_nodes() == Some(0)).count();
        if empty > 0 {
            warn!(dataset = %self.name, empty, "transform produced graphs without nodes");
        }
    }

    /// Keeps the graphs for which `predicate` holds.
    pub fn filter<P: FnMut(&Graph) -> bool>(&mut self, mut predicate: P) {
        self.graphs.retain(|g| predicate(g));
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.graphs.shuffle(rng);
    }

    // --- Queries ---

    pub fn map<T, F: FnMut(&Graph) -> T>(&self, f: F) -> Vec<T> {
        self.graphs.iter().map(f).collect()
    }

    pub fn map_reduce<T, R, F, G>(&self, f: F, reduce: G) -> R
    where
        F: FnMut(&Graph) -> T,
        G: FnOnce(Vec<T>) -> R,
    {
        reduce(self.map(f))
    }

    pub fn n_graphs(&self) -> usize {
        self.len()
    }

    /// Node count, defined only for a single graph.
    pub fn n_nodes(&self) -> Option<usize> {
        match self.graphs.as_slice() {
            [graph] => graph.n_nodes(),
            _ => None,
        }
    }

    pub fn n_node_features(&self) -> Option<usize> {
        self.graphs.first().and_then(Graph::n_node_features)
    }

    pub fn n_edge_features(&self) -> Option<usize> {
        self.graphs.first().and_then(Graph::n_edge_features)
    }

    pub fn n_labels(&self) -> Option<usize> {
        self.graphs.first().and_then(Graph::n_labels)
    }

    /// Signature of the matrices of the first graph.
    pub fn signature(&self) -> Result<Signature, DatasetError> {
        let graph = self.graphs.first().ok_or(DatasetError::Empty)?;
        let dense = |shape: Vec<Option<usize>>| FieldSignature { layout: Layout::Dense, shape, dtype: DType::F32 };

        Ok(Signature {
            x: graph.x.as_ref().map(|_| dense(vec![None, self.n_node_features()])),
            a: graph.a.as_ref().map(|a| FieldSignature {
                layout: match a {
                    Adjacency::Dense(_) => Layout::Dense,
                    Adjacency::Sparse(_) => Layout::Sparse,
                },
                shape: vec![None, None],
                dtype: DType::F32,
            }),
            e: graph.e.as_ref().map(|_| dense(vec![None, self.n_edge_features()])),
            y: graph.y.as_ref().map(|_| dense(vec![self.n_labels()])),
        })
    }

    fn derived(&self, graphs: Vec<Graph>) -> Dataset {
        Dataset { name: self.name.clone(), graphs }
    }

    fn clamp_range<R: RangeBounds<usize>>(&self, range: R) -> (usize, usize) {
        let len = self.len();
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(&e) => e.saturating_add(1),
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        }
        .min(len);
        (start, end.max(start))
    }
}

impl Index<usize> for Dataset {
    type Output = Graph;

    fn index(&self, index: usize) -> &Graph {
        &self.graphs[index]
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Graph;
    type IntoIter = std::slice::Iter<'a, Graph>;

    fn into_iter(self) -> Self::IntoIter {
        self.graphs.iter()
    }
}

impl IntoIterator for Dataset {
    type Item = Graph;
    type IntoIter = std::vec::IntoIter<Graph>;

    fn into_iter(self) -> Self::IntoIter {
        self.graphs.into_iter()
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(n_graphs={})", self.name, self.n_graphs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn graph(n: usize) -> Graph {
        Graph { x: Some(Array2::from_elem((n, 2), n as f32)), ..Graph::default() }
    }

    fn dataset(sizes: &[usize]) -> Dataset {
        Dataset::from_graphs("Toy", sizes.iter().map(|&n| graph(n)).collect()).unwrap()
    }

    fn sizes(ds: &Dataset) -> Vec<usize> {
        ds.map(|g| g.n_nodes().unwrap_or(0))
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(matches!(Dataset::from_graphs("Toy", vec![]), Err(DatasetError::Empty)));
    }

    #[test]
    fn test_signed_indexing() {
        let ds = dataset(&[1, 2, 3]);
        assert_eq!(ds.get_signed(-1).and_then(Graph::n_nodes), Some(3));
        assert_eq!(ds.get_signed(-3).and_then(Graph::n_nodes), Some(1));
        assert!(ds.get_signed(-4).is_none());
        assert_eq!(ds[1].n_nodes(), Some(2));
    }

    #[test]
    fn test_slice_clamps() {
        let ds = dataset(&[1, 2, 3, 4]);
        assert_eq!(sizes(&ds.slice(1..3)), vec![2, 3]);
        assert_eq!(sizes(&ds.slice(2..100)), vec![3, 4]);
        assert!(ds.slice(10..).is_empty());
        assert_eq!(ds.slice(..).name(), "Toy");
    }

    #[test]
    fn test_set_range_splices() {
        let mut ds = dataset(&[1, 2, 3, 4]);
        ds.set_range(1..3, vec![graph(9)]);
        assert_eq!(sizes(&ds), vec![1, 9, 4]);
        ds.set_range(3.., vec![graph(7), graph(8)]);
        assert_eq!(sizes(&ds), vec![1, 9, 4, 7, 8]);
    }

    #[test]
    fn test_set_many() {
        let mut ds = dataset(&[1, 2, 3]);
        ds.set_many(&[2, 0], vec![graph(5), graph(6)]).unwrap();
        assert_eq!(sizes(&ds), vec![6, 2, 5]);
        assert!(matches!(
            ds.set_many(&[0], vec![]),
            Err(DatasetError::LengthMismatch { indices: 1, graphs: 0 })
        ));
        assert!(matches!(ds.set(3, graph(1)), Err(DatasetError::IndexOutOfRange { index: 3, len: 3 })));
    }

    #[test]
    fn test_properties_and_display() {
        let ds = dataset(&[4, 5]);
        assert_eq!(ds.n_nodes(), None);
        assert_eq!(ds.slice(..1).n_nodes(), Some(4));
        assert_eq!(ds.n_node_features(), Some(2));
        assert_eq!(ds.n_labels(), None);
        assert_eq!(ds.to_string(), "Toy(n_graphs=2)");

        let signature = ds.signature().unwrap();
        assert_eq!(signature.x.map(|s| s.shape), Some(vec![None, Some(2)]));
        assert!(signature.a.is_none());
        assert!(matches!(ds.slice(5..).signature(), Err(DatasetError::Empty)));
    }

    #[test]
    fn test_map_reduce() {
        let ds = dataset(&[2, 4, 6]);
        let mean = ds.map_reduce(|g| g.n_nodes().unwrap_or(0) as f32, |v| v.iter().sum::<f32>() / v.len() as f32);
        assert_eq!(mean, 4.0);
    }

    #[test]
    fn test_shuffle_permutes_in_place() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let original: Vec<usize> = (1..=10).collect();
        let mut ds = dataset(&original);
        ds.shuffle(&mut StdRng::seed_from_u64(11));
        let shuffled = sizes(&ds);
        assert_ne!(shuffled, original);

        let mut sorted = shuffled.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, original);

        let mut again = dataset(&original);
        again.shuffle(&mut StdRng::seed_from_u64(11));
        assert_eq!(sizes(&again), shuffled);
    }
}
