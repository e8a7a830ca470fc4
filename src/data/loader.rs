//! Batching of graphs into dense, zero-padded tensors.
//!
//! Graphs are padded to the largest node count of the whole dataset, so
//! every batch has the same static shape and a single graph build serves
//! the whole training run.

use super::dataset::Dataset;
use super::graph::Graph;
use ndarray::{s, Array3, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::warn;

/// One batch in batch mode.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    /// Node features `[B, N, F]`.
    pub x: Array3<f32>,
    /// Dense adjacency `[B, N, N]`.
    pub a: Array3<f32>,
    /// Labels stacked on a new leading axis, when every graph has labels of
    /// the same shape.
    pub y: Option<ArrayD<f32>>,
    /// Real node count of each graph before padding.
    pub n_nodes: Vec<usize>,
    /// Dataset positions of the graphs in this batch.
    pub indices: Vec<usize>,
}

impl GraphBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

pub struct BatchLoader<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: Option<u64>,
    n_max: usize,
    n_features: usize,
}

impl<'a> BatchLoader<'a> {
    pub fn new(dataset: &'a Dataset, batch_size: usize) -> Self {
        let n_max = dataset.map(|g| g.n_nodes().unwrap_or(0)).into_iter().max().unwrap_or(0);
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: false,
            drop_last: false,
            seed: None,
            n_max,
            n_features: dataset.n_node_features().unwrap_or(0),
        }
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Drops the last incomplete batch, keeping every batch the same size.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Pads to at least `n_nodes` nodes.
    pub fn pad_to(mut self, n_nodes: usize) -> Self {
        self.n_max = self.n_max.max(n_nodes);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Padded node count of every batch.
    pub fn n_max(&self) -> usize {
        self.n_max
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            (n + self.batch_size - 1) / self.batch_size
        }
    }

    pub fn iter(&self) -> BatchIter<'_> {
        self.iter_epoch(0)
    }

    /// Iterator for one epoch; with a seed, each epoch gets its own order.
    pub fn iter_epoch(&self, epoch: u64) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            match self.seed {
                Some(seed) => order.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch))),
                None => order.shuffle(&mut rand::thread_rng()),
            }
        }
        BatchIter { loader: self, order, position: 0 }
    }

    fn collate(&self, indices: Vec<usize>) -> GraphBatch {
        let (b, n, f) = (indices.len(), self.n_max, self.n_features);
        let mut x = Array3::zeros((b, n, f));
        let mut a = Array3::zeros((b, n, n));
        let mut n_nodes = Vec::with_capacity(b);

        let graphs: Vec<&Graph> = indices.iter().filter_map(|&i| self.dataset.get(i)).collect();
        for (i, graph) in graphs.iter().enumerate() {
            if let Some(gx) = &graph.x {
                if gx.ncols() != f {
                    warn!(
                        graph = indices[i],
                        features = gx.ncols(),
                        expected = f,
                        "node feature width differs from the first graph, padding or truncating"
                    );
                }
                let (rows, cols) = (gx.nrows().min(n), gx.ncols().min(f));
                x.slice_mut(s![i, ..rows, ..cols]).assign(&gx.slice(s![..rows, ..cols]));
            }
            if let Some(ga) = &graph.a {
                let dense = ga.to_dense();
                let m = dense.nrows().min(n);
                a.slice_mut(s![i, ..m, ..m]).assign(&dense.slice(s![..m, ..m]));
            }
            n_nodes.push(graph.n_nodes().unwrap_or(0));
        }

        GraphBatch { x, a, y: stack_labels(&graphs), n_nodes, indices }
    }
}

fn stack_labels(graphs: &[&Graph]) -> Option<ArrayD<f32>> {
    let first = graphs.first()?.y.as_ref()?;
    let labels: Vec<_> = graphs.iter().map(|g| g.y.as_ref().map(|y| y.view())).collect::<Option<_>>()?;
    if labels.iter().any(|y| y.shape() != first.shape()) {
        return None;
    }
    ndarray::stack(Axis(0), &labels).ok()
}

pub struct BatchIter<'a> {
    loader: &'a BatchLoader<'a>,
    order: Vec<usize>,
    position: usize,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = GraphBatch;

    fn next(&mut self) -> Option<GraphBatch> {
        let remaining = self.order.len().saturating_sub(self.position);
        if remaining == 0 || (self.loader.drop_last && remaining < self.loader.batch_size) {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let indices = self.order[self.position..end].to_vec();
        self.position = end;
        Some(self.loader.collate(indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::graph::{Adjacency, CooAdjacency};
    use ndarray::{arr1, Array2};

    fn graph(n: usize, label: f32) -> Graph {
        let edges: Vec<(usize, usize)> = (1..n).flat_map(|i| [(i - 1, i), (i, i - 1)]).collect();
        Graph {
            x: Some(Array2::ones((n, 2))),
            a: Some(Adjacency::Sparse(CooAdjacency::from_edges(&edges, n).unwrap())),
            e: None,
            y: Some(arr1(&[label, 1.0 - label]).into_dyn()),
        }
    }

    fn dataset() -> Dataset {
        Dataset::from_graphs("Paths", vec![graph(2, 0.0), graph(4, 1.0), graph(3, 0.0)]).unwrap()
    }

    #[test]
    fn test_batches_are_padded_to_dataset_max() {
        let ds = dataset();
        let loader = BatchLoader::new(&ds, 2);
        let batches: Vec<GraphBatch> = loader.iter().collect();
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].x.shape(), &[2, 4, 2]);
        assert_eq!(batches[0].a.shape(), &[2, 4, 4]);
        assert_eq!(batches[1].x.shape(), &[1, 4, 2]);
        assert_eq!(batches[0].n_nodes, vec![2, 4]);

        // Padding rows stay zero.
        assert_eq!(batches[0].x[[0, 2, 0]], 0.0);
        assert_eq!(batches[0].a[[0, 0, 1]], 1.0);
        assert_eq!(batches[0].y.as_ref().map(|y| y.shape().to_vec()), Some(vec![2, 2]));
    }

    #[test]
    fn test_drop_last_and_seeded_shuffle() {
        let ds = dataset();
        let loader = BatchLoader::new(&ds, 2).drop_last(true).shuffle(true).seed(3);
        assert_eq!(loader.num_batches(), 1);
        let first: Vec<Vec<usize>> = loader.iter().map(|b| b.indices).collect();
        let again: Vec<Vec<usize>> = loader.iter().map(|b| b.indices).collect();
        assert_eq!(first.len(), 1);
        assert_eq!(first, again);
    }

    #[test]
    fn test_mixed_label_shapes_are_not_stacked() {
        let mut graphs = vec![graph(2, 0.0), graph(2, 1.0)];
        graphs[1].y = Some(arr1(&[1.0f32]).into_dyn());
        let ds = Dataset::from_graphs("Odd", graphs).unwrap();
        let batch = BatchLoader::new(&ds, 2).pad_to(5).iter().next().unwrap();
        assert!(batch.y.is_none());
        assert_eq!(batch.a.shape(), &[2, 5, 5]);
    }

    #[test]
    fn test_feature_width_follows_first_graph() {
        let mut wide = graph(2, 1.0);
        wide.x = Some(Array2::from_elem((2, 3), 2.0));
        let ds = Dataset::from_graphs("Widths", vec![graph(2, 0.0), wide]).unwrap();
        let loader = BatchLoader::new(&ds, 2);
        assert_eq!(loader.n_features(), 2);

        let batch = loader.iter().next().unwrap();
        assert_eq!(batch.x.shape(), &[2, 2, 2]);
        assert_eq!(batch.x[[1, 1, 1]], 2.0);
    }
}
