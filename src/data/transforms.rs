//! Graph transforms applied by `Dataset::apply` and `Dataset::load`.

use super::graph::{Adjacency, Graph};
use ndarray::{ArrayD, Axis, IxDyn};
use tracing::warn;

/// Maps a graph to a new graph.
///
/// Closures `Fn(Graph) -> Graph` are transforms too.
pub trait GraphTransform: Send + Sync {
    fn transform(&self, graph: Graph) -> Graph;
}

impl<F> GraphTransform for F
where
    F: Fn(Graph) -> Graph + Send + Sync,
{
    fn transform(&self, graph: Graph) -> Graph {
        self(graph)
    }
}

/// Several transforms applied in order.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn GraphTransform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transforms(transforms: Vec<Box<dyn GraphTransform>>) -> Self {
        Self { transforms }
    }

    pub fn add<T: GraphTransform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }
}

impl GraphTransform for Compose {
    fn transform(&self, mut graph: Graph) -> Graph {
        for t in &self.transforms {
            graph = t.transform(graph);
        }
        graph
    }
}

/// `A + I`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddSelfLoops;

impl GraphTransform for AddSelfLoops {
    fn transform(&self, mut graph: Graph) -> Graph {
        graph.a = graph.a.map(|a| a.add_self_loops());
        graph
    }
}

/// Normalizes the adjacency: `D^-1/2 A D^-1/2` when symmetric, else `D^-1 A`.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeAdj {
    pub symmetric: bool,
}

impl Default for NormalizeAdj {
    fn default() -> Self {
        Self { symmetric: true }
    }
}

impl GraphTransform for NormalizeAdj {
    fn transform(&self, mut graph: Graph) -> Graph {
        graph.a = graph.a.map(|a| if self.symmetric { a.gcn_normalized() } else { a.row_normalized() });
        graph
    }
}

/// GCN filter `D^-1/2 (A + I) D^-1/2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcnFilter;

impl GraphTransform for GcnFilter {
    fn transform(&self, mut graph: Graph) -> Graph {
        graph.a = graph.a.map(|a| a.add_self_loops().gcn_normalized());
        graph
    }
}

/// Rescales every row of `x` to sum to 1; all-zero rows are kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeFeatures;

impl GraphTransform for NormalizeFeatures {
    fn transform(&self, mut graph: Graph) -> Graph {
        if let Some(x) = graph.x.as_mut() {
            for mut row in x.axis_iter_mut(Axis(0)) {
                let sum = row.sum();
                if sum != 0.0 {
                    row.mapv_inplace(|v| v / sum);
                }
            }
        }
        graph
    }
}

/// Turns integer class labels into one-hot vectors of length `depth`.
///
/// A scalar (or one-element) label becomes `[depth]`; a vector of `n` node
/// labels becomes `[n, depth]`.
#[derive(Debug, Clone, Copy)]
pub struct OneHotLabels {
    pub depth: usize,
}

impl OneHotLabels {
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }

    fn encode(&self, classes: &[f32], shape: &[usize]) -> ArrayD<f32> {
        let target: Vec<usize> = if shape.iter().product::<usize>() == 1 {
            vec![self.depth]
        } else {
            vec![classes.len(), self.depth]
        };
        let mut flat = vec![0.0f32; classes.len() * self.depth];
        for (i, &class) in classes.iter().enumerate() {
            let class = class.round();
            if class >= 0.0 && (class as usize) < self.depth {
                flat[i * self.depth + class as usize] = 1.0;
            } else {
                warn!(label = class, depth = self.depth, "label outside one-hot depth; left all-zero");
            }
        }
        ArrayD::from_shape_vec(IxDyn(&target), flat).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&target)))
    }
}

impl GraphTransform for OneHotLabels {
    fn transform(&self, mut graph: Graph) -> Graph {
        if let Some(y) = graph.y.take() {
            let classes: Vec<f32> = y.iter().copied().collect();
            graph.y = Some(self.encode(&classes, y.shape()));
        }
        graph
    }
}

/// Stores the adjacency in sparse layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdjToSparse;

impl GraphTransform for AdjToSparse {
    fn transform(&self, mut graph: Graph) -> Graph {
        graph.a = graph.a.map(|a| Adjacency::Sparse(a.to_sparse()));
        graph
    }
}

/// Stores the adjacency in dense layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdjToDense;

impl GraphTransform for AdjToDense {
    fn transform(&self, mut graph: Graph) -> Graph {
        graph.a = graph.a.map(|a| Adjacency::Dense(a.to_dense()));
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::graph::CooAdjacency;
    use ndarray::{arr1, arr2, Array2};

    fn path_graph() -> Graph {
        Graph {
            x: Some(arr2(&[[1.0f32, 3.0], [0.0, 0.0], [2.0, 2.0]])),
            a: Some(Adjacency::Sparse(CooAdjacency::from_edges(&[(0, 1), (1, 0), (1, 2), (2, 1)], 3).unwrap())),
            e: None,
            y: Some(arr1(&[2.0f32]).into_dyn()),
        }
    }

    #[test]
    fn test_compose_runs_in_order() {
        let pipeline = Compose::new().add(AddSelfLoops).add(AdjToDense);
        let graph = pipeline.transform(path_graph());
        let a = graph.a.unwrap();
        assert!(!a.is_sparse());
        assert_eq!(a.degrees(), arr1(&[2.0f32, 3.0, 2.0]));
    }

    #[test]
    fn test_closures_are_transforms() {
        let drop_labels = |mut g: Graph| {
            g.y = None;
            g
        };
        assert!(drop_labels.transform(path_graph()).y.is_none());
    }

    #[test]
    fn test_normalize_adj_modes() {
        let sym = NormalizeAdj::default().transform(path_graph()).a.unwrap().to_dense();
        assert!((sym[[0, 1]] - 1.0 / 2.0f32.sqrt()).abs() < 1e-6);

        let rows = NormalizeAdj { symmetric: false }.transform(path_graph()).a.unwrap().to_dense();
        for r in rows.rows() {
            assert!((r.sum() - 1.0).abs() < 1e-6);
        }

        let filtered = GcnFilter.transform(path_graph()).a.unwrap().to_dense();
        assert!((filtered[[1, 1]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_features() {
        let x = NormalizeFeatures.transform(path_graph()).x.unwrap();
        assert_eq!(x, arr2(&[[0.25f32, 0.75], [0.0, 0.0], [0.5, 0.5]]));
    }

    #[test]
    fn test_one_hot_labels() {
        let graph = OneHotLabels::new(3).transform(path_graph());
        assert_eq!(graph.y.unwrap(), arr1(&[0.0f32, 0.0, 1.0]).into_dyn());

        let node_labels = Graph { y: Some(arr1(&[0.0f32, 1.0]).into_dyn()), ..Graph::default() };
        let encoded = OneHotLabels::new(2).transform(node_labels).y.unwrap();
        assert_eq!(encoded, Array2::<f32>::eye(2).into_dyn());
    }

    #[test]
    fn test_adj_to_sparse() {
        let dense = AdjToDense.transform(path_graph());
        let sparse = AdjToSparse.transform(dense);
        assert!(sparse.a.as_ref().map_or(false, Adjacency::is_sparse));
        assert_eq!(sparse.a.unwrap().n_edges(), 4);
    }
}
