//! A single graph: node features, adjacency, edge features and labels.

use ndarray::{Array1, Array2, ArrayD};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("x has {x_nodes} rows but the adjacency has {a_nodes} nodes")]
    NodeCountMismatch { x_nodes: usize, a_nodes: usize },
    #[error("dense adjacency must be square, got {rows}x{cols}")]
    NonSquare { rows: usize, cols: usize },
    #[error("sparse index {index} out of range for {n_nodes} nodes")]
    IndexOutOfRange { index: usize, n_nodes: usize },
    #[error("sparse triplets disagree in length: {rows} rows, {cols} cols, {values} values")]
    LengthMismatch { rows: usize, cols: usize, values: usize },
    #[error("e has {e_rows} rows but the adjacency has {n_edges} edges")]
    EdgeFeatureMismatch { e_rows: usize, n_edges: usize },
}

/// Adjacency in coordinate format.
#[derive(Debug, Clone, PartialEq)]
pub struct CooAdjacency {
    n_nodes: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f32>,
}

impl CooAdjacency {
    pub fn new(n_nodes: usize, rows: Vec<usize>, cols: Vec<usize>, values: Vec<f32>) -> Result<Self, GraphError> {
        if rows.len() != cols.len() || rows.len() != values.len() {
            return Err(GraphError::LengthMismatch { rows: rows.len(), cols: cols.len(), values: values.len() });
        }
        if let Some(&index) = rows.iter().chain(cols.iter()).find(|&&i| i >= n_nodes) {
            return Err(GraphError::IndexOutOfRange { index, n_nodes });
        }
        Ok(Self { n_nodes, rows, cols, values })
    }

    /// Unweighted directed edges `(source, target)`.
    pub fn from_edges(edges: &[(usize, usize)], n_nodes: usize) -> Result<Self, GraphError> {
        let rows = edges.iter().map(|e| e.0).collect();
        let cols = edges.iter().map(|e| e.1).collect();
        Self::new(n_nodes, rows, cols, vec![1.0; edges.len()])
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// `(row, col, value)` triplets.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.rows
            .iter()
            .zip(self.cols.iter())
            .zip(self.values.iter())
            .map(|((&r, &c), &v)| (r, c, v))
    }

    /// Dense form; duplicate entries are summed.
    pub fn to_dense(&self) -> Array2<f32> {
        let mut dense = Array2::zeros((self.n_nodes, self.n_nodes));
        for (r, c, v) in self.iter() {
            dense[[r, c]] += v;
        }
        dense
    }

    fn from_dense(dense: &Array2<f32>) -> Self {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut values = Vec::new();
        for ((r, c), &v) in dense.indexed_iter() {
            if v != 0.0 {
                rows.push(r);
                cols.push(c);
                values.push(v);
            }
        }
        Self { n_nodes: dense.nrows(), rows, cols, values }
    }

    fn map_values(&self, f: impl Fn(usize, usize, f32) -> f32) -> Self {
        let values = self.iter().map(|(r, c, v)| f(r, c, v)).collect();
        Self { n_nodes: self.n_nodes, rows: self.rows.clone(), cols: self.cols.clone(), values }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Adjacency {
    Dense(Array2<f32>),
    Sparse(CooAdjacency),
}

impl Adjacency {
    pub fn dense(matrix: Array2<f32>) -> Result<Self, GraphError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(GraphError::NonSquare { rows: matrix.nrows(), cols: matrix.ncols() });
        }
        Ok(Adjacency::Dense(matrix))
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Adjacency::Sparse(_))
    }

    pub fn n_nodes(&self) -> usize {
        match self {
            Adjacency::Dense(m) => m.nrows(),
            Adjacency::Sparse(s) => s.n_nodes(),
        }
    }

    /// Number of non-zero entries.
    pub fn n_edges(&self) -> usize {
        match self {
            Adjacency::Dense(m) => m.iter().filter(|&&v| v != 0.0).count(),
            Adjacency::Sparse(s) => s.values().iter().filter(|&&v| v != 0.0).count(),
        }
    }

    pub fn to_dense(&self) -> Array2<f32> {
        match self {
            Adjacency::Dense(m) => m.clone(),
            Adjacency::Sparse(s) => s.to_dense(),
        }
    }

    pub fn to_sparse(&self) -> CooAdjacency {
        match self {
            Adjacency::Dense(m) => CooAdjacency::from_dense(m),
            Adjacency::Sparse(s) => s.clone(),
        }
    }

    /// Row sums.
    pub fn degrees(&self) -> Array1<f32> {
        match self {
            Adjacency::Dense(m) => m.sum_axis(ndarray::Axis(1)),
            Adjacency::Sparse(s) => {
                let mut degrees = Array1::zeros(s.n_nodes());
                for (r, _, v) in s.iter() {
                    degrees[r] += v;
                }
                degrees
            }
        }
    }

    /// `A + I`, in the same layout.
    pub fn add_self_loops(&self) -> Adjacency {
        match self {
            Adjacency::Dense(m) => Adjacency::Dense(m + &Array2::<f32>::eye(m.nrows())),
            Adjacency::Sparse(s) => {
                let mut dense_diag = vec![false; s.n_nodes()];
                let mut out = s.map_values(|r, c, v| if r == c { v + 1.0 } else { v });
                for (r, c, _) in s.iter() {
                    if r == c {
                        dense_diag[r] = true;
                    }
                }
                for (i, present) in dense_diag.iter().enumerate() {
                    if !present {
                        out.rows.push(i);
                        out.cols.push(i);
                        out.values.push(1.0);
                    }
                }
                Adjacency::Sparse(out)
            }
        }
    }

    /// `D^-1/2 A D^-1/2`; isolated nodes keep zero rows.
    pub fn gcn_normalized(&self) -> Adjacency {
        let d_inv_sqrt = self.degrees().mapv(|d| if d > 0.0 { d.powf(-0.5) } else { 0.0 });
        match self {
            Adjacency::Dense(m) => {
                let mut out = m.clone();
                for ((r, c), v) in out.indexed_iter_mut() {
                    *v *= d_inv_sqrt[r] * d_inv_sqrt[c];
                }
                Adjacency::Dense(out)
            }
            Adjacency::Sparse(s) => Adjacency::Sparse(s.map_values(|r, c, v| v * d_inv_sqrt[r] * d_inv_sqrt[c])),
        }
    }

    /// `D^-1 A`: every non-isolated row sums to 1.
    pub fn row_normalized(&self) -> Adjacency {
        let d_inv = self.degrees().mapv(|d| if d != 0.0 { 1.0 / d } else { 0.0 });
        match self {
            Adjacency::Dense(m) => {
                let mut out = m.clone();
                for ((r, _), v) in out.indexed_iter_mut() {
                    *v *= d_inv[r];
                }
                Adjacency::Dense(out)
            }
            Adjacency::Sparse(s) => Adjacency::Sparse(s.map_values(|r, _, v| v * d_inv[r])),
        }
    }
}

/// One graph-structured example. Every matrix is optional.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Graph {
    /// Node features `[n_nodes, n_node_features]`.
    pub x: Option<Array2<f32>>,
    pub a: Option<Adjacency>,
    /// Edge features `[n_edges, n_edge_features]`.
    pub e: Option<Array2<f32>>,
    /// Labels; the innermost axis gives `n_labels`.
    pub y: Option<ArrayD<f32>>,
}

impl Graph {
    pub fn new(
        x: Option<Array2<f32>>,
        a: Option<Adjacency>,
        e: Option<Array2<f32>>,
        y: Option<ArrayD<f32>>,
    ) -> Result<Self, GraphError> {
        let graph = Self { x, a, e, y };
        graph.validate()?;
        Ok(graph)
    }

    /// Checks that the matrices agree on node and edge counts.
    pub fn validate(&self) -> Result<(), GraphError> {
        if let Some(Adjacency::Dense(m)) = &self.a {
            if m.nrows() != m.ncols() {
                return Err(GraphError::NonSquare { rows: m.nrows(), cols: m.ncols() });
            }
        }
        if let (Some(x), Some(a)) = (&self.x, &self.a) {
            if x.nrows() != a.n_nodes() {
                return Err(GraphError::NodeCountMismatch { x_nodes: x.nrows(), a_nodes: a.n_nodes() });
            }
        }
        if let (Some(e), Some(a)) = (&self.e, &self.a) {
            if e.nrows() != a.n_edges() {
                return Err(GraphError::EdgeFeatureMismatch { e_rows: e.nrows(), n_edges: a.n_edges() });
            }
        }
        Ok(())
    }

    pub fn n_nodes(&self) -> Option<usize> {
        self.x.as_ref().map(|x| x.nrows()).or_else(|| self.a.as_ref().map(Adjacency::n_nodes))
    }

    pub fn n_edges(&self) -> Option<usize> {
        self.a.as_ref().map(Adjacency::n_edges)
    }

    pub fn n_node_features(&self) -> Option<usize> {
        self.x.as_ref().map(|x| x.ncols())
    }

    pub fn n_edge_features(&self) -> Option<usize> {
        self.e.as_ref().map(|e| e.ncols())
    }

    pub fn n_labels(&self) -> Option<usize> {
        self.y.as_ref().map(|y| y.shape().last().copied().unwrap_or(1))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<usize>| v.map_or_else(|| "None".to_string(), |n| n.to_string());
        write!(
            f,
            "Graph(n_nodes={}, n_node_features={}, n_edge_features={}, n_labels={})",
            show(self.n_nodes()),
            show(self.n_node_features()),
            show(self.n_edge_features()),
            show(self.n_labels())
        )
    }
}
