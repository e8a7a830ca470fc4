//! Graph operations shared by the graph layers.

use super::LayerError;
use crate::tensor::Tensor;

/// How node features and adjacency are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `X [N, F]`, `A [N, N]`.
    Single,
    /// `X [B, N, F]`, `A [B, N, N]`.
    Batch,
    /// `X [B, N, F]`, `A [N, N]` shared by every graph.
    Mixed,
}

impl Mode {
    /// Whether per-graph quantities are averaged over a batch.
    pub fn is_batched(self) -> bool {
        matches!(self, Mode::Batch | Mode::Mixed)
    }
}

/// Determines the mode from the static shapes and checks they agree.
pub fn detect_mode(x_shape: &[usize], a_shape: &[usize]) -> Result<Mode, LayerError> {
    let mode = match (x_shape.len(), a_shape.len()) {
        (2, 2) => Mode::Single,
        (3, 3) => Mode::Batch,
        (3, 2) => Mode::Mixed,
        (x_rank, 2) | (x_rank, 3) => {
            return Err(LayerError::InvalidRank { tensor: "X", expected: "2 or 3", actual: x_rank })
        }
        (_, a_rank) => return Err(LayerError::InvalidRank { tensor: "A", expected: "2 or 3", actual: a_rank }),
    };

    let a_rank = a_shape.len();
    let (rows, cols) = (a_shape[a_rank - 2], a_shape[a_rank - 1]);
    if rows != cols {
        return Err(LayerError::NonSquareAdjacency(a_shape.to_vec()));
    }
    let x_nodes = x_shape[x_shape.len() - 2];
    if x_nodes != rows {
        return Err(LayerError::NodeCountMismatch { x_nodes, a_nodes: rows });
    }
    if mode == Mode::Batch && x_shape[0] != a_shape[0] {
        return Err(LayerError::BatchMismatch { x: x_shape[0], a: a_shape[0] });
    }
    Ok(mode)
}

/// `A + I`; the identity broadcasts over a batch axis.
pub fn add_self_loops(a: &Tensor, n_nodes: usize) -> Tensor {
    let eye = Tensor::eye(&a.context, n_nodes);
    a + &eye
}

/// Symmetric normalization `D^-1/2 A D^-1/2` with `D` the row degrees.
///
/// Nodes of degree zero get a zero row and column instead of infinities.
pub fn normalize_adjacency(a: &Tensor) -> Result<Tensor, LayerError> {
    let rank = a.rank().ok_or(LayerError::MissingShape("A"))?;
    if !(2..=3).contains(&rank) {
        return Err(LayerError::InvalidRank { tensor: "A", expected: "2 or 3", actual: rank });
    }

    let degree = a.sum_axis(-1);
    let zero = Tensor::scalar(&a.context, 0.0);
    let one = Tensor::scalar(&a.context, 1.0);
    let connected = degree.greater_than(&zero);
    let safe = &degree + &(&one - &connected);
    let d_inv_sqrt = &safe.pow_scalar(-0.5) * &connected;

    let d_row = d_inv_sqrt.clone();
    let d_col = d_inv_sqrt.transpose_last(rank);
    Ok(&(&d_row * a) * &d_col)
}

/// GCN filter `D^-1/2 (A + I) D^-1/2`.
pub fn gcn_filter(a: &Tensor) -> Result<Tensor, LayerError> {
    let shape = a.shape().ok_or(LayerError::MissingShape("A"))?;
    let n_nodes = *shape.last().ok_or(LayerError::InvalidRank { tensor: "A", expected: "2 or 3", actual: 0 })?;
    normalize_adjacency(&add_self_loops(a, n_nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::Session;
    use crate::tensor::GraphContext;
    use ndarray::arr2;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[test]
    fn test_detect_mode() {
        assert_eq!(detect_mode(&[5, 3], &[5, 5]).unwrap(), Mode::Single);
        assert_eq!(detect_mode(&[2, 5, 3], &[2, 5, 5]).unwrap(), Mode::Batch);
        assert_eq!(detect_mode(&[2, 5, 3], &[5, 5]).unwrap(), Mode::Mixed);
        assert!(Mode::Mixed.is_batched() && !Mode::Single.is_batched());

        assert_eq!(
            detect_mode(&[4, 3], &[5, 5]),
            Err(LayerError::NodeCountMismatch { x_nodes: 4, a_nodes: 5 })
        );
        assert_eq!(detect_mode(&[2, 5, 3], &[3, 5, 5]), Err(LayerError::BatchMismatch { x: 2, a: 3 }));
        assert!(matches!(detect_mode(&[5], &[5, 5]), Err(LayerError::InvalidRank { tensor: "X", .. })));
        assert!(matches!(detect_mode(&[5, 3], &[5, 4]), Err(LayerError::NonSquareAdjacency(_))));
    }

    #[test]
    fn test_gcn_filter_values() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let a = Tensor::new_input_with_shape(&context, "a", &[3, 3]);
        let filtered = gcn_filter(&a).unwrap();
        assert_eq!(filtered.shape(), Some(vec![3, 3]));

        // Path 0-1, node 2 isolated.
        let mut feed = HashMap::new();
        feed.insert(
            "a".to_string(),
            Value::Tensor(arr2(&[[0.0f32, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 0.0]]).into_dyn()),
        );
        let session = Session::new(&context, &[&filtered], None).unwrap();
        let out = session.forward(&feed).unwrap()[0].to_tensor();
        assert!((out[[0, 1]] - 0.5).abs() < 1e-6);
        assert!((out[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((out[[2, 2]] - 1.0).abs() < 1e-6);
        assert_eq!(out[[0, 2]], 0.0);
    }

    #[test]
    fn test_isolated_nodes_do_not_produce_nan() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let a = Tensor::new_input_with_shape(&context, "a", &[2, 2]);
        let normalized = normalize_adjacency(&a).unwrap();
        let mut feed = HashMap::new();
        feed.insert("a".to_string(), Value::Tensor(arr2(&[[0.0f32, 0.0], [0.0, 2.0]]).into_dyn()));
        let session = Session::new(&context, &[&normalized], None).unwrap();
        let out = session.forward(&feed).unwrap()[0].to_tensor();
        assert!(out.iter().all(|v| v.is_finite()));
        assert!((out[[1, 1]] - 1.0).abs() < 1e-6);
    }
}
