//! Global pooling over the node axis.

use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Sum of node features: `[N, F] -> [1, F]`, `[B, N, F] -> [B, F]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalSumPool;

/// Mean of node features: `[N, F] -> [1, F]`, `[B, N, F] -> [B, F]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAvgPool;

/// Drops the kept node axis of a batched reduction.
fn squeeze_nodes(pooled: Tensor) -> Tensor {
    match pooled.shape().as_deref() {
        Some(&[batch, 1, features]) => pooled.reshape(&[batch, features]),
        _ => pooled,
    }
}

impl Module for GlobalSumPool {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        squeeze_nodes(inputs.sum_axis(-2))
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

impl Module for GlobalAvgPool {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        squeeze_nodes(inputs.mean_axis(-2))
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::Session;
    use crate::tensor::GraphContext;
    use ndarray::{arr2, Array3};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[test]
    fn pools_over_nodes() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input_with_shape(&context, "x", &[2, 3, 2]);
        let summed = GlobalSumPool.forward(&x);
        let averaged = GlobalAvgPool.forward(&x);
        assert_eq!(summed.shape(), Some(vec![2, 2]));

        let data = Array3::from_shape_vec((2, 3, 2), (0..12).map(|v| v as f32).collect()).unwrap();
        let mut feed = HashMap::new();
        feed.insert("x".to_string(), Value::Tensor(data.into_dyn()));
        let session = Session::new(&context, &[&summed, &averaged], None).unwrap();
        let out = session.forward(&feed).unwrap();
        assert_eq!(out[0].to_tensor(), arr2(&[[6.0f32, 9.0], [24.0, 27.0]]).into_dyn());
        assert_eq!(out[1].to_tensor(), arr2(&[[2.0f32, 3.0], [8.0, 9.0]]).into_dyn());
    }

    #[test]
    fn single_mode_keeps_one_row() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input_with_shape(&context, "x", &[4, 3]);
        assert_eq!(GlobalAvgPool.forward(&x).shape(), Some(vec![1, 3]));
    }
}
