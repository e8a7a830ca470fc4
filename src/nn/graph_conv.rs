//! Graph convolution `act(Â X W + b)`.

use super::activations::Activation;
use super::init::Initializer;
use super::ops::{detect_mode, gcn_filter};
use super::LayerError;
use crate::tensor::{GraphContext, ParameterSpec, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Graph convolution with `Â = D^-1/2 (A + I) D^-1/2`.
///
/// Works in single, batch and mixed mode. The adjacency passed to `call` is
/// the raw one; the filter is computed inside the graph.
pub struct GraphConv {
    pub kernel: Tensor,
    pub bias: Option<Tensor>,
    in_features: usize,
    activation: Activation,
}

impl GraphConv {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        in_features: usize,
        channels: usize,
        activation: Activation,
        name: &str,
    ) -> Self {
        let kernel = Tensor::new_parameter_with(
            context,
            &format!("{}.kernel", name),
            ParameterSpec::new(vec![in_features, channels], Initializer::GlorotUniform),
        );
        let bias = Tensor::new_parameter_with(
            context,
            &format!("{}.bias", name),
            ParameterSpec::new(vec![channels], Initializer::Zeros),
        );
        Self { kernel, bias: Some(bias), in_features, activation }
    }

    /// Same layer without a bias term.
    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    pub fn call(&self, x: &Tensor, a: &Tensor) -> Result<Tensor, LayerError> {
        let x_shape = x.shape().ok_or(LayerError::MissingShape("X"))?;
        let a_shape = a.shape().ok_or(LayerError::MissingShape("A"))?;
        detect_mode(&x_shape, &a_shape)?;
        let features = x_shape[x_shape.len() - 1];
        if features != self.in_features {
            return Err(LayerError::FeatureMismatch { expected: self.in_features, actual: features });
        }

        let filter = gcn_filter(a)?;
        let mut out = filter.dot(&x.dot(&self.kernel));
        if let Some(bias) = &self.bias {
            out = &out + bias;
        }
        Ok(self.activation.apply(&out))
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.kernel.clone()];
        params.extend(self.bias.clone());
        params
    }
}
