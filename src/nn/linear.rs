//! Fully connected layer in the graph paradigm.

use crate::nn::init::Initializer;
use crate::nn::module::Module;
use crate::tensor::{GraphContext, ParameterSpec, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Dense layer `y = xW + b`.
///
/// Holds no data: `weights` and `bias` are `Parameter` nodes whose values
/// are supplied to the session at run time. Inputs of any rank work, the
/// product is taken over the last axis.
pub struct Linear {
    pub weights: Tensor,
    pub bias: Tensor,
}

impl Linear {
    /// Registers `{name}.weights` `[in, out]` (Glorot uniform) and
    /// `{name}.bias` `[out]` (zeros).
    pub fn new(context: &Rc<RefCell<GraphContext>>, in_features: usize, out_features: usize, name: &str) -> Self {
        Self::with_initializer(context, in_features, out_features, name, Initializer::GlorotUniform)
    }

    pub fn with_initializer(
        context: &Rc<RefCell<GraphContext>>,
        in_features: usize,
        out_features: usize,
        name: &str,
        initializer: Initializer,
    ) -> Self {
        let weights = Tensor::new_parameter_with(
            context,
            &format!("{}.weights", name),
            ParameterSpec::new(vec![in_features, out_features], initializer),
        );
        let bias = Tensor::new_parameter_with(
            context,
            &format!("{}.bias", name),
            ParameterSpec::new(vec![out_features], Initializer::Zeros),
        );
        Self { weights, bias }
    }
}

impl Module for Linear {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        &inputs.dot(&self.weights) + &self.bias
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_shape_follows_batch_axes() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let layer = Linear::new(&context, 3, 5, "fc");
        let x = Tensor::new_input_with_shape(&context, "x", &[2, 4, 3]);
        assert_eq!(layer.forward(&x).shape(), Some(vec![2, 4, 5]));
        assert_eq!(layer.parameters().len(), 2);
        assert!(context.borrow().parameter_spec("fc.bias").is_some());
    }
}
