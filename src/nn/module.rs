//! The `Module` trait shared by the layers.

use crate::tensor::Tensor;

/// Common interface of the layers.
///
/// A module owns symbolic handles to its parameters and appends its pattern
/// of operations to the graph when called.
pub trait Module {
    /// Symbolic forward pass: builds the layer's part of the graph.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Trainable parameters of the module, as symbolic tensors.
    fn parameters(&self) -> Vec<Tensor>;
}
