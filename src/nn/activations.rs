//! Activation functions as a configurable enum.

use crate::nn::module::Module;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Elementwise activation applied by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Identity.
    #[default]
    Linear,
    #[serde(rename = "relu")]
    ReLU,
    Sigmoid,
    Tanh,
    /// Over the last axis.
    Softmax,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Tensor {
        match self {
            Activation::Linear => x.clone(),
            Activation::ReLU => x.relu(),
            Activation::Sigmoid => x.sigmoid(),
            Activation::Tanh => x.tanh(),
            Activation::Softmax => x.softmax(),
        }
    }
}

impl Module for Activation {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.apply(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_keras_style_strings() {
        assert_eq!(serde_json::to_string(&Activation::ReLU).unwrap(), "\"relu\"");
        assert_eq!(serde_json::from_str::<Activation>("\"softmax\"").unwrap(), Activation::Softmax);
        assert_eq!(Activation::default(), Activation::Linear);
    }
}
