//! # Neural network layers
//!
//! In the graph-based architecture each layer is a constructor that adds a
//! pattern of nodes (operations and parameters) to the ASG. Graph layers
//! take node features `X` and an adjacency `A` with static shapes and check
//! them when called.
//!
//! ## Available layers
//!
//! - [`Linear`]: dense layer
//! - [`GraphConv`]: graph convolution with the GCN filter
//! - [`DiffPool`]: differentiable pooling with auxiliary losses
//! - [`GlobalSumPool`], [`GlobalAvgPool`]: graph readout
//! - [`Activation`]: elementwise activations
//!
//! ## Example
//!
//! ```no_run
//! use rustygnn::nn::{DiffPool, DiffPoolConfig};
//! use rustygnn::tensor::{GraphContext, Tensor};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let x = Tensor::new_input_with_shape(&ctx, "x", &[8, 10, 4]);
//! let a = Tensor::new_input_with_shape(&ctx, "a", &[8, 10, 10]);
//! let mut pool = DiffPool::new("pool", DiffPoolConfig::new(3)).unwrap();
//! let out = pool.call(&x, &a).unwrap();
//! ```

pub mod activations;
pub mod graph_conv;
pub mod init;
pub mod linear;
pub mod module;
pub mod ops;
pub mod pooling;

pub use activations::Activation;
pub use graph_conv::GraphConv;
pub use init::{Constraint, Initializer, Regularizer};
pub use linear::Linear;
pub use module::Module;
pub use ops::Mode;
pub use pooling::{DiffPool, DiffPoolConfig, DiffPoolOutput, GlobalAvgPool, GlobalSumPool};

use crate::asg::Shape;
use thiserror::Error;

/// Errors raised while wiring a layer into the graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("{0} has no static shape; create graph inputs with `Tensor::new_input_with_shape`")]
    MissingShape(&'static str),
    #[error("{tensor} must have rank {expected}, got {actual}")]
    InvalidRank { tensor: &'static str, expected: &'static str, actual: usize },
    #[error("adjacency must be square, got shape {0:?}")]
    NonSquareAdjacency(Shape),
    #[error("X has {x_nodes} nodes but A has {a_nodes}")]
    NodeCountMismatch { x_nodes: usize, a_nodes: usize },
    #[error("X has batch size {x} but A has {a}")]
    BatchMismatch { x: usize, a: usize },
    #[error("layer was built for {expected} node features, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },
    #[error("number of clusters k must be positive")]
    ZeroClusters,
}
