//! DiffPool: differentiable pooling through a learned soft clustering.
//!
//! For node features `X` and adjacency `A` the layer computes
//!
//! ```text
//! Â  = D^-1/2 (A + I) D^-1/2
//! Z  = act(Â X W_emb)
//! S  = softmax(Â X W_pool)
//! X' = Sᵀ Z
//! A' = Sᵀ A S
//! ```
//!
//! and two auxiliary losses: the link prediction loss `‖A − S Sᵀ‖_F` and
//! the entropy of the assignments `mean_nodes(−Σ_k S log S)`. Both are
//! averaged over the batch in batch and mixed mode.
//!
//! Shapes must be static: `X` is `[N, F]` or `[B, N, F]`, `A` is `[N, N]`
//! or `[B, N, N]`.

use crate::nn::activations::Activation;
use crate::nn::init::{Constraint, Initializer, Regularizer};
use crate::nn::ops::{detect_mode, gcn_filter};
use crate::nn::LayerError;
use crate::tensor::{GraphContext, ParameterSpec, Tensor};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Keeps `log(S)` finite for exactly zero assignments.
const LOG_EPS: f32 = 1e-7;

/// Hyperparameters of a `DiffPool` layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffPoolConfig {
    /// Number of clusters.
    pub k: usize,
    /// Output channels of the embeddings; the input feature count when `None`.
    #[serde(default)]
    pub channels: Option<usize>,
    /// Whether the assignment matrix `S` is returned.
    #[serde(default)]
    pub return_mask: bool,
    /// Applied to the node embeddings `Z`.
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub kernel_initializer: Initializer,
    #[serde(default)]
    pub kernel_regularizer: Option<Regularizer>,
    #[serde(default)]
    pub kernel_constraint: Option<Constraint>,
}

impl DiffPoolConfig {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            channels: None,
            return_mask: false,
            activation: Activation::Linear,
            kernel_initializer: Initializer::GlorotUniform,
            kernel_regularizer: None,
            kernel_constraint: None,
        }
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn return_mask(mut self, return_mask: bool) -> Self {
        self.return_mask = return_mask;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn kernel_initializer(mut self, initializer: Initializer) -> Self {
        self.kernel_initializer = initializer;
        self
    }

    pub fn kernel_regularizer(mut self, regularizer: Regularizer) -> Self {
        self.kernel_regularizer = Some(regularizer);
        self
    }

    pub fn kernel_constraint(mut self, constraint: Constraint) -> Self {
        self.kernel_constraint = Some(constraint);
        self
    }
}

/// Result of one `DiffPool` call.
#[derive(Debug, Clone)]
pub struct DiffPoolOutput {
    /// Pooled features `[.., k, channels]`.
    pub x: Tensor,
    /// Pooled adjacency `[.., k, k]`.
    pub a: Tensor,
    /// Assignment matrix `[.., N, k]`, when `return_mask` is set.
    pub s: Option<Tensor>,
    /// Scalar link prediction loss.
    pub link_loss: Tensor,
    /// Scalar entropy loss.
    pub entropy_loss: Tensor,
    /// Kernel regularization penalties, if a regularizer is configured.
    pub regularization: Vec<Tensor>,
}

impl DiffPoolOutput {
    /// Every auxiliary loss the layer adds to the model.
    pub fn losses(&self) -> Vec<Tensor> {
        let mut losses = vec![self.link_loss.clone(), self.entropy_loss.clone()];
        losses.extend(self.regularization.iter().cloned());
        losses
    }
}

#[derive(Debug, Clone)]
struct Kernels {
    n_node_features: usize,
    emb: Tensor,
    pool: Tensor,
}

#[derive(Debug, Clone)]
pub struct DiffPool {
    name: String,
    config: DiffPoolConfig,
    kernels: Option<Kernels>,
}

impl DiffPool {
    pub fn new(name: &str, config: DiffPoolConfig) -> Result<Self, LayerError> {
        if config.k == 0 {
            return Err(LayerError::ZeroClusters);
        }
        Ok(Self { name: name.to_string(), config, kernels: None })
    }

    pub fn from_config(name: &str, config: DiffPoolConfig) -> Result<Self, LayerError> {
        Self::new(name, config)
    }

    pub fn config(&self) -> &DiffPoolConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of embedding channels once built.
    pub fn channels(&self) -> Option<usize> {
        self.kernels
            .as_ref()
            .map(|k| self.config.channels.unwrap_or(k.n_node_features))
    }

    pub fn is_built(&self) -> bool {
        self.kernels.is_some()
    }

    /// Creates `{name}.kernel_emb [F, channels]` and `{name}.kernel_pool [F, k]`.
    ///
    /// Building twice with the same feature count is a no-op.
    pub fn build(&mut self, context: &Rc<RefCell<GraphContext>>, n_node_features: usize) -> Result<(), LayerError> {
        if let Some(kernels) = &self.kernels {
            if kernels.n_node_features != n_node_features {
                return Err(LayerError::FeatureMismatch {
                    expected: kernels.n_node_features,
                    actual: n_node_features,
                });
            }
            return Ok(());
        }

        let channels = self.config.channels.unwrap_or(n_node_features);
        let spec = |cols: usize| {
            ParameterSpec::new(vec![n_node_features, cols], self.config.kernel_initializer)
                .with_constraint(self.config.kernel_constraint)
        };
        let emb = Tensor::new_parameter_with(context, &format!("{}.kernel_emb", self.name), spec(channels));
        let pool = Tensor::new_parameter_with(context, &format!("{}.kernel_pool", self.name), spec(self.config.k));

        debug!(layer = %self.name, n_node_features, channels, k = self.config.k, "built DiffPool");
        self.kernels = Some(Kernels { n_node_features, emb, pool });
        Ok(())
    }

    /// Pools `x` with adjacency `a`, building the kernels on first use.
    pub fn call(&mut self, x: &Tensor, a: &Tensor) -> Result<DiffPoolOutput, LayerError> {
        let x_shape = x.shape().ok_or(LayerError::MissingShape("X"))?;
        let a_shape = a.shape().ok_or(LayerError::MissingShape("A"))?;
        let mode = detect_mode(&x_shape, &a_shape)?;
        let n_node_features = x_shape[x_shape.len() - 1];

        self.build(&x.context, n_node_features)?;
        let kernels = self.kernels.as_ref().ok_or(LayerError::MissingShape("kernels"))?;

        let fltr = gcn_filter(a)?;

        let z = self.config.activation.apply(&fltr.dot(&x.dot(&kernels.emb)));
        let s = fltr.dot(&x.dot(&kernels.pool)).softmax();

        let s_rank = x_shape.len();
        let s_t = s.transpose_last(s_rank);

        // Link prediction loss: per-graph Frobenius norm, then over the batch.
        let s_gram = s.dot(&s_t);
        let link_loss = (a - &s_gram).frobenius_norm().mean();

        // Entropy loss: per-node entropy, averaged over nodes and batch.
        let log_s = s.add_scalar(LOG_EPS).log();
        let entropy = -&(&s * &log_s).sum_axis(-1);
        let entropy_loss = entropy.mean();

        let x_pooled = s_t.dot(&z);
        let a_pooled = s_t.dot(&a.dot(&s));

        let regularization = match &self.config.kernel_regularizer {
            Some(reg) => vec![reg.penalty(&kernels.emb), reg.penalty(&kernels.pool)],
            None => Vec::new(),
        };

        debug!(layer = %self.name, ?mode, reduce_loss = mode.is_batched(), "DiffPool call");
        Ok(DiffPoolOutput {
            x: x_pooled,
            a: a_pooled,
            s: self.config.return_mask.then_some(s),
            link_loss,
            entropy_loss,
            regularization,
        })
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        match &self.kernels {
            Some(k) => vec![k.emb.clone(), k.pool.clone()],
            None => Vec::new(),
        }
    }
}
