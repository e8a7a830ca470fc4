//! Optimizers that update parameter values from their gradients.
//!
//! Optimizers work on concrete CPU values (`Value`), keyed by parameter
//! name, after a backward pass has been evaluated.

use crate::asg::Value;
use ndarray::ArrayD;
use std::collections::HashMap;

pub trait Optimizer {
    /// Performs one update step.
    ///
    /// * `parameters` - current values, keyed by parameter name
    ///   (for example `"pool.kernel_pool"`).
    /// * `gradients` - gradients of the loss for those parameters. Entries
    ///   with no matching parameter are ignored.
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>);
}

/// Stochastic gradient descent with optional momentum.
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr, momentum: 0.0, velocity: HashMap::new() }
    }

    /// `v = momentum * v + g; p -= lr * v`.
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>) {
        for (name, grad) in gradients {
            let (Some(Value::Tensor(param)), Value::Tensor(grad)) = (parameters.get_mut(name), grad) else {
                continue;
            };
            if param.shape() != grad.shape() {
                continue;
            }
            if self.momentum == 0.0 {
                ndarray::azip!((p in param, &g in grad) *p -= self.lr * g);
                continue;
            }
            let velocity = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let (lr, momentum) = (self.lr, self.momentum);
            ndarray::azip!((p in param, v in velocity, &g in grad) {
                *v = momentum * *v + g;
                *p -= lr * *v;
            });
        }
    }
}
