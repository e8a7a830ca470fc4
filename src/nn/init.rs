//! Weight initializers, regularizers and constraints.
//!
//! Initializers and constraints act on concrete `ndarray` data; regularizers
//! add penalty nodes to the graph.

use crate::tensor::Tensor;
use ndarray::{ArrayD, Axis, IxDyn};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Small constant guarding norm divisions.
const NORM_EPS: f32 = 1e-7;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InitError {
    #[error("uniform initializer needs low < high, got [{low}, {high})")]
    EmptyRange { low: f32, high: f32 },
    #[error("normal initializer needs a finite, non-negative std, got {0}")]
    InvalidStd(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    /// Uniform in `[-l, l]` with `l = sqrt(6 / (fan_in + fan_out))`.
    #[default]
    GlorotUniform,
    Zeros,
    Ones,
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std: f32 },
}

impl Initializer {
    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Result<ArrayD<f32>, InitError> {
        let dim = IxDyn(shape);
        match *self {
            Initializer::Zeros => Ok(ArrayD::zeros(dim)),
            Initializer::Ones => Ok(ArrayD::ones(dim)),
            Initializer::GlorotUniform => {
                let (fan_in, fan_out) = fans(shape);
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                Ok(ArrayD::random_using(dim, Uniform::new_inclusive(-limit, limit), rng))
            }
            Initializer::Uniform { low, high } => {
                if !(low < high) {
                    return Err(InitError::EmptyRange { low, high });
                }
                Ok(ArrayD::random_using(dim, Uniform::new(low, high), rng))
            }
            Initializer::Normal { mean, std } => {
                if !(std >= 0.0 && std.is_finite()) {
                    return Err(InitError::InvalidStd(std));
                }
                let normal = Normal::new(mean, std).map_err(|_| InitError::InvalidStd(std))?;
                Ok(ArrayD::random_using(dim, normal, rng))
            }
        }
    }
}

/// `(fan_in, fan_out)` of a kernel: the last two axes, or the only axis twice.
fn fans(shape: &[usize]) -> (usize, usize) {
    match shape.len() {
        0 => (1, 1),
        1 => (shape[0], shape[0]),
        n => (shape[n - 2], shape[n - 1]),
    }
}

/// Weight penalty added to the model losses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Regularizer {
    L1 { l1: f32 },
    L2 { l2: f32 },
    L1L2 { l1: f32, l2: f32 },
}

impl Regularizer {
    /// Scalar penalty node for `weights`.
    pub fn penalty(&self, weights: &Tensor) -> Tensor {
        match *self {
            Regularizer::L1 { l1 } => weights.abs().sum().mul_scalar(l1),
            Regularizer::L2 { l2 } => (weights * weights).sum().mul_scalar(l2),
            Regularizer::L1L2 { l1, l2 } => {
                let a = weights.abs().sum().mul_scalar(l1);
                let b = (weights * weights).sum().mul_scalar(l2);
                &a + &b
            }
        }
    }
}

/// Projection applied to a weight after every update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    NonNeg,
    /// Norms along `axis` clipped to `max_value`.
    MaxNorm { max_value: f32, axis: usize },
    /// Norms along `axis` rescaled to 1.
    UnitNorm { axis: usize },
}

impl Constraint {
    pub fn apply(&self, weights: &mut ArrayD<f32>) {
        match *self {
            Constraint::NonNeg => weights.mapv_inplace(|w| w.max(0.0)),
            Constraint::MaxNorm { max_value, axis } => {
                if let Some(norms) = axis_norms(weights, axis) {
                    let scale = norms.mapv(|n| n.clamp(0.0, max_value) / (n + NORM_EPS));
                    *weights = &*weights * &scale;
                }
            }
            Constraint::UnitNorm { axis } => {
                if let Some(norms) = axis_norms(weights, axis) {
                    let scale = norms.mapv(|n| 1.0 / (n + NORM_EPS));
                    *weights = &*weights * &scale;
                }
            }
        }
    }
}

/// L2 norms along `axis`, kept as a length-1 axis for broadcasting.
fn axis_norms(weights: &ArrayD<f32>, axis: usize) -> Option<ArrayD<f32>> {
    if axis >= weights.ndim() {
        return None;
    }
    let squares = weights.mapv(|w| w * w);
    Some(squares.sum_axis(Axis(axis)).mapv(f32::sqrt).insert_axis(Axis(axis)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn glorot_respects_limit() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = Initializer::GlorotUniform.sample(&[4, 2], &mut rng).unwrap();
        let limit = (6.0f32 / 6.0).sqrt();
        assert_eq!(w.shape(), &[4, 2]);
        assert!(w.iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        let err = Initializer::Uniform { low: 1.0, high: 1.0 }.sample(&[2], &mut rng).unwrap_err();
        assert_eq!(err, InitError::EmptyRange { low: 1.0, high: 1.0 });
        let err = Initializer::Normal { mean: 0.0, std: -1.0 }.sample(&[3], &mut rng).unwrap_err();
        assert_eq!(err, InitError::InvalidStd(-1.0));
        assert!(Initializer::Normal { mean: 0.0, std: f32::NAN }.sample(&[2], &mut rng).is_err());
        assert!(Initializer::Normal { mean: 0.0, std: 0.0 }.sample(&[2], &mut rng).is_ok());
    }

    #[test]
    fn constraints_project_weights() {
        let mut w = ndarray::arr2(&[[3.0f32, -1.0], [4.0, 2.0]]).into_dyn();
        Constraint::NonNeg.apply(&mut w);
        assert_eq!(w[[0, 1]], 0.0);

        let mut w = ndarray::arr2(&[[3.0f32, 0.0], [4.0, 1.0]]).into_dyn();
        Constraint::UnitNorm { axis: 0 }.apply(&mut w);
        assert!((w[[0, 0]] - 0.6).abs() < 1e-5);
        assert!((w[[1, 0]] - 0.8).abs() < 1e-5);

        let mut w = ndarray::arr2(&[[3.0f32], [4.0]]).into_dyn();
        Constraint::MaxNorm { max_value: 2.0, axis: 0 }.apply(&mut w);
        let norm = w.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 2.0).abs() < 1e-4);
    }

    #[test]
    fn config_round_trips_through_json() {
        let reg = Regularizer::L1L2 { l1: 0.1, l2: 0.01 };
        let json = serde_json::to_string(&reg).unwrap();
        assert!(json.contains("\"type\":\"l1_l2\""));
        assert_eq!(serde_json::from_str::<Regularizer>(&json).unwrap(), reg);
    }
}
