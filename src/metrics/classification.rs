//! Classification metrics.

use super::Metric;
use ndarray::{ArrayD, ArrayView1, Axis};

/// Fraction of samples whose arg-max class matches the target.
///
/// Predictions are class scores with classes on the last axis. Targets are
/// either one-hot (same shape as the predictions) or class indices with the
/// last axis dropped.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

fn argmax(lane: ArrayView1<'_, f32>) -> usize {
    lane.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

impl Metric for Accuracy {
    type Prediction = ArrayD<f32>;
    type Target = ArrayD<f32>;
    type Output = f64;

    fn update(&mut self, predictions: &ArrayD<f32>, targets: &ArrayD<f32>) {
        if predictions.ndim() == 0 {
            return;
        }
        let class_axis = Axis(predictions.ndim() - 1);
        let predicted = predictions.lanes(class_axis).into_iter().map(argmax);

        let one_hot = targets.shape() == predictions.shape();
        let expected: Vec<usize> = if one_hot {
            targets.lanes(class_axis).into_iter().map(argmax).collect()
        } else {
            targets.iter().map(|&c| c.round().max(0.0) as usize).collect()
        };

        for (p, t) in predicted.zip(expected) {
            if p == t {
                self.correct += 1;
            }
            self.total += 1;
        }
    }

    fn compute(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }

    fn name(&self) -> &str {
        "accuracy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_accuracy_with_class_indices() {
        let mut acc = Accuracy::new();
        let probs = arr2(&[[0.1f32, 0.7, 0.2], [0.5, 0.3, 0.2], [0.0, 0.1, 0.9]]).into_dyn();
        acc.update(&probs, &arr1(&[1.0f32, 0.0, 0.0]).into_dyn());
        assert!((acc.compute() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(acc.total(), 3);
        acc.reset();
        assert_eq!(acc.compute(), 0.0);
    }

    #[test]
    fn test_accuracy_accumulates_over_batches() {
        let mut acc = Accuracy::new();
        let probs = arr2(&[[0.9f32, 0.1]]).into_dyn();
        acc.update(&probs, &arr2(&[[1.0f32, 0.0]]).into_dyn());
        acc.update(&probs, &arr2(&[[0.0f32, 1.0]]).into_dyn());
        assert_eq!(acc.compute(), 0.5);
    }
}
