//! Metrics for evaluating models outside the graph.
//!
//! Metrics accumulate over batches: call `update` per batch, `compute` at the
//! end of an epoch, then `reset`.
//!
//! ```
//! use rustygnn::metrics::{Accuracy, Metric};
//! use ndarray::arr2;
//!
//! let mut accuracy = Accuracy::new();
//! let probs = arr2(&[[0.9f32, 0.1], [0.2, 0.8]]).into_dyn();
//! let labels = arr2(&[[1.0f32, 0.0], [1.0, 0.0]]).into_dyn();
//! accuracy.update(&probs, &labels);
//! assert_eq!(accuracy.compute(), 0.5);
//! ```

pub mod classification;
pub mod running;

pub use classification::Accuracy;
pub use running::RunningMean;

pub trait Metric: Send + Sync {
    type Prediction;
    type Target;
    type Output;

    /// Adds one batch to the running state.
    fn update(&mut self, predictions: &Self::Prediction, targets: &Self::Target);

    fn compute(&self) -> Self::Output;

    fn reset(&mut self);

    fn name(&self) -> &str;
}
