//! Loss functions in the graph paradigm.
//!
//! Each loss is a plain function that takes symbolic `Tensor` handles and
//! appends the nodes computing the error value to the graph.

use crate::tensor::Tensor;

/// Sum of squared errors.
///
/// Formula: `sum((y_pred - y_true)^2)`.
pub fn mse_loss(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    let error = y_pred - y_true;
    (&error * &error).sum()
}

/// Mean squared error.
///
/// Formula: `mean((y_pred - y_true)^2)`.
pub fn mse_loss_mean(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    let error = y_pred - y_true;
    (&error * &error).mean()
}

/// Categorical cross-entropy on probabilities, averaged over samples.
///
/// Formula: `mean_samples(-sum_classes(y_true * log(y_pred + eps)))`.
///
/// # Arguments
///
/// * `y_pred` - Predicted probabilities (after softmax), classes on the last axis.
/// * `y_true` - One-hot labels with the same shape.
/// * `eps` - Small value keeping the logarithm finite.
pub fn categorical_crossentropy(y_pred: &Tensor, y_true: &Tensor, eps: f32) -> Tensor {
    let log_pred = y_pred.add_scalar(eps).log();
    let per_sample = (y_true * &log_pred).sum_axis(-1);
    -&per_sample.mean()
}

/// Sum of several scalar losses; `None` for an empty list.
pub fn add_losses(losses: &[Tensor]) -> Option<Tensor> {
    let (first, rest) = losses.split_first()?;
    Some(rest.iter().fold(first.clone(), |acc, l| &acc + l))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::Session;
    use crate::tensor::GraphContext;
    use ndarray::arr2;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn eval(context: &Rc<RefCell<GraphContext>>, out: &Tensor, feed: HashMap<String, Value>) -> f32 {
        let session = Session::new(context, &[out], None).unwrap();
        session.forward(&feed).unwrap()[0].as_scalar().unwrap()
    }

    #[test]
    fn test_mse_variants() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let p = Tensor::new_input_with_shape(&context, "p", &[2, 2]);
        let t = Tensor::new_input_with_shape(&context, "t", &[2, 2]);
        let sum = mse_loss(&p, &t);
        let mean = mse_loss_mean(&p, &t);

        let mut feed = HashMap::new();
        feed.insert("p".to_string(), Value::Tensor(arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn()));
        feed.insert("t".to_string(), Value::Tensor(arr2(&[[1.0f32, 0.0], [3.0, 0.0]]).into_dyn()));
        assert!((eval(&context, &sum, feed.clone()) - 20.0).abs() < 1e-5);
        assert!((eval(&context, &mean, feed) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_crossentropy_of_confident_prediction() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let p = Tensor::new_input_with_shape(&context, "p", &[2, 2]);
        let t = Tensor::new_input_with_shape(&context, "t", &[2, 2]);
        let ce = categorical_crossentropy(&p, &t, 1e-7);

        let mut feed = HashMap::new();
        feed.insert("p".to_string(), Value::Tensor(arr2(&[[1.0f32, 0.0], [0.5, 0.5]]).into_dyn()));
        feed.insert("t".to_string(), Value::Tensor(arr2(&[[1.0f32, 0.0], [0.0, 1.0]]).into_dyn()));
        let expected = (0.0 + 2.0f32.ln()) / 2.0;
        assert!((eval(&context, &ce, feed) - expected).abs() < 1e-4);
    }

    #[test]
    fn test_add_losses() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        assert!(add_losses(&[]).is_none());
        let total = add_losses(&[Tensor::scalar(&context, 1.5), Tensor::scalar(&context, 2.0)]).unwrap();
        assert!((eval(&context, &total, HashMap::new()) - 3.5).abs() < 1e-6);
    }
}
