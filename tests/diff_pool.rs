use ndarray::{arr2, Array2, Array3, ArrayD, Axis};
use rustygnn::asg::Value;
use rustygnn::losses::add_losses;
use rustygnn::nn::{Constraint, DiffPool, DiffPoolConfig};
use rustygnn::optimizers::Sgd;
use rustygnn::runtime::Session;
use rustygnn::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

fn context() -> Rc<RefCell<GraphContext>> {
    Rc::new(RefCell::new(GraphContext::new()))
}

/// Two cliques, of sizes 3 and 2, without self loops.
fn two_cliques() -> Array2<f32> {
    let mut a = Array2::zeros((5, 5));
    for (i, j) in [(0, 1), (0, 2), (1, 2), (3, 4)] {
        a[[i, j]] = 1.0;
        a[[j, i]] = 1.0;
    }
    a
}

fn ring(n: usize) -> Array2<f32> {
    let mut a = Array2::zeros((n, n));
    for i in 0..n {
        a[[i, (i + 1) % n]] = 1.0;
        a[[(i + 1) % n, i]] = 1.0;
    }
    a
}

fn feed(x: ArrayD<f32>, a: ArrayD<f32>) -> HashMap<String, Value> {
    HashMap::from([("x".to_string(), Value::Tensor(x)), ("a".to_string(), Value::Tensor(a))])
}

#[test]
fn test_assignments_are_distributions_in_batch_mode() {
    let ctx = context();
    let x = Tensor::new_input_with_shape(&ctx, "x", &[2, 6, 3]);
    let a = Tensor::new_input_with_shape(&ctx, "a", &[2, 6, 6]);
    let mut pool = DiffPool::new("pool", DiffPoolConfig::new(3).channels(4).return_mask(true)).unwrap();
    let out = pool.call(&x, &a).unwrap();
    let s = out.s.clone().unwrap();

    let mut session = Session::new(&ctx, &[&out.x, &out.a, &s], None).unwrap();
    session.init_parameters(1).unwrap();

    let x_value = ArrayD::from_shape_fn(vec![2, 6, 3], |d| ((d[0] + 2 * d[1] + 3 * d[2]) % 5) as f32 * 0.3);
    let a_value = ndarray::stack![Axis(0), ring(6), Array2::ones((6, 6))].into_dyn();
    let outputs = session.forward(&feed(x_value, a_value)).unwrap();

    assert_eq!(outputs[0].shape(), vec![2, 3, 4]);
    assert_eq!(outputs[1].shape(), vec![2, 3, 3]);
    let s = outputs[2].to_tensor();
    assert_eq!(s.shape(), &[2, 6, 3]);
    for row in s.lanes(Axis(2)) {
        assert!(row.iter().all(|&v| v >= 0.0));
        assert!((row.sum() - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_hard_assignment_counts_cluster_edges() {
    let ctx = context();
    let x = Tensor::new_input_with_shape(&ctx, "x", &[5, 2]);
    let a = Tensor::new_input_with_shape(&ctx, "a", &[5, 5]);
    let mut pool = DiffPool::new("pool", DiffPoolConfig::new(2).channels(1)).unwrap();
    let out = pool.call(&x, &a).unwrap();

    let mut session = Session::new(&ctx, &[&out.x, &out.a, &out.link_loss, &out.entropy_loss], None).unwrap();
    session
        .set_parameters(HashMap::from([
            ("pool.kernel_emb".to_string(), Value::Tensor(ArrayD::ones(vec![2, 1]))),
            ("pool.kernel_pool".to_string(), Value::Tensor(arr2(&[[50.0f32, 0.0], [0.0, 50.0]]).into_dyn())),
        ]))
        .unwrap();

    // Nodes of clique c carry the one-hot feature c.
    let x_value = arr2(&[[1.0f32, 0.0], [1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]]).into_dyn();
    let outputs = session.forward(&feed(x_value, two_cliques().into_dyn())).unwrap();

    let x_pooled = outputs[0].to_tensor();
    assert!((x_pooled[[0, 0]] - 3.0).abs() < 1e-4);
    assert!((x_pooled[[1, 0]] - 2.0).abs() < 1e-4);

    let a_pooled = outputs[1].to_tensor();
    let expected = arr2(&[[6.0f32, 0.0], [0.0, 2.0]]).into_dyn();
    for (got, want) in a_pooled.iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-4, "pooled adjacency {a_pooled:?}");
    }

    // A - S Sᵀ leaves only the missing diagonal.
    let link = outputs[2].as_scalar().unwrap();
    assert!((link - 5.0f32.sqrt()).abs() < 1e-4);
    assert!(outputs[3].as_scalar().unwrap() < 1e-3);
}

#[test]
fn test_mixed_mode_shares_the_adjacency() {
    let ctx = context();
    let x = Tensor::new_input_with_shape(&ctx, "x", &[3, 5, 4]);
    let a = Tensor::new_input_with_shape(&ctx, "a", &[5, 5]);
    let mut pool = DiffPool::new("pool", DiffPoolConfig::new(2)).unwrap();
    let out = pool.call(&x, &a).unwrap();
    assert_eq!(out.x.shape(), Some(vec![3, 2, 4]));
    assert_eq!(out.a.shape(), Some(vec![3, 2, 2]));
    assert_eq!(out.link_loss.shape().map(|s| s.iter().product::<usize>()), Some(1));

    let mut session = Session::new(&ctx, &[&out.x, &out.a], None).unwrap();
    session.init_parameters(3).unwrap();
    let x_value = Array3::from_shape_fn((3, 5, 4), |(b, n, f)| (b + n * f) as f32 * 0.1).into_dyn();
    let outputs = session.forward(&feed(x_value, two_cliques().into_dyn())).unwrap();
    assert_eq!(outputs[1].shape(), vec![3, 2, 2]);
}

#[test]
fn test_training_lowers_auxiliary_losses() {
    let ctx = context();
    let x = Tensor::new_input_with_shape(&ctx, "x", &[1, 5, 2]);
    let a = Tensor::new_input_with_shape(&ctx, "a", &[1, 5, 5]);
    let mut pool = DiffPool::new("pool", DiffPoolConfig::new(2)).unwrap();
    let out = pool.call(&x, &a).unwrap();
    let loss = add_losses(&out.losses()).unwrap();

    let mut session = Session::new(&ctx, &[], Some(&loss)).unwrap();
    session.init_parameters(5).unwrap();
    let x_value = arr2(&[[1.0f32, 0.0], [1.0, 0.2], [0.8, 0.0], [0.0, 1.0], [0.1, 1.0]]).insert_axis(Axis(0)).into_dyn();
    let inputs = feed(x_value, two_cliques().insert_axis(Axis(0)).into_dyn());

    let mut optimizer = Sgd::new(0.05);
    let first = session.forward_backward(&inputs).unwrap();
    session.apply_gradients(&mut optimizer, &first.gradients);
    let mut last = first.loss;
    for _ in 0..60 {
        let step = session.forward_backward(&inputs).unwrap();
        session.apply_gradients(&mut optimizer, &step.gradients);
        last = step.loss;
    }
    assert!(last < first.loss, "loss went from {} to {}", first.loss, last);
}

#[test]
fn test_kernel_constraint_is_applied_after_each_step() {
    let ctx = context();
    let x = Tensor::new_input_with_shape(&ctx, "x", &[1, 5, 2]);
    let a = Tensor::new_input_with_shape(&ctx, "a", &[1, 5, 5]);
    let config = DiffPoolConfig::new(2).kernel_constraint(Constraint::NonNeg);
    let mut pool = DiffPool::new("pool", config).unwrap();
    let out = pool.call(&x, &a).unwrap();
    let loss = add_losses(&out.losses()).unwrap();

    let mut session = Session::new(&ctx, &[], Some(&loss)).unwrap();
    let negative = arr2(&[[-0.5f32, 0.3], [0.2, -0.4]]).into_dyn();
    session
        .set_parameters(HashMap::from([
            ("pool.kernel_emb".to_string(), Value::Tensor(negative.clone())),
            ("pool.kernel_pool".to_string(), Value::Tensor(negative)),
        ]))
        .unwrap();

    let x_value = arr2(&[[1.0f32, 0.0], [1.0, 0.2], [0.8, 0.0], [0.0, 1.0], [0.1, 1.0]]).insert_axis(Axis(0)).into_dyn();
    let inputs = feed(x_value, two_cliques().insert_axis(Axis(0)).into_dyn());
    let mut optimizer = Sgd::new(1.0);
    for _ in 0..5 {
        let step = session.forward_backward(&inputs).unwrap();
        session.apply_gradients(&mut optimizer, &step.gradients);
        for name in ["pool.kernel_emb", "pool.kernel_pool"] {
            let kernel = session.parameters()[name].to_tensor();
            assert_eq!(kernel.shape(), &[2, 2]);
            assert!(kernel.iter().all(|&v| v >= 0.0), "{name} left the constraint set: {kernel:?}");
        }
    }
}
