//! Autograd: builds the graph of gradients d(loss)/d(node).
//!
//! Algorithm:
//!  - walk the forward graph in reverse topological order starting from the loss;
//!  - for every node with an incoming dL/dY, emit the contributions to its
//!    operands and accumulate them by summation;
//!  - the result is a separate ASG whose outputs are the requested gradients.
//!
//! Forward values enter the gradient graph as `External` nodes, so running
//! the gradient graph with the memo of the forward run reuses every
//! intermediate value instead of recomputing it.
//!
//! The forward graph must be shape-inferred: contributions are reduced back
//! to operand shapes (`ReduceSumTo`) wherever broadcasting happened.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, DType, NodeId, NodeType, Shape, Value};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("node {0} has no inferred shape; run shape inference on the forward graph first")]
    MissingShape(NodeId),
    #[error("loss node {node} must hold a single element, got shape {shape:?}")]
    NonScalarLoss { node: NodeId, shape: Shape },
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Builder of the gradient graph for one forward graph.
pub struct Gradients<'a> {
    /// Forward graph.
    src: &'a Asg,
    /// Gradient graph.
    grad: Asg,
    /// Forward node -> accumulated gradient node in `grad`.
    gmap: HashMap<NodeId, NodeId>,
    /// Forward node -> `External` image of its value in `grad`.
    images: HashMap<NodeId, NodeId>,
}

impl<'a> Gradients<'a> {
    pub fn new(src: &'a Asg) -> Self {
        Self {
            src,
            grad: Asg::new(src.id + 1, Some("grad".to_string())),
            gmap: HashMap::new(),
            images: HashMap::new(),
        }
    }

    /// Builds the gradient graph of `loss_id`; its outputs are the
    /// gradients of `wrt`, in order.
    pub fn build(mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        let loss_shape = self.shape_of(loss_id)?;
        if loss_shape.iter().product::<usize>() != 1 {
            return Err(AutogradError::NonScalarLoss { node: loss_id, shape: loss_shape });
        }

        let order = ShapeInference::topological_sort_from(self.src, &[loss_id])?;
        let seed = self.lit_ones(&loss_shape);
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let g_out = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => continue,
            };
            let node_type = self.src.get_node(id)?.node_type.clone();
            self.backprop_node(id, &node_type, g_out)?;
        }

        let mut outputs = Vec::with_capacity(wrt.len());
        for &target in wrt {
            let g = match self.gmap.get(&target).copied() {
                Some(g) => g,
                None => {
                    let shape = self.shape_of(target)?;
                    self.lit_zeros(&shape)
                }
            };
            outputs.push(g);
        }

        // Gradients of named leaves carry the same name as their source.
        for (&target, &g) in wrt.iter().zip(outputs.iter()) {
            if let NodeType::Input { name } | NodeType::Parameter { name } = &self.src.get_node(target)?.node_type {
                self.grad.get_node_mut(g)?.name = Some(name.clone());
            }
        }

        debug!(
            forward_nodes = self.src.nodes.len(),
            grad_nodes = self.grad.nodes.len(),
            "built gradient graph"
        );
        self.grad.set_outputs(outputs);
        Ok(self.grad)
    }

    /// Builds the gradient graph and shape-infers it.
    pub fn build_and_infer(self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        let mut grad = self.build(loss_id, wrt)?;
        ShapeInference::run(&mut grad, &HashMap::new())?;
        Ok(grad)
    }

    fn backprop_node(&mut self, id: NodeId, node_type: &NodeType, g: NodeId) -> AutogradResult<()> {
        match node_type {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => {}

            // -------- binary --------
            NodeType::Add(a, b) => {
                self.acc_reduced(*a, g)?;
                self.acc_reduced(*b, g)?;
            }
            NodeType::Subtract(a, b) => {
                self.acc_reduced(*a, g)?;
                let neg = self.add_node(NodeType::Negate(g));
                self.acc_reduced(*b, neg)?;
            }
            NodeType::Multiply(a, b) => {
                if self.wants_grad(*a)? {
                    let b_im = self.reuse(*b)?;
                    let g_a = self.add_node(NodeType::Multiply(g, b_im));
                    self.acc_reduced(*a, g_a)?;
                }
                if self.wants_grad(*b)? {
                    let a_im = self.reuse(*a)?;
                    let g_b = self.add_node(NodeType::Multiply(g, a_im));
                    self.acc_reduced(*b, g_b)?;
                }
            }
            NodeType::Divide(a, b) => {
                let b_im = self.reuse(*b)?;
                if self.wants_grad(*a)? {
                    let g_a = self.add_node(NodeType::Divide(g, b_im));
                    self.acc_reduced(*a, g_a)?;
                }
                if self.wants_grad(*b)? {
                    // g_b = -g * a / b^2
                    let a_im = self.reuse(*a)?;
                    let num = self.add_node(NodeType::Multiply(g, a_im));
                    let b2 = self.add_node(NodeType::Multiply(b_im, b_im));
                    let q = self.add_node(NodeType::Divide(num, b2));
                    let g_b = self.add_node(NodeType::Negate(q));
                    self.acc_reduced(*b, g_b)?;
                }
            }
            NodeType::Power(a, b) => {
                if self.wants_grad(*a)? {
                    // g * b * a^(b-1)
                    let a_im = self.reuse(*a)?;
                    let b_im = self.reuse(*b)?;
                    let one = self.lit_scalar(1.0);
                    let b_minus_one = self.add_node(NodeType::Subtract(b_im, one));
                    let a_pow = self.add_node(NodeType::Power(a_im, b_minus_one));
                    let term = self.add_node(NodeType::Multiply(b_im, a_pow));
                    let g_a = self.add_node(NodeType::Multiply(g, term));
                    self.acc_reduced(*a, g_a)?;
                }
                if self.wants_grad(*b)? {
                    // g * a^b * ln(a)
                    let y = self.reuse(id)?;
                    let a_im = self.reuse(*a)?;
                    let ln_a = self.add_node(NodeType::Log(a_im));
                    let term = self.add_node(NodeType::Multiply(y, ln_a));
                    let g_b = self.add_node(NodeType::Multiply(g, term));
                    self.acc_reduced(*b, g_b)?;
                }
            }
            NodeType::MatrixMultiply(a, b) => {
                if self.wants_grad(*a)? {
                    // g_a = g @ b^T
                    let rb = self.shape_of(*b)?.len();
                    let b_im = self.reuse(*b)?;
                    let bt = self.add_node(NodeType::Transpose(b_im, rb - 2, rb - 1));
                    let g_a = self.add_node(NodeType::MatrixMultiply(g, bt));
                    self.acc_reduced(*a, g_a)?;
                }
                if self.wants_grad(*b)? {
                    // g_b = a^T @ g
                    let ra = self.shape_of(*a)?.len();
                    let a_im = self.reuse(*a)?;
                    let at = self.add_node(NodeType::Transpose(a_im, ra - 2, ra - 1));
                    let g_b = self.add_node(NodeType::MatrixMultiply(at, g));
                    self.acc_reduced(*b, g_b)?;
                }
            }
            NodeType::GreaterThan(_, _) => {}

            // -------- unary --------
            NodeType::Negate(x) => {
                let g_x = self.add_node(NodeType::Negate(g));
                self.acc(*x, g_x)?;
            }
            NodeType::Exp(x) => {
                let y = self.reuse(id)?;
                let g_x = self.add_node(NodeType::Multiply(g, y));
                self.acc(*x, g_x)?;
            }
            NodeType::Log(x) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Divide(g, x_im));
                self.acc(*x, g_x)?;
            }
            NodeType::Sqrt(x) => {
                let y = self.reuse(id)?;
                let two = self.lit_scalar(2.0);
                let denom = self.add_node(NodeType::Multiply(two, y));
                let g_x = self.add_node(NodeType::Divide(g, denom));
                self.acc(*x, g_x)?;
            }
            NodeType::Abs(x) => {
                // sign(x) = [x > 0] - [-x > 0]
                let x_im = self.reuse(*x)?;
                let zero = self.lit_scalar(0.0);
                let pos = self.add_node(NodeType::GreaterThan(x_im, zero));
                let neg_x = self.add_node(NodeType::Negate(x_im));
                let neg = self.add_node(NodeType::GreaterThan(neg_x, zero));
                let sign = self.add_node(NodeType::Subtract(pos, neg));
                let g_x = self.add_node(NodeType::Multiply(g, sign));
                self.acc(*x, g_x)?;
            }
            NodeType::ReLU(x) => {
                let x_im = self.reuse(*x)?;
                let zero = self.lit_scalar(0.0);
                let mask = self.add_node(NodeType::GreaterThan(x_im, zero));
                let g_x = self.add_node(NodeType::Multiply(g, mask));
                self.acc(*x, g_x)?;
            }
            NodeType::Sigmoid(x) => {
                let y = self.reuse(id)?;
                let one = self.lit_scalar(1.0);
                let one_minus = self.add_node(NodeType::Subtract(one, y));
                let term = self.add_node(NodeType::Multiply(y, one_minus));
                let g_x = self.add_node(NodeType::Multiply(g, term));
                self.acc(*x, g_x)?;
            }
            NodeType::Tanh(x) => {
                let y = self.reuse(id)?;
                let y2 = self.add_node(NodeType::Multiply(y, y));
                let one = self.lit_scalar(1.0);
                let term = self.add_node(NodeType::Subtract(one, y2));
                let g_x = self.add_node(NodeType::Multiply(g, term));
                self.acc(*x, g_x)?;
            }
            NodeType::Softmax(x) => {
                // dx = y * (g - sum(g * y, -1))
                let y = self.reuse(id)?;
                let gy = self.add_node(NodeType::Multiply(g, y));
                let dot = self.add_node(NodeType::SumAxis(gy, -1));
                let centered = self.add_node(NodeType::Subtract(g, dot));
                let g_x = self.add_node(NodeType::Multiply(y, centered));
                self.acc(*x, g_x)?;
            }

            // -------- reductions --------
            NodeType::Sum(x) | NodeType::SumAxis(x, _) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(g, x_im));
                self.acc(*x, g_x)?;
            }
            NodeType::Mean(x) => {
                let n = self.shape_of(*x)?.iter().product::<usize>().max(1) as f32;
                let inv_n = self.lit_scalar(1.0 / n);
                let scaled = self.add_node(NodeType::Multiply(g, inv_n));
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(scaled, x_im));
                self.acc(*x, g_x)?;
            }
            NodeType::MeanAxis(x, axis) => {
                let shape = self.shape_of(*x)?;
                let ax = ShapeInference::normalize_axis(*axis, shape.len()).ok_or(AsgError::InvalidShape(*x))?;
                let inv_n = self.lit_scalar(1.0 / shape[ax].max(1) as f32);
                let scaled = self.add_node(NodeType::Multiply(g, inv_n));
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(scaled, x_im));
                self.acc(*x, g_x)?;
            }

            // -------- transformations --------
            NodeType::Reshape(x, _) => {
                let shape = self.shape_of(*x)?;
                let target = self.lit_shape(&shape);
                let g_x = self.add_node(NodeType::Reshape(g, target));
                self.acc(*x, g_x)?;
            }
            NodeType::Transpose(x, a1, a2) => {
                let g_x = self.add_node(NodeType::Transpose(g, *a1, *a2));
                self.acc(*x, g_x)?;
            }
            NodeType::Broadcast(x, _) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::ReduceSumTo(g, x_im));
                self.acc(*x, g_x)?;
            }
            NodeType::ReduceSumTo(x, _) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(g, x_im));
                self.acc(*x, g_x)?;
            }
        }
        Ok(())
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::ScalarF32(v)))
    }

    fn lit_ones(&mut self, shape: &[usize]) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::Tensor(ArrayD::ones(IxDyn(shape)))))
    }

    fn lit_zeros(&mut self, shape: &[usize]) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::Tensor(ArrayD::zeros(IxDyn(shape)))))
    }

    fn lit_shape(&mut self, shape: &[usize]) -> NodeId {
        let data: Vec<f32> = shape.iter().map(|&d| d as f32).collect();
        let arr = ArrayD::from_shape_vec(IxDyn(&[data.len()]), data)
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])));
        self.grad.add_node(None, NodeType::Literal(Value::Tensor(arr)))
    }

    fn shape_of(&self, src_id: NodeId) -> AutogradResult<Shape> {
        self.src
            .get_node(src_id)?
            .shape
            .clone()
            .ok_or(AutogradError::MissingShape(src_id))
    }

    /// `External` image of a forward value inside the gradient graph.
    fn reuse(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&existing) = self.images.get(&src_id) {
            return Ok(existing);
        }
        let src = self.src.get_node(src_id)?;
        let shape = src.shape.clone().ok_or(AutogradError::MissingShape(src_id))?;
        let dtype = src.dtype.unwrap_or(DType::F32);
        let name = format!("external_{}_{}", self.src.id, src_id);
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External { name, source_asg_id: self.src.id, source_node_id: src_id },
        );
        let node = self.grad.get_node_mut(id)?;
        node.shape = Some(shape);
        node.dtype = Some(dtype);
        self.images.insert(src_id, id);
        Ok(id)
    }

    /// Literals and constants of the gradient graph need no gradient.
    fn wants_grad(&self, src_id: NodeId) -> AutogradResult<bool> {
        Ok(!matches!(
            self.src.get_node(src_id)?.node_type,
            NodeType::Literal(_) | NodeType::External { .. }
        ))
    }

    /// dL/d(target) += contrib
    fn acc(&mut self, target: NodeId, contrib: NodeId) -> AutogradResult<()> {
        if !self.wants_grad(target)? {
            return Ok(());
        }
        let total = match self.gmap.get(&target).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contrib)),
            None => contrib,
        };
        self.gmap.insert(target, total);
        Ok(())
    }

    /// Accumulates `contrib` summed down to the shape of `target`.
    fn acc_reduced(&mut self, target: NodeId, contrib: NodeId) -> AutogradResult<()> {
        if !self.wants_grad(target)? {
            return Ok(());
        }
        let target_im = self.reuse(target)?;
        let reduced = self.add_node(NodeType::ReduceSumTo(contrib, target_im));
        self.acc(target, reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::backend::{Backend, Memo};
    use crate::runtime::cpu_backend::CpuBackend;
    use crate::tensor::{GraphContext, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_gradient_of_sum_of_squares() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input_with_shape(&context, "x", &[3]);
        let loss = (&x * &x).sum();

        let mut forward = context.borrow().main_graph().clone();
        forward.set_output(loss.node_id);
        let grad = Gradients::new(&forward).build_and_infer(loss.node_id, &[x.node_id]).unwrap();
        assert_eq!(grad.get_node(grad.outputs[0]).unwrap().shape, Some(vec![3]));

        let backend = CpuBackend::new();
        let mut memo: Memo<Value> = HashMap::new();
        let data = ndarray::arr1(&[1.0f32, -2.0, 3.0]).into_dyn();
        memo.insert((forward.id, x.node_id), Value::Tensor(data));
        let (_, memo) = backend.run(&forward, memo).unwrap();
        let (grads, _) = backend.run(&grad, memo).unwrap();
        let g: Vec<f32> = grads[0].to_tensor().iter().copied().collect();
        assert_eq!(g, vec![2.0, -4.0, 6.0]);
    }

    #[test]
    fn test_unreached_parameter_gets_zero_gradient() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input_with_shape(&context, "x", &[2]);
        let unused = Tensor::new_input_with_shape(&context, "unused", &[4]);
        let loss = x.sum();

        let forward = context.borrow().main_graph().clone();
        let grad = Gradients::new(&forward).build(loss.node_id, &[unused.node_id]).unwrap();
        let node = grad.get_node(grad.outputs[0]).unwrap();
        assert_eq!(node.shape, Some(vec![4]));
        assert_eq!(node.name.as_deref(), Some("unused"));
    }

    #[test]
    fn test_non_scalar_loss_is_rejected() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input_with_shape(&context, "x", &[2]);
        let y = x.relu();
        let forward = context.borrow().main_graph().clone();
        let err = Gradients::new(&forward).build(y.node_id, &[x.node_id]).unwrap_err();
        assert!(matches!(err, AutogradError::NonScalarLoss { .. }));
    }
}
