//! `Tensor` and `GraphContext`.
//!
//! A `Tensor` is not a data container. It is a lightweight handle naming a
//! node of the abstract semantic graph (ASG) owned by a `GraphContext`.
//! Operations on tensors do not compute anything; they append nodes to the
//! graph.
//!
//! Every new node goes through eager shape inference, so a layer can ask
//! `tensor.shape()` while it is still wiring the graph.

use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, DType, NodeId, NodeType, Shape, Value};
use crate::nn::init::{Constraint, Initializer, InitError};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;
use tracing::{debug, warn};

/// How a trainable parameter is created and kept in range.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub shape: Shape,
    pub initializer: Initializer,
    pub constraint: Option<Constraint>,
}

impl ParameterSpec {
    pub fn new(shape: Shape, initializer: Initializer) -> Self {
        Self { shape, initializer, constraint: None }
    }

    pub fn with_constraint(mut self, constraint: Option<Constraint>) -> Self {
        self.constraint = constraint;
        self
    }

    /// Fresh value drawn from the initializer, projected by the constraint.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ArrayD<f32>, InitError> {
        let mut data = self.initializer.sample(&self.shape, rng)?;
        if let Some(constraint) = &self.constraint {
            constraint.apply(&mut data);
        }
        Ok(data)
    }
}

/// Owns the graph under construction and the registry of its parameters.
///
/// Shared between tensor handles through `Rc<RefCell<_>>`.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    parameters: BTreeMap<String, ParameterSpec>,
}

impl GraphContext {
    /// Creates a new, empty graph context.
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
            parameters: BTreeMap::new(),
        }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    /// Appends a node and infers its shape when all operands are shaped.
    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let id = self.main_graph.add_node(name, node_type);
        let inferred = self
            .main_graph
            .get_node(id)
            .ok()
            .and_then(|node| ShapeInference::infer_node_shape(&self.main_graph, node, &HashMap::new()).ok());
        if let (Some((shape, dtype)), Ok(node)) = (inferred, self.main_graph.get_node_mut(id)) {
            node.shape = Some(shape);
            node.dtype = Some(dtype);
        }
        id
    }

    pub fn register_parameter(&mut self, name: &str, spec: ParameterSpec) {
        if self.parameters.insert(name.to_string(), spec).is_some() {
            warn!(parameter = name, "parameter registered twice; keeping the latest spec");
        }
    }

    pub fn parameter_spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.get(name)
    }

    pub fn parameter_specs(&self) -> &BTreeMap<String, ParameterSpec> {
        &self.parameters
    }

    /// Samples a fresh value for every registered parameter.
    pub fn init_parameters<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<HashMap<String, Value>, InitError> {
        let mut values = HashMap::with_capacity(self.parameters.len());
        for (name, spec) in &self.parameters {
            let data = spec.sample(rng)?;
            debug!(parameter = %name, shape = ?spec.shape, "initialized parameter");
            values.insert(name.clone(), Value::Tensor(data));
        }
        Ok(values)
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle representing one node of the ASG.
///
/// Holds no data: only the node id and the context the node lives in.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Id of the node this tensor stands for.
    pub node_id: NodeId,
    /// Shared context the graph is built in.
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates an `Input` node without a known shape.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let node_id = {
            let mut ctx = context.borrow_mut();
            let id = ctx.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
            ctx.main_graph_mut().inputs.push(id);
            id
        };
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates an `Input` node with a static shape, so downstream shapes are inferred.
    pub fn new_input_with_shape(context: &Rc<RefCell<GraphContext>>, name: &str, shape: &[usize]) -> Self {
        let tensor = Self::new_input(context, name);
        tensor.set_shape(shape.to_vec());
        tensor
    }

    /// Creates a `Parameter` node with no registered spec.
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .add_node(Some(name.to_string()), NodeType::Parameter { name: name.to_string() });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a `Parameter` node and registers how to initialize it.
    pub fn new_parameter_with(context: &Rc<RefCell<GraphContext>>, name: &str, spec: ParameterSpec) -> Self {
        let tensor = Self::new_parameter(context, name);
        tensor.set_shape(spec.shape.clone());
        context.borrow_mut().register_parameter(name, spec);
        tensor
    }

    /// Constant embedded directly in the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        let node_id = context.borrow_mut().add_node(None, NodeType::Literal(Value::ScalarF32(value)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// `n x n` identity literal.
    pub fn eye(context: &Rc<RefCell<GraphContext>>, n: usize) -> Self {
        let eye = ndarray::Array2::<f32>::eye(n).into_dyn();
        Self::new_literal(context, eye, &format!("eye_{}", n))
    }

    fn set_shape(&self, shape: Shape) {
        let mut ctx = self.context.borrow_mut();
        if let Ok(node) = ctx.main_graph_mut().get_node_mut(self.node_id) {
            node.shape = Some(shape);
            node.dtype = Some(DType::F32);
        }
    }

    /// Static shape of this node, if it could be inferred.
    pub fn shape(&self) -> Option<Shape> {
        self.context
            .borrow()
            .main_graph()
            .get_node(self.node_id)
            .ok()
            .and_then(|n| n.shape.clone())
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape().map(|s| s.len())
    }

    fn derive(&self, node_type: NodeType) -> Tensor {
        let node_id = self.context.borrow_mut().add_node(None, node_type);
        Tensor { node_id, context: Rc::clone(&self.context) }
    }

    // --- Math ---

    pub fn pow(&self, power: &Tensor) -> Self {
        self.derive(NodeType::Power(self.node_id, power.node_id))
    }

    pub fn pow_scalar(&self, power: f32) -> Self {
        let p = Tensor::scalar(&self.context, power);
        self.pow(&p)
    }

    /// Matrix product; batched over leading axes.
    pub fn dot(&self, other: &Tensor) -> Self {
        self.derive(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn add_scalar(&self, value: f32) -> Self {
        let v = Tensor::scalar(&self.context, value);
        self + &v
    }

    pub fn mul_scalar(&self, value: f32) -> Self {
        let v = Tensor::scalar(&self.context, value);
        self * &v
    }

    pub fn exp(&self) -> Self {
        self.derive(NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.derive(NodeType::Log(self.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.derive(NodeType::Sqrt(self.node_id))
    }

    pub fn abs(&self) -> Self {
        self.derive(NodeType::Abs(self.node_id))
    }

    pub fn greater_than(&self, other: &Tensor) -> Self {
        self.derive(NodeType::GreaterThan(self.node_id, other.node_id))
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.derive(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.derive(NodeType::Sigmoid(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.derive(NodeType::Tanh(self.node_id))
    }

    /// Softmax over the last axis.
    pub fn softmax(&self) -> Self {
        self.derive(NodeType::Softmax(self.node_id))
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.derive(NodeType::Sum(self.node_id))
    }

    pub fn mean(&self) -> Self {
        self.derive(NodeType::Mean(self.node_id))
    }

    /// Sum over `axis`, keeping it with length 1.
    pub fn sum_axis(&self, axis: isize) -> Self {
        self.derive(NodeType::SumAxis(self.node_id, axis))
    }

    /// Mean over `axis`, keeping it with length 1.
    pub fn mean_axis(&self, axis: isize) -> Self {
        self.derive(NodeType::MeanAxis(self.node_id, axis))
    }

    /// Frobenius norm over the last two axes, shape `[.., 1, 1]`.
    pub fn frobenius_norm(&self) -> Self {
        (self * self).sum_axis(-1).sum_axis(-2).sqrt()
    }

    // --- Transformations ---

    pub fn reshape(&self, shape: &[usize]) -> Self {
        let shape_data = ArrayD::from_shape_vec(IxDyn(&[shape.len()]), shape.iter().map(|&d| d as f32).collect())
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])));
        let shape_node = Tensor::new_literal(&self.context, shape_data, "shape");
        self.derive(NodeType::Reshape(self.node_id, shape_node.node_id))
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.derive(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// Swaps the last two axes of a tensor of the given rank.
    pub fn transpose_last(&self, rank: usize) -> Self {
        self.transpose(rank.saturating_sub(2), rank.saturating_sub(1))
    }

    pub fn broadcast_to(&self, target: &Tensor) -> Self {
        self.derive(NodeType::Broadcast(self.node_id, target.node_id))
    }

    pub fn reduce_sum_to(&self, target: &Tensor) -> Self {
        self.derive(NodeType::ReduceSumTo(self.node_id, target.node_id))
    }
}

// Operators for `&a + &b` style graph building.

impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Add(self.node_id, rhs.node_id))
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Subtract(self.node_id, rhs.node_id))
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Multiply(self.node_id, rhs.node_id))
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Divide(self.node_id, rhs.node_id))
    }
}

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Self::Output {
        self.derive(NodeType::Negate(self.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Rc<RefCell<GraphContext>> {
        Rc::new(RefCell::new(GraphContext::new()))
    }

    #[test]
    fn shapes_flow_through_eager_inference() {
        let context = ctx();
        let x = Tensor::new_input_with_shape(&context, "x", &[4, 3]);
        let w = Tensor::new_parameter_with(&context, "w", ParameterSpec::new(vec![3, 2], Initializer::default()));
        let y = x.dot(&w).softmax();
        assert_eq!(y.shape(), Some(vec![4, 2]));
        assert_eq!(y.sum_axis(-1).shape(), Some(vec![4, 1]));
        assert_eq!(y.frobenius_norm().shape(), Some(vec![1, 1]));
        assert_eq!(y.transpose_last(2).shape(), Some(vec![2, 4]));
    }

    #[test]
    fn unshaped_inputs_leave_shapes_unknown() {
        let context = ctx();
        let x = Tensor::new_input(&context, "x");
        assert_eq!(x.relu().shape(), None);
    }

    #[test]
    fn init_parameters_uses_registered_specs() {
        let context = ctx();
        Tensor::new_parameter_with(&context, "w", ParameterSpec::new(vec![3, 2], Initializer::Ones));
        Tensor::new_parameter_with(&context, "b", ParameterSpec::new(vec![2], Initializer::Zeros));
        let mut rng = rand::thread_rng();
        let values = context.borrow().init_parameters(&mut rng).unwrap();
        assert_eq!(values["w"].to_tensor().sum(), 6.0);
        assert_eq!(values["b"].shape(), vec![2]);
    }
}
