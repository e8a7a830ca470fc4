//! CPU backend for executing an ASG.
//!
//! Walks the graph in topological order and evaluates each node with
//! `ndarray`, following numpy broadcasting rules.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, NodeId, NodeType, Value};
use ndarray::{ArrayD, Axis, Ix2, IxDyn, Zip};
use std::collections::HashMap;
use tracing::debug;

type OpResult = Result<ArrayD<f32>, RuntimeError>;

/// Execution state of one graph run.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    /// Values computed so far, including those of linked graphs.
    memo: Memo<Value>,
}

impl<'a> ExecutionContext<'a> {
    fn new(asg: &'a Asg, initial_memo: Memo<Value>) -> Self {
        Self { asg, memo: initial_memo }
    }

    fn operand(&self, node_id: NodeId) -> OpResult {
        self.memo
            .get(&(self.asg.id, node_id))
            .map(Value::to_tensor)
            .ok_or(RuntimeError::NodeNotFound(node_id, self.asg.id))
    }

    /// Evaluates one node; operands must already be in the memo.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<(), RuntimeError> {
        if self.memo.contains_key(&(self.asg.id, node_id)) {
            return Ok(());
        }

        let node = self
            .asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, self.asg.id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => {
                return Err(RuntimeError::MissingInput(name.clone(), node.id));
            }
            NodeType::Parameter { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id));
            }
            NodeType::Literal(value) => value.to_tensor(),
            NodeType::External { source_asg_id, source_node_id, .. } => self
                .memo
                .get(&(*source_asg_id, *source_node_id))
                .map(Value::to_tensor)
                .ok_or(RuntimeError::NodeNotFound(*source_node_id, *source_asg_id))?,

            NodeType::Add(l, r) => op_binary(&self.operand(*l)?, &self.operand(*r)?, |a, b| a + b)?,
            NodeType::Subtract(l, r) => op_binary(&self.operand(*l)?, &self.operand(*r)?, |a, b| a - b)?,
            NodeType::Multiply(l, r) => op_binary(&self.operand(*l)?, &self.operand(*r)?, |a, b| a * b)?,
            NodeType::Divide(l, r) => op_binary(&self.operand(*l)?, &self.operand(*r)?, |a, b| a / b)?,
            NodeType::Power(l, r) => op_binary(&self.operand(*l)?, &self.operand(*r)?, f32::powf)?,
            NodeType::GreaterThan(l, r) => {
                op_binary(&self.operand(*l)?, &self.operand(*r)?, |a, b| if a > b { 1.0 } else { 0.0 })?
            }
            NodeType::MatrixMultiply(l, r) => op_matmul(&self.operand(*l)?, &self.operand(*r)?)?,

            NodeType::Negate(x) => self.operand(*x)?.mapv(|v| -v),
            NodeType::Exp(x) => self.operand(*x)?.mapv(f32::exp),
            NodeType::Log(x) => self.operand(*x)?.mapv(f32::ln),
            NodeType::Sqrt(x) => self.operand(*x)?.mapv(f32::sqrt),
            NodeType::Abs(x) => self.operand(*x)?.mapv(f32::abs),
            NodeType::ReLU(x) => self.operand(*x)?.mapv(|v| v.max(0.0)),
            NodeType::Sigmoid(x) => self.operand(*x)?.mapv(|v| 1.0 / (1.0 + (-v).exp())),
            NodeType::Tanh(x) => self.operand(*x)?.mapv(f32::tanh),
            NodeType::Softmax(x) => op_softmax(self.operand(*x)?)?,

            NodeType::Sum(x) => ndarray::arr0(self.operand(*x)?.sum()).into_dyn(),
            NodeType::Mean(x) => {
                let operand = self.operand(*x)?;
                let mean = operand
                    .mean()
                    .ok_or_else(|| RuntimeError::ComputationError("mean of an empty tensor".to_string()))?;
                ndarray::arr0(mean).into_dyn()
            }
            NodeType::SumAxis(x, axis) => {
                let operand = self.operand(*x)?;
                let ax = resolve_axis(*axis, operand.ndim())?;
                operand.sum_axis(ax).insert_axis(ax)
            }
            NodeType::MeanAxis(x, axis) => {
                let operand = self.operand(*x)?;
                let ax = resolve_axis(*axis, operand.ndim())?;
                operand
                    .mean_axis(ax)
                    .ok_or_else(|| RuntimeError::ComputationError("mean over an empty axis".to_string()))?
                    .insert_axis(ax)
            }

            NodeType::Reshape(x, shape) => {
                let target: Vec<usize> = self.operand(*shape)?.iter().map(|&d| d as usize).collect();
                op_reshape(&self.operand(*x)?, &target)?
            }
            NodeType::Transpose(x, a1, a2) => op_transpose(self.operand(*x)?, *a1, *a2)?,
            NodeType::Broadcast(x, target) => {
                let target_shape = self.operand(*target)?.shape().to_vec();
                let operand = self.operand(*x)?;
                operand
                    .broadcast(IxDyn(&target_shape))
                    .ok_or_else(|| {
                        RuntimeError::ShapeError(format!("cannot broadcast {:?} to {:?}", operand.shape(), target_shape))
                    })?
                    .to_owned()
            }
            NodeType::ReduceSumTo(x, target) => {
                let target_shape = self.operand(*target)?.shape().to_vec();
                op_reduce_sum_to(self.operand(*x)?, &target_shape)?
            }
        };

        self.memo.insert((self.asg.id, node_id), Value::Tensor(result));
        Ok(())
    }
}

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort_from(main_asg, &main_asg.outputs)
            .map_err(|e| RuntimeError::ShapeError(format!("topological sort failed: {}", e)))?;
        debug!(graph = main_asg.id, nodes = sorted_nodes.len(), "running graph on cpu");

        let mut context = ExecutionContext::new(main_asg, initial_memo);
        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let mut results = Vec::with_capacity(main_asg.outputs.len());
        for output_node_id in &main_asg.outputs {
            let result = context
                .memo
                .get(&(main_asg.id, *output_node_id))
                .ok_or(RuntimeError::NodeNotFound(*output_node_id, main_asg.id))?
                .clone();
            results.push(result);
        }
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

fn resolve_axis(axis: isize, rank: usize) -> Result<Axis, RuntimeError> {
    ShapeInference::normalize_axis(axis, rank)
        .map(Axis)
        .ok_or_else(|| RuntimeError::ShapeError(format!("axis {} out of range for rank {}", axis, rank)))
}

/// Elementwise binary op with numpy broadcasting.
fn op_binary(a: &ArrayD<f32>, b: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> OpResult {
    let shape = ShapeInference::broadcast_shapes(a.shape(), b.shape())
        .ok_or_else(|| RuntimeError::ShapeError(format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape())))?;
    let dim = IxDyn(&shape);
    let av = a
        .broadcast(dim.clone())
        .ok_or_else(|| RuntimeError::ShapeError(format!("cannot broadcast {:?} to {:?}", a.shape(), shape)))?;
    let bv = b
        .broadcast(dim)
        .ok_or_else(|| RuntimeError::ShapeError(format!("cannot broadcast {:?} to {:?}", b.shape(), shape)))?;
    Ok(Zip::from(av).and(bv).map_collect(|&x, &y| f(x, y)))
}

/// `[.., m, k] x [.., k, n]`; batch prefixes broadcast.
fn op_matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> OpResult {
    let out_shape = ShapeInference::matmul_shape(a.shape(), b.shape()).ok_or_else(|| {
        RuntimeError::ShapeError(format!("cannot multiply {:?} by {:?}", a.shape(), b.shape()))
    })?;
    let to_2d = |e: ndarray::ShapeError| RuntimeError::ShapeError(e.to_string());

    if a.ndim() == 2 && b.ndim() == 2 {
        let a2 = a.view().into_dimensionality::<Ix2>().map_err(to_2d)?;
        let b2 = b.view().into_dimensionality::<Ix2>().map_err(to_2d)?;
        return Ok(a2.dot(&b2).into_dyn());
    }

    let rank = out_shape.len();
    let (m, n) = (out_shape[rank - 2], out_shape[rank - 1]);
    let k = a.shape()[a.ndim() - 1];
    let batch = &out_shape[..rank - 2];
    let batch_size: usize = batch.iter().product();

    let stack = |x: &ArrayD<f32>, rows: usize, cols: usize| -> OpResult {
        let mut full = batch.to_vec();
        full.extend([rows, cols]);
        let view = x
            .broadcast(IxDyn(&full))
            .ok_or_else(|| RuntimeError::ShapeError(format!("cannot broadcast {:?} to {:?}", x.shape(), full)))?;
        ArrayD::from_shape_vec(IxDyn(&[batch_size, rows, cols]), view.iter().copied().collect())
            .map_err(|e| RuntimeError::ShapeError(e.to_string()))
    };
    let a3 = stack(a, m, k)?;
    let b3 = stack(b, k, n)?;

    let mut out = Vec::with_capacity(batch_size * m * n);
    for i in 0..batch_size {
        let ai = a3.index_axis(Axis(0), i).into_dimensionality::<Ix2>().map_err(to_2d)?;
        let bi = b3.index_axis(Axis(0), i).into_dimensionality::<Ix2>().map_err(to_2d)?;
        out.extend(ai.dot(&bi).iter().copied());
    }
    ArrayD::from_shape_vec(IxDyn(&out_shape), out).map_err(|e| RuntimeError::ShapeError(e.to_string()))
}

/// Numerically stable softmax over the last axis.
fn op_softmax(mut a: ArrayD<f32>) -> OpResult {
    if a.ndim() == 0 {
        return Err(RuntimeError::ShapeError("softmax of a scalar".to_string()));
    }
    let axis = Axis(a.ndim() - 1);
    for mut lane in a.lanes_mut(axis) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(a)
}

fn op_reshape(a: &ArrayD<f32>, shape: &[usize]) -> OpResult {
    ArrayD::from_shape_vec(IxDyn(shape), a.iter().copied().collect())
        .map_err(|_| RuntimeError::ShapeError(format!("cannot reshape {:?} into {:?}", a.shape(), shape)))
}

fn op_transpose(mut a: ArrayD<f32>, axis1: usize, axis2: usize) -> OpResult {
    if axis1 >= a.ndim() || axis2 >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "transpose axes ({}, {}) out of range for rank {}",
            axis1,
            axis2,
            a.ndim()
        )));
    }
    a.swap_axes(axis1, axis2);
    Ok(a.as_standard_layout().into_owned())
}

/// Sums `x` over the axes along which `target` was broadcast.
fn op_reduce_sum_to(x: ArrayD<f32>, target: &[usize]) -> OpResult {
    if target.len() > x.ndim() {
        return Err(RuntimeError::ShapeError(format!("cannot reduce {:?} to {:?}", x.shape(), target)));
    }
    let mut out = x;
    while out.ndim() > target.len() {
        out = out.sum_axis(Axis(0));
    }
    for (i, &t) in target.iter().enumerate() {
        if t == 1 && out.shape()[i] != 1 {
            out = out.sum_axis(Axis(i)).insert_axis(Axis(i));
        }
    }
    if out.shape() != target {
        return Err(RuntimeError::ShapeError(format!("cannot reduce to {:?}, got {:?}", target, out.shape())));
    }
    Ok(out)
}
