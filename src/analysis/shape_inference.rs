//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape
//! and data type of the output tensor for each node based on its input shapes and operation type.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape, Value};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}. \
             Ensure dimensions are compatible for broadcasting or matrix multiplication.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes HashMap when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected at least {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Axis {axis} is out of range for a tensor of rank {rank} (node {node_id}).")]
    InvalidAxis {
        node_id: NodeId,
        axis: isize,
        rank: usize,
    },

    #[error("Node {0} must be a Literal for shape computation (e.g., for Reshape operation). \
             Dynamic shapes are not supported.")]
    NotALiteral(NodeId),

    #[error("Cannot reshape {from:?} into {to:?}: element counts differ.")]
    ReshapeMismatch { from: Shape, to: Shape },

    #[error("Broadcast error: cannot broadcast shape {0:?} to {1:?}.")]
    BroadcastError(Shape, Shape),

    #[error("Graph contains a cycle through node {0}.")]
    Cycle(NodeId),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the shape inference process for the graph.
    ///
    /// Modifies the graph in-place, filling in the `shape` and `dtype` fields for each node.
    ///
    /// # Arguments
    /// * `asg` - Mutable reference to the graph to analyze.
    /// * `initial_shapes` - shapes for `Input`, `Parameter` and `External` nodes keyed
    ///   by name. Nodes that already carry a shape may be left out.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let node = asg.get_node(node_id)?;
            let (shape, dtype) = Self::infer_node_shape(asg, node, initial_shapes)?;

            let node = asg.get_node_mut(node_id)?;
            node.shape = Some(shape);
            node.dtype = Some(dtype);
        }

        Ok(())
    }

    /// Shape and dtype of a single node whose operands are already shaped.
    pub fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name }
            | NodeType::Parameter { name }
            | NodeType::External { name, .. } => {
                if let Some(entry) = initial_shapes.get(name) {
                    return Ok(entry.clone());
                }
                match &node.shape {
                    Some(shape) => Ok((shape.clone(), node.dtype.unwrap_or(DType::F32))),
                    None => Err(ShapeInferenceError::MissingInitialShape(name.clone())),
                }
            }

            NodeType::Literal(value) => Ok((value.shape(), DType::F32)),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::Power(l, r)
            | NodeType::GreaterThan(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                let out = Self::broadcast_shapes(&ls, &rs).ok_or_else(|| {
                    ShapeInferenceError::IncompatibleShapes {
                        op: node.node_type.op_name().to_string(),
                        shape1: ls.clone(),
                        shape2: rs.clone(),
                    }
                })?;
                Ok((out, ld))
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;

                if ls.len() < 2 || rs.len() < 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: ls.len().min(rs.len()),
                    });
                }
                let out = Self::matmul_shape(&ls, &rs).ok_or_else(|| {
                    ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls.clone(),
                        shape2: rs.clone(),
                    }
                })?;
                Ok((out, ld))
            }

            NodeType::Negate(id)
            | NodeType::Exp(id)
            | NodeType::Log(id)
            | NodeType::Sqrt(id)
            | NodeType::Abs(id)
            | NodeType::ReLU(id)
            | NodeType::Sigmoid(id)
            | NodeType::Tanh(id) => Self::get_shape_dtype(asg, *id),

            NodeType::Softmax(id) => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if shape.is_empty() {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 1, actual: 0 });
                }
                Ok((shape, dtype))
            }

            NodeType::Sum(id) | NodeType::Mean(id) => {
                let (_, dtype) = Self::get_shape_dtype(asg, *id)?;
                Ok((vec![], dtype))
            }

            NodeType::SumAxis(id, axis) | NodeType::MeanAxis(id, axis) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                let ax = Self::normalize_axis(*axis, shape.len()).ok_or(ShapeInferenceError::InvalidAxis {
                    node_id: node.id,
                    axis: *axis,
                    rank: shape.len(),
                })?;
                // keepdim: the reduced axis stays with length 1 for broadcasting.
                shape[ax] = 1;
                Ok((shape, dtype))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Reshape(data_id, shape_id) => {
                let (from, dtype) = Self::get_shape_dtype(asg, *data_id)?;
                let to = Self::literal_shape(asg, *shape_id)?;
                if from.iter().product::<usize>() != to.iter().product::<usize>() {
                    return Err(ShapeInferenceError::ReshapeMismatch { from, to });
                }
                Ok((to, dtype))
            }

            NodeType::Broadcast(src_id, target_id) => {
                let (src, dtype) = Self::get_shape_dtype(asg, *src_id)?;
                let (target, _) = Self::get_shape_dtype(asg, *target_id)?;
                match Self::broadcast_shapes(&src, &target) {
                    Some(out) if out == target => Ok((target, dtype)),
                    _ => Err(ShapeInferenceError::BroadcastError(src, target)),
                }
            }

            NodeType::ReduceSumTo(src_id, target_id) => {
                let (src, dtype) = Self::get_shape_dtype(asg, *src_id)?;
                let (target, _) = Self::get_shape_dtype(asg, *target_id)?;
                match Self::broadcast_shapes(&target, &src) {
                    Some(out) if out == src => Ok((target, dtype)),
                    _ => Err(ShapeInferenceError::BroadcastError(target, src)),
                }
            }
        }
    }

    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, node.dtype) {
            (Some(shape), dtype) => Ok((shape.clone(), dtype.unwrap_or(DType::F32))),
            (None, _) => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    fn literal_shape(asg: &Asg, node_id: NodeId) -> Result<Shape> {
        match &asg.get_node(node_id)?.node_type {
            NodeType::Literal(Value::Tensor(t)) => Ok(t.iter().map(|&x| x as usize).collect()),
            _ => Err(ShapeInferenceError::NotALiteral(node_id)),
        }
    }

    /// Numpy-style broadcast of two shapes.
    pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
        let rank = a.len().max(b.len());
        let mut out = vec![0; rank];
        for i in 0..rank {
            let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
            let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
            out[i] = match (da, db) {
                (x, y) if x == y => x,
                (1, y) => y,
                (x, 1) => x,
                _ => return None,
            };
        }
        Some(out)
    }

    /// Output shape of `[.., m, k] x [.., k, n]`; batch prefixes broadcast.
    pub fn matmul_shape(a: &[usize], b: &[usize]) -> Option<Shape> {
        if a.len() < 2 || b.len() < 2 {
            return None;
        }
        let (m, k1) = (a[a.len() - 2], a[a.len() - 1]);
        let (k2, n) = (b[b.len() - 2], b[b.len() - 1]);
        if k1 != k2 {
            return None;
        }
        let mut out = Self::broadcast_shapes(&a[..a.len() - 2], &b[..b.len() - 2])?;
        out.push(m);
        out.push(n);
        Some(out)
    }

    /// Resolves a possibly negative axis against `rank`.
    pub fn normalize_axis(axis: isize, rank: usize) -> Option<usize> {
        let resolved = if axis < 0 { rank as isize + axis } else { axis };
        if resolved < 0 || resolved as usize >= rank {
            None
        } else {
            Some(resolved as usize)
        }
    }

    /// Every node of the graph, operands before users.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        let (graph, _) = Self::dependency_graph(asg);
        toposort(&graph, None)
            .map(|order| order.into_iter().map(|ix| graph[ix]).collect())
            .map_err(|cycle| ShapeInferenceError::Cycle(graph[cycle.node_id()]))
    }

    /// Nodes needed to compute `roots`, operands before users.
    pub fn topological_sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let (graph, index) = Self::dependency_graph(asg);

        let mut needed = HashSet::new();
        let reversed = Reversed(&graph);
        for root in roots {
            let start = *index.get(root).ok_or(AsgError::NodeNotFound(*root))?;
            let mut dfs = Dfs::new(reversed, start);
            while let Some(ix) = dfs.next(reversed) {
                needed.insert(graph[ix]);
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| ShapeInferenceError::Cycle(graph[cycle.node_id()]))?;
        Ok(order
            .into_iter()
            .map(|ix| graph[ix])
            .filter(|id| needed.contains(id))
            .collect())
    }

    /// Edge `operand -> user` for every dependency.
    fn dependency_graph(asg: &Asg) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
        let mut ids: Vec<NodeId> = asg.nodes.keys().copied().collect();
        ids.sort_unstable();

        let mut graph = DiGraph::with_capacity(ids.len(), ids.len() * 2);
        let mut index = HashMap::with_capacity(ids.len());
        for id in &ids {
            index.insert(*id, graph.add_node(*id));
        }
        for id in &ids {
            for operand in asg.nodes[id].node_type.inputs() {
                if let (Some(&from), Some(&to)) = (index.get(&operand), index.get(id)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        (graph, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn shaped_input(asg: &mut Asg, name: &str) -> NodeId {
        asg.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() })
    }

    #[test]
    fn test_broadcast_rules() {
        assert_eq!(ShapeInference::broadcast_shapes(&[3, 1], &[4]), Some(vec![3, 4]));
        assert_eq!(ShapeInference::broadcast_shapes(&[], &[2, 2]), Some(vec![2, 2]));
        assert_eq!(ShapeInference::broadcast_shapes(&[2, 3], &[3, 2]), None);
    }

    #[test]
    fn test_batched_matmul_shape() {
        assert_eq!(ShapeInference::matmul_shape(&[5, 4], &[8, 4, 2]), Some(vec![8, 5, 2]));
        assert_eq!(ShapeInference::matmul_shape(&[8, 5, 4], &[4, 2]), Some(vec![8, 5, 2]));
        assert_eq!(ShapeInference::matmul_shape(&[5, 4], &[3, 2]), None);
    }

    #[test]
    fn test_run_fills_shapes() {
        let mut asg = Asg::new(0, None);
        let x = shaped_input(&mut asg, "x");
        let w = asg.add_node(None, NodeType::Parameter { name: "w".into() });
        let xw = asg.add_node(None, NodeType::MatrixMultiply(x, w));
        let s = asg.add_node(None, NodeType::SumAxis(xw, -2));
        let total = asg.add_node(None, NodeType::Mean(s));
        asg.set_output(total);

        let mut shapes = HashMap::new();
        shapes.insert("x".to_string(), (vec![2, 6, 3], DType::F32));
        shapes.insert("w".to_string(), (vec![3, 4], DType::F32));
        ShapeInference::run(&mut asg, &shapes).unwrap();

        assert_eq!(asg.get_node(xw).unwrap().shape, Some(vec![2, 6, 4]));
        assert_eq!(asg.get_node(s).unwrap().shape, Some(vec![2, 1, 4]));
        assert_eq!(asg.get_node(total).unwrap().shape, Some(vec![]));
    }

    #[test]
    fn test_reshape_checks_element_count() {
        let mut asg = Asg::new(0, None);
        let x = shaped_input(&mut asg, "x");
        let target = ArrayD::from_shape_vec(IxDyn(&[2]), vec![5.0, 1.0]).unwrap();
        let lit = asg.add_node(None, NodeType::Literal(Value::Tensor(target)));
        asg.add_node(None, NodeType::Reshape(x, lit));

        let mut shapes = HashMap::new();
        shapes.insert("x".to_string(), (vec![2, 3], DType::F32));
        let err = ShapeInference::run(&mut asg, &shapes).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::ReshapeMismatch { .. }));
    }

    #[test]
    fn test_missing_input_shape_is_reported() {
        let mut asg = Asg::new(0, None);
        let x = shaped_input(&mut asg, "x");
        asg.add_node(None, NodeType::ReLU(x));
        let err = ShapeInference::run(&mut asg, &HashMap::new()).unwrap_err();
        assert_eq!(err, ShapeInferenceError::MissingInitialShape("x".to_string()));
    }

    #[test]
    fn test_sort_from_skips_unrelated_nodes() {
        let mut asg = Asg::new(0, None);
        let x = shaped_input(&mut asg, "x");
        let y = shaped_input(&mut asg, "y");
        let rx = asg.add_node(None, NodeType::ReLU(x));
        asg.add_node(None, NodeType::Exp(y));
        let order = ShapeInference::topological_sort_from(&asg, &[rx]).unwrap();
        assert_eq!(order, vec![x, rx]);
    }
}
