//! ASG: the abstract semantic graph every layer builds into.
//!
//! Nodes are stored by id in a flat map. Operands are referenced by
//! `NodeId`, so a node can only point at nodes created before it and the
//! graph stays acyclic by construction.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier inside one graph.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("node with id {0} not found")]
    NodeNotFound(NodeId),
    #[error("invalid shape on node {0}")]
    InvalidShape(NodeId),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    I64,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Duplicates the map key so callers holding a `&Node` know its id.
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(Value),
    /// Value of `source_node_id` in graph `source_asg_id`, read from the memo.
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Binary, broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    Power(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),
    /// Batched over leading axes; a rank-2 operand broadcasts over the batch.
    MatrixMultiply(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Sqrt(NodeId),
    Abs(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Tanh(NodeId),
    /// Along the last axis.
    Softmax(NodeId),

    // Reductions
    /// Over all elements, to a scalar.
    Sum(NodeId),
    /// Over all elements, to a scalar.
    Mean(NodeId),
    /// Over one axis, keepdim. Negative axes count from the end.
    SumAxis(NodeId, isize),
    MeanAxis(NodeId, isize),

    // Transformations
    /// Second operand is a literal holding the target shape.
    Reshape(NodeId, NodeId),
    Transpose(NodeId, usize, usize),
    /// Broadcast the first operand to the shape of the second.
    Broadcast(NodeId, NodeId),
    /// Sum the first operand down to the shape of the second.
    ReduceSumTo(NodeId, NodeId),
}

impl NodeType {
    /// Operand ids in evaluation order.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::Power(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::Reshape(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::Sqrt(a)
            | NodeType::Abs(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Tanh(a)
            | NodeType::Softmax(a)
            | NodeType::Sum(a)
            | NodeType::Mean(a)
            | NodeType::SumAxis(a, _)
            | NodeType::MeanAxis(a, _)
            | NodeType::Transpose(a, _, _) => vec![*a],
        }
    }

    /// Short operation name for logs and error messages.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::Literal(_) => "Literal",
            NodeType::External { .. } => "External",
            NodeType::Add(..) => "Add",
            NodeType::Subtract(..) => "Subtract",
            NodeType::Multiply(..) => "Multiply",
            NodeType::Divide(..) => "Divide",
            NodeType::Power(..) => "Power",
            NodeType::GreaterThan(..) => "GreaterThan",
            NodeType::MatrixMultiply(..) => "MatrixMultiply",
            NodeType::Negate(_) => "Negate",
            NodeType::Exp(_) => "Exp",
            NodeType::Log(_) => "Log",
            NodeType::Sqrt(_) => "Sqrt",
            NodeType::Abs(_) => "Abs",
            NodeType::ReLU(_) => "ReLU",
            NodeType::Sigmoid(_) => "Sigmoid",
            NodeType::Tanh(_) => "Tanh",
            NodeType::Softmax(_) => "Softmax",
            NodeType::Sum(_) => "Sum",
            NodeType::Mean(_) => "Mean",
            NodeType::SumAxis(..) => "SumAxis",
            NodeType::MeanAxis(..) => "MeanAxis",
            NodeType::Reshape(..) => "Reshape",
            NodeType::Transpose(..) => "Transpose",
            NodeType::Broadcast(..) => "Broadcast",
            NodeType::ReduceSumTo(..) => "ReduceSumTo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Shape of the value; scalars have an empty shape.
    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }

    /// Owned tensor view of the value; scalars become rank-0 arrays.
    pub fn to_tensor(&self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr.clone(),
            Value::ScalarF32(v) => ndarray::arr0(*v).into_dyn(),
        }
    }

    pub fn into_tensor(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    /// The single element of a one-element value.
    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            Value::Tensor(arr) if arr.len() == 1 => arr.iter().next().copied(),
            Value::Tensor(_) => None,
            Value::ScalarF32(v) => Some(*v),
        }
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(arr: ArrayD<f32>) -> Self {
        Value::Tensor(arr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals carry their own shape, so inference never has to ask for it.
        if let NodeType::Literal(value) = &node.node_type {
            node.shape = Some(value.shape());
            node.dtype = Some(DType::F32);
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_inputs(&mut self, inputs: Vec<NodeId>) {
        self.inputs = inputs;
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Ids of every `Parameter` node with its name, sorted by id.
    pub fn parameters(&self) -> Vec<(NodeId, String)> {
        let mut params: Vec<(NodeId, String)> = self
            .nodes
            .values()
            .filter_map(|n| match &n.node_type {
                NodeType::Parameter { name } => Some((n.id, name.clone())),
                _ => None,
            })
            .collect();
        params.sort_by_key(|(id, _)| *id);
        params
    }

    /// Id of the `Input` node called `name`.
    pub fn input_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find_map(|n| match &n.node_type {
            NodeType::Input { name: n_name } if n_name == name => Some(n.id),
            _ => None,
        })
    }
}
