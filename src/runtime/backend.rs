//! Abstract interface (trait) for execution backends.

use crate::asg::{Asg, AsgId, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing a graph. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node {0} not found in graph {1}. Check that the graph was built correctly.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Type mismatch: operation expected {expected}, got {actual}.")]
    TypeError { expected: String, actual: String },

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("No value for input '{0}' (node {1}). Add it to the feed before running the graph.")]
    MissingInput(String, NodeId),

    #[error("No value for parameter '{0}' (node {1}). Initialize parameters before running the graph.")]
    MissingParameter(String, NodeId),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

/// Cache of computed node values keyed by (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Common interface of an execution backend.
///
/// A backend takes an ASG plus initial data and computes the graph outputs.
pub trait Backend {
    /// Device-specific data representation.
    type DeviceData: std::fmt::Debug;

    /// Moves host values to the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes the graph, using and extending the memo.
    ///
    /// `initial_memo` holds inputs, parameters and possibly values of linked
    /// graphs (the forward values a gradient graph reads through `External`).
    ///
    /// Returns the graph outputs and the final memo with all intermediate values.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies device data back to host values.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
