//! Training session: one forward graph, its gradient graph and the current
//! parameter values, run on a backend.

use super::backend::{Backend, Memo, RuntimeError};
use super::cpu_backend::CpuBackend;
use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, NodeId, NodeType, Shape, Value};
use crate::autograd::{AutogradError, Gradients};
use crate::nn::init::InitError;
use crate::optimizers::Optimizer;
use crate::tensor::{GraphContext, ParameterSpec, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("shape inference failed: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("gradient graph construction failed: {0}")]
    Autograd(#[from] AutogradError),
    #[error("execution failed: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("parameter initialization failed: {0}")]
    Init(#[from] InitError),
    #[error("input '{name}' expects shape {expected:?}, got {actual:?}")]
    FeedShape { name: String, expected: Shape, actual: Shape },
    #[error("parameter '{name}' expects shape {expected:?}, got {actual:?}")]
    ParameterShape { name: String, expected: Shape, actual: Shape },
    #[error("session was built without a loss")]
    NoLoss,
    #[error("loss must be a single value, got shape {0:?}")]
    NonScalarLoss(Shape),
}

/// Result of one forward and backward pass.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Requested outputs, in the order given to the session.
    pub outputs: Vec<Value>,
    pub loss: f32,
    /// Gradient of the loss per parameter name.
    pub gradients: HashMap<String, Value>,
}

pub struct Session<B: Backend = CpuBackend> {
    backend: B,
    forward: Asg,
    grad: Option<Asg>,
    n_outputs: usize,
    /// Parameter names in the order of the gradient graph outputs.
    param_names: Vec<String>,
    specs: BTreeMap<String, ParameterSpec>,
    parameters: HashMap<String, Value>,
}

impl Session<CpuBackend> {
    /// Session on the CPU backend.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        outputs: &[&Tensor],
        loss: Option<&Tensor>,
    ) -> Result<Self, SessionError> {
        Self::with_backend(CpuBackend::new(), context, outputs, loss)
    }
}

impl<B: Backend> Session<B> {
    /// Freezes the graph built so far in `context` and prepares gradients of
    /// `loss` with respect to every parameter.
    pub fn with_backend(
        backend: B,
        context: &Rc<RefCell<GraphContext>>,
        outputs: &[&Tensor],
        loss: Option<&Tensor>,
    ) -> Result<Self, SessionError> {
        let (mut forward, specs) = {
            let ctx = context.borrow();
            (ctx.main_graph().clone(), ctx.parameter_specs().clone())
        };

        let mut output_ids: Vec<NodeId> = outputs.iter().map(|t| t.node_id).collect();
        if let Some(loss) = loss {
            output_ids.push(loss.node_id);
        }
        forward.set_outputs(output_ids);
        ShapeInference::run(&mut forward, &HashMap::new())?;

        let params = forward.parameters();
        let param_names: Vec<String> = params.iter().map(|(_, name)| name.clone()).collect();
        let grad = match loss {
            Some(loss) => {
                let loss_shape = forward.get_node(loss.node_id).map_err(ShapeInferenceError::from)?.shape.clone();
                if let Some(shape) = loss_shape {
                    if shape.iter().product::<usize>() != 1 {
                        return Err(SessionError::NonScalarLoss(shape));
                    }
                }
                let wrt: Vec<NodeId> = params.iter().map(|(id, _)| *id).collect();
                Some(Gradients::new(&forward).build_and_infer(loss.node_id, &wrt)?)
            }
            None => None,
        };

        debug!(
            nodes = forward.nodes.len(),
            parameters = param_names.len(),
            with_gradients = grad.is_some(),
            "session prepared"
        );
        Ok(Self {
            backend,
            forward,
            grad,
            n_outputs: outputs.len(),
            param_names,
            specs,
            parameters: HashMap::new(),
        })
    }

    /// Samples every registered parameter from its initializer.
    pub fn init_parameters(&mut self, seed: u64) -> Result<(), SessionError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut values = HashMap::with_capacity(self.specs.len());
        for (name, spec) in &self.specs {
            values.insert(name.clone(), Value::Tensor(spec.sample(&mut rng)?));
        }
        self.parameters = values;
        Ok(())
    }

    /// Replaces parameter values, checking them against the registered shapes.
    pub fn set_parameters(&mut self, values: HashMap<String, Value>) -> Result<(), SessionError> {
        for (name, value) in &values {
            if let Some(spec) = self.specs.get(name) {
                if spec.shape != value.shape() {
                    return Err(SessionError::ParameterShape {
                        name: name.clone(),
                        expected: spec.shape.clone(),
                        actual: value.shape(),
                    });
                }
            }
        }
        self.parameters.extend(values);
        Ok(())
    }

    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.parameters
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn forward_graph(&self) -> &Asg {
        &self.forward
    }

    pub fn gradient_graph(&self) -> Option<&Asg> {
        self.grad.as_ref()
    }

    /// Runs the forward graph; returns the requested outputs (without the loss).
    pub fn forward(&self, feed: &HashMap<String, Value>) -> Result<Vec<Value>, SessionError> {
        let (mut outputs, _) = self.run_forward(feed)?;
        outputs.truncate(self.n_outputs);
        Ok(outputs)
    }

    /// Runs the forward graph and then the gradient graph on the forward memo.
    pub fn forward_backward(&self, feed: &HashMap<String, Value>) -> Result<StepOutput, SessionError> {
        let grad = self.grad.as_ref().ok_or(SessionError::NoLoss)?;
        let (mut outputs, memo) = self.run_forward(feed)?;

        let loss_value = outputs.pop().ok_or(SessionError::NoLoss)?;
        let loss = loss_value
            .as_scalar()
            .ok_or_else(|| SessionError::NonScalarLoss(loss_value.shape()))?;

        let (grad_device, _) = self.backend.run(grad, memo)?;
        let grad_values = self.backend.retrieve_data(&grad_device)?;
        let gradients = self.param_names.iter().cloned().zip(grad_values).collect();

        Ok(StepOutput { outputs, loss, gradients })
    }

    /// Applies one optimizer step, then projects constrained parameters.
    pub fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer, gradients: &HashMap<String, Value>) {
        optimizer.step(&mut self.parameters, gradients);
        for (name, spec) in &self.specs {
            if let (Some(constraint), Some(Value::Tensor(data))) = (&spec.constraint, self.parameters.get_mut(name)) {
                constraint.apply(data);
            }
        }
    }

    fn run_forward(&self, feed: &HashMap<String, Value>) -> Result<(Vec<Value>, Memo<B::DeviceData>), SessionError> {
        for node in self.forward.nodes.values() {
            if let NodeType::Input { name } = &node.node_type {
                if let (Some(value), Some(expected)) = (feed.get(name), &node.shape) {
                    if &value.shape() != expected {
                        return Err(SessionError::FeedShape {
                            name: name.clone(),
                            expected: expected.clone(),
                            actual: value.shape(),
                        });
                    }
                }
            }
        }

        let mut host = self.parameters.clone();
        host.extend(feed.iter().map(|(k, v)| (k.clone(), v.clone())));
        let device = self.backend.load_data(&host)?;

        let mut memo: Memo<B::DeviceData> = HashMap::new();
        let mut by_name: HashMap<String, B::DeviceData> = device;
        for node in self.forward.nodes.values() {
            let name = match &node.node_type {
                NodeType::Input { name } | NodeType::Parameter { name } => name,
                _ => continue,
            };
            if let Some(data) = by_name.remove(name) {
                memo.insert((self.forward.id, node.id), data);
            }
        }

        let (device_outputs, memo) = self.backend.run(&self.forward, memo)?;
        let outputs = self.backend.retrieve_data(&device_outputs)?;
        Ok((outputs, memo))
    }
}
