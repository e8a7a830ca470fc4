//! # RustyGNN: graph neural networks on a graph-based autodiff engine
//!
//! Models are built symbolically into an Abstract Semantic Graph (ASG),
//! shape-checked, differentiated into a second graph and executed by a
//! backend. On top of that engine the crate provides graph layers
//! ([`nn::GraphConv`], [`nn::DiffPool`]) and containers for datasets of
//! graphs ([`data::Dataset`]).
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::collections::HashMap;
//! use std::rc::Rc;
//! use rustygnn::asg::Value;
//! use rustygnn::losses::add_losses;
//! use rustygnn::nn::{DiffPool, DiffPoolConfig};
//! use rustygnn::runtime::Session;
//! use rustygnn::tensor::{GraphContext, Tensor};
//! use ndarray::ArrayD;
//!
//! // 1. Declare inputs with static shapes: 2 graphs of 6 nodes, 3 features.
//! let context = Rc::new(RefCell::new(GraphContext::new()));
//! let x = Tensor::new_input_with_shape(&context, "x", &[2, 6, 3]);
//! let a = Tensor::new_input_with_shape(&context, "a", &[2, 6, 6]);
//!
//! // 2. Pool every graph down to 2 clusters.
//! let mut pool = DiffPool::new("pool", DiffPoolConfig::new(2)).unwrap();
//! let out = pool.call(&x, &a).unwrap();
//! let loss = add_losses(&out.losses()).unwrap();
//!
//! // 3. Run forward and backward passes on the CPU.
//! let mut session = Session::new(&context, &[&out.x, &out.a], Some(&loss)).unwrap();
//! session.init_parameters(0).unwrap();
//! let feed = HashMap::from([
//!     ("x".to_string(), Value::Tensor(ArrayD::ones(vec![2, 6, 3]))),
//!     ("a".to_string(), Value::Tensor(ArrayD::ones(vec![2, 6, 6]))),
//! ]);
//! let step = session.forward_backward(&feed).unwrap();
//! assert_eq!(step.outputs[0].shape(), vec![2, 2, 3]);
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod data;
pub mod losses;
pub mod metrics;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod serialization;
pub mod tensor;
