//! Execution of ASGs.
//!
//! `backend` defines the interface, `cpu_backend` evaluates graphs with
//! `ndarray`, and `session` drives forward and gradient runs for training.

pub mod backend;
pub mod cpu_backend;
pub mod session;

pub use backend::{Backend, Memo, RuntimeError};
pub use cpu_backend::CpuBackend;
pub use session::{Session, SessionError, StepOutput};
