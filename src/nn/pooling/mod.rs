//! Graph pooling layers.
//!
//! - [`DiffPool`]: learned soft clustering into `k` super-nodes.
//! - [`GlobalSumPool`], [`GlobalAvgPool`]: readout of a whole graph.

pub mod diff_pool;
pub mod global;

pub use diff_pool::{DiffPool, DiffPoolConfig, DiffPoolOutput};
pub use global::{GlobalAvgPool, GlobalSumPool};
