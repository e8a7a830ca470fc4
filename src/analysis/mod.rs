//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates tensor shapes
//!   through the graph, detecting shape mismatches before runtime. Layers also
//!   call it eagerly on every new node so they can read operand shapes while
//!   the graph is still being built.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```

pub mod shape_inference;
