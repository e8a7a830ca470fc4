//! # Graph data
//!
//! Graphs, datasets of graphs and everything needed to feed them to a model.
//!
//! - [`Graph`]: optional node features `x`, adjacency `a`, edge features `e`
//!   and labels `y`
//! - [`Dataset`]: ordered, indexable collection of graphs filled from a
//!   [`GraphSource`]
//! - [`GraphTransform`]: per-graph preprocessing ([`GcnFilter`],
//!   [`OneHotLabels`], ...)
//! - [`BatchLoader`]: zero-padded batches in batch mode
//! - [`BlockGraphs`]: generated stochastic block model graphs
//!
//! ## Example
//!
//! ```no_run
//! use rustygnn::data::{BatchLoader, BlockGraphs, Dataset, NormalizeFeatures, OneHotLabels};
//!
//! let source = BlockGraphs { n_graphs: 64, ..BlockGraphs::default() };
//! let dataset = Dataset::load(&source, &[&NormalizeFeatures, &OneHotLabels::new(3)]).unwrap();
//!
//! let loader = BatchLoader::new(&dataset, 16).shuffle(true).seed(0);
//! for batch in loader.iter() {
//!     assert_eq!(batch.x.shape()[0], batch.len());
//! }
//! ```

pub mod dataset;
pub mod graph;
pub mod loader;
pub mod synthetic;
pub mod transforms;

pub use dataset::{dataset_folder, Dataset, DATASET_FOLDER_ENV, DatasetError, FieldSignature, GraphSource, Layout, Signature};
pub use graph::{Adjacency, CooAdjacency, Graph, GraphError};
pub use loader::{BatchIter, BatchLoader, GraphBatch};
pub use synthetic::BlockGraphs;
pub use transforms::{
    AddSelfLoops, AdjToDense, AdjToSparse, Compose, GcnFilter, GraphTransform, NormalizeAdj, NormalizeFeatures,
    OneHotLabels,
};
