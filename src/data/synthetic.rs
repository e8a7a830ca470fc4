//! Generated graph datasets.

use super::dataset::{DatasetError, GraphSource};
use super::graph::{Adjacency, Graph};
use ndarray::{arr1, Array2};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Stochastic block model graphs labelled by their number of blocks.
///
/// Each graph draws a block count `c` in `1..=max_blocks`, splits its nodes
/// evenly into `c` blocks and links two nodes with probability `p_in` inside
/// a block and `p_out` across blocks. Node features are the one-hot block
/// index (modulo `n_features`) plus Gaussian noise. The label is the scalar
/// class `c - 1`; apply `OneHotLabels::new(max_blocks)` for one-hot targets.
///
/// Generation is deterministic in `seed`. There is nothing to download, so
/// `Dataset::load` only calls `read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockGraphs {
    pub n_graphs: usize,
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub max_blocks: usize,
    pub p_in: f64,
    pub p_out: f64,
    pub n_features: usize,
    pub noise: f32,
    pub seed: u64,
}

impl Default for BlockGraphs {
    fn default() -> Self {
        Self {
            n_graphs: 200,
            min_nodes: 12,
            max_nodes: 20,
            max_blocks: 3,
            p_in: 0.8,
            p_out: 0.05,
            n_features: 4,
            noise: 0.1,
            seed: 0,
        }
    }
}

impl BlockGraphs {
    fn invalid(&self, reason: impl Into<String>) -> DatasetError {
        DatasetError::Read { name: self.name(), reason: reason.into() }
    }

    fn check(&self) -> Result<(), DatasetError> {
        if self.max_blocks == 0 || self.n_features == 0 {
            return Err(self.invalid("max_blocks and n_features must be positive"));
        }
        if self.min_nodes < self.max_blocks || self.min_nodes > self.max_nodes {
            return Err(self.invalid(format!(
                "node range {}..={} cannot hold {} blocks",
                self.min_nodes, self.max_nodes, self.max_blocks
            )));
        }
        for p in [self.p_in, self.p_out] {
            if !(0.0..=1.0).contains(&p) {
                return Err(self.invalid(format!("edge probability {p} outside [0, 1]")));
            }
        }
        Ok(())
    }

    fn sample_graph<R: Rng>(&self, rng: &mut R, noise: Normal<f32>) -> Result<Graph, DatasetError> {
        let n = rng.gen_range(self.min_nodes..=self.max_nodes);
        let n_blocks = rng.gen_range(1..=self.max_blocks);
        let block = |i: usize| i * n_blocks / n;

        let mut a = Array2::<f32>::zeros((n, n));
        for i in 0..n {
            for j in (i + 1)..n {
                let p = if block(i) == block(j) { self.p_in } else { self.p_out };
                if rng.gen_bool(p) {
                    a[[i, j]] = 1.0;
                    a[[j, i]] = 1.0;
                }
            }
        }

        let mut x = Array2::random_using((n, self.n_features), noise, rng);
        for i in 0..n {
            x[[i, block(i) % self.n_features]] += 1.0;
        }

        let y = arr1(&[(n_blocks - 1) as f32]).into_dyn();
        Graph::new(Some(x), Some(Adjacency::dense(a)?), None, Some(y)).map_err(DatasetError::from)
    }
}

impl GraphSource for BlockGraphs {
    fn name(&self) -> String {
        "BlockGraphs".to_string()
    }

    fn read(&self) -> Result<Vec<Graph>, DatasetError> {
        self.check()?;
        let noise = Normal::new(0.0, self.noise).map_err(|e| self.invalid(e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.n_graphs).map(|_| self.sample_graph(&mut rng, noise)).collect()
    }
}
