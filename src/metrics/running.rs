//! Running statistics over a stream of values.

/// Online (optionally weighted) mean.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    mean: f64,
    weight: f64,
    count: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.update_weighted(value, 1.0);
    }

    /// Adds `value` counted `weight` times, e.g. a batch mean with the batch
    /// size as weight. Non-positive weights are ignored.
    pub fn update_weighted(&mut self, value: f64, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.count += 1;
        self.weight += weight;
        self.mean += (value - self.mean) * weight / self.weight;
    }

    pub fn compute(&self) -> f64 {
        self.mean
    }

    /// Number of updates.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut mean = RunningMean::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            mean.update(v);
        }
        assert!((mean.compute() - 2.5).abs() < 1e-12);
        assert_eq!(mean.count(), 4);
    }

    #[test]
    fn test_weighted_mean() {
        let mut mean = RunningMean::new();
        mean.update_weighted(1.0, 3.0);
        mean.update_weighted(5.0, 1.0);
        mean.update_weighted(100.0, 0.0);
        assert!((mean.compute() - 2.0).abs() < 1e-12);
        mean.reset();
        assert_eq!(mean.count(), 0);
    }
}
