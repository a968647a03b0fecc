//! Step sequencer: per-column step bookkeeping and the run-wide epoch counter.
//!
//! Every accepted step is remembered for the lifetime of the run, so a step
//! logged out of order is still caught as a duplicate.

use std::collections::HashMap;

use indexmap::IndexSet;

use crate::models::MetricError;

#[derive(Debug, Default)]
struct ColumnSteps {
    accepted: IndexSet<u64>,
    max: Option<u64>,
}

#[derive(Debug, Default)]
pub struct StepSequencer {
    columns: HashMap<String, ColumnSteps>,
    epoch: u64,
}

impl StepSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the epoch. Called once per `log` call, whatever it contains.
    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Step for the next write to `key`: the requested one, or one past the
    /// highest accepted step (0 for a column with none).
    pub fn resolve(&self, key: &str, requested: Option<u64>) -> u64 {
        requested.unwrap_or_else(|| {
            self.columns
                .get(key)
                .and_then(|c| c.max)
                .map_or(0, |max| max.saturating_add(1))
        })
    }

    /// Record `step` for `key`, rejecting a step the column already holds.
    pub fn commit(&mut self, key: &str, step: u64) -> Result<(), MetricError> {
        let column = self.columns.entry(key.to_string()).or_default();
        if !column.accepted.insert(step) {
            return Err(MetricError::duplicate());
        }
        column.max = Some(column.max.map_or(step, |max| max.max(step)));
        Ok(())
    }

    /// Accepted steps of `key` in the order they were accepted.
    pub fn steps(&self, key: &str) -> Vec<u64> {
        self.columns
            .get(key)
            .map(|c| c.accepted.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_and_commit() {
        let mut seq = StepSequencer::new();
        assert_eq!(seq.resolve("a", None), 0);
        seq.commit("a", 0).unwrap();
        assert_eq!(seq.resolve("a", None), 1);
        seq.commit("a", 7).unwrap();
        seq.commit("a", 3).unwrap();
        assert_eq!(seq.resolve("a", None), 8);
        assert!(seq.commit("a", 3).unwrap_err().duplicated);
        assert_eq!(seq.steps("a"), vec![0, 7, 3]);
        assert!(seq.steps("b").is_empty());
    }

    #[test]
    fn test_resolve_after_max_step() {
        let mut seq = StepSequencer::new();
        seq.commit("a", u64::MAX).unwrap();
        assert_eq!(seq.resolve("a", None), u64::MAX);
        assert!(seq.commit("a", u64::MAX).unwrap_err().duplicated);
    }
}
