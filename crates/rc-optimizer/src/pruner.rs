//! Early-stopping decisions from intermediate values.

use crate::trial::{FrozenTrial, StudyDirection, TrialState};

pub trait Pruner: Send + Sync {
    /// Whether `trial`, having just reported at `step`, should be abandoned.
    fn should_prune(&self, history: &[FrozenTrial], trial: &FrozenTrial, step: u64) -> bool;
}

/// Pruner that never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn should_prune(&self, _history: &[FrozenTrial], _trial: &FrozenTrial, _step: u64) -> bool {
        false
    }
}

/// Prune when the trial's best intermediate value so far is worse than the
/// median of completed trials' values at the same step.
#[derive(Debug, Clone)]
pub struct MedianPruner {
    /// Completed trials required before any pruning happens.
    pub n_startup_trials: usize,
    /// Steps below this are never pruned.
    pub n_warmup_steps: u64,
    pub direction: StudyDirection,
}

impl MedianPruner {
    pub fn new(n_startup_trials: usize, n_warmup_steps: u64) -> Self {
        Self {
            n_startup_trials,
            n_warmup_steps,
            direction: StudyDirection::Minimize,
        }
    }

    pub fn with_direction(mut self, direction: StudyDirection) -> Self {
        self.direction = direction;
        self
    }

    fn best_so_far(&self, trial: &FrozenTrial, step: u64) -> Option<f64> {
        let values = trial
            .intermediate_values
            .range(..=step)
            .map(|(_, v)| *v)
            .filter(|v| !v.is_nan());
        match self.direction {
            StudyDirection::Minimize => values.reduce(f64::min),
            StudyDirection::Maximize => values.reduce(f64::max),
        }
    }
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self::new(5, 0)
    }
}

impl Pruner for MedianPruner {
    fn should_prune(&self, history: &[FrozenTrial], trial: &FrozenTrial, step: u64) -> bool {
        if step < self.n_warmup_steps {
            return false;
        }

        let completed: Vec<&FrozenTrial> = history
            .iter()
            .filter(|t| t.state == TrialState::Complete && t.trial_id != trial.trial_id)
            .collect();
        if completed.len() < self.n_startup_trials {
            return false;
        }

        let Some(best) = self.best_so_far(trial, step) else {
            // Nothing but NaN reported.
            return !trial.intermediate_values.is_empty();
        };

        let mut at_step: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate_values.get(&step).copied())
            .filter(|v| !v.is_nan())
            .collect();
        if at_step.is_empty() {
            return false;
        }
        at_step.sort_by(f64::total_cmp);
        let median = median_of_sorted(&at_step);

        self.direction.is_better(median, best)
    }
}

fn median_of_sorted(values: &[f64]) -> f64 {
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(id: i64, value_at_0: f64) -> FrozenTrial {
        FrozenTrial::new(id, id as u64)
            .with_intermediate(0, value_at_0)
            .with_state(TrialState::Complete, Some(value_at_0))
    }

    fn history() -> Vec<FrozenTrial> {
        (0..5).map(|i| completed(i, i as f64)).collect()
    }

    #[test]
    fn prunes_worse_than_median() {
        let pruner = MedianPruner::new(5, 0);
        let bad = FrozenTrial::new(10, 5).with_intermediate(0, 3.5);
        let good = FrozenTrial::new(11, 6).with_intermediate(0, 1.0);
        assert!(pruner.should_prune(&history(), &bad, 0));
        assert!(!pruner.should_prune(&history(), &good, 0));
    }

    #[test]
    fn respects_startup_and_warmup() {
        let bad = FrozenTrial::new(10, 5).with_intermediate(0, 100.0);
        assert!(!MedianPruner::new(6, 0).should_prune(&history(), &bad, 0));
        assert!(!MedianPruner::new(5, 1).should_prune(&history(), &bad, 0));
    }

    #[test]
    fn no_peers_at_step_means_no_prune() {
        let pruner = MedianPruner::new(5, 0);
        let trial = FrozenTrial::new(10, 5).with_intermediate(3, 100.0);
        assert!(!pruner.should_prune(&history(), &trial, 3));
    }

    #[test]
    fn nan_only_reports_are_pruned() {
        let pruner = MedianPruner::new(5, 0);
        let trial = FrozenTrial::new(10, 5).with_intermediate(0, f64::NAN);
        assert!(pruner.should_prune(&history(), &trial, 0));
        assert!(!NopPruner.should_prune(&history(), &trial, 0));
    }

    #[test]
    fn even_median_averages() {
        assert_eq!(median_of_sorted(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(median_of_sorted(&[1.0, 2.0, 3.0]), 2.0);
    }
}
