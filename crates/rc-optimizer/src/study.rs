//! A named study bound to a store, a sampler and a pruner.

use rand::rngs::StdRng;
use std::sync::Arc;

use crate::pruner::{MedianPruner, Pruner};
use crate::sampler::{Sampler, TpeSampler};
use crate::search::SearchSpace;
use crate::storage::{StorageResult, StudyStorage};
use crate::trial::{best_trial, FrozenTrial, StudyDirection, StudyId, StudySummary, TrialState};

/// Ask/tell interface over a persistent study.
///
/// Every call goes through the store, so several processes driving the same
/// study name see each other's trials.
pub struct Study {
    storage: Arc<dyn StudyStorage>,
    study_id: StudyId,
    name: String,
    direction: StudyDirection,
    sampler: Box<dyn Sampler>,
    pruner: Box<dyn Pruner>,
}

impl Study {
    /// Create the study, or attach to it when `load_if_exists` and it is
    /// already present. Defaults to a multivariate TPE sampler and a median
    /// pruner.
    pub fn create(
        storage: Arc<dyn StudyStorage>,
        name: &str,
        direction: StudyDirection,
        load_if_exists: bool,
    ) -> StorageResult<Self> {
        let study_id = storage.create_study(name, direction, load_if_exists)?;
        // An existing study keeps the direction it was created with.
        let direction = storage.study_direction(study_id)?;
        Ok(Self {
            storage,
            study_id,
            name: name.to_string(),
            direction,
            sampler: Box::new(TpeSampler::new().with_direction(direction)),
            pruner: Box::new(MedianPruner::default().with_direction(direction)),
        })
    }

    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_pruner(mut self, pruner: Box<dyn Pruner>) -> Self {
        self.pruner = pruner;
        self
    }

    pub fn id(&self) -> StudyId {
        self.study_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> StudyDirection {
        self.direction
    }

    pub fn sampler_name(&self) -> &str {
        self.sampler.name()
    }

    /// Start a trial and record the parameters the sampler proposes for it.
    pub fn ask(&self, space: &SearchSpace, rng: &mut StdRng) -> StorageResult<FrozenTrial> {
        let history = self.storage.trials(self.study_id)?;
        let params = self.sampler.propose(space, &history, rng);

        let mut trial = self.storage.create_trial(self.study_id)?;
        for (name, value) in &params {
            match space.get(name) {
                Some(def) => self.storage.set_param(trial.trial_id, name, *value, &def.kind)?,
                None => tracing::warn!("Sampler proposed {} outside the search space", name),
            }
        }
        trial.params = params;

        tracing::debug!("Trial {} of {} asks {:?}", trial.number, self.name, trial.params);
        Ok(trial)
    }

    pub fn set_user_attr(&self, trial: &mut FrozenTrial, key: &str, value: serde_json::Value) -> StorageResult<()> {
        self.storage.set_user_attr(trial.trial_id, key, value.clone())?;
        trial.user_attrs.insert(key.to_string(), value);
        Ok(())
    }

    /// Record an intermediate objective value at `step`.
    pub fn report(&self, trial: &mut FrozenTrial, step: u64, value: f64) -> StorageResult<()> {
        self.storage.report_intermediate(trial.trial_id, step, value)?;
        trial.intermediate_values.insert(step, value);
        Ok(())
    }

    /// Ask the pruner whether `trial` should stop after reporting at `step`.
    pub fn should_prune(&self, trial: &FrozenTrial, step: u64) -> StorageResult<bool> {
        let history = self.storage.trials(self.study_id)?;
        Ok(self.pruner.should_prune(&history, trial, step))
    }

    /// Finish a trial.
    pub fn tell(&self, trial: &FrozenTrial, state: TrialState, value: Option<f64>) -> StorageResult<()> {
        self.storage.finish_trial(trial.trial_id, state, value)?;
        match value {
            Some(v) => tracing::info!("Trial {} finished with {} and value {}", trial.number, state, v),
            None => tracing::info!("Trial {} finished with {}", trial.number, state),
        }
        Ok(())
    }

    pub fn trials(&self) -> StorageResult<Vec<FrozenTrial>> {
        self.storage.trials(self.study_id)
    }

    pub fn best_trial(&self) -> StorageResult<Option<FrozenTrial>> {
        let trials = self.trials()?;
        Ok(best_trial(&trials, self.direction).cloned())
    }

    pub fn summary(&self) -> StorageResult<StudySummary> {
        let trials = self.trials()?;
        Ok(StudySummary::from_trials(&self.name, self.direction, &trials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pruner::NopPruner;
    use crate::sampler::RandomSampler;
    use crate::storage::SqliteStorage;
    use rand::SeedableRng;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .add_log_uniform("cohesion_scaled", 0.1, 10.0)
            .add_float("friction_scaled", 0.5, 1.5)
    }

    fn study() -> Study {
        let storage: Arc<dyn StudyStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
        Study::create(storage, "trial_0_0_0.06_local", StudyDirection::Minimize, true).unwrap()
    }

    #[test]
    fn ask_records_params() {
        let study = study().with_sampler(Box::new(RandomSampler));
        let mut rng = StdRng::seed_from_u64(3);
        let trial = study.ask(&space(), &mut rng).unwrap();

        assert_eq!(trial.number, 0);
        assert!(space().covers(&trial.params));
        let stored = study.trials().unwrap();
        assert_eq!(stored[0].params, trial.params);
        assert_eq!(study.sampler_name(), "random");
    }

    #[test]
    fn tell_and_summarize() {
        let study = study().with_pruner(Box::new(NopPruner));
        let mut rng = StdRng::seed_from_u64(5);

        for value in [3.0, 1.0, 2.0] {
            let mut trial = study.ask(&space(), &mut rng).unwrap();
            study.report(&mut trial, 0, value).unwrap();
            assert!(!study.should_prune(&trial, 0).unwrap());
            study.set_user_attr(&mut trial, "sub0_residual", serde_json::json!(value)).unwrap();
            study.tell(&trial, TrialState::Complete, Some(value)).unwrap();
        }
        let pruned = study.ask(&space(), &mut rng).unwrap();
        study.tell(&pruned, TrialState::Pruned, None).unwrap();

        let summary = study.summary().unwrap();
        assert_eq!(summary.trials_total, 4);
        assert_eq!(summary.trials_completed, 3);
        assert_eq!(summary.trials_pruned, 1);
        assert_eq!(summary.best_value(), Some(1.0));
        assert_eq!(study.best_trial().unwrap().unwrap().number, 1);
    }

    #[test]
    fn reattaching_keeps_direction() {
        let storage: Arc<dyn StudyStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
        Study::create(storage.clone(), "s", StudyDirection::Maximize, true).unwrap();
        let again = Study::create(storage, "s", StudyDirection::Minimize, true).unwrap();
        assert_eq!(again.direction(), StudyDirection::Maximize);
    }
}
