//! Persistent study stores shared by every worker of a run.

mod journal;
mod sqlite;

pub use journal::JournalStorage;
pub use sqlite::SqliteStorage;

use rc_types::{StorageDescriptor, StorageError, StorageKind};

use crate::search::ParameterKind;
use crate::trial::{FrozenTrial, StudyDirection, StudyId, TrialId, TrialState};

/// Result type for study store operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable record of studies and their trials.
///
/// Implementations must allow several processes to use the same store at
/// once: trial numbers are assigned atomically and never repeat within a
/// study.
pub trait StudyStorage: Send + Sync {
    /// Create a study, or return the existing one when `load_if_exists`.
    fn create_study(&self, name: &str, direction: StudyDirection, load_if_exists: bool) -> StorageResult<StudyId>;

    fn study_id(&self, name: &str) -> StorageResult<StudyId>;

    fn study_direction(&self, study: StudyId) -> StorageResult<StudyDirection>;

    /// Start a new running trial with the next free number.
    fn create_trial(&self, study: StudyId) -> StorageResult<FrozenTrial>;

    fn set_param(&self, trial: TrialId, name: &str, value: f64, kind: &ParameterKind) -> StorageResult<()>;

    fn set_user_attr(&self, trial: TrialId, key: &str, value: serde_json::Value) -> StorageResult<()>;

    fn report_intermediate(&self, trial: TrialId, step: u64, value: f64) -> StorageResult<()>;

    /// Move a running trial to a finished state.
    fn finish_trial(&self, trial: TrialId, state: TrialState, value: Option<f64>) -> StorageResult<()>;

    fn trial(&self, trial: TrialId) -> StorageResult<FrozenTrial>;

    /// All trials of a study ordered by number.
    fn trials(&self, study: StudyId) -> StorageResult<Vec<FrozenTrial>>;
}

/// Open the store a configuration document points at.
pub fn open_storage(descriptor: &StorageDescriptor) -> StorageResult<Box<dyn StudyStorage>> {
    let location = descriptor.location();
    tracing::info!("Opening {} study storage at {}", descriptor.kind, location.display());
    match descriptor.kind {
        StorageKind::Sqlite => Ok(Box::new(SqliteStorage::open(&location)?)),
        StorageKind::Journal => Ok(Box::new(JournalStorage::open(&location)?)),
    }
}

#[cfg(test)]
mod conformance {
    //! Behaviour every backend must share.

    use super::*;

    pub fn study_lifecycle(storage: &dyn StudyStorage) {
        let study = storage
            .create_study("trial_0_0_0.06_local", StudyDirection::Minimize, false)
            .unwrap();
        assert_eq!(storage.study_id("trial_0_0_0.06_local").unwrap(), study);
        assert_eq!(storage.study_direction(study).unwrap(), StudyDirection::Minimize);

        let again = storage
            .create_study("trial_0_0_0.06_local", StudyDirection::Minimize, true)
            .unwrap();
        assert_eq!(again, study);
        assert!(matches!(
            storage.create_study("trial_0_0_0.06_local", StudyDirection::Minimize, false),
            Err(StorageError::StudyExists { .. })
        ));
        assert!(matches!(
            storage.study_id("missing"),
            Err(StorageError::StudyNotFound { .. })
        ));
    }

    pub fn trial_lifecycle(storage: &dyn StudyStorage) {
        let study = storage.create_study("s", StudyDirection::Minimize, true).unwrap();
        let kind = ParameterKind::LogUniform { low: 0.1, high: 10.0 };

        let first = storage.create_trial(study).unwrap();
        assert_eq!(first.number, 0);
        assert_eq!(first.state, TrialState::Running);
        storage.set_param(first.trial_id, "cohesion_scaled", 2.0, &kind).unwrap();
        storage
            .set_user_attr(first.trial_id, "cohesion", serde_json::json!(2000.0))
            .unwrap();
        storage.report_intermediate(first.trial_id, 0, 1.25).unwrap();
        storage.finish_trial(first.trial_id, TrialState::Complete, Some(1.25)).unwrap();

        let second = storage.create_trial(study).unwrap();
        assert_eq!(second.number, 1);
        storage.finish_trial(second.trial_id, TrialState::Pruned, None).unwrap();

        assert!(matches!(
            storage.finish_trial(second.trial_id, TrialState::Complete, Some(0.0)),
            Err(StorageError::TrialFinished { .. })
        ));
        assert!(matches!(
            storage.report_intermediate(second.trial_id, 1, 0.0),
            Err(StorageError::TrialFinished { .. })
        ));
        assert!(matches!(
            storage.trial(9_999),
            Err(StorageError::TrialNotFound { .. })
        ));

        let trials = storage.trials(study).unwrap();
        assert_eq!(trials.len(), 2);
        let done = &trials[0];
        assert_eq!(done.state, TrialState::Complete);
        assert_eq!(done.value, Some(1.25));
        assert_eq!(done.params["cohesion_scaled"], 2.0);
        assert_eq!(done.user_attrs["cohesion"], serde_json::json!(2000.0));
        assert_eq!(done.intermediate_values[&0], 1.25);
        assert!(done.datetime_complete.is_some());
        assert_eq!(trials[1].state, TrialState::Pruned);
        assert_eq!(storage.trial(second.trial_id).unwrap().number, 1);
    }

    pub fn numbering_is_per_study(storage: &dyn StudyStorage) {
        let a = storage.create_study("a", StudyDirection::Minimize, true).unwrap();
        let b = storage.create_study("b", StudyDirection::Maximize, true).unwrap();
        storage.create_trial(a).unwrap();
        storage.create_trial(a).unwrap();
        assert_eq!(storage.create_trial(b).unwrap().number, 0);
        assert_eq!(storage.create_trial(a).unwrap().number, 2);
        assert!(matches!(
            storage.create_trial(12_345),
            Err(StorageError::StudyNotFound { .. })
        ));
    }
}
