use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use rc_types::StorageError;

use super::{StorageResult, StudyStorage};
use crate::search::ParameterKind;
use crate::trial::{FrozenTrial, StudyDirection, StudyId, TrialId, TrialState};

/// One line of the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    worker_id: Uuid,
    #[serde(flatten)]
    op: JournalOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    CreateStudy {
        study_id: StudyId,
        study_name: String,
        direction: StudyDirection,
    },
    CreateTrial {
        study_id: StudyId,
        trial_id: TrialId,
        number: u64,
        datetime_start: DateTime<Utc>,
    },
    SetParam {
        trial_id: TrialId,
        name: String,
        value: f64,
        distribution: ParameterKind,
    },
    SetUserAttr {
        trial_id: TrialId,
        key: String,
        value: serde_json::Value,
    },
    ReportIntermediate {
        trial_id: TrialId,
        step: u64,
        value: Option<f64>,
    },
    FinishTrial {
        trial_id: TrialId,
        state: TrialState,
        value: Option<f64>,
        datetime_complete: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct StudyRecord {
    study_id: StudyId,
    name: String,
    direction: StudyDirection,
}

/// In-memory state rebuilt from the journal.
#[derive(Debug, Default)]
struct Replay {
    studies: Vec<StudyRecord>,
    trials: BTreeMap<TrialId, (StudyId, FrozenTrial)>,
}

impl Replay {
    fn from_text(text: &str, source: &Path) -> Self {
        let mut replay = Self::default();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => replay.apply(entry.op),
                Err(e) => tracing::warn!(
                    "Skipping unreadable journal line {} in {}: {}",
                    line_no + 1,
                    source.display(),
                    e
                ),
            }
        }
        replay
    }

    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::CreateStudy {
                study_id,
                study_name,
                direction,
            } => self.studies.push(StudyRecord {
                study_id,
                name: study_name,
                direction,
            }),
            JournalOp::CreateTrial {
                study_id,
                trial_id,
                number,
                datetime_start,
            } => {
                let mut trial = FrozenTrial::new(trial_id, number);
                trial.datetime_start = datetime_start;
                self.trials.insert(trial_id, (study_id, trial));
            }
            JournalOp::SetParam {
                trial_id, name, value, ..
            } => {
                if let Some(trial) = self.trial_mut(trial_id) {
                    trial.params.insert(name, value);
                }
            }
            JournalOp::SetUserAttr { trial_id, key, value } => {
                if let Some(trial) = self.trial_mut(trial_id) {
                    trial.user_attrs.insert(key, value);
                }
            }
            JournalOp::ReportIntermediate { trial_id, step, value } => {
                if let Some(trial) = self.trial_mut(trial_id) {
                    trial.intermediate_values.insert(step, value.unwrap_or(f64::NAN));
                }
            }
            JournalOp::FinishTrial {
                trial_id,
                state,
                value,
                datetime_complete,
            } => {
                if let Some(trial) = self.trial_mut(trial_id) {
                    trial.state = state;
                    trial.value = value;
                    trial.datetime_complete = Some(datetime_complete);
                }
            }
        }
    }

    fn trial_mut(&mut self, trial_id: TrialId) -> Option<&mut FrozenTrial> {
        let found = self.trials.get_mut(&trial_id).map(|(_, t)| t);
        if found.is_none() {
            tracing::warn!("Journal references unknown trial {}", trial_id);
        }
        found
    }

    fn study_by_name(&self, name: &str) -> Option<&StudyRecord> {
        self.studies.iter().find(|s| s.name == name)
    }

    fn study(&self, study_id: StudyId) -> StorageResult<&StudyRecord> {
        self.studies
            .iter()
            .find(|s| s.study_id == study_id)
            .ok_or_else(|| StorageError::StudyNotFound {
                name: study_id.to_string(),
            })
    }

    fn trial(&self, trial_id: TrialId) -> StorageResult<&FrozenTrial> {
        self.trials
            .get(&trial_id)
            .map(|(_, t)| t)
            .ok_or(StorageError::TrialNotFound { trial_id })
    }

    fn running(&self, trial_id: TrialId) -> StorageResult<&FrozenTrial> {
        let trial = self.trial(trial_id)?;
        if trial.state.is_finished() {
            return Err(StorageError::TrialFinished { trial_id });
        }
        Ok(trial)
    }

    fn next_study_id(&self) -> StudyId {
        self.studies.iter().map(|s| s.study_id).max().map_or(0, |id| id + 1)
    }

    fn next_trial_id(&self) -> TrialId {
        self.trials.keys().next_back().map_or(0, |id| id + 1)
    }

    fn next_number(&self, study_id: StudyId) -> u64 {
        self.trials
            .values()
            .filter(|(s, _)| *s == study_id)
            .map(|(_, t)| t.number + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Study store in an append-only JSON-lines file.
///
/// Every mutation takes an exclusive lock on the file, replays it, checks
/// the operation against the replayed state and appends one line. Readers
/// take a shared lock.
pub struct JournalStorage {
    path: PathBuf,
    worker_id: Uuid,
}

impl JournalStorage {
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| journal_err(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| journal_err(path, e))?;

        let worker_id = Uuid::new_v4();
        tracing::debug!("Journal worker {} attached to {}", worker_id, path.display());
        Ok(Self {
            path: path.to_path_buf(),
            worker_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    fn snapshot(&self) -> StorageResult<Replay> {
        let file = File::open(&self.path).map_err(|e| journal_err(&self.path, e))?;
        let lock = RwLock::new(file);
        let guard = lock.read().map_err(|e| StorageError::Locked {
            message: format!("shared lock on {}: {}", self.path.display(), e),
        })?;
        let mut text = String::new();
        (&*guard)
            .read_to_string(&mut text)
            .map_err(|e| journal_err(&self.path, e))?;
        Ok(Replay::from_text(&text, &self.path))
    }

    /// Run `decide` against the current state under the exclusive lock and
    /// append the operation it returns, if any.
    fn mutate<T>(&self, decide: impl FnOnce(&Replay) -> StorageResult<(Option<JournalOp>, T)>) -> StorageResult<T> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| journal_err(&self.path, e))?;
        let mut lock = RwLock::new(file);
        let mut guard = lock.write().map_err(|e| StorageError::Locked {
            message: format!("exclusive lock on {}: {}", self.path.display(), e),
        })?;

        let mut text = String::new();
        guard
            .read_to_string(&mut text)
            .map_err(|e| journal_err(&self.path, e))?;
        let replay = Replay::from_text(&text, &self.path);

        let (op, out) = decide(&replay)?;
        if let Some(op) = op {
            let entry = JournalEntry {
                worker_id: self.worker_id,
                op,
            };
            let mut line = serde_json::to_string(&entry).map_err(|e| StorageError::Journal {
                message: e.to_string(),
            })?;
            line.push('\n');
            // Terminate a line left partial by a crashed writer.
            if !text.is_empty() && !text.ends_with('\n') {
                line.insert(0, '\n');
            }
            guard
                .write_all(line.as_bytes())
                .and_then(|_| guard.sync_data())
                .map_err(|e| journal_err(&self.path, e))?;
        }
        Ok(out)
    }
}

fn journal_err(path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Journal {
        message: format!("{}: {}", path.display(), e),
    }
}

fn non_nan(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !v.is_nan())
}

impl StudyStorage for JournalStorage {
    fn create_study(&self, name: &str, direction: StudyDirection, load_if_exists: bool) -> StorageResult<StudyId> {
        self.mutate(|replay| match replay.study_by_name(name) {
            Some(study) if load_if_exists => {
                tracing::info!("Loading existing study {} (id {})", name, study.study_id);
                Ok((None, study.study_id))
            }
            Some(_) => Err(StorageError::StudyExists { name: name.to_string() }),
            None => {
                let study_id = replay.next_study_id();
                tracing::info!("Created study {} (id {})", name, study_id);
                let op = JournalOp::CreateStudy {
                    study_id,
                    study_name: name.to_string(),
                    direction,
                };
                Ok((Some(op), study_id))
            }
        })
    }

    fn study_id(&self, name: &str) -> StorageResult<StudyId> {
        self.snapshot()?
            .study_by_name(name)
            .map(|s| s.study_id)
            .ok_or_else(|| StorageError::StudyNotFound { name: name.to_string() })
    }

    fn study_direction(&self, study: StudyId) -> StorageResult<StudyDirection> {
        Ok(self.snapshot()?.study(study)?.direction)
    }

    fn create_trial(&self, study: StudyId) -> StorageResult<FrozenTrial> {
        self.mutate(|replay| {
            replay.study(study)?;
            let trial = FrozenTrial::new(replay.next_trial_id(), replay.next_number(study));
            let op = JournalOp::CreateTrial {
                study_id: study,
                trial_id: trial.trial_id,
                number: trial.number,
                datetime_start: trial.datetime_start,
            };
            Ok((Some(op), trial))
        })
    }

    fn set_param(&self, trial: TrialId, name: &str, value: f64, kind: &ParameterKind) -> StorageResult<()> {
        self.mutate(|replay| {
            replay.running(trial)?;
            let op = JournalOp::SetParam {
                trial_id: trial,
                name: name.to_string(),
                value,
                distribution: *kind,
            };
            Ok((Some(op), ()))
        })
    }

    fn set_user_attr(&self, trial: TrialId, key: &str, value: serde_json::Value) -> StorageResult<()> {
        self.mutate(|replay| {
            replay.running(trial)?;
            let op = JournalOp::SetUserAttr {
                trial_id: trial,
                key: key.to_string(),
                value,
            };
            Ok((Some(op), ()))
        })
    }

    fn report_intermediate(&self, trial: TrialId, step: u64, value: f64) -> StorageResult<()> {
        self.mutate(|replay| {
            replay.running(trial)?;
            let op = JournalOp::ReportIntermediate {
                trial_id: trial,
                step,
                value: non_nan(Some(value)),
            };
            Ok((Some(op), ()))
        })
    }

    fn finish_trial(&self, trial: TrialId, state: TrialState, value: Option<f64>) -> StorageResult<()> {
        self.mutate(|replay| {
            replay.running(trial)?;
            let op = JournalOp::FinishTrial {
                trial_id: trial,
                state,
                value: non_nan(value),
                datetime_complete: Utc::now(),
            };
            Ok((Some(op), ()))
        })
    }

    fn trial(&self, trial: TrialId) -> StorageResult<FrozenTrial> {
        self.snapshot()?.trial(trial).cloned()
    }

    fn trials(&self, study: StudyId) -> StorageResult<Vec<FrozenTrial>> {
        let replay = self.snapshot()?;
        replay.study(study)?;
        let mut trials: Vec<FrozenTrial> = replay
            .trials
            .into_values()
            .filter(|(s, _)| *s == study)
            .map(|(_, t)| t)
            .collect();
        trials.sort_by_key(|t| t.number);
        Ok(trials)
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;
    use tempfile::TempDir;

    fn fresh(dir: &TempDir, name: &str) -> JournalStorage {
        JournalStorage::open(&dir.path().join(name)).unwrap()
    }

    #[test]
    fn journal_conformance() {
        let dir = TempDir::new().unwrap();
        conformance::study_lifecycle(&fresh(&dir, "a.log"));
        conformance::trial_lifecycle(&fresh(&dir, "b.log"));
        conformance::numbering_is_per_study(&fresh(&dir, "c.log"));
    }

    #[test]
    fn handles_on_one_file_see_each_other() {
        let dir = TempDir::new().unwrap();
        let a = fresh(&dir, "journal.log");
        let b = fresh(&dir, "journal.log");
        assert_ne!(a.worker_id(), b.worker_id());

        let study = a.create_study("s", StudyDirection::Minimize, true).unwrap();
        assert_eq!(b.study_id("s").unwrap(), study);

        let t0 = a.create_trial(study).unwrap();
        let t1 = b.create_trial(study).unwrap();
        assert_eq!((t0.number, t1.number), (0, 1));
        assert_ne!(t0.trial_id, t1.trial_id);

        b.finish_trial(t0.trial_id, TrialState::Complete, Some(3.0)).unwrap();
        assert_eq!(a.trial(t0.trial_id).unwrap().value, Some(3.0));
        assert!(matches!(
            a.finish_trial(t0.trial_id, TrialState::Fail, None),
            Err(StorageError::TrialFinished { .. })
        ));
    }

    #[test]
    fn lines_are_tagged_with_worker() {
        let dir = TempDir::new().unwrap();
        let storage = fresh(&dir, "journal.log");
        storage.create_study("s", StudyDirection::Maximize, false).unwrap();

        let text = std::fs::read_to_string(storage.path()).unwrap();
        let entry: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(entry["op"], "create_study");
        assert_eq!(entry["direction"], "MAXIMIZE");
        assert_eq!(entry["worker_id"], storage.worker_id().to_string());
    }

    #[test]
    fn partial_trailing_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let storage = fresh(&dir, "journal.log");
        let study = storage.create_study("s", StudyDirection::Minimize, false).unwrap();
        storage.create_trial(study).unwrap();

        let mut file = OpenOptions::new().append(true).open(storage.path()).unwrap();
        file.write_all(br#"{"worker_id":"x","op":"create_tr"#).unwrap();
        drop(file);

        let next = storage.create_trial(study).unwrap();
        assert_eq!(next.number, 1);
        assert_eq!(storage.trials(study).unwrap().len(), 2);
    }
}
