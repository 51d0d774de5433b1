//! Trial records and study-level bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::search::Params;

/// Storage-assigned study identifier.
pub type StudyId = i64;
/// Storage-assigned trial identifier, unique across studies.
pub type TrialId = i64;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudyDirection {
    #[default]
    Minimize,
    Maximize,
}

impl StudyDirection {
    /// True when `a` is a better objective than `b`.
    pub fn is_better(&self, a: f64, b: f64) -> bool {
        match self {
            Self::Minimize => a < b,
            Self::Maximize => a > b,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimize => "MINIMIZE",
            Self::Maximize => "MAXIMIZE",
        }
    }
}

impl FromStr for StudyDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MINIMIZE" => Ok(Self::Minimize),
            "MAXIMIZE" => Ok(Self::Maximize),
            other => Err(format!("unknown study direction {other}")),
        }
    }
}

/// Lifecycle state of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Fail,
}

impl TrialState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Pruned => "PRUNED",
            Self::Fail => "FAIL",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETE" => Ok(Self::Complete),
            "PRUNED" => Ok(Self::Pruned),
            "FAIL" => Ok(Self::Fail),
            other => Err(format!("unknown trial state {other}")),
        }
    }
}

/// Snapshot of a trial as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub trial_id: TrialId,
    /// Position in the study, 0-based and gap-free across workers.
    pub number: u64,
    pub state: TrialState,
    pub value: Option<f64>,
    pub params: Params,
    pub user_attrs: BTreeMap<String, serde_json::Value>,
    /// Reported intermediate objective values keyed by step.
    pub intermediate_values: BTreeMap<u64, f64>,
    pub datetime_start: DateTime<Utc>,
    pub datetime_complete: Option<DateTime<Utc>>,
}

impl FrozenTrial {
    pub fn new(trial_id: TrialId, number: u64) -> Self {
        Self {
            trial_id,
            number,
            state: TrialState::Running,
            value: None,
            params: Params::new(),
            user_attrs: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
            datetime_start: Utc::now(),
            datetime_complete: None,
        }
    }

    pub fn with_state(mut self, state: TrialState, value: Option<f64>) -> Self {
        self.state = state;
        self.value = value;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_intermediate(mut self, step: u64, value: f64) -> Self {
        self.intermediate_values.insert(step, value);
        self
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.datetime_complete
            .map(|end| (end - self.datetime_start).num_milliseconds() as f64 / 1000.0)
    }
}

/// Aggregate status of a study after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub study_name: String,
    pub direction: StudyDirection,
    pub trials_total: usize,
    pub trials_completed: usize,
    pub trials_pruned: usize,
    pub trials_failed: usize,
    pub trials_running: usize,
    pub best_trial: Option<FrozenTrial>,
}

impl StudySummary {
    pub fn from_trials(study_name: impl Into<String>, direction: StudyDirection, trials: &[FrozenTrial]) -> Self {
        let count = |state: TrialState| trials.iter().filter(|t| t.state == state).count();
        Self {
            study_name: study_name.into(),
            direction,
            trials_total: trials.len(),
            trials_completed: count(TrialState::Complete),
            trials_pruned: count(TrialState::Pruned),
            trials_failed: count(TrialState::Fail),
            trials_running: count(TrialState::Running),
            best_trial: best_trial(trials, direction).cloned(),
        }
    }

    pub fn best_value(&self) -> Option<f64> {
        self.best_trial.as_ref().and_then(|t| t.value)
    }
}

/// Best completed trial; ties go to the earlier trial.
pub fn best_trial(trials: &[FrozenTrial], direction: StudyDirection) -> Option<&FrozenTrial> {
    trials
        .iter()
        .filter(|t| t.state == TrialState::Complete)
        .filter_map(|t| t.value.filter(|v| !v.is_nan()).map(|v| (t, v)))
        .fold(None, |best: Option<(&FrozenTrial, f64)>, (t, v)| match best {
            Some((_, bv)) if !direction.is_better(v, bv) => best,
            _ => Some((t, v)),
        })
        .map(|(t, _)| t)
}
