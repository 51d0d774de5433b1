//! Run identity: the identifiers that namespace studies and output files.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Identifiers derived once per worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Shared by every worker of one scheduler job; names the study and artifacts.
    pub run_id: String,
    /// Unique per worker; names the live output file.
    pub task_id: String,
}

impl RunIdentity {
    pub fn new(run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            task_id: run_id.clone(),
            run_id,
        }
    }

    /// Derive the identity from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), Local::now())
    }

    /// Under a scheduler (`HPC` set) the job and array-task ids are used,
    /// otherwise the wall-clock start time.
    pub fn from_lookup<F>(lookup: F, now: DateTime<Local>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let scheduled = lookup("HPC").is_some_and(|v| !v.is_empty());
        if scheduled {
            let job_id = lookup("SLURM_ARRAY_JOB_ID")
                .or_else(|| lookup("SLURM_JOB_ID"))
                .unwrap_or_else(|| "local".to_string());
            let task = lookup("SLURM_ARRAY_TASK_ID").unwrap_or_else(|| "0".to_string());
            Self {
                task_id: format!("{job_id}_{task}"),
                run_id: job_id,
            }
        } else {
            Self::new(now.format("%m%d-%H%M%S").to_string())
        }
    }

    /// Live output file this worker's simulator writes into.
    pub fn output_file(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("output_{}.csv", self.task_id))
    }

    /// Preserved copy of a sub-trial's output.
    pub fn artifact_path(
        &self,
        output_dir: &Path,
        kind: ArtifactKind,
        trial_number: u64,
        sub_trial: usize,
    ) -> PathBuf {
        output_dir.join(format!(
            "{}_{}_{}_{}.csv",
            kind.prefix(),
            self.run_id,
            trial_number,
            sub_trial
        ))
    }
}

/// Which outcome a preserved output file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    Successful,
    Pruned,
}

impl ArtifactKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Successful => "successful_output",
            Self::Pruned => "pruned_output",
        }
    }
}

/// Stable study name for one logical calibration run.
pub fn study_name(t_init: f64, t_fin: f64, spacing: f64, run_id: &str) -> String {
    format!("trial_{t_init}_{t_fin}_{spacing}_{run_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 8, 1, 21, 51, 31).unwrap()
    }

    #[test]
    fn wall_clock_identity_outside_scheduler() {
        let identity = RunIdentity::from_lookup(|_| None, fixed_now());
        assert_eq!(identity.run_id, "0801-215131");
        assert_eq!(identity.task_id, "0801-215131");
    }

    #[test]
    fn scheduler_identity_uses_array_ids() {
        let env: HashMap<&str, &str> = [
            ("HPC", "1"),
            ("SLURM_ARRAY_JOB_ID", "884211"),
            ("SLURM_JOB_ID", "884215"),
            ("SLURM_ARRAY_TASK_ID", "3"),
        ]
        .into_iter()
        .collect();
        let identity =
            RunIdentity::from_lookup(|k| env.get(k).map(|v| v.to_string()), fixed_now());
        assert_eq!(identity.run_id, "884211");
        assert_eq!(identity.task_id, "884211_3");

        let out = identity.output_file(Path::new("logs"));
        assert_eq!(out, PathBuf::from("logs/output_884211_3.csv"));
    }

    #[test]
    fn artifact_names_are_namespaced() {
        let identity = RunIdentity::new("0801-215131");
        let path = identity.artifact_path(Path::new("logs"), ArtifactKind::Pruned, 12, 1);
        assert_eq!(path, PathBuf::from("logs/pruned_output_0801-215131_12_1.csv"));
    }

    #[test]
    fn study_name_formats_like_floats() {
        assert_eq!(study_name(0.0, 0.0, 0.06, "abc"), "trial_0_0_0.06_abc");
        assert_eq!(study_name(12.5, 90.0, 0.1, "7"), "trial_12.5_90_0.1_7");
    }
}
