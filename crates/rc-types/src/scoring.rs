//! Outcome of comparing one simulated run against recorded telemetry.

use serde::{Deserialize, Serialize};

/// Weight of the slip error inside [`Residuals::combined`].
pub const SLIP_WEIGHT: f64 = 10.0;
/// Weight applied to the differential-joint sum of squared errors.
pub const DIFFERENTIAL_WEIGHT: f64 = 10.0;

/// Whether a sub-trial produced enough output to be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoreFlag {
    Ok,
    InsufficientData,
}

/// Result of scoring one sub-trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialResult {
    /// Simulator output missing, unreadable, or shorter than three rows.
    InsufficientData,
    Ok(Residuals),
}

impl TrialResult {
    pub fn flag(&self) -> ScoreFlag {
        match self {
            Self::InsufficientData => ScoreFlag::InsufficientData,
            Self::Ok(_) => ScoreFlag::Ok,
        }
    }

    pub fn residuals(&self) -> Option<&Residuals> {
        match self {
            Self::Ok(residuals) => Some(residuals),
            Self::InsufficientData => None,
        }
    }
}

/// Residual metrics between a simulated and a recorded trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Residuals {
    /// Sum of squared X/Y/Z position errors over the run.
    pub residual: f64,
    /// Mean absolute slip-fraction error.
    pub slip_residual: f64,
    /// Mean over roll/pitch/yaw of the mean absolute error, degrees.
    pub rot_residual: f64,
    /// Weighted sum of squared differential-joint errors.
    pub diff_residual: f64,
    /// `SLIP_WEIGHT * slip_residual + residual`.
    pub combined: f64,
    /// Last simulator timestamp.
    pub t_end: f64,
}

impl Residuals {
    pub fn new(residual: f64, slip_residual: f64, rot_residual: f64, diff_residual: f64, t_end: f64) -> Self {
        Self {
            residual,
            slip_residual,
            rot_residual,
            diff_residual,
            combined: SLIP_WEIGHT * slip_residual + residual,
            t_end,
        }
    }

    /// Named values, in a stable order, for logging and trial metadata.
    pub fn metrics(&self) -> [(&'static str, f64); 6] {
        [
            ("residual", self.residual),
            ("slip_residual", self.slip_residual),
            ("rot_residual", self.rot_residual),
            ("diff_residual", self.diff_residual),
            ("combined", self.combined),
            ("t_end", self.t_end),
        ]
    }
}
