use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the rover calibration system
#[derive(Error, Debug)]
pub enum CalError {
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scoring error: {0}")]
    Score(#[from] ScoreError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Accelerator unavailable: {message}")]
    AcceleratorUnavailable { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while reading tagged time-series documents and tables
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Unable to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Required channel missing: {channel}")]
    MissingChannel { channel: String },

    #[error("Channel {channel} mixes numeric and flag values")]
    MixedChannel { channel: String },

    #[error("Columnar conversion failed: {message}")]
    Columnar { message: String },
}

impl TelemetryError {
    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors in the trial configuration document
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown storage backend: {kind}")]
    UnknownStorage { kind: String },

    #[error("Malformed configuration document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors that prevent a simulated run from being compared at all
#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("Recorded telemetry is missing channel {channel}")]
    MissingRecordedChannel { channel: String },

    #[error("Simulator output is missing column {column}")]
    MissingSimulatedColumn { column: String },

    #[error("Recorded telemetry has no samples to interpolate")]
    NoRecordedData,
}

/// Faults raised while supervising a simulator child process
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn simulator {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Simulator fault in trial {trial_number} sub-trial {sub_trial}: {message}")]
    Fault {
        trial_number: u64,
        sub_trial: usize,
        message: String,
        artifact: Option<PathBuf>,
    },

    #[error("Unable to prepare output file {path}: {source}")]
    OutputFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Study store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {message}")]
    Sqlite { message: String },

    #[error("Journal error: {message}")]
    Journal { message: String },

    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Study already exists: {name}")]
    StudyExists { name: String },

    #[error("Trial not found: {trial_id}")]
    TrialNotFound { trial_id: i64 },

    #[error("Trial {trial_id} is already finished")]
    TrialFinished { trial_id: i64 },

    #[error("Storage lock unavailable: {message}")]
    Locked { message: String },
}

/// Result type alias for calibration operations
pub type CalResult<T> = Result<T, CalError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! invalid_config {
    ($field:expr, $($arg:tt)*) => {
        $crate::ConfigError::InvalidValue {
            field: $field.to_string(),
            message: format!($($arg)*),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ExecutorError::Fault {
            trial_number: 7,
            sub_trial: 1,
            message: "wait failed".to_string(),
            artifact: None,
        };

        assert!(error.to_string().contains("trial 7"));
        assert!(error.to_string().contains("sub-trial 1"));
    }

    #[test]
    fn test_error_conversion() {
        let telemetry_error = TelemetryError::parse("sol.xml", "bad Time attribute");
        let cal_error: CalError = telemetry_error.into();

        match cal_error {
            CalError::Telemetry(TelemetryError::Parse { path, .. }) => assert_eq!(path, "sol.xml"),
            _ => panic!("Expected Telemetry error"),
        }
    }

    #[test]
    fn test_macros() {
        let err = invalid_config!("soil.cohesion_range", "low {} exceeds high {}", 2, 1);
        assert!(err.to_string().contains("soil.cohesion_range"));
        assert!(err.to_string().contains("low 2 exceeds high 1"));
    }
}
