// Trial executor - runs the external simulator for one sub-trial
// Owns the child process from spawn to exit and preserves its output file.

use async_trait::async_trait;
use parking_lot::Mutex;
use rc_types::{ArtifactKind, ExecutorError, RunIdentity, TrialConfiguration};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Simulator binary invoked when none is configured.
pub const DEFAULT_SIMULATOR: &str = "demo_cmars";

/// How a simulator is launched: program plus any arguments placed before
/// the configuration argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl SimulatorCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Default for SimulatorCommand {
    fn default() -> Self {
        Self::new(DEFAULT_SIMULATOR)
    }
}

/// Lifecycle of one sub-trial's child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubTrialState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

/// How a supervised sub-trial ended, short of a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum SubTrialOutcome {
    /// Exit code 0. `output` is the live output file, `artifact` its preserved copy.
    Succeeded { output: PathBuf, artifact: PathBuf },
    /// Non-zero exit. The enclosing trial should be pruned.
    Failed {
        exit_code: Option<i32>,
        artifact: Option<PathBuf>,
    },
}

impl SubTrialOutcome {
    pub fn state(&self) -> SubTrialState {
        match self {
            Self::Succeeded { .. } => SubTrialState::Succeeded,
            Self::Failed { .. } => SubTrialState::Failed,
        }
    }
}

/// Runs one sub-trial to completion.
#[async_trait]
pub trait SubTrialRunner: Send + Sync {
    async fn run(
        &self,
        config: &TrialConfiguration,
        trial_number: u64,
        sub_trial: usize,
    ) -> Result<SubTrialOutcome, ExecutorError>;
}

/// Spawns and supervises the simulator, one child at a time.
#[derive(Debug)]
pub struct TrialExecutor {
    command: SimulatorCommand,
    identity: RunIdentity,
    poll_interval: Duration,
    grace_period: Duration,
    time_limit: Option<Duration>,
    state: Mutex<SubTrialState>,
}

impl TrialExecutor {
    pub fn new(command: SimulatorCommand, identity: RunIdentity) -> Self {
        Self {
            command,
            identity,
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            time_limit: None,
            state: Mutex::new(SubTrialState::Pending),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Time a killed simulator is given to flush partial output.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Treat a run longer than `limit` as a fault.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// State of the most recent sub-trial.
    pub fn state(&self) -> SubTrialState {
        *self.state.lock()
    }

    fn transition(&self, to: SubTrialState) {
        let mut state = self.state.lock();
        debug!("Sub-trial state {:?} -> {:?}", *state, to);
        *state = to;
    }

    fn output_file(&self, config: &TrialConfiguration) -> PathBuf {
        config
            .results
            .trial_output_file
            .clone()
            .unwrap_or_else(|| self.identity.output_file(&config.results.trial_output_dir))
    }

    fn build_command(&self, config: &TrialConfiguration, argument: String) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.leading_args).arg(argument);
        if config.render {
            cmd.arg("-r");
        }
        if !config.verbose {
            cmd.stdout(Stdio::null());
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Poll the child once per interval until it exits.
    async fn supervise(&self, child: &mut Child) -> Result<ExitStatus, String> {
        let started = Instant::now();
        loop {
            match tokio::time::timeout(self.poll_interval, child.wait()).await {
                Ok(Ok(status)) => return Ok(status),
                Ok(Err(e)) => return Err(format!("wait failed: {e}")),
                Err(_) => {
                    if let Some(limit) = self.time_limit {
                        if started.elapsed() >= limit {
                            return Err(format!("exceeded time limit of {:?}", limit));
                        }
                    }
                }
            }
        }
    }

    /// Kill the child, allow it to flush, keep whatever it wrote.
    async fn abort(
        &self,
        child: &mut Child,
        output: &Path,
        artifact_dir: &Path,
        trial_number: u64,
        sub_trial: usize,
        message: String,
    ) -> ExecutorError {
        error!("[Trial {}] Sub-trial {} fault: {}", trial_number, sub_trial, message);
        if let Err(e) = child.kill().await {
            warn!("Unable to kill simulator: {}", e);
        }
        self.transition(SubTrialState::Killed);
        tokio::time::sleep(self.grace_period).await;

        let artifact = self.preserve(output, ArtifactKind::Pruned, artifact_dir, trial_number, sub_trial);
        ExecutorError::Fault {
            trial_number,
            sub_trial,
            message,
            artifact,
        }
    }

    /// Best-effort copy of the output file to its artifact path.
    fn preserve(
        &self,
        output: &Path,
        kind: ArtifactKind,
        dir: &Path,
        trial_number: u64,
        sub_trial: usize,
    ) -> Option<PathBuf> {
        let artifact = self.identity.artifact_path(dir, kind, trial_number, sub_trial);
        match std::fs::copy(output, &artifact) {
            Ok(_) => {
                info!("Saved {}", artifact.display());
                Some(artifact)
            }
            Err(e) => {
                warn!("Unable to save {}: {}", artifact.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl SubTrialRunner for TrialExecutor {
    async fn run(
        &self,
        config: &TrialConfiguration,
        trial_number: u64,
        sub_trial: usize,
    ) -> Result<SubTrialOutcome, ExecutorError> {
        self.transition(SubTrialState::Pending);
        let output = self.output_file(config);
        let artifact_dir = config.results.trial_output_dir.clone();

        // A stale file from an earlier attempt must never be scored.
        let parents = [output.parent(), Some(artifact_dir.as_path())];
        for dir in parents.into_iter().flatten().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| ExecutorError::OutputFile {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        std::fs::File::create(&output).map_err(|e| ExecutorError::OutputFile {
            path: output.display().to_string(),
            source: e,
        })?;

        let argument = config.to_argument().map_err(|e| ExecutorError::Fault {
            trial_number,
            sub_trial,
            message: format!("unable to serialize configuration: {e}"),
            artifact: None,
        })?;

        let mut child = self
            .build_command(config, argument)
            .spawn()
            .map_err(|e| ExecutorError::Spawn {
                program: self.command.program.clone(),
                source: e,
            })?;
        self.transition(SubTrialState::Running);
        info!(
            "[Trial {}] Sub-trial {} running {} (pid {:?})",
            trial_number,
            sub_trial,
            self.command.program,
            child.id()
        );

        let status = match self.supervise(&mut child).await {
            Ok(status) => status,
            Err(message) => {
                return Err(self
                    .abort(&mut child, &output, &artifact_dir, trial_number, sub_trial, message)
                    .await)
            }
        };

        if status.success() {
            let artifact = self.identity.artifact_path(&artifact_dir, ArtifactKind::Successful, trial_number, sub_trial);
            std::fs::copy(&output, &artifact).map_err(|e| ExecutorError::OutputFile {
                path: artifact.display().to_string(),
                source: e,
            })?;
            self.transition(SubTrialState::Succeeded);
            debug!("Saved {}", artifact.display());
            Ok(SubTrialOutcome::Succeeded { output, artifact })
        } else {
            warn!(
                "[Trial {}] Sub-trial {} simulator failed (exit code {:?})",
                trial_number,
                sub_trial,
                status.code()
            );
            let artifact = self.preserve(&output, ArtifactKind::Pruned, &artifact_dir, trial_number, sub_trial);
            self.transition(SubTrialState::Failed);
            Ok(SubTrialOutcome::Failed {
                exit_code: status.code(),
                artifact,
            })
        }
    }
}
