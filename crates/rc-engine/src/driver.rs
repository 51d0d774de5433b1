// Optimization driver - the calibration search loop
// Proposes soil parameters, runs every sub-trial through the executor,
// scores the output and records the outcome in the shared study.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rc_data::{load_recorded, LoadOptions, TelemetrySeries};
use rc_optimizer::{
    FrozenTrial, MedianPruner, Params, Sampler, SearchSpace, Study, StudyDirection, StudyStorage, StudySummary,
    TpeSampler, TrialState,
};
use rc_types::{study_name, CalError, CalResult, RunIdentity, SoilConfig, SoilPoint, TrialConfiguration, TrialResult};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::accelerator::{AcceleratorProbe, NvidiaSmiProbe};
use crate::executor::{SubTrialOutcome, SubTrialRunner};
use crate::scorer;

pub const COHESION: &str = "cohesion_scaled";
pub const BULK_DENSITY: &str = "bulk_density_scaled";
pub const FRICTION: &str = "friction_scaled";
pub const YOUNGS_MODULUS: &str = "youngs_modulus_scaled";
pub const POISSON_RATIO: &str = "poisson_ratio_scaled";

/// Directory under `trial_output_dir` holding parsed recorded telemetry.
pub const TELEMETRY_CACHE_DIR: &str = "telemetry_cache";

/// Completed trials the median pruner waits for.
pub const PRUNER_STARTUP_TRIALS: usize = 5;
/// Random trials before the TPE model is used.
pub const SAMPLER_STARTUP_TRIALS: usize = 15;

/// Search space over the configured soil ranges, in search units.
/// Cohesion and Young's modulus are log-uniform.
pub fn soil_search_space(soil: &SoilConfig) -> SearchSpace {
    SearchSpace::new()
        .add_log_uniform(COHESION, soil.cohesion_range[0], soil.cohesion_range[1])
        .add_float(BULK_DENSITY, soil.bulk_density_range[0], soil.bulk_density_range[1])
        .add_float(FRICTION, soil.friction_range[0], soil.friction_range[1])
        .add_log_uniform(YOUNGS_MODULUS, soil.youngs_modulus_range[0], soil.youngs_modulus_range[1])
        .add_float(POISSON_RATIO, soil.poisson_ratio_range[0], soil.poisson_ratio_range[1])
}

/// Scale sampled values into simulator units.
pub fn soil_point(params: &Params) -> CalResult<SoilPoint> {
    let get = |name: &str| {
        params
            .get(name)
            .copied()
            .ok_or_else(|| CalError::Internal(format!("trial has no value for {name}")))
    };
    Ok(SoilPoint::from_search_units(
        get(COHESION)?,
        get(BULK_DENSITY)?,
        get(FRICTION)?,
        get(YOUNGS_MODULUS)?,
        get(POISSON_RATIO)?,
    ))
}

/// Warmup for the median pruner. Steps are sub-trial indices counted from
/// the start of the drive, so the absolute clock `t_init` is not added.
pub fn pruner_warmup_steps(config: &TrialConfiguration) -> u64 {
    u64::from(config.optimizer.pruner_warmup)
}

/// How a trial ended as far as the loop is concerned.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TrialOutcome {
    Complete(f64),
    Pruned,
}

/// Runs a study for one calibration configuration.
pub struct Driver {
    config: TrialConfiguration,
    identity: RunIdentity,
    storage: Arc<dyn StudyStorage>,
    runner: Box<dyn SubTrialRunner>,
    probe: Box<dyn AcceleratorProbe>,
    sampler: Arc<dyn Sampler>,
    seed: Option<u64>,
}

impl Driver {
    pub fn new(
        config: TrialConfiguration,
        identity: RunIdentity,
        storage: Arc<dyn StudyStorage>,
        runner: Box<dyn SubTrialRunner>,
    ) -> Self {
        Self {
            config,
            identity,
            storage,
            runner,
            probe: Box::new(NvidiaSmiProbe),
            sampler: Arc::new(
                TpeSampler::new()
                    .with_startup_trials(SAMPLER_STARTUP_TRIALS)
                    .with_multivariate(true),
            ),
            seed: None,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn AcceleratorProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the default multivariate TPE sampler.
    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Name of the study this run writes to. The same configuration and
    /// run id always map to the same study.
    pub fn study_name(&self) -> String {
        let (t_init, t_fin) = self.config.time_span();
        study_name(t_init, t_fin, self.config.soil.spacing, &self.identity.run_id)
    }

    fn open_study(&self) -> CalResult<Study> {
        let warmup = pruner_warmup_steps(&self.config);
        let direction = StudyDirection::Minimize;

        let study = Study::create(self.storage.clone(), &self.study_name(), direction, true)?
            .with_sampler(Box::new(self.sampler.clone()))
            .with_pruner(Box::new(MedianPruner::new(PRUNER_STARTUP_TRIALS, warmup).with_direction(direction)));
        Ok(study)
    }

    /// Run `n_trials` trials and summarize the study.
    pub async fn run_study(&self, n_trials: usize) -> CalResult<StudySummary> {
        if self.config.misc.gpu_check {
            info!("GPU check...");
            if let Err(message) = self.probe.check() {
                error!("No GPU detected. Aborting");
                return Err(CalError::AcceleratorUnavailable { message });
            }
        }

        let recorded = self.load_recorded()?;
        let study = self.open_study()?;
        let space = soil_search_space(&self.config.soil);
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let existing = study.trials()?.len();
        info!(
            "Study {} with {} existing trials, running {} more (sampler {})",
            study.name(),
            existing,
            n_trials,
            study.sampler_name()
        );

        for _ in 0..n_trials {
            self.run_trial(&study, &space, &recorded, &mut rng).await?;
        }

        let summary = study.summary()?;
        info!(
            "Study {}: {} complete, {} pruned, {} failed, best value {:?}",
            summary.study_name,
            summary.trials_completed,
            summary.trials_pruned,
            summary.trials_failed,
            summary.best_value()
        );
        Ok(summary)
    }

    fn load_recorded(&self) -> CalResult<Vec<TelemetrySeries>> {
        let options = LoadOptions::new().with_cache_dir(self.config.results.trial_output_dir.join(TELEMETRY_CACHE_DIR));
        self.config
            .trials
            .iter()
            .map(|spec| {
                info!("Loading recorded telemetry: {}", spec.sim_input_dirs);
                load_recorded(&spec.sim_input_dirs, &options).map_err(CalError::from)
            })
            .collect()
    }

    async fn run_trial(
        &self,
        study: &Study,
        space: &SearchSpace,
        recorded: &[TelemetrySeries],
        rng: &mut StdRng,
    ) -> CalResult<()> {
        let mut trial = study.ask(space, rng)?;

        match self.evaluate(study, &mut trial, recorded).await {
            Ok(TrialOutcome::Complete(value)) if value.is_nan() => {
                warn!("[Trial {}] Objective is undefined", trial.number);
                study.tell(&trial, TrialState::Fail, None)?;
            }
            Ok(TrialOutcome::Complete(value)) => study.tell(&trial, TrialState::Complete, Some(value))?,
            Ok(TrialOutcome::Pruned) => study.tell(&trial, TrialState::Pruned, None)?,
            Err(CalError::Storage(e)) => {
                error!("[Trial {}] Study storage failed: {}", trial.number, e);
                if let Err(mark) = study.tell(&trial, TrialState::Fail, None) {
                    warn!("[Trial {}] Unable to mark trial failed: {}", trial.number, mark);
                }
                return Err(e.into());
            }
            Err(e) => {
                error!("[Trial {}] Failed: {}", trial.number, e);
                study.tell(&trial, TrialState::Fail, None)?;
            }
        }
        Ok(())
    }

    async fn evaluate(
        &self,
        study: &Study,
        trial: &mut FrozenTrial,
        recorded: &[TelemetrySeries],
    ) -> CalResult<TrialOutcome> {
        let point = soil_point(&trial.params)?;
        for (name, value) in point.as_pairs() {
            study.set_user_attr(trial, name, json!(value))?;
        }

        let config = self.config.with_soil_point(&point);
        let output_file = self.identity.output_file(&config.results.trial_output_dir);
        let mut objective = None;

        for (i, recorded) in recorded.iter().enumerate() {
            let sub_config = config.for_sub_trial(i, &output_file)?;
            info!("[Trial {}] Sub-trial {}: starting for params ... {}", trial.number, i, point);

            let output = match self.runner.run(&sub_config, trial.number, i).await? {
                SubTrialOutcome::Succeeded { output, .. } => output,
                SubTrialOutcome::Failed { exit_code, .. } => {
                    warn!(
                        "[Trial {}] Sub-trial {} subprocess failed (exit code {:?}), pruning",
                        trial.number, i, exit_code
                    );
                    return Ok(TrialOutcome::Pruned);
                }
            };

            let residuals = match scorer::score_file(recorded, &output)? {
                TrialResult::Ok(residuals) => residuals,
                TrialResult::InsufficientData if i == 0 => {
                    warn!("[Trial {}] Sub-trial {} produced insufficient output, pruning", trial.number, i);
                    return Ok(TrialOutcome::Pruned);
                }
                TrialResult::InsufficientData => {
                    warn!("[Trial {}] Sub-trial {} produced insufficient output", trial.number, i);
                    continue;
                }
            };

            for (name, value) in residuals.metrics() {
                study.set_user_attr(trial, &format!("sub{i}_{name}"), json!(value))?;
            }
            info!("[Trial {}] Sub-trial {} scored {:?}", trial.number, i, residuals);

            let step = i as u64;
            study.report(trial, step, residuals.residual)?;
            if study.should_prune(trial, step)? {
                info!("[Trial {}] Pruned at step {}", trial.number, step);
                return Ok(TrialOutcome::Pruned);
            }

            if i == 0 {
                objective = Some(residuals.residual);
            }
        }

        Ok(TrialOutcome::Complete(objective.unwrap_or(f64::NAN)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::StaticProbe;
    use async_trait::async_trait;
    use crate::test_support::CapturedLog;
    use rc_data::SeriesStore;
    use rc_optimizer::{ParameterKind, RandomSampler, SqliteStorage, StorageResult, StudyId, TrialId};
    use rc_types::{ExecutorError, StorageError, TemplateParams};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    const SIM_HEADER: &str = "m_clock,x,y,z,q_x,q_y,q_z,q_w,slip,lb_rot,rb_rot";
    const RECORDED_HEADER: &str = "SCLK,ROVER_X [METERS],ROVER_Y [METERS],ROVER_Z [METERS],QUAT_X,QUAT_Y,QUAT_Z,QUAT_C,SLIP,LEFT_DIFFERENTIAL,RIGHT_DIFFERENTIAL";

    fn rows(n: usize) -> String {
        (0..n).map(|t| format!("{t},1,2,3,0,0,0,1,0.1,0.05,-0.05\n")).collect()
    }

    #[derive(Clone)]
    enum Behaviour {
        Write(String),
        /// Each call drifts one metre further in x.
        Drift,
        Exit(i32),
        Fault,
    }

    struct ScriptedRunner {
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SubTrialRunner for ScriptedRunner {
        async fn run(
            &self,
            config: &TrialConfiguration,
            trial_number: u64,
            sub_trial: usize,
        ) -> Result<SubTrialOutcome, ExecutorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let output = config.results.trial_output_file.clone().unwrap();
            match &self.behaviour {
                Behaviour::Drift => {
                    let body: String = (0..5).map(|t| format!("{t},{},2,3,0,0,0,1,0.1,0.05,-0.05\n", 1 + call)).collect();
                    std::fs::write(&output, format!("{SIM_HEADER}\n{body}")).unwrap();
                    Ok(SubTrialOutcome::Succeeded {
                        artifact: output.clone(),
                        output,
                    })
                }
                Behaviour::Write(body) => {
                    std::fs::write(&output, body).unwrap();
                    Ok(SubTrialOutcome::Succeeded {
                        artifact: output.clone(),
                        output,
                    })
                }
                Behaviour::Exit(code) => Ok(SubTrialOutcome::Failed {
                    exit_code: Some(*code),
                    artifact: None,
                }),
                Behaviour::Fault => Err(ExecutorError::Fault {
                    trial_number,
                    sub_trial,
                    message: "wait failed".to_string(),
                    artifact: None,
                }),
            }
        }
    }

    /// Delegates to SQLite but rejects per-sub-trial attributes.
    struct BrokenAttrs(Arc<dyn StudyStorage>);

    impl StudyStorage for BrokenAttrs {
        fn create_study(&self, name: &str, direction: StudyDirection, load_if_exists: bool) -> StorageResult<StudyId> {
            self.0.create_study(name, direction, load_if_exists)
        }

        fn study_id(&self, name: &str) -> StorageResult<StudyId> {
            self.0.study_id(name)
        }

        fn study_direction(&self, study: StudyId) -> StorageResult<StudyDirection> {
            self.0.study_direction(study)
        }

        fn create_trial(&self, study: StudyId) -> StorageResult<FrozenTrial> {
            self.0.create_trial(study)
        }

        fn set_param(&self, trial: TrialId, name: &str, value: f64, kind: &ParameterKind) -> StorageResult<()> {
            self.0.set_param(trial, name, value, kind)
        }

        fn set_user_attr(&self, trial: TrialId, key: &str, value: serde_json::Value) -> StorageResult<()> {
            if key.starts_with("sub0_") {
                return Err(StorageError::Sqlite {
                    message: "database is locked".to_string(),
                });
            }
            self.0.set_user_attr(trial, key, value)
        }

        fn report_intermediate(&self, trial: TrialId, step: u64, value: f64) -> StorageResult<()> {
            self.0.report_intermediate(trial, step, value)
        }

        fn finish_trial(&self, trial: TrialId, state: TrialState, value: Option<f64>) -> StorageResult<()> {
            self.0.finish_trial(trial, state, value)
        }

        fn trial(&self, trial: TrialId) -> StorageResult<FrozenTrial> {
            self.0.trial(trial)
        }

        fn trials(&self, study: StudyId) -> StorageResult<Vec<FrozenTrial>> {
            self.0.trials(study)
        }
    }

    struct Fixture {
        dir: TempDir,
        config: TrialConfiguration,
    }

    impl Fixture {
        fn new(sub_trials: usize) -> Self {
            let dir = tempdir().unwrap();
            let recorded = dir.path().join("open_loop.csv");
            std::fs::write(&recorded, format!("{RECORDED_HEADER}\n{}", rows(5))).unwrap();

            let mut config = TrialConfiguration::template(TemplateParams {
                telemetry_csv: recorded.display().to_string(),
                output_dir: dir.path().join("logs"),
                heightmaps: vec!["terrain.ht".to_string()],
                bulk_density_range: [1.2, 2.0],
                cohesion_range: [0.1, 10.0],
                friction_range: [0.4, 0.9],
                youngs_modulus_range: [0.5, 50.0],
                poisson_ratio_range: [0.2, 0.4],
                initial_sclk: 0.0,
                runtime: 4.0,
                height: 0.4,
                spacing: 0.06,
                step_size_cfd: 2e-3,
                n_trials: 3,
            });
            let first = config.trials[0].clone();
            config.trials = vec![first; sub_trials];
            std::fs::create_dir_all(&config.results.trial_output_dir).unwrap();
            Self { dir, config }
        }

        fn storage(&self) -> Arc<dyn StudyStorage> {
            Arc::new(SqliteStorage::open(&self.dir.path().join("optuna_study.db")).unwrap())
        }

        fn driver(&self, behaviour: Behaviour, calls: Arc<AtomicUsize>) -> Driver {
            self.driver_on(self.storage(), behaviour, calls)
        }

        fn driver_on(&self, storage: Arc<dyn StudyStorage>, behaviour: Behaviour, calls: Arc<AtomicUsize>) -> Driver {
            let runner = ScriptedRunner { behaviour, calls };
            Driver::new(self.config.clone(), RunIdentity::new("0801-215131"), storage, Box::new(runner))
                .with_sampler(Arc::new(RandomSampler))
                .with_seed(11)
        }
    }

    fn identical_output() -> Behaviour {
        Behaviour::Write(format!("{SIM_HEADER}\n{}", rows(5)))
    }

    #[test]
    fn search_space_matches_soil_ranges() {
        let fixture = Fixture::new(1);
        let space = soil_search_space(&fixture.config.soil);
        assert_eq!(space.len(), 5);
        assert_eq!(
            space.get(COHESION).unwrap().kind,
            ParameterKind::LogUniform { low: 0.1, high: 10.0 }
        );
        assert_eq!(
            space.get(FRICTION).unwrap().kind,
            ParameterKind::FloatRange { low: 0.4, high: 0.9 }
        );
    }

    #[test]
    fn soil_point_applies_unit_scaling() {
        let params: Params = [
            (COHESION, 2.0),
            (BULK_DENSITY, 1.5),
            (FRICTION, 0.6),
            (YOUNGS_MODULUS, 3.0),
            (POISSON_RATIO, 0.3),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let point = soil_point(&params).unwrap();
        assert_eq!(point.cohesion, 2000.0);
        assert_eq!(point.bulk_density, 1500.0);
        assert_eq!(point.youngs_modulus, 3.0e6);
        assert_eq!(point.friction, 0.6);

        assert!(soil_point(&Params::new()).is_err());
    }

    #[test]
    fn study_name_uses_first_sub_trial_span() {
        let fixture = Fixture::new(1);
        let driver = fixture.driver(identical_output(), Arc::default());
        assert_eq!(driver.study_name(), "trial_0_4_0.06_0801-215131");
    }

    #[tokio::test]
    async fn identical_output_completes_with_zero_objective() {
        let fixture = Fixture::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let summary = fixture.driver(identical_output(), calls.clone()).run_study(3).await.unwrap();

        assert_eq!(summary.trials_total, 3);
        assert_eq!(summary.trials_completed, 3);
        assert_eq!(summary.best_value(), Some(0.0));
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let best = summary.best_trial.unwrap();
        assert_eq!(best.user_attrs["sub0_residual"], json!(0.0));
        assert!(best.user_attrs.contains_key("sub1_combined"));
        let cohesion = best.user_attrs["cohesion"].as_f64().unwrap();
        assert!((100.0..=10_000.0).contains(&cohesion));
        assert_eq!(best.intermediate_values.len(), 2);
    }

    #[tokio::test]
    async fn restart_resumes_numbering() {
        let fixture = Fixture::new(1);
        fixture.driver(identical_output(), Arc::default()).run_study(2).await.unwrap();
        let summary = fixture.driver(identical_output(), Arc::default()).run_study(2).await.unwrap();

        assert_eq!(summary.trials_total, 4);
        let storage = fixture.storage();
        let study = storage.study_id("trial_0_4_0.06_0801-215131").unwrap();
        let numbers: Vec<u64> = storage.trials(study).unwrap().iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_sub_trial_prunes_whole_trial() {
        let fixture = Fixture::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let summary = fixture.driver(Behaviour::Exit(1), calls.clone()).run_study(2).await.unwrap();

        assert_eq!(summary.trials_pruned, 2);
        assert_eq!(summary.trials_completed, 0);
        // The second sub-trial never runs.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pruner_warmup_ignores_absolute_clock() {
        let mut fixture = Fixture::new(1);
        fixture.config.trials[0].incons.t_init = 7.0e8;
        fixture.config.optimizer.pruner_warmup = 15;
        assert_eq!(pruner_warmup_steps(&fixture.config), 15);
    }

    #[tokio::test]
    async fn worse_trial_is_pruned_once_warmup_passes() {
        let mut fixture = Fixture::new(1);
        fixture.config.trials[0].incons.t_init = 7.0e8;
        fixture.config.optimizer.pruner_warmup = 0;

        // Residuals grow with every call: five completed trials, then the
        // sixth is worse than their median at step 0.
        let summary = fixture.driver(Behaviour::Drift, Arc::default()).run_study(6).await.unwrap();
        assert_eq!(summary.trials_completed, 5);
        assert_eq!(summary.trials_pruned, 1);
    }

    #[tokio::test]
    async fn failed_sub_trial_is_named_in_diagnostics() {
        let fixture = Fixture::new(2);
        let (log, _guard) = CapturedLog::install();
        fixture.driver(Behaviour::Exit(3), Arc::default()).run_study(1).await.unwrap();
        assert!(log
            .contents()
            .contains("[Trial 0] Sub-trial 0 subprocess failed (exit code Some(3)), pruning"));
    }

    #[tokio::test]
    async fn storage_failure_marks_trial_failed_before_aborting() {
        let fixture = Fixture::new(1);
        let storage: Arc<dyn StudyStorage> = Arc::new(BrokenAttrs(fixture.storage()));
        let err = fixture
            .driver_on(storage, identical_output(), Arc::default())
            .run_study(3)
            .await
            .unwrap_err();
        assert!(matches!(err, CalError::Storage(StorageError::Sqlite { .. })));

        let storage = fixture.storage();
        let study = storage.study_id("trial_0_4_0.06_0801-215131").unwrap();
        let trials = storage.trials(study).unwrap();
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].state, TrialState::Fail);
    }

    #[tokio::test]
    async fn rksml_recording_is_parsed_once_into_the_cache() {
        let mut fixture = Fixture::new(1);
        let nodes: String = (0..5)
            .map(|t| {
                format!(
                    "<Node Time=\"{t}\"><Knot Name=\"ROVER_X\" Units=\"METERS\">1</Knot>\
                     <Knot Name=\"ROVER_Y\" Units=\"METERS\">2</Knot>\
                     <Knot Name=\"ROVER_Z\" Units=\"METERS\">3</Knot></Node>"
                )
            })
            .collect();
        let doc = fixture.dir.path().join("sol01578.rksml");
        std::fs::write(&doc, format!("<RPK_Set xmlns=\"RPK\"><State_History>{nodes}</State_History></RPK_Set>")).unwrap();
        fixture.config.trials[0].sim_input_dirs = doc.display().to_string();

        let summary = fixture.driver(identical_output(), Arc::default()).run_study(1).await.unwrap();
        assert_eq!(summary.best_value(), Some(0.0));

        let cache = SeriesStore::new(fixture.config.results.trial_output_dir.join(TELEMETRY_CACHE_DIR)).unwrap();
        assert_eq!(cache.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn short_first_output_prunes() {
        let fixture = Fixture::new(1);
        let short = Behaviour::Write(format!("{SIM_HEADER}\n{}", rows(2)));
        let summary = fixture.driver(short, Arc::default()).run_study(2).await.unwrap();
        assert_eq!(summary.trials_pruned, 2);
    }

    #[tokio::test]
    async fn executor_fault_fails_trial_and_loop_continues() {
        let fixture = Fixture::new(1);
        let summary = fixture.driver(Behaviour::Fault, Arc::default()).run_study(3).await.unwrap();
        assert_eq!(summary.trials_failed, 3);
        assert!(summary.best_trial.is_none());
    }

    #[tokio::test]
    async fn unavailable_gpu_aborts_run() {
        let mut fixture = Fixture::new(1);
        fixture.config.misc.gpu_check = true;
        let driver = fixture
            .driver(identical_output(), Arc::default())
            .with_probe(Box::new(StaticProbe(Err("no devices".to_string()))));

        let err = driver.run_study(1).await.unwrap_err();
        assert!(matches!(err, CalError::AcceleratorUnavailable { .. }));
        assert!(fixture.storage().study_id(&driver.study_name()).is_err());
    }

    #[tokio::test]
    async fn missing_recorded_telemetry_is_fatal() {
        let mut fixture = Fixture::new(1);
        fixture.config.trials[0].sim_input_dirs = "does/not/exist.csv".to_string();
        let err = fixture.driver(identical_output(), Arc::default()).run_study(1).await.unwrap_err();
        assert!(matches!(err, CalError::Telemetry(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_simulator_process_end_to_end() {
        use crate::executor::{SimulatorCommand, TrialExecutor};
        use std::time::Duration;

        let fixture = Fixture::new(1);
        let canned = fixture.dir.path().join("canned.csv");
        std::fs::write(&canned, format!("{SIM_HEADER}\n{}", rows(5))).unwrap();

        let identity = RunIdentity::new("e2e");
        let logs: PathBuf = fixture.config.results.trial_output_dir.clone();
        let output = identity.output_file(&logs);
        let script = format!("cp '{}' '{}'", canned.display(), output.display());
        let executor = TrialExecutor::new(
            SimulatorCommand::new("sh").with_args(["-c", script.as_str(), "simulator"]),
            identity.clone(),
        )
        .with_poll_interval(Duration::from_millis(50));

        let driver = Driver::new(fixture.config.clone(), identity, fixture.storage(), Box::new(executor))
            .with_sampler(Arc::new(RandomSampler))
            .with_seed(1);
        let summary = driver.run_study(1).await.unwrap();

        assert_eq!(summary.trials_completed, 1);
        assert_eq!(summary.best_value(), Some(0.0));
        assert!(Path::new(&logs).join("successful_output_e2e_0_0.csv").exists());
        assert!(!Path::new(&logs).join("pruned_output_e2e_0_0.csv").exists());
    }
}
