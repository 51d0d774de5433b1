//! Trial configuration document.
//!
//! The document is the single structured-text argument handed to the
//! simulator. It is read once at driver start and then derived into a fresh
//! value per trial ([`TrialConfiguration::with_soil_point`]) and per
//! sub-trial ([`TrialConfiguration::for_sub_trial`]); nothing mutates a
//! shared instance.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use crate::invalid_config;

/// Factor applied to the sampled cohesion before it is written into the document.
pub const COHESION_SCALE: f64 = 1e3;
/// Factor applied to the sampled bulk density.
pub const BULK_DENSITY_SCALE: f64 = 1e3;
/// Factor applied to the sampled Young's modulus.
pub const YOUNGS_MODULUS_SCALE: f64 = 1e6;

/// Top-level trial configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfiguration {
    /// One entry per sub-trial, executed in order.
    pub trials: Vec<SubTrialSpec>,

    /// Initial conditions of the sub-trial currently being run.
    #[serde(default = "empty_object")]
    pub incon: Value,

    pub soil: SoilConfig,
    pub integrator: IntegratorConfig,
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub downlink: DownlinkConfig,

    pub results: ResultsConfig,

    #[serde(default)]
    pub misc: MiscConfig,

    /// Runtime-only: ask the simulator to open its render window.
    #[serde(default)]
    pub render: bool,

    /// Runtime-only: forward simulator stdout.
    #[serde(default)]
    pub verbose: bool,

    /// Fields the calibration engine does not interpret but the simulator may.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Input descriptors for one telemetry / initial-condition pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTrialSpec {
    /// Recorded telemetry the run is scored against.
    pub sim_input_dirs: String,
    /// Control input consumed by the simulator.
    pub control_input_dirs: String,
    pub incons: InitialConditions,
}

/// Initial conditions of a sub-trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialConditions {
    pub t_init: f64,
    pub t_fin: f64,
    #[serde(default)]
    pub z_off: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Soil search ranges and, once sampled, the point values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilConfig {
    /// Soil grid spacing; part of the study name.
    pub spacing: f64,
    #[serde(default = "default_terrain_size")]
    pub size: u32,

    pub bulk_density_range: [f64; 2],
    pub cohesion_range: [f64; 2],
    pub friction_range: [f64; 2],
    pub youngs_modulus_range: [f64; 2],
    pub poisson_ratio_range: [f64; 2],

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohesion: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_density: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youngs_modulus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poisson_ratio: Option<f64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_terrain_size() -> u32 {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratorConfig {
    pub step_size_mbd: f64,
    pub step_size_cfd: f64,
    #[serde(default = "default_integrator")]
    pub integrator: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_integrator() -> String {
    "DEFAULT".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub n_trials: usize,
    #[serde(default = "default_method")]
    pub method: String,
    /// Steps before the median pruner may act.
    #[serde(default = "default_pruner_warmup")]
    pub pruner_warmup: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_method() -> String {
    "combined".to_string()
}

fn default_pruner_warmup() -> u32 {
    15
}

/// Heightmaps plus the resolved inputs of the current sub-trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownlinkConfig {
    #[serde(default)]
    pub ht: Vec<String>,
    #[serde(default, rename = "mod")]
    pub mod_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_input_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_input_dir: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// Directory receiving the live output file and preserved artifacts.
    pub trial_output_dir: PathBuf,
    /// Output path of the sub-trial currently being run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_output_file: Option<PathBuf>,
    pub storage: StorageDescriptor,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where the study lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    pub dir: String,
}

impl StorageDescriptor {
    /// Filesystem location of the store, with any `sqlite:///` prefix removed.
    pub fn location(&self) -> PathBuf {
        let raw = self.dir.strip_prefix("sqlite:///").unwrap_or(&self.dir);
        PathBuf::from(raw)
    }
}

/// Study store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StorageKind {
    /// Single-file relational store.
    Sqlite,
    /// Append-only journal file.
    Journal,
}

impl TryFrom<String> for StorageKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "SQLITE" => Ok(Self::Sqlite),
            "JS" => Ok(Self::Journal),
            _ => Err(ConfigError::UnknownStorage { kind: value }),
        }
    }
}

impl From<StorageKind> for String {
    fn from(kind: StorageKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "SQLITE"),
            Self::Journal => write!(f, "JS"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiscConfig {
    /// Verify accelerator availability before starting.
    #[serde(default)]
    pub gpu_check: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Soil parameters in simulator units, ready to be written into the document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoilPoint {
    pub cohesion: f64,
    pub bulk_density: f64,
    pub friction: f64,
    pub youngs_modulus: f64,
    pub poisson_ratio: f64,
}

impl SoilPoint {
    /// Apply the fixed unit-scaling factors to values sampled in search units.
    pub fn from_search_units(
        cohesion: f64,
        bulk_density: f64,
        friction: f64,
        youngs_modulus: f64,
        poisson_ratio: f64,
    ) -> Self {
        Self {
            cohesion: cohesion * COHESION_SCALE,
            bulk_density: bulk_density * BULK_DENSITY_SCALE,
            friction,
            youngs_modulus: youngs_modulus * YOUNGS_MODULUS_SCALE,
            poisson_ratio,
        }
    }

    pub fn as_pairs(&self) -> [(&'static str, f64); 5] {
        [
            ("cohesion", self.cohesion),
            ("bulk_density", self.bulk_density),
            ("friction", self.friction),
            ("youngs_modulus", self.youngs_modulus),
            ("poisson_ratio", self.poisson_ratio),
        ]
    }
}

impl fmt::Display for SoilPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bd={} c={} f={} ym={} pr={}",
            self.bulk_density, self.cohesion, self.friction, self.youngs_modulus, self.poisson_ratio
        )
    }
}

/// Inputs for [`TrialConfiguration::template`].
#[derive(Debug, Clone)]
pub struct TemplateParams {
    pub telemetry_csv: String,
    pub output_dir: PathBuf,
    pub heightmaps: Vec<String>,
    pub bulk_density_range: [f64; 2],
    pub cohesion_range: [f64; 2],
    pub friction_range: [f64; 2],
    pub youngs_modulus_range: [f64; 2],
    pub poisson_ratio_range: [f64; 2],
    pub initial_sclk: f64,
    pub runtime: f64,
    pub height: f64,
    pub spacing: f64,
    pub step_size_cfd: f64,
    pub n_trials: usize,
}

impl TrialConfiguration {
    /// Read and validate a configuration document.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            field: path.display().to_string(),
            message: format!("unable to read configuration: {e}"),
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        for section in ["trials", "soil", "integrator", "optimizer", "results"] {
            if value.get(section).is_none() {
                return Err(ConfigError::MissingField {
                    field: section.to_string(),
                });
            }
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the driver relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trials.is_empty() {
            return Err(invalid_config!("trials", "at least one sub-trial is required"));
        }

        let ranges = [
            ("soil.bulk_density_range", self.soil.bulk_density_range, false),
            ("soil.cohesion_range", self.soil.cohesion_range, true),
            ("soil.friction_range", self.soil.friction_range, false),
            ("soil.youngs_modulus_range", self.soil.youngs_modulus_range, true),
            ("soil.poisson_ratio_range", self.soil.poisson_ratio_range, false),
        ];
        for (field, [low, high], log_scale) in ranges {
            if !low.is_finite() || !high.is_finite() {
                return Err(invalid_config!(field, "bounds must be finite"));
            }
            if low > high {
                return Err(invalid_config!(field, "low {} exceeds high {}", low, high));
            }
            if log_scale && low <= 0.0 {
                return Err(invalid_config!(field, "log-sampled bounds must be positive, got {}", low));
            }
        }

        if self.results.storage.dir.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "results.storage.dir".to_string(),
            });
        }

        Ok(())
    }

    /// A copy of this document carrying the sampled soil point.
    pub fn with_soil_point(&self, point: &SoilPoint) -> Self {
        let mut config = self.clone();
        config.soil.cohesion = Some(point.cohesion);
        config.soil.bulk_density = Some(point.bulk_density);
        config.soil.friction = Some(point.friction);
        config.soil.youngs_modulus = Some(point.youngs_modulus);
        config.soil.poisson_ratio = Some(point.poisson_ratio);
        config
    }

    /// A copy of this document pointed at one sub-trial's inputs and output file.
    pub fn for_sub_trial(&self, index: usize, output_file: &Path) -> Result<Self, ConfigError> {
        let spec = self.trials.get(index).ok_or_else(|| {
            invalid_config!("trials", "sub-trial {} out of range ({} configured)", index, self.trials.len())
        })?;

        let mut config = self.clone();
        config.downlink.sim_input_dir = Some(spec.sim_input_dirs.clone());
        config.downlink.control_input_dir = Some(spec.control_input_dirs.clone());
        config.incon = serde_json::to_value(&spec.incons)?;
        config.results.trial_output_file = Some(output_file.to_path_buf());
        Ok(config)
    }

    /// Serialize as the single command-line argument the simulator expects.
    pub fn to_argument(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Initial and final time of the first sub-trial.
    pub fn time_span(&self) -> (f64, f64) {
        self.trials
            .first()
            .map(|spec| (spec.incons.t_init, spec.incons.t_fin))
            .unwrap_or((0.0, 0.0))
    }

    /// Default document for a single recorded drive.
    pub fn template(params: TemplateParams) -> Self {
        let (mod_files, ht): (Vec<String>, Vec<String>) = params
            .heightmaps
            .into_iter()
            .filter(|h| {
                let lower = h.to_lowercase();
                lower.ends_with(".mod") || lower.ends_with(".ht")
            })
            .partition(|h| h.to_lowercase().ends_with(".mod"));

        Self {
            trials: vec![SubTrialSpec {
                sim_input_dirs: params.telemetry_csv.clone(),
                control_input_dirs: params.telemetry_csv,
                incons: InitialConditions {
                    t_init: params.initial_sclk,
                    t_fin: params.runtime,
                    z_off: params.height,
                    extra: Map::new(),
                },
            }],
            incon: empty_object(),
            soil: SoilConfig {
                spacing: params.spacing,
                size: default_terrain_size(),
                bulk_density_range: params.bulk_density_range,
                cohesion_range: params.cohesion_range,
                friction_range: params.friction_range,
                youngs_modulus_range: params.youngs_modulus_range,
                poisson_ratio_range: params.poisson_ratio_range,
                cohesion: None,
                bulk_density: None,
                friction: None,
                youngs_modulus: None,
                poisson_ratio: None,
                extra: Map::new(),
            },
            integrator: IntegratorConfig {
                step_size_mbd: 8e-4,
                step_size_cfd: params.step_size_cfd,
                integrator: default_integrator(),
                extra: Map::new(),
            },
            optimizer: OptimizerConfig {
                n_trials: params.n_trials,
                method: default_method(),
                pruner_warmup: default_pruner_warmup(),
                extra: Map::new(),
            },
            downlink: DownlinkConfig {
                ht,
                mod_files,
                ..DownlinkConfig::default()
            },
            results: ResultsConfig {
                trial_output_dir: params.output_dir,
                trial_output_file: None,
                storage: StorageDescriptor {
                    kind: StorageKind::Sqlite,
                    dir: "sqlite:///optuna_study.db".to_string(),
                },
                extra: Map::new(),
            },
            misc: MiscConfig::default(),
            render: false,
            verbose: false,
            extra: Map::new(),
        }
    }

    /// Persist the document pretty-printed.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}
