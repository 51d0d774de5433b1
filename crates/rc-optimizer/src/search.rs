//! Search space definitions.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sampled parameter values keyed by parameter name.
pub type Params = BTreeMap<String, f64>;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name as recorded in the study (e.g. "cohesion_scaled").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
}

impl ParameterKind {
    /// Bounds in the space samplers work in (log-space for `LogUniform`).
    pub fn internal_bounds(&self) -> (f64, f64) {
        match *self {
            Self::FloatRange { low, high } => (low, high),
            Self::LogUniform { low, high } => (low.ln(), high.ln()),
        }
    }

    pub fn to_internal(&self, value: f64) -> f64 {
        match self {
            Self::FloatRange { .. } => value,
            Self::LogUniform { .. } => value.ln(),
        }
    }

    /// Map back from internal space, clamped into the declared range.
    pub fn from_internal(&self, internal: f64) -> f64 {
        match *self {
            Self::FloatRange { low, high } => internal.clamp(low, high),
            Self::LogUniform { low, high } => internal.exp().clamp(low, high),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        match *self {
            Self::FloatRange { low, high } | Self::LogUniform { low, high } => value >= low && value <= high,
        }
    }

    /// Uniform draw in internal space.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let (low, high) = self.internal_bounds();
        let internal = if low < high { rng.random_range(low..=high) } else { low };
        self.from_internal(internal)
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Whether `params` assigns an in-range value to every dimension.
    pub fn covers(&self, params: &Params) -> bool {
        self.parameters
            .iter()
            .all(|p| params.get(&p.name).is_some_and(|v| p.kind.contains(*v)))
    }

    /// Independent uniform draw of every dimension.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Params {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.kind.sample(rng)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn soil_space() -> SearchSpace {
        SearchSpace::new()
            .add_log_uniform("cohesion_scaled", 0.1, 10.0)
            .add_float("bulk_density_scaled", 1.2, 1.8)
            .add_float("friction_scaled", 0.3, 0.9)
            .add_log_uniform("youngs_modulus_scaled", 0.1, 100.0)
            .add_float("poisson_ratio_scaled", 0.2, 0.4)
    }

    #[test]
    fn random_draws_respect_bounds() {
        let space = soil_space();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let params = space.sample(&mut rng);
            assert_eq!(params.len(), 5);
            assert!(space.covers(&params), "out of range: {params:?}");
        }
    }

    #[test]
    fn log_uniform_internal_space() {
        let kind = ParameterKind::LogUniform { low: 1e-3, high: 1e3 };
        assert_eq!(kind.internal_bounds(), (1e-3_f64.ln(), 1e3_f64.ln()));
        let v = kind.from_internal(kind.to_internal(2.5));
        assert!((v - 2.5).abs() < 1e-12);
        assert_eq!(kind.from_internal(100.0), 1e3);
    }

    #[test]
    fn degenerate_range_is_constant() {
        let space = SearchSpace::new().add_float("x", 0.5, 0.5);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(space.sample(&mut rng)["x"], 0.5);
    }

    #[test]
    fn search_space_builder_chain() {
        let space = soil_space();
        assert_eq!(space.len(), 5);
        assert!(matches!(
            space.get("cohesion_scaled").map(|p| p.kind),
            Some(ParameterKind::LogUniform { .. })
        ));
        assert!(space.get("missing").is_none());
    }
}
