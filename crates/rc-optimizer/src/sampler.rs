//! Parameter proposal strategies.

use rand::rngs::StdRng;
use rand::Rng;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::sync::Arc;

use crate::search::{Params, SearchSpace};
use crate::trial::{FrozenTrial, StudyDirection, TrialState};

/// Common trait for all samplers.
pub trait Sampler: Send + Sync {
    /// Propose the parameters of the next trial given the study history.
    fn propose(&self, space: &SearchSpace, history: &[FrozenTrial], rng: &mut StdRng) -> Params;

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

impl<S: Sampler + ?Sized> Sampler for Arc<S> {
    fn propose(&self, space: &SearchSpace, history: &[FrozenTrial], rng: &mut StdRng) -> Params {
        (**self).propose(space, history, rng)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// ---- Random sampling ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn propose(&self, space: &SearchSpace, _history: &[FrozenTrial], rng: &mut StdRng) -> Params {
        space.sample(rng)
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Tree-structured Parzen estimator ----

/// Tree-structured Parzen estimator.
///
/// Completed trials are split into the best `gamma(n)` and the rest; a
/// Parzen density is fitted to each and the candidate maximising
/// `l(x) / g(x)` among `n_ei_candidates` draws from `l` is proposed. Until
/// `n_startup_trials` trials have completed, proposals are uniform.
#[derive(Debug, Clone)]
pub struct TpeSampler {
    pub n_startup_trials: usize,
    pub n_ei_candidates: usize,
    /// Model all dimensions jointly instead of one at a time.
    pub multivariate: bool,
    pub prior_weight: f64,
    pub direction: StudyDirection,
}

impl Default for TpeSampler {
    fn default() -> Self {
        Self {
            n_startup_trials: 15,
            n_ei_candidates: 24,
            multivariate: true,
            prior_weight: 1.0,
            direction: StudyDirection::Minimize,
        }
    }
}

/// Number of observations treated as "good".
pub fn gamma(n: usize) -> usize {
    ((n as f64 * 0.1).ceil() as usize).min(25)
}

impl TpeSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn with_ei_candidates(mut self, n: usize) -> Self {
        self.n_ei_candidates = n.max(1);
        self
    }

    pub fn with_multivariate(mut self, multivariate: bool) -> Self {
        self.multivariate = multivariate;
        self
    }

    pub fn with_direction(mut self, direction: StudyDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Completed observations in internal coordinates, best first.
    fn observations(&self, space: &SearchSpace, history: &[FrozenTrial]) -> Vec<Vec<f64>> {
        let mut observed: Vec<(Vec<f64>, f64)> = history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .filter(|t| space.covers(&t.params))
            .filter_map(|t| {
                let value = t.value.filter(|v| v.is_finite())?;
                let point = space
                    .parameters
                    .iter()
                    .map(|p| p.kind.to_internal(t.params[&p.name]))
                    .collect();
                Some((point, value))
            })
            .collect();

        observed.sort_by(|a, b| match self.direction {
            StudyDirection::Minimize => a.1.total_cmp(&b.1),
            StudyDirection::Maximize => b.1.total_cmp(&a.1),
        });
        observed.into_iter().map(|(point, _)| point).collect()
    }
}

impl Sampler for TpeSampler {
    fn propose(&self, space: &SearchSpace, history: &[FrozenTrial], rng: &mut StdRng) -> Params {
        let observed = self.observations(space, history);
        if observed.len() < self.n_startup_trials.max(1) {
            return space.sample(rng);
        }

        let n_below = gamma(observed.len()).max(1);
        let (below, above) = observed.split_at(n_below);
        let bounds: Vec<(f64, f64)> = space.parameters.iter().map(|p| p.kind.internal_bounds()).collect();

        let point = if self.multivariate {
            let l = Parzen::fit(below, &bounds, self.prior_weight);
            let g = Parzen::fit(above, &bounds, self.prior_weight);
            best_candidate(&l, &g, self.n_ei_candidates, rng)
        } else {
            (0..bounds.len())
                .map(|d| {
                    let project = |pts: &[Vec<f64>]| -> Vec<Vec<f64>> { pts.iter().map(|p| vec![p[d]]).collect() };
                    let l = Parzen::fit(&project(below), &bounds[d..=d], self.prior_weight);
                    let g = Parzen::fit(&project(above), &bounds[d..=d], self.prior_weight);
                    best_candidate(&l, &g, self.n_ei_candidates, rng)[0]
                })
                .collect()
        };

        space
            .parameters
            .iter()
            .zip(point)
            .map(|(p, x)| (p.name.clone(), p.kind.from_internal(x)))
            .collect()
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

fn best_candidate(l: &Parzen, g: &Parzen, n_candidates: usize, rng: &mut StdRng) -> Vec<f64> {
    let mut best: Option<(Vec<f64>, f64)> = None;
    for _ in 0..n_candidates.max(1) {
        let x = l.sample(rng);
        let score = l.log_pdf(&x) - g.log_pdf(&x);
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((x, score));
        }
    }
    best.map(|(x, _)| x).unwrap_or_else(|| l.sample(rng))
}

/// Mixture of per-observation truncated Gaussians plus a wide prior
/// component, over a box in internal coordinates.
#[derive(Debug)]
struct Parzen {
    means: Vec<Vec<f64>>,
    log_weights: Vec<f64>,
    sigmas: Vec<f64>,
    bounds: Vec<(f64, f64)>,
}

impl Parzen {
    fn fit(points: &[Vec<f64>], bounds: &[(f64, f64)], prior_weight: f64) -> Self {
        let dims = bounds.len();
        let n = points.len() + 1;

        let mut means: Vec<Vec<f64>> = points.to_vec();
        means.push(bounds.iter().map(|(lo, hi)| 0.5 * (lo + hi)).collect());

        let mut weights = vec![1.0; points.len()];
        weights.push(prior_weight);
        let total: f64 = weights.iter().sum();
        let log_weights = weights.iter().map(|w| (w / total).ln()).collect();

        // Scott-style bandwidth, kept above a fraction of the range.
        let scale = 0.2 * (n as f64).powf(-1.0 / (dims as f64 + 4.0));
        let sigmas = bounds
            .iter()
            .map(|(lo, hi)| {
                let width = hi - lo;
                (scale * width).max(width / (1.0 + n as f64).min(100.0))
            })
            .collect();

        Self {
            means,
            log_weights,
            sigmas,
            bounds: bounds.to_vec(),
        }
    }

    fn sample(&self, rng: &mut StdRng) -> Vec<f64> {
        let u: f64 = rng.random();
        let mut acc = 0.0;
        let mut component = self.means.len() - 1;
        for (k, lw) in self.log_weights.iter().enumerate() {
            acc += lw.exp();
            if u < acc {
                component = k;
                break;
            }
        }
        // The prior component spans the whole range.
        let prior = component == self.means.len() - 1;

        self.means[component]
            .iter()
            .zip(&self.sigmas)
            .zip(&self.bounds)
            .map(|((&mu, &sigma), &(lo, hi))| {
                let sigma = if prior { hi - lo } else { sigma };
                truncated_normal_sample(mu, sigma, lo, hi, rng)
            })
            .collect()
    }

    fn log_pdf(&self, x: &[f64]) -> f64 {
        let last = self.means.len() - 1;
        let terms: Vec<f64> = self
            .means
            .iter()
            .zip(&self.log_weights)
            .enumerate()
            .map(|(k, (mean, lw))| {
                lw + mean
                    .iter()
                    .zip(x)
                    .zip(&self.sigmas)
                    .zip(&self.bounds)
                    .map(|(((&mu, &xi), &sigma), &(lo, hi))| {
                        let sigma = if k == last { hi - lo } else { sigma };
                        truncated_normal_log_pdf(xi, mu, sigma, lo, hi)
                    })
                    .sum::<f64>()
            })
            .collect();
        log_sum_exp(&terms)
    }
}

fn log_sum_exp(terms: &[f64]) -> f64 {
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln()
}

fn normal(mu: f64, sigma: f64) -> Option<Normal> {
    Normal::new(mu, sigma).ok()
}

/// Inverse-CDF draw restricted to `[lo, hi]`.
fn truncated_normal_sample(mu: f64, sigma: f64, lo: f64, hi: f64, rng: &mut StdRng) -> f64 {
    if hi <= lo {
        return lo;
    }
    let Some(dist) = normal(mu, sigma) else {
        return lo;
    };
    let (a, b) = (dist.cdf(lo), dist.cdf(hi));
    if b - a <= f64::EPSILON {
        return rng.random_range(lo..=hi);
    }
    dist.inverse_cdf(rng.random_range(a..b)).clamp(lo, hi)
}

fn truncated_normal_log_pdf(x: f64, mu: f64, sigma: f64, lo: f64, hi: f64) -> f64 {
    if hi <= lo {
        return 0.0;
    }
    let Some(dist) = normal(mu, sigma) else {
        return 0.0;
    };
    let mass = dist.cdf(hi) - dist.cdf(lo);
    dist.ln_pdf(x) - mass.max(1e-300).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn unit_space() -> SearchSpace {
        SearchSpace::new().add_float("x", 0.0, 1.0)
    }

    fn quadratic_history(n: usize) -> Vec<FrozenTrial> {
        (0..n)
            .map(|i| {
                let x = i as f64 / (n - 1) as f64;
                FrozenTrial::new(i as i64, i as u64)
                    .with_param("x", x)
                    .with_state(TrialState::Complete, Some((x - 0.3).powi(2)))
            })
            .collect()
    }

    #[test]
    fn gamma_caps_at_twenty_five() {
        assert_eq!(gamma(1), 1);
        assert_eq!(gamma(15), 2);
        assert_eq!(gamma(100), 10);
        assert_eq!(gamma(1000), 25);
    }

    #[test]
    fn random_sampler_respects_bounds() {
        let space = SearchSpace::new()
            .add_log_uniform("cohesion_scaled", 0.01, 10.0)
            .add_float("friction_scaled", 0.3, 0.9);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let params = RandomSampler.propose(&space, &[], &mut rng);
            assert!(space.covers(&params));
        }
    }

    #[test]
    fn tpe_is_uniform_before_startup() {
        let sampler = TpeSampler::new();
        let history = quadratic_history(5);
        let mut rng = StdRng::seed_from_u64(11);
        let params = sampler.propose(&unit_space(), &history, &mut rng);
        assert!(unit_space().covers(&params));
    }

    #[test]
    fn tpe_concentrates_near_optimum() {
        let space = unit_space();
        let history = quadratic_history(40);
        for multivariate in [true, false] {
            let sampler = TpeSampler::new().with_multivariate(multivariate);
            let mut rng = StdRng::seed_from_u64(42);
            let proposals: Vec<f64> = (0..50)
                .map(|_| sampler.propose(&space, &history, &mut rng)["x"])
                .collect();
            let mean = proposals.iter().sum::<f64>() / proposals.len() as f64;
            assert!((mean - 0.3).abs() < 0.15, "mean proposal {mean}");
            assert!(proposals.iter().all(|x| (0.0..=1.0).contains(x)));
        }
    }

    #[test]
    fn tpe_ignores_unfinished_and_out_of_space_trials() {
        let space = unit_space();
        let mut history = quadratic_history(20);
        history.push(FrozenTrial::new(99, 20).with_param("x", 0.9).with_state(TrialState::Pruned, None));
        history.push(FrozenTrial::new(100, 21).with_param("y", 0.1).with_state(TrialState::Complete, Some(0.0)));
        let sampler = TpeSampler::new();
        assert_eq!(sampler.observations(&space, &history).len(), 20);
    }

    #[test]
    fn truncated_normal_matches_known_values() {
        // Untruncated in effect: standard normal density at 0 and 1.96.
        let wide = (-50.0, 50.0);
        let at_zero = truncated_normal_log_pdf(0.0, 0.0, 1.0, wide.0, wide.1);
        assert!((at_zero + 0.5 * (2.0 * std::f64::consts::PI).ln()).abs() < 1e-9);
        let at_tail = truncated_normal_log_pdf(1.96, 0.0, 1.0, wide.0, wide.1).exp();
        assert!((at_tail - 0.058_440_944).abs() < 1e-6);

        // Half the mass is cut away, so the density doubles.
        let half = truncated_normal_log_pdf(0.0, 0.0, 1.0, 0.0, 50.0);
        assert!((half - at_zero - 2f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn truncated_normal_draws_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(5);
        let draws: Vec<f64> = (0..500)
            .map(|_| truncated_normal_sample(0.9, 0.5, 0.0, 1.0, &mut rng))
            .collect();
        assert!(draws.iter().all(|x| (0.0..=1.0).contains(x)));
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        assert!(mean > 0.5, "mean draw {mean}");

        // Mean far outside the box: no mass left, fall back to uniform.
        let x = truncated_normal_sample(1e6, 1e-3, 0.0, 1.0, &mut rng);
        assert!((0.0..=1.0).contains(&x));
        assert_eq!(truncated_normal_sample(0.5, 0.0, 0.0, 1.0, &mut rng), 0.0);
    }
}
