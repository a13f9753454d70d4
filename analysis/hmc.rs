//! No-U-Turn Sampler
//!
//! This module draws posterior samples from any target that exposes its log
//! density and analytic gradient through [`LogDensity`], using the NUTS
//! implementation from `mini-mcmc` on the `burn` NdArray backend.
//!
//! # Design
//!
//! - `mini-mcmc` runs NUTS with an identity mass matrix, so the target is
//!   whitened with a diagonal map `q = center + scale ⊙ z` and sampled in `z`.
//!   The gradient is carried through the map by the chain rule,
//!   `∇_z = scale ⊙ ∇_q`.
//! - The analytic gradient is handed to the sampler directly through
//!   `unnorm_logp_and_grad`; the autodiff backend never traces the model.
//! - Draws come back as a `(chain, draw, dim)` tensor and are mapped back to `q`.
//!
//! # Chains
//!
//! All chains are run by the engine from one seed, so a fixed seed and fixed
//! initial positions give identical draws. The abort flag is checked before
//! the run starts and again before draws are returned; an aborted run never
//! hands back partial chains.

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::TensorData;
use mini_mcmc::distributions::GradientTarget;
use mini_mcmc::nuts::NUTS;
use ndarray::{Array1, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

pub type NutsBackend = Autodiff<NdArray<f64>>;

/// A differentiable, unnormalised log density on an unconstrained vector.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    /// Returns the log density and its gradient at `position`.
    ///
    /// Points outside the support should return `-inf`; the gradient is then
    /// ignored.
    fn logp_and_grad(&self, position: &Array1<f64>) -> (f64, Array1<f64>);
}

/// Configuration for NUTS sampling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NutsConfig {
    /// Number of draws to keep per chain, after warm-up
    pub n_samples: usize,
    /// Number of warm-up iterations to discard
    pub n_warmup: usize,
    /// Number of parallel chains
    pub n_chains: usize,
    /// Target acceptance probability for step-size adaptation
    pub target_accept: f64,
    pub seed: u64,
    /// Half-width of the uniform jitter added to each chain's initial point,
    /// in whitened units
    pub init_jitter: f64,
    pub show_progress: bool,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            n_samples: 3000,
            n_warmup: 1000,
            n_chains: 2,
            target_accept: 0.8,
            seed: 20_240_611,
            init_jitter: 0.5,
            show_progress: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Expected one initial position per chain ({expected}), got {found}.")]
    WrongNumberOfInitialPositions { expected: usize, found: usize },
    #[error("Initial position of chain {chain} has length {found}, but the target has dimension {expected}.")]
    DimensionMismatch {
        chain: usize,
        expected: usize,
        found: usize,
    },
    #[error("The whitening map has dimension {found}, but the target has dimension {expected}.")]
    WhiteningMismatch { expected: usize, found: usize },
    #[error("The log density is not finite at the initial position of chain {chain}.")]
    NonFiniteInitialDensity { chain: usize },
    #[error("NUTS sampling failed: {0}")]
    Engine(String),
    #[error("Sampling was aborted before all chains finished.")]
    Aborted,
}

/// Diagonal affine map between the model scale `q` and the sampler scale `z`.
#[derive(Clone, Debug, PartialEq)]
pub struct Whitening {
    pub center: Array1<f64>,
    /// Strictly positive per-coordinate scale.
    pub scale: Array1<f64>,
}

impl Whitening {
    pub fn identity(dim: usize) -> Self {
        Self {
            center: Array1::zeros(dim),
            scale: Array1::ones(dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.center.len()
    }

    pub fn to_unit(&self, q: &Array1<f64>) -> Array1<f64> {
        (q - &self.center) / &self.scale
    }

    pub fn from_unit(&self, z: &Array1<f64>) -> Array1<f64> {
        &self.center + &(z * &self.scale)
    }
}

/// The target as the sampler sees it: a density over whitened coordinates.
struct WhitenedTarget<T> {
    inner: Arc<T>,
    whitening: Arc<Whitening>,
}

impl<T> Clone for WhitenedTarget<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            whitening: Arc::clone(&self.whitening),
        }
    }
}

impl<T: LogDensity> WhitenedTarget<T> {
    fn logp_and_grad_unit(&self, z: &Array1<f64>) -> (f64, Array1<f64>) {
        let q = self.whitening.from_unit(z);
        let (logp, grad_q) = self.inner.logp_and_grad(&q);
        (logp, grad_q * &self.whitening.scale)
    }

    fn position_from_tensor(&self, z: Tensor<NutsBackend, 1>) -> Array1<f64> {
        // A tensor that cannot be read back lands outside the support.
        let values = z
            .into_data()
            .to_vec::<f64>()
            .unwrap_or_else(|_| vec![f64::NAN; self.whitening.dim()]);
        Array1::from_vec(values)
    }
}

impl<T: LogDensity + Send> GradientTarget<f64, NutsBackend> for WhitenedTarget<T> {
    fn unnorm_logp(&self, z: Tensor<NutsBackend, 1>) -> Tensor<NutsBackend, 1> {
        let device = z.device();
        let (logp, _) = self.logp_and_grad_unit(&self.position_from_tensor(z));
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device)
    }

    fn unnorm_logp_and_grad(
        &self,
        z: Tensor<NutsBackend, 1>,
    ) -> (Tensor<NutsBackend, 1>, Tensor<NutsBackend, 1>) {
        let device = z.device();
        let dim = self.whitening.dim();
        let (logp, grad_z) = self.logp_and_grad_unit(&self.position_from_tensor(z));
        let logp_tensor = Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device);
        let grad_tensor = Tensor::<NutsBackend, 1>::from_data(TensorData::new(grad_z.to_vec(), [dim]), &device);
        (logp_tensor, grad_tensor)
    }
}

/// Result of NUTS sampling.
#[derive(Clone, Debug)]
pub struct NutsResult {
    /// Draws on the model's unconstrained scale: shape (n_chains, n_samples, dim)
    pub samples: Array3<f64>,
    /// Mean R-hat over coordinates as reported by the engine, when it ran with
    /// progress reporting.
    pub engine_rhat: Option<f64>,
    /// Mean effective sample size over coordinates as reported by the engine.
    pub engine_ess: Option<f64>,
}

impl NutsResult {
    pub fn n_chains(&self) -> usize {
        self.samples.len_of(Axis(0))
    }

    pub fn n_draws(&self) -> usize {
        self.samples.len_of(Axis(1))
    }
}

fn check_abort(abort: Option<&AtomicBool>) -> Result<(), SamplingError> {
    match abort {
        Some(flag) if flag.load(Ordering::Relaxed) => Err(SamplingError::Aborted),
        _ => Ok(()),
    }
}

/// Runs `config.n_chains` NUTS chains on `target`, whitened by `whitening`.
///
/// `initial_positions` holds one starting point per chain on the model scale.
/// If `abort` is set, the run returns [`SamplingError::Aborted`] instead of
/// draws.
pub fn run_nuts_sampling<T>(
    target: &T,
    whitening: &Whitening,
    initial_positions: &[Array1<f64>],
    config: &NutsConfig,
    abort: Option<&AtomicBool>,
) -> Result<NutsResult, SamplingError>
where
    T: LogDensity + Clone + Send + 'static,
{
    let dim = target.dim();
    if whitening.dim() != dim || whitening.scale.len() != dim {
        return Err(SamplingError::WhiteningMismatch {
            expected: dim,
            found: whitening.dim().min(whitening.scale.len()),
        });
    }
    if initial_positions.len() != config.n_chains {
        return Err(SamplingError::WrongNumberOfInitialPositions {
            expected: config.n_chains,
            found: initial_positions.len(),
        });
    }
    for (chain, init) in initial_positions.iter().enumerate() {
        if init.len() != dim {
            return Err(SamplingError::DimensionMismatch {
                chain,
                expected: dim,
                found: init.len(),
            });
        }
        if !target.logp_and_grad(init).0.is_finite() {
            return Err(SamplingError::NonFiniteInitialDensity { chain });
        }
    }
    check_abort(abort)?;

    log::info!(
        "Running NUTS: {} chains x ({} warm-up + {} draws), {} parameters.",
        config.n_chains,
        config.n_warmup,
        config.n_samples,
        dim
    );

    let whitened = WhitenedTarget {
        inner: Arc::new(target.clone()),
        whitening: Arc::new(whitening.clone()),
    };
    let unit_positions: Vec<Vec<f64>> = initial_positions
        .iter()
        .map(|q| whitening.to_unit(q).to_vec())
        .collect();

    let mut sampler = NUTS::<f64, NutsBackend, WhitenedTarget<T>>::new(
        whitened,
        unit_positions,
        config.target_accept,
    )
    .set_seed(config.seed);

    let (samples_tensor, engine_rhat, engine_ess) = if config.show_progress {
        let (samples_tensor, run_stats) = sampler
            .run_progress(config.n_samples, config.n_warmup)
            .map_err(|e| SamplingError::Engine(e.to_string()))?;
        log::info!("NUTS sampling complete: {}", run_stats);
        (
            samples_tensor,
            Some(f64::from(run_stats.rhat.mean)),
            Some(f64::from(run_stats.ess.mean)),
        )
    } else {
        let samples_tensor = sampler.run(config.n_samples, config.n_warmup);
        log::info!("NUTS sampling complete.");
        (samples_tensor, None, None)
    };
    check_abort(abort)?;

    let [n_chains, n_draws, n_dim] = samples_tensor.dims();
    let data: Vec<f64> = samples_tensor
        .into_data()
        .to_vec()
        .map_err(|e| SamplingError::Engine(format!("{e:?}")))?;
    let unit = Array3::from_shape_vec((n_chains, n_draws, n_dim), data)
        .map_err(|e| SamplingError::Engine(e.to_string()))?;
    if n_dim != dim {
        return Err(SamplingError::WhiteningMismatch {
            expected: dim,
            found: n_dim,
        });
    }
    let samples = &unit * &whitening.scale + &whitening.center;

    Ok(NutsResult {
        samples,
        engine_rhat,
        engine_ess,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Independent normal target with known moments.
    #[derive(Clone)]
    struct DiagonalGaussian {
        mean: Array1<f64>,
        sd: Array1<f64>,
    }

    impl LogDensity for DiagonalGaussian {
        fn dim(&self) -> usize {
            self.mean.len()
        }

        fn logp_and_grad(&self, position: &Array1<f64>) -> (f64, Array1<f64>) {
            let z = (position - &self.mean) / &self.sd;
            let logp = -0.5 * z.dot(&z);
            let grad = -(&z / &self.sd);
            (logp, grad)
        }
    }

    fn quick_config(seed: u64) -> NutsConfig {
        NutsConfig {
            n_samples: 1000,
            n_warmup: 500,
            n_chains: 2,
            seed,
            show_progress: false,
            ..NutsConfig::default()
        }
    }

    fn gaussian() -> DiagonalGaussian {
        DiagonalGaussian {
            mean: array![1.0, -2.0, 0.5],
            sd: array![0.5, 3.0, 1.0],
        }
    }

    #[test]
    fn recovers_gaussian_moments() {
        let target = gaussian();
        let whitening = Whitening {
            center: Array1::zeros(3),
            scale: array![0.5, 2.0, 1.0],
        };
        let inits = vec![Array1::zeros(3); 2];
        let result = run_nuts_sampling(&target, &whitening, &inits, &quick_config(11), None).unwrap();
        assert_eq!(result.samples.dim(), (2, 1000, 3));
        assert_eq!(result.n_chains(), 2);
        assert_eq!(result.n_draws(), 1000);

        let pooled = result.samples.to_shape((2000, 3)).unwrap().to_owned();
        let mean = pooled.mean_axis(Axis(0)).unwrap();
        let sd = pooled.std_axis(Axis(0), 1.0);
        for j in 0..3 {
            assert_abs_diff_eq!(mean[j], target.mean[j], epsilon = 0.2 * target.sd[j]);
            assert_abs_diff_eq!(sd[j], target.sd[j], epsilon = 0.2 * target.sd[j]);
        }
    }

    #[test]
    fn whitened_gradient_follows_chain_rule() {
        let target = gaussian();
        let whitening = Whitening {
            center: array![1.0, -1.0, 0.0],
            scale: array![2.0, 0.5, 1.5],
        };
        let wrapped = WhitenedTarget {
            inner: Arc::new(target.clone()),
            whitening: Arc::new(whitening.clone()),
        };
        let z = array![0.3, -0.7, 1.1];
        let q = whitening.from_unit(&z);
        let (logp_q, grad_q) = target.logp_and_grad(&q);

        let device = Default::default();
        let tensor = Tensor::<NutsBackend, 1>::from_data(TensorData::new(z.to_vec(), [3]), &device);
        let (logp, grad) = wrapped.unnorm_logp_and_grad(tensor.clone());
        let logp: Vec<f64> = logp.into_data().to_vec().unwrap();
        let grad: Vec<f64> = grad.into_data().to_vec().unwrap();
        assert_abs_diff_eq!(logp[0], logp_q, epsilon = 1e-12);
        for j in 0..3 {
            assert_abs_diff_eq!(grad[j], grad_q[j] * whitening.scale[j], epsilon = 1e-12);
        }

        let logp_only: Vec<f64> = wrapped.unnorm_logp(tensor).into_data().to_vec().unwrap();
        assert_abs_diff_eq!(logp_only[0], logp_q, epsilon = 1e-12);
    }

    #[test]
    fn whitening_maps_back_and_forth() {
        let whitening = Whitening {
            center: array![3.0, -2.0],
            scale: array![0.1, 4.0],
        };
        let q = array![2.5, 6.0];
        let z = whitening.to_unit(&q);
        assert_abs_diff_eq!(z[0], -5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z[1], 2.0, epsilon = 1e-12);
        assert_eq!(whitening.from_unit(&z), q);
        assert_eq!(Whitening::identity(2).to_unit(&q), q);
    }

    #[test]
    fn identical_seeds_give_identical_draws() {
        let target = gaussian();
        let whitening = Whitening::identity(3);
        let config = NutsConfig {
            n_samples: 50,
            n_warmup: 50,
            ..quick_config(99)
        };
        let inits = vec![Array1::zeros(3), Array1::ones(3)];
        let a = run_nuts_sampling(&target, &whitening, &inits, &config, None).unwrap();
        let b = run_nuts_sampling(&target, &whitening, &inits, &config, None).unwrap();
        assert_eq!(a.samples, b.samples);

        let c = run_nuts_sampling(&target, &whitening, &inits, &NutsConfig { seed: 100, ..config }, None)
            .unwrap();
        assert_ne!(a.samples, c.samples);
    }

    #[test]
    fn abort_flag_stops_sampling() {
        let target = gaussian();
        let inits = vec![Array1::zeros(3); 2];
        let abort = AtomicBool::new(true);
        match run_nuts_sampling(&target, &Whitening::identity(3), &inits, &quick_config(1), Some(&abort)) {
            Err(SamplingError::Aborted) => {}
            other => panic!("Expected Aborted, got {:?}", other.map(|r| r.n_draws())),
        }
    }

    #[test]
    fn rejects_mismatched_initial_positions() {
        let target = gaussian();
        let config = quick_config(1);
        let whitening = Whitening::identity(3);
        let inits = vec![Array1::zeros(2); 2];
        assert!(matches!(
            run_nuts_sampling(&target, &whitening, &inits, &config, None),
            Err(SamplingError::DimensionMismatch { chain: 0, expected: 3, found: 2 })
        ));
        let inits = vec![Array1::zeros(3); 1];
        assert!(matches!(
            run_nuts_sampling(&target, &whitening, &inits, &config, None),
            Err(SamplingError::WrongNumberOfInitialPositions { .. })
        ));
        let inits = vec![Array1::zeros(3); 2];
        assert!(matches!(
            run_nuts_sampling(&target, &Whitening::identity(4), &inits, &config, None),
            Err(SamplingError::WhiteningMismatch { expected: 3, found: 4 })
        ));
    }

    #[test]
    fn non_finite_start_is_rejected() {
        let target = gaussian();
        let inits = vec![Array1::zeros(3), array![f64::NAN, 0.0, 0.0]];
        assert!(matches!(
            run_nuts_sampling(&target, &Whitening::identity(3), &inits, &quick_config(1), None),
            Err(SamplingError::NonFiniteInitialDensity { chain: 1 })
        ));
    }
}
