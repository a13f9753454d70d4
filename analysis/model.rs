//! # Joint Posterior
//!
//! Wires the Gamma regression and the predictor imputation sub-model into one
//! log density over a flat unconstrained vector, which is what the sampler sees.
//!
//! Layout of that vector:
//!
//! ```text
//! [ intercept | β (k) | ln α | μ_X (k) | ln σ (k) | CPC (k(k-1)/2) | latent cells (m) ]
//! ```
//!
//! Latent cells follow the row-major arena order of the [`DesignMatrix`]. A
//! latent cell enters both halves of the model: the MVN density of its row and,
//! through `η_i = intercept + x_i·β`, the Gamma density of the response.

use crate::config::ModelPriors;
use crate::data::PreparedData;
use crate::design::DesignMatrix;
use crate::hmc::{LogDensity, NutsResult, Whitening};
use crate::imputation::{CholeskyCorrelation, n_correlation_params, predictor_log_density};
use crate::likelihood::{gamma_log_link, half_cauchy_log_scale_prior, normal_prior};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use std::sync::Arc;

/// Positions of every parameter block in the unconstrained vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    n_predictors: usize,
    n_latent: usize,
}

impl ParameterLayout {
    pub fn new(n_predictors: usize, n_latent: usize) -> Self {
        Self {
            n_predictors,
            n_latent,
        }
    }

    pub fn n_predictors(&self) -> usize {
        self.n_predictors
    }

    pub fn n_latent(&self) -> usize {
        self.n_latent
    }

    pub fn intercept(&self) -> usize {
        0
    }

    pub fn beta(&self) -> Range<usize> {
        1..1 + self.n_predictors
    }

    pub fn log_shape(&self) -> usize {
        self.beta().end
    }

    pub fn predictor_mean(&self) -> Range<usize> {
        let start = self.log_shape() + 1;
        start..start + self.n_predictors
    }

    pub fn log_sd(&self) -> Range<usize> {
        let start = self.predictor_mean().end;
        start..start + self.n_predictors
    }

    pub fn correlation(&self) -> Range<usize> {
        let start = self.log_sd().end;
        start..start + n_correlation_params(self.n_predictors)
    }

    pub fn latent(&self) -> Range<usize> {
        let start = self.correlation().end;
        start..start + self.n_latent
    }

    pub fn dim(&self) -> usize {
        self.latent().end
    }
}

/// Read-only model data shared by every chain.
#[derive(Clone)]
struct SharedData {
    response: Arc<Array1<f64>>,
    design: Arc<DesignMatrix>,
}

/// Unnormalised joint posterior of the Gamma regression and the imputation model.
#[derive(Clone)]
pub struct JointPosterior {
    data: SharedData,
    layout: ParameterLayout,
    priors: ModelPriors,
}

impl JointPosterior {
    pub fn new(response: Array1<f64>, design: DesignMatrix, priors: ModelPriors) -> Self {
        assert_eq!(
            response.len(),
            design.nrows(),
            "one response per design row"
        );
        let layout = ParameterLayout::new(design.ncols(), design.n_latent());
        Self {
            data: SharedData {
                response: Arc::new(response),
                design: Arc::new(design),
            },
            layout,
            priors,
        }
    }

    pub fn from_prepared(prepared: &PreparedData, priors: ModelPriors) -> Self {
        Self::new(prepared.response.clone(), prepared.design.clone(), priors)
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn design(&self) -> &DesignMatrix {
        &self.data.design
    }

    /// Log density and gradient on the unconstrained scale.
    fn compute_logp_and_grad(&self, position: &Array1<f64>) -> (f64, Array1<f64>) {
        let layout = &self.layout;
        let design = &self.data.design;
        let k = layout.n_predictors();

        let intercept = position[layout.intercept()];
        let beta = position.slice(s![layout.beta()]);
        let log_shape = position[layout.log_shape()];
        let x = design.fill(position.slice(s![layout.latent()]));

        let lik = gamma_log_link(self.data.response.view(), x.view(), intercept, beta, log_shape);
        let pred = predictor_log_density(
            x.view(),
            position.slice(s![layout.predictor_mean()]),
            position.slice(s![layout.log_sd()]),
            position.slice(s![layout.correlation()]),
            &self.priors,
        );

        let mut logp = lik.log_density + pred.log_density;
        let mut grad = Array1::<f64>::zeros(layout.dim());

        let (lp, g) = normal_prior(intercept, self.priors.coefficient_prior_sd);
        logp += lp;
        grad[layout.intercept()] = lik.grad_intercept + g;
        for j in 0..k {
            let (lp, g) = normal_prior(beta[j], self.priors.coefficient_prior_sd);
            logp += lp;
            grad[layout.beta().start + j] = lik.grad_beta[j] + g;
        }
        let (lp, g) = half_cauchy_log_scale_prior(log_shape, self.priors.dispersion_prior_scale);
        logp += lp;
        grad[layout.log_shape()] = lik.grad_log_shape + g;

        grad.slice_mut(s![layout.predictor_mean()])
            .assign(&pred.grad_mean);
        grad.slice_mut(s![layout.log_sd()]).assign(&pred.grad_log_sd);
        grad.slice_mut(s![layout.correlation()])
            .assign(&pred.grad_correlation);

        let latent_start = layout.latent().start;
        for (idx, &(row, col)) in design.latent_positions().iter().enumerate() {
            grad[latent_start + idx] = pred.grad_x[[row, col]] + lik.grad_eta[row] * beta[col];
        }

        if !logp.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            return (f64::NEG_INFINITY, Array1::zeros(layout.dim()));
        }
        (logp, grad)
    }

    /// Method-of-moments Gamma shape of the response, clamped to a sane range.
    fn shape_estimate(&self) -> f64 {
        let y = &self.data.response;
        if y.len() < 2 {
            return 1.0;
        }
        let mean = y.mean().unwrap_or(1.0);
        let var = y.var(1.0);
        if var > 0.0 && mean.is_finite() {
            (mean * mean / var).clamp(0.1, 1e4)
        } else {
            1.0
        }
    }

    /// Deterministic starting point built from the data.
    pub fn initial_point(&self) -> Array1<f64> {
        let layout = &self.layout;
        let design = &self.data.design;
        let (means, sds) = design.observed_column_moments();
        let mut q = Array1::<f64>::zeros(layout.dim());

        let mean_response = self.data.response.mean().unwrap_or(1.0);
        q[layout.intercept()] = mean_response.ln();
        q[layout.log_shape()] = self.shape_estimate().ln();
        q.slice_mut(s![layout.predictor_mean()]).assign(&means);
        q.slice_mut(s![layout.log_sd()]).assign(&sds.mapv(f64::ln));
        let latent_start = layout.latent().start;
        for (idx, &(_, col)) in design.latent_positions().iter().enumerate() {
            q[latent_start + idx] = means[col];
        }
        q
    }

    /// Diagonal whitening centred on [`Self::initial_point`].
    ///
    /// Scales are large-sample posterior standard deviations from the observed
    /// column moments and the moment estimate of the Gamma shape.
    pub fn whitening(&self) -> Whitening {
        let layout = &self.layout;
        let design = &self.data.design;
        let (_, sds) = design.observed_column_moments();
        let n = self.data.response.len().max(1) as f64;
        let info = (self.shape_estimate() * n).sqrt();
        let observed = design.observed_per_column();

        let mut scale = Array1::<f64>::ones(layout.dim());
        scale[layout.intercept()] = 1.0 / info;
        for j in 0..layout.n_predictors() {
            let n_obs = observed[j].max(1) as f64;
            scale[layout.beta().start + j] = 1.0 / (sds[j] * info);
            scale[layout.predictor_mean().start + j] = sds[j] / n_obs.sqrt();
            scale[layout.log_sd().start + j] = (0.5 / n_obs).sqrt();
        }
        scale[layout.log_shape()] = (2.0 / n).sqrt();
        scale.slice_mut(s![layout.correlation()]).fill(1.0 / n.sqrt());
        let latent_start = layout.latent().start;
        for (idx, &(_, col)) in design.latent_positions().iter().enumerate() {
            scale[latent_start + idx] = sds[col];
        }
        Whitening {
            center: self.initial_point(),
            scale,
        }
    }

    /// One jittered starting point per chain, drawn from a single seeded stream.
    ///
    /// `jitter` is a half-width in whitened units.
    pub fn initial_positions(&self, n_chains: usize, jitter: f64, seed: u64) -> Vec<Array1<f64>> {
        let whitening = self.whitening();
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n_chains)
            .map(|_| {
                if jitter > 0.0 {
                    let z = Array1::from_shape_fn(whitening.dim(), |_| rng.gen_range(-jitter..jitter));
                    whitening.from_unit(&z)
                } else {
                    whitening.center.clone()
                }
            })
            .collect()
    }

    /// Maps unconstrained draws to the model's natural parameters.
    pub fn constrain(&self, result: &NutsResult) -> PosteriorDraws {
        let layout = &self.layout;
        let k = layout.n_predictors();
        let (n_chains, n_draws, _) = result.samples.dim();
        let n_corr = n_correlation_params(k);

        let mut draws = PosteriorDraws {
            intercept: Array2::zeros((n_chains, n_draws)),
            beta: Array3::zeros((n_chains, n_draws, k)),
            shape: Array2::zeros((n_chains, n_draws)),
            predictor_mean: Array3::zeros((n_chains, n_draws, k)),
            predictor_sd: Array3::zeros((n_chains, n_draws, k)),
            predictor_correlation: Array3::zeros((n_chains, n_draws, n_corr)),
            latent: Array3::zeros((n_chains, n_draws, layout.n_latent())),
        };

        for chain in 0..n_chains {
            for draw in 0..n_draws {
                let q = result.samples.slice(s![chain, draw, ..]);
                draws.intercept[[chain, draw]] = q[layout.intercept()];
                draws
                    .beta
                    .slice_mut(s![chain, draw, ..])
                    .assign(&q.slice(s![layout.beta()]));
                draws.shape[[chain, draw]] = q[layout.log_shape()].exp();
                draws
                    .predictor_mean
                    .slice_mut(s![chain, draw, ..])
                    .assign(&q.slice(s![layout.predictor_mean()]));
                draws
                    .predictor_sd
                    .slice_mut(s![chain, draw, ..])
                    .assign(&q.slice(s![layout.log_sd()]).mapv(f64::exp));
                let corr = CholeskyCorrelation::from_unconstrained(q.slice(s![layout.correlation()]), k)
                    .correlation();
                let mut idx = 0;
                for i in 1..k {
                    for j in 0..i {
                        draws.predictor_correlation[[chain, draw, idx]] = corr[[i, j]];
                        idx += 1;
                    }
                }
                draws
                    .latent
                    .slice_mut(s![chain, draw, ..])
                    .assign(&q.slice(s![layout.latent()]));
            }
        }
        draws
    }
}

impl LogDensity for JointPosterior {
    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn logp_and_grad(&self, position: &Array1<f64>) -> (f64, Array1<f64>) {
        self.compute_logp_and_grad(position)
    }
}

/// Posterior draws on the natural scale, indexed `(chain, draw, component)`.
#[derive(Debug, Clone)]
pub struct PosteriorDraws {
    pub intercept: Array2<f64>,
    pub beta: Array3<f64>,
    /// Gamma shape α.
    pub shape: Array2<f64>,
    pub predictor_mean: Array3<f64>,
    pub predictor_sd: Array3<f64>,
    /// Strict lower triangle of the predictor correlation matrix, row-major.
    pub predictor_correlation: Array3<f64>,
    /// Imputed value of every latent cell, in arena order.
    pub latent: Array3<f64>,
}

impl PosteriorDraws {
    pub fn n_chains(&self) -> usize {
        self.intercept.nrows()
    }

    pub fn n_draws(&self) -> usize {
        self.intercept.ncols()
    }

    pub fn n_predictors(&self) -> usize {
        self.beta.len_of(Axis(2))
    }

    /// Chain-by-draw view of coefficient `j`.
    pub fn beta_component(&self, j: usize) -> ArrayView2<'_, f64> {
        self.beta.index_axis(Axis(2), j)
    }
}
