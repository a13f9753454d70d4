//! # Predictor Imputation Sub-model
//!
//! Predictor rows are modelled as i.i.d. multivariate normal draws,
//! `x_i ~ MVN(μ, L Lᵀ)` with `L = diag(σ) C`. `C` is the Cholesky factor of a
//! correlation matrix with an LKJ prior. Missing cells of `X` are ordinary
//! parameters of this density, so every one of them gets a posterior.
//!
//! ## Parameterisation
//!
//! `C` is built from `k(k-1)/2` unconstrained values `y` through canonical
//! partial correlations `z = tanh(y)`, enumerated row-major over the strict lower
//! triangle. For row `i` with running scale `s_0 = 1`, `s_{j+1} = s_j √(1 - z_j²)`:
//!
//! - `C_ij = z_j s_j` for `j < i`,
//! - `C_ii = s_i`.
//!
//! Every row has unit norm and a positive diagonal, so `C Cᵀ` is a valid
//! correlation matrix for any `y`.

use crate::config::ModelPriors;
use crate::likelihood::{exponential_log_scale_prior, normal_prior};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::f64::consts::LN_2;

/// Number of unconstrained values needed for a `k × k` correlation factor.
pub fn n_correlation_params(k: usize) -> usize {
    k * k.saturating_sub(1) / 2
}

/// `ln(1 - tanh(y)²) = -2 ln cosh(y)`, accurate for large `|y|`.
fn log_one_minus_tanh_sq(y: f64) -> f64 {
    let a = y.abs();
    -2.0 * (a + (-2.0 * a).exp().ln_1p() - LN_2)
}

/// Correlation Cholesky factor together with what its gradient needs.
#[derive(Debug, Clone)]
pub struct CholeskyCorrelation {
    factor: Array2<f64>,
    log_diag: Array1<f64>,
    z: Array1<f64>,
    log_t: Array1<f64>,
    /// `ln s_j` in effect when entry `j` of its row was built.
    log_scale: Array1<f64>,
    log_jacobian: f64,
}

impl CholeskyCorrelation {
    pub fn from_unconstrained(y: ArrayView1<f64>, k: usize) -> Self {
        debug_assert_eq!(y.len(), n_correlation_params(k));
        let z = y.mapv(f64::tanh);
        let log_t = y.mapv(log_one_minus_tanh_sq);
        let mut factor = Array2::zeros((k, k));
        let mut log_diag = Array1::zeros(k);
        let mut log_scale = Array1::zeros(y.len());
        let mut log_jacobian = log_t.sum();

        let mut offset = 0;
        for i in 0..k {
            // ln s_j for the running scale of this row.
            let mut log_s = 0.0;
            for j in 0..i {
                if j > 0 {
                    log_jacobian += log_s;
                }
                factor[[i, j]] = z[offset + j] * log_s.exp();
                log_scale[offset + j] = log_s;
                log_s += 0.5 * log_t[offset + j];
            }
            factor[[i, i]] = log_s.exp();
            log_diag[i] = log_s;
            offset += i;
        }

        Self {
            factor,
            log_diag,
            z,
            log_t,
            log_scale,
            log_jacobian,
        }
    }

    pub fn dim(&self) -> usize {
        self.factor.nrows()
    }

    pub fn factor(&self) -> &Array2<f64> {
        &self.factor
    }

    /// `ln C_ii` for every row.
    pub fn log_diagonal(&self) -> &Array1<f64> {
        &self.log_diag
    }

    /// Log absolute determinant of the map from `y` to the free entries of `C`.
    pub fn log_jacobian(&self) -> f64 {
        self.log_jacobian
    }

    pub fn correlation(&self) -> Array2<f64> {
        self.factor.dot(&self.factor.t())
    }

    /// LKJ(η) density kernel expressed on the Cholesky factor.
    pub fn lkj_log_kernel(&self, eta: f64) -> f64 {
        let k = self.dim();
        (1..k)
            .map(|d| lkj_coefficient(k, d, eta) * self.log_diag[d])
            .sum()
    }

    /// Pulls gradients on `C` (lower triangle) and on `ln C_ii` back to `y`.
    ///
    /// The result also contains the derivative of [`log_jacobian`](Self::log_jacobian).
    pub fn backprop(
        &self,
        grad_factor: ArrayView2<f64>,
        grad_log_diag: ArrayView1<f64>,
    ) -> Array1<f64> {
        let k = self.dim();
        let mut grad_y = Array1::zeros(self.z.len());
        let mut offset = 0;
        for i in 1..k {
            offset += i - 1;
            // Σ_{j > l} ∂f/∂C_ij · C_ij, including the diagonal.
            let mut tail = grad_factor[[i, i]] * self.factor[[i, i]];
            for l in (0..i).rev() {
                let idx = offset + l;
                let z = self.z[idx];
                let through_z = grad_factor[[i, l]] * (self.log_scale[idx] + self.log_t[idx]).exp();
                let jacobian_weight = (i + 1 - l) as f64;
                grad_y[idx] = through_z - z * (tail + jacobian_weight + grad_log_diag[i]);
                tail += grad_factor[[i, l]] * self.factor[[i, l]];
            }
        }
        grad_y
    }
}

fn lkj_coefficient(k: usize, d: usize, eta: f64) -> f64 {
    (k as f64) - (d as f64) - 1.0 + 2.0 * eta - 2.0
}

/// Log density of the predictor block and its gradient.
#[derive(Debug, Clone)]
pub struct PredictorDensity {
    pub log_density: f64,
    pub grad_mean: Array1<f64>,
    pub grad_log_sd: Array1<f64>,
    pub grad_correlation: Array1<f64>,
    /// Gradient with respect to every cell of `X`; only latent cells use it.
    pub grad_x: Array2<f64>,
}

/// MVN likelihood of the filled predictor matrix plus the priors on its mean,
/// scales and correlation, on the unconstrained scale.
pub fn predictor_log_density(
    x: ArrayView2<f64>,
    mean: ArrayView1<f64>,
    log_sd: ArrayView1<f64>,
    correlation_params: ArrayView1<f64>,
    priors: &ModelPriors,
) -> PredictorDensity {
    let (n, k) = x.dim();
    let corr = CholeskyCorrelation::from_unconstrained(correlation_params, k);
    let sd = log_sd.mapv(f64::exp);
    let c = corr.factor();
    let mut chol = c.clone();
    for a in 0..k {
        for b in 0..=a {
            chol[[a, b]] *= sd[a];
        }
    }

    let mut log_density = -(n as f64) * (log_sd.sum() + corr.log_diagonal().sum());
    let mut grad_x = Array2::<f64>::zeros((n, k));
    let mut grad_mean = Array1::<f64>::zeros(k);
    let mut grad_chol = Array2::<f64>::zeros((k, k));
    let mut w = Array1::<f64>::zeros(k);
    let mut v = Array1::<f64>::zeros(k);

    for i in 0..n {
        // w = L⁻¹ (x_i - μ)
        for a in 0..k {
            let mut acc = x[[i, a]] - mean[a];
            for b in 0..a {
                acc -= chol[[a, b]] * w[b];
            }
            w[a] = acc / chol[[a, a]];
        }
        // v = L⁻ᵀ w
        for a in (0..k).rev() {
            let mut acc = w[a];
            for b in a + 1..k {
                acc -= chol[[b, a]] * v[b];
            }
            v[a] = acc / chol[[a, a]];
        }
        log_density -= 0.5 * w.dot(&w);
        for a in 0..k {
            grad_x[[i, a]] = -v[a];
            grad_mean[a] += v[a];
            for b in 0..=a {
                grad_chol[[a, b]] += v[a] * w[b];
            }
        }
    }

    let mut grad_log_sd = Array1::<f64>::zeros(k);
    let mut grad_factor = Array2::<f64>::zeros((k, k));
    for a in 0..k {
        let mut acc = 0.0;
        for b in 0..=a {
            acc += grad_chol[[a, b]] * c[[a, b]];
            grad_factor[[a, b]] = grad_chol[[a, b]] * sd[a];
        }
        grad_log_sd[a] = sd[a] * acc - n as f64;
    }

    let eta = priors.lkj_eta;
    let mut grad_log_diag = Array1::from_elem(k, -(n as f64));
    for d in 1..k {
        grad_log_diag[d] += lkj_coefficient(k, d, eta);
    }
    log_density += corr.lkj_log_kernel(eta) + corr.log_jacobian();
    let grad_correlation = corr.backprop(grad_factor.view(), grad_log_diag.view());

    for a in 0..k {
        let (lp, g) = normal_prior(mean[a], priors.predictor_mean_prior_sd);
        log_density += lp;
        grad_mean[a] += g;
        let (lp, g) = exponential_log_scale_prior(log_sd[a], priors.predictor_sd_prior_rate);
        log_density += lp;
        grad_log_sd[a] += g;
    }

    PredictorDensity {
        log_density,
        grad_mean,
        grad_log_sd,
        grad_correlation,
        grad_x,
    }
}
