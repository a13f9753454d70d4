//! Convergence diagnostics and order statistics for posterior draws.
//!
//! Inputs are `(chain, draw)` arrays for one scalar quantity. R-hat is the
//! rank-normalised split R-hat of Vehtari et al. (2021), i.e. the larger of the
//! bulk and folded-tail values; bulk ESS uses Geyer's initial monotone sequence
//! on the same rank-normalised split chains.

use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate, s};
use statrs::distribution::{ContinuousCDF, Normal};

/// Linear-interpolation quantile of already sorted values.
///
/// Matches numpy's default (`h = (n - 1) p`).
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

/// Quantiles of unsorted values, one per probability in `probs`.
pub fn quantiles(values: &[f64], probs: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    probs.iter().map(|&p| quantile_sorted(&sorted, p)).collect()
}

pub fn median(values: &[f64]) -> f64 {
    quantiles(values, &[0.5])[0]
}

/// 1-based ranks with ties replaced by their average rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Ranks start..end (0-based) share the mean of start+1..=end.
        let rank = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

/// Splits every chain into its first and last halves, doubling the chain count.
/// With an odd number of draws the middle draw is dropped.
pub fn split_chains(draws: ArrayView2<f64>) -> Array2<f64> {
    let n = draws.ncols();
    let half = n / 2;
    let first = draws.slice(s![.., ..half]);
    let second = draws.slice(s![.., n - half..]);
    // Both halves have the same shape, so this cannot fail.
    concatenate(Axis(0), &[first, second]).unwrap_or_else(|_| Array2::zeros((0, 0)))
}

/// Replaces every value by the normal quantile of its fractional rank.
fn z_scale(draws: &Array2<f64>) -> Array2<f64> {
    let flat: Vec<f64> = draws.iter().copied().collect();
    let ranks = average_ranks(&flat);
    let size = flat.len() as f64;
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return Array2::from_elem(draws.raw_dim(), f64::NAN);
    };
    let z: Vec<f64> = ranks
        .iter()
        .map(|r| normal.inverse_cdf((r - 0.375) / (size + 0.25)))
        .collect();
    Array2::from_shape_vec(draws.raw_dim(), z).unwrap_or_else(|_| Array2::zeros(draws.raw_dim()))
}

/// Potential scale reduction of chains that are already split.
fn rhat_of(draws: &Array2<f64>) -> f64 {
    let (n_chains, n_draws) = draws.dim();
    if n_chains < 2 || n_draws < 2 {
        return f64::NAN;
    }
    let n = n_draws as f64;
    let chain_means = draws.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(n_chains));
    let chain_vars = draws.var_axis(Axis(1), 1.0);
    let between = n * chain_means.var(1.0);
    let within = chain_vars.mean().unwrap_or(f64::NAN);
    if within <= 0.0 || !within.is_finite() {
        return f64::NAN;
    }
    ((between / within + n - 1.0) / n).sqrt()
}

/// Classic split R-hat without rank normalisation.
pub fn split_rhat(draws: ArrayView2<f64>) -> f64 {
    rhat_of(&split_chains(draws))
}

/// Rank-normalised split R-hat: the maximum of the bulk and tail values.
pub fn rank_normalized_rhat(draws: ArrayView2<f64>) -> f64 {
    let split = split_chains(draws);
    if split.is_empty() {
        return f64::NAN;
    }
    let bulk = rhat_of(&z_scale(&split));

    let flat: Vec<f64> = draws.iter().copied().collect();
    let center = median(&flat);
    let folded = split.mapv(|v| (v - center).abs());
    let tail = rhat_of(&z_scale(&folded));
    bulk.max(tail)
}

/// Bulk effective sample size.
pub fn ess_bulk(draws: ArrayView2<f64>) -> f64 {
    let split = split_chains(draws);
    if split.ncols() < 4 {
        return f64::NAN;
    }
    ess_of(&z_scale(&split))
}

/// Biased autocovariance of every chain at `lag`, averaged over chains.
fn mean_autocovariance(draws: &Array2<f64>, means: &Array1<f64>, lag: usize) -> f64 {
    let n = draws.ncols();
    let total: f64 = draws
        .outer_iter()
        .zip(means.iter())
        .map(|(chain, &m)| {
            let mut acc = 0.0;
            for t in 0..n - lag {
                acc += (chain[t] - m) * (chain[t + lag] - m);
            }
            acc / n as f64
        })
        .sum();
    total / draws.nrows() as f64
}

fn ess_of(draws: &Array2<f64>) -> f64 {
    let (n_chains, n_draws) = draws.dim();
    let n = n_draws as f64;
    let chain_means = draws.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(n_chains));
    let mut acov_cache: Vec<Option<f64>> = vec![None; n_draws];
    let mut acov = |lag: usize| -> f64 {
        *acov_cache[lag].get_or_insert_with(|| mean_autocovariance(draws, &chain_means, lag))
    };

    let mean_var = acov(0) * n / (n - 1.0);
    let mut var_plus = mean_var * (n - 1.0) / n;
    if n_chains > 1 {
        var_plus += chain_means.var(1.0);
    }
    if !(var_plus > 0.0) {
        return f64::NAN;
    }

    let mut rho_hat = vec![0.0; n_draws];
    let mut rho_even = 1.0;
    let mut rho_odd = 1.0 - (mean_var - acov(1)) / var_plus;
    rho_hat[0] = rho_even;
    rho_hat[1] = rho_odd;

    // Initial positive sequence.
    let mut t = 1;
    while t + 3 < n_draws && rho_even + rho_odd > 0.0 {
        rho_even = 1.0 - (mean_var - acov(t + 1)) / var_plus;
        rho_odd = 1.0 - (mean_var - acov(t + 2)) / var_plus;
        if rho_even + rho_odd >= 0.0 {
            rho_hat[t + 1] = rho_even;
            rho_hat[t + 2] = rho_odd;
        }
        t += 2;
    }
    // Index one past the last lag kept by the positive sequence.
    let max_t = t as isize - 2;
    let next = (max_t + 1) as usize;
    if rho_even > 0.0 {
        rho_hat[next] = rho_even;
    }

    // Initial monotone sequence.
    let mut t = 1;
    while t as isize <= max_t - 2 {
        if rho_hat[t + 1] + rho_hat[t + 2] > rho_hat[t - 1] + rho_hat[t] {
            rho_hat[t + 1] = (rho_hat[t - 1] + rho_hat[t]) / 2.0;
            rho_hat[t + 2] = rho_hat[t + 1];
        }
        t += 2;
    }

    let total = (n_chains * n_draws) as f64;
    let tau = -1.0 + 2.0 * rho_hat[..next].iter().sum::<f64>() + rho_hat[next];
    total / tau.max(1.0 / total.log10())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn normal_chains(n_chains: usize, n_draws: usize, offsets: &[f64], seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n_chains, n_draws), |(c, _)| {
            offsets[c] + rng.sample::<f64, _>(StandardNormal)
        })
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let values = [4.0, 1.0, 3.0, 2.0];
        let q = quantiles(&values, &[0.0, 0.25, 0.5, 0.975, 1.0]);
        assert_abs_diff_eq!(q[0], 1.0);
        assert_abs_diff_eq!(q[1], 1.75);
        assert_abs_diff_eq!(q[2], 2.5);
        assert_abs_diff_eq!(q[3], 3.925, epsilon = 1e-12);
        assert_abs_diff_eq!(q[4], 4.0);
        assert_abs_diff_eq!(median(&[5.0]), 5.0);
    }

    #[test]
    fn ties_share_average_rank() {
        let ranks = average_ranks(&[10.0, 20.0, 20.0, 5.0, 30.0]);
        assert_eq!(ranks, vec![2.0, 3.5, 3.5, 1.0, 5.0]);
    }

    #[test]
    fn split_halves_drop_middle_draw() {
        let draws = ndarray::array![[1.0, 2.0, 3.0, 4.0, 5.0]];
        let split = split_chains(draws.view());
        assert_eq!(split, ndarray::array![[1.0, 2.0], [4.0, 5.0]]);
    }

    #[test]
    fn rhat_near_one_for_mixed_chains() {
        let draws = normal_chains(4, 1000, &[0.0; 4], 3);
        let rhat = rank_normalized_rhat(draws.view());
        assert!(rhat < 1.01, "rhat = {}", rhat);
        assert!(split_rhat(draws.view()) < 1.01);
    }

    #[test]
    fn rhat_flags_separated_chains() {
        let draws = normal_chains(2, 500, &[0.0, 5.0], 4);
        assert!(rank_normalized_rhat(draws.view()) > 1.5);
        assert!(split_rhat(draws.view()) > 1.5);
    }

    #[test]
    fn rhat_flags_a_trending_chain() {
        let draws = Array2::from_shape_fn((2, 400), |(_, d)| d as f64 / 100.0);
        assert!(rank_normalized_rhat(draws.view()) > 1.1);
    }

    #[test]
    fn ess_of_independent_draws_is_close_to_draw_count() {
        let draws = normal_chains(2, 1000, &[0.0, 0.0], 5);
        let ess = ess_bulk(draws.view());
        assert!(ess > 1500.0 && ess < 2600.0, "ess = {}", ess);
    }

    #[test]
    fn ess_shrinks_with_autocorrelation() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut draws = Array2::zeros((2, 1000));
        for c in 0..2 {
            let mut x = 0.0;
            for d in 0..1000 {
                x = 0.9 * x + rng.sample::<f64, _>(StandardNormal);
                draws[[c, d]] = x;
            }
        }
        let ess = ess_bulk(draws.view());
        // AR(1) with φ = 0.9 has ESS ≈ N (1 - φ) / (1 + φ) ≈ 105.
        assert!(ess > 40.0 && ess < 300.0, "ess = {}", ess);
    }

    #[test]
    fn constant_draws_have_undefined_diagnostics() {
        let draws = Array2::from_elem((2, 100), 3.0);
        assert!(split_rhat(draws.view()).is_nan());
        assert!(ess_bulk(draws.view()).is_nan());
    }
}
