//! # Predictive Quantile Scoring
//!
//! Each observation is scored by where its response falls in the Gamma
//! distribution predicted for it at the posterior-median parameters. Quantiles
//! near 1 are "bright spots" (better than predicted), near 0 "dark spots".
//!
//! Missing predictor cells are filled with the posterior median of their latent
//! draws before the fitted mean is computed.

use crate::data::PreparedData;
use crate::design::{Cell, DesignMatrix};
use crate::diagnostics::{average_ranks, median};
use crate::model::PosteriorDraws;
use ndarray::{Array1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Gamma};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("The posterior median Gamma shape {0} is not a valid shape parameter.")]
    InvalidShape(f64),
    #[error("The fitted mean for '{country}' (row {row}) is {mean}, which is not a positive finite number.")]
    InvalidFittedMean {
        row: usize,
        country: String,
        mean: f64,
    },
    #[error("The point estimates hold {found} latent cells, but the design matrix has {expected}.")]
    LatentCountMismatch { expected: usize, found: usize },
    #[error("The point estimates hold {found} coefficients, but the design matrix has {expected} predictors.")]
    CoefficientCountMismatch { expected: usize, found: usize },
}

/// Posterior-median plug-in values used for scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct PointEstimates {
    pub intercept: f64,
    pub beta: Array1<f64>,
    pub shape: f64,
    /// Median of every latent cell, in arena order.
    pub latent: Array1<f64>,
}

fn pooled_median<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let pooled: Vec<f64> = values.copied().collect();
    median(&pooled)
}

impl PointEstimates {
    pub fn from_draws(draws: &PosteriorDraws) -> Self {
        let beta = draws
            .beta
            .axis_iter(Axis(2))
            .map(|component| pooled_median(component.iter()))
            .collect();
        let latent: Vec<f64> = draws
            .latent
            .axis_iter(Axis(2))
            .into_par_iter()
            .map(|cell| pooled_median(cell.iter()))
            .collect();
        Self {
            intercept: pooled_median(draws.intercept.iter()),
            beta,
            shape: pooled_median(draws.shape.iter()),
            latent: Array1::from_vec(latent),
        }
    }

    /// Re-expresses the estimates for a design whose columns were reordered.
    ///
    /// `order[new] = old` maps columns of `permuted` back to `original`.
    pub fn reorder_columns(
        &self,
        order: &[usize],
        original: &DesignMatrix,
        permuted: &DesignMatrix,
    ) -> Self {
        let beta = order.iter().map(|&old| self.beta[old]).collect();
        let latent = permuted
            .latent_positions()
            .iter()
            .map(|&(row, col)| match original.cell(row, order[col]) {
                Cell::Latent(idx) => self.latent[idx],
                Cell::Observed(v) => v,
            })
            .collect();
        Self {
            intercept: self.intercept,
            beta,
            shape: self.shape,
            latent,
        }
    }
}

/// One scored observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileRow {
    pub country: String,
    pub iso3: String,
    /// Gamma CDF of the response under the fitted model, in [0, 1].
    pub quantile: f64,
    /// Number of predictors that were missing in the source row.
    pub n_missing: usize,
    pub fitted_mean: f64,
    /// Scaled response.
    pub response: f64,
}

#[derive(Debug, Clone)]
pub struct QuantileTable {
    pub rows: Vec<QuantileRow>,
    /// Spearman correlation between quantile and missing count; `None` when
    /// either is constant.
    pub missing_correlation: Option<f64>,
}

impl QuantileTable {
    pub fn quantiles(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.quantile).collect()
    }
}

/// Scores every observation of `prepared` at the given point estimates.
pub fn score_observations(
    prepared: &PreparedData,
    estimates: &PointEstimates,
) -> Result<QuantileTable, ScoringError> {
    let design = &prepared.design;
    if estimates.latent.len() != design.n_latent() {
        return Err(ScoringError::LatentCountMismatch {
            expected: design.n_latent(),
            found: estimates.latent.len(),
        });
    }
    if estimates.beta.len() != design.ncols() {
        return Err(ScoringError::CoefficientCountMismatch {
            expected: design.ncols(),
            found: estimates.beta.len(),
        });
    }
    let shape = estimates.shape;
    if !(shape.is_finite() && shape > 0.0) {
        return Err(ScoringError::InvalidShape(shape));
    }

    let x = design.fill(estimates.latent.view());
    let fitted = (x.dot(&estimates.beta) + estimates.intercept).mapv(f64::exp);
    let missing = design.missing_per_row();

    let mut rows = Vec::with_capacity(prepared.n_rows());
    for (i, &mean) in fitted.iter().enumerate() {
        let country = prepared.countries[i].clone();
        let dist = Gamma::new(shape, shape / mean).map_err(|_| ScoringError::InvalidFittedMean {
            row: i,
            country: country.clone(),
            mean,
        })?;
        rows.push(QuantileRow {
            country,
            iso3: prepared.iso3[i].clone(),
            quantile: dist.cdf(prepared.response[i]).clamp(0.0, 1.0),
            n_missing: missing[i],
            fitted_mean: mean,
            response: prepared.response[i],
        });
    }

    let quantiles: Vec<f64> = rows.iter().map(|r| r.quantile).collect();
    let counts: Vec<f64> = missing.iter().map(|&m| m as f64).collect();
    let missing_correlation = spearman(&quantiles, &counts);
    match missing_correlation {
        Some(rho) => log::info!(
            "Spearman correlation between quantile and missing-predictor count: {:.3}",
            rho
        ),
        None => log::info!("Quantile/missing-count correlation undefined (a constant column)."),
    }

    Ok(QuantileTable {
        rows,
        missing_correlation,
    })
}

/// Spearman rank correlation with average ranks for ties.
pub fn spearman(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let ra = average_ranks(a);
    let rb = average_ranks(b);
    let n = ra.len() as f64;
    let mean_a = ra.iter().sum::<f64>() / n;
    let mean_b = rb.iter().sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in ra.iter().zip(&rb) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some(cov / (var_a * var_b).sqrt())
}
