//! Posterior summaries of the regression coefficients.

use crate::diagnostics::{ess_bulk, quantiles, rank_normalized_rhat, split_rhat};
use crate::model::PosteriorDraws;
use ndarray::ArrayView2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("There are no posterior draws to summarise.")]
    NoDraws,
    #[error("The posterior has {draws} coefficients but {names} predictor names and {labels} labels were given.")]
    CoefficientCountMismatch {
        draws: usize,
        names: usize,
        labels: usize,
    },
}

/// Marginal summary of one scalar parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub median: f64,
    pub lower95: f64,
    pub lower50: f64,
    pub upper50: f64,
    pub upper95: f64,
    /// Fraction of draws strictly greater than zero.
    pub p_positive: f64,
    /// Rank-normalised split R-hat; the convergence check uses this one.
    pub rhat: f64,
    /// Split R-hat on the raw draws.
    pub split_rhat: f64,
    pub ess_bulk: f64,
}

impl ParameterSummary {
    /// Summarises a `(chain, draw)` array.
    pub fn from_draws(draws: ArrayView2<f64>) -> Result<Self, SummaryError> {
        if draws.is_empty() {
            return Err(SummaryError::NoDraws);
        }
        let pooled: Vec<f64> = draws.iter().copied().collect();
        let q = quantiles(&pooled, &[0.5, 0.025, 0.25, 0.75, 0.975]);
        let positive = pooled.iter().filter(|&&v| v > 0.0).count();
        Ok(Self {
            median: q[0],
            lower95: q[1],
            lower50: q[2],
            upper50: q[3],
            upper95: q[4],
            p_positive: positive as f64 / pooled.len() as f64,
            rhat: rank_normalized_rhat(draws),
            split_rhat: split_rhat(draws),
            ess_bulk: ess_bulk(draws),
        })
    }
}

/// One row of the coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRow {
    pub predictor: String,
    pub label: String,
    pub median: f64,
    pub lower95: f64,
    pub lower50: f64,
    pub upper50: f64,
    pub upper95: f64,
    pub p_positive: f64,
    pub rhat: f64,
    pub split_rhat: f64,
    pub ess_bulk: f64,
}

impl CoefficientRow {
    fn new(predictor: &str, label: &str, stats: ParameterSummary) -> Self {
        Self {
            predictor: predictor.to_string(),
            label: label.to_string(),
            median: stats.median,
            lower95: stats.lower95,
            lower50: stats.lower50,
            upper50: stats.upper50,
            upper95: stats.upper95,
            p_positive: stats.p_positive,
            rhat: stats.rhat,
            split_rhat: stats.split_rhat,
            ess_bulk: stats.ess_bulk,
        }
    }
}

/// The coefficient table, stored in display order: the reverse of the order
/// the predictors were defined in.
#[derive(Debug, Clone)]
pub struct CoefficientSummary {
    rows: Vec<CoefficientRow>,
}

impl CoefficientSummary {
    pub fn from_draws(
        draws: &PosteriorDraws,
        predictors: &[String],
        labels: &[String],
    ) -> Result<Self, SummaryError> {
        let k = draws.n_predictors();
        if predictors.len() != k || labels.len() != k {
            return Err(SummaryError::CoefficientCountMismatch {
                draws: k,
                names: predictors.len(),
                labels: labels.len(),
            });
        }
        let mut rows = (0..k)
            .into_par_iter()
            .map(|j| -> Result<CoefficientRow, SummaryError> {
                let stats = ParameterSummary::from_draws(draws.beta_component(j))?;
                Ok(CoefficientRow::new(&predictors[j], &labels[j], stats))
            })
            .collect::<Result<Vec<_>, SummaryError>>()?;
        rows.reverse();
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[CoefficientRow] {
        &self.rows
    }

    /// Rows in the order the predictors were defined.
    pub fn definition_order(&self) -> impl Iterator<Item = &CoefficientRow> {
        self.rows.iter().rev()
    }

    /// Rows whose R-hat exceeds `threshold`. Each one is logged as a warning;
    /// the rows stay in the table either way.
    pub fn unconverged(&self, threshold: f64) -> Vec<&CoefficientRow> {
        let flagged: Vec<&CoefficientRow> = self
            .definition_order()
            .filter(|row| !(row.rhat <= threshold))
            .collect();
        for row in &flagged {
            log::warn!(
                "Coefficient '{}' has R-hat {:.4} (threshold {}); treat its summary with caution.",
                row.predictor,
                row.rhat,
                threshold
            );
        }
        flagged
    }
}
