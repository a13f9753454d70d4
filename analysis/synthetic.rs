//! Synthetic source tables drawn from a known Gamma regression.
//!
//! The generated table uses the reference schema with dotted column names, so
//! it goes through the same normalisation as real input. Predictors are
//! multivariate normal with AR(1) correlation, cells are blanked completely at
//! random, and the response is Gamma with a log-linear mean.

use crate::config::{DataConfig, PredictorSpec, REFERENCE_PREDICTORS};
use crate::data::SourceTable;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, StandardNormal};
use thiserror::Error;

const DEFAULT_BETA: [f64; 10] = [0.3, -0.2, 0.15, -0.25, 0.2, 0.0, 0.1, -0.1, 0.25, -0.15];
const MISSING: &str = "NA";

#[derive(Error, Debug)]
pub enum SyntheticError {
    #[error("The Gamma shape must be a positive finite number, got {0}.")]
    InvalidShape(f64),
    #[error("Row {row} has generated mean {mean}, which is not a positive finite number; check the intercept and coefficients.")]
    InvalidMean { row: usize, mean: f64 },
}

/// Parameters the table was generated from, on the unscaled response.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    pub intercept: f64,
    pub beta: Array1<f64>,
    pub shape: f64,
}

#[derive(Debug, Clone)]
pub struct SyntheticTableBuilder {
    n_rows: usize,
    n_predictors: usize,
    missing_fraction: f64,
    predictor_correlation: f64,
    n_small_territories: usize,
    n_missing_response: usize,
    intercept: f64,
    beta: Option<Vec<f64>>,
    shape: f64,
    seed: u64,
}

impl SyntheticTableBuilder {
    /// A table of `n_rows` analysable rows with all ten reference predictors.
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_rows,
            n_predictors: REFERENCE_PREDICTORS.len(),
            missing_fraction: 0.1,
            predictor_correlation: 0.3,
            n_small_territories: 0,
            n_missing_response: 0,
            intercept: -1.0,
            beta: None,
            shape: 8.0,
            seed: 42,
        }
    }

    /// Uses only the first `k` reference predictors (at most ten).
    pub fn with_predictors(mut self, k: usize) -> Self {
        self.n_predictors = k.clamp(1, REFERENCE_PREDICTORS.len());
        self
    }

    pub fn with_missing_fraction(mut self, fraction: f64) -> Self {
        self.missing_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Lag-one correlation of the AR(1) predictor covariance.
    pub fn with_predictor_correlation(mut self, rho: f64) -> Self {
        self.predictor_correlation = rho.clamp(-0.95, 0.95);
        self
    }

    /// Extra rows below the default population threshold.
    pub fn with_small_territories(mut self, n: usize) -> Self {
        self.n_small_territories = n;
        self
    }

    /// Extra rows whose response is missing.
    pub fn with_missing_responses(mut self, n: usize) -> Self {
        self.n_missing_response = n;
        self
    }

    pub fn with_intercept(mut self, intercept: f64) -> Self {
        self.intercept = intercept;
        self
    }

    /// Coefficients; padded with zeros or truncated to the predictor count.
    pub fn with_beta(mut self, beta: Vec<f64>) -> Self {
        self.beta = Some(beta);
        self
    }

    pub fn with_shape(mut self, shape: f64) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The data configuration that reads the generated table.
    pub fn data_config(&self) -> DataConfig {
        DataConfig {
            predictors: REFERENCE_PREDICTORS[..self.n_predictors]
                .iter()
                .map(|(column, label)| PredictorSpec {
                    column: column.to_string(),
                    label: label.to_string(),
                })
                .collect(),
            ..DataConfig::default()
        }
    }

    fn truth(&self) -> GroundTruth {
        let k = self.n_predictors;
        let given = self.beta.as_deref().unwrap_or(&DEFAULT_BETA);
        let beta = Array1::from_shape_fn(k, |j| given.get(j).copied().unwrap_or(0.0));
        GroundTruth {
            intercept: self.intercept,
            beta,
            shape: self.shape,
        }
    }

    /// Lower Cholesky factor of the AR(1) correlation `ρ^|a-b|`, in closed form:
    /// `L[i][0] = ρ^i` and `L[i][j] = ρ^(i-j) √(1-ρ²)` for `1 ≤ j ≤ i`.
    fn predictor_factor(&self) -> Array2<f64> {
        let k = self.n_predictors;
        let rho = self.predictor_correlation;
        let tail = (1.0 - rho * rho).sqrt();
        Array2::from_shape_fn((k, k), |(i, j)| match j {
            _ if j > i => 0.0,
            0 => rho.powi(i as i32),
            _ => rho.powi((i - j) as i32) * tail,
        })
    }

    pub fn build(&self) -> Result<(SourceTable, GroundTruth), SyntheticError> {
        if !(self.shape.is_finite() && self.shape > 0.0) {
            return Err(SyntheticError::InvalidShape(self.shape));
        }
        let truth = self.truth();
        let k = self.n_predictors;
        let factor = self.predictor_factor();
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut headers = vec![
            "country.name.en".to_string(),
            "iso3c".to_string(),
            "mean.population".to_string(),
            "mean.catch.nutrition.quality".to_string(),
        ];
        headers.extend(
            REFERENCE_PREDICTORS[..k]
                .iter()
                .map(|(column, _)| column.replace('_', ".")),
        );

        let total = self.n_rows + self.n_small_territories + self.n_missing_response;
        let mut rows = Vec::with_capacity(total);
        for i in 0..total {
            let z = Array1::from_shape_fn(k, |_| rng.sample::<f64, _>(StandardNormal));
            let x = factor.dot(&z);
            let mean = (truth.intercept + x.dot(&truth.beta)).exp();
            if !(mean.is_finite() && mean > 0.0) {
                return Err(SyntheticError::InvalidMean { row: i, mean });
            }
            let response = Gamma::new(truth.shape, mean / truth.shape)
                .map_err(|_| SyntheticError::InvalidShape(truth.shape))?
                .sample(&mut rng);

            let small = i >= self.n_rows && i < self.n_rows + self.n_small_territories;
            let no_response = i >= self.n_rows + self.n_small_territories;
            let population = if small {
                rng.gen_range(10.0..900.0)
            } else {
                rng.gen_range(1.0e4..1.0e8)
            };

            let mut row = vec![
                format!("Country {:03}", i),
                iso3_code(i),
                format!("{:.1}", population),
                if no_response {
                    MISSING.to_string()
                } else {
                    response.to_string()
                },
            ];
            for value in x.iter() {
                if rng.r#gen::<f64>() < self.missing_fraction {
                    row.push(MISSING.to_string());
                } else {
                    row.push(value.to_string());
                }
            }
            rows.push(row);
        }

        log::debug!(
            "Generated synthetic table: {} rows, {} predictors, missing fraction {}.",
            total,
            k,
            self.missing_fraction
        );
        Ok((SourceTable::new(headers, rows), truth))
    }
}

/// Three-letter code unique for the first 26³ rows.
fn iso3_code(i: usize) -> String {
    let letter = |n: usize| char::from(b'A' + (n % 26) as u8);
    [letter(i / 676), letter(i / 26), letter(i)].iter().collect()
}
