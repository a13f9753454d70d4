//! # Analysis Pipeline
//!
//! Runs one analysis end to end: prepare the table, sample the joint posterior,
//! summarise the coefficients, score every observation, build the plot specs,
//! and write the outputs. Nothing touches the output directory until every
//! stage before it has succeeded.

use crate::config::{AnalysisConfig, ConfigError};
use crate::data::{DataError, PreparedData, SourceTable, prepare_data};
use crate::hmc::{NutsResult, SamplingError, run_nuts_sampling};
use crate::model::{JointPosterior, PosteriorDraws};
use crate::plots::{Choropleth, ForestPlot, QuantileScatter};
use crate::report::{Report, ReportError, RowCounts, RunManifest, SamplerStats};
use crate::scoring::{PointEstimates, QuantileTable, ScoringError, score_observations};
use crate::summary::{CoefficientSummary, ParameterSummary, SummaryError};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// In-memory results of a completed analysis.
pub struct AnalysisOutputs {
    pub prepared: PreparedData,
    pub draws: PosteriorDraws,
    pub coefficients: CoefficientSummary,
    pub estimates: PointEstimates,
    pub quantiles: QuantileTable,
    pub forest: ForestPlot,
    pub map: Choropleth,
    pub scatter: QuantileScatter,
    pub manifest: RunManifest,
}

impl AnalysisOutputs {
    pub fn report(&self) -> Report<'_> {
        Report {
            coefficients: &self.coefficients,
            quantiles: &self.quantiles,
            forest: &self.forest,
            map: &self.map,
            scatter: &self.scatter,
            manifest: &self.manifest,
        }
    }
}

fn sampler_stats(result: &NutsResult) -> SamplerStats {
    SamplerStats {
        n_chains: result.n_chains(),
        n_draws: result.n_draws(),
        engine_rhat: result.engine_rhat,
        engine_ess: result.engine_ess,
    }
}

/// Fits the model and scores the observations without writing anything.
pub fn analyze(
    table: &SourceTable,
    config: &AnalysisConfig,
    abort: Option<&AtomicBool>,
) -> Result<AnalysisOutputs, AnalysisError> {
    config.validate()?;
    let prepared = prepare_data(table, &config.data)?;

    let posterior = JointPosterior::from_prepared(&prepared, config.model);
    let sampler = &config.sampler;
    log::info!(
        "Joint posterior has {} parameters ({} latent cells).",
        posterior.layout().dim(),
        posterior.layout().n_latent()
    );
    let whitening = posterior.whitening();
    let initial = posterior.initial_positions(sampler.n_chains, sampler.init_jitter, sampler.seed);
    let result = run_nuts_sampling(&posterior, &whitening, &initial, sampler, abort)?;
    let stats = sampler_stats(&result);
    let draws = posterior.constrain(&result);
    drop(result);

    let predictors = prepared.design.column_names().to_vec();
    let coefficients = CoefficientSummary::from_draws(&draws, &predictors, &prepared.labels)?;
    let unconverged: Vec<String> = coefficients
        .unconverged(config.diagnostics.rhat_threshold)
        .into_iter()
        .map(|row| row.predictor.clone())
        .collect();
    let intercept = ParameterSummary::from_draws(draws.intercept.view())?;
    let shape = ParameterSummary::from_draws(draws.shape.view())?;
    log::info!(
        "Intercept median {:.3}, Gamma shape median {:.3}.",
        intercept.median,
        shape.median
    );

    let estimates = PointEstimates::from_draws(&draws);
    let quantiles = score_observations(&prepared, &estimates)?;

    let forest = ForestPlot::from_summary(&coefficients);
    let map = Choropleth::from_table(&quantiles, &config.output.title);
    let scatter = QuantileScatter::from_table(&quantiles, prepared.design.ncols(), &config.output.title);

    let manifest = RunManifest {
        missing_cells: prepared.design.n_latent(),
        unconverged,
        missing_correlation: quantiles.missing_correlation,
        rows: RowCounts {
            source: prepared.source_rows,
            dropped_small: prepared.dropped_small,
            dropped_missing_response: prepared.dropped_missing_response,
            analysed: prepared.n_rows(),
        },
        sampler: stats,
        intercept,
        shape,
        config: config.clone(),
    };

    Ok(AnalysisOutputs {
        prepared,
        draws,
        coefficients,
        estimates,
        quantiles,
        forest,
        map,
        scatter,
        manifest,
    })
}

/// Runs the analysis and writes its outputs.
pub fn run_analysis(
    table: &SourceTable,
    config: &AnalysisConfig,
    abort: Option<&AtomicBool>,
) -> Result<(AnalysisOutputs, Vec<PathBuf>), AnalysisError> {
    let outputs = analyze(table, config, abort)?;
    let written = outputs.report().write(&config.output)?;
    Ok((outputs, written))
}

/// Loads a CSV file and runs the analysis on it.
pub fn run_from_path(
    path: &Path,
    config: &AnalysisConfig,
    abort: Option<&AtomicBool>,
) -> Result<(AnalysisOutputs, Vec<PathBuf>), AnalysisError> {
    let table = SourceTable::from_path(path)?;
    run_analysis(&table, config, abort)
}
