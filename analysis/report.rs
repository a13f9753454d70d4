//! # Run Outputs
//!
//! Every artefact of a run is rendered in memory first and only then written,
//! each file through a sibling temporary that is renamed into place. A failure
//! while rendering leaves the output directory untouched.

use crate::config::{AnalysisConfig, OutputConfig};
use crate::plots::{Choropleth, ForestPlot, QuantileScatter};
use crate::scoring::QuantileTable;
use crate::summary::{CoefficientSummary, ParameterSummary};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to render a CSV table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to render TOML output: {0}")]
    Toml(#[from] toml::ser::Error),
}

/// Row accounting of the input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub source: usize,
    pub dropped_small: usize,
    pub dropped_missing_response: usize,
    pub analysed: usize,
}

/// Sampler behaviour over the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerStats {
    pub n_chains: usize,
    pub n_draws: usize,
    /// Mean R-hat over all parameters as reported by the sampler, if it
    /// reported one.
    pub engine_rhat: Option<f64>,
    pub engine_ess: Option<f64>,
}

/// Everything needed to trace a run back to its inputs and judge it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub missing_cells: usize,
    /// Predictors whose R-hat exceeded the threshold.
    pub unconverged: Vec<String>,
    pub missing_correlation: Option<f64>,
    pub rows: RowCounts,
    pub sampler: SamplerStats,
    pub intercept: ParameterSummary,
    pub shape: ParameterSummary,
    pub config: AnalysisConfig,
}

/// Borrowed view of a finished run.
pub struct Report<'a> {
    pub coefficients: &'a CoefficientSummary,
    pub quantiles: &'a QuantileTable,
    pub forest: &'a ForestPlot,
    pub map: &'a Choropleth,
    pub scatter: &'a QuantileScatter,
    pub manifest: &'a RunManifest,
}

impl Report<'_> {
    /// Renders every output file as `(suffix, contents)`.
    fn render(&self) -> Result<Vec<(&'static str, Vec<u8>)>, ReportError> {
        Ok(vec![
            ("coefficients.csv", csv_bytes(self.coefficients.rows())?),
            ("quantiles.csv", csv_bytes(&self.quantiles.rows)?),
            ("forest.toml", toml::to_string_pretty(self.forest)?.into_bytes()),
            ("map.toml", toml::to_string_pretty(self.map)?.into_bytes()),
            ("scatter.toml", toml::to_string_pretty(self.scatter)?.into_bytes()),
            ("manifest.toml", toml::to_string_pretty(self.manifest)?.into_bytes()),
        ])
    }

    /// Writes all outputs into `output.directory`, returning their paths.
    pub fn write(&self, output: &OutputConfig) -> Result<Vec<PathBuf>, ReportError> {
        let rendered = self.render()?;
        fs::create_dir_all(&output.directory).map_err(|source| ReportError::Io {
            path: output.directory.clone(),
            source,
        })?;

        let mut written = Vec::with_capacity(rendered.len());
        for (suffix, contents) in rendered {
            let path = output.directory.join(format!("{}_{}", output.prefix, suffix));
            write_replacing(&path, &contents)?;
            log::info!("Wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn csv_bytes<T: Serialize>(rows: &[T]) -> Result<Vec<u8>, ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    writer
        .into_inner()
        .map_err(|e| ReportError::Csv(csv::Error::from(e.into_error())))
}

/// Writes to a temporary next to `dest`, then renames it over `dest`.
fn write_replacing(dest: &Path, contents: &[u8]) -> Result<(), ReportError> {
    let file_name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = dest.with_file_name(format!(".{}.tmp", file_name));
    let io_err = |source| ReportError::Io {
        path: dest.to_path_buf(),
        source,
    };

    let file = File::create(&temp_path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(contents).map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    drop(writer);
    fs::rename(&temp_path, dest).map_err(io_err)
}
