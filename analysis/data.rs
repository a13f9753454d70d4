//! # Data Loading and Preparation
//!
//! This module is the entry point for the national indicators table. It reads
//! the CSV, validates it against the configured schema, and turns it into the
//! response vector and design matrix the model consumes.
//!
//! - Column names are normalised (`.` → `_` by default) before any lookup.
//! - Small territories below the population threshold are dropped, then rows
//!   with a missing response. A missing population never passes the threshold.
//! - The response is rescaled by its maximum, so the largest value is exactly 1.
//! - Predictor cells may be missing independently; they become latent cells of
//!   the [`DesignMatrix`] instead of being imputed here.

use crate::config::DataConfig;
use crate::design::DesignMatrix;
use ndarray::{Array1, Array2};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the CSV reader: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Two input columns both normalise to the name '{0}'.")]
    DuplicateColumn(String),
    #[error(
        "The column '{column_name}' must be numeric, but row {row} contains '{value}'."
    )]
    ColumnWrongType {
        column_name: String,
        row: usize,
        value: String,
    },
    #[error("Non-finite value found in column '{column_name}' at row {row}.")]
    NonFiniteValuesFound { column_name: String, row: usize },
    #[error(
        "No rows remain after dropping populations below {population_threshold} and rows without a response."
    )]
    NoRowsAfterFiltering { population_threshold: f64 },
    #[error(
        "The response must be strictly positive for the Gamma likelihood, but row {row} has {value}."
    )]
    NonPositiveResponse { row: usize, value: f64 },
}

/// The raw input table: a header row and string cells.
#[derive(Debug, Clone)]
pub struct SourceTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl SourceTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn from_path(path: &Path) -> Result<Self, DataError> {
        log::info!("Loading data from '{}'", path.display());
        Self::from_reader(File::open(path)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DataError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = csv_reader
            .headers()?
            .iter()
            .map(|h| h.to_string())
            .collect();
        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            rows.push(record.iter().map(|v| v.to_string()).collect());
        }
        Ok(Self { headers, rows })
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), DataError> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(&self.headers)?;
        for row in &self.rows {
            csv_writer.write_record(row)?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Maps normalised column names to every position that carries them.
    fn normalized_index(&self, from: &str, to: &str) -> HashMap<String, Vec<usize>> {
        let mut index: HashMap<String, Vec<usize>> = HashMap::with_capacity(self.headers.len());
        for (pos, header) in self.headers.iter().enumerate() {
            index
                .entry(normalize_column_name(header, from, to))
                .or_default()
                .push(pos);
        }
        index
    }

    fn cell(&self, row: usize, col: usize) -> &str {
        self.rows[row].get(col).map(String::as_str).unwrap_or("")
    }
}

pub fn normalize_column_name(name: &str, from: &str, to: &str) -> String {
    if from.is_empty() {
        name.to_string()
    } else {
        name.replace(from, to)
    }
}

/// Validated data ready for model fitting.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub countries: Vec<String>,
    pub iso3: Vec<String>,
    /// Response divided by its maximum; every value is in (0, 1].
    pub response: Array1<f64>,
    /// The maximum raw response the values were divided by.
    pub response_scale: f64,
    pub design: DesignMatrix,
    pub labels: Vec<String>,
    /// Rows in the source table before any filtering.
    pub source_rows: usize,
    /// Rows dropped by the population threshold.
    pub dropped_small: usize,
    /// Rows dropped for a missing response.
    pub dropped_missing_response: usize,
}

impl PreparedData {
    pub fn n_rows(&self) -> usize {
        self.response.len()
    }

    /// Returns a copy with predictor columns reordered by `order`.
    pub fn with_column_order(&self, order: &[usize]) -> Self {
        let mut permuted = self.clone();
        permuted.design = self.design.select_columns(order);
        permuted.labels = order.iter().map(|&c| self.labels[c].clone()).collect();
        permuted
    }
}

/// Runs the full preparation contract on a source table.
pub fn prepare_data(table: &SourceTable, config: &DataConfig) -> Result<PreparedData, DataError> {
    let index = table.normalized_index(&config.separator_from, &config.separator_to);
    // Collisions only matter for columns the analysis reads.
    let lookup = |name: &str| -> Result<usize, DataError> {
        match index.get(name).map(Vec::as_slice) {
            None | Some([]) => Err(DataError::ColumnNotFound(name.to_string())),
            Some([pos]) => Ok(*pos),
            Some(_) => Err(DataError::DuplicateColumn(name.to_string())),
        }
    };

    let population_col = lookup(&config.population_column)?;
    let response_col = lookup(&config.response_column)?;
    let country_col = lookup(&config.country_column)?;
    let iso3_col = lookup(&config.iso3_column)?;
    let predictor_cols = config
        .predictors
        .iter()
        .map(|p| lookup(&p.column))
        .collect::<Result<Vec<_>, _>>()?;

    log::info!(
        "All required columns found ({} predictors).",
        predictor_cols.len()
    );

    let parse = |row: usize, col: usize, name: &str| {
        parse_numeric(table.cell(row, col), name, row + 1, &config.missing_tokens)
    };

    let mut kept_rows = Vec::new();
    let mut raw_response = Vec::new();
    let mut dropped_small = 0;
    let mut dropped_missing_response = 0;
    for row in 0..table.n_rows() {
        let population = parse(row, population_col, &config.population_column)?;
        if !population.is_some_and(|p| p >= config.population_threshold) {
            dropped_small += 1;
            continue;
        }
        match parse(row, response_col, &config.response_column)? {
            Some(value) => {
                kept_rows.push(row);
                raw_response.push(value);
            }
            None => dropped_missing_response += 1,
        }
    }

    log::info!(
        "Kept {} of {} rows ({} below population threshold, {} without a response).",
        kept_rows.len(),
        table.n_rows(),
        dropped_small,
        dropped_missing_response
    );

    if kept_rows.is_empty() {
        return Err(DataError::NoRowsAfterFiltering {
            population_threshold: config.population_threshold,
        });
    }

    let response_scale = raw_response
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    for (&row, &value) in kept_rows.iter().zip(&raw_response) {
        if value <= 0.0 {
            return Err(DataError::NonPositiveResponse {
                row: row + 1,
                value,
            });
        }
    }
    let response = Array1::from_iter(raw_response.iter().map(|v| v / response_scale));

    let mut values = Array2::from_elem((kept_rows.len(), predictor_cols.len()), None);
    for (i, &row) in kept_rows.iter().enumerate() {
        for (j, (&col, spec)) in predictor_cols.iter().zip(&config.predictors).enumerate() {
            values[[i, j]] = parse(row, col, &spec.column)?;
        }
    }
    let design = DesignMatrix::from_options(values, config.predictor_columns());

    for (name, observed) in design.column_names().iter().zip(design.observed_per_column()) {
        if observed == 0 {
            log::warn!(
                "Predictor '{}' has no observed values after filtering; it is imputed from the prior alone.",
                name
            );
        }
    }
    log::info!(
        "Design matrix: {} rows x {} predictors, {} missing cells.",
        design.nrows(),
        design.ncols(),
        design.n_latent()
    );

    Ok(PreparedData {
        countries: kept_rows
            .iter()
            .map(|&r| table.cell(r, country_col).to_string())
            .collect(),
        iso3: kept_rows
            .iter()
            .map(|&r| table.cell(r, iso3_col).to_string())
            .collect(),
        response,
        response_scale,
        design,
        labels: config.predictor_labels(),
        source_rows: table.n_rows(),
        dropped_small,
        dropped_missing_response,
    })
}

/// Parses one numeric cell. Missing tokens and NaN read as `None`.
fn parse_numeric(
    raw: &str,
    column_name: &str,
    row: usize,
    missing_tokens: &[String],
) -> Result<Option<f64>, DataError> {
    let trimmed = raw.trim();
    if missing_tokens.iter().any(|t| t == trimmed) {
        return Ok(None);
    }
    let value: f64 = trimmed.parse().map_err(|_| DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        row,
        value: trimmed.to_string(),
    })?;
    if value.is_nan() {
        return Ok(None);
    }
    if !value.is_finite() {
        return Err(DataError::NonFiniteValuesFound {
            column_name: column_name.to_string(),
            row,
        });
    }
    Ok(Some(value))
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PredictorSpec;
    use approx::assert_abs_diff_eq;

    fn small_config() -> DataConfig {
        DataConfig {
            predictors: vec![
                PredictorSpec {
                    column: "mean_educ".into(),
                    label: "Education".into(),
                },
                PredictorSpec {
                    column: "mean_voice_account".into(),
                    label: "Voice accountability".into(),
                },
            ],
            ..DataConfig::default()
        }
    }

    const HEADER: &str = "country.name.en,iso3c,mean.population,mean.catch.nutrition.quality,mean.educ,mean.voice.account";

    fn table(rows: &[&str]) -> SourceTable {
        let mut content = String::from(HEADER);
        for row in rows {
            content.push('\n');
            content.push_str(row);
        }
        SourceTable::from_reader(content.as_bytes()).unwrap()
    }

    #[test]
    fn prepares_filters_and_scales() {
        let table = table(&[
            "Aland,ALA,500,40,1.0,2.0",
            "Brazil,BRA,200000,20,3.5,NA",
            "Chile,CHL,18000,,4.0,1.0",
            "Denmark,DNK,5800,80,,0.5",
            "Eritrea,ERI,3500,10,2.0,-1.0",
        ]);
        let prepared = prepare_data(&table, &small_config()).unwrap();

        assert_eq!(prepared.countries, vec!["Brazil", "Denmark", "Eritrea"]);
        assert_eq!(prepared.iso3, vec!["BRA", "DNK", "ERI"]);
        assert_eq!(prepared.dropped_small, 1);
        assert_eq!(prepared.dropped_missing_response, 1);
        assert_abs_diff_eq!(prepared.response_scale, 80.0);
        assert_abs_diff_eq!(prepared.response[0], 0.25);
        assert_abs_diff_eq!(prepared.response[1], 1.0);
        assert_abs_diff_eq!(prepared.response[2], 0.125);
        assert!(prepared.response.iter().all(|&y| y > 0.0 && y <= 1.0));

        let mask = prepared.design.mask();
        assert_eq!(mask.dim(), (3, 2));
        assert!(!mask[[0, 0]] && mask[[0, 1]]);
        assert!(mask[[1, 0]] && !mask[[1, 1]]);
        assert!(!mask[[2, 0]] && !mask[[2, 1]]);
        assert_eq!(prepared.design.missing_per_row(), vec![1, 1, 0]);
    }

    #[test]
    fn missing_population_is_dropped() {
        let table = table(&["Atlantis,ATL,,50,1.0,1.0", "Brazil,BRA,2000,20,3.5,1.0"]);
        let prepared = prepare_data(&table, &small_config()).unwrap();
        assert_eq!(prepared.countries, vec!["Brazil"]);
        assert_eq!(prepared.dropped_small, 1);
    }

    #[test]
    fn population_threshold_is_inclusive() {
        let table = table(&["Edge,EDG,1000,5,1.0,1.0"]);
        let prepared = prepare_data(&table, &small_config()).unwrap();
        assert_eq!(prepared.n_rows(), 1);
        assert_abs_diff_eq!(prepared.response[0], 1.0);
    }

    #[test]
    fn error_column_not_found() {
        let mut config = small_config();
        config.predictors.push(PredictorSpec {
            column: "cultural_hegemony".into(),
            label: "Cultural hegemony".into(),
        });
        let table = table(&["Brazil,BRA,200000,20,3.5,1.0"]);
        match prepare_data(&table, &config) {
            Err(DataError::ColumnNotFound(col)) => assert_eq!(col, "cultural_hegemony"),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn error_no_rows_after_filtering() {
        let table = table(&["Aland,ALA,500,40,1.0,2.0", "Chile,CHL,18000,NA,4.0,1.0"]);
        match prepare_data(&table, &small_config()) {
            Err(DataError::NoRowsAfterFiltering {
                population_threshold,
            }) => assert_abs_diff_eq!(population_threshold, 1000.0),
            other => panic!("Expected NoRowsAfterFiltering, got {:?}", other),
        }
    }

    #[test]
    fn error_wrong_type() {
        let table = table(&["Brazil,BRA,200000,20,lots,1.0"]);
        match prepare_data(&table, &small_config()) {
            Err(DataError::ColumnWrongType {
                column_name,
                row,
                value,
            }) => {
                assert_eq!(column_name, "mean_educ");
                assert_eq!(row, 1);
                assert_eq!(value, "lots");
            }
            other => panic!("Expected ColumnWrongType, got {:?}", other),
        }
    }

    #[test]
    fn error_non_positive_response() {
        let table = table(&["Brazil,BRA,200000,20,1.0,1.0", "Chile,CHL,18000,0,4.0,1.0"]);
        match prepare_data(&table, &small_config()) {
            Err(DataError::NonPositiveResponse { row, value }) => {
                assert_eq!(row, 2);
                assert_abs_diff_eq!(value, 0.0);
            }
            other => panic!("Expected NonPositiveResponse, got {:?}", other),
        }
    }

    #[test]
    fn infinite_values_are_rejected() {
        let table = table(&["Brazil,BRA,200000,20,inf,1.0"]);
        assert!(matches!(
            prepare_data(&table, &small_config()),
            Err(DataError::NonFiniteValuesFound { .. })
        ));
    }

    #[test]
    fn duplicate_required_columns_are_rejected() {
        let content = format!("{HEADER},mean_educ\nBrazil,BRA,200000,20,3.5,1.0,3.6");
        let table = SourceTable::from_reader(content.as_bytes()).unwrap();
        match prepare_data(&table, &small_config()) {
            Err(DataError::DuplicateColumn(name)) => assert_eq!(name, "mean_educ"),
            other => panic!("Expected DuplicateColumn, got {:?}", other),
        }
    }

    #[test]
    fn unused_colliding_columns_are_ignored() {
        let content = format!("{HEADER},notes.x,notes_x\nBrazil,BRA,200000,20,3.5,1.0,a,b");
        let table = SourceTable::from_reader(content.as_bytes()).unwrap();
        let prepared = prepare_data(&table, &small_config()).unwrap();
        assert_eq!(prepared.n_rows(), 1);
        assert_eq!(prepared.design.ncols(), 2);
    }

    #[test]
    fn csv_round_trip_through_writer() {
        let original = table(&["Brazil,BRA,200000,20,3.5,NA"]);
        let mut buffer = Vec::new();
        original.write_csv(&mut buffer).unwrap();
        let reread = SourceTable::from_reader(buffer.as_slice()).unwrap();
        assert_eq!(reread.headers(), original.headers());
        assert_eq!(reread.n_rows(), 1);
    }
}
