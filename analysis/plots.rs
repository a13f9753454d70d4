//! Renderer-neutral plot specifications.
//!
//! Each spec fixes which table column drives which visual channel, the axis
//! limits and the static labels, and carries the data it needs. Drawing is left
//! to whatever consumes the TOML.

use crate::scoring::QuantileTable;
use crate::summary::CoefficientSummary;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

/// Output size in inches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FigureSize {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestRow {
    pub label: String,
    /// Posterior median.
    pub point: f64,
    /// 50% interval, drawn as the thick bar.
    pub thick: [f64; 2],
    /// 95% interval, drawn as the thin bar.
    pub thin: [f64; 2],
}

/// Coefficient forest plot: one row per predictor, top to bottom in display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestPlot {
    pub value_label: String,
    /// Vertical reference line.
    pub reference_line: f64,
    pub value_axis: AxisRange,
    pub size: FigureSize,
    pub rows: Vec<ForestRow>,
}

impl ForestPlot {
    /// The value axis spans the 95% intervals padded by a tenth of their range
    /// on each side.
    pub fn from_summary(summary: &CoefficientSummary) -> Self {
        let rows: Vec<ForestRow> = summary
            .rows()
            .iter()
            .map(|row| ForestRow {
                label: row.label.clone(),
                point: row.median,
                thick: [row.lower50, row.upper50],
                thin: [row.lower95, row.upper95],
            })
            .collect();
        let min = rows.iter().map(|r| r.thin[0]).fold(f64::INFINITY, f64::min);
        let max = rows.iter().map(|r| r.thin[1]).fold(f64::NEG_INFINITY, f64::max);
        let pad = (max - min) * 0.1;
        Self {
            value_label: "Estimate".to_string(),
            reference_line: 0.0,
            value_axis: AxisRange {
                min: min - pad,
                max: max + pad,
            },
            size: FigureSize {
                width: 3.0,
                height: 3.0,
            },
            rows,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoroplethRegion {
    pub iso3: String,
    pub country: String,
    pub quantile: f64,
}

/// World map with regions filled by their predictive quantile, keyed by ISO3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choropleth {
    pub title: String,
    pub fill_label: String,
    pub key: String,
    pub excluded_regions: Vec<String>,
    pub longitude: AxisRange,
    pub latitude: AxisRange,
    pub regions: Vec<ChoroplethRegion>,
}

impl Choropleth {
    pub const EXCLUDED: &'static str = "ATA";

    pub fn from_table(table: &QuantileTable, title: &str) -> Self {
        let regions = table
            .rows
            .iter()
            .filter(|row| row.iso3 != Self::EXCLUDED)
            .map(|row| ChoroplethRegion {
                iso3: row.iso3.clone(),
                country: row.country.clone(),
                quantile: row.quantile,
            })
            .collect();
        Self {
            title: title.to_string(),
            fill_label: "Quantile".to_string(),
            key: "iso3".to_string(),
            excluded_regions: vec![Self::EXCLUDED.to_string()],
            longitude: AxisRange {
                min: -180.0,
                max: 180.0,
            },
            latitude: AxisRange {
                min: -70.0,
                max: 90.0,
            },
            regions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterPoint {
    pub iso3: String,
    pub quantile: f64,
    pub n_missing: usize,
}

/// Quantile against number of missing predictors, to check that extreme
/// quantiles are not driven by imputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileScatter {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub y_breaks: Vec<usize>,
    pub y_axis: AxisRange,
    pub points: Vec<ScatterPoint>,
}

impl QuantileScatter {
    pub fn from_table(table: &QuantileTable, n_predictors: usize, title: &str) -> Self {
        Self {
            title: title.to_string(),
            x_label: "Quantile".to_string(),
            y_label: "Number of missing predictors".to_string(),
            y_breaks: (0..=n_predictors).step_by(2).collect(),
            y_axis: AxisRange {
                min: 0.0,
                max: n_predictors as f64,
            },
            points: table
                .rows
                .iter()
                .map(|row| ScatterPoint {
                    iso3: row.iso3.clone(),
                    quantile: row.quantile,
                    n_missing: row.n_missing,
                })
                .collect(),
        }
    }
}
