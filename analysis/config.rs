//! # Analysis Configuration
//!
//! Every tunable of a run lives in one `AnalysisConfig`, serialised to and from
//! TOML in the same human-readable way trained artefacts are. Defaults reproduce
//! the reference catch-quality analysis, so an empty file is a valid config and a
//! partial file only overrides what it names.

use crate::hmc::NutsConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The reference predictors, in definition order, paired with their display labels.
pub const REFERENCE_PREDICTORS: [(&str, &str); 10] = [
    ("mean_wage_gap_all_sectors", "Gender wealth gap"),
    ("female_particip_ssf", "Women in fisheries"),
    ("mean_women_parl_perc", "Women in leadership"),
    ("sat_model_est_pov", "Poverty"),
    ("mean_educ", "Education"),
    ("cultural_hegemony", "Cultural hegemony"),
    ("language_diversity", "Language diversity"),
    ("prop_pop_l1_inst", "Institutional language"),
    ("age_dep_ratio_sat_mean", "Age dependency"),
    ("mean_voice_account", "Voice accountability"),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("At least one predictor column must be configured.")]
    NoPredictors,
    #[error("Predictor column '{0}' is listed more than once.")]
    DuplicatePredictor(String),
    #[error("Configuration value '{field}' must be {requirement}, got {value}.")]
    InvalidValue {
        field: &'static str,
        requirement: &'static str,
        value: String,
    },
}

/// One predictor column and the label used for it in tables and plots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorSpec {
    pub column: String,
    pub label: String,
}

/// Column names and filtering rules for the source table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub population_column: String,
    /// Rows with population strictly below this are dropped as small territories.
    pub population_threshold: f64,
    pub response_column: String,
    pub country_column: String,
    pub iso3_column: String,
    /// Column-name separator replaced before any lookup.
    pub separator_from: String,
    pub separator_to: String,
    /// Cell contents treated as missing.
    pub missing_tokens: Vec<String>,
    pub predictors: Vec<PredictorSpec>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            population_column: "mean_population".to_string(),
            population_threshold: 1000.0,
            response_column: "mean_catch_nutrition_quality".to_string(),
            country_column: "country_name_en".to_string(),
            iso3_column: "iso3c".to_string(),
            separator_from: ".".to_string(),
            separator_to: "_".to_string(),
            missing_tokens: ["", "NA", "NaN", "nan", "N/A", "NULL", "null", "#N/A", "<NA>", "n/a", "None"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            predictors: REFERENCE_PREDICTORS
                .iter()
                .map(|(column, label)| PredictorSpec {
                    column: column.to_string(),
                    label: label.to_string(),
                })
                .collect(),
        }
    }
}

impl DataConfig {
    pub fn predictor_columns(&self) -> Vec<String> {
        self.predictors.iter().map(|p| p.column.clone()).collect()
    }

    pub fn predictor_labels(&self) -> Vec<String> {
        self.predictors.iter().map(|p| p.label.clone()).collect()
    }
}

/// Prior hyperparameters of the joint model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPriors {
    /// Normal(0, sd) on the intercept and every coefficient.
    pub coefficient_prior_sd: f64,
    /// Normal(0, sd) on each component of the predictor mean.
    pub predictor_mean_prior_sd: f64,
    /// HalfCauchy(scale) on the Gamma shape.
    pub dispersion_prior_scale: f64,
    /// Exponential(rate) on each predictor standard deviation.
    pub predictor_sd_prior_rate: f64,
    /// LKJ concentration on the predictor correlation matrix.
    pub lkj_eta: f64,
}

impl Default for ModelPriors {
    fn default() -> Self {
        Self {
            coefficient_prior_sd: 100.0,
            predictor_mean_prior_sd: 100.0,
            dispersion_prior_scale: 5.0,
            predictor_sd_prior_rate: 1.0,
            lkj_eta: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// R-hat values above this are reported as non-converged.
    pub rhat_threshold: f64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rhat_threshold: 1.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    /// File-name prefix shared by every output of a run.
    pub prefix: String,
    /// Title of the map and scatter plots.
    pub title: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plots"),
            prefix: "catch_quality".to_string(),
            title: "Catch quality".to_string(),
        }
    }
}

/// The complete description of one analysis run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub data: DataConfig,
    pub model: ModelPriors,
    pub sampler: NutsConfig,
    pub diagnostics: DiagnosticsConfig,
    pub output: OutputConfig,
}

impl AnalysisConfig {
    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.predictors.is_empty() {
            return Err(ConfigError::NoPredictors);
        }
        let mut seen = HashSet::new();
        for predictor in &self.data.predictors {
            if !seen.insert(predictor.column.as_str()) {
                return Err(ConfigError::DuplicatePredictor(predictor.column.clone()));
            }
        }

        let positive = [
            ("model.coefficient_prior_sd", self.model.coefficient_prior_sd),
            ("model.predictor_mean_prior_sd", self.model.predictor_mean_prior_sd),
            ("model.dispersion_prior_scale", self.model.dispersion_prior_scale),
            ("model.predictor_sd_prior_rate", self.model.predictor_sd_prior_rate),
            ("model.lkj_eta", self.model.lkj_eta),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field,
                    requirement: "a positive finite number",
                    value: value.to_string(),
                });
            }
        }

        let sampler = &self.sampler;
        if sampler.n_chains < 2 {
            return Err(ConfigError::InvalidValue {
                field: "sampler.n_chains",
                requirement: "at least 2",
                value: sampler.n_chains.to_string(),
            });
        }
        if sampler.n_samples == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sampler.n_samples",
                requirement: "at least 1",
                value: sampler.n_samples.to_string(),
            });
        }
        if !(sampler.target_accept > 0.0 && sampler.target_accept < 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "sampler.target_accept",
                requirement: "strictly between 0 and 1",
                value: sampler.target_accept.to_string(),
            });
        }
        if !(sampler.init_jitter.is_finite() && sampler.init_jitter >= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "sampler.init_jitter",
                requirement: "a non-negative finite number",
                value: sampler.init_jitter.to_string(),
            });
        }
        if !(self.diagnostics.rhat_threshold.is_finite() && self.diagnostics.rhat_threshold >= 1.0)
        {
            return Err(ConfigError::InvalidValue {
                field: "diagnostics.rhat_threshold",
                requirement: "a finite number of at least 1.0",
                value: self.diagnostics.rhat_threshold.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_reference_analysis() {
        let config = AnalysisConfig::default();
        config.validate().unwrap();
        assert_eq!(config.data.predictors.len(), 10);
        assert_eq!(config.data.predictors[0].label, "Gender wealth gap");
        assert_eq!(config.data.predictors[9].column, "mean_voice_account");
        assert_eq!(config.sampler.n_samples, 3000);
        assert_eq!(config.sampler.n_warmup, 1000);
        assert_eq!(config.sampler.n_chains, 2);
        assert_eq!(config.model.lkj_eta, 2.0);
        assert_eq!(config.data.population_threshold, 1000.0);
    }

    #[test]
    fn toml_round_trip_preserves_everything() {
        let config = AnalysisConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed = AnalysisConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.data.predictors, config.data.predictors);
        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.sampler.seed, config.sampler.seed);
        assert_eq!(parsed.output.prefix, config.output.prefix);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let text = r#"
            [sampler]
            n_samples = 200
            seed = 7

            [output]
            prefix = "trial"
        "#;
        let config = AnalysisConfig::from_toml_str(text).unwrap();
        assert_eq!(config.sampler.n_samples, 200);
        assert_eq!(config.sampler.seed, 7);
        assert_eq!(config.sampler.n_warmup, 1000);
        assert_eq!(config.output.prefix, "trial");
        assert_eq!(config.data.predictors.len(), 10);
    }

    #[test]
    fn duplicate_predictors_are_rejected() {
        let text = r#"
            [[data.predictors]]
            column = "a"
            label = "A"

            [[data.predictors]]
            column = "a"
            label = "Again"
        "#;
        match AnalysisConfig::from_toml_str(text) {
            Err(ConfigError::DuplicatePredictor(col)) => assert_eq!(col, "a"),
            other => panic!("Expected DuplicatePredictor, got {:?}", other),
        }
    }

    #[test]
    fn invalid_target_accept_is_rejected() {
        let text = "[sampler]\ntarget_accept = 1.5\n";
        match AnalysisConfig::from_toml_str(text) {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "sampler.target_accept")
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn single_chain_is_rejected() {
        let mut config = AnalysisConfig::default();
        config.sampler.n_chains = 1;
        match config.validate() {
            Err(ConfigError::InvalidValue { field, requirement, value }) => {
                assert_eq!(field, "sampler.n_chains");
                assert_eq!(requirement, "at least 2");
                assert_eq!(value, "1");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
        config.sampler.n_chains = 2;
        config.validate().unwrap();
    }
}
