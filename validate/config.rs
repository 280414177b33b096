//! # Pipeline Configuration
//!
//! Every tunable of the validation pipeline lives in `PipelineConfig`, with its default
//! spelled out in `Default`. Configurations are validated once, when a `Pipeline` is
//! constructed, so a bad option fails before any statistics are computed.
//!
//! Configurations can be stored as TOML; missing keys fall back to their defaults.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Which subjects the per-metric confound model is fit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfoundFit {
    /// Fit on the reference population, apply to both. Compensated values then read as
    /// "deviation from a healthy subject with the same covariates".
    Reference,
    /// Fit on reference and impaired subjects together.
    Pooled,
}

/// Form of the two-way, single-measurement intraclass correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IccForm {
    /// ICC(C,1): systematic test/retest offsets are ignored.
    Consistency,
    /// ICC(A,1): systematic offsets count as disagreement.
    Agreement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AucOrientation {
    /// Probability that an impaired subject scores higher than a reference subject.
    Directional,
    /// `max(AUC, 1 - AUC)`, for metrics whose direction of impairment is unknown.
    TwoSided,
}

/// Comparator behind a validity-coefficient slot (C1 or C2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ComparatorSpec {
    /// Point-biserial correlation with impaired-group membership.
    KnownGroups,
    /// Correlation between test and retest administrations.
    TestRetest,
    /// Correlation with an external criterion column declared in the schema.
    External { column: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule", content = "k")]
pub enum FactorCount {
    Fixed(usize),
    /// Retain factors whose correlation-matrix eigenvalue exceeds 1.
    Kaiser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    None,
    Varimax,
}

/// Configuration options for `Pipeline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Population the confound model is fit on (default: reference).
    pub confound_fit: ConfoundFit,
    /// Fit fixed effects on stacked test and retest rows and estimate a subject random
    /// intercept (default: false).
    pub random_intercept: bool,
    /// Add the mean fitted value back onto residuals (default: false).
    pub retain_grand_mean: bool,
    pub icc_form: IccForm,
    pub auc_orientation: AucOrientation,
    /// Comparator for validity coefficient C1 (default: known groups).
    pub c1: ComparatorSpec,
    /// Comparator for validity coefficient C2 (default: test-retest).
    pub c2: ComparatorSpec,
    /// Fail scoring when a metric lacks retest pairs instead of leaving
    /// SRD/ICC/slope empty (default: true).
    pub require_retest: bool,
    /// Relative eigenvalue floor below which the metric correlation matrix is treated
    /// as singular (default: 1e-10).
    pub singular_tolerance: f64,
    pub factor_count: FactorCount,
    pub rotation: Rotation,
    /// Iteration budget for principal-axis factoring (default: 500).
    pub max_factor_iterations: usize,
    /// Convergence threshold on the largest communality change (default: 1e-6).
    pub factor_tolerance: f64,
    /// Percentile of the pooled compensated distribution used as the abnormality
    /// cutoff, in (0, 1) (default: 0.95).
    pub cutoff_percentile: f64,
    /// Run the per-metric stages on the rayon pool (default: true).
    pub parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confound_fit: ConfoundFit::Reference,
            random_intercept: false,
            retain_grand_mean: false,
            icc_form: IccForm::Consistency,
            auc_orientation: AucOrientation::Directional,
            c1: ComparatorSpec::KnownGroups,
            c2: ComparatorSpec::TestRetest,
            require_retest: true,
            singular_tolerance: 1e-10,
            factor_count: FactorCount::Fixed(1),
            rotation: Rotation::Varimax,
            max_factor_iterations: 500,
            factor_tolerance: 1e-6,
            cutoff_percentile: 0.95,
            parallel: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl PipelineConfig {
    /// Loads a configuration from a TOML file and validates it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects option values that no stage could honour.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.cutoff_percentile > 0.0 && self.cutoff_percentile < 1.0) {
            return Err(ValidationError::Config(format!(
                "cutoff_percentile must lie in (0, 1), got {}",
                self.cutoff_percentile
            )));
        }
        if !(self.singular_tolerance > 0.0 && self.singular_tolerance < 1.0) {
            return Err(ValidationError::Config(format!(
                "singular_tolerance must lie in (0, 1), got {}",
                self.singular_tolerance
            )));
        }
        if !(self.factor_tolerance > 0.0) {
            return Err(ValidationError::Config(format!(
                "factor_tolerance must be positive, got {}",
                self.factor_tolerance
            )));
        }
        if self.max_factor_iterations == 0 {
            return Err(ValidationError::Config(
                "max_factor_iterations must be at least 1".to_string(),
            ));
        }
        if let FactorCount::Fixed(0) = self.factor_count {
            return Err(ValidationError::Config(
                "factor_count must request at least one factor".to_string(),
            ));
        }
        for (slot, spec) in [("c1", &self.c1), ("c2", &self.c2)] {
            if let ComparatorSpec::External { column } = spec {
                if column.trim().is_empty() {
                    return Err(ValidationError::Config(format!(
                        "{slot} names an external criterion with an empty column name"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_percentile_rejected() {
        let config = PipelineConfig {
            cutoff_percentile: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ValidationError::Config(_))));
    }

    #[test]
    fn zero_factor_count_rejected() {
        let config = PipelineConfig {
            factor_count: FactorCount::Fixed(0),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ValidationError::Config(_))));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "confound_fit = \"pooled\"\nicc_form = \"agreement\"\ncutoff_percentile = 0.9\n\n[factor_count]\nrule = \"fixed\"\nk = 2\n\n[c1]\nkind = \"external\"\ncolumn = \"fugl_meyer\""
        )
        .unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();

        assert_eq!(config.confound_fit, ConfoundFit::Pooled);
        assert_eq!(config.icc_form, IccForm::Agreement);
        assert_eq!(config.factor_count, FactorCount::Fixed(2));
        assert_eq!(
            config.c1,
            ComparatorSpec::External {
                column: "fugl_meyer".to_string()
            }
        );
        assert_eq!(config.c2, ComparatorSpec::TestRetest);
        assert!(!config.random_intercept);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = PipelineConfig {
            factor_count: FactorCount::Kaiser,
            rotation: Rotation::None,
            ..PipelineConfig::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
