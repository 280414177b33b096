//! # Error Taxonomy
//!
//! Every stage of the validation pipeline reports failure through `ValidationError`.
//! Errors are deterministic given the same data, so none of them is retried; each
//! variant carries the name of the metric, covariate, or column that triggered it so
//! the caller knows which part of the input to fix.

use crate::faer_ndarray::FaerLinalgError;
use thiserror::Error;

/// Input tables do not match the declared metric/covariate schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error(
        "The required column '{column}' was not found in the {population} table. Please check spelling and case."
    )]
    MissingColumn { column: String, population: String },

    #[error(
        "Missing values were found in column '{column}' of the {population} table (row {row}). Complete data is required."
    )]
    MissingValue {
        column: String,
        population: String,
        row: usize,
    },

    #[error(
        "Non-finite values (NaN or Infinity) were found in column '{column}' of the {population} table (row {row})."
    )]
    NonFiniteValue {
        column: String,
        population: String,
        row: usize,
    },

    #[error(
        "Column '{column}' of the {population} table could not be read as {expected}. (Found type: {found})"
    )]
    WrongType {
        column: String,
        population: String,
        expected: &'static str,
        found: String,
    },

    #[error(
        "Column '{column}' of the {population} table has {found} rows, but the table has {expected} subjects."
    )]
    LengthMismatch {
        column: String,
        population: String,
        found: usize,
        expected: usize,
    },

    #[error("The {population} table contains no subjects.")]
    EmptyPopulation { population: String },

    #[error("The schema declares no metrics.")]
    NoMetrics,

    #[error("Name '{0}' is declared more than once in the schema.")]
    DuplicateName(String),
}

/// Failures raised by the statistical stages of the pipeline.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Schema validation failed: {0}")]
    Schema(#[from] SchemaError),

    #[error("The confound model for metric '{metric}' could not be fit: {reason}")]
    ModelFit { metric: String, reason: String },

    #[error(
        "Column '{column}' has a degenerate scale (standard deviation {sd:.3e} in the {population} population); it cannot be used as a denominator."
    )]
    DegenerateScale {
        column: String,
        population: String,
        sd: f64,
    },

    #[error(
        "Metric '{metric}' has {found} test-retest pairs, but at least {required} are needed for {statistic}."
    )]
    InsufficientData {
        metric: String,
        statistic: &'static str,
        found: usize,
        required: usize,
    },

    #[error(
        "The covariance matrix of compensated metrics is singular ({reason}). Metrics involved: {metrics:?}"
    )]
    SingularCovariance { metrics: Vec<String>, reason: String },

    #[error(
        "Factor extraction did not converge within {max_iterations} iterations. Last communality change was {last_change:.6e}."
    )]
    NonConvergence {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Stage '{stage}' requires stage '{requires}' to have run first.")]
    StageOrder {
        stage: &'static str,
        requires: &'static str,
    },

    #[error("A linear algebra routine failed: {0}")]
    Linalg(#[from] FaerLinalgError),
}

impl ValidationError {
    pub(crate) fn model_fit(metric: &str, reason: impl Into<String>) -> Self {
        ValidationError::ModelFit {
            metric: metric.to_string(),
            reason: reason.into(),
        }
    }
}
