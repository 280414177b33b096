//! # Subject Tables and Data Loading
//!
//! This module owns the in-memory data model consumed by every pipeline stage and
//! the one entry point for user-provided tables. Tables are tab-separated files with
//! a header row, one row per subject, read through the `polars` CSV reader and
//! validated against a `Schema` before any statistics are computed.
//!
//! - Strict Schema: every declared metric, covariate, and criterion column must be
//!   present and complete. A missing column is reported by name; nothing is imputed.
//! - Retest columns are optional. For metric `m` the loader looks for `m_retest`;
//!   subjects without a retest measurement carry `NaN` in that column, which is the
//!   only place a non-finite value is accepted.

use crate::error::{SchemaError, ValidationError};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Suffix appended to a metric name to locate its retest column.
pub const RETEST_SUFFIX: &str = "_retest";
/// Suffix appended to a metric (or retest) name for its confound-compensated column.
pub const COMPENSATED_SUFFIX: &str = "_compensated";

/// Population a subject belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    /// Healthy subjects that anchor "normal" variability.
    Reference,
    Impaired,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Reference => write!(f, "reference"),
            Group::Impaired => write!(f, "impaired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CovariateKind {
    Continuous,
    Categorical,
}

/// A covariate ("effect") whose influence is removed from every metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovariateSpec {
    pub name: String,
    pub kind: CovariateKind,
}

impl CovariateSpec {
    pub fn continuous(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: CovariateKind::Continuous,
        }
    }

    pub fn categorical(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: CovariateKind::Categorical,
        }
    }
}

/// The declared metric/covariate layout shared by both population tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub metrics: Vec<String>,
    pub covariates: Vec<CovariateSpec>,
    /// External validity criteria (e.g. a clinical scale score), one value per subject.
    #[serde(default)]
    pub criteria: Vec<String>,
}

impl Schema {
    pub fn new(
        metrics: Vec<String>,
        covariates: Vec<CovariateSpec>,
        criteria: Vec<String>,
    ) -> Result<Self, SchemaError> {
        let schema = Self {
            metrics,
            covariates,
            criteria,
        };
        schema.check_names()?;
        Ok(schema)
    }

    fn check_names(&self) -> Result<(), SchemaError> {
        if self.metrics.is_empty() {
            return Err(SchemaError::NoMetrics);
        }
        let mut seen = HashSet::new();
        let names = self
            .metrics
            .iter()
            .chain(self.covariates.iter().map(|c| &c.name))
            .chain(self.criteria.iter());
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(SchemaError::DuplicateName(name.clone()));
            }
        }
        Ok(())
    }

    /// Checks that an in-memory population carries every declared column with
    /// complete, finite data of the declared kind.
    pub fn validate(&self, population: &Population) -> Result<(), SchemaError> {
        self.check_names()?;
        let label = population.group.to_string();
        let n = population.len();
        if n == 0 {
            return Err(SchemaError::EmptyPopulation { population: label });
        }
        for spec in &self.covariates {
            let values = population.covariates.get(&spec.name).ok_or_else(|| {
                SchemaError::MissingColumn {
                    column: spec.name.clone(),
                    population: label.clone(),
                }
            })?;
            check_length(&spec.name, &label, values.len(), n)?;
            match (spec.kind, values) {
                (CovariateKind::Continuous, CovariateValues::Continuous(column)) => {
                    check_finite(&spec.name, &label, column.iter().copied())?;
                }
                (CovariateKind::Categorical, CovariateValues::Categorical(levels)) => {
                    if let Some(row) = levels.iter().position(|level| level.trim().is_empty()) {
                        return Err(SchemaError::MissingValue {
                            column: spec.name.clone(),
                            population: label,
                            row: row + 1,
                        });
                    }
                }
                (expected_kind, found) => {
                    return Err(SchemaError::WrongType {
                        column: spec.name.clone(),
                        population: label,
                        expected: match expected_kind {
                            CovariateKind::Continuous => "a continuous covariate",
                            CovariateKind::Categorical => "a categorical covariate",
                        },
                        found: found.kind_name().to_string(),
                    });
                }
            }
        }

        for metric in &self.metrics {
            let values = population
                .raw
                .get(metric)
                .ok_or_else(|| SchemaError::MissingColumn {
                    column: metric.clone(),
                    population: label.clone(),
                })?;
            check_length(metric, &label, values.test.len(), n)?;
            check_finite(metric, &label, values.test.iter().copied())?;
            if let Some(retest) = &values.retest {
                let column = format!("{metric}{RETEST_SUFFIX}");
                check_length(&column, &label, retest.len(), n)?;
                // NaN marks "not retested"; infinities are still rejected.
                if let Some(row) = retest.iter().position(|v| v.is_infinite()) {
                    return Err(SchemaError::NonFiniteValue {
                        column,
                        population: label,
                        row: row + 1,
                    });
                }
            }
        }

        for criterion in &self.criteria {
            let values =
                population
                    .criteria
                    .get(criterion)
                    .ok_or_else(|| SchemaError::MissingColumn {
                        column: criterion.clone(),
                        population: label.clone(),
                    })?;
            check_length(criterion, &label, values.len(), n)?;
            check_finite(criterion, &label, values.iter().copied())?;
        }
        Ok(())
    }
}

fn check_length(
    column: &str,
    population: &str,
    found: usize,
    expected: usize,
) -> Result<(), SchemaError> {
    if found != expected {
        return Err(SchemaError::LengthMismatch {
            column: column.to_string(),
            population: population.to_string(),
            found,
            expected,
        });
    }
    Ok(())
}

fn check_finite(
    column: &str,
    population: &str,
    values: impl Iterator<Item = f64>,
) -> Result<(), SchemaError> {
    for (row, value) in values.enumerate() {
        if !value.is_finite() {
            return Err(SchemaError::NonFiniteValue {
                column: column.to_string(),
                population: population.to_string(),
                row: row + 1,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum CovariateValues {
    Continuous(Array1<f64>),
    Categorical(Vec<String>),
}

impl CovariateValues {
    pub fn len(&self) -> usize {
        match self {
            CovariateValues::Continuous(values) => values.len(),
            CovariateValues::Categorical(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind_name(&self) -> &'static str {
        match self {
            CovariateValues::Continuous(_) => "continuous values",
            CovariateValues::Categorical(_) => "categorical labels",
        }
    }
}

/// Test and optional retest values of one metric, one entry per subject.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValues {
    pub test: Array1<f64>,
    /// `NaN` entries mark subjects that were not retested.
    pub retest: Option<Array1<f64>>,
}

impl MetricValues {
    pub fn new(test: Array1<f64>, retest: Option<Array1<f64>>) -> Self {
        Self { test, retest }
    }

    /// Number of subjects with a usable retest value.
    pub fn retest_count(&self) -> usize {
        self.retest
            .as_ref()
            .map_or(0, |retest| retest.iter().filter(|v| v.is_finite()).count())
    }
}

/// One of the four processed forms of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricVariant {
    Raw,
    RawRetest,
    Compensated,
    CompensatedRetest,
}

/// Names a single metric-variant column, e.g. `grip_retest_compensated`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub metric: String,
    pub variant: MetricVariant,
}

impl ColumnRef {
    pub fn new(metric: &str, variant: MetricVariant) -> Self {
        Self {
            metric: metric.to_string(),
            variant,
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant {
            MetricVariant::Raw => write!(f, "{}", self.metric),
            MetricVariant::RawRetest => write!(f, "{}{RETEST_SUFFIX}", self.metric),
            MetricVariant::Compensated => write!(f, "{}{COMPENSATED_SUFFIX}", self.metric),
            MetricVariant::CompensatedRetest => {
                write!(f, "{}{RETEST_SUFFIX}{COMPENSATED_SUFFIX}", self.metric)
            }
        }
    }
}

/// One population table: subject identifiers, covariates, external criteria, raw
/// metric columns, and (after confound correction) compensated metric columns.
#[derive(Debug, Clone)]
pub struct Population {
    pub group: Group,
    pub subject_ids: Vec<String>,
    pub covariates: BTreeMap<String, CovariateValues>,
    pub criteria: BTreeMap<String, Array1<f64>>,
    pub raw: BTreeMap<String, MetricValues>,
    pub compensated: BTreeMap<String, MetricValues>,
}

impl Population {
    /// Creates an empty table whose subjects are identified `1..=n`.
    pub fn new(group: Group, n_subjects: usize) -> Self {
        Self::with_subject_ids(group, (1..=n_subjects).map(|i| i.to_string()).collect())
    }

    pub fn with_subject_ids(group: Group, subject_ids: Vec<String>) -> Self {
        Self {
            group,
            subject_ids,
            covariates: BTreeMap::new(),
            criteria: BTreeMap::new(),
            raw: BTreeMap::new(),
            compensated: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.subject_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }

    pub fn insert_covariate(&mut self, name: &str, values: CovariateValues) {
        self.covariates.insert(name.to_string(), values);
    }

    pub fn insert_metric(&mut self, name: &str, values: MetricValues) {
        self.raw.insert(name.to_string(), values);
    }

    pub fn insert_criterion(&mut self, name: &str, values: Array1<f64>) {
        self.criteria.insert(name.to_string(), values);
    }

    /// Looks up a metric-variant column. Retest variants are `None` when the metric
    /// has no retest data; compensated variants are `None` before confound correction.
    pub fn column(&self, column: &ColumnRef) -> Option<&Array1<f64>> {
        match column.variant {
            MetricVariant::Raw => self.raw.get(&column.metric).map(|m| &m.test),
            MetricVariant::RawRetest => self.raw.get(&column.metric)?.retest.as_ref(),
            MetricVariant::Compensated => self.compensated.get(&column.metric).map(|m| &m.test),
            MetricVariant::CompensatedRetest => {
                self.compensated.get(&column.metric)?.retest.as_ref()
            }
        }
    }

    pub fn column_mut(&mut self, column: &ColumnRef) -> Option<&mut Array1<f64>> {
        match column.variant {
            MetricVariant::Raw => self.raw.get_mut(&column.metric).map(|m| &mut m.test),
            MetricVariant::RawRetest => self.raw.get_mut(&column.metric)?.retest.as_mut(),
            MetricVariant::Compensated => {
                self.compensated.get_mut(&column.metric).map(|m| &mut m.test)
            }
            MetricVariant::CompensatedRetest => {
                self.compensated.get_mut(&column.metric)?.retest.as_mut()
            }
        }
    }
}

/// Stable identifier of a subject in the pooled (reference first, then impaired) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PooledSubject {
    pub group: Group,
    /// Row of the subject within its own population table.
    pub index: usize,
}

pub fn pooled_subjects(reference: &Population, impaired: &Population) -> Vec<PooledSubject> {
    [reference, impaired]
        .into_iter()
        .flat_map(|population| {
            (0..population.len()).map(move |index| PooledSubject {
                group: population.group,
                index,
            })
        })
        .collect()
}

/// Concatenates a column of both populations in pooled order.
pub fn pooled_column(
    reference: &Population,
    impaired: &Population,
    column: &ColumnRef,
) -> Option<Array1<f64>> {
    let head = reference.column(column)?;
    let tail = impaired.column(column)?;
    Some(head.iter().chain(tail.iter()).copied().collect())
}

/// Builds the pooled subject × metric matrix of one variant, columns in `metrics` order.
pub fn pooled_matrix(
    reference: &Population,
    impaired: &Population,
    metrics: &[String],
    variant: MetricVariant,
) -> Result<Array2<f64>, ValidationError> {
    let n = reference.len() + impaired.len();
    let mut matrix = Array2::zeros((n, metrics.len()));
    for (j, metric) in metrics.iter().enumerate() {
        let column_ref = ColumnRef::new(metric, variant);
        let column = pooled_column(reference, impaired, &column_ref).ok_or_else(|| {
            SchemaError::MissingColumn {
                column: column_ref.to_string(),
                population: "pooled".to_string(),
            }
        })?;
        matrix.column_mut(j).assign(&column);
    }
    Ok(matrix)
}

/// Errors raised while reading a population table from disk.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Loads and validates one population table from a tab-separated file.
pub fn load_population(path: &Path, group: Group, schema: &Schema) -> Result<Population, DataError> {
    log::info!("Loading {group} table from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    let population = internal::population_from_frame(&df, group, schema)?;
    log::info!(
        "Loaded {} {group} subjects with {} metrics and {} covariates",
        population.len(),
        population.raw.len(),
        population.covariates.len()
    );
    Ok(population)
}

/// Internal module for DataFrame → `Population` conversion.
mod internal {
    use super::*;

    pub(super) fn population_from_frame(
        df: &DataFrame,
        group: Group,
        schema: &Schema,
    ) -> Result<Population, DataError> {
        let label = group.to_string();
        let columns: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let required = schema
            .covariates
            .iter()
            .map(|c| &c.name)
            .chain(schema.metrics.iter())
            .chain(schema.criteria.iter());
        for name in required {
            if !columns.contains(name) {
                return Err(SchemaError::MissingColumn {
                    column: name.clone(),
                    population: label,
                }
                .into());
            }
        }

        let n = df.height();
        let subject_ids = build_subject_ids(df, &columns, n)?;
        let mut population = Population::with_subject_ids(group, subject_ids);

        for spec in &schema.covariates {
            let values = match spec.kind {
                CovariateKind::Continuous => CovariateValues::Continuous(Array1::from_vec(
                    extract_numeric_column(df, &spec.name, &label)?,
                )),
                CovariateKind::Categorical => {
                    CovariateValues::Categorical(extract_label_column(df, &spec.name, &label)?)
                }
            };
            population.insert_covariate(&spec.name, values);
        }

        for metric in &schema.metrics {
            let test = Array1::from_vec(extract_numeric_column(df, metric, &label)?);
            let retest_name = format!("{metric}{RETEST_SUFFIX}");
            let retest = if columns.contains(&retest_name) {
                Some(Array1::from_vec(extract_optional_column(
                    df,
                    &retest_name,
                    &label,
                )?))
            } else {
                None
            };
            population.insert_metric(metric, MetricValues::new(test, retest));
        }

        for criterion in &schema.criteria {
            let values = Array1::from_vec(extract_numeric_column(df, criterion, &label)?);
            population.insert_criterion(criterion, values);
        }

        schema.validate(&population)?;
        Ok(population)
    }

    fn numeric_chunks(df: &DataFrame, name: &str, label: &str) -> Result<Column, DataError> {
        let column = df.column(name)?;
        column.cast(&DataType::Float64).map_err(|_| {
            DataError::Schema(SchemaError::WrongType {
                column: name.to_string(),
                population: label.to_string(),
                expected: "f64 (numeric)",
                found: format!("{:?}", column.dtype()),
            })
        })
    }

    fn extract_numeric_column(
        df: &DataFrame,
        name: &str,
        label: &str,
    ) -> Result<Vec<f64>, DataError> {
        let casted = numeric_chunks(df, name, label)?;
        let mut values = Vec::with_capacity(casted.len());
        for (row, value) in casted.f64()?.into_iter().enumerate() {
            match value {
                Some(v) if v.is_finite() => values.push(v),
                Some(_) => {
                    return Err(SchemaError::NonFiniteValue {
                        column: name.to_string(),
                        population: label.to_string(),
                        row: row + 1,
                    }
                    .into());
                }
                None => {
                    return Err(SchemaError::MissingValue {
                        column: name.to_string(),
                        population: label.to_string(),
                        row: row + 1,
                    }
                    .into());
                }
            }
        }
        Ok(values)
    }

    /// Retest columns may be blank for subjects who were not retested.
    fn extract_optional_column(
        df: &DataFrame,
        name: &str,
        label: &str,
    ) -> Result<Vec<f64>, DataError> {
        let casted = numeric_chunks(df, name, label)?;
        let values = casted
            .f64()?
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect();
        Ok(values)
    }

    fn extract_label_column(
        df: &DataFrame,
        name: &str,
        label: &str,
    ) -> Result<Vec<String>, DataError> {
        let casted = df.column(name)?.cast(&DataType::String)?;
        let mut values = Vec::with_capacity(casted.len());
        let labels = casted.as_materialized_series().str()?;
        for (row, value) in labels.into_iter().enumerate() {
            match value {
                Some(text) if !text.trim().is_empty() => values.push(text.trim().to_string()),
                _ => {
                    return Err(SchemaError::MissingValue {
                        column: name.to_string(),
                        population: label.to_string(),
                        row: row + 1,
                    }
                    .into());
                }
            }
        }
        Ok(values)
    }

    fn build_subject_ids(
        df: &DataFrame,
        columns: &HashSet<String>,
        n: usize,
    ) -> Result<Vec<String>, DataError> {
        if !columns.contains("subject_id") {
            return Ok((1..=n).map(|i| i.to_string()).collect());
        }
        let casted = df.column("subject_id")?.cast(&DataType::String)?;
        let ids = casted
            .as_materialized_series()
            .str()?
            .into_iter()
            .enumerate()
            .map(|(i, value)| match value {
                Some(text) if !text.is_empty() => text.to_string(),
                _ => (i + 1).to_string(),
            })
            .collect();
        Ok(ids)
    }
}
