//! # Metric Scoring
//!
//! The psychometric battery computed for every metric once it has been confound
//! compensated and reference standardized:
//!
//! - C1 and C2: validity coefficients against two pluggable comparators
//!   (`ValidityCriterion`), by default known-groups and test-retest correlation.
//! - AUC: Mann-Whitney area under the ROC curve, impaired subjects as positives.
//! - ICC: two-way single-measurement intraclass correlation of test and retest.
//! - SRD: smallest real difference, `1.96 * sqrt(2) * SEM`.
//! - slope: least-squares slope of retest on test.
//!
//! Every statistic is a pure function of the compensated columns; nothing here
//! mutates a population.

use crate::config::{AucOrientation, ComparatorSpec, IccForm, PipelineConfig};
use crate::data::{
    ColumnRef, Group, MetricVariant, Population, pooled_column, pooled_subjects,
};
use crate::error::{SchemaError, ValidationError};
use crate::stats;
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// z-value of the two-sided 95% interval used by the SRD.
const SRD_Z: f64 = 1.96;
const MIN_RETEST_PAIRS: usize = 2;

/// Scores of one metric. Reliability statistics are `None` when the metric has no
/// test-retest pairs and retest data is not required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    pub metric: String,
    pub c1: Option<f64>,
    pub c2: Option<f64>,
    pub auc: f64,
    pub srd: Option<f64>,
    pub icc: Option<f64>,
    pub slope: Option<f64>,
    pub sem: Option<f64>,
    pub retest_pairs: usize,
}

/// Scores of every metric, in schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScoreTable {
    pub c1_label: String,
    pub c2_label: String,
    scores: Vec<MetricScore>,
}

impl MetricScoreTable {
    pub fn new(c1_label: String, c2_label: String, scores: Vec<MetricScore>) -> Self {
        Self {
            c1_label,
            c2_label,
            scores,
        }
    }

    pub fn get(&self, metric: &str) -> Option<&MetricScore> {
        self.scores.iter().find(|score| score.metric == metric)
    }

    pub fn scores(&self) -> &[MetricScore] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// A comparator producing one validity coefficient for a metric.
pub trait ValidityCriterion: Send + Sync {
    fn label(&self) -> String;

    /// Correlation between the compensated metric and the comparator. `Ok(None)`
    /// means the coefficient is undefined for this metric and the caller allowed it.
    fn coefficient(
        &self,
        reference: &Population,
        impaired: &Population,
        metric: &str,
        require_retest: bool,
    ) -> Result<Option<f64>, ValidationError>;
}

/// Point-biserial correlation with impaired-group membership.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnownGroups;

impl ValidityCriterion for KnownGroups {
    fn label(&self) -> String {
        "known_groups".to_string()
    }

    fn coefficient(
        &self,
        reference: &Population,
        impaired: &Population,
        metric: &str,
        _: bool,
    ) -> Result<Option<f64>, ValidationError> {
        let column = ColumnRef::new(metric, MetricVariant::Compensated);
        let values = pooled(reference, impaired, &column)?;
        let membership: Vec<f64> = pooled_subjects(reference, impaired)
            .iter()
            .map(|subject| match subject.group {
                Group::Impaired => 1.0,
                Group::Reference => 0.0,
            })
            .collect();
        stats::pearson(&values.to_vec(), &membership)
            .map(Some)
            .ok_or_else(|| degenerate(&column, "pooled", &values))
    }
}

/// Pearson correlation between test and retest administrations.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestRetest;

impl ValidityCriterion for TestRetest {
    fn label(&self) -> String {
        "test_retest".to_string()
    }

    fn coefficient(
        &self,
        reference: &Population,
        impaired: &Population,
        metric: &str,
        require_retest: bool,
    ) -> Result<Option<f64>, ValidationError> {
        let pairs = RetestPairs::collect(reference, impaired, metric)?;
        if pairs.len() < MIN_RETEST_PAIRS {
            return if require_retest {
                Err(pairs.insufficient(metric, "the test-retest correlation"))
            } else {
                Ok(None)
            };
        }
        match stats::pearson(&pairs.test, &pairs.retest) {
            Some(r) => Ok(Some(r)),
            None => Err(ValidationError::DegenerateScale {
                column: ColumnRef::new(metric, MetricVariant::CompensatedRetest).to_string(),
                population: "pooled".to_string(),
                sd: 0.0,
            }),
        }
    }
}

/// Pearson correlation with an external criterion column.
#[derive(Debug, Clone)]
pub struct External {
    pub column: String,
}

impl ValidityCriterion for External {
    fn label(&self) -> String {
        self.column.clone()
    }

    fn coefficient(
        &self,
        reference: &Population,
        impaired: &Population,
        metric: &str,
        _: bool,
    ) -> Result<Option<f64>, ValidationError> {
        let mut criterion = Vec::with_capacity(reference.len() + impaired.len());
        for population in [reference, impaired] {
            let values = population.criteria.get(&self.column).ok_or_else(|| {
                SchemaError::MissingColumn {
                    column: self.column.clone(),
                    population: population.group.to_string(),
                }
            })?;
            criterion.extend(values.iter().copied());
        }
        let column = ColumnRef::new(metric, MetricVariant::Compensated);
        let values = pooled(reference, impaired, &column)?;
        stats::pearson(&values.to_vec(), &criterion)
            .map(Some)
            .ok_or_else(|| ValidationError::DegenerateScale {
                column: self.column.clone(),
                population: "pooled".to_string(),
                sd: stats::sample_sd(&criterion).unwrap_or(0.0),
            })
    }
}

/// Builds the comparator named by a configuration slot.
pub fn criterion_from_spec(spec: &ComparatorSpec) -> Box<dyn ValidityCriterion> {
    match spec {
        ComparatorSpec::KnownGroups => Box::new(KnownGroups),
        ComparatorSpec::TestRetest => Box::new(TestRetest),
        ComparatorSpec::External { column } => Box::new(External {
            column: column.clone(),
        }),
    }
}

/// Pooled raw and compensated values of one metric, with subject groups, for a
/// plotting collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionTrace {
    pub metric: String,
    pub groups: Vec<Group>,
    pub raw: Array1<f64>,
    pub compensated: Array1<f64>,
}

impl CorrectionTrace {
    pub fn from_populations(
        reference: &Population,
        impaired: &Population,
        metric: &str,
    ) -> Result<Self, ValidationError> {
        let raw = pooled(reference, impaired, &ColumnRef::new(metric, MetricVariant::Raw))?;
        let compensated = pooled(
            reference,
            impaired,
            &ColumnRef::new(metric, MetricVariant::Compensated),
        )?;
        let groups = pooled_subjects(reference, impaired)
            .into_iter()
            .map(|subject| subject.group)
            .collect();
        Ok(Self {
            metric: metric.to_string(),
            groups,
            raw,
            compensated,
        })
    }
}

/// Receives a `CorrectionTrace` for every scored metric. Failures are logged by the
/// scorer and never abort scoring.
pub trait CorrectionObserver: Send + Sync {
    fn observe(&self, trace: &CorrectionTrace) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Paired compensated test/retest values over both populations.
#[derive(Debug, Clone, Default)]
pub struct RetestPairs {
    pub test: Vec<f64>,
    pub retest: Vec<f64>,
}

impl RetestPairs {
    /// Pairs each population's test values with its own retest values. A population
    /// without a retest column contributes no pairs.
    pub fn collect(
        reference: &Population,
        impaired: &Population,
        metric: &str,
    ) -> Result<Self, ValidationError> {
        let test_column = ColumnRef::new(metric, MetricVariant::Compensated);
        let retest_column = ColumnRef::new(metric, MetricVariant::CompensatedRetest);
        let mut pairs = RetestPairs::default();
        for population in [reference, impaired] {
            let test = population
                .column(&test_column)
                .ok_or_else(|| missing(&test_column, population))?;
            let Some(retest) = population.column(&retest_column) else {
                continue;
            };
            for (&t, &r) in test.iter().zip(retest.iter()) {
                if t.is_finite() && r.is_finite() {
                    pairs.test.push(t);
                    pairs.retest.push(r);
                }
            }
        }
        Ok(pairs)
    }

    pub fn len(&self) -> usize {
        self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test.is_empty()
    }

    fn insufficient(&self, metric: &str, statistic: &'static str) -> ValidationError {
        ValidationError::InsufficientData {
            metric: metric.to_string(),
            statistic,
            found: self.len(),
            required: MIN_RETEST_PAIRS,
        }
    }
}

/// Rank-based AUC for separating impaired (positive) from reference subjects,
/// with mid-ranks for ties.
pub fn auc(reference: ArrayView1<f64>, impaired: ArrayView1<f64>, orientation: AucOrientation) -> Option<f64> {
    let n_neg = reference.len();
    let n_pos = impaired.len();
    if n_neg == 0 || n_pos == 0 {
        return None;
    }
    let pooled: Array1<f64> = reference.iter().chain(impaired.iter()).copied().collect();
    let ranks = stats::midranks(pooled.view());
    let rank_sum_pos: f64 = ranks[n_neg..].iter().sum();
    let u = rank_sum_pos - (n_pos * (n_pos + 1)) as f64 / 2.0;
    let area = u / (n_pos as f64 * n_neg as f64);
    Some(match orientation {
        AucOrientation::Directional => area,
        AucOrientation::TwoSided => area.max(1.0 - area),
    })
}

/// Two-way single-measurement ICC for k = 2 administrations, clamped to [0, 1].
/// `None` for unpaired input or when the ANOVA denominator vanishes.
pub fn icc(test: &[f64], retest: &[f64], form: IccForm) -> Option<f64> {
    let n = test.len();
    if n != retest.len() || n < 2 {
        return None;
    }
    let k = 2.0;
    let nf = n as f64;
    let grand = (test.iter().sum::<f64>() + retest.iter().sum::<f64>()) / (k * nf);
    let test_mean = stats::mean(test)?;
    let retest_mean = stats::mean(retest)?;

    let ss_rows: f64 = test
        .iter()
        .zip(retest)
        .map(|(&a, &b)| {
            let d = 0.5 * (a + b) - grand;
            k * d * d
        })
        .sum();
    let ss_cols = nf * ((test_mean - grand).powi(2) + (retest_mean - grand).powi(2));
    // With two administrations the interaction residual of subject i is
    // ±((a_i - b_i) - (mean_a - mean_b)) / 2.
    let offset = test_mean - retest_mean;
    let ss_error: f64 = test
        .iter()
        .zip(retest)
        .map(|(&a, &b)| {
            let d = (a - b) - offset;
            0.5 * d * d
        })
        .sum();

    let ms_rows = ss_rows / (nf - 1.0);
    let ms_cols = ss_cols / (k - 1.0);
    let ms_error = ss_error / ((nf - 1.0) * (k - 1.0));

    let denominator = match form {
        IccForm::Consistency => ms_rows + (k - 1.0) * ms_error,
        IccForm::Agreement => ms_rows + (k - 1.0) * ms_error + k / nf * (ms_cols - ms_error),
    };
    if !(denominator > 0.0) {
        return None;
    }
    Some(((ms_rows - ms_error) / denominator).clamp(0.0, 1.0))
}

/// `SEM = SD * sqrt(1 - ICC)`.
pub fn standard_error_of_measurement(sd: f64, icc: f64) -> f64 {
    sd * (1.0 - icc).max(0.0).sqrt()
}

/// `SRD = 1.96 * sqrt(2) * SEM`.
pub fn smallest_real_difference(sem: f64) -> f64 {
    SRD_Z * std::f64::consts::SQRT_2 * sem
}

/// Computes the full battery for each metric.
pub struct MetricScorer<'a> {
    c1: Box<dyn ValidityCriterion>,
    c2: Box<dyn ValidityCriterion>,
    icc_form: IccForm,
    auc_orientation: AucOrientation,
    require_retest: bool,
    observer: Option<&'a dyn CorrectionObserver>,
}

impl<'a> MetricScorer<'a> {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            c1: criterion_from_spec(&config.c1),
            c2: criterion_from_spec(&config.c2),
            icc_form: config.icc_form,
            auc_orientation: config.auc_orientation,
            require_retest: config.require_retest,
            observer: None,
        }
    }

    pub fn with_criteria(mut self, c1: Box<dyn ValidityCriterion>, c2: Box<dyn ValidityCriterion>) -> Self {
        self.c1 = c1;
        self.c2 = c2;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn CorrectionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn score_metric(
        &self,
        reference: &Population,
        impaired: &Population,
        metric: &str,
    ) -> Result<MetricScore, ValidationError> {
        let column = ColumnRef::new(metric, MetricVariant::Compensated);
        let reference_values = reference.column(&column).ok_or_else(|| missing(&column, reference))?;
        let impaired_values = impaired.column(&column).ok_or_else(|| missing(&column, impaired))?;

        if let Some(observer) = self.observer {
            self.notify(observer, reference, impaired, metric);
        }

        let c1 = self.c1.coefficient(reference, impaired, metric, self.require_retest)?;
        let c2 = self.c2.coefficient(reference, impaired, metric, self.require_retest)?;
        let auc = auc(
            reference_values.view(),
            impaired_values.view(),
            self.auc_orientation,
        )
        .ok_or_else(|| SchemaError::EmptyPopulation {
            population: "pooled".to_string(),
        })?;

        let pairs = RetestPairs::collect(reference, impaired, metric)?;
        let mut score = MetricScore {
            metric: metric.to_string(),
            c1,
            c2,
            auc,
            srd: None,
            icc: None,
            slope: None,
            sem: None,
            retest_pairs: pairs.len(),
        };

        if pairs.len() < MIN_RETEST_PAIRS {
            if self.require_retest {
                return Err(pairs.insufficient(metric, "ICC, SRD and slope"));
            }
            log::warn!(
                "Metric '{metric}' has {} retest pairs; reliability statistics are left empty",
                pairs.len()
            );
            return Ok(score);
        }

        let retest_column = ColumnRef::new(metric, MetricVariant::CompensatedRetest).to_string();
        let all_values: Vec<f64> = pairs.test.iter().chain(&pairs.retest).copied().collect();
        let sd = stats::sample_sd(&all_values).unwrap_or(0.0);
        let icc = icc(&pairs.test, &pairs.retest, self.icc_form).ok_or_else(|| {
            ValidationError::DegenerateScale {
                column: retest_column.clone(),
                population: "pooled".to_string(),
                sd,
            }
        })?;
        let slope = stats::ols_slope(&pairs.test, &pairs.retest).ok_or_else(|| {
            ValidationError::DegenerateScale {
                column: column.to_string(),
                population: "pooled".to_string(),
                sd: stats::sample_sd(&pairs.test).unwrap_or(0.0),
            }
        })?;
        let sem = standard_error_of_measurement(sd, icc);

        score.icc = Some(icc);
        score.sem = Some(sem);
        score.srd = Some(smallest_real_difference(sem));
        score.slope = Some(slope);
        Ok(score)
    }

    fn notify(
        &self,
        observer: &dyn CorrectionObserver,
        reference: &Population,
        impaired: &Population,
        metric: &str,
    ) {
        let outcome = CorrectionTrace::from_populations(reference, impaired, metric)
            .map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)
            .and_then(|trace| observer.observe(&trace));
        if let Err(e) = outcome {
            log::warn!("Correction observer failed for metric '{metric}': {e}");
        }
    }

    /// Scores every metric into an index-addressed table.
    pub fn score_all(
        &self,
        metrics: &[String],
        reference: &Population,
        impaired: &Population,
        parallel: bool,
    ) -> Result<MetricScoreTable, ValidationError> {
        let scores = if parallel {
            metrics
                .par_iter()
                .map(|metric| self.score_metric(reference, impaired, metric))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            metrics
                .iter()
                .map(|metric| self.score_metric(reference, impaired, metric))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(MetricScoreTable::new(self.c1.label(), self.c2.label(), scores))
    }
}

fn pooled(
    reference: &Population,
    impaired: &Population,
    column: &ColumnRef,
) -> Result<Array1<f64>, ValidationError> {
    pooled_column(reference, impaired, column).ok_or_else(|| {
        let population = if reference.column(column).is_none() {
            reference
        } else {
            impaired
        };
        missing(column, population)
    })
}

fn missing(column: &ColumnRef, population: &Population) -> ValidationError {
    SchemaError::MissingColumn {
        column: column.to_string(),
        population: population.group.to_string(),
    }
    .into()
}

fn degenerate(column: &ColumnRef, population: &str, values: &Array1<f64>) -> ValidationError {
    ValidationError::DegenerateScale {
        column: column.to_string(),
        population: population.to_string(),
        sd: stats::sample_sd(&values.to_vec()).unwrap_or(0.0),
    }
}
