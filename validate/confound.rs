//! # Confound Correction
//!
//! Each metric is regressed on the declared covariates and replaced by its residual,
//! the value the subject would show at the reference covariate levels. The fitted
//! `ConfoundModel` is applied identically to the test and retest columns of both
//! populations, so every compensated column lives on the same corrected scale.
//!
//! The design matrix has a canonical column order that `ConfoundModel::terms` records:
//! the intercept, one column per continuous covariate, then treatment-coded indicator
//! columns for every non-baseline level of each categorical covariate (levels sorted,
//! the first one is the baseline).

use crate::config::{ConfoundFit, PipelineConfig};
use crate::data::{CovariateKind, CovariateSpec, CovariateValues, MetricValues, Population};
use crate::error::ValidationError;
use crate::faer_ndarray::FaerCholesky;
use crate::stats;
use faer::Side;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Smallest acceptable ratio between the smallest and largest Cholesky pivot of X'X.
const RANK_TOLERANCE: f64 = 1e-7;

/// One column of the confound design matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "term")]
pub enum DesignTerm {
    Intercept,
    Continuous { covariate: String },
    /// Indicator of `covariate == level`, relative to the covariate's baseline level.
    Level { covariate: String, level: String },
}

impl DesignTerm {
    pub fn name(&self) -> String {
        match self {
            DesignTerm::Intercept => "intercept".to_string(),
            DesignTerm::Continuous { covariate } => covariate.clone(),
            DesignTerm::Level { covariate, level } => format!("{covariate}[{level}]"),
        }
    }
}

/// Subject random-intercept variance components, estimated from paired test/retest
/// residuals by the one-way ANOVA moment estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponents {
    pub between_subject: f64,
    pub within_subject: f64,
    pub paired_subjects: usize,
}

impl VarianceComponents {
    /// Share of residual variance attributable to stable subject differences.
    pub fn intraclass_correlation(&self) -> f64 {
        let total = self.between_subject + self.within_subject;
        if total > 0.0 {
            self.between_subject / total
        } else {
            0.0
        }
    }
}

/// The fitted covariate model of one metric. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfoundModel {
    pub metric: String,
    pub fit_population: ConfoundFit,
    pub terms: Vec<DesignTerm>,
    pub coefficients: Vec<f64>,
    /// Baseline level of every categorical covariate.
    pub baselines: BTreeMap<String, String>,
    pub residual_variance: f64,
    pub n_observations: usize,
    /// Mean fitted value over the fitting rows, added back when
    /// `retain_grand_mean` is set.
    pub grand_mean: f64,
    pub variance_components: Option<VarianceComponents>,
}

impl ConfoundModel {
    /// Covariate-attributable expected value for every subject of `population`.
    pub fn expected(&self, population: &Population) -> Result<Array1<f64>, ValidationError> {
        internal::check_known_levels(&self.metric, &self.terms, &self.baselines, population)?;
        let x = internal::design_matrix(&self.metric, &self.terms, population)?;
        Ok(x.dot(&Array1::from_vec(self.coefficients.clone())))
    }

    /// Produces the compensated test (and retest) columns of `population`.
    /// Subjects without a retest value keep `NaN` in the compensated retest column.
    pub fn compensate(
        &self,
        population: &Population,
        retain_grand_mean: bool,
    ) -> Result<MetricValues, ValidationError> {
        let raw = population.raw.get(&self.metric).ok_or_else(|| {
            ValidationError::model_fit(
                &self.metric,
                format!("the {} table has no such metric", population.group),
            )
        })?;
        let mut expected = self.expected(population)?;
        if retain_grand_mean {
            expected -= self.grand_mean;
        }
        let test = &raw.test - &expected;
        let retest = raw.retest.as_ref().map(|retest| retest - &expected);
        Ok(MetricValues::new(test, retest))
    }
}

/// Compensated columns of one metric for both populations, with the model behind them.
#[derive(Debug, Clone)]
pub struct MetricCorrection {
    pub model: ConfoundModel,
    pub reference: MetricValues,
    pub impaired: MetricValues,
}

/// Fits per-metric confound models and produces compensated columns.
#[derive(Debug, Clone)]
pub struct ConfoundCorrector<'a> {
    covariates: &'a [CovariateSpec],
    fit: ConfoundFit,
    random_intercept: bool,
    retain_grand_mean: bool,
}

impl<'a> ConfoundCorrector<'a> {
    pub fn new(covariates: &'a [CovariateSpec], config: &PipelineConfig) -> Self {
        Self {
            covariates,
            fit: config.confound_fit,
            random_intercept: config.random_intercept,
            retain_grand_mean: config.retain_grand_mean,
        }
    }

    /// Fits the confound model of `metric` on the configured fitting population(s).
    pub fn fit_metric(
        &self,
        metric: &str,
        reference: &Population,
        impaired: &Population,
    ) -> Result<ConfoundModel, ValidationError> {
        let fitting: Vec<&Population> = match self.fit {
            ConfoundFit::Reference => vec![reference],
            ConfoundFit::Pooled => vec![reference, impaired],
        };
        for population in &fitting {
            internal::check_covariate_variation(metric, self.covariates, population)?;
        }

        let (terms, baselines) = internal::build_terms(metric, self.covariates, &fitting)?;
        let mut blocks = Vec::with_capacity(fitting.len());
        for population in &fitting {
            let raw = population.raw.get(metric).ok_or_else(|| {
                ValidationError::model_fit(
                    metric,
                    format!("the {} table has no such metric", population.group),
                )
            })?;
            let x = internal::design_matrix(metric, &terms, population)?;
            blocks.push((x, raw));
        }

        let (x, y, pairs) = internal::stack_rows(&blocks, self.random_intercept);
        let (n, p) = x.dim();
        if n <= p {
            return Err(ValidationError::model_fit(
                metric,
                format!("{n} observations cannot identify {p} design columns"),
            ));
        }

        let beta = internal::least_squares(metric, &x, &y)?;
        let fitted = x.dot(&beta);
        let residuals = &y - &fitted;
        let rss: f64 = residuals.iter().map(|r| r * r).sum();
        let grand_mean = fitted.mean().unwrap_or(0.0);

        let variance_components = if self.random_intercept {
            internal::variance_components(&residuals, &pairs)
        } else {
            None
        };

        log::debug!(
            "Fitted confound model for '{metric}': {n} rows, {p} terms, RSS {rss:.4e}"
        );

        Ok(ConfoundModel {
            metric: metric.to_string(),
            fit_population: self.fit,
            terms,
            coefficients: beta.to_vec(),
            baselines,
            residual_variance: rss / (n - p) as f64,
            n_observations: n,
            grand_mean,
            variance_components,
        })
    }

    /// Fits `metric` and applies the model to both populations.
    pub fn correct_metric(
        &self,
        metric: &str,
        reference: &Population,
        impaired: &Population,
    ) -> Result<MetricCorrection, ValidationError> {
        let model = self.fit_metric(metric, reference, impaired)?;
        let reference_values = model.compensate(reference, self.retain_grand_mean)?;
        let impaired_values = model.compensate(impaired, self.retain_grand_mean)?;
        Ok(MetricCorrection {
            model,
            reference: reference_values,
            impaired: impaired_values,
        })
    }

    /// Corrects every metric and writes the compensated columns into both populations.
    ///
    /// Metrics are fit independently (in parallel when requested) into an
    /// index-addressed result vector; the populations are only written once every
    /// metric has succeeded, so a failure leaves both tables untouched.
    pub fn correct_all(
        &self,
        metrics: &[String],
        reference: &mut Population,
        impaired: &mut Population,
        parallel: bool,
    ) -> Result<Vec<ConfoundModel>, ValidationError> {
        let corrections: Vec<MetricCorrection> = {
            let reference_view: &Population = reference;
            let impaired_view: &Population = impaired;
            if parallel {
                metrics
                    .par_iter()
                    .map(|metric| self.correct_metric(metric, reference_view, impaired_view))
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                metrics
                    .iter()
                    .map(|metric| self.correct_metric(metric, reference_view, impaired_view))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        let mut models = Vec::with_capacity(corrections.len());
        for (metric, correction) in metrics.iter().zip(corrections) {
            reference
                .compensated
                .insert(metric.clone(), correction.reference);
            impaired.compensated.insert(metric.clone(), correction.impaired);
            models.push(correction.model);
        }
        Ok(models)
    }
}

/// Internal module for design construction and least-squares details.
mod internal {
    use super::*;

    /// Rejects covariates that cannot be estimated from a fitting population.
    pub(super) fn check_covariate_variation(
        metric: &str,
        covariates: &[CovariateSpec],
        population: &Population,
    ) -> Result<(), ValidationError> {
        for spec in covariates {
            let values = covariate(metric, spec, population)?;
            match values {
                CovariateValues::Continuous(column) => {
                    let variance = stats::sample_variance(&column.to_vec()).unwrap_or(0.0);
                    if !(variance > 0.0) {
                        return Err(ValidationError::model_fit(
                            metric,
                            format!(
                                "covariate '{}' has zero variance in the {} population",
                                spec.name, population.group
                            ),
                        ));
                    }
                }
                CovariateValues::Categorical(labels) => {
                    let distinct: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
                    if distinct.len() < 2 {
                        return Err(ValidationError::model_fit(
                            metric,
                            format!(
                                "covariate '{}' has a single level in the {} population",
                                spec.name, population.group
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn covariate<'p>(
        metric: &str,
        spec: &CovariateSpec,
        population: &'p Population,
    ) -> Result<&'p CovariateValues, ValidationError> {
        let values = population.covariates.get(&spec.name).ok_or_else(|| {
            ValidationError::model_fit(
                metric,
                format!(
                    "covariate '{}' is missing from the {} table",
                    spec.name, population.group
                ),
            )
        })?;
        let kind_matches = matches!(
            (spec.kind, values),
            (CovariateKind::Continuous, CovariateValues::Continuous(_))
                | (CovariateKind::Categorical, CovariateValues::Categorical(_))
        );
        if !kind_matches {
            return Err(ValidationError::model_fit(
                metric,
                format!("covariate '{}' does not have its declared kind", spec.name),
            ));
        }
        Ok(values)
    }

    pub(super) fn build_terms(
        metric: &str,
        covariates: &[CovariateSpec],
        fitting: &[&Population],
    ) -> Result<(Vec<DesignTerm>, BTreeMap<String, String>), ValidationError> {
        let mut terms = vec![DesignTerm::Intercept];
        let mut baselines = BTreeMap::new();
        for spec in covariates.iter().filter(|s| s.kind == CovariateKind::Continuous) {
            terms.push(DesignTerm::Continuous {
                covariate: spec.name.clone(),
            });
        }
        for spec in covariates.iter().filter(|s| s.kind == CovariateKind::Categorical) {
            let mut levels = BTreeSet::new();
            for population in fitting {
                if let CovariateValues::Categorical(labels) = covariate(metric, spec, population)? {
                    levels.extend(labels.iter().cloned());
                }
            }
            let mut levels = levels.into_iter();
            // The first sorted level is the baseline and gets no column.
            if let Some(baseline) = levels.next() {
                baselines.insert(spec.name.clone(), baseline);
            }
            for level in levels {
                terms.push(DesignTerm::Level {
                    covariate: spec.name.clone(),
                    level,
                });
            }
        }
        Ok((terms, baselines))
    }

    pub(super) fn design_matrix(
        metric: &str,
        terms: &[DesignTerm],
        population: &Population,
    ) -> Result<Array2<f64>, ValidationError> {
        let n = population.len();
        let mut x = Array2::zeros((n, terms.len()));
        for (j, term) in terms.iter().enumerate() {
            match term {
                DesignTerm::Intercept => x.column_mut(j).fill(1.0),
                DesignTerm::Continuous { covariate } => match population.covariates.get(covariate) {
                    Some(CovariateValues::Continuous(values)) => x.column_mut(j).assign(values),
                    _ => {
                        return Err(ValidationError::model_fit(
                            metric,
                            format!(
                                "continuous covariate '{covariate}' is unavailable in the {} table",
                                population.group
                            ),
                        ));
                    }
                },
                DesignTerm::Level { covariate, level } => match population.covariates.get(covariate) {
                    Some(CovariateValues::Categorical(labels)) => {
                        for (i, label) in labels.iter().enumerate() {
                            if label == level {
                                x[(i, j)] = 1.0;
                            }
                        }
                    }
                    _ => {
                        return Err(ValidationError::model_fit(
                            metric,
                            format!(
                                "categorical covariate '{covariate}' is unavailable in the {} table",
                                population.group
                            ),
                        ));
                    }
                },
            }
        }
        Ok(x)
    }

    /// A level never seen while fitting has no coefficient; compensating it would
    /// silently treat it as the baseline.
    pub(super) fn check_known_levels(
        metric: &str,
        terms: &[DesignTerm],
        baselines: &BTreeMap<String, String>,
        population: &Population,
    ) -> Result<(), ValidationError> {
        for (covariate, baseline) in baselines {
            let Some(CovariateValues::Categorical(labels)) = population.covariates.get(covariate)
            else {
                continue;
            };
            let unseen = labels.iter().find(|label| {
                *label != baseline
                    && !terms.iter().any(|term| {
                        matches!(term, DesignTerm::Level { covariate: c, level } if c == covariate && level == *label)
                    })
            });
            if let Some(label) = unseen {
                return Err(ValidationError::model_fit(
                    metric,
                    format!(
                        "covariate '{covariate}' has level '{label}' in the {} table, which was not present when the model was fit",
                        population.group
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Test rows of every block, followed by the retest rows of subjects that have
    /// one when `include_retest` is set. Returns the stacked design and response and
    /// the (test row, retest row) index pairs.
    pub(super) fn stack_rows(
        blocks: &[(Array2<f64>, &MetricValues)],
        include_retest: bool,
    ) -> (Array2<f64>, Array1<f64>, Vec<(usize, usize)>) {
        let p = blocks.first().map_or(0, |(x, _)| x.ncols());
        let mut rows: Vec<f64> = Vec::new();
        let mut response: Vec<f64> = Vec::new();
        let mut test_offsets = Vec::with_capacity(blocks.len());

        for (x, values) in blocks {
            test_offsets.push(response.len());
            for (i, row) in x.rows().into_iter().enumerate() {
                rows.extend(row.iter());
                response.push(values.test[i]);
            }
        }

        let mut pairs = Vec::new();
        if include_retest {
            for ((x, values), &offset) in blocks.iter().zip(&test_offsets) {
                if let Some(retest) = &values.retest {
                    for (i, row) in x.rows().into_iter().enumerate() {
                        if retest[i].is_finite() {
                            pairs.push((offset + i, response.len()));
                            rows.extend(row.iter());
                            response.push(retest[i]);
                        }
                    }
                }
            }
        }

        let n = response.len();
        let x = Array2::from_shape_vec((n, p), rows)
            .unwrap_or_else(|_| Array2::zeros((0, p)));
        (x, Array1::from_vec(response), pairs)
    }

    /// Solves the normal equations X'X β = X'y through a Cholesky factorization.
    pub(super) fn least_squares(
        metric: &str,
        x: &Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<Array1<f64>, ValidationError> {
        let xtx = x.t().dot(x);
        let xty = x.t().dot(y);
        let factor = xtx.cholesky(Side::Lower).map_err(|e| {
            ValidationError::model_fit(metric, format!("the covariate design is rank-deficient ({e})"))
        })?;

        let pivots = factor.diag();
        let max_pivot = pivots.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
        let min_pivot = pivots.iter().fold(f64::INFINITY, |acc, &v| acc.min(v.abs()));
        if !(min_pivot > RANK_TOLERANCE * max_pivot) {
            return Err(ValidationError::model_fit(
                metric,
                format!(
                    "the covariate design is rank-deficient (pivot ratio {:.3e})",
                    min_pivot / max_pivot
                ),
            ));
        }

        let beta = factor.solve_vec(&xty);
        if beta.iter().any(|b| !b.is_finite()) {
            return Err(ValidationError::model_fit(
                metric,
                "least-squares coefficients are not finite",
            ));
        }
        Ok(beta)
    }

    pub(super) fn variance_components(
        residuals: &Array1<f64>,
        pairs: &[(usize, usize)],
    ) -> Option<VarianceComponents> {
        let m = pairs.len();
        if m < 2 {
            return None;
        }
        let subject_means: Vec<f64> = pairs
            .iter()
            .map(|&(a, b)| 0.5 * (residuals[a] + residuals[b]))
            .collect();
        let overall = stats::mean(&subject_means)?;
        let ms_between = 2.0
            * subject_means
                .iter()
                .map(|&v| (v - overall) * (v - overall))
                .sum::<f64>()
            / (m - 1) as f64;
        let ms_within = pairs
            .iter()
            .map(|&(a, b)| {
                let d = residuals[a] - residuals[b];
                0.5 * d * d
            })
            .sum::<f64>()
            / m as f64;
        Some(VarianceComponents {
            between_subject: ((ms_between - ms_within) / 2.0).max(0.0),
            within_subject: ms_within,
            paired_subjects: m,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Group;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn population(
        group: Group,
        age: Array1<f64>,
        gender: Vec<&str>,
        metric: Array1<f64>,
        retest: Option<Array1<f64>>,
    ) -> Population {
        let mut population = Population::new(group, age.len());
        population.insert_covariate("age", CovariateValues::Continuous(age));
        population.insert_covariate(
            "gender",
            CovariateValues::Categorical(gender.into_iter().map(String::from).collect()),
        );
        population.insert_metric("reach", MetricValues::new(metric, retest));
        population
    }

    fn covariates() -> Vec<CovariateSpec> {
        vec![
            CovariateSpec::continuous("age"),
            CovariateSpec::categorical("gender"),
        ]
    }

    #[test]
    fn recovers_exact_linear_confounds() {
        let age = array![20.0, 30.0, 40.0, 50.0, 60.0, 70.0];
        let gender = vec!["f", "m", "f", "m", "f", "m"];
        let reach = age.mapv(|a| 3.0 + 0.5 * a) + array![0.0, 2.0, 0.0, 2.0, 0.0, 2.0];
        let reference = population(Group::Reference, age.clone(), gender.clone(), reach, None);
        let impaired = population(Group::Impaired, age.clone(), gender, age.mapv(|a| 0.5 * a), None);

        let specs = covariates();
        let corrector = ConfoundCorrector::new(&specs, &PipelineConfig::default());
        let model = corrector.fit_metric("reach", &reference, &impaired).unwrap();

        assert_eq!(
            model.terms.iter().map(DesignTerm::name).collect::<Vec<_>>(),
            vec!["intercept", "age", "gender[m]"]
        );
        assert_abs_diff_eq!(model.coefficients[0], 3.0, epsilon = 1e-8);
        assert_abs_diff_eq!(model.coefficients[1], 0.5, epsilon = 1e-10);
        assert_abs_diff_eq!(model.coefficients[2], 2.0, epsilon = 1e-8);
        assert_abs_diff_eq!(model.residual_variance, 0.0, epsilon = 1e-12);

        let compensated = model.compensate(&reference, false).unwrap();
        for value in compensated.test.iter() {
            assert_abs_diff_eq!(*value, 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn residuals_are_orthogonal_to_covariates_on_fit_population() {
        let age = array![21.0, 35.0, 44.0, 58.0, 63.0, 27.0, 49.0, 71.0];
        let gender = vec!["f", "m", "m", "f", "f", "m", "f", "m"];
        let reach = array![10.2, 13.1, 15.9, 16.0, 18.3, 11.7, 15.0, 20.4];
        let reference = population(Group::Reference, age.clone(), gender.clone(), reach, None);
        let impaired = reference.clone();

        let specs = covariates();
        let corrector = ConfoundCorrector::new(&specs, &PipelineConfig::default());
        let correction = corrector.correct_metric("reach", &reference, &impaired).unwrap();
        let residuals = correction.reference.test.to_vec();

        let r_age = stats::pearson(&residuals, age.as_slice().unwrap()).unwrap();
        assert_abs_diff_eq!(r_age, 0.0, epsilon = 1e-9);
        let male: Vec<f64> = gender.iter().map(|g| if *g == "m" { 1.0 } else { 0.0 }).collect();
        let r_gender = stats::pearson(&residuals, &male).unwrap();
        assert_abs_diff_eq!(r_gender, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn pooled_fit_is_orthogonal_over_both_populations() {
        let reference = population(
            Group::Reference,
            array![21.0, 35.0, 44.0, 58.0, 63.0, 27.0],
            vec!["f", "m", "m", "f", "f", "m"],
            array![10.2, 13.1, 15.9, 16.0, 18.3, 11.7],
            None,
        );
        let impaired = population(
            Group::Impaired,
            array![49.0, 71.0, 66.0, 52.0, 74.0, 59.0],
            vec!["f", "m", "f", "m", "m", "f"],
            array![17.9, 24.4, 21.0, 20.1, 25.2, 19.3],
            None,
        );
        let config = PipelineConfig {
            confound_fit: ConfoundFit::Pooled,
            ..PipelineConfig::default()
        };
        let specs = covariates();
        let corrector = ConfoundCorrector::new(&specs, &config);
        let correction = corrector.correct_metric("reach", &reference, &impaired).unwrap();
        assert_eq!(correction.model.fit_population, ConfoundFit::Pooled);
        assert_eq!(correction.model.n_observations, 12);

        let residuals: Vec<f64> = correction
            .reference
            .test
            .iter()
            .chain(correction.impaired.test.iter())
            .copied()
            .collect();
        let mut age = Vec::new();
        let mut male = Vec::new();
        for population in [&reference, &impaired] {
            match (&population.covariates["age"], &population.covariates["gender"]) {
                (CovariateValues::Continuous(a), CovariateValues::Categorical(g)) => {
                    age.extend(a.iter().copied());
                    male.extend(g.iter().map(|level| if level == "m" { 1.0 } else { 0.0 }));
                }
                other => panic!("unexpected covariate types {:?}", other),
            }
        }
        assert_abs_diff_eq!(residuals.iter().sum::<f64>(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats::pearson(&residuals, &age).unwrap(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats::pearson(&residuals, &male).unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn retained_grand_mean_shifts_every_compensated_value() {
        let age = array![21.0, 35.0, 44.0, 58.0, 63.0, 27.0, 49.0, 71.0];
        let gender = vec!["f", "m", "m", "f", "f", "m", "f", "m"];
        let reach = array![10.2, 13.1, 15.9, 16.0, 18.3, 11.7, 15.0, 20.4];
        let retest = array![10.0, f64::NAN, 16.3, 15.8, 18.0, 12.1, 15.2, 20.0];
        let reference = population(Group::Reference, age, gender, reach.clone(), Some(retest));
        let impaired = reference.clone();

        let specs = covariates();
        let centered = ConfoundCorrector::new(&specs, &PipelineConfig::default())
            .correct_metric("reach", &reference, &impaired)
            .unwrap();
        let retained_config = PipelineConfig {
            retain_grand_mean: true,
            ..PipelineConfig::default()
        };
        let retained = ConfoundCorrector::new(&specs, &retained_config)
            .correct_metric("reach", &reference, &impaired)
            .unwrap();

        let grand_mean = retained.model.grand_mean;
        // An OLS fit with an intercept reproduces the response mean.
        assert_abs_diff_eq!(grand_mean, reach.mean().unwrap(), epsilon = 1e-9);
        for (kept, plain) in retained.reference.test.iter().zip(centered.reference.test.iter()) {
            assert_abs_diff_eq!(kept - plain, grand_mean, epsilon = 1e-9);
        }
        let kept_retest = retained.reference.retest.unwrap();
        let plain_retest = centered.reference.retest.unwrap();
        assert!(kept_retest[1].is_nan());
        for i in [0, 2, 3, 4, 5, 6, 7] {
            assert_abs_diff_eq!(kept_retest[i] - plain_retest[i], grand_mean, epsilon = 1e-9);
        }
    }

    #[test]
    fn retest_uses_the_test_model() {
        let age = array![20.0, 30.0, 40.0, 50.0];
        let gender = vec!["f", "m", "f", "m"];
        let reach = array![11.0, 16.5, 22.0, 25.0];
        let retest = array![12.0, f64::NAN, 21.0, 26.0];
        let reference = population(Group::Reference, age, gender, reach.clone(), Some(retest.clone()));

        let specs = vec![CovariateSpec::continuous("age")];
        let corrector = ConfoundCorrector::new(&specs, &PipelineConfig::default());
        let model = corrector.fit_metric("reach", &reference, &reference).unwrap();
        let expected = model.expected(&reference).unwrap();
        let compensated = model.compensate(&reference, false).unwrap();
        let compensated_retest = compensated.retest.unwrap();

        assert!(compensated_retest[1].is_nan());
        for i in [0, 2, 3] {
            assert_abs_diff_eq!(compensated_retest[i], retest[i] - expected[i], epsilon = 1e-10);
            assert_abs_diff_eq!(compensated.test[i], reach[i] - expected[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn zero_variance_covariate_is_a_fit_error() {
        let age = array![40.0, 40.0, 40.0, 40.0];
        let gender = vec!["f", "m", "f", "m"];
        let reference = population(Group::Reference, age, gender, array![1.0, 2.0, 3.0, 4.0], None);
        let specs = covariates();
        let corrector = ConfoundCorrector::new(&specs, &PipelineConfig::default());
        match corrector.fit_metric("reach", &reference, &reference) {
            Err(ValidationError::ModelFit { metric, reason }) => {
                assert_eq!(metric, "reach");
                assert!(reason.contains("age"), "{reason}");
            }
            other => panic!("Expected ModelFit, got {:?}", other),
        }
    }

    #[test]
    fn too_few_subjects_is_a_fit_error() {
        let age = array![20.0, 30.0];
        let gender = vec!["f", "m"];
        let reference = population(Group::Reference, age, gender, array![1.0, 2.0], None);
        let specs = covariates();
        let corrector = ConfoundCorrector::new(&specs, &PipelineConfig::default());
        assert!(matches!(
            corrector.fit_metric("reach", &reference, &reference),
            Err(ValidationError::ModelFit { .. })
        ));
    }

    #[test]
    fn unseen_levels_in_applied_population_are_rejected() {
        let age = array![20.0, 30.0, 40.0, 50.0, 60.0];
        let reference = population(
            Group::Reference,
            age.clone(),
            vec!["f", "m", "f", "m", "f"],
            array![1.0, 2.5, 2.9, 4.2, 5.1],
            None,
        );
        let impaired = population(
            Group::Impaired,
            age,
            vec!["f", "x", "y", "m", "f"],
            array![1.0, 2.0, 3.0, 4.0, 5.0],
            None,
        );
        let specs = covariates();
        let corrector = ConfoundCorrector::new(&specs, &PipelineConfig::default());
        assert!(matches!(
            corrector.correct_metric("reach", &reference, &impaired),
            Err(ValidationError::ModelFit { .. })
        ));
    }

    #[test]
    fn random_intercept_estimates_subject_variance() {
        let age = array![20.0, 30.0, 40.0, 50.0, 60.0, 70.0];
        let gender = vec!["f", "m", "f", "m", "f", "m"];
        let subject_effect = array![1.0, -1.0, 0.5, -0.5, 1.5, -1.5];
        let reach = age.mapv(|a| 0.2 * a) + &subject_effect + array![0.1, -0.1, 0.1, -0.1, 0.1, -0.1];
        let retest = age.mapv(|a| 0.2 * a) + &subject_effect - array![0.1, -0.1, 0.1, -0.1, 0.1, -0.1];
        let reference = population(Group::Reference, age, gender, reach, Some(retest));

        let config = PipelineConfig {
            random_intercept: true,
            ..PipelineConfig::default()
        };
        let specs = vec![CovariateSpec::continuous("age")];
        let corrector = ConfoundCorrector::new(&specs, &config);
        let model = corrector.fit_metric("reach", &reference, &reference).unwrap();

        assert_eq!(model.n_observations, 12);
        let components = model.variance_components.unwrap();
        assert_eq!(components.paired_subjects, 6);
        assert!(components.between_subject > components.within_subject);
        assert!(components.intraclass_correlation() > 0.9);
    }

    #[test]
    fn correct_all_fills_both_populations() {
        let age = array![20.0, 30.0, 40.0, 50.0, 60.0];
        let gender = vec!["f", "m", "f", "m", "f"];
        let mut reference = population(
            Group::Reference,
            age.clone(),
            gender.clone(),
            array![1.0, 2.5, 2.9, 4.2, 5.1],
            None,
        );
        let mut impaired = population(Group::Impaired, age, gender, array![3.0, 4.4, 5.1, 6.0, 7.3], None);
        let specs = covariates();
        let corrector = ConfoundCorrector::new(&specs, &PipelineConfig::default());
        let models = corrector
            .correct_all(&["reach".to_string()], &mut reference, &mut impaired, true)
            .unwrap();

        assert_eq!(models.len(), 1);
        assert!(reference.compensated.contains_key("reach"));
        assert!(impaired.compensated.contains_key("reach"));
        // Raw columns are preserved.
        assert_abs_diff_eq!(reference.raw["reach"].test[1], 2.5, epsilon = 1e-12);
    }
}
