//! Synthetic reference and impaired populations for demonstrations, tests, and
//! benchmarks.
//!
//! Every metric follows `age_effect * age + gender_effect * [male] + shift * [impaired]
//! + trait + error`, where `trait` is a stable subject effect shared by test and
//! retest and `error` is drawn independently for each administration. The random
//! source is always supplied by the caller.

use crate::data::{CovariateSpec, CovariateValues, Group, MetricValues, Population, Schema};
use crate::error::ValidationError;
use ndarray::Array1;
use rand::Rng;
use rand_distr::{Distribution, Normal};

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticParams {
    pub subjects_per_group: usize,
    pub metrics: usize,
    pub age_mean: f64,
    pub age_sd: f64,
    pub age_effect: f64,
    /// Effect of the `m` gender level; `None` leaves gender out of the data and schema.
    pub gender_effect: Option<f64>,
    /// Mean offset of impaired subjects.
    pub impairment_shift: f64,
    /// SD of the stable subject effect.
    pub trait_sd: f64,
    /// SD of the per-administration measurement error.
    pub error_sd: f64,
    /// Probability that a subject was retested.
    pub retest_probability: f64,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            subjects_per_group: 50,
            metrics: 2,
            age_mean: 60.0,
            age_sd: 12.0,
            age_effect: 0.5,
            gender_effect: Some(0.5),
            impairment_shift: 2.0,
            trait_sd: 1.0,
            error_sd: 0.3,
            retest_probability: 1.0,
        }
    }
}

pub struct SyntheticData {
    pub schema: Schema,
    pub reference: Population,
    pub impaired: Population,
}

pub fn metric_names(count: usize) -> Vec<String> {
    (1..=count).map(|j| format!("metric_{j}")).collect()
}

fn normal(mean: f64, sd: f64, what: &str) -> Result<Normal<f64>, ValidationError> {
    Normal::new(mean, sd)
        .map_err(|e| ValidationError::Config(format!("invalid {what} distribution: {e}")))
}

pub fn generate(params: &SyntheticParams, rng: &mut impl Rng) -> Result<SyntheticData, ValidationError> {
    if params.subjects_per_group < 2 || params.metrics == 0 {
        return Err(ValidationError::Config(format!(
            "synthetic data needs at least 2 subjects per group and 1 metric, got {} and {}",
            params.subjects_per_group, params.metrics
        )));
    }
    if !(0.0..=1.0).contains(&params.retest_probability) {
        return Err(ValidationError::Config(format!(
            "retest_probability must lie in [0, 1], got {}",
            params.retest_probability
        )));
    }

    let metrics = metric_names(params.metrics);
    let mut covariates = vec![CovariateSpec::continuous("age")];
    if params.gender_effect.is_some() {
        covariates.push(CovariateSpec::categorical("gender"));
    }
    let schema = Schema::new(metrics.clone(), covariates, Vec::new())?;

    let reference = generate_group(params, &metrics, Group::Reference, rng)?;
    let impaired = generate_group(params, &metrics, Group::Impaired, rng)?;
    log::debug!(
        "Generated {} synthetic subjects per group with {} metrics",
        params.subjects_per_group,
        params.metrics
    );
    Ok(SyntheticData {
        schema,
        reference,
        impaired,
    })
}

fn generate_group(
    params: &SyntheticParams,
    metrics: &[String],
    group: Group,
    rng: &mut impl Rng,
) -> Result<Population, ValidationError> {
    let n = params.subjects_per_group;
    let age_dist = normal(params.age_mean, params.age_sd, "age")?;
    let trait_dist = normal(0.0, params.trait_sd, "subject effect")?;
    let error_dist = normal(0.0, params.error_sd, "measurement error")?;

    let prefix = match group {
        Group::Reference => "ref",
        Group::Impaired => "imp",
    };
    let mut population = Population::with_subject_ids(
        group,
        (1..=n).map(|i| format!("{prefix}{i:03}")).collect(),
    );

    let age: Array1<f64> = (0..n).map(|_| age_dist.sample(rng)).collect();
    // Alternating levels keep both genders present in every group.
    let gender: Vec<String> = (0..n)
        .map(|i| if i % 2 == 0 { "f" } else { "m" }.to_string())
        .collect();
    let shift = match group {
        Group::Reference => 0.0,
        Group::Impaired => params.impairment_shift,
    };

    for metric in metrics {
        let mut test = Array1::zeros(n);
        let mut retest = Array1::zeros(n);
        for i in 0..n {
            let gender_term = match params.gender_effect {
                Some(effect) if gender[i] == "m" => effect,
                _ => 0.0,
            };
            let expected = params.age_effect * age[i] + gender_term + shift + trait_dist.sample(rng);
            test[i] = expected + error_dist.sample(rng);
            retest[i] = if rng.gen_bool(params.retest_probability) {
                expected + error_dist.sample(rng)
            } else {
                f64::NAN
            };
        }
        population.insert_metric(metric, MetricValues::new(test, Some(retest)));
    }

    population.insert_covariate("age", CovariateValues::Continuous(age));
    if params.gender_effect.is_some() {
        population.insert_covariate("gender", CovariateValues::Categorical(gender));
    }
    Ok(population)
}
