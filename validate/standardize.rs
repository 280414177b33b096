//! Reference standardization: `z = (x - mean_ref) / sd_ref` for one metric-variant
//! column, with the location and spread taken from the reference population only.

use crate::data::{ColumnRef, MetricVariant, Population};
use crate::error::{SchemaError, ValidationError};
use crate::stats;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A column needs this many finite reference values for a sample SD.
const MIN_SCALE_VALUES: usize = 2;

/// Location and spread used to standardize one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceScale {
    pub column: String,
    pub mean: f64,
    pub sd: f64,
}

impl ReferenceScale {
    /// Computes the reference mean and sample SD of `column`, skipping `NaN` entries.
    pub fn from_reference(reference: &Population, column: &ColumnRef) -> Result<Self, ValidationError> {
        let name = column.to_string();
        let values = reference.column(column).ok_or_else(|| SchemaError::MissingColumn {
            column: name.clone(),
            population: reference.group.to_string(),
        })?;
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let mean = stats::mean(&finite);
        let sd = stats::sample_sd(&finite);
        match (mean, sd) {
            (Some(mean), Some(sd)) if sd > 0.0 && sd.is_finite() => Ok(Self {
                column: name,
                mean,
                sd,
            }),
            (_, sd) => Err(ValidationError::DegenerateScale {
                column: name,
                population: reference.group.to_string(),
                sd: sd.unwrap_or(0.0),
            }),
        }
    }

    /// Rescales the column in place. `NaN` entries stay `NaN`.
    pub fn apply(&self, population: &mut Population, column: &ColumnRef) -> Result<(), ValidationError> {
        if self.apply_if_present(population, column) {
            Ok(())
        } else {
            Err(SchemaError::MissingColumn {
                column: column.to_string(),
                population: population.group.to_string(),
            }
            .into())
        }
    }

    /// Rescales the column when `population` has it and reports whether it did.
    pub fn apply_if_present(&self, population: &mut Population, column: &ColumnRef) -> bool {
        match population.column_mut(column) {
            Some(values) => {
                values.mapv_inplace(|v| (v - self.mean) / self.sd);
                true
            }
            None => false,
        }
    }
}

/// Standardizes one column of both populations against the reference statistics and
/// returns the `(mean, sd)` that were used.
pub fn standardize(
    reference: &mut Population,
    impaired: &mut Population,
    column: &ColumnRef,
) -> Result<(f64, f64), ValidationError> {
    let scale = ReferenceScale::from_reference(reference, column)?;
    scale.apply(reference, column)?;
    scale.apply(impaired, column)?;
    Ok((scale.mean, scale.sd))
}

/// Scales for the compensated columns of `metric`.
///
/// The test column is always scaled from the reference. A retest column held by
/// either population gets its own reference scale when at least two reference
/// subjects were retested, and borrows the test column's scale otherwise.
pub fn metric_scales(
    reference: &Population,
    impaired: &Population,
    metric: &str,
) -> Result<Vec<(ColumnRef, ReferenceScale)>, ValidationError> {
    let test = ColumnRef::new(metric, MetricVariant::Compensated);
    let test_scale = ReferenceScale::from_reference(reference, &test)?;

    let retest = ColumnRef::new(metric, MetricVariant::CompensatedRetest);
    let retest_scale = if reference.column(&retest).is_some() || impaired.column(&retest).is_some() {
        let retested = reference
            .column(&retest)
            .map_or(0, |values| values.iter().filter(|v| v.is_finite()).count());
        if retested >= MIN_SCALE_VALUES {
            Some(ReferenceScale::from_reference(reference, &retest)?)
        } else {
            log::debug!(
                "{retested} reference subjects have '{retest}'; scaling it like '{test}'"
            );
            Some(ReferenceScale {
                column: retest.to_string(),
                ..test_scale.clone()
            })
        }
    } else {
        None
    };

    let mut scales = vec![(test, test_scale)];
    scales.extend(retest_scale.map(|scale| (retest, scale)));
    Ok(scales)
}

/// Standardizes every compensated column of every metric.
///
/// Scales are computed per metric (in parallel when requested) from the untouched
/// reference columns, then applied to whichever populations hold each column once
/// all of them succeeded.
pub fn standardize_all(
    metrics: &[String],
    reference: &mut Population,
    impaired: &mut Population,
    parallel: bool,
) -> Result<Vec<ReferenceScale>, ValidationError> {
    let planned: Vec<Vec<(ColumnRef, ReferenceScale)>> = {
        let reference_view: &Population = reference;
        let impaired_view: &Population = impaired;
        if parallel {
            metrics
                .par_iter()
                .map(|metric| metric_scales(reference_view, impaired_view, metric))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            metrics
                .iter()
                .map(|metric| metric_scales(reference_view, impaired_view, metric))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let mut scales = Vec::new();
    for (column, scale) in planned.into_iter().flatten() {
        let in_reference = scale.apply_if_present(reference, &column);
        let in_impaired = scale.apply_if_present(impaired, &column);
        log::debug!(
            "Standardized '{}' with reference mean {:.4} and SD {:.4} (reference: {in_reference}, impaired: {in_impaired})",
            scale.column,
            scale.mean,
            scale.sd
        );
        scales.push(scale);
    }
    Ok(scales)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Group, MetricValues};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn compensated(group: Group, test: Array1<f64>, retest: Option<Array1<f64>>) -> Population {
        let mut population = Population::new(group, test.len());
        population.insert_metric("grip", MetricValues::new(test.clone(), retest.clone()));
        population
            .compensated
            .insert("grip".to_string(), MetricValues::new(test, retest));
        population
    }

    #[test]
    fn reference_becomes_unit_scale() {
        let mut reference = compensated(Group::Reference, array![2.0, 4.0, 6.0, 8.0], None);
        let mut impaired = compensated(Group::Impaired, array![10.0, 12.0], None);
        let column = ColumnRef::new("grip", MetricVariant::Compensated);
        let (mean, sd) = standardize(&mut reference, &mut impaired, &column).unwrap();

        assert_abs_diff_eq!(mean, 5.0, epsilon = 1e-12);
        let z = reference.column(&column).unwrap().to_vec();
        assert_abs_diff_eq!(stats::mean(&z).unwrap(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats::sample_sd(&z).unwrap(), 1.0, epsilon = 1e-12);

        let impaired_z = impaired.column(&column).unwrap();
        assert_abs_diff_eq!(impaired_z[0], (10.0 - 5.0) / sd, epsilon = 1e-12);
        // Raw values are not touched.
        assert_abs_diff_eq!(reference.raw["grip"].test[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_retest_entries_are_skipped() {
        let retest = array![1.0, f64::NAN, 3.0];
        let mut reference = compensated(Group::Reference, array![1.0, 2.0, 3.0], Some(retest));
        let mut impaired = compensated(Group::Impaired, array![1.0], Some(array![f64::NAN]));
        let column = ColumnRef::new("grip", MetricVariant::CompensatedRetest);
        let (mean, sd) = standardize(&mut reference, &mut impaired, &column).unwrap();

        assert_abs_diff_eq!(mean, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sd, 2.0_f64.sqrt(), epsilon = 1e-12);
        let z = reference.column(&column).unwrap();
        assert!(z[1].is_nan());
        assert!(impaired.column(&column).unwrap()[0].is_nan());
    }

    #[test]
    fn constant_reference_column_is_degenerate() {
        let mut reference = compensated(Group::Reference, array![3.0, 3.0, 3.0], None);
        let mut impaired = compensated(Group::Impaired, array![1.0, 2.0], None);
        let column = ColumnRef::new("grip", MetricVariant::Compensated);
        match standardize(&mut reference, &mut impaired, &column) {
            Err(ValidationError::DegenerateScale { column, population, .. }) => {
                assert_eq!(column, "grip_compensated");
                assert_eq!(population, "reference");
            }
            other => panic!("Expected DegenerateScale, got {:?}", other),
        }
    }

    #[test]
    fn standardize_all_covers_retest_columns() {
        let mut reference = compensated(
            Group::Reference,
            array![1.0, 2.0, 3.0, 4.0],
            Some(array![1.5, 2.5, 2.0, 5.0]),
        );
        let mut impaired = compensated(Group::Impaired, array![6.0, 7.0], Some(array![6.5, 7.5]));
        let scales =
            standardize_all(&["grip".to_string()], &mut reference, &mut impaired, false).unwrap();

        assert_eq!(scales.len(), 2);
        assert_eq!(scales[1].column, "grip_retest_compensated");
        let retest = reference
            .column(&ColumnRef::new("grip", MetricVariant::CompensatedRetest))
            .unwrap()
            .to_vec();
        assert_abs_diff_eq!(stats::mean(&retest).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn retest_held_only_by_reference_is_scaled_in_reference_only() {
        let mut reference = compensated(
            Group::Reference,
            array![1.0, 2.0, 3.0, 4.0],
            Some(array![1.5, 2.5, 2.0, 5.0]),
        );
        let mut impaired = compensated(Group::Impaired, array![6.0, 7.0], None);
        let scales =
            standardize_all(&["grip".to_string()], &mut reference, &mut impaired, false).unwrap();

        assert_eq!(scales.len(), 2);
        let retest = ColumnRef::new("grip", MetricVariant::CompensatedRetest);
        assert!(impaired.column(&retest).is_none());
        let z = reference.column(&retest).unwrap().to_vec();
        assert_abs_diff_eq!(stats::mean(&z).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn retest_held_only_by_impaired_borrows_the_test_scale() {
        let mut reference = compensated(Group::Reference, array![2.0, 4.0, 6.0, 8.0], None);
        let mut impaired = compensated(Group::Impaired, array![10.0, 12.0], Some(array![11.0, 13.0]));
        let scales =
            standardize_all(&["grip".to_string()], &mut reference, &mut impaired, false).unwrap();

        assert_eq!(scales.len(), 2);
        assert_eq!(scales[1].column, "grip_retest_compensated");
        assert_abs_diff_eq!(scales[1].mean, scales[0].mean, epsilon = 1e-12);
        assert_abs_diff_eq!(scales[1].sd, scales[0].sd, epsilon = 1e-12);
        let retest = impaired
            .column(&ColumnRef::new("grip", MetricVariant::CompensatedRetest))
            .unwrap();
        assert_abs_diff_eq!(retest[0], (11.0 - 5.0) / scales[0].sd, epsilon = 1e-12);
    }

    #[test]
    fn blank_reference_retest_is_not_degenerate() {
        let blank = array![f64::NAN, f64::NAN, f64::NAN];
        let mut reference = compensated(Group::Reference, array![1.0, 2.0, 4.0], Some(blank));
        let mut impaired = compensated(Group::Impaired, array![5.0], Some(array![f64::NAN]));
        let scales =
            standardize_all(&["grip".to_string()], &mut reference, &mut impaired, true).unwrap();

        assert_eq!(scales.len(), 2);
        let retest = ColumnRef::new("grip", MetricVariant::CompensatedRetest);
        assert!(reference.column(&retest).unwrap().iter().all(|v| v.is_nan()));
    }
}
