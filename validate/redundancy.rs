//! Inter-metric redundancy: partial correlations of every metric pair, controlling
//! for all remaining metrics, from the inverse of the pooled correlation matrix.

use crate::error::ValidationError;
use crate::faer_ndarray::eigh_descending;
use crate::stats;
use ndarray::{Array2, ArrayView2, Axis};

/// Eigenvector loadings at or above this share of the largest loading name a metric
/// as part of a detected linear dependency.
const INVOLVEMENT_SHARE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct PartialCorrelationMatrix {
    pub metrics: Vec<String>,
    /// Zero-order correlations the partials were derived from.
    pub correlation: Array2<f64>,
    pub partial: Array2<f64>,
}

impl PartialCorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.metrics.iter().position(|m| m == a)?;
        let j = self.metrics.iter().position(|m| m == b)?;
        Some(self.partial[(i, j)])
    }
}

/// Computes the partial-correlation matrix of a subjects × metrics matrix.
pub fn partial_correlations(
    data: ArrayView2<f64>,
    metrics: &[String],
    singular_tolerance: f64,
) -> Result<PartialCorrelationMatrix, ValidationError> {
    let (n, p) = data.dim();
    if n <= p {
        return Err(ValidationError::SingularCovariance {
            metrics: metrics.to_vec(),
            reason: format!("{n} subjects cannot support {p} metrics"),
        });
    }

    let correlation =
        stats::correlation_matrix(data).map_err(|j| ValidationError::SingularCovariance {
            metrics: vec![metrics[j].clone()],
            reason: "the metric has zero variance".to_string(),
        })?;

    let (values, vectors) = eigh_descending(&correlation)?;
    let largest = values[0];
    let smallest = values[p - 1];
    if !(smallest > singular_tolerance * largest) {
        let direction = vectors.column(p - 1);
        let peak = direction.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let involved = metrics
            .iter()
            .zip(direction.iter())
            .filter(|(_, v)| v.abs() >= INVOLVEMENT_SHARE * peak)
            .map(|(m, _)| m.clone())
            .collect();
        return Err(ValidationError::SingularCovariance {
            metrics: involved,
            reason: format!(
                "smallest eigenvalue {smallest:.3e} is below {singular_tolerance:.1e} of the largest ({largest:.3e})"
            ),
        });
    }

    // P = V diag(1/λ) V'
    let scaled = &vectors / &values.view().insert_axis(Axis(0));
    let precision = scaled.dot(&vectors.t());

    let mut partial = Array2::eye(p);
    for i in 0..p {
        for j in 0..i {
            let value = (-precision[(i, j)] / (precision[(i, i)] * precision[(j, j)]).sqrt())
                .clamp(-1.0, 1.0);
            partial[(i, j)] = value;
            partial[(j, i)] = value;
        }
    }

    log::debug!("Partial correlations computed for {p} metrics (condition {:.3e})", largest / smallest);

    Ok(PartialCorrelationMatrix {
        metrics: metrics.to_vec(),
        correlation,
        partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn names(p: usize) -> Vec<String> {
        (0..p).map(|j| format!("m{j}")).collect()
    }

    fn correlated_data(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Array2::zeros((n, 3));
        for i in 0..n {
            let shared: f64 = rng.gen_range(-1.0..1.0);
            let a: f64 = rng.gen_range(-1.0..1.0);
            let b: f64 = rng.gen_range(-1.0..1.0);
            data[(i, 0)] = shared + 0.3 * a;
            data[(i, 1)] = shared - 0.4 * b;
            data[(i, 2)] = a + b;
        }
        data
    }

    #[test]
    fn matches_closed_form_for_three_metrics() {
        let data = correlated_data(200, 7);
        let result = partial_correlations(data.view(), &names(3), 1e-10).unwrap();
        let r = &result.correlation;
        let expected = (r[(0, 1)] - r[(0, 2)] * r[(1, 2)])
            / ((1.0 - r[(0, 2)].powi(2)) * (1.0 - r[(1, 2)].powi(2))).sqrt();
        assert_abs_diff_eq!(result.partial[(0, 1)], expected, epsilon = 1e-9);
        assert_abs_diff_eq!(result.get("m1", "m0").unwrap(), expected, epsilon = 1e-9);
    }

    #[test]
    fn output_is_symmetric_with_unit_diagonal() {
        let data = correlated_data(100, 11);
        let result = partial_correlations(data.view(), &names(3), 1e-10).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(result.partial[(i, i)], 1.0, epsilon = 1e-12);
            for j in 0..3 {
                assert_abs_diff_eq!(result.partial[(i, j)], result.partial[(j, i)], epsilon = 1e-12);
                assert!((-1.0..=1.0).contains(&result.partial[(i, j)]));
            }
        }
    }

    #[test]
    fn linearly_dependent_metrics_are_named() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut data = Array2::zeros((40, 3));
        for i in 0..40 {
            let a: f64 = rng.gen_range(-2.0..2.0);
            data[(i, 0)] = a;
            data[(i, 1)] = 2.0 * a + 1.0;
            data[(i, 2)] = rng.gen_range(-2.0..2.0);
        }
        match partial_correlations(data.view(), &names(3), 1e-10) {
            Err(ValidationError::SingularCovariance { metrics, .. }) => {
                assert_eq!(metrics, vec!["m0".to_string(), "m1".to_string()]);
            }
            other => panic!("Expected SingularCovariance, got {:?}", other),
        }
    }

    #[test]
    fn too_few_subjects_is_singular() {
        let data = Array2::from_shape_fn((3, 3), |(i, j)| (i * 3 + j) as f64);
        assert!(matches!(
            partial_correlations(data.view(), &names(3), 1e-10),
            Err(ValidationError::SingularCovariance { .. })
        ));
    }
}
