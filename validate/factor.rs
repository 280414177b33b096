//! # Factor Analysis
//!
//! Iterated principal-axis factoring of the pooled correlation matrix of compensated
//! metrics, with an optional Kaiser-normalized varimax rotation, plus the scree
//! sequence of the unreduced correlation matrix.
//!
//! Communalities start at the squared multiple correlations, are re-estimated from
//! the leading k eigenpairs of the reduced correlation matrix on every iteration, and
//! are clamped to [0, 1] so a Heywood case cannot produce a negative uniqueness.

use crate::config::{FactorCount, PipelineConfig, Rotation};
use crate::error::ValidationError;
use crate::faer_ndarray::eigh_descending;
use crate::stats;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Relative eigenvalue floor below which SMCs are not computed from R⁻¹.
const SMC_SINGULAR_FLOOR: f64 = 1e-12;
const VARIMAX_MAX_SWEEPS: usize = 1000;
const VARIMAX_TOLERANCE: f64 = 1e-10;

/// Eigenvalues of the correlation matrix, largest first, with explained variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scree {
    pub eigenvalues: Vec<f64>,
    pub proportions: Vec<f64>,
    pub cumulative: Vec<f64>,
}

impl Scree {
    pub fn from_eigenvalues(eigenvalues: &Array1<f64>) -> Self {
        let total: f64 = eigenvalues.iter().map(|v| v.max(0.0)).sum();
        let proportions: Vec<f64> = eigenvalues
            .iter()
            .map(|v| if total > 0.0 { v.max(0.0) / total } else { 0.0 })
            .collect();
        let cumulative = proportions
            .iter()
            .scan(0.0, |acc, p| {
                *acc += p;
                Some(*acc)
            })
            .collect();
        Self {
            eigenvalues: eigenvalues.to_vec(),
            proportions,
            cumulative,
        }
    }

    /// Number of eigenvalues above 1 (the Kaiser criterion).
    pub fn kaiser_count(&self) -> usize {
        self.eigenvalues.iter().filter(|&&v| v > 1.0).count()
    }
}

/// Extracted factor structure.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorModel {
    pub metrics: Vec<String>,
    /// metrics × factors.
    pub loadings: Array2<f64>,
    pub communalities: Array1<f64>,
    pub uniquenesses: Array1<f64>,
    pub iterations: usize,
    pub rotation: Rotation,
    pub scree: Scree,
}

impl FactorModel {
    pub fn n_factors(&self) -> usize {
        self.loadings.ncols()
    }

    /// Sum of squared loadings per factor.
    pub fn explained_variance(&self) -> Array1<f64> {
        self.loadings.mapv(|l| l * l).sum_axis(Axis(0))
    }
}

pub struct FactorAnalyzer {
    count: FactorCount,
    rotation: Rotation,
    max_iterations: usize,
    tolerance: f64,
}

impl FactorAnalyzer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            count: config.factor_count,
            rotation: config.rotation,
            max_iterations: config.max_factor_iterations,
            tolerance: config.factor_tolerance,
        }
    }

    /// Pooled correlation matrix of a subjects × metrics matrix.
    pub fn correlation(data: ArrayView2<f64>, metrics: &[String]) -> Result<Array2<f64>, ValidationError> {
        stats::correlation_matrix(data).map_err(|j| ValidationError::DegenerateScale {
            column: metrics[j].clone(),
            population: "pooled".to_string(),
            sd: 0.0,
        })
    }

    pub fn scree(data: ArrayView2<f64>, metrics: &[String]) -> Result<Scree, ValidationError> {
        let correlation = Self::correlation(data, metrics)?;
        let (values, _) = eigh_descending(&correlation)?;
        Ok(Scree::from_eigenvalues(&values))
    }

    /// Resolves the configured factor count against the scree; 1 ≤ k < p.
    pub fn resolve_count(&self, scree: &Scree) -> Result<usize, ValidationError> {
        let p = scree.eigenvalues.len();
        let k = match self.count {
            FactorCount::Fixed(k) => k,
            FactorCount::Kaiser => scree.kaiser_count().max(1),
        };
        if k == 0 || k >= p {
            return Err(ValidationError::Config(format!(
                "factor count {k} is outside 1..{p} for {p} metrics"
            )));
        }
        Ok(k)
    }

    pub fn fit(&self, data: ArrayView2<f64>, metrics: &[String]) -> Result<FactorModel, ValidationError> {
        let correlation = Self::correlation(data, metrics)?;
        let (values, _) = eigh_descending(&correlation)?;
        let scree = Scree::from_eigenvalues(&values);
        let k = self.resolve_count(&scree)?;

        let (unrotated, communalities, iterations) = self.principal_axis(&correlation, k)?;
        let loadings = match self.rotation {
            Rotation::None => orient(unrotated),
            Rotation::Varimax => orient(varimax(&unrotated)),
        };
        let uniquenesses = communalities.mapv(|h| 1.0 - h);

        log::info!(
            "Extracted {k} factor(s) from {} metrics in {iterations} iterations",
            metrics.len()
        );
        Ok(FactorModel {
            metrics: metrics.to_vec(),
            loadings,
            communalities,
            uniquenesses,
            iterations,
            rotation: self.rotation,
            scree,
        })
    }

    fn principal_axis(
        &self,
        correlation: &Array2<f64>,
        k: usize,
    ) -> Result<(Array2<f64>, Array1<f64>, usize), ValidationError> {
        let p = correlation.nrows();
        let mut communalities = initial_communalities(correlation)?;
        let mut last_change = f64::INFINITY;

        for iteration in 1..=self.max_iterations {
            let mut reduced = correlation.clone();
            for i in 0..p {
                reduced[(i, i)] = communalities[i];
            }
            let (values, vectors) = eigh_descending(&reduced)?;
            let mut loadings = Array2::zeros((p, k));
            for f in 0..k {
                let scale = values[f].max(0.0).sqrt();
                loadings
                    .column_mut(f)
                    .assign(&vectors.column(f).mapv(|v| v * scale));
            }
            let updated = loadings
                .mapv(|l: f64| l * l)
                .sum_axis(Axis(1))
                .mapv(|h| h.clamp(0.0, 1.0));
            last_change = updated
                .iter()
                .zip(communalities.iter())
                .fold(0.0_f64, |acc, (a, b)| acc.max((a - b).abs()));
            communalities = updated;
            log::debug!("PAF iteration {iteration}: max communality change {last_change:.3e}");
            if last_change < self.tolerance {
                return Ok((loadings, communalities, iteration));
            }
        }

        Err(ValidationError::NonConvergence {
            max_iterations: self.max_iterations,
            last_change,
        })
    }
}

/// Squared multiple correlations `1 - 1 / (R⁻¹)_ii`, or the largest absolute
/// off-diagonal correlation per metric when R is numerically singular.
fn initial_communalities(correlation: &Array2<f64>) -> Result<Array1<f64>, ValidationError> {
    let p = correlation.nrows();
    let (values, vectors) = eigh_descending(correlation)?;
    let largest = values[0];
    let smallest = values[p - 1];

    let smc = if smallest > SMC_SINGULAR_FLOOR * largest {
        let scaled = &vectors / &values.view().insert_axis(Axis(0));
        let inverse_diag: Array1<f64> = (0..p)
            .map(|i| scaled.row(i).dot(&vectors.row(i)))
            .collect();
        inverse_diag.mapv(|d| 1.0 - 1.0 / d)
    } else {
        log::warn!("Correlation matrix is near-singular; using max |r| as initial communalities");
        Array1::from_shape_fn(p, |i| {
            (0..p)
                .filter(|&j| j != i)
                .fold(0.0_f64, |acc, j| acc.max(correlation[(i, j)].abs()))
        })
    };
    Ok(smc.mapv(|h| h.clamp(0.0, 1.0)))
}

/// Kaiser-normalized varimax by successive pairwise planar rotations.
pub fn varimax(loadings: &Array2<f64>) -> Array2<f64> {
    let (p, k) = loadings.dim();
    if k < 2 {
        return loadings.clone();
    }
    let norms: Array1<f64> = loadings
        .mapv(|l| l * l)
        .sum_axis(Axis(1))
        .mapv(|h| if h > 0.0 { h.sqrt() } else { 1.0 });
    let mut x = loadings / &norms.view().insert_axis(Axis(1));
    let pf = p as f64;

    for sweep in 0..VARIMAX_MAX_SWEEPS {
        let mut max_angle = 0.0_f64;
        for a in 0..k {
            for b in (a + 1)..k {
                let (mut sum_u, mut sum_v, mut sum_c, mut sum_d) = (0.0, 0.0, 0.0, 0.0);
                for i in 0..p {
                    let (xa, xb) = (x[(i, a)], x[(i, b)]);
                    let u = xa * xa - xb * xb;
                    let v = 2.0 * xa * xb;
                    sum_u += u;
                    sum_v += v;
                    sum_c += u * u - v * v;
                    sum_d += 2.0 * u * v;
                }
                let numerator = sum_d - 2.0 * sum_u * sum_v / pf;
                let denominator = sum_c - (sum_u * sum_u - sum_v * sum_v) / pf;
                let phi = 0.25 * numerator.atan2(denominator);
                max_angle = max_angle.max(phi.abs());
                let (sin, cos) = phi.sin_cos();
                for i in 0..p {
                    let (xa, xb) = (x[(i, a)], x[(i, b)]);
                    x[(i, a)] = cos * xa + sin * xb;
                    x[(i, b)] = -sin * xa + cos * xb;
                }
            }
        }
        if max_angle < VARIMAX_TOLERANCE {
            log::debug!("Varimax converged after {} sweeps", sweep + 1);
            break;
        }
    }
    x * &norms.view().insert_axis(Axis(1))
}

/// Orders factors by explained variance and flips signs so every factor has a
/// non-negative loading sum.
fn orient(loadings: Array2<f64>) -> Array2<f64> {
    let k = loadings.ncols();
    let explained = loadings.mapv(|l| l * l).sum_axis(Axis(0));
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&i, &j| explained[j].total_cmp(&explained[i]));

    let mut oriented = Array2::zeros(loadings.dim());
    for (target, &source) in order.iter().enumerate() {
        let column = loadings.column(source);
        let sign = if column.sum() < 0.0 { -1.0 } else { 1.0 };
        oriented.column_mut(target).assign(&column.mapv(|l| sign * l));
    }
    oriented
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn names(p: usize) -> Vec<String> {
        (0..p).map(|j| format!("m{j}")).collect()
    }

    /// Metrics 0..3 load on one latent factor, 3..6 on another.
    fn two_factor_data(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut data = Array2::zeros((n, 6));
        for i in 0..n {
            let f1 = normal.sample(&mut rng);
            let f2 = normal.sample(&mut rng);
            for j in 0..6 {
                let latent = if j < 3 { f1 } else { f2 };
                data[(i, j)] = 0.8 * latent + 0.6 * normal.sample(&mut rng);
            }
        }
        data
    }

    fn config(count: FactorCount, rotation: Rotation) -> PipelineConfig {
        PipelineConfig {
            factor_count: count,
            rotation,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn scree_is_descending_and_sums_to_one() {
        let data = two_factor_data(500, 1);
        let scree = FactorAnalyzer::scree(data.view(), &names(6)).unwrap();
        for pair in scree.eigenvalues.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert_abs_diff_eq!(*scree.cumulative.last().unwrap(), 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(scree.eigenvalues.iter().sum::<f64>(), 6.0, epsilon = 1e-9);
        assert_eq!(scree.kaiser_count(), 2);
    }

    #[test]
    fn one_factor_loadings_are_recovered() {
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut data = Array2::zeros((3000, 4));
        for i in 0..3000 {
            let f = normal.sample(&mut rng);
            for j in 0..4 {
                data[(i, j)] = 0.8 * f + 0.6 * normal.sample(&mut rng);
            }
        }
        let analyzer = FactorAnalyzer::new(&config(FactorCount::Fixed(1), Rotation::Varimax));
        let model = analyzer.fit(data.view(), &names(4)).unwrap();
        for j in 0..4 {
            assert_abs_diff_eq!(model.loadings[(j, 0)], 0.8, epsilon = 0.06);
            assert_abs_diff_eq!(
                model.communalities[j] + model.uniquenesses[j],
                1.0,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn varimax_separates_simple_structure() {
        let data = two_factor_data(2000, 9);
        let analyzer = FactorAnalyzer::new(&config(FactorCount::Kaiser, Rotation::Varimax));
        let model = analyzer.fit(data.view(), &names(6)).unwrap();
        assert_eq!(model.n_factors(), 2);

        let block_of = |j: usize| {
            if model.loadings[(j, 0)].abs() > model.loadings[(j, 1)].abs() { 0 } else { 1 }
        };
        for j in 0..6 {
            let primary = block_of(j);
            assert!(model.loadings[(j, primary)].abs() > 0.6, "{:?}", model.loadings);
            assert!(model.loadings[(j, 1 - primary)].abs() < 0.2, "{:?}", model.loadings);
        }
        assert_eq!(block_of(0), block_of(2));
        assert_ne!(block_of(0), block_of(3));
    }

    #[test]
    fn loadings_respect_variance_bounds() {
        let data = two_factor_data(300, 4);
        for rotation in [Rotation::None, Rotation::Varimax] {
            let analyzer = FactorAnalyzer::new(&config(FactorCount::Fixed(2), rotation));
            let model = analyzer.fit(data.view(), &names(6)).unwrap();
            assert!(model.explained_variance().sum() <= 6.0 + 1e-9);
            assert!(model.communalities.iter().all(|&h| (0.0..=1.0).contains(&h)));
        }
    }

    #[test]
    fn rotation_preserves_communalities() {
        let data = two_factor_data(400, 12);
        let unrotated = FactorAnalyzer::new(&config(FactorCount::Fixed(2), Rotation::None))
            .fit(data.view(), &names(6))
            .unwrap();
        let rotated = varimax(&unrotated.loadings);
        let before = unrotated.loadings.mapv(|l| l * l).sum_axis(Axis(1));
        let after = rotated.mapv(|l| l * l).sum_axis(Axis(1));
        for j in 0..6 {
            assert_abs_diff_eq!(before[j], after[j], epsilon = 1e-10);
        }
    }

    #[test]
    fn exhausted_budget_is_non_convergence() {
        let data = two_factor_data(200, 2);
        let analyzer = FactorAnalyzer::new(&PipelineConfig {
            factor_count: FactorCount::Fixed(2),
            max_factor_iterations: 1,
            factor_tolerance: 1e-15,
            ..PipelineConfig::default()
        });
        match analyzer.fit(data.view(), &names(6)) {
            Err(ValidationError::NonConvergence { max_iterations, last_change }) => {
                assert_eq!(max_iterations, 1);
                assert!(last_change > 0.0);
            }
            other => panic!("Expected NonConvergence, got {:?}", other),
        }
    }

    #[test]
    fn factor_count_must_be_below_metric_count() {
        let data = two_factor_data(100, 3);
        let analyzer = FactorAnalyzer::new(&config(FactorCount::Fixed(6), Rotation::None));
        assert!(matches!(
            analyzer.fit(data.view(), &names(6)),
            Err(ValidationError::Config(_))
        ));
    }
}
