//! Descriptive statistics shared by the scoring, standardization, and redundancy stages.
//!
//! All functions take plain slices or array views and return `None` when the statistic
//! is undefined for the input (too few values, zero variance), leaving it to the caller
//! to turn that into the appropriate `ValidationError`.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance with the n − 1 denominator.
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|&v| (v - m) * (v - m)).sum();
    Some(ss / (values.len() - 1) as f64)
}

pub fn sample_sd(values: &[f64]) -> Option<f64> {
    sample_variance(values).map(f64::sqrt)
}

/// Pearson product-moment correlation. `None` for inputs of different lengths or
/// if either input has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (&a, &b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    Some((sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0))
}

/// Least-squares slope of `y` regressed on `x`.
pub fn ols_slope(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let sxx: f64 = x.iter().map(|&a| (a - mx) * (a - mx)).sum();
    if x.len() < 2 || sxx <= 0.0 {
        return None;
    }
    let sxy: f64 = x.iter().zip(y).map(|(&a, &b)| (a - mx) * (b - my)).sum();
    Some(sxy / sxx)
}

/// Ranks starting at 1, with tied values sharing their average rank.
pub fn midranks(values: ArrayView1<f64>) -> Vec<f64> {
    let n = values.len();
    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&i, &j| values[i].total_cmp(&values[j]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && values[idx[j]] == values[idx[i]] {
            j += 1;
        }
        let avg_rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for &k in &idx[i..j] {
            ranks[k] = avg_rank;
        }
        i = j;
    }
    ranks
}

/// Column-wise Pearson correlation matrix of a subjects × variables matrix.
/// Returns the index of the first zero-variance column on failure.
pub fn correlation_matrix(data: ArrayView2<f64>) -> Result<Array2<f64>, usize> {
    let n = data.nrows() as f64;
    let means = data.mean_axis(Axis(0)).ok_or(0_usize)?;
    let centered = &data - &means.insert_axis(Axis(0));
    let cov = centered.t().dot(&centered) / (n - 1.0);

    let p = cov.nrows();
    let sd: Vec<f64> = (0..p).map(|j| cov[(j, j)].sqrt()).collect();
    if let Some(j) = sd.iter().position(|&s| !(s > 0.0)) {
        return Err(j);
    }
    let mut corr = Array2::from_shape_fn((p, p), |(i, j)| cov[(i, j)] / (sd[i] * sd[j]));
    for i in 0..p {
        corr[(i, i)] = 1.0;
        for j in 0..i {
            let symmetric = (0.5 * (corr[(i, j)] + corr[(j, i)])).clamp(-1.0, 1.0);
            corr[(i, j)] = symmetric;
            corr[(j, i)] = symmetric;
        }
    }
    Ok(corr)
}
