//! Abnormality cut-offs: a percentile of each compensated metric over the pooled
//! reference and impaired subjects.

use crate::data::{ColumnRef, MetricVariant, Population, pooled_matrix};
use crate::error::ValidationError;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// `p`-quantile by linear interpolation between order statistics
/// (`h = (n - 1) p`, the "type 7" rule). Non-finite values are ignored.
pub fn percentile(values: ArrayView1<f64>, p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() || !(0.0..=1.0).contains(&p) {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let h = (sorted.len() - 1) as f64 * p;
    let lower = h.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    Some(sorted[lower] + (h - h.floor()) * (sorted[upper] - sorted[lower]))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoffTable {
    pub percentile: f64,
    pub metrics: Vec<String>,
    pub cutoffs: Vec<f64>,
}

impl CutoffTable {
    pub fn get(&self, metric: &str) -> Option<f64> {
        let i = self.metrics.iter().position(|m| m == metric)?;
        Some(self.cutoffs[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.metrics
            .iter()
            .map(String::as_str)
            .zip(self.cutoffs.iter().copied())
    }
}

/// Cut-off of every metric from the pooled compensated columns.
pub fn estimate_cutoffs(
    reference: &Population,
    impaired: &Population,
    metrics: &[String],
    p: f64,
) -> Result<CutoffTable, ValidationError> {
    let pooled = pooled_matrix(reference, impaired, metrics, MetricVariant::Compensated)?;
    let mut cutoffs = Vec::with_capacity(metrics.len());
    for (metric, column) in metrics.iter().zip(pooled.columns()) {
        // Only a column with no finite pooled value has no percentile.
        let cutoff = percentile(column, p).ok_or_else(|| ValidationError::DegenerateScale {
            column: ColumnRef::new(metric, MetricVariant::Compensated).to_string(),
            population: "pooled".to_string(),
            sd: 0.0,
        })?;
        cutoffs.push(cutoff);
    }
    Ok(CutoffTable {
        percentile: p,
        metrics: metrics.to_vec(),
        cutoffs,
    })
}
