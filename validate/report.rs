//! Tab-separated result tables and the TOML dump of fitted confound models.

use crate::confound::ConfoundModel;
use crate::cutoff::CutoffTable;
use crate::data::{
    ColumnRef, CovariateValues, MetricVariant, Population, RETEST_SUFFIX, Schema,
};
use crate::factor::{FactorModel, Scree};
use crate::pipeline::PipelineResults;
use crate::redundancy::PartialCorrelationMatrix;
use crate::score::MetricScoreTable;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize confound models to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Placeholder for statistics that are undefined for a metric.
const MISSING: &str = "NA";

fn cell(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => v.to_string(),
        _ => MISSING.to_string(),
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, ReportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

pub fn write_metric_scores(path: &Path, scores: &MetricScoreTable) -> Result<(), ReportError> {
    let mut writer = create(path)?;
    writeln!(
        writer,
        "metric\tc1_{}\tc2_{}\tauc\tsrd\ticc\tslope\tsem\tretest_pairs",
        scores.c1_label, scores.c2_label
    )?;
    for score in scores.scores() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            score.metric,
            cell(score.c1),
            cell(score.c2),
            score.auc,
            cell(score.srd),
            cell(score.icc),
            cell(score.slope),
            cell(score.sem),
            score.retest_pairs
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_partial_correlations(
    path: &Path,
    matrix: &PartialCorrelationMatrix,
) -> Result<(), ReportError> {
    let mut writer = create(path)?;
    write!(writer, "metric")?;
    for metric in &matrix.metrics {
        write!(writer, "\t{metric}")?;
    }
    writeln!(writer)?;
    for (i, metric) in matrix.metrics.iter().enumerate() {
        write!(writer, "{metric}")?;
        for value in matrix.partial.row(i) {
            write!(writer, "\t{value}")?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_factor_loadings(path: &Path, model: &FactorModel) -> Result<(), ReportError> {
    let mut writer = create(path)?;
    write!(writer, "metric")?;
    for f in 0..model.n_factors() {
        write!(writer, "\tF{}", f + 1)?;
    }
    writeln!(writer, "\tcommunality\tuniqueness")?;
    for (i, metric) in model.metrics.iter().enumerate() {
        write!(writer, "{metric}")?;
        for value in model.loadings.row(i) {
            write!(writer, "\t{value}")?;
        }
        writeln!(
            writer,
            "\t{}\t{}",
            model.communalities[i], model.uniquenesses[i]
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_scree(path: &Path, scree: &Scree) -> Result<(), ReportError> {
    let mut writer = create(path)?;
    write_scree_to(&mut writer, scree)?;
    writer.flush()?;
    Ok(())
}

/// Writes the scree table to any sink, e.g. stdout.
pub fn write_scree_to(writer: &mut impl Write, scree: &Scree) -> Result<(), ReportError> {
    writeln!(writer, "component\teigenvalue\tproportion\tcumulative")?;
    for (i, value) in scree.eigenvalues.iter().enumerate() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            i + 1,
            value,
            scree.proportions[i],
            scree.cumulative[i]
        )?;
    }
    Ok(())
}

pub fn write_cutoffs(path: &Path, table: &CutoffTable) -> Result<(), ReportError> {
    let mut writer = create(path)?;
    writeln!(writer, "metric\tpercentile\tcutoff")?;
    for (metric, cutoff) in table.iter() {
        writeln!(writer, "{metric}\t{}\t{cutoff}", table.percentile)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ConfoundModelFile<'a> {
    models: &'a [ConfoundModel],
}

pub fn write_confound_models(path: &Path, models: &[ConfoundModel]) -> Result<(), ReportError> {
    let toml_string = toml::to_string_pretty(&ConfoundModelFile { models })?;
    let mut writer = create(path)?;
    writer.write_all(toml_string.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Subject identifiers, group, and every compensated (test and retest) column.
pub fn write_compensated(
    path: &Path,
    population: &Population,
    metrics: &[String],
) -> Result<(), ReportError> {
    let columns: Vec<ColumnRef> = metrics
        .iter()
        .flat_map(|metric| {
            [MetricVariant::Compensated, MetricVariant::CompensatedRetest]
                .into_iter()
                .map(move |variant| ColumnRef::new(metric, variant))
        })
        .filter(|column| population.column(column).is_some())
        .collect();

    let mut writer = create(path)?;
    write!(writer, "subject_id\tgroup")?;
    for column in &columns {
        write!(writer, "\t{column}")?;
    }
    writeln!(writer)?;
    for (row, subject) in population.subject_ids.iter().enumerate() {
        write!(writer, "{subject}\t{}", population.group)?;
        for column in &columns {
            let value = population.column(column).map(|values| values[row]);
            write!(writer, "\t{}", cell(value))?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes a raw population table in the layout `data::load_population` reads:
/// covariates, metrics, `<metric>_retest` columns (blank when not retested), and
/// criteria. Columns the population lacks are skipped.
pub fn write_population(path: &Path, population: &Population, schema: &Schema) -> Result<(), ReportError> {
    let mut writer = create(path)?;
    write!(writer, "subject_id")?;
    for spec in &schema.covariates {
        write!(writer, "\t{}", spec.name)?;
    }
    for metric in &schema.metrics {
        write!(writer, "\t{metric}")?;
        if population.raw.get(metric).is_some_and(|m| m.retest.is_some()) {
            write!(writer, "\t{metric}{RETEST_SUFFIX}")?;
        }
    }
    for criterion in &schema.criteria {
        write!(writer, "\t{criterion}")?;
    }
    writeln!(writer)?;

    for (row, subject) in population.subject_ids.iter().enumerate() {
        write!(writer, "{subject}")?;
        for spec in &schema.covariates {
            match population.covariates.get(&spec.name) {
                Some(CovariateValues::Continuous(values)) => write!(writer, "\t{}", values[row])?,
                Some(CovariateValues::Categorical(labels)) => write!(writer, "\t{}", labels[row])?,
                None => write!(writer, "\t")?,
            }
        }
        for metric in &schema.metrics {
            if let Some(values) = population.raw.get(metric) {
                write!(writer, "\t{}", values.test[row])?;
                if let Some(retest) = &values.retest {
                    if retest[row].is_finite() {
                        write!(writer, "\t{}", retest[row])?;
                    } else {
                        write!(writer, "\t")?;
                    }
                }
            }
        }
        for criterion in &schema.criteria {
            match population.criteria.get(criterion) {
                Some(values) => write!(writer, "\t{}", values[row])?,
                None => write!(writer, "\t")?,
            }
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Files written by `write_results`.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub metric_scores: PathBuf,
    pub partial_correlations: PathBuf,
    /// `None` when no factor model was extracted.
    pub factor_loadings: Option<PathBuf>,
    pub scree: PathBuf,
    pub cutoffs: PathBuf,
    pub confound_models: PathBuf,
    pub reference_compensated: PathBuf,
    pub impaired_compensated: PathBuf,
}

impl ReportPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            metric_scores: dir.join("metric_scores.tsv"),
            partial_correlations: dir.join("partial_correlations.tsv"),
            factor_loadings: Some(dir.join("factor_loadings.tsv")),
            scree: dir.join("scree.tsv"),
            cutoffs: dir.join("cutoffs.tsv"),
            confound_models: dir.join("confound_models.toml"),
            reference_compensated: dir.join("reference_compensated.tsv"),
            impaired_compensated: dir.join("impaired_compensated.tsv"),
        }
    }
}

/// Writes every result table of a completed pipeline into `dir`.
pub fn write_results(dir: &Path, results: &PipelineResults) -> Result<ReportPaths, ReportError> {
    let mut paths = ReportPaths::in_dir(dir);
    if results.factors.is_none() {
        paths.factor_loadings = None;
    }
    write_metric_scores(&paths.metric_scores, &results.scores)?;
    write_partial_correlations(&paths.partial_correlations, &results.partial_correlations)?;
    if let (Some(model), Some(path)) = (&results.factors, &paths.factor_loadings) {
        write_factor_loadings(path, model)?;
    }
    write_scree(&paths.scree, &results.scree)?;
    write_cutoffs(&paths.cutoffs, &results.cutoffs)?;
    write_confound_models(&paths.confound_models, &results.confound_models)?;
    write_compensated(&paths.reference_compensated, &results.reference, &results.metrics)?;
    write_compensated(&paths.impaired_compensated, &results.impaired, &results.metrics)?;
    log::info!("Wrote result tables to '{}'", dir.display());
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Group, MetricValues, load_population};
    use crate::score::MetricScore;
    use crate::synthetic::{SyntheticParams, generate};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    #[test]
    fn population_tables_reload_through_the_loader() {
        let params = SyntheticParams {
            subjects_per_group: 12,
            retest_probability: 0.5,
            ..SyntheticParams::default()
        };
        let data = generate(&params, &mut StdRng::seed_from_u64(9)).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("reference.tsv");
        write_population(&path, &data.reference, &data.schema).unwrap();

        let loaded = load_population(&path, Group::Reference, &data.schema).unwrap();
        assert_eq!(loaded.subject_ids, data.reference.subject_ids);
        let original = &data.reference.raw["metric_1"];
        let reloaded = &loaded.raw["metric_1"];
        for i in 0..12 {
            assert_abs_diff_eq!(reloaded.test[i], original.test[i], epsilon = 1e-9);
        }
        assert_eq!(reloaded.retest_count(), original.retest_count());
    }

    #[test]
    fn missing_statistics_are_written_as_na() {
        let table = MetricScoreTable::new(
            "known_groups".to_string(),
            "test_retest".to_string(),
            vec![MetricScore {
                metric: "grip".to_string(),
                c1: Some(0.4),
                c2: None,
                auc: 0.7,
                srd: None,
                icc: None,
                slope: None,
                sem: None,
                retest_pairs: 0,
            }],
        );
        let dir = tempdir().unwrap();
        let path = dir.path().join("scores.tsv");
        write_metric_scores(&path, &table).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("metric\tc1_known_groups\tc2_test_retest"));
        assert_eq!(lines.next().unwrap(), "grip\t0.4\tNA\t0.7\tNA\tNA\tNA\tNA\t0");
    }

    #[test]
    fn compensated_table_lists_retest_columns() {
        let mut population = Population::new(Group::Impaired, 2);
        population.compensated.insert(
            "grip".to_string(),
            MetricValues::new(array![0.5, -0.5], Some(array![0.25, f64::NAN])),
        );
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("impaired.tsv");
        write_compensated(&path, &population, &["grip".to_string()]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "subject_id\tgroup\tgrip_compensated\tgrip_retest_compensated");
        assert_eq!(lines[2], "2\timpaired\t-0.5\tNA");
    }
}
