//! # Staged Validation Pipeline
//!
//! `Pipeline` owns the two populations and runs the stages in their fixed order:
//!
//! 1. confound correction (per metric, parallel, joined before the write-back),
//! 2. reference standardization of every compensated column,
//! 3. scoring (per metric, parallel),
//! 4. redundancy analysis, 5. factor analysis (whole matrix).
//!
//! Each `run_*` method checks that its predecessor has completed and returns
//! `ValidationError::StageOrder` otherwise. Re-running a stage discards the results
//! of every stage after it.
//!
//! Cut-offs sit beside that chain: they only read the standardized compensated
//! columns, so they can be estimated any time after scoring and survive later
//! stages. A schema with a single metric has no factor structure to extract, and
//! `run_all` skips factor analysis for it.

use crate::config::{ComparatorSpec, PipelineConfig};
use crate::confound::{ConfoundCorrector, ConfoundModel};
use crate::cutoff::{CutoffTable, estimate_cutoffs};
use crate::data::{Group, MetricVariant, Population, Schema, pooled_matrix};
use crate::error::ValidationError;
use crate::factor::{FactorAnalyzer, FactorModel, Scree};
use crate::redundancy::{PartialCorrelationMatrix, partial_correlations};
use crate::score::{CorrectionObserver, CorrectionTrace, MetricScoreTable, MetricScorer};
use crate::standardize::{ReferenceScale, standardize_all};
use ndarray::Array2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Created,
    ConfoundCorrected,
    Standardized,
    Scored,
    RedundancyAnalyzed,
    FactorsExtracted,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Created => "construction",
            Stage::ConfoundCorrected => "confound correction",
            Stage::Standardized => "standardization",
            Stage::Scored => "scoring",
            Stage::RedundancyAnalyzed => "redundancy analysis",
            Stage::FactorsExtracted => "factor analysis",
        }
    }
}

const CUTOFF_STAGE: &str = "cut-off estimation";

/// Everything the pipeline produced, available once every stage has run.
#[derive(Debug, Clone)]
pub struct PipelineResults {
    pub metrics: Vec<String>,
    pub reference: Population,
    pub impaired: Population,
    pub confound_models: Vec<ConfoundModel>,
    pub scales: Vec<ReferenceScale>,
    pub scores: MetricScoreTable,
    pub partial_correlations: PartialCorrelationMatrix,
    pub scree: Scree,
    /// `None` for a single-metric schema.
    pub factors: Option<FactorModel>,
    pub cutoffs: CutoffTable,
}

pub struct Pipeline<'a> {
    schema: Schema,
    config: PipelineConfig,
    reference: Population,
    impaired: Population,
    observer: Option<&'a dyn CorrectionObserver>,
    stage: Stage,
    confound_models: Vec<ConfoundModel>,
    scales: Vec<ReferenceScale>,
    scores: Option<MetricScoreTable>,
    partial_correlations: Option<PartialCorrelationMatrix>,
    factors: Option<FactorModel>,
    cutoffs: Option<CutoffTable>,
}

impl<'a> Pipeline<'a> {
    /// Validates the configuration and both populations against the schema.
    pub fn new(
        schema: Schema,
        reference: Population,
        impaired: Population,
        config: PipelineConfig,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        for (slot, spec) in [("c1", &config.c1), ("c2", &config.c2)] {
            if let ComparatorSpec::External { column } = spec {
                if !schema.criteria.contains(column) {
                    return Err(ValidationError::Config(format!(
                        "{slot} uses criterion '{column}', which the schema does not declare"
                    )));
                }
            }
        }
        if reference.group != Group::Reference || impaired.group != Group::Impaired {
            return Err(ValidationError::Config(format!(
                "populations were passed as ({}, {}); expected (reference, impaired)",
                reference.group, impaired.group
            )));
        }
        schema.validate(&reference)?;
        schema.validate(&impaired)?;

        log::info!(
            "Pipeline created: {} metrics, {} covariates, {} reference and {} impaired subjects",
            schema.metrics.len(),
            schema.covariates.len(),
            reference.len(),
            impaired.len()
        );
        Ok(Self {
            schema,
            config,
            reference,
            impaired,
            observer: None,
            stage: Stage::Created,
            confound_models: Vec::new(),
            scales: Vec::new(),
            scores: None,
            partial_correlations: None,
            factors: None,
            cutoffs: None,
        })
    }

    pub fn with_observer(mut self, observer: &'a dyn CorrectionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn require(&self, stage: &'static str, requires: Stage) -> Result<(), ValidationError> {
        if self.stage < requires {
            return Err(ValidationError::StageOrder {
                stage,
                requires: requires.name(),
            });
        }
        Ok(())
    }

    /// Rewinds to `stage`, dropping the results of every later stage.
    fn rewind(&mut self, stage: Stage) {
        if stage < Stage::FactorsExtracted {
            self.factors = None;
        }
        if stage < Stage::RedundancyAnalyzed {
            self.partial_correlations = None;
        }
        if stage < Stage::Scored {
            self.scores = None;
        }
        if stage < Stage::Standardized {
            self.scales.clear();
            self.cutoffs = None;
        }
        self.stage = stage;
    }

    pub fn run_confound_correction(&mut self) -> Result<&[ConfoundModel], ValidationError> {
        self.rewind(Stage::Created);
        self.reference.compensated.clear();
        self.impaired.compensated.clear();
        log::info!("Running confound correction ({:?} fit)", self.config.confound_fit);
        let corrector = ConfoundCorrector::new(&self.schema.covariates, &self.config);
        self.confound_models = corrector.correct_all(
            &self.schema.metrics,
            &mut self.reference,
            &mut self.impaired,
            self.config.parallel,
        )?;
        self.stage = Stage::ConfoundCorrected;
        Ok(&self.confound_models)
    }

    pub fn run_standardization(&mut self) -> Result<&[ReferenceScale], ValidationError> {
        self.require(Stage::Standardized.name(), Stage::ConfoundCorrected)?;
        if self.stage >= Stage::Standardized {
            // Compensated columns are already on the reference scale; refit them.
            self.run_confound_correction()?;
        }
        log::info!("Running reference standardization");
        self.scales = standardize_all(
            &self.schema.metrics,
            &mut self.reference,
            &mut self.impaired,
            self.config.parallel,
        )?;
        self.stage = Stage::Standardized;
        Ok(&self.scales)
    }

    pub fn run_scoring(&mut self) -> Result<&MetricScoreTable, ValidationError> {
        self.require(Stage::Scored.name(), Stage::Standardized)?;
        self.rewind(Stage::Standardized);
        log::info!("Scoring {} metrics", self.schema.metrics.len());
        let mut scorer = MetricScorer::new(&self.config);
        if let Some(observer) = self.observer {
            scorer = scorer.with_observer(observer);
        }
        let scores = scorer.score_all(
            &self.schema.metrics,
            &self.reference,
            &self.impaired,
            self.config.parallel,
        )?;
        self.stage = Stage::Scored;
        Ok(self.scores.insert(scores))
    }

    pub fn run_redundancy(&mut self) -> Result<&PartialCorrelationMatrix, ValidationError> {
        self.require(Stage::RedundancyAnalyzed.name(), Stage::Scored)?;
        self.rewind(Stage::Scored);
        log::info!("Running redundancy analysis");
        let matrix = self.compensated_matrix()?;
        let partial = partial_correlations(
            matrix.view(),
            &self.schema.metrics,
            self.config.singular_tolerance,
        )?;
        self.stage = Stage::RedundancyAnalyzed;
        Ok(self.partial_correlations.insert(partial))
    }

    pub fn run_factor_analysis(&mut self) -> Result<&FactorModel, ValidationError> {
        self.require(Stage::FactorsExtracted.name(), Stage::RedundancyAnalyzed)?;
        self.rewind(Stage::RedundancyAnalyzed);
        log::info!("Running factor analysis ({:?})", self.config.factor_count);
        let matrix = self.compensated_matrix()?;
        let model = FactorAnalyzer::new(&self.config).fit(matrix.view(), &self.schema.metrics)?;
        self.stage = Stage::FactorsExtracted;
        Ok(self.factors.insert(model))
    }

    pub fn run_cutoffs(&mut self) -> Result<&CutoffTable, ValidationError> {
        self.require(CUTOFF_STAGE, Stage::Scored)?;
        log::info!(
            "Estimating cut-offs at percentile {}",
            self.config.cutoff_percentile
        );
        let table = estimate_cutoffs(
            &self.reference,
            &self.impaired,
            &self.schema.metrics,
            self.config.cutoff_percentile,
        )?;
        Ok(self.cutoffs.insert(table))
    }

    /// Runs every stage in order and hands back all results.
    pub fn run_all(mut self) -> Result<PipelineResults, ValidationError> {
        self.run_confound_correction()?;
        self.run_standardization()?;
        self.run_scoring()?;
        self.run_redundancy()?;
        if self.schema.metrics.len() > 1 {
            self.run_factor_analysis()?;
        } else {
            log::info!("Skipping factor analysis: the schema has a single metric");
        }
        self.run_cutoffs()?;
        self.into_results()
    }

    /// Consumes a pipeline whose stages have all completed. Factor analysis is only
    /// required when there is more than one metric.
    pub fn into_results(self) -> Result<PipelineResults, ValidationError> {
        let factors_required = self.schema.metrics.len() > 1;
        let missing = if self.scores.is_none() {
            Some(Stage::Scored.name())
        } else if self.partial_correlations.is_none() {
            Some(Stage::RedundancyAnalyzed.name())
        } else if factors_required && self.factors.is_none() {
            Some(Stage::FactorsExtracted.name())
        } else if self.cutoffs.is_none() {
            Some(CUTOFF_STAGE)
        } else {
            None
        };
        if let Some(requires) = missing {
            return Err(ValidationError::StageOrder {
                stage: "results",
                requires,
            });
        }
        let scree = self.scree()?;
        match (self.scores, self.partial_correlations, self.cutoffs) {
            (Some(scores), Some(partial_correlations), Some(cutoffs)) => Ok(PipelineResults {
                metrics: self.schema.metrics,
                reference: self.reference,
                impaired: self.impaired,
                confound_models: self.confound_models,
                scales: self.scales,
                scores,
                partial_correlations,
                scree,
                factors: self.factors,
                cutoffs,
            }),
            _ => Err(ValidationError::StageOrder {
                stage: "results",
                requires: Stage::Scored.name(),
            }),
        }
    }

    /// Scree of the pooled compensated metrics; available after standardization.
    pub fn scree(&self) -> Result<Scree, ValidationError> {
        self.require(Stage::Standardized.name(), Stage::Standardized)?;
        let matrix = self.compensated_matrix()?;
        FactorAnalyzer::scree(matrix.view(), &self.schema.metrics)
    }

    /// Per-metric raw/compensated traces for plotting.
    pub fn correction_traces(&self) -> Result<Vec<CorrectionTrace>, ValidationError> {
        self.require(Stage::ConfoundCorrected.name(), Stage::ConfoundCorrected)?;
        self.schema
            .metrics
            .iter()
            .map(|metric| CorrectionTrace::from_populations(&self.reference, &self.impaired, metric))
            .collect()
    }

    fn compensated_matrix(&self) -> Result<Array2<f64>, ValidationError> {
        pooled_matrix(
            &self.reference,
            &self.impaired,
            &self.schema.metrics,
            MetricVariant::Compensated,
        )
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn reference(&self) -> &Population {
        &self.reference
    }

    pub fn impaired(&self) -> &Population {
        &self.impaired
    }

    pub fn confound_models(&self) -> &[ConfoundModel] {
        &self.confound_models
    }

    pub fn scores(&self) -> Option<&MetricScoreTable> {
        self.scores.as_ref()
    }

    pub fn partial_correlations(&self) -> Option<&PartialCorrelationMatrix> {
        self.partial_correlations.as_ref()
    }

    pub fn factors(&self) -> Option<&FactorModel> {
        self.factors.as_ref()
    }

    pub fn cutoffs(&self) -> Option<&CutoffTable> {
        self.cutoffs.as_ref()
    }
}
