#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod confound;
pub mod cutoff;
pub mod data;
pub mod error;
pub mod factor;
pub mod faer_ndarray;
pub mod pipeline;
pub mod redundancy;
pub mod report;
pub mod score;
pub mod standardize;
pub mod stats;
pub mod synthetic;

pub use config::PipelineConfig;
pub use data::{CovariateKind, CovariateSpec, Group, MetricValues, Population, Schema};
pub use error::{SchemaError, ValidationError};
pub use pipeline::{Pipeline, PipelineResults};
