//! Refill bundle risk pipeline: status mapping, bundle detection, snapshot
//! aggregation, bundle metrics, risk scoring and explanations.

pub mod aggregation;
pub mod config;
pub mod detector;
pub mod error;
pub mod explain;
pub mod mapping;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod scoring;
pub mod store;
pub mod validation;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineOutput, RefillRiskPipeline};
