//! Student academic-risk scoring.
//!
//! - [`features`] derives attendance, grade, trend and missing-assignment features
//! - [`risk`] normalizes them against the batch and aggregates a weighted score
//! - [`pipeline`] scores a whole batch and answers queries over the result
//! - [`annotation`] and [`dispatch`] attach optional external reasoning
//! - [`export`], [`sheets`], [`report`] and [`alert`] deliver results
//! - [`workflow`] runs all of the above for one input file

pub mod alert;
pub mod annotation;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod features;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod risk;
pub mod sheets;
pub mod workflow;

pub use config::Config;
pub use error::{AnnotationError, Error, SinkError};
pub use models::{RiskLevel, ScoredStudent, StudentRecord};
pub use pipeline::{score_batch, ScoredBatch};
pub use risk::RiskAggregator;
pub use workflow::{RunStatus, RunSummary, Workflow};
