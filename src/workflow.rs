//! End-to-end run: ingest, score, annotate, export, alert.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alert;
use crate::annotation::{AnnotationRequest, Annotator};
use crate::config::Config;
use crate::dispatch::{AnnotationDispatcher, RateLimiter};
use crate::error::Result;
use crate::export::{self, RunContext, Sink};
use crate::ingest;
use crate::models::StudentRecord;
use crate::pipeline::{score_batch, ScoredBatch};
use crate::risk::RiskAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkFailure {
    pub sink: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_students: usize,
    pub high_risk_count: usize,
    pub medium_risk_count: usize,
    pub low_risk_count: usize,
    pub annotation_failures: usize,
    pub output_files: BTreeMap<String, String>,
    pub sink_failures: Vec<SinkFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    fn failed(run: &RunContext, error: String) -> Self {
        Self {
            run_id: run.run_id,
            started_at: run.started_at,
            status: RunStatus::Failed,
            total_students: 0,
            high_risk_count: 0,
            medium_risk_count: 0,
            low_risk_count: 0,
            annotation_failures: 0,
            output_files: BTreeMap::new(),
            sink_failures: Vec::new(),
            error: Some(error),
        }
    }
}

/// Collaborators for one run. `annotator = None` skips the external
/// reasoning step and fills deterministic annotation fields instead.
pub struct Workflow {
    config: Config,
    aggregator: RiskAggregator,
    annotator: Option<Arc<dyn Annotator>>,
    sinks: Vec<Box<dyn Sink>>,
    stop: Arc<AtomicBool>,
}

impl Workflow {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let aggregator = RiskAggregator::new(config.weights, config.thresholds)?;
        Ok(Self {
            config,
            aggregator,
            annotator: None,
            sinks: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_annotator(mut self, annotator: Arc<dyn Annotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn aggregator(&self) -> &RiskAggregator {
        &self.aggregator
    }

    /// Reads and validates the input file, then runs.
    pub async fn run_file(&self, path: &Path, delimiter: u8) -> RunSummary {
        let run = RunContext::new();
        info!(run_id = %run.run_id, path = %path.display(), "starting workflow run");
        match ingest::read_records(path, delimiter) {
            Ok(records) => self.run_records(&records, run).await,
            Err(err) => {
                error!(error = %err, "workflow failed during ingestion");
                RunSummary::failed(&run, err.to_string())
            }
        }
    }

    pub async fn run_records(&self, records: &[StudentRecord], run: RunContext) -> RunSummary {
        let mut batch = match score_batch(records, &self.aggregator) {
            Ok(batch) => batch,
            Err(err) => {
                error!(error = %err, "workflow failed during scoring");
                return RunSummary::failed(&run, err.to_string());
            }
        };

        self.annotate(&mut batch).await;

        let mut output_files = BTreeMap::new();
        let mut sink_failures = Vec::new();
        for sink in &self.sinks {
            match sink.export(&batch, &run).await {
                Ok(location) => {
                    output_files.insert(sink.name().to_string(), location);
                }
                Err(err) => {
                    warn!(sink = sink.name(), error = %err, "sink failed");
                    sink_failures.push(SinkFailure {
                        sink: err.sink,
                        error: err.message,
                    });
                }
            }
        }

        let high = batch.high_risk();
        match alert::send_teacher_alert(
            &high,
            &run,
            &self.config.output.logs_dir,
            self.config.alert.teacher_email.as_deref(),
        ) {
            Ok(Some(path)) => {
                output_files.insert("alert".to_string(), path.display().to_string());
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "alert log failed");
                sink_failures.push(SinkFailure {
                    sink: "alert".to_string(),
                    error: err.to_string(),
                });
            }
        }

        match export::log_run_metadata(&batch, &run, &output_files, &self.config.output.logs_dir) {
            Ok(path) => {
                output_files.insert("metadata".to_string(), path.display().to_string());
            }
            Err(err) => {
                warn!(error = %err, "run metadata log failed");
                sink_failures.push(SinkFailure {
                    sink: "metadata".to_string(),
                    error: err.to_string(),
                });
            }
        }

        let counts = batch.level_counts();
        let summary = RunSummary {
            run_id: run.run_id,
            started_at: run.started_at,
            status: RunStatus::Success,
            total_students: batch.len(),
            high_risk_count: counts.high,
            medium_risk_count: counts.medium,
            low_risk_count: counts.low,
            annotation_failures: batch.annotation_failures(),
            output_files,
            sink_failures,
            error: None,
        };
        info!(
            run_id = %summary.run_id,
            total = summary.total_students,
            high = summary.high_risk_count,
            sink_failures = summary.sink_failures.len(),
            "workflow completed"
        );
        summary
    }

    async fn annotate(&self, batch: &mut ScoredBatch) {
        let Some(annotator) = &self.annotator else {
            info!("skipping external annotation");
            batch.fill_deterministic_annotations();
            return;
        };

        let requests: Vec<(usize, AnnotationRequest)> = batch
            .students()
            .iter()
            .map(|s| (s.student_id, AnnotationRequest::from(&s.features)))
            .collect();
        let limiter = Arc::new(RateLimiter::per_minute(
            self.config.annotation.requests_per_minute,
        ));
        let dispatcher = AnnotationDispatcher::new(
            Arc::clone(annotator),
            limiter,
            self.config.annotation.concurrency,
        )
        .with_stop_flag(Arc::clone(&self.stop));

        let outcomes = dispatcher.dispatch(requests).await;
        batch.merge_annotations(outcomes);
    }
}
