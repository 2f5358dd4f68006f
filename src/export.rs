//! Output rows, column projection, and file sinks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result, SinkError};
use crate::models::{Intervention, ScoredStudent};
use crate::pipeline::ScoredBatch;

/// Output columns in export order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    StudentId,
    AttendancePct,
    FinalGrade,
    TrendRecent,
    MissingAssignments,
    RiskScore,
    RiskLevel,
    AiRiskScore,
    AiRiskLevel,
    KeyRiskReasons,
    Interventions,
}

/// The fixed (column, required) list evaluated against a batch.
pub const COLUMNS: [(Column, bool); 11] = [
    (Column::StudentId, true),
    (Column::AttendancePct, true),
    (Column::FinalGrade, true),
    (Column::TrendRecent, true),
    (Column::MissingAssignments, true),
    (Column::RiskScore, true),
    (Column::RiskLevel, true),
    (Column::AiRiskScore, false),
    (Column::AiRiskLevel, false),
    (Column::KeyRiskReasons, false),
    (Column::Interventions, false),
];

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::StudentId => "student_id",
            Column::AttendancePct => "attendance_pct",
            Column::FinalGrade => "final_grade",
            Column::TrendRecent => "trend_recent",
            Column::MissingAssignments => "missing_assignments",
            Column::RiskScore => "risk_score",
            Column::RiskLevel => "risk_level",
            Column::AiRiskScore => "ai_risk_score",
            Column::AiRiskLevel => "ai_risk_level",
            Column::KeyRiskReasons => "key_risk_reasons",
            Column::Interventions => "interventions",
        }
    }

    pub fn is_annotation(&self) -> bool {
        matches!(
            self,
            Column::AiRiskScore | Column::AiRiskLevel | Column::KeyRiskReasons | Column::Interventions
        )
    }

    /// Raw cell value; `None` when the student lacks the field.
    pub fn value(&self, student: &ScoredStudent) -> Option<CellValue> {
        let annotation = student.annotation.as_ref();
        let cell = match self {
            Column::StudentId => CellValue::Int(student.student_id as i64),
            Column::AttendancePct => CellValue::Float(student.features.attendance_pct),
            Column::FinalGrade => CellValue::Float(student.features.final_grade),
            Column::TrendRecent => CellValue::Float(student.features.trend_recent),
            Column::MissingAssignments => {
                CellValue::Int(i64::from(student.features.missing_assignments))
            }
            Column::RiskScore => CellValue::Float(student.assessment.risk_score),
            Column::RiskLevel => CellValue::Text(student.assessment.risk_level.to_string()),
            Column::AiRiskScore => CellValue::Float(annotation?.ai_risk_score),
            Column::AiRiskLevel => CellValue::Text(annotation?.ai_risk_level.to_string()),
            Column::KeyRiskReasons => CellValue::Reasons(annotation?.key_risk_reasons.clone()),
            Column::Interventions => CellValue::Interventions(annotation?.interventions.clone()),
        };
        Some(cell)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Int(i64),
    Float(f64),
    Text(String),
    Reasons(Vec<String>),
    Interventions(Vec<Intervention>),
}

impl CellValue {
    /// Flat-file rendering: lists become JSON arrays.
    pub fn to_csv_field(&self) -> String {
        match self {
            CellValue::Int(v) => v.to_string(),
            CellValue::Float(v) => v.to_string(),
            CellValue::Text(v) => v.clone(),
            CellValue::Reasons(v) => serde_json::to_string(v).unwrap_or_default(),
            CellValue::Interventions(v) => serde_json::to_string(v).unwrap_or_default(),
        }
    }

    /// Spreadsheet rendering: reasons joined by `; `, interventions as
    /// `type: action` joined by ` | `.
    pub fn to_display(&self) -> String {
        match self {
            CellValue::Reasons(v) => v.join("; "),
            CellValue::Interventions(v) => v
                .iter()
                .map(|i| format!("{}: {}", i.kind.as_str(), i.action))
                .collect::<Vec<_>>()
                .join(" | "),
            other => other.to_csv_field(),
        }
    }
}

/// Columns present for this batch: every required column, plus the
/// annotation columns once every student carries annotation fields.
pub fn project(batch: &ScoredBatch) -> Vec<Column> {
    let annotated = batch.has_annotations();
    COLUMNS
        .iter()
        .filter(|(column, required)| *required || (column.is_annotation() && annotated))
        .map(|(column, _)| *column)
        .collect()
}

/// Header plus one row per student, rendered with `render`.
pub fn table<F>(batch: &ScoredBatch, render: F) -> (Vec<String>, Vec<Vec<String>>)
where
    F: Fn(&CellValue) -> String,
{
    let columns = project(batch);
    let header = columns.iter().map(|c| c.name().to_string()).collect();
    let rows = batch
        .students()
        .iter()
        .map(|student| {
            columns
                .iter()
                .map(|c| c.value(student).map(|v| render(&v)).unwrap_or_default())
                .collect()
        })
        .collect();
    (header, rows)
}

/// Identity of one workflow run, shared by every sink.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    /// Timestamp used in artifact file names.
    pub fn stamp(&self) -> String {
        self.started_at.format("%Y%m%d_%H%M%S").to_string()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A downstream consumer of the final batch. Returns the artifact location.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, batch: &ScoredBatch, run: &RunContext) -> std::result::Result<String, SinkError>;
}

pub struct CsvSink {
    output_dir: PathBuf,
}

impl CsvSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn write(&self, batch: &ScoredBatch, run: &RunContext) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self
            .output_dir
            .join(format!("student_risk_report_{}.csv", run.stamp()));
        write_csv(batch, &path)?;
        info!(path = %path.display(), rows = batch.len(), "results exported to CSV");
        Ok(path)
    }
}

pub fn write_csv(batch: &ScoredBatch, path: &Path) -> Result<()> {
    let (header, rows) = table(batch, CellValue::to_csv_field);
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&header)?;
    for row in rows {
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

#[async_trait]
impl Sink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn export(&self, batch: &ScoredBatch, run: &RunContext) -> std::result::Result<String, SinkError> {
        self.write(batch, run)
            .map(|path| path.display().to_string())
            .map_err(|e| SinkError::new(self.name(), e))
    }
}

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: String,
    timestamp: String,
    total_students: usize,
    risk_distribution: BTreeMap<&'static str, usize>,
    high_risk_count: usize,
    medium_risk_count: usize,
    low_risk_count: usize,
    average_risk_score: f64,
    output_files: &'a BTreeMap<String, String>,
}

/// Writes `run_metadata_{stamp}.json` into `logs_dir`.
pub fn log_run_metadata(
    batch: &ScoredBatch,
    run: &RunContext,
    output_files: &BTreeMap<String, String>,
    logs_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(logs_dir)?;
    let counts = batch.level_counts();
    let metadata = RunMetadata {
        run_id: run.run_id.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        total_students: batch.len(),
        risk_distribution: BTreeMap::from([
            ("Low", counts.low),
            ("Medium", counts.medium),
            ("High", counts.high),
        ]),
        high_risk_count: counts.high,
        medium_risk_count: counts.medium,
        low_risk_count: counts.low,
        average_risk_score: batch.average_score(),
        output_files,
    };
    let path = logs_dir.join(format!("run_metadata_{}.json", run.stamp()));
    let body = serde_json::to_string_pretty(&metadata).map_err(Error::Json)?;
    std::fs::write(&path, body)?;
    info!(path = %path.display(), "run metadata logged");
    Ok(path)
}
