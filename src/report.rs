use std::fmt::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::error::SinkError;
use crate::export::{RunContext, Sink};
use crate::models::RiskLevel;
use crate::pipeline::ScoredBatch;

pub fn build_report(batch: &ScoredBatch, run: &RunContext, limit: usize) -> String {
    let counts = batch.level_counts();
    let mut output = String::new();

    let _ = writeln!(output, "# Student Risk Report");
    let _ = writeln!(
        output,
        "Run {} generated {} for {} students",
        run.run_id,
        run.started_at.format("%Y-%m-%d %H:%M UTC"),
        batch.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Distribution");
    for (level, count) in [
        (RiskLevel::High, counts.high),
        (RiskLevel::Medium, counts.medium),
        (RiskLevel::Low, counts.low),
    ] {
        let _ = writeln!(output, "- {level}: {count}");
    }
    let _ = writeln!(output, "- Average risk score: {:.1}", batch.average_score());

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");
    for student in batch.ranked().into_iter().take(limit) {
        let f = &student.features;
        let _ = writeln!(
            output,
            "- Student {} score {:.2} ({}) attendance {:.1}%, grade {}, trend {:+}, missing assignments {}",
            student.student_id,
            student.assessment.risk_score,
            student.assessment.risk_level,
            f.attendance_pct,
            f.final_grade,
            f.trend_recent,
            f.missing_assignments
        );
    }

    let high = batch.high_risk();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recommended Interventions");

    let annotated: Vec<_> = high
        .iter()
        .filter_map(|s| s.annotation.as_ref().map(|a| (s.student_id, a)))
        .filter(|(_, a)| !a.key_risk_reasons.is_empty() || !a.interventions.is_empty())
        .collect();

    if annotated.is_empty() {
        let _ = writeln!(output, "No intervention notes for high-risk students.");
    } else {
        for (student_id, annotation) in annotated {
            let _ = writeln!(
                output,
                "### Student {} (AI score {:.1}, {})",
                student_id, annotation.ai_risk_score, annotation.ai_risk_level
            );
            for reason in &annotation.key_risk_reasons {
                let _ = writeln!(output, "- {reason}");
            }
            for intervention in &annotation.interventions {
                let _ = writeln!(
                    output,
                    "- [{}] {}",
                    intervention.kind.as_str(),
                    intervention.action
                );
            }
        }
    }

    output
}

/// Markdown summary written next to the CSV export.
pub struct ReportSink {
    output_dir: PathBuf,
    limit: usize,
}

impl ReportSink {
    pub fn new(output_dir: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            limit,
        }
    }
}

#[async_trait]
impl Sink for ReportSink {
    fn name(&self) -> &str {
        "report"
    }

    async fn export(&self, batch: &ScoredBatch, run: &RunContext) -> Result<String, SinkError> {
        let report = build_report(batch, run, self.limit);
        let path = self
            .output_dir
            .join(format!("student_risk_report_{}.md", run.stamp()));
        std::fs::create_dir_all(&self.output_dir)
            .and_then(|_| std::fs::write(&path, report))
            .map_err(|e| SinkError::new(self.name(), e))?;
        info!(path = %path.display(), "report written");
        Ok(path.display().to_string())
    }
}
