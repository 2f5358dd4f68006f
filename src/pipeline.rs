//! Deterministic batch scoring: derive, normalize, aggregate.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::error::{AnnotationError, Error, Result};
use crate::features;
use crate::models::{
    Annotation, AnnotationFields, LevelCounts, RiskLevel, ScoredStudent, StudentRecord,
};
use crate::risk::{self, RiskAggregator};

/// Result of one scoring run, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredBatch {
    students: Vec<ScoredStudent>,
}

/// Scores a whole batch. The min/max reduction completes over every record
/// before any component is normalized.
pub fn score_batch(records: &[StudentRecord], aggregator: &RiskAggregator) -> Result<ScoredBatch> {
    if records.is_empty() {
        return Err(Error::Validation("cannot score an empty batch".to_string()));
    }

    let derived = features::derive_batch(records);
    let components = risk::normalize_batch(&derived);

    let students: Vec<ScoredStudent> = records
        .iter()
        .zip(derived)
        .zip(components)
        .map(|((record, features), components)| ScoredStudent {
            student_id: record.student_id,
            features,
            components,
            assessment: aggregator.assess(&components),
            annotation: None,
        })
        .collect();

    let batch = ScoredBatch { students };
    let counts = batch.level_counts();
    info!(
        total = batch.len(),
        low = counts.low,
        medium = counts.medium,
        high = counts.high,
        "risk scoring complete"
    );
    Ok(batch)
}

impl ScoredBatch {
    pub fn students(&self) -> &[ScoredStudent] {
        &self.students
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    pub fn get(&self, student_id: usize) -> Option<&ScoredStudent> {
        self.students.iter().find(|s| s.student_id == student_id)
    }

    /// Exactly the students classified High, in input order.
    pub fn high_risk(&self) -> Vec<&ScoredStudent> {
        self.with_level(RiskLevel::High)
    }

    pub fn with_level(&self, level: RiskLevel) -> Vec<&ScoredStudent> {
        self.students
            .iter()
            .filter(|s| s.assessment.risk_level == level)
            .collect()
    }

    pub fn level_counts(&self) -> LevelCounts {
        self.students
            .iter()
            .fold(LevelCounts::default(), |mut counts, s| {
                match s.assessment.risk_level {
                    RiskLevel::Low => counts.low += 1,
                    RiskLevel::Medium => counts.medium += 1,
                    RiskLevel::High => counts.high += 1,
                }
                counts
            })
    }

    pub fn average_score(&self) -> f64 {
        if self.students.is_empty() {
            return 0.0;
        }
        let total: f64 = self.students.iter().map(|s| s.assessment.risk_score).sum();
        total / self.students.len() as f64
    }

    /// Students sorted by descending risk score; ties keep input order.
    pub fn ranked(&self) -> Vec<&ScoredStudent> {
        let mut ranked: Vec<&ScoredStudent> = self.students.iter().collect();
        ranked.sort_by(|a, b| {
            b.assessment
                .risk_score
                .partial_cmp(&a.assessment.risk_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }

    /// True once every student carries annotation fields.
    pub fn has_annotations(&self) -> bool {
        !self.students.is_empty() && self.students.iter().all(|s| s.annotation.is_some())
    }

    /// Annotation fields that hold a fallback marker.
    pub fn annotation_failures(&self) -> usize {
        self.students
            .iter()
            .filter(|s| s.annotation.as_ref().is_some_and(AnnotationFields::is_fallback))
            .count()
    }

    /// Attaches collaborator outcomes by student id. Students without an
    /// outcome, and failed outcomes, get the deterministic fallback.
    pub fn merge_annotations(
        &mut self,
        outcomes: Vec<(usize, std::result::Result<Annotation, AnnotationError>)>,
    ) {
        let mut by_id: HashMap<usize, std::result::Result<Annotation, AnnotationError>> =
            outcomes.into_iter().collect();

        for student in self.students.iter_mut() {
            let fields = match by_id.remove(&student.student_id) {
                Some(Ok(annotation)) => AnnotationFields::from_annotation(annotation),
                Some(Err(err)) => {
                    warn!(student_id = student.student_id, error = %err, "annotation fell back");
                    AnnotationFields::fallback(&student.assessment, Some(err.to_string()))
                }
                None => AnnotationFields::fallback(
                    &student.assessment,
                    Some("no annotation outcome".to_string()),
                ),
            };
            student.annotation = Some(fields);
        }
    }

    /// Fills annotation fields from the deterministic assessment, for runs
    /// that skip the external collaborator.
    pub fn fill_deterministic_annotations(&mut self) {
        for student in self.students.iter_mut() {
            student.annotation = Some(AnnotationFields::fallback(&student.assessment, None));
        }
    }
}
