use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One student's raw performance row, as read from the input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub student_id: usize,
    pub absences: u32,
    #[serde(rename = "G1")]
    pub g1: i32,
    #[serde(rename = "G2")]
    pub g2: i32,
    #[serde(rename = "G3")]
    pub g3: i32,
    pub failures: u32,
    pub studytime: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedFeatures {
    pub attendance_pct: f64,
    pub final_grade: f64,
    pub trend_recent: f64,
    pub missing_assignments: u8,
}

/// Per-component risk on the 0-100 axis, relative to the batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskComponents {
    pub attendance_risk: f64,
    pub grade_risk: f64,
    pub trend_risk: f64,
    pub missing_assignments_risk: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionKind {
    Teacher,
    Parent,
}

impl InterventionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionKind::Teacher => "teacher",
            InterventionKind::Parent => "parent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intervention {
    #[serde(rename = "type")]
    pub kind: InterventionKind,
    pub action: String,
}

/// A successfully parsed external annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub key_risk_reasons: Vec<String>,
    pub interventions: Vec<Intervention>,
}

/// Annotation columns attached to a scored student. These are the only
/// non-deterministic fields of a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationFields {
    pub ai_risk_score: f64,
    pub ai_risk_level: RiskLevel,
    pub key_risk_reasons: Vec<String>,
    pub interventions: Vec<Intervention>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnnotationFields {
    pub fn from_annotation(annotation: Annotation) -> Self {
        Self {
            ai_risk_score: annotation.risk_score,
            ai_risk_level: annotation.risk_level,
            key_risk_reasons: annotation.key_risk_reasons,
            interventions: annotation.interventions,
            error: None,
        }
    }

    /// Deterministic stand-in used when no annotation was requested or the
    /// collaborator failed.
    pub fn fallback(assessment: &RiskAssessment, error: Option<String>) -> Self {
        Self {
            ai_risk_score: assessment.risk_score,
            ai_risk_level: assessment.risk_level,
            key_risk_reasons: Vec::new(),
            interventions: Vec::new(),
            error,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredStudent {
    pub student_id: usize,
    pub features: DerivedFeatures,
    pub components: RiskComponents,
    pub assessment: RiskAssessment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<AnnotationFields>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

impl LevelCounts {
    pub fn total(&self) -> usize {
        self.low + self.medium + self.high
    }
}
