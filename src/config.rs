//! Run configuration. Built once per run and passed explicitly to the workflow.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub weights: RiskWeights,
    pub thresholds: RiskThresholds,
    pub annotation: AnnotationConfig,
    pub sheets: SheetsConfig,
    pub output: OutputConfig,
    pub alert: AlertConfig,
    pub log: LogConfig,
}

/// Component weights of the aggregated score. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    pub attendance: f64,
    pub grade: f64,
    pub trend: f64,
    pub missing_assignments: f64,
}

/// Closed upper bounds of the Low and Medium bands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub low_max: f64,
    pub medium_max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub requests_per_minute: u32,
    /// Parallel in-flight calls; 1 dispatches sequentially.
    pub concurrency: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetsConfig {
    pub enabled: bool,
    pub access_token: Option<String>,
    pub spreadsheet_id: Option<String>,
    pub spreadsheet_name: String,
    pub worksheet: String,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub report: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub teacher_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            attendance: 0.35,
            grade: 0.35,
            trend: 0.20,
            missing_assignments: 0.10,
        }
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low_max: 39.0,
            medium_max: 69.0,
        }
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            model: "gemini-2.0-flash-exp".to_string(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            temperature: 0.3,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 1024,
            requests_per_minute: 15,
            concurrency: 1,
            timeout_secs: 30,
        }
    }
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_token: None,
            spreadsheet_id: None,
            spreadsheet_name: "Student_Risk_Report".to_string(),
            worksheet: "Risk_Report".to_string(),
            base_url: "https://sheets.googleapis.com".to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            logs_dir: PathBuf::from("logs"),
            report: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.attendance + self.grade + self.trend + self.missing_assignments
    }

    pub fn validate(&self) -> Result<()> {
        let all = [
            self.attendance,
            self.grade,
            self.trend,
            self.missing_assignments,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Configuration(format!(
                "weights must be finite and non-negative, got {all:?}"
            )));
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(Error::Configuration(format!(
                "weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

impl RiskThresholds {
    pub fn validate(&self) -> Result<()> {
        let ordered = 0.0 <= self.low_max
            && self.low_max < self.medium_max
            && self.medium_max <= 100.0;
        if !ordered {
            return Err(Error::Configuration(format!(
                "thresholds must satisfy 0 <= low_max < medium_max <= 100, got {} / {}",
                self.low_max, self.medium_max
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Loads the JSON file at `path`, or the defaults when no path is given,
    /// applies environment overrides, then validates. A path that does not
    /// exist is a configuration error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Configuration(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                let data = std::fs::read_to_string(path)?;
                serde_json::from_str::<Config>(&data).map_err(|e| {
                    Error::Configuration(format!("{}: {e}", path.display()))
                })?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY") {
            self.annotation.api_key = Some(key);
        }
        if let Some(model) = non_empty("GEMINI_MODEL") {
            self.annotation.model = model;
        }
        if let Some(token) = non_empty("GOOGLE_SHEETS_ACCESS_TOKEN") {
            self.sheets.access_token = Some(token);
        }
        if let Some(id) = non_empty("GOOGLE_SHEETS_SPREADSHEET_ID") {
            self.sheets.spreadsheet_id = Some(id);
        }
        if let Some(name) = non_empty("GOOGLE_SHEETS_SPREADSHEET_NAME") {
            self.sheets.spreadsheet_name = name;
        }
        if let Some(email) = non_empty("TEACHER_EMAIL") {
            self.alert.teacher_email = Some(email);
        }
        if let Some(dir) = non_empty("STUDENT_RISK_OUTPUT_DIR") {
            self.output.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty("STUDENT_RISK_LOGS_DIR") {
            self.output.logs_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        self.thresholds.validate()?;
        if self.annotation.requests_per_minute == 0 {
            return Err(Error::Configuration(
                "annotation.requests_per_minute must be positive".to_string(),
            ));
        }
        if self.annotation.concurrency == 0 {
            return Err(Error::Configuration(
                "annotation.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
