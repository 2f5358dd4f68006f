use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::export::RunContext;
use crate::models::ScoredStudent;

pub const ALERT_TYPE: &str = "HIGH_RISK_STUDENTS";

#[derive(Debug, Serialize)]
pub struct Alert<'a> {
    pub timestamp: String,
    pub alert_type: &'static str,
    pub count: usize,
    pub students: &'a [&'a ScoredStudent],
}

/// Writes a timestamped alert record for the High-risk subset. Returns
/// `None` without touching the filesystem when the subset is empty.
pub fn send_teacher_alert(
    high_risk: &[&ScoredStudent],
    run: &RunContext,
    logs_dir: &Path,
    teacher_email: Option<&str>,
) -> Result<Option<PathBuf>> {
    if high_risk.is_empty() {
        info!("no high-risk students to alert");
        return Ok(None);
    }

    let alert = Alert {
        timestamp: Utc::now().to_rfc3339(),
        alert_type: ALERT_TYPE,
        count: high_risk.len(),
        students: high_risk,
    };

    std::fs::create_dir_all(logs_dir)?;
    let path = logs_dir.join(format!("alerts_{}.json", run.stamp()));
    std::fs::write(&path, serde_json::to_string_pretty(&alert)?)?;

    warn!(count = alert.count, path = %path.display(), "high-risk students detected");
    if let Some(email) = teacher_email {
        info!(recipient = email, "teacher alert queued for e-mail delivery");
    }
    Ok(Some(path))
}
