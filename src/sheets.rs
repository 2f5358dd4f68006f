//! Spreadsheet sink over the Google Sheets values API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SheetsConfig;
use crate::error::SinkError;
use crate::export::{table, CellValue, RunContext, Sink};
use crate::pipeline::ScoredBatch;

const SINK_NAME: &str = "google_sheets";

#[derive(Debug, Serialize)]
struct ValueRange {
    range: String,
    #[serde(rename = "majorDimension")]
    major_dimension: &'static str,
    values: Vec<Vec<String>>,
}

pub struct SheetsSink {
    config: SheetsConfig,
    client: reqwest::Client,
}

impl SheetsSink {
    pub fn new(config: SheetsConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SinkError::new(SINK_NAME, e))?;
        Ok(Self { config, client })
    }

    fn credentials(&self) -> Result<(&str, &str), SinkError> {
        let token = self
            .config
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SinkError::new(SINK_NAME, "GOOGLE_SHEETS_ACCESS_TOKEN is not set"))?;
        let spreadsheet = self
            .config
            .spreadsheet_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SinkError::new(SINK_NAME, "GOOGLE_SHEETS_SPREADSHEET_ID is not set"))?;
        Ok((token, spreadsheet))
    }

    /// Values endpoint for the configured worksheet. The spreadsheet id and
    /// worksheet name are percent-encoded as single path segments.
    fn values_url(&self, spreadsheet: &str, suffix: &str) -> Result<reqwest::Url, SinkError> {
        let mut url = reqwest::Url::parse(&self.config.base_url)
            .map_err(|e| SinkError::new(SINK_NAME, format!("invalid base url: {e}")))?;
        let worksheet = format!("{}{suffix}", self.config.worksheet);
        url.path_segments_mut()
            .map_err(|_| SinkError::new(SINK_NAME, "base url cannot carry a path"))?
            .pop_if_empty()
            .extend([
                "v4",
                "spreadsheets",
                spreadsheet,
                "values",
                worksheet.as_str(),
            ]);
        Ok(url)
    }

    pub fn spreadsheet_url(spreadsheet: &str) -> String {
        format!("https://docs.google.com/spreadsheets/d/{spreadsheet}")
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(), SinkError> {
        let response = request
            .send()
            .await
            .map_err(|e| SinkError::new(SINK_NAME, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::new(SINK_NAME, format!("{status} {body}")));
        }
        Ok(())
    }
}

/// Header row followed by one display-formatted row per student.
pub fn sheet_values(batch: &ScoredBatch) -> Vec<Vec<String>> {
    let (header, rows) = table(batch, CellValue::to_display);
    std::iter::once(header).chain(rows).collect()
}

#[async_trait]
impl Sink for SheetsSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn export(&self, batch: &ScoredBatch, _run: &RunContext) -> Result<String, SinkError> {
        let (token, spreadsheet) = self.credentials()?;

        debug!(worksheet = %self.config.worksheet, "clearing worksheet");
        self.send(
            self.client
                .post(self.values_url(spreadsheet, ":clear")?)
                .bearer_auth(token)
                .json(&serde_json::json!({})),
        )
        .await?;

        let body = ValueRange {
            range: self.config.worksheet.clone(),
            major_dimension: "ROWS",
            values: sheet_values(batch),
        };
        self.send(
            self.client
                .put(self.values_url(spreadsheet, "")?)
                .query(&[("valueInputOption", "RAW")])
                .bearer_auth(token)
                .json(&body),
        )
        .await?;

        info!(
            rows = batch.len(),
            spreadsheet = %self.config.spreadsheet_name,
            "wrote student records to spreadsheet"
        );
        Ok(Self::spreadsheet_url(spreadsheet))
    }
}
