//! External reasoning collaborator: prompt, client, and response parser.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::AnnotationConfig;
use crate::error::AnnotationError;
use crate::models::{Annotation, DerivedFeatures, Intervention, InterventionKind, RiskLevel};

pub const MAX_REASONS: usize = 3;
pub const MAX_INTERVENTIONS: usize = 4;

/// The four scalars sent to the collaborator for one student.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRequest {
    pub attendance_pct: f64,
    pub final_grade: f64,
    pub trend_recent: f64,
    pub missing_assignments: u8,
}

impl From<&DerivedFeatures> for AnnotationRequest {
    fn from(features: &DerivedFeatures) -> Self {
        Self {
            attendance_pct: features.attendance_pct,
            final_grade: features.final_grade,
            trend_recent: features.trend_recent,
            missing_assignments: features.missing_assignments,
        }
    }
}

#[async_trait]
pub trait Annotator: Send + Sync {
    async fn annotate(&self, request: &AnnotationRequest) -> Result<Annotation, AnnotationError>;
}

pub fn build_prompt(request: &AnnotationRequest) -> String {
    format!(
        r#"You are an expert in student performance analytics.

INPUT:
{{
 "attendance_pct": {attendance:.1},
 "final_grade": {grade:.1},
 "trend_recent": {trend:.1},
 "missing_assignments": {missing}
}}

REQUIREMENTS:
- Compute risk_score 0-100
- Determine risk_level: Low/Medium/High
- Give 3 key_risk reasons
- Provide max 4 interventions (teacher+parent)
- Output strictly in JSON format

If missing input -> {{"error": "missing field"}}

OUTPUT FORMAT (strict JSON):
{{
  "risk_score": <number 0-100>,
  "risk_level": "<Low|Medium|High>",
  "key_risk_reasons": ["<reason 1>", "<reason 2>", "<reason 3>"],
  "interventions": [
    {{"type": "<teacher|parent>", "action": "<specific intervention>"}}
  ]
}}
"#,
        attendance = request.attendance_pct,
        grade = request.final_grade,
        trend = request.trend_recent,
        missing = request.missing_assignments,
    )
}

/// Stage one: strips fenced-block or free-text wrapping around a JSON object.
pub fn strip_wrapper(text: &str) -> Option<&str> {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        let end = body.find("```").unwrap_or(body.len());
        return Some(body[..end].trim());
    }
    if let Some(start) = text.find("```") {
        let body = &text[start + 3..];
        let end = body.find("```").unwrap_or(body.len());
        return Some(body[..end].trim());
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    }
}

/// Parses collaborator output into a validated annotation. Never panics;
/// anything unexpected becomes [`AnnotationError::Malformed`].
pub fn parse_response(text: &str) -> Result<Annotation, AnnotationError> {
    let body = strip_wrapper(text).ok_or_else(|| {
        AnnotationError::Malformed(format!("no JSON object in response: {}", preview(text)))
    })?;

    let value: Value = serde_json::from_str(body)
        .map_err(|e| AnnotationError::Malformed(format!("invalid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| AnnotationError::Malformed("response is not a JSON object".to_string()))?;

    if let Some(error) = object.get("error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(AnnotationError::Reported(message));
    }

    let risk_score = object
        .get("risk_score")
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite() && (0.0..=100.0).contains(s))
        .ok_or_else(|| malformed("risk_score must be a number in 0-100"))?;

    let risk_level = object
        .get("risk_level")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("risk_level must be a string"))?
        .parse::<RiskLevel>()
        .map_err(AnnotationError::Malformed)?;

    let key_risk_reasons = object
        .get("key_risk_reasons")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("key_risk_reasons must be a list"))?
        .iter()
        .map(|reason| {
            reason
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed("key_risk_reasons entries must be strings"))
        })
        .take(MAX_REASONS)
        .collect::<Result<Vec<_>, _>>()?;

    let interventions = object
        .get("interventions")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("interventions must be a list"))?
        .iter()
        .take(MAX_INTERVENTIONS)
        .map(parse_intervention)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Annotation {
        risk_score,
        risk_level,
        key_risk_reasons,
        interventions,
    })
}

fn parse_intervention(value: &Value) -> Result<Intervention, AnnotationError> {
    let kind = match value.get("type").and_then(Value::as_str).map(str::trim) {
        Some(kind) if kind.eq_ignore_ascii_case("teacher") => InterventionKind::Teacher,
        Some(kind) if kind.eq_ignore_ascii_case("parent") => InterventionKind::Parent,
        other => {
            return Err(malformed(&format!(
                "intervention type must be teacher or parent, got {other:?}"
            )))
        }
    };
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| malformed("intervention action must be a non-empty string"))?;
    Ok(Intervention {
        kind,
        action: action.to_string(),
    })
}

fn malformed(message: &str) -> AnnotationError {
    AnnotationError::Malformed(message.to_string())
}

fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// Annotator backed by the Gemini `generateContent` endpoint.
pub struct GeminiAnnotator {
    config: AnnotationConfig,
    client: reqwest::Client,
}

impl GeminiAnnotator {
    pub fn new(config: AnnotationConfig) -> Result<Self, AnnotationError> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(AnnotationError::MissingCredentials("GEMINI_API_KEY"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AnnotationError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    async fn generate(&self, prompt: String) -> Result<String, AnnotationError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(AnnotationError::MissingCredentials("GEMINI_API_KEY"))?;
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                top_k: self.config.top_k,
                max_output_tokens: self.config.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| AnnotationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnnotationError::Status {
                status: status.as_u16(),
                body: preview(&body),
            });
        }

        let data: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnnotationError::Malformed(format!("unexpected response body: {e}")))?;

        let text: String = data
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(malformed("empty candidate text"));
        }
        Ok(text)
    }
}

#[async_trait]
impl Annotator for GeminiAnnotator {
    async fn annotate(&self, request: &AnnotationRequest) -> Result<Annotation, AnnotationError> {
        debug!(model = %self.config.model, "requesting annotation");
        let text = self.generate(build_prompt(request)).await?;
        parse_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "risk_score": 72.5,
        "risk_level": "High",
        "key_risk_reasons": ["low attendance", "falling grades", "past failures"],
        "interventions": [
            {"type": "teacher", "action": "weekly check-in"},
            {"type": "parent", "action": "review homework schedule"}
        ]
    }"#;

    #[test]
    fn parses_bare_json() {
        let annotation = parse_response(VALID).unwrap();
        assert_eq!(annotation.risk_score, 72.5);
        assert_eq!(annotation.risk_level, RiskLevel::High);
        assert_eq!(annotation.key_risk_reasons.len(), 3);
        assert_eq!(annotation.interventions[1].kind, InterventionKind::Parent);
    }

    #[test]
    fn tolerates_fenced_and_prose_wrapping() {
        let fenced = format!("Here is the analysis:\n```json\n{VALID}\n```\nThanks");
        assert!(parse_response(&fenced).is_ok());

        let plain_fence = format!("```\n{VALID}\n```");
        assert!(parse_response(&plain_fence).is_ok());

        let prose = format!("Sure! {VALID} Let me know if you need more.");
        assert!(parse_response(&prose).is_ok());
    }

    #[test]
    fn garbage_fails_closed() {
        assert!(matches!(
            parse_response("I cannot help with that."),
            Err(AnnotationError::Malformed(_))
        ));
        assert!(matches!(
            parse_response("{ this is not json }"),
            Err(AnnotationError::Malformed(_))
        ));
        assert!(matches!(parse_response(""), Err(AnnotationError::Malformed(_))));
    }

    #[test]
    fn reported_error_is_surfaced() {
        assert_eq!(
            parse_response(r#"{"error": "missing field"}"#),
            Err(AnnotationError::Reported("missing field".to_string()))
        );
    }

    #[test]
    fn validates_shape() {
        let out_of_range = VALID.replace("72.5", "140");
        assert!(parse_response(&out_of_range).is_err());

        let bad_level = VALID.replace("\"High\"", "\"Severe\"");
        assert!(parse_response(&bad_level).is_err());

        let bad_kind = VALID.replace("\"parent\"", "\"counselor\"");
        assert!(parse_response(&bad_kind).is_err());

        let missing = r#"{"risk_score": 10, "risk_level": "Low"}"#;
        assert!(parse_response(missing).is_err());
    }

    #[test]
    fn truncates_long_lists() {
        let long = r#"{
            "risk_score": 10, "risk_level": "low",
            "key_risk_reasons": ["a", "b", "c", "d"],
            "interventions": [
                {"type": "teacher", "action": "1"}, {"type": "teacher", "action": "2"},
                {"type": "parent", "action": "3"}, {"type": "parent", "action": "4"},
                {"type": "parent", "action": "5"}
            ]
        }"#;
        let annotation = parse_response(long).unwrap();
        assert_eq!(annotation.risk_level, RiskLevel::Low);
        assert_eq!(annotation.key_risk_reasons.len(), MAX_REASONS);
        assert_eq!(annotation.interventions.len(), MAX_INTERVENTIONS);
    }

    #[test]
    fn prompt_carries_the_four_inputs() {
        let prompt = build_prompt(&AnnotationRequest {
            attendance_pct: 87.5,
            final_grade: 11.0,
            trend_recent: -2.0,
            missing_assignments: 1,
        });
        assert!(prompt.contains("\"attendance_pct\": 87.5"));
        assert!(prompt.contains("\"trend_recent\": -2.0"));
        assert!(prompt.contains("\"missing_assignments\": 1"));
    }

    #[test]
    fn client_requires_api_key() {
        assert!(matches!(
            GeminiAnnotator::new(AnnotationConfig::default()),
            Err(AnnotationError::MissingCredentials(_))
        ));
    }
}
