use async_trait::async_trait;
use base64::Engine;
use garde::Validate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::models::analysis::AnalysisResult;
use crate::services::retry::FailureKind;

const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const DEFAULT_MODEL: &str = "@cf/llava-hf/llava-1.5-7b-hf";

/// The external vision service. Calls must be safe to repeat.
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn analyze(&self, image_bytes: &[u8]) -> Result<AnalysisResult, AnalysisError>;
}

/// Client for a Cloudflare Workers AI vision model.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
    api_base: String,
    model: String,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Result<Self, AnalysisError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(AnalysisError::Http)?;

        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    /// Point the client at another API root (proxies, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/accounts/{}/ai/run/{}",
            self.api_base, self.account_id, self.model
        )
    }
}

#[async_trait]
impl ImageAnalyzer for WorkersAiClient {
    /// Send a food photo to the vision model and parse its nutrition estimate.
    async fn analyze(&self, image_bytes: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        let format = image::guess_format(image_bytes)
            .map_err(|e| AnalysisError::UnsupportedImage(e.to_string()))?;
        tracing::debug!(format = ?format, bytes = image_bytes.len(), "Calling vision model");

        let prompt = concat!(
            "Identify every food item in this meal photo and estimate its nutrition. ",
            "Respond with JSON only, using exactly these fields: ",
            "foods (array of objects with name, portion, calories, protein_g, carbs_g, fat_g), ",
            "total_calories (number), confidence (0 to 1), notes (string, optional)."
        );

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "prompt": prompt,
            "max_tokens": 768
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(AnalysisError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::from_status(status, body));
        }

        let llava_resp: LlavaResponse = response.json().await.map_err(AnalysisError::from_reqwest)?;
        parse_description(&llava_resp.result.description)
    }
}

/// Extract the JSON object from the model's free-text answer.
pub fn parse_description(description: &str) -> Result<AnalysisResult, AnalysisError> {
    let start = description.find('{');
    let end = description.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &description[s..=e],
        _ => return Err(AnalysisError::Parse("no JSON object in model output".to_string())),
    };

    let mut result: AnalysisResult =
        serde_json::from_str(json).map_err(|e| AnalysisError::Parse(e.to_string()))?;

    if result.total_calories <= 0.0 && !result.foods.is_empty() {
        result.total_calories = result.foods.iter().map(|f| f.calories).sum();
    }

    result
        .validate()
        .map_err(|e| AnalysisError::Parse(e.to_string()))?;

    Ok(result)
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Analysis call timed out")]
    Timeout,

    #[error("Analysis service rate limited the request")]
    RateLimited,

    #[error("Analysis service returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("Failed to parse model output as a nutrition estimate: {0}")]
    Parse(String),
}

impl AnalysisError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AnalysisError::Timeout
        } else if e.is_decode() {
            AnalysisError::Parse(e.to_string())
        } else {
            AnalysisError::Http(e)
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => AnalysisError::RateLimited,
            StatusCode::BAD_REQUEST
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNSUPPORTED_MEDIA_TYPE
            | StatusCode::UNPROCESSABLE_ENTITY => AnalysisError::UnsupportedImage(body),
            _ => AnalysisError::Upstream {
                status: status.as_u16(),
                body,
            },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            AnalysisError::UnsupportedImage(_) => FailureKind::Permanent,
            AnalysisError::Http(_)
            | AnalysisError::Timeout
            | AnalysisError::RateLimited
            | AnalysisError::Upstream { .. }
            | AnalysisError::Parse(_) => FailureKind::Transient,
        }
    }
}
