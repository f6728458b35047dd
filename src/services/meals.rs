//! Downstream meal records created from completed analyses.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::analysis::AnalysisResult;
use crate::models::job::ImageInput;

#[async_trait]
pub trait MealCreator: Send + Sync {
    /// Persist a meal for `owner_id` and return its id.
    async fn create_meal(
        &self,
        owner_id: &str,
        image: &ImageInput,
        meal_type: &str,
        analysis: &AnalysisResult,
    ) -> Result<String, MealError>;
}

#[derive(Serialize)]
struct CreateMealBody<'a> {
    owner_id: &'a str,
    image_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail_url: Option<&'a str>,
    meal_type: &'a str,
    analysis: &'a AnalysisResult,
}

#[derive(Deserialize)]
struct CreatedMeal {
    id: String,
}

/// Meal service reached over HTTP at `POST {base}/internal/meals`.
pub struct HttpMealClient {
    http: Client,
    base_url: String,
}

impl HttpMealClient {
    pub fn new(base_url: &str) -> Result<Self, MealError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(MealError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MealCreator for HttpMealClient {
    async fn create_meal(
        &self,
        owner_id: &str,
        image: &ImageInput,
        meal_type: &str,
        analysis: &AnalysisResult,
    ) -> Result<String, MealError> {
        let body = CreateMealBody {
            owner_id,
            image_url: &image.image_url,
            thumbnail_url: image.thumbnail_url.as_deref(),
            meal_type,
            analysis,
        };

        let response = self
            .http
            .post(format!("{}/internal/meals", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(MealError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MealError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreatedMeal = response.json().await.map_err(MealError::Http)?;
        tracing::debug!(owner_id, meal_id = %created.id, "Meal created");
        Ok(created.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MealError {
    #[error("Meal service request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Meal service returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
