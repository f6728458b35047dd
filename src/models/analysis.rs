use garde::Validate;
use serde::{Deserialize, Serialize};

/// One food item recognised in a photo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct FoodItem {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(skip)]
    #[serde(default)]
    pub portion: Option<String>,

    #[garde(range(min = 0.0, max = 10000.0))]
    pub calories: f64,

    #[garde(range(min = 0.0))]
    #[serde(default)]
    pub protein_g: f64,

    #[garde(range(min = 0.0))]
    #[serde(default)]
    pub carbs_g: f64,

    #[garde(range(min = 0.0))]
    #[serde(default)]
    pub fat_g: f64,
}

/// Structured output of the vision model for one photo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct AnalysisResult {
    #[garde(dive)]
    pub foods: Vec<FoodItem>,

    #[garde(range(min = 0.0))]
    pub total_calories: f64,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Outcome of one image inside a batch job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItemOutcome {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemOutcome {
    pub fn succeeded(&self) -> bool {
        self.meal_id.is_some()
    }
}
