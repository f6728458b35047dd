//! Test fixtures: tiny images and canned analysis results

#![allow(dead_code)]

use meal_analysis_queue::models::analysis::{AnalysisResult, FoodItem};
use meal_analysis_queue::models::job::{ImageInput, JobInput, NewJob};

/// A 1x1 transparent PNG.
pub const TINY_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

/// Valid base64 that is not an image.
pub const NOT_AN_IMAGE_BASE64: &str = "aGVsbG8gd29ybGQ=";

pub fn image(name: &str) -> ImageInput {
    ImageInput {
        image_url: format!("https://cdn.example/{name}.png"),
        thumbnail_url: Some(format!("https://cdn.example/{name}_thumb.png")),
        image_base64: TINY_PNG_BASE64.to_string(),
    }
}

pub fn broken_image(name: &str) -> ImageInput {
    ImageInput {
        image_base64: "%%% not base64 %%%".to_string(),
        ..image(name)
    }
}

pub fn single_job(owner: &str) -> NewJob {
    NewJob {
        owner_id: owner.to_string(),
        input: JobInput::Single {
            image: image("lunch"),
        },
        meal_type: "lunch".to_string(),
        priority: 10,
    }
}

pub fn batch_job(owner: &str, images: Vec<ImageInput>) -> NewJob {
    NewJob {
        owner_id: owner.to_string(),
        input: JobInput::Batch { images },
        meal_type: "dinner".to_string(),
        priority: 10,
    }
}

pub fn salad() -> AnalysisResult {
    AnalysisResult {
        foods: vec![FoodItem {
            name: "caesar salad".to_string(),
            portion: Some("1 bowl".to_string()),
            calories: 320.0,
            protein_g: 12.0,
            carbs_g: 14.0,
            fat_g: 24.0,
        }],
        total_calories: 320.0,
        confidence: 0.85,
        notes: None,
    }
}
