//! The predictor seam and parsing of model replies.

use crate::error::{EvalError, Result};
use crate::eval::job::JobParameters;
use crate::eval::metrics::FULL_IMAGE_BBOX;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A model's answer to one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub answer: String,
    /// Normalized `[x0, y0, x1, y1]` box where the model found the answer.
    pub bbox: Vec<f64>,
}

impl Prediction {
    pub fn new(answer: impl Into<String>, bbox: [f64; 4]) -> Self {
        Self {
            answer: answer.into(),
            bbox: bbox.to_vec(),
        }
    }

    /// Check the box holds four finite coordinates inside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.bbox.len() != 4 {
            return Err(EvalError::MalformedPrediction(format!(
                "bbox must have 4 coordinates, got {}",
                self.bbox.len()
            )));
        }
        if let Some(bad) = self
            .bbox
            .iter()
            .find(|v| !v.is_finite() || !(0.0..=1.0).contains(*v))
        {
            return Err(EvalError::MalformedPrediction(format!(
                "bbox coordinate {} outside [0, 1]",
                bad
            )));
        }
        Ok(())
    }
}

/// Answers a question about a document image.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Predict the answer text and its box for one image and question.
    async fn predict(&self, image: &[u8], question: &str, language: &str) -> Result<Prediction>;
}

/// Hands out the predictor a job evaluates.
pub trait PredictorSource: Send + Sync {
    fn predictor_for(&self, params: &JobParameters) -> Result<Arc<dyn Predictor>>;
}

/// A shared predictor serves every job regardless of its model.
impl<P: Predictor + 'static> PredictorSource for Arc<P> {
    fn predictor_for(&self, _params: &JobParameters) -> Result<Arc<dyn Predictor>> {
        Ok(self.clone())
    }
}

/// Extract the JSON object from a reply that may be wrapped in a code fence.
pub fn extract_json(response: &str) -> String {
    let response = response.trim();

    if response.starts_with("```") {
        let body = response
            .find('\n')
            .map(|n| &response[n + 1..])
            .unwrap_or("");
        let body = body.trim_end();
        let body = body.strip_suffix("```").unwrap_or(body);
        return body.trim().to_string();
    }

    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return response[start..=end].to_string();
            }
        }
    }

    response.to_string()
}

/// Parse a model reply into a prediction.
///
/// Replies that are not JSON are taken verbatim as the answer with the
/// full-image box. An empty reply is malformed.
pub fn parse_prediction(response: &str) -> Result<Prediction> {
    let text = response.trim();
    if text.is_empty() {
        return Err(EvalError::MalformedPrediction(
            "empty response from predictor".to_string(),
        ));
    }

    let json_str = extract_json(text);
    let Ok(serde_json::Value::Object(parsed)) = serde_json::from_str(&json_str) else {
        return Ok(Prediction::new(text, FULL_IMAGE_BBOX));
    };

    let answer = match parsed.get("answer") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    let bbox = parsed
        .get("bbox")
        .and_then(|v| v.as_array())
        .filter(|values| values.len() == 4)
        .and_then(|values| values.iter().map(|v| v.as_f64()).collect::<Option<Vec<f64>>>())
        .unwrap_or_else(|| FULL_IMAGE_BBOX.to_vec());

    Ok(Prediction { answer, bbox })
}
