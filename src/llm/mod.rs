//! Predictor integration module.
//!
//! Provides the [`Predictor`] seam the evaluation engine calls, an
//! OpenAI-compatible vision client implementing it, and the prompts sent
//! for each answer language.

mod client;
mod predictor;
mod prompts;

pub use client::{LlmClient, Message, image_mime_type};
pub use predictor::{Prediction, Predictor, PredictorSource, extract_json, parse_prediction};
pub use prompts::{DEFAULT_LANGUAGE, Prompts};
