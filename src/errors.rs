// src/errors.rs

use thiserror::Error;

use crate::llm::local::LocalLlmError;

/// Crate-wide error type.
///
/// Quota and entitlement denials are NOT represented here: they are ordinary
/// return values (`AiAvailability`), because an exhausted budget is expected
/// steady-state behavior, not a fault.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    // --- External Service Errors ---
    #[error("Cloud API error: {0}")]
    CloudApi(String),

    #[error("HTTP request error: {0}")]
    HttpRequest(String),

    #[error(transparent)]
    LocalLlm(#[from] LocalLlmError),

    // --- Persistence Errors ---
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // --- General/Internal Errors ---
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpRequest(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
