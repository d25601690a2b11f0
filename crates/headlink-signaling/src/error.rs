//! Signaling errors.

use thiserror::Error;

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Malformed JSON or a known message with invalid fields
    #[error("invalid signaling message: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON object without a string `type` field
    #[error("signaling message has no type")]
    MissingType,

    /// The outbound signaling channel rejected a message
    #[error("signaling sink failed: {0}")]
    Sink(String),
}
