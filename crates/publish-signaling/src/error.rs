use thiserror::Error;

use crate::state::NegotiationStep;

/// Failures surfaced by a publish negotiation. Every variant is terminal for
/// the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("malformed signaling message: {0}")]
    MalformedMessage(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("negotiation failed while {step}: {reason}")]
    NegotiationFailure {
        step: NegotiationStep,
        reason: String,
    },
    #[error("signaling channel error: {0}")]
    ChannelError(String),
    #[error("server rejected request with status {status}: {}", description.as_deref().unwrap_or("no description"))]
    Rejected {
        status: i32,
        description: Option<String>,
    },
    #[error("timed out while {step}")]
    Timeout { step: NegotiationStep },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to encode signaling message: {0}")]
    Encode(String),
}

impl SignalingError {
    pub(crate) fn negotiation(step: NegotiationStep, reason: impl ToString) -> Self {
        SignalingError::NegotiationFailure {
            step,
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::MalformedMessage(err.to_string())
    }
}

pub type SignalingResult<T> = Result<T, SignalingError>;
