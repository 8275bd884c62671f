use std::fmt;

use crate::error::SignalingError;

/// Negotiation lifecycle as observed by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Connected,
    OfferCreated,
    LocalDescriptionSet,
    Negotiating,
    Established,
    Closed,
    Failed(SignalingError),
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed(_))
    }

    /// The step a failure in this state is attributed to. `None` for `Idle`
    /// and the terminal states.
    pub fn step(&self) -> Option<NegotiationStep> {
        match self {
            NegotiationState::Connected => Some(NegotiationStep::Connected),
            NegotiationState::OfferCreated => Some(NegotiationStep::OfferCreated),
            NegotiationState::LocalDescriptionSet => Some(NegotiationStep::LocalDescriptionSet),
            NegotiationState::Negotiating => Some(NegotiationStep::Negotiating),
            NegotiationState::Established => Some(NegotiationStep::Established),
            NegotiationState::Idle | NegotiationState::Closed | NegotiationState::Failed(_) => {
                None
            }
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Connected => "connected",
            NegotiationState::OfferCreated => "offer_created",
            NegotiationState::LocalDescriptionSet => "local_description_set",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Established => "established",
            NegotiationState::Closed => "closed",
            NegotiationState::Failed(_) => "failed",
        }
    }
}

/// Non-terminal state a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationStep {
    Connected,
    OfferCreated,
    LocalDescriptionSet,
    Negotiating,
    Established,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NegotiationStep::Connected => "creating the local offer",
            NegotiationStep::OfferCreated => "adopting the local description",
            NegotiationStep::LocalDescriptionSet => "gathering local candidates",
            NegotiationStep::Negotiating => "awaiting the remote answer",
            NegotiationStep::Established => "applying remote candidates",
        };
        f.write_str(text)
    }
}
