//! Contract with the media-transport engine.
//!
//! The controller never reaches into ICE/DTLS internals; it only exchanges
//! descriptors through [`PeerConnection`] and receives callbacks as
//! [`PeerEvent`]s posted onto the session queue.

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::{ConnectivityCandidate, SessionDescription};

pub mod rtc;

pub use rtc::RtcPeer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PeerError(pub String);

impl PeerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        Self(err.to_string())
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError>;

    /// The engine's current local description, including any candidates it
    /// has folded in since it was adopted.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(ConnectivityCandidate),
    ConnectionStateChanged(ConnectionState),
    GatheringStateChanged(GatheringState),
}
