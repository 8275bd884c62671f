//! Client side of a WebRTC publish negotiation over a JSON WebSocket
//! signaling protocol.
//!
//! [`codec`] translates wire messages, [`channel`] owns the socket,
//! [`controller`] drives the offer/answer exchange against a
//! [`peer::PeerConnection`], and [`publish`] wires the three together.

pub mod channel;
pub mod codec;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod peer;
mod publish;
pub mod state;

pub use channel::{ChannelEvent, ChannelSink, SignalingChannel};
pub use codec::{
    ConnectivityCandidate, Direction, SdpKind, SessionDescription, SignalingMessage,
    StreamIdentity,
};
pub use config::{DEFAULT_STUN_SERVER, GatheringPolicy, NegotiationConfig, PublishConfig};
pub use controller::{NegotiationController, NegotiationOutcome};
pub use dispatch::{DispatchQueue, Dispatcher, dispatch_queue};
pub use error::{SignalingError, SignalingResult};
pub use peer::{ConnectionState, GatheringState, PeerConnection, PeerError, PeerEvent, RtcPeer};
pub use publish::{PublishSession, publish};
pub use state::{NegotiationState, NegotiationStep};
