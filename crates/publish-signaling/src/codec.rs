//! Wire codec for the JSON signaling envelope.
//!
//! The server speaks a flat JSON object:
//!
//! ```json
//! {
//!   "status": 200,
//!   "statusDescription": "OK",
//!   "direction": "publish",
//!   "command": "sendOffer",
//!   "streamInfo": { "applicationName": "live", "streamName": "cam", "sessionId": "[empty]" },
//!   "sdp": { "type": "offer", "sdp": "v=0..." },
//!   "iceCandidates": [ { "candidate": "candidate:...", "sdpMid": "0", "sdpMLineIndex": 0 } ]
//! }
//! ```
//!
//! Every field is optional on the wire. Decoding maps the envelope onto
//! [`SignalingMessage`]; encoding is the inverse and omits absent fields.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{SignalingError, SignalingResult};

/// Command used by a publisher to hand its offer to the server.
pub const COMMAND_SEND_OFFER: &str = "sendOffer";
/// Command used by a player to request the server's offer.
pub const COMMAND_GET_OFFER: &str = "getOffer";
/// Command used by a player to return its answer.
pub const COMMAND_SEND_RESPONSE: &str = "sendResponse";

/// Session id the client sends before the server assigns one.
pub const SESSION_ID_PLACEHOLDER: &str = "[empty]";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    pub application_name: String,
    pub stream_name: String,
    pub session_id: String,
}

impl StreamIdentity {
    /// Identity for a first contact, carrying the placeholder session id.
    pub fn unassigned(application_name: impl Into<String>, stream_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            stream_name: stream_name.into(),
            session_id: SESSION_ID_PLACEHOLDER.to_string(),
        }
    }

    pub fn is_assigned(&self) -> bool {
        !self.session_id.is_empty() && self.session_id != SESSION_ID_PLACEHOLDER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }

    fn parse(token: &str) -> SignalingResult<Self> {
        match token {
            "offer" => Ok(SdpKind::Offer),
            "answer" => Ok(SdpKind::Answer),
            other => Err(SignalingError::MalformedMessage(format!(
                "unknown sdp type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: u16,
}

impl ConnectivityCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: 0,
        }
    }

    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = sdp_mline_index;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Publish,
    Subscribe,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Publish => "publish",
            Direction::Subscribe => "subscribe",
        }
    }

    fn parse(token: &str) -> SignalingResult<Self> {
        match token {
            "publish" => Ok(Direction::Publish),
            "subscribe" | "play" => Ok(Direction::Subscribe),
            other => Err(SignalingError::MalformedMessage(format!(
                "unknown direction {other:?}"
            ))),
        }
    }
}

/// Decoded signaling envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalingMessage {
    pub status: i32,
    pub status_text: Option<String>,
    pub direction: Option<Direction>,
    pub command: Option<String>,
    pub stream: Option<StreamIdentity>,
    pub description: Option<SessionDescription>,
    pub candidates: Option<Vec<ConnectivityCandidate>>,
}

impl SignalingMessage {
    /// The `sendOffer` message a publisher sends once its local description
    /// is ready.
    pub fn publish_offer(stream: &StreamIdentity, description: &SessionDescription) -> Self {
        Self {
            direction: Some(Direction::Publish),
            command: Some(COMMAND_SEND_OFFER.to_string()),
            stream: Some(stream.clone()),
            description: Some(description.clone()),
            ..Self::default()
        }
    }

    /// Server-side rejection carried in the status field, if any.
    pub fn status_error(&self) -> Option<SignalingError> {
        if self.status >= 400 {
            Some(SignalingError::Rejected {
                status: self.status,
                description: self.status_text.clone(),
            })
        } else {
            None
        }
    }

    pub fn has_candidates(&self) -> bool {
        self.candidates.as_ref().is_some_and(|list| !list.is_empty())
    }
}

/// Commands whose messages must carry an explicit `sdp.type`.
pub fn is_exchange_command(command: &str) -> bool {
    matches!(
        command,
        COMMAND_SEND_OFFER | COMMAND_GET_OFFER | COMMAND_SEND_RESPONSE
    )
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream_info: Option<WireStreamInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<WireSdp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ice_candidates: Option<Vec<WireCandidate>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireStreamInfo {
    #[serde(deserialize_with = "null_as_default")]
    application_name: String,
    #[serde(deserialize_with = "null_as_default")]
    stream_name: String,
    #[serde(deserialize_with = "null_as_default")]
    session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSdp {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    sdp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCandidate {
    #[serde(default, deserialize_with = "null_as_default")]
    candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        deserialize_with = "null_as_default"
    )]
    sdp_mline_index: u16,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse an inbound payload.
pub fn decode(payload: &[u8]) -> SignalingResult<SignalingMessage> {
    let wire: WireMessage = serde_json::from_slice(payload)?;

    let direction = wire.direction.as_deref().map(Direction::parse).transpose()?;
    let exchange = wire.command.as_deref().is_some_and(is_exchange_command);

    let description = match wire.sdp {
        Some(WireSdp {
            kind: Some(kind),
            sdp,
        }) => Some(SessionDescription {
            kind: SdpKind::parse(&kind)?,
            sdp,
        }),
        Some(WireSdp { kind: None, .. }) if exchange => {
            return Err(SignalingError::MalformedMessage(format!(
                "sdp.type missing for command {:?}",
                wire.command.as_deref().unwrap_or_default()
            )));
        }
        // Server responses outside an exchange command only ever carry answers.
        Some(WireSdp { kind: None, sdp }) => Some(SessionDescription::answer(sdp)),
        None => None,
    };

    let stream = wire.stream_info.map(|info| StreamIdentity {
        application_name: info.application_name,
        stream_name: info.stream_name,
        session_id: info.session_id,
    });

    let candidates = wire.ice_candidates.map(|list| {
        list.into_iter()
            .map(|c| ConnectivityCandidate {
                candidate: c.candidate,
                sdp_mid: c.sdp_mid,
                sdp_mline_index: c.sdp_mline_index,
            })
            .collect()
    });

    Ok(SignalingMessage {
        status: wire.status,
        status_text: wire.status_description,
        direction,
        command: wire.command,
        stream,
        description,
        candidates,
    })
}

/// Serialize an outbound message. Absent fields are omitted.
pub fn encode(message: &SignalingMessage) -> SignalingResult<Bytes> {
    let wire = WireMessage {
        status: message.status,
        status_description: message.status_text.clone(),
        direction: message.direction.map(|d| d.as_str().to_string()),
        command: message.command.clone(),
        stream_info: message.stream.as_ref().map(|stream| WireStreamInfo {
            application_name: stream.application_name.clone(),
            stream_name: stream.stream_name.clone(),
            session_id: stream.session_id.clone(),
        }),
        sdp: message.description.as_ref().map(|desc| WireSdp {
            kind: Some(desc.kind.as_str().to_string()),
            sdp: desc.sdp.clone(),
        }),
        ice_candidates: message.candidates.as_ref().map(|list| {
            list.iter()
                .map(|c| WireCandidate {
                    candidate: c.candidate.clone(),
                    sdp_mid: c.sdp_mid.clone(),
                    sdp_mline_index: c.sdp_mline_index,
                })
                .collect()
        }),
    };
    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .map_err(|err| SignalingError::Encode(err.to_string()))
}
