use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::codec::StreamIdentity;
use crate::error::{SignalingError, SignalingResult};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// When the offer is considered complete enough to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatheringPolicy {
    /// Send as soon as the engine reports its first local candidate.
    #[default]
    FirstCandidate,
    /// Wait for the engine to report that gathering has finished.
    Complete,
}

impl FromStr for GatheringPolicy {
    type Err = SignalingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first" | "first-candidate" | "first_candidate" => Ok(GatheringPolicy::FirstCandidate),
            "complete" => Ok(GatheringPolicy::Complete),
            other => Err(SignalingError::Config(format!(
                "unknown gathering policy {other:?} (expected first-candidate or complete)"
            ))),
        }
    }
}

/// Knobs the negotiation controller itself needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationConfig {
    pub stream: StreamIdentity,
    pub gathering: GatheringPolicy,
    /// Upper bound on each step before `Established`. `None` waits forever.
    pub step_timeout: Option<Duration>,
}

impl NegotiationConfig {
    pub fn new(stream: StreamIdentity) -> Self {
        Self {
            stream,
            gathering: GatheringPolicy::default(),
            step_timeout: None,
        }
    }
}

/// Static configuration for one publish session, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    pub endpoint: Url,
    pub application_name: String,
    pub stream_name: String,
    pub ice_servers: Vec<String>,
    pub gathering: GatheringPolicy,
    pub step_timeout: Option<Duration>,
}

impl PublishConfig {
    pub fn new(
        endpoint: Url,
        application_name: impl Into<String>,
        stream_name: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            application_name: application_name.into(),
            stream_name: stream_name.into(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            gathering: GatheringPolicy::default(),
            step_timeout: None,
        }
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_gathering(mut self, gathering: GatheringPolicy) -> Self {
        self.gathering = gathering;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Option<Duration>) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn validate(&self) -> SignalingResult<()> {
        if self.application_name.trim().is_empty() {
            return Err(SignalingError::Config("application name is empty".into()));
        }
        if self.stream_name.trim().is_empty() {
            return Err(SignalingError::Config("stream name is empty".into()));
        }
        if matches!(self.step_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(SignalingError::Config("step timeout must be positive".into()));
        }
        for server in &self.ice_servers {
            if !(server.starts_with("stun:")
                || server.starts_with("stuns:")
                || server.starts_with("turn:")
                || server.starts_with("turns:"))
            {
                return Err(SignalingError::Config(format!(
                    "ice server {server:?} must use a stun:, stuns:, turn: or turns: url"
                )));
            }
        }
        self.websocket_url().map(|_| ())
    }

    /// Endpoint with an HTTP scheme mapped onto its WebSocket counterpart.
    pub fn websocket_url(&self) -> SignalingResult<Url> {
        let scheme = match self.endpoint.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(SignalingError::Config(format!(
                    "unsupported signaling url scheme {other:?}"
                )));
            }
        };
        let mut url = self.endpoint.clone();
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::Config("invalid websocket scheme".into()))?;
        url.set_fragment(None);
        Ok(url)
    }

    pub fn stream_identity(&self) -> StreamIdentity {
        StreamIdentity::unassigned(&self.application_name, &self.stream_name)
    }

    pub fn negotiation(&self) -> NegotiationConfig {
        NegotiationConfig {
            stream: self.stream_identity(),
            gathering: self.gathering,
            step_timeout: self.step_timeout,
        }
    }
}
