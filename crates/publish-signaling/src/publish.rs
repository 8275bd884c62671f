use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::channel::{ChannelSink, SignalingChannel};
use crate::config::{NegotiationConfig, PublishConfig};
use crate::controller::{NegotiationController, NegotiationOutcome};
use crate::dispatch::{DispatchQueue, Dispatcher, dispatch_queue};
use crate::error::{SignalingError, SignalingResult};
use crate::peer::{PeerConnection, RtcPeer};
use crate::state::{NegotiationState, NegotiationStep};

/// Open a signaling channel to the configured endpoint and start publishing
/// over a fresh [`RtcPeer`].
pub async fn publish(config: &PublishConfig) -> SignalingResult<PublishSession> {
    config.validate()?;
    let url = config.websocket_url()?;
    let (dispatcher, queue) = dispatch_queue();
    let peer = RtcPeer::new(&config.ice_servers, dispatcher.clone())
        .await
        .map_err(|err| SignalingError::negotiation(NegotiationStep::Connected, err))?;
    tracing::info!(
        target = "publish",
        url = %url,
        application = %config.application_name,
        stream = %config.stream_name,
        "starting publish session"
    );
    Ok(PublishSession::start(
        &url,
        config.negotiation(),
        Arc::new(peer),
        dispatcher,
        queue,
    ))
}

/// A running publish negotiation.
pub struct PublishSession<P: PeerConnection = RtcPeer> {
    peer: Arc<P>,
    channel: Arc<SignalingChannel>,
    state: watch::Receiver<NegotiationState>,
    task: JoinHandle<NegotiationOutcome>,
}

impl<P: PeerConnection> PublishSession<P> {
    /// Wire a peer to a new signaling channel. `peer` must post its events
    /// through `dispatcher`, and `queue` must be the other end of it.
    pub fn start(
        endpoint: &Url,
        negotiation: NegotiationConfig,
        peer: Arc<P>,
        dispatcher: Dispatcher,
        queue: DispatchQueue,
    ) -> Self {
        let channel = Arc::new(SignalingChannel::open(endpoint, dispatcher.clone()));
        let controller = NegotiationController::new(
            negotiation,
            Arc::clone(&peer),
            Arc::clone(&channel) as Arc<dyn ChannelSink>,
            dispatcher,
        );
        let state = controller.subscribe();
        let task = tokio::spawn(controller.run(queue));
        Self {
            peer,
            channel,
            state,
            task,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state.borrow().clone()
    }

    pub fn peer(&self) -> &Arc<P> {
        &self.peer
    }

    /// Resolve once the answer has been applied, or with the reason the
    /// session ended first.
    pub async fn wait_established(&mut self) -> SignalingResult<()> {
        let reached = self
            .state
            .wait_for(|state| *state == NegotiationState::Established || state.is_terminal())
            .await
            .map(|state| state.clone());
        let state = match reached {
            Ok(state) => state,
            // The controller is gone; its last published state is final.
            Err(_) => self.state.borrow().clone(),
        };
        match state {
            NegotiationState::Established => Ok(()),
            NegotiationState::Failed(err) => Err(err),
            _ => Err(SignalingError::ChannelClosed),
        }
    }

    /// Resolve with the terminal state once the session has closed or failed.
    pub async fn wait_finished(&mut self) -> NegotiationState {
        let reached = self
            .state
            .wait_for(NegotiationState::is_terminal)
            .await
            .map(|state| state.clone());
        reached.unwrap_or_else(|_| self.state.borrow().clone())
    }

    /// Ask the server to end the session. The controller tears down the
    /// peer once the channel reports closed.
    pub fn close(&self) {
        self.channel.close();
    }

    pub async fn join(self) -> SignalingResult<NegotiationOutcome> {
        self.task
            .await
            .map_err(|err| SignalingError::ChannelError(format!("negotiation task ended abnormally: {err}")))
    }
}

impl PublishSession<RtcPeer> {
    /// Outbound H.264 track. Write encoded samples here once established.
    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        self.peer.video_track()
    }
}
