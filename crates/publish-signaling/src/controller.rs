//! Negotiation state machine.
//!
//! The controller is the single consumer of the session queue. `handle` is
//! synchronous: it applies one input, issues that transition's side effects
//! (an engine call spawned onto the runtime, or a channel send) and returns
//! before the next input is looked at. Engine calls report back by posting a
//! [`Completion`] onto the same queue; a completion that arrives when the
//! state it was issued from no longer holds is dropped.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::channel::{ChannelEvent, ChannelSink};
use crate::codec::{self, ConnectivityCandidate, SdpKind, SessionDescription, SignalingMessage, StreamIdentity};
use crate::config::{GatheringPolicy, NegotiationConfig};
use crate::dispatch::{DispatchQueue, Dispatcher, SessionInput};
use crate::error::SignalingError;
use crate::peer::{ConnectionState, GatheringState, PeerConnection, PeerError, PeerEvent};
use crate::state::{NegotiationState, NegotiationStep};

#[derive(Debug)]
pub(crate) enum Completion {
    OfferCreated(Result<SessionDescription, PeerError>),
    LocalDescriptionSet(Result<(), PeerError>),
    LocalSnapshot(Option<SessionDescription>),
    RemoteDescriptionSet(Result<(), PeerError>),
    Deadline { epoch: u64 },
}

/// Result of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOutcome {
    /// `Closed` or `Failed`.
    pub state: NegotiationState,
    /// Whether the session reached `Established` before it ended.
    pub established: bool,
    /// Session id assigned by the server, when it sent one.
    pub server_session_id: Option<String>,
}

/// Per-connection negotiation data. Created when the channel opens and
/// dropped when the session ends.
struct NegotiationSession<P> {
    peer: Arc<P>,
    stream: StreamIdentity,
    local: Option<SessionDescription>,
    pending_remote: Vec<ConnectivityCandidate>,
    local_ready: bool,
    snapshot_requested: bool,
    remote_requested: bool,
    applier: Option<mpsc::UnboundedSender<ConnectivityCandidate>>,
}

pub struct NegotiationController<P: PeerConnection> {
    config: NegotiationConfig,
    channel: Arc<dyn ChannelSink>,
    dispatcher: Dispatcher,
    peer: Option<Arc<P>>,
    session: Option<NegotiationSession<P>>,
    state: NegotiationState,
    epoch: u64,
    established: bool,
    server_session_id: Option<String>,
    state_tx: watch::Sender<NegotiationState>,
}

impl<P: PeerConnection> NegotiationController<P> {
    pub fn new(
        config: NegotiationConfig,
        peer: Arc<P>,
        channel: Arc<dyn ChannelSink>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        Self {
            config,
            channel,
            dispatcher,
            peer: Some(peer),
            session: None,
            state: NegotiationState::Idle,
            epoch: 0,
            established: false,
            server_session_id: None,
            state_tx,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    /// Drain the session queue until the negotiation closes or fails.
    pub async fn run(mut self, mut queue: DispatchQueue) -> NegotiationOutcome {
        while !self.state.is_terminal() {
            match queue.next().await {
                Some(input) => self.handle(input),
                None => {
                    self.transition(NegotiationState::Closed);
                    self.teardown();
                }
            }
        }
        queue.close();
        NegotiationOutcome {
            state: self.state.clone(),
            established: self.established,
            server_session_id: self.server_session_id.clone(),
        }
    }

    pub(crate) fn handle(&mut self, input: SessionInput) {
        if self.state.is_terminal() {
            tracing::trace!(target = "publish", input = ?input, "session finished; ignoring input");
            return;
        }
        match input {
            SessionInput::Channel(event) => self.on_channel(event),
            SessionInput::Peer(event) => self.on_peer(event),
            SessionInput::Completion(completion) => self.on_completion(completion),
        }
    }

    fn on_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => self.on_opened(),
            ChannelEvent::Message(payload) => self.on_message(&payload),
            ChannelEvent::Error(reason) => self.fail(SignalingError::ChannelError(reason)),
            ChannelEvent::Closed { code, reason } => {
                tracing::info!(target = "publish", code = ?code, reason = %reason, "signaling channel closed");
                self.transition(NegotiationState::Closed);
                self.teardown();
            }
        }
    }

    fn on_opened(&mut self) {
        if self.state != NegotiationState::Idle {
            tracing::warn!(target = "publish", state = self.state.label(), "duplicate channel open ignored");
            return;
        }
        let Some(peer) = self.peer.take() else {
            self.fail(SignalingError::negotiation(
                NegotiationStep::Connected,
                "peer connection already consumed",
            ));
            return;
        };
        self.session = Some(NegotiationSession {
            peer: Arc::clone(&peer),
            stream: self.config.stream.clone(),
            local: None,
            pending_remote: Vec::new(),
            local_ready: false,
            snapshot_requested: false,
            remote_requested: false,
            applier: None,
        });
        self.transition(NegotiationState::Connected);
        self.spawn_completion(async move { Completion::OfferCreated(peer.create_offer().await) });
    }

    fn on_message(&mut self, payload: &[u8]) {
        let message = match codec::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        tracing::debug!(
            target = "publish",
            status = message.status,
            command = ?message.command,
            has_sdp = message.description.is_some(),
            candidates = message.candidates.as_ref().map_or(0, Vec::len),
            "signaling message received"
        );
        if let Some(err) = message.status_error() {
            self.fail(err);
            return;
        }
        if let Some(stream) = message.stream.as_ref().filter(|stream| stream.is_assigned()) {
            if self.server_session_id.as_deref() != Some(stream.session_id.as_str()) {
                tracing::debug!(target = "publish", session_id = %stream.session_id, "server assigned session id");
                self.server_session_id = Some(stream.session_id.clone());
            }
        }

        let SignalingMessage {
            description,
            candidates,
            ..
        } = message;
        let candidates = candidates.unwrap_or_default();
        match description {
            Some(description) => self.on_remote_description(description, candidates),
            None => self.on_remote_candidates(candidates),
        }
    }

    fn on_remote_description(
        &mut self,
        description: SessionDescription,
        candidates: Vec<ConnectivityCandidate>,
    ) {
        if description.kind == SdpKind::Offer {
            tracing::warn!(target = "publish", state = self.state.label(), "unexpected remote offer ignored");
            return;
        }
        match self.state {
            NegotiationState::Negotiating => {}
            NegotiationState::Established => {
                tracing::debug!(target = "publish", "answer after establishment ignored");
                return;
            }
            _ => {
                tracing::warn!(target = "publish", state = self.state.label(), "answer before offer was sent ignored");
                return;
            }
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.remote_requested {
            tracing::warn!(target = "publish", "duplicate answer ignored");
            return;
        }
        session.remote_requested = true;
        session.pending_remote.extend(candidates);
        let peer = Arc::clone(&session.peer);
        self.spawn_completion(async move {
            Completion::RemoteDescriptionSet(peer.set_remote_description(description).await)
        });
    }

    fn on_remote_candidates(&mut self, candidates: Vec<ConnectivityCandidate>) {
        if candidates.is_empty() {
            return;
        }
        let established = self.state == NegotiationState::Established;
        let Some(session) = self.session.as_mut() else {
            tracing::warn!(target = "publish", count = candidates.len(), "candidates before channel open dropped");
            return;
        };
        match (&session.applier, established) {
            (Some(applier), true) => {
                for candidate in candidates {
                    let _ = applier.send(candidate);
                }
            }
            _ => {
                tracing::debug!(
                    target = "publish",
                    count = candidates.len(),
                    "buffering remote candidates until the answer is applied"
                );
                session.pending_remote.extend(candidates);
            }
        }
    }

    fn on_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                tracing::trace!(target = "publish", candidate = %candidate.candidate, "local candidate gathered");
                if self.config.gathering == GatheringPolicy::FirstCandidate {
                    self.local_ready();
                }
            }
            PeerEvent::GatheringStateChanged(state) => {
                tracing::debug!(target = "publish", state = ?state, "ice gathering state changed");
                if state == GatheringState::Complete && self.config.gathering == GatheringPolicy::Complete {
                    self.local_ready();
                }
            }
            PeerEvent::ConnectionStateChanged(state) => match state {
                ConnectionState::Failed | ConnectionState::Disconnected => {
                    tracing::warn!(target = "publish", state = ?state, "peer connection state changed");
                }
                _ => {
                    tracing::info!(target = "publish", state = ?state, "peer connection state changed");
                }
            },
        }
    }

    /// The gathering policy says the local description may be sent.
    fn local_ready(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.local_ready {
            return;
        }
        match self.state {
            // Set-local has not completed yet; act on it once it does.
            NegotiationState::Connected | NegotiationState::OfferCreated => {
                session.local_ready = true;
            }
            NegotiationState::LocalDescriptionSet => {
                session.local_ready = true;
                self.request_snapshot();
            }
            _ => {}
        }
    }

    fn request_snapshot(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.snapshot_requested {
            return;
        }
        session.snapshot_requested = true;
        let peer = Arc::clone(&session.peer);
        self.spawn_completion(async move { Completion::LocalSnapshot(peer.local_description().await) });
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::OfferCreated(result) => {
                if self.state != NegotiationState::Connected {
                    return self.stale("offer created");
                }
                match result {
                    Ok(offer) => {
                        let Some(session) = self.session.as_mut() else {
                            return;
                        };
                        session.local = Some(offer.clone());
                        let peer = Arc::clone(&session.peer);
                        self.transition(NegotiationState::OfferCreated);
                        self.spawn_completion(async move {
                            Completion::LocalDescriptionSet(peer.set_local_description(offer).await)
                        });
                    }
                    Err(err) => self.fail(SignalingError::negotiation(NegotiationStep::Connected, err)),
                }
            }
            Completion::LocalDescriptionSet(result) => {
                if self.state != NegotiationState::OfferCreated {
                    return self.stale("local description set");
                }
                match result {
                    Ok(()) => {
                        self.transition(NegotiationState::LocalDescriptionSet);
                        if self.session.as_ref().is_some_and(|s| s.local_ready) {
                            self.request_snapshot();
                        }
                    }
                    Err(err) => self.fail(SignalingError::negotiation(NegotiationStep::OfferCreated, err)),
                }
            }
            Completion::LocalSnapshot(snapshot) => {
                if self.state != NegotiationState::LocalDescriptionSet {
                    return self.stale("local description snapshot");
                }
                self.send_offer(snapshot);
            }
            Completion::RemoteDescriptionSet(result) => {
                if self.state != NegotiationState::Negotiating {
                    return self.stale("remote description set");
                }
                match result {
                    Ok(()) => self.establish(),
                    Err(err) => self.fail(SignalingError::negotiation(NegotiationStep::Negotiating, err)),
                }
            }
            Completion::Deadline { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                if let Some(step) = self.state.step() {
                    self.fail(SignalingError::Timeout { step });
                }
            }
        }
    }

    fn send_offer(&mut self, snapshot: Option<SessionDescription>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(description) = snapshot.or_else(|| session.local.clone()) else {
            self.fail(SignalingError::negotiation(
                NegotiationStep::LocalDescriptionSet,
                "engine has no local description",
            ));
            return;
        };
        let message = SignalingMessage::publish_offer(&session.stream, &description);
        let sent = codec::encode(&message).and_then(|payload| {
            let len = payload.len();
            self.channel.send(payload).map(|()| len)
        });
        match sent {
            Ok(len) => {
                tracing::info!(target = "publish", len, "publish offer sent");
                self.transition(NegotiationState::Negotiating);
            }
            Err(err) => self.fail(err),
        }
    }

    fn establish(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let buffered = std::mem::take(&mut session.pending_remote);
        tracing::info!(
            target = "publish",
            candidates = buffered.len(),
            "remote answer applied"
        );
        session.applier = Some(spawn_candidate_applier(Arc::clone(&session.peer), buffered));
        self.established = true;
        self.transition(NegotiationState::Established);
    }

    fn stale(&self, what: &'static str) {
        tracing::debug!(target = "publish", completion = what, state = self.state.label(), "stale completion dropped");
    }

    fn fail(&mut self, err: SignalingError) {
        tracing::error!(target = "publish", state = self.state.label(), error = %err, "negotiation failed");
        self.transition(NegotiationState::Failed(err));
        self.teardown();
    }

    fn transition(&mut self, next: NegotiationState) {
        tracing::debug!(
            target = "publish",
            from = self.state.label(),
            to = next.label(),
            "negotiation state transition"
        );
        self.epoch += 1;
        self.state = next.clone();
        self.state_tx.send_replace(next);
        self.arm_deadline();
    }

    fn arm_deadline(&self) {
        let Some(timeout) = self.config.step_timeout else {
            return;
        };
        if self.state.is_terminal() || self.state == NegotiationState::Established {
            return;
        }
        let epoch = self.epoch;
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            dispatcher.post_completion(Completion::Deadline { epoch });
        });
    }

    /// Release the channel and the engine once the session is over.
    fn teardown(&mut self) {
        self.channel.close();
        let peer = match self.session.take() {
            Some(session) => Some(session.peer),
            None => self.peer.take(),
        };
        if let Some(peer) = peer {
            tokio::spawn(async move { peer.close().await });
        }
    }

    fn spawn_completion<F>(&self, future: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let completion = future.await;
            dispatcher.post_completion(completion);
        });
    }
}

/// Applies remote candidates one at a time, in the order they were queued.
fn spawn_candidate_applier<P: PeerConnection>(
    peer: Arc<P>,
    initial: Vec<ConnectivityCandidate>,
) -> mpsc::UnboundedSender<ConnectivityCandidate> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnectivityCandidate>();
    for candidate in initial {
        let _ = tx.send(candidate);
    }
    tokio::spawn(async move {
        while let Some(candidate) = rx.recv().await {
            let text = candidate.candidate.clone();
            if let Err(err) = peer.add_candidate(candidate).await {
                tracing::warn!(target = "publish", candidate = %text, error = %err, "failed to apply remote candidate");
            }
        }
    });
    tx
}
