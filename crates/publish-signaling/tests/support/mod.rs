#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{sleep, timeout};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use url::Url;

use publish_signaling::{
    ConnectivityCandidate, Dispatcher, PeerConnection, PeerError, PeerEvent, SessionDescription,
};

pub const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\n";

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateOffer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidateStart(String),
    AddCandidateEnd(String),
    LocalDescription,
    Close,
}

/// Engine stand-in. Emits one local candidate after the local description is
/// adopted and records every call in order.
pub struct MockPeer {
    dispatcher: Dispatcher,
    calls: Mutex<Vec<PeerCall>>,
    candidate_delay: Box<dyn Fn(&str) -> Duration + Send + Sync>,
}

impl MockPeer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            calls: Mutex::new(Vec::new()),
            candidate_delay: Box::new(|_| Duration::ZERO),
        }
    }

    /// Make `add_candidate` take a per-candidate amount of time.
    pub fn with_candidate_delay(
        mut self,
        delay: impl Fn(&str) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.candidate_delay = Box::new(delay);
        self
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PeerCall::AddCandidateEnd(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn was_closed(&self) -> bool {
        self.calls().contains(&PeerCall::Close)
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer(OFFER_SDP))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetLocal(description));
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            dispatcher.post_peer(PeerEvent::LocalCandidate(
                ConnectivityCandidate::new("candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host")
                    .with_mid("0", 0),
            ));
        });
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetRemote(description));
        Ok(())
    }

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError> {
        self.record(PeerCall::AddCandidateStart(candidate.candidate.clone()));
        let delay = (self.candidate_delay)(&candidate.candidate);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.record(PeerCall::AddCandidateEnd(candidate.candidate));
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.record(PeerCall::LocalDescription);
        Some(SessionDescription::offer(format!("{OFFER_SDP}a=candidate:1\r\n")))
    }

    async fn close(&self) {
        self.record(PeerCall::Close);
    }
}

pub enum ServerAction {
    Send(String),
    Close,
}

/// Single-connection WebSocket server scripted from the test body.
pub struct SignalingServer {
    pub url: Url,
    received: mpsc::UnboundedReceiver<Value>,
    actions: mpsc::UnboundedSender<ServerAction>,
    disconnected: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
struct ServerState {
    received: mpsc::UnboundedSender<Value>,
    actions: Arc<AsyncMutex<Option<mpsc::UnboundedReceiver<ServerAction>>>>,
    disconnected: mpsc::UnboundedSender<()>,
}

impl SignalingServer {
    pub async fn start() -> Self {
        let (received_tx, received) = mpsc::unbounded_channel();
        let (actions, actions_rx) = mpsc::unbounded_channel();
        let (disconnected_tx, disconnected) = mpsc::unbounded_channel();
        let state = ServerState {
            received: received_tx,
            actions: Arc::new(AsyncMutex::new(Some(actions_rx))),
            disconnected: disconnected_tx,
        };
        let router = Router::new()
            .route("/webrtc-session.json", get(ws_handler))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        Self {
            url: Url::parse(&format!("ws://{addr}/webrtc-session.json")).expect("server url"),
            received,
            actions,
            disconnected,
        }
    }

    pub async fn next_message(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("server receive timed out")
            .expect("server stopped")
    }

    pub fn send(&self, payload: impl Into<String>) {
        let _ = self.actions.send(ServerAction::Send(payload.into()));
    }

    pub fn close(&self) {
        let _ = self.actions.send(ServerAction::Close);
    }

    pub async fn wait_disconnected(&mut self) {
        timeout(Duration::from_secs(5), self.disconnected.recv())
            .await
            .expect("client never disconnected");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let Some(mut actions) = state.actions.lock().await.take() else {
        return;
    };
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = state.received.send(value);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            action = actions.recv() => match action {
                Some(ServerAction::Send(text)) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(ServerAction::Close) | None => {
                    let _ = sender.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
    let _ = state.disconnected.send(());
}
