//! WebSocket signaling channel.
//!
//! A single driver task owns the socket. It posts `Opened`, every inbound
//! payload, errors and exactly one `Closed` onto the session's
//! [`Dispatcher`] in the order they happen on the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use url::Url;

use crate::dispatch::Dispatcher;
use crate::error::{SignalingError, SignalingResult};

/// How long a locally initiated close waits for the peer's close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Message(Bytes),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Outbound half of a signaling channel as seen by the controller.
pub trait ChannelSink: Send + Sync {
    fn send(&self, payload: Bytes) -> SignalingResult<()>;
    /// Idempotent.
    fn close(&self);
}

enum Outbound {
    Frame(Message),
    Close,
}

/// Handle to a WebSocket connection driven in the background.
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl SignalingChannel {
    /// Start connecting to `endpoint`. Returns immediately; `Opened` (or
    /// `Error` followed by `Closed`) is posted once the handshake settles.
    /// Must be called from within a Tokio runtime.
    pub fn open(endpoint: &Url, dispatcher: Dispatcher) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(drive(
            endpoint.to_string(),
            outbound_rx,
            dispatcher,
            Arc::clone(&closed),
        ));
        Self { outbound, closed }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ChannelSink for SignalingChannel {
    fn send(&self, payload: Bytes) -> SignalingResult<()> {
        if self.is_closed() {
            return Err(SignalingError::ChannelClosed);
        }
        let frame = match String::from_utf8(payload.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(err) => Message::Binary(err.into_bytes()),
        };
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| SignalingError::ChannelClosed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(target = "publish", "closing signaling channel");
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

async fn drive(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    dispatcher: Dispatcher,
    closed: Arc<AtomicBool>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            tracing::warn!(target = "publish", url = %url, error = %err, "signaling connect failed");
            closed.store(true, Ordering::SeqCst);
            dispatcher.post_channel(ChannelEvent::Error(format!("connect failed: {err}")));
            dispatcher.post_channel(ChannelEvent::Closed {
                code: None,
                reason: "connect failed".into(),
            });
            return;
        }
    };
    tracing::debug!(target = "publish", url = %url, "signaling websocket connected");

    let (mut write, mut read) = stream.split();
    if closed.load(Ordering::SeqCst) {
        let _ = write.send(Message::Close(None)).await;
        dispatcher.post_channel(ChannelEvent::Closed {
            code: None,
            reason: "closed before open".into(),
        });
        return;
    }
    dispatcher.post_channel(ChannelEvent::Opened);

    let mut close_deadline: Option<Instant> = None;
    let (code, reason) = loop {
        let deadline = close_deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!(target = "publish", event = "ws_in", kind = "text", len = text.len());
                    dispatcher.post_channel(ChannelEvent::Message(Bytes::from(text.into_bytes())));
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::trace!(target = "publish", event = "ws_in", kind = "binary", len = data.len());
                    dispatcher.post_channel(ChannelEvent::Message(Bytes::from(data)));
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "publish", "signaling websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "publish", "signaling websocket error: {err}");
                            dispatcher.post_channel(ChannelEvent::Error(err.to_string()));
                        }
                    }
                    break (None, err.to_string());
                }
                None => break (None, "stream ended".into()),
            },
            request = outbound.recv(), if close_deadline.is_none() => match request {
                Some(Outbound::Frame(message)) => {
                    tracing::trace!(target = "publish", event = "ws_out", len = message.len());
                    if let Err(err) = write.send(message).await {
                        tracing::warn!(target = "publish", error = %err, "signaling send failed");
                        dispatcher.post_channel(ChannelEvent::Error(err.to_string()));
                        break (None, err.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    closed.store(true, Ordering::SeqCst);
                    let _ = write.send(Message::Close(None)).await;
                    close_deadline = Some(Instant::now() + CLOSE_GRACE);
                }
            },
            _ = sleep_until(deadline), if close_deadline.is_some() => {
                break (None, "close handshake timed out".into());
            }
        }
    };

    closed.store(true, Ordering::SeqCst);
    tracing::debug!(target = "publish", code = ?code, reason = %reason, "signaling websocket closed");
    dispatcher.post_channel(ChannelEvent::Closed { code, reason });
}
