//! The serialized execution context a negotiation runs on.
//!
//! Channel events, peer-connection callbacks and completions of
//! asynchronous engine calls are all posted into one FIFO queue. Exactly one
//! consumer (the negotiation controller) drains it, so no two inputs are
//! ever handled at the same time and their relative order is preserved.

use tokio::sync::mpsc;

use crate::channel::ChannelEvent;
use crate::controller::Completion;
use crate::peer::PeerEvent;

#[derive(Debug)]
pub(crate) enum SessionInput {
    Channel(ChannelEvent),
    Peer(PeerEvent),
    Completion(Completion),
}

/// Posting handle for the session queue. Cheap to clone; hand one to every
/// event source at construction time.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<SessionInput>,
}

/// Consuming end of the session queue.
#[derive(Debug)]
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<SessionInput>,
}

pub fn dispatch_queue() -> (Dispatcher, DispatchQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Dispatcher { tx }, DispatchQueue { rx })
}

impl Dispatcher {
    /// Returns `false` once the session has been torn down; the event is
    /// dropped in that case.
    pub fn post_channel(&self, event: ChannelEvent) -> bool {
        self.post(SessionInput::Channel(event))
    }

    pub fn post_peer(&self, event: PeerEvent) -> bool {
        self.post(SessionInput::Peer(event))
    }

    pub(crate) fn post_completion(&self, completion: Completion) -> bool {
        self.post(SessionInput::Completion(completion))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn post(&self, input: SessionInput) -> bool {
        match self.tx.send(input) {
            Ok(()) => true,
            Err(mpsc::error::SendError(dropped)) => {
                tracing::trace!(
                    target = "publish",
                    input = ?dropped,
                    "session queue closed; dropping input"
                );
                false
            }
        }
    }
}

impl DispatchQueue {
    pub(crate) async fn next(&mut self) -> Option<SessionInput> {
        self.rx.recv().await
    }

    pub(crate) fn close(&mut self) {
        self.rx.close();
    }
}
