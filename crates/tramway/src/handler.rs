//! Session handlers: where demultiplexed frames end up.

use std::sync::Arc;

use tokio::sync::mpsc;
use tramway_wire::Frame;

use crate::errors::Error;

/// Callback object owning one session's inbound stream.
///
/// The connection invokes [`deliver`](Self::deliver) for every frame whose
/// band matches the session, in the order the peer sent them, and
/// [`fail`](Self::fail) at most once if the session is torn down early. A
/// handler sees exactly one terminal event: either a `deliver` of the choke
/// frame or a single `fail`, never both.
///
/// Handlers run outside the connection's locks, so they may call back into
/// the connection (for example to start another session).
pub trait SessionHandler: Send + Sync + 'static {
    fn deliver(&self, frame: Frame);
    fn fail(&self, error: Error);
}

/// What a [`session_queue`] receiver observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Frame(Frame),
    Failed(Error),
}

/// A [`SessionHandler`] that forwards every callback into an unbounded queue.
///
/// The most common way to consume a session: create the pair, hand the
/// handler to [`create_session`](crate::ServiceConnection::create_session)
/// and receive [`SessionEvent`]s on the other end.
pub struct QueueHandler {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Create a queue-backed handler and its receiving end.
pub fn session_queue() -> (Arc<QueueHandler>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(QueueHandler { tx }), rx)
}

impl SessionHandler for QueueHandler {
    fn deliver(&self, frame: Frame) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(SessionEvent::Frame(frame));
    }

    fn fail(&self, error: Error) {
        let _ = self.tx.send(SessionEvent::Failed(error));
    }
}
