//! The I/O channel: one TCP socket, a reader task and a writer task.
//!
//! A channel is owned by exactly one service connection and never shared
//! between connections. The reader task decodes inbound frames and feeds
//! them to the connection's dispatch loop; the writer task drains a queue of
//! outbound frames. Each side reports at most one transport error and then
//! exits - after that the channel is dead and must be replaced.

use std::io;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;
use tramway_wire::{Frame, LengthPrefixedFramed};

use crate::errors::Error;

/// Depth of the outbound frame queue shared by all sessions on a channel.
const WRITE_QUEUE_DEPTH: usize = 1024;

/// Events surfaced by a channel's reader and writer tasks.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Frame(Frame),
    /// First transport error observed by one side. The channel is dead once
    /// any of these arrives.
    Error(Error),
}

/// Clonable handle to a channel's writer task.
///
/// Handed out by `create_session` so sessions can push request frames. Sends
/// fail with [`Error::NotConnected`] once the writer is gone.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    pub async fn send(&self, frame: Frame) -> Result<(), Error> {
        self.tx.send(frame).await.map_err(|_| Error::NotConnected)
    }
}

/// One attached socket with its reader/writer task pair.
pub(crate) struct Channel {
    writer: FrameSender,
    reader_task: JoinHandle<()>,
}

impl Channel {
    /// Install the socket and arm both tasks.
    ///
    /// Events flow into `events`; the receiver side belongs to the owning
    /// connection's dispatch loop.
    pub(crate) fn attach(stream: TcpStream, events: mpsc::Sender<ChannelEvent>) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);

        let reader_events = events.clone();
        let reader_task = tokio::spawn(async move {
            let mut framed = LengthPrefixedFramed::new(read_half);
            loop {
                let event = match framed.recv().await {
                    Ok(Some(frame)) => ChannelEvent::Frame(frame),
                    Ok(None) => {
                        // Peer hung up; EOF is a transport error like any other.
                        ChannelEvent::Error(Error::Transport(io::ErrorKind::UnexpectedEof))
                    }
                    Err(err) => ChannelEvent::Error(Error::transport(&err)),
                };
                let done = matches!(event, ChannelEvent::Error(_));
                if reader_events.send(event).await.is_err() || done {
                    break;
                }
            }
            trace!("channel reader exiting");
        });

        tokio::spawn(async move {
            let mut framed = LengthPrefixedFramed::new(write_half);
            while let Some(frame) = frame_rx.recv().await {
                if let Err(err) = framed.send(&frame).await {
                    let _ = events.send(ChannelEvent::Error(Error::transport(&err))).await;
                    break;
                }
            }
            trace!("channel writer exiting");
        });

        Self {
            writer: FrameSender { tx: frame_tx },
            reader_task,
        }
    }

    pub(crate) fn writer(&self) -> FrameSender {
        self.writer.clone()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // The reader would otherwise sit on the socket forever. The writer is
        // left alone: it owns the write half and drains outstanding frames,
        // exiting once the last FrameSender clone is gone. In-flight users of
        // a retired channel therefore never observe a freed socket.
        self.reader_task.abort();
    }
}
