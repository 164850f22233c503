//! Length-prefixed framing for async byte streams.
//!
//! Each frame travels as `[u32 be length][frame bytes]`, the frame bytes
//! being the postcard encoding of [`Frame`]. The framing is generic over the
//! transport - it works with any `AsyncRead`/`AsyncWrite` stream, including
//! `TcpStream` halves after `into_split`.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Frame;

/// Upper bound on a single encoded frame. Anything larger is treated as a
/// decode error rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A length-prefixed framed byte stream.
pub struct LengthPrefixedFramed<S> {
    stream: S,
}

impl<S> LengthPrefixedFramed<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Unwrap back into the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncWrite + Unpin> LengthPrefixedFramed<S> {
    /// Send one frame.
    pub async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let bytes = postcard::to_allocvec(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("postcard: {e}")))?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds MAX_FRAME_LEN", bytes.len()),
            ));
        }
        self.stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }
}

impl<S: AsyncRead + Unpin> LengthPrefixedFramed<S> {
    /// Receive one frame.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF inside a
    /// frame, an oversized length prefix, and decode failures are errors.
    pub async fn recv(&mut self) -> io::Result<Option<Frame>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds MAX_FRAME_LEN"),
            ));
        }

        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;

        let frame = postcard::from_bytes(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("postcard: {e}")))?;
        Ok(Some(frame))
    }

    /// Receive one frame with a deadline.
    ///
    /// Returns `Ok(None)` if nothing arrived within the timeout or the
    /// stream closed cleanly.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .unwrap_or(Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = LengthPrefixedFramed::new(client);
        let mut server = LengthPrefixedFramed::new(server);

        let frame = Frame::new(1, event::CHUNK, b"hello".to_vec());
        client.send(&frame).await.unwrap();
        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn interleaved_frames_keep_order() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = LengthPrefixedFramed::new(client);
        let mut server = LengthPrefixedFramed::new(server);

        for band in 1..=3u64 {
            client.send(&Frame::new(band, event::CHUNK, vec![band as u8])).await.unwrap();
        }
        client.send(&Frame::choke(2)).await.unwrap();

        for band in 1..=3u64 {
            let frame = server.recv().await.unwrap().unwrap();
            assert_eq!(frame.band, band);
        }
        assert!(server.recv().await.unwrap().unwrap().is_choke());
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut server = LengthPrefixedFramed::new(server);
        assert!(server.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        // Announce 8 bytes, deliver 2, then hang up.
        client.write_all(&8u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xaa, 0xbb]).await.unwrap();
        drop(client);

        let mut server = LengthPrefixedFramed::new(server);
        let err = server.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let mut server = LengthPrefixedFramed::new(server);
        let err = server.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn recv_timeout_expires_quietly() {
        let (_client, server) = tokio::io::duplex(64);
        let mut server = LengthPrefixedFramed::new(server);
        let got = server.recv_timeout(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }
}
